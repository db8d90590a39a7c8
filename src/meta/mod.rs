//! Metadata model: dimension orders, per-series core metadata, and the
//! OME-XML metadata store interface.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{OmeTiffResult, UsageError};
use crate::pixel::PixelType;

pub mod xml;

/// The permutation of `ZCT` that governs plane indexing; X and Y are always
/// innermost.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub enum DimensionOrder {
    XYZCT,
    XYZTC,
    XYCTZ,
    XYCZT,
    XYTCZ,
    XYTZC,
}

impl DimensionOrder {
    pub const VALUES: [DimensionOrder; 6] = [
        DimensionOrder::XYZCT,
        DimensionOrder::XYZTC,
        DimensionOrder::XYCTZ,
        DimensionOrder::XYCZT,
        DimensionOrder::XYTCZ,
        DimensionOrder::XYTZC,
    ];

    /// The last three letters, fastest-varying first.
    pub fn zct_letters(&self) -> [char; 3] {
        match *self {
            DimensionOrder::XYZCT => ['Z', 'C', 'T'],
            DimensionOrder::XYZTC => ['Z', 'T', 'C'],
            DimensionOrder::XYCTZ => ['C', 'T', 'Z'],
            DimensionOrder::XYCZT => ['C', 'Z', 'T'],
            DimensionOrder::XYTCZ => ['T', 'C', 'Z'],
            DimensionOrder::XYTZC => ['T', 'Z', 'C'],
        }
    }
}

impl fmt::Display for DimensionOrder {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            DimensionOrder::XYZCT => "XYZCT",
            DimensionOrder::XYZTC => "XYZTC",
            DimensionOrder::XYCTZ => "XYCTZ",
            DimensionOrder::XYCZT => "XYCZT",
            DimensionOrder::XYTCZ => "XYTCZ",
            DimensionOrder::XYTZC => "XYTZC",
        };
        fmt.write_str(name)
    }
}

impl FromStr for DimensionOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "XYZCT" => Ok(DimensionOrder::XYZCT),
            "XYZTC" => Ok(DimensionOrder::XYZTC),
            "XYCTZ" => Ok(DimensionOrder::XYCTZ),
            "XYCZT" => Ok(DimensionOrder::XYCZT),
            "XYTCZ" => Ok(DimensionOrder::XYTCZ),
            "XYTZC" => Ok(DimensionOrder::XYTZC),
            other => Err(format!("unknown dimension order `{}`", other)),
        }
    }
}

/// Linear plane index of `(z, c, t)` under the given dimension order.
///
/// `count` is the total plane count `size_z·eff_c·size_t`; the coordinates
/// and the resulting index are range-checked.
pub fn plane_index(
    order: DimensionOrder,
    size_z: usize,
    eff_c: usize,
    size_t: usize,
    count: usize,
    z: usize,
    c: usize,
    t: usize,
) -> OmeTiffResult<usize> {
    if z >= size_z.max(1) || c >= eff_c.max(1) || t >= size_t.max(1) {
        return Err(UsageError::CoordsOutOfRange { z, c, t }.into());
    }
    let index = match order {
        DimensionOrder::XYZCT => z + size_z * (c + eff_c * t),
        DimensionOrder::XYZTC => z + size_z * (t + size_t * c),
        DimensionOrder::XYCZT => c + eff_c * (z + size_z * t),
        DimensionOrder::XYCTZ => c + eff_c * (t + size_t * z),
        DimensionOrder::XYTCZ => t + size_t * (c + eff_c * z),
        DimensionOrder::XYTZC => t + size_t * (z + size_z * c),
    };
    if index >= count {
        return Err(UsageError::IndexOutOfRange { index, count }.into());
    }
    Ok(index)
}

/// Inverse of [`plane_index`]: the `(z, c, t)` coordinates of a plane.
pub fn zct_coords(
    order: DimensionOrder,
    size_z: usize,
    eff_c: usize,
    size_t: usize,
    count: usize,
    index: usize,
) -> OmeTiffResult<[usize; 3]> {
    if index >= count {
        return Err(UsageError::IndexOutOfRange { index, count }.into());
    }
    let size_z = size_z.max(1);
    let eff_c = eff_c.max(1);
    let size_t = size_t.max(1);
    let coords = match order {
        DimensionOrder::XYZCT => [index % size_z, (index / size_z) % eff_c, index / (size_z * eff_c)],
        DimensionOrder::XYZTC => [index % size_z, index / (size_z * size_t), (index / size_z) % size_t],
        DimensionOrder::XYCZT => [(index / eff_c) % size_z, index % eff_c, index / (eff_c * size_z)],
        DimensionOrder::XYCTZ => [index / (eff_c * size_t), index % eff_c, (index / eff_c) % size_t],
        DimensionOrder::XYTCZ => [index / (size_t * eff_c), (index / size_t) % eff_c, index % size_t],
        DimensionOrder::XYTZC => [(index / size_t) % size_z, index / (size_t * size_z), index % size_t],
    };
    Ok(coords)
}

/// A Modulo sub-dimension: a linear subdivision of Z, T or C.
#[derive(Debug, Clone, PartialEq)]
pub struct Modulo {
    pub start: f64,
    pub end: f64,
    pub step: f64,
    /// The dimension being subdivided, `Z`, `T` or `C`.
    pub parent: char,
}

impl Modulo {
    pub fn new(parent: char) -> Modulo {
        Modulo {
            start: 0.0,
            end: 0.0,
            step: 1.0,
            parent,
        }
    }

    /// Number of sub-dimension steps.
    pub fn size(&self) -> usize {
        if self.step <= 0.0 {
            return 1;
        }
        (((self.end - self.start) / self.step).floor() as isize + 1).max(1) as usize
    }
}

/// One pyramid tier of one series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub size_x: u32,
    pub size_y: u32,
    pub size_z: u32,
}

/// Core metadata of one `(series, resolution)` pair.
#[derive(Debug, Clone)]
pub struct CoreMetadata {
    pub size_x: u32,
    pub size_y: u32,
    pub size_z: u32,
    pub size_t: u32,
    /// Per-channel sample counts; the length is the effective channel count.
    pub size_c: Vec<u32>,
    pub pixel_type: PixelType,
    pub bits_per_pixel: u32,
    pub image_count: usize,
    pub dimension_order: DimensionOrder,
    pub order_certain: bool,
    pub little_endian: bool,
    pub interleaved: bool,
    pub indexed: bool,
    pub false_color: bool,
    pub metadata_complete: bool,
    pub thumbnail: bool,
    pub modulo_z: Modulo,
    pub modulo_t: Modulo,
    pub modulo_c: Modulo,
}

impl Default for CoreMetadata {
    fn default() -> CoreMetadata {
        CoreMetadata {
            size_x: 0,
            size_y: 0,
            size_z: 1,
            size_t: 1,
            size_c: Vec::new(),
            pixel_type: PixelType::UInt8,
            bits_per_pixel: 8,
            image_count: 0,
            dimension_order: DimensionOrder::XYZCT,
            order_certain: true,
            little_endian: cfg!(target_endian = "little"),
            interleaved: false,
            indexed: false,
            false_color: false,
            metadata_complete: false,
            thumbnail: false,
            modulo_z: Modulo::new('Z'),
            modulo_t: Modulo::new('T'),
            modulo_c: Modulo::new('C'),
        }
    }
}

impl CoreMetadata {
    /// Number of logical channels.
    pub fn effective_size_c(&self) -> usize {
        self.size_c.len()
    }

    /// Total sample count across channels.
    pub fn total_samples(&self) -> u32 {
        self.size_c.iter().sum()
    }

    /// `Z·T·effectiveSizeC`.
    pub fn computed_image_count(&self) -> usize {
        self.size_z as usize * self.size_t as usize * self.effective_size_c().max(1)
    }
}

fn unset(attr: &'static str) -> crate::error::OmeTiffError {
    UsageError::MetadataMissing(attr).into()
}

/// The read half of the metadata store: the narrow OME-XML surface this
/// codec consumes.
///
/// Accessors fail with `MetadataMissing` when the value is unset.
pub trait MetadataRetrieve {
    fn image_count(&self) -> usize;

    fn image_name(&self, image: usize) -> OmeTiffResult<String>;
    fn image_acquisition_date(&self, image: usize) -> OmeTiffResult<String>;

    fn pixels_size_x(&self, image: usize) -> OmeTiffResult<u32>;
    fn pixels_size_y(&self, image: usize) -> OmeTiffResult<u32>;
    fn pixels_size_z(&self, image: usize) -> OmeTiffResult<u32>;
    fn pixels_size_c(&self, image: usize) -> OmeTiffResult<u32>;
    fn pixels_size_t(&self, image: usize) -> OmeTiffResult<u32>;
    fn pixels_type(&self, image: usize) -> OmeTiffResult<PixelType>;
    fn pixels_significant_bits(&self, image: usize) -> OmeTiffResult<u32>;
    fn pixels_dimension_order(&self, image: usize) -> OmeTiffResult<DimensionOrder>;
    fn pixels_big_endian(&self, image: usize) -> OmeTiffResult<bool>;
    fn pixels_interleaved(&self, image: usize) -> OmeTiffResult<bool>;

    fn channel_count(&self, image: usize) -> usize;
    fn channel_samples_per_pixel(&self, image: usize, channel: usize) -> OmeTiffResult<u32>;
    fn channel_name(&self, image: usize, channel: usize) -> OmeTiffResult<String>;

    fn tiff_data_count(&self, image: usize) -> usize;
    fn tiff_data_ifd(&self, image: usize, tiff_data: usize) -> OmeTiffResult<u64>;
    fn tiff_data_plane_count(&self, image: usize, tiff_data: usize) -> OmeTiffResult<u64>;
    fn tiff_data_first_z(&self, image: usize, tiff_data: usize) -> OmeTiffResult<u32>;
    fn tiff_data_first_c(&self, image: usize, tiff_data: usize) -> OmeTiffResult<u32>;
    fn tiff_data_first_t(&self, image: usize, tiff_data: usize) -> OmeTiffResult<u32>;
    fn uuid_file_name(&self, image: usize, tiff_data: usize) -> OmeTiffResult<String>;
    fn uuid_value(&self, image: usize, tiff_data: usize) -> OmeTiffResult<String>;

    fn plane_count(&self, image: usize) -> usize;
    fn plane_the_z(&self, image: usize, plane: usize) -> OmeTiffResult<u32>;
    fn plane_the_c(&self, image: usize, plane: usize) -> OmeTiffResult<u32>;
    fn plane_the_t(&self, image: usize, plane: usize) -> OmeTiffResult<u32>;

    /// Document-level UUID.
    fn uuid(&self) -> OmeTiffResult<String>;
    fn binary_only_metadata_file(&self) -> OmeTiffResult<String>;

    fn modulo_along_z(&self, image: usize) -> OmeTiffResult<Modulo>;
    fn modulo_along_t(&self, image: usize) -> OmeTiffResult<Modulo>;
    fn modulo_along_c(&self, image: usize) -> OmeTiffResult<Modulo>;

    /// Pyramid tiers recorded for a series by the resolution annotation,
    /// full resolution excluded.
    fn resolutions(&self, image: usize) -> OmeTiffResult<Vec<Resolution>>;
}

/// The write half of the metadata store; the mirror image of
/// [`MetadataRetrieve`].
pub trait MetadataStore {
    fn set_image_name(&mut self, name: &str, image: usize);
    fn set_image_acquisition_date(&mut self, date: &str, image: usize);

    fn set_pixels_size_x(&mut self, value: u32, image: usize);
    fn set_pixels_size_y(&mut self, value: u32, image: usize);
    fn set_pixels_size_z(&mut self, value: u32, image: usize);
    fn set_pixels_size_c(&mut self, value: u32, image: usize);
    fn set_pixels_size_t(&mut self, value: u32, image: usize);
    fn set_pixels_type(&mut self, value: PixelType, image: usize);
    fn set_pixels_significant_bits(&mut self, value: u32, image: usize);
    fn set_pixels_dimension_order(&mut self, value: DimensionOrder, image: usize);
    fn set_pixels_big_endian(&mut self, value: bool, image: usize);
    fn set_pixels_interleaved(&mut self, value: bool, image: usize);

    fn set_channel_samples_per_pixel(&mut self, value: u32, image: usize, channel: usize);
    fn set_channel_name(&mut self, name: &str, image: usize, channel: usize);

    fn set_tiff_data_ifd(&mut self, value: u64, image: usize, tiff_data: usize);
    fn set_tiff_data_plane_count(&mut self, value: u64, image: usize, tiff_data: usize);
    fn set_tiff_data_first_z(&mut self, value: u32, image: usize, tiff_data: usize);
    fn set_tiff_data_first_c(&mut self, value: u32, image: usize, tiff_data: usize);
    fn set_tiff_data_first_t(&mut self, value: u32, image: usize, tiff_data: usize);
    fn set_uuid_file_name(&mut self, value: &str, image: usize, tiff_data: usize);
    fn set_uuid_value(&mut self, value: &str, image: usize, tiff_data: usize);

    fn set_plane_the_z(&mut self, value: u32, image: usize, plane: usize);
    fn set_plane_the_c(&mut self, value: u32, image: usize, plane: usize);
    fn set_plane_the_t(&mut self, value: u32, image: usize, plane: usize);

    fn set_uuid(&mut self, uuid: &str);

    fn set_resolutions(&mut self, resolutions: &[Resolution], image: usize);
}

/// Reference to a standalone metadata document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryOnly {
    pub metadata_file: String,
    pub uuid: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ChannelMeta {
    pub id: Option<String>,
    pub name: Option<String>,
    pub samples_per_pixel: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct TiffDataMeta {
    pub ifd: Option<u64>,
    pub plane_count: Option<u64>,
    pub first_z: Option<u32>,
    pub first_c: Option<u32>,
    pub first_t: Option<u32>,
    pub uuid_file_name: Option<String>,
    pub uuid_value: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PlaneMeta {
    pub the_z: Option<u32>,
    pub the_c: Option<u32>,
    pub the_t: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct PixelsMeta {
    pub id: Option<String>,
    pub dimension_order: Option<DimensionOrder>,
    pub pixel_type: Option<PixelType>,
    pub significant_bits: Option<u32>,
    pub big_endian: Option<bool>,
    pub interleaved: Option<bool>,
    pub size_x: Option<u32>,
    pub size_y: Option<u32>,
    pub size_z: Option<u32>,
    pub size_c: Option<u32>,
    pub size_t: Option<u32>,
    pub channels: Vec<ChannelMeta>,
    pub tiff_data: Vec<TiffDataMeta>,
    pub planes: Vec<PlaneMeta>,
    /// `BinData` elements are not modelled, only counted so the reader can
    /// warn about them and the writer can drop them.
    pub bin_data_count: usize,
    pub modulo_z: Option<Modulo>,
    pub modulo_t: Option<Modulo>,
    pub modulo_c: Option<Modulo>,
}

#[derive(Debug, Clone, Default)]
pub struct ImageMeta {
    pub id: Option<String>,
    pub name: Option<String>,
    pub acquisition_date: Option<String>,
    pub pixels: PixelsMeta,
}

/// In-memory OME-XML metadata store implementing both halves of the store
/// interface.
#[derive(Debug, Clone, Default)]
pub struct OmeXmlMetadata {
    pub(crate) uuid: Option<String>,
    pub(crate) binary_only: Option<BinaryOnly>,
    pub(crate) images: Vec<ImageMeta>,
    pub(crate) resolutions: BTreeMap<usize, Vec<Resolution>>,
}

impl OmeXmlMetadata {
    pub fn new() -> OmeXmlMetadata {
        OmeXmlMetadata::default()
    }

    /// Snapshot another retrieve implementation into a mutable store.
    pub fn from_retrieve(retrieve: &dyn MetadataRetrieve) -> OmeXmlMetadata {
        let mut meta = OmeXmlMetadata::new();
        for image in 0..retrieve.image_count() {
            meta.ensure_image(image);
            if let Ok(name) = retrieve.image_name(image) {
                meta.set_image_name(&name, image);
            }
            if let Ok(date) = retrieve.image_acquisition_date(image) {
                meta.set_image_acquisition_date(&date, image);
            }
            if let Ok(v) = retrieve.pixels_size_x(image) {
                meta.set_pixels_size_x(v, image);
            }
            if let Ok(v) = retrieve.pixels_size_y(image) {
                meta.set_pixels_size_y(v, image);
            }
            if let Ok(v) = retrieve.pixels_size_z(image) {
                meta.set_pixels_size_z(v, image);
            }
            if let Ok(v) = retrieve.pixels_size_c(image) {
                meta.set_pixels_size_c(v, image);
            }
            if let Ok(v) = retrieve.pixels_size_t(image) {
                meta.set_pixels_size_t(v, image);
            }
            if let Ok(v) = retrieve.pixels_type(image) {
                meta.set_pixels_type(v, image);
            }
            if let Ok(v) = retrieve.pixels_significant_bits(image) {
                meta.set_pixels_significant_bits(v, image);
            }
            if let Ok(v) = retrieve.pixels_dimension_order(image) {
                meta.set_pixels_dimension_order(v, image);
            }
            if let Ok(v) = retrieve.pixels_big_endian(image) {
                meta.set_pixels_big_endian(v, image);
            }
            if let Ok(v) = retrieve.pixels_interleaved(image) {
                meta.set_pixels_interleaved(v, image);
            }
            for channel in 0..retrieve.channel_count(image) {
                if let Ok(v) = retrieve.channel_samples_per_pixel(image, channel) {
                    meta.set_channel_samples_per_pixel(v, image, channel);
                } else {
                    meta.ensure_channel(image, channel);
                }
                if let Ok(name) = retrieve.channel_name(image, channel) {
                    meta.set_channel_name(&name, image, channel);
                }
            }
            for td in 0..retrieve.tiff_data_count(image) {
                meta.ensure_tiff_data(image, td);
                if let Ok(v) = retrieve.tiff_data_ifd(image, td) {
                    meta.set_tiff_data_ifd(v, image, td);
                }
                if let Ok(v) = retrieve.tiff_data_plane_count(image, td) {
                    meta.set_tiff_data_plane_count(v, image, td);
                }
                if let Ok(v) = retrieve.tiff_data_first_z(image, td) {
                    meta.set_tiff_data_first_z(v, image, td);
                }
                if let Ok(v) = retrieve.tiff_data_first_c(image, td) {
                    meta.set_tiff_data_first_c(v, image, td);
                }
                if let Ok(v) = retrieve.tiff_data_first_t(image, td) {
                    meta.set_tiff_data_first_t(v, image, td);
                }
                if let Ok(v) = retrieve.uuid_file_name(image, td) {
                    meta.set_uuid_file_name(&v, image, td);
                }
                if let Ok(v) = retrieve.uuid_value(image, td) {
                    meta.set_uuid_value(&v, image, td);
                }
            }
            for plane in 0..retrieve.plane_count(image) {
                meta.ensure_plane(image, plane);
                if let Ok(v) = retrieve.plane_the_z(image, plane) {
                    meta.set_plane_the_z(v, image, plane);
                }
                if let Ok(v) = retrieve.plane_the_c(image, plane) {
                    meta.set_plane_the_c(v, image, plane);
                }
                if let Ok(v) = retrieve.plane_the_t(image, plane) {
                    meta.set_plane_the_t(v, image, plane);
                }
            }
            if let Ok(modulo) = retrieve.modulo_along_z(image) {
                meta.image_mut(image).pixels.modulo_z = Some(modulo);
            }
            if let Ok(modulo) = retrieve.modulo_along_t(image) {
                meta.image_mut(image).pixels.modulo_t = Some(modulo);
            }
            if let Ok(modulo) = retrieve.modulo_along_c(image) {
                meta.image_mut(image).pixels.modulo_c = Some(modulo);
            }
            if let Ok(resolutions) = retrieve.resolutions(image) {
                if !resolutions.is_empty() {
                    meta.set_resolutions(&resolutions, image);
                }
            }
        }
        if let Ok(uuid) = retrieve.uuid() {
            meta.set_uuid(&uuid);
        }
        meta
    }

    pub fn images(&self) -> &[ImageMeta] {
        &self.images
    }

    pub(crate) fn ensure_image(&mut self, image: usize) {
        while self.images.len() <= image {
            let index = self.images.len();
            self.images.push(ImageMeta {
                id: Some(format!("Image:{}", index)),
                ..ImageMeta::default()
            });
        }
    }

    pub(crate) fn image_mut(&mut self, image: usize) -> &mut ImageMeta {
        self.ensure_image(image);
        &mut self.images[image]
    }

    pub(crate) fn ensure_channel(&mut self, image: usize, channel: usize) {
        let index = image;
        let pixels = &mut self.image_mut(image).pixels;
        while pixels.channels.len() <= channel {
            let c = pixels.channels.len();
            pixels.channels.push(ChannelMeta {
                id: Some(format!("Channel:{}:{}", index, c)),
                ..ChannelMeta::default()
            });
        }
    }

    pub(crate) fn ensure_tiff_data(&mut self, image: usize, tiff_data: usize) {
        let pixels = &mut self.image_mut(image).pixels;
        while pixels.tiff_data.len() <= tiff_data {
            pixels.tiff_data.push(TiffDataMeta::default());
        }
    }

    pub(crate) fn ensure_plane(&mut self, image: usize, plane: usize) {
        let pixels = &mut self.image_mut(image).pixels;
        while pixels.planes.len() <= plane {
            pixels.planes.push(PlaneMeta::default());
        }
    }

    fn image(&self, image: usize) -> OmeTiffResult<&ImageMeta> {
        self.images.get(image).ok_or_else(|| unset("Image"))
    }

    /// Remove every `TiffData` element; the writer regenerates them at
    /// close.
    pub fn remove_tiff_data(&mut self) {
        for image in &mut self.images {
            image.pixels.tiff_data.clear();
        }
    }

    /// Remove every `BinData` element.
    pub fn remove_bin_data(&mut self) {
        for image in &mut self.images {
            image.pixels.bin_data_count = 0;
        }
    }

    /// Drop channels beyond the declared `SizeC` of each image.
    pub fn remove_excess_channels(&mut self) {
        for image in &mut self.images {
            if let Some(size_c) = image.pixels.size_c {
                if image.pixels.channels.len() > size_c as usize {
                    image.pixels.channels.truncate(size_c as usize);
                }
            }
        }
    }

    /// Remove the resolution annotations, returning the recorded tier
    /// lists keyed by series.
    pub fn take_resolutions(&mut self) -> BTreeMap<usize, Vec<Resolution>> {
        std::mem::take(&mut self.resolutions)
    }

    /// Remove one image, shifting later series (and their resolution
    /// annotations) down.
    pub fn remove_image(&mut self, image: usize) {
        if image >= self.images.len() {
            return;
        }
        self.images.remove(image);
        let resolutions = std::mem::take(&mut self.resolutions);
        for (series, tiers) in resolutions {
            match series.cmp(&image) {
                std::cmp::Ordering::Less => {
                    self.resolutions.insert(series, tiers);
                }
                std::cmp::Ordering::Equal => {}
                std::cmp::Ordering::Greater => {
                    self.resolutions.insert(series - 1, tiers);
                }
            }
        }
    }

    pub fn set_binary_only(&mut self, metadata_file: &str, uuid: Option<&str>) {
        self.binary_only = Some(BinaryOnly {
            metadata_file: metadata_file.to_string(),
            uuid: uuid.map(str::to_string),
        });
    }

    /// Check (and with `repair`, fix) SizeC/channel/samples consistency.
    ///
    /// Returns whether the model is consistent on exit.
    pub fn validate_model(&mut self, repair: bool) -> bool {
        let mut valid = true;
        for image in 0..self.images.len() {
            let pixels = &self.images[image].pixels;
            let size_c = match pixels.size_c {
                Some(v) if v > 0 => v,
                _ => {
                    valid = false;
                    continue;
                }
            };
            let channel_count = pixels.channels.len();
            let samples: u32 = pixels
                .channels
                .iter()
                .map(|c| c.samples_per_pixel.unwrap_or(1))
                .sum();

            let consistent = channel_count > 0 && samples == size_c;
            if consistent {
                continue;
            }
            valid = false;

            if repair {
                let pixels = &mut self.images[image].pixels;
                if channel_count > 0 && size_c % channel_count as u32 == 0 {
                    // Distribute samples evenly over the declared channels.
                    let per_channel = size_c / channel_count as u32;
                    for channel in &mut pixels.channels {
                        channel.samples_per_pixel = Some(per_channel);
                    }
                } else {
                    pixels.channels.clear();
                    for c in 0..size_c {
                        pixels.channels.push(ChannelMeta {
                            id: Some(format!("Channel:{}:{}", image, c)),
                            samples_per_pixel: Some(1),
                            ..ChannelMeta::default()
                        });
                    }
                }
            }
        }
        valid
    }
}

impl MetadataRetrieve for OmeXmlMetadata {
    fn image_count(&self) -> usize {
        self.images.len()
    }

    fn image_name(&self, image: usize) -> OmeTiffResult<String> {
        self.image(image)?
            .name
            .clone()
            .ok_or_else(|| unset("Image.Name"))
    }

    fn image_acquisition_date(&self, image: usize) -> OmeTiffResult<String> {
        self.image(image)?
            .acquisition_date
            .clone()
            .ok_or_else(|| unset("Image.AcquisitionDate"))
    }

    fn pixels_size_x(&self, image: usize) -> OmeTiffResult<u32> {
        self.image(image)?
            .pixels
            .size_x
            .ok_or_else(|| unset("Pixels.SizeX"))
    }

    fn pixels_size_y(&self, image: usize) -> OmeTiffResult<u32> {
        self.image(image)?
            .pixels
            .size_y
            .ok_or_else(|| unset("Pixels.SizeY"))
    }

    fn pixels_size_z(&self, image: usize) -> OmeTiffResult<u32> {
        self.image(image)?
            .pixels
            .size_z
            .ok_or_else(|| unset("Pixels.SizeZ"))
    }

    fn pixels_size_c(&self, image: usize) -> OmeTiffResult<u32> {
        self.image(image)?
            .pixels
            .size_c
            .ok_or_else(|| unset("Pixels.SizeC"))
    }

    fn pixels_size_t(&self, image: usize) -> OmeTiffResult<u32> {
        self.image(image)?
            .pixels
            .size_t
            .ok_or_else(|| unset("Pixels.SizeT"))
    }

    fn pixels_type(&self, image: usize) -> OmeTiffResult<PixelType> {
        self.image(image)?
            .pixels
            .pixel_type
            .ok_or_else(|| unset("Pixels.Type"))
    }

    fn pixels_significant_bits(&self, image: usize) -> OmeTiffResult<u32> {
        self.image(image)?
            .pixels
            .significant_bits
            .ok_or_else(|| unset("Pixels.SignificantBits"))
    }

    fn pixels_dimension_order(&self, image: usize) -> OmeTiffResult<DimensionOrder> {
        self.image(image)?
            .pixels
            .dimension_order
            .ok_or_else(|| unset("Pixels.DimensionOrder"))
    }

    fn pixels_big_endian(&self, image: usize) -> OmeTiffResult<bool> {
        self.image(image)?
            .pixels
            .big_endian
            .ok_or_else(|| unset("Pixels.BigEndian"))
    }

    fn pixels_interleaved(&self, image: usize) -> OmeTiffResult<bool> {
        self.image(image)?
            .pixels
            .interleaved
            .ok_or_else(|| unset("Pixels.Interleaved"))
    }

    fn channel_count(&self, image: usize) -> usize {
        self.images
            .get(image)
            .map_or(0, |i| i.pixels.channels.len())
    }

    fn channel_samples_per_pixel(&self, image: usize, channel: usize) -> OmeTiffResult<u32> {
        self.image(image)?
            .pixels
            .channels
            .get(channel)
            .and_then(|c| c.samples_per_pixel)
            .ok_or_else(|| unset("Channel.SamplesPerPixel"))
    }

    fn channel_name(&self, image: usize, channel: usize) -> OmeTiffResult<String> {
        self.image(image)?
            .pixels
            .channels
            .get(channel)
            .and_then(|c| c.name.clone())
            .ok_or_else(|| unset("Channel.Name"))
    }

    fn tiff_data_count(&self, image: usize) -> usize {
        self.images
            .get(image)
            .map_or(0, |i| i.pixels.tiff_data.len())
    }

    fn tiff_data_ifd(&self, image: usize, tiff_data: usize) -> OmeTiffResult<u64> {
        self.image(image)?
            .pixels
            .tiff_data
            .get(tiff_data)
            .and_then(|td| td.ifd)
            .ok_or_else(|| unset("TiffData.IFD"))
    }

    fn tiff_data_plane_count(&self, image: usize, tiff_data: usize) -> OmeTiffResult<u64> {
        self.image(image)?
            .pixels
            .tiff_data
            .get(tiff_data)
            .and_then(|td| td.plane_count)
            .ok_or_else(|| unset("TiffData.PlaneCount"))
    }

    fn tiff_data_first_z(&self, image: usize, tiff_data: usize) -> OmeTiffResult<u32> {
        self.image(image)?
            .pixels
            .tiff_data
            .get(tiff_data)
            .and_then(|td| td.first_z)
            .ok_or_else(|| unset("TiffData.FirstZ"))
    }

    fn tiff_data_first_c(&self, image: usize, tiff_data: usize) -> OmeTiffResult<u32> {
        self.image(image)?
            .pixels
            .tiff_data
            .get(tiff_data)
            .and_then(|td| td.first_c)
            .ok_or_else(|| unset("TiffData.FirstC"))
    }

    fn tiff_data_first_t(&self, image: usize, tiff_data: usize) -> OmeTiffResult<u32> {
        self.image(image)?
            .pixels
            .tiff_data
            .get(tiff_data)
            .and_then(|td| td.first_t)
            .ok_or_else(|| unset("TiffData.FirstT"))
    }

    fn uuid_file_name(&self, image: usize, tiff_data: usize) -> OmeTiffResult<String> {
        self.image(image)?
            .pixels
            .tiff_data
            .get(tiff_data)
            .and_then(|td| td.uuid_file_name.clone())
            .ok_or_else(|| unset("UUID.FileName"))
    }

    fn uuid_value(&self, image: usize, tiff_data: usize) -> OmeTiffResult<String> {
        self.image(image)?
            .pixels
            .tiff_data
            .get(tiff_data)
            .and_then(|td| td.uuid_value.clone())
            .ok_or_else(|| unset("UUID.Value"))
    }

    fn plane_count(&self, image: usize) -> usize {
        self.images.get(image).map_or(0, |i| i.pixels.planes.len())
    }

    fn plane_the_z(&self, image: usize, plane: usize) -> OmeTiffResult<u32> {
        self.image(image)?
            .pixels
            .planes
            .get(plane)
            .and_then(|p| p.the_z)
            .ok_or_else(|| unset("Plane.TheZ"))
    }

    fn plane_the_c(&self, image: usize, plane: usize) -> OmeTiffResult<u32> {
        self.image(image)?
            .pixels
            .planes
            .get(plane)
            .and_then(|p| p.the_c)
            .ok_or_else(|| unset("Plane.TheC"))
    }

    fn plane_the_t(&self, image: usize, plane: usize) -> OmeTiffResult<u32> {
        self.image(image)?
            .pixels
            .planes
            .get(plane)
            .and_then(|p| p.the_t)
            .ok_or_else(|| unset("Plane.TheT"))
    }

    fn uuid(&self) -> OmeTiffResult<String> {
        self.uuid.clone().ok_or_else(|| unset("OME.UUID"))
    }

    fn binary_only_metadata_file(&self) -> OmeTiffResult<String> {
        self.binary_only
            .as_ref()
            .map(|b| b.metadata_file.clone())
            .ok_or_else(|| unset("BinaryOnly.MetadataFile"))
    }

    fn modulo_along_z(&self, image: usize) -> OmeTiffResult<Modulo> {
        self.image(image)?
            .pixels
            .modulo_z
            .clone()
            .ok_or_else(|| unset("ModuloAlongZ"))
    }

    fn modulo_along_t(&self, image: usize) -> OmeTiffResult<Modulo> {
        self.image(image)?
            .pixels
            .modulo_t
            .clone()
            .ok_or_else(|| unset("ModuloAlongT"))
    }

    fn modulo_along_c(&self, image: usize) -> OmeTiffResult<Modulo> {
        self.image(image)?
            .pixels
            .modulo_c
            .clone()
            .ok_or_else(|| unset("ModuloAlongC"))
    }

    fn resolutions(&self, image: usize) -> OmeTiffResult<Vec<Resolution>> {
        Ok(self.resolutions.get(&image).cloned().unwrap_or_default())
    }
}

impl MetadataStore for OmeXmlMetadata {
    fn set_image_name(&mut self, name: &str, image: usize) {
        self.image_mut(image).name = Some(name.to_string());
    }

    fn set_image_acquisition_date(&mut self, date: &str, image: usize) {
        self.image_mut(image).acquisition_date = Some(date.to_string());
    }

    fn set_pixels_size_x(&mut self, value: u32, image: usize) {
        self.image_mut(image).pixels.size_x = Some(value);
    }

    fn set_pixels_size_y(&mut self, value: u32, image: usize) {
        self.image_mut(image).pixels.size_y = Some(value);
    }

    fn set_pixels_size_z(&mut self, value: u32, image: usize) {
        self.image_mut(image).pixels.size_z = Some(value);
    }

    fn set_pixels_size_c(&mut self, value: u32, image: usize) {
        self.image_mut(image).pixels.size_c = Some(value);
    }

    fn set_pixels_size_t(&mut self, value: u32, image: usize) {
        self.image_mut(image).pixels.size_t = Some(value);
    }

    fn set_pixels_type(&mut self, value: PixelType, image: usize) {
        self.image_mut(image).pixels.pixel_type = Some(value);
    }

    fn set_pixels_significant_bits(&mut self, value: u32, image: usize) {
        self.image_mut(image).pixels.significant_bits = Some(value);
    }

    fn set_pixels_dimension_order(&mut self, value: DimensionOrder, image: usize) {
        self.image_mut(image).pixels.dimension_order = Some(value);
    }

    fn set_pixels_big_endian(&mut self, value: bool, image: usize) {
        self.image_mut(image).pixels.big_endian = Some(value);
    }

    fn set_pixels_interleaved(&mut self, value: bool, image: usize) {
        self.image_mut(image).pixels.interleaved = Some(value);
    }

    fn set_channel_samples_per_pixel(&mut self, value: u32, image: usize, channel: usize) {
        self.ensure_channel(image, channel);
        self.images[image].pixels.channels[channel].samples_per_pixel = Some(value);
    }

    fn set_channel_name(&mut self, name: &str, image: usize, channel: usize) {
        self.ensure_channel(image, channel);
        self.images[image].pixels.channels[channel].name = Some(name.to_string());
    }

    fn set_tiff_data_ifd(&mut self, value: u64, image: usize, tiff_data: usize) {
        self.ensure_tiff_data(image, tiff_data);
        self.images[image].pixels.tiff_data[tiff_data].ifd = Some(value);
    }

    fn set_tiff_data_plane_count(&mut self, value: u64, image: usize, tiff_data: usize) {
        self.ensure_tiff_data(image, tiff_data);
        self.images[image].pixels.tiff_data[tiff_data].plane_count = Some(value);
    }

    fn set_tiff_data_first_z(&mut self, value: u32, image: usize, tiff_data: usize) {
        self.ensure_tiff_data(image, tiff_data);
        self.images[image].pixels.tiff_data[tiff_data].first_z = Some(value);
    }

    fn set_tiff_data_first_c(&mut self, value: u32, image: usize, tiff_data: usize) {
        self.ensure_tiff_data(image, tiff_data);
        self.images[image].pixels.tiff_data[tiff_data].first_c = Some(value);
    }

    fn set_tiff_data_first_t(&mut self, value: u32, image: usize, tiff_data: usize) {
        self.ensure_tiff_data(image, tiff_data);
        self.images[image].pixels.tiff_data[tiff_data].first_t = Some(value);
    }

    fn set_uuid_file_name(&mut self, value: &str, image: usize, tiff_data: usize) {
        self.ensure_tiff_data(image, tiff_data);
        self.images[image].pixels.tiff_data[tiff_data].uuid_file_name = Some(value.to_string());
    }

    fn set_uuid_value(&mut self, value: &str, image: usize, tiff_data: usize) {
        self.ensure_tiff_data(image, tiff_data);
        self.images[image].pixels.tiff_data[tiff_data].uuid_value = Some(value.to_string());
    }

    fn set_plane_the_z(&mut self, value: u32, image: usize, plane: usize) {
        self.ensure_plane(image, plane);
        self.images[image].pixels.planes[plane].the_z = Some(value);
    }

    fn set_plane_the_c(&mut self, value: u32, image: usize, plane: usize) {
        self.ensure_plane(image, plane);
        self.images[image].pixels.planes[plane].the_c = Some(value);
    }

    fn set_plane_the_t(&mut self, value: u32, image: usize, plane: usize) {
        self.ensure_plane(image, plane);
        self.images[image].pixels.planes[plane].the_t = Some(value);
    }

    fn set_uuid(&mut self, uuid: &str) {
        self.uuid = Some(uuid.to_string());
    }

    fn set_resolutions(&mut self, resolutions: &[Resolution], image: usize) {
        self.ensure_image(image);
        self.resolutions.insert(image, resolutions.to_vec());
    }
}

/// Check that an image carries the minimum metadata the codec needs.
pub fn verify_minimum(meta: &dyn MetadataRetrieve, image: usize) -> OmeTiffResult<()> {
    meta.pixels_size_x(image)?;
    meta.pixels_size_y(image)?;
    meta.pixels_size_z(image)?;
    meta.pixels_size_c(image)?;
    meta.pixels_size_t(image)?;
    meta.pixels_type(image)?;
    meta.pixels_dimension_order(image)?;
    Ok(())
}

/// Fill a metadata store from per-series core metadata.
pub fn fill_metadata(store: &mut dyn MetadataStore, core: &[CoreMetadata]) {
    for (series, meta) in core.iter().enumerate() {
        store.set_pixels_size_x(meta.size_x, series);
        store.set_pixels_size_y(meta.size_y, series);
        store.set_pixels_size_z(meta.size_z, series);
        store.set_pixels_size_c(meta.total_samples(), series);
        store.set_pixels_size_t(meta.size_t, series);
        store.set_pixels_type(meta.pixel_type, series);
        store.set_pixels_significant_bits(meta.bits_per_pixel, series);
        store.set_pixels_dimension_order(meta.dimension_order, series);
        store.set_pixels_big_endian(!meta.little_endian, series);
        store.set_pixels_interleaved(meta.interleaved, series);
        for (channel, samples) in meta.size_c.iter().enumerate() {
            store.set_channel_samples_per_pixel(*samples, series, channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_round_trips_for_every_order() {
        let (size_z, eff_c, size_t) = (3usize, 2usize, 4usize);
        let count = size_z * eff_c * size_t;
        for order in DimensionOrder::VALUES {
            let mut seen = vec![false; count];
            for z in 0..size_z {
                for c in 0..eff_c {
                    for t in 0..size_t {
                        let index =
                            plane_index(order, size_z, eff_c, size_t, count, z, c, t).unwrap();
                        assert!(!seen[index], "index collision under {}", order);
                        seen[index] = true;
                        let coords =
                            zct_coords(order, size_z, eff_c, size_t, count, index).unwrap();
                        assert_eq!(coords, [z, c, t], "round trip under {}", order);
                    }
                }
            }
            assert!(seen.iter().all(|s| *s));
        }
    }

    #[test]
    fn out_of_range_coords_are_rejected() {
        assert!(plane_index(DimensionOrder::XYZCT, 2, 2, 2, 8, 2, 0, 0).is_err());
        assert!(zct_coords(DimensionOrder::XYZCT, 2, 2, 2, 8, 8).is_err());
    }

    #[test]
    fn first_axis_varies_fastest() {
        // Under XYZCT the Z coordinate is the innermost stride.
        assert_eq!(
            plane_index(DimensionOrder::XYZCT, 3, 2, 2, 12, 1, 0, 0).unwrap(),
            1
        );
        // Under XYCZT the channel is.
        assert_eq!(
            plane_index(DimensionOrder::XYCZT, 3, 2, 2, 12, 0, 1, 0).unwrap(),
            1
        );
    }

    #[test]
    fn modulo_size() {
        let mut modulo = Modulo::new('Z');
        assert_eq!(modulo.size(), 1);
        modulo.end = 4.0;
        modulo.step = 2.0;
        assert_eq!(modulo.size(), 3);
    }

    #[test]
    fn store_round_trip() {
        let mut meta = OmeXmlMetadata::new();
        meta.set_pixels_size_x(64, 0);
        meta.set_pixels_type(PixelType::UInt16, 0);
        meta.set_channel_samples_per_pixel(3, 0, 0);
        meta.set_tiff_data_ifd(5, 0, 0);
        meta.set_uuid("urn:uuid:1234");

        assert_eq!(meta.image_count(), 1);
        assert_eq!(meta.pixels_size_x(0).unwrap(), 64);
        assert_eq!(meta.pixels_type(0).unwrap(), PixelType::UInt16);
        assert_eq!(meta.channel_samples_per_pixel(0, 0).unwrap(), 3);
        assert_eq!(meta.tiff_data_ifd(0, 0).unwrap(), 5);
        assert!(meta.pixels_size_y(0).is_err());
        assert!(meta.uuid_value(0, 0).is_err());
    }

    #[test]
    fn validate_model_repairs_channels() {
        let mut meta = OmeXmlMetadata::new();
        meta.set_pixels_size_c(3, 0);
        assert!(!meta.validate_model(false));
        meta.validate_model(true);
        assert!(meta.validate_model(false));
        assert_eq!(meta.channel_count(0), 3);
        assert_eq!(meta.channel_samples_per_pixel(0, 0).unwrap(), 1);
    }

    #[test]
    fn snapshot_copies_the_surface() {
        let mut original = OmeXmlMetadata::new();
        original.set_pixels_size_x(32, 0);
        original.set_pixels_size_y(16, 0);
        original.set_pixels_dimension_order(DimensionOrder::XYZTC, 0);
        original.set_channel_name("DAPI", 0, 0);
        original.set_resolutions(
            &[Resolution {
                size_x: 16,
                size_y: 8,
                size_z: 1,
            }],
            0,
        );

        let copy = OmeXmlMetadata::from_retrieve(&original);
        assert_eq!(copy.pixels_size_x(0).unwrap(), 32);
        assert_eq!(
            copy.pixels_dimension_order(0).unwrap(),
            DimensionOrder::XYZTC
        );
        assert_eq!(copy.channel_name(0, 0).unwrap(), "DAPI");
        assert_eq!(copy.resolutions(0).unwrap().len(), 1);
    }
}
