//! OME-TIFF reader: discovers the files of a dataset through the OME-XML
//! UUID map, builds the per-series plane → `(file, IFD)` index, and decodes
//! plane regions.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{FormatError, OmeTiffResult, UsageError};
use crate::handler::{canonical, HandlerState};
use crate::meta::{
    self, fill_metadata, xml, CoreMetadata, DimensionOrder, MetadataRetrieve, MetadataStore,
    OmeXmlMetadata,
};
use crate::pixel::{PixelType, VariantPixelBuffer};
use crate::tags::{PhotometricInterpretation, PlanarConfiguration, Tag};
use crate::tiff::{Ifd, Tiff};
use crate::{check_suffix, COMPANION_SUFFIXES, OME_TIFF_SUFFIXES};

/// Availability of one mapped plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaneStatus {
    /// Declared but its file is missing.
    Absent,
    /// Present and readable.
    Present,
    /// Never mapped by any `TiffData`.
    #[default]
    Unknown,
}

/// Mapping of one plane to the IFD holding its pixel data.
#[derive(Debug, Clone, Default)]
pub struct OmeTiffPlane {
    /// Owning file, canonicalised.
    pub id: Option<PathBuf>,
    /// IFD index within the owning file.
    pub ifd: usize,
    /// Whether the mapping came from an explicit `TiffData` rather than
    /// fill-forward.
    pub certain: bool,
    pub status: PlaneStatus,
}

/// Core metadata of one `(series, resolution)` plus the OME-TIFF specific
/// plane table and tile geometry.
#[derive(Debug, Clone, Default)]
struct SeriesMetadata {
    core: CoreMetadata,
    tile_width: Vec<u32>,
    tile_height: Vec<u32>,
    /// Populated on resolution 0 only.
    planes: Vec<OmeTiffPlane>,
    /// Index into the parent IFD's `SubIfd` offsets, set for resolutions
    /// above 0.
    sub_resolution_offset: Option<usize>,
}

fn open_tiff<'m>(
    tiffs: &'m mut BTreeMap<PathBuf, Option<Tiff>>,
    path: &Path,
) -> OmeTiffResult<&'m mut Tiff> {
    let slot = tiffs.entry(path.to_path_buf()).or_insert(None);
    if slot.is_none() {
        *slot = Some(Tiff::open(path)?);
    }
    match slot {
        Some(tiff) => Ok(tiff),
        None => Err(FormatError::Format(String::from("TIFF cache corrupted")).into()),
    }
}

/// Reader for OME-TIFF datasets.
///
/// ```no_run
/// # fn main() -> ometiff::OmeTiffResult<()> {
/// use ometiff::{OmeTiffReader, VariantPixelBuffer, PixelType};
///
/// let mut reader = OmeTiffReader::new();
/// reader.set_id(std::path::Path::new("multi-channel.ome.tif"))?;
/// let mut buf = VariantPixelBuffer::new(PixelType::UInt8, [1, 1, 1, 1, 1, 1, 1, 1, 1]);
/// reader.open_bytes(0, &mut buf)?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct OmeTiffReader {
    state: HandlerState,
    store: OmeXmlMetadata,
    core: Vec<Vec<Option<SeriesMetadata>>>,
    tiffs: BTreeMap<PathBuf, Option<Tiff>>,
    /// UUID → canonical file map; the empty string keys `TiffData`
    /// elements with no UUID.
    files: BTreeMap<String, PathBuf>,
    /// Remembered bad `UUID.FileName` values, so each warns once.
    invalid_files: BTreeMap<PathBuf, PathBuf>,
    used_files: Vec<PathBuf>,
    metadata_file: Option<PathBuf>,
    cached_metadata: Option<(PathBuf, OmeXmlMetadata)>,
}

impl OmeTiffReader {
    pub fn new() -> OmeTiffReader {
        OmeTiffReader::default()
    }

    /// Initialise the reader on a dataset file.
    ///
    /// `path` may be any member file of a multi-file dataset, or a
    /// `companion.ome` metadata file, in which case initialisation
    /// restarts on the first TIFF the companion references.
    pub fn set_id(&mut self, path: &Path) -> OmeTiffResult<()> {
        self.state.assert_fresh()?;
        self.state.open(path);
        let current = self.state.assert_open()?.to_path_buf();
        let dir = current.parent().map(Path::to_path_buf).unwrap_or_default();

        if check_suffix(&current, COMPANION_SUFFIXES) {
            return self.init_companion(&current, &dir);
        }

        let mut metadata = self.cache_metadata(&current)?;

        // A binary-only file points at the real metadata document, unless
        // it circularly references another OME-TIFF.
        if let Ok(metadata_file) = metadata.binary_only_metadata_file() {
            let resolved = canonical(&dir.join(&metadata_file));
            if !check_suffix(&resolved, OME_TIFF_SUFFIXES) && resolved.exists() {
                match std::fs::read_to_string(&resolved) {
                    Ok(text) => {
                        metadata = xml::parse_ome_xml(&text)?;
                        self.metadata_file = Some(resolved);
                    }
                    Err(err) => {
                        warn!(
                            "failed to read metadata file {}: {}",
                            resolved.display(),
                            err
                        );
                    }
                }
            }
        }

        if metadata.image_count() == 0 {
            return Err(FormatError::MalformedOmeXml(String::from(
                "document declares no Image elements",
            ))
            .into());
        }
        for series in 0..metadata.image_count() {
            meta::verify_minimum(&metadata, series)?;
        }

        metadata.remove_excess_channels();

        let acquisition_dates: Vec<Option<String>> = (0..metadata.image_count())
            .map(|i| metadata.image_acquisition_date(i).ok())
            .collect();
        let current_uuid = metadata.uuid().ok();

        self.core = (0..metadata.image_count())
            .map(|_| vec![Some(SeriesMetadata::default())])
            .collect();

        self.find_used_files(&metadata, &current, &dir, &current_uuid)?;
        self.check_channel_samples_per_pixel(&metadata);
        let invalid = self.find_tiff_data(&metadata, &current, &dir)?;
        self.find_modulo(&metadata);

        // Drop series invalidated by empty TiffData declarations, keeping
        // the core list and the model aligned.
        let mut metadata = metadata;
        for series in invalid.iter().rev() {
            self.core.remove(*series);
            metadata.remove_image(*series);
        }

        self.fix_image_counts();

        // Publish the discovered core metadata through the store.
        self.store = metadata;
        let core_list: Vec<CoreMetadata> = self
            .core
            .iter()
            .filter_map(|series| series[0].as_ref().map(|m| m.core.clone()))
            .collect();
        fill_metadata(&mut self.store, &core_list);
        self.fix_missing_plane_indexes();

        for (series, date) in acquisition_dates.iter().enumerate() {
            if let Some(date) = date {
                self.store.set_image_acquisition_date(date, series);
            }
        }

        self.add_sub_resolutions()?;
        Ok(())
    }

    fn init_companion(&mut self, current: &Path, dir: &Path) -> OmeTiffResult<()> {
        let text = std::fs::read_to_string(current)?;
        let metadata = xml::parse_ome_xml(&text)?;
        let first_tiff = metadata.uuid_file_name(0, 0)?;
        let metadata_file = current.to_path_buf();
        let target = canonical(&dir.join(first_tiff));
        self.close();
        self.set_id(&target)?;
        self.metadata_file = Some(metadata_file);
        Ok(())
    }

    /// Reset all reader state and close every cached TIFF.
    pub fn close(&mut self) {
        self.state.close();
        self.store = OmeXmlMetadata::new();
        self.core.clear();
        self.tiffs.clear();
        self.files.clear();
        self.invalid_files.clear();
        self.used_files.clear();
        self.metadata_file = None;
        self.cached_metadata = None;
    }

    /// Parse (or reuse) the OME-XML carried by the file's first
    /// `ImageDescription`.
    fn cache_metadata(&mut self, path: &Path) -> OmeTiffResult<OmeXmlMetadata> {
        let canonical_path = canonical(path);
        if let Some((cached_path, cached)) = &self.cached_metadata {
            if *cached_path == canonical_path {
                return Ok(cached.clone());
            }
        }

        let tiff = open_tiff(&mut self.tiffs, &canonical_path)?;
        let ifd = tiff.directory(0)?;
        let description = match ifd.entry(Tag::ImageDescription) {
            None => return Err(FormatError::ImageDescriptionNotFound.into()),
            Some(entry) => match &entry.value {
                crate::tiff::Value::Ascii(_) => ifd.ascii_field(Tag::ImageDescription)?,
                _ => return Err(FormatError::ImageDescriptionNotAscii(entry.ty).into()),
            },
        };

        let metadata = xml::parse_ome_xml(&description)?;
        self.cached_metadata = Some((canonical_path, metadata.clone()));
        Ok(metadata)
    }

    /// Whether a dataset is self-contained: all declared planes fit within
    /// the file's own IFD count.
    pub fn is_single_file(&mut self, path: &Path) -> OmeTiffResult<bool> {
        if check_suffix(path, COMPANION_SUFFIXES) {
            return Ok(false);
        }
        let metadata = self.cache_metadata(path)?;
        let mut planes = 0usize;
        for image in 0..metadata.image_count() {
            let channels = metadata.channel_count(image).max(1);
            let z = metadata.pixels_size_z(image)? as usize;
            let t = metadata.pixels_size_t(image)? as usize;
            planes += z * t * channels;
        }
        let tiff = open_tiff(&mut self.tiffs, &canonical(path))?;
        Ok(planes > 0 && planes <= tiff.directory_count())
    }

    fn find_used_files(
        &mut self,
        metadata: &OmeXmlMetadata,
        current: &Path,
        dir: &Path,
        current_uuid: &Option<String>,
    ) -> OmeTiffResult<()> {
        for series in 0..metadata.image_count() {
            for td in 0..metadata.tiff_data_count(series) {
                let uuid = metadata.uuid_value(series, td).unwrap_or_default();
                let filename = if uuid.is_empty() {
                    // No UUID: the TiffData refers to this file.
                    current.to_path_buf()
                } else {
                    let named = metadata
                        .uuid_file_name(series, td)
                        .ok()
                        .map(|name| canonical(&dir.join(name)));
                    match named {
                        Some(named) if named.exists() => named,
                        _ => {
                            if let Some(current_uuid) = current_uuid {
                                if *current_uuid == uuid || current_uuid.is_empty() {
                                    current.to_path_buf()
                                } else {
                                    return Err(FormatError::UnmatchedUuid(uuid).into());
                                }
                            } else {
                                warn!(
                                    "unmatched filename for UUID `{}`; falling back to current file `{}` (which lacks a UUID)",
                                    uuid,
                                    current.display()
                                );
                                current.to_path_buf()
                            }
                        }
                    }
                };

                match self.files.get(&uuid) {
                    None => {
                        self.files.insert(uuid, filename);
                    }
                    Some(existing) if *existing != filename => {
                        return Err(FormatError::InconsistentUuid {
                            uuid,
                            first: existing.clone(),
                            second: filename,
                        }
                        .into());
                    }
                    Some(_) => {}
                }
            }
        }

        let mut file_set: BTreeSet<PathBuf> = self.files.values().cloned().collect();
        file_set.insert(current.to_path_buf());
        self.used_files = file_set.into_iter().collect();
        Ok(())
    }

    /// Ensure each series carries one samples-per-pixel entry per channel,
    /// inserting single-sample channels when the model omits them.
    fn check_channel_samples_per_pixel(&mut self, metadata: &OmeXmlMetadata) {
        for series in 0..metadata.image_count() {
            let Some(series_meta) = self.core[series][0].as_mut() else {
                continue;
            };
            let channel_count = metadata.channel_count(series);
            if channel_count > 0 {
                series_meta.core.size_c = (0..channel_count)
                    .map(|c| metadata.channel_samples_per_pixel(series, c).unwrap_or(1))
                    .collect();
            } else {
                let channels = metadata.pixels_size_c(series).unwrap_or(1).max(1);
                series_meta.core.size_c = vec![1; channels as usize];
                warn!(
                    "Channel element(s) are missing for series {}: falling back to {} channel(s) of 1 sample each",
                    series, channels
                );
            }
        }
    }

    /// Per-series minimum `FirstZ`/`FirstT`/`FirstC`, compensating for
    /// writers that index from 1.
    fn series_index_start(
        metadata: &OmeXmlMetadata,
        series: usize,
    ) -> (Option<u32>, Option<u32>, Option<u32>) {
        let mut z_start = None;
        let mut t_start = None;
        let mut c_start = None;
        for td in 0..metadata.tiff_data_count(series) {
            let first_z = metadata.tiff_data_first_z(series, td).unwrap_or(0);
            let first_t = metadata.tiff_data_first_t(series, td).unwrap_or(0);
            let first_c = metadata.tiff_data_first_c(series, td).unwrap_or(0);
            z_start = Some(z_start.map_or(first_z, |s: u32| s.min(first_z)));
            t_start = Some(t_start.map_or(first_t, |s: u32| s.min(first_t)));
            c_start = Some(c_start.map_or(first_c, |s: u32| s.min(first_c)));
        }
        if z_start.is_some_and(|s| s > 0) {
            warn!("series {} has non-zero z index start: {}", series, z_start.unwrap_or(0));
        }
        if t_start.is_some_and(|s| s > 0) {
            warn!("series {} has non-zero t index start: {}", series, t_start.unwrap_or(0));
        }
        if c_start.is_some_and(|s| s > 0) {
            warn!("series {} has non-zero c index start: {}", series, c_start.unwrap_or(0));
        }
        (z_start, t_start, c_start)
    }

    fn tiff_data_filename(
        &mut self,
        metadata: &OmeXmlMetadata,
        series: usize,
        td: usize,
        current: &Path,
        dir: &Path,
    ) -> PathBuf {
        let filename = metadata.uuid_file_name(series, td).ok();
        let uuid = metadata.uuid_value(series, td).ok();

        match filename {
            None => match uuid {
                None => current.to_path_buf(),
                Some(uuid) => match self.files.get(&uuid) {
                    Some(path) => path.clone(),
                    None => {
                        warn!(
                            "UUID filename {} not found; falling back to {}",
                            uuid,
                            current.display()
                        );
                        current.to_path_buf()
                    }
                },
            },
            Some(filename) => {
                let joined = dir.join(&filename);
                if joined.exists() {
                    canonical(&joined)
                } else if let Some(substitute) = self.invalid_files.get(Path::new(&filename)) {
                    substitute.clone()
                } else {
                    warn!(
                        "UUID filename {} not found; falling back to {}",
                        filename,
                        current.display()
                    );
                    self.invalid_files
                        .insert(PathBuf::from(filename), current.to_path_buf());
                    current.to_path_buf()
                }
            }
        }
    }

    /// Map every `TiffData` element onto the per-series plane table.
    ///
    /// Returns the set of series invalidated by a zero plane count.
    fn find_tiff_data(
        &mut self,
        metadata: &OmeXmlMetadata,
        current: &Path,
        dir: &Path,
    ) -> OmeTiffResult<BTreeSet<usize>> {
        let mut invalid = BTreeSet::new();

        for series in 0..metadata.image_count() {
            let order = metadata.pixels_dimension_order(series)?;
            let size_z = metadata.pixels_size_z(series)? as usize;
            let size_t = metadata.pixels_size_t(series)? as usize;
            let eff_c = self.core[series][0]
                .as_ref()
                .map_or(1, |m| m.core.effective_size_c().max(1));
            let num = size_z * size_t * eff_c;

            debug!("Image[{}] planes={}", series, num);

            if let Some(series_meta) = self.core[series][0].as_mut() {
                series_meta.planes = vec![OmeTiffPlane::default(); num];
            }

            let (z_start, t_start, c_start) = Self::series_index_start(metadata, series);

            for td in 0..metadata.tiff_data_count(series) {
                let td_ifd = metadata.tiff_data_ifd(series, td).ok();
                // A missing PlaneCount with an IFD means one plane; an
                // explicit zero without an IFD invalidates the series; a
                // missing PlaneCount without an IFD fills forward.
                let declared = match metadata.tiff_data_plane_count(series, td) {
                    Ok(0) if td_ifd.is_some() => Some(1),
                    Ok(0) => {
                        warn!(
                            "image series {}, TiffData {} has zero plane count: removing invalid image series",
                            series, td
                        );
                        invalid.insert(series);
                        break;
                    }
                    Ok(count) => Some(count as usize),
                    Err(_) if td_ifd.is_some() => Some(1),
                    Err(_) => None,
                };
                let td_ifd = td_ifd.unwrap_or(0) as usize;

                let mut first_z = metadata.tiff_data_first_z(series, td).unwrap_or(0);
                let mut first_t = metadata.tiff_data_first_t(series, td).unwrap_or(0);
                let mut first_c = metadata.tiff_data_first_c(series, td).unwrap_or(0);
                if let Some(start) = z_start {
                    if first_z >= start {
                        first_z -= start;
                    }
                }
                if let Some(start) = t_start {
                    if first_t >= start {
                        first_t -= start;
                    }
                }
                if let Some(start) = c_start {
                    if first_c >= start {
                        first_c -= start;
                    }
                }

                if first_z as usize >= size_z
                    || first_c as usize >= eff_c
                    || first_t as usize >= size_t
                {
                    warn!(
                        "found invalid TiffData: Z={}, C={}, T={}",
                        first_z, first_c, first_t
                    );
                    break;
                }

                let index = meta::plane_index(
                    order,
                    size_z,
                    eff_c,
                    size_t,
                    num,
                    first_z as usize,
                    first_c as usize,
                    first_t as usize,
                )?;

                let filename = self.tiff_data_filename(metadata, series, td, current, dir);
                let exists = if filename.exists() {
                    open_tiff(&mut self.tiffs, &filename).is_ok()
                } else {
                    // Tolerate a missing member file only in single-file
                    // datasets, where the current file substitutes.
                    self.used_files.len() == 1
                };

                let Some(series_meta) = self.core[series][0].as_mut() else {
                    break;
                };
                let count = match declared {
                    Some(count) => count.min(num - index),
                    None => {
                        // Fill forward until the next certain plane.
                        let mut run = 1;
                        while index + run < num && !series_meta.planes[index + run].certain {
                            run += 1;
                        }
                        run
                    }
                };
                for q in 0..count {
                    let plane = &mut series_meta.planes[index + q];
                    plane.id = Some(filename.clone());
                    plane.ifd = td_ifd + q;
                    plane.certain = declared.is_some() || q == 0;
                    plane.status = if exists {
                        PlaneStatus::Present
                    } else {
                        PlaneStatus::Absent
                    };
                    debug!("  Plane[{}]: file={} IFD={}", index + q, filename.display(), plane.ifd);
                }
            }

            if invalid.contains(&series) {
                continue;
            }

            // A wholly unmapped plane degrades the series to a linear scan
            // of the current file's IFDs.
            let unmapped = self.core[series][0]
                .as_ref()
                .is_some_and(|meta| meta.planes.iter().any(|p| p.id.is_none()));
            if unmapped {
                warn!(
                    "series {} missing plane mappings; falling back to IFD order",
                    series
                );
                let count = open_tiff(&mut self.tiffs, current)
                    .map(|tiff| tiff.directory_count())
                    .unwrap_or(0);
                let series_meta = match self.core[series][0].as_mut() {
                    Some(meta) => meta,
                    None => continue,
                };
                series_meta.planes = (0..count)
                    .map(|p| OmeTiffPlane {
                        id: Some(current.to_path_buf()),
                        ifd: p,
                        certain: true,
                        status: PlaneStatus::Present,
                    })
                    .collect();
            }

            self.fill_core_metadata(metadata, series, 0)?;
        }

        Ok(invalid)
    }

    /// Fill the core metadata of one `(series, resolution)` pair from the
    /// model and the backing IFD, cross-checking the two.
    fn fill_core_metadata(
        &mut self,
        metadata: &OmeXmlMetadata,
        series: usize,
        resolution: usize,
    ) -> OmeTiffResult<()> {
        let incomplete =
            |detail: String| FormatError::IncompletePixelsMetadata(detail);

        let (plane_id, plane_ifd) = {
            let full = self.core[series][0]
                .as_ref()
                .ok_or_else(|| incomplete(format!("series {} removed", series)))?;
            let plane = full
                .planes
                .first()
                .ok_or_else(|| incomplete(format!("series {} has no planes", series)))?;
            let id = plane
                .id
                .clone()
                .ok_or_else(|| incomplete(format!("series {} plane 0 unmapped", series)))?;
            (id, plane.ifd)
        };
        let sub_offset = self.core[series]
            .get(resolution)
            .and_then(|m| m.as_ref())
            .and_then(|m| m.sub_resolution_offset);

        let tiff = open_tiff(&mut self.tiffs, &plane_id)?;
        let mut ifd = tiff.directory(plane_ifd)?;
        if resolution > 0 {
            let offset = sub_offset.ok_or_else(|| {
                incomplete(format!(
                    "sub-resolution offset missing for series {}, resolution {}",
                    series, resolution
                ))
            })?;
            let subifds = ifd
                .sub_ifd_offsets()?
                .ok_or_else(|| incomplete(String::from("SubIFD offsets missing")))?;
            let target = *subifds
                .get(offset)
                .ok_or_else(|| incomplete(String::from("SubIFD offset out of range")))?;
            ifd = tiff.directory_at(target)?;
        }

        let tiff_width = ifd.image_width()?;
        let tiff_height = ifd.image_height()?;
        let tiff_pixel_type = ifd.pixel_type()?;
        let photometric = ifd.photometric_interpretation()?;
        let planar = ifd.planar_configuration()?;
        let indexed =
            photometric == PhotometricInterpretation::RGBPalette && ifd.colormap().is_ok();

        let meta_size_x = metadata.pixels_size_x(series)?;
        let meta_size_y = metadata.pixels_size_y(series)?;
        if resolution == 0 && (meta_size_x != tiff_width || meta_size_y != tiff_height) {
            warn!(
                "size mismatch: OME={}×{}, TIFF={}×{}",
                meta_size_x, meta_size_y, tiff_width, tiff_height
            );
        }

        let size_z = metadata.pixels_size_z(series)?;
        let size_t = metadata.pixels_size_t(series)?;
        let model_pixel_type = metadata.pixels_type(series)?;
        if model_pixel_type != tiff_pixel_type {
            warn!(
                "PixelType mismatch: OME={}, TIFF={}",
                model_pixel_type, tiff_pixel_type
            );
        }
        let bin_data = metadata
            .images()
            .get(series)
            .map_or(0, |image| image.pixels.bin_data_count);
        if bin_data > 0 {
            warn!("ignoring invalid BinData elements in OME-TIFF Pixels element");
        }

        let mut bits_per_pixel = model_pixel_type.bits_per_pixel();
        if let Ok(significant) = metadata.pixels_significant_bits(series) {
            if significant <= bits_per_pixel {
                bits_per_pixel = significant;
            } else {
                warn!(
                    "BitsPerPixel out of range: OME={}, MAX={}",
                    significant, bits_per_pixel
                );
            }
        }

        // Per-channel sample and tile geometry checks against each
        // channel's first IFD.
        let dimension_order = metadata.pixels_dimension_order(series)?;
        let (mut size_c, image_count) = {
            let full = self.core[series][0]
                .as_ref()
                .ok_or_else(|| incomplete(format!("series {} removed", series)))?;
            (
                full.core.size_c.clone(),
                size_z as usize * size_t as usize * full.core.effective_size_c().max(1),
            )
        };

        let mut tile_width = Vec::with_capacity(size_c.len());
        let mut tile_height = Vec::with_capacity(size_c.len());
        for channel in 0..size_c.len() {
            let plane_index = meta::plane_index(
                dimension_order,
                size_z as usize,
                size_c.len(),
                size_t as usize,
                image_count,
                0,
                channel,
                0,
            )?;
            let (channel_id, channel_ifd_index) = {
                let full = self.core[series][0]
                    .as_ref()
                    .ok_or_else(|| incomplete(format!("series {} removed", series)))?;
                let plane = full
                    .planes
                    .get(plane_index)
                    .ok_or_else(|| incomplete(format!("plane {} unmapped", plane_index)))?;
                match plane.id.clone() {
                    Some(id) => (id, plane.ifd),
                    None => {
                        tile_width.push(tiff_width);
                        tile_height.push(tiff_height);
                        continue;
                    }
                }
            };
            let channel_tiff = open_tiff(&mut self.tiffs, &channel_id)?;
            let channel_ifd = channel_tiff.directory(channel_ifd_index)?;
            let tiff_samples = u32::from(channel_ifd.samples_per_pixel()?);
            if size_c[channel] != tiff_samples {
                warn!(
                    "SamplesPerPixel mismatch: OME={}, TIFF={}",
                    size_c[channel], tiff_samples
                );
                size_c[channel] = tiff_samples;
            }
            let (tw, th) = channel_ifd.tile_size()?;
            tile_width.push(tw);
            tile_height.push(th);
        }

        let total_samples: u32 = size_c.iter().sum();
        if total_samples != metadata.pixels_size_c(series)? {
            warn!(
                "SizeC mismatch: Channels={}, Pixels={}",
                total_samples,
                metadata.pixels_size_c(series)?
            );
        }

        {
            let series_meta = self.core[series]
                .get_mut(resolution)
                .and_then(|m| m.as_mut())
                .ok_or_else(|| incomplete(format!("resolution {} missing", resolution)))?;
            let core = &mut series_meta.core;
            core.size_x = tiff_width;
            core.size_y = tiff_height;
            core.size_z = size_z;
            core.size_t = size_t;
            core.size_c = size_c;
            core.pixel_type = model_pixel_type;
            core.image_count = core.computed_image_count();
            core.dimension_order = dimension_order;
            core.order_certain = true;
            // Chunk decoding converts to the native endianness.
            core.little_endian = cfg!(target_endian = "little");
            core.interleaved = planar == PlanarConfiguration::Chunky;
            core.indexed = indexed;
            core.metadata_complete = true;
            core.bits_per_pixel = bits_per_pixel;
            series_meta.tile_width = tile_width;
            series_meta.tile_height = tile_height;
        }

        if resolution == 0 {
            self.fix_omero_metadata(metadata, series);
            self.fix_dimensions(series);
        }
        Ok(())
    }

    /// Files exported by OMERO carry an `__omero_export` marker and an
    /// incorrect dimension order.
    fn fix_omero_metadata(&mut self, metadata: &OmeXmlMetadata, series: usize) {
        if metadata.tiff_data_count(series) == 0 || metadata.channel_count(series) == 0 {
            return;
        }
        if metadata.channel_name(series, 0).is_err() {
            return;
        }
        if self.files.contains_key("__omero_export") {
            if let Some(series_meta) = self.core[series][0].as_mut() {
                series_meta.core.dimension_order = DimensionOrder::XYZCT;
            }
        }
    }

    /// Reconcile dimensions with the plane count when they disagree.
    fn fix_dimensions(&mut self, series: usize) {
        let Some(series_meta) = self.core[series][0].as_mut() else {
            return;
        };
        let core = &mut series_meta.core;
        let channel_count = core.total_samples() as usize;
        if core.size_z as usize * core.size_t as usize * channel_count <= core.image_count
            || channel_count != core.effective_size_c()
        {
            return;
        }
        if core.size_z as usize == core.image_count {
            core.size_t = 1;
            core.size_c = vec![1];
        } else if core.size_t as usize == core.image_count {
            core.size_z = 1;
            core.size_c = vec![1];
        } else if channel_count == core.image_count {
            core.size_z = 1;
            core.size_t = 1;
        } else {
            core.size_z = 1;
            core.size_t = core.image_count as u32;
            core.size_c = vec![1];
        }
    }

    /// Force 1×1×1 dimensions when a single-plane series claims more.
    fn fix_image_counts(&mut self) {
        for (series, series_list) in self.core.iter_mut().enumerate() {
            let Some(series_meta) = series_list[0].as_mut() else {
                continue;
            };
            let core = &mut series_meta.core;
            if core.image_count == 1
                && (core.size_z != 1 || core.size_t != 1 || core.effective_size_c() != 1)
            {
                warn!(
                    "correcting image count mismatch for series {}: Z={} T={} C={} → Z=1 T=1 C=1",
                    series,
                    core.size_z,
                    core.size_t,
                    core.effective_size_c()
                );
                core.size_z = 1;
                core.size_t = 1;
                // Only one channel, but it may carry several samples.
                let samples = core.size_c.first().copied().unwrap_or(1);
                core.size_c = vec![samples];
            }
        }
    }

    fn find_modulo(&mut self, metadata: &OmeXmlMetadata) {
        for series in 0..metadata.image_count().min(self.core.len()) {
            let Some(series_meta) = self.core[series][0].as_mut() else {
                continue;
            };
            if let Ok(modulo) = metadata.modulo_along_z(series) {
                series_meta.core.modulo_z = modulo;
            }
            if let Ok(modulo) = metadata.modulo_along_t(series) {
                series_meta.core.modulo_t = modulo;
            }
            if let Ok(modulo) = metadata.modulo_along_c(series) {
                series_meta.core.modulo_c = modulo;
            }
        }
    }

    /// Default any unset `TheZ`/`TheC`/`TheT` on existing planes to 0.
    fn fix_missing_plane_indexes(&mut self) {
        for series in 0..self.store.image_count() {
            for plane in 0..self.store.plane_count(series) {
                if self.store.plane_the_z(series, plane).is_err() {
                    warn!("setting unset Plane TheZ value to 0");
                    self.store.set_plane_the_z(0, series, plane);
                }
                if self.store.plane_the_t(series, plane).is_err() {
                    warn!("setting unset Plane TheT value to 0");
                    self.store.set_plane_the_t(0, series, plane);
                }
                if self.store.plane_the_c(series, plane).is_err() {
                    warn!("setting unset Plane TheC value to 0");
                    self.store.set_plane_the_c(0, series, plane);
                }
            }
        }
    }

    /// Discover pyramid tiers through the `SubIfd` offsets of each series'
    /// first plane.
    fn add_sub_resolutions(&mut self) -> OmeTiffResult<()> {
        let metadata = self.store.clone();
        for series in 0..self.core.len() {
            let plane0 = {
                let Some(series_meta) = self.core[series][0].as_ref() else {
                    continue;
                };
                let Some(plane) = series_meta.planes.first() else {
                    continue;
                };
                let Some(id) = plane.id.clone() else {
                    continue;
                };
                (id, plane.ifd)
            };

            let subifds = {
                let Ok(tiff) = open_tiff(&mut self.tiffs, &plane0.0) else {
                    continue;
                };
                match tiff
                    .directory(plane0.1)
                    .and_then(|ifd| ifd.sub_ifd_offsets())
                {
                    Ok(Some(subifds)) if !subifds.is_empty() => subifds,
                    Ok(_) => continue,
                    Err(err) => {
                        warn!("failed to get sub-resolutions for series {}: {}", series, err);
                        continue;
                    }
                }
            };

            let size_c = self.core[series][0]
                .as_ref()
                .map(|m| m.core.size_c.clone())
                .unwrap_or_default();

            self.core[series].truncate(1);
            for r in 0..subifds.len() {
                let mut tier = SeriesMetadata {
                    sub_resolution_offset: Some(r),
                    ..SeriesMetadata::default()
                };
                tier.core.size_c = size_c.clone();
                self.core[series].push(Some(tier));
            }

            let mut failed = false;
            for r in 0..subifds.len() {
                if let Err(err) = self.fill_core_metadata(&metadata, series, 1 + r) {
                    warn!("failed to get sub-resolutions for series {}: {}", series, err);
                    failed = true;
                    break;
                }
                let ok = {
                    let full = self.core[series][0].as_ref();
                    let sub = self.core[series][1 + r].as_ref();
                    match (full, sub) {
                        (Some(full), Some(sub)) => compare_resolution(&full.core, &sub.core),
                        _ => false,
                    }
                };
                if !ok {
                    warn!(
                        "sub-resolution core metadata mismatch with full resolution core metadata: series {}, resolution {}",
                        series,
                        1 + r
                    );
                    failed = true;
                    break;
                }
            }
            if failed {
                self.core[series].truncate(1);
                continue;
            }

            // Full resolution first, then descending X.
            self.core[series].sort_by(|a, b| {
                let ax = a.as_ref().map_or(0, |m| m.core.size_x);
                let bx = b.as_ref().map_or(0, |m| m.core.size_x);
                bx.cmp(&ax)
            });
        }
        Ok(())
    }

    // Cursor and core metadata accessors.

    pub fn series_count(&self) -> usize {
        self.core.len()
    }

    pub fn set_series(&mut self, series: usize) -> OmeTiffResult<()> {
        self.state.set_series(series, self.series_count())?;
        Ok(())
    }

    pub fn series(&self) -> OmeTiffResult<usize> {
        self.state.series()
    }

    pub fn resolution_count(&self) -> OmeTiffResult<usize> {
        let series = self.state.series()?;
        Ok(self.core.get(series).map_or(0, Vec::len))
    }

    pub fn set_resolution(&mut self, resolution: usize) -> OmeTiffResult<()> {
        let count = self.resolution_count()?;
        self.state.set_resolution(resolution, count)?;
        Ok(())
    }

    pub fn resolution(&self) -> OmeTiffResult<usize> {
        self.state.resolution()
    }

    pub fn set_plane(&mut self, plane: usize) -> OmeTiffResult<()> {
        let count = self.image_count()?;
        self.state.set_plane(plane, count)?;
        Ok(())
    }

    pub fn plane(&self) -> OmeTiffResult<usize> {
        self.state.plane()
    }

    fn series_meta(&self) -> OmeTiffResult<&SeriesMetadata> {
        let series = self.state.series()?;
        let resolution = self.state.resolution()?;
        self.core
            .get(series)
            .and_then(|list| list.get(resolution))
            .and_then(|meta| meta.as_ref())
            .ok_or_else(|| {
                UsageError::ResolutionOutOfRange {
                    resolution,
                    count: self.core.get(series).map_or(0, Vec::len),
                }
                .into()
            })
    }

    /// Core metadata of the current `(series, resolution)`.
    pub fn core_metadata(&self) -> OmeTiffResult<&CoreMetadata> {
        Ok(&self.series_meta()?.core)
    }

    pub fn image_count(&self) -> OmeTiffResult<usize> {
        Ok(self.core_metadata()?.image_count)
    }

    pub fn size_x(&self) -> OmeTiffResult<u32> {
        Ok(self.core_metadata()?.size_x)
    }

    pub fn size_y(&self) -> OmeTiffResult<u32> {
        Ok(self.core_metadata()?.size_y)
    }

    pub fn size_z(&self) -> OmeTiffResult<u32> {
        Ok(self.core_metadata()?.size_z)
    }

    pub fn size_t(&self) -> OmeTiffResult<u32> {
        Ok(self.core_metadata()?.size_t)
    }

    pub fn effective_size_c(&self) -> OmeTiffResult<usize> {
        Ok(self.core_metadata()?.effective_size_c())
    }

    pub fn pixel_type(&self) -> OmeTiffResult<PixelType> {
        Ok(self.core_metadata()?.pixel_type)
    }

    pub fn dimension_order(&self) -> OmeTiffResult<DimensionOrder> {
        Ok(self.core_metadata()?.dimension_order)
    }

    pub fn is_little_endian(&self) -> OmeTiffResult<bool> {
        Ok(self.core_metadata()?.little_endian)
    }

    pub fn is_interleaved(&self) -> OmeTiffResult<bool> {
        Ok(self.core_metadata()?.interleaved)
    }

    pub fn is_indexed(&self) -> OmeTiffResult<bool> {
        Ok(self.core_metadata()?.indexed)
    }

    /// Plane index of `(z, c, t)` under the current series' dimension
    /// order.
    pub fn index_of(&self, z: usize, c: usize, t: usize) -> OmeTiffResult<usize> {
        let core = self.core_metadata()?;
        meta::plane_index(
            core.dimension_order,
            core.size_z as usize,
            core.effective_size_c(),
            core.size_t as usize,
            core.image_count,
            z,
            c,
            t,
        )
    }

    /// `(z, c, t)` coordinates of a plane index.
    pub fn zct_coords_of(&self, index: usize) -> OmeTiffResult<[usize; 3]> {
        let core = self.core_metadata()?;
        meta::zct_coords(
            core.dimension_order,
            core.size_z as usize,
            core.effective_size_c(),
            core.size_t as usize,
            core.image_count,
            index,
        )
    }

    /// Tile width the data is chunked at, per channel.
    pub fn optimal_tile_width(&self, channel: usize) -> OmeTiffResult<u32> {
        self.series_meta()?
            .tile_width
            .get(channel)
            .copied()
            .ok_or_else(|| UsageError::MetadataMissing("tile width").into())
    }

    /// Tile height the data is chunked at, per channel.
    pub fn optimal_tile_height(&self, channel: usize) -> OmeTiffResult<u32> {
        self.series_meta()?
            .tile_height
            .get(channel)
            .copied()
            .ok_or_else(|| UsageError::MetadataMissing("tile height").into())
    }

    /// Plane mapping table of the current series.
    pub fn planes(&self) -> OmeTiffResult<&[OmeTiffPlane]> {
        let series = self.state.series()?;
        let full = self
            .core
            .get(series)
            .and_then(|list| list.first())
            .and_then(|meta| meta.as_ref())
            .ok_or(UsageError::NotOpen)?;
        Ok(&full.planes)
    }

    /// All files of the dataset, metadata file included.
    pub fn used_files(&self) -> OmeTiffResult<Vec<PathBuf>> {
        self.state.assert_open()?;
        let mut files = BTreeSet::new();
        if let Some(metadata_file) = &self.metadata_file {
            files.insert(metadata_file.clone());
        }
        files.extend(self.used_files.iter().cloned());
        Ok(files.into_iter().collect())
    }

    /// Files backing the current series.
    pub fn series_used_files(&self) -> OmeTiffResult<Vec<PathBuf>> {
        let mut files = BTreeSet::new();
        if let Some(metadata_file) = &self.metadata_file {
            files.insert(metadata_file.clone());
        }
        for plane in self.planes()? {
            if let Some(id) = &plane.id {
                files.insert(id.clone());
            }
        }
        Ok(files.into_iter().collect())
    }

    /// The metadata store filled from this dataset.
    pub fn metadata_store(&self) -> &OmeXmlMetadata {
        &self.store
    }

    fn ifd_at_index(&mut self, plane: usize) -> OmeTiffResult<(PathBuf, Ifd)> {
        let series = self.state.series()?;
        let (id, index) = {
            let full = self
                .core
                .get(series)
                .and_then(|list| list.first())
                .and_then(|meta| meta.as_ref())
                .ok_or(UsageError::NotOpen)?;
            let mapped = full.planes.get(plane).ok_or(UsageError::PlaneOutOfRange {
                plane,
                count: full.planes.len(),
            })?;
            let id = mapped
                .id
                .clone()
                .ok_or_else(|| FormatError::Format(format!("failed to open IFD {}", plane)))?;
            (id, mapped.ifd)
        };
        let tiff = open_tiff(&mut self.tiffs, &id)?;
        let ifd = tiff.directory(index)?;
        Ok((id, ifd))
    }

    /// Read a full plane into `buf`.
    pub fn open_bytes(
        &mut self,
        plane: usize,
        buf: &mut VariantPixelBuffer<'_>,
    ) -> OmeTiffResult<()> {
        let (w, h) = (self.size_x()?, self.size_y()?);
        self.open_bytes_region(plane, buf, 0, 0, w, h)
    }

    /// Read a rectangular plane region into `buf`.
    pub fn open_bytes_region(
        &mut self,
        plane: usize,
        buf: &mut VariantPixelBuffer<'_>,
        x: u32,
        y: u32,
        w: u32,
        h: u32,
    ) -> OmeTiffResult<()> {
        self.state.assert_open()?;
        self.set_plane(plane)?;
        let resolution = self.state.resolution()?;
        let sub_offset = self.series_meta()?.sub_resolution_offset;

        let (id, mut ifd) = self.ifd_at_index(plane)?;
        if resolution > 0 {
            let offset = sub_offset.ok_or_else(|| {
                FormatError::Format(format!(
                    "sub-resolution offset missing for resolution {}",
                    resolution
                ))
            })?;
            let subifds = ifd
                .sub_ifd_offsets()?
                .ok_or_else(|| FormatError::Format(String::from("SubIFD offsets missing")))?;
            let target = *subifds
                .get(offset)
                .ok_or_else(|| FormatError::Format(String::from("SubIFD offset out of range")))?;
            let tiff = open_tiff(&mut self.tiffs, &id)?;
            ifd = tiff.directory_at(target)?;
        }

        let tiff = open_tiff(&mut self.tiffs, &id)?;
        ifd.read_region(tiff, x, y, w, h, buf)
    }

    /// Read the current plane's `ColorMap` lookup table.
    pub fn lookup_table(
        &mut self,
        plane: usize,
        buf: &mut VariantPixelBuffer<'_>,
    ) -> OmeTiffResult<()> {
        self.state.assert_open()?;
        self.set_plane(plane)?;
        let (_, ifd) = self.ifd_at_index(plane)?;
        ifd.read_lookup_table(buf)
    }
}

impl Drop for OmeTiffReader {
    fn drop(&mut self) {
        self.close();
    }
}

/// Whether a sub-resolution tier is usable alongside the full tier.
fn compare_resolution(full: &CoreMetadata, sub: &CoreMetadata) -> bool {
    full.size_x >= sub.size_x
        && full.size_y >= sub.size_y
        && full.size_z == sub.size_z
        && full.size_t == sub.size_t
        && full.size_c == sub.size_c
        && full.pixel_type == sub.pixel_type
        && full.indexed == sub.indexed
        && full.interleaved == sub.interleaved
}
