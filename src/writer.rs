//! OME-TIFF writer: opens one TIFF per output path, configures an IFD per
//! plane (with pyramid SubIFDs per resolution tier), and rewrites each
//! file's first `ImageDescription` with the finalised OME-XML after close.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{FormatError, OmeTiffResult, UsageError};
use crate::handler::{canonical, HandlerState};
use crate::meta::{
    self, xml, DimensionOrder, MetadataRetrieve, MetadataStore, OmeXmlMetadata, Resolution,
};
use crate::pixel::{EndianType, VariantPixelBuffer};
use crate::reader::PlaneStatus;
use crate::tags::{PhotometricInterpretation, PlanarConfiguration, SubfileType, Tag, Type};
use crate::tiff::{compression, ChunkLayout, TiffSink};

/// The fixed-length `ImageDescription` placeholder reserved at IFD setup
/// and patched with the real OME-XML at close.
const DEFAULT_DESCRIPTION: &str = "OME-TIFF";

/// Auto-select BigTIFF when the expected pixel payload crosses this
/// threshold: the 32-bit offset ceiling less a margin for headers and
/// directories.
const BIGTIFF_THRESHOLD: u64 = (1u64 << 32) - (1u64 << 25);

/// Strip widths below this default to strips; wider rasters default to
/// 256×256 tiles.
const STRIP_WIDTH_LIMIT: u32 = 2048;

/// Target chunk payload for the automatic strip height.
const DEFAULT_CHUNK_SIZE: u32 = 65536;

/// Per-output-file state.
#[derive(Debug)]
struct TiffState {
    uuid: String,
    sink: TiffSink,
    /// Main-chain IFD count; SubIFD tiers do not advance it.
    ifd_count: usize,
}

#[derive(Debug, Clone, Default)]
struct PlaneState {
    id: Option<PathBuf>,
    ifd: usize,
    status: PlaneStatus,
}

#[derive(Debug, Clone, Default)]
struct SeriesState {
    planes: Vec<PlaneState>,
}

/// Writer for OME-TIFF datasets.
///
/// ```no_run
/// # fn main() -> ometiff::OmeTiffResult<()> {
/// use ometiff::{OmeTiffWriter, OmeXmlMetadata, MetadataStore};
///
/// let mut meta = OmeXmlMetadata::new();
/// // ... describe the dataset ...
/// let mut writer = OmeTiffWriter::new();
/// writer.set_metadata_retrieve(Box::new(meta))?;
/// writer.set_id(std::path::Path::new("output.ome.tif"))?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct OmeTiffWriter {
    state: HandlerState,
    metadata_retrieve: Option<Box<dyn MetadataRetrieve>>,
    ome_meta: Option<OmeXmlMetadata>,
    tiffs: BTreeMap<PathBuf, TiffState>,
    current: Option<PathBuf>,
    series_state: Vec<SeriesState>,
    /// Pyramid tiers per series, full resolution prepended.
    resolution_levels: Vec<Vec<Resolution>>,
    /// The user's BigTIFF choice; `None` selects automatically.
    big_tiff: Option<bool>,
    /// The BigTIFF decision taken at the first file open.
    big_flag: Option<bool>,
    base_dir: PathBuf,
}

impl OmeTiffWriter {
    pub fn new() -> OmeTiffWriter {
        OmeTiffWriter::default()
    }

    /// Provide the metadata describing the dataset to be written.
    ///
    /// Must be called before `set_id`.
    pub fn set_metadata_retrieve(
        &mut self,
        retrieve: Box<dyn MetadataRetrieve>,
    ) -> OmeTiffResult<()> {
        self.state.assert_fresh()?;
        self.metadata_retrieve = Some(retrieve);
        Ok(())
    }

    pub fn set_big_tiff(&mut self, big: Option<bool>) {
        self.big_tiff = big;
    }

    pub fn big_tiff(&self) -> Option<bool> {
        self.big_tiff
    }

    /// Codec names accepted by [`OmeTiffWriter::set_compression`].
    pub fn compression_types(&self) -> &'static [&'static str] {
        compression::codec_names()
    }

    pub fn set_compression(&mut self, name: &str) -> OmeTiffResult<()> {
        compression::codec_scheme(name)?;
        self.state.compression = Some(name.to_string());
        Ok(())
    }

    pub fn compression(&self) -> Option<&str> {
        self.state.compression.as_deref()
    }

    pub fn set_interleaved(&mut self, interleaved: bool) {
        self.state.interleaved = Some(interleaved);
    }

    pub fn interleaved(&self) -> Option<bool> {
        self.state.interleaved
    }

    pub fn set_write_sequentially(&mut self, sequential: bool) {
        self.state.write_sequentially = sequential;
    }

    pub fn set_frames_per_second(&mut self, rate: u32) {
        self.state.frames_per_second = rate;
    }

    pub fn frames_per_second(&self) -> u32 {
        self.state.frames_per_second
    }

    pub fn set_tile_size_x(&mut self, size: Option<u32>) {
        self.state.tile_size_x = size;
    }

    pub fn set_tile_size_y(&mut self, size: Option<u32>) {
        self.state.tile_size_y = size;
    }

    /// Effective tile width.
    ///
    /// After `set_id` this reflects the current IFD's chunking; before it,
    /// both tile accessors fall back to the metadata store's image-0
    /// `SizeX`.
    pub fn tile_size_x(&self) -> OmeTiffResult<u32> {
        if self.state.current_id().is_some()
            && self.state.tile_size_x.map_or(true, |size| size != 0)
        {
            let builder = self.current_state()?.sink.directory();
            return match builder.chunk_layout() {
                Some(ChunkLayout::Tiles { width, .. }) => Ok(width),
                _ => builder
                    .image_width()
                    .ok_or_else(|| UsageError::MetadataMissing("ImageWidth").into()),
            };
        }
        match self.state.tile_size_x {
            Some(size) => Ok(size),
            None => self.metadata_size_x_fallback(),
        }
    }

    /// Effective tile height; strips report their row count.
    pub fn tile_size_y(&self) -> OmeTiffResult<u32> {
        if self.state.current_id().is_some()
            && self.state.tile_size_y.map_or(true, |size| size != 0)
        {
            let builder = self.current_state()?.sink.directory();
            return match builder.chunk_layout() {
                Some(ChunkLayout::Tiles { height, .. }) => Ok(height),
                Some(ChunkLayout::Strips { rows_per_strip }) => Ok(rows_per_strip),
                None => Err(UsageError::MetadataMissing("RowsPerStrip").into()),
            };
        }
        match self.state.tile_size_y {
            Some(size) => Ok(size),
            None => self.metadata_size_x_fallback(),
        }
    }

    fn metadata_size_x_fallback(&self) -> OmeTiffResult<u32> {
        let retrieve = self
            .metadata_retrieve
            .as_deref()
            .ok_or(UsageError::MetadataMissing("MetadataRetrieve"))?;
        retrieve.pixels_size_x(0)
    }

    fn ome_meta(&self) -> OmeTiffResult<&OmeXmlMetadata> {
        self.ome_meta
            .as_ref()
            .ok_or_else(|| UsageError::NotOpen.into())
    }

    fn current_state(&self) -> OmeTiffResult<&TiffState> {
        let current = self.current.as_ref().ok_or(UsageError::NotOpen)?;
        self.tiffs
            .get(current)
            .ok_or_else(|| UsageError::UnregisteredFile(current.clone()).into())
    }

    fn current_state_mut(&mut self) -> OmeTiffResult<&mut TiffState> {
        let current = self.current.as_ref().ok_or(UsageError::NotOpen)?;
        self.tiffs
            .get_mut(current)
            .ok_or_else(|| UsageError::UnregisteredFile(current.clone()).into())
    }

    pub fn series_count(&self) -> OmeTiffResult<usize> {
        Ok(self.ome_meta()?.image_count())
    }

    /// Tier count of the current series, full resolution included.
    pub fn resolution_count(&self) -> OmeTiffResult<usize> {
        let series = self.state.series()?;
        Ok(self
            .resolution_levels
            .get(series)
            .map_or(1, |levels| levels.len().max(1)))
    }

    pub fn series(&self) -> OmeTiffResult<usize> {
        self.state.series()
    }

    pub fn resolution(&self) -> OmeTiffResult<usize> {
        self.state.resolution()
    }

    pub fn plane(&self) -> OmeTiffResult<usize> {
        self.state.plane()
    }

    /// `Z·T·effectiveSizeC` of the current series.
    pub fn image_count(&self) -> OmeTiffResult<usize> {
        let series = self.state.series()?;
        self.planes_of(series)
    }

    fn planes_of(&self, series: usize) -> OmeTiffResult<usize> {
        let meta = self.ome_meta()?;
        let size_z = meta.pixels_size_z(series)? as usize;
        let size_t = meta.pixels_size_t(series)? as usize;
        let eff_c = meta.channel_count(series).max(1);
        Ok(size_z * size_t * eff_c)
    }

    /// Raster width of the current `(series, resolution)`.
    pub fn size_x(&self) -> OmeTiffResult<u32> {
        let series = self.state.series()?;
        let resolution = self.state.resolution()?;
        if resolution == 0 {
            self.ome_meta()?.pixels_size_x(series)
        } else {
            self.resolution_level(series, resolution).map(|r| r.size_x)
        }
    }

    /// Raster height of the current `(series, resolution)`.
    pub fn size_y(&self) -> OmeTiffResult<u32> {
        let series = self.state.series()?;
        let resolution = self.state.resolution()?;
        if resolution == 0 {
            self.ome_meta()?.pixels_size_y(series)
        } else {
            self.resolution_level(series, resolution).map(|r| r.size_y)
        }
    }

    fn resolution_level(&self, series: usize, resolution: usize) -> OmeTiffResult<Resolution> {
        self.resolution_levels
            .get(series)
            .and_then(|levels| levels.get(resolution))
            .copied()
            .ok_or_else(|| {
                UsageError::ResolutionOutOfRange {
                    resolution,
                    count: self.resolution_levels.get(series).map_or(1, Vec::len),
                }
                .into()
            })
    }

    /// Open (or switch to) an output file.
    pub fn set_id(&mut self, path: &Path) -> OmeTiffResult<()> {
        let canonical_path = canonical(path);
        if self.state.current_id() == Some(canonical_path.as_path()) {
            return Ok(());
        }

        if self.series_state.is_empty() {
            // First call: snapshot and validate the provided metadata.
            let retrieve = self
                .metadata_retrieve
                .as_deref()
                .ok_or(UsageError::MetadataMissing("MetadataRetrieve"))?;
            let mut ome = OmeXmlMetadata::from_retrieve(retrieve);

            if !ome.validate_model(false) {
                ome.validate_model(true);
                if ome.validate_model(false) {
                    warn!(
                        "correction of model SizeC/ChannelCount/SamplesPerPixel inconsistency attempted"
                    );
                } else {
                    warn!(
                        "correction of model SizeC/ChannelCount/SamplesPerPixel inconsistency attempted (but inconsistencies remain)"
                    );
                }
            }

            self.base_dir = canonical_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default();

            // Expand the resolution annotation into per-series tier lists,
            // full resolution first, and strip it from the emitted model.
            let annotated = ome.take_resolutions();
            let mut levels = Vec::with_capacity(ome.image_count());
            for series in 0..ome.image_count() {
                let mut tiers = vec![Resolution {
                    size_x: ome.pixels_size_x(series)?,
                    size_y: ome.pixels_size_y(series)?,
                    size_z: ome.pixels_size_z(series)?,
                }];
                if let Some(extra) = annotated.get(&series) {
                    tiers.extend(extra.iter().copied());
                }
                levels.push(tiers);
            }
            self.resolution_levels = levels;

            let mut series_state = Vec::with_capacity(ome.image_count());
            for series in 0..ome.image_count() {
                let size_z = ome.pixels_size_z(series)? as usize;
                let size_t = ome.pixels_size_t(series)? as usize;
                let eff_c = ome.channel_count(series).max(1);
                let absent = PlaneState {
                    status: PlaneStatus::Absent,
                    ..PlaneState::default()
                };
                series_state.push(SeriesState {
                    planes: vec![absent; size_z * size_t * eff_c],
                });
            }
            self.series_state = series_state;
            self.ome_meta = Some(ome);
        }

        if self.big_flag.is_none() {
            let big = match self.big_tiff {
                Some(big) => big,
                None => {
                    let pixel_bytes = significant_pixel_size(self.ome_meta()?);
                    let auto = pixel_bytes >= BIGTIFF_THRESHOLD;
                    if auto {
                        debug!(
                            "autoselecting BigTIFF for an expected pixel payload of {} bytes",
                            pixel_bytes
                        );
                    }
                    auto
                }
            };
            self.big_flag = Some(big);
        }

        if self.tiffs.contains_key(&canonical_path) {
            self.state.open(&canonical_path);
            self.current = Some(canonical_path);
            return Ok(());
        }

        let sink = TiffSink::create(&canonical_path, self.big_flag.unwrap_or(false))?;
        self.tiffs.insert(
            canonical_path.clone(),
            TiffState {
                uuid: Uuid::new_v4().to_string(),
                sink,
                ifd_count: 0,
            },
        );
        self.state.open(&canonical_path);
        self.current = Some(canonical_path);
        self.setup_ifd()
    }

    /// Redirect subsequent planes to a different output file.
    pub fn change_output_file(&mut self, path: &Path) -> OmeTiffResult<()> {
        self.state.assert_open()?;
        self.set_id(path)
    }

    pub fn set_series(&mut self, series: usize) -> OmeTiffResult<()> {
        let count = self.series_count()?;
        if self.state.set_series(series, count)? {
            self.next_ifd()?;
            self.setup_ifd()?;
        }
        Ok(())
    }

    pub fn set_resolution(&mut self, resolution: usize) -> OmeTiffResult<()> {
        let count = self.resolution_count()?;
        if self.state.set_resolution(resolution, count)? {
            self.next_sub_ifd()?;
            self.setup_ifd()?;
        }
        Ok(())
    }

    pub fn set_plane(&mut self, plane: usize) -> OmeTiffResult<()> {
        let count = self.image_count()?;
        if self.state.set_plane(plane, count)? {
            self.next_ifd()?;
            self.setup_ifd()?;
        }
        Ok(())
    }

    /// Flush the current directory onto the main IFD chain.
    fn next_ifd(&mut self) -> OmeTiffResult<()> {
        let state = self.current_state_mut()?;
        state.sink.write_current_directory()?;
        state.ifd_count += 1;
        Ok(())
    }

    /// Flush the current directory into the pending SubIFD chain.
    fn next_sub_ifd(&mut self) -> OmeTiffResult<()> {
        let state = self.current_state_mut()?;
        state.sink.write_current_directory()?;
        Ok(())
    }

    /// Configure the directory under construction for the cursor's
    /// `(series, resolution, plane)`.
    fn setup_ifd(&mut self) -> OmeTiffResult<()> {
        let series = self.state.series()?;
        let resolution = self.state.resolution()?;
        let plane = self.state.plane()?;
        let size_x = self.size_x()?;
        let size_y = self.size_y()?;
        if size_x == 0 {
            return Err(FormatError::Format(String::from(
                "can't set strip or tile size: SizeX is 0",
            ))
            .into());
        }

        let meta = self.ome_meta()?;
        let order = meta
            .pixels_dimension_order(series)
            .unwrap_or(DimensionOrder::XYZCT);
        let size_z = meta.pixels_size_z(series)? as usize;
        let size_t = meta.pixels_size_t(series)? as usize;
        let eff_c = meta.channel_count(series).max(1);
        let image_count = size_z * size_t * eff_c;
        let coords = meta::zct_coords(order, size_z, eff_c, size_t, image_count, plane)?;
        let channel = coords[1];
        let samples = meta
            .channel_samples_per_pixel(series, channel)
            .unwrap_or(1)
            .max(1) as u16;
        let pixel_type = meta.pixels_type(series)?;
        let interleaved = self.state.interleaved;
        let compression_name = self.state.compression.clone();
        let resolution_count = self.resolution_count()?;

        let tile_size_x = self.state.tile_size_x;
        let tile_size_y = self.state.tile_size_y;

        let first_ifd = {
            let state = self.current_state()?;
            state.ifd_count == 0
        };

        let builder = self.current_state_mut()?.sink.current_directory();
        builder.set_image_width(size_x);
        builder.set_image_height(size_y);

        // Strip or tile policy: aim at chunks of roughly 64KiB, strips for
        // narrow rasters and 256×256 tiles otherwise; explicit sizes win.
        let layout = match (tile_size_x, tile_size_y) {
            (None, Some(rows)) => ChunkLayout::Strips {
                rows_per_strip: rows.max(1),
            },
            (Some(w), Some(h)) if w > 0 && h > 0 => ChunkLayout::Tiles {
                width: w,
                height: h,
            },
            (Some(_), Some(_)) => ChunkLayout::Strips { rows_per_strip: 1 },
            _ if size_x < STRIP_WIDTH_LIMIT => ChunkLayout::Strips {
                rows_per_strip: (DEFAULT_CHUNK_SIZE / size_x).max(1),
            },
            _ => ChunkLayout::Tiles {
                width: 256,
                height: 256,
            },
        };
        builder.set_chunk_layout(layout);

        builder.set_pixel_type(pixel_type, pixel_type.bits_per_pixel() as u16);
        builder.set_samples_per_pixel(samples);
        builder.set_planar_configuration(match interleaved {
            Some(true) => PlanarConfiguration::Chunky,
            _ => PlanarConfiguration::Planar,
        });
        builder.set_photometric_interpretation(if samples == 3 {
            PhotometricInterpretation::RGB
        } else {
            PhotometricInterpretation::BlackIsZero
        });
        if let Some(name) = &compression_name {
            builder.set_compression(compression::codec_scheme(name)?);
        }

        if first_ifd {
            builder.set_image_description(DEFAULT_DESCRIPTION);
        }

        if resolution == 0 {
            builder.set_subfile_type(SubfileType::PAGE);
            if resolution_count > 1 {
                builder.set_sub_ifd_count(resolution_count - 1);
            }
        } else {
            builder.set_subfile_type(SubfileType::PAGE | SubfileType::REDUCED_IMAGE);
        }
        Ok(())
    }

    /// Plane index of `(z, c, t)` under the current series' dimension
    /// order.
    pub fn index_of(&self, z: usize, c: usize, t: usize) -> OmeTiffResult<usize> {
        let series = self.state.series()?;
        let meta = self.ome_meta()?;
        let order = meta.pixels_dimension_order(series)?;
        let size_z = meta.pixels_size_z(series)? as usize;
        let size_t = meta.pixels_size_t(series)? as usize;
        let eff_c = meta.channel_count(series).max(1);
        meta::plane_index(order, size_z, eff_c, size_t, size_z * size_t * eff_c, z, c, t)
    }

    /// `(z, c, t)` coordinates of a plane index.
    pub fn zct_coords_of(&self, index: usize) -> OmeTiffResult<[usize; 3]> {
        let series = self.state.series()?;
        let meta = self.ome_meta()?;
        let order = meta.pixels_dimension_order(series)?;
        let size_z = meta.pixels_size_z(series)? as usize;
        let size_t = meta.pixels_size_t(series)? as usize;
        let eff_c = meta.channel_count(series).max(1);
        meta::zct_coords(order, size_z, eff_c, size_t, size_z * size_t * eff_c, index)
    }

    /// Write a full plane.
    pub fn save_bytes(
        &mut self,
        plane: usize,
        buf: &VariantPixelBuffer<'_>,
    ) -> OmeTiffResult<()> {
        let (w, h) = (self.size_x()?, self.size_y()?);
        self.save_bytes_region(plane, buf, 0, 0, w, h)
    }

    /// Write a rectangular region of a plane.
    pub fn save_bytes_region(
        &mut self,
        plane: usize,
        buf: &VariantPixelBuffer<'_>,
        x: u32,
        y: u32,
        w: u32,
        h: u32,
    ) -> OmeTiffResult<()> {
        self.state.assert_open()?;
        self.set_plane(plane)?;
        let series = self.state.series()?;
        let resolution = self.state.resolution()?;

        {
            let state = self.current_state_mut()?;
            state.sink.current_directory().write_region(x, y, w, h, buf)?;
        }

        if resolution == 0 {
            let (id, index) = {
                let state = self.current_state()?;
                (state.sink.path().to_path_buf(), state.ifd_count)
            };
            let plane_state = self
                .series_state
                .get_mut(series)
                .and_then(|s| s.planes.get_mut(plane))
                .ok_or(UsageError::PlaneOutOfRange { plane, count: 0 })?;
            plane_state.id = Some(id);
            plane_state.ifd = index;
            plane_state.status = PlaneStatus::Present;
        }
        Ok(())
    }

    /// Finalise the dataset.
    ///
    /// Flushes the last directory, refuses to proceed while any plane is
    /// unwritten, regenerates each file's OME-XML with `TiffData`/`UUID`
    /// cross-references, and patches it into the reserved
    /// `ImageDescription` of every file. Idempotent.
    pub fn close(&mut self) -> OmeTiffResult<()> {
        let result = self.close_inner();
        self.reset();
        result
    }

    fn close_inner(&mut self) -> OmeTiffResult<()> {
        if self.state.current_id().is_none() {
            return Ok(());
        }

        // Flush the final IFD without opening a new one.
        if self.current.is_some() {
            self.next_ifd()?;
            self.current = None;
        }

        self.fill_tiff_data()?;

        let paths: Vec<PathBuf> = self.tiffs.keys().cloned().collect();
        for path in paths {
            let xml = self.ome_xml_for(&path)?;
            if let Some(state) = self.tiffs.get_mut(&path) {
                // Make sure buffered output reaches the file before it is
                // patched through a second handle.
                state.sink.close()?;
            }
            self.tiffs.remove(&path);
            save_comment(&path, &xml)?;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.state.close();
        self.tiffs.clear();
        self.current = None;
        self.series_state.clear();
        self.resolution_levels.clear();
        self.ome_meta = None;
        self.metadata_retrieve = None;
        self.big_flag = None;
        self.big_tiff = None;
    }

    /// Regenerate the `TiffData` elements from the recorded plane states.
    fn fill_tiff_data(&mut self) -> OmeTiffResult<()> {
        let bad_planes = self
            .series_state
            .iter()
            .flat_map(|series| series.planes.iter())
            .filter(|plane| plane.status != PlaneStatus::Present)
            .count();
        if bad_planes > 0 {
            return Err(UsageError::IncompletePlanes(bad_planes).into());
        }

        let mut ome = self
            .ome_meta
            .take()
            .ok_or(UsageError::MetadataMissing("OMEXMLMetadata"))?;
        ome.remove_bin_data();
        ome.remove_tiff_data();

        for series in 0..self.series_state.len() {
            let order = ome
                .pixels_dimension_order(series)
                .unwrap_or(DimensionOrder::XYZCT);
            let size_z = ome.pixels_size_z(series)? as usize;
            let size_t = ome.pixels_size_t(series)? as usize;
            let eff_c = ome.channel_count(series).max(1);
            let image_count = size_z * size_t * eff_c;

            if image_count == 0 {
                ome.set_tiff_data_plane_count(0, series, 0);
                continue;
            }

            for plane in 0..image_count {
                let coords = meta::zct_coords(order, size_z, eff_c, size_t, image_count, plane)?;
                let plane_state = &self.series_state[series].planes[plane];
                let id = plane_state
                    .id
                    .clone()
                    .ok_or(UsageError::IncompletePlanes(1))?;
                let tiff_state = self
                    .tiffs
                    .get(&id)
                    .ok_or_else(|| UsageError::UnregisteredFile(id.clone()))?;

                let relative = make_relative(&self.base_dir, &id);
                let uuid = format!("urn:uuid:{}", tiff_state.uuid);
                ome.set_uuid_file_name(&relative, series, plane);
                ome.set_uuid_value(&uuid, series, plane);
                ome.set_tiff_data_first_z(coords[0] as u32, series, plane);
                ome.set_tiff_data_first_t(coords[2] as u32, series, plane);
                ome.set_tiff_data_first_c(coords[1] as u32, series, plane);
                ome.set_tiff_data_ifd(plane_state.ifd as u64, series, plane);
                ome.set_tiff_data_plane_count(1, series, plane);
            }
        }

        self.ome_meta = Some(ome);
        Ok(())
    }

    /// The OME-XML document for one output file, carrying that file's UUID
    /// as the document UUID.
    fn ome_xml_for(&mut self, path: &Path) -> OmeTiffResult<String> {
        let uuid = self
            .tiffs
            .get(path)
            .map(|state| state.uuid.clone())
            .ok_or_else(|| UsageError::UnregisteredFile(path.to_path_buf()))?;
        let ome = self
            .ome_meta
            .as_mut()
            .ok_or(UsageError::MetadataMissing("OMEXMLMetadata"))?;
        ome.set_uuid(&format!("urn:uuid:{}", uuid));
        xml::serialize_ome_xml(ome)
    }
}

impl Drop for OmeTiffWriter {
    fn drop(&mut self) {
        // Errors are swallowed during unwinding.
        let _ = self.close();
    }
}

/// Expected pixel payload of the whole dataset in bytes.
fn significant_pixel_size(meta: &OmeXmlMetadata) -> u64 {
    let mut total = 0u64;
    for series in 0..meta.image_count() {
        let x = meta.pixels_size_x(series).unwrap_or(0) as u64;
        let y = meta.pixels_size_y(series).unwrap_or(0) as u64;
        let z = meta.pixels_size_z(series).unwrap_or(1) as u64;
        let t = meta.pixels_size_t(series).unwrap_or(1) as u64;
        let c = meta.pixels_size_c(series).unwrap_or(1) as u64;
        let bytes = meta
            .pixels_type(series)
            .map(|pt| pt.byte_size() as u64)
            .unwrap_or(1);
        total = total.saturating_add(x * y * z * t * c * bytes);
    }
    total
}

/// Express `path` relative to `base`, falling back to the bare file name.
fn make_relative(base: &Path, path: &Path) -> String {
    let relative = path
        .strip_prefix(base)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| {
            path.file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| path.to_path_buf())
        });
    relative.to_string_lossy().replace('\\', "/")
}

fn read_u16_at(file: &mut std::fs::File, offset: u64, endian: EndianType) -> OmeTiffResult<u16> {
    file.seek(SeekFrom::Start(offset))?;
    let mut bytes = [0u8; 2];
    file.read_exact(&mut bytes)?;
    Ok(match endian.resolve() {
        EndianType::Little => u16::from_le_bytes(bytes),
        _ => u16::from_be_bytes(bytes),
    })
}

fn read_u32_at(file: &mut std::fs::File, offset: u64, endian: EndianType) -> OmeTiffResult<u32> {
    file.seek(SeekFrom::Start(offset))?;
    let mut bytes = [0u8; 4];
    file.read_exact(&mut bytes)?;
    Ok(match endian.resolve() {
        EndianType::Little => u32::from_le_bytes(bytes),
        _ => u32::from_be_bytes(bytes),
    })
}

fn read_u64_at(file: &mut std::fs::File, offset: u64, endian: EndianType) -> OmeTiffResult<u64> {
    file.seek(SeekFrom::Start(offset))?;
    let mut bytes = [0u8; 8];
    file.read_exact(&mut bytes)?;
    Ok(match endian.resolve() {
        EndianType::Little => u64::from_le_bytes(bytes),
        _ => u64::from_be_bytes(bytes),
    })
}

fn write_u32_at(
    file: &mut std::fs::File,
    offset: u64,
    endian: EndianType,
    value: u32,
) -> OmeTiffResult<()> {
    file.seek(SeekFrom::Start(offset))?;
    let bytes = match endian.resolve() {
        EndianType::Little => value.to_le_bytes(),
        _ => value.to_be_bytes(),
    };
    file.write_all(&bytes)?;
    Ok(())
}

fn write_u64_at(
    file: &mut std::fs::File,
    offset: u64,
    endian: EndianType,
    value: u64,
) -> OmeTiffResult<()> {
    file.seek(SeekFrom::Start(offset))?;
    let bytes = match endian.resolve() {
        EndianType::Little => value.to_le_bytes(),
        _ => value.to_be_bytes(),
    };
    file.write_all(&bytes)?;
    Ok(())
}

/// Patch the finalised OME-XML into a closed file's first
/// `ImageDescription`.
///
/// The XML is appended at end-of-file with a trailing NUL; the reserved
/// entry's count and offset fields are then overwritten in place, which
/// cannot perturb the IFD layout.
fn save_comment(path: &Path, xml: &str) -> OmeTiffResult<()> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;

    let mut marker = [0u8; 2];
    file.read_exact(&mut marker)?;
    let endian = match &marker {
        b"II" => EndianType::Little,
        b"MM" => EndianType::Big,
        _ => return Err(FormatError::TiffSignatureInvalid.into()),
    };

    let version = read_u16_at(&mut file, 2, endian)?;
    let big = match version {
        0x2A => false,
        0x2B => true,
        other => return Err(FormatError::TiffVersionInvalid(other).into()),
    };

    if big {
        let offset_size = read_u16_at(&mut file, 4, endian)?;
        if offset_size != 8 {
            return Err(FormatError::OffsetSizeInvalid(offset_size).into());
        }
    }

    let ifd0 = if big {
        read_u64_at(&mut file, 8, endian)?
    } else {
        u64::from(read_u32_at(&mut file, 4, endian)?)
    };

    // Append the XML text with a NUL terminator, noting its offset.
    let desc_offset = file.seek(SeekFrom::End(0))?;
    file.write_all(xml.as_bytes())?;
    file.write_all(&[0])?;

    let entries = if big {
        read_u64_at(&mut file, ifd0, endian)?
    } else {
        u64::from(read_u16_at(&mut file, ifd0, endian)?)
    };

    let mut found = false;
    for i in 0..entries {
        let tag_off = if big {
            ifd0 + 8 + i * 20
        } else {
            ifd0 + 2 + i * 12
        };
        let tag_id = read_u16_at(&mut file, tag_off, endian)?;
        if tag_id != Tag::ImageDescription.to_u16() {
            continue;
        }
        found = true;

        let tag_type = read_u16_at(&mut file, tag_off + 2, endian)?;
        if tag_type != Type::ASCII.to_u16() {
            return Err(FormatError::ImageDescriptionNotAscii(
                Type::from_u16(tag_type).unwrap_or(Type::UNDEFINED),
            )
            .into());
        }

        let count = if big {
            read_u64_at(&mut file, tag_off + 4, endian)?
        } else {
            u64::from(read_u32_at(&mut file, tag_off + 4, endian)?)
        };
        let expected = DEFAULT_DESCRIPTION.len() as u64 + 1;
        if count != expected {
            return Err(FormatError::ImageDescriptionLength {
                actual: count,
                expected,
            }
            .into());
        }

        let new_count = xml.len() as u64 + 1;
        if big {
            write_u64_at(&mut file, tag_off + 4, endian, new_count)?;
            write_u64_at(&mut file, tag_off + 12, endian, desc_offset)?;
        } else {
            write_u32_at(&mut file, tag_off + 4, endian, u32::try_from(new_count)?)?;
            write_u32_at(&mut file, tag_off + 8, endian, u32::try_from(desc_offset)?)?;
        }
    }

    if !found {
        return Err(FormatError::ImageDescriptionNotFound.into());
    }
    file.sync_all()?;
    Ok(())
}
