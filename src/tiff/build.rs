//! Construction of one output directory: tag collection and buffered chunk
//! writes.

use std::collections::BTreeMap;

use crate::error::{OmeTiffError, OmeTiffResult, UsageError};
use crate::pixel::{
    EndianType, PixelBuffer, PixelElement, PixelType, VariantPixelBuffer,
};
use crate::tags::{
    CompressionMethod, PhotometricInterpretation, PlanarConfiguration, SubfileType, Tag, Type,
};
use crate::tiff::compression;
use crate::tiff::ifd::ChunkLayout;

/// A serialised entry ready for the directory writer: on-disk type, element
/// count and the native-endian payload bytes.
#[derive(Debug, Clone)]
pub(crate) struct RawEntry {
    pub ty: Type,
    pub count: u64,
    pub payload: Vec<u8>,
}

/// The completed content of one directory.
pub(crate) struct FinishedDirectory {
    pub entries: BTreeMap<u16, RawEntry>,
    /// Compressed chunk data in chunk-index order.
    pub chunks: Vec<Vec<u8>>,
    pub tiled: bool,
    pub sub_ifd_count: usize,
}

fn native_u16s(values: &[u16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 2);
    for value in values {
        bytes.extend_from_slice(&value.to_ne_bytes());
    }
    bytes
}

fn native_u32s(values: &[u32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for value in values {
        bytes.extend_from_slice(&value.to_ne_bytes());
    }
    bytes
}

/// Serialise `u64` values at the width of `ty`, checking narrowing.
pub(crate) fn raw_entry_u64s(ty: Type, values: &[u64]) -> OmeTiffResult<RawEntry> {
    let mut payload = Vec::with_capacity(values.len() * usize::from(ty.byte_len()));
    for value in values {
        match ty {
            Type::LONG8 | Type::IFD8 => payload.extend_from_slice(&value.to_ne_bytes()),
            Type::LONG | Type::IFD => {
                payload.extend_from_slice(&u32::try_from(*value)?.to_ne_bytes())
            }
            Type::SHORT => payload.extend_from_slice(&u16::try_from(*value)?.to_ne_bytes()),
            _ => return Err(OmeTiffError::IntSizeError),
        }
    }
    Ok(RawEntry {
        ty,
        count: values.len() as u64,
        payload,
    })
}

fn ascii_entry(text: &str) -> RawEntry {
    let mut payload = text.as_bytes().to_vec();
    payload.push(0);
    RawEntry {
        ty: Type::ASCII,
        count: payload.len() as u64,
        payload,
    }
}

fn short_entry(values: &[u16]) -> RawEntry {
    RawEntry {
        ty: Type::SHORT,
        count: values.len() as u64,
        payload: native_u16s(values),
    }
}

fn long_entry(values: &[u32]) -> RawEntry {
    RawEntry {
        ty: Type::LONG,
        count: values.len() as u64,
        payload: native_u32s(values),
    }
}

/// One output directory under construction.
///
/// Raster geometry, pixel format and chunking are set through the typed
/// setters; pixel data is accumulated through [`DirectoryBuilder::write_region`]
/// into per-chunk buffers which are compressed when the directory is
/// flushed.
#[derive(Debug, Default)]
pub struct DirectoryBuilder {
    width: Option<u32>,
    height: Option<u32>,
    layout: Option<ChunkLayout>,
    pixel_type: Option<PixelType>,
    bits_per_sample: Option<u16>,
    samples: u16,
    planar: Option<PlanarConfiguration>,
    photometric: Option<PhotometricInterpretation>,
    compression: Option<CompressionMethod>,
    description: Option<String>,
    software: Option<String>,
    subfile_type: Option<SubfileType>,
    sub_ifd_count: usize,
    extra: BTreeMap<u16, RawEntry>,
    chunks: BTreeMap<usize, Vec<u8>>,
}

impl DirectoryBuilder {
    pub fn new() -> DirectoryBuilder {
        DirectoryBuilder::default()
    }

    pub fn set_image_width(&mut self, width: u32) {
        self.width = Some(width);
    }

    pub fn set_image_height(&mut self, height: u32) {
        self.height = Some(height);
    }

    pub fn set_chunk_layout(&mut self, layout: ChunkLayout) {
        self.layout = Some(layout);
    }

    /// Set the pixel type, deriving `BitsPerSample` and `SampleFormat`.
    ///
    /// `bits` may narrow the significant bits below the type's natural
    /// width.
    pub fn set_pixel_type(&mut self, pixel_type: PixelType, bits: u16) {
        self.pixel_type = Some(pixel_type);
        self.bits_per_sample = Some(bits);
    }

    pub fn set_samples_per_pixel(&mut self, samples: u16) {
        self.samples = samples;
    }

    pub fn set_planar_configuration(&mut self, planar: PlanarConfiguration) {
        self.planar = Some(planar);
    }

    pub fn set_photometric_interpretation(&mut self, photometric: PhotometricInterpretation) {
        self.photometric = Some(photometric);
    }

    pub fn set_compression(&mut self, compression: CompressionMethod) {
        self.compression = Some(compression);
    }

    pub fn set_image_description(&mut self, description: &str) {
        self.description = Some(description.to_string());
    }

    pub fn set_software(&mut self, software: &str) {
        self.software = Some(software.to_string());
    }

    pub fn set_subfile_type(&mut self, subfile_type: SubfileType) {
        self.subfile_type = Some(subfile_type);
    }

    /// Reserve `count` SubIFD slots for reduced-resolution directories that
    /// will follow this one.
    pub fn set_sub_ifd_count(&mut self, count: usize) {
        self.sub_ifd_count = count;
    }

    /// Add an arbitrary 16-bit entry.
    pub fn set_u16_field(&mut self, tag: Tag, values: &[u16]) {
        self.extra.insert(tag.to_u16(), short_entry(values));
    }

    /// Add an arbitrary 32-bit entry.
    pub fn set_u32_field(&mut self, tag: Tag, values: &[u32]) {
        self.extra.insert(tag.to_u16(), long_entry(values));
    }

    /// Add an arbitrary string entry.
    pub fn set_ascii_field(&mut self, tag: Tag, text: &str) {
        self.extra.insert(tag.to_u16(), ascii_entry(text));
    }

    /// Whether nothing has been configured or written yet.
    pub(crate) fn is_empty(&self) -> bool {
        self.width.is_none()
            && self.height.is_none()
            && self.layout.is_none()
            && self.pixel_type.is_none()
            && self.description.is_none()
            && self.software.is_none()
            && self.subfile_type.is_none()
            && self.sub_ifd_count == 0
            && self.extra.is_empty()
            && self.chunks.is_empty()
    }

    pub fn image_width(&self) -> Option<u32> {
        self.width
    }

    pub fn image_height(&self) -> Option<u32> {
        self.height
    }

    pub fn chunk_layout(&self) -> Option<ChunkLayout> {
        self.layout
    }

    fn geometry(&self) -> OmeTiffResult<(u32, u32, ChunkLayout, PixelType, u16)> {
        let width = self
            .width
            .ok_or(UsageError::MetadataMissing("ImageWidth"))?;
        let height = self
            .height
            .ok_or(UsageError::MetadataMissing("ImageLength"))?;
        let layout = self
            .layout
            .ok_or(UsageError::MetadataMissing("RowsPerStrip"))?;
        let pixel_type = self
            .pixel_type
            .ok_or(UsageError::MetadataMissing("BitsPerSample"))?;
        let samples = self.samples.max(1);
        Ok((width, height, layout, pixel_type, samples))
    }

    fn chunks_per_plane(width: u32, height: u32, layout: ChunkLayout) -> usize {
        match layout {
            ChunkLayout::Strips { rows_per_strip } => {
                (height as usize).div_ceil(rows_per_strip as usize)
            }
            ChunkLayout::Tiles { width: tw, height: th } => {
                (width as usize).div_ceil(tw as usize) * (height as usize).div_ceil(th as usize)
            }
        }
    }

    /// Write a rectangular region of pixel data into the chunk buffers.
    ///
    /// The buffer must hold `w`×`h` pixels of the directory's pixel type
    /// with one sample column per declared sample.
    pub fn write_region(
        &mut self,
        x: u32,
        y: u32,
        w: u32,
        h: u32,
        buf: &VariantPixelBuffer<'_>,
    ) -> OmeTiffResult<()> {
        let (width, height, layout, pixel_type, samples) = self.geometry()?;
        if w == 0
            || h == 0
            || x.checked_add(w).map_or(true, |e| e > width)
            || y.checked_add(h).map_or(true, |e| e > height)
        {
            return Err(UsageError::InvalidRegion { x, y, w, h }.into());
        }
        if buf.pixel_type() != pixel_type {
            return Err(crate::error::UnsupportedError::WrongPixelType {
                expected: pixel_type,
                actual: buf.pixel_type(),
            }
            .into());
        }
        let extents = crate::pixel::plane_extents(w as usize, h as usize, samples as usize);
        if buf.extents() != &extents {
            return Err(UsageError::BufferShapeMismatch.into());
        }

        let planar = self.planar.unwrap_or(PlanarConfiguration::Chunky);
        let (passes, chunk_samples) = match planar {
            PlanarConfiguration::Chunky => (1usize, samples as usize),
            PlanarConfiguration::Planar => (samples as usize, 1usize),
        };
        let per_plane = Self::chunks_per_plane(width, height, layout);
        let bits = match pixel_type {
            PixelType::Bit => 1,
            _ => (pixel_type.byte_size() * 8) as u16,
        };

        for pass in 0..passes {
            for (chunk, region) in
                super::ifd::chunk_cover(layout, width, height, x, y, w, h)
            {
                let index = pass * per_plane + chunk;
                let len = super::ifd::chunk_byte_len(
                    layout,
                    width,
                    height,
                    chunk,
                    chunk_samples,
                    bits,
                );
                let data = self.chunks.entry(index).or_insert_with(|| vec![0u8; len]);
                gather_chunk(
                    buf,
                    data,
                    layout,
                    width,
                    chunk,
                    region,
                    (x, y),
                    chunk_samples,
                    pass,
                    bits,
                )?;
            }
        }
        Ok(())
    }

    /// Finish the directory: compress the chunk buffers and emit the entry
    /// table.
    pub(crate) fn finish(self) -> OmeTiffResult<FinishedDirectory> {
        let mut entries = self.extra;
        let mut tiled = false;
        let mut chunks = Vec::new();

        // A directory without raster geometry (the writer's trailing flush)
        // serialises whatever entries it carries.
        if let (Some(width), Some(height), Some(layout), Some(pixel_type)) =
            (self.width, self.height, self.layout, self.pixel_type)
        {
            let samples = self.samples.max(1);
            let planar = self.planar.unwrap_or(PlanarConfiguration::Chunky);
            let compression = self.compression.unwrap_or(CompressionMethod::None);
            let bits = self
                .bits_per_sample
                .unwrap_or((pixel_type.byte_size() * 8) as u16);
            entries.insert(Tag::ImageWidth.to_u16(), long_entry(&[width]));
            entries.insert(Tag::ImageLength.to_u16(), long_entry(&[height]));
            entries.insert(
                Tag::BitsPerSample.to_u16(),
                short_entry(&vec![bits.max(1); samples as usize]),
            );
            entries.insert(
                Tag::SampleFormat.to_u16(),
                short_entry(&vec![pixel_type.sample_format().to_u16(); samples as usize]),
            );
            entries.insert(
                Tag::Compression.to_u16(),
                short_entry(&[compression.to_u16()]),
            );
            entries.insert(
                Tag::PhotometricInterpretation.to_u16(),
                short_entry(&[self
                    .photometric
                    .unwrap_or(PhotometricInterpretation::BlackIsZero)
                    .to_u16()]),
            );
            entries.insert(Tag::SamplesPerPixel.to_u16(), short_entry(&[samples]));
            entries.insert(Tag::PlanarConfiguration.to_u16(), short_entry(&[planar.to_u16()]));
            match layout {
                ChunkLayout::Strips { rows_per_strip } => {
                    entries.insert(Tag::RowsPerStrip.to_u16(), long_entry(&[rows_per_strip]));
                }
                ChunkLayout::Tiles { width: tw, height: th } => {
                    tiled = true;
                    entries.insert(Tag::TileWidth.to_u16(), long_entry(&[tw]));
                    entries.insert(Tag::TileLength.to_u16(), long_entry(&[th]));
                }
            }

            // Every chunk is emitted, zero-filled when nothing was written.
            let per_plane = Self::chunks_per_plane(width, height, layout);
            let planes = match planar {
                PlanarConfiguration::Chunky => 1usize,
                PlanarConfiguration::Planar => samples as usize,
            };
            let chunk_samples = match planar {
                PlanarConfiguration::Chunky => samples as usize,
                PlanarConfiguration::Planar => 1usize,
            };
            let mut buffers = self.chunks;
            for index in 0..per_plane * planes {
                let data = buffers.remove(&index).unwrap_or_else(|| {
                    let len = super::ifd::chunk_byte_len(
                        layout,
                        width,
                        height,
                        index % per_plane,
                        chunk_samples,
                        match pixel_type {
                            PixelType::Bit => 1,
                            _ => (pixel_type.byte_size() * 8) as u16,
                        },
                    );
                    vec![0u8; len]
                });
                chunks.push(compression::compress(compression, &data)?);
            }
        }

        if let Some(description) = &self.description {
            entries.insert(Tag::ImageDescription.to_u16(), ascii_entry(description));
        }
        if let Some(software) = &self.software {
            entries.insert(Tag::Software.to_u16(), ascii_entry(software));
        }
        if let Some(subfile_type) = self.subfile_type {
            entries.insert(Tag::NewSubfileType.to_u16(), long_entry(&[subfile_type.0]));
        }

        Ok(FinishedDirectory {
            entries,
            chunks,
            tiled,
            sub_ifd_count: self.sub_ifd_count,
        })
    }
}

/// Copy the intersecting part of the source buffer into a chunk buffer,
/// packing elements in native byte order.
#[allow(clippy::too_many_arguments)]
fn gather_chunk(
    buf: &VariantPixelBuffer<'_>,
    data: &mut [u8],
    layout: ChunkLayout,
    width: u32,
    chunk: usize,
    region: super::ifd::Region,
    roi_origin: (u32, u32),
    chunk_samples: usize,
    pass: usize,
    bits: u16,
) -> OmeTiffResult<()> {
    let (chunk_x, chunk_y) = super::ifd::chunk_origin(layout, width, chunk);
    let row_pixels = super::ifd::chunk_row_pixels(layout, width);

    if bits == 1 {
        let source: &PixelBuffer<'_, bool> = buf.array()?;
        let row_bytes = super::ifd::row_byte_len(row_pixels, chunk_samples, 1);
        for row in 0..region.h {
            let dst_row = (region.y + row - chunk_y) as usize;
            for col in 0..region.w {
                let dst_col = (region.x + col - chunk_x) as usize;
                for s in 0..chunk_samples {
                    let src = [
                        (region.x + col - roi_origin.0) as i64,
                        (region.y + row - roi_origin.1) as i64,
                        0,
                        (pass * chunk_samples + s) as i64,
                        0,
                        0,
                        0,
                        0,
                        0,
                    ];
                    let bit = dst_row * row_bytes * 8 + dst_col * chunk_samples + s;
                    if *source.at(src)? {
                        data[bit / 8] |= 1 << (7 - (bit % 8));
                    } else {
                        data[bit / 8] &= !(1 << (7 - (bit % 8)));
                    }
                }
            }
        }
        return Ok(());
    }

    struct Gather<'a> {
        data: &'a mut [u8],
        region: super::ifd::Region,
        chunk_origin: (u32, u32),
        roi_origin: (u32, u32),
        row_pixels: usize,
        chunk_samples: usize,
        pass: usize,
        element_len: usize,
    }

    impl crate::pixel::PixelVisitor for Gather<'_> {
        type Output = OmeTiffResult<()>;

        fn visit<T: PixelElement>(self, buffer: &PixelBuffer<'_, T>) -> OmeTiffResult<()> {
            let row_bytes = self.row_pixels * self.chunk_samples * self.element_len;
            for row in 0..self.region.h {
                let dst_row = (self.region.y + row - self.chunk_origin.1) as usize;
                for col in 0..self.region.w {
                    let dst_col = (self.region.x + col - self.chunk_origin.0) as usize;
                    for s in 0..self.chunk_samples {
                        let src = [
                            (self.region.x + col - self.roi_origin.0) as i64,
                            (self.region.y + row - self.roi_origin.1) as i64,
                            0,
                            (self.pass * self.chunk_samples + s) as i64,
                            0,
                            0,
                            0,
                            0,
                            0,
                        ];
                        let value = *buffer.at(src)?;
                        let pos = dst_row * row_bytes
                            + (dst_col * self.chunk_samples + s) * self.element_len;
                        let mut slice = &mut self.data[pos..pos + self.element_len];
                        value.write_element(&mut slice, EndianType::Native)?;
                    }
                }
            }
            Ok(())
        }
    }

    let element_len = buf.pixel_type().byte_size();
    buf.visit(Gather {
        data,
        region,
        chunk_origin: (chunk_x, chunk_y),
        roi_origin,
        row_pixels,
        chunk_samples,
        pass,
        element_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixel::plane_extents;

    fn plane_buffer(w: usize, h: usize) -> VariantPixelBuffer<'static> {
        let mut buf = VariantPixelBuffer::new(PixelType::UInt8, plane_extents(w, h, 1));
        for (i, value) in buf.data_mut::<u8>().unwrap().iter_mut().enumerate() {
            *value = i as u8;
        }
        buf
    }

    #[test]
    fn region_writes_fill_strip_chunks() {
        let mut builder = DirectoryBuilder::new();
        builder.set_image_width(4);
        builder.set_image_height(4);
        builder.set_chunk_layout(ChunkLayout::Strips { rows_per_strip: 2 });
        builder.set_pixel_type(PixelType::UInt8, 8);
        builder.set_samples_per_pixel(1);

        let buf = plane_buffer(4, 4);
        builder.write_region(0, 0, 4, 4, &buf).unwrap();

        let finished = builder.finish().unwrap();
        assert_eq!(finished.chunks.len(), 2);
        assert_eq!(finished.chunks[0], (0u8..8).collect::<Vec<_>>());
        assert_eq!(finished.chunks[1], (8u8..16).collect::<Vec<_>>());
        assert!(!finished.tiled);
    }

    #[test]
    fn unwritten_chunks_are_zero_filled() {
        let mut builder = DirectoryBuilder::new();
        builder.set_image_width(4);
        builder.set_image_height(4);
        builder.set_chunk_layout(ChunkLayout::Strips { rows_per_strip: 2 });
        builder.set_pixel_type(PixelType::UInt8, 8);

        let buf = plane_buffer(4, 2);
        builder.write_region(0, 0, 4, 2, &buf).unwrap();

        let finished = builder.finish().unwrap();
        assert_eq!(finished.chunks.len(), 2);
        assert_eq!(finished.chunks[1], vec![0u8; 8]);
    }

    #[test]
    fn region_mismatch_is_rejected() {
        let mut builder = DirectoryBuilder::new();
        builder.set_image_width(4);
        builder.set_image_height(4);
        builder.set_chunk_layout(ChunkLayout::Strips { rows_per_strip: 4 });
        builder.set_pixel_type(PixelType::UInt8, 8);

        let buf = plane_buffer(4, 4);
        assert!(builder.write_region(2, 2, 4, 4, &buf).is_err());

        let wrong_type = VariantPixelBuffer::new(PixelType::UInt16, plane_extents(4, 4, 1));
        assert!(builder.write_region(0, 0, 4, 4, &wrong_type).is_err());
    }

    #[test]
    fn tiles_are_padded_to_full_size() {
        let mut builder = DirectoryBuilder::new();
        builder.set_image_width(6);
        builder.set_image_height(6);
        builder.set_chunk_layout(ChunkLayout::Tiles {
            width: 4,
            height: 4,
        });
        builder.set_pixel_type(PixelType::UInt8, 8);

        let buf = plane_buffer(6, 6);
        builder.write_region(0, 0, 6, 6, &buf).unwrap();

        let finished = builder.finish().unwrap();
        assert_eq!(finished.chunks.len(), 4);
        for chunk in &finished.chunks {
            assert_eq!(chunk.len(), 16);
        }
        assert!(finished.tiled);
    }
}
