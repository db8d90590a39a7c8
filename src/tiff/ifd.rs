//! Image file directories: entry decoding and raster region readback.

use std::collections::BTreeMap;
use std::io::{Read, Seek};

use crate::error::{FormatError, OmeTiffResult, UsageError};
use crate::pixel::{
    EndianType, PixelBuffer, PixelElement, PixelType, StorageOrder, VariantPixelBuffer,
};
use crate::meta::DimensionOrder;
use crate::tags::{
    CompressionMethod, PhotometricInterpretation, PlanarConfiguration, SampleFormat, Tag, Type,
};
use crate::tiff::compression;
use crate::tiff::field::CountPolicy;
use crate::tiff::stream::EndianReader;
use crate::tiff::Tiff;

/// A decoded IFD entry value.
///
/// `IFD`/`IFD8` entries decode into the `Long`/`Long8` arms; the original
/// on-disk type is retained in [`Entry::ty`] for width probing.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Byte(Vec<u8>),
    Ascii(Vec<u8>),
    Short(Vec<u16>),
    Long(Vec<u32>),
    Long8(Vec<u64>),
    SByte(Vec<i8>),
    SShort(Vec<i16>),
    SLong(Vec<i32>),
    SLong8(Vec<i64>),
    Rational(Vec<(u32, u32)>),
    SRational(Vec<(i32, i32)>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    Undefined(Vec<u8>),
}

/// One IFD entry: the on-disk type and count plus the decoded value.
#[derive(Debug, Clone)]
pub struct Entry {
    pub ty: Type,
    pub count: u64,
    pub value: Value,
}

impl Entry {
    /// Decode an entry whose raw value field has been captured.
    ///
    /// `raw` is the 4-byte (classic) or 8-byte (BigTIFF) inline value field;
    /// larger values are fetched from the offset it contains.
    pub(crate) fn decode<R: Read + Seek>(
        reader: &mut EndianReader<R>,
        big: bool,
        ty: Type,
        count: u64,
        raw: [u8; 8],
    ) -> OmeTiffResult<Entry> {
        let inline = if big { 8 } else { 4 };
        let value_bytes = count
            .checked_mul(u64::from(ty.byte_len()))
            .ok_or(crate::error::OmeTiffError::IntSizeError)?;

        let bytes = if value_bytes <= inline {
            raw[..value_bytes as usize].to_vec()
        } else {
            let mut cursor = EndianReader::new(std::io::Cursor::new(raw), reader.endian());
            let offset = if big {
                cursor.read_u64()?
            } else {
                u64::from(cursor.read_u32()?)
            };
            reader.goto_offset(offset)?;
            let mut bytes = vec![0u8; usize::try_from(value_bytes)?];
            reader.read_bytes(&mut bytes)?;
            bytes
        };

        let mut r = EndianReader::new(std::io::Cursor::new(bytes), reader.endian());
        let n = usize::try_from(count)?;
        let value = match ty {
            Type::BYTE => Value::Byte(read_vec(n, || r.read_u8())?),
            Type::ASCII => {
                let mut bytes = vec![0u8; n];
                r.read_bytes(&mut bytes)?;
                Value::Ascii(bytes)
            }
            Type::UNDEFINED => {
                let mut bytes = vec![0u8; n];
                r.read_bytes(&mut bytes)?;
                Value::Undefined(bytes)
            }
            Type::SHORT => Value::Short(read_vec(n, || r.read_u16())?),
            Type::LONG | Type::IFD => Value::Long(read_vec(n, || r.read_u32())?),
            Type::LONG8 | Type::IFD8 => Value::Long8(read_vec(n, || r.read_u64())?),
            Type::SBYTE => Value::SByte(read_vec(n, || r.read_i8())?),
            Type::SSHORT => Value::SShort(read_vec(n, || r.read_i16())?),
            Type::SLONG => Value::SLong(read_vec(n, || r.read_i32())?),
            Type::SLONG8 => Value::SLong8(read_vec(n, || r.read_i64())?),
            Type::FLOAT => Value::Float(read_vec(n, || r.read_f32())?),
            Type::DOUBLE => Value::Double(read_vec(n, || r.read_f64())?),
            Type::RATIONAL => Value::Rational(read_vec(n, || {
                Ok::<_, std::io::Error>((r.read_u32()?, r.read_u32()?))
            })?),
            Type::SRATIONAL => Value::SRational(read_vec(n, || {
                Ok::<_, std::io::Error>((r.read_i32()?, r.read_i32()?))
            })?),
        };

        Ok(Entry { ty, count, value })
    }
}

fn read_vec<T, E, F>(count: usize, mut read: F) -> Result<Vec<T>, E>
where
    F: FnMut() -> Result<T, E>,
{
    let mut values = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        values.push(read()?);
    }
    Ok(values)
}

/// Strip or tile organisation of one raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkLayout {
    Strips { rows_per_strip: u32 },
    Tiles { width: u32, height: u32 },
}

/// One Image File Directory with all entry values decoded.
#[derive(Debug, Clone)]
pub struct Ifd {
    pub(crate) offset: u64,
    pub(crate) entries: BTreeMap<u16, Entry>,
    pub(crate) byte_order: EndianType,
    pub(crate) big: bool,
}

impl Ifd {
    /// Absolute file offset this directory was read from.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn contains(&self, tag: Tag) -> bool {
        self.entries.contains_key(&tag.to_u16())
    }

    pub fn entry(&self, tag: Tag) -> Option<&Entry> {
        self.entries.get(&tag.to_u16())
    }

    /// Raster width.
    pub fn image_width(&self) -> OmeTiffResult<u32> {
        self.u32_field(Tag::ImageWidth)
    }

    /// Raster height.
    pub fn image_height(&self) -> OmeTiffResult<u32> {
        self.u32_field(Tag::ImageLength)
    }

    pub fn samples_per_pixel(&self) -> OmeTiffResult<u16> {
        match self.entry(Tag::SamplesPerPixel) {
            Some(_) => self.u16_field(Tag::SamplesPerPixel),
            None => Ok(1),
        }
    }

    /// Bits per sample, uniform across samples.
    pub fn bits_per_sample(&self) -> OmeTiffResult<u16> {
        match self.entry(Tag::BitsPerSample) {
            None => Ok(1),
            Some(_) => {
                // Some writers get the count wrong; accept whatever count is
                // present and require the values to agree.
                let bits = self.u16_array_field(Tag::BitsPerSample, CountPolicy::Any)?;
                let first = *bits.first().ok_or(FormatError::FieldShapeMismatch {
                    tag: Tag::BitsPerSample,
                    ty: Type::SHORT,
                    count: 0,
                })?;
                if bits.iter().any(|b| *b != first) {
                    return Err(FormatError::Format(String::from(
                        "BitsPerSample values differ between samples",
                    ))
                    .into());
                }
                Ok(first)
            }
        }
    }

    pub fn sample_format(&self) -> OmeTiffResult<SampleFormat> {
        match self.entry(Tag::SampleFormat) {
            None => Ok(SampleFormat::Uint),
            Some(_) => {
                let formats = self.u16_array_field(Tag::SampleFormat, CountPolicy::Any)?;
                let first = formats.first().copied().unwrap_or(1);
                Ok(SampleFormat::from_u16_exhaustive(first))
            }
        }
    }

    /// The pixel type stored in this raster.
    pub fn pixel_type(&self) -> OmeTiffResult<PixelType> {
        PixelType::from_sample_format(self.sample_format()?, self.bits_per_sample()?)
    }

    pub fn photometric_interpretation(&self) -> OmeTiffResult<PhotometricInterpretation> {
        let value = self.u16_field(Tag::PhotometricInterpretation)?;
        PhotometricInterpretation::from_u16(value).ok_or_else(|| {
            crate::error::UnsupportedError::UnknownInterpretation(value).into()
        })
    }

    pub fn planar_configuration(&self) -> OmeTiffResult<PlanarConfiguration> {
        match self.entry(Tag::PlanarConfiguration) {
            None => Ok(PlanarConfiguration::Chunky),
            Some(_) => {
                let value = self.u16_field(Tag::PlanarConfiguration)?;
                PlanarConfiguration::from_u16(value).ok_or_else(|| {
                    crate::error::UnsupportedError::UnknownPlanarConfiguration(value).into()
                })
            }
        }
    }

    pub fn compression(&self) -> OmeTiffResult<CompressionMethod> {
        match self.entry(Tag::Compression) {
            None => Ok(CompressionMethod::None),
            Some(_) => {
                let value = self.u16_field(Tag::Compression)?;
                Ok(CompressionMethod::from_u16_exhaustive(value))
            }
        }
    }

    /// Strip or tile organisation.
    pub fn chunk_layout(&self) -> OmeTiffResult<ChunkLayout> {
        let tiled = self.contains(Tag::TileWidth) || self.contains(Tag::TileOffsets);
        let stripped = self.contains(Tag::StripOffsets);
        if tiled && stripped {
            return Err(FormatError::StripTileTagConflict.into());
        }
        if tiled {
            Ok(ChunkLayout::Tiles {
                width: self.u32_field(Tag::TileWidth)?,
                height: self.u32_field(Tag::TileLength)?,
            })
        } else {
            let rows = match self.entry(Tag::RowsPerStrip) {
                Some(_) => self.u32_field(Tag::RowsPerStrip)?,
                None => self.image_height()?,
            };
            Ok(ChunkLayout::Strips {
                rows_per_strip: rows.max(1),
            })
        }
    }

    /// Tile width and height, with strips reported as full-width tiles of
    /// the strip height.
    pub fn tile_size(&self) -> OmeTiffResult<(u32, u32)> {
        match self.chunk_layout()? {
            ChunkLayout::Tiles { width, height } => Ok((width, height)),
            ChunkLayout::Strips { rows_per_strip } => {
                Ok((self.image_width()?, rows_per_strip.min(self.image_height()?)))
            }
        }
    }

    /// SubIFD offsets of reduced-resolution rasters, if any.
    pub fn sub_ifd_offsets(&self) -> OmeTiffResult<Option<Vec<u64>>> {
        if !self.contains(Tag::SubIfd) {
            return Ok(None);
        }
        Ok(Some(self.u64_array_field(Tag::SubIfd, CountPolicy::Any)?))
    }

    /// Number of chunks covering one sample plane.
    fn chunks_per_plane(&self) -> OmeTiffResult<usize> {
        let width = self.image_width()? as usize;
        let height = self.image_height()? as usize;
        Ok(match self.chunk_layout()? {
            ChunkLayout::Strips { rows_per_strip } => height.div_ceil(rows_per_strip as usize),
            ChunkLayout::Tiles { width: tw, height: th } => {
                width.div_ceil(tw as usize) * height.div_ceil(th as usize)
            }
        })
    }

    fn chunk_offsets(&self) -> OmeTiffResult<Vec<u64>> {
        let tag = match self.chunk_layout()? {
            ChunkLayout::Strips { .. } => Tag::StripOffsets,
            ChunkLayout::Tiles { .. } => Tag::TileOffsets,
        };
        let expected = self.expected_chunk_count()?;
        self.u64_array_field(tag, CountPolicy::Exactly(expected as u64))
    }

    fn chunk_byte_counts(&self) -> OmeTiffResult<Vec<u64>> {
        let tag = match self.chunk_layout()? {
            ChunkLayout::Strips { .. } => Tag::StripByteCounts,
            ChunkLayout::Tiles { .. } => Tag::TileByteCounts,
        };
        let expected = self.expected_chunk_count()?;
        self.u64_array_field(tag, CountPolicy::Exactly(expected as u64))
    }

    /// The chunk count implied by the raster geometry, the planar
    /// configuration and the sample count.
    pub(crate) fn expected_chunk_count(&self) -> OmeTiffResult<usize> {
        let per_plane = self.chunks_per_plane()?;
        Ok(match self.planar_configuration()? {
            PlanarConfiguration::Chunky => per_plane,
            PlanarConfiguration::Planar => per_plane * self.samples_per_pixel()? as usize,
        })
    }

    /// Read a rectangular region of this raster into `buf`.
    ///
    /// The buffer is reallocated when its pixel type or extents do not match
    /// the request; otherwise it is filled in place.
    pub fn read_region(
        &self,
        tiff: &mut Tiff,
        x: u32,
        y: u32,
        w: u32,
        h: u32,
        buf: &mut VariantPixelBuffer<'_>,
    ) -> OmeTiffResult<()> {
        let width = self.image_width()?;
        let height = self.image_height()?;
        if w == 0 || h == 0 || x.checked_add(w).map_or(true, |e| e > width)
            || y.checked_add(h).map_or(true, |e| e > height)
        {
            return Err(UsageError::InvalidRegion { x, y, w, h }.into());
        }

        let pixel_type = self.pixel_type()?;
        let samples = self.samples_per_pixel()? as usize;
        let planar = self.planar_configuration()?;
        let extents = crate::pixel::plane_extents(w as usize, h as usize, samples);

        if buf.pixel_type() != pixel_type || buf.extents() != &extents {
            let order = StorageOrder::make(
                DimensionOrder::XYZTC,
                planar == PlanarConfiguration::Chunky,
            );
            *buf = VariantPixelBuffer::with_order(pixel_type, extents, order, EndianType::Native);
        }

        let passes = match planar {
            PlanarConfiguration::Chunky => 1,
            PlanarConfiguration::Planar => samples,
        };
        let chunk_samples = match planar {
            PlanarConfiguration::Chunky => samples,
            PlanarConfiguration::Planar => 1,
        };

        let offsets = self.chunk_offsets()?;
        let counts = self.chunk_byte_counts()?;
        let per_plane = self.chunks_per_plane()?;
        let layout = self.chunk_layout()?;
        let compression = self.compression()?;
        let bits = self.bits_per_sample()?;

        for pass in 0..passes {
            for (chunk, region) in chunk_cover(layout, width, height, x, y, w, h) {
                let index = pass * per_plane + chunk;
                let offset = *offsets.get(index).ok_or(FormatError::Format(String::from(
                    "chunk index out of range",
                )))?;
                let count = *counts.get(index).ok_or(FormatError::Format(String::from(
                    "chunk index out of range",
                )))?;

                let raw = tiff.read_at(offset, usize::try_from(count)?)?;
                let expected = chunk_byte_len(layout, width, height, chunk, chunk_samples, bits);
                let data = compression::decompress(compression, &raw, expected)?;

                scatter_chunk(
                    buf,
                    &data,
                    layout,
                    width,
                    chunk,
                    region,
                    (x, y),
                    chunk_samples,
                    pass,
                    bits,
                    self.byte_order,
                )?;
            }
        }

        Ok(())
    }

    /// Read the `ColorMap` lookup table into a three-sample `UInt16` buffer.
    pub fn read_lookup_table(&self, buf: &mut VariantPixelBuffer<'_>) -> OmeTiffResult<()> {
        let cmap = self.colormap()?;
        let entries = cmap[0].len();
        let extents = crate::pixel::plane_extents(entries, 1, 3);
        if buf.pixel_type() != PixelType::UInt16 || buf.extents() != &extents {
            *buf = VariantPixelBuffer::with_order(
                PixelType::UInt16,
                extents,
                StorageOrder::make(DimensionOrder::XYZTC, false),
                EndianType::Native,
            );
        }
        let target: &mut PixelBuffer<'_, u16> = buf.array_mut()?;
        for (s, channel) in cmap.iter().enumerate() {
            for (i, value) in channel.iter().enumerate() {
                *target.at_mut([i as i64, 0, 0, s as i64, 0, 0, 0, 0, 0])? = *value;
            }
        }
        Ok(())
    }
}

/// Uncompressed byte length of one chunk.
pub(crate) fn chunk_byte_len(
    layout: ChunkLayout,
    width: u32,
    height: u32,
    chunk: usize,
    chunk_samples: usize,
    bits: u16,
) -> usize {
    match layout {
        ChunkLayout::Strips { rows_per_strip } => {
            let first_row = chunk * rows_per_strip as usize;
            let rows = (height as usize - first_row).min(rows_per_strip as usize);
            rows * row_byte_len(width as usize, chunk_samples, bits)
        }
        ChunkLayout::Tiles { width: tw, height: th } => {
            // Tiles are always padded to full size.
            let _ = (width, chunk);
            th as usize * row_byte_len(tw as usize, chunk_samples, bits)
        }
    }
}

/// Byte length of one row of `width` pixels of `samples` samples each.
pub(crate) fn row_byte_len(width: usize, samples: usize, bits: u16) -> usize {
    if bits == 1 {
        (width * samples).div_ceil(8)
    } else {
        width * samples * (bits as usize / 8)
    }
}

/// A rectangle in image coordinates.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Region {
    pub(crate) x: u32,
    pub(crate) y: u32,
    pub(crate) w: u32,
    pub(crate) h: u32,
}

/// Chunk indices (within one sample plane) intersecting the region, with the
/// intersection rectangle of each.
pub(crate) fn chunk_cover(
    layout: ChunkLayout,
    width: u32,
    height: u32,
    x: u32,
    y: u32,
    w: u32,
    h: u32,
) -> Vec<(usize, Region)> {
    let mut cover = Vec::new();
    match layout {
        ChunkLayout::Strips { rows_per_strip } => {
            let first = y / rows_per_strip;
            let last = (y + h - 1) / rows_per_strip;
            for strip in first..=last {
                let top = strip * rows_per_strip;
                let bottom = (top + rows_per_strip).min(height);
                let y0 = y.max(top);
                let y1 = (y + h).min(bottom);
                cover.push((
                    strip as usize,
                    Region {
                        x,
                        y: y0,
                        w,
                        h: y1 - y0,
                    },
                ));
            }
        }
        ChunkLayout::Tiles { width: tw, height: th } => {
            let across = width.div_ceil(tw);
            let first_col = x / tw;
            let last_col = (x + w - 1) / tw;
            let first_row = y / th;
            let last_row = (y + h - 1) / th;
            for row in first_row..=last_row {
                for col in first_col..=last_col {
                    let left = col * tw;
                    let top = row * th;
                    let x0 = x.max(left);
                    let x1 = (x + w).min(left + tw);
                    let y0 = y.max(top);
                    let y1 = (y + h).min(top + th);
                    cover.push((
                        (row * across + col) as usize,
                        Region {
                            x: x0,
                            y: y0,
                            w: x1 - x0,
                            h: y1 - y0,
                        },
                    ));
                }
            }
        }
    }
    cover
}

/// Position of a pixel's first byte (or bit) within a decompressed chunk.
pub(crate) fn chunk_origin(layout: ChunkLayout, width: u32, chunk: usize) -> (u32, u32) {
    match layout {
        ChunkLayout::Strips { rows_per_strip } => (0, chunk as u32 * rows_per_strip),
        ChunkLayout::Tiles { width: tw, height: th } => {
            let across = width.div_ceil(tw).max(1);
            let row = chunk as u32 / across;
            let col = chunk as u32 % across;
            (col * tw, row * th)
        }
    }
}

pub(crate) fn chunk_row_pixels(layout: ChunkLayout, width: u32) -> usize {
    match layout {
        ChunkLayout::Strips { .. } => width as usize,
        ChunkLayout::Tiles { width: tw, .. } => tw as usize,
    }
}

/// Copy the intersecting part of a decompressed chunk into the destination
/// buffer, converting from the file byte order to native elements.
#[allow(clippy::too_many_arguments)]
fn scatter_chunk(
    buf: &mut VariantPixelBuffer<'_>,
    data: &[u8],
    layout: ChunkLayout,
    width: u32,
    chunk: usize,
    region: Region,
    roi_origin: (u32, u32),
    chunk_samples: usize,
    pass: usize,
    bits: u16,
    byte_order: EndianType,
) -> OmeTiffResult<()> {
    let (chunk_x, chunk_y) = chunk_origin(layout, width, chunk);
    let row_pixels = chunk_row_pixels(layout, width);

    if bits == 1 {
        let target: &mut PixelBuffer<'_, bool> = buf.array_mut()?;
        for row in 0..region.h {
            let src_row = (region.y + row - chunk_y) as usize;
            let row_base_bits = src_row * row_byte_len(row_pixels, chunk_samples, 1) * 8;
            for col in 0..region.w {
                let src_col = (region.x + col - chunk_x) as usize;
                for s in 0..chunk_samples {
                    let bit = row_base_bits + src_col * chunk_samples + s;
                    let byte = data[bit / 8];
                    let value = (byte >> (7 - (bit % 8))) & 1 != 0;
                    let dst = [
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
                    *target.at_mut(dst)? = value;
                }
            }
        }
        return Ok(());
    }

    struct Scatter<'a> {
        data: &'a [u8],
        region: Region,
        chunk_origin: (u32, u32),
        roi_origin: (u32, u32),
        row_pixels: usize,
        chunk_samples: usize,
        pass: usize,
        element_len: usize,
        byte_order: EndianType,
    }

    impl crate::pixel::PixelVisitorMut for Scatter<'_> {
        type Output = OmeTiffResult<()>;

        fn visit<T: PixelElement>(self, buffer: &mut PixelBuffer<'_, T>) -> OmeTiffResult<()> {
            let row_bytes = self.row_pixels * self.chunk_samples * self.element_len;
            for row in 0..self.region.h {
                let src_row = (self.region.y + row - self.chunk_origin.1) as usize;
                for col in 0..self.region.w {
                    let src_col = (self.region.x + col - self.chunk_origin.0) as usize;
                    for s in 0..self.chunk_samples {
                        let pos = src_row * row_bytes
                            + (src_col * self.chunk_samples + s) * self.element_len;
                        let mut slice = &self.data[pos..pos + self.element_len];
                        let value = T::read_element(&mut slice, self.byte_order)?;
                        let dst = [
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
                        *buffer.at_mut(dst)? = value;
                    }
                }
            }
            Ok(())
        }
    }

    let element_len = buf.pixel_type().byte_size();
    buf.visit_mut(Scatter {
        data,
        region,
        chunk_origin: (chunk_x, chunk_y),
        roi_origin,
        row_pixels,
        chunk_samples,
        pass,
        element_len,
        byte_order,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_cover_strips() {
        let layout = ChunkLayout::Strips { rows_per_strip: 4 };
        let cover = chunk_cover(layout, 16, 16, 0, 2, 16, 8);
        let indices: Vec<usize> = cover.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(cover[0].1.h, 2);
        assert_eq!(cover[1].1.h, 4);
        assert_eq!(cover[2].1.h, 2);
    }

    #[test]
    fn chunk_cover_tiles() {
        let layout = ChunkLayout::Tiles {
            width: 8,
            height: 8,
        };
        let cover = chunk_cover(layout, 16, 16, 4, 4, 8, 8);
        let indices: Vec<usize> = cover.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn row_lengths_pack_bits() {
        assert_eq!(row_byte_len(16, 1, 8), 16);
        assert_eq!(row_byte_len(16, 3, 16), 96);
        assert_eq!(row_byte_len(9, 1, 1), 2);
        assert_eq!(row_byte_len(8, 1, 1), 1);
    }

    #[test]
    fn chunk_lengths() {
        let strips = ChunkLayout::Strips { rows_per_strip: 4 };
        // Final strip of a 10-row image holds two rows.
        assert_eq!(chunk_byte_len(strips, 8, 10, 2, 1, 8), 16);
        let tiles = ChunkLayout::Tiles {
            width: 8,
            height: 8,
        };
        assert_eq!(chunk_byte_len(tiles, 10, 10, 3, 1, 8), 64);
    }
}
