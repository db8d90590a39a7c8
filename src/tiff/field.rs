//! Typed field access over raw IFD entries.
//!
//! TIFF tags come in a small number of shape classes (NUL-terminated
//! strings, scalar integers of varying widths, per-sample arrays, the
//! `ColorMap`/`TransferFunction` triples). The accessors here normalise
//! per-tag variance into one typed API: any unsigned integer width is
//! accepted where a narrower value is requested (and range-checked), counts
//! are validated against the policy the tag demands, and violations fail
//! with `FieldShapeMismatch`.

use crate::error::{FormatError, OmeTiffResult};
use crate::tags::Tag;
#[cfg(test)]
use crate::tags::Type;
use crate::tiff::ifd::{Entry, Ifd, Value};

/// Expected element count of an array field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountPolicy {
    /// Any count is acceptable.
    Any,
    /// The count must be exactly this value.
    Exactly(u64),
    /// The count must match `SamplesPerPixel`.
    SamplesPerPixel,
    /// `ColorMap` sizing: three concatenated arrays of `2^BitsPerSample`.
    ColorMap,
}

fn shape_error(tag: Tag, entry: &Entry) -> crate::error::OmeTiffError {
    FormatError::FieldShapeMismatch {
        tag,
        ty: entry.ty,
        count: entry.count,
    }
    .into()
}

fn missing(tag: Tag) -> crate::error::OmeTiffError {
    FormatError::RequiredTagNotFound(tag).into()
}

impl Entry {
    /// The value widened to `u64`, accepting any unsigned integer width.
    ///
    /// This is the read half of the width probing described for the codec:
    /// a tag nominally defined as `SHORT` may appear as `LONG`, `LONG8` or
    /// the `IFD` variants and is accepted at whichever width it has.
    fn unsigned_values(&self, tag: Tag) -> OmeTiffResult<Vec<u64>> {
        match &self.value {
            Value::Byte(v) => Ok(v.iter().map(|n| u64::from(*n)).collect()),
            Value::Short(v) => Ok(v.iter().map(|n| u64::from(*n)).collect()),
            Value::Long(v) => Ok(v.iter().map(|n| u64::from(*n)).collect()),
            Value::Long8(v) => Ok(v.clone()),
            _ => Err(shape_error(tag, self)),
        }
    }

    /// The value widened to `i64`, accepting signed widths as well; the
    /// unsigned widths are accepted when in range.
    fn signed_values(&self, tag: Tag) -> OmeTiffResult<Vec<i64>> {
        match &self.value {
            Value::SByte(v) => Ok(v.iter().map(|n| i64::from(*n)).collect()),
            Value::SShort(v) => Ok(v.iter().map(|n| i64::from(*n)).collect()),
            Value::SLong(v) => Ok(v.iter().map(|n| i64::from(*n)).collect()),
            Value::SLong8(v) => Ok(v.clone()),
            _ => {
                let unsigned = self.unsigned_values(tag)?;
                unsigned
                    .into_iter()
                    .map(|n| i64::try_from(n).map_err(|_| shape_error(tag, self)))
                    .collect()
            }
        }
    }
}

impl Ifd {
    fn required(&self, tag: Tag) -> OmeTiffResult<&Entry> {
        self.entry(tag).ok_or_else(|| missing(tag))
    }

    fn check_count(&self, tag: Tag, entry: &Entry, policy: CountPolicy, len: u64) -> OmeTiffResult<()> {
        let expected = match policy {
            CountPolicy::Any => return Ok(()),
            CountPolicy::Exactly(n) => n,
            CountPolicy::SamplesPerPixel => u64::from(self.samples_per_pixel()?),
            CountPolicy::ColorMap => 3 * (1u64 << self.bits_per_sample()?),
        };
        if len != expected {
            return Err(shape_error(tag, entry));
        }
        Ok(())
    }

    /// A NUL-terminated string field.
    ///
    /// Both variable and fixed read counts occur in the wild; trailing NUL
    /// and padding bytes are stripped.
    pub fn ascii_field(&self, tag: Tag) -> OmeTiffResult<String> {
        let entry = self.required(tag)?;
        match &entry.value {
            Value::Ascii(bytes) => {
                let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
                Ok(String::from_utf8(bytes[..end].to_vec())?)
            }
            _ => Err(shape_error(tag, entry)),
        }
    }

    /// A NUL-separated string list field.
    pub fn ascii_array_field(&self, tag: Tag) -> OmeTiffResult<Vec<String>> {
        let entry = self.required(tag)?;
        match &entry.value {
            Value::Ascii(bytes) => bytes
                .split(|b| *b == 0)
                .filter(|part| !part.is_empty())
                .map(|part| Ok(String::from_utf8(part.to_vec())?))
                .collect(),
            _ => Err(shape_error(tag, entry)),
        }
    }

    /// A scalar 16-bit field; wider definitions are accepted and
    /// range-checked.
    pub fn u16_field(&self, tag: Tag) -> OmeTiffResult<u16> {
        let entry = self.required(tag)?;
        let values = entry.unsigned_values(tag)?;
        // Counts are broken for a handful of tags in some producers;
        // tolerate any count of at least one and use the first value.
        let first = *values.first().ok_or_else(|| shape_error(tag, entry))?;
        u16::try_from(first).map_err(|_| shape_error(tag, entry))
    }

    /// A tuple of exactly `N` 16-bit values.
    pub fn u16_tuple_field<const N: usize>(&self, tag: Tag) -> OmeTiffResult<[u16; N]> {
        let entry = self.required(tag)?;
        let values = entry.unsigned_values(tag)?;
        if values.len() != N {
            return Err(shape_error(tag, entry));
        }
        let mut tuple = [0u16; N];
        for (slot, value) in tuple.iter_mut().zip(values) {
            *slot = u16::try_from(value).map_err(|_| shape_error(tag, entry))?;
        }
        Ok(tuple)
    }

    /// A scalar 32-bit field.
    pub fn u32_field(&self, tag: Tag) -> OmeTiffResult<u32> {
        let entry = self.required(tag)?;
        let values = entry.unsigned_values(tag)?;
        let first = *values.first().ok_or_else(|| shape_error(tag, entry))?;
        u32::try_from(first).map_err(|_| shape_error(tag, entry))
    }

    /// A scalar 64-bit field.
    pub fn u64_field(&self, tag: Tag) -> OmeTiffResult<u64> {
        let entry = self.required(tag)?;
        let values = entry.unsigned_values(tag)?;
        values
            .first()
            .copied()
            .ok_or_else(|| shape_error(tag, entry))
    }

    /// A scalar signed field.
    pub fn i64_field(&self, tag: Tag) -> OmeTiffResult<i64> {
        let entry = self.required(tag)?;
        let values = entry.signed_values(tag)?;
        values
            .first()
            .copied()
            .ok_or_else(|| shape_error(tag, entry))
    }

    /// An array of 16-bit values with the given count policy.
    pub fn u16_array_field(&self, tag: Tag, policy: CountPolicy) -> OmeTiffResult<Vec<u16>> {
        let entry = self.required(tag)?;
        let values = entry.unsigned_values(tag)?;
        self.check_count(tag, entry, policy, values.len() as u64)?;
        values
            .into_iter()
            .map(|n| u16::try_from(n).map_err(|_| shape_error(tag, entry)))
            .collect()
    }

    /// An array of 32-bit values with the given count policy.
    pub fn u32_array_field(&self, tag: Tag, policy: CountPolicy) -> OmeTiffResult<Vec<u32>> {
        let entry = self.required(tag)?;
        let values = entry.unsigned_values(tag)?;
        self.check_count(tag, entry, policy, values.len() as u64)?;
        values
            .into_iter()
            .map(|n| u32::try_from(n).map_err(|_| shape_error(tag, entry)))
            .collect()
    }

    /// An array of 64-bit values (`LONG8`/`IFD8`, or any narrower width).
    pub fn u64_array_field(&self, tag: Tag, policy: CountPolicy) -> OmeTiffResult<Vec<u64>> {
        let entry = self.required(tag)?;
        let values = entry.unsigned_values(tag)?;
        self.check_count(tag, entry, policy, values.len() as u64)?;
        Ok(values)
    }

    /// A rational field reduced to a float.
    pub fn rational_field(&self, tag: Tag) -> OmeTiffResult<f64> {
        let entry = self.required(tag)?;
        match &entry.value {
            Value::Rational(v) => {
                let (n, d) = *v.first().ok_or_else(|| shape_error(tag, entry))?;
                Ok(f64::from(n) / f64::from(d.max(1)))
            }
            Value::SRational(v) => {
                let (n, d) = *v.first().ok_or_else(|| shape_error(tag, entry))?;
                Ok(f64::from(n) / f64::from(if d == 0 { 1 } else { d }))
            }
            _ => Err(shape_error(tag, entry)),
        }
    }

    /// A raw byte blob (`BYTE`/`UNDEFINED`).
    pub fn byte_field(&self, tag: Tag) -> OmeTiffResult<Vec<u8>> {
        let entry = self.required(tag)?;
        match &entry.value {
            Value::Byte(bytes) | Value::Undefined(bytes) | Value::Ascii(bytes) => {
                Ok(bytes.clone())
            }
            _ => Err(shape_error(tag, entry)),
        }
    }

    /// The `ColorMap` lookup table: three arrays of `2^BitsPerSample`
    /// 16-bit values.
    pub fn colormap(&self) -> OmeTiffResult<[Vec<u16>; 3]> {
        let values = self.u16_array_field(Tag::ColorMap, CountPolicy::ColorMap)?;
        let third = values.len() / 3;
        Ok([
            values[..third].to_vec(),
            values[third..2 * third].to_vec(),
            values[2 * third..].to_vec(),
        ])
    }

    /// The `TransferFunction` curves: one array per non-extra sample, which
    /// collapses to a single shared array when that channel count is one.
    pub fn transfer_function(&self) -> OmeTiffResult<Vec<Vec<u16>>> {
        let entry = self.required(Tag::TransferFunction)?;
        let values = entry.unsigned_values(Tag::TransferFunction)?;
        let per_curve = 1usize << self.bits_per_sample()?;
        let curves = match values.len() / per_curve {
            1 => 1,
            3 => 3,
            _ => return Err(shape_error(Tag::TransferFunction, entry)),
        };
        if values.len() != curves * per_curve {
            return Err(shape_error(Tag::TransferFunction, entry));
        }
        let mut out = Vec::with_capacity(curves);
        for curve in 0..curves {
            let slice = &values[curve * per_curve..(curve + 1) * per_curve];
            let mut narrow = Vec::with_capacity(per_curve);
            for value in slice {
                narrow.push(u16::try_from(*value).map_err(|_| shape_error(Tag::TransferFunction, entry))?);
            }
            out.push(narrow);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixel::EndianType;
    use std::collections::BTreeMap;

    fn ifd_with(entries: Vec<(Tag, Entry)>) -> Ifd {
        let mut map = BTreeMap::new();
        for (tag, entry) in entries {
            map.insert(tag.to_u16(), entry);
        }
        Ifd {
            offset: 8,
            entries: map,
            byte_order: EndianType::Native,
            big: false,
        }
    }

    fn entry(ty: Type, value: Value) -> Entry {
        let count = match &value {
            Value::Byte(v) => v.len(),
            Value::Ascii(v) => v.len(),
            Value::Short(v) => v.len(),
            Value::Long(v) => v.len(),
            Value::Long8(v) => v.len(),
            Value::SShort(v) => v.len(),
            _ => 1,
        } as u64;
        Entry { ty, count, value }
    }

    #[test]
    fn width_probing_accepts_wider_types() {
        let ifd = ifd_with(vec![
            (Tag::ImageWidth, entry(Type::SHORT, Value::Short(vec![64]))),
            (Tag::ImageLength, entry(Type::LONG8, Value::Long8(vec![32]))),
        ]);
        assert_eq!(ifd.u32_field(Tag::ImageWidth).unwrap(), 64);
        assert_eq!(ifd.u32_field(Tag::ImageLength).unwrap(), 32);
        // Narrowing checks the range.
        assert_eq!(ifd.u16_field(Tag::ImageWidth).unwrap(), 64);
    }

    #[test]
    fn shape_mismatch_is_reported() {
        let ifd = ifd_with(vec![(
            Tag::ImageWidth,
            entry(Type::ASCII, Value::Ascii(b"64\0".to_vec())),
        )]);
        assert!(matches!(
            ifd.u32_field(Tag::ImageWidth),
            Err(crate::error::OmeTiffError::FormatError(
                FormatError::FieldShapeMismatch { .. }
            ))
        ));
    }

    #[test]
    fn ascii_fields_strip_and_split() {
        let ifd = ifd_with(vec![(
            Tag::ImageDescription,
            entry(Type::ASCII, Value::Ascii(b"first\0second\0".to_vec())),
        )]);
        assert_eq!(ifd.ascii_field(Tag::ImageDescription).unwrap(), "first");
        assert_eq!(
            ifd.ascii_array_field(Tag::ImageDescription).unwrap(),
            vec!["first".to_string(), "second".to_string()]
        );
    }

    #[test]
    fn samples_per_pixel_policy() {
        let ifd = ifd_with(vec![
            (Tag::SamplesPerPixel, entry(Type::SHORT, Value::Short(vec![3]))),
            (
                Tag::BitsPerSample,
                entry(Type::SHORT, Value::Short(vec![8, 8, 8])),
            ),
        ]);
        assert_eq!(
            ifd.u16_array_field(Tag::BitsPerSample, CountPolicy::SamplesPerPixel)
                .unwrap(),
            vec![8, 8, 8]
        );
        assert!(ifd
            .u16_array_field(Tag::BitsPerSample, CountPolicy::Exactly(1))
            .is_err());
    }

    #[test]
    fn colormap_splits_in_three() {
        let mut values = Vec::new();
        for channel in 0u16..3 {
            for i in 0u16..2 {
                values.push(channel * 1000 + i);
            }
        }
        let ifd = ifd_with(vec![
            (Tag::BitsPerSample, entry(Type::SHORT, Value::Short(vec![1]))),
            (Tag::ColorMap, entry(Type::SHORT, Value::Short(values))),
        ]);
        let cmap = ifd.colormap().unwrap();
        assert_eq!(cmap[0], vec![0, 1]);
        assert_eq!(cmap[1], vec![1000, 1001]);
        assert_eq!(cmap[2], vec![2000, 2001]);
    }

    #[test]
    fn transfer_function_collapses_to_one_curve() {
        let ifd = ifd_with(vec![
            (Tag::BitsPerSample, entry(Type::SHORT, Value::Short(vec![1]))),
            (
                Tag::TransferFunction,
                entry(Type::SHORT, Value::Short(vec![7, 9])),
            ),
        ]);
        let curves = ifd.transfer_function().unwrap();
        assert_eq!(curves, vec![vec![7, 9]]);
    }
}
