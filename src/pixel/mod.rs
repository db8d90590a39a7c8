//! Pixel types and the typed multi-dimensional buffers holding them.

use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

use num_complex::Complex;

use crate::error::{OmeTiffError, UnsupportedError};
use crate::tags::SampleFormat;

mod buffer;
mod variant;

pub use self::buffer::{Dimension, PixelBuffer, Storage, StorageOrder, DIMENSIONS};
pub(crate) use self::buffer::plane_extents;
pub use self::variant::{PixelVisitor, PixelVisitorMut, VariantPixelBuffer};

/// An enumeration over the pixel types of the OME data model.
///
/// Each type has a fixed on-disk footprint and one native in-memory element
/// representation; `Bit` occupies a single bit on disk but a whole byte
/// (`bool`) in memory.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
#[non_exhaustive]
pub enum PixelType {
    /// 8-bit signed integer
    Int8,
    /// 16-bit signed integer
    Int16,
    /// 32-bit signed integer
    Int32,
    /// 8-bit unsigned integer
    UInt8,
    /// 16-bit unsigned integer
    UInt16,
    /// 32-bit unsigned integer
    UInt32,
    /// Single bit, unpacked to a byte-sized boolean in memory
    Bit,
    /// 32-bit IEEE floating point
    Float,
    /// 64-bit IEEE floating point
    Double,
    /// Complex number of two 32-bit IEEE floats
    ComplexFloat,
    /// Complex number of two 64-bit IEEE floats
    ComplexDouble,
}

impl PixelType {
    /// All pixel types, in OME model order.
    pub const VALUES: [PixelType; 11] = [
        PixelType::Int8,
        PixelType::Int16,
        PixelType::Int32,
        PixelType::UInt8,
        PixelType::UInt16,
        PixelType::UInt32,
        PixelType::Bit,
        PixelType::Float,
        PixelType::Double,
        PixelType::ComplexFloat,
        PixelType::ComplexDouble,
    ];

    /// In-memory size of one element in bytes.
    pub fn byte_size(&self) -> usize {
        match *self {
            PixelType::Int8 | PixelType::UInt8 | PixelType::Bit => 1,
            PixelType::Int16 | PixelType::UInt16 => 2,
            PixelType::Int32 | PixelType::UInt32 | PixelType::Float => 4,
            PixelType::Double | PixelType::ComplexFloat => 8,
            PixelType::ComplexDouble => 16,
        }
    }

    /// On-disk significant bits of one pixel.
    pub fn bits_per_pixel(&self) -> u32 {
        match *self {
            PixelType::Bit => 1,
            PixelType::Int8 | PixelType::UInt8 => 8,
            PixelType::Int16 | PixelType::UInt16 => 16,
            PixelType::Int32 | PixelType::UInt32 | PixelType::Float => 32,
            PixelType::Double | PixelType::ComplexFloat => 64,
            PixelType::ComplexDouble => 128,
        }
    }

    pub fn is_signed(&self) -> bool {
        matches!(
            *self,
            PixelType::Int8
                | PixelType::Int16
                | PixelType::Int32
                | PixelType::Float
                | PixelType::Double
                | PixelType::ComplexFloat
                | PixelType::ComplexDouble
        )
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            *self,
            PixelType::Int8
                | PixelType::Int16
                | PixelType::Int32
                | PixelType::UInt8
                | PixelType::UInt16
                | PixelType::UInt32
                | PixelType::Bit
        )
    }

    pub fn is_complex(&self) -> bool {
        matches!(*self, PixelType::ComplexFloat | PixelType::ComplexDouble)
    }

    /// The TIFF `SampleFormat` this pixel type is stored with.
    pub fn sample_format(&self) -> SampleFormat {
        match *self {
            PixelType::Int8 | PixelType::Int16 | PixelType::Int32 => SampleFormat::Int,
            PixelType::UInt8 | PixelType::UInt16 | PixelType::UInt32 | PixelType::Bit => {
                SampleFormat::Uint
            }
            PixelType::Float | PixelType::Double => SampleFormat::IEEEFP,
            PixelType::ComplexFloat | PixelType::ComplexDouble => SampleFormat::ComplexIEEEFP,
        }
    }

    /// Map a TIFF `(SampleFormat, BitsPerSample)` pair back to a pixel type.
    pub fn from_sample_format(format: SampleFormat, bits: u16) -> Result<PixelType, OmeTiffError> {
        let pixel_type = match (format, bits) {
            (SampleFormat::Uint, 1) => Some(PixelType::Bit),
            (SampleFormat::Uint, 8) => Some(PixelType::UInt8),
            (SampleFormat::Uint, 16) => Some(PixelType::UInt16),
            (SampleFormat::Uint, 32) => Some(PixelType::UInt32),
            (SampleFormat::Int, 8) => Some(PixelType::Int8),
            (SampleFormat::Int, 16) => Some(PixelType::Int16),
            (SampleFormat::Int, 32) => Some(PixelType::Int32),
            (SampleFormat::IEEEFP, 32) => Some(PixelType::Float),
            (SampleFormat::IEEEFP, 64) => Some(PixelType::Double),
            (SampleFormat::ComplexIEEEFP, 64) => Some(PixelType::ComplexFloat),
            (SampleFormat::ComplexIEEEFP, 128) => Some(PixelType::ComplexDouble),
            _ => None,
        };

        pixel_type.ok_or_else(|| {
            UnsupportedError::UnsupportedPixelType {
                format: format.to_u16(),
                bits,
            }
            .into()
        })
    }
}

impl fmt::Display for PixelType {
    /// Formats the pixel type as its OME-XML `Pixels/@Type` value.
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            PixelType::Int8 => "int8",
            PixelType::Int16 => "int16",
            PixelType::Int32 => "int32",
            PixelType::UInt8 => "uint8",
            PixelType::UInt16 => "uint16",
            PixelType::UInt32 => "uint32",
            PixelType::Bit => "bit",
            PixelType::Float => "float",
            PixelType::Double => "double",
            PixelType::ComplexFloat => "complex",
            PixelType::ComplexDouble => "double-complex",
        };
        fmt.write_str(name)
    }
}

impl FromStr for PixelType {
    type Err = String;

    /// Parses an OME-XML `Pixels/@Type` value.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "int8" => Ok(PixelType::Int8),
            "int16" => Ok(PixelType::Int16),
            "int32" => Ok(PixelType::Int32),
            "uint8" => Ok(PixelType::UInt8),
            "uint16" => Ok(PixelType::UInt16),
            "uint32" => Ok(PixelType::UInt32),
            "bit" => Ok(PixelType::Bit),
            "float" => Ok(PixelType::Float),
            "double" => Ok(PixelType::Double),
            "complex" => Ok(PixelType::ComplexFloat),
            "double-complex" => Ok(PixelType::ComplexDouble),
            other => Err(format!("unknown pixel type `{}`", other)),
        }
    }
}

/// Endianness of multi-byte values, with `Native` as a pass-through for the
/// host byte order.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub enum EndianType {
    Big,
    Little,
    Native,
}

impl EndianType {
    /// Resolve `Native` to the concrete host byte order.
    pub fn resolve(&self) -> EndianType {
        match *self {
            EndianType::Native => {
                if cfg!(target_endian = "little") {
                    EndianType::Little
                } else {
                    EndianType::Big
                }
            }
            other => other,
        }
    }

    pub fn is_little(&self) -> bool {
        self.resolve() == EndianType::Little
    }
}

macro_rules! element_bytes {
    ($w:expr, $endian:expr, $val:expr) => {{
        let bytes = match $endian.resolve() {
            EndianType::Little => $val.to_le_bytes(),
            _ => $val.to_be_bytes(),
        };
        $w.write_all(&bytes)
    }};
}

macro_rules! element_from_bytes {
    ($r:expr, $endian:expr, $prim:ty) => {{
        let mut bytes = [0u8; std::mem::size_of::<$prim>()];
        $r.read_exact(&mut bytes)?;
        Ok(match $endian.resolve() {
            EndianType::Little => <$prim>::from_le_bytes(bytes),
            _ => <$prim>::from_be_bytes(bytes),
        })
    }};
}

/// One element of a pixel buffer: the native representation of a pixel type.
///
/// The trait ties each of the eleven pixel types to its Rust element type and
/// provides the endian-aware raw stream I/O the buffer serialisation is built
/// from.
pub trait PixelElement: Copy + PartialEq + Default + fmt::Debug + 'static {
    /// The pixel type this element represents.
    const PIXEL_TYPE: PixelType;

    fn write_element<W: Write>(&self, writer: &mut W, endian: EndianType) -> io::Result<()>;

    fn read_element<R: Read>(reader: &mut R, endian: EndianType) -> io::Result<Self>;
}

macro_rules! primitive_element {
    ($prim:ty, $pixel:expr) => {
        impl PixelElement for $prim {
            const PIXEL_TYPE: PixelType = $pixel;

            fn write_element<W: Write>(
                &self,
                writer: &mut W,
                endian: EndianType,
            ) -> io::Result<()> {
                element_bytes!(writer, endian, self)
            }

            fn read_element<R: Read>(reader: &mut R, endian: EndianType) -> io::Result<Self> {
                element_from_bytes!(reader, endian, $prim)
            }
        }
    };
}

primitive_element!(i8, PixelType::Int8);
primitive_element!(i16, PixelType::Int16);
primitive_element!(i32, PixelType::Int32);
primitive_element!(u8, PixelType::UInt8);
primitive_element!(u16, PixelType::UInt16);
primitive_element!(u32, PixelType::UInt32);

impl PixelElement for bool {
    const PIXEL_TYPE: PixelType = PixelType::Bit;

    fn write_element<W: Write>(&self, writer: &mut W, _endian: EndianType) -> io::Result<()> {
        writer.write_all(&[u8::from(*self)])
    }

    fn read_element<R: Read>(reader: &mut R, _endian: EndianType) -> io::Result<Self> {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte)?;
        Ok(byte[0] != 0)
    }
}

impl PixelElement for f32 {
    const PIXEL_TYPE: PixelType = PixelType::Float;

    fn write_element<W: Write>(&self, writer: &mut W, endian: EndianType) -> io::Result<()> {
        element_bytes!(writer, endian, self.to_bits())
    }

    fn read_element<R: Read>(reader: &mut R, endian: EndianType) -> io::Result<Self> {
        element_from_bytes!(reader, endian, u32).map(f32::from_bits)
    }
}

impl PixelElement for f64 {
    const PIXEL_TYPE: PixelType = PixelType::Double;

    fn write_element<W: Write>(&self, writer: &mut W, endian: EndianType) -> io::Result<()> {
        element_bytes!(writer, endian, self.to_bits())
    }

    fn read_element<R: Read>(reader: &mut R, endian: EndianType) -> io::Result<Self> {
        element_from_bytes!(reader, endian, u64).map(f64::from_bits)
    }
}

impl PixelElement for Complex<f32> {
    const PIXEL_TYPE: PixelType = PixelType::ComplexFloat;

    fn write_element<W: Write>(&self, writer: &mut W, endian: EndianType) -> io::Result<()> {
        self.re.write_element(writer, endian)?;
        self.im.write_element(writer, endian)
    }

    fn read_element<R: Read>(reader: &mut R, endian: EndianType) -> io::Result<Self> {
        let re = f32::read_element(reader, endian)?;
        let im = f32::read_element(reader, endian)?;
        Ok(Complex::new(re, im))
    }
}

impl PixelElement for Complex<f64> {
    const PIXEL_TYPE: PixelType = PixelType::ComplexDouble;

    fn write_element<W: Write>(&self, writer: &mut W, endian: EndianType) -> io::Result<()> {
        self.re.write_element(writer, endian)?;
        self.im.write_element(writer, endian)
    }

    fn read_element<R: Read>(reader: &mut R, endian: EndianType) -> io::Result<Self> {
        let re = f64::read_element(reader, endian)?;
        let im = f64::read_element(reader, endian)?;
        Ok(Complex::new(re, im))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_sizes_match_bits() {
        for pt in PixelType::VALUES {
            if pt == PixelType::Bit {
                assert_eq!(pt.byte_size(), 1);
                assert_eq!(pt.bits_per_pixel(), 1);
            } else {
                assert_eq!(pt.byte_size() as u32 * 8, pt.bits_per_pixel());
            }
        }
    }

    #[test]
    fn sample_format_round_trip() {
        for pt in PixelType::VALUES {
            let format = pt.sample_format();
            let bits = pt.bits_per_pixel() as u16;
            assert_eq!(PixelType::from_sample_format(format, bits).unwrap(), pt);
        }
    }

    #[test]
    fn name_round_trip() {
        for pt in PixelType::VALUES {
            assert_eq!(pt.to_string().parse::<PixelType>().unwrap(), pt);
        }
    }

    #[test]
    fn element_stream_round_trip() {
        for endian in [EndianType::Big, EndianType::Little, EndianType::Native] {
            let mut bytes = Vec::new();
            0x1234u16.write_element(&mut bytes, endian).unwrap();
            (-7i32).write_element(&mut bytes, endian).unwrap();
            1.5f64.write_element(&mut bytes, endian).unwrap();
            Complex::new(1.0f32, -2.0f32)
                .write_element(&mut bytes, endian)
                .unwrap();

            let mut cursor = std::io::Cursor::new(bytes);
            assert_eq!(u16::read_element(&mut cursor, endian).unwrap(), 0x1234);
            assert_eq!(i32::read_element(&mut cursor, endian).unwrap(), -7);
            assert_eq!(f64::read_element(&mut cursor, endian).unwrap(), 1.5);
            assert_eq!(
                Complex::<f32>::read_element(&mut cursor, endian).unwrap(),
                Complex::new(1.0, -2.0)
            );
        }
    }
}
