//! TIFF tag and enumeration definitions used by the OME-TIFF codec.

macro_rules! tags {
    {
        // Permit arbitrary meta items, which include documentation.
        $( #[$enum_attr:meta] )*
        $vis:vis enum $name:ident($ty:tt) $(unknown(#[$unknown_meta:meta] $unknown_doc:ident))* {
            // Each of the `Name = Val,` permitting documentation.
            $($(#[$ident_attr:meta])* $tag:ident = $val:expr,)*
        }
    } => {
        $( #[$enum_attr] )*
        #[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
        #[non_exhaustive]
        #[repr($ty)]
        pub enum $name {
            $($(#[$ident_attr])* $tag = $val,)*
            $(
                #[$unknown_meta]
                Unknown($ty),
            )*
        }

        impl $name {
            #[inline(always)]
            const fn __from_inner_type(n: $ty) -> Result<Self, $ty> {
                match n {
                    $( $val => Ok($name::$tag), )*
                    n => Err(n),
                }
            }

            #[inline(always)]
            const fn __to_inner_type(&self) -> $ty {
                match *self {
                    $( $name::$tag => $val, )*
                    $( $name::Unknown($unknown_doc) => { $unknown_doc }, )*
                }
            }

            #[inline(always)]
            pub const fn from_u16(val: $ty) -> Option<Self> {
                match Self::__from_inner_type(val) {
                    Ok(v) => Some(v),
                    Err(_) => None,
                }
            }

            $(
            #[inline(always)]
            pub const fn from_u16_exhaustive($unknown_doc: $ty) -> Self {
                match Self::__from_inner_type($unknown_doc) {
                    Ok(v) => v,
                    Err(_) => $name::Unknown($unknown_doc),
                }
            }
            )*

            #[inline(always)]
            pub const fn to_u16(&self) -> $ty {
                Self::__to_inner_type(self)
            }
        }
    };
}

tags! {
/// TIFF tags understood by this codec.
///
/// The set covers the baseline raster description tags plus the extension
/// tags OME-TIFF relies on (`SubIfd` for pyramid tiers, `ImageDescription`
/// for the embedded OME-XML document).
pub enum Tag(u16) unknown(
    /// A private or extension tag
    unknown
) {
    NewSubfileType = 254,
    SubfileType = 255,
    ImageWidth = 256,
    ImageLength = 257,
    BitsPerSample = 258,
    Compression = 259,
    PhotometricInterpretation = 262,
    ImageDescription = 270,
    StripOffsets = 273,
    Orientation = 274,
    SamplesPerPixel = 277,
    RowsPerStrip = 278,
    StripByteCounts = 279,
    XResolution = 282,
    YResolution = 283,
    PlanarConfiguration = 284,
    ResolutionUnit = 296,
    TransferFunction = 301,
    Software = 305,
    DateTime = 306,
    Predictor = 317,
    ColorMap = 320,
    TileWidth = 322,
    TileLength = 323,
    TileOffsets = 324,
    TileByteCounts = 325,
    SubIfd = 330,
    ExtraSamples = 338,
    SampleFormat = 339,
}
}

tags! {
/// The type of an IFD entry (a 2 byte field).
pub enum Type(u16) {
    /// 8-bit unsigned integer
    BYTE = 1,
    /// 8-bit byte that contains a 7-bit ASCII code; the last byte must be zero
    ASCII = 2,
    /// 16-bit unsigned integer
    SHORT = 3,
    /// 32-bit unsigned integer
    LONG = 4,
    /// Fraction stored as two 32-bit unsigned integers
    RATIONAL = 5,
    /// 8-bit signed integer
    SBYTE = 6,
    /// 8-bit byte that may contain anything, depending on the field
    UNDEFINED = 7,
    /// 16-bit signed integer
    SSHORT = 8,
    /// 32-bit signed integer
    SLONG = 9,
    /// Fraction stored as two 32-bit signed integers
    SRATIONAL = 10,
    /// 32-bit IEEE floating point
    FLOAT = 11,
    /// 64-bit IEEE floating point
    DOUBLE = 12,
    /// 32-bit unsigned integer (offset)
    IFD = 13,
    /// BigTIFF 64-bit unsigned integer
    LONG8 = 16,
    /// BigTIFF 64-bit signed integer
    SLONG8 = 17,
    /// BigTIFF 64-bit unsigned integer (offset)
    IFD8 = 18,
}
}

impl Type {
    pub(crate) fn byte_len(&self) -> u8 {
        match *self {
            Type::BYTE | Type::SBYTE | Type::ASCII | Type::UNDEFINED => 1,
            Type::SHORT | Type::SSHORT => 2,
            Type::LONG | Type::SLONG | Type::FLOAT | Type::IFD => 4,
            Type::LONG8
            | Type::SLONG8
            | Type::DOUBLE
            | Type::RATIONAL
            | Type::SRATIONAL
            | Type::IFD8 => 8,
        }
    }
}

tags! {
/// See [TIFF compression tags](https://www.awaresystems.be/imaging/tiff/tifftags/compression.html)
/// for reference.
pub enum CompressionMethod(u16) unknown(
    /// A custom compression method
    unknown
) {
    None = 1,
    LZW = 5,
    Deflate = 8,
    OldDeflate = 0x80B2,
    PackBits = 0x8005,
}
}

tags! {
pub enum PhotometricInterpretation(u16) {
    WhiteIsZero = 0,
    BlackIsZero = 1,
    RGB = 2,
    RGBPalette = 3,
    TransparencyMask = 4,
    CMYK = 5,
    YCbCr = 6,
    CIELab = 8,
}
}

tags! {
pub enum PlanarConfiguration(u16) {
    Chunky = 1,
    Planar = 2,
}
}

tags! {
pub enum SampleFormat(u16) unknown(
    /// An unknown extension sample format
    unknown
) {
    Uint = 1,
    Int = 2,
    IEEEFP = 3,
    Void = 4,
    ComplexInt = 5,
    ComplexIEEEFP = 6,
}
}

/// `NewSubfileType` bit flags.
///
/// `PAGE` marks one page of a multi-page image; `REDUCED_IMAGE` marks a
/// reduced-resolution version of another raster in the same file. Pyramid
/// tiers carry both.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct SubfileType(pub u32);

impl SubfileType {
    pub const REDUCED_IMAGE: SubfileType = SubfileType(0x1);
    pub const PAGE: SubfileType = SubfileType(0x2);
    pub const MASK: SubfileType = SubfileType(0x4);

    pub const fn contains(&self, flag: SubfileType) -> bool {
        self.0 & flag.0 == flag.0
    }
}

impl std::ops::BitOr for SubfileType {
    type Output = SubfileType;

    fn bitor(self, rhs: SubfileType) -> SubfileType {
        SubfileType(self.0 | rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_round_trip() {
        assert_eq!(Tag::from_u16(270), Some(Tag::ImageDescription));
        assert_eq!(Tag::ImageDescription.to_u16(), 270);
        assert_eq!(Tag::from_u16(65000), None);
        assert_eq!(Tag::from_u16_exhaustive(65000), Tag::Unknown(65000));
        assert_eq!(Tag::Unknown(65000).to_u16(), 65000);
    }

    #[test]
    fn type_sizes() {
        assert_eq!(Type::ASCII.byte_len(), 1);
        assert_eq!(Type::SHORT.byte_len(), 2);
        assert_eq!(Type::IFD.byte_len(), 4);
        assert_eq!(Type::IFD8.byte_len(), 8);
        assert_eq!(Type::RATIONAL.byte_len(), 8);
    }

    #[test]
    fn subfile_type_flags() {
        let pyramid = SubfileType::PAGE | SubfileType::REDUCED_IMAGE;
        assert!(pyramid.contains(SubfileType::PAGE));
        assert!(pyramid.contains(SubfileType::REDUCED_IMAGE));
        assert!(!SubfileType::PAGE.contains(SubfileType::REDUCED_IMAGE));
    }
}
