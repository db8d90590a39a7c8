use std::error::Error;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::str;
use std::string;

use crate::pixel::PixelType;
use crate::tags::{Tag, Type};

/// OME-TIFF error kinds.
#[derive(Debug)]
pub enum OmeTiffError {
    /// A file is not formatted properly.
    FormatError(FormatError),

    /// The codec does not support a feature required by the data.
    UnsupportedError(UnsupportedError),

    /// An I/O error occurred while reading or writing a file.
    IoError(io::Error),

    /// A handler was driven outside its allowed state.
    UsageError(UsageError),

    /// An integer conversion to or from a platform size failed, either due to
    /// limits of the platform size or limits of the format.
    IntSizeError,
}

/// A file is not formatted properly.
///
/// This indicates that the producer of the file misbehaved or that the file
/// has been corrupted.
///
/// The list of variants may grow to incorporate errors of future features.
/// Matching against this exhaustively is not covered by interface stability
/// guarantees.
#[derive(Debug)]
#[non_exhaustive]
pub enum FormatError {
    TiffSignatureNotFound,
    TiffSignatureInvalid,
    TiffVersionInvalid(u16),
    OffsetSizeInvalid(u16),
    ImageFileDirectoryNotFound(u64),
    CycleInOffsets,
    InvalidTagValueType(Tag, Type),
    RequiredTagNotFound(Tag),
    FieldShapeMismatch {
        tag: Tag,
        ty: Type,
        count: u64,
    },
    InconsistentChunkData {
        actual_bytes: usize,
        required_bytes: usize,
    },
    StripTileTagConflict,
    ImageDescriptionNotFound,
    ImageDescriptionNotAscii(Type),
    ImageDescriptionLength {
        actual: u64,
        expected: u64,
    },
    MalformedOmeXml(String),
    InconsistentUuid {
        uuid: String,
        first: PathBuf,
        second: PathBuf,
    },
    UnmatchedUuid(String),
    IncompletePixelsMetadata(String),
    SubResolutionMismatch {
        series: usize,
        resolution: usize,
    },
    Format(String),
}

impl fmt::Display for FormatError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        use self::FormatError::*;
        match *self {
            TiffSignatureNotFound => write!(fmt, "TIFF signature not found."),
            TiffSignatureInvalid => write!(fmt, "TIFF signature invalid."),
            TiffVersionInvalid(version) => {
                write!(fmt, "TIFF version {:#06x} is neither classic nor BigTIFF.", version)
            }
            OffsetSizeInvalid(size) => {
                write!(fmt, "BigTIFF offset size {} is unsupported.", size)
            }
            ImageFileDirectoryNotFound(offset) => {
                write!(fmt, "Image file directory not found at offset {}.", offset)
            }
            CycleInOffsets => write!(fmt, "File contained a cycle in the list of IFDs."),
            InvalidTagValueType(tag, ty) => {
                write!(fmt, "Tag `{:?}` did not have the expected value type, found {:?}.", tag, ty)
            }
            RequiredTagNotFound(tag) => write!(fmt, "Required tag `{:?}` not found.", tag),
            FieldShapeMismatch { tag, ty, count } => write!(
                fmt,
                "Tag `{:?}` has shape {:?}×{} incompatible with the requested field access.",
                tag, ty, count
            ),
            InconsistentChunkData {
                actual_bytes,
                required_bytes,
            } => write!(
                fmt,
                "Decompression returned a different amount of bytes than expected: got {}, expected {}.",
                actual_bytes, required_bytes
            ),
            StripTileTagConflict => write!(
                fmt,
                "File should contain either (StripByteCounts and StripOffsets) or (TileByteCounts and TileOffsets), other combination was found."
            ),
            ImageDescriptionNotFound => {
                write!(fmt, "Could not find the TIFF ImageDescription tag.")
            }
            ImageDescriptionNotAscii(ty) => {
                write!(fmt, "TIFF ImageDescription has invalid type {:?}.", ty)
            }
            ImageDescriptionLength { actual, expected } => write!(
                fmt,
                "TIFF ImageDescription count is incorrect: got {}, expected {}.",
                actual, expected
            ),
            MalformedOmeXml(ref detail) => {
                write!(fmt, "Badly formed or invalid OME-XML document: {}.", detail)
            }
            InconsistentUuid {
                ref uuid,
                ref first,
                ref second,
            } => write!(
                fmt,
                "Inconsistent filenames for UUID `{}`: `{}` and `{}`.",
                uuid,
                first.display(),
                second.display()
            ),
            UnmatchedUuid(ref uuid) => write!(fmt, "Unmatched filename for UUID `{}`.", uuid),
            IncompletePixelsMetadata(ref detail) => {
                write!(fmt, "Incomplete Pixels metadata: {}.", detail)
            }
            SubResolutionMismatch { series, resolution } => write!(
                fmt,
                "Sub-resolution core metadata mismatch with full resolution core metadata: series {}, resolution {}.",
                series, resolution
            ),
            Format(ref val) => write!(fmt, "Invalid format: {}.", val),
        }
    }
}

/// The codec does not support a feature required by the data.
///
/// The list of variants may grow. Matching against this exhaustively is not
/// covered by interface stability guarantees.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum UnsupportedError {
    /// A typed projection was requested for a buffer holding another type.
    WrongPixelType {
        expected: PixelType,
        actual: PixelType,
    },
    /// The `(SampleFormat, BitsPerSample)` pair does not map to a pixel type.
    UnsupportedPixelType {
        format: u16,
        bits: u16,
    },
    UnsupportedCompressionMethod(u16),
    UnsupportedCompressionName(String),
    UnknownInterpretation(u16),
    UnknownPlanarConfiguration(u16),
}

impl fmt::Display for UnsupportedError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        use self::UnsupportedError::*;
        match *self {
            WrongPixelType { expected, actual } => write!(
                fmt,
                "Wrong pixel type: buffer holds {:?}, access requested {:?}.",
                actual, expected
            ),
            UnsupportedPixelType { format, bits } => write!(
                fmt,
                "Sample format {} with {} bits per sample does not map to a supported pixel type.",
                format, bits
            ),
            UnsupportedCompressionMethod(method) => {
                write!(fmt, "Compression method {} is unsupported.", method)
            }
            UnsupportedCompressionName(ref name) => {
                write!(fmt, "Compression codec `{}` is unknown.", name)
            }
            UnknownInterpretation(value) => {
                write!(fmt, "Unknown photometric interpretation {}.", value)
            }
            UnknownPlanarConfiguration(value) => {
                write!(fmt, "Unknown planar configuration {}.", value)
            }
        }
    }
}

/// A handler was driven in a way incompatible with its current state.
///
/// For example: querying the series before `set_id`, or skipping planes
/// during a sequential write.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum UsageError {
    /// An accessor that requires an open file was called before `set_id`.
    NotOpen,
    /// An operation that requires a fresh handler was called after `set_id`.
    AlreadyOpen,
    SeriesOutOfRange {
        series: usize,
        count: usize,
    },
    ResolutionOutOfRange {
        resolution: usize,
        count: usize,
    },
    PlaneOutOfRange {
        plane: usize,
        count: usize,
    },
    SeriesOutOfOrder {
        series: usize,
        current: usize,
    },
    PlaneOutOfOrder {
        plane: usize,
        current: usize,
    },
    CoordsOutOfRange {
        z: usize,
        c: usize,
        t: usize,
    },
    IndexOutOfRange {
        index: usize,
        count: usize,
    },
    /// A pixel-buffer index tuple lies outside the buffer extents.
    BufferIndexOutOfRange,
    /// The byte span of a buffer does not match its extents.
    BufferSizeMismatch {
        actual: usize,
        expected: usize,
    },
    /// Buffer extents or pixel type prevent a logical assignment.
    BufferShapeMismatch,
    InvalidRegion {
        x: u32,
        y: u32,
        w: u32,
        h: u32,
    },
    /// `close()` was called on a writer with unwritten planes.
    IncompletePlanes(usize),
    /// A required metadata attribute was unset.
    MetadataMissing(&'static str),
    /// A TIFF output file was not registered with a UUID.
    UnregisteredFile(PathBuf),
}

impl fmt::Display for UsageError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        use self::UsageError::*;
        match *self {
            NotOpen => write!(fmt, "Current file has not been set (set_id has not been called)."),
            AlreadyOpen => write!(fmt, "Current file has already been set."),
            SeriesOutOfRange { series, count } => {
                write!(fmt, "Invalid series: {} (series count is {}).", series, count)
            }
            ResolutionOutOfRange { resolution, count } => write!(
                fmt,
                "Invalid resolution: {} (resolution count is {}).",
                resolution, count
            ),
            PlaneOutOfRange { plane, count } => {
                write!(fmt, "Invalid plane: {} (image count is {}).", plane, count)
            }
            SeriesOutOfOrder { series, current } => {
                write!(fmt, "Series set out of order: {} (currently {}).", series, current)
            }
            PlaneOutOfOrder { plane, current } => {
                write!(fmt, "Plane set out of order: {} (currently {}).", plane, current)
            }
            CoordsOutOfRange { z, c, t } => {
                write!(fmt, "ZCT coordinates ({}, {}, {}) out of range.", z, c, t)
            }
            IndexOutOfRange { index, count } => {
                write!(fmt, "Plane index {} out of range (image count is {}).", index, count)
            }
            BufferIndexOutOfRange => write!(fmt, "Pixel buffer index out of range."),
            BufferSizeMismatch { actual, expected } => write!(
                fmt,
                "Pixel buffer storage of {} elements does not match extents requiring {}.",
                actual, expected
            ),
            BufferShapeMismatch => {
                write!(fmt, "Pixel buffer extents or type incompatible with assignment.")
            }
            InvalidRegion { x, y, w, h } => {
                write!(fmt, "Invalid image region: {}×{} at ({}, {}).", w, h, x, y)
            }
            IncompletePlanes(count) => write!(
                fmt,
                "Inconsistent writer state: {} planes have not been written.",
                count
            ),
            MetadataMissing(attr) => {
                write!(fmt, "Required metadata attribute `{}` is unset.", attr)
            }
            UnregisteredFile(ref path) => write!(
                fmt,
                "Inconsistent writer state: TIFF file `{}` not registered with a UUID.",
                path.display()
            ),
        }
    }
}

impl fmt::Display for OmeTiffError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        match *self {
            OmeTiffError::FormatError(ref e) => write!(fmt, "Format error: {}", e),
            OmeTiffError::UnsupportedError(ref e) => write!(fmt, "Unsupported: {}", e),
            OmeTiffError::IoError(ref e) => e.fmt(fmt),
            OmeTiffError::UsageError(ref e) => write!(fmt, "Usage error: {}", e),
            OmeTiffError::IntSizeError => write!(fmt, "Platform or format size limits exceeded"),
        }
    }
}

impl Error for OmeTiffError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match *self {
            OmeTiffError::IoError(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for OmeTiffError {
    fn from(err: io::Error) -> OmeTiffError {
        OmeTiffError::IoError(err)
    }
}

impl From<FormatError> for OmeTiffError {
    fn from(err: FormatError) -> OmeTiffError {
        OmeTiffError::FormatError(err)
    }
}

impl From<UnsupportedError> for OmeTiffError {
    fn from(err: UnsupportedError) -> OmeTiffError {
        OmeTiffError::UnsupportedError(err)
    }
}

impl From<UsageError> for OmeTiffError {
    fn from(err: UsageError) -> OmeTiffError {
        OmeTiffError::UsageError(err)
    }
}

impl From<str::Utf8Error> for OmeTiffError {
    fn from(_err: str::Utf8Error) -> OmeTiffError {
        OmeTiffError::FormatError(FormatError::Format(String::from(
            "ASCII field contained invalid UTF-8",
        )))
    }
}

impl From<string::FromUtf8Error> for OmeTiffError {
    fn from(_err: string::FromUtf8Error) -> OmeTiffError {
        OmeTiffError::FormatError(FormatError::Format(String::from(
            "ASCII field contained invalid UTF-8",
        )))
    }
}

impl From<std::num::TryFromIntError> for OmeTiffError {
    fn from(_err: std::num::TryFromIntError) -> OmeTiffError {
        OmeTiffError::IntSizeError
    }
}

impl From<weezl::LzwError> for OmeTiffError {
    fn from(err: weezl::LzwError) -> OmeTiffError {
        match err {
            weezl::LzwError::InvalidCode => OmeTiffError::FormatError(FormatError::Format(
                String::from("LZW compressed data corrupted"),
            )),
        }
    }
}

/// Result of a decoding/encoding process.
pub type OmeTiffResult<T> = Result<T, OmeTiffError>;
