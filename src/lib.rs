//! Reading and writing of OME-TIFF images.
//!
//! OME-TIFF stores multi-dimensional microscopy images as one or more TIFF
//! files whose structure is described by an OME-XML document embedded in
//! the first IFD's `ImageDescription` tag. This crate maps between the
//! 5-D logical image model (series × Z × C × T × sample, plus a
//! sub-resolution pyramid axis) and the TIFF directories holding the
//! pixel data, linked across files by UUID.
//!
//! # Related Links
//! * <https://docs.openmicroscopy.org/ome-model/6.0.1/ome-tiff/> - The OME-TIFF specification

use std::path::Path;

pub mod error;
pub mod handler;
pub mod meta;
pub mod pixel;
pub mod reader;
pub mod tags;
pub mod tiff;
pub mod writer;

pub use self::error::{
    FormatError, OmeTiffError, OmeTiffResult, UnsupportedError, UsageError,
};
pub use self::meta::{
    CoreMetadata, DimensionOrder, MetadataRetrieve, MetadataStore, Modulo, OmeXmlMetadata,
    Resolution,
};
pub use self::pixel::{EndianType, PixelBuffer, PixelType, VariantPixelBuffer};
pub use self::reader::OmeTiffReader;
pub use self::writer::OmeTiffWriter;

/// Suffixes of plain TIFF files.
pub const TIFF_SUFFIXES: &[&str] = &["tif", "tiff", "tf2", "tf8", "btf"];

/// Suffixes of OME-TIFF files.
pub const OME_TIFF_SUFFIXES: &[&str] = &["ome.tif", "ome.tiff", "ome.tf2", "ome.tf8", "ome.btf"];

/// Suffixes of standalone companion metadata files.
pub const COMPANION_SUFFIXES: &[&str] = &["companion.ome"];

/// Whether the file name ends with one of the suffixes (case-insensitive).
pub fn check_suffix(path: &Path, suffixes: &[&str]) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let name = name.to_ascii_lowercase();
    suffixes
        .iter()
        .any(|suffix| name.ends_with(&format!(".{}", suffix)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_checks() {
        assert!(check_suffix(Path::new("a.ome.tif"), OME_TIFF_SUFFIXES));
        assert!(check_suffix(Path::new("A.OME.TIFF"), OME_TIFF_SUFFIXES));
        assert!(check_suffix(Path::new("a.ome.tif"), TIFF_SUFFIXES));
        assert!(!check_suffix(Path::new("a.tif"), OME_TIFF_SUFFIXES));
        assert!(check_suffix(Path::new("b.companion.ome"), COMPANION_SUFFIXES));
        assert!(!check_suffix(Path::new("companion.ome"), &["png"]));
    }
}
