//! Minimal TIFF substrate: file handles, IFD enumeration and directory
//! construction.
//!
//! The read side walks the main IFD chain with cycle protection and decodes
//! whole directories eagerly; the write side appends chunk data and
//! directories, maintaining the main chain and pending SubIFD chains the
//! way libtiff does (a directory declaring `SubIfd` placeholders causes the
//! following directories to be patched into those slots instead of the main
//! chain).

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use crate::error::{FormatError, OmeTiffError, OmeTiffResult};
use crate::pixel::EndianType;
use crate::tags::{Tag, Type};

pub mod compression;
pub mod stream;

mod build;
mod field;
mod ifd;

pub use self::build::DirectoryBuilder;
pub use self::field::CountPolicy;
pub use self::ifd::{ChunkLayout, Entry, Ifd, Value};

use self::stream::{EndianReader, EndianWriter};

const CLASSIC_VERSION: u16 = 0x2A;
const BIGTIFF_VERSION: u16 = 0x2B;

/// Upper bound on the directory chain length, guarding against loops that
/// survive the offset cycle check.
const MAX_DIRECTORIES: usize = 1_048_576;

fn parse_header<R: std::io::Read>(reader: &mut R) -> OmeTiffResult<EndianType> {
    let mut marker = [0u8; 2];
    reader
        .read_exact(&mut marker)
        .map_err(|_| FormatError::TiffSignatureNotFound)?;
    match &marker {
        b"II" => Ok(EndianType::Little),
        b"MM" => Ok(EndianType::Big),
        _ => Err(FormatError::TiffSignatureInvalid.into()),
    }
}

/// A TIFF file opened for reading.
#[derive(Debug)]
pub struct Tiff {
    reader: EndianReader<BufReader<File>>,
    path: PathBuf,
    big: bool,
    directories: Vec<u64>,
}

impl Tiff {
    /// Open and validate a TIFF file, enumerating its main IFD chain.
    pub fn open(path: &Path) -> OmeTiffResult<Tiff> {
        let file = File::open(path)?;
        let mut buffered = BufReader::new(file);
        let endian = parse_header(&mut buffered)?;
        let mut reader = EndianReader::new(buffered, endian);

        let version = reader.read_u16()?;
        let big = match version {
            CLASSIC_VERSION => false,
            BIGTIFF_VERSION => true,
            other => return Err(FormatError::TiffVersionInvalid(other).into()),
        };

        let first_offset = if big {
            let offset_size = reader.read_u16()?;
            if offset_size != 8 {
                return Err(FormatError::OffsetSizeInvalid(offset_size).into());
            }
            let _reserved = reader.read_u16()?;
            reader.read_u64()?
        } else {
            u64::from(reader.read_u32()?)
        };

        let mut tiff = Tiff {
            reader,
            path: path.to_path_buf(),
            big,
            directories: Vec::new(),
        };
        tiff.enumerate_directories(first_offset)?;
        Ok(tiff)
    }

    fn enumerate_directories(&mut self, first_offset: u64) -> OmeTiffResult<()> {
        let mut seen = HashSet::new();
        let mut offset = first_offset;
        while offset != 0 {
            if !seen.insert(offset) {
                return Err(FormatError::CycleInOffsets.into());
            }
            if self.directories.len() >= MAX_DIRECTORIES {
                return Err(FormatError::CycleInOffsets.into());
            }
            self.directories.push(offset);

            self.reader.goto_offset(offset)?;
            let count = if self.big {
                self.reader.read_u64()?
            } else {
                u64::from(self.reader.read_u16()?)
            };
            let entry_len = if self.big { 20 } else { 12 };
            let skip = count
                .checked_mul(entry_len)
                .ok_or(OmeTiffError::IntSizeError)?;
            self.reader.goto_offset(offset + if self.big { 8 } else { 2 } + skip)?;
            offset = if self.big {
                self.reader.read_u64()?
            } else {
                u64::from(self.reader.read_u32()?)
            };
        }
        if self.directories.is_empty() {
            return Err(FormatError::ImageFileDirectoryNotFound(first_offset).into());
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn byte_order(&self) -> EndianType {
        self.reader.endian()
    }

    pub fn is_big(&self) -> bool {
        self.big
    }

    /// Number of directories in the main IFD chain.
    pub fn directory_count(&self) -> usize {
        self.directories.len()
    }

    /// Decode the directory at the given index of the main chain.
    pub fn directory(&mut self, index: usize) -> OmeTiffResult<Ifd> {
        let offset = *self
            .directories
            .get(index)
            .ok_or(FormatError::ImageFileDirectoryNotFound(index as u64))?;
        self.directory_at(offset)
    }

    /// Decode the directory at an absolute file offset (a `SubIfd` target).
    pub fn directory_at(&mut self, offset: u64) -> OmeTiffResult<Ifd> {
        self.reader.goto_offset(offset)?;
        let count = if self.big {
            self.reader.read_u64()?
        } else {
            u64::from(self.reader.read_u16()?)
        };

        // Capture the raw entry table first; decoding an out-of-line value
        // seeks away from the directory.
        let mut raw_entries = Vec::with_capacity(usize::try_from(count.min(4096))?);
        for _ in 0..count {
            let tag = self.reader.read_u16()?;
            let ty = self.reader.read_u16()?;
            let value_count = if self.big {
                self.reader.read_u64()?
            } else {
                u64::from(self.reader.read_u32()?)
            };
            let mut raw = [0u8; 8];
            if self.big {
                self.reader.read_bytes(&mut raw)?;
            } else {
                self.reader.read_bytes(&mut raw[..4])?;
            }
            raw_entries.push((tag, ty, value_count, raw));
        }

        let mut entries = std::collections::BTreeMap::new();
        for (tag, ty, value_count, raw) in raw_entries {
            // Entries of unknown type are skipped rather than rejected.
            let Some(ty) = Type::from_u16(ty) else {
                continue;
            };
            let entry = Entry::decode(&mut self.reader, self.big, ty, value_count, raw)?;
            entries.insert(tag, entry);
        }

        Ok(Ifd {
            offset,
            entries,
            byte_order: self.reader.endian(),
            big: self.big,
        })
    }

    /// Read `len` raw bytes at an absolute offset.
    pub(crate) fn read_at(&mut self, offset: u64, len: usize) -> OmeTiffResult<Vec<u8>> {
        self.reader.goto_offset(offset)?;
        let mut bytes = vec![0u8; len];
        self.reader.read_bytes(&mut bytes)?;
        Ok(bytes)
    }
}

/// Pending SubIFD chain of the most recently written parent directory.
#[derive(Debug)]
struct SubIfdChain {
    /// File positions of the offset slots still to be filled.
    slots: Vec<u64>,
    next: usize,
}

/// A TIFF file opened for writing.
///
/// Directories are constructed through [`DirectoryBuilder`] and appended
/// with [`TiffSink::write_current_directory`]; chunk data is buffered in the
/// builder and written out at directory flush.
#[derive(Debug)]
pub struct TiffSink {
    writer: EndianWriter<BufWriter<File>>,
    path: PathBuf,
    big: bool,
    /// Position of the offset slot the next main-chain directory patches.
    link_pos: u64,
    pending: Option<SubIfdChain>,
    builder: DirectoryBuilder,
}

impl TiffSink {
    /// Create a TIFF (or BigTIFF) file and write its header.
    pub fn create(path: &Path, big: bool) -> OmeTiffResult<TiffSink> {
        let file = File::create(path)?;
        let mut writer = EndianWriter::new(BufWriter::new(file), EndianType::Native);

        let marker = if EndianType::Native.is_little() {
            b"II"
        } else {
            b"MM"
        };
        writer.write_bytes(marker)?;
        let link_pos;
        if big {
            writer.write_u16(BIGTIFF_VERSION)?;
            writer.write_u16(8)?;
            writer.write_u16(0)?;
            link_pos = writer.offset();
            writer.write_u64(0)?;
        } else {
            writer.write_u16(CLASSIC_VERSION)?;
            link_pos = writer.offset();
            writer.write_u32(0)?;
        }

        Ok(TiffSink {
            writer,
            path: path.to_path_buf(),
            big,
            link_pos,
            pending: None,
            builder: DirectoryBuilder::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_big(&self) -> bool {
        self.big
    }

    /// The directory currently under construction.
    pub fn current_directory(&mut self) -> &mut DirectoryBuilder {
        &mut self.builder
    }

    /// Immutable view of the directory under construction.
    pub fn directory(&self) -> &DirectoryBuilder {
        &self.builder
    }

    fn write_offset_value(&mut self, value: u64) -> OmeTiffResult<()> {
        if self.big {
            self.writer.write_u64(value)?;
        } else {
            self.writer.write_u32(u32::try_from(value)?)?;
        }
        Ok(())
    }

    /// Flush the directory under construction to the file.
    ///
    /// The directory joins the main IFD chain unless a SubIFD chain is
    /// pending, in which case it fills the next reserved slot. Declaring
    /// `sub_ifd_count` on the flushed directory opens a new pending chain
    /// for the directories that follow.
    pub fn write_current_directory(&mut self) -> OmeTiffResult<u64> {
        let builder = std::mem::replace(&mut self.builder, DirectoryBuilder::new());
        let finished = builder.finish()?;

        let offset_type = if self.big { Type::IFD8 } else { Type::IFD };
        let inline = if self.big { 8usize } else { 4 };

        // Chunk data first.
        let mut chunk_offsets = Vec::with_capacity(finished.chunks.len());
        let mut chunk_counts = Vec::with_capacity(finished.chunks.len());
        for chunk in &finished.chunks {
            self.writer.pad_word_boundary()?;
            chunk_offsets.push(self.writer.offset());
            chunk_counts.push(chunk.len() as u64);
            self.writer.write_bytes(chunk)?;
        }

        let mut entries = finished.entries;
        if !finished.chunks.is_empty() {
            let (offsets_tag, counts_tag) = if finished.tiled {
                (Tag::TileOffsets, Tag::TileByteCounts)
            } else {
                (Tag::StripOffsets, Tag::StripByteCounts)
            };
            let offsets_ty = if self.big { Type::LONG8 } else { Type::LONG };
            entries.insert(
                offsets_tag.to_u16(),
                build::raw_entry_u64s(offsets_ty, &chunk_offsets)?,
            );
            entries.insert(
                counts_tag.to_u16(),
                build::raw_entry_u64s(Type::LONG, &chunk_counts)?,
            );
        }
        if finished.sub_ifd_count > 0 {
            let zeros = vec![0u64; finished.sub_ifd_count];
            entries.insert(
                Tag::SubIfd.to_u16(),
                build::raw_entry_u64s(offset_type, &zeros)?,
            );
        }

        // Out-of-line payloads precede the directory.
        let mut payload_offsets = std::collections::BTreeMap::new();
        for (tag, entry) in &entries {
            if entry.payload.len() > inline {
                self.writer.pad_word_boundary()?;
                payload_offsets.insert(*tag, self.writer.offset());
                self.writer.write_bytes(&entry.payload)?;
            }
        }

        self.writer.pad_word_boundary()?;
        let dir_offset = self.writer.offset();
        if self.big {
            self.writer.write_u64(entries.len() as u64)?;
        } else {
            self.writer.write_u16(u16::try_from(entries.len())?)?;
        }

        let mut subifd_slots = Vec::new();
        for (tag, entry) in &entries {
            self.writer.write_u16(*tag)?;
            self.writer.write_u16(entry.ty.to_u16())?;
            if self.big {
                self.writer.write_u64(entry.count)?;
            } else {
                self.writer.write_u32(u32::try_from(entry.count)?)?;
            }
            let value_pos = self.writer.offset();
            match payload_offsets.get(tag) {
                Some(payload_offset) => {
                    if *tag == Tag::SubIfd.to_u16() {
                        let width = u64::from(offset_type.byte_len());
                        for i in 0..entry.count {
                            subifd_slots.push(payload_offset + i * width);
                        }
                    }
                    self.write_offset_value(*payload_offset)?;
                }
                None => {
                    if *tag == Tag::SubIfd.to_u16() {
                        let width = u64::from(offset_type.byte_len());
                        for i in 0..entry.count {
                            subifd_slots.push(value_pos + i * width);
                        }
                    }
                    let mut padded = entry.payload.clone();
                    padded.resize(inline, 0);
                    self.writer.write_bytes(&padded)?;
                }
            }
        }

        let next_ptr_pos = self.writer.offset();
        self.write_offset_value(0)?;
        let end = self.writer.offset();

        // Link the directory: into a pending SubIFD slot if one is open,
        // else onto the main chain.
        let consumed_pending = match &self.pending {
            Some(chain) if chain.next < chain.slots.len() => {
                let slot = chain.slots[chain.next];
                let new_next = chain.next + 1;
                let is_done = new_next == chain.slots.len();
                if let Some(chain) = &mut self.pending {
                    chain.next = new_next;
                }
                self.writer.goto_offset(slot)?;
                self.write_offset_value(dir_offset)?;
                self.writer.goto_offset(end)?;
                is_done
            }
            _ => {
                let link = self.link_pos;
                self.writer.goto_offset(link)?;
                self.write_offset_value(dir_offset)?;
                self.writer.goto_offset(end)?;
                self.link_pos = next_ptr_pos;
                false
            }
        };
        if consumed_pending {
            self.pending = None;
        }

        if !subifd_slots.is_empty() {
            self.pending = Some(SubIfdChain {
                slots: subifd_slots,
                next: 0,
            });
        }

        self.writer.flush()?;
        Ok(dir_offset)
    }

    /// Flush the pending directory (if any) and buffered output; the file
    /// handle is released on drop.
    pub fn close(&mut self) -> OmeTiffResult<()> {
        if !self.builder.is_empty() {
            self.write_current_directory()?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_signature() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.tif");
        std::fs::write(&path, b"PK\x03\x04").unwrap();
        assert!(matches!(
            Tiff::open(&path),
            Err(OmeTiffError::FormatError(FormatError::TiffSignatureInvalid))
        ));
    }

    #[test]
    fn rejects_bad_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.tif");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(if cfg!(target_endian = "little") {
            b"II"
        } else {
            b"MM"
        });
        bytes.extend_from_slice(&0x2Cu16.to_ne_bytes());
        bytes.extend_from_slice(&8u32.to_ne_bytes());
        std::fs::write(&path, bytes).unwrap();
        assert!(matches!(
            Tiff::open(&path),
            Err(OmeTiffError::FormatError(FormatError::TiffVersionInvalid(0x2C)))
        ));
    }

    #[test]
    fn empty_directory_chain_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.tif");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(if cfg!(target_endian = "little") {
            b"II"
        } else {
            b"MM"
        });
        bytes.extend_from_slice(&CLASSIC_VERSION.to_ne_bytes());
        bytes.extend_from_slice(&0u32.to_ne_bytes());
        std::fs::write(&path, bytes).unwrap();
        assert!(Tiff::open(&path).is_err());
    }
}
