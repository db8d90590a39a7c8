//! Endian-aware stream primitives shared by the IFD layer and the
//! post-close patcher.

use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::pixel::EndianType;

/// Reader that is aware of the byte order.
#[derive(Debug)]
pub struct EndianReader<R> {
    reader: R,
    endian: EndianType,
}

impl<R: Read> EndianReader<R> {
    pub fn new(reader: R, endian: EndianType) -> Self {
        Self { reader, endian }
    }

    pub fn endian(&self) -> EndianType {
        self.endian
    }

    pub fn inner(&mut self) -> &mut R {
        &mut self.reader
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    pub fn goto_offset(&mut self, offset: u64) -> io::Result<()>
    where
        R: Seek,
    {
        self.reader.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    pub fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.reader.read_exact(buf)
    }

    #[inline(always)]
    pub fn read_u8(&mut self) -> io::Result<u8> {
        let mut n = [0u8; 1];
        self.reader.read_exact(&mut n)?;
        Ok(n[0])
    }

    #[inline(always)]
    pub fn read_i8(&mut self) -> io::Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    #[inline(always)]
    pub fn read_u16(&mut self) -> io::Result<u16> {
        let mut n = [0u8; 2];
        self.reader.read_exact(&mut n)?;
        Ok(match self.endian.resolve() {
            EndianType::Little => u16::from_le_bytes(n),
            _ => u16::from_be_bytes(n),
        })
    }

    #[inline(always)]
    pub fn read_i16(&mut self) -> io::Result<i16> {
        Ok(self.read_u16()? as i16)
    }

    #[inline(always)]
    pub fn read_u32(&mut self) -> io::Result<u32> {
        let mut n = [0u8; 4];
        self.reader.read_exact(&mut n)?;
        Ok(match self.endian.resolve() {
            EndianType::Little => u32::from_le_bytes(n),
            _ => u32::from_be_bytes(n),
        })
    }

    #[inline(always)]
    pub fn read_i32(&mut self) -> io::Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    #[inline(always)]
    pub fn read_u64(&mut self) -> io::Result<u64> {
        let mut n = [0u8; 8];
        self.reader.read_exact(&mut n)?;
        Ok(match self.endian.resolve() {
            EndianType::Little => u64::from_le_bytes(n),
            _ => u64::from_be_bytes(n),
        })
    }

    #[inline(always)]
    pub fn read_i64(&mut self) -> io::Result<i64> {
        Ok(self.read_u64()? as i64)
    }

    #[inline(always)]
    pub fn read_f32(&mut self) -> io::Result<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    #[inline(always)]
    pub fn read_f64(&mut self) -> io::Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }
}

/// Writer counterpart of [`EndianReader`].
#[derive(Debug)]
pub struct EndianWriter<W> {
    writer: W,
    endian: EndianType,
    offset: u64,
}

impl<W: Write> EndianWriter<W> {
    pub fn new(writer: W, endian: EndianType) -> Self {
        Self {
            writer,
            endian,
            offset: 0,
        }
    }

    pub fn endian(&self) -> EndianType {
        self.endian
    }

    /// Current position, tracked across sequential writes and seeks.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes)?;
        self.offset += bytes.len() as u64;
        Ok(())
    }

    pub fn write_u8(&mut self, n: u8) -> io::Result<()> {
        self.write_bytes(&[n])
    }

    pub fn write_u16(&mut self, n: u16) -> io::Result<()> {
        let bytes = match self.endian.resolve() {
            EndianType::Little => n.to_le_bytes(),
            _ => n.to_be_bytes(),
        };
        self.write_bytes(&bytes)
    }

    pub fn write_u32(&mut self, n: u32) -> io::Result<()> {
        let bytes = match self.endian.resolve() {
            EndianType::Little => n.to_le_bytes(),
            _ => n.to_be_bytes(),
        };
        self.write_bytes(&bytes)
    }

    pub fn write_u64(&mut self, n: u64) -> io::Result<()> {
        let bytes = match self.endian.resolve() {
            EndianType::Little => n.to_le_bytes(),
            _ => n.to_be_bytes(),
        };
        self.write_bytes(&bytes)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    /// Pad to the next word boundary, as directory starts are word-aligned.
    pub fn pad_word_boundary(&mut self) -> io::Result<()> {
        if self.offset % 2 != 0 {
            self.write_bytes(&[0])?;
        }
        Ok(())
    }
}

impl<W: Write + Seek> EndianWriter<W> {
    pub fn goto_offset(&mut self, offset: u64) -> io::Result<()> {
        self.writer.seek(SeekFrom::Start(offset))?;
        self.offset = offset;
        Ok(())
    }

    pub fn goto_end(&mut self) -> io::Result<u64> {
        self.offset = self.writer.seek(SeekFrom::End(0))?;
        Ok(self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trip_each_endianness() {
        for endian in [EndianType::Big, EndianType::Little, EndianType::Native] {
            let mut writer = EndianWriter::new(Cursor::new(Vec::new()), endian);
            writer.write_u16(0xBEEF).unwrap();
            writer.write_u32(0xDEAD_BEEF).unwrap();
            writer.write_u64(0x0123_4567_89AB_CDEF).unwrap();
            assert_eq!(writer.offset(), 14);

            let bytes = writer.into_inner().into_inner();
            let mut reader = EndianReader::new(Cursor::new(bytes), endian);
            assert_eq!(reader.read_u16().unwrap(), 0xBEEF);
            assert_eq!(reader.read_u32().unwrap(), 0xDEAD_BEEF);
            assert_eq!(reader.read_u64().unwrap(), 0x0123_4567_89AB_CDEF);
        }
    }

    #[test]
    fn big_and_little_disagree_on_bytes() {
        let mut big = EndianWriter::new(Cursor::new(Vec::new()), EndianType::Big);
        big.write_u16(0x0102).unwrap();
        let mut little = EndianWriter::new(Cursor::new(Vec::new()), EndianType::Little);
        little.write_u16(0x0102).unwrap();
        assert_eq!(big.into_inner().into_inner(), vec![1, 2]);
        assert_eq!(little.into_inner().into_inner(), vec![2, 1]);
    }
}
