//! Chunk compression codecs: None, LZW, Deflate and PackBits.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression as DeflateLevel;

use crate::error::{FormatError, OmeTiffResult, UnsupportedError};
use crate::tags::CompressionMethod;

/// Map a writer-facing codec name onto the TIFF compression scheme.
///
/// `default` selects no compression.
pub fn codec_scheme(name: &str) -> OmeTiffResult<CompressionMethod> {
    match name {
        "default" => Ok(CompressionMethod::None),
        "LZW" => Ok(CompressionMethod::LZW),
        "Deflate" => Ok(CompressionMethod::Deflate),
        "PackBits" => Ok(CompressionMethod::PackBits),
        other => Err(UnsupportedError::UnsupportedCompressionName(other.into()).into()),
    }
}

/// The codec names the writer reports for every pixel type.
pub fn codec_names() -> &'static [&'static str] {
    &["default", "LZW", "Deflate", "PackBits"]
}

/// Decompress one chunk to exactly `expected` bytes.
///
/// Codecs may emit trailing padding beyond the expected size; short output
/// is a format error.
pub fn decompress(
    method: CompressionMethod,
    data: &[u8],
    expected: usize,
) -> OmeTiffResult<Vec<u8>> {
    let mut decoded = match method {
        CompressionMethod::None => data.to_vec(),
        CompressionMethod::LZW => {
            let mut decoded = Vec::with_capacity(expected);
            let mut decoder =
                weezl::decode::Decoder::with_tiff_size_switch(weezl::BitOrder::Msb, 8);
            let result = decoder.into_vec(&mut decoded).decode_all(data);
            result.status?;
            decoded
        }
        CompressionMethod::Deflate | CompressionMethod::OldDeflate => {
            let mut decoded = Vec::with_capacity(expected);
            ZlibDecoder::new(data).read_to_end(&mut decoded)?;
            decoded
        }
        CompressionMethod::PackBits => unpackbits(data, expected)?,
        other => {
            return Err(UnsupportedError::UnsupportedCompressionMethod(other.to_u16()).into())
        }
    };

    if decoded.len() < expected {
        return Err(FormatError::InconsistentChunkData {
            actual_bytes: decoded.len(),
            required_bytes: expected,
        }
        .into());
    }
    decoded.truncate(expected);
    Ok(decoded)
}

/// Compress one chunk.
pub fn compress(method: CompressionMethod, data: &[u8]) -> OmeTiffResult<Vec<u8>> {
    match method {
        CompressionMethod::None => Ok(data.to_vec()),
        CompressionMethod::LZW => {
            let mut encoded = Vec::new();
            let mut encoder =
                weezl::encode::Encoder::with_tiff_size_switch(weezl::BitOrder::Msb, 8);
            let result = encoder.into_vec(&mut encoded).encode_all(data);
            result.status?;
            Ok(encoded)
        }
        CompressionMethod::Deflate | CompressionMethod::OldDeflate => {
            let mut encoder = ZlibEncoder::new(Vec::new(), DeflateLevel::default());
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
        CompressionMethod::PackBits => Ok(packbits(data)),
        other => Err(UnsupportedError::UnsupportedCompressionMethod(other.to_u16()).into()),
    }
}

/// PackBits run-length decoding.
fn unpackbits(data: &[u8], expected: usize) -> OmeTiffResult<Vec<u8>> {
    let mut decoded = Vec::with_capacity(expected);
    let mut pos = 0usize;
    while pos < data.len() && decoded.len() < expected {
        let header = data[pos] as i8;
        pos += 1;
        if header >= 0 {
            let count = header as usize + 1;
            if pos + count > data.len() {
                return Err(FormatError::Format(String::from(
                    "PackBits literal run exceeds input",
                ))
                .into());
            }
            decoded.extend_from_slice(&data[pos..pos + count]);
            pos += count;
        } else if header != -128 {
            let count = (1 - header as isize) as usize;
            if pos >= data.len() {
                return Err(FormatError::Format(String::from(
                    "PackBits repeat run missing value",
                ))
                .into());
            }
            decoded.extend(std::iter::repeat(data[pos]).take(count));
            pos += 1;
        }
        // header == -128 is a no-op.
    }
    Ok(decoded)
}

/// PackBits run-length encoding.
fn packbits(data: &[u8]) -> Vec<u8> {
    let mut encoded = Vec::new();
    let mut pos = 0usize;
    while pos < data.len() {
        // Measure the run of identical bytes at the cursor.
        let mut run = 1usize;
        while run < 128 && pos + run < data.len() && data[pos + run] == data[pos] {
            run += 1;
        }

        if run >= 2 {
            encoded.push((1isize - run as isize) as u8);
            encoded.push(data[pos]);
            pos += run;
        } else {
            // Collect literals until the next run of three or the block cap.
            let start = pos;
            let mut len = 1usize;
            while len < 128 && pos + len < data.len() {
                let remaining = data.len() - (pos + len);
                if remaining >= 2
                    && data[pos + len] == data[pos + len + 1]
                    && (remaining < 3 || data[pos + len] == data[pos + len + 2])
                {
                    break;
                }
                len += 1;
            }
            encoded.push((len - 1) as u8);
            encoded.extend_from_slice(&data[start..start + len]);
            pos += len;
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packbits_reference_vector() {
        // The classic Apple PackBits example.
        let encoded = [
            0xFEu8, 0xAA, 0x02, 0x80, 0x00, 0x2A, 0xFD, 0xAA, 0x03, 0x80, 0x00, 0x2A, 0x22, 0xF7,
            0xAA,
        ];
        let expected = [
            0xAAu8, 0xAA, 0xAA, 0x80, 0x00, 0x2A, 0xAA, 0xAA, 0xAA, 0xAA, 0x80, 0x00, 0x2A, 0x22,
            0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA,
        ];
        let decoded = unpackbits(&encoded, expected.len()).unwrap();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn codec_round_trips() {
        let data: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
        for method in [
            CompressionMethod::None,
            CompressionMethod::LZW,
            CompressionMethod::Deflate,
            CompressionMethod::PackBits,
        ] {
            let compressed = compress(method, &data).unwrap();
            let decompressed = decompress(method, &compressed, data.len()).unwrap();
            assert_eq!(decompressed, data, "round trip failed for {:?}", method);
        }
    }

    #[test]
    fn short_output_is_rejected() {
        let compressed = compress(CompressionMethod::Deflate, &[1, 2, 3]).unwrap();
        assert!(decompress(CompressionMethod::Deflate, &compressed, 4).is_err());
    }

    #[test]
    fn scheme_names() {
        assert_eq!(codec_scheme("default").unwrap(), CompressionMethod::None);
        assert_eq!(codec_scheme("LZW").unwrap(), CompressionMethod::LZW);
        assert!(codec_scheme("JPEG-2000").is_err());
    }
}
