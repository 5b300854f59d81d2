//! Streaming gzip/zstd codecs.

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{self, Read, Write};

use crate::models::CompressionAlgorithm;

/// Compress everything from `input` into `output`, finishing the frame.
pub fn compress<R: Read, W: Write>(
    algorithm: CompressionAlgorithm,
    level: u32,
    input: &mut R,
    output: W,
) -> io::Result<W> {
    match algorithm {
        CompressionAlgorithm::Gzip => {
            let mut encoder = GzEncoder::new(output, Compression::new(level.clamp(1, 9)));
            io::copy(input, &mut encoder)?;
            encoder.finish()
        }
        CompressionAlgorithm::Zstd => {
            let mut encoder = zstd::Encoder::new(output, level.clamp(1, 9) as i32)?;
            io::copy(input, &mut encoder)?;
            encoder.finish()
        }
    }
}

/// Decompress everything from `input` into `output`.
pub fn decompress<R: Read, W: Write>(
    algorithm: CompressionAlgorithm,
    input: R,
    output: &mut W,
) -> io::Result<u64> {
    match algorithm {
        CompressionAlgorithm::Gzip => {
            let mut decoder = MultiGzDecoder::new(input);
            io::copy(&mut decoder, output)
        }
        CompressionAlgorithm::Zstd => {
            let mut decoder = zstd::Decoder::new(input)?;
            io::copy(&mut decoder, output)
        }
    }
}
