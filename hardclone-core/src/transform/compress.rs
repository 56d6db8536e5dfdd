//! Streaming compression codecs.
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use std::io::{self, BufReader, Read, Write};
use xz2::read::XzDecoder;
use xz2::write::XzEncoder;
use zstd::stream::read::Decoder as ZstdDecoder;
use zstd::stream::write::Encoder as ZstdEncoder;

use crate::stage::Compression;

const XZ_PRESET: u32 = 6;
// 0 selects zstd's default level.
const ZSTD_LEVEL: i32 = 0;

pub(crate) fn compress(algorithm: Compression, input: &mut dyn Read, output: &mut dyn Write) -> io::Result<()> {
    match algorithm {
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(output, flate2::Compression::default());
            io::copy(input, &mut encoder)?;
            encoder.finish()?;
        }
        Compression::Xz => {
            let mut encoder = XzEncoder::new(output, XZ_PRESET);
            io::copy(input, &mut encoder)?;
            encoder.finish()?;
        }
        Compression::Zstd => {
            let mut encoder = ZstdEncoder::new(output, ZSTD_LEVEL)?;
            io::copy(input, &mut encoder)?;
            encoder.finish()?;
        }
    }
    Ok(())
}

/// Decompresses a stream. Concatenated members (as produced by appending
/// gzip/xz/zstd outputs) are decoded as one stream, like the command line tools do.
pub(crate) fn decompress(algorithm: Compression, input: &mut dyn Read, output: &mut dyn Write) -> io::Result<()> {
    let mut reader: Box<dyn Read + '_> = match algorithm {
        Compression::Gzip => Box::new(MultiGzDecoder::new(BufReader::new(input))),
        Compression::Xz => Box::new(XzDecoder::new_multi_decoder(BufReader::new(input))),
        Compression::Zstd => Box::new(ZstdDecoder::new(input)?),
    };
    io::copy(&mut reader, output)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        (0..200_000u32).flat_map(|i| (i % 251).to_le_bytes()).collect()
    }

    #[test]
    fn every_codec_round_trips() {
        let data = sample();
        for algorithm in Compression::ALL {
            let mut packed = Vec::new();
            compress(algorithm, &mut data.as_slice(), &mut packed).unwrap();
            assert!(packed.len() < data.len(), "{} did not compress", algorithm.name());

            let mut unpacked = Vec::new();
            decompress(algorithm, &mut packed.as_slice(), &mut unpacked).unwrap();
            assert_eq!(unpacked, data, "{} round trip", algorithm.name());
        }
    }

    #[test]
    fn empty_stream_round_trips() {
        for algorithm in Compression::ALL {
            let mut packed = Vec::new();
            compress(algorithm, &mut io::empty(), &mut packed).unwrap();
            let mut unpacked = Vec::new();
            decompress(algorithm, &mut packed.as_slice(), &mut unpacked).unwrap();
            assert!(unpacked.is_empty());
        }
    }

    #[test]
    fn concatenated_gzip_members_decode_as_one_stream() {
        let mut packed = Vec::new();
        compress(Compression::Gzip, &mut &b"first "[..], &mut packed).unwrap();
        compress(Compression::Gzip, &mut &b"second"[..], &mut packed).unwrap();
        let mut unpacked = Vec::new();
        decompress(Compression::Gzip, &mut packed.as_slice(), &mut unpacked).unwrap();
        assert_eq!(unpacked, b"first second");
    }

    #[test]
    fn garbage_input_fails() {
        let garbage = vec![0x42u8; 4096];
        for algorithm in Compression::ALL {
            let mut out = Vec::new();
            assert!(decompress(algorithm, &mut garbage.as_slice(), &mut out).is_err());
        }
    }
}
