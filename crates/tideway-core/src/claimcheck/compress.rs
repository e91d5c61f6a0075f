//! Gzip helpers for offloaded payloads.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

pub fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

pub fn gunzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::with_capacity(bytes.len() * 2);
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_roundtrip_shrinks_repetitive_data() {
        let data = "abcdefgh".repeat(4096).into_bytes();
        let packed = gzip(&data).unwrap();
        assert!(packed.len() < data.len() / 10);
        assert_eq!(gunzip(&packed).unwrap(), data);
    }

    #[test]
    fn test_gunzip_rejects_plain_bytes() {
        assert!(gunzip(b"definitely not gzip").is_err());
    }
}
