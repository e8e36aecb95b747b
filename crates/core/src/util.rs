//! File helpers used around transfers

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::Result;

const SIZE_UNITS: [&str; 5] = ["Bytes", "KiloBytes", "MegaBytes", "GigaBytes", "TeraBytes"];

const CHECKSUM_CHUNK: usize = 8192;

/// Human readable size, e.g. `1,023 Bytes` or `1.5 KiloBytes` (1024-based).
///
/// Zero is rendered as a bare `"0"`. At most one decimal is shown and it is
/// dropped when it rounds to zero.
pub fn readable_file_size(bytes: u64) -> String {
    if bytes == 0 {
        return "0".to_string();
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < SIZE_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let tenths = (value * 10.0).round() as u64;
    let whole = group_thousands(tenths / 10);
    match tenths % 10 {
        0 => format!("{} {}", whole, SIZE_UNITS[unit]),
        decimal => format!("{}.{} {}", whole, decimal, SIZE_UNITS[unit]),
    }
}

fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Lowercase hex SHA-256 of a file's contents
pub fn file_checksum(path: impl AsRef<Path>) -> Result<String> {
    let mut file = File::open(path.as_ref())?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHECKSUM_CHUNK];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Final component of `path`, if it has one
pub fn file_name(path: impl AsRef<Path>) -> Option<String> {
    path.as_ref()
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_readable_file_size() {
        assert_eq!(readable_file_size(0), "0");
        assert_eq!(readable_file_size(1), "1 Bytes");
        assert_eq!(readable_file_size(1023), "1,023 Bytes");
        assert_eq!(readable_file_size(1024), "1 KiloBytes");
        assert_eq!(readable_file_size(1536), "1.5 KiloBytes");
        assert_eq!(readable_file_size(10 * 1024 * 1024), "10 MegaBytes");
        assert_eq!(readable_file_size(3 * 1024 * 1024 * 1024 / 2), "1.5 GigaBytes");
        assert_eq!(readable_file_size(2 * 1024u64.pow(4)), "2 TeraBytes");
    }

    #[test]
    fn test_readable_file_size_caps_unit() {
        assert_eq!(readable_file_size(1024u64.pow(5)), "1,024 TeraBytes");
    }

    #[test]
    fn test_readable_file_size_rounds_up_into_grouping() {
        // 1023.96 KiB rounds to 1024.0 and stays in KiloBytes
        assert_eq!(readable_file_size(1_048_535), "1,024 KiloBytes");
    }

    #[test]
    fn test_group_thousands() {
        assert_eq!(group_thousands(0), "0");
        assert_eq!(group_thousands(999), "999");
        assert_eq!(group_thousands(1000), "1,000");
        assert_eq!(group_thousands(1234567), "1,234,567");
    }

    #[test]
    fn test_file_checksum() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("abc.txt");
        std::fs::write(&path, b"abc").unwrap();

        assert_eq!(
            file_checksum(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_file_checksum_empty_and_large() {
        let dir = tempdir().unwrap();
        let empty = dir.path().join("empty");
        std::fs::write(&empty, b"").unwrap();
        assert_eq!(
            file_checksum(&empty).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );

        // Spans several read chunks; must equal a one-shot digest
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        let large = dir.path().join("large");
        std::fs::write(&large, &data).unwrap();
        assert_eq!(
            file_checksum(&large).unwrap(),
            hex::encode(Sha256::digest(&data))
        );
    }

    #[test]
    fn test_file_checksum_missing() {
        let dir = tempdir().unwrap();
        assert!(file_checksum(dir.path().join("nope")).is_err());
    }

    #[test]
    fn test_file_name() {
        assert_eq!(file_name("/tmp/report.pdf").as_deref(), Some("report.pdf"));
        assert_eq!(file_name("notes.txt").as_deref(), Some("notes.txt"));
        assert_eq!(file_name("/"), None);
    }
}
