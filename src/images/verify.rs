use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::error::{ConsoleError, Result};

/// SHA-256 of a file as lowercase hex.
pub fn sha256_file(file_path: &Path) -> Result<String> {
    let mut file = File::open(file_path).map_err(|e| {
        ConsoleError::Transfer(format!("Failed to open file for hash verification: {}", e))
    })?;

    let mut hasher = Sha256::new();
    let mut buffer = [0; 8192];

    loop {
        let bytes_read = file.read(&mut buffer).map_err(|e| {
            ConsoleError::Transfer(format!("Failed to read file during hash verification: {}", e))
        })?;

        if bytes_read == 0 {
            break;
        }

        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

pub fn verify_sha256(file_path: &Path, expected_hash: &str) -> Result<()> {
    let hash_hex = sha256_file(file_path)?;

    if hash_hex == expected_hash.to_lowercase() {
        Ok(())
    } else {
        Err(ConsoleError::Transfer(format!(
            "Hash verification failed. Expected: {}, got: {}",
            expected_hash, hash_hex
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // sha256("hello world")
    const HELLO: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn verifies_matching_hash_case_insensitively() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();

        assert_eq!(sha256_file(file.path()).unwrap(), HELLO);
        verify_sha256(file.path(), &HELLO.to_uppercase()).unwrap();
    }

    #[test]
    fn rejects_mismatched_hash() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello world!").unwrap();

        let err = verify_sha256(file.path(), HELLO).unwrap_err();
        assert!(err.to_string().starts_with("Hash verification failed"));
    }
}
