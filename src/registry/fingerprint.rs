use crate::error::AppError;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::OnceLock;

const CHUNK_SIZE: usize = 1024 * 1024;

/// SHA-256 of the whole file, read in 1 MiB chunks, hex encoded.
pub fn fingerprint_file(path: &Path) -> Result<String, AppError> {
    let mut file = File::open(path)
        .map_err(|e| AppError::Io(format!("failed to open {} for hashing: {}", path.display(), e)))?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| AppError::Io(format!("failed to read {} for hashing: {}", path.display(), e)))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Episode number from the file stem. Digits after an episode marker
/// (`ep`, `e`, `episode`, `第`) win; otherwise the first run of ASCII digits
/// (`S02E05.mp4` -> 5, `2024_ep03.mp4` -> 3, `第12集.mkv` -> 12, `07.mp4` -> 7).
pub fn parse_episode_number(path: &Path) -> Option<i64> {
    static MARKED: OnceLock<Option<Regex>> = OnceLock::new();
    static DIGITS: OnceLock<Option<Regex>> = OnceLock::new();
    let stem = path.file_stem()?.to_string_lossy();

    let marked = MARKED
        .get_or_init(|| {
            Regex::new(r"(?i)(?:(?:^|[^a-z])(?:episode|ep|e)[ ._-]*|第\s*)([0-9]+)").ok()
        })
        .as_ref()?;
    if let Some(m) = marked.captures(&stem).and_then(|c| c.get(1)) {
        return m.as_str().parse().ok();
    }

    let digits = DIGITS.get_or_init(|| Regex::new(r"[0-9]+").ok()).as_ref()?;
    digits.find(&stem)?.as_str().parse().ok()
}
