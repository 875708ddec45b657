//! File operations: metadata, content hashing and destination paths.

use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::error::{Error, Result};

/// Metadata of a file about to be offered to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    /// Absolute or caller-relative path on the local disk
    pub path: PathBuf,
    /// Bare file name sent to the peer
    pub file_name: String,
    /// File size in bytes
    pub size: u64,
}

impl FileMetadata {
    /// Create metadata from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the path does not exist, is not a regular file
    /// or has no usable file name.
    pub async fn from_path(path: &Path) -> Result<Self> {
        let metadata = tokio::fs::metadata(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::FileNotFound(path.display().to_string())
            } else {
                Error::Io(e)
            }
        })?;

        if !metadata.is_file() {
            return Err(Error::InvalidPath(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| Error::InvalidPath(path.display().to_string()))?;

        Ok(Self {
            path: path.to_path_buf(),
            file_name,
            size: metadata.len(),
        })
    }
}

/// Encode a digest as lowercase hex.
#[must_use]
pub fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut acc, b| {
        let _ = write!(acc, "{b:02x}");
        acc
    })
}

/// Compute the SHA-256 digest of a file, reading `chunk_size` bytes at a time.
///
/// The result does not depend on `chunk_size`.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub async fn hash_file(path: &Path, chunk_size: usize) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; chunk_size.max(1)];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(to_hex(&hasher.finalize()))
}

/// Resolve where an incoming file should be written.
///
/// Only the final component of the peer-supplied name is used, so a name
/// such as `../../etc/passwd` lands as `passwd` inside `directory`.
/// Returns `None` for names with no usable final component.
#[must_use]
pub fn destination_path(directory: &Path, file_name: &str) -> Option<PathBuf> {
    let normalized = file_name.replace('\\', "/");
    let name = Path::new(&normalized)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .next_back()?;

    let full_path = directory.join(name);
    if full_path.parent() == Some(directory) {
        Some(full_path)
    } else {
        None
    }
}

/// Format a file size for display.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
