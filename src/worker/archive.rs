//! Tar helpers for moving files in and out of job containers.

use std::io::{Cursor, Read};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::read::GzDecoder;

/// Mode of every file written into a container: read-only for everyone.
pub const ENTRY_MODE: u32 = 0o444;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("Failed to parse invalid content")]
    InvalidContent,

    #[error("Failed to decode content base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Failed to extract content, unsupported archive format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to read archive: {0}")]
    Io(#[from] std::io::Error),
}

/// One file of an archive built in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarEntry {
    pub name: String,
    pub content: Vec<u8>,
}

impl TarEntry {
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// Build an uncompressed tar of regular files with mode 0444.
pub fn create_tar(entries: &[TarEntry]) -> Result<Vec<u8>, ArchiveError> {
    let mut builder = tar::Builder::new(Vec::new());
    for entry in entries {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(entry.content.len() as u64);
        header.set_mode(ENTRY_MODE);
        builder.append_data(&mut header, &entry.name, entry.content.as_slice())?;
    }
    Ok(builder.into_inner()?)
}

fn same_entry(path: &str, name: &str) -> bool {
    let trim = |p: &str| p.trim_start_matches("./").trim_start_matches('/').to_string();
    trim(path) == trim(name)
}

/// Contents of the entry called `name`, ignoring any leading `./` or `/`.
pub fn read_entry(archive: &[u8], name: &str) -> Result<Option<Vec<u8>>, ArchiveError> {
    let mut tar = tar::Archive::new(Cursor::new(archive));
    for entry in tar.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().into_owned();
        if same_entry(&path, name) {
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            return Ok(Some(buf));
        }
    }
    Ok(None)
}

/// Read one entry, rewrite its bytes and return a single-entry archive
/// holding the result under the same name. A missing entry is transformed
/// from empty contents.
pub fn transform_entry<F>(archive: &[u8], name: &str, transform: F) -> Result<Vec<u8>, ArchiveError>
where
    F: FnOnce(Vec<u8>) -> Vec<u8>,
{
    let current = read_entry(archive, name)?.unwrap_or_default();
    create_tar(&[TarEntry::new(name, transform(current))])
}

/// Decode job content of the form `<format>,<base64>` into a plain tar.
///
/// Only `targz` is understood.
pub fn decode_content(content: &str) -> Result<Vec<u8>, ArchiveError> {
    let (format, data) = content
        .split_once(',')
        .filter(|(_, data)| !data.contains(','))
        .ok_or(ArchiveError::InvalidContent)?;
    let data = STANDARD.decode(data.trim())?;
    match format {
        "targz" => {
            let mut tar = Vec::new();
            GzDecoder::new(data.as_slice()).read_to_end(&mut tar)?;
            Ok(tar)
        }
        other => Err(ArchiveError::UnsupportedFormat(other.to_string())),
    }
}
