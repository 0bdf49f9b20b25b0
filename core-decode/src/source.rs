//! # Source Resolution
//!
//! Turns what the caller hands us (a path or `file://` URI, an open file
//! descriptor with a byte range, an asset name, or bytes already in memory)
//! into a [`ResolvedSource`] the engine can read.
//!
//! Resolution is the first thing a decode does. A source that cannot be read
//! fails here, before the destination is created or the engine configured.

use crate::error::{DecodeError, Result};
use bytes::Bytes;
use core_runtime::logging::strip_path;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use symphonia::core::io::MediaSource;
use tracing::debug;

const FILE_SCHEME: &str = "file://";

// ============================================================================
// Descriptors
// ============================================================================

/// Where the compressed stream comes from.
#[derive(Debug)]
pub enum SourceDescriptor {
    /// Filesystem path or `file://` URI.
    Uri(String),

    /// An open file and the byte range holding the stream.
    /// `length: None` means "to the end of the file".
    FileDescriptor {
        file: File,
        offset: u64,
        length: Option<u64>,
    },

    /// Name looked up through the session's [`AssetResolver`].
    Asset(String),

    /// Compressed bytes already in memory.
    Memory {
        data: Bytes,
        /// Container extension used as a probe hint ("flac", "mp3").
        extension: Option<String>,
    },
}

impl SourceDescriptor {
    pub fn uri(uri: impl Into<String>) -> Self {
        SourceDescriptor::Uri(uri.into())
    }

    pub fn path(path: impl AsRef<Path>) -> Self {
        SourceDescriptor::Uri(path.as_ref().to_string_lossy().into_owned())
    }

    pub fn asset(name: impl Into<String>) -> Self {
        SourceDescriptor::Asset(name.into())
    }

    pub fn memory(data: impl Into<Bytes>, extension: Option<&str>) -> Self {
        SourceDescriptor::Memory {
            data: data.into(),
            extension: extension.map(str::to_string),
        }
    }

    /// Take ownership of a raw descriptor handed over by a host.
    #[cfg(unix)]
    pub fn from_owned_fd(fd: std::os::fd::OwnedFd, offset: u64, length: Option<u64>) -> Self {
        SourceDescriptor::FileDescriptor {
            file: File::from(fd),
            offset,
            length,
        }
    }

    /// Short label for logs; never a full path.
    pub fn label(&self) -> String {
        match self {
            SourceDescriptor::Uri(uri) => strip_path(uri).to_string(),
            SourceDescriptor::FileDescriptor { offset, .. } => format!("fd@{}", offset),
            SourceDescriptor::Asset(name) => format!("asset:{}", strip_path(name)),
            SourceDescriptor::Memory { data, .. } => format!("memory[{}]", data.len()),
        }
    }
}

// ============================================================================
// Resolved Sources
// ============================================================================

/// A readable source, ready to hand to an engine.
pub enum ResolvedSource {
    File {
        file: File,
        offset: u64,
        length: u64,
        name: String,
        extension: Option<String>,
    },
    Memory {
        data: Bytes,
        name: String,
        extension: Option<String>,
    },
}

impl ResolvedSource {
    pub fn name(&self) -> &str {
        match self {
            ResolvedSource::File { name, .. } | ResolvedSource::Memory { name, .. } => name,
        }
    }

    pub fn extension(&self) -> Option<&str> {
        match self {
            ResolvedSource::File { extension, .. } | ResolvedSource::Memory { extension, .. } => {
                extension.as_deref()
            }
        }
    }

    /// Size of the compressed stream in bytes.
    pub fn len(&self) -> u64 {
        match self {
            ResolvedSource::File { length, .. } => *length,
            ResolvedSource::Memory { data, .. } => data.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reader positioned at the start of the stream.
    pub fn into_media_source(self) -> io::Result<Box<dyn MediaSource>> {
        match self {
            ResolvedSource::File {
                file,
                offset,
                length,
                ..
            } => Ok(Box::new(RangedSource::new(file, offset, length)?)),
            ResolvedSource::Memory { data, .. } => Ok(Box::new(io::Cursor::new(data))),
        }
    }
}

impl fmt::Debug for ResolvedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedSource")
            .field("name", &self.name())
            .field("extension", &self.extension())
            .field("len", &self.len())
            .finish()
    }
}

/// A byte window `[offset, offset + length)` of a file.
pub struct RangedSource {
    file: File,
    start: u64,
    len: u64,
    pos: u64,
}

impl RangedSource {
    pub fn new(mut file: File, start: u64, len: u64) -> io::Result<Self> {
        file.seek(SeekFrom::Start(start))?;
        Ok(Self {
            file,
            start,
            len,
            pos: 0,
        })
    }
}

impl Read for RangedSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.len.saturating_sub(self.pos);
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let n = self.file.read(&mut buf[..want])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for RangedSource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(delta) => self.len.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        }
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of range")
        })?;

        self.file.seek(SeekFrom::Start(self.start + target))?;
        self.pos = target;
        Ok(target)
    }
}

impl MediaSource for RangedSource {
    fn is_seekable(&self) -> bool {
        true
    }

    fn byte_len(&self) -> Option<u64> {
        Some(self.len)
    }
}

// ============================================================================
// Assets
// ============================================================================

/// Looks up named assets bundled with the host application.
pub trait AssetResolver: Send + Sync {
    /// `Ok(None)` when no asset has that name.
    fn open(&self, name: &str) -> Result<Option<ResolvedSource>>;
}

/// Assets stored as plain files under a root directory.
#[derive(Debug, Clone)]
pub struct DirectoryAssets {
    root: PathBuf,
}

impl DirectoryAssets {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl AssetResolver for DirectoryAssets {
    fn open(&self, name: &str) -> Result<Option<ResolvedSource>> {
        let relative = Path::new(name);
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(DecodeError::AssetNotFound(format!(
                "{}: asset names must be relative",
                name
            )));
        }

        let path = self.root.join(relative);
        if !path.is_file() {
            return Ok(None);
        }
        open_file_range(&path, name).map(Some)
    }
}

/// Assets compiled into the binary or loaded up front.
#[derive(Debug, Clone, Default)]
pub struct EmbeddedAssets {
    entries: HashMap<String, Bytes>,
}

impl EmbeddedAssets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.insert(name, data);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, data: impl Into<Bytes>) {
        self.entries.insert(name.into(), data.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl AssetResolver for EmbeddedAssets {
    fn open(&self, name: &str) -> Result<Option<ResolvedSource>> {
        Ok(self.entries.get(name).map(|data| ResolvedSource::Memory {
            data: data.clone(),
            name: format!("asset:{}", strip_path(name)),
            extension: extension_of(Path::new(name)),
        }))
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// Resolve a descriptor, checking that the source is readable.
///
/// # Errors
///
/// - [`DecodeError::SourceUnreadable`] for missing or unreadable files,
///   out-of-range descriptor windows and non-file URI schemes
/// - [`DecodeError::AssetNotFound`] for unknown asset names, or when no
///   resolver is configured
pub fn resolve(
    descriptor: SourceDescriptor,
    assets: Option<&dyn AssetResolver>,
) -> Result<ResolvedSource> {
    let resolved = match descriptor {
        SourceDescriptor::Uri(uri) => {
            let path = path_from_uri(&uri)?;
            open_file_range(&path, strip_path(&uri))?
        }
        SourceDescriptor::FileDescriptor {
            file,
            offset,
            length,
        } => resolve_descriptor(file, offset, length)?,
        SourceDescriptor::Asset(name) => {
            let resolver = assets.ok_or_else(|| {
                DecodeError::AssetNotFound(format!("{}: no asset resolver configured", name))
            })?;
            resolver
                .open(&name)?
                .ok_or_else(|| DecodeError::AssetNotFound(name.clone()))?
        }
        SourceDescriptor::Memory { data, extension } => ResolvedSource::Memory {
            name: format!("memory[{}]", data.len()),
            data,
            extension,
        },
    };

    debug!(
        source = resolved.name(),
        bytes = resolved.len(),
        "source resolved"
    );
    Ok(resolved)
}

fn path_from_uri(uri: &str) -> Result<PathBuf> {
    if let Some(rest) = uri.strip_prefix(FILE_SCHEME) {
        // file://localhost/x and file:///x both name /x
        let rest = rest.strip_prefix("localhost").unwrap_or(rest);
        return Ok(PathBuf::from(rest));
    }
    if let Some((scheme, _)) = uri.split_once("://") {
        return Err(DecodeError::SourceUnreadable(format!(
            "unsupported URI scheme `{}`",
            scheme
        )));
    }
    Ok(PathBuf::from(uri))
}

fn open_file_range(path: &Path, label: &str) -> Result<ResolvedSource> {
    let unreadable =
        |e: io::Error| DecodeError::SourceUnreadable(format!("{}: {}", strip_path(label), e));

    let file = File::open(path).map_err(unreadable)?;
    let metadata = file.metadata().map_err(unreadable)?;
    if !metadata.is_file() {
        return Err(DecodeError::SourceUnreadable(format!(
            "{}: not a regular file",
            strip_path(label)
        )));
    }

    Ok(ResolvedSource::File {
        file,
        offset: 0,
        length: metadata.len(),
        name: strip_path(label).to_string(),
        extension: extension_of(path),
    })
}

fn resolve_descriptor(file: File, offset: u64, length: Option<u64>) -> Result<ResolvedSource> {
    let size = file
        .metadata()
        .map_err(|e| DecodeError::SourceUnreadable(format!("fd: {}", e)))?
        .len();

    let available = size.checked_sub(offset).ok_or_else(|| {
        DecodeError::SourceUnreadable(format!("fd: offset {} beyond end ({})", offset, size))
    })?;
    let length = match length {
        Some(len) if len > available => {
            return Err(DecodeError::SourceUnreadable(format!(
                "fd: range {}+{} beyond end ({})",
                offset, len, size
            )))
        }
        Some(len) => len,
        None => available,
    };

    Ok(ResolvedSource::File {
        file,
        offset,
        length,
        name: format!("fd@{}", offset),
        extension: None,
    })
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
}
