use std::{
    fs::{self, File},
    io::{self, ErrorKind, Read},
};

use thiserror::Error;
use tracing::{debug, warn};

use crate::{config::AssetConfig, routing::strip_query};

const CONTENT_TYPES: &[(&str, &str)] = &[
    ("html", "text/html"),
    ("css", "text/css"),
    ("js", "application/javascript"),
    ("json", "application/json"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("svg", "image/svg+xml"),
    ("ico", "image/x-icon"),
    ("woff", "font/woff"),
    ("woff2", "font/woff2"),
    ("ttf", "font/ttf"),
];

pub const FALLBACK_CONTENT_TYPE: &str = "text/plain";

pub fn content_type_for(path: &str) -> &'static str {
    let name = path.rsplit('/').next().unwrap_or(path);
    let Some((_, extension)) = name.rsplit_once('.') else {
        return FALLBACK_CONTENT_TYPE;
    };

    CONTENT_TYPES
        .iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(extension))
        .map(|(_, content_type)| *content_type)
        .unwrap_or(FALLBACK_CONTENT_TYPE)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("resolved path is {len} bytes, limit is {limit}")]
    TooLong { len: usize, limit: usize },
    #[error("request path is not absolute")]
    NotAbsolute,
    #[error("request path contains an empty, `.` or `..` segment")]
    Traversal,
    #[error("request path contains a backslash or NUL")]
    ForbiddenCharacter,
}

impl ResolveError {
    pub fn status(&self) -> u16 {
        match self {
            Self::TooLong { .. } => 414,
            _ => 400,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAsset {
    /// Request path after default-document substitution.
    pub relative: String,
    pub fs_path: String,
    pub content_type: &'static str,
}

#[derive(Debug, Clone)]
pub struct AssetResolver {
    mount_root: String,
    default_document: String,
    max_path_len: usize,
}

impl AssetResolver {
    pub fn new(config: &AssetConfig) -> Self {
        Self {
            mount_root: config.mount_root.clone(),
            default_document: config.default_document.clone(),
            max_path_len: config.max_path_len,
        }
    }

    pub fn mount_root(&self) -> &str {
        &self.mount_root
    }

    pub fn resolve(&self, request_path: &str) -> Result<ResolvedAsset, ResolveError> {
        let path = strip_query(request_path);
        let relative = if path == "/" {
            format!("/{}", self.default_document)
        } else {
            path.to_string()
        };

        let fs_path = format!("{}{}", self.mount_root, relative);
        if fs_path.len() > self.max_path_len {
            return Err(ResolveError::TooLong {
                len: fs_path.len(),
                limit: self.max_path_len,
            });
        }

        validate_request_path(&relative)?;

        Ok(ResolvedAsset {
            content_type: content_type_for(&relative),
            relative,
            fs_path,
        })
    }
}

fn validate_request_path(path: &str) -> Result<(), ResolveError> {
    let Some(rest) = path.strip_prefix('/') else {
        return Err(ResolveError::NotAbsolute);
    };

    if path.contains(['\\', '\0']) {
        return Err(ResolveError::ForbiddenCharacter);
    }

    if rest
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(ResolveError::Traversal);
    }

    Ok(())
}

/// Read side of the flash filesystem.
pub trait AssetStore: Send + Sync {
    type Reader: Read + Send;

    fn open(&self, fs_path: &str) -> io::Result<Self::Reader>;

    /// Entry names directly under the mount root.
    fn list(&self) -> io::Result<Vec<String>>;
}

/// Filesystem already mounted into the process path namespace (SPIFFS via the
/// ESP-IDF VFS, or a plain directory on the host).
#[derive(Debug, Clone)]
pub struct MountedFs {
    root: String,
}

impl MountedFs {
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }
}

impl AssetStore for MountedFs {
    type Reader = File;

    fn open(&self, fs_path: &str) -> io::Result<File> {
        let file = File::open(fs_path)?;
        if file.metadata()?.is_dir() {
            return Err(io::Error::new(ErrorKind::NotFound, "path is a directory"));
        }
        Ok(file)
    }

    fn list(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}

/// Destination of a chunked response body.
pub trait ChunkSink {
    type Error;

    fn send_chunk(&mut self, chunk: &[u8]) -> Result<(), Self::Error>;

    /// Terminates the body (the empty chunk in chunked transfer).
    fn finish(&mut self) -> Result<(), Self::Error>;
}

#[derive(Debug, Error)]
pub enum StreamError<E> {
    #[error("asset read failed: {0}")]
    Read(io::Error),
    #[error("chunk send failed: {0}")]
    Send(E),
}

/// Copies `reader` to `sink` one chunk at a time. The terminating chunk is sent
/// only when the whole file went out.
pub fn stream_chunks<R, S>(
    reader: &mut R,
    sink: &mut S,
    chunk_size: usize,
) -> Result<u64, StreamError<S::Error>>
where
    R: Read + ?Sized,
    S: ChunkSink + ?Sized,
{
    let mut buf = vec![0_u8; chunk_size.max(1)];
    let mut total = 0_u64;

    loop {
        let read = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(StreamError::Read(err)),
        };

        sink.send_chunk(&buf[..read]).map_err(StreamError::Send)?;
        total += read as u64;
    }

    sink.finish().map_err(StreamError::Send)?;
    Ok(total)
}

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("rejected request path: {0}")]
    Rejected(#[from] ResolveError),
    #[error("asset `{path}` not found: {source}")]
    NotFound {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl ServeError {
    pub fn status(&self) -> u16 {
        match self {
            Self::Rejected(err) => err.status(),
            Self::NotFound { .. } => 404,
        }
    }
}

pub struct MissingAsset<'a> {
    pub asset: &'a ResolvedAsset,
    pub error: &'a io::Error,
    pub mount_root: &'a str,
    lister: &'a (dyn Fn() -> io::Result<Vec<String>> + 'a),
}

impl MissingAsset<'_> {
    /// Reads the mount root; only hooks that call this pay for the listing.
    pub fn entries(&self) -> io::Result<Vec<String>> {
        (self.lister)()
    }
}

pub type MissingAssetHook = Box<dyn Fn(&MissingAsset<'_>) + Send + Sync>;

pub fn log_mount_listing(missing: &MissingAsset<'_>) {
    warn!(
        "asset {} not found ({}), listing {}",
        missing.asset.fs_path, missing.error, missing.mount_root
    );
    match missing.entries() {
        Ok(entries) => {
            for entry in entries {
                debug!(mount_root = missing.mount_root, entry = %entry, "mount entry");
            }
        }
        Err(err) => warn!("failed to list {}: {err}", missing.mount_root),
    }
}

pub struct OpenedAsset<R> {
    pub asset: ResolvedAsset,
    pub reader: R,
}

pub struct AssetService<S: AssetStore> {
    store: S,
    resolver: AssetResolver,
    chunk_size: usize,
    on_missing: MissingAssetHook,
}

impl<S: AssetStore> AssetService<S> {
    pub fn new(store: S, config: &AssetConfig) -> Self {
        Self {
            store,
            resolver: AssetResolver::new(config),
            chunk_size: config.chunk_size,
            on_missing: Box::new(log_mount_listing),
        }
    }

    pub fn with_missing_hook(mut self, hook: MissingAssetHook) -> Self {
        self.on_missing = hook;
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn resolver(&self) -> &AssetResolver {
        &self.resolver
    }

    pub fn open(&self, request_path: &str) -> Result<OpenedAsset<S::Reader>, ServeError> {
        let asset = self.resolver.resolve(request_path)?;

        match self.store.open(&asset.fs_path) {
            Ok(reader) => Ok(OpenedAsset { asset, reader }),
            Err(error) => {
                let lister = || self.store.list();
                (self.on_missing)(&MissingAsset {
                    asset: &asset,
                    error: &error,
                    mount_root: self.resolver.mount_root(),
                    lister: &lister,
                });
                Err(ServeError::NotFound {
                    path: asset.relative,
                    source: error,
                })
            }
        }
    }

    pub fn stream<K>(
        &self,
        opened: &mut OpenedAsset<S::Reader>,
        sink: &mut K,
    ) -> Result<u64, StreamError<K::Error>>
    where
        K: ChunkSink + ?Sized,
    {
        let sent = stream_chunks(&mut opened.reader, sink, self.chunk_size)?;
        debug!(
            "served {} ({} bytes, {})",
            opened.asset.relative, sent, opened.asset.content_type
        );
        Ok(sent)
    }
}
