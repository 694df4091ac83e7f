//! Archive codec.
//!
//! One source (a directory tree or a single file) becomes one tar stream,
//! compressed with zstd or, when zstd cannot be used, gzip. The sha256 digest
//! of the archive bytes is computed while they are written so the pipeline
//! never has to read an archive back just to fingerprint it.

use crate::config::BackupConfig;
use crate::fs::{make_owner_writable, permission_bits, set_mode};
use crate::utils::errors::{Result, SuiteError};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cell::Cell;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];
const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Archive compression format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Zstd,
    Gzip,
}

impl Compression {
    pub fn extension(self) -> &'static str {
        match self {
            Compression::Zstd => "tar.zst",
            Compression::Gzip => "tar.gz",
        }
    }

    /// Identify the format from the first bytes of an archive.
    pub fn detect(header: &[u8]) -> Option<Self> {
        if header.starts_with(&ZSTD_MAGIC) {
            Some(Compression::Zstd)
        } else if header.starts_with(&GZIP_MAGIC) {
            Some(Compression::Gzip)
        } else {
            None
        }
    }

    /// Resolve the preferred format against what this host can actually encode.
    pub fn resolve(preferred: Compression, level: i32) -> Compression {
        match preferred {
            Compression::Zstd => match zstd::stream::write::Encoder::new(io::sink(), level) {
                Ok(_) => Compression::Zstd,
                Err(e) => {
                    warn!("zstd unavailable ({}), falling back to gzip", e);
                    Compression::Gzip
                }
            },
            Compression::Gzip => Compression::Gzip,
        }
    }
}

/// Options for [`pack`]
#[derive(Debug, Clone)]
pub struct PackOptions {
    pub compression: Compression,
    pub level: i32,
    /// File names (exact match) skipped anywhere in the tree
    pub exclude_patterns: Vec<String>,
}

impl PackOptions {
    pub fn from_config(config: &BackupConfig) -> Self {
        Self {
            compression: Compression::resolve(config.compression, config.compression_level),
            level: config.compression_level,
            exclude_patterns: config.exclude_patterns.clone(),
        }
    }
}

impl Default for PackOptions {
    fn default() -> Self {
        Self::from_config(&BackupConfig::default())
    }
}

/// Result of packing one source
#[derive(Debug, Clone)]
pub struct PackOutcome {
    pub compression: Compression,
    pub source_size_bytes: u64,
    pub archive_size_bytes: u64,
    /// sha256 of the archive file, lowercase hex
    pub digest: String,
    pub files: usize,
    /// Unreadable or special files left out of the archive
    pub skipped: usize,
}

/// Options for [`unpack`]
#[derive(Debug, Clone, Copy, Default)]
pub struct UnpackOptions {
    pub overwrite: bool,
    /// Leading path components dropped from every entry
    pub strip_components: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnpackOutcome {
    pub written: usize,
    pub skipped: usize,
}

#[derive(Default)]
struct SourceStats {
    bytes: u64,
    files: usize,
    skipped: usize,
}

/// Writer that fingerprints and counts everything passing through it.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    fn finish(self) -> (W, String, u64) {
        (self.inner, format!("{:x}", self.hasher.finalize()), self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Reader that remembers whether the archive side ever failed, so unpack
/// errors can be told apart from destination write errors.
struct TrackedReader<R> {
    inner: R,
    failed: Rc<Cell<bool>>,
}

impl<R: Read> Read for TrackedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).inspect_err(|_| self.failed.set(true))
    }
}

/// Name of the top-level entry inside the archive.
pub fn archive_root_name(source: &Path) -> String {
    source
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "backup".to_string())
}

/// Compress `source` into a new archive at `archive_path`.
pub fn pack(source: &Path, archive_path: &Path, options: &PackOptions) -> Result<PackOutcome> {
    let root_name = archive_root_name(source);
    let file = File::create(archive_path).map_err(|e| SuiteError::compression(archive_path, e))?;
    let writer = HashingWriter::new(BufWriter::new(file));

    let (writer, stats) = match options.compression {
        Compression::Zstd => {
            let encoder = zstd::stream::write::Encoder::new(writer, options.level)
                .map_err(|e| SuiteError::compression(archive_path, e))?;
            let (encoder, stats) = write_tar(encoder, source, &root_name, options)?;
            let writer = encoder
                .finish()
                .map_err(|e| SuiteError::compression(archive_path, e))?;
            (writer, stats)
        }
        Compression::Gzip => {
            let level = options.level.clamp(0, 9) as u32;
            let encoder = GzEncoder::new(writer, flate2::Compression::new(level));
            let (encoder, stats) = write_tar(encoder, source, &root_name, options)?;
            let writer = encoder
                .finish()
                .map_err(|e| SuiteError::compression(archive_path, e))?;
            (writer, stats)
        }
    };

    let (buffered, digest, archive_size_bytes) = writer.finish();
    let file = buffered
        .into_inner()
        .map_err(|e| SuiteError::compression(archive_path, e.into_error()))?;
    file.sync_all()
        .map_err(|e| SuiteError::compression(archive_path, e))?;

    debug!(
        "Packed {} -> {} ({} files, {} bytes -> {} bytes)",
        source.display(),
        archive_path.display(),
        stats.files,
        stats.bytes,
        archive_size_bytes
    );

    Ok(PackOutcome {
        compression: options.compression,
        source_size_bytes: stats.bytes,
        archive_size_bytes,
        digest,
        files: stats.files,
        skipped: stats.skipped,
    })
}

fn write_tar<W: Write>(
    encoder: W,
    source: &Path,
    root_name: &str,
    options: &PackOptions,
) -> Result<(W, SourceStats)> {
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let stats = append_source(&mut builder, source, root_name, options)?;
    let encoder = builder
        .into_inner()
        .map_err(|e| SuiteError::compression(source, e))?;
    Ok((encoder, stats))
}

fn append_source<W: Write>(
    builder: &mut tar::Builder<W>,
    source: &Path,
    root_name: &str,
    options: &PackOptions,
) -> Result<SourceStats> {
    let mut stats = SourceStats::default();
    let root = Path::new(root_name);

    let metadata = fs::symlink_metadata(source).map_err(|e| SuiteError::compression(source, e))?;
    if !metadata.is_dir() {
        append_entry(builder, source, root, metadata.file_type(), &mut stats)?;
        return Ok(stats);
    }

    let walker = WalkDir::new(source)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_excluded(e, &options.exclude_patterns));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if is_permission_denied(&e) => {
                warn!("Skipping unreadable entry: {}", e);
                stats.skipped += 1;
                continue;
            }
            Err(e) => return Err(SuiteError::compression(source, e)),
        };

        let relative = entry.path().strip_prefix(source).unwrap_or(entry.path());
        let name = root.join(relative);
        append_entry(builder, entry.path(), &name, entry.file_type(), &mut stats)?;
    }

    Ok(stats)
}

fn append_entry<W: Write>(
    builder: &mut tar::Builder<W>,
    path: &Path,
    name: &Path,
    file_type: fs::FileType,
    stats: &mut SourceStats,
) -> Result<()> {
    if file_type.is_dir() {
        builder
            .append_dir(name, path)
            .map_err(|e| SuiteError::compression(path, e))?;
    } else if file_type.is_symlink() {
        builder
            .append_path_with_name(path, name)
            .map_err(|e| SuiteError::compression(path, e))?;
    } else if file_type.is_file() {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                warn!("Skipping unreadable file {}: {}", path.display(), e);
                stats.skipped += 1;
                return Ok(());
            }
            Err(e) => return Err(SuiteError::compression(path, e)),
        };
        let metadata = file.metadata().map_err(|e| SuiteError::compression(path, e))?;
        let mut header = tar::Header::new_gnu();
        header.set_metadata(&metadata);
        // Files growing mid-archive must not overrun their header size
        builder
            .append_data(&mut header, name, (&mut file).take(metadata.len()))
            .map_err(|e| SuiteError::compression(path, e))?;
        stats.bytes += metadata.len();
        stats.files += 1;
    } else {
        debug!("Skipping special file {}", path.display());
        stats.skipped += 1;
    }
    Ok(())
}

fn is_excluded(entry: &DirEntry, patterns: &[String]) -> bool {
    let name = entry.file_name().to_string_lossy();
    patterns.iter().any(|p| name == p.as_str())
}

fn is_permission_denied(err: &walkdir::Error) -> bool {
    err.io_error()
        .map(|e| e.kind() == io::ErrorKind::PermissionDenied)
        .unwrap_or(false)
}

/// Extract `archive_path` below `dest_root`.
///
/// Entries never land outside `dest_root`: absolute paths, `..` segments,
/// hard links and writes through symlinks are rejected.
pub fn unpack(archive_path: &Path, dest_root: &Path, options: UnpackOptions) -> Result<UnpackOutcome> {
    let corrupt = |message: String| SuiteError::CorruptArchive {
        path: archive_path.to_path_buf(),
        message,
    };

    let file = File::open(archive_path)?;
    let mut reader = BufReader::new(file);
    let header = reader.fill_buf()?;
    let compression = Compression::detect(header)
        .ok_or_else(|| corrupt("unrecognised compression header".to_string()))?;

    let failed = Rc::new(Cell::new(false));
    let decoder: Box<dyn Read> = match compression {
        Compression::Zstd => Box::new(
            zstd::stream::read::Decoder::with_buffer(reader).map_err(|e| corrupt(e.to_string()))?,
        ),
        Compression::Gzip => Box::new(GzDecoder::new(reader)),
    };
    let tracked = TrackedReader {
        inner: decoder,
        failed: Rc::clone(&failed),
    };

    fs::create_dir_all(dest_root)?;

    let classify = |err: io::Error| {
        if failed.get() || err.kind() == io::ErrorKind::InvalidData {
            corrupt(err.to_string())
        } else {
            SuiteError::Io(err)
        }
    };

    let mut archive = tar::Archive::new(tracked);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);

    let mut outcome = UnpackOutcome::default();
    let mut directories = Vec::new();
    for entry in archive.entries().map_err(classify)? {
        let mut entry = entry.map_err(classify)?;
        let raw = entry.path().map_err(classify)?.into_owned();
        let unsafe_entry = || SuiteError::UnsafeArchivePath {
            archive: archive_path.to_path_buf(),
            entry: raw.display().to_string(),
        };

        let entry_type = entry.header().entry_type();
        if entry_type.is_hard_link() {
            return Err(unsafe_entry());
        }

        let relative = match sanitize_entry_path(&raw, options.strip_components) {
            Ok(Some(relative)) => relative,
            Ok(None) => continue,
            Err(()) => return Err(unsafe_entry()),
        };
        if has_symlink_ancestor(dest_root, &relative) {
            return Err(unsafe_entry());
        }

        let dest = dest_root.join(&relative);
        if entry_type.is_dir() {
            let header = entry.header();
            let mode = header.mode().map_err(classify)?;
            let mtime = header.mtime().ok();
            directories.push(open_directory(dest, mode, mtime)?);
            continue;
        }
        if !options.overwrite && fs::symlink_metadata(&dest).is_ok() {
            outcome.skipped += 1;
            continue;
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        entry.unpack(&dest).map_err(classify)?;
        outcome.written += 1;
    }

    // Children first, so a read-only parent is locked only once it is full.
    directories.sort_by_key(|dir| std::cmp::Reverse(dir.path.components().count()));
    for dir in &directories {
        dir.seal();
    }

    Ok(outcome)
}

/// Directory metadata applied once every entry has been written.
struct PendingDirectory {
    path: PathBuf,
    mode: u32,
    mtime: Option<SystemTime>,
}

/// Create `path` writable for the owner and remember what it should end up
/// as. A directory that already existed keeps its own mode and times.
fn open_directory(path: PathBuf, mode: u32, mtime: Option<u64>) -> io::Result<PendingDirectory> {
    let existed = path.is_dir();
    fs::create_dir_all(&path)?;
    let current = fs::metadata(&path)?.permissions();

    let pending = if existed {
        PendingDirectory {
            path,
            mode: permission_bits(&current, mode),
            mtime: None,
        }
    } else {
        PendingDirectory {
            path,
            mode: mode & 0o7777,
            mtime: mtime.map(|secs| UNIX_EPOCH + Duration::from_secs(secs)),
        }
    };
    make_owner_writable(&pending.path, current)?;
    Ok(pending)
}

impl PendingDirectory {
    fn seal(&self) {
        if let Some(mtime) = self.mtime {
            if let Err(e) = File::open(&self.path).and_then(|dir| dir.set_modified(mtime)) {
                debug!("Could not set mtime of {}: {}", self.path.display(), e);
            }
        }
        if let Err(e) = set_mode(&self.path, self.mode) {
            warn!("Could not set mode of {}: {}", self.path.display(), e);
        }
    }
}

fn sanitize_entry_path(raw: &Path, strip_components: usize) -> std::result::Result<Option<PathBuf>, ()> {
    let mut relative = PathBuf::new();
    let mut stripped = 0;
    for component in raw.components() {
        match component {
            Component::Normal(part) => {
                if stripped < strip_components {
                    stripped += 1;
                } else {
                    relative.push(part);
                }
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return Err(()),
        }
    }
    Ok(if relative.as_os_str().is_empty() {
        None
    } else {
        Some(relative)
    })
}

fn has_symlink_ancestor(root: &Path, relative: &Path) -> bool {
    let mut current = root.to_path_buf();
    let mut components = relative.components().peekable();
    while let Some(component) = components.next() {
        if components.peek().is_none() {
            break;
        }
        current.push(component);
        if let Ok(metadata) = fs::symlink_metadata(&current) {
            if metadata.file_type().is_symlink() {
                return true;
            }
        }
    }
    false
}

/// sha256 of a file, lowercase hex.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}
