// ZIP archives of bare repositories
use crate::error::Result;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Top-level entries of a bare repository; nothing else is extracted
pub const SAFE_CONTENT: [&str; 9] = [
    "branches",
    "hooks",
    "info",
    "objects",
    "refs",
    "config",
    "packed-refs",
    "description",
    "HEAD",
];

/// Directory older deposits nest the whole repository under
const LEGACY_BASEDIR: &str = "repo";

/// Compression of archive members.
///
/// The `zip` writer cannot encode LZMA, so compressed deposits use Deflate.
/// LZMA members are still decoded on extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    Deflated,
    Stored,
}

impl Compression {
    fn method(self) -> CompressionMethod {
        match self {
            Compression::Deflated => CompressionMethod::Deflated,
            Compression::Stored => CompressionMethod::Stored,
        }
    }
}

/// Archive the directory tree below `source` into a ZIP file at `archive`
pub fn create(source: &Path, archive: &Path, compression: Compression) -> Result<()> {
    let mut zip = ZipWriter::new(File::create(archive)?);
    let options = SimpleFileOptions::default().compression_method(compression.method());

    for entry in WalkDir::new(source).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if entry.file_type().is_dir() {
            zip.add_directory(name, options)?;
        } else if entry.file_type().is_file() {
            let size = entry.metadata().map_err(io::Error::from)?.len();
            zip.start_file(name, options.large_file(size >= u64::from(u32::MAX)))?;
            io::copy(&mut File::open(entry.path())?, &mut zip)?;
        } else {
            tracing::debug!("Not archiving non-regular file {}", entry.path().display());
        }
    }

    zip.finish()?;
    Ok(())
}

/// Unpack a repository archive into `target`.
///
/// Only members below one of [`SAFE_CONTENT`] are written; anything else,
/// including paths escaping `target`, is skipped. Archives nesting the
/// repository under a top-level `repo/` are flattened.
pub fn extract(archive: &Path, target: &Path) -> Result<()> {
    let mut zip = ZipArchive::new(File::open(archive)?)?;
    let legacy = zip
        .file_names()
        .filter_map(|name| name.ok())
        .any(|name| name.starts_with(&format!("{LEGACY_BASEDIR}/")));

    fs::create_dir_all(target)?;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let Some(relative) = member_path(entry.enclosed_name(), legacy) else {
            tracing::debug!("Skipping archive member {:?}", String::from_utf8_lossy(entry.name_raw()));
            continue;
        };

        let out = target.join(&relative);
        if entry.is_dir() {
            fs::create_dir_all(&out)?;
        } else {
            if let Some(parent) = out.parent() {
                fs::create_dir_all(parent)?;
            }
            io::copy(&mut entry, &mut File::create(&out)?)?;
        }
    }
    Ok(())
}

/// Path below the target for an archive member, `None` if it is not allowed
fn member_path(enclosed: Option<PathBuf>, legacy: bool) -> Option<PathBuf> {
    let mut relative = enclosed?;
    if legacy {
        relative = relative.strip_prefix(LEGACY_BASEDIR).ok()?.to_path_buf();
    }
    let top = relative.components().next()?;
    let top = top.as_os_str().to_str()?;
    SAFE_CONTENT.contains(&top).then_some(relative)
}
