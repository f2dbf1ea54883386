//! On-disk layout of domain data.
//!
//! ```text
//! <data_dir>/<domain>/meta.json
//! <data_dir>/<domain>/pdfs/<filename>
//! <data_dir>/<domain>/index/chunks.json
//! ```

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::domains::DomainName;

const META_FILE: &str = "meta.json";
const PDF_DIR: &str = "pdfs";
const INDEX_DIR: &str = "index";

/// Resolves paths for every persisted artifact of a domain.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    /// Anchor the layout at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory containing all domains.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory owned by a single domain.
    pub fn domain_dir(&self, name: &DomainName) -> PathBuf {
        self.root.join(name.as_str())
    }

    /// Metadata record whose presence defines domain existence.
    pub fn meta_path(&self, name: &DomainName) -> PathBuf {
        self.domain_dir(name).join(META_FILE)
    }

    /// Directory holding uploaded source files.
    pub fn pdf_dir(&self, name: &DomainName) -> PathBuf {
        self.domain_dir(name).join(PDF_DIR)
    }

    /// Stored copy of an uploaded source file.
    pub fn pdf_path(&self, name: &DomainName, filename: &str) -> PathBuf {
        self.pdf_dir(name).join(filename)
    }

    /// Directory holding the serialized retrieval index.
    pub fn index_dir(&self, name: &DomainName) -> PathBuf {
        self.domain_dir(name).join(INDEX_DIR)
    }
}

/// Write `bytes` to a uniquely named hidden file inside `dir`.
///
/// The file is removed when the handle drops unless it is persisted first.
pub fn stage_file(dir: &Path, bytes: &[u8]) -> io::Result<NamedTempFile> {
    std::fs::create_dir_all(dir)?;
    let mut staged = tempfile::Builder::new()
        .prefix(".staged-")
        .tempfile_in(dir)?;
    staged.write_all(bytes)?;
    staged.as_file().sync_all()?;
    Ok(staged)
}

/// Write `bytes` to `path` through a staged sibling and a rename, so readers never observe a
/// half-written file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    stage_file(parent, bytes)?
        .persist(path)
        .map(|_| ())
        .map_err(|error| error.error)
}

/// Remove a file, treating its absence as success.
pub fn remove_file_if_present(path: &Path) -> io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(error) => Err(error),
    }
}
