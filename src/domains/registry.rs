//! Persisted domain metadata.
//!
//! The registry is synchronous and filesystem-backed; the service calls it from the worker pool
//! and always while holding the domain's writer lock for mutations. Names reaching the registry
//! are already validated [`DomainName`]s.

use std::io;

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::name::DomainName;
use super::types::{DomainError, DomainInfo};
use crate::storage::{StorageLayout, write_atomic};

/// Metadata CRUD over `<data_dir>/<name>/meta.json`.
#[derive(Debug, Clone)]
pub struct DomainRegistry {
    layout: StorageLayout,
}

impl DomainRegistry {
    /// Registry rooted at `layout`.
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    /// A domain exists iff its metadata record exists.
    pub fn exists(&self, name: &DomainName) -> bool {
        self.layout.meta_path(name).is_file()
    }

    /// Write the metadata record of a new domain (chunk count 0) and create its directories.
    pub fn create(&self, name: &DomainName, description: &str) -> Result<DomainInfo, DomainError> {
        if self.exists(name) {
            return Err(DomainError::AlreadyExists(name.to_string()));
        }
        let pdf_dir = self.layout.pdf_dir(name);
        std::fs::create_dir_all(&pdf_dir)
            .map_err(DomainError::storage(format!("creating {}", pdf_dir.display())))?;

        let info = DomainInfo {
            name: name.to_string(),
            description: description.to_string(),
            created_at: current_timestamp_rfc3339(),
            doc_count: 0,
        };
        self.write(name, &info)?;
        Ok(info)
    }

    /// Read the metadata record of `name`.
    pub fn get(&self, name: &DomainName) -> Result<DomainInfo, DomainError> {
        let path = self.layout.meta_path(name);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                return Err(DomainError::NotFound(name.to_string()));
            }
            Err(error) => {
                return Err(DomainError::storage(format!("reading {}", path.display()))(error));
            }
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Every domain ordered by name. Unreadable records are skipped.
    pub fn list(&self) -> Result<Vec<DomainInfo>, DomainError> {
        let root = self.layout.root();
        let entries = match std::fs::read_dir(root) {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => {
                return Err(DomainError::storage(format!("listing {}", root.display()))(error));
            }
        };

        let mut domains = Vec::new();
        for entry in entries.flatten() {
            let Some(dir_name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Ok(name) = DomainName::parse(&dir_name) else {
                continue;
            };
            if name.as_str() != dir_name {
                continue;
            }
            match self.get(&name) {
                Ok(info) => domains.push(info),
                Err(DomainError::NotFound(_)) => {}
                Err(error) => {
                    tracing::warn!(domain = %name, error = %error, "Skipping unreadable domain metadata");
                }
            }
        }
        domains.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(domains)
    }

    /// Record the current chunk count of `name`.
    pub fn set_chunk_count(&self, name: &DomainName, count: usize) -> Result<DomainInfo, DomainError> {
        let mut info = self.get(name)?;
        info.doc_count = count;
        self.write(name, &info)?;
        Ok(info)
    }

    /// Discard every persisted artifact of `name`.
    ///
    /// The metadata record goes first so the domain stops existing before the rest is removed.
    pub fn delete(&self, name: &DomainName) -> Result<(), DomainError> {
        let meta = self.layout.meta_path(name);
        match std::fs::remove_file(&meta) {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                return Err(DomainError::NotFound(name.to_string()));
            }
            Err(error) => {
                return Err(DomainError::storage(format!("removing {}", meta.display()))(error));
            }
        }

        let dir = self.layout.domain_dir(name);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(DomainError::storage(format!("removing {}", dir.display()))(error)),
        }
    }

    fn write(&self, name: &DomainName, info: &DomainInfo) -> Result<(), DomainError> {
        let path = self.layout.meta_path(name);
        let bytes = serde_json::to_vec_pretty(info)?;
        write_atomic(&path, &bytes).map_err(DomainError::storage(format!("writing {}", path.display())))
    }
}

fn current_timestamp_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (tempfile::TempDir, DomainRegistry) {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = DomainRegistry::new(StorageLayout::new(dir.path()));
        (dir, registry)
    }

    fn name(raw: &str) -> DomainName {
        DomainName::parse(raw).expect("valid name")
    }

    #[test]
    fn create_then_get_round_trips_with_zero_count() {
        let (_dir, registry) = registry();
        let created = registry.create(&name("policies"), "HR policies").expect("create");
        let fetched = registry.get(&name("policies")).expect("get");

        assert_eq!(created, fetched);
        assert_eq!(fetched.name, "policies");
        assert_eq!(fetched.doc_count, 0);
        assert!(fetched.created_at.contains('T') && fetched.created_at.ends_with('Z'));
    }

    #[test]
    fn create_twice_fails_with_already_exists() {
        let (_dir, registry) = registry();
        registry.create(&name("policies"), "").expect("create");
        assert!(matches!(
            registry.create(&name("policies"), ""),
            Err(DomainError::AlreadyExists(found)) if found == "policies"
        ));
    }

    #[test]
    fn get_and_delete_missing_domain_fail_with_not_found() {
        let (_dir, registry) = registry();
        assert!(matches!(registry.get(&name("ghost")), Err(DomainError::NotFound(_))));
        assert!(matches!(registry.delete(&name("ghost")), Err(DomainError::NotFound(_))));
    }

    #[test]
    fn list_is_sorted_and_skips_corrupt_records() {
        let (dir, registry) = registry();
        registry.create(&name("zeta"), "").expect("create");
        registry.create(&name("alpha"), "").expect("create");
        std::fs::create_dir_all(dir.path().join("broken")).expect("mkdir");
        std::fs::write(dir.path().join("broken").join("meta.json"), b"{not json").expect("write");
        std::fs::create_dir_all(dir.path().join("no-meta")).expect("mkdir");

        let names: Vec<String> = registry
            .list()
            .expect("list")
            .into_iter()
            .map(|info| info.name)
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn delete_removes_all_persisted_state() {
        let (dir, registry) = registry();
        registry.create(&name("policies"), "").expect("create");
        std::fs::write(dir.path().join("policies/pdfs/doc.pdf"), b"%PDF").expect("write");

        registry.delete(&name("policies")).expect("delete");
        assert!(!registry.exists(&name("policies")));
        assert!(!dir.path().join("policies").exists());
    }

    #[test]
    fn set_chunk_count_updates_metadata() {
        let (_dir, registry) = registry();
        registry.create(&name("policies"), "desc").expect("create");
        let updated = registry.set_chunk_count(&name("policies"), 7).expect("update");
        assert_eq!(updated.doc_count, 7);
        assert_eq!(registry.get(&name("policies")).expect("get").doc_count, 7);
    }
}
