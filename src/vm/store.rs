//! On-disk VM bundles
//!
//! Every VM lives in `<data-home>/<name>.qvm/` with its configuration in
//! `vm.json`. The store keeps an in-memory registry keyed by identity and is
//! the only writer of bundle configuration files.

use crate::config::schema::Configuration;
use crate::error::{ParseError, PersistenceError};
use crate::utils::paths::{bundle_path, conf_path, is_bundle};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Entry {
    config: Configuration,
    bundle: PathBuf,
}

/// A bundle that could not be loaded.
#[derive(Debug)]
pub struct SkippedBundle {
    pub path: PathBuf,
    pub error: ParseError,
}

/// Outcome of scanning the data home.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: usize,
    pub skipped: Vec<SkippedBundle>,
}

/// Registry of persisted VM configurations
#[derive(Debug)]
pub struct VmStore {
    data_home: PathBuf,
    entries: BTreeMap<Uuid, Entry>,
}

impl VmStore {
    /// Open (creating if needed) a data home. Nothing is loaded yet.
    pub fn open(data_home: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let data_home = data_home.into();
        fs::create_dir_all(&data_home).map_err(|e| PersistenceError::io(&data_home, e))?;
        Ok(VmStore {
            data_home,
            entries: BTreeMap::new(),
        })
    }

    pub fn data_home(&self) -> &Path {
        &self.data_home
    }

    /// Rescan the data home, replacing the registry. Bundles that fail to
    /// parse, or that repeat an identity already loaded, are skipped.
    pub fn load_all(&mut self) -> Result<LoadReport, PersistenceError> {
        let mut bundles: Vec<PathBuf> = fs::read_dir(&self.data_home)
            .map_err(|e| PersistenceError::io(&self.data_home, e))?
            .flatten()
            .map(|e| e.path())
            .filter(|p| is_bundle(p))
            .collect();
        bundles.sort();

        self.entries.clear();
        let mut report = LoadReport::default();
        for bundle in bundles {
            match self.read_bundle(&bundle) {
                Ok(config) => {
                    debug!(vm = %config.name(), id = %config.id(), "loaded bundle");
                    self.entries.insert(config.id(), Entry { config, bundle });
                    report.loaded += 1;
                }
                Err(error) => {
                    warn!(path = %bundle.display(), %error, "skipping bundle");
                    report.skipped.push(SkippedBundle { path: bundle, error });
                }
            }
        }
        Ok(report)
    }

    fn read_bundle(&self, bundle: &Path) -> Result<Configuration, ParseError> {
        let file = conf_path(bundle);
        let text = fs::read_to_string(&file).map_err(|source| ParseError::Io { path: file, source })?;
        let config = Configuration::from_json(&text)?;
        if let Some(existing) = self.entries.get(&config.id()) {
            return Err(ParseError::DuplicateIdentity {
                uuid: config.id(),
                first: existing.bundle.clone(),
            });
        }
        Ok(config)
    }

    /// Validate and persist a configuration, renaming its bundle when the
    /// name changed. Adding the same identity again overwrites it in place.
    pub fn add(&mut self, mut config: Configuration) -> Result<PathBuf, PersistenceError> {
        for adjustment in config.validate()? {
            info!(vm = %config.name(), %adjustment, "normalized configuration");
        }

        let id = config.id();
        let target = bundle_path(&self.data_home, config.name());
        if self
            .entries
            .values()
            .any(|e| e.config.id() != id && e.config.name() == config.name())
        {
            return Err(PersistenceError::NameTaken(config.name().to_string()));
        }

        let previous = self.entries.get(&id).map(|e| e.bundle.clone());
        if previous.as_deref() != Some(target.as_path()) && target.exists() {
            // Some bundle on disk that the registry does not know under this identity.
            let owned_by_us = self.read_bundle_identity(&target) == Some(id);
            if !owned_by_us {
                return Err(PersistenceError::NameTaken(config.name().to_string()));
            }
        }

        match previous {
            Some(old) if old != target && old.exists() => {
                fs::rename(&old, &target).map_err(|e| PersistenceError::io(&old, e))?;
                info!(from = %old.display(), to = %target.display(), "renamed bundle");
            }
            _ => fs::create_dir_all(&target).map_err(|e| PersistenceError::io(&target, e))?,
        }

        write_atomically(&target, &config)?;
        debug!(vm = %config.name(), %id, "saved configuration");
        self.entries.insert(
            id,
            Entry {
                config,
                bundle: target.clone(),
            },
        );
        Ok(target)
    }

    fn read_bundle_identity(&self, bundle: &Path) -> Option<Uuid> {
        let text = fs::read_to_string(conf_path(bundle)).ok()?;
        Configuration::from_json(&text).ok().map(|c| c.id())
    }

    /// Delete a bundle and forget it. Returns the removed configuration, or
    /// `None` when the identity was unknown.
    pub fn remove(&mut self, id: Uuid) -> Result<Option<Configuration>, PersistenceError> {
        let Some(entry) = self.entries.get(&id) else {
            return Ok(None);
        };
        match fs::remove_dir_all(&entry.bundle) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %entry.bundle.display(), "bundle already gone");
            }
            Err(e) => return Err(PersistenceError::io(&entry.bundle, e)),
        }
        Ok(self.entries.remove(&id).map(|e| e.config))
    }

    pub fn get(&self, id: Uuid) -> Option<&Configuration> {
        self.entries.get(&id).map(|e| &e.config)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Configuration> {
        self.entries
            .values()
            .map(|e| &e.config)
            .find(|c| c.name() == name)
    }

    /// All configurations, sorted by name.
    pub fn list(&self) -> Vec<&Configuration> {
        let mut all: Vec<&Configuration> = self.entries.values().map(|e| &e.config).collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    pub fn bundle_dir(&self, id: Uuid) -> Option<&Path> {
        self.entries.get(&id).map(|e| e.bundle.as_path())
    }

    /// Where a bundle with this name lives (or would live).
    pub fn bundle_path(&self, name: &str) -> PathBuf {
        bundle_path(&self.data_home, name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Save VM configuration to file via a temp file in the same directory
fn write_atomically(bundle: &Path, config: &Configuration) -> Result<(), PersistenceError> {
    let path = conf_path(bundle);
    let mut tmp = NamedTempFile::new_in(bundle).map_err(|e| PersistenceError::io(bundle, e))?;
    serde_json::to_writer_pretty(&mut tmp, config)?;
    tmp.write_all(b"\n").map_err(|e| PersistenceError::io(&path, e))?;
    tmp.as_file().sync_all().map_err(|e| PersistenceError::io(&path, e))?;
    tmp.persist(&path)
        .map_err(|e| PersistenceError::io(&path, e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::constants::{Architecture, Target};
    use tempfile::TempDir;

    fn vm(name: &str) -> Configuration {
        Configuration::with_defaults(name, Architecture::X86_64, Target::Q35)
    }

    #[test]
    fn test_add_then_reload() {
        let home = TempDir::new().unwrap();
        let mut store = VmStore::open(home.path()).unwrap();
        let cfg = vm("alpha");
        let bundle = store.add(cfg.clone()).unwrap();
        assert_eq!(bundle, home.path().join("alpha.qvm"));
        assert!(conf_path(&bundle).is_file());

        let mut fresh = VmStore::open(home.path()).unwrap();
        let report = fresh.load_all().unwrap();
        assert_eq!(report.loaded, 1);
        assert!(report.skipped.is_empty());
        assert_eq!(fresh.get(cfg.id()), Some(&cfg));
    }

    #[test]
    fn test_add_is_idempotent_per_identity() {
        let home = TempDir::new().unwrap();
        let mut store = VmStore::open(home.path()).unwrap();
        let mut cfg = vm("alpha");
        store.add(cfg.clone()).unwrap();
        cfg.system.memory_size = 4096;
        store.add(cfg.clone()).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(cfg.id()).unwrap().system.memory_size, 4096);
    }

    #[test]
    fn test_rename_moves_bundle() {
        let home = TempDir::new().unwrap();
        let mut store = VmStore::open(home.path()).unwrap();
        let mut cfg = vm("old");
        let old = store.add(cfg.clone()).unwrap();
        fs::write(old.join("disk.qcow2"), b"data").unwrap();

        cfg.information.name = "new".into();
        let new = store.add(cfg.clone()).unwrap();
        assert!(!old.exists());
        assert!(new.join("disk.qcow2").is_file());
        assert_eq!(store.find_by_name("new").map(|c| c.id()), Some(cfg.id()));
        assert!(store.find_by_name("old").is_none());
    }

    #[test]
    fn test_name_taken() {
        let home = TempDir::new().unwrap();
        let mut store = VmStore::open(home.path()).unwrap();
        store.add(vm("dup")).unwrap();
        assert!(matches!(
            store.add(vm("dup")),
            Err(PersistenceError::NameTaken(name)) if name == "dup"
        ));

        // A foreign directory occupying the name counts too.
        fs::create_dir_all(home.path().join("squat.qvm")).unwrap();
        assert!(matches!(store.add(vm("squat")), Err(PersistenceError::NameTaken(_))));
    }

    #[test]
    fn test_invalid_config_writes_nothing() {
        let home = TempDir::new().unwrap();
        let mut store = VmStore::open(home.path()).unwrap();
        let bad = Configuration::with_defaults("bad", Architecture::Aarch64, Target::Q35);
        assert!(matches!(store.add(bad), Err(PersistenceError::Invalid(_))));
        assert!(!home.path().join("bad.qvm").exists());
        assert!(store.is_empty());
    }

    #[test]
    fn test_load_skips_broken_and_duplicate_bundles() {
        let home = TempDir::new().unwrap();
        let mut store = VmStore::open(home.path()).unwrap();
        let cfg = vm("a-first");
        store.add(cfg.clone()).unwrap();

        let copy = home.path().join("b-copy.qvm");
        fs::create_dir_all(&copy).unwrap();
        fs::copy(conf_path(&home.path().join("a-first.qvm")), conf_path(&copy)).unwrap();

        let broken = home.path().join("c-broken.qvm");
        fs::create_dir_all(&broken).unwrap();
        fs::write(conf_path(&broken), "{ not json").unwrap();

        fs::create_dir_all(home.path().join("d-empty.qvm")).unwrap();
        fs::create_dir_all(home.path().join("unrelated")).unwrap();

        let report = store.load_all().unwrap();
        assert_eq!(report.loaded, 1);
        assert_eq!(report.skipped.len(), 3);
        assert!(matches!(
            report.skipped[0].error,
            ParseError::DuplicateIdentity { uuid, .. } if uuid == cfg.id()
        ));
        assert!(matches!(report.skipped[1].error, ParseError::Json(_)));
        assert!(matches!(report.skipped[2].error, ParseError::Io { .. }));
    }

    #[test]
    fn test_remove() {
        let home = TempDir::new().unwrap();
        let mut store = VmStore::open(home.path()).unwrap();
        let cfg = vm("gone");
        let bundle = store.add(cfg.clone()).unwrap();
        assert_eq!(store.remove(cfg.id()).unwrap(), Some(cfg.clone()));
        assert!(!bundle.exists());
        assert!(store.get(cfg.id()).is_none());
        assert_eq!(store.remove(cfg.id()).unwrap(), None);
    }

    #[test]
    fn test_remove_tolerates_missing_bundle() {
        let home = TempDir::new().unwrap();
        let mut store = VmStore::open(home.path()).unwrap();
        let cfg = vm("vanished");
        let bundle = store.add(cfg.clone()).unwrap();
        fs::remove_dir_all(&bundle).unwrap();
        assert!(store.remove(cfg.id()).unwrap().is_some());
    }

    #[test]
    fn test_list_sorted_by_name() {
        let home = TempDir::new().unwrap();
        let mut store = VmStore::open(home.path()).unwrap();
        for name in ["zeta", "alpha", "mid"] {
            store.add(vm(name)).unwrap();
        }
        let names: Vec<&str> = store.list().iter().map(|c| c.name()).collect();
        assert_eq!(names, ["alpha", "mid", "zeta"]);
    }
}
