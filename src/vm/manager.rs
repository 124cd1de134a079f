//! VM lifecycle management

use crate::config::schema::Configuration;
use crate::config::settings::Settings;
use crate::error::Error;
use crate::utils::system::{pick_qemu_bin, running_pid};
use crate::vm::args::ArgumentCompiler;
use crate::vm::firmware::{share_dir_for, share_dir_for_prefix};
use crate::vm::store::{LoadReport, VmStore};
use crate::vm::supervisor::{StartOutcome, StopOutcome, Supervisor};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use tracing::info;
use uuid::Uuid;

/// Store plus supervisor. Create one per process and pass it by reference.
pub struct VmManager {
    settings: Settings,
    store: Mutex<VmStore>,
    supervisor: Supervisor,
}

impl VmManager {
    /// Open the data home and load every bundle in it.
    pub fn open(settings: Settings) -> Result<(Self, LoadReport), Error> {
        let mut store = VmStore::open(&settings.data_home)?;
        let report = store.load_all()?;
        let supervisor = Supervisor::new(settings.qemu_prefix.clone());
        let manager = VmManager {
            settings,
            store: Mutex::new(store),
            supervisor,
        };
        Ok((manager, report))
    }

    fn store(&self) -> MutexGuard<'_, VmStore> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Persist a configuration; returns its bundle directory.
    pub fn save(&self, config: Configuration) -> Result<PathBuf, Error> {
        Ok(self.store().add(config)?)
    }

    pub fn list(&self) -> Vec<Configuration> {
        self.store().list().into_iter().cloned().collect()
    }

    pub fn get(&self, id: Uuid) -> Option<Configuration> {
        self.store().get(id).cloned()
    }

    /// Look a VM up by name, or by UUID when the argument parses as one.
    pub fn find(&self, name_or_id: &str) -> Result<Configuration, Error> {
        let store = self.store();
        let by_id = Uuid::parse_str(name_or_id).ok().and_then(|id| store.get(id));
        by_id
            .or_else(|| store.find_by_name(name_or_id))
            .cloned()
            .ok_or_else(|| Error::NotFound(name_or_id.to_string()))
    }

    pub fn bundle_dir(&self, id: Uuid) -> Result<PathBuf, Error> {
        self.store()
            .bundle_dir(id)
            .map(PathBuf::from)
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Where a bundle named `name` would be created.
    pub fn bundle_path(&self, name: &str) -> PathBuf {
        self.store().bundle_path(name)
    }

    /// Compiler for one VM. The firmware directory follows the configured
    /// prefix, else the installed binary, else the distribution default.
    pub fn compiler(&self, config: &Configuration) -> Result<ArgumentCompiler, Error> {
        let bundle = self.bundle_dir(config.id())?;
        let firmware_dir = match &self.settings.qemu_prefix {
            Some(prefix) => share_dir_for_prefix(prefix),
            None => pick_qemu_bin(None, config.architecture())
                .map(|bin| share_dir_for(&bin))
                .unwrap_or_else(|_| PathBuf::from("/usr/share/qemu")),
        };
        Ok(ArgumentCompiler::new(firmware_dir, bundle))
    }

    pub async fn start(&self, id: Uuid) -> Result<StartOutcome, Error> {
        let (config, bundle) = {
            let store = self.store();
            let config = store.get(id).cloned().ok_or_else(|| Error::NotFound(id.to_string()))?;
            let bundle = store.bundle_dir(id).map(PathBuf::from).ok_or_else(|| Error::NotFound(id.to_string()))?;
            (config, bundle)
        };
        Ok(self.supervisor.start(&config, &bundle).await?)
    }

    pub async fn stop(&self, id: Uuid) -> StopOutcome {
        self.supervisor.stop(id).await
    }

    pub async fn is_running(&self, id: Uuid) -> bool {
        self.supervisor.is_running(id).await
    }

    /// Delete a VM. Refused while its process is alive, whether this process
    /// or another `qvmm start` owns it.
    pub async fn remove(&self, id: Uuid) -> Result<Configuration, Error> {
        let (name, bundle) = {
            let store = self.store();
            let config = store.get(id).ok_or_else(|| Error::NotFound(id.to_string()))?;
            (config.name().to_string(), store.bundle_dir(id).map(PathBuf::from))
        };

        let reservation = self
            .supervisor
            .reserve(id)
            .await
            .map_err(|pid| Error::StillRunning { name: name.clone(), pid })?;
        let removed = match bundle.as_deref().and_then(running_pid) {
            Some(pid) => Err(Error::StillRunning { name: name.clone(), pid }),
            None => self
                .store()
                .remove(id)
                .map_err(Error::from)
                .and_then(|r| r.ok_or_else(|| Error::NotFound(id.to_string()))),
        };
        drop(reservation);
        self.supervisor.forget(id);
        let removed = removed?;
        info!(vm = %name, %id, "removed VM");
        Ok(removed)
    }

    /// Stop every VM this manager started and wait for them to exit.
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }
}
