//! Catalog and operator collaborators
//!
//! The storage core never talks to the catalog database or to an
//! operator console directly; it goes through these traits. The
//! in-memory implementation at the bottom backs the scenario tests
//! and doubles as a reference for the real proxies.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

/// Catalog view of one volume, updated as the device writes.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct VolumeCatalogInfo {
    pub vol_name: String,
    pub media_type: String,
    pub vol_status: String,
    pub vol_blocks: u64,
    pub vol_bytes: u64,
    pub vol_files: u32,
    pub vol_jobs: u32,
    pub vol_errors: u64,
    pub max_vol_bytes: u64,
    /// Slot in the autochanger magazine, 0 = not in the changer
    pub slot: i32,
    pub in_changer: bool,
    pub label_time: i64,
    pub last_written: i64,
    pub recycle: bool,
}

impl VolumeCatalogInfo {
    pub fn new(vol_name: &str, media_type: &str) -> Self {
        Self {
            vol_name: vol_name.to_string(),
            media_type: media_type.to_string(),
            vol_status: "Append".to_string(),
            ..Default::default()
        }
    }

    pub fn is_appendable(&self) -> bool {
        self.vol_status == "Append" || self.vol_status == "Recycle"
    }
}

/// Media span written by one job on one volume.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct JobMediaRecord {
    pub job_id: u32,
    pub vol_name: String,
    pub first_index: i32,
    pub last_index: i32,
    pub start_file: u32,
    pub end_file: u32,
    pub start_block: u32,
    pub end_block: u32,
}

/// Catalog operations the storage core depends on.
pub trait CatalogProxy: Send + Sync {
    /// Look up a volume by name.
    fn get_volume_info(&self, vol_name: &str) -> Result<Option<VolumeCatalogInfo>, Error>;

    /// Pick the next volume of the given media type a writer may
    /// append to, preferring volumes already in the changer.
    fn find_next_appendable_volume(
        &self,
        media_type: &str,
    ) -> Result<Option<VolumeCatalogInfo>, Error>;

    /// Write back updated volume counters and status.
    fn update_volume_info(&self, info: &VolumeCatalogInfo) -> Result<(), Error>;

    /// Record the media span a job wrote.
    fn create_jobmedia_record(&self, record: &JobMediaRecord) -> Result<(), Error>;
}

/// Operator notification channel.
pub trait SysopMessenger: Send + Sync {
    /// Ask the operator to mount a volume; called once per wait cycle.
    fn request_mount(&self, device_name: &str, vol_name: &str, reason: &str);

    /// Ask the operator to create or label an appendable volume when
    /// the catalog has none to offer.
    fn request_create(&self, device_name: &str, media_type: &str, reason: &str);

    /// Informational message (volume full, label written, ...).
    fn notify(&self, message: &str);
}

/// Messenger that only logs, for unattended setups and tests.
pub struct LogMessenger;

impl SysopMessenger for LogMessenger {
    fn request_mount(&self, device_name: &str, vol_name: &str, reason: &str) {
        log::warn!(
            "operator action required on {device_name}: mount volume '{vol_name}' ({reason})"
        );
    }

    fn request_create(&self, device_name: &str, media_type: &str, reason: &str) {
        log::warn!(
            "operator action required on {device_name}: create an appendable '{media_type}' volume ({reason})"
        );
    }

    fn notify(&self, message: &str) {
        log::info!("{message}");
    }
}

/// In-memory catalog used by the tests.
#[derive(Default)]
pub struct MemoryCatalog {
    volumes: Mutex<HashMap<String, VolumeCatalogInfo>>,
    job_media: Mutex<Vec<JobMediaRecord>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_volume(&self, info: VolumeCatalogInfo) {
        let mut volumes = self.volumes.lock().unwrap();
        volumes.insert(info.vol_name.clone(), info);
    }

    pub fn job_media_records(&self) -> Vec<JobMediaRecord> {
        self.job_media.lock().unwrap().clone()
    }
}

impl CatalogProxy for MemoryCatalog {
    fn get_volume_info(&self, vol_name: &str) -> Result<Option<VolumeCatalogInfo>, Error> {
        let volumes = self.volumes.lock().unwrap();
        Ok(volumes.get(vol_name).cloned())
    }

    fn find_next_appendable_volume(
        &self,
        media_type: &str,
    ) -> Result<Option<VolumeCatalogInfo>, Error> {
        let volumes = self.volumes.lock().unwrap();
        let mut candidates: Vec<&VolumeCatalogInfo> = volumes
            .values()
            .filter(|info| info.media_type == media_type && info.is_appendable())
            .collect();
        // in-changer volumes first, then oldest written
        candidates.sort_by_key(|info| (!info.in_changer, info.last_written, info.vol_name.clone()));
        Ok(candidates.first().map(|info| (*info).clone()))
    }

    fn update_volume_info(&self, info: &VolumeCatalogInfo) -> Result<(), Error> {
        let mut volumes = self.volumes.lock().unwrap();
        if !volumes.contains_key(&info.vol_name) {
            bail!("volume '{}' not in catalog", info.vol_name);
        }
        volumes.insert(info.vol_name.clone(), info.clone());
        Ok(())
    }

    fn create_jobmedia_record(&self, record: &JobMediaRecord) -> Result<(), Error> {
        self.job_media.lock().unwrap().push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn appendable_selection_prefers_changer() -> Result<(), Error> {
        let catalog = MemoryCatalog::new();

        let mut shelf = VolumeCatalogInfo::new("Shelf01", "LTO-8");
        shelf.last_written = 100;
        catalog.add_volume(shelf);

        let mut loaded = VolumeCatalogInfo::new("Mag01", "LTO-8");
        loaded.in_changer = true;
        loaded.slot = 3;
        loaded.last_written = 500;
        catalog.add_volume(loaded);

        let mut full = VolumeCatalogInfo::new("Full01", "LTO-8");
        full.vol_status = "Full".to_string();
        full.in_changer = true;
        catalog.add_volume(full);

        let next = catalog.find_next_appendable_volume("LTO-8")?.unwrap();
        assert_eq!(next.vol_name, "Mag01");

        assert!(catalog.find_next_appendable_volume("LTO-9")?.is_none());
        Ok(())
    }

    #[test]
    fn update_requires_existing_volume() {
        let catalog = MemoryCatalog::new();
        let info = VolumeCatalogInfo::new("Nope01", "LTO-8");
        assert!(catalog.update_volume_info(&info).is_err());
    }
}
