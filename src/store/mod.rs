//! Storage device and volume handling
//!
//! The heart of the storage daemon: device abstraction over tape
//! drives, disk volume directories, fifos and emulated tapes, the
//! on-media block/record plumbing on top of the `mag_tape` codec,
//! volume labels and reservations, autochanger coordination and the
//! mount retry machinery.

mod config;
pub use config::*;

pub mod backend;
pub mod catalog;
pub mod changer;
pub mod dcr;
pub mod device;
pub mod label;
pub mod lock;
pub mod mount;
pub mod mtio;
pub mod read_records;
pub mod reserve;
pub mod vtape;
pub mod wait;

#[cfg(test)]
mod test;

pub use backend::OpenMode;
pub use catalog::{CatalogProxy, JobMediaRecord, SysopMessenger, VolumeCatalogInfo};
pub use changer::ChangerRegistry;
pub use dcr::DeviceContext;
pub use device::{BlockReadError, BlockWriteError, Capabilities, Device, DeviceStatus};
pub use label::VolumeStatus;
pub use lock::BlockedReason;
pub use read_records::read_records;
pub use reserve::VolumeReservations;

use std::sync::Arc;

use anyhow::{format_err, Error};

/// Shared state of one storage daemon instance: every configured
/// device plus the tables that span devices.
pub struct StoreContext {
    devices: Vec<Arc<Device>>,
    pub volumes: Arc<VolumeReservations>,
    pub changers: Arc<ChangerRegistry>,
    pub catalog: Arc<dyn CatalogProxy>,
    pub messenger: Arc<dyn SysopMessenger>,
}

impl StoreContext {
    pub fn new(catalog: Arc<dyn CatalogProxy>, messenger: Arc<dyn SysopMessenger>) -> Self {
        Self {
            devices: Vec::new(),
            volumes: Arc::new(VolumeReservations::new()),
            changers: Arc::new(ChangerRegistry::new()),
            catalog,
            messenger,
        }
    }

    pub fn add_device(&mut self, config: DeviceConfig) -> Arc<Device> {
        let dev = Arc::new(Device::new(config));
        self.devices.push(Arc::clone(&dev));
        self.changers.register_drive(Arc::clone(&dev));
        dev
    }

    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    pub fn find_device(&self, name: &str) -> Option<Arc<Device>> {
        self.devices
            .iter()
            .find(|dev| dev.name() == name)
            .cloned()
    }

    /// Create a job context on the named device.
    pub fn new_context(
        &self,
        device_name: &str,
        job_id: u32,
        vol_session_id: u32,
        vol_session_time: u32,
    ) -> Result<DeviceContext, Error> {
        let dev = self
            .find_device(device_name)
            .ok_or_else(|| format_err!("no such device: {}", device_name))?;
        Ok(DeviceContext::new(
            dev,
            Arc::clone(&self.catalog),
            Arc::clone(&self.messenger),
            Arc::clone(&self.volumes),
            Arc::clone(&self.changers),
            job_id,
            vol_session_id,
            vol_session_time,
        ))
    }
}
