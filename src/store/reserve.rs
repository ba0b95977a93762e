//! Volume reservation manager
//!
//! A global table mapping volume names to the device using them. It
//! guarantees that a volume is never written by two devices at once
//! and that a device never has two volumes reserved for writing.
//! Readers share volumes freely; the table only arbitrates writers.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use anyhow::{bail, Error};

#[derive(Clone, Debug)]
pub struct VolumeReservation {
    pub vol_name: String,
    pub device_name: String,
    /// the owning job is actively using the volume
    pub in_use: bool,
    /// the volume is being moved between devices
    pub swapping: bool,
    /// reserved for reading, writers must stay away
    pub reading: bool,
}

#[derive(Default)]
pub struct VolumeReservations {
    table: Mutex<HashMap<String, VolumeReservation>>,
    // bumped whenever a volume becomes available again, so jobs
    // stuck waiting for any device can re-check
    released: Mutex<u64>,
    released_cv: Condvar,
}

impl VolumeReservations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `vol_name` for writing on `device_name`.
    ///
    /// Re-reserving the same volume on the same device is fine and
    /// returns the existing entry. A different device holding the
    /// volume is a conflict. A device asking for a second volume has
    /// its old (unused) reservation replaced.
    pub fn reserve_volume(
        &self,
        vol_name: &str,
        device_name: &str,
    ) -> Result<VolumeReservation, Error> {
        let mut table = self.table.lock().unwrap();

        if let Some(entry) = table.get(vol_name) {
            if entry.device_name == device_name {
                return Ok(entry.clone());
            }
            if entry.swapping {
                bail!(
                    "volume '{}' is moving to device {}",
                    vol_name,
                    entry.device_name
                );
            }
            bail!(
                "volume '{}' is already reserved on device {}",
                vol_name,
                entry.device_name
            );
        }

        // one write volume per device: drop a stale reservation held
        // by this device for another volume
        let stale: Option<String> = table
            .values()
            .find(|entry| entry.device_name == device_name && !entry.in_use && !entry.reading)
            .map(|entry| entry.vol_name.clone());
        if let Some(old) = stale {
            log::debug!(
                "device {}: releasing stale reservation of volume '{}'",
                device_name,
                old
            );
            table.remove(&old);
        }

        let entry = VolumeReservation {
            vol_name: vol_name.to_string(),
            device_name: device_name.to_string(),
            in_use: false,
            swapping: false,
            reading: false,
        };
        table.insert(vol_name.to_string(), entry.clone());
        Ok(entry)
    }

    /// Mark a reading reservation; multiple readers are fine, but the
    /// table records the first one so writers see the volume is busy.
    pub fn reserve_volume_for_read(
        &self,
        vol_name: &str,
        device_name: &str,
    ) -> Result<VolumeReservation, Error> {
        let mut table = self.table.lock().unwrap();
        match table.get(vol_name) {
            Some(entry) if entry.reading => Ok(entry.clone()),
            Some(entry) => bail!(
                "volume '{}' is reserved for writing on device {}",
                vol_name,
                entry.device_name
            ),
            None => {
                let entry = VolumeReservation {
                    vol_name: vol_name.to_string(),
                    device_name: device_name.to_string(),
                    in_use: false,
                    swapping: false,
                    reading: true,
                };
                table.insert(vol_name.to_string(), entry.clone());
                Ok(entry)
            }
        }
    }

    pub fn mark_in_use(&self, vol_name: &str) {
        let mut table = self.table.lock().unwrap();
        if let Some(entry) = table.get_mut(vol_name) {
            entry.in_use = true;
        }
    }

    /// The job finished with the volume; keep the reservation (the
    /// volume is still loaded) but allow it to be replaced.
    pub fn volume_unused(&self, vol_name: &str) {
        {
            let mut table = self.table.lock().unwrap();
            if let Some(entry) = table.get_mut(vol_name) {
                entry.in_use = false;
            }
        }
        self.signal_released();
    }

    /// Drop the reservation entirely. Unknown names are ignored so
    /// cleanup paths can call this unconditionally.
    pub fn free_volume(&self, vol_name: &str) {
        let removed = {
            let mut table = self.table.lock().unwrap();
            table.remove(vol_name).is_some()
        };
        if removed {
            log::debug!("volume '{}' released", vol_name);
            self.signal_released();
        }
    }

    fn signal_released(&self) {
        let mut generation = self.released.lock().unwrap();
        *generation += 1;
        self.released_cv.notify_all();
    }

    /// Wait until any volume in the table is released, or the timeout
    /// runs out. Returns true if something was released.
    pub fn wait_released(&self, timeout: Duration) -> bool {
        let generation = self.released.lock().unwrap();
        let start = *generation;
        let (generation, _result) = self
            .released_cv
            .wait_timeout_while(generation, timeout, |generation| *generation == start)
            .unwrap();
        *generation != start
    }

    /// Begin moving a volume from its current device to `new_device`.
    pub fn swap_volume(&self, vol_name: &str, new_device: &str) -> Result<(), Error> {
        let mut table = self.table.lock().unwrap();
        match table.get_mut(vol_name) {
            Some(entry) => {
                if entry.in_use {
                    bail!("volume '{}' is in use, cannot swap", vol_name);
                }
                entry.swapping = true;
                entry.device_name = new_device.to_string();
                Ok(())
            }
            None => bail!("volume '{}' is not reserved", vol_name),
        }
    }

    /// The swap finished, the volume is a normal reservation again.
    pub fn finish_swap(&self, vol_name: &str) {
        let mut table = self.table.lock().unwrap();
        if let Some(entry) = table.get_mut(vol_name) {
            entry.swapping = false;
        }
    }

    /// Can `device_name` write this volume right now?
    pub fn can_i_write_volume(&self, vol_name: &str, device_name: &str) -> bool {
        let table = self.table.lock().unwrap();
        match table.get(vol_name) {
            None => true,
            Some(entry) => entry.device_name == device_name && !entry.reading && !entry.swapping,
        }
    }

    /// Can `device_name` use (read or write) this volume right now?
    pub fn can_i_use_volume(&self, vol_name: &str, device_name: &str) -> bool {
        let table = self.table.lock().unwrap();
        match table.get(vol_name) {
            None => true,
            Some(entry) if entry.reading => true,
            Some(entry) => entry.device_name == device_name,
        }
    }

    pub fn find_reservation(&self, vol_name: &str) -> Option<VolumeReservation> {
        self.table.lock().unwrap().get(vol_name).cloned()
    }

    pub fn list(&self) -> Vec<VolumeReservation> {
        let table = self.table.lock().unwrap();
        let mut entries: Vec<VolumeReservation> = table.values().cloned().collect();
        entries.sort_by(|a, b| a.vol_name.cmp(&b.vol_name));
        entries
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn write_reservation_is_exclusive() -> Result<(), Error> {
        let reservations = VolumeReservations::new();

        reservations.reserve_volume("Vol0001", "drive0")?;
        // idempotent for the same device
        reservations.reserve_volume("Vol0001", "drive0")?;

        assert!(reservations.reserve_volume("Vol0001", "drive1").is_err());
        assert!(!reservations.can_i_write_volume("Vol0001", "drive1"));
        assert!(reservations.can_i_write_volume("Vol0001", "drive0"));

        reservations.free_volume("Vol0001");
        reservations.reserve_volume("Vol0001", "drive1")?;
        Ok(())
    }

    #[test]
    fn stale_reservation_is_replaced() -> Result<(), Error> {
        let reservations = VolumeReservations::new();
        reservations.reserve_volume("Vol0001", "drive0")?;
        // device switches to another volume, old entry goes away
        reservations.reserve_volume("Vol0002", "drive0")?;
        assert!(reservations.find_reservation("Vol0001").is_none());

        // an in-use volume is not stale
        reservations.mark_in_use("Vol0002");
        reservations.reserve_volume("Vol0003", "drive0")?;
        assert!(reservations.find_reservation("Vol0002").is_some());
        Ok(())
    }

    #[test]
    fn free_is_idempotent() {
        let reservations = VolumeReservations::new();
        reservations.free_volume("NoSuchVolume");
        reservations.reserve_volume("Vol0001", "drive0").unwrap();
        reservations.free_volume("Vol0001");
        reservations.free_volume("Vol0001");
    }

    #[test]
    fn readers_share_writers_do_not() -> Result<(), Error> {
        let reservations = VolumeReservations::new();
        reservations.reserve_volume_for_read("Vol0001", "drive0")?;
        reservations.reserve_volume_for_read("Vol0001", "drive1")?;

        assert!(!reservations.can_i_write_volume("Vol0001", "drive0"));
        assert!(reservations.can_i_use_volume("Vol0001", "drive2"));
        assert!(reservations.reserve_volume("Vol0001", "drive2").is_err());
        Ok(())
    }

    #[test]
    fn swapping_blocks_writers() -> Result<(), Error> {
        let reservations = VolumeReservations::new();
        reservations.reserve_volume("Vol0001", "drive0")?;
        reservations.swap_volume("Vol0001", "drive1")?;
        assert!(!reservations.can_i_write_volume("Vol0001", "drive1"));

        reservations.finish_swap("Vol0001");
        assert!(reservations.can_i_write_volume("Vol0001", "drive1"));

        reservations.mark_in_use("Vol0001");
        assert!(reservations.swap_volume("Vol0001", "drive2").is_err());
        Ok(())
    }
}
