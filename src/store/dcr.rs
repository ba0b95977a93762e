//! Per-job device context
//!
//! Every job thread gets its own [`DeviceContext`] per device it
//! uses. The context carries the staging block, the current record,
//! the job's view of the volume catalog entry and the media span
//! bookkeeping for JobMedia records. The device itself is shared; the
//! context is not.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Error};

use mag_tape::{write_record_to_block, DeviceBlock, DeviceRecord};

use crate::store::catalog::{CatalogProxy, JobMediaRecord, SysopMessenger, VolumeCatalogInfo};
use crate::store::changer::ChangerRegistry;
use crate::store::device::{BlockReadError, BlockWriteError, Device};
use crate::store::mount::mount_next_write_volume;
use crate::store::reserve::VolumeReservations;

/// How often a full-volume condition may recur before the job fails.
const MAX_VOLUME_SWITCHES_PER_BLOCK: u32 = 3;

pub struct DeviceContext {
    pub dev: Arc<Device>,
    pub catalog: Arc<dyn CatalogProxy>,
    pub messenger: Arc<dyn SysopMessenger>,
    pub volumes: Arc<VolumeReservations>,
    pub changers: Arc<ChangerRegistry>,

    pub block: DeviceBlock,
    pub rec: DeviceRecord,

    /// volume the job wants (empty = take what the catalog offers)
    pub vol_name: String,
    /// job-local copy of the catalog entry for the mounted volume
    pub vol_cat: VolumeCatalogInfo,
    pub job_id: u32,
    pub vol_session_id: u32,
    pub vol_session_time: u32,

    /// wrong-volume label reads so far, bounded by the mount loop
    pub label_retries: u32,
    /// this context holds the write reservation for `vol_name`
    pub reserved_volume: bool,
    /// the mounted volume still carries its PRE_LABEL marker
    pub vol_pre_labeled: bool,

    cancelled: Arc<AtomicBool>,

    // media span of the current volume, for the JobMedia record
    span_started: bool,
    start_file: u32,
    start_block: u32,
    end_file: u32,
    end_block: u32,
    first_index: i32,
    last_index: i32,
}

impl DeviceContext {
    pub fn new(
        dev: Arc<Device>,
        catalog: Arc<dyn CatalogProxy>,
        messenger: Arc<dyn SysopMessenger>,
        volumes: Arc<VolumeReservations>,
        changers: Arc<ChangerRegistry>,
        job_id: u32,
        vol_session_id: u32,
        vol_session_time: u32,
    ) -> Self {
        let block = dev.new_block();
        Self {
            dev,
            catalog,
            messenger,
            volumes,
            changers,
            block,
            rec: DeviceRecord::new(),
            vol_name: String::new(),
            vol_cat: VolumeCatalogInfo::default(),
            job_id,
            vol_session_id,
            vol_session_time,
            label_retries: 0,
            reserved_volume: false,
            vol_pre_labeled: false,
            cancelled: Arc::new(AtomicBool::new(false)),
            span_started: false,
            start_file: 0,
            start_block: 0,
            end_file: 0,
            end_block: 0,
            first_index: 0,
            last_index: 0,
        }
    }

    /// Handle for cancelling the job from another thread.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Stage a payload in the context record.
    pub fn prepare_record(&mut self, file_index: i32, stream: i32, data: &[u8]) {
        self.rec.prepare(file_index, stream, data);
        self.rec.vol_session_id = self.vol_session_id;
        self.rec.vol_session_time = self.vol_session_time;
    }

    /// Serialize the context record, flushing full blocks as needed.
    pub fn write_record(&mut self) -> Result<(), Error> {
        loop {
            if write_record_to_block(&mut self.block, &mut self.rec) {
                break;
            }
            if self.block.is_empty() {
                // the codec refused even a fresh block, flushing again
                // would never make progress
                bail!(
                    "device {}: record (FileIndex {}, stream {}, {} bytes) does not fit into one block",
                    self.dev.name(),
                    self.rec.file_index,
                    self.rec.stream,
                    self.rec.data.len()
                );
            }
            self.write_block_to_device()?;
        }
        if self.rec.file_index > 0 {
            if self.first_index == 0 {
                self.first_index = self.rec.file_index;
            }
            self.last_index = self.rec.file_index;
        }
        Ok(())
    }

    /// Write the staging block out, switching volumes at end of media.
    ///
    /// On a full volume the block survives untouched: the old volume
    /// is terminated, `mount_next_write_volume` provides a fresh one
    /// and the very same block becomes its first data block.
    pub fn write_block_to_device(&mut self) -> Result<(), Error> {
        if self.block.is_empty() {
            return Ok(());
        }
        self.block.vol_session_id = self.vol_session_id;
        self.block.vol_session_time = self.vol_session_time;

        let mut switches = 0;
        loop {
            if self.is_cancelled() {
                bail!("job {} cancelled", self.job_id);
            }
            if !self.span_started {
                let (file, block) = self.dev.position();
                self.start_file = file;
                self.start_block = block;
                self.span_started = true;
            }
            match self.dev.write_block(&mut self.block) {
                Ok(()) => {
                    let (file, block) = self.dev.position();
                    self.end_file = file;
                    self.end_block = block;
                    return Ok(());
                }
                Err(BlockWriteError::EndOfMedium) | Err(BlockWriteError::Weot) => {
                    switches += 1;
                    if switches > MAX_VOLUME_SWITCHES_PER_BLOCK {
                        bail!(
                            "device {}: giving up after {} volume switches for one block",
                            self.dev.name(),
                            switches - 1
                        );
                    }
                    self.terminate_writing_volume()?;
                    mount_next_write_volume(self)?;
                    // position changed, the next span starts fresh
                    self.span_started = false;
                }
                Err(BlockWriteError::Io(err)) => {
                    let mut vol_cat = self.dev.vol_cat();
                    vol_cat.vol_errors += 1;
                    vol_cat.vol_status = "Error".to_string();
                    self.dev.set_vol_cat(vol_cat.clone());
                    let _ = self.catalog.update_volume_info(&vol_cat);
                    bail!("device {}: write error: {}", self.dev.name(), err);
                }
            }
        }
    }

    /// Read the next block from the device into the staging block.
    pub fn read_block_from_device(&mut self) -> Result<(), BlockReadError> {
        self.dev.read_block(&mut self.block)
    }

    /// Close out a volume that just filled up: final filemark, catalog
    /// status, JobMedia record, reservation release.
    pub fn terminate_writing_volume(&mut self) -> Result<(), Error> {
        // media is full, the filemark may not fit anymore
        if let Err(err) = self.dev.weof(1) {
            log::debug!("device {}: final weof failed: {err}", self.dev.name());
        }

        let mut vol_cat = self.dev.vol_cat();
        vol_cat.vol_status = "Full".to_string();
        self.dev.set_vol_cat(vol_cat.clone());
        self.catalog.update_volume_info(&vol_cat)?;
        self.messenger.notify(&format!(
            "volume '{}' on device {} is full ({} bytes)",
            vol_cat.vol_name,
            self.dev.name(),
            vol_cat.vol_bytes
        ));

        self.create_jobmedia_record()?;
        if self.reserved_volume {
            self.volumes.volume_unused(&vol_cat.vol_name);
        }
        Ok(())
    }

    /// Record the media span written so far, if any.
    pub fn create_jobmedia_record(&mut self) -> Result<(), Error> {
        if !self.span_started {
            return Ok(());
        }
        let record = JobMediaRecord {
            job_id: self.job_id,
            vol_name: self.dev.vol_cat().vol_name,
            first_index: self.first_index,
            last_index: self.last_index,
            start_file: self.start_file,
            end_file: self.end_file,
            start_block: self.start_block,
            end_block: self.end_block,
        };
        self.catalog.create_jobmedia_record(&record)?;
        self.span_started = false;
        self.first_index = 0;
        self.last_index = 0;
        Ok(())
    }

    /// Release everything the context holds on the volume table.
    pub fn release_volume(&mut self) {
        if self.reserved_volume {
            let vol_name = self.dev.vol_cat().vol_name;
            self.volumes.free_volume(&vol_name);
            self.reserved_volume = false;
        }
    }
}
