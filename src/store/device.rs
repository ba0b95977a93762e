//! Device abstraction
//!
//! A [`Device`] wraps one backend and adds everything the backend does
//! not track: position accounting (file/block/byte address), the
//! status flag word, capability flags with automatic downgrade when a
//! driver rejects an operation, bounded retries for busy drives and
//! the blocking/steal-lock discipline.
//!
//! Addressing differs by device class. Tape devices count filemarks
//! (`file`) and blocks since the last filemark (`block_num`). Disk
//! volumes use the byte offset, split as `addr = (file << 32) | block`,
//! so `reposition` works uniformly for both.

use std::io;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{bail, format_err, Error};

use mag_tape::{ChecksumPolicy, DeviceBlock, VolumeLabel};

use crate::store::backend::{is_unsupported, open_backend, DeviceBackend, OpenMode};
use crate::store::catalog::VolumeCatalogInfo;
use crate::store::lock::{BlockedReason, BlockingLock, LockGuard, SafeOpGuard};
use crate::store::{DeviceConfig, DeviceType};

bitflags::bitflags! {
    /// What the device (driver + config) can do. Flags are cleared at
    /// runtime when the driver turns out not to support an operation.
    pub struct Capabilities: u32 {
        /// forward space file
        const FSF = 1 << 0;
        /// backward space file
        const BSF = 1 << 1;
        /// forward space record
        const FSR = 1 << 2;
        /// backward space record
        const BSR = 1 << 3;
        /// hardware end-of-medium positioning
        const EOM = 1 << 4;
        /// removable media
        const REM = 1 << 5;
        /// random access positioning
        const RACCESS = 1 << 6;
        /// drive belongs to an autochanger
        const AUTOCHANGER = 1 << 7;
        /// offline the drive before unmount
        const OFFLINEUNMOUNT = 1 << 8;
        /// keep the device open between jobs
        const ALWAYSOPEN = 1 << 9;
        /// same as AUTOCHANGER, kept separate so the changer flag can
        /// be dropped while the drive stays associated
        const ATTACHED_TO_AUTOCHANGER = 1 << 10;
        /// device reports (file, block) positions
        const POSITIONBLOCKS = 1 << 11;
        /// device answers position/status queries
        const MTIOCGET = 1 << 12;
        /// backward space one file after hardware EOM
        const BSFATEOM = 1 << 13;
        /// driver-level forward space instead of reading through
        const FASTFSF = 1 << 14;
        /// drive writes two filemarks at end of data
        const TWOEOF = 1 << 15;
        /// sequential stream, no positioning at all
        const STREAM = 1 << 16;
    }
}

bitflags::bitflags! {
    /// Runtime status of the device.
    pub struct DeviceStatus: u32 {
        const OPENED = 1 << 0;
        /// positioned at end of media
        const EOT = 1 << 1;
        /// a write hit end of media; stays set until rewind or
        /// explicit clear, every further write is refused
        const WEOT = 1 << 2;
        /// the last read returned a filemark
        const EOF = 1 << 3;
        /// a next volume has been requested
        const NEXTVOL = 1 << 4;
        /// the last block was short
        const SHORT = 1 << 5;
        const MOUNTED = 1 << 6;
        /// media is present in the drive
        const MEDIA = 1 << 7;
        const OFFLINE = 1 << 8;
        /// opened for append
        const APPEND = 1 << 9;
        /// opened for read
        const READ = 1 << 10;
        /// a volume label has been read or written
        const LABELED = 1 << 11;
    }
}

#[derive(thiserror::Error, Debug)]
pub enum BlockReadError {
    /// Hit a filemark (tape) - the reader is now positioned in the
    /// next file.
    #[error("end of file")]
    EndOfFile,
    /// Nothing more to read on this volume.
    #[error("end of data")]
    EndOfData,
    #[error("bad block: {0}")]
    Format(#[from] mag_tape::BlockError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum BlockWriteError {
    /// The write hit the end of the media; the caller must switch to
    /// the next volume (the block content is still intact).
    #[error("end of media")]
    EndOfMedium,
    /// A previous write already hit end of media.
    #[error("device is at end of media")]
    Weot,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub(crate) struct DeviceState {
    backend: Option<Box<dyn DeviceBackend>>,
    open_mode: OpenMode,
    /// volume name passed to open, kept for reopen recovery
    open_vol_name: String,
    pub status: DeviceStatus,
    /// filemark count (tape) or high half of the byte address (disk)
    pub file: u32,
    /// block within the file (tape) or low half of the byte address
    pub block_num: u32,
    /// byte address within the current file (tape) or volume (disk)
    pub file_addr: u64,
    /// bytes written to the volume since open
    file_size: u64,
    pub vol_label: Option<VolumeLabel>,
    pub vol_cat: VolumeCatalogInfo,
    /// changer slot currently in the drive, if known
    pub loaded_slot: Option<i32>,
    pub num_writers: u32,
    pub num_reserved: u32,
}

/// One configured storage device (tape drive, volume directory, ...).
///
/// All methods take `&self`; devices are shared between job threads
/// via `Arc` and the interior mutex. Long operations (rewind retries,
/// spacing) hold the state mutex for their duration, which is intended
/// since the hardware is busy anyway.
pub struct Device {
    pub config: DeviceConfig,
    caps: Mutex<Capabilities>,
    state: Mutex<DeviceState>,
    blocking: BlockingLock,
}

fn initial_capabilities(config: &DeviceConfig) -> Capabilities {
    let mut caps = match config.dev_type {
        DeviceType::Tape => {
            Capabilities::FSF
                | Capabilities::BSF
                | Capabilities::FSR
                | Capabilities::BSR
                | Capabilities::EOM
                | Capabilities::REM
                | Capabilities::OFFLINEUNMOUNT
                | Capabilities::POSITIONBLOCKS
                | Capabilities::MTIOCGET
        }
        DeviceType::VTape => {
            Capabilities::FSF
                | Capabilities::BSF
                | Capabilities::FSR
                | Capabilities::BSR
                | Capabilities::EOM
                | Capabilities::REM
                | Capabilities::POSITIONBLOCKS
                | Capabilities::MTIOCGET
                | Capabilities::TWOEOF
        }
        DeviceType::File => Capabilities::RACCESS | Capabilities::POSITIONBLOCKS,
        DeviceType::Fifo => Capabilities::STREAM,
    };

    if config.fast_fsf && caps.contains(Capabilities::FSF) {
        caps.insert(Capabilities::FASTFSF);
    }
    if !config.hardware_end_of_medium {
        caps.remove(Capabilities::EOM);
    }
    if config.bsf_at_eom {
        caps.insert(Capabilities::BSFATEOM);
    }
    if config.two_eof {
        caps.insert(Capabilities::TWOEOF);
    }
    if config.always_open {
        caps.insert(Capabilities::ALWAYSOPEN);
    }
    if !config.removable_media {
        caps.remove(Capabilities::REM);
    }
    if config.changer_name.is_some() {
        caps.insert(Capabilities::AUTOCHANGER | Capabilities::ATTACHED_TO_AUTOCHANGER);
    }
    caps
}

impl Device {
    pub fn new(config: DeviceConfig) -> Self {
        let caps = initial_capabilities(&config);
        Self {
            config,
            caps: Mutex::new(caps),
            state: Mutex::new(DeviceState {
                backend: None,
                open_mode: OpenMode::Read,
                open_vol_name: String::new(),
                status: DeviceStatus::empty(),
                file: 0,
                block_num: 0,
                file_addr: 0,
                file_size: 0,
                vol_label: None,
                vol_cat: VolumeCatalogInfo::default(),
                loaded_slot: None,
                num_writers: 0,
                num_reserved: 0,
            }),
            blocking: BlockingLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn is_tape(&self) -> bool {
        self.config.dev_type.is_tape()
    }

    pub fn capabilities(&self) -> Capabilities {
        *self.caps.lock().unwrap()
    }

    fn clear_capability(&self, cap: Capabilities, op: &str) {
        let mut caps = self.caps.lock().unwrap();
        if caps.contains(cap) {
            log::warn!(
                "device {}: driver does not support {op}, disabling",
                self.config.name
            );
            caps.remove(cap);
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap()
    }

    pub fn checksum_policy(&self) -> ChecksumPolicy {
        if self.config.block_checksum {
            ChecksumPolicy::Enforce
        } else {
            ChecksumPolicy::Warn
        }
    }

    /// Fresh staging block sized for this device.
    pub fn new_block(&self) -> DeviceBlock {
        DeviceBlock::new(self.config.max_block_size)
    }

    // --- locking -----------------------------------------------------

    /// Raw reentrant device lock.
    pub fn lock(&self) -> LockGuard<'_> {
        self.blocking.lock()
    }

    /// Device lock honoring the blocked state.
    pub fn rlock(&self) -> LockGuard<'_> {
        self.blocking.rlock()
    }

    pub fn block(&self, guard: &LockGuard<'_>, reason: BlockedReason) {
        log::debug!("device {}: blocked ({})", self.config.name, reason.as_str());
        self.blocking.block(guard, reason);
    }

    pub fn unblock(&self) {
        log::debug!("device {}: unblocked", self.config.name);
        self.blocking.unblock();
    }

    pub fn blocked(&self) -> BlockedReason {
        self.blocking.blocked()
    }

    /// Steal past a blocked device for a label operation.
    pub fn try_begin_safe_op(&self, reason: BlockedReason) -> Option<SafeOpGuard<'_>> {
        self.blocking.try_begin_safe_op(reason)
    }

    pub fn signal_next_volume(&self) {
        self.blocking.signal_next_volume()
    }

    pub fn wait_next_volume(&self, timeout: Duration) -> bool {
        self.blocking.wait_next_volume(timeout)
    }

    // --- open/close --------------------------------------------------

    /// Open the device, retrying while the drive is busy.
    ///
    /// `vol_name` selects the volume for disk devices; tape drives
    /// ignore it and use whatever is loaded.
    pub fn open(&self, vol_name: &str, mode: OpenMode) -> Result<(), Error> {
        let mut state = self.state();
        if state.backend.is_some() {
            bail!("device {} is already open", self.config.name);
        }
        if self.config.min_block_size > self.config.max_block_size {
            bail!(
                "device {}: min block size {} exceeds max block size {}",
                self.config.name,
                self.config.min_block_size,
                self.config.max_block_size
            );
        }

        let deadline = Instant::now() + Duration::from_secs(self.config.max_open_wait);
        let backend = loop {
            match open_backend(&self.config, vol_name, mode) {
                Ok(backend) => break backend,
                Err(err)
                    if err.raw_os_error() == Some(libc::EBUSY) && Instant::now() < deadline =>
                {
                    log::info!(
                        "device {} busy, retrying open in 5s",
                        self.config.name
                    );
                    std::thread::sleep(Duration::from_secs(5));
                }
                Err(err) => {
                    return Err(format_err!(
                        "cannot open device {}: {}",
                        self.config.name,
                        err
                    ))
                }
            }
        };

        state.backend = Some(backend);
        state.open_mode = mode;
        state.open_vol_name = vol_name.to_string();
        state.status = DeviceStatus::OPENED
            | DeviceStatus::MOUNTED
            | if mode.writable() {
                DeviceStatus::APPEND
            } else {
                DeviceStatus::READ
            };
        state.file = 0;
        state.block_num = 0;
        state.file_addr = 0;
        state.file_size = 0;
        log::debug!("device {} opened ({:?})", self.config.name, mode);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.state().backend.is_some()
    }

    pub fn close(&self) -> Result<(), Error> {
        let mut state = self.state();
        if let Some(mut backend) = state.backend.take() {
            backend.sync()?;
        }
        state.status = DeviceStatus::empty();
        state.vol_label = None;
        state.file = 0;
        state.block_num = 0;
        state.file_addr = 0;
        state.file_size = 0;
        log::debug!("device {} closed", self.config.name);
        Ok(())
    }

    fn backend<'a>(
        &self,
        state: &'a mut DeviceState,
    ) -> Result<&'a mut Box<dyn DeviceBackend>, io::Error> {
        state.backend.as_mut().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotConnected,
                format!("device {} is not open", self.config.name),
            )
        })
    }

    // --- status ------------------------------------------------------

    pub fn status(&self) -> DeviceStatus {
        self.state().status
    }

    pub fn is_weot(&self) -> bool {
        self.state().status.contains(DeviceStatus::WEOT)
    }

    pub fn at_eof(&self) -> bool {
        self.state().status.contains(DeviceStatus::EOF)
    }

    pub fn at_eot(&self) -> bool {
        self.state().status.contains(DeviceStatus::EOT)
    }

    pub fn is_labeled(&self) -> bool {
        self.state().status.contains(DeviceStatus::LABELED)
    }

    /// Forget the end-of-media condition after the volume changed.
    pub fn clear_weot(&self) {
        let mut state = self.state();
        state
            .status
            .remove(DeviceStatus::WEOT | DeviceStatus::EOT | DeviceStatus::NEXTVOL);
    }

    /// (file, block) position as tracked by the device layer.
    pub fn position(&self) -> (u32, u32) {
        let state = self.state();
        (state.file, state.block_num)
    }

    pub fn volume_label(&self) -> Option<VolumeLabel> {
        self.state().vol_label.clone()
    }

    pub(crate) fn set_volume_label(&self, label: VolumeLabel) {
        let mut state = self.state();
        state.vol_label = Some(label);
        state.status.insert(DeviceStatus::LABELED);
    }

    pub(crate) fn clear_volume_label(&self) {
        let mut state = self.state();
        state.vol_label = None;
        state.status.remove(DeviceStatus::LABELED);
    }

    pub fn vol_cat(&self) -> VolumeCatalogInfo {
        self.state().vol_cat.clone()
    }

    pub fn set_vol_cat(&self, vol_cat: VolumeCatalogInfo) {
        self.state().vol_cat = vol_cat;
    }

    pub fn num_writers(&self) -> u32 {
        self.state().num_writers
    }

    pub fn add_writer(&self) {
        self.state().num_writers += 1;
    }

    pub fn remove_writer(&self) {
        let mut state = self.state();
        debug_assert!(state.num_writers > 0);
        state.num_writers = state.num_writers.saturating_sub(1);
    }

    pub fn add_reservation(&self) {
        self.state().num_reserved += 1;
    }

    pub fn remove_reservation(&self) {
        let mut state = self.state();
        state.num_reserved = state.num_reserved.saturating_sub(1);
    }

    /// A busy device must not be stolen by changer operations.
    pub fn is_busy(&self) -> bool {
        let state = self.state();
        state.num_writers > 0 || state.num_reserved > 0 || self.blocked().is_blocked()
    }

    pub fn loaded_slot(&self) -> Option<i32> {
        self.state().loaded_slot
    }

    pub fn set_loaded_slot(&self, slot: Option<i32>) {
        self.state().loaded_slot = slot;
    }

    /// One-line state dump for status commands and log messages.
    pub fn status_summary(&self) -> String {
        let state = self.state();
        let volume = state
            .vol_label
            .as_ref()
            .map(|label| label.vol_name.as_str())
            .unwrap_or("*unlabeled*");
        format!(
            "device {} ({:?}): status {:?}, file {} block {}, {} bytes written, volume '{}', {} writer(s), {} reservation(s), blocked: {}",
            self.config.name,
            self.config.dev_type,
            state.status,
            state.file,
            state.block_num,
            state.file_size,
            volume,
            state.num_writers,
            state.num_reserved,
            self.blocked().as_str(),
        )
    }

    // --- positioning -------------------------------------------------

    pub fn rewind(&self) -> Result<(), Error> {
        let mut state = self.state();
        self.rewind_locked(&mut state)
    }

    fn rewind_locked(&self, state: &mut DeviceState) -> Result<(), Error> {
        let is_tape = self.is_tape();
        let deadline = Instant::now() + Duration::from_secs(self.config.max_rewind_wait);
        let mut reopened = false;

        loop {
            let backend = self.backend(state)?;
            match backend.rewind() {
                Ok(()) => break,
                Err(err)
                    if is_tape
                        && matches!(err.raw_os_error(), Some(libc::EBUSY) | Some(libc::EIO))
                        && Instant::now() < deadline =>
                {
                    log::warn!(
                        "device {}: rewind failed ({err}), retrying",
                        self.config.name
                    );
                    if !reopened {
                        // one-shot close/reopen, drives sometimes need
                        // a fresh file handle after an error
                        reopened = true;
                        let mode = state.open_mode;
                        let vol_name = state.open_vol_name.clone();
                        state.backend = None;
                        match open_backend(&self.config, &vol_name, mode) {
                            Ok(backend) => state.backend = Some(backend),
                            Err(err) => bail!(
                                "device {}: reopen during rewind failed: {}",
                                self.config.name,
                                err
                            ),
                        }
                    }
                    std::thread::sleep(Duration::from_secs(5));
                }
                Err(err) => {
                    bail!("device {}: rewind failed: {}", self.config.name, err)
                }
            }
        }

        state.file = 0;
        state.block_num = 0;
        state.file_addr = 0;
        state
            .status
            .remove(DeviceStatus::EOF | DeviceStatus::EOT | DeviceStatus::WEOT);
        Ok(())
    }

    /// Forward space `count` filemarks.
    ///
    /// Returns `Ok(false)` when the end of the recorded data was
    /// reached before `count` marks were crossed (status gets EOT).
    pub fn fsf(&self, count: u32) -> Result<bool, Error> {
        let mut state = self.state();
        self.fsf_locked(&mut state, count)
    }

    fn fsf_locked(&self, state: &mut DeviceState, count: u32) -> Result<bool, Error> {
        if count == 0 {
            return Ok(true);
        }
        if !self.is_tape() {
            bail!("device {}: fsf on non-tape device", self.config.name);
        }
        if state.status.contains(DeviceStatus::EOT) {
            return Ok(false);
        }

        let caps = self.capabilities();

        if caps.contains(Capabilities::FSF | Capabilities::FASTFSF) {
            let backend = self.backend(state)?;
            match backend.fsf(count) {
                Ok(()) => {
                    state.file += count;
                    state.block_num = 0;
                    state.file_addr = 0;
                    state.status.insert(DeviceStatus::EOF);
                    return Ok(true);
                }
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                    // spaced into the end-of-data area
                    if let Ok(Some((file, _block))) = backend.position() {
                        state.file = file;
                    }
                    state.block_num = 0;
                    state.file_addr = 0;
                    state.status.insert(DeviceStatus::EOT);
                    return Ok(false);
                }
                Err(err) if is_unsupported(&err) => {
                    self.clear_capability(Capabilities::FASTFSF, "fast forward-space-file");
                    // fall through to the read loop
                }
                Err(err) => {
                    bail!("device {}: fsf failed: {}", self.config.name, err)
                }
            }
        }

        // no driver shortcut: read through the data, counting filemarks
        let mut scratch = proxmox_io::vec::undefined(self.config.max_block_size);
        let mut crossed = 0;
        let mut last_was_eof = state.status.contains(DeviceStatus::EOF);
        while crossed < count {
            let backend = self.backend(state)?;
            match backend.read_block(&mut scratch) {
                Ok(0) => {
                    if last_was_eof {
                        // two zero reads in a row: end of data
                        state.status.insert(DeviceStatus::EOT);
                        return Ok(false);
                    }
                    last_was_eof = true;
                    crossed += 1;
                    state.file += 1;
                    state.block_num = 0;
                    state.file_addr = 0;
                    state.status.insert(DeviceStatus::EOF);
                }
                Ok(_) => {
                    last_was_eof = false;
                    state.status.remove(DeviceStatus::EOF);
                }
                Err(err) => {
                    bail!("device {}: fsf read failed: {}", self.config.name, err)
                }
            }
        }
        Ok(true)
    }

    /// Backward space `count` filemarks.
    pub fn bsf(&self, count: u32) -> Result<(), Error> {
        let mut state = self.state();
        self.bsf_locked(&mut state, count)
    }

    fn bsf_locked(&self, state: &mut DeviceState, count: u32) -> Result<(), Error> {
        if count == 0 {
            return Ok(());
        }
        if !self.capabilities().contains(Capabilities::BSF) {
            bail!("device {}: backward spacing not supported", self.config.name);
        }
        let backend = self.backend(state)?;
        match backend.bsf(count) {
            Ok(()) => {
                state.file = state.file.saturating_sub(count);
                state.block_num = 0;
                state.file_addr = 0;
                state
                    .status
                    .remove(DeviceStatus::EOT | DeviceStatus::WEOT | DeviceStatus::EOF);
                Ok(())
            }
            Err(err) if is_unsupported(&err) => {
                self.clear_capability(Capabilities::BSF, "backward-space-file");
                bail!("device {}: backward spacing not supported", self.config.name)
            }
            Err(err) => bail!("device {}: bsf failed: {}", self.config.name, err),
        }
    }

    /// Forward space `count` records within the current file.
    pub fn fsr(&self, count: u32) -> Result<(), Error> {
        let mut state = self.state();
        self.fsr_locked(&mut state, count)
    }

    fn fsr_locked(&self, state: &mut DeviceState, count: u32) -> Result<(), Error> {
        if count == 0 {
            return Ok(());
        }
        if self.capabilities().contains(Capabilities::FSR) {
            let backend = self.backend(state)?;
            match backend.fsr(count) {
                Ok(()) => {
                    state.block_num += count;
                    return Ok(());
                }
                Err(err) if is_unsupported(&err) => {
                    self.clear_capability(Capabilities::FSR, "forward-space-record");
                }
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                    state.status.insert(DeviceStatus::EOF);
                    state.file += 1;
                    state.block_num = 0;
                    state.file_addr = 0;
                    bail!("device {}: fsr hit a filemark", self.config.name);
                }
                Err(err) => bail!("device {}: fsr failed: {}", self.config.name, err),
            }
        }

        // simulate by reading and discarding
        let mut scratch = proxmox_io::vec::undefined(self.config.max_block_size);
        for _ in 0..count {
            let backend = self.backend(state)?;
            match backend.read_block(&mut scratch) {
                Ok(0) => {
                    state.status.insert(DeviceStatus::EOF);
                    state.file += 1;
                    state.block_num = 0;
                    state.file_addr = 0;
                    bail!("device {}: fsr hit a filemark", self.config.name);
                }
                Ok(_) => state.block_num += 1,
                Err(err) => bail!("device {}: fsr read failed: {}", self.config.name, err),
            }
        }
        Ok(())
    }

    /// Backward space `count` records.
    pub fn bsr(&self, count: u32) -> Result<(), Error> {
        let mut state = self.state();
        if count == 0 {
            return Ok(());
        }
        if !self.capabilities().contains(Capabilities::BSR) {
            bail!("device {}: backward-space-record not supported", self.config.name);
        }
        let backend = self.backend(&mut state)?;
        match backend.bsr(count) {
            Ok(()) => {
                state.block_num = state.block_num.saturating_sub(count);
                state.status.remove(DeviceStatus::EOF | DeviceStatus::EOT);
                Ok(())
            }
            Err(err) if is_unsupported(&err) => {
                self.clear_capability(Capabilities::BSR, "backward-space-record");
                bail!("device {}: backward-space-record not supported", self.config.name)
            }
            Err(err) => bail!("device {}: bsr failed: {}", self.config.name, err),
        }
    }

    /// Position after the last written data, ready for appending.
    pub fn eod(&self) -> Result<(), Error> {
        let mut state = self.state();
        self.eod_locked(&mut state)
    }

    fn eod_locked(&self, state: &mut DeviceState) -> Result<(), Error> {
        if !self.is_tape() {
            let backend = self.backend(state)?;
            let addr = backend.seek_end()?;
            state.file_addr = addr;
            state.file = (addr >> 32) as u32;
            state.block_num = addr as u32;
            return Ok(());
        }

        let caps = self.capabilities();
        if caps.contains(Capabilities::EOM) {
            let backend = self.backend(state)?;
            match backend.eod() {
                Ok(()) => {
                    if caps.contains(Capabilities::BSFATEOM) {
                        // the drive stopped after the second filemark
                        backend.bsf(1)?;
                    }
                    let backend = self.backend(state)?;
                    if let Ok(Some((file, block))) = backend.position() {
                        state.file = file;
                        state.block_num = block;
                        state.file_addr = 0;
                        state.status.remove(DeviceStatus::EOT);
                        state.status.insert(DeviceStatus::EOF);
                        return Ok(());
                    }
                    // position unknown, restart with the slow walk so
                    // the file counter stays accurate
                    self.rewind_locked(state)?;
                }
                Err(err) if is_unsupported(&err) => {
                    self.clear_capability(Capabilities::EOM, "end-of-medium positioning");
                    self.rewind_locked(state)?;
                }
                Err(err) => bail!("device {}: eod failed: {}", self.config.name, err),
            }
        } else {
            self.rewind_locked(state)?;
        }

        // walk filemark by filemark until two in a row
        while self.fsf_locked(state, 1)? {}
        state.status.remove(DeviceStatus::EOT);
        state.status.insert(DeviceStatus::EOF);
        Ok(())
    }

    /// Position to the given (file, block) address.
    pub fn reposition(&self, file: u32, block: u32) -> Result<(), Error> {
        let mut state = self.state();

        if !self.is_tape() {
            let addr = ((file as u64) << 32) | block as u64;
            let backend = self.backend(&mut state)?;
            backend.seek_to(addr)?;
            state.file = file;
            state.block_num = block;
            state.file_addr = addr;
            state.status.remove(DeviceStatus::EOF | DeviceStatus::EOT);
            return Ok(());
        }

        if file < state.file {
            self.rewind_locked(&mut state)?;
        }
        if file > state.file {
            let skip = file - state.file;
            if !self.fsf_locked(&mut state, skip)? {
                bail!(
                    "device {}: reposition beyond end of data (file {})",
                    self.config.name,
                    file
                );
            }
        }
        if block < state.block_num {
            // back to the start of the file, then space forward
            if self.capabilities().contains(Capabilities::BSF) {
                self.bsf_locked(&mut state, 1)?;
                if !self.fsf_locked(&mut state, 1)? {
                    bail!("device {}: reposition lost the file", self.config.name);
                }
            } else {
                self.rewind_locked(&mut state)?;
                if !self.fsf_locked(&mut state, file)? {
                    bail!("device {}: reposition lost the file", self.config.name);
                }
            }
        }
        if block > state.block_num {
            let skip = block - state.block_num;
            self.fsr_locked(&mut state, skip)?;
        }
        state.status.remove(DeviceStatus::EOF);
        Ok(())
    }

    /// Write `count` filemarks.
    pub fn weof(&self, count: u32) -> Result<(), Error> {
        let mut state = self.state();
        if !state.status.contains(DeviceStatus::APPEND) {
            bail!("device {}: weof on read-only device", self.config.name);
        }
        let backend = self.backend(&mut state)?;
        match backend.weof(count) {
            Ok(()) => {
                state.status.remove(DeviceStatus::EOF);
                state.file += count;
                state.block_num = 0;
                state.file_addr = 0;
                state.vol_cat.vol_files += count;
                Ok(())
            }
            Err(err) if err.raw_os_error() == Some(libc::ENOSPC) => {
                state.status.insert(DeviceStatus::WEOT | DeviceStatus::EOT);
                bail!("device {}: end of media writing filemark", self.config.name)
            }
            Err(err) => bail!("device {}: weof failed: {}", self.config.name, err),
        }
    }

    /// Discard the whole volume content (relabel).
    pub fn truncate(&self) -> Result<(), Error> {
        let mut state = self.state();
        let backend = self.backend(&mut state)?;
        match backend.truncate() {
            Ok(()) => {}
            Err(err) if is_unsupported(&err) => {
                // tape drives overwrite from the beginning instead
                self.rewind_locked(&mut state)?;
                return Ok(());
            }
            Err(err) => bail!("device {}: truncate failed: {}", self.config.name, err),
        }
        state.file = 0;
        state.block_num = 0;
        state.file_addr = 0;
        state.file_size = 0;
        state
            .status
            .remove(DeviceStatus::EOF | DeviceStatus::EOT | DeviceStatus::WEOT);
        Ok(())
    }

    /// Eject the media / put the drive offline.
    pub fn offline(&self) -> Result<(), Error> {
        let mut state = self.state();
        let backend = self.backend(&mut state)?;
        backend.offline()?;
        state.status.insert(DeviceStatus::OFFLINE);
        state
            .status
            .remove(DeviceStatus::MOUNTED | DeviceStatus::LABELED | DeviceStatus::MEDIA);
        state.vol_label = None;
        state.loaded_slot = None;
        Ok(())
    }

    // --- block I/O ---------------------------------------------------

    /// Write out a finalized block.
    ///
    /// The device assigns the block number. On success the staging
    /// buffer is emptied for the next block. End of media leaves the
    /// block intact so it can be rewritten to the next volume, and
    /// sets the sticky WEOT status.
    pub fn write_block(&self, block: &mut DeviceBlock) -> Result<(), BlockWriteError> {
        let mut state = self.state();

        if state.status.contains(DeviceStatus::WEOT) {
            return Err(BlockWriteError::Weot);
        }
        if block.is_empty() {
            return Ok(());
        }

        block.block_num = state.block_num;
        let len = block.binbuf() as u64;

        // disk volumes enforce the configured capacity here, tapes
        // report ENOSPC from the hardware
        if self.config.dev_type == DeviceType::File
            && self.config.max_volume_size > 0
            && state.file_addr + len > self.config.max_volume_size
        {
            state.status.insert(DeviceStatus::WEOT | DeviceStatus::EOT);
            return Err(BlockWriteError::EndOfMedium);
        }

        let is_tape = self.is_tape();
        let data = block.finalize();
        let backend = state.backend.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "device is not open")
        })?;
        match backend.write_block(data) {
            Ok(_) => {}
            Err(err) if err.raw_os_error() == Some(libc::ENOSPC) => {
                state.status.insert(DeviceStatus::WEOT | DeviceStatus::EOT);
                return Err(BlockWriteError::EndOfMedium);
            }
            Err(err) => return Err(BlockWriteError::Io(err)),
        }

        state.status.remove(DeviceStatus::EOF);
        state.file_addr += len;
        state.file_size += len;
        if is_tape {
            state.block_num += 1;
        } else {
            state.file = (state.file_addr >> 32) as u32;
            state.block_num = state.file_addr as u32;
        }
        state.vol_cat.vol_blocks += 1;
        state.vol_cat.vol_bytes += len;
        state.vol_cat.last_written = proxmox_time::epoch_i64();
        block.empty_block();
        Ok(())
    }

    /// Read the next block from the media into the staging buffer.
    pub fn read_block(&self, block: &mut DeviceBlock) -> Result<(), BlockReadError> {
        let policy = self.checksum_policy();
        let is_tape = self.is_tape();
        let mut state = self.state();

        let read_size = self.config.max_block_size.max(block.block_size());
        let mut raw = proxmox_io::vec::undefined(read_size);
        let backend = state.backend.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "device is not open")
        })?;
        let got = backend.read_block(&mut raw)?;

        if got == 0 {
            if !is_tape {
                state.status.insert(DeviceStatus::EOT);
                return Err(BlockReadError::EndOfData);
            }
            if state.status.contains(DeviceStatus::EOF) {
                // second zero read in a row
                state.status.insert(DeviceStatus::EOT);
                return Err(BlockReadError::EndOfData);
            }
            state.status.insert(DeviceStatus::EOF);
            state.file += 1;
            state.block_num = 0;
            state.file_addr = 0;
            return Err(BlockReadError::EndOfFile);
        }

        state.status.remove(DeviceStatus::EOF);
        block.load(&raw[..got], policy)?;
        let len = block.binbuf() as u64;

        if !is_tape && got > block.binbuf() {
            // regular files have no write boundaries, we read a full
            // buffer; push the surplus back
            let target = state.file_addr + len;
            let backend = state.backend.as_mut().ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotConnected, "device is not open")
            })?;
            backend.seek_to(target)?;
        }

        state.file_addr += len;
        if is_tape {
            state.block_num = block.block_num.wrapping_add(1);
        } else {
            state.file = (state.file_addr >> 32) as u32;
            state.block_num = state.file_addr as u32;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use mag_tape::{read_record_from_block, write_record_to_block, DeviceRecord};

    fn test_dir(name: &str) -> String {
        let path = format!(
            "./target/testout/{}/{}",
            module_path!().replace("::", "/"),
            name
        );
        let _ = std::fs::remove_dir_all(&path);
        std::fs::create_dir_all(&path).unwrap();
        path
    }

    fn write_one(dev: &Device, block: &mut DeviceBlock, file_index: i32, payload: &[u8]) {
        let mut rec = DeviceRecord::new();
        rec.prepare(file_index, 1, payload);
        assert!(write_record_to_block(block, &mut rec));
        dev.write_block(block).unwrap();
    }

    #[test]
    fn inconsistent_block_sizes_refuse_to_open() {
        let dir = test_dir("inconsistent_block_sizes_refuse_to_open");
        let mut config = DeviceConfig::new("fd0", &dir, DeviceType::File, "File");
        config.min_block_size = 2 * config.max_block_size;
        let dev = Device::new(config);
        let err = dev.open("Vol0001", OpenMode::CreateReadWrite).unwrap_err();
        assert!(err.to_string().contains("min block size"), "{err}");
        assert!(!dev.is_open());
    }

    #[test]
    fn status_summary_reports_progress() {
        let dir = test_dir("status_summary_reports_progress");
        let config = DeviceConfig::new("fd0", &dir, DeviceType::File, "File");
        let dev = Device::new(config);
        dev.open("Vol0001", OpenMode::CreateReadWrite).unwrap();

        let mut block = dev.new_block();
        write_one(&dev, &mut block, 1, b"payload");

        let summary = dev.status_summary();
        assert!(summary.contains("device fd0"), "{summary}");
        assert!(summary.contains("bytes written"), "{summary}");
        assert!(!summary.contains(" 0 bytes written"), "{summary}");
    }

    #[test]
    fn file_volume_roundtrip() {
        let dir = test_dir("file_volume_roundtrip");
        let config = DeviceConfig::new("fd0", &dir, DeviceType::File, "File");
        let dev = Device::new(config);
        dev.open("Vol0001", OpenMode::CreateReadWrite).unwrap();

        let mut block = dev.new_block();
        for i in 1..=3 {
            write_one(&dev, &mut block, i, format!("payload {}", i).as_bytes());
        }

        dev.rewind().unwrap();
        let mut rec = DeviceRecord::new();
        for i in 1..=3 {
            dev.read_block(&mut block).unwrap();
            assert!(read_record_from_block(&mut block, &mut rec));
            assert_eq!(rec.file_index, i);
            assert_eq!(rec.data, format!("payload {}", i).as_bytes());
        }
        assert!(matches!(
            dev.read_block(&mut block),
            Err(BlockReadError::EndOfData)
        ));
        dev.close().unwrap();
    }

    #[test]
    fn vtape_two_eof_detection() {
        let dir = test_dir("vtape_two_eof_detection");
        let config = DeviceConfig::new("vt0", &dir, DeviceType::VTape, "VTape");
        let dev = Device::new(config);
        dev.open("Tape01", OpenMode::CreateReadWrite).unwrap();

        let mut block = dev.new_block();
        write_one(&dev, &mut block, 1, b"file zero");
        dev.weof(1).unwrap();
        write_one(&dev, &mut block, 2, b"file one");
        dev.weof(1).unwrap();
        assert_eq!(dev.position().0, 2);

        dev.rewind().unwrap();
        assert!(dev.read_block(&mut block).is_ok());
        assert!(matches!(
            dev.read_block(&mut block),
            Err(BlockReadError::EndOfFile)
        ));
        assert_eq!(dev.position(), (1, 0));
        assert!(dev.read_block(&mut block).is_ok());
        assert!(matches!(
            dev.read_block(&mut block),
            Err(BlockReadError::EndOfFile)
        ));
        // the second consecutive filemark means end of data
        assert!(matches!(
            dev.read_block(&mut block),
            Err(BlockReadError::EndOfData)
        ));
        assert!(dev.at_eot());
        dev.close().unwrap();
    }

    #[test]
    fn weot_is_sticky() {
        let dir = test_dir("weot_is_sticky");
        let mut config = DeviceConfig::new("vt0", &dir, DeviceType::VTape, "VTape");
        config.max_volume_size = 2048;
        config.max_block_size = 512;
        let dev = Device::new(config);
        dev.open("Tape01", OpenMode::CreateReadWrite).unwrap();

        let mut block = dev.new_block();
        let payload = vec![0x5a; 400];
        let mut rec = DeviceRecord::new();
        let mut hit_eom = false;
        for i in 1..100 {
            rec.prepare(i, 1, &payload);
            assert!(write_record_to_block(&mut block, &mut rec));
            match dev.write_block(&mut block) {
                Ok(()) => {}
                Err(BlockWriteError::EndOfMedium) => {
                    hit_eom = true;
                    break;
                }
                Err(err) => panic!("unexpected write error: {err}"),
            }
        }
        assert!(hit_eom);
        assert!(dev.is_weot());

        // every further write is refused without touching the media
        assert!(matches!(
            dev.write_block(&mut block),
            Err(BlockWriteError::Weot)
        ));

        // rewind clears the condition (volume gets overwritten)
        dev.rewind().unwrap();
        assert!(!dev.is_weot());
        dev.write_block(&mut block).unwrap();
        dev.close().unwrap();
    }

    #[test]
    fn vtape_fsf_and_eod() {
        let dir = test_dir("vtape_fsf_and_eod");
        let config = DeviceConfig::new("vt0", &dir, DeviceType::VTape, "VTape");
        let dev = Device::new(config);
        dev.open("Tape01", OpenMode::CreateReadWrite).unwrap();

        let mut block = dev.new_block();
        for i in 1..=3 {
            write_one(&dev, &mut block, i, b"data");
            dev.weof(1).unwrap();
        }

        dev.rewind().unwrap();
        assert!(dev.fsf(2).unwrap());
        assert_eq!(dev.position().0, 2);
        let mut rec = DeviceRecord::new();
        dev.read_block(&mut block).unwrap();
        assert!(read_record_from_block(&mut block, &mut rec));
        assert_eq!(rec.file_index, 3);

        // spacing past the end reports it instead of erroring
        dev.rewind().unwrap();
        assert!(!dev.fsf(10).unwrap());
        assert!(dev.at_eot());

        dev.rewind().unwrap();
        dev.eod().unwrap();
        assert_eq!(dev.position().0, 3);
        write_one(&dev, &mut block, 4, b"appended");
        dev.close().unwrap();
    }

    #[test]
    fn reposition_on_disk_volume() {
        let dir = test_dir("reposition_on_disk_volume");
        let config = DeviceConfig::new("fd0", &dir, DeviceType::File, "File");
        let dev = Device::new(config);
        dev.open("Vol0001", OpenMode::CreateReadWrite).unwrap();

        let mut block = dev.new_block();
        write_one(&dev, &mut block, 1, b"first");
        let (file, blk) = dev.position();
        write_one(&dev, &mut block, 2, b"second");

        dev.reposition(file, blk).unwrap();
        let mut rec = DeviceRecord::new();
        dev.read_block(&mut block).unwrap();
        assert!(read_record_from_block(&mut block, &mut rec));
        assert_eq!(rec.file_index, 2);
        dev.close().unwrap();
    }

    #[test]
    fn vtape_reposition() {
        let dir = test_dir("vtape_reposition");
        let config = DeviceConfig::new("vt0", &dir, DeviceType::VTape, "VTape");
        let dev = Device::new(config);
        dev.open("Tape01", OpenMode::CreateReadWrite).unwrap();

        let mut block = dev.new_block();
        for i in 1..=4 {
            write_one(&dev, &mut block, i, format!("block {}", i).as_bytes());
            if i == 2 {
                dev.weof(1).unwrap();
            }
        }

        // file 1, second block holds FileIndex 4
        dev.reposition(1, 1).unwrap();
        let mut rec = DeviceRecord::new();
        dev.read_block(&mut block).unwrap();
        assert!(read_record_from_block(&mut block, &mut rec));
        assert_eq!(rec.file_index, 4);

        // backwards within the tape means rewind + space forward
        dev.reposition(0, 1).unwrap();
        dev.read_block(&mut block).unwrap();
        assert!(read_record_from_block(&mut block, &mut rec));
        assert_eq!(rec.file_index, 2);
        dev.close().unwrap();
    }
}
