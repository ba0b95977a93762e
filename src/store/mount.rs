//! Finding and mounting the next write volume
//!
//! The central retry loop behind every append: ask the catalog for a
//! volume, get it into the drive (autochanger or operator), verify
//! the label, position for append and clear the end-of-media state.
//! Every misstep (wrong volume, blank media, unreadable label) is
//! handled by trying again with the next candidate until the retry
//! budget runs out.

use std::time::Duration;

use anyhow::{bail, Error};

use crate::store::backend::OpenMode;
use crate::store::changer::autoload_device;
use crate::store::dcr::DeviceContext;
use crate::store::label::{
    read_volume_label, rewrite_volume_label, write_new_volume_label, VolumeStatus,
};
use crate::store::lock::BlockedReason;
use crate::store::wait::{wait_for_sysop, WaitStatus};
use crate::store::DeviceType;

/// Mount attempts before the job gives up.
const MAX_MOUNT_RETRIES: u32 = 8;

/// Wrong-volume label reads before the job gives up. Wrong volumes do
/// not count against `MAX_MOUNT_RETRIES`, a big changer may serve
/// many valid-but-different volumes before the right one shows up.
const MAX_LABEL_RETRIES: u32 = 100;

/// Default pool metadata for automatically labeled media.
const AUTO_LABEL_POOL: &str = "Default";
const AUTO_LABEL_POOL_TYPE: &str = "Backup";

fn append_open_mode(dev_type: DeviceType) -> OpenMode {
    match dev_type {
        DeviceType::File | DeviceType::VTape => OpenMode::CreateReadWrite,
        DeviceType::Tape | DeviceType::Fifo => OpenMode::ReadWrite,
    }
}

/// Get an appendable volume mounted and positioned on the device.
///
/// On success the device is positioned for append, the volume is
/// reserved and in use, the catalog entry is updated and any WEOT
/// condition from the previous volume is cleared. Threads waiting for
/// a volume on this device are woken up.
pub fn mount_next_write_volume(dcr: &mut DeviceContext) -> Result<(), Error> {
    let dev = dcr.dev.clone();
    {
        let guard = dev.rlock();
        dev.block(&guard, BlockedReason::DoingAcquire);
    }
    let result = mount_loop(dcr);
    dev.unblock();
    if result.is_ok() {
        dev.signal_next_volume();
    }
    result
}

fn mount_loop(dcr: &mut DeviceContext) -> Result<(), Error> {
    let dev = dcr.dev.clone();
    let mut retries = 0;

    loop {
        if dcr.is_cancelled() {
            bail!("job {} cancelled while mounting", dcr.job_id);
        }
        retries += 1;
        if retries > MAX_MOUNT_RETRIES {
            log::error!("{}", dev.status_summary());
            bail!(
                "device {}: cannot mount a usable volume after {} attempts",
                dev.name(),
                MAX_MOUNT_RETRIES
            );
        }

        // pick a volume: the requested one, or whatever the catalog
        // offers for this media type
        let candidate = if dcr.vol_name.is_empty() {
            dcr.catalog
                .find_next_appendable_volume(&dev.config.media_type)?
        } else {
            dcr.catalog.get_volume_info(&dcr.vol_name)?
        };
        let vol_cat = match candidate {
            Some(info) => info,
            None => {
                if !wait_for_operator(dcr, "no appendable volume available")? {
                    bail!(
                        "device {}: no appendable volume of type '{}'",
                        dev.name(),
                        dev.config.media_type
                    );
                }
                continue;
            }
        };
        let vol_name = vol_cat.vol_name.clone();

        if !dcr.volumes.can_i_write_volume(&vol_name, dev.name()) {
            log::info!(
                "device {}: volume '{}' is busy on another device",
                dev.name(),
                vol_name
            );
            if !wait_for_operator(dcr, "wanted volume is in use elsewhere")? {
                bail!("device {}: volume '{}' stays busy", dev.name(), vol_name);
            }
            continue;
        }

        // physically get the volume into the drive
        if vol_cat.in_changer && vol_cat.slot > 0 {
            if dev.is_open() {
                dev.close()?;
            }
            match autoload_device(&dev, &dcr.changers, vol_cat.slot, &vol_name) {
                Ok(_) => {}
                Err(err) => {
                    log::error!("{err}");
                    continue;
                }
            }
        }

        // (re)open on the chosen volume
        if dev.is_open() {
            dev.close()?;
        }
        let mode = append_open_mode(dev.config.dev_type);
        if let Err(err) = dev.open(&vol_name, mode) {
            log::error!("{err}");
            if !wait_for_operator(dcr, "cannot open the device")? {
                return Err(err);
            }
            continue;
        }

        dcr.vol_name = vol_name.clone();
        match read_volume_label(dcr, &vol_name, true)? {
            VolumeStatus::Ok => {
                let recycle = dcr.vol_cat.vol_status == "Recycle" || dcr.vol_cat.recycle;
                if !dcr.vol_cat.is_appendable() && !dcr.vol_cat.vol_status.is_empty() {
                    log::warn!(
                        "device {}: volume '{}' is marked '{}', not appendable",
                        dev.name(),
                        vol_name,
                        dcr.vol_cat.vol_status
                    );
                    dcr.vol_name.clear();
                    continue;
                }
                position_for_append(dcr, recycle)?;
            }
            VolumeStatus::NoLabel => {
                if !dev.config.label_media {
                    log::warn!(
                        "device {}: media is blank and automatic labeling is off",
                        dev.name()
                    );
                    if !wait_for_operator(dcr, "blank media, volume must be labeled")? {
                        bail!("device {}: blank media for volume '{}'", dev.name(), vol_name);
                    }
                    continue;
                }
                write_new_volume_label(dcr, &vol_name, AUTO_LABEL_POOL, AUTO_LABEL_POOL_TYPE)?;
                position_for_append(dcr, false)?;
            }
            VolumeStatus::NameError => {
                // the drive holds some other (valid) volume; retry,
                // re-consulting catalog and changer
                if dcr.label_retries > MAX_LABEL_RETRIES {
                    log::error!("{}", dev.status_summary());
                    bail!(
                        "device {}: still the wrong volume after {} label reads",
                        dev.name(),
                        MAX_LABEL_RETRIES
                    );
                }
                log::info!(
                    "device {}: retry {} after wrong volume",
                    dev.name(),
                    dcr.label_retries
                );
                retries -= 1;
                continue;
            }
            VolumeStatus::VersionError | VolumeStatus::LabelError => {
                // unusable media, never try this volume again
                let mut bad = vol_cat;
                bad.vol_status = "Error".to_string();
                dcr.catalog.update_volume_info(&bad)?;
                dcr.vol_name.clear();
                continue;
            }
            VolumeStatus::IoError => {
                if !wait_for_operator(dcr, "i/o error reading the volume label")? {
                    bail!("device {}: cannot read volume label", dev.name());
                }
                continue;
            }
            VolumeStatus::NoMedia => {
                if !wait_for_operator(dcr, "no media in the drive")? {
                    bail!("device {}: no media in drive", dev.name());
                }
                continue;
            }
        }

        // the volume is good and positioned
        dcr.volumes.mark_in_use(&vol_name);
        dev.clear_weot();
        dcr.label_retries = 0;

        let mut vol_cat = dev.vol_cat();
        vol_cat.vol_jobs += 1;
        dev.set_vol_cat(vol_cat.clone());
        dcr.vol_cat = vol_cat.clone();
        dcr.catalog.update_volume_info(&vol_cat)?;

        log::info!(
            "device {}: volume '{}' mounted for append (file {})",
            dev.name(),
            vol_name,
            dev.position().0
        );
        return Ok(());
    }
}

/// Position the mounted volume so the next written block lands after
/// all existing data.
fn position_for_append(dcr: &mut DeviceContext, recycle: bool) -> Result<(), Error> {
    let dev = dcr.dev.clone();
    if dcr.vol_pre_labeled || recycle {
        // freshly labeled or recycled media is overwritten from the
        // start, with the label rewritten for real use
        rewrite_volume_label(dcr, recycle)?;
        return Ok(());
    }

    dev.eod()?;
    let (file, _block) = dev.position();
    let vol_files = dcr.vol_cat.vol_files;
    if vol_files != 0 && file != vol_files {
        log::warn!(
            "device {}: volume '{}' has {} files on media, catalog says {}",
            dev.name(),
            dcr.vol_name,
            file,
            vol_files
        );
    }
    Ok(())
}

/// Park the job until the operator reacts. True = something changed,
/// try again.
fn wait_for_operator(dcr: &mut DeviceContext, reason: &str) -> Result<bool, Error> {
    let budget = Duration::from_secs(dcr.dev.config.max_vol_wait);
    match wait_for_sysop(dcr, budget, reason)? {
        WaitStatus::VolumeMounted => Ok(true),
        WaitStatus::Timeout => Ok(false),
        WaitStatus::Cancelled => bail!("job {} cancelled while waiting", dcr.job_id),
    }
}
