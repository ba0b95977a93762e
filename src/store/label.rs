//! Volume label lifecycle
//!
//! Freshly labeled volumes carry a PRE_LABEL marker; the label is
//! rewritten as VOL_LABEL the first time a job appends to the volume.
//! Reading a label classifies the media into a [`VolumeStatus`]; only
//! `Ok` lets a mount proceed, everything else is a distinct reason a
//! caller can react to (relabel, ask the operator, reject).

use anyhow::{bail, format_err, Error};

use mag_tape::{
    read_record_from_block, write_record_to_block, DeviceRecord, LabelError, SessionLabel,
    VolumeLabel, EOS_LABEL, PRE_LABEL, SOS_LABEL, VOLUME_LABEL_ID, VOLUME_LABEL_VERSION, VOL_LABEL,
};

use crate::store::catalog::VolumeCatalogInfo;
use crate::store::dcr::DeviceContext;
use crate::store::device::BlockReadError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Outcome of reading a volume label.
pub enum VolumeStatus {
    /// Valid label, the right volume
    Ok,
    /// Blank or foreign media
    NoLabel,
    /// The device failed while reading
    IoError,
    /// Valid label, but not the volume we want (or reserved elsewhere)
    NameError,
    /// Label from an unsupported format version
    VersionError,
    /// Label record is damaged
    LabelError,
    /// No media in the drive
    NoMedia,
}

impl VolumeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeStatus::Ok => "ok",
            VolumeStatus::NoLabel => "no label",
            VolumeStatus::IoError => "i/o error",
            VolumeStatus::NameError => "wrong volume",
            VolumeStatus::VersionError => "unsupported label version",
            VolumeStatus::LabelError => "damaged label",
            VolumeStatus::NoMedia => "no media",
        }
    }
}

/// Rewind and read the volume label.
///
/// `wanted` is the volume the caller expects (empty = accept any).
/// With `writing` the volume is also reserved for this device; a
/// volume reserved elsewhere reads as [`VolumeStatus::NameError`]
/// just like a wrong name, so mount retries pick another volume.
pub fn read_volume_label(
    dcr: &mut DeviceContext,
    wanted: &str,
    writing: bool,
) -> Result<VolumeStatus, Error> {
    let dev = dcr.dev.clone();
    dev.clear_volume_label();
    dcr.vol_pre_labeled = false;

    if let Err(err) = dev.rewind() {
        log::error!("device {}: cannot rewind for label read: {err}", dev.name());
        return Ok(VolumeStatus::IoError);
    }

    // a separate block: dcr.block may hold unwritten job data while
    // we are switching volumes
    let mut block = dev.new_block();
    match dev.read_block(&mut block) {
        Ok(()) => {}
        Err(BlockReadError::EndOfFile) | Err(BlockReadError::EndOfData) => {
            log::info!("device {}: media is blank", dev.name());
            return Ok(VolumeStatus::NoLabel);
        }
        Err(BlockReadError::Format(err)) => {
            // not our block format at all
            log::info!("device {}: foreign media ({err})", dev.name());
            return Ok(VolumeStatus::NoLabel);
        }
        Err(BlockReadError::Io(err)) => {
            if matches!(
                err.raw_os_error(),
                Some(libc::ENOMEDIUM) | Some(libc::ENXIO)
            ) {
                return Ok(VolumeStatus::NoMedia);
            }
            log::error!("device {}: label read failed: {err}", dev.name());
            return Ok(VolumeStatus::IoError);
        }
    }

    let mut rec = DeviceRecord::new();
    if !read_record_from_block(&mut block, &mut rec) {
        return Ok(VolumeStatus::LabelError);
    }
    if rec.file_index != VOL_LABEL && rec.file_index != PRE_LABEL {
        log::info!(
            "device {}: first record is not a volume label (FileIndex {})",
            dev.name(),
            rec.file_index
        );
        return Ok(VolumeStatus::NoLabel);
    }

    let label = match VolumeLabel::deserialize(&rec.data) {
        Ok(label) => label,
        Err(LabelError::BadId(id)) => {
            log::info!("device {}: unknown label id {:?}", dev.name(), id);
            return Ok(VolumeStatus::NoLabel);
        }
        Err(LabelError::Version(ver)) => {
            log::error!("device {}: unsupported label version {ver}", dev.name());
            return Ok(VolumeStatus::VersionError);
        }
        Err(err) => {
            log::error!("device {}: damaged volume label: {err}", dev.name());
            return Ok(VolumeStatus::LabelError);
        }
    };

    if label.media_type != dev.config.media_type {
        log::warn!(
            "device {}: volume '{}' has media type '{}', device wants '{}'",
            dev.name(),
            label.vol_name,
            label.media_type,
            dev.config.media_type
        );
    }

    if !wanted.is_empty() && label.vol_name != wanted {
        log::info!(
            "device {}: wanted volume '{}', found '{}'",
            dev.name(),
            wanted,
            label.vol_name
        );
        dcr.label_retries += 1;
        return Ok(VolumeStatus::NameError);
    }

    if writing {
        if !dcr.volumes.can_i_write_volume(&label.vol_name, dev.name()) {
            log::info!(
                "device {}: volume '{}' is reserved elsewhere",
                dev.name(),
                label.vol_name
            );
            dcr.label_retries += 1;
            return Ok(VolumeStatus::NameError);
        }
        dcr.volumes.reserve_volume(&label.vol_name, dev.name())?;
        dcr.reserved_volume = true;
    }

    dcr.vol_pre_labeled = rec.file_index == PRE_LABEL;
    dcr.vol_name = label.vol_name.clone();
    if let Some(info) = dcr.catalog.get_volume_info(&label.vol_name)? {
        dcr.vol_cat = info.clone();
        dev.set_vol_cat(info);
    }
    dev.set_volume_label(label);
    log::info!(
        "device {}: found volume '{}'{}",
        dev.name(),
        dcr.vol_name,
        if dcr.vol_pre_labeled {
            " (pre-labeled)"
        } else {
            ""
        }
    );
    Ok(VolumeStatus::Ok)
}

fn write_label_record(
    dcr: &mut DeviceContext,
    label: &VolumeLabel,
    file_index: i32,
) -> Result<(), Error> {
    let data = label.serialize()?;
    // a separate block, and straight to the device: dcr.block may
    // hold unwritten job data, and a label failure must not trigger
    // a mount of yet another volume
    let mut block = dcr.dev.new_block();
    block.vol_session_id = dcr.vol_session_id;
    block.vol_session_time = dcr.vol_session_time;
    let mut rec = DeviceRecord::new();
    rec.prepare(file_index, 0, &data);
    if !write_record_to_block(&mut block, &mut rec) {
        bail!("volume label does not fit into one block");
    }
    dcr.dev
        .write_block(&mut block)
        .map_err(|err| format_err!("device {}: label write failed: {}", dcr.dev.name(), err))?;
    Ok(())
}

/// Label blank (or sacrificial) media.
///
/// Discards all content, writes a PRE_LABEL record and one filemark,
/// and reserves the volume for this device. The PRE_LABEL becomes a
/// VOL_LABEL via [`rewrite_volume_label`] on first real use.
pub fn write_new_volume_label(
    dcr: &mut DeviceContext,
    vol_name: &str,
    pool_name: &str,
    pool_type: &str,
) -> Result<(), Error> {
    let dev = dcr.dev.clone();

    dcr.volumes.reserve_volume(vol_name, dev.name())?;
    dcr.reserved_volume = true;

    dev.truncate()?;

    let label = VolumeLabel::create(vol_name, pool_name, pool_type, &dev.config.media_type);
    let mut vol_cat = VolumeCatalogInfo::new(vol_name, &dev.config.media_type);
    vol_cat.label_time = label.label_time;
    vol_cat.max_vol_bytes = dev.config.max_volume_size;
    dev.set_vol_cat(vol_cat);

    write_label_record(dcr, &label, PRE_LABEL)?;
    dev.weof(1)?;

    // the device counted the label block and the filemark
    let vol_cat = dev.vol_cat();
    dcr.vol_cat = vol_cat.clone();
    dev.set_volume_label(label);
    dcr.vol_name = vol_name.to_string();
    dcr.vol_pre_labeled = true;

    if dcr.catalog.get_volume_info(vol_name)?.is_some() {
        dcr.catalog.update_volume_info(&vol_cat)?;
    }
    log::info!("device {}: labeled volume '{}'", dev.name(), vol_name);
    Ok(())
}

/// Rewrite the label of a pre-labeled or recycled volume for append.
///
/// Overwrites from the beginning with a VOL_LABEL record carrying the
/// current write time and leaves the device positioned right after
/// it, so job data follows in the same file.
pub fn rewrite_volume_label(dcr: &mut DeviceContext, recycle: bool) -> Result<(), Error> {
    let dev = dcr.dev.clone();
    let mut label = dev
        .volume_label()
        .ok_or_else(|| format_err!("device {}: no label to rewrite", dev.name()))?;

    dev.truncate()?;

    let mut vol_cat = dev.vol_cat();
    vol_cat.vol_blocks = 0;
    vol_cat.vol_bytes = 0;
    vol_cat.vol_files = 0;
    vol_cat.vol_status = "Append".to_string();
    if recycle {
        vol_cat.vol_jobs = 0;
        vol_cat.vol_errors = 0;
        vol_cat.recycle = false;
    }
    dev.set_vol_cat(vol_cat);

    label.write_time = proxmox_time::epoch_i64();
    write_label_record(dcr, &label, VOL_LABEL)?;
    dev.set_volume_label(label);
    dcr.vol_pre_labeled = false;

    let vol_cat = dev.vol_cat();
    dcr.vol_cat = vol_cat.clone();
    if dcr.catalog.get_volume_info(&dcr.vol_name)?.is_some() {
        dcr.catalog.update_volume_info(&vol_cat)?;
    }
    Ok(())
}

/// Build a session label for the current job.
pub fn create_session_label(
    dcr: &DeviceContext,
    job_name: &str,
    client_name: &str,
    fileset_name: &str,
    job_type: char,
    job_level: char,
) -> SessionLabel {
    SessionLabel {
        id: VOLUME_LABEL_ID.to_string(),
        ver: VOLUME_LABEL_VERSION,
        job_id: dcr.job_id,
        vol_session_id: dcr.vol_session_id,
        vol_session_time: dcr.vol_session_time,
        job_name: job_name.to_string(),
        client_name: client_name.to_string(),
        fileset_name: fileset_name.to_string(),
        job_type: job_type as u32,
        job_level: job_level as u32,
        start_time: proxmox_time::epoch_i64(),
        totals: None,
    }
}

/// Append a session label (SOS or EOS variant) to the job stream.
pub fn write_session_label(
    dcr: &mut DeviceContext,
    session: &SessionLabel,
    file_index: i32,
) -> Result<(), Error> {
    let end = match file_index {
        SOS_LABEL => false,
        EOS_LABEL => true,
        other => bail!("FileIndex {} is not a session label marker", other),
    };
    let data = session.serialize(end)?;
    // the job id as stream: session labels regularly span blocks, and
    // stream 0 records cannot be continued
    dcr.prepare_record(file_index, dcr.job_id as i32, &data);
    dcr.write_record()
}
