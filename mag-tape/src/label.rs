//! Volume and session label records
//!
//! The volume label is the first record on every volume and uniquely
//! identifies it. Session labels bracket one job's records (SOS/EOS)
//! and carry enough metadata that a volume can be scanned and job
//! boundaries reconstructed without any catalog.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{DeserBuf, FormatError, SerBuf};

/// Label id written by current versions.
pub const VOLUME_LABEL_ID: &str = "Magnetar 1.0 immortal\n";
/// Deprecated label id, still accepted when reading.
pub const OLD_VOLUME_LABEL_ID: &str = "Magnetar 0.9 mortal\n";

/// Label version written by current versions.
pub const VOLUME_LABEL_VERSION: u32 = 11;

/// Serialized length budget for a volume label record.
pub const SER_LENGTH_VOLUME_LABEL: usize = 1024;
/// Serialized length budget for a session label record.
pub const SER_LENGTH_SESSION_LABEL: usize = 1024;

lazy_static::lazy_static! {
    // Accepted label versions mapped to the release line that wrote them.
    static ref ACCEPTED_LABEL_VERSIONS: HashMap<u32, &'static str> = {
        let mut map = HashMap::new();
        map.insert(10, "Magnetar 0.9");
        map.insert(11, "Magnetar 1.0");
        map
    };
}

/// The release line that wrote a given label version, if accepted.
pub fn label_version_name(ver: u32) -> Option<&'static str> {
    ACCEPTED_LABEL_VERSIONS.get(&ver).copied()
}

#[derive(thiserror::Error, Debug)]
pub enum LabelError {
    #[error("unsupported label version {0}")]
    Version(u32),
    #[error("unknown label id {0:?}")]
    BadId(String),
    #[error(transparent)]
    Format(#[from] FormatError),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
/// Volume label
///
/// Written once when a volume is freshly labeled, read back on every
/// mount to identify the media.
pub struct VolumeLabel {
    /// Label id string (see `VOLUME_LABEL_ID`)
    pub id: String,
    /// Label format version
    pub ver: u32,
    /// Time the label was written
    pub label_time: i64,
    /// Time of the first job write (0 until then)
    pub write_time: i64,
    /// Volume name
    pub vol_name: String,
    /// Previous volume name for a continued multi-volume sequence
    pub prev_vol_name: String,
    /// Pool the volume belongs to
    pub pool_name: String,
    /// Pool type (e.g. "Backup")
    pub pool_type: String,
    /// Media type the device was configured with
    pub media_type: String,
    /// Host that labeled the volume
    pub host_name: String,
    /// Program version string
    pub prog_version: String,
    /// Program build date
    pub prog_date: String,
}

impl VolumeLabel {
    /// Create a fresh label with current id/version and timestamps.
    pub fn create(vol_name: &str, pool_name: &str, pool_type: &str, media_type: &str) -> Self {
        Self {
            id: VOLUME_LABEL_ID.to_string(),
            ver: VOLUME_LABEL_VERSION,
            label_time: proxmox_time::epoch_i64(),
            write_time: 0,
            vol_name: vol_name.to_string(),
            prev_vol_name: String::new(),
            pool_name: pool_name.to_string(),
            pool_type: pool_type.to_string(),
            media_type: media_type.to_string(),
            host_name: nix_hostname(),
            prog_version: concat!("magnetar ", env!("CARGO_PKG_VERSION")).to_string(),
            prog_date: String::new(),
        }
    }

    /// Serialize in strict field order, bounded by
    /// `SER_LENGTH_VOLUME_LABEL`.
    pub fn serialize(&self) -> Result<Vec<u8>, LabelError> {
        let mut ser = SerBuf::new(SER_LENGTH_VOLUME_LABEL);
        ser.put_string(&self.id)?;
        ser.put_u32(self.ver)?;
        ser.put_i64(self.label_time)?;
        ser.put_i64(self.write_time)?;
        ser.put_string(&self.vol_name)?;
        ser.put_string(&self.prev_vol_name)?;
        ser.put_string(&self.pool_name)?;
        ser.put_string(&self.pool_type)?;
        ser.put_string(&self.media_type)?;
        ser.put_string(&self.host_name)?;
        ser.put_string(&self.prog_version)?;
        ser.put_string(&self.prog_date)?;
        Ok(ser.finish())
    }

    /// Inverse of [`serialize`](Self::serialize); rejects unknown ids
    /// and unaccepted versions.
    pub fn deserialize(data: &[u8]) -> Result<Self, LabelError> {
        let mut de = DeserBuf::new(data);
        let id = de.get_string()?;
        if id != VOLUME_LABEL_ID && id != OLD_VOLUME_LABEL_ID {
            return Err(LabelError::BadId(id));
        }
        let ver = de.get_u32()?;
        if label_version_name(ver).is_none() {
            return Err(LabelError::Version(ver));
        }
        Ok(Self {
            id,
            ver,
            label_time: de.get_i64()?,
            write_time: de.get_i64()?,
            vol_name: de.get_string()?,
            prev_vol_name: de.get_string()?,
            pool_name: de.get_string()?,
            pool_type: de.get_string()?,
            media_type: de.get_string()?,
            host_name: de.get_string()?,
            prog_version: de.get_string()?,
            prog_date: de.get_string()?,
        })
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
/// Job completion counters, present only in the EOS variant.
pub struct SessionTotals {
    pub job_files: u32,
    pub job_bytes: u64,
    pub start_block: u32,
    pub end_block: u32,
    pub start_file: u32,
    pub end_file: u32,
    pub job_errors: u32,
    /// Termination status character code
    pub job_status: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
/// Session label
///
/// The start variant (SOS) is written before the first job record on
/// a volume, the end variant (EOS) after the last one. The end
/// variant appends the [`SessionTotals`]; the reader must branch on
/// the record's FileIndex marker to know which variant to expect.
pub struct SessionLabel {
    pub id: String,
    pub ver: u32,
    pub job_id: u32,
    pub vol_session_id: u32,
    pub vol_session_time: u32,
    /// Unique job name
    pub job_name: String,
    pub client_name: String,
    pub fileset_name: String,
    /// Job type character code
    pub job_type: u32,
    /// Job level character code
    pub job_level: u32,
    pub start_time: i64,
    /// Completion counters (EOS only)
    pub totals: Option<SessionTotals>,
}

impl SessionLabel {
    /// Serialize; `end` selects the EOS variant with totals appended.
    pub fn serialize(&self, end: bool) -> Result<Vec<u8>, LabelError> {
        let mut ser = SerBuf::new(SER_LENGTH_SESSION_LABEL);
        ser.put_string(&self.id)?;
        ser.put_u32(self.ver)?;
        ser.put_u32(self.job_id)?;
        ser.put_u32(self.vol_session_id)?;
        ser.put_u32(self.vol_session_time)?;
        ser.put_string(&self.job_name)?;
        ser.put_string(&self.client_name)?;
        ser.put_string(&self.fileset_name)?;
        ser.put_u32(self.job_type)?;
        ser.put_u32(self.job_level)?;
        ser.put_i64(self.start_time)?;
        if end {
            let totals = self.totals.unwrap_or_default();
            ser.put_u32(totals.job_files)?;
            ser.put_u64(totals.job_bytes)?;
            ser.put_u32(totals.start_block)?;
            ser.put_u32(totals.end_block)?;
            ser.put_u32(totals.start_file)?;
            ser.put_u32(totals.end_file)?;
            ser.put_u32(totals.job_errors)?;
            ser.put_u32(totals.job_status)?;
        }
        Ok(ser.finish())
    }

    /// Inverse of [`serialize`](Self::serialize); the caller passes
    /// `end` according to the record marker (SOS_LABEL vs EOS_LABEL).
    pub fn deserialize(data: &[u8], end: bool) -> Result<Self, LabelError> {
        let mut de = DeserBuf::new(data);
        let id = de.get_string()?;
        let ver = de.get_u32()?;
        if label_version_name(ver).is_none() {
            return Err(LabelError::Version(ver));
        }
        let mut label = Self {
            id,
            ver,
            job_id: de.get_u32()?,
            vol_session_id: de.get_u32()?,
            vol_session_time: de.get_u32()?,
            job_name: de.get_string()?,
            client_name: de.get_string()?,
            fileset_name: de.get_string()?,
            job_type: de.get_u32()?,
            job_level: de.get_u32()?,
            start_time: de.get_i64()?,
            totals: None,
        };
        if end {
            label.totals = Some(SessionTotals {
                job_files: de.get_u32()?,
                job_bytes: de.get_u64()?,
                start_block: de.get_u32()?,
                end_block: de.get_u32()?,
                start_file: de.get_u32()?,
                end_file: de.get_u32()?,
                job_errors: de.get_u32()?,
                job_status: de.get_u32()?,
            });
        }
        Ok(label)
    }
}

fn nix_hostname() -> String {
    // gethostname via std is not stable, keep it simple
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}
