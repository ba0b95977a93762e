//! Device and changer resource configuration
//!
//! These objects are supplied once at daemon startup and are
//! read-only afterwards. Capability quirks that depend on concrete
//! hardware (`bsf_at_eom`, `two_eof`, `fast_fsf`, ...) are plain
//! config switches; nothing is guessed per OS or driver.

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Real tape drive (st driver)
    Tape,
    /// Disk file volumes
    File,
    /// Stream device, no positioning
    Fifo,
    /// File-backed tape emulation
    VTape,
}

impl DeviceType {
    /// Tape semantics: filemarks, two-EOF end of data.
    pub fn is_tape(&self) -> bool {
        matches!(self, DeviceType::Tape | DeviceType::VTape)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
/// One configured storage device.
pub struct DeviceConfig {
    /// Device name, unique within the daemon
    pub name: String,
    /// Backing path (tape device node, volume directory, fifo path)
    pub archive_path: String,
    #[serde(rename = "type")]
    pub dev_type: DeviceType,
    /// Media type string matched against volume labels
    pub media_type: String,

    #[serde(default = "default_block_size")]
    pub max_block_size: usize,
    #[serde(default)]
    pub min_block_size: usize,
    /// Synthetic volume capacity, 0 = unlimited
    #[serde(default)]
    pub max_volume_size: u64,

    /// Verify block checksums on read (warn only when false)
    #[serde(default = "default_true")]
    pub block_checksum: bool,
    /// Automatically label blank media
    #[serde(default)]
    pub label_media: bool,
    /// Device stays open between jobs
    #[serde(default)]
    pub always_open: bool,
    /// Removable media, unmount on close
    #[serde(default)]
    pub removable_media: bool,

    // hardware quirk switches, see the capability flags
    #[serde(default = "default_true")]
    pub fast_fsf: bool,
    #[serde(default = "default_true")]
    pub hardware_end_of_medium: bool,
    #[serde(default)]
    pub bsf_at_eom: bool,
    #[serde(default)]
    pub two_eof: bool,

    /// Name of the autochanger this drive belongs to
    #[serde(default)]
    pub changer_name: Option<String>,
    /// Changer control device (substituted for %c)
    #[serde(default)]
    pub changer_device: Option<String>,
    /// Changer command template; empty string = virtual changer
    #[serde(default)]
    pub changer_command: Option<String>,
    /// Drive index within the autochanger
    #[serde(default)]
    pub drive_index: u32,

    /// Budget for rewind retries on a busy drive (seconds)
    #[serde(default = "default_max_rewind_wait")]
    pub max_rewind_wait: u64,
    /// Budget for open retries on a busy drive (seconds)
    #[serde(default = "default_max_open_wait")]
    pub max_open_wait: u64,
    /// Initial operator-wait interval (seconds), doubled per cycle
    #[serde(default = "default_vol_poll_wait")]
    pub vol_poll_wait: u64,
    /// Ceiling for the doubled operator-wait interval (seconds)
    #[serde(default = "default_max_vol_wait")]
    pub max_vol_wait: u64,
}

fn default_block_size() -> usize {
    mag_tape::DEFAULT_BLOCK_SIZE
}

fn default_true() -> bool {
    true
}

fn default_max_rewind_wait() -> u64 {
    300
}

fn default_max_open_wait() -> u64 {
    300
}

fn default_vol_poll_wait() -> u64 {
    60
}

fn default_max_vol_wait() -> u64 {
    600
}

impl DeviceConfig {
    /// Minimal config for a device of the given type.
    pub fn new(name: &str, archive_path: &str, dev_type: DeviceType, media_type: &str) -> Self {
        Self {
            name: name.to_string(),
            archive_path: archive_path.to_string(),
            dev_type,
            media_type: media_type.to_string(),
            max_block_size: default_block_size(),
            min_block_size: 0,
            max_volume_size: 0,
            block_checksum: true,
            label_media: false,
            always_open: false,
            removable_media: false,
            fast_fsf: true,
            hardware_end_of_medium: true,
            bsf_at_eom: false,
            two_eof: false,
            changer_name: None,
            changer_device: None,
            changer_command: None,
            drive_index: 0,
            max_rewind_wait: default_max_rewind_wait(),
            max_open_wait: default_max_open_wait(),
            vol_poll_wait: default_vol_poll_wait(),
            max_vol_wait: default_max_vol_wait(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_minimal_device() {
        let config: DeviceConfig = serde_json::from_str(
            r#"{
                "name": "vdrive0",
                "archive_path": "/var/lib/magnetar/vtape0",
                "type": "vtape",
                "media_type": "VTape"
            }"#,
        )
        .unwrap();
        assert_eq!(config.dev_type, DeviceType::VTape);
        assert_eq!(config.max_block_size, mag_tape::DEFAULT_BLOCK_SIZE);
        assert!(config.block_checksum);
        assert!(config.changer_name.is_none());
    }
}
