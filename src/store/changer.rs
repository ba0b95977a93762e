//! Autochanger coordination
//!
//! Media movement goes through an external changer program, invoked
//! as `<command> <changer-device> <operation> <slot> <drive-index>`
//! built from a configurable template with %-substitution. Operations
//! on the same changer are serialized through [`ChangerRegistry`] so
//! two drives never command the robot at once.
//!
//! An empty command template configures a *virtual* changer: slot
//! bookkeeping without any robot, used for virtual tape setups.

use std::collections::HashMap;
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, format_err, Error};
use lazy_static::lazy_static;
use regex::Regex;

use crate::store::device::{Capabilities, Device};
use crate::tools::run_command;

const LOAD_TIMEOUT: Duration = Duration::from_secs(300);
const UNLOAD_TIMEOUT: Duration = Duration::from_secs(300);
const QUERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-changer mutexes, so concurrent drives queue their robot
/// commands instead of interleaving them. Also tracks every drive in
/// the daemon, so a load can find the sibling that holds its slot.
#[derive(Default)]
pub struct ChangerRegistry {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    drives: Mutex<Vec<Arc<Device>>>,
}

impl ChangerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_drive(&self, dev: Arc<Device>) {
        self.drives.lock().unwrap().push(dev);
    }

    fn drives(&self) -> Vec<Arc<Device>> {
        self.drives.lock().unwrap().clone()
    }

    fn changer_lock(&self, changer_name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        Arc::clone(
            locks
                .entry(changer_name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

/// Expand a changer command template.
///
/// `%c` changer control device, `%o` operation, `%s` slot, `%d` drive
/// index, `%v` volume name, `%%` a literal percent sign. Unknown
/// sequences are kept verbatim.
pub fn substitute_changer_command(
    template: &str,
    changer_device: &str,
    operation: &str,
    slot: i32,
    drive_index: u32,
    vol_name: &str,
) -> String {
    let mut out = String::with_capacity(template.len() + 32);
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('c') => out.push_str(changer_device),
            Some('o') => out.push_str(operation),
            Some('s') => out.push_str(&slot.to_string()),
            Some('d') => out.push_str(&drive_index.to_string()),
            Some('v') => out.push_str(vol_name),
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

fn changer_parameters(dev: &Device) -> Result<(String, String, String), Error> {
    let changer_name = dev
        .config
        .changer_name
        .clone()
        .ok_or_else(|| format_err!("device {} has no autochanger", dev.name()))?;
    let changer_device = dev.config.changer_device.clone().unwrap_or_default();
    let command = dev.config.changer_command.clone().unwrap_or_default();
    Ok((changer_name, changer_device, command))
}

fn run_changer_command(
    dev: &Device,
    registry: &ChangerRegistry,
    operation: &str,
    slot: i32,
    vol_name: &str,
    timeout: Duration,
) -> Result<String, Error> {
    let (changer_name, changer_device, template) = changer_parameters(dev)?;
    let expanded = substitute_changer_command(
        &template,
        &changer_device,
        operation,
        slot,
        dev.config.drive_index,
        vol_name,
    );
    let mut parts = expanded.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| format_err!("empty changer command for device {}", dev.name()))?;
    let mut command = Command::new(program);
    command.args(parts);

    let lock = registry.changer_lock(&changer_name);
    let _serialize = lock.lock().unwrap();
    log::debug!(
        "changer {changer_name}: running '{operation}' (slot {slot}, drive {})",
        dev.config.drive_index
    );
    run_command(command, None, timeout)
}

/// True when the device sits in a changer without a robot command.
fn is_virtual_changer(dev: &Device) -> bool {
    matches!(dev.config.changer_command.as_deref(), Some("") | None)
}

/// Which slot is in the drive? Queries the changer once and caches
/// the answer on the device. Returns 0 for an empty drive.
pub fn get_autochanger_loaded_slot(
    dev: &Device,
    registry: &ChangerRegistry,
) -> Result<i32, Error> {
    if let Some(slot) = dev.loaded_slot() {
        return Ok(slot);
    }
    if is_virtual_changer(dev) {
        dev.set_loaded_slot(Some(0));
        return Ok(0);
    }

    let output = run_changer_command(dev, registry, "loaded", -1, "", QUERY_TIMEOUT)?;
    lazy_static! {
        static ref LOADED_RE: Regex = Regex::new(r"^\s*(\d+)").unwrap();
    }
    let slot: i32 = match LOADED_RE.captures(&output) {
        Some(caps) => caps[1]
            .parse()
            .map_err(|_| format_err!("changer 'loaded' output out of range: {output:?}"))?,
        None => bail!(
            "cannot parse changer 'loaded' output for device {}: {:?}",
            dev.name(),
            output
        ),
    };
    dev.set_loaded_slot(Some(slot));
    Ok(slot)
}

/// Make the changer load `slot` into this drive.
///
/// Returns 0 when there is nothing to do (no changer, or the volume
/// is not in the magazine) and 1 when the requested slot is in the
/// drive afterwards.
pub fn autoload_device(
    dev: &Device,
    registry: &ChangerRegistry,
    slot: i32,
    vol_name: &str,
) -> Result<i32, Error> {
    if !dev.capabilities().contains(Capabilities::AUTOCHANGER) {
        return Ok(0);
    }
    if slot <= 0 {
        // volume is not in the magazine, the operator has to help
        return Ok(0);
    }
    // a sibling drive may hold the wanted slot
    unload_other_drive(dev, registry, slot)?;
    if is_virtual_changer(dev) {
        dev.set_loaded_slot(Some(slot));
        return Ok(1);
    }

    let loaded = get_autochanger_loaded_slot(dev, registry)?;
    if loaded == slot {
        log::debug!("device {}: slot {slot} already loaded", dev.name());
        return Ok(1);
    }
    if loaded > 0 {
        unload_autochanger(dev, registry, loaded)?;
    }

    run_changer_command(dev, registry, "load", slot, vol_name, LOAD_TIMEOUT).map_err(|err| {
        dev.set_loaded_slot(Some(0));
        format_err!("device {}: loading slot {} failed: {}", dev.name(), slot, err)
    })?;
    dev.set_loaded_slot(Some(slot));
    log::info!(
        "device {}: loaded volume '{}' from slot {}",
        dev.name(),
        vol_name,
        slot
    );
    Ok(1)
}

/// Return the media in the drive to its slot.
pub fn unload_autochanger(dev: &Device, registry: &ChangerRegistry, slot: i32) -> Result<(), Error> {
    if slot <= 0 {
        return Ok(());
    }
    if is_virtual_changer(dev) {
        dev.set_loaded_slot(Some(0));
        return Ok(());
    }

    if dev.capabilities().contains(Capabilities::OFFLINEUNMOUNT) && dev.is_open() {
        // the robot cannot grab a threaded tape
        let _ = dev.offline();
    }

    run_changer_command(dev, registry, "unload", slot, "", UNLOAD_TIMEOUT).map_err(|err| {
        format_err!("device {}: unloading slot {} failed: {}", dev.name(), slot, err)
    })?;
    dev.set_loaded_slot(Some(0));
    Ok(())
}

/// The wanted slot sits in a sibling drive of the same changer; get
/// it unloaded there so we can load it here. Refuses when the sibling
/// is busy.
pub fn unload_other_drive(
    this: &Device,
    registry: &ChangerRegistry,
    slot: i32,
) -> Result<(), Error> {
    if slot <= 0 || this.config.changer_name.is_none() {
        return Ok(());
    }
    for dev in registry.drives() {
        if dev.name() == this.name() {
            continue;
        }
        if dev.config.changer_name != this.config.changer_name {
            continue;
        }
        if dev.loaded_slot() != Some(slot) {
            continue;
        }
        if dev.is_busy() {
            bail!(
                "slot {} is loaded in busy drive {} ({})",
                slot,
                dev.name(),
                dev.blocked().as_str()
            );
        }
        log::info!(
            "device {}: stealing slot {} from idle drive {}",
            this.name(),
            slot,
            dev.name()
        );
        unload_autochanger(&dev, registry, slot)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::{DeviceConfig, DeviceType};

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

    fn write_script(dir: &str, name: &str, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = format!("{dir}/{name}");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn changer_device(dir: &str, command: &str) -> Device {
        let mut config = DeviceConfig::new("vt0", dir, DeviceType::VTape, "VTape");
        config.changer_name = Some("robot0".to_string());
        config.changer_device = Some("/dev/sg9".to_string());
        config.changer_command = Some(command.to_string());
        config.drive_index = 1;
        Device::new(config)
    }

    #[test]
    fn template_substitution() {
        let cmd = substitute_changer_command(
            "/usr/libexec/changer %c %o %s %d %v 100%%",
            "/dev/sg4",
            "load",
            17,
            2,
            "Vol0001",
        );
        assert_eq!(cmd, "/usr/libexec/changer /dev/sg4 load 17 2 Vol0001 100%");

        // unknown sequences stay put
        assert_eq!(
            substitute_changer_command("a %x b", "", "", 0, 0, ""),
            "a %x b"
        );
    }

    #[test]
    fn virtual_changer_tracks_slots() -> Result<(), Error> {
        let dir = test_dir("virtual_changer_tracks_slots");
        let device = changer_device(&dir, "");
        let registry = ChangerRegistry::new();

        assert_eq!(autoload_device(&device, &registry, 5, "Vol0001")?, 1);
        assert_eq!(device.loaded_slot(), Some(5));

        unload_autochanger(&device, &registry, 5)?;
        assert_eq!(device.loaded_slot(), Some(0));

        // slot 0 = not in the magazine
        assert_eq!(autoload_device(&device, &registry, 0, "Vol0002")?, 0);
        Ok(())
    }

    #[test]
    fn loaded_slot_query_and_cache() -> Result<(), Error> {
        let dir = test_dir("loaded_slot_query_and_cache");
        let script = write_script(&dir, "changer.sh", "echo 3");
        let device = changer_device(&dir, &format!("{script} %c %o %s %d"));
        let registry = ChangerRegistry::new();

        assert_eq!(get_autochanger_loaded_slot(&device, &registry)?, 3);

        // second call answers from the cache, even if the script is gone
        std::fs::remove_file(&script).unwrap();
        assert_eq!(get_autochanger_loaded_slot(&device, &registry)?, 3);
        Ok(())
    }

    #[test]
    fn load_runs_the_changer_program() -> Result<(), Error> {
        let dir = test_dir("load_runs_the_changer_program");
        let script = write_script(
            &dir,
            "changer.sh",
            &format!(r#"echo "$2 $3" >> {dir}/calls; [ "$2" = loaded ] && echo 0; exit 0"#),
        );
        let device = changer_device(&dir, &format!("{script} %c %o %s %d"));
        let registry = ChangerRegistry::new();

        assert_eq!(autoload_device(&device, &registry, 7, "Vol0001")?, 1);
        assert_eq!(device.loaded_slot(), Some(7));

        let calls = std::fs::read_to_string(format!("{dir}/calls")).unwrap();
        assert_eq!(calls, "loaded -1\nload 7\n");
        Ok(())
    }

    #[test]
    fn busy_sibling_is_not_robbed() -> Result<(), Error> {
        let dir = test_dir("busy_sibling_is_not_robbed");
        let this = Arc::new(changer_device(&dir, ""));
        let other = Arc::new({
            let mut config = DeviceConfig::new("vt1", &dir, DeviceType::VTape, "VTape");
            config.changer_name = Some("robot0".to_string());
            config.changer_command = Some(String::new());
            Device::new(config)
        });
        other.set_loaded_slot(Some(4));
        other.add_writer();

        let registry = ChangerRegistry::new();
        registry.register_drive(Arc::clone(&this));
        registry.register_drive(Arc::clone(&other));
        assert!(autoload_device(&this, &registry, 4, "Vol0001").is_err());

        other.remove_writer();
        assert_eq!(autoload_device(&this, &registry, 4, "Vol0001")?, 1);
        assert_eq!(other.loaded_slot(), Some(0));
        assert_eq!(this.loaded_slot(), Some(4));
        Ok(())
    }
}
