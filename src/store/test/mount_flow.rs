//! Mount scenarios that do not fit a single module: automatic
//! labeling of blank media and the failure paths when no usable
//! volume shows up.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use anyhow::Error;

use crate::store::backend::OpenMode;
use crate::store::catalog::{CatalogProxy, VolumeCatalogInfo};
use crate::store::label::write_new_volume_label;
use crate::store::mount::mount_next_write_volume;
use crate::store::test::{memory_store, test_dir};
use crate::store::{DeviceConfig, DeviceType};

#[test]
fn blank_media_is_labeled_automatically() -> Result<(), Error> {
    let dir = test_dir(module_path!(), "blank_media_is_labeled_automatically");
    let (mut store, catalog) = memory_store();

    let mut config = DeviceConfig::new("vt0", &dir, DeviceType::VTape, "VTape");
    config.label_media = true;
    let dev = store.add_device(config);
    catalog.add_volume(VolumeCatalogInfo::new("Tape01", "VTape"));

    let mut dcr = store.new_context("vt0", 1, 1, 1700000000)?;
    mount_next_write_volume(&mut dcr)?;

    assert_eq!(dcr.vol_name, "Tape01");
    assert!(dev.is_labeled());
    // mount rewrites the PRE_LABEL for real use
    assert!(!dcr.vol_pre_labeled);
    let label = dev.volume_label().unwrap();
    assert!(label.write_time > 0);

    let info = catalog.get_volume_info("Tape01")?.unwrap();
    assert_eq!(info.vol_status, "Append");
    assert_eq!(info.vol_jobs, 1);
    assert!(info.label_time > 0);

    // the mounted volume is ready for data
    dcr.prepare_record(1, 1, b"first data");
    dcr.write_record()?;
    dcr.write_block_to_device()?;
    dcr.dev.close()?;
    dcr.release_volume();
    Ok(())
}

#[test]
fn blank_media_without_auto_label_fails() -> Result<(), Error> {
    let dir = test_dir(module_path!(), "blank_media_without_auto_label_fails");
    let (mut store, catalog) = memory_store();

    let mut config = DeviceConfig::new("vt0", &dir, DeviceType::VTape, "VTape");
    config.vol_poll_wait = 1;
    config.max_vol_wait = 1;
    store.add_device(config);
    catalog.add_volume(VolumeCatalogInfo::new("Tape01", "VTape"));

    let mut dcr = store.new_context("vt0", 1, 1, 1700000000)?;
    let err = mount_next_write_volume(&mut dcr).unwrap_err();
    assert!(err.to_string().contains("blank media"), "{err}");
    Ok(())
}

#[test]
fn no_appendable_volume_times_out() -> Result<(), Error> {
    let dir = test_dir(module_path!(), "no_appendable_volume_times_out");
    let (mut store, _catalog) = memory_store();

    let mut config = DeviceConfig::new("vt0", &dir, DeviceType::VTape, "VTape");
    config.vol_poll_wait = 1;
    config.max_vol_wait = 1;
    store.add_device(config);

    let mut dcr = store.new_context("vt0", 1, 1, 1700000000)?;
    let start = Instant::now();
    let err = mount_next_write_volume(&mut dcr).unwrap_err();
    assert!(err.to_string().contains("no appendable volume"), "{err}");
    // the operator wait runs inside the acquire block and must come
    // back once its one second budget is spent
    assert!(start.elapsed() < Duration::from_secs(30));
    assert!(!dcr.dev.blocked().is_blocked());
    Ok(())
}

#[test]
fn wrong_volume_retries_are_bounded() -> Result<(), Error> {
    let dir = test_dir(module_path!(), "wrong_volume_retries_are_bounded");
    let (mut store, catalog) = memory_store();

    let config = DeviceConfig::new("vt0", &dir, DeviceType::VTape, "VTape");
    let dev = store.add_device(config);
    catalog.add_volume(VolumeCatalogInfo::new("Tape01", "VTape"));

    // the media behind "Tape01" carries another volume's label, every
    // mount attempt reads it back as the wrong volume
    {
        let mut dcr = store.new_context("vt0", 1, 1, 1700000000)?;
        dev.open("Tape01", OpenMode::CreateReadWrite)?;
        write_new_volume_label(&mut dcr, "Tape02", "Default", "Backup")?;
        dev.close()?;
        dcr.release_volume();
    }

    let mut dcr = store.new_context("vt0", 2, 2, 1700000100)?;
    dcr.vol_name = "Tape01".to_string();
    let err = mount_next_write_volume(&mut dcr).unwrap_err();
    assert!(err.to_string().contains("wrong volume"), "{err}");
    Ok(())
}

#[test]
fn cancelled_job_stops_mounting() -> Result<(), Error> {
    let dir = test_dir(module_path!(), "cancelled_job_stops_mounting");
    let (mut store, catalog) = memory_store();

    let config = DeviceConfig::new("vt0", &dir, DeviceType::VTape, "VTape");
    store.add_device(config);
    catalog.add_volume(VolumeCatalogInfo::new("Tape01", "VTape"));

    let mut dcr = store.new_context("vt0", 1, 1, 1700000000)?;
    dcr.cancel_flag().store(true, Ordering::Relaxed);
    let err = mount_next_write_volume(&mut dcr).unwrap_err();
    assert!(err.to_string().contains("cancelled"), "{err}");
    Ok(())
}
