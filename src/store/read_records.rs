//! Sequential record reader
//!
//! Drives the block/record codec across filemarks and volume
//! boundaries and hands every complete logical record to a callback.
//! Label and session marker records are delivered like data records;
//! the callback decides what to do with them. Damaged blocks are
//! skipped with a warning so one bad spot does not end a restore.

use anyhow::Error;

use mag_tape::{file_index_name, read_record_from_block, DeviceRecord, EOT_LABEL};

use crate::store::dcr::DeviceContext;
use crate::store::device::BlockReadError;

/// Read all records reachable from the current position.
///
/// `record_cb` gets every complete record; returning `false` stops
/// the scan. `mount_cb` runs at the end of each volume and must mount
/// and position the follow-up volume, returning `false` when there is
/// none. Both callbacks may use the context freely, the staging block
/// is reloaded afterwards.
pub fn read_records<R, M>(
    dcr: &mut DeviceContext,
    mut record_cb: R,
    mut mount_cb: M,
) -> Result<(), Error>
where
    R: FnMut(&mut DeviceContext, &DeviceRecord) -> Result<bool, Error>,
    M: FnMut(&mut DeviceContext) -> Result<bool, Error>,
{
    let mut rec = DeviceRecord::new();

    loop {
        if dcr.is_cancelled() {
            break;
        }
        match dcr.read_block_from_device() {
            Ok(()) => {}
            Err(BlockReadError::EndOfFile) => {
                // filemark, records continue in the next file
                continue;
            }
            Err(BlockReadError::EndOfData) => {
                if !mount_cb(dcr)? {
                    break;
                }
                continue;
            }
            Err(BlockReadError::Format(err)) => {
                log::warn!(
                    "device {}: skipping damaged block: {}",
                    dcr.dev.name(),
                    err
                );
                continue;
            }
            Err(BlockReadError::Io(err)) => return Err(err.into()),
        }

        log::debug!(
            "device {}: block {} ({} bytes)",
            dcr.dev.name(),
            dcr.block.block_num,
            dcr.block.binbuf()
        );

        while read_record_from_block(&mut dcr.block, &mut rec) {
            if let Some(name) = file_index_name(rec.file_index) {
                log::debug!("device {}: {} record", dcr.dev.name(), name);
            }
            if rec.file_index == EOT_LABEL {
                // deliberate end marker, nothing follows
                return Ok(());
            }
            if !record_cb(dcr, &rec)? {
                return Ok(());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    use crate::store::backend::OpenMode;
    use crate::store::catalog::{LogMessenger, MemoryCatalog};
    use crate::store::changer::ChangerRegistry;
    use crate::store::device::Device;
    use crate::store::label::write_new_volume_label;
    use crate::store::reserve::VolumeReservations;
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

    fn make_context(dir: &str, block_size: usize) -> DeviceContext {
        let mut config = DeviceConfig::new("vt0", dir, DeviceType::VTape, "VTape");
        config.max_block_size = block_size;
        let dev = Arc::new(Device::new(config));
        DeviceContext::new(
            dev,
            Arc::new(MemoryCatalog::new()),
            Arc::new(LogMessenger),
            Arc::new(VolumeReservations::new()),
            Arc::new(ChangerRegistry::new()),
            7,
            3,
            1700000000,
        )
    }

    #[test]
    fn records_across_filemarks() -> Result<(), Error> {
        let dir = test_dir("records_across_filemarks");
        let mut dcr = make_context(&dir, 1024);
        dcr.dev.open("Tape01", OpenMode::CreateReadWrite)?;

        for i in 1..=4 {
            dcr.prepare_record(i, 1, format!("payload {i}").as_bytes());
            dcr.write_record()?;
            dcr.write_block_to_device()?;
            if i == 2 {
                dcr.dev.weof(1)?;
            }
        }
        dcr.dev.weof(1)?;
        dcr.dev.rewind()?;

        let mut seen = Vec::new();
        read_records(
            &mut dcr,
            |_dcr, rec| {
                seen.push((rec.file_index, rec.data.clone()));
                Ok(true)
            },
            |_dcr| Ok(false),
        )?;
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[2].0, 3);
        assert_eq!(seen[3].1, b"payload 4");
        Ok(())
    }

    #[test]
    fn large_record_reassembled() -> Result<(), Error> {
        let dir = test_dir("large_record_reassembled");
        // small blocks force the record across many of them
        let mut dcr = make_context(&dir, 128);
        dcr.dev.open("Tape01", OpenMode::CreateReadWrite)?;

        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        dcr.prepare_record(1, 2, &payload);
        dcr.write_record()?;
        dcr.write_block_to_device()?;
        dcr.dev.weof(1)?;
        dcr.dev.rewind()?;

        let mut got = Vec::new();
        read_records(
            &mut dcr,
            |_dcr, rec| {
                got.push(rec.data.clone());
                Ok(true)
            },
            |_dcr| Ok(false),
        )?;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0], payload);
        Ok(())
    }

    #[test]
    fn continues_on_the_next_volume() -> Result<(), Error> {
        let dir = test_dir("continues_on_the_next_volume");
        let mut dcr = make_context(&dir, 1024);

        // two labeled volumes with one data record each
        for (vol, index) in [("Tape01", 10), ("Tape02", 20)] {
            dcr.dev.open(vol, OpenMode::CreateReadWrite)?;
            write_new_volume_label(&mut dcr, vol, "Default", "Backup")?;
            dcr.volumes.free_volume(vol);
            dcr.reserved_volume = false;
            dcr.prepare_record(index, 1, vol.as_bytes());
            dcr.write_record()?;
            dcr.write_block_to_device()?;
            dcr.dev.weof(1)?;
            dcr.dev.close()?;
        }

        dcr.dev.open("Tape01", OpenMode::Read)?;
        dcr.dev.rewind()?;

        let mut data_indexes = Vec::new();
        let mut mounted_second = false;
        read_records(
            &mut dcr,
            |_dcr, rec| {
                if rec.file_index > 0 {
                    data_indexes.push(rec.file_index);
                }
                Ok(true)
            },
            |dcr| {
                if mounted_second {
                    return Ok(false);
                }
                mounted_second = true;
                dcr.dev.close()?;
                dcr.dev.open("Tape02", OpenMode::Read)?;
                dcr.dev.rewind()?;
                Ok(true)
            },
        )?;
        assert_eq!(data_indexes, vec![10, 20]);
        Ok(())
    }

    #[test]
    fn stop_on_callback_request() -> Result<(), Error> {
        let dir = test_dir("stop_on_callback_request");
        let mut dcr = make_context(&dir, 1024);
        dcr.dev.open("Tape01", OpenMode::CreateReadWrite)?;

        for i in 1..=3 {
            dcr.prepare_record(i, 1, b"x");
            dcr.write_record()?;
        }
        dcr.write_block_to_device()?;
        dcr.dev.weof(1)?;
        dcr.dev.rewind()?;

        let mut count = 0;
        read_records(
            &mut dcr,
            |_dcr, _rec| {
                count += 1;
                Ok(count < 2)
            },
            |_dcr| Ok(false),
        )?;
        assert_eq!(count, 2);
        Ok(())
    }

    #[test]
    fn marker_records_are_delivered() -> Result<(), Error> {
        let dir = test_dir("marker_records_are_delivered");
        let mut dcr = make_context(&dir, 1024);
        dcr.dev.open("Tape01", OpenMode::CreateReadWrite)?;
        write_new_volume_label(&mut dcr, "Tape01", "Default", "Backup")?;
        dcr.dev.rewind()?;

        let mut markers = Vec::new();
        read_records(
            &mut dcr,
            |_dcr, rec| {
                markers.push(rec.file_index);
                Ok(true)
            },
            |_dcr| Ok(false),
        )?;
        // PRE_LABEL is the only record on freshly labeled media
        assert_eq!(markers, vec![mag_tape::PRE_LABEL]);
        Ok(())
    }
}
