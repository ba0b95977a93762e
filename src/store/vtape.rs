//! File-backed tape emulation
//!
//! Faithful enough for testing the tape code paths without hardware:
//! filemarks, zero-length reads at EOF, a second zero-length read at
//! end of data, ENOSPC when the configured capacity is reached, and
//! "writing truncates everything behind the head".
//!
//! On-disk layout inside the archive directory:
//! - `drive-status.json` - currently loaded tape
//! - `tape-<name>.json`  - per tape index (number of completed files)
//! - `tapefile-<n>-<name>.dat` - one tape file, blocks length-prefixed

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use proxmox_sys::fs::{file_get_json, open_file_locked, replace_file, CreateOptions};

use crate::store::backend::{DeviceBackend, OpenMode};
use crate::store::DeviceConfig;

#[derive(Serialize, Deserialize)]
struct VTapeDriveStatus {
    current_tape: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct TapeIndex {
    files: usize,
}

fn other_err(err: anyhow::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err.to_string())
}

pub struct VTapeBackend {
    path: PathBuf,
    tape_name: String,
    max_size: u64,
    mode: OpenMode,
    _lock: File,

    /// completed (filemark terminated) tape files
    files: usize,
    pos_file: usize,
    pos_block: usize,

    reader: Option<File>,
    /// start offset of each block read so far in the open tape file
    block_offsets: Vec<u64>,
    writer: Option<File>,
}

impl VTapeBackend {
    pub fn open(config: &DeviceConfig, vol_name: &str, mode: OpenMode) -> io::Result<Self> {
        let path = PathBuf::from(&config.archive_path);
        std::fs::create_dir_all(&path)?;

        let mut lock_path = path.clone();
        lock_path.push(".drive.lck");
        let lock = open_file_locked(
            &lock_path,
            Duration::new(10, 0),
            true,
            CreateOptions::new(),
        )
        .map_err(other_err)?;

        let mut backend = Self {
            path,
            tape_name: String::new(),
            max_size: config.max_volume_size,
            mode,
            _lock: lock,
            files: 0,
            pos_file: 0,
            pos_block: 0,
            reader: None,
            block_offsets: Vec::new(),
            writer: None,
        };

        let tape_name = if vol_name.is_empty() {
            match backend.load_status()?.current_tape {
                Some(name) => name,
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        "drive is empty (no tape loaded)",
                    ))
                }
            }
        } else {
            backend.store_status(&VTapeDriveStatus {
                current_tape: Some(vol_name.to_string()),
            })?;
            vol_name.to_string()
        };

        backend.tape_name = tape_name;
        backend.files = backend.load_index()?.files;
        Ok(backend)
    }

    fn status_file_path(&self) -> PathBuf {
        let mut path = self.path.clone();
        path.push("drive-status.json");
        path
    }

    fn tape_index_path(&self) -> PathBuf {
        let mut path = self.path.clone();
        path.push(format!("tape-{}.json", self.tape_name));
        path
    }

    fn tape_file_path(&self, pos: usize) -> PathBuf {
        let mut path = self.path.clone();
        path.push(format!("tapefile-{}-{}.dat", pos, self.tape_name));
        path
    }

    fn load_status(&self) -> io::Result<VTapeDriveStatus> {
        let default = serde_json::to_value(VTapeDriveStatus { current_tape: None })?;
        let data = file_get_json(self.status_file_path(), Some(default)).map_err(other_err)?;
        Ok(serde_json::from_value(data)?)
    }

    fn store_status(&self, status: &VTapeDriveStatus) -> io::Result<()> {
        let raw = serde_json::to_string_pretty(&serde_json::to_value(status)?)?;
        replace_file(
            self.status_file_path(),
            raw.as_bytes(),
            CreateOptions::new(),
            false,
        )
        .map_err(other_err)?;
        Ok(())
    }

    fn load_index(&self) -> io::Result<TapeIndex> {
        if !self.tape_index_path().exists() {
            return Ok(TapeIndex { files: 0 });
        }
        let default = serde_json::to_value(TapeIndex { files: 0 })?;
        let data = file_get_json(self.tape_index_path(), Some(default)).map_err(other_err)?;
        Ok(serde_json::from_value(data)?)
    }

    fn store_index(&self) -> io::Result<()> {
        let index = TapeIndex { files: self.files };
        let raw = serde_json::to_string_pretty(&serde_json::to_value(index)?)?;
        replace_file(
            self.tape_index_path(),
            raw.as_bytes(),
            CreateOptions::new(),
            false,
        )
        .map_err(other_err)?;
        Ok(())
    }

    /// Remove tape files from `pos` on, adjusting the index.
    fn truncate_tape(&mut self, pos: usize) -> io::Result<()> {
        for i in pos..self.files {
            let _ = std::fs::remove_file(self.tape_file_path(i));
        }
        if self.files > pos {
            self.files = pos;
            self.store_index()?;
        }
        Ok(())
    }

    fn used_space(&self) -> io::Result<u64> {
        let mut used = 0;
        for i in 0..=self.files {
            if let Ok(meta) = std::fs::metadata(self.tape_file_path(i)) {
                used += meta.len();
            }
        }
        Ok(used)
    }

    fn drop_handles(&mut self) {
        self.reader = None;
        self.writer = None;
        self.block_offsets.clear();
        self.pos_block = 0;
    }

    fn check_writable(&self) -> io::Result<()> {
        if !self.mode.writable() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "tape opened read-only",
            ));
        }
        Ok(())
    }
}

impl DeviceBackend for VTapeBackend {
    fn read_block(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.writer.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "cannot read while writing a tape file",
            ));
        }

        if self.reader.is_none() {
            if self.pos_file >= self.files {
                // positioned past the last filemark: end of data,
                // every further read keeps returning 0
                return Ok(0);
            }
            let file = File::open(self.tape_file_path(self.pos_file))?;
            self.reader = Some(file);
            self.block_offsets.clear();
            self.pos_block = 0;
        }

        let reader = self.reader.as_mut().unwrap();
        let offset = reader.stream_position()?;

        let mut prefix = [0u8; 4];
        match reader.read_exact(&mut prefix) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                // filemark
                self.reader = None;
                self.block_offsets.clear();
                self.pos_file += 1;
                self.pos_block = 0;
                return Ok(0);
            }
            Err(err) => return Err(err),
        }

        let len = u32::from_be_bytes(prefix) as usize;
        if len > buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("tape block ({} bytes) larger than read buffer", len),
            ));
        }
        reader.read_exact(&mut buf[..len])?;
        self.block_offsets.push(offset);
        self.pos_block += 1;
        Ok(len)
    }

    fn write_block(&mut self, data: &[u8]) -> io::Result<usize> {
        self.check_writable()?;

        if self.max_size > 0 && self.used_space()? + data.len() as u64 + 4 > self.max_size {
            return Err(io::Error::from_raw_os_error(libc::ENOSPC));
        }

        if self.writer.is_none() {
            // writing discards everything behind the head
            self.reader = None;
            self.block_offsets.clear();
            self.truncate_tape(self.pos_file)?;
            let file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(self.tape_file_path(self.pos_file))?;
            self.writer = Some(file);
            self.pos_block = 0;
        }

        let writer = self.writer.as_mut().unwrap();
        writer.write_all(&(data.len() as u32).to_be_bytes())?;
        writer.write_all(data)?;
        self.pos_block += 1;
        Ok(data.len())
    }

    fn weof(&mut self, count: u32) -> io::Result<()> {
        self.check_writable()?;

        if self.writer.is_none() {
            // filemark after repositioning: truncate and leave an
            // empty tape file
            self.truncate_tape(self.pos_file)?;
            File::create(self.tape_file_path(self.pos_file))?;
        } else {
            self.writer.take().unwrap().sync_all()?;
        }
        self.files = self.pos_file + 1;
        self.pos_file += 1;
        self.pos_block = 0;

        for _ in 1..count {
            File::create(self.tape_file_path(self.pos_file))?;
            self.files += 1;
            self.pos_file += 1;
        }
        self.store_index()
    }

    fn rewind(&mut self) -> io::Result<()> {
        self.drop_handles();
        self.pos_file = 0;
        Ok(())
    }

    fn fsf(&mut self, count: u32) -> io::Result<()> {
        self.drop_handles();
        let target = self.pos_file + count as usize;
        if target > self.files {
            self.pos_file = self.files;
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "fsf: moved beyond end of data",
            ));
        }
        self.pos_file = target;
        Ok(())
    }

    fn bsf(&mut self, count: u32) -> io::Result<()> {
        // Note: positions at the start of the target file, not on the
        // filemark like a real drive
        self.drop_handles();
        let count = count as usize;
        if count > self.pos_file {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "bsf: moved before beginning of tape",
            ));
        }
        self.pos_file -= count;
        Ok(())
    }

    fn fsr(&mut self, count: u32) -> io::Result<()> {
        let mut scratch = proxmox_io::vec::undefined(mag_tape::MAX_BLOCK_SIZE);
        for _ in 0..count {
            if self.read_block(&mut scratch)? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "fsr: hit filemark",
                ));
            }
        }
        Ok(())
    }

    fn bsr(&mut self, count: u32) -> io::Result<()> {
        let count = count as usize;
        if self.reader.is_none() || count > self.pos_block {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "bsr: no blocks to space over",
            ));
        }
        self.pos_block -= count;
        let offset = self.block_offsets[self.pos_block];
        self.block_offsets.truncate(self.pos_block);
        self.reader
            .as_mut()
            .unwrap()
            .seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    fn eod(&mut self) -> io::Result<()> {
        self.drop_handles();
        self.pos_file = self.files;
        Ok(())
    }

    fn truncate(&mut self) -> io::Result<()> {
        self.check_writable()?;
        self.drop_handles();
        self.truncate_tape(0)?;
        self.pos_file = 0;
        self.store_index()
    }

    fn offline(&mut self) -> io::Result<()> {
        self.drop_handles();
        self.store_status(&VTapeDriveStatus { current_tape: None })
    }

    fn position(&mut self) -> io::Result<Option<(u32, u32)>> {
        Ok(Some((self.pos_file as u32, self.pos_block as u32)))
    }

    fn sync(&mut self) -> io::Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.sync_all()?;
        }
        Ok(())
    }
}
