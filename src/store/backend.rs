//! Low-level device backends
//!
//! A `Device` owns exactly one backend, selected by its configured
//! type. The backend exposes the raw OS primitives (read/write one
//! block, space files/records, rewind, ...); everything stateful and
//! capability-dependent lives in the device layer above. Backends
//! signal "operation not supported" with ENOSYS so the device layer
//! can clear the matching capability flag and fall back.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use crate::store::{DeviceConfig, DeviceType};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    ReadWrite,
    CreateReadWrite,
}

impl OpenMode {
    pub fn writable(&self) -> bool {
        !matches!(self, OpenMode::Read)
    }
}

pub(crate) fn unsupported() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOSYS)
}

/// True if an error means "the driver cannot do this", as opposed to
/// a transient or media failure.
pub fn is_unsupported(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ENOSYS) | Some(libc::EOPNOTSUPP) | Some(libc::ENOTTY)
    )
}

/// Raw storage primitives behind a `Device`.
pub trait DeviceBackend: Send {
    /// Read one block. Returns 0 at a filemark (tape semantics) or at
    /// end of data.
    fn read_block(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one block. ENOSPC signals end of media.
    fn write_block(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Write `count` filemarks.
    fn weof(&mut self, _count: u32) -> io::Result<()> {
        Ok(())
    }

    fn rewind(&mut self) -> io::Result<()>;

    fn fsf(&mut self, _count: u32) -> io::Result<()> {
        Err(unsupported())
    }

    fn bsf(&mut self, _count: u32) -> io::Result<()> {
        Err(unsupported())
    }

    fn fsr(&mut self, _count: u32) -> io::Result<()> {
        Err(unsupported())
    }

    fn bsr(&mut self, _count: u32) -> io::Result<()> {
        Err(unsupported())
    }

    /// Space to end of recorded data (hardware EOM).
    fn eod(&mut self) -> io::Result<()> {
        Err(unsupported())
    }

    fn seek_to(&mut self, _addr: u64) -> io::Result<()> {
        Err(unsupported())
    }

    fn seek_end(&mut self) -> io::Result<u64> {
        Err(unsupported())
    }

    /// Discard all content (relabel path).
    fn truncate(&mut self) -> io::Result<()> {
        Err(unsupported())
    }

    /// Put the drive offline / eject.
    fn offline(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Report (file, block) position if the hardware can.
    fn position(&mut self) -> io::Result<Option<(u32, u32)>> {
        Ok(None)
    }

    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Open the backend matching the configured device type.
///
/// `vol_name` selects the volume file for disk devices and the loaded
/// tape for the emulated type; real drives ignore it.
pub fn open_backend(
    config: &DeviceConfig,
    vol_name: &str,
    mode: OpenMode,
) -> io::Result<Box<dyn DeviceBackend>> {
    match config.dev_type {
        DeviceType::File => Ok(Box::new(FileBackend::open(config, vol_name, mode)?)),
        DeviceType::Fifo => Ok(Box::new(FifoBackend::open(config, mode)?)),
        DeviceType::VTape => Ok(Box::new(crate::store::vtape::VTapeBackend::open(
            config, vol_name, mode,
        )?)),
        DeviceType::Tape => Ok(Box::new(crate::store::mtio::MtioBackend::open(
            config, mode,
        )?)),
    }
}

/// Disk file volumes: one regular file per volume inside the
/// configured archive directory.
pub struct FileBackend {
    file: File,
}

impl FileBackend {
    pub fn open(config: &DeviceConfig, vol_name: &str, mode: OpenMode) -> io::Result<Self> {
        if vol_name.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "file device needs a volume name to open",
            ));
        }
        let mut path = PathBuf::from(&config.archive_path);
        path.push(vol_name);

        let mut options = OpenOptions::new();
        options.read(true);
        if mode.writable() {
            options.write(true);
        }
        if mode == OpenMode::CreateReadWrite {
            options.create(true);
        }
        let file = options.open(path)?;
        Ok(Self { file })
    }
}

impl DeviceBackend for FileBackend {
    fn read_block(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // a regular file does not preserve write boundaries, fill the
        // buffer; the device layer trims to the header's block length
        let mut done = 0;
        while done < buf.len() {
            match self.file.read(&mut buf[done..]) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(done)
    }

    fn write_block(&mut self, data: &[u8]) -> io::Result<usize> {
        self.file.write_all(data)?;
        Ok(data.len())
    }

    fn rewind(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    fn seek_to(&mut self, addr: u64) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(addr))?;
        Ok(())
    }

    fn seek_end(&mut self) -> io::Result<u64> {
        self.file.seek(SeekFrom::End(0))
    }

    fn truncate(&mut self) -> io::Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }
}

/// Stream device: sequential read/write only, no positioning at all.
pub struct FifoBackend {
    file: File,
}

impl FifoBackend {
    pub fn open(config: &DeviceConfig, mode: OpenMode) -> io::Result<Self> {
        let mut options = OpenOptions::new();
        if mode.writable() {
            options.write(true);
        } else {
            options.read(true);
        }
        let file = options.open(&config.archive_path)?;
        Ok(Self { file })
    }
}

impl DeviceBackend for FifoBackend {
    fn read_block(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    fn write_block(&mut self, data: &[u8]) -> io::Result<usize> {
        self.file.write_all(data)?;
        Ok(data.len())
    }

    fn rewind(&mut self) -> io::Result<()> {
        // streams have no position, rewind is a no-op
        Ok(())
    }
}
