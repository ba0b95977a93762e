//! Linux magnetic tape driver backend
//!
//! ioctl definitions from /usr/include/x86_64-linux-gnu/sys/mtio.h,
//! also see: man 4 st

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;

use crate::store::backend::{DeviceBackend, OpenMode};
use crate::store::DeviceConfig;

#[repr(C)]
pub struct mtop {
    pub mt_op: MTCmd,          /* Operations defined below.  */
    pub mt_count: libc::c_int, /* How many of them.  */
}

#[repr(i16)]
#[allow(dead_code)] // do not warn about unused commands
#[derive(Clone, Copy)]
pub enum MTCmd {
    MTRESET = 0,
    /// forward space FileMark, position at first record of next file
    MTFSF = 1,
    /// backward space FileMark (position before FM)
    MTBSF = 2,
    /// forward space record
    MTFSR = 3,
    /// backward space record
    MTBSR = 4,
    /// write an end-of-file record (mark)
    MTWEOF = 5,
    /// rewind
    MTREW = 6,
    /// rewind and put the drive offline
    MTOFFL = 7,
    /// no op, set status only
    MTNOP = 8,
    /// goto end of recorded media (for appending files)
    MTEOM = 12,
    /// erase tape -- be careful!
    MTERASE = 13,
    /// set block length (SCSI)
    MTSETBLK = 20,
    /// lock the drive door
    MTLOCK = 28,
    /// unlock the drive door
    MTUNLOCK = 29,
    /// execute the SCSI load command
    MTLOAD = 30,
    /// execute the SCSI unload command
    MTUNLOAD = 31,
}

//#define MTIOCTOP _IOW('m', 1, struct mtop)    /* Do a mag tape op. */
nix::ioctl_write_ptr!(mtioctop, b'm', 1, mtop);

#[derive(Default, Debug)]
#[repr(C)]
pub struct mtget {
    pub mt_type: libc::c_long,
    pub mt_resid: libc::c_long,
    pub mt_dsreg: libc::c_long,
    /// Generic (device independent) status
    pub mt_gstat: libc::c_long,
    pub mt_erreg: libc::c_long,
    /// Number of current file on tape
    pub mt_fileno: i32,
    /// Current block number
    pub mt_blkno: i32,
}

//#define MTIOCGET _IOR('m', 2, struct mtget)   /* Get tape status. */
nix::ioctl_read!(mtiocget, b'm', 2, mtget);

fn nix_to_io(err: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(err as i32)
}

/// Real tape drive through the Linux st driver.
pub struct MtioBackend {
    file: File,
}

impl MtioBackend {
    pub fn open(config: &DeviceConfig, mode: OpenMode) -> io::Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true);
        if mode.writable() {
            options.write(true);
        }
        let file = options.open(&config.archive_path)?;
        let backend = Self { file };
        // probe rewind: the st driver reports a drive that is still
        // busy (or without media) only on the first tape command, not
        // on the open itself
        backend.mtop(MTCmd::MTREW, 1)?;
        Ok(backend)
    }

    fn mtop(&self, op: MTCmd, count: libc::c_int) -> io::Result<()> {
        let cmd = mtop {
            mt_op: op,
            mt_count: count,
        };
        unsafe { mtioctop(self.file.as_raw_fd(), &cmd) }.map_err(nix_to_io)?;
        Ok(())
    }
}

impl DeviceBackend for MtioBackend {
    fn read_block(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    fn write_block(&mut self, data: &[u8]) -> io::Result<usize> {
        match self.file.write(data) {
            Ok(n) if n == data.len() => Ok(n),
            // the st driver never splits variable sized blocks
            Ok(n) => Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short tape write ({} of {} bytes)", n, data.len()),
            )),
            Err(err) => Err(err),
        }
    }

    fn weof(&mut self, count: u32) -> io::Result<()> {
        self.mtop(MTCmd::MTWEOF, count as libc::c_int)
    }

    fn rewind(&mut self) -> io::Result<()> {
        self.mtop(MTCmd::MTREW, 1)
    }

    fn fsf(&mut self, count: u32) -> io::Result<()> {
        self.mtop(MTCmd::MTFSF, count as libc::c_int)
    }

    fn bsf(&mut self, count: u32) -> io::Result<()> {
        self.mtop(MTCmd::MTBSF, count as libc::c_int)
    }

    fn fsr(&mut self, count: u32) -> io::Result<()> {
        self.mtop(MTCmd::MTFSR, count as libc::c_int)
    }

    fn bsr(&mut self, count: u32) -> io::Result<()> {
        self.mtop(MTCmd::MTBSR, count as libc::c_int)
    }

    fn eod(&mut self) -> io::Result<()> {
        self.mtop(MTCmd::MTEOM, 1)
    }

    fn offline(&mut self) -> io::Result<()> {
        self.mtop(MTCmd::MTOFFL, 1)
    }

    fn position(&mut self) -> io::Result<Option<(u32, u32)>> {
        let mut status = mtget::default();
        unsafe { mtiocget(self.file.as_raw_fd(), &mut status) }.map_err(nix_to_io)?;
        if status.mt_fileno < 0 || status.mt_blkno < 0 {
            return Ok(None);
        }
        Ok(Some((status.mt_fileno as u32, status.mt_blkno as u32)))
    }

    fn sync(&mut self) -> io::Result<()> {
        // tapes flush their buffer when a filemark is written
        Ok(())
    }
}
