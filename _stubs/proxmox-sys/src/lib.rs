pub mod fs {
    use std::fs::File;
    use std::path::Path;
    use std::time::Duration;

    use anyhow::Error;

    #[derive(Default, Clone)]
    pub struct CreateOptions;
    impl CreateOptions {
        pub fn new() -> Self {
            Self
        }
    }

    pub fn open_file_locked<P: AsRef<Path>>(
        path: P,
        _timeout: Duration,
        _exclusive: bool,
        _options: CreateOptions,
    ) -> Result<File, Error> {
        use std::os::unix::io::AsRawFd;
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let ret = unsafe { libc_flock(file.as_raw_fd()) };
        if ret != 0 {
            anyhow::bail!("flock failed");
        }
        Ok(file)
    }

    unsafe fn libc_flock(fd: i32) -> i32 {
        extern "C" {
            fn flock(fd: i32, operation: i32) -> i32;
        }
        flock(fd, 2) // LOCK_EX
    }

    pub fn file_get_json<P: AsRef<Path>>(
        path: P,
        default: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, Error> {
        match std::fs::read(path) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                default.ok_or_else(|| anyhow::anyhow!("file not found"))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn replace_file<P: AsRef<Path>>(
        path: P,
        data: &[u8],
        _options: CreateOptions,
        _fsync: bool,
    ) -> Result<(), Error> {
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}
