use std::ffi::OsString;
use std::os::unix::io::AsRawFd;

use async_std::fs::{self, File, OpenOptions};
use async_std::path::{Path, PathBuf};
use bytes::Bytes;
use log::warn;

use crate::error::{self, Result};

/// Writes through a sibling temp file and a rename, so concurrent readers
/// never observe a partial file.
pub async fn write_bytes_atomic(file: &Path, bytes: &Bytes) -> Result<()> {
    let mut tmp: OsString = file.as_os_str().to_owned();
    tmp.push(format!(".{}.tmp", std::process::id()));
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, bytes).await
        .map_err(|e| error::io(e, Some(format!("failed to write file: {}", tmp.display()))))?;

    fs::rename(&tmp, file).await
        .map_err(|e| error::io(e, Some(format!("failed to move file into place: {}", file.display()))))
}

fn flock(file: &File, flag: libc::c_int) -> Result<()> {
    let ret = unsafe {
        libc::flock(file.as_raw_fd(), flag)
    };
    if ret < 0 {
        Err(error::io(std::io::Error::last_os_error(), Some("flock failed".into())))
    } else {
        Ok(())
    }
}

/// An advisory lock on a file, released on drop.
pub struct FileLock {
    file: File,
}

impl FileLock {
    async fn acquire(path: &Path, flag: libc::c_int) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .append(true)
            .open(path).await
            .map_err(|e| error::io(e, Some(format!("failed to open lock file: {}", path.display()))))?;

        flock(&file, flag)?;

        Ok(Self { file })
    }

    pub async fn shared(path: &Path) -> Result<Self> {
        Self::acquire(path, libc::LOCK_SH).await
    }

    pub async fn exclusive(path: &Path) -> Result<Self> {
        Self::acquire(path, libc::LOCK_EX).await
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = flock(&self.file, libc::LOCK_UN) {
            warn!("failed to unlock: {:?}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use async_std::fs;
    use async_std::path::PathBuf;
    use bytes::Bytes;

    use super::{write_bytes_atomic, FileLock};

    #[tokio::test]
    async fn atomic_write_and_lock() {
        let dir = PathBuf::from(std::env::temp_dir()).join(format!("cvm-attestation-file-{}", std::process::id()));
        fs::create_dir_all(&dir).await.unwrap();
        let target = dir.join("ark.der");

        write_bytes_atomic(&target, &Bytes::from_static(b"der")).await.unwrap();
        assert_eq!(fs::read(&target).await.unwrap(), b"der");

        {
            let _shared = FileLock::shared(&dir.join("fetch.lock")).await.unwrap();
            let _other = FileLock::shared(&dir.join("fetch.lock")).await.unwrap();
        }
        let _exclusive = FileLock::exclusive(&dir.join("fetch.lock")).await.unwrap();

        fs::remove_dir_all(&dir).await.unwrap();
    }
}
