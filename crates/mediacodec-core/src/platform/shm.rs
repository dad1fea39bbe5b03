//! Shared memory primitives.
//!
//! Regions are plain files in a memory-backed directory where one exists.
//! Access is positional so concurrent readers and writers never share a
//! file cursor.

use std::fs::File;
use std::io;
use std::path::PathBuf;

/// Preferred directory for backing files.
pub fn default_shm_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        let dev_shm = PathBuf::from("/dev/shm");
        if dev_shm.is_dir() {
            return dev_shm;
        }
    }
    std::env::temp_dir()
}

/// Fill `buf` from `file` starting at `offset`.
#[cfg(unix)]
pub fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

/// Write all of `buf` to `file` starting at `offset`.
#[cfg(unix)]
pub fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
pub fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut done = 0;
    while done < buf.len() {
        let n = file.seek_read(&mut buf[done..], offset + done as u64)?;
        if n == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
        }
        done += n;
    }
    Ok(())
}

#[cfg(windows)]
pub fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut done = 0;
    while done < buf.len() {
        let n = file.seek_write(&buf[done..], offset + done as u64)?;
        if n == 0 {
            return Err(io::Error::from(io::ErrorKind::WriteZero));
        }
        done += n;
    }
    Ok(())
}
