// src/posix.rs
//
// POSIX backend for local and parallel file systems mounted on the host
//
// Plain std::fs for the data path, libc for access() and statvfs().

use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, FileExt, OpenOptionsExt};
use std::path::Path;
use tracing::trace;

use crate::backend::{AccessMode, Backend, Capabilities, FileStat, FsUsage, OpenMode};
use crate::constants::{DIR_MODE, FILE_MODE};
use crate::error::{BenchError, BenchResult};

#[derive(Debug, Clone, Copy, Default)]
pub struct PosixBackend;

impl PosixBackend {
    pub fn new() -> Self {
        Self
    }
}

fn c_path(op: &'static str, path: &Path) -> BenchResult<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|e| {
        BenchError::backend(op, path, std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
    })
}

impl Backend for PosixBackend {
    type Handle = File;

    fn name(&self) -> &'static str {
        "POSIX"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            collective_io: false,
            fsync: true,
        }
    }

    fn create(&self, path: &Path) -> BenchResult<File> {
        trace!("create: {}", path.display());
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(FILE_MODE)
            .open(path)
            .map_err(|e| BenchError::backend("create", path, e))
    }

    fn open(&self, path: &Path, mode: OpenMode) -> BenchResult<File> {
        trace!("open: {} {:?}", path.display(), mode);
        let mut options = OpenOptions::new();
        match mode {
            OpenMode::ReadOnly => options.read(true),
            OpenMode::WriteOnly => options.write(true),
        };
        options
            .open(path)
            .map_err(|e| BenchError::backend("open", path, e))
    }

    fn close(&self, handle: File, _path: &Path) -> BenchResult<()> {
        drop(handle);
        Ok(())
    }

    fn write_at(&self, handle: &mut File, buf: &[u8], offset: u64, path: &Path) -> BenchResult<usize> {
        handle
            .write_all_at(buf, offset)
            .map(|_| buf.len())
            .map_err(|e| BenchError::backend("write", path, e))
    }

    fn read_at(&self, handle: &mut File, buf: &mut [u8], offset: u64, path: &Path) -> BenchResult<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = handle
                .read_at(&mut buf[filled..], offset + filled as u64)
                .map_err(|e| BenchError::backend("read", path, e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    fn fsync(&self, handle: &mut File, path: &Path) -> BenchResult<()> {
        handle
            .sync_all()
            .map_err(|e| BenchError::backend("fsync", path, e))
    }

    fn delete(&self, path: &Path) -> BenchResult<()> {
        trace!("unlink: {}", path.display());
        fs::remove_file(path).map_err(|e| BenchError::backend("unlink", path, e))
    }

    fn mkdir(&self, path: &Path) -> BenchResult<()> {
        trace!("mkdir: {}", path.display());
        fs::DirBuilder::new()
            .mode(DIR_MODE)
            .create(path)
            .map_err(|e| BenchError::backend("mkdir", path, e))
    }

    fn rmdir(&self, path: &Path) -> BenchResult<()> {
        trace!("rmdir: {}", path.display());
        fs::remove_dir(path).map_err(|e| BenchError::backend("rmdir", path, e))
    }

    fn stat(&self, path: &Path) -> BenchResult<FileStat> {
        let metadata = fs::metadata(path).map_err(|e| BenchError::backend("stat", path, e))?;
        Ok(FileStat {
            size: metadata.len(),
            modified: metadata.modified().ok(),
            is_dir: metadata.is_dir(),
            is_file: metadata.is_file(),
        })
    }

    fn access(&self, path: &Path, mode: AccessMode) -> BenchResult<bool> {
        let path_cstr = c_path("access", path)?;
        let result = unsafe { libc::access(path_cstr.as_ptr(), mode.to_posix_mode()) };
        Ok(result == 0)
    }

    fn statfs(&self, path: &Path) -> BenchResult<FsUsage> {
        let path_cstr = c_path("statfs", path)?;
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(path_cstr.as_ptr(), &mut stat) };
        if rc != 0 {
            return Err(BenchError::backend("statfs", path, std::io::Error::last_os_error()));
        }
        let fragment = stat.f_frsize as u64;
        Ok(FsUsage {
            total_bytes: stat.f_blocks as u64 * fragment,
            free_bytes: stat.f_bavail as u64 * fragment,
            total_inodes: stat.f_files as u64,
            free_inodes: stat.f_ffree as u64,
        })
    }
}
