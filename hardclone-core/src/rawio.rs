//! Raw byte access to block devices and image files.
//!
//! Block devices are read with `O_DIRECT` through an aligned buffer and sized
//! with the `BLKGETSIZE64` ioctl; regular files go through the same buffer
//! without the flag.
use nix::ioctl_read;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::device::{DeviceHandle, HandleKind};
use crate::error::{Error, Result};

/// Default raw I/O block size, as `dd bs=1M`.
pub const DEFAULT_BLOCK_SIZE: usize = 1024 * 1024;
/// Alignment required for `O_DIRECT` buffers and transfer sizes.
pub const SECTOR_SIZE: usize = 512;

ioctl_read!(blkgetsize64, 0x12, 114, u64);

fn not_found(path: &Path) -> Error {
    if path.starts_with("/dev") {
        Error::DeviceNotFound(path.to_path_buf())
    } else {
        Error::FileNotFound(path.to_path_buf())
    }
}

/// Resolves `path` into a [`DeviceHandle`], determining its length.
pub fn probe(path: &Path) -> Result<DeviceHandle> {
    let metadata = match fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(not_found(path)),
        Err(e) => return Err(e.into()),
    };

    if metadata.file_type().is_block_device() {
        let file = File::open(path)?;
        let mut len: u64 = 0;
        unsafe {
            blkgetsize64(file.as_raw_fd(), &mut len).map_err(io::Error::from)?;
        }
        Ok(DeviceHandle {
            path: path.to_path_buf(),
            len,
            kind: HandleKind::BlockDevice,
        })
    } else if metadata.is_file() {
        Ok(DeviceHandle {
            path: path.to_path_buf(),
            len: metadata.len(),
            kind: HandleKind::RegularFile,
        })
    } else {
        Err(Error::invalid(format!(
            "{} is neither a block device nor a regular file",
            path.display()
        )))
    }
}

/// Validates a raw I/O block size.
pub fn check_block_size(block_size: usize) -> Result<()> {
    if block_size == 0 || block_size % SECTOR_SIZE != 0 {
        return Err(Error::invalid(format!(
            "block size {block_size} must be a positive multiple of {SECTOR_SIZE} bytes"
        )));
    }
    Ok(())
}

/// A sequential reader over a device or file that reads `block_size` bytes at
/// a time into a sector-aligned buffer.
pub(crate) struct RawReader {
    file: File,
    len: u64,
    read_total: u64,
    buf: Vec<u8>,
    offset: usize,
    block_size: usize,
    start: usize,
    end: usize,
}

impl RawReader {
    pub(crate) fn open(handle: &DeviceHandle, block_size: usize) -> Result<Self> {
        check_block_size(block_size)?;
        let mut options = OpenOptions::new();
        options.read(true);
        if handle.is_block_device() {
            options.custom_flags(libc::O_DIRECT);
        }
        let file = options.open(&handle.path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => not_found(&handle.path),
            _ => e.into(),
        })?;

        // O_DIRECT requires buffers to be memory-aligned.
        let buf = vec![0u8; block_size + SECTOR_SIZE];
        let offset = buf.as_ptr().align_offset(SECTOR_SIZE);
        Ok(Self {
            file,
            len: handle.len,
            read_total: 0,
            buf,
            offset,
            block_size,
            start: 0,
            end: 0,
        })
    }
}

impl Read for RawReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.start == self.end {
            if self.read_total >= self.len {
                return Ok(0);
            }
            let to_read = std::cmp::min(self.block_size as u64, self.len - self.read_total) as usize;
            let block = &mut self.buf[self.offset..self.offset + self.block_size];
            self.file.read_exact(&mut block[..to_read])?;
            self.read_total += to_read as u64;
            self.start = 0;
            self.end = to_read;
        }
        let n = out.len().min(self.end - self.start);
        let from = self.offset + self.start;
        out[..n].copy_from_slice(&self.buf[from..from + n]);
        self.start += n;
        Ok(n)
    }
}

/// Opens a restore destination for writing.
///
/// Block devices are opened in place; a regular file is created or truncated.
pub(crate) fn open_destination(path: &Path) -> Result<File> {
    let is_block = fs::metadata(path)
        .map(|m| m.file_type().is_block_device())
        .unwrap_or(false);
    let mut options = OpenOptions::new();
    options.write(true);
    if !is_block {
        options.create(true).truncate(true);
    }
    options.open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => not_found(path),
        _ => e.into(),
    })
}

/// Bytes available to unprivileged users on the filesystem holding `dir`.
pub fn free_space(dir: &Path) -> Result<u64> {
    let stat = nix::sys::statvfs::statvfs(dir).map_err(io::Error::from)?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}
