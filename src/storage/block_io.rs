//! Sector-aligned block I/O.
//!
//! Every transfer is split into a partial leading sector, whole sectors and
//! a partial trailing sector. Partial sectors go through read-modify-write in
//! an internal bounce buffer, so the caller's buffer is never touched past
//! its length. With direct I/O, whole-sector transfers from misaligned
//! memory are bounced through page-aligned buffers as well.

use super::{is_block_device, mem_alignment, platform};
use crate::config::SECTOR_SIZE;
use crate::error::{Error, Result};
use std::alloc::{self, Layout};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::ops::{Deref, DerefMut};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// Largest bounce transfer for misaligned direct I/O.
const BOUNCE_CHUNK: usize = 1 << 20;

/// How to open a [`BlockDevice`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockOpen {
    pub write: bool,
    /// Bypass the page cache (`O_DIRECT | O_SYNC`).
    pub direct: bool,
    /// Kernel exclusive open (`O_EXCL`) for block devices.
    pub exclusive: bool,
}

/// Handle for sector-aligned access to a device or image file.
#[derive(Debug)]
pub struct BlockDevice {
    file: File,
    path: PathBuf,
    sector_size: usize,
    mem_align: usize,
    writable: bool,
    direct: bool,
    block_device: bool,
}

impl BlockDevice {
    /// Open a device for reading.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(path, BlockOpen::default())
    }

    /// Open a device for reading and writing.
    pub fn open_write(path: &Path) -> Result<Self> {
        Self::open_with(
            path,
            BlockOpen {
                write: true,
                ..Default::default()
            },
        )
    }

    pub fn open_with(path: &Path, opts: BlockOpen) -> Result<Self> {
        let block_device = is_block_device(path).map_err(|e| map_open_error(path, opts.write, e))?;

        let mut flags = 0;
        if opts.direct {
            flags |= platform::DIRECT_FLAGS;
        }
        if opts.exclusive && block_device {
            flags |= libc::O_EXCL;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(opts.write)
            .custom_flags(flags)
            .open(path)
            .map_err(|e| map_open_error(path, opts.write, e))?;

        let sector_size = if block_device {
            platform::sector_size(&file)
                .ok()
                .map(|s| s as usize)
                .filter(|s| s.is_power_of_two() && *s as u64 >= SECTOR_SIZE)
                .unwrap_or(SECTOR_SIZE as usize)
        } else {
            SECTOR_SIZE as usize
        };

        Ok(Self {
            file,
            path: path.to_path_buf(),
            sector_size,
            mem_align: mem_alignment(),
            writable: opts.write,
            direct: opts.direct,
            block_device,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    pub fn is_block_device(&self) -> bool {
        self.block_device
    }

    /// Size in bytes.
    pub fn size(&self) -> Result<u64> {
        if self.block_device {
            Ok(platform::size_bytes(&self.file)?)
        } else {
            Ok(self.file.metadata()?.len())
        }
    }

    /// Flush written data to the device.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Write `data` at the current position and advance past it.
    ///
    /// # Arguments
    /// * `data` - Bytes to write. Any length, any memory alignment.
    ///
    /// # Returns
    /// The number of bytes written, which is always `data.len()`.
    pub fn write_blockwise(&mut self, data: &[u8]) -> Result<usize> {
        let pos = self.file.stream_position()?;
        self.write_at_offset_blockwise(data, pos)
    }

    /// Fill `buf` from the current position and advance past it.
    ///
    /// # Arguments
    /// * `buf` - Destination. Any length, any memory alignment.
    ///
    /// # Returns
    /// The number of bytes read, which is always `buf.len()`. Reading past
    /// the end of the device is an I/O error.
    pub fn read_blockwise(&mut self, buf: &mut [u8]) -> Result<usize> {
        let pos = self.file.stream_position()?;
        self.read_at_offset_blockwise(buf, pos)
    }

    /// Write `data` at byte `offset`. The position ends after the data.
    ///
    /// Sectors only partly covered by `data` are read, patched and written
    /// back, so bytes outside `offset..offset + data.len()` keep their value.
    ///
    /// # Arguments
    /// * `data` - Bytes to write. An empty slice only moves the position.
    /// * `offset` - Byte offset on the device. Need not be sector aligned.
    ///
    /// # Returns
    /// The number of bytes written.
    pub fn write_at_offset_blockwise(&mut self, data: &[u8], offset: u64) -> Result<usize> {
        if !self.writable {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} not opened for writing", self.path.display()),
            )));
        }
        if data.is_empty() {
            self.file.seek(SeekFrom::Start(offset))?;
            return Ok(0);
        }

        let bs = self.sector_size;
        let front = (offset % bs as u64) as usize;
        let mut done = 0;

        if front != 0 || data.len() < bs {
            let start = offset - front as u64;
            let take = (bs - front).min(data.len());
            let mut sector = AlignedBuf::new(bs, self.mem_align)?;
            self.read_sectors(start, &mut sector)?;
            sector[front..front + take].copy_from_slice(&data[..take]);
            self.write_sectors(start, &sector)?;
            done = take;
        }

        let whole = (data.len() - done) / bs * bs;
        if whole > 0 {
            self.write_sectors(offset + done as u64, &data[done..done + whole])?;
            done += whole;
        }

        if done < data.len() {
            let rest = data.len() - done;
            let start = offset + done as u64;
            let mut sector = AlignedBuf::new(bs, self.mem_align)?;
            self.read_sectors(start, &mut sector)?;
            sector[..rest].copy_from_slice(&data[done..]);
            self.write_sectors(start, &sector)?;
            done += rest;
        }

        self.file.seek(SeekFrom::Start(offset + done as u64))?;
        Ok(done)
    }

    /// Fill `buf` from byte `offset`. The position ends after the data.
    ///
    /// # Arguments
    /// * `buf` - Destination. An empty slice only moves the position.
    /// * `offset` - Byte offset on the device. Need not be sector aligned.
    ///
    /// # Returns
    /// The number of bytes read.
    pub fn read_at_offset_blockwise(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if buf.is_empty() {
            self.file.seek(SeekFrom::Start(offset))?;
            return Ok(0);
        }
        let bs = self.sector_size;
        let front = (offset % bs as u64) as usize;
        let mut done = 0;

        if front != 0 || buf.len() < bs {
            let start = offset - front as u64;
            let take = (bs - front).min(buf.len());
            let mut sector = AlignedBuf::new(bs, self.mem_align)?;
            self.read_sectors(start, &mut sector)?;
            buf[..take].copy_from_slice(&sector[front..front + take]);
            done = take;
        }

        let whole = (buf.len() - done) / bs * bs;
        if whole > 0 {
            self.read_sectors(offset + done as u64, &mut buf[done..done + whole])?;
            done += whole;
        }

        if done < buf.len() {
            let rest = buf.len() - done;
            let mut sector = AlignedBuf::new(bs, self.mem_align)?;
            self.read_sectors(offset + done as u64, &mut sector)?;
            buf[done..].copy_from_slice(&sector[..rest]);
            done += rest;
        }

        self.file.seek(SeekFrom::Start(offset + done as u64))?;
        Ok(done)
    }

    fn needs_bounce(&self, ptr: *const u8) -> bool {
        self.direct && (ptr as usize) % self.mem_align != 0
    }

    /// Whole-sector read at an aligned position.
    fn read_sectors(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len() % self.sector_size, 0);
        self.file.seek(SeekFrom::Start(pos))?;
        if !self.needs_bounce(buf.as_ptr()) {
            self.file.read_exact(buf)?;
            return Ok(());
        }
        let mut bounce = AlignedBuf::new(buf.len().min(BOUNCE_CHUNK), self.mem_align)?;
        for chunk in buf.chunks_mut(BOUNCE_CHUNK) {
            let staged = &mut bounce[..chunk.len()];
            self.file.read_exact(staged)?;
            chunk.copy_from_slice(staged);
        }
        Ok(())
    }

    /// Whole-sector write at an aligned position.
    fn write_sectors(&mut self, pos: u64, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len() % self.sector_size, 0);
        self.file.seek(SeekFrom::Start(pos))?;
        if !self.needs_bounce(data.as_ptr()) {
            self.file.write_all(data)?;
            return Ok(());
        }
        let mut bounce = AlignedBuf::new(data.len().min(BOUNCE_CHUNK), self.mem_align)?;
        for chunk in data.chunks(BOUNCE_CHUNK) {
            let staged = &mut bounce[..chunk.len()];
            staged.copy_from_slice(chunk);
            self.file.write_all(staged)?;
        }
        Ok(())
    }
}

fn map_open_error(path: &Path, write: bool, e: io::Error) -> Error {
    match e.raw_os_error() {
        Some(libc::EBUSY) => return Error::busy(path, "exclusive open refused"),
        Some(libc::EROFS) if write => return Error::not_ready(path, "device is read-only"),
        _ => {}
    }
    match e.kind() {
        io::ErrorKind::NotFound => Error::not_ready(path, "no such device"),
        io::ErrorKind::PermissionDenied => Error::not_ready(
            path,
            format!(
                "cannot open {}{}. Try running with sudo.",
                path.display(),
                if write { " for writing" } else { "" }
            ),
        ),
        _ => Error::Io(e),
    }
}

/// Zeroed heap buffer with a fixed alignment.
pub(crate) struct AlignedBuf {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: AlignedBuf owns its allocation exclusively.
unsafe impl Send for AlignedBuf {}

impl AlignedBuf {
    pub(crate) fn new(len: usize, align: usize) -> Result<Self> {
        let layout = Layout::from_size_align(len.max(1), align)
            .map_err(|e| Error::Allocation(e.to_string()))?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw)
            .ok_or_else(|| Error::Allocation(format!("cannot allocate {} byte I/O buffer", len)))?;
        Ok(Self { ptr, layout })
    }
}

impl Deref for AlignedBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() initialised bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl DerefMut for AlignedBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for layout.size() initialised bytes and uniquely owned.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}
