#![forbid(unsafe_code)]
//! Backing block-device layer.
//!
//! Provides the `ByteDevice` trait for synchronous offset I/O (metadata
//! reads and the dual-copy commit write), the `BlockBackend` trait for the
//! asynchronous data-path queue, shared transfer buffers, and file- and
//! memory-backed implementations.

use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use svol_error::{Result, VolError};
use svol_types::ByteOffset;
use tracing::trace;

// ── Byte-addressed device ───────────────────────────────────────────────────

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn check_range(offset: ByteOffset, len: usize, device_len: u64) -> Result<()> {
    let len = u64::try_from(len).map_err(|_| VolError::OutOfRange("transfer length"))?;
    let end = offset
        .checked_add(len)
        .ok_or(VolError::OutOfRange("byte range overflow"))?;
    if end.0 > device_len {
        return Err(VolError::OutOfRange("byte range past device end"));
    }
    Ok(())
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// `std::os::unix::fs::FileExt` is thread-safe and does not require a shared
/// seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset.0)?;
        Ok(())
    }

    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(VolError::BadState("device opened read-only"));
        }
        check_range(offset, buf.len(), self.len)?;
        self.file.write_all_at(buf, offset.0)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory byte device. Cloning shares the same backing storage.
#[derive(Debug, Clone)]
pub struct MemByteDevice {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0_u8; len])),
        }
    }

    /// Snapshot the device contents (test inspection).
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(0)
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        check_range(offset, buf.len(), bytes.len() as u64)?;
        let start = usize::try_from(offset.0).map_err(|_| VolError::OutOfRange("byte offset"))?;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        Ok(())
    }

    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        check_range(offset, buf.len(), bytes.len() as u64)?;
        let start = usize::try_from(offset.0).map_err(|_| VolError::OutOfRange("byte offset"))?;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

// ── Transfer buffers ────────────────────────────────────────────────────────

/// Shared transfer buffer for queued block requests.
///
/// Sub-requests produced by scatter fan-out clone the handle and address
/// disjoint windows of the same storage, so the last completion dropping its
/// clone releases the allocation.
#[derive(Debug, Clone)]
pub struct IoBuffer {
    bytes: Arc<RwLock<Vec<u8>>>,
}

impl IoBuffer {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Arc::new(RwLock::new(vec![0_u8; len])),
        }
    }

    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(RwLock::new(bytes)),
        }
    }

    #[must_use]
    pub fn empty() -> Self {
        Self::new(0)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `buf.len()` bytes out of the buffer starting at byte `offset`.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.read();
        let start = usize::try_from(offset).map_err(|_| VolError::OutOfRange("buffer offset"))?;
        let end = start
            .checked_add(buf.len())
            .ok_or(VolError::OutOfRange("buffer range overflow"))?;
        if end > bytes.len() {
            return Err(VolError::OutOfRange("buffer range past end"));
        }
        buf.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    /// Copy `buf` into the buffer starting at byte `offset`.
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.write();
        let start = usize::try_from(offset).map_err(|_| VolError::OutOfRange("buffer offset"))?;
        let end = start
            .checked_add(buf.len())
            .ok_or(VolError::OutOfRange("buffer range overflow"))?;
        if end > bytes.len() {
            return Err(VolError::OutOfRange("buffer range past end"));
        }
        bytes[start..end].copy_from_slice(buf);
        Ok(())
    }

    /// Snapshot the buffer contents (test inspection).
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.read().clone()
    }
}

// ── Block requests ──────────────────────────────────────────────────────────

/// Operation kind carried by a queued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOp {
    Read,
    Write,
    /// Barrier: flush previously completed writes to stable storage.
    Flush,
}

/// Completion callback invoked exactly once per request.
pub type Completion = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// An asynchronous transfer request against a block-addressed device.
///
/// All offsets and lengths are in device blocks. `Flush` ignores the
/// transfer fields.
pub struct BlockRequest {
    pub op: BlockOp,
    pub buffer: IoBuffer,
    /// Offset into `buffer`, in blocks.
    pub buffer_offset: u64,
    /// Offset on the device, in blocks.
    pub dev_offset: u64,
    /// Transfer length in blocks.
    pub length: u32,
    pub completion: Completion,
}

impl BlockRequest {
    #[must_use]
    pub fn flush(completion: Completion) -> Self {
        Self {
            op: BlockOp::Flush,
            buffer: IoBuffer::empty(),
            buffer_offset: 0,
            dev_offset: 0,
            length: 0,
            completion,
        }
    }

    /// Complete the request, consuming it.
    pub fn complete(self, status: Result<()>) {
        (self.completion)(status);
    }
}

impl std::fmt::Debug for BlockRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockRequest")
            .field("op", &self.op)
            .field("buffer_offset", &self.buffer_offset)
            .field("dev_offset", &self.dev_offset)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

/// Geometry reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub block_size: u32,
    pub block_count: u64,
}

/// The backing device consumed by the volume manager: an asynchronous
/// request queue plus synchronous byte I/O for metadata.
///
/// `submit` must not block the caller; completions may run on arbitrary
/// threads chosen by the implementation.
pub trait BlockBackend: Send + Sync {
    fn info(&self) -> BlockInfo;

    fn submit(&self, request: BlockRequest);

    /// Drain the queue and flush to stable storage.
    fn sync(&self) -> Result<()>;

    fn read_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()>;

    fn write_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()>;
}

// ── Byte-device backend adapter ─────────────────────────────────────────────

/// Adapts any `ByteDevice` into a `BlockBackend` by executing queued
/// requests immediately on the submitting thread.
#[derive(Debug)]
pub struct DeviceBackend<D: ByteDevice> {
    inner: D,
    block_size: u32,
    block_count: u64,
}

impl<D: ByteDevice> DeviceBackend<D> {
    pub fn new(inner: D, block_size: u32) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(VolError::InvalidArgs("block size must be a power of two"));
        }
        let len = inner.len_bytes();
        if len % u64::from(block_size) != 0 {
            return Err(VolError::InvalidArgs("device length not block-aligned"));
        }
        Ok(Self {
            inner,
            block_size,
            block_count: len / u64::from(block_size),
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn transfer(&self, request: &BlockRequest) -> Result<()> {
        let block_size = u64::from(self.block_size);
        let end = request
            .dev_offset
            .checked_add(u64::from(request.length))
            .ok_or(VolError::OutOfRange("device block range overflow"))?;
        if end > self.block_count {
            return Err(VolError::OutOfRange("device block range past end"));
        }

        let dev_bytes = ByteOffset(request.dev_offset * block_size);
        let buf_bytes = request.buffer_offset * block_size;
        let len = usize::try_from(u64::from(request.length) * block_size)
            .map_err(|_| VolError::OutOfRange("transfer length"))?;

        let mut staging = vec![0_u8; len];
        match request.op {
            BlockOp::Read => {
                self.inner.read_exact_at(dev_bytes, &mut staging)?;
                request.buffer.write_at(buf_bytes, &staging)?;
            }
            BlockOp::Write => {
                request.buffer.read_at(buf_bytes, &mut staging)?;
                self.inner.write_all_at(dev_bytes, &staging)?;
            }
            BlockOp::Flush => self.inner.sync()?,
        }
        Ok(())
    }
}

impl<D: ByteDevice> BlockBackend for DeviceBackend<D> {
    fn info(&self) -> BlockInfo {
        BlockInfo {
            block_size: self.block_size,
            block_count: self.block_count,
        }
    }

    fn submit(&self, request: BlockRequest) {
        trace!(
            target: "svol::block",
            event = "submit",
            op = ?request.op,
            dev_offset = request.dev_offset,
            length = request.length
        );
        let status = self.transfer(&request);
        request.complete(status);
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }

    fn read_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        self.inner.read_exact_at(offset, buf)
    }

    fn write_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        self.inner.write_all_at(offset, buf)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
