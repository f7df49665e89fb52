//! Virtual partitions and the block-request dispatch path.
//!
//! A `VPartition` presents a contiguous virtual block address space of
//! `VSLICE_MAX` slices. Requests are translated against the partition's
//! slice map: a request inside one slice or covering physically contiguous
//! slices forwards as a single sub-request; anything else fans out with an
//! aggregated completion.

use parking_lot::Mutex;
use std::sync::Arc;
use svol_block::{BlockBackend, BlockInfo, BlockOp, BlockRequest, Completion};
use svol_error::{Result, VolError};
use svol_extent::{SliceMap, SliceRange};
use svol_types::{ByteOffset, Pslice, VSLICE_MAX, round_up, slice_start};
use tracing::trace;

/// Scatter fan-out cap: a request may touch at most this many slices when
/// its slices are not physically contiguous.
pub const MAX_SPLIT: usize = 32;

// ── Geometry ────────────────────────────────────────────────────────────────

/// Device geometry fixed at load time and shared by every partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub disk_size: u64,
    pub slice_size: u64,
    pub block_size: u32,
}

impl Geometry {
    /// Blocks per slice. `slice_size` is validated at load to be a nonzero
    /// multiple of `block_size`.
    #[must_use]
    pub fn blocks_per_slice(&self) -> u64 {
        self.slice_size / u64::from(self.block_size)
    }

    /// Virtual capacity of every partition, in device blocks.
    #[must_use]
    pub fn capacity_blocks(&self) -> u64 {
        // slice_size * VSLICE_MAX is overflow-checked at load, and
        // blocks_per_slice <= slice_size.
        VSLICE_MAX * self.blocks_per_slice()
    }

    /// First device block of physical slice `pslice`.
    #[must_use]
    pub fn slice_start_block(&self, pslice: Pslice) -> u64 {
        let ByteOffset(bytes) = slice_start(self.disk_size, self.slice_size, pslice);
        bytes / u64::from(self.block_size)
    }
}

// ── Partition state ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    Active,
    /// Destroyed; the object may still be referenced by the framework but
    /// rejects every operation.
    Killed,
}

pub(crate) struct PartitionInner {
    pub(crate) slice_map: SliceMap,
    pub(crate) block_count: u64,
    pub(crate) state: PartitionState,
}

impl PartitionInner {
    /// Map `vslice` to `pslice` and grow the advertised block count.
    pub(crate) fn set_slice(
        &mut self,
        geometry: &Geometry,
        vslice: u64,
        pslice: Pslice,
    ) -> Result<()> {
        self.slice_map.set(vslice, pslice)?;
        self.block_count += geometry.blocks_per_slice();
        Ok(())
    }

    /// Unmap `vslice` and shrink the advertised block count.
    pub(crate) fn free_slice(&mut self, geometry: &Geometry, vslice: u64) -> Result<Pslice> {
        let pslice = self.slice_map.free(vslice)?;
        self.block_count -= geometry.blocks_per_slice();
        Ok(pslice)
    }

    pub(crate) fn is_killed(&self) -> bool {
        self.state == PartitionState::Killed
    }
}

// ── VPartition ──────────────────────────────────────────────────────────────

/// A virtual partition: one entry of the partition table exposed as a block
/// device. Shared between the manager (table updates) and the framework
/// (request dispatch); dropped when the last reference goes away.
pub struct VPartition {
    entry_index: u16,
    device_name: String,
    geometry: Geometry,
    backend: Arc<dyn BlockBackend>,
    pub(crate) inner: Mutex<PartitionInner>,
}

impl VPartition {
    pub(crate) fn new(
        entry_index: u16,
        name: &str,
        geometry: Geometry,
        backend: Arc<dyn BlockBackend>,
    ) -> Arc<Self> {
        Arc::new(Self {
            entry_index,
            device_name: format!("{name}-p-{entry_index}"),
            geometry,
            backend,
            inner: Mutex::new(PartitionInner {
                slice_map: SliceMap::new(),
                block_count: 0,
                state: PartitionState::Active,
            }),
        })
    }

    #[must_use]
    pub fn entry_index(&self) -> u16 {
        self.entry_index
    }

    /// Name the partition is published under.
    #[must_use]
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    #[must_use]
    pub fn state(&self) -> PartitionState {
        self.inner.lock().state
    }

    /// Physical slice backing `vslice`, or `None` when unallocated.
    #[must_use]
    pub fn slice_get(&self, vslice: u64) -> Option<Pslice> {
        self.inner.lock().slice_map.lookup(vslice)
    }

    /// Advertised block geometry. Fails once the partition is destroyed.
    pub fn block_info(&self) -> Result<BlockInfo> {
        let inner = self.inner.lock();
        if inner.is_killed() {
            return Err(VolError::BadState("partition destroyed"));
        }
        Ok(BlockInfo {
            block_size: self.geometry.block_size,
            block_count: inner.block_count,
        })
    }

    /// Length of the uniformly allocated or uniformly free run starting at
    /// `vslice_start`.
    pub fn check_slices(&self, vslice_start: u64) -> Result<SliceRange> {
        if vslice_start >= VSLICE_MAX {
            return Err(VolError::OutOfRange("vslice past address space"));
        }
        let inner = self.inner.lock();
        if inner.is_killed() {
            return Err(VolError::BadState("partition destroyed"));
        }
        Ok(inner.slice_map.range_query(vslice_start, VSLICE_MAX))
    }

    /// Forward a sync barrier to the backing device.
    pub fn sync(&self) -> Result<()> {
        self.backend.sync()
    }

    /// Translate and submit a block request against this partition's
    /// virtual address space. The request's completion observes the final
    /// status; errors detected before submission complete it immediately.
    pub fn queue(&self, mut request: BlockRequest) {
        match request.op {
            BlockOp::Read | BlockOp::Write => {}
            // Barrier: no translation, forward as-is.
            BlockOp::Flush => {
                self.backend.submit(request);
                return;
            }
        }

        if request.length == 0 {
            request.complete(Err(VolError::InvalidArgs("zero-length transfer")));
            return;
        }
        let capacity = self.geometry.capacity_blocks();
        if request.dev_offset >= capacity
            || capacity - request.dev_offset < u64::from(request.length)
        {
            request.complete(Err(VolError::OutOfRange("past virtual capacity")));
            return;
        }

        let k = self.geometry.blocks_per_slice();
        let vslice_first = request.dev_offset / k;
        let vslice_last = (request.dev_offset + u64::from(request.length) - 1) / k;

        let inner = self.inner.lock();

        if vslice_first == vslice_last {
            // Common case: the whole transfer lands in one slice.
            let Some(pslice) = inner.slice_map.lookup(vslice_first) else {
                drop(inner);
                request.complete(Err(VolError::OutOfRange("unallocated slice")));
                return;
            };
            drop(inner);
            request.dev_offset =
                self.geometry.slice_start_block(pslice) + request.dev_offset % k;
            self.backend.submit(request);
            return;
        }

        // The transfer spans several slices: every one must be allocated,
        // and a physically contiguous run still forwards as one request.
        let mut pslices: Vec<Pslice> = Vec::new();
        let count = usize::try_from(vslice_last - vslice_first + 1)
            .unwrap_or_else(|_| unreachable!("span bounded by capacity check"));
        if pslices.try_reserve(count).is_err() {
            drop(inner);
            request.complete(Err(VolError::NoMemory));
            return;
        }
        let mut contiguous = true;
        for vslice in vslice_first..=vslice_last {
            let Some(pslice) = inner.slice_map.lookup(vslice) else {
                drop(inner);
                request.complete(Err(VolError::OutOfRange("unallocated slice")));
                return;
            };
            if let Some(prev) = pslices.last()
                && pslice.0 != prev.0 + 1
            {
                contiguous = false;
            }
            pslices.push(pslice);
        }
        drop(inner);

        if contiguous {
            request.dev_offset =
                self.geometry.slice_start_block(pslices[0]) + request.dev_offset % k;
            self.backend.submit(request);
            return;
        }

        self.scatter(request, &pslices, k);
    }

    /// Fan a non-contiguous multi-slice request out into per-slice
    /// sub-requests sharing one aggregated completion.
    fn scatter(&self, request: BlockRequest, pslices: &[Pslice], k: u64) {
        if pslices.len() > MAX_SPLIT {
            request.complete(Err(VolError::OutOfRange("scatter fan-out too wide")));
            return;
        }

        trace!(
            target: "svol::volume::io",
            event = "scatter",
            partition = self.entry_index,
            pieces = pslices.len(),
            length = request.length
        );

        let BlockRequest {
            op,
            buffer,
            buffer_offset,
            dev_offset,
            length,
            completion,
        } = request;

        let mut subs: Vec<BlockRequest> = Vec::new();
        if subs.try_reserve(pslices.len()).is_err() {
            completion(Err(VolError::NoMemory));
            return;
        }
        let aggregate = ScatterCompletion::new(pslices.len(), completion);

        let first_len = round_up(dev_offset + 1, k) - dev_offset;
        let mut remaining = u64::from(length);
        for (i, &pslice) in pslices.iter().enumerate() {
            let sub_len = if i == 0 {
                first_len
            } else if i == pslices.len() - 1 {
                remaining
            } else {
                k
            };
            debug_assert!(sub_len <= k);
            debug_assert!(sub_len <= remaining);

            let mut sub_dev = self.geometry.slice_start_block(pslice);
            if i == 0 {
                sub_dev += dev_offset % k;
            }
            let sub_buffer_offset = buffer_offset + (u64::from(length) - remaining);
            remaining -= sub_len;

            let record = Arc::clone(&aggregate);
            subs.push(BlockRequest {
                op,
                buffer: buffer.clone(),
                buffer_offset: sub_buffer_offset,
                dev_offset: sub_dev,
                length: u32::try_from(sub_len)
                    .unwrap_or_else(|_| unreachable!("sub length bounded by slice size")),
                completion: Box::new(move |status| record.complete_one(status)),
            });
        }
        debug_assert_eq!(remaining, 0);

        for sub in subs {
            self.backend.submit(sub);
        }
    }
}

impl std::fmt::Debug for VPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VPartition")
            .field("entry_index", &self.entry_index)
            .field("device_name", &self.device_name)
            .finish_non_exhaustive()
    }
}

// ── Completion aggregation ──────────────────────────────────────────────────

/// Shared record for scatter fan-out: counts completions, remembers the
/// first failure, and fires the original completion exactly once when the
/// last sub-request lands. The record outlives the dispatching call; the
/// final `complete_one` releases it.
struct ScatterCompletion {
    inner: Mutex<ScatterState>,
}

struct ScatterState {
    remaining: usize,
    first_error: Option<VolError>,
    original: Option<Completion>,
}

impl ScatterCompletion {
    fn new(total: usize, original: Completion) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(ScatterState {
                remaining: total,
                first_error: None,
                original: Some(original),
            }),
        })
    }

    fn complete_one(&self, status: Result<()>) {
        let mut state = self.inner.lock();
        if let Err(err) = status
            && state.first_error.is_none()
        {
            state.first_error = Some(err);
        }
        state.remaining -= 1;
        if state.remaining > 0 {
            return;
        }
        let original = state
            .original
            .take()
            .unwrap_or_else(|| unreachable!("aggregate completion fired twice"));
        let status = match state.first_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        };
        drop(state);
        original(status);
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
