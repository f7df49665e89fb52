//! The volume manager: metadata owner and slice allocator.
//!
//! All mutable state sits behind one manager lock (`state`); each partition
//! additionally guards its slice map with its own lock, taken only inside
//! the manager lock. Every committed mutation goes through the dual-copy
//! write protocol: bump the generation, seal the region, write it to the
//! copy that is *not* currently primary, and flip the primary marker only
//! after the write lands. A torn write therefore never shadows the last
//! good copy.

use crate::partition::{Geometry, PartitionState, VPartition};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use svol_block::{BlockBackend, BlockInfo};
use svol_error::{Result, VolError};
use svol_ondisk::{Metadata, PartitionEntry, SliceEntry, pick_winner};
use svol_types::{
    ByteOffset, FLAG_ALLOCATE_MASK, Guid, HEADER_BLOCK, MAX_ENTRIES, Pslice, VSLICE_MAX,
    alloc_table_size, metadata_size, partition_table_size,
};
use tracing::{debug, error, info, warn};

// ── Manager state ───────────────────────────────────────────────────────────

struct ManagerState {
    metadata: Metadata,
    /// Which on-disk copy currently holds the winning metadata. Flipped
    /// only after a full copy has been written.
    first_is_primary: bool,
    /// Rotating scan start for physical slice allocation.
    hint: Pslice,
    /// Published partitions by entry index. The framework shares ownership
    /// of the `Arc`s; removal here unpublishes.
    partitions: BTreeMap<u16, Arc<VPartition>>,
}

/// Volume-level geometry summary returned by the query control op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeQuery {
    pub slice_size: u64,
    pub vslice_count: u64,
}

pub struct VolumeManager {
    backend: Arc<dyn BlockBackend>,
    geometry: Geometry,
    state: Mutex<ManagerState>,
}

impl VolumeManager {
    /// Initialize a backing device: write fresh, empty metadata to both
    /// copies. Destroys whatever the device held before.
    pub fn format(backend: &dyn BlockBackend, slice_size: u64) -> Result<()> {
        let info = backend.info();
        if info.block_size == 0 || slice_size % u64::from(info.block_size) != 0 {
            return Err(VolError::InvalidArgs(
                "slice size must be a multiple of the device block size",
            ));
        }
        let disk_size = info
            .block_count
            .checked_mul(u64::from(info.block_size))
            .ok_or(VolError::BadState("backing device size overflow"))?;
        let mut metadata = Metadata::format(disk_size, slice_size)?;
        let region = metadata.seal();
        backend.write_at(ByteOffset(0), &region)?;
        backend.write_at(ByteOffset(metadata.header.metadata_size()), &region)?;
        backend.sync()?;
        info!(
            target: "svol::volume",
            event = "formatted",
            disk_size,
            slice_size,
            pslice_count = metadata.header.pslice_count
        );
        Ok(())
    }

    /// Read and validate the on-disk metadata, build the partition objects,
    /// and release slices left behind by an aborted upgrade.
    pub fn load(backend: Arc<dyn BlockBackend>) -> Result<Arc<Self>> {
        let info = backend.info();
        if info.block_size == 0 {
            return Err(VolError::BadState("backing device reports no block size"));
        }
        let disk_size = info
            .block_count
            .checked_mul(u64::from(info.block_size))
            .ok_or(VolError::BadState("backing device size overflow"))?;

        // Read the superblock first to learn the slice size, without
        // trusting the rest of the header yet.
        let mut first_block = vec![0_u8; HEADER_BLOCK as usize];
        backend.read_at(ByteOffset(0), &mut first_block)?;
        let header = svol_ondisk::Header::parse(&first_block).map_err(|err| {
            error!(target: "svol::volume", event = "superblock_unreadable", %err);
            VolError::BadState("device does not hold a volume superblock")
        })?;

        let slice_size = header.slice_size;
        if slice_size == 0 || slice_size % u64::from(info.block_size) != 0 {
            return Err(VolError::BadState("bad slice size for this device"));
        }
        if slice_size.checked_mul(VSLICE_MAX).is_none() {
            return Err(VolError::BadState(
                "slice size overflows the virtual address space",
            ));
        }
        if header.partition_table_size != partition_table_size()
            || header.alloc_table_size != alloc_table_size(disk_size, slice_size)
        {
            return Err(VolError::BadState("table sizes do not match this device"));
        }

        // Now that the geometry is plausible, read both copies in full and
        // let the validator pick the winner.
        let meta_size = metadata_size(disk_size, slice_size);
        let region_len = usize::try_from(meta_size)
            .map_err(|_| VolError::BadState("metadata region too large"))?;
        let mut primary = vec![0_u8; region_len];
        let mut backup = vec![0_u8; region_len];
        backend.read_at(ByteOffset(0), &mut primary)?;
        backend.read_at(ByteOffset(meta_size), &mut backup)?;
        let validated = pick_winner(&primary, &backup, disk_size, info.block_size)?;

        let geometry = Geometry {
            disk_size,
            slice_size,
            block_size: info.block_size,
        };
        let manager = Arc::new(Self {
            backend,
            geometry,
            state: Mutex::new(ManagerState {
                metadata: validated.metadata,
                first_is_primary: validated.first_is_primary,
                hint: Pslice(1),
                partitions: BTreeMap::new(),
            }),
        });
        let inactive = manager.populate_partitions()?;

        // Slices held by inactive partitions are garbage from an aborted
        // upgrade; release them before anything is exposed.
        for partition in inactive {
            warn!(
                target: "svol::volume",
                event = "inactive_partition_freed",
                entry = partition.entry_index()
            );
            manager.free_slices(&partition, 0, VSLICE_MAX)?;
        }

        {
            let state = manager.state.lock();
            info!(
                target: "svol::volume",
                event = "loaded",
                slice_size,
                pslice_count = state.metadata.header.pslice_count,
                generation = state.metadata.header.generation.0,
                partitions = state.partitions.len()
            );
        }
        Ok(manager)
    }

    /// Build `VPartition` objects for every allocated entry and fill their
    /// slice maps from the allocation table. Returns the partitions whose
    /// entries carry the inactive flag.
    fn populate_partitions(self: &Arc<Self>) -> Result<Vec<Arc<VPartition>>> {
        let mut state = self.state.lock();
        let mut inactive = Vec::new();

        for index in 1..MAX_ENTRIES {
            let index = u16::try_from(index)
                .unwrap_or_else(|_| unreachable!("entry count bounded by table size"));
            let entry = *state.metadata.partition(index);
            if entry.is_free() {
                continue;
            }
            let partition =
                VPartition::new(index, &entry.name(), self.geometry, Arc::clone(&self.backend));
            state.partitions.insert(index, Arc::clone(&partition));
            if entry.is_inactive() {
                inactive.push(partition);
            }
        }

        let pslice_count = state.metadata.header.pslice_count;
        for raw in 1..=pslice_count {
            let pslice = Pslice(
                u32::try_from(raw).unwrap_or_else(|_| unreachable!("count validated at parse")),
            );
            let entry = *state.metadata.slice(pslice);
            if entry.is_free() {
                continue;
            }
            let Some(partition) = state.partitions.get(&entry.vpart).cloned() else {
                // Allocation entry pointing at a free partition entry:
                // tolerated, the slice is simply not surfaced.
                continue;
            };
            if entry.vslice >= VSLICE_MAX {
                return Err(VolError::BadState(
                    "allocation table references an impossible vslice",
                ));
            }
            let mut inner = partition.inner.lock();
            if inner.slice_map.lookup(entry.vslice).is_some() {
                return Err(VolError::BadState(
                    "allocation table maps one vslice twice",
                ));
            }
            inner.set_slice(&self.geometry, entry.vslice, pslice)?;
        }
        Ok(inactive)
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Volume geometry summary: slice size and per-partition vslice count.
    #[must_use]
    pub fn query(&self) -> VolumeQuery {
        VolumeQuery {
            slice_size: self.geometry.slice_size,
            vslice_count: VSLICE_MAX,
        }
    }

    #[must_use]
    pub fn partition(&self, entry_index: u16) -> Option<Arc<VPartition>> {
        self.state.lock().partitions.get(&entry_index).cloned()
    }

    /// Find a published partition by its instance GUID.
    #[must_use]
    pub fn partition_by_guid(&self, guid: &Guid) -> Option<Arc<VPartition>> {
        let state = self.state.lock();
        state
            .partitions
            .iter()
            .find(|&(&index, _)| state.metadata.partition(index).guid == *guid)
            .map(|(_, partition)| Arc::clone(partition))
    }

    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.state.lock().partitions.len()
    }

    /// Snapshot of a partition's table entry (type GUID, instance GUID,
    /// name). Fails once the partition is destroyed.
    pub fn partition_entry(&self, partition: &VPartition) -> Result<PartitionEntry> {
        let state = self.state.lock();
        if partition.state() == PartitionState::Killed {
            return Err(VolError::BadState("partition destroyed"));
        }
        Ok(*state.metadata.partition(partition.entry_index()))
    }

    // ── Allocation ──────────────────────────────────────────────────────

    /// Create a new partition and allocate its initial slices at vslices
    /// `[0, slice_count)`. The new partition is published before return.
    pub fn allocate_partition(
        &self,
        type_guid: Guid,
        guid: Guid,
        name: &str,
        slice_count: u64,
        flags: u32,
    ) -> Result<Arc<VPartition>> {
        if slice_count == 0 || slice_count >= u64::from(u32::MAX) {
            return Err(VolError::OutOfRange("bad slice count"));
        }

        let mut state = self.state.lock();
        // A fully shrunk partition's entry reads as free while its device
        // object lives on; skip indices that are still published.
        let entry_index = {
            let state = &*state;
            (1..MAX_ENTRIES)
                .filter_map(|i| u16::try_from(i).ok())
                .find(|i| {
                    state.metadata.partition(*i).is_free() && !state.partitions.contains_key(i)
                })
        };
        let Some(entry_index) = entry_index else {
            return Err(VolError::NoSpace);
        };
        *state.metadata.partition_mut(entry_index) =
            PartitionEntry::new(type_guid, guid, 0, name, flags & FLAG_ALLOCATE_MASK);

        let partition = VPartition::new(
            entry_index,
            name,
            self.geometry,
            Arc::clone(&self.backend),
        );
        if let Err(err) = self.allocate_slices_locked(&mut state, &partition, 0, slice_count) {
            // Undo the entry claim; the slices were already rolled back.
            state.metadata.partition_mut(entry_index).clear();
            return Err(err);
        }

        state.partitions.insert(entry_index, Arc::clone(&partition));
        info!(
            target: "svol::volume",
            event = "partition_published",
            entry = entry_index,
            device = partition.device_name(),
            slices = slice_count
        );
        Ok(partition)
    }

    /// Allocate `count` physical slices and map them at
    /// `[vslice_start, vslice_start + count)`. All-or-nothing.
    pub fn allocate_slices(
        &self,
        partition: &Arc<VPartition>,
        vslice_start: u64,
        count: u64,
    ) -> Result<()> {
        let mut state = self.state.lock();
        self.allocate_slices_locked(&mut state, partition, vslice_start, count)
    }

    fn allocate_slices_locked(
        &self,
        state: &mut ManagerState,
        partition: &Arc<VPartition>,
        vslice_start: u64,
        count: u64,
    ) -> Result<()> {
        let end = vslice_start
            .checked_add(count)
            .ok_or(VolError::InvalidArgs("vslice range overflow"))?;
        if end > VSLICE_MAX {
            return Err(VolError::InvalidArgs("vslice range past address space"));
        }
        let entry_index = partition.entry_index();

        let mapped = {
            let mut inner = partition.inner.lock();
            if inner.is_killed() {
                return Err(VolError::BadState("partition destroyed"));
            }

            let mut mapped = 0_u64;
            for i in 0..count {
                let vslice = vslice_start + i;
                let step = if inner.slice_map.lookup(vslice).is_some() {
                    Err(VolError::InvalidArgs("vslice already allocated"))
                } else {
                    match Self::find_free_slice(state) {
                        Ok(pslice) => inner.set_slice(&self.geometry, vslice, pslice).map(|()| {
                            *state.metadata.slice_mut(pslice) =
                                SliceEntry::new(entry_index, vslice);
                            state.hint = Pslice(pslice.0 + 1);
                        }),
                        Err(err) => Err(err),
                    }
                };
                if let Err(err) = step {
                    Self::unwind_mappings(
                        state,
                        &mut inner,
                        &self.geometry,
                        vslice_start,
                        mapped,
                    );
                    return Err(err);
                }
                mapped += 1;
            }
            mapped
        };

        let slices = &mut state.metadata.partition_mut(entry_index).slices;
        *slices += u32::try_from(mapped)
            .unwrap_or_else(|_| unreachable!("count bounded by u32 at the control surface"));

        // The commit blocks on device I/O; the partition lock is already
        // released, only the manager lock is held.
        if let Err(err) = self.write_metadata_locked(state) {
            let mut inner = partition.inner.lock();
            Self::unwind_mappings(state, &mut inner, &self.geometry, vslice_start, mapped);
            let slices = &mut state.metadata.partition_mut(entry_index).slices;
            *slices -= u32::try_from(mapped)
                .unwrap_or_else(|_| unreachable!("just added the same amount"));
            return Err(err);
        }
        Ok(())
    }

    /// Undo the first `mapped` mappings of an allocation, newest first.
    /// Frees here pop extent tails and cannot fail.
    fn unwind_mappings(
        state: &mut ManagerState,
        inner: &mut crate::partition::PartitionInner,
        geometry: &Geometry,
        vslice_start: u64,
        mapped: u64,
    ) {
        for j in (0..mapped).rev() {
            let vslice = vslice_start + j;
            if let Ok(pslice) = inner.free_slice(geometry, vslice) {
                *state.metadata.slice_mut(pslice) = SliceEntry::FREE;
            }
        }
    }

    /// Linear scan for a free physical slice starting from the rotating
    /// hint, wrapping around the pool once.
    fn find_free_slice(state: &ManagerState) -> Result<Pslice> {
        let max = u32::try_from(state.metadata.header.pslice_count)
            .unwrap_or_else(|_| unreachable!("count validated at parse"));
        let hint = state.hint.0.clamp(1, max.saturating_add(1));
        for p in (hint..=max).chain(1..hint) {
            if state.metadata.slice(Pslice(p)).is_free() {
                return Ok(Pslice(p));
            }
        }
        Err(VolError::NoSpace)
    }

    // ── Release ─────────────────────────────────────────────────────────

    /// Free `[vslice_start, vslice_start + count)`. The whole-address-space
    /// form (`0, VSLICE_MAX`) destroys the partition: every extent is
    /// released, the table entry is cleared, and the device unpublishes.
    pub fn free_slices(
        &self,
        partition: &Arc<VPartition>,
        vslice_start: u64,
        count: u64,
    ) -> Result<()> {
        let mut state = self.state.lock();
        self.free_slices_locked(&mut state, partition, vslice_start, count)
    }

    fn free_slices_locked(
        &self,
        state: &mut ManagerState,
        partition: &Arc<VPartition>,
        vslice_start: u64,
        count: u64,
    ) -> Result<()> {
        let end = vslice_start
            .checked_add(count)
            .ok_or(VolError::InvalidArgs("vslice range overflow"))?;
        if end > VSLICE_MAX || count > VSLICE_MAX {
            return Err(VolError::InvalidArgs("vslice range past address space"));
        }
        let entry_index = partition.entry_index();
        let destroy = vslice_start == 0 && count == VSLICE_MAX;

        let freed = {
            let mut inner = partition.inner.lock();
            if inner.is_killed() {
                return Err(VolError::BadState("partition destroyed"));
            }

            // Drain in-flight I/O first so nothing still references a slice
            // once it returns to the free pool.
            self.backend.sync()?;

            if destroy {
                let mut freed = 0_u64;
                while let Some(extent) = inner.slice_map.pop_first_extent() {
                    for (_, pslice) in extent.iter() {
                        *state.metadata.slice_mut(pslice) = SliceEntry::FREE;
                        freed += 1;
                    }
                }
                inner.block_count = 0;
                inner.state = PartitionState::Killed;
                state.metadata.partition_mut(entry_index).clear();
                state.partitions.remove(&entry_index);
                info!(
                    target: "svol::volume",
                    event = "partition_destroyed",
                    entry = entry_index,
                    device = partition.device_name(),
                    slices = freed
                );
                freed.max(1)
            } else {
                let mut freed = 0_u64;
                for i in (0..count).rev() {
                    let vslice = vslice_start + i;
                    if inner.slice_map.lookup(vslice).is_none() {
                        continue;
                    }
                    let pslice = if freed == 0 {
                        // The first free is the only one that can fail: it
                        // may split an extent and need memory. Nothing has
                        // changed yet, so bail without persisting.
                        inner
                            .free_slice(&self.geometry, vslice)
                            .map_err(|_| VolError::NoMemory)?
                    } else {
                        // Descending order: every later free pops an extent
                        // tail and cannot split.
                        inner
                            .free_slice(&self.geometry, vslice)
                            .unwrap_or_else(|_| unreachable!("tail free cannot fail"))
                    };
                    *state.metadata.slice_mut(pslice) = SliceEntry::FREE;
                    freed += 1;
                }
                let entry = state.metadata.partition_mut(entry_index);
                entry.slices = entry.slices.saturating_sub(
                    u32::try_from(freed).unwrap_or_else(|_| unreachable!("freed <= slices")),
                );
                freed
            }
        };

        if freed == 0 {
            return Err(VolError::InvalidArgs("nothing to free"));
        }
        self.write_metadata_locked(state)
    }

    // ── Upgrade ─────────────────────────────────────────────────────────

    /// Atomically activate the inactive partition with `new_guid` and
    /// deactivate the active one with `old_guid` (ignored when the GUIDs
    /// match). The dual-copy commit makes the pair atomic.
    pub fn upgrade(&self, old_guid: &Guid, new_guid: &Guid) -> Result<()> {
        let mut state = self.state.lock();
        let old_guid = (old_guid != new_guid).then_some(old_guid);

        let mut old_index = None;
        let mut new_index = None;
        for index in 1..MAX_ENTRIES {
            let index = u16::try_from(index)
                .unwrap_or_else(|_| unreachable!("entry count bounded by table size"));
            let entry = state.metadata.partition(index);
            if entry.is_free() {
                continue;
            }
            if let Some(old) = old_guid
                && !entry.is_inactive()
                && entry.guid == *old
            {
                old_index = Some(index);
            } else if entry.is_inactive() && entry.guid == *new_guid {
                new_index = Some(index);
            }
        }

        let Some(new_index) = new_index else {
            return Err(VolError::NotFound("no inactive partition with that GUID"));
        };

        if let Some(old_index) = old_index {
            state.metadata.partition_mut(old_index).set_inactive(true);
        }
        state.metadata.partition_mut(new_index).set_inactive(false);

        if let Err(err) = self.write_metadata_locked(&mut state) {
            // Flag flips are infallible; restore the pre-upgrade state.
            if let Some(old_index) = old_index {
                state.metadata.partition_mut(old_index).set_inactive(false);
            }
            state.metadata.partition_mut(new_index).set_inactive(true);
            return Err(err);
        }
        info!(
            target: "svol::volume",
            event = "upgrade_committed",
            old = old_index.unwrap_or(0),
            new = new_index
        );
        Ok(())
    }

    // ── Dual-copy commit ────────────────────────────────────────────────

    /// Write the in-memory metadata to the non-primary copy and flip the
    /// primary marker. On failure the marker is left alone: the old primary
    /// stays valid and the torn copy loses validation on the next load.
    fn write_metadata_locked(&self, state: &mut ManagerState) -> Result<()> {
        state.metadata.header.generation = state.metadata.header.generation.next();
        let region = state.metadata.seal();
        let offset = if state.first_is_primary {
            state.metadata.header.metadata_size()
        } else {
            0
        };
        self.backend.write_at(ByteOffset(offset), &region)?;
        state.first_is_primary = !state.first_is_primary;
        debug!(
            target: "svol::volume",
            event = "metadata_committed",
            generation = state.metadata.header.generation.0,
            first_is_primary = state.first_is_primary
        );
        Ok(())
    }
}

impl std::fmt::Debug for VolumeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeManager")
            .field("geometry", &self.geometry)
            .finish_non_exhaustive()
    }
}

// ── Background bind ─────────────────────────────────────────────────────────

struct BindingShared {
    slot: Mutex<Option<Option<Arc<VolumeManager>>>>,
    ready: Condvar,
}

/// A bind in progress: the manager loads on a background thread so binding
/// returns immediately. Dropping the binding joins the loader.
pub struct VolumeBinding {
    shared: Arc<BindingShared>,
    init: Option<JoinHandle<()>>,
}

impl VolumeBinding {
    /// Start loading `backend` on a background thread.
    #[must_use]
    pub fn bind(backend: Arc<dyn BlockBackend>) -> Self {
        let shared = Arc::new(BindingShared {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let init = thread::Builder::new()
            .name("svol-init".to_owned())
            .spawn(move || {
                let outcome = match VolumeManager::load(backend) {
                    Ok(manager) => Some(manager),
                    Err(err) => {
                        // Failed before publication: detach cleanly.
                        error!(target: "svol::volume", event = "load_failed", %err);
                        None
                    }
                };
                *worker_shared.slot.lock() = Some(outcome);
                worker_shared.ready.notify_all();
            })
            .ok();
        if init.is_none() {
            *shared.slot.lock() = Some(None);
        }
        Self { shared, init }
    }

    /// Block until the load finishes. `None` means the load failed and the
    /// device was never published.
    #[must_use]
    pub fn wait(&self) -> Option<Arc<VolumeManager>> {
        let mut slot = self.shared.slot.lock();
        while slot.is_none() {
            self.shared.ready.wait(&mut slot);
        }
        slot.as_ref().and_then(Clone::clone)
    }
}

impl Drop for VolumeBinding {
    fn drop(&mut self) {
        if let Some(handle) = self.init.take() {
            let _ = handle.join();
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use svol_block::{BlockRequest, DeviceBackend, MemByteDevice};

    const MIB: u64 = 1 << 20;
    const BLOCK: u32 = 512;

    fn formatted(disk_mib: u64) -> (MemByteDevice, Arc<dyn BlockBackend>) {
        let device = MemByteDevice::new(usize::try_from(disk_mib * MIB).unwrap());
        let backend = DeviceBackend::new(device.clone(), BLOCK).unwrap();
        VolumeManager::format(&backend, MIB).unwrap();
        (device, Arc::new(backend))
    }

    fn guid(byte: u8) -> Guid {
        Guid([byte; 16])
    }

    /// Delegating backend that can be armed to fail synchronous writes,
    /// simulating a dead device during the dual-copy commit.
    struct FailingBackend {
        inner: Arc<dyn BlockBackend>,
        fail_writes: AtomicBool,
    }

    impl FailingBackend {
        fn new(inner: Arc<dyn BlockBackend>) -> Arc<Self> {
            Arc::new(Self {
                inner,
                fail_writes: AtomicBool::new(false),
            })
        }

        fn arm(&self) {
            self.fail_writes.store(true, Ordering::SeqCst);
        }

        fn disarm(&self) {
            self.fail_writes.store(false, Ordering::SeqCst);
        }
    }

    impl BlockBackend for FailingBackend {
        fn info(&self) -> BlockInfo {
            self.inner.info()
        }

        fn submit(&self, request: BlockRequest) {
            self.inner.submit(request);
        }

        fn sync(&self) -> Result<()> {
            self.inner.sync()
        }

        fn read_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
            self.inner.read_at(offset, buf)
        }

        fn write_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(VolError::Io(std::io::Error::other("injected write failure")));
            }
            self.inner.write_at(offset, buf)
        }
    }

    #[test]
    fn load_fresh_device_has_no_partitions() {
        let (_, backend) = formatted(64);
        let manager = VolumeManager::load(backend).unwrap();
        assert_eq!(manager.partition_count(), 0);
        let query = manager.query();
        assert_eq!(query.slice_size, MIB);
        assert_eq!(query.vslice_count, VSLICE_MAX);
    }

    #[test]
    fn load_rejects_unformatted_device() {
        let device = MemByteDevice::new(usize::try_from(64 * MIB).unwrap());
        let backend: Arc<dyn BlockBackend> =
            Arc::new(DeviceBackend::new(device, BLOCK).unwrap());
        assert!(matches!(
            VolumeManager::load(backend),
            Err(VolError::BadState(_))
        ));
    }

    #[test]
    fn format_requires_aligned_slice_size() {
        let device = MemByteDevice::new(usize::try_from(64 * MIB).unwrap());
        let backend = DeviceBackend::new(device, BLOCK).unwrap();
        assert!(matches!(
            VolumeManager::format(&backend, MIB + 1),
            Err(VolError::InvalidArgs(_))
        ));
    }

    #[test]
    fn allocate_partition_publishes_and_accounts() {
        let (_, backend) = formatted(64);
        let manager = VolumeManager::load(backend).unwrap();
        let partition = manager
            .allocate_partition(guid(1), guid(2), "data", 3, 0)
            .unwrap();

        assert_eq!(manager.partition_count(), 1);
        assert_eq!(partition.device_name(), "data-p-1");
        let info = partition.block_info().unwrap();
        assert_eq!(info.block_count, 3 * MIB / u64::from(BLOCK));
        let entry = manager.partition_entry(&partition).unwrap();
        assert_eq!(entry.slices, 3);
        assert_eq!(entry.name(), "data");
        for vslice in 0..3 {
            assert!(partition.slice_get(vslice).is_some());
        }
        assert!(partition.slice_get(3).is_none());
    }

    #[test]
    fn allocate_partition_validates_slice_count() {
        let (_, backend) = formatted(64);
        let manager = VolumeManager::load(backend).unwrap();
        assert!(matches!(
            manager.allocate_partition(guid(1), guid(2), "p", 0, 0),
            Err(VolError::OutOfRange(_))
        ));
        assert!(matches!(
            manager.allocate_partition(guid(1), guid(2), "p", u64::from(u32::MAX), 0),
            Err(VolError::OutOfRange(_))
        ));
    }

    #[test]
    fn allocation_failure_leaves_no_trace() {
        // 64 MiB device has 63 usable slices; asking for 64 must fail
        // without consuming anything.
        let (_, backend) = formatted(64);
        let manager = VolumeManager::load(backend).unwrap();
        assert!(matches!(
            manager.allocate_partition(guid(1), guid(2), "big", 64, 0),
            Err(VolError::NoSpace)
        ));
        assert_eq!(manager.partition_count(), 0);

        // The whole pool is still available.
        let partition = manager
            .allocate_partition(guid(1), guid(2), "exact", 63, 0)
            .unwrap();
        assert_eq!(manager.partition_entry(&partition).unwrap().slices, 63);
    }

    #[test]
    fn extend_rejects_double_allocation() {
        let (_, backend) = formatted(64);
        let manager = VolumeManager::load(backend).unwrap();
        let partition = manager
            .allocate_partition(guid(1), guid(2), "p", 2, 0)
            .unwrap();

        assert!(matches!(
            manager.allocate_slices(&partition, 1, 2),
            Err(VolError::InvalidArgs(_))
        ));
        // Nothing changed: vslice 2 is still free.
        assert!(partition.slice_get(2).is_none());
        assert_eq!(manager.partition_entry(&partition).unwrap().slices, 2);
    }

    #[test]
    fn allocate_rejects_address_space_overflow() {
        let (_, backend) = formatted(64);
        let manager = VolumeManager::load(backend).unwrap();
        let partition = manager
            .allocate_partition(guid(1), guid(2), "p", 1, 0)
            .unwrap();
        assert!(matches!(
            manager.allocate_slices(&partition, VSLICE_MAX, 1),
            Err(VolError::InvalidArgs(_))
        ));
        assert!(matches!(
            manager.allocate_slices(&partition, u64::MAX, 2),
            Err(VolError::InvalidArgs(_))
        ));
    }

    #[test]
    fn allocation_hint_rotates_through_pool() {
        let (_, backend) = formatted(64);
        let manager = VolumeManager::load(backend).unwrap();
        let first = manager
            .allocate_partition(guid(1), guid(1), "a", 1, 0)
            .unwrap();
        let second = manager
            .allocate_partition(guid(1), guid(2), "b", 1, 0)
            .unwrap();
        assert_eq!(first.slice_get(0), Some(Pslice(1)));
        assert_eq!(second.slice_get(0), Some(Pslice(2)));

        // Destroying the first partition frees pslice 1, but the hint keeps
        // rotating forward instead of reusing it immediately.
        manager.free_slices(&first, 0, VSLICE_MAX).unwrap();
        let third = manager
            .allocate_partition(guid(1), guid(3), "c", 1, 0)
            .unwrap();
        assert_eq!(third.slice_get(0), Some(Pslice(3)));
    }

    #[test]
    fn shrink_of_nothing_is_invalid() {
        let (_, backend) = formatted(64);
        let manager = VolumeManager::load(backend).unwrap();
        let partition = manager
            .allocate_partition(guid(1), guid(2), "p", 2, 0)
            .unwrap();
        assert!(matches!(
            manager.free_slices(&partition, 10, 5),
            Err(VolError::InvalidArgs(_))
        ));
    }

    #[test]
    fn destroy_unpublishes_and_kills() {
        let (_, backend) = formatted(64);
        let manager = VolumeManager::load(backend).unwrap();
        let partition = manager
            .allocate_partition(guid(1), guid(2), "p", 3, 0)
            .unwrap();
        let index = partition.entry_index();

        manager.free_slices(&partition, 0, VSLICE_MAX).unwrap();
        assert_eq!(manager.partition_count(), 0);
        assert!(manager.partition(index).is_none());
        assert_eq!(partition.state(), PartitionState::Killed);
        assert!(matches!(
            partition.block_info(),
            Err(VolError::BadState(_))
        ));
        assert!(matches!(
            manager.allocate_slices(&partition, 5, 1),
            Err(VolError::BadState(_))
        ));
        assert!(matches!(
            manager.free_slices(&partition, 1, 1),
            Err(VolError::BadState(_))
        ));
    }

    #[test]
    fn upgrade_activates_pending_partition() {
        let (_, backend) = formatted(64);
        let manager = VolumeManager::load(backend).unwrap();
        let old = manager
            .allocate_partition(guid(9), guid(1), "system-a", 2, 0)
            .unwrap();
        let new = manager
            .allocate_partition(guid(9), guid(2), "system-b", 2, svol_types::FLAG_INACTIVE)
            .unwrap();
        assert!(manager.partition_entry(&new).unwrap().is_inactive());

        manager.upgrade(&guid(1), &guid(2)).unwrap();
        assert!(manager.partition_entry(&old).unwrap().is_inactive());
        assert!(!manager.partition_entry(&new).unwrap().is_inactive());
    }

    #[test]
    fn upgrade_without_pending_target_fails() {
        let (_, backend) = formatted(64);
        let manager = VolumeManager::load(backend).unwrap();
        manager
            .allocate_partition(guid(9), guid(1), "system-a", 2, 0)
            .unwrap();
        assert!(matches!(
            manager.upgrade(&guid(1), &guid(2)),
            Err(VolError::NotFound(_))
        ));
    }

    #[test]
    fn upgrade_with_equal_guids_skips_deactivation() {
        let (_, backend) = formatted(64);
        let manager = VolumeManager::load(backend).unwrap();
        let partition = manager
            .allocate_partition(guid(9), guid(2), "solo", 1, svol_types::FLAG_INACTIVE)
            .unwrap();
        manager.upgrade(&guid(2), &guid(2)).unwrap();
        assert!(!manager.partition_entry(&partition).unwrap().is_inactive());
    }

    #[test]
    fn commit_failure_rolls_back_allocation() {
        let (_, backend) = formatted(64);
        let failing = FailingBackend::new(backend);
        let shared: Arc<dyn BlockBackend> = failing.clone();
        let manager = VolumeManager::load(shared).unwrap();

        failing.arm();
        assert!(matches!(
            manager.allocate_partition(guid(1), guid(2), "p", 3, 0),
            Err(VolError::Io(_))
        ));
        assert_eq!(manager.partition_count(), 0);

        // The prior on-disk copy is still authoritative; once the device
        // recovers, the same allocation succeeds in full.
        failing.disarm();
        let partition = manager
            .allocate_partition(guid(1), guid(2), "p", 3, 0)
            .unwrap();
        assert_eq!(manager.partition_entry(&partition).unwrap().slices, 3);
        // The rotating hint moved past the unwound slices, so the retry
        // lands further into the pool.
        assert_eq!(partition.slice_get(0), Some(Pslice(4)));
    }

    #[test]
    fn commit_failure_rolls_back_extend() {
        let (_, backend) = formatted(64);
        let failing = FailingBackend::new(backend);
        let shared: Arc<dyn BlockBackend> = failing.clone();
        let manager = VolumeManager::load(shared).unwrap();
        let partition = manager
            .allocate_partition(guid(1), guid(2), "p", 1, 0)
            .unwrap();

        failing.arm();
        assert!(matches!(
            manager.allocate_slices(&partition, 5, 2),
            Err(VolError::Io(_))
        ));
        assert!(partition.slice_get(5).is_none());
        assert!(partition.slice_get(6).is_none());
        assert_eq!(manager.partition_entry(&partition).unwrap().slices, 1);
    }

    #[test]
    fn background_bind_publishes_after_load() {
        let (_, backend) = formatted(64);
        let binding = VolumeBinding::bind(backend);
        let manager = binding.wait().expect("load should succeed");
        assert_eq!(manager.partition_count(), 0);
        assert_eq!(binding.wait().unwrap().query().slice_size, MIB);
    }

    #[test]
    fn background_bind_detaches_on_failure() {
        let device = MemByteDevice::new(usize::try_from(4 * MIB).unwrap());
        let backend: Arc<dyn BlockBackend> =
            Arc::new(DeviceBackend::new(device, BLOCK).unwrap());
        let binding = VolumeBinding::bind(backend);
        assert!(binding.wait().is_none());
    }

    #[test]
    fn reload_restores_partitions_from_disk() {
        let (_, backend) = formatted(64);
        {
            let manager = VolumeManager::load(Arc::clone(&backend)).unwrap();
            manager
                .allocate_partition(guid(1), guid(2), "persist", 4, 0)
                .unwrap();
        }

        let manager = VolumeManager::load(backend).unwrap();
        assert_eq!(manager.partition_count(), 1);
        let partition = manager.partition_by_guid(&guid(2)).unwrap();
        assert_eq!(manager.partition_entry(&partition).unwrap().slices, 4);
        for vslice in 0..4 {
            assert!(partition.slice_get(vslice).is_some());
        }
    }
}
