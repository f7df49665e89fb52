#![forbid(unsafe_code)]
//! End-to-end scenarios over an in-memory backing device: format, load,
//! partition lifecycle, data-path round trips, crash recovery, upgrade.

use parking_lot::Mutex;
use std::sync::Arc;
use svol_block::{
    BlockBackend, BlockOp, BlockRequest, ByteDevice, DeviceBackend, FileByteDevice, IoBuffer,
    MemByteDevice,
};
use svol_error::{Result, VolError};
use svol_types::{ByteOffset, FLAG_INACTIVE, Guid, Pslice, VSLICE_MAX, metadata_size};
use svol_volume::{
    AllocRequest, ExtendRequest, OP_PART_BLOCK_INFO, OP_PART_DESTROY, OP_PART_EXTEND,
    OP_PART_GUID, OP_PART_NAME, OP_PART_SHRINK, OP_PART_TYPE_GUID, OP_PART_VSLICE_QUERY,
    OP_VOLUME_ALLOC, OP_VOLUME_QUERY, OP_VOLUME_UPGRADE, UpgradeRequest, VPartition,
    VolumeManager, VsliceQueryRequest, VsliceQueryResponse, partition_ioctl, volume_ioctl,
};

const MIB: u64 = 1 << 20;
const BLOCK: u32 = 512;
/// Blocks per 1 MiB slice at a 512-byte block size.
const K: u64 = 2048;

fn formatted_device(disk_mib: u64) -> (MemByteDevice, Arc<dyn BlockBackend>) {
    let device = MemByteDevice::new(usize::try_from(disk_mib * MIB).unwrap());
    let backend = DeviceBackend::new(device.clone(), BLOCK).unwrap();
    VolumeManager::format(&backend, MIB).unwrap();
    (device, Arc::new(backend))
}

fn reload(device: &MemByteDevice) -> Result<Arc<VolumeManager>> {
    let backend: Arc<dyn BlockBackend> =
        Arc::new(DeviceBackend::new(device.clone(), BLOCK).unwrap());
    VolumeManager::load(backend)
}

fn guid(byte: u8) -> Guid {
    Guid([byte; 16])
}

fn alloc_partition(
    manager: &Arc<VolumeManager>,
    type_guid: Guid,
    instance: Guid,
    name: &str,
    slices: u64,
    flags: u32,
) -> Arc<VPartition> {
    let request = AllocRequest {
        slice_count: slices,
        type_guid,
        guid: instance,
        name: name.to_owned(),
        flags,
    };
    volume_ioctl(manager, OP_VOLUME_ALLOC, &request.encode(), &mut []).unwrap();
    manager.partition_by_guid(&instance).unwrap()
}

/// Issue a read or write through the dispatch path and wait for the
/// aggregated completion.
fn block_io(
    partition: &VPartition,
    op: BlockOp,
    buffer: &IoBuffer,
    offset_blocks: u64,
    length_blocks: u32,
) -> Result<()> {
    let slot: Arc<Mutex<Option<Result<()>>>> = Arc::new(Mutex::new(None));
    let completion_slot = Arc::clone(&slot);
    partition.queue(BlockRequest {
        op,
        buffer: buffer.clone(),
        buffer_offset: 0,
        dev_offset: offset_blocks,
        length: length_blocks,
        completion: Box::new(move |status| {
            *completion_slot.lock() = Some(status);
        }),
    });
    let mut guard = slot.lock();
    guard.take().expect("in-memory backend completes inline")
}

// ── Scenario 1: format and mount ────────────────────────────────────────────

#[test]
fn fresh_volume_reports_geometry_and_no_partitions() {
    let (_, backend) = formatted_device(64);
    let manager = VolumeManager::load(backend).unwrap();

    let mut reply = [0_u8; 16];
    let written = volume_ioctl(&manager, OP_VOLUME_QUERY, &[], &mut reply).unwrap();
    assert_eq!(written, 16);
    assert_eq!(u64::from_le_bytes(reply[0..8].try_into().unwrap()), 1_048_576);
    assert_eq!(
        u64::from_le_bytes(reply[8..16].try_into().unwrap()),
        VSLICE_MAX
    );
    assert_eq!(manager.partition_count(), 0);
}

// ── Scenario 2: allocate, read/write, destroy ───────────────────────────────

#[test]
fn allocate_write_read_destroy() {
    let (_, backend) = formatted_device(64);
    let manager = VolumeManager::load(backend).unwrap();
    let partition = alloc_partition(&manager, guid(0xAA), guid(1), "p", 3, 0);
    let index = partition.entry_index();

    let mut reply = [0_u8; 16];
    partition_ioctl(&manager, &partition, OP_PART_BLOCK_INFO, &[], &mut reply).unwrap();
    let block_count = u64::from_le_bytes(reply[0..8].try_into().unwrap());
    assert_eq!(block_count, 3 * 1_048_576 / 512);

    let payload = IoBuffer::from_vec((0..2048_u32).map(|i| (i % 256) as u8).collect());
    block_io(&partition, BlockOp::Write, &payload, 0, 4).unwrap();
    let readback = IoBuffer::new(2048);
    block_io(&partition, BlockOp::Read, &readback, 0, 4).unwrap();
    assert_eq!(readback.snapshot(), payload.snapshot());

    partition_ioctl(&manager, &partition, OP_PART_DESTROY, &[], &mut []).unwrap();
    assert!(manager.partition(index).is_none());
    assert_eq!(manager.partition_count(), 0);
    assert!(matches!(
        partition_ioctl(&manager, &partition, OP_PART_BLOCK_INFO, &[], &mut reply),
        Err(VolError::BadState(_))
    ));
}

#[test]
fn partition_identity_queries() {
    let (_, backend) = formatted_device(64);
    let manager = VolumeManager::load(backend).unwrap();
    let partition = alloc_partition(&manager, guid(0xAA), guid(1), "blobstore", 1, 0);

    let mut reply = [0_u8; 16];
    partition_ioctl(&manager, &partition, OP_PART_TYPE_GUID, &[], &mut reply).unwrap();
    assert_eq!(reply, [0xAA; 16]);
    partition_ioctl(&manager, &partition, OP_PART_GUID, &[], &mut reply).unwrap();
    assert_eq!(reply, [1; 16]);

    let mut name = [0_u8; 25];
    let actual = partition_ioctl(&manager, &partition, OP_PART_NAME, &[], &mut name).unwrap();
    assert_eq!(actual, "blobstore".len());
    assert_eq!(&name[..actual], b"blobstore");
    assert_eq!(name[24], 0);

    let mut short = [0_u8; 8];
    assert!(matches!(
        partition_ioctl(&manager, &partition, OP_PART_GUID, &[], &mut short),
        Err(VolError::BufferTooSmall)
    ));
}

// ── Scenario 3: shrink mid-extent ───────────────────────────────────────────

#[test]
fn shrink_mid_extent_splits_runs() {
    let (_, backend) = formatted_device(64);
    let manager = VolumeManager::load(backend).unwrap();
    let partition = alloc_partition(&manager, guid(0xAA), guid(1), "p", 1, 0);
    // Drop the initial vslice so the partition holds exactly vslices 1..=4.
    manager.free_slices(&partition, 0, 1).unwrap();
    let extend = ExtendRequest {
        offset: 1,
        length: 4,
    };
    partition_ioctl(&manager, &partition, OP_PART_EXTEND, &extend.encode(), &mut []).unwrap();

    let shrink = ExtendRequest {
        offset: 2,
        length: 1,
    };
    partition_ioctl(&manager, &partition, OP_PART_SHRINK, &shrink.encode(), &mut []).unwrap();

    let query = VsliceQueryRequest {
        starts: vec![1, 2, 3],
    };
    let mut reply = vec![0_u8; 8 + 16 * 16];
    partition_ioctl(
        &manager,
        &partition,
        OP_PART_VSLICE_QUERY,
        &query.encode(),
        &mut reply,
    )
    .unwrap();
    let response = VsliceQueryResponse::decode(&reply).unwrap();
    assert_eq!(response.ranges.len(), 3);
    assert_eq!((response.ranges[0].count, response.ranges[0].allocated), (1, true));
    assert_eq!((response.ranges[1].count, response.ranges[1].allocated), (1, false));
    assert_eq!((response.ranges[2].count, response.ranges[2].allocated), (2, true));
}

// ── Scenario 4: scatter I/O ─────────────────────────────────────────────────

#[test]
fn freed_and_reallocated_slice_scatters_and_round_trips() {
    let (_, backend) = formatted_device(64);
    let manager = VolumeManager::load(backend).unwrap();
    let partition = alloc_partition(&manager, guid(0xAA), guid(1), "p", 3, 0);

    // Free the middle vslice and allocate it again; the rotating hint hands
    // out a different physical slice, breaking physical contiguity.
    manager.free_slices(&partition, 1, 1).unwrap();
    manager.allocate_slices(&partition, 1, 1).unwrap();
    let physical: Vec<_> = (0..3).map(|v| partition.slice_get(v).unwrap()).collect();
    assert_ne!(physical[1], Pslice(2));

    let len = usize::try_from(3 * K * 512).unwrap();
    let pattern: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();
    let payload = IoBuffer::from_vec(pattern.clone());
    block_io(
        &partition,
        BlockOp::Write,
        &payload,
        0,
        u32::try_from(3 * K).unwrap(),
    )
    .unwrap();

    let readback = IoBuffer::new(len);
    block_io(
        &partition,
        BlockOp::Read,
        &readback,
        0,
        u32::try_from(3 * K).unwrap(),
    )
    .unwrap();
    assert_eq!(readback.snapshot(), pattern);
}

// ── Scenario 5: crash recovery ──────────────────────────────────────────────

#[test]
fn torn_primary_copy_falls_back_to_older_generation() {
    let (device, backend) = formatted_device(64);
    let manager = VolumeManager::load(backend).unwrap();
    alloc_partition(&manager, guid(0xAA), guid(1), "p", 3, 0);
    drop(manager);

    // The allocation committed to the second copy and flipped the primary
    // marker. Tear that copy: the loader must fall back to the original,
    // where the partition never existed.
    let meta = metadata_size(64 * MIB, MIB);
    let zeros = vec![0_u8; usize::try_from(meta).unwrap()];
    device.write_all_at(ByteOffset(meta), &zeros).unwrap();

    let manager = reload(&device).unwrap();
    assert_eq!(manager.partition_count(), 0);
    assert!(manager.partition_by_guid(&guid(1)).is_none());
}

#[test]
fn committed_state_survives_reload() {
    let (device, backend) = formatted_device(64);
    {
        let manager = VolumeManager::load(backend).unwrap();
        alloc_partition(&manager, guid(0xAA), guid(1), "p", 3, 0);
    }
    let manager = reload(&device).unwrap();
    let partition = manager.partition_by_guid(&guid(1)).unwrap();
    assert_eq!(manager.partition_entry(&partition).unwrap().slices, 3);
}

// ── Scenario 6: upgrade ─────────────────────────────────────────────────────

#[test]
fn upgrade_swaps_partitions_across_reload() {
    let (device, backend) = formatted_device(64);
    let manager = VolumeManager::load(backend).unwrap();
    alloc_partition(&manager, guid(0xAA), guid(1), "system-a", 2, 0);
    alloc_partition(&manager, guid(0xAA), guid(2), "system-b", 2, FLAG_INACTIVE);

    let request = UpgradeRequest {
        old_guid: guid(1),
        new_guid: guid(2),
    };
    volume_ioctl(&manager, OP_VOLUME_UPGRADE, &request.encode(), &mut []).unwrap();
    drop(manager);

    // After reload the old partition's slices are garbage-collected and
    // only the upgraded one survives.
    let manager = reload(&device).unwrap();
    assert_eq!(manager.partition_count(), 1);
    assert!(manager.partition_by_guid(&guid(1)).is_none());
    let survivor = manager.partition_by_guid(&guid(2)).unwrap();
    let entry = manager.partition_entry(&survivor).unwrap();
    assert!(!entry.is_inactive());
    assert_eq!(entry.name(), "system-b");
    assert_eq!(entry.slices, 2);
}

// ── Cross-cutting invariants ────────────────────────────────────────────────

/// Read the winning on-disk copy straight off the device.
fn winning_metadata(device: &MemByteDevice) -> svol_ondisk::ValidatedMetadata {
    let disk_size = device.len_bytes();
    let meta = usize::try_from(metadata_size(disk_size, MIB)).unwrap();
    let image = device.snapshot();
    svol_ondisk::pick_winner(&image[..meta], &image[meta..2 * meta], disk_size, BLOCK).unwrap()
}

#[test]
fn slice_maps_and_allocation_table_stay_coherent() {
    let (device, backend) = formatted_device(64);
    let manager = VolumeManager::load(backend).unwrap();
    let a = alloc_partition(&manager, guid(0xAA), guid(1), "a", 4, 0);
    let b = alloc_partition(&manager, guid(0xBB), guid(2), "b", 3, 0);
    manager.free_slices(&a, 2, 1).unwrap();
    manager.allocate_slices(&b, 5, 2).unwrap();

    let validated = winning_metadata(&device);
    let metadata = &validated.metadata;

    // Forward direction: every mapped vslice has a matching table entry.
    for partition in [&a, &b] {
        let mut total = 0_u64;
        let mut vslice = 0_u64;
        while vslice < 64 {
            let range = partition.check_slices(vslice).unwrap();
            if range.allocated {
                for v in vslice..vslice + range.count {
                    let pslice = partition.slice_get(v).unwrap();
                    let entry = metadata.slice(pslice);
                    assert_eq!(entry.vpart, partition.entry_index());
                    assert_eq!(entry.vslice, v);
                }
                total += range.count;
            }
            vslice += range.count;
        }
        let entry = metadata.partition(partition.entry_index());
        assert_eq!(total, u64::from(entry.slices));
    }

    // Reverse direction: every allocated table slot is visible in a map.
    for raw in 1..=metadata.header.pslice_count {
        let pslice = Pslice(u32::try_from(raw).unwrap());
        let entry = metadata.slice(pslice);
        if entry.is_free() {
            continue;
        }
        let partition = manager.partition(entry.vpart).unwrap();
        assert_eq!(partition.slice_get(entry.vslice), Some(pslice));
    }
}

#[test]
fn generation_strictly_increases_per_commit() {
    let (device, backend) = formatted_device(64);
    let manager = VolumeManager::load(backend).unwrap();
    let mut last = winning_metadata(&device).metadata.header.generation;

    let partition = alloc_partition(&manager, guid(0xAA), guid(1), "p", 2, 0);
    for step in 0..3 {
        match step {
            0 => manager.allocate_slices(&partition, 5, 1).unwrap(),
            1 => manager.free_slices(&partition, 5, 1).unwrap(),
            _ => manager.free_slices(&partition, 0, VSLICE_MAX).unwrap(),
        }
        let generation = winning_metadata(&device).metadata.header.generation;
        assert!(generation > last, "commit must advance the generation");
        last = generation;
    }
}

#[test]
fn alternate_commits_ping_pong_between_copies() {
    let (device, backend) = formatted_device(64);
    let manager = VolumeManager::load(backend).unwrap();

    alloc_partition(&manager, guid(0xAA), guid(1), "p", 1, 0);
    assert!(!winning_metadata(&device).first_is_primary);

    let partition = manager.partition_by_guid(&guid(1)).unwrap();
    manager.allocate_slices(&partition, 1, 1).unwrap();
    assert!(winning_metadata(&device).first_is_primary);
}

// ── File-backed device ──────────────────────────────────────────────────────

#[test]
fn file_backed_volume_survives_reopen() {
    let file = tempfile::NamedTempFile::new().unwrap();
    file.as_file().set_len(64 * MIB).unwrap();

    {
        let dev = FileByteDevice::open(file.path()).unwrap();
        let backend = DeviceBackend::new(dev, BLOCK).unwrap();
        VolumeManager::format(&backend, MIB).unwrap();
        let manager = VolumeManager::load(Arc::new(backend) as Arc<dyn BlockBackend>).unwrap();
        let partition = alloc_partition(&manager, guid(0xAA), guid(7), "persist", 2, 0);

        let payload = IoBuffer::from_vec(vec![0xC3; 1024]);
        block_io(&partition, BlockOp::Write, &payload, 0, 2).unwrap();
    }

    let dev = FileByteDevice::open(file.path()).unwrap();
    let backend = DeviceBackend::new(dev, BLOCK).unwrap();
    let manager = VolumeManager::load(Arc::new(backend) as Arc<dyn BlockBackend>).unwrap();
    let partition = manager.partition_by_guid(&guid(7)).unwrap();

    let readback = IoBuffer::new(1024);
    block_io(&partition, BlockOp::Read, &readback, 0, 2).unwrap();
    assert_eq!(readback.snapshot(), vec![0xC3; 1024]);
}
