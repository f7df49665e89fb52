//! Opcode-dispatched control surface.
//!
//! Commands arrive as `(opcode, request bytes)` and produce response bytes,
//! mirroring an ioctl-style device interface: undersized request or reply
//! buffers fail with `BufferTooSmall`, unknown opcodes with `NotSupported`.
//! The wire layout of every message is little-endian and fixed-size.

use crate::manager::{VolumeManager, VolumeQuery};
use crate::partition::VPartition;
use std::sync::Arc;
use svol_error::{Result, VolError};
use svol_types::{
    GUID_LEN, Guid, MAX_VSLICE_REQUESTS, NAME_LEN, VSLICE_MAX, read_fixed, read_le_u32,
    read_le_u64, trim_nul_padded, write_fixed, write_le_u32, write_le_u64,
};

// ── Opcodes ─────────────────────────────────────────────────────────────────

pub const OP_VOLUME_QUERY: u32 = 0x0101;
pub const OP_VOLUME_ALLOC: u32 = 0x0102;
pub const OP_VOLUME_UPGRADE: u32 = 0x0103;

pub const OP_PART_BLOCK_INFO: u32 = 0x0201;
pub const OP_PART_TYPE_GUID: u32 = 0x0202;
pub const OP_PART_GUID: u32 = 0x0203;
pub const OP_PART_NAME: u32 = 0x0204;
pub const OP_PART_VOLUME_QUERY: u32 = 0x0205;
pub const OP_PART_VSLICE_QUERY: u32 = 0x0206;
pub const OP_PART_EXTEND: u32 = 0x0207;
pub const OP_PART_SHRINK: u32 = 0x0208;
pub const OP_PART_DESTROY: u32 = 0x0209;
pub const OP_PART_SYNC: u32 = 0x020a;

// ── Wire messages ───────────────────────────────────────────────────────────

const VOLUME_QUERY_SIZE: usize = 16;
const ALLOC_REQUEST_SIZE: usize = 68;
const UPGRADE_REQUEST_SIZE: usize = 32;
const EXTEND_REQUEST_SIZE: usize = 16;
const VSLICE_QUERY_REQUEST_SIZE: usize = 8 + 8 * MAX_VSLICE_REQUESTS;
const VSLICE_RANGE_SIZE: usize = 16;
const VSLICE_QUERY_RESPONSE_SIZE: usize = 8 + VSLICE_RANGE_SIZE * MAX_VSLICE_REQUESTS;
const BLOCK_INFO_SIZE: usize = 16;
const NAME_RESPONSE_SIZE: usize = NAME_LEN + 1;

fn encode_volume_query(query: VolumeQuery, output: &mut [u8]) -> Result<usize> {
    if output.len() < VOLUME_QUERY_SIZE {
        return Err(VolError::BufferTooSmall);
    }
    write_le_u64(output, 0, query.slice_size);
    write_le_u64(output, 8, query.vslice_count);
    Ok(VOLUME_QUERY_SIZE)
}

/// Request body for `OP_VOLUME_ALLOC`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocRequest {
    pub slice_count: u64,
    pub type_guid: Guid,
    pub guid: Guid,
    pub name: String,
    pub flags: u32,
}

impl AllocRequest {
    pub fn decode(input: &[u8]) -> Result<Self> {
        if input.len() < ALLOC_REQUEST_SIZE {
            return Err(VolError::BufferTooSmall);
        }
        Ok(Self {
            slice_count: read_le_u64(input, 0).map_err(|_| VolError::BufferTooSmall)?,
            type_guid: Guid(read_fixed::<GUID_LEN>(input, 8).map_err(|_| VolError::BufferTooSmall)?),
            guid: Guid(read_fixed::<GUID_LEN>(input, 24).map_err(|_| VolError::BufferTooSmall)?),
            name: trim_nul_padded(&read_fixed::<NAME_LEN>(input, 40).map_err(|_| VolError::BufferTooSmall)?),
            flags: read_le_u32(input, 64).map_err(|_| VolError::BufferTooSmall)?,
        })
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0_u8; ALLOC_REQUEST_SIZE];
        write_le_u64(&mut out, 0, self.slice_count);
        write_fixed(&mut out, 8, &self.type_guid.0);
        write_fixed(&mut out, 24, &self.guid.0);
        let name = self.name.as_bytes();
        let len = name.len().min(NAME_LEN);
        out[40..40 + len].copy_from_slice(&name[..len]);
        write_le_u32(&mut out, 64, self.flags);
        out
    }
}

/// Request body for `OP_VOLUME_UPGRADE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub old_guid: Guid,
    pub new_guid: Guid,
}

impl UpgradeRequest {
    pub fn decode(input: &[u8]) -> Result<Self> {
        if input.len() < UPGRADE_REQUEST_SIZE {
            return Err(VolError::BufferTooSmall);
        }
        Ok(Self {
            old_guid: Guid(read_fixed::<GUID_LEN>(input, 0).map_err(|_| VolError::BufferTooSmall)?),
            new_guid: Guid(read_fixed::<GUID_LEN>(input, 16).map_err(|_| VolError::BufferTooSmall)?),
        })
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0_u8; UPGRADE_REQUEST_SIZE];
        write_fixed(&mut out, 0, &self.old_guid.0);
        write_fixed(&mut out, 16, &self.new_guid.0);
        out
    }
}

/// Request body for `OP_PART_EXTEND` and `OP_PART_SHRINK`: a range of
/// virtual slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendRequest {
    pub offset: u64,
    pub length: u64,
}

impl ExtendRequest {
    pub fn decode(input: &[u8]) -> Result<Self> {
        if input.len() < EXTEND_REQUEST_SIZE {
            return Err(VolError::BufferTooSmall);
        }
        Ok(Self {
            offset: read_le_u64(input, 0).map_err(|_| VolError::BufferTooSmall)?,
            length: read_le_u64(input, 8).map_err(|_| VolError::BufferTooSmall)?,
        })
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0_u8; EXTEND_REQUEST_SIZE];
        write_le_u64(&mut out, 0, self.offset);
        write_le_u64(&mut out, 8, self.length);
        out
    }

    /// Range validation shared by extend and shrink: offsets start at
    /// vslice 1 and the range must stay inside the address space.
    fn check_bounds(&self) -> Result<()> {
        if self.offset == 0 || self.offset > VSLICE_MAX {
            return Err(VolError::OutOfRange("bad vslice offset"));
        }
        if self.length > VSLICE_MAX {
            return Err(VolError::OutOfRange("bad vslice length"));
        }
        match self.offset.checked_add(self.length) {
            Some(end) if end <= VSLICE_MAX => Ok(()),
            _ => Err(VolError::OutOfRange("vslice range past address space")),
        }
    }
}

/// Request body for `OP_PART_VSLICE_QUERY`: up to `MAX_VSLICE_REQUESTS`
/// range queries in one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VsliceQueryRequest {
    pub starts: Vec<u64>,
}

impl VsliceQueryRequest {
    pub fn decode(input: &[u8]) -> Result<Self> {
        if input.len() < VSLICE_QUERY_REQUEST_SIZE {
            return Err(VolError::BufferTooSmall);
        }
        let count = read_le_u64(input, 0).map_err(|_| VolError::BufferTooSmall)?;
        if count > MAX_VSLICE_REQUESTS as u64 {
            return Err(VolError::BufferTooSmall);
        }
        let count = usize::try_from(count).map_err(|_| VolError::BufferTooSmall)?;
        let mut starts = Vec::with_capacity(count);
        for i in 0..count {
            starts.push(read_le_u64(input, 8 + 8 * i).map_err(|_| VolError::BufferTooSmall)?);
        }
        Ok(Self { starts })
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0_u8; VSLICE_QUERY_REQUEST_SIZE];
        write_le_u64(&mut out, 0, self.starts.len() as u64);
        for (i, start) in self.starts.iter().take(MAX_VSLICE_REQUESTS).enumerate() {
            write_le_u64(&mut out, 8 + 8 * i, *start);
        }
        out
    }
}

/// One decoded range from a vslice-query response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VsliceRange {
    pub count: u64,
    pub allocated: bool,
}

/// Decoded body of a vslice-query response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VsliceQueryResponse {
    pub ranges: Vec<VsliceRange>,
}

impl VsliceQueryResponse {
    pub fn decode(output: &[u8]) -> Result<Self> {
        if output.len() < VSLICE_QUERY_RESPONSE_SIZE {
            return Err(VolError::BufferTooSmall);
        }
        let count = read_le_u64(output, 0).map_err(|_| VolError::BufferTooSmall)?;
        let count = usize::try_from(count)
            .ok()
            .filter(|&c| c <= MAX_VSLICE_REQUESTS)
            .ok_or(VolError::BufferTooSmall)?;
        let mut ranges = Vec::with_capacity(count);
        for i in 0..count {
            let base = 8 + VSLICE_RANGE_SIZE * i;
            ranges.push(VsliceRange {
                count: read_le_u64(output, base).map_err(|_| VolError::BufferTooSmall)?,
                allocated: output[base + 8] != 0,
            });
        }
        Ok(Self { ranges })
    }
}

// ── Volume-level dispatch ───────────────────────────────────────────────────

/// Handle a manager-level control command. Returns the number of response
/// bytes written into `output`.
pub fn volume_ioctl(
    manager: &Arc<VolumeManager>,
    op: u32,
    input: &[u8],
    output: &mut [u8],
) -> Result<usize> {
    match op {
        OP_VOLUME_QUERY => encode_volume_query(manager.query(), output),
        OP_VOLUME_ALLOC => {
            let request = AllocRequest::decode(input)?;
            manager.allocate_partition(
                request.type_guid,
                request.guid,
                &request.name,
                request.slice_count,
                request.flags,
            )?;
            Ok(0)
        }
        OP_VOLUME_UPGRADE => {
            let request = UpgradeRequest::decode(input)?;
            manager.upgrade(&request.old_guid, &request.new_guid)?;
            Ok(0)
        }
        _ => Err(VolError::NotSupported),
    }
}

// ── Partition-level dispatch ────────────────────────────────────────────────

/// Handle a partition-level control command. Returns the number of response
/// bytes written into `output`.
pub fn partition_ioctl(
    manager: &Arc<VolumeManager>,
    partition: &Arc<VPartition>,
    op: u32,
    input: &[u8],
    output: &mut [u8],
) -> Result<usize> {
    match op {
        OP_PART_BLOCK_INFO => {
            if output.len() < BLOCK_INFO_SIZE {
                return Err(VolError::BufferTooSmall);
            }
            let info = partition.block_info()?;
            write_le_u64(output, 0, info.block_count);
            write_le_u32(output, 8, info.block_size);
            write_le_u32(output, 12, 0);
            Ok(BLOCK_INFO_SIZE)
        }
        OP_PART_TYPE_GUID | OP_PART_GUID => {
            if output.len() < GUID_LEN {
                return Err(VolError::BufferTooSmall);
            }
            let entry = manager.partition_entry(partition)?;
            let guid = if op == OP_PART_TYPE_GUID {
                entry.type_guid
            } else {
                entry.guid
            };
            write_fixed(output, 0, &guid.0);
            Ok(GUID_LEN)
        }
        OP_PART_NAME => {
            if output.len() < NAME_RESPONSE_SIZE {
                return Err(VolError::BufferTooSmall);
            }
            let entry = manager.partition_entry(partition)?;
            let name = entry.name();
            output[..NAME_LEN].copy_from_slice(&entry.name);
            output[NAME_LEN] = 0;
            Ok(name.len())
        }
        OP_PART_VOLUME_QUERY => encode_volume_query(manager.query(), output),
        OP_PART_VSLICE_QUERY => {
            let request = VsliceQueryRequest::decode(input)?;
            if output.len() < VSLICE_QUERY_RESPONSE_SIZE {
                return Err(VolError::BufferTooSmall);
            }
            for (i, &start) in request.starts.iter().enumerate() {
                let range = partition.check_slices(start)?;
                let base = 8 + VSLICE_RANGE_SIZE * i;
                write_le_u64(output, base, range.count);
                output[base + 8] = u8::from(range.allocated);
                output[base + 9..base + VSLICE_RANGE_SIZE].fill(0);
            }
            write_le_u64(output, 0, request.starts.len() as u64);
            Ok(VSLICE_QUERY_RESPONSE_SIZE)
        }
        OP_PART_EXTEND => {
            let request = ExtendRequest::decode(input)?;
            request.check_bounds()?;
            if request.length == 0 {
                return Ok(0);
            }
            manager.allocate_slices(partition, request.offset, request.length)?;
            Ok(0)
        }
        OP_PART_SHRINK => {
            let request = ExtendRequest::decode(input)?;
            request.check_bounds()?;
            if request.length == 0 {
                return Ok(0);
            }
            manager.free_slices(partition, request.offset, request.length)?;
            Ok(0)
        }
        OP_PART_DESTROY => {
            manager.free_slices(partition, 0, VSLICE_MAX)?;
            Ok(0)
        }
        OP_PART_SYNC => {
            partition.sync()?;
            Ok(0)
        }
        _ => Err(VolError::NotSupported),
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
