#![forbid(unsafe_code)]
//! slicevol public API facade.
//!
//! Re-exports the volume manager, the backing-device traits, and the
//! on-disk codec through a single crate. This is what downstream consumers
//! (the CLI, embedders) depend on.

pub use svol_block::{
    BlockBackend, BlockInfo, BlockOp, BlockRequest, ByteDevice, Completion, DeviceBackend,
    FileByteDevice, IoBuffer, MemByteDevice,
};
pub use svol_error::{Result, VolError};
pub use svol_extent::{SliceExtent, SliceMap, SliceRange};
pub use svol_ondisk::{Header, Metadata, PartitionEntry, SliceEntry, ValidatedMetadata,
    pick_winner, verify_hash};
pub use svol_types::{
    ByteOffset, FLAG_INACTIVE, GUID_LEN, Generation, Guid, HEADER_BLOCK, MAX_ENTRIES,
    MAX_VSLICE_REQUESTS, NAME_LEN, ParseError, Pslice, VSLICE_MAX, metadata_size, slice_start,
    usable_slices,
};
pub use svol_volume::{
    AllocRequest, ExtendRequest, Geometry, MAX_SPLIT, PartitionState, UpgradeRequest,
    VPartition, VolumeBinding, VolumeManager, VolumeQuery, VsliceQueryRequest,
    VsliceQueryResponse, VsliceRange, partition_ioctl, volume_ioctl,
};
