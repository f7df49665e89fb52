#![forbid(unsafe_code)]
//! On-disk metadata codec.
//!
//! Pure parsing and serialization crate — no I/O, no side effects. Decodes
//! byte regions into a typed model of the superblock header, partition
//! table, and slice allocation table; computes and verifies the integrity
//! digest; and selects the winning copy of the dual-copy metadata.
//!
//! The region layout is:
//!
//! ```text
//! [ header (8 KiB) | partition table (64 KiB) | slice allocation table ]
//! ```
//!
//! with every multi-byte field little-endian. The digest covers the full
//! region with the hash field zeroed.

use serde::{Deserialize, Serialize};
use svol_error::{Result, VolError};
use svol_types::{
    FLAG_INACTIVE, GUID_LEN, Generation, Guid, HEADER_BLOCK, MAGIC, MAX_ENTRIES, NAME_LEN,
    PARTITION_ENTRY_SIZE, ParseError, Pslice, SLICE_ENTRY_SIZE, VERSION, VSLICE_MAX,
    alloc_table_offset, alloc_table_size, ensure_slice, metadata_size, partition_table_offset,
    read_fixed, read_le_u32, read_le_u64, trim_nul_padded, usable_slices, write_fixed,
    write_le_u32, write_le_u64,
};
use tracing::warn;

// ── Header ──────────────────────────────────────────────────────────────────

const HASH_LEN: usize = 32;

const OFF_MAGIC: usize = 0x00;
const OFF_VERSION: usize = 0x08;
const OFF_PSLICE_COUNT: usize = 0x10;
const OFF_SLICE_SIZE: usize = 0x18;
const OFF_DISK_SIZE: usize = 0x20;
const OFF_PARTITION_TABLE_SIZE: usize = 0x28;
const OFF_ALLOC_TABLE_SIZE: usize = 0x30;
const OFF_GENERATION: usize = 0x38;
const OFF_HASH: usize = 0x40;

/// Fixed superblock header at the head of each metadata copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub version: u64,
    /// Usable physical slices on the device.
    pub pslice_count: u64,
    pub slice_size: u64,
    /// Total size of the backing device in bytes.
    pub disk_size: u64,
    pub partition_table_size: u64,
    pub alloc_table_size: u64,
    pub generation: Generation,
    /// Digest over the metadata region with this field zeroed.
    pub hash: [u8; HASH_LEN],
}

impl Header {
    /// Decode the header from the start of a metadata region. Checks magic
    /// and version only; the callers decide how much of the rest to trust.
    pub fn parse(region: &[u8]) -> std::result::Result<Self, ParseError> {
        let magic = read_le_u64(region, OFF_MAGIC)?;
        if magic != MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: MAGIC,
                actual: magic,
            });
        }
        let version = read_le_u64(region, OFF_VERSION)?;
        if version != VERSION {
            return Err(ParseError::InvalidField {
                field: "version",
                reason: "unsupported format version",
            });
        }
        Ok(Self {
            version,
            pslice_count: read_le_u64(region, OFF_PSLICE_COUNT)?,
            slice_size: read_le_u64(region, OFF_SLICE_SIZE)?,
            disk_size: read_le_u64(region, OFF_DISK_SIZE)?,
            partition_table_size: read_le_u64(region, OFF_PARTITION_TABLE_SIZE)?,
            alloc_table_size: read_le_u64(region, OFF_ALLOC_TABLE_SIZE)?,
            generation: Generation(read_le_u64(region, OFF_GENERATION)?),
            hash: read_fixed(region, OFF_HASH)?,
        })
    }

    fn encode(&self, region: &mut [u8]) {
        write_le_u64(region, OFF_MAGIC, MAGIC);
        write_le_u64(region, OFF_VERSION, self.version);
        write_le_u64(region, OFF_PSLICE_COUNT, self.pslice_count);
        write_le_u64(region, OFF_SLICE_SIZE, self.slice_size);
        write_le_u64(region, OFF_DISK_SIZE, self.disk_size);
        write_le_u64(region, OFF_PARTITION_TABLE_SIZE, self.partition_table_size);
        write_le_u64(region, OFF_ALLOC_TABLE_SIZE, self.alloc_table_size);
        write_le_u64(region, OFF_GENERATION, self.generation.0);
        write_fixed(region, OFF_HASH, &self.hash);
    }

    /// Total byte length of one metadata copy as declared by this header.
    #[must_use]
    pub fn metadata_size(&self) -> u64 {
        HEADER_BLOCK + self.partition_table_size + self.alloc_table_size
    }
}

// ── Partition table ─────────────────────────────────────────────────────────

const OFF_ENTRY_TYPE: usize = 0x00;
const OFF_ENTRY_GUID: usize = 0x10;
const OFF_ENTRY_SLICES: usize = 0x20;
const OFF_ENTRY_FLAGS: usize = 0x24;
const OFF_ENTRY_NAME: usize = 0x28;

/// One fixed-size partition-table entry. `slices == 0` means the entry is
/// free; index 0 of the table is a reserved sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionEntry {
    pub type_guid: Guid,
    pub guid: Guid,
    /// Physical slices owned by this partition.
    pub slices: u32,
    pub flags: u32,
    pub name: [u8; NAME_LEN],
}

impl PartitionEntry {
    pub const FREE: Self = Self {
        type_guid: Guid::ZERO,
        guid: Guid::ZERO,
        slices: 0,
        flags: 0,
        name: [0; NAME_LEN],
    };

    /// Populate a free entry for a newly allocated partition.
    #[must_use]
    pub fn new(type_guid: Guid, guid: Guid, slices: u32, name: &str, flags: u32) -> Self {
        let mut field = [0_u8; NAME_LEN];
        let bytes = name.as_bytes();
        let len = bytes.len().min(NAME_LEN);
        field[..len].copy_from_slice(&bytes[..len]);
        Self {
            type_guid,
            guid,
            slices,
            flags,
            name: field,
        }
    }

    fn parse(bytes: &[u8], offset: usize) -> std::result::Result<Self, ParseError> {
        Ok(Self {
            type_guid: Guid(read_fixed::<GUID_LEN>(bytes, offset + OFF_ENTRY_TYPE)?),
            guid: Guid(read_fixed::<GUID_LEN>(bytes, offset + OFF_ENTRY_GUID)?),
            slices: read_le_u32(bytes, offset + OFF_ENTRY_SLICES)?,
            flags: read_le_u32(bytes, offset + OFF_ENTRY_FLAGS)?,
            name: read_fixed::<NAME_LEN>(bytes, offset + OFF_ENTRY_NAME)?,
        })
    }

    fn encode(&self, bytes: &mut [u8], offset: usize) {
        write_fixed(bytes, offset + OFF_ENTRY_TYPE, &self.type_guid.0);
        write_fixed(bytes, offset + OFF_ENTRY_GUID, &self.guid.0);
        write_le_u32(bytes, offset + OFF_ENTRY_SLICES, self.slices);
        write_le_u32(bytes, offset + OFF_ENTRY_FLAGS, self.flags);
        write_fixed(bytes, offset + OFF_ENTRY_NAME, &self.name);
    }

    #[must_use]
    pub fn is_free(&self) -> bool {
        self.slices == 0
    }

    #[must_use]
    pub fn is_inactive(&self) -> bool {
        self.flags & FLAG_INACTIVE != 0
    }

    pub fn set_inactive(&mut self, inactive: bool) {
        if inactive {
            self.flags |= FLAG_INACTIVE;
        } else {
            self.flags &= !FLAG_INACTIVE;
        }
    }

    /// Release the entry back to the free pool.
    pub fn clear(&mut self) {
        *self = Self::FREE;
    }

    #[must_use]
    pub fn name(&self) -> String {
        trim_nul_padded(&self.name)
    }
}

// ── Slice allocation table ──────────────────────────────────────────────────

const SLICE_VPART_BITS: u32 = 16;
const SLICE_VPART_MASK: u64 = (1 << SLICE_VPART_BITS) - 1;
const SLICE_VSLICE_MASK: u64 = (1 << 32) - 1;

/// One slice-allocation-table entry: which partition-table entry owns the
/// physical slice, and which virtual slice it backs. `vpart == 0` means the
/// physical slice is free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SliceEntry {
    pub vpart: u16,
    pub vslice: u64,
}

impl SliceEntry {
    pub const FREE: Self = Self {
        vpart: 0,
        vslice: 0,
    };

    #[must_use]
    pub fn new(vpart: u16, vslice: u64) -> Self {
        debug_assert!(vslice <= VSLICE_MAX);
        Self { vpart, vslice }
    }

    #[must_use]
    pub fn is_free(&self) -> bool {
        self.vpart == 0
    }

    #[must_use]
    pub fn decode(raw: u64) -> Self {
        #[expect(clippy::cast_possible_truncation)]
        let vpart = (raw & SLICE_VPART_MASK) as u16;
        Self {
            vpart,
            vslice: (raw >> SLICE_VPART_BITS) & SLICE_VSLICE_MASK,
        }
    }

    #[must_use]
    pub fn encode(&self) -> u64 {
        u64::from(self.vpart) | ((self.vslice & SLICE_VSLICE_MASK) << SLICE_VPART_BITS)
    }
}

// ── Metadata model ──────────────────────────────────────────────────────────

/// Typed model of one full metadata copy.
///
/// `partitions` always holds `MAX_ENTRIES` entries (index 0 sentinel);
/// `slices` holds `pslice_count + 1` entries (index 0 sentinel). Unused
/// capacity in the on-disk allocation table serializes as zeros.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub header: Header,
    pub partitions: Vec<PartitionEntry>,
    pub slices: Vec<SliceEntry>,
}

impl Metadata {
    /// Build fresh, empty metadata for a device of `disk_size` bytes and
    /// the given slice size. Generation starts at zero; the hash is filled
    /// in by [`Metadata::seal`].
    pub fn format(disk_size: u64, slice_size: u64) -> Result<Self> {
        if slice_size == 0 {
            return Err(VolError::InvalidArgs("slice size must be nonzero"));
        }
        if slice_size.checked_mul(VSLICE_MAX).is_none() {
            return Err(VolError::InvalidArgs(
                "slice size overflows the virtual address space",
            ));
        }
        let pslice_count = usable_slices(disk_size, slice_size);
        if pslice_count == 0 {
            return Err(VolError::NoSpace);
        }
        if pslice_count > u64::from(u32::MAX - 1) {
            return Err(VolError::InvalidArgs(
                "device has more slices than are addressable",
            ));
        }

        let header = Header {
            version: VERSION,
            pslice_count,
            slice_size,
            disk_size,
            partition_table_size: svol_types::partition_table_size(),
            alloc_table_size: alloc_table_size(disk_size, slice_size),
            generation: Generation(0),
            hash: [0; HASH_LEN],
        };
        let table_len = usize::try_from(pslice_count + 1)
            .map_err(|_| VolError::InvalidArgs("slice table too large"))?;
        Ok(Self {
            header,
            partitions: vec![PartitionEntry::FREE; MAX_ENTRIES],
            slices: vec![SliceEntry::FREE; table_len],
        })
    }

    /// Decode a full metadata region.
    pub fn parse(region: &[u8]) -> std::result::Result<Self, ParseError> {
        let header = Header::parse(region)?;
        if header.slice_size == 0 {
            return Err(ParseError::InvalidField {
                field: "slice_size",
                reason: "must be nonzero",
            });
        }
        if header.pslice_count > u64::from(u32::MAX - 1) {
            return Err(ParseError::InvalidField {
                field: "pslice_count",
                reason: "exceeds addressable slices",
            });
        }
        let table_capacity = header.alloc_table_size / SLICE_ENTRY_SIZE;
        if header.pslice_count >= table_capacity {
            return Err(ParseError::InvalidField {
                field: "pslice_count",
                reason: "exceeds allocation table capacity",
            });
        }
        let declared = usize::try_from(header.metadata_size()).map_err(|_| {
            ParseError::IntegerConversion {
                field: "metadata_size",
            }
        })?;
        ensure_slice(region, 0, declared)?;

        let part_base = usize::try_from(partition_table_offset()).map_err(|_| {
            ParseError::IntegerConversion {
                field: "partition_table_offset",
            }
        })?;
        let entry_size = PARTITION_ENTRY_SIZE as usize;
        let mut partitions = Vec::with_capacity(MAX_ENTRIES);
        for i in 0..MAX_ENTRIES {
            partitions.push(PartitionEntry::parse(region, part_base + i * entry_size)?);
        }

        let alloc_base = usize::try_from(alloc_table_offset()).map_err(|_| {
            ParseError::IntegerConversion {
                field: "alloc_table_offset",
            }
        })?;
        let table_len = usize::try_from(header.pslice_count + 1).map_err(|_| {
            ParseError::IntegerConversion {
                field: "pslice_count",
            }
        })?;
        let mut slices = Vec::with_capacity(table_len);
        for i in 0..table_len {
            let raw = read_le_u64(region, alloc_base + i * SLICE_ENTRY_SIZE as usize)?;
            slices.push(SliceEntry::decode(raw));
        }

        Ok(Self {
            header,
            partitions,
            slices,
        })
    }

    /// Encode the model to a full metadata region, emitting the stored hash
    /// verbatim. Use [`Metadata::seal`] to produce a committable region.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let size = usize::try_from(self.header.metadata_size()).unwrap_or(0);
        let mut region = vec![0_u8; size];
        self.header.encode(&mut region);

        let part_base = partition_table_offset() as usize;
        let entry_size = PARTITION_ENTRY_SIZE as usize;
        for (i, entry) in self.partitions.iter().enumerate() {
            entry.encode(&mut region, part_base + i * entry_size);
        }

        let alloc_base = alloc_table_offset() as usize;
        for (i, entry) in self.slices.iter().enumerate() {
            write_le_u64(
                &mut region,
                alloc_base + i * SLICE_ENTRY_SIZE as usize,
                entry.encode(),
            );
        }
        region
    }

    /// Serialize with a freshly computed digest, storing the digest back
    /// into the in-memory header so model and region stay coherent.
    #[must_use]
    pub fn seal(&mut self) -> Vec<u8> {
        self.header.hash = [0; HASH_LEN];
        let mut region = Metadata::serialize(self);
        let digest = digest_region(&region);
        self.header.hash = digest;
        write_fixed(&mut region, OFF_HASH, &digest);
        region
    }

    #[must_use]
    pub fn partition(&self, index: u16) -> &PartitionEntry {
        &self.partitions[index as usize]
    }

    pub fn partition_mut(&mut self, index: u16) -> &mut PartitionEntry {
        &mut self.partitions[index as usize]
    }

    #[must_use]
    pub fn slice(&self, pslice: Pslice) -> &SliceEntry {
        &self.slices[pslice.0 as usize]
    }

    pub fn slice_mut(&mut self, pslice: Pslice) -> &mut SliceEntry {
        &mut self.slices[pslice.0 as usize]
    }

    /// Lowest free partition-table entry index, skipping the sentinel.
    #[must_use]
    pub fn find_free_partition(&self) -> Option<u16> {
        (1..MAX_ENTRIES)
            .find(|&i| self.partitions[i].is_free())
            .and_then(|i| u16::try_from(i).ok())
    }
}

// ── Integrity digest ────────────────────────────────────────────────────────

/// Digest the metadata region as stored on disk (hash field already zeroed).
fn digest_region(region: &[u8]) -> [u8; HASH_LEN] {
    *blake3::hash(region).as_bytes()
}

/// Recompute the digest of `region` with the hash field zeroed and compare
/// it against the stored hash.
#[must_use]
pub fn verify_hash(region: &[u8]) -> bool {
    if region.len() < OFF_HASH + HASH_LEN {
        return false;
    }
    let mut scratch = region.to_vec();
    let stored: [u8; HASH_LEN] = match read_fixed(region, OFF_HASH) {
        Ok(hash) => hash,
        Err(_) => return false,
    };
    scratch[OFF_HASH..OFF_HASH + HASH_LEN].fill(0);
    digest_region(&scratch) == stored
}

// ── Copy selection ──────────────────────────────────────────────────────────

/// Outcome of validating the two metadata copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedMetadata {
    pub metadata: Metadata,
    /// True when the first (primary-offset) copy won.
    pub first_is_primary: bool,
}

fn validate_copy(
    which: &'static str,
    region: &[u8],
    disk_size: u64,
    block_size: u32,
) -> std::result::Result<Metadata, ParseError> {
    let meta = Metadata::parse(region)?;
    let header = &meta.header;
    if block_size == 0 || header.slice_size % u64::from(block_size) != 0 {
        return Err(ParseError::InvalidField {
            field: "slice_size",
            reason: "not a multiple of the device block size",
        });
    }
    if header.disk_size != disk_size {
        return Err(ParseError::InvalidField {
            field: "disk_size",
            reason: "does not match the backing device",
        });
    }
    if header.partition_table_size != svol_types::partition_table_size() {
        return Err(ParseError::InvalidField {
            field: "partition_table_size",
            reason: "does not match the derived size",
        });
    }
    if header.alloc_table_size != alloc_table_size(disk_size, header.slice_size) {
        return Err(ParseError::InvalidField {
            field: "alloc_table_size",
            reason: "does not match the derived size",
        });
    }
    if header.pslice_count != usable_slices(disk_size, header.slice_size) {
        return Err(ParseError::InvalidField {
            field: "pslice_count",
            reason: "does not match the derived count",
        });
    }
    let declared = usize::try_from(header.metadata_size()).map_err(|_| {
        ParseError::IntegerConversion {
            field: "metadata_size",
        }
    })?;
    if declared != usize::try_from(metadata_size(disk_size, header.slice_size)).unwrap_or(0) {
        return Err(ParseError::InvalidField {
            field: "metadata_size",
            reason: "does not match the derived size",
        });
    }
    if !verify_hash(&region[..declared]) {
        warn!(target: "svol::ondisk", event = "hash_mismatch", copy = which);
        return Err(ParseError::InvalidField {
            field: "hash",
            reason: "digest mismatch",
        });
    }
    Ok(meta)
}

/// Validate both copies and pick the winner.
///
/// Both valid: higher generation wins, ties go to the first copy. One
/// valid: it wins. Neither: the device does not hold this format.
pub fn pick_winner(
    primary: &[u8],
    backup: &[u8],
    disk_size: u64,
    block_size: u32,
) -> Result<ValidatedMetadata> {
    let first = validate_copy("primary", primary, disk_size, block_size);
    let second = validate_copy("backup", backup, disk_size, block_size);

    match (first, second) {
        (Ok(a), Ok(b)) => {
            let first_wins = a.header.generation >= b.header.generation;
            Ok(ValidatedMetadata {
                metadata: if first_wins { a } else { b },
                first_is_primary: first_wins,
            })
        }
        (Ok(a), Err(err)) => {
            warn!(target: "svol::ondisk", event = "copy_invalid", copy = "backup", %err);
            Ok(ValidatedMetadata {
                metadata: a,
                first_is_primary: true,
            })
        }
        (Err(err), Ok(b)) => {
            warn!(target: "svol::ondisk", event = "copy_invalid", copy = "primary", %err);
            Ok(ValidatedMetadata {
                metadata: b,
                first_is_primary: false,
            })
        }
        (Err(err_a), Err(err_b)) => {
            warn!(
                target: "svol::ondisk",
                event = "no_valid_copy",
                primary_err = %err_a,
                backup_err = %err_b
            );
            Err(VolError::BadState("no valid metadata copy"))
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
