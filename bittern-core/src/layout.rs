//! On-media layout: dual superblocks, per-block metadata array, data area.
//!
//! Layout on the cache device, in order: superblock A, superblock B,
//! the metadata array (`slot_count` fixed 64-byte slots), then the data
//! area (`slot_count` 4 KiB pages). Header writes alternate between A and
//! B so a torn header write never destroys both copies at once.

use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicU64, Ordering};

use static_assertions::const_assert_eq;

use crate::error::{Error, Result};
use crate::hash::{murmurhash3_128, Hash128};

pub const CACHE_BLOCK_SIZE: usize = 4096;
pub const SECTOR_SIZE: usize = 512;
pub const SECTORS_PER_BLOCK: u64 = (CACHE_BLOCK_SIZE / SECTOR_SIZE) as u64;
pub const METADATA_SLOT_SIZE: usize = 64;
pub const HEADER_PAGE_SIZE: u64 = CACHE_BLOCK_SIZE as u64;
pub const SUPERBLOCK_MAGIC: u64 = 0x4269_7474_6572_6e31; // "Bittern1"
pub const METADATA_SLOT_MAGIC: u32 = 0xb17e_5107;
pub const LAYOUT_VERSION: u32 = 1;

/// Sentinel stored in a metadata slot's `sector` field when the slot does
/// not cache any backing-device sector.
pub const SECTOR_INVALID: u64 = u64::MAX;

/// The logical layout variant a pmem implementation exposes. Bittern only
/// ever defines one; the query exists because spec.md requires upper
/// layers to be able to ask for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutVariant {
    /// Single-page-granularity block layout, as implemented here.
    SinglePage,
}

/// On-media cache-block state. Only three of the five in-memory states
/// are ever persisted: the `*_no_data` states are transient staging
/// states that exist only between an invalid->valid allocation and the
/// first data/metadata write, and a restore never observes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OnMediaState {
    Invalid = 0,
    Clean = 1,
    Dirty = 2,
}

impl OnMediaState {
    fn from_u8(v: u8) -> Result<OnMediaState> {
        match v {
            0 => Ok(OnMediaState::Invalid),
            1 => Ok(OnMediaState::Clean),
            2 => Ok(OnMediaState::Dirty),
            other => Err(Error::Corruption(format!(
                "metadata slot declared state {other} out of range"
            ))),
        }
    }
}

/// Fixed 64-byte per-block metadata record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataSlot {
    pub block_id: u32,
    pub state: OnMediaState,
    pub xid: u64,
    /// `None` encodes the on-media `SECTOR_INVALID` sentinel.
    pub sector: Option<u64>,
    pub hash_data: Hash128,
}

const_assert_eq!(METADATA_SLOT_SIZE, 64);

impl MetadataSlot {
    pub fn invalid(block_id: u32) -> MetadataSlot {
        MetadataSlot {
            block_id,
            state: OnMediaState::Invalid,
            xid: 0,
            sector: None,
            hash_data: Hash128::ZERO,
        }
    }

    /// Serializes to the fixed 64-byte wire format: magic(4) block_id(4)
    /// state(1) pad(3) xid(8) sector(8) hash_data(16) hash_metadata(16)
    /// reserved(4), native little-endian.
    pub fn to_bytes(&self) -> [u8; METADATA_SLOT_SIZE] {
        let mut out = [0u8; METADATA_SLOT_SIZE];
        out[0..4].copy_from_slice(&METADATA_SLOT_MAGIC.to_le_bytes());
        out[4..8].copy_from_slice(&self.block_id.to_le_bytes());
        out[8] = self.state as u8;
        // out[9..12] reserved padding, left zero
        out[12..20].copy_from_slice(&self.xid.to_le_bytes());
        out[20..28].copy_from_slice(&self.sector.unwrap_or(SECTOR_INVALID).to_le_bytes());
        out[28..44].copy_from_slice(&self.hash_data.to_bytes());
        let hash_metadata = murmurhash3_128(&out[0..44]);
        out[44..60].copy_from_slice(&hash_metadata.to_bytes());
        // out[60..64] reserved, left zero
        out
    }

    /// Deserializes and verifies `hash_metadata`. A mismatch means the
    /// slot was torn by a crash mid-write; the caller rolls it back to
    /// invalid rather than treating it as fatal corruption.
    pub fn from_bytes(buf: &[u8; METADATA_SLOT_SIZE]) -> std::result::Result<MetadataSlot, TornWrite> {
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let stored_hash = Hash128::from_bytes(buf[44..60].try_into().unwrap());
        let computed_hash = murmurhash3_128(&buf[0..44]);
        if magic != METADATA_SLOT_MAGIC || stored_hash != computed_hash {
            return Err(TornWrite);
        }
        let block_id = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let state_raw = buf[8];
        let state = OnMediaState::from_u8(state_raw).map_err(|_| TornWrite)?;
        let xid = u64::from_le_bytes(buf[12..20].try_into().unwrap());
        let sector_raw = u64::from_le_bytes(buf[20..28].try_into().unwrap());
        let sector = if sector_raw == SECTOR_INVALID { None } else { Some(sector_raw) };
        let hash_data = Hash128::from_bytes(buf[28..44].try_into().unwrap());
        Ok(MetadataSlot { block_id, state, xid, sector, hash_data })
    }
}

/// The slot's `hash_metadata` did not match its contents: a torn write,
/// rolled back to invalid rather than treated as a fatal restore error.
#[derive(Debug, Clone, Copy)]
pub struct TornWrite;

/// Two identical copies at fixed offsets, written alternately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperBlock {
    pub version: u32,
    pub slot_count: u32,
    pub metadata_slot_size: u32,
    pub data_area_offset: u64,
    pub last_xid: u64,
}

impl SuperBlock {
    pub fn to_bytes(&self) -> [u8; HEADER_PAGE_SIZE as usize] {
        let mut out = vec![0u8; HEADER_PAGE_SIZE as usize];
        out[0..8].copy_from_slice(&SUPERBLOCK_MAGIC.to_le_bytes());
        out[8..12].copy_from_slice(&self.version.to_le_bytes());
        out[12..16].copy_from_slice(&self.slot_count.to_le_bytes());
        out[16..20].copy_from_slice(&self.metadata_slot_size.to_le_bytes());
        out[20..28].copy_from_slice(&self.data_area_offset.to_le_bytes());
        out[28..36].copy_from_slice(&self.last_xid.to_le_bytes());
        let checksum = murmurhash3_128(&out[0..36]);
        out[36..52].copy_from_slice(&checksum.to_bytes());
        out.try_into().unwrap()
    }

    fn from_bytes(buf: &[u8]) -> Option<SuperBlock> {
        if buf.len() < 52 {
            return None;
        }
        let magic = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let checksum = Hash128::from_bytes(buf[36..52].try_into().unwrap());
        if magic != SUPERBLOCK_MAGIC || checksum != murmurhash3_128(&buf[0..36]) {
            return None;
        }
        Some(SuperBlock {
            version: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            slot_count: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            metadata_slot_size: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            data_area_offset: u64::from_le_bytes(buf[20..28].try_into().unwrap()),
            last_xid: u64::from_le_bytes(buf[28..36].try_into().unwrap()),
        })
    }
}

pub const SUPERBLOCK_A_OFFSET: u64 = 0;
pub const SUPERBLOCK_B_OFFSET: u64 = HEADER_PAGE_SIZE;
pub const METADATA_AREA_OFFSET: u64 = 2 * HEADER_PAGE_SIZE;

pub fn metadata_slot_offset(slot_index: u32) -> u64 {
    METADATA_AREA_OFFSET + slot_index as u64 * METADATA_SLOT_SIZE as u64
}

pub fn data_area_offset(slot_count: u32) -> u64 {
    let end_of_metadata = METADATA_AREA_OFFSET + slot_count as u64 * METADATA_SLOT_SIZE as u64;
    // Round up to a page boundary so every data page is page-aligned.
    (end_of_metadata + CACHE_BLOCK_SIZE as u64 - 1) / CACHE_BLOCK_SIZE as u64 * CACHE_BLOCK_SIZE as u64
}

pub fn data_page_offset(slot_count: u32, slot_index: u32) -> u64 {
    data_area_offset(slot_count) + slot_index as u64 * CACHE_BLOCK_SIZE as u64
}

/// Minimum cache-device size, in bytes, required to hold `slot_count`
/// cache blocks: two headers, the metadata array, and the data area.
pub fn required_device_size(slot_count: u32) -> u64 {
    data_area_offset(slot_count) + slot_count as u64 * CACHE_BLOCK_SIZE as u64
}

/// Largest `slot_count` that fits in `device_size` bytes, per spec.md
/// §6's "cache device must be a multiple of (slot_size*N + 2*header_size
/// + N*4KiB) for the chosen N" -- `cache-create` solves for N instead of
/// taking it as an argument, since the CLI contract is only the two
/// device paths plus the create/restore verb.
pub fn max_slot_count_for_device_size(device_size: u64) -> u32 {
    let per_slot = METADATA_SLOT_SIZE as u64 + CACHE_BLOCK_SIZE as u64;
    let headers = 2 * HEADER_PAGE_SIZE;
    if device_size <= headers {
        return 0;
    }
    ((device_size - headers) / per_slot) as u32
}

/// Outcome of restoring one slot, already reconciled against the rb-tree
/// for duplicate-sector collisions by the caller.
#[derive(Debug, Clone)]
pub struct RestoredSlot {
    pub block_id: u32,
    pub slot: MetadataSlot,
}

pub struct RestoreOutcome {
    pub slots: Vec<RestoredSlot>,
    pub max_xid: u64,
}

/// Write a fresh header and zero every metadata slot (`cache-create`).
/// Fails if a valid header is already present.
pub fn initialize(file: &std::fs::File, slot_count: u32) -> Result<()> {
    if read_active_superblock(file)?.is_some() {
        return Err(Error::InvalidArgument(
            "cache device already has a valid header; refusing to overwrite".into(),
        ));
    }
    let min_size = required_device_size(slot_count);
    let actual_size = file.metadata()?.len();
    if actual_size < min_size {
        return Err(Error::InvalidArgument(format!(
            "cache device is {actual_size} bytes, need at least {min_size} for {slot_count} slots"
        )));
    }

    let sb = SuperBlock {
        version: LAYOUT_VERSION,
        slot_count,
        metadata_slot_size: METADATA_SLOT_SIZE as u32,
        data_area_offset: data_area_offset(slot_count),
        last_xid: 0,
    };
    file.write_all_at(&sb.to_bytes(), SUPERBLOCK_A_OFFSET)?;
    file.write_all_at(&sb.to_bytes(), SUPERBLOCK_B_OFFSET)?;

    let empty = MetadataSlot::invalid(0);
    for i in 0..slot_count {
        let slot = MetadataSlot { block_id: i + 1, ..empty };
        file.write_all_at(&slot.to_bytes(), metadata_slot_offset(i))?;
    }
    file.sync_all()?;
    Ok(())
}

/// Reads whichever of the two superblock copies is valid and newer.
/// A torn write to one copy is tolerated because the other still reads
/// back cleanly.
pub fn read_active_superblock(file: &std::fs::File) -> Result<Option<SuperBlock>> {
    let mut buf_a = vec![0u8; HEADER_PAGE_SIZE as usize];
    let mut buf_b = vec![0u8; HEADER_PAGE_SIZE as usize];
    let len = file.metadata()?.len();
    if len >= SUPERBLOCK_A_OFFSET + HEADER_PAGE_SIZE {
        let _ = file.read_exact_at(&mut buf_a, SUPERBLOCK_A_OFFSET);
    }
    if len >= SUPERBLOCK_B_OFFSET + HEADER_PAGE_SIZE {
        let _ = file.read_exact_at(&mut buf_b, SUPERBLOCK_B_OFFSET);
    }
    let a = SuperBlock::from_bytes(&buf_a);
    let b = SuperBlock::from_bytes(&buf_b);
    Ok(match (a, b) {
        (Some(a), Some(b)) => Some(if a.last_xid >= b.last_xid { a } else { b }),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    })
}

/// Writes the header to whichever copy is currently stale, so a crash
/// mid-write always leaves one readable copy.
pub fn write_header(file: &std::fs::File, sb: &SuperBlock, write_to_a: bool) -> Result<()> {
    let offset = if write_to_a { SUPERBLOCK_A_OFFSET } else { SUPERBLOCK_B_OFFSET };
    file.write_all_at(&sb.to_bytes(), offset)?;
    Ok(())
}

const RESTORE_WORKERS: usize = 128;

/// Parses the header, then verifies and reconciles every metadata slot in
/// parallel across a fixed pool of restoration workers.
pub fn restore(file: &std::fs::File) -> Result<(SuperBlock, RestoreOutcome)> {
    let sb = read_active_superblock(file)?
        .ok_or_else(|| Error::InvalidArgument("cache device has no valid header".into()))?;

    let worker_count = RESTORE_WORKERS.min(sb.slot_count.max(1) as usize);
    let chunk = (sb.slot_count as usize).div_ceil(worker_count).max(1);

    let results: Vec<Result<Vec<RestoredSlot>>> = std::thread::scope(|scope| {
        let mut handles = Vec::new();
        for start in (0..sb.slot_count as usize).step_by(chunk) {
            let end = (start + chunk).min(sb.slot_count as usize);
            handles.push(scope.spawn(move || restore_range(file, start as u32, end as u32)));
        }
        handles.into_iter().map(|h| h.join().expect("restore worker panicked")).collect()
    });

    let mut all_slots = Vec::with_capacity(sb.slot_count as usize);
    for r in results {
        all_slots.extend(r?);
    }

    // Reconcile duplicate sectors: the higher xid wins, the loser rolls
    // back to invalid. Equal xid on two different slots for the same
    // sector is a fatal inconsistency.
    let mut by_sector: std::collections::HashMap<u64, usize> = std::collections::HashMap::new();
    let mut max_xid = sb.last_xid;
    for (idx, rs) in all_slots.iter().enumerate() {
        max_xid = max_xid.max(rs.slot.xid);
        if let Some(sector) = rs.slot.sector {
            match by_sector.get(&sector) {
                None => {
                    by_sector.insert(sector, idx);
                }
                Some(&other_idx) => {
                    let other_xid = all_slots[other_idx].slot.xid;
                    if other_xid == rs.slot.xid {
                        return Err(Error::Corruption(format!(
                            "sector {sector} cached by two slots with equal xid {}",
                            rs.slot.xid
                        )));
                    } else if rs.slot.xid > other_xid {
                        by_sector.insert(sector, idx);
                    }
                }
            }
        }
    }

    let winners: std::collections::HashSet<usize> = by_sector.values().copied().collect();
    for (idx, rs) in all_slots.iter_mut().enumerate() {
        if rs.slot.sector.is_some() && !winners.contains(&idx) {
            rs.slot = MetadataSlot::invalid(rs.slot.block_id);
        }
    }

    Ok((sb, RestoreOutcome { slots: all_slots, max_xid }))
}

fn restore_range(file: &std::fs::File, start: u32, end: u32) -> Result<Vec<RestoredSlot>> {
    let mut out = Vec::with_capacity((end - start) as usize);
    let mut buf = [0u8; METADATA_SLOT_SIZE];
    for idx in start..end {
        file.read_exact_at(&mut buf, metadata_slot_offset(idx)).map_err(Error::Io)?;
        let slot = match MetadataSlot::from_bytes(&buf) {
            Ok(slot) => slot,
            Err(TornWrite) => MetadataSlot::invalid(idx + 1),
        };
        out.push(RestoredSlot { block_id: idx + 1, slot });
    }
    Ok(out)
}

/// Process-wide monotonic transaction id. Incremented on new work-item
/// creation and on every metadata write; stamped into every slot so
/// restore can pick a winner among colliding sectors.
///
/// Rollover is not implemented, matching the open question in spec.md:
/// a production revision should apply the TCP-sequence-number comparison
/// trick or widen this to 128 bits.
pub struct XidGenerator {
    next: AtomicU64,
}

impl XidGenerator {
    pub fn starting_at(floor: u64) -> XidGenerator {
        XidGenerator { next: AtomicU64::new(floor.wrapping_add(1)) }
    }

    pub fn next(&self) -> u64 {
        let v = self.next.fetch_add(1, Ordering::Relaxed);
        debug_assert!(v < u64::MAX - 1, "xid rollover is not implemented");
        v
    }

    /// Last xid handed out, without allocating a new one. Used when
    /// checkpointing the superblock so a clean shutdown records a
    /// `last_xid` that restore can use as its floor.
    pub fn current(&self) -> u64 {
        self.next.load(Ordering::Relaxed).wrapping_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempfile;

    fn sized_file(len: u64) -> std::fs::File {
        let f = tempfile().unwrap();
        f.set_len(len).unwrap();
        f
    }

    #[test]
    fn max_slot_count_fits_within_required_device_size() {
        let n = max_slot_count_for_device_size(64 * 1024 * 1024);
        assert!(n > 0);
        assert!(required_device_size(n) <= 64 * 1024 * 1024);
        assert!(required_device_size(n + 1) > 64 * 1024 * 1024);
    }

    #[test]
    fn tiny_device_has_no_room_for_slots() {
        assert_eq!(max_slot_count_for_device_size(0), 0);
        assert_eq!(max_slot_count_for_device_size(HEADER_PAGE_SIZE), 0);
    }

    #[test]
    fn metadata_slot_roundtrip() {
        let slot = MetadataSlot {
            block_id: 7,
            state: OnMediaState::Dirty,
            xid: 42,
            sector: Some(12345),
            hash_data: murmurhash3_128(b"hello"),
        };
        let bytes = slot.to_bytes();
        assert_eq!(bytes.len(), METADATA_SLOT_SIZE);
        let parsed = MetadataSlot::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, slot);
    }

    #[test]
    fn torn_metadata_slot_detected() {
        let slot = MetadataSlot::invalid(3);
        let mut bytes = slot.to_bytes();
        bytes[15] ^= 0xFF; // corrupt a byte inside the checksummed region
        assert!(MetadataSlot::from_bytes(&bytes).is_err());
    }

    #[test]
    fn initialize_then_restore_all_invalid() {
        let slot_count = 16;
        let f = sized_file(required_device_size(slot_count));
        initialize(&f, slot_count).unwrap();
        let (sb, outcome) = restore(&f).unwrap();
        assert_eq!(sb.slot_count, slot_count);
        assert_eq!(outcome.slots.len(), slot_count as usize);
        assert!(outcome.slots.iter().all(|rs| rs.slot.state == OnMediaState::Invalid));
        assert_eq!(outcome.max_xid, 0);
    }

    #[test]
    fn initialize_refuses_existing_header() {
        let slot_count = 4;
        let f = sized_file(required_device_size(slot_count));
        initialize(&f, slot_count).unwrap();
        assert!(initialize(&f, slot_count).is_err());
    }

    #[test]
    fn restore_picks_max_xid_on_collision() {
        let slot_count = 16;
        let f = sized_file(required_device_size(slot_count));
        initialize(&f, slot_count).unwrap();

        let loser = MetadataSlot {
            block_id: 4,
            state: OnMediaState::Clean,
            xid: 7,
            sector: Some(200),
            hash_data: murmurhash3_128(b"old"),
        };
        let winner = MetadataSlot {
            block_id: 10,
            state: OnMediaState::Clean,
            xid: 12,
            sector: Some(200),
            hash_data: murmurhash3_128(b"new"),
        };
        f.write_all_at(&loser.to_bytes(), metadata_slot_offset(3)).unwrap();
        f.write_all_at(&winner.to_bytes(), metadata_slot_offset(9)).unwrap();

        let (_, outcome) = restore(&f).unwrap();
        let slot3 = &outcome.slots[3];
        let slot9 = &outcome.slots[9];
        assert_eq!(slot3.slot.state, OnMediaState::Invalid);
        assert_eq!(slot3.slot.sector, None);
        assert_eq!(slot9.slot.sector, Some(200));
        assert!(outcome.max_xid >= 12);
    }

    #[test]
    fn restore_rejects_equal_xid_collision() {
        let slot_count = 16;
        let f = sized_file(required_device_size(slot_count));
        initialize(&f, slot_count).unwrap();
        let a = MetadataSlot {
            block_id: 1,
            state: OnMediaState::Clean,
            xid: 9,
            sector: Some(5),
            hash_data: Hash128::ZERO,
        };
        let b = MetadataSlot { block_id: 2, sector: Some(5), ..a };
        f.write_all_at(&a.to_bytes(), metadata_slot_offset(0)).unwrap();
        f.write_all_at(&b.to_bytes(), metadata_slot_offset(1)).unwrap();
        assert!(restore(&f).is_err());
    }
}
