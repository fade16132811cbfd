//! Reverse-map index: which owner holds each physical extent.

pub mod intent;
mod ops;

use crate::error::{AgError, Result};
use crate::index::{BlockForm, IndexFlavor, OrderedIndex};
use crate::types::{ExtLen, Fork, Owner, OwnerInfo};

pub use ops::{rmap_alloc, rmap_delete_exact, rmap_free, rmap_insert_exact, rmap_resize};

/// Length bit marking an unwritten (preallocated) extent.
pub const RMAP_LEN_UNWRITTEN: u32 = 1 << 31;
/// Longest extent a single record can describe.
pub const RMAP_LEN_MAX: ExtLen = RMAP_LEN_UNWRITTEN - 1;
/// Offset bit marking attribute-fork mappings.
pub const RMAP_OFF_ATTR_FORK: u64 = 1 << 63;
/// Offset bit marking block-map btree blocks.
pub const RMAP_OFF_BMBT_BLOCK: u64 = 1 << 62;
/// Bits of the offset field holding the logical offset.
pub const RMAP_OFF_MASK: u64 = (1 << 54) - 1;

/// Magic of reverse-map btree blocks keyed by start block.
pub const RMAP_CRC_MAGIC: u32 = 0x524d_4233; // "RMB3"
/// Magic of reverse-map btree blocks keyed by (start, owner, offset).
pub const RMAPX_CRC_MAGIC: u32 = 0x524d_5833; // "RMX3"
/// Magic of realtime reverse-map btree blocks.
pub const RTRMAP_CRC_MAGIC: u32 = 0x4d41_5052; // "MAPR"

/// Per-record flags.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct RmapFlags {
    /// Mapping belongs to the attribute fork.
    pub attr_fork: bool,
    /// Blocks hold block-map btree nodes.
    pub bmbt_block: bool,
    /// Extent is allocated but unwritten.
    pub unwritten: bool,
}

/// Ordering key of a reverse-map record.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RmapKey {
    /// First block.
    pub start: u64,
    /// Raw owner value.
    pub owner: u64,
    /// Raw offset including the fork and bmbt bits.
    pub offset: u64,
}

/// One reverse mapping: `len` blocks at `start` owned by `owner`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RmapRecord {
    /// First block (AG block, or realtime block for the realtime index).
    pub start: u64,
    /// Length in blocks.
    pub len: ExtLen,
    /// Owner of the blocks.
    pub owner: Owner,
    /// Logical offset of `start` within the owner's fork.
    pub offset: u64,
    /// Fork, bmbt and unwritten flags.
    pub flags: RmapFlags,
}

impl RmapRecord {
    /// Record describing `len` blocks at `start` for `oinfo`.
    pub fn from_owner(start: u64, len: ExtLen, oinfo: &OwnerInfo) -> Self {
        Self {
            start,
            len,
            owner: oinfo.owner,
            offset: if oinfo.has_logical_offset() { oinfo.offset } else { 0 },
            flags: RmapFlags {
                attr_fork: oinfo.fork == Fork::Attr,
                bmbt_block: oinfo.bmbt,
                unwritten: false,
            },
        }
    }

    /// One past the last block.
    pub fn end(&self) -> u64 {
        self.start + u64::from(self.len)
    }

    /// True when the offset field carries a logical file offset.
    pub fn has_logical_offset(&self) -> bool {
        self.owner.is_inode() && !self.flags.bmbt_block
    }

    /// Rejects logical ranges the on-disk offset field cannot hold.
    pub fn check_offset(&self) -> Result<()> {
        if self.has_logical_offset()
            && self.offset.saturating_add(u64::from(self.len)) > RMAP_OFF_MASK + 1
        {
            return Err(AgError::Invalid("logical offset exceeds the reverse mapping format"));
        }
        Ok(())
    }

    /// Offset as stored on disk.
    pub fn raw_offset(&self) -> u64 {
        let mut raw = self.offset & RMAP_OFF_MASK;
        if self.flags.attr_fork {
            raw |= RMAP_OFF_ATTR_FORK;
        }
        if self.flags.bmbt_block {
            raw |= RMAP_OFF_BMBT_BLOCK;
        }
        raw
    }

    /// Ordering key.
    pub fn key(&self) -> RmapKey {
        RmapKey {
            start: self.start,
            owner: self.owner.raw(),
            offset: self.raw_offset(),
        }
    }

    fn from_raw(start: u64, len: ExtLen, unwritten: bool, owner: u64, raw_offset: u64) -> Self {
        Self {
            start,
            len,
            owner: Owner::from_raw(owner),
            offset: raw_offset & RMAP_OFF_MASK,
            flags: RmapFlags {
                attr_fork: raw_offset & RMAP_OFF_ATTR_FORK != 0,
                bmbt_block: raw_offset & RMAP_OFF_BMBT_BLOCK != 0,
                unwritten,
            },
        }
    }
}

/// Records of any owner overlapping the blocks `[start, end)`, in key
/// order.
pub fn rmap_query_range<F>(
    index: &OrderedIndex<F>,
    start: u64,
    end: u64,
) -> impl Iterator<Item = &RmapRecord>
where
    F: IndexFlavor<Key = RmapKey, Rec = RmapRecord>,
{
    let low = RmapKey {
        start: start.saturating_sub(index.longest_extent()).min(end),
        owner: 0,
        offset: 0,
    };
    let bound = RmapKey {
        start: end,
        owner: 0,
        offset: 0,
    };
    index.range(low..bound).filter(move |rec| rec.end() > start)
}

fn put_u32(out: &mut [u8], at: usize, v: u32) {
    out[at..at + 4].copy_from_slice(&v.to_be_bytes());
}

fn put_u64(out: &mut [u8], at: usize, v: u64) {
    out[at..at + 8].copy_from_slice(&v.to_be_bytes());
}

fn get_u32(src: &[u8], at: usize) -> u32 {
    let mut a = [0u8; 4];
    a.copy_from_slice(&src[at..at + 4]);
    u32::from_be_bytes(a)
}

fn get_u64(src: &[u8], at: usize) -> u64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(&src[at..at + 8]);
    u64::from_be_bytes(a)
}

/// Per-AG reverse-map btree.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RmapBtree {
    owner_keys: bool,
}

impl RmapBtree {
    /// Nodes keyed by start block only.
    pub fn plain() -> Self {
        Self { owner_keys: false }
    }

    /// Nodes keyed by (start, owner, offset), with low and high keys.
    pub fn with_owner_keys() -> Self {
        Self { owner_keys: true }
    }

    /// True when nodes carry full keys.
    pub fn has_owner_keys(&self) -> bool {
        self.owner_keys
    }
}

impl IndexFlavor for RmapBtree {
    type Key = RmapKey;
    type Rec = RmapRecord;

    fn name(&self) -> &'static str {
        if self.owner_keys {
            "rmapx"
        } else {
            "rmap"
        }
    }

    fn magic(&self) -> u32 {
        if self.owner_keys {
            RMAPX_CRC_MAGIC
        } else {
            RMAP_CRC_MAGIC
        }
    }

    fn magic_mismatch(&self, found: u32) -> &'static str {
        if found == RMAP_CRC_MAGIC || found == RMAPX_CRC_MAGIC {
            "rmap btree version does not match the filesystem features"
        } else {
            "bad rmap btree magic"
        }
    }

    fn block_form(&self) -> BlockForm {
        BlockForm::Short
    }

    fn rec_len(&self) -> usize {
        24
    }

    fn key_len(&self) -> usize {
        if self.owner_keys {
            2 * 20
        } else {
            4
        }
    }

    fn key_of(&self, rec: &RmapRecord) -> RmapKey {
        rec.key()
    }

    fn extent_len(&self, rec: &RmapRecord) -> u64 {
        u64::from(rec.len)
    }

    fn encode_rec(&self, rec: &RmapRecord, out: &mut [u8]) -> Result<()> {
        let start = u32::try_from(rec.start)
            .map_err(|_| AgError::Invalid("rmap start block exceeds the AG format"))?;
        if rec.len > RMAP_LEN_MAX {
            return Err(AgError::Invalid("rmap length exceeds the record format"));
        }
        rec.check_offset()?;
        let raw_len = if rec.flags.unwritten {
            rec.len | RMAP_LEN_UNWRITTEN
        } else {
            rec.len
        };
        put_u32(out, 0, start);
        put_u32(out, 4, raw_len);
        put_u64(out, 8, rec.owner.raw());
        put_u64(out, 16, rec.raw_offset());
        Ok(())
    }

    fn decode_rec(&self, src: &[u8]) -> RmapRecord {
        let raw_len = get_u32(src, 4);
        RmapRecord::from_raw(
            u64::from(get_u32(src, 0)),
            raw_len & !RMAP_LEN_UNWRITTEN,
            raw_len & RMAP_LEN_UNWRITTEN != 0,
            get_u64(src, 8),
            get_u64(src, 16),
        )
    }
}

/// Reverse-map btree of the realtime device, rooted in an inode.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RtRmapBtree;

const RTRMAP_LEN_UNWRITTEN: u64 = 1 << 63;

impl IndexFlavor for RtRmapBtree {
    type Key = RmapKey;
    type Rec = RmapRecord;

    fn name(&self) -> &'static str {
        "rtrmap"
    }

    fn magic(&self) -> u32 {
        RTRMAP_CRC_MAGIC
    }

    fn block_form(&self) -> BlockForm {
        BlockForm::Long
    }

    fn rec_len(&self) -> usize {
        32
    }

    fn key_len(&self) -> usize {
        2 * 24
    }

    fn key_of(&self, rec: &RmapRecord) -> RmapKey {
        rec.key()
    }

    fn extent_len(&self, rec: &RmapRecord) -> u64 {
        u64::from(rec.len)
    }

    fn encode_rec(&self, rec: &RmapRecord, out: &mut [u8]) -> Result<()> {
        rec.check_offset()?;
        let mut raw_len = u64::from(rec.len);
        if rec.flags.unwritten {
            raw_len |= RTRMAP_LEN_UNWRITTEN;
        }
        put_u64(out, 0, rec.start);
        put_u64(out, 8, raw_len);
        put_u64(out, 16, rec.owner.raw());
        put_u64(out, 24, rec.raw_offset());
        Ok(())
    }

    fn decode_rec(&self, src: &[u8]) -> RmapRecord {
        let raw_len = get_u64(src, 8);
        RmapRecord::from_raw(
            get_u64(src, 0),
            (raw_len & !RTRMAP_LEN_UNWRITTEN) as ExtLen,
            raw_len & RTRMAP_LEN_UNWRITTEN != 0,
            get_u64(src, 16),
            get_u64(src, 24),
        )
    }
}
