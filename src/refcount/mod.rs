//! Reference-count index: how many owners share each physical extent.
//!
//! Only shared extents (refcount >= 2) and copy-on-write staging extents
//! (refcount 1) are stored; any block without a record is implicitly owned
//! exactly once.

mod adjust;

use crate::error::{AgError, Result};
use crate::index::{BlockForm, Cursor, IndexFlavor, LookupDir, OrderedIndex};
use crate::types::{AgBlock, AgExtent, ExtLen};

pub(crate) use adjust::{adjust_cow, adjust_refcount, AdjustEnv, FreedExtents};

/// Saturation value: a record at this count is never changed again.
pub const MAX_REFCOUNT: u32 = u32::MAX;
/// Merges never build a record this long.
pub const MAX_REFC_EXTLEN: u64 = u32::MAX as u64;
/// Magic of reference-count btree blocks.
pub const REFC_CRC_MAGIC: u32 = 0x5233_4643; // "R3FC"

/// `len` blocks at `start` are referenced `refcount` times.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RefcountRecord {
    /// First block.
    pub start: AgBlock,
    /// Length in blocks.
    pub len: ExtLen,
    /// Number of owners; 1 only for CoW staging extents.
    pub refcount: u32,
}

impl RefcountRecord {
    /// One past the last block.
    pub fn end(&self) -> u64 {
        u64::from(self.start) + u64::from(self.len)
    }

    /// Staging extent of an in-flight copy-on-write.
    pub fn is_cow_staging(&self) -> bool {
        self.refcount == 1
    }
}

/// Direction of a shared-count adjustment.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Adjustment {
    /// One more owner.
    Increase,
    /// One owner fewer.
    Decrease,
}

impl Adjustment {
    fn delta(self) -> i64 {
        match self {
            Adjustment::Increase => 1,
            Adjustment::Decrease => -1,
        }
    }
}

/// CoW staging transition.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CowAdjustment {
    /// Record a new staging extent.
    Alloc,
    /// Drop a staging extent.
    Free,
}

impl CowAdjustment {
    fn delta(self) -> i64 {
        match self {
            CowAdjustment::Alloc => 0,
            CowAdjustment::Free => -1,
        }
    }
}

/// Per-AG reference-count btree.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RefcountBtree;

impl IndexFlavor for RefcountBtree {
    type Key = AgBlock;
    type Rec = RefcountRecord;

    fn name(&self) -> &'static str {
        "refcount"
    }

    fn magic(&self) -> u32 {
        REFC_CRC_MAGIC
    }

    fn block_form(&self) -> BlockForm {
        BlockForm::Short
    }

    fn rec_len(&self) -> usize {
        12
    }

    fn key_len(&self) -> usize {
        4
    }

    fn key_of(&self, rec: &RefcountRecord) -> AgBlock {
        rec.start
    }

    fn extent_len(&self, rec: &RefcountRecord) -> u64 {
        u64::from(rec.len)
    }

    fn encode_rec(&self, rec: &RefcountRecord, out: &mut [u8]) -> Result<()> {
        if rec.len == 0 {
            return Err(AgError::Invalid("refcount record with zero length"));
        }
        out[0..4].copy_from_slice(&rec.start.to_be_bytes());
        out[4..8].copy_from_slice(&rec.len.to_be_bytes());
        out[8..12].copy_from_slice(&rec.refcount.to_be_bytes());
        Ok(())
    }

    fn decode_rec(&self, src: &[u8]) -> RefcountRecord {
        let field = |at: usize| u32::from_be_bytes([src[at], src[at + 1], src[at + 2], src[at + 3]]);
        RefcountRecord {
            start: field(0),
            len: field(4),
            refcount: field(8),
        }
    }
}

/// Finds the first shared sub-range of `[agbno, agbno+aglen)`. With
/// `find_maximal` the result is extended through every contiguous shared
/// record; otherwise it stops at the first record's end.
pub fn find_shared(
    cur: &mut Cursor<'_, RefcountBtree>,
    agbno: AgBlock,
    aglen: ExtLen,
    find_maximal: bool,
) -> Result<Option<AgExtent>> {
    let end = u64::from(agbno) + u64::from(aglen);
    if !cur.lookup(&agbno, LookupDir::Le)? {
        cur.increment()?;
    }
    let mut rec = loop {
        let Some(rec) = cur.get_rec()? else {
            return Ok(None);
        };
        if rec.end() > u64::from(agbno) && rec.refcount >= 2 {
            break rec;
        }
        if !cur.increment()? {
            return Ok(None);
        }
    };
    if u64::from(rec.start) >= end {
        return Ok(None);
    }
    let fbno = rec.start.max(agbno);
    let mut fend = rec.end().min(end);
    while find_maximal && fend < end {
        if !cur.increment()? {
            break;
        }
        match cur.get_rec()? {
            Some(next) if u64::from(next.start) == fend && next.refcount >= 2 => {
                rec = next;
                fend = rec.end().min(end);
            }
            _ => break,
        }
    }
    Ok(Some(AgExtent {
        start: fbno,
        len: (fend - u64::from(fbno)) as ExtLen,
    }))
}

/// Every CoW staging extent in the index.
pub fn cow_staging_extents(index: &OrderedIndex<RefcountBtree>) -> Vec<AgExtent> {
    index
        .iter()
        .filter(|rec| rec.is_cow_staging())
        .map(|rec| AgExtent {
            start: rec.start,
            len: rec.len,
        })
        .collect()
}
