#![forbid(unsafe_code)]

//! Ordered interval index shared by the reverse-map and reference-count
//! btrees.
//!
//! The index keeps records in key order and exposes the positional cursor
//! protocol the domain algorithms are written against (lookup, step,
//! insert, delete, update). Backing blocks are accounted as records come
//! and go: every growth or shrink of the tree is charged to a
//! [`BlockSource`], which is where per-AG reservations hook in.

pub mod block;
mod cursor;

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::ops::RangeBounds;

use crate::error::Result;

pub use block::{BlockEnv, BlockForm, BlockHeader};
pub use cursor::{Cursor, CursorContext, LookupDir};

/// Per-flavor record layout and ordering.
///
/// One implementation exists for each kind of index (reverse map, reverse
/// map with owner keys, reference count, realtime reverse map).
pub trait IndexFlavor {
    /// In-memory ordering key.
    type Key: Ord + Copy + Debug;
    /// Leaf record.
    type Rec: Copy + Debug + PartialEq;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
    /// Block magic number.
    fn magic(&self) -> u32;
    /// Header layout of the btree blocks.
    fn block_form(&self) -> BlockForm;
    /// Encoded leaf record size.
    fn rec_len(&self) -> usize;
    /// Encoded size of one node key slot (low and high keys for
    /// overlapping indexes).
    fn key_len(&self) -> usize;
    /// Key of a record.
    fn key_of(&self, rec: &Self::Rec) -> Self::Key;
    /// Writes `rec` into `out` (exactly `rec_len` bytes).
    fn encode_rec(&self, rec: &Self::Rec, out: &mut [u8]) -> Result<()>;
    /// Reads a record from `src` (exactly `rec_len` bytes).
    fn decode_rec(&self, src: &[u8]) -> Self::Rec;

    /// Blocks spanned by `rec`. Indexes keyed by block ranges report the
    /// record length so range queries can bound their backward reach.
    fn extent_len(&self, _rec: &Self::Rec) -> u64 {
        0
    }

    /// Verifier message for a block carrying `found` instead of our magic.
    fn magic_mismatch(&self, _found: u32) -> &'static str {
        "bad btree block magic"
    }

    /// Encoded node pointer size.
    fn ptr_len(&self) -> usize {
        self.block_form().ptr_len()
    }

    /// Records (leaf) or key/pointer pairs (node) that fit in one block.
    fn maxrecs(&self, block_size: u32, leaf: bool) -> usize {
        let avail = (block_size as usize).saturating_sub(self.block_form().header_len());
        if leaf {
            avail / self.rec_len()
        } else {
            avail / (self.key_len() + self.ptr_len())
        }
    }

    /// Leaf and node fan-out for `block_size`.
    fn limits(&self, block_size: u32) -> [usize; 2] {
        [
            self.maxrecs(block_size, true).max(2),
            self.maxrecs(block_size, false).max(2),
        ]
    }
}

/// Number of blocks a btree needs to hold `records` records when every
/// block is filled to `limits` (leaf, node).
pub fn btree_calc_size(limits: [usize; 2], records: u64) -> u64 {
    let mut len = records;
    let mut maxrecs = limits[0] as u64;
    let mut blocks = 0;
    while len > 1 {
        len = len.div_ceil(maxrecs);
        blocks += len;
        maxrecs = limits[1] as u64;
    }
    blocks
}

/// Height of a btree holding `records` records with fan-out `limits`.
pub fn btree_compute_maxlevels(limits: [usize; 2], records: u64) -> u32 {
    let mut blocks = records.max(1).div_ceil(limits[0] as u64);
    let mut level = 1;
    while blocks > 1 {
        blocks = blocks.div_ceil(limits[1] as u64);
        level += 1;
    }
    level
}

/// Supplies and takes back the blocks a btree grows into.
pub trait BlockSource {
    /// Takes one block for the tree rooted at `ctx`.
    fn alloc_block(&mut self, ctx: CursorContext) -> Result<()>;
    /// Returns one block of the tree rooted at `ctx`.
    fn free_block(&mut self, ctx: CursorContext) -> Result<()>;
}

/// Block source that only counts; used for indexes whose blocks are not
/// drawn from an allocation group.
#[derive(Debug, Default)]
pub struct CountingBlocks {
    /// Blocks handed out and not yet returned.
    pub in_use: u64,
}

impl BlockSource for CountingBlocks {
    fn alloc_block(&mut self, _ctx: CursorContext) -> Result<()> {
        self.in_use += 1;
        Ok(())
    }

    fn free_block(&mut self, _ctx: CursorContext) -> Result<()> {
        self.in_use = self.in_use.saturating_sub(1);
        Ok(())
    }
}

/// An ordered index of records with block accounting.
#[derive(Clone, Debug)]
pub struct OrderedIndex<F: IndexFlavor> {
    flavor: F,
    block_size: u32,
    records: BTreeMap<F::Key, F::Rec>,
    nblocks: u32,
    levels: u32,
    longest: u64,
}

impl<F: IndexFlavor> OrderedIndex<F> {
    /// Creates an empty index with a single root block.
    pub fn new(flavor: F, block_size: u32) -> Self {
        Self {
            flavor,
            block_size,
            records: BTreeMap::new(),
            nblocks: 1,
            levels: 1,
            longest: 0,
        }
    }

    /// Builds an index from records already known to be valid, sizing the
    /// tree to fit them.
    pub(crate) fn from_records(flavor: F, block_size: u32, recs: Vec<F::Rec>) -> Self {
        let mut index = Self::new(flavor, block_size);
        for rec in recs {
            let key = index.flavor.key_of(&rec);
            index.note_extent(&rec);
            index.records.insert(key, rec);
        }
        index.nblocks = index.blocks_for(index.records.len());
        index.levels = index.height_for(index.records.len());
        index
    }

    /// Flavor descriptor.
    pub fn flavor(&self) -> &F {
        &self.flavor
    }

    /// Block size the index was sized for.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when the index holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Blocks currently backing the tree.
    pub fn nblocks(&self) -> u32 {
        self.nblocks
    }

    /// Current tree height.
    pub fn levels(&self) -> u32 {
        self.levels
    }

    /// Longest extent ever stored in the index. Shrinking or deleting a
    /// record does not lower it, so it only ever over-estimates.
    pub fn longest_extent(&self) -> u64 {
        self.longest
    }

    fn note_extent(&mut self, rec: &F::Rec) {
        self.longest = self.longest.max(self.flavor.extent_len(rec));
    }

    /// Record stored under `key`.
    pub fn get(&self, key: &F::Key) -> Option<&F::Rec> {
        self.records.get(key)
    }

    /// All records in key order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &F::Rec> {
        self.records.values()
    }

    /// Records whose keys fall in `range`, in key order.
    pub fn range<R: RangeBounds<F::Key>>(
        &self,
        range: R,
    ) -> impl DoubleEndedIterator<Item = &F::Rec> {
        self.records.range(range).map(|(_, rec)| rec)
    }

    /// Blocks needed to hold `nrecs` records.
    pub fn blocks_for(&self, nrecs: usize) -> u32 {
        let limits = self.flavor.limits(self.block_size);
        btree_calc_size(limits, nrecs as u64).max(1) as u32
    }

    /// Height of a tree holding `nrecs` records.
    pub fn height_for(&self, nrecs: usize) -> u32 {
        btree_compute_maxlevels(self.flavor.limits(self.block_size), nrecs as u64)
    }

    /// Opens a cursor that may modify the index, charging block growth to
    /// `blocks`.
    pub fn cursor<'a>(
        &'a mut self,
        ctx: CursorContext,
        blocks: &'a mut dyn BlockSource,
    ) -> Cursor<'a, F> {
        Cursor::new(self, ctx, Some(blocks))
    }

    /// Opens a cursor that can only look.
    pub fn read_cursor(&mut self, ctx: CursorContext) -> Cursor<'_, F> {
        Cursor::new(self, ctx, None)
    }
}
