//! Deferred reverse-map updates.
//!
//! Block-map changes decide *what* reverse-map edits they need while the
//! inode is locked, but the edits touch per-AG btrees whose headers must be
//! locked in ascending AG order. Each decision is therefore recorded as an
//! [`RmapIntent`] in an [`IntentQueue`], kept sorted by AG, and applied
//! later by
//! [`Transaction::rmap_apply_queued`](crate::mount::Transaction::rmap_apply_queued).

use tracing::trace;

use crate::error::{corruption, AgError, Result};
use crate::index::{Cursor, IndexFlavor};
use crate::types::{AgNumber, ExtLen, FsBlock, Fork, Geometry, Owner};

use super::{rmap_delete_exact, rmap_insert_exact, rmap_resize, RmapFlags, RmapKey, RmapRecord};

/// A file mapping as the block-map layer sees it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BmapExtent {
    /// Logical offset in the fork.
    pub start_off: u64,
    /// Physical start, or `None` for a delayed allocation.
    pub start_block: Option<FsBlock>,
    /// Length in blocks.
    pub block_count: ExtLen,
    /// Allocated but unwritten.
    pub unwritten: bool,
}

impl BmapExtent {
    /// A mapping to real blocks.
    pub fn real(start_off: u64, start_block: FsBlock, block_count: ExtLen) -> Self {
        Self {
            start_off,
            start_block: Some(start_block),
            block_count,
            unwritten: false,
        }
    }

    /// A delayed allocation with no physical blocks yet.
    pub fn delayed(start_off: u64, block_count: ExtLen) -> Self {
        Self {
            start_off,
            start_block: None,
            block_count,
            unwritten: false,
        }
    }

    /// Marks the mapping unwritten.
    pub fn unwritten(mut self) -> Self {
        self.unwritten = true;
        self
    }
}

/// The reverse-map edit an intent stands for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RmapIntentKind {
    /// `prev` filled the hole between `left` and `right`; all three merge.
    Combine {
        /// Mapping left of `prev`.
        left: BmapExtent,
        /// Mapping right of `prev`.
        right: BmapExtent,
    },
    /// `prev` merged into `left`.
    LeftCombine {
        /// Mapping left of `prev`.
        left: BmapExtent,
    },
    /// `prev` merged into `right`.
    RightCombine {
        /// Mapping right of `prev`.
        right: BmapExtent,
    },
    /// `prev` is a new mapping.
    Insert,
    /// `prev` was unmapped.
    Delete,
    /// `prev`'s start moved by `adj` blocks (physical and logical).
    Move {
        /// Signed adjustment.
        adj: i64,
    },
    /// `prev`'s logical offset moved by `adj`.
    Slide {
        /// Signed adjustment.
        adj: i64,
    },
    /// `prev`'s length changed by `adj`.
    Resize {
        /// Signed adjustment.
        adj: i64,
    },
}

/// One queued reverse-map edit.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RmapIntent {
    /// Edit to perform.
    pub kind: RmapIntentKind,
    /// Inode owning the mappings.
    pub owner: u64,
    /// Fork the mappings belong to.
    pub fork: Fork,
    /// The extent the edit is about.
    pub prev: BmapExtent,
}

impl RmapIntent {
    /// Extent whose physical location decides the AG.
    fn anchor(&self) -> &BmapExtent {
        match &self.kind {
            RmapIntentKind::Combine { left, .. } | RmapIntentKind::LeftCombine { left } => left,
            RmapIntentKind::RightCombine { right } => right,
            _ => &self.prev,
        }
    }

    /// AG whose reverse map the edit touches.
    pub fn agno(&self, geo: &Geometry) -> Result<AgNumber> {
        match self.anchor().start_block {
            Some(fsb) => Ok(geo.fsb_to_agno(fsb)),
            None => Err(AgError::Invalid("intent anchored on a delayed allocation")),
        }
    }
}

#[derive(Debug)]
struct Queued {
    agno: AgNumber,
    intent: RmapIntent,
}

/// Pending reverse-map edits, sorted by AG and FIFO within an AG.
#[derive(Debug)]
pub struct IntentQueue {
    geometry: Geometry,
    items: Vec<Queued>,
}

impl IntentQueue {
    /// Creates an empty queue for a filesystem with `geometry`.
    pub fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            items: Vec::new(),
        }
    }

    /// Number of pending edits.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Pending edits in application order.
    pub fn iter(&self) -> impl Iterator<Item = (AgNumber, &RmapIntent)> {
        self.items.iter().map(|q| (q.agno, &q.intent))
    }

    /// Queues an edit behind every edit of the same or a lower AG.
    pub fn push(&mut self, intent: RmapIntent) -> Result<()> {
        let agno = intent.agno(&self.geometry)?;
        if agno.0 >= self.geometry.ag_count {
            return Err(AgError::Invalid("intent refers to a nonexistent AG"));
        }
        self.items.try_reserve(1).map_err(|_| AgError::NoMemory)?;
        let at = self.items.partition_point(|q| q.agno <= agno);
        trace!(%agno, owner = intent.owner, kind = ?intent.kind, "queue rmap intent");
        self.items.insert(at, Queued { agno, intent });
        Ok(())
    }

    /// Discards every pending edit; returns how many were dropped.
    pub fn cancel(&mut self) -> usize {
        let dropped = self.items.len();
        self.items.clear();
        dropped
    }

    pub(crate) fn take(&mut self) -> Vec<(AgNumber, RmapIntent)> {
        std::mem::take(&mut self.items)
            .into_iter()
            .map(|q| (q.agno, q.intent))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn push_unsorted(&mut self, agno: AgNumber, intent: RmapIntent) {
        self.items.push(Queued { agno, intent });
    }

    fn queue(&mut self, kind: RmapIntentKind, owner: u64, fork: Fork, prev: BmapExtent) -> Result<()> {
        self.push(RmapIntent {
            kind,
            owner,
            fork,
            prev,
        })
    }

    /// `prev` bridges `left` and `right`.
    pub fn combine(
        &mut self,
        owner: u64,
        fork: Fork,
        left: BmapExtent,
        prev: BmapExtent,
        right: BmapExtent,
    ) -> Result<()> {
        self.queue(RmapIntentKind::Combine { left, right }, owner, fork, prev)
    }

    /// `prev` joins `left`.
    pub fn left_combine(
        &mut self,
        owner: u64,
        fork: Fork,
        left: BmapExtent,
        prev: BmapExtent,
    ) -> Result<()> {
        self.queue(RmapIntentKind::LeftCombine { left }, owner, fork, prev)
    }

    /// `prev` joins `right`.
    pub fn right_combine(
        &mut self,
        owner: u64,
        fork: Fork,
        prev: BmapExtent,
        right: BmapExtent,
    ) -> Result<()> {
        self.queue(RmapIntentKind::RightCombine { right }, owner, fork, prev)
    }

    /// `prev` is newly mapped.
    pub fn insert(&mut self, owner: u64, fork: Fork, prev: BmapExtent) -> Result<()> {
        self.queue(RmapIntentKind::Insert, owner, fork, prev)
    }

    /// `prev` is unmapped.
    pub fn delete(&mut self, owner: u64, fork: Fork, prev: BmapExtent) -> Result<()> {
        self.queue(RmapIntentKind::Delete, owner, fork, prev)
    }

    /// `prev`'s start moves by `adj`.
    pub fn move_start(&mut self, owner: u64, fork: Fork, prev: BmapExtent, adj: i64) -> Result<()> {
        self.queue(RmapIntentKind::Move { adj }, owner, fork, prev)
    }

    /// `prev`'s logical offset moves by `adj`.
    pub fn slide(&mut self, owner: u64, fork: Fork, prev: BmapExtent, adj: i64) -> Result<()> {
        self.queue(RmapIntentKind::Slide { adj }, owner, fork, prev)
    }

    /// `prev`'s length changes by `adj`.
    pub fn resize(&mut self, owner: u64, fork: Fork, prev: BmapExtent, adj: i64) -> Result<()> {
        self.queue(RmapIntentKind::Resize { adj }, owner, fork, prev)
    }
}

fn to_record(geo: &Geometry, owner: u64, fork: Fork, ext: &BmapExtent) -> Option<RmapRecord> {
    ext.start_block.map(|fsb| RmapRecord {
        start: u64::from(geo.fsb_to_agbno(fsb)),
        len: ext.block_count,
        owner: Owner::Inode(owner),
        offset: ext.start_off,
        flags: RmapFlags {
            attr_fork: fork == Fork::Attr,
            bmbt_block: false,
            unwritten: ext.unwritten,
        },
    })
}

fn shifted(base: u64, adj: i64) -> Option<u64> {
    if adj >= 0 {
        base.checked_add(adj as u64)
    } else {
        base.checked_sub(adj.unsigned_abs())
    }
}

/// Applies one intent through a cursor on its AG's reverse map.
pub(crate) fn apply_intent<F>(cur: &mut Cursor<'_, F>, geo: &Geometry, intent: &RmapIntent) -> Result<()>
where
    F: IndexFlavor<Key = RmapKey, Rec = RmapRecord>,
{
    let ctx = cur.context();
    let record = |ext: &BmapExtent| to_record(geo, intent.owner, intent.fork, ext);
    let required = |ext: &BmapExtent| {
        record(ext).ok_or_else(|| corruption(ctx, "intent names a delayed allocation"))
    };
    let bad_adjust = || corruption(ctx, "intent adjustment leaves the extent out of range");
    trace!(context = %ctx, owner = intent.owner, kind = ?intent.kind, "apply rmap intent");

    match intent.kind {
        RmapIntentKind::Combine { left, right } => {
            let left = required(&left)?;
            let right = required(&right)?;
            rmap_delete_exact(cur, right)?;
            if let Some(prev) = record(&intent.prev) {
                rmap_delete_exact(cur, prev)?;
            }
            let total = u64::from(left.len)
                + u64::from(intent.prev.block_count)
                + u64::from(right.len);
            rmap_resize(cur, left, total)
        }
        RmapIntentKind::LeftCombine { left } => {
            let left = required(&left)?;
            if let Some(prev) = record(&intent.prev) {
                rmap_delete_exact(cur, prev)?;
            }
            rmap_resize(cur, left, u64::from(left.len) + u64::from(intent.prev.block_count))
        }
        RmapIntentKind::RightCombine { right } => {
            let right = required(&right)?;
            if let Some(prev) = record(&intent.prev) {
                rmap_delete_exact(cur, prev)?;
            }
            let adj = intent.prev.block_count;
            rmap_delete_exact(cur, right)?;
            rmap_insert_exact(
                cur,
                RmapRecord {
                    start: right.start.checked_sub(u64::from(adj)).ok_or_else(bad_adjust)?,
                    offset: right.offset.checked_sub(u64::from(adj)).ok_or_else(bad_adjust)?,
                    len: right.len.checked_add(adj).ok_or_else(bad_adjust)?,
                    ..right
                },
            )
        }
        RmapIntentKind::Insert => rmap_insert_exact(cur, required(&intent.prev)?),
        RmapIntentKind::Delete => rmap_delete_exact(cur, required(&intent.prev)?),
        RmapIntentKind::Move { adj } => {
            let prev = required(&intent.prev)?;
            let len = adj
                .checked_neg()
                .and_then(|neg| shifted(u64::from(prev.len), neg))
                .and_then(|l| ExtLen::try_from(l).ok())
                .ok_or_else(bad_adjust)?;
            let moved = RmapRecord {
                start: shifted(prev.start, adj).ok_or_else(bad_adjust)?,
                offset: shifted(prev.offset, adj).ok_or_else(bad_adjust)?,
                len,
                ..prev
            };
            rmap_delete_exact(cur, prev)?;
            rmap_insert_exact(cur, moved)
        }
        RmapIntentKind::Slide { adj } => {
            let prev = required(&intent.prev)?;
            let slid = RmapRecord {
                offset: shifted(prev.offset, adj).ok_or_else(bad_adjust)?,
                ..prev
            };
            rmap_delete_exact(cur, prev)?;
            rmap_insert_exact(cur, slid)
        }
        RmapIntentKind::Resize { adj } => {
            let prev = required(&intent.prev)?;
            let len = shifted(u64::from(prev.len), adj).ok_or_else(bad_adjust)?;
            rmap_resize(cur, prev, len)
        }
    }
}
