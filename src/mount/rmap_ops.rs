use tracing::{debug, trace};

use crate::error::{corruption, AgError, Result};
use crate::index::{Cursor, CursorContext};
use crate::refcount::find_shared;
use crate::rmap::intent::{apply_intent, IntentQueue};
use crate::rmap::{self, rmap_query_range, RmapFlags, RmapRecord, RtRmapBtree};
use crate::types::{AgBlock, AgNumber, ExtLen, FsBlock, Owner, OwnerInfo};

use super::{Mount, Transaction};

/// One row of a filesystem mapping report.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FsMapping {
    /// AG holding the extent.
    pub agno: AgNumber,
    /// First block.
    pub start: FsBlock,
    /// Length in blocks.
    pub len: ExtLen,
    /// Owner of the blocks.
    pub owner: Owner,
    /// Logical offset within the owner's fork.
    pub offset: u64,
    /// Fork, bmbt and unwritten flags.
    pub flags: RmapFlags,
    /// Some of the blocks are shared with another owner.
    pub shared: bool,
}

impl Transaction<'_> {
    /// Records that `oinfo` owns `len` blocks at `agbno`. Does nothing on
    /// filesystems without a reverse map.
    pub fn rmap_alloc(
        &mut self,
        agno: AgNumber,
        agbno: AgBlock,
        len: ExtLen,
        oinfo: &OwnerInfo,
    ) -> Result<()> {
        let mapped =
            self.with_rmap_cursor(agno, |cur| rmap::rmap_alloc(cur, u64::from(agbno), len, oinfo))?;
        if mapped.is_some() {
            self.mount().metrics.rmap_mapped();
        }
        Ok(())
    }

    /// Removes `oinfo`'s ownership of `len` blocks at `agbno`. Does nothing
    /// on filesystems without a reverse map.
    pub fn rmap_free(
        &mut self,
        agno: AgNumber,
        agbno: AgBlock,
        len: ExtLen,
        oinfo: &OwnerInfo,
    ) -> Result<()> {
        let unmapped =
            self.with_rmap_cursor(agno, |cur| rmap::rmap_free(cur, u64::from(agbno), len, oinfo))?;
        if unmapped.is_some() {
            self.mount().metrics.rmap_unmapped();
        }
        Ok(())
    }

    /// Records ownership of realtime blocks.
    pub fn rt_rmap_alloc(&mut self, rtbno: u64, len: ExtLen, oinfo: &OwnerInfo) -> Result<()> {
        self.with_rt_cursor(rtbno, len, |cur| rmap::rmap_alloc(cur, rtbno, len, oinfo))?;
        self.mount().metrics.rmap_mapped();
        Ok(())
    }

    /// Removes ownership of realtime blocks.
    pub fn rt_rmap_free(&mut self, rtbno: u64, len: ExtLen, oinfo: &OwnerInfo) -> Result<()> {
        self.with_rt_cursor(rtbno, len, |cur| rmap::rmap_free(cur, rtbno, len, oinfo))?;
        self.mount().metrics.rmap_unmapped();
        Ok(())
    }

    fn with_rt_cursor(
        &mut self,
        rtbno: u64,
        len: ExtLen,
        f: impl FnOnce(&mut Cursor<'_, RtRmapBtree>) -> Result<()>,
    ) -> Result<()> {
        self.ensure_active()?;
        let mount = self.mount();
        let Some(rt) = mount.rt.as_ref() else {
            return Err(AgError::Invalid("filesystem has no realtime reverse map"));
        };
        if rtbno.saturating_add(u64::from(len)) > mount.geometry().rt_blocks {
            return Err(AgError::Invalid("extent runs past the end of the realtime device"));
        }
        let mut guard = rt.lock();
        let rt = &mut *guard;
        self.mark_dirty();
        let mut cur = rt.rmap.cursor(CursorContext::Inode(rt.ino), &mut rt.blocks);
        f(&mut cur)
    }

    /// Applies every queued reverse-map intent, one cursor per AG.
    /// Returns how many were applied. Without a reverse map the queue is
    /// simply drained.
    pub fn rmap_apply_queued(&mut self, queue: &mut IntentQueue) -> Result<usize> {
        self.ensure_active()?;
        let items = queue.take();
        if !self.mount().features().rmapbt {
            trace!(dropped = items.len(), "no reverse map; intents dropped");
            return Ok(0);
        }
        let geo = *self.mount().geometry();
        let mut last: Option<AgNumber> = None;
        for group in items.chunk_by(|a, b| a.0 == b.0) {
            let agno = group[0].0;
            if last.is_some_and(|prev| agno < prev) {
                return Err(corruption(
                    CursorContext::Ag(agno),
                    "rmap intent queue is not in AG order",
                ));
            }
            last = Some(agno);
            self.with_rmap_cursor(agno, |cur| {
                group
                    .iter()
                    .try_for_each(|(_, intent)| apply_intent(cur, &geo, intent))
            })?;
        }
        self.mount().metrics.intents_applied(items.len());
        debug!(tx = self.id(), applied = items.len(), "rmap intents applied");
        Ok(items.len())
    }

    /// Rolls the transaction, then applies the queued intents.
    pub fn rmap_finish(&mut self, queue: &mut IntentQueue) -> Result<usize> {
        self.roll()?;
        self.rmap_apply_queued(queue)
    }
}

impl Mount {
    /// Reports every reverse mapping touching `[low, high]`. Records are
    /// returned whole, in AG then key order.
    pub fn getfsmap(&self, low: FsBlock, high: FsBlock) -> Result<Vec<FsMapping>> {
        self.check_live()?;
        if !self.features().rmapbt {
            return Err(AgError::Invalid("reverse mapping is not enabled"));
        }
        let geo = *self.geometry();
        let mut out = Vec::new();
        if low > high || geo.fsb_to_agno(low).0 >= geo.ag_count {
            return Ok(out);
        }
        let (first, last) = (geo.fsb_to_agno(low), geo.fsb_to_agno(high));
        for agno in (first.0..=last.0.min(geo.ag_count - 1)).map(AgNumber) {
            let lo = if agno == first {
                u64::from(geo.fsb_to_agbno(low))
            } else {
                0
            };
            let hi = if agno == last {
                u64::from(geo.fsb_to_agbno(high)) + 1
            } else {
                u64::from(geo.ag_blocks)
            };
            let mut guard = self.lock_ag(agno)?;
            let ag = &mut *guard;
            let hits: Vec<RmapRecord> = rmap_query_range(&ag.rmap, lo, hi).copied().collect();
            for rec in hits {
                let shared = if self.features().reflink && rec.has_logical_offset() {
                    let mut cur = ag.refcount.read_cursor(CursorContext::Ag(agno));
                    find_shared(&mut cur, rec.start as AgBlock, rec.len, false)?.is_some()
                } else {
                    false
                };
                out.push(FsMapping {
                    agno,
                    start: geo.agb_to_fsb(agno, rec.start as AgBlock),
                    len: rec.len,
                    owner: rec.owner,
                    offset: rec.offset,
                    flags: rec.flags,
                    shared,
                });
            }
        }
        Ok(out)
    }
}
