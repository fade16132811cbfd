use tracing::{debug, trace, warn};

use crate::error::{corruption, AgError, Result};
use crate::index::{BlockSource, Cursor, CursorContext};
use crate::metrics::AgMetrics;
use crate::refcount::{AdjustEnv, RefcountBtree};
use crate::resv::{self, AgSpace, ResvClass, ResvKind, SbDeltas};
use crate::rmap::{rmap_alloc, rmap_free, rmap_query_range, RmapBtree};
use crate::types::{AgBlock, AgExtent, AgNumber, ExtLen, OwnerInfo};

use super::Mount;

/// Lifecycle of a [`Transaction`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TxState {
    /// Accepting operations.
    Active,
    /// All deferred work finished and the counters were updated.
    Committed,
    /// Abandoned.
    Cancelled,
}

/// An extent queued for release when the transaction rolls.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeferredFree {
    /// AG holding the extent.
    pub agno: AgNumber,
    /// Blocks to release.
    pub extent: AgExtent,
    /// Reverse mapping to remove along with the blocks; `None` when the
    /// caller already removed it.
    pub oinfo: Option<OwnerInfo>,
}

/// Charges btree growth and shrinkage of one AG index to the AG's free
/// space and to the reservation of the index's class.
pub(crate) struct AgBtreeBlocks<'a> {
    space: &'a mut AgSpace,
    deltas: &'a mut SbDeltas,
    class: ResvClass,
    metrics: &'a dyn AgMetrics,
}

impl<'a> AgBtreeBlocks<'a> {
    pub(crate) fn new(
        space: &'a mut AgSpace,
        deltas: &'a mut SbDeltas,
        class: ResvClass,
        metrics: &'a dyn AgMetrics,
    ) -> Self {
        Self {
            space,
            deltas,
            class,
            metrics,
        }
    }
}

impl BlockSource for AgBtreeBlocks<'_> {
    fn alloc_block(&mut self, ctx: CursorContext) -> Result<()> {
        if self.space.free_blocks <= resv::needed(self.space, ResvKind::Class(self.class)) {
            debug!(context = %ctx, class = ?self.class, "no block left for btree growth");
            return Err(AgError::NoSpace("no free block for btree growth"));
        }
        self.space.free_blocks -= 1;
        self.deltas.free_blocks -= 1;
        resv::alloc_block(self.space, &mut *self.deltas, self.class)?;
        self.metrics.btree_block(true);
        Ok(())
    }

    fn free_block(&mut self, _ctx: CursorContext) -> Result<()> {
        resv::free_block(self.space, &mut *self.deltas, self.class)?;
        self.space.free_blocks += 1;
        self.deltas.free_blocks += 1;
        self.metrics.btree_block(false);
        Ok(())
    }
}

/// A unit of metadata change.
///
/// Operations update the AG indexes in place and collect global counter
/// changes in a delta; [`roll`](Self::roll) finishes deferred frees and
/// folds the delta into the filesystem counters. A transaction that made
/// changes must be committed: cancelling it, or dropping it while active,
/// shuts the filesystem down.
#[must_use = "transactions must be committed or cancelled"]
pub struct Transaction<'m> {
    mount: &'m Mount,
    id: u64,
    state: TxState,
    deltas: SbDeltas,
    frees: Vec<DeferredFree>,
    dirty: bool,
    rolls: u32,
}

impl<'m> Transaction<'m> {
    pub(super) fn new(mount: &'m Mount, id: u64) -> Self {
        trace!(tx = id, "transaction started");
        Self {
            mount,
            id,
            state: TxState::Active,
            deltas: SbDeltas::default(),
            frees: Vec::new(),
            dirty: false,
            rolls: 0,
        }
    }

    /// Transaction id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> TxState {
        self.state
    }

    /// True once the transaction changed anything.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Counter changes not yet applied.
    pub fn deltas(&self) -> SbDeltas {
        self.deltas
    }

    /// Frees waiting for the next roll.
    pub fn pending_frees(&self) -> &[DeferredFree] {
        &self.frees
    }

    /// The filesystem this transaction runs against.
    pub fn mount(&self) -> &'m Mount {
        self.mount
    }

    pub(super) fn ensure_active(&self) -> Result<()> {
        self.mount.check_live()?;
        if self.state != TxState::Active {
            return Err(AgError::Invalid("transaction is no longer active"));
        }
        Ok(())
    }

    pub(super) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Finishes deferred frees in AG order and applies the counter delta.
    pub fn roll(&mut self) -> Result<()> {
        self.ensure_active()?;
        let mut frees = std::mem::take(&mut self.frees);
        frees.sort_by_key(|free| free.agno);
        for free in &frees {
            self.finish_free(free)?;
        }
        if !self.deltas.is_empty() {
            let mut counters = self.mount.counters.lock();
            self.deltas.apply_to(&mut counters)?;
        }
        self.rolls += 1;
        trace!(tx = self.id, rolls = self.rolls, freed = frees.len(), "transaction rolled");
        Ok(())
    }

    /// Rolls one last time and closes the transaction.
    pub fn commit(mut self) -> Result<()> {
        if let Err(err) = self.roll() {
            self.abort("transaction commit failed");
            return Err(err);
        }
        self.state = TxState::Committed;
        debug!(tx = self.id, rolls = self.rolls, "transaction committed");
        Ok(())
    }

    /// Abandons the transaction.
    pub fn cancel(mut self) {
        self.abort("cancelled a dirty transaction");
    }

    fn abort(&mut self, reason: &'static str) {
        if self.dirty {
            self.mount.shut_down(reason);
        }
        self.state = TxState::Cancelled;
    }

    fn finish_free(&mut self, free: &DeferredFree) -> Result<()> {
        let mount = self.mount;
        let ctx = CursorContext::Ag(free.agno);
        let mut guard = mount.lock_ag(free.agno)?;
        let ag = &mut *guard;
        if let Some(oinfo) = free.oinfo.as_ref().filter(|_| mount.features().rmapbt) {
            let mut blocks = AgBtreeBlocks::new(
                &mut ag.space,
                &mut self.deltas,
                ResvClass::Rmapbt,
                &*mount.metrics,
            );
            let mut cur = ag.rmap.cursor(ctx, &mut blocks);
            rmap_free(&mut cur, u64::from(free.extent.start), free.extent.len, oinfo)?;
            mount.metrics.rmap_unmapped();
        }
        let len = u64::from(free.extent.len);
        if ag.space.free_blocks + len > mount.ag_usable_blocks() {
            return Err(corruption(ctx, "freeing more blocks than the AG holds"));
        }
        ag.space.free_blocks += len;
        self.deltas.free_blocks += len as i64;
        trace!(tx = self.id, agno = %free.agno, start = free.extent.start, len, "extent freed");
        Ok(())
    }

    /// Takes `len` free blocks at `agbno` for `oinfo`, recording the
    /// reverse mapping. Blocks held back for reservations other than
    /// `kind` are not touched.
    pub fn alloc_extent(
        &mut self,
        agno: AgNumber,
        agbno: AgBlock,
        len: ExtLen,
        oinfo: &OwnerInfo,
        kind: ResvKind,
    ) -> Result<()> {
        self.ensure_active()?;
        let mount = self.mount;
        let geo = mount.geometry();
        geo.verify_ag_extent(agbno, len)?;
        if agbno < geo.ag_header_blocks {
            return Err(AgError::Invalid("extent overlaps the AG headers"));
        }
        let ctx = CursorContext::Ag(agno);
        let mut guard = mount.lock_ag(agno)?;
        let ag = &mut *guard;
        let want = u64::from(len);
        if ag.space.free_blocks < resv::needed(&ag.space, kind) + want {
            return Err(AgError::NoSpace("allocation would dip into reserved blocks"));
        }
        let (start, end) = (u64::from(agbno), u64::from(agbno) + want);
        if mount.features().rmapbt && rmap_query_range(&ag.rmap, start, end).next().is_some() {
            return Err(corruption(ctx, "allocating blocks that already have an owner"));
        }
        self.dirty = true;
        ag.space.free_blocks -= want;
        self.deltas.free_blocks -= want as i64;
        if let ResvKind::Class(class) = kind {
            for _ in 0..len {
                resv::alloc_block(&mut ag.space, &mut self.deltas, class)?;
            }
        }
        if mount.features().rmapbt {
            let mut blocks = AgBtreeBlocks::new(
                &mut ag.space,
                &mut self.deltas,
                ResvClass::Rmapbt,
                &*mount.metrics,
            );
            let mut cur = ag.rmap.cursor(ctx, &mut blocks);
            rmap_alloc(&mut cur, start, len, oinfo)?;
            mount.metrics.rmap_mapped();
        }
        trace!(tx = self.id, %agno, agbno, len, owner = %oinfo.owner, "extent allocated");
        Ok(())
    }

    /// Queues `len` blocks at `agbno` to be freed at the next roll.
    pub fn free_extent(
        &mut self,
        agno: AgNumber,
        agbno: AgBlock,
        len: ExtLen,
        oinfo: Option<OwnerInfo>,
    ) -> Result<()> {
        self.ensure_active()?;
        self.mount.geometry().verify_ag_extent(agbno, len)?;
        if agno.0 >= self.mount.geometry().ag_count {
            return Err(AgError::Invalid("no such allocation group"));
        }
        self.dirty = true;
        self.frees.push(DeferredFree {
            agno,
            extent: AgExtent { start: agbno, len },
            oinfo,
        });
        Ok(())
    }

    /// Hands one free block of an AG to `class`'s btree.
    pub fn ag_resv_alloc_block(&mut self, agno: AgNumber, class: ResvClass) -> Result<()> {
        self.with_ag_blocks(agno, class, |blocks| blocks.alloc_block(CursorContext::Ag(agno)))
    }

    /// Returns one block of `class`'s btree to the AG.
    pub fn ag_resv_free_block(&mut self, agno: AgNumber, class: ResvClass) -> Result<()> {
        self.with_ag_blocks(agno, class, |blocks| blocks.free_block(CursorContext::Ag(agno)))
    }

    fn with_ag_blocks(
        &mut self,
        agno: AgNumber,
        class: ResvClass,
        f: impl FnOnce(&mut AgBtreeBlocks<'_>) -> Result<()>,
    ) -> Result<()> {
        self.ensure_active()?;
        let mount = self.mount;
        let mut ag = mount.lock_ag(agno)?;
        let mut blocks = AgBtreeBlocks::new(&mut ag.space, &mut self.deltas, class, &*mount.metrics);
        f(&mut blocks)?;
        self.dirty = true;
        Ok(())
    }

    /// Runs `f` on a writable cursor over an AG's reverse map. Returns
    /// `None` without calling `f` when the filesystem keeps no reverse map.
    pub(super) fn with_rmap_cursor<R>(
        &mut self,
        agno: AgNumber,
        f: impl FnOnce(&mut Cursor<'_, RmapBtree>) -> Result<R>,
    ) -> Result<Option<R>> {
        self.ensure_active()?;
        let mount = self.mount;
        if !mount.features().rmapbt {
            return Ok(None);
        }
        let mut guard = mount.lock_ag(agno)?;
        let ag = &mut *guard;
        self.dirty = true;
        let mut blocks = AgBtreeBlocks::new(
            &mut ag.space,
            &mut self.deltas,
            ResvClass::Rmapbt,
            &*mount.metrics,
        );
        let mut cur = ag.rmap.cursor(CursorContext::Ag(agno), &mut blocks);
        f(&mut cur).map(Some)
    }

    /// Runs `f` on a writable cursor over an AG's reference counts, with
    /// the AG's reverse map available for cross-checks.
    pub(super) fn with_refcount_cursor<R>(
        &mut self,
        agno: AgNumber,
        f: impl FnOnce(&mut Cursor<'_, RefcountBtree>, &AdjustEnv<'_>) -> Result<R>,
    ) -> Result<R> {
        self.ensure_active()?;
        let mount = self.mount;
        if !mount.features().reflink {
            return Err(AgError::Invalid("reflink is not enabled"));
        }
        let mut guard = mount.lock_ag(agno)?;
        let ag = &mut *guard;
        self.dirty = true;
        let cross_check = mount.options().cross_check_implied_owners && mount.features().rmapbt;
        let env = AdjustEnv {
            ag_blocks: mount.geometry().ag_blocks,
            owners: cross_check.then_some(&ag.rmap),
        };
        let mut blocks = AgBtreeBlocks::new(
            &mut ag.space,
            &mut self.deltas,
            ResvClass::Metadata,
            &*mount.metrics,
        );
        let mut cur = ag.refcount.cursor(CursorContext::Ag(agno), &mut blocks);
        f(&mut cur, &env)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.state == TxState::Active && self.dirty {
            warn!(tx = self.id, "dirty transaction dropped without commit");
            self.mount.shut_down("dirty transaction dropped without commit");
        }
    }
}
