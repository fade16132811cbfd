use tracing::{info, warn};

use crate::error::{AgError, Result};
use crate::index::CursorContext;
use crate::refcount::{
    adjust_cow, adjust_refcount, cow_staging_extents, find_shared, Adjustment, CowAdjustment,
    FreedExtents,
};
use crate::resv::ResvKind;
use crate::types::{AgBlock, AgExtent, AgNumber, ExtLen, FsBlock, OwnerInfo, SpecialOwner};

use super::{Mount, Transaction};

/// What became of a CoW staging extent that is being released.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CowDisposition {
    /// The blocks were remapped into the file, which now owns them.
    Remapped,
    /// The write was abandoned and the blocks go back to free space.
    Cancelled,
}

impl Transaction<'_> {
    fn require_reflink(&self) -> Result<()> {
        if !self.mount().features().reflink {
            return Err(AgError::Invalid("reflink is not enabled"));
        }
        Ok(())
    }

    /// Adds one reference to every block of the range.
    pub fn refcount_increase(&mut self, agno: AgNumber, agbno: AgBlock, len: ExtLen) -> Result<()> {
        self.require_reflink()?;
        self.mount().geometry().verify_ag_extent(agbno, len)?;
        self.with_refcount_cursor(agno, |cur, env| {
            let mut freed = FreedExtents::new();
            adjust_refcount(cur, agbno, len, Adjustment::Increase, env, &mut freed)
        })?;
        self.mount().metrics.refcount_adjusted("increase");
        Ok(())
    }

    /// Drops one reference from every block of the range. Blocks whose last
    /// reference goes away are queued for freeing; with `oinfo` their
    /// reverse mappings go with them.
    pub fn refcount_decrease(
        &mut self,
        agno: AgNumber,
        agbno: AgBlock,
        len: ExtLen,
        oinfo: Option<OwnerInfo>,
    ) -> Result<()> {
        self.require_reflink()?;
        self.mount().geometry().verify_ag_extent(agbno, len)?;
        let freed = self.with_refcount_cursor(agno, |cur, env| {
            let mut freed = FreedExtents::new();
            adjust_refcount(cur, agbno, len, Adjustment::Decrease, env, &mut freed)?;
            Ok(freed)
        })?;
        self.mount().metrics.refcount_adjusted("decrease");
        for ext in freed {
            let owner = oinfo.map(|o| {
                if o.has_logical_offset() {
                    OwnerInfo {
                        offset: o.offset + u64::from(ext.start - agbno),
                        ..o
                    }
                } else {
                    o
                }
            });
            self.free_extent(agno, ext.start, ext.len, owner)?;
        }
        Ok(())
    }

    /// Releases a file's reference to a filesystem extent.
    pub fn refcount_put_extent(
        &mut self,
        fsbno: FsBlock,
        len: ExtLen,
        oinfo: Option<OwnerInfo>,
    ) -> Result<()> {
        let (agno, agbno) = self.mount().geometry().verify_fsb_extent(fsbno, len)?;
        self.refcount_decrease(agno, agbno, len, oinfo)
    }

    /// Allocates free blocks as a CoW staging extent.
    pub fn cow_reserve(&mut self, agno: AgNumber, agbno: AgBlock, len: ExtLen) -> Result<()> {
        self.require_reflink()?;
        self.alloc_extent(
            agno,
            agbno,
            len,
            &OwnerInfo::special(SpecialOwner::Cow),
            ResvKind::None,
        )?;
        self.with_refcount_cursor(agno, |cur, _| {
            adjust_cow(cur, agbno, len, CowAdjustment::Alloc)
        })?;
        self.mount().metrics.cow_staging(true);
        Ok(())
    }

    /// Drops the staging record of a CoW extent, then either hands the
    /// blocks to their new file owner or frees them.
    pub fn cow_unreserve(
        &mut self,
        agno: AgNumber,
        agbno: AgBlock,
        len: ExtLen,
        disposition: CowDisposition,
    ) -> Result<()> {
        self.require_reflink()?;
        self.mount().geometry().verify_ag_extent(agbno, len)?;
        self.with_refcount_cursor(agno, |cur, _| {
            adjust_cow(cur, agbno, len, CowAdjustment::Free)
        })?;
        self.mount().metrics.cow_staging(false);
        let cow = OwnerInfo::special(SpecialOwner::Cow);
        match disposition {
            CowDisposition::Remapped => {
                self.roll()?;
                self.rmap_free(agno, agbno, len, &cow)
            }
            CowDisposition::Cancelled => self.free_extent(agno, agbno, len, Some(cow)),
        }
    }
}

impl Mount {
    /// First shared run within the range, or with `find_maximal` the
    /// longest run starting there.
    pub fn refcount_find_shared(
        &self,
        agno: AgNumber,
        agbno: AgBlock,
        len: ExtLen,
        find_maximal: bool,
    ) -> Result<Option<AgExtent>> {
        self.check_live()?;
        self.geometry().verify_ag_extent(agbno, len)?;
        if self.options().always_cow {
            return Ok(Some(AgExtent { start: agbno, len }));
        }
        if !self.features().reflink {
            return Ok(None);
        }
        let mut ag = self.lock_ag(agno)?;
        let mut cur = ag.refcount.read_cursor(CursorContext::Ag(agno));
        find_shared(&mut cur, agbno, len, find_maximal)
    }

    /// Frees CoW staging extents left behind by an interrupted session.
    /// Returns how many were released.
    pub fn recover_cow(&self) -> Result<usize> {
        self.check_live()?;
        if !self.features().reflink {
            return Ok(0);
        }
        let mut staged = Vec::new();
        for ag in &self.ags {
            let ag = ag.lock();
            staged.extend(cow_staging_extents(&ag.refcount).into_iter().map(|ext| (ag.agno, ext)));
        }
        if staged.is_empty() {
            return Ok(0);
        }
        warn!(extents = staged.len(), "releasing leftover CoW staging extents");
        let mut tx = self.begin()?;
        for (agno, ext) in &staged {
            tx.cow_unreserve(*agno, ext.start, ext.len, CowDisposition::Cancelled)?;
        }
        tx.commit()?;
        info!(extents = staged.len(), "CoW recovery finished");
        Ok(staged.len())
    }
}
