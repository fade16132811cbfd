//! Per-AG block reservations.
//!
//! Each class of metadata btree that must always be able to grow keeps a
//! pool of blocks withheld from general allocation in every AG. The pool is
//! withdrawn from the global free-block counter once, when it is created,
//! and handed back once, when it is destroyed; in between, btree block
//! allocations draw on it through [`alloc_block`] and [`free_block`].

use tracing::debug;

use crate::error::{AgError, Result};
use crate::types::AgNumber;

/// Reservation classes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ResvClass {
    /// Reference-count btree blocks.
    Metadata,
    /// Reverse-map btree blocks, which are fed through the AG free list.
    Rmapbt,
}

impl ResvClass {
    /// Every class, in slot order.
    pub const ALL: [ResvClass; 2] = [ResvClass::Metadata, ResvClass::Rmapbt];

    fn slot(self) -> usize {
        match self {
            ResvClass::Metadata => 0,
            ResvClass::Rmapbt => 1,
        }
    }

    /// Blocks of this class are consumed through the AG free list.
    pub fn feeds_agfl(self) -> bool {
        matches!(self, ResvClass::Rmapbt)
    }
}

/// On whose behalf an allocation is made, for [`needed`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResvKind {
    /// Ordinary allocation: every reserved block stays off limits.
    None,
    /// Refill of the AG free list: free-list reservations may be used.
    AgflRefill,
    /// Allocation charged to a class: its own remaining reservation may be
    /// used.
    Class(ResvClass),
}

/// One class's reservation in one AG.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct AgResv {
    /// Blocks reserved for the class.
    pub asked: u64,
    /// Blocks the class currently occupies.
    pub used: u64,
}

impl AgResv {
    /// Blocks still held back for the class.
    pub fn remaining(&self) -> u64 {
        self.asked.saturating_sub(self.used)
    }
}

/// Free-space accounting of one AG.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AgSpace {
    /// AG number, for logging.
    pub agno: AgNumber,
    /// Free blocks in the AG.
    pub free_blocks: u64,
    /// Blocks withheld by all reservations.
    pub reserved_blocks: u64,
    /// Part of `reserved_blocks` held by free-list-feeding classes.
    pub agfl_reserved_blocks: u64,
    resv: [Option<AgResv>; 2],
}

impl AgSpace {
    /// Accounting for an AG with `free_blocks` free and nothing reserved.
    pub fn new(agno: AgNumber, free_blocks: u64) -> Self {
        Self {
            agno,
            free_blocks,
            ..Self::default()
        }
    }

    /// The reservation of `class`, if one exists.
    pub fn resv(&self, class: ResvClass) -> Option<&AgResv> {
        self.resv[class.slot()].as_ref()
    }

    fn resv_mut(&mut self, class: ResvClass) -> Option<&mut AgResv> {
        self.resv[class.slot()].as_mut()
    }

    fn hold(&mut self, class: ResvClass, blocks: u64) {
        self.reserved_blocks += blocks;
        if class.feeds_agfl() {
            self.agfl_reserved_blocks += blocks;
        }
    }

    fn release(&mut self, class: ResvClass, blocks: u64) {
        self.reserved_blocks = self.reserved_blocks.saturating_sub(blocks);
        if class.feeds_agfl() {
            self.agfl_reserved_blocks = self.agfl_reserved_blocks.saturating_sub(blocks);
        }
    }
}

/// Filesystem-wide counters touched by reservation changes.
pub trait SpaceCounters {
    /// Adds `delta` to the global free-block counter, failing with
    /// `NoSpace` if it would go negative.
    fn mod_free_blocks(&mut self, delta: i64) -> Result<()>;
    /// Adds `delta` to the usable size of every AG.
    fn mod_max_usable(&mut self, delta: i64);
}

/// The filesystem's live counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FsCounters {
    /// Free data blocks available to general allocation.
    pub free_blocks: u64,
    /// Largest number of blocks a single AG can hand out.
    pub ag_max_usable: u64,
}

impl SpaceCounters for FsCounters {
    fn mod_free_blocks(&mut self, delta: i64) -> Result<()> {
        let next = self
            .free_blocks
            .checked_add_signed(delta)
            .ok_or(AgError::NoSpace("free block counter exhausted"))?;
        self.free_blocks = next;
        Ok(())
    }

    fn mod_max_usable(&mut self, delta: i64) {
        self.ag_max_usable = self.ag_max_usable.saturating_add_signed(delta);
    }
}

/// Counter changes collected by a transaction and applied when it commits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SbDeltas {
    /// Pending change to the free-block counter.
    pub free_blocks: i64,
    /// Pending change to the usable AG size.
    pub max_usable: i64,
}

impl SbDeltas {
    /// True when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.free_blocks == 0 && self.max_usable == 0
    }

    /// Applies and clears the pending changes.
    pub fn apply_to(&mut self, counters: &mut FsCounters) -> Result<()> {
        counters.mod_free_blocks(self.free_blocks)?;
        counters.mod_max_usable(self.max_usable);
        *self = Self::default();
        Ok(())
    }
}

impl SpaceCounters for SbDeltas {
    fn mod_free_blocks(&mut self, delta: i64) -> Result<()> {
        self.free_blocks += delta;
        Ok(())
    }

    fn mod_max_usable(&mut self, delta: i64) {
        self.max_usable += delta;
    }
}

fn signed(blocks: u64) -> i64 {
    i64::try_from(blocks).unwrap_or(i64::MAX)
}

/// Creates `class`'s reservation of `asked` blocks, `used` of which the
/// tree already occupies. On failure nothing is changed.
pub fn init(
    space: &mut AgSpace,
    counters: &mut FsCounters,
    class: ResvClass,
    asked: u64,
    used: u64,
) -> Result<()> {
    if space.resv(class).is_some() {
        return Err(AgError::Invalid("reservation already exists"));
    }
    let mut excess = 0;
    let mut asked = asked;
    if asked < used {
        excess = used - asked;
        asked = used;
    }
    let resv = AgResv { asked, used };
    let hold = resv.remaining();
    if space.reserved_blocks + hold > space.free_blocks {
        debug!(agno = %space.agno, ?class, asked, used, "reservation exceeds AG free space");
        return Err(AgError::NoSpace("AG cannot cover its reservation"));
    }
    counters.mod_free_blocks(-signed(hold))?;
    counters.mod_max_usable(-signed(excess));
    space.hold(class, hold);
    space.resv[class.slot()] = Some(resv);
    debug!(agno = %space.agno, ?class, asked, used, reserved = space.reserved_blocks, "reservation created");
    Ok(())
}

/// Destroys `class`'s reservation and returns its remaining blocks to the
/// global counter. Returns the reservation that was dropped.
pub fn free(
    space: &mut AgSpace,
    counters: &mut FsCounters,
    class: ResvClass,
) -> Result<Option<AgResv>> {
    let Some(resv) = space.resv[class.slot()].take() else {
        return Ok(None);
    };
    let hold = resv.remaining();
    space.release(class, hold);
    counters.mod_free_blocks(signed(hold))?;
    debug!(agno = %space.agno, ?class, asked = resv.asked, used = resv.used, "reservation freed");
    Ok(Some(resv))
}

/// Charges one newly allocated block to `class`. Within the reservation
/// the block comes out of the withheld pool; past it, the reservation
/// grows and the usable AG size shrinks.
pub fn alloc_block(space: &mut AgSpace, counters: &mut dyn SpaceCounters, class: ResvClass) -> Result<()> {
    let Some(resv) = space.resv_mut(class) else {
        return Ok(());
    };
    resv.used += 1;
    if resv.used <= resv.asked {
        space.release(class, 1);
        counters.mod_free_blocks(1)
    } else {
        resv.asked += 1;
        counters.mod_max_usable(-1);
        Ok(())
    }
}

/// Returns one block of `class` to its reservation.
pub fn free_block(space: &mut AgSpace, counters: &mut dyn SpaceCounters, class: ResvClass) -> Result<()> {
    let Some(resv) = space.resv_mut(class) else {
        return Ok(());
    };
    if resv.used == 0 {
        return Err(AgError::Invalid("freeing a block the reservation never handed out"));
    }
    resv.used -= 1;
    space.hold(class, 1);
    counters.mod_free_blocks(-1)
}

/// Blocks that must remain free in the AG for an allocation of `kind`.
pub fn needed(space: &AgSpace, kind: ResvKind) -> u64 {
    match kind {
        ResvKind::None => space.reserved_blocks,
        ResvKind::AgflRefill => space
            .reserved_blocks
            .saturating_sub(space.agfl_reserved_blocks),
        ResvKind::Class(class) => {
            let own = space.resv(class).map_or(0, AgResv::remaining);
            space.reserved_blocks.saturating_sub(own)
        }
    }
}

/// True when `class` is close to running out of space: the blocks it could
/// still get fall under a tenth of its reservation or under `floor`.
pub fn critical(space: &AgSpace, class: ResvClass, floor: u64) -> bool {
    let Some(resv) = space.resv(class) else {
        return false;
    };
    if space.free_blocks < space.reserved_blocks {
        return true;
    }
    let mut avail = space.free_blocks - space.reserved_blocks;
    avail += if class.feeds_agfl() {
        space.agfl_reserved_blocks
    } else {
        resv.remaining()
    };
    avail < resv.asked / 10 || avail < floor
}
