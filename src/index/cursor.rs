use std::fmt;
use std::ops::Bound;

use tracing::trace;

use crate::error::{corruption, AgError, Result};
use crate::types::AgNumber;

use super::{BlockSource, IndexFlavor, OrderedIndex};

/// Where an index is rooted: in an allocation group header or in an inode.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CursorContext {
    /// Per-AG index rooted in the AG header.
    Ag(AgNumber),
    /// Index rooted in an inode fork.
    Inode(u64),
}

impl fmt::Display for CursorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CursorContext::Ag(agno) => write!(f, "AG {agno}"),
            CursorContext::Inode(ino) => write!(f, "inode {ino}"),
        }
    }
}

/// Comparison used by [`Cursor::lookup`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LookupDir {
    /// Last record with key <= the search key.
    Le,
    /// First record with key >= the search key.
    Ge,
    /// Record with exactly the search key.
    Eq,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Position<K> {
    Unset,
    At(K),
    BeforeFirst,
    AfterLast,
}

/// Positional cursor over an [`OrderedIndex`].
///
/// A failed `Le` lookup leaves the cursor before the first record, a failed
/// `Ge` (or `Eq`) lookup leaves it on the next larger record or past the
/// end, so stepping afterwards visits the neighbours of the search key.
/// Deleting a record moves the cursor onto its successor.
pub struct Cursor<'a, F: IndexFlavor> {
    index: &'a mut OrderedIndex<F>,
    blocks: Option<&'a mut dyn BlockSource>,
    ctx: CursorContext,
    pos: Position<F::Key>,
}

impl<'a, F: IndexFlavor> Cursor<'a, F> {
    pub(super) fn new(
        index: &'a mut OrderedIndex<F>,
        ctx: CursorContext,
        blocks: Option<&'a mut dyn BlockSource>,
    ) -> Self {
        Self {
            index,
            blocks,
            ctx,
            pos: Position::Unset,
        }
    }

    /// Root the cursor was opened on.
    pub fn context(&self) -> CursorContext {
        self.ctx
    }

    /// Read access to the underlying index.
    pub fn index(&self) -> &OrderedIndex<F> {
        self.index
    }

    /// Positions the cursor; returns whether a matching record exists.
    pub fn lookup(&mut self, key: &F::Key, dir: LookupDir) -> Result<bool> {
        let records = &self.index.records;
        let (pos, found) = match dir {
            LookupDir::Le => match records.range(..=*key).next_back() {
                Some((k, _)) => (Position::At(*k), true),
                None => (Position::BeforeFirst, false),
            },
            LookupDir::Ge => match records.range(*key..).next() {
                Some((k, _)) => (Position::At(*k), true),
                None => (Position::AfterLast, false),
            },
            LookupDir::Eq => match records.range(*key..).next() {
                Some((k, _)) => (Position::At(*k), k == key),
                None => (Position::AfterLast, false),
            },
        };
        self.pos = pos;
        Ok(found)
    }

    /// Record under the cursor, if it sits on one.
    pub fn get_rec(&self) -> Result<Option<F::Rec>> {
        match &self.pos {
            Position::At(key) => match self.index.records.get(key) {
                Some(rec) => Ok(Some(*rec)),
                None => Err(corruption(self.ctx, "cursor points at a vanished record")),
            },
            _ => Ok(None),
        }
    }

    /// Steps to the next record; returns false at the end.
    pub fn increment(&mut self) -> Result<bool> {
        let records = &self.index.records;
        let next = match &self.pos {
            Position::Unset | Position::AfterLast => return Ok(false),
            Position::BeforeFirst => records.keys().next().copied(),
            Position::At(key) => records
                .range((Bound::Excluded(*key), Bound::Unbounded))
                .next()
                .map(|(k, _)| *k),
        };
        self.pos = match next {
            Some(k) => Position::At(k),
            None => Position::AfterLast,
        };
        Ok(next.is_some())
    }

    /// Steps to the previous record; returns false at the start.
    pub fn decrement(&mut self) -> Result<bool> {
        let records = &self.index.records;
        let prev = match &self.pos {
            Position::Unset | Position::BeforeFirst => return Ok(false),
            Position::AfterLast => records.keys().next_back().copied(),
            Position::At(key) => records.range(..*key).next_back().map(|(k, _)| *k),
        };
        self.pos = match prev {
            Some(k) => Position::At(k),
            None => Position::BeforeFirst,
        };
        Ok(prev.is_some())
    }

    /// Inserts a record and positions the cursor on it.
    pub fn insert(&mut self, rec: F::Rec) -> Result<()> {
        let key = self.index.flavor.key_of(&rec);
        if self.index.records.contains_key(&key) {
            return Err(corruption(self.ctx, "insert would duplicate an existing key"));
        }
        self.grow_for(self.index.records.len() + 1)?;
        trace!(context = %self.ctx, index = self.index.flavor.name(), ?rec, "insert");
        self.index.note_extent(&rec);
        self.index.records.insert(key, rec);
        self.pos = Position::At(key);
        Ok(())
    }

    /// Deletes the record under the cursor and moves onto its successor.
    pub fn delete(&mut self) -> Result<()> {
        let key = match self.pos {
            Position::At(key) => key,
            _ => return Err(corruption(self.ctx, "delete without a record under the cursor")),
        };
        self.require_writable()?;
        let rec = self
            .index
            .records
            .remove(&key)
            .ok_or_else(|| corruption(self.ctx, "cursor points at a vanished record"))?;
        trace!(context = %self.ctx, index = self.index.flavor.name(), ?rec, "delete");
        self.shrink_for(self.index.records.len())?;
        self.pos = match self
            .index
            .records
            .range((Bound::Excluded(key), Bound::Unbounded))
            .next()
        {
            Some((k, _)) => Position::At(*k),
            None => Position::AfterLast,
        };
        Ok(())
    }

    /// Replaces the record under the cursor. The key may change as long
    /// as it does not collide with another record.
    pub fn update(&mut self, rec: F::Rec) -> Result<()> {
        let old = match self.pos {
            Position::At(key) => key,
            _ => return Err(corruption(self.ctx, "update without a record under the cursor")),
        };
        self.require_writable()?;
        let key = self.index.flavor.key_of(&rec);
        if key != old {
            if self.index.records.contains_key(&key) {
                return Err(corruption(self.ctx, "update would duplicate an existing key"));
            }
            self.index.records.remove(&old);
        }
        trace!(context = %self.ctx, index = self.index.flavor.name(), ?rec, "update");
        self.index.note_extent(&rec);
        self.index.records.insert(key, rec);
        self.pos = Position::At(key);
        Ok(())
    }

    fn require_writable(&mut self) -> Result<&mut (dyn BlockSource + 'a)> {
        match self.blocks.as_deref_mut() {
            Some(blocks) => Ok(blocks),
            None => Err(AgError::Invalid("modification through a read-only cursor")),
        }
    }

    fn grow_for(&mut self, nrecs: usize) -> Result<()> {
        let need = self.index.blocks_for(nrecs);
        let ctx = self.ctx;
        while self.index.nblocks < need {
            self.require_writable()?.alloc_block(ctx)?;
            self.index.nblocks += 1;
        }
        self.require_writable()?;
        self.index.levels = self.index.height_for(nrecs);
        Ok(())
    }

    fn shrink_for(&mut self, nrecs: usize) -> Result<()> {
        let need = self.index.blocks_for(nrecs);
        let ctx = self.ctx;
        while self.index.nblocks > need {
            self.require_writable()?.free_block(ctx)?;
            self.index.nblocks -= 1;
        }
        self.index.levels = self.index.height_for(nrecs);
        Ok(())
    }
}
