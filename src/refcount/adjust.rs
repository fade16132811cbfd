//! Splitting, neighbour merging and interior adjustment of refcount
//! records.

use smallvec::SmallVec;
use tracing::trace;

use crate::error::{corruption, Result};
use crate::index::{Cursor, LookupDir, OrderedIndex};
use crate::rmap::{rmap_query_range, RmapBtree};
use crate::types::{AgBlock, AgExtent, ExtLen};

use super::{
    Adjustment, CowAdjustment, RefcountBtree, RefcountRecord, MAX_REFCOUNT, MAX_REFC_EXTLEN,
};

/// Ranges whose count dropped to zero during one adjustment.
pub(crate) type FreedExtents = SmallVec<[AgExtent; 4]>;

/// What an adjustment may consult besides the refcount tree itself.
pub(crate) struct AdjustEnv<'r> {
    /// Blocks in this AG; bounds the final gap of the interior walk.
    pub ag_blocks: AgBlock,
    /// Reverse map of the AG, when freed gaps must be cross-checked
    /// against it.
    pub owners: Option<&'r OrderedIndex<RmapBtree>>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum MatchRule {
    /// Neighbours must be shared.
    Shared,
    /// Neighbours must be CoW staging extents.
    Cow,
}

impl MatchRule {
    fn accepts(self, rec: &RefcountRecord) -> bool {
        match self {
            MatchRule::Shared => rec.refcount >= 2,
            MatchRule::Cow => rec.refcount == 1,
        }
    }
}

/// Record (or implied gap) at one edge of the adjustment window.
#[derive(Copy, Clone, Debug)]
struct Center {
    rec: RefcountRecord,
    implied: bool,
}

impl Center {
    fn real(rec: RefcountRecord) -> Self {
        Self { rec, implied: false }
    }

    fn implied(start: AgBlock, len: ExtLen) -> Self {
        Self {
            rec: RefcountRecord {
                start,
                len,
                refcount: 1,
            },
            implied: true,
        }
    }

    fn mergeable(&self) -> bool {
        self.rec.len > 0 && self.rec.refcount != MAX_REFCOUNT
    }

    fn target(&self, adj: i64) -> i64 {
        i64::from(self.rec.refcount) + adj
    }

    fn same_range(&self, other: &Center) -> bool {
        self.rec.start == other.rec.start && self.rec.len == other.rec.len
    }
}

/// Adjustment window still to be processed.
#[derive(Copy, Clone, Debug)]
struct Window {
    start: AgBlock,
    len: ExtLen,
}

impl Window {
    fn end(&self) -> u64 {
        u64::from(self.start) + u64::from(self.len)
    }
}

fn record_at(cur: &Cursor<'_, RefcountBtree>) -> Result<RefcountRecord> {
    cur.get_rec()?
        .ok_or_else(|| corruption(cur.context(), "refcount cursor lost its record"))
}

fn seek(cur: &mut Cursor<'_, RefcountBtree>, start: AgBlock) -> Result<RefcountRecord> {
    if !cur.lookup(&start, LookupDir::Eq)? {
        return Err(corruption(cur.context(), "refcount record vanished during merge"));
    }
    record_at(cur)
}

/// Splits the record straddling `agbno` so that a record boundary falls on
/// it. Returns whether a split happened.
fn split_left(cur: &mut Cursor<'_, RefcountBtree>, agbno: AgBlock) -> Result<bool> {
    if !cur.lookup(&agbno, LookupDir::Le)? {
        return Ok(false);
    }
    let rec = record_at(cur)?;
    if rec.start == agbno || rec.end() <= u64::from(agbno) {
        return Ok(false);
    }
    trace!(context = %cur.context(), agbno, ?rec, "refcount split left");
    let left_len = agbno - rec.start;
    cur.update(RefcountRecord {
        len: left_len,
        ..rec
    })?;
    cur.insert(RefcountRecord {
        start: agbno,
        len: rec.len - left_len,
        refcount: rec.refcount,
    })?;
    Ok(true)
}

/// Splits the record straddling `agbnext` (one past the window) so that a
/// record boundary falls on it.
fn split_right(cur: &mut Cursor<'_, RefcountBtree>, agbnext: u64) -> Result<bool> {
    if agbnext == 0 {
        return Ok(false);
    }
    let last = (agbnext - 1) as AgBlock;
    if !cur.lookup(&last, LookupDir::Le)? {
        return Ok(false);
    }
    let rec = record_at(cur)?;
    if rec.end() <= agbnext {
        return Ok(false);
    }
    trace!(context = %cur.context(), agbnext, ?rec, "refcount split right");
    let left_len = (agbnext - u64::from(rec.start)) as ExtLen;
    cur.update(RefcountRecord {
        start: agbnext as AgBlock,
        len: rec.len - left_len,
        refcount: rec.refcount,
    })?;
    cur.insert(RefcountRecord {
        start: rec.start,
        len: left_len,
        refcount: rec.refcount,
    })?;
    Ok(true)
}

fn check_center(cur: &Cursor<'_, RefcountBtree>, center: &Center, rule: MatchRule) -> Result<()> {
    if !center.implied && rule == MatchRule::Shared && center.rec.refcount == 1 {
        return Err(corruption(
            cur.context(),
            "shared adjustment crosses a CoW staging extent",
        ));
    }
    Ok(())
}

/// Left neighbour ending exactly at the window, and the record or gap that
/// begins the window.
fn find_left(
    cur: &mut Cursor<'_, RefcountBtree>,
    win: Window,
    rule: MatchRule,
) -> Result<Option<(RefcountRecord, Center)>> {
    if win.start == 0 || !cur.lookup(&(win.start - 1), LookupDir::Le)? {
        return Ok(None);
    }
    let left = record_at(cur)?;
    if left.end() != u64::from(win.start) || !rule.accepts(&left) {
        return Ok(None);
    }
    let center = if cur.increment()? {
        let next = record_at(cur)?;
        if next.start == win.start {
            Center::real(next)
        } else {
            let gap = u64::from(next.start - win.start).min(u64::from(win.len));
            Center::implied(win.start, gap as ExtLen)
        }
    } else {
        Center::implied(win.start, win.len)
    };
    check_center(cur, &center, rule)?;
    Ok(Some((left, center)))
}

/// Right neighbour starting exactly at the window end, and the record or
/// gap that ends the window.
fn find_right(
    cur: &mut Cursor<'_, RefcountBtree>,
    win: Window,
    rule: MatchRule,
) -> Result<Option<(RefcountRecord, Center)>> {
    let end = win.end();
    let Ok(end_key) = AgBlock::try_from(end) else {
        return Ok(None);
    };
    if !cur.lookup(&end_key, LookupDir::Ge)? {
        return Ok(None);
    }
    let right = record_at(cur)?;
    if right.start != end_key || !rule.accepts(&right) {
        return Ok(None);
    }
    let center = if cur.decrement()? {
        let prev = record_at(cur)?;
        if prev.end() == end {
            Center::real(prev)
        } else {
            let start = u64::from(win.start).max(prev.end()) as AgBlock;
            Center::implied(start, end_key - start)
        }
    } else {
        Center::implied(win.start, win.len)
    };
    check_center(cur, &center, rule)?;
    Ok(Some((right, center)))
}

/// Merges the left neighbour, the whole window and the right neighbour
/// into one record.
fn merge_center(
    cur: &mut Cursor<'_, RefcountBtree>,
    left: &RefcountRecord,
    center: &Center,
    right: &RefcountRecord,
    ulen: u64,
) -> Result<()> {
    trace!(context = %cur.context(), ?left, ?center, ?right, "refcount merge center");
    if !center.implied {
        seek(cur, center.rec.start)?;
        cur.delete()?;
    }
    seek(cur, right.start)?;
    cur.delete()?;
    let left = seek(cur, left.start)?;
    cur.update(RefcountRecord {
        len: ulen as ExtLen,
        ..left
    })
}

fn merge_left(
    cur: &mut Cursor<'_, RefcountBtree>,
    left: &RefcountRecord,
    center: &Center,
) -> Result<()> {
    trace!(context = %cur.context(), ?left, ?center, "refcount merge left");
    if !center.implied {
        seek(cur, center.rec.start)?;
        cur.delete()?;
    }
    let left = seek(cur, left.start)?;
    cur.update(RefcountRecord {
        len: left.len + center.rec.len,
        ..left
    })
}

fn merge_right(
    cur: &mut Cursor<'_, RefcountBtree>,
    right: &RefcountRecord,
    center: &Center,
) -> Result<()> {
    trace!(context = %cur.context(), ?right, ?center, "refcount merge right");
    if !center.implied {
        seek(cur, center.rec.start)?;
        cur.delete()?;
    }
    let right = seek(cur, right.start)?;
    cur.update(RefcountRecord {
        start: right.start - center.rec.len,
        len: right.len + center.rec.len,
        refcount: right.refcount,
    })
}

/// Folds the window edges into equal-valued neighbours, shrinking the
/// window by whatever was absorbed.
fn merge_extents(
    cur: &mut Cursor<'_, RefcountBtree>,
    win: &mut Window,
    adj: i64,
    rule: MatchRule,
) -> Result<()> {
    let left = find_left(cur, *win, rule)?;
    let right = find_right(cur, *win, rule)?;
    if left.is_none() && right.is_none() {
        return Ok(());
    }
    let cequal = match (&left, &right) {
        (Some((_, cl)), Some((_, cr))) => cl.same_range(cr),
        _ => false,
    };

    if let (true, Some((l, cl)), Some((r, _))) = (cequal, &left, &right) {
        let ulen = u64::from(l.len) + u64::from(cl.rec.len) + u64::from(r.len);
        if cl.mergeable()
            && i64::from(l.refcount) == cl.target(adj)
            && i64::from(r.refcount) == cl.target(adj)
            && ulen < MAX_REFC_EXTLEN
        {
            merge_center(cur, l, cl, r, ulen)?;
            win.len = 0;
            return Ok(());
        }
    }

    if let Some((l, cl)) = &left {
        let ulen = u64::from(l.len) + u64::from(cl.rec.len);
        if cl.mergeable() && i64::from(l.refcount) == cl.target(adj) && ulen < MAX_REFC_EXTLEN {
            merge_left(cur, l, cl)?;
            win.start += cl.rec.len;
            win.len -= cl.rec.len;
            if cequal {
                return Ok(());
            }
        }
    }

    if let Some((r, cr)) = &right {
        let ulen = u64::from(r.len) + u64::from(cr.rec.len);
        if cr.mergeable() && i64::from(r.refcount) == cr.target(adj) && ulen < MAX_REFC_EXTLEN {
            merge_right(cur, r, cr)?;
            win.len -= cr.rec.len;
        }
    }
    Ok(())
}

/// True when the reverse map accounts for every block of
/// `[start, start+len)`, under any owner.
fn rmap_covers(owners: &OrderedIndex<RmapBtree>, start: AgBlock, len: ExtLen) -> bool {
    let mut covered = u64::from(start);
    let end = covered + u64::from(len);
    for rec in rmap_query_range(owners, covered, end) {
        if rec.end() <= covered {
            continue;
        }
        if rec.start > covered {
            return false;
        }
        covered = rec.end();
        if covered >= end {
            return true;
        }
    }
    covered >= end
}

/// Applies `adj` to every record and gap left in the window after merging.
fn adjust_interior(
    cur: &mut Cursor<'_, RefcountBtree>,
    win: Window,
    adj: Adjustment,
    env: &AdjustEnv<'_>,
    freed: &mut FreedExtents,
) -> Result<()> {
    let ctx = cur.context();
    let Window { mut start, mut len } = win;
    cur.lookup(&start, LookupDir::Ge)?;
    while len > 0 {
        let ext = cur.get_rec()?.unwrap_or(RefcountRecord {
            start: env.ag_blocks,
            len: 0,
            refcount: 0,
        });
        if ext.start > start {
            // Blocks without a record are owned once.
            let gap = (ext.start - start).min(len);
            match adj {
                Adjustment::Increase => {
                    trace!(context = %ctx, start, len = gap, "refcount gap becomes shared");
                    cur.insert(RefcountRecord {
                        start,
                        len: gap,
                        refcount: 2,
                    })?;
                }
                Adjustment::Decrease => {
                    if let Some(owners) = env.owners {
                        if !rmap_covers(owners, start, gap) {
                            return Err(corruption(ctx, "freeing blocks that have no reverse mapping"));
                        }
                    }
                    trace!(context = %ctx, start, len = gap, "refcount gap freed");
                    freed.push(AgExtent { start, len: gap });
                }
            }
            start += gap;
            len -= gap;
            cur.lookup(&start, LookupDir::Ge)?;
            continue;
        }
        if ext.end() > u64::from(start) + u64::from(len) {
            return Err(corruption(ctx, "refcount record crosses the adjustment window"));
        }
        if ext.refcount == 1 {
            return Err(corruption(ctx, "shared adjustment crosses a CoW staging extent"));
        }
        if ext.refcount == MAX_REFCOUNT {
            // Saturated counts stay pinned.
            cur.increment()?;
        } else {
            let count = i64::from(ext.refcount) + adj.delta();
            if count > 1 {
                cur.update(RefcountRecord {
                    refcount: count as u32,
                    ..ext
                })?;
                cur.increment()?;
            } else {
                cur.delete()?;
                if count == 0 {
                    freed.push(AgExtent {
                        start: ext.start,
                        len: ext.len,
                    });
                }
            }
        }
        start += ext.len;
        len -= ext.len;
    }
    Ok(())
}

/// Adds or drops one owner of `[agbno, agbno+aglen)`. Ranges whose count
/// falls to zero are appended to `freed`.
pub(crate) fn adjust_refcount(
    cur: &mut Cursor<'_, RefcountBtree>,
    agbno: AgBlock,
    aglen: ExtLen,
    adj: Adjustment,
    env: &AdjustEnv<'_>,
    freed: &mut FreedExtents,
) -> Result<()> {
    if aglen == 0 {
        return Ok(());
    }
    trace!(context = %cur.context(), agbno, aglen, ?adj, "adjust refcount");
    let mut win = Window {
        start: agbno,
        len: aglen,
    };
    split_left(cur, agbno)?;
    split_right(cur, win.end())?;
    merge_extents(cur, &mut win, adj.delta(), MatchRule::Shared)?;
    if win.len == 0 {
        return Ok(());
    }
    adjust_interior(cur, win, adj, env, freed)
}

/// Fails when any record overlaps `[agbno, agbno+aglen)`.
fn require_unrecorded(
    cur: &mut Cursor<'_, RefcountBtree>,
    agbno: AgBlock,
    aglen: ExtLen,
) -> Result<()> {
    let end = u64::from(agbno) + u64::from(aglen);
    let mut overlaps = false;
    if cur.lookup(&agbno, LookupDir::Le)? {
        overlaps |= record_at(cur)?.end() > u64::from(agbno);
    }
    if cur.lookup(&agbno, LookupDir::Ge)? {
        overlaps |= u64::from(record_at(cur)?.start) < end;
    }
    if overlaps {
        return Err(corruption(cur.context(), "CoW staging range is already shared or staged"));
    }
    Ok(())
}

/// Records or drops a CoW staging extent at `[agbno, agbno+aglen)`.
pub(crate) fn adjust_cow(
    cur: &mut Cursor<'_, RefcountBtree>,
    agbno: AgBlock,
    aglen: ExtLen,
    op: CowAdjustment,
) -> Result<()> {
    if aglen == 0 {
        return Ok(());
    }
    let ctx = cur.context();
    trace!(context = %ctx, agbno, aglen, ?op, "adjust CoW staging");
    if op == CowAdjustment::Alloc {
        require_unrecorded(cur, agbno, aglen)?;
    }
    let mut win = Window {
        start: agbno,
        len: aglen,
    };
    split_left(cur, agbno)?;
    split_right(cur, win.end())?;
    merge_extents(cur, &mut win, op.delta(), MatchRule::Cow)?;
    if win.len == 0 {
        return Ok(());
    }
    match op {
        CowAdjustment::Alloc => cur.insert(RefcountRecord {
            start: win.start,
            len: win.len,
            refcount: 1,
        }),
        CowAdjustment::Free => {
            if !cur.lookup(&win.start, LookupDir::Eq)? {
                return Err(corruption(ctx, "CoW staging extent not found"));
            }
            let rec = record_at(cur)?;
            if rec.len != win.len || rec.refcount != 1 {
                return Err(corruption(ctx, "CoW staging extent differs from the freed range"));
            }
            cur.delete()
        }
    }
}
