use tracing::trace;

use crate::error::{corruption, AgError, Result};
use crate::index::{Cursor, CursorContext, IndexFlavor, LookupDir};
use crate::types::{ExtLen, Owner, OwnerInfo, SpecialOwner};

use super::{rmap_query_range, RmapKey, RmapRecord, RMAP_LEN_MAX};

fn same_fork(a: &RmapRecord, b: &RmapRecord) -> bool {
    a.flags.attr_fork == b.flags.attr_fork && a.flags.bmbt_block == b.flags.bmbt_block
}

/// Whether `rec` may be merged with a new written mapping `new`.
fn mergeable(rec: &RmapRecord, new: &RmapRecord) -> bool {
    rec.owner != Owner::Special(SpecialOwner::Null)
        && rec.owner == new.owner
        && !rec.flags.unwritten
        && same_fork(rec, new)
}

/// `left` ends where `right` begins, physically and logically.
fn contiguous(left: &RmapRecord, right: &RmapRecord) -> bool {
    left.end() == right.start
        && (!left.has_logical_offset() || left.offset + u64::from(left.len) == right.offset)
}

/// `rec` and `new` describe overlapping blocks of the same mapping.
fn same_mapping_overlaps(rec: &RmapRecord, new: &RmapRecord) -> bool {
    if rec.owner != new.owner || !same_fork(rec, new) {
        return false;
    }
    if rec.start >= new.end() || new.start >= rec.end() {
        return false;
    }
    !rec.has_logical_offset()
        || i128::from(rec.offset) - i128::from(rec.start)
            == i128::from(new.offset) - i128::from(new.start)
}

fn require_left_bound(ctx: CursorContext, found: bool) -> Result<()> {
    if !found && matches!(ctx, CursorContext::Ag(_)) {
        return Err(corruption(ctx, "no reverse mapping at or before the AG header"));
    }
    Ok(())
}

/// Walks back from the cursor to the nearest record of `new`'s owner and
/// fork that could still touch `new`. Records of other owners sharing the
/// blocks are skipped.
fn nearest_same_owner<F>(cur: &mut Cursor<'_, F>, new: &RmapRecord) -> Result<Option<RmapRecord>>
where
    F: IndexFlavor<Key = RmapKey, Rec = RmapRecord>,
{
    let reach = cur.index().longest_extent();
    while let Some(rec) = cur.get_rec()? {
        if rec.start.saturating_add(reach) < new.start {
            break;
        }
        if rec.owner == new.owner && same_fork(&rec, new) {
            return Ok(Some(rec));
        }
        if !cur.decrement()? {
            break;
        }
    }
    Ok(None)
}

/// Records that `len` blocks at `bno` now belong to `oinfo`, merging with
/// physically and logically adjacent records of the same owner.
pub fn rmap_alloc<F>(cur: &mut Cursor<'_, F>, bno: u64, len: ExtLen, oinfo: &OwnerInfo) -> Result<()>
where
    F: IndexFlavor<Key = RmapKey, Rec = RmapRecord>,
{
    let ctx = cur.context();
    if len == 0 || len > RMAP_LEN_MAX {
        return Err(AgError::Invalid("reverse mapping length out of range"));
    }
    trace!(context = %ctx, bno, len, owner = %oinfo.owner, offset = oinfo.offset, "rmap alloc");
    let new = RmapRecord::from_owner(bno, len, oinfo);
    new.check_offset()?;

    let found = cur.lookup(&new.key(), LookupDir::Le)?;
    require_left_bound(ctx, found)?;
    let left = nearest_same_owner(cur, &new)?;
    if let Some(l) = &left {
        if same_mapping_overlaps(l, &new) {
            return Err(corruption(ctx, "allocated range is already mapped to this owner"));
        }
    }
    let left = left.filter(|l| mergeable(l, &new) && contiguous(l, &new));

    // Any same-mapping record starting inside the new range is a double map.
    cur.lookup(
        &RmapKey {
            start: bno,
            owner: 0,
            offset: 0,
        },
        LookupDir::Ge,
    )?;
    while let Some(rec) = cur.get_rec()? {
        if rec.start >= new.end() {
            break;
        }
        if same_mapping_overlaps(&rec, &new) {
            return Err(corruption(ctx, "allocated range is already mapped to this owner"));
        }
        cur.increment()?;
    }

    let right_key = RmapRecord {
        start: new.end(),
        offset: if new.has_logical_offset() {
            new.offset + u64::from(len)
        } else {
            new.offset
        },
        ..new
    }
    .key();
    let right = if cur.lookup(&right_key, LookupDir::Eq)? {
        cur.get_rec()?
            .filter(|r| mergeable(r, &new) && contiguous(&new, r))
    } else {
        None
    };

    let fits = |total: u64| total <= u64::from(RMAP_LEN_MAX);
    let left = left.filter(|l| fits(u64::from(l.len) + u64::from(len)));
    let right = right.filter(|r| fits(u64::from(r.len) + u64::from(len)));

    match (left, right) {
        (Some(l), Some(r)) if fits(u64::from(l.len) + u64::from(len) + u64::from(r.len)) => {
            cur.lookup(&r.key(), LookupDir::Eq)?;
            cur.delete()?;
            cur.lookup(&l.key(), LookupDir::Eq)?;
            cur.update(RmapRecord {
                len: l.len + len + r.len,
                ..l
            })
        }
        (Some(l), _) => {
            cur.lookup(&l.key(), LookupDir::Eq)?;
            cur.update(RmapRecord {
                len: l.len + len,
                ..l
            })
        }
        (None, Some(r)) => {
            cur.lookup(&r.key(), LookupDir::Eq)?;
            cur.update(RmapRecord {
                start: bno,
                len: r.len + len,
                offset: new.offset,
                ..r
            })
        }
        (None, None) => cur.insert(new),
    }
}

/// Walks back from the cursor to the record of `target`'s owner that
/// covers the whole target range at the matching logical offset.
fn find_covering<F>(
    cur: &mut Cursor<'_, F>,
    target: &RmapRecord,
    any_owner: bool,
) -> Result<Option<RmapRecord>>
where
    F: IndexFlavor<Key = RmapKey, Rec = RmapRecord>,
{
    let reach = cur.index().longest_extent();
    while let Some(rec) = cur.get_rec()? {
        if rec.start.saturating_add(reach) < target.end() {
            break;
        }
        let owner_ok = any_owner || rec.owner == target.owner;
        if owner_ok
            && same_fork(&rec, target)
            && rec.start <= target.start
            && rec.end() >= target.end()
            && (any_owner
                || !rec.has_logical_offset()
                || rec.offset + (target.start - rec.start) == target.offset)
        {
            return Ok(Some(rec));
        }
        if !cur.decrement()? {
            break;
        }
    }
    Ok(None)
}

/// Removes `oinfo`'s ownership of `len` blocks at `bno`, trimming or
/// splitting the covering record.
pub fn rmap_free<F>(cur: &mut Cursor<'_, F>, bno: u64, len: ExtLen, oinfo: &OwnerInfo) -> Result<()>
where
    F: IndexFlavor<Key = RmapKey, Rec = RmapRecord>,
{
    let ctx = cur.context();
    if len == 0 {
        return Err(AgError::Invalid("reverse mapping length out of range"));
    }
    trace!(context = %ctx, bno, len, owner = %oinfo.owner, offset = oinfo.offset, "rmap free");
    let target = RmapRecord::from_owner(bno, len, oinfo);
    target.check_offset()?;

    if oinfo.owner == Owner::Special(SpecialOwner::Null) {
        // Space being added to the filesystem must not be mapped.
        if rmap_query_range(cur.index(), bno, target.end()).next().is_some() {
            return Err(corruption(ctx, "new free space overlaps an existing mapping"));
        }
        return Ok(());
    }

    let search = RmapKey {
        start: bno,
        owner: u64::MAX,
        offset: u64::MAX,
    };
    let found = cur.lookup(&search, LookupDir::Le)?;
    require_left_bound(ctx, found)?;
    let any_owner = oinfo.owner == Owner::Special(SpecialOwner::Unknown);
    let rec = find_covering(cur, &target, any_owner)?.ok_or_else(|| {
        corruption(ctx, "freed range is not covered by a matching reverse mapping")
    })?;

    cur.lookup(&rec.key(), LookupDir::Eq)?;
    let end = target.end();
    if rec.start == bno && rec.len == len {
        cur.delete()
    } else if rec.start == bno {
        cur.update(RmapRecord {
            start: end,
            len: rec.len - len,
            offset: if rec.has_logical_offset() {
                rec.offset + u64::from(len)
            } else {
                rec.offset
            },
            ..rec
        })
    } else if rec.end() == end {
        cur.update(RmapRecord {
            len: rec.len - len,
            ..rec
        })
    } else {
        let left_len = (bno - rec.start) as ExtLen;
        cur.update(RmapRecord {
            len: left_len,
            ..rec
        })?;
        cur.insert(RmapRecord {
            start: end,
            len: (rec.end() - end) as ExtLen,
            offset: if rec.has_logical_offset() {
                rec.offset + (end - rec.start)
            } else {
                rec.offset
            },
            ..rec
        })
    }
}

/// Inserts exactly `rec`; the key must be absent.
pub fn rmap_insert_exact<F>(cur: &mut Cursor<'_, F>, rec: RmapRecord) -> Result<()>
where
    F: IndexFlavor<Key = RmapKey, Rec = RmapRecord>,
{
    if rec.len == 0 || rec.len > RMAP_LEN_MAX {
        return Err(corruption(cur.context(), "reverse mapping length out of range"));
    }
    rec.check_offset()?;
    if cur.lookup(&rec.key(), LookupDir::Eq)? {
        return Err(corruption(cur.context(), "reverse mapping already present"));
    }
    cur.insert(rec)
}

/// Deletes exactly `rec`; the stored record must match length and state.
pub fn rmap_delete_exact<F>(cur: &mut Cursor<'_, F>, rec: RmapRecord) -> Result<()>
where
    F: IndexFlavor<Key = RmapKey, Rec = RmapRecord>,
{
    position_exact(cur, &rec)?;
    cur.delete()
}

/// Changes the length of exactly `rec` to `new_len`.
pub fn rmap_resize<F>(cur: &mut Cursor<'_, F>, rec: RmapRecord, new_len: u64) -> Result<()>
where
    F: IndexFlavor<Key = RmapKey, Rec = RmapRecord>,
{
    if new_len == 0 || new_len > u64::from(RMAP_LEN_MAX) {
        return Err(corruption(cur.context(), "resized reverse mapping length out of range"));
    }
    let resized = RmapRecord {
        len: new_len as ExtLen,
        ..rec
    };
    resized.check_offset()?;
    position_exact(cur, &rec)?;
    cur.update(resized)
}

fn position_exact<F>(cur: &mut Cursor<'_, F>, rec: &RmapRecord) -> Result<()>
where
    F: IndexFlavor<Key = RmapKey, Rec = RmapRecord>,
{
    if !cur.lookup(&rec.key(), LookupDir::Eq)? {
        return Err(corruption(cur.context(), "reverse mapping not found"));
    }
    match cur.get_rec()? {
        Some(got) if got.len == rec.len && got.flags.unwritten == rec.flags.unwritten => Ok(()),
        _ => Err(corruption(cur.context(), "reverse mapping differs from the expected extent")),
    }
}
