#![allow(missing_docs)]

use agmap::refcount::RefcountRecord;
use agmap::{
    AgExtent, AgNumber, CowDisposition, Fork, Mount, MountOptions, OwnerInfo, ResvKind, Result,
};

const AG0: AgNumber = AgNumber(0);
const AG1: AgNumber = AgNumber(1);

fn mount() -> Result<Mount> {
    Mount::new(MountOptions::new().ags(4096, 2).block_size(1024))
}

fn file(ino: u64, offset: u64) -> OwnerInfo {
    OwnerInfo::file(ino, Fork::Data, offset)
}

fn rc(start: u32, len: u32, refcount: u32) -> RefcountRecord {
    RefcountRecord {
        start,
        len,
        refcount,
    }
}

fn refcounts(mount: &Mount, agno: AgNumber) -> Result<Vec<RefcountRecord>> {
    mount.with_ag(agno, |ag| ag.refcount().iter().copied().collect())
}

/// Maps `len` blocks at `start` into three files and records the sharing.
fn share_three_ways(mount: &Mount, start: u32, len: u32) -> Result<()> {
    let mut tx = mount.begin()?;
    tx.alloc_extent(AG0, start, len, &file(10, 0), ResvKind::None)?;
    for ino in [11, 12] {
        tx.rmap_alloc(AG0, start, len, &file(ino, 0))?;
        tx.refcount_increase(AG0, start, len)?;
    }
    tx.commit()
}

#[test]
fn three_way_share_then_partial_unshare() -> Result<()> {
    let mount = mount()?;
    share_three_ways(&mount, 100, 16)?;
    assert_eq!(refcounts(&mount, AG0)?, vec![rc(100, 16, 3)]);

    let mut tx = mount.begin()?;
    tx.rmap_free(AG0, 104, 4, &file(11, 4))?;
    tx.refcount_decrease(AG0, 104, 4, Some(file(11, 4)))?;
    assert!(tx.pending_frees().is_empty());
    tx.commit()?;

    assert_eq!(
        refcounts(&mount, AG0)?,
        vec![rc(100, 4, 3), rc(104, 4, 2), rc(108, 8, 3)]
    );
    assert_eq!(
        mount.refcount_find_shared(AG0, 90, 40, true)?,
        Some(AgExtent { start: 100, len: 16 })
    );
    assert_eq!(
        mount.refcount_find_shared(AG0, 102, 40, false)?,
        Some(AgExtent { start: 102, len: 2 })
    );
    assert!(mount.check_ag(AG0)?.is_clean());

    let mut tx = mount.begin()?;
    tx.rmap_free(AG0, 100, 4, &file(11, 0))?;
    tx.rmap_free(AG0, 108, 8, &file(11, 8))?;
    tx.refcount_decrease(AG0, 100, 4, Some(file(11, 0)))?;
    tx.refcount_decrease(AG0, 108, 8, Some(file(11, 8)))?;
    tx.commit()?;
    assert_eq!(refcounts(&mount, AG0)?, vec![rc(100, 16, 2)]);
    assert!(mount.check_ag(AG0)?.is_clean());
    Ok(())
}

#[test]
fn last_reference_returns_the_blocks() -> Result<()> {
    let mount = mount()?;
    let start = mount.counters().free_blocks;
    share_three_ways(&mount, 500, 8)?;
    assert_eq!(mount.counters().free_blocks, start - 8);

    let mut tx = mount.begin()?;
    for ino in [12, 11] {
        tx.rmap_free(AG0, 500, 8, &file(ino, 0))?;
        tx.refcount_decrease(AG0, 500, 8, None)?;
    }
    tx.refcount_decrease(AG0, 500, 8, Some(file(10, 0)))?;
    assert_eq!(tx.pending_frees().len(), 1);
    tx.commit()?;

    assert!(refcounts(&mount, AG0)?.is_empty());
    assert_eq!(mount.counters().free_blocks, start);
    assert_eq!(mount.with_ag(AG0, |ag| ag.rmap().len())?, 1);
    Ok(())
}

#[test]
fn copy_on_write_moves_one_owner_to_new_blocks() -> Result<()> {
    let mount = mount()?;
    let start = mount.counters().free_blocks;
    let (a, b) = (file(20, 0), file(21, 0));

    let mut tx = mount.begin()?;
    tx.alloc_extent(AG1, 200, 4, &a, ResvKind::None)?;
    tx.rmap_alloc(AG1, 200, 4, &b)?;
    tx.refcount_increase(AG1, 200, 4)?;
    tx.cow_reserve(AG1, 300, 4)?;
    tx.commit()?;
    assert_eq!(refcounts(&mount, AG1)?, vec![rc(200, 4, 2), rc(300, 4, 1)]);
    assert!(mount.check_ag(AG1)?.is_clean());

    let mut tx = mount.begin()?;
    tx.cow_unreserve(AG1, 300, 4, CowDisposition::Remapped)?;
    tx.rmap_alloc(AG1, 300, 4, &a)?;
    tx.rmap_free(AG1, 200, 4, &a)?;
    tx.refcount_decrease(AG1, 200, 4, Some(a))?;
    tx.commit()?;

    assert!(refcounts(&mount, AG1)?.is_empty());
    assert_eq!(mount.counters().free_blocks, start - 8);
    let owners: Vec<(u64, u64)> = mount.with_ag(AG1, |ag| {
        ag.rmap()
            .iter()
            .filter(|r| r.owner.is_inode())
            .map(|r| (r.start, r.owner.raw()))
            .collect()
    })?;
    assert_eq!(owners, vec![(200, 21), (300, 20)]);
    assert!(mount.check_ag(AG1)?.is_clean());
    Ok(())
}

#[test]
fn adjacent_staging_extents_merge() -> Result<()> {
    let mount = mount()?;
    let mut tx = mount.begin()?;
    tx.cow_reserve(AG0, 700, 4)?;
    tx.cow_reserve(AG0, 704, 4)?;
    tx.commit()?;
    assert_eq!(refcounts(&mount, AG0)?, vec![rc(700, 8, 1)]);

    let mut tx = mount.begin()?;
    tx.cow_unreserve(AG0, 702, 2, CowDisposition::Cancelled)?;
    tx.commit()?;
    assert_eq!(refcounts(&mount, AG0)?, vec![rc(700, 2, 1), rc(704, 4, 1)]);
    Ok(())
}

#[test]
fn sharing_over_staging_is_refused() -> Result<()> {
    let mount = mount()?;
    let mut tx = mount.begin()?;
    tx.cow_reserve(AG0, 400, 4)?;
    tx.commit()?;

    let mut tx = mount.begin()?;
    let err = tx.refcount_increase(AG0, 400, 4).expect_err("staging");
    assert!(err.is_corruption());
    tx.cancel();
    assert!(mount.is_shutdown());
    Ok(())
}

#[test]
fn put_extent_takes_filesystem_block_numbers() -> Result<()> {
    let mount = mount()?;
    let start = mount.counters().free_blocks;
    let mut tx = mount.begin()?;
    tx.alloc_extent(AG1, 900, 6, &file(30, 0), ResvKind::None)?;
    tx.commit()?;

    let fsbno = mount.geometry().agb_to_fsb(AG1, 900);
    let mut tx = mount.begin()?;
    tx.refcount_put_extent(fsbno, 6, Some(file(30, 0)))?;
    let pending = tx.pending_frees().to_vec();
    tx.commit()?;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].agno, AG1);
    assert_eq!(pending[0].extent, AgExtent { start: 900, len: 6 });
    assert_eq!(mount.counters().free_blocks, start);

    let mut tx = mount.begin()?;
    let past_end = mount.geometry().agb_to_fsb(AG1, 4094);
    assert!(tx.refcount_put_extent(past_end, 6, None).is_err());
    tx.cancel();
    assert!(!mount.is_shutdown());
    Ok(())
}
