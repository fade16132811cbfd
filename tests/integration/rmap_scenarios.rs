#![allow(missing_docs)]

use agmap::rmap::RmapRecord;
use agmap::{
    AgNumber, BmapExtent, Fork, IntentQueue, Mount, MountOptions, Owner, OwnerInfo, ResvKind,
    Result, SpecialOwner,
};

const AG0: AgNumber = AgNumber(0);
const AG2: AgNumber = AgNumber(2);

fn mount() -> Result<Mount> {
    Mount::new(MountOptions::new().ags(2048, 3))
}

fn file(ino: u64, offset: u64) -> OwnerInfo {
    OwnerInfo::file(ino, Fork::Data, offset)
}

fn rmaps(mount: &Mount, agno: AgNumber) -> Result<Vec<RmapRecord>> {
    mount.with_ag(agno, |ag| ag.rmap().iter().copied().collect())
}

fn file_rmaps(mount: &Mount, agno: AgNumber) -> Result<Vec<(u64, u32, u64, u64)>> {
    Ok(rmaps(mount, agno)?
        .into_iter()
        .filter(|r| r.owner.is_inode())
        .map(|r| (r.start, r.len, r.owner.raw(), r.offset))
        .collect())
}

#[test]
fn appending_writes_extend_one_record() -> Result<()> {
    let mount = mount()?;
    let mut tx = mount.begin()?;
    for step in 0..4u32 {
        tx.alloc_extent(AG0, 100 + step * 4, 4, &file(7, u64::from(step) * 4), ResvKind::None)?;
    }
    tx.commit()?;
    assert_eq!(file_rmaps(&mount, AG0)?, vec![(100, 16, 7, 0)]);
    assert!(mount.check_ag(AG0)?.is_clean());
    Ok(())
}

#[test]
fn punching_a_hole_splits_the_mapping() -> Result<()> {
    let mount = mount()?;
    let start = mount.counters().free_blocks;
    let mut tx = mount.begin()?;
    tx.alloc_extent(AG0, 200, 30, &file(8, 1000), ResvKind::None)?;
    tx.commit()?;

    let mut tx = mount.begin()?;
    tx.free_extent(AG0, 210, 5, Some(file(8, 1010)))?;
    tx.free_extent(AG0, 225, 5, Some(file(8, 1025)))?;
    tx.commit()?;
    assert_eq!(
        file_rmaps(&mount, AG0)?,
        vec![(200, 10, 8, 1000), (215, 10, 8, 1015)]
    );
    assert_eq!(mount.counters().free_blocks, start - 20);
    Ok(())
}

#[test]
fn forks_and_owners_never_merge() -> Result<()> {
    let mount = mount()?;
    let mut tx = mount.begin()?;
    tx.alloc_extent(AG0, 300, 4, &file(9, 0), ResvKind::None)?;
    tx.alloc_extent(AG0, 304, 4, &OwnerInfo::file(9, Fork::Attr, 4), ResvKind::None)?;
    tx.alloc_extent(AG0, 308, 4, &file(10, 8), ResvKind::None)?;
    tx.alloc_extent(AG0, 312, 2, &OwnerInfo::bmbt(10, Fork::Data), ResvKind::None)?;
    tx.alloc_extent(AG0, 314, 2, &OwnerInfo::bmbt(10, Fork::Data), ResvKind::None)?;
    tx.commit()?;

    let recs: Vec<RmapRecord> = rmaps(&mount, AG0)?
        .into_iter()
        .filter(|r| r.start >= 300)
        .collect();
    assert_eq!(recs.len(), 4);
    assert!(recs[1].flags.attr_fork);
    assert!(recs[3].flags.bmbt_block);
    assert_eq!(recs[3].len, 4);
    assert!(mount.check_ag(AG0)?.is_clean());
    Ok(())
}

#[test]
fn metadata_owners_share_one_record_per_run() -> Result<()> {
    let mount = mount()?;
    let ag_owner = OwnerInfo::special(SpecialOwner::Ag);
    let mut tx = mount.begin()?;
    tx.alloc_extent(AG2, 10, 1, &ag_owner, ResvKind::AgflRefill)?;
    tx.alloc_extent(AG2, 11, 1, &ag_owner, ResvKind::AgflRefill)?;
    tx.alloc_extent(AG2, 12, 1, &ag_owner, ResvKind::AgflRefill)?;
    tx.commit()?;
    let recs = rmaps(&mount, AG2)?;
    assert_eq!(recs.len(), 2);
    assert_eq!(recs[1].owner, Owner::Special(SpecialOwner::Ag));
    assert_eq!((recs[1].start, recs[1].len), (10, 3));

    let mut tx = mount.begin()?;
    tx.rmap_free(AG2, 11, 1, &OwnerInfo::special(SpecialOwner::Unknown))?;
    tx.free_extent(AG2, 11, 1, None)?;
    tx.commit()?;
    let recs = rmaps(&mount, AG2)?;
    assert_eq!(recs.len(), 3);
    Ok(())
}

#[test]
fn unknown_frees_are_refused() -> Result<()> {
    let mount = mount()?;
    let mut tx = mount.begin()?;
    let err = tx.rmap_free(AG0, 500, 4, &file(7, 0)).expect_err("nothing mapped");
    assert!(err.is_corruption());
    tx.cancel();
    assert!(mount.is_shutdown());
    Ok(())
}

#[test]
fn deferred_intents_follow_the_block_map() -> Result<()> {
    let mount = mount()?;
    let geo = *mount.geometry();
    let mut queue = IntentQueue::new(geo);
    let first = BmapExtent::real(0, geo.agb_to_fsb(AG2, 400), 8);
    let second = BmapExtent::real(8, geo.agb_to_fsb(AG2, 408), 8);
    let elsewhere = BmapExtent::real(100, geo.agb_to_fsb(AG0, 900), 2);

    queue.insert(40, Fork::Data, first)?;
    queue.insert(40, Fork::Data, second)?;
    queue.insert(40, Fork::Data, elsewhere)?;
    queue.left_combine(40, Fork::Data, first, second)?;
    assert_eq!(queue.len(), 4);

    let mut tx = mount.begin()?;
    assert_eq!(tx.rmap_finish(&mut queue)?, 4);
    tx.commit()?;
    assert_eq!(file_rmaps(&mount, AG2)?, vec![(400, 16, 40, 0)]);
    assert_eq!(file_rmaps(&mount, AG0)?, vec![(900, 2, 40, 100)]);

    let merged = BmapExtent::real(0, geo.agb_to_fsb(AG2, 400), 16);
    queue.resize(40, Fork::Data, merged, -6)?;
    queue.slide(40, Fork::Data, BmapExtent::real(0, geo.agb_to_fsb(AG2, 400), 10), 50)?;
    queue.delete(40, Fork::Data, elsewhere)?;
    let mut tx = mount.begin()?;
    assert_eq!(tx.rmap_apply_queued(&mut queue)?, 3);
    tx.commit()?;
    assert_eq!(file_rmaps(&mount, AG2)?, vec![(400, 10, 40, 50)]);
    assert!(file_rmaps(&mount, AG0)?.is_empty());
    Ok(())
}

#[test]
fn cancelled_queue_changes_nothing() -> Result<()> {
    let mount = mount()?;
    let geo = *mount.geometry();
    let mut queue = IntentQueue::new(geo);
    queue.insert(41, Fork::Data, BmapExtent::real(0, geo.agb_to_fsb(AG0, 50), 4))?;
    queue.insert(41, Fork::Attr, BmapExtent::real(0, geo.agb_to_fsb(AG0, 60), 4).unwritten())?;
    assert_eq!(queue.cancel(), 2);

    let mut tx = mount.begin()?;
    assert_eq!(tx.rmap_apply_queued(&mut queue)?, 0);
    tx.commit()?;
    assert!(file_rmaps(&mount, AG0)?.is_empty());
    Ok(())
}

#[test]
fn fsmap_spans_allocation_groups() -> Result<()> {
    let mount = mount()?;
    let geo = *mount.geometry();
    let mut tx = mount.begin()?;
    tx.alloc_extent(AG0, 2000, 48, &file(50, 0), ResvKind::None)?;
    tx.alloc_extent(AgNumber(1), 4, 10, &file(51, 0), ResvKind::None)?;
    tx.alloc_extent(AG2, 100, 5, &file(52, 0), ResvKind::None)?;
    tx.commit()?;

    let rows = mount.getfsmap(geo.agb_to_fsb(AG0, 2040), geo.agb_to_fsb(AgNumber(1), 20))?;
    let owners: Vec<Owner> = rows.iter().map(|r| r.owner).collect();
    assert_eq!(
        owners,
        vec![
            Owner::Inode(50),
            Owner::Special(SpecialOwner::Fs),
            Owner::Inode(51)
        ]
    );
    assert_eq!(rows[0].start, geo.agb_to_fsb(AG0, 2000));
    assert!(rows.iter().all(|r| !r.shared));
    Ok(())
}
