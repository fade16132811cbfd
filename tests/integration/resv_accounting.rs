#![allow(missing_docs)]

use std::thread;

use agmap::{
    AgError, AgNumber, Fork, Mount, MountOptions, OwnerInfo, ResvClass, ResvKind, Result,
};

fn mount(ag_count: u32) -> Result<Mount> {
    Mount::new(MountOptions::new().ags(2048, ag_count).block_size(1024))
}

fn conserved(mount: &Mount) -> Result<bool> {
    let mut total = 0;
    for agno in 0..mount.geometry().ag_count {
        total += mount.with_ag(AgNumber(agno), |ag| {
            ag.space().free_blocks - ag.space().reserved_blocks
        })?;
    }
    Ok(total == mount.counters().free_blocks)
}

#[test]
fn pools_cover_every_ag() -> Result<()> {
    let mount = mount(4)?;
    let meta = mount.pool_size(ResvClass::Metadata);
    let rmap = mount.pool_size(ResvClass::Rmapbt);
    assert!(meta > 1);
    assert!(rmap >= 2048 / 100);
    for agno in 0..4 {
        let (reserved, agfl) = mount.with_ag(AgNumber(agno), |ag| {
            (ag.space().reserved_blocks, ag.space().agfl_reserved_blocks)
        })?;
        assert_eq!(reserved, (meta - 1) + (rmap - 1));
        assert_eq!(agfl, rmap - 1);
    }
    assert_eq!(
        mount.counters().ag_max_usable,
        mount.ag_usable_blocks() - meta - rmap
    );
    assert!(conserved(&mount)?);
    Ok(())
}

#[test]
fn freeing_and_recreating_pools_round_trips() -> Result<()> {
    let mount = mount(2)?;
    let start = mount.counters();
    mount.refcount_reserve_pool_free()?;
    mount.rmap_reserve_pool_free()?;
    let bare = mount.counters();
    assert_eq!(bare.ag_max_usable, mount.ag_usable_blocks());
    assert_eq!(bare.free_blocks, 2 * mount.ag_usable_blocks());
    assert!(conserved(&mount)?);

    mount.refcount_reserve_pool_free()?;
    assert_eq!(mount.counters(), bare);

    mount.rmap_reserve_pool_init()?;
    mount.refcount_reserve_pool_init()?;
    assert_eq!(mount.counters(), start);
    assert!(conserved(&mount)?);
    Ok(())
}

#[test]
fn oversized_reservation_fails_cleanly() -> Result<()> {
    let mount = mount(1)?;
    let ag = AgNumber(0);
    let before = mount.counters();
    mount.ag_resv_free(ag, ResvClass::Metadata)?;
    let freed = mount.counters();
    let err = mount
        .ag_resv_init(ag, ResvClass::Metadata, 1_000_000, 0)
        .expect_err("larger than the AG");
    assert!(matches!(err, AgError::NoSpace(_)));
    assert_eq!(mount.counters(), freed);
    assert!(mount
        .with_ag(ag, |ag| ag.space().resv(ResvClass::Metadata).is_none())?);

    let pool = mount.pool_size(ResvClass::Metadata);
    mount.ag_resv_init(ag, ResvClass::Metadata, pool, 1)?;
    assert_eq!(mount.counters(), before);
    Ok(())
}

#[test]
fn ordinary_allocations_cannot_touch_reserved_blocks() -> Result<()> {
    let mount = mount(1)?;
    let ag = AgNumber(0);
    let needed = mount.ag_resv_needed(ag, ResvKind::None)?;
    let free = mount.with_ag(ag, |ag| ag.space().free_blocks)?;
    let header = mount.geometry().ag_header_blocks;
    let take = (free - needed) as u32;

    let mut tx = mount.begin()?;
    tx.alloc_extent(ag, header, take, &OwnerInfo::file(3, Fork::Data, 0), ResvKind::None)?;
    let err = tx
        .alloc_extent(ag, header + take, 1, &OwnerInfo::file(3, Fork::Data, 0), ResvKind::None)
        .expect_err("reserved");
    assert!(matches!(err, AgError::NoSpace(_)));
    tx.commit()?;
    assert_eq!(mount.counters().free_blocks, 0);

    let mut tx = mount.begin()?;
    tx.ag_resv_alloc_block(ag, ResvClass::Metadata)?;
    tx.ag_resv_alloc_block(ag, ResvClass::Rmapbt)?;
    tx.commit()?;
    assert_eq!(mount.counters().free_blocks, 0);
    assert!(conserved(&mount)?);
    Ok(())
}

#[test]
fn growth_past_the_pool_shrinks_the_usable_size() -> Result<()> {
    let mount = mount(1)?;
    let ag = AgNumber(0);
    let pool = mount.pool_size(ResvClass::Metadata);
    let start = mount.counters();
    let mut tx = mount.begin()?;
    for _ in 0..pool + 2 {
        tx.ag_resv_alloc_block(ag, ResvClass::Metadata)?;
    }
    tx.commit()?;
    let after = mount.counters();
    assert_eq!(after.ag_max_usable, start.ag_max_usable - 3);
    assert_eq!(after.free_blocks, start.free_blocks - 3);
    assert!(conserved(&mount)?);

    let mut tx = mount.begin()?;
    for _ in 0..pool + 2 {
        tx.ag_resv_free_block(ag, ResvClass::Metadata)?;
    }
    tx.commit()?;
    let held = mount.with_ag(ag, |ag| ag.space().resv(ResvClass::Metadata).copied())?;
    assert_eq!(held.map(|r| (r.asked, r.used)), Some((pool + 3, 1)));
    assert_eq!(mount.counters().ag_max_usable, start.ag_max_usable - 3);
    assert!(conserved(&mount)?);

    let mut tx = mount.begin()?;
    tx.ag_resv_free_block(ag, ResvClass::Metadata)?;
    let err = tx
        .ag_resv_free_block(ag, ResvClass::Metadata)
        .expect_err("nothing left to return");
    assert!(matches!(err, AgError::Invalid(_)));
    tx.commit()?;
    assert!(conserved(&mount)?);
    Ok(())
}

#[test]
fn parallel_transactions_on_separate_ags_conserve_space() -> Result<()> {
    let mount = mount(4)?;
    let start = mount.counters().free_blocks;
    let results: Vec<Result<()>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..4u32)
            .map(|agno| {
                let mount = &mount;
                scope.spawn(move || -> Result<()> {
                    let ag = AgNumber(agno);
                    let ino = 100 + u64::from(agno);
                    for round in 0..50u32 {
                        let owner = OwnerInfo::file(ino, Fork::Data, u64::from(round) * 8);
                        let mut tx = mount.begin()?;
                        tx.alloc_extent(ag, 10 + round * 8, 8, &owner, ResvKind::None)?;
                        tx.commit()?;
                    }
                    for round in 0..50u32 {
                        let owner = OwnerInfo::file(ino, Fork::Data, u64::from(round) * 8);
                        let mut tx = mount.begin()?;
                        tx.free_extent(ag, 10 + round * 8, 8, Some(owner))?;
                        tx.commit()?;
                    }
                    Ok(())
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("worker panicked"))
            .collect()
    });
    for result in results {
        result?;
    }
    assert!(!mount.is_shutdown());
    assert_eq!(mount.counters().free_blocks, start);
    assert!(conserved(&mount)?);
    for agno in 0..4 {
        assert!(mount.check_ag(AgNumber(agno))?.is_clean());
    }
    Ok(())
}
