#![allow(missing_docs)]

use std::io::Write;

use agmap::{
    AgError, AgNumber, CowDisposition, Fork, FsBlock, Mount, MountImage, MountOptions,
    OwnerInfo, ResvKind, Result,
};

const AG0: AgNumber = AgNumber(0);
const AG1: AgNumber = AgNumber(1);

const CONFIG: &str = r#"
uuid = "6a1f0c2e-93b4-4d57-8e21-0f3c5b7a9d10"
log_filter = "agmap=debug"

[geometry]
block_size = 1024
ag_blocks = 4096
ag_count = 2
rt_blocks = 8192

[features]
realtime_rmap = true
"#;

fn refused(image: MountImage) -> AgError {
    match Mount::mount_image(image) {
        Ok(_) => panic!("damaged image was mounted"),
        Err(err) => err,
    }
}

fn file(ino: u64, offset: u64) -> OwnerInfo {
    OwnerInfo::file(ino, Fork::Data, offset)
}

#[test]
fn configured_filesystem_survives_a_remount() -> Result<()> {
    let mut config = tempfile::NamedTempFile::new()?;
    config.write_all(CONFIG.as_bytes())?;
    let options = MountOptions::load(config.path())?;
    assert!(options.features.realtime_rmap);
    assert_eq!(options.uuid_bytes()?[0], 0x6a);

    let mount = Mount::new(options)?;
    let mut tx = mount.begin()?;
    tx.alloc_extent(AG0, 300, 12, &file(70, 0), ResvKind::None)?;
    tx.rmap_alloc(AG0, 300, 12, &file(71, 0))?;
    tx.refcount_increase(AG0, 300, 12)?;
    tx.alloc_extent(AG1, 40, 6, &OwnerInfo::bmbt(70, Fork::Data), ResvKind::None)?;
    tx.rt_rmap_alloc(1000, 64, &file(72, 0))?;
    tx.commit()?;

    let geo = *mount.geometry();
    let (low, high) = (geo.agb_to_fsb(AG0, 0), geo.agb_to_fsb(AG1, 4095));
    let map_before = mount.getfsmap(low, high)?;
    let counters_before = mount.counters();
    let image = mount.unmount()?;
    assert!(image.rt_rmap.is_some());

    let mount = Mount::mount_image(image)?;
    assert_eq!(mount.counters(), counters_before);
    assert_eq!(mount.getfsmap(low, high)?, map_before);
    assert_eq!(mount.rt_rmap_records()?.map(|recs| recs.len()), Some(1));

    // The remounted filesystem keeps working on the loaded indexes.
    let mut tx = mount.begin()?;
    tx.rmap_free(AG0, 300, 12, &file(71, 0))?;
    tx.refcount_decrease(AG0, 300, 12, None)?;
    tx.refcount_decrease(AG0, 300, 12, Some(file(70, 0)))?;
    tx.commit()?;
    assert_eq!(mount.counters().free_blocks, counters_before.free_blocks + 12);
    assert!(mount.check_ag(AG0)?.is_clean());
    Ok(())
}

#[test]
fn staging_left_in_several_ags_is_recovered() -> Result<()> {
    let mount = Mount::new(MountOptions::new().ags(4096, 2).block_size(1024))?;
    let start = mount.counters();
    let mut tx = mount.begin()?;
    tx.cow_reserve(AG0, 100, 8)?;
    tx.cow_reserve(AG0, 200, 2)?;
    tx.cow_reserve(AG1, 900, 5)?;
    tx.commit()?;
    let mut tx = mount.begin()?;
    tx.cow_unreserve(AG0, 200, 2, CowDisposition::Remapped)?;
    tx.rmap_alloc(AG0, 200, 2, &file(80, 0))?;
    tx.commit()?;
    let image = mount.unmount()?;

    let mount = Mount::mount_image(image)?;
    assert_eq!(mount.recover_cow()?, 0);
    assert_eq!(mount.counters().free_blocks, start.free_blocks - 2);
    for agno in [AG0, AG1] {
        assert!(mount.with_ag(agno, |ag| ag.refcount().is_empty())?);
        assert!(mount.check_ag(agno)?.is_clean());
    }
    assert!(mount.with_ag(AG0, |ag| ag.rmap().iter().any(|r| r.start == 200))?);
    Ok(())
}

#[test]
fn trees_from_another_ag_or_filesystem_are_refused() -> Result<()> {
    let options = MountOptions::from_toml_str(CONFIG)?;
    let image = Mount::new(options)?.unmount()?;

    let mut swapped = image.clone();
    let (left, right) = swapped.ags.split_at_mut(1);
    std::mem::swap(&mut left[0].rmap, &mut right[0].rmap);
    assert!(refused(swapped).is_corruption());

    let mut foreign = image.clone();
    foreign.options.uuid = None;
    assert!(refused(foreign).is_corruption());

    let mut no_rt = image.clone();
    no_rt.rt_rmap = None;
    assert!(refused(no_rt).is_corruption());

    let mut reflink_off = image.clone();
    reflink_off.options.features.reflink = false;
    assert!(refused(reflink_off).is_corruption());

    let mut torn = image.clone();
    if let Some(tree) = torn.ags[1].refcount.as_mut() {
        let last = tree.blocks[0].len() - 1;
        tree.blocks[0][last] ^= 0x80;
    }
    assert!(matches!(
        Mount::mount_image(torn),
        Err(AgError::BadChecksum { .. })
    ));

    let mut bad_config = image;
    bad_config.options.features.rmapbt = false;
    assert!(matches!(
        Mount::mount_image(bad_config),
        Err(AgError::Config(_))
    ));
    Ok(())
}

#[test]
fn featureless_image_carries_only_free_counts() -> Result<()> {
    let options = MountOptions::new()
        .ags(1024, 3)
        .rmapbt(false)
        .reflink(false);
    let mount = Mount::new(options)?;
    let mut tx = mount.begin()?;
    tx.alloc_extent(AgNumber(2), 10, 100, &file(5, 0), ResvKind::None)?;
    tx.commit()?;
    let before = mount.counters();

    let image = mount.unmount()?;
    assert!(image
        .ags
        .iter()
        .all(|ag| ag.rmap.is_none() && ag.refcount.is_none()));
    assert_eq!(image.ags[2].free_blocks, image.ags[0].free_blocks - 100);

    let mount = Mount::mount_image(image)?;
    assert_eq!(mount.counters(), before);
    assert!(matches!(
        mount.getfsmap(FsBlock(0), FsBlock(u64::MAX)),
        Err(AgError::Invalid(_))
    ));
    Ok(())
}
