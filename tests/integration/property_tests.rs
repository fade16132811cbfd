#![allow(missing_docs)]

use proptest::prelude::*;

use agmap::{
    AgExtent, AgNumber, CowDisposition, Fork, FsBlock, Mount, MountOptions, OwnerInfo,
    ResvKind,
};

const SLOTS: u32 = 24;
const SLOT_LEN: u32 = 8;
const MAX_OWNERS: usize = 4;

#[derive(Debug, Clone)]
enum Slot {
    Free,
    Owned(Vec<u64>),
    Staged,
}

#[derive(Debug, Clone, Copy)]
struct Step {
    slot: u32,
    choice: u8,
}

fn arb_step() -> impl Strategy<Value = Step> {
    (0..SLOTS, 0u8..4).prop_map(|(slot, choice)| Step { slot, choice })
}

/// Slots alternate between the two AGs and leave a gap so neighbours
/// never merge.
fn place(slot: u32) -> (AgNumber, u32) {
    (AgNumber(slot % 2), 16 + (slot / 2) * 2 * SLOT_LEN)
}

fn owner(ino: u64) -> OwnerInfo {
    OwnerInfo::file(ino, Fork::Data, 0)
}

fn mount() -> Mount {
    Mount::new(MountOptions::new().ags(4096, 2).block_size(1024)).unwrap()
}

fn apply(mount: &Mount, slots: &mut [Slot], step: Step) {
    let (ag, start) = place(step.slot);
    let base = u64::from(step.slot) * 10;
    let state = &mut slots[step.slot as usize];
    let mut tx = mount.begin().unwrap();
    let next = match state.clone() {
        Slot::Free if step.choice % 2 == 0 => {
            tx.alloc_extent(ag, start, SLOT_LEN, &owner(base), ResvKind::None)
                .unwrap();
            Slot::Owned(vec![base])
        }
        Slot::Free => {
            tx.cow_reserve(ag, start, SLOT_LEN).unwrap();
            Slot::Staged
        }
        Slot::Owned(mut owners) if step.choice < 2 && owners.len() < MAX_OWNERS => {
            let ino = base + owners.len() as u64;
            tx.rmap_alloc(ag, start, SLOT_LEN, &owner(ino)).unwrap();
            tx.refcount_increase(ag, start, SLOT_LEN).unwrap();
            owners.push(ino);
            Slot::Owned(owners)
        }
        Slot::Owned(mut owners) => {
            let ino = owners.pop().unwrap();
            if owners.is_empty() {
                tx.refcount_decrease(ag, start, SLOT_LEN, Some(owner(ino)))
                    .unwrap();
                Slot::Free
            } else {
                tx.rmap_free(ag, start, SLOT_LEN, &owner(ino)).unwrap();
                tx.refcount_decrease(ag, start, SLOT_LEN, None).unwrap();
                Slot::Owned(owners)
            }
        }
        Slot::Staged if step.choice < 2 => {
            tx.cow_unreserve(ag, start, SLOT_LEN, CowDisposition::Cancelled)
                .unwrap();
            Slot::Free
        }
        Slot::Staged => {
            tx.cow_unreserve(ag, start, SLOT_LEN, CowDisposition::Remapped)
                .unwrap();
            tx.rmap_alloc(ag, start, SLOT_LEN, &owner(base)).unwrap();
            Slot::Owned(vec![base])
        }
    };
    tx.commit().unwrap();
    *state = next;
}

fn conserved(mount: &Mount) -> bool {
    let per_ag: u64 = (0..2)
        .map(|agno| {
            mount
                .with_ag(AgNumber(agno), |ag| {
                    ag.space().free_blocks - ag.space().reserved_blocks
                })
                .unwrap()
        })
        .sum();
    per_ag == mount.counters().free_blocks
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_random_sharing_keeps_the_books_balanced(
        steps in prop::collection::vec(arb_step(), 1..120)
    ) {
        let mount = mount();
        let start = mount.counters().free_blocks;
        let mut slots = vec![Slot::Free; SLOTS as usize];

        for step in steps {
            apply(&mount, &mut slots, step);
            prop_assert!(conserved(&mount));
        }

        let in_use = slots
            .iter()
            .filter(|slot| !matches!(slot, Slot::Free))
            .count() as u64
            * u64::from(SLOT_LEN);
        prop_assert_eq!(mount.counters().free_blocks, start - in_use);

        for (i, slot) in slots.iter().enumerate() {
            let (ag, begin) = place(i as u32);
            let shared = mount.refcount_find_shared(ag, begin, SLOT_LEN, false).unwrap();
            let expect = match slot {
                Slot::Owned(owners) if owners.len() > 1 => Some(AgExtent {
                    start: begin,
                    len: SLOT_LEN,
                }),
                _ => None,
            };
            prop_assert_eq!(shared, expect);
        }
        for agno in 0..2 {
            let report = mount.check_ag(AgNumber(agno)).unwrap();
            prop_assert!(report.is_clean(), "{:?}", report);
        }
    }

    #[test]
    fn prop_remount_preserves_the_mappings(
        steps in prop::collection::vec(arb_step(), 1..60)
    ) {
        let mount = mount();
        let mut slots = vec![Slot::Free; SLOTS as usize];
        for step in steps {
            apply(&mount, &mut slots, step);
        }
        let shared_slots = slots
            .iter()
            .filter(|slot| matches!(slot, Slot::Owned(owners) if owners.len() > 1))
            .count();
        let geo = *mount.geometry();
        let (low, high) = (FsBlock(0), geo.agb_to_fsb(AgNumber(1), geo.ag_blocks - 1));
        let owned: Vec<_> = mount
            .getfsmap(low, high)
            .unwrap()
            .into_iter()
            .filter(|row| row.owner.is_inode())
            .collect();

        let image = mount.unmount().unwrap();
        let mount = Mount::mount_image(image).unwrap();
        let after: Vec<_> = mount
            .getfsmap(low, high)
            .unwrap()
            .into_iter()
            .filter(|row| row.owner.is_inode())
            .collect();
        prop_assert_eq!(after, owned);
        prop_assert!(conserved(&mount));
        prop_assert_eq!(mount.recover_cow().unwrap(), 0);
        let leftover: usize = (0..2)
            .map(|agno| mount.with_ag(AgNumber(agno), |ag| ag.refcount().len()).unwrap())
            .sum();
        prop_assert_eq!(leftover, shared_slots);
        for agno in 0..2 {
            prop_assert!(mount.check_ag(AgNumber(agno)).unwrap().is_clean());
        }
    }
}
