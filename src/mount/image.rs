//! Persisting a session as checksummed btree leaf blocks and mounting it
//! back.

use tracing::info;

use crate::error::{corruption, AgError, Result};
use crate::index::block::{read_leaf_blocks, write_leaf_blocks};
use crate::index::{BlockEnv, CountingBlocks, CursorContext, IndexFlavor, OrderedIndex};
use crate::options::MountOptions;
use crate::refcount::RefcountBtree;
use crate::resv::AgSpace;
use crate::rmap::RtRmapBtree;
use crate::types::AgNumber;

use super::{ag_usable_blocks, rmap_flavor, AgState, Mount, RtState};

/// Leaf chain of one btree, with the height recorded in its root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeImage {
    /// Leaf blocks in sibling order.
    pub blocks: Vec<Vec<u8>>,
    /// Tree height.
    pub levels: u32,
}

/// On-disk state of one AG.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgImage {
    /// AG number.
    pub agno: AgNumber,
    /// Free blocks recorded in the AG header.
    pub free_blocks: u64,
    /// Reverse-map btree, when the feature is on.
    pub rmap: Option<TreeImage>,
    /// Refcount btree, when the feature is on.
    pub refcount: Option<TreeImage>,
}

/// On-disk state of a whole filesystem.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountImage {
    /// Options the filesystem was formatted with.
    pub options: MountOptions,
    /// Every AG in order.
    pub ags: Vec<AgImage>,
    /// Realtime reverse-map btree, when the feature is on.
    pub rt_rmap: Option<TreeImage>,
}

fn write_tree<F: IndexFlavor>(
    index: &OrderedIndex<F>,
    context: CursorContext,
    uuid: [u8; 16],
) -> Result<TreeImage> {
    let env = BlockEnv {
        context,
        block_size: index.block_size(),
        uuid,
        known_height: index.levels(),
    };
    Ok(TreeImage {
        blocks: write_leaf_blocks(index, &env)?,
        levels: index.levels(),
    })
}

fn read_tree<F: IndexFlavor>(
    flavor: F,
    image: &TreeImage,
    context: CursorContext,
    block_size: u32,
    uuid: [u8; 16],
) -> Result<OrderedIndex<F>> {
    let env = BlockEnv {
        context,
        block_size,
        uuid,
        known_height: image.levels,
    };
    let index = read_leaf_blocks(flavor, &env, &image.blocks)?;
    if index.levels() != image.levels {
        return Err(corruption(context, "tree height does not match its records"));
    }
    Ok(index)
}

/// Reads a tree that must be present exactly when `enabled`.
fn read_optional<F: IndexFlavor>(
    flavor: F,
    image: Option<&TreeImage>,
    enabled: bool,
    context: CursorContext,
    block_size: u32,
    uuid: [u8; 16],
) -> Result<OrderedIndex<F>> {
    match (image, enabled) {
        (Some(image), true) => read_tree(flavor, image, context, block_size, uuid),
        (None, false) => Ok(OrderedIndex::new(flavor, block_size)),
        _ => Err(corruption(context, "btree presence does not match the feature set")),
    }
}

impl Mount {
    /// Serializes every index and the AG free counts.
    pub fn snapshot_image(&self) -> Result<MountImage> {
        self.check_live()?;
        let features = self.features();
        let mut ags = Vec::with_capacity(self.ags.len());
        for ag in &self.ags {
            let ag = ag.lock();
            let ctx = CursorContext::Ag(ag.agno);
            ags.push(AgImage {
                agno: ag.agno,
                free_blocks: ag.space.free_blocks,
                rmap: features
                    .rmapbt
                    .then(|| write_tree(&ag.rmap, ctx, self.uuid))
                    .transpose()?,
                refcount: features
                    .reflink
                    .then(|| write_tree(&ag.refcount, ctx, self.uuid))
                    .transpose()?,
            });
        }
        let rt_rmap = match &self.rt {
            Some(rt) => {
                let rt = rt.lock();
                Some(write_tree(&rt.rmap, CursorContext::Inode(rt.ino), self.uuid)?)
            }
            None => None,
        };
        Ok(MountImage {
            options: self.options.clone(),
            ags,
            rt_rmap,
        })
    }

    /// Releases the reservation pools and writes the filesystem out.
    pub fn unmount(self) -> Result<MountImage> {
        self.check_live()?;
        self.refcount_reserve_pool_free()?;
        self.rmap_reserve_pool_free()?;
        let image = self.snapshot_image()?;
        info!(ags = image.ags.len(), "filesystem unmounted");
        Ok(image)
    }

    /// Verifies and loads an image, sets up the reservation pools and
    /// frees any CoW staging extents a previous session left behind.
    pub fn mount_image(image: MountImage) -> Result<Self> {
        let MountImage {
            options,
            ags: ag_images,
            rt_rmap,
        } = image;
        options.validate()?;
        let geometry = options.to_geometry()?;
        let uuid = options.uuid_bytes()?;
        let features = options.features.clone();
        if ag_images.len() != geometry.ag_count as usize {
            return Err(AgError::Invalid("image AG count does not match the geometry"));
        }
        let bs = geometry.block_size;
        let mut ags = Vec::with_capacity(ag_images.len());
        for (i, agi) in ag_images.iter().enumerate() {
            let agno = AgNumber(i as u32);
            let ctx = CursorContext::Ag(agno);
            if agi.agno != agno {
                return Err(corruption(ctx, "AG header carries the wrong AG number"));
            }
            if agi.free_blocks > ag_usable_blocks(&geometry, &features) {
                return Err(corruption(ctx, "AG free count exceeds the AG size"));
            }
            let rmap = read_optional(
                rmap_flavor(&features),
                agi.rmap.as_ref(),
                features.rmapbt,
                ctx,
                bs,
                uuid,
            )?;
            let refcount = read_optional(
                RefcountBtree,
                agi.refcount.as_ref(),
                features.reflink,
                ctx,
                bs,
                uuid,
            )?;
            ags.push(AgState {
                agno,
                space: AgSpace::new(agno, agi.free_blocks),
                rmap,
                refcount,
            });
        }
        let rt_ctx = CursorContext::Inode(options.rt_rmap_inode);
        let rt_index = read_optional(
            RtRmapBtree,
            rt_rmap.as_ref(),
            features.realtime_rmap,
            rt_ctx,
            bs,
            uuid,
        )?;
        let rt = features.realtime_rmap.then(|| RtState {
            ino: options.rt_rmap_inode,
            blocks: CountingBlocks {
                in_use: u64::from(rt_index.nblocks()),
            },
            rmap: rt_index,
        });
        let mount = Self::assemble(options, geometry, ags, rt)?;
        mount.init_reserve_pools()?;
        let recovered = mount.recover_cow()?;
        info!(
            ags = geometry.ag_count,
            free = mount.counters().free_blocks,
            recovered,
            "filesystem mounted"
        );
        Ok(mount)
    }
}
