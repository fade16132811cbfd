//! The filesystem session: per-AG indexes and space accounting, the
//! optional realtime reverse map, the global counters, and the
//! transactions every mutation runs in.
//!
//! Each AG sits behind its own lock (the AG header buffer). Operations that
//! touch several AGs take those locks one at a time in ascending AG order;
//! the global counters are locked last.

mod image;
mod refcount_ops;
mod rmap_ops;
mod scrub;
mod transaction;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::error::{AgError, Result};
use crate::index::{btree_calc_size, btree_compute_maxlevels, CountingBlocks, IndexFlavor, OrderedIndex};
use crate::metrics::{default_metrics, AgMetrics};
use crate::options::{Features, MountOptions};
use crate::refcount::RefcountBtree;
use crate::resv::{self, AgResv, AgSpace, FsCounters, ResvClass, ResvKind};
use crate::rmap::{RmapBtree, RmapRecord, RtRmapBtree};
use crate::types::{AgNumber, Geometry, OwnerInfo, SpecialOwner};

pub use image::{AgImage, MountImage, TreeImage};
pub use refcount_ops::CowDisposition;
pub use rmap_ops::FsMapping;
pub use scrub::{ScrubProblem, ScrubReport};
pub use transaction::{DeferredFree, Transaction, TxState};

/// Everything stored for one allocation group.
#[derive(Debug)]
pub struct AgState {
    agno: AgNumber,
    space: AgSpace,
    rmap: OrderedIndex<RmapBtree>,
    refcount: OrderedIndex<RefcountBtree>,
}

impl AgState {
    /// AG number.
    pub fn agno(&self) -> AgNumber {
        self.agno
    }

    /// Free-space and reservation accounting.
    pub fn space(&self) -> &AgSpace {
        &self.space
    }

    /// Reverse-map index.
    pub fn rmap(&self) -> &OrderedIndex<RmapBtree> {
        &self.rmap
    }

    /// Reference-count index.
    pub fn refcount(&self) -> &OrderedIndex<RefcountBtree> {
        &self.refcount
    }
}

/// Realtime reverse map, rooted in an inode.
#[derive(Debug)]
struct RtState {
    ino: u64,
    rmap: OrderedIndex<RtRmapBtree>,
    blocks: CountingBlocks,
}

/// A mounted filesystem.
pub struct Mount {
    geometry: Geometry,
    options: MountOptions,
    uuid: [u8; 16],
    ags: Vec<Mutex<AgState>>,
    rt: Option<Mutex<RtState>>,
    counters: Mutex<FsCounters>,
    pools: Mutex<[u64; 2]>,
    shutdown: AtomicBool,
    next_tx: AtomicU64,
    metrics: Arc<dyn AgMetrics>,
}

fn rmap_flavor(features: &Features) -> RmapBtree {
    if features.rmap_owner_keys {
        RmapBtree::with_owner_keys()
    } else {
        RmapBtree::plain()
    }
}

/// Blocks of an empty AG taken by btree roots.
fn root_blocks(features: &Features) -> u32 {
    u32::from(features.rmapbt) + u32::from(features.reflink)
}

fn ag_usable_blocks(geometry: &Geometry, features: &Features) -> u64 {
    u64::from(geometry.ag_blocks - geometry.ag_header_blocks - root_blocks(features))
}

fn pool_slot(class: ResvClass) -> usize {
    match class {
        ResvClass::Metadata => 0,
        ResvClass::Rmapbt => 1,
    }
}

impl Mount {
    /// Creates a freshly formatted filesystem and mounts it: every AG holds
    /// only its header sentinel, and the reservation pools are set up.
    pub fn new(options: MountOptions) -> Result<Self> {
        options.validate()?;
        let geometry = options.to_geometry()?;
        let ags = (0..geometry.ag_count)
            .map(|agno| fresh_ag(&geometry, &options.features, AgNumber(agno)))
            .collect();
        let rt = options.features.realtime_rmap.then(|| {
            let rmap = OrderedIndex::new(RtRmapBtree, geometry.block_size);
            RtState {
                ino: options.rt_rmap_inode,
                blocks: CountingBlocks {
                    in_use: u64::from(rmap.nblocks()),
                },
                rmap,
            }
        });
        let mount = Self::assemble(options, geometry, ags, rt)?;
        mount.init_reserve_pools()?;
        info!(
            ags = geometry.ag_count,
            ag_blocks = geometry.ag_blocks,
            free = mount.counters().free_blocks,
            "filesystem created"
        );
        Ok(mount)
    }

    fn assemble(
        options: MountOptions,
        geometry: Geometry,
        ags: Vec<AgState>,
        rt: Option<RtState>,
    ) -> Result<Self> {
        let uuid = options.uuid_bytes()?;
        let counters = FsCounters {
            free_blocks: ags.iter().map(|ag| ag.space.free_blocks).sum(),
            ag_max_usable: ag_usable_blocks(&geometry, &options.features),
        };
        Ok(Self {
            geometry,
            options,
            uuid,
            ags: ags.into_iter().map(Mutex::new).collect(),
            rt: rt.map(Mutex::new),
            counters: Mutex::new(counters),
            pools: Mutex::new([0; 2]),
            shutdown: AtomicBool::new(false),
            next_tx: AtomicU64::new(1),
            metrics: default_metrics(),
        })
    }

    /// Replaces the metrics sink.
    pub fn with_metrics(mut self, metrics: Arc<dyn AgMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Filesystem layout.
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Options the filesystem was mounted with.
    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    /// Enabled features.
    pub fn features(&self) -> &Features {
        &self.options.features
    }

    /// Filesystem UUID.
    pub fn uuid(&self) -> [u8; 16] {
        self.uuid
    }

    /// Blocks of one AG outside its headers and btree roots.
    pub fn ag_usable_blocks(&self) -> u64 {
        ag_usable_blocks(&self.geometry, self.features())
    }

    /// Snapshot of the global counters.
    pub fn counters(&self) -> FsCounters {
        self.counters.lock().clone()
    }

    /// True once an unrecoverable failure has shut the filesystem down.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Runs `f` on one AG while holding its lock.
    pub fn with_ag<R>(&self, agno: AgNumber, f: impl FnOnce(&AgState) -> R) -> Result<R> {
        let ag = self.lock_ag(agno)?;
        Ok(f(&ag))
    }

    /// Records of the realtime reverse map, if the filesystem has one.
    pub fn rt_rmap_records(&self) -> Result<Option<Vec<RmapRecord>>> {
        self.check_live()?;
        Ok(self
            .rt
            .as_ref()
            .map(|rt| rt.lock().rmap.iter().copied().collect()))
    }

    /// Starts a transaction.
    pub fn begin(&self) -> Result<Transaction<'_>> {
        self.check_live()?;
        let id = self.next_tx.fetch_add(1, Ordering::Relaxed);
        Ok(Transaction::new(self, id))
    }

    pub(crate) fn check_live(&self) -> Result<()> {
        if self.is_shutdown() {
            return Err(AgError::Shutdown);
        }
        Ok(())
    }

    pub(crate) fn shut_down(&self, reason: &'static str) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            error!(reason, "filesystem shut down");
        }
    }

    pub(crate) fn lock_ag(&self, agno: AgNumber) -> Result<MutexGuard<'_, AgState>> {
        self.check_live()?;
        self.ags
            .get(agno.0 as usize)
            .map(|ag| ag.lock())
            .ok_or(AgError::Invalid("no such allocation group"))
    }

    fn tree_blocks(ag: &AgState, class: ResvClass) -> u64 {
        match class {
            ResvClass::Metadata => u64::from(ag.refcount.nblocks()),
            ResvClass::Rmapbt => u64::from(ag.rmap.nblocks()),
        }
    }

    fn class_limits(&self, class: ResvClass) -> [usize; 2] {
        let bs = self.geometry.block_size;
        match class {
            ResvClass::Metadata => RefcountBtree.limits(bs),
            ResvClass::Rmapbt => rmap_flavor(self.features()).limits(bs),
        }
    }

    /// Blocks a class's pool asks for in every AG.
    pub fn pool_size(&self, class: ResvClass) -> u64 {
        let ag_blocks = u64::from(self.geometry.ag_blocks);
        let tree = btree_calc_size(self.class_limits(class), ag_blocks);
        match class {
            ResvClass::Metadata => tree,
            ResvClass::Rmapbt => tree.max(ag_blocks / 100),
        }
    }

    fn class_enabled(&self, class: ResvClass) -> bool {
        match class {
            ResvClass::Metadata => self.features().reflink,
            ResvClass::Rmapbt => self.features().rmapbt,
        }
    }

    fn init_reserve_pools(&self) -> Result<()> {
        self.refcount_reserve_pool_init()?;
        self.rmap_reserve_pool_init()
    }

    /// Creates the refcount btree reservation in every AG.
    pub fn refcount_reserve_pool_init(&self) -> Result<()> {
        self.reserve_pool_init(ResvClass::Metadata)
    }

    /// Drops the refcount btree reservation from every AG.
    pub fn refcount_reserve_pool_free(&self) -> Result<()> {
        self.reserve_pool_free(ResvClass::Metadata)
    }

    /// Creates the rmap btree reservation in every AG.
    pub fn rmap_reserve_pool_init(&self) -> Result<()> {
        self.reserve_pool_init(ResvClass::Rmapbt)
    }

    /// Drops the rmap btree reservation from every AG.
    pub fn rmap_reserve_pool_free(&self) -> Result<()> {
        self.reserve_pool_free(ResvClass::Rmapbt)
    }

    /// Every AG is attempted; the first failure is returned.
    fn reserve_pool_init(&self, class: ResvClass) -> Result<()> {
        self.check_live()?;
        if !self.class_enabled(class) {
            return Ok(());
        }
        let pool = self.pool_size(class);
        let mut pools = self.pools.lock();
        if pools[pool_slot(class)] == 0 {
            resv::SpaceCounters::mod_max_usable(&mut *self.counters.lock(), -(pool as i64));
            pools[pool_slot(class)] = pool;
        }
        let mut first_err = None;
        for ag in &self.ags {
            let mut ag = ag.lock();
            if ag.space.resv(class).is_some() {
                continue;
            }
            let used = Self::tree_blocks(&ag, class);
            let mut counters = self.counters.lock();
            if let Err(err) = resv::init(&mut ag.space, &mut counters, class, pool, used) {
                warn!(agno = %ag.agno, ?class, pool, used, %err, "cannot reserve btree blocks");
                first_err.get_or_insert(err);
            }
        }
        debug!(?class, pool, "reservation pool initialized");
        first_err.map_or(Ok(()), Err)
    }

    fn reserve_pool_free(&self, class: ResvClass) -> Result<()> {
        self.check_live()?;
        let mut pools = self.pools.lock();
        let mut first_err = None;
        for ag in &self.ags {
            let mut ag = ag.lock();
            let mut counters = self.counters.lock();
            if let Err(err) = resv::free(&mut ag.space, &mut counters, class) {
                first_err.get_or_insert(err);
            }
        }
        let pool = std::mem::take(&mut pools[pool_slot(class)]);
        resv::SpaceCounters::mod_max_usable(&mut *self.counters.lock(), pool as i64);
        debug!(?class, pool, "reservation pool freed");
        first_err.map_or(Ok(()), Err)
    }

    /// Creates a reservation of `asked` blocks for `class` in one AG, of
    /// which `used` are already occupied.
    pub fn ag_resv_init(&self, agno: AgNumber, class: ResvClass, asked: u64, used: u64) -> Result<()> {
        let mut ag = self.lock_ag(agno)?;
        let mut counters = self.counters.lock();
        resv::init(&mut ag.space, &mut counters, class, asked, used)
    }

    /// Drops `class`'s reservation in one AG.
    pub fn ag_resv_free(&self, agno: AgNumber, class: ResvClass) -> Result<Option<AgResv>> {
        let mut ag = self.lock_ag(agno)?;
        let mut counters = self.counters.lock();
        resv::free(&mut ag.space, &mut counters, class)
    }

    /// Whether `class` is running out of space in one AG.
    pub fn ag_resv_critical(&self, agno: AgNumber, class: ResvClass) -> Result<bool> {
        let floor = match self.options.critical_floor {
            Some(floor) => u64::from(floor),
            None => u64::from(btree_compute_maxlevels(
                self.class_limits(class),
                u64::from(self.geometry.ag_blocks),
            )),
        };
        let ag = self.lock_ag(agno)?;
        let critical = resv::critical(&ag.space, class, floor);
        if critical {
            debug!(
                %agno,
                ?class,
                free = ag.space.free_blocks,
                reserved = ag.space.reserved_blocks,
                "reservation is critical"
            );
        }
        Ok(critical)
    }

    /// Blocks that must stay free in one AG for an allocation of `kind`.
    pub fn ag_resv_needed(&self, agno: AgNumber, kind: ResvKind) -> Result<u64> {
        let ag = self.lock_ag(agno)?;
        Ok(resv::needed(&ag.space, kind))
    }
}

fn fresh_ag(geometry: &Geometry, features: &Features, agno: AgNumber) -> AgState {
    let flavor = rmap_flavor(features);
    let rmap = if features.rmapbt {
        let header = RmapRecord::from_owner(
            0,
            geometry.ag_header_blocks,
            &OwnerInfo::special(SpecialOwner::Fs),
        );
        OrderedIndex::from_records(flavor, geometry.block_size, vec![header])
    } else {
        OrderedIndex::new(flavor, geometry.block_size)
    };
    AgState {
        agno,
        space: AgSpace::new(agno, ag_usable_blocks(geometry, features)),
        rmap,
        refcount: OrderedIndex::new(RefcountBtree, geometry.block_size),
    }
}
