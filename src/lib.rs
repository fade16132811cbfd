//! Extent bookkeeping for an allocation-group filesystem: the reverse map
//! (who owns each block), reference counts for shared and copy-on-write
//! extents, and the per-AG block reservations that keep those indexes able
//! to grow.
//!
//! A [`Mount`] owns every allocation group and hands out [`Transaction`]s;
//! all index mutations run inside one.

#![warn(missing_docs)]

pub mod error;
pub mod index;
pub mod logging;
pub mod metrics;
pub mod mount;
pub mod options;
pub mod refcount;
pub mod resv;
pub mod rmap;
pub mod types;

pub use error::{AgError, Result};
pub use metrics::{AgMetrics, CounterMetrics, NoopMetrics};
pub use mount::{
    AgImage, CowDisposition, FsMapping, Mount, MountImage, ScrubProblem, ScrubReport, Transaction,
    TreeImage, TxState,
};
pub use options::MountOptions;
pub use resv::{ResvClass, ResvKind};
pub use rmap::intent::{BmapExtent, IntentQueue};
pub use types::{AgExtent, AgNumber, Fork, FsBlock, Geometry, Owner, OwnerInfo, SpecialOwner};
