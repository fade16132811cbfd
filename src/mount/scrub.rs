use tracing::{debug, warn};

use crate::error::Result;
use crate::refcount::{RefcountRecord, MAX_REFCOUNT};
use crate::resv::ResvClass;
use crate::rmap::{rmap_query_range, RmapRecord, RMAP_LEN_MAX};
use crate::types::{AgBlock, AgNumber, Owner, SpecialOwner};

use super::{AgState, Mount};

/// An inconsistency found by [`Mount::check_ag`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScrubProblem {
    /// Two adjacent refcount records with the same count.
    RefcountMergeable {
        /// Start of the second record.
        start: AgBlock,
    },
    /// Refcount records overlap.
    RefcountOverlap {
        /// Start of the later record.
        start: AgBlock,
    },
    /// A refcount record with a count of zero.
    RefcountZero {
        /// Start of the record.
        start: AgBlock,
    },
    /// Two adjacent reverse mappings that should have been one record.
    RmapUnmerged {
        /// Start of the second record.
        start: u64,
    },
    /// The same mapping is recorded twice over the same blocks.
    RmapOverlap {
        /// Start of the later record.
        start: u64,
    },
    /// A shared block whose count disagrees with its number of owners.
    SharedCountMismatch {
        /// Block checked.
        block: AgBlock,
        /// Count stored in the refcount index.
        refcount: u32,
        /// File mappings found in the reverse map.
        owners: u32,
    },
    /// A CoW staging extent without a matching CoW reverse mapping.
    CowWithoutRmap {
        /// Start of the staging extent.
        start: AgBlock,
    },
    /// The reverse map lacks the record covering the AG headers.
    MissingHeaderRecord,
    /// More blocks are reserved than the AG has free.
    ReservationOverdrawn {
        /// Blocks free in the AG.
        free: u64,
        /// Blocks held back.
        reserved: u64,
    },
}

/// Result of checking one AG.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScrubReport {
    /// AG checked.
    pub agno: AgNumber,
    /// Reverse-map records examined.
    pub rmap_records: usize,
    /// Refcount records examined.
    pub refcount_records: usize,
    /// Inconsistencies found.
    pub problems: Vec<ScrubProblem>,
}

impl ScrubReport {
    /// True when nothing was wrong.
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

fn check_refcounts(recs: &[RefcountRecord], problems: &mut Vec<ScrubProblem>) {
    for rec in recs {
        if rec.refcount == 0 {
            problems.push(ScrubProblem::RefcountZero { start: rec.start });
        }
    }
    for pair in recs.windows(2) {
        let (left, right) = (&pair[0], &pair[1]);
        if left.end() > u64::from(right.start) {
            problems.push(ScrubProblem::RefcountOverlap { start: right.start });
        } else if left.end() == u64::from(right.start) && left.refcount == right.refcount {
            problems.push(ScrubProblem::RefcountMergeable { start: right.start });
        }
    }
}

fn same_mapping(a: &RmapRecord, b: &RmapRecord) -> bool {
    a.owner == b.owner && a.flags == b.flags
}

/// Physical and logical positions advance together from `a` to `b`.
fn in_step(a: &RmapRecord, b: &RmapRecord) -> bool {
    !a.has_logical_offset() || b.offset.wrapping_sub(a.offset) == b.start.wrapping_sub(a.start)
}

fn check_rmaps(recs: &[RmapRecord], problems: &mut Vec<ScrubProblem>) {
    for (i, rec) in recs.iter().enumerate() {
        for later in &recs[i + 1..] {
            if later.start >= rec.end() {
                break;
            }
            if same_mapping(rec, later) && in_step(rec, later) {
                problems.push(ScrubProblem::RmapOverlap { start: later.start });
            }
        }
        if let Some(next) = recs[i + 1..]
            .iter()
            .take_while(|next| next.start <= rec.end())
            .find(|next| next.start == rec.end() && same_mapping(rec, next))
            .filter(|_| !rec.flags.unwritten)
        {
            let offsets_meet =
                !rec.has_logical_offset() || rec.offset + u64::from(rec.len) == next.offset;
            let fits = u64::from(rec.len) + u64::from(next.len) <= u64::from(RMAP_LEN_MAX);
            if offsets_meet && fits {
                problems.push(ScrubProblem::RmapUnmerged { start: next.start });
            }
        }
    }
}

fn file_owners_at(ag: &AgState, block: AgBlock) -> u32 {
    let block = u64::from(block);
    rmap_query_range(&ag.rmap, block, block + 1)
        .filter(|rec| rec.has_logical_offset())
        .count() as u32
}

fn check_cross_references(ag: &AgState, header: u32, problems: &mut Vec<ScrubProblem>) {
    let has_header = ag.rmap.iter().next().is_some_and(|rec| {
        rec.start == 0 && rec.owner == Owner::Special(SpecialOwner::Fs) && rec.len >= header
    });
    if !has_header {
        problems.push(ScrubProblem::MissingHeaderRecord);
    }
    for rec in ag.refcount.iter() {
        if rec.is_cow_staging() {
            let covered = rmap_query_range(&ag.rmap, u64::from(rec.start), rec.end()).any(|r| {
                r.owner == Owner::Special(SpecialOwner::Cow)
                    && r.start <= u64::from(rec.start)
                    && r.end() >= rec.end()
            });
            if !covered {
                problems.push(ScrubProblem::CowWithoutRmap { start: rec.start });
            }
            continue;
        }
        if rec.refcount < 2 || rec.refcount == MAX_REFCOUNT {
            continue;
        }
        let last = rec.start + (rec.len - 1);
        for block in [rec.start, last] {
            let owners = file_owners_at(ag, block);
            if owners != rec.refcount {
                problems.push(ScrubProblem::SharedCountMismatch {
                    block,
                    refcount: rec.refcount,
                    owners,
                });
            }
            if last == rec.start {
                break;
            }
        }
    }
}

impl Mount {
    /// Checks one AG's indexes against each other and against the space
    /// accounting.
    pub fn check_ag(&self, agno: AgNumber) -> Result<ScrubReport> {
        let ag = self.lock_ag(agno)?;
        let mut problems = Vec::new();
        let refcounts: Vec<RefcountRecord> = ag.refcount.iter().copied().collect();
        check_refcounts(&refcounts, &mut problems);
        if self.features().rmapbt {
            let rmaps: Vec<RmapRecord> = ag.rmap.iter().copied().collect();
            check_rmaps(&rmaps, &mut problems);
            check_cross_references(&ag, self.geometry().ag_header_blocks, &mut problems);
        }
        if ag.space.reserved_blocks > ag.space.free_blocks {
            problems.push(ScrubProblem::ReservationOverdrawn {
                free: ag.space.free_blocks,
                reserved: ag.space.reserved_blocks,
            });
        }
        for class in ResvClass::ALL {
            if let Some(resv) = ag.space.resv(class) {
                debug!(%agno, ?class, asked = resv.asked, used = resv.used, "reservation state");
            }
        }
        let report = ScrubReport {
            agno,
            rmap_records: ag.rmap.len(),
            refcount_records: ag.refcount.len(),
            problems,
        };
        if !report.is_clean() {
            warn!(%agno, problems = report.problems.len(), "AG check found problems");
        }
        Ok(report)
    }
}
