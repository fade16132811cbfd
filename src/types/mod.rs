//! Block addressing, geometry and ownership types shared by every index.

pub mod checksum;

use std::fmt;

use crate::error::{AgError, Result};

/// Allocation group number.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AgNumber(pub u32);

impl fmt::Display for AgNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Filesystem-wide block number: AG number in the high bits, AG block below.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FsBlock(pub u64);

impl fmt::Display for FsBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Block number relative to the start of an allocation group.
pub type AgBlock = u32;
/// Extent length in blocks.
pub type ExtLen = u32;

/// A run of blocks inside one allocation group.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AgExtent {
    /// First block of the run.
    pub start: AgBlock,
    /// Number of blocks.
    pub len: ExtLen,
}

impl AgExtent {
    /// One past the last block.
    pub fn end(&self) -> u64 {
        u64::from(self.start) + u64::from(self.len)
    }
}

/// Static layout of the filesystem.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Geometry {
    /// Filesystem block size in bytes.
    pub block_size: u32,
    /// Blocks per allocation group.
    pub ag_blocks: u32,
    /// Number of allocation groups.
    pub ag_count: u32,
    /// Bits of a filesystem block number used for the AG block.
    pub ag_blklog: u8,
    /// Blocks occupied by the AG headers at the start of each AG.
    pub ag_header_blocks: u32,
    /// Size of the realtime device in blocks.
    pub rt_blocks: u64,
}

impl Geometry {
    /// Builds and validates a geometry.
    pub fn new(block_size: u32, ag_blocks: u32, ag_count: u32) -> Result<Self> {
        if !block_size.is_power_of_two() || !(512..=65536).contains(&block_size) {
            return Err(AgError::Invalid("block size must be a power of two in 512..=65536"));
        }
        if ag_blocks < 64 {
            return Err(AgError::Invalid("allocation groups need at least 64 blocks"));
        }
        if ag_count == 0 {
            return Err(AgError::Invalid("at least one allocation group is required"));
        }
        let ag_blklog = (32 - (ag_blocks - 1).leading_zeros()) as u8;
        Ok(Self {
            block_size,
            ag_blocks,
            ag_count,
            ag_blklog,
            ag_header_blocks: 4,
            rt_blocks: 0,
        })
    }

    /// Sets the length of the AG header region.
    pub fn with_header_blocks(mut self, blocks: u32) -> Result<Self> {
        if blocks == 0 || blocks >= self.ag_blocks / 2 {
            return Err(AgError::Invalid("AG header must be non-empty and below half the AG"));
        }
        self.ag_header_blocks = blocks;
        Ok(self)
    }

    /// Sets the realtime device size.
    pub fn with_rt_blocks(mut self, blocks: u64) -> Self {
        self.rt_blocks = blocks;
        self
    }

    /// Combines an AG number and AG block into a filesystem block.
    pub fn agb_to_fsb(&self, agno: AgNumber, agbno: AgBlock) -> FsBlock {
        FsBlock((u64::from(agno.0) << self.ag_blklog) | u64::from(agbno))
    }

    /// AG number part of a filesystem block.
    pub fn fsb_to_agno(&self, fsbno: FsBlock) -> AgNumber {
        AgNumber((fsbno.0 >> self.ag_blklog) as u32)
    }

    /// AG block part of a filesystem block.
    pub fn fsb_to_agbno(&self, fsbno: FsBlock) -> AgBlock {
        (fsbno.0 & ((1u64 << self.ag_blklog) - 1)) as AgBlock
    }

    /// Splits a filesystem extent into AG coordinates, rejecting extents
    /// that leave their AG.
    pub fn verify_fsb_extent(&self, fsbno: FsBlock, len: ExtLen) -> Result<(AgNumber, AgBlock)> {
        let agno = self.fsb_to_agno(fsbno);
        let agbno = self.fsb_to_agbno(fsbno);
        if agno.0 >= self.ag_count {
            return Err(AgError::Invalid("block lies beyond the last allocation group"));
        }
        self.verify_ag_extent(agbno, len)?;
        Ok((agno, agbno))
    }

    /// Rejects empty extents and extents that run past the end of an AG.
    pub fn verify_ag_extent(&self, agbno: AgBlock, len: ExtLen) -> Result<()> {
        if len == 0 {
            return Err(AgError::Invalid("extent length must be non-zero"));
        }
        if u64::from(agbno) + u64::from(len) > u64::from(self.ag_blocks) {
            return Err(AgError::Invalid("extent runs past the end of the allocation group"));
        }
        Ok(())
    }

    /// Total data blocks.
    pub fn data_blocks(&self) -> u64 {
        u64::from(self.ag_blocks) * u64::from(self.ag_count)
    }
}

/// Well-known owners of blocks that do not belong to a file.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SpecialOwner {
    /// No owner; free space.
    Null,
    /// Owner not known (log recovery).
    Unknown,
    /// Static filesystem metadata such as the AG headers.
    Fs,
    /// Journal.
    Log,
    /// Per-AG metadata (free-space and reverse-map btrees, AGFL).
    Ag,
    /// Inode btrees.
    Inobt,
    /// Inode chunks.
    Inodes,
    /// Reference-count btree.
    Refc,
    /// Copy-on-write staging extents.
    Cow,
}

const SPECIAL_OWNERS: [SpecialOwner; 9] = [
    SpecialOwner::Null,
    SpecialOwner::Unknown,
    SpecialOwner::Fs,
    SpecialOwner::Log,
    SpecialOwner::Ag,
    SpecialOwner::Inobt,
    SpecialOwner::Inodes,
    SpecialOwner::Refc,
    SpecialOwner::Cow,
];

impl SpecialOwner {
    /// On-disk owner value (small negative numbers).
    pub const fn raw(self) -> u64 {
        let neg: i64 = match self {
            SpecialOwner::Null => -1,
            SpecialOwner::Unknown => -2,
            SpecialOwner::Fs => -3,
            SpecialOwner::Log => -4,
            SpecialOwner::Ag => -5,
            SpecialOwner::Inobt => -6,
            SpecialOwner::Inodes => -7,
            SpecialOwner::Refc => -8,
            SpecialOwner::Cow => -9,
        };
        neg as u64
    }

    /// Name shown by mapping reports.
    pub const fn label(self) -> &'static str {
        match self {
            SpecialOwner::Null => "free space",
            SpecialOwner::Unknown => "unknown",
            SpecialOwner::Fs => "static fs metadata",
            SpecialOwner::Log => "journalling log",
            SpecialOwner::Ag => "per-AG metadata",
            SpecialOwner::Inobt => "inode btree",
            SpecialOwner::Inodes => "inodes",
            SpecialOwner::Refc => "refcount btree",
            SpecialOwner::Cow => "cow reservation",
        }
    }
}

/// Owner of an extent: a file or a special metadata owner.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Owner {
    /// Regular file, identified by inode number.
    Inode(u64),
    /// Metadata sentinel.
    Special(SpecialOwner),
}

impl Owner {
    /// On-disk owner value.
    pub fn raw(self) -> u64 {
        match self {
            Owner::Inode(ino) => ino,
            Owner::Special(s) => s.raw(),
        }
    }

    /// Decodes an on-disk owner value.
    pub fn from_raw(raw: u64) -> Self {
        SPECIAL_OWNERS
            .iter()
            .copied()
            .find(|s| s.raw() == raw)
            .map(Owner::Special)
            .unwrap_or(Owner::Inode(raw))
    }

    /// True for file owners.
    pub fn is_inode(self) -> bool {
        matches!(self, Owner::Inode(_))
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Inode(ino) => write!(f, "inode {ino}"),
            Owner::Special(s) => f.write_str(s.label()),
        }
    }
}

/// Which fork of a file an extent maps.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Fork {
    /// File data.
    #[default]
    Data,
    /// Extended attributes.
    Attr,
}

/// Owner description passed with every reverse-map mutation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OwnerInfo {
    /// Who owns the blocks.
    pub owner: Owner,
    /// Logical offset within the fork; zero for metadata owners.
    pub offset: u64,
    /// Fork the blocks are mapped into.
    pub fork: Fork,
    /// Blocks hold the file's own block-map btree.
    pub bmbt: bool,
}

impl OwnerInfo {
    /// Blocks owned by a metadata structure.
    pub fn special(owner: SpecialOwner) -> Self {
        Self {
            owner: Owner::Special(owner),
            offset: 0,
            fork: Fork::Data,
            bmbt: false,
        }
    }

    /// Blocks mapped at `offset` of an inode's fork.
    pub fn file(ino: u64, fork: Fork, offset: u64) -> Self {
        Self {
            owner: Owner::Inode(ino),
            offset,
            fork,
            bmbt: false,
        }
    }

    /// Block-map btree blocks of an inode's fork.
    pub fn bmbt(ino: u64, fork: Fork) -> Self {
        Self {
            owner: Owner::Inode(ino),
            offset: 0,
            fork,
            bmbt: true,
        }
    }

    /// True when the logical offset is meaningful.
    pub fn has_logical_offset(&self) -> bool {
        self.owner.is_inode() && !self.bmbt
    }
}
