//! On-disk btree block layout, leaf packing and the read/write verifiers.

use crate::error::{corruption, AgError, Result};
use crate::types::checksum::{stamp_block_crc, verify_block_crc};

use super::{CursorContext, IndexFlavor, OrderedIndex};

/// Header layout of a btree block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlockForm {
    /// AG-rooted btrees: 32-bit sibling pointers and owner.
    Short,
    /// Inode-rooted btrees: 64-bit sibling pointers and owner.
    Long,
}

impl BlockForm {
    /// Header size in bytes.
    pub const fn header_len(self) -> usize {
        match self {
            BlockForm::Short => 56,
            BlockForm::Long => 72,
        }
    }

    /// Offset of the CRC field.
    pub const fn crc_offset(self) -> usize {
        match self {
            BlockForm::Short => 52,
            BlockForm::Long => 64,
        }
    }

    /// Node pointer size.
    pub const fn ptr_len(self) -> usize {
        match self {
            BlockForm::Short => 4,
            BlockForm::Long => 8,
        }
    }

    /// Sibling value meaning "no sibling".
    pub const fn null_sibling(self) -> u64 {
        match self {
            BlockForm::Short => u32::MAX as u64,
            BlockForm::Long => u64::MAX,
        }
    }
}

/// Decoded btree block header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    /// Magic number identifying the index flavor.
    pub magic: u32,
    /// Height of this block above the leaves.
    pub level: u16,
    /// Records (or keys) stored in the block.
    pub numrecs: u16,
    /// Left sibling block.
    pub leftsib: u64,
    /// Right sibling block.
    pub rightsib: u64,
    /// Address of this block.
    pub blkno: u64,
    /// Last log sequence number written to the block.
    pub lsn: u64,
    /// Filesystem UUID.
    pub uuid: [u8; 16],
    /// AG number or inode number owning the tree.
    pub owner: u64,
}

fn be16(b: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([b[at], b[at + 1]])
}

fn be32(b: &[u8], at: usize) -> u32 {
    let mut a = [0u8; 4];
    a.copy_from_slice(&b[at..at + 4]);
    u32::from_be_bytes(a)
}

fn be64(b: &[u8], at: usize) -> u64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(&b[at..at + 8]);
    u64::from_be_bytes(a)
}

impl BlockHeader {
    /// Serializes the header (CRC left zero).
    pub fn encode(&self, form: BlockForm, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.magic.to_be_bytes());
        out[4..6].copy_from_slice(&self.level.to_be_bytes());
        out[6..8].copy_from_slice(&self.numrecs.to_be_bytes());
        match form {
            BlockForm::Short => {
                out[8..12].copy_from_slice(&(self.leftsib as u32).to_be_bytes());
                out[12..16].copy_from_slice(&(self.rightsib as u32).to_be_bytes());
                out[16..24].copy_from_slice(&self.blkno.to_be_bytes());
                out[24..32].copy_from_slice(&self.lsn.to_be_bytes());
                out[32..48].copy_from_slice(&self.uuid);
                out[48..52].copy_from_slice(&(self.owner as u32).to_be_bytes());
                out[52..56].fill(0);
            }
            BlockForm::Long => {
                out[8..16].copy_from_slice(&self.leftsib.to_be_bytes());
                out[16..24].copy_from_slice(&self.rightsib.to_be_bytes());
                out[24..32].copy_from_slice(&self.blkno.to_be_bytes());
                out[32..40].copy_from_slice(&self.lsn.to_be_bytes());
                out[40..56].copy_from_slice(&self.uuid);
                out[56..64].copy_from_slice(&self.owner.to_be_bytes());
                out[64..72].fill(0);
            }
        }
    }

    /// Parses a header.
    pub fn decode(form: BlockForm, b: &[u8]) -> Self {
        let mut uuid = [0u8; 16];
        match form {
            BlockForm::Short => {
                uuid.copy_from_slice(&b[32..48]);
                Self {
                    magic: be32(b, 0),
                    level: be16(b, 4),
                    numrecs: be16(b, 6),
                    leftsib: u64::from(be32(b, 8)),
                    rightsib: u64::from(be32(b, 12)),
                    blkno: be64(b, 16),
                    lsn: be64(b, 24),
                    uuid,
                    owner: u64::from(be32(b, 48)),
                }
            }
            BlockForm::Long => {
                uuid.copy_from_slice(&b[40..56]);
                Self {
                    magic: be32(b, 0),
                    level: be16(b, 4),
                    numrecs: be16(b, 6),
                    leftsib: be64(b, 8),
                    rightsib: be64(b, 16),
                    blkno: be64(b, 24),
                    lsn: be64(b, 32),
                    uuid,
                    owner: be64(b, 56),
                }
            }
        }
    }
}

/// What a block read from an image must agree with.
#[derive(Copy, Clone, Debug)]
pub struct BlockEnv {
    /// Root of the tree, for error reporting.
    pub context: CursorContext,
    /// Filesystem block size.
    pub block_size: u32,
    /// Filesystem UUID.
    pub uuid: [u8; 16],
    /// Height recorded for the tree in its root header.
    pub known_height: u32,
}

impl BlockEnv {
    fn owner(&self) -> u64 {
        match self.context {
            CursorContext::Ag(agno) => u64::from(agno.0),
            CursorContext::Inode(ino) => ino,
        }
    }
}

/// Structural checks shared by the read and write verifiers.
fn verify_structure<F: IndexFlavor>(
    flavor: &F,
    env: &BlockEnv,
    hdr: &BlockHeader,
    blkno: u64,
) -> Result<()> {
    let ctx = env.context;
    if hdr.magic != flavor.magic() {
        return Err(corruption(ctx, flavor.magic_mismatch(hdr.magic)));
    }
    if u32::from(hdr.level) >= env.known_height {
        return Err(corruption(ctx, "btree block level exceeds the tree height"));
    }
    if usize::from(hdr.numrecs) > flavor.maxrecs(env.block_size, hdr.level == 0) {
        return Err(corruption(ctx, "btree block holds more records than fit"));
    }
    if hdr.uuid != env.uuid {
        return Err(corruption(ctx, "btree block belongs to another filesystem"));
    }
    if hdr.owner != env.owner() {
        return Err(corruption(ctx, "btree block owner mismatch"));
    }
    if hdr.blkno != blkno {
        return Err(corruption(ctx, "btree block written at the wrong address"));
    }
    Ok(())
}

/// Read verifier: checksum first, then structure.
pub fn verify_block<F: IndexFlavor>(
    flavor: &F,
    env: &BlockEnv,
    buf: &[u8],
    blkno: u64,
) -> Result<BlockHeader> {
    let form = flavor.block_form();
    if buf.len() != env.block_size as usize {
        return Err(corruption(env.context, "btree block has the wrong size"));
    }
    if !verify_block_crc(buf, form.crc_offset()) {
        tracing::error!(context = %env.context, blkno, "btree block checksum mismatch");
        return Err(AgError::BadChecksum {
            context: env.context,
            blkno,
        });
    }
    let hdr = BlockHeader::decode(form, buf);
    verify_structure(flavor, env, &hdr, blkno)?;
    Ok(hdr)
}

/// Packs the leaf records of `index` into checksummed blocks, running the
/// write verifier on each.
pub fn write_leaf_blocks<F: IndexFlavor>(
    index: &OrderedIndex<F>,
    env: &BlockEnv,
) -> Result<Vec<Vec<u8>>> {
    let flavor = index.flavor();
    let form = flavor.block_form();
    let per_block = flavor.maxrecs(env.block_size, true);
    if per_block == 0 {
        return Err(AgError::Invalid("block size too small for a single record"));
    }
    let recs: Vec<F::Rec> = index.iter().copied().collect();
    let chunks: Vec<&[F::Rec]> = if recs.is_empty() {
        vec![recs.as_slice()]
    } else {
        recs.chunks(per_block).collect()
    };
    let nblocks = chunks.len() as u64;
    let mut out = Vec::with_capacity(chunks.len());
    for (i, chunk) in chunks.into_iter().enumerate() {
        let blkno = i as u64;
        let hdr = BlockHeader {
            magic: flavor.magic(),
            level: 0,
            numrecs: chunk.len() as u16,
            leftsib: if blkno == 0 { form.null_sibling() } else { blkno - 1 },
            rightsib: if blkno + 1 == nblocks {
                form.null_sibling()
            } else {
                blkno + 1
            },
            blkno,
            lsn: 0,
            uuid: env.uuid,
            owner: env.owner(),
        };
        verify_structure(flavor, env, &hdr, blkno)?;
        let mut buf = vec![0u8; env.block_size as usize];
        hdr.encode(form, &mut buf);
        let mut at = form.header_len();
        for rec in chunk {
            flavor.encode_rec(rec, &mut buf[at..at + flavor.rec_len()])?;
            at += flavor.rec_len();
        }
        stamp_block_crc(&mut buf, form.crc_offset());
        out.push(buf);
    }
    Ok(out)
}

/// Verifies a chain of leaf blocks and rebuilds the index from it.
pub fn read_leaf_blocks<F: IndexFlavor>(
    flavor: F,
    env: &BlockEnv,
    blocks: &[Vec<u8>],
) -> Result<OrderedIndex<F>> {
    let form = flavor.block_form();
    let ctx = env.context;
    if blocks.is_empty() {
        return Err(corruption(ctx, "btree has no root block"));
    }
    let nblocks = blocks.len() as u64;
    let mut recs: Vec<F::Rec> = Vec::new();
    for (i, buf) in blocks.iter().enumerate() {
        let blkno = i as u64;
        let hdr = verify_block(&flavor, env, buf, blkno)?;
        if hdr.level != 0 {
            return Err(corruption(ctx, "interior block in the leaf chain"));
        }
        let expect_left = if blkno == 0 { form.null_sibling() } else { blkno - 1 };
        let expect_right = if blkno + 1 == nblocks {
            form.null_sibling()
        } else {
            blkno + 1
        };
        if hdr.leftsib != expect_left || hdr.rightsib != expect_right {
            return Err(corruption(ctx, "broken leaf sibling chain"));
        }
        let mut at = form.header_len();
        for _ in 0..hdr.numrecs {
            let rec = flavor.decode_rec(&buf[at..at + flavor.rec_len()]);
            if let Some(prev) = recs.last() {
                if flavor.key_of(prev) >= flavor.key_of(&rec) {
                    return Err(corruption(ctx, "leaf records out of order"));
                }
            }
            recs.push(rec);
            at += flavor.rec_len();
        }
    }
    Ok(OrderedIndex::from_records(flavor, env.block_size, recs))
}
