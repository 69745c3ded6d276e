//! On-disk superblock (§4.8, §6 disk image format).
//!
//! Block 0 is an unused boot block; block 1 is the superblock; `mkfs` (out
//! of scope for this kernel) lays out everything after it according to
//! the fields read here.

use crate::config::{BSIZE, FS_MAGIC};
use crate::sync::GlobalState;

pub const SUPERBLOCK_BLOCKNO: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Superblock {
    pub magic: u32,
    pub size: u32,
    pub nblocks: u32,
    pub ninodes: u32,
    pub inodestart: u32,
    pub bmapstart: u32,
}

impl Superblock {
    fn decode(bytes: &[u8; BSIZE]) -> Self {
        let word = |i: usize| u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
        let sb = Self {
            magic: word(0),
            size: word(1),
            nblocks: word(2),
            ninodes: word(3),
            inodestart: word(4),
            bmapstart: word(5),
        };
        if sb.magic != FS_MAGIC {
            crate::kpanic!("superblock: bad magic 0x{:x}", sb.magic);
        }
        sb
    }

    fn encode(&self, bytes: &mut [u8; BSIZE]) {
        bytes[0..4].copy_from_slice(&self.magic.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.size.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.nblocks.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.ninodes.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.inodestart.to_le_bytes());
        bytes[20..24].copy_from_slice(&self.bmapstart.to_le_bytes());
    }
}

static SUPERBLOCK: GlobalState<Superblock> = GlobalState::new();

/// Read the superblock off disk via the block cache. Must run once, after
/// [`super::blockcache::init`] and before any other file-system call.
pub fn init(dev: u32) {
    let handle = super::blockcache::read(dev, SUPERBLOCK_BLOCKNO);
    let sb = super::blockcache::with_data(handle, Superblock::decode);
    super::blockcache::release(handle);
    log::info!(
        "superblock: {} blocks, {} inodes, inodestart={}, bmapstart={}",
        sb.size, sb.ninodes, sb.inodestart, sb.bmapstart
    );
    if SUPERBLOCK.init(sb).is_err() {
        crate::kpanic!("superblock::init called twice");
    }
}

pub fn get() -> Superblock {
    SUPERBLOCK
        .with(|sb| *sb)
        .unwrap_or_else(|| crate::kpanic!("superblock used before init"))
}

#[cfg(test)]
pub fn format_mock_disk(dev: u32) -> Superblock {
    use crate::config::{BPB, IPB, NINODES};

    let inode_blocks = (NINODES as usize).div_ceil(IPB) as u32;
    let inodestart = SUPERBLOCK_BLOCKNO + 1;
    let provisional_data_start = inodestart + inode_blocks;
    let fs_size = crate::config::FS_SIZE;
    let bitmap_blocks = (fs_size as usize).div_ceil(BPB) as u32;
    let bmapstart = provisional_data_start;
    let nblocks = fs_size - bmapstart - bitmap_blocks;

    let sb = Superblock {
        magic: FS_MAGIC,
        size: fs_size,
        nblocks,
        ninodes: NINODES,
        inodestart,
        bmapstart,
    };

    let mut buf = [0u8; BSIZE];
    sb.encode(&mut buf);
    super::blockdev::write_block(SUPERBLOCK_BLOCKNO, &buf);

    let zero = [0u8; BSIZE];
    for b in inodestart..fs_size {
        super::blockdev::write_block(b, &zero);
    }

    // Stand in for the host-side `mkfs` tool (out of scope, §1): mark
    // every block before the data region (boot, superblock, inode
    // blocks, and the bitmap blocks themselves) allocated, so
    // `bitmap::alloc_block` only ever hands out genuine data blocks.
    let mut bit = 0u32;
    while bit < bmapstart + bitmap_blocks {
        let bitmap_block = bmapstart + bit / BPB as u32;
        let mut data = [0u8; BSIZE];
        super::blockdev::read_block(bitmap_block, &mut data);
        let end = (bmapstart + bitmap_blocks).min(bit + BPB as u32);
        for b in bit..end {
            let bi = b % BPB as u32;
            data[(bi / 8) as usize] |= 1 << (bi % 8);
        }
        super::blockdev::write_block(bitmap_block, &data);
        bit += BPB as u32;
    }

    // Format inode 1 as the root directory so `dir::root_dir`/`namei`
    // have something to find. Written as raw bytes in the on-disk
    // inode's layout (type, reserved link slot, size, block addresses)
    // rather than through `inode::ialloc`, since the in-memory inode
    // table isn't initialised yet at this point in the boot sequence.
    use crate::config::{DINODE_SIZE, ROOTINO};
    let root_block = inodestart + ROOTINO / IPB as u32;
    let root_offset = (ROOTINO as usize % IPB) * DINODE_SIZE;
    let mut dinode = [0u8; BSIZE];
    super::blockdev::read_block(root_block, &mut dinode);
    dinode[root_offset..root_offset + 2].copy_from_slice(&2u16.to_le_bytes()); // InodeType::Directory
    super::blockdev::write_block(root_block, &dinode);

    sb
}
