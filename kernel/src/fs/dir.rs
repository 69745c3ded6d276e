//! Flat directory entries and path lookup (§4.8).
//!
//! A directory is just a file whose contents are a sequence of fixed-size
//! `DirEntry` records; `inum == 0` marks a free slot. No "." or ".."
//! shortcuts are special-cased here beyond being ordinary entries a
//! directory's creator writes into it.

use crate::config::{DIRENT_SIZE, DIRSIZ};
use crate::error::{KernelError, KernelResult};

use super::inode::{self, InodeHandle, InodeType};

#[derive(Debug, Clone, Copy)]
struct DirEntry {
    inum: u16,
    name: [u8; DIRSIZ],
}

impl DirEntry {
    fn decode(bytes: &[u8]) -> Self {
        let inum = u16::from_le_bytes(bytes[0..2].try_into().unwrap());
        let mut name = [0u8; DIRSIZ];
        name.copy_from_slice(&bytes[2..2 + DIRSIZ]);
        Self { inum, name }
    }

    fn encode(&self, bytes: &mut [u8]) {
        bytes[0..2].copy_from_slice(&self.inum.to_le_bytes());
        bytes[2..2 + DIRSIZ].copy_from_slice(&self.name);
    }

    fn name_str(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(DIRSIZ);
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }
}

fn encode_name(name: &str) -> [u8; DIRSIZ] {
    let mut buf = [0u8; DIRSIZ];
    let bytes = name.as_bytes();
    let len = bytes.len().min(DIRSIZ);
    buf[..len].copy_from_slice(&bytes[..len]);
    buf
}

/// Scan a directory inode's contents for `name`. Returns the matching
/// entry's inode handle and its byte offset within the directory file
/// (the latter lets [`dirlink`] overwrite a freed slot in place).
pub fn dirlookup(dir: InodeHandle, name: &str) -> Option<(InodeHandle, u32)> {
    if inode::itype(dir) != InodeType::Directory {
        crate::kpanic!("dirlookup: inode {} is not a directory", inode::inum(dir));
    }
    let size = inode::isize(dir);
    let mut offset = 0u32;
    let mut raw = [0u8; DIRENT_SIZE];
    while offset < size {
        let n = inode::readi(dir, &mut raw, offset, DIRENT_SIZE as u32).unwrap_or(0);
        if n as usize != DIRENT_SIZE {
            break;
        }
        let entry = DirEntry::decode(&raw);
        if entry.inum != 0 && entry.name_str() == name {
            return Some((inode::iget(crate::config::ROOTDEV, entry.inum as u32), offset));
        }
        offset += DIRENT_SIZE as u32;
    }
    None
}

/// Add `(name, inum)` to a directory, reusing the first free slot if one
/// exists, otherwise appending. Fails if `name` already exists.
pub fn dirlink(dir: InodeHandle, name: &str, inum: u32) -> KernelResult<()> {
    if let Some((existing, _)) = dirlookup(dir, name) {
        inode::iput(existing);
        return Err(KernelError::NameExists);
    }
    let size = inode::isize(dir);
    let mut offset = 0u32;
    let mut raw = [0u8; DIRENT_SIZE];
    let mut free_offset = None;
    while offset < size {
        let n = inode::readi(dir, &mut raw, offset, DIRENT_SIZE as u32).unwrap_or(0);
        if n as usize != DIRENT_SIZE {
            break;
        }
        let entry = DirEntry::decode(&raw);
        if entry.inum == 0 {
            free_offset = Some(offset);
            break;
        }
        offset += DIRENT_SIZE as u32;
    }
    let target_offset = free_offset.unwrap_or(size);
    let entry = DirEntry { inum: inum as u16, name: encode_name(name) };
    let mut buf = [0u8; DIRENT_SIZE];
    entry.encode(&mut buf);
    inode::writei(dir, &buf, target_offset, DIRENT_SIZE as u32)?;
    Ok(())
}

/// Resolve `path` to an inode (§4.8). This system has a single directory
/// (the root); a leading `/` is stripped as the usual absolute-path
/// spelling, but the remainder is looked up as one whole name against the
/// root directory's entries, not split on further `/` characters --
/// multi-level paths are deliberately unsupported, so `"a/b"` is simply a
/// name `namei` will not find rather than a traversal into a subdirectory.
pub fn namei(path: &str) -> KernelResult<InodeHandle> {
    let name = path.strip_prefix('/').unwrap_or(path);
    if name.is_empty() {
        return Ok(root_dir());
    }
    let root = root_dir();
    let found = dirlookup(root, name);
    inode::iput(root);
    match found {
        Some((ih, _)) => Ok(ih),
        None => Err(KernelError::FileNotFound),
    }
}

/// Acquire a fresh handle to the root directory inode.
pub fn root_dir() -> InodeHandle {
    inode::iget(crate::config::ROOTDEV, crate::config::ROOTINO)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(dev: u32) {
        crate::fs::blockdev::mock::reset();
        super::super::blockcache::init();
        super::super::superblock::format_mock_disk(dev);
        super::super::superblock::init(dev);
        inode::init();
    }

    #[test]
    fn link_then_lookup_finds_file() {
        let dev = crate::config::ROOTDEV;
        setup(dev);
        let root = inode::ialloc(dev, InodeType::Directory);
        let child = inode::ialloc(dev, InodeType::File);
        dirlink(root, "hello.txt", inode::inum(child)).unwrap();
        let (found, _) = dirlookup(root, "hello.txt").unwrap();
        assert_eq!(inode::inum(found), inode::inum(child));
    }

    #[test]
    fn duplicate_name_rejected() {
        let dev = crate::config::ROOTDEV;
        setup(dev);
        let root = inode::ialloc(dev, InodeType::Directory);
        let child = inode::ialloc(dev, InodeType::File);
        dirlink(root, "a", inode::inum(child)).unwrap();
        let other = inode::ialloc(dev, InodeType::File);
        assert!(matches!(dirlink(root, "a", inode::inum(other)), Err(KernelError::NameExists)));
    }

    #[test]
    fn lookup_missing_name_returns_none() {
        let dev = crate::config::ROOTDEV;
        setup(dev);
        let root = inode::ialloc(dev, InodeType::Directory);
        assert!(dirlookup(root, "nope").is_none());
    }
}
