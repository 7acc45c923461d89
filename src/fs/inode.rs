use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::utils::{
    self,
    time_util::TimeDurationStruct,
    traits::{DigestInSelf, SerializeAndDigest},
};

use super::{filekind::FileKind, Errno, MAX_EXTENTS};

/// a contiguous run of physical blocks
///
/// Extent `i` of an inode maps logical chunk `i` of the file.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Extent {
    pub start_block: u32,
    pub block_count: u32,
    /// bytes of this chunk that have been written
    pub bytes_covered: u32,
}

impl Extent {
    pub fn new(start_block: u32, block_count: u32) -> Self {
        Extent {
            start_block,
            block_count,
            bytes_covered: 0,
        }
    }

    /// the block right after this extent
    pub fn end_block(&self) -> u32 {
        self.start_block + self.block_count
    }

    pub fn blocks(&self) -> Range<u32> {
        self.start_block..self.end_block()
    }
}

/// owner of a new inode, as reported by the host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

/// the on-disk inode record, stored in a fixed [INODE_SIZE](super::INODE_SIZE) slot
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Inode {
    pub inode_number: u32,
    /// the directory this inode was created in, the root is its own parent
    pub parent: u32,
    pub file_kind: FileKind,
    pub mode: u32,
    pub hard_links: u32,
    pub user_id: u32,
    pub group_id: u32,
    pub file_size: u64,
    /// total blocks over all extents
    pub block_count: u32,
    pub extent_count: u32,
    pub extents: [Extent; MAX_EXTENTS],
    pub accessed_at: TimeDurationStruct,
    pub modified_at: TimeDurationStruct,
    pub metadata_changed_at: TimeDurationStruct,
    pub digest: [u8; 32],
}

/// This block is about digest and verify digest
impl DigestInSelf for Inode {
    fn digest(&mut self) -> anyhow::Result<()> {
        self.digest = [0u8; 32];
        self.digest = utils::digest::digest(&self)?;
        Ok(())
    }

    fn verify_digest(&mut self) -> bool {
        let current_digest = self.digest;
        self.digest = [0u8; 32];
        let ok = utils::digest::digest(&self).map_or(false, |digest| digest == current_digest);
        self.digest = current_digest;
        ok
    }
}
// This block is about serialization and deserialization
impl SerializeAndDigest for Inode {}

impl Inode {
    pub fn new(inode_number: u32, parent: u32, file_kind: FileKind, mode: u32, owner: Owner) -> Self {
        let now = utils::time_util::now();
        Inode {
            inode_number,
            parent,
            file_kind,
            mode: file_kind.mode_bits() | (mode & 0o7777),
            hard_links: if file_kind.is_dir() { 2 } else { 1 },
            user_id: owner.uid,
            group_id: owner.gid,
            accessed_at: now,
            modified_at: now,
            metadata_changed_at: now,
            // don't calculate digest now
            ..Inode::default()
        }
    }
}

/// This block is about file metadata operations
impl Inode {
    pub fn is_regular_file(&self) -> bool {
        self.file_kind == FileKind::RegularFile
    }

    pub fn is_dir(&self) -> bool {
        self.file_kind == FileKind::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.file_kind == FileKind::SymbolicLink
    }

    pub fn update_modified_at(&mut self) {
        let now = utils::time_util::now();
        self.metadata_changed_at = now;
        self.modified_at = now;
    }

    pub fn update_changed_at(&mut self) {
        self.metadata_changed_at = utils::time_util::now();
    }

    pub fn update_accessed_at(&mut self) {
        self.accessed_at = utils::time_util::now();
    }
}

/// This block is about the extent list
impl Inode {
    /// the extents in use
    pub fn extents(&self) -> &[Extent] {
        &self.extents[..(self.extent_count as usize).min(MAX_EXTENTS)]
    }

    /// the first block of the inode, a directory keeps its entries there
    pub fn first_block(&self) -> Option<u32> {
        self.extents().first().map(|extent| extent.start_block)
    }

    /// the block right after the last extent, where in-place growth continues
    pub fn tail_block(&self) -> Option<u32> {
        self.extents().last().map(Extent::end_block)
    }

    /// translate a logical block index into a physical block
    /// # Return
    /// `None` if the index is past the allocated blocks
    /// or the extent list does not cover it
    pub fn physical_block(&self, logical: u64, blocks_per_chunk: u32) -> Option<u32> {
        if logical >= self.block_count as u64 {
            return None;
        }
        let chunk = logical / blocks_per_chunk as u64;
        let within = (logical % blocks_per_chunk as u64) as u32;
        let extent = self.extents().get(usize::try_from(chunk).ok()?)?;
        (within < extent.block_count).then(|| extent.start_block + within)
    }

    /// append `count` blocks starting at `start`,
    /// filling the last chunk before opening new extents
    ///
    /// `start` must be the [tail block](Inode::tail_block) when the inode has extents.
    pub fn append_blocks(&mut self, start: u32, count: u32, blocks_per_chunk: u32) -> Result<(), Errno> {
        let capacity = MAX_EXTENTS as u64 * blocks_per_chunk as u64;
        if self.block_count as u64 + count as u64 > capacity {
            return Err(libc::EFBIG);
        }
        if let Some(tail) = self.tail_block() {
            if tail != start {
                return Err(libc::EIO);
            }
        }
        let mut next = start;
        let mut remaining = count;
        if let Some(last) = self.extent_count.checked_sub(1) {
            let extent = &mut self.extents[last as usize];
            let take = blocks_per_chunk.saturating_sub(extent.block_count).min(remaining);
            extent.block_count += take;
            next += take;
            remaining -= take;
        }
        while remaining > 0 {
            let take = blocks_per_chunk.min(remaining);
            let slot = self
                .extents
                .get_mut(self.extent_count as usize)
                .ok_or(libc::EFBIG)?;
            *slot = Extent::new(next, take);
            self.extent_count += 1;
            next += take;
            remaining -= take;
        }
        self.block_count += count;
        Ok(())
    }

    /// drop the blocks past the first `keep` ones
    /// # Return
    /// the physical ranges that are no longer referenced
    pub fn trim_to_blocks(&mut self, keep: u32, blocks_per_chunk: u32) -> Vec<Range<u32>> {
        let mut released = Vec::new();
        while self.block_count > keep {
            let Some(last) = self.extent_count.checked_sub(1) else {
                break;
            };
            let chunk_first = last.saturating_mul(blocks_per_chunk);
            let extent = &mut self.extents[last as usize];
            let keep_here = keep.saturating_sub(chunk_first).min(extent.block_count);
            let dropped = extent.block_count - keep_here;
            if dropped == 0 {
                break;
            }
            released.push(extent.start_block + keep_here..extent.end_block());
            extent.block_count = keep_here;
            self.block_count -= dropped;
            if keep_here == 0 {
                *extent = Extent::default();
                self.extent_count -= 1;
            }
        }
        released
    }

    /// record that the bytes `start..end` have been written
    pub fn cover(&mut self, start: u64, end: u64, chunk_size: u64) {
        if end <= start {
            return;
        }
        let extent_count = self.extents().len() as u64;
        for chunk in (start / chunk_size)..=((end - 1) / chunk_size) {
            if chunk >= extent_count {
                break;
            }
            let covered = (end.min((chunk + 1) * chunk_size) - chunk * chunk_size) as u32;
            let extent = &mut self.extents[chunk as usize];
            extent.bytes_covered = extent.bytes_covered.max(covered);
        }
    }

    /// forget coverage past a new, smaller file size
    pub fn clamp_coverage(&mut self, size: u64, chunk_size: u64) {
        let extent_count = self.extents().len();
        for (chunk, extent) in self.extents[..extent_count].iter_mut().enumerate() {
            let limit = size.saturating_sub(chunk as u64 * chunk_size).min(chunk_size);
            extent.bytes_covered = extent.bytes_covered.min(limit as u32);
        }
    }
}

/// a runtime reference to an inode: its number plus its kind,
/// the record itself is always read back through the inode table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InodeHandle {
    ino: u32,
    kind: FileKind,
}

impl InodeHandle {
    pub(crate) fn new(ino: u32, kind: FileKind) -> Self {
        InodeHandle { ino, kind }
    }

    pub fn ino(&self) -> u32 {
        self.ino
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }
}

impl From<&Inode> for InodeHandle {
    fn from(inode: &Inode) -> Self {
        InodeHandle::new(inode.inode_number, inode.file_kind)
    }
}
