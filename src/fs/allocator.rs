//! free space accounting for inode slots and data blocks
use log::{debug, warn};

use super::{Bitmap, Errno};

/// the allocator context of a volume: both bitmaps and their free counters
///
/// Every method either flips the bits it reports or none at all,
/// a failed allocation leaves the bitmaps untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Allocator {
    inode_bitmap: Bitmap,
    block_bitmap: Bitmap,
}

impl Allocator {
    /// an allocator with every inode slot and block free
    pub fn new(inode_count: u32, block_count: u32) -> Self {
        Allocator {
            inode_bitmap: Bitmap::new(inode_count),
            block_bitmap: Bitmap::new(block_count),
        }
    }

    pub fn from_bitmaps(inode_bitmap: Bitmap, block_bitmap: Bitmap) -> Self {
        Allocator {
            inode_bitmap,
            block_bitmap,
        }
    }

    pub fn inode_bitmap(&self) -> &Bitmap {
        &self.inode_bitmap
    }

    pub fn block_bitmap(&self) -> &Bitmap {
        &self.block_bitmap
    }

    pub fn free_inodes(&self) -> u32 {
        self.inode_bitmap.free()
    }

    pub fn free_blocks(&self) -> u32 {
        self.block_bitmap.free()
    }

    pub fn is_inode_allocated(&self, ino: u32) -> bool {
        self.inode_bitmap.is_used(ino)
    }

    pub fn is_block_allocated(&self, block: u32) -> bool {
        self.block_bitmap.is_used(block)
    }

    /// both counters agree with their bitmaps
    pub fn is_consistent(&self) -> bool {
        self.inode_bitmap.is_consistent() && self.block_bitmap.is_consistent()
    }
}

/// inode slots
impl Allocator {
    /// allocate the lowest free inode number
    pub fn allocate_inode(&mut self) -> Result<u32, Errno> {
        let ino = self.inode_bitmap.find_free_run(1).ok_or(libc::ENOSPC)?;
        self.inode_bitmap.mark_used(ino..ino + 1);
        debug!("allocated inode {ino}");
        Ok(ino)
    }

    /// take a specific inode number out of circulation
    pub fn reserve_inode(&mut self, ino: u32) -> Result<(), Errno> {
        if ino >= self.inode_bitmap.len() {
            return Err(libc::EINVAL);
        }
        self.inode_bitmap.mark_used(ino..ino + 1);
        Ok(())
    }

    pub fn free_inode(&mut self, ino: u32) {
        if self.inode_bitmap.mark_free(ino..ino + 1) == 0 {
            warn!("inode {ino} released twice");
        }
    }

    /// allocate an inode number together with its first data block,
    /// nothing is allocated unless both are available
    pub fn allocate_inode_with_block(&mut self) -> Result<(u32, u32), Errno> {
        if self.free_inodes() == 0 || self.free_blocks() == 0 {
            return Err(libc::ENOSPC);
        }
        let ino = self.allocate_inode()?;
        match self.allocate_block() {
            Ok(block) => Ok((ino, block)),
            Err(errno) => {
                self.free_inode(ino);
                Err(errno)
            }
        }
    }
}

/// data blocks
impl Allocator {
    pub fn allocate_block(&mut self) -> Result<u32, Errno> {
        self.allocate_contiguous(1)
    }

    /// allocate `n` physically consecutive blocks, first fit
    /// # Return
    /// the first block of the run
    pub fn allocate_contiguous(&mut self, n: u32) -> Result<u32, Errno> {
        let start = self.block_bitmap.find_free_run(n).ok_or(libc::ENOSPC)?;
        self.block_bitmap.mark_used(start..start + n);
        debug!("allocated blocks {start}..{}", start + n);
        Ok(start)
    }

    /// claim exactly the blocks `start..start + n`,
    /// fails without claiming anything if one of them is taken or out of range
    pub fn allocate_range(&mut self, start: u32, n: u32) -> Result<(), Errno> {
        let end = start.checked_add(n).ok_or(libc::ENOSPC)?;
        if n == 0 || !self.block_bitmap.is_range_free(start..end) {
            return Err(libc::ENOSPC);
        }
        self.block_bitmap.mark_used(start..end);
        debug!("allocated blocks {start}..{end}");
        Ok(())
    }

    pub fn free_block(&mut self, block: u32) {
        self.free_range(block, 1);
    }

    pub fn free_range(&mut self, start: u32, n: u32) {
        let end = start.saturating_add(n);
        let released = self.block_bitmap.mark_free(start..end);
        if released != end - start {
            warn!(
                "released blocks {start}..{end}, but only {released} of them were in use"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_inode() {
        let mut allocator = Allocator::new(4, 4);
        allocator.reserve_inode(0).unwrap();
        assert_eq!(allocator.allocate_inode(), Ok(1));
        assert_eq!(allocator.allocate_inode(), Ok(2));
        allocator.free_inode(1);
        // the lowest free slot is handed out first
        assert_eq!(allocator.allocate_inode(), Ok(1));
        assert_eq!(allocator.allocate_inode(), Ok(3));
        assert_eq!(allocator.allocate_inode(), Err(libc::ENOSPC));
        assert_eq!(allocator.free_inodes(), 0);
    }

    #[test]
    fn test_exhausted_blocks_leave_bitmap_untouched() {
        let mut allocator = Allocator::new(2, 8);
        for expected in 0..8 {
            assert_eq!(allocator.allocate_block(), Ok(expected));
        }
        assert_eq!(allocator.free_blocks(), 0);
        let before = allocator.clone();
        assert_eq!(allocator.allocate_block(), Err(libc::ENOSPC));
        assert_eq!(allocator.allocate_contiguous(2), Err(libc::ENOSPC));
        assert_eq!(allocator, before);
        assert!(allocator.is_consistent());
    }

    #[test]
    fn test_allocate_contiguous_is_all_or_nothing() {
        let mut allocator = Allocator::new(2, 8);
        allocator.allocate_range(2, 1).unwrap();
        allocator.allocate_range(5, 1).unwrap();
        // 0..2, 3..5 and 6..8 are free, none of them holds three blocks
        let before = allocator.clone();
        assert_eq!(allocator.allocate_contiguous(3), Err(libc::ENOSPC));
        assert_eq!(allocator, before);
        assert_eq!(allocator.allocate_contiguous(2), Ok(0));
        assert_eq!(allocator.allocate_contiguous(2), Ok(3));
        assert_eq!(allocator.free_blocks(), 2);
    }

    #[test]
    fn test_allocate_range() {
        let mut allocator = Allocator::new(2, 8);
        assert_eq!(allocator.allocate_range(1, 3), Ok(()));
        assert!(allocator.is_block_allocated(3));
        // overlaps block 3
        assert_eq!(allocator.allocate_range(3, 2), Err(libc::ENOSPC));
        assert!(!allocator.is_block_allocated(4));
        // runs past the end of the volume
        assert_eq!(allocator.allocate_range(6, 3), Err(libc::ENOSPC));
        assert_eq!(allocator.allocate_range(u32::MAX, 2), Err(libc::ENOSPC));
        assert_eq!(allocator.free_blocks(), 5);
    }

    #[test]
    fn test_allocate_inode_with_block() {
        let mut allocator = Allocator::new(3, 1);
        assert_eq!(allocator.allocate_inode_with_block(), Ok((0, 0)));
        // an inode is free but no block is, so nothing is taken
        assert_eq!(allocator.allocate_inode_with_block(), Err(libc::ENOSPC));
        assert_eq!(allocator.free_inodes(), 2);
    }

    #[test]
    fn test_double_free_is_counted_once() {
        let mut allocator = Allocator::new(2, 4);
        let block = allocator.allocate_block().unwrap();
        allocator.free_block(block);
        allocator.free_block(block);
        assert_eq!(allocator.free_blocks(), 4);
        assert!(allocator.is_consistent());
    }
}
