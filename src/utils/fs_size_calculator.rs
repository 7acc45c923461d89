//! This module contains functions to calculate the size of different fs regions
//!
//! An image is laid out as:
//! superblock block, inode bitmap, block bitmap, inode table, data region.
//! Every region starts on a block boundary.

use crate::fs::INODE_SIZE;

/// calculate the bytes needed by a bitmap
/// # Arguments
/// - `element_count`: the number of tracked elements
/// # Example
/// ```
/// use extentfs::utils::fs_size_calculator::bitmap_size;
/// let bitmap_size = bitmap_size(100);
/// assert_eq!(bitmap_size, 13);
/// ```
pub const fn bitmap_size(element_count: u32) -> u64 {
    (element_count as u64).div_ceil(8)
}

/// calculate how many blocks are needed to hold `bytes`
/// # Example
/// ```
/// use extentfs::utils::fs_size_calculator::blocks_for;
/// assert_eq!(blocks_for(0, 512), 0);
/// assert_eq!(blocks_for(1, 512), 1);
/// assert_eq!(blocks_for(513, 512), 2);
/// ```
pub const fn blocks_for(bytes: u64, block_size: u32) -> u64 {
    bytes.div_ceil(block_size as u64)
}

/// calculate needed Inode Table size
/// # Example
/// ```
/// use extentfs::utils::fs_size_calculator::inode_table_size;
/// use extentfs::INODE_SIZE;
/// assert_eq!(inode_table_size(64), 64 * INODE_SIZE as u64);
/// ```
pub const fn inode_table_size(inode_count: u32) -> u64 {
    inode_count as u64 * INODE_SIZE as u64
}

/// calculate the blocks used by everything in front of the data region
/// # Example
/// ```
/// use extentfs::utils::fs_size_calculator::metadata_blocks;
/// // superblock + inode bitmap + block bitmap + 4 blocks of inode table
/// assert_eq!(metadata_blocks(256, 4, 8), 7);
/// ```
pub const fn metadata_blocks(block_size: u32, inode_count: u32, block_count: u32) -> u64 {
    1 + blocks_for(bitmap_size(inode_count), block_size)
        + blocks_for(bitmap_size(block_count), block_size)
        + blocks_for(inode_table_size(inode_count), block_size)
}

/// calculate the size of a whole image
/// # Example
/// ```
/// use extentfs::utils::fs_size_calculator::image_size;
/// assert_eq!(image_size(256, 4, 8), 15 * 256);
/// ```
pub const fn image_size(block_size: u32, inode_count: u32, block_count: u32) -> u64 {
    (metadata_blocks(block_size, inode_count, block_count) + block_count as u64)
        * block_size as u64
}

/// calculate how many data blocks fit in an image of `image_size` bytes
/// # Return
/// `None` if not even one data block fits
/// # Example
/// ```
/// use extentfs::utils::fs_size_calculator::{block_count_for_image, image_size};
/// let blocks = block_count_for_image(1 << 20, 4096, 64).unwrap();
/// assert!(image_size(4096, 64, blocks) <= 1 << 20);
/// assert_eq!(block_count_for_image(4096, 4096, 64), None);
/// ```
pub fn block_count_for_image(image_size: u64, block_size: u32, inode_count: u32) -> Option<u32> {
    let total_blocks = image_size / block_size as u64;
    // the block bitmap grows with the block count,
    // size it for the upper bound so the result always fits
    let fixed = 1
        + blocks_for(bitmap_size(inode_count), block_size)
        + blocks_for(inode_table_size(inode_count), block_size);
    let available = total_blocks.checked_sub(fixed)?;
    let upper = u32::try_from(available).unwrap_or(u32::MAX);
    let bitmap_blocks = blocks_for(bitmap_size(upper), block_size);
    let block_count = available.checked_sub(bitmap_blocks)?;
    match u32::try_from(block_count) {
        Ok(0) => None,
        Ok(count) => Some(count),
        Err(_) => Some(u32::MAX),
    }
}
