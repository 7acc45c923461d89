use anyhow::{anyhow, ensure};
use byte_unit::Byte;
use serde::{Deserialize, Serialize};

use crate::utils::{
    digest, fs_size_calculator,
    time_util::{self, TimeDurationStruct},
    traits::{DigestInSelf, SerializeAndDigest},
};

use super::{
    Layout, Owner, DEFAULT_BLOCKS_PER_CHUNK, DEFAULT_BLOCK_SIZE, DEFAULT_INODE_COUNT, FS_MAGIC,
    MIN_BLOCK_SIZE,
};

/// geometry of a new volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsConfig {
    /// data block size, a power of two, at least [MIN_BLOCK_SIZE]
    pub block_size: u32,
    /// inode slots, slot 0 is never handed out
    pub inode_count: u32,
    /// data blocks
    pub block_count: u32,
    /// how many blocks one extent may span
    pub blocks_per_chunk: u32,
    pub owner: Owner,
}

impl Default for FsConfig {
    fn default() -> Self {
        FsConfig {
            block_size: DEFAULT_BLOCK_SIZE,
            inode_count: DEFAULT_INODE_COUNT,
            block_count: DEFAULT_INODE_COUNT * DEFAULT_BLOCKS_PER_CHUNK,
            blocks_per_chunk: DEFAULT_BLOCKS_PER_CHUNK,
            owner: Owner::default(),
        }
    }
}

impl FsConfig {
    /// the largest volume with this block size and inode count that fits in `image_size` bytes
    pub fn for_image_size(
        image_size: u64,
        block_size: u32,
        inode_count: u32,
        blocks_per_chunk: u32,
    ) -> anyhow::Result<Self> {
        let config = FsConfig {
            block_size,
            inode_count,
            block_count: 1,
            blocks_per_chunk,
            owner: Owner::default(),
        };
        config.validate()?;
        let block_count =
            fs_size_calculator::block_count_for_image(image_size, block_size, inode_count)
                .ok_or_else(|| {
                    anyhow!(
                        "image size must be at least {} for block size {} and inode count {}",
                        Byte::from_bytes(config.image_size() as _).get_appropriate_unit(true),
                        block_size,
                        inode_count
                    )
                })?;
        Ok(FsConfig {
            block_count,
            ..config
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.block_size >= MIN_BLOCK_SIZE && self.block_size.is_power_of_two(),
            "block size {} must be a power of two and at least {MIN_BLOCK_SIZE}",
            self.block_size
        );
        ensure!(
            self.inode_count >= 2,
            "a volume needs at least 2 inodes, got {}",
            self.inode_count
        );
        ensure!(self.block_count >= 1, "a volume needs at least 1 data block");
        ensure!(
            self.blocks_per_chunk >= 1,
            "an extent must be able to hold at least 1 block"
        );
        Ok(())
    }

    /// bytes needed by a volume of this geometry
    pub fn image_size(&self) -> u64 {
        fs_size_calculator::image_size(self.block_size, self.inode_count, self.block_count)
    }
}

/// The superblock of this filesystem
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SuperBlock {
    /// magic number
    pub magic: u32,
    /// data block size
    pub block_size: u32,
    pub blocks_per_chunk: u32,
    pub inode_count: u32,
    pub block_count: u32,
    pub free_inodes: u32,
    pub free_blocks: u32,
    pub inode_bitmap_offset: u64,
    pub block_bitmap_offset: u64,
    pub inode_table_offset: u64,
    pub data_offset: u64,
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
    pub created_at: TimeDurationStruct,
    pub last_mounted_at: TimeDurationStruct,
    /// to verify the integrity of this superblock
    pub digest: [u8; 32],
}

impl SuperBlock {
    pub fn new(config: &FsConfig, layout: &Layout) -> Self {
        SuperBlock {
            magic: FS_MAGIC,
            block_size: config.block_size,
            blocks_per_chunk: config.blocks_per_chunk,
            inode_count: config.inode_count,
            block_count: config.block_count,
            free_inodes: config.inode_count,
            free_blocks: config.block_count,
            inode_bitmap_offset: layout.inode_bitmap_offset,
            block_bitmap_offset: layout.block_bitmap_offset,
            inode_table_offset: layout.inode_table_offset,
            data_offset: layout.data_offset,
            uid: config.owner.uid,
            gid: config.owner.gid,
            created_at: time_util::now(),
            ..SuperBlock::default()
        }
    }

    /// the layout recorded in this superblock must be the one its geometry implies
    pub fn check_layout(&self) -> anyhow::Result<Layout> {
        ensure!(
            self.magic == FS_MAGIC,
            "bad magic number {:#x}, not an extentfs image",
            self.magic
        );
        self.config().validate()?;
        let layout = Layout::new(self.block_size, self.inode_count, self.block_count);
        ensure!(
            layout.inode_bitmap_offset == self.inode_bitmap_offset
                && layout.block_bitmap_offset == self.block_bitmap_offset
                && layout.inode_table_offset == self.inode_table_offset
                && layout.data_offset == self.data_offset,
            "region offsets in the superblock do not match its geometry"
        );
        ensure!(
            self.free_inodes <= self.inode_count && self.free_blocks <= self.block_count,
            "free counters exceed the totals"
        );
        Ok(layout)
    }

    pub fn config(&self) -> FsConfig {
        FsConfig {
            block_size: self.block_size,
            inode_count: self.inode_count,
            block_count: self.block_count,
            blocks_per_chunk: self.blocks_per_chunk,
            owner: Owner {
                uid: self.uid,
                gid: self.gid,
            },
        }
    }

    /// bytes one extent spans
    pub fn chunk_size(&self) -> u64 {
        self.blocks_per_chunk as u64 * self.block_size as u64
    }

    pub fn update_last_mounted_at(&mut self) {
        self.last_mounted_at = time_util::now();
    }
}

impl DigestInSelf for SuperBlock {
    fn digest(&mut self) -> anyhow::Result<()> {
        self.digest = [0u8; 32];
        self.digest = digest::digest(&self)?;
        Ok(())
    }

    fn verify_digest(&mut self) -> bool {
        // get digest from itself
        let stored = self.digest;
        // clear the digest from struct
        self.digest = [0u8; 32];
        // calculate the digest and verify
        let ok = digest::digest(&self).map_or(false, |digest| digest == stored);
        self.digest = stored;
        ok
    }
}

impl SerializeAndDigest for SuperBlock {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(FsConfig::default().validate().is_ok());
        let bad_block_size = FsConfig {
            block_size: 300,
            ..FsConfig::default()
        };
        assert!(bad_block_size.validate().is_err());
        let too_small = FsConfig {
            block_size: 128,
            ..FsConfig::default()
        };
        assert!(too_small.validate().is_err());
        let one_inode = FsConfig {
            inode_count: 1,
            ..FsConfig::default()
        };
        assert!(one_inode.validate().is_err());
        let no_chunk = FsConfig {
            blocks_per_chunk: 0,
            ..FsConfig::default()
        };
        assert!(no_chunk.validate().is_err());
    }

    #[test]
    fn test_for_image_size() -> anyhow::Result<()> {
        let config = FsConfig::for_image_size(1 << 20, 512, 64, 4)?;
        assert!(config.image_size() <= 1 << 20);
        assert!(config.block_count > 1000);
        assert!(FsConfig::for_image_size(1024, 512, 64, 4).is_err());
        Ok(())
    }

    #[test]
    fn test_superblock_digest() -> anyhow::Result<()> {
        let config = FsConfig {
            block_size: 256,
            inode_count: 4,
            block_count: 8,
            ..FsConfig::default()
        };
        let layout = Layout::new(config.block_size, config.inode_count, config.block_count);
        let mut superblock = SuperBlock::new(&config, &layout);
        let serialized = SerializeAndDigest::serialize(&mut superblock)?;
        assert!(serialized.len() <= config.block_size as usize);
        let (mut restored, _) = <SuperBlock as SerializeAndDigest>::deserialize(&serialized)?;
        assert_eq!(restored, superblock);
        assert_eq!(restored.check_layout()?, layout);

        restored.free_blocks = 3;
        assert!(!restored.verify_digest());
        Ok(())
    }
}
