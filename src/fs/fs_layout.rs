//! what does our filesystem look like in the memory
use std::{fmt, io, ops::Range};

use anyhow::{anyhow, ensure, Context};
use byte_unit::Byte;
use log::{debug, error, info, warn};
use memmap2::MmapMut;
use spin::{Mutex, MutexGuard, RwLock};

use crate::utils::{
    fs_size_calculator::{bitmap_size, blocks_for, inode_table_size},
    traits::SerializeAndDigest,
};

use super::{
    Allocator, Bitmap, Errno, FileKind, FsConfig, Inode, InodeHandle, SuperBlock, INODE_SIZE,
    MAX_FILENAME_LEN, RESERVED_INODE, ROOT_INODE,
};

/// bytes a volume lives in
///
/// an image file mapped with [MmapMut], or a plain [Vec] for volumes that only live in memory
pub trait Storage: AsRef<[u8]> + AsMut<[u8]> {
    /// make the bytes durable
    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Storage for Vec<u8> {}

impl Storage for MmapMut {
    fn sync(&mut self) -> io::Result<()> {
        self.flush()
    }
}

/// turn an errno into an [anyhow::Error] for volume level paths
pub(crate) fn os_error(errno: Errno) -> anyhow::Error {
    io::Error::from_raw_os_error(errno).into()
}

/// where every region of a volume starts, all regions are block aligned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub block_size: u32,
    pub inode_count: u32,
    pub block_count: u32,
    pub inode_bitmap_offset: u64,
    pub block_bitmap_offset: u64,
    pub inode_table_offset: u64,
    pub data_offset: u64,
    pub image_size: u64,
}

impl Layout {
    pub fn new(block_size: u32, inode_count: u32, block_count: u32) -> Self {
        let bs = block_size as u64;
        // block 0 holds the superblock
        let inode_bitmap_offset = bs;
        let block_bitmap_offset =
            inode_bitmap_offset + blocks_for(bitmap_size(inode_count), block_size) * bs;
        let inode_table_offset =
            block_bitmap_offset + blocks_for(bitmap_size(block_count), block_size) * bs;
        let data_offset =
            inode_table_offset + blocks_for(inode_table_size(inode_count), block_size) * bs;
        Layout {
            block_size,
            inode_count,
            block_count,
            inode_bitmap_offset,
            block_bitmap_offset,
            inode_table_offset,
            data_offset,
            image_size: data_offset + block_count as u64 * bs,
        }
    }

    fn inode_bitmap(&self) -> Range<u64> {
        self.inode_bitmap_offset..self.inode_bitmap_offset + bitmap_size(self.inode_count)
    }

    fn block_bitmap(&self) -> Range<u64> {
        self.block_bitmap_offset..self.block_bitmap_offset + bitmap_size(self.block_count)
    }

    fn inode_slot(&self, ino: u32) -> Option<Range<u64>> {
        (ino < self.inode_count).then(|| {
            let start = self.inode_table_offset + ino as u64 * INODE_SIZE as u64;
            start..start + INODE_SIZE as u64
        })
    }

    fn block(&self, block: u32) -> Option<Range<u64>> {
        (block < self.block_count).then(|| {
            let start = self.data_offset + block as u64 * self.block_size as u64;
            start..start + self.block_size as u64
        })
    }
}

/// the backing bytes of a volume with bounds checked accessors,
/// a bad address is `EIO`, never a panic
pub struct Image<S> {
    storage: S,
    layout: Layout,
}

impl<S: Storage> Image<S> {
    fn new(storage: S, layout: Layout) -> Self {
        Image { storage, layout }
    }

    fn bytes(&self, range: Range<u64>) -> Result<&[u8], Errno> {
        let range = usize::try_from(range.start).map_err(|_| libc::EIO)?
            ..usize::try_from(range.end).map_err(|_| libc::EIO)?;
        self.storage.as_ref().get(range).ok_or(libc::EIO)
    }

    fn bytes_mut(&mut self, range: Range<u64>) -> Result<&mut [u8], Errno> {
        let range = usize::try_from(range.start).map_err(|_| libc::EIO)?
            ..usize::try_from(range.end).map_err(|_| libc::EIO)?;
        self.storage.as_mut().get_mut(range).ok_or(libc::EIO)
    }

    /// the contents of data block `block`
    pub fn block(&self, block: u32) -> Result<&[u8], Errno> {
        self.bytes(self.layout.block(block).ok_or(libc::EIO)?)
    }

    pub fn block_mut(&mut self, block: u32) -> Result<&mut [u8], Errno> {
        self.bytes_mut(self.layout.block(block).ok_or(libc::EIO)?)
    }

    /// decode the record in slot `ino`
    /// # Error
    /// `EIO` if the slot does not exist, does not decode,
    /// fails its digest or belongs to another inode
    pub fn read_inode(&self, ino: u32) -> Result<Inode, Errno> {
        let slot = self.bytes(self.layout.inode_slot(ino).ok_or(libc::EIO)?)?;
        let (inode, _) = Inode::deserialize(slot).map_err(|e| {
            warn!("inode {ino} is corrupted: {e}");
            libc::EIO
        })?;
        if inode.inode_number != ino {
            warn!("slot {ino} holds inode {}", inode.inode_number);
            return Err(libc::EIO);
        }
        Ok(inode)
    }

    /// encode `inode` into its slot, refreshing its digest
    pub fn write_inode(&mut self, inode: &mut Inode) -> Result<(), Errno> {
        let range = self
            .layout
            .inode_slot(inode.inode_number)
            .ok_or(libc::EIO)?;
        let serialized = inode.serialize().map_err(|e| {
            error!("failed to serialize inode {}: {e}", inode.inode_number);
            libc::EIO
        })?;
        if serialized.len() > INODE_SIZE as usize {
            error!(
                "inode {} needs {} bytes, more than a slot",
                inode.inode_number,
                serialized.len()
            );
            return Err(libc::EIO);
        }
        let slot = self.bytes_mut(range)?;
        let (record, rest) = slot.split_at_mut(serialized.len());
        record.copy_from_slice(&serialized);
        rest.fill(0);
        Ok(())
    }

    /// zero slot `ino`
    pub fn clear_inode(&mut self, ino: u32) -> Result<(), Errno> {
        let range = self.layout.inode_slot(ino).ok_or(libc::EIO)?;
        self.bytes_mut(range)?.fill(0);
        Ok(())
    }

    /// store the size and block mapping of `inode` over the record in its slot,
    /// the other fields of the stored record are kept
    pub fn commit_extents(&mut self, inode: &Inode, touch: bool) -> Result<(), Errno> {
        let mut stored = self.read_inode(inode.inode_number)?;
        stored.file_size = inode.file_size;
        stored.block_count = inode.block_count;
        stored.extent_count = inode.extent_count;
        stored.extents = inode.extents;
        if touch {
            stored.update_modified_at();
        }
        self.write_inode(&mut stored)
    }

    /// copy both bitmaps of `allocator` into their regions
    pub fn write_bitmaps(&mut self, allocator: &Allocator) -> Result<(), Errno> {
        for (offset, raw) in [
            (self.layout.inode_bitmap_offset, allocator.inode_bitmap().to_raw()),
            (self.layout.block_bitmap_offset, allocator.block_bitmap().to_raw()),
        ] {
            self.bytes_mut(offset..offset + raw.len() as u64)?
                .copy_from_slice(&raw);
        }
        Ok(())
    }

    fn write_region(&mut self, offset: u64, data: &[u8]) -> anyhow::Result<()> {
        self.bytes_mut(offset..offset + data.len() as u64)
            .map_err(os_error)
            .with_context(|| format!("region at {offset} is out of the image"))?
            .copy_from_slice(data);
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        self.storage.sync()
    }
}

/// statistics of a volume, like `statfs(2)` reports them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    pub block_size: u32,
    pub blocks_per_chunk: u32,
    pub inode_count: u32,
    pub free_inodes: u32,
    pub block_count: u32,
    pub free_blocks: u32,
    pub max_name_len: u32,
}

impl fmt::Display for FsStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = |blocks: u32| {
            Byte::from_bytes((blocks as u64 * self.block_size as u64) as _).get_appropriate_unit(true)
        };
        writeln!(f, "block size:       {}", self.block_size)?;
        writeln!(f, "blocks per chunk: {}", self.blocks_per_chunk)?;
        writeln!(
            f,
            "inodes:           {} free of {}",
            self.free_inodes, self.inode_count
        )?;
        writeln!(
            f,
            "data blocks:      {} free of {} ({} free of {})",
            self.free_blocks,
            self.block_count,
            bytes(self.free_blocks),
            bytes(self.block_count)
        )?;
        write!(f, "max name length:  {}", self.max_name_len)
    }
}

/// an extent based filesystem volume
///
/// it has the following layout:
/// - superblock
/// - inode bitmap
/// - block bitmap
/// - inode table
/// - data blocks
///
/// Every operation takes `&self`, locks are taken in the order
/// inode lock, allocator, image. A directory is locked before the inodes it names.
pub struct ExtentFs<S: Storage> {
    pub(super) superblock: SuperBlock,
    pub(super) layout: Layout,
    pub(super) allocator: Mutex<Allocator>,
    pub(super) image: RwLock<Image<S>>,
    pub(super) inode_locks: Box<[Mutex<()>]>,
}

impl ExtentFs<Vec<u8>> {
    /// format a volume that only lives in memory
    pub fn in_memory(config: FsConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let size = usize::try_from(config.image_size())
            .map_err(|_| anyhow!("an image of {} bytes does not fit in memory", config.image_size()))?;
        Self::format(vec![0u8; size], config)
    }
}

impl<S: Storage> ExtentFs<S> {
    /// create a new filesystem on `storage`
    /// # Params
    /// - `storage`: at least [FsConfig::image_size] bytes, its metadata regions are overwritten
    /// - `config`: the geometry of the new volume
    pub fn format(mut storage: S, config: FsConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let layout = Layout::new(config.block_size, config.inode_count, config.block_count);
        let available = storage.as_ref().len() as u64;
        ensure!(
            available >= layout.image_size,
            "storage holds {}, the volume needs {}",
            Byte::from_bytes(available as _).get_appropriate_unit(true),
            Byte::from_bytes(layout.image_size as _).get_appropriate_unit(true)
        );
        let metadata_end = usize::try_from(layout.data_offset)?;
        storage.as_mut()[..metadata_end].fill(0);

        let superblock = SuperBlock::new(&config, &layout);
        let mut allocator = Allocator::new(config.inode_count, config.block_count);
        allocator.reserve_inode(RESERVED_INODE).map_err(os_error)?;
        let fs = Self::assemble(superblock, layout, allocator, storage);
        fs.create_root()?;
        fs.flush()?;
        info!(
            "formatted a volume of {} inodes and {} blocks of {} bytes",
            config.inode_count, config.block_count, config.block_size
        );
        Ok(fs)
    }

    /// restore a filesystem from `storage`
    pub fn open(storage: S) -> anyhow::Result<Self> {
        let (superblock, _) =
            SuperBlock::deserialize(storage.as_ref()).context("failed to read the superblock")?;
        let layout = superblock.check_layout()?;
        ensure!(
            storage.as_ref().len() as u64 >= layout.image_size,
            "image is truncated, expect {} bytes, found {}",
            layout.image_size,
            storage.as_ref().len()
        );
        let image = Image::new(storage, layout);
        let inode_bitmap = Bitmap::from_raw(
            image.bytes(layout.inode_bitmap()).map_err(os_error)?,
            layout.inode_count,
        );
        let block_bitmap = Bitmap::from_raw(
            image.bytes(layout.block_bitmap()).map_err(os_error)?,
            layout.block_count,
        );
        let mut allocator = Allocator::from_bitmaps(inode_bitmap, block_bitmap);
        if allocator.free_inodes() != superblock.free_inodes
            || allocator.free_blocks() != superblock.free_blocks
        {
            warn!(
                "free counters ({} inodes, {} blocks) disagree with the bitmaps ({}, {}), using the bitmaps",
                superblock.free_inodes,
                superblock.free_blocks,
                allocator.free_inodes(),
                allocator.free_blocks()
            );
        }
        if !allocator.is_inode_allocated(RESERVED_INODE) {
            warn!("inode {RESERVED_INODE} was not reserved");
            allocator.reserve_inode(RESERVED_INODE).map_err(os_error)?;
        }
        let fs = Self::assemble(superblock, layout, allocator, image.storage);
        fs.create_root()?;
        debug!("opened volume: {:?}", fs.stats());
        Ok(fs)
    }

    fn assemble(superblock: SuperBlock, layout: Layout, allocator: Allocator, storage: S) -> Self {
        ExtentFs {
            superblock,
            layout,
            allocator: Mutex::new(allocator),
            image: RwLock::new(Image::new(storage, layout)),
            inode_locks: (0..layout.inode_count).map(|_| Mutex::new(())).collect(),
        }
    }

    /// create root directory "/" unless it exists, it is its own parent
    fn create_root(&self) -> anyhow::Result<()> {
        // if already has root inode, do nothing
        if self.allocator.lock().is_inode_allocated(ROOT_INODE) {
            return Ok(());
        }
        let owner = self.superblock.config().owner;
        let root = self
            .init_inode(ROOT_INODE, FileKind::Directory, 0o755, owner)
            .map_err(os_error)
            .context("failed to create the root directory")?;
        if root.ino() != ROOT_INODE {
            self.release_inode(root).map_err(os_error)?;
            return Err(anyhow!("root inode index must be {ROOT_INODE}, not {}", root.ino()));
        }
        Ok(())
    }

    /// persist the superblock with the current counters and both bitmaps
    pub fn flush(&self) -> anyhow::Result<()> {
        let allocator = self.allocator.lock();
        let mut superblock = SuperBlock {
            free_inodes: allocator.free_inodes(),
            free_blocks: allocator.free_blocks(),
            ..self.superblock.clone()
        };
        let serialized = superblock.serialize()?;
        ensure!(
            serialized.len() <= self.layout.block_size as usize,
            "superblock does not fit in one block"
        );
        let mut image = self.image.write();
        image.write_region(0, &serialized)?;
        image
            .write_bitmaps(&allocator)
            .map_err(os_error)
            .context("failed to write the bitmaps")?;
        drop(allocator);
        image.sync().context("failed to sync the image")?;
        debug!("flushed superblock and bitmaps");
        Ok(())
    }

    /// give back the storage, after flushing it
    pub fn into_storage(self) -> anyhow::Result<S> {
        self.flush()?;
        Ok(self.image.into_inner().storage)
    }

    /// run `f` on the allocator, then store the bitmaps it leaves in the image
    ///
    /// Inode records and directory blocks reach the image as soon as they change,
    /// the bitmaps must not lag behind them.
    pub(super) fn with_allocator<T>(&self, f: impl FnOnce(&mut Allocator) -> T) -> T {
        let mut allocator = self.allocator.lock();
        let result = f(&mut allocator);
        if let Err(errno) = self.image.write().write_bitmaps(&allocator) {
            error!("failed to store the bitmaps: errno {errno}");
        }
        result
    }

    pub fn mark_mounted(&mut self) {
        self.superblock.update_last_mounted_at();
    }
}

/// get [SuperBlock], geometry and statistics of this filesystem
impl<S: Storage> ExtentFs<S> {
    #[inline]
    pub fn superblock(&self) -> &SuperBlock {
        &self.superblock
    }

    #[inline]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    #[inline]
    pub fn block_size(&self) -> u32 {
        self.layout.block_size
    }

    #[inline]
    pub fn blocks_per_chunk(&self) -> u32 {
        self.superblock.blocks_per_chunk
    }

    pub fn stats(&self) -> FsStats {
        let allocator = self.allocator.lock();
        FsStats {
            block_size: self.layout.block_size,
            blocks_per_chunk: self.superblock.blocks_per_chunk,
            inode_count: self.layout.inode_count,
            free_inodes: allocator.free_inodes(),
            block_count: self.layout.block_count,
            free_blocks: allocator.free_blocks(),
            max_name_len: MAX_FILENAME_LEN as u32 - 1,
        }
    }

    /// the root directory
    pub fn root(&self) -> InodeHandle {
        InodeHandle::new(ROOT_INODE, FileKind::Directory)
    }

    /// serialize mutations of one inode
    pub(super) fn inode_lock(&self, ino: u32) -> Result<MutexGuard<'_, ()>, Errno> {
        self.inode_locks
            .get(ino as usize)
            .map(|lock| lock.lock())
            .ok_or(libc::ENOENT)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{fs::Owner, utils::fs_size_calculator};

    /// 4 inodes, 8 blocks of 256 bytes, one block per extent
    pub(crate) fn tiny_config() -> FsConfig {
        FsConfig {
            block_size: 256,
            inode_count: 4,
            block_count: 8,
            blocks_per_chunk: 1,
            ..FsConfig::default()
        }
    }

    #[test]
    fn test_layout() {
        let layout = Layout::new(256, 4, 8);
        assert_eq!(layout.inode_bitmap_offset, 256);
        assert_eq!(layout.block_bitmap_offset, 512);
        assert_eq!(layout.inode_table_offset, 768);
        assert_eq!(layout.data_offset, 768 + 4 * 256);
        assert_eq!(layout.image_size, fs_size_calculator::image_size(256, 4, 8));
        assert_eq!(layout.block(8), None);
        assert_eq!(layout.inode_slot(4), None);
    }

    #[test]
    fn test_format() -> anyhow::Result<()> {
        let fs = ExtentFs::in_memory(tiny_config())?;
        let stats = fs.stats();
        // sentinel and root
        assert_eq!(stats.free_inodes, 2);
        // root directory block
        assert_eq!(stats.free_blocks, 7);
        let root = fs.inode(ROOT_INODE).map_err(os_error)?;
        assert!(root.is_dir());
        assert_eq!(root.parent, ROOT_INODE);
        assert_eq!(root.hard_links, 2);
        assert_eq!(root.mode, libc::S_IFDIR as u32 | 0o755);
        assert_eq!(root.file_size, 0);
        assert!(fs.allocator.lock().is_inode_allocated(RESERVED_INODE));
        Ok(())
    }

    #[test]
    fn test_format_rejects_small_storage() {
        let config = tiny_config();
        let storage = vec![0u8; config.image_size() as usize - 1];
        assert!(ExtentFs::format(storage, config).is_err());
    }

    #[test]
    fn test_open_rejects_garbage() {
        assert!(ExtentFs::open(vec![0u8; 4096]).is_err());
        assert!(ExtentFs::open(Vec::new()).is_err());
    }

    #[test]
    fn test_open_repairs_counters() -> anyhow::Result<()> {
        let fs = ExtentFs::in_memory(tiny_config())?;
        let layout = *fs.layout();
        let mut storage = fs.into_storage()?;
        // claim a block behind the superblock's back
        storage[layout.block_bitmap_offset as usize] |= 0b1000_0000;
        let fs = ExtentFs::open(storage)?;
        assert_eq!(fs.stats().free_blocks, 6);
        assert!(fs.allocator.lock().is_consistent());
        Ok(())
    }

    #[test]
    fn test_reopen_without_flush_keeps_allocations() -> anyhow::Result<()> {
        let fs = ExtentFs::in_memory(FsConfig {
            inode_count: 8,
            block_count: 16,
            ..tiny_config()
        })?;
        let mode = libc::S_IFREG as u32 | 0o644;
        let a = fs
            .create(fs.root(), b"a", mode, Owner::default())
            .map_err(os_error)?;
        ExtentFs::write(&fs, a, [3u8; 700].as_slice(), 700, 0).map_err(os_error)?;
        let stats = fs.stats();
        // the process dies before the volume is flushed
        let storage = fs.image.into_inner().storage;

        let fs = ExtentFs::open(storage)?;
        assert_eq!(fs.stats(), stats);
        assert_eq!(fs.lookup(fs.root(), b"a"), Ok(Some(a.ino())));
        let b = fs
            .create(fs.root(), b"b", mode, Owner::default())
            .map_err(os_error)?;
        assert_ne!(b.ino(), a.ino());
        let a_blocks = fs.inode(a.ino()).map_err(os_error)?.extents().to_vec();
        let b_first = fs.inode(b.ino()).map_err(os_error)?.first_block();
        assert!(b_first.is_some());
        assert!(a_blocks
            .iter()
            .all(|extent| !b_first.map_or(false, |block| extent.blocks().contains(&block))));
        Ok(())
    }

    #[test]
    fn test_corrupted_inode_reads_as_eio() -> anyhow::Result<()> {
        let fs = ExtentFs::in_memory(tiny_config())?;
        let slot = fs.layout.inode_slot(ROOT_INODE).unwrap();
        fs.image.write().bytes_mut(slot).map_err(os_error)?[12] ^= 0xff;
        assert_eq!(fs.inode(ROOT_INODE), Err(libc::EIO));
        Ok(())
    }

    #[test]
    fn test_block_out_of_range_is_eio() -> anyhow::Result<()> {
        let fs = ExtentFs::in_memory(tiny_config())?;
        let image = fs.image.read();
        assert!(image.block(7).is_ok());
        assert_eq!(image.block(8).err(), Some(libc::EIO));
        Ok(())
    }

    #[test]
    fn test_stats_display() -> anyhow::Result<()> {
        let fs = ExtentFs::in_memory(tiny_config())?;
        let text = fs.stats().to_string();
        assert!(text.contains("7 free of 8"));
        assert!(text.contains("max name length:  27"));
        Ok(())
    }
}
