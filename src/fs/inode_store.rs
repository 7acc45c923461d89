//! the inode table: fixed slots indexed by inode number
use log::{debug, warn};

use super::{Allocator, Errno, ExtentFs, FileKind, Inode, InodeHandle, Owner, Storage};

/// [Inode] operations
impl<S: Storage> ExtentFs<S> {
    /// allocate and persist a new inode inside `parent`
    /// # Params
    /// - `mode`: file type bits select the kind, the rest are permission bits
    /// # Error
    /// - `EINVAL` unless `mode` names a directory, a regular file or a symlink
    /// - `ENOTDIR` if `parent` is not a directory
    /// - `ENOSPC` if there is no free inode or no free block
    pub fn new_inode(
        &self,
        parent: InodeHandle,
        mode: u32,
        owner: Owner,
    ) -> Result<InodeHandle, Errno> {
        let kind = FileKind::from_mode(mode);
        if kind == FileKind::Unknown {
            return Err(libc::EINVAL);
        }
        if !self.inode(parent.ino())?.is_dir() {
            return Err(libc::ENOTDIR);
        }
        self.init_inode(parent.ino(), kind, mode, owner)
    }

    /// claim a slot and a first block, then write a fresh record
    pub(super) fn init_inode(
        &self,
        parent: u32,
        kind: FileKind,
        mode: u32,
        owner: Owner,
    ) -> Result<InodeHandle, Errno> {
        let (ino, block) = self.with_allocator(Allocator::allocate_inode_with_block)?;
        let mut inode = Inode::new(ino, parent, kind, mode, owner);
        let result = inode
            .append_blocks(block, 1, self.blocks_per_chunk())
            .and_then(|_| self.image.write().write_inode(&mut inode));
        if let Err(errno) = result {
            self.with_allocator(|allocator| {
                allocator.free_block(block);
                allocator.free_inode(ino);
            });
            return Err(errno);
        }
        debug!("new {kind:?} inode {ino} in {parent}, first block {block}");
        Ok(InodeHandle::from(&inode))
    }

    /// resolve an inode number into a handle
    /// # Error
    /// `ENOENT` if the number is out of range or not allocated
    pub fn get_by_number(&self, ino: u32) -> Result<InodeHandle, Errno> {
        if !self.allocator.lock().is_inode_allocated(ino) {
            return Err(libc::ENOENT);
        }
        Ok(InodeHandle::from(&self.image.read().read_inode(ino)?))
    }

    /// a copy of the record of inode `ino`
    pub fn inode(&self, ino: u32) -> Result<Inode, Errno> {
        if !self.allocator.lock().is_inode_allocated(ino) {
            return Err(libc::ENOENT);
        }
        self.image.read().read_inode(ino)
    }

    /// read, change and write back inode `ino` under the image lock,
    /// nothing is written if `f` fails
    pub(super) fn modify_inode<T>(
        &self,
        ino: u32,
        f: impl FnOnce(&mut Inode) -> Result<T, Errno>,
    ) -> Result<T, Errno> {
        let mut image = self.image.write();
        let mut inode = image.read_inode(ino)?;
        let result = f(&mut inode)?;
        image.write_inode(&mut inode)?;
        Ok(result)
    }

    /// give the slot and every block of `handle` back to the allocator
    pub fn release_inode(&self, handle: InodeHandle) -> Result<(), Errno> {
        let _guard = self.inode_lock(handle.ino())?;
        self.release_locked_inode(handle.ino())
    }

    /// [ExtentFs::release_inode] for a caller that already holds the inode lock of `ino`
    pub(super) fn release_locked_inode(&self, ino: u32) -> Result<(), Errno> {
        let inode = self.image.read().read_inode(ino);
        let mut allocator = self.allocator.lock();
        let mut image = self.image.write();
        match inode {
            Ok(inode) => {
                for extent in inode.extents() {
                    allocator.free_range(extent.start_block, extent.block_count);
                }
            }
            // the slot is reclaimed anyway, its blocks are lost until a repair
            Err(errno) => warn!("releasing unreadable inode {ino}: errno {errno}"),
        }
        image.clear_inode(ino)?;
        allocator.free_inode(ino);
        image.write_bitmaps(&allocator)?;
        debug!("released inode {ino}");
        Ok(())
    }
}
