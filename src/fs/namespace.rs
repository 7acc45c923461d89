//! operations that tie inodes and directory entries together
use log::{debug, warn};

use crate::utils::time_util::TimeDurationStruct;

use super::{directory::validate_name, Errno, ExtentFs, Inode, InodeHandle, Owner, Storage};

/// attributes [ExtentFs::set_attributes] may change, `None` keeps the current value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetAttributes {
    /// permission bits, the file type bits are ignored
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub accessed_at: Option<TimeDurationStruct>,
    pub modified_at: Option<TimeDurationStruct>,
}

impl<S: Storage> ExtentFs<S> {
    /// create a new inode and bind it to `name` in `dir`
    ///
    /// If the name can't be added the new inode is released again.
    pub fn create(
        &self,
        dir: InodeHandle,
        name: &[u8],
        mode: u32,
        owner: Owner,
    ) -> Result<InodeHandle, Errno> {
        validate_name(name)?;
        let handle = self.new_inode(dir, mode, owner)?;
        if handle.kind().is_dir() {
            // ".." of the new directory
            if let Err(errno) = self.adjust_links(dir.ino(), 1) {
                self.roll_back(handle);
                return Err(errno);
            }
        }
        if let Err(errno) = self.add_entry(dir, handle.ino(), name) {
            if handle.kind().is_dir() {
                if let Err(undo_errno) = self.adjust_links(dir.ino(), -1) {
                    warn!("failed to restore the links of {}: errno {undo_errno}", dir.ino());
                }
            }
            self.roll_back(handle);
            return Err(errno);
        }
        debug!(
            "created {:?} as inode {} in {}",
            String::from_utf8_lossy(name),
            handle.ino(),
            dir.ino()
        );
        Ok(handle)
    }

    /// remove `name` from `dir`, the inode goes away with its last link
    /// # Error
    /// - `ENOENT` if there is no such entry
    /// - `ENOTEMPTY` for a directory that still has entries
    pub fn unlink(&self, dir: InodeHandle, name: &[u8]) -> Result<(), Errno> {
        // parent before child, a directory is never locked after one of its entries
        let _dir_guard = self.inode_lock(dir.ino())?;
        let ino = self.lookup(dir, name)?.ok_or(libc::ENOENT)?;
        if ino == dir.ino() {
            warn!("directory {ino} holds an entry for itself");
            return Err(libc::EIO);
        }
        let _guard = self.inode_lock(ino)?;
        let target = self.get_by_number(ino)?;
        let is_dir = target.kind().is_dir();
        if is_dir && !self.is_empty_dir(target)? {
            return Err(libc::ENOTEMPTY);
        }
        self.remove_locked_entry(dir, name)?;
        // a directory also loses the link of its own "."
        let links = self.adjust_links(ino, if is_dir { -2 } else { -1 })?;
        if is_dir {
            self.adjust_links(dir.ino(), -1)?;
        }
        if links == 0 {
            self.release_locked_inode(ino)?;
        }
        debug!(
            "unlinked {:?} (inode {ino}) from {}",
            String::from_utf8_lossy(name),
            dir.ino()
        );
        Ok(())
    }

    /// add `delta` to the link count of `ino`
    /// # Return
    /// the new link count
    fn adjust_links(&self, ino: u32, delta: i32) -> Result<u32, Errno> {
        self.modify_inode(ino, |inode| {
            inode.hard_links = inode.hard_links.saturating_add_signed(delta);
            inode.update_changed_at();
            Ok(inode.hard_links)
        })
    }

    /// release an inode whose creation failed half way
    fn roll_back(&self, handle: InodeHandle) {
        if let Err(errno) = self.release_inode(handle) {
            warn!("failed to roll back inode {}: errno {errno}", handle.ino());
        }
    }

    /// create a symbolic link `name` in `dir` pointing at `target`
    pub fn symlink(
        &self,
        dir: InodeHandle,
        name: &[u8],
        target: &[u8],
        owner: Owner,
    ) -> Result<InodeHandle, Errno> {
        let handle = self.create(dir, name, libc::S_IFLNK as u32 | 0o777, owner)?;
        let written = ExtentFs::write(self, handle, target, target.len(), 0)
            .and_then(|written| if written == target.len() { Ok(()) } else { Err(libc::EIO) });
        if let Err(errno) = written {
            if let Err(unlink_errno) = self.unlink(dir, name) {
                warn!("failed to roll back symlink {}: errno {unlink_errno}", handle.ino());
            }
            return Err(errno);
        }
        Ok(handle)
    }

    /// the target of symbolic link `link`
    /// # Error
    /// `EINVAL` if `link` is not a symbolic link
    pub fn readlink(&self, link: InodeHandle) -> Result<Vec<u8>, Errno> {
        let inode = self.inode(link.ino())?;
        if !inode.is_symlink() {
            return Err(libc::EINVAL);
        }
        let size = usize::try_from(inode.file_size).map_err(|_| libc::EIO)?;
        let mut target = vec![0u8; size];
        let read = ExtentFs::read(self, link, target.as_mut_slice(), size, 0)?;
        target.truncate(read);
        Ok(target)
    }

    /// change the metadata of `handle`
    /// # Return
    /// the updated record
    pub fn set_attributes(
        &self,
        handle: InodeHandle,
        attributes: SetAttributes,
    ) -> Result<Inode, Errno> {
        let _guard = self.inode_lock(handle.ino())?;
        self.modify_inode(handle.ino(), |inode| {
            if let Some(mode) = attributes.mode {
                inode.mode = inode.file_kind.mode_bits() | (mode & 0o7777);
            }
            if let Some(uid) = attributes.uid {
                inode.user_id = uid;
            }
            if let Some(gid) = attributes.gid {
                inode.group_id = gid;
            }
            if let Some(accessed_at) = attributes.accessed_at {
                inode.accessed_at = accessed_at;
            }
            if let Some(modified_at) = attributes.modified_at {
                inode.modified_at = modified_at;
            }
            inode.update_changed_at();
            Ok(inode.clone())
        })
    }
}
