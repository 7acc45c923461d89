use std::{ffi::OsStr, os::unix::prelude::OsStrExt, time::Duration};

use fuser::{FileAttr, Filesystem, TimeOrNow};
use log::{error, info};

use crate::utils::time_util::{self, TimeDurationStruct};

use super::{Errno, ExtentFs, Inode, InodeHandle, Owner, SetAttributes, Storage};

const TTL: Duration = Duration::new(0, 0);

/// describe `inode` the way the kernel expects it
fn file_attr(inode: &Inode, block_size: u32) -> FileAttr {
    FileAttr {
        ino: inode.inode_number as u64,
        size: inode.file_size,
        // in units of 512 bytes
        blocks: inode.block_count as u64 * block_size as u64 / 512,
        atime: inode.accessed_at.into(),
        mtime: inode.modified_at.into(),
        ctime: inode.metadata_changed_at.into(),
        crtime: inode.metadata_changed_at.into(),
        kind: inode.file_kind.into(),
        perm: (inode.mode & 0o7777) as u16,
        nlink: inode.hard_links,
        uid: inode.user_id,
        gid: inode.group_id,
        rdev: 0,
        blksize: block_size,
        flags: 0,
    }
}

fn time_or_now(time: TimeOrNow) -> Result<TimeDurationStruct, Errno> {
    match time {
        TimeOrNow::SpecificTime(time) => time.try_into().map_err(|_| libc::EINVAL),
        TimeOrNow::Now => Ok(time_util::now()),
    }
}

/// glue between the host calls and the engine
impl<S: Storage> ExtentFs<S> {
    fn handle(&self, ino: u64) -> Result<InodeHandle, Errno> {
        self.get_by_number(u32::try_from(ino).map_err(|_| libc::ENOENT)?)
    }

    fn attr_of(&self, handle: InodeHandle) -> Result<FileAttr, Errno> {
        Ok(file_attr(&self.inode(handle.ino())?, self.block_size()))
    }

    fn make_node(
        &self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
    ) -> Result<FileAttr, Errno> {
        let dir = self.handle(parent)?;
        let owner = Owner {
            uid: req.uid(),
            gid: req.gid(),
        };
        let handle = ExtentFs::create(self, dir, name.as_bytes(), mode, owner)?;
        self.attr_of(handle)
    }

    fn remove_node(&self, parent: u64, name: &OsStr, want_dir: bool) -> Result<(), Errno> {
        let dir = self.handle(parent)?;
        let ino = ExtentFs::lookup(self, dir, name.as_bytes())?.ok_or(libc::ENOENT)?;
        match (self.get_by_number(ino)?.kind().is_dir(), want_dir) {
            (true, false) => Err(libc::EISDIR),
            (false, true) => Err(libc::ENOTDIR),
            _ => ExtentFs::unlink(self, dir, name.as_bytes()),
        }
    }
}

impl<S: Storage> Filesystem for ExtentFs<S> {
    // to init the filesystem
    fn init(
        &mut self,
        _req: &fuser::Request<'_>,
        _config: &mut fuser::KernelConfig,
    ) -> Result<(), libc::c_int> {
        self.mark_mounted();
        Ok(())
    }

    // to umount the filesystem
    fn destroy(&mut self) {
        if let Err(e) = ExtentFs::flush(self) {
            error!("failed to flush the volume: {e:#}");
        }
    }

    // to show FS information
    fn statfs(&mut self, _req: &fuser::Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        let stats = self.stats();
        reply.statfs(
            stats.block_count as u64,
            stats.free_blocks as u64,
            stats.free_blocks as u64,
            stats.inode_count as u64,
            stats.free_inodes as u64,
            stats.block_size,
            stats.max_name_len,
            stats.block_size,
        )
    }

    fn getattr(&mut self, _req: &fuser::Request<'_>, ino: u64, reply: fuser::ReplyAttr) {
        info!("getattr() called with inode number: {ino}");
        match self.handle(ino).and_then(|handle| self.attr_of(handle)) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn lookup(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        info!("lookup() called with parent inode number: {parent} and name: {name:?}");
        let result = self.handle(parent).and_then(|dir| {
            let ino = match name.as_bytes() {
                b"." => dir.ino(),
                b".." => self.inode(dir.ino())?.parent,
                name => ExtentFs::lookup(self, dir, name)?.ok_or(libc::ENOENT)?,
            };
            self.attr_of(self.get_by_number(ino)?)
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    // to read a dir
    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: fuser::ReplyDirectory,
    ) {
        info!("readdir() called with inode number: {ino}, offset: {offset}");
        let Ok(cursor) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        let result = self.handle(ino).and_then(|dir| {
            self.iterate(dir, cursor, |entry| {
                // `add` reports a full buffer
                !reply.add(
                    entry.inode_no as u64,
                    entry.next_cursor as i64,
                    entry.kind.into(),
                    OsStr::from_bytes(&entry.name),
                )
            })
        });
        match result {
            Ok(_) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    // to create a new file
    fn create(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mut mode: u32,
        umask: u32,
        _flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        info!("create() called with parent inode number: {parent} and name: {name:?}");
        mode &= !umask;
        if req.uid() != 0 {
            mode &= !(libc::S_ISUID | libc::S_ISGID) as u32;
        }
        match self.make_node(req, parent, name, mode) {
            Ok(attr) => reply.created(&TTL, &attr, 0, 0, 0),
            Err(errno) => reply.error(errno),
        }
    }

    // to create a dir
    fn mkdir(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: fuser::ReplyEntry,
    ) {
        info!("mkdir() called with parent inode number: {parent} and name: {name:?}");
        let mode = libc::S_IFDIR as u32 | (mode & !umask & 0o7777);
        match self.make_node(req, parent, name, mode) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn unlink(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        info!("unlink() called with parent inode number: {parent} and name: {name:?}");
        match self.remove_node(parent, name, false) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn rmdir(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        info!("rmdir() called with parent inode number: {parent} and name: {name:?}");
        match self.remove_node(parent, name, true) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        info!("read() called with inode number: {ino}, fh: {fh}, offset: {offset}, size: {size}");
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        let mut buf = vec![0u8; size as usize];
        let result = self
            .handle(ino)
            .and_then(|file| ExtentFs::read(self, file, buf.as_mut_slice(), size as usize, offset));
        match result {
            Ok(read) => reply.data(&buf[..read]),
            Err(errno) => reply.error(errno),
        }
    }

    fn write(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        info!(
            "write() called with inode number: {ino}, fh: {fh}, offset: {offset}, {} bytes",
            data.len()
        );
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        let result = self
            .handle(ino)
            .and_then(|file| ExtentFs::write(self, file, data, data.len(), offset));
        match result {
            Ok(written) => reply.written(written as u32),
            Err(errno) => reply.error(errno),
        }
    }

    fn setattr(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<fuser::TimeOrNow>,
        mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<std::time::SystemTime>,
        fh: Option<u64>,
        _crtime: Option<std::time::SystemTime>,
        _chgtime: Option<std::time::SystemTime>,
        _bkuptime: Option<std::time::SystemTime>,
        _flags: Option<u32>,
        reply: fuser::ReplyAttr,
    ) {
        info!(
            "setattr() called with inode number: {ino}, mode: {mode:?}, uid: {uid:?}, gid: {gid:?}, size: {size:?}, atime: {atime:?}, mtime: {mtime:?}, fh: {fh:?}"
        );
        let result = self.handle(ino).and_then(|handle| {
            let inode = self.inode(handle.ino())?;
            // only root gives files away
            if uid.map_or(false, |uid| uid != inode.user_id) && req.uid() != 0 {
                return Err(libc::EPERM);
            }
            // if the user wants to "truncate"
            if let Some(size) = size {
                self.truncate(handle, size)?;
            }
            let attributes = SetAttributes {
                mode,
                uid,
                gid,
                accessed_at: atime.map(time_or_now).transpose()?,
                modified_at: mtime.map(time_or_now).transpose()?,
            };
            let inode = self.set_attributes(handle, attributes)?;
            Ok(file_attr(&inode, self.block_size()))
        });
        match result {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn symlink(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        link: &std::path::Path,
        reply: fuser::ReplyEntry,
    ) {
        info!("symlink() called with parent inode number: {parent} and name: {name:?} and link: {link:?}");
        let owner = Owner {
            uid: req.uid(),
            gid: req.gid(),
        };
        let result = self.handle(parent).and_then(|dir| {
            let handle = ExtentFs::symlink(
                self,
                dir,
                name.as_bytes(),
                link.as_os_str().as_bytes(),
                owner,
            )?;
            self.attr_of(handle)
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn readlink(&mut self, _req: &fuser::Request<'_>, ino: u64, reply: fuser::ReplyData) {
        info!("readlink() called with inode number: {ino}");
        match self
            .handle(ino)
            .and_then(|link| ExtentFs::readlink(self, link))
        {
            Ok(target) => reply.data(&target),
            Err(errno) => reply.error(errno),
        }
    }
}
