//! file contents through the extent list
//!
//! A file owns one physically contiguous run of blocks, cut into extents of
//! at most `blocks_per_chunk` blocks. Growth claims the blocks right after the
//! last extent, a file without blocks gets its whole run in one allocation.
use log::{debug, warn};

use crate::utils::fs_size_calculator::blocks_for;

use super::{
    fs_layout::Image, Errno, ExtentFs, Inode, InodeHandle, Storage, UserBuf, UserBufMut,
    MAX_EXTENTS,
};

/// zero the bytes `start..end` of `inode` that are backed by blocks
fn zero_fill<S: Storage>(
    image: &mut Image<S>,
    inode: &Inode,
    start: u64,
    end: u64,
    block_size: u32,
    blocks_per_chunk: u32,
) -> Result<(), Errno> {
    let bs = block_size as u64;
    let mut pos = start;
    while pos < end {
        let within = (pos % bs) as usize;
        let n = (bs - within as u64).min(end - pos) as usize;
        let Some(block) = inode.physical_block(pos / bs, blocks_per_chunk) else {
            break;
        };
        image.block_mut(block)?[within..within + n].fill(0);
        pos += n as u64;
    }
    Ok(())
}

/// This block is about reading and writing file contents
impl<S: Storage> ExtentFs<S> {
    fn chunk_size(&self) -> u64 {
        self.superblock.chunk_size()
    }

    /// read up to `len` bytes at `offset` into `buf`
    /// # Return
    /// the number of bytes read, 0 at or past the end of the file
    /// # Error
    /// - `EISDIR` for a directory
    /// - `EFAULT` if `buf` can't take the bytes
    pub fn read<B: UserBufMut + ?Sized>(
        &self,
        file: InodeHandle,
        buf: &mut B,
        len: usize,
        offset: u64,
    ) -> Result<usize, Errno> {
        if file.kind().is_dir() {
            return Err(libc::EISDIR);
        }
        if !self.allocator.lock().is_inode_allocated(file.ino()) {
            return Err(libc::ENOENT);
        }
        let mut done = 0;
        {
            // the record and the blocks it maps are read under one guard,
            // a concurrent truncate can't hand the blocks out in between
            let image = self.image.read();
            let inode = image.read_inode(file.ino())?;
            if inode.is_dir() {
                return Err(libc::EISDIR);
            }
            if inode.extent_count == 0 || offset >= inode.file_size {
                return Ok(0);
            }
            let len = (len as u64).min(inode.file_size - offset) as usize;
            let bs = self.block_size() as u64;
            while done < len {
                let pos = offset + done as u64;
                let within = (pos % bs) as usize;
                let Some(block) = inode.physical_block(pos / bs, self.blocks_per_chunk()) else {
                    warn!(
                        "inode {}: no block for offset {pos} below its size {}",
                        inode.inode_number, inode.file_size
                    );
                    break;
                };
                let n = (bs as usize - within).min(len - done);
                buf.copy_out(done, &image.block(block)?[within..within + n])?;
                done += n;
            }
        }
        // re-read under the write lock, a writer may have saved a newer record
        if let Err(errno) = self.modify_inode(file.ino(), |inode| {
            inode.update_accessed_at();
            Ok(())
        }) {
            warn!("failed to update atime of inode {}: errno {errno}", file.ino());
        }
        Ok(done)
    }

    /// write `len` bytes from `buf` at `offset`, growing the file as needed
    /// # Return
    /// the number of bytes written
    /// # Error
    /// - `EISDIR` for a directory
    /// - `EFBIG` if the file would need more than [MAX_EXTENTS] extents
    /// - `ENOSPC` if the blocks right after the file are taken
    /// - `EFAULT` if `buf` faults, the size is left as it was,
    ///   the bytes copied so far stay and count as a modification
    pub fn write<B: UserBuf + ?Sized>(
        &self,
        file: InodeHandle,
        buf: &B,
        len: usize,
        offset: u64,
    ) -> Result<usize, Errno> {
        if file.kind().is_dir() {
            return Err(libc::EISDIR);
        }
        if len == 0 {
            return Ok(0);
        }
        let end = offset.checked_add(len as u64).ok_or(libc::EFBIG)?;
        let _guard = self.inode_lock(file.ino())?;
        let mut inode = self.inode(file.ino())?;
        if inode.is_dir() {
            return Err(libc::EISDIR);
        }
        self.ensure_capacity(&mut inode, end)?;

        let bs = self.block_size() as u64;
        let bpc = self.blocks_per_chunk();
        let mut done = 0;
        let mut fault = None;
        let mut image = self.image.write();
        if offset > inode.file_size {
            zero_fill(&mut image, &inode, inode.file_size, offset, self.block_size(), bpc)?;
        }
        while done < len {
            let pos = offset + done as u64;
            let within = (pos % bs) as usize;
            let Some(block) = inode.physical_block(pos / bs, bpc) else {
                warn!(
                    "inode {}: no block for offset {pos} after growing to {end}",
                    inode.inode_number
                );
                break;
            };
            let n = (bs as usize - within).min(len - done);
            let dst = &mut image.block_mut(block)?[within..within + n];
            if let Err(errno) = buf.copy_in(done, dst) {
                fault = Some(errno);
                break;
            }
            done += n;
        }
        let written_end = offset + done as u64;
        inode.cover(offset, written_end, self.chunk_size());
        if fault.is_none() {
            inode.file_size = inode.file_size.max(written_end);
        }
        image.commit_extents(&inode, done > 0)?;
        drop(image);

        if let Some(errno) = fault {
            warn!(
                "inode {}: source faulted after {done} of {len} bytes",
                inode.inode_number
            );
            return Err(errno);
        }
        debug!("inode {}: wrote {done} bytes at {offset}", inode.inode_number);
        Ok(done)
    }

    /// set the size of `file`, releasing or claiming blocks
    pub fn truncate(&self, file: InodeHandle, size: u64) -> Result<(), Errno> {
        if file.kind().is_dir() {
            return Err(libc::EISDIR);
        }
        let _guard = self.inode_lock(file.ino())?;
        let mut inode = self.inode(file.ino())?;
        if inode.is_dir() {
            return Err(libc::EISDIR);
        }
        let old_size = inode.file_size;
        if size > old_size {
            self.ensure_capacity(&mut inode, size)?;
            inode.file_size = size;
            let mut image = self.image.write();
            zero_fill(
                &mut image,
                &inode,
                old_size,
                size,
                self.block_size(),
                self.blocks_per_chunk(),
            )?;
            return image.commit_extents(&inode, true);
        }

        let keep = blocks_for(size, self.block_size()) as u32;
        let released = inode.trim_to_blocks(keep, self.blocks_per_chunk());
        inode.file_size = size;
        inode.clamp_coverage(size, self.chunk_size());
        // the record must stop pointing at the blocks before they are handed out again
        self.image.write().commit_extents(&inode, true)?;
        self.with_allocator(|allocator| {
            for range in released {
                allocator.free_range(range.start, range.end - range.start);
            }
        });
        debug!("inode {}: truncated to {size}, keeping {keep} blocks", inode.inode_number);
        Ok(())
    }

    /// make sure `inode` has blocks for its first `end` bytes and persist it
    ///
    /// On error neither `inode` nor the allocator is changed.
    fn ensure_capacity(&self, inode: &mut Inode, end: u64) -> Result<(), Errno> {
        let bpc = self.blocks_per_chunk();
        let required = blocks_for(end, self.block_size());
        if required > MAX_EXTENTS as u64 * bpc as u64 {
            return Err(libc::EFBIG);
        }
        let required = required as u32;
        if required <= inode.block_count {
            return Ok(());
        }
        let additional = required - inode.block_count;
        let tail = inode.tail_block();
        let start = self.with_allocator(|allocator| match tail {
            None => allocator.allocate_contiguous(additional),
            Some(tail) => allocator.allocate_range(tail, additional).map(|_| tail),
        })?;
        let backup = inode.clone();
        let result = inode
            .append_blocks(start, additional, bpc)
            .and_then(|_| self.image.write().commit_extents(inode, false));
        if let Err(errno) = result {
            *inode = backup;
            self.with_allocator(|allocator| allocator.free_range(start, additional));
            return Err(errno);
        }
        debug!(
            "inode {}: grew by {additional} blocks at {start}",
            inode.inode_number
        );
        Ok(())
    }
}
