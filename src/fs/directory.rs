//! single block directories
//!
//! The first data block of a directory is a dense array of
//! [DIR_ENTRY_SIZE] byte entries, the directory size is the entry count times the entry size.
use bincode::config;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::{
    Errno, ExtentFs, FileKind, Inode, InodeHandle, Storage, DIR_ENTRY_SIZE, MAX_FILENAME_LEN,
};

/// one persisted entry: a NUL padded name and an inode number
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
struct DirEntryRecord {
    name: [u8; MAX_FILENAME_LEN],
    inode_no: u32,
}

impl DirEntryRecord {
    /// `name` must already be valid, see [validate_name]
    fn new(name: &[u8], inode_no: u32) -> Self {
        let mut record = DirEntryRecord {
            inode_no,
            ..DirEntryRecord::default()
        };
        record.name[..name.len()].copy_from_slice(name);
        record
    }

    fn name(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_FILENAME_LEN);
        &self.name[..len]
    }

    fn encode(&self) -> Result<Vec<u8>, Errno> {
        bincode::serde::encode_to_vec(self, config::legacy()).map_err(|_| libc::EIO)
    }

    fn decode(bytes: &[u8]) -> Result<Self, Errno> {
        bincode::serde::decode_from_slice(bytes, config::legacy())
            .map(|(record, _)| record)
            .map_err(|_| libc::EIO)
    }
}

/// an entry as reported by iteration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: Vec<u8>,
    pub inode_no: u32,
    pub kind: FileKind,
    /// where to resume to get the entry after this one
    pub next_cursor: u64,
}

/// check a name before it goes into a directory
/// # Error
/// - `ENAMETOOLONG` if it does not leave room for the terminating NUL
/// - `EINVAL` if it is empty or contains `/` or NUL
/// - `EEXIST` for "." and "..", which every directory already has
pub(super) fn validate_name(name: &[u8]) -> Result<(), Errno> {
    if name.len() >= MAX_FILENAME_LEN {
        warn!("name of {} bytes is too long", name.len());
        return Err(libc::ENAMETOOLONG);
    }
    if name.is_empty() || name.iter().any(|&b| b == b'/' || b == 0) {
        return Err(libc::EINVAL);
    }
    if name == b"." || name == b".." {
        return Err(libc::EEXIST);
    }
    Ok(())
}

const ENTRY_LEN: usize = DIR_ENTRY_SIZE as usize;

/// the data block of a directory and how many entries it holds
fn dir_block(dir: &Inode, block_size: u32) -> Result<(u32, u64), Errno> {
    if !dir.is_dir() {
        return Err(libc::ENOTDIR);
    }
    let capacity = (block_size / DIR_ENTRY_SIZE) as u64;
    let mut count = dir.file_size / DIR_ENTRY_SIZE as u64;
    if count > capacity {
        warn!(
            "directory {} claims {count} entries, only {capacity} fit",
            dir.inode_number
        );
        count = capacity;
    }
    let block = dir.first_block().ok_or_else(|| {
        warn!("directory {} has no data block", dir.inode_number);
        libc::EIO
    })?;
    Ok((block, count))
}

/// walks ".", ".." and then the stored entries of one directory
pub struct DirIter<'a, S: Storage> {
    fs: &'a ExtentFs<S>,
    ino: u32,
    parent: u32,
    block: u32,
    count: u64,
    cursor: u64,
}

impl<'a, S: Storage> Iterator for DirIter<'a, S> {
    type Item = DirEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let (name, inode_no) = match self.cursor {
            0 => (b".".to_vec(), self.ino),
            1 => (b"..".to_vec(), self.parent),
            k if k - 2 < self.count => match self.fs.read_entry(self.block, k - 2) {
                Ok(record) => (record.name().to_vec(), record.inode_no),
                Err(errno) => {
                    warn!(
                        "entry {} of directory {} is unreadable: errno {errno}",
                        k - 2,
                        self.ino
                    );
                    return None;
                }
            },
            _ => return None,
        };
        self.cursor += 1;
        Some(DirEntry {
            kind: self.fs.kind_of(inode_no),
            name,
            inode_no,
            next_cursor: self.cursor,
        })
    }
}

impl<S: Storage> ExtentFs<S> {
    fn read_entry(&self, block: u32, index: u64) -> Result<DirEntryRecord, Errno> {
        let image = self.image.read();
        let start = usize::try_from(index).map_err(|_| libc::EIO)? * ENTRY_LEN;
        let bytes = image
            .block(block)?
            .get(start..start + ENTRY_LEN)
            .ok_or(libc::EIO)?;
        DirEntryRecord::decode(bytes)
    }

    /// the kind of inode `ino`, [FileKind::Unknown] if it can't be read
    fn kind_of(&self, ino: u32) -> FileKind {
        self.image
            .read()
            .read_inode(ino)
            .map(|inode| inode.file_kind)
            .unwrap_or_default()
    }

    /// position and record of `name` in `dir`
    fn find_entry(&self, dir: &Inode, name: &[u8]) -> Result<Option<(u64, DirEntryRecord)>, Errno> {
        let (block, count) = dir_block(dir, self.block_size())?;
        for index in 0..count {
            let record = self.read_entry(block, index)?;
            if record.name() == name {
                return Ok(Some((index, record)));
            }
        }
        Ok(None)
    }

    /// find the inode number `name` is bound to in `dir`
    /// # Return
    /// `None` if there is no such entry
    pub fn lookup(&self, dir: InodeHandle, name: &[u8]) -> Result<Option<u32>, Errno> {
        let dir = self.inode(dir.ino())?;
        let found = self.find_entry(&dir, name)?.map(|(_, record)| record.inode_no);
        debug!(
            "lookup {:?} in {}: {found:?}",
            String::from_utf8_lossy(name),
            dir.inode_number
        );
        Ok(found)
    }

    /// iterate `dir` starting at `cursor`, 0 starts from the beginning
    pub fn entries(&self, dir: InodeHandle, cursor: u64) -> Result<DirIter<'_, S>, Errno> {
        let inode = self.inode(dir.ino())?;
        let (block, count) = dir_block(&inode, self.block_size())?;
        Ok(DirIter {
            fs: self,
            ino: inode.inode_number,
            parent: inode.parent,
            block,
            count,
            cursor,
        })
    }

    /// hand the entries of `dir` from `cursor` on to `emit` until it refuses one
    /// # Return
    /// the cursor to resume from, it points at the refused entry if there was one
    pub fn iterate(
        &self,
        dir: InodeHandle,
        cursor: u64,
        mut emit: impl FnMut(&DirEntry) -> bool,
    ) -> Result<u64, Errno> {
        let mut position = cursor;
        for entry in self.entries(dir, cursor)? {
            if !emit(&entry) {
                break;
            }
            position = entry.next_cursor;
        }
        Ok(position)
    }

    /// bind `name` to inode `ino` in `dir`
    /// # Error
    /// - name errors, see [validate_name]
    /// - `ENOSPC` if the directory block is full
    /// - `EEXIST` if the name is taken
    pub fn add_entry(&self, dir: InodeHandle, ino: u32, name: &[u8]) -> Result<(), Errno> {
        validate_name(name)?;
        let _guard = self.inode_lock(dir.ino())?;
        let inode = self.inode(dir.ino())?;
        let (block, count) = dir_block(&inode, self.block_size())?;
        if count >= (self.block_size() / DIR_ENTRY_SIZE) as u64 {
            return Err(libc::ENOSPC);
        }
        if self.find_entry(&inode, name)?.is_some() {
            return Err(libc::EEXIST);
        }
        let record = DirEntryRecord::new(name, ino).encode()?;
        let start = count as usize * ENTRY_LEN;
        let mut image = self.image.write();
        let mut dir_inode = image.read_inode(dir.ino())?;
        image
            .block_mut(block)?
            .get_mut(start..start + ENTRY_LEN)
            .ok_or(libc::EIO)?
            .copy_from_slice(&record);
        dir_inode.file_size = (count + 1) * DIR_ENTRY_SIZE as u64;
        dir_inode.update_modified_at();
        image.write_inode(&mut dir_inode)?;
        debug!(
            "added {:?} -> {ino} to directory {}",
            String::from_utf8_lossy(name),
            dir.ino()
        );
        Ok(())
    }

    /// unbind `name` in `dir`, later entries move down one slot
    /// # Return
    /// the inode number the name was bound to
    pub fn remove_entry(&self, dir: InodeHandle, name: &[u8]) -> Result<u32, Errno> {
        let _guard = self.inode_lock(dir.ino())?;
        self.remove_locked_entry(dir, name)
    }

    /// [ExtentFs::remove_entry] for a caller that already holds the inode lock of `dir`
    pub(super) fn remove_locked_entry(&self, dir: InodeHandle, name: &[u8]) -> Result<u32, Errno> {
        let inode = self.inode(dir.ino())?;
        let (block, count) = dir_block(&inode, self.block_size())?;
        let (index, record) = self.find_entry(&inode, name)?.ok_or(libc::ENOENT)?;
        let mut image = self.image.write();
        let mut dir_inode = image.read_inode(dir.ino())?;
        let entries = image
            .block_mut(block)?
            .get_mut(..count as usize * ENTRY_LEN)
            .ok_or(libc::EIO)?;
        entries.copy_within((index as usize + 1) * ENTRY_LEN.., index as usize * ENTRY_LEN);
        entries[(count as usize - 1) * ENTRY_LEN..].fill(0);
        dir_inode.file_size = (count - 1) * DIR_ENTRY_SIZE as u64;
        dir_inode.update_modified_at();
        image.write_inode(&mut dir_inode)?;
        debug!(
            "removed {:?} -> {} from directory {}",
            String::from_utf8_lossy(name),
            record.inode_no,
            dir.ino()
        );
        Ok(record.inode_no)
    }

    /// whether `dir` holds nothing but "." and ".."
    pub fn is_empty_dir(&self, dir: InodeHandle) -> Result<bool, Errno> {
        let inode = self.inode(dir.ino())?;
        let (_, count) = dir_block(&inode, self.block_size())?;
        Ok(count == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{fs_layout::tests::tiny_config, FsConfig, ROOT_INODE};

    fn names<S: Storage>(fs: &ExtentFs<S>, dir: InodeHandle) -> Vec<String> {
        fs.entries(dir, 0)
            .unwrap()
            .map(|entry| String::from_utf8(entry.name).unwrap())
            .collect()
    }

    #[test]
    fn test_record_is_entry_sized() {
        let record = DirEntryRecord::new(b"a.txt", 7);
        let bytes = record.encode().unwrap();
        assert_eq!(bytes.len(), ENTRY_LEN);
        assert_eq!(&bytes[..6], b"a.txt\0");
        assert_eq!(&bytes[28..], &7u32.to_le_bytes());
        assert_eq!(DirEntryRecord::decode(&bytes).unwrap().name(), b"a.txt");
    }

    #[test]
    fn test_validate_name() {
        assert_eq!(validate_name(&[b'a'; MAX_FILENAME_LEN - 1]), Ok(()));
        assert_eq!(
            validate_name(&[b'a'; MAX_FILENAME_LEN]),
            Err(libc::ENAMETOOLONG)
        );
        assert_eq!(validate_name(b""), Err(libc::EINVAL));
        assert_eq!(validate_name(b"a/b"), Err(libc::EINVAL));
        assert_eq!(validate_name(b"a\0b"), Err(libc::EINVAL));
        assert_eq!(validate_name(b".."), Err(libc::EEXIST));
    }

    #[test]
    fn test_empty_directory_lists_dots() -> anyhow::Result<()> {
        let fs = ExtentFs::in_memory(tiny_config())?;
        let entries: Vec<DirEntry> = fs.entries(fs.root(), 0).unwrap().collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, b".");
        assert_eq!(entries[1].name, b"..");
        assert!(entries.iter().all(|e| e.inode_no == ROOT_INODE));
        assert!(entries.iter().all(|e| e.kind == FileKind::Directory));
        assert!(fs.is_empty_dir(fs.root()).unwrap());
        Ok(())
    }

    #[test]
    fn test_add_and_lookup() -> anyhow::Result<()> {
        let fs = ExtentFs::in_memory(tiny_config())?;
        let root = fs.root();
        fs.add_entry(root, 2, b"a.txt").unwrap();
        fs.add_entry(root, 3, b"b.txt").unwrap();
        assert_eq!(fs.lookup(root, b"a.txt"), Ok(Some(2)));
        assert_eq!(fs.lookup(root, b"b.txt"), Ok(Some(3)));
        // exact length and case
        assert_eq!(fs.lookup(root, b"a.tx"), Ok(None));
        assert_eq!(fs.lookup(root, b"A.txt"), Ok(None));
        assert_eq!(fs.inode(ROOT_INODE).unwrap().file_size, 64);
        assert_eq!(names(&fs, root), vec![".", "..", "a.txt", "b.txt"]);
        Ok(())
    }

    #[test]
    fn test_duplicate_name() -> anyhow::Result<()> {
        let fs = ExtentFs::in_memory(tiny_config())?;
        let root = fs.root();
        fs.add_entry(root, 2, b"a.txt").unwrap();
        assert_eq!(fs.add_entry(root, 3, b"a.txt"), Err(libc::EEXIST));
        assert_eq!(fs.inode(ROOT_INODE).unwrap().file_size, 32);
        assert_eq!(fs.add_entry(root, 3, b"."), Err(libc::EEXIST));
        Ok(())
    }

    #[test]
    fn test_full_directory() -> anyhow::Result<()> {
        let fs = ExtentFs::in_memory(tiny_config())?;
        let root = fs.root();
        // a 256 byte block holds 8 entries
        for i in 0..8 {
            fs.add_entry(root, 2, format!("f{i}").as_bytes()).unwrap();
        }
        assert_eq!(fs.add_entry(root, 2, b"f8"), Err(libc::ENOSPC));
        // full is reported before the duplicate
        assert_eq!(fs.add_entry(root, 2, b"f0"), Err(libc::ENOSPC));
        assert_eq!(fs.inode(ROOT_INODE).unwrap().file_size, 256);
        Ok(())
    }

    #[test]
    fn test_iterate_resumes_at_refused_entry() -> anyhow::Result<()> {
        let fs = ExtentFs::in_memory(tiny_config())?;
        let root = fs.root();
        for name in ["x", "y", "z"] {
            fs.add_entry(root, 2, name.as_bytes()).unwrap();
        }
        let mut seen = Vec::new();
        let cursor = fs
            .iterate(root, 0, |entry| {
                if seen.len() == 3 {
                    return false;
                }
                seen.push(entry.name.clone());
                true
            })
            .unwrap();
        assert_eq!(cursor, 3);
        assert_eq!(seen, vec![b".".to_vec(), b"..".to_vec(), b"x".to_vec()]);

        let mut rest = Vec::new();
        let end = fs
            .iterate(root, cursor, |entry| {
                rest.push(entry.name.clone());
                true
            })
            .unwrap();
        assert_eq!(rest, vec![b"y".to_vec(), b"z".to_vec()]);
        assert_eq!(end, 5);
        // past the end nothing is emitted
        assert_eq!(fs.iterate(root, end, |_| true), Ok(end));
        Ok(())
    }

    #[test]
    fn test_remove_entry_closes_the_gap() -> anyhow::Result<()> {
        let fs = ExtentFs::in_memory(tiny_config())?;
        let root = fs.root();
        fs.add_entry(root, 2, b"a").unwrap();
        fs.add_entry(root, 3, b"b").unwrap();
        fs.add_entry(root, 2, b"c").unwrap();
        assert_eq!(fs.remove_entry(root, b"b"), Ok(3));
        assert_eq!(fs.remove_entry(root, b"b"), Err(libc::ENOENT));
        assert_eq!(names(&fs, root), vec![".", "..", "a", "c"]);
        assert_eq!(fs.inode(ROOT_INODE).unwrap().file_size, 64);
        Ok(())
    }

    #[test]
    fn test_lookup_in_a_file() -> anyhow::Result<()> {
        let fs = ExtentFs::in_memory(FsConfig {
            inode_count: 8,
            ..tiny_config()
        })?;
        let file = fs
            .new_inode(fs.root(), libc::S_IFREG as u32 | 0o644, Default::default())
            .unwrap();
        assert_eq!(fs.lookup(file, b"a"), Err(libc::ENOTDIR));
        assert_eq!(fs.add_entry(file, 2, b"a").err(), Some(libc::ENOTDIR));
        Ok(())
    }

    #[test]
    fn test_concurrent_add_entry_binds_a_name_once() -> anyhow::Result<()> {
        let fs = ExtentFs::in_memory(FsConfig {
            inode_count: 8,
            ..tiny_config()
        })?;
        let root = fs.root();
        let results: Vec<Result<(), Errno>> = std::thread::scope(|s| {
            let workers: Vec<_> = (2..6)
                .map(|ino| {
                    let fs = &fs;
                    s.spawn(move || fs.add_entry(root, ino, b"same"))
                })
                .collect();
            workers
                .into_iter()
                .map(|worker| worker.join().unwrap())
                .collect()
        });
        assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
        assert!(results
            .iter()
            .all(|result| matches!(result, Ok(()) | Err(libc::EEXIST))));
        let bound = fs
            .entries(root, 0)
            .unwrap()
            .filter(|entry| entry.name == b"same")
            .count();
        assert_eq!(bound, 1);
        assert_eq!(fs.inode(ROOT_INODE).unwrap().file_size, DIR_ENTRY_SIZE as u64);
        Ok(())
    }
}
