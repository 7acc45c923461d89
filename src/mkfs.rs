//! create our filesystem
use std::{fs::OpenOptions, path::Path};

use anyhow::Context;
use byte_unit::Byte;
use log::info;
use memmap2::MmapMut;

use crate::fs::{ExtentFs, FsConfig, FsStats, Owner};

/// create a new filesystem, given the path of the image file, image file size and geometry
/// # Params
/// - `image_file_path`: the path of the image file, it must not exist yet
/// - `file_size`: the largest size the image file may have
/// - `inode_count`: the number of inodes
/// - `block_size`: the block size of the filesystem
/// - `blocks_per_chunk`: how many blocks one extent may span
///
/// # Return
/// the statistics of the new filesystem
pub fn mkfs<P>(
    image_file_path: P,
    file_size: u64,
    inode_count: u32,
    block_size: u32,
    blocks_per_chunk: u32,
) -> anyhow::Result<FsStats>
where
    P: AsRef<Path>,
{
    // fit as many data blocks as possible into `file_size`
    let mut config = FsConfig::for_image_size(file_size, block_size, inode_count, blocks_per_chunk)?;
    // use `users` crate to get the uid and gid of this program
    config.owner = Owner {
        uid: users::get_effective_uid(),
        gid: users::get_effective_gid(),
    };

    // open image file and prepare to write fs components
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(image_file_path.as_ref())
        .with_context(|| format!("can't create {}", image_file_path.as_ref().display()))?;
    // all regions start zeroed using `set_len` method
    file.set_len(config.image_size())?;

    // Safety
    // the file was just created by us and stays open for the whole mapping,
    // see https://docs.rs/memmap2/0.5.10/memmap2/struct.MmapMut.html
    let file_mmap_area = unsafe { MmapMut::map_mut(&file)? };
    let fs = ExtentFs::format(file_mmap_area, config)?;
    info!(
        "created {} with an image of {}",
        image_file_path.as_ref().display(),
        Byte::from_bytes(config.image_size() as _).get_appropriate_unit(true)
    );
    Ok(fs.stats())
}
