//! register our filesystem to `FUSE` and mount it
use std::{fs::OpenOptions, path::Path};

use anyhow::Context;
use fuser::MountOption;
use memmap2::MmapMut;

use crate::fs::{ExtentFs, FsStats};

/// mount the image at `image_path` on `mountpoint`,
/// blocks until the filesystem is unmounted
pub fn mount<P>(image_path: P, mountpoint: P) -> anyhow::Result<()>
where
    P: AsRef<Path>,
{
    // open the "device" for read and write
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(image_path.as_ref())
        .with_context(|| format!("can't open {}", image_path.as_ref().display()))?;

    // Safety
    // This method returns an error when the underlying system call fails,
    // which can happen for a variety of reasons,
    // such as when the file is not open with read and write permissions.
    // from https://docs.rs/memmap2/0.5.10/memmap2/struct.MmapMut.html
    let file_mmap_area = unsafe { MmapMut::map_mut(&file)? };
    let fs = ExtentFs::open(file_mmap_area)?;

    let opts = vec![
        MountOption::FSName("extentfs".to_string()),
        MountOption::DefaultPermissions,
    ];

    Ok(fuser::mount2(fs, mountpoint, &opts)?)
}

/// statistics of the image at `image_path`, the image is not modified
pub fn inspect<P>(image_path: P) -> anyhow::Result<FsStats>
where
    P: AsRef<Path>,
{
    let image = std::fs::read(image_path.as_ref())
        .with_context(|| format!("can't read {}", image_path.as_ref().display()))?;
    Ok(ExtentFs::open(image)?.stats())
}
