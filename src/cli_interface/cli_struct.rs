use clap::Parser;

use crate::fs::{DEFAULT_BLOCKS_PER_CHUNK, DEFAULT_BLOCK_SIZE, DEFAULT_INODE_COUNT};

#[derive(Parser, Debug, PartialEq)]
#[command(author, version, about, long_about)]
pub enum ExtentFsCli {
    /// create a new file system
    Mkfs(MkfsArgs),
    /// register a filesystem to `FUSE` and mount it
    Mount(MountArgs),
    /// print the statistics of a file system image
    Inspect(InspectArgs),
}
///make a new fs subcommand
#[derive(clap::Args, Debug, PartialEq)]
#[command(author, version, about = "make a new file system")]
pub struct MkfsArgs {
    /// the path of the file system image file, it must not exist yet
    #[clap(short = 'p', long)]
    pub image_file_path: String,
    /// the size of the file system image in bytes
    #[clap(short, long)]
    pub size: u64,
    /// the inode count of the file system
    #[clap(short, long, default_value_t = DEFAULT_INODE_COUNT)]
    pub inode_count: u32,
    /// the block size of the file system
    #[clap(short, long, default_value_t = DEFAULT_BLOCK_SIZE)]
    pub block_size: u32,
    /// how many blocks one extent may span
    #[clap(short = 'c', long, default_value_t = DEFAULT_BLOCKS_PER_CHUNK)]
    pub blocks_per_chunk: u32,
}

/// mount a fs subcommand
#[derive(clap::Args, Debug, PartialEq)]
#[command(author, version, about = "mount a file system")]
pub struct MountArgs {
    /// the path of the file system image file
    #[clap(short = 'p', long)]
    pub image_file_path: String,
    /// the mount point of the file system
    #[clap(short, long)]
    pub mount_point: String,
}

/// inspect a fs subcommand
#[derive(clap::Args, Debug, PartialEq)]
#[command(author, version, about = "show file system statistics")]
pub struct InspectArgs {
    /// the path of the file system image file
    #[clap(short = 'p', long)]
    pub image_file_path: String,
}


/// test the `ExtentFsCli` struct
/// test `mount` and `inspect` subcommands
#[cfg(test)]
mod mount_parse_args_tests {
    use super::*;
    /// test short parameter form
    #[test]
    fn test_short_parameter_form() {
        let args = ExtentFsCli::parse_from(["extentfs", "mount", "-p", "test", "-m", "test"]);
        assert_eq!(
            args,
            ExtentFsCli::Mount(MountArgs {
                image_file_path: "test".to_string(),
                mount_point: "test".to_string(),
            })
        );
    }
    /// test long parameter form
    #[test]
    fn test_long_parameter_form() {
        let image_file_path_name = concat!("--", "image-file-path");
        let args = ExtentFsCli::parse_from([
            "extentfs",
            "mount",
            image_file_path_name,
            "test",
            "--mount-point",
            "test",
        ]);
        assert_eq!(
            args,
            ExtentFsCli::Mount(MountArgs {
                image_file_path: "test".to_string(),
                mount_point: "test".to_string(),
            })
        );
    }

    #[test]
    fn test_inspect() {
        let args = ExtentFsCli::parse_from(["extentfs", "inspect", "-p", "image"]);
        assert_eq!(
            args,
            ExtentFsCli::Inspect(InspectArgs {
                image_file_path: "image".to_string(),
            })
        );
    }
}
