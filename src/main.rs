use clap::Parser;
use extentfs::cli_interface::ExtentFsCli;
/// a CLI interface to users to choose create our filesystem,
/// register it to `FUSE` and mount it, or look into an image.
///
/// Mounting blocks the program until we umount our filesystem ourselves.
fn main() -> anyhow::Result<()> {
    env_logger::builder().format_timestamp_nanos().init();
    let args = ExtentFsCli::parse();
    match args {
        ExtentFsCli::Mkfs(args) => {
            //create a new file system
            let stats = extentfs::mkfs::mkfs(
                args.image_file_path,
                args.size,
                args.inode_count,
                args.block_size,
                args.blocks_per_chunk,
            )?;
            println!("{stats}");
        }
        ExtentFsCli::Mount(args) => {
            //register a filesystem to `FUSE` and mount it
            extentfs::mount::mount(args.image_file_path, args.mount_point)?;
        }
        ExtentFsCli::Inspect(args) => {
            println!("{}", extentfs::mount::inspect(args.image_file_path)?);
        }
    }
    Ok(())
}
