//! our extent-based filesystem
pub mod allocator;
pub mod bitmap;
pub mod directory;
pub mod extent_io;
pub mod filekind;
pub mod fs_layout;
pub mod inode;
pub mod superblock;
pub mod user_buf;
mod fs_api_impl;
mod inode_store;
mod namespace;
pub use allocator::*;
pub use bitmap::*;
pub use directory::*;
pub use filekind::*;
pub use fs_layout::*;
pub use inode::*;
pub use namespace::SetAttributes;
pub use superblock::*;
pub use user_buf::*;

/// errno values as returned to the host, see [libc]
pub type Errno = libc::c_int;

const FS_MAGIC: u32 = 0x0e7f_5001;
/// never handed out, keeps inode number 0 meaning "no inode"
pub const RESERVED_INODE: u32 = 0;
pub const ROOT_INODE: u32 = 1;
/// size of one slot in the inode table
pub const INODE_SIZE: u32 = 256;
pub const MAX_EXTENTS: usize = 8;
/// size of the filename field of a directory entry, names must be shorter
pub const MAX_FILENAME_LEN: usize = 28;
/// `MAX_FILENAME_LEN` bytes of name + a `u32` inode number
pub const DIR_ENTRY_SIZE: u32 = 32;
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;
pub const MIN_BLOCK_SIZE: u32 = 256;
pub const DEFAULT_BLOCKS_PER_CHUNK: u32 = 8;
pub const DEFAULT_INODE_COUNT: u32 = 1024;
