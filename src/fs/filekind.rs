use serde::{Deserialize, Serialize};

/// an enum to describe the type of a file
#[derive(Serialize, Deserialize, Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FileKind {
    /// an regular file
    RegularFile,
    /// a directory
    Directory,
    /// a symbolic link
    SymbolicLink,
    /// Unknown
    #[default]
    Unknown,
}

impl FileKind {
    /// derive the kind from the file type bits of `mode`,
    /// anything but a directory, a regular file or a symlink is [FileKind::Unknown]
    pub fn from_mode(mode: u32) -> Self {
        match mode & libc::S_IFMT as u32 {
            m if m == libc::S_IFREG as u32 => FileKind::RegularFile,
            m if m == libc::S_IFDIR as u32 => FileKind::Directory,
            m if m == libc::S_IFLNK as u32 => FileKind::SymbolicLink,
            _ => FileKind::Unknown,
        }
    }

    /// the file type bits of this kind
    pub fn mode_bits(self) -> u32 {
        match self {
            FileKind::RegularFile => libc::S_IFREG as u32,
            FileKind::Directory => libc::S_IFDIR as u32,
            FileKind::SymbolicLink => libc::S_IFLNK as u32,
            FileKind::Unknown => 0,
        }
    }

    pub fn is_dir(self) -> bool {
        self == FileKind::Directory
    }
}

/// implement a trait to convert [FileKind] to [fuser::FileType]
impl From<FileKind> for fuser::FileType {
    fn from(kind: FileKind) -> Self {
        match kind {
            FileKind::RegularFile => fuser::FileType::RegularFile,
            FileKind::Directory => fuser::FileType::Directory,
            FileKind::SymbolicLink => fuser::FileType::Symlink,
            // Unknown Types are treated as regular files
            FileKind::Unknown => fuser::FileType::RegularFile,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_mode() {
        assert_eq!(
            FileKind::from_mode(libc::S_IFREG as u32 | 0o644),
            FileKind::RegularFile
        );
        assert_eq!(
            FileKind::from_mode(libc::S_IFDIR as u32 | 0o755),
            FileKind::Directory
        );
        assert_eq!(
            FileKind::from_mode(libc::S_IFLNK as u32 | 0o777),
            FileKind::SymbolicLink
        );
        // the type bits of a symlink overlap with both of the above
        assert_ne!(FileKind::from_mode(libc::S_IFLNK as u32), FileKind::RegularFile);
        assert_eq!(FileKind::from_mode(libc::S_IFIFO as u32), FileKind::Unknown);
        assert_eq!(FileKind::from_mode(0o644), FileKind::Unknown);
    }

    #[test]
    fn test_mode_bits_round_trip() {
        for kind in [
            FileKind::RegularFile,
            FileKind::Directory,
            FileKind::SymbolicLink,
        ] {
            assert_eq!(FileKind::from_mode(kind.mode_bits() | 0o600), kind);
        }
    }
}
