//! caller owned buffers
//!
//! A host hands us memory it owns and may revoke, so copies in and out
//! can fail with `EFAULT` midway through an operation.
use super::Errno;

/// a buffer the filesystem copies file contents from
pub trait UserBuf {
    /// fill `dst` with the bytes starting at `at`
    fn copy_in(&self, at: usize, dst: &mut [u8]) -> Result<(), Errno>;
}

/// a buffer the filesystem copies file contents into
pub trait UserBufMut {
    /// store `src` starting at `at`
    fn copy_out(&mut self, at: usize, src: &[u8]) -> Result<(), Errno>;
}

impl UserBuf for [u8] {
    fn copy_in(&self, at: usize, dst: &mut [u8]) -> Result<(), Errno> {
        let end = at.checked_add(dst.len()).ok_or(libc::EFAULT)?;
        dst.copy_from_slice(self.get(at..end).ok_or(libc::EFAULT)?);
        Ok(())
    }
}

impl UserBufMut for [u8] {
    fn copy_out(&mut self, at: usize, src: &[u8]) -> Result<(), Errno> {
        let end = at.checked_add(src.len()).ok_or(libc::EFAULT)?;
        self.get_mut(at..end)
            .ok_or(libc::EFAULT)?
            .copy_from_slice(src);
        Ok(())
    }
}

impl UserBuf for Vec<u8> {
    fn copy_in(&self, at: usize, dst: &mut [u8]) -> Result<(), Errno> {
        self.as_slice().copy_in(at, dst)
    }
}

impl UserBufMut for Vec<u8> {
    fn copy_out(&mut self, at: usize, src: &[u8]) -> Result<(), Errno> {
        self.as_mut_slice().copy_out(at, src)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_copy() {
        let src = b"hello world".to_vec();
        let mut dst = [0u8; 5];
        src.copy_in(6, &mut dst).unwrap();
        assert_eq!(&dst, b"world");
        assert_eq!(src.copy_in(7, &mut dst), Err(libc::EFAULT));

        let mut out = vec![0u8; 8];
        out.copy_out(3, b"abc").unwrap();
        assert_eq!(&out[..6], b"\0\0\0abc");
        assert_eq!(out.copy_out(6, b"abc"), Err(libc::EFAULT));
        assert_eq!(out.copy_out(usize::MAX, b"a"), Err(libc::EFAULT));
    }
}
