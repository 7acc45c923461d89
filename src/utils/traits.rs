use anyhow::anyhow;
use serde::{de::DeserializeOwned, Serialize};

/// Trait for digesting an object which stores digest in the object itself
pub trait DigestInSelf {
    fn digest(&mut self) -> anyhow::Result<()>;
    fn verify_digest(&mut self) -> bool;
}

/// Trait for serializing and deserializing an object which stores digest in the object itself
/// # Note
/// All on-disk records use the bincode legacy configuration,
/// which encodes integers with a fixed width,
/// so a record type without variable length fields always has the same encoded size
pub trait SerializeAndDigest: Serialize + DeserializeOwned + DigestInSelf {
    /// refresh the digest and serialize into a [Vec](std::vec::Vec)
    fn serialize(&mut self) -> anyhow::Result<Vec<u8>> {
        self.digest()?;
        let config = bincode::config::legacy();
        bincode::serde::encode_to_vec(&*self, config).map_err(|e| e.into())
    }

    /// deserialize from the start of a slice, trailing bytes are ignored
    /// # Returns
    /// A tuple containing the deserialized object and the number of bytes read
    fn deserialize(buf: &[u8]) -> anyhow::Result<(Self, usize)> {
        let config = bincode::config::legacy();
        let (mut object, bytes_read): (Self, usize) =
            bincode::serde::decode_from_slice(buf, config)?;
        if !object.verify_digest() {
            Err(anyhow!("deserialized object digest verification failed"))
        } else {
            Ok((object, bytes_read))
        }
    }
}
