use bincode::config;
use serde::Serialize;

/// calculate the [blake3] hash of a serializable record,
/// over the same bytes the record is persisted as
pub fn digest<T: Serialize>(t: &T) -> anyhow::Result<[u8; 32]> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&bincode::serde::encode_to_vec(t, config::legacy())?);
    Ok(*hasher.finalize().as_bytes())
}
