//! Random identifier generation for conversations and messages.

use rand::rngs::OsRng;
use rand::RngCore;

/// Default identifier width: 10 random bytes, 20 hex characters.
pub const ID_BYTES: usize = 10;

/// Returns a lowercase hex string of `n_bytes * 2` characters drawn from
/// the OS random source. Collisions surface as repository conflicts and
/// the caller regenerates.
pub fn generate_hex(n_bytes: usize) -> String {
    let mut buf = vec![0u8; n_bytes];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}
