//! Consensus-critical primitive types and their serialization.

pub mod block;
pub mod encoding;
pub mod hash;
pub mod outpoint;
pub mod transaction;

use coind_consensus::Hash256;

/// Renders a hash in display order (reversed hex), the convention used by
/// every block explorer and the original daemon's logs.
pub fn hash256_to_hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
