//! Content key derivation.
//!
//! A content key is a routable string naming one immutable byte stream.
//! The DHT never parses keys; every node hashes them identically into
//! content identifiers. Three key families share one flat key space:
//! container references (`<registry>/<repo>:<tag>` or `<algo>:<hex>`),
//! wheel files (`pip:<filename>`), and model files (`hf:<path>`).

/// Well-known key used to advertise peer presence so that all peers can
/// be found easily.
pub const PEER_INDEX_KEY: &str = "__peer_index__";

/// The sentinel header that breaks peer-chain recursion. A request
/// carrying this header must never trigger peer resolution.
pub const MIRRORED_HEADER: &str = "X-Spegel-Mirrored";

/// Header set on background blob prefetch requests between peers.
pub const PREFETCH_HEADER: &str = "X-Clyde-Mirrored";

/// Derive the content key for a wheel or index file. The filename is
/// lower-cased so that requests and advertisements agree regardless of
/// the case the index produced.
pub fn pip_key(filename: &str) -> String {
    format!("pip:{}", filename.to_lowercase())
}

/// Derive the content key for a model file from the cleaned request path
/// (`/huggingface/<org>/<model>/resolve/<ref>/<path>`).
pub fn model_key(clean_path: &str) -> String {
    format!("hf:{clean_path}")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pip_key_lowercases() {
        assert_eq!(
            "pip:numpy-1.26.4-cp311-cp311-manylinux_x86_64.whl",
            pip_key("Numpy-1.26.4-cp311-cp311-manylinux_x86_64.whl"),
        );
    }

    #[test]
    fn model_key_prefixes_path() {
        assert_eq!(
            "hf:/huggingface/org/model/resolve/main/model.bin",
            model_key("/huggingface/org/model/resolve/main/model.bin"),
        );
    }
}
