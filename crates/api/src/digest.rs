//! Content digest type shared by the container handler, the state
//! tracker, and the content store.

use crate::{ClydeError, ClydeResult};

/// An `<algorithm>:<hex>` content digest, as used in OCI manifests and
/// container content keys.
#[derive(Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algorithm: String,
    encoded: String,
}

impl Digest {
    /// Parse and validate a digest string.
    pub fn parse(s: &str) -> ClydeResult<Self> {
        let (algorithm, encoded) = s
            .split_once(':')
            .ok_or_else(|| ClydeError::other(format!("invalid digest {s}")))?;
        if algorithm.is_empty()
            || !algorithm
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        {
            return Err(ClydeError::other(format!(
                "invalid digest algorithm in {s}"
            )));
        }
        if encoded.is_empty()
            || !encoded.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(ClydeError::other(format!(
                "invalid digest encoding in {s}"
            )));
        }
        if algorithm == "sha256" && encoded.len() != 64 {
            return Err(ClydeError::other(format!(
                "sha256 digest must be 64 hex chars, got {}",
                encoded.len()
            )));
        }
        Ok(Self {
            algorithm: algorithm.to_string(),
            encoded: encoded.to_lowercase(),
        })
    }

    /// The digest algorithm, e.g. `sha256`.
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// The hex-encoded digest value.
    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    /// Compute the sha256 digest of a byte slice.
    pub fn sha256_of(data: &[u8]) -> Self {
        use sha2::Digest as _;
        let hash = sha2::Sha256::digest(data);
        Self {
            algorithm: "sha256".to_string(),
            encoded: hex::encode(hash),
        }
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.encoded)
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.encoded)
    }
}

impl std::str::FromStr for Digest {
    type Err = ClydeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = ClydeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.to_string()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const HEX: &str =
        "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn parse_valid_sha256() {
        let d = Digest::parse(&format!("sha256:{HEX}")).unwrap();
        assert_eq!("sha256", d.algorithm());
        assert_eq!(HEX, d.encoded());
        assert_eq!(format!("sha256:{HEX}"), d.to_string());
    }

    #[test]
    fn reject_malformed() {
        for bad in [
            "",
            "sha256",
            ":abc",
            "sha256:",
            "sha256:zzzz",
            "sha256:abcd",
            "SHA256:abcd",
        ] {
            assert!(Digest::parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn sha256_of_known_vector() {
        // sha256("hello world")
        let d = Digest::sha256_of(b"hello world");
        assert_eq!(format!("sha256:{HEX}"), d.to_string());
    }
}
