//! Cache key derivation from request URLs.
//!
//! Every tier of the cache is addressed by the same opaque key: the SHA-256
//! hex digest of the URL with its `http://` scheme prefix removed. Stripping
//! is a true prefix strip, so a host that happens to start with characters
//! from the scheme (for example `http.example.com`) is left intact.

use sha2::{Digest, Sha256};

/// Scheme prefix removed from URLs before hashing.
pub const HTTP_PREFIX: &str = "http://";

/// Strips a leading `http://` from `url`, if present.
///
/// # Examples
///
/// ```rust
/// use webcache::key::strip_http;
///
/// assert_eq!(strip_http("http://a.test/i.png"), "a.test/i.png");
/// assert_eq!(strip_http("a.test/i.png"), "a.test/i.png");
/// ```
pub fn strip_http(url: &str) -> &str {
    url.strip_prefix(HTTP_PREFIX).unwrap_or(url)
}

/// Derives the cache key for `url`: lower-case hex SHA-256 of the stripped URL.
///
/// Two URLs map to the same key exactly when their stripped forms are equal,
/// so `http://a.test/x` and `a.test/x` address the same entry.
pub fn hash(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(strip_http(url).as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_is_prefix_only() {
        assert_eq!(strip_http("http://a.test/i.png"), "a.test/i.png");
        assert_eq!(strip_http("a.test/i.png"), "a.test/i.png");
        // A character-set trim would eat into this host; a prefix strip must not.
        assert_eq!(strip_http("http://http.example.com/"), "http.example.com/");
        assert_eq!(strip_http("https://a.test/"), "https://a.test/");
    }

    #[test]
    fn hash_agrees_with_stripped_form() {
        assert_eq!(hash("http://a.test/x"), hash("a.test/x"));
        assert_ne!(hash("a.test/x"), hash("a.test/y"));
    }

    #[test]
    fn hash_is_hex_sha256() {
        let digest = hash("a.test/i.png");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(digest, digest.to_lowercase());
    }
}
