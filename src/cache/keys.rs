//! Cache key derivation.
//!
//! A page is identified by the SHA-1 of its exact URL string. No
//! normalisation happens: `https://a.test/x` and `https://a.test/x/` are
//! different entries.

use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};
use url::Url;

use super::error::CacheError;

/// Length of the directory shard prefix taken from the digest.
const SHARD_LEN: usize = 2;

/// Storage identity of one cached URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    digest: String,
    host: String,
}

impl CacheKey {
    /// Derive the key for an absolute URL.
    pub fn derive(url: &str) -> Result<Self, CacheError> {
        let parsed =
            Url::parse(url).map_err(|err| CacheError::key_derivation(url, err.to_string()))?;
        let host = parsed
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| CacheError::key_derivation(url, "url has no host"))?
            .to_string();
        if !is_path_component(&host) {
            return Err(CacheError::key_derivation(
                url,
                format!("host `{host}` is not usable as a directory name"),
            ));
        }

        Ok(Self {
            digest: hash_url(url),
            host,
        })
    }

    /// Lowercase hex SHA-1 of the URL, 40 characters.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// First two hex characters of the digest.
    pub fn shard(&self) -> &str {
        &self.digest[..SHARD_LEN]
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Directory holding the entry: `base/host/shard`.
    pub fn shard_dir(&self, base: &Path) -> PathBuf {
        base.join(&self.host).join(self.shard())
    }

    /// Entry file: `base/host/shard/digest`.
    pub fn disk_path(&self, base: &Path) -> PathBuf {
        self.shard_dir(base).join(&self.digest)
    }

    /// Flat object key: `prefix/digest`.
    pub fn object_key(&self, prefix: &str) -> String {
        let prefix = prefix.trim_end_matches('/');
        if prefix.is_empty() {
            self.digest.clone()
        } else {
            format!("{prefix}/{}", self.digest)
        }
    }
}

/// The host becomes a directory under the cache root and must not climb out
/// of it.
fn is_path_component(host: &str) -> bool {
    host != "." && host != ".." && !host.contains(['/', '\\', '\0'])
}

/// Hex SHA-1 of the raw URL bytes.
pub fn hash_url(url: &str) -> String {
    let digest = Sha1::digest(url.as_bytes());
    hex::encode(digest.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_matches_known_sha1() {
        let key = CacheKey::derive("https://example.com/").expect("valid url");
        assert_eq!(key.digest(), hash_url("https://example.com/"));
        assert_eq!(key.digest().len(), 40);
        assert!(
            key.digest()
                .chars()
                .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        );
        assert_eq!(hash_url("abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn derivation_is_stable() {
        let first = CacheKey::derive("https://example.com/a?b=1&c=2").expect("valid url");
        let second = CacheKey::derive("https://example.com/a?b=1&c=2").expect("valid url");
        assert_eq!(first, second);
    }

    #[test]
    fn no_normalisation_is_applied() {
        let plain = CacheKey::derive("https://example.com/a").expect("valid url");
        let slash = CacheKey::derive("https://example.com/a/").expect("valid url");
        let reordered_a = CacheKey::derive("https://example.com/?a=1&b=2").expect("valid url");
        let reordered_b = CacheKey::derive("https://example.com/?b=2&a=1").expect("valid url");
        assert_ne!(plain.digest(), slash.digest());
        assert_ne!(reordered_a.digest(), reordered_b.digest());
    }

    #[test]
    fn shard_and_host_come_from_url() {
        let key = CacheKey::derive("http://Shop.Example.com:8080/p/1").expect("valid url");
        assert_eq!(key.host(), "shop.example.com");
        assert_eq!(key.shard(), &key.digest()[..2]);
    }

    #[test]
    fn disk_path_layout() {
        let key = CacheKey::derive("https://example.com/page").expect("valid url");
        let path = key.disk_path(Path::new("/var/cache"));
        let expected = PathBuf::from("/var/cache")
            .join("example.com")
            .join(key.shard())
            .join(key.digest());
        assert_eq!(path, expected);
    }

    #[test]
    fn object_key_is_flat_under_prefix() {
        let key = CacheKey::derive("https://example.com/page").expect("valid url");
        assert_eq!(
            key.object_key("prerender-ba-cache"),
            format!("prerender-ba-cache/{}", key.digest())
        );
        assert_eq!(
            key.object_key("nested/prefix/"),
            format!("nested/prefix/{}", key.digest())
        );
        assert_eq!(key.object_key(""), key.digest());
    }

    #[test]
    fn malformed_url_is_an_error() {
        let err = CacheKey::derive("not a url").expect_err("must fail");
        assert!(matches!(err, CacheError::KeyDerivation { .. }));
    }

    #[test]
    fn dot_segment_hosts_are_rejected() {
        for url in [
            "http://../page",
            "http://%2e%2e/page",
            "https://./page",
            "http://%2E/page",
        ] {
            let err = CacheKey::derive(url).expect_err("dot host must fail");
            assert!(
                matches!(err, CacheError::KeyDerivation { .. }),
                "{url} gave {err:?}"
            );
        }
    }

    #[test]
    fn trailing_dot_host_stays_inside_base() {
        let key = CacheKey::derive("https://example.com./page").expect("trailing dot host");
        assert_eq!(key.host(), "example.com.");
        assert!(key.disk_path(Path::new("/srv/cache")).starts_with("/srv/cache/example.com."));
    }

    #[test]
    fn url_without_host_is_an_error() {
        let err = CacheKey::derive("mailto:someone@example.com").expect_err("must fail");
        assert!(matches!(err, CacheError::KeyDerivation { .. }));
    }
}
