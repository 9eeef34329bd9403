use std::{
    fmt::{Display, Write},
    path::{Path, PathBuf},
};

use regex_lite::Regex;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpecifierError {
    #[error("repository location `{0}` is neither a URL nor an absolute path")]
    UnsupportedLocation(String),
}

/// A canonicalized reference to a remote or local repository.
///
/// Two specifiers are equal exactly when their canonical location strings are
/// equal (case-sensitive); equal specifiers always map to the same
/// [`storage_path`](RepositorySpecifier::storage_path).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepositorySpecifier {
    location: String,
    kind: Kind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum Kind {
    Remote,
    Local,
}

impl RepositorySpecifier {
    /// Builds a specifier from a URL-like location string or a local absolute
    /// path. Trailing path separators are stripped during canonicalization.
    pub fn from_location(location: &str) -> Result<RepositorySpecifier, SpecifierError> {
        let url_re = Regex::new(r"^[A-Za-z][A-Za-z0-9+.-]*://.").unwrap();
        let scp_re = Regex::new(r"^[^/@]+@[^/:]+:.").unwrap();

        let canonical = location.trim_end_matches(['/', '\\']);
        if canonical.is_empty() {
            return Err(SpecifierError::UnsupportedLocation(location.to_string()));
        }

        if url_re.is_match(canonical) || scp_re.is_match(canonical) {
            Ok(RepositorySpecifier {
                location: canonical.to_string(),
                kind: Kind::Remote,
            })
        } else if Path::new(canonical).is_absolute() {
            Ok(RepositorySpecifier {
                location: canonical.to_string(),
                kind: Kind::Local,
            })
        } else {
            Err(SpecifierError::UnsupportedLocation(location.to_string()))
        }
    }

    /// Builds a specifier for a repository on the local filesystem.
    pub fn from_path(path: &Path) -> Result<RepositorySpecifier, SpecifierError> {
        let location = path.to_string_lossy();
        if !path.is_absolute() {
            return Err(SpecifierError::UnsupportedLocation(location.to_string()));
        }
        Ok(RepositorySpecifier {
            location: location.trim_end_matches(['/', '\\']).to_string(),
            kind: Kind::Local,
        })
    }

    /// The canonical location string.
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Whether the specifier names a repository on the local filesystem
    /// rather than a remote one.
    pub fn is_local(&self) -> bool {
        self.kind == Kind::Local
    }

    /// The final path segment of the location, without a `.git` suffix.
    pub fn basename(&self) -> &str {
        let tail = self
            .location
            .rsplit(['/', ':'])
            .next()
            .unwrap_or(&self.location);
        match tail.strip_suffix(".git") {
            Some(stripped) if !stripped.is_empty() => stripped,
            _ => tail,
        }
    }

    /// A deterministic, filesystem-safe relative directory name for this
    /// specifier, stable across runs and platforms.
    ///
    /// The name is the encoded basename plus a short hash of the full
    /// canonical location, so distinct locations sharing a tail segment never
    /// collide.
    pub fn storage_path(&self) -> PathBuf {
        let digest = Sha256::digest(self.location.as_bytes());
        let basename = self.basename();
        let encoded = if basename.is_empty() {
            "repository".to_string()
        } else {
            encode_component(basename)
        };
        PathBuf::from(format!("{}-{}", encoded, hex::encode(&digest[..4])))
    }
}

impl Display for RepositorySpecifier {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(&self.location)
    }
}

/// Percent-style encoding of a path component: reversible, collision-free,
/// and restricted to `[A-Za-z0-9._-]` plus `%XX` escapes.
fn encode_component(component: &str) -> String {
    let mut encoded = String::with_capacity(component.len());
    for byte in component.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                encoded.push(byte as char)
            }
            _ => {
                let _ = write!(encoded, "%{byte:02X}");
            }
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn equal_specifiers_share_a_storage_path() {
        let a = RepositorySpecifier::from_location("https://github.com/org/repo").unwrap();
        let b = RepositorySpecifier::from_location("https://github.com/org/repo").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.storage_path(), b.storage_path());
    }

    #[test]
    fn distinct_locations_never_collide() {
        let a = RepositorySpecifier::from_location("https://github.com/one/repo").unwrap();
        let b = RepositorySpecifier::from_location("https://github.com/two/repo").unwrap();
        assert_ne!(a.storage_path(), b.storage_path());
        // Same encoded basename, disambiguated by the location hash.
        assert_eq!(a.basename(), b.basename());
    }

    #[test]
    fn trailing_separators_are_stripped() {
        let a = RepositorySpecifier::from_location("https://github.com/org/repo/").unwrap();
        let b = RepositorySpecifier::from_location("https://github.com/org/repo").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn git_suffix_distinguishes_specifiers_but_not_basenames() {
        let plain = RepositorySpecifier::from_location("https://github.com/org/repo").unwrap();
        let suffixed = RepositorySpecifier::from_location("https://github.com/org/repo.git").unwrap();
        assert_ne!(plain, suffixed);
        assert_eq!(plain.basename(), suffixed.basename());
        assert_ne!(plain.storage_path(), suffixed.storage_path());
    }

    #[test]
    fn scp_style_locations_are_remote() {
        let specifier = RepositorySpecifier::from_location("git@github.com:org/repo.git").unwrap();
        assert!(!specifier.is_local());
        assert_eq!(specifier.basename(), "repo");
    }

    #[test]
    fn absolute_paths_are_local() {
        let specifier = RepositorySpecifier::from_location("/var/lib/dummy").unwrap();
        assert!(specifier.is_local());
        assert_eq!(specifier.basename(), "dummy");

        let from_path = RepositorySpecifier::from_path(Path::new("/var/lib/dummy")).unwrap();
        assert_eq!(specifier, from_path);
    }

    #[test]
    fn relative_paths_are_rejected() {
        assert!(RepositorySpecifier::from_location("relative/path").is_err());
        assert!(RepositorySpecifier::from_path(Path::new("relative/path")).is_err());
        assert!(RepositorySpecifier::from_location("").is_err());
    }

    #[test]
    fn unsafe_characters_are_encoded() {
        let specifier =
            RepositorySpecifier::from_location("https://example.com/org/weird%20name").unwrap();
        let storage = specifier.storage_path();
        let name = storage.to_string_lossy();
        assert!(!name.contains(' '));
        assert!(!name.contains('/'));
        assert!(name.starts_with("weird%2520name-"));
    }

    #[test]
    fn storage_path_is_a_single_component() {
        let specifier = RepositorySpecifier::from_location("ssh://git@host/a/b/c").unwrap();
        assert_eq!(specifier.storage_path().components().count(), 1);
    }
}
