use std::{fmt::Display, path::Path, sync::Arc};

use crate::specifier::RepositorySpecifier;

#[cfg(test)]
use mockall::{predicate::*, *};

/// Advisory progress callback for long-running transfers: receives
/// `(objects_fetched, total)` updates and must never block the transfer.
pub type ProgressSink = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// An opaque revision identifier resolved by the underlying VCS (for git, a
/// commit hash). The manager treats it as an uninterpreted token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Revision {
    identifier: String,
}

impl Revision {
    pub fn new(identifier: impl Into<String>) -> Revision {
        Revision {
            identifier: identifier.into(),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }
}

impl Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(&self.identifier)
    }
}

/// The pluggable VCS capability set the manager depends on.
///
/// Implementations may be network-backed ([`GitRepositoryProvider`]) or
/// entirely in memory ([`InMemoryRepositoryProvider`]); the manager treats
/// every provider uniformly.
///
/// [`GitRepositoryProvider`]: crate::git::GitRepositoryProvider
/// [`InMemoryRepositoryProvider`]: crate::inmemory::InMemoryRepositoryProvider
#[cfg_attr(test, automock)]
pub trait RepositoryProvider: Send + Sync {
    /// Populates `destination` with a bare mirror of the repository named by
    /// `specifier`. The destination must not pre-exist; on failure it may be
    /// left partial and the caller is responsible for removing it before
    /// retrying.
    fn fetch(
        &self,
        specifier: &RepositorySpecifier,
        destination: &Path,
        progress: Option<ProgressSink>,
    ) -> anyhow::Result<()>;

    /// Clones the on-disk state of the mirror at `source` to `destination`,
    /// which must not pre-exist.
    fn copy(&self, source: &Path, destination: &Path) -> anyhow::Result<()>;

    /// Whether a valid bare mirror currently lives at `path`.
    fn repository_exists(&self, path: &Path) -> anyhow::Result<bool>;

    /// Opens a read-only query interface over an existing mirror.
    fn open(
        &self,
        specifier: &RepositorySpecifier,
        path: &Path,
    ) -> anyhow::Result<Box<dyn Repository>>;

    /// Materializes a working tree at `destination` from the mirror at
    /// `source`. `editable` controls whether the checkout is free to develop
    /// in. The destination must not pre-exist.
    fn create_working_copy(
        &self,
        specifier: &RepositorySpecifier,
        source: &Path,
        destination: &Path,
        editable: bool,
    ) -> anyhow::Result<Box<dyn WorkingCopy>>;

    fn working_copy_exists(&self, path: &Path) -> anyhow::Result<bool>;

    fn open_working_copy(&self, path: &Path) -> anyhow::Result<Box<dyn WorkingCopy>>;

    /// Whether `path` holds a repository directory this provider considers
    /// valid. The manager uses this to judge the `available` invariant.
    fn is_valid_directory(&self, path: &Path) -> bool;

    /// Whether `reference` is syntactically acceptable to the underlying VCS.
    fn is_valid_ref_format(&self, reference: &str) -> bool;
}

/// Read-only queries over a fetched mirror.
#[cfg_attr(test, automock)]
pub trait Repository: Send {
    fn tags(&self) -> anyhow::Result<Vec<String>>;

    fn resolve_revision(&self, reference: &str) -> anyhow::Result<Revision>;

    fn exists(&self, revision: &Revision) -> bool;

    /// Reads the contents of `path` as it exists at `revision`.
    fn read_file(&self, revision: &Revision, path: &Path) -> anyhow::Result<Vec<u8>>;

    /// Incrementally updates the mirror from its origin.
    fn fetch(&self, progress: Option<ProgressSink>) -> anyhow::Result<()>;
}

/// A materialized working tree checked out from a mirror.
pub trait WorkingCopy: Send {
    fn path(&self) -> &Path;

    fn is_editable(&self) -> bool;

    fn tags(&self) -> anyhow::Result<Vec<String>>;

    fn current_revision(&self) -> anyhow::Result<Revision>;

    fn checkout(&self, revision: &Revision) -> anyhow::Result<()>;
}
