//! An in-memory repository provider.
//!
//! The provider owns both the repository state and its view of the
//! filesystem: fetched mirrors and working copies are tracked in a shared
//! table keyed by path, with a marker directory created on disk so validity
//! checks agree with what a caller observes. Intended for tests and offline
//! use; repository views index into the shared table rather than holding
//! references back into the provider.

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use anyhow::{anyhow, bail, Context};

use crate::{
    provider::{ProgressSink, Repository, RepositoryProvider, Revision, WorkingCopy},
    specifier::RepositorySpecifier,
};

/// Contents of a simulated repository: revisions with file trees, tags, and
/// a head revision.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRepository {
    revisions: BTreeMap<String, BTreeMap<PathBuf, Vec<u8>>>,
    tags: BTreeMap<String, Revision>,
    head: Option<Revision>,
}

impl InMemoryRepository {
    pub fn new() -> InMemoryRepository {
        InMemoryRepository::default()
    }

    /// A repository with one synthetic commit per tag.
    pub fn with_tags(tags: &[&str]) -> InMemoryRepository {
        let mut repository = InMemoryRepository::new();
        for (index, tag) in tags.iter().enumerate() {
            let revision = repository.commit(&format!("revision-{index}"), &[]);
            repository.tag(tag, &revision);
        }
        repository
    }

    /// Records a revision holding `files` and advances head to it.
    pub fn commit(&mut self, identifier: &str, files: &[(&str, &[u8])]) -> Revision {
        let tree = files
            .iter()
            .map(|(path, contents)| (PathBuf::from(path), contents.to_vec()))
            .collect();
        self.revisions.insert(identifier.to_string(), tree);
        let revision = Revision::new(identifier);
        self.head = Some(revision.clone());
        revision
    }

    pub fn tag(&mut self, name: &str, revision: &Revision) {
        self.tags.insert(name.to_string(), revision.clone());
    }
}

/// Failure mode of a fetched mirror, configurable per path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MirrorMode {
    Normal,
    /// `Repository::fetch` fails but the mirror stays intact.
    FailUpdates,
    /// `Repository::fetch` fails and leaves the mirror corrupt.
    CorruptOnUpdate,
}

#[derive(Debug, Clone)]
struct MirrorEntry {
    location: String,
    state: InMemoryRepository,
    mode: MirrorMode,
    corrupt: bool,
}

#[derive(Debug, Clone)]
struct WorkingCopyEntry {
    state: InMemoryRepository,
    revision: Revision,
    editable: bool,
}

#[derive(Default)]
struct Inner {
    remotes: HashMap<String, InMemoryRepository>,
    mirrors: HashMap<PathBuf, MirrorEntry>,
    working_copies: HashMap<PathBuf, WorkingCopyEntry>,
}

#[derive(Default)]
struct Counters {
    clones: AtomicUsize,
    fetches: AtomicUsize,
    copies: AtomicUsize,
}

#[derive(Default)]
pub struct InMemoryRepositoryProvider {
    inner: Arc<Mutex<Inner>>,
    counters: Arc<Counters>,
}

impl InMemoryRepositoryProvider {
    pub fn new() -> InMemoryRepositoryProvider {
        InMemoryRepositoryProvider::default()
    }

    /// Registers a remote repository the provider can serve.
    pub fn add_repository(&self, specifier: &RepositorySpecifier, repository: InMemoryRepository) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .remotes
            .insert(specifier.location().to_string(), repository);
    }

    /// Makes subsequent updates of the mirror at `path` fail without
    /// touching it.
    pub fn fail_updates_at(&self, path: &Path) {
        self.set_mode(path, MirrorMode::FailUpdates);
    }

    /// Makes the next update of the mirror at `path` fail and leave the
    /// mirror corrupt.
    pub fn corrupt_on_update(&self, path: &Path) {
        self.set_mode(path, MirrorMode::CorruptOnUpdate);
    }

    /// Number of full mirror fetches performed (`RepositoryProvider::fetch`).
    pub fn num_clones(&self) -> usize {
        self.counters.clones.load(Ordering::SeqCst)
    }

    /// Number of incremental updates performed (`Repository::fetch`).
    pub fn num_fetches(&self) -> usize {
        self.counters.fetches.load(Ordering::SeqCst)
    }

    /// Number of mirror-to-mirror copies performed.
    pub fn num_copies(&self) -> usize {
        self.counters.copies.load(Ordering::SeqCst)
    }

    fn set_mode(&self, path: &Path, mode: MirrorMode) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.mirrors.get_mut(path) {
            entry.mode = mode;
        }
    }
}

impl RepositoryProvider for InMemoryRepositoryProvider {
    fn fetch(
        &self,
        specifier: &RepositorySpecifier,
        destination: &Path,
        progress: Option<ProgressSink>,
    ) -> anyhow::Result<()> {
        if destination.exists() {
            bail!("destination {} already exists", destination.display());
        }

        let mut inner = self.inner.lock().unwrap();
        let remote = inner
            .remotes
            .get(specifier.location())
            .cloned()
            .ok_or_else(|| anyhow!("unknown repository {}", specifier))?;
        // A table entry whose directory is gone is a stale leftover.
        inner.mirrors.remove(destination);

        fs::create_dir_all(destination)?;
        if let Some(progress) = &progress {
            let total = remote.revisions.len() as u64;
            for fetched in 0..total {
                progress(fetched + 1, Some(total));
            }
        }

        inner.mirrors.insert(
            destination.to_path_buf(),
            MirrorEntry {
                location: specifier.location().to_string(),
                state: remote,
                mode: MirrorMode::Normal,
                corrupt: false,
            },
        );
        self.counters.clones.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn copy(&self, source: &Path, destination: &Path) -> anyhow::Result<()> {
        if destination.exists() {
            bail!("destination {} already exists", destination.display());
        }

        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .mirrors
            .get(source)
            .cloned()
            .with_context(|| format!("no repository at {}", source.display()))?;
        inner.mirrors.remove(destination);

        fs::create_dir_all(destination)?;
        inner.mirrors.insert(
            destination.to_path_buf(),
            MirrorEntry {
                mode: MirrorMode::Normal,
                corrupt: false,
                ..entry
            },
        );
        self.counters.copies.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn repository_exists(&self, path: &Path) -> anyhow::Result<bool> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.mirrors.contains_key(path) && path.exists())
    }

    fn open(
        &self,
        _specifier: &RepositorySpecifier,
        path: &Path,
    ) -> anyhow::Result<Box<dyn Repository>> {
        let inner = self.inner.lock().unwrap();
        if !inner.mirrors.contains_key(path) {
            bail!("no repository at {}", path.display());
        }
        Ok(Box::new(InMemoryRepositoryView {
            inner: Arc::clone(&self.inner),
            counters: Arc::clone(&self.counters),
            path: path.to_path_buf(),
        }))
    }

    fn create_working_copy(
        &self,
        _specifier: &RepositorySpecifier,
        source: &Path,
        destination: &Path,
        editable: bool,
    ) -> anyhow::Result<Box<dyn WorkingCopy>> {
        if destination.exists() {
            bail!("destination {} already exists", destination.display());
        }

        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .mirrors
            .get(source)
            .cloned()
            .with_context(|| format!("no repository at {}", source.display()))?;
        let revision = entry
            .state
            .head
            .clone()
            .with_context(|| format!("repository at {} has no revisions", source.display()))?;
        inner.working_copies.remove(destination);

        fs::create_dir_all(destination)?;
        inner.working_copies.insert(
            destination.to_path_buf(),
            WorkingCopyEntry {
                state: entry.state,
                revision,
                editable,
            },
        );
        drop(inner);

        self.open_working_copy(destination)
    }

    fn working_copy_exists(&self, path: &Path) -> anyhow::Result<bool> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.working_copies.contains_key(path) && path.exists())
    }

    fn open_working_copy(&self, path: &Path) -> anyhow::Result<Box<dyn WorkingCopy>> {
        let inner = self.inner.lock().unwrap();
        if !inner.working_copies.contains_key(path) {
            bail!("no working copy at {}", path.display());
        }
        Ok(Box::new(InMemoryWorkingCopy {
            inner: Arc::clone(&self.inner),
            path: path.to_path_buf(),
        }))
    }

    fn is_valid_directory(&self, path: &Path) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.mirrors.get(path) {
            Some(entry) => !entry.corrupt && path.exists(),
            None => false,
        }
    }

    fn is_valid_ref_format(&self, reference: &str) -> bool {
        !reference.is_empty()
            && !reference.starts_with('-')
            && !reference.contains("..")
            && !reference.chars().any(char::is_whitespace)
    }
}

/// Read-only view over a mirror in the shared table.
struct InMemoryRepositoryView {
    inner: Arc<Mutex<Inner>>,
    counters: Arc<Counters>,
    path: PathBuf,
}

impl InMemoryRepositoryView {
    fn with_state<T>(
        &self,
        query: impl FnOnce(&InMemoryRepository) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let inner = self.inner.lock().unwrap();
        let entry = inner
            .mirrors
            .get(&self.path)
            .with_context(|| format!("no repository at {}", self.path.display()))?;
        query(&entry.state)
    }
}

impl Repository for InMemoryRepositoryView {
    fn tags(&self) -> anyhow::Result<Vec<String>> {
        self.with_state(|state| Ok(state.tags.keys().cloned().collect()))
    }

    fn resolve_revision(&self, reference: &str) -> anyhow::Result<Revision> {
        self.with_state(|state| {
            if let Some(revision) = state.tags.get(reference) {
                return Ok(revision.clone());
            }
            if state.revisions.contains_key(reference) {
                return Ok(Revision::new(reference));
            }
            bail!("no such revision {reference}");
        })
    }

    fn exists(&self, revision: &Revision) -> bool {
        self.with_state(|state| Ok(state.revisions.contains_key(revision.identifier())))
            .unwrap_or(false)
    }

    fn read_file(&self, revision: &Revision, path: &Path) -> anyhow::Result<Vec<u8>> {
        self.with_state(|state| {
            let tree = state
                .revisions
                .get(revision.identifier())
                .with_context(|| format!("no such revision {revision}"))?;
            tree.get(path)
                .cloned()
                .with_context(|| format!("no file {} at {}", path.display(), revision))
        })
    }

    fn fetch(&self, _progress: Option<ProgressSink>) -> anyhow::Result<()> {
        self.counters.fetches.fetch_add(1, Ordering::SeqCst);

        let mut inner = self.inner.lock().unwrap();
        let Inner {
            remotes, mirrors, ..
        } = &mut *inner;
        let entry = mirrors
            .get_mut(&self.path)
            .with_context(|| format!("no repository at {}", self.path.display()))?;
        match entry.mode {
            MirrorMode::Normal => {
                // Re-sync from the remote, which may have advanced.
                if let Some(remote) = remotes.get(&entry.location) {
                    entry.state = remote.clone();
                }
                Ok(())
            }
            MirrorMode::FailUpdates => bail!("simulated update failure"),
            MirrorMode::CorruptOnUpdate => {
                entry.corrupt = true;
                bail!("simulated corrupting update");
            }
        }
    }
}

struct InMemoryWorkingCopy {
    inner: Arc<Mutex<Inner>>,
    path: PathBuf,
}

impl WorkingCopy for InMemoryWorkingCopy {
    fn path(&self) -> &Path {
        &self.path
    }

    fn is_editable(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .working_copies
            .get(&self.path)
            .map_or(false, |entry| entry.editable)
    }

    fn tags(&self) -> anyhow::Result<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        let entry = inner
            .working_copies
            .get(&self.path)
            .with_context(|| format!("no working copy at {}", self.path.display()))?;
        Ok(entry.state.tags.keys().cloned().collect())
    }

    fn current_revision(&self) -> anyhow::Result<Revision> {
        let inner = self.inner.lock().unwrap();
        let entry = inner
            .working_copies
            .get(&self.path)
            .with_context(|| format!("no working copy at {}", self.path.display()))?;
        Ok(entry.revision.clone())
    }

    fn checkout(&self, revision: &Revision) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .working_copies
            .get_mut(&self.path)
            .with_context(|| format!("no working copy at {}", self.path.display()))?;
        if !entry.state.revisions.contains_key(revision.identifier()) {
            bail!("no such revision {revision}");
        }
        entry.revision = revision.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn specifier(location: &str) -> RepositorySpecifier {
        RepositorySpecifier::from_location(location).unwrap()
    }

    #[test]
    fn fetch_then_query() {
        let root = TempDir::new().unwrap();
        let provider = InMemoryRepositoryProvider::new();
        let dummy = specifier("/dummy");

        let mut contents = InMemoryRepository::new();
        let revision = contents.commit("deadbeef", &[("Package.toml", b"name = \"dummy\"")]);
        contents.tag("1.0.0", &revision);
        provider.add_repository(&dummy, contents);

        let mirror = root.path().join("mirror");
        provider.fetch(&dummy, &mirror, None).unwrap();
        assert!(provider.repository_exists(&mirror).unwrap());
        assert!(provider.is_valid_directory(&mirror));
        assert_eq!(provider.num_clones(), 1);

        let repository = provider.open(&dummy, &mirror).unwrap();
        assert_eq!(repository.tags().unwrap(), vec!["1.0.0".to_string()]);
        let resolved = repository.resolve_revision("1.0.0").unwrap();
        assert_eq!(resolved, revision);
        assert!(repository.exists(&resolved));
        assert_eq!(
            repository
                .read_file(&resolved, Path::new("Package.toml"))
                .unwrap(),
            b"name = \"dummy\"".to_vec()
        );
    }

    #[test]
    fn fetch_of_unknown_repository_fails() {
        let root = TempDir::new().unwrap();
        let provider = InMemoryRepositoryProvider::new();
        let error = provider
            .fetch(&specifier("/unknown"), &root.path().join("mirror"), None)
            .unwrap_err();
        assert!(error.to_string().contains("unknown repository"));
    }

    #[test]
    fn copy_duplicates_a_mirror() {
        let root = TempDir::new().unwrap();
        let provider = InMemoryRepositoryProvider::new();
        let dummy = specifier("/dummy");
        provider.add_repository(&dummy, InMemoryRepository::with_tags(&["1.0.0"]));

        let first = root.path().join("first");
        let second = root.path().join("second");
        provider.fetch(&dummy, &first, None).unwrap();
        provider.copy(&first, &second).unwrap();

        assert!(provider.repository_exists(&second).unwrap());
        assert_eq!(provider.num_copies(), 1);
        let repository = provider.open(&dummy, &second).unwrap();
        assert_eq!(repository.tags().unwrap(), vec!["1.0.0".to_string()]);
    }

    #[test]
    fn working_copy_checks_out_revisions() {
        let root = TempDir::new().unwrap();
        let provider = InMemoryRepositoryProvider::new();
        let dummy = specifier("/dummy");

        let mut contents = InMemoryRepository::new();
        let first = contents.commit("r1", &[]);
        let second = contents.commit("r2", &[]);
        provider.add_repository(&dummy, contents);

        let mirror = root.path().join("mirror");
        provider.fetch(&dummy, &mirror, None).unwrap();

        let checkout_path = root.path().join("checkout");
        let checkout = provider
            .create_working_copy(&dummy, &mirror, &checkout_path, true)
            .unwrap();
        assert!(checkout.is_editable());
        assert_eq!(checkout.current_revision().unwrap(), second);

        checkout.checkout(&first).unwrap();
        assert_eq!(checkout.current_revision().unwrap(), first);
        assert!(checkout.checkout(&Revision::new("missing")).is_err());

        assert!(provider.working_copy_exists(&checkout_path).unwrap());
        let reopened = provider.open_working_copy(&checkout_path).unwrap();
        assert_eq!(reopened.current_revision().unwrap(), first);
    }

    #[test]
    fn progress_reports_monotonically() {
        let root = TempDir::new().unwrap();
        let provider = InMemoryRepositoryProvider::new();
        let dummy = specifier("/dummy");
        provider.add_repository(&dummy, InMemoryRepository::with_tags(&["1.0.0", "2.0.0"]));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink: ProgressSink = {
            let seen = Arc::clone(&seen);
            Arc::new(move |fetched, total| {
                seen.lock().unwrap().push((fetched, total));
            })
        };
        provider
            .fetch(&dummy, &root.path().join("mirror"), Some(sink))
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![(1, Some(2)), (2, Some(2))]);
    }
}
