use std::{
    fmt,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use thiserror::Error;

use crate::{
    provider::{ProgressSink, Repository, RepositoryProvider, WorkingCopy},
    singleflight::SingleFlight,
    specifier::RepositorySpecifier,
    store::{HandleRecord, HandleStatus, HandleStore, StoreError},
};

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to fetch `{location}`")]
    Fetch {
        location: String,
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },
    #[error("failed to update `{location}`")]
    Update {
        location: String,
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The result of a fetch shared with every lookup that joined it.
    #[error(transparent)]
    Shared(#[from] Arc<Error>),
}

impl Error {
    fn fetch(specifier: &RepositorySpecifier, source: anyhow::Error) -> Error {
        Error::Fetch {
            location: specifier.location().to_string(),
            source: Arc::from(Box::<dyn std::error::Error + Send + Sync>::from(source)),
        }
    }

    fn update(specifier: &RepositorySpecifier, source: anyhow::Error) -> Error {
        Error::Update {
            location: specifier.location().to_string(),
            source: Arc::from(Box::<dyn std::error::Error + Send + Sync>::from(source)),
        }
    }
}

/// How a fetch obtained its objects, delivered to the delegate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchDetails {
    /// A shared cache supplied the objects.
    pub from_cache: bool,
    /// This fetch wrote back into the shared cache.
    pub updated_cache: bool,
}

/// Observer of manager activity. All methods default to no-ops and are never
/// invoked while the manager holds an internal lock; implementations must be
/// prepared for concurrent deliveries across specifiers.
pub trait RepositoryManagerDelegate: Send + Sync {
    fn will_fetch(&self, _specifier: &RepositorySpecifier, _details: &FetchDetails) {}

    fn fetching(&self, _specifier: &RepositorySpecifier, _objects_fetched: u64, _total: Option<u64>) {
    }

    fn did_fetch(
        &self,
        _specifier: &RepositorySpecifier,
        _result: &Result<FetchDetails, Error>,
        _duration: Duration,
    ) {
    }

    fn will_update(&self, _specifier: &RepositorySpecifier) {}

    fn did_update(
        &self,
        _specifier: &RepositorySpecifier,
        _result: &Result<(), Error>,
        _duration: Duration,
    ) {
    }
}

/// Callback for non-fatal conditions, such as a corrupt store file.
pub type WarningHandler = Box<dyn Fn(&str) + Send + Sync>;

/// A value naming a fetched mirror on disk. Handles stay valid for the life
/// of the manager root; callers never mutate manager-owned paths directly.
#[derive(Clone)]
pub struct RepositoryHandle {
    specifier: RepositorySpecifier,
    path: PathBuf,
    provider: Arc<dyn RepositoryProvider>,
}

impl RepositoryHandle {
    pub fn specifier(&self) -> &RepositorySpecifier {
        &self.specifier
    }

    /// Absolute path of the mirror under the manager root.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens a read-only query interface over the mirror.
    pub fn open(&self) -> anyhow::Result<Box<dyn Repository>> {
        self.provider.open(&self.specifier, &self.path)
    }

    /// Materializes a working checkout of the mirror at `destination`.
    pub fn create_working_copy(
        &self,
        destination: &Path,
        editable: bool,
    ) -> anyhow::Result<Box<dyn WorkingCopy>> {
        self.provider
            .create_working_copy(&self.specifier, &self.path, destination, editable)
    }
}

impl fmt::Debug for RepositoryHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RepositoryHandle")
            .field("specifier", &self.specifier)
            .field("path", &self.path)
            .finish()
    }
}

impl PartialEq for RepositoryHandle {
    fn eq(&self, other: &RepositoryHandle) -> bool {
        self.specifier == other.specifier && self.path == other.path
    }
}

impl Eq for RepositoryHandle {}

pub struct RepositoryManagerBuilder {
    root: PathBuf,
    provider: Arc<dyn RepositoryProvider>,
    cache_path: Option<PathBuf>,
    cache_local_packages: bool,
    delegate: Option<Arc<dyn RepositoryManagerDelegate>>,
    warning_handler: Option<WarningHandler>,
}

impl RepositoryManagerBuilder {
    /// Directory of a shared mirror cache staged between managers. Without
    /// one, every fetch goes straight to the origin.
    pub fn cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(path.into());
        self
    }

    /// Whether repositories on the local filesystem are staged through the
    /// shared cache as well. Defaults to false.
    pub fn cache_local_packages(mut self, enabled: bool) -> Self {
        self.cache_local_packages = enabled;
        self
    }

    pub fn delegate(mut self, delegate: Arc<dyn RepositoryManagerDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    /// Receiver for non-fatal warnings. Defaults to the `log` facade.
    pub fn warning_handler(mut self, handler: WarningHandler) -> Self {
        self.warning_handler = Some(handler);
        self
    }

    /// Creates the root directory, loads the persisted store, and recovers
    /// from a crashed predecessor before the manager accepts lookups.
    pub fn build(self) -> Result<RepositoryManager, Error> {
        fs::create_dir_all(&self.root)?;

        let warning_handler = self
            .warning_handler
            .unwrap_or_else(|| Box::new(|message| warn!("{message}")));
        let store = HandleStore::open(&self.root, &|message| warning_handler(message));

        // A record still pending is a fetch the previous process never
        // finished; drop its directory and keep the record as an error.
        for subpath in store.demote_pending()? {
            let path = self.root.join(subpath);
            if path.exists() {
                debug!("removing leftovers of an interrupted fetch at {}", path.display());
                fs::remove_dir_all(&path)?;
            }
        }

        Ok(RepositoryManager {
            root: self.root,
            provider: self.provider,
            store,
            pending_lookups: SingleFlight::new(),
            cache_path: self.cache_path,
            cache_local_packages: self.cache_local_packages,
            delegate: self.delegate,
        })
    }
}

/// A persistent, concurrency-safe cache of bare repository mirrors.
///
/// Concurrent lookups for the same specifier collapse into a single provider
/// fetch; every caller receives a handle naming the same on-disk mirror. The
/// mapping from specifier to mirror survives process restarts through a
/// schema-versioned store file under the root.
pub struct RepositoryManager {
    root: PathBuf,
    provider: Arc<dyn RepositoryProvider>,
    store: HandleStore,
    pending_lookups: SingleFlight<RepositorySpecifier, Result<RepositoryHandle, Arc<Error>>>,
    cache_path: Option<PathBuf>,
    cache_local_packages: bool,
    delegate: Option<Arc<dyn RepositoryManagerDelegate>>,
}

impl RepositoryManager {
    pub fn builder(
        root: impl Into<PathBuf>,
        provider: Arc<dyn RepositoryProvider>,
    ) -> RepositoryManagerBuilder {
        RepositoryManagerBuilder {
            root: root.into(),
            provider,
            cache_path: None,
            cache_local_packages: false,
            delegate: None,
            warning_handler: None,
        }
    }

    /// Root directory owned by this manager.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns a handle to the mirror for `specifier`, fetching it first if
    /// necessary. An existing mirror is refreshed from its origin unless
    /// `skip_update` is set.
    ///
    /// Safe to call from any number of threads; at most one fetch per
    /// specifier is in flight at any instant, and callers that arrive while
    /// one is running receive its result.
    pub fn lookup(
        &self,
        specifier: &RepositorySpecifier,
        skip_update: bool,
    ) -> Result<RepositoryHandle, Error> {
        // Fast path: an established clone the caller does not want refreshed.
        if skip_update {
            if let Some(handle) = self.established_handle(specifier) {
                return Ok(handle);
            }
        }

        self.pending_lookups
            .run(specifier, || {
                self.perform_lookup(specifier, skip_update).map_err(Arc::new)
            })
            .map_err(Error::Shared)
    }

    /// Removes the on-disk clone (absence is not an error) and erases the
    /// record.
    pub fn remove(&self, specifier: &RepositorySpecifier) -> Result<(), Error> {
        if let Some(record) = self.store.get(specifier) {
            let path = self.root.join(&record.subpath);
            if path.exists() {
                fs::remove_dir_all(&path)?;
            }
        }
        self.store.remove(specifier)?;
        Ok(())
    }

    /// Removes the entire repositories root and resets the store. Subsequent
    /// lookups fetch from scratch.
    pub fn reset(&self) -> Result<(), Error> {
        info!("clearing repository storage at {}", self.root.display());
        if self.root.exists() {
            fs::remove_dir_all(&self.root)?;
        }
        fs::create_dir_all(&self.root)?;
        self.store.reset()?;
        Ok(())
    }

    fn established_handle(&self, specifier: &RepositorySpecifier) -> Option<RepositoryHandle> {
        let record = self.store.get(specifier)?;
        if record.status != HandleStatus::Available {
            return None;
        }
        let path = self.root.join(&record.subpath);
        if !self.provider.is_valid_directory(&path) {
            return None;
        }
        Some(self.handle(specifier, &record.subpath))
    }

    fn perform_lookup(
        &self,
        specifier: &RepositorySpecifier,
        skip_update: bool,
    ) -> Result<RepositoryHandle, Error> {
        if let Some(handle) = self.established_handle(specifier) {
            if skip_update {
                return Ok(handle);
            }
            return self.update(specifier, handle);
        }
        self.fetch(specifier)
    }

    fn update(
        &self,
        specifier: &RepositorySpecifier,
        handle: RepositoryHandle,
    ) -> Result<RepositoryHandle, Error> {
        debug!("updating repository {}", specifier);
        self.notify(|delegate| delegate.will_update(specifier));
        let started = Instant::now();

        let outcome = self
            .open_and_fetch(specifier, handle.path())
            .map_err(|error| Error::update(specifier, error));
        match outcome {
            Ok(()) => {
                self.notify(|delegate| delegate.did_update(specifier, &Ok(()), started.elapsed()));
                Ok(handle)
            }
            Err(error) if self.provider.is_valid_directory(handle.path()) => {
                // An ordinary update failure does not invalidate a prior
                // clone; the caller keeps the handle it already had.
                warn!("failed to update {}: {}", specifier, error);
                let result = Err(error);
                self.notify(|delegate| delegate.did_update(specifier, &result, started.elapsed()));
                Ok(handle)
            }
            Err(error) => {
                // The update corrupted the clone. Purge it and fetch from
                // scratch, once.
                warn!(
                    "update left {} in a corrupt state, re-fetching",
                    handle.path().display()
                );
                let result = Err(error);
                self.notify(|delegate| delegate.did_update(specifier, &result, started.elapsed()));
                if handle.path().exists() {
                    fs::remove_dir_all(handle.path())?;
                }
                self.fetch(specifier)
            }
        }
    }

    fn open_and_fetch(
        &self,
        specifier: &RepositorySpecifier,
        path: &Path,
    ) -> anyhow::Result<()> {
        let repository = self.provider.open(specifier, path)?;
        repository.fetch(self.progress_sink(specifier))
    }

    fn fetch(&self, specifier: &RepositorySpecifier) -> Result<RepositoryHandle, Error> {
        let subpath = specifier.storage_path();
        let path = self.root.join(&subpath);
        info!("fetching {} into {}", specifier, path.display());

        self.store
            .put(specifier, HandleRecord::new(subpath.clone(), HandleStatus::Pending))?;

        let details = FetchDetails {
            from_cache: self
                .cached_mirror_path(specifier)
                .map_or(false, |cached| {
                    self.provider.repository_exists(&cached).unwrap_or(false)
                }),
            updated_cache: false,
        };
        self.notify(|delegate| delegate.will_fetch(specifier, &details));

        let started = Instant::now();
        let outcome = self.fetch_into(specifier, &path);

        if outcome.is_err() && path.exists() {
            // The provider may have left a partial destination behind.
            let _ = fs::remove_dir_all(&path);
        }
        let status = if outcome.is_ok() {
            HandleStatus::Available
        } else {
            HandleStatus::Error
        };
        self.store
            .put(specifier, HandleRecord::new(subpath.clone(), status))?;

        self.notify(|delegate| delegate.did_fetch(specifier, &outcome, started.elapsed()));
        outcome.map(|_| self.handle(specifier, &subpath))
    }

    fn fetch_into(
        &self,
        specifier: &RepositorySpecifier,
        destination: &Path,
    ) -> Result<FetchDetails, Error> {
        if destination.exists() {
            // Leftovers of an earlier failed fetch; the provider requires a
            // fresh destination.
            fs::remove_dir_all(destination)?;
        }

        if let Some(cached) = self.cached_mirror_path(specifier) {
            match self.fetch_through_cache(specifier, &cached, destination) {
                Ok(details) => return Ok(details),
                Err(error) => {
                    // A cache miss is not a user-visible error.
                    warn!(
                        "cache staging for {} failed, falling back to a direct fetch: {:#}",
                        specifier, error
                    );
                    if destination.exists() {
                        let _ = fs::remove_dir_all(destination);
                    }
                    // A partial cached mirror would poison every later
                    // staging attempt.
                    if cached.exists() && !self.provider.is_valid_directory(&cached) {
                        let _ = fs::remove_dir_all(&cached);
                    }
                }
            }
        }

        self.provider
            .fetch(specifier, destination, self.progress_sink(specifier))
            .map_err(|error| Error::fetch(specifier, error))?;
        Ok(FetchDetails::default())
    }

    /// Stages the fetch through the shared cache: refresh or create the
    /// cached mirror, then copy it under the manager root.
    fn fetch_through_cache(
        &self,
        specifier: &RepositorySpecifier,
        cached: &Path,
        destination: &Path,
    ) -> anyhow::Result<FetchDetails> {
        if let Some(cache_root) = cached.parent() {
            fs::create_dir_all(cache_root)?;
        }

        let from_cache = self.provider.repository_exists(cached)?;
        if from_cache {
            trace!("cache hit for {}, refreshing shared mirror", specifier);
            self.open_and_fetch(specifier, cached)?;
        } else {
            self.provider
                .fetch(specifier, cached, self.progress_sink(specifier))?;
        }
        self.provider.copy(cached, destination)?;

        Ok(FetchDetails {
            from_cache,
            updated_cache: true,
        })
    }

    fn cached_mirror_path(&self, specifier: &RepositorySpecifier) -> Option<PathBuf> {
        let cache_path = self.cache_path.as_ref()?;
        if specifier.is_local() && !self.cache_local_packages {
            return None;
        }
        Some(cache_path.join(specifier.storage_path()))
    }

    fn progress_sink(&self, specifier: &RepositorySpecifier) -> Option<ProgressSink> {
        let delegate = Arc::clone(self.delegate.as_ref()?);
        let specifier = specifier.clone();
        Some(Arc::new(move |objects_fetched, total| {
            delegate.fetching(&specifier, objects_fetched, total)
        }))
    }

    fn notify(&self, deliver: impl FnOnce(&dyn RepositoryManagerDelegate)) {
        if let Some(delegate) = &self.delegate {
            deliver(delegate.as_ref());
        }
    }

    fn handle(&self, specifier: &RepositorySpecifier, subpath: &Path) -> RepositoryHandle {
        RepositoryHandle {
            specifier: specifier.clone(),
            path: self.root.join(subpath),
            provider: Arc::clone(&self.provider),
        }
    }
}
