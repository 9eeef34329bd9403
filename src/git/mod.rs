//! git2-backed repository provider.

mod repository;

pub use repository::{GitRepository, GitWorkingCopy};

use std::path::Path;

use anyhow::{bail, Context};
use git2::{
    build::RepoBuilder, Config, Cred, CredentialType, FetchOptions, RemoteCallbacks, Repository,
};

use crate::{
    provider::{ProgressSink, RepositoryProvider, WorkingCopy},
    specifier::RepositorySpecifier,
};

/// Fetch refspec used for bare mirrors: every ref on the remote, forced.
const MIRROR_REFSPEC: &str = "+refs/*:refs/*";

/// Config key recording whether a working copy was created editable.
const EDITABLE_CONFIG_KEY: &str = "repocache.editable";

/// Provider backed by libgit2. Mirrors are bare clones carrying every remote
/// ref; credentials come from the standard git configuration.
#[derive(Default)]
pub struct GitRepositoryProvider;

impl GitRepositoryProvider {
    pub fn new() -> GitRepositoryProvider {
        GitRepositoryProvider
    }
}

impl RepositoryProvider for GitRepositoryProvider {
    fn fetch(
        &self,
        specifier: &RepositorySpecifier,
        destination: &Path,
        progress: Option<ProgressSink>,
    ) -> anyhow::Result<()> {
        if destination.exists() {
            bail!("destination {} already exists", destination.display());
        }

        trace!("cloning {} into {}", specifier, destination.display());
        let mut repo_builder = RepoBuilder::new();
        repo_builder
            .bare(true)
            .fetch_options(fetch_options(progress)?)
            .remote_create(|repo, name, url| repo.remote_with_fetch(name, url, MIRROR_REFSPEC));
        repo_builder
            .clone(specifier.location(), destination)
            .with_context(|| format!("failed to clone {specifier}"))?;
        Ok(())
    }

    fn copy(&self, source: &Path, destination: &Path) -> anyhow::Result<()> {
        if destination.exists() {
            bail!("destination {} already exists", destination.display());
        }
        let source = source
            .to_str()
            .with_context(|| format!("source path {} is not valid UTF-8", source.display()))?;

        let mut repo_builder = RepoBuilder::new();
        repo_builder
            .bare(true)
            .remote_create(|repo, name, url| repo.remote_with_fetch(name, url, MIRROR_REFSPEC));
        repo_builder
            .clone(source, destination)
            .with_context(|| format!("failed to copy mirror {source}"))?;
        Ok(())
    }

    fn repository_exists(&self, path: &Path) -> anyhow::Result<bool> {
        Ok(path.is_dir() && Repository::open(path).is_ok())
    }

    fn open(
        &self,
        _specifier: &RepositorySpecifier,
        path: &Path,
    ) -> anyhow::Result<Box<dyn crate::provider::Repository>> {
        Ok(Box::new(GitRepository::open(path)?))
    }

    fn create_working_copy(
        &self,
        specifier: &RepositorySpecifier,
        source: &Path,
        destination: &Path,
        editable: bool,
    ) -> anyhow::Result<Box<dyn WorkingCopy>> {
        if destination.exists() {
            bail!("destination {} already exists", destination.display());
        }
        let source_str = source
            .to_str()
            .with_context(|| format!("source path {} is not valid UTF-8", source.display()))?;

        debug!(
            "checking out {} into {}",
            specifier,
            destination.display()
        );
        let repo = RepoBuilder::new()
            .clone(source_str, destination)
            .with_context(|| format!("failed to check out {specifier}"))?;

        if editable {
            // An editable checkout talks to the true origin, not our mirror.
            repo.remote_set_url("origin", specifier.location())?;
        }
        repo.config()?.set_bool(EDITABLE_CONFIG_KEY, editable)?;

        self.open_working_copy(destination)
    }

    fn working_copy_exists(&self, path: &Path) -> anyhow::Result<bool> {
        Ok(path.is_dir()
            && Repository::open(path)
                .map(|repo| !repo.is_bare())
                .unwrap_or(false))
    }

    fn open_working_copy(&self, path: &Path) -> anyhow::Result<Box<dyn WorkingCopy>> {
        Ok(Box::new(GitWorkingCopy::open(path)?))
    }

    fn is_valid_directory(&self, path: &Path) -> bool {
        Repository::open(path).is_ok()
    }

    fn is_valid_ref_format(&self, reference: &str) -> bool {
        git2::Reference::is_valid_name(&format!("refs/{reference}"))
    }
}

/// Builds fetch options with credential callbacks resolved from the standard
/// git configuration, and transfer-progress wiring when a sink is given.
pub(crate) fn fetch_options(
    progress: Option<ProgressSink>,
) -> anyhow::Result<FetchOptions<'static>> {
    let config = Config::open_default()?;
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |url, username, allowed| {
        trace!("credential request for {url} (user {username:?}, types {allowed:?})");
        let user = username.unwrap_or("git");
        if allowed.contains(CredentialType::SSH_KEY) {
            return Cred::ssh_key_from_agent(user);
        }
        if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) {
            return Cred::credential_helper(&config, url, username);
        }
        if allowed.contains(CredentialType::USERNAME) {
            // The ssh transport asks for a user name before it asks for a key.
            return Cred::username(user);
        }
        Err(git2::Error::from_str(&format!(
            "no usable credentials for {url}"
        )))
    });

    if let Some(progress) = progress {
        callbacks.transfer_progress(move |stats| {
            progress(
                stats.received_objects() as u64,
                Some(stats.total_objects() as u64),
            );
            true
        });
    }

    let mut fetch_options = FetchOptions::new();
    fetch_options
        .remote_callbacks(callbacks)
        .download_tags(git2::AutotagOption::All);

    Ok(fetch_options)
}

/// The refspecs configured on a remote, skipping any that are not valid
/// UTF-8. Refreshing a mirror re-fetches exactly what its clone configured.
pub(crate) fn configured_refspecs(remote: &git2::Remote) -> Vec<String> {
    let mut refspecs = Vec::new();
    for refspec in remote.refspecs() {
        if let Some(refspec) = refspec.str() {
            refspecs.push(refspec.to_owned());
        }
    }
    refspecs
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::provider::{Repository as _, Revision};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    /// Authors a repository with one commit and one tag, returning the commit id.
    fn author_upstream(path: &Path) -> String {
        let repo = Repository::init(path).unwrap();
        let signature = git2::Signature::now("Tester", "tester@example.com").unwrap();

        fs::write(path.join("README.md"), "hello").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("README.md")).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let commit_id = repo
            .commit(Some("HEAD"), &signature, &signature, "initial", &tree, &[])
            .unwrap();

        let target = repo.find_object(commit_id, None).unwrap();
        repo.tag_lightweight("v1.0.0", &target, false).unwrap();
        commit_id.to_string()
    }

    #[test]
    fn mirror_and_query_a_local_repository() {
        let workspace = TempDir::new().unwrap();
        let upstream = workspace.path().join("upstream");
        fs::create_dir_all(&upstream).unwrap();
        let commit_id = author_upstream(&upstream);

        let provider = GitRepositoryProvider::new();
        let specifier = RepositorySpecifier::from_path(&upstream).unwrap();
        let mirror = workspace.path().join("mirror");

        provider.fetch(&specifier, &mirror, None).unwrap();
        assert!(provider.repository_exists(&mirror).unwrap());
        assert!(provider.is_valid_directory(&mirror));

        let repository = provider.open(&specifier, &mirror).unwrap();
        assert_eq!(repository.tags().unwrap(), vec!["v1.0.0".to_string()]);

        let resolved = repository.resolve_revision("v1.0.0").unwrap();
        assert_eq!(resolved.identifier(), commit_id);
        assert!(repository.exists(&resolved));

        let contents = repository
            .read_file(&resolved, Path::new("README.md"))
            .unwrap();
        assert_eq!(contents, b"hello".to_vec());
    }

    #[test]
    fn fetch_refuses_an_existing_destination() {
        let workspace = TempDir::new().unwrap();
        let upstream = workspace.path().join("upstream");
        fs::create_dir_all(&upstream).unwrap();
        author_upstream(&upstream);

        let provider = GitRepositoryProvider::new();
        let specifier = RepositorySpecifier::from_path(&upstream).unwrap();
        let mirror = workspace.path().join("mirror");
        fs::create_dir_all(&mirror).unwrap();

        assert!(provider.fetch(&specifier, &mirror, None).is_err());
    }

    #[test]
    fn copy_duplicates_a_mirror() {
        let workspace = TempDir::new().unwrap();
        let upstream = workspace.path().join("upstream");
        fs::create_dir_all(&upstream).unwrap();
        author_upstream(&upstream);

        let provider = GitRepositoryProvider::new();
        let specifier = RepositorySpecifier::from_path(&upstream).unwrap();
        let first = workspace.path().join("first");
        let second = workspace.path().join("second");

        provider.fetch(&specifier, &first, None).unwrap();
        provider.copy(&first, &second).unwrap();

        let repository = provider.open(&specifier, &second).unwrap();
        assert_eq!(repository.tags().unwrap(), vec!["v1.0.0".to_string()]);
    }

    #[test]
    fn working_copy_round_trip() {
        let workspace = TempDir::new().unwrap();
        let upstream = workspace.path().join("upstream");
        fs::create_dir_all(&upstream).unwrap();
        let commit_id = author_upstream(&upstream);

        let provider = GitRepositoryProvider::new();
        let specifier = RepositorySpecifier::from_path(&upstream).unwrap();
        let mirror = workspace.path().join("mirror");
        provider.fetch(&specifier, &mirror, None).unwrap();

        let checkout_path = workspace.path().join("checkout");
        let checkout = provider
            .create_working_copy(&specifier, &mirror, &checkout_path, true)
            .unwrap();
        assert!(checkout.is_editable());
        assert_eq!(checkout.current_revision().unwrap().identifier(), commit_id);
        assert!(checkout_path.join("README.md").exists());
        assert_eq!(checkout.tags().unwrap(), vec!["v1.0.0".to_string()]);
        assert!(checkout.checkout(&Revision::new(commit_id)).is_ok());

        assert!(provider.working_copy_exists(&checkout_path).unwrap());
        let reopened = provider.open_working_copy(&checkout_path).unwrap();
        assert!(reopened.is_editable());
    }

    #[test]
    fn ref_format_validation() {
        let provider = GitRepositoryProvider::new();
        assert!(provider.is_valid_ref_format("main"));
        assert!(provider.is_valid_ref_format("tags/v1.0.0"));
        assert!(provider.is_valid_ref_format("1.0.0"));
        assert!(!provider.is_valid_ref_format(""));
        assert!(!provider.is_valid_ref_format("a..b"));
        assert!(!provider.is_valid_ref_format("spaces are bad"));
        assert!(!provider.is_valid_ref_format("trailing.lock"));
    }
}
