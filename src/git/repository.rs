use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use git2::{ErrorCode, ObjectType, Oid, ResetType};

use crate::provider::{ProgressSink, Repository, Revision, WorkingCopy};

use super::{fetch_options, EDITABLE_CONFIG_KEY};

/// Read-only view over a bare mirror.
pub struct GitRepository {
    git_repo: git2::Repository,
}

impl GitRepository {
    pub fn open(path: &Path) -> anyhow::Result<GitRepository> {
        let git_repo = git2::Repository::open(path)
            .with_context(|| format!("failed to open repository at {}", path.display()))?;
        Ok(GitRepository { git_repo })
    }
}

impl Repository for GitRepository {
    fn tags(&self) -> anyhow::Result<Vec<String>> {
        let tags = self
            .git_repo
            .tag_names(None)?
            .iter()
            .flatten()
            .map(String::from)
            .collect();
        Ok(tags)
    }

    fn resolve_revision(&self, reference: &str) -> anyhow::Result<Revision> {
        let oid = self
            .git_repo
            .revparse_single(reference)?
            .peel_to_commit()?
            .id();
        Ok(Revision::new(oid.to_string()))
    }

    fn exists(&self, revision: &Revision) -> bool {
        Oid::from_str(revision.identifier())
            .map(|oid| self.git_repo.find_commit(oid).is_ok())
            .unwrap_or(false)
    }

    fn read_file(&self, revision: &Revision, path: &Path) -> anyhow::Result<Vec<u8>> {
        let spec = format!("{}:{}", revision, path.display());
        let object = match self.git_repo.revparse_single(&spec) {
            Ok(object) => object,
            Err(error) if error.code() == ErrorCode::NotFound => {
                bail!("no file {} at {}", path.display(), revision)
            }
            Err(error) => return Err(error.into()),
        };
        match object.kind() {
            Some(ObjectType::Blob) => Ok(object.peel_to_blob()?.content().to_vec()),
            Some(kind) => bail!("bad git object kind {kind} found for {spec} (expected blob)"),
            None => bail!("unknown git object kind for {spec}"),
        }
    }

    fn fetch(&self, progress: Option<ProgressSink>) -> anyhow::Result<()> {
        let mut origin = self.git_repo.find_remote("origin")?;
        let refspecs = super::configured_refspecs(&origin);
        origin.fetch(&refspecs, Some(&mut fetch_options(progress)?), None)?;
        Ok(())
    }
}

/// A working tree checked out from a mirror.
pub struct GitWorkingCopy {
    git_repo: git2::Repository,
    path: PathBuf,
    editable: bool,
}

impl GitWorkingCopy {
    pub fn open(path: &Path) -> anyhow::Result<GitWorkingCopy> {
        let git_repo = git2::Repository::open(path)
            .with_context(|| format!("failed to open working copy at {}", path.display()))?;
        if git_repo.is_bare() {
            bail!("{} is a bare repository, not a working copy", path.display());
        }
        let editable = git_repo
            .config()?
            .get_bool(EDITABLE_CONFIG_KEY)
            .unwrap_or(false);
        Ok(GitWorkingCopy {
            git_repo,
            path: path.to_path_buf(),
            editable,
        })
    }
}

impl WorkingCopy for GitWorkingCopy {
    fn path(&self) -> &Path {
        &self.path
    }

    fn is_editable(&self) -> bool {
        self.editable
    }

    fn tags(&self) -> anyhow::Result<Vec<String>> {
        let tags = self
            .git_repo
            .tag_names(None)?
            .iter()
            .flatten()
            .map(String::from)
            .collect();
        Ok(tags)
    }

    fn current_revision(&self) -> anyhow::Result<Revision> {
        let oid = self.git_repo.head()?.peel_to_commit()?.id();
        Ok(Revision::new(oid.to_string()))
    }

    fn checkout(&self, revision: &Revision) -> anyhow::Result<()> {
        let object = self.git_repo.revparse_single(revision.identifier())?;
        self.git_repo.reset(&object, ResetType::Hard, None)?;
        Ok(())
    }
}
