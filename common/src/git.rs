// Git access: clone-or-pull of a repository's local working copy
//
// libgit2 is blocking, so every operation runs on the blocking thread pool.
// Pulls are fast-forward only; a diverged local branch is reported, never merged.

use crate::errors::GitError;
use crate::models::{BackupRepository, Credentials};
use async_trait::async_trait;
use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{
    AnnotatedCommit, Cred, CredentialType, ErrorCode, FetchOptions, RemoteCallbacks, Repository,
};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

/// Remote name used for every working copy
const ORIGIN: &str = "origin";

/// Credential callbacks are retried by libgit2 on rejection; cap them
const MAX_AUTH_ATTEMPTS: usize = 3;

/// What a pull did to the working copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// No local copy existed; the remote was cloned
    Cloned,
    /// The local branch already matched the remote
    UpToDate,
    /// The local branch was advanced to the remote head
    FastForwarded,
}

impl PullOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PullOutcome::Cloned => "cloned",
            PullOutcome::UpToDate => "up_to_date",
            PullOutcome::FastForwarded => "fast_forwarded",
        }
    }
}

impl fmt::Display for PullOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Seam between the pipeline and git
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GitAccess: Send + Sync {
    /// Bring the repository's local copy in line with its remote, cloning
    /// it first when absent. "Already up to date" is a success.
    async fn pull(&self, repository: &BackupRepository) -> Result<PullOutcome, GitError>;
}

/// libgit2 implementation of [`GitAccess`]
#[derive(Debug, Clone, Default)]
pub struct Git2Client;

impl Git2Client {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl GitAccess for Git2Client {
    #[instrument(skip(self, repository), fields(repository = %repository.name))]
    async fn pull(&self, repository: &BackupRepository) -> Result<PullOutcome, GitError> {
        let url = repository.remote_url.clone();
        let path = repository.local_path.clone();
        let credentials = repository.credentials.clone();

        let outcome = tokio::task::spawn_blocking(move || pull_blocking(&url, &path, &credentials))
            .await
            .map_err(|e| GitError::TaskFailed(e.to_string()))??;

        info!(outcome = %outcome, "Pull completed");
        Ok(outcome)
    }
}

fn pull_blocking(url: &str, path: &Path, credentials: &Credentials) -> Result<PullOutcome, GitError> {
    if !path.join(".git").exists() {
        clone(url, path, credentials)?;
        return Ok(PullOutcome::Cloned);
    }

    let repo = Repository::open(path).map_err(|e| GitError::OpenFailed {
        path: path.display().to_string(),
        reason: e.message().to_string(),
    })?;

    fetch(&repo, credentials)?;
    fast_forward(&repo)
}

fn clone(url: &str, path: &Path, credentials: &Credentials) -> Result<(), GitError> {
    info!(url = %url, path = %path.display(), "Cloning repository");

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| GitError::CloneFailed {
            url: url.to_string(),
            reason: format!("cannot create '{}': {}", parent.display(), e),
        })?;
    }

    RepoBuilder::new()
        .fetch_options(fetch_options(credentials))
        .clone(url, path)
        .map_err(|e| GitError::CloneFailed {
            url: url.to_string(),
            reason: e.message().to_string(),
        })?;
    Ok(())
}

fn fetch(repo: &Repository, credentials: &Credentials) -> Result<(), GitError> {
    let fetch_failed = |e: git2::Error| GitError::FetchFailed {
        remote: ORIGIN.to_string(),
        reason: e.message().to_string(),
    };

    let mut remote = repo.find_remote(ORIGIN).map_err(fetch_failed)?;
    let mut options = fetch_options(credentials);
    remote
        .fetch(&[] as &[&str], Some(&mut options), None)
        .map_err(fetch_failed)?;

    debug!(
        received_objects = remote.stats().received_objects(),
        "Fetched from origin"
    );
    Ok(())
}

/// Advance the checked-out branch to `origin/<branch>` if that is a fast-forward
fn fast_forward(repo: &Repository) -> Result<PullOutcome, GitError> {
    let merge_failed = |e: git2::Error| GitError::MergeFailed(e.message().to_string());

    let branch_ref = head_branch_ref(repo)?;
    let branch = branch_ref.trim_start_matches("refs/heads/").to_string();
    let remote_ref = format!("refs/remotes/{}/{}", ORIGIN, branch);

    let upstream = match repo.find_reference(&remote_ref) {
        Ok(reference) => reference,
        // Remote has no such branch yet (empty remote)
        Err(e) if e.code() == ErrorCode::NotFound => return Ok(PullOutcome::UpToDate),
        Err(e) => return Err(merge_failed(e)),
    };
    let upstream: AnnotatedCommit<'_> = repo
        .reference_to_annotated_commit(&upstream)
        .map_err(merge_failed)?;

    let (analysis, _) = repo.merge_analysis(&[&upstream]).map_err(merge_failed)?;

    if analysis.is_up_to_date() {
        debug!(branch = %branch, "Already up to date");
        return Ok(PullOutcome::UpToDate);
    }

    let message = format!("fast-forward {} to {}", branch, upstream.id());
    if analysis.is_unborn() {
        repo.reference(&branch_ref, upstream.id(), true, &message)
            .map_err(merge_failed)?;
    } else if analysis.is_fast_forward() {
        let mut local = repo.find_reference(&branch_ref).map_err(merge_failed)?;
        local
            .set_target(upstream.id(), &message)
            .map_err(merge_failed)?;
    } else {
        return Err(GitError::NonFastForward { branch });
    }

    repo.set_head(&branch_ref).map_err(merge_failed)?;
    repo.checkout_head(Some(CheckoutBuilder::default().force()))
        .map_err(merge_failed)?;

    info!(branch = %branch, commit = %upstream.id(), "Fast-forwarded");
    Ok(PullOutcome::FastForwarded)
}

/// Full name of the branch HEAD points at, including unborn branches
fn head_branch_ref(repo: &Repository) -> Result<String, GitError> {
    match repo.head() {
        Ok(head) if head.is_branch() => head
            .name()
            .map(str::to_string)
            .ok_or_else(|| GitError::MergeFailed("branch name is not valid UTF-8".to_string())),
        Ok(_) => Err(GitError::DetachedHead),
        Err(e) if e.code() == ErrorCode::UnbornBranch => repo
            .find_reference("HEAD")
            .ok()
            .and_then(|head| head.symbolic_target().map(str::to_string))
            .ok_or(GitError::DetachedHead),
        Err(e) => Err(GitError::MergeFailed(e.message().to_string())),
    }
}

fn fetch_options(credentials: &Credentials) -> FetchOptions<'static> {
    let mut options = FetchOptions::new();
    options.remote_callbacks(remote_callbacks(credentials.clone()));
    options
}

/// Credential selection: SSH key when a key path is set, then
/// username/password, then whatever the transport offers by default.
fn remote_callbacks(credentials: Credentials) -> RemoteCallbacks<'static> {
    let mut callbacks = RemoteCallbacks::new();
    let mut attempts = 0;

    callbacks.credentials(move |_url, username_from_url, allowed| {
        attempts += 1;
        if attempts > MAX_AUTH_ATTEMPTS {
            return Err(git2::Error::from_str("authentication rejected by remote"));
        }

        if !credentials.key_path.is_empty() && allowed.contains(CredentialType::SSH_KEY) {
            let key_path = PathBuf::from(&credentials.key_path);
            return Cred::ssh_key(username_from_url.unwrap_or("git"), None, &key_path, None);
        }

        if !credentials.username.is_empty()
            && allowed.contains(CredentialType::USER_PASS_PLAINTEXT)
        {
            return Cred::userpass_plaintext(&credentials.username, &credentials.password);
        }

        if allowed.contains(CredentialType::USERNAME) {
            return Cred::username(username_from_url.unwrap_or("git"));
        }

        Cred::default()
    });

    callbacks
}
