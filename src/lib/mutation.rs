use std::{
    collections::HashMap,
    path::{Component, Path, PathBuf},
    sync::{Arc, LazyLock, Mutex},
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Result};
use nostr::{Event, Filter, JsonUtil};
use regex::Regex;
use tracing::{debug, info};

use crate::{
    cache::EventCache,
    client::Connect,
    config::Settings,
    git_events::RepoEventRecord,
    git::{
        assert_strictly_below,
        worktree::{validate_branch_name, WorktreeEngine, WorktreeGuard},
        Repo, RepoActions, RepoPath, COMMIT_SIGNATURES_FILE, REPO_EVENTS_FILE,
    },
    policy::PolicyResolver,
    signer::{append_event_line, message_with_trailer, outbox_relays, CommitSignature, Signer},
};

pub const MAX_COMMIT_MESSAGE_LEN: usize = 1000;
pub const MAX_FILE_SIZE: usize = 500 * 1024 * 1024;
pub const MAX_FILE_PATH_LEN: usize = 4096;

const BRANCHES_MEMO_TTL: Duration = Duration::from_secs(60);

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$").expect("valid regex")
});

#[derive(Clone)]
pub struct CommitOptions {
    pub author_name: String,
    pub author_email: String,
    pub message: String,
}

pub struct CommitOutcome {
    pub commit_id: String,
    pub signature: Option<Event>,
}

/// Worktree-backed mutations against a bare repository. One in-flight
/// mutation per `(repo, branch)`; the worktree engine's lock provides the
/// exclusion.
pub struct FileManager {
    engine: Arc<WorktreeEngine>,
    policy: Arc<PolicyResolver>,
    client: Arc<dyn Connect>,
    cache: Arc<EventCache>,
    settings: Arc<Settings>,
    branches_memo: Mutex<HashMap<PathBuf, (Vec<String>, Instant)>>,
}

impl FileManager {
    pub fn new(
        engine: Arc<WorktreeEngine>,
        policy: Arc<PolicyResolver>,
        client: Arc<dyn Connect>,
        cache: Arc<EventCache>,
        settings: Arc<Settings>,
    ) -> Self {
        FileManager {
            engine,
            policy,
            client,
            cache,
            settings,
            branches_memo: Mutex::new(HashMap::new()),
        }
    }

    pub async fn write_file(
        &self,
        repo_path: &RepoPath,
        branch: &str,
        file_path: &str,
        content: &[u8],
        opts: &CommitOptions,
        signer: Option<&Signer>,
    ) -> Result<CommitOutcome> {
        validate_commit_options(opts)?;
        let rel = validate_file_path(file_path)?;
        if content.len() > MAX_FILE_SIZE {
            bail!("file content exceeds {MAX_FILE_SIZE} bytes");
        }

        let guard = self.engine.acquire(repo_path, branch).await?;
        let outcome = self
            .commit_in_worktree(repo_path, &guard, opts, signer, |worktree| {
                let absolute = worktree.join(&rel);
                assert_strictly_below(&absolute, worktree)?;
                if let Some(parent) = absolute.parent() {
                    std::fs::create_dir_all(parent)
                        .context("failed to create parent directories")?;
                }
                std::fs::write(&absolute, content).context("failed to write file")?;
                Ok(vec![rel.clone()])
            })
            .await;
        self.engine.release(guard).await?;
        outcome
    }

    pub async fn delete_file(
        &self,
        repo_path: &RepoPath,
        branch: &str,
        file_path: &str,
        opts: &CommitOptions,
        signer: Option<&Signer>,
    ) -> Result<CommitOutcome> {
        validate_commit_options(opts)?;
        let rel = validate_file_path(file_path)?;

        let guard = self.engine.acquire(repo_path, branch).await?;
        let outcome = self
            .commit_in_worktree(repo_path, &guard, opts, signer, |worktree| {
                let absolute = worktree.join(&rel);
                assert_strictly_below(&absolute, worktree)?;
                if !absolute.is_file() {
                    bail!("file does not exist on this branch");
                }
                std::fs::remove_file(&absolute).context("failed to remove file")?;
                Ok(vec![rel.clone()])
            })
            .await;
        self.engine.release(guard).await?;
        outcome
    }

    /// Create `new_branch`. An empty repository takes the orphan path and
    /// gets its bare HEAD updated; otherwise the branch starts at the tip
    /// of `from_branch` (default branch when unset).
    pub async fn create_branch(
        &self,
        repo_path: &RepoPath,
        new_branch: &str,
        from_branch: Option<&str>,
    ) -> Result<()> {
        validate_branch_name(new_branch)?;
        let repo = Repo::open(repo_path)?;

        if !repo.has_branches()? {
            let guard = self.engine.acquire(repo_path, new_branch).await?;
            self.engine.release(guard).await?;
            self.invalidate_branches(repo_path);
            return Ok(());
        }

        let source = match from_branch {
            Some(branch) => {
                validate_branch_name(branch)?;
                branch.to_string()
            }
            None => repo.default_branch()?,
        };
        let tip = repo.tip_of_branch(&source)?;
        let commit = repo
            .git_repo
            .find_commit(git2::Oid::from_str(&tip)?)
            .context("source branch tip is not a commit")?;
        repo.git_repo
            .branch(new_branch, &commit, false)
            .context(format!("failed to create branch {new_branch}"))?;
        self.invalidate_branches(repo_path);
        Ok(())
    }

    pub async fn delete_branch(&self, repo_path: &RepoPath, branch: &str) -> Result<()> {
        validate_branch_name(branch)?;
        let repo = Repo::open(repo_path)?;
        if repo.default_branch()? == branch {
            bail!("refusing to delete the default branch");
        }

        let deleted = repo
            .git_repo
            .find_branch(branch, git2::BranchType::Local)
            .and_then(|mut b| b.delete());
        if deleted.is_err() {
            repo.git_repo
                .find_reference(&format!("refs/heads/{branch}"))
                .and_then(|mut r| r.delete())
                .context(format!("failed to delete branch {branch}"))?;
        }
        self.invalidate_branches(repo_path);
        Ok(())
    }

    pub async fn create_tag(
        &self,
        repo_path: &RepoPath,
        tag_name: &str,
        from_branch: Option<&str>,
        message: Option<&str>,
        opts: &CommitOptions,
    ) -> Result<()> {
        validate_branch_name(tag_name)?;
        let repo = Repo::open(repo_path)?;
        let source = match from_branch {
            Some(branch) => {
                validate_branch_name(branch)?;
                branch.to_string()
            }
            None => repo.default_branch()?,
        };
        let tip = repo.tip_of_branch(&source)?;
        let object = repo
            .git_repo
            .find_object(git2::Oid::from_str(&tip)?, None)
            .context("source branch tip not found")?;
        match message {
            Some(message) => {
                let tagger = git2::Signature::now(&opts.author_name, &opts.author_email)
                    .context("invalid tagger identity")?;
                repo.git_repo
                    .tag(tag_name, &object, &tagger, message, false)
                    .context(format!("failed to create tag {tag_name}"))?;
            }
            None => {
                repo.git_repo
                    .tag_lightweight(tag_name, &object, false)
                    .context(format!("failed to create tag {tag_name}"))?;
            }
        }
        Ok(())
    }

    /// Journal an announcement or transfer observed for this repository
    /// into `nostr/repo-events.jsonl` on the default branch, one
    /// `{type, timestamp, event}` line per event. The journal is what the
    /// policy resolver falls back to when relays are unreachable.
    pub async fn record_repo_event(
        &self,
        repo_path: &RepoPath,
        event_type: &str,
        event: &Event,
    ) -> Result<CommitOutcome> {
        let branch = Repo::open(repo_path)?.default_branch()?;
        let record = RepoEventRecord {
            event_type: event_type.to_string(),
            timestamp: nostr_sdk::Timestamp::now().as_u64(),
            event: serde_json::from_str(&event.as_json()).context("event is not json")?,
        };
        let line = serde_json::to_string(&record).context("journal record is not serializable")?;
        let opts = CommitOptions {
            author_name: "gitrepublic".to_string(),
            author_email: format!("git@{}", self.settings.domain),
            message: format!("record repository {event_type}"),
        };

        let guard = self.engine.acquire(repo_path, &branch).await?;
        let outcome = self
            .commit_in_worktree(repo_path, &guard, &opts, None, |worktree| {
                let path = worktree.join(REPO_EVENTS_FILE);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .context("failed to create journal directory")?;
                }
                let mut contents = std::fs::read_to_string(&path).unwrap_or_default();
                if !contents.is_empty() && !contents.ends_with('\n') {
                    contents.push('\n');
                }
                contents.push_str(&line);
                contents.push('\n');
                std::fs::write(&path, contents).context("failed to append journal line")?;
                Ok(vec![PathBuf::from(REPO_EVENTS_FILE)])
            })
            .await;
        self.engine.release(guard).await?;
        outcome
    }

    pub fn list_branches(&self, repo_path: &RepoPath) -> Result<Vec<String>> {
        if let Some((branches, at)) = self
            .branches_memo
            .lock()
            .unwrap()
            .get(&repo_path.bare_dir)
        {
            if at.elapsed() <= BRANCHES_MEMO_TTL {
                return Ok(branches.clone());
            }
        }
        let branches = Repo::open(repo_path)?.local_branch_names()?;
        self.branches_memo
            .lock()
            .unwrap()
            .insert(repo_path.bare_dir.clone(), (branches.clone(), Instant::now()));
        Ok(branches)
    }

    fn invalidate_branches(&self, repo_path: &RepoPath) {
        self.branches_memo
            .lock()
            .unwrap()
            .remove(&repo_path.bare_dir);
    }

    async fn commit_in_worktree<F>(
        &self,
        repo_path: &RepoPath,
        guard: &WorktreeGuard,
        opts: &CommitOptions,
        signer: Option<&Signer>,
        mutate: F,
    ) -> Result<CommitOutcome>
    where
        F: FnOnce(&Path) -> Result<Vec<PathBuf>>,
    {
        let changed = mutate(&guard.path)?;

        let mut signature = match signer {
            Some(signer) => {
                let subject = opts.message.lines().next().unwrap_or_default();
                let signature = signer
                    .sign(subject, &opts.author_name, &opts.author_email)
                    .await?;
                append_event_line(
                    &guard.path,
                    COMMIT_SIGNATURES_FILE,
                    signature.event.as_json(),
                )
                .await?;
                Some(signature)
            }
            None => None,
        };

        let message = match &signature {
            Some(signature) => message_with_trailer(&opts.message, &signature.event),
            None => opts.message.clone(),
        };

        let worktree_repo =
            git2::Repository::open(&guard.path).context("failed to open worktree")?;
        let mut index = worktree_repo.index().context("failed to open index")?;
        for path in &changed {
            if guard.path.join(path).exists() {
                index.add_path(path).context("failed to stage file")?;
            } else {
                index.remove_path(path).context("failed to stage removal")?;
            }
        }
        if signature.is_some() {
            index
                .add_path(Path::new(COMMIT_SIGNATURES_FILE))
                .context("failed to stage signature journal")?;
        }
        index.write().context("failed to write index")?;

        let tree_id = index.write_tree().context("failed to write tree")?;
        let tree = worktree_repo.find_tree(tree_id)?;
        let author = git2::Signature::now(&opts.author_name, &opts.author_email)
            .context("invalid author identity")?;
        let parents = match worktree_repo.head() {
            Ok(head) => vec![head.peel_to_commit().context("HEAD is not a commit")?],
            Err(_) => vec![],
        };
        let parent_refs: Vec<&git2::Commit> = parents.iter().collect();
        let commit_id = worktree_repo
            .commit(Some("HEAD"), &author, &author, &message, &tree, &parent_refs)
            .context("failed to commit")?
            .to_string();

        if let (Some(signature), Some(signer)) = (signature.as_mut(), signer) {
            signature.set_commit_hash(&commit_id, signer).await?;
            self.publish_if_public(repo_path, signature.clone());
        }

        info!(repo = %repo_path.name, commit = %commit_id, "mutation committed");
        Ok(CommitOutcome {
            commit_id,
            signature: signature.map(|s| s.event),
        })
    }

    /// Publishing is advisory: the signature is already persisted in the
    /// worktree journal, so relay failures only get logged.
    fn publish_if_public(&self, repo_path: &RepoPath, signature: CommitSignature) {
        let policy = self.policy.clone();
        let client = self.client.clone();
        let cache = self.cache.clone();
        let settings = self.settings.clone();
        let owner = repo_path.owner;
        let repo_name = repo_path.name.clone();
        tokio::spawn(async move {
            match policy.is_private(&owner, &repo_name, None).await {
                Ok(false) => {}
                _ => return,
            }
            let default_relays: Vec<nostr_sdk::RelayUrl> = settings
                .relay_default_set
                .iter()
                .filter_map(|r| nostr_sdk::RelayUrl::parse(r).ok())
                .collect();
            let relay_list = cache
                .events(
                    default_relays.clone(),
                    vec![Filter::new().kind(nostr_sdk::Kind::RelayList).author(owner)],
                )
                .await
                .ok()
                .and_then(|events| events.into_iter().next());
            let mut relays = relay_list
                .as_ref()
                .map(|event| outbox_relays(event))
                .unwrap_or_default();
            for relay in default_relays {
                if !relays.contains(&relay) {
                    relays.push(relay);
                }
            }
            match client.publish_event(relays, &signature.event).await {
                Ok(_) => cache.invalidate_pubkey(&signature.event.pubkey).await,
                Err(error) => debug!(%error, "commit signature publish failed"),
            }
        });
    }
}

fn validate_commit_options(opts: &CommitOptions) -> Result<()> {
    if opts.message.trim().is_empty() {
        bail!("commit message must not be empty");
    }
    if opts.message.len() > MAX_COMMIT_MESSAGE_LEN {
        bail!("commit message exceeds {MAX_COMMIT_MESSAGE_LEN} characters");
    }
    if opts.author_name.trim().is_empty() {
        bail!("author name must not be empty");
    }
    if !EMAIL_RE.is_match(&opts.author_email) {
        bail!("author email is not valid");
    }
    Ok(())
}

fn validate_file_path(file_path: &str) -> Result<PathBuf> {
    if file_path.is_empty() || file_path.len() > MAX_FILE_PATH_LEN {
        bail!("file path must be 1-{MAX_FILE_PATH_LEN} characters");
    }
    if file_path.contains('\0') || file_path.chars().any(char::is_control) {
        bail!("file path contains control characters");
    }
    let path = Path::new(file_path);
    if path.is_absolute() {
        bail!("file path must be relative");
    }
    for component in path.components() {
        match component {
            Component::Normal(_) => {}
            _ => bail!("file path must not contain '.' or '..' components"),
        }
    }
    Ok(path.to_path_buf())
}
