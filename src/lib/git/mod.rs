use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use nostr::{FromBech32, PublicKey};

pub mod worktree;

/// Journal files kept under `nostr/` inside the working tree.
pub const COMMIT_SIGNATURES_FILE: &str = "nostr/commit-signatures.jsonl";
pub const REPO_EVENTS_FILE: &str = "nostr/repo-events.jsonl";

pub const REPO_NAME_MAX_LEN: usize = 100;

/// `<repo-root>/<owner-npub>/<repo-name>.git` and friends, with every
/// segment validated before any path is touched.
#[derive(Clone, Debug)]
pub struct RepoPath {
    pub owner: PublicKey,
    pub owner_npub: String,
    pub name: String,
    pub owner_dir: PathBuf,
    pub bare_dir: PathBuf,
    pub worktrees_dir: PathBuf,
}

impl RepoPath {
    pub fn resolve(repo_root: &Path, owner_npub: &str, name: &str) -> Result<Self> {
        let owner = PublicKey::from_bech32(owner_npub)
            .context("owner path segment is not a valid npub")?;
        validate_repo_name(name)?;

        let owner_dir = repo_root.join(owner_npub);
        let bare_dir = owner_dir.join(format!("{name}.git"));
        let worktrees_dir = owner_dir.join(format!("{name}.worktrees"));
        assert_strictly_below(&bare_dir, repo_root)?;
        assert_strictly_below(&worktrees_dir, &owner_dir)?;

        Ok(RepoPath {
            owner,
            owner_npub: owner_npub.to_string(),
            name: name.to_string(),
            owner_dir,
            bare_dir,
            worktrees_dir,
        })
    }

    pub fn exists(&self) -> bool {
        self.bare_dir.is_dir()
    }

    pub fn worktree_dir(&self, branch: &str) -> Result<PathBuf> {
        let path = self.worktrees_dir.join(branch);
        assert_strictly_below(&path, &self.worktrees_dir)?;
        Ok(path)
    }
}

pub fn validate_repo_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > REPO_NAME_MAX_LEN {
        bail!("repository name must be 1-{REPO_NAME_MAX_LEN} characters");
    }
    if name == "." || name == ".." {
        bail!("repository name must not be a relative path segment");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        bail!("repository name may only contain [A-Za-z0-9._-]");
    }
    Ok(())
}

/// Lexical containment check: `child`, after normalization, must sit
/// strictly below `root`. Rejects any `..` component outright.
pub fn assert_strictly_below(child: &Path, root: &Path) -> Result<()> {
    let mut normalized = PathBuf::new();
    for component in child.components() {
        match component {
            Component::ParentDir => bail!("path escapes its containing directory"),
            Component::CurDir => {}
            other => normalized.push(other),
        }
    }
    if !normalized.starts_with(root) || normalized == root {
        bail!("path resolves outside its containing directory");
    }
    Ok(())
}

pub struct Repo {
    pub git_repo: git2::Repository,
    pub path: RepoPath,
}

// git2::Repository is Send but not Sync (it doesn't serialize access to the
// underlying libgit2 handle). Each `Repo` is opened fresh per request and
// never shared for concurrent access, so it's safe to hand out `&Repo`
// across await points / spawned tasks.
unsafe impl Sync for Repo {}

impl Repo {
    pub fn open(path: &RepoPath) -> Result<Self> {
        Ok(Self {
            git_repo: git2::Repository::open_bare(&path.bare_dir)
                .context("failed to open bare repository")?,
            path: path.clone(),
        })
    }
}

pub trait RepoActions {
    fn local_branch_names(&self) -> Result<Vec<String>>;
    fn has_branches(&self) -> Result<bool>;
    fn default_branch(&self) -> Result<String>;
    fn tip_of_branch(&self, branch: &str) -> Result<String>;
    /// Contents of `path` on `branch`, read straight from the object store
    /// without touching any worktree.
    fn show_file(&self, branch: &str, path: &str) -> Result<String>;
    fn is_fast_forward(&self, old_oid: &str, new_oid: &str) -> Result<bool>;
    /// `http.receivepack = true` on the bare repo so the CGI accepts
    /// pushes. Setting it again is a no-op.
    fn ensure_receive_pack_enabled(&self) -> Result<()>;
}

impl RepoActions for Repo {
    fn local_branch_names(&self) -> Result<Vec<String>> {
        let local_branches = self
            .git_repo
            .branches(Some(git2::BranchType::Local))
            .context("getting branches should not error even for a blank repository")?;

        let mut branch_names = vec![];
        for iter in local_branches {
            let branch = iter?.0;
            if let Some(name) = branch.name()? {
                branch_names.push(name.to_string());
            }
        }
        Ok(branch_names)
    }

    fn has_branches(&self) -> Result<bool> {
        Ok(!self.local_branch_names()?.is_empty())
    }

    fn default_branch(&self) -> Result<String> {
        if let Ok(head) = self.git_repo.find_reference("HEAD") {
            if let Some(target) = head.symbolic_target() {
                if let Some(name) = target.strip_prefix("refs/heads/") {
                    if self
                        .git_repo
                        .find_branch(name, git2::BranchType::Local)
                        .is_ok()
                    {
                        return Ok(name.to_string());
                    }
                }
            }
        }
        let branches = self.local_branch_names()?;
        for candidate in ["main", "master"] {
            if branches.contains(&candidate.to_string()) {
                return Ok(candidate.to_string());
            }
        }
        branches
            .first()
            .cloned()
            .context("repository has no branches")
    }

    fn tip_of_branch(&self, branch: &str) -> Result<String> {
        Ok(self
            .git_repo
            .find_branch(branch, git2::BranchType::Local)
            .context(format!("branch {branch} not found"))?
            .get()
            .peel_to_commit()
            .context(format!("branch {branch} has no tip commit"))?
            .id()
            .to_string())
    }

    fn show_file(&self, branch: &str, path: &str) -> Result<String> {
        let object = self
            .git_repo
            .revparse_single(&format!("{branch}:{path}"))
            .context(format!("{path} not found on {branch}"))?;
        let blob = object.peel_to_blob().context("path is not a file")?;
        String::from_utf8(blob.content().to_vec()).context("file is not utf-8")
    }

    fn is_fast_forward(&self, old_oid: &str, new_oid: &str) -> Result<bool> {
        let old = git2::Oid::from_str(old_oid).context("invalid old object id")?;
        let new = git2::Oid::from_str(new_oid).context("invalid new object id")?;
        Ok(self
            .git_repo
            .graph_descendant_of(new, old)
            .unwrap_or(false)
            || old == new)
    }

    fn ensure_receive_pack_enabled(&self) -> Result<()> {
        self.git_repo
            .config()
            .context("failed to open repository config")?
            .set_bool("http.receivepack", true)
            .context("failed to enable http.receivepack")
    }
}

#[cfg(test)]
mod tests {
    use test_utils::*;

    use super::*;

    mod repo_name {
        use super::*;

        #[test]
        fn accepts_typical_names() {
            for name in ["repo", "my-repo", "a.b_c-d", "x"] {
                assert!(validate_repo_name(name).is_ok(), "{name}");
            }
        }

        #[test]
        fn rejects_bad_names() {
            for name in ["", ".", "..", "a/b", "a\\b", "a b", "ü", &"x".repeat(101)] {
                assert!(validate_repo_name(name).is_err(), "{name}");
            }
        }
    }

    mod containment {
        use super::*;

        #[test]
        fn rejects_parent_components() {
            assert!(
                assert_strictly_below(Path::new("/repos/a/../../etc"), Path::new("/repos")).is_err()
            );
        }

        #[test]
        fn rejects_root_itself() {
            assert!(assert_strictly_below(Path::new("/repos"), Path::new("/repos")).is_err());
        }

        #[test]
        fn accepts_descendants() {
            assert!(
                assert_strictly_below(Path::new("/repos/npub/x.git"), Path::new("/repos")).is_ok()
            );
        }
    }

    mod resolve {
        use super::*;

        #[test]
        fn resolves_valid_owner_and_name() {
            let npub = TEST_KEY_1_NPUB.as_str();
            let path = RepoPath::resolve(Path::new("/repos"), npub, "my-repo").unwrap();
            assert_eq!(path.owner, TEST_KEY_1_KEYS.public_key());
            assert_eq!(
                path.bare_dir,
                Path::new("/repos").join(npub).join("my-repo.git")
            );
        }

        #[test]
        fn rejects_non_npub_owner() {
            assert!(RepoPath::resolve(Path::new("/repos"), "alice", "repo").is_err());
            assert!(RepoPath::resolve(
                Path::new("/repos"),
                // an nsec is 32 bytes of bech32 too, but the wrong prefix
                TEST_KEY_1_NSEC,
                "repo"
            )
            .is_err());
        }

        #[test]
        fn worktree_dir_rejects_traversal() {
            let path =
                RepoPath::resolve(Path::new("/repos"), TEST_KEY_1_NPUB.as_str(), "my-repo")
                    .unwrap();
            assert!(path.worktree_dir("../escape").is_err());
            assert!(path.worktree_dir("feature").is_ok());
        }
    }

    mod bare_repo {
        use super::*;

        fn open_scaffolded(scaffold: &ScaffoldedRepo) -> Repo {
            let path = RepoPath::resolve(&scaffold.root, &scaffold.npub, &scaffold.name).unwrap();
            Repo::open(&path).unwrap()
        }

        #[test]
        fn default_branch_follows_head() {
            let scaffold = ScaffoldedRepo::with_initial_commit("main");
            let repo = open_scaffolded(&scaffold);
            assert_eq!(repo.default_branch().unwrap(), "main");
        }

        #[test]
        fn show_file_reads_from_object_store() {
            let scaffold = ScaffoldedRepo::with_initial_commit("main");
            let repo = open_scaffolded(&scaffold);
            assert_eq!(repo.show_file("main", "README.md").unwrap(), "# seeded\n");
            assert!(repo.show_file("main", "missing.txt").is_err());
        }

        #[test]
        fn receive_pack_enable_is_idempotent() {
            let scaffold = ScaffoldedRepo::with_initial_commit("main");
            let repo = open_scaffolded(&scaffold);
            repo.ensure_receive_pack_enabled().unwrap();
            repo.ensure_receive_pack_enabled().unwrap();
        }
    }
}
