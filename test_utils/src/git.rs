use std::path::PathBuf;

use git2::RepositoryInitOptions;
use tempfile::TempDir;

use crate::TEST_KEY_1_NPUB;

/// A bare repository laid out the way the gateway expects
/// (`<root>/<npub>/<name>.git`), on a tempdir that lives as long as the
/// scaffold does.
pub struct ScaffoldedRepo {
    pub root: PathBuf,
    pub npub: String,
    pub name: String,
    _tmp: TempDir,
}

impl ScaffoldedRepo {
    /// A bare repository with no commits and no branches.
    pub fn empty() -> Self {
        let tmp = TempDir::new().expect("tempdir");
        let root = tmp.path().to_path_buf();
        let npub = TEST_KEY_1_NPUB.clone();
        let name = "test-repo".to_string();
        let bare = root.join(&npub).join(format!("{name}.git"));
        git2::Repository::init_opts(
            &bare,
            RepositoryInitOptions::new()
                .bare(true)
                .initial_head("main")
                .mkpath(true),
        )
        .expect("bare repository init");
        ScaffoldedRepo {
            root,
            npub,
            name,
            _tmp: tmp,
        }
    }

    /// A bare repository whose `branch` holds one commit with a seeded
    /// `README.md`.
    pub fn with_initial_commit(branch: &str) -> Self {
        let scaffold = Self::empty();
        let bare = scaffold
            .root
            .join(&scaffold.npub)
            .join(format!("{}.git", scaffold.name));
        let repo = git2::Repository::open_bare(&bare).expect("open bare repository");

        let blob = repo.blob(b"# seeded\n").expect("write blob");
        let mut builder = repo.treebuilder(None).expect("treebuilder");
        builder
            .insert("README.md", blob, 0o100644)
            .expect("insert readme");
        let tree_id = builder.write().expect("write tree");
        let tree = repo.find_tree(tree_id).expect("find tree");
        let signature =
            git2::Signature::now("seeder", "seeder@example.org").expect("signature");
        repo.commit(
            Some(&format!("refs/heads/{branch}")),
            &signature,
            &signature,
            "initial commit",
            &tree,
            &[],
        )
        .expect("seed commit");
        repo.set_head(&format!("refs/heads/{branch}"))
            .expect("set HEAD");
        scaffold
    }
}
