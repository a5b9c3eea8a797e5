use std::{
    env,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};

/// Server settings, read once at startup from the environment.
#[derive(Clone, Debug)]
pub struct Settings {
    /// root directory under which every `<owner-npub>/<repo>.git` lives
    pub repo_root: PathBuf,
    /// public domain the server is reachable on, eg. `git.example.org`
    pub domain: String,
    pub tor_enabled: bool,
    pub onion_address: Option<String>,
    pub ssh_attestation_lookup_secret: Option<String>,
    pub max_repos_per_user: Option<u32>,
    pub max_disk_quota_per_user: Option<u64>,
    /// relays consulted when an announcement carries no relay hints
    pub relay_default_set: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            repo_root: PathBuf::from("/repos"),
            domain: "localhost".to_string(),
            tor_enabled: false,
            onion_address: None,
            ssh_attestation_lookup_secret: None,
            max_repos_per_user: None,
            max_disk_quota_per_user: None,
            relay_default_set: if env::var("GITREPUBLIC_TEST").is_ok() {
                vec![]
            } else {
                vec![
                    "wss://relay.damus.io".to_string(),
                    "wss://nos.lol".to_string(),
                ]
            },
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let mut settings = Settings::default();
        if let Ok(root) = env::var("GIT_REPO_ROOT") {
            settings.repo_root = PathBuf::from(root);
        }
        if let Ok(domain) = env::var("GIT_DOMAIN") {
            settings.domain = domain;
        }
        settings.tor_enabled = env::var("TOR_ENABLED").is_ok_and(|v| v == "1" || v == "true");
        if settings.tor_enabled {
            settings.onion_address = resolve_onion_address()?;
        }
        settings.ssh_attestation_lookup_secret = env::var("SSH_ATTESTATION_LOOKUP_SECRET").ok();
        if let Ok(max) = env::var("MAX_REPOS_PER_USER") {
            settings.max_repos_per_user =
                Some(max.parse().context("MAX_REPOS_PER_USER is not a number")?);
        }
        if let Ok(max) = env::var("MAX_DISK_QUOTA_PER_USER") {
            settings.max_disk_quota_per_user = Some(
                max.parse()
                    .context("MAX_DISK_QUOTA_PER_USER is not a number")?,
            );
        }
        Ok(settings)
    }

    /// Base URL requests are expected to be signed against, eg.
    /// `https://git.example.org`.
    pub fn public_url_base(&self) -> String {
        if self.domain.starts_with("http://") || self.domain.starts_with("https://") {
            self.domain.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", self.domain)
        }
    }

    /// Clone-url prefixes that identify this server, used to subtract
    /// ourselves from a mirror fan-out list.
    pub fn local_url_prefixes(&self) -> Vec<String> {
        let mut prefixes = vec![
            self.public_url_base(),
            format!("http://{}", self.domain),
        ];
        if let Some(onion) = &self.onion_address {
            prefixes.push(format!("http://{onion}"));
        }
        prefixes
    }

    pub fn cache_db_path(&self) -> PathBuf {
        self.repo_root.join(".event-cache.lmdb")
    }
}

fn resolve_onion_address() -> Result<Option<String>> {
    if let Ok(addr) = env::var("TOR_ONION_ADDRESS") {
        return Ok(Some(addr));
    }
    if let Ok(hostname_file) = env::var("TOR_HOSTNAME_FILE") {
        let addr = std::fs::read_to_string(Path::new(&hostname_file))
            .context("TOR_HOSTNAME_FILE is set but could not be read")?;
        return Ok(Some(addr.trim().to_string()));
    }
    Ok(None)
}
