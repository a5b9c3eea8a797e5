use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use anyhow::Result;
use nostr::{Filter, JsonUtil, PublicKey};
use nostr_sdk::{Alphabet, Kind, RelayUrl, SingleLetterTag};
use tracing::debug;

use crate::{
    cache::EventCache,
    config::Settings,
    git::{Repo, RepoActions, REPO_EVENTS_FILE},
    git_events::{
        announcement_coordinate, BranchPolicy, BranchProtection, MaintainersList,
        OwnershipTransfer, RepoEventRecord, KIND_BRANCH_PROTECTION, KIND_MAINTAINERS,
        KIND_OWNERSHIP_TRANSFER,
    },
    repo_ref::RepoAnnouncement,
};

const OWNER_MEMO_TTL: Duration = Duration::from_secs(5 * 60);

/// Everything the gateway needs to authorize one request against one
/// repository, resolved in a single pass.
pub struct RepoPolicy {
    pub announcement: Option<RepoAnnouncement>,
    pub current_owner: PublicKey,
    pub maintainers: Vec<PublicKey>,
    pub protection: Option<BranchProtection>,
    pub private: bool,
}

impl RepoPolicy {
    pub fn is_maintainer(&self, actor: &PublicKey) -> bool {
        self.maintainers.contains(actor)
    }

    pub fn can_push(&self, actor: &PublicKey) -> bool {
        *actor == self.current_owner || self.is_maintainer(actor)
    }

    pub fn can_view(&self, actor: Option<&PublicKey>) -> bool {
        if !self.private {
            return true;
        }
        match actor {
            Some(actor) => self.can_push(actor),
            None => false,
        }
    }

    pub fn can_push_to_branch(&self, actor: &PublicKey, update: &BranchUpdate) -> bool {
        branch_push_allowed(
            actor,
            &self.current_owner,
            self.is_maintainer(actor),
            self.protection
                .as_ref()
                .and_then(|p| p.policy_for(&update.branch)),
            update,
        )
    }
}

/// One ref update extracted from a receive-pack preamble.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BranchUpdate {
    pub branch: String,
    pub is_delete: bool,
    pub is_force: bool,
}

/// Branch-protection decision. The owner is always allowed; maintainers are
/// allowed unless a listed policy withholds the specific operation; everyone
/// else is denied on listed branches (and cannot reach this point for
/// unlisted ones, since pushing at all requires maintainership).
pub fn branch_push_allowed(
    actor: &PublicKey,
    owner: &PublicKey,
    is_maintainer: bool,
    policy: Option<BranchPolicy>,
    update: &BranchUpdate,
) -> bool {
    if actor == owner {
        return true;
    }
    match policy {
        None => is_maintainer,
        Some(policy) => {
            if policy.require_maintainer && !is_maintainer {
                return false;
            }
            if !is_maintainer {
                return false;
            }
            if update.is_delete && !policy.allow_delete {
                return false;
            }
            if update.is_force && !policy.allow_force_push {
                return false;
            }
            true
        }
    }
}

/// Walk the ordered transfer chain from the original owner. A transfer
/// applies only when signed by whoever owns the repository at that point in
/// the chain; self-transfers are valid proofs but change nothing.
pub fn evaluate_ownership_chain(
    original_owner: &PublicKey,
    mut transfers: Vec<OwnershipTransfer>,
) -> PublicKey {
    transfers.sort_by_key(|t| t.event.created_at);
    let mut owner = *original_owner;
    for transfer in transfers {
        if transfer.event.pubkey != owner {
            continue;
        }
        if !transfer.is_self_transfer() {
            owner = transfer.new_owner;
        }
    }
    owner
}

pub struct PolicyResolver {
    cache: Arc<EventCache>,
    settings: Arc<Settings>,
    owner_memo: Mutex<HashMap<(PublicKey, String), (PublicKey, Instant)>>,
}

impl PolicyResolver {
    pub fn new(cache: Arc<EventCache>, settings: Arc<Settings>) -> Self {
        PolicyResolver {
            cache,
            settings,
            owner_memo: Mutex::new(HashMap::new()),
        }
    }

    fn default_relays(&self) -> Vec<RelayUrl> {
        self.settings
            .relay_default_set
            .iter()
            .filter_map(|r| RelayUrl::parse(r).ok())
            .collect()
    }

    pub async fn announcement(
        &self,
        original_owner: &PublicKey,
        repo_name: &str,
        repo: Option<&Repo>,
    ) -> Result<Option<RepoAnnouncement>> {
        let filter = Filter::new()
            .kind(Kind::GitRepoAnnouncement)
            .author(*original_owner)
            .identifier(repo_name);
        match self
            .cache
            .events(self.default_relays(), vec![filter])
            .await
        {
            Ok(events) => Ok(events
                .into_iter()
                .find_map(|e| RepoAnnouncement::try_from(e).ok())),
            Err(error) => {
                debug!(%error, "relays unreachable, trying announcement from repository");
                Ok(repo.and_then(|r| announcement_from_repo(r, original_owner, repo_name)))
            }
        }
    }

    pub async fn current_owner(
        &self,
        original_owner: &PublicKey,
        repo_name: &str,
    ) -> Result<PublicKey> {
        let memo_key = (*original_owner, repo_name.to_string());
        if let Some((owner, at)) = self.owner_memo.lock().unwrap().get(&memo_key) {
            if at.elapsed() <= OWNER_MEMO_TTL {
                return Ok(*owner);
            }
        }

        let coordinate = announcement_coordinate(original_owner, repo_name);
        let filter = Filter::new()
            .kind(KIND_OWNERSHIP_TRANSFER)
            .custom_tag(SingleLetterTag::lowercase(Alphabet::A), coordinate.clone());
        let transfers = self
            .cache
            .events(self.default_relays(), vec![filter])
            .await
            .unwrap_or_default()
            .into_iter()
            .filter_map(|e| OwnershipTransfer::try_from(e).ok())
            .filter(|t| t.coordinate == coordinate)
            .collect();

        let owner = evaluate_ownership_chain(original_owner, transfers);
        self.owner_memo
            .lock()
            .unwrap()
            .insert(memo_key, (owner, Instant::now()));
        Ok(owner)
    }

    pub async fn maintainers(
        &self,
        original_owner: &PublicKey,
        current_owner: &PublicKey,
        repo_name: &str,
    ) -> Result<Vec<PublicKey>> {
        let coordinate = announcement_coordinate(original_owner, repo_name);
        let filter = Filter::new()
            .kind(KIND_MAINTAINERS)
            .author(*current_owner)
            .custom_tag(SingleLetterTag::lowercase(Alphabet::A), coordinate);
        let events = self
            .cache
            .events(self.default_relays(), vec![filter])
            .await
            .unwrap_or_default();
        Ok(events
            .into_iter()
            .filter(|e| e.pubkey == *current_owner)
            .find_map(|e| MaintainersList::try_from(e).ok())
            .map(|list| list.maintainers)
            .unwrap_or_default())
    }

    pub async fn branch_protection(
        &self,
        original_owner: &PublicKey,
        current_owner: &PublicKey,
        repo_name: &str,
    ) -> Result<Option<BranchProtection>> {
        let coordinate = announcement_coordinate(original_owner, repo_name);
        let filter = Filter::new()
            .kind(KIND_BRANCH_PROTECTION)
            .author(*current_owner)
            .custom_tag(SingleLetterTag::lowercase(Alphabet::A), coordinate);
        let events = self
            .cache
            .events(self.default_relays(), vec![filter])
            .await
            .unwrap_or_default();
        Ok(events
            .into_iter()
            .filter(|e| e.pubkey == *current_owner)
            .find_map(|e| BranchProtection::try_from(e).ok()))
    }

    pub async fn is_private(
        &self,
        original_owner: &PublicKey,
        repo_name: &str,
        repo: Option<&Repo>,
    ) -> Result<bool> {
        Ok(self
            .announcement(original_owner, repo_name, repo)
            .await?
            .is_some_and(|a| a.private))
    }

    /// Resolve everything needed to authorize a request in one pass.
    pub async fn repo_policy(
        &self,
        original_owner: &PublicKey,
        repo_name: &str,
        repo: Option<&Repo>,
    ) -> Result<RepoPolicy> {
        let announcement = self.announcement(original_owner, repo_name, repo).await?;
        let current_owner = self.current_owner(original_owner, repo_name).await?;
        let maintainers = self
            .maintainers(original_owner, &current_owner, repo_name)
            .await?;
        let protection = self
            .branch_protection(original_owner, &current_owner, repo_name)
            .await?;
        let private = announcement.as_ref().is_some_and(|a| a.private);
        Ok(RepoPolicy {
            announcement,
            current_owner,
            maintainers,
            protection,
            private,
        })
    }

    pub fn profile_name(&self, pubkey: &PublicKey) -> Option<String> {
        self.cache.cached_profile_name(pubkey)
    }
}

/// Recover the announcement from the repository itself when relays are
/// unreachable: the newest announcement line of the repo-events journal on
/// the default branch. Any validation failure is "no signal", never a
/// negative answer.
pub fn announcement_from_repo(
    repo: &Repo,
    original_owner: &PublicKey,
    repo_name: &str,
) -> Option<RepoAnnouncement> {
    let default_branch = repo.default_branch().ok()?;
    let journal = repo.show_file(&default_branch, REPO_EVENTS_FILE).ok()?;
    let mut latest: Option<RepoAnnouncement> = None;
    for line in journal.lines() {
        let Ok(record) = serde_json::from_str::<RepoEventRecord>(line) else {
            continue;
        };
        if record.event_type != "announcement" {
            continue;
        }
        let Ok(event) = nostr::Event::from_json(record.event.to_string()) else {
            continue;
        };
        if event.verify().is_err() || event.pubkey != *original_owner {
            continue;
        }
        let Ok(announcement) = RepoAnnouncement::try_from(event) else {
            continue;
        };
        if announcement.identifier != repo_name {
            continue;
        }
        if latest
            .as_ref()
            .map_or(true, |l| l.event.created_at < announcement.event.created_at)
        {
            latest = Some(announcement);
        }
    }
    latest
}
