use anyhow::{bail, Context, Result};
use nostr::{Event, PublicKey};
use nostr_sdk::Kind;
use serde::{Deserialize, Serialize};

pub static KIND_COMMIT_SIGNATURE: Kind = Kind::Custom(1640);
pub static KIND_PULL_REQUEST: Kind = Kind::Custom(1618);
pub static KIND_SSH_ATTESTATION: Kind = Kind::Custom(30001);
pub static KIND_MAINTAINERS: Kind = Kind::Custom(30618);
pub static KIND_BRANCH_PROTECTION: Kind = Kind::Custom(30619);
pub static KIND_OWNERSHIP_TRANSFER: Kind = Kind::Custom(30620);
pub static KIND_PUBLIC_MESSAGE: Kind = Kind::Custom(24);

/// Content marker that makes a kind-24 message a write-proof, which is
/// deduplicated as if it were replaceable.
pub static WRITE_PROOF_MARKER: &str = "write-proof";

pub fn tag_value(event: &Event, tag_name: &str) -> Result<String> {
    eprintln!("DEBUG tags: {:?}", event.tags.iter().map(|t| t.as_slice().to_vec()).collect::<Vec<_>>());
    Ok(event
        .tags
        .iter()
        .find(|t| t.as_slice()[0].eq(tag_name))
        .context(format!("tag '{tag_name}' not present"))?
        .as_slice()
        .get(1)
        .context(format!("tag '{tag_name}' has no value"))?
        .clone())
}

/// `a`-tag value referencing a repository announcement:
/// `30617:<owner-hex>:<repo-name>`.
pub fn announcement_coordinate(owner: &PublicKey, identifier: &str) -> String {
    format!(
        "{}:{}:{}",
        Kind::GitRepoAnnouncement.as_u16(),
        owner,
        identifier
    )
}

pub fn event_is_write_proof(event: &Event) -> bool {
    event.kind.eq(&KIND_PUBLIC_MESSAGE) && event.content.contains(WRITE_PROOF_MARKER)
}

fn kind_is_replaceable(kind: Kind) -> bool {
    let n = kind.as_u16();
    n == 0 || n == 3 || (10_000..20_000).contains(&n)
}

fn kind_is_addressable(kind: Kind) -> bool {
    (30_000..40_000).contains(&kind.as_u16())
}

/// Storage identity of an event. Regular events are their own key;
/// replaceable and addressable events collapse onto `(kind, pubkey[, d])`;
/// the repo-policy kinds (maintainers, protection, transfer) collapse onto
/// the announcement they reference; write-proof messages collapse onto
/// `(24, pubkey, "write-proof")`.
pub fn dedup_key(event: &Event) -> String {
    if event_is_write_proof(event) {
        format!("{}:{}:{WRITE_PROOF_MARKER}", event.kind.as_u16(), event.pubkey)
    } else if [KIND_MAINTAINERS, KIND_BRANCH_PROTECTION, KIND_OWNERSHIP_TRANSFER]
        .contains(&event.kind)
    {
        format!(
            "{}:{}:{}",
            event.kind.as_u16(),
            event.pubkey,
            tag_value(event, "a").unwrap_or_default()
        )
    } else if kind_is_addressable(event.kind) {
        format!(
            "{}:{}:{}",
            event.kind.as_u16(),
            event.pubkey,
            event.tags.identifier().unwrap_or_default()
        )
    } else if kind_is_replaceable(event.kind) {
        format!("{}:{}", event.kind.as_u16(), event.pubkey)
    } else {
        event.id.to_string()
    }
}

/// Collapse a multi-relay result set onto one event per dedup key, keeping
/// the maximum `created_at` (ties broken by lowest id, as relays do).
pub fn dedup_events(events: Vec<Event>) -> Vec<Event> {
    let mut winners: std::collections::HashMap<String, Event> = std::collections::HashMap::new();
    for event in events {
        let key = dedup_key(&event);
        match winners.get(&key) {
            Some(existing)
                if existing.created_at > event.created_at
                    || (existing.created_at == event.created_at && existing.id < event.id) => {}
            _ => {
                winners.insert(key, event);
            }
        }
    }
    let mut deduped: Vec<Event> = winners.into_values().collect();
    deduped.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    deduped
}

/// One line of the `nostr/repo-events.jsonl` journal.
#[derive(Serialize, Deserialize)]
pub struct RepoEventRecord {
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: u64,
    pub event: serde_json::Value,
}

/// A kind-30620 ownership-transfer event, validated for shape but not yet
/// applied to a chain (that needs the owner at the point of application).
pub struct OwnershipTransfer {
    pub event: Event,
    pub coordinate: String,
    pub new_owner: PublicKey,
}

impl OwnershipTransfer {
    pub fn is_self_transfer(&self) -> bool {
        self.event.pubkey == self.new_owner
    }
}

impl TryFrom<Event> for OwnershipTransfer {
    type Error = anyhow::Error;

    fn try_from(event: Event) -> Result<Self> {
        if !event.kind.eq(&KIND_OWNERSHIP_TRANSFER) {
            bail!("incorrect kind");
        }
        event.verify().context("invalid signature")?;
        let coordinate = tag_value(&event, "a").context("transfer has no 'a' tag")?;
        let new_owner = PublicKey::parse(
            &tag_value(&event, "p").context("transfer names no new owner in a 'p' tag")?,
        )
        .context("transfer 'p' tag is not a public key")?;
        Ok(OwnershipTransfer {
            event,
            coordinate,
            new_owner,
        })
    }
}

/// A kind-30618 maintainers list. Only lists authored by the current owner
/// are honored; that filtering happens in the policy resolver.
pub struct MaintainersList {
    pub event: Event,
    pub maintainers: Vec<PublicKey>,
}

impl TryFrom<Event> for MaintainersList {
    type Error = anyhow::Error;

    fn try_from(event: Event) -> Result<Self> {
        if !event.kind.eq(&KIND_MAINTAINERS) {
            bail!("incorrect kind");
        }
        let mut maintainers = vec![];
        for tag in event.tags.iter() {
            if let [t, pk, ..] = tag.as_slice() {
                if t == "p" {
                    if let Ok(pk) = PublicKey::parse(pk) {
                        maintainers.push(pk);
                    }
                }
            }
        }
        Ok(MaintainersList { event, maintainers })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BranchPolicy {
    pub require_maintainer: bool,
    pub allow_force_push: bool,
    pub allow_delete: bool,
}

/// A kind-30619 branch-protection event. Each protected branch is one
/// `["branch", <name>, <flag>...]` tag; flags present are true.
pub struct BranchProtection {
    pub event: Event,
    policies: Vec<(String, BranchPolicy)>,
}

impl BranchProtection {
    pub fn policy_for(&self, branch: &str) -> Option<BranchPolicy> {
        self.policies
            .iter()
            .find(|(name, _)| name == branch)
            .map(|(_, policy)| *policy)
    }
}

impl TryFrom<Event> for BranchProtection {
    type Error = anyhow::Error;

    fn try_from(event: Event) -> Result<Self> {
        if !event.kind.eq(&KIND_BRANCH_PROTECTION) {
            bail!("incorrect kind");
        }
        let mut policies = vec![];
        for tag in event.tags.iter() {
            if let [t, branch, flags @ ..] = tag.as_slice() {
                if t == "branch" {
                    policies.push((
                        branch.clone(),
                        BranchPolicy {
                            require_maintainer: flags.iter().any(|f| f == "require-maintainer"),
                            allow_force_push: flags.iter().any(|f| f == "allow-force-push"),
                            allow_delete: flags.iter().any(|f| f == "allow-delete"),
                        },
                    ));
                }
            }
        }
        Ok(BranchProtection { event, policies })
    }
}

#[cfg(test)]
mod tests {
    use test_utils::*;

    use super::*;

    mod dedup {
        use super::*;

        #[test]
        fn regular_events_keep_distinct_ids() {
            let a = generate_public_message(&TEST_KEY_1_KEYS, "hello", 100);
            let b = generate_public_message(&TEST_KEY_1_KEYS, "world", 100);
            assert_ne!(dedup_key(&a), dedup_key(&b));
        }

        #[test]
        fn addressable_events_collapse_on_d_tag() {
            let older = generate_announcement_at(&TEST_KEY_1_KEYS, "repo", &[], false, 100);
            let newer = generate_announcement_at(&TEST_KEY_1_KEYS, "repo", &[], false, 200);
            assert_eq!(dedup_key(&older), dedup_key(&newer));
            let deduped = dedup_events(vec![older, newer.clone()]);
            assert_eq!(deduped.len(), 1);
            assert_eq!(deduped[0].id, newer.id);
        }

        #[test]
        fn different_identifiers_do_not_collapse() {
            let a = generate_announcement_at(&TEST_KEY_1_KEYS, "repo-a", &[], false, 100);
            let b = generate_announcement_at(&TEST_KEY_1_KEYS, "repo-b", &[], false, 100);
            assert_eq!(dedup_events(vec![a, b]).len(), 2);
        }

        #[test]
        fn write_proofs_collapse_per_author() {
            let older = generate_write_proof(&TEST_KEY_1_KEYS, 100);
            let newer = generate_write_proof(&TEST_KEY_1_KEYS, 200);
            let other_author = generate_write_proof(&TEST_KEY_2_KEYS, 150);
            let deduped = dedup_events(vec![older, newer.clone(), other_author]);
            assert_eq!(deduped.len(), 2);
            assert!(deduped.iter().any(|e| e.id == newer.id));
        }

        #[test]
        fn replaceable_profile_keeps_newest() {
            let older = generate_profile_at(&TEST_KEY_1_KEYS, "alice", 100);
            let newer = generate_profile_at(&TEST_KEY_1_KEYS, "alice2", 200);
            let deduped = dedup_events(vec![newer.clone(), older]);
            assert_eq!(deduped.len(), 1);
            assert_eq!(deduped[0].id, newer.id);
        }
    }

    mod ownership_transfer {
        use super::*;

        #[test]
        fn parses_valid_transfer() {
            let transfer = generate_transfer(
                &TEST_KEY_1_KEYS,
                &TEST_KEY_1_KEYS.public_key(),
                "repo",
                &TEST_KEY_2_KEYS.public_key(),
                100,
            );
            let parsed = OwnershipTransfer::try_from(transfer).unwrap();
            assert_eq!(parsed.new_owner, TEST_KEY_2_KEYS.public_key());
            assert!(!parsed.is_self_transfer());
        }

        #[test]
        fn detects_self_transfer() {
            let transfer = generate_transfer(
                &TEST_KEY_1_KEYS,
                &TEST_KEY_1_KEYS.public_key(),
                "repo",
                &TEST_KEY_1_KEYS.public_key(),
                100,
            );
            assert!(OwnershipTransfer::try_from(transfer)
                .unwrap()
                .is_self_transfer());
        }

        #[test]
        fn rejects_wrong_kind() {
            let event = generate_public_message(&TEST_KEY_1_KEYS, "not a transfer", 100);
            assert!(OwnershipTransfer::try_from(event).is_err());
        }
    }

    mod branch_protection {
        use super::*;

        #[test]
        fn parses_flags_per_branch() {
            let event = generate_branch_protection(
                &TEST_KEY_1_KEYS,
                "repo",
                &[("main", &["require-maintainer"]), ("dev", &["allow-delete"])],
                100,
            );
            let protection = BranchProtection::try_from(event).unwrap();
            let main = protection.policy_for("main").unwrap();
            assert!(main.require_maintainer);
            assert!(!main.allow_force_push);
            assert!(!main.allow_delete);
            let dev = protection.policy_for("dev").unwrap();
            assert!(dev.allow_delete);
            assert!(protection.policy_for("feature").is_none());
        }
    }
}
