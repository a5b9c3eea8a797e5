use std::str::FromStr;

use nostr::{Event, EventId, JsonUtil, Keys, PublicKey};
use nostr_sdk::{
    hashes::{sha256::Hash as Sha256Hash, Hash},
    EventBuilder, Kind, Tag, TagKind, Timestamp, ToBech32,
};
use once_cell::sync::Lazy;

mod git;
pub mod relay;

pub use git::ScaffoldedRepo;

pub static TEST_KEY_1_NSEC: &str =
    "nsec1ppsg5sm2aexq06juxmu9evtutr6jkwkhp98exxxvwamhru9lyx9s3rwseq";

pub static TEST_KEY_2_NSEC: &str =
    "nsec1ypglg6nj6ep0g2qmyfqcv2al502gje3jvpwye6mthmkvj93tqkesknv6qm";

pub static TEST_KEY_1_KEYS: Lazy<Keys> =
    Lazy::new(|| Keys::from_str(TEST_KEY_1_NSEC).expect("valid test key"));

pub static TEST_KEY_2_KEYS: Lazy<Keys> =
    Lazy::new(|| Keys::from_str(TEST_KEY_2_NSEC).expect("valid test key"));

pub static TEST_KEY_1_NPUB: Lazy<String> = Lazy::new(|| {
    TEST_KEY_1_KEYS
        .public_key()
        .to_bech32()
        .expect("valid npub")
});

pub static TEST_KEY_2_NPUB: Lazy<String> = Lazy::new(|| {
    TEST_KEY_2_KEYS
        .public_key()
        .to_bech32()
        .expect("valid npub")
});

fn custom_tag(name: &'static str, values: Vec<String>) -> Tag {
    Tag::custom(TagKind::Custom(std::borrow::Cow::Borrowed(name)), values)
}

fn sign_at(builder: EventBuilder, keys: &Keys, at: u64) -> Event {
    builder
        .custom_created_at(Timestamp::from(at))
        .sign_with_keys(keys)
        .expect("signing with test keys succeeds")
}

pub fn generate_public_message(keys: &Keys, content: &str, at: u64) -> Event {
    sign_at(EventBuilder::new(Kind::Custom(24), content), keys, at)
}

pub fn generate_write_proof(keys: &Keys, at: u64) -> Event {
    sign_at(
        EventBuilder::new(Kind::Custom(24), "write-proof: repository access confirmed"),
        keys,
        at,
    )
}

pub fn generate_profile_at(keys: &Keys, name: &str, at: u64) -> Event {
    sign_at(
        EventBuilder::new(
            Kind::Metadata,
            serde_json::json!({ "name": name }).to_string(),
        ),
        keys,
        at,
    )
}

pub fn generate_announcement_at(
    keys: &Keys,
    identifier: &str,
    clone_urls: &[&str],
    private: bool,
    at: u64,
) -> Event {
    let mut tags = vec![
        Tag::identifier(identifier.to_string()),
        custom_tag("clone", clone_urls.iter().map(ToString::to_string).collect()),
    ];
    if private {
        tags.push(custom_tag("private", vec!["true".to_string()]));
    }
    sign_at(
        EventBuilder::new(Kind::GitRepoAnnouncement, "").tags(tags),
        keys,
        at,
    )
}

#[allow(clippy::too_many_arguments)]
pub fn generate_announcement_full(
    keys: &Keys,
    identifier: &str,
    clone_urls: &[&str],
    relays: &[&str],
    root_commit: &str,
    private: bool,
    at: u64,
) -> Event {
    let mut tags = vec![
        Tag::identifier(identifier.to_string()),
        custom_tag(
            "r",
            vec![root_commit.to_string(), "euc".to_string()],
        ),
        custom_tag("clone", clone_urls.iter().map(ToString::to_string).collect()),
        custom_tag("relays", relays.iter().map(ToString::to_string).collect()),
    ];
    if private {
        tags.push(custom_tag("private", vec!["true".to_string()]));
    }
    sign_at(
        EventBuilder::new(Kind::GitRepoAnnouncement, "").tags(tags),
        keys,
        at,
    )
}

pub fn generate_announcement_with_tag(
    keys: &Keys,
    identifier: &str,
    tag_parts: &[&str],
    at: u64,
) -> Event {
    let tags = vec![
        Tag::identifier(identifier.to_string()),
        Tag::parse(tag_parts.iter().copied()).expect("valid tag parts"),
    ];
    sign_at(
        EventBuilder::new(Kind::GitRepoAnnouncement, "").tags(tags),
        keys,
        at,
    )
}

fn announcement_coordinate(owner: &PublicKey, identifier: &str) -> String {
    format!("30617:{owner}:{identifier}")
}

pub fn generate_transfer(
    signer: &Keys,
    original_owner: &PublicKey,
    identifier: &str,
    new_owner: &PublicKey,
    at: u64,
) -> Event {
    let mut tags = vec![
        Tag::identifier(identifier.to_string()),
        custom_tag(
            "a",
            vec![announcement_coordinate(original_owner, identifier)],
        ),
        custom_tag("p", vec![new_owner.to_string()]),
    ];
    if signer.public_key() == *new_owner {
        tags.push(custom_tag("t", vec!["self-transfer".to_string()]));
    }
    sign_at(
        EventBuilder::new(Kind::Custom(30620), "").tags(tags),
        signer,
        at,
    )
}

pub fn generate_maintainers(
    owner: &Keys,
    original_owner: &PublicKey,
    identifier: &str,
    maintainers: &[PublicKey],
    at: u64,
) -> Event {
    let mut tags = vec![
        Tag::identifier(identifier.to_string()),
        custom_tag(
            "a",
            vec![announcement_coordinate(original_owner, identifier)],
        ),
    ];
    for maintainer in maintainers {
        tags.push(custom_tag("p", vec![maintainer.to_string()]));
    }
    sign_at(EventBuilder::new(Kind::Custom(30618), "").tags(tags), owner, at)
}

pub fn generate_branch_protection(
    owner: &Keys,
    identifier: &str,
    branches: &[(&str, &[&str])],
    at: u64,
) -> Event {
    let mut tags = vec![
        Tag::identifier(identifier.to_string()),
        custom_tag(
            "a",
            vec![announcement_coordinate(&owner.public_key(), identifier)],
        ),
    ];
    for (branch, flags) in branches {
        let mut parts = vec![branch.to_string()];
        parts.extend(flags.iter().map(ToString::to_string));
        tags.push(custom_tag("branch", parts));
    }
    sign_at(EventBuilder::new(Kind::Custom(30619), "").tags(tags), owner, at)
}

pub fn generate_deletion(keys: &Keys, ids: &[EventId], at: u64) -> Event {
    let tags = ids
        .iter()
        .map(|id| custom_tag("e", vec![id.to_string()]))
        .collect::<Vec<Tag>>();
    sign_at(
        EventBuilder::new(Kind::EventDeletion, "").tags(tags),
        keys,
        at,
    )
}

pub fn generate_relay_list(keys: &Keys, relays: &[(&str, Option<&str>)], at: u64) -> Event {
    let tags = relays
        .iter()
        .map(|(url, marker)| match marker {
            Some(marker) => custom_tag("r", vec![url.to_string(), marker.to_string()]),
            None => custom_tag("r", vec![url.to_string()]),
        })
        .collect::<Vec<Tag>>();
    sign_at(EventBuilder::new(Kind::RelayList, "").tags(tags), keys, at)
}

pub fn generate_commit_signature(keys: &Keys, subject: &str, at: u64) -> Event {
    sign_at(
        EventBuilder::new(Kind::Custom(1640), "").tags(vec![
            custom_tag("author", vec!["test author".to_string(), "t@example.org".to_string()]),
            custom_tag("message", vec![subject.to_string()]),
        ]),
        keys,
        at,
    )
}

fn nip98_tags(url: &str, method: &str, body: Option<&[u8]>) -> Vec<Tag> {
    let mut tags = vec![
        custom_tag("u", vec![url.to_string()]),
        custom_tag("method", vec![method.to_string()]),
    ];
    if let Some(body) = body {
        tags.push(custom_tag(
            "payload",
            vec![Sha256Hash::hash(body).to_string()],
        ));
    }
    tags
}

pub fn generate_nip98(keys: &Keys, url: &str, method: &str, body: Option<&[u8]>) -> Event {
    EventBuilder::new(Kind::Custom(27235), "")
        .tags(nip98_tags(url, method, body))
        .sign_with_keys(keys)
        .expect("signing with test keys succeeds")
}

pub fn generate_nip98_at(keys: &Keys, url: &str, method: &str, at: u64) -> Event {
    sign_at(
        EventBuilder::new(Kind::Custom(27235), "").tags(nip98_tags(url, method, None)),
        keys,
        at,
    )
}

pub fn generate_nip98_with_content(keys: &Keys, url: &str, method: &str, content: &str) -> Event {
    EventBuilder::new(Kind::Custom(27235), content)
        .tags(nip98_tags(url, method, None))
        .sign_with_keys(keys)
        .expect("signing with test keys succeeds")
}

pub fn generate_nip98_with_method_casing(keys: &Keys, url: &str, method: &str) -> Event {
    generate_nip98(keys, url, method, None)
}

/// Rewrite part of an already-signed event's json without re-signing, to
/// exercise tamper detection.
pub fn tamper_with_event_url(event: &Event, from: &str, to: &str) -> Event {
    Event::from_json(event.as_json().replace(from, to)).expect("tampered json still parses")
}
