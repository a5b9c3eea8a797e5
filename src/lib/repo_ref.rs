use std::{str::FromStr, sync::Arc};

use anyhow::{bail, Context, Result};
use nostr::{PublicKey, Tag, TagStandard};
use nostr_sdk::{Kind, NostrSigner, RelayUrl};

use crate::client::sign_event;

/// A repository announcement (kind 30617), the parameterized replaceable
/// event keyed by `d` = repo name that every other repo event hangs off.
#[derive(Clone)]
pub struct RepoAnnouncement {
    pub identifier: String,
    pub name: String,
    pub description: String,
    /// earliest unique commit, `r` tag with `euc` marker
    pub root_commit: String,
    pub clone_urls: Vec<String>,
    pub web: Vec<String>,
    pub relays: Vec<RelayUrl>,
    pub maintainers: Vec<PublicKey>,
    pub private: bool,
    pub event: nostr::Event,
}

impl TryFrom<nostr::Event> for RepoAnnouncement {
    type Error = anyhow::Error;

    fn try_from(event: nostr::Event) -> Result<Self> {
        if !event.kind.eq(&Kind::GitRepoAnnouncement) {
            bail!("incorrect kind");
        }

        let mut r = Self {
            identifier: String::new(),
            name: String::new(),
            description: String::new(),
            root_commit: String::new(),
            clone_urls: Vec::new(),
            web: Vec::new(),
            relays: Vec::new(),
            maintainers: Vec::new(),
            private: false,
            event: event.clone(),
        };

        for tag in event.tags.iter() {
            match tag.as_slice() {
                [t, id, ..] if t == "d" => r.identifier = id.clone(),
                [t, name, ..] if t == "name" => r.name = name.clone(),
                [t, description, ..] if t == "description" => r.description = description.clone(),
                [t, clone @ ..] if t == "clone" => {
                    r.clone_urls = clone.to_vec();
                }
                [t, web @ ..] if t == "web" => {
                    r.web = web.to_vec();
                }
                [t, commit_id, marker]
                    if t == "r"
                        && marker == "euc"
                        && commit_id.len() == 40
                        && git2::Oid::from_str(commit_id).is_ok() =>
                {
                    r.root_commit = commit_id.clone();
                }
                [t] if t == "private" => r.private = true,
                [t, flag, ..] if t == "private" && flag == "true" => r.private = true,
                [t, marker, ..] if t == "t" && marker == "private" => r.private = true,
                [t, relays @ ..] if t == "relays" => {
                    for relay in relays {
                        if let Ok(relay_url) = RelayUrl::parse(relay) {
                            r.relays.push(relay_url);
                        }
                    }
                }
                [t, maintainers @ ..] if t == "maintainers" => {
                    for pk in maintainers {
                        r.maintainers.push(
                            PublicKey::from_str(pk)
                                .context(format!(
                                    "maintainers tag entry {pk} is not a hex public key"
                                ))
                                .context("invalid repository announcement")?,
                        );
                    }
                }
                _ => {}
            }
        }

        if r.identifier.is_empty() {
            bail!("announcement has no 'd' tag");
        }
        if !r.maintainers.contains(&event.pubkey) {
            r.maintainers.push(event.pubkey);
        }
        Ok(r)
    }
}

impl RepoAnnouncement {
    pub async fn to_event(&self, signer: &Arc<dyn NostrSigner>) -> Result<nostr::Event> {
        let mut tags = vec![
            Tag::identifier(self.identifier.clone()),
            Tag::custom(
                nostr::TagKind::Custom(std::borrow::Cow::Borrowed("r")),
                vec![self.root_commit.to_string(), "euc".to_string()],
            ),
            Tag::from_standardized(TagStandard::Name(self.name.clone())),
            Tag::from_standardized(TagStandard::Description(self.description.clone())),
            Tag::custom(
                nostr::TagKind::Custom(std::borrow::Cow::Borrowed("clone")),
                self.clone_urls.clone(),
            ),
            Tag::custom(
                nostr::TagKind::Custom(std::borrow::Cow::Borrowed("web")),
                self.web.clone(),
            ),
            Tag::custom(
                nostr::TagKind::Custom(std::borrow::Cow::Borrowed("relays")),
                self.relays.iter().map(|r| r.to_string()),
            ),
            Tag::custom(
                nostr::TagKind::Custom(std::borrow::Cow::Borrowed("maintainers")),
                self.maintainers
                    .iter()
                    .map(std::string::ToString::to_string)
                    .collect::<Vec<String>>(),
            ),
        ];
        if self.private {
            tags.push(Tag::custom(
                nostr::TagKind::Custom(std::borrow::Cow::Borrowed("private")),
                vec!["true".to_string()],
            ));
        }
        sign_event(
            nostr_sdk::EventBuilder::new(Kind::GitRepoAnnouncement, "").tags(tags),
            signer,
        )
        .await
        .context("failed to create repository announcement event")
    }

    /// Relays to consult for this repository, falling back to `defaults`
    /// when the announcement carries no hints.
    pub fn relays_or(&self, defaults: &[String]) -> Vec<RelayUrl> {
        if self.relays.is_empty() {
            defaults
                .iter()
                .filter_map(|r| RelayUrl::parse(r).ok())
                .collect()
        } else {
            self.relays.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use test_utils::*;

    use super::*;

    fn create() -> nostr::Event {
        generate_announcement_full(
            &TEST_KEY_1_KEYS,
            "test-repo",
            &[
                "https://git.example.org/npub1xxx/test-repo.git",
                "https://mirror.example.com/test-repo.git",
            ],
            &["ws://relay1.io", "ws://relay2.io"],
            "5e664e5a7845cd1373c79f580ca4fe29ab5b34d2",
            false,
            100,
        )
    }

    mod try_from {
        use super::*;

        #[test]
        fn identifier() {
            assert_eq!(
                RepoAnnouncement::try_from(create()).unwrap().identifier,
                "test-repo",
            )
        }

        #[test]
        fn root_commit_from_euc_marker() {
            assert_eq!(
                RepoAnnouncement::try_from(create()).unwrap().root_commit,
                "5e664e5a7845cd1373c79f580ca4fe29ab5b34d2",
            )
        }

        #[test]
        fn clone_urls() {
            assert_eq!(
                RepoAnnouncement::try_from(create()).unwrap().clone_urls,
                vec![
                    "https://git.example.org/npub1xxx/test-repo.git",
                    "https://mirror.example.com/test-repo.git",
                ],
            )
        }

        #[test]
        fn relays() {
            assert_eq!(
                RepoAnnouncement::try_from(create()).unwrap().relays,
                vec![
                    RelayUrl::parse("ws://relay1.io").unwrap(),
                    RelayUrl::parse("ws://relay2.io").unwrap(),
                ],
            )
        }

        #[test]
        fn author_is_always_a_maintainer() {
            assert!(RepoAnnouncement::try_from(create())
                .unwrap()
                .maintainers
                .contains(&TEST_KEY_1_KEYS.public_key()))
        }

        #[test]
        fn not_private_without_marker() {
            assert!(!RepoAnnouncement::try_from(create()).unwrap().private)
        }

        #[test]
        fn private_marker_forms() {
            for event in [
                generate_announcement_with_tag(&TEST_KEY_1_KEYS, "r1", &["private", "true"], 100),
                generate_announcement_with_tag(&TEST_KEY_1_KEYS, "r2", &["private"], 100),
                generate_announcement_with_tag(&TEST_KEY_1_KEYS, "r3", &["t", "private"], 100),
            ] {
                assert!(RepoAnnouncement::try_from(event).unwrap().private);
            }
        }

        #[test]
        fn rejects_missing_identifier() {
            let event = generate_public_message(&TEST_KEY_1_KEYS, "no d tag", 100);
            assert!(RepoAnnouncement::try_from(event).is_err());
        }
    }

    mod to_event {
        use super::*;

        #[tokio::test]
        async fn round_trips_through_its_own_parser() {
            let original = RepoAnnouncement::try_from(create()).unwrap();
            let signer: Arc<dyn NostrSigner> = Arc::new(TEST_KEY_1_KEYS.clone());
            let event = original.to_event(&signer).await.unwrap();
            event.verify().unwrap();

            let parsed = RepoAnnouncement::try_from(event).unwrap();
            assert_eq!(parsed.identifier, original.identifier);
            assert_eq!(parsed.clone_urls, original.clone_urls);
            assert_eq!(parsed.relays, original.relays);
            assert_eq!(parsed.root_commit, original.root_commit);
            assert!(!parsed.private);
        }

        #[tokio::test]
        async fn private_marker_survives_the_round_trip() {
            let mut original = RepoAnnouncement::try_from(create()).unwrap();
            original.private = true;
            let signer: Arc<dyn NostrSigner> = Arc::new(TEST_KEY_1_KEYS.clone());
            let event = original.to_event(&signer).await.unwrap();
            assert!(RepoAnnouncement::try_from(event).unwrap().private);
        }
    }
}
