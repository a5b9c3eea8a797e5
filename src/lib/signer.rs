use std::path::Path;

use anyhow::{bail, Context, Result};
use nostr::{Event, JsonUtil, Keys};
use nostr_sdk::{
    hashes::{sha256::Hash as Sha256Hash, Hash},
    NostrSigner, RelayUrl, Tag, TagKind, Timestamp,
};

use crate::git_events::KIND_COMMIT_SIGNATURE;

/// How a commit-signature event gets its signature. Exactly one `sign`
/// path exists regardless of backend.
pub enum Signer {
    /// The client signed the event itself (browser extension flow); the
    /// server embeds it untouched.
    Extension { event: Event },
    /// No signing key is available; a NIP-98 proof authorizes the event
    /// and is linked from it.
    Nip98Proxy { event: Event },
    /// The caller handed over a raw key.
    RawKey { keys: Keys },
}

/// A kind-1640 event binding a git commit to a nostr identity.
#[derive(Clone)]
pub struct CommitSignature {
    pub event: Event,
    /// id the signature was originally produced over; verification goes
    /// through this id when the event could not be re-signed after the
    /// commit hash landed.
    pub original_id: nostr::EventId,
}

impl Signer {
    pub async fn sign(
        &self,
        subject: &str,
        author_name: &str,
        author_email: &str,
    ) -> Result<CommitSignature> {
        let tags = vec![
            Tag::custom(
                TagKind::Custom(std::borrow::Cow::Borrowed("author")),
                vec![author_name.to_string(), author_email.to_string()],
            ),
            Tag::custom(
                TagKind::Custom(std::borrow::Cow::Borrowed("message")),
                vec![subject.to_string()],
            ),
        ];

        let event = match self {
            Signer::RawKey { keys } => {
                nostr_sdk::EventBuilder::new(KIND_COMMIT_SIGNATURE, "")
                    .tags(tags)
                    .sign_with_keys(keys)
                    .context("failed to sign commit signature event")?
            }
            Signer::Extension { event } => {
                if !event.kind.eq(&KIND_COMMIT_SIGNATURE) {
                    bail!("pre-signed event is not a commit signature");
                }
                event.verify().context("pre-signed event does not verify")?;
                event.clone()
            }
            Signer::Nip98Proxy { event: proof } => {
                let mut tags = tags;
                tags.push(Tag::custom(
                    TagKind::Custom(std::borrow::Cow::Borrowed("e")),
                    vec![
                        proof.id.to_string(),
                        String::new(),
                        "nip98-auth".to_string(),
                    ],
                ));
                // The proof's signature is carried over; verifiers chase the
                // e tag back to the authorizing event.
                derive_event_from_proof(proof, &tags)?
            }
        };

        let original_id = event.id;
        Ok(CommitSignature { event, original_id })
    }
}

impl CommitSignature {
    /// Once the commit exists, bind its hash into the event. The id is
    /// recomputed over the new canonical serialization; only a raw key can
    /// re-sign, other backends keep the signature they had.
    pub async fn set_commit_hash(&mut self, commit_hash: &str, signer: &Signer) -> Result<()> {
        let mut value: serde_json::Value = serde_json::from_str(&self.event.as_json())
            .context("commit signature event is not json")?;
        value["tags"]
            .as_array_mut()
            .context("event tags are not an array")?
            .push(serde_json::json!(["commit", commit_hash]));

        if let Signer::RawKey { keys } = signer {
            let unsigned = serde_json::json!({
                "pubkey": value["pubkey"],
                "created_at": value["created_at"],
                "kind": value["kind"],
                "tags": value["tags"],
                "content": value["content"],
            });
            let unsigned = nostr::event::UnsignedEvent::from_json(unsigned.to_string())
                .context("failed to rebuild unsigned event")?;
            self.event = keys
                .sign_event(unsigned)
                .await
                .context("failed to re-sign commit signature event")?;
        } else {
            value["id"] = serde_json::Value::String(canonical_id(&value));
            self.event = Event::from_json(value.to_string())
                .context("failed to rebuild commit signature event")?;
        }
        Ok(())
    }
}

/// Trailer appended to the commit message, all three fields lowercase hex.
pub fn signature_trailer(event: &Event) -> String {
    format!("Nostr-Signature: {} {} {}", event.id, event.pubkey, event.sig)
}

pub fn message_with_trailer(message: &str, event: &Event) -> String {
    format!("{message}\n\n{}", signature_trailer(event))
}

/// Append the event as one JSON line to a journal file inside the worktree.
pub async fn append_event_line(worktree: &Path, journal: &str, line: String) -> Result<()> {
    let path = worktree.join(journal);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("failed to create journal directory")?;
    }
    let mut contents = tokio::fs::read_to_string(&path).await.unwrap_or_default();
    if !contents.is_empty() && !contents.ends_with('\n') {
        contents.push('\n');
    }
    contents.push_str(&line);
    contents.push('\n');
    tokio::fs::write(&path, contents)
        .await
        .context("failed to append journal line")
}

/// Relays a user declared for publishing, from a kind-10002 relay list:
/// `r` tags that are unmarked or marked `write`.
pub fn outbox_relays(relay_list: &Event) -> Vec<RelayUrl> {
    let mut relays = vec![];
    for tag in relay_list.tags.iter() {
        match tag.as_slice() {
            [t, url] if t == "r" => {
                if let Ok(url) = RelayUrl::parse(url) {
                    relays.push(url);
                }
            }
            [t, url, marker] if t == "r" && marker == "write" => {
                if let Ok(url) = RelayUrl::parse(url) {
                    relays.push(url);
                }
            }
            _ => {}
        }
    }
    relays
}

fn derive_event_from_proof(proof: &Event, tags: &[Tag]) -> Result<Event> {
    let mut value = serde_json::json!({
        "pubkey": proof.pubkey.to_string(),
        "created_at": Timestamp::now().as_u64(),
        "kind": KIND_COMMIT_SIGNATURE.as_u16(),
        "tags": serde_json::to_value(tags).context("tags are not serializable")?,
        "content": "",
        "sig": proof.sig.to_string(),
    });
    value["id"] = serde_json::Value::String(canonical_id(&value));
    Event::from_json(value.to_string()).context("failed to build proxied commit signature")
}

/// NIP-01 canonical id: sha256 over
/// `[0, pubkey, created_at, kind, tags, content]` serialized compactly.
fn canonical_id(value: &serde_json::Value) -> String {
    let canonical = serde_json::json!([
        0,
        value["pubkey"],
        value["created_at"],
        value["kind"],
        value["tags"],
        value["content"],
    ]);
    Sha256Hash::hash(canonical.to_string().as_bytes()).to_string()
}

#[cfg(test)]
mod tests {
    use test_utils::*;

    use super::*;

    fn raw_key_signer() -> Signer {
        Signer::RawKey {
            keys: TEST_KEY_1_KEYS.clone(),
        }
    }

    #[tokio::test]
    async fn raw_key_produces_verifiable_event() {
        let signature = raw_key_signer()
            .sign("add feature", "joe bloggs", "joe@example.org")
            .await
            .unwrap();
        signature.event.verify().unwrap();
        assert_eq!(signature.event.kind.as_u16(), 1640);
        assert_eq!(
            crate::git_events::tag_value(&signature.event, "message").unwrap(),
            "add feature"
        );
    }

    #[tokio::test]
    async fn trailer_is_three_lowercase_hex_fields() {
        let signature = raw_key_signer()
            .sign("subject", "a", "a@b.c")
            .await
            .unwrap();
        let trailer = signature_trailer(&signature.event);
        let rest = trailer.strip_prefix("Nostr-Signature: ").unwrap();
        let fields: Vec<&str> = rest.split(' ').collect();
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[0].len(), 64);
        assert_eq!(fields[1].len(), 64);
        assert_eq!(fields[2].len(), 128);
        for field in fields {
            assert!(field.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        }
    }

    #[tokio::test]
    async fn message_with_trailer_separates_with_blank_line() {
        let signature = raw_key_signer().sign("s", "a", "a@b.c").await.unwrap();
        let message = message_with_trailer("fix parser", &signature.event);
        assert!(message.starts_with("fix parser\n\nNostr-Signature: "));
    }

    #[tokio::test]
    async fn raw_key_resigns_after_commit_hash() {
        let signer = raw_key_signer();
        let mut signature = signer.sign("s", "a", "a@b.c").await.unwrap();
        signature
            .set_commit_hash("5e664e5a7845cd1373c79f580ca4fe29ab5b34d2", &signer)
            .await
            .unwrap();
        signature.event.verify().unwrap();
        assert_eq!(
            crate::git_events::tag_value(&signature.event, "commit").unwrap(),
            "5e664e5a7845cd1373c79f580ca4fe29ab5b34d2"
        );
    }

    #[tokio::test]
    async fn proxy_keeps_signature_but_recomputes_id() {
        let proof = generate_nip98(
            &TEST_KEY_1_KEYS,
            "https://example.org/x/y.git/git-receive-pack",
            "POST",
            None,
        );
        let signer = Signer::Nip98Proxy {
            event: proof.clone(),
        };
        let mut signature = signer.sign("s", "a", "a@b.c").await.unwrap();
        let id_before = signature.event.id;
        assert_eq!(signature.original_id, id_before);
        assert_eq!(signature.event.sig, proof.sig);

        let e_tag = signature
            .event
            .tags
            .iter()
            .find(|t| t.as_slice()[0] == "e")
            .unwrap();
        assert_eq!(e_tag.as_slice()[1], proof.id.to_string());
        assert_eq!(e_tag.as_slice()[3], "nip98-auth");

        signature
            .set_commit_hash("5e664e5a7845cd1373c79f580ca4fe29ab5b34d2", &signer)
            .await
            .unwrap();
        assert_ne!(signature.event.id, id_before);
        assert_eq!(signature.original_id, id_before);
        assert_eq!(signature.event.sig, proof.sig);
    }

    #[tokio::test]
    async fn extension_event_is_embedded_untouched() {
        let event = generate_commit_signature(&TEST_KEY_2_KEYS, "s", 100);
        let signer = Signer::Extension {
            event: event.clone(),
        };
        let signature = signer.sign("s", "a", "a@b.c").await.unwrap();
        assert_eq!(signature.event.id, event.id);
    }

    #[tokio::test]
    async fn append_event_line_appends_exactly_one_line() {
        let dir = tempfile::tempdir().unwrap();
        let signature = raw_key_signer().sign("s", "a", "a@b.c").await.unwrap();
        append_event_line(
            dir.path(),
            crate::git::COMMIT_SIGNATURES_FILE,
            signature.event.as_json(),
        )
        .await
        .unwrap();
        append_event_line(
            dir.path(),
            crate::git::COMMIT_SIGNATURES_FILE,
            signature.event.as_json(),
        )
        .await
        .unwrap();
        let contents = std::fs::read_to_string(
            dir.path().join(crate::git::COMMIT_SIGNATURES_FILE),
        )
        .unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn outbox_relays_take_write_and_unmarked() {
        let event = generate_relay_list(
            &TEST_KEY_1_KEYS,
            &[
                ("wss://write.example.com", Some("write")),
                ("wss://read.example.com", Some("read")),
                ("wss://both.example.com", None),
            ],
            100,
        );
        let relays = outbox_relays(&event);
        assert_eq!(relays.len(), 2);
        assert!(relays.contains(&RelayUrl::parse("wss://write.example.com").unwrap()));
        assert!(relays.contains(&RelayUrl::parse("wss://both.example.com").unwrap()));
    }
}
