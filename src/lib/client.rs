use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
#[cfg(test)]
use mockall::*;
use nostr::{Event, Filter};
use nostr_relay_pool::relay::ReqExitPolicy;
use nostr_sdk::{
    ClientOptions, EventBuilder, Kind, NostrSigner, RelayUrl, Timestamp, prelude::RelayLimits,
};
use tracing::debug;

use crate::{
    cache::{EventCache, RelayFetch},
    git_events::dedup_events,
};

/// Budget for establishing a relay connection.
pub fn connect_timeout() -> u64 {
    if std::env::var("GITREPUBLIC_TEST").is_ok() {
        1
    } else {
        3
    }
}

/// Total budget for one fetch against one relay.
pub fn fetch_timeout() -> u64 {
    if std::env::var("GITREPUBLIC_TEST").is_ok() {
        2
    } else {
        8
    }
}

/// Ceiling on waiting for a publish OK.
pub fn publish_timeout() -> u64 {
    if std::env::var("GITREPUBLIC_TEST").is_ok() {
        2
    } else {
        10
    }
}

const MAX_CONCURRENT_RELAYS: usize = 15;

#[derive(Debug, Default)]
pub struct PublishReport {
    pub success: Vec<RelayUrl>,
    pub failed: Vec<(RelayUrl, String)>,
}

impl PublishReport {
    pub fn accepted_anywhere(&self) -> bool {
        !self.success.is_empty()
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connect: Send + Sync {
    /// Union of the events returned by all relays for the given filters,
    /// deduplicated per replaceable-event semantics. Relay failures are
    /// logged, not surfaced; an unreachable relay contributes nothing.
    async fn fetch_events(
        &self,
        relays: Vec<RelayUrl>,
        filters: Vec<Filter>,
    ) -> Result<Vec<Event>>;

    /// Push an event to each relay and collect per-relay outcomes. Zero
    /// acceptances is an error to the caller; individual failures are not.
    async fn publish_event(&self, relays: Vec<RelayUrl>, event: &Event) -> Result<PublishReport>;
}

pub struct Client {
    client: nostr_sdk::Client,
}

impl Default for Client {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Client {
    pub fn new(keys: Option<nostr::Keys>) -> Self {
        let opts = ClientOptions::new()
            .relay_limits(RelayLimits::disable())
            .automatic_authentication(true);
        Client {
            client: if let Some(keys) = keys {
                nostr_sdk::ClientBuilder::new().opts(opts).signer(keys).build()
            } else {
                nostr_sdk::ClientBuilder::new().opts(opts).build()
            },
        }
    }

    async fn relay_handle(&self, url: &RelayUrl) -> Result<nostr_sdk::Relay> {
        self.client
            .add_relay(url.as_str())
            .await
            .context("failed to add relay")?;
        Ok(self.client.relay(url).await?)
    }
}

#[async_trait]
impl Connect for Client {
    async fn fetch_events(
        &self,
        relays: Vec<RelayUrl>,
        filters: Vec<Filter>,
    ) -> Result<Vec<Event>> {
        let futures: Vec<_> = relays
            .iter()
            .map(|url| {
                let filters = filters.clone();
                async move {
                    match self.relay_handle(url).await {
                        Ok(relay) => match fetch_from_relay(&relay, filters).await {
                            Ok(events) => Some(events),
                            Err(error) => {
                                debug!(relay = %url, %error, "relay fetch failed");
                                None
                            }
                        },
                        Err(error) => {
                            debug!(relay = %url, %error, "relay unavailable");
                            None
                        }
                    }
                }
            })
            .collect();

        let per_relay: Vec<Option<Vec<Event>>> = stream::iter(futures)
            .buffer_unordered(MAX_CONCURRENT_RELAYS)
            .collect()
            .await;

        Ok(dedup_events(
            per_relay.into_iter().flatten().flatten().collect(),
        ))
    }

    async fn publish_event(&self, relays: Vec<RelayUrl>, event: &Event) -> Result<PublishReport> {
        let futures: Vec<_> = relays
            .iter()
            .map(|url| async move {
                let outcome = publish_to_relay(self, url, event).await;
                (url.clone(), outcome)
            })
            .collect();

        let results: Vec<(RelayUrl, Result<()>)> = stream::iter(futures)
            .buffer_unordered(MAX_CONCURRENT_RELAYS)
            .collect()
            .await;

        let mut report = PublishReport::default();
        for (url, outcome) in results {
            match outcome {
                Ok(()) => report.success.push(url),
                Err(error) => report.failed.push((url, error.to_string())),
            }
        }
        if !report.accepted_anywhere() {
            anyhow::bail!(
                "no relay accepted the event: {}",
                report
                    .failed
                    .iter()
                    .map(|(url, reason)| format!("{url}: {reason}"))
                    .collect::<Vec<String>>()
                    .join("; ")
            );
        }
        Ok(report)
    }
}

async fn fetch_from_relay(
    relay: &nostr_sdk::Relay,
    filters: Vec<Filter>,
) -> Result<Vec<Event>> {
    if !relay.is_connected() {
        relay
            .try_connect(Duration::from_secs(connect_timeout()))
            .await
            .context("connection timeout")?;
    }
    let mut events = vec![];
    for filter in filters {
        // fetch_events completes on EOSE; the budget is a hard ceiling, and
        // running out of it yields whatever was collected so far rather
        // than an error.
        match tokio::time::timeout(
            Duration::from_secs(fetch_timeout()),
            relay.fetch_events(
                filter,
                Duration::from_secs(fetch_timeout()),
                ReqExitPolicy::ExitOnEOSE,
            ),
        )
        .await
        {
            Ok(result) => events.extend(result?),
            Err(_elapsed) => break,
        }
    }
    Ok(events)
}

async fn publish_to_relay(client: &Client, url: &RelayUrl, event: &Event) -> Result<()> {
    let relay = client.relay_handle(url).await?;
    if !relay.is_connected() {
        relay
            .try_connect(Duration::from_secs(connect_timeout()))
            .await
            .context("connection timeout")?;
    }
    tokio::time::timeout(
        Duration::from_secs(publish_timeout()),
        relay.send_event(event),
    )
    .await
    .context("timed out waiting for relay OK")?
    .context("relay rejected event")?;
    Ok(())
}

#[async_trait]
impl RelayFetch for Client {
    async fn fetch(&self, relays: Vec<RelayUrl>, filters: Vec<Filter>) -> Result<Vec<Event>> {
        self.fetch_events(relays, filters).await
    }
}

pub async fn sign_event(
    event_builder: EventBuilder,
    signer: &Arc<dyn NostrSigner>,
) -> Result<nostr::Event> {
    signer
        .sign_event(event_builder.build(signer.get_public_key().await?))
        .await
        .context("failed to sign event")
}

/// Removes events cited by recent deletion events from the cache. One scan
/// runs at a time across the process; a scan triggered while another is in
/// flight is dropped rather than queued, so the scanner can never recurse
/// into itself through its own fetch.
pub struct DeletionScanner {
    running: AtomicBool,
}

impl Default for DeletionScanner {
    fn default() -> Self {
        DeletionScanner {
            running: AtomicBool::new(false),
        }
    }
}

impl DeletionScanner {
    pub async fn scan(
        &self,
        client: &dyn Connect,
        cache: &EventCache,
        relays: Vec<RelayUrl>,
    ) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let filter = Filter::new()
            .kind(Kind::EventDeletion)
            .since(Timestamp::from(
                Timestamp::now().as_u64().saturating_sub(24 * 60 * 60),
            ));
        match client.fetch_events(relays, vec![filter]).await {
            Ok(deletions) => cache.process_deletions(&deletions).await,
            Err(error) => debug!(%error, "deletion scan fetch failed"),
        }
        self.running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use test_utils::{relay::MockRelay, *};

    use super::*;

    #[tokio::test]
    async fn fetch_unions_and_dedups_across_relays() {
        let older = generate_announcement_at(&TEST_KEY_1_KEYS, "repo", &[], false, 100);
        let newer = generate_announcement_at(&TEST_KEY_1_KEYS, "repo", &[], false, 200);
        let relay_a = MockRelay::serve(vec![older]).await;
        let relay_b = MockRelay::serve(vec![newer.clone()]).await;

        let client = Client::default();
        let events = client
            .fetch_events(
                vec![relay_a.url(), relay_b.url()],
                vec![Filter::new().kind(Kind::GitRepoAnnouncement)],
            )
            .await
            .unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, newer.id);
    }

    #[tokio::test]
    async fn fetch_survives_one_unreachable_relay() {
        let event = generate_announcement_at(&TEST_KEY_1_KEYS, "repo", &[], false, 100);
        let live = MockRelay::serve(vec![event.clone()]).await;
        let dead = RelayUrl::parse("ws://127.0.0.1:1").unwrap();

        let client = Client::default();
        let events = client
            .fetch_events(
                vec![dead, live.url()],
                vec![Filter::new().kind(Kind::GitRepoAnnouncement)],
            )
            .await
            .unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, event.id);
    }

    #[tokio::test]
    async fn publish_reports_per_relay_outcomes() {
        let relay = MockRelay::serve(vec![]).await;
        let dead = RelayUrl::parse("ws://127.0.0.1:1").unwrap();
        let event = generate_public_message(&TEST_KEY_1_KEYS, "hello", 100);

        let client = Client::default();
        let report = client
            .publish_event(vec![relay.url(), dead], &event)
            .await
            .unwrap();

        assert_eq!(report.success.len(), 1);
        assert_eq!(report.failed.len(), 1);
    }

    #[tokio::test]
    async fn publish_with_no_acceptance_is_an_error() {
        let dead = RelayUrl::parse("ws://127.0.0.1:1").unwrap();
        let event = generate_public_message(&TEST_KEY_1_KEYS, "hello", 100);

        let client = Client::default();
        assert!(client.publish_event(vec![dead], &event).await.is_err());
    }

    struct NoFetch;

    #[async_trait]
    impl RelayFetch for NoFetch {
        async fn fetch(
            &self,
            _relays: Vec<RelayUrl>,
            _filters: Vec<Filter>,
        ) -> Result<Vec<Event>> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn deletion_scan_purges_cited_events_from_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = EventCache::open(&dir.path().join("cache.lmdb"), Arc::new(NoFetch)).unwrap();

        let target = generate_public_message(&TEST_KEY_1_KEYS, "to be deleted", 100);
        let filters = vec![Filter::new().kind(Kind::Custom(24))];
        cache.set(&filters, vec![target.clone()], None).await;

        let deletion =
            generate_deletion(&TEST_KEY_1_KEYS, &[target.id], Timestamp::now().as_u64());
        let mut mock = MockConnect::new();
        mock.expect_fetch_events()
            .times(1)
            .returning(move |_, _| Ok(vec![deletion.clone()]));

        let scanner = DeletionScanner::default();
        scanner.scan(&mock, &cache, vec![]).await;

        assert!(cache.get(&filters).unwrap().is_empty());
    }
}
