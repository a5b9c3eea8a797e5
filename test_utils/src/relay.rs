use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use nostr::{Event, JsonUtil};
use nostr_sdk::RelayUrl;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

/// A minimal relay: answers every REQ with its seeded events followed by
/// EOSE, and every EVENT with an accepting OK. Listens on an ephemeral
/// port until dropped.
pub struct MockRelay {
    addr: SocketAddr,
}

impl MockRelay {
    pub async fn serve(events: Vec<Event>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock relay");
        let addr = listener.local_addr().expect("local addr");

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let events = events.clone();
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    while let Some(Ok(message)) = ws.next().await {
                        let Ok(text) = message.to_text() else {
                            continue;
                        };
                        let Ok(value) = serde_json::from_str::<Value>(text) else {
                            continue;
                        };
                        let Some(array) = value.as_array() else {
                            continue;
                        };
                        match array.first().and_then(Value::as_str) {
                            Some("REQ") => {
                                let Some(sub_id) = array.get(1).and_then(Value::as_str) else {
                                    continue;
                                };
                                for event in &events {
                                    let Ok(event_value) =
                                        serde_json::from_str::<Value>(&event.as_json())
                                    else {
                                        continue;
                                    };
                                    let frame =
                                        serde_json::json!(["EVENT", sub_id, event_value]);
                                    if ws.send(Message::from(frame.to_string())).await.is_err() {
                                        return;
                                    }
                                }
                                let eose = serde_json::json!(["EOSE", sub_id]);
                                if ws.send(Message::from(eose.to_string())).await.is_err() {
                                    return;
                                }
                            }
                            Some("EVENT") => {
                                let id = array
                                    .get(1)
                                    .and_then(|e| e.get("id"))
                                    .and_then(Value::as_str)
                                    .unwrap_or_default();
                                let ok = serde_json::json!(["OK", id, true, ""]);
                                if ws.send(Message::from(ok.to_string())).await.is_err() {
                                    return;
                                }
                            }
                            _ => {}
                        }
                    }
                });
            }
        });

        MockRelay { addr }
    }

    pub fn url(&self) -> RelayUrl {
        RelayUrl::parse(&format!("ws://{}", self.addr)).expect("valid relay url")
    }
}
