use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use data_encoding::BASE64;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::*;
use uptermd_common::SessionId;
use uuid::Uuid;

use super::{RouteEvent, RouteLease, RouteWatch, RoutingError, SessionRoute, SessionRouter};

const KV_PREFIX: &str = "upterm/sessions/";
const LOCK_DELAY: &str = "5s";
const WATCH_WAIT: &str = "30s";
const RESOLVE_RETRIES: u32 = 4;
const RESOLVE_BACKOFF_BASE: Duration = Duration::from_millis(50);

/// Cluster directory backed by Consul. Every entry is a KV key under
/// `upterm/sessions/` acquired with a per-process health session, so a
/// dead node's entries clear themselves within TTL + lock-delay.
pub struct ConsulRouter {
    client: reqwest::Client,
    base_url: String,
    session: Arc<Mutex<String>>,
}

#[derive(Serialize)]
struct SessionCreateRequest {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "TTL")]
    ttl: String,
    #[serde(rename = "Behavior")]
    behavior: String,
    #[serde(rename = "LockDelay")]
    lock_delay: String,
}

#[derive(Deserialize)]
struct SessionCreateResponse {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Deserialize)]
struct KvEntry {
    #[serde(rename = "Value")]
    value: Option<String>,
    #[serde(rename = "Session")]
    session: Option<String>,
}

fn backend_error(error: reqwest::Error) -> RoutingError {
    RoutingError::Backend(error.to_string())
}

fn decode_kv_value(value: &str) -> Result<SessionRoute, RoutingError> {
    let raw = BASE64
        .decode(value.as_bytes())
        .map_err(|e| RoutingError::Backend(format!("bad KV encoding: {e}")))?;
    serde_json::from_slice(&raw).map_err(|e| RoutingError::Backend(format!("bad KV value: {e}")))
}

impl ConsulRouter {
    pub async fn new(base_url: &str, ttl: Duration, node_name: &str) -> Result<Self, RoutingError> {
        let client = reqwest::Client::new();
        let base_url = base_url.trim_end_matches('/').to_owned();
        let session_id = Self::create_session(&client, &base_url, ttl, node_name).await?;
        info!(session=%session_id, "Consul session established");

        let session = Arc::new(Mutex::new(session_id));

        tokio::spawn({
            let client = client.clone();
            let base_url = base_url.clone();
            let session = session.clone();
            let node_name = node_name.to_owned();
            async move {
                let mut interval = tokio::time::interval(ttl / 2);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    let current = session.lock().await.clone();
                    let url = format!("{base_url}/v1/session/renew/{current}");
                    let renewed = match client.put(&url).send().await {
                        Ok(resp) => resp.status().is_success(),
                        Err(error) => {
                            warn!(%error, "Consul session renewal failed");
                            false
                        }
                    };
                    if !renewed {
                        match Self::create_session(&client, &base_url, ttl, &node_name).await {
                            Ok(fresh) => {
                                warn!(session=%fresh, "Consul session recreated");
                                *session.lock().await = fresh;
                            }
                            Err(error) => {
                                warn!(%error, "Could not recreate Consul session");
                            }
                        }
                    }
                }
            }
        });

        Ok(Self {
            client,
            base_url,
            session,
        })
    }

    async fn create_session(
        client: &reqwest::Client,
        base_url: &str,
        ttl: Duration,
        node_name: &str,
    ) -> Result<String, RoutingError> {
        let request = SessionCreateRequest {
            name: format!("uptermd-{node_name}"),
            ttl: format!("{}s", ttl.as_secs()),
            behavior: "delete".to_owned(),
            lock_delay: LOCK_DELAY.to_owned(),
        };
        let url = format!("{base_url}/v1/session/create");
        let response: SessionCreateResponse = client
            .put(&url)
            .json(&request)
            .send()
            .await
            .map_err(backend_error)?
            .error_for_status()
            .map_err(backend_error)?
            .json()
            .await
            .map_err(backend_error)?;
        Ok(response.id)
    }

    fn kv_url(&self, session_id: &str) -> String {
        format!("{}/v1/kv/{}{}", self.base_url, KV_PREFIX, session_id)
    }

    async fn fetch_entry(&self, session_id: &str) -> Result<Option<KvEntry>, RoutingError> {
        let response = self
            .client
            .get(self.kv_url(session_id))
            .send()
            .await
            .map_err(backend_error)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let entries: Vec<KvEntry> = response
            .error_for_status()
            .map_err(backend_error)?
            .json()
            .await
            .map_err(backend_error)?;
        Ok(entries.into_iter().next())
    }
}

#[async_trait]
impl SessionRouter for ConsulRouter {
    async fn publish(
        &self,
        session_id: &str,
        route: SessionRoute,
    ) -> Result<RouteLease, RoutingError> {
        let consul_session = self.session.lock().await.clone();
        let url = format!("{}?acquire={}", self.kv_url(session_id), consul_session);
        let acquired: String = self
            .client
            .put(&url)
            .json(&route)
            .send()
            .await
            .map_err(backend_error)?
            .error_for_status()
            .map_err(backend_error)?
            .text()
            .await
            .map_err(backend_error)?;

        if acquired.trim() != "true" {
            return Err(RoutingError::AlreadyExists(session_id.to_owned()));
        }

        Ok(RouteLease {
            session_id: session_id.to_owned(),
            token: Uuid::new_v4(),
        })
    }

    async fn resolve(&self, session_id: &str) -> Result<SessionRoute, RoutingError> {
        // Replication lag can make a freshly published session invisible
        // for a moment; retry before reporting NotFound.
        let mut backoff = RESOLVE_BACKOFF_BASE;
        for attempt in 0..=RESOLVE_RETRIES {
            match self.fetch_entry(session_id).await? {
                Some(KvEntry {
                    value: Some(value), ..
                }) => return decode_kv_value(&value),
                _ => {
                    if attempt < RESOLVE_RETRIES {
                        debug!(session=%session_id, ?backoff, "Session not in KV yet, retrying");
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }
        Err(RoutingError::NotFound(session_id.to_owned()))
    }

    async fn release(&self, lease: &RouteLease) -> Result<(), RoutingError> {
        let consul_session = self.session.lock().await.clone();
        let url = format!("{}?release={}", self.kv_url(&lease.session_id), consul_session);
        let _ = self.client.put(&url).send().await.map_err(backend_error)?;

        // Only delete the key while it is ours (or already unlocked);
        // a new owner's entry must survive a stale release.
        match self.fetch_entry(&lease.session_id).await? {
            Some(entry) if entry.session.is_none() || entry.session.as_deref() == Some(&*consul_session) => {
                let _ = self
                    .client
                    .delete(self.kv_url(&lease.session_id))
                    .send()
                    .await
                    .map_err(backend_error)?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn watch(&self, session_id: &str) -> Result<RouteWatch, RoutingError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let client = self.client.clone();
        let url = self.kv_url(session_id);
        let session_id: SessionId = session_id.to_owned();

        tokio::spawn(async move {
            let mut index: u64 = 0;
            let mut last_present: Option<bool> = None;
            loop {
                let request = if index == 0 {
                    client.get(url.clone())
                } else {
                    client.get(format!("{url}?index={index}&wait={WATCH_WAIT}"))
                };
                let response = match request.send().await {
                    Ok(response) => response,
                    Err(error) => {
                        debug!(session=%session_id, %error, "Watch poll failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };

                if let Some(value) = response.headers().get("X-Consul-Index") {
                    if let Ok(next) = value.to_str().unwrap_or("0").parse::<u64>() {
                        index = next;
                    }
                }

                let present = if response.status() == reqwest::StatusCode::NOT_FOUND {
                    None
                } else {
                    response
                        .json::<Vec<KvEntry>>()
                        .await
                        .ok()
                        .and_then(|mut entries| entries.drain(..).next())
                        .and_then(|entry| entry.value)
                        .and_then(|value| decode_kv_value(&value).ok())
                };

                let is_present = present.is_some();
                if last_present != Some(is_present) {
                    last_present = Some(is_present);
                    let event = match present {
                        Some(route) => RouteEvent::Present(route.node_addr),
                        None => RouteEvent::Gone,
                    };
                    if tx.send(event).is_err() {
                        break;
                    }
                }
            }
        });

        Ok(RouteWatch::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use time::OffsetDateTime;

    use super::*;

    #[test]
    fn test_decode_kv_value_roundtrip() {
        let route = SessionRoute {
            node_addr: "10.0.0.2:2222".to_owned(),
            ssh_user: "abc:MTAuMC4wLjI6MjIyMg".to_owned(),
            created_at: OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
        };
        let encoded = BASE64.encode(&serde_json::to_vec(&route).unwrap());
        let decoded = decode_kv_value(&encoded).unwrap();
        assert_eq!(decoded, route);
    }

    #[test]
    fn test_decode_kv_value_rejects_garbage() {
        assert!(decode_kv_value("!!not-base64!!").is_err());
        let not_json = BASE64.encode(b"hello");
        assert!(decode_kv_value(&not_json).is_err());
    }

    #[test]
    fn test_kv_entry_parse() {
        let body = r#"[{
            "Key": "upterm/sessions/s1",
            "Value": "eyJ4IjogMX0=",
            "Session": "adf4238a-882b-9ddc-4a9d-5b6758e4159e",
            "ModifyIndex": 42
        }]"#;
        let entries: Vec<KvEntry> = serde_json::from_str(body).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].value.is_some());
        assert!(entries[0].session.is_some());
    }
}
