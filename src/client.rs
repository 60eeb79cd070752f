//! Typed client for the kraken admin API, used by krakenctl.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use reqwest::StatusCode;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use url::Url;

use crate::admin::{
    CreateServerMountRequest, CreateServerRequest, Mount, Route, Server, EVENTS_QUERY_KEY,
};
use crate::events::{Event, EventType};

pub struct Client {
    http: reqwest::Client,
    base: Url,
}

impl Client {
    pub fn new(base: Url) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http, base })
    }

    fn url(&self, route: &Route) -> Url {
        route.url(&self.base)
    }

    pub async fn servers(&self) -> Result<Vec<Server>> {
        let resp = self.http.get(self.url(&Route::Servers)).send().await?;
        Ok(expect_status(resp, StatusCode::OK).await?.json().await?)
    }

    pub async fn server(&self, port: u16) -> Result<Server> {
        let resp = self
            .http
            .get(self.url(&Route::Server { port }))
            .send()
            .await?;
        Ok(expect_status(resp, StatusCode::OK).await?.json().await?)
    }

    /// Create a server on an ephemeral port.
    pub async fn add_server(&self, req: &CreateServerRequest) -> Result<Server> {
        let resp = self
            .http
            .post(self.url(&Route::Servers))
            .json(req)
            .send()
            .await?;
        Ok(expect_status(resp, StatusCode::CREATED)
            .await?
            .json()
            .await?)
    }

    /// Create a server on a specific port.
    pub async fn add_server_at(&self, port: u16, req: &CreateServerRequest) -> Result<Server> {
        let resp = self
            .http
            .put(self.url(&Route::Server { port }))
            .json(req)
            .send()
            .await?;
        Ok(expect_status(resp, StatusCode::OK).await?.json().await?)
    }

    pub async fn remove_server(&self, port: u16) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(&Route::Server { port }))
            .send()
            .await?;
        expect_status(resp, StatusCode::OK).await?;
        Ok(())
    }

    pub async fn remove_all_servers(&self) -> Result<()> {
        let resp = self.http.delete(self.url(&Route::Servers)).send().await?;
        expect_status(resp, StatusCode::OK).await?;
        Ok(())
    }

    pub async fn mounts(&self, port: u16) -> Result<Vec<Mount>> {
        let resp = self
            .http
            .get(self.url(&Route::Mounts { port }))
            .send()
            .await?;
        Ok(expect_status(resp, StatusCode::OK).await?.json().await?)
    }

    pub async fn mount(&self, port: u16, id: &str) -> Result<Mount> {
        let route = Route::Mount {
            port,
            id: id.to_string(),
        };
        let resp = self.http.get(self.url(&route)).send().await?;
        Ok(expect_status(resp, StatusCode::OK).await?.json().await?)
    }

    pub async fn add_mount(&self, port: u16, req: &CreateServerMountRequest) -> Result<Mount> {
        let resp = self
            .http
            .post(self.url(&Route::Mounts { port }))
            .json(req)
            .send()
            .await?;
        Ok(expect_status(resp, StatusCode::CREATED)
            .await?
            .json()
            .await?)
    }

    pub async fn remove_mount(&self, port: u16, id: &str) -> Result<()> {
        let route = Route::Mount {
            port,
            id: id.to_string(),
        };
        let resp = self.http.delete(self.url(&route)).send().await?;
        expect_status(resp, StatusCode::OK).await?;
        Ok(())
    }

    pub async fn remove_all_mounts(&self, port: u16) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(&Route::Mounts { port }))
            .send()
            .await?;
        expect_status(resp, StatusCode::OK).await?;
        Ok(())
    }

    pub async fn file_servers(&self) -> Result<Vec<String>> {
        let resp = self.http.get(self.url(&Route::FileServers)).send().await?;
        Ok(expect_status(resp, StatusCode::OK).await?.json().await?)
    }

    /// Dial the websocket events endpoint and forward decoded events to
    /// `events_tx` until the server closes the stream. `names` are the
    /// human-readable filter groups; empty means all events.
    pub async fn listen_events(
        &self,
        names: &[String],
        events_tx: mpsc::Sender<Event>,
    ) -> Result<()> {
        let mut url = self.url(&Route::Events);
        let ws_scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(ws_scheme)
            .map_err(|_| anyhow!("cannot derive a websocket URL from {}", self.base))?;
        if !names.is_empty() {
            let codes: Vec<String> = event_codes(names)?
                .into_iter()
                .map(|c| c.to_string())
                .collect();
            url.set_query(Some(&format!("{}={}", EVENTS_QUERY_KEY, codes.join(","))));
        }

        let (ws, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect to {}", url))?;
        let (mut ws_tx, mut ws_rx) = ws.split();

        while let Some(msg) = ws_rx.next().await {
            match msg? {
                Message::Text(payload) => {
                    let event: Event =
                        serde_json::from_str(&payload).context("failed to decode event")?;
                    if events_tx.send(event).await.is_err() {
                        break;
                    }
                }
                Message::Ping(data) => {
                    ws_tx.send(Message::Pong(data)).await?;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        Ok(())
    }
}

/// Map filter-group names to event-type codes.
pub fn event_codes(names: &[String]) -> Result<Vec<u8>> {
    let mut codes = Vec::new();
    for name in names {
        match name.as_str() {
            "server" => codes.extend([
                EventType::ServerAdd.code(),
                EventType::ServerRemove.code(),
            ]),
            "mount" => codes.extend([
                EventType::MountAdd.code(),
                EventType::MountRemove.code(),
                EventType::MountUpdate.code(),
            ]),
            "fileserve" => codes.push(EventType::FileServe.code()),
            other => bail!("unknown event {:?}", other),
        }
    }
    Ok(codes)
}

async fn expect_status(resp: reqwest::Response, expected: StatusCode) -> Result<reqwest::Response> {
    if resp.status() != expected {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        bail!("error {}: {}", status.as_u16(), body.trim());
    }
    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_codes_groups() {
        let codes = event_codes(&["server".to_string()]).unwrap();
        assert_eq!(codes, vec![1, 2]);
        let codes = event_codes(&["mount".to_string(), "fileserve".to_string()]).unwrap();
        assert_eq!(codes, vec![3, 5, 4, 6]);
        assert!(event_codes(&["meow".to_string()]).is_err());
    }
}
