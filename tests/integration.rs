//! Integration tests for the kraken fabric: the admin API, the spawned
//! servers and the websocket event stream, all in-process.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use url::Url;

use kraken::admin::AdminHandler;
use kraken::beachplug;
use kraken::client::Client;
use kraken::events::{Event, EventBus, EventType};
use kraken::fileserver::Registry;
use kraken::server::ServerPool;

struct TestDaemon {
    base: Url,
    http: reqwest::Client,
    _shutdown_tx: watch::Sender<bool>,
}

impl TestDaemon {
    async fn start() -> Self {
        let mut registry = Registry::new();
        registry
            .register("beachplug", beachplug::constructor())
            .unwrap();
        let pool = Arc::new(ServerPool::new(Arc::new(registry)));
        {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.listen().await });
        }

        let bus = EventBus::start();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let base = Url::parse(&format!("http://{}", addr)).unwrap();
        let handler = AdminHandler::new(pool, bus, base.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            let _ = handler.run(listener, shutdown_rx).await;
        });

        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap();
        Self {
            base,
            http,
            _shutdown_tx: shutdown_tx,
        }
    }

    fn client(&self) -> Client {
        Client::new(self.base.clone()).unwrap()
    }

    fn api(&self, path: &str) -> String {
        format!("{}api{}", self.base, path)
    }

    async fn create_server(&self) -> (u16, serde_json::Value) {
        let resp = self
            .http
            .post(self.api("/servers"))
            .json(&json!({"bind_address": "127.0.0.1"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::CREATED);
        let body: serde_json::Value = resp.json().await.unwrap();
        let port = body["port"].as_u64().unwrap() as u16;
        assert_ne!(port, 0);
        (port, body)
    }

    async fn create_mount(&self, port: u16, target: &str, source: &str, fs_type: &str) -> String {
        let resp = self
            .http
            .post(self.api(&format!("/servers/{}/mounts", port)))
            .json(&json!({
                "target": target,
                "source": source,
                "fs_type": fs_type,
                "fs_params": {},
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::CREATED);
        let body: serde_json::Value = resp.json().await.unwrap();
        body["id"].as_str().unwrap().to_string()
    }
}

fn scratch_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("hello.txt"), b"hello from kraken").unwrap();
    dir
}

#[tokio::test]
async fn test_server_pool_lifecycle() {
    let daemon = TestDaemon::start().await;

    let resp = daemon
        .http
        .post(daemon.api("/servers"))
        .json(&json!({"bind_address": "127.0.0.1"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::CREATED);
    let location = resp
        .headers()
        .get("location")
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_string();
    let body: serde_json::Value = resp.json().await.unwrap();
    let port = body["port"].as_u64().unwrap() as u16;
    assert_ne!(port, 0);
    assert_eq!(body["bind_address"], "127.0.0.1");
    assert!(location.ends_with(&format!("/api/servers/{}", port)));

    // The new server shows up in the listing.
    let resp = daemon.http.get(daemon.api("/servers")).send().await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let servers: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(servers.as_array().unwrap().len(), 1);
    assert_eq!(servers[0]["port"].as_u64().unwrap() as u16, port);

    let resp = daemon
        .http
        .get(daemon.api(&format!("/servers/{}", port)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);

    let resp = daemon
        .http
        .delete(daemon.api(&format!("/servers/{}", port)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);

    let resp = daemon
        .http
        .get(daemon.api(&format!("/servers/{}", port)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_prefix_routing_end_to_end() {
    let daemon = TestDaemon::start().await;
    let dir = scratch_dir();
    let (port, _) = daemon.create_server().await;
    daemon
        .create_mount(port, "/foo", dir.path().to_str().unwrap(), "default")
        .await;

    let resp = daemon
        .http
        .get(format!("http://127.0.0.1:{}/foo/hello.txt", port))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "hello from kraken");
}

#[tokio::test]
async fn test_root_mount_sees_full_path() {
    let daemon = TestDaemon::start().await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("home/x")).unwrap();
    std::fs::write(dir.path().join("home/x/a.txt"), b"root mount").unwrap();
    let (port, _) = daemon.create_server().await;
    daemon
        .create_mount(port, "/", dir.path().to_str().unwrap(), "default")
        .await;

    let resp = daemon
        .http
        .get(format!("http://127.0.0.1:{}/home/x/a.txt", port))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "root mount");
}

#[tokio::test]
async fn test_bare_mount_target_redirects() {
    let daemon = TestDaemon::start().await;
    let dir = scratch_dir();
    let (port, _) = daemon.create_server().await;
    daemon
        .create_mount(port, "/baz", dir.path().to_str().unwrap(), "default")
        .await;

    let resp = daemon
        .http
        .get(format!("http://127.0.0.1:{}/baz", port))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::MOVED_PERMANENTLY);
    assert_eq!(
        resp.headers().get("location").unwrap().to_str().unwrap(),
        "/baz/"
    );
}

#[tokio::test]
async fn test_unmatched_path_is_404() {
    let daemon = TestDaemon::start().await;
    let (port, _) = daemon.create_server().await;

    let resp = daemon
        .http
        .get(format!("http://127.0.0.1:{}/meow", port))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_mount_resource_round_trip() {
    let daemon = TestDaemon::start().await;
    let dir = scratch_dir();
    let source = dir.path().to_str().unwrap();
    let (port, _) = daemon.create_server().await;
    let id = daemon.create_mount(port, "/pics", source, "default").await;
    assert_eq!(id.len(), 7);

    let resp = daemon
        .http
        .get(daemon.api(&format!("/servers/{}/mounts/{}", port, id)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let mount: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(mount["target"], "/pics");
    assert_eq!(mount["source"], source);

    let resp = daemon
        .http
        .delete(daemon.api(&format!("/servers/{}/mounts/{}", port, id)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);

    let resp = daemon
        .http
        .get(daemon.api(&format!("/servers/{}/mounts/{}", port, id)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_mount_update_replaces_source() {
    let daemon = TestDaemon::start().await;
    let dir_a = scratch_dir();
    let dir_b = scratch_dir();
    let (port, _) = daemon.create_server().await;

    let id_a = daemon
        .create_mount(port, "/m", dir_a.path().to_str().unwrap(), "default")
        .await;
    let id_b = daemon
        .create_mount(port, "/m", dir_b.path().to_str().unwrap(), "default")
        .await;
    // Same target, same id; the source changed underneath.
    assert_eq!(id_a, id_b);

    let client = daemon.client();
    let mounts = client.mounts(port).await.unwrap();
    assert_eq!(mounts.len(), 1);
    assert_eq!(mounts[0].source, dir_b.path().to_str().unwrap());

    client.remove_all_mounts(port).await.unwrap();
    assert!(client.mounts(port).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_mounts_are_rejected_as_json() {
    let daemon = TestDaemon::start().await;
    let dir = scratch_dir();
    let (port, _) = daemon.create_server().await;

    // Bad target: no leading slash.
    let resp = daemon
        .http
        .post(daemon.api(&format!("/servers/{}/mounts", port)))
        .json(&json!({"target": "pics", "source": dir.path().to_str().unwrap()}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["type"], "bad_request_error");

    // Bad source: not a directory.
    let resp = daemon
        .http
        .post(daemon.api(&format!("/servers/{}/mounts", port)))
        .json(&json!({
            "target": "/pics",
            "source": dir.path().join("hello.txt").to_str().unwrap(),
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["type"], "bad_request_error");
}

#[tokio::test]
async fn test_fileservers_listing() {
    let daemon = TestDaemon::start().await;
    let types = daemon.client().file_servers().await.unwrap();
    assert!(types.contains(&"default".to_string()));
    assert!(types.contains(&"beachplug".to_string()));
}

#[tokio::test]
async fn test_etag_round_trip() {
    let daemon = TestDaemon::start().await;
    daemon.create_server().await;

    let resp = daemon.http.get(daemon.api("/servers")).send().await.unwrap();
    let etag = resp
        .headers()
        .get("etag")
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_string();

    let resp = daemon.http.get(daemon.api("/servers")).send().await.unwrap();
    assert_eq!(
        resp.headers().get("etag").unwrap().to_str().unwrap(),
        etag,
        "identical listings carry identical ETags"
    );

    let resp = daemon
        .http
        .get(daemon.api("/servers"))
        .header("If-None-Match", &etag)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_MODIFIED);
}

#[tokio::test]
async fn test_remove_all_servers() {
    let daemon = TestDaemon::start().await;
    daemon.create_server().await;
    daemon.create_server().await;

    let client = daemon.client();
    assert_eq!(client.servers().await.unwrap().len(), 2);
    client.remove_all_servers().await.unwrap();
    assert!(client.servers().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_event_fan_out_with_filter() {
    let daemon = TestDaemon::start().await;

    let mut ws_url = daemon.base.clone();
    ws_url.set_scheme("ws").unwrap();
    ws_url.set_path("/api/events");
    ws_url.set_query(Some(&format!("e={}", EventType::ServerAdd.code())));
    let (mut ws, _) = connect_async(ws_url.as_str()).await.unwrap();

    let (port_a, _) = daemon.create_server().await;
    let (_port_b, _) = daemon.create_server().await;
    let resp = daemon
        .http
        .delete(daemon.api(&format!("/servers/{}", port_a)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);

    // Exactly two ServerAdd frames; the remove is filtered out.
    for _ in 0..2 {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("expected an event frame")
            .unwrap()
            .unwrap();
        let payload = match msg {
            Message::Text(payload) => payload,
            other => panic!("unexpected frame: {:?}", other),
        };
        let event: Event = serde_json::from_str(&payload).unwrap();
        assert_eq!(event.event_type(), EventType::ServerAdd);
    }
    assert!(
        tokio::time::timeout(Duration::from_millis(500), ws.next())
            .await
            .is_err(),
        "no further frames expected"
    );
}

#[tokio::test]
async fn test_client_listen_events_sees_mount_and_serve() {
    let daemon = TestDaemon::start().await;
    let dir = scratch_dir();

    let (events_tx, mut events_rx) = mpsc::channel(16);
    let client = daemon.client();
    tokio::spawn(async move { client.listen_events(&[], events_tx).await });
    // Let the subscription settle before driving the fabric.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (port, _) = daemon.create_server().await;
    daemon
        .create_mount(port, "/files", dir.path().to_str().unwrap(), "default")
        .await;
    let resp = daemon
        .http
        .get(format!("http://127.0.0.1:{}/files/hello.txt", port))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);

    let mut seen = Vec::new();
    for _ in 0..3 {
        let event = tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .expect("expected an event")
            .unwrap();
        seen.push(event.event_type());
    }
    assert_eq!(
        seen,
        vec![
            EventType::ServerAdd,
            EventType::MountAdd,
            EventType::FileServe
        ]
    );
}

#[tokio::test]
async fn test_beachplug_backend_lists_directories() {
    let daemon = TestDaemon::start().await;
    let dir = scratch_dir();
    std::fs::create_dir(dir.path().join("photos")).unwrap();
    let (port, _) = daemon.create_server().await;
    daemon
        .create_mount(port, "/pub", dir.path().to_str().unwrap(), "beachplug")
        .await;

    let resp = daemon
        .http
        .get(format!("http://127.0.0.1:{}/pub/", port))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let page = resp.text().await.unwrap();
    assert!(page.contains("photos/"));
    assert!(page.contains("hello.txt"));
}

#[tokio::test]
async fn test_unknown_fs_type_falls_back_to_default() {
    let daemon = TestDaemon::start().await;
    let dir = scratch_dir();
    let (port, _) = daemon.create_server().await;
    daemon
        .create_mount(port, "/x", dir.path().to_str().unwrap(), "no-such-backend")
        .await;

    let resp = daemon
        .http
        .get(format!("http://127.0.0.1:{}/x/hello.txt", port))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
}
