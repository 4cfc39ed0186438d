use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};

use frosttag::config::{ClientConfig, ReconnectPolicy};
use frosttag::game::SessionView;

const DEADLINE: Duration = Duration::from_secs(5);

/// A scripted game server. Every accepted socket is handed to the test as a
/// [`MockPeer`].
pub struct TestServer {
    pub addr: SocketAddr,
    peers: mpsc::UnboundedReceiver<MockPeer>,
    _shutdown: tokio::task::JoinHandle<()>,
}

impl TestServer {
    pub async fn new() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (peer_tx, peers) = mpsc::unbounded_channel();
        let app = Router::new().route("/ws", get(ws_handler)).with_state(peer_tx);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Give the server a moment to start accepting
        tokio::time::sleep(Duration::from_millis(20)).await;

        Self {
            addr,
            peers,
            _shutdown: handle,
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Wait for the next client connection (5s timeout).
    pub async fn accept(&mut self) -> MockPeer {
        tokio::time::timeout(DEADLINE, self.peers.recv())
            .await
            .expect("Timed out waiting for a client connection")
            .expect("Server stopped")
    }

    /// Try to accept a connection, returning None on timeout.
    pub async fn try_accept(&mut self, timeout_ms: u64) -> Option<MockPeer> {
        tokio::time::timeout(Duration::from_millis(timeout_ms), self.peers.recv())
            .await
            .ok()
            .flatten()
    }
}

/// One client connection as seen by the server.
pub struct MockPeer {
    incoming: mpsc::UnboundedReceiver<Value>,
    outgoing: mpsc::UnboundedSender<String>,
}

impl MockPeer {
    /// Read the next client frame as JSON (5s timeout).
    pub async fn recv(&mut self) -> Value {
        tokio::time::timeout(DEADLINE, self.incoming.recv())
            .await
            .expect("Timed out waiting for a client frame")
            .expect("Client closed the connection")
    }

    /// Read the next frame and check its event name. Returns the payload.
    pub async fn expect(&mut self, event: &str) -> Value {
        let frame = self.recv().await;
        assert_eq!(frame["event"], event, "unexpected frame: {frame}");
        frame["data"].clone()
    }

    /// Try to read a frame, returning None on timeout.
    pub async fn try_recv(&mut self, timeout_ms: u64) -> Option<Value> {
        tokio::time::timeout(Duration::from_millis(timeout_ms), self.incoming.recv())
            .await
            .ok()
            .flatten()
    }

    /// Wait until the client closes its end (5s timeout).
    pub async fn closed(&mut self) {
        tokio::time::timeout(DEADLINE, async {
            if let Some(frame) = self.incoming.recv().await {
                panic!("Expected close, got: {frame}");
            }
        })
        .await
        .expect("Timed out waiting for the client to close");
    }

    /// Push a server event to the client.
    pub fn push(&self, event: &str, data: Value) {
        self.push_raw(json!({ "event": event, "data": data }).to_string());
    }

    pub fn push_raw(&self, text: impl Into<String>) {
        self.outgoing.send(text.into()).unwrap();
    }

    /// Close the socket from the server side.
    pub fn hang_up(self) {
        drop(self);
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(peers): State<mpsc::UnboundedSender<MockPeer>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_peer(socket, peers))
}

async fn serve_peer(socket: WebSocket, peers: mpsc::UnboundedSender<MockPeer>) {
    let (in_tx, incoming) = mpsc::unbounded_channel();
    let (outgoing, mut out_rx) = mpsc::unbounded_channel::<String>();
    if peers.send(MockPeer { incoming, outgoing }).is_err() {
        return;
    }

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let value: Value = serde_json::from_str(text.as_str()).unwrap();
                    let _ = in_tx.send(value);
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => {}
            },
            out = out_rx.recv() => match out {
                Some(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        return;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                }
            },
        }
    }
}

/// Client config pointed at `url` with fast, deterministic retries.
pub fn client_config(url: &str) -> ClientConfig {
    ClientConfig {
        server_url: url.to_string(),
        tick_interval_ms: 1000,
        reconnect: ReconnectPolicy {
            max_attempts: 3,
            base_delay_ms: 20,
            max_delay_ms: 100,
            jitter: 0.0,
        },
    }
}

/// A url nothing listens on.
pub fn dead_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{addr}/ws")
}

/// Wait until the published view satisfies `pred` (5s timeout).
pub async fn wait_view(rx: &watch::Receiver<SessionView>, pred: impl FnMut(&SessionView) -> bool) -> SessionView {
    let mut rx = rx.clone();
    tokio::time::timeout(DEADLINE, rx.wait_for(pred))
        .await
        .expect("Timed out waiting for view")
        .expect("Game task dropped the view")
        .clone()
}

/// Snapshot payload for `game_started` with `frost` as the Frost.
pub fn game_started(frost: &str, players: &[&str], round: u32) -> Value {
    let statuses: serde_json::Map<String, Value> = players
        .iter()
        .map(|id| {
            let status = if *id == frost { "mraz" } else { "active" };
            (id.to_string(), json!(status))
        })
        .collect();
    json!({
        "mraz_id": frost,
        "player_statuses": statuses,
        "round_number": round,
    })
}
