use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ReconnectPolicy;
use crate::error::ConnectionError;
use crate::types::{ClientIntent, ServerEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_CAPACITY: usize = 256;
const OUTBOUND_CAPACITY: usize = 64;

/// What a channel reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Transport is up and `join_game` has been queued as the first frame.
    Connected,
    /// A decoded server event, forwarded as-is.
    Server(ServerEvent),
    Disconnected { reason: String },
    Reconnecting { attempt: u32, delay: Duration },
    /// The retry ceiling was hit; the channel task has exited.
    ReconnectExhausted,
}

/// A channel event tagged with the channel that produced it, so events from
/// a torn-down channel can be told apart from the current one.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub channel_id: Uuid,
    pub event: ChannelEvent,
}

/// Intents and the close request share one queue so a `leave_game` sent
/// right before `disconnect` still goes out first.
#[derive(Debug)]
enum Outbound {
    Intent(ClientIntent),
    Close,
}

struct Channel {
    id: Uuid,
    room_code: String,
    out_tx: mpsc::Sender<Outbound>,
    connected: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Owns at most one channel to the game server at a time.
pub struct ConnectionManager {
    server_url: String,
    policy: ReconnectPolicy,
    event_tx: mpsc::Sender<Envelope>,
    channel: Option<Channel>,
}

impl ConnectionManager {
    /// Returns the manager and the receiver every channel reports into.
    pub fn new(server_url: impl Into<String>, policy: ReconnectPolicy) -> (Self, mpsc::Receiver<Envelope>) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let manager = Self {
            server_url: server_url.into(),
            policy,
            event_tx,
            channel: None,
        };
        (manager, event_rx)
    }

    /// Open a channel for `room_code`. A live channel for the same room is
    /// kept; a channel for another room is torn down first.
    pub fn connect(&mut self, room_code: &str, self_id: &str) -> Uuid {
        if let Some(channel) = &self.channel {
            if channel.room_code == room_code && !channel.task.is_finished() {
                debug!(channel = %channel.id, "already connected to room {}", room_code);
                return channel.id;
            }
            self.disconnect();
        }

        let id = Uuid::new_v4();
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));

        let join = ClientIntent::JoinGame {
            room_code: room_code.to_string(),
            player_id: self_id.to_string(),
        };
        let emitter = Emitter {
            channel_id: id,
            tx: self.event_tx.clone(),
        };
        let task = tokio::spawn(channel_task(
            self.server_url.clone(),
            self.policy.clone(),
            join,
            out_rx,
            emitter,
            connected.clone(),
        ));

        info!(channel = %id, "opening channel to {} for room {}", self.server_url, room_code);

        self.channel = Some(Channel {
            id,
            room_code: room_code.to_string(),
            out_tx,
            connected,
            task,
        });
        id
    }

    /// Transmit an intent. Nothing is queued while the transport is down,
    /// and a full outbound queue is reported rather than waited on; in both
    /// cases the intent is dropped.
    pub fn send(&self, intent: ClientIntent) -> Result<(), ConnectionError> {
        let Some(channel) = &self.channel else {
            warn!("dropping {}: no channel", intent.name());
            return Err(ConnectionError::NotConnected);
        };
        if !channel.connected.load(Ordering::Acquire) {
            warn!(channel = %channel.id, "dropping {}: not connected", intent.name());
            return Err(ConnectionError::NotConnected);
        }
        channel.out_tx.try_send(Outbound::Intent(intent)).map_err(|e| match e {
            TrySendError::Full(intent) => {
                warn!(channel = %channel.id, "dropping {:?}: outbound queue full", intent);
                ConnectionError::Backlogged
            }
            TrySendError::Closed(_) => ConnectionError::Closed,
        })
    }

    /// Tear down the current channel. Safe to call any number of times.
    pub fn disconnect(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.connected.store(false, Ordering::Release);
            // With the queue full the sender drop below still ends the task
            // once queued intents are flushed.
            let _ = channel.out_tx.try_send(Outbound::Close);
            info!(channel = %channel.id, "closing channel for room {}", channel.room_code);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.channel
            .as_ref()
            .is_some_and(|c| c.connected.load(Ordering::Acquire))
    }

    pub fn channel_id(&self) -> Option<Uuid> {
        self.channel.as_ref().map(|c| c.id)
    }

    pub fn room_code(&self) -> Option<&str> {
        self.channel.as_ref().map(|c| c.room_code.as_str())
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

struct Emitter {
    channel_id: Uuid,
    tx: mpsc::Sender<Envelope>,
}

impl Emitter {
    /// Waits for room when the owner falls behind. A dropped owner is not an
    /// error; the close request follows.
    async fn emit(&self, event: ChannelEvent) {
        let _ = self
            .tx
            .send(Envelope {
                channel_id: self.channel_id,
                event,
            })
            .await;
    }
}

/// How one transport connection ended.
enum Ended {
    /// Close was requested locally.
    Closed,
    /// `heard` is set once the server sent at least one frame on this
    /// connection.
    Lost { reason: String, heard: bool },
}

async fn channel_task(
    url: String,
    policy: ReconnectPolicy,
    join: ClientIntent,
    mut out_rx: mpsc::Receiver<Outbound>,
    emitter: Emitter,
    connected: Arc<AtomicBool>,
) {
    let mut attempts: u32 = 0;

    loop {
        match open(&url, &mut out_rx).await {
            None => return,
            Some(Ok(stream)) => {
                connected.store(true, Ordering::Release);
                emitter.emit(ChannelEvent::Connected).await;

                let ended = drive(stream, &join, &mut out_rx, &emitter).await;
                connected.store(false, Ordering::Release);

                match ended {
                    Ended::Closed => {
                        debug!(channel = %emitter.channel_id, "channel closed");
                        return;
                    }
                    Ended::Lost { reason, heard } => {
                        // A server that accepts and hangs up straight away
                        // still counts against the ceiling.
                        if heard {
                            attempts = 0;
                        }
                        warn!(channel = %emitter.channel_id, "connection lost: {}", reason);
                        emitter.emit(ChannelEvent::Disconnected { reason }).await;
                    }
                }
            }
            Some(Err(e)) => {
                warn!(channel = %emitter.channel_id, "connect to {} failed: {}", url, e);
            }
        }

        if policy.exhausted(attempts) {
            warn!(channel = %emitter.channel_id, "giving up after {} reconnect attempts", attempts);
            emitter.emit(ChannelEvent::ReconnectExhausted).await;
            return;
        }

        let delay = policy.delay(attempts);
        attempts += 1;
        emitter
            .emit(ChannelEvent::Reconnecting {
                attempt: attempts,
                delay,
            })
            .await;

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                cmd = out_rx.recv() => match cmd {
                    Some(Outbound::Intent(intent)) => {
                        warn!(channel = %emitter.channel_id, "dropping {} while reconnecting", intent.name());
                    }
                    Some(Outbound::Close) | None => return,
                },
            }
        }
    }
}

/// Connect, unless a close request arrives first (then `None`).
async fn open(
    url: &str,
    out_rx: &mut mpsc::Receiver<Outbound>,
) -> Option<Result<WsStream, tungstenite::Error>> {
    let connecting = tokio_tungstenite::connect_async(url);
    tokio::pin!(connecting);

    loop {
        tokio::select! {
            result = &mut connecting => return Some(result.map(|(stream, _)| stream)),
            cmd = out_rx.recv() => match cmd {
                Some(Outbound::Intent(intent)) => {
                    warn!("dropping {} while connecting", intent.name());
                }
                Some(Outbound::Close) | None => return None,
            },
        }
    }
}

async fn drive(
    stream: WsStream,
    join: &ClientIntent,
    out_rx: &mut mpsc::Receiver<Outbound>,
    emitter: &Emitter,
) -> Ended {
    let (mut sink, mut incoming) = stream.split();
    let mut heard = false;

    // Membership is reasserted on every connect; the server is not assumed
    // to remember us across transports.
    if let Err(e) = send_intent(&mut sink, join).await {
        return Ended::Lost { reason: e.to_string(), heard };
    }

    loop {
        tokio::select! {
            frame = incoming.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    heard = true;
                    match ServerEvent::decode(&text) {
                        Ok(event) => {
                            debug!(channel = %emitter.channel_id, event = event.name(), "received");
                            emitter.emit(ChannelEvent::Server(event)).await;
                        }
                        Err(e) => warn!(channel = %emitter.channel_id, "dropping malformed frame: {}", e),
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Ended::Lost { reason: "server closed the channel".to_string(), heard },
                Some(Ok(_)) => {}
                Some(Err(e)) => return Ended::Lost { reason: e.to_string(), heard },
            },
            cmd = out_rx.recv() => match cmd {
                Some(Outbound::Intent(intent)) => {
                    if let Err(e) = send_intent(&mut sink, &intent).await {
                        return Ended::Lost { reason: e.to_string(), heard };
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    let _ = sink.close().await;
                    return Ended::Closed;
                }
            },
        }
    }
}

async fn send_intent(
    sink: &mut SplitSink<WsStream, Message>,
    intent: &ClientIntent,
) -> Result<(), tungstenite::Error> {
    let json = match intent.encode() {
        Ok(json) => json,
        Err(e) => {
            warn!("failed to encode {}: {}", intent.name(), e);
            return Ok(());
        }
    };
    sink.send(Message::Text(json.into())).await?;
    debug!(intent = intent.name(), "sent");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A url nothing listens on: bind an ephemeral port, then release it.
    fn dead_url() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("ws://{addr}/ws")
    }

    fn unreachable_manager() -> (ConnectionManager, mpsc::Receiver<Envelope>) {
        let policy = ReconnectPolicy {
            max_attempts: 0,
            ..ReconnectPolicy::default()
        };
        ConnectionManager::new(dead_url(), policy)
    }

    fn freeze() -> ClientIntent {
        ClientIntent::FreezePlayer {
            room_code: "ROOM42".into(),
            frozen_player_id: "p1".into(),
            mraz_id: "p2".into(),
        }
    }

    #[test]
    fn send_without_channel_fails() {
        let (manager, _rx) = unreachable_manager();
        assert!(matches!(manager.send(freeze()), Err(ConnectionError::NotConnected)));
        assert!(!manager.is_connected());
        assert_eq!(manager.channel_id(), None);
    }

    #[tokio::test]
    async fn connect_is_idempotent_per_room() {
        let (mut manager, _rx) = ConnectionManager::new(dead_url(), ReconnectPolicy::default());

        let first = manager.connect("ROOM42", "p1");
        let again = manager.connect("ROOM42", "p1");
        assert_eq!(first, again);
        assert_eq!(manager.room_code(), Some("ROOM42"));

        let other = manager.connect("ROOM99", "p1");
        assert_ne!(first, other);
        assert_eq!(manager.room_code(), Some("ROOM99"));
    }

    #[tokio::test]
    async fn send_while_connecting_is_not_queued() {
        let (mut manager, _rx) = unreachable_manager();
        manager.connect("ROOM42", "p1");
        assert!(matches!(manager.send(freeze()), Err(ConnectionError::NotConnected)));
    }

    #[tokio::test]
    async fn disconnect_twice_is_harmless() {
        let (mut manager, _rx) = unreachable_manager();
        manager.connect("ROOM42", "p1");
        manager.disconnect();
        manager.disconnect();
        assert_eq!(manager.channel_id(), None);
        assert!(matches!(manager.send(freeze()), Err(ConnectionError::NotConnected)));
    }

    #[tokio::test]
    async fn full_outbound_queue_is_reported() {
        let (mut manager, _rx) = unreachable_manager();
        // A connected channel whose transport never drains the queue.
        let (out_tx, _out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        manager.channel = Some(Channel {
            id: Uuid::new_v4(),
            room_code: "ROOM42".into(),
            out_tx,
            connected: Arc::new(AtomicBool::new(true)),
            task: tokio::spawn(std::future::pending()),
        });

        for _ in 0..OUTBOUND_CAPACITY {
            manager.send(freeze()).unwrap();
        }
        assert!(matches!(manager.send(freeze()), Err(ConnectionError::Backlogged)));

        manager.disconnect();
        assert!(matches!(manager.send(freeze()), Err(ConnectionError::NotConnected)));
    }

    #[tokio::test]
    async fn unreachable_server_exhausts_retries() {
        let (mut manager, mut rx) = unreachable_manager();
        let id = manager.connect("ROOM42", "p1");

        let envelope = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.channel_id, id);
        assert_eq!(envelope.event, ChannelEvent::ReconnectExhausted);
    }
}
