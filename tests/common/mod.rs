#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]
#![allow(
    unused,
    reason = "Not every test binary uses every helper"
)]

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt as _, StreamExt as _};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

/// How the mock answers client frames.
#[derive(Default)]
struct Behavior {
    /// Topics answered with an error frame
    reject: Mutex<HashSet<String>>,
    /// Topics never answered
    silent: Mutex<HashSet<String>>,
    mute_pongs: AtomicBool,
    pings: AtomicUsize,
    last_query: Mutex<Option<String>>,
}

impl Behavior {
    fn reply(&self, frame: &Value) -> Option<Value> {
        let id = frame["id"].clone();
        match frame["type"].as_str()? {
            "ping" => {
                self.pings.fetch_add(1, Ordering::SeqCst);
                (!self.mute_pongs.load(Ordering::SeqCst)).then(|| json!({ "id": id, "type": "pong" }))
            }
            "subscribe" | "unsubscribe" => {
                let topic = frame["topic"].as_str()?;
                if self.silent.lock().unwrap().contains(topic) {
                    return None;
                }
                if self.reject.lock().unwrap().contains(topic) {
                    return Some(json!({
                        "id": id,
                        "type": "error",
                        "code": 404,
                        "data": format!("topic {topic} is not found")
                    }));
                }
                Some(json!({ "id": id, "type": "ack" }))
            }
            _ => None,
        }
    }
}

/// Mock push server speaking the welcome / ack / pong protocol.
pub struct MockWsServer {
    addr: SocketAddr,
    /// Broadcast messages to ALL connected clients
    push_tx: broadcast::Sender<String>,
    /// Drops every live connection
    kick_tx: broadcast::Sender<()>,
    /// Every client frame except pings
    frames_rx: mpsc::UnboundedReceiver<Value>,
    behavior: Arc<Behavior>,
    connections: Arc<AtomicUsize>,
}

impl MockWsServer {
    /// Start a mock WebSocket server on a random port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (push_tx, _) = broadcast::channel::<String>(100);
        let (kick_tx, _) = broadcast::channel::<()>(4);
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let behavior = Arc::new(Behavior::default());
        let connections = Arc::new(AtomicUsize::new(0));

        let push = push_tx.clone();
        let kick = kick_tx.clone();
        let state = Arc::clone(&behavior);
        let count = Arc::clone(&connections);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                let query = Arc::clone(&state);
                let record = move |request: &Request, response: Response| {
                    *query.last_query.lock().unwrap() = request.uri().query().map(str::to_owned);
                    Ok::<_, ErrorResponse>(response)
                };
                let Ok(ws_stream) = tokio_tungstenite::accept_hdr_async(stream, record).await
                else {
                    continue;
                };

                count.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(
                    ws_stream,
                    push.subscribe(),
                    kick.subscribe(),
                    frames_tx.clone(),
                    Arc::clone(&state),
                ));
            }
        });

        Self {
            addr,
            push_tx,
            kick_tx,
            frames_rx,
            behavior,
            connections,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("ws://{}/", self.addr)
    }

    /// Send a frame to all connected clients.
    pub fn push(&self, frame: &Value) {
        drop(self.push_tx.send(frame.to_string()));
    }

    /// Close every live connection without a close handshake.
    pub fn disconnect_all(&self) {
        drop(self.kick_tx.send(()));
    }

    /// Receive the next non-ping client frame.
    pub async fn next_frame(&mut self) -> Value {
        timeout(Duration::from_secs(5), self.frames_rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    pub fn reject(&self, topic: &str) {
        self.behavior.reject.lock().unwrap().insert(topic.to_owned());
    }

    pub fn silence(&self, topic: &str) {
        self.behavior.silent.lock().unwrap().insert(topic.to_owned());
    }

    pub fn mute_pongs(&self, mute: bool) {
        self.behavior.mute_pongs.store(mute, Ordering::SeqCst);
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.behavior.pings.load(Ordering::SeqCst)
    }

    /// Query string of the most recent handshake.
    pub fn last_query(&self) -> Option<String> {
        self.behavior.last_query.lock().unwrap().clone()
    }
}

async fn serve(
    ws_stream: WebSocketStream<TcpStream>,
    mut push_rx: broadcast::Receiver<String>,
    mut kick_rx: broadcast::Receiver<()>,
    frames_tx: mpsc::UnboundedSender<Value>,
    behavior: Arc<Behavior>,
) {
    let (mut write, mut read) = ws_stream.split();

    let welcome = json!({ "id": "welcome", "type": "welcome" }).to_string();
    if write.send(Message::Text(welcome.into())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            msg = read.next() => {
                let Some(Ok(msg)) = msg else {
                    break;
                };
                let Message::Text(text) = msg else {
                    continue;
                };
                let frame: Value = serde_json::from_str(text.as_str()).unwrap();

                if let Some(reply) = behavior.reply(&frame)
                    && write.send(Message::Text(reply.to_string().into())).await.is_err()
                {
                    break;
                }
                if frame["type"] != "ping" {
                    drop(frames_tx.send(frame));
                }
            }
            msg = push_rx.recv() => {
                let Ok(text) = msg else {
                    break;
                };
                if write.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            _ = kick_rx.recv() => break,
        }
    }
}

/// An endpoint nothing listens on.
pub async fn refused_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{addr}/")
}
