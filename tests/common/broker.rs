//! In-process STOMP broker
//!
//! Speaks just enough STOMP 1.2 over tokio-tungstenite for the client:
//! `CONNECT` (optionally rejected with an `ERROR`), `SUBSCRIBE`,
//! `UNSUBSCRIBE`, `SEND` and `DISCONNECT`. Tests publish `MESSAGE` frames
//! and can drop every live connection to force a reconnect.

use campus_chat::client::stomp::{decode_lossy, Command, Decoded, Frame};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;

/// What the broker has seen so far
#[derive(Debug, Default, Clone)]
pub struct BrokerLog {
    /// `Authorization` header of every `CONNECT`
    pub connects: Vec<Option<String>>,
    /// `(connection, id, destination)` of every `SUBSCRIBE`
    pub subscribes: Vec<(usize, String, String)>,
    /// `(connection, id)` of every `UNSUBSCRIBE`
    pub unsubscribes: Vec<(usize, String)>,
    /// `(destination, body)` of every `SEND`
    pub sends: Vec<(String, String)>,
    pub disconnects: usize,
}

enum Outbound {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

struct Connection {
    outbound: mpsc::UnboundedSender<Outbound>,
    /// subscription id -> destination
    subscriptions: HashMap<String, String>,
}

#[derive(Default)]
struct BrokerState {
    log: BrokerLog,
    connections: HashMap<usize, Connection>,
    next_connection: usize,
    reject_with: Option<String>,
    next_message_id: u64,
}

pub struct TestBroker {
    addr: SocketAddr,
    state: Arc<Mutex<BrokerState>>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

impl TestBroker {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind broker");
        let addr = listener.local_addr().expect("broker address");
        let state = Arc::new(Mutex::new(BrokerState::default()));

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, accept_state.clone()));
            }
        });

        Self {
            addr,
            state,
            accept_task,
        }
    }

    /// Broker URL with the raw-WebSocket session path
    pub fn url(&self) -> String {
        format!("ws://{}/ws/websocket", self.addr)
    }

    pub fn log(&self) -> BrokerLog {
        self.state.lock().unwrap().log.clone()
    }

    /// Answer every further `CONNECT` with an `ERROR` carrying `message`
    pub fn reject_connects(&self, message: &str) {
        self.state.lock().unwrap().reject_with = Some(message.to_string());
    }

    pub fn accept_connects(&self) {
        self.state.lock().unwrap().reject_with = None;
    }

    pub fn live_connections(&self) -> usize {
        self.state.lock().unwrap().connections.len()
    }

    /// Live subscriptions to `destination` across connections
    pub fn subscribers_of(&self, destination: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .connections
            .values()
            .flat_map(|c| c.subscriptions.values())
            .filter(|d| d.as_str() == destination)
            .count()
    }

    /// Send a `MESSAGE` to every live subscription of `destination`.
    /// Returns how many subscriptions it reached.
    pub fn publish(&self, destination: &str, body: &str) -> usize {
        let mut state = self.state.lock().unwrap();
        let mut targets = Vec::new();
        for connection in state.connections.values() {
            for (id, dest) in &connection.subscriptions {
                if dest == destination {
                    targets.push((connection.outbound.clone(), id.clone()));
                }
            }
        }
        for (outbound, id) in &targets {
            state.next_message_id += 1;
            let frame = Frame::new(Command::Message)
                .header("destination", destination)
                .header("subscription", id.as_str())
                .header("message-id", format!("m-{}", state.next_message_id))
                .header("content-type", "application/json")
                .with_body(body);
            let _ = outbound.send(Outbound::Text(frame.encode()));
        }
        targets.len()
    }

    /// Push a raw binary WebSocket message to every live connection
    pub fn push_binary(&self, data: &[u8]) {
        let state = self.state.lock().unwrap();
        for connection in state.connections.values() {
            let _ = connection.outbound.send(Outbound::Binary(data.to_vec()));
        }
    }

    /// Push a raw text payload to every live connection, unchecked
    pub fn push_text(&self, payload: &str) {
        let state = self.state.lock().unwrap();
        for connection in state.connections.values() {
            let _ = connection.outbound.send(Outbound::Text(payload.to_string()));
        }
    }

    /// `MESSAGE` frame for the first live subscription of `destination`
    pub fn message_frame(&self, destination: &str, body: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        let id = state
            .connections
            .values()
            .flat_map(|c| c.subscriptions.iter())
            .find(|(_, dest)| dest.as_str() == destination)
            .map(|(id, _)| id.clone())?;
        let frame = Frame::new(Command::Message)
            .header("destination", destination)
            .header("subscription", id)
            .header("message-id", "m-raw")
            .header("content-type", "application/json")
            .with_body(body);
        Some(frame.encode())
    }

    /// Close every live connection from the broker side
    pub fn drop_connections(&self) {
        let state = self.state.lock().unwrap();
        for connection in state.connections.values() {
            let _ = connection.outbound.send(Outbound::Close);
        }
    }
}

async fn serve(stream: TcpStream, state: Arc<Mutex<BrokerState>>) {
    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut sink, mut incoming) = ws.split();
    let (outbound, mut queue) = mpsc::unbounded_channel();

    let id = {
        let mut state = state.lock().unwrap();
        let id = state.next_connection;
        state.next_connection += 1;
        state.connections.insert(
            id,
            Connection {
                outbound: outbound.clone(),
                subscriptions: HashMap::new(),
            },
        );
        id
    };

    loop {
        tokio::select! {
            message = incoming.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        if !handle_text(id, &text, &state, &outbound) {
                            // let the queued reply go out before closing
                            while let Ok(Outbound::Text(reply)) = queue.try_recv() {
                                let _ = sink.send(Message::Text(reply)).await;
                            }
                            let _ = sink.close().await;
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
            queued = queue.recv() => {
                match queued {
                    Some(Outbound::Text(text)) => {
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Binary(data)) => {
                        if sink.send(Message::Binary(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = sink.close().await;
                        break;
                    }
                }
            }
        }
    }

    state.lock().unwrap().connections.remove(&id);
}

/// Returns `false` when the connection must be closed
fn handle_text(
    id: usize,
    text: &str,
    state: &Arc<Mutex<BrokerState>>,
    outbound: &mpsc::UnboundedSender<Outbound>,
) -> bool {
    let (decoded, _) = decode_lossy(text);
    let mut state = state.lock().unwrap();
    for item in decoded {
        let Decoded::Frame(frame) = item else {
            continue;
        };
        match frame.command {
            Command::Connect | Command::Stomp => {
                state
                    .log
                    .connects
                    .push(frame.get("Authorization").map(str::to_string));
                if let Some(message) = state.reject_with.clone() {
                    let error = Frame::new(Command::Error).header("message", message);
                    let _ = outbound.send(Outbound::Text(error.encode()));
                    return false;
                }
                let connected = Frame::new(Command::Connected)
                    .header("version", "1.2")
                    .header("heart-beat", "0,0");
                let _ = outbound.send(Outbound::Text(connected.encode()));
            }
            Command::Subscribe => {
                let sub_id = frame.get("id").unwrap_or_default().to_string();
                let destination = frame.destination().unwrap_or_default().to_string();
                state
                    .log
                    .subscribes
                    .push((id, sub_id.clone(), destination.clone()));
                if let Some(connection) = state.connections.get_mut(&id) {
                    connection.subscriptions.insert(sub_id, destination);
                }
            }
            Command::Unsubscribe => {
                let sub_id = frame.get("id").unwrap_or_default().to_string();
                state.log.unsubscribes.push((id, sub_id.clone()));
                if let Some(connection) = state.connections.get_mut(&id) {
                    connection.subscriptions.remove(&sub_id);
                }
            }
            Command::Send => {
                let destination = frame.destination().unwrap_or_default().to_string();
                state.log.sends.push((destination, frame.body.clone()));
            }
            Command::Disconnect => {
                state.log.disconnects += 1;
                if let Some(receipt) = frame.get("receipt") {
                    let reply = Frame::new(Command::Receipt).header("receipt-id", receipt);
                    let _ = outbound.send(Outbound::Text(reply.encode()));
                }
                return false;
            }
            _ => {}
        }
    }
    true
}
