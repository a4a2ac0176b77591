//! Scripted in-process MQTT v3.1.1 broker
//!
//! Speaks just enough of the protocol for one client at a time: CONNECT,
//! SUBSCRIBE, UNSUBSCRIBE, PUBLISH (QoS 0/1), PINGREQ and DISCONNECT.
//! Tests script how each CONNECT is answered, push PUBLISH packets to the
//! client, drop the connection, and inspect what the client sent.

use bytes::{Buf, BytesMut};
use rumqttc::{
    ConnAck, ConnectReturnCode, PingResp, PubAck, Publish, QoS, SubAck, SubscribeReasonCode,
    UnsubAck,
};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How the broker answers the next CONNECT
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConnectBehavior {
    Accept { session_present: bool },
    Refuse(ConnectReturnCode),
    /// Never send a CONNACK
    Ignore,
}

/// A PUBLISH received from the client
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}

enum Command {
    Publish(Publish),
    Drop,
}

#[derive(Default)]
struct BrokerState {
    script: VecDeque<ConnectBehavior>,
    connects: usize,
    client_ids: Vec<String>,
    /// Filters subscribed on the current connection
    active: Vec<String>,
    /// Filter lists of every SUBSCRIBE packet, across connections
    subscribe_packets: Vec<Vec<(String, u8)>>,
    unsubscribed: Vec<String>,
    published: Vec<ReceivedPublish>,
    graceful_disconnects: usize,
    connection: Option<mpsc::UnboundedSender<Command>>,
}

pub struct FakeBroker {
    addr: SocketAddr,
    state: Arc<Mutex<BrokerState>>,
    accept_task: JoinHandle<()>,
}

impl FakeBroker {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake broker");
        let addr = listener.local_addr().expect("fake broker address");
        let state = Arc::new(Mutex::new(BrokerState::default()));

        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let (tx, rx) = mpsc::unbounded_channel();
                accept_state.lock().unwrap().connection = Some(tx);
                tokio::spawn(serve(socket, Arc::clone(&accept_state), rx));
            }
        });

        Self {
            addr,
            state,
            accept_task,
        }
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Queue answers for upcoming CONNECTs; unscripted ones are accepted
    pub fn script(&self, behaviors: impl IntoIterator<Item = ConnectBehavior>) {
        self.state.lock().unwrap().script.extend(behaviors);
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.state.lock().unwrap().client_ids.clone()
    }

    /// Filters subscribed on the live connection, sorted
    pub fn active_subscriptions(&self) -> Vec<String> {
        let mut active = self.state.lock().unwrap().active.clone();
        active.sort();
        active
    }

    pub fn subscribe_packets(&self) -> Vec<Vec<(String, u8)>> {
        self.state.lock().unwrap().subscribe_packets.clone()
    }

    pub fn unsubscribed(&self) -> Vec<String> {
        self.state.lock().unwrap().unsubscribed.clone()
    }

    pub fn published(&self) -> Vec<ReceivedPublish> {
        self.state.lock().unwrap().published.clone()
    }

    pub fn graceful_disconnects(&self) -> usize {
        self.state.lock().unwrap().graceful_disconnects
    }

    /// Send a QoS 0 PUBLISH to the connected client
    pub fn push(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        self.send(Command::Publish(Publish::new(topic, QoS::AtMostOnce, payload.into())));
    }

    /// Close the client's socket without a DISCONNECT
    pub fn drop_connection(&self) {
        self.send(Command::Drop);
    }

    /// Stop accepting connections; the port refuses from now on
    pub fn stop(&self) {
        self.accept_task.abort();
        self.drop_connection();
    }

    fn send(&self, command: Command) {
        if let Some(tx) = &self.state.lock().unwrap().connection {
            let _ = tx.send(command);
        }
    }
}

impl Drop for FakeBroker {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` passes
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn serve(
    mut socket: TcpStream,
    state: Arc<Mutex<BrokerState>>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let mut buffer = BytesMut::with_capacity(4096);
    state.lock().unwrap().active.clear();

    loop {
        while let Some((header, body)) = next_frame(&mut buffer) {
            let mut out = BytesMut::new();
            let keep_open = handle_packet(header, body, &state, &mut out);
            if !out.is_empty() && socket.write_all(&out).await.is_err() {
                return;
            }
            if !keep_open {
                return;
            }
        }

        tokio::select! {
            read = socket.read_buf(&mut buffer) => {
                if matches!(read, Ok(0) | Err(_)) {
                    return;
                }
            }
            command = commands.recv() => match command {
                Some(Command::Publish(publish)) => {
                    let mut out = BytesMut::new();
                    publish.write(&mut out).expect("encode PUBLISH");
                    if socket.write_all(&out).await.is_err() {
                        return;
                    }
                }
                Some(Command::Drop) | None => return,
            },
        }
    }
}

/// Split one complete packet off the buffer: (first header byte, body)
fn next_frame(buffer: &mut BytesMut) -> Option<(u8, BytesMut)> {
    let mut remaining = 0usize;
    let mut header_len = 1;
    loop {
        let byte = *buffer.get(header_len)?;
        remaining |= usize::from(byte & 0x7f) << (7 * (header_len - 1));
        header_len += 1;
        if byte & 0x80 == 0 {
            break;
        }
    }
    if buffer.len() < header_len + remaining {
        return None;
    }
    let header = buffer[0];
    buffer.advance(header_len);
    Some((header, buffer.split_to(remaining)))
}

fn read_string(body: &mut BytesMut) -> String {
    let len = usize::from(body.get_u16());
    let raw = body.split_to(len);
    String::from_utf8_lossy(&raw).into_owned()
}

/// Returns false when the connection should be closed
fn handle_packet(
    header: u8,
    mut body: BytesMut,
    state: &Mutex<BrokerState>,
    out: &mut BytesMut,
) -> bool {
    let mut state = state.lock().unwrap();
    match header >> 4 {
        // CONNECT
        1 => {
            let _protocol = read_string(&mut body);
            body.advance(4); // level, flags, keep alive
            let client_id = read_string(&mut body);
            state.connects += 1;
            state.client_ids.push(client_id);

            let behavior = state.script.pop_front().unwrap_or(ConnectBehavior::Accept {
                session_present: false,
            });
            match behavior {
                ConnectBehavior::Accept { session_present } => {
                    ConnAck::new(ConnectReturnCode::Success, session_present)
                        .write(out)
                        .expect("encode CONNACK");
                    true
                }
                ConnectBehavior::Refuse(code) => {
                    ConnAck::new(code, false).write(out).expect("encode CONNACK");
                    false
                }
                ConnectBehavior::Ignore => true,
            }
        }
        // PUBLISH
        3 => {
            let qos = (header >> 1) & 0x03;
            let topic = read_string(&mut body);
            let pkid = if qos > 0 { Some(body.get_u16()) } else { None };
            state.published.push(ReceivedPublish {
                topic,
                payload: body.to_vec(),
                qos,
                retain: header & 0x01 == 1,
            });
            if let (Some(pkid), 1) = (pkid, qos) {
                PubAck::new(pkid).write(out).expect("encode PUBACK");
            }
            true
        }
        // SUBSCRIBE
        8 => {
            let pkid = body.get_u16();
            let mut filters = Vec::new();
            while body.has_remaining() {
                let filter = read_string(&mut body);
                let qos = body.get_u8();
                filters.push((filter, qos));
            }

            let granted = filters
                .iter()
                .map(|(_, qos)| match qos {
                    0 => SubscribeReasonCode::Success(QoS::AtMostOnce),
                    1 => SubscribeReasonCode::Success(QoS::AtLeastOnce),
                    _ => SubscribeReasonCode::Success(QoS::ExactlyOnce),
                })
                .collect();
            for (filter, _) in &filters {
                if !state.active.contains(filter) {
                    state.active.push(filter.clone());
                }
            }
            state.subscribe_packets.push(filters);
            SubAck::new(pkid, granted).write(out).expect("encode SUBACK");
            true
        }
        // UNSUBSCRIBE
        10 => {
            let pkid = body.get_u16();
            while body.has_remaining() {
                let filter = read_string(&mut body);
                state.active.retain(|active| active != &filter);
                state.unsubscribed.push(filter);
            }
            UnsubAck::new(pkid).write(out).expect("encode UNSUBACK");
            true
        }
        // PINGREQ
        12 => {
            PingResp.write(out).expect("encode PINGRESP");
            true
        }
        // DISCONNECT
        14 => {
            state.graceful_disconnects += 1;
            false
        }
        _ => true,
    }
}
