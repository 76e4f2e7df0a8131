//! TCP bridge to the line's message broker.
//!
//! The broker side runs a small gateway that speaks newline-delimited JSON
//! envelopes, one message per line:
//!
//! ```text
//!  controller ──▶ {"client_id": "fill_controller", "subscribe": ["sensor/level", ..]}
//!  broker     ──▶ {"topic": "sensor/level", "payload": {"can_id": 7, "level_ml": 301.4}}
//!  controller ──▶ {"topic": "valve/command", "qos": 1, "payload": {"action": "open", ..}}
//! ```
//!
//! Two blocking loops share one socket: [`LineBusBridge::run_reader`] feeds
//! the runtime's control queue, [`LineBusBridge::run_writer`] drains its
//! outbound queue.  Run each on its own thread.  Either side reports a
//! broken socket as [`ControlMsg::BusLost`].

use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use futures_lite::future;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::BusConfig;
use crate::error::BusError;
use crate::events::{ControlMsg, OutboundMsg};
use crate::runtime::Runtime;

/// Lines longer than this are dropped unparsed.
const MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
struct InboundEnvelope {
    topic: String,
    payload: Value,
}

#[derive(Debug, Serialize)]
struct OutboundEnvelope<'a> {
    topic: &'a str,
    qos: u8,
    payload: Value,
}

#[derive(Debug, Serialize)]
struct Hello<'a> {
    client_id: &'a str,
    subscribe: &'a [&'a str],
}

pub struct LineBusBridge {
    stream: TcpStream,
    peer: String,
}

impl LineBusBridge {
    pub fn connect(cfg: &BusConfig) -> Result<Self, BusError> {
        let peer = format!("{}:{}", cfg.host, cfg.port);
        let stream =
            TcpStream::connect(&peer).map_err(|e| BusError::ConnectFailed(format!("{peer}: {e}")))?;
        let _ = stream.set_nodelay(true);
        info!("BUS | connected to {}", peer);
        Ok(Self { stream, peer })
    }

    /// Retry [`connect`](Self::connect) up to `attempts` times.
    pub fn connect_with_retry(
        cfg: &BusConfig,
        attempts: u32,
        delay: Duration,
    ) -> Result<Self, BusError> {
        let mut last = BusError::ConnectFailed("no attempts made".into());
        for attempt in 1..=attempts {
            match Self::connect(cfg) {
                Ok(bridge) => return Ok(bridge),
                Err(e) => {
                    warn!("BUS | connect attempt {}/{} failed: {}", attempt, attempts, e);
                    last = e;
                }
            }
            if attempt < attempts {
                std::thread::sleep(delay);
            }
        }
        Err(last)
    }

    /// Announce the client and the topics it consumes.
    pub fn subscribe(&self, client_id: &str, topics: &[&str]) -> Result<(), BusError> {
        let hello = Hello {
            client_id,
            subscribe: topics,
        };
        let line = serde_json::to_vec(&hello).map_err(|_| BusError::PublishFailed)?;
        self.write_line(&line)?;
        info!("BUS | subscribed to {}", topics.join(", "));
        Ok(())
    }

    /// Forward every inbound line to the runtime until the socket closes,
    /// then post [`ControlMsg::BusLost`].
    pub fn run_reader(&self, runtime: &Runtime) {
        let mut reader = BufReader::new(&self.stream);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => {
                    info!("BUS | {} closed the connection", self.peer);
                    break;
                }
                Ok(_) => {
                    if let Some(msg) = decode_line(&line) {
                        if !runtime.post(msg) {
                            debug!("BUS | dispatcher stopped, reader exiting");
                            return;
                        }
                    }
                }
                Err(e) => {
                    warn!("BUS | read from {} failed: {}", self.peer, e);
                    break;
                }
            }
        }
        report_loss(runtime);
    }

    /// Write every outbound publication until [`OutboundMsg::Close`].
    ///
    /// A failed write posts [`ControlMsg::BusLost`]; the queue is then
    /// drained without writing until `Close`.
    pub fn run_writer(&self, runtime: &Runtime) {
        let mut broken = false;
        loop {
            match future::block_on(runtime.outbound().receive()) {
                OutboundMsg::Publish { topic, payload } => {
                    if broken {
                        debug!("BUS | dropping publication on {} after write failure", topic);
                        continue;
                    }
                    let line = encode_publication(&topic, &payload);
                    if let Err(e) = self.write_line(&line) {
                        warn!("BUS | write to {} failed: {}", self.peer, e);
                        broken = true;
                        report_loss(runtime);
                    }
                }
                OutboundMsg::Close => {
                    debug!("BUS | writer closing");
                    return;
                }
            }
        }
    }

    /// Close both directions, unblocking the reader.
    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn write_line(&self, line: &[u8]) -> Result<(), BusError> {
        let mut w = &self.stream;
        w.write_all(line)
            .and_then(|()| w.write_all(b"\n"))
            .and_then(|()| w.flush())
            .map_err(|_| BusError::Disconnected)
    }
}

fn report_loss(runtime: &Runtime) {
    if !runtime.post(ControlMsg::BusLost) {
        debug!("BUS | dispatcher already stopped, loss not reported");
    }
}

/// Unwrap one broker line into an inbound control message.  Framing
/// errors are logged and dropped here; payload errors are the router's.
fn decode_line(line: &str) -> Option<ControlMsg> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if line.len() > MAX_LINE_BYTES {
        warn!("BUS | dropped oversized line ({} bytes)", line.len());
        return None;
    }
    let env: InboundEnvelope = match serde_json::from_str(line) {
        Ok(env) => env,
        Err(e) => {
            warn!("BUS | dropped unframed line: {}", e);
            return None;
        }
    };
    let payload = match env.payload {
        // Some gateways forward the raw MQTT payload as a string.
        Value::String(s) => s.into_bytes(),
        other => serde_json::to_vec(&other).unwrap_or_default(),
    };
    Some(ControlMsg::Inbound {
        topic: env.topic,
        payload,
    })
}

fn encode_publication(topic: &str, payload: &[u8]) -> Vec<u8> {
    let payload = serde_json::from_slice(payload)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(payload).into_owned()));
    let env = OutboundEnvelope {
        topic,
        qos: 1,
        payload,
    };
    serde_json::to_vec(&env).unwrap_or_default()
}
