//! Typed fabric events and the bus that fans them out.
//!
//! The bus is a single dispatcher task that owns the subscriber set; all
//! mutation reaches it as channel messages, so the set needs no lock. Each
//! subscriber ([`Sink`]) has a filter and a bounded event channel; a sink
//! that does not drain within [`SINK_SEND_TIMEOUT`] is scheduled for
//! asynchronous unsubscription and its channel is closed.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::Error as _;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::mpsc;
use tracing::debug;

use crate::admin::{Mount, Server};

/// Per-sink event channel depth. One slot is enough: the send timeout is
/// the load-shedding knob, not the buffer.
const SINK_CAPACITY: usize = 1;
/// How long a publish waits for one sink before evicting it.
const SINK_SEND_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventType {
    ServerAdd = 1,
    ServerRemove = 2,
    MountAdd = 3,
    MountUpdate = 4,
    MountRemove = 5,
    FileServe = 6,
}

impl EventType {
    pub const ALL: [EventType; 6] = [
        EventType::ServerAdd,
        EventType::ServerRemove,
        EventType::MountAdd,
        EventType::MountUpdate,
        EventType::MountRemove,
        EventType::FileServe,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }

    pub fn all() -> HashSet<EventType> {
        Self::ALL.into_iter().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEvent {
    pub server: Server,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountEvent {
    pub server: Server,
    pub mount: Mount,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileServeEvent {
    pub server: Server,
    pub path: String,
    pub code: u16,
}

/// A fabric event: the type tag plus a snapshot of the affected resources.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ServerAdd(ServerEvent),
    ServerRemove(ServerEvent),
    MountAdd(MountEvent),
    MountUpdate(MountEvent),
    MountRemove(MountEvent),
    FileServe(FileServeEvent),
}

impl Event {
    pub fn event_type(&self) -> EventType {
        match self {
            Event::ServerAdd(_) => EventType::ServerAdd,
            Event::ServerRemove(_) => EventType::ServerRemove,
            Event::MountAdd(_) => EventType::MountAdd,
            Event::MountUpdate(_) => EventType::MountUpdate,
            Event::MountRemove(_) => EventType::MountRemove,
            Event::FileServe(_) => EventType::FileServe,
        }
    }
}

// The wire envelope is `{"Type": <1..6>, "Resource": {...}}`, with
// capitalized keys; the resource payloads use lowercase keys.
impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut envelope = serializer.serialize_struct("Event", 2)?;
        envelope.serialize_field("Type", &self.event_type().code())?;
        match self {
            Event::ServerAdd(r) | Event::ServerRemove(r) => {
                envelope.serialize_field("Resource", r)?
            }
            Event::MountAdd(r) | Event::MountUpdate(r) | Event::MountRemove(r) => {
                envelope.serialize_field("Resource", r)?
            }
            Event::FileServe(r) => envelope.serialize_field("Resource", r)?,
        }
        envelope.end()
    }
}

impl<'de> Deserialize<'de> for Event {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Envelope {
            #[serde(rename = "Type")]
            type_code: u8,
            #[serde(rename = "Resource")]
            resource: serde_json::Value,
        }

        let envelope = Envelope::deserialize(deserializer)?;
        let event_type = EventType::from_code(envelope.type_code)
            .ok_or_else(|| D::Error::custom(format!("unknown event type {}", envelope.type_code)))?;
        let resource = envelope.resource;
        let event = match event_type {
            EventType::ServerAdd => {
                Event::ServerAdd(serde_json::from_value(resource).map_err(D::Error::custom)?)
            }
            EventType::ServerRemove => {
                Event::ServerRemove(serde_json::from_value(resource).map_err(D::Error::custom)?)
            }
            EventType::MountAdd => {
                Event::MountAdd(serde_json::from_value(resource).map_err(D::Error::custom)?)
            }
            EventType::MountUpdate => {
                Event::MountUpdate(serde_json::from_value(resource).map_err(D::Error::custom)?)
            }
            EventType::MountRemove => {
                Event::MountRemove(serde_json::from_value(resource).map_err(D::Error::custom)?)
            }
            EventType::FileServe => {
                Event::FileServe(serde_json::from_value(resource).map_err(D::Error::custom)?)
            }
        };
        Ok(event)
    }
}

pub type SinkId = u64;

struct Sink {
    id: SinkId,
    filter: HashSet<EventType>,
    tx: mpsc::Sender<Event>,
}

enum BusMsg {
    Subscribe(Sink),
    Unsubscribe(SinkId),
    Publish(Event),
}

/// Handle to the event bus. Cloning shares the same dispatcher.
#[derive(Clone)]
pub struct EventBus {
    msg_tx: mpsc::Sender<BusMsg>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    /// Spawn the dispatcher task and return a handle to it.
    pub fn start() -> Self {
        let (msg_tx, msg_rx) = mpsc::channel(16);
        tokio::spawn(dispatch(msg_rx, msg_tx.clone()));
        Self {
            msg_tx,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register a sink interested in `filter`. The returned receiver yields
    /// matching events until the sink is unsubscribed or evicted, at which
    /// point the channel closes.
    pub async fn subscribe(&self, filter: HashSet<EventType>) -> (SinkId, mpsc::Receiver<Event>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SINK_CAPACITY);
        let _ = self
            .msg_tx
            .send(BusMsg::Subscribe(Sink { id, filter, tx }))
            .await;
        (id, rx)
    }

    pub async fn unsubscribe(&self, id: SinkId) {
        let _ = self.msg_tx.send(BusMsg::Unsubscribe(id)).await;
    }

    /// Publish an event to every sink whose filter matches. Never blocks
    /// the caller beyond the dispatcher queue.
    pub async fn publish(&self, event: Event) {
        let _ = self.msg_tx.send(BusMsg::Publish(event)).await;
    }
}

async fn dispatch(mut msg_rx: mpsc::Receiver<BusMsg>, msg_tx: mpsc::Sender<BusMsg>) {
    let mut sinks: HashMap<SinkId, Sink> = HashMap::new();
    while let Some(msg) = msg_rx.recv().await {
        match msg {
            BusMsg::Subscribe(sink) => {
                debug!(sink = sink.id, "event sink subscribed");
                sinks.insert(sink.id, sink);
            }
            BusMsg::Unsubscribe(id) => {
                // Dropping the sink closes its channel, which is the
                // writer's signal to send a Close frame and exit.
                if sinks.remove(&id).is_some() {
                    debug!(sink = id, "event sink unsubscribed");
                }
            }
            BusMsg::Publish(event) => {
                for sink in sinks.values() {
                    if !sink.filter.contains(&event.event_type()) {
                        continue;
                    }
                    let sent =
                        tokio::time::timeout(SINK_SEND_TIMEOUT, sink.tx.send(event.clone())).await;
                    match sent {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) | Err(_) => {
                            // Receiver gone or not draining. Unsubscribe
                            // asynchronously; the dispatcher moves on.
                            debug!(sink = sink.id, "evicting slow event sink");
                            let msg_tx = msg_tx.clone();
                            let id = sink.id;
                            tokio::spawn(async move {
                                let _ = msg_tx.send(BusMsg::Unsubscribe(id)).await;
                            });
                        }
                    }
                }
            }
        }
    }
}
