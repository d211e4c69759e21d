//! Routing of comm traffic emitted by the worker.
//!
//! Comms are bidirectional channels opened by either side (`comm_open`),
//! carrying arbitrary JSON (`comm_msg`) until one side closes them
//! (`comm_close`). The engine forwards everything the worker emits to a
//! [`CommRouter`]. [`CommRegistry`] is the default router and keeps the
//! current state of every open comm.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use jupyter_protocol::{CommClose, CommMsg, CommOpen};

#[derive(Debug, Clone)]
pub enum CommMessage {
    Open(CommOpen),
    Msg(CommMsg),
    Close(CommClose),
}

impl CommMessage {
    pub fn comm_id(&self) -> &str {
        match self {
            Self::Open(open) => &open.comm_id.0,
            Self::Msg(msg) => &msg.comm_id.0,
            Self::Close(close) => &close.comm_id.0,
        }
    }
}

pub trait CommRouter: Send + Sync {
    fn route(&self, message: CommMessage);
}

/// Current view of one open comm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommSnapshot {
    pub comm_id: String,
    pub target_name: String,
    /// `data.state` from the open, with later `update` deltas merged in.
    pub state: Map<String, Value>,
    /// Payload of the most recent `comm_msg`.
    #[serde(default)]
    pub last_data: Map<String, Value>,
}

struct CommEntry {
    snapshot: CommSnapshot,
    seq: u64,
}

/// Open comms, returned in the order they were opened.
#[derive(Default)]
pub struct CommRegistry {
    comms: RwLock<HashMap<String, CommEntry>>,
    next_seq: AtomicU64,
}

fn state_of(data: &Map<String, Value>) -> Map<String, Value> {
    data.get("state")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

impl CommRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn on_open(&self, open: CommOpen) {
        let snapshot = CommSnapshot {
            state: state_of(&open.data),
            comm_id: open.comm_id.0.clone(),
            target_name: open.target_name,
            last_data: Map::new(),
        };
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut comms = self.comms.write().unwrap_or_else(PoisonError::into_inner);
        comms.insert(open.comm_id.0, CommEntry { snapshot, seq });
    }

    fn on_msg(&self, msg: CommMsg) {
        let mut comms = self.comms.write().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = comms.get_mut(&msg.comm_id.0) else {
            debug!("[comm] Message for unknown comm {}", msg.comm_id.0);
            return;
        };
        if msg.data.get("method").and_then(Value::as_str) == Some("update") {
            for (key, value) in state_of(&msg.data) {
                entry.snapshot.state.insert(key, value);
            }
        }
        entry.snapshot.last_data = msg.data;
    }

    fn on_close(&self, close: CommClose) {
        let mut comms = self.comms.write().unwrap_or_else(PoisonError::into_inner);
        comms.remove(&close.comm_id.0);
    }

    pub fn get(&self, comm_id: &str) -> Option<CommSnapshot> {
        let comms = self.comms.read().unwrap_or_else(PoisonError::into_inner);
        comms.get(comm_id).map(|entry| entry.snapshot.clone())
    }

    pub fn get_all(&self) -> Vec<CommSnapshot> {
        let comms = self.comms.read().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<_> = comms.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries.into_iter().map(|entry| entry.snapshot.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.comms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.comms
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl CommRouter for CommRegistry {
    fn route(&self, message: CommMessage) {
        match message {
            CommMessage::Open(open) => self.on_open(open),
            CommMessage::Msg(msg) => self.on_msg(msg),
            CommMessage::Close(close) => self.on_close(close),
        }
    }
}
