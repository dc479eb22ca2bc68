//! Live session registry and best-effort event fan-out
//!
//! Maps session id to an outbound channel handle. Membership changes only on
//! connect/disconnect; the registry is iterated only for broadcast, always
//! under the engine lock, so no concurrent mutation is possible.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::models::{Anomaly, FeatureFlag, FlagChange, ImpactPrediction};

/// Outbound event frames: `{"type": ..., "payload": ...}` on the wire
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    Connected { session_id: Uuid },
    ChatResponse { message: String },
    FlagCreated { flag: FeatureFlag },
    FlagChanged { change: FlagChange, prediction: ImpactPrediction },
    AnomalyDetected { anomaly: Anomaly },
    Predictions { predictions: Vec<ImpactPrediction> },
    Error { message: String },
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<Uuid, UnboundedSender<ServerEvent>>,
}

impl SessionRegistry {
    pub fn register(&mut self, sender: UnboundedSender<ServerEvent>) -> Uuid {
        let session_id = Uuid::new_v4();
        self.sessions.insert(session_id, sender);
        tracing::debug!(%session_id, sessions = self.sessions.len(), "Session connected");
        session_id
    }

    pub fn unregister(&mut self, session_id: Uuid) {
        self.sessions.remove(&session_id);
        tracing::debug!(%session_id, sessions = self.sessions.len(), "Session disconnected");
    }

    /// Best-effort send to one session; a failure is dropped.
    pub fn send_to(&self, session_id: Uuid, event: ServerEvent) {
        if let Some(sender) = self.sessions.get(&session_id) {
            let _ = sender.send(event);
        }
    }

    /// Fan out to every live session. A send failure prunes that session
    /// without affecting delivery to the others.
    pub fn broadcast(&mut self, event: &ServerEvent) {
        self.sessions.retain(|session_id, sender| {
            match sender.send(event.clone()) {
                Ok(()) => true,
                Err(_) => {
                    tracing::debug!(%session_id, "Dropping dead session during broadcast");
                    false
                }
            }
        });
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
