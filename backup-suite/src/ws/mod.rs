//! Engine event hub and WebSocket streaming.
//!
//! Every backup, verify and restore run reports through an [`EventHub`]; the
//! `/ws` endpoint forwards those events to connected clients as
//! `{"type": ..., "payload": ...}` frames and accepts a small set of commands.

pub mod handler;

use crate::utils::errors::SuiteError;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Default number of queued events per subscriber
pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Events emitted by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EngineEvent {
    #[serde(rename = "backup:started")]
    BackupStarted {
        run_id: String,
        target: String,
        timestamp: String,
    },

    #[serde(rename = "backup:progress")]
    BackupProgress(ProgressPayload),

    #[serde(rename = "backup:log")]
    BackupLog(LogPayload),

    #[serde(rename = "backup:completed")]
    BackupCompleted {
        run_id: String,
        timestamp: String,
        entries: usize,
        total_source_size_bytes: u64,
        total_archive_size_bytes: u64,
        duration_seconds: f64,
    },

    #[serde(rename = "backup:failed")]
    BackupFailed {
        run_id: String,
        error: String,
        kind: String,
        #[serde(default)]
        paths: Vec<String>,
    },

    #[serde(rename = "backup:cancelled")]
    BackupCancelled { run_id: String },

    #[serde(rename = "verify:progress")]
    VerifyProgress(ProgressPayload),

    #[serde(rename = "restore:progress")]
    RestoreProgress(ProgressPayload),

    #[serde(rename = "restore:log")]
    RestoreLog(LogPayload),

    #[serde(rename = "engine:status")]
    EngineStatus(StatusPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressPayload {
    pub run_id: String,
    pub percent: f64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogPayload {
    pub run_id: String,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusPayload {
    /// Targets with an operation in flight, as `(target, operation)`
    pub busy_targets: Vec<(String, String)>,
    pub uptime_secs: u64,
}

/// Commands accepted from WebSocket clients
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum WsCommand {
    /// Cancel the backup on `target`, or every running backup
    #[serde(rename = "backup:cancel")]
    CancelBackup {
        #[serde(default)]
        target: Option<String>,
    },

    #[serde(rename = "engine:status")]
    GetStatus,
}

/// Broadcast hub for engine events.
///
/// Bounded: a subscriber that falls behind loses the oldest events, and
/// emitters never wait.
#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn broadcast(&self, event: EngineEvent) {
        match self.tx.send(event) {
            Ok(count) => debug!("Broadcast event to {} subscriber(s)", count),
            Err(_) => debug!("No event subscribers"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Which event family a [`Reporter`] emits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Backup,
    Verify,
    Restore,
}

/// Progress and log emitter bound to one run.
///
/// Every line also goes to `tracing`, so a daemon without subscribers still
/// leaves a record.
#[derive(Clone)]
pub struct Reporter {
    hub: EventHub,
    run_id: String,
    channel: Channel,
}

impl Reporter {
    pub fn new(hub: EventHub, run_id: impl Into<String>, channel: Channel) -> Self {
        Self {
            hub,
            run_id: run_id.into(),
            channel,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    pub fn progress(&self, percent: f64, message: impl Into<String>) {
        let payload = ProgressPayload {
            run_id: self.run_id.clone(),
            percent: percent.clamp(0.0, 100.0),
            message: message.into(),
        };
        let event = match self.channel {
            Channel::Backup => EngineEvent::BackupProgress(payload),
            Channel::Verify => EngineEvent::VerifyProgress(payload),
            Channel::Restore => EngineEvent::RestoreProgress(payload),
        };
        self.hub.broadcast(event);
    }

    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        info!("[{}] {}", self.run_id, message);
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        warn!("[{}] {}", self.run_id, message);
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        error!("[{}] {}", self.run_id, message);
        self.log(LogLevel::Error, message);
    }

    fn log(&self, level: LogLevel, message: String) {
        let payload = LogPayload {
            run_id: self.run_id.clone(),
            level,
            message,
        };
        match self.channel {
            Channel::Backup => self.hub.broadcast(EngineEvent::BackupLog(payload)),
            Channel::Restore => self.hub.broadcast(EngineEvent::RestoreLog(payload)),
            // Verification only reports progress
            Channel::Verify => {}
        }
    }

    pub(crate) fn failed(&self, err: &SuiteError) {
        self.hub.broadcast(EngineEvent::BackupFailed {
            run_id: self.run_id.clone(),
            error: err.to_string(),
            kind: err.kind().to_string(),
            paths: err.paths(),
        });
    }
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<crate::api::AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, app_state))
}

async fn handle_socket(socket: WebSocket, state: crate::api::AppState) {
    info!("New WebSocket client connected");

    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.engine.subscribe();

    let mut send_task = tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("WebSocket client lagged, dropped {} event(s)", missed);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            match serde_json::to_string(&event) {
                Ok(json) => {
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!("Failed to serialize event: {:?}", e),
            }
        }
    });

    let engine = state.engine.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                match serde_json::from_str::<WsCommand>(&text) {
                    Ok(command) => handler::handle_command(&engine, command),
                    Err(e) => warn!("Failed to parse WebSocket command: {:?}", e),
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!("WebSocket client disconnected");
}
