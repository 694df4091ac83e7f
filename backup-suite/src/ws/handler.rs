//! WebSocket command handlers.

use super::{EngineEvent, StatusPayload, WsCommand};
use crate::engine::Engine;
use std::path::Path;
use tracing::info;

/// Handle a command received from a WebSocket client
pub fn handle_command(engine: &Engine, command: WsCommand) {
    match command {
        WsCommand::CancelBackup { target } => {
            let cancelled = engine.cancel_backup(target.as_deref().map(Path::new));
            info!("Cancel requested over WebSocket: {} run(s) signalled", cancelled);
        }
        WsCommand::GetStatus => {
            engine.events().broadcast(EngineEvent::EngineStatus(StatusPayload {
                busy_targets: engine.busy_targets(),
                uptime_secs: crate::api::health::uptime_secs(),
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::Collaborators;

    #[tokio::test]
    async fn test_status_command_broadcasts() {
        let engine = Engine::new(Config::default(), Collaborators::host(&Config::default()));
        let mut rx = engine.subscribe();

        handle_command(&engine, WsCommand::GetStatus);
        match rx.recv().await {
            Ok(EngineEvent::EngineStatus(status)) => assert!(status.busy_targets.is_empty()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_without_runs_is_noop() {
        let engine = Engine::new(Config::default(), Collaborators::host(&Config::default()));
        handle_command(&engine, WsCommand::CancelBackup { target: None });
        assert!(engine.busy_targets().is_empty());
    }
}
