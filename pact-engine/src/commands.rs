use std::sync::Arc;

use serde::Serialize;

use pact_common::models::{HealthReport, StreamSnapshot};

use crate::supervisor::{StartOutcome, StreamSupervisor};

/// Structured result of an operator command. Reasons are machine-readable
/// codes; internal error detail stays inside the engine.
#[derive(Debug, Serialize, Clone)]
pub struct CommandOutcome {
    pub ok: bool,
    pub reason: String,
    pub streams: Vec<StreamSnapshot>,
}

/// Thin operator adapter over the supervisor: start, stop, restart, list
/// and health, nothing else.
#[derive(Clone)]
pub struct CommandSurface {
    supervisor: Arc<StreamSupervisor>,
}

impl CommandSurface {
    pub fn new(supervisor: Arc<StreamSupervisor>) -> Self {
        Self { supervisor }
    }

    pub async fn start(&self, contract_id: i64) -> CommandOutcome {
        let (ok, reason) = match self.supervisor.start(contract_id).await {
            Ok(StartOutcome::Started) => (true, "started".to_string()),
            Ok(StartOutcome::AlreadyActive) => (true, "already_active".to_string()),
            Ok(StartOutcome::Refused(refusal)) => (false, refusal.code().to_string()),
            Err(e) => (false, e.kind().code().to_string()),
        };
        self.outcome(ok, reason).await
    }

    pub async fn stop(&self, contract_id: i64) -> CommandOutcome {
        let reason = if self.supervisor.stop(contract_id).await {
            "stopped"
        } else {
            "not_active"
        };
        self.outcome(true, reason.to_string()).await
    }

    pub async fn restart(&self, contract_id: i64) -> CommandOutcome {
        let (ok, reason) = match self.supervisor.restart(contract_id).await {
            Ok(StartOutcome::Started) => (true, "restarted".to_string()),
            Ok(StartOutcome::AlreadyActive) => (true, "already_active".to_string()),
            Ok(StartOutcome::Refused(refusal)) => (false, refusal.code().to_string()),
            Err(e) => (false, e.kind().code().to_string()),
        };
        self.outcome(ok, reason).await
    }

    pub async fn list(&self) -> CommandOutcome {
        self.outcome(true, "ok".to_string()).await
    }

    pub async fn health(&self) -> HealthReport {
        self.supervisor.health().await
    }

    async fn outcome(&self, ok: bool, reason: String) -> CommandOutcome {
        CommandOutcome {
            ok,
            reason,
            streams: self.supervisor.list_active().await,
        }
    }
}
