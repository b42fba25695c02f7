//! Shared runtime state for shipctl-daemon.
//!
//! All handlers receive `State<Arc<AppState>>`; this module owns the
//! long-lived pieces handlers reach into (pool, orchestrator, hub, gateway).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use shipctl_config::LabelsConfig;
use shipctl_gateway::DataGateway;
use shipctl_hub::Hub;
use shipctl_orchestrator::Orchestrator;

/// Static build metadata included in health responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// Cloneable (Arc) handle shared across all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub orchestrator: Arc<Orchestrator>,
    pub hub: Arc<Hub>,
    pub gateway: Arc<DataGateway>,
    pub labels: Arc<LabelsConfig>,
    pub build: BuildInfo,
}
