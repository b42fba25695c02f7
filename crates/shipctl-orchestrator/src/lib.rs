//! Job Orchestrator (C7, §4.1) plus the Recovery Coordinator (C8, §4.7) and
//! shipper resolution (§4.1 precedence chain) that sit around the engine.
//! The daemon's HTTP handlers are thin wrappers over this crate's public
//! operations.

pub mod job_state_machine;
pub mod recovery;
pub mod shipper;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use shipctl_audit::DecisionWriter;
use shipctl_carrier::CarrierAdapter;
use shipctl_config::{DecisionLedgerConfig, ShipperFallback};
use shipctl_db::FinalizeJobArgs;
use shipctl_engine::{AtomicCancellationSignal, NotifyWriteBackSignal};
use shipctl_gateway::DataGateway;
use shipctl_hub::Hub;
use shipctl_schemas::{JobStatus, ProgressEvent, RecoveryChoice};

/// Seam for a remote e-commerce platform's shop address (§4.1 precedence
/// step 3). No concrete connector ships in this binary; the trait exists
/// so the chain has somewhere to plug one in later.
pub trait RemoteShopConnector: Send + Sync {
    fn shop_address(&self) -> Option<shipctl_schemas::Address>;
}

struct ProgressSinkImpl {
    hub: Arc<Hub>,
    job_id: Uuid,
}

impl shipctl_engine::ProgressSink for ProgressSinkImpl {
    fn emit(&self, event: ProgressEvent) {
        self.hub.publish(self.job_id, event);
    }
}

/// Shared orchestrator state: the process-wide batch mutex (§4.2.3,
/// §9 Open Question) that serializes recovery and steady-state execution,
/// plus the cancellation flag registry Cancel() flips into.
pub struct Orchestrator {
    pool: PgPool,
    carrier: Arc<dyn CarrierAdapter>,
    gateway: Arc<DataGateway>,
    hub: Arc<Hub>,
    shipper_fallback: ShipperFallback,
    remote_shop: Option<Arc<dyn RemoteShopConnector>>,
    decisions: Arc<DecisionLedgerConfig>,
    /// Held for the duration of one engine run (§9 decision: a second
    /// Confirm queues behind it rather than erroring).
    batch_mutex: Arc<Mutex<()>>,
    cancellations: StdMutex<HashMap<Uuid, Arc<AtomicBool>>>,
}

impl Orchestrator {
    pub fn new(
        pool: PgPool,
        carrier: Arc<dyn CarrierAdapter>,
        gateway: Arc<DataGateway>,
        hub: Arc<Hub>,
        shipper_fallback: ShipperFallback,
        remote_shop: Option<Arc<dyn RemoteShopConnector>>,
        decisions: Arc<DecisionLedgerConfig>,
    ) -> Self {
        Self {
            pool,
            carrier,
            gateway,
            hub,
            shipper_fallback,
            remote_shop,
            decisions,
            batch_mutex: Arc::new(Mutex::new(())),
            cancellations: StdMutex::new(HashMap::new()),
        }
    }

    /// Runs C8 once, before any confirmation is accepted (§4.7).
    pub async fn run_startup_recovery(&self) -> anyhow::Result<recovery::RecoveryReport> {
        recovery::run_startup_recovery(&self.pool, self.carrier.as_ref()).await
    }

    /// §6.1 `GET /jobs/{id}/recovery`.
    pub async fn interrupted_job_info(&self, job_id: Uuid) -> anyhow::Result<Option<shipctl_schemas::InterruptedJobInfo>> {
        recovery::interrupted_job_info(&self.pool, job_id).await
    }

    /// §4.1 **Confirm**: validates the transition, resolves the shipper,
    /// starts the engine in the background, returns immediately.
    pub async fn confirm(&self, job_id: Uuid) -> anyhow::Result<()> {
        let job = shipctl_db::get_job(&self.pool, job_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("job {job_id} not found"))?;

        job_state_machine::check_transition(job.status, JobStatus::Running)?;

        let active_source_is_local_file = self
            .gateway
            .get_source_info()
            .map(|s| s.source_type == "delimited" || s.source_type == "spreadsheet")
            .unwrap_or(false);

        let shipper = shipper::resolve_shipper(
            job.shipper_snapshot_json.as_ref(),
            &self.shipper_fallback,
            active_source_is_local_file,
            self.remote_shop.as_deref(),
        )?;
        let shipper_json = serde_json::to_value(&shipper)?;

        shipctl_db::mark_job_running(&self.pool, job_id, &shipper_json).await?;

        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.cancellations.lock().unwrap().insert(job_id, Arc::clone(&cancel_flag));

        let pool = self.pool.clone();
        let carrier = Arc::clone(&self.carrier);
        let gateway = Arc::clone(&self.gateway);
        let hub = Arc::clone(&self.hub);
        let batch_mutex = Arc::clone(&self.batch_mutex);
        let decisions_config = Arc::clone(&self.decisions);
        let write_back_enabled = job.write_back_enabled;
        let restart_epoch = job.restart_epoch;

        tokio::spawn(async move {
            let _permit = batch_mutex.lock().await;

            let run_id = Uuid::new_v4();
            let ledger_path = decisions_config.ledger_path(run_id);
            let decision_writer = match DecisionWriter::open(&ledger_path, run_id) {
                Ok(writer) => {
                    if let Err(e) = shipctl_db::register_decision_run(&pool, run_id, job_id, ledger_path.to_string_lossy().as_ref()).await {
                        tracing::warn!(job_id = %job_id, error = %e, "register_decision_run failed");
                    }
                    Some(StdMutex::new(writer))
                }
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "failed to open decision ledger, continuing without one");
                    None
                }
            };

            let write_back_signal = Arc::new(Notify::new());
            let write_back_shutdown = Arc::new(Notify::new());
            let wb_pool = pool.clone();
            let wb_gateway = Arc::clone(&gateway);
            let wb_signal = Arc::clone(&write_back_signal);
            let wb_shutdown = Arc::clone(&write_back_shutdown);
            let wb_handle = tokio::spawn(async move {
                shipctl_writeback::run_worker(wb_pool, wb_gateway, job_id, wb_signal, Duration::from_secs(30), wb_shutdown).await;
            });

            let progress = ProgressSinkImpl { hub: Arc::clone(&hub), job_id };
            let cancellation = AtomicCancellationSignal(Arc::clone(&cancel_flag));
            let signal = NotifyWriteBackSignal(Arc::clone(&write_back_signal));

            let outcome = shipctl_engine::run_job(
                &pool,
                carrier.as_ref(),
                job_id,
                shipper_json,
                restart_epoch,
                write_back_enabled,
                &progress,
                &signal,
                &cancellation,
                decision_writer.as_ref(),
            )
            .await;

            write_back_shutdown.notify_one();
            let _ = wb_handle.await;

            if let Some(writer) = &decision_writer {
                let progress = {
                    let guard = writer.lock().expect("decision ledger mutex poisoned");
                    guard.last_event_hash().map(|h| (guard.event_count(), h.to_string()))
                };
                if let Some((event_count, last_hash)) = progress {
                    if let Err(e) = shipctl_db::update_decision_run_progress(&pool, run_id, event_count, &last_hash).await {
                        tracing::warn!(job_id = %job_id, error = %e, "update_decision_run_progress failed");
                    }
                }
            }

            let finalize_args = match &outcome {
                Ok(o) if o.halted_by_error.is_none() && !cancellation.is_cancelled() => FinalizeJobArgs {
                    status: JobStatus::Completed,
                    error_code: None,
                    error_message: None,
                },
                Ok(o) if cancellation.is_cancelled() => FinalizeJobArgs {
                    status: JobStatus::Cancelled,
                    error_code: o.halted_by_error.as_ref().map(|(c, _)| c.clone()),
                    error_message: o.halted_by_error.as_ref().map(|(_, m)| m.clone()),
                },
                Ok(o) => {
                    let (code, message) = o.halted_by_error.clone().unwrap();
                    FinalizeJobArgs {
                        status: JobStatus::Failed,
                        error_code: Some(code),
                        error_message: Some(message),
                    }
                }
                Err(e) => FinalizeJobArgs {
                    status: JobStatus::Failed,
                    error_code: Some("E-4001".to_string()),
                    error_message: Some(e.to_string()),
                },
            };

            if let Err(e) = shipctl_db::finalize_job(&pool, job_id, finalize_args).await {
                tracing::error!(job_id = %job_id, error = %e, "finalize_job failed");
            }
        });

        Ok(())
    }

    /// §4.1 **Cancel**: flips the cancellation flag the engine loop checks
    /// between rows; does not abort an in-flight carrier call.
    pub async fn cancel(&self, job_id: Uuid) -> anyhow::Result<()> {
        let job = shipctl_db::get_job(&self.pool, job_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("job {job_id} not found"))?;

        job_state_machine::check_transition(job.status, JobStatus::Cancelled)?;

        if let Some(flag) = self.cancellations.lock().unwrap().get(&job_id) {
            flag.store(true, Ordering::SeqCst);
        } else {
            // No engine run is in flight (job was only `pending`); cancel directly.
            shipctl_db::set_job_status(&self.pool, job_id, JobStatus::Cancelled).await?;
        }
        Ok(())
    }

    /// §4.2.8 recovery prompt handling.
    pub async fn apply_recovery_choice(&self, job_id: Uuid, choice: RecoveryChoice) -> anyhow::Result<RecoveryChoiceResult> {
        match choice {
            RecoveryChoice::Resume => {
                self.confirm(job_id).await?;
                Ok(RecoveryChoiceResult::Resumed)
            }
            RecoveryChoice::Restart => {
                let with_tracking = recovery::rows_with_tracking_count(&self.pool, job_id).await?;
                let new_epoch = shipctl_db::restart_job(&self.pool, job_id).await?;
                self.confirm(job_id).await?;
                Ok(RecoveryChoiceResult::Restarted {
                    duplicate_risk_rows: with_tracking,
                    restart_epoch: new_epoch,
                })
            }
            RecoveryChoice::Cancel => {
                self.cancel(job_id).await?;
                Ok(RecoveryChoiceResult::Cancelled)
            }
            RecoveryChoice::Review => {
                let rows = recovery::review_rows(&self.pool, job_id).await?;
                Ok(RecoveryChoiceResult::Review(rows))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum RecoveryChoiceResult {
    Resumed,
    Restarted { duplicate_risk_rows: i64, restart_epoch: i64 },
    Cancelled,
    Review(Vec<shipctl_schemas::ReviewRowDetail>),
}
