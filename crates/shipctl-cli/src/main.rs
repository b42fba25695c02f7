use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use shipctl_schemas::RecoveryChoice;

#[derive(Parser)]
#[command(name = "shipctl")]
#[command(about = "Batch shipping orchestrator CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Job lifecycle commands
    Job {
        #[command(subcommand)]
        cmd: JobCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
}

#[derive(Subcommand)]
enum JobCmd {
    /// List jobs, optionally filtered by status
    List {
        #[arg(long)]
        status: Option<String>,
    },
    /// Show one job's detail
    Show { job_id: Uuid },
    /// §4.1 Confirm: validate, resolve shipper, start execution in the background
    Confirm { job_id: Uuid },
    /// §4.1 Cancel: halt at the next row boundary
    Cancel { job_id: Uuid },
    /// §4.2.8 recovery prompt for a job left `running` at process start
    Recovery {
        job_id: Uuid,
        #[command(subcommand)]
        choice: Option<RecoveryCmd>,
    },
}

#[derive(Subcommand)]
enum RecoveryCmd {
    Resume,
    Restart,
    Cancel,
    Review,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = shipctl_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = shipctl_db::status(&pool).await?;
                    println!("db_ok={} has_job_tables={}", s.ok, s.has_job_tables);
                }
                DbCmd::Migrate => {
                    shipctl_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::Job { cmd } => match cmd {
            JobCmd::List { status } => {
                let pool = shipctl_db::connect_from_env().await?;
                let filter = shipctl_db::JobListFilter {
                    status: status.as_deref().map(parse_status).transpose()?,
                    name: None,
                    created_after: None,
                    created_before: None,
                    limit: 100,
                    offset: 0,
                };
                let jobs = shipctl_db::list_jobs(&pool, &filter).await?;
                for j in jobs {
                    println!(
                        "{}  {:<10}  {:<20}  {}/{} rows",
                        j.id,
                        format!("{:?}", j.status).to_lowercase(),
                        j.name,
                        j.processed_rows,
                        j.total_rows
                    );
                }
            }
            JobCmd::Show { job_id } => {
                let pool = shipctl_db::connect_from_env().await?;
                let job = shipctl_db::get_job(&pool, job_id).await?;
                match job {
                    Some(j) => println!("{}", serde_json::to_string_pretty(&job_to_json(&j))?),
                    None => println!("job {job_id} not found"),
                }
            }
            JobCmd::Confirm { job_id } => {
                let (orchestrator, pool) = build_orchestrator().await?;
                orchestrator.confirm(job_id).await?;
                println!("job_id={job_id} status=confirmed, waiting for completion...");
                wait_for_terminal_status(&pool, job_id).await?;
            }
            JobCmd::Cancel { job_id } => {
                let (orchestrator, _pool) = build_orchestrator().await?;
                orchestrator.cancel(job_id).await?;
                println!("job_id={job_id} status=cancel_requested");
            }
            JobCmd::Recovery { job_id, choice } => {
                let (orchestrator, pool) = build_orchestrator().await?;
                match choice {
                    None => {
                        let info = orchestrator.interrupted_job_info(job_id).await?;
                        match info {
                            Some(info) => println!("{}", serde_json::to_string_pretty(&info)?),
                            None => println!("job {job_id} is not an interrupted `running` job"),
                        }
                    }
                    Some(choice) => {
                        let mapped = match choice {
                            RecoveryCmd::Resume => RecoveryChoice::Resume,
                            RecoveryCmd::Restart => RecoveryChoice::Restart,
                            RecoveryCmd::Cancel => RecoveryChoice::Cancel,
                            RecoveryCmd::Review => RecoveryChoice::Review,
                        };
                        let resumes = matches!(mapped, RecoveryChoice::Resume | RecoveryChoice::Restart);
                        let result = orchestrator.apply_recovery_choice(job_id, mapped).await?;
                        println!("{result:?}");
                        if resumes {
                            wait_for_terminal_status(&pool, job_id).await?;
                        }
                    }
                }
            }
        },
    }

    Ok(())
}

fn parse_status(s: &str) -> Result<shipctl_schemas::JobStatus> {
    use shipctl_schemas::JobStatus::*;
    Ok(match s {
        "pending" => Pending,
        "running" => Running,
        "paused" => Paused,
        "completed" => Completed,
        "failed" => Failed,
        "cancelled" => Cancelled,
        other => anyhow::bail!("unknown job status: {other}"),
    })
}

fn job_to_json(j: &shipctl_db::JobRecord) -> serde_json::Value {
    serde_json::json!({
        "id": j.id,
        "name": j.name,
        "status": format!("{:?}", j.status).to_lowercase(),
        "total_rows": j.total_rows,
        "processed_rows": j.processed_rows,
        "successful_rows": j.successful_rows,
        "failed_rows": j.failed_rows,
        "international_rows": j.international_rows,
        "error_code": j.error_code,
        "error_message": j.error_message,
    })
}

/// Builds an `Orchestrator` the same way the daemon does, so `shipctl job
/// confirm` behaves identically whether it is issued through the HTTP
/// surface or directly from the command line. Returns the pool alongside it
/// since `confirm`/`apply_recovery_choice` schedule work in the background
/// and the caller needs its own handle to poll for completion.
async fn build_orchestrator() -> Result<(Arc<shipctl_orchestrator::Orchestrator>, sqlx::PgPool)> {
    let pool = shipctl_db::connect_from_env().await?;
    let mode = shipctl_config::RunMode::from_env()?;
    let secrets = shipctl_config::secrets::resolve_secrets_for_mode(mode)?;

    let carrier: Arc<dyn shipctl_carrier::CarrierAdapter> = match secrets.carrier {
        Some(creds) => Arc::new(shipctl_carrier::UpsCarrier::new(creds)),
        None => Arc::new(shipctl_carrier::PaperCarrier::new()),
    };
    let gateway = Arc::new(shipctl_gateway::DataGateway::new());
    let hub = Arc::new(shipctl_hub::Hub::new());
    let decisions = Arc::new(shipctl_config::DecisionLedgerConfig::from_env()?);

    let orchestrator = Arc::new(shipctl_orchestrator::Orchestrator::new(
        pool.clone(),
        carrier,
        gateway,
        hub,
        secrets.shipper_fallback,
        None,
        decisions,
    ));
    Ok((orchestrator, pool))
}

/// Polls the job's status every 500ms and prints a progress line on each
/// change, until the job reaches a terminal state. The CLI has no progress
/// hub subscriber of its own; this is the synchronous-operator equivalent.
async fn wait_for_terminal_status(pool: &sqlx::PgPool, job_id: Uuid) -> Result<()> {
    let mut last_processed = -1i64;
    loop {
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        let Some(job) = shipctl_db::get_job(pool, job_id).await? else {
            anyhow::bail!("job {job_id} disappeared while waiting");
        };
        if job.processed_rows != last_processed {
            println!("  {}/{} rows processed", job.processed_rows, job.total_rows);
            last_processed = job.processed_rows;
        }
        if shipctl_orchestrator::job_state_machine::is_terminal(job.status) {
            println!("job_id={job_id} status={:?}", job.status);
            break;
        }
    }
    Ok(())
}
