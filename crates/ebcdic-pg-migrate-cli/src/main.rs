//! ebcdic-pg-migrate CLI - legacy CSV to PostgreSQL migration pipeline.

use clap::{Parser, Subcommand};
use ebcdic_pg_migrate::verify::TableStatus;
use ebcdic_pg_migrate::{
    ingest_signal_file, Config, JobState, MigrateError, Pipeline,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "ebcdic-pg-migrate")]
#[command(about = "Legacy-encoded CSV to PostgreSQL migration pipeline")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dispatcher until interrupted
    Run,

    /// Ingest a signal file for a job
    Ingest {
        /// Job id the delivery belongs to
        #[arg(long)]
        job: i64,

        /// Path to the signal file
        signal: PathBuf,
    },

    /// Reconcile source, split and target row totals for a job
    Verify {
        /// Job id to verify
        #[arg(long)]
        job: i64,
    },

    /// Create the metadata store schema
    InitStore,

    /// Test store and target connections
    HealthCheck,

    /// Register a migration job
    JobAdd {
        /// Job name
        #[arg(long)]
        name: String,

        /// Directory the external watcher observes
        #[arg(long)]
        watch_dir: PathBuf,

        /// Target database host
        #[arg(long)]
        target_host: String,

        /// Target database port
        #[arg(long, default_value = "5432")]
        target_port: u16,

        /// Target database name
        #[arg(long)]
        target_database: String,

        /// Target database user
        #[arg(long)]
        target_user: String,

        /// Target database password
        #[arg(long)]
        target_password: String,

        /// Target schema
        #[arg(long, default_value = "public")]
        target_schema: String,

        /// Per-job connection pool size
        #[arg(long, default_value = "4")]
        target_max_connections: usize,
    },

    /// List registered jobs
    JobList,

    /// Stop a job (workers refuse new work for it)
    JobStop {
        /// Job id
        id: i64,
    },

    /// Pause a job
    JobPause {
        /// Job id
        id: i64,
    },

    /// Resume a stopped or paused job
    JobResume {
        /// Job id
        id: i64,
    },

    /// Retry a failed transcode task
    RetryTask {
        /// File task id
        id: i64,
    },

    /// Retry a failed split (load or verify failure)
    RetrySplit {
        /// Split id
        id: i64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    let config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    let pipeline = Pipeline::new(config)?;

    match cli.command {
        Commands::Run => {
            let cancel_token = setup_signal_handler();
            pipeline.run(cancel_token).await?;
            println!("Dispatcher stopped");
        }

        Commands::Ingest { job, signal } => {
            match ingest_signal_file(pipeline.store(), job, &signal).await? {
                Some(batch) => {
                    println!("Batch {} created for table {}", batch.id, batch.table)
                }
                None => println!("Signal already ingested, nothing to do"),
            }
        }

        Commands::Verify { job } => {
            let job = pipeline
                .store()
                .get_job(job)
                .await?
                .ok_or_else(|| MigrateError::Config(format!("job {} not found", job)))?;
            let reports =
                ebcdic_pg_migrate::verify_job(pipeline.store(), pipeline.targets(), &job).await?;

            let mut mismatches = 0;
            println!("Verification for job {} ({}):", job.id, job.name);
            for report in &reports {
                let status = match &report.status {
                    TableStatus::Match => "OK".to_string(),
                    TableStatus::MismatchSplit => {
                        mismatches += 1;
                        "SPLIT MISMATCH".to_string()
                    }
                    TableStatus::MismatchLoad => {
                        mismatches += 1;
                        "LOAD MISMATCH".to_string()
                    }
                    TableStatus::Error(e) => {
                        mismatches += 1;
                        format!("ERROR ({})", e)
                    }
                };
                println!(
                    "  {}: source={} splits={} target={} -> {}",
                    report.table,
                    report.source_rows,
                    report.split_rows,
                    report
                        .target_rows
                        .map(|n| n.to_string())
                        .unwrap_or_else(|| "?".to_string()),
                    status
                );
            }
            if mismatches > 0 {
                return Err(MigrateError::Verify(format!(
                    "{} table(s) failed verification",
                    mismatches
                )));
            }
            println!("All tables verified");
        }

        Commands::InitStore => {
            pipeline.init_store().await?;
            println!("Metadata store initialized");
        }

        Commands::HealthCheck => {
            let checks = pipeline.health_check().await;
            let mut healthy = true;
            println!("Health Check Results:");
            for check in &checks {
                println!(
                    "  {}: {}",
                    check.component,
                    if check.ok { "OK" } else { "FAILED" }
                );
                if let Some(ref detail) = check.detail {
                    println!("    Error: {}", detail);
                }
                healthy &= check.ok;
            }
            println!("\n  Overall: {}", if healthy { "HEALTHY" } else { "UNHEALTHY" });
            if !healthy {
                return Err(MigrateError::Config("Health check failed".to_string()));
            }
        }

        Commands::JobAdd {
            name,
            watch_dir,
            target_host,
            target_port,
            target_database,
            target_user,
            target_password,
            target_schema,
            target_max_connections,
        } => {
            let job = pipeline
                .store()
                .insert_job(ebcdic_pg_migrate::store::NewJob {
                    name,
                    watch_dir,
                    target: ebcdic_pg_migrate::model::TargetConn {
                        host: target_host,
                        port: target_port,
                        database: target_database,
                        user: target_user,
                        password: target_password,
                        schema: target_schema,
                        max_connections: target_max_connections,
                    },
                })
                .await?;
            println!("Job {} registered as id {}", job.name, job.id);
        }

        Commands::JobList => {
            let jobs = pipeline.store().list_jobs().await?;
            if jobs.is_empty() {
                println!("No jobs registered");
            }
            for job in jobs {
                println!(
                    "  {} {} [{}] watch={} target={}/{}",
                    job.id,
                    job.name,
                    job.state.as_str(),
                    job.watch_dir.display(),
                    job.target.host,
                    job.target.database
                );
            }
        }

        Commands::JobStop { id } => {
            set_job_state(&pipeline, id, JobState::Stopped).await?;
            println!("Job {} stopped", id);
        }

        Commands::JobPause { id } => {
            set_job_state(&pipeline, id, JobState::Paused).await?;
            println!("Job {} paused", id);
        }

        Commands::JobResume { id } => {
            set_job_state(&pipeline, id, JobState::Active).await?;
            println!("Job {} active", id);
        }

        Commands::RetryTask { id } => {
            if pipeline.gateway().retry_file_task(id).await? {
                println!("Task {} queued for transcode retry", id);
            } else {
                return Err(MigrateError::Config(format!(
                    "task {} is not in a retriable state",
                    id
                )));
            }
        }

        Commands::RetrySplit { id } => {
            if pipeline.gateway().retry_split(id).await? {
                println!("Split {} queued for retry", id);
            } else {
                return Err(MigrateError::Config(format!(
                    "split {} is not in a retriable state",
                    id
                )));
            }
        }
    }

    Ok(())
}

async fn set_job_state(pipeline: &Pipeline, id: i64, state: JobState) -> Result<(), MigrateError> {
    if !pipeline.store().set_job_state(id, state).await? {
        return Err(MigrateError::Config(format!("job {} not found", id)));
    }
    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// SIGINT and SIGTERM both cancel the returned token; the dispatcher
/// drains in-flight work and exits.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    let token_int = cancel_token.clone();
    tokio::spawn(async move {
        if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
            sigint.recv().await;
            eprintln!("\nReceived SIGINT. Shutting down gracefully...");
            token_int.cancel();
        }
    });

    let token_term = cancel_token.clone();
    tokio::spawn(async move {
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            sigterm.recv().await;
            eprintln!("\nReceived SIGTERM. Shutting down gracefully...");
            token_term.cancel();
        }
    });

    cancel_token
}

#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Shutting down gracefully...");
            token.cancel();
        }
    });

    cancel_token
}
