//! acadctl: operator interface to the academic processing engine.

use std::sync::Arc;

use academic_engine::config::Config;
use academic_engine::db::Db;
use academic_engine::model::{JobKind, JobRequest, JobStatus};
use academic_engine::telemetry::{TelemetryConfig, init_telemetry};
use academic_engine::ProcessingEngine;
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;

#[derive(Parser)]
#[command(name = "acadctl", about = "Academic computation engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a health check and print engine metrics as JSON
    Check,
    /// Compute a weighted grade average through the job queue
    Average {
        /// JSON array of grades, e.g. '[{"value": 14, "coefficient": 2}]'
        #[arg(long)]
        grades: String,
        /// Who is asking
        #[arg(long)]
        created_by: Option<String>,
    },
    /// Print the effective engine configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "acadctl".to_string(),
        log_level: config.log_level.clone(),
    })?;

    match cli.command {
        Command::Check => cmd_check(config).await,
        Command::Average { grades, created_by } => cmd_average(config, grades, created_by).await,
        Command::Config => {
            print!("{}", config.engine.to_toml()?);
            Ok(())
        }
    }
}

/// Build the engine, with Postgres persistence and probing when
/// `DATABASE_URL` is set.
async fn build_engine(config: &Config) -> anyhow::Result<ProcessingEngine> {
    let mut builder = ProcessingEngine::builder(config.engine.clone());
    if let Some(ref url) = config.database_url {
        let db = Arc::new(Db::connect(url.expose_secret()).await?);
        db.migrate().await?;
        builder = builder.store(db.clone()).health_probe(db);
    }
    Ok(builder.build()?)
}

async fn cmd_check(config: Config) -> anyhow::Result<()> {
    let engine = build_engine(&config).await?;
    let health = engine.health_check().await;
    let metrics = engine.metrics();

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "health": health,
            "metrics": metrics,
        }))?
    );
    engine.shutdown();

    if !health.healthy {
        anyhow::bail!(
            "engine unhealthy: {}",
            health.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

async fn cmd_average(
    config: Config,
    grades: String,
    created_by: Option<String>,
) -> anyhow::Result<()> {
    let grades: serde_json::Value = serde_json::from_str(&grades)?;
    let engine = build_engine(&config).await?;

    let mut request = JobRequest::new(JobKind::Calculation, "weighted average")
        .parameters(serde_json::json!({ "grades": grades }));
    if let Some(who) = created_by {
        request = request.created_by(who);
    }

    let job = engine.run(request).await?;
    engine.shutdown();

    match job.status {
        JobStatus::Completed => {
            let result = job.result.unwrap_or_default();
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        _ => {
            let message = job
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| format!("job ended {}", job.status));
            anyhow::bail!("calculation failed: {message}")
        }
    }
}
