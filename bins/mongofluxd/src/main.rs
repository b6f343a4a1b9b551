//! # mongofluxd - MongoDB to InfluxDB Replication Daemon
//!
//! Tails change events from MongoDB and writes derived time-series points to
//! InfluxDB, continuously. Measurements are configured in a TOML file; flags
//! override the file; restart positions are persisted so a restart neither
//! loses nor double-delivers events.
//!
//! ## Usage
//!
//! ```bash
//! # Replicate the measurements in a config file, resuming where the last
//! # run stopped
//! mongofluxd -f mongoflux.toml --resume
//!
//! # One-shot backfill of every configured namespace
//! mongofluxd -f mongoflux.toml --direct-reads --exit-after-direct-reads
//!
//! # Debug logging
//! RUST_LOG=debug mongofluxd -f mongoflux.toml
//! ```

mod transforms;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use mongodb::bson::doc;
use mongodb::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mongoflux_core::{FileConfig, MeasurementSet, Overrides, RunStatus, Settings};
use mongoflux_io::{
    resolve_resume_point, InfluxWriter, MongoSource, ResumeStore, SourceChannels, SourceSettings,
};
use mongoflux_tx::Projector;

use crate::worker::{Worker, WorkerContext};

/// Command-line flags. Every value-carrying flag is optional so that an
/// explicitly set flag overrides the config file while an unset one takes
/// the file value; defaults apply last.
#[derive(Parser, Debug, Default)]
#[command(name = "mongofluxd")]
#[command(about = "MongoDB to InfluxDB replication daemon")]
struct Args {
    /// TOML configuration file with [[measurement]] tables
    #[arg(short = 'f', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print version information and exit
    #[arg(short = 'v', long = "version")]
    version: bool,

    /// Enable debug logging (unless RUST_LOG is set)
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    verbose: Option<bool>,

    /// Resume the change tail from the persisted position
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    resume: Option<bool>,

    /// Name the resume position is stored under
    #[arg(long)]
    resume_name: Option<String>,

    /// Resume strategy: 0 = timestamp, 1 = change-stream tokens
    #[arg(long, value_name = "0|1")]
    resume_strategy: Option<u8>,

    /// Resume the change tail from this source timestamp (seconds)
    #[arg(long, value_name = "SECONDS")]
    resume_from_timestamp: Option<i64>,

    /// Write resume positions without acknowledgement
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    resume_write_unsafe: Option<bool>,

    /// Replay the change tail from the beginning
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    replay: Option<bool>,

    /// Backfill every configured namespace with a full scan
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    direct_reads: Option<bool>,

    /// Tail change streams instead of the oplog
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    change_streams: Option<bool>,

    /// Shut down once the backfill completes
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    exit_after_direct_reads: Option<bool>,

    /// MongoDB connection string
    #[arg(long, value_name = "URL")]
    mongo_url: Option<String>,

    /// Database holding the oplog
    #[arg(long, value_name = "NAME")]
    mongo_oplog_database_name: Option<String>,

    /// Collection holding the oplog
    #[arg(long, value_name = "NAME")]
    mongo_oplog_collection_name: Option<String>,

    /// InfluxDB base URL
    #[arg(long, value_name = "URL")]
    influx_url: Option<String>,

    /// InfluxDB user
    #[arg(long)]
    influx_user: Option<String>,

    /// InfluxDB password
    #[arg(long)]
    influx_password: Option<String>,

    /// Skip TLS certificate verification towards InfluxDB
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    influx_skip_verify: Option<bool>,

    /// Create sink databases on demand
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    influx_auto_create_db: Option<bool>,

    /// PEM file with additional trusted CA certificates for InfluxDB
    #[arg(long, value_name = "FILE")]
    influx_pem_file: Option<PathBuf>,

    /// Number of sink workers
    #[arg(long, value_name = "N")]
    influx_clients: Option<usize>,

    /// Points per batch before a flush is forced
    #[arg(long, value_name = "N")]
    influx_buffer_size: Option<usize>,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            verbose: self.verbose,
            resume: self.resume,
            resume_name: self.resume_name.clone(),
            resume_strategy: self.resume_strategy,
            resume_from_timestamp: self.resume_from_timestamp,
            resume_write_unsafe: self.resume_write_unsafe,
            replay: self.replay,
            direct_reads: self.direct_reads,
            change_streams: self.change_streams,
            exit_after_direct_reads: self.exit_after_direct_reads,
            mongo_url: self.mongo_url.clone(),
            mongo_oplog_database_name: self.mongo_oplog_database_name.clone(),
            mongo_oplog_collection_name: self.mongo_oplog_collection_name.clone(),
            influx_url: self.influx_url.clone(),
            influx_user: self.influx_user.clone(),
            influx_password: self.influx_password.clone(),
            influx_skip_verify: self.influx_skip_verify,
            influx_auto_create_db: self.influx_auto_create_db,
            influx_pem_file: self.influx_pem_file.clone(),
            influx_clients: self.influx_clients,
            influx_buffer_size: self.influx_buffer_size,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if args.version {
        println!("mongofluxd {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }
    let code = run(args).await?;
    std::process::exit(code);
}

async fn run(args: Args) -> Result<i32> {
    let file = match &args.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let settings = Settings::resolve(file, args.overrides())?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if settings.verbose { "debug" } else { "info" }));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let registry = transforms::registry();
    let measurements = Arc::new(MeasurementSet::compile(&settings.measurements, &registry)?);
    let projector = Arc::new(Projector::new(&measurements)?);
    info!(
        measurements = measurements.len(),
        workers = settings.influx.clients,
        "starting mongofluxd"
    );

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    // A signal during the initial connect aborts it.
    let client = tokio::select! {
        _ = cancel.cancelled() => anyhow::bail!("interrupted while connecting to MongoDB"),
        client = connect_source(&settings.mongo_url) => client?,
    };

    let writer = Arc::new(InfluxWriter::new(settings.influx.clone())?);
    let resume_store = Arc::new(ResumeStore::new(
        &client,
        &settings.resume_name,
        settings.resume_write_unsafe,
    ));
    let resume_point = resolve_resume_point(&resume_store, &settings).await?;
    info!(resume = ?resume_point, "resume position resolved");

    let status = Arc::new(RunStatus::new());
    let source = MongoSource::new(
        client.clone(),
        Arc::clone(&measurements),
        SourceSettings {
            channel_size: settings.channel_size,
            buffer_size: settings.buffer_size,
            buffer_duration: settings.buffer_duration,
            direct_reads: settings.direct_reads,
            change_streams: settings.change_streams,
            oplog_database: settings.oplog_database.clone(),
            oplog_collection: settings.oplog_collection.clone(),
            resume: resume_point,
        },
    );
    let SourceChannels {
        ops,
        errors,
        backfill_done,
    } = source.start();

    let ctx = WorkerContext {
        measurements,
        projector,
        writer,
        resume: resume_store,
        status: Arc::clone(&status),
        strategy: settings.resume_strategy,
        checkpoints: settings.resume,
        batch_limit: settings.influx.buffer_size.max(1),
    };
    let mut workers = Vec::with_capacity(settings.influx.clients);
    for id in 0..settings.influx.clients {
        let w = Worker::new(id, ctx.clone());
        workers.push(tokio::spawn(w.run(ops.clone(), errors.clone())));
    }
    drop(ops);
    drop(errors);

    if settings.exit_after_direct_reads {
        let mut backfill_done = backfill_done;
        let cancel = cancel.clone();
        tokio::spawn(async move {
            while backfill_done.changed().await.is_ok() {
                if *backfill_done.borrow() {
                    info!("backfill complete, shutting down");
                    cancel.cancel();
                    break;
                }
            }
        });
    }

    cancel.cancelled().await;

    // Stop producing; the op channel closes once drained, and every worker
    // performs its final flush and checkpoint before returning.
    source.stop();
    for handle in workers {
        if let Err(e) = handle.await {
            error!(error = %e, "worker task failed");
            status.set_failed();
        }
    }
    client.shutdown().await;
    info!("shutdown complete");
    Ok(status.exit_code())
}

async fn connect_source(url: &str) -> Result<Client> {
    let client = Client::with_uri_str(url)
        .await
        .with_context(|| format!("connecting to MongoDB at {url}"))?;
    client
        .database("admin")
        .run_command(doc! {"ping": 1})
        .await
        .context("pinging MongoDB")?;
    Ok(client)
}

fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        let interrupt = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut terminate = match signal(SignalKind::terminate()) {
                Ok(terminate) => terminate,
                Err(e) => {
                    error!(error = %e, "installing SIGTERM handler failed");
                    let _ = interrupt.await;
                    cancel.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = interrupt => info!("received interrupt, shutting down"),
                _ = terminate.recv() => info!("received terminate, shutting down"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = interrupt.await;
            info!("received interrupt, shutting down");
        }
        cancel.cancel();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_flags_stay_unset() {
        let args = Args::try_parse_from(["mongofluxd"]).unwrap();
        let overrides = args.overrides();
        assert_eq!(overrides.resume, None);
        assert_eq!(overrides.influx_auto_create_db, None);
        assert_eq!(overrides.mongo_url, None);
    }

    #[test]
    fn bare_boolean_flags_set_true() {
        let args =
            Args::try_parse_from(["mongofluxd", "--resume", "--direct-reads"]).unwrap();
        let overrides = args.overrides();
        assert_eq!(overrides.resume, Some(true));
        assert_eq!(overrides.direct_reads, Some(true));
        assert_eq!(overrides.change_streams, None);
    }

    #[test]
    fn boolean_flags_take_explicit_values() {
        let args =
            Args::try_parse_from(["mongofluxd", "--influx-auto-create-db=false"]).unwrap();
        assert_eq!(args.overrides().influx_auto_create_db, Some(false));
    }

    #[test]
    fn value_flags_parse() {
        let args = Args::try_parse_from([
            "mongofluxd",
            "-f",
            "pipeline.toml",
            "--resume-strategy",
            "1",
            "--influx-clients",
            "4",
            "--mongo-url",
            "mongodb://db:27017",
        ])
        .unwrap();
        assert_eq!(args.config.as_deref(), Some(std::path::Path::new("pipeline.toml")));
        let overrides = args.overrides();
        assert_eq!(overrides.resume_strategy, Some(1));
        assert_eq!(overrides.influx_clients, Some(4));
        assert_eq!(overrides.mongo_url.as_deref(), Some("mongodb://db:27017"));
    }
}
