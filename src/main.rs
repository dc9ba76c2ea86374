//! spooltag command line.
//!
//! Usage:
//!     spooltag run --replay scans.jsonl        # process recorded tag events
//!     nfc-bridge | spooltag run                 # events as JSON lines on stdin
//!     spooltag decode 535354100100... --uid 04a219ee
//!     spooltag encode --format structured spool.toml
//!     spooltag bind --spool 7 --nfc-id 04:a2:19:ee

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{error, info, warn};

use spooltag::codec::BinaryFormat;
use spooltag::config::{Config, IpcConfig};
use spooltag::dispatch::{DispatchNotifier, LogSink, MacroSink, MoonrakerClient};
use spooltag::inventory::{MemoryRepository, NfcBinder, Repository, SpoolmanClient};
use spooltag::mapping::{MappedFields, Resolver};
use spooltag::reconcile::Reconciler;
use spooltag::scan::{parse_hex, ReplaySource, ScanService, TagSource};
use spooltag::sniffer::{DecodedTag, Sniffer};
use spooltag::tag::{FieldMap, FieldValue, NfcId, RawTagPayload, RecordType, TagRecord};

#[derive(Parser, Debug)]
#[command(name = "spooltag", version, about = "Filament spool NFC tags for Spoolman and Klipper")]
struct Cli {
    /// Configuration file (default: ~/spooltag.toml, then the user config dir)
    #[arg(long, global = true, env = "SPOOLTAG_CONFIG")]
    config: Option<PathBuf>,

    /// Debug logging unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process tag events and activate spools on the printer
    Run {
        /// JSON-lines event file, or '-' for stdin
        #[arg(long, default_value = "-")]
        replay: String,

        /// Use a built-in demo inventory and only log printer commands
        #[arg(long)]
        mock: bool,
    },

    /// Decode one record payload and print the result as JSON
    Decode {
        /// Record payload as hex
        payload: String,

        /// Tag hardware identifier as hex
        #[arg(long)]
        uid: Option<String>,
    },

    /// Encode fields from a TOML file into a binary record, printed as hex
    Encode {
        /// structured or neutral
        #[arg(long)]
        format: BinaryFormat,

        fields: PathBuf,
    },

    /// Bind a hardware identifier to a spool in Spoolman
    Bind {
        #[arg(long)]
        spool: u32,

        #[arg(long)]
        nfc_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    spooltag::init_tracing(cli.verbose);

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Run { replay, mock } => run(&config, &replay, mock).await,
        Command::Decode { payload, uid } => decode(&config, &payload, uid.as_deref()),
        Command::Encode { format, fields } => encode(format, &fields),
        Command::Bind { spool, nfc_id } => bind(&config, spool, &nfc_id).await,
    }
}

async fn run(config: &Config, replay: &str, mock: bool) -> Result<()> {
    let sniffer = Sniffer::with_formats(&config.tags.enabled_formats());
    let resolver = Resolver::new(config.mapping()?);

    let (repository, binder): (Arc<dyn Repository>, Arc<dyn NfcBinder>) = if mock {
        info!("Using the built-in demo inventory");
        let repo = Arc::new(MemoryRepository::demo());
        let repository: Arc<dyn Repository> = repo.clone();
        let binder: Arc<dyn NfcBinder> = repo;
        (repository, binder)
    } else {
        info!(url = %config.spoolman.url, "Using Spoolman inventory");
        let client = Arc::new(SpoolmanClient::new(
            &config.spoolman.url,
            Duration::from_secs(config.spoolman.timeout_secs),
        )?);
        let repository: Arc<dyn Repository> = client.clone();
        let binder: Arc<dyn NfcBinder> = client;
        (repository, binder)
    };
    let reconciler = Reconciler::new(repository);

    let mut source: Box<dyn TagSource> = if replay == "-" {
        info!("Reading tag events from stdin");
        Box::new(ReplaySource::stdin())
    } else {
        info!(path = %replay, "Replaying tag events");
        Box::new(ReplaySource::open(Path::new(replay)).await?)
    };

    if mock {
        let notifier = DispatchNotifier::new(LogSink, &config.moonraker);
        let service = ScanService::new(sniffer, resolver, reconciler, notifier);
        serve(service, source.as_mut(), binder, &config.ipc).await
    } else {
        info!(url = %config.moonraker.url, "Sending printer commands to Moonraker");
        let sink = MoonrakerClient::new(
            &config.moonraker.url,
            Duration::from_secs(config.moonraker.timeout_secs),
        )?;
        let notifier = DispatchNotifier::new(sink, &config.moonraker);
        let service = ScanService::new(sniffer, resolver, reconciler, notifier);
        serve(service, source.as_mut(), binder, &config.ipc).await
    }
}

async fn serve<S: MacroSink>(
    mut service: ScanService<S>,
    source: &mut dyn TagSource,
    binder: Arc<dyn NfcBinder>,
    ipc: &IpcConfig,
) -> Result<()> {
    #[cfg(unix)]
    let _socket = if ipc.enabled {
        let path = ipc.socket_path();
        let server = spooltag::ipc::IpcServer::new(service.subscribe(), binder);
        let task_path = path.clone();
        tokio::spawn(async move {
            if let Err(e) = server.serve(&task_path).await {
                error!(error = %e, "IPC socket stopped");
            }
        });
        Some(spooltag::ipc::SocketGuard::new(path))
    } else {
        None
    };
    #[cfg(not(unix))]
    let _ = (binder, ipc);

    tokio::select! {
        result = service.run(source) => result,
        _ = shutdown_signal() => {
            info!("Shutting down");
            Ok(())
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn decode(config: &Config, payload: &str, uid: Option<&str>) -> Result<()> {
    let bytes = parse_hex(payload)?;
    let record = if BinaryFormat::detect(&bytes).is_some() {
        TagRecord::new(RecordType::Mime("application/octet-stream".to_string()), bytes)
    } else {
        let text = String::from_utf8(bytes)
            .context("Payload is neither a known binary record nor UTF-8 text")?;
        TagRecord::text(&text)
    };
    let uid = uid.map(parse_hex).transpose()?;
    let payload = RawTagPayload::new(uid, vec![record]);

    let decoded = Sniffer::with_formats(&config.tags.enabled_formats()).sniff(&payload)?;
    let mapped = match &decoded {
        DecodedTag::Fields(fields) => Resolver::new(config.mapping()?).resolve(fields),
        DecodedTag::Identifier(_) => MappedFields::default(),
    };

    let output = json!({
        "format": decoded.format(),
        "tag": decoded,
        "mapped": mapped,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn encode(format: BinaryFormat, path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let table: toml::Table = toml::from_str(&content)
        .with_context(|| format!("Invalid TOML in {}", path.display()))?;
    let fields = fields_from_toml(&table)?;
    let record = format.encode(&fields)?;
    info!(%format, fields = fields.len(), bytes = record.len(), "Encoded record");
    println!("{}", hex::encode(record));
    Ok(())
}

/// Integers become integer fields, strings become text fields.
fn fields_from_toml(table: &toml::Table) -> Result<FieldMap> {
    let mut fields = FieldMap::new();
    for (name, value) in table {
        let value = match value {
            toml::Value::Integer(n) => {
                let n = u64::try_from(*n)
                    .with_context(|| format!("Field '{}' must not be negative", name))?;
                FieldValue::Int(n)
            }
            toml::Value::String(s) => FieldValue::Text(s.clone()),
            other => bail!("Field '{}' must be an integer or a string, got {}", name, other.type_str()),
        };
        fields.insert(name.clone(), value);
    }
    Ok(fields)
}

async fn bind(config: &Config, spool: u32, nfc_id: &str) -> Result<()> {
    let nfc_id = NfcId::parse(nfc_id)?;
    let client = SpoolmanClient::new(
        &config.spoolman.url,
        Duration::from_secs(config.spoolman.timeout_secs),
    )?;
    if !client.bind_nfc_id(spool, &nfc_id).await? {
        bail!("Spool #{} not found in Spoolman", spool);
    }
    println!("Bound {} to spool #{}", nfc_id, spool);
    Ok(())
}
