//! LanVault CLI - receive files over the LAN into an encrypted vault.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use lanvault_common::{FileId, SessionId};
use lanvault_net::{
    describe_file, display_string, ReceiverConfig, ReceiverServer, SenderClient, TrustStore,
    DEFAULT_PORT,
};
use lanvault_protocol::{ChannelSink, PrepareUploadRequest, ProtocolEvent};
use lanvault_vault::{Vault, VaultPaths};

#[derive(Parser)]
#[command(name = "lanvault")]
#[command(about = "LanVault - Receive files over the LAN into an encrypted vault")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Data directory (default: ~/.lanvault).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new vault.
    Init,

    /// Receive files until interrupted.
    Serve {
        /// Port to listen on (overrides config.json).
        #[arg(short, long)]
        port: Option<u16>,

        /// PIN senders must present. A random one is shown if omitted.
        #[arg(long)]
        pin: Option<String>,
    },

    /// Send files to a receiver.
    Send {
        /// Receiver address.
        #[arg(long)]
        host: String,

        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// PIN displayed by the receiver.
        #[arg(long)]
        pin: String,

        /// Expected receiver fingerprint; the connection fails on mismatch.
        #[arg(long)]
        fingerprint: Option<String>,

        /// Title shown to the receiver.
        #[arg(short, long, default_value = "")]
        title: String,

        /// Files to send.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// List folders and files in the vault.
    List,

    /// Decrypt files into a directory.
    Extract {
        /// Vault file ids.
        #[arg(required = true)]
        ids: Vec<i64>,

        /// Destination directory.
        #[arg(short, long)]
        dest: PathBuf,
    },

    /// Delete a file from the vault.
    Delete {
        /// Vault file id.
        id: i64,
    },

    /// Show this device's certificate fingerprint.
    Fingerprint,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let paths = match cli.data_dir {
        Some(dir) => VaultPaths::new(dir),
        None => VaultPaths::default_location().context("Cannot determine data directory")?,
    };

    match cli.command {
        Commands::Init => cmd_init(paths),
        Commands::Serve { port, pin } => cmd_serve(paths, port, pin).await,
        Commands::Send {
            host,
            port,
            pin,
            fingerprint,
            title,
            files,
        } => cmd_send(&host, port, &pin, fingerprint.as_deref(), &title, &files).await,
        Commands::List => cmd_list(paths),
        Commands::Extract { ids, dest } => cmd_extract(paths, &ids, &dest),
        Commands::Delete { id } => cmd_delete(paths, id),
        Commands::Fingerprint => cmd_fingerprint(&paths),
    }
}

/// Prompt for password securely.
fn prompt_password(prompt: &str) -> Result<String> {
    rpassword::prompt_password(prompt).context("Failed to read password")
}

fn open_unlocked(paths: VaultPaths) -> Result<Vault> {
    let vault = Vault::open(paths).context("Failed to open vault")?;
    if !vault.is_initialized() {
        anyhow::bail!("No vault here yet. Run `lanvault init` first");
    }
    let password = prompt_password("Vault password: ")?;
    vault.unlock(&password).context("Failed to unlock vault")?;
    Ok(vault)
}

fn cmd_init(paths: VaultPaths) -> Result<()> {
    let vault = Vault::open(paths).context("Failed to open data directory")?;

    let password = prompt_password("New vault password: ")?;
    let confirm = prompt_password("Confirm password: ")?;
    if password != confirm {
        anyhow::bail!("Passwords do not match");
    }

    vault
        .initialize(&password)
        .context("Failed to create vault")?;

    println!("Vault created at {}", vault.paths().root().display());
    Ok(())
}

async fn cmd_serve(paths: VaultPaths, port: Option<u16>, pin: Option<String>) -> Result<()> {
    let mut config =
        ReceiverConfig::load_or_create(&paths.config_file()).context("Invalid config.json")?;
    if let Some(port) = port {
        config.port = port;
    }

    let vault = Arc::new(open_unlocked(paths)?);
    let (sink, events) = ChannelSink::new();
    let server = ReceiverServer::for_vault(vault, config, Arc::new(sink));

    let pin = match pin {
        Some(pin) => {
            server.pairing().set_pin(Some(pin.clone()));
            pin
        }
        None => server.pairing().generate_pin(),
    };

    let printer = tokio::spawn(print_events(events));
    let addr = server.start().await.context("Failed to start receiver")?;

    println!("Receiving on port {}", addr.port());
    println!("PIN: {}", pin);
    println!("Commands: accept | reject | accept-batch <session> | reject-batch <session> | pending | quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else { break };
                if !handle_command(&server, line.trim()) {
                    break;
                }
            }
        }
    }

    info!("Shutting down");
    server.stop().await.context("Failed to stop receiver")?;
    printer.abort();
    Ok(())
}

/// Run one operator command. Returns false to quit.
fn handle_command(server: &ReceiverServer, line: &str) -> bool {
    let mut words = line.split_whitespace();
    let result = match (words.next(), words.next()) {
        (None, _) => Ok(()),
        (Some("quit" | "exit"), _) => return false,
        (Some("accept"), None) => server
            .pairing()
            .confirm()
            .map(|session| println!("Paired, session {}", session)),
        (Some("reject"), None) => server.pairing().reject(),
        (Some("accept-batch"), Some(session)) => SessionId::new(session).and_then(|session| {
            let accepted = server.transfers().accept(&session)?;
            println!("Accepted {} file(s)", accepted.files.len());
            Ok(())
        }),
        (Some("reject-batch"), Some(session)) => {
            SessionId::new(session).and_then(|session| server.transfers().reject(&session))
        }
        (Some("pending"), _) => {
            for batch in server.transfers().pending_batches() {
                println!(
                    "  {} \"{}\" ({} file(s))",
                    batch.session_id,
                    batch.title,
                    batch.files.len()
                );
            }
            Ok(())
        }
        _ => {
            println!("Unknown command: {}", line);
            Ok(())
        }
    };

    if let Err(e) = result {
        warn!(error = %e, "Command failed");
        println!("Error: {}", e);
    }
    true
}

async fn print_events(mut events: UnboundedReceiver<ProtocolEvent>) {
    while let Some(event) = events.recv().await {
        match &event {
            ProtocolEvent::CertificateInfo { display, .. } => println!("{}", display),
            ProtocolEvent::RegisterRequestReceived { .. } => {
                println!("A device wants to pair. Type `accept` or `reject`.")
            }
            ProtocolEvent::PrepareUploadRequest {
                session_id,
                title,
                total_files,
                total_size,
                ..
            } => println!(
                "Session {} offers \"{}\": {} file(s), {} bytes. Type `accept-batch {}` or `reject-batch {}`.",
                session_id, title, total_files, total_size, session_id, session_id
            ),
            ProtocolEvent::FileReceived {
                file_name, vault_id, ..
            } => println!("Received {} (id {})", file_name, vault_id),
            ProtocolEvent::TransferFailed { file_id, error, .. } => {
                println!("Transfer of {} failed: {}", file_id, error)
            }
            _ => {}
        }
        if let Ok(json) = serde_json::to_string(&event) {
            tracing::debug!(event = %json, "Protocol event");
        }
    }
}

async fn cmd_send(
    host: &str,
    port: u16,
    pin: &str,
    fingerprint: Option<&str>,
    title: &str,
    files: &[PathBuf],
) -> Result<()> {
    let client = match fingerprint {
        Some(fp) => SenderClient::pinned(host, port, fp)?,
        None => SenderClient::new(host, port)?,
    };

    let mut contents = Vec::with_capacity(files.len());
    for (i, path) in files.iter().enumerate() {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("{} has no file name", path.display()))?;
        let id = FileId::new(format!("file-{}", i + 1))?;
        contents.push((describe_file(id, name, "", &data), data));
    }

    println!("Waiting for the receiver to accept pairing...");
    let nonce = uuid::Uuid::new_v4().to_string();
    let session = client
        .register(pin, &nonce)
        .await
        .context("Pairing failed")?;
    if let Some(fp) = client.peer_fingerprint() {
        println!("{}", display_string(&fp));
    }

    let request = PrepareUploadRequest {
        title: title.to_string(),
        session_id: session.to_string(),
        files: contents.iter().map(|(info, _)| info.clone()).collect(),
    };
    println!("Waiting for the receiver to accept {} file(s)...", files.len());
    let prepared = client
        .prepare_upload(&request)
        .await
        .context("Transfer was not accepted")?;

    for (info, data) in contents {
        let Some(transmission) = prepared.transmission_for(info.id.as_str()) else {
            warn!(file = %info.id, "Receiver did not accept file");
            continue;
        };
        let size = data.len();
        client
            .upload(&session, transmission, &info.id, &info.file_name, "", data)
            .await
            .with_context(|| format!("Failed to upload {}", info.file_name))?;
        println!("Sent {} ({} bytes)", info.file_name, size);
    }

    Ok(())
}

fn cmd_list(paths: VaultPaths) -> Result<()> {
    let vault = open_unlocked(paths)?;

    let folders = vault.list_folders().context("Failed to list folders")?;
    if folders.is_empty() {
        println!("Vault is empty.");
        return Ok(());
    }

    for folder in folders {
        println!("[DIR]  {} ({} files)", folder.name, folder.file_count);
        for file in vault
            .files_in_folder(folder.id)
            .context("Failed to list files")?
        {
            println!(
                "  {:>6}  {} ({} bytes, {})",
                file.id, file.name, file.size, file.mime_type
            );
        }
    }
    Ok(())
}

fn cmd_extract(paths: VaultPaths, ids: &[i64], dest: &Path) -> Result<()> {
    let vault = open_unlocked(paths)?;
    let report = vault
        .export_files(ids, dest)
        .context("Failed to extract files")?;

    for file in &report.exported {
        println!("Extracted {} -> {}", file.id, file.path.display());
    }
    for failure in &report.failures {
        println!("Failed {}: {}", failure.id, failure.error);
    }
    if !report.is_complete() {
        anyhow::bail!("{} file(s) could not be extracted", report.failures.len());
    }
    Ok(())
}

fn cmd_delete(paths: VaultPaths, id: i64) -> Result<()> {
    let vault = open_unlocked(paths)?;
    vault.delete(id).context("Failed to delete file")?;
    println!("File {} deleted", id);
    Ok(())
}

fn cmd_fingerprint(paths: &VaultPaths) -> Result<()> {
    paths.ensure_dirs()?;
    let identity = TrustStore::new(paths.tls_dir())
        .ensure_identity()
        .context("Failed to load certificate")?;
    println!("{}", display_string(&identity.fingerprint()));
    Ok(())
}
