//! egafetch CLI: download datasets and files from the EGA.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use egafetch::api::ApiClient;
use egafetch::auth::AuthManager;
use egafetch::config::{parse_size, DownloadOptions};
use egafetch::download::Orchestrator;
use egafetch::progress::{format_bytes, ProgressTracker};
use egafetch::state::{FileSpec, FileStatus, Manifest, StateStore};
use egafetch::verify::verify_file;

#[derive(Parser)]
#[command(
    name = "egafetch",
    version,
    about = "Fast, resumable downloads from the European Genome-phenome Archive",
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download datasets (EGAD...) or files (EGAF...) from EGA.
    ///
    /// Re-running the same command resumes incomplete downloads. Use
    /// --restart to force a fresh download from scratch.
    Download(DownloadArgs),
    /// Show download progress for a job directory.
    Status {
        /// Job directory (defaults to the current directory).
        dir: Option<PathBuf>,
    },
    /// Re-verify checksums of downloaded files.
    Verify {
        /// Job directory (defaults to the current directory).
        dir: Option<PathBuf>,
    },
    /// Remove temp files, keeping completed downloads.
    Clean {
        /// Job directory (defaults to the current directory).
        dir: Option<PathBuf>,
    },
    /// List datasets the logged-in account has access to.
    Datasets,
    /// Manage EGA credentials.
    #[command(subcommand)]
    Auth(AuthCommand),
}

#[derive(Args)]
struct DownloadArgs {
    /// Dataset (EGAD...) or file (EGAF...) identifiers.
    #[arg(required = true)]
    ids: Vec<String>,

    /// Output directory.
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// Number of files to download in parallel.
    #[arg(long, default_value_t = 4)]
    parallel_files: usize,

    /// Number of chunks per file to download in parallel.
    #[arg(long, default_value_t = 8)]
    parallel_chunks: usize,

    /// Size of each chunk (e.g. 64M, 128M).
    #[arg(long, default_value = "64M")]
    chunk_size: String,

    /// Aggregate bandwidth cap (e.g. 50M for 50 MB/s). Unlimited when
    /// not set.
    #[arg(long)]
    max_bandwidth: Option<String>,

    /// Adjust the chunk size on the fly based on observed throughput.
    #[arg(long)]
    adaptive_chunks: bool,

    /// Force a fresh download, removing any existing progress.
    #[arg(long)]
    restart: bool,

    /// Download only files of this type (e.g. BAM, CRAM, VCF).
    #[arg(short, long)]
    format: Option<String>,

    /// JSON config file with credentials (pyEGA3-compatible).
    #[arg(long = "cf", alias = "config-file")]
    config_file: Option<PathBuf>,

    /// Disable the progress display.
    #[arg(long)]
    quiet: bool,
}

#[derive(Subcommand)]
enum AuthCommand {
    /// Log in with EGA username and password.
    Login {
        /// EGA username (email).
        #[arg(short, long)]
        username: Option<String>,
        /// JSON config file with credentials.
        #[arg(long = "cf", alias = "config-file")]
        config_file: Option<PathBuf>,
    },
    /// Show the stored session.
    Status,
    /// Delete the stored session.
    Logout,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Download(args) => cmd_download(args).await,
        Command::Status { dir } => cmd_status(dir.unwrap_or_else(|| PathBuf::from("."))),
        Command::Verify { dir } => cmd_verify(dir.unwrap_or_else(|| PathBuf::from("."))),
        Command::Clean { dir } => cmd_clean(dir.unwrap_or_else(|| PathBuf::from("."))),
        Command::Datasets => cmd_datasets().await,
        Command::Auth(auth) => cmd_auth(auth).await,
    }
}

async fn cmd_datasets() -> anyhow::Result<()> {
    let auth = Arc::new(AuthManager::new()?);
    let api = ApiClient::new(auth)?;

    let datasets = api.list_datasets().await?;
    if datasets.is_empty() {
        println!("No accessible datasets.");
        return Ok(());
    }
    for dataset in datasets {
        println!("{}", dataset.dataset_id);
    }
    Ok(())
}

async fn cmd_download(args: DownloadArgs) -> anyhow::Result<()> {
    let chunk_size = parse_size(&args.chunk_size).context("invalid --chunk-size")?;
    let max_bandwidth = args
        .max_bandwidth
        .as_deref()
        .map(parse_size)
        .transpose()
        .context("invalid --max-bandwidth")?;

    let opts = DownloadOptions {
        parallel_files: args.parallel_files.max(1),
        parallel_chunks: args.parallel_chunks.max(1),
        chunk_size,
        max_bandwidth,
        adaptive_chunks: args.adaptive_chunks,
    };

    let auth = Arc::new(AuthManager::new()?);
    if let Some(path) = &args.config_file {
        let (username, password) = load_credentials_file(path)?;
        auth.login(&username, &password)
            .await
            .context("login from config file")?;
    }

    let cancel = cancel_on_ctrl_c();
    let api = Arc::new(ApiClient::new(auth)?);
    let store = Arc::new(StateStore::new(&args.output));

    if args.restart {
        println!("Restarting: clearing previous download state...");
        store.reset().context("reset state")?;
    }

    let mut manifest = resolve_manifest(&api, &args.ids, args.format.as_deref()).await?;

    println!(
        "Downloading {} file(s) to {}",
        manifest.files.len(),
        args.output.display()
    );

    let tracker = Arc::new(if args.quiet {
        ProgressTracker::hidden()
    } else {
        ProgressTracker::new()
    });
    for file in &manifest.files {
        tracker.register_file(&file.file_id, &file.file_name, file.size);
    }

    let orchestrator = Orchestrator::new(api, store, opts)
        .with_progress({
            let tracker = Arc::clone(&tracker);
            Arc::new(move |file_id: &str, bytes: u64, total: u64| {
                tracker.update(file_id, bytes, total)
            })
        })
        .with_file_callbacks(
            {
                let tracker = Arc::clone(&tracker);
                Arc::new(move |file_id: &str, _: &str| tracker.file_started(file_id))
            },
            {
                let tracker = Arc::clone(&tracker);
                Arc::new(
                    move |file_id: &str, _: &str, err: Option<&egafetch::Error>| match err {
                        Some(_) => tracker.file_failed(file_id),
                        None => tracker.file_completed(file_id),
                    },
                )
            },
            {
                let tracker = Arc::clone(&tracker);
                Arc::new(move |file_id: &str, _: &str| tracker.file_skipped(file_id))
            },
        );

    match orchestrator.download(&mut manifest, &cancel).await {
        Ok(()) => {
            println!("\nDownload complete!");
            Ok(())
        }
        Err(egafetch::Error::Cancelled) => {
            bail!("interrupted; state saved, re-run the same command to resume")
        }
        Err(err) => Err(err.into()),
    }
}

/// Resolve CLI identifiers into a manifest. Dataset ids are expanded via
/// the metadata API; file sizes are IV-corrected for plain mode.
async fn resolve_manifest(
    api: &ApiClient,
    ids: &[String],
    format: Option<&str>,
) -> anyhow::Result<Manifest> {
    let mut manifest = Manifest::new(None);

    for id in ids {
        if id.starts_with("EGAD") {
            manifest.dataset_id = Some(id.clone());
            println!("Fetching file list for dataset {id}...");
            let files = api
                .list_dataset_files(id)
                .await
                .with_context(|| format!("list dataset {id}"))?;
            for file in files {
                let (checksum, checksum_type) = file.best_checksum();
                manifest.files.push(FileSpec {
                    file_id: file.file_id.clone(),
                    file_name: file.file_name.clone(),
                    size: file.plain_size(),
                    checksum,
                    checksum_type,
                });
            }
        } else if id.starts_with("EGAF") {
            println!("Fetching metadata for {id}...");
            let meta = api
                .file_metadata(id)
                .await
                .with_context(|| format!("get metadata for {id}"))?;
            let (checksum, checksum_type) = meta.best_checksum();
            manifest.files.push(FileSpec {
                file_id: meta.file_id.clone(),
                file_name: meta.file_name.clone(),
                size: meta.plain_size(),
                checksum,
                checksum_type,
            });
        } else {
            bail!("unrecognized identifier {id:?}: expected EGAD... or EGAF...");
        }
    }

    if manifest.files.is_empty() {
        bail!("no files found for the given identifiers");
    }

    if let Some(format) = format {
        let suffix = format!(".{}", format.to_lowercase());
        let total = manifest.files.len();
        manifest
            .files
            .retain(|f| f.file_name.to_lowercase().ends_with(&suffix));
        if manifest.files.is_empty() {
            bail!(
                "no files matching format {:?} found (out of {total} total)",
                format.to_uppercase()
            );
        }
        println!(
            "Filtered to {} of {total} files matching format {:?}",
            manifest.files.len(),
            format.to_uppercase()
        );
    }

    Ok(manifest)
}

fn cmd_status(dir: PathBuf) -> anyhow::Result<()> {
    let store = StateStore::new(&dir);
    let states = store.list_file_states()?;
    if states.is_empty() {
        println!("No downloads found in {}.", dir.display());
        return Ok(());
    }

    println!("{:<12} {:>12} {:>6}  FILE", "STATUS", "SIZE", "DONE");
    for state in &states {
        let pct = if state.size == 0 {
            if state.is_complete() { 100.0 } else { 0.0 }
        } else {
            state.bytes_downloaded() as f64 / state.size as f64 * 100.0
        };
        let status = format!("{:?}", state.status).to_lowercase();
        println!(
            "{:<12} {:>12} {:>5.0}%  {}",
            status,
            format_bytes(state.size),
            pct.min(100.0),
            state.file_name
        );
    }
    Ok(())
}

fn cmd_verify(dir: PathBuf) -> anyhow::Result<()> {
    let store = StateStore::new(&dir);
    let states = store.list_file_states()?;
    if states.is_empty() {
        println!("No downloads found to verify.");
        return Ok(());
    }

    let (mut passed, mut failed, mut skipped) = (0, 0, 0);
    for state in &states {
        if state.status != FileStatus::Complete {
            println!("  SKIP  {} (status: {:?})", state.file_name, state.status);
            skipped += 1;
            continue;
        }
        if state.checksum_expected.is_empty() {
            println!("  SKIP  {} (no checksum)", state.file_name);
            skipped += 1;
            continue;
        }

        let path = store.output_path(&state.file_name);
        match verify_file(&path, &state.checksum_expected, &state.checksum_type) {
            Ok(()) => {
                println!("  OK    {}", state.file_name);
                passed += 1;
            }
            Err(err) => {
                println!("  FAIL  {}: {err}", state.file_name);
                failed += 1;
            }
        }
    }

    println!("\n{passed} passed, {failed} failed, {skipped} skipped");
    if failed > 0 {
        bail!("{failed} file(s) failed verification");
    }
    Ok(())
}

fn cmd_clean(dir: PathBuf) -> anyhow::Result<()> {
    let store = StateStore::new(&dir);

    let chunks_dir = store.chunks_dir();
    if chunks_dir.exists() {
        println!("Removing chunk files from {}...", chunks_dir.display());
        std::fs::remove_dir_all(&chunks_dir).context("remove chunks")?;
    }

    let mut cleaned = 0;
    for state in store.list_file_states()? {
        if state.is_complete() {
            match store.delete_file_state(&state.file_id) {
                Ok(()) => cleaned += 1,
                Err(err) => {
                    eprintln!("  Warning: could not remove state for {}: {err}", state.file_id)
                }
            }
        }
    }

    println!("Cleaned {cleaned} completed state file(s).");
    Ok(())
}

async fn cmd_auth(command: AuthCommand) -> anyhow::Result<()> {
    let auth = AuthManager::new()?;
    match command {
        AuthCommand::Login {
            username,
            config_file,
        } => {
            let (username, password) = match config_file {
                Some(path) => load_credentials_file(&path)?,
                None => {
                    let username = match username {
                        Some(u) => u,
                        None => prompt("EGA username: ")?,
                    };
                    let password = prompt("Password: ")?;
                    (username, password)
                }
            };
            auth.login(&username, &password).await?;
            println!("Logged in as {username}.");
        }
        AuthCommand::Status => match auth.status().await {
            Some(creds) => {
                println!("Logged in as {}.", creds.username);
                println!("Token expires at {}.", creds.expires_at.to_rfc3339());
            }
            None => println!("Not logged in."),
        },
        AuthCommand::Logout => {
            auth.logout().await?;
            println!("Logged out.");
        }
    }
    Ok(())
}

/// JSON credential file format, compatible with pyEGA3's -cf files.
#[derive(serde::Deserialize)]
struct CredentialsFile {
    username: String,
    password: String,
}

fn load_credentials_file(path: &std::path::Path) -> anyhow::Result<(String, String)> {
    let data = std::fs::read(path)
        .with_context(|| format!("read config file {}", path.display()))?;
    let creds: CredentialsFile =
        serde_json::from_slice(&data).with_context(|| format!("parse {}", path.display()))?;
    if creds.username.is_empty() || creds.password.is_empty() {
        bail!("config file must contain non-empty \"username\" and \"password\" fields");
    }
    Ok((creds.username, creds.password))
}

fn prompt(label: &str) -> anyhow::Result<String> {
    eprint!("{label}");
    std::io::stderr().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

/// Cancellation token wired to Ctrl-C. The first signal requests a clean
/// shutdown; the engine persists state and unwinds.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupted, saving state...");
            token.cancel();
        }
    });
    cancel
}
