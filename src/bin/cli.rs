//! # lanfetch CLI
//!
//! Browse a LAN file server and download from it.
//!
//! The server address is the `host:port` string produced by the pairing step
//! (for example the contents of the QR code the server displays).
//!
//! ## Usage
//!
//! ```bash
//! # Check the server answers
//! lanfetch-cli -s 192.168.1.20:8080 connect
//!
//! # List the home directory, or a subdirectory
//! lanfetch-cli -s 192.168.1.20:8080 list
//! lanfetch-cli -s 192.168.1.20:8080 list Movies/2024
//!
//! # Download files in parallel
//! lanfetch-cli -s 192.168.1.20:8080 download Movies/clip.mp4 Music/song.mp3 -o ./downloads
//!
//! # Interactive browsing
//! lanfetch-cli -s 192.168.1.20:8080 browse
//! ```
//!
//! ## Configuration
//!
//! Every option can also be set through the environment:
//! `LANFETCH_SERVER`, `LANFETCH_DOWNLOAD_DIR`, `LANFETCH_WORKERS`,
//! `LANFETCH_TIMEOUT`, `LANFETCH_IDLE_TIMEOUT`, `LANFETCH_HISTORY`,
//! `LANFETCH_JOURNAL`, `LANFETCH_GALLERY`.

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use lanfetch::collaborators::{spawn_notification_relay, Notice, Notifier};
use lanfetch::config::timeout_from_secs;
use lanfetch::entry::{file_name, join_path};
use lanfetch::{
    AlbumImporter, ClientConfig, DirectoryEntry, DownloadEvent, DownloadOrchestrator, HttpTransport,
    ListingClient, NavigationStack, ServerAddress, TransferJournal, TransferStatus, TransferTask,
    WritableDirectory,
};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

// =============================================================================
// Exit Codes
// =============================================================================

/// Exit code indicating successful completion.
const EXIT_SUCCESS: u8 = 0;
/// Exit code indicating a general error occurred.
const EXIT_ERROR: u8 = 1;

const JOURNAL_FILE: &str = ".lanfetch-transfers.json";

// =============================================================================
// CLI Definition
// =============================================================================

#[derive(Parser)]
#[command(name = "lanfetch-cli")]
#[command(author, version, about = "lanfetch - browse and download from a LAN file server")]
#[command(
    long_about = "Browse a LAN file server and download files from it.\n\n\
Features:\n\
  - Lazy directory browsing with cached listings\n\
  - Parallel downloads with live progress\n\
  - Duplicate requests for a running download are merged\n\
  - Transfer history kept across runs"
)]
struct Cli {
    /// Enable verbose logging (can also use RUST_LOG env var)
    #[arg(short, long)]
    verbose: bool,

    /// Server address from the pairing code (host:port)
    #[arg(short, long, env = "LANFETCH_SERVER")]
    server: String,

    /// Local folder downloads are written to
    #[arg(short = 'o', long, env = "LANFETCH_DOWNLOAD_DIR", default_value = "./downloads")]
    download_dir: PathBuf,

    /// Number of downloads running at once
    #[arg(short, long, env = "LANFETCH_WORKERS", default_value = "4")]
    workers: usize,

    /// Listing/connect timeout in seconds (0 = none)
    #[arg(long, env = "LANFETCH_TIMEOUT", default_value = "15")]
    timeout: u64,

    /// Fail a download after this many seconds without progress (0 = never)
    #[arg(long, env = "LANFETCH_IDLE_TIMEOUT", default_value = "60")]
    idle_timeout: u64,

    /// Finished downloads remembered in the history
    #[arg(long, env = "LANFETCH_HISTORY", default_value = "50")]
    history_limit: usize,

    /// Transfer journal file (defaults to a file inside the download folder)
    #[arg(long, env = "LANFETCH_JOURNAL")]
    journal: Option<PathBuf>,

    /// Copy finished downloads into a "Download" album under this folder
    #[arg(long, env = "LANFETCH_GALLERY")]
    gallery_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ping the server
    Connect,

    /// List a directory (home if no path is given)
    List {
        /// Server-relative directory path
        #[arg(default_value = "")]
        path: String,
    },

    /// Download one or more files
    Download {
        /// Server-relative file paths
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Browse interactively
    Browse,

    /// Show recent transfers
    History,
}

impl Cli {
    fn config(&self) -> ClientConfig {
        let journal = self
            .journal
            .clone()
            .unwrap_or_else(|| self.download_dir.join(JOURNAL_FILE));

        ClientConfig {
            server: self.server.clone(),
            request_timeout: timeout_from_secs(self.timeout),
            idle_timeout: timeout_from_secs(self.idle_timeout),
            download_dir: self.download_dir.clone(),
            max_concurrent: self.workers,
            history_limit: self.history_limit,
            journal_path: Some(journal),
            gallery_dir: self.gallery_dir.clone(),
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn format_size(size: u64) -> String {
    let mut size = size as f64;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if size < 1024.0 {
            return format!("{size:.2} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.2} PB")
}

fn describe(task: &TransferTask) -> String {
    match (task.status, task.progress()) {
        (TransferStatus::InProgress, Some(p)) => format!("{:.0}%", p * 100.0),
        (TransferStatus::InProgress, None) => format!("{} so far", format_size(task.bytes_written)),
        (TransferStatus::Failed, _) => match task.last_error {
            Some(kind) => format!("failed: {kind}"),
            None => "failed".to_string(),
        },
        (status, _) => status.to_string(),
    }
}

/// Final outcomes of a batch of downloads. Only failures make the run fail;
/// a cancel is the user's choice.
#[derive(Debug, Default, PartialEq)]
struct Tally {
    downloaded: u32,
    failed: u32,
    cancelled: u32,
}

impl Tally {
    fn record(&mut self, status: TransferStatus) {
        match status {
            TransferStatus::Completed => self.downloaded += 1,
            TransferStatus::Failed => self.failed += 1,
            TransferStatus::Cancelled => self.cancelled += 1,
            TransferStatus::Queued | TransferStatus::InProgress => {}
        }
    }

    fn into_result(self) -> anyhow::Result<()> {
        if self.failed > 0 {
            bail!("{} file(s) failed to download", self.failed);
        }
        Ok(())
    }
}

/// A file entry for a server path typed on the command line.
fn file_entry(path: &str) -> anyhow::Result<DirectoryEntry> {
    let path = path.trim_matches('/');
    let (parent, name) = path.rsplit_once('/').unwrap_or(("", path));
    Ok(DirectoryEntry::child(parent, name, false)?)
}

fn build_orchestrator(config: &ClientConfig, server: &ServerAddress) -> DownloadOrchestrator {
    let transport = Arc::new(HttpTransport::new(
        server.clone(),
        config.download_dir.clone(),
        config.request_timeout,
    ));
    let mut builder = DownloadOrchestrator::builder(transport)
        .config(config.orchestrator())
        .permission(Arc::new(WritableDirectory::new(config.download_dir.clone())));
    if let Some(dir) = &config.gallery_dir {
        builder = builder.gallery(Arc::new(AlbumImporter::new(dir.clone())));
    }

    let orchestrator = builder.build();
    if let Err(e) = orchestrator.restore_history() {
        tracing::warn!("Could not read transfer history: {e}");
    }
    orchestrator
}

/// Prints download notices above the prompt while browsing.
struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify(&self, notice: Notice) {
        match notice {
            Notice::Started { file_key } => println!("📥 Downloading {}", file_name(&file_key)),
            Notice::Completed { file_key } => println!("✓ {} has been downloaded", file_name(&file_key)),
            Notice::Failed { file_key, error } => {
                println!("✗ Failed to download {}: {error}", file_name(&file_key));
            }
        }
    }
}

// =============================================================================
// Commands
// =============================================================================

async fn connect(client: &ListingClient) -> anyhow::Result<()> {
    let greeting = client
        .connect()
        .await
        .with_context(|| format!("Could not reach {}", client.server()))?;
    println!("✓ Connected to {}", client.server());
    if !greeting.is_null() {
        println!("  {greeting}");
    }
    Ok(())
}

async fn list(client: &ListingClient, path: &str) -> anyhow::Result<()> {
    let entries = client.list(path).await.context("Error listing folder")?;
    let shown = if path.is_empty() { "<home>" } else { path };

    if entries.is_empty() {
        println!("Folder '{shown}' is empty");
        return Ok(());
    }

    println!("\nContents of '{shown}':\n");
    println!("{:<10} {:<40}", "Type", "Name");
    println!("{}", "-".repeat(50));
    for entry in entries {
        let kind = if entry.is_directory { "DIR" } else { "FILE" };
        println!("{:<10} {:<40}", kind, entry.name);
    }
    println!();
    Ok(())
}

async fn download(orchestrator: &DownloadOrchestrator, paths: &[String]) -> anyhow::Result<()> {
    // Subscribe first so every terminal state is seen, even with no history kept.
    let mut events = Box::pin(orchestrator.subscribe().into_stream());
    let mut handles = Vec::new();
    for path in paths {
        let file = file_entry(path)?;
        handles.push(orchestrator.start_download(&file).await?);
    }

    println!("\n📥 Downloading {} files...\n", handles.len());

    let style = ProgressStyle::with_template(
        "{msg:32!} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec}",
    )?
    .progress_chars("=> ");
    let multi = MultiProgress::new();
    let mut bars: HashMap<_, ProgressBar> = HashMap::new();
    let mut pending: HashSet<_> = handles.iter().map(|h| h.id()).collect();
    let mut tally = Tally::default();

    while !pending.is_empty() {
        let event = tokio::select! {
            event = events.next() => event,
            _ = tokio::signal::ctrl_c() => {
                multi.println("Cancelling downloads...")?;
                for handle in &handles {
                    orchestrator.cancel(handle);
                }
                continue;
            }
        };

        match event {
            Some(DownloadEvent::Snapshot(snapshot)) => {
                for handle in &handles {
                    let Some(task) = snapshot.get(handle) else {
                        continue;
                    };
                    let bar = bars.entry(task.id).or_insert_with(|| {
                        let bar = multi.add(ProgressBar::new(0));
                        bar.set_style(style.clone());
                        bar.set_message(task.name.clone());
                        bar
                    });
                    if let Some(total) = task.bytes_expected {
                        bar.set_length(total);
                    }
                    bar.set_position(task.bytes_written);

                    if !task.is_terminal() || !pending.remove(&task.id) {
                        continue;
                    }
                    tally.record(task.status);
                    match task.status {
                        TransferStatus::Completed => bar.finish_with_message(format!("✓ {}", task.name)),
                        TransferStatus::Cancelled => bar.abandon_with_message(format!("- {} (cancelled)", task.name)),
                        _ => bar.abandon_with_message(format!("✗ {} ({})", task.name, describe(task))),
                    }
                }
            }
            Some(DownloadEvent::Warning { file_key, message }) => {
                multi.println(format!("⚠ {}: {message}", file_name(&file_key)))?;
            }
            None => break,
        }
    }

    orchestrator.flush_journal().await;

    println!(
        "\n✓ Download complete: {} downloaded, {} failed, {} cancelled",
        tally.downloaded, tally.failed, tally.cancelled
    );
    tally.into_result()
}

fn print_listing(nav: &NavigationStack<ListingClient>, orchestrator: &DownloadOrchestrator) {
    let snapshot = orchestrator.snapshot();
    let shown = if nav.path().is_empty() { "~" } else { nav.path() };
    println!("\n📁 {shown}");
    if nav.current().is_empty() {
        println!("   (empty)");
    }
    for entry in nav.current() {
        if entry.is_directory {
            println!("   {}/", entry.name);
        } else if let Some(task) = snapshot.find(&entry.path) {
            println!("   {}  [{}]", entry.name, describe(task));
        } else {
            println!("   {}", entry.name);
        }
    }
    println!();
}

const BROWSE_HELP: &str = "Commands: ls, cd NAME, cd .., up, home, refresh, get NAME, jobs, cancel NAME, help, quit";

async fn browse(
    client: ListingClient,
    orchestrator: &DownloadOrchestrator,
) -> anyhow::Result<()> {
    let mut nav = NavigationStack::open(client)
        .await
        .context("Could not load the home folder")?;
    let relay = spawn_notification_relay(orchestrator, Arc::new(ConsoleNotifier));

    println!("{BROWSE_HELP}");
    print_listing(&nav, orchestrator);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let (command, arg) = line.split_once(' ').unwrap_or((line, ""));
        let arg = arg.trim();

        let result: anyhow::Result<bool> = async {
            match command {
                "" => {}
                "ls" => print_listing(&nav, orchestrator),
                "cd" if arg == ".." => {
                    nav.ascend();
                    print_listing(&nav, orchestrator);
                }
                "up" => {
                    nav.ascend();
                    print_listing(&nav, orchestrator);
                }
                "cd" => {
                    let entry = nav
                        .find(arg)
                        .cloned()
                        .ok_or_else(|| anyhow!("No such folder: {arg}"))?;
                    nav.descend(&entry).await?;
                    print_listing(&nav, orchestrator);
                }
                "home" => {
                    nav.return_home().await?;
                    print_listing(&nav, orchestrator);
                }
                "refresh" => {
                    nav.refresh().await?;
                    print_listing(&nav, orchestrator);
                }
                "get" => {
                    let entry = nav
                        .find(arg)
                        .cloned()
                        .ok_or_else(|| anyhow!("No such file: {arg}"))?;
                    orchestrator.start_download(&entry).await?;
                }
                "jobs" => {
                    let snapshot = orchestrator.snapshot();
                    if snapshot.tasks.is_empty() {
                        println!("No downloads");
                    }
                    for task in &snapshot.tasks {
                        println!("   {:<40} {}", task.file_key, describe(task));
                    }
                }
                "cancel" => {
                    let key = join_path(nav.path(), arg);
                    let task = orchestrator
                        .snapshot()
                        .active()
                        .find(|t| t.file_key == key)
                        .cloned()
                        .ok_or_else(|| anyhow!("No running download for {arg}"))?;
                    orchestrator.cancel(&task.handle());
                }
                "help" => println!("{BROWSE_HELP}"),
                "quit" | "exit" => return Ok(false),
                other => println!("Unknown command: {other}. {BROWSE_HELP}"),
            }
            Ok(true)
        }
        .await;

        match result {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => eprintln!("✗ {e}"),
        }
    }

    let active: Vec<_> = orchestrator.snapshot().active().map(TransferTask::handle).collect();
    if !active.is_empty() {
        println!("Waiting for {} download(s) to finish...", active.len());
        for handle in &active {
            orchestrator.wait(handle).await;
        }
    }
    relay.abort();
    orchestrator.flush_journal().await;
    Ok(())
}

fn history(config: &ClientConfig) -> anyhow::Result<()> {
    let Some(path) = &config.journal_path else {
        bail!("No journal configured");
    };
    let journal = TransferJournal::load_from_file(path)
        .with_context(|| format!("Failed to load transfer journal {}", path.display()))?;
    let tasks = journal.into_history();

    if tasks.is_empty() {
        println!("No transfers recorded");
        return Ok(());
    }

    println!("\n{:<12} {:<40} {:<12} {:<20}", "Status", "File", "Size", "Finished");
    println!("{}", "-".repeat(86));
    for task in tasks {
        let finished = task
            .finished_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<12} {:<40} {:<12} {:<20}",
            describe(&task),
            task.file_key,
            format_size(task.bytes_written),
            finished
        );
        if let Some(sha) = &task.sha256 {
            println!("{:<12} sha256 {sha}", "");
        }
    }
    println!();
    Ok(())
}

// =============================================================================
// Entry Point
// =============================================================================

/// Application entry point.
#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(EXIT_ERROR)
        }
    }
}

/// Main application logic.
async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("lanfetch=debug,lanfetch_cli=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("lanfetch=warn,lanfetch_cli=info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();

    let config = cli.config();
    config.validate()?;
    let server = config.server_address()?;
    let client = ListingClient::new(server.clone(), config.request_timeout);

    match cli.command {
        Commands::Connect => connect(&client).await?,
        Commands::List { path } => list(&client, path.trim_matches('/')).await?,
        Commands::Download { paths } => {
            let orchestrator = build_orchestrator(&config, &server);
            download(&orchestrator, &paths).await?;
        }
        Commands::Browse => {
            let orchestrator = build_orchestrator(&config, &server);
            browse(client, &orchestrator).await?;
        }
        Commands::History => history(&config)?,
    }

    Ok(())
}
