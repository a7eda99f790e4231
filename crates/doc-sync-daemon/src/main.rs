//! doc-sync: Keeps a local editing session in sync with files on disk.
//!
//! Opens documents through the same doc-sync-core used by editor hosts, backed
//! by the native filesystem connection.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use doc_sync_core::{
    ConnectionRegistry, DeletePolicy, DocumentEvent, DocumentOptions, Encoding, RemoteUri,
    SaveCoordinator, SaveFailure, SaveNotifier, SaveOutcome, Severity,
};
use doc_sync_daemon::NativeConnection;

const HOST: &str = "localhost";

#[derive(Parser, Debug)]
#[command(name = "doc-sync")]
#[command(about = "Sync text documents with files on disk")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Directory that remote paths are resolved under
    #[arg(long, global = true, default_value = "/")]
    root: PathBuf,

    /// Charset used to read and write files
    #[arg(long, global = true, default_value = "utf8")]
    encoding: Encoding,

    /// Deadline for each filesystem operation, in milliseconds
    #[arg(long, global = true, default_value_t = 10_000)]
    timeout_ms: u64,

    /// Keep unmodified documents open when their file is deleted
    #[arg(long, global = true)]
    soft_delete: bool,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open a file and print document events as JSON lines until Ctrl+C
    Watch {
        file: PathBuf,
    },
    /// Replace a file's contents with those of a local file
    Save {
        file: PathBuf,
        /// Local file holding the new contents
        #[arg(long)]
        from: PathBuf,
    },
    /// Print the nearest ancestor directory containing a marker file
    ConfigDir {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Marker file name
        #[arg(long, default_value = ".hhconfig")]
        marker: String,
    },
}

/// Reports save failures on stderr.
struct StderrNotifier;

impl SaveNotifier for StderrNotifier {
    fn save_failed(&self, failure: &SaveFailure) {
        let level = match failure.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        eprintln!("{}: {}", level, failure.message);
    }
}

/// Turn a local path into a path on the `localhost` connection.
fn remote_path(root: &Path, file: &Path) -> Result<String> {
    let absolute = std::path::absolute(file)
        .with_context(|| format!("Cannot resolve {}", file.display()))?;
    let relative = absolute
        .strip_prefix(root)
        .with_context(|| format!("{} is outside {}", file.display(), root.display()))?;
    Ok(format!("/{}", relative.to_string_lossy()))
}

async fn watch(registry: &ConnectionRegistry, root: &Path, file: &Path, options: DocumentOptions) -> Result<()> {
    let uri = RemoteUri::new(HOST, &remote_path(root, file)?);
    let document = registry.open_document(&uri, options).await?;
    info!(
        "Watching {} (document {}, {} lines)",
        uri,
        document.id(),
        document.line_count()
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = document.subscribe(move |event| {
        let _ = tx.send(event);
    });

    loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                println!("{}", serde_json::to_string(&event)?);
                match event {
                    DocumentEvent::DidConflict => {
                        warn!("{} changed on disk while it had local edits", uri);
                    }
                    DocumentEvent::DidDestroy => {
                        info!("{} was deleted", uri);
                        break;
                    }
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    document.destroy();
    Ok(())
}

async fn save(
    registry: &ConnectionRegistry,
    root: &Path,
    file: &Path,
    from: &Path,
    options: DocumentOptions,
) -> Result<()> {
    let contents = tokio::fs::read(from)
        .await
        .with_context(|| format!("Failed to read {}", from.display()))?;
    let text = options.encoding.decode(&contents)?;

    let uri = RemoteUri::new(HOST, &remote_path(root, file)?);
    let document = registry.open_document(&uri, options).await?;
    document.set_text(&text)?;
    debug!("Loaded {} bytes from {}", contents.len(), from.display());

    let coordinator = SaveCoordinator::new(Arc::new(StderrNotifier));
    match coordinator.save(&document, uri.path()).await {
        SaveOutcome::Saved { generation } => {
            info!("Saved {} (generation {})", uri, generation);
            Ok(())
        }
        SaveOutcome::Failed { error } => bail!("Save failed: {}", error),
        SaveOutcome::Recovered { error, document } => bail!(
            "Save failed: {} (unsaved text kept in document {})",
            error,
            document.id()
        ),
    }
}

async fn config_dir(registry: &ConnectionRegistry, root: &Path, paths: &[PathBuf], marker: &str) -> Result<()> {
    let cache = registry.config_cache(HOST, marker)?;
    let remote_paths = paths
        .iter()
        .map(|path| remote_path(root, path))
        .collect::<Result<Vec<_>>>()?;

    let answers = join_all(remote_paths.iter().map(|path| cache.get_config_dir(path))).await;
    for (path, answer) in paths.iter().zip(answers) {
        match answer {
            Some(dir) => println!("{}\t{}", path.display(), full_local(root, &dir).display()),
            None => println!("{}\t-", path.display()),
        }
    }
    Ok(())
}

fn full_local(root: &Path, remote: &str) -> PathBuf {
    root.join(remote.trim_start_matches('/'))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,doc_sync_core=debug,doc_sync_daemon=debug"
    } else {
        "info,doc_sync_core=info,doc_sync_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let root = std::path::absolute(&args.root)
        .with_context(|| format!("Cannot resolve root {}", args.root.display()))?;
    let timeout = Duration::from_millis(args.timeout_ms);
    let options = DocumentOptions {
        encoding: args.encoding,
        delete_policy: if args.soft_delete {
            DeletePolicy::SoftDelete
        } else {
            DeletePolicy::Destroy
        },
    };
    debug!("Root {:?}, timeout {:?}, options {:?}", root, timeout, options);

    let registry = ConnectionRegistry::new();
    registry.register(HOST, Arc::new(NativeConnection::new(root.clone(), timeout)));

    match &args.command {
        Command::Watch { file } => watch(&registry, &root, file, options).await,
        Command::Save { file, from } => save(&registry, &root, file, from, options).await,
        Command::ConfigDir { paths, marker } => config_dir(&registry, &root, paths, marker).await,
    }
}
