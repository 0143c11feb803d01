//! Command-line host for the sharebox core.
//!
//! Stands in for the web layer: it takes the caller identity from flags,
//! enforces role permissions, and prints results as JSON.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use sharebox::config::apply_env_overrides;
use sharebox::{load_config, Caller, Config, Permission, Portal, Role, Submission, Submitter, UploadRef};
use tracing_subscriber::{layer::SubscriberExt, EnvFilter};

#[derive(Parser)]
#[command(name = "sharebox")]
#[command(about = "Upload intake, review and search for a moderated file share")]
#[command(version)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, global = true, env = "SHAREBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Identity (e-mail) of the caller
    #[arg(long = "as", global = true, default_value = "")]
    identity: String,

    /// Numeric user id of the caller
    #[arg(long, global = true)]
    user_id: Option<u64>,

    /// Role of the caller
    #[arg(long, global = true, value_enum, default_value_t = RoleArg::Member)]
    role: RoleArg,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum RoleArg {
    Member,
    Admin,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Member => Role::Member,
            RoleArg::Admin => Role::Admin,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit files for review
    Submit {
        /// Files to upload
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Folder of the destination tree the files are meant for
        #[arg(long, default_value = "")]
        subpath: String,

        /// Keep the files' folder structure relative to this directory
        #[arg(long)]
        relative_to: Option<PathBuf>,
    },

    /// Approve a pending upload (by id, stored name or path)
    Approve {
        target: String,

        /// Destination path or folder inside the shared tree
        #[arg(long)]
        to: Option<String>,
    },

    /// Decline and delete a pending upload
    Decline { target: String },

    /// Move an approved upload to another location
    Relocate { upload_id: u64, new_path: String },

    /// List a folder of the shared tree
    Browse {
        #[arg(default_value = "")]
        subpath: String,
    },

    /// Create a folder in the shared tree
    Mkdir {
        /// Folder to create it in
        #[arg(long, default_value = "")]
        parent: String,

        name: String,
    },

    /// Move a file or folder of the shared tree to the trash
    Delete { path: String },

    /// Download a file of the shared tree
    Download {
        path: String,

        /// Write here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Download a folder of the shared tree as a zip archive
    Export {
        folder: String,

        /// Archive to write
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Show the download and tree activity log
    Activity,

    /// Search approved uploads by file name
    Search {
        query: String,

        /// Only return hits whose path contains this folder
        #[arg(long)]
        folder: Option<String>,
    },

    /// Rebuild the search shards now
    RebuildIndex,

    /// Show the caller's uploads
    MyUploads,

    /// Show the review queue
    Pending,

    /// Export the completed ledger
    Completed,

    /// Export the declined ledger
    Declined,

    /// Allocate an id for a new user
    AllocateUserId,

    /// Keep the search index fresh in the foreground
    Watch {
        /// Stop after this many seconds
        #[arg(long)]
        seconds: Option<u64>,
    },
}

impl Commands {
    fn permission(&self) -> Permission {
        match self {
            Commands::Submit { .. } => Permission::Submit,
            Commands::Approve { .. } | Commands::Decline { .. } => Permission::ReviewUploads,
            Commands::Relocate { .. } => Permission::RelocateUploads,
            Commands::Browse { .. } => Permission::Browse,
            Commands::Search { .. } => Permission::Search,
            Commands::Download { .. } | Commands::Export { .. } => Permission::Download,
            Commands::Mkdir { .. } | Commands::Delete { .. } | Commands::Activity => {
                Permission::ManageTree
            }
            Commands::MyUploads => Permission::ViewOwnUploads,
            Commands::Pending
            | Commands::Completed
            | Commands::Declined
            | Commands::AllocateUserId => Permission::ReviewUploads,
            Commands::RebuildIndex | Commands::Watch { .. } => Permission::RebuildIndex,
        }
    }
}

fn init_logging(format: LogFormat) -> Result<()> {
    tracing_log::LogTracer::init().context("Failed to bridge log records into tracing")?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => tracing::subscriber::set_global_default(
            registry.with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr)),
        ),
        LogFormat::Json => tracing::subscriber::set_global_default(
            registry.with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            ),
        ),
    }
    .context("Failed to install tracing subscriber")?;
    Ok(())
}

fn load(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => load_config(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => {
            let mut config = Config::default();
            apply_env_overrides(&mut config);
            Ok(config)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Name a file is submitted under: relative to `base` when given, else its
/// file name.
fn submission_name(file: &Path, base: Option<&Path>) -> Result<String> {
    if let Some(base) = base {
        if let Ok(relative) = file.strip_prefix(base) {
            return Ok(relative.to_string_lossy().replace('\\', "/"));
        }
    }
    file.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .with_context(|| format!("{} has no file name", file.display()))
}

fn run(cli: Cli) -> Result<()> {
    let caller = Caller::new(Submitter::new(cli.identity, cli.user_id), cli.role.into());
    let permission = cli.command.permission();
    if !caller.can(permission) {
        bail!("Permission denied: {:?} requires an admin", permission);
    }

    let config = load(cli.config.as_deref())?;
    let portal = Portal::open(config).context("Failed to open portal")?;

    match cli.command {
        Commands::Submit {
            files,
            subpath,
            relative_to,
        } => {
            let mut submissions = Vec::with_capacity(files.len());
            for path in &files {
                let name = submission_name(path, relative_to.as_deref())?;
                let file =
                    File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
                submissions.push(Submission::new(name, file));
            }
            let report = portal.submit_batch(&caller.submitter, &subpath, submissions)?;
            if let Some(summary) = report.summary() {
                log::warn!("{}", summary);
            }
            print_json(&report)?;
        }
        Commands::Approve { target, to } => {
            let target: UploadRef = target.parse()?;
            print_json(&portal.approve(&target, to.as_deref())?)?;
        }
        Commands::Decline { target } => {
            let target: UploadRef = target.parse()?;
            print_json(&portal.decline(&target)?)?;
        }
        Commands::Relocate {
            upload_id,
            new_path,
        } => print_json(&portal.relocate(upload_id, &new_path)?)?,
        Commands::Browse { subpath } => print_json(&portal.browse(&subpath)?)?,
        Commands::Mkdir { parent, name } => {
            let created = portal.create_folder(&caller.submitter, &parent, &name)?;
            print_json(&serde_json::json!({ "created": created }))?;
        }
        Commands::Delete { path } => {
            print_json(&portal.delete_to_trash(&caller.submitter, &path)?)?
        }
        Commands::Download { path, output } => {
            let mut download = portal.open_file(&caller.submitter, &path)?;
            let copied = match output {
                Some(output) => {
                    let mut file = File::create(&output)
                        .with_context(|| format!("Failed to create {}", output.display()))?;
                    std::io::copy(&mut download.file, &mut file)?
                }
                None => std::io::copy(&mut download.file, &mut std::io::stdout().lock())?,
            };
            log::info!("Downloaded {} ({} bytes)", download.path, copied);
        }
        Commands::Export { folder, output } => {
            let file = File::create(&output)
                .with_context(|| format!("Failed to create {}", output.display()))?;
            print_json(&portal.export_folder(&caller.submitter, &folder, file)?)?;
        }
        Commands::Activity => print_json(&portal.activity()?)?,
        Commands::Search { query, folder } => {
            print_json(&portal.search_or_rebuild(&query, folder.as_deref())?)?
        }
        Commands::RebuildIndex => print_json(&portal.rebuild_search_index()?)?,
        Commands::MyUploads => print_json(&portal.my_uploads(&caller.submitter)?)?,
        Commands::Pending => print_json(&portal.pending_queue()?)?,
        Commands::Completed => print_json(&portal.completed()?)?,
        Commands::Declined => print_json(&portal.declined()?)?,
        Commands::AllocateUserId => println!("{}", portal.next_user_id()?),
        Commands::Watch { seconds } => {
            portal.start_index_scheduler()?;
            log::info!("Watching ledgers for changes");
            match seconds {
                Some(seconds) => std::thread::sleep(Duration::from_secs(seconds)),
                None => loop {
                    std::thread::park();
                },
            }
            portal.stop_index_scheduler();
        }
    }

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format)?;
    log::debug!("sharebox v{}", env!("CARGO_PKG_VERSION"));
    run(cli)
}
