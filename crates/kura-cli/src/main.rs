//! kura command-line front end.
//!
//! Builds a kernel from the TOML config and runs one operation against the
//! virtual tree.
//!
//! Usage:
//!   kura --config kura.toml ls /media
//!   kura cp /disk/films /backup
//!   kura put ./notes.txt /disk/inbox
//!
//! Logs go to stderr; set `RUST_LOG` to adjust.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

use kura_kernel::{
    CopyOutcome, FileStream, Kernel, KuraConfig, LinkArgs, Object, OpContext, TaskState,
};

/// Virtual filesystem over many storage backends.
#[derive(Parser, Debug)]
#[command(name = "kura")]
#[command(about = "Browse and copy across mounted storage backends")]
struct Args {
    /// Config file (defaults to the XDG config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
        /// Bypass the listing cache
        #[arg(short, long)]
        refresh: bool,
    },
    /// Show one object
    Stat { path: String },
    /// Print a content link for a file
    Link { path: String },
    /// Create a directory
    Mkdir { path: String },
    /// Remove a file or directory
    Rm { path: String },
    /// Move into a directory on the same mount
    Mv { src: String, dst_dir: String },
    /// Rename in place
    Rename { path: String, new_name: String },
    /// Copy into a directory, across mounts if needed
    Cp { src: String, dst_dir: String },
    /// Upload a local file into a directory
    Put { file: PathBuf, dst_dir: String },
    /// Sign a path for sharing
    Sign { path: String },
    /// Show registered mounts
    Mounts,
}

const POLL: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;
    let kernel = Kernel::from_config(&config)
        .await
        .context("failed to build kernel")?;

    run(&kernel, args.command, args.json).await
}

fn load_config(path: Option<&std::path::Path>) -> Result<KuraConfig> {
    match path {
        Some(path) => Ok(KuraConfig::load(path)?),
        None => match KuraConfig::default_path() {
            Some(path) if path.exists() => Ok(KuraConfig::load(&path)?),
            _ => {
                tracing::info!("no config file, starting with no mounts");
                Ok(KuraConfig::default())
            }
        },
    }
}

async fn run(kernel: &Kernel, command: Command, json: bool) -> Result<()> {
    let cx = OpContext::background();
    let fs = kernel.fs();

    match command {
        Command::Ls { path, refresh } => {
            let mut objs = fs.list_with(&cx, &path, refresh).await?;
            objs.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
            if json {
                println!("{}", serde_json::to_string_pretty(&objs)?);
            } else {
                for obj in &objs {
                    print_object(obj);
                }
            }
        }
        Command::Stat { path } => {
            let obj = fs.get(&cx, &path).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&obj)?);
            } else {
                print_object(&obj);
            }
        }
        Command::Link { path } => {
            let (link, _) = fs.link(&cx, &path, &LinkArgs::default()).await?;
            match link.expiry {
                Some(expiry) => println!("{} (valid {}s)", link.url, expiry.as_secs()),
                None => println!("{}", link.url),
            }
        }
        Command::Mkdir { path } => fs.make_dir(&cx, &path).await?,
        Command::Rm { path } => fs.remove(&cx, &path).await?,
        Command::Mv { src, dst_dir } => fs.move_to(&cx, &src, &dst_dir).await?,
        Command::Rename { path, new_name } => fs.rename(&cx, &path, &new_name).await?,
        Command::Cp { src, dst_dir } => match fs.copy(&cx, &src, &dst_dir).await? {
            CopyOutcome::Done => println!("copied"),
            CopyOutcome::Started(job) => {
                eprintln!("{}", job.description());
                let summary = job.wait(POLL).await;
                for task in job.failures() {
                    let reason = task.error.map(|e| e.to_string()).unwrap_or_default();
                    eprintln!("failed: {}: {reason}", task.description);
                }
                if json {
                    println!("{}", serde_json::to_string_pretty(&summary)?);
                } else {
                    println!(
                        "{} succeeded, {} failed, {} canceled",
                        summary.succeeded, summary.failed, summary.canceled
                    );
                }
                if !summary.is_success() {
                    bail!("copy incomplete");
                }
            }
        },
        Command::Put { file, dst_dir } => {
            let name = file
                .file_name()
                .and_then(|n| n.to_str())
                .context("file name is not valid UTF-8")?
                .to_string();
            let handle = tokio::fs::File::open(&file)
                .await
                .with_context(|| format!("failed to open {}", file.display()))?;
            let size = handle.metadata().await?.len();
            let id = fs.put_as_task(&dst_dir, FileStream::new(name, size, Box::pin(handle)))?;

            let task = loop {
                let Some(task) = kernel.tasks().get(id) else {
                    bail!("upload task {id} disappeared");
                };
                if task.state.is_terminal() {
                    break task;
                }
                eprintln!("{}", task.status);
                tokio::time::sleep(POLL).await;
            };
            if task.state != TaskState::Succeeded {
                let reason = task.error.map(|e| e.to_string()).unwrap_or_default();
                bail!("upload {}: {reason}", task.state);
            }
        }
        Command::Sign { path } => println!("{}", kernel.sign_path(&path)?),
        Command::Mounts => {
            for mount in kernel.registry().mounts() {
                println!(
                    "{:<12} {:<24} {:<8} order={} no_cache={}",
                    mount.id(),
                    mount.path(),
                    mount.driver(),
                    mount.order(),
                    mount.no_cache()
                );
            }
        }
    }
    Ok(())
}

fn print_object(obj: &Object) {
    let kind = if obj.is_dir { 'd' } else { '-' };
    println!("{kind} {:>12} {}", obj.size, obj.name);
}
