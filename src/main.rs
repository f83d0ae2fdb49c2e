use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use tallyd::config::Config;
use tallyd::source::HttpCountSource;
use tallyd::{AuthContext, MetricTracker, RefreshScheduler, Snapshot};

#[derive(Parser, Debug)]
#[command(name = "tallyd")]
#[command(about = "Track per-entity counts from a batched count endpoint")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/tallyd/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Log cache decisions at debug level
  #[arg(short, long)]
  verbose: bool,

  /// Write logs to this file instead of stderr
  #[arg(long)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Load once, print the snapshot and exit
  Once {
    #[arg(short, long)]
    namespace: String,

    /// Drop cached counts before loading
    #[arg(long)]
    force: bool,

    ids: Vec<String>,
  },
  /// Keep counts current, printing every published snapshot
  Watch {
    #[arg(short, long)]
    namespace: String,

    ids: Vec<String>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = tallyd::logging::init(args.verbose, args.log_file.as_deref())?;

  let config = Config::load(args.config.as_deref())?;
  let source = HttpCountSource::new(&config.source)?;
  let auth = auth_from_env()?;

  match args.command {
    Command::Once {
      namespace,
      force,
      ids,
    } => {
      let tracker = MetricTracker::new(
        tracker_config(&config, &namespace, args.verbose),
        source,
      );
      let result = if force {
        tracker.force_refresh(ids, &auth).await
      } else {
        tracker.load(ids, &auth, false).await
      };

      print_snapshot(&tracker.snapshot())?;
      result?;
    }
    Command::Watch { namespace, ids } => {
      let tracker = Arc::new(MetricTracker::new(
        tracker_config(&config, &namespace, args.verbose),
        source,
      ));
      let mut updates = tracker.subscribe();
      let mut scheduler = RefreshScheduler::new(Arc::clone(&tracker));

      // A failed first load is already published as zeros
      let _ = tracker.load(ids.iter().cloned(), &auth, false).await;
      print_snapshot(&tracker.snapshot())?;
      scheduler.start(ids, auth);
      info!(namespace = %namespace, "Watching counts, press Ctrl-C to stop");

      loop {
        tokio::select! {
          _ = tokio::signal::ctrl_c() => break,
          changed = updates.changed() => {
            if changed.is_err() {
              break;
            }
            let snapshot = updates.borrow_and_update().clone();
            print_snapshot(&snapshot)?;
          }
        }
      }

      scheduler.stop();
    }
  }

  Ok(())
}

fn tracker_config(config: &Config, namespace: &str, verbose: bool) -> tallyd::TrackerConfig {
  let tracker = config.tracker(namespace);
  if verbose {
    tracker.with_verbose(true)
  } else {
    tracker
  }
}

/// Auth context from `TALLYD_AUTH` (JSON), or an empty object.
fn auth_from_env() -> Result<AuthContext> {
  match std::env::var("TALLYD_AUTH") {
    Ok(raw) => {
      let value = serde_json::from_str(&raw)
        .map_err(|e| eyre!("TALLYD_AUTH is not valid JSON: {}", e))?;
      Ok(AuthContext::new(value))
    }
    Err(_) => Ok(AuthContext::new(serde_json::json!({}))),
  }
}

fn print_snapshot(snapshot: &Snapshot) -> Result<()> {
  let line =
    serde_json::to_string(snapshot).map_err(|e| eyre!("Failed to encode snapshot: {}", e))?;
  println!("{}", line);
  Ok(())
}
