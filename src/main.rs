mod cache;
mod commands;
mod config;
mod http;
mod images;
mod logging;
mod network;
mod router;
mod server;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::net::SocketAddr;
use std::path::PathBuf;
use url::Url;

use network::{ConnectionInfo, ConnectivitySignals};

#[derive(Parser, Debug)]
#[command(name = "larder")]
#[command(about = "Offline-first caching proxy with network-adaptive image loading")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./larder.yaml, then $XDG_CONFIG_HOME/larder/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Override the origin from the config file
  #[arg(long, global = true)]
  origin: Option<Url>,

  /// Override the cache database path
  #[arg(long, global = true)]
  db: Option<PathBuf>,

  /// Write logs to this file instead of stderr
  #[arg(long, global = true)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Activate the cache version and run the proxy
  Serve {
    /// Address to listen on
    #[arg(short, long)]
    listen: Option<SocketAddr>,
  },
  /// Precache the manifest and purge partitions of other versions
  Activate,
  /// Send one GET through the caching router
  Fetch {
    /// Absolute URL or path relative to the origin
    target: String,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
  },
  /// List cache partitions and their entry counts
  Partitions,
  /// Classify connectivity signals into a quality tier
  Classify {
    #[command(flatten)]
    signals: SignalArgs,
  },
  /// Run progressive image loading over a page described in YAML
  Images {
    /// Page file (viewport height and image elements)
    page: PathBuf,
    #[command(flatten)]
    signals: SignalArgs,
    /// Connection type to switch to after the first pass (e.g. 4g)
    #[arg(long)]
    upgrade_to: Option<String>,
  },
}

#[derive(clap::Args, Debug)]
struct SignalArgs {
  /// Report the device as offline
  #[arg(long)]
  offline: bool,
  /// Effective connection type (slow-2g, 2g, 3g, 4g)
  #[arg(long)]
  effective_type: Option<String>,
  /// Measured downlink in Mbps
  #[arg(long)]
  downlink: Option<f64>,
  /// Measured round-trip time in ms
  #[arg(long)]
  rtt: Option<u32>,
  /// Data-saving preference
  #[arg(long)]
  save_data: bool,
}

impl SignalArgs {
  fn connection(&self) -> Option<ConnectionInfo> {
    if self.effective_type.is_none() && self.downlink.is_none() && self.rtt.is_none() {
      return None;
    }
    Some(ConnectionInfo {
      effective_type: self.effective_type.clone(),
      downlink: self.downlink,
      rtt: self.rtt,
      save_data: self.save_data,
    })
  }

  fn signals(&self) -> ConnectivitySignals {
    ConnectivitySignals {
      online: !self.offline,
      connection: self.connection(),
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Classification needs neither config nor cache
  if let Command::Classify { signals } = &args.command {
    let _guard = logging::init(args.log_file.as_deref())?;
    println!("{}", commands::classify(signals.signals())?);
    return Ok(());
  }

  // Load configuration
  let mut config = config::Config::load(args.config.as_deref())?;

  // Command line overrides
  if let Some(origin) = args.origin {
    config.origin = origin;
  }
  if let Some(db) = args.db {
    config.cache.path = Some(db);
  }
  if let Some(log_file) = args.log_file {
    config.log_file = Some(log_file);
  }

  let _guard = logging::init(config.log_file.as_deref())?;

  run(args.command, config).await
}

async fn run(command: Command, mut config: config::Config) -> Result<()> {
  match command {
    Command::Serve { listen } => {
      if let Some(listen) = listen {
        config.server.listen = listen;
      }
      commands::serve(&config).await?;
    }
    Command::Activate => {
      let router = commands::build_router(&config)?;
      print!("{}", commands::activate(&router).await?);
    }
    Command::Fetch { target, navigate } => {
      let router = commands::build_router(&config)?;
      let url = config.resolve(&target)?;
      print!("{}", commands::fetch(&router, url, navigate).await?);
    }
    Command::Partitions => {
      let router = commands::build_router(&config)?;
      print!("{}", commands::partitions(&router)?);
    }
    Command::Images {
      page,
      signals,
      upgrade_to,
    } => {
      let page = commands::load_page(&page)?;
      let router = commands::build_router(&config)?;
      let loader = images::RouterLoader::new(router, config.origin.clone());

      let change = upgrade_to.map(|effective_type| ConnectionInfo {
        effective_type: Some(effective_type),
        downlink: None,
        rtt: None,
        save_data: signals.save_data,
      });
      let out = commands::images(
        page,
        signals.signals(),
        config.images.next_gen_format,
        loader,
        change,
      )
      .await?;
      print!("{}", out);
    }
    Command::Classify { signals } => {
      println!("{}", commands::classify(signals.signals())?);
    }
  }

  Ok(())
}
