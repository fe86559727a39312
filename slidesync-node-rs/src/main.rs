//! Slidesync Node
//!
//! Hosts either side of a slidesync session: `present` owns the slideshow
//! and serves it to viewers, `view` follows one session and shows it.

mod display;
mod present;
mod view;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};
use slidesync_core::config::DEFAULT_PORT;
use slidesync_core::SyncConfig;
use tracing_subscriber::EnvFilter;

/// Remote slideshow overlay node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Directory holding the local-loopback state file
    #[arg(long, default_value = "./slidesync-data", global = true)]
    data_dir: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the authoritative slideshow and serve it to viewers
    Present(PresentArgs),
    /// Follow a presenter session and display it
    View(ViewArgs),
}

#[derive(ClapArgs, Debug)]
pub struct PresentArgs {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// TCP port for viewer connections
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Host written into the viewer link when listening on a wildcard address
    #[arg(long, default_value = "127.0.0.1")]
    public_host: String,

    /// Storage quota for the persisted state, in bytes
    #[arg(long, default_value_t = 5 * 1024 * 1024)]
    quota: usize,

    /// Keep whatever a previous session persisted
    #[arg(long)]
    keep_state: bool,

    /// Do not announce the session over mDNS
    #[arg(long)]
    no_mdns: bool,

    /// Seconds per slide
    #[arg(short, long)]
    interval: Option<u32>,

    /// Images loaded into slots 1..5 at startup
    images: Vec<PathBuf>,
}

#[derive(ClapArgs, Debug)]
pub struct ViewArgs {
    /// Viewer link (ws://host:port/?id=...) or bare session id to discover
    target: Option<String>,

    /// Session id, overriding the one in the link
    #[arg(long)]
    id: Option<String>,

    /// Write the current slide to this file; removed while idle
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Ignore the local-loopback state file
    #[arg(long)]
    no_loopback: bool,
}

impl Args {
    fn config(&self) -> SyncConfig {
        let mut config = SyncConfig::default().with_store_dir(&self.data_dir);

        if let Command::Present(present) = &self.command {
            config = config
                .with_listen(SocketAddr::new(present.bind, present.port))
                .with_public_host(&present.public_host)
                .with_quota(present.quota);
            if present.keep_state {
                config = config.keep_stale_state();
            }
            if present.no_mdns {
                config = config.without_mdns();
            }
        }
        config
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = args.config();
    match args.command {
        Command::Present(present) => present::run(present, config).await,
        Command::View(view) => view::run(view, config).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_present_args_to_config() {
        let args = Args::parse_from([
            "slidesync-node",
            "--data-dir",
            "/tmp/slides",
            "present",
            "--port",
            "9999",
            "--keep-state",
            "--no-mdns",
            "a.png",
            "b.jpg",
        ]);
        let config = args.config();
        assert_eq!(config.presenter.listen.port(), 9999);
        assert_eq!(config.store.dir, PathBuf::from("/tmp/slides"));
        assert!(!config.store.clear_on_start);
        assert!(!config.presenter.use_mdns);

        match args.command {
            Command::Present(present) => assert_eq!(present.images.len(), 2),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_view_args() {
        let args = Args::parse_from([
            "slidesync-node",
            "view",
            "ws://studio:9470/?id=obs-ab12cd",
            "--output",
            "slide.png",
        ]);
        match args.command {
            Command::View(view) => {
                assert_eq!(view.target.as_deref(), Some("ws://studio:9470/?id=obs-ab12cd"));
                assert_eq!(view.output, Some(PathBuf::from("slide.png")));
                assert!(view.id.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
