//! `view` subcommand: follow one presenter session

use std::error::Error;
use std::sync::Arc;

use slidesync_core::{ConfigurationError, FollowerEngine, Slideshow, StateStore, SyncConfig, ViewerTarget};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::display::OverlayDisplay;
use crate::ViewArgs;

fn target_from(args: &ViewArgs) -> Result<ViewerTarget, ConfigurationError> {
    ViewerTarget::parse(args.target.as_deref(), args.id.as_deref())
}

pub async fn run(args: ViewArgs, config: SyncConfig) -> Result<(), Box<dyn Error>> {
    // A missing or malformed identity ends the view; main reports it
    let target = target_from(&args)?;
    info!("Slidesync viewer for session {} starting", target.session());

    let display = Arc::new(OverlayDisplay::new(args.output));
    let mut engine = FollowerEngine::new(target, config.reconnect.clone(), Slideshow::new(display));

    let loopback = if args.no_loopback {
        None
    } else {
        match StateStore::from_config(&config.store) {
            Ok(store) => {
                engine.prime(&store);
                match store.subscribe() {
                    Ok(subscription) => Some(subscription),
                    Err(e) => {
                        warn!("Viewer: local-loopback unavailable: {}", e);
                        None
                    }
                }
            }
            Err(e) => {
                warn!("Viewer: local-loopback unavailable: {}", e);
                None
            }
        }
    };

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted");
        }
        interrupt.cancel();
    });

    engine.run(loopback, cancel).await;
    Ok(())
}
