//! Renderer seam between the follower and a display surface.
//!
//! The follower hands every validated state to a `Renderer`. `Slideshow` is
//! the stock implementation of the contract:
//! - any running advance timer is stopped first
//! - inactive or empty states show the idle indication
//! - otherwise the first slide is shown, and with more than one slide the
//!   display advances circularly every `intervalSeconds`

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::debug;

use crate::types::SharedState;

/// Transient connection status shown alongside the slides
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewStatus {
    /// Waiting for the first state from the presenter
    Linking,
    /// A channel to the presenter is open
    Connected,
    /// The channel failed; another attempt is scheduled
    Reconnecting { delay: Duration, reason: String },
}

/// Consumer of validated states
pub trait Renderer: Send {
    fn render(&mut self, state: &SharedState);

    fn status(&mut self, _status: &ViewStatus) {}
}

/// Where a `Slideshow` puts pixels (or bytes, or log lines)
pub trait Surface: Send + Sync + 'static {
    /// Show slide `position` of `total`; `image` is the slot payload
    fn show_slide(&self, position: usize, total: usize, image: &str);

    /// Nothing to play
    fn show_idle(&self);

    fn show_status(&self, _status: &ViewStatus) {}
}

/// Timer-driven slideshow over a display `Surface`.
///
/// Must be used inside a tokio runtime: multi-slide states spawn the advance timer.
pub struct Slideshow<D: Surface> {
    display: Arc<D>,
    timer: Option<JoinHandle<()>>,
}

impl<D: Surface> Slideshow<D> {
    pub fn new(display: Arc<D>) -> Self {
        Self {
            display,
            timer: None,
        }
    }

    /// Whether an advance timer is armed
    pub fn is_cycling(&self) -> bool {
        self.timer.is_some()
    }

    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl<D: Surface> Renderer for Slideshow<D> {
    fn render(&mut self, state: &SharedState) {
        self.stop_timer();

        if !state.is_playing() {
            self.display.show_idle();
            return;
        }

        let slides: Vec<String> = state.slides().into_iter().map(String::from).collect();
        let total = slides.len();
        if let Some(first) = slides.first() {
            self.display.show_slide(0, total, first);
        }
        if total < 2 {
            return;
        }

        let period = Duration::from_secs(u64::from(state.interval_seconds.max(1)));
        let display = self.display.clone();
        debug!("Slideshow: cycling {} slides every {:?}", total, period);

        self.timer = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            let mut position = 0;
            loop {
                ticker.tick().await;
                position = (position + 1) % total;
                display.show_slide(position, total, &slides[position]);
            }
        }));
    }

    fn status(&mut self, status: &ViewStatus) {
        self.display.show_status(status);
    }
}

impl<D: Surface> Drop for Slideshow<D> {
    fn drop(&mut self) {
        self.stop_timer();
    }
}
