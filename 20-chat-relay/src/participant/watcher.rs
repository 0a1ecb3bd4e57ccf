//! Keeps a participant registered with the hub.
//!
//! The watcher follows the hub channel's connectivity snapshots and
//! re-issues `Connect` every time a new connection becomes ready. That is an
//! at-least-once policy: a hub that restarted or pruned us by mistake learns
//! about us again, at the price of occasional duplicate registrations.

use std::{sync::Arc, time::Duration};

use anyhow::{Result, bail};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::{
    channel::{Channel, ConnectivityState, StateSnapshot},
    message::{Registration, Request, Response},
};

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAction {
    Register,
    Reconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherEvent {
    Registered { hub: String },
    RegistrationFailed { error: String },
}

/// Decides what to do for a snapshot, given the last generation we
/// registered on.
pub fn plan(snapshot: StateSnapshot, registered: Option<u64>) -> Option<WatchAction> {
    match snapshot.state {
        ConnectivityState::Ready if registered != Some(snapshot.generation) => {
            Some(WatchAction::Register)
        }
        ConnectivityState::Ready | ConnectivityState::Connecting => None,
        ConnectivityState::Idle | ConnectivityState::Failure => Some(WatchAction::Reconnect),
    }
}

/// Reconnect delay: immediate first, then doubling up to a cap.
#[derive(Debug, Default)]
pub struct Backoff {
    attempt: u32,
}

impl Backoff {
    pub fn next_delay(&mut self) -> Duration {
        let delay = match self.attempt {
            0 => Duration::ZERO,
            n => INITIAL_BACKOFF
                .saturating_mul(1 << (n - 1).min(16))
                .min(MAX_BACKOFF),
        };
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

pub struct LivenessWatcher {
    channel: Arc<Channel>,
    registration: Registration,
    events: mpsc::UnboundedSender<WatcherEvent>,
}

impl LivenessWatcher {
    pub fn new(
        channel: Arc<Channel>,
        registration: Registration,
        events: mpsc::UnboundedSender<WatcherEvent>,
    ) -> Self {
        Self {
            channel,
            registration,
            events,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Runs for as long as the channel exists.
    pub async fn run(self) {
        let mut states = self.channel.subscribe();
        let mut registered = None;
        let mut backoff = Backoff::default();

        loop {
            let snapshot = *states.borrow_and_update();
            match plan(snapshot, registered) {
                Some(WatchAction::Register) => {
                    backoff.reset();
                    registered = Some(snapshot.generation);
                    self.register().await;
                }
                Some(WatchAction::Reconnect) => {
                    let delay = backoff.next_delay();
                    debug!(?delay, state = ?snapshot.state, "reconnecting to hub");
                    tokio::time::sleep(delay).await;
                    if let Err(err) = self.channel.try_connect().await {
                        debug!(error = %format!("{err:#}"), "hub unreachable");
                    }
                    // A failed attempt may leave the state unchanged, so
                    // re-plan without waiting for a notification.
                    continue;
                }
                None => {}
            }

            if !wait_for_change(&mut states).await {
                break;
            }
        }
    }

    async fn register(&self) {
        let event = match self.send_registration().await {
            Ok(()) => {
                info!(hub = %self.channel.target(), "registered with hub");
                WatcherEvent::Registered {
                    hub: self.channel.target().to_string(),
                }
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "registration failed");
                WatcherEvent::RegistrationFailed {
                    error: format!("{err:#}"),
                }
            }
        };
        let _ = self.events.send(event);
    }

    async fn send_registration(&self) -> Result<()> {
        let request = Request::Connect(self.registration.clone());
        match self.channel.call(&request).await? {
            Response::Ok => Ok(()),
            Response::Error { message } => bail!("hub rejected registration: {message}"),
        }
    }
}

async fn wait_for_change(states: &mut watch::Receiver<StateSnapshot>) -> bool {
    states.changed().await.is_ok()
}
