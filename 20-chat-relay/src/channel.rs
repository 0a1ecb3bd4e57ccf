//! Client side of the request/response protocol.
//!
//! A [`Channel`] owns at most one TCP connection to a single target and
//! serialises calls over it. The connection is opened lazily: constructing a
//! channel never touches the network, so an unreachable target only shows up
//! as a failed call. Every connectivity change is published through a
//! `watch` channel so long-lived tasks can react to reconnects.
//!
//! Each open connection has a reader task that owns the read half. It hands
//! responses to the caller waiting in [`Channel::call`] and, when the peer
//! hangs up, marks the channel [`ConnectivityState::Failure`] even if no call
//! is in flight.

use std::{future::Future, io, sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::BufReader,
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
    time::error::Elapsed,
};
use tracing::debug;

use crate::message::{Request, Response, read_message, write_message};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    Failure,
}

/// What watchers observe: the current state plus how many connections have
/// been established so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSnapshot {
    pub state: ConnectivityState,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelConfig {
    /// Upper bound for connecting and for each request/response exchange.
    /// `None` leaves it to the operating system.
    pub timeout: Option<Duration>,
}

struct Connection {
    writer: OwnedWriteHalf,
    responses: mpsc::UnboundedReceiver<io::Result<Response>>,
    reader: JoinHandle<()>,
}

impl Connection {
    /// False once the reader has seen EOF or a read error.
    fn is_open(&self) -> bool {
        !self.responses.is_closed()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

pub struct Channel {
    target: String,
    config: ChannelConfig,
    connection: Mutex<Option<Connection>>,
    state: Arc<watch::Sender<StateSnapshot>>,
}

impl Channel {
    pub fn new(target: impl Into<String>, config: ChannelConfig) -> Self {
        let (state, _) = watch::channel(StateSnapshot {
            state: ConnectivityState::Idle,
            generation: 0,
        });
        Self {
            target: target.into(),
            config,
            connection: Mutex::new(None),
            state: Arc::new(state),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn state(&self) -> ConnectivityState {
        self.state.borrow().state
    }

    pub fn subscribe(&self) -> watch::Receiver<StateSnapshot> {
        self.state.subscribe()
    }

    /// Opens the connection if there is none or the peer closed it.
    pub async fn try_connect(&self) -> Result<()> {
        let mut guard = self.connection.lock().await;
        if !guard.as_ref().is_some_and(Connection::is_open) {
            *guard = Some(self.establish().await?);
        }
        Ok(())
    }

    /// Sends one request and waits for its response.
    ///
    /// A connection the peer already closed is replaced before sending. Any
    /// transport error drops the connection and moves the channel into
    /// [`ConnectivityState::Failure`]; the next call reconnects.
    pub async fn call(&self, request: &Request) -> Result<Response> {
        let mut guard = self.connection.lock().await;
        let mut connection = match guard.take().filter(Connection::is_open) {
            Some(connection) => connection,
            None => self.establish().await?,
        };

        match self.exchange(&mut connection, request).await {
            Ok(response) => {
                *guard = Some(connection);
                Ok(response)
            }
            Err(err) => {
                self.set_state(ConnectivityState::Failure);
                debug!(target_addr = %self.target, error = ?err, "call failed, connection dropped");
                Err(err)
            }
        }
    }

    async fn establish(&self) -> Result<Connection> {
        self.set_state(ConnectivityState::Connecting);
        match self.bounded(TcpStream::connect(&self.target)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true).ok();
                let (reader, writer) = stream.into_split();
                let generation = self.mark_connected();
                let (replies, responses) = mpsc::unbounded_channel();
                let reader = tokio::spawn(read_responses(
                    BufReader::new(reader),
                    replies,
                    Arc::clone(&self.state),
                    generation,
                    self.target.clone(),
                ));
                Ok(Connection {
                    writer,
                    responses,
                    reader,
                })
            }
            Ok(Err(err)) => {
                self.set_state(ConnectivityState::Failure);
                Err(err).with_context(|| format!("failed to connect to {}", self.target))
            }
            Err(err) => {
                self.set_state(ConnectivityState::Failure);
                Err(err).with_context(|| format!("connecting to {} timed out", self.target))
            }
        }
    }

    async fn exchange(&self, connection: &mut Connection, request: &Request) -> Result<Response> {
        let round_trip = async {
            write_message(&mut connection.writer, request)
                .await
                .context("failed to send request")?;
            match connection.responses.recv().await {
                Some(response) => response.context("failed to read response"),
                None => Err(anyhow!("connection closed before response")),
            }
        };

        self.bounded(round_trip)
            .await
            .with_context(|| format!("request to {} timed out", self.target))?
    }

    async fn bounded<F: Future>(&self, future: F) -> Result<F::Output, Elapsed> {
        match self.config.timeout {
            Some(limit) => tokio::time::timeout(limit, future).await,
            None => Ok(future.await),
        }
    }

    fn set_state(&self, state: ConnectivityState) {
        self.state.send_if_modified(|snapshot| {
            if snapshot.state == state {
                return false;
            }
            snapshot.state = state;
            true
        });
    }

    fn mark_connected(&self) -> u64 {
        let mut generation = 0;
        self.state.send_modify(|snapshot| {
            snapshot.state = ConnectivityState::Ready;
            snapshot.generation += 1;
            generation = snapshot.generation;
        });
        generation
    }
}

/// Forwards every response line until the peer closes or sends garbage, then
/// fails the channel if it is still on the same connection.
async fn read_responses(
    mut reader: BufReader<OwnedReadHalf>,
    replies: mpsc::UnboundedSender<io::Result<Response>>,
    state: Arc<watch::Sender<StateSnapshot>>,
    generation: u64,
    target: String,
) {
    loop {
        match read_message::<_, Response>(&mut reader).await {
            Ok(Some(response)) => {
                if replies.send(Ok(response)).is_err() {
                    return;
                }
            }
            Ok(None) => {
                debug!(target_addr = %target, "peer closed the connection");
                break;
            }
            Err(err) => {
                debug!(target_addr = %target, error = %err, "connection read failed");
                let _ = replies.send(Err(err));
                break;
            }
        }
    }

    drop(replies);
    state.send_if_modified(|snapshot| {
        if snapshot.generation != generation || snapshot.state != ConnectivityState::Ready {
            return false;
        }
        snapshot.state = ConnectivityState::Failure;
        true
    });
}
