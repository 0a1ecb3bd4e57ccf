//! An edge process: serves the hub's rebroadcasts and sends local chat.
//!
//! The participant binds its own listener first so the port it registers is
//! the one actually bound (useful with `--port 0`). It then opens a lazy
//! channel to the hub, hands that channel to the [`LivenessWatcher`], and runs
//! the terminal loop, multiplexing stdin with rebroadcast messages and
//! watcher events.

mod watcher;

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::TcpListener,
    select,
    sync::{mpsc, oneshot},
};
use tracing::{debug, info, warn};

use crate::{
    channel::{Channel, ChannelConfig},
    cli::ParticipantArgs,
    message::{Message, Registration, Request, Response},
    server::{Handler, Server},
};

pub use watcher::{Backoff, LivenessWatcher, WatchAction, WatcherEvent, plan};

/// Local server side: hands every rebroadcast message to the terminal loop.
pub struct Inbox {
    messages: mpsc::UnboundedSender<Message>,
}

impl Inbox {
    pub fn new(messages: mpsc::UnboundedSender<Message>) -> Self {
        Self { messages }
    }
}

impl Handler for Inbox {
    async fn handle(&self, request: Request, peer: SocketAddr) -> Response {
        match request {
            Request::Chat(message) => {
                debug!(%peer, sender = %message.sender, "rebroadcast received");
                if self.messages.send(message).is_err() {
                    return Response::error("participant is shutting down");
                }
                Response::Ok
            }
            Request::Connect(_) => Response::error("participants do not accept subscribers"),
        }
    }
}

pub async fn run(args: ParticipantArgs) -> Result<()> {
    let bind_addr = format!("{}:{}", args.bind, args.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    let local_addr = listener.local_addr()?;
    info!("participant listening on {}", local_addr);

    let (inbox_tx, mut inbox_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = Server::new(listener, Arc::new(Inbox::new(inbox_tx)));
    let server_task = tokio::spawn(server.run_until(async move {
        let _ = shutdown_rx.await;
    }));

    let hub = Arc::new(Channel::new(args.hub.clone(), ChannelConfig::default()));
    let registration = Registration::new(
        args.advertise_address.clone(),
        local_addr.port().to_string(),
    );
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    LivenessWatcher::new(Arc::clone(&hub), registration, events_tx).spawn();

    write_stdout("*** chat has started").await?;
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    let result = run_chat_loop(&args.user, &hub, &mut stdin, &mut inbox_rx, &mut events_rx).await;

    let _ = shutdown_tx.send(());
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(error = ?err, "local server exited with error"),
        Err(err) => warn!(error = ?err, "local server task failed"),
    }
    result
}

async fn run_chat_loop(
    user: &str,
    hub: &Channel,
    stdin: &mut Lines<BufReader<tokio::io::Stdin>>,
    inbox: &mut mpsc::UnboundedReceiver<Message>,
    events: &mut mpsc::UnboundedReceiver<WatcherEvent>,
) -> Result<()> {
    loop {
        select! {
            line = stdin.next_line() => {
                if !handle_stdin_input(line, user, hub).await? {
                    break;
                }
            }
            Some(message) = inbox.recv() => {
                write_stdout(&render_message(&message)).await?;
            }
            Some(event) = events.recv() => {
                render_event(event).await?;
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }
    Ok(())
}

async fn handle_stdin_input(
    line: io::Result<Option<String>>,
    user: &str,
    hub: &Channel,
) -> Result<bool> {
    let Some(line) = line? else {
        return Ok(false);
    };

    let text = line.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    match hub.call(&Request::Chat(Message::new(user, text))).await {
        Ok(Response::Ok) => {}
        Ok(Response::Error { message }) => {
            write_stderr(&format!("!!! hub error: {message}")).await?
        }
        Err(err) => write_stderr(&format!("!!! failed to reach hub: {err:#}")).await?,
    }
    Ok(true)
}

pub fn render_message(message: &Message) -> String {
    format!("{}: {}", message.sender, message.body)
}

async fn render_event(event: WatcherEvent) -> io::Result<()> {
    match event {
        WatcherEvent::Registered { hub } => {
            write_stdout(&format!("*** registered with hub at {hub}")).await
        }
        WatcherEvent::RegistrationFailed { error } => {
            write_stderr(&format!("!!! registration failed: {error}")).await
        }
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
