//! Accept loop shared by the hub and by every participant's local server.
//!
//! Each accepted connection carries a stream of newline-framed requests; the
//! server answers each one with exactly one response before reading the next.

use std::{future::Future, io, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream},
    select,
    task::JoinSet,
};
use tracing::{debug, info, warn};

use crate::message::{Request, Response, read_message, write_message};

/// Server-side behaviour for the two remote operations.
pub trait Handler: Send + Sync + 'static {
    fn handle(
        &self,
        request: Request,
        peer: SocketAddr,
    ) -> impl Future<Output = Response> + Send;
}

pub struct Server<H> {
    listener: TcpListener,
    handler: Arc<H>,
}

impl<H: Handler> Server<H> {
    pub fn new(listener: TcpListener, handler: Arc<H>) -> Self {
        Self { listener, handler }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Serves until `shutdown` resolves, then aborts every open connection.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, handler } = self;
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!(open = connections.len(), "server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &handler, &mut connections);
                }
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(err) = finished {
                        warn!(error = ?err, "connection task panicked");
                    }
                }
            }
        }

        connections.shutdown().await;
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result<H: Handler>(
    result: io::Result<(TcpStream, SocketAddr)>,
    handler: &Arc<H>,
    connections: &mut JoinSet<()>,
) {
    match result {
        Ok((stream, peer)) => {
            let handler = Arc::clone(handler);
            connections.spawn(async move {
                if let Err(err) = serve_connection(stream, peer, handler).await {
                    warn!(peer = %peer, error = ?err, "connection closed with error");
                }
            });
        }
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

async fn serve_connection<H: Handler>(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<H>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    debug!(%peer, "connection opened");

    loop {
        let response = match read_message::<_, Request>(&mut reader).await {
            Ok(Some(request)) => handler.handle(request, peer).await,
            Ok(None) => break,
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                debug!(%peer, error = %err, "rejecting malformed request");
                Response::error(format!("malformed request: {err}"))
            }
            Err(err) => return Err(err.into()),
        };
        write_message(&mut writer, &response).await?;
    }

    debug!(%peer, "connection closed by peer");
    Ok(())
}
