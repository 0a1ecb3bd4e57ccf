use tracing::debug;

use crate::{
    channel::{Channel, ChannelConfig},
    hub::registry::Deliver,
    message::{Message, Request, Response},
};

/// The hub's reverse connection to one participant's local server.
pub struct OutboundLink {
    channel: Channel,
}

impl OutboundLink {
    /// Does not connect; reachability is only learned on the first delivery.
    pub fn new(endpoint: impl Into<String>, config: ChannelConfig) -> Self {
        Self {
            channel: Channel::new(endpoint, config),
        }
    }

    pub fn endpoint(&self) -> &str {
        self.channel.target()
    }
}

impl Deliver for OutboundLink {
    async fn deliver(&mut self, message: &Message) -> bool {
        match self.channel.call(&Request::Chat(message.clone())).await {
            Ok(Response::Ok) => true,
            Ok(Response::Error { message }) => {
                debug!(endpoint = %self.endpoint(), %message, "subscriber rejected delivery");
                false
            }
            Err(err) => {
                debug!(endpoint = %self.endpoint(), error = %format!("{err:#}"), "delivery failed");
                false
            }
        }
    }
}

/// Opens the outbound link for a newly registered endpoint.
pub trait LinkFactory: Send + Sync + 'static {
    type Link: Deliver + Send + 'static;

    fn open(&self, endpoint: &str) -> Self::Link;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpLinkFactory {
    config: ChannelConfig,
}

impl TcpLinkFactory {
    pub fn new(config: ChannelConfig) -> Self {
        Self { config }
    }
}

impl LinkFactory for TcpLinkFactory {
    type Link = OutboundLink;

    fn open(&self, endpoint: &str) -> OutboundLink {
        OutboundLink::new(endpoint, self.config)
    }
}
