use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the hub that keeps the subscriber registry and rebroadcasts chat.
    Hub(HubArgs),
    /// Join a hub: serve rebroadcasts locally and send chat from stdin.
    Participant(ParticipantArgs),
}

#[derive(Args, Debug, Clone)]
pub struct HubArgs {
    /// Socket address the hub should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:50051")]
    pub listen: SocketAddr,

    /// Give up on a single delivery after this many milliseconds. Unset means
    /// only the operating system's transport timeouts apply.
    #[arg(long)]
    pub delivery_timeout_ms: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct ParticipantArgs {
    /// Name shown as the sender of every message typed here.
    #[arg(long)]
    pub user: String,

    /// Port of the local server that receives rebroadcasts. 0 picks one.
    #[arg(long)]
    pub port: u16,

    /// Interface the local server binds to.
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: String,

    /// Address of the hub.
    #[arg(long, default_value = "127.0.0.1:50051")]
    pub hub: String,

    /// Host the hub should call back on, instead of the address it observes.
    #[arg(long)]
    pub advertise_address: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn participant_defaults_point_at_local_hub() {
        let cli = Cli::try_parse_from([
            "chat_relay",
            "participant",
            "--user",
            "alice",
            "--port",
            "6001",
        ])
        .expect("valid arguments");
        let Command::Participant(args) = cli.command else {
            panic!("expected participant subcommand");
        };
        assert_eq!(args.hub, "127.0.0.1:50051");
        assert_eq!(args.bind, "0.0.0.0");
        assert_eq!(args.port, 6001);
        assert!(args.advertise_address.is_none());
    }

    #[test]
    fn participant_requires_a_port() {
        let result = Cli::try_parse_from(["chat_relay", "participant", "--user", "alice"]);
        assert!(result.is_err());
    }

    #[test]
    fn hub_accepts_a_delivery_timeout() {
        let cli = Cli::try_parse_from([
            "chat_relay",
            "hub",
            "--listen",
            "127.0.0.1:0",
            "--delivery-timeout-ms",
            "1500",
        ])
        .expect("valid arguments");
        let Command::Hub(args) = cli.command else {
            panic!("expected hub subcommand");
        };
        assert_eq!(args.listen.port(), 0);
        assert_eq!(args.delivery_timeout_ms, Some(1500));
    }
}
