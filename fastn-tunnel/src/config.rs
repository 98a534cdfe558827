//! Command line and environment configuration.
//!
//! Every flag can also be set through a `FASTN_TUNNEL_*` environment
//! variable. An empty token selects the host role.

/// Expose a local TCP/UDP service to a remote peer, or reach one.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "fastn-tunnel", version)]
pub struct Args {
    /// Host: port of the local service. Client: local port to listen on (0 picks one)
    #[arg(long, env = "FASTN_TUNNEL_PORT", default_value_t = 0)]
    pub port: u16,

    /// Network type of the exposed service (host only; clients use the token's)
    #[arg(long, env = "FASTN_TUNNEL_NETWORK", default_value = "tcp")]
    pub network: crate::token::NetworkType,

    /// Connection token printed by a host; empty runs as host
    #[arg(long, env = "FASTN_TUNNEL_TOKEN", default_value = "")]
    pub token: String,

    /// Seconds to let the network settle before publishing the token
    #[arg(long, env = "FASTN_TUNNEL_STABILIZATION_DELAY", default_value_t = 20)]
    pub stabilization_delay: u64,

    /// Seconds allowed for dialing the local service
    #[arg(long, env = "FASTN_TUNNEL_DIAL_TIMEOUT", default_value_t = 10)]
    pub dial_timeout: u64,

    /// Seconds allowed for opening a stream to the host
    #[arg(long, env = "FASTN_TUNNEL_STREAM_TIMEOUT", default_value_t = 30)]
    pub stream_timeout: u64,

    /// Seconds allowed for connecting to the host
    #[arg(long, env = "FASTN_TUNNEL_CONNECT_TIMEOUT", default_value_t = 30)]
    pub connect_timeout: u64,

    /// Seconds forwarders get to finish on shutdown before they are cut
    #[arg(long, env = "FASTN_TUNNEL_DRAIN_TIMEOUT", default_value_t = 5)]
    pub drain_timeout: u64,

    /// Seconds without a datagram in either direction before a UDP flow is closed
    #[arg(long, env = "FASTN_TUNNEL_UDP_IDLE_TIMEOUT", default_value_t = 60)]
    pub udp_idle_timeout: u64,

    /// File holding this peer's 32-byte secret key, created if missing.
    /// Without it a fresh identity is used for every run
    #[arg(long, env = "FASTN_TUNNEL_SECRET_KEY_FILE")]
    pub secret_key_file: Option<std::path::PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("host mode needs --port of the local service")]
    MissingPort,
}

/// Which side of the tunnel this process is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Host {
        port: u16,
        network: crate::token::NetworkType,
    },
    /// The token is decoded when the client starts
    Client { token: String, port: u16 },
}

/// Timeouts shared by both roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub stabilization_delay: std::time::Duration,
    pub dial: std::time::Duration,
    pub stream: std::time::Duration,
    pub connect: std::time::Duration,
    pub drain: std::time::Duration,
    pub udp_idle: std::time::Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            stabilization_delay: std::time::Duration::from_secs(20),
            dial: std::time::Duration::from_secs(10),
            stream: std::time::Duration::from_secs(30),
            connect: std::time::Duration::from_secs(30),
            drain: std::time::Duration::from_secs(5),
            udp_idle: std::time::Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub role: Role,
    pub timeouts: Timeouts,
    pub secret_key_file: Option<std::path::PathBuf>,
}

impl TryFrom<Args> for Config {
    type Error = ConfigError;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        let token = args.token.trim();
        let role = if token.is_empty() {
            if args.port == 0 {
                return Err(ConfigError::MissingPort);
            }
            Role::Host {
                port: args.port,
                network: args.network,
            }
        } else {
            Role::Client {
                token: token.to_string(),
                port: args.port,
            }
        };

        Ok(Config {
            role,
            timeouts: Timeouts {
                stabilization_delay: std::time::Duration::from_secs(args.stabilization_delay),
                dial: std::time::Duration::from_secs(args.dial_timeout),
                stream: std::time::Duration::from_secs(args.stream_timeout),
                connect: std::time::Duration::from_secs(args.connect_timeout),
                drain: std::time::Duration::from_secs(args.drain_timeout),
                udp_idle: std::time::Duration::from_secs(args.udp_idle_timeout),
            },
            secret_key_file: args.secret_key_file,
        })
    }
}
