//! Connection tokens.
//!
//! A token is the only thing a client needs to reach a host: the host's peer
//! id and the network type of the forwarded service. It is handed over out
//! of band (chat, QR code), so it is one printable line.
//!
//! Layout before armoring:
//!
//! ```text
//! ┌─────────┬─────────┬──────────────────────────┐
//! │ version │ network │ peer id (32 bytes)       │
//! │ 1 byte  │ 1 byte  │                          │
//! └─────────┴─────────┴──────────────────────────┘
//! ```
//!
//! The bytes are armored with `BASE32_DNSSEC`, the same alphabet as ID52.
//! The token is not signed: whoever delivers it is trusted.

use crate::peer::PeerId;

const VERSION: u8 = 1;
const ENCODED_LEN: usize = 2 + PeerId::LEN;

/// Transport protocol of the forwarded local service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NetworkType {
    #[default]
    Tcp,
    Udp,
}

impl NetworkType {
    fn to_byte(self) -> u8 {
        match self {
            NetworkType::Tcp => 0,
            NetworkType::Udp => 1,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(NetworkType::Tcp),
            1 => Some(NetworkType::Udp),
            _ => None,
        }
    }
}

impl std::fmt::Display for NetworkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkType::Tcp => write!(f, "tcp"),
            NetworkType::Udp => write!(f, "udp"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unsupported network type {0:?}, expected tcp or udp")]
pub struct ParseNetworkTypeError(String);

impl std::str::FromStr for NetworkType {
    type Err = ParseNetworkTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(NetworkType::Tcp),
            "udp" => Ok(NetworkType::Udp),
            other => Err(ParseNetworkTypeError(other.to_string())),
        }
    }
}

/// Everything a client needs to locate a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionToken {
    pub peer: PeerId,
    pub network: NetworkType,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("token is not valid base32: {source}")]
    Armor { source: data_encoding::DecodeError },

    #[error("token payload is {actual} bytes, expected {expected}")]
    Length { expected: usize, actual: usize },

    #[error("unknown token version {0}")]
    Version(u8),

    #[error("unknown network type byte {0}")]
    Network(u8),

    #[error("token does not name a valid peer: {source}")]
    Peer { source: crate::peer::ParsePeerIdError },
}

impl ConnectionToken {
    pub fn new(peer: PeerId, network: NetworkType) -> Self {
        Self { peer, network }
    }

    pub fn encode(&self) -> String {
        let mut bytes = Vec::with_capacity(ENCODED_LEN);
        bytes.push(VERSION);
        bytes.push(self.network.to_byte());
        bytes.extend_from_slice(&self.peer.to_bytes());
        data_encoding::BASE32_DNSSEC.encode(&bytes)
    }

    /// Parse a token as pasted by a user: surrounding whitespace and letter
    /// case are ignored.
    pub fn decode(token: &str) -> Result<Self, DecodeError> {
        let token = token.trim().to_ascii_lowercase();
        let bytes = data_encoding::BASE32_DNSSEC
            .decode(token.as_bytes())
            .map_err(|source| DecodeError::Armor { source })?;

        if bytes.len() != ENCODED_LEN {
            return Err(DecodeError::Length {
                expected: ENCODED_LEN,
                actual: bytes.len(),
            });
        }
        if bytes[0] != VERSION {
            return Err(DecodeError::Version(bytes[0]));
        }
        let network = NetworkType::from_byte(bytes[1]).ok_or(DecodeError::Network(bytes[1]))?;

        let mut peer = [0u8; PeerId::LEN];
        peer.copy_from_slice(&bytes[2..]);

        let peer = PeerId::from_bytes(&peer).map_err(|source| DecodeError::Peer { source })?;

        Ok(Self { peer, network })
    }
}

impl std::fmt::Display for ConnectionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

impl std::str::FromStr for ConnectionToken {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}
