//! IKEv2 daemon core: wire codec, crypto, proposal/selector negotiation, key
//! schedule, the synchronous `IkeSa` state machine, and the SPI-keyed
//! dispatcher that drives it from a UDP socket.

pub mod child_sa;
pub mod config;
pub mod crypto;
pub mod daemon;
pub mod dispatcher;
pub mod keys;
pub mod kernel;
pub mod message;
pub mod proposal;
pub mod sa;
pub mod selectors;

#[derive(Debug, thiserror::Error)]
pub enum IKEError {
    #[error("decode error: {0}")]
    DecodeError(String),
    #[error("integrity check failed")]
    InvalidMac,
    #[error("unknown SPI")]
    UnknownSpi,
    #[error("no proposal chosen")]
    NoProposalChosen,
    #[error("invalid KE payload")]
    InvalidKe,
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("traffic selector unacceptable")]
    TsUnacceptable,
    #[error("temporary failure")]
    TemporaryFailure,
    #[error("maximum retransmissions exceeded")]
    MaxRetransmit,
    #[error("kernel plane error: {0}")]
    KernelError(String),
    #[error("crypto error: {0}")]
    Crypto(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("io error: {0}")]
    IO(#[from] std::io::Error),
}
