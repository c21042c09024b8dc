use crate::tid::TransactionId;
use thiserror::Error;

/// Reasons a client registration can be rejected.
#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("method 0x{method:02x} of class 0x{class:02x} version {version} is already claimed")]
    MethodInUse { version: u8, class: u8, method: u8 },
    #[error("a registration for unsolicited delivery must claim at least one method")]
    EmptyMethodMask,
    #[error("method mask contains a method code outside 0..128")]
    InvalidMethodMask,
}

/// Reasons an inbound MAD cannot be routed to any client.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("no registered client matches")]
    NotFound,
    #[error("malformed MAD")]
    Malformed(#[source] anyhow::Error),
}

/// Reasons an outbound send is rejected up front.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("message of {0} bytes is shorter than a MAD header")]
    TooShort(usize),
    #[error("message of {0} bytes exceeds a single MAD and RMPP is not in effect")]
    TooLong(usize),
    #[error("unsupported RMPP version {0}")]
    UnsupportedRmppVersion(u8),
    #[error("failed to acquire an address vector")]
    AddressVector(#[source] anyhow::Error),
    #[error("the service is shutting down")]
    ShuttingDown,
}

/// A chain send failed at `index`; everything before it was accepted and will
///  complete individually.
#[derive(Debug, Error)]
#[error("chain send failed at element {index}")]
pub struct ChainSendError {
    pub accepted: Vec<TransactionId>,
    pub index: usize,
    #[source]
    pub source: SendError,
}

/// Reasons the transport layer can reject a submitted segment.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("send queue is full")]
    QueueFull,
    #[error("transport failure")]
    Fatal(#[from] anyhow::Error),
}
