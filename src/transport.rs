use crate::error::SubmitError;
use crate::tid::TransactionId;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::fmt::{Display, Formatter};

/// Opaque handle to a hardware address vector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AvHandle(pub u32);

/// Identifies a remote MAD endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RemoteId {
    pub lid: u16,
    pub qpn: u32,
}
impl Display for RemoteId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06x}/{}", self.lid, self.qpn)
    }
}

/// Raw per-segment completion status reported by the hardware.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireStatus {
    Success,
    /// The queue was flushed, typically during teardown.
    Flushed,
    Failure,
}

/// A hardware send completion for a single previously submitted segment. The
///  tid carries the routing half stamped at submission time.
#[derive(Clone, Debug)]
pub struct SendCompletion {
    pub tid: TransactionId,
    pub status: WireStatus,
}

/// A fully received MAD datagram (or, after reassembly, a full multi-segment
///  message laid out as one contiguous MAD image).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecvMad {
    pub remote: RemoteId,
    pub data: Vec<u8>,
}

/// Final status of an outbound transaction as reported to the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendStatus {
    Success,
    Failure,
    TimedOut,
    Canceled,
    Flushed,
}

/// The one-shot outcome of an outbound transaction. The tid is the client's
///  own transaction id with the routing half cleared again.
#[derive(Clone, Debug)]
pub struct SendOutcome {
    pub tid: TransactionId,
    pub status: SendStatus,
    /// Present iff the send expected a response and one arrived.
    pub response: Option<RecvMad>,
}

/// Abstraction of the underlying hardware queue pair. Implementations wrap
///  the verbs layer; tests mock this.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MadTransport: Send + Sync {
    /// Hands one wire-ready MAD to the hardware send queue. The submitted
    ///  bytes carry the routing half of the tid so that the matching
    ///  [SendCompletion] can be routed back.
    async fn submit_segment(&self, av: AvHandle, data: &[u8]) -> Result<(), SubmitError>;

    /// Called when previously exhausted send queue capacity may be available
    ///  again, e.g. after a batch of completions was reaped.
    async fn resume(&self);

    fn acquire_address_vector(&self, remote: RemoteId) -> anyhow::Result<AvHandle>;

    fn release_address_vector(&self, av: AvHandle);
}

/// Callback surface of a registered client.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MadClient: Send + Sync {
    /// Exactly one invocation per accepted send.
    async fn on_send_complete(&self, outcome: SendOutcome);

    /// Unsolicited MADs matching the registration's method mask, and snooped
    ///  traffic for snoop registrations.
    async fn on_receive(&self, mad: RecvMad);
}
