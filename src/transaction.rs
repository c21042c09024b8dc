use crate::segmenter::Segmenter;
use crate::tid::TransactionId;
use crate::transport::{AvHandle, RecvMad, RemoteId};
use std::time::Duration;
use tokio::time::Instant;

/// Per-transaction retry timeout that doubles on every retry up to a cap.
pub struct RetryBackoff {
    current: Duration,
    max: Duration,
}

impl RetryBackoff {
    pub fn new(initial: Duration, max: Duration) -> RetryBackoff {
        RetryBackoff {
            current: initial.min(max),
            max,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn advance(&mut self) {
        self.current = (self.current * 2).min(self.max);
    }
}

/// Whether the engine created the address vector for this send (and must
///  release it) or merely borrowed one supplied by the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AvOwnership {
    Borrowed,
    Created,
}

/// One logical outbound send, single MAD or RMPP multi-segment, from
///  submission until its completion callback has fired.
pub struct OutboundTransaction {
    pub tid: TransactionId,
    pub remote: RemoteId,
    pub mgmt_class: u8,
    pub class_version: u8,
    pub resp_expected: bool,
    /// The full serialized message, segments are cut from this on demand.
    pub message: Vec<u8>,
    /// Present iff this send goes through RMPP segmentation.
    pub segmenter: Option<Segmenter>,
    pub retries_left: u32,
    pub backoff: RetryBackoff,
    /// None while at least one segment is in flight on the hardware; a
    ///  transaction without a deadline is never retried or timed out.
    pub deadline: Option<Instant>,
    pub in_flight_segs: u32,
    pub canceled: bool,
    /// A matched response that arrived while the send was still in flight is
    ///  parked here and delivered together with the send completion.
    pub response: Option<RecvMad>,
    pub av: AvHandle,
    pub av_ownership: AvOwnership,
}

impl OutboundTransaction {
    /// A send is finished when nothing is owed anymore: no response pending,
    ///  all RMPP segments acknowledged (or no RMPP at all).
    pub fn is_satisfied(&self) -> bool {
        if self.resp_expected && self.response.is_none() {
            return false;
        }
        match &self.segmenter {
            Some(segmenter) => segmenter.all_acked(),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::doubling(100, 1000, vec![100, 200, 400, 800, 1000, 1000])]
    #[case::capped_start(500, 400, vec![400, 400])]
    #[case::exact_cap(250, 1000, vec![250, 500, 1000, 1000])]
    fn test_backoff(#[case] initial_ms: u64, #[case] max_ms: u64, #[case] expected_ms: Vec<u64>) {
        let mut backoff = RetryBackoff::new(
            Duration::from_millis(initial_ms),
            Duration::from_millis(max_ms));

        for expected in expected_ms {
            assert_eq!(backoff.current(), Duration::from_millis(expected));
            backoff.advance();
        }
    }
}
