use std::fmt::{Display, Formatter};

/// Dispatcher-assigned routing tag: a dense small integer identifying one
///  registration, embedded in the upper half of outbound transaction ids so
///  that responses can be correlated without a table scan. Tag 0 means
///  'no routing state'.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct RoutingTag(u32);

impl Display for RoutingTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl RoutingTag {
    pub const NONE: RoutingTag = RoutingTag(0);

    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

/// A 64-bit MAD transaction identifier. The upper 32 bits are the
///  dispatcher-owned routing half, the lower 32 bits are the client-supplied
///  opaque half. The codec is pure and has no failure modes.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TransactionId(u64);

impl Display for TransactionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl TransactionId {
    pub const ZERO: TransactionId = TransactionId(0);

    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }

    pub fn routing_tag(&self) -> RoutingTag {
        RoutingTag((self.0 >> 32) as u32)
    }

    pub fn user_half(&self) -> u32 {
        self.0 as u32
    }

    /// Stamps the dispatcher's routing tag into the upper half.
    ///
    /// Setting a nonzero routing half on a tag that already carries one is a
    ///  programming error - client code must never submit tags with routing
    ///  state already set.
    #[must_use]
    pub fn with_routing_tag(self, tag: RoutingTag) -> TransactionId {
        debug_assert!(
            self.routing_tag().is_none() || tag.is_none(),
            "routing half already set on transaction id {}", self
        );
        TransactionId(((tag.0 as u64) << 32) | (self.0 & 0xffff_ffff))
    }

    /// The same id with the routing half zeroed - the form in which ids are
    ///  handed back to client code.
    #[must_use]
    pub fn cleared_routing(self) -> TransactionId {
        TransactionId(self.0 & 0xffff_ffff)
    }
}
