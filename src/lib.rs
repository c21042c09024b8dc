//! Management Datagram (MAD) dispatch and reassembly engine for an InfiniBand
//!  verbs stack: it routes completed send/receive operations on a management
//!  queue pair to the correct client, and reconstructs multi-segment management
//!  messages with the Reliable Multi-Packet Protocol (RMPP).
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *MADs* (fixed 256-byte management
//!   datagrams), with transparent segmentation and reassembly for logical
//!   messages larger than one datagram
//! * Exactly-once completion reporting per transaction: however many segments,
//!   retries or control messages a send takes, its completion callback fires
//!   exactly once
//! * Per-segment protocol noise (duplicates, stale ACKs, out-of-order arrivals)
//!   is absorbed internally and never surfaces to client code
//! * The engine is agnostic to which physical queue pair produced a datagram -
//!   the underlying hardware path is consumed only through a narrow capability
//!   interface ([`transport::MadTransport`])
//! * No cooperative scheduler of its own: all protocol work runs on whatever
//!   task delivers completions, with a single per-service sweep task driving
//!   retries and reassembly expiry
//!
//! ## Wire format
//!
//! Base MAD header - all numbers network byte order (BE):
//! ```ascii
//!  0: base version (u8) - always 1
//!  1: management class (u8)
//!  2: class version (u8)
//!  3: method (u8) - top bit distinguishes request from response
//!  4: status (u16) - bit 0 is the 'busy' bit
//!  6: class-specific (u16)
//!  8: transaction id (u64) - the upper 32 bits are dispatcher-owned routing
//!      state, the lower 32 bits are client-opaque
//! 16: attribute id (u16)
//! 18: reserved (u16)
//! 20: attribute modifier (u32)
//! ```
//!
//! RMPP header, overlaying offsets 24..36 of an RMPP MAD:
//! ```ascii
//! 24: RMPP version (u8) - only version 1 is supported
//! 25: RMPP type (u8): 1 DATA, 2 ACK, 3 STOP, 4 ABORT
//! 26: response time / flags (u8) - upper 5 bits response time, lower 3 bits
//!      flags: 0x01 ACTIVE, 0x02 FIRST, 0x04 LAST
//! 27: RMPP status (u8)
//! 28: segment number (u32), 1-based
//! 32: payload length or new window (u32):
//!      * DATA segment 1: total payload length of the logical message
//!      * DATA last segment: exact number of payload bytes in this segment
//!      * ACK: new window limit (highest segment the sender may transmit)
//! ```
//!
//! Every wire datagram is exactly 256 bytes; the unused tail of the last
//!  segment is zero-padded. The per-segment payload capacity depends on the
//!  management class: the subnet administration class carries a larger class
//!  header (56 bytes total, 200 payload bytes per segment), all other classes
//!  share the common header (36 bytes total, 220 payload bytes per segment).
//!
//! ## Components
//!
//! * [`dispatcher::MadDispatcher`] - process-wide (per queue pair) registry
//!   mapping routing tags and (version, class, method) triples to registered
//!   clients; fans every completion out to exactly one [`service::MadService`]
//! * [`service::MadService`] - per-client send/receive lifecycle: outstanding
//!   transactions, response matching, retry/timeout sweep, reassembly list
//! * [`segmenter::Segmenter`] - splits an outbound message into DATA segments
//!   and tracks acknowledgement-driven window advancement
//! * [`reassembly::ReassemblyList`] - accepts inbound DATA segments, validates
//!   ordering, grows the reassembly buffer with the advertised window, and
//!   emits ACKs

pub mod buffers;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod mad_header;
pub mod reassembly;
pub mod rmpp;
pub mod safe_converter;
pub mod segmenter;
pub mod service;
pub mod tid;
pub mod transaction;
pub mod transport;
