use crate::buffers::{MadBuf, MadBufferPool};
use crate::rmpp::{RmppFlags, RmppHeader, RmppProfile};
use crate::safe_converter::SafeCast;
use crate::tid::TransactionId;
use crate::transport::RemoteId;
use bytes::BufMut;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

/// Identity of one in-progress multi-segment receive. The transaction tag
///  alone is not sufficient because remote senders choose their tags
///  independently of each other.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ReassemblyKey {
    pub tid: TransactionId,
    pub mgmt_class: u8,
    pub class_version: u8,
    pub method: u8,
    pub remote: RemoteId,
}

/// An acknowledgement the receive side owes the sender.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ack {
    pub seg_num: u32,
    pub new_window: u32,
}

/// What became of one inbound DATA segment.
#[derive(Debug, PartialEq, Eq)]
pub enum SegmentDisposition {
    /// The last segment arrived; the transfer is complete. Carries the full
    ///  reassembled message and the final ACK.
    Delivered(Vec<u8>, Ack),
    /// An in-order segment was absorbed; an ACK is due only when the segment
    ///  exhausted the advertised window.
    Accepted(Option<Ack>),
    /// A re-delivery of an already absorbed segment. The buffer is untouched,
    ///  the previous acknowledgement state is re-emitted.
    Duplicate(Ack),
    /// Out-of-order segment, or a non-initial segment with no matching
    ///  record. No response is sent; the sender's retry resynchronizes.
    Dropped,
}

struct ReassemblyRecord {
    profile: RmppProfile,
    /// Next segment number this record will absorb, 1-based.
    expected_seg: u32,
    window_limit: u32,
    /// Set by the liveness sweep; cleared by any traffic. Two consecutive
    ///  sweeps without traffic expire the record.
    inactive: bool,
    buf: MadBuf,
}

impl ReassemblyRecord {
    fn current_ack(&self) -> Ack {
        Ack {
            seg_num: self.expected_seg - 1,
            new_window: self.window_limit,
        }
    }
}

/// All in-progress multi-segment receives of one MAD service.
pub struct ReassemblyList {
    records: FxHashMap<ReassemblyKey, ReassemblyRecord>,
    initial_window: u32,
    window_growth: u32,
}

impl ReassemblyList {
    pub fn new(initial_window: u32, window_growth: u32) -> ReassemblyList {
        ReassemblyList {
            records: FxHashMap::default(),
            initial_window,
            window_growth,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Feeds one inbound DATA segment into the matching record, creating the
    ///  record if this is segment 1 of a new transfer.
    pub fn on_data(
        &mut self,
        key: ReassemblyKey,
        profile: RmppProfile,
        rmpp: &RmppHeader,
        mad: &[u8],
        pool: &MadBufferPool,
    ) -> SegmentDisposition {
        if !self.records.contains_key(&key) {
            if rmpp.seg_num != 1 {
                trace!("segment {} of {:?} without a matching record: dropping", rmpp.seg_num, key);
                return SegmentDisposition::Dropped;
            }

            let mut buf = pool.get_from_pool();
            buf.grow(profile.header_len + self.initial_window.safe_cast() * profile.seg_payload_len);
            buf.put_slice(&mad[..profile.header_len.min(mad.len())]);

            self.records.insert(key, ReassemblyRecord {
                profile,
                expected_seg: 1,
                window_limit: self.initial_window,
                inactive: false,
                buf,
            });
        }

        let record = self.records.get_mut(&key).unwrap();
        record.inactive = false;

        if rmpp.seg_num < record.expected_seg {
            trace!("duplicate segment {} of {:?}: re-acking", rmpp.seg_num, key);
            return SegmentDisposition::Duplicate(record.current_ack());
        }
        if rmpp.seg_num > record.expected_seg {
            trace!("out-of-order segment {} of {:?} (expected {}): dropping",
                rmpp.seg_num, key, record.expected_seg);
            return SegmentDisposition::Dropped;
        }

        let is_last = rmpp.flags.contains(RmppFlags::LAST);
        let take = if is_last {
            rmpp.paylen_newwin.safe_cast().min(record.profile.seg_payload_len)
        }
        else {
            record.profile.seg_payload_len
        };
        let payload_start = record.profile.header_len.min(mad.len());
        let payload_end = (payload_start + take).min(mad.len());

        record.buf.grow(record.buf.len() + take);
        record.buf.put_slice(&mad[payload_start..payload_end]);
        record.buf.put_bytes(0, take - (payload_end - payload_start));

        if is_last {
            let ack = Ack { seg_num: rmpp.seg_num, new_window: rmpp.seg_num };
            let record = self.records.remove(&key).unwrap();
            let message = record.buf.as_ref().to_vec();
            pool.return_to_pool(record.buf);
            debug!("reassembly of {:?} complete: {} bytes", key, message.len());
            return SegmentDisposition::Delivered(message, ack);
        }

        record.expected_seg += 1;
        if rmpp.seg_num == record.window_limit {
            record.window_limit += self.window_growth;
            record.buf.grow(record.profile.header_len
                + record.window_limit.safe_cast() * record.profile.seg_payload_len);
            let ack = record.current_ack();
            trace!("window exhausted for {:?}: acking with new window {}", key, ack.new_window);
            SegmentDisposition::Accepted(Some(ack))
        }
        else {
            SegmentDisposition::Accepted(None)
        }
    }

    /// Coarse liveness sweep: a record found inactive on two consecutive
    ///  sweeps is expired, whatever its state.
    pub fn sweep(&mut self, pool: &MadBufferPool) {
        let expired = self.records.iter()
            .filter(|(_, r)| r.inactive)
            .map(|(k, _)| *k)
            .collect::<Vec<_>>();

        for key in expired {
            debug!("expiring stale reassembly {:?}", key);
            let record = self.records.remove(&key).unwrap();
            pool.return_to_pool(record.buf);
        }

        for record in self.records.values_mut() {
            record.inactive = true;
        }
    }

    /// Drops all in-progress receives, e.g. during service teardown.
    pub fn clear(&mut self, pool: &MadBufferPool) {
        for (_, record) in self.records.drain() {
            pool.return_to_pool(record.buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mad_header::{mgmt_class, MAD_BLOCK_SIZE};
    use crate::segmenter::Segmenter;
    use rstest::rstest;

    fn test_key() -> ReassemblyKey {
        ReassemblyKey {
            tid: TransactionId::from_raw(0x99),
            mgmt_class: mgmt_class::SUBN_ADM,
            class_version: 2,
            method: 0x92,
            remote: RemoteId { lid: 7, qpn: 1 },
        }
    }

    fn data_rmpp(seg_num: u32, flags: RmppFlags, paylen: u32) -> RmppHeader {
        RmppHeader {
            rmpp_version: RmppHeader::VERSION_1,
            rmpp_type: crate::rmpp::RmppType::Data,
            resp_time: 0,
            flags: flags | RmppFlags::ACTIVE,
            rmpp_status: 0,
            seg_num,
            paylen_newwin: paylen,
        }
    }

    fn parse_rmpp(mad: &[u8]) -> RmppHeader {
        let mut b = &mad[RmppHeader::OFFSET..RmppHeader::OFFSET + RmppHeader::SERIALIZED_LEN];
        RmppHeader::deser(&mut b).unwrap()
    }

    fn message_with_payload(profile: RmppProfile, payload_len: usize) -> Vec<u8> {
        let mut message = Vec::with_capacity(profile.header_len + payload_len);
        for i in 0..profile.header_len {
            message.push(i as u8);
        }
        for i in 0..payload_len {
            message.push((i % 251) as u8);
        }
        message
    }

    #[rstest]
    #[case::sa_empty(mgmt_class::SUBN_ADM, 0)]
    #[case::sa_partial(mgmt_class::SUBN_ADM, 77)]
    #[case::sa_exactly_one(mgmt_class::SUBN_ADM, 200)]
    #[case::sa_one_plus_one(mgmt_class::SUBN_ADM, 201)]
    #[case::sa_many(mgmt_class::SUBN_ADM, 999)]
    #[case::plain_empty(mgmt_class::PERF, 0)]
    #[case::plain_exactly_one(mgmt_class::PERF, 220)]
    #[case::plain_many(mgmt_class::PERF, 1000)]
    fn test_segment_reassemble_roundtrip(#[case] class: u8, #[case] payload_len: usize) {
        let profile = RmppProfile::for_class(class);
        let message = message_with_payload(profile, payload_len);
        let segmenter = Segmenter::new(profile, 1, message.len(), u32::MAX);

        let pool = MadBufferPool::new(MAD_BLOCK_SIZE, 4);
        let mut list = ReassemblyList::new(4, 4);
        let mut buf = MadBuf::new(MAD_BLOCK_SIZE);

        let mut delivered = None;
        for seg in 1..=segmenter.total_segs() {
            segmenter.build_segment(seg, &message, &mut buf);
            let rmpp = parse_rmpp(buf.as_ref());

            match list.on_data(test_key(), profile, &rmpp, buf.as_ref(), &pool) {
                SegmentDisposition::Delivered(m, ack) => {
                    assert_eq!(seg, segmenter.total_segs());
                    assert_eq!(ack, Ack { seg_num: seg, new_window: seg });
                    delivered = Some(m);
                }
                SegmentDisposition::Accepted(_) => assert_ne!(seg, segmenter.total_segs()),
                other => panic!("unexpected disposition {:?}", other),
            }
        }

        let delivered = delivered.unwrap();
        assert_eq!(delivered.len(), message.len());
        assert_eq!(&delivered[profile.header_len..], &message[profile.header_len..]);
        assert_eq!(&delivered[..RmppHeader::OFFSET], &message[..RmppHeader::OFFSET]);
        assert!(list.is_empty());
    }

    #[test]
    fn test_single_last_segment_completes_immediately() {
        let profile = RmppProfile::new(24, 40);
        let pool = MadBufferPool::new(MAD_BLOCK_SIZE, 4);
        let mut list = ReassemblyList::new(8, 8);

        let mad = vec![0x5a; MAD_BLOCK_SIZE];
        let rmpp = data_rmpp(1, RmppFlags::FIRST | RmppFlags::LAST, 40);

        match list.on_data(test_key(), profile, &rmpp, &mad, &pool) {
            SegmentDisposition::Delivered(message, ack) => {
                assert_eq!(message.len(), 24 + 40);
                assert_eq!(ack, Ack { seg_num: 1, new_window: 1 });
            }
            other => panic!("unexpected disposition {:?}", other),
        }
        assert!(list.is_empty());
    }

    #[test]
    fn test_duplicate_segment_is_idempotent() {
        let profile = RmppProfile::new(24, 40);
        let pool = MadBufferPool::new(MAD_BLOCK_SIZE, 4);
        let mut list = ReassemblyList::new(8, 8);

        let mad = vec![1u8; MAD_BLOCK_SIZE];
        assert_eq!(
            list.on_data(test_key(), profile, &data_rmpp(1, RmppFlags::FIRST, 100), &mad, &pool),
            SegmentDisposition::Accepted(None));
        assert_eq!(
            list.on_data(test_key(), profile, &data_rmpp(2, RmppFlags::empty(), 0), &mad, &pool),
            SegmentDisposition::Accepted(None));

        // the payload of a duplicate is never applied, even if it differs
        let altered = vec![2u8; MAD_BLOCK_SIZE];
        let first_ack = match list.on_data(test_key(), profile, &data_rmpp(1, RmppFlags::FIRST, 100), &altered, &pool) {
            SegmentDisposition::Duplicate(ack) => ack,
            other => panic!("unexpected disposition {:?}", other),
        };
        let second_ack = match list.on_data(test_key(), profile, &data_rmpp(2, RmppFlags::empty(), 0), &altered, &pool) {
            SegmentDisposition::Duplicate(ack) => ack,
            other => panic!("unexpected disposition {:?}", other),
        };
        assert_eq!(first_ack, second_ack);

        let rmpp = data_rmpp(3, RmppFlags::LAST, 20);
        match list.on_data(test_key(), profile, &rmpp, &mad, &pool) {
            SegmentDisposition::Delivered(message, _) => {
                assert!(message[24..].iter().all(|&b| b == 1));
            }
            other => panic!("unexpected disposition {:?}", other),
        }
    }

    #[test]
    fn test_out_of_order_segment_is_dropped() {
        let profile = RmppProfile::new(24, 40);
        let pool = MadBufferPool::new(MAD_BLOCK_SIZE, 4);
        let mut list = ReassemblyList::new(8, 8);

        let mad = vec![0u8; MAD_BLOCK_SIZE];
        assert_eq!(
            list.on_data(test_key(), profile, &data_rmpp(1, RmppFlags::FIRST, 100), &mad, &pool),
            SegmentDisposition::Accepted(None));
        assert_eq!(
            list.on_data(test_key(), profile, &data_rmpp(3, RmppFlags::empty(), 0), &mad, &pool),
            SegmentDisposition::Dropped);
    }

    #[test]
    fn test_non_initial_segment_without_record_is_dropped() {
        let profile = RmppProfile::new(24, 40);
        let pool = MadBufferPool::new(MAD_BLOCK_SIZE, 4);
        let mut list = ReassemblyList::new(8, 8);

        let mad = vec![0u8; MAD_BLOCK_SIZE];
        assert_eq!(
            list.on_data(test_key(), profile, &data_rmpp(2, RmppFlags::empty(), 0), &mad, &pool),
            SegmentDisposition::Dropped);
        assert!(list.is_empty());
    }

    #[test]
    fn test_window_exhaustion_acks_with_grown_window() {
        let profile = RmppProfile::new(24, 40);
        let pool = MadBufferPool::new(MAD_BLOCK_SIZE, 4);
        let mut list = ReassemblyList::new(2, 3);

        let mad = vec![0u8; MAD_BLOCK_SIZE];
        assert_eq!(
            list.on_data(test_key(), profile, &data_rmpp(1, RmppFlags::FIRST, 400), &mad, &pool),
            SegmentDisposition::Accepted(None));
        assert_eq!(
            list.on_data(test_key(), profile, &data_rmpp(2, RmppFlags::empty(), 0), &mad, &pool),
            SegmentDisposition::Accepted(Some(Ack { seg_num: 2, new_window: 5 })));
        assert_eq!(
            list.on_data(test_key(), profile, &data_rmpp(3, RmppFlags::empty(), 0), &mad, &pool),
            SegmentDisposition::Accepted(None));
    }

    #[test]
    fn test_sweep_expires_after_two_idle_intervals() {
        let profile = RmppProfile::new(24, 40);
        let pool = MadBufferPool::new(MAD_BLOCK_SIZE, 4);
        let mut list = ReassemblyList::new(8, 8);

        let mad = vec![0u8; MAD_BLOCK_SIZE];
        list.on_data(test_key(), profile, &data_rmpp(1, RmppFlags::FIRST, 100), &mad, &pool);

        list.sweep(&pool);
        assert!(!list.is_empty());

        // traffic between sweeps keeps the record alive
        list.on_data(test_key(), profile, &data_rmpp(2, RmppFlags::empty(), 0), &mad, &pool);
        list.sweep(&pool);
        assert!(!list.is_empty());

        list.sweep(&pool);
        assert!(list.is_empty());
    }
}
