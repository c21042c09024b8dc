use crate::buffers::MadBuf;
use crate::mad_header::MAD_BLOCK_SIZE;
use crate::rmpp::{RmppFlags, RmppHeader, RmppProfile, RmppType};
use crate::safe_converter::{PrecheckedCast, SafeCast};
use bytes::BufMut;
use tracing::trace;

/// Result of applying an inbound ACK to a segmenter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckOutcome {
    /// The ACK refers to a segment that was already acknowledged.
    Stale,
    /// The acknowledged counter or the window limit moved forward, and there
    ///  are still unacknowledged segments.
    Advanced,
    /// All segments are now acknowledged.
    AllAcked,
}

/// Send-side RMPP state for one outbound multi-segment message: which segment
///  goes out next, how far the receiver has acknowledged, and how far ahead of
///  the acknowledgement the advertised window allows sending.
pub struct Segmenter {
    profile: RmppProfile,
    rmpp_version: u8,
    total_segs: u32,
    /// Next segment to transmit, 1-based.
    cur_seg: u32,
    acked_seg: u32,
    window_limit: u32,
    paylen_total: u32,
}

impl Segmenter {
    pub fn new(profile: RmppProfile, rmpp_version: u8, message_len: usize, initial_window: u32) -> Segmenter {
        Segmenter {
            profile,
            rmpp_version,
            total_segs: profile.seg_count(message_len),
            cur_seg: 1,
            acked_seg: 0,
            window_limit: initial_window,
            paylen_total: message_len.saturating_sub(profile.header_len).prechecked_cast(),
        }
    }

    pub fn total_segs(&self) -> u32 {
        self.total_segs
    }

    /// The next segment eligible for transmission, or None if the window is
    ///  exhausted or everything was sent.
    pub fn next_to_send(&self) -> Option<u32> {
        if self.cur_seg <= self.total_segs && self.cur_seg <= self.window_limit {
            Some(self.cur_seg)
        }
        else {
            None
        }
    }

    pub fn mark_sent(&mut self) {
        self.cur_seg += 1;
    }

    pub fn all_acked(&self) -> bool {
        self.acked_seg >= self.total_segs
    }

    pub fn on_ack(&mut self, seg_num: u32, new_window: u32) -> AckOutcome {
        let seg_num = seg_num.min(self.total_segs);
        if seg_num < self.acked_seg {
            trace!("stale ack for segment {} (acked up to {})", seg_num, self.acked_seg);
            return AckOutcome::Stale;
        }

        self.acked_seg = seg_num;
        self.window_limit = self.window_limit.max(new_window);
        self.cur_seg = self.cur_seg.max(self.acked_seg + 1);

        if self.all_acked() {
            AckOutcome::AllAcked
        }
        else {
            AckOutcome::Advanced
        }
    }

    /// A timeout retry restarts transmission from the first unacknowledged
    ///  segment rather than from wherever sending had progressed to.
    pub fn rewind_for_retry(&mut self) {
        self.cur_seg = self.acked_seg + 1;
    }

    /// Serializes one wire-ready segment of `message` into `buf`: the
    ///  replicated header region, the RMPP header for this segment, this
    ///  segment's slice of the payload, and zero padding up to the MAD block
    ///  size.
    pub fn build_segment(&self, seg_num: u32, message: &[u8], buf: &mut MadBuf) {
        let header_len = self.profile.header_len;
        let cap = self.profile.seg_payload_len;

        buf.clear();

        let present_header = header_len.min(message.len());
        buf.put_slice(&message[..present_header]);
        buf.put_bytes(0, header_len - present_header);

        let payload_start = header_len + (seg_num.safe_cast() - 1) * cap;
        let payload_end = (payload_start + cap).min(message.len());
        buf.put_slice(&message[payload_start.min(message.len())..payload_end]);
        buf.put_bytes(0, MAD_BLOCK_SIZE - buf.len());

        let mut flags = RmppFlags::ACTIVE;
        let mut paylen = 0;
        if seg_num == 1 {
            flags |= RmppFlags::FIRST;
            paylen = self.paylen_total;
        }
        if seg_num == self.total_segs {
            flags |= RmppFlags::LAST;
            let cap_u32: u32 = cap.prechecked_cast();
            paylen = self.paylen_total - (self.total_segs - 1) * cap_u32;
        }

        let rmpp = RmppHeader {
            rmpp_version: self.rmpp_version,
            rmpp_type: RmppType::Data,
            resp_time: 0,
            flags,
            rmpp_status: 0,
            seg_num,
            paylen_newwin: paylen,
        };
        let mut rmpp_bytes = Vec::with_capacity(RmppHeader::SERIALIZED_LEN);
        rmpp.ser(&mut rmpp_bytes);
        buf.as_mut()[RmppHeader::OFFSET..RmppHeader::OFFSET + RmppHeader::SERIALIZED_LEN]
            .copy_from_slice(&rmpp_bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn test_profile() -> RmppProfile {
        RmppProfile::new(36, 40)
    }

    fn message_with_payload(payload_len: usize) -> Vec<u8> {
        let mut message = Vec::with_capacity(36 + payload_len);
        for i in 0..36 {
            message.push(i as u8);
        }
        for i in 0..payload_len {
            message.push((i % 251) as u8);
        }
        message
    }

    fn rmpp_of(buf: &MadBuf) -> RmppHeader {
        let mut b = &buf.as_ref()[RmppHeader::OFFSET..RmppHeader::OFFSET + RmppHeader::SERIALIZED_LEN];
        RmppHeader::deser(&mut b).unwrap()
    }

    #[rstest]
    #[case::empty(0, 1)]
    #[case::partial(39, 1)]
    #[case::exact_one(40, 1)]
    #[case::two(41, 2)]
    #[case::three(100, 3)]
    fn test_total_segs(#[case] payload_len: usize, #[case] expected: u32) {
        let message = message_with_payload(payload_len);
        let segmenter = Segmenter::new(test_profile(), 1, message.len(), 8);
        assert_eq!(segmenter.total_segs(), expected);
    }

    #[test]
    fn test_segment_flags_and_lengths() {
        let message = message_with_payload(100);
        let segmenter = Segmenter::new(test_profile(), 1, message.len(), 8);
        assert_eq!(segmenter.total_segs(), 3);

        let mut buf = MadBuf::new(MAD_BLOCK_SIZE);

        segmenter.build_segment(1, &message, &mut buf);
        let rmpp = rmpp_of(&buf);
        assert_eq!(rmpp.flags, RmppFlags::ACTIVE | RmppFlags::FIRST);
        assert_eq!(rmpp.seg_num, 1);
        assert_eq!(rmpp.paylen_newwin, 100);
        assert_eq!(buf.len(), MAD_BLOCK_SIZE);

        segmenter.build_segment(2, &message, &mut buf);
        let rmpp = rmpp_of(&buf);
        assert_eq!(rmpp.flags, RmppFlags::ACTIVE);
        assert_eq!(rmpp.seg_num, 2);
        assert_eq!(rmpp.paylen_newwin, 0);
        assert_eq!(&buf.as_ref()[36..76], &message[76..116]);

        segmenter.build_segment(3, &message, &mut buf);
        let rmpp = rmpp_of(&buf);
        assert_eq!(rmpp.flags, RmppFlags::ACTIVE | RmppFlags::LAST);
        assert_eq!(rmpp.seg_num, 3);
        assert_eq!(rmpp.paylen_newwin, 20);
        assert_eq!(&buf.as_ref()[36..56], &message[116..136]);
        // tail of the last segment is zero-padded
        assert!(buf.as_ref()[56..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_single_segment_has_first_and_last() {
        let message = message_with_payload(40);
        let segmenter = Segmenter::new(test_profile(), 1, message.len(), 8);

        let mut buf = MadBuf::new(MAD_BLOCK_SIZE);
        segmenter.build_segment(1, &message, &mut buf);

        let rmpp = rmpp_of(&buf);
        assert_eq!(rmpp.flags, RmppFlags::ACTIVE | RmppFlags::FIRST | RmppFlags::LAST);
        assert_eq!(rmpp.paylen_newwin, 40);
    }

    #[test]
    fn test_window_limits_sending() {
        let message = message_with_payload(200);
        let mut segmenter = Segmenter::new(test_profile(), 1, message.len(), 2);
        assert_eq!(segmenter.total_segs(), 5);

        assert_eq!(segmenter.next_to_send(), Some(1));
        segmenter.mark_sent();
        assert_eq!(segmenter.next_to_send(), Some(2));
        segmenter.mark_sent();
        assert_eq!(segmenter.next_to_send(), None);

        assert_eq!(segmenter.on_ack(2, 4), AckOutcome::Advanced);
        assert_eq!(segmenter.next_to_send(), Some(3));
        segmenter.mark_sent();
        segmenter.mark_sent();
        assert_eq!(segmenter.next_to_send(), None);

        assert_eq!(segmenter.on_ack(1, 4), AckOutcome::Stale);
        assert_eq!(segmenter.next_to_send(), None);

        assert_eq!(segmenter.on_ack(4, 10), AckOutcome::Advanced);
        segmenter.mark_sent();
        assert_eq!(segmenter.next_to_send(), None);
        assert!(!segmenter.all_acked());

        assert_eq!(segmenter.on_ack(5, 10), AckOutcome::AllAcked);
        assert!(segmenter.all_acked());
    }

    #[test]
    fn test_ack_seg_is_clamped_to_total() {
        let message = message_with_payload(50);
        let mut segmenter = Segmenter::new(test_profile(), 1, message.len(), 8);
        assert_eq!(segmenter.total_segs(), 2);

        assert_eq!(segmenter.on_ack(100, 100), AckOutcome::AllAcked);
    }

    #[test]
    fn test_rewind_for_retry() {
        let message = message_with_payload(200);
        let mut segmenter = Segmenter::new(test_profile(), 1, message.len(), 8);

        for _ in 0..4 {
            segmenter.mark_sent();
        }
        assert_eq!(segmenter.next_to_send(), Some(5));

        segmenter.on_ack(2, 8);
        segmenter.rewind_for_retry();
        assert_eq!(segmenter.next_to_send(), Some(3));
    }
}
