use crate::mad_header::{mgmt_class, method, MadHeader, MAD_BLOCK_SIZE};
use crate::safe_converter::PrecheckedCast;
use bitflags::bitflags;
use bytes::{Buf, BufMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RmppFlags: u8 {
        const ACTIVE = 0x01;
        const FIRST = 0x02;
        const LAST = 0x04;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RmppType {
    Data = 1,
    Ack = 2,
    Stop = 3,
    Abort = 4,
}

impl TryFrom<u8> for RmppType {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(RmppType::Data),
            2 => Ok(RmppType::Ack),
            3 => Ok(RmppType::Stop),
            4 => Ok(RmppType::Abort),
            v => Err(anyhow::anyhow!("invalid RMPP type {}", v)),
        }
    }
}

/// The 12-byte RMPP header that immediately follows the base header in
///  RMPP-active MADs.
///
/// The meaning of `seg_num` and `paylen_newwin` depends on `rmpp_type`:
///  for DATA they are the 1-based segment number and (on FIRST / LAST
///  segments) the total / remaining payload length, for ACK they are the
///  acknowledged segment and the new window limit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RmppHeader {
    pub rmpp_version: u8,
    pub rmpp_type: RmppType,
    pub resp_time: u8,
    pub flags: RmppFlags,
    pub rmpp_status: u8,
    pub seg_num: u32,
    pub paylen_newwin: u32,
}

impl RmppHeader {
    pub const SERIALIZED_LEN: usize = 12;
    /// Byte offset of the RMPP header within a MAD.
    pub const OFFSET: usize = MadHeader::SERIALIZED_LEN;
    pub const VERSION_1: u8 = 1;
    /// Offset of the rtime/flags byte within a MAD, for cheap activity probes.
    pub const RTIME_FLAGS_OFFSET: usize = Self::OFFSET + 2;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.rmpp_version);
        buf.put_u8(self.rmpp_type as u8);
        buf.put_u8((self.resp_time << 3) | self.flags.bits());
        buf.put_u8(self.rmpp_status);
        buf.put_u32(self.seg_num);
        buf.put_u32(self.paylen_newwin);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<RmppHeader> {
        let rmpp_version = buf.try_get_u8()?;
        let rmpp_type = RmppType::try_from(buf.try_get_u8()?)?;
        let rtime_flags = buf.try_get_u8()?;
        let rmpp_status = buf.try_get_u8()?;
        let seg_num = buf.try_get_u32()?;
        let paylen_newwin = buf.try_get_u32()?;

        Ok(RmppHeader {
            rmpp_version,
            rmpp_type,
            resp_time: rtime_flags >> 3,
            flags: RmppFlags::from_bits_truncate(rtime_flags & 0x07),
            rmpp_status,
            seg_num,
            paylen_newwin,
        })
    }
}

/// Per-class segmentation geometry: how many leading bytes of each segment
///  are class header (replicated into every segment) and how many bytes of
///  actual payload each segment carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RmppProfile {
    pub header_len: usize,
    pub seg_payload_len: usize,
}

impl RmppProfile {
    pub fn new(header_len: usize, seg_payload_len: usize) -> RmppProfile {
        RmppProfile { header_len, seg_payload_len }
    }

    /// SubnAdm replicates its 32-byte SA header into every segment, all other
    ///  classes carry only base + RMPP headers.
    pub fn for_class(mgmt_class: u8) -> RmppProfile {
        if mgmt_class == mgmt_class::SUBN_ADM {
            RmppProfile::new(56, MAD_BLOCK_SIZE - 56)
        } else {
            RmppProfile::new(36, MAD_BLOCK_SIZE - 36)
        }
    }

    /// Number of segments a message of the given total length occupies. An
    ///  empty payload still takes one segment.
    pub fn seg_count(&self, message_len: usize) -> u32 {
        let payload = message_len.saturating_sub(self.header_len);
        ((payload + self.seg_payload_len - 1) / self.seg_payload_len).max(1).prechecked_cast()
    }
}

/// Decides whether an outbound message is sent through RMPP segmentation.
///
/// RMPP applies if the caller asked for it explicitly, if the class / method
///  combination is specified as always multi-packet, or if the class sits in
///  the vendor RMPP range and the caller pre-set the ACTIVE flag in the
///  message's RMPP header area.
pub fn rmpp_applies(header: &MadHeader, explicit_version: Option<u8>, mad: &[u8]) -> bool {
    if explicit_version.is_some() {
        return true;
    }
    if header.mgmt_class == mgmt_class::SUBN_ADM {
        return matches!(
            header.method,
            method::GET_TABLE_RESP | method::GET_MULTI | method::GET_MULTI_RESP
        );
    }
    if (mgmt_class::VENDOR_RMPP_START..=mgmt_class::VENDOR_RMPP_END).contains(&header.mgmt_class) {
        return mad.len() > RmppHeader::RTIME_FLAGS_OFFSET
            && mad[RmppHeader::RTIME_FLAGS_OFFSET] & RmppFlags::ACTIVE.bits() != 0;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tid::TransactionId;
    use rstest::rstest;

    #[rstest]
    fn test_ser_byte_layout() {
        let header = RmppHeader {
            rmpp_version: RmppHeader::VERSION_1,
            rmpp_type: RmppType::Data,
            resp_time: 0x0e,
            flags: RmppFlags::ACTIVE | RmppFlags::FIRST,
            rmpp_status: 0,
            seg_num: 1,
            paylen_newwin: 0x0000_0410,
        };

        let mut buf = Vec::new();
        header.ser(&mut buf);
        assert_eq!(buf, vec![
            1, 1, 0x73, 0,
            0, 0, 0, 1,
            0, 0, 0x04, 0x10,
        ]);
        assert_eq!(buf.len(), RmppHeader::SERIALIZED_LEN);
    }

    #[rstest]
    #[case::data(RmppType::Data, RmppFlags::ACTIVE | RmppFlags::FIRST | RmppFlags::LAST, 1, 40)]
    #[case::ack(RmppType::Ack, RmppFlags::ACTIVE, 3, 7)]
    #[case::abort(RmppType::Abort, RmppFlags::ACTIVE, 0, 0)]
    fn test_roundtrip(
        #[case] rmpp_type: RmppType,
        #[case] flags: RmppFlags,
        #[case] seg_num: u32,
        #[case] paylen_newwin: u32,
    ) {
        let original = RmppHeader {
            rmpp_version: RmppHeader::VERSION_1,
            rmpp_type,
            resp_time: 5,
            flags,
            rmpp_status: 0,
            seg_num,
            paylen_newwin,
        };

        let mut buf = Vec::new();
        original.ser(&mut buf);

        let mut b: &[u8] = &buf;
        let deser = RmppHeader::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, original);
    }

    #[rstest]
    fn test_deser_invalid_type() {
        let mut b: &[u8] = &[1, 9, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0];
        assert!(RmppHeader::deser(&mut b).is_err());
    }

    #[rstest]
    #[case::subn_adm(mgmt_class::SUBN_ADM, 56, 200)]
    #[case::perf(mgmt_class::PERF, 36, 220)]
    #[case::vendor(0x43, 36, 220)]
    fn test_profile_for_class(#[case] class: u8, #[case] header_len: usize, #[case] payload_len: usize) {
        let profile = RmppProfile::for_class(class);
        assert_eq!(profile.header_len, header_len);
        assert_eq!(profile.seg_payload_len, payload_len);
    }

    #[rstest]
    #[case::empty(24, 1)]
    #[case::header_only(24 + 0, 1)]
    #[case::one_byte(25, 1)]
    #[case::exactly_one_seg(24 + 40, 1)]
    #[case::one_seg_plus_one(24 + 41, 2)]
    #[case::three_segs(24 + 120, 3)]
    fn test_seg_count(#[case] message_len: usize, #[case] expected: u32) {
        let profile = RmppProfile::new(24, 40);
        assert_eq!(profile.seg_count(message_len), expected);
    }

    fn header_for(class: u8, m: u8) -> MadHeader {
        MadHeader {
            base_version: MadHeader::BASE_VERSION_1,
            mgmt_class: class,
            class_version: 2,
            method: m,
            status: 0,
            class_specific: 0,
            tid: TransactionId::ZERO,
            attr_id: 0,
            attr_mod: 0,
        }
    }

    #[rstest]
    #[case::explicit_version(mgmt_class::PERF, method::GET, Some(1), 0, true)]
    #[case::sa_get_table_resp(mgmt_class::SUBN_ADM, method::GET_TABLE_RESP, None, 0, true)]
    #[case::sa_get_multi(mgmt_class::SUBN_ADM, method::GET_MULTI, None, 0, true)]
    #[case::sa_get(mgmt_class::SUBN_ADM, method::GET, None, 0, false)]
    #[case::vendor_active(0x40, method::GET, None, 0x01, true)]
    #[case::vendor_inactive(0x4f, method::GET, None, 0x00, false)]
    #[case::plain(mgmt_class::PERF, method::GET, None, 0x01, false)]
    fn test_rmpp_applies(
        #[case] class: u8,
        #[case] m: u8,
        #[case] explicit: Option<u8>,
        #[case] rtime_flags: u8,
        #[case] expected: bool,
    ) {
        let mut mad = vec![0u8; MAD_BLOCK_SIZE];
        mad[RmppHeader::RTIME_FLAGS_OFFSET] = rtime_flags;
        assert_eq!(rmpp_applies(&header_for(class, m), explicit, &mad), expected);
    }
}
