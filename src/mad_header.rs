use crate::tid::TransactionId;
use bytes::{Buf, BufMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

/// Every wire datagram handled by this engine is exactly this long.
pub const MAD_BLOCK_SIZE: usize = 256;

/// Well-known management classes.
pub mod mgmt_class {
    pub const SUBN_LID: u8 = 0x01;
    pub const SUBN_DIR: u8 = 0x81;
    pub const SUBN_ADM: u8 = 0x03;
    pub const PERF: u8 = 0x04;
    pub const BM: u8 = 0x05;
    pub const DEV: u8 = 0x06;
    /// Connection management. This class manages its own transaction tag
    ///  space and is never subject to routing-tag correlation.
    pub const CM: u8 = 0x07;
    pub const VENDOR_START: u8 = 0x09;
    pub const VENDOR_END: u8 = 0x0f;
    /// Vendor-extended range whose classes may carry RMPP.
    pub const VENDOR_RMPP_START: u8 = 0x40;
    pub const VENDOR_RMPP_END: u8 = 0x4f;
}

/// Well-known methods. The top bit distinguishes request from response.
pub mod method {
    pub const GET: u8 = 0x01;
    pub const SET: u8 = 0x02;
    pub const GET_RESP: u8 = 0x81;
    pub const SEND: u8 = 0x03;
    pub const TRAP: u8 = 0x05;
    pub const REPORT: u8 = 0x06;
    pub const REPORT_RESP: u8 = 0x86;
    pub const TRAP_REPRESS: u8 = 0x07;
    pub const GET_TABLE: u8 = 0x12;
    pub const GET_TABLE_RESP: u8 = 0x92;
    pub const GET_MULTI: u8 = 0x14;
    pub const GET_MULTI_RESP: u8 = 0x94;

    pub const RESPONSE_BIT: u8 = 0x80;
    /// Number of distinct method codes a registration bitmap can claim.
    pub const MAX_METHODS: usize = 128;
}

/// The 24-byte header at the start of every MAD. All multi-byte fields are
///  network byte order on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MadHeader {
    pub base_version: u8,
    pub mgmt_class: u8,
    pub class_version: u8,
    pub method: u8,
    pub status: u16,
    pub class_specific: u16,
    pub tid: TransactionId,
    pub attr_id: u16,
    pub attr_mod: u32,
}

impl MadHeader {
    pub const SERIALIZED_LEN: usize = 24;
    pub const BASE_VERSION_1: u8 = 1;
    /// The 'busy' bit of the status field, distinguished from all other
    ///  status values: busy responses are absorbed, not delivered.
    pub const STATUS_BUSY: u16 = 0x0001;
    const TID_OFFSET: usize = 8;

    pub fn is_response(&self) -> bool {
        self.method & method::RESPONSE_BIT != 0
    }

    pub fn is_busy(&self) -> bool {
        self.status & Self::STATUS_BUSY != 0
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.base_version);
        buf.put_u8(self.mgmt_class);
        buf.put_u8(self.class_version);
        buf.put_u8(self.method);
        buf.put_u16(self.status);
        buf.put_u16(self.class_specific);
        buf.put_u64(self.tid.to_raw());
        buf.put_u16(self.attr_id);
        buf.put_u16(0); // reserved
        buf.put_u32(self.attr_mod);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<MadHeader> {
        let base_version = buf.try_get_u8()?;
        let mgmt_class = buf.try_get_u8()?;
        let class_version = buf.try_get_u8()?;
        let method = buf.try_get_u8()?;
        let status = buf.try_get_u16()?;
        let class_specific = buf.try_get_u16()?;
        let tid = TransactionId::from_raw(buf.try_get_u64()?);
        let attr_id = buf.try_get_u16()?;
        let _reserved = buf.try_get_u16()?;
        let attr_mod = buf.try_get_u32()?;

        Ok(MadHeader {
            base_version,
            mgmt_class,
            class_version,
            method,
            status,
            class_specific,
            tid,
            attr_id,
            attr_mod,
        })
    }

    /// Rewrites the transaction id in place in an already serialized MAD.
    ///  Used by the send path to stamp the routing half without re-serializing
    ///  the whole header.
    pub fn overwrite_tid(mad: &mut [u8], tid: TransactionId) {
        mad[Self::TID_OFFSET..Self::TID_OFFSET + 8].copy_from_slice(&tid.to_raw().to_be_bytes());
    }
}
