//! Link-layer framing contract and the 802.15.4 data framer.
//!
//! The MAC serializes outbound payloads and parses inbound frames through the
//! [`Framer`] trait; [`Ieee802154Framer`] is the stock implementation on top
//! of the `ieee802154` crate. Acknowledgement frames never pass through here,
//! they are built and parsed byte-level by the [`crate::sync`] module.

use ieee802154::mac::{
    Address, AddressMode, ExtendedAddress, FrameContent, FrameType, FrameVersion, Header, PanId,
    Security, ShortAddress,
};

use crate::Addr;

/// Framing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramerError {
    /// Malformed frame
    Decode,
    /// Payload does not fit a link frame
    PayloadTooLong,
    /// Output buffer too small
    BufferTooSmall,
}

/// Frame classes the input path cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Beacon,
    Data,
    Ack,
    Command,
}

/// Header fields for an outbound data frame
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMeta {
    pub src: Addr,
    pub dst: Addr,
    pub seqno: u8,
    pub ack_request: bool,
}

/// A parsed inbound frame
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFrame<'a> {
    pub kind: FrameKind,
    pub src: Addr,
    pub dst: Addr,
    pub seqno: u8,
    pub ack_request: bool,
    pub payload: &'a [u8],
}

/// Frame serializer/deserializer used by the MAC
pub trait Framer {
    /// Serialize a data frame into `buf`, returning the frame length
    fn create(&self, meta: &FrameMeta, payload: &[u8], buf: &mut [u8])
        -> Result<usize, FramerError>;

    /// Deserialize a link frame
    fn parse<'a>(&self, buf: &'a [u8]) -> Result<ParsedFrame<'a>, FramerError>;
}

/// Data framer producing 802.15.4-2006 frames with extended addressing
#[derive(Debug, Clone, PartialEq)]
pub struct Ieee802154Framer {
    pan_id: PanId,
}

impl Ieee802154Framer {
    pub fn new(pan_id: u16) -> Self {
        Self {
            pan_id: PanId(pan_id),
        }
    }

    fn encode_addr(&self, addr: Addr) -> Address {
        if addr.is_null() {
            Address::broadcast(&AddressMode::Short)
        } else {
            Address::Extended(self.pan_id, ExtendedAddress(addr.eui()))
        }
    }

    fn decode_addr(&self, addr: Address) -> Addr {
        match addr {
            Address::Extended(_, e) if e == ExtendedAddress::broadcast() => Addr::NULL,
            Address::Extended(_, e) => Addr::from_eui(e.0),
            Address::Short(_, s) if s == ShortAddress::broadcast() => Addr::NULL,
            Address::Short(_, s) => Addr::from_eui(s.0 as u64),
            Address::None => Addr::NULL,
        }
    }
}

impl Framer for Ieee802154Framer {
    fn create(
        &self,
        meta: &FrameMeta,
        payload: &[u8],
        buf: &mut [u8],
    ) -> Result<usize, FramerError> {
        let header = Header {
            frame_type: FrameType::Data,
            security: Security::None,
            frame_pending: false,
            ack_request: meta.ack_request,
            pan_id_compress: false,
            version: FrameVersion::Ieee802154_2006,
            destination: self.encode_addr(meta.dst),
            source: self.encode_addr(meta.src),
            seq: meta.seqno,
        };

        let mut len = header.encode(buf);
        len += FrameContent::Data.encode(&mut buf[len..]);

        if len + payload.len() > buf.len() {
            return Err(FramerError::PayloadTooLong);
        }

        buf[len..len + payload.len()].copy_from_slice(payload);

        Ok(len + payload.len())
    }

    fn parse<'a>(&self, buf: &'a [u8]) -> Result<ParsedFrame<'a>, FramerError> {
        let (header, header_len) = Header::decode(buf).map_err(|_| FramerError::Decode)?;

        let body = &buf[header_len..];
        let (_content, used) =
            FrameContent::decode(body, &header).map_err(|_| FramerError::Decode)?;

        let kind = match header.frame_type {
            FrameType::Beacon => FrameKind::Beacon,
            FrameType::Data => FrameKind::Data,
            FrameType::Acknowledgement => FrameKind::Ack,
            FrameType::MacCommand => FrameKind::Command,
        };

        Ok(ParsedFrame {
            kind,
            src: self.decode_addr(header.source),
            dst: self.decode_addr(header.destination),
            seqno: header.seq,
            ack_request: header.ack_request,
            payload: &body[used..],
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn data_frame_roundtrip() {
        let framer = Ieee802154Framer::new(0x0100);

        let meta = FrameMeta {
            src: Addr::from_eui(0x1122),
            dst: Addr::from_eui(0x3344),
            seqno: 5,
            ack_request: true,
        };

        let mut buf = [0u8; 127];
        let n = framer.create(&meta, &[1, 2, 3], &mut buf).unwrap();

        let parsed = framer.parse(&buf[..n]).unwrap();

        assert_eq!(parsed.kind, FrameKind::Data);
        assert_eq!(parsed.src, meta.src);
        assert_eq!(parsed.dst, meta.dst);
        assert_eq!(parsed.seqno, 5);
        assert!(parsed.ack_request);
        assert_eq!(parsed.payload, &[1, 2, 3]);
    }

    #[test]
    fn broadcast_maps_to_null_addr() {
        let framer = Ieee802154Framer::new(0x0100);

        let meta = FrameMeta {
            src: Addr::from_eui(0x1122),
            dst: Addr::NULL,
            seqno: 9,
            ack_request: false,
        };

        let mut buf = [0u8; 127];
        let n = framer.create(&meta, &[], &mut buf).unwrap();

        let parsed = framer.parse(&buf[..n]).unwrap();

        assert_eq!(parsed.dst, Addr::NULL);
        assert!(!parsed.ack_request);
    }

    #[test]
    fn truncated_frame_rejected() {
        let framer = Ieee802154Framer::new(0x0100);

        assert_eq!(framer.parse(&[0x61]), Err(FramerError::Decode));
    }
}
