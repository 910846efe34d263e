//! Sync Information Element codec and acknowledgement wire format.
//!
//! Acknowledgements carry a 16-bit status word reporting the measured clock
//! drift of the acknowledged frame, in microseconds:
//!
//! ```text
//! bits 0-10   drift magnitude (us, saturating at 2047)
//! bit  11     drift sign (1 = negative)
//! bits 12-14  reserved, zero
//! bit  15     NACK flag
//! ```

use byteorder::{ByteOrder, LittleEndian};

use crate::time::{ticks_to_us, us_to_ticks};

/// ACK frame length without IEs: FCF (2) + seqno (1)
pub const ACK_LEN: usize = 3;
/// Length of the appended Sync IE
pub const EXTRA_ACK_LEN: usize = 4;

/// FCF byte 0: ACK frame type
pub const ACK_FCF0: u8 = 0x02;
/// FCF byte 1: IE list present, frame version 2
pub const ACK_FCF1_IE: u8 = 0x22;
/// FCF byte 1 bit flagging an IE list
pub const FCF1_IE_PRESENT: u8 = 0x02;

/// Sync IE header: length, element ID
pub const SYNC_IE_HEADER: [u8; 2] = [0x02, 0x1e];

/// Largest drift magnitude representable in the status word (us)
pub const MAX_DRIFT_US: i32 = 0x07ff;

const DRIFT_MASK: u16 = 0x07ff;
const SIGN_BIT: u16 = 0x0800;
const NACK_BIT: u16 = 0x8000;

/// Decoded Sync IE contents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncIe {
    /// Reported drift in microseconds
    pub drift_us: i32,
    /// Negative acknowledgement flag
    pub nack: bool,
}

impl SyncIe {
    /// Build an IE from a drift measured in radio-timer ticks
    pub fn from_ticks(drift_ticks: i32, nack: bool) -> Self {
        Self {
            drift_us: ticks_to_us(drift_ticks),
            nack,
        }
    }

    /// Reported drift converted back to ticks
    pub fn drift_ticks(&self) -> i32 {
        us_to_ticks(self.drift_us)
    }

    /// Encode as the 4-byte wire IE, saturating the drift at +/-2047 us
    pub fn encode(&self) -> [u8; EXTRA_ACK_LEN] {
        let us = self.drift_us.max(-MAX_DRIFT_US).min(MAX_DRIFT_US);

        let mut status = us.unsigned_abs() as u16 & DRIFT_MASK;
        if us < 0 {
            status |= SIGN_BIT;
        }
        if self.nack {
            status |= NACK_BIT;
        }

        let mut out = [SYNC_IE_HEADER[0], SYNC_IE_HEADER[1], 0, 0];
        LittleEndian::write_u16(&mut out[2..4], status);
        out
    }

    /// Decode a 4-byte wire IE
    pub fn decode(bytes: &[u8]) -> Option<SyncIe> {
        if bytes.len() < EXTRA_ACK_LEN || bytes[..2] != SYNC_IE_HEADER {
            return None;
        }

        let status = LittleEndian::read_u16(&bytes[2..4]);

        let mut drift_us = (status & DRIFT_MASK) as i32;
        if status & SIGN_BIT != 0 {
            drift_us = -drift_us;
        }

        Some(SyncIe {
            drift_us,
            nack: status & NACK_BIT != 0,
        })
    }
}

/// Contents of a validated acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckInfo {
    /// Sync IE, when the ACK carried one
    pub sync: Option<SyncIe>,
}

/// Assemble a soft-ACK for `seqno` reporting `drift_ticks`
pub fn make_sync_ack(seqno: u8, drift_ticks: i32, nack: bool) -> [u8; ACK_LEN + EXTRA_ACK_LEN] {
    let ie = SyncIe::from_ticks(drift_ticks, nack).encode();

    [
        ACK_FCF0, ACK_FCF1_IE, seqno, ie[0], ie[1], ie[2], ie[3],
    ]
}

/// Validate a received ACK frame against the transmitted sequence number.
///
/// Returns `None` when the frame is not an ACK for `seqno`.
pub fn parse_ack(buf: &[u8], seqno: u8) -> Option<AckInfo> {
    if buf.len() < ACK_LEN || buf[0] != ACK_FCF0 || buf[2] != seqno {
        return None;
    }

    let sync = if buf[1] & FCF1_IE_PRESENT != 0 && buf.len() == ACK_LEN + EXTRA_ACK_LEN {
        SyncIe::decode(&buf[ACK_LEN..])
    } else {
        None
    };

    Some(AckInfo { sync })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_word_roundtrip() {
        for &us in &[0, 1, 305, 2047, -1, -305, -2047] {
            for &nack in &[false, true] {
                let ie = SyncIe { drift_us: us, nack };
                let decoded = SyncIe::decode(&ie.encode()).unwrap();

                assert_eq!(decoded.drift_us, us);
                assert_eq!(decoded.nack, nack);
            }
        }
    }

    #[test]
    fn drift_saturates_at_2047_us() {
        let ie = SyncIe {
            drift_us: 5000,
            nack: false,
        };
        assert_eq!(SyncIe::decode(&ie.encode()).unwrap().drift_us, 2047);

        let ie = SyncIe {
            drift_us: -5000,
            nack: true,
        };
        let decoded = SyncIe::decode(&ie.encode()).unwrap();
        assert_eq!(decoded.drift_us, -2047);
        assert!(decoded.nack);
    }

    #[test]
    fn wire_layout() {
        // +305 us: status word 0x0131, little endian
        let ie = SyncIe {
            drift_us: 305,
            nack: false,
        };
        assert_eq!(ie.encode(), [0x02, 0x1e, 0x31, 0x01]);

        // 10 ticks of drift report as 305 us
        assert_eq!(SyncIe::from_ticks(10, false), ie);
    }

    #[test]
    fn sync_ack_frame() {
        let ack = make_sync_ack(42, 10, false);
        assert_eq!(ack[..3], [0x02, 0x22, 42]);

        let info = parse_ack(&ack, 42).unwrap();
        assert_eq!(
            info.sync,
            Some(SyncIe {
                drift_us: 305,
                nack: false
            })
        );
    }

    #[test]
    fn ack_validation() {
        // Wrong seqno
        assert_eq!(parse_ack(&[0x02, 0x00, 7], 8), None);
        // Not an ACK frame type
        assert_eq!(parse_ack(&[0x01, 0x00, 7], 7), None);
        // Truncated
        assert_eq!(parse_ack(&[0x02, 0x00], 7), None);

        // Plain ACK without IE
        let info = parse_ack(&[0x02, 0x00, 7], 7).unwrap();
        assert_eq!(info.sync, None);
    }

    #[test]
    fn nack_flag_decodes() {
        let ack = make_sync_ack(3, 0, true);
        let info = parse_ack(&ack, 3).unwrap();
        assert!(info.sync.unwrap().nack);
    }
}
