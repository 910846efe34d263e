//! Radio driver contract consumed by the slot state machine.
//!
//! The MAC drives the radio through precisely timed, polled operations; the
//! driver is expected to keep an SFD-captured timestamp of the last received
//! frame available through [`Radio::rx_end_time`].

use crate::time::Tick;

/// Result of a frame transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxResult {
    /// Frame went out
    Ok,
    /// Channel was busy
    Collision,
    /// Hardware-level ACK missing (radios with automatic ACK handling)
    NoAck,
    /// Transmission failed
    Error,
}

/// Radio operations required by the TSCH powercycle
pub trait Radio {
    type Error: core::fmt::Debug;

    /// Power the receiver/transmitter up
    fn on(&mut self) -> Result<(), Self::Error>;

    /// Power the radio down
    fn off(&mut self) -> Result<(), Self::Error>;

    /// Select an IEEE 802.15.4 channel (11..=26)
    fn set_channel(&mut self, channel: u8) -> Result<(), Self::Error>;

    /// Re-arm SFD timestamp capture for the coming slot
    fn sfd_sync(&mut self) -> Result<(), Self::Error>;

    /// Load a frame into the transmit buffer
    fn prepare(&mut self, frame: &[u8]) -> Result<(), Self::Error>;

    /// Transmit the previously prepared frame
    fn transmit(&mut self, len: usize) -> Result<TxResult, Self::Error>;

    /// Clear channel assessment
    fn channel_clear(&mut self) -> Result<bool, Self::Error>;

    /// Whether a frame is currently being received
    fn receiving_packet(&mut self) -> Result<bool, Self::Error>;

    /// Whether a complete received frame is pending
    fn pending_packet(&mut self) -> Result<bool, Self::Error>;

    /// Read a pending frame
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;

    /// Read a pending acknowledgement frame
    fn read_ack(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;

    /// SFD-anchored timestamp of the last received frame
    fn rx_end_time(&mut self) -> Tick;

    /// Transmit a soft-ACK immediately
    fn send_ack(&mut self, frame: &[u8]) -> Result<(), Self::Error>;
}

#[cfg(any(test, feature = "mocks"))]
pub mod mock {
    use super::{Radio, TxResult};
    use crate::time::Tick;

    use heapless::Vec;

    const FRAME_CAP: usize = 127;

    /// Scripted radio double.
    ///
    /// Tests preload `cca_clear`, `tx_result`, `ack_reply` and `rx_frame`,
    /// then inspect `sent` / `acks_sent` after driving the MAC.
    #[derive(Debug, Clone, Default)]
    pub struct MockRadio {
        pub on: bool,
        pub channel: u8,
        pub cca_clear: bool,
        pub tx_result: Option<TxResult>,
        pub receiving: bool,

        /// Frame handed to `prepare`
        pub prepared: Option<Vec<u8, FRAME_CAP>>,
        /// Frames that went through `transmit`
        pub sent: std::vec::Vec<std::vec::Vec<u8>>,
        /// Soft-ACKs that went through `send_ack`
        pub acks_sent: std::vec::Vec<std::vec::Vec<u8>>,

        /// Frame returned (once) by `read_ack`
        pub ack_reply: Option<Vec<u8, FRAME_CAP>>,
        /// Frame returned (once) by `read`
        pub rx_frame: Option<Vec<u8, FRAME_CAP>>,
        pub rx_end: Tick,
    }

    impl MockRadio {
        pub fn new() -> Self {
            Self {
                cca_clear: true,
                tx_result: Some(TxResult::Ok),
                ..Self::default()
            }
        }

        pub fn load_rx(&mut self, frame: &[u8], rx_end: Tick) {
            self.rx_frame = Some(Vec::from_slice(frame).unwrap());
            self.rx_end = rx_end;
        }

        pub fn load_ack(&mut self, ack: &[u8]) {
            self.ack_reply = Some(Vec::from_slice(ack).unwrap());
        }
    }

    impl Radio for MockRadio {
        type Error = core::convert::Infallible;

        fn on(&mut self) -> Result<(), Self::Error> {
            self.on = true;
            Ok(())
        }

        fn off(&mut self) -> Result<(), Self::Error> {
            self.on = false;
            Ok(())
        }

        fn set_channel(&mut self, channel: u8) -> Result<(), Self::Error> {
            self.channel = channel;
            Ok(())
        }

        fn sfd_sync(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }

        fn prepare(&mut self, frame: &[u8]) -> Result<(), Self::Error> {
            self.prepared = Some(Vec::from_slice(frame).unwrap());
            Ok(())
        }

        fn transmit(&mut self, len: usize) -> Result<TxResult, Self::Error> {
            let frame = self.prepared.take().expect("transmit without prepare");
            assert_eq!(frame.len(), len);
            self.sent.push(frame[..].to_vec());

            Ok(self.tx_result.unwrap_or(TxResult::Error))
        }

        fn channel_clear(&mut self) -> Result<bool, Self::Error> {
            Ok(self.cca_clear)
        }

        fn receiving_packet(&mut self) -> Result<bool, Self::Error> {
            Ok(self.receiving)
        }

        fn pending_packet(&mut self) -> Result<bool, Self::Error> {
            Ok(self.ack_reply.is_some() || self.rx_frame.is_some())
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
            match self.rx_frame.take() {
                Some(f) => {
                    buf[..f.len()].copy_from_slice(&f);
                    Ok(f.len())
                }
                None => Ok(0),
            }
        }

        fn read_ack(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
            match self.ack_reply.take() {
                Some(f) => {
                    buf[..f.len()].copy_from_slice(&f);
                    Ok(f.len())
                }
                None => Ok(0),
            }
        }

        fn rx_end_time(&mut self) -> Tick {
            self.rx_end
        }

        fn send_ack(&mut self, frame: &[u8]) -> Result<(), Self::Error> {
            self.acks_sent.push(frame.to_vec());
            Ok(())
        }
    }
}
