
use heapless::Vec;
use strum::Display;

use crate::Addr;

/// Maximum link frame length (802.15.4 PSDU without footer)
pub const MAX_FRAME_LEN: usize = 127;

/// Final MAC-level status of a transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MacStatus {
    /// Still queued / in flight
    Deferred,
    /// Acknowledged (or broadcast sent)
    Ok,
    /// No acknowledgement within the ACK window
    NoAck,
    /// Negative acknowledgement carrying sync information
    NoAckWithSync,
    /// Channel busy at CCA
    Collision,
    /// Radio failure
    Error,
}

/// An outbound packet owning its serialized frame.
///
/// Created on enqueue, destroyed when transmission succeeds or the retry
/// budget is spent.
#[derive(Debug, Clone, PartialEq)]
pub struct TxPacket {
    pub(crate) frame: Vec<u8, MAX_FRAME_LEN>,
    pub(crate) dest: Addr,
    pub(crate) seqno: u8,
    pub(crate) transmissions: u8,
    pub(crate) status: MacStatus,
}

impl TxPacket {
    pub fn new(dest: Addr, seqno: u8, frame: &[u8]) -> Option<Self> {
        let frame = Vec::from_slice(frame).ok()?;

        Some(Self {
            frame,
            dest,
            seqno,
            transmissions: 0,
            status: MacStatus::Deferred,
        })
    }

    pub fn frame(&self) -> &[u8] {
        &self.frame
    }

    pub fn seqno(&self) -> u8 {
        self.seqno
    }

    pub fn transmissions(&self) -> u8 {
        self.transmissions
    }
}

/// Completion event delivered to the upper layer once a packet leaves the MAC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentEvent {
    pub dest: Addr,
    pub seqno: u8,
    pub status: MacStatus,
    pub transmissions: u8,
}

/// Reception metadata handed up with a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxInfo {
    pub source: Addr,
}

/// A received payload queued for the upper layer
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RxMessage {
    pub info: RxInfo,
    pub payload: Vec<u8, MAX_FRAME_LEN>,
}
