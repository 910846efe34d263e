
use crate::Addr;

/// Timeslot timing template, all values in radio-timer ticks.
///
/// Defaults follow the 15 ms timeslot template of a ~32.768 kHz radio timer
/// (one tick is 30.51 us).
#[derive(Debug, Clone, PartialEq)]
pub struct SlotTiming {
    /// Start of slot to start of CCA (1800 us)
    pub cca_offset: u32,

    /// CCA duration (128 us)
    pub cca: u32,

    /// Start of slot to start of frame transmission (4000 us)
    pub tx_offset: u32,

    /// Start of slot to receiver enable, `tx_offset - long_gt` (2700 us)
    pub rx_offset: u32,

    /// End of frame to start of its acknowledgement (4606 us)
    pub tx_ack_delay: u32,

    /// Guard time around the expected ACK (500 us)
    pub short_gt: u32,

    /// Guard time around the expected frame (1300 us)
    pub long_gt: u32,

    /// Total timeslot length (15000 us)
    pub slot_duration: u32,

    /// Radio turnaround before a transmission takes effect (366 us)
    pub delay_tx: u32,

    /// Radio turnaround before reception takes effect (366 us)
    pub delay_rx: u32,

    /// Watchdog on an incoming or outgoing frame (4256 us)
    pub wd_data_duration: u32,

    /// Watchdog on an incoming acknowledgement (2400 us)
    pub wd_ack_duration: u32,
}

impl Default for SlotTiming {
    fn default() -> Self {
        Self {
            cca_offset: 59,
            cca: 4,
            tx_offset: 131,
            rx_offset: 88,
            tx_ack_delay: 151,
            short_gt: 16,
            long_gt: 43,
            slot_duration: 492,
            delay_tx: 12,
            delay_rx: 12,
            wd_data_duration: 140,
            wd_ack_duration: 79,
        }
    }
}

/// Air time per frame byte in microseconds (250 kbit/s O-QPSK)
pub const BYTE_AIR_TIME_US: u32 = 32;

impl SlotTiming {
    /// On-air duration of a `len`-byte frame in ticks, capped at the frame
    /// watchdog
    pub fn packet_duration(&self, len: usize) -> u32 {
        let ticks = crate::time::us_to_ticks((len as u32 * BYTE_AIR_TIME_US) as i32) as u32;
        ticks.min(self.wd_data_duration)
    }
}

/// MAC configuration
#[derive(Debug, Clone, PartialEq)]
pub struct MacConfig {
    /// This node's link-layer address
    pub address: Addr,

    /// Run clear-channel assessment before transmissions
    pub cca_enabled: bool,

    /// Drop received frames not addressed to this node or broadcast
    pub address_filter: bool,

    /// Leave the receiver powered in otherwise idle slots
    pub keep_radio_on: bool,

    /// Timeslot timing template
    pub timing: SlotTiming,
}

impl Default for MacConfig {
    fn default() -> Self {
        Self {
            address: Addr::NULL,
            cca_enabled: false,
            address_filter: true,
            keep_radio_on: false,
            timing: SlotTiming::default(),
        }
    }
}
