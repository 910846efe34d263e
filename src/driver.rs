//! MAC driver façade.
//!
//! [`TschMac`] owns the radio, the slot timer, the schedule, the neighbor
//! queues and the powercycle state, and exposes the operations the network
//! stack drives: `send`/`send_list`, `input`, `on`/`off`, plus the drains for
//! completion events and received payloads. Completion callbacks are not
//! invoked from the time-critical slot context; the powercycle posts
//! [`SentEvent`]s to a bounded queue which the main task empties via
//! [`TschMac::sent`].

use heapless::spsc::Queue;
use heapless::Vec;
use log::{debug, trace, warn};
use rand_core::RngCore;

use crate::config::MacConfig;
use crate::error::MacError;
use crate::framer::{FrameKind, FrameMeta, Framer};
use crate::neighbor::{NeighborTable, QueueError};
use crate::packet::{RxInfo, RxMessage, SentEvent, TxPacket, MAX_FRAME_LEN};
use crate::radio::Radio;
use crate::schedule::Slotframe;
use crate::slot::{Powercycle, Step};
use crate::time::{Schedule, SlotTimer, Tick};
use crate::Addr;

/// Depth of the received-seqno duplicate suppression ring
pub const SEQNO_HISTORY: usize = 8;

/// Most-recent-first ring of received (sender, seqno) pairs
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SeqnoHistory {
    entries: [Option<(Addr, u8)>; SEQNO_HISTORY],
}

impl SeqnoHistory {
    fn new() -> Self {
        Self {
            entries: [None; SEQNO_HISTORY],
        }
    }

    fn seen(&self, src: Addr, seqno: u8) -> bool {
        self.entries.iter().any(|e| *e == Some((src, seqno)))
    }

    fn record(&mut self, src: Addr, seqno: u8) {
        self.entries.rotate_right(1);
        self.entries[0] = Some((src, seqno));
    }

    #[cfg(test)]
    pub(crate) fn head(&self) -> Option<(Addr, u8)> {
        self.entries[0]
    }
}

/// MAC operating state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NodeState {
    Off,
    Associated,
}

/// Process-wide 802.15.4e state block
#[derive(Debug, Clone, PartialEq)]
pub struct MacState {
    /// Absolute slot number since the network epoch
    pub asn: u64,

    /// Data sequence number; never zero on the wire
    pub(crate) dsn: u8,
    /// Enhanced-beacon sequence number; never zero on the wire
    pub(crate) ebsn: u8,

    pub is_sync: bool,
    pub node: NodeState,
    pub join_priority: u8,

    /// Radio time captured at the last slot start
    pub captured_time: Tick,
}

impl MacState {
    fn new() -> Self {
        Self {
            asn: 0,
            dsn: 0,
            ebsn: 0,
            is_sync: false,
            node: NodeState::Off,
            join_priority: 0xff,
            captured_time: Tick(0),
        }
    }
}

/// TSCH MAC, generic over the radio (R), slot timer (T), RNG (G) and
/// framer (F)
pub struct TschMac<R, T, G, F> {
    pub(crate) config: MacConfig,

    pub(crate) radio: R,
    pub(crate) timer: T,
    pub(crate) rng: G,
    pub(crate) framer: F,

    pub(crate) slotframe: Slotframe,
    pub(crate) neighbors: NeighborTable,
    pub(crate) state: MacState,
    pub(crate) pc: Powercycle,

    pub(crate) seqno_history: SeqnoHistory,
    pub(crate) tx_done: Queue<SentEvent, 16>,
    pub(crate) rx_queue: Queue<RxMessage, 8>,

    /// Scratch buffer for frame reads and parses
    pub(crate) rxbuf: [u8; MAX_FRAME_LEN],
}

impl<R, T, G, F> TschMac<R, T, G, F>
where
    R: Radio,
    T: SlotTimer,
    G: RngCore,
    F: Framer,
{
    pub fn new(
        config: MacConfig,
        slotframe: Slotframe,
        radio: R,
        timer: T,
        rng: G,
        framer: F,
    ) -> Self {
        debug!("setup TSCH MAC with address {:?}", config.address);

        Self {
            config,
            radio,
            timer,
            rng,
            framer,
            slotframe,
            neighbors: NeighborTable::new(),
            state: MacState::new(),
            pc: Powercycle::new(),
            seqno_history: SeqnoHistory::new(),
            tx_done: Queue::new(),
            rx_queue: Queue::new(),
            rxbuf: [0u8; MAX_FRAME_LEN],
        }
    }

    /// Bring the MAC up and anchor the slotframe.
    ///
    /// Association and scanning are not implemented; the node comes up
    /// already synchronized at ASN 0.
    pub fn on(&mut self) -> Result<(), MacError<R::Error>> {
        if self.state.node == NodeState::Associated {
            return Ok(());
        }

        self.state.node = NodeState::Associated;
        self.state.is_sync = true;
        self.state.asn = 0;

        self.pc = Powercycle::new();
        self.pc.step = Step::SlotStart;

        let now = self.timer.now();
        self.state.captured_time = now;
        self.pc.start = now + self.config.timing.slot_duration;

        loop {
            match self.timer.schedule_at(self.pc.start) {
                Schedule::Ok => {
                    debug!("MAC on, first slot at {:?}", self.pc.start);
                    return Ok(());
                }
                Schedule::Missed => {
                    self.pc.start += self.config.timing.slot_duration;
                }
                Schedule::HardwareError => {
                    self.state.node = NodeState::Off;
                    self.state.is_sync = false;
                    self.pc.step = Step::Idle;
                    return Err(MacError::Timer);
                }
            }
        }
    }

    /// Stop the powercycle, optionally leaving the receiver powered
    pub fn off(&mut self, keep_radio_on: bool) -> Result<(), MacError<R::Error>> {
        self.config.keep_radio_on = keep_radio_on;
        self.state.node = NodeState::Off;
        self.state.is_sync = false;
        self.pc.step = Step::Idle;

        debug!("MAC off (keep radio on: {})", keep_radio_on);

        let res = if keep_radio_on {
            self.radio.on()
        } else {
            self.radio.off()
        };
        res.map_err(MacError::Radio)
    }

    /// Queue a payload for `dest`, returning the assigned sequence number.
    ///
    /// Unicast frames request an acknowledgement; the matching
    /// [`SentEvent`] carries the same sequence number once the packet leaves
    /// the MAC.
    pub fn send(&mut self, dest: Addr, payload: &[u8]) -> Result<u8, MacError<R::Error>> {
        if self.state.node != NodeState::Associated {
            return Err(MacError::NotAssociated);
        }

        let ack_request = !dest.is_null();
        let seqno = self.next_dsn();

        let meta = FrameMeta {
            src: self.config.address,
            dst: dest,
            seqno,
            ack_request,
        };

        let mut buf = [0u8; MAX_FRAME_LEN];
        let n = self.framer.create(&meta, payload, &mut buf)?;

        let packet = TxPacket::new(dest, seqno, &buf[..n]).ok_or(MacError::NoMemory)?;

        self.neighbors.set_busy(true);
        let res = self.neighbors.enqueue(dest, packet);
        self.neighbors.set_busy(false);

        match res {
            Ok(()) => {
                trace!("queued seq {} for {:?} ({} bytes)", seqno, dest, n);
                Ok(seqno)
            }
            Err(QueueError::Full) => Err(MacError::QueueFull),
            Err(QueueError::NoMemory) => Err(MacError::NoMemory),
        }
    }

    /// Queue a burst of payloads for `dest`, aborting on the first failure
    /// so the caller can retry the whole burst without reordering fragments
    pub fn send_list(&mut self, dest: Addr, payloads: &[&[u8]]) -> Result<(), MacError<R::Error>> {
        for payload in payloads {
            self.send(dest, payload)?;
        }

        Ok(())
    }

    /// Feed a received frame through the input path: parse, filter,
    /// suppress duplicates, deliver. Returns whether the frame was delivered.
    pub fn input(&mut self, frame: &[u8]) -> bool {
        if frame.len() > MAX_FRAME_LEN {
            debug!("oversized frame dropped");
            return false;
        }

        self.rxbuf[..frame.len()].copy_from_slice(frame);
        self.input_pending(frame.len())
    }

    /// Input path over the first `len` bytes of the scratch buffer
    pub(crate) fn input_pending(&mut self, len: usize) -> bool {
        let frame = match self.framer.parse(&self.rxbuf[..len]) {
            Ok(f) => f,
            Err(_) => {
                debug!("dropping undecodable frame");
                return false;
            }
        };

        if frame.kind != FrameKind::Data {
            debug!("ignoring {:?} frame from {:?}", frame.kind, frame.src);
            return false;
        }

        if self.config.address_filter
            && frame.dst != self.config.address
            && !frame.dst.is_null()
        {
            trace!("frame for {:?} filtered", frame.dst);
            return false;
        }

        if self.seqno_history.seen(frame.src, frame.seqno) {
            debug!("duplicate seq {} from {:?} suppressed", frame.seqno, frame.src);
            return false;
        }

        let payload = match Vec::from_slice(frame.payload) {
            Ok(p) => p,
            Err(_) => {
                warn!("oversized payload dropped");
                return false;
            }
        };
        let msg = RxMessage {
            info: RxInfo { source: frame.src },
            payload,
        };

        self.seqno_history.record(frame.src, frame.seqno);

        if self.rx_queue.enqueue(msg).is_err() {
            warn!("rx queue full, dropping frame");
            return false;
        }

        trace!("delivered seq {} from {:?}", frame.seqno, frame.src);
        true
    }

    /// Pop the next completion event
    pub fn sent(&mut self) -> Option<SentEvent> {
        self.tx_done.dequeue()
    }

    /// Pop the next received payload into `buf`
    pub fn receive(&mut self, buf: &mut [u8]) -> Option<(usize, RxInfo)> {
        let msg = self.rx_queue.dequeue()?;

        if buf.len() < msg.payload.len() {
            warn!("receive buffer too small, dropping payload");
            return None;
        }

        buf[..msg.payload.len()].copy_from_slice(&msg.payload);
        Some((msg.payload.len(), msg.info))
    }

    /// Mark (or unmark) a neighbor whose ACK drift reports steer our clock
    pub fn set_time_source(
        &mut self,
        addr: Addr,
        time_source: bool,
    ) -> Result<(), MacError<R::Error>> {
        self.neighbors.set_busy(true);
        let res = self.neighbors.set_time_source(addr, time_source);
        self.neighbors.set_busy(false);

        res.map_err(|_| MacError::NoMemory)
    }

    /// Drop a neighbor's queue, discarding anything still pending on it
    pub fn remove_neighbor(&mut self, addr: &Addr) -> bool {
        self.neighbors.set_busy(true);
        let removed = self.neighbors.remove(addr);
        self.neighbors.set_busy(false);

        removed
    }

    /// TSCH is not a duty-cycled channel-check protocol
    pub fn channel_check_interval(&self) -> u32 {
        0
    }

    pub fn neighbors(&self) -> &NeighborTable {
        &self.neighbors
    }

    pub fn mac_state(&self) -> &MacState {
        &self.state
    }

    pub fn slotframe(&self) -> &Slotframe {
        &self.slotframe
    }

    pub fn slotframe_mut(&mut self) -> &mut Slotframe {
        &mut self.slotframe
    }

    /// Next data sequence number; skips zero on rollover
    fn next_dsn(&mut self) -> u8 {
        self.state.dsn = self.state.dsn.wrapping_add(1);
        if self.state.dsn == 0 {
            self.state.dsn = self.state.dsn.wrapping_add(1);
        }

        self.state.dsn
    }

    /// Next enhanced-beacon sequence number; skips zero on rollover.
    /// Reserved for beacon generation.
    pub fn next_ebsn(&mut self) -> u8 {
        self.state.ebsn = self.state.ebsn.wrapping_add(1);
        if self.state.ebsn == 0 {
            self.state.ebsn = self.state.ebsn.wrapping_add(1);
        }

        self.state.ebsn
    }
}
