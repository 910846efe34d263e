//! The slot state machine ("powercycle").
//!
//! One cooperative task drives every timeslot: it wakes at the slot anchor,
//! decides what the slot does, walks the radio through the TX or RX
//! choreography at fixed offsets, and finally re-arms the timer for the next
//! on-slot. Suspension happens only at the `yield_until` points; the
//! persistent state lives in [`Powercycle`] and survives across wake-ups.

use log::{debug, error, trace, warn};
use rand_core::RngCore;

use crate::driver::TschMac;
use crate::framer::Framer;
use crate::neighbor::MAX_RETRIES;
use crate::packet::{MacStatus, SentEvent};
use crate::radio::{Radio, TxResult};
use crate::schedule::{hop_channel, Cell, CellOptions, CellType};
use crate::sync::{self, ACK_LEN, EXTRA_ACK_LEN};
use crate::time::{ticks_to_us, Schedule, SlotTimer, Tick, TICK_TO_US_DEN, TICK_TO_US_NUM};

/// What the current slot does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SlotDecision {
    /// Sleep
    Off,
    /// Transmit the head packet of the selected neighbor
    Tx,
    /// Transmit cell with nothing queued
    TxIdle,
    /// Shared cell held back by the contention window
    TxBackoff,
    /// Listen
    Rx,
}

/// Dispatch points of the powercycle; each entry is resumed at a scheduled
/// radio-timer deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Idle,
    SlotStart,
    TxCcaOn,
    TxCcaCheck,
    TxPrepare,
    TxTransmit,
    TxAckOn,
    TxAckCheck,
    TxAckRead,
    RxListen,
    RxCheck,
    RxRead,
    RxAckSend,
}

/// Whether the resume loop keeps running steps inline or parks until the
/// next timer wake-up
enum Flow {
    Continue,
    Yield,
}

/// Persistent powercycle state.
///
/// `timeslot`, `start` and the drift accumulators survive across slots;
/// everything else is per-slot scratch reset by `clear_slot`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Powercycle {
    pub(crate) step: Step,
    pub(crate) timeslot: u16,
    /// Anchor time of the current slot
    pub(crate) start: Tick,

    /// Sum of observed drifts since the last slotframe boundary, us
    pub(crate) drift_acc_us: i32,
    pub(crate) drift_count: u16,

    pub(crate) decision: SlotDecision,
    pub(crate) cell: Option<Cell>,
    pub(crate) neighbor: Option<usize>,
    pub(crate) outcome: MacStatus,

    pub(crate) tx_seqno: u8,
    pub(crate) tx_broadcast: bool,
    pub(crate) tx_len: usize,
    /// Offset from `start` at which the data frame ends, ticks
    pub(crate) data_end: u32,

    pub(crate) need_ack: bool,
    pub(crate) ack_frame: [u8; ACK_LEN + EXTRA_ACK_LEN],
    pub(crate) rx_len: usize,
    pub(crate) rx_end: Tick,
    pub(crate) last_drift_us: i32,
}

impl Powercycle {
    pub(crate) fn new() -> Self {
        Self {
            step: Step::Idle,
            timeslot: 0,
            start: Tick(0),
            drift_acc_us: 0,
            drift_count: 0,
            decision: SlotDecision::Off,
            cell: None,
            neighbor: None,
            outcome: MacStatus::Deferred,
            tx_seqno: 0,
            tx_broadcast: false,
            tx_len: 0,
            data_end: 0,
            need_ack: false,
            ack_frame: [0u8; ACK_LEN + EXTRA_ACK_LEN],
            rx_len: 0,
            rx_end: Tick(0),
            last_drift_us: 0,
        }
    }

    fn clear_slot(&mut self) {
        self.decision = SlotDecision::Off;
        self.cell = None;
        self.neighbor = None;
        self.outcome = MacStatus::Deferred;
        self.tx_seqno = 0;
        self.tx_broadcast = false;
        self.tx_len = 0;
        self.data_end = 0;
        self.need_ack = false;
        self.rx_len = 0;
        self.last_drift_us = 0;
    }
}

/// Slotframe-boundary clock correction: the accumulated drift averaged over
/// its samples, converted us -> ticks with round-half-away-from-zero
pub(crate) fn drift_correction_ticks(acc_us: i32, count: u16) -> i32 {
    let num = acc_us * TICK_TO_US_DEN;
    let denom = TICK_TO_US_NUM * count as i32;

    if num >= 0 {
        (num + denom / 2) / denom
    } else {
        (num - denom / 2) / denom
    }
}

impl<R, T, G, F> TschMac<R, T, G, F>
where
    R: Radio,
    T: SlotTimer,
    G: RngCore,
    F: Framer,
{
    /// Run the powercycle from its current step to the next suspension
    /// point.
    ///
    /// The platform calls this when the deadline armed through
    /// [`SlotTimer::schedule_at`] fires, and may also call it early when a
    /// radio interrupt completes the awaited event; a parked step whose
    /// deadline has already passed simply runs immediately. Errors never
    /// abort the slotframe: radio failures fold into the transmission
    /// outcome or end the slot.
    pub fn resume(&mut self) {
        loop {
            let flow = match self.pc.step {
                Step::Idle => return,
                Step::SlotStart => self.slot_start(),
                Step::TxCcaOn => self.tx_cca_on(),
                Step::TxCcaCheck => self.tx_cca_check(),
                Step::TxPrepare => self.tx_prepare(),
                Step::TxTransmit => self.tx_transmit(),
                Step::TxAckOn => self.tx_ack_on(),
                Step::TxAckCheck => self.tx_ack_check(),
                Step::TxAckRead => self.tx_ack_read(),
                Step::RxListen => self.rx_listen(),
                Step::RxCheck => self.rx_check(),
                Step::RxRead => self.rx_read(),
                Step::RxAckSend => self.rx_ack_send(),
            };

            if let Flow::Yield = flow {
                return;
            }
        }
    }

    /// Park the next step and arm its deadline. A deadline that already
    /// slipped past runs inline instead.
    fn yield_until(&mut self, deadline: Tick, next: Step) -> Flow {
        self.pc.step = next;

        match self.timer.schedule_at(deadline) {
            Schedule::Ok => Flow::Yield,
            Schedule::Missed => {
                trace!("intra-slot deadline slipped, running {:?} late", next);
                Flow::Continue
            }
            Schedule::HardwareError => {
                self.desync();
                Flow::Yield
            }
        }
    }

    fn desync(&mut self) {
        error!("slot timer failure, stopping powercycle");

        self.state.is_sync = false;
        self.pc.step = Step::Idle;
        let _ = self.radio.off();
    }

    fn slot_start(&mut self) -> Flow {
        if !self.state.is_sync {
            self.pc.step = Step::Idle;
            return Flow::Yield;
        }

        self.state.captured_time = self.timer.now();
        if let Err(e) = self.radio.sfd_sync() {
            warn!("sfd re-sync failed: {:?}", e);
        }

        let start = self.pc.start;
        self.pc.clear_slot();

        let cell = match self.slotframe.get_cell(self.pc.timeslot) {
            Some(c) if !self.neighbors.is_busy() => *c,
            Some(_) => {
                trace!("queues busy, treating slot as off");
                return self.end_of_slot();
            }
            None => return self.end_of_slot(),
        };
        self.pc.cell = Some(cell);

        let channel = hop_channel(cell.channel_offset, self.state.asn);
        if let Err(e) = self.radio.set_channel(channel) {
            warn!("channel hop failed: {:?}", e);
            return self.end_of_slot();
        }

        // TX selection: the cell peer's head packet, or for shared broadcast
        // cells with no broadcast traffic, any backlogged neighbor
        let mut pending: Option<usize> = None;
        if cell.options.contains(CellOptions::TX) && cell.cell_type != CellType::Advertising {
            if let Some(i) = self.neighbors.index_of(&cell.peer) {
                let backlogged = match self.neighbors.at(i) {
                    Some(q) => q.head().is_some(),
                    None => false,
                };
                if backlogged {
                    pending = Some(i);
                }
            }

            if pending.is_none()
                && cell.peer.is_null()
                && cell.options.contains(CellOptions::SHARED)
            {
                pending = self.neighbors.next_pending();
            }
        }

        let mut decision = if cell.options.contains(CellOptions::TX) {
            match pending {
                Some(i) => {
                    let mut d = SlotDecision::Tx;

                    if cell.options.contains(CellOptions::SHARED) {
                        if let Some(q) = self.neighbors.at_mut(i) {
                            if q.bw > 0 {
                                q.bw -= 1;
                                d = SlotDecision::TxBackoff;
                            }
                        }
                    }

                    d
                }
                None => SlotDecision::TxIdle,
            }
        } else {
            SlotDecision::Off
        };

        if decision != SlotDecision::Tx && cell.options.contains(CellOptions::RX) {
            decision = SlotDecision::Rx;
        }

        trace!(
            "slot {} asn {} ch {} -> {:?}",
            self.pc.timeslot,
            self.state.asn,
            channel,
            decision
        );

        self.pc.decision = decision;
        self.pc.neighbor = pending;

        let t = self.config.timing.clone();
        match decision {
            SlotDecision::Tx => {
                if self.config.cca_enabled {
                    self.yield_until(start + t.cca_offset, Step::TxCcaOn)
                } else {
                    self.yield_until(start + (t.tx_offset - t.delay_tx), Step::TxPrepare)
                }
            }
            SlotDecision::Rx => self.yield_until(start + t.rx_offset, Step::RxListen),
            _ => self.end_of_slot(),
        }
    }

    fn tx_cca_on(&mut self) -> Flow {
        let t = self.config.timing.clone();

        if let Err(e) = self.radio.on() {
            warn!("radio on failed: {:?}", e);
            self.pc.outcome = MacStatus::Error;
            return self.finish_tx();
        }

        self.yield_until(self.pc.start + (t.cca_offset + t.cca), Step::TxCcaCheck)
    }

    fn tx_cca_check(&mut self) -> Flow {
        let t = self.config.timing.clone();

        match self.radio.channel_clear() {
            Ok(true) => {
                self.yield_until(self.pc.start + (t.tx_offset - t.delay_tx), Step::TxPrepare)
            }
            Ok(false) => {
                debug!("cca busy in slot {}", self.pc.timeslot);
                self.pc.outcome = MacStatus::Collision;
                self.finish_tx()
            }
            Err(e) => {
                warn!("cca failed: {:?}", e);
                self.pc.outcome = MacStatus::Error;
                self.finish_tx()
            }
        }
    }

    fn tx_prepare(&mut self) -> Flow {
        let t = self.config.timing.clone();

        let ni = match self.pc.neighbor {
            Some(i) => i,
            None => return self.end_of_slot(),
        };

        let meta = match self.neighbors.at(ni) {
            Some(q) => q
                .head()
                .map(|p| (p.seqno(), p.dest.is_null(), p.frame().len())),
            None => None,
        };
        let (seqno, broadcast, len) = match meta {
            Some(m) => m,
            None => return self.end_of_slot(),
        };

        self.pc.tx_seqno = seqno;
        self.pc.tx_broadcast = broadcast;
        self.pc.tx_len = len;

        if !self.config.cca_enabled {
            if let Err(e) = self.radio.on() {
                warn!("radio on failed: {:?}", e);
                self.pc.outcome = MacStatus::Error;
                return self.finish_tx();
            }
        }

        let mut failed = false;
        if let Some(q) = self.neighbors.at(ni) {
            if let Some(p) = q.head() {
                if let Err(e) = self.radio.prepare(p.frame()) {
                    warn!("tx prepare failed: {:?}", e);
                    failed = true;
                }
            }
        }
        if failed {
            self.pc.outcome = MacStatus::Error;
            return self.finish_tx();
        }

        self.yield_until(self.pc.start + t.tx_offset, Step::TxTransmit)
    }

    fn tx_transmit(&mut self) -> Flow {
        let t = self.config.timing.clone();

        let res = self.radio.transmit(self.pc.tx_len);
        self.pc.data_end = t.tx_offset + t.packet_duration(self.pc.tx_len);

        match res {
            Ok(TxResult::Ok) => {
                if self.pc.tx_broadcast {
                    self.pc.outcome = MacStatus::Ok;
                    self.finish_tx()
                } else {
                    let off = self.pc.data_end + t.tx_ack_delay - t.short_gt - t.delay_rx;
                    self.yield_until(self.pc.start + off, Step::TxAckOn)
                }
            }
            Ok(TxResult::Collision) => {
                self.pc.outcome = MacStatus::Collision;
                self.finish_tx()
            }
            Ok(TxResult::NoAck) => {
                self.pc.outcome = MacStatus::NoAck;
                self.finish_tx()
            }
            Ok(TxResult::Error) => {
                self.pc.outcome = MacStatus::Error;
                self.finish_tx()
            }
            Err(e) => {
                warn!("transmit failed: {:?}", e);
                self.pc.outcome = MacStatus::Error;
                self.finish_tx()
            }
        }
    }

    fn tx_ack_on(&mut self) -> Flow {
        let t = self.config.timing.clone();

        if let Err(e) = self.radio.on() {
            warn!("radio on failed: {:?}", e);
            self.pc.outcome = MacStatus::Error;
            return self.finish_tx();
        }

        let off = self.pc.data_end + t.tx_ack_delay + t.short_gt;
        self.yield_until(self.pc.start + off, Step::TxAckCheck)
    }

    fn tx_ack_check(&mut self) -> Flow {
        let t = self.config.timing.clone();

        let receiving = match self.radio.receiving_packet() {
            Ok(r) => r,
            Err(e) => {
                warn!("ack detect failed: {:?}", e);
                self.pc.outcome = MacStatus::Error;
                return self.finish_tx();
            }
        };
        let pending = match self.radio.pending_packet() {
            Ok(p) => p,
            Err(e) => {
                warn!("ack detect failed: {:?}", e);
                self.pc.outcome = MacStatus::Error;
                return self.finish_tx();
            }
        };

        if !receiving && !pending {
            self.pc.outcome = MacStatus::NoAck;
            return self.finish_tx();
        }

        let off = self.pc.data_end + t.tx_ack_delay + t.short_gt + t.wd_ack_duration;
        self.yield_until(self.pc.start + off, Step::TxAckRead)
    }

    fn tx_ack_read(&mut self) -> Flow {
        let n = match self.radio.read_ack(&mut self.rxbuf) {
            Ok(n) => n,
            Err(e) => {
                warn!("ack read failed: {:?}", e);
                0
            }
        };

        match sync::parse_ack(&self.rxbuf[..n], self.pc.tx_seqno) {
            Some(info) => {
                self.pc.outcome = MacStatus::Ok;

                if let Some(ie) = info.sync {
                    let is_time_source = match self.pc.neighbor {
                        Some(i) => match self.neighbors.at(i) {
                            Some(q) => q.time_source,
                            None => false,
                        },
                        None => false,
                    };

                    if is_time_source {
                        self.pc.drift_acc_us += ie.drift_us;
                        self.pc.drift_count += 1;
                        debug!("time source reports {} us drift", ie.drift_us);
                    }

                    if ie.nack {
                        self.pc.outcome = MacStatus::NoAckWithSync;
                    }
                }
            }
            None => {
                self.pc.outcome = MacStatus::NoAck;
            }
        }

        self.finish_tx()
    }

    /// Apply the TX outcome: attempt accounting, queue/backoff updates, and
    /// the completion event once the packet leaves the MAC
    fn finish_tx(&mut self) -> Flow {
        let outcome = self.pc.outcome;

        let shared = match self.pc.cell {
            Some(c) => c.options.contains(CellOptions::SHARED),
            None => false,
        };
        let unicast = !self.pc.tx_broadcast;

        let ni = match self.pc.neighbor {
            Some(i) => i,
            None => return self.end_of_slot(),
        };

        let mut event = None;
        if let Some(q) = self.neighbors.at_mut(ni) {
            if let Some(p) = q.head_mut() {
                p.transmissions = p.transmissions.saturating_add(1);
            }

            if outcome == MacStatus::Ok {
                if let Some(mut p) = q.note_tx_ok() {
                    p.status = MacStatus::Ok;
                    event = Some(SentEvent {
                        dest: p.dest,
                        seqno: p.seqno,
                        status: p.status,
                        transmissions: p.transmissions,
                    });
                }
            } else {
                let spent = match q.head() {
                    Some(p) => p.transmissions >= MAX_RETRIES,
                    None => false,
                };

                if spent {
                    if let Some(mut p) = q.pop() {
                        p.status = outcome;
                        event = Some(SentEvent {
                            dest: p.dest,
                            seqno: p.seqno,
                            status: p.status,
                            transmissions: p.transmissions,
                        });
                    }
                    q.reset_backoff();
                }

                if shared && unicast {
                    q.update_backoff(&mut self.rng);
                }
            }
        }

        if let Some(ev) = event {
            debug!(
                "tx done seq {} to {:?}: {} after {} attempts",
                ev.seqno, ev.dest, ev.status, ev.transmissions
            );

            if self.tx_done.enqueue(ev).is_err() {
                warn!("completion queue full, dropping event");
            }
        }

        self.end_of_slot()
    }

    fn rx_listen(&mut self) -> Flow {
        let t = self.config.timing.clone();

        if let Err(e) = self.radio.on() {
            warn!("radio on failed: {:?}", e);
            return self.end_of_slot();
        }

        self.yield_until(self.pc.start + (t.tx_offset + t.long_gt), Step::RxCheck)
    }

    fn rx_check(&mut self) -> Flow {
        let t = self.config.timing.clone();

        let clear = match self.radio.channel_clear() {
            Ok(c) => c,
            Err(e) => {
                warn!("rx activity probe failed: {:?}", e);
                return self.end_of_slot();
            }
        };
        let receiving = match self.radio.receiving_packet() {
            Ok(r) => r,
            Err(e) => {
                warn!("rx activity probe failed: {:?}", e);
                return self.end_of_slot();
            }
        };
        let pending = match self.radio.pending_packet() {
            Ok(p) => p,
            Err(e) => {
                warn!("rx activity probe failed: {:?}", e);
                return self.end_of_slot();
            }
        };

        // Nothing on the air inside the guard time: back to sleep
        if clear && !receiving && !pending {
            return self.end_of_slot();
        }

        let off = t.tx_offset + t.long_gt + t.wd_data_duration;
        self.yield_until(self.pc.start + off, Step::RxRead)
    }

    fn rx_read(&mut self) -> Flow {
        let t = self.config.timing.clone();

        match self.radio.pending_packet() {
            Ok(true) => (),
            Ok(false) => return self.end_of_slot(),
            Err(e) => {
                warn!("rx poll failed: {:?}", e);
                return self.end_of_slot();
            }
        }

        let n = match self.radio.read(&mut self.rxbuf) {
            Ok(n) if n > 0 => n,
            Ok(_) => return self.end_of_slot(),
            Err(e) => {
                warn!("rx read failed: {:?}", e);
                return self.end_of_slot();
            }
        };
        self.pc.rx_len = n;
        self.pc.rx_end = self.radio.rx_end_time();

        let (src, seqno, ack_request, dst) = match self.framer.parse(&self.rxbuf[..n]) {
            Ok(f) => (f.src, f.seqno, f.ack_request, f.dst),
            Err(_) => {
                debug!("undecodable frame, dropped");
                return self.end_of_slot();
            }
        };

        // Unicast to us with AR set: measure the sender's offset against our
        // slot template and stage the soft-ACK carrying it
        if ack_request && dst == self.config.address {
            let expected = self.pc.start + t.tx_offset;
            let drift_ticks = expected.delta(self.pc.rx_end);

            self.pc.last_drift_us = ticks_to_us(drift_ticks);
            self.pc.ack_frame = sync::make_sync_ack(seqno, drift_ticks, false);
            self.pc.need_ack = true;
        }

        self.input_pending(n);

        // Our own measurement mirrors the one we just reported to the sender
        if self.pc.last_drift_us != 0 {
            let from_time_source = match self.neighbors.get(&src) {
                Some(q) => q.time_source,
                None => false,
            };

            if from_time_source {
                self.pc.drift_acc_us -= self.pc.last_drift_us;
                self.pc.drift_count += 1;
            }
        }

        if self.pc.need_ack {
            let deadline = self.pc.rx_end + (t.tx_ack_delay - t.delay_tx);
            self.yield_until(deadline, Step::RxAckSend)
        } else {
            self.end_of_slot()
        }
    }

    fn rx_ack_send(&mut self) -> Flow {
        let ack = self.pc.ack_frame;

        if let Err(e) = self.radio.send_ack(&ack) {
            warn!("soft-ack tx failed: {:?}", e);
        }

        self.end_of_slot()
    }

    /// Close the slot: power the radio per policy, advance ASN and the slot
    /// anchor, apply the averaged drift correction at slotframe boundaries,
    /// and arm the next wake-up. A missed deadline skips whole slots until
    /// the scheduler accepts one.
    fn end_of_slot(&mut self) -> Flow {
        let power = if self.config.keep_radio_on {
            self.radio.on()
        } else {
            self.radio.off()
        };
        if let Err(e) = power {
            warn!("radio power failed: {:?}", e);
        }

        loop {
            let next = self.slotframe.next_on_slot(self.pc.timeslot);
            let dt = self.slotframe.distance(self.pc.timeslot, next);
            let mut duration = dt as u32 * self.config.timing.slot_duration;

            // Crossing the slotframe boundary: fold the averaged drift into
            // this period and restart the accumulators
            let crossing = next <= self.pc.timeslot;
            if crossing && self.pc.drift_count > 0 {
                let correction = drift_correction_ticks(self.pc.drift_acc_us, self.pc.drift_count);
                duration = (duration as i64 + correction as i64) as u32;

                debug!(
                    "applying {} ticks drift correction ({} us over {} samples)",
                    correction, self.pc.drift_acc_us, self.pc.drift_count
                );

                self.pc.drift_acc_us = 0;
                self.pc.drift_count = 0;
            }

            self.state.asn += dt as u64;
            self.pc.timeslot = next;
            self.pc.start = self.pc.start + duration;
            self.pc.step = Step::SlotStart;

            match self.timer.schedule_at(self.pc.start) {
                Schedule::Ok => return Flow::Yield,
                Schedule::Missed => {
                    warn!("missed slot deadline, skipping to timeslot {}", next);
                    continue;
                }
                Schedule::HardwareError => {
                    self.desync();
                    return Flow::Yield;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::MacConfig;
    use crate::driver::TschMac;
    use crate::framer::{FrameMeta, Framer, Ieee802154Framer};
    use crate::neighbor::{MAX_BE, MIN_BE};
    use crate::radio::mock::MockRadio;
    use crate::schedule::{CellOptions, CellType, Slotframe};
    use crate::time::mock::MockTimer;
    use crate::Addr;

    use rand::rngs::mock::StepRng;

    const OUR_ADDR: Addr = Addr([0x11, 0, 0, 0, 0, 0, 0, 0]);
    const PEER: Addr = Addr([0x22, 0, 0, 0, 0, 0, 0, 0]);
    const SLOTFRAME_LEN: u16 = 101;

    type TestMac = TschMac<MockRadio, MockTimer, StepRng, Ieee802154Framer>;

    fn mac_with(sf: Slotframe, rng: StepRng) -> TestMac {
        let _ = simplelog::SimpleLogger::init(
            log::LevelFilter::Trace,
            simplelog::Config::default(),
        );

        let config = MacConfig {
            address: OUR_ADDR,
            ..Default::default()
        };

        let mut mac = TschMac::new(
            config,
            sf,
            MockRadio::new(),
            MockTimer::new(),
            rng,
            Ieee802154Framer::new(0x0100),
        );

        mac.on().unwrap();
        mac
    }

    fn tx_slotframe(options: CellOptions, peer: Addr) -> Slotframe {
        let mut sf = Slotframe::new(0, SLOTFRAME_LEN);
        sf.add_cell(0, options, CellType::Normal, peer).unwrap();
        sf
    }

    /// Fire deadlines until the powercycle parks at the next slot boundary
    fn run_one_slot(mac: &mut TestMac) {
        loop {
            mac.timer.advance_to_deadline();
            mac.resume();

            if mac.pc.step == Step::SlotStart || mac.pc.step == Step::Idle {
                break;
            }
        }
    }

    #[test]
    fn unicast_ack_success() {
        let mut mac = mac_with(
            tx_slotframe(CellOptions::TX, PEER),
            StepRng::new(0, 0),
        );

        let seq = mac.send(PEER, &[1, 2, 3]).unwrap();
        mac.radio.load_ack(&[0x02, 0x00, seq]);

        run_one_slot(&mut mac);

        assert_eq!(mac.radio.sent.len(), 1);
        assert_eq!(
            mac.sent(),
            Some(crate::packet::SentEvent {
                dest: PEER,
                seqno: seq,
                status: MacStatus::Ok,
                transmissions: 1,
            })
        );

        let q = mac.neighbors.get(&PEER).unwrap();
        assert!(q.is_empty());
        assert_eq!(q.be, MIN_BE);
        assert_eq!(q.bw, 0);

        // One serviced slot advanced the ASN by the whole frame
        assert_eq!(mac.state.asn, SLOTFRAME_LEN as u64);
    }

    #[test]
    fn noack_retries_then_drops() {
        let mut mac = mac_with(
            tx_slotframe(CellOptions::TX, PEER),
            StepRng::new(0, 0),
        );

        let seq = mac.send(PEER, &[9]).unwrap();

        for n in 1..=4u8 {
            assert!(mac.sent().is_none());
            run_one_slot(&mut mac);
            assert_eq!(mac.radio.sent.len(), n as usize);
        }

        assert_eq!(
            mac.sent(),
            Some(crate::packet::SentEvent {
                dest: PEER,
                seqno: seq,
                status: MacStatus::NoAck,
                transmissions: 4,
            })
        );

        let q = mac.neighbors.get(&PEER).unwrap();
        assert!(q.is_empty());
        assert_eq!(q.be, MIN_BE);

        // Dedicated cell: no further transmissions attempted
        run_one_slot(&mut mac);
        assert_eq!(mac.radio.sent.len(), 4);
    }

    #[test]
    fn shared_slot_backoff() {
        // Backoff draws always come up 1
        let mut mac = mac_with(
            tx_slotframe(CellOptions::TX | CellOptions::SHARED, PEER),
            StepRng::new(1, 0),
        );

        mac.send(PEER, &[7]).unwrap();

        // First attempt goes out and fails: window drawn from 2^be
        run_one_slot(&mut mac);
        assert_eq!(mac.radio.sent.len(), 1);

        let q = mac.neighbors.get(&PEER).unwrap();
        assert_eq!(q.be, MIN_BE + 1);
        assert_eq!(q.bw, 1);

        // Window counts down without transmitting
        run_one_slot(&mut mac);
        assert_eq!(mac.pc.decision, SlotDecision::TxBackoff);
        assert_eq!(mac.radio.sent.len(), 1);
        assert_eq!(mac.neighbors.get(&PEER).unwrap().bw, 0);

        // Window expired: next shared slot transmits again
        run_one_slot(&mut mac);
        assert_eq!(mac.pc.decision, SlotDecision::Tx);
        assert_eq!(mac.radio.sent.len(), 2);

        let q = mac.neighbors.get(&PEER).unwrap();
        assert!(q.be <= MAX_BE);
        assert!((q.bw as u16) < (1 << q.be));
    }

    #[test]
    fn broadcast_tx_completes_without_ack() {
        let mut mac = mac_with(
            tx_slotframe(CellOptions::TX, Addr::NULL),
            StepRng::new(0, 0),
        );

        let seq = mac.send(Addr::NULL, &[5, 5]).unwrap();

        run_one_slot(&mut mac);

        assert_eq!(mac.radio.sent.len(), 1);
        let ev = mac.sent().unwrap();
        assert_eq!(ev.status, MacStatus::Ok);
        assert_eq!(ev.seqno, seq);
        assert_eq!(ev.transmissions, 1);

        let q = mac.neighbors.get(&Addr::NULL).unwrap();
        assert_eq!(q.be, MIN_BE);
        assert_eq!(q.bw, 0);

        // No ACK listen happened: the mock radio was never handed an ACK
        assert!(mac.radio.ack_reply.is_none());
    }

    #[test]
    fn shared_broadcast_cell_serves_unicast_round_robin() {
        let mut sf = Slotframe::new(0, SLOTFRAME_LEN);
        sf.add_cell(
            0,
            CellOptions::TX | CellOptions::SHARED,
            CellType::Normal,
            Addr::NULL,
        )
        .unwrap();

        let mut mac = mac_with(sf, StepRng::new(0, 0));

        let sa = mac.send(PEER, &[1]).unwrap();
        mac.radio.load_ack(&[0x02, 0x00, sa]);

        run_one_slot(&mut mac);

        assert_eq!(mac.radio.sent.len(), 1);
        assert_eq!(mac.sent().unwrap().status, MacStatus::Ok);
    }

    #[test]
    fn drift_report_applied_at_slotframe_boundary() {
        let mut mac = mac_with(
            tx_slotframe(CellOptions::TX, PEER),
            StepRng::new(0, 0),
        );
        mac.set_time_source(PEER, true).unwrap();

        let seq = mac.send(PEER, &[1]).unwrap();
        // ACK carrying a +305 us drift report (10 ticks)
        mac.radio.load_ack(&sync::make_sync_ack(seq, 10, false));

        let anchor = mac.pc.start;

        // Accumulation is visible right after the ACK is read
        mac.timer.advance_to_deadline();
        mac.resume();
        while mac.pc.step != Step::SlotStart {
            mac.timer.advance_to_deadline();
            mac.resume();
        }

        assert_eq!(mac.sent().unwrap().status, MacStatus::Ok);
        assert_eq!(mac.pc.drift_acc_us, 0); // reset at the boundary
        assert_eq!(mac.pc.drift_count, 0);

        // Next anchor stretched by round(305 * 100 / 3051) = 10 ticks
        let expected = SLOTFRAME_LEN as i32 * 492 + 10;
        assert_eq!(mac.pc.start.delta(anchor), expected);
    }

    #[test]
    fn nack_flag_surfaces_with_sync_status() {
        let mut mac = mac_with(
            tx_slotframe(CellOptions::TX, PEER),
            StepRng::new(0, 0),
        );
        mac.set_time_source(PEER, true).unwrap();

        let seq = mac.send(PEER, &[1]).unwrap();
        mac.radio.load_ack(&sync::make_sync_ack(seq, 10, true));

        run_one_slot(&mut mac);

        // NACK follows the failure path but the drift was still credited
        assert!(mac.sent().is_none());
        let q = mac.neighbors.get(&PEER).unwrap();
        assert_eq!(q.head().unwrap().transmissions(), 1);
        assert_eq!(mac.pc.drift_acc_us, 0); // consumed at the boundary
    }

    #[test]
    fn rx_slot_delivers_and_acks() {
        let mut sf = Slotframe::new(0, SLOTFRAME_LEN);
        sf.add_cell(0, CellOptions::RX, CellType::Normal, PEER).unwrap();

        let mut mac = mac_with(sf, StepRng::new(0, 0));
        mac.set_time_source(PEER, true).unwrap();

        let framer = Ieee802154Framer::new(0x0100);
        let meta = FrameMeta {
            src: PEER,
            dst: OUR_ADDR,
            seqno: 7,
            ack_request: true,
        };
        let mut frame = [0u8; 127];
        let n = framer.create(&meta, &[0xaa, 0xbb], &mut frame).unwrap();

        // Sender's SFD lands 5 ticks before our expected TX instant
        let rx_end = mac.pc.start + (mac.config.timing.tx_offset - 5);
        mac.radio.load_rx(&frame[..n], rx_end);
        mac.radio.receiving = true;

        run_one_slot(&mut mac);

        // Payload came up
        let mut buf = [0u8; 127];
        let (len, info) = mac.receive(&mut buf).unwrap();
        assert_eq!(&buf[..len], &[0xaa, 0xbb]);
        assert_eq!(info.source, PEER);

        // Soft-ACK reported +5 ticks (152 us) of sender drift
        assert_eq!(mac.radio.acks_sent.len(), 1);
        assert_eq!(mac.radio.acks_sent[0], sync::make_sync_ack(7, 5, false).to_vec());
    }

    #[test]
    fn rx_drift_is_negated_for_time_sources() {
        let mut sf = Slotframe::new(0, SLOTFRAME_LEN);
        sf.add_cell(0, CellOptions::RX, CellType::Normal, PEER).unwrap();
        // A second cell so the boundary is not crossed after the first slot
        sf.add_cell(0, CellOptions::RX, CellType::Normal, PEER).unwrap();

        let mut mac = mac_with(sf, StepRng::new(0, 0));
        mac.set_time_source(PEER, true).unwrap();

        let framer = Ieee802154Framer::new(0x0100);
        let meta = FrameMeta {
            src: PEER,
            dst: OUR_ADDR,
            seqno: 9,
            ack_request: true,
        };
        let mut frame = [0u8; 127];
        let n = framer.create(&meta, &[1], &mut frame).unwrap();

        let rx_end = mac.pc.start + (mac.config.timing.tx_offset - 10);
        mac.radio.load_rx(&frame[..n], rx_end);
        mac.radio.receiving = true;

        run_one_slot(&mut mac);

        // Receiver-side drift is the negation of what the ACK reported
        assert_eq!(mac.pc.drift_acc_us, -305);
        assert_eq!(mac.pc.drift_count, 1);
    }

    #[test]
    fn quiet_rx_slot_sleeps() {
        let mut sf = Slotframe::new(0, SLOTFRAME_LEN);
        sf.add_cell(0, CellOptions::RX, CellType::Normal, PEER).unwrap();

        let mut mac = mac_with(sf, StepRng::new(0, 0));

        run_one_slot(&mut mac);

        assert!(!mac.radio.on);
        assert!(mac.receive(&mut [0u8; 127]).is_none());
        assert_eq!(mac.state.asn, SLOTFRAME_LEN as u64);
    }

    #[test]
    fn busy_queues_turn_slot_off() {
        let mut mac = mac_with(
            tx_slotframe(CellOptions::TX, PEER),
            StepRng::new(0, 0),
        );

        mac.send(PEER, &[1]).unwrap();
        mac.neighbors.set_busy(true);

        run_one_slot(&mut mac);

        assert_eq!(mac.pc.decision, SlotDecision::Off);
        assert_eq!(mac.radio.sent.len(), 0);

        mac.neighbors.set_busy(false);
        run_one_slot(&mut mac);
        assert_eq!(mac.radio.sent.len(), 1);
    }

    #[test]
    fn advertising_cell_listens_instead_of_sending_data() {
        let mut mac = mac_with(Slotframe::minimal(SLOTFRAME_LEN), StepRng::new(0, 0));

        mac.send(PEER, &[1]).unwrap();

        run_one_slot(&mut mac);

        // Data never goes out in an advertising cell; the slot listened
        assert_eq!(mac.radio.sent.len(), 0);
        assert_eq!(mac.pc.decision, SlotDecision::Rx);
    }

    #[test]
    fn missed_deadline_skips_whole_slots() {
        let mut sf = Slotframe::new(0, 3);
        sf.add_cell(0, CellOptions::RX, CellType::Normal, PEER).unwrap();
        sf.add_cell(0, CellOptions::RX, CellType::Normal, PEER).unwrap();

        let mut mac = mac_with(sf, StepRng::new(0, 0));

        // Let the first slot run, then stall past the second slot's anchor
        run_one_slot(&mut mac);
        assert_eq!(mac.state.asn, 1);
        assert_eq!(mac.pc.timeslot, 1);

        let d = mac.timer.advance_to_deadline();
        mac.timer.set(d + 2 * 492);
        mac.resume();

        // The stalled slot was still serviced, the following one skipped:
        // timeslot advanced past it and the ASN accounts for every slot
        assert_eq!(mac.pc.timeslot, 1);
        assert_eq!(mac.state.asn, 1 + 2 + 1);
        assert!(mac.timer.deadline.is_some());
    }

    #[test]
    fn tx_idle_slot_does_nothing() {
        let mut mac = mac_with(
            tx_slotframe(CellOptions::TX, PEER),
            StepRng::new(0, 0),
        );

        run_one_slot(&mut mac);

        assert_eq!(mac.pc.decision, SlotDecision::TxIdle);
        assert_eq!(mac.radio.sent.len(), 0);
    }

    #[test]
    fn drift_rounding() {
        assert_eq!(drift_correction_ticks(305, 1), 10);
        assert_eq!(drift_correction_ticks(-305, 1), -10);
        assert_eq!(drift_correction_ticks(610, 2), 10);
        assert_eq!(drift_correction_ticks(0, 1), 0);
        // Truncation would give 9 for a single +290 us sample
        assert_eq!(drift_correction_ticks(290, 1), 10);
    }
}
