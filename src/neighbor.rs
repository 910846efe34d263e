//! Per-neighbor transmit queues and CSMA backoff state.

use heapless::Vec;
use log::{debug, trace};
use rand_core::RngCore;

use crate::packet::TxPacket;
use crate::Addr;

/// Per-neighbor ring capacity; must be a power of two. One slot stays
/// reserved, so up to `QUEUE_SIZE - 1` packets queue per neighbor.
pub const QUEUE_SIZE: usize = 8;
const RING_MASK: usize = QUEUE_SIZE - 1;

/// Neighbor table capacity
pub const MAX_NEIGHBORS: usize = 8;

/// CSMA backoff exponent bounds
pub const MIN_BE: u8 = 1;
pub const MAX_BE: u8 = 4;

/// Transmission attempts per packet before it is dropped
pub const MAX_RETRIES: u8 = 4;

/// Enqueue failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// Ring full for this neighbor
    Full,
    /// Neighbor table exhausted
    NoMemory,
}

/// Outbound queue and contention state for one neighbor
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborQueue {
    pub addr: Addr,

    /// ACK drift reports from this neighbor feed clock correction
    pub time_source: bool,

    /// Backoff exponent
    pub(crate) be: u8,
    /// Backoff window counter, in shared slots
    pub(crate) bw: u8,

    ring: [Option<TxPacket>; QUEUE_SIZE],
    put: usize,
    get: usize,
}

impl NeighborQueue {
    pub fn new(addr: Addr) -> Self {
        const NONE: Option<TxPacket> = None;

        Self {
            addr,
            time_source: false,
            be: MIN_BE,
            bw: 0,
            ring: [NONE; QUEUE_SIZE],
            put: 0,
            get: 0,
        }
    }

    /// Number of queued packets
    pub fn occupancy(&self) -> usize {
        self.put.wrapping_sub(self.get) & RING_MASK
    }

    pub fn is_empty(&self) -> bool {
        self.occupancy() == 0
    }

    pub fn is_full(&self) -> bool {
        self.occupancy() == QUEUE_SIZE - 1
    }

    /// Append a packet, strict FIFO
    pub fn enqueue(&mut self, packet: TxPacket) -> Result<(), QueueError> {
        if self.is_full() {
            return Err(QueueError::Full);
        }

        self.ring[self.put] = Some(packet);
        self.put = (self.put + 1) & RING_MASK;

        Ok(())
    }

    /// Oldest queued packet
    pub fn head(&self) -> Option<&TxPacket> {
        self.ring[self.get].as_ref()
    }

    pub fn head_mut(&mut self) -> Option<&mut TxPacket> {
        self.ring[self.get].as_mut()
    }

    /// Remove and return the oldest queued packet
    pub fn pop(&mut self) -> Option<TxPacket> {
        let packet = self.ring[self.get].take()?;
        self.get = (self.get + 1) & RING_MASK;

        Some(packet)
    }

    pub(crate) fn reset_backoff(&mut self) {
        self.bw = 0;
        self.be = MIN_BE;
    }

    /// Successful transmission: pop the head, relax contention state
    pub(crate) fn note_tx_ok(&mut self) -> Option<TxPacket> {
        let packet = self.pop();

        if self.is_empty() {
            self.be = MIN_BE;
        }
        self.bw = 0;

        packet
    }

    /// Failed transmission on a shared cell: draw a new backoff window
    pub(crate) fn update_backoff<G: RngCore>(&mut self, rng: &mut G) {
        let window = 1u16 << self.be;

        self.bw = (rng.next_u32() as u16 & (window - 1)) as u8;
        self.be = (self.be + 1).min(MAX_BE);

        trace!("backoff for {:?}: bw {} be {}", self.addr, self.bw, self.be);
    }
}

/// All neighbor queues, keyed by link-layer address.
///
/// Carries the round-robin cursor used by shared broadcast slots and the
/// cooperative `busy` flag raised around queue mutations (the powercycle
/// treats the slot as OFF while it is up).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NeighborTable {
    queues: Vec<NeighborQueue, MAX_NEIGHBORS>,
    rr_cursor: usize,
    busy: bool,
}

impl NeighborTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index_of(&self, addr: &Addr) -> Option<usize> {
        self.queues.iter().position(|q| q.addr == *addr)
    }

    pub fn get(&self, addr: &Addr) -> Option<&NeighborQueue> {
        self.index_of(addr).map(move |i| &self.queues[i])
    }

    pub fn get_mut(&mut self, addr: &Addr) -> Option<&mut NeighborQueue> {
        let i = self.index_of(addr)?;
        Some(&mut self.queues[i])
    }

    pub fn at(&self, index: usize) -> Option<&NeighborQueue> {
        self.queues.get(index)
    }

    pub fn at_mut(&mut self, index: usize) -> Option<&mut NeighborQueue> {
        self.queues.get_mut(index)
    }

    /// Add a queue for `addr`, returning its index (existing or new)
    pub fn add(&mut self, addr: Addr) -> Result<usize, QueueError> {
        if let Some(i) = self.index_of(&addr) {
            return Ok(i);
        }

        self.queues
            .push(NeighborQueue::new(addr))
            .map_err(|_| QueueError::NoMemory)?;

        debug!("added neighbor queue for {:?}", addr);

        Ok(self.queues.len() - 1)
    }

    /// Drop the queue for `addr`, discarding any pending packets
    pub fn remove(&mut self, addr: &Addr) -> bool {
        match self.index_of(addr) {
            Some(i) => {
                self.queues.swap_remove(i);
                self.rr_cursor = 0;
                true
            }
            None => false,
        }
    }

    /// Enqueue a packet for `addr`, creating its queue on first use
    pub fn enqueue(&mut self, addr: Addr, packet: TxPacket) -> Result<(), QueueError> {
        let i = self.add(addr)?;
        self.queues[i].enqueue(packet)
    }

    /// Mark `addr` as a time source, creating its queue on first use
    pub fn set_time_source(&mut self, addr: Addr, time_source: bool) -> Result<(), QueueError> {
        let i = self.add(addr)?;
        self.queues[i].time_source = time_source;
        Ok(())
    }

    /// Next neighbor with pending traffic, served fairly.
    ///
    /// The cursor persists across calls so that every backlogged neighbor is
    /// visited within one full cycle of the table.
    pub fn next_pending(&mut self) -> Option<usize> {
        let len = self.queues.len();
        if len == 0 {
            return None;
        }

        for step in 1..=len {
            let i = (self.rr_cursor + step) % len;
            if !self.queues[i].is_empty() {
                self.rr_cursor = i;
                return Some(i);
            }
        }

        None
    }

    /// Raised while the main task mutates queues
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub(crate) fn set_busy(&mut self, busy: bool) {
        self.busy = busy;
    }
}
