
#![no_std]

#[cfg(test)]
extern crate std;

#[cfg(all(feature = "std", not(test)))]
extern crate std;

pub mod time;

pub mod config;

pub mod error;

pub mod radio;

pub mod framer;

pub mod sync;

pub mod packet;

pub mod neighbor;

pub mod schedule;

pub mod slot;

pub mod driver;

pub use crate::config::{MacConfig, SlotTiming};
pub use crate::driver::{MacState, NodeState, TschMac};
pub use crate::error::MacError;
pub use crate::packet::{MacStatus, RxInfo, SentEvent};
pub use crate::schedule::{Cell, CellOptions, CellType, Slotframe};
pub use crate::slot::SlotDecision;
pub use crate::time::Tick;

/// Link-layer address, an opaque 8-byte identifier.
///
/// The all-zero address is distinguished as [`Addr::NULL`] and stands for
/// broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Addr(pub [u8; 8]);

impl Addr {
    /// Broadcast / null address
    pub const NULL: Addr = Addr([0u8; 8]);

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    /// Build an address from a 64-bit EUI
    pub fn from_eui(eui: u64) -> Self {
        Addr(eui.to_le_bytes())
    }

    pub fn eui(&self) -> u64 {
        u64::from_le_bytes(self.0)
    }
}
