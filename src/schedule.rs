//! Slotframe and cell schedule model.
//!
//! A slotframe of `length` timeslots carries `on_size` populated cells; the
//! cell at index `i` is serviced in timeslot `i`, the remaining slots sleep.

use bitflags::bitflags;
use heapless::Vec;

use crate::Addr;

bitflags! {
    /// Cell option flags
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct CellOptions: u8 {
        const TX = 0b0001;
        const RX = 0b0010;
        const SHARED = 0b0100;
        const TIME_KEEPING = 0b1000;
    }
}

/// Cell class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CellType {
    Normal,
    /// Beacon slot; carries no unicast data traffic
    Advertising,
}

/// One slotframe entry
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cell {
    pub slot_offset: u16,
    pub channel_offset: u16,
    pub options: CellOptions,
    pub cell_type: CellType,
    /// Link peer; [`Addr::NULL`] for broadcast cells
    pub peer: Addr,
}

/// Maximum populated cells per slotframe
pub const MAX_CELLS: usize = 16;

/// A repeating cycle of timeslots
#[derive(Debug, Clone, PartialEq)]
pub struct Slotframe {
    pub handle: u16,
    /// Total timeslots in one period
    pub length: u16,
    cells: Vec<Cell, MAX_CELLS>,
}

impl Slotframe {
    pub fn new(handle: u16, length: u16) -> Self {
        Self {
            handle,
            length,
            cells: Vec::new(),
        }
    }

    /// The bootstrap schedule: a single shared advertising cell at (0, 0)
    pub fn minimal(length: u16) -> Self {
        let mut sf = Self::new(0, length);

        let _ = sf.add_cell(
            0,
            CellOptions::TX | CellOptions::RX | CellOptions::SHARED | CellOptions::TIME_KEEPING,
            CellType::Advertising,
            Addr::NULL,
        );

        sf
    }

    /// Append a cell; it occupies the next free timeslot index
    pub fn add_cell(
        &mut self,
        channel_offset: u16,
        options: CellOptions,
        cell_type: CellType,
        peer: Addr,
    ) -> Result<u16, ()> {
        let slot_offset = self.cells.len() as u16;

        self.cells
            .push(Cell {
                slot_offset,
                channel_offset,
                options,
                cell_type,
                peer,
            })
            .map_err(|_| ())?;

        Ok(slot_offset)
    }

    /// Number of populated (on) slots
    pub fn on_size(&self) -> u16 {
        self.cells.len() as u16
    }

    /// Cell for `slot`, if it is an on-slot
    pub fn get_cell(&self, slot: u16) -> Option<&Cell> {
        self.cells.get(slot as usize)
    }

    /// Index of the on-slot after `slot`, wrapping to 0 past the last
    pub fn next_on_slot(&self, slot: u16) -> u16 {
        if slot + 1 < self.on_size() {
            slot + 1
        } else {
            0
        }
    }

    /// Timeslot count from `slot` to `next`, across the frame boundary if
    /// `next` wrapped
    pub fn distance(&self, slot: u16, next: u16) -> u16 {
        if next > slot {
            next - slot
        } else {
            self.length - slot + next
        }
    }
}

/// Channel hopping: map a cell's channel offset and the current ASN onto the
/// 16-channel 2.4 GHz band (channels 11..=26)
pub fn hop_channel(channel_offset: u16, asn: u64) -> u8 {
    11 + ((channel_offset as u64 + asn) % 16) as u8
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cell_lookup_bounded_by_on_size() {
        let mut sf = Slotframe::new(0, 101);
        sf.add_cell(1, CellOptions::TX, CellType::Normal, Addr::from_eui(1))
            .unwrap();
        sf.add_cell(2, CellOptions::RX, CellType::Normal, Addr::from_eui(2))
            .unwrap();

        assert_eq!(sf.on_size(), 2);
        assert_eq!(sf.get_cell(0).unwrap().channel_offset, 1);
        assert_eq!(sf.get_cell(1).unwrap().channel_offset, 2);
        assert!(sf.get_cell(2).is_none());
        assert!(sf.get_cell(100).is_none());
    }

    #[test]
    fn next_on_slot_wraps() {
        let mut sf = Slotframe::new(0, 101);
        for n in 0..3 {
            sf.add_cell(n, CellOptions::TX, CellType::Normal, Addr::NULL)
                .unwrap();
        }

        assert_eq!(sf.next_on_slot(0), 1);
        assert_eq!(sf.next_on_slot(1), 2);
        assert_eq!(sf.next_on_slot(2), 0);

        assert_eq!(sf.distance(0, 1), 1);
        assert_eq!(sf.distance(2, 0), 99);
    }

    #[test]
    fn single_cell_spans_whole_frame() {
        let sf = Slotframe::minimal(101);

        assert_eq!(sf.next_on_slot(0), 0);
        assert_eq!(sf.distance(0, 0), 101);

        let cell = sf.get_cell(0).unwrap();
        assert!(cell.options.contains(CellOptions::SHARED));
        assert_eq!(cell.cell_type, CellType::Advertising);
        assert!(cell.peer.is_null());
    }

    #[test]
    fn hopping_is_deterministic_and_in_band() {
        for asn in 0..64u64 {
            for offset in 0..4u16 {
                let ch = hop_channel(offset, asn);

                assert!(ch >= 11 && ch <= 26);
                assert_eq!(ch, hop_channel(offset, asn));
            }
        }

        // Consecutive slotframe iterations visit different channels
        assert_ne!(hop_channel(0, 0), hop_channel(0, 101));
    }
}
