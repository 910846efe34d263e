
use crate::framer::FramerError;

/// MAC errors, generic over the radio driver error
#[derive(Debug, Clone, PartialEq)]
pub enum MacError<E> {
    /// Per-neighbor transmit ring is full
    QueueFull,

    /// Neighbor table (or another fixed allocation) is exhausted
    NoMemory,

    /// MAC is not associated / powered on
    NotAssociated,

    /// Slot timer failure
    Timer,

    /// Frame encode or decode failure
    Frame(FramerError),

    /// Wrapper for unhandled / underlying radio errors
    Radio(E),
}

impl<E> From<FramerError> for MacError<E> {
    fn from(e: FramerError) -> Self {
        MacError::Frame(e)
    }
}
