use std::fmt::{Display, Formatter};

/// The direction a packet is travelling in: `Incoming` towards the client, `Outgoing` towards
///  the remote simulator. Sequencing state is kept separately per direction.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Incoming => Direction::Outgoing,
            Direction::Outgoing => Direction::Incoming,
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Incoming => write!(f, "<-"),
            Direction::Outgoing => write!(f, "->"),
        }
    }
}
