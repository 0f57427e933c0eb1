use std::fmt::{Display, Formatter};

/// Sequence number of a chunk in the reliable stream. Sequence numbers are assigned
///  monotonically starting at 1; 0 means 'nothing sent or acknowledged yet'.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SeqNum(u32);

impl Display for SeqNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SeqNum {
    pub const ZERO: SeqNum = SeqNum(0);

    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> SeqNum {
        SeqNum(
            self.0.checked_add(1)
                .expect("sequence number space exhausted")
        )
    }
}
