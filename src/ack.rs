use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

use crate::seq_num::SeqNum;

/// A decoded acknowledgement element.
///
/// The wire encoding is a contiguous run of 32-bit big-endian integers: the first is
///  the cumulative acknowledgement ('all chunks up to and including this sequence
///  number arrived'), the rest are the selectively acknowledged sequence numbers,
///  all greater than the cumulative one. The count of selective entries is inferred
///  from the element's byte length.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Acknowledgement {
    pub cumulative: SeqNum,
    pub sack_list: Vec<SeqNum>,
}

impl Acknowledgement {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.cumulative.to_raw());
        for &seq_num in &self.sack_list {
            buf.put_u32(seq_num.to_raw());
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Acknowledgement> {
        // the number of selective entries is derived from the element length; trailing
        //  bytes beyond the last full integer are ignored
        let sack_count = (buf.remaining() / size_of::<u32>()).saturating_sub(1);

        let cumulative = SeqNum::from_raw(buf.try_get_u32()?);

        let mut sack_list = Vec::with_capacity(sack_count);
        for _ in 0..sack_count {
            sack_list.push(SeqNum::from_raw(buf.try_get_u32()?));
        }
        sack_list.sort();

        Ok(Acknowledgement {
            cumulative,
            sack_list,
        })
    }
}
