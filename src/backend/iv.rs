/// Add `n` to an IV treated as a big-endian unsigned integer, wrapping at
/// 2^(8 * iv.len()).
///
/// CTR consumes one counter value per cipher block, so advancing the stored
/// slot IV by a cipher-block index yields the counter for any intra-slot
/// offset without generating the intervening keystream.
pub(crate) fn increment(iv: &mut [u8], n: u64) {
    let nbytes = n.to_be_bytes();
    let mut carry = 0u16;
    for (i, byte) in iv.iter_mut().rev().enumerate() {
        let add = if i < nbytes.len() { nbytes[nbytes.len() - 1 - i] } else { 0 };
        let sum = *byte as u16 + add as u16 + carry;
        *byte = sum as u8;
        carry = sum >> 8;
    }
}
