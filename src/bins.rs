pub(crate) trait SliceExt {
    fn read_u64(&self) -> u64;
    fn put_u64(&mut self, val: u64);
}

impl SliceExt for [u8] {
    fn read_u64(&self) -> u64 {
        u64::from_le_bytes(self[..8].try_into().unwrap())
    }
    fn put_u64(&mut self, val: u64) {
        self[..8].copy_from_slice(&val.to_le_bytes());
    }
}

// Zigzag varint codec for the on-disk format. Values are always written into
// fixed 8-byte slots with a zero tail, so the maximum encodable magnitude is
// bounded by 7 payload bits per slot byte.

/// Encodes `val` into the head of `buf` and returns the number of bytes
/// written. Panics if `buf` is too small to hold the encoding.
pub(crate) fn put_varint(buf: &mut [u8], val: i64) -> usize {
    let mut x = ((val << 1) ^ (val >> 63)) as u64;
    let mut i = 0;
    while x >= 0x80 {
        buf[i] = (x as u8) | 0x80;
        x >>= 7;
        i += 1;
    }
    buf[i] = x as u8;
    i + 1
}

/// Decodes a varint from the head of `buf`. Returns the value and the number
/// of bytes consumed, or `None` if the encoding is truncated.
pub(crate) fn read_varint(buf: &[u8]) -> Option<(i64, usize)> {
    let mut x: u64 = 0;
    let mut shift = 0u32;
    for (i, &b) in buf.iter().enumerate() {
        if shift >= 64 {
            return None;
        }
        x |= u64::from(b & 0x7f) << shift;
        if b < 0x80 {
            let val = ((x >> 1) as i64) ^ -((x & 1) as i64);
            return Some((val, i + 1));
        }
        shift += 7;
    }
    None
}

macro_rules! const_assert {
    ($($tt:tt)*) => {
        const _: () = assert!($($tt)*);
    }
}
pub(crate) use const_assert;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_roundtrip() {
        let mut buf = [0u8; 8];
        for val in [
            0i64,
            1,
            -1,
            63,
            -64,
            4096,
            -4096,
            1 << 54,
            -(1 << 54),
            (1 << 55) - 1,
        ] {
            let n = put_varint(&mut buf, val);
            assert!(n <= 8, "encoding of {val} does not fit a slot");
            let (decoded, consumed) = read_varint(&buf).unwrap();
            assert_eq!(val, decoded);
            assert_eq!(n, consumed);
        }
    }

    #[test]
    fn test_varint_zero_slot() {
        // An all-zero slot decodes as value 0 in a single byte.
        let buf = [0u8; 8];
        assert_eq!(Some((0, 1)), read_varint(&buf));
    }

    #[test]
    fn test_varint_truncated() {
        assert_eq!(None, read_varint(&[]));
        // A lone continuation byte has no terminator.
        assert_eq!(None, read_varint(&[0x80]));
    }

    #[test]
    fn test_u64_roundtrip() {
        let mut buf = [0u8; 8];
        buf.put_u64(0xdead_beef_cafe_f00d);
        assert_eq!(0xdead_beef_cafe_f00d, buf.read_u64());
    }
}
