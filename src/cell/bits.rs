//! Big-endian bit string helpers

/// Read bit `index` (MSB first)
#[inline]
pub fn get_bit(data: &[u8], index: usize) -> bool {
    (data[index / 8] >> (7 - index % 8)) & 1 != 0
}

#[inline]
pub fn set_bit(data: &mut [u8], index: usize, value: bool) {
    let mask = 0x80u8 >> (index % 8);
    if value {
        data[index / 8] |= mask;
    } else {
        data[index / 8] &= !mask;
    }
}

/// Copy `len` bits from `src` at `src_offset` into `dst` at `dst_offset`
pub fn copy_bits(dst: &mut [u8], dst_offset: usize, src: &[u8], src_offset: usize, len: usize) {
    if dst_offset % 8 == 0 && src_offset % 8 == 0 {
        let full = len / 8;
        let d = dst_offset / 8;
        let s = src_offset / 8;
        dst[d..d + full].copy_from_slice(&src[s..s + full]);
        for i in full * 8..len {
            set_bit(dst, dst_offset + i, get_bit(src, src_offset + i));
        }
        return;
    }
    for i in 0..len {
        set_bit(dst, dst_offset + i, get_bit(src, src_offset + i));
    }
}

/// Read up to 64 bits as an unsigned big-endian integer
pub fn load_uint(data: &[u8], offset: usize, bits: usize) -> u64 {
    debug_assert!(bits <= 64);
    let mut res = 0u64;
    for i in 0..bits {
        res = (res << 1) | get_bit(data, offset + i) as u64;
    }
    res
}

/// Write the low `bits` bits of `value` big-endian
pub fn store_uint(data: &mut [u8], offset: usize, value: u64, bits: usize) {
    debug_assert!(bits <= 64);
    for i in 0..bits {
        set_bit(data, offset + i, (value >> (bits - 1 - i)) & 1 != 0);
    }
}

/// Hex form of a bit string, with `_` marking a partial last nibble
pub fn to_hex(data: &[u8], bits: usize) -> String {
    let mut out = String::with_capacity(bits / 4 + 2);
    let nibbles = bits / 4;
    for i in 0..nibbles {
        let v = load_uint(data, i * 4, 4) as u32;
        out.push(std::char::from_digit(v, 16).unwrap_or('?').to_ascii_uppercase());
    }
    let rest = bits % 4;
    if rest != 0 {
        // completion tag: append a 1 bit and pad with zeros
        let v = ((load_uint(data, nibbles * 4, rest) << 1 | 1) << (3 - rest)) as u32;
        out.push(std::char::from_digit(v, 16).unwrap_or('?').to_ascii_uppercase());
        out.push('_');
    }
    out
}
