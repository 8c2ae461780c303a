use bytes::{Buf, BufMut};

pub fn get_u24(buf: &[u8], offset: usize) -> u32 {
    (buf[offset] as u32) << 16 | (buf[offset + 1] as u32) << 8 | buf[offset + 2] as u32
}

pub fn set_u24(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset] = (value >> 16) as u8;
    buf[offset + 1] = (value >> 8) as u8;
    buf[offset + 2] = value as u8;
}

pub fn get_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

pub fn set_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

/// bit `index` of `buf`, counting MSB first
pub fn get_bit(buf: &[u8], index: usize) -> bool {
    buf[index / 8] & (0x80 >> (index % 8)) != 0
}

pub fn set_bit(buf: &mut [u8], index: usize, value: bool) {
    let mask = 0x80 >> (index % 8);
    if value {
        buf[index / 8] |= mask;
    }
    else {
        buf[index / 8] &= !mask;
    }
}

/// Copies `len` bits from `src` (starting at bit `src_start`) into `dest` (starting at bit
///  `dest_start`), leaving all other bits of `dest` untouched.
pub fn copy_bits(src: &[u8], src_start: usize, dest: &mut [u8], dest_start: usize, len: usize) {
    for i in 0..len {
        set_bit(dest, dest_start + i, get_bit(src, src_start + i));
    }
}

/// `u32 count ‖ count × u32`
pub fn put_id_list(buf: &mut impl BufMut, ids: &[u32]) {
    buf.put_u32(ids.len() as u32);
    for &id in ids {
        buf.put_u32(id);
    }
}

pub fn try_get_id_list(buf: &mut impl Buf) -> anyhow::Result<Vec<u32>> {
    let len = buf.try_get_u32()? as usize;
    if buf.remaining() < len * 4 {
        anyhow::bail!("id list declares {} entries, but only {} bytes remain", len, buf.remaining());
    }

    let mut result = Vec::with_capacity(len);
    for _ in 0..len {
        result.push(buf.try_get_u32()?);
    }
    Ok(result)
}
