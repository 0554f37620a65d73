//! Git delta instruction streams
//!
//! A delta is two little-endian varints (base size, result size) followed by
//! copy and insert instructions.

use crate::{Error, Result};

/// Reconstruct an object from `base` and a delta instruction stream.
pub fn apply_delta(base: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
    let mut pos = 0;
    let base_size = read_size(delta, &mut pos)?;
    if base_size != base.len() as u64 {
        return Err(Error::Corrupt(format!(
            "delta expects a {} byte base, got {}",
            base_size,
            base.len()
        )));
    }
    let result_size = read_size(delta, &mut pos)?;
    let mut out = Vec::with_capacity(result_size.min(1 << 24) as usize);

    while pos < delta.len() {
        let cmd = delta[pos];
        pos += 1;

        if cmd & 0x80 != 0 {
            // Copy from base: offset in up to 4 bytes, size in up to 3.
            let mut offset = 0usize;
            let mut size = 0usize;
            for i in 0..4 {
                if cmd & (1 << i) != 0 {
                    offset |= (next_byte(delta, &mut pos)? as usize) << (8 * i);
                }
            }
            for i in 0..3 {
                if cmd & (0x10 << i) != 0 {
                    size |= (next_byte(delta, &mut pos)? as usize) << (8 * i);
                }
            }
            if size == 0 {
                size = 0x10000;
            }
            let end = offset
                .checked_add(size)
                .filter(|&end| end <= base.len())
                .ok_or_else(|| Error::Corrupt("delta copy outside base".into()))?;
            out.extend_from_slice(&base[offset..end]);
        } else if cmd != 0 {
            let end = pos + cmd as usize;
            if end > delta.len() {
                return Err(Error::Corrupt("delta insert truncated".into()));
            }
            out.extend_from_slice(&delta[pos..end]);
            pos = end;
        } else {
            return Err(Error::Corrupt("reserved delta opcode".into()));
        }
    }

    if out.len() as u64 != result_size {
        return Err(Error::Corrupt(format!(
            "delta produced {} bytes, header says {}",
            out.len(),
            result_size
        )));
    }
    Ok(out)
}

fn next_byte(data: &[u8], pos: &mut usize) -> Result<u8> {
    let byte = *data
        .get(*pos)
        .ok_or_else(|| Error::Corrupt("delta truncated".into()))?;
    *pos += 1;
    Ok(byte)
}

fn read_size(data: &[u8], pos: &mut usize) -> Result<u64> {
    let mut size = 0u64;
    let mut shift = 0;
    loop {
        let byte = next_byte(data, pos)?;
        if shift > 63 {
            return Err(Error::Corrupt("delta size overflows".into()));
        }
        size |= ((byte & 0x7f) as u64) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok(size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn size(mut n: usize, out: &mut Vec<u8>) {
        loop {
            let byte = (n & 0x7f) as u8;
            n >>= 7;
            if n == 0 {
                out.push(byte);
                return;
            }
            out.push(byte | 0x80);
        }
    }

    #[test]
    fn test_copy_and_insert() {
        let base = b"hello world";
        let mut delta = Vec::new();
        size(base.len(), &mut delta);
        size(13, &mut delta);
        // copy offset 0, size 6 ("hello ")
        delta.extend_from_slice(&[0x80 | 0x10, 6]);
        // insert "there"
        delta.push(5);
        delta.extend_from_slice(b"there");
        // copy offset 10, size 1 ("d"), then insert "!"
        delta.extend_from_slice(&[0x80 | 0x01 | 0x10, 10, 1]);
        delta.extend_from_slice(&[1, b'!']);

        assert_eq!(apply_delta(base, &delta).unwrap(), b"hello thered!");
    }

    #[test]
    fn test_base_size_mismatch() {
        let mut delta = Vec::new();
        size(3, &mut delta);
        size(0, &mut delta);
        assert!(matches!(apply_delta(b"four", &delta), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_copy_out_of_range() {
        let mut delta = Vec::new();
        size(4, &mut delta);
        size(8, &mut delta);
        delta.extend_from_slice(&[0x80 | 0x10, 8]);
        assert!(matches!(apply_delta(b"four", &delta), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_reserved_opcode() {
        let mut delta = Vec::new();
        size(4, &mut delta);
        size(0, &mut delta);
        delta.push(0);
        assert!(matches!(apply_delta(b"four", &delta), Err(Error::Corrupt(_))));
    }
}
