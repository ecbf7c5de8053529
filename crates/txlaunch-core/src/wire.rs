//! Flat request encoding for per-worker buffers
//!
//! A request crossing into a worker process cannot carry pointers: the
//! buffer is mapped at the same address in every process today, but the
//! encoding does not rely on it. Everything is located by byte offset
//! from the start of the buffer.
//!
//! ```text
//!  0        4           8           12          16          20         24
//!  ┌────────┬───────────┬───────────┬───────────┬───────────┬──────────┐
//!  │ MAGIC  │ NUM_WRITES│ NUM_FIELDS│ WRITE_SET │ UPDATES   │ reserved │
//!  └────────┴───────────┴───────────┴───────────┴───────────┴──────────┘
//!  24: write_set[NUM_WRITES]  (u64, 8-aligned)
//!      updates[NUM_FIELDS]    (u64, 8-aligned)
//! ```
//!
//! Integers are native-endian; both ends run on the same host.

use crate::constants::FIELDS_PER_RECORD;
use crate::error::{LaunchError, LaunchResult};
use crate::record::Deltas;
use crate::request::TxnRef;

/// Header field offsets
pub mod offsets {
    pub const MAGIC: usize = 0;
    pub const NUM_WRITES: usize = 4;
    pub const NUM_FIELDS: usize = 8;
    pub const WRITE_SET: usize = 12;
    pub const UPDATES: usize = 16;
    pub const HEADER_LEN: usize = 24;
}

/// Marks an encoded buffer ("TXLQ")
pub const MAGIC: u32 = 0x5458_4c51;

const WORD: usize = core::mem::size_of::<u64>();

/// Bytes needed to encode a request with `num_writes` keys
#[inline]
pub const fn encoded_len(num_writes: usize) -> usize {
    offsets::HEADER_LEN + WORD * (num_writes + FIELDS_PER_RECORD)
}

/// Largest write-set that fits a buffer of `capacity` bytes
#[inline]
pub const fn max_writes(capacity: usize) -> usize {
    let fixed = encoded_len(0);
    if capacity < fixed {
        0
    } else {
        (capacity - fixed) / WORD
    }
}

/// Encode `txn` into `buf`, returning the number of bytes written
///
/// Fails with `RequestTooLarge` before touching `buf` if it is too small.
pub fn encode(txn: &TxnRef<'_>, buf: &mut [u8]) -> LaunchResult<usize> {
    let n = txn.write_set().len();
    let size = encoded_len(n);
    if size > buf.len() {
        return Err(LaunchError::RequestTooLarge {
            size,
            capacity: buf.len(),
        });
    }

    let ws_off = offsets::HEADER_LEN;
    let up_off = ws_off + WORD * n;

    put_u32(buf, offsets::MAGIC, MAGIC);
    put_u32(buf, offsets::NUM_WRITES, n as u32);
    put_u32(buf, offsets::NUM_FIELDS, FIELDS_PER_RECORD as u32);
    put_u32(buf, offsets::WRITE_SET, ws_off as u32);
    put_u32(buf, offsets::UPDATES, up_off as u32);
    put_u32(buf, offsets::HEADER_LEN - 4, 0);

    for (i, key) in txn.write_set().iter().enumerate() {
        put_u64(buf, ws_off + i * WORD, *key);
    }
    for (i, delta) in txn.updates().iter().enumerate() {
        put_u64(buf, up_off + i * WORD, *delta);
    }

    Ok(size)
}

/// Decode a buffer in place
///
/// The returned view borrows `buf`; nothing is copied. The buffer must be
/// 8-byte aligned, which per-worker buffers are. Validates the header,
/// bounds and alignment, not the keys themselves (see `TxnRef::validate`).
pub fn decode(buf: &[u8]) -> LaunchResult<TxnRef<'_>> {
    if buf.len() < offsets::HEADER_LEN {
        return Err(LaunchError::CorruptRequest("truncated header"));
    }
    if get_u32(buf, offsets::MAGIC) != MAGIC {
        return Err(LaunchError::CorruptRequest("bad magic"));
    }
    if get_u32(buf, offsets::NUM_FIELDS) as usize != FIELDS_PER_RECORD {
        return Err(LaunchError::CorruptRequest("field count mismatch"));
    }

    let n = get_u32(buf, offsets::NUM_WRITES) as usize;
    let ws_off = get_u32(buf, offsets::WRITE_SET) as usize;
    let up_off = get_u32(buf, offsets::UPDATES) as usize;

    let write_set = u64_slice(buf, ws_off, n)?;
    let updates = u64_slice(buf, up_off, FIELDS_PER_RECORD)?;
    // Length checked above
    let updates: &Deltas = match updates.try_into() {
        Ok(arr) => arr,
        Err(_) => return Err(LaunchError::CorruptRequest("field count mismatch")),
    };

    Ok(TxnRef::new(write_set, updates))
}

fn u64_slice(buf: &[u8], off: usize, len: usize) -> LaunchResult<&[u64]> {
    let end = len
        .checked_mul(WORD)
        .and_then(|bytes| bytes.checked_add(off))
        .ok_or(LaunchError::CorruptRequest("offset overflow"))?;
    if off < offsets::HEADER_LEN || end > buf.len() {
        return Err(LaunchError::CorruptRequest("array out of bounds"));
    }
    let ptr = buf[off..].as_ptr();
    if (ptr as usize) % core::mem::align_of::<u64>() != 0 {
        return Err(LaunchError::CorruptRequest("misaligned array"));
    }
    // SAFETY: in bounds and aligned (checked above), u64 has no invalid bit
    // patterns, and the slice borrows `buf` so it cannot outlive it.
    Ok(unsafe { core::slice::from_raw_parts(ptr as *const u64, len) })
}

#[inline]
fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_ne_bytes());
}

#[inline]
fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + WORD].copy_from_slice(&v.to_ne_bytes());
}

#[inline]
fn get_u32(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_ne_bytes(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::REQUEST_BUF_SIZE;

    /// 8-aligned byte buffer of `REQUEST_BUF_SIZE` bytes
    #[repr(C, align(8))]
    struct Buf([u8; REQUEST_BUF_SIZE]);

    impl Buf {
        fn new() -> Box<Self> {
            Box::new(Buf([0; REQUEST_BUF_SIZE]))
        }
    }

    #[test]
    fn test_encoded_len() {
        assert_eq!(encoded_len(0), 24 + 64);
        assert_eq!(encoded_len(4), 24 + 96);
        assert_eq!(max_writes(REQUEST_BUF_SIZE), 117);
        assert!(encoded_len(max_writes(REQUEST_BUF_SIZE)) <= REQUEST_BUF_SIZE);
        assert!(encoded_len(max_writes(REQUEST_BUF_SIZE) + 1) > REQUEST_BUF_SIZE);
        assert_eq!(max_writes(10), 0);
    }

    #[test]
    fn test_encode_decode() {
        let keys = [3u64, 17, 40_000];
        let mut deltas = [0u64; FIELDS_PER_RECORD];
        deltas[2] = 9;
        let mut buf = Buf::new();

        let written = encode(&TxnRef::new(&keys, &deltas), &mut buf.0).unwrap();
        assert_eq!(written, encoded_len(3));

        let txn = decode(&buf.0).unwrap();
        assert_eq!(txn.write_set(), &keys);
        assert_eq!(txn.updates(), &deltas);
    }

    #[test]
    fn test_encode_rejects_oversize_without_writing() {
        let keys: Vec<u64> = (0..200).collect();
        let deltas = [1u64; FIELDS_PER_RECORD];
        let mut buf = Buf::new();

        let err = encode(&TxnRef::new(&keys, &deltas), &mut buf.0).unwrap_err();
        assert_eq!(
            err,
            LaunchError::RequestTooLarge {
                size: encoded_len(200),
                capacity: REQUEST_BUF_SIZE
            }
        );
        assert!(buf.0.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let buf = Buf::new();
        assert_eq!(decode(&buf.0).unwrap_err(), LaunchError::CorruptRequest("bad magic"));
        assert!(decode(&buf.0[..8]).is_err());
    }

    #[test]
    fn test_decode_rejects_out_of_bounds() {
        let keys = [1u64, 2];
        let deltas = [0u64; FIELDS_PER_RECORD];
        let mut buf = Buf::new();
        encode(&TxnRef::new(&keys, &deltas), &mut buf.0).unwrap();

        put_u32(&mut buf.0, offsets::NUM_WRITES, 10_000);
        assert_eq!(
            decode(&buf.0).unwrap_err(),
            LaunchError::CorruptRequest("array out of bounds")
        );
    }

    #[test]
    fn test_decode_rejects_misaligned() {
        let keys = [1u64];
        let deltas = [0u64; FIELDS_PER_RECORD];
        let mut buf = Buf::new();
        encode(&TxnRef::new(&keys, &deltas), &mut buf.0).unwrap();

        put_u32(&mut buf.0, offsets::WRITE_SET, 28);
        assert_eq!(
            decode(&buf.0).unwrap_err(),
            LaunchError::CorruptRequest("misaligned array")
        );
    }
}
