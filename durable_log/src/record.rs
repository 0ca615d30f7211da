//! On-disk record framing: a 4-byte little-endian length prefix, the
//! payload, and 0-3 zero pad bytes bringing the whole record up to a
//! multiple of 4. Every allocation the allocator hands out is sized by
//! [`record_size`], so a record never straddles the boundary an aligned
//! reader expects.

use crate::address::align4;

/// Bytes a header takes on the wire.
pub const HEADER_LEN: usize = 4;

static_assertions::const_assert_eq!(HEADER_LEN, std::mem::size_of::<u32>());

/// Total on-disk size of a record carrying `payload_len` bytes of payload.
pub const fn record_size(payload_len: usize) -> usize {
    HEADER_LEN + align4(payload_len)
}

/// Encodes `payload` into `out`, which must be at least `record_size(payload.len())`
/// bytes long. Returns the number of bytes written (== `record_size`).
pub fn encode(payload: &[u8], out: &mut [u8]) -> usize {
    let total = record_size(payload.len());
    assert!(out.len() >= total, "destination buffer too small for record");
    out[..HEADER_LEN].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    out[HEADER_LEN..HEADER_LEN + payload.len()].copy_from_slice(payload);
    for pad in out.iter_mut().take(total).skip(HEADER_LEN + payload.len()) {
        *pad = 0;
    }
    total
}

/// A record as decoded from a byte slice: its payload length and where the
/// record ends (including padding) relative to the start of `bytes`.
pub struct Decoded<'a> {
    pub payload: &'a [u8],
    pub record_len: usize,
}

/// Attempts to decode one record from the front of `bytes`. Returns `None`
/// if `bytes` doesn't hold a complete header yet, or the header announces a
/// record that the page's remaining room can't actually contain (the
/// all-zero tail past the last real record in a page reads as a zero-length
/// header, which callers should treat the same as "no more records here").
pub fn decode(bytes: &[u8]) -> Option<Decoded<'_>> {
    if bytes.len() < HEADER_LEN {
        return None;
    }
    let len = u32::from_le_bytes(bytes[..HEADER_LEN].try_into().unwrap()) as usize;
    if len == 0 {
        return None;
    }
    let record_len = record_size(len);
    if bytes.len() < record_len {
        return None;
    }
    Some(Decoded {
        payload: &bytes[HEADER_LEN..HEADER_LEN + len],
        record_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let payload = b"hello world";
        let mut buf = vec![0u8; record_size(payload.len())];
        let written = encode(payload, &mut buf);
        assert_eq!(written, buf.len());

        let decoded = decode(&buf).expect("decodes");
        assert_eq!(decoded.payload, payload);
        assert_eq!(decoded.record_len, buf.len());
    }

    #[test]
    fn decode_rejects_zero_length_header_as_end_of_page() {
        let buf = [0u8; 16];
        assert!(decode(&buf).is_none());
    }

    #[test]
    fn decode_waits_for_more_bytes_on_truncated_record() {
        let payload = b"some payload bytes";
        let mut buf = vec![0u8; record_size(payload.len())];
        encode(payload, &mut buf);
        assert!(decode(&buf[..HEADER_LEN + 2]).is_none());
    }
}
