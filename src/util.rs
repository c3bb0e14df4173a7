//! # MQTT-SN Serialization Utilities
//!
//! Helper functions for reading and writing MQTT-SN fields from and to byte
//! buffers: the 1- or 3-byte length header, big-endian integers and the
//! unprefixed strings that run to the end of a message.
//!
//! Every reader takes the message body as its bound, so nothing is ever read
//! past the declared message length.

use crate::error::{DecodeError, EncodeError};

/// First byte of a message that uses the 3-byte length form.
pub const EXTENDED_LENGTH_MARKER: u8 = 0x01;

/// Largest total length expressible with the 1-byte length form.
pub const MAX_SHORT_LENGTH: usize = 255;

/// Number of header bytes (length field plus message type) needed for a
/// message whose body is `body_len` bytes long.
pub fn header_len(body_len: usize) -> usize {
    if body_len + 2 <= MAX_SHORT_LENGTH { 2 } else { 4 }
}

/// Splits a datagram into its message type and body.
///
/// The declared length must equal the datagram size exactly.
pub fn read_header(buf: &[u8]) -> Result<(u8, &[u8]), DecodeError> {
    let first = *buf.first().ok_or(DecodeError::Truncated)?;
    let (declared, msg_type, hdr) = if first == EXTENDED_LENGTH_MARKER {
        let mut cursor = 1;
        let len = read_u16(&mut cursor, buf)? as usize;
        let msg_type = read_u8(&mut cursor, buf)?;
        (len, msg_type, cursor)
    } else {
        let msg_type = *buf.get(1).ok_or(DecodeError::Truncated)?;
        (first as usize, msg_type, 2)
    };

    if declared < hdr {
        return Err(DecodeError::Malformed);
    }
    if declared != buf.len() {
        return Err(DecodeError::LengthMismatch);
    }
    Ok((msg_type, &buf[hdr..declared]))
}

/// Writes the length header and message type, advancing the cursor.
pub fn write_header(
    cursor: &mut usize,
    buf: &mut [u8],
    msg_type: u8,
    body_len: usize,
) -> Result<(), EncodeError> {
    let hdr = header_len(body_len);
    let total = hdr + body_len;
    if total > u16::MAX as usize {
        return Err(EncodeError::PayloadTooLarge);
    }
    if buf.len() < total {
        return Err(EncodeError::BufferTooSmall);
    }
    if hdr == 2 {
        write_u8(cursor, buf, total as u8)?;
    } else {
        write_u8(cursor, buf, EXTENDED_LENGTH_MARKER)?;
        write_u16(cursor, buf, total as u16)?;
    }
    write_u8(cursor, buf, msg_type)
}

pub fn read_u8(cursor: &mut usize, buf: &[u8]) -> Result<u8, DecodeError> {
    let val = *buf.get(*cursor).ok_or(DecodeError::Truncated)?;
    *cursor += 1;
    Ok(val)
}

/// Reads a big-endian `u16`, advancing the cursor.
pub fn read_u16(cursor: &mut usize, buf: &[u8]) -> Result<u16, DecodeError> {
    let bytes = buf
        .get(*cursor..*cursor + 2)
        .ok_or(DecodeError::Truncated)?;
    *cursor += 2;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Returns everything from the cursor to the end of the body.
pub fn read_rest<'a>(cursor: &mut usize, buf: &'a [u8]) -> Result<&'a [u8], DecodeError> {
    let rest = buf.get(*cursor..).ok_or(DecodeError::Truncated)?;
    *cursor = buf.len();
    Ok(rest)
}

/// Reads a UTF-8 string running to the end of the body.
pub fn read_str_to_end<'a>(cursor: &mut usize, buf: &'a [u8]) -> Result<&'a str, DecodeError> {
    let bytes = read_rest(cursor, buf)?;
    core::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)
}

/// Fails with `Malformed` if the body has bytes left after the last field.
pub fn ensure_consumed(cursor: usize, buf: &[u8]) -> Result<(), DecodeError> {
    if cursor == buf.len() {
        Ok(())
    } else {
        Err(DecodeError::Malformed)
    }
}

pub fn write_u8(cursor: &mut usize, buf: &mut [u8], val: u8) -> Result<(), EncodeError> {
    *buf.get_mut(*cursor).ok_or(EncodeError::BufferTooSmall)? = val;
    *cursor += 1;
    Ok(())
}

/// Writes a big-endian `u16`, advancing the cursor.
pub fn write_u16(cursor: &mut usize, buf: &mut [u8], val: u16) -> Result<(), EncodeError> {
    buf.get_mut(*cursor..*cursor + 2)
        .ok_or(EncodeError::BufferTooSmall)?
        .copy_from_slice(&val.to_be_bytes());
    *cursor += 2;
    Ok(())
}

pub fn write_bytes(cursor: &mut usize, buf: &mut [u8], bytes: &[u8]) -> Result<(), EncodeError> {
    buf.get_mut(*cursor..*cursor + bytes.len())
        .ok_or(EncodeError::BufferTooSmall)?
        .copy_from_slice(bytes);
    *cursor += bytes.len();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_header() {
        let buf = [0x03, 0x05, 0x00];
        let (msg_type, body) = read_header(&buf).unwrap();
        assert_eq!(msg_type, 0x05);
        assert_eq!(body, &[0x00]);
    }

    #[test]
    fn test_extended_header() {
        let mut buf = [0u8; 300];
        buf[0] = EXTENDED_LENGTH_MARKER;
        buf[1..3].copy_from_slice(&300u16.to_be_bytes());
        buf[3] = 0x0C;
        let (msg_type, body) = read_header(&buf).unwrap();
        assert_eq!(msg_type, 0x0C);
        assert_eq!(body.len(), 296);
    }

    #[test]
    fn test_header_rejects_length_mismatch() {
        assert_eq!(read_header(&[0x04, 0x05, 0x00]), Err(DecodeError::LengthMismatch));
        assert_eq!(read_header(&[0x02, 0x17, 0x00]), Err(DecodeError::LengthMismatch));
        assert_eq!(read_header(&[0x01, 0x00]), Err(DecodeError::Truncated));
        assert_eq!(read_header(&[]), Err(DecodeError::Truncated));
        assert_eq!(read_header(&[0x00, 0x17]), Err(DecodeError::Malformed));
    }

    #[test]
    fn test_header_len_switches_at_256() {
        assert_eq!(header_len(0), 2);
        assert_eq!(header_len(253), 2);
        assert_eq!(header_len(254), 4);
    }

    #[test]
    fn test_write_header_reports_small_buffer() {
        let mut buf = [0u8; 4];
        let mut cursor = 0;
        assert_eq!(
            write_header(&mut cursor, &mut buf, 0x0C, 10),
            Err(EncodeError::BufferTooSmall)
        );
    }

    #[test]
    fn test_reads_stay_inside_body() {
        let body = [0x12];
        let mut cursor = 0;
        assert_eq!(read_u16(&mut cursor, &body), Err(DecodeError::Truncated));
        assert_eq!(cursor, 0);
    }
}
