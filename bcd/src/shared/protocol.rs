// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Framing for the two transports.
//!
//! Session sockets carry request frames: a 1-byte op, a 4-byte little-endian
//! payload length, then the payload as a sequence of 2-byte-length-prefixed
//! strings. Every request is answered with a reply: a status byte, followed
//! by a length-prefixed message when the status is an error.
//!
//! The control pipe carries exactly two shapes: the fatal record (op byte,
//! 2-byte length, bounded message) written by the host, and on the status
//! pipe going the other way, the init handshake (status byte, 2-byte length,
//! payload) and the single-byte fatal acknowledgement.

use crate::shared::constants::*;
use crate::shared::error::{ErrorKind, ErrorValue};
use std::io::{self, Read, Write};
use std::os::fd::RawFd;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub op: u8,
    pub payload: Vec<u8>,
}

/// Truncates to `max` without splitting a UTF-8 sequence.
pub fn bounded(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    &s[..cut]
}

fn push_string(payload: &mut Vec<u8>, s: &str) {
    let s = bounded(s, STRING_MAX);
    payload.extend_from_slice(&(s.len() as u16).to_le_bytes());
    payload.extend_from_slice(s.as_bytes());
}

/// Writes one request frame. Strings longer than the bound are truncated.
pub fn write_frame(w: &mut impl Write, op: u8, strings: &[&str]) -> io::Result<()> {
    let mut payload = Vec::with_capacity(strings.iter().map(|s| 2 + s.len().min(STRING_MAX)).sum());
    for s in strings {
        push_string(&mut payload, s);
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.push(op);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    w.write_all(&frame)?;
    w.flush()
}

/// Reads one request frame. `Ok(None)` means the peer closed the stream
/// cleanly before a new frame began.
pub fn read_frame(r: &mut impl Read) -> io::Result<Option<Frame>> {
    let mut op = [0u8; 1];
    loop {
        match r.read(&mut op) {
            Ok(0) => return Ok(None),
            Ok(_) => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    let mut len_bytes = [0u8; 4];
    r.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > FRAME_PAYLOAD_MAX {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame payload of {len} bytes exceeds the bound"),
        ));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    Ok(Some(Frame {
        op: op[0],
        payload,
    }))
}

/// Splits a payload into exactly `count` strings.
pub fn decode_strings(payload: &[u8], count: usize) -> Result<Vec<String>, ErrorValue> {
    let violation = |detail: &str| ErrorValue::new(ErrorKind::ProtocolViolation, detail);
    let mut strings = Vec::with_capacity(count);
    let mut rest = payload;
    for _ in 0..count {
        if rest.len() < 2 {
            return Err(violation("payload ends inside a string header"));
        }
        let len = u16::from_le_bytes([rest[0], rest[1]]) as usize;
        rest = &rest[2..];
        if len > STRING_MAX {
            return Err(violation("string exceeds the bound"));
        }
        if rest.len() < len {
            return Err(violation("payload ends inside a string body"));
        }
        let s = std::str::from_utf8(&rest[..len])
            .map_err(|_| violation("string is not valid UTF-8"))?;
        strings.push(s.to_string());
        rest = &rest[len..];
    }
    if !rest.is_empty() {
        return Err(violation("trailing bytes after the last string"));
    }
    Ok(strings)
}

/// Writes the reply to a request frame.
pub fn write_reply(w: &mut impl Write, reply: &ErrorValue) -> io::Result<()> {
    let mut buf = Vec::with_capacity(3 + reply.message().len());
    buf.push(reply.kind().as_u8());
    if !reply.is_ok() {
        let message = reply.message().as_bytes();
        buf.extend_from_slice(&(message.len() as u16).to_le_bytes());
        buf.extend_from_slice(message);
    }
    w.write_all(&buf)?;
    w.flush()
}

pub fn read_reply(r: &mut impl Read) -> io::Result<ErrorValue> {
    let mut status = [0u8; 1];
    r.read_exact(&mut status)?;
    if status[0] == ErrorKind::Ok.as_u8() {
        return Ok(ErrorValue::ok());
    }
    let mut len_bytes = [0u8; 2];
    r.read_exact(&mut len_bytes)?;
    let len = u16::from_le_bytes(len_bytes) as usize;
    if len > STRING_MAX {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "reply message exceeds the bound",
        ));
    }
    let mut message = vec![0u8; len];
    r.read_exact(&mut message)?;
    Ok(ErrorValue::new(
        ErrorKind::from_u8(status[0]),
        String::from_utf8_lossy(&message),
    ))
}

/// Encodes a fatal record into a caller-owned buffer and returns the encoded
/// length. Performs no allocation, so it is usable from a signal context.
/// The message is truncated to keep the record a single atomic pipe write.
pub fn encode_fatal_record(buf: &mut [u8; FATAL_RECORD_MAX], message: &[u8]) -> usize {
    let len = message.len().min(FATAL_MESSAGE_MAX);
    buf[0] = OP_FATAL;
    buf[1..3].copy_from_slice(&(len as u16).to_le_bytes());
    buf[3..3 + len].copy_from_slice(&message[..len]);
    3 + len
}

/// Writes all of `buf` to a raw descriptor, retrying on EINTR.
pub fn write_all_fd(fd: RawFd, buf: &[u8]) -> io::Result<()> {
    let mut written = 0;
    while written < buf.len() {
        let rc = unsafe {
            libc::write(
                fd,
                buf[written..].as_ptr() as *const libc::c_void,
                buf.len() - written,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        written += rc as usize;
    }
    Ok(())
}

/// Fills all of `buf` from a raw descriptor, retrying on EINTR. EOF before
/// the buffer fills is an error.
pub fn read_exact_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let rc = unsafe {
            libc::read(
                fd,
                buf[filled..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - filled,
            )
        };
        match rc {
            0 => return Err(io::ErrorKind::UnexpectedEof.into()),
            rc if rc < 0 => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            rc => filled += rc as usize,
        }
    }
    Ok(())
}

/// Reads one byte; `Ok(None)` on EOF.
pub fn read_byte_fd(fd: RawFd) -> io::Result<Option<u8>> {
    let mut byte = [0u8; 1];
    loop {
        let rc = unsafe { libc::read(fd, byte.as_mut_ptr() as *mut libc::c_void, 1) };
        match rc {
            0 => return Ok(None),
            1 => return Ok(Some(byte[0])),
            _ => {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(err);
                }
            }
        }
    }
}

/// Writes the init handshake or an error report on the status pipe.
pub fn write_handshake(fd: RawFd, status: u8, payload: &[u8]) -> io::Result<()> {
    let payload = &payload[..payload.len().min(STRING_MAX)];
    let mut buf = Vec::with_capacity(3 + payload.len());
    buf.push(status);
    buf.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    buf.extend_from_slice(payload);
    write_all_fd(fd, &buf)
}

/// Reads the init handshake. On success the payload is the monitor's listen
/// path; on failure it is the error message for the carried kind.
pub fn read_handshake(fd: RawFd) -> io::Result<Result<Vec<u8>, ErrorValue>> {
    let mut header = [0u8; 3];
    read_exact_fd(fd, &mut header)?;
    let len = u16::from_le_bytes([header[1], header[2]]) as usize;
    if len > STRING_MAX {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "handshake payload exceeds the bound",
        ));
    }
    let mut payload = vec![0u8; len];
    read_exact_fd(fd, &mut payload)?;
    if header[0] == ErrorKind::Ok.as_u8() {
        Ok(Ok(payload))
    } else {
        Ok(Err(ErrorValue::new(
            ErrorKind::from_u8(header[0]),
            String::from_utf8_lossy(&payload),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_round_trip() -> anyhow::Result<()> {
        let mut buf = Vec::new();
        write_frame(&mut buf, OP_KV_SET, &["service", "api"])?;
        let frame = read_frame(&mut Cursor::new(&buf))?.unwrap();
        assert_eq!(frame.op, OP_KV_SET);
        let strings = decode_strings(&frame.payload, 2).unwrap();
        assert_eq!(strings, vec!["service".to_string(), "api".to_string()]);
        Ok(())
    }

    #[test]
    fn empty_payload_round_trip() -> anyhow::Result<()> {
        let mut buf = Vec::new();
        write_frame(&mut buf, OP_DETACH, &[])?;
        let frame = read_frame(&mut Cursor::new(&buf))?.unwrap();
        assert_eq!(frame.op, OP_DETACH);
        assert!(frame.payload.is_empty());
        assert!(decode_strings(&frame.payload, 0).is_ok());
        Ok(())
    }

    #[test]
    fn eof_before_a_frame_is_clean() -> anyhow::Result<()> {
        assert!(read_frame(&mut Cursor::new(&[]))?.is_none());
        Ok(())
    }

    #[test]
    fn eof_inside_a_frame_is_an_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, OP_EMIT, &["message"]).unwrap();
        buf.truncate(buf.len() - 1);
        assert!(read_frame(&mut Cursor::new(&buf)).is_err());
    }

    #[test]
    fn oversized_strings_are_truncated_on_write() -> anyhow::Result<()> {
        let long = "v".repeat(3 * STRING_MAX);
        let mut buf = Vec::new();
        write_frame(&mut buf, OP_EMIT, &[&long])?;
        let frame = read_frame(&mut Cursor::new(&buf))?.unwrap();
        let strings = decode_strings(&frame.payload, 1).unwrap();
        assert_eq!(strings[0].len(), STRING_MAX);
        Ok(())
    }

    #[test]
    fn decode_rejects_malformed_payloads() {
        assert!(decode_strings(&[1], 1).is_err());
        assert!(decode_strings(&[5, 0, b'a'], 1).is_err());
        let err = decode_strings(&[0, 0, 9], 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
        assert!(decode_strings(&[2, 0, 0xff, 0xfe], 1).is_err());
    }

    #[test]
    fn reply_round_trip() -> anyhow::Result<()> {
        let mut buf = Vec::new();
        write_reply(&mut buf, &ErrorValue::ok())?;
        assert_eq!(buf, vec![0]);
        assert!(read_reply(&mut Cursor::new(&buf))?.is_ok());

        let mut buf = Vec::new();
        let original = ErrorValue::new(ErrorKind::QueueFull, "queue is full");
        write_reply(&mut buf, &original)?;
        let restored = read_reply(&mut Cursor::new(&buf))?;
        assert_eq!(restored, original);
        Ok(())
    }

    #[test]
    fn fatal_record_truncates_and_stays_bounded() {
        let mut buf = [0u8; FATAL_RECORD_MAX];
        let message = vec![b'm'; 4 * FATAL_MESSAGE_MAX];
        let len = encode_fatal_record(&mut buf, &message);
        assert_eq!(len, FATAL_RECORD_MAX);
        assert_eq!(buf[0], OP_FATAL);
        assert_eq!(
            u16::from_le_bytes([buf[1], buf[2]]) as usize,
            FATAL_MESSAGE_MAX
        );

        let len = encode_fatal_record(&mut buf, b"segv");
        assert_eq!(len, 3 + 4);
        assert_eq!(&buf[3..7], b"segv");
    }

    #[test]
    fn bounded_respects_char_boundaries() {
        assert_eq!(bounded("abcdef", 3), "abc");
        assert_eq!(bounded("ab", 3), "ab");
        // Two-byte character straddling the cut point.
        assert_eq!(bounded("aéz", 2), "a");
    }
}
