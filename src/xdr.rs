// Copyright 2020 Joyent, Inc.

//! Bounded XDR (RFC 4506) primitives.
//!
//! All quantities are big-endian and padded to a multiple of four bytes.
//! An `XdrEncoder` is created with a byte limit and refuses to grow past it,
//! which is what lets the replay cache enforce its fixed capacity.

use std::error::Error as StdError;
use std::fmt;

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};

const XDR_UNIT: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub enum XdrError {
    /// The encoding would not fit within `limit` bytes.
    Overflow { limit: usize },
    /// The input ended before the value was complete.
    Truncated { needed: usize, available: usize },
    /// A discriminant, boolean, or length was out of range.
    InvalidValue(&'static str, u32),
}

impl fmt::Display for XdrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XdrError::Overflow { limit } => {
                write!(f, "encoding exceeds the {} byte limit", limit)
            }
            XdrError::Truncated { needed, available } => write!(
                f,
                "not enough bytes: needed {}, {} available",
                needed, available
            ),
            XdrError::InvalidValue(what, value) => {
                write!(f, "invalid {}: {}", what, value)
            }
        }
    }
}

impl StdError for XdrError {}

pub type XdrResult<T> = Result<T, XdrError>;

pub trait XdrEncode {
    fn encode(&self, enc: &mut XdrEncoder) -> XdrResult<()>;
}

pub trait XdrDecode: Sized {
    fn decode(dec: &mut XdrDecoder<'_>) -> XdrResult<Self>;
}

fn padding(len: usize) -> usize {
    (XDR_UNIT - len % XDR_UNIT) % XDR_UNIT
}

pub struct XdrEncoder {
    buf: BytesMut,
    limit: usize,
}

impl XdrEncoder {
    pub fn new(limit: usize) -> XdrEncoder {
        XdrEncoder {
            buf: BytesMut::with_capacity(limit.min(4096)),
            limit,
        }
    }

    /// An encoder for transport use where no cache bound applies.
    pub fn unbounded() -> XdrEncoder {
        XdrEncoder {
            buf: BytesMut::new(),
            limit: usize::MAX,
        }
    }

    pub fn position(&self) -> usize {
        self.buf.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> BytesMut {
        self.buf
    }

    fn check_room(&self, n: usize) -> XdrResult<()> {
        match self.buf.len().checked_add(n) {
            Some(end) if end <= self.limit => Ok(()),
            _ => Err(XdrError::Overflow { limit: self.limit }),
        }
    }

    pub fn put_u32(&mut self, value: u32) -> XdrResult<()> {
        self.check_room(4)?;
        self.buf.put_u32(value);
        Ok(())
    }

    pub fn put_u64(&mut self, value: u64) -> XdrResult<()> {
        self.check_room(8)?;
        self.buf.put_u64(value);
        Ok(())
    }

    pub fn put_bool(&mut self, value: bool) -> XdrResult<()> {
        self.put_u32(value as u32)
    }

    /// Fixed-length opaque data: no length prefix, padded.
    pub fn put_fixed_opaque(&mut self, data: &[u8]) -> XdrResult<()> {
        let pad = padding(data.len());
        self.check_room(data.len() + pad)?;
        self.buf.put_slice(data);
        self.buf.put_bytes(0, pad);
        Ok(())
    }

    /// Variable-length opaque data: length prefix, data, padding.
    pub fn put_opaque(&mut self, data: &[u8]) -> XdrResult<()> {
        self.check_room(4 + data.len() + padding(data.len()))?;
        self.put_u32(data.len() as u32)?;
        self.put_fixed_opaque(data)
    }

    pub fn put_array<T, F>(&mut self, items: &[T], mut f: F) -> XdrResult<()>
    where
        F: FnMut(&mut XdrEncoder, &T) -> XdrResult<()>,
    {
        self.put_u32(items.len() as u32)?;
        for item in items {
            f(self, item)?;
        }
        Ok(())
    }
}

pub struct XdrDecoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> XdrDecoder<'a> {
    pub fn new(buf: &'a [u8]) -> XdrDecoder<'a> {
        XdrDecoder { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// The undecoded tail of the input.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn take(&mut self, n: usize) -> XdrResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(XdrError::Truncated {
                needed: n,
                available: self.remaining(),
            });
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    pub fn get_u32(&mut self) -> XdrResult<u32> {
        self.take(4).map(BigEndian::read_u32)
    }

    pub fn get_u64(&mut self) -> XdrResult<u64> {
        self.take(8).map(BigEndian::read_u64)
    }

    pub fn get_bool(&mut self) -> XdrResult<bool> {
        match self.get_u32()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(XdrError::InvalidValue("boolean", other)),
        }
    }

    pub fn get_fixed_opaque(&mut self, len: usize) -> XdrResult<&'a [u8]> {
        let data = self.take(len)?;
        self.take(padding(len))?;
        Ok(data)
    }

    /// Variable-length opaque data of at most `max` bytes.
    pub fn get_opaque(&mut self, max: usize) -> XdrResult<&'a [u8]> {
        let len = self.get_u32()?;
        if len as usize > max {
            return Err(XdrError::InvalidValue("opaque length", len));
        }
        self.get_fixed_opaque(len as usize)
    }

    pub fn get_array<T, F>(&mut self, mut f: F) -> XdrResult<Vec<T>>
    where
        F: FnMut(&mut XdrDecoder<'a>) -> XdrResult<T>,
    {
        let count = self.get_u32()? as usize;
        // every element occupies at least one XDR unit
        if count > self.remaining() / XDR_UNIT {
            return Err(XdrError::Truncated {
                needed: count * XDR_UNIT,
                available: self.remaining(),
            });
        }
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(f(self)?);
        }
        Ok(items)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn opaque_is_padded() {
        let mut enc = XdrEncoder::new(64);
        enc.put_opaque(b"abcde").unwrap();
        assert_eq!(enc.position(), 12);
        assert_eq!(&enc.as_slice()[..4], &[0, 0, 0, 5]);
        assert_eq!(&enc.as_slice()[9..], &[0, 0, 0]);

        let mut dec = XdrDecoder::new(enc.as_slice());
        assert_eq!(dec.get_opaque(16).unwrap(), b"abcde");
        assert_eq!(dec.remaining(), 0);
    }

    #[test]
    fn encoder_fills_exactly_to_limit() {
        let mut enc = XdrEncoder::new(12);
        enc.put_u32(1).unwrap();
        enc.put_u64(2).unwrap();
        assert_eq!(enc.position(), 12);
        assert_eq!(enc.put_bool(true), Err(XdrError::Overflow { limit: 12 }));
        assert_eq!(enc.position(), 12);
    }

    #[test]
    fn opaque_overflow_writes_nothing() {
        let mut enc = XdrEncoder::new(8);
        assert!(enc.put_opaque(b"12345").is_err());
        assert_eq!(enc.position(), 0);
    }

    #[test]
    fn rejects_bad_bool_and_long_opaque() {
        let mut dec = XdrDecoder::new(&[0, 0, 0, 2]);
        assert_eq!(dec.get_bool(), Err(XdrError::InvalidValue("boolean", 2)));

        let mut dec = XdrDecoder::new(&[0, 0, 0, 9, 1, 2, 3, 4]);
        assert!(dec.get_opaque(8).is_err());
    }

    #[test]
    fn array_count_larger_than_input_is_truncated() {
        let mut dec = XdrDecoder::new(&[0xff, 0xff, 0xff, 0xff, 0, 0, 0, 0]);
        let res = dec.get_array(|d| d.get_u32());
        assert!(matches!(res, Err(XdrError::Truncated { .. })));
    }
}
