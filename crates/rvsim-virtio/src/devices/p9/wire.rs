//! 9P2000.L wire format.
//!
//! Little-endian throughout. Field codes, matching the protocol
//! documentation: `b` u8, `h` u16, `w` u32, `d` u64, `s` length-prefixed
//! UTF-8 string (u16 length, no NUL), `Q` 13-byte qid.

use thiserror::Error;

pub const QID_SIZE: usize = 13;

/// Server-assigned file identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Qid {
    pub kind: u8,
    pub version: u32,
    pub path: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("truncated 9p message")]
    Truncated,

    #[error("9p string is not valid utf-8")]
    BadString,
}

pub type WireResult<T> = std::result::Result<T, WireError>;

/// Cursor over a request payload.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn get_bytes(&mut self, len: usize) -> WireResult<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(WireError::Truncated)?;
        let bytes = self.buf.get(self.pos..end).ok_or(WireError::Truncated)?;
        self.pos = end;
        Ok(bytes)
    }

    pub fn get_u8(&mut self) -> WireResult<u8> {
        Ok(self.get_bytes(1)?[0])
    }

    pub fn get_u16(&mut self) -> WireResult<u16> {
        Ok(u16::from_le_bytes(self.get_bytes(2)?.try_into().unwrap()))
    }

    pub fn get_u32(&mut self) -> WireResult<u32> {
        Ok(u32::from_le_bytes(self.get_bytes(4)?.try_into().unwrap()))
    }

    pub fn get_u64(&mut self) -> WireResult<u64> {
        Ok(u64::from_le_bytes(self.get_bytes(8)?.try_into().unwrap()))
    }

    pub fn get_str(&mut self) -> WireResult<String> {
        let len = usize::from(self.get_u16()?);
        let bytes = self.get_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::BadString)
    }

    pub fn get_qid(&mut self) -> WireResult<Qid> {
        Ok(Qid {
            kind: self.get_u8()?,
            version: self.get_u32()?,
            path: self.get_u64()?,
        })
    }
}

/// Reply payload builder.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u8(&mut self, val: u8) {
        self.buf.push(val);
    }

    pub fn put_u16(&mut self, val: u16) {
        self.buf.extend_from_slice(&val.to_le_bytes());
    }

    pub fn put_u32(&mut self, val: u32) {
        self.buf.extend_from_slice(&val.to_le_bytes());
    }

    pub fn put_u64(&mut self, val: u64) {
        self.buf.extend_from_slice(&val.to_le_bytes());
    }

    pub fn put_str(&mut self, val: &str) {
        self.put_u16(val.len() as u16);
        self.buf.extend_from_slice(val.as_bytes());
    }

    pub fn put_qid(&mut self, qid: &Qid) {
        self.put_u8(qid.kind);
        self.put_u32(qid.version);
        self.put_u64(qid.path);
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn truncated_reads_fail() {
        let mut rd = Reader::new(&[0x01, 0x02]);
        assert_eq!(rd.get_u16().unwrap(), 0x0201);
        assert_eq!(rd.get_u8().unwrap_err(), WireError::Truncated);
    }

    #[test]
    fn string_length_prefix_beyond_buffer_fails() {
        // Claims 100 bytes, carries 2.
        let mut rd = Reader::new(&[100, 0, b'h', b'i']);
        assert_eq!(rd.get_str().unwrap_err(), WireError::Truncated);
    }

    #[test]
    fn invalid_utf8_string_fails() {
        let mut rd = Reader::new(&[2, 0, 0xff, 0xfe]);
        assert_eq!(rd.get_str().unwrap_err(), WireError::BadString);
    }

    proptest! {
        #[test]
        fn scalar_roundtrip(b: u8, h: u16, w: u32, d: u64) {
            let mut wr = Writer::new();
            wr.put_u8(b);
            wr.put_u16(h);
            wr.put_u32(w);
            wr.put_u64(d);

            let buf = wr.into_vec();
            let mut rd = Reader::new(&buf);
            prop_assert_eq!(rd.get_u8().unwrap(), b);
            prop_assert_eq!(rd.get_u16().unwrap(), h);
            prop_assert_eq!(rd.get_u32().unwrap(), w);
            prop_assert_eq!(rd.get_u64().unwrap(), d);
            prop_assert_eq!(rd.remaining(), 0);
        }

        #[test]
        fn string_roundtrip(s in "\\PC{0,64}") {
            let mut wr = Writer::new();
            wr.put_str(&s);

            let buf = wr.into_vec();
            let mut rd = Reader::new(&buf);
            prop_assert_eq!(rd.get_str().unwrap(), s);
        }

        #[test]
        fn qid_roundtrip(kind: u8, version: u32, path: u64) {
            let qid = Qid { kind, version, path };
            let mut wr = Writer::new();
            wr.put_qid(&qid);

            let buf = wr.into_vec();
            prop_assert_eq!(buf.len(), QID_SIZE);
            let mut rd = Reader::new(&buf);
            prop_assert_eq!(rd.get_qid().unwrap(), qid);
        }
    }
}
