//! Primitive tag-struct get/put codec (§3 "Tag-struct", §1 external
//! collaborator "the tag-structure codec (primitive get/put)").
//!
//! Full coverage of the daemon's entire tail-format zoo is out of scope;
//! this covers the primitives the core itself puts/gets directly: u32,
//! boolean, length-prefixed string, raw byte blobs, and a proplist.

use crate::proplist::Proplist;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TagStructError {
    #[error("tag-struct buffer exhausted")]
    Eof,
    #[error("tag-struct contained invalid UTF-8")]
    InvalidUtf8,
    #[error("tag-struct boolean byte was neither 0 nor 1")]
    InvalidBool,
}

/// A growable byte buffer with primitive put operations, used to build an
/// outbound packet body.
#[derive(Debug, Default, Clone)]
pub struct TagStructWriter {
    buf: Vec<u8>,
}

impl TagStructWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_bool(&mut self, v: bool) -> &mut Self {
        self.buf.push(v as u8);
        self
    }

    /// Length-prefixed UTF-8 string; `None` is encoded as a length of
    /// `u32::MAX` with no following bytes (used for e.g. `EXIT`'s absent
    /// arguments, and a terminator sentinel in `REMOVE_CLIENT_PROPLIST`).
    pub fn put_string(&mut self, v: Option<&str>) -> &mut Self {
        match v {
            None => {
                self.put_u32(std::u32::MAX);
            }
            Some(s) => {
                self.put_u32(s.len() as u32);
                self.buf.extend_from_slice(s.as_bytes());
            }
        }
        self
    }

    pub fn put_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.put_u32(v.len() as u32);
        self.buf.extend_from_slice(v);
        self
    }

    pub fn put_proplist(&mut self, p: &Proplist) -> &mut Self {
        self.put_u32(p.len() as u32);
        for (k, v) in p.iter() {
            self.put_string(Some(k));
            self.put_bytes(v);
        }
        self
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

/// A read cursor over an inbound packet body.
pub struct TagStructReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> TagStructReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// The unread tail of the buffer, as-is. Used by handlers for commands
    /// whose payload past a fixed prefix is an external collaborator's own
    /// format (e.g. `EXTENSION`'s per-extension body).
    pub fn remaining_bytes(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn get_u32(&mut self) -> Result<u32, TagStructError> {
        if self.remaining() < 4 {
            return Err(TagStructError::Eof);
        }
        let bytes = [
            self.buf[self.pos],
            self.buf[self.pos + 1],
            self.buf[self.pos + 2],
            self.buf[self.pos + 3],
        ];
        self.pos += 4;
        Ok(u32::from_be_bytes(bytes))
    }

    pub fn get_bool(&mut self) -> Result<bool, TagStructError> {
        if self.remaining() < 1 {
            return Err(TagStructError::Eof);
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        match b {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(TagStructError::InvalidBool),
        }
    }

    pub fn get_string(&mut self) -> Result<Option<String>, TagStructError> {
        let len = self.get_u32()?;
        if len == std::u32::MAX {
            return Ok(None);
        }
        let len = len as usize;
        if self.remaining() < len {
            return Err(TagStructError::Eof);
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        std::str::from_utf8(bytes)
            .map(|s| Some(s.to_owned()))
            .map_err(|_| TagStructError::InvalidUtf8)
    }

    pub fn get_bytes(&mut self) -> Result<Vec<u8>, TagStructError> {
        let len = self.get_u32()? as usize;
        if self.remaining() < len {
            return Err(TagStructError::Eof);
        }
        let bytes = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(bytes)
    }

    pub fn get_proplist(&mut self) -> Result<Proplist, TagStructError> {
        let count = self.get_u32()?;
        let mut p = Proplist::new();
        for _ in 0..count {
            let key = self.get_string()?.ok_or(TagStructError::Eof)?;
            let value = self.get_bytes()?;
            p.set(&key, &value);
        }
        Ok(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_primitives() {
        let mut w = TagStructWriter::new();
        w.put_u32(42).put_bool(true).put_string(Some("hello")).put_bytes(&[1, 2, 3]);
        let bytes = w.into_bytes();

        let mut r = TagStructReader::new(&bytes);
        assert_eq!(r.get_u32().unwrap(), 42);
        assert_eq!(r.get_bool().unwrap(), true);
        assert_eq!(r.get_string().unwrap(), Some("hello".to_owned()));
        assert_eq!(r.get_bytes().unwrap(), vec![1, 2, 3]);
        assert!(r.is_empty());
    }

    #[test]
    fn none_string_round_trips_as_sentinel() {
        let mut w = TagStructWriter::new();
        w.put_string(None);
        let bytes = w.into_bytes();
        let mut r = TagStructReader::new(&bytes);
        assert_eq!(r.get_string().unwrap(), None);
    }

    #[test]
    fn proplist_round_trips() {
        let mut p = Proplist::new();
        p.set_str("a", "1");
        p.set_str("b", "2");

        let mut w = TagStructWriter::new();
        w.put_proplist(&p);
        let bytes = w.into_bytes();

        let mut r = TagStructReader::new(&bytes);
        let decoded = r.get_proplist().unwrap();
        assert_eq!(decoded, p);
    }

    #[test]
    fn reading_past_end_is_an_error() {
        let bytes = [0u8, 0, 0, 1]; // len=1, but no payload byte follows
        let mut r = TagStructReader::new(&bytes);
        assert_eq!(r.get_string(), Err(TagStructError::Eof));
    }
}
