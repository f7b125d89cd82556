//! Little-endian primitive codec. Decoding walks a borrowed frame with an
//! explicit offset so failures carry the exact position; encoding appends to
//! a `BytesMut`.

use crate::error::{Error, Result};
use bson::Document;
use bytes::{BufMut, BytesMut};

/// Byte cursor over one raw frame. Every read advances `pos` past the bytes
/// it consumed, so decoders compose left to right.
#[derive(Debug)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Cursor positioned past the message header; body layouts start at 16.
    pub fn starting_at(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return Err(Error::TruncatedFrame {
                offset: self.pos,
                needed: n,
            });
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.need(4)?;
        let v = i32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.need(4)?;
        let v = u32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.need(8)?;
        let v = i64::from_le_bytes(self.buf[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        Ok(v)
    }

    /// NUL-terminated UTF-8 string. Rejects (rather than lossily replaces)
    /// invalid UTF-8.
    pub fn read_cstring(&mut self) -> Result<String> {
        let start = self.pos;
        let nul = self.buf[start..]
            .iter()
            .position(|&b| b == 0)
            .ok_or(Error::TruncatedFrame {
                offset: start,
                needed: 1,
            })?;
        let s = std::str::from_utf8(&self.buf[start..start + nul])
            .map_err(|_| Error::InvalidUtf8)?
            .to_string();
        self.pos = start + nul + 1;
        Ok(s)
    }

    /// Length-prefixed BSON blob, handed to the bson codec whole.
    pub fn read_document(&mut self) -> Result<Document> {
        self.need(4)?;
        let len = i32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        if len < 5 {
            return Err(Error::MalformedDocument(format!(
                "document length {} below minimum",
                len
            )));
        }
        self.need(len as usize)?;
        let blob = &self.buf[self.pos..self.pos + len as usize];
        let doc = Document::from_reader(&mut std::io::Cursor::new(blob))?;
        self.pos += len as usize;
        Ok(doc)
    }

    /// Skip `n` bytes without interpreting them.
    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.need(n)?;
        self.pos += n;
        Ok(())
    }
}

pub fn put_cstring(out: &mut BytesMut, s: &str) {
    out.put_slice(s.as_bytes());
    out.put_u8(0);
}

pub fn put_document(out: &mut BytesMut, doc: &Document) -> Result<()> {
    let mut blob = Vec::new();
    doc.to_writer(&mut blob)?;
    out.put_slice(&blob);
    Ok(())
}
