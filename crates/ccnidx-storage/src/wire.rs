//! ccnb binary XML codec for names and exclusion filters.
//!
//! Only the handful of elements the index touches are understood:
//!
//! ```text
//! Name     := DTAG(14) Component* CLOSE
//! Component:= DTAG(15) [BLOB] CLOSE
//! Exclude  := DTAG(17) (Component | Any | Bloom)* CLOSE
//! Any      := DTAG(13) CLOSE
//! Bloom    := DTAG(16) BLOB CLOSE
//! ```
//!
//! A tag/value header encodes an unsigned value and a 3-bit type. The value
//! is split into a low 4-bit group carried by the final byte (which has its
//! high bit set) and preceding 7-bit groups, most significant first, with
//! the high bit clear:
//!
//! ```text
//! 0vvvvvvv ... 0vvvvvvv 1vvvvttt
//! ```
//!
//! A lone zero byte closes the current element.

use ccnidx_common::{CcnxError, Result};

/// Header type: dictionary tag.
pub const TT_DTAG: u8 = 2;
/// Header type: binary blob.
pub const TT_BLOB: u8 = 5;
/// Header type: UTF-8 data.
pub const TT_UDATA: u8 = 6;

/// Closes the current element.
pub const CLOSE: u8 = 0;

/// Dictionary tag for `Any`.
pub const DTAG_ANY: u32 = 13;
/// Dictionary tag for `Name`.
pub const DTAG_NAME: u32 = 14;
/// Dictionary tag for `Component`.
pub const DTAG_COMPONENT: u32 = 15;
/// Dictionary tag for `Bloom`.
pub const DTAG_BLOOM: u32 = 16;
/// Dictionary tag for `Exclude`.
pub const DTAG_EXCLUDE: u32 = 17;

/// Appends a tag/value header.
pub fn encode_header(dst: &mut Vec<u8>, value: usize, tt: u8) {
    let mut groups = [0u8; 10];
    let mut n = 0;
    let mut rest = value >> 4;
    while rest > 0 {
        groups[n] = (rest & 0x7F) as u8;
        rest >>= 7;
        n += 1;
    }
    for i in (0..n).rev() {
        dst.push(groups[i]);
    }
    dst.push(0x80 | (((value & 0x0F) as u8) << 3) | (tt & 0x07));
}

/// Decodes a tag/value header at `pos`. Returns (value, type, next position).
pub fn decode_header(buf: &[u8], pos: usize) -> Result<(usize, u8, usize)> {
    let mut value: usize = 0;
    let mut i = pos;
    loop {
        let b = *buf
            .get(i)
            .ok_or_else(|| CcnxError::InvalidWireName(format!("truncated header at {}", pos)))?;
        i += 1;
        if b & 0x80 != 0 {
            value = (value << 4) | ((b >> 3) & 0x0F) as usize;
            return Ok((value, b & 0x07, i));
        }
        if i - pos == 1 && b == CLOSE {
            return Err(CcnxError::InvalidWireName(format!(
                "unexpected close at {}",
                pos
            )));
        }
        if value > (usize::MAX >> 11) {
            return Err(CcnxError::InvalidWireName(format!(
                "header overflow at {}",
                pos
            )));
        }
        value = (value << 7) | b as usize;
    }
}

/// Incremental ccnb encoder.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    /// Creates an empty encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens an element with a dictionary tag.
    pub fn open(&mut self, dtag: u32) -> &mut Self {
        encode_header(&mut self.buf, dtag as usize, TT_DTAG);
        self
    }

    /// Appends a BLOB value.
    pub fn blob(&mut self, data: &[u8]) -> &mut Self {
        encode_header(&mut self.buf, data.len(), TT_BLOB);
        self.buf.extend_from_slice(data);
        self
    }

    /// Closes the innermost element.
    pub fn close(&mut self) -> &mut Self {
        self.buf.push(CLOSE);
        self
    }

    /// Appends a complete `<dtag>BLOB</dtag>` element; an empty blob is
    /// written as an element with no content.
    pub fn blob_element(&mut self, dtag: u32, data: &[u8]) -> &mut Self {
        self.open(dtag);
        if !data.is_empty() {
            self.blob(data);
        }
        self.close()
    }

    /// Returns the encoded bytes.
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over ccnb bytes.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    /// Creates a decoder positioned at the start of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current byte offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Returns true if the next byte closes the current element.
    pub fn at_close(&self) -> bool {
        self.buf.get(self.pos) == Some(&CLOSE)
    }

    /// Returns the dictionary tag of the next element without consuming it.
    pub fn peek_dtag(&self) -> Option<u32> {
        if self.at_close() {
            return None;
        }
        match decode_header(self.buf, self.pos) {
            Ok((value, TT_DTAG, _)) => u32::try_from(value).ok(),
            _ => None,
        }
    }

    /// Consumes the opening header of an element with the given tag.
    pub fn enter(&mut self, dtag: u32) -> Result<()> {
        let (value, tt, next) = decode_header(self.buf, self.pos)?;
        if tt != TT_DTAG || value != dtag as usize {
            return Err(CcnxError::InvalidWireName(format!(
                "expected element {} at offset {}",
                dtag, self.pos
            )));
        }
        self.pos = next;
        Ok(())
    }

    /// Consumes a close marker.
    pub fn close(&mut self) -> Result<()> {
        if !self.at_close() {
            return Err(CcnxError::InvalidWireName(format!(
                "expected close at offset {}",
                self.pos
            )));
        }
        self.pos += 1;
        Ok(())
    }

    /// Consumes optional BLOB or UDATA content, returning the bytes
    /// (empty if the element has no content).
    pub fn content(&mut self) -> Result<&'a [u8]> {
        if self.at_close() {
            return Ok(&[]);
        }
        let (len, tt, next) = decode_header(self.buf, self.pos)?;
        if tt != TT_BLOB && tt != TT_UDATA {
            return Err(CcnxError::InvalidWireName(format!(
                "expected blob at offset {}",
                self.pos
            )));
        }
        let end = next
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                CcnxError::InvalidWireName(format!("blob overruns buffer at {}", self.pos))
            })?;
        self.pos = end;
        Ok(&self.buf[next..end])
    }

    /// Reads a complete `<dtag>content</dtag>` element.
    pub fn blob_element(&mut self, dtag: u32) -> Result<&'a [u8]> {
        self.enter(dtag)?;
        let data = self.content()?;
        self.close()?;
        Ok(data)
    }
}

/// Encodes a Name element from its components.
pub fn encode_name<I, C>(components: I) -> Vec<u8>
where
    I: IntoIterator<Item = C>,
    C: AsRef<[u8]>,
{
    let mut enc = Encoder::new();
    enc.open(DTAG_NAME);
    for comp in components {
        enc.blob_element(DTAG_COMPONENT, comp.as_ref());
    }
    enc.close();
    enc.finish()
}

/// Decodes a Name element into borrowed components.
pub fn name_components(wire: &[u8]) -> Result<Vec<&[u8]>> {
    let mut dec = Decoder::new(wire);
    dec.enter(DTAG_NAME)?;
    let mut comps = Vec::new();
    while dec.peek_dtag() == Some(DTAG_COMPONENT) {
        comps.push(dec.blob_element(DTAG_COMPONENT)?);
    }
    dec.close()?;
    Ok(comps)
}

/// One child of an Exclude element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExcludeItem<'a> {
    /// Literal fence-post component.
    Component(&'a [u8]),
    /// Excludes everything in the gap it occupies.
    Any,
    /// Bloom filter (wire bytes) over the gap it occupies.
    Bloom(&'a [u8]),
}

/// Encodes an Exclude element.
pub fn encode_exclude(items: &[ExcludeItem<'_>]) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.open(DTAG_EXCLUDE);
    for item in items {
        match item {
            ExcludeItem::Component(c) => {
                enc.blob_element(DTAG_COMPONENT, c);
            }
            ExcludeItem::Any => {
                enc.open(DTAG_ANY).close();
            }
            ExcludeItem::Bloom(b) => {
                enc.blob_element(DTAG_BLOOM, b);
            }
        }
    }
    enc.close();
    enc.finish()
}

/// Decodes an Exclude element into its children.
pub fn exclude_items(wire: &[u8]) -> Result<Vec<ExcludeItem<'_>>> {
    let mut dec = Decoder::new(wire);
    dec.enter(DTAG_EXCLUDE)?;
    let mut items = Vec::new();
    loop {
        match dec.peek_dtag() {
            Some(DTAG_COMPONENT) => items.push(ExcludeItem::Component(
                dec.blob_element(DTAG_COMPONENT)?,
            )),
            Some(DTAG_ANY) => {
                dec.enter(DTAG_ANY)?;
                dec.close()?;
                items.push(ExcludeItem::Any);
            }
            Some(DTAG_BLOOM) => items.push(ExcludeItem::Bloom(dec.blob_element(DTAG_BLOOM)?)),
            Some(other) => {
                return Err(CcnxError::InvalidWireName(format!(
                    "unexpected element {} in Exclude",
                    other
                )));
            }
            None => break,
        }
    }
    dec.close()?;
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_single_byte() {
        let mut buf = Vec::new();
        encode_header(&mut buf, DTAG_NAME as usize, TT_DTAG);
        assert_eq!(buf, vec![0xF2]);

        buf.clear();
        encode_header(&mut buf, DTAG_COMPONENT as usize, TT_DTAG);
        assert_eq!(buf, vec![0xFA]);
    }

    #[test]
    fn test_header_multi_byte() {
        let mut buf = Vec::new();
        encode_header(&mut buf, 100, TT_BLOB);
        assert_eq!(buf, vec![0x06, 0xA5]);
        assert_eq!(decode_header(&buf, 0).unwrap(), (100, TT_BLOB, 2));

        for value in [0usize, 15, 16, 2047, 2048, 1 << 20, 70_000_000] {
            buf.clear();
            encode_header(&mut buf, value, TT_BLOB);
            assert_eq!(decode_header(&buf, 0).unwrap(), (value, TT_BLOB, buf.len()));
        }
    }

    #[test]
    fn test_decode_header_truncated() {
        assert!(decode_header(&[0x06], 0).is_err());
        assert!(decode_header(&[], 0).is_err());
        assert!(decode_header(&[CLOSE], 0).is_err());
    }

    #[test]
    fn test_name_roundtrip() {
        let comps: Vec<&[u8]> = vec![&b"parc"[..], &b""[..], &b"x"[..]];
        let wire = encode_name(&comps);
        assert_eq!(wire[0], 0xF2);
        assert_eq!(*wire.last().unwrap(), CLOSE);
        assert_eq!(name_components(&wire).unwrap(), comps);
    }

    #[test]
    fn test_empty_name() {
        let wire = encode_name(Vec::<Vec<u8>>::new());
        assert_eq!(wire, vec![0xF2, CLOSE]);
        assert!(name_components(&wire).unwrap().is_empty());
    }

    #[test]
    fn test_name_rejects_garbage() {
        assert!(name_components(&[0xFA, CLOSE]).is_err());
        // Missing close
        let mut wire = encode_name([b"a"]);
        wire.pop();
        assert!(name_components(&wire).is_err());
        // Blob longer than buffer
        assert!(name_components(&[0xF2, 0xFA, 0xAD, b'a', CLOSE]).is_err());
    }

    #[test]
    fn test_exclude_roundtrip() {
        let bloom = [3u8, 1, b'A', 0, 0, 0, 0, 0, 0xFF];
        let items = vec![
            ExcludeItem::Any,
            ExcludeItem::Component(b"b"),
            ExcludeItem::Bloom(&bloom),
            ExcludeItem::Component(b"d"),
        ];
        let wire = encode_exclude(&items);
        assert_eq!(exclude_items(&wire).unwrap(), items);
    }

    #[test]
    fn test_exclude_rejects_foreign_element() {
        let mut enc = Encoder::new();
        enc.open(DTAG_EXCLUDE);
        enc.blob_element(DTAG_NAME, b"x");
        enc.close();
        assert!(exclude_items(&enc.finish()).is_err());
    }

    #[test]
    fn test_decoder_position_tracking() {
        let wire = encode_name([b"ab"]);
        let mut dec = Decoder::new(&wire);
        dec.enter(DTAG_NAME).unwrap();
        assert_eq!(dec.position(), 1);
        assert_eq!(dec.peek_dtag(), Some(DTAG_COMPONENT));
        assert_eq!(dec.blob_element(DTAG_COMPONENT).unwrap(), b"ab");
        assert!(dec.at_close());
        dec.close().unwrap();
        assert_eq!(dec.position(), wire.len());
    }
}
