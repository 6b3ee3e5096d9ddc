//! Flatname codec.
//!
//! A flatname is a name flattened into a single byte string: each component
//! is preceded by a self-delimiting length tag. The tag carries the
//! component length in 7-bit groups, most significant group first, with the
//! high bit set on every byte except the last:
//!
//! ```text
//! len < 2^7    0lllllll
//! len < 2^14   1lllllll 0lllllll
//! len < 2^21   1lllllll 1lllllll 0lllllll
//! ```
//!
//! Tags must be minimal, so a multi-byte tag never starts with `0x80`.
//! Within the one- and two-byte tiers, plain byte comparison of flatnames
//! gives canonical name order (component by component, shorter component
//! first, then bytewise), and a name prefix is always a byte prefix.

use crate::wire;
use ccnidx_common::{CcnxError, Result};
use std::cmp::Ordering;

/// Largest component a flatname can carry.
pub const MAX_COMPONENT_SIZE: usize = (1 << 21) - 1;

/// Longest length tag in bytes.
pub const MAX_TAG_SIZE: usize = 3;

/// Relationship between two flatnames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlatOrdering {
    /// `a` sorts before `b` and is not a prefix of it.
    Less,
    /// `a` is a proper prefix of `b`.
    StrictPrefix,
    /// Byte-identical.
    Equal,
    /// `b` is a proper prefix of `a`.
    StrictReversePrefix,
    /// `a` sorts after `b` and `b` is not a prefix of it.
    Greater,
}

impl FlatOrdering {
    /// Collapses the prefix relations into a plain ordering.
    pub fn to_ordering(self) -> Ordering {
        match self {
            FlatOrdering::Less | FlatOrdering::StrictPrefix => Ordering::Less,
            FlatOrdering::Equal => Ordering::Equal,
            FlatOrdering::StrictReversePrefix | FlatOrdering::Greater => Ordering::Greater,
        }
    }

    /// True when the first operand is equal to, or a prefix of, the second.
    pub fn is_prefix(self) -> bool {
        matches!(self, FlatOrdering::Equal | FlatOrdering::StrictPrefix)
    }
}

/// Location of one component inside a flatname.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentSpan {
    /// Size of the length tag.
    pub delim: usize,
    /// Size of the component data.
    pub len: usize,
}

impl ComponentSpan {
    /// Tag plus data.
    #[inline]
    pub fn total(&self) -> usize {
        self.delim + self.len
    }
}

/// Appends one length-tagged component.
pub fn append_component(dst: &mut Vec<u8>, comp: &[u8]) -> Result<()> {
    let size = comp.len();
    if size > MAX_COMPONENT_SIZE {
        return Err(CcnxError::ComponentTooLarge {
            size,
            max: MAX_COMPONENT_SIZE,
        });
    }
    let mut tag = [0u8; MAX_TAG_SIZE];
    let mut n = MAX_TAG_SIZE;
    let mut rest = size;
    let mut cont = 0u8;
    loop {
        n -= 1;
        tag[n] = (rest & 0x7F) as u8 | cont;
        rest >>= 7;
        cont = 0x80;
        if rest == 0 {
            break;
        }
    }
    dst.try_reserve(MAX_TAG_SIZE - n + size)
        .map_err(|_| CcnxError::AllocationFailed {
            bytes: MAX_TAG_SIZE - n + size,
        })?;
    dst.extend_from_slice(&tag[n..]);
    dst.extend_from_slice(comp);
    Ok(())
}

/// Parses the component starting at `pos`.
///
/// Returns `None` at the end of the flatname.
pub fn next_component(flat: &[u8], pos: usize) -> Result<Option<ComponentSpan>> {
    if pos >= flat.len() {
        return Ok(None);
    }
    let mut len = 0usize;
    let mut delim = 0usize;
    loop {
        let b = match flat.get(pos + delim) {
            Some(b) => *b,
            None => return Err(CcnxError::TruncatedFlatname { offset: pos }),
        };
        if delim == MAX_TAG_SIZE || (delim == 0 && b == 0x80) {
            return Err(CcnxError::InvalidLengthTag { offset: pos });
        }
        len = (len << 7) | (b & 0x7F) as usize;
        delim += 1;
        if b & 0x80 == 0 {
            break;
        }
    }
    if flat.len() - pos - delim < len {
        return Err(CcnxError::TruncatedFlatname { offset: pos });
    }
    Ok(Some(ComponentSpan { delim, len }))
}

/// Iterator over the components of a flatname.
///
/// Yields an error once and then stops if the flatname is malformed.
#[derive(Debug, Clone)]
pub struct Components<'a> {
    flat: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> Components<'a> {
    /// Byte offset of the next component.
    pub fn position(&self) -> usize {
        self.pos
    }
}

impl<'a> Iterator for Components<'a> {
    type Item = Result<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match next_component(self.flat, self.pos) {
            Ok(Some(span)) => {
                let start = self.pos + span.delim;
                self.pos += span.total();
                Some(Ok(&self.flat[start..start + span.len]))
            }
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Iterates over the components of `flat`.
pub fn components(flat: &[u8]) -> Components<'_> {
    Components {
        flat,
        pos: 0,
        failed: false,
    }
}

/// Number of components, validating every tag.
pub fn component_count(flat: &[u8]) -> Result<usize> {
    let mut count = 0;
    for comp in components(flat) {
        comp?;
        count += 1;
    }
    Ok(count)
}

/// Returns component `index`, or `None` if the flatname is shorter.
pub fn component_at(flat: &[u8], index: usize) -> Result<Option<&[u8]>> {
    components(flat).nth(index).transpose()
}

/// Byte length of the first `ncomps` components (clamped to the flatname).
pub fn prefix_len(flat: &[u8], ncomps: usize) -> Result<usize> {
    let mut pos = 0;
    for _ in 0..ncomps {
        match next_component(flat, pos)? {
            Some(span) => pos += span.total(),
            None => break,
        }
    }
    Ok(pos)
}

/// Compares two flatnames bytewise, distinguishing the prefix cases.
pub fn compare(a: &[u8], b: &[u8]) -> FlatOrdering {
    let common = a.len().min(b.len());
    match a[..common].cmp(&b[..common]) {
        Ordering::Less => FlatOrdering::Less,
        Ordering::Greater => FlatOrdering::Greater,
        Ordering::Equal => match a.len().cmp(&b.len()) {
            Ordering::Less => FlatOrdering::StrictPrefix,
            Ordering::Equal => FlatOrdering::Equal,
            Ordering::Greater => FlatOrdering::StrictReversePrefix,
        },
    }
}

/// Builds a flatname from raw components.
pub fn from_components<I, C>(comps: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = C>,
    C: AsRef<[u8]>,
{
    let mut flat = Vec::new();
    for comp in comps {
        append_component(&mut flat, comp.as_ref())?;
    }
    Ok(flat)
}

/// Appends components of a ccnb `Name` to `dst`.
///
/// The first `skip` components are ignored and at most `count` are appended
/// (all remaining ones if `None`). Returns the number appended. On error
/// `dst` is left as it was.
pub fn from_wire_name(
    dst: &mut Vec<u8>,
    wire_name: &[u8],
    skip: usize,
    count: Option<usize>,
) -> Result<usize> {
    let comps = wire::name_components(wire_name)?;
    let limit = count.unwrap_or(usize::MAX);
    let saved = dst.len();
    let mut appended = 0;
    for comp in comps.into_iter().skip(skip).take(limit) {
        if let Err(e) = append_component(dst, comp) {
            dst.truncate(saved);
            return Err(e);
        }
        appended += 1;
    }
    Ok(appended)
}

/// Encodes components of a flatname as a ccnb `Name`.
///
/// `skip` and `count` select a window of components as in
/// [`from_wire_name`].
pub fn to_wire_name(flat: &[u8], skip: usize, count: Option<usize>) -> Result<Vec<u8>> {
    let limit = count.unwrap_or(usize::MAX);
    let mut selected = Vec::new();
    for comp in components(flat).skip(skip).take(limit) {
        selected.push(comp?);
    }
    Ok(wire::encode_name(selected))
}
