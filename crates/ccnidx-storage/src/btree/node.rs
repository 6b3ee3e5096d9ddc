//! Node record and byte-layout codec.
//!
//! A [`Node`] owns a growable buffer in the layout described in
//! [`super::types`]. Keys are stored as up to two pieces in the shared key
//! region; a new key reuses the longest prefix it shares with a neighbouring
//! entry and appends only the remainder. Key bytes are never rewritten in
//! place, so pieces of different entries may overlap freely.
//!
//! The buffer also tracks a clean watermark: bytes below it are known to
//! match the persistent copy, so a write-back only has to rewrite the tail.

use super::constants::{
    CONTENT_MAGIC, ENTRY_UNIT, INTERNAL_MAGIC, MAX_ENTRY_SIZE, MAX_HEADER_EXT, TRAILER_SIZE,
    UNDERFULL_DIVISOR,
};
use super::types::{EntryTrailer, InternalPayload, NodeEntry, NodeHeader, SearchResult};
use crate::flatname::FlatOrdering;
use bytes::Bytes;
use ccnidx_common::{CcnxError, NodeId, NodeKind, Result, TreeConfig};

/// Opaque handle a storage backend attaches to an open node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoHandle(pub u64);

/// Derived positions of the entry array.
#[derive(Debug, Clone, Copy)]
struct Layout {
    header: usize,
    keys_end: usize,
    count: usize,
    esize: usize,
}

impl Layout {
    #[inline]
    fn entry_offset(&self, index: usize) -> usize {
        self.keys_end + index * self.esize
    }

    #[inline]
    fn trailer_offset(&self, index: usize) -> usize {
        self.entry_offset(index) + self.esize - TRAILER_SIZE
    }
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Compares `key` with the concatenation `p0 ++ p1`.
fn compare_pieces(key: &[u8], p0: &[u8], p1: &[u8]) -> FlatOrdering {
    let n0 = key.len().min(p0.len());
    match key[..n0].cmp(&p0[..n0]) {
        std::cmp::Ordering::Less => return FlatOrdering::Less,
        std::cmp::Ordering::Greater => return FlatOrdering::Greater,
        std::cmp::Ordering::Equal => {}
    }
    if key.len() < p0.len() {
        return FlatOrdering::StrictPrefix;
    }
    crate::flatname::compare(&key[p0.len()..], p1)
}

/// A resident B-tree node.
#[derive(Debug)]
pub struct Node {
    id: NodeId,
    buf: Vec<u8>,
    /// Bytes below this offset match storage.
    clean: usize,
    /// Length of the persistent copy.
    io_len: usize,
    parent: NodeId,
    capacity: usize,
    corrupt: Option<String>,
    io: Option<IoHandle>,
}

impl Node {
    /// Creates an empty, uninitialized node record.
    pub fn new(id: NodeId, capacity: usize) -> Self {
        Self {
            id,
            buf: Vec::new(),
            clean: 0,
            io_len: 0,
            parent: NodeId::NONE,
            capacity,
            corrupt: None,
            io: None,
        }
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The raw node buffer.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True if the buffer holds nothing (not yet read or initialized).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Hard cap on the buffer size.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Offset below which the buffer matches storage.
    #[inline]
    pub fn clean_offset(&self) -> usize {
        self.clean
    }

    /// Length of the persistent copy as last read or written.
    pub fn persisted_len(&self) -> usize {
        self.io_len
    }

    /// True if storage does not yet reflect the buffer.
    pub fn is_dirty(&self) -> bool {
        self.clean < self.buf.len() || self.io_len != self.buf.len()
    }

    /// Storage handle, if the node is open.
    pub fn io(&self) -> Option<IoHandle> {
        self.io
    }

    pub fn set_io(&mut self, io: Option<IoHandle>) {
        self.io = io;
    }

    /// Last known parent, used as a hint for upward navigation.
    pub fn parent_hint(&self) -> NodeId {
        self.parent
    }

    pub fn set_parent_hint(&mut self, parent: NodeId) {
        self.parent = parent;
    }

    pub fn is_corrupt(&self) -> bool {
        self.corrupt.is_some()
    }

    pub fn corrupt_reason(&self) -> Option<&str> {
        self.corrupt.as_deref()
    }

    /// Flags the node as corrupt; later reads and mutations fail.
    ///
    /// Returns the corresponding error for convenient propagation.
    pub fn mark_corrupt(&mut self, reason: impl Into<String>) -> CcnxError {
        let reason = reason.into();
        let err = CcnxError::NodeCorrupt {
            node_id: self.id.get(),
            reason: reason.clone(),
        };
        if self.corrupt.is_none() {
            self.corrupt = Some(reason);
        }
        err
    }

    fn corrupt_error(&self, reason: impl Into<String>) -> CcnxError {
        CcnxError::NodeCorrupt {
            node_id: self.id.get(),
            reason: reason.into(),
        }
    }

    #[inline]
    fn lower_clean(&mut self, offset: usize) {
        self.clean = self.clean.min(offset);
    }

    /// Bytes that must be written back.
    pub(crate) fn unclean(&self) -> &[u8] {
        &self.buf[self.clean.min(self.buf.len())..]
    }

    /// Appends bytes fetched from storage beyond the clean offset.
    pub(crate) fn extend_from_storage(&mut self, data: &[u8], stored_len: usize) -> Result<()> {
        self.buf.truncate(self.clean);
        self.buf
            .try_reserve(data.len())
            .map_err(|_| CcnxError::AllocationFailed { bytes: data.len() })?;
        self.buf.extend_from_slice(data);
        self.clean = self.buf.len();
        self.io_len = stored_len;
        Ok(())
    }

    /// Records that storage now matches the buffer.
    pub(crate) fn mark_persisted(&mut self) {
        self.clean = self.buf.len();
        self.io_len = self.buf.len();
    }

    /// Takes over the buffer of a rebuilt node.
    ///
    /// The clean watermark only drops to the first byte that differs, so an
    /// unchanged prefix is not rewritten.
    pub(crate) fn replace_contents(&mut self, rebuilt: Node) {
        let same = common_prefix(&self.buf, &rebuilt.buf);
        self.buf = rebuilt.buf;
        self.lower_clean(same);
    }

    /// Empties the node; the next write-back truncates its storage.
    pub(crate) fn discard(&mut self) {
        self.buf.clear();
        self.clean = 0;
    }

    fn header(&self) -> Option<NodeHeader> {
        (self.buf.len() >= NodeHeader::SIZE).then(|| NodeHeader::from_bytes(&self.buf))
    }

    /// Tree level (0 for leaves).
    pub fn level(&self) -> u8 {
        self.header().map(|h| h.level).unwrap_or(0)
    }

    /// Node kind from the header.
    pub fn kind(&self) -> Option<NodeKind> {
        self.header().and_then(|h| h.node_kind())
    }

    /// Header size including the extension.
    pub fn header_size(&self) -> usize {
        self.header().map(|h| h.total_size()).unwrap_or(0)
    }

    /// The header extension bytes.
    pub fn header_ext(&self) -> &[u8] {
        let end = self.header_size().min(self.buf.len());
        &self.buf[NodeHeader::SIZE.min(end)..end]
    }

    fn last_trailer(&self) -> Option<EntryTrailer> {
        let header = self.header_size();
        if header == 0 || self.buf.len() < header + TRAILER_SIZE {
            return None;
        }
        Some(EntryTrailer::from_bytes(
            &self.buf[self.buf.len() - TRAILER_SIZE..],
        ))
    }

    /// Number of entries, from the last trailer.
    pub fn entry_count(&self) -> usize {
        self.last_trailer().map(|t| t.index as usize + 1).unwrap_or(0)
    }

    /// Size of each entry in bytes (0 for an empty node).
    pub fn entry_size(&self) -> usize {
        self.last_trailer().map(|t| t.entry_size()).unwrap_or(0)
    }

    /// Size of each entry's payload (0 for an empty node).
    pub fn payload_size(&self) -> usize {
        self.entry_size().saturating_sub(TRAILER_SIZE)
    }

    fn layout(&self) -> Result<Layout> {
        if let Some(reason) = &self.corrupt {
            return Err(self.corrupt_error(reason.clone()));
        }
        let header = self.header_size();
        if header == 0 {
            return Err(self.corrupt_error("node not initialized"));
        }
        if header > self.buf.len() {
            return Err(self.corrupt_error("header extension overruns node"));
        }
        let count = self.entry_count();
        let esize = self.entry_size();
        if count > 0 && esize < TRAILER_SIZE {
            return Err(self.corrupt_error(format!("entry size {} below trailer size", esize)));
        }
        let keys_end = self
            .buf
            .len()
            .checked_sub(count * esize)
            .filter(|end| *end >= header)
            .ok_or_else(|| {
                self.corrupt_error(format!("{} entries of {} bytes overlap the header", count, esize))
            })?;
        Ok(Layout {
            header,
            keys_end,
            count,
            esize,
        })
    }

    fn trailer_at(&self, lay: &Layout, index: usize) -> EntryTrailer {
        EntryTrailer::from_bytes(&self.buf[lay.trailer_offset(index)..])
    }

    fn checked_index(&self, lay: &Layout, index: usize) -> Result<()> {
        if index >= lay.count {
            return Err(CcnxError::IndexOutOfRange {
                node_id: self.id.get(),
                index,
                count: lay.count,
            });
        }
        Ok(())
    }

    fn piece(&self, lay: &Layout, off: u32, len: u16) -> Result<&[u8]> {
        let (off, len) = (off as usize, len as usize);
        if len == 0 {
            return Ok(&[]);
        }
        if off < lay.header || off + len > lay.keys_end {
            return Err(self.corrupt_error(format!(
                "key piece {}..{} outside key region {}..{}",
                off,
                off + len,
                lay.header,
                lay.keys_end
            )));
        }
        Ok(&self.buf[off..off + len])
    }

    /// The two key pieces of an entry, bounds-checked against the key region.
    fn pieces(&self, lay: &Layout, t: &EntryTrailer) -> Result<(&[u8], &[u8])> {
        Ok((
            self.piece(lay, t.key_off0, t.key_len0)?,
            self.piece(lay, t.key_off1, t.key_len1)?,
        ))
    }

    /// Initializes an empty node at the given level.
    ///
    /// `ext` becomes the header extension and must be a multiple of 8 bytes.
    pub fn init(&mut self, level: u8, kind: NodeKind, ext: &[u8]) -> Result<()> {
        if let Some(reason) = &self.corrupt {
            return Err(self.corrupt_error(reason.clone()));
        }
        if ext.len() % ENTRY_UNIT != 0 || ext.len() > MAX_HEADER_EXT {
            return Err(CcnxError::ContractViolation(format!(
                "header extension of {} bytes",
                ext.len()
            )));
        }
        let header = NodeHeader::new(kind, level, (ext.len() / ENTRY_UNIT) as u8);
        let size = header.total_size();
        if size > self.capacity {
            return Err(CcnxError::NodeFull {
                node_id: self.id.get(),
            });
        }
        let unchanged = self.buf.len() >= size
            && self.buf[..NodeHeader::SIZE] == header.to_bytes()
            && &self.buf[NodeHeader::SIZE..size] == ext;
        self.buf.clear();
        self.buf
            .try_reserve(size)
            .map_err(|_| CcnxError::AllocationFailed { bytes: size })?;
        self.buf.extend_from_slice(&header.to_bytes());
        self.buf.extend_from_slice(ext);
        self.lower_clean(if unchanged { size } else { 0 });
        Ok(())
    }

    /// Payload bytes and trailer of entry `index`.
    pub fn get_entry(&self, index: usize) -> Result<(&[u8], EntryTrailer)> {
        let lay = self.layout()?;
        self.checked_index(&lay, index)?;
        let start = lay.entry_offset(index);
        let payload = &self.buf[start..start + lay.esize - TRAILER_SIZE];
        Ok((payload, self.trailer_at(&lay, index)))
    }

    /// Payload bytes of entry `index`.
    pub fn payload(&self, index: usize) -> Result<&[u8]> {
        self.get_entry(index).map(|(p, _)| p)
    }

    /// Replaces the key in `dst` with the key of entry `index`.
    pub fn fetch_key(&self, dst: &mut Vec<u8>, index: usize) -> Result<()> {
        dst.clear();
        self.append_key(dst, index)
    }

    /// Appends the key of entry `index` to `dst`.
    pub fn append_key(&self, dst: &mut Vec<u8>, index: usize) -> Result<()> {
        let lay = self.layout()?;
        self.checked_index(&lay, index)?;
        let t = self.trailer_at(&lay, index);
        let (p0, p1) = self.pieces(&lay, &t)?;
        dst.try_reserve(p0.len() + p1.len())
            .map_err(|_| CcnxError::AllocationFailed {
                bytes: p0.len() + p1.len(),
            })?;
        dst.extend_from_slice(p0);
        dst.extend_from_slice(p1);
        Ok(())
    }

    /// Key of entry `index` as a new vector.
    pub fn key(&self, index: usize) -> Result<Vec<u8>> {
        let mut key = Vec::new();
        self.append_key(&mut key, index)?;
        Ok(key)
    }

    /// Compares `key` with the key of entry `index`.
    ///
    /// The result describes `key` relative to the entry, so
    /// [`FlatOrdering::StrictPrefix`] means `key` is a prefix of the entry.
    pub fn compare_entry(&self, key: &[u8], index: usize) -> Result<FlatOrdering> {
        let lay = self.layout()?;
        self.checked_index(&lay, index)?;
        let t = self.trailer_at(&lay, index);
        let (p0, p1) = self.pieces(&lay, &t)?;
        Ok(compare_pieces(key, p0, p1))
    }

    /// Binary search for `key`.
    ///
    /// Returns the index of an equal entry, or of the first entry greater
    /// than `key`.
    pub fn search(&self, key: &[u8]) -> Result<SearchResult> {
        let count = self.layout()?.count;
        let (mut lo, mut hi) = (0, count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.compare_entry(key, mid)? {
                FlatOrdering::Greater | FlatOrdering::StrictReversePrefix => lo = mid + 1,
                _ => hi = mid,
            }
        }
        let found = lo < count && self.compare_entry(key, lo)? == FlatOrdering::Equal;
        Ok(SearchResult { index: lo, found })
    }

    /// Inserts an entry at `index`.
    ///
    /// The key must sort strictly between the keys at `index - 1` and
    /// `index`, and the payload must match the size of existing entries.
    /// Nothing is modified on failure.
    pub fn insert_entry(&mut self, index: usize, key: &[u8], payload: &[u8]) -> Result<()> {
        let lay = self.layout()?;
        if index > lay.count {
            return Err(CcnxError::IndexOutOfRange {
                node_id: self.id.get(),
                index,
                count: lay.count,
            });
        }
        let esize = payload.len() + TRAILER_SIZE;
        if esize % ENTRY_UNIT != 0 || esize > MAX_ENTRY_SIZE {
            return Err(CcnxError::ContractViolation(format!(
                "payload of {} bytes does not make a whole entry",
                payload.len()
            )));
        }
        if lay.count > 0 && esize != lay.esize {
            return Err(CcnxError::ContractViolation(format!(
                "entry size {} differs from node entry size {}",
                esize, lay.esize
            )));
        }
        if index > 0
            && !matches!(
                self.compare_entry(key, index - 1)?,
                FlatOrdering::Greater | FlatOrdering::StrictReversePrefix
            )
        {
            return Err(CcnxError::ContractViolation(format!(
                "key does not sort after entry {} of node {}",
                index - 1,
                self.id
            )));
        }
        if index < lay.count
            && !matches!(
                self.compare_entry(key, index)?,
                FlatOrdering::Less | FlatOrdering::StrictPrefix
            )
        {
            return Err(CcnxError::ContractViolation(format!(
                "key does not sort before entry {} of node {}",
                index, self.id
            )));
        }

        // Share the longest prefix available from a neighbour.
        let mut shared = 0usize;
        let mut shared_off = lay.keys_end;
        let neighbours = [index.checked_sub(1), (index < lay.count).then_some(index)];
        for n in neighbours.into_iter().flatten() {
            let t = self.trailer_at(&lay, n);
            let (p0, p1) = self.pieces(&lay, &t)?;
            let mut common = common_prefix(key, p0);
            if common == p0.len() {
                common += common_prefix(&key[common..], p1);
            }
            let usable = if common <= p0.len() || t.contiguous() {
                common
            } else {
                p0.len()
            };
            if usable > shared {
                shared = usable;
                shared_off = t.key_off0 as usize;
            }
        }

        let append = key.len() - shared;
        if key.len() > u16::MAX as usize {
            return Err(CcnxError::NodeFull {
                node_id: self.id.get(),
            });
        }
        let old_len = self.buf.len();
        let new_len = old_len + append + esize;
        if new_len > self.capacity || new_len > u32::MAX as usize {
            return Err(CcnxError::NodeFull {
                node_id: self.id.get(),
            });
        }
        self.buf
            .try_reserve(append + esize)
            .map_err(|_| CcnxError::AllocationFailed {
                bytes: append + esize,
            })?;

        let (key_off0, key_len0, key_off1, key_len1) = if shared == 0 {
            (lay.keys_end, key.len(), lay.keys_end + key.len(), 0)
        } else {
            (shared_off, shared, lay.keys_end, append)
        };
        let trailer = EntryTrailer {
            key_off0: key_off0 as u32,
            key_len0: key_len0 as u16,
            key_off1: key_off1 as u32,
            key_len1: key_len1 as u16,
            index: index as u16,
            level: self.level(),
            units: (esize / ENTRY_UNIT) as u8,
        };

        self.buf.resize(new_len, 0);
        let k = lay.keys_end;
        // Entries at and after `index` move by the new key bytes plus one entry,
        // earlier entries by the key bytes alone.
        self.buf
            .copy_within(k + index * esize..old_len, k + append + (index + 1) * esize);
        self.buf.copy_within(k..k + index * esize, k + append);
        self.buf[k..k + append].copy_from_slice(&key[shared..]);
        let at = k + append + index * esize;
        self.buf[at..at + payload.len()].copy_from_slice(payload);
        self.buf[at + payload.len()..at + esize].copy_from_slice(&trailer.to_bytes());

        let moved = Layout {
            header: lay.header,
            keys_end: k + append,
            count: lay.count + 1,
            esize,
        };
        for i in index + 1..moved.count {
            let off = moved.trailer_offset(i) + 12;
            self.buf[off..off + 2].copy_from_slice(&(i as u16).to_le_bytes());
        }
        self.lower_clean(k);
        Ok(())
    }

    /// Removes entry `index`. Key bytes stay behind until the node is rebuilt.
    ///
    /// Removing the last entry truncates the node to its header.
    pub fn delete_entry(&mut self, index: usize) -> Result<()> {
        let lay = self.layout()?;
        self.checked_index(&lay, index)?;
        if lay.count == 1 {
            self.buf.truncate(lay.header);
            self.lower_clean(lay.header);
            return Ok(());
        }
        let old_len = self.buf.len();
        let start = lay.entry_offset(index);
        self.buf.copy_within(start + lay.esize..old_len, start);
        self.buf.truncate(old_len - lay.esize);
        let shrunk = Layout {
            count: lay.count - 1,
            ..lay
        };
        for i in index..shrunk.count {
            let off = shrunk.trailer_offset(i) + 12;
            self.buf[off..off + 2].copy_from_slice(&(i as u16).to_le_bytes());
        }
        self.lower_clean(start);
        Ok(())
    }

    /// Overwrites part of an entry's payload.
    pub(crate) fn update_payload(&mut self, index: usize, offset: usize, data: &[u8]) -> Result<()> {
        let lay = self.layout()?;
        self.checked_index(&lay, index)?;
        if offset + data.len() > lay.esize - TRAILER_SIZE {
            return Err(CcnxError::ContractViolation(format!(
                "payload update {}..{} beyond payload",
                offset,
                offset + data.len()
            )));
        }
        let at = lay.entry_offset(index) + offset;
        self.buf[at..at + data.len()].copy_from_slice(data);
        self.lower_clean(at);
        Ok(())
    }

    /// Child id of an internal-node entry.
    pub fn child(&self, index: usize) -> Result<NodeId> {
        let payload = self.payload(index)?;
        if payload.len() < InternalPayload::SIZE {
            return Err(self.corrupt_error(format!(
                "payload of {} bytes in internal node",
                payload.len()
            )));
        }
        let entry = InternalPayload::from_bytes(payload);
        if entry.magic != INTERNAL_MAGIC || !entry.child.is_some() {
            return Err(self.corrupt_error(format!("bad child pointer at entry {}", index)));
        }
        Ok(entry.child)
    }

    /// Copies every entry out of the node, in key order.
    pub fn entries(&self) -> Result<Vec<NodeEntry>> {
        let lay = self.layout()?;
        let mut out = Vec::with_capacity(lay.count);
        for i in 0..lay.count {
            let key = self.key(i)?;
            let payload = self.payload(i)?;
            out.push(NodeEntry {
                key: Bytes::from(key),
                payload: Bytes::copy_from_slice(payload),
            });
        }
        Ok(out)
    }

    /// Validates the whole node, flagging it corrupt on the first problem.
    pub fn check(&mut self) -> Result<()> {
        match self.find_problem() {
            None => Ok(()),
            Some(reason) => Err(self.mark_corrupt(reason)),
        }
    }

    fn find_problem(&self) -> Option<String> {
        if let Some(reason) = &self.corrupt {
            return Some(reason.clone());
        }
        let header = match self.header() {
            Some(h) => h,
            None => return Some(format!("node of {} bytes has no header", self.buf.len())),
        };
        if let Some(problem) = header.problem() {
            return Some(problem);
        }
        let lay = match self.layout() {
            Ok(lay) => lay,
            Err(e) => return Some(e.to_string()),
        };
        if lay.count == 0 {
            return (self.buf.len() != lay.header)
                .then(|| format!("{} stray bytes in empty node", self.buf.len() - lay.header));
        }
        if lay.esize % ENTRY_UNIT != 0 {
            return Some(format!("entry size {} not a multiple of {}", lay.esize, ENTRY_UNIT));
        }
        let expected_magic = if header.level > 0 {
            INTERNAL_MAGIC
        } else {
            CONTENT_MAGIC
        };
        let mut prev: Option<Vec<u8>> = None;
        for i in 0..lay.count {
            let t = self.trailer_at(&lay, i);
            if t.index as usize != i {
                return Some(format!("entry {} records index {}", i, t.index));
            }
            if t.entry_size() != lay.esize {
                return Some(format!("entry {} has size {}", i, t.entry_size()));
            }
            if t.level != header.level {
                return Some(format!("entry {} at level {}", i, t.level));
            }
            if self.buf[lay.entry_offset(i)] != expected_magic {
                return Some(format!("entry {} has bad payload magic", i));
            }
            let key = match self.key(i) {
                Ok(k) => k,
                Err(e) => return Some(e.to_string()),
            };
            if let Some(prev) = &prev {
                if !matches!(
                    crate::flatname::compare(prev, &key),
                    FlatOrdering::Less | FlatOrdering::StrictPrefix
                ) {
                    return Some(format!("entry {} out of order", i));
                }
            }
            prev = Some(key);
        }
        None
    }

    /// True if the node exceeds its level's split threshold and can be split.
    pub fn oversize(&self, config: &TreeConfig) -> bool {
        self.entry_count() > 1 && self.buf.len() > config.threshold(self.level())
    }

    /// True if the node is small enough to be merged into a sibling.
    pub fn unbalance(&self, config: &TreeConfig) -> bool {
        self.entry_count() == 0
            || self.buf.len() * UNDERFULL_DIVISOR < config.threshold(self.level())
    }

    /// Bytes an entry would occupy in a freshly built node.
    pub fn entry_footprint(&self, index: usize) -> Result<usize> {
        let lay = self.layout()?;
        self.checked_index(&lay, index)?;
        Ok(self.trailer_at(&lay, index).key_len() + lay.esize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::constants::CONTENT_PAYLOAD_SIZE;
    use crate::flatname::{compare, from_components};
    use proptest::prelude::*;

    fn leaf_payload(tag: u8) -> Vec<u8> {
        let mut p = vec![0u8; CONTENT_PAYLOAD_SIZE];
        p[0] = CONTENT_MAGIC;
        p[1] = tag;
        p
    }

    fn leaf() -> Node {
        let mut node = Node::new(NodeId(2), 16384);
        node.init(0, NodeKind::Plain, &[]).unwrap();
        node
    }

    fn name(comps: &[&str]) -> Vec<u8> {
        from_components(comps.iter().map(|c| c.as_bytes())).unwrap()
    }

    fn insert_sorted(node: &mut Node, key: &[u8], tag: u8) {
        let r = node.search(key).unwrap();
        assert!(!r.found);
        node.insert_entry(r.index, key, &leaf_payload(tag)).unwrap();
    }

    #[test]
    fn test_init_empty_node() {
        let node = leaf();
        assert_eq!(node.len(), 8);
        assert_eq!(node.entry_count(), 0);
        assert_eq!(node.entry_size(), 0);
        assert_eq!(node.level(), 0);
        assert_eq!(node.kind(), Some(NodeKind::Plain));
        assert!(node.is_dirty());
    }

    #[test]
    fn test_init_with_extension() {
        let mut node = Node::new(NodeId(1), 4096);
        node.init(3, NodeKind::Root, &[7u8; 16]).unwrap();
        assert_eq!(node.header_size(), 24);
        assert_eq!(node.header_ext(), &[7u8; 16]);
        assert_eq!(node.level(), 3);
        assert!(node.init(0, NodeKind::Plain, &[0u8; 5]).is_err());
    }

    #[test]
    fn test_insert_and_fetch() {
        let mut node = leaf();
        let keys = [
            name(&["a", "b"]),
            name(&["a", "b", "c"]),
            name(&["a", "c"]),
            name(&["b"]),
        ];
        for (i, k) in keys.iter().enumerate().rev() {
            insert_sorted(&mut node, k, i as u8);
        }
        assert_eq!(node.entry_count(), 4);
        assert_eq!(node.entry_size(), 80);
        assert_eq!(node.payload_size(), 64);

        let mut scratch = Vec::new();
        for (i, k) in keys.iter().enumerate() {
            node.fetch_key(&mut scratch, i).unwrap();
            assert_eq!(&scratch, k);
            let (payload, trailer) = node.get_entry(i).unwrap();
            assert_eq!(payload, leaf_payload(i as u8).as_slice());
            assert_eq!(trailer.index as usize, i);
        }
        node.check().unwrap();
    }

    #[test]
    fn test_keys_share_prefix_bytes() {
        let mut node = leaf();
        let base = name(&["parc.com", "videos", "widget", "v1"]);
        let mut next = base.clone();
        next.push(0x01);
        next.push(b'x');
        insert_sorted(&mut node, &base, 0);
        let after_first = node.len();
        insert_sorted(&mut node, &next, 1);
        // Only the differing suffix and one entry were added
        assert_eq!(node.len(), after_first + 2 + 80);
        assert_eq!(node.key(1).unwrap(), next);
    }

    #[test]
    fn test_search_bounds() {
        let mut node = leaf();
        for (i, c) in ["b", "d", "f"].iter().enumerate() {
            insert_sorted(&mut node, &name(&[*c]), i as u8);
        }
        assert_eq!(
            node.search(&name(&["d"])).unwrap(),
            SearchResult {
                index: 1,
                found: true
            }
        );
        assert_eq!(
            node.search(&name(&["a"])).unwrap(),
            SearchResult {
                index: 0,
                found: false
            }
        );
        assert_eq!(
            node.search(&name(&["e"])).unwrap(),
            SearchResult {
                index: 2,
                found: false
            }
        );
        assert_eq!(
            node.search(&name(&["g"])).unwrap(),
            SearchResult {
                index: 3,
                found: false
            }
        );
        // A prefix of an entry sorts before it
        assert_eq!(node.search(&[]).unwrap().index, 0);
    }

    #[test]
    fn test_insert_rejects_misplaced_key() {
        let mut node = leaf();
        insert_sorted(&mut node, &name(&["b"]), 0);
        insert_sorted(&mut node, &name(&["d"]), 1);
        let before = node.bytes().to_vec();

        let err = node.insert_entry(0, &name(&["c"]), &leaf_payload(9));
        assert!(matches!(err, Err(CcnxError::ContractViolation(_))));
        let err = node.insert_entry(1, &name(&["b"]), &leaf_payload(9));
        assert!(matches!(err, Err(CcnxError::ContractViolation(_))));
        let err = node.insert_entry(5, &name(&["z"]), &leaf_payload(9));
        assert!(matches!(err, Err(CcnxError::IndexOutOfRange { .. })));
        let err = node.insert_entry(2, &name(&["z"]), &[CONTENT_MAGIC; 8]);
        assert!(matches!(err, Err(CcnxError::ContractViolation(_))));

        assert_eq!(node.bytes(), before.as_slice());
    }

    #[test]
    fn test_insert_node_full() {
        let mut node = Node::new(NodeId(4), 8 + 80 + 10);
        node.init(0, NodeKind::Plain, &[]).unwrap();
        node.insert_entry(0, &name(&["a"]), &leaf_payload(0)).unwrap();
        let err = node.insert_entry(1, &name(&["b"]), &leaf_payload(1));
        assert!(matches!(err, Err(CcnxError::NodeFull { node_id: 4 })));
        assert_eq!(node.entry_count(), 1);
    }

    #[test]
    fn test_delete_entries() {
        let mut node = leaf();
        let keys: Vec<Vec<u8>> = ["a", "b", "c", "d"].iter().map(|c| name(&[*c])).collect();
        for (i, k) in keys.iter().enumerate() {
            insert_sorted(&mut node, k, i as u8);
        }
        node.delete_entry(1).unwrap();
        assert_eq!(node.entry_count(), 3);
        assert_eq!(node.key(1).unwrap(), keys[2]);
        assert_eq!(node.payload(1).unwrap()[1], 2);
        node.check().unwrap();
    }

    #[test]
    fn test_delete_last_entry_truncates() {
        let mut node = leaf();
        insert_sorted(&mut node, &name(&["only"]), 0);
        node.delete_entry(0).unwrap();
        assert_eq!(node.entry_count(), 0);
        assert_eq!(node.len(), 8);
        assert!(matches!(
            node.delete_entry(0),
            Err(CcnxError::IndexOutOfRange { .. })
        ));
    }

    #[test]
    fn test_clean_watermark() {
        let mut node = leaf();
        insert_sorted(&mut node, &name(&["a"]), 0);
        insert_sorted(&mut node, &name(&["c"]), 1);
        node.mark_persisted();
        assert!(!node.is_dirty());

        node.update_payload(1, 1, &[42]).unwrap();
        assert!(node.is_dirty());
        let len = node.len();
        assert_eq!(node.clean_offset(), len - 80 + 1);
        assert_eq!(node.unclean().len(), 79);

        node.mark_persisted();
        insert_sorted(&mut node, &name(&["b"]), 2);
        // Key bytes were appended at the old key-region end
        assert_eq!(node.clean_offset(), len - 160);
    }

    #[test]
    fn test_internal_child() {
        let mut node = Node::new(NodeId(1), 4096);
        node.init(1, NodeKind::Root, &[]).unwrap();
        node.insert_entry(0, &[], &InternalPayload::new(NodeId(7)).to_bytes())
            .unwrap();
        node.insert_entry(1, &name(&["m"]), &InternalPayload::new(NodeId(9)).to_bytes())
            .unwrap();
        assert_eq!(node.child(0).unwrap(), NodeId(7));
        assert_eq!(node.child(1).unwrap(), NodeId(9));
        assert_eq!(node.entry_size(), 24);
        node.check().unwrap();
    }

    #[test]
    fn test_check_flags_corruption() {
        let mut node = leaf();
        insert_sorted(&mut node, &name(&["a"]), 0);
        insert_sorted(&mut node, &name(&["b"]), 1);
        // Damage the first payload magic
        let off = node.len() - 160;
        node.buf[off] = 0x00;

        let err = node.check().unwrap_err();
        assert!(err.is_corruption());
        assert!(node.is_corrupt());
        assert!(matches!(node.get_entry(0), Err(CcnxError::NodeCorrupt { .. })));
        assert!(node.insert_entry(0, &[], &leaf_payload(0)).is_err());
    }

    #[test]
    fn test_overlong_trailer_count_is_corrupt() {
        let mut node = leaf();
        insert_sorted(&mut node, &name(&["a"]), 0);
        let len = node.len();
        node.buf[len - 4..len - 2].copy_from_slice(&50u16.to_le_bytes());
        assert_eq!(node.entry_count(), 51);
        assert!(node.get_entry(0).unwrap_err().is_corruption());
    }

    #[test]
    fn test_entries_and_footprint() {
        let mut node = leaf();
        insert_sorted(&mut node, &name(&["x"]), 5);
        let entries = node.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key.as_ref(), name(&["x"]).as_slice());
        assert_eq!(entries[0].payload[1], 5);
        assert_eq!(entries[0].footprint(), node.entry_footprint(0).unwrap());
    }

    #[test]
    fn test_oversize_and_unbalance() {
        let config = TreeConfig {
            full0: 400,
            ..Default::default()
        };
        let mut node = leaf();
        assert!(node.unbalance(&config));
        for i in 0..5u8 {
            let key = format!("k{}", i);
            insert_sorted(&mut node, &name(&[key.as_str()]), i);
        }
        assert!(node.oversize(&config));
        assert!(!node.unbalance(&config));
    }

    fn names_strategy() -> impl Strategy<Value = Vec<Vec<Vec<u8>>>> {
        let component = prop::collection::vec(any::<u8>(), 0..6);
        prop::collection::vec(prop::collection::vec(component, 0..4), 0..40)
    }

    /// Lower-bound position of `key` in a sorted key list.
    fn model_position(model: &[Vec<u8>], key: &[u8]) -> usize {
        model.partition_point(|k| compare(k, key).to_ordering().is_lt())
    }

    proptest! {
        #[test]
        fn test_insert_sequence_roundtrip(names in names_strategy()) {
            let mut node = leaf();
            let mut model: Vec<Vec<u8>> = Vec::new();
            for (tag, comps) in names.iter().enumerate() {
                let key = from_components(comps).unwrap();
                let pos = model_position(&model, &key);
                if model.get(pos) == Some(&key) {
                    continue;
                }
                node.insert_entry(pos, &key, &leaf_payload(tag as u8)).unwrap();
                model.insert(pos, key);
            }
            prop_assert!(node.check().is_ok());
            prop_assert_eq!(node.entry_count(), model.len());
            for (i, k) in model.iter().enumerate() {
                prop_assert_eq!(&node.key(i).unwrap(), k);
            }

            // A node read back from its bytes holds the same entries
            let mut copy = Node::new(node.id(), node.capacity());
            copy.extend_from_storage(node.bytes(), node.len()).unwrap();
            prop_assert!(copy.check().is_ok());
            prop_assert_eq!(copy.entries().unwrap(), node.entries().unwrap());
        }

        #[test]
        fn test_search_returns_insertion_point(
            names in names_strategy(),
            target in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..6), 0..4),
        ) {
            let mut node = leaf();
            let mut model: Vec<Vec<u8>> = Vec::new();
            for comps in &names {
                let key = from_components(comps).unwrap();
                let pos = model_position(&model, &key);
                if model.get(pos) != Some(&key) {
                    node.insert_entry(pos, &key, &leaf_payload(0)).unwrap();
                    model.insert(pos, key);
                }
            }
            let key = from_components(&target).unwrap();
            let pos = model_position(&model, &key);
            let found = node.search(&key).unwrap();
            prop_assert_eq!(found.index, pos);
            prop_assert_eq!(found.found, model.get(pos) == Some(&key));
        }
    }
}
