use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

use crate::bdoc::{read_varint, write_varint};
use crate::error::{Error, Result};
use crate::kv::{DbHandle, KvTxn, OPAQUE_HEADER_SIZE};

const MAGIC: &[u8; 4] = b"OPBT";
const VERSION: u32 = 1;

/// Node page ids live above this base; leaf ids below it. The textual form
/// drops the base: leaves are plain hex, nodes are `#`-prefixed hex.
const NODE_ID_BASE: u64 = 1 << 48;

const DEFAULT_LEAF_RECS: usize = 128;
const DEFAULT_NODE_ENTRIES: usize = 256;
const LEAF_CACHE_CAP: usize = 1024;
const NODE_CACHE_CAP: usize = 512;

/// Key ordering, fixed at tree creation and recorded in the opaque header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    /// Byte-lexicographic.
    Lexical,
    /// Decimal number text, e.g. the fixed-precision form of float keys.
    Decimal,
    /// Little-endian signed 32-bit payloads.
    Int32,
    /// Little-endian signed 64-bit payloads.
    Int64,
}

impl Comparator {
    fn tag(self) -> u8 {
        match self {
            Comparator::Lexical => 0,
            Comparator::Decimal => 1,
            Comparator::Int32 => 2,
            Comparator::Int64 => 3,
        }
    }

    fn from_tag(tag: u8) -> Result<Comparator> {
        Ok(match tag {
            0 => Comparator::Lexical,
            1 => Comparator::Decimal,
            2 => Comparator::Int32,
            3 => Comparator::Int64,
            other => return Err(Error::Corrupt(format!("unknown comparator tag {other}"))),
        })
    }

    pub fn cmp(self, a: &[u8], b: &[u8]) -> std::cmp::Ordering {
        match self {
            Comparator::Lexical => a.cmp(b),
            Comparator::Decimal => cmp_decimal(a, b),
            Comparator::Int32 => decode_int(a, 4).cmp(&decode_int(b, 4)),
            Comparator::Int64 => decode_int(a, 8).cmp(&decode_int(b, 8)),
        }
    }
}

fn decode_int(bytes: &[u8], width: usize) -> i64 {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(width);
    buf[..n].copy_from_slice(&bytes[..n]);
    let v = i64::from_le_bytes(buf);
    if width == 4 { v as i32 as i64 } else { v }
}

/// Compare decimal number text without going through floats: sign, then
/// integer digits by length and lexicographic order, then fraction digits.
fn cmp_decimal(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
    use std::cmp::Ordering;

    fn parse(s: &[u8]) -> (bool, &[u8], &[u8]) {
        let mut i = 0;
        while i < s.len() && (s[i] == b' ' || s[i] == b'\t') {
            i += 1;
        }
        let neg = i < s.len() && s[i] == b'-';
        if neg || (i < s.len() && s[i] == b'+') {
            i += 1;
        }
        let int_start = i;
        while i < s.len() && s[i].is_ascii_digit() {
            i += 1;
        }
        let mut int_part = &s[int_start..i];
        while !int_part.is_empty() && int_part[0] == b'0' {
            int_part = &int_part[1..];
        }
        let mut frac_part: &[u8] = &[];
        if i < s.len() && s[i] == b'.' {
            i += 1;
            let frac_start = i;
            while i < s.len() && s[i].is_ascii_digit() {
                i += 1;
            }
            frac_part = &s[frac_start..i];
            while !frac_part.is_empty() && frac_part[frac_part.len() - 1] == b'0' {
                frac_part = &frac_part[..frac_part.len() - 1];
            }
        }
        (neg, int_part, frac_part)
    }

    let (an, ai, af) = parse(a);
    let (bn, bi, bf) = parse(b);
    let a_zero = ai.is_empty() && af.is_empty();
    let b_zero = bi.is_empty() && bf.is_empty();
    if a_zero && b_zero {
        return Ordering::Equal;
    }
    let a_sign = if a_zero { 0 } else if an { -1 } else { 1 };
    let b_sign = if b_zero { 0 } else if bn { -1 } else { 1 };
    if a_sign != b_sign {
        return a_sign.cmp(&b_sign);
    }
    let mag = ai
        .len()
        .cmp(&bi.len())
        .then_with(|| ai.cmp(bi))
        .then_with(|| af.cmp(bf));
    if a_sign < 0 { mag.reverse() } else { mag }
}

// ---------------------------------------------------------------------------
// Pages
// ---------------------------------------------------------------------------

/// One key with its values. The first value is stored inline in the record,
/// further duplicates go to the rest list; that layout is the wire format.
#[derive(Debug, Clone)]
struct Rec {
    key: Vec<u8>,
    vals: Vec<Vec<u8>>,
}

#[derive(Debug, Clone)]
struct Leaf {
    prev: u64,
    next: u64,
    recs: Vec<Rec>,
}

#[derive(Debug, Clone)]
struct NodePage {
    /// Child for keys below the first entry.
    heir: u64,
    /// Strictly increasing separator keys with their right-hand children.
    entries: Vec<(u64, Vec<u8>)>,
}

#[derive(Debug, Clone)]
enum Page {
    Leaf(Leaf),
    Node(NodePage),
}

fn page_key(id: u64) -> Vec<u8> {
    if id >= NODE_ID_BASE {
        format!("#{:x}", id - NODE_ID_BASE).into_bytes()
    } else {
        format!("{id:x}").into_bytes()
    }
}

fn encode_leaf(leaf: &Leaf) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    write_varint(&mut buf, leaf.prev);
    write_varint(&mut buf, leaf.next);
    write_varint(&mut buf, leaf.recs.len() as u64);
    for rec in &leaf.recs {
        write_varint(&mut buf, rec.key.len() as u64);
        write_varint(&mut buf, rec.vals[0].len() as u64);
        write_varint(&mut buf, (rec.vals.len() - 1) as u64);
        buf.extend_from_slice(&rec.key);
        buf.extend_from_slice(&rec.vals[0]);
        for rest in &rec.vals[1..] {
            write_varint(&mut buf, rest.len() as u64);
            buf.extend_from_slice(rest);
        }
    }
    buf
}

fn decode_leaf(data: &[u8]) -> Result<Leaf> {
    let take = |pos: &mut usize, n: usize| -> Result<Vec<u8>> {
        let end = *pos + n;
        let s = data
            .get(*pos..end)
            .ok_or_else(|| Error::Corrupt("truncated leaf page".into()))?;
        *pos = end;
        Ok(s.to_vec())
    };
    let mut pos = 0usize;
    let prev = read_varint(data, &mut pos)?;
    let next = read_varint(data, &mut pos)?;
    let nrec = read_varint(data, &mut pos)?;
    let mut recs = Vec::with_capacity(nrec as usize);
    for _ in 0..nrec {
        let ksiz = read_varint(data, &mut pos)? as usize;
        let vsiz = read_varint(data, &mut pos)? as usize;
        let nrest = read_varint(data, &mut pos)? as usize;
        let key = take(&mut pos, ksiz)?;
        let first = take(&mut pos, vsiz)?;
        let mut vals = Vec::with_capacity(nrest + 1);
        vals.push(first);
        for _ in 0..nrest {
            let len = read_varint(data, &mut pos)? as usize;
            vals.push(take(&mut pos, len)?);
        }
        recs.push(Rec { key, vals });
    }
    if pos != data.len() {
        return Err(Error::Corrupt("trailing bytes in leaf page".into()));
    }
    Ok(Leaf { prev, next, recs })
}

fn encode_node(node: &NodePage) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    write_varint(&mut buf, node.heir);
    write_varint(&mut buf, node.entries.len() as u64);
    for (child, key) in &node.entries {
        write_varint(&mut buf, *child);
        write_varint(&mut buf, key.len() as u64);
        buf.extend_from_slice(key);
    }
    buf
}

fn decode_node(data: &[u8]) -> Result<NodePage> {
    let mut pos = 0usize;
    let heir = read_varint(data, &mut pos)?;
    let nent = read_varint(data, &mut pos)?;
    let mut entries = Vec::with_capacity(nent as usize);
    for _ in 0..nent {
        let child = read_varint(data, &mut pos)?;
        let ksiz = read_varint(data, &mut pos)? as usize;
        let end = pos + ksiz;
        let key = data
            .get(pos..end)
            .ok_or_else(|| Error::Corrupt("truncated node page".into()))?
            .to_vec();
        pos = end;
        entries.push((child, key));
    }
    if pos != data.len() {
        return Err(Error::Corrupt("trailing bytes in node page".into()));
    }
    Ok(NodePage { heir, entries })
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct TreeHeader {
    cmp: Comparator,
    root: u64,
    first_leaf: u64,
    last_leaf: u64,
    leaf_seq: u64,
    node_seq: u64,
    leaf_count: u64,
    node_count: u64,
    record_count: u64,
}

impl TreeHeader {
    fn new(cmp: Comparator) -> Self {
        TreeHeader {
            cmp,
            root: 0,
            first_leaf: 0,
            last_leaf: 0,
            leaf_seq: 0,
            node_seq: 0,
            leaf_count: 0,
            node_count: 0,
            record_count: 0,
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(OPAQUE_HEADER_SIZE);
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&VERSION.to_le_bytes());
        buf.push(self.cmp.tag());
        buf.extend_from_slice(&[0u8; 3]);
        for v in [
            self.root,
            self.first_leaf,
            self.last_leaf,
            self.leaf_seq,
            self.node_seq,
            self.leaf_count,
            self.node_count,
            self.record_count,
        ] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        buf
    }

    fn decode(data: &[u8; OPAQUE_HEADER_SIZE]) -> Result<Option<TreeHeader>> {
        if data[0..4] == [0, 0, 0, 0] {
            return Ok(None);
        }
        if &data[0..4] != MAGIC {
            return Err(Error::Corrupt("bad index header magic".into()));
        }
        let version = u32::from_le_bytes(data[4..8].try_into().unwrap());
        if version != VERSION {
            return Err(Error::Corrupt(format!("unsupported index version {version}")));
        }
        let cmp = Comparator::from_tag(data[8])?;
        let mut vals = [0u64; 8];
        for (i, v) in vals.iter_mut().enumerate() {
            let off = 12 + i * 8;
            *v = u64::from_le_bytes(data[off..off + 8].try_into().unwrap());
        }
        Ok(Some(TreeHeader {
            cmp,
            root: vals[0],
            first_leaf: vals[1],
            last_leaf: vals[2],
            leaf_seq: vals[3],
            node_seq: vals[4],
            leaf_count: vals[5],
            node_count: vals[6],
            record_count: vals[7],
        }))
    }
}

// ---------------------------------------------------------------------------
// Tree
// ---------------------------------------------------------------------------

struct Cached<P> {
    page: P,
    dirty: bool,
}

struct TreeState {
    hdr: TreeHeader,
    hdr_dirty: bool,
    leaves: LruCache<u64, Cached<Leaf>>,
    nodes: LruCache<u64, Cached<NodePage>>,
    /// Dirty pages pushed out of the caches, waiting for the next flush.
    spill: HashMap<u64, Page>,
    /// Pages unlinked from the tree, deleted from the store at flush.
    deleted: Vec<u64>,
    /// Bumped on every mutation; cursors re-seek when their stamp is stale.
    clock: u64,
}

/// B+ tree over one KV database. Leaves form a doubly linked chain in key
/// order; duplicate keys keep extra values in a per-record rest list.
///
/// Reads and writes take `&self`; callers serialize writers externally.
/// Cursors are owned by a single thread at a time.
pub struct Btree {
    db: DbHandle,
    max_leaf_recs: usize,
    max_node_entries: usize,
    state: Mutex<TreeState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PutMode {
    Unique,
    Dup,
    DupFront,
}

impl Btree {
    pub fn open(db: DbHandle, cmp: Comparator) -> Result<Btree> {
        Btree::with_limits(db, cmp, DEFAULT_LEAF_RECS, DEFAULT_NODE_ENTRIES)
    }

    pub fn with_limits(
        db: DbHandle,
        cmp: Comparator,
        max_leaf_recs: usize,
        max_node_entries: usize,
    ) -> Result<Btree> {
        let raw = db.read_header()?;
        let hdr = match TreeHeader::decode(&raw)? {
            Some(hdr) => {
                if hdr.cmp != cmp {
                    return Err(Error::InvalidState(format!(
                        "index opened with comparator {:?} but created with {:?}",
                        cmp, hdr.cmp
                    )));
                }
                hdr
            }
            None => TreeHeader::new(cmp),
        };
        Ok(Btree {
            db,
            max_leaf_recs: max_leaf_recs.max(2),
            max_node_entries: max_node_entries.max(2),
            state: Mutex::new(TreeState {
                hdr,
                hdr_dirty: false,
                leaves: LruCache::new(NonZeroUsize::new(LEAF_CACHE_CAP).unwrap()),
                nodes: LruCache::new(NonZeroUsize::new(NODE_CACHE_CAP).unwrap()),
                spill: HashMap::new(),
                deleted: Vec::new(),
                clock: 1,
            }),
        })
    }

    pub fn comparator(&self) -> Comparator {
        self.state.lock().unwrap().hdr.cmp
    }

    pub fn record_count(&self) -> u64 {
        self.state.lock().unwrap().hdr.record_count
    }

    pub fn is_empty(&self) -> bool {
        self.record_count() == 0
    }

    // -- Mutation ------------------------------------------------------------

    /// Insert a key that must not already exist.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_impl(key, value, PutMode::Unique)
    }

    /// Insert allowing duplicate keys; the value is appended after existing
    /// values of the key.
    pub fn put_dup(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_impl(key, value, PutMode::Dup)
    }

    /// Insert allowing duplicate keys; the value goes before existing values.
    pub fn put_dup_back(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_impl(key, value, PutMode::DupFront)
    }

    fn put_impl(&self, key: &[u8], value: &[u8], mode: PutMode) -> Result<()> {
        let st = &mut *self.state.lock().unwrap();
        if st.hdr.root == 0 {
            let id = alloc_leaf(&mut st.hdr);
            let leaf = Leaf {
                prev: 0,
                next: 0,
                recs: vec![Rec {
                    key: key.to_vec(),
                    vals: vec![value.to_vec()],
                }],
            };
            put_leaf(st, id, leaf, true);
            st.hdr.root = id;
            st.hdr.first_leaf = id;
            st.hdr.last_leaf = id;
            st.hdr.record_count = 1;
            st.hdr.leaf_count = 1;
            st.hdr_dirty = true;
            st.clock += 1;
            return Ok(());
        }
        let cmp = st.hdr.cmp;
        let (leaf_id, path) = descend(&self.db, st, key)?;
        let leaf = load_leaf(&self.db, st, leaf_id)?;
        let idx = leaf.recs.binary_search_by(|r| cmp.cmp(&r.key, key));
        match idx {
            Ok(i) => match mode {
                PutMode::Unique => {
                    return Err(Error::UniqueViolation(format!(
                        "duplicate key in unique index ({} bytes)",
                        key.len()
                    )));
                }
                PutMode::Dup => leaf.recs[i].vals.push(value.to_vec()),
                PutMode::DupFront => leaf.recs[i].vals.insert(0, value.to_vec()),
            },
            Err(i) => leaf.recs.insert(
                i,
                Rec {
                    key: key.to_vec(),
                    vals: vec![value.to_vec()],
                },
            ),
        }
        mark_leaf_dirty(st, leaf_id);
        st.hdr.record_count += 1;
        st.hdr_dirty = true;
        st.clock += 1;
        let over = {
            let leaf = load_leaf(&self.db, st, leaf_id)?;
            leaf.recs.len() > self.max_leaf_recs
        };
        if over {
            self.split_leaf(st, leaf_id, path)?;
        }
        Ok(())
    }

    fn split_leaf(&self, st: &mut TreeState, leaf_id: u64, path: Vec<u64>) -> Result<()> {
        let new_id = alloc_leaf(&mut st.hdr);
        let (moved, old_next) = {
            let leaf = load_leaf(&self.db, st, leaf_id)?;
            let mid = leaf.recs.len() / 2;
            let moved = leaf.recs.split_off(mid);
            let old_next = leaf.next;
            leaf.next = new_id;
            (moved, old_next)
        };
        mark_leaf_dirty(st, leaf_id);
        let sep = moved[0].key.clone();
        let new_leaf = Leaf {
            prev: leaf_id,
            next: old_next,
            recs: moved,
        };
        put_leaf(st, new_id, new_leaf, true);
        if old_next != 0 {
            let right = load_leaf(&self.db, st, old_next)?;
            right.prev = new_id;
            mark_leaf_dirty(st, old_next);
        } else {
            st.hdr.last_leaf = new_id;
        }
        st.hdr.leaf_count += 1;
        st.hdr_dirty = true;
        self.insert_parent(st, path, sep, new_id)
    }

    fn insert_parent(
        &self,
        st: &mut TreeState,
        mut path: Vec<u64>,
        mut sep: Vec<u8>,
        mut child: u64,
    ) -> Result<()> {
        let cmp = st.hdr.cmp;
        loop {
            let Some(nid) = path.pop() else {
                // The root split: allocate a new root above it.
                let new_root = alloc_node(&mut st.hdr);
                let node = NodePage {
                    heir: st.hdr.root,
                    entries: vec![(child, sep)],
                };
                put_node(st, new_root, node, true);
                st.hdr.root = new_root;
                st.hdr.node_count += 1;
                st.hdr_dirty = true;
                return Ok(());
            };
            let (needs_split, split_payload) = {
                let node = load_node(&self.db, st, nid)?;
                let pos = node
                    .entries
                    .partition_point(|(_, k)| cmp.cmp(k, &sep) == std::cmp::Ordering::Less);
                node.entries.insert(pos, (child, sep.clone()));
                if node.entries.len() <= self.max_node_entries {
                    (false, None)
                } else {
                    let mid = node.entries.len() / 2;
                    let upper = node.entries.split_off(mid + 1);
                    let (mid_child, mid_key) = node.entries.pop().unwrap();
                    (true, Some((mid_child, mid_key, upper)))
                }
            };
            mark_node_dirty(st, nid);
            if !needs_split {
                return Ok(());
            }
            let (mid_child, mid_key, upper) = split_payload.unwrap();
            let new_id = alloc_node(&mut st.hdr);
            put_node(
                st,
                new_id,
                NodePage {
                    heir: mid_child,
                    entries: upper,
                },
                true,
            );
            st.hdr.node_count += 1;
            st.hdr_dirty = true;
            sep = mid_key;
            child = new_id;
        }
    }

    /// Remove a key with all its values. Returns false if absent.
    pub fn del(&self, key: &[u8]) -> Result<bool> {
        self.del_impl(key, None)
    }

    /// Remove one (key, value) pair. Returns false if absent.
    pub fn del_kv(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.del_impl(key, Some(value))
    }

    fn del_impl(&self, key: &[u8], value: Option<&[u8]>) -> Result<bool> {
        let st = &mut *self.state.lock().unwrap();
        if st.hdr.root == 0 {
            return Ok(false);
        }
        let cmp = st.hdr.cmp;
        let (leaf_id, path) = descend(&self.db, st, key)?;
        let (removed, emptied) = {
            let leaf = load_leaf(&self.db, st, leaf_id)?;
            let Ok(i) = leaf.recs.binary_search_by(|r| cmp.cmp(&r.key, key)) else {
                return Ok(false);
            };
            let removed;
            match value {
                None => {
                    let rec = leaf.recs.remove(i);
                    removed = rec.vals.len() as u64;
                }
                Some(v) => {
                    let rec = &mut leaf.recs[i];
                    let Some(pos) = rec.vals.iter().position(|rv| rv == v) else {
                        return Ok(false);
                    };
                    rec.vals.remove(pos);
                    removed = 1;
                    if rec.vals.is_empty() {
                        leaf.recs.remove(i);
                    }
                }
            }
            (removed, leaf.recs.is_empty())
        };
        st.hdr.record_count -= removed;
        mark_leaf_dirty(st, leaf_id);
        st.hdr_dirty = true;
        st.clock += 1;
        if emptied && leaf_id != st.hdr.root {
            self.unlink_leaf(st, leaf_id, path)?;
        }
        Ok(true)
    }

    fn unlink_leaf(&self, st: &mut TreeState, leaf_id: u64, path: Vec<u64>) -> Result<()> {
        let (prev, next) = {
            let leaf = load_leaf(&self.db, st, leaf_id)?;
            (leaf.prev, leaf.next)
        };
        if prev != 0 {
            let p = load_leaf(&self.db, st, prev)?;
            p.next = next;
            mark_leaf_dirty(st, prev);
        } else {
            st.hdr.first_leaf = next;
        }
        if next != 0 {
            let n = load_leaf(&self.db, st, next)?;
            n.prev = prev;
            mark_leaf_dirty(st, next);
        } else {
            st.hdr.last_leaf = prev;
        }
        st.leaves.pop(&leaf_id);
        st.spill.remove(&leaf_id);
        st.deleted.push(leaf_id);
        st.hdr.leaf_count -= 1;
        st.hdr_dirty = true;
        self.remove_child_ref(st, path, leaf_id)
    }

    fn remove_child_ref(&self, st: &mut TreeState, mut path: Vec<u64>, dead: u64) -> Result<()> {
        let mut dead = dead;
        loop {
            let Some(nid) = path.pop() else {
                // The root itself died; the tree is empty now.
                st.hdr.root = 0;
                st.hdr_dirty = true;
                return Ok(());
            };
            enum Outcome {
                Done,
                NodeDied,
                Collapse(u64),
            }
            let outcome = {
                let node = load_node(&self.db, st, nid)?;
                if node.heir == dead {
                    if node.entries.is_empty() {
                        Outcome::NodeDied
                    } else {
                        node.heir = node.entries.remove(0).0;
                        if node.entries.is_empty() {
                            Outcome::Collapse(node.heir)
                        } else {
                            Outcome::Done
                        }
                    }
                } else {
                    if let Some(i) = node.entries.iter().position(|(c, _)| *c == dead) {
                        node.entries.remove(i);
                    }
                    if node.entries.is_empty() {
                        Outcome::Collapse(node.heir)
                    } else {
                        Outcome::Done
                    }
                }
            };
            match outcome {
                Outcome::Done => {
                    mark_node_dirty(st, nid);
                    return Ok(());
                }
                Outcome::NodeDied => {
                    st.nodes.pop(&nid);
                    st.spill.remove(&nid);
                    st.deleted.push(nid);
                    st.hdr.node_count -= 1;
                    st.hdr_dirty = true;
                    dead = nid;
                }
                Outcome::Collapse(heir) => {
                    // The node is left with a single child; splice it out.
                    st.nodes.pop(&nid);
                    st.spill.remove(&nid);
                    st.deleted.push(nid);
                    st.hdr.node_count -= 1;
                    st.hdr_dirty = true;
                    if let Some(parent_id) = path.last().copied() {
                        let parent = load_node(&self.db, st, parent_id)?;
                        if parent.heir == nid {
                            parent.heir = heir;
                        } else if let Some(e) =
                            parent.entries.iter_mut().find(|(c, _)| *c == nid)
                        {
                            e.0 = heir;
                        }
                        mark_node_dirty(st, parent_id);
                    } else {
                        st.hdr.root = heir;
                    }
                    return Ok(());
                }
            }
        }
    }

    // -- Lookup --------------------------------------------------------------

    /// All values stored under `key`, inline value first then the rest list.
    /// The returned iterator is finite and non-restartable.
    pub fn get(&self, key: &[u8]) -> Result<std::vec::IntoIter<Vec<u8>>> {
        let st = &mut *self.state.lock().unwrap();
        if st.hdr.root == 0 {
            return Ok(Vec::new().into_iter());
        }
        let cmp = st.hdr.cmp;
        let (leaf_id, _) = descend(&self.db, st, key)?;
        let leaf = load_leaf(&self.db, st, leaf_id)?;
        Ok(match leaf.recs.binary_search_by(|r| cmp.cmp(&r.key, key)) {
            Ok(i) => leaf.recs[i].vals.clone().into_iter(),
            Err(_) => Vec::new().into_iter(),
        })
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.next().is_some())
    }

    pub fn cursor(&self) -> BtCursor<'_> {
        BtCursor {
            tree: self,
            pos: None,
        }
    }

    // -- Persistence ---------------------------------------------------------

    /// Write all dirty pages and the header into the transaction and mark
    /// them clean. On commit failure call `abort` to drop the optimism.
    pub fn flush(&self, txn: &mut dyn KvTxn) -> Result<()> {
        let st = &mut *self.state.lock().unwrap();
        let db_id = self.db.id();
        for (id, cached) in st.leaves.iter_mut() {
            if cached.dirty {
                txn.put(db_id, page_key(*id), encode_leaf(&cached.page));
                cached.dirty = false;
            }
        }
        for (id, cached) in st.nodes.iter_mut() {
            if cached.dirty {
                txn.put(db_id, page_key(*id), encode_node(&cached.page));
                cached.dirty = false;
            }
        }
        for (id, page) in st.spill.drain() {
            match page {
                Page::Leaf(leaf) => txn.put(db_id, page_key(id), encode_leaf(&leaf)),
                Page::Node(node) => txn.put(db_id, page_key(id), encode_node(&node)),
            }
        }
        for id in st.deleted.drain(..) {
            txn.del(db_id, page_key(id));
        }
        if st.hdr_dirty {
            txn.write_header(db_id, st.hdr.encode());
            st.hdr_dirty = false;
        }
        Ok(())
    }

    /// Throw away all uncommitted page state and reload the last committed
    /// header. Cursors are invalidated.
    pub fn abort(&self) -> Result<()> {
        let st = &mut *self.state.lock().unwrap();
        let cmp = st.hdr.cmp;
        let raw = self.db.read_header()?;
        st.hdr = TreeHeader::decode(&raw)?.unwrap_or_else(|| TreeHeader::new(cmp));
        st.hdr_dirty = false;
        st.leaves.clear();
        st.nodes.clear();
        st.spill.clear();
        st.deleted.clear();
        st.clock += 1;
        Ok(())
    }

    #[cfg(test)]
    fn check_sibling_chain(&self) -> (Vec<u64>, Vec<Vec<u8>>) {
        let st = &mut *self.state.lock().unwrap();
        let mut ids = Vec::new();
        let mut keys = Vec::new();
        let mut cur = st.hdr.first_leaf;
        let mut prev = 0u64;
        while cur != 0 {
            let leaf = load_leaf(&self.db, st, cur).unwrap();
            assert_eq!(leaf.prev, prev, "broken prev link at leaf {cur}");
            let next = leaf.next;
            for rec in &leaf.recs {
                keys.push(rec.key.clone());
            }
            ids.push(cur);
            prev = cur;
            cur = next;
        }
        assert_eq!(st.hdr.last_leaf, prev);
        (ids, keys)
    }
}

// -- State helpers (free functions keep borrow scopes tight) -----------------

fn alloc_leaf(hdr: &mut TreeHeader) -> u64 {
    hdr.leaf_seq += 1;
    hdr.leaf_seq
}

fn alloc_node(hdr: &mut TreeHeader) -> u64 {
    hdr.node_seq += 1;
    NODE_ID_BASE + hdr.node_seq
}

fn put_leaf(st: &mut TreeState, id: u64, leaf: Leaf, dirty: bool) {
    if let Some((old_id, old)) = st.leaves.push(id, Cached { page: leaf, dirty }) {
        if old_id != id && old.dirty {
            st.spill.insert(old_id, Page::Leaf(old.page));
        }
    }
}

fn put_node(st: &mut TreeState, id: u64, node: NodePage, dirty: bool) {
    if let Some((old_id, old)) = st.nodes.push(id, Cached { page: node, dirty }) {
        if old_id != id && old.dirty {
            st.spill.insert(old_id, Page::Node(old.page));
        }
    }
}

fn load_leaf<'a>(db: &DbHandle, st: &'a mut TreeState, id: u64) -> Result<&'a mut Leaf> {
    if !st.leaves.contains(&id) {
        let leaf = if let Some(Page::Leaf(leaf)) = st.spill.remove(&id) {
            leaf
        } else {
            let data = db
                .get(&page_key(id))?
                .ok_or_else(|| Error::Corrupt(format!("missing leaf page {id:x}")))?;
            decode_leaf(&data)?
        };
        put_leaf(st, id, leaf, false);
    }
    Ok(&mut st.leaves.get_mut(&id).unwrap().page)
}

fn load_node<'a>(db: &DbHandle, st: &'a mut TreeState, id: u64) -> Result<&'a mut NodePage> {
    if !st.nodes.contains(&id) {
        let node = if let Some(Page::Node(node)) = st.spill.remove(&id) {
            node
        } else {
            let data = db
                .get(&page_key(id))?
                .ok_or_else(|| Error::Corrupt(format!("missing node page #{:x}", id - NODE_ID_BASE)))?;
            decode_node(&data)?
        };
        put_node(st, id, node, false);
    }
    Ok(&mut st.nodes.get_mut(&id).unwrap().page)
}

fn mark_leaf_dirty(st: &mut TreeState, id: u64) {
    if let Some(c) = st.leaves.get_mut(&id) {
        c.dirty = true;
    }
}

fn mark_node_dirty(st: &mut TreeState, id: u64) {
    if let Some(c) = st.nodes.get_mut(&id) {
        c.dirty = true;
    }
}

fn is_node_id(id: u64) -> bool {
    id >= NODE_ID_BASE
}

/// Walk from the root to the leaf responsible for `key`, recording the node
/// path (root first).
fn descend(db: &DbHandle, st: &mut TreeState, key: &[u8]) -> Result<(u64, Vec<u64>)> {
    let cmp = st.hdr.cmp;
    let mut cur = st.hdr.root;
    let mut path = Vec::new();
    while is_node_id(cur) {
        path.push(cur);
        let node = load_node(db, st, cur)?;
        let pos = node
            .entries
            .partition_point(|(_, k)| cmp.cmp(k, key) != std::cmp::Ordering::Greater);
        cur = if pos == 0 {
            node.heir
        } else {
            node.entries[pos - 1].0
        };
    }
    Ok((cur, path))
}

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Pos {
    leaf: u64,
    kidx: usize,
    vidx: usize,
    key: Vec<u8>,
    clock: u64,
}

/// Cursor over a tree in comparator order. A cursor stores its page position
/// plus a clock stamp; any tree mutation bumps the clock and the cursor
/// re-locates itself by its current key on the next operation.
pub struct BtCursor<'t> {
    tree: &'t Btree,
    pos: Option<Pos>,
}

impl<'t> BtCursor<'t> {
    /// Position on the first record. Returns true if the tree is non-empty.
    pub fn first(&mut self) -> Result<bool> {
        let st = &mut *self.tree.state.lock().unwrap();
        self.pos = first_pos(&self.tree.db, st)?;
        Ok(self.pos.is_some())
    }

    pub fn last(&mut self) -> Result<bool> {
        let st = &mut *self.tree.state.lock().unwrap();
        self.pos = last_pos(&self.tree.db, st)?;
        Ok(self.pos.is_some())
    }

    /// Position on the first record with key >= `key`.
    pub fn jump_fwd(&mut self, key: &[u8]) -> Result<bool> {
        let st = &mut *self.tree.state.lock().unwrap();
        self.pos = seek_fwd(&self.tree.db, st, key)?;
        Ok(self.pos.is_some())
    }

    /// Position on the last record with key <= `key`.
    pub fn jump_back(&mut self, key: &[u8]) -> Result<bool> {
        let st = &mut *self.tree.state.lock().unwrap();
        self.pos = seek_back(&self.tree.db, st, key)?;
        Ok(self.pos.is_some())
    }

    /// The (key, value) under the cursor.
    pub fn record(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let st = &mut *self.tree.state.lock().unwrap();
        self.revalidate(st)?;
        let Some(pos) = &self.pos else {
            return Ok(None);
        };
        let leaf = load_leaf(&self.tree.db, st, pos.leaf)?;
        let rec = &leaf.recs[pos.kidx];
        Ok(Some((rec.key.clone(), rec.vals[pos.vidx].clone())))
    }

    /// Advance to the next value. Returns false when exhausted.
    pub fn next(&mut self) -> Result<bool> {
        let st = &mut *self.tree.state.lock().unwrap();
        self.revalidate(st)?;
        let Some(pos) = self.pos.take() else {
            return Ok(false);
        };
        self.pos = step_fwd(&self.tree.db, st, pos)?;
        Ok(self.pos.is_some())
    }

    /// Step to the previous value. Returns false when exhausted.
    pub fn prev(&mut self) -> Result<bool> {
        let st = &mut *self.tree.state.lock().unwrap();
        self.revalidate(st)?;
        let Some(pos) = self.pos.take() else {
            return Ok(false);
        };
        self.pos = step_back(&self.tree.db, st, pos)?;
        Ok(self.pos.is_some())
    }

    /// Remove the value under the cursor, advancing past it.
    pub fn out(&mut self) -> Result<bool> {
        let Some((key, val)) = self.record()? else {
            return Ok(false);
        };
        self.next()?;
        self.tree.del_kv(&key, &val)?;
        Ok(true)
    }

    /// Replace the value under the cursor.
    pub fn put_current(&mut self, value: &[u8]) -> Result<bool> {
        self.put_at(value, PutAt::Current)
    }

    /// Insert a duplicate value before the one under the cursor.
    pub fn put_before(&mut self, value: &[u8]) -> Result<bool> {
        self.put_at(value, PutAt::Before)
    }

    /// Insert a duplicate value after the one under the cursor.
    pub fn put_after(&mut self, value: &[u8]) -> Result<bool> {
        self.put_at(value, PutAt::After)
    }

    fn put_at(&mut self, value: &[u8], at: PutAt) -> Result<bool> {
        let st = &mut *self.tree.state.lock().unwrap();
        self.revalidate(st)?;
        let Some(pos) = &mut self.pos else {
            return Ok(false);
        };
        {
            let leaf = load_leaf(&self.tree.db, st, pos.leaf)?;
            let rec = &mut leaf.recs[pos.kidx];
            match at {
                PutAt::Current => rec.vals[pos.vidx] = value.to_vec(),
                PutAt::Before => rec.vals.insert(pos.vidx, value.to_vec()),
                PutAt::After => rec.vals.insert(pos.vidx + 1, value.to_vec()),
            }
        }
        mark_leaf_dirty(st, pos.leaf);
        if at != PutAt::Current {
            st.hdr.record_count += 1;
        }
        st.hdr_dirty = true;
        st.clock += 1;
        // Keep this cursor valid across its own mutation.
        pos.clock = st.clock;
        Ok(true)
    }

    fn revalidate(&mut self, st: &mut TreeState) -> Result<()> {
        let Some(pos) = &self.pos else {
            return Ok(());
        };
        if pos.clock == st.clock {
            return Ok(());
        }
        let key = pos.key.clone();
        self.pos = seek_fwd(&self.tree.db, st, &key)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PutAt {
    Current,
    Before,
    After,
}

fn make_pos(st: &TreeState, leaf: u64, kidx: usize, vidx: usize, key: Vec<u8>) -> Pos {
    Pos {
        leaf,
        kidx,
        vidx,
        key,
        clock: st.clock,
    }
}

fn first_pos(db: &DbHandle, st: &mut TreeState) -> Result<Option<Pos>> {
    let mut leaf_id = st.hdr.first_leaf;
    while leaf_id != 0 {
        let (empty, next, key) = {
            let leaf = load_leaf(db, st, leaf_id)?;
            match leaf.recs.first() {
                Some(rec) => (false, 0, rec.key.clone()),
                None => (true, leaf.next, Vec::new()),
            }
        };
        if !empty {
            return Ok(Some(make_pos(st, leaf_id, 0, 0, key)));
        }
        leaf_id = next;
    }
    Ok(None)
}

fn last_pos(db: &DbHandle, st: &mut TreeState) -> Result<Option<Pos>> {
    let mut leaf_id = st.hdr.last_leaf;
    while leaf_id != 0 {
        let info = {
            let leaf = load_leaf(db, st, leaf_id)?;
            match leaf.recs.last() {
                Some(rec) => Ok((leaf.recs.len() - 1, rec.vals.len() - 1, rec.key.clone())),
                None => Err(leaf.prev),
            }
        };
        match info {
            Ok((kidx, vidx, key)) => return Ok(Some(make_pos(st, leaf_id, kidx, vidx, key))),
            Err(prev) => leaf_id = prev,
        }
    }
    Ok(None)
}

fn seek_fwd(db: &DbHandle, st: &mut TreeState, key: &[u8]) -> Result<Option<Pos>> {
    if st.hdr.root == 0 {
        return Ok(None);
    }
    let cmp = st.hdr.cmp;
    let (mut leaf_id, _) = descend(db, st, key)?;
    loop {
        let (found, next) = {
            let leaf = load_leaf(db, st, leaf_id)?;
            let kidx = leaf
                .recs
                .partition_point(|r| cmp.cmp(&r.key, key) == std::cmp::Ordering::Less);
            if kidx < leaf.recs.len() {
                (Some((kidx, leaf.recs[kidx].key.clone())), 0)
            } else {
                (None, leaf.next)
            }
        };
        if let Some((kidx, rkey)) = found {
            return Ok(Some(make_pos(st, leaf_id, kidx, 0, rkey)));
        }
        if next == 0 {
            return Ok(None);
        }
        leaf_id = next;
    }
}

fn seek_back(db: &DbHandle, st: &mut TreeState, key: &[u8]) -> Result<Option<Pos>> {
    if st.hdr.root == 0 {
        return Ok(None);
    }
    let cmp = st.hdr.cmp;
    let (mut leaf_id, _) = descend(db, st, key)?;
    loop {
        let (found, prev) = {
            let leaf = load_leaf(db, st, leaf_id)?;
            let kidx = leaf
                .recs
                .partition_point(|r| cmp.cmp(&r.key, key) != std::cmp::Ordering::Greater);
            if kidx > 0 {
                let rec = &leaf.recs[kidx - 1];
                (
                    Some((kidx - 1, rec.vals.len() - 1, rec.key.clone())),
                    0,
                )
            } else {
                (None, leaf.prev)
            }
        };
        if let Some((kidx, vidx, rkey)) = found {
            return Ok(Some(make_pos(st, leaf_id, kidx, vidx, rkey)));
        }
        if prev == 0 {
            return Ok(None);
        }
        leaf_id = prev;
    }
}

fn step_fwd(db: &DbHandle, st: &mut TreeState, pos: Pos) -> Result<Option<Pos>> {
    let (nvals, nrecs, next) = {
        let leaf = load_leaf(db, st, pos.leaf)?;
        (
            leaf.recs[pos.kidx].vals.len(),
            leaf.recs.len(),
            leaf.next,
        )
    };
    if pos.vidx + 1 < nvals {
        return Ok(Some(Pos {
            vidx: pos.vidx + 1,
            ..pos
        }));
    }
    if pos.kidx + 1 < nrecs {
        let key = {
            let leaf = load_leaf(db, st, pos.leaf)?;
            leaf.recs[pos.kidx + 1].key.clone()
        };
        return Ok(Some(make_pos(st, pos.leaf, pos.kidx + 1, 0, key)));
    }
    let mut leaf_id = next;
    while leaf_id != 0 {
        let (empty, next, key) = {
            let leaf = load_leaf(db, st, leaf_id)?;
            match leaf.recs.first() {
                Some(rec) => (false, 0, rec.key.clone()),
                None => (true, leaf.next, Vec::new()),
            }
        };
        if !empty {
            return Ok(Some(make_pos(st, leaf_id, 0, 0, key)));
        }
        leaf_id = next;
    }
    Ok(None)
}

fn step_back(db: &DbHandle, st: &mut TreeState, pos: Pos) -> Result<Option<Pos>> {
    if pos.vidx > 0 {
        return Ok(Some(Pos {
            vidx: pos.vidx - 1,
            ..pos
        }));
    }
    if pos.kidx > 0 {
        let (key, vidx) = {
            let leaf = load_leaf(db, st, pos.leaf)?;
            let rec = &leaf.recs[pos.kidx - 1];
            (rec.key.clone(), rec.vals.len() - 1)
        };
        return Ok(Some(make_pos(st, pos.leaf, pos.kidx - 1, vidx, key)));
    }
    let mut leaf_id = {
        let leaf = load_leaf(db, st, pos.leaf)?;
        leaf.prev
    };
    while leaf_id != 0 {
        let info = {
            let leaf = load_leaf(db, st, leaf_id)?;
            match leaf.recs.last() {
                Some(rec) => Ok((leaf.recs.len() - 1, rec.vals.len() - 1, rec.key.clone())),
                None => Err(leaf.prev),
            }
        };
        match info {
            Ok((kidx, vidx, key)) => return Ok(Some(make_pos(st, leaf_id, kidx, vidx, key))),
            Err(prev) => leaf_id = prev,
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{FileKv, Kv, OpenFlags, WalOpts};
    use tempfile::TempDir;

    fn open_tree(dir: &TempDir) -> (FileKv, Btree) {
        let kv = FileKv::open(
            &dir.path().join("kv.dat"),
            OpenFlags::default(),
            WalOpts::default(),
        )
        .unwrap();
        let db = kv.database(9).unwrap();
        // Small page limits so a few dozen keys exercise splits.
        let tree = Btree::with_limits(db, Comparator::Lexical, 4, 4).unwrap();
        (kv, tree)
    }

    fn commit(kv: &FileKv, tree: &Btree) {
        let mut txn = kv.begin().unwrap();
        tree.flush(txn.as_mut()).unwrap();
        txn.commit().unwrap();
    }

    fn key(i: u32) -> Vec<u8> {
        format!("k{i:05}").into_bytes()
    }

    #[test]
    fn ordered_iteration_across_splits() {
        let dir = TempDir::new().unwrap();
        let (kv, tree) = open_tree(&dir);
        // Insert in a scrambled order.
        let mut order: Vec<u32> = (0..200).collect();
        for i in 0..order.len() {
            order.swap(i, (i * 131 + 17) % 200);
        }
        for i in &order {
            tree.put(&key(*i), &i.to_le_bytes()).unwrap();
        }
        commit(&kv, &tree);
        assert_eq!(tree.record_count(), 200);

        let (_, keys) = tree.check_sibling_chain();
        let expected: Vec<Vec<u8>> = (0..200).map(key).collect();
        assert_eq!(keys, expected);

        let mut cur = tree.cursor();
        assert!(cur.first().unwrap());
        let mut seen = Vec::new();
        loop {
            let Some((k, _)) = cur.record().unwrap() else {
                break;
            };
            seen.push(k);
            if !cur.next().unwrap() {
                break;
            }
        }
        assert_eq!(seen, expected);
    }

    #[test]
    fn unique_put_rejects_duplicates() {
        let dir = TempDir::new().unwrap();
        let (_kv, tree) = open_tree(&dir);
        tree.put(b"a", b"1").unwrap();
        let err = tree.put(b"a", b"2");
        assert!(matches!(err, Err(Error::UniqueViolation(_))));
        assert_eq!(tree.record_count(), 1);
    }

    #[test]
    fn duplicate_values_keep_order() {
        let dir = TempDir::new().unwrap();
        let (_kv, tree) = open_tree(&dir);
        tree.put_dup(b"k", b"1").unwrap();
        tree.put_dup(b"k", b"2").unwrap();
        tree.put_dup_back(b"k", b"0").unwrap();
        let vals: Vec<Vec<u8>> = tree.get(b"k").unwrap().collect();
        assert_eq!(vals, vec![b"0".to_vec(), b"1".to_vec(), b"2".to_vec()]);
        assert_eq!(tree.record_count(), 3);
    }

    #[test]
    fn del_and_del_kv() {
        let dir = TempDir::new().unwrap();
        let (_kv, tree) = open_tree(&dir);
        tree.put_dup(b"k", b"1").unwrap();
        tree.put_dup(b"k", b"2").unwrap();
        assert!(tree.del_kv(b"k", b"1").unwrap());
        assert!(!tree.del_kv(b"k", b"1").unwrap());
        assert_eq!(tree.get(b"k").unwrap().collect::<Vec<_>>(), vec![b"2".to_vec()]);
        assert!(tree.del(b"k").unwrap());
        assert!(!tree.del(b"k").unwrap());
        assert_eq!(tree.record_count(), 0);
    }

    #[test]
    fn empty_leaves_unlink_from_chain() {
        let dir = TempDir::new().unwrap();
        let (kv, tree) = open_tree(&dir);
        for i in 0..100 {
            tree.put(&key(i), b"v").unwrap();
        }
        // Carve out the middle so interior leaves die.
        for i in 20..80 {
            assert!(tree.del(&key(i)).unwrap());
        }
        commit(&kv, &tree);
        let (_, keys) = tree.check_sibling_chain();
        let expected: Vec<Vec<u8>> = (0..20).chain(80..100).map(key).collect();
        assert_eq!(keys, expected);
        assert_eq!(tree.record_count(), 40);
    }

    #[test]
    fn delete_everything_then_reinsert() {
        let dir = TempDir::new().unwrap();
        let (kv, tree) = open_tree(&dir);
        for i in 0..50 {
            tree.put(&key(i), b"v").unwrap();
        }
        for i in 0..50 {
            assert!(tree.del(&key(i)).unwrap());
        }
        assert_eq!(tree.record_count(), 0);
        let mut cur = tree.cursor();
        assert!(!cur.first().unwrap());
        tree.put(b"again", b"v").unwrap();
        commit(&kv, &tree);
        assert_eq!(tree.get(b"again").unwrap().count(), 1);
    }

    #[test]
    fn jump_fwd_and_back() {
        let dir = TempDir::new().unwrap();
        let (_kv, tree) = open_tree(&dir);
        for i in [10u32, 20, 30, 40] {
            tree.put(&key(i), b"v").unwrap();
        }
        let mut cur = tree.cursor();
        assert!(cur.jump_fwd(&key(15)).unwrap());
        assert_eq!(cur.record().unwrap().unwrap().0, key(20));
        assert!(cur.jump_fwd(&key(20)).unwrap());
        assert_eq!(cur.record().unwrap().unwrap().0, key(20));
        assert!(!cur.jump_fwd(&key(41)).unwrap());

        assert!(cur.jump_back(&key(35)).unwrap());
        assert_eq!(cur.record().unwrap().unwrap().0, key(30));
        assert!(cur.jump_back(&key(10)).unwrap());
        assert_eq!(cur.record().unwrap().unwrap().0, key(10));
        assert!(!cur.jump_back(&key(9)).unwrap());
    }

    #[test]
    fn reverse_iteration() {
        let dir = TempDir::new().unwrap();
        let (_kv, tree) = open_tree(&dir);
        for i in 0..30 {
            tree.put(&key(i), b"v").unwrap();
        }
        let mut cur = tree.cursor();
        assert!(cur.last().unwrap());
        let mut seen = Vec::new();
        loop {
            let Some((k, _)) = cur.record().unwrap() else {
                break;
            };
            seen.push(k);
            if !cur.prev().unwrap() {
                break;
            }
        }
        let expected: Vec<Vec<u8>> = (0..30).rev().map(key).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn cursor_survives_mutation() {
        let dir = TempDir::new().unwrap();
        let (_kv, tree) = open_tree(&dir);
        for i in 0..20 {
            tree.put(&key(i), b"v").unwrap();
        }
        let mut cur = tree.cursor();
        assert!(cur.jump_fwd(&key(5)).unwrap());
        assert_eq!(cur.record().unwrap().unwrap().0, key(5));
        // Structural churn while the cursor is parked.
        for i in 20..60 {
            tree.put(&key(i), b"v").unwrap();
        }
        tree.del(&key(6)).unwrap();
        // The cursor re-seeks by its saved key and continues in order.
        assert!(cur.next().unwrap());
        assert_eq!(cur.record().unwrap().unwrap().0, key(7));
    }

    #[test]
    fn cursor_out_removes_values() {
        let dir = TempDir::new().unwrap();
        let (_kv, tree) = open_tree(&dir);
        tree.put_dup(b"k", b"1").unwrap();
        tree.put_dup(b"k", b"2").unwrap();
        tree.put(b"z", b"3").unwrap();
        let mut cur = tree.cursor();
        assert!(cur.first().unwrap());
        assert!(cur.out().unwrap());
        assert_eq!(tree.get(b"k").unwrap().collect::<Vec<_>>(), vec![b"2".to_vec()]);
        assert_eq!(tree.record_count(), 2);
    }

    #[test]
    fn cursor_put_current_and_neighbors() {
        let dir = TempDir::new().unwrap();
        let (_kv, tree) = open_tree(&dir);
        tree.put_dup(b"k", b"b").unwrap();
        let mut cur = tree.cursor();
        assert!(cur.first().unwrap());
        assert!(cur.put_before(b"a").unwrap());
        assert!(cur.put_after(b"c").unwrap());
        assert!(cur.put_current(b"B").unwrap());
        let vals: Vec<Vec<u8>> = tree.get(b"k").unwrap().collect();
        assert_eq!(vals, vec![b"a".to_vec(), b"B".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn persistence_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kv.dat");
        {
            let kv = FileKv::open(&path, OpenFlags::default(), WalOpts::default()).unwrap();
            let db = kv.database(9).unwrap();
            let tree = Btree::with_limits(db, Comparator::Lexical, 4, 4).unwrap();
            for i in 0..100 {
                tree.put(&key(i), &i.to_le_bytes()).unwrap();
            }
            let mut txn = kv.begin().unwrap();
            tree.flush(txn.as_mut()).unwrap();
            txn.commit().unwrap();
            kv.close().unwrap();
        }
        let kv = FileKv::open(&path, OpenFlags::default(), WalOpts::default()).unwrap();
        let db = kv.database(9).unwrap();
        let tree = Btree::with_limits(db, Comparator::Lexical, 4, 4).unwrap();
        assert_eq!(tree.record_count(), 100);
        for i in (0..100).step_by(7) {
            let vals: Vec<Vec<u8>> = tree.get(&key(i)).unwrap().collect();
            assert_eq!(vals, vec![i.to_le_bytes().to_vec()]);
        }
        let (_, keys) = tree.check_sibling_chain();
        assert_eq!(keys.len(), 100);
    }

    #[test]
    fn abort_discards_uncommitted_changes() {
        let dir = TempDir::new().unwrap();
        let (kv, tree) = open_tree(&dir);
        tree.put(b"committed", b"v").unwrap();
        commit(&kv, &tree);
        tree.put(b"pending", b"v").unwrap();
        tree.abort().unwrap();
        assert!(tree.contains(b"committed").unwrap());
        assert!(!tree.contains(b"pending").unwrap());
        assert_eq!(tree.record_count(), 1);
    }

    #[test]
    fn comparator_mismatch_on_open() {
        let dir = TempDir::new().unwrap();
        let kv = FileKv::open(
            &dir.path().join("kv.dat"),
            OpenFlags::default(),
            WalOpts::default(),
        )
        .unwrap();
        let db = kv.database(9).unwrap();
        {
            let tree = Btree::open(db.clone(), Comparator::Int64).unwrap();
            tree.put(&1i64.to_le_bytes(), b"v").unwrap();
            let mut txn = kv.begin().unwrap();
            tree.flush(txn.as_mut()).unwrap();
            txn.commit().unwrap();
        }
        let err = Btree::open(db, Comparator::Lexical);
        assert!(matches!(err, Err(Error::InvalidState(_))));
    }

    #[test]
    fn int64_comparator_orders_negatives() {
        let dir = TempDir::new().unwrap();
        let kv = FileKv::open(
            &dir.path().join("kv.dat"),
            OpenFlags::default(),
            WalOpts::default(),
        )
        .unwrap();
        let db = kv.database(9).unwrap();
        let tree = Btree::with_limits(db, Comparator::Int64, 4, 4).unwrap();
        for v in [5i64, -3, 100, 0, -77, 42] {
            tree.put(&v.to_le_bytes(), b"v").unwrap();
        }
        let mut cur = tree.cursor();
        assert!(cur.first().unwrap());
        let mut seen = Vec::new();
        loop {
            let Some((k, _)) = cur.record().unwrap() else {
                break;
            };
            seen.push(i64::from_le_bytes(k.try_into().unwrap()));
            if !cur.next().unwrap() {
                break;
            }
        }
        assert_eq!(seen, vec![-77, -3, 0, 5, 42, 100]);
    }

    #[test]
    fn decimal_comparator_orders_fixed_precision() {
        let a = b"2.500000";
        let b = b"10.000000";
        let c = b"-3.100000";
        let d = b"2.500001";
        assert_eq!(cmp_decimal(a, b), std::cmp::Ordering::Less);
        assert_eq!(cmp_decimal(c, a), std::cmp::Ordering::Less);
        assert_eq!(cmp_decimal(a, d), std::cmp::Ordering::Less);
        assert_eq!(cmp_decimal(b"0.000000", b"-0.000000"), std::cmp::Ordering::Equal);
        assert_eq!(cmp_decimal(b"-2.500000", b"-10.000000"), std::cmp::Ordering::Greater);
    }

    #[test]
    fn corrupt_page_reported() {
        let dir = TempDir::new().unwrap();
        let kv = FileKv::open(
            &dir.path().join("kv.dat"),
            OpenFlags::default(),
            WalOpts::default(),
        )
        .unwrap();
        let db = kv.database(9).unwrap();
        {
            let tree = Btree::with_limits(db.clone(), Comparator::Lexical, 4, 4).unwrap();
            tree.put(b"a", b"v").unwrap();
            let mut txn = kv.begin().unwrap();
            tree.flush(txn.as_mut()).unwrap();
            txn.commit().unwrap();
        }
        // Truncate the root leaf page behind the tree's back.
        let mut txn = kv.begin().unwrap();
        txn.put(9, b"1".to_vec(), vec![0x81]);
        txn.commit().unwrap();
        let tree = Btree::with_limits(db, Comparator::Lexical, 4, 4).unwrap();
        let err = tree.get(b"a");
        assert!(matches!(err, Err(Error::Corrupt(_))));
    }
}
