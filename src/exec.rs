use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;

use crate::bdoc::{Bdoc, BdocView};
use crate::btree::Btree;
use crate::engine::{id_key, literal_index_key, CollInner, OpalDb};
use crate::error::{Error, Result};
use crate::jql::{CompOp, Expr, FilterNode, Join, Lhs, Query};
use crate::kv::KvSnapshot;
use crate::meta::IDX_STR;
use crate::node::JsonNode;
use crate::patch;
use crate::pointer::{Pointer, Token};

/// Visitor verdict for one document.
pub enum Step {
    Continue,
    Stop,
    /// Replace the document with this tree and continue.
    Update(JsonNode),
    /// Delete the document and continue.
    Delete,
}

/// What the visitor sees for one matched document.
pub struct ExecDoc<'a> {
    pub id: i64,
    /// Packed document, after any `apply`/projection. Valid for the callback.
    pub doc: &'a Bdoc,
    /// Parsed tree, present when the query has `apply` or `fields`.
    pub node: Option<&'a JsonNode>,
}

pub type Visitor<'v> = dyn FnMut(ExecDoc<'_>) -> Result<Step> + 'v;

pub(crate) struct ExecOutcome {
    /// Documents that passed the skip/limit window.
    pub count: u64,
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

enum Strategy {
    FullScan,
    IndexEq {
        path: String,
        key: Vec<u8>,
    },
    IndexIn {
        path: String,
        keys: Vec<Vec<u8>>,
    },
    IndexRange {
        path: String,
        lower: Option<(Vec<u8>, bool)>,
        upper: Option<(Vec<u8>, bool)>,
    },
    IndexPrefix {
        path: String,
        prefix: Vec<u8>,
    },
}

struct Plan {
    strategy: Strategy,
    /// Index keys alone decide membership; document bodies need no parsing.
    covered: bool,
    /// The ordering is produced by iteration order; no sort needed.
    order_fused: bool,
    /// Iterate the source backwards.
    backward: bool,
}

fn escape_segment(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

/// Pick the cheapest index strategy for the query, writing one line per
/// decision into the explain sink.
fn plan_query(
    q: &Query,
    inner: &CollInner,
    log: &mut Option<&mut String>,
) -> Result<Plan> {
    let mut plan = Plan {
        strategy: Strategy::FullScan,
        covered: false,
        order_fused: false,
        backward: q.inverse,
    };
    if q.noidx {
        logln(log, "index use disabled by 'noidx', full scan");
        return Ok(plan);
    }
    if inner.meta.indexes.is_empty() {
        logln(log, "no indexes on collection, full scan");
        return Ok(plan);
    }

    // Candidate predicates come from the leading run of plain key nodes
    // followed by one expression node with 'and'-joined terms.
    let mut prefix = String::new();
    let mut exprs: Option<&[(Join, Expr)]> = None;
    for node in &q.nodes {
        match node {
            FilterNode::Key(k) => {
                prefix.push('/');
                prefix.push_str(&escape_segment(k));
            }
            FilterNode::Exprs(list) => {
                if list.iter().skip(1).any(|(j, _)| *j == Join::Or) {
                    logln(log, "'or' joined expressions, full scan");
                    return Ok(plan);
                }
                exprs = Some(list);
                break;
            }
            _ => break,
        }
    }
    let Some(exprs) = exprs else {
        logln(log, "no indexable expression node, full scan");
        return Ok(plan);
    };
    let single_expr_root = q.nodes.len() == 1 && exprs.len() == 1;

    // Rank: unique eq < unique in < unique range < dup eq < dup in < dup range.
    let mut best: Option<(u32, Strategy, bool)> = None;
    let mut consider = |cost: u32, strategy: Strategy, covered: bool| {
        if best.as_ref().is_none_or(|(c, _, _)| cost < *c) {
            best = Some((cost, strategy, covered));
        }
    };

    for idx in &inner.meta.indexes {
        let mut lower: Option<(Vec<u8>, bool)> = None;
        let mut upper: Option<(Vec<u8>, bool)> = None;
        let mut range_exprs = 0usize;
        let base = if idx.mode.unique() { 0 } else { 3 };
        let cmp = idx.mode.comparator();

        for (_, expr) in exprs {
            let Lhs::Key(k) = &expr.lhs else { continue };
            let path = format!("{prefix}/{}", escape_segment(k));
            if path != idx.path {
                continue;
            }
            match expr.op {
                CompOp::Eq => {
                    if let Ok(node) = q.resolve_node(&expr.rhs) {
                        if let Some(key) = literal_index_key(node, idx.mode) {
                            consider(
                                base + 1,
                                Strategy::IndexEq {
                                    path: idx.path.clone(),
                                    key,
                                },
                                single_expr_root,
                            );
                        }
                    }
                }
                CompOp::In => {
                    if let Ok(JsonNode::Array(items)) = q.resolve_node(&expr.rhs) {
                        let mut keys: Vec<Vec<u8>> = items
                            .iter()
                            .filter_map(|n| literal_index_key(n, idx.mode))
                            .collect();
                        if keys.len() == items.len() {
                            keys.sort_by(|a, b| cmp.cmp(a, b));
                            keys.dedup();
                            consider(
                                base + 2,
                                Strategy::IndexIn {
                                    path: idx.path.clone(),
                                    keys,
                                },
                                single_expr_root,
                            );
                        }
                    }
                }
                CompOp::Gt | CompOp::Ge | CompOp::Lt | CompOp::Le => {
                    if let Ok(node) = q.resolve_node(&expr.rhs) {
                        if let Some(key) = literal_index_key(node, idx.mode) {
                            range_exprs += 1;
                            match expr.op {
                                CompOp::Gt => merge_lower(&mut lower, key, false, cmp),
                                CompOp::Ge => merge_lower(&mut lower, key, true, cmp),
                                CompOp::Lt => merge_upper(&mut upper, key, false, cmp),
                                CompOp::Le => merge_upper(&mut upper, key, true, cmp),
                                _ => unreachable!(),
                            }
                        }
                    }
                }
                CompOp::Prefix => {
                    if idx.mode.type_bits() == IDX_STR {
                        if let Some(p) = q.operand_str(expr) {
                            consider(
                                base + 3,
                                Strategy::IndexPrefix {
                                    path: idx.path.clone(),
                                    prefix: p.into_bytes(),
                                },
                                single_expr_root,
                            );
                        }
                    }
                }
                CompOp::Like => {
                    // Only a single trailing wildcard makes a prefix scan.
                    if idx.mode.type_bits() == IDX_STR {
                        if let Some(p) = q.operand_str(expr) {
                            if p.ends_with('%') && !p[..p.len() - 1].contains('%') {
                                consider(
                                    base + 3,
                                    Strategy::IndexPrefix {
                                        path: idx.path.clone(),
                                        prefix: p[..p.len() - 1].to_string().into_bytes(),
                                    },
                                    single_expr_root,
                                );
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        if lower.is_some() || upper.is_some() {
            // A range covers the predicate only when built from every term.
            let covered = single_expr_root && range_exprs == 1;
            consider(
                base + 3,
                Strategy::IndexRange {
                    path: idx.path.clone(),
                    lower,
                    upper,
                },
                covered,
            );
        }
    }

    let Some((cost, strategy, covered)) = best else {
        logln(log, "no index matches the filter shape, full scan");
        return Ok(plan);
    };
    let path = match &strategy {
        Strategy::IndexEq { path, .. }
        | Strategy::IndexIn { path, .. }
        | Strategy::IndexRange { path, .. }
        | Strategy::IndexPrefix { path, .. } => path.clone(),
        Strategy::FullScan => unreachable!(),
    };
    let kind = match &strategy {
        Strategy::IndexEq { .. } => "eq",
        Strategy::IndexIn { .. } => "in",
        Strategy::IndexRange { .. } => "range",
        Strategy::IndexPrefix { .. } => "prefix",
        Strategy::FullScan => unreachable!(),
    };
    logln(log, &format!("selected index {path} for {kind} scan, cost {cost}"));
    plan.strategy = strategy;
    plan.covered = covered;

    // Reuse index order for a single order key over the same path.
    if q.order.len() == 1 && q.order[0].0.to_string() == path {
        plan.order_fused = true;
        plan.backward = q.order[0].1 != q.inverse;
        logln(log, "ordering satisfied by index order, sort elided");
    }
    Ok(plan)
}

fn merge_lower(
    lower: &mut Option<(Vec<u8>, bool)>,
    key: Vec<u8>,
    inclusive: bool,
    cmp: crate::btree::Comparator,
) {
    let tighter = match lower {
        None => true,
        Some((cur, cur_incl)) => match cmp.cmp(&key, cur) {
            Ordering::Greater => true,
            Ordering::Equal => *cur_incl && !inclusive,
            Ordering::Less => false,
        },
    };
    if tighter {
        *lower = Some((key, inclusive));
    }
}

fn merge_upper(
    upper: &mut Option<(Vec<u8>, bool)>,
    key: Vec<u8>,
    inclusive: bool,
    cmp: crate::btree::Comparator,
) {
    let tighter = match upper {
        None => true,
        Some((cur, cur_incl)) => match cmp.cmp(&key, cur) {
            Ordering::Less => true,
            Ordering::Equal => *cur_incl && !inclusive,
            Ordering::Greater => false,
        },
    };
    if tighter {
        *upper = Some((key, inclusive));
    }
}

fn logln(log: &mut Option<&mut String>, line: &str) {
    if let Some(buf) = log {
        buf.push_str(line);
        buf.push('\n');
    }
}

// ---------------------------------------------------------------------------
// Candidate id streams
// ---------------------------------------------------------------------------

/// Ids produced by the chosen strategy, in iteration order.
fn candidate_ids(
    plan: &Plan,
    inner: &CollInner,
    snap: &dyn KvSnapshot,
) -> Result<Vec<i64>> {
    let mut ids = Vec::new();
    match &plan.strategy {
        Strategy::FullScan => {
            let db = inner.meta.db_id;
            let mut cursor: Option<Vec<u8>> = None;
            loop {
                let entry = match (&cursor, plan.backward) {
                    (None, false) => snap.first(db),
                    (None, true) => snap.last(db),
                    (Some(last), false) => snap.next_above(db, last, false),
                    (Some(last), true) => snap.prev_below(db, last, false),
                };
                let Some((key, _)) = entry else { break };
                if key.len() == 8 {
                    ids.push(u64::from_be_bytes(key[..8].try_into().unwrap()) as i64);
                }
                cursor = Some(key);
            }
        }
        Strategy::IndexEq { path, key } => {
            let tree = index_tree(inner, path)?;
            for val in tree.get(key)? {
                ids.push(decode_id(&val)?);
            }
            if plan.backward {
                ids.reverse();
            }
        }
        Strategy::IndexIn { path, keys } => {
            let tree = index_tree(inner, path)?;
            if plan.backward {
                for key in keys.iter().rev() {
                    let mut vals: Vec<i64> =
                        tree.get(key)?.map(|v| decode_id(&v)).collect::<Result<_>>()?;
                    vals.reverse();
                    ids.extend(vals);
                }
            } else {
                for key in keys {
                    for val in tree.get(key)? {
                        ids.push(decode_id(&val)?);
                    }
                }
            }
        }
        Strategy::IndexRange { path, lower, upper } => {
            let tree = index_tree(inner, path)?;
            let cmp = tree.comparator();
            let mut cur = tree.cursor();
            let in_lower = |key: &[u8]| match lower {
                None => true,
                Some((b, true)) => cmp.cmp(key, b) != Ordering::Less,
                Some((b, false)) => cmp.cmp(key, b) == Ordering::Greater,
            };
            let in_upper = |key: &[u8]| match upper {
                None => true,
                Some((b, true)) => cmp.cmp(key, b) != Ordering::Greater,
                Some((b, false)) => cmp.cmp(key, b) == Ordering::Less,
            };
            if plan.backward {
                let positioned = match upper {
                    Some((b, _)) => cur.jump_back(b)?,
                    None => cur.last()?,
                };
                if positioned {
                    loop {
                        let Some((key, val)) = cur.record()? else { break };
                        if !in_lower(&key) {
                            break;
                        }
                        if in_upper(&key) {
                            ids.push(decode_id(&val)?);
                        }
                        if !cur.prev()? {
                            break;
                        }
                    }
                }
            } else {
                let positioned = match lower {
                    Some((b, _)) => cur.jump_fwd(b)?,
                    None => cur.first()?,
                };
                if positioned {
                    loop {
                        let Some((key, val)) = cur.record()? else { break };
                        if !in_upper(&key) {
                            break;
                        }
                        if in_lower(&key) {
                            ids.push(decode_id(&val)?);
                        }
                        if !cur.next()? {
                            break;
                        }
                    }
                }
            }
        }
        Strategy::IndexPrefix { path, prefix } => {
            let tree = index_tree(inner, path)?;
            let mut cur = tree.cursor();
            if cur.jump_fwd(prefix)? {
                loop {
                    let Some((key, val)) = cur.record()? else { break };
                    if !key.starts_with(prefix) {
                        break;
                    }
                    ids.push(decode_id(&val)?);
                    if !cur.next()? {
                        break;
                    }
                }
            }
            if plan.backward {
                ids.reverse();
            }
        }
    }
    Ok(ids)
}

fn index_tree<'a>(inner: &'a CollInner, path: &str) -> Result<&'a Btree> {
    inner
        .indexes
        .get(path)
        .map(|t| t.as_ref())
        .ok_or_else(|| Error::InvalidState(format!("index {path} is not open")))
}

fn decode_id(val: &[u8]) -> Result<i64> {
    let bytes: [u8; 8] = val
        .try_into()
        .map_err(|_| Error::Corrupt("bad index value length".into()))?;
    Ok(i64::from_le_bytes(bytes))
}

// ---------------------------------------------------------------------------
// Sorting
// ---------------------------------------------------------------------------

fn sort_key_cmp(a: &[JsonNode], b: &[JsonNode], dirs: &[bool]) -> Ordering {
    for (i, desc) in dirs.iter().enumerate() {
        let ord = node_order_cmp(a.get(i).unwrap_or(&JsonNode::Null), b.get(i).unwrap_or(&JsonNode::Null));
        let ord = if *desc { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn type_rank(n: &JsonNode) -> u8 {
    match n {
        JsonNode::Null => 0,
        JsonNode::Bool(_) => 1,
        JsonNode::I64(_) | JsonNode::F64(_) => 2,
        JsonNode::String(_) => 3,
        JsonNode::Binary(_) => 4,
        JsonNode::Array(_) => 5,
        JsonNode::Object(_) => 6,
    }
}

/// Total order over sort keys: values group by type, numbers compare
/// numerically across i64/f64.
fn node_order_cmp(a: &JsonNode, b: &JsonNode) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (JsonNode::Bool(x), JsonNode::Bool(y)) => x.cmp(y),
        (JsonNode::I64(x), JsonNode::I64(y)) => x.cmp(y),
        (JsonNode::String(x), JsonNode::String(y)) => x.cmp(y),
        (JsonNode::Binary(x), JsonNode::Binary(y)) => x.cmp(y),
        _ => {
            if ra == 2 {
                let x = match a {
                    JsonNode::I64(v) => *v as f64,
                    JsonNode::F64(v) => *v,
                    _ => 0.0,
                };
                let y = match b {
                    JsonNode::I64(v) => *v as f64,
                    JsonNode::F64(v) => *v,
                    _ => 0.0,
                };
                x.total_cmp(&y)
            } else {
                // Containers order by their packed form.
                a.pack().as_bytes().cmp(b.pack().as_bytes())
            }
        }
    }
}

struct SortEntry {
    keys: Vec<JsonNode>,
    id: i64,
    doc: Vec<u8>,
    /// Arrival order, to keep the sort stable.
    seq: u64,
}

fn extract_sort_keys(view: BdocView<'_>, order: &[(Pointer, bool)]) -> Vec<JsonNode> {
    order
        .iter()
        .map(|(ptr, _)| match view.at(ptr) {
            Some(v) => JsonNode::from_packed(v),
            None => JsonNode::Null,
        })
        .collect()
}

/// Collects (sort key, document) pairs and yields them in order. With a
/// window it keeps a bounded heap of skip+limit entries; otherwise entries
/// accumulate up to the memory ceiling and overflow to sorted runs on disk.
struct Sorter {
    dirs: std::sync::Arc<Vec<bool>>,
    window: Option<usize>,
    heap: BinaryHeap<HeapEntry>,
    buffer: Vec<SortEntry>,
    buffered_bytes: usize,
    memory_ceiling: usize,
    runs: Vec<PathBuf>,
    spill_base: PathBuf,
    seq: u64,
}

struct HeapEntry {
    entry: SortEntry,
    dirs: std::sync::Arc<Vec<bool>>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        sort_key_cmp(&self.entry.keys, &other.entry.keys, &self.dirs)
            .then_with(|| self.entry.seq.cmp(&other.entry.seq))
    }
}

impl Sorter {
    fn push(&mut self, keys: Vec<JsonNode>, id: i64, doc: Vec<u8>) -> Result<()> {
        let entry = SortEntry {
            keys,
            id,
            doc,
            seq: self.seq,
        };
        self.seq += 1;
        if let Some(window) = self.window {
            if window == 0 {
                return Ok(());
            }
            self.heap.push(HeapEntry {
                entry,
                dirs: std::sync::Arc::clone(&self.dirs),
            });
            if self.heap.len() > window {
                // Drop the current worst; memory stays bounded by the window.
                self.heap.pop();
            }
            return Ok(());
        }
        self.buffered_bytes += entry.doc.len() + 64;
        self.buffer.push(entry);
        if self.buffered_bytes > self.memory_ceiling {
            self.spill_run()?;
        }
        Ok(())
    }

    fn spill_run(&mut self) -> Result<()> {
        let dirs = std::sync::Arc::clone(&self.dirs);
        self.buffer
            .sort_by(|a, b| sort_key_cmp(&a.keys, &b.keys, &dirs).then(a.seq.cmp(&b.seq)));
        let path = self
            .spill_base
            .with_extension(format!("sort{}", self.runs.len()));
        let mut w = BufWriter::new(File::create(&path)?);
        for entry in self.buffer.drain(..) {
            write_spilled(&mut w, &entry)?;
        }
        w.flush()?;
        self.runs.push(path);
        self.buffered_bytes = 0;
        Ok(())
    }

    fn finish(mut self) -> Result<(Vec<(i64, Vec<u8>)>, usize)> {
        let dirs = std::sync::Arc::clone(&self.dirs);
        if self.window.is_some() {
            let mut entries: Vec<SortEntry> =
                self.heap.into_vec().into_iter().map(|h| h.entry).collect();
            entries.sort_by(|a, b| sort_key_cmp(&a.keys, &b.keys, &dirs).then(a.seq.cmp(&b.seq)));
            return Ok((entries.into_iter().map(|e| (e.id, e.doc)).collect(), 0));
        }
        self.buffer
            .sort_by(|a, b| sort_key_cmp(&a.keys, &b.keys, &dirs).then(a.seq.cmp(&b.seq)));
        if self.runs.is_empty() {
            return Ok((self.buffer.into_iter().map(|e| (e.id, e.doc)).collect(), 0));
        }
        // Merge the on-disk runs with the in-memory tail.
        let mut readers = Vec::new();
        for path in &self.runs {
            readers.push(RunReader {
                reader: BufReader::new(File::open(path)?),
                pending: None,
            });
        }
        let mut out = Vec::new();
        let mut memory: std::vec::IntoIter<SortEntry> = std::mem::take(&mut self.buffer).into_iter();
        let mut mem_head = memory.next();
        for r in &mut readers {
            r.advance()?;
        }
        loop {
            let mut best: Option<(usize, &SortEntry)> = None;
            for (i, r) in readers.iter().enumerate() {
                if let Some(e) = &r.pending {
                    let better = match &best {
                        None => true,
                        Some((_, cur)) => {
                            sort_key_cmp(&e.keys, &cur.keys, &dirs)
                                .then(e.seq.cmp(&cur.seq))
                                == Ordering::Less
                        }
                    };
                    if better {
                        best = Some((i, e));
                    }
                }
            }
            let take_memory = match (&mem_head, &best) {
                (None, None) => break,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (Some(m), Some((_, e))) => {
                    sort_key_cmp(&m.keys, &e.keys, &dirs).then(m.seq.cmp(&e.seq))
                        != Ordering::Greater
                }
            };
            if take_memory {
                let e = mem_head.take().unwrap();
                out.push((e.id, e.doc));
                mem_head = memory.next();
            } else {
                let (i, _) = best.unwrap();
                let e = readers[i].pending.take().unwrap();
                out.push((e.id, e.doc));
                readers[i].advance()?;
            }
        }
        for path in &self.runs {
            let _ = fs::remove_file(path);
        }
        Ok((out, self.runs.len()))
    }
}

struct RunReader {
    reader: BufReader<File>,
    pending: Option<SortEntry>,
}

impl RunReader {
    fn advance(&mut self) -> Result<()> {
        self.pending = read_spilled(&mut self.reader)?;
        Ok(())
    }
}

fn write_spilled(w: &mut impl Write, entry: &SortEntry) -> Result<()> {
    w.write_all(&entry.id.to_le_bytes())?;
    w.write_all(&entry.seq.to_le_bytes())?;
    w.write_all(&(entry.keys.len() as u32).to_le_bytes())?;
    for key in &entry.keys {
        let packed = key.pack();
        let bytes = packed.as_bytes();
        w.write_all(&(bytes.len() as u32).to_le_bytes())?;
        w.write_all(bytes)?;
    }
    w.write_all(&(entry.doc.len() as u32).to_le_bytes())?;
    w.write_all(&entry.doc)?;
    Ok(())
}

fn read_spilled(r: &mut impl Read) -> Result<Option<SortEntry>> {
    let mut id_buf = [0u8; 8];
    match r.read_exact(&mut id_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let id = i64::from_le_bytes(id_buf);
    let mut seq_buf = [0u8; 8];
    r.read_exact(&mut seq_buf)?;
    let seq = u64::from_le_bytes(seq_buf);
    let mut n_buf = [0u8; 4];
    r.read_exact(&mut n_buf)?;
    let nkeys = u32::from_le_bytes(n_buf);
    let mut keys = Vec::with_capacity(nkeys as usize);
    for _ in 0..nkeys {
        r.read_exact(&mut n_buf)?;
        let len = u32::from_le_bytes(n_buf) as usize;
        let mut bytes = vec![0u8; len];
        r.read_exact(&mut bytes)?;
        let packed = Bdoc::parse(&bytes)?;
        keys.push(JsonNode::from_packed(packed.view()));
    }
    r.read_exact(&mut n_buf)?;
    let len = u32::from_le_bytes(n_buf) as usize;
    let mut doc = vec![0u8; len];
    r.read_exact(&mut doc)?;
    Ok(Some(SortEntry { keys, id, doc, seq }))
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// A visitor-requested mutation buffered during a read-locked pass.
pub(crate) enum DeferredMutation {
    Update(i64, Bdoc),
    Delete(i64),
}

pub(crate) struct PassResult {
    /// Documents that matched the filter, before the skip/limit window.
    pub matched: u64,
    /// Documents that passed the skip/limit window.
    pub count: u64,
    pub deferred: Vec<DeferredMutation>,
}

/// Run one query pass over a collection. `allow_mutate` is true when the
/// caller holds the collection write lock; visitor mutations are then applied
/// in-flight, otherwise they are buffered for the caller.
pub(crate) fn run_pass(
    eng: &OpalDb,
    inner: &CollInner,
    q: &Query,
    visitor: Option<&mut Visitor<'_>>,
    allow_mutate: bool,
    mut log: Option<&mut String>,
) -> Result<PassResult> {
    let mut result = PassResult {
        matched: 0,
        count: 0,
        deferred: Vec::new(),
    };
    let skip = match &q.skip {
        Some(op) => q.resolve_u64(op)?,
        None => 0,
    };
    let limit = match &q.limit {
        Some(op) => Some(q.resolve_u64(op)?),
        None => None,
    };
    if limit == Some(0) {
        logln(&mut log, "limit 0, nothing to do");
        return Ok(result);
    }
    let apply_node = match &q.apply {
        Some(op) => Some(q.resolve_node(op)?.clone()),
        None => match &q.upsert {
            Some(op) => Some(q.resolve_node(op)?.clone()),
            None => None,
        },
    };
    // An aggregate pass only mutates when the visitor explicitly asks to.
    let apply_node = if q.count { None } else { apply_node };
    let mutating = apply_node.is_some() || q.del;

    let plan = plan_query(q, inner, &mut log)?;
    let snap = eng.kv_snapshot();

    // Counting against a fully covering index never touches document bodies.
    // The visitor is never invoked in count mode, so it does not matter here.
    if q.count && plan.covered && !q.del {
        logln(&mut log, "count satisfied by index keys alone");
        let ids = candidate_ids(&plan, inner, snap.as_ref())?;
        let total = ids.len() as u64;
        result.matched = total;
        let after_skip = total.saturating_sub(skip);
        result.count = match limit {
            Some(l) => after_skip.min(l),
            None => after_skip,
        };
        return Ok(result);
    }

    let needs_sort = !q.order.is_empty() && !plan.order_fused;
    if needs_sort {
        logln(&mut log, "explicit sort pass over matched documents");
    }

    let ids = candidate_ids(&plan, inner, snap.as_ref())?;
    let mut visited: HashSet<i64> = HashSet::new();
    let dirs: Vec<bool> = q.order.iter().map(|(_, d)| *d).collect();
    let mut sorter = if needs_sort {
        Some(Sorter {
            dirs: std::sync::Arc::new(dirs),
            window: limit.map(|l| (skip + l) as usize),
            heap: BinaryHeap::new(),
            buffer: Vec::new(),
            buffered_bytes: 0,
            memory_ceiling: eng.sort_buffer_sz(),
            runs: Vec::new(),
            spill_base: eng.sort_spill_base(),
            seq: 0,
        })
    } else {
        None
    };

    let mut emitter = Emitter {
        eng,
        inner,
        q,
        visitor,
        allow_mutate,
        apply_node: apply_node.as_ref(),
        skip,
        limit,
        skipped: 0,
        emitted: 0,
        stopped: false,
        deferred: Vec::new(),
    };

    for id in ids {
        if !visited.insert(id) {
            continue;
        }
        let Some(bytes) = snap.get(inner.meta.db_id, &id_key(id)) else {
            continue;
        };
        let doc = Bdoc::parse(&bytes)?;
        if !q.matches(doc.view())? {
            continue;
        }
        result.matched += 1;
        match &mut sorter {
            Some(sorter) => {
                let keys = extract_sort_keys(doc.view(), &q.order);
                sorter.push(keys, id, bytes)?;
            }
            None => {
                emitter.emit(id, doc)?;
                if emitter.done() && !mutating {
                    logln(&mut log, "output window filled, scan stopped early");
                    break;
                }
                if emitter.stopped {
                    break;
                }
            }
        }
    }

    if let Some(sorter) = sorter {
        let (ordered, spilled_runs) = sorter.finish()?;
        if spilled_runs > 0 {
            logln(
                &mut log,
                &format!("sort exceeded the memory ceiling, merged {spilled_runs} disk runs"),
            );
        }
        for (id, bytes) in ordered {
            let doc = Bdoc::parse(&bytes)?;
            emitter.emit(id, doc)?;
            if emitter.stopped || (emitter.done() && !mutating) {
                break;
            }
        }
    }

    result.count = emitter.emitted;
    result.deferred = emitter.deferred;
    Ok(result)
}

/// The output stage: apply/del mutation, projection, skip/limit window,
/// visitor callback.
struct Emitter<'a, 'v> {
    eng: &'a OpalDb,
    inner: &'a CollInner,
    q: &'a Query,
    visitor: Option<&'a mut Visitor<'v>>,
    allow_mutate: bool,
    apply_node: Option<&'a JsonNode>,
    skip: u64,
    limit: Option<u64>,
    skipped: u64,
    emitted: u64,
    stopped: bool,
    deferred: Vec<DeferredMutation>,
}

impl Emitter<'_, '_> {
    fn done(&self) -> bool {
        self.stopped || self.limit.is_some_and(|l| self.emitted >= l)
    }

    fn emit(&mut self, id: i64, doc: Bdoc) -> Result<()> {
        // Mutation stage.
        let mut current = doc;
        if let Some(patch_node) = self.apply_node {
            let mut node = current.to_node();
            patch::apply_auto(&mut node, patch_node)?;
            let updated = node.pack();
            self.eng
                .update_doc_in(self.inner, id, &current, &updated)?;
            current = updated;
        }
        if self.q.del {
            self.eng.delete_doc_in(self.inner, id, &current)?;
            if !self.q.count {
                self.window_and_visit(id, &current, None)?;
            } else {
                self.count_window();
            }
            return Ok(());
        }
        if self.q.count {
            self.count_window();
            return Ok(());
        }
        // Projection stage.
        let node = if let Some(fields) = &self.q.projection {
            let node = project(current.view(), fields);
            current = node.pack();
            Some(node)
        } else if self.apply_node.is_some() {
            Some(current.to_node())
        } else {
            None
        };
        self.window_and_visit(id, &current, node.as_ref())?;
        Ok(())
    }

    fn count_window(&mut self) {
        if self.skipped < self.skip {
            self.skipped += 1;
            return;
        }
        if self.limit.is_some_and(|l| self.emitted >= l) {
            return;
        }
        self.emitted += 1;
    }

    fn window_and_visit(&mut self, id: i64, doc: &Bdoc, node: Option<&JsonNode>) -> Result<()> {
        if self.skipped < self.skip {
            self.skipped += 1;
            return Ok(());
        }
        if self.limit.is_some_and(|l| self.emitted >= l) {
            return Ok(());
        }
        self.emitted += 1;
        let Some(visitor) = self.visitor.as_deref_mut() else {
            return Ok(());
        };
        let step = visitor(ExecDoc { id, doc, node })?;
        match step {
            Step::Continue => {}
            Step::Stop => self.stopped = true,
            Step::Update(new_node) => {
                let updated = new_node.pack();
                if self.allow_mutate {
                    self.eng.update_doc_in(self.inner, id, doc, &updated)?;
                } else {
                    self.deferred.push(DeferredMutation::Update(id, updated));
                }
            }
            Step::Delete => {
                if self.allow_mutate {
                    self.eng.delete_doc_in(self.inner, id, doc)?;
                } else {
                    self.deferred.push(DeferredMutation::Delete(id));
                }
            }
        }
        Ok(())
    }
}

/// Keep only the masked paths of a document.
fn project(view: BdocView<'_>, fields: &[Pointer]) -> JsonNode {
    let mut out = JsonNode::Object(Vec::new());
    for ptr in fields {
        let Some(found) = view.at(ptr) else { continue };
        let value = JsonNode::from_packed(found);
        graft(&mut out, ptr.tokens(), value);
    }
    out
}

fn graft(target: &mut JsonNode, tokens: &[Token], value: JsonNode) {
    let Some(tok) = tokens.first() else {
        *target = value;
        return;
    };
    let key = match tok {
        Token::Key(k) => k.clone(),
        Token::Index(i) => i.to_string(),
        _ => return,
    };
    if tokens.len() == 1 {
        target.set_member(&key, value);
        return;
    }
    if target.get(&key).is_none() {
        target.set_member(&key, JsonNode::Object(Vec::new()));
    }
    graft(target.get_mut(&key).unwrap(), &tokens[1..], value);
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_key_ordering_groups_types() {
        let null = JsonNode::Null;
        let boolean = JsonNode::Bool(true);
        let num = JsonNode::I64(5);
        let float = JsonNode::F64(5.5);
        let string = JsonNode::String("a".into());
        assert_eq!(node_order_cmp(&null, &boolean), Ordering::Less);
        assert_eq!(node_order_cmp(&boolean, &num), Ordering::Less);
        assert_eq!(node_order_cmp(&num, &float), Ordering::Less);
        assert_eq!(node_order_cmp(&float, &string), Ordering::Less);
        assert_eq!(node_order_cmp(&num, &JsonNode::F64(5.0)), Ordering::Equal);
    }

    #[test]
    fn composite_sort_keys_respect_direction() {
        let a = vec![JsonNode::I64(1), JsonNode::String("x".into())];
        let b = vec![JsonNode::I64(1), JsonNode::String("y".into())];
        assert_eq!(sort_key_cmp(&a, &b, &[false, false]), Ordering::Less);
        assert_eq!(sort_key_cmp(&a, &b, &[false, true]), Ordering::Greater);
        assert_eq!(sort_key_cmp(&a, &b, &[true, false]), Ordering::Less);
    }

    #[test]
    fn spill_roundtrip() {
        let entry = SortEntry {
            keys: vec![JsonNode::I64(3), JsonNode::String("k".into())],
            id: 42,
            doc: Bdoc::from_json(r#"{"a":1}"#).unwrap().into_bytes(),
            seq: 7,
        };
        let mut buf = Vec::new();
        write_spilled(&mut buf, &entry).unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let back = read_spilled(&mut cursor).unwrap().unwrap();
        assert_eq!(back.id, 42);
        assert_eq!(back.seq, 7);
        assert_eq!(back.keys, entry.keys);
        assert_eq!(back.doc, entry.doc);
        assert!(read_spilled(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn projection_grafts_nested_paths() {
        let doc = Bdoc::from_json(r#"{"a":{"b":1,"c":2},"d":3}"#).unwrap();
        let fields = vec![Pointer::parse("/a/b").unwrap(), Pointer::parse("/d").unwrap()];
        let node = project(doc.view(), &fields);
        assert_eq!(
            node.to_json(crate::json::PrintFlags::PLAIN),
            r#"{"a":{"b":1},"d":3}"#
        );
    }

    #[test]
    fn range_bound_merging_tightens() {
        use crate::btree::Comparator;
        let cmp = Comparator::Int64;
        let k = |v: i64| v.to_le_bytes().to_vec();
        let mut lower = None;
        merge_lower(&mut lower, k(1), true, cmp);
        merge_lower(&mut lower, k(5), false, cmp);
        merge_lower(&mut lower, k(3), true, cmp);
        assert_eq!(lower, Some((k(5), false)));
        let mut upper = None;
        merge_upper(&mut upper, k(10), true, cmp);
        merge_upper(&mut upper, k(8), false, cmp);
        assert_eq!(upper, Some((k(8), false)));
        // Equal key: exclusive is tighter than inclusive.
        merge_upper(&mut upper, k(8), true, cmp);
        assert_eq!(upper, Some((k(8), false)));
    }
}
