use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::bdoc::{Bdoc, BdocView, Kind};
use crate::btree::Btree;
use crate::error::{Error, Result};
use crate::exec::{self, DeferredMutation, ExecDoc, Step, Visitor};
use crate::jql::Query;
use crate::json::PrintFlags;
use crate::kv::{DbHandle, FileKv, Kv, KvSnapshot, OpenFlags, WalOpts, OPAQUE_HEADER_SIZE};
use crate::meta::{
    self, CollectionMeta, IndexMeta, IndexMode, META_DB_ID,
};
use crate::node::JsonNode;
use crate::patch;
use crate::pointer::Pointer;

const ENGINE_MAGIC: &[u8; 4] = b"OPDB";

const MIN_DOCUMENT_BUFFER_SZ: usize = 16 * 1024;
const DEFAULT_DOCUMENT_BUFFER_SZ: usize = 64 * 1024;
const MIN_SORT_BUFFER_SZ: usize = 1024 * 1024;
const DEFAULT_SORT_BUFFER_SZ: usize = 16 * 1024 * 1024;

/// Callback type for forwarding engine log messages to an external sink.
pub type LogCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Open options for the engine.
#[derive(Clone)]
pub struct DbOpts {
    pub path: PathBuf,
    pub oflags: OpenFlags,
    pub wal: WalOpts,
    /// Initial per-document working buffer, clamped to at least 16 KiB.
    pub document_buffer_sz: usize,
    /// Ceiling for in-memory query ordering before spilling, at least 1 MiB.
    pub sort_buffer_sz: usize,
    pub verbose: bool,
    pub log_callback: Option<LogCallback>,
}

impl DbOpts {
    pub fn new(path: impl Into<PathBuf>) -> DbOpts {
        DbOpts {
            path: path.into(),
            oflags: OpenFlags::default(),
            wal: WalOpts::default(),
            document_buffer_sz: DEFAULT_DOCUMENT_BUFFER_SZ,
            sort_buffer_sz: DEFAULT_SORT_BUFFER_SZ,
            verbose: false,
            log_callback: None,
        }
    }

    pub fn truncate(mut self) -> Self {
        self.oflags.truncate = true;
        self
    }

    pub fn readonly(mut self) -> Self {
        self.oflags.readonly = true;
        self
    }

    pub fn oflags(mut self, oflags: OpenFlags) -> Self {
        self.oflags = oflags;
        self
    }

    pub fn wal(mut self, wal: WalOpts) -> Self {
        self.wal = wal;
        self
    }

    pub fn document_buffer_sz(mut self, sz: usize) -> Self {
        self.document_buffer_sz = sz;
        self
    }

    pub fn sort_buffer_sz(mut self, sz: usize) -> Self {
        self.sort_buffer_sz = sz;
        self
    }

    pub fn verbose(mut self, on: bool) -> Self {
        self.verbose = on;
        self
    }

    pub fn log_callback(mut self, cb: LogCallback) -> Self {
        self.log_callback = Some(cb);
        self
    }
}

/// Everything the engine knows about one open collection. Guarded by the
/// per-collection RwLock in `CollState`.
pub(crate) struct CollInner {
    pub meta: CollectionMeta,
    pub primary: DbHandle,
    /// Open B+ trees keyed by index path.
    pub indexes: HashMap<String, Arc<Btree>>,
}

pub(crate) struct CollState {
    pub lock: RwLock<CollInner>,
}

thread_local! {
    /// Collections this thread is currently executing a query over, with the
    /// exclusivity of the held lock. Guards visitors against re-entering.
    static ACTIVE_EXECS: RefCell<Vec<(String, bool)>> = const { RefCell::new(Vec::new()) };
}

struct ExecGuard;

impl ExecGuard {
    fn enter(name: &str, exclusive: bool) -> ExecGuard {
        ACTIVE_EXECS.with(|a| a.borrow_mut().push((name.to_string(), exclusive)));
        ExecGuard
    }
}

impl Drop for ExecGuard {
    fn drop(&mut self) {
        ACTIVE_EXECS.with(|a| {
            a.borrow_mut().pop();
        });
    }
}

fn check_writer_reentry(name: &str) -> Result<()> {
    ACTIVE_EXECS.with(|a| {
        if a.borrow().iter().any(|(n, _)| n == name) {
            Err(Error::DeadlockRisk(name.to_string()))
        } else {
            Ok(())
        }
    })
}

fn check_reader_reentry(name: &str) -> Result<()> {
    ACTIVE_EXECS.with(|a| {
        if a.borrow().iter().any(|(n, excl)| n == name && *excl) {
            Err(Error::DeadlockRisk(name.to_string()))
        } else {
            Ok(())
        }
    })
}

/// Primary database key of a document id: big-endian, so byte order is id
/// order.
pub(crate) fn id_key(id: i64) -> [u8; 8] {
    (id as u64).to_be_bytes()
}

fn id_value(id: i64) -> [u8; 8] {
    id.to_le_bytes()
}

/// Extract the index key for a document, if the value at the indexed path
/// has the index's type.
pub(crate) fn extract_index_key(view: BdocView<'_>, idx: &IndexMeta) -> Option<Vec<u8>> {
    let ptr = Pointer::parse(&idx.path).ok()?;
    let value = view.at(&ptr)?;
    match idx.mode.type_bits() {
        meta::IDX_STR => value.as_str().map(|s| s.as_bytes().to_vec()),
        meta::IDX_I64 => match value.kind() {
            Kind::I64 => value.as_i64().map(|v| v.to_le_bytes().to_vec()),
            _ => None,
        },
        meta::IDX_F64 => match value.kind() {
            Kind::I64 | Kind::F64 => value.as_f64().map(f64_key),
            _ => None,
        },
        _ => None,
    }
}

/// Encode a query literal into an index key of the given mode.
pub(crate) fn literal_index_key(node: &JsonNode, mode: IndexMode) -> Option<Vec<u8>> {
    match mode.type_bits() {
        meta::IDX_STR => match node {
            JsonNode::String(s) => Some(s.as_bytes().to_vec()),
            _ => None,
        },
        meta::IDX_I64 => match node {
            JsonNode::I64(v) => Some(v.to_le_bytes().to_vec()),
            _ => None,
        },
        meta::IDX_F64 => match node {
            JsonNode::I64(v) => Some(f64_key(*v as f64)),
            JsonNode::F64(v) => Some(f64_key(*v)),
            _ => None,
        },
        _ => None,
    }
}

/// Float keys are normalized to fixed-precision decimal text.
fn f64_key(v: f64) -> Vec<u8> {
    format!("{v:.6}").into_bytes()
}

/// The engine: collections of packed JSON documents over a transactional KV
/// store, with B+ tree indexes and the path query language.
///
/// Reads on different collections never block each other; writes within one
/// collection are serialized by its RwLock. Metadata changes take the
/// process-wide write mutex on top.
pub struct OpalDb {
    kv: Arc<dyn Kv>,
    opts: DbOpts,
    registry: RwLock<HashMap<String, Arc<CollState>>>,
    /// Serializes metadata mutations and cross-collection operations.
    write_mu: Mutex<()>,
    next_db_id: AtomicU32,
    sort_seq: AtomicU64,
    /// Set after an io failure during commit; the handle degrades to
    /// read-only until reopened.
    degraded: AtomicBool,
    closed: AtomicBool,
}

impl OpalDb {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<OpalDb> {
        Self::open_with(DbOpts::new(path))
    }

    pub fn open_with(mut opts: DbOpts) -> Result<OpalDb> {
        opts.document_buffer_sz = opts.document_buffer_sz.max(MIN_DOCUMENT_BUFFER_SZ);
        opts.sort_buffer_sz = opts.sort_buffer_sz.max(MIN_SORT_BUFFER_SZ);

        let kv = FileKv::open(&opts.path, opts.oflags, opts.wal.clone())?;
        let db = OpalDb {
            kv: Arc::new(kv),
            opts,
            registry: RwLock::new(HashMap::new()),
            write_mu: Mutex::new(()),
            next_db_id: AtomicU32::new(META_DB_ID + 1),
            sort_seq: AtomicU64::new(0),
            degraded: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        };
        db.vlog(&format!("opening database at {}", db.opts.path.display()));
        db.check_engine_header()?;
        db.load_collections()?;
        Ok(db)
    }

    fn vlog(&self, msg: &str) {
        if self.opts.verbose {
            eprintln!("[opaldb] {msg}");
        }
        if let Some(cb) = &self.opts.log_callback {
            cb(msg);
        }
    }

    /// The metadata database header carries the engine magic, the format
    /// version string and the metadata db id.
    fn check_engine_header(&self) -> Result<()> {
        let meta_db = self.kv.database(META_DB_ID)?;
        let hdr = meta_db.read_header()?;
        if hdr[0..4] == [0, 0, 0, 0] {
            if self.opts.oflags.readonly {
                return Ok(());
            }
            let mut out = [0u8; OPAQUE_HEADER_SIZE];
            out[0..4].copy_from_slice(ENGINE_MAGIC);
            let version = env!("CARGO_PKG_VERSION").as_bytes();
            out[4] = version.len() as u8;
            out[5..5 + version.len()].copy_from_slice(version);
            out[40..44].copy_from_slice(&META_DB_ID.to_le_bytes());
            meta_db.write_header(&out)?;
            return Ok(());
        }
        if &hdr[0..4] != ENGINE_MAGIC {
            return Err(Error::Corrupt("engine header magic mismatch".into()));
        }
        Ok(())
    }

    fn load_collections(&self) -> Result<()> {
        let meta_db = self.kv.database(META_DB_ID)?;
        let metas = meta::load_all(&meta_db)?;
        let mut max_db_id = META_DB_ID;
        let mut registry = self.registry.write().unwrap();
        for m in metas {
            max_db_id = max_db_id.max(m.db_id);
            for idx in &m.indexes {
                max_db_id = max_db_id.max(idx.db_id);
            }
            let state = self.open_state(m)?;
            let name = state.lock.read().unwrap().meta.name.clone();
            self.vlog(&format!("loaded collection '{name}'"));
            registry.insert(name, Arc::new(state));
        }
        self.next_db_id.store(max_db_id + 1, Ordering::SeqCst);
        Ok(())
    }

    fn open_state(&self, m: CollectionMeta) -> Result<CollState> {
        let primary = self.kv.database(m.db_id)?;
        let mut indexes = HashMap::new();
        for idx in &m.indexes {
            let db = self.kv.database(idx.db_id)?;
            let tree = Btree::open(db, idx.mode.comparator())?;
            indexes.insert(idx.path.clone(), Arc::new(tree));
        }
        Ok(CollState {
            lock: RwLock::new(CollInner {
                meta: m,
                primary,
                indexes,
            }),
        })
    }

    fn check_writable(&self) -> Result<()> {
        if self.opts.oflags.readonly {
            return Err(Error::InvalidState("database is read-only".into()));
        }
        if self.degraded.load(Ordering::SeqCst) {
            return Err(Error::InvalidState(
                "database degraded to read-only after a commit failure".into(),
            ));
        }
        Ok(())
    }

    fn state_of(&self, name: &str) -> Option<Arc<CollState>> {
        self.registry.read().unwrap().get(name).cloned()
    }

    // -- Collections ---------------------------------------------------------

    /// Create the collection if it does not exist yet.
    pub fn ensure_collection(&self, name: &str) -> Result<()> {
        self.ensure_state(name).map(|_| ())
    }

    fn ensure_state(&self, name: &str) -> Result<Arc<CollState>> {
        meta::validate_collection_name(name)?;
        if let Some(state) = self.state_of(name) {
            return Ok(state);
        }
        self.check_writable()?;
        let _w = self.write_mu.lock().unwrap();
        // Another thread may have created it while we waited.
        if let Some(state) = self.state_of(name) {
            return Ok(state);
        }
        let db_id = self.next_db_id.fetch_add(1, Ordering::SeqCst);
        let m = CollectionMeta::new(name, db_id);
        let mut txn = self.kv.begin()?;
        txn.put(META_DB_ID, name.as_bytes().to_vec(), m.encode());
        self.commit(txn)?;
        let state = Arc::new(self.open_state(m)?);
        self.registry
            .write()
            .unwrap()
            .insert(name.to_string(), Arc::clone(&state));
        self.vlog(&format!("created collection '{name}'"));
        Ok(state)
    }

    /// Remove a collection with its primary and index databases. Idempotent.
    pub fn remove_collection(&self, name: &str) -> Result<()> {
        check_writer_reentry(name)?;
        self.check_writable()?;
        let _w = self.write_mu.lock().unwrap();
        let Some(state) = self.registry.write().unwrap().remove(name) else {
            return Ok(());
        };
        let inner = state.lock.write().unwrap();
        let mut txn = self.kv.begin()?;
        txn.del(META_DB_ID, name.as_bytes().to_vec());
        txn.drop_db(inner.meta.db_id);
        for idx in &inner.meta.indexes {
            txn.drop_db(idx.db_id);
        }
        self.commit(txn)?;
        self.vlog(&format!("removed collection '{name}'"));
        Ok(())
    }

    /// Atomically rename a collection.
    pub fn rename_collection(&self, old: &str, new: &str) -> Result<()> {
        check_writer_reentry(old)?;
        check_writer_reentry(new)?;
        meta::validate_collection_name(new)?;
        self.check_writable()?;
        let _w = self.write_mu.lock().unwrap();
        let mut registry = self.registry.write().unwrap();
        if registry.contains_key(new) {
            return Err(Error::CollectionExists(new.to_string()));
        }
        let Some(state) = registry.get(old).cloned() else {
            return Err(Error::CollectionNotFound(old.to_string()));
        };
        {
            let mut inner = state.lock.write().unwrap();
            inner.meta.name = new.to_string();
            let mut txn = self.kv.begin()?;
            txn.del(META_DB_ID, old.as_bytes().to_vec());
            txn.put(META_DB_ID, new.as_bytes().to_vec(), inner.meta.encode());
            if let Err(e) = self.commit(txn) {
                inner.meta.name = old.to_string();
                return Err(e);
            }
        }
        registry.remove(old);
        registry.insert(new.to_string(), state);
        self.vlog(&format!("renamed collection '{old}' to '{new}'"));
        Ok(())
    }

    // -- Documents -----------------------------------------------------------

    /// Store a document under an explicit id, replacing any existing one.
    pub fn put(&self, coll: &str, doc: &Bdoc, id: i64) -> Result<()> {
        if id <= 0 {
            return Err(Error::InvalidArgument("document id must be positive".into()));
        }
        check_writer_reentry(coll)?;
        self.check_writable()?;
        let state = self.ensure_state(coll)?;
        let mut inner = state.lock.write().unwrap();
        let old = self.fetch(&inner, id)?;
        let mut m = inner.meta.clone();
        m.id_seed = m.id_seed.max(id + 1);
        self.write_doc(&inner, id, old.as_ref(), Some(doc), Some(&m))?;
        inner.meta = m;
        Ok(())
    }

    /// Store a document under a fresh monotonically assigned id.
    pub fn put_new(&self, coll: &str, doc: &Bdoc) -> Result<i64> {
        check_writer_reentry(coll)?;
        self.check_writable()?;
        let state = self.ensure_state(coll)?;
        let mut inner = state.lock.write().unwrap();
        self.insert_new(&mut inner, doc)
    }

    fn insert_new(&self, inner: &mut CollInner, doc: &Bdoc) -> Result<i64> {
        let id = inner.meta.id_seed.max(1);
        let mut m = inner.meta.clone();
        m.id_seed = id + 1;
        self.write_doc(inner, id, None, Some(doc), Some(&m))?;
        inner.meta = m;
        Ok(id)
    }

    pub fn put_json(&self, coll: &str, json: &str, id: i64) -> Result<()> {
        self.put(coll, &self.parse_doc(json)?, id)
    }

    pub fn put_new_json(&self, coll: &str, json: &str) -> Result<i64> {
        self.put_new(coll, &self.parse_doc(json)?)
    }

    fn parse_doc(&self, json: &str) -> Result<Bdoc> {
        let node = JsonNode::from_json(json)?;
        Ok(self.pack_node(&node))
    }

    /// Pack through the per-document working buffer size hint.
    fn pack_node(&self, node: &JsonNode) -> Bdoc {
        let mut buf = Vec::with_capacity(self.opts.document_buffer_sz.min(1 << 20));
        node.pack_into(&mut buf);
        Bdoc::from_packed_unchecked(buf)
    }

    pub fn get(&self, coll: &str, id: i64) -> Result<Bdoc> {
        check_reader_reentry(coll)?;
        let state = self
            .state_of(coll)
            .ok_or_else(|| Error::CollectionNotFound(coll.to_string()))?;
        let inner = state.lock.read().unwrap();
        self.fetch(&inner, id)?.ok_or(Error::NotFound(id))
    }

    fn fetch(&self, inner: &CollInner, id: i64) -> Result<Option<Bdoc>> {
        match inner.primary.get(&id_key(id))? {
            Some(bytes) => Ok(Some(Bdoc::parse(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn del(&self, coll: &str, id: i64) -> Result<()> {
        check_writer_reentry(coll)?;
        self.check_writable()?;
        let state = self
            .state_of(coll)
            .ok_or_else(|| Error::CollectionNotFound(coll.to_string()))?;
        let inner = state.lock.write().unwrap();
        let old = self.fetch(&inner, id)?.ok_or(Error::NotFound(id))?;
        self.write_doc(&inner, id, Some(&old), None, None)
    }

    /// Apply an RFC 6902 (array) or RFC 7396 (object) patch to a document.
    pub fn patch(&self, coll: &str, id: i64, patch_json: &str) -> Result<()> {
        let patch_node = JsonNode::from_json(patch_json)?;
        self.patch_node(coll, id, &patch_node)
    }

    pub fn patch_node(&self, coll: &str, id: i64, patch_node: &JsonNode) -> Result<()> {
        check_writer_reentry(coll)?;
        self.check_writable()?;
        let state = self
            .state_of(coll)
            .ok_or_else(|| Error::CollectionNotFound(coll.to_string()))?;
        let inner = state.lock.write().unwrap();
        let old = self.fetch(&inner, id)?.ok_or(Error::NotFound(id))?;
        let mut node = old.to_node();
        patch::apply_auto(&mut node, patch_node)?;
        let new = self.pack_node(&node);
        self.write_doc(&inner, id, Some(&old), Some(&new), None)
    }

    /// Merge-patch an existing document, or insert the patch as a fresh
    /// document under `id` when none exists.
    pub fn merge_or_put(&self, coll: &str, id: i64, json: &str) -> Result<()> {
        if id <= 0 {
            return Err(Error::InvalidArgument("document id must be positive".into()));
        }
        check_writer_reentry(coll)?;
        self.check_writable()?;
        let patch_node = JsonNode::from_json(json)?;
        let state = self.ensure_state(coll)?;
        let mut inner = state.lock.write().unwrap();
        match self.fetch(&inner, id)? {
            Some(old) => {
                let mut node = old.to_node();
                patch::merge_patch(&mut node, &patch_node);
                let new = self.pack_node(&node);
                self.write_doc(&inner, id, Some(&old), Some(&new), None)
            }
            None => {
                if !matches!(patch_node, JsonNode::Object(_)) {
                    return Err(Error::PatchInvalidValue(
                        "merge_or_put insert needs an object".into(),
                    ));
                }
                let new = self.pack_node(&patch_node);
                let mut m = inner.meta.clone();
                m.id_seed = m.id_seed.max(id + 1);
                self.write_doc(&inner, id, None, Some(&new), Some(&m))?;
                inner.meta = m;
                Ok(())
            }
        }
    }

    /// One document write with synchronous index maintenance, in one KV
    /// transaction. `meta_update` also rewrites the descriptor record.
    fn write_doc(
        &self,
        inner: &CollInner,
        id: i64,
        old: Option<&Bdoc>,
        new: Option<&Bdoc>,
        meta_update: Option<&CollectionMeta>,
    ) -> Result<()> {
        let mut txn = self.kv.begin()?;
        match new {
            Some(doc) => txn.put(inner.meta.db_id, id_key(id).to_vec(), doc.as_bytes().to_vec()),
            None => txn.del(inner.meta.db_id, id_key(id).to_vec()),
        }
        if let Some(m) = meta_update {
            txn.put(META_DB_ID, m.name.as_bytes().to_vec(), m.encode());
        }
        let index_result = self.update_indexes(inner, id, old, new);
        if let Err(e) = index_result {
            self.abort_indexes(inner);
            return Err(e);
        }
        for tree in inner.indexes.values() {
            tree.flush(txn.as_mut())?;
        }
        if let Err(e) = self.commit(txn) {
            self.abort_indexes(inner);
            return Err(e);
        }
        Ok(())
    }

    fn update_indexes(
        &self,
        inner: &CollInner,
        id: i64,
        old: Option<&Bdoc>,
        new: Option<&Bdoc>,
    ) -> Result<()> {
        for idx in &inner.meta.indexes {
            let Some(tree) = inner.indexes.get(&idx.path) else {
                return Err(Error::InvalidState(format!("index {} is not open", idx.path)));
            };
            let old_key = old.and_then(|d| extract_index_key(d.view(), idx));
            let new_key = new.and_then(|d| extract_index_key(d.view(), idx));
            if old_key == new_key {
                continue;
            }
            if let Some(k) = &old_key {
                if idx.mode.unique() {
                    tree.del(k)?;
                } else {
                    tree.del_kv(k, &id_value(id))?;
                }
            }
            if let Some(k) = &new_key {
                if idx.mode.unique() {
                    tree.put(k, &id_value(id)).map_err(|e| match e {
                        Error::UniqueViolation(_) => Error::UniqueViolation(format!(
                            "index {} on collection '{}'",
                            idx.path, inner.meta.name
                        )),
                        other => other,
                    })?;
                } else {
                    tree.put_dup(k, &id_value(id))?;
                }
            }
        }
        Ok(())
    }

    fn abort_indexes(&self, inner: &CollInner) {
        for tree in inner.indexes.values() {
            let _ = tree.abort();
        }
    }

    fn commit(&self, txn: Box<dyn crate::kv::KvTxn>) -> Result<()> {
        match txn.commit() {
            Ok(()) => Ok(()),
            Err(e) => {
                if matches!(e, Error::Io(_)) {
                    self.degraded.store(true, Ordering::SeqCst);
                    self.vlog("commit failed with an io error, handle degraded to read-only");
                }
                Err(e)
            }
        }
    }

    // -- Indexes -------------------------------------------------------------

    /// Create an index, synchronously rebuilding it from every document.
    pub fn ensure_index(&self, coll: &str, path: &str, mode: IndexMode) -> Result<()> {
        check_writer_reentry(coll)?;
        self.check_writable()?;
        mode.validate()?;
        let ptr = meta::validate_index_path(path)?;
        let path = ptr.to_string();
        let state = self.ensure_state(coll)?;
        let mut inner = state.lock.write().unwrap();
        if let Some(existing) = inner.meta.index_for(&path) {
            if existing.mode.type_bits() != mode.type_bits()
                || existing.mode.unique() != mode.unique()
            {
                return Err(Error::MismatchedUnique(format!(
                    "index {path} exists with mode {:#x}",
                    existing.mode.0
                )));
            }
            return Ok(());
        }

        let db_id = self.next_db_id.fetch_add(1, Ordering::SeqCst);
        let idx = IndexMeta {
            path: path.clone(),
            mode,
            db_id,
        };
        let db = self.kv.database(db_id)?;
        let tree = Btree::open(db, mode.comparator())?;

        // Full synchronous rebuild over the primary database.
        let mut built = 0u64;
        let mut cursor: Option<Vec<u8>> = None;
        loop {
            let entry = match &cursor {
                None => inner.primary.first(),
                Some(last) => inner.primary.next_above(last, false),
            };
            let Some((key, bytes)) = entry else { break };
            if key.len() == 8 {
                let id = u64::from_be_bytes(key[..8].try_into().unwrap()) as i64;
                let doc = Bdoc::parse(&bytes)?;
                if let Some(k) = extract_index_key(doc.view(), &idx) {
                    let res = if mode.unique() {
                        tree.put(&k, &id_value(id))
                    } else {
                        tree.put_dup(&k, &id_value(id))
                    };
                    if let Err(e) = res {
                        let _ = self.kv.drop_database(db_id);
                        return Err(match e {
                            Error::UniqueViolation(_) => Error::UniqueViolation(format!(
                                "cannot build unique index {path} on '{coll}'"
                            )),
                            other => other,
                        });
                    }
                    built += 1;
                }
            }
            cursor = Some(key);
        }

        let mut m = inner.meta.clone();
        m.indexes.push(idx);
        let mut txn = self.kv.begin()?;
        txn.put(META_DB_ID, m.name.as_bytes().to_vec(), m.encode());
        tree.flush(txn.as_mut())?;
        if let Err(e) = self.commit(txn) {
            let _ = self.kv.drop_database(db_id);
            return Err(e);
        }
        inner.meta = m;
        inner.indexes.insert(path.clone(), Arc::new(tree));
        self.vlog(&format!(
            "built index {path} on '{coll}' with {built} records"
        ));
        Ok(())
    }

    /// Drop an index. Idempotent.
    pub fn remove_index(&self, coll: &str, path: &str) -> Result<()> {
        check_writer_reentry(coll)?;
        self.check_writable()?;
        let Some(state) = self.state_of(coll) else {
            return Ok(());
        };
        let ptr = match meta::validate_index_path(path) {
            Ok(ptr) => ptr,
            Err(_) => return Ok(()),
        };
        let path = ptr.to_string();
        let mut inner = state.lock.write().unwrap();
        let Some(pos) = inner.meta.indexes.iter().position(|i| i.path == path) else {
            return Ok(());
        };
        let mut m = inner.meta.clone();
        let removed = m.indexes.remove(pos);
        let mut txn = self.kv.begin()?;
        txn.put(META_DB_ID, m.name.as_bytes().to_vec(), m.encode());
        txn.drop_db(removed.db_id);
        self.commit(txn)?;
        inner.meta = m;
        inner.indexes.remove(&path);
        self.vlog(&format!("removed index {path} on '{coll}'"));
        Ok(())
    }

    // -- Queries -------------------------------------------------------------

    /// Execute a query, feeding matched documents to the visitor. Returns
    /// the number of documents that passed the skip/limit window.
    pub fn exec<F>(&self, q: &Query, mut visitor: F) -> Result<u64>
    where
        F: FnMut(ExecDoc<'_>) -> Result<Step>,
    {
        let outcome = self.exec_inner(q, Some(&mut visitor), None)?;
        Ok(outcome.count)
    }

    /// Execute a query for its side effects (`apply`, `del`, `upsert`).
    pub fn update(&self, q: &Query) -> Result<u64> {
        Ok(self.exec_inner(q, None, None)?.count)
    }

    /// Count matching documents.
    pub fn count(&self, q: &Query) -> Result<u64> {
        if q.count {
            return Ok(self.exec_inner(q, None, None)?.count);
        }
        let mut counting = q.clone();
        counting.count = true;
        Ok(self.exec_inner(&counting, None, None)?.count)
    }

    /// Execute a query, materializing visited documents.
    pub fn list(&self, q: &Query) -> Result<Vec<(i64, Bdoc)>> {
        let mut out = Vec::new();
        self.exec(q, |doc| {
            out.push((doc.id, doc.doc.clone()));
            Ok(Step::Continue)
        })?;
        Ok(out)
    }

    /// Execute a query while recording the planner's decisions.
    pub fn explain<F>(&self, q: &Query, mut visitor: F) -> Result<String>
    where
        F: FnMut(ExecDoc<'_>) -> Result<Step>,
    {
        let mut log = String::new();
        self.exec_inner(q, Some(&mut visitor), Some(&mut log))?;
        Ok(log)
    }

    fn exec_inner(
        &self,
        q: &Query,
        visitor: Option<&mut Visitor<'_>>,
        log: Option<&mut String>,
    ) -> Result<exec::ExecOutcome> {
        let Some(name) = q.collection() else {
            return Err(Error::InvalidArgument(
                "query does not name a collection".into(),
            ));
        };
        let name = name.to_string();
        let mutating = q.apply.is_some() || q.upsert.is_some() || q.del;
        let mut outcome = exec::ExecOutcome { count: 0 };

        let state = match self.state_of(&name) {
            Some(state) => state,
            None => {
                if q.upsert.is_some() {
                    check_writer_reentry(&name)?;
                    self.ensure_state(&name)?
                } else {
                    return Ok(outcome);
                }
            }
        };

        if mutating {
            check_writer_reentry(&name)?;
            self.check_writable()?;
            let mut inner = state.lock.write().unwrap();
            let _g = ExecGuard::enter(&name, true);
            let pass = exec::run_pass(self, &inner, q, visitor, true, log)?;
            outcome.count = pass.count;
            if pass.matched == 0 {
                if let Some(op) = &q.upsert {
                    let node = q.resolve_node(op)?;
                    if !matches!(node, JsonNode::Object(_)) {
                        return Err(Error::PatchInvalidValue(
                            "upsert needs an object document".into(),
                        ));
                    }
                    let doc = self.pack_node(node);
                    let id = self.insert_new(&mut inner, &doc)?;
                    self.vlog(&format!("upsert inserted document {id} into '{name}'"));
                }
            }
            return Ok(outcome);
        }

        check_reader_reentry(&name)?;
        let deferred = {
            let inner = state.lock.read().unwrap();
            let _g = ExecGuard::enter(&name, false);
            let pass = exec::run_pass(self, &inner, q, visitor, false, log)?;
            outcome.count = pass.count;
            pass.deferred
        };
        if !deferred.is_empty() {
            self.check_writable()?;
            let inner = state.lock.write().unwrap();
            for m in deferred {
                match m {
                    DeferredMutation::Update(id, new) => {
                        let old = self.fetch(&inner, id)?;
                        self.write_doc(&inner, id, old.as_ref(), Some(&new), None)?;
                    }
                    DeferredMutation::Delete(id) => {
                        if let Some(old) = self.fetch(&inner, id)? {
                            self.write_doc(&inner, id, Some(&old), None, None)?;
                        }
                    }
                }
            }
        }
        Ok(outcome)
    }

    // -- Hooks used by the executor ------------------------------------------

    pub(crate) fn kv_snapshot(&self) -> Box<dyn KvSnapshot> {
        self.kv.snapshot()
    }

    pub(crate) fn sort_buffer_sz(&self) -> usize {
        self.opts.sort_buffer_sz
    }

    pub(crate) fn sort_spill_base(&self) -> PathBuf {
        let n = self.sort_seq.fetch_add(1, Ordering::SeqCst);
        let mut os = self.opts.path.as_os_str().to_os_string();
        os.push(format!("-q{n}"));
        PathBuf::from(os)
    }

    pub(crate) fn update_doc_in(
        &self,
        inner: &CollInner,
        id: i64,
        old: &Bdoc,
        new: &Bdoc,
    ) -> Result<()> {
        self.check_writable()?;
        self.write_doc(inner, id, Some(old), Some(new), None)
    }

    pub(crate) fn delete_doc_in(&self, inner: &CollInner, id: i64, old: &Bdoc) -> Result<()> {
        self.check_writable()?;
        self.write_doc(inner, id, Some(old), None, None)
    }

    // -- Introspection & maintenance -----------------------------------------

    /// A packed document describing the engine: version, storage file and
    /// per-collection record counts with index descriptors.
    pub fn get_meta(&self) -> Result<Bdoc> {
        let mut colls = Vec::new();
        let registry = self.registry.read().unwrap();
        let mut names: Vec<&String> = registry.keys().collect();
        names.sort();
        for name in names {
            let state = &registry[name];
            let inner = state.lock.read().unwrap();
            let mut indexes = Vec::new();
            for idx in &inner.meta.indexes {
                let rnum = inner
                    .indexes
                    .get(&idx.path)
                    .map(|t| t.record_count())
                    .unwrap_or(0);
                indexes.push(JsonNode::Object(vec![
                    ("ptr".into(), JsonNode::String(idx.path.clone())),
                    ("mode".into(), JsonNode::I64(idx.mode.0 as i64)),
                    ("unique".into(), JsonNode::Bool(idx.mode.unique())),
                    ("dbid".into(), JsonNode::I64(idx.db_id as i64)),
                    ("rnum".into(), JsonNode::I64(rnum as i64)),
                ]));
            }
            colls.push(JsonNode::Object(vec![
                ("name".into(), JsonNode::String(inner.meta.name.clone())),
                ("dbid".into(), JsonNode::I64(inner.meta.db_id as i64)),
                ("rnum".into(), JsonNode::I64(inner.primary.count() as i64)),
                ("indexes".into(), JsonNode::Array(indexes)),
            ]));
        }
        let root = JsonNode::Object(vec![
            (
                "version".into(),
                JsonNode::String(env!("CARGO_PKG_VERSION").to_string()),
            ),
            (
                "file".into(),
                JsonNode::String(self.opts.path.display().to_string()),
            ),
            ("collections".into(), JsonNode::Array(colls)),
        ]);
        Ok(root.pack())
    }

    /// Snapshot the store to `target` while writers proceed. Returns the
    /// completion timestamp in milliseconds since the epoch.
    pub fn online_backup(&self, target: &Path) -> Result<u64> {
        self.kv.online_copy(target)?;
        let ts = chrono::Utc::now().timestamp_millis().max(0) as u64;
        self.vlog(&format!("online backup written to {}", target.display()));
        Ok(ts)
    }

    /// Checkpoint and release the storage file.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.kv.close()
    }

    /// Render a stored document as JSON text (diagnostic convenience).
    pub fn get_json(&self, coll: &str, id: i64, flags: PrintFlags) -> Result<String> {
        Ok(self.get(coll, id)?.to_json(flags))
    }
}

impl Drop for OpalDb {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{IDX_I64, IDX_STR, IDX_UNIQUE};
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> OpalDb {
        OpalDb::open(&dir.path().join("db.opal")).unwrap()
    }

    #[test]
    fn put_new_assigns_monotonic_ids() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        let doc = Bdoc::from_json(r#"{"n":1}"#).unwrap();
        let id1 = db.put_new("c", &doc).unwrap();
        let id2 = db.put_new("c", &doc).unwrap();
        assert_eq!(id1, 1);
        assert_eq!(id2, 2);
        assert_ne!(id1, id2);
    }

    #[test]
    fn put_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        let id = db.put_new_json("users", r#"{"name":"Andy","age":30}"#).unwrap();
        let got = db.get("users", id).unwrap();
        assert_eq!(got.to_json(PrintFlags::PLAIN), r#"{"name":"Andy","age":30}"#);
    }

    #[test]
    fn get_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        db.ensure_collection("c").unwrap();
        assert!(matches!(db.get("c", 42), Err(Error::NotFound(42))));
        assert!(matches!(
            db.get("missing", 1),
            Err(Error::CollectionNotFound(_))
        ));
    }

    #[test]
    fn del_removes_and_errors_when_absent() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        let id = db.put_new_json("c", r#"{"a":1}"#).unwrap();
        db.del("c", id).unwrap();
        assert!(matches!(db.get("c", id), Err(Error::NotFound(_))));
        assert!(matches!(db.del("c", id), Err(Error::NotFound(_))));
    }

    #[test]
    fn explicit_put_replaces_and_bumps_seed() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        db.put_json("c", r#"{"v":1}"#, 10).unwrap();
        db.put_json("c", r#"{"v":2}"#, 10).unwrap();
        assert_eq!(db.get_json("c", 10, PrintFlags::PLAIN).unwrap(), r#"{"v":2}"#);
        let next = db.put_new_json("c", r#"{"v":3}"#).unwrap();
        assert_eq!(next, 11);
    }

    #[test]
    fn ensure_collection_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        db.ensure_collection("c").unwrap();
        db.ensure_collection("c").unwrap();
        assert!(matches!(db.ensure_collection(""), Err(Error::InvalidName(_))));
    }

    #[test]
    fn rename_collection_moves_documents() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        let id = db.put_new_json("old", r#"{"a":1}"#).unwrap();
        db.rename_collection("old", "new").unwrap();
        assert!(db.get("new", id).is_ok());
        assert!(matches!(
            db.get("old", id),
            Err(Error::CollectionNotFound(_))
        ));
        assert!(matches!(
            db.rename_collection("old", "other"),
            Err(Error::CollectionNotFound(_))
        ));
        db.ensure_collection("third").unwrap();
        assert!(matches!(
            db.rename_collection("new", "third"),
            Err(Error::CollectionExists(_))
        ));
    }

    #[test]
    fn remove_collection_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        db.put_new_json("c", r#"{"a":1}"#).unwrap();
        db.remove_collection("c").unwrap();
        db.remove_collection("c").unwrap();
        assert!(matches!(db.get("c", 1), Err(Error::CollectionNotFound(_))));
        // Re-created collection starts a fresh id space.
        let id = db.put_new_json("c", r#"{"a":2}"#).unwrap();
        assert_eq!(id, 1);
    }

    #[test]
    fn unique_index_rejects_duplicates_without_side_effects() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        db.ensure_index("users", "/name", IndexMode(IDX_UNIQUE | IDX_STR))
            .unwrap();
        let id = db.put_new_json("users", r#"{"name":"Andy"}"#).unwrap();
        assert_eq!(id, 1);
        let err = db.put_new_json("users", r#"{"name":"Andy"}"#);
        assert!(matches!(err, Err(Error::UniqueViolation(_))));
        // Primary and index are untouched by the failed put.
        let meta = db.get_meta().unwrap();
        let meta_node = meta.to_node();
        let coll = meta_node.at(&Pointer::parse("/collections/0").unwrap()).unwrap();
        assert_eq!(coll.get("rnum").unwrap().as_i64(), Some(1));
        let idx_rnum = meta_node
            .at(&Pointer::parse("/collections/0/indexes/0/rnum").unwrap())
            .unwrap();
        assert_eq!(idx_rnum.as_i64(), Some(1));
    }

    #[test]
    fn mismatched_unique_mode_detected() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        db.ensure_index("c", "/a", IndexMode(IDX_STR)).unwrap();
        db.ensure_index("c", "/a", IndexMode(IDX_STR)).unwrap();
        assert!(matches!(
            db.ensure_index("c", "/a", IndexMode(IDX_UNIQUE | IDX_STR)),
            Err(Error::MismatchedUnique(_))
        ));
        assert!(matches!(
            db.ensure_index("c", "/a", IndexMode(IDX_I64)),
            Err(Error::MismatchedUnique(_))
        ));
    }

    #[test]
    fn index_backfill_on_existing_documents() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        for n in [3i64, 1, 2] {
            db.put_new_json("c", &format!(r#"{{"n":{n}}}"#)).unwrap();
        }
        db.ensure_index("c", "/n", IndexMode(IDX_I64)).unwrap();
        let meta = db.get_meta().unwrap().to_node();
        let rnum = meta
            .at(&Pointer::parse("/collections/0/indexes/0/rnum").unwrap())
            .unwrap();
        assert_eq!(rnum.as_i64(), Some(3));
    }

    #[test]
    fn remove_index_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        db.ensure_index("c", "/n", IndexMode(IDX_I64)).unwrap();
        db.remove_index("c", "/n").unwrap();
        db.remove_index("c", "/n").unwrap();
        db.remove_index("nope", "/n").unwrap();
    }

    #[test]
    fn patch_and_merge() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        let id = db
            .put_new_json("c", r#"{"foo":"bar","list":["one","two"]}"#)
            .unwrap();
        db.patch("c", id, r#"[{"op":"remove","path":"/list/1"}]"#).unwrap();
        assert_eq!(
            db.get_json("c", id, PrintFlags::PLAIN).unwrap(),
            r#"{"foo":"bar","list":["one"]}"#
        );
        db.patch("c", id, r#"{"foo":null,"n":5}"#).unwrap();
        assert_eq!(
            db.get_json("c", id, PrintFlags::PLAIN).unwrap(),
            r#"{"list":["one"],"n":5}"#
        );
    }

    #[test]
    fn merge_or_put_inserts_then_merges() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        db.merge_or_put("c", 7, r#"{"a":{"b":"c"}}"#).unwrap();
        db.merge_or_put("c", 7, r#"{"a":{"b":"d","c":null}}"#).unwrap();
        assert_eq!(
            db.get_json("c", 7, PrintFlags::PLAIN).unwrap(),
            r#"{"a":{"b":"d"}}"#
        );
    }

    #[test]
    fn persistence_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.opal");
        {
            let db = OpalDb::open(&path).unwrap();
            db.ensure_index("users", "/name", IndexMode(IDX_UNIQUE | IDX_STR))
                .unwrap();
            db.put_new_json("users", r#"{"name":"Andy"}"#).unwrap();
            db.close().unwrap();
        }
        let db = OpalDb::open(&path).unwrap();
        assert_eq!(
            db.get_json("users", 1, PrintFlags::PLAIN).unwrap(),
            r#"{"name":"Andy"}"#
        );
        // Unique constraint still enforced after reopen.
        assert!(matches!(
            db.put_new_json("users", r#"{"name":"Andy"}"#),
            Err(Error::UniqueViolation(_))
        ));
        // Id seed survived; the failed put did not advance it.
        let id = db.put_new_json("users", r#"{"name":"Bea"}"#).unwrap();
        assert_eq!(id, 2);
    }

    #[test]
    fn backup_is_openable() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        db.put_new_json("c", r#"{"a":1}"#).unwrap();
        let target = dir.path().join("backup.opal");
        let ts = db.online_backup(&target).unwrap();
        assert!(ts > 0);
        db.close().unwrap();
        let copy = OpalDb::open(&target).unwrap();
        assert_eq!(copy.get_json("c", 1, PrintFlags::PLAIN).unwrap(), r#"{"a":1}"#);
    }
}
