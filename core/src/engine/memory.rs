//! Reference engine over a memory-mapped arena
//!
//! Single writer, copy-on-write trees per sub-database, nested child
//! transactions and snapshot reads. Values are appended to the arena with
//! their version stamp in front and are never rewritten, so a snapshot
//! stays readable for as long as it is held.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::ops::{Bound, Range};
use std::sync::Arc;

use super::{
    CursorPosition, DbFlags, DbId, DbStat, EngineError, EngineResult, EntryLocation, MAX_KEY_SIZE,
    MapArena, MappedRegion, SessionId, StorageEngine, TxnId, TxnKind, VERSION_STAMP_SIZE,
};

type DbTree = BTreeMap<(Vec<u8>, Vec<u8>), Slot>;

#[derive(Debug, Clone, Copy)]
struct Slot {
    /// Absolute offset of the value; its version stamp sits just before
    at: usize,
    len: u32,
}

#[derive(Clone, Default)]
struct Tree {
    dbs: HashMap<DbId, Arc<DbTree>>,
}

impl Tree {
    fn db(&self, db: DbId) -> Option<&DbTree> {
        self.dbs.get(&db).map(|t| t.as_ref())
    }

    fn db_mut(&mut self, db: DbId) -> &mut DbTree {
        Arc::make_mut(self.dbs.entry(db).or_default())
    }
}

enum TxnState {
    Read {
        session: SessionId,
        snapshot: Option<Arc<Tree>>,
    },
    Write {
        parent: Option<TxnId>,
        tree: Tree,
        arena_mark: usize,
        has_child: bool,
    },
}

struct DbMeta {
    name: Option<String>,
    flags: DbFlags,
}

/// Injected failures, consumed once they fire
#[derive(Debug, Clone)]
pub enum Fault {
    /// Fail the put that comes after `after` successful puts.
    Put { after: usize, error: EngineError },
    /// Fail the next root commit; the transaction is aborted.
    Commit(EngineError),
}

struct EngineState {
    arena: Arc<MapArena>,
    used: usize,
    external_size: Option<usize>,
    committed: Arc<Tree>,
    dbs: Vec<DbMeta>,
    max_dbs: usize,
    txns: HashMap<TxnId, TxnState>,
    writer: Option<TxnId>,
    sessions: HashMap<SessionId, bool>,
    next_txn: u64,
    next_session: u64,
    faults: Vec<Fault>,
}

/// In-process engine over an anonymous memory map
pub struct MemEngine {
    state: Mutex<EngineState>,
}

impl MemEngine {
    /// Create an engine with a map of `map_size` bytes split into regions of
    /// `region_span` bytes. The root database always exists.
    pub fn new(map_size: usize, region_span: u64, max_dbs: usize) -> EngineResult<Self> {
        let arena = MapArena::new(map_size, region_span, 0)?;
        Ok(Self {
            state: Mutex::new(EngineState {
                arena: Arc::new(arena),
                used: 0,
                external_size: None,
                committed: Arc::new(Tree::default()),
                dbs: vec![DbMeta {
                    name: None,
                    flags: DbFlags::default(),
                }],
                max_dbs,
                txns: HashMap::new(),
                writer: None,
                sessions: HashMap::new(),
                next_txn: 1,
                next_session: 1,
                faults: Vec::new(),
            }),
        })
    }

    /// Queue a failure to be reported by a later put or commit
    pub fn inject_fault(&self, fault: Fault) {
        self.state.lock().faults.push(fault);
    }

    /// Simulate another handle growing the map to `new_size`. Write
    /// transactions report `MapResized` until [`StorageEngine::remap`] runs.
    pub fn resize_externally(&self, new_size: usize) {
        let mut state = self.state.lock();
        let current = state.arena.len();
        state.external_size = Some(new_size.max(current));
    }

    pub fn map_size(&self) -> usize {
        self.state.lock().arena.len()
    }

    /// Bytes of the arena in use, committed or not
    pub fn used(&self) -> usize {
        self.state.lock().used
    }

    fn next_txn_id(state: &mut EngineState) -> TxnId {
        let id = TxnId(state.next_txn);
        state.next_txn += 1;
        id
    }

    fn check_key(key: &[u8]) -> EngineResult<()> {
        if key.is_empty() || key.len() > MAX_KEY_SIZE {
            return Err(EngineError::BadKey(key.len()));
        }
        Ok(())
    }

    fn check_db(state: &EngineState, db: DbId) -> EngineResult<DbFlags> {
        state
            .dbs
            .get(db.0 as usize)
            .map(|meta| meta.flags)
            .ok_or_else(|| EngineError::Problem(format!("unknown database {}", db.0)))
    }

    fn take_put_fault(faults: &mut Vec<Fault>) -> EngineResult<()> {
        let Some(pos) = faults.iter().position(|f| matches!(f, Fault::Put { .. })) else {
            return Ok(());
        };
        if let Fault::Put { after, error } = &mut faults[pos] {
            if *after > 0 {
                *after -= 1;
                return Ok(());
            }
            let error = error.clone();
            faults.remove(pos);
            return Err(error);
        }
        Ok(())
    }

    fn take_commit_fault(faults: &mut Vec<Fault>) -> Option<EngineError> {
        let pos = faults.iter().position(|f| matches!(f, Fault::Commit(_)))?;
        match faults.remove(pos) {
            Fault::Commit(error) => Some(error),
            Fault::Put { .. } => None,
        }
    }

    fn write_tree(txns: &mut HashMap<TxnId, TxnState>, txn: TxnId) -> EngineResult<&mut Tree> {
        match txns.get_mut(&txn) {
            Some(TxnState::Write {
                tree, has_child, ..
            }) => {
                if *has_child {
                    return Err(EngineError::BadTxn(
                        "transaction has an active child".into(),
                    ));
                }
                Ok(tree)
            }
            Some(TxnState::Read { .. }) => {
                Err(EngineError::BadTxn("write in a read-only transaction".into()))
            }
            None => Err(EngineError::TxnClosed),
        }
    }

    fn read_tree(txns: &HashMap<TxnId, TxnState>, txn: TxnId) -> EngineResult<&Tree> {
        match txns.get(&txn) {
            Some(TxnState::Read {
                snapshot: Some(tree),
                ..
            }) => Ok(tree.as_ref()),
            Some(TxnState::Read { snapshot: None, .. }) => {
                Err(EngineError::BadTxn("read transaction is reset".into()))
            }
            Some(TxnState::Write { tree, .. }) => Ok(tree),
            None => Err(EngineError::TxnClosed),
        }
    }

    fn location(arena: &MapArena, slot: &Slot) -> EntryLocation {
        let span = arena.region_span();
        let at = slot.at as u64;
        // slots only point at written entries, and those are never rewritten
        let version = unsafe { arena.version_before(slot.at) };
        EntryLocation {
            region: (at / span) as u32,
            offset: at % span,
            length: slot.len,
            version,
        }
    }

    /// Drop child transactions hanging off `parent`, innermost first.
    fn abort_children(state: &mut EngineState, parent: TxnId) {
        let children: Vec<TxnId> = state
            .txns
            .iter()
            .filter_map(|(id, txn)| match txn {
                TxnState::Write {
                    parent: Some(p), ..
                } if *p == parent => Some(*id),
                _ => None,
            })
            .collect();
        for child in children {
            Self::abort_children(state, child);
            state.txns.remove(&child);
        }
    }
}

impl StorageEngine for MemEngine {
    fn open_db(&self, name: Option<&str>, flags: DbFlags) -> EngineResult<DbId> {
        let mut state = self.state.lock();

        if let Some(pos) = state
            .dbs
            .iter()
            .position(|meta| meta.name.as_deref() == name)
        {
            if state.dbs[pos].flags != flags && name.is_some() {
                return Err(EngineError::Problem(format!(
                    "database {:?} is already open with different flags",
                    name
                )));
            }
            return Ok(DbId(pos as u32));
        }

        // the root database does not count against the limit
        if state.dbs.len() > state.max_dbs {
            return Err(EngineError::DbsFull);
        }

        state.dbs.push(DbMeta {
            name: name.map(str::to_string),
            flags,
        });
        Ok(DbId((state.dbs.len() - 1) as u32))
    }

    fn begin_txn(&self, kind: TxnKind) -> EngineResult<TxnId> {
        let mut state = self.state.lock();
        let state = &mut *state;

        match kind {
            TxnKind::Read(session) => {
                if state.sessions.get(&session) != Some(&true) {
                    return Err(EngineError::BadTxn("reader session is closed".into()));
                }
                let id = Self::next_txn_id(state);
                let snapshot = Some(Arc::clone(&state.committed));
                state.txns.insert(id, TxnState::Read { session, snapshot });
                Ok(id)
            }
            TxnKind::Write => {
                if state.external_size.is_some() {
                    return Err(EngineError::MapResized);
                }
                if state.writer.is_some() {
                    return Err(EngineError::Busy);
                }
                let id = Self::next_txn_id(state);
                let tree = (*state.committed).clone();
                state.txns.insert(
                    id,
                    TxnState::Write {
                        parent: None,
                        tree,
                        arena_mark: state.used,
                        has_child: false,
                    },
                );
                state.writer = Some(id);
                Ok(id)
            }
            TxnKind::Child(parent) => {
                let tree = Self::write_tree(&mut state.txns, parent)?.clone();
                if let Some(TxnState::Write { has_child, .. }) = state.txns.get_mut(&parent) {
                    *has_child = true;
                }
                let id = Self::next_txn_id(state);
                state.txns.insert(
                    id,
                    TxnState::Write {
                        parent: Some(parent),
                        tree,
                        arena_mark: state.used,
                        has_child: false,
                    },
                );
                Ok(id)
            }
        }
    }

    fn commit(&self, txn: TxnId) -> EngineResult<()> {
        let mut state = self.state.lock();
        let state = &mut *state;

        let Some(txn_state) = state.txns.remove(&txn) else {
            return Err(EngineError::TxnClosed);
        };

        match txn_state {
            TxnState::Read { .. } => Ok(()),
            TxnState::Write {
                parent: None,
                tree,
                arena_mark,
                has_child,
            } => {
                if has_child {
                    Self::abort_children(state, txn);
                }
                state.writer = None;
                if let Some(error) = Self::take_commit_fault(&mut state.faults) {
                    state.used = arena_mark;
                    return Err(error);
                }
                state.committed = Arc::new(tree);
                Ok(())
            }
            TxnState::Write {
                parent: Some(parent),
                tree,
                has_child,
                ..
            } => {
                if has_child {
                    Self::abort_children(state, txn);
                }
                match state.txns.get_mut(&parent) {
                    Some(TxnState::Write {
                        tree: parent_tree,
                        has_child,
                        ..
                    }) => {
                        *parent_tree = tree;
                        *has_child = false;
                        Ok(())
                    }
                    _ => Err(EngineError::TxnClosed),
                }
            }
        }
    }

    fn abort(&self, txn: TxnId) -> EngineResult<()> {
        let mut state = self.state.lock();
        let state = &mut *state;

        let Some(txn_state) = state.txns.remove(&txn) else {
            return Err(EngineError::TxnClosed);
        };

        match txn_state {
            TxnState::Read { .. } => {}
            TxnState::Write {
                parent, arena_mark, ..
            } => {
                Self::abort_children(state, txn);
                state.used = arena_mark;
                match parent {
                    None => state.writer = None,
                    Some(parent) => {
                        if let Some(TxnState::Write { has_child, .. }) = state.txns.get_mut(&parent)
                        {
                            *has_child = false;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn put(
        &self,
        txn: TxnId,
        db: DbId,
        key: &[u8],
        value: &[u8],
        version: Option<f64>,
    ) -> EngineResult<()> {
        let mut state = self.state.lock();
        let state = &mut *state;

        Self::check_key(key)?;
        let flags = Self::check_db(state, db)?;
        let tree = Self::write_tree(&mut state.txns, txn)?;
        Self::take_put_fault(&mut state.faults)?;

        let need = VERSION_STAMP_SIZE + value.len();
        let at = state
            .arena
            .place(state.used, need)?
            .ok_or(EngineError::MapFull)?;

        let version = version.unwrap_or(0.0);
        unsafe { state.arena.write_entry(at, version, value) };
        state.used = at + need;

        let dup = if flags.dup_sort {
            value.to_vec()
        } else {
            Vec::new()
        };
        tree.db_mut(db).insert(
            (key.to_vec(), dup),
            Slot {
                at: at + VERSION_STAMP_SIZE,
                len: value.len() as u32,
            },
        );
        Ok(())
    }

    fn delete(
        &self,
        txn: TxnId,
        db: DbId,
        key: &[u8],
        expected: Option<&[u8]>,
    ) -> EngineResult<bool> {
        let mut state = self.state.lock();
        let state = &mut *state;

        Self::check_key(key)?;
        let flags = Self::check_db(state, db)?;
        let arena = Arc::clone(&state.arena);
        let entries = Self::write_tree(&mut state.txns, txn)?.db_mut(db);

        if flags.dup_sort {
            return Ok(match expected {
                Some(value) => entries.remove(&(key.to_vec(), value.to_vec())).is_some(),
                None => {
                    let doomed: Vec<_> = entries
                        .range((key.to_vec(), Vec::new())..)
                        .take_while(|((k, _), _)| k.as_slice() == key)
                        .map(|(k, _)| k.clone())
                        .collect();
                    for k in &doomed {
                        entries.remove(k);
                    }
                    !doomed.is_empty()
                }
            });
        }

        let slot_key = (key.to_vec(), Vec::new());
        let Some(slot) = entries.get(&slot_key).copied() else {
            return Ok(false);
        };
        if let Some(value) = expected {
            let stored = unsafe { arena.bytes(slot.at, slot.len as usize) };
            if stored != value {
                return Ok(false);
            }
        }
        entries.remove(&slot_key);
        Ok(true)
    }

    fn get(&self, txn: TxnId, db: DbId, key: &[u8]) -> EngineResult<Option<EntryLocation>> {
        let state = self.state.lock();

        Self::check_key(key)?;
        Self::check_db(&state, db)?;
        let tree = Self::read_tree(&state.txns, txn)?;

        Ok(tree.db(db).and_then(|entries| {
            entries
                .range((key.to_vec(), Vec::new())..)
                .next()
                .filter(|((k, _), _)| k.as_slice() == key)
                .map(|(_, slot)| Self::location(&state.arena, slot))
        }))
    }

    fn next_entry(
        &self,
        txn: TxnId,
        db: DbId,
        after: Option<&CursorPosition>,
    ) -> EngineResult<Option<(CursorPosition, EntryLocation)>> {
        let state = self.state.lock();

        Self::check_db(&state, db)?;
        let tree = Self::read_tree(&state.txns, txn)?;
        let Some(entries) = tree.db(db) else {
            return Ok(None);
        };

        let lower = match after {
            Some(pos) => Bound::Excluded((pos.key.clone(), pos.dup.clone())),
            None => Bound::Unbounded,
        };
        Ok(entries
            .range((lower, Bound::Unbounded))
            .next()
            .map(|((key, dup), slot)| {
                (
                    CursorPosition {
                        key: key.clone(),
                        dup: dup.clone(),
                    },
                    Self::location(&state.arena, slot),
                )
            }))
    }

    fn drop_db(&self, txn: TxnId, db: DbId, delete: bool) -> EngineResult<()> {
        let mut state = self.state.lock();
        let state = &mut *state;

        Self::check_db(state, db)?;
        let tree = Self::write_tree(&mut state.txns, txn)?;
        if delete {
            tree.dbs.remove(&db);
        } else {
            tree.db_mut(db).clear();
        }
        Ok(())
    }

    fn stat(&self, txn: TxnId, db: DbId) -> EngineResult<DbStat> {
        let state = self.state.lock();

        Self::check_db(&state, db)?;
        let tree = Self::read_tree(&state.txns, txn)?;
        Ok(tree
            .db(db)
            .map(|entries| DbStat {
                entries: entries.len() as u64,
                value_bytes: entries.values().map(|slot| slot.len as u64).sum(),
            })
            .unwrap_or_default())
    }

    fn grow_map(&self) -> EngineResult<()> {
        let mut state = self.state.lock();

        if state.writer.is_some() {
            return Err(EngineError::Busy);
        }
        let new_len = state.arena.len() * 2;
        let grown = state.arena.grown(new_len, state.used)?;
        tracing::debug!(
            "Map grown from {} to {} bytes (generation {})",
            state.arena.len(),
            new_len,
            grown.generation()
        );
        state.arena = Arc::new(grown);
        Ok(())
    }

    fn remap(&self) -> EngineResult<()> {
        let mut state = self.state.lock();

        if state.writer.is_some() {
            return Err(EngineError::Busy);
        }
        let Some(size) = state.external_size.take() else {
            return Ok(());
        };
        if size > state.arena.len() {
            let grown = state.arena.grown(size, state.used)?;
            state.arena = Arc::new(grown);
        }
        Ok(())
    }

    fn map_generation(&self) -> u64 {
        self.state.lock().arena.generation()
    }

    fn renew_read_txn(&self, txn: TxnId) -> EngineResult<()> {
        let mut state = self.state.lock();
        let committed = Arc::clone(&state.committed);

        match state.txns.get_mut(&txn) {
            Some(TxnState::Read { snapshot, .. }) => {
                *snapshot = Some(committed);
                Ok(())
            }
            Some(TxnState::Write { .. }) => {
                Err(EngineError::BadTxn("cannot renew a write transaction".into()))
            }
            None => Err(EngineError::TxnClosed),
        }
    }

    fn reset_read_txn(&self, txn: TxnId) -> EngineResult<()> {
        let mut state = self.state.lock();

        match state.txns.get_mut(&txn) {
            Some(TxnState::Read { snapshot, .. }) => {
                *snapshot = None;
                Ok(())
            }
            Some(TxnState::Write { .. }) => {
                Err(EngineError::BadTxn("cannot reset a write transaction".into()))
            }
            None => Err(EngineError::TxnClosed),
        }
    }

    fn mapped_region(&self, region: u32, range: Range<u64>) -> EngineResult<MappedRegion> {
        let state = self.state.lock();

        let span = state.arena.region_span();
        let map_len = state.arena.len() as u64;
        let base = region as u64 * span;
        if base >= map_len {
            return Err(EngineError::Problem(format!("region {} is not mapped", region)));
        }

        let region_len = span.min(map_len - base);
        if range.start >= region_len || range.end <= range.start {
            return Err(EngineError::Problem(format!(
                "range {:?} is outside region {}",
                range, region
            )));
        }
        let end = range.end.min(region_len);
        Ok(MappedRegion::new(
            Arc::clone(&state.arena),
            region,
            range.start,
            end - range.start,
        ))
    }

    fn open_session(&self) -> SessionId {
        let mut state = self.state.lock();
        let id = SessionId(state.next_session);
        state.next_session += 1;
        state.sessions.insert(id, true);
        id
    }

    fn close_session(&self, session: SessionId) {
        self.state.lock().sessions.insert(session, false);
    }

    fn reader_check(&self) -> EngineResult<usize> {
        let mut state = self.state.lock();
        let state = &mut *state;

        let sessions = &state.sessions;
        let before = state.txns.len();
        state.txns.retain(|_, txn| match txn {
            TxnState::Read { session, .. } => sessions.get(session) == Some(&true),
            TxnState::Write { .. } => true,
        });
        Ok(before - state.txns.len())
    }

    fn reader_count(&self) -> usize {
        self.state
            .lock()
            .txns
            .values()
            .filter(|txn| matches!(txn, TxnState::Read { .. }))
            .count()
    }
}
