use super::{
    ColumnInfo, ColumnValue, ConnHandle, ExternalHandle, NativeClient, NativeError,
    ParamDescription, ParamDirection, StmtHandle,
};
use crate::protocol::bind::{BoundCell, BoundParam};
use crate::protocol::types::{DataType, NativeType};
use crate::versioning::ApiVersion;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

pub use crate::engine::NO_MORE_RESULTS;

/// One cell of a scripted result.
#[derive(Clone, Debug, PartialEq)]
pub struct FakeCell {
    pub data_type: DataType,
    pub is_null: bool,
    pub data: Vec<u8>,
}

impl FakeCell {
    pub fn int(v: i32) -> Self {
        Self::raw(DataType::Val32, v.to_ne_bytes().to_vec())
    }

    pub fn double(v: f64) -> Self {
        Self::raw(DataType::Double, v.to_ne_bytes().to_vec())
    }

    pub fn text(v: &str) -> Self {
        Self::raw(DataType::String, v.as_bytes().to_vec())
    }

    pub fn binary(v: &[u8]) -> Self {
        Self::raw(DataType::Binary, v.to_vec())
    }

    pub fn null() -> Self {
        Self {
            data_type: DataType::String,
            is_null: true,
            data: Vec::new(),
        }
    }

    pub fn raw(data_type: DataType, data: Vec<u8>) -> Self {
        Self {
            data_type,
            is_null: false,
            data,
        }
    }
}

/// A scripted outcome of executing (or advancing) a statement.
#[derive(Clone, Debug, PartialEq)]
pub enum FakeResult {
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<FakeCell>>,
    },
    Affected(i32),
    Error(NativeError),
}

impl FakeResult {
    pub fn rows(columns: &[&str], rows: Vec<Vec<FakeCell>>) -> Self {
        FakeResult::Rows {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
        }
    }

    pub fn error(code: i32, message: &str) -> Self {
        FakeResult::Error(NativeError {
            code,
            message: message.to_string(),
        })
    }
}

#[derive(Default)]
struct FakeConn {
    connected: bool,
    external: bool,
    conn_str: Option<String>,
    last_error: Option<NativeError>,
}

struct FakeStmt {
    conn: usize,
    sql: String,
    placeholders: usize,
    bound: Vec<Option<Vec<FakeCell>>>,
    batch: u32,
    pending: VecDeque<FakeResult>,
    current: Option<FakeResult>,
    cursor: Option<usize>,
}

#[derive(Default)]
struct FakeState {
    next_handle: usize,
    connections: HashMap<usize, FakeConn>,
    statements: HashMap<usize, FakeStmt>,
    scripts: HashMap<String, Vec<FakeResult>>,
    prepare_errors: HashMap<String, NativeError>,
    connect_error: Option<NativeError>,
    calls: Vec<String>,
}

/// In-memory client used by tests.
///
/// Statements whose SQL contains `?` echo their bound parameters back as a
/// result set, one row per batch row. Column names come from `AS <name>`
/// clauses in order, else `c0`, `c1`, ... Other SQL answers from scripts
/// registered with [`FakeClient::script`], or with an empty result.
///
/// Every call on a connection (or one of its statements) marks the
/// connection busy for its duration; overlapping calls are recorded and
/// reported by [`FakeClient::overlap_detected`].
pub struct FakeClient {
    max_version: ApiVersion,
    init_fails: AtomicBool,
    state: Mutex<FakeState>,
    busy: Mutex<HashSet<usize>>,
    overlap: AtomicBool,
    delay: Mutex<Duration>,
    init_calls: AtomicUsize,
    fini_calls: AtomicUsize,
    cancel_calls: AtomicUsize,
    live_statements: AtomicUsize,
}

struct BusyGuard<'a> {
    client: &'a FakeClient,
    conn: usize,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut busy) = self.client.busy.lock() {
            busy.remove(&self.conn);
        }
    }
}

fn placeholder_count(sql: &str) -> usize {
    sql.matches('?').count()
}

fn alias_names(sql: &str) -> Vec<String> {
    let words: Vec<&str> = sql.split_whitespace().collect();
    words
        .windows(2)
        .filter(|w| w[0].eq_ignore_ascii_case("as"))
        .map(|w| {
            w[1].trim_matches(|c: char| c == ',' || c == ';' || c == '(' || c == ')')
                .to_string()
        })
        .collect()
}

fn native_type_for(data_type: DataType) -> NativeType {
    match data_type {
        DataType::String => NativeType::Varchar,
        DataType::Binary => NativeType::Binary,
        DataType::Double => NativeType::Double,
        DataType::Val64 => NativeType::BigInt,
        DataType::UVal64 => NativeType::UnsBigInt,
        DataType::Val32 => NativeType::Int,
        DataType::UVal32 => NativeType::UnsInt,
        DataType::Val16 => NativeType::SmallInt,
        DataType::UVal16 => NativeType::UnsSmallInt,
        DataType::Val8 | DataType::UVal8 => NativeType::TinyInt,
        DataType::Invalid => NativeType::NoType,
    }
}

impl Default for FakeClient {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeClient {
    pub fn new() -> Self {
        Self::with_max_version(ApiVersion::V4)
    }

    /// Client that refuses any init request above `max_version`.
    pub fn with_max_version(max_version: ApiVersion) -> Self {
        Self {
            max_version,
            init_fails: AtomicBool::new(false),
            state: Mutex::new(FakeState {
                next_handle: 1,
                ..FakeState::default()
            }),
            busy: Mutex::new(HashSet::new()),
            overlap: AtomicBool::new(false),
            delay: Mutex::new(Duration::ZERO),
            init_calls: AtomicUsize::new(0),
            fini_calls: AtomicUsize::new(0),
            cancel_calls: AtomicUsize::new(0),
            live_statements: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enter(&self, conn: usize, op: &str) -> BusyGuard<'_> {
        {
            let mut busy = self.busy.lock().unwrap_or_else(|e| e.into_inner());
            if !busy.insert(conn) {
                log::warn!("fake client: overlapping call {} on connection {}", op, conn);
                self.overlap.store(true, Ordering::SeqCst);
            }
        }
        self.state().calls.push(op.to_string());
        let delay = *self.delay.lock().unwrap_or_else(|e| e.into_inner());
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        BusyGuard { client: self, conn }
    }

    fn conn_of(&self, stmt: StmtHandle) -> usize {
        self.state()
            .statements
            .get(&stmt.as_raw())
            .map(|s| s.conn)
            .unwrap_or(0)
    }

    fn set_error(state: &mut FakeState, conn: usize, code: i32, message: &str) {
        if let Some(c) = state.connections.get_mut(&conn) {
            c.last_error = Some(NativeError {
                code,
                message: message.to_string(),
            });
        }
    }

    fn alloc_handle(state: &mut FakeState) -> usize {
        let h = state.next_handle;
        state.next_handle += 1;
        h
    }

    /// Results delivered for `sql`: the first on execute, the rest through
    /// `get_next_result`.
    pub fn script(&self, sql: &str, results: Vec<FakeResult>) {
        self.state().scripts.insert(sql.trim().to_string(), results);
    }

    pub fn fail_prepare(&self, sql: &str, code: i32, message: &str) {
        self.state().prepare_errors.insert(
            sql.trim().to_string(),
            NativeError {
                code,
                message: message.to_string(),
            },
        );
    }

    /// Makes every later `connect` fail with the given error; `None` clears it.
    pub fn fail_connect(&self, error: Option<(i32, &str)>) {
        self.state().connect_error = error.map(|(code, message)| NativeError {
            code,
            message: message.to_string(),
        });
    }

    pub fn fail_init(&self, fail: bool) {
        self.init_fails.store(fail, Ordering::SeqCst);
    }

    /// Time every connection-scoped call spends marked busy.
    pub fn set_call_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    pub fn overlap_detected(&self) -> bool {
        self.overlap.load(Ordering::SeqCst)
    }

    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub fn fini_calls(&self) -> usize {
        self.fini_calls.load(Ordering::SeqCst)
    }

    pub fn cancel_calls(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }

    /// Prepared statements not yet freed.
    pub fn live_statements(&self) -> usize {
        self.live_statements.load(Ordering::SeqCst)
    }

    /// Native connection objects not yet freed.
    pub fn live_connections(&self) -> usize {
        self.state().connections.len()
    }

    pub fn last_connection_string(&self) -> Option<String> {
        let state = self.state();
        state
            .connections
            .iter()
            .max_by_key(|(h, _)| **h)
            .and_then(|(_, c)| c.conn_str.clone())
    }

    /// Names of the native calls made so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    fn echo_result(stmt: &FakeStmt) -> FakeResult {
        let rows = stmt.batch.max(1) as usize;
        let aliases = alias_names(&stmt.sql);
        let columns = (0..stmt.bound.len())
            .map(|i| aliases.get(i).cloned().unwrap_or_else(|| format!("c{}", i)))
            .collect();
        let rows = (0..rows)
            .map(|r| {
                stmt.bound
                    .iter()
                    .map(|cells| {
                        cells
                            .as_ref()
                            .and_then(|c| c.get(r).cloned())
                            .unwrap_or_else(FakeCell::null)
                    })
                    .collect()
            })
            .collect();
        FakeResult::Rows { columns, rows }
    }

    fn current_cell(&self, stmt: StmtHandle, index: u32) -> Option<FakeCell> {
        let state = self.state();
        let s = state.statements.get(&stmt.as_raw())?;
        match (&s.current, s.cursor) {
            (Some(FakeResult::Rows { rows, .. }), Some(r)) => {
                rows.get(r)?.get(index as usize).cloned()
            }
            _ => None,
        }
    }
}

impl NativeClient for FakeClient {
    fn init(&self, _app_name: &str, version: ApiVersion) -> Result<ApiVersion, ApiVersion> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        if self.init_fails.load(Ordering::SeqCst) {
            return Err(ApiVersion(0));
        }
        if version > self.max_version {
            return Err(self.max_version);
        }
        Ok(version)
    }

    fn fini(&self) {
        self.fini_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn new_connection(&self) -> Option<ConnHandle> {
        let mut state = self.state();
        let h = Self::alloc_handle(&mut state);
        state.connections.insert(h, FakeConn::default());
        ConnHandle::from_raw(h)
    }

    fn make_connection(&self, external: ExternalHandle) -> Option<ConnHandle> {
        if external.0 == 0 {
            return None;
        }
        let mut state = self.state();
        let h = Self::alloc_handle(&mut state);
        state.connections.insert(
            h,
            FakeConn {
                connected: true,
                external: true,
                ..FakeConn::default()
            },
        );
        ConnHandle::from_raw(h)
    }

    fn connect(&self, conn: ConnHandle, conn_str: &str) -> bool {
        let _busy = self.enter(conn.as_raw(), "connect");
        let mut state = self.state();
        if let Some(err) = state.connect_error.clone() {
            Self::set_error(&mut state, conn.as_raw(), err.code, &err.message);
            return false;
        }
        match state.connections.get_mut(&conn.as_raw()) {
            Some(c) => {
                c.connected = true;
                c.conn_str = Some(conn_str.to_string());
                true
            }
            None => false,
        }
    }

    fn disconnect(&self, conn: ConnHandle) -> bool {
        let _busy = self.enter(conn.as_raw(), "disconnect");
        let mut state = self.state();
        match state.connections.get_mut(&conn.as_raw()) {
            Some(c) if c.connected && !c.external => {
                c.connected = false;
                true
            }
            _ => false,
        }
    }

    fn free_connection(&self, conn: ConnHandle) {
        self.state().connections.remove(&conn.as_raw());
    }

    fn prepare(&self, conn: ConnHandle, sql: &str) -> Option<StmtHandle> {
        let _busy = self.enter(conn.as_raw(), "prepare");
        let mut state = self.state();
        if let Some(err) = state.prepare_errors.get(sql.trim()).cloned() {
            Self::set_error(&mut state, conn.as_raw(), err.code, &err.message);
            return None;
        }
        if !state
            .connections
            .get(&conn.as_raw())
            .is_some_and(|c| c.connected)
        {
            Self::set_error(&mut state, conn.as_raw(), -101, "Not connected to a database");
            return None;
        }
        let h = Self::alloc_handle(&mut state);
        let placeholders = placeholder_count(sql);
        state.statements.insert(
            h,
            FakeStmt {
                conn: conn.as_raw(),
                sql: sql.trim().to_string(),
                placeholders,
                bound: vec![None; placeholders],
                batch: 1,
                pending: VecDeque::new(),
                current: None,
                cursor: None,
            },
        );
        self.live_statements.fetch_add(1, Ordering::SeqCst);
        StmtHandle::from_raw(h)
    }

    fn free_stmt(&self, stmt: StmtHandle) {
        let conn = self.conn_of(stmt);
        let _busy = self.enter(conn, "free_stmt");
        if self.state().statements.remove(&stmt.as_raw()).is_some() {
            self.live_statements.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn reset(&self, stmt: StmtHandle) -> bool {
        let conn = self.conn_of(stmt);
        let _busy = self.enter(conn, "reset");
        let mut state = self.state();
        match state.statements.get_mut(&stmt.as_raw()) {
            Some(s) => {
                s.bound = vec![None; s.placeholders];
                s.batch = 1;
                s.current = None;
                s.cursor = None;
                s.pending.clear();
                true
            }
            None => false,
        }
    }

    fn describe_bind_param(&self, stmt: StmtHandle, index: u32) -> Option<ParamDescription> {
        let conn = self.conn_of(stmt);
        let _busy = self.enter(conn, "describe_bind_param");
        let mut state = self.state();
        let placeholders = state.statements.get(&stmt.as_raw())?.placeholders;
        if index as usize >= placeholders {
            Self::set_error(&mut state, conn, -110, "Invalid parameter index");
            return None;
        }
        Some(ParamDescription {
            name: None,
            direction: ParamDirection::Input,
            data_type: DataType::Invalid,
        })
    }

    fn bind_param(&self, stmt: StmtHandle, index: u32, param: &BoundParam<'_>) -> bool {
        let conn = self.conn_of(stmt);
        let _busy = self.enter(conn, "bind_param");
        let cells = (0..param.rows.max(1))
            .map(|r| match param.cell(r) {
                BoundCell::Null => FakeCell::null(),
                BoundCell::Fixed(b) | BoundCell::Bytes(b) => FakeCell::raw(param.data_type, b.to_vec()),
            })
            .collect();
        let mut state = self.state();
        match state.statements.get_mut(&stmt.as_raw()) {
            Some(s) if (index as usize) < s.bound.len() => {
                s.bound[index as usize] = Some(cells);
                true
            }
            _ => false,
        }
    }

    fn set_batch_size(&self, stmt: StmtHandle, rows: u32) -> bool {
        let conn = self.conn_of(stmt);
        let _busy = self.enter(conn, "set_batch_size");
        let mut state = self.state();
        match state.statements.get_mut(&stmt.as_raw()) {
            Some(s) => {
                s.batch = rows;
                true
            }
            None => false,
        }
    }

    fn execute(&self, stmt: StmtHandle) -> bool {
        let conn = self.conn_of(stmt);
        let _busy = self.enter(conn, "execute");
        let mut state = self.state();
        let script = match state.statements.get(&stmt.as_raw()) {
            Some(s) => state.scripts.get(&s.sql).cloned(),
            None => return false,
        };

        let Some(s) = state.statements.get_mut(&stmt.as_raw()) else {
            return false;
        };
        let mut results: VecDeque<FakeResult> = match script {
            Some(list) => list.into(),
            None if s.placeholders > 0 => VecDeque::from([Self::echo_result(s)]),
            None => VecDeque::from([FakeResult::Affected(0)]),
        };
        let first = results.pop_front().unwrap_or(FakeResult::Affected(0));
        if let FakeResult::Error(err) = first {
            Self::set_error(&mut state, conn, err.code, &err.message);
            return false;
        }
        s.pending = results;
        s.current = Some(first);
        s.cursor = None;
        true
    }

    fn affected_rows(&self, stmt: StmtHandle) -> i32 {
        let state = self.state();
        match state.statements.get(&stmt.as_raw()).and_then(|s| s.current.as_ref()) {
            Some(FakeResult::Affected(n)) => *n,
            Some(FakeResult::Rows { .. }) => -1,
            _ => 0,
        }
    }

    fn num_cols(&self, stmt: StmtHandle) -> i32 {
        let state = self.state();
        match state.statements.get(&stmt.as_raw()).and_then(|s| s.current.as_ref()) {
            Some(FakeResult::Rows { columns, .. }) => columns.len() as i32,
            _ => 0,
        }
    }

    fn get_column_info(&self, stmt: StmtHandle, index: u32) -> Option<ColumnInfo> {
        let conn = self.conn_of(stmt);
        let _busy = self.enter(conn, "get_column_info");
        let state = self.state();
        let s = state.statements.get(&stmt.as_raw())?;
        let Some(FakeResult::Rows { columns, rows }) = &s.current else {
            return None;
        };
        let name = columns.get(index as usize)?.clone();
        let data_type = rows
            .iter()
            .filter_map(|r| r.get(index as usize))
            .find(|c| !c.is_null)
            .map_or(DataType::String, |c| c.data_type);
        Some(ColumnInfo {
            name,
            data_type,
            native_type: native_type_for(data_type),
            precision: 0,
            scale: 0,
            max_size: 0,
            nullable: true,
        })
    }

    fn fetch_next(&self, stmt: StmtHandle) -> bool {
        let conn = self.conn_of(stmt);
        let _busy = self.enter(conn, "fetch_next");
        let mut state = self.state();
        let Some(s) = state.statements.get_mut(&stmt.as_raw()) else {
            return false;
        };
        let total = match &s.current {
            Some(FakeResult::Rows { rows, .. }) => rows.len(),
            _ => return false,
        };
        let next = s.cursor.map_or(0, |c| c + 1);
        if next < total {
            s.cursor = Some(next);
            true
        } else {
            s.cursor = Some(total);
            false
        }
    }

    fn get_column(&self, stmt: StmtHandle, index: u32) -> Option<ColumnValue> {
        let conn = self.conn_of(stmt);
        let _busy = self.enter(conn, "get_column");
        let cell = self.current_cell(stmt, index)?;
        Some(ColumnValue {
            data_type: cell.data_type,
            is_null: cell.is_null,
            data: cell.data,
        })
    }

    fn get_next_result(&self, stmt: StmtHandle) -> bool {
        let conn = self.conn_of(stmt);
        let _busy = self.enter(conn, "get_next_result");
        let mut state = self.state();
        let Some(s) = state.statements.get_mut(&stmt.as_raw()) else {
            return false;
        };
        match s.pending.pop_front() {
            Some(FakeResult::Error(err)) => {
                s.current = None;
                Self::set_error(&mut state, conn, err.code, &err.message);
                false
            }
            Some(next) => {
                s.current = Some(next);
                s.cursor = None;
                true
            }
            None => {
                s.current = None;
                Self::set_error(&mut state, conn, NO_MORE_RESULTS, "Procedure has completed");
                false
            }
        }
    }

    fn commit(&self, conn: ConnHandle) -> bool {
        let _busy = self.enter(conn.as_raw(), "commit");
        self.state()
            .connections
            .get(&conn.as_raw())
            .is_some_and(|c| c.connected)
    }

    fn rollback(&self, conn: ConnHandle) -> bool {
        let _busy = self.enter(conn.as_raw(), "rollback");
        self.state()
            .connections
            .get(&conn.as_raw())
            .is_some_and(|c| c.connected)
    }

    fn error(&self, conn: ConnHandle) -> NativeError {
        self.state()
            .connections
            .get(&conn.as_raw())
            .and_then(|c| c.last_error.clone())
            .unwrap_or(NativeError {
                code: 0,
                message: String::new(),
            })
    }

    fn cancel(&self, _conn: ConnHandle) {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::bind::{BindLayout, BindSet};
    use crate::protocol::param_value::{BindParams, ParamValue};

    fn connected(client: &FakeClient) -> ConnHandle {
        let conn = client.new_connection().unwrap();
        assert!(client.connect(conn, "UID=dba;PWD=sql"));
        conn
    }

    #[test]
    fn test_init_refuses_newer_version() {
        let client = FakeClient::with_max_version(ApiVersion::V3);
        assert_eq!(client.init("app", ApiVersion::V4), Err(ApiVersion::V3));
        assert_eq!(client.init("app", ApiVersion::V3), Ok(ApiVersion::V3));
        assert_eq!(client.init_calls(), 2);
    }

    #[test]
    fn test_echo_statement_returns_bound_values() {
        let client = FakeClient::new();
        let conn = connected(&client);
        let stmt = client.prepare(conn, "SELECT ? AS a, ? AS b").unwrap();

        let set = BindSet::build(
            &BindParams::Row(vec![ParamValue::Integer(4), ParamValue::Null]),
            BindLayout::ColumnWise,
        )
        .unwrap();
        for (i, p) in set.params().enumerate() {
            assert!(client.bind_param(stmt, i as u32, &p));
        }
        assert!(client.execute(stmt));
        assert_eq!(client.num_cols(stmt), 2);
        assert_eq!(client.get_column_info(stmt, 1).unwrap().name, "b");
        assert!(client.fetch_next(stmt));
        let v = client.get_column(stmt, 0).unwrap();
        assert_eq!(v.data, 4i32.to_ne_bytes().to_vec());
        assert!(client.get_column(stmt, 1).unwrap().is_null);
        assert!(!client.fetch_next(stmt));
    }

    #[test]
    fn test_scripted_results_and_no_more_results() {
        let client = FakeClient::new();
        let conn = connected(&client);
        client.script(
            "CALL multi()",
            vec![FakeResult::Affected(3), FakeResult::rows(&["x"], vec![vec![FakeCell::int(1)]])],
        );
        let stmt = client.prepare(conn, "CALL multi()").unwrap();
        assert!(client.execute(stmt));
        assert_eq!(client.affected_rows(stmt), 3);
        assert!(client.get_next_result(stmt));
        assert_eq!(client.num_cols(stmt), 1);
        assert!(!client.get_next_result(stmt));
        assert_eq!(client.error(conn).code, NO_MORE_RESULTS);
    }

    #[test]
    fn test_connect_failure_sets_error() {
        let client = FakeClient::new();
        client.fail_connect(Some((-103, "Invalid user ID or password")));
        let conn = client.new_connection().unwrap();
        assert!(!client.connect(conn, "UID=x"));
        assert_eq!(client.error(conn).code, -103);
    }

    #[test]
    fn test_alias_names() {
        assert_eq!(alias_names("select ? as id, ? AS name"), vec!["id", "name"]);
        assert!(alias_names("select ?").is_empty());
    }

    #[test]
    fn test_overlap_detection() {
        let client = std::sync::Arc::new(FakeClient::new());
        let conn = connected(&client);
        client.set_call_delay(Duration::from_millis(100));

        let c2 = client.clone();
        let t = std::thread::spawn(move || {
            c2.commit(conn);
        });
        client.rollback(conn);
        t.join().unwrap();
        assert!(client.overlap_detected());
    }
}
