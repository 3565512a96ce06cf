use super::statement::{StatementArena, StmtKey};
use crate::driver::{DriverContext, DriverGuard};
use crate::error::{DbError, Result};
use crate::native::{ConnHandle, ExternalHandle, NativeClient};
use crate::observability::{global_metrics, StructuredLogger};
use crate::protocol::fetch::{fetch_result_set, FetchedResult};
use crate::versioning::ApiVersion;
use log::Level;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use zeroize::ZeroizeOnDrop;

const CHARSET_SUFFIX: &str = "CHARSET='UTF-8'";

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Connection string handed to the native connect. Wiped when dropped.
#[derive(ZeroizeOnDrop)]
pub struct ConnectionString(String);

impl ConnectionString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ConnectionString")
            .field(&crate::observability::redact_connection_string(&self.0))
            .finish()
    }
}

/// Builds `base[;fragment];CHARSET='UTF-8'`.
pub fn compose_connection_string(base: &str, fragment: Option<&str>) -> ConnectionString {
    let mut out = String::with_capacity(base.len() + CHARSET_SUFFIX.len() + 2);
    out.push_str(base);
    if let Some(fragment) = fragment {
        out.push(';');
        out.push_str(fragment);
    }
    out.push(';');
    out.push_str(CHARSET_SUFFIX);
    ConnectionString(out)
}

#[derive(Debug)]
pub enum ConnectTarget {
    ConnectionString(ConnectionString),
    /// Caller-owned native connection wrapped without a connect call.
    External(ExternalHandle),
}

pub(crate) struct ConnState {
    pub(crate) handle: Option<ConnHandle>,
    pub(crate) client: Option<Arc<dyn NativeClient>>,
    pub(crate) external: bool,
    pub(crate) max_api_ver: ApiVersion,
    pub(crate) statements: StatementArena,
}

impl ConnState {
    /// Client and handle of a live connection.
    pub(crate) fn live(&self) -> Option<(Arc<dyn NativeClient>, ConnHandle)> {
        match (&self.client, self.handle) {
            (Some(client), Some(handle)) => Some((client.clone(), handle)),
            _ => None,
        }
    }
}

/// One logical connection: the native handle, the statements prepared on
/// it and the lock serialising every native call that uses the handle.
pub struct ConnectionCore {
    id: u64,
    driver: Arc<DriverContext>,
    state: Mutex<ConnState>,
    connected: AtomicBool,
    api_version: AtomicU32,
    cancel_target: Mutex<Option<(Arc<dyn NativeClient>, ConnHandle)>>,
    pub(crate) logger: StructuredLogger,
}

impl ConnectionCore {
    pub fn new(driver: Arc<DriverContext>) -> Arc<Self> {
        let logger = StructuredLogger::new(driver.config().logging_enabled);
        Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            driver,
            state: Mutex::new(ConnState {
                handle: None,
                client: None,
                external: false,
                max_api_ver: ApiVersion(0),
                statements: StatementArena::new(),
            }),
            connected: AtomicBool::new(false),
            api_version: AtomicU32::new(0),
            cancel_target: Mutex::new(None),
            logger,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn driver(&self) -> &Arc<DriverContext> {
        &self.driver
    }

    pub(crate) fn lock_state(&self) -> Result<MutexGuard<'_, ConnState>> {
        Ok(self.state.lock()?)
    }

    /// Lock-free view of whether a native handle is held.
    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn max_api_version(&self) -> Result<ApiVersion> {
        Ok(self.lock_state()?.max_api_ver)
    }

    /// Protocol version copied at connect, readable while a request holds
    /// the connection lock. Zero when not connected.
    pub fn negotiated_api_version(&self) -> ApiVersion {
        ApiVersion(self.api_version.load(Ordering::Acquire))
    }

    pub fn is_external(&self) -> Result<bool> {
        Ok(self.lock_state()?.external)
    }

    pub fn statement_count(&self) -> Result<usize> {
        Ok(self.lock_state()?.statements.len())
    }

    pub fn connect(&self, target: ConnectTarget) -> Result<()> {
        let mut driver = self.driver.lock()?;
        let mut state = self.lock_state()?;

        if state.handle.is_some() {
            return Err(DbError::AlreadyConnected);
        }

        let (client, max_api_ver) = driver.acquire_client()?;
        let (handle, external) = match &target {
            ConnectTarget::ConnectionString(conn_str) => {
                let Some(handle) = client.new_connection() else {
                    driver.release_if_idle();
                    return Err(DbError::GeneralError);
                };
                if !client.connect(handle, conn_str.as_str()) {
                    let err = client.error(handle);
                    client.free_connection(handle);
                    driver.release_if_idle();
                    self.logger
                        .log_connection(Level::Warn, conn_str.as_str(), "refused");
                    return Err(err.into());
                }
                self.logger
                    .log_connection(Level::Debug, conn_str.as_str(), "established");
                (handle, false)
            }
            ConnectTarget::External(external) => {
                let Some(handle) = client.make_connection(*external) else {
                    driver.release_if_idle();
                    return Err(DbError::GeneralError);
                };
                log::debug!("connection {} wraps external handle {:#x}", self.id, external.0);
                (handle, true)
            }
        };

        state.handle = Some(handle);
        state.client = Some(client.clone());
        state.external = external;
        state.max_api_ver = max_api_ver;
        self.api_version.store(max_api_ver.0, Ordering::Release);
        *self.cancel_target.lock()? = Some((client, handle));
        self.connected.store(true, Ordering::Release);
        driver.connection_opened();
        global_metrics().record_connection_opened();
        Ok(())
    }

    pub fn disconnect(&self) -> Result<()> {
        let mut driver = self.driver.lock()?;
        let mut state = self.lock_state()?;
        if state.handle.is_none() {
            return Err(DbError::NotConnected);
        }
        self.teardown(&mut driver, &mut state);
        Ok(())
    }

    /// Frees every statement, then the native connection, and releases the
    /// driver reference. Caller holds both locks.
    fn teardown(&self, driver: &mut DriverGuard<'_>, state: &mut ConnState) {
        let Some(handle) = state.handle.take() else {
            return;
        };
        self.connected.store(false, Ordering::Release);
        self.api_version.store(0, Ordering::Release);
        match self.cancel_target.lock() {
            Ok(mut target) => *target = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }

        let stmts = state.statements.drain();
        if let Some(client) = state.client.take() {
            for stmt in stmts {
                client.free_stmt(stmt);
            }
            if !state.external && !client.disconnect(handle) {
                log::warn!("connection {}: native disconnect reported failure", self.id);
            }
            client.free_connection(handle);
        }
        state.external = false;
        state.max_api_ver = ApiVersion(0);

        driver.connection_closed();
        global_metrics().record_connection_closed();
        log::debug!(
            "connection {} closed; {} still open",
            self.id,
            driver.open_connections()
        );
    }

    pub fn commit(&self) -> Result<()> {
        self.transact(|client, handle| client.commit(handle))
    }

    pub fn rollback(&self) -> Result<()> {
        self.transact(|client, handle| client.rollback(handle))
    }

    fn transact(&self, op: impl FnOnce(&dyn NativeClient, ConnHandle) -> bool) -> Result<()> {
        let state = self.lock_state()?;
        let (client, handle) = state.live().ok_or(DbError::NotConnected)?;
        if op(client.as_ref(), handle) {
            Ok(())
        } else {
            Err(client.error(handle).into())
        }
    }

    /// Asks the client to abort whatever request is running on this
    /// connection. Does not wait for the connection lock.
    pub fn cancel(&self) -> Result<()> {
        let target = self.cancel_target.lock()?;
        if let Some((client, handle)) = target.as_ref() {
            log::debug!("connection {}: cancel requested", self.id);
            client.cancel(*handle);
        }
        Ok(())
    }

    /// Registers a statement ahead of its native prepare so a concurrent
    /// disconnect sees it.
    pub fn register_statement(&self) -> Result<StmtKey> {
        let mut state = self.lock_state()?;
        if state.handle.is_none() {
            return Err(DbError::NotConnected);
        }
        Ok(state.statements.insert())
    }

    /// Prepares `sql` for a registered statement. On failure the statement
    /// stays registered without a native handle.
    pub fn prepare_into(&self, key: StmtKey, sql: &str) -> Result<()> {
        let mut state = self.lock_state()?;
        if !state.statements.contains(key) {
            return Err(DbError::InvalidObject);
        }
        let (client, handle) = state.live().ok_or(DbError::NotConnected)?;
        match client.prepare(handle, sql) {
            Some(stmt) => {
                state.statements.set_handle(key, Some(stmt));
                Ok(())
            }
            None => Err(client.error(handle).into()),
        }
    }

    /// Advances to the next result set and fetches it. Running out of
    /// result sets delivers an empty result rather than an error.
    pub fn more_results(&self, key: StmtKey) -> Result<FetchedResult> {
        let state = self.lock_state()?;
        let stmt = state
            .statements
            .get(key)
            .flatten()
            .ok_or(DbError::InvalidObject)?;
        let (client, handle) = state.live().ok_or(DbError::InvalidObject)?;
        if client.get_next_result(stmt) {
            return fetch_result_set(client.as_ref(), handle, stmt);
        }
        let err = client.error(handle);
        if err.code == NO_MORE_RESULTS {
            Ok(FetchedResult::with_columns(Vec::new()))
        } else {
            Err(err.into())
        }
    }

    /// Frees the statement's native handle and forgets the key. A key that
    /// is already stale is left alone.
    pub fn drop_statement(&self, key: StmtKey) -> Result<()> {
        let mut state = self.lock_state()?;
        self.release_statement(&mut state, key);
        Ok(())
    }

    pub(crate) fn release_statement(&self, state: &mut ConnState, key: StmtKey) {
        if let Some(Some(stmt)) = state.statements.remove(key) {
            if let Some(client) = &state.client {
                client.free_stmt(stmt);
            }
        }
    }

    /// Statement teardown path: proceeds even if a panic poisoned the lock.
    pub(crate) fn release_statement_on_drop(&self, key: StmtKey) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.release_statement(&mut state, key);
    }
}

/// Native code reported by `get_next_result` once every result set has
/// been consumed ("procedure has completed").
pub const NO_MORE_RESULTS: i32 = 105;

impl Drop for ConnectionCore {
    fn drop(&mut self) {
        let mut driver = self.driver.lock_for_teardown();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.handle.is_some() {
            log::debug!("connection {} dropped while connected", self.id);
            self.teardown(&mut driver, &mut state);
        }
    }
}
