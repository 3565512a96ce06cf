use crate::config::EngineConfig;
use crate::error::{DbError, Result};
use crate::native::{default_loader, ClientLoader, NativeClient, StaticLoader};
use crate::versioning::ApiVersion;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

static GLOBAL: OnceLock<Arc<DriverContext>> = OnceLock::new();

struct DriverState {
    client: Option<Arc<dyn NativeClient>>,
    open_connections: usize,
    max_api_ver: ApiVersion,
}

/// Process-wide native client state: the loaded client and the count of
/// open connections keeping it initialised.
///
/// The client is loaded and initialised when a connect finds none, and
/// finalised when the last open connection goes away. Whenever both are
/// needed, the driver lock is taken before any connection lock.
pub struct DriverContext {
    config: EngineConfig,
    loader: Arc<dyn ClientLoader>,
    state: Mutex<DriverState>,
}

/// Exclusive access to the driver state for the duration of a connect,
/// disconnect or connection teardown.
pub struct DriverGuard<'a> {
    ctx: &'a DriverContext,
    state: MutexGuard<'a, DriverState>,
}

impl DriverContext {
    pub fn new(config: EngineConfig, loader: Arc<dyn ClientLoader>) -> Arc<Self> {
        Arc::new(Self {
            config,
            loader,
            state: Mutex::new(DriverState {
                client: None,
                open_connections: 0,
                max_api_ver: ApiVersion(0),
            }),
        })
    }

    /// Context that always initialises `client`.
    pub fn with_client(config: EngineConfig, client: Arc<dyn NativeClient>) -> Arc<Self> {
        Self::new(config, Arc::new(StaticLoader::new(client)))
    }

    /// Shared context configured from the environment, loading the
    /// platform client library.
    pub fn global() -> Arc<DriverContext> {
        GLOBAL
            .get_or_init(|| Self::new(EngineConfig::from_env(), default_loader()))
            .clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn lock(&self) -> Result<DriverGuard<'_>> {
        let state = self.state.lock()?;
        Ok(DriverGuard { ctx: self, state })
    }

    /// Guard for teardown paths that must proceed even after a panic
    /// poisoned the lock.
    pub(crate) fn lock_for_teardown(&self) -> DriverGuard<'_> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        DriverGuard { ctx: self, state }
    }

    pub fn open_connections(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.open_connections)
            .unwrap_or(0)
    }

    pub fn is_initialized(&self) -> bool {
        self.state
            .lock()
            .map(|s| s.client.is_some())
            .unwrap_or(false)
    }

    /// Version negotiated by the current initialisation, if any.
    pub fn max_api_version(&self) -> Option<ApiVersion> {
        self.state
            .lock()
            .ok()
            .filter(|s| s.client.is_some())
            .map(|s| s.max_api_ver)
    }
}

impl DriverGuard<'_> {
    /// Returns the initialised client, loading and initialising it first
    /// when no connection holds it.
    pub fn acquire_client(&mut self) -> Result<(Arc<dyn NativeClient>, ApiVersion)> {
        if let Some(client) = &self.state.client {
            return Ok((client.clone(), self.state.max_api_ver));
        }

        let ctx = self.ctx;
        let config = &ctx.config;
        let client = ctx.loader.load(config)?;
        let version = match client.init(&config.app_name, config.api_version) {
            Ok(v) => v,
            Err(max) if max.is_usable() => {
                log::debug!(
                    "client refused {}; retrying init at {}",
                    config.api_version,
                    max
                );
                client
                    .init(&config.app_name, max)
                    .map_err(|_| DbError::InitializationFailed)?
            }
            Err(max) => {
                log::warn!("client supports only {}; {} required", max, ApiVersion::MINIMUM);
                return Err(DbError::InitializationFailed);
            }
        };

        log::debug!("native client initialised at {}", version);
        self.state.client = Some(client.clone());
        self.state.max_api_ver = version;
        Ok((client, version))
    }

    pub fn connection_opened(&mut self) {
        self.state.open_connections += 1;
    }

    /// Counts a connection as closed, finalising the client when it was
    /// the last one.
    pub fn connection_closed(&mut self) {
        self.state.open_connections = self.state.open_connections.saturating_sub(1);
        self.release_if_idle();
    }

    /// Finalises the client if no connection is open. Used after a failed
    /// connect so a refused first connection does not leave it loaded.
    pub fn release_if_idle(&mut self) {
        if self.state.open_connections > 0 {
            return;
        }
        if let Some(client) = self.state.client.take() {
            client.fini();
            self.state.max_api_ver = ApiVersion(0);
            log::debug!("native client finalised");
        }
    }

    pub fn open_connections(&self) -> usize {
        self.state.open_connections
    }
}
