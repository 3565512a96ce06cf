use crate::async_bridge::Work;
use crate::engine::{ConnectionCore, ExecTarget, StmtKey};
use crate::error::{DbError, Result};
use crate::protocol::bind::BindSet;
use crate::protocol::fetch::FetchedResult;
use crate::protocol::param_value::BindParams;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub(crate) enum RequestTarget {
    Sql(String),
    Statement(StmtKey),
}

/// Plain-data execute request handed to the worker pool. Owns the bind
/// scratch from the moment it is built until the native execute returns.
pub(crate) struct ExecRequest {
    pub(crate) core: Arc<ConnectionCore>,
    pub(crate) target: RequestTarget,
    pub(crate) binds: BindSet,
}

/// Builds the bind scratch on the calling thread, so a malformed batch or
/// a wide bind the client cannot take fails before anything is queued.
///
/// An unconnected core is left to the request itself, which reports it
/// under the connection lock.
pub(crate) fn prepare_binds(core: &ConnectionCore, params: &BindParams) -> Result<BindSet> {
    let binds = BindSet::build(params, core.driver().config().bind_layout)?;
    if binds.is_wide() && core.connected() && !core.negotiated_api_version().supports_wide_binding()
    {
        return Err(DbError::UnsupportedWideStatement);
    }
    Ok(binds)
}

impl Work for ExecRequest {
    type Output = FetchedResult;

    fn name(&self) -> &'static str {
        match self.target {
            RequestTarget::Sql(_) => "exec",
            RequestTarget::Statement(_) => "stmt_exec",
        }
    }

    fn run(self) -> Result<FetchedResult> {
        let target = match &self.target {
            RequestTarget::Sql(sql) => ExecTarget::Sql(sql),
            RequestTarget::Statement(key) => ExecTarget::Statement(*key),
        };
        self.core.execute(target, self.binds)
    }
}
