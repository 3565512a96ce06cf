use super::args::{resolve_callback_only, resolve_stmt_exec, Arg, Callback, Outcome};
use super::connection::{dispatch, fail};
use super::request::{prepare_binds, ExecRequest, RequestTarget};
use crate::async_bridge::{FnWork, WorkDispatcher};
use crate::engine::{ConnectionCore, StmtKey};
use crate::error::{DbError, Result};
use crate::protocol::param_value::BindParams;
use std::rc::Rc;
use std::sync::{Arc, Weak};

/// Prepared statement exposed to the scripting runtime.
///
/// Holds its connection weakly; once the connection is gone, disconnected
/// or the statement dropped, every operation fails with `InvalidObject`.
pub struct Statement {
    conn: Weak<ConnectionCore>,
    key: StmtKey,
    dispatcher: Rc<WorkDispatcher>,
}

impl Statement {
    pub(crate) fn new(conn: Weak<ConnectionCore>, key: StmtKey, dispatcher: Rc<WorkDispatcher>) -> Self {
        Self {
            conn,
            key,
            dispatcher,
        }
    }

    pub fn key(&self) -> StmtKey {
        self.key
    }

    fn connection(&self) -> Option<Arc<ConnectionCore>> {
        self.conn.upgrade()
    }

    pub fn exec(&self, args: Vec<Arg>) -> Result<Outcome> {
        let (params, callback) = resolve_stmt_exec(args)?;
        match params.into_bind_params() {
            Ok(params) => self.exec_with(params, callback),
            Err(err) => fail(callback, err),
        }
    }

    pub fn exec_with(&self, params: BindParams, callback: Option<Callback>) -> Result<Outcome> {
        let Some(core) = self.connection() else {
            return fail(callback, DbError::InvalidObject);
        };
        let binds = match prepare_binds(&core, &params) {
            Ok(binds) => binds,
            Err(err) => return fail(callback, err),
        };
        let request = ExecRequest {
            core,
            target: RequestTarget::Statement(self.key),
            binds,
        };
        dispatch(
            &self.dispatcher,
            request,
            |fetched| fetched.into_result().map(Outcome::Result),
            callback,
        )
    }

    /// Moves to the statement's next result set and delivers it like
    /// `exec` does. No further result set delivers an empty result.
    pub fn get_more_results(&self, args: Vec<Arg>) -> Result<Outcome> {
        let callback = resolve_callback_only(args)?;
        self.more_results_with(callback)
    }

    pub fn more_results_with(&self, callback: Option<Callback>) -> Result<Outcome> {
        let Some(core) = self.connection() else {
            return fail(callback, DbError::InvalidObject);
        };
        let key = self.key;
        dispatch(
            &self.dispatcher,
            FnWork::new("more_results", move || core.more_results(key)),
            |fetched| fetched.into_result().map(Outcome::Result),
            callback,
        )
    }

    pub fn drop_statement(&self, args: Vec<Arg>) -> Result<Outcome> {
        let callback = resolve_callback_only(args)?;
        self.drop_with(callback)
    }

    /// Frees the native statement. Dropping twice, or after the connection
    /// went away, succeeds without doing anything.
    pub fn drop_with(&self, callback: Option<Callback>) -> Result<Outcome> {
        let Some(core) = self.connection() else {
            return dispatch(
                &self.dispatcher,
                FnWork::new("drop", || Ok(())),
                |_| Ok(Outcome::Done),
                callback,
            );
        };
        let key = self.key;
        dispatch(
            &self.dispatcher,
            FnWork::new("drop", move || core.drop_statement(key)),
            |_| Ok(Outcome::Done),
            callback,
        )
    }
}

impl Drop for Statement {
    fn drop(&mut self) {
        if let Some(core) = self.connection() {
            core.release_statement_on_drop(self.key);
        }
    }
}
