use super::args::{
    resolve_base, resolve_callback_only, resolve_connect, resolve_exec, resolve_prepare, Arg,
    Callback, ConnectSpec, Outcome,
};
use super::request::{prepare_binds, ExecRequest, RequestTarget};
use super::statement::Statement;
use crate::async_bridge::{FnWork, Work, WorkDispatcher};
use crate::driver::DriverContext;
use crate::engine::{compose_connection_string, ConnectTarget, ConnectionCore, ConnectionString};
use crate::error::{DbError, Result};
use crate::native::ExternalHandle;
use crate::protocol::param_value::BindParams;
use std::rc::Rc;
use std::sync::Arc;

/// Runs `work` through the dispatcher, returning its outcome inline when
/// there is no callback.
pub(crate) fn dispatch<W, A>(
    dispatcher: &WorkDispatcher,
    work: W,
    after: A,
    callback: Option<Callback>,
) -> Result<Outcome>
where
    W: Work,
    A: FnOnce(W::Output) -> Result<Outcome> + 'static,
{
    let callback = callback.map(|cb| move |result: Result<Outcome>| cb.invoke(result));
    Ok(dispatcher
        .submit(work, after, callback)?
        .unwrap_or(Outcome::Done))
}

/// Reports a failure found before any work was scheduled: raised when
/// synchronous, handed to the callback otherwise.
pub(crate) fn fail(callback: Option<Callback>, err: DbError) -> Result<Outcome> {
    match callback {
        None => Err(err),
        Some(cb) => {
            cb.invoke(Err(err));
            Ok(Outcome::Done)
        }
    }
}

fn done<T>(_: T) -> Result<Outcome> {
    Ok(Outcome::Done)
}

/// Connection object exposed to the scripting runtime.
///
/// Every method that takes a trailing callback runs synchronously without
/// one and returns its value; with one it returns [`Outcome::Done`] and
/// delivers the value through the callback. Argument shape errors are
/// always returned directly.
pub struct Connection {
    core: Arc<ConnectionCore>,
    base: Option<ConnectionString>,
    dispatcher: Rc<WorkDispatcher>,
}

/// Same as [`Connection::new`].
pub fn create_connection(args: Vec<Arg>) -> Result<Connection> {
    Connection::new(args)
}

impl Connection {
    /// New unconnected connection on the process-wide driver. `args` may
    /// hold one connection string fragment or options object, used as the
    /// base of every later `connect`.
    pub fn new(args: Vec<Arg>) -> Result<Self> {
        Self::with_driver(DriverContext::global(), args)
    }

    pub fn with_driver(driver: Arc<DriverContext>, args: Vec<Arg>) -> Result<Self> {
        let base = resolve_base(args)?.map(ConnectionString::new);
        let dispatcher = WorkDispatcher::current(driver.config().worker_threads);
        Ok(Self {
            core: ConnectionCore::new(driver),
            base,
            dispatcher,
        })
    }

    pub fn core(&self) -> &Arc<ConnectionCore> {
        &self.core
    }

    pub fn dispatcher(&self) -> &Rc<WorkDispatcher> {
        &self.dispatcher
    }

    pub fn connect(&self, args: Vec<Arg>) -> Result<Outcome> {
        let (spec, callback) = resolve_connect(args)?;
        self.connect_with(spec, callback)
    }

    pub fn connect_with(&self, spec: ConnectSpec, callback: Option<Callback>) -> Result<Outcome> {
        let base = self.base.as_ref().map_or("", |b| b.as_str());
        let target = match spec {
            ConnectSpec::Base => {
                ConnectTarget::ConnectionString(compose_connection_string(base, None))
            }
            ConnectSpec::Fragment(fragment) => ConnectTarget::ConnectionString(
                compose_connection_string(base, Some(&fragment)),
            ),
            ConnectSpec::External(handle) => ConnectTarget::External(ExternalHandle(handle)),
        };
        let core = self.core.clone();
        dispatch(
            &self.dispatcher,
            FnWork::new("connect", move || core.connect(target)),
            done,
            callback,
        )
    }

    pub fn disconnect(&self, args: Vec<Arg>) -> Result<Outcome> {
        let callback = resolve_callback_only(args)?;
        self.disconnect_with(callback)
    }

    pub fn disconnect_with(&self, callback: Option<Callback>) -> Result<Outcome> {
        let core = self.core.clone();
        dispatch(
            &self.dispatcher,
            FnWork::new("disconnect", move || core.disconnect()),
            done,
            callback,
        )
    }

    /// Alias of [`disconnect`](Self::disconnect).
    pub fn close(&self, args: Vec<Arg>) -> Result<Outcome> {
        self.disconnect(args)
    }

    pub fn exec(&self, args: Vec<Arg>) -> Result<Outcome> {
        let (sql, params, callback) = resolve_exec(args)?;
        match params.into_bind_params() {
            Ok(params) => self.exec_with(sql, params, callback),
            Err(err) => fail(callback, err),
        }
    }

    pub fn exec_with(
        &self,
        sql: String,
        params: BindParams,
        callback: Option<Callback>,
    ) -> Result<Outcome> {
        let binds = match prepare_binds(&self.core, &params) {
            Ok(binds) => binds,
            Err(err) => return fail(callback, err),
        };
        let request = ExecRequest {
            core: self.core.clone(),
            target: RequestTarget::Sql(sql),
            binds,
        };
        dispatch(
            &self.dispatcher,
            request,
            |fetched| fetched.into_result().map(Outcome::Result),
            callback,
        )
    }

    pub fn prepare(&self, args: Vec<Arg>) -> Result<Outcome> {
        let (sql, callback) = resolve_prepare(args)?;
        self.prepare_with(sql, callback)
    }

    pub fn prepare_with(&self, sql: String, callback: Option<Callback>) -> Result<Outcome> {
        let core = self.core.clone();
        let work = FnWork::new("prepare", move || {
            let key = core.register_statement()?;
            // no Statement object reaches the caller on failure
            core.prepare_into(key, &sql).inspect_err(|_| {
                let _ = core.drop_statement(key);
            })?;
            Ok(key)
        });
        let weak = Arc::downgrade(&self.core);
        let dispatcher = self.dispatcher.clone();
        dispatch(
            &self.dispatcher,
            work,
            move |key| Ok(Outcome::Statement(Statement::new(weak, key, dispatcher))),
            callback,
        )
    }

    pub fn commit(&self, args: Vec<Arg>) -> Result<Outcome> {
        let callback = resolve_callback_only(args)?;
        let core = self.core.clone();
        dispatch(
            &self.dispatcher,
            FnWork::new("commit", move || core.commit()),
            done,
            callback,
        )
    }

    pub fn rollback(&self, args: Vec<Arg>) -> Result<Outcome> {
        let callback = resolve_callback_only(args)?;
        let core = self.core.clone();
        dispatch(
            &self.dispatcher,
            FnWork::new("rollback", move || core.rollback()),
            done,
            callback,
        )
    }

    pub fn connected(&self) -> bool {
        self.core.connected()
    }

    /// Aborts the request currently running on this connection, if any.
    pub fn cancel(&self) -> Result<()> {
        self.core.cancel()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::native::fake::FakeClient;
    use crate::protocol::result::{QueryResult, Value};
    use std::cell::RefCell;

    fn setup() -> (Arc<FakeClient>, Arc<DriverContext>) {
        let fake = Arc::new(FakeClient::new());
        let ctx = DriverContext::with_client(EngineConfig::default(), fake.clone());
        (fake, ctx)
    }

    type Seen = Rc<RefCell<Vec<(Option<DbError>, Outcome)>>>;

    fn recorder() -> (Seen, impl Fn() -> Arg) {
        let seen: Seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        let make = move || {
            let s = s.clone();
            Arg::callback(move |err, out| s.borrow_mut().push((err, out)))
        };
        (seen, make)
    }

    #[test]
    fn test_sync_connect_exec_disconnect() {
        let (fake, ctx) = setup();
        let conn = Connection::with_driver(ctx, vec![Arg::string("UID=dba;PWD=sql")]).unwrap();
        assert!(!conn.connected());

        conn.connect(vec![Arg::string("ENG=demo")]).unwrap();
        assert!(conn.connected());
        assert_eq!(
            fake.last_connection_string().as_deref(),
            Some("UID=dba;PWD=sql;ENG=demo;CHARSET='UTF-8'")
        );

        let out = conn
            .exec(vec![
                Arg::string("SELECT ? AS n"),
                Arg::Array(vec![Arg::Number(5.0)]),
            ])
            .unwrap();
        let rows = out.into_result().unwrap();
        assert_eq!(rows.rows().unwrap()[0].get("n"), Some(&Value::Integer(5)));

        conn.disconnect(vec![]).unwrap();
        assert!(!conn.connected());
    }

    #[test]
    fn test_async_connect_twice() {
        let (_fake, ctx) = setup();
        let conn = Connection::with_driver(ctx, vec![]).unwrap();
        let (seen, cb) = recorder();

        conn.connect(vec![cb()]).unwrap();
        conn.connect(vec![cb()]).unwrap();
        conn.dispatcher().wait_idle();

        let seen = seen.borrow();
        assert_eq!(seen.len(), 2);
        let errors: Vec<_> = seen.iter().filter_map(|(e, _)| e.clone()).collect();
        assert_eq!(errors, vec![DbError::AlreadyConnected]);
    }

    #[test]
    fn test_sync_connect_twice() {
        let (_fake, ctx) = setup();
        let conn = Connection::with_driver(ctx, vec![]).unwrap();
        conn.connect(vec![]).unwrap();
        assert_eq!(
            conn.connect(vec![]).unwrap_err(),
            DbError::AlreadyConnected
        );
    }

    #[test]
    fn test_argument_errors_are_synchronous() {
        let (_fake, ctx) = setup();
        let conn = Connection::with_driver(ctx.clone(), vec![]).unwrap();
        let (seen, cb) = recorder();
        assert_eq!(
            conn.exec(vec![Arg::Number(1.0), cb()]).unwrap_err(),
            DbError::InvalidArguments
        );
        assert_eq!(
            conn.commit(vec![Arg::Null, cb()]).unwrap_err(),
            DbError::InvalidArguments
        );
        assert!(seen.borrow().is_empty());
        assert!(Connection::with_driver(ctx, vec![Arg::Bool(true)]).is_err());
    }

    #[test]
    fn test_not_connected_errors() {
        let (_fake, ctx) = setup();
        let conn = Connection::with_driver(ctx, vec![]).unwrap();
        for result in [
            conn.exec(vec![Arg::string("SELECT 1")]),
            conn.prepare(vec![Arg::string("SELECT 1")]),
            conn.commit(vec![]),
            conn.rollback(vec![]),
            conn.disconnect(vec![]),
        ] {
            assert_eq!(result.unwrap_err(), DbError::NotConnected);
        }
    }

    #[test]
    fn test_bind_conversion_failure_goes_to_callback() {
        let (_fake, ctx) = setup();
        let conn = Connection::with_driver(ctx, vec![]).unwrap();
        conn.connect(vec![]).unwrap();
        let (seen, cb) = recorder();
        conn.exec(vec![
            Arg::string("SELECT ?"),
            Arg::Array(vec![Arg::Bool(true)]),
            cb(),
        ])
        .unwrap();
        assert_eq!(
            seen.borrow()[0].0,
            Some(DbError::BindingParametersFailed)
        );
    }

    #[test]
    fn test_sync_and_async_agree() {
        let (fake, ctx) = setup();
        fake.script("UPDATE t SET x = 1", vec![crate::native::fake::FakeResult::Affected(2)]);
        let conn = Connection::with_driver(ctx, vec![]).unwrap();
        conn.connect(vec![]).unwrap();

        let sync = conn
            .exec(vec![Arg::string("UPDATE t SET x = 1")])
            .unwrap()
            .into_result();

        let (seen, cb) = recorder();
        conn.exec(vec![Arg::string("UPDATE t SET x = 1"), cb()]).unwrap();
        conn.dispatcher().wait_idle();
        let (err, out) = seen.borrow_mut().remove(0);
        assert!(err.is_none());
        assert_eq!(out.into_result(), sync);
        assert_eq!(sync, Some(QueryResult::RowCount(2)));
    }

    #[test]
    fn test_prepare_returns_statement() {
        let (_fake, ctx) = setup();
        let conn = Connection::with_driver(ctx, vec![]).unwrap();
        conn.connect(vec![]).unwrap();
        let stmt = conn
            .prepare(vec![Arg::string("SELECT ? AS v")])
            .unwrap()
            .into_statement()
            .unwrap();
        let out = stmt
            .exec(vec![Arg::Array(vec![Arg::string("x")])])
            .unwrap()
            .into_result()
            .unwrap();
        assert_eq!(
            out.rows().unwrap()[0].get("v"),
            Some(&Value::String("x".to_string()))
        );
    }

    #[test]
    fn test_failed_prepare_leaves_no_statement_behind() {
        let (fake, ctx) = setup();
        fake.fail_prepare("SELEC 1", -131, "Syntax error near 'SELEC'");
        let conn = Connection::with_driver(ctx, vec![]).unwrap();
        conn.connect(vec![]).unwrap();

        for _ in 0..3 {
            let err = conn.prepare(vec![Arg::string("SELEC 1")]).unwrap_err();
            assert_eq!(err.code(), -131);
        }
        let (seen, cb) = recorder();
        conn.prepare(vec![Arg::string("SELEC 1"), cb()]).unwrap();
        conn.dispatcher().wait_idle();
        assert_eq!(seen.borrow()[0].0.as_ref().map(DbError::code), Some(-131));

        assert_eq!(conn.core().statement_count().unwrap(), 0);
        assert_eq!(fake.live_statements(), 0);
    }

    #[test]
    fn test_external_connect_by_number() {
        let (fake, ctx) = setup();
        let conn = Connection::with_driver(ctx, vec![]).unwrap();
        conn.connect(vec![Arg::Number(8192.0)]).unwrap();
        assert!(conn.connected());
        assert!(conn.core().is_external().unwrap());
        assert!(fake.last_connection_string().is_none());
    }

    #[test]
    fn test_close_is_disconnect() {
        let (_fake, ctx) = setup();
        let conn = Connection::with_driver(ctx.clone(), vec![]).unwrap();
        conn.connect(vec![]).unwrap();
        conn.close(vec![]).unwrap();
        assert!(!conn.connected());
        assert_eq!(ctx.open_connections(), 0);
    }
}
