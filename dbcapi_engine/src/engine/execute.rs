use super::connection::ConnectionCore;
use super::statement::StmtKey;
use crate::error::{DbError, Result};
use crate::native::{ConnHandle, NativeClient, StmtHandle};
use crate::observability::global_metrics;
use crate::protocol::bind::{BindSet, BoundParam};
use crate::protocol::fetch::{fetch_result_set, FetchedResult};
use crate::protocol::types::DataType;
use crate::versioning::ApiVersion;
use log::Level;
use std::collections::HashMap;

/// What an execute request runs against.
#[derive(Clone, Copy, Debug)]
pub enum ExecTarget<'a> {
    /// Ad hoc SQL, prepared and freed within the request.
    Sql(&'a str),
    /// A statement previously prepared on the connection.
    Statement(StmtKey),
}

/// Slot type the client ends up binding: the caller's type whenever a
/// value is present, otherwise whatever the statement described.
fn overlay(described: DataType, param: BoundParam<'_>) -> BoundParam<'_> {
    if param.has_values() || described == DataType::Invalid {
        param
    } else {
        param.with_type(described)
    }
}

fn check_wide(binds: &BindSet, version: ApiVersion) -> Result<()> {
    if binds.is_wide() && !version.supports_wide_binding() {
        return Err(DbError::UnsupportedWideStatement);
    }
    Ok(())
}

/// Reset, bind, execute and fetch on a prepared statement. The bind
/// scratch is released as soon as the native execute returns.
///
/// Caller holds the connection lock.
pub(crate) fn run_prepared(
    client: &dyn NativeClient,
    conn: ConnHandle,
    stmt: StmtHandle,
    binds: BindSet,
) -> Result<FetchedResult> {
    if !client.reset(stmt) {
        return Err(client.error(conn).into());
    }

    for (index, param) in binds.params().enumerate() {
        let index = index as u32;
        let described = client
            .describe_bind_param(stmt, index)
            .ok_or_else(|| DbError::from(client.error(conn)))?;
        let param = overlay(described.data_type, param);
        if !client.bind_param(stmt, index, &param) {
            return Err(client.error(conn).into());
        }
    }

    if binds.is_wide() && !client.set_batch_size(stmt, binds.num_rows() as u32) {
        return Err(DbError::UnsupportedWideStatement);
    }

    let executed = client.execute(stmt);
    drop(binds);
    if !executed {
        return Err(client.error(conn).into());
    }

    fetch_result_set(client, conn, stmt)
}

impl ConnectionCore {
    /// Runs one execute request under the connection lock.
    pub fn execute(&self, target: ExecTarget<'_>, binds: BindSet) -> Result<FetchedResult> {
        let rows = binds.num_rows();
        let params = binds.len();
        let result = {
            let state = self.lock_state()?;
            match target {
                ExecTarget::Sql(sql) => {
                    let (client, conn) = state.live().ok_or(DbError::NotConnected)?;
                    check_wide(&binds, state.max_api_ver)?;
                    let stmt = client
                        .prepare(conn, sql)
                        .ok_or_else(|| DbError::from(client.error(conn)))?;
                    let result = run_prepared(client.as_ref(), conn, stmt, binds);
                    client.free_stmt(stmt);
                    result
                }
                ExecTarget::Statement(key) => {
                    let stmt = state
                        .statements
                        .get(key)
                        .flatten()
                        .ok_or(DbError::InvalidObject)?;
                    let (client, conn) = state.live().ok_or(DbError::InvalidObject)?;
                    check_wide(&binds, state.max_api_ver)?;
                    run_prepared(client.as_ref(), conn, stmt, binds)
                }
            }
        };

        if self.logger.is_enabled() {
            let mut metadata = HashMap::new();
            metadata.insert("connection".to_string(), self.id().to_string());
            metadata.insert("params".to_string(), params.to_string());
            metadata.insert("batch".to_string(), rows.to_string());
            let sql = match target {
                ExecTarget::Sql(sql) => sql.to_string(),
                ExecTarget::Statement(key) => format!("<statement {}>", key.index()),
            };
            match &result {
                Ok(fetched) => {
                    metadata.insert("rows".to_string(), fetched.num_rows().to_string());
                    self.logger.log_statement(Level::Debug, &sql, &metadata);
                }
                Err(err) => {
                    metadata.insert("sql".to_string(), sql);
                    self.logger.log_error(err, &metadata);
                }
            }
        }

        if let Ok(fetched) = &result {
            global_metrics().record_rows(fetched.num_rows());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::driver::DriverContext;
    use crate::engine::connection::{compose_connection_string, ConnectTarget};
    use crate::native::fake::{FakeCell, FakeClient, FakeResult};
    use crate::protocol::bind::BindLayout;
    use crate::protocol::param_value::{BindParams, ParamValue};
    use crate::protocol::result::{QueryResult, Value};
    use std::sync::Arc;

    fn connected(fake: Arc<FakeClient>) -> Arc<ConnectionCore> {
        let ctx = DriverContext::with_client(EngineConfig::default(), fake);
        let core = ConnectionCore::new(ctx);
        core.connect(ConnectTarget::ConnectionString(compose_connection_string(
            "ENG=test", None,
        )))
        .unwrap();
        core
    }

    fn binds(params: BindParams) -> BindSet {
        BindSet::build(&params, BindLayout::ColumnWise).unwrap()
    }

    fn run(core: &ConnectionCore, sql: &str, params: BindParams) -> Result<QueryResult> {
        core.execute(ExecTarget::Sql(sql), binds(params))?.into_result()
    }

    #[test]
    fn test_single_row_echo_round_trip() {
        let fake = Arc::new(FakeClient::new());
        let core = connected(fake.clone());
        let result = run(
            &core,
            "SELECT ? AS a, ? AS b, ? AS c",
            BindParams::Row(vec![
                ParamValue::Integer(1),
                ParamValue::String("a\0bc".to_string()),
                ParamValue::Null,
            ]),
        )
        .unwrap();

        let rows = result.rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("a"), Some(&Value::Integer(1)));
        assert_eq!(rows[0].get("b"), Some(&Value::String("a\0bc".to_string())));
        assert_eq!(rows[0].get("c"), Some(&Value::Null));
        assert_eq!(fake.live_statements(), 0);
    }

    #[test]
    fn test_wide_echo_keeps_row_order() {
        let fake = Arc::new(FakeClient::new());
        let core = connected(fake.clone());
        let rows: Vec<Vec<ParamValue>> = [(1, "a"), (2, "b"), (3, "c")]
            .iter()
            .map(|(n, s)| vec![ParamValue::Integer(*n), ParamValue::String(s.to_string())])
            .collect();
        let result = run(&core, "INSERT INTO t VALUES (?, ?)", BindParams::Wide(rows)).unwrap();

        let rows = result.rows().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].get("c0"), Some(&Value::Number(3.0)));
        assert_eq!(rows[2].get("c1"), Some(&Value::String("c".to_string())));
        assert!(fake.calls().iter().any(|c| c == "set_batch_size"));
    }

    #[test]
    fn test_wide_needs_v4_client() {
        let fake = Arc::new(FakeClient::with_max_version(ApiVersion::V3));
        let core = connected(fake.clone());
        fake.clear_calls();
        let params = BindParams::Wide(vec![
            vec![ParamValue::Integer(1)],
            vec![ParamValue::Integer(2)],
        ]);
        assert_eq!(
            run(&core, "INSERT INTO t VALUES (?)", params),
            Err(DbError::UnsupportedWideStatement)
        );
        assert!(!fake.calls().iter().any(|c| c == "prepare"));
    }

    #[test]
    fn test_update_delivers_row_count() {
        let fake = Arc::new(FakeClient::new());
        fake.script("UPDATE t SET x = 1", vec![FakeResult::Affected(2)]);
        let core = connected(fake.clone());
        fake.clear_calls();
        let result = run(&core, "UPDATE t SET x = 1", BindParams::none()).unwrap();
        assert_eq!(result, QueryResult::RowCount(2));
        assert!(!fake.calls().iter().any(|c| c == "fetch_next"));
    }

    #[test]
    fn test_columns_without_rows_is_empty_array() {
        let fake = Arc::new(FakeClient::new());
        fake.script("SELECT a FROM t", vec![FakeResult::rows(&["a"], vec![])]);
        let core = connected(fake);
        let result = run(&core, "SELECT a FROM t", BindParams::none()).unwrap();
        assert_eq!(result, QueryResult::Rows(vec![]));
    }

    #[test]
    fn test_no_columns_no_rows_is_empty() {
        let fake = Arc::new(FakeClient::new());
        let core = connected(fake);
        let result = run(&core, "CREATE TABLE t (a INT)", BindParams::none()).unwrap();
        assert_eq!(result, QueryResult::Empty);
    }

    #[test]
    fn test_native_execute_error_frees_statement() {
        let fake = Arc::new(FakeClient::new());
        fake.script(
            "INSERT INTO t VALUES (1)",
            vec![FakeResult::error(-193, "Primary key for table 't' is not unique")],
        );
        let core = connected(fake.clone());
        let err = run(&core, "INSERT INTO t VALUES (1)", BindParams::none()).unwrap_err();
        assert_eq!(err.code(), -193);
        assert_eq!(fake.live_statements(), 0);
    }

    #[test]
    fn test_too_many_params_fails_describe() {
        let fake = Arc::new(FakeClient::new());
        let core = connected(fake);
        let err = run(
            &core,
            "SELECT 1",
            BindParams::Row(vec![ParamValue::Integer(1)]),
        )
        .unwrap_err();
        assert_eq!(err.code(), -110);
    }

    #[test]
    fn test_prepared_statement_reuse() {
        let fake = Arc::new(FakeClient::new());
        fake.script(
            "SELECT id FROM t",
            vec![FakeResult::rows(
                &["id"],
                vec![vec![FakeCell::int(1)], vec![FakeCell::int(2)]],
            )],
        );
        let core = connected(fake);
        let key = core.register_statement().unwrap();
        core.prepare_into(key, "SELECT id FROM t").unwrap();

        for _ in 0..2 {
            let fetched = core
                .execute(ExecTarget::Statement(key), binds(BindParams::none()))
                .unwrap();
            assert_eq!(fetched.num_rows(), 2);
        }
    }

    #[test]
    fn test_dropped_statement_is_invalid() {
        let fake = Arc::new(FakeClient::new());
        let core = connected(fake);
        let key = core.register_statement().unwrap();
        core.prepare_into(key, "SELECT 1").unwrap();
        core.drop_statement(key).unwrap();
        let result = core.execute(ExecTarget::Statement(key), binds(BindParams::none()));
        assert_eq!(result, Err(DbError::InvalidObject));
    }

    #[test]
    fn test_exec_when_disconnected() {
        let fake = Arc::new(FakeClient::new());
        let core = connected(fake);
        core.disconnect().unwrap();
        assert_eq!(
            run(&core, "SELECT 1", BindParams::none()),
            Err(DbError::NotConnected)
        );
    }

    #[test]
    fn test_overlay_prefers_caller_type_for_values() {
        let set = binds(BindParams::Row(vec![ParamValue::Integer(4), ParamValue::Null]));
        let value = overlay(DataType::String, set.param(0).unwrap());
        assert_eq!(value.data_type, DataType::Val32);
        let null = overlay(DataType::Val64, set.param(1).unwrap());
        assert_eq!(null.data_type, DataType::Val64);
        let untyped = overlay(DataType::Invalid, set.param(1).unwrap());
        assert_eq!(untyped.data_type, DataType::String);
    }
}
