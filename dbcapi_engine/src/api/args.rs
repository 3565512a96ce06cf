//! Tagged arguments as they arrive from the scripting runtime, and their
//! resolution into typed requests. Nothing past this module looks at a
//! raw [`Arg`] again.

use super::statement::Statement;
use crate::error::{DbError, Result};
use crate::protocol::param_value::{BindParams, ParamValue};
use crate::protocol::result::QueryResult;
use std::fmt;

/// Value delivered to a completion callback on success.
pub enum Outcome {
    /// Nothing to hand back (connect, commit, drop, ...).
    Done,
    Result(QueryResult),
    Statement(Statement),
}

impl Outcome {
    pub fn into_result(self) -> Option<QueryResult> {
        match self {
            Outcome::Result(result) => Some(result),
            _ => None,
        }
    }

    pub fn into_statement(self) -> Option<Statement> {
        match self {
            Outcome::Statement(stmt) => Some(stmt),
            _ => None,
        }
    }
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Done => f.write_str("Done"),
            Outcome::Result(r) => f.debug_tuple("Result").field(r).finish(),
            Outcome::Statement(_) => f.write_str("Statement"),
        }
    }
}

/// Error-first completion callback: called once with `(Some(err), Done)`
/// or `(None, value)`.
pub struct Callback(Box<dyn FnOnce(Option<DbError>, Outcome)>);

impl Callback {
    pub fn new(f: impl FnOnce(Option<DbError>, Outcome) + 'static) -> Self {
        Self(Box::new(f))
    }

    pub fn invoke(self, result: Result<Outcome>) {
        match result {
            Ok(value) => (self.0)(None, value),
            Err(err) => (self.0)(Some(err), Outcome::Done),
        }
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Callback")
    }
}

/// A dynamically typed argument.
#[derive(Debug)]
pub enum Arg {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Buffer(Vec<u8>),
    Array(Vec<Arg>),
    /// Plain object; keys keep insertion order.
    Object(Vec<(String, Arg)>),
    Function(Callback),
}

impl Arg {
    pub fn callback(f: impl FnOnce(Option<DbError>, Outcome) + 'static) -> Self {
        Arg::Function(Callback::new(f))
    }

    pub fn string(s: impl Into<String>) -> Self {
        Arg::String(s.into())
    }

    pub fn object<K: Into<String>>(pairs: impl IntoIterator<Item = (K, Arg)>) -> Self {
        Arg::Object(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    fn is_function(&self) -> bool {
        matches!(self, Arg::Function(_))
    }

    /// Text used when an option value is flattened into a connection
    /// string.
    fn option_text(&self) -> String {
        match self {
            Arg::Undefined => "undefined".to_string(),
            Arg::Null => "null".to_string(),
            Arg::Bool(b) => b.to_string(),
            Arg::Number(n) => format_number(*n),
            Arg::String(s) => s.clone(),
            Arg::Buffer(b) => String::from_utf8_lossy(b).into_owned(),
            Arg::Array(items) => items
                .iter()
                .map(Arg::option_text)
                .collect::<Vec<_>>()
                .join(","),
            Arg::Object(_) => "[object Object]".to_string(),
            Arg::Function(_) => String::new(),
        }
    }
}

fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// Flattens an options object to `key=value;key=value`.
pub fn flatten_options(pairs: &[(String, Arg)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v.option_text()))
        .collect::<Vec<_>>()
        .join(";")
}

/// Connection string fragment given to the constructor.
pub fn resolve_base(mut args: Vec<Arg>) -> Result<Option<String>> {
    if args.len() > 1 {
        return Err(DbError::InvalidArguments);
    }
    match args.pop() {
        None | Some(Arg::Undefined) | Some(Arg::Null) => Ok(None),
        Some(Arg::String(s)) => Ok(Some(s)),
        Some(Arg::Object(pairs)) => Ok(Some(flatten_options(&pairs))),
        Some(_) => Err(DbError::InvalidArguments),
    }
}

/// What a `connect` call asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectSpec {
    /// Constructor fragment only.
    Base,
    Fragment(String),
    External(usize),
}

fn external_handle(n: f64) -> Result<usize> {
    if n.is_finite() && n >= 0.0 && n.fract() == 0.0 && n <= usize::MAX as f64 {
        Ok(n as usize)
    } else {
        Err(DbError::InvalidArguments)
    }
}

/// Splits a trailing function off the argument list.
fn take_callback(args: &mut Vec<Arg>) -> Option<Callback> {
    if args.last().is_some_and(Arg::is_function) {
        match args.pop() {
            Some(Arg::Function(cb)) => Some(cb),
            _ => None,
        }
    } else {
        None
    }
}

pub fn resolve_connect(mut args: Vec<Arg>) -> Result<(ConnectSpec, Option<Callback>)> {
    let callback = take_callback(&mut args);
    if args.len() > 1 {
        return Err(DbError::InvalidArguments);
    }
    let spec = match args.pop() {
        None => ConnectSpec::Base,
        Some(Arg::Number(n)) => ConnectSpec::External(external_handle(n)?),
        Some(Arg::String(s)) => ConnectSpec::Fragment(s),
        Some(Arg::Object(pairs)) => ConnectSpec::Fragment(flatten_options(&pairs)),
        Some(_) => return Err(DbError::InvalidArguments),
    };
    Ok((spec, callback))
}

/// `()` or `(callback)`.
pub fn resolve_callback_only(mut args: Vec<Arg>) -> Result<Option<Callback>> {
    let callback = take_callback(&mut args);
    if !args.is_empty() {
        return Err(DbError::InvalidArguments);
    }
    Ok(callback)
}

/// `(sql)` or `(sql, callback)`.
pub fn resolve_prepare(mut args: Vec<Arg>) -> Result<(String, Option<Callback>)> {
    let callback = take_callback(&mut args);
    match (args.pop(), args.is_empty()) {
        (Some(Arg::String(sql)), true) => Ok((sql, callback)),
        _ => Err(DbError::InvalidArguments),
    }
}

/// Parameter array of an exec call, not yet converted. Conversion
/// failures are bind errors, reported the way execution errors are.
#[derive(Debug, Default)]
pub struct RawParams(Option<Vec<Arg>>);

impl RawParams {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn into_bind_params(self) -> Result<BindParams> {
        match self.0 {
            None => Ok(BindParams::none()),
            Some(items) => params_from_array(items),
        }
    }
}

/// `(sql)`, `(sql, callback)`, `(sql, params)` or `(sql, params, callback)`.
pub fn resolve_exec(mut args: Vec<Arg>) -> Result<(String, RawParams, Option<Callback>)> {
    let callback = take_callback(&mut args);
    let mut args = args.into_iter();
    let sql = match args.next() {
        Some(Arg::String(sql)) => sql,
        _ => return Err(DbError::InvalidArguments),
    };
    let params = match args.next() {
        None => RawParams::none(),
        Some(Arg::Array(items)) => RawParams(Some(items)),
        Some(_) => return Err(DbError::InvalidArguments),
    };
    if args.next().is_some() {
        return Err(DbError::InvalidArguments);
    }
    Ok((sql, params, callback))
}

/// `()`, `(params)`, `(callback)` or `(params, callback)`.
pub fn resolve_stmt_exec(mut args: Vec<Arg>) -> Result<(RawParams, Option<Callback>)> {
    let callback = take_callback(&mut args);
    if args.len() > 1 {
        return Err(DbError::InvalidArguments);
    }
    match args.pop() {
        None => Ok((RawParams::none(), callback)),
        Some(Arg::Array(items)) => Ok((RawParams(Some(items)), callback)),
        Some(_) => Err(DbError::InvalidArguments),
    }
}

/// Integral numbers that fit 32 bits bind as integers, everything else
/// numeric as doubles.
pub fn param_from_number(n: f64) -> ParamValue {
    let integral = n.is_finite() && n.fract() == 0.0 && !(n == 0.0 && n.is_sign_negative());
    if integral && n >= i32::MIN as f64 && n <= i32::MAX as f64 {
        ParamValue::Integer(n as i32)
    } else {
        ParamValue::Double(n)
    }
}

fn param_from_arg(arg: Arg) -> Result<ParamValue> {
    match arg {
        Arg::Null => Ok(ParamValue::Null),
        Arg::Number(n) => Ok(param_from_number(n)),
        Arg::String(s) => Ok(ParamValue::String(s)),
        Arg::Buffer(b) => Ok(ParamValue::Binary(b)),
        _ => Err(DbError::BindingParametersFailed),
    }
}

fn row_from_array(items: Vec<Arg>) -> Result<Vec<ParamValue>> {
    items.into_iter().map(param_from_arg).collect()
}

/// An array of arrays is a wide bind; anything else is one row.
pub fn params_from_array(items: Vec<Arg>) -> Result<BindParams> {
    if !matches!(items.first(), Some(Arg::Array(_))) {
        return row_from_array(items).map(BindParams::Row);
    }
    let rows = items
        .into_iter()
        .map(|item| match item {
            Arg::Array(row) => row_from_array(row),
            _ => Err(DbError::BindingParametersFailed),
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(BindParams::Wide(rows))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cb() -> Arg {
        Arg::callback(|_, _| {})
    }

    #[test]
    fn test_resolve_base_shapes() {
        assert_eq!(resolve_base(vec![]).unwrap(), None);
        assert_eq!(resolve_base(vec![Arg::Null]).unwrap(), None);
        assert_eq!(
            resolve_base(vec![Arg::string("UID=dba")]).unwrap(),
            Some("UID=dba".to_string())
        );
        let opts = Arg::object([("UserId", Arg::string("dba")), ("Port", Arg::Number(2638.0))]);
        assert_eq!(
            resolve_base(vec![opts]).unwrap(),
            Some("UserId=dba;Port=2638".to_string())
        );
        assert_eq!(
            resolve_base(vec![Arg::Number(1.0)]),
            Err(DbError::InvalidArguments)
        );
        assert_eq!(
            resolve_base(vec![Arg::Null, Arg::Null]),
            Err(DbError::InvalidArguments)
        );
    }

    #[test]
    fn test_resolve_connect_shapes() {
        let (spec, callback) = resolve_connect(vec![]).unwrap();
        assert_eq!(spec, ConnectSpec::Base);
        assert!(callback.is_none());

        let (spec, callback) = resolve_connect(vec![cb()]).unwrap();
        assert_eq!(spec, ConnectSpec::Base);
        assert!(callback.is_some());

        let (spec, _) = resolve_connect(vec![Arg::Number(4096.0), cb()]).unwrap();
        assert_eq!(spec, ConnectSpec::External(4096));

        let (spec, _) = resolve_connect(vec![Arg::string("ENG=demo")]).unwrap();
        assert_eq!(spec, ConnectSpec::Fragment("ENG=demo".to_string()));

        let (spec, _) =
            resolve_connect(vec![Arg::object([("Host", Arg::string("db:2638"))]), cb()]).unwrap();
        assert_eq!(spec, ConnectSpec::Fragment("Host=db:2638".to_string()));

        assert!(resolve_connect(vec![Arg::Bool(true)]).is_err());
        assert!(resolve_connect(vec![Arg::Number(-1.0)]).is_err());
        assert!(resolve_connect(vec![Arg::string("a"), Arg::string("b")]).is_err());
        assert!(resolve_connect(vec![cb(), Arg::string("a")]).is_err());
    }

    #[test]
    fn test_resolve_exec_shapes() {
        let (sql, params, callback) = resolve_exec(vec![Arg::string("SELECT 1")]).unwrap();
        assert_eq!(sql, "SELECT 1");
        assert!(params.into_bind_params().unwrap().is_empty());
        assert!(callback.is_none());

        let (_, params, callback) = resolve_exec(vec![
            Arg::string("SELECT ?"),
            Arg::Array(vec![Arg::Number(1.0)]),
            cb(),
        ])
        .unwrap();
        assert!(callback.is_some());
        assert_eq!(
            params.into_bind_params().unwrap(),
            BindParams::Row(vec![ParamValue::Integer(1)])
        );

        assert!(resolve_exec(vec![]).is_err());
        assert!(resolve_exec(vec![Arg::Number(1.0)]).is_err());
        assert!(resolve_exec(vec![Arg::string("x"), Arg::string("y")]).is_err());
        assert!(resolve_exec(vec![Arg::string("x"), Arg::Array(vec![]), Arg::Null]).is_err());
    }

    #[test]
    fn test_resolve_stmt_exec_and_callback_only() {
        assert!(resolve_stmt_exec(vec![]).unwrap().1.is_none());
        assert!(resolve_stmt_exec(vec![Arg::Array(vec![]), cb()]).unwrap().1.is_some());
        assert!(resolve_stmt_exec(vec![Arg::string("x")]).is_err());

        assert!(resolve_callback_only(vec![]).unwrap().is_none());
        assert!(resolve_callback_only(vec![cb()]).unwrap().is_some());
        assert!(resolve_callback_only(vec![Arg::Null]).is_err());
    }

    #[test]
    fn test_resolve_prepare_shapes() {
        assert_eq!(
            resolve_prepare(vec![Arg::string("SELECT 1")]).unwrap().0,
            "SELECT 1"
        );
        assert!(resolve_prepare(vec![]).is_err());
        assert!(resolve_prepare(vec![Arg::Number(3.0), cb()]).is_err());
    }

    #[test]
    fn test_number_classification() {
        assert_eq!(param_from_number(7.0), ParamValue::Integer(7));
        assert_eq!(param_from_number(-2147483648.0), ParamValue::Integer(i32::MIN));
        assert_eq!(param_from_number(2147483648.0), ParamValue::Double(2147483648.0));
        assert_eq!(param_from_number(1.5), ParamValue::Double(1.5));
        assert!(matches!(param_from_number(-0.0), ParamValue::Double(_)));
    }

    #[test]
    fn test_params_from_array() {
        let row = params_from_array(vec![
            Arg::Number(1.0),
            Arg::string("abc"),
            Arg::Null,
            Arg::Buffer(vec![1, 2]),
        ])
        .unwrap();
        assert_eq!(
            row,
            BindParams::Row(vec![
                ParamValue::Integer(1),
                ParamValue::String("abc".to_string()),
                ParamValue::Null,
                ParamValue::Binary(vec![1, 2]),
            ])
        );

        let wide = params_from_array(vec![
            Arg::Array(vec![Arg::Number(1.0)]),
            Arg::Array(vec![Arg::Number(2.0)]),
        ])
        .unwrap();
        assert!(wide.is_wide());
        assert_eq!(wide.row_count(), 2);

        assert_eq!(
            params_from_array(vec![Arg::Bool(true)]),
            Err(DbError::BindingParametersFailed)
        );
        assert_eq!(
            params_from_array(vec![Arg::Array(vec![]), Arg::Number(1.0)]),
            Err(DbError::BindingParametersFailed)
        );
        assert_eq!(params_from_array(vec![]).unwrap(), BindParams::none());
    }

    #[test]
    fn test_callback_is_error_first() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        Callback::new(move |err, out| s.borrow_mut().push((err, format!("{:?}", out))))
            .invoke(Err(DbError::NotConnected));
        let s = seen.clone();
        Callback::new(move |err, out| s.borrow_mut().push((err, format!("{:?}", out))))
            .invoke(Ok(Outcome::Result(QueryResult::RowCount(2))));

        let seen = seen.borrow();
        assert_eq!(seen[0], (Some(DbError::NotConnected), "Done".to_string()));
        assert_eq!(seen[1].0, None);
        assert!(seen[1].1.contains("RowCount(2)"));
    }
}
