use thiserror::Error;

/// Minimal size of a native error message buffer.
pub const ERROR_BUFFER_SIZE: usize = 256;

/// Error category for decision-making at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Caller supplied something the engine cannot accept
    Validation,
    /// Object state does not allow the operation (not connected, dropped, ...)
    State,
    /// Failure reported by the native client library
    Native,
    /// Engine failure (poisoned lock, runtime start)
    Fatal,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DbError {
    #[error("Code: -2001 Msg: Invalid Object")]
    InvalidObject,

    #[error("Code: -2002 Msg: Invalid Arguments")]
    InvalidArguments,

    #[error("Code: -2003 Msg: Already Connected")]
    AlreadyConnected,

    #[error("Code: -2004 Msg: Can't initialize DBCAPI")]
    InitializationFailed,

    #[error("Code: -2005 Msg: No Connection Available")]
    NotConnected,

    #[error("Code: -2006 Msg: Can not bind parameter(s)")]
    BindingParametersFailed,

    #[error("Code: -2007 Msg: An error occurred")]
    GeneralError,

    #[error("Code: -2008 Msg: Error making result set Object")]
    ResultSetError,

    #[error("Code: -2009 Msg: The DBCAPI library must be upgraded to support wide statements")]
    UnsupportedWideStatement,

    #[error("Code: {code} Msg: {message}")]
    Native { code: i32, message: String },

    #[error("Code: -2007 Msg: {0}")]
    Internal(String),
}

impl DbError {
    /// Builds a native error, truncating the message the way a fixed
    /// `ERROR_BUFFER_SIZE` buffer would.
    pub fn native(code: i32, message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.len() >= ERROR_BUFFER_SIZE {
            let mut cut = ERROR_BUFFER_SIZE - 1;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        DbError::Native { code, message }
    }

    pub fn code(&self) -> i32 {
        match self {
            DbError::InvalidObject => -2001,
            DbError::InvalidArguments => -2002,
            DbError::AlreadyConnected => -2003,
            DbError::InitializationFailed => -2004,
            DbError::NotConnected => -2005,
            DbError::BindingParametersFailed => -2006,
            DbError::GeneralError | DbError::Internal(_) => -2007,
            DbError::ResultSetError => -2008,
            DbError::UnsupportedWideStatement => -2009,
            DbError::Native { code, .. } => *code,
        }
    }

    /// Message text without the `Code: n Msg:` prefix.
    pub fn message(&self) -> String {
        match self {
            DbError::InvalidObject => "Invalid Object".to_string(),
            DbError::InvalidArguments => "Invalid Arguments".to_string(),
            DbError::AlreadyConnected => "Already Connected".to_string(),
            DbError::InitializationFailed => "Can't initialize DBCAPI".to_string(),
            DbError::NotConnected => "No Connection Available".to_string(),
            DbError::BindingParametersFailed => "Can not bind parameter(s)".to_string(),
            DbError::GeneralError => "An error occurred".to_string(),
            DbError::ResultSetError => "Error making result set Object".to_string(),
            DbError::UnsupportedWideStatement => {
                "The DBCAPI library must be upgraded to support wide statements".to_string()
            }
            DbError::Native { message, .. } => message.clone(),
            DbError::Internal(msg) => msg.clone(),
        }
    }

    pub fn to_structured(&self) -> StructuredError {
        StructuredError {
            code: self.code(),
            message: self.message(),
        }
    }

    pub fn error_category(&self) -> ErrorCategory {
        match self {
            DbError::InvalidArguments
            | DbError::BindingParametersFailed
            | DbError::UnsupportedWideStatement => ErrorCategory::Validation,
            DbError::InvalidObject | DbError::AlreadyConnected | DbError::NotConnected => {
                ErrorCategory::State
            }
            DbError::Native { .. } | DbError::ResultSetError | DbError::GeneralError => {
                ErrorCategory::Native
            }
            DbError::InitializationFailed | DbError::Internal(_) => ErrorCategory::Fatal,
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        DbError::Internal("Lock poisoned".to_string())
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Debug, Clone, PartialEq)]
pub struct StructuredError {
    pub code: i32,
    pub message: String,
}

impl StructuredError {
    pub fn serialize(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&self.code.to_le_bytes());
        let msg_bytes = self.message.as_bytes();
        buffer.extend_from_slice(&(msg_bytes.len() as u32).to_le_bytes());
        buffer.extend_from_slice(msg_bytes);
        buffer
    }

    pub fn deserialize(data: &[u8]) -> Option<Self> {
        if data.len() < 8 {
            return None;
        }

        let code = i32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let msg_len = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;

        if data.len() < 8 + msg_len {
            return None;
        }

        let message = String::from_utf8(data[8..8 + msg_len].to_vec()).ok()?;

        Some(Self { code, message })
    }
}

impl From<&DbError> for StructuredError {
    fn from(err: &DbError) -> Self {
        err.to_structured()
    }
}
