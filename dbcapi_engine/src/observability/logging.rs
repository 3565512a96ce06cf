use crate::error::{DbError, ErrorCategory};
use log::Level;
use std::collections::HashMap;

const SECRET_KEYS: &[&str] = &["pwd", "password", "encryptedpassword"];

/// Splits on `;` outside `{...}` groups, which may themselves hold `;`.
pub(crate) fn split_connection_string_parts(connection_string: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0usize;
    let mut brace_depth = 0u32;

    for (idx, ch) in connection_string.char_indices() {
        match ch {
            '{' => brace_depth = brace_depth.saturating_add(1),
            '}' => brace_depth = brace_depth.saturating_sub(1),
            ';' if brace_depth == 0 => {
                parts.push(&connection_string[start..idx]);
                start = idx + ch.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&connection_string[start..]);
    parts
}

/// Connection string with password values masked.
pub fn redact_connection_string(connection_string: &str) -> String {
    split_connection_string_parts(connection_string)
        .into_iter()
        .map(|part| match part.split_once('=') {
            Some((key, _)) if SECRET_KEYS.contains(&key.trim().to_ascii_lowercase().as_str()) => {
                format!("{}=***", key)
            }
            _ => part.to_string(),
        })
        .collect::<Vec<_>>()
        .join(";")
}

pub struct StructuredLogger {
    enabled: bool,
}

impl StructuredLogger {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn log_statement(&self, level: Level, sql: &str, metadata: &HashMap<String, String>) {
        if !self.enabled {
            return;
        }

        let mut message = format!("Statement: {}", sql);
        let mut keys: Vec<&String> = metadata.keys().collect();
        keys.sort();
        for key in keys {
            message.push_str(&format!(", {}={}", key, metadata[key]));
        }

        log::log!(level, "{}", message);
    }

    pub fn log_connection(&self, level: Level, connection_string: &str, action: &str) {
        if !self.enabled {
            return;
        }

        log::log!(
            level,
            "Connection {}: {}",
            action,
            redact_connection_string(connection_string)
        );
    }

    /// Caller mistakes and object state errors are warnings; failures of
    /// the client library or the engine itself are errors.
    pub fn log_error(&self, error: &DbError, metadata: &HashMap<String, String>) {
        if !self.enabled {
            return;
        }

        let category = error.error_category();
        let mut message = format!("Error: {}, category={:?}", error, category);
        let mut keys: Vec<&String> = metadata.keys().collect();
        keys.sort();
        for key in keys {
            message.push_str(&format!(", {}={}", key, metadata[key]));
        }

        log::log!(error_level(category), "{}", message);
    }
}

fn error_level(category: ErrorCategory) -> Level {
    match category {
        ErrorCategory::Validation | ErrorCategory::State => Level::Warn,
        ErrorCategory::Native | ErrorCategory::Fatal => Level::Error,
    }
}

impl Default for StructuredLogger {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structured_logger_default() {
        let logger = StructuredLogger::default();
        assert!(logger.is_enabled());
    }

    #[test]
    fn test_split_respects_braces() {
        let parts = split_connection_string_parts("UID=dba;PWD={a;b};ENG=demo");
        assert_eq!(parts, vec!["UID=dba", "PWD={a;b}", "ENG=demo"]);
    }

    #[test]
    fn test_redact_masks_passwords() {
        let redacted = redact_connection_string("UID=dba;PWD=sql;Host=localhost;CHARSET='UTF-8'");
        assert_eq!(redacted, "UID=dba;PWD=***;Host=localhost;CHARSET='UTF-8'");

        let redacted = redact_connection_string("password={p;w};uid=x");
        assert_eq!(redacted, "password=***;uid=x");
    }

    #[test]
    fn test_redact_leaves_leading_separator() {
        assert_eq!(redact_connection_string(";PWD=x"), ";PWD=***");
    }

    #[test]
    fn test_log_calls_when_disabled() {
        let logger = StructuredLogger::new(false);
        let metadata = HashMap::new();
        logger.log_statement(Level::Info, "SELECT 1", &metadata);
        logger.log_connection(Level::Info, "PWD=secret", "connect");
        logger.log_error(&DbError::GeneralError, &metadata);
    }

    #[test]
    fn test_log_calls_when_enabled() {
        let _ = env_logger::builder().is_test(true).try_init();
        let logger = StructuredLogger::new(true);
        let mut metadata = HashMap::new();
        metadata.insert("rows".to_string(), "3".to_string());
        logger.log_statement(Level::Debug, "SELECT * FROM t", &metadata);
        logger.log_connection(Level::Debug, "UID=dba;PWD=sql", "connect");
        logger.log_error(&DbError::NotConnected, &metadata);
        logger.log_error(&DbError::native(-131, "Syntax error"), &metadata);
    }

    #[test]
    fn test_error_level_follows_category() {
        assert_eq!(error_level(DbError::InvalidArguments.error_category()), Level::Warn);
        assert_eq!(error_level(DbError::InvalidObject.error_category()), Level::Warn);
        assert_eq!(error_level(DbError::native(-1, "x").error_category()), Level::Error);
        assert_eq!(
            error_level(DbError::Internal("Lock poisoned".to_string()).error_category()),
            Level::Error
        );
    }
}
