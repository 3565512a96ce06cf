pub mod connection;
pub mod execute;
pub mod statement;

pub use connection::{
    compose_connection_string, ConnectTarget, ConnectionCore, ConnectionString, NO_MORE_RESULTS,
};
pub use execute::ExecTarget;
pub use statement::{StatementArena, StmtKey};
