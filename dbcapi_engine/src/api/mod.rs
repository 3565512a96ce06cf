pub mod args;
pub mod connection;
mod request;
pub mod statement;

pub use args::{Arg, Callback, ConnectSpec, Outcome};
pub use connection::{create_connection, Connection};
pub use statement::Statement;
