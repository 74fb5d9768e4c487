//! Asynchronous PostgreSQL wire protocol client.
//!
//! One spawned task per connection reads backend messages and writes the
//! frames handed to it; [`Connection`] handles submit work and receive
//! completions through callbacks or futures.
//!
//! Architecture:
//! - `protocol`: Low-level wire protocol encoding/decoding
//! - `stream`: Framing read loop and message dispatch
//! - `connection`: Handshake, query sequencing and completion routing
//! - `auth`: MD5 and SCRAM-SHA-256 password authentication
//! - `config`: Connection settings and URL parsing
//! - `result`: Result sets and typed row access
//! - `convert`: Text-format value conversion
//! - `transaction`: BEGIN/COMMIT/ROLLBACK helpers
//! - `types`: Type OIDs and parameter values

pub mod auth;
pub mod config;
pub mod connection;
mod convert;
pub mod error;
pub mod protocol;
pub mod result;
pub mod stream;
pub mod transaction;
pub mod types;


// Public API re-exports for library consumers
pub use config::PgConfig;
pub use connection::{Connection, ErrorHandler};
pub use error::{BoxError, HandlerResult, PgError, PgResult};
pub use protocol::{FieldDescription, TransactionStatus};
pub use result::{ColumnIndex, Columns, ResultSet, Row};
pub use transaction::{Completion, Transaction};
pub use types::{Oid, Value};
