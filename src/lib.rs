//! An embeddable writer that produces files byte-compatible with the
//! SQLite 3 database format, tuned for high-throughput inserts and updates
//! into a single `WITHOUT ROWID` table. No journaling, no WAL, no atomic
//! commit across pages — the file the engine produces is always a valid
//! SQLite database, but a crash mid-write is not guaranteed recoverable.
//!
//! The public surface is [`Handle`]: open or create a database, `put`/
//! `put_record` rows into it, `get`/`get_record` them back out, and close
//! (explicitly or via `Drop`) to finalize the file header.

pub mod error;
pub(crate) mod physical;

pub use error::{Error, Result};
pub use physical::codec::Value;
pub use physical::db::Handle;
