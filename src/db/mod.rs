//! The data layer, and the concurrency rules that shape it. Sqlite has some
//! unusual characteristics around concurrency that become pretty important
//! once several agents, a server, and an admin CLI all want the same store
//! at once, so the ground rules live here at the top of the module.
//!
//! A sqlite database on disk can be accessed by multiple processes and/or
//! threads at once. Under normal operation in WAL mode, a single database
//! can concurrently support any number of readers plus up to one writer,
//! and readers keep seeing a consistent committed snapshot while the writer
//! works. If a second writer shows up, the database is _busy_: sqlite will
//! spin-retry for up to the configured busy timeout, and then you get an
//! error anyway. The busy loop is disk-mediated and wasteful, and under
//! real contention it still fails sometimes. So the design here never
//! relies on it; it's a backstop, not a plan.
//!
//! The actual plan has three layers, one per concurrency axis:
//!
//! - **In-process:** all writes funnel through the [`writer::Writer`]
//!   coordinator -- a FIFO queue drained by one task that owns the one
//!   writable connection. Request handlers never touch a writable handle
//!   directly. This offloads the waiting onto the async runtime instead of
//!   sqlite's spin-lock, and gives submissions a total order for free.
//! - **Cross-process:** the coordinator (and any admin CLI write) brackets
//!   each write transaction with an exclusive flock on a sibling
//!   `<db>.lock` file ([`locks::WriteLock`]). Two processes contending for
//!   the store exclude each other there, before sqlite ever sees a busy
//!   conflict.
//! - **Cross-agent semantics:** writes that can race *across* transactions
//!   (task claiming, lease renewal, supersede) are phrased as conditional
//!   updates whose affected-row count is the verdict, so a lost race is an
//!   explicit "didn't get it" result instead of a lost update.
//!
//! Query helper types (`Memories`, `Tasks`, etc.) are rented from a [`Db`]
//! and are in charge of using the right side: read methods borrow the read
//! pool, write methods take `&mut SqliteConnection` and only ever run on
//! the coordinator's connection (or the CLI's scoped one, which holds the
//! same lock file).

mod artifacts;
mod conflicts;
mod core;
mod documents;
mod jobs;
pub mod locks;
mod memories;
pub mod migrations;
mod tasks;
mod tokens;
pub mod writer;

// Publicize the record types (they're the star of the show) along with
// their query helper types, whose associated write fns get called from
// inside coordinator submissions.
pub use self::artifacts::{Artifact, Artifacts};
pub use self::conflicts::{Conflict, Conflicts, Duplicate, Duplicates};
pub use self::documents::{Document, Documents};
pub use self::jobs::{Job, JobKind, Jobs, WorkerLease, JOB_MAX_ATTEMPTS};
pub use self::memories::{Memories, Memory, MemoryStatus};
pub use self::tasks::{Task, TaskStatus, Tasks};
pub use self::tokens::{ApiToken, TokenScope, Tokens};

// And the main wrapper type, plus the factory functions and the writer
// handle that startup code wires together.
pub use self::core::{connect_options, reader_pool, writer_connection, Db};
pub use self::writer::{WriteError, WriteTask, Writer};

#[cfg(test)]
pub use self::core::TestDb;
