//! docsync client library
//!
//! Runs the reconciliation engine against a server channel:
//!
//! - [`Mediator`] applies remote transform batches to a
//!   [`DocumentModel`](docsync_core::DocumentModel), keeps the baseline, and
//!   diffs local edits for pushing
//! - [`ServerChannel`] is the transport seam; [`MemoryChannel`] implements it
//!   in-process
//! - [`SyncSession`] ties a mediator to a background scheduler task for the
//!   lifetime of one open document
//!
//! ```no_run
//! use std::time::Duration;
//! use docsync_client::{MemoryChannel, SchedulerConfig, SyncSession};
//! use docsync_core::BlockDocument;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SchedulerConfig::new(
//!     Duration::from_millis(500),
//!     Duration::from_secs(2),
//!     Duration::from_secs(5),
//! );
//! let mut session = SyncSession::open(BlockDocument::new(), MemoryChannel::new(), config)?;
//! session.pump_next().await?;
//! let document = session.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod constants;
pub mod mediator;
pub mod scheduler;
pub mod session;

pub use channel::{ChannelError, LocalChange, MemoryChannel, PushAck, ServerChannel};
pub use config::{ConfigError, SchedulerConfig, SyncConfig};
pub use mediator::{BatchAborted, BatchReport, Mediator, SyncWarning};
pub use session::{SessionError, SessionEvent, SyncSession};
