//! Binds the `link-analyser` crate's capability traits to this server's concrete
//! infrastructure: Postgres for `Repository`, the kernel's `StreamHub` for `Notifier`.
//!
//! Unlike the other domains, this one is not a Seesaw aggregate — the crate it wraps already
//! owns its domain model and state machine. This module is glue.

pub mod postgres_queue;
pub mod postgres_repository;
pub mod stream_notifier;

pub use postgres_queue::PostgresQueue;
pub use postgres_repository::PostgresLinkRepository;
pub use stream_notifier::StreamHubNotifier;
