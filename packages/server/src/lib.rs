// Link Audit API — server wiring for the `link-analyser` execution plane.
//
// Binds the `link-analyser` crate's capability traits (Repository, Notifier) to this
// server's concrete infrastructure (Postgres, an in-process StreamHub) and exposes a thin
// HTTP surface for ingress (batch enqueue) and real-time fan-out (SSE).

pub mod config;
pub mod domains;
pub mod kernel;
pub mod server;

pub use config::*;
