//! Link Analyser: crawls a set of source pages, finds a link to a target domain, classifies it
//! and judges whether the target page is indexable. Storage, transport and rendering are all
//! capability traits; the types in [`domain`] are what flows between them.

pub mod analyser;
pub mod domain;
pub mod error;
pub mod normalise;
pub mod notifier;
pub mod queue;
pub mod repository;
pub mod scheduler;
pub mod sheet_adapter;
pub mod worker;

pub use analyser::{Analyser, AnalyserConfig};
pub use domain::{
    Interval, Job, Link, LinkClass, LinkKind, LinkState, Plan, Priority, ScheduledTask, Sheet,
    SheetStatus, Verdict,
};
pub use error::{AnalyserError, BackendUnavailable, MalformedInput};
pub use notifier::{Event, Notifier};
pub use queue::{EnqueueOutcome, Lease, PriorityQueue, QueueStats};
pub use repository::Repository;
pub use scheduler::Scheduler;
pub use sheet_adapter::SheetAdapter;
pub use worker::WorkerPool;
