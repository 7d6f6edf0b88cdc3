//! Cold-storage archiving pipeline.
//!
//! Records older than a configured age are extracted from a live source in
//! bounded batches, staged durably on local disk, bundled into a
//! compressed archive, uploaded to object storage and only then deleted
//! from the source.

pub mod accumulator;
pub mod checkpoint;
pub mod extractor;
pub mod metrics;
pub mod packager;
pub mod publisher;
pub mod reconciler;
pub mod record;
pub mod scheduler;
pub mod source;
pub mod staging;

pub use checkpoint::Checkpoint;
pub use metrics::{ArchiveMetrics, MetricsSummary};
pub use record::{Record, RecordId};
pub use scheduler::{Archiver, ExtractOutcome, FlushOutcome};
pub use source::{MemorySource, SourceStore, SqliteSource};
