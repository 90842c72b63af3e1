pub mod audit;
pub mod dedupe;
pub mod error;
pub mod index;
pub mod normalizer;
pub mod pipeline;

pub use audit::AuditLog;
pub use dedupe::IdempotencyGate;
pub use error::HubError;
pub use index::{HttpSearchIndex, IndexRow, MemoryIndex, SearchIndex};
pub use normalizer::normalize;
pub use pipeline::{BatchReport, IngestOutcome, IngestPipeline};
