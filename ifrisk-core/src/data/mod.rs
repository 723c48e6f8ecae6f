//! Upstream access and ingestion: transport, retrying fetcher, pagination,
//! checkpoints, identity resolution and the per-report orchestrator.

pub mod checkpoint;
pub mod fetcher;
pub mod identity;
pub mod ingest;
pub mod paging;
pub mod retry;
pub mod transport;
pub mod upstream;

pub use checkpoint::{
    Checkpoint, CheckpointError, CheckpointKey, CheckpointStore, FileCheckpointStore,
    MemoryCheckpointStore,
};
pub use fetcher::{FetchError, ResilientFetcher};
pub use identity::{IdentityMap, IdentityResolver};
pub use ingest::{
    IngestConfig, IngestError, IngestProgress, LogProgress, Orchestrator, ReportOutcome,
    ReportStats, RowIssue, RunSummary,
};
pub use paging::{Cursor, Page, PageSource, PaginationMode};
pub use retry::{Disposition, RetryPolicy, StatusPolicy};
pub use transport::{HttpResponse, HttpTransport, TimeoutTiers, Transport, TransportError};
pub use upstream::{detect_latest_period, Endpoints, ReportQuery};
