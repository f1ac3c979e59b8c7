pub mod change;
pub mod orchestrator;
pub mod scheduler;

pub use change::needs_child_sync;
pub use orchestrator::{
	BULK_DETAIL_CHUNK, DEFAULT_DETAIL_CONCURRENCY, SyncConfig, SyncMode, SyncOrchestrator, SyncPhase,
	SyncReport,
};
pub use scheduler::SyncScheduler;
