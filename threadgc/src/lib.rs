mod collector;
mod config;
mod control;
mod error;
mod freelist;
mod heap;
mod local_alloc;
mod marker;
mod record;
mod stw;
mod system;
mod table;

pub use collector::{Collector, FinalizerNesting, ManagedThread, Mutator};
pub use config::{CollectorConfig, DiscoveryKind, MAX_MARKERS, MAX_THREADS};
pub use control::{ParkingControl, ThreadControl, current_thread_token};
pub use error::{OsError, OsOp, ThreadError, fatal};
pub use freelist::{BlockPtr, FreeList};
pub use heap::{
    GRANULE_BYTES, GlobalHeap, MAX_OBJECT_BYTES, ObjectKind, REFILL_BYTES, SIZE_CLASSES, class_bytes,
    class_granules, size_class_for,
};
pub use local_alloc::COUNT_LIMIT;
pub use marker::{MarkTask, MarkWork, MarkerPool, ParallelMarkerSlot, SPIN_MAX};
pub use record::{
    ADDR_LIMIT, REGISTER_WORDS, RecordSnapshot, RegisterSnapshot, StackBounds, ThreadFlags, ThreadId,
    ThreadRecord, ThreadState,
};
pub use stw::{StackOwner, StackScanSummary, ThreadStack, WorldStopped, backoff_sleep};
pub use system::{OS_PAGE_SIZE, approx_sp, map_memory, unmap_memory};
pub use table::{RecordAllocator, SystemAllocator};
