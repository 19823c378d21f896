//! # Ark Common
//!
//! The heap allocator and background task pool of a managed runtime:
//!
//! - **Heap**: pluggable object allocators (bump pointer, region, large
//!   object) with thread-local allocation buffers
//! - **Buffer replenishment**: exhausted buffers are fed ahead of time from
//!   the task pool
//! - **Task Pool**: a fixed set of worker threads running GC and upkeep tasks,
//!   with delayed tasks and cooperative cancellation
//! - **Runtime**: one heap and one task pool wired together from a
//!   [`RuntimeConfig`]
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         HeapRuntime                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌──────────────────────┐         ┌──────────────────────┐   │
//! │  │      Allocator       │ posts   │       Taskpool       │   │
//! │  │  bump/region/large   │────────▶│  Runner + TaskQueue  │   │
//! │  └──────────────────────┘         └──────────────────────┘   │
//! │             │                                │               │
//! │  ┌──────────────────────┐         ┌──────────────────────┐   │
//! │  │  AllocBufferManager  │◀────────│    ReplenishTask     │   │
//! │  │   (hungry buffers)   │  feeds  │                      │   │
//! │  └──────────────────────┘         └──────────────────────┘   │
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod heap;
pub mod log;
pub mod runtime;
pub mod taskpool;

// Re-exports
pub use config::{ConfigError, HeapConfig, LogLevel, RuntimeConfig, RuntimeConfigBuilder};
pub use heap::{
    create_allocator, AllocBufferManager, AllocType, AllocationBuffer, Allocator, AllocatorKind, GcHandler,
    GcReason, HeapAddress, HeapObject,
};
pub use runtime::HeapRuntime;
pub use taskpool::{FnTask, PostError, PriorityMode, Task, TaskMeta, TaskType, Taskpool};
