//! Runtime context owning one heap and one task pool.
//!
//! ```rust,ignore
//! use ark_common::{HeapRuntime, RuntimeConfig};
//!
//! let config = RuntimeConfig::from_env();
//! ark_common::log::init(&config.log);
//! let runtime = HeapRuntime::new(config)?;
//! let addr = runtime.allocate(64, ark_common::AllocType::Normal);
//! runtime.shutdown();
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{ConfigError, RuntimeConfig};
use crate::heap::{create_allocator, AllocType, Allocator, GcHandler, HeapAddress};
use crate::taskpool::{Taskpool, ALL_TASK_ID};

/// An initialised allocator wired to a running task pool.
pub struct HeapRuntime {
    config: RuntimeConfig,
    taskpool: Arc<Taskpool>,
    allocator: Arc<dyn Allocator>,
    shut_down: AtomicBool,
}

impl HeapRuntime {
    /// Validate `config`, build the configured allocator and start the pool.
    pub fn new(config: RuntimeConfig) -> Result<Self, ConfigError> {
        let allocator: Arc<dyn Allocator> = Arc::from(create_allocator(config.heap.allocator));
        Self::with_allocator(config, allocator)
    }

    /// Like [`new`](HeapRuntime::new), with a caller-built allocator.
    ///
    /// `allocator` must not be initialised yet; it is initialised with
    /// `config.heap`.
    pub fn with_allocator(config: RuntimeConfig, allocator: Arc<dyn Allocator>) -> Result<Self, ConfigError> {
        config.validate()?;
        if allocator.kind() != config.heap.allocator {
            return Err(ConfigError::InvalidValue {
                field: "heap.allocator".into(),
                message: format!(
                    "allocator is '{}' but the configuration asks for '{}'",
                    allocator.kind(),
                    config.heap.allocator
                ),
            });
        }

        allocator.init(&config.heap);
        let taskpool = Arc::new(Taskpool::new());
        taskpool.initialize(config.taskpool.thread_num, None, None);
        allocator.attach_taskpool(Arc::clone(&taskpool));

        tracing::info!(
            allocator = %allocator.kind(),
            heap_size = config.heap.heap_size,
            threads = taskpool.total_thread_num(),
            async_allocation = allocator.is_async_allocation_enabled(),
            "heap runtime started"
        );

        Ok(Self {
            config,
            taskpool,
            allocator,
            shut_down: AtomicBool::new(false),
        })
    }

    /// The configuration the runtime was built from.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The heap allocator.
    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    /// The background task pool.
    pub fn taskpool(&self) -> &Arc<Taskpool> {
        &self.taskpool
    }

    /// Allocate `size` bytes, header included. `NULL` when the heap is full.
    pub fn allocate(&self, size: usize, alloc_type: AllocType) -> HeapAddress {
        self.allocator.allocate(size, alloc_type)
    }

    /// Route the allocator's collection requests to `handler`.
    pub fn set_gc_handler(&self, handler: Arc<dyn GcHandler>) {
        self.allocator.set_gc_handler(handler);
    }

    /// Whether [`shutdown`](HeapRuntime::shutdown) has run.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Cancel pending work and join the pool workers. Idempotent.
    ///
    /// The heap stays usable for synchronous allocation afterwards; hungry
    /// buffers are then only fed by explicit `feed_hungry_buffers` calls.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.taskpool.destroy(ALL_TASK_ID);
        tracing::info!(
            allocated = self.allocator.allocated_bytes(),
            capacity = self.allocator.current_capacity(),
            "heap runtime stopped"
        );
    }
}

impl Drop for HeapRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for HeapRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapRuntime")
            .field("config", &self.config)
            .field("taskpool", &self.taskpool)
            .field("allocator", &self.allocator.kind())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
