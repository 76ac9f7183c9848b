//! # coordination
//!
//! Fair distributed synchronization on top of a [`coord_store::StoreClient`]:
//! exclusive and shared locks, reentrant locks, counting semaphores with a
//! fixed or store-configured pool size, and cyclic barriers.
//!
//! Every acquisition is a sequential node under the entity's path and is
//! granted in sequence order. An exclusive waiter watches only the node
//! directly ahead of it and a shared waiter only the nearest exclusive node
//! ahead of it, so a release wakes just the waiters it can admit. Semaphore
//! waiters watch the entity's child list. Nodes are ephemeral, so a lost
//! session releases whatever it held.
//!
//! [`CoordinationService`] is the entry point:
//!
//! ```no_run
//! # async fn demo() -> coordination::CoordResult<()> {
//! use std::sync::Arc;
//!
//! use coord_store::MemoryStore;
//! use coordination::{CoordConfig, CoordinationService, DistributedLock};
//!
//! let store = MemoryStore::new();
//! let service = CoordinationService::new(Arc::new(store.connect()), CoordConfig::default())?;
//! let lock = service.lock("cluster-1", "orders")?;
//! lock.lock().await?;
//! lock.unlock().await?;
//! # Ok(())
//! # }
//! ```

pub mod admin;
pub mod barrier;
pub mod cache;
pub mod config;
pub mod error;
pub mod lock;
pub mod manager;
pub mod metrics;
pub mod observer;
pub mod paths;
pub mod permits;
pub mod relay;
pub mod reservation;
pub mod revocation;
pub mod semaphore;
pub mod service;

pub use admin::{AdminContext, AdminTask, EmptyEntitySweeper, ReservationReaper};
pub use barrier::Barrier;
pub use cache::CoordinationCache;
pub use config::{AdminConfig, CoordConfig, ObserverConfig};
pub use error::{CoordError, CoordResult};
pub use lock::{DistributedLock, Lock, ReadWriteLock, ReentrantLock};
pub use manager::{AcquireRequest, Acquisition, ReservationManager};
pub use metrics::CoordMetrics;
pub use observer::{Observer, ObserverDispatch, ObserverId};
pub use paths::PathScheme;
pub use permits::{ConfiguredPermitPoolSize, ConstantPermitPoolSize, PermitPoolSize};
pub use reservation::ReservationType;
pub use revocation::{LockObserver, ObserverRegistration, SemaphoreObserver};
pub use semaphore::Semaphore;
pub use service::CoordinationService;
