//! Coordination service facade: names entities, applies the default ACL and
//! owner id, shares the manager, cache and observer dispatch between handles,
//! and runs the administrative loop.

use std::sync::{Arc, Mutex};

use coord_store::{Acl, StoreClient};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::admin::{
    AdminContext, AdminRunner, AdminTask, AdminTasks, EmptyEntitySweeper, ReservationReaper,
};
use crate::barrier::Barrier;
use crate::cache::CoordinationCache;
use crate::config::CoordConfig;
use crate::error::{CoordError, CoordResult};
use crate::lock::{Lock, ReadWriteLock, ReentrantLock};
use crate::manager::ReservationManager;
use crate::metrics::CoordMetrics;
use crate::observer::ObserverDispatch;
use crate::paths::PathScheme;
use crate::permits::{ConfiguredPermitPoolSize, ConstantPermitPoolSize, PermitPoolSize};
use crate::reservation::ReservationType;
use crate::revocation::{LockObserver, ObserverRegistration, SemaphoreObserver};
use crate::semaphore::Semaphore;

pub struct CoordinationService {
    config: CoordConfig,
    owner_id: String,
    paths: PathScheme,
    acl: Vec<Acl>,
    manager: Arc<ReservationManager>,
    cache: Arc<CoordinationCache>,
    observers: Arc<ObserverDispatch>,
    metrics: CoordMetrics,
    admin_tasks: AdminTasks,
    admin_loop: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl std::fmt::Debug for CoordinationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinationService")
            .field("owner_id", &self.owner_id)
            .field("paths", &self.paths)
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}

impl CoordinationService {
    /// Builds a service with unregistered metrics. Must be called within a
    /// tokio runtime.
    pub fn new(store: Arc<dyn StoreClient>, config: CoordConfig) -> CoordResult<Self> {
        Self::with_metrics(store, config, CoordMetrics::unregistered())
    }

    pub fn with_metrics(
        store: Arc<dyn StoreClient>,
        config: CoordConfig,
        metrics: CoordMetrics,
    ) -> CoordResult<Self> {
        config.validate()?;
        let paths = PathScheme::new(config.base_path.clone())?;
        let owner_id = config
            .owner_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let cache = Arc::new(CoordinationCache::default());
        let manager = Arc::new(ReservationManager::new(
            store.clone(),
            cache.clone(),
            &config,
            metrics.clone(),
        ));
        let observers = ObserverDispatch::new(store, config.observer.clone(), metrics.clone());

        let mut tasks: Vec<Arc<dyn AdminTask>> = Vec::new();
        if let Some(max_hold) = config.admin.max_reservation_hold() {
            tasks.push(Arc::new(ReservationReaper::new(max_hold)));
        }
        if config.admin.sweep_empty_entities {
            tasks.push(Arc::new(EmptyEntitySweeper));
        }
        info!(
            %owner_id,
            base_path = paths.base_path(),
            admin_tasks = tasks.len(),
            "coordination service created"
        );
        Ok(Self {
            config,
            owner_id,
            paths,
            acl: Acl::open_unsafe(),
            manager,
            cache,
            observers,
            metrics,
            admin_tasks: Arc::new(Mutex::new(tasks)),
            admin_loop: Mutex::new(None),
        })
    }

    /// Replaces the ACL applied to every node this service creates.
    pub fn with_default_acl(mut self, acl: Vec<Acl>) -> Self {
        self.acl = acl;
        self
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn config(&self) -> &CoordConfig {
        &self.config
    }

    pub fn paths(&self) -> &PathScheme {
        &self.paths
    }

    pub fn default_acl(&self) -> &[Acl] {
        &self.acl
    }

    pub fn manager(&self) -> &Arc<ReservationManager> {
        &self.manager
    }

    pub fn cache(&self) -> &Arc<CoordinationCache> {
        &self.cache
    }

    pub fn observers(&self) -> &Arc<ObserverDispatch> {
        &self.observers
    }

    pub fn metrics(&self) -> &CoordMetrics {
        &self.metrics
    }

    pub fn entity_path(
        &self,
        cluster_id: &str,
        reservation_type: ReservationType,
        entity_name: &str,
    ) -> CoordResult<String> {
        self.paths
            .entity_path(cluster_id, reservation_type, entity_name)
    }

    /// Non-reentrant exclusive lock.
    pub fn lock(&self, cluster_id: &str, lock_name: &str) -> CoordResult<Arc<Lock>> {
        let entity_path = self.entity_path(cluster_id, ReservationType::LockExclusive, lock_name)?;
        let lock = Arc::new(Lock::new(
            self.manager.clone(),
            self.owner_id.clone(),
            entity_path,
            ReservationType::LockExclusive,
            self.acl.clone(),
        ));
        self.cache.put_lock(lock.clone());
        Ok(lock)
    }

    /// Reentrant exclusive lock.
    pub fn reentrant_lock(&self, cluster_id: &str, lock_name: &str) -> CoordResult<Arc<ReentrantLock>> {
        self.reentrant(cluster_id, lock_name, ReservationType::LockExclusive)
    }

    fn reentrant(
        &self,
        cluster_id: &str,
        lock_name: &str,
        reservation_type: ReservationType,
    ) -> CoordResult<Arc<ReentrantLock>> {
        let entity_path = self.entity_path(cluster_id, reservation_type, lock_name)?;
        let lock = Arc::new(ReentrantLock::new(
            self.manager.clone(),
            self.owner_id.clone(),
            entity_path,
            reservation_type,
            self.acl.clone(),
        ));
        self.cache.put_lock(lock.clone());
        Ok(lock)
    }

    /// Shared read lock and exclusive write lock on the same entity.
    pub fn read_write_lock(&self, cluster_id: &str, lock_name: &str) -> CoordResult<ReadWriteLock> {
        let read = self.reentrant(cluster_id, lock_name, ReservationType::LockShared)?;
        let write = self.reentrant(cluster_id, lock_name, ReservationType::LockExclusive)?;
        Ok(ReadWriteLock::new(read, write))
    }

    /// Semaphore bounded by `pool`. Every local handle of the entity shares
    /// the first pool registered for it; a pool of another kind is rejected.
    pub fn semaphore(
        &self,
        cluster_id: &str,
        semaphore_name: &str,
        pool: Arc<dyn PermitPoolSize>,
    ) -> CoordResult<Arc<Semaphore>> {
        let entity_path = self.entity_path(cluster_id, ReservationType::Semaphore, semaphore_name)?;
        let pool = self
            .cache
            .put_or_return_cached_permit_pool_size(&entity_path, pool)?;
        let semaphore = Arc::new(Semaphore::new(
            self.manager.clone(),
            self.owner_id.clone(),
            entity_path,
            self.acl.clone(),
            pool,
        ));
        self.cache.put_semaphore(semaphore.clone());
        Ok(semaphore)
    }

    pub fn fixed_semaphore(
        &self,
        cluster_id: &str,
        semaphore_name: &str,
        permits: usize,
    ) -> CoordResult<Arc<Semaphore>> {
        let pool = Arc::new(ConstantPermitPoolSize::new(permits)?);
        self.semaphore(cluster_id, semaphore_name, pool)
    }

    /// Semaphore whose pool size follows
    /// `{base}/conf/{cluster}/semaphore/{name}`. When that node is missing and
    /// `create_if_necessary` is set, it is written with `desired`.
    pub async fn configured_semaphore(
        &self,
        cluster_id: &str,
        semaphore_name: &str,
        desired: Option<usize>,
        create_if_necessary: bool,
    ) -> CoordResult<Arc<Semaphore>> {
        let entity_path = self.entity_path(cluster_id, ReservationType::Semaphore, semaphore_name)?;
        if let Some(cached) = self.cache.permit_pool_size(&entity_path) {
            if cached.kind() != ConfiguredPermitPoolSize::KIND {
                return Err(CoordError::PermitPoolMismatch {
                    entity_path,
                    cached: cached.kind(),
                    requested: ConfiguredPermitPoolSize::KIND,
                });
            }
            return self.semaphore(cluster_id, semaphore_name, cached);
        }

        let conf_path = self
            .paths
            .semaphore_conf_path(cluster_id, semaphore_name)?;
        let pool: Arc<dyn PermitPoolSize> = ConfiguredPermitPoolSize::initialize(
            self.manager.store().as_ref(),
            &self.observers,
            &conf_path,
            desired,
            create_if_necessary,
            &self.acl,
        )
        .await?;
        let shared = self
            .cache
            .put_or_return_cached_permit_pool_size(&entity_path, pool.clone())?;
        if !Arc::ptr_eq(&shared, &pool) {
            // another task registered first
            pool.close();
        }
        self.semaphore(cluster_id, semaphore_name, shared)
    }

    /// Writes the configured pool size of a semaphore entity.
    pub async fn set_permit_pool_size(
        &self,
        cluster_id: &str,
        semaphore_name: &str,
        size: usize,
    ) -> CoordResult<()> {
        let conf_path = self
            .paths
            .semaphore_conf_path(cluster_id, semaphore_name)?;
        ConfiguredPermitPoolSize::write_conf(
            self.manager.store().as_ref(),
            &conf_path,
            size,
            &self.acl,
        )
        .await?;
        info!(%conf_path, size, "permit pool size written");
        Ok(())
    }

    pub async fn barrier(
        &self,
        cluster_id: &str,
        barrier_name: &str,
        parties: usize,
    ) -> CoordResult<Arc<Barrier>> {
        let entity_path = self.entity_path(cluster_id, ReservationType::Barrier, barrier_name)?;
        let barrier = Barrier::open(
            self.manager.store().clone(),
            self.observers.clone(),
            self.owner_id.clone(),
            entity_path,
            parties,
            self.acl.clone(),
        )
        .await?;
        Ok(Arc::new(barrier))
    }

    /// Reports external deletion of lock reservations held through this
    /// service.
    pub async fn observe_lock(
        &self,
        cluster_id: &str,
        lock_name: &str,
        observer: LockObserver,
    ) -> CoordResult<ObserverRegistration> {
        let entity_path = self.entity_path(cluster_id, ReservationType::LockExclusive, lock_name)?;
        let observer = observer.into_observer(&entity_path, self.cache.clone(), self.metrics.clone());
        let observer_id = observer.id();
        self.observers.put(&entity_path, observer).await;
        Ok(ObserverRegistration {
            entity_path,
            observer_id,
        })
    }

    /// Reports external deletion of permits held through this service.
    pub async fn observe_semaphore(
        &self,
        cluster_id: &str,
        semaphore_name: &str,
        observer: SemaphoreObserver,
    ) -> CoordResult<ObserverRegistration> {
        let entity_path = self.entity_path(cluster_id, ReservationType::Semaphore, semaphore_name)?;
        let observer = observer.into_observer(&entity_path, self.cache.clone(), self.metrics.clone());
        let observer_id = observer.id();
        self.observers.put(&entity_path, observer).await;
        Ok(ObserverRegistration {
            entity_path,
            observer_id,
        })
    }

    pub fn remove_observer(&self, registration: &ObserverRegistration) -> bool {
        self.observers
            .remove(&registration.entity_path, registration.observer_id)
    }

    pub fn register_admin_task(&self, task: Arc<dyn AdminTask>) {
        debug!(task = task.name(), "admin task registered");
        self.admin_tasks
            .lock()
            .expect("admin tasks poisoned")
            .push(task);
    }

    fn admin_runner(&self) -> AdminRunner {
        AdminRunner {
            ctx: AdminContext::new(self.manager.clone(), self.paths.clone()),
            tasks: self.admin_tasks.clone(),
            owner_id: self.owner_id.clone(),
            acl: self.acl.clone(),
            interval: self.config.admin.interval(),
        }
    }

    /// Runs one administrative pass now; returns the number of tasks that
    /// succeeded.
    pub async fn run_admin_pass(&self) -> CoordResult<usize> {
        self.admin_runner().run_pass().await
    }

    /// Starts the periodic admin loop. Returns false when disabled by
    /// configuration or already running.
    pub fn start_admin(&self) -> bool {
        if !self.config.admin.enabled {
            debug!("admin loop disabled");
            return false;
        }
        let mut admin_loop = self.admin_loop.lock().expect("admin loop poisoned");
        if admin_loop.is_some() {
            return false;
        }
        let token = self.manager.shutdown_token().child_token();
        let handle = self.admin_runner().spawn(token.clone());
        *admin_loop = Some((token, handle));
        info!(interval = ?self.config.admin.interval(), "admin loop started");
        true
    }

    /// Stops the admin loop, wakes every waiting acquisition and stops the
    /// observer workers. Held reservations are left to session expiry.
    pub fn shutdown(&self) {
        if let Some((token, _handle)) = self.admin_loop.lock().expect("admin loop poisoned").take() {
            token.cancel();
        }
        self.manager.shutdown();
        self.observers.shutdown();
        info!(owner_id = %self.owner_id, "coordination service shut down");
    }
}
