//! Periodic administrative maintenance.
//!
//! Every pass runs under the exclusive lock `{base}/coord/_admin/lock/maintenance`
//! so only one service in the cluster performs maintenance at a time.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use coord_store::path::join;
use coord_store::{Acl, StoreClient, StoreError, Watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::CoordResult;
use crate::lock::{DistributedLock, Lock};
use crate::manager::ReservationManager;
use crate::metrics::CoordMetrics;
use crate::paths::PathScheme;
use crate::reservation::ReservationType;

/// Cluster id of the maintenance lock; skipped by the built-in tasks.
pub const ADMIN_CLUSTER: &str = "_admin";
/// Entity name of the maintenance lock.
pub const ADMIN_LOCK: &str = "maintenance";

/// A maintenance duty run periodically under the admin lock.
#[async_trait]
pub trait AdminTask: Send + Sync {
    fn name(&self) -> &str;

    async fn perform(&self, ctx: &AdminContext) -> CoordResult<()>;
}

/// What a task gets to work with.
#[derive(Clone)]
pub struct AdminContext {
    manager: Arc<ReservationManager>,
    paths: PathScheme,
}

impl std::fmt::Debug for AdminContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminContext")
            .field("paths", &self.paths)
            .finish_non_exhaustive()
    }
}

impl AdminContext {
    pub fn new(manager: Arc<ReservationManager>, paths: PathScheme) -> Self {
        Self { manager, paths }
    }

    pub fn store(&self) -> &dyn StoreClient {
        self.manager.store().as_ref()
    }

    pub fn manager(&self) -> &Arc<ReservationManager> {
        &self.manager
    }

    pub fn paths(&self) -> &PathScheme {
        &self.paths
    }

    pub fn metrics(&self) -> &CoordMetrics {
        self.manager.metrics()
    }

    async fn children(&self, path: &str) -> CoordResult<Vec<String>> {
        match self.store().get_children(path, Watch::None).await {
            Ok(children) => Ok(children),
            Err(err) if err.is_no_node() => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    /// Entity paths of lock and semaphore entities across all clusters,
    /// except the admin cluster.
    pub async fn lock_and_semaphore_entities(&self) -> CoordResult<Vec<String>> {
        let mut entities = Vec::new();
        for cluster in self.children(&self.paths.coord_root()).await? {
            if cluster == ADMIN_CLUSTER {
                continue;
            }
            for category in [
                ReservationType::LockExclusive.category(),
                ReservationType::Semaphore.category(),
            ] {
                let category_path = self.paths.category_path(&cluster, category)?;
                for entity in self.children(&category_path).await? {
                    entities.push(join(&category_path, &entity));
                }
            }
        }
        Ok(entities)
    }
}

/// Deletes lock and semaphore reservations held longer than `max_hold`,
/// freeing entities held by stuck processes.
#[derive(Debug, Clone)]
pub struct ReservationReaper {
    max_hold: Duration,
}

impl ReservationReaper {
    pub fn new(max_hold: Duration) -> Self {
        Self { max_hold }
    }
}

#[async_trait]
impl AdminTask for ReservationReaper {
    fn name(&self) -> &str {
        "reservation-reaper"
    }

    async fn perform(&self, ctx: &AdminContext) -> CoordResult<()> {
        let mut reaped = 0;
        for entity in ctx.lock_and_semaphore_entities().await? {
            for child in ctx.children(&entity).await? {
                let path = join(&entity, &child);
                let Some(stat) = ctx.store().exists(&path, Watch::None).await? else {
                    continue;
                };
                let age = Utc::now()
                    .signed_duration_since(stat.ctime)
                    .to_std()
                    .unwrap_or_default();
                if age < self.max_hold {
                    continue;
                }
                warn!(
                    reservation_path = %path,
                    ?age,
                    max_hold = ?self.max_hold,
                    "reaping reservation held too long"
                );
                if ctx.manager.relinquish(&path).await? {
                    ctx.metrics().reservations_reaped.inc();
                    reaped += 1;
                }
            }
        }
        debug!(reaped, "reservation reaper done");
        Ok(())
    }
}

/// Deletes lock and semaphore entity nodes that have no reservations left.
/// The delete is version-checked and gives way to any concurrent change.
#[derive(Debug, Clone, Default)]
pub struct EmptyEntitySweeper;

#[async_trait]
impl AdminTask for EmptyEntitySweeper {
    fn name(&self) -> &str {
        "empty-entity-sweeper"
    }

    async fn perform(&self, ctx: &AdminContext) -> CoordResult<()> {
        let mut swept = 0;
        for entity in ctx.lock_and_semaphore_entities().await? {
            let Some(stat) = ctx.store().exists(&entity, Watch::None).await? else {
                continue;
            };
            if stat.num_children > 0 {
                continue;
            }
            match ctx.store().delete(&entity, Some(stat.version)).await {
                Ok(()) => {
                    debug!(entity_path = %entity, "swept empty entity");
                    swept += 1;
                }
                Err(
                    StoreError::NoNode(_) | StoreError::NotEmpty(_) | StoreError::BadVersion { .. },
                ) => {}
                Err(err) => return Err(err.into()),
            }
        }
        debug!(swept, "empty entity sweeper done");
        Ok(())
    }
}

/// Registered tasks, shared between the service and its admin loop.
pub(crate) type AdminTasks = Arc<Mutex<Vec<Arc<dyn AdminTask>>>>;

pub(crate) struct AdminRunner {
    pub(crate) ctx: AdminContext,
    pub(crate) tasks: AdminTasks,
    pub(crate) owner_id: String,
    pub(crate) acl: Vec<Acl>,
    pub(crate) interval: Duration,
}

impl AdminRunner {
    /// One maintenance pass; returns the number of tasks that succeeded.
    pub(crate) async fn run_pass(&self) -> CoordResult<usize> {
        let started = Instant::now();
        let lock_path =
            self.ctx
                .paths
                .entity_path(ADMIN_CLUSTER, ReservationType::LockExclusive, ADMIN_LOCK)?;
        let lock = Arc::new(Lock::new(
            self.ctx.manager.clone(),
            self.owner_id.clone(),
            lock_path,
            ReservationType::LockExclusive,
            self.acl.clone(),
        ));
        self.ctx.manager.cache().put_lock(lock.clone());
        if let Err(err) = lock.lock().await {
            lock.destroy().await?;
            return Err(err);
        }
        info!("performing administrative maintenance");

        let tasks: Vec<Arc<dyn AdminTask>> = self.tasks.lock().expect("admin tasks poisoned").clone();
        let mut succeeded = 0;
        for task in tasks {
            match task.perform(&self.ctx).await {
                Ok(()) => succeeded += 1,
                Err(err) => warn!(task = task.name(), error = %err, "admin task failed"),
            }
        }

        let unlocked = lock.unlock().await;
        lock.destroy().await?;
        unlocked?;
        let metrics = self.ctx.metrics();
        metrics.admin_runs.inc();
        metrics
            .admin_duration
            .observe(started.elapsed().as_secs_f64());
        Ok(succeeded)
    }

    /// Runs a pass every `interval`, first after one interval, until `token`
    /// is cancelled.
    pub(crate) fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + self.interval;
            let mut ticker = tokio::time::interval_at(start, self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("admin loop stopping");
                        return;
                    }
                    _ = ticker.tick() => {
                        match self.run_pass().await {
                            Ok(succeeded) => debug!(succeeded, "administrative pass completed"),
                            Err(err) => warn!(error = %err, "administrative pass failed"),
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use coord_store::{CreateMode, MemoryClient, MemoryStore, create_with_parents};

    use super::*;
    use crate::cache::CoordinationCache;
    use crate::config::CoordConfig;
    use crate::manager::AcquireRequest;

    fn context(client: &MemoryClient) -> AdminContext {
        let manager = Arc::new(ReservationManager::new(
            Arc::new(client.clone()),
            Arc::new(CoordinationCache::default()),
            &CoordConfig::default(),
            CoordMetrics::unregistered(),
        ));
        AdminContext::new(manager, PathScheme::new("/q").unwrap())
    }

    async fn hold(ctx: &AdminContext, entity: &str, reservation_type: ReservationType) -> String {
        let acl = Acl::open_unsafe();
        ctx.manager()
            .acquire(&AcquireRequest {
                owner_id: "a",
                entity_path: entity,
                reservation_type,
                acl: &acl,
                wait: None,
                interrupt: None,
                interruptible: false,
            })
            .await
            .unwrap()
            .into_path()
            .unwrap()
    }

    #[tokio::test]
    async fn test_reaper_deletes_old_reservations() {
        let store = MemoryStore::new();
        let client = store.connect();
        let ctx = context(&client);
        let lock = hold(&ctx, "/q/coord/c/lock/e", ReservationType::LockExclusive).await;
        let permit = hold(&ctx, "/q/coord/c/semaphore/s", ReservationType::Semaphore).await;
        let admin = hold(&ctx, "/q/coord/_admin/lock/maintenance", ReservationType::LockExclusive).await;

        ReservationReaper::new(Duration::from_secs(3600))
            .perform(&ctx)
            .await
            .unwrap();
        assert!(client.exists(&lock, Watch::None).await.unwrap().is_some());

        ReservationReaper::new(Duration::ZERO)
            .perform(&ctx)
            .await
            .unwrap();
        assert!(client.exists(&lock, Watch::None).await.unwrap().is_none());
        assert!(client.exists(&permit, Watch::None).await.unwrap().is_none());
        assert!(client.exists(&admin, Watch::None).await.unwrap().is_some());
        assert_eq!(ctx.metrics().reservations_reaped.get(), 2);
    }

    #[tokio::test]
    async fn test_sweeper_removes_only_empty_entities() {
        let store = MemoryStore::new();
        let client = store.connect();
        let ctx = context(&client);
        let acl = Acl::open_unsafe();
        create_with_parents(&client, "/q/coord/c/lock/empty", b"", &acl, CreateMode::Persistent)
            .await
            .unwrap();
        hold(&ctx, "/q/coord/c/lock/busy", ReservationType::LockExclusive).await;

        EmptyEntitySweeper.perform(&ctx).await.unwrap();
        assert!(client
            .exists("/q/coord/c/lock/empty", Watch::None)
            .await
            .unwrap()
            .is_none());
        assert!(client
            .exists("/q/coord/c/lock/busy", Watch::None)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_pass_runs_tasks_under_admin_lock() {
        struct Probe(Arc<Mutex<Vec<usize>>>);

        #[async_trait]
        impl AdminTask for Probe {
            fn name(&self) -> &str {
                "probe"
            }

            async fn perform(&self, ctx: &AdminContext) -> CoordResult<()> {
                let held = ctx
                    .manager()
                    .reservation_list("/q/coord/_admin/lock/maintenance")
                    .await?;
                self.0.lock().unwrap().push(held.len());
                Ok(())
            }
        }

        let store = MemoryStore::new();
        let client = store.connect();
        let ctx = context(&client);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let runner = AdminRunner {
            ctx: ctx.clone(),
            tasks: Arc::new(Mutex::new(vec![Arc::new(Probe(seen.clone())) as Arc<dyn AdminTask>])),
            owner_id: "admin".into(),
            acl: Acl::open_unsafe(),
            interval: Duration::from_secs(60),
        };
        assert_eq!(runner.run_pass().await.unwrap(), 1);
        assert_eq!(*seen.lock().unwrap(), vec![1]);
        assert!(ctx
            .manager()
            .reservation_list("/q/coord/_admin/lock/maintenance")
            .await
            .unwrap()
            .is_empty());
        assert_eq!(ctx.manager().cache().lock_count(), 0);
        assert_eq!(ctx.metrics().admin_runs.get(), 1);
    }
}
