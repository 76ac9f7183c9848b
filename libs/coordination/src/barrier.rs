//! Cyclic rendezvous over ephemeral-sequential party nodes.
//!
//! Every party creates one `BR_` node under the barrier entity and waits for
//! the entity to hold exactly `parties` children. An observer on the entity
//! marks the barrier broken as soon as a previously seen party node vanishes
//! before the count is reached. Both flags are sticky until [`Barrier::reset`].
//!
//! A reset deletes the entity, so every round lives in its own generation of
//! the entity node, told apart by its creation id. Party nodes vanishing
//! along with an older generation never break the current round, and a
//! handle whose flags describe an older generation starts over on its next
//! wait.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use coord_store::path::{join, last_token};
use coord_store::{Acl, CreateMode, StoreClient, StoreError, Watch, create_with_parents};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::cache::{HandleId, next_handle_id};
use crate::error::{CoordError, CoordResult};
use crate::observer::{Observer, ObserverDispatch, ObserverId};
use crate::paths::reservation_prefix;
use crate::reservation::{ReservationPayload, ReservationType, sort_reservations};

#[derive(Debug, Default, Clone, Copy)]
struct Flags {
    broken: bool,
    conditions_met: bool,
    /// Creation id of the entity this handle last arrived at.
    generation: Option<i64>,
}

struct Shared {
    entity_path: String,
    parties: usize,
    flags: Mutex<Flags>,
    changed: Notify,
}

impl Shared {
    fn flags(&self) -> MutexGuard<'_, Flags> {
        self.flags.lock().expect("barrier state poisoned")
    }

    fn on_children(&self, updated: &[String], previous: &[String]) {
        let mut flags = self.flags();
        if !flags.conditions_met && !flags.broken {
            let current: HashSet<&String> = updated.iter().collect();
            if let Some(gone) = previous.iter().find(|c| !current.contains(c)) {
                warn!(
                    entity_path = %self.entity_path,
                    party = %gone,
                    "barrier broken: party left before the barrier tripped"
                );
                flags.broken = true;
            } else if updated.len() > self.parties {
                warn!(
                    entity_path = %self.entity_path,
                    arrived = updated.len(),
                    parties = self.parties,
                    "barrier broken: more arrivals than parties"
                );
                flags.broken = true;
            } else if updated.len() == self.parties {
                flags.conditions_met = true;
            }
        }
        trace!(
            entity_path = %self.entity_path,
            broken = flags.broken,
            conditions_met = flags.conditions_met,
            "barrier children changed"
        );
        if flags.broken || flags.conditions_met {
            drop(flags);
            self.changed.notify_waiters();
        }
    }

    fn clear(&self) {
        let mut flags = self.flags();
        flags.broken = false;
        flags.conditions_met = false;
    }
}

pub struct Barrier {
    id: HandleId,
    store: Arc<dyn StoreClient>,
    observers: Arc<ObserverDispatch>,
    owner_id: String,
    acl: Vec<Acl>,
    shared: Arc<Shared>,
    observer_id: ObserverId,
}

impl fmt::Debug for Barrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Barrier")
            .field("id", &self.id)
            .field("entity_path", &self.shared.entity_path)
            .field("parties", &self.shared.parties)
            .field("flags", &*self.shared.flags())
            .finish_non_exhaustive()
    }
}

impl Barrier {
    /// Creates a handle and starts observing the barrier entity.
    pub(crate) async fn open(
        store: Arc<dyn StoreClient>,
        observers: Arc<ObserverDispatch>,
        owner_id: impl Into<String>,
        entity_path: impl Into<String>,
        parties: usize,
        acl: Vec<Acl>,
    ) -> CoordResult<Self> {
        if parties == 0 {
            return Err(CoordError::Config("barrier needs at least one party".into()));
        }
        let owner_id = owner_id.into();
        let shared = Arc::new(Shared {
            entity_path: entity_path.into(),
            parties,
            flags: Mutex::new(Flags::default()),
            changed: Notify::new(),
        });
        let on_children = shared.clone();
        let on_created = shared.clone();
        let on_deleted = shared.clone();
        let observer = Observer::builder()
            .owner(owner_id.clone())
            .on_children_changed(move |updated, previous| on_children.on_children(updated, previous))
            .on_created(move |_, children| on_created.on_children(children, &[]))
            .on_deleted(move |_, _| on_deleted.clear())
            .build();
        let observer_id = observer.id();
        observers.put(&shared.entity_path, observer).await;
        Ok(Self {
            id: next_handle_id(),
            store,
            observers,
            owner_id,
            acl,
            shared,
            observer_id,
        })
    }

    pub fn handle_id(&self) -> HandleId {
        self.id
    }

    pub fn entity_path(&self) -> &str {
        &self.shared.entity_path
    }

    pub fn parties(&self) -> usize {
        self.shared.parties
    }

    /// True unless the barrier tripped cleanly; a barrier that is still
    /// waiting also counts. Use [`is_tripped`](Self::is_tripped) to tell the
    /// two apart.
    pub fn is_broken(&self) -> bool {
        let flags = self.shared.flags();
        flags.broken || !flags.conditions_met
    }

    /// Reflects what this handle has seen; a reset made through another
    /// handle shows up once its deletion has been observed.
    pub fn is_tripped(&self) -> bool {
        let flags = self.shared.flags();
        flags.conditions_met && !flags.broken
    }

    /// Parties currently present at the barrier.
    pub async fn number_waiting(&self) -> CoordResult<usize> {
        Ok(self.children().await?.len())
    }

    async fn children(&self) -> CoordResult<Vec<String>> {
        match self
            .store
            .get_children(&self.shared.entity_path, Watch::None)
            .await
        {
            Ok(children) => Ok(children),
            Err(err) if err.is_no_node() => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn generation(&self) -> CoordResult<Option<i64>> {
        let stat = self
            .store
            .exists(&self.shared.entity_path, Watch::None)
            .await?;
        Ok(stat.map(|stat| stat.czxid))
    }

    /// False once the entity the flags were set for has been deleted, even if
    /// it was created again since.
    async fn same_generation(&self, recorded: Option<i64>) -> CoordResult<bool> {
        match recorded {
            Some(recorded) => Ok(self.generation().await? == Some(recorded)),
            None => Ok(true),
        }
    }

    fn broken_error(&self) -> CoordError {
        CoordError::BrokenBarrier(self.shared.entity_path.clone())
    }

    fn mark_broken(&self) {
        self.shared.flags().broken = true;
        self.shared.changed.notify_waiters();
    }

    /// Waits indefinitely for all parties.
    pub async fn wait(&self) -> CoordResult<usize> {
        self.wait_for(None).await
    }

    /// Arrives at the barrier and waits up to `timeout` (`None` waits
    /// indefinitely) for the remaining parties. Returns the arrival index,
    /// `0` for the last party to arrive.
    pub async fn wait_for(&self, timeout: Option<Duration>) -> CoordResult<usize> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let flags = *self.shared.flags();
        if flags.conditions_met || flags.broken {
            if self.same_generation(flags.generation).await? {
                if flags.conditions_met {
                    return Err(CoordError::BarrierTripped(self.shared.entity_path.clone()));
                }
                return Err(self.broken_error());
            }
            debug!(entity_path = %self.shared.entity_path, "barrier was reset, starting a new round");
            self.shared.clear();
        }

        let payload = ReservationPayload::new(&self.owner_id).encode()?;
        let prefix = reservation_prefix(&self.shared.entity_path, ReservationType::Barrier);
        let ticket = create_with_parents(
            self.store.as_ref(),
            &prefix,
            &payload,
            &self.acl,
            CreateMode::EphemeralSequential,
        )
        .await?;
        let ticket_name = last_token(&ticket).to_owned();
        let generation = self.generation().await?;
        self.shared.flags().generation = generation;

        let mut children = self.children().await?;
        sort_reservations(&mut children)?;
        let Some(position) = children.iter().position(|c| *c == ticket_name) else {
            warn!(reservation_path = %ticket, "barrier node vanished right after arrival");
            self.mark_broken();
            return Err(self.broken_error());
        };
        if children.len() > self.shared.parties || position >= self.shared.parties {
            warn!(
                entity_path = %self.shared.entity_path,
                arrived = children.len(),
                parties = self.shared.parties,
                "barrier broken: more arrivals than parties"
            );
            self.mark_broken();
            return Err(self.broken_error());
        }
        let index = self.shared.parties - 1 - position;
        debug!(
            reservation_path = %ticket,
            arrived = children.len(),
            parties = self.shared.parties,
            index,
            "arrived at barrier"
        );

        if children.len() == self.shared.parties {
            let mut flags = self.shared.flags();
            if flags.broken {
                return Err(self.broken_error());
            }
            flags.conditions_met = true;
            drop(flags);
            self.shared.changed.notify_waiters();
            info!(entity_path = %self.shared.entity_path, "barrier tripped");
            return Ok(index);
        }

        loop {
            let changed = self.shared.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let flags = *self.shared.flags();
            if flags.broken {
                return Err(self.broken_error());
            }
            if flags.conditions_met {
                return Ok(index);
            }

            let timed_out = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, changed).await.is_err(),
                None => {
                    changed.await;
                    false
                }
            };
            if timed_out {
                return self.settle_after_timeout(index).await;
            }
        }
    }

    /// Final look at the party count once the wait budget is spent.
    async fn settle_after_timeout(&self, index: usize) -> CoordResult<usize> {
        let arrived = self.children().await?.len();
        let mut flags = self.shared.flags();
        if !flags.broken && (flags.conditions_met || arrived == self.shared.parties) {
            flags.conditions_met = true;
            return Ok(index);
        }
        warn!(
            entity_path = %self.shared.entity_path,
            arrived,
            parties = self.shared.parties,
            "barrier broken: timed out waiting for parties"
        );
        flags.broken = true;
        drop(flags);
        self.shared.changed.notify_waiters();
        Err(self.broken_error())
    }

    /// Deletes every party node and the entity itself, returning the barrier
    /// to its waiting state.
    pub async fn reset(&self) -> CoordResult<()> {
        for child in self.children().await? {
            let path = join(&self.shared.entity_path, &child);
            match self.store.delete(&path, None).await {
                Ok(()) => {}
                Err(StoreError::NoNode(_)) => trace!(%path, "barrier node already deleted"),
                Err(err) => return Err(err.into()),
            }
        }
        match self.store.delete(&self.shared.entity_path, None).await {
            Ok(()) | Err(StoreError::NoNode(_)) => {}
            Err(err) => return Err(err.into()),
        }
        self.observers
            .reseed(&self.shared.entity_path, self.observer_id)
            .await;
        self.shared.clear();
        info!(entity_path = %self.shared.entity_path, "barrier reset");
        Ok(())
    }

    /// Stops observing the barrier entity. Party nodes are left alone.
    pub fn destroy(&self) {
        self.observers
            .remove(&self.shared.entity_path, self.observer_id);
        debug!(entity_path = %self.shared.entity_path, "barrier destroyed");
    }
}

#[cfg(test)]
mod tests {
    use coord_store::{MemoryClient, MemoryStore};

    use super::*;
    use crate::config::ObserverConfig;
    use crate::metrics::CoordMetrics;

    const ENTITY: &str = "/q/coord/c/barrier/b";

    async fn barrier(client: &MemoryClient, owner: &str, parties: usize) -> Arc<Barrier> {
        let observers = ObserverDispatch::new(
            Arc::new(client.clone()),
            ObserverConfig::default(),
            CoordMetrics::unregistered(),
        );
        Arc::new(
            Barrier::open(
                Arc::new(client.clone()),
                observers,
                owner,
                ENTITY,
                parties,
                Acl::open_unsafe(),
            )
            .await
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_rejects_zero_parties() {
        let store = MemoryStore::new();
        let client = store.connect();
        let observers = ObserverDispatch::new(
            Arc::new(client.clone()),
            ObserverConfig::default(),
            CoordMetrics::unregistered(),
        );
        let err = Barrier::open(
            Arc::new(client),
            observers,
            "a",
            ENTITY,
            0,
            Acl::open_unsafe(),
        )
        .await
        .unwrap_err();
        assert!(err.is_config());
    }

    #[tokio::test]
    async fn test_round_trip() {
        let store = MemoryStore::new();
        let mut handles = Vec::new();
        let mut barriers = Vec::new();
        for owner in ["a", "b", "c"] {
            let b = barrier(&store.connect(), owner, 3).await;
            barriers.push(b.clone());
            handles.push(tokio::spawn(async move {
                b.wait_for(Some(Duration::from_secs(5))).await
            }));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let mut indices = Vec::new();
        for handle in handles {
            indices.push(handle.await.unwrap().unwrap());
        }
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2]);
        for b in &barriers {
            assert!(b.is_tripped());
            assert!(!b.is_broken());
        }
        // a tripped barrier needs a reset before reuse
        assert!(matches!(
            barriers[0].wait().await,
            Err(CoordError::BarrierTripped(_))
        ));
    }

    #[tokio::test]
    async fn test_party_leaving_breaks_barrier() {
        let store = MemoryStore::new();
        let client = store.connect();
        let a = barrier(&client, "a", 3).await;
        let b = barrier(&store.connect(), "b", 3).await;

        let waiting_a = {
            let a = a.clone();
            tokio::spawn(async move { a.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let waiting_b = {
            let b = b.clone();
            tokio::spawn(async move { b.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(a.number_waiting().await.unwrap(), 2);
        assert!(a.is_broken());
        assert!(!a.is_tripped());

        let mut children = client.get_children(ENTITY, Watch::None).await.unwrap();
        sort_reservations(&mut children).unwrap();
        client
            .delete(&join(ENTITY, &children[0]), None)
            .await
            .unwrap();

        for waiting in [waiting_a, waiting_b] {
            let outcome = tokio::time::timeout(Duration::from_secs(2), waiting)
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(outcome, Err(CoordError::BrokenBarrier(_))));
        }
        assert!(b.is_broken());

        b.reset().await.unwrap();
        assert!(!b.is_tripped());
        assert_eq!(b.number_waiting().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_timeout_breaks_barrier() {
        let store = MemoryStore::new();
        let a = barrier(&store.connect(), "a", 2).await;
        let err = a
            .wait_for(Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(err.is_barrier());
        assert!(a.is_broken());
        assert!(matches!(a.wait().await, Err(CoordError::BrokenBarrier(_))));
    }

    #[tokio::test]
    async fn test_single_party_trips_immediately() {
        let store = MemoryStore::new();
        let a = barrier(&store.connect(), "a", 1).await;
        assert_eq!(a.wait().await.unwrap(), 0);
        assert!(a.is_tripped());
        a.reset().await.unwrap();
        assert_eq!(a.wait().await.unwrap(), 0);
        a.destroy();
    }
}
