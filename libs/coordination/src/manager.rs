//! Reservation manager: turns sibling ephemeral-sequential nodes into a fair
//! queue.
//!
//! An acquisition creates exactly one ticket and keeps it for the whole retry
//! loop, so queue position is fixed by the store-assigned sequence and never
//! re-issued. Each scan lists the siblings uncached, sorts them numerically
//! and applies the admission rule of the reservation type. A ticket that does
//! not qualify parks on a [`WatchRelay`] until something it depends on
//! changes, the wait budget is spent, or the relay's safety ceiling forces a
//! re-scan.

use std::sync::Arc;
use std::time::{Duration, Instant};

use coord_store::path::{join, last_token};
use coord_store::{Acl, CreateMode, StoreClient, Watch, create_with_parents};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::CoordinationCache;
use crate::config::CoordConfig;
use crate::error::{CoordError, CoordResult};
use crate::metrics::CoordMetrics;
use crate::paths::reservation_prefix;
use crate::permits::PermitPoolSize;
use crate::relay::{WaitOutcome, WatchRelay};
use crate::reservation::{ReservationPayload, ReservationType, sort_reservations};

/// Parameters of one acquisition.
#[derive(Debug, Clone, Copy)]
pub struct AcquireRequest<'a> {
    pub owner_id: &'a str,
    pub entity_path: &'a str,
    pub reservation_type: ReservationType,
    pub acl: &'a [Acl],
    /// `None` waits indefinitely; `Some(ZERO)` scans once.
    pub wait: Option<Duration>,
    pub interrupt: Option<&'a CancellationToken>,
    /// Propagate `interrupt` as [`CoordError::Interrupted`] instead of ignoring it.
    pub interruptible: bool,
}

/// Result of an acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquisition {
    /// The ticket at this path now holds the reservation.
    Acquired(String),
    /// The budget ran out (or the manager shut down) before the ticket
    /// qualified. The ticket is left in place; the caller owns its cleanup.
    TimedOut { ticket: String },
    /// No usable ticket exists: creation failed, the ticket vanished while
    /// waiting, or the store failed unexpectedly.
    Failed,
}

impl Acquisition {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Acquisition::Acquired(_))
    }

    /// Acquired reservation path, if any.
    pub fn into_path(self) -> Option<String> {
        match self {
            Acquisition::Acquired(path) => Some(path),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Admission<'a> {
    /// Lock rule: head of the queue, or shared with no exclusive ahead.
    Queue,
    /// Semaphore rule: position below the current pool size.
    Permits(&'a dyn PermitPoolSize),
}

#[derive(Debug)]
enum Scan {
    Qualified,
    /// The relay is armed; park.
    Wait,
    /// The watched predecessor vanished between listing and arming.
    Rescan,
    TicketLost,
}

pub struct ReservationManager {
    store: Arc<dyn StoreClient>,
    cache: Arc<CoordinationCache>,
    metrics: CoordMetrics,
    relay_ceiling: Duration,
    transient_retry: Duration,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for ReservationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationManager")
            .field("session", &self.store.session_id())
            .field("relay_ceiling", &self.relay_ceiling)
            .field("shut_down", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl ReservationManager {
    pub fn new(
        store: Arc<dyn StoreClient>,
        cache: Arc<CoordinationCache>,
        config: &CoordConfig,
        metrics: CoordMetrics,
    ) -> Self {
        Self {
            store,
            cache,
            metrics,
            relay_ceiling: config.relay_ceiling(),
            transient_retry: config.transient_retry(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn StoreClient> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<CoordinationCache> {
        &self.cache
    }

    pub fn metrics(&self) -> &CoordMetrics {
        &self.metrics
    }

    /// Acquires a lock-style reservation (queue admission).
    ///
    /// An unsuccessful attempt leaves its ticket in place for the caller:
    /// [`Acquisition::TimedOut`] carries it for a later relinquish. The one
    /// exception is an interrupted interruptible request, whose ticket is
    /// deleted here before [`CoordError::Interrupted`] is returned, because
    /// the error gives the caller no ticket to relinquish.
    pub async fn acquire(&self, req: &AcquireRequest<'_>) -> CoordResult<Acquisition> {
        self.acquire_with(req, Admission::Queue).await
    }

    /// Acquires a semaphore permit, admitting the ticket while its queue
    /// position is below `pool.get()` (re-read on every scan). Tickets are
    /// left or removed as in [`acquire`](Self::acquire).
    pub async fn acquire_permit(
        &self,
        req: &AcquireRequest<'_>,
        pool: &dyn PermitPoolSize,
    ) -> CoordResult<Acquisition> {
        self.acquire_with(req, Admission::Permits(pool)).await
    }

    async fn acquire_with(
        &self,
        req: &AcquireRequest<'_>,
        admission: Admission<'_>,
    ) -> CoordResult<Acquisition> {
        let started = Instant::now();
        let deadline = req.wait.map(|wait| started + wait);
        let payload = ReservationPayload::new(req.owner_id).encode()?;
        let prefix = reservation_prefix(req.entity_path, req.reservation_type);

        let ticket = match create_with_parents(
            self.store.as_ref(),
            &prefix,
            &payload,
            req.acl,
            CreateMode::EphemeralSequential,
        )
        .await
        {
            Ok(ticket) => ticket,
            Err(err) => {
                error!(
                    owner_id = req.owner_id,
                    entity_path = req.entity_path,
                    reservation_type = %req.reservation_type,
                    error = %err,
                    "could not create reservation ticket"
                );
                self.metrics.acquire_failed(req.reservation_type);
                return Ok(Acquisition::Failed);
            }
        };
        let ticket_name = last_token(&ticket).to_owned();
        debug!(
            owner_id = req.owner_id,
            reservation_path = %ticket,
            reservation_type = %req.reservation_type,
            "reservation ticket created"
        );

        let relay = WatchRelay::new(req.entity_path, self.relay_ceiling, self.metrics.clone());
        let mut interrupt = req.interrupt;
        let outcome = loop {
            if self.shutdown.is_cancelled() {
                debug!(reservation_path = %ticket, "manager shut down, abandoning attempt");
                break Acquisition::TimedOut {
                    ticket: ticket.clone(),
                };
            }

            let scan = match admission {
                Admission::Queue => self.scan_queue(req, &ticket_name, &relay).await,
                Admission::Permits(pool) => {
                    self.scan_permits(req, &ticket_name, &relay, pool.get())
                        .await
                }
            };

            match scan {
                Ok(Scan::Qualified) => break self.confirm(req, &ticket).await,
                Ok(Scan::Rescan) => continue,
                Ok(Scan::TicketLost) => {
                    warn!(
                        owner_id = req.owner_id,
                        reservation_path = %ticket,
                        "reservation ticket vanished while waiting"
                    );
                    break Acquisition::Failed;
                }
                Ok(Scan::Wait) => {
                    let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
                    info!(
                        owner_id = req.owner_id,
                        reservation_path = %ticket,
                        ?remaining,
                        "waiting for reservation"
                    );
                    match relay
                        .wait_for_event(remaining, interrupt, &self.shutdown)
                        .await
                    {
                        WaitOutcome::Notified | WaitOutcome::TimedOut | WaitOutcome::ShutDown => {}
                        WaitOutcome::Interrupted if req.interruptible => {
                            relay.destroy();
                            self.abandon_interrupted(&ticket).await;
                            return Err(CoordError::Interrupted(req.entity_path.to_owned()));
                        }
                        WaitOutcome::Interrupted => {
                            warn!(
                                owner_id = req.owner_id,
                                reservation_path = %ticket,
                                "ignoring interrupt on uninterruptible acquire"
                            );
                            interrupt = None;
                        }
                    }
                }
                Err(CoordError::Store(err)) if err.is_transient() => {
                    warn!(
                        reservation_path = %ticket,
                        error = %err,
                        "transient store error while scanning, retrying"
                    );
                    let pause = deadline
                        .map(|d| d.saturating_duration_since(Instant::now()))
                        .map_or(self.transient_retry, |r| r.min(self.transient_retry));
                    tokio::select! {
                        _ = self.shutdown.cancelled() => {}
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
                Err(CoordError::Store(err)) => {
                    error!(
                        reservation_path = %ticket,
                        error = %err,
                        "store error while acquiring"
                    );
                    break Acquisition::Failed;
                }
                Err(err) => {
                    relay.destroy();
                    return Err(err);
                }
            }

            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                break Acquisition::TimedOut {
                    ticket: ticket.clone(),
                };
            }
        };
        relay.destroy();

        match &outcome {
            Acquisition::Acquired(path) => {
                let elapsed = started.elapsed();
                self.metrics
                    .acquired(req.reservation_type, elapsed.as_secs_f64());
                info!(
                    owner_id = req.owner_id,
                    reservation_path = %path,
                    reservation_type = %req.reservation_type,
                    ?elapsed,
                    "reservation acquired"
                );
            }
            Acquisition::TimedOut { ticket } => {
                self.metrics.acquire_failed(req.reservation_type);
                info!(
                    owner_id = req.owner_id,
                    reservation_path = %ticket,
                    reservation_type = %req.reservation_type,
                    "could not acquire within budget"
                );
            }
            Acquisition::Failed => {
                self.metrics.acquire_failed(req.reservation_type);
                info!(
                    owner_id = req.owner_id,
                    entity_path = req.entity_path,
                    reservation_type = %req.reservation_type,
                    "could not acquire"
                );
            }
        }
        Ok(outcome)
    }

    async fn scan_queue(
        &self,
        req: &AcquireRequest<'_>,
        ticket_name: &str,
        relay: &WatchRelay,
    ) -> CoordResult<Scan> {
        let mut children = match self.store.get_children(req.entity_path, Watch::None).await {
            Ok(children) => children,
            Err(err) if err.is_no_node() => return Ok(Scan::TicketLost),
            Err(err) => return Err(err.into()),
        };
        sort_reservations(&mut children)?;
        let Some(position) = children.iter().position(|c| c == ticket_name) else {
            return Ok(Scan::TicketLost);
        };

        let last_exclusive_ahead = children[..position]
            .iter()
            .rposition(|c| ReservationType::LockExclusive.matches(c));
        let qualified = position == 0
            || (!req.reservation_type.is_exclusive() && last_exclusive_ahead.is_none());
        if qualified {
            return Ok(Scan::Qualified);
        }

        // an exclusive ticket waits on its immediate predecessor; a shared one
        // on the nearest exclusive ahead, since only that can release it
        let watch_index = match last_exclusive_ahead {
            Some(idx) if !req.reservation_type.is_exclusive() => idx,
            _ => position - 1,
        };
        let watch_path = join(req.entity_path, &children[watch_index]);
        debug!(
            reservation_path = %join(req.entity_path, ticket_name),
            watch_path = %watch_path,
            position,
            "not qualified, arming relay on predecessor"
        );
        match relay.arm_exists(self.store.as_ref(), &watch_path).await? {
            Some(_) => Ok(Scan::Wait),
            None => Ok(Scan::Rescan),
        }
    }

    async fn scan_permits(
        &self,
        req: &AcquireRequest<'_>,
        ticket_name: &str,
        relay: &WatchRelay,
        limit: usize,
    ) -> CoordResult<Scan> {
        // admission depends on the whole list, so the relay watches all of it
        let mut children = match relay.arm_children(self.store.as_ref(), req.entity_path).await {
            Ok(children) => children,
            Err(err) if err.is_no_node() => return Ok(Scan::TicketLost),
            Err(err) => return Err(err.into()),
        };
        sort_reservations(&mut children)?;
        let Some(position) = children.iter().position(|c| c == ticket_name) else {
            return Ok(Scan::TicketLost);
        };
        let exclusive_ahead = children[..position]
            .iter()
            .any(|c| ReservationType::LockExclusive.matches(c));
        if !exclusive_ahead && position < limit {
            return Ok(Scan::Qualified);
        }
        debug!(
            reservation_path = %join(req.entity_path, ticket_name),
            position,
            limit,
            "no permit available, arming relay on entity"
        );
        Ok(Scan::Wait)
    }

    /// Arms the existence watch on a freshly qualified ticket so its later
    /// deletion reaches the observer dispatch.
    async fn confirm(&self, req: &AcquireRequest<'_>, ticket: &str) -> Acquisition {
        match self.store.exists(ticket, Watch::Default).await {
            Ok(Some(_)) => Acquisition::Acquired(ticket.to_owned()),
            Ok(None) => {
                warn!(
                    owner_id = req.owner_id,
                    reservation_path = ticket,
                    "reservation vanished right after qualifying"
                );
                Acquisition::Failed
            }
            Err(err) => {
                warn!(
                    reservation_path = ticket,
                    error = %err,
                    "could not arm existence watch on acquired reservation"
                );
                Acquisition::Acquired(ticket.to_owned())
            }
        }
    }

    async fn abandon_interrupted(&self, ticket: &str) {
        if let Err(err) = self.relinquish(ticket).await {
            warn!(
                reservation_path = ticket,
                error = %err,
                "could not remove ticket of interrupted acquire"
            );
        }
    }

    /// Deletes a reservation node regardless of version.
    ///
    /// An already absent node counts as released. An empty path returns
    /// `false`. Every other store failure is returned to the caller.
    pub async fn relinquish(&self, reservation_path: &str) -> CoordResult<bool> {
        if reservation_path.is_empty() {
            return Ok(false);
        }
        match self.store.delete(reservation_path, None).await {
            Ok(()) => {
                self.metrics.relinquished.inc();
                info!(reservation_path, "reservation relinquished");
                Ok(true)
            }
            Err(err) if err.is_no_node() => {
                debug!(reservation_path, "reservation already gone");
                Ok(true)
            }
            Err(err) => {
                error!(reservation_path, error = %err, "could not relinquish reservation");
                Err(err.into())
            }
        }
    }

    /// Current reservation node names under an entity; absent entity is empty.
    pub async fn reservation_list(&self, entity_path: &str) -> CoordResult<Vec<String>> {
        match self.store.get_children(entity_path, Watch::None).await {
            Ok(children) => Ok(children),
            Err(err) if err.is_no_node() => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    /// [`reservation_list`](Self::reservation_list) in queue order.
    pub async fn sorted_reservation_list(&self, entity_path: &str) -> CoordResult<Vec<String>> {
        let mut children = self.reservation_list(entity_path).await?;
        sort_reservations(&mut children)?;
        Ok(children)
    }

    /// Wakes every waiting attempt and makes further attempts give up.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("reservation manager shutting down");
            self.shutdown.cancel();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }
}
