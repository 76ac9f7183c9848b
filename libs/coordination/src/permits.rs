//! Permit pool sizes: the admission bound of a semaphore entity.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use coord_store::{Acl, CreateMode, StoreClient, StoreError, Watch, create_with_parents};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{CoordError, CoordResult};
use crate::observer::{Observer, ObserverDispatch, ObserverId};

/// Source of the current permit bound. Implementations are shared by every
/// local semaphore handle of an entity.
pub trait PermitPoolSize: Send + Sync + fmt::Debug {
    /// Current bound; always at least 1.
    fn get(&self) -> usize;

    /// Implementation name, used to detect conflicting registrations.
    fn kind(&self) -> &'static str;

    /// Called when the last local semaphore of the entity is destroyed.
    fn close(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstantPermitPoolSize(NonZeroUsize);

impl ConstantPermitPoolSize {
    pub const KIND: &'static str = "constant";

    pub fn new(size: usize) -> CoordResult<Self> {
        NonZeroUsize::new(size)
            .map(Self)
            .ok_or_else(|| CoordError::Config("permit pool size must be >= 1".into()))
    }
}

impl PermitPoolSize for ConstantPermitPoolSize {
    fn get(&self) -> usize {
        self.0.get()
    }

    fn kind(&self) -> &'static str {
        Self::KIND
    }
}

/// Configuration document stored at a semaphore's conf path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermitPoolConf {
    pub permit_pool_size: String,
}

impl PermitPoolConf {
    pub fn new(size: usize) -> Self {
        Self {
            permit_pool_size: size.to_string(),
        }
    }

    pub fn encode(&self) -> CoordResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes and validates a size document.
    pub fn decode_size(bytes: &[u8]) -> CoordResult<usize> {
        let conf: PermitPoolConf = serde_json::from_slice(bytes)?;
        match conf.permit_pool_size.trim().parse::<usize>() {
            Ok(size) if size >= 1 => Ok(size),
            _ => Err(CoordError::Config(format!(
                "invalid permit pool size {:?}",
                conf.permit_pool_size
            ))),
        }
    }
}

/// Pool size backed by a watched configuration node.
pub struct ConfiguredPermitPoolSize {
    conf_path: String,
    size: AtomicUsize,
    observer_id: ObserverId,
    observers: Weak<ObserverDispatch>,
}

impl fmt::Debug for ConfiguredPermitPoolSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfiguredPermitPoolSize")
            .field("conf_path", &self.conf_path)
            .field("size", &self.get())
            .finish()
    }
}

impl ConfiguredPermitPoolSize {
    pub const KIND: &'static str = "configured";

    /// Reads the size at `conf_path` and starts following its changes.
    ///
    /// When the node is missing and `create_if_necessary` is set, `desired`
    /// is written first; otherwise a missing node is a configuration error.
    pub async fn initialize(
        store: &dyn StoreClient,
        observers: &Arc<ObserverDispatch>,
        conf_path: &str,
        desired: Option<usize>,
        create_if_necessary: bool,
        acl: &[Acl],
    ) -> CoordResult<Arc<Self>> {
        let size = match store.get_data(conf_path, Watch::None).await {
            Ok((bytes, _)) => PermitPoolConf::decode_size(&bytes)?,
            Err(err) if err.is_no_node() => {
                let Some(desired) = desired.filter(|_| create_if_necessary) else {
                    return Err(CoordError::Config(format!(
                        "no permit pool size configured at {conf_path}"
                    )));
                };
                Self::create_conf(store, conf_path, desired, acl).await?
            }
            Err(err) => return Err(err.into()),
        };

        let mut registration = None;
        let pool = Arc::new_cyclic(|weak: &Weak<ConfiguredPermitPoolSize>| {
            let weak = weak.clone();
            let observer = Observer::builder()
                .on_data_changed(move |updated, _| {
                    if let Some(pool) = weak.upgrade() {
                        pool.update(updated);
                    }
                })
                .build();
            let observer_id = observer.id();
            registration = Some(observer);
            Self {
                conf_path: conf_path.to_owned(),
                size: AtomicUsize::new(size),
                observer_id,
                observers: Arc::downgrade(observers),
            }
        });
        if let Some(observer) = registration {
            observers.put(conf_path, observer.clone()).await;
            // the seed read may be newer than the initial one
            if let Some(bytes) = observer.snapshot().data {
                pool.update(&bytes);
            }
        }
        info!(conf_path, size, "following configured permit pool size");
        Ok(pool)
    }

    async fn create_conf(
        store: &dyn StoreClient,
        conf_path: &str,
        desired: usize,
        acl: &[Acl],
    ) -> CoordResult<usize> {
        ConstantPermitPoolSize::new(desired)?;
        let bytes = PermitPoolConf::new(desired).encode()?;
        match create_with_parents(store, conf_path, &bytes, acl, CreateMode::Persistent).await {
            Ok(_) => {
                info!(conf_path, size = desired, "permit pool size configured");
                Ok(desired)
            }
            Err(StoreError::NodeExists(_)) => {
                let (bytes, _) = store.get_data(conf_path, Watch::None).await?;
                PermitPoolConf::decode_size(&bytes)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Writes a new size to the configuration node, creating it if needed.
    pub async fn write_conf(
        store: &dyn StoreClient,
        conf_path: &str,
        size: usize,
        acl: &[Acl],
    ) -> CoordResult<()> {
        ConstantPermitPoolSize::new(size)?;
        let bytes = PermitPoolConf::new(size).encode()?;
        match store.set_data(conf_path, &bytes, None).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_no_node() => {
                match create_with_parents(store, conf_path, &bytes, acl, CreateMode::Persistent)
                    .await
                {
                    Ok(_) => Ok(()),
                    Err(StoreError::NodeExists(_)) => {
                        store.set_data(conf_path, &bytes, None).await?;
                        Ok(())
                    }
                    Err(err) => Err(err.into()),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    fn update(&self, bytes: &[u8]) {
        match PermitPoolConf::decode_size(bytes) {
            Ok(size) => {
                let previous = self.size.swap(size, Ordering::SeqCst);
                if previous != size {
                    info!(conf_path = %self.conf_path, previous, size, "permit pool size changed");
                }
            }
            Err(err) => {
                warn!(
                    conf_path = %self.conf_path,
                    error = %err,
                    "ignoring invalid permit pool size update"
                );
            }
        }
    }

    pub fn conf_path(&self) -> &str {
        &self.conf_path
    }

    pub fn observer_id(&self) -> ObserverId {
        self.observer_id
    }
}

impl PermitPoolSize for ConfiguredPermitPoolSize {
    fn get(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    fn kind(&self) -> &'static str {
        Self::KIND
    }

    /// Stops following the configuration node.
    fn close(&self) {
        if let Some(observers) = self.observers.upgrade() {
            observers.remove(&self.conf_path, self.observer_id);
        }
    }
}
