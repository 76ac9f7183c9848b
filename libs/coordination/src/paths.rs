//! Wire-visible path layout.
//!
//! ```text
//! {base}/coord/{cluster}/{category}/{entity}/{PREFIX}_{sequence}
//! {base}/conf/{cluster}/semaphore/{entity}
//! ```

use coord_store::path::join;

use crate::error::{CoordError, CoordResult};
use crate::reservation::{ReservationType, SEQUENCE_DELIMITER};

pub const COORD_SEGMENT: &str = "coord";
pub const CONF_SEGMENT: &str = "conf";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathScheme {
    base_path: String,
}

impl PathScheme {
    pub fn new(base_path: impl Into<String>) -> CoordResult<Self> {
        let base_path = base_path.into();
        if !base_path.starts_with('/') {
            return Err(CoordError::Config(format!(
                "base path must be absolute: {base_path:?}"
            )));
        }
        let trimmed = base_path.trim_end_matches('/');
        if trimmed.split('/').skip(1).any(str::is_empty) {
            return Err(CoordError::Config(format!(
                "base path has empty segments: {base_path:?}"
            )));
        }
        Ok(Self {
            base_path: trimmed.to_owned(),
        })
    }

    pub fn base_path(&self) -> &str {
        if self.base_path.is_empty() {
            "/"
        } else {
            &self.base_path
        }
    }

    /// `{base}/coord`
    pub fn coord_root(&self) -> String {
        join(&self.base_path, COORD_SEGMENT)
    }

    /// `{base}/coord/{cluster}/{category}`
    pub fn category_path(&self, cluster_id: &str, category: &str) -> CoordResult<String> {
        check_token("cluster id", cluster_id)?;
        Ok(join(&join(&self.coord_root(), cluster_id), category))
    }

    /// `{base}/coord/{cluster}/{category}/{entity}`
    pub fn entity_path(
        &self,
        cluster_id: &str,
        reservation_type: ReservationType,
        entity_name: &str,
    ) -> CoordResult<String> {
        check_token("entity name", entity_name)?;
        Ok(join(
            &self.category_path(cluster_id, reservation_type.category())?,
            entity_name,
        ))
    }

    /// `{base}/conf/{cluster}/{rel}`
    pub fn conf_path(&self, cluster_id: &str, rel: &str) -> CoordResult<String> {
        check_token("cluster id", cluster_id)?;
        Ok(join(&join(&join(&self.base_path, CONF_SEGMENT), cluster_id), rel))
    }

    /// Configuration node holding a semaphore's permit pool size.
    pub fn semaphore_conf_path(&self, cluster_id: &str, entity_name: &str) -> CoordResult<String> {
        check_token("entity name", entity_name)?;
        self.conf_path(
            cluster_id,
            &join(ReservationType::Semaphore.category(), entity_name),
        )
    }
}

/// Path passed to a sequential create: `{entity}/{PREFIX}_`.
pub fn reservation_prefix(entity_path: &str, reservation_type: ReservationType) -> String {
    format!(
        "{}{}",
        join(entity_path, reservation_type.prefix()),
        SEQUENCE_DELIMITER
    )
}

fn check_token(what: &str, token: &str) -> CoordResult<()> {
    if token.is_empty() || token.contains('/') {
        return Err(CoordError::Config(format!("invalid {what}: {token:?}")));
    }
    Ok(())
}
