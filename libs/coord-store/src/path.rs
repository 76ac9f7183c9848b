//! Path helpers shared by store implementations and their callers.

use tracing::debug;

use crate::{Acl, CreateMode, StoreClient, StoreError, StoreResult};

/// Separator between path tokens.
pub const SEPARATOR: char = '/';

/// Number of attempts `create_with_parents` makes before giving up when the
/// parent chain keeps disappearing underneath it.
const CREATE_PARENTS_ATTEMPTS: usize = 5;

/// Joins two path fragments with exactly one separator between them.
pub fn join(base: &str, rel: &str) -> String {
    let base = base.trim_end_matches(SEPARATOR);
    let rel = rel.trim_start_matches(SEPARATOR);
    if rel.is_empty() {
        if base.is_empty() {
            return SEPARATOR.to_string();
        }
        return base.to_owned();
    }
    format!("{base}{SEPARATOR}{rel}")
}

/// Parent of an absolute path; `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind(SEPARATOR) {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last token of a path (the node name).
pub fn last_token(path: &str) -> &str {
    path.rsplit(SEPARATOR).next().unwrap_or(path)
}

/// Validates an absolute node path.
pub fn validate(path: &str) -> StoreResult<()> {
    if path == "/" {
        return Ok(());
    }
    if !path.starts_with(SEPARATOR) || path.ends_with(SEPARATOR) {
        return Err(StoreError::InvalidPath(path.to_owned()));
    }
    if path[1..].split(SEPARATOR).any(|token| token.is_empty()) {
        return Err(StoreError::InvalidPath(path.to_owned()));
    }
    Ok(())
}

/// Creates `path`, first creating any missing ancestors as persistent nodes.
///
/// Ancestors created concurrently by someone else are fine; if an ancestor
/// vanishes between creating it and creating the child the whole chain is
/// retried.
pub async fn create_with_parents(
    store: &dyn StoreClient,
    path: &str,
    data: &[u8],
    acl: &[Acl],
    mode: CreateMode,
) -> StoreResult<String> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match store.create(path, data, acl, mode).await {
            Err(StoreError::NoNode(_)) if attempt < CREATE_PARENTS_ATTEMPTS => {
                if let Some(parent) = parent(path) {
                    debug!(path, parent, attempt, "creating missing parents");
                    ensure_path(store, parent, acl).await?;
                }
            }
            other => return other,
        }
    }
}

/// Makes sure every node along `path` exists as a persistent node.
pub async fn ensure_path(store: &dyn StoreClient, path: &str, acl: &[Acl]) -> StoreResult<()> {
    validate(path)?;
    let mut current = String::new();
    for token in path.split(SEPARATOR).filter(|t| !t.is_empty()) {
        current.push(SEPARATOR);
        current.push_str(token);
        match store.create(&current, &[], acl, CreateMode::Persistent).await {
            Ok(_) | Err(StoreError::NodeExists(_)) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}
