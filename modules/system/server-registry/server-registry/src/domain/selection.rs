//! Candidate filtering shared by every backend.
//!
//! Given the live records of a scope, `select_servers`:
//! 1. keeps the first record seen for each server id,
//! 2. drops records whose host is excluded,
//! 3. picks a uniformly random subset when `max_count` truncates,
//! 4. sorts the result by server id.

use std::collections::HashSet;

use rand::seq::SliceRandom;
use server_registry_sdk::{GetServersOptions, ServerDetail};

/// Apply the `get_servers` filters to `candidates`.
#[must_use]
pub fn select_servers(
    candidates: Vec<ServerDetail>,
    options: &GetServersOptions,
) -> Vec<ServerDetail> {
    let mut seen = HashSet::with_capacity(candidates.len());
    let mut selected: Vec<ServerDetail> = candidates
        .into_iter()
        .filter(|d| seen.insert(d.server_id().to_owned()))
        .filter(|d| !options.excludes(d))
        .collect();

    if let Some(max) = options.max_count {
        if selected.len() > max {
            selected.shuffle(&mut rand::rng());
            selected.truncate(max);
        }
    }

    selected.sort_by(|a, b| a.server_id().cmp(b.server_id()));
    selected
}

/// Requested ids without duplicates, in first-seen order.
#[must_use]
pub fn dedupe_ids(server_ids: &[String]) -> Vec<&str> {
    let mut seen = HashSet::with_capacity(server_ids.len());
    server_ids
        .iter()
        .map(String::as_str)
        .filter(|id| seen.insert(*id))
        .collect()
}
