//! Join protocol: fetch a full snapshot from a seed tracker and install it
//! locally before the server starts accepting traffic.
//!
//! Tries each candidate in turn, POSTing an empty `/new_tracker` body; the
//! first to answer with a parseable `{success:true, data:<base64>}` wins,
//! and every other failure mode (network error, non-OK status, non-JSON
//! body, `success:false`, bad base64) just advances to the next candidate.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use thiserror::Error;
use tracker_store::Store;
use tracker_types::Tracker;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("no tracker candidates available to bootstrap from")]
    NoCandidates,
    #[error("no candidate tracker accepted the join request")]
    NoCandidateSucceeded,
    #[error("store error: {0}")]
    Store(#[from] tracker_store::StoreError),
}

/// Which candidates to try, resolved from `--initial-tracker` and the
/// current (possibly empty) local tracker set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seed {
    /// `--initial-tracker none`, or no flag and an empty tracker set:
    /// proceed standalone with whatever DB already exists.
    Standalone,
    /// No flag, but the tracker set is already populated: try each known
    /// sibling until one serves.
    KnownTrackers,
    /// `--initial-tracker <ip>`: try only that one.
    Explicit(String),
}

pub fn resolve_seed(initial_tracker: Option<&str>, store: &Store) -> Result<Seed, BootstrapError> {
    match initial_tracker {
        Some("none") => Ok(Seed::Standalone),
        Some(ip) => Ok(Seed::Explicit(ip.to_string())),
        None => {
            let known = store.list_trackers()?;
            if known.is_empty() {
                Ok(Seed::Standalone)
            } else {
                Ok(Seed::KnownTrackers)
            }
        }
    }
}

/// Attempts to join via `seed`, restoring the winning candidate's snapshot
/// into `store` and recording that candidate as a sibling. A no-op for
/// [`Seed::Standalone`].
pub async fn bootstrap(store: &Store, seed: Seed, port: u16) -> Result<(), BootstrapError> {
    let candidates = match seed {
        Seed::Standalone => return Ok(()),
        Seed::Explicit(ip) => vec![ip],
        Seed::KnownTrackers => store.list_trackers()?.into_iter().map(|t| t.ip).collect(),
    };

    if candidates.is_empty() {
        return Err(BootstrapError::NoCandidates);
    }

    let client = reqwest::Client::new();
    for ip in candidates {
        match join_via(&client, &ip, port).await {
            Ok(dump) => {
                store.restore(&dump)?;
                store.create_tracker(&Tracker { ip: ip.clone() })?;
                tracing::info!(tracker = %ip, "bootstrap joined via candidate");
                return Ok(());
            }
            Err(error) => {
                tracing::warn!(tracker = %ip, %error, "bootstrap candidate failed, trying next");
            }
        }
    }

    Err(BootstrapError::NoCandidateSucceeded)
}

#[derive(Debug, Error)]
enum JoinError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("non-OK status")]
    NonOk,
    #[error("response was not valid JSON")]
    NonJson,
    #[error("candidate reported success:false")]
    RemoteFailure,
    #[error("response had no usable data field")]
    BadPayload,
}

async fn join_via(client: &reqwest::Client, ip: &str, port: u16) -> Result<tracker_types::DatabaseDump, JoinError> {
    let url = format!("http://{ip}:{port}/new_tracker");
    let response = client.post(&url).json(&serde_json::json!({})).send().await?;

    if !response.status().is_success() {
        return Err(JoinError::NonOk);
    }

    let body: serde_json::Value = response.json().await.map_err(|_| JoinError::NonJson)?;

    if !body.get("success").and_then(|v| v.as_bool()).unwrap_or(false) {
        return Err(JoinError::RemoteFailure);
    }

    let data = body.get("data").and_then(|v| v.as_str()).ok_or(JoinError::BadPayload)?;
    let bytes = BASE64.decode(data).map_err(|_| JoinError::BadPayload)?;
    bincode::deserialize(&bytes).map_err(|_| JoinError::BadPayload)
}
