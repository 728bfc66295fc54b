//! Agent provisioning and liveness.
//!
//! Provisioning mints a 32-byte random token, stores only its SHA-256 hash
//! plus an 8-character display prefix, and returns the raw token exactly
//! once. A background sweeper demotes agents whose heartbeat has gone quiet
//! for longer than the liveness window.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use rand::RngCore;
use uuid::Uuid;

use crate::auth::hash_token;
use crate::state::AppState;

pub struct ProvisionOutcome {
    pub agent_id: String,
    pub token: String,
    pub token_prefix: String,
}

/// Create an agent record. Returns `None` on a name collision, leaving the
/// ledger untouched.
pub async fn provision(
    state: &AppState,
    name: &str,
    hostname: &str,
    port: u16,
) -> Result<Option<ProvisionOutcome>> {
    let mut entropy = [0u8; 32];
    rand::rngs::OsRng
        .try_fill_bytes(&mut entropy)
        .context("token entropy unavailable")?;
    let token = URL_SAFE_NO_PAD.encode(entropy);
    let token_prefix: String = token.chars().take(8).collect();

    let agent = kitt_db::NewAgent {
        id: Uuid::new_v4().to_string(),
        name: name.to_string(),
        hostname: hostname.to_string(),
        port: i64::from(port),
        token_hash: hash_token(&token),
        token_prefix: token_prefix.clone(),
        registered_at: Utc::now(),
    };

    if !kitt_db::insert_agent(&state.db, &agent).await? {
        return Ok(None);
    }

    tracing::info!(agent = name, prefix = %token_prefix, "agent provisioned");
    Ok(Some(ProvisionOutcome {
        agent_id: agent.id,
        token,
        token_prefix,
    }))
}

/// Spawn the background task that marks silent agents offline. Runs at a
/// fraction of the liveness window so demotion lag stays small.
pub fn spawn_liveness_sweeper(state: Arc<AppState>) {
    let window = state.settings.liveness_window;
    let period = (window / 3).max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let cutoff = Utc::now()
                - chrono::Duration::from_std(window).unwrap_or(chrono::Duration::seconds(15));
            match kitt_db::mark_stale_agents_offline(&state.db, cutoff).await {
                Ok(0) => {}
                Ok(n) => tracing::info!("liveness sweeper demoted {n} agent(s) to offline"),
                Err(e) => tracing::warn!("liveness sweep failed: {e:#}"),
            }
        }
    });
}
