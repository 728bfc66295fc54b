//! Startup recovery.
//!
//! The server is crash-only: nothing is checkpointed beyond the ledger. On
//! boot, agents that went quiet while the server was down are demoted, and
//! every open campaign gets its executor back. Executors attach watchdogs to
//! runs that were in flight at crash time, which yields at-most-once
//! benchmark execution semantics.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;

use crate::state::AppState;

pub async fn recover(state: &Arc<AppState>) -> Result<()> {
    let cutoff = Utc::now()
        - chrono::Duration::from_std(state.settings.liveness_window)
            .unwrap_or(chrono::Duration::seconds(15));
    let demoted = kitt_db::mark_stale_agents_offline(&state.db, cutoff).await?;
    if demoted > 0 {
        tracing::info!("recovery: demoted {demoted} stale agent(s) to offline");
    }

    let open = kitt_db::load_open_campaigns(&state.db).await?;
    for campaign in open {
        tracing::info!(
            campaign = %campaign.id,
            status = campaign.status.as_str(),
            "recovery: resuming campaign executor"
        );
        state.executors.spawn(Arc::clone(state), &campaign.id);
    }

    Ok(())
}
