//! Background restore of dormant sessions.

use std::sync::Arc;

use futures::future::join_all;
use tether_core::ids::SessionId;
use tracing::{debug, info, warn};

use crate::hub::{FlagGuard, HubInner};
use crate::options::ClientOptions;

/// Outcome counts of one sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub restored: usize,
    /// Already live when the sweep started.
    pub skipped: usize,
    pub failed: usize,
}

pub(crate) async fn sync_sessions(hub: &Arc<HubInner>, initiator: SessionId) -> Option<SyncReport> {
    let Some(_syncing) = FlagGuard::try_acquire(&hub.syncing) else {
        debug!(session_id = %initiator, "session sync already running");
        return None;
    };

    let ids = match hub.store.session_ids().await {
        Ok(ids) => ids,
        Err(e) => {
            warn!(error = %e, "failed to list persisted sessions");
            return Some(SyncReport::default());
        }
    };

    let mut report = SyncReport::default();
    let mut targets = Vec::new();
    for id in ids.into_iter().filter(|id| *id != initiator) {
        if hub.is_live(id) {
            report.skipped += 1;
        } else {
            targets.push(id);
        }
    }
    if targets.is_empty() {
        debug!(skipped = report.skipped, "no dormant sessions to restore");
        return Some(report);
    }

    info!(count = targets.len(), "restoring sessions in background");
    let options = ClientOptions::from_settings(&hub.config.sessions)
        .background(hub.config.sync.max_retries);
    let results = join_all(
        targets
            .iter()
            .map(|id| hub.connect(*id, options.clone())),
    )
    .await;

    for (id, result) in targets.iter().zip(results) {
        match result {
            Ok(_) => report.restored += 1,
            Err(e) => {
                report.failed += 1;
                warn!(session_id = %id, error = %e, "background restore failed");
            }
        }
    }
    info!(
        restored = report.restored,
        skipped = report.skipped,
        failed = report.failed,
        "session sync complete"
    );
    Some(report)
}
