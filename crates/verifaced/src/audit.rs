//! Best-effort audit sink.
//!
//! The decision returned to the caller is already final when the audit write
//! happens; a storage failure here is an operational problem, not a reason
//! to fail the attempt. Every error is logged and swallowed.

use crate::store::{AuditLogEntry, AuthStore};

#[derive(Clone)]
pub struct AuditSink {
    store: AuthStore,
}

impl AuditSink {
    pub fn new(store: AuthStore) -> Self {
        Self { store }
    }

    /// Append one audit row. Infallible by contract.
    pub async fn record(&self, entry: AuditLogEntry) {
        if let Err(e) = self.store.append_auth_log(&entry).await {
            tracing::error!(
                error = %e,
                user_id = ?entry.user_id,
                decision = entry.decision.as_str(),
                "audit log write failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LogDecision;
    use std::path::Path;

    #[tokio::test]
    async fn record_appends_a_row() {
        let store = AuthStore::open(Path::new(":memory:")).await.unwrap();
        let sink = AuditSink::new(store.clone());

        sink.record(AuditLogEntry {
            decision: LogDecision::Enroll,
            at: 42,
            ..Default::default()
        })
        .await;

        let rows = store.export_logs(None, None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].decision.as_deref(), Some("ENROLL"));
    }
}
