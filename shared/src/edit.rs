use std::time::Duration;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, instrument, warn};

use crate::capabilities::{AuthGate, RemoteWriter};
use crate::debounce::Debouncer;
use crate::error::SyncError;
use crate::model::{DocumentPatch, FieldName, Fields, RecordId};

/// How a patch is persisted: a partial update, then one merge-write fallback,
/// then optionally a few more merge attempts with backoff for retryable
/// failures.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WritePolicy {
    pub extra_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self {
            extra_retries: 0,
            base_backoff_ms: 500,
            max_backoff_ms: 5_000,
        }
    }
}

impl WritePolicy {
    const MAX_EXTRA_RETRIES: u32 = 8;

    pub fn validate(&self) -> Result<(), String> {
        if self.extra_retries > Self::MAX_EXTRA_RETRIES {
            return Err(format!(
                "extra_retries must be <= {}",
                Self::MAX_EXTRA_RETRIES
            ));
        }
        if self.extra_retries > 0 && self.base_backoff_ms == 0 {
            return Err("base_backoff_ms must be > 0 when retrying".into());
        }
        if self.max_backoff_ms < self.base_backoff_ms {
            return Err("max_backoff_ms must be >= base_backoff_ms".into());
        }
        Ok(())
    }

    /// Exponential backoff capped at `max_backoff_ms`, plus up to 50% jitter.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        use rand::Rng;
        let exponent = retry.min(16);
        let base_delay = self.base_backoff_ms.saturating_mul(1u64 << exponent);
        let capped_delay = base_delay.min(self.max_backoff_ms);
        let jitter = rand::thread_rng().gen_range(0..=capped_delay / 2);
        Duration::from_millis(capped_delay.saturating_add(jitter))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteReport {
    pub fallback_used: bool,
    pub attempts: u32,
}

/// Persists `patch` for `id` following `policy`.
///
/// A failed partial update is logged as a [`SyncError::WriteFailure`] and
/// followed by the merge fallback; only when that fails too does the caller
/// see [`SyncError::PersistFailure`].
#[instrument(skip(writer, auth, patch, policy), fields(record = %id, fields = patch.fields.len()))]
pub async fn persist_patch(
    writer: &dyn RemoteWriter,
    auth: &dyn AuthGate,
    id: &RecordId,
    patch: &DocumentPatch,
    policy: &WritePolicy,
) -> Result<WriteReport, SyncError> {
    auth.ensure_identity().await.map_err(SyncError::Auth)?;

    counter!("edit.write.partial").increment(1);
    let partial = match writer.partial_update(id, patch).await {
        Ok(()) => {
            return Ok(WriteReport {
                fallback_used: false,
                attempts: 1,
            })
        }
        Err(e) => e,
    };

    let failure = SyncError::WriteFailure {
        record: id.clone(),
        source: partial.clone(),
    };
    warn!(error = %failure, "partial update failed, falling back to merge write");
    counter!("edit.write.fallback").increment(1);

    let mut retry = 0;
    let merge = loop {
        match writer.merge_write(id, patch).await {
            Ok(()) => {
                return Ok(WriteReport {
                    fallback_used: true,
                    attempts: retry + 2,
                })
            }
            Err(e) if retry < policy.extra_retries && e.is_retryable() => {
                let delay = policy.backoff_delay(retry);
                debug!(retry, delay_ms = delay.as_millis() as u64, error = %e, "merge write retry");
                tokio::time::sleep(delay).await;
                retry += 1;
            }
            Err(e) => break e,
        }
    };

    counter!("edit.write.failed").increment(1);
    let err = SyncError::PersistFailure {
        record: id.clone(),
        partial,
        merge,
    };
    error!(error = %err, "write abandoned");
    Err(err)
}

/// One debounced field write that is due.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldWrite {
    pub record: RecordId,
    pub field: FieldName,
    pub value: String,
}

type EditKey = (RecordId, FieldName);

/// Collapses bursts of row edits into one write per (record, field) and
/// remembers the values that are not yet confirmed.
#[derive(Debug)]
pub struct EditController {
    debouncer: Debouncer<EditKey, String>,
}

impl EditController {
    pub fn new(window: Duration) -> Self {
        Self {
            debouncer: Debouncer::new(window),
        }
    }

    pub fn on_field_change(
        &mut self,
        record: RecordId,
        field: FieldName,
        value: impl Into<String>,
        now: Instant,
    ) {
        self.debouncer.schedule((record, field), value.into(), now);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.debouncer.next_deadline()
    }

    pub fn take_due(&mut self, now: Instant) -> Vec<FieldWrite> {
        self.debouncer
            .take_due(now)
            .into_iter()
            .map(|((record, field), value)| FieldWrite {
                record,
                field,
                value,
            })
            .collect()
    }

    /// Called when the write for (`record`, `field`) returned, either way.
    pub fn complete(&mut self, record: &RecordId, field: FieldName) -> Option<String> {
        self.debouncer.complete(&(record.clone(), field))
    }

    pub fn is_dirty(&self, record: &RecordId, field: FieldName) -> bool {
        self.debouncer.latest(&(record.clone(), field)).is_some()
    }

    /// Latest unconfirmed value of every dirty field of `record`.
    pub fn dirty_overlay(&self, record: &RecordId) -> Fields {
        self.debouncer
            .iter_latest()
            .filter(|((id, _), _)| id == record)
            .map(|((_, field), value)| (*field, value.clone()))
            .collect()
    }

    /// Drops edits for `record` that have not fired yet.
    pub fn drop_record(&mut self, record: &RecordId) -> usize {
        self.debouncer.discard_pending(|(id, _)| id == record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::memory::{InMemoryCollection, StaticAuth, WriteOp};
    use crate::model::UnixTimeMs;
    use serde_json::json;

    const WINDOW: Duration = Duration::from_millis(300);

    fn patch(field: FieldName, value: &str) -> DocumentPatch {
        DocumentPatch::fields(Fields::new().with(field, value), UnixTimeMs(1))
    }

    #[test]
    fn overlay_tracks_pending_and_in_flight_values() {
        let start = Instant::now();
        let id = RecordId::new("r1");
        let mut edits = EditController::new(WINDOW);

        edits.on_field_change(id.clone(), FieldName::Cost, "1", start);
        edits.on_field_change(id.clone(), FieldName::Cost, "12", start + Duration::from_millis(50));
        assert_eq!(edits.dirty_overlay(&id).value(FieldName::Cost), "12");

        let due = edits.take_due(start + Duration::from_millis(350));
        assert_eq!(
            due,
            vec![FieldWrite {
                record: id.clone(),
                field: FieldName::Cost,
                value: "12".into()
            }]
        );
        assert!(edits.is_dirty(&id, FieldName::Cost));

        assert_eq!(edits.complete(&id, FieldName::Cost).as_deref(), Some("12"));
        assert!(!edits.is_dirty(&id, FieldName::Cost));
        assert!(edits.dirty_overlay(&id).is_empty());
    }

    #[test]
    fn dropping_a_record_keeps_other_records() {
        let now = Instant::now();
        let mut edits = EditController::new(WINDOW);
        edits.on_field_change(RecordId::new("a"), FieldName::Note, "x", now);
        edits.on_field_change(RecordId::new("b"), FieldName::Note, "y", now);

        assert_eq!(edits.drop_record(&RecordId::new("a")), 1);
        let due = edits.take_due(now + WINDOW);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].record, RecordId::new("b"));
    }

    #[test]
    fn policy_validation() {
        assert!(WritePolicy::default().validate().is_ok());
        let bad = WritePolicy {
            extra_retries: 2,
            base_backoff_ms: 0,
            max_backoff_ms: 0,
        };
        assert!(bad.validate().is_err());
        let inverted = WritePolicy {
            extra_retries: 0,
            base_backoff_ms: 10,
            max_backoff_ms: 5,
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn backoff_is_capped() {
        let policy = WritePolicy {
            extra_retries: 3,
            base_backoff_ms: 100,
            max_backoff_ms: 400,
        };
        for retry in 0..10 {
            assert!(policy.backoff_delay(retry) <= Duration::from_millis(600));
        }
        assert!(policy.backoff_delay(0) >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn partial_update_succeeds_for_existing_document() {
        let collection = InMemoryCollection::with_documents([("r1", json!({ "cost": "1" }))]);
        let auth = StaticAuth::signed_in("u1");
        let id = RecordId::new("r1");

        let report = persist_patch(
            &collection,
            &auth,
            &id,
            &patch(FieldName::Cost, "2"),
            &WritePolicy::default(),
        )
        .await
        .unwrap();

        assert!(!report.fallback_used);
        assert_eq!(collection.write_count(WriteOp::Merge), 0);
        assert_eq!(collection.document(&id).unwrap()["cost"], json!("2"));
    }

    #[tokio::test]
    async fn missing_document_falls_back_to_merge_write() {
        let collection = InMemoryCollection::new();
        let auth = StaticAuth::signed_in("u1");
        let id = RecordId::new("fresh");

        let report = persist_patch(
            &collection,
            &auth,
            &id,
            &patch(FieldName::Note, "hello"),
            &WritePolicy::default(),
        )
        .await
        .unwrap();

        assert!(report.fallback_used);
        assert_eq!(report.attempts, 2);
        assert_eq!(collection.write_count(WriteOp::Partial), 1);
        assert_eq!(collection.write_count(WriteOp::Merge), 1);
        assert_eq!(collection.document(&id).unwrap()["note"], json!("hello"));
    }

    #[tokio::test]
    async fn double_failure_surfaces_persist_failure() {
        let collection = InMemoryCollection::with_documents([("r1", json!({}))]);
        collection.fail_next_partial_updates(1);
        collection.fail_next_merge_writes(1);
        let auth = StaticAuth::signed_in("u1");

        let err = persist_patch(
            &collection,
            &auth,
            &RecordId::new("r1"),
            &patch(FieldName::Note, "x"),
            &WritePolicy::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, SyncError::PersistFailure { .. }));
        assert!(err.is_user_visible());
        assert_eq!(collection.write_count(WriteOp::Merge), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn configured_retries_retry_transient_merge_failures() {
        let collection = InMemoryCollection::with_documents([("r1", json!({}))]);
        collection.fail_next_partial_updates(1);
        collection.fail_next_merge_writes(2);
        let auth = StaticAuth::signed_in("u1");
        let policy = WritePolicy {
            extra_retries: 2,
            base_backoff_ms: 100,
            max_backoff_ms: 1_000,
        };

        let report = persist_patch(
            &collection,
            &auth,
            &RecordId::new("r1"),
            &patch(FieldName::Note, "x"),
            &policy,
        )
        .await
        .unwrap();

        assert_eq!(report.attempts, 4);
        assert_eq!(collection.write_count(WriteOp::Merge), 3);
    }

    #[tokio::test]
    async fn no_write_without_identity() {
        let collection = InMemoryCollection::with_documents([("r1", json!({}))]);
        let auth = StaticAuth::signed_out();

        let err = persist_patch(
            &collection,
            &auth,
            &RecordId::new("r1"),
            &patch(FieldName::Note, "x"),
            &WritePolicy::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, SyncError::Auth(_)));
        assert!(collection.writes().is_empty());
    }
}
