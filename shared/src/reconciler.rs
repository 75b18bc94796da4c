use std::collections::HashSet;

use metrics::counter;
use tokio::time::Instant;
use tracing::{debug, error, instrument, warn};

use crate::config::EngineConfig;
use crate::edit::EditController;
use crate::error::SyncError;
use crate::event::{Effect, Event, RowView, UserCommand, ViewCommand};
use crate::model::{
    ChangeKind, DocumentPatch, Fields, PhotoChange, RecordId, RemoteChange, UnixTimeMs,
};
use crate::panel::DetailPanelController;
use crate::record_store::{RecordStore, UpsertOutcome};
use crate::sort::{RowFilter, SortEngine, SortState};

/// The synchronous core of the table.
///
/// Every input is an [`Event`]; each is fully applied to the store, the
/// controllers and the display order before `update` returns the effects it
/// produced. The engine never blocks and never performs I/O.
#[derive(Debug)]
pub struct Engine {
    store: RecordStore,
    sort: SortState,
    filter: Option<RowFilter>,
    edits: EditController,
    panel: DetailPanelController,
    order: Vec<RecordId>,
}

impl Engine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            store: RecordStore::new(),
            sort: SortState::default(),
            filter: None,
            edits: EditController::new(config.debounce_window()),
            panel: DetailPanelController::new(),
            order: Vec::new(),
        }
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn order(&self) -> &[RecordId] {
        &self.order
    }

    pub fn panel(&self) -> &DetailPanelController {
        &self.panel
    }

    pub fn edits(&self) -> &EditController {
        &self.edits
    }

    /// When the engine next wants a [`Event::Tick`].
    pub fn next_deadline(&self) -> Option<Instant> {
        self.edits.next_deadline()
    }

    pub fn update(&mut self, event: Event, now: Instant) -> Vec<Effect> {
        match event {
            Event::Remote(change) => self.on_remote_change(change),
            Event::User(command) => self.on_user(command, now),
            Event::Tick => self.on_tick(now),
            Event::FieldWritten {
                record,
                field,
                patch,
                issued_at,
                result,
            } => {
                self.edits.complete(&record, field);
                match result {
                    Ok(_) => {
                        counter!("edit.write.completed").increment(1);
                        self.confirm(&record, &patch, issued_at)
                    }
                    Err(error) => {
                        let mut effects = self.render_row(&record);
                        effects.extend(self.panel.on_record_changed(
                            &record,
                            &self.store,
                            &self.edits,
                        ));
                        effects.extend(self.report(&record, error));
                        effects
                    }
                }
            }
            Event::PanelSaved {
                record,
                patch,
                issued_at,
                result,
            } => {
                let (mut effects, result) = match result {
                    Ok(_) => (self.confirm(&record, &patch, issued_at), Ok(())),
                    Err(error) => (Vec::new(), Err(error)),
                };
                effects.extend(
                    self.panel
                        .save_completed(&record, result, &self.store, &self.edits),
                );
                effects
            }
            Event::PhotoAttached {
                record,
                token,
                issued_at,
                result,
            } => match result {
                Ok(photo) => {
                    let now = UnixTimeMs::now();
                    let patch = DocumentPatch::photo(PhotoChange::Set(photo.clone()), now);
                    let mut effects = self.confirm(&record, &patch, issued_at);
                    effects.extend(
                        self.panel
                            .attach_finished(&record, token, Some(&photo), &self.store),
                    );
                    effects
                }
                Err(error) => {
                    let mut effects =
                        self.panel.attach_finished(&record, token, None, &self.store);
                    effects.extend(self.report(&record, error));
                    effects
                }
            },
            Event::PhotoDetached {
                record,
                issued_at,
                result,
            } => match result {
                Ok(()) => {
                    let patch = DocumentPatch::photo(PhotoChange::Clear, UnixTimeMs::now());
                    self.confirm(&record, &patch, issued_at)
                }
                Err(error) => {
                    let mut effects = self.panel.restore_photo(&record, &self.store);
                    effects.extend(self.report(&record, error));
                    effects
                }
            },
            Event::RecordCreated(result) => match result {
                Ok(id) => {
                    debug!(record = %id, "record created, waiting for feed");
                    Vec::new()
                }
                Err(error) => surface(error),
            },
            Event::RecordDeleted { record, result } => match result {
                Ok(()) => {
                    debug!(%record, "record deleted, waiting for feed");
                    Vec::new()
                }
                Err(error) => surface(error),
            },
        }
    }

    #[instrument(skip(self, change), fields(kind = ?change.kind, record = %change.id))]
    fn on_remote_change(&mut self, change: RemoteChange) -> Vec<Effect> {
        let RemoteChange { kind, id, payload } = change;
        let mut effects: Vec<Effect> = Vec::new();

        match kind {
            ChangeKind::Added | ChangeKind::Modified => {
                if kind == ChangeKind::Modified && !self.store.contains(&id) {
                    counter!("sync.remote.ignored").increment(1);
                    debug!("modified for unknown record ignored");
                    return effects;
                }
                let metric = match self.store.upsert(&id, &payload) {
                    UpsertOutcome::Inserted { .. } => "sync.remote.inserted",
                    UpsertOutcome::Updated => "sync.remote.updated",
                };
                counter!(metric).increment(1);
                effects.extend(self.panel.on_record_changed(&id, &self.store, &self.edits));
                effects.extend(self.render_row(&id));
            }
            ChangeKind::Removed => {
                counter!("sync.remote.removed").increment(1);
                effects.extend(self.panel.on_record_removed(&id, &self.store, &self.edits));
                let dropped = self.edits.drop_record(&id);
                if dropped > 0 {
                    warn!(dropped, "pending edits dropped for removed record");
                }
                if self.store.remove(&id).is_some() {
                    effects.push(ViewCommand::RemoveRow(id).into());
                }
            }
        }

        effects.extend(self.rematerialize());
        effects
    }

    fn on_user(&mut self, command: UserCommand, now: Instant) -> Vec<Effect> {
        match command {
            UserCommand::Edit {
                record,
                field,
                value,
            } => {
                if !self.store.contains(&record) {
                    warn!(%record, %field, "edit for unknown record ignored");
                    return Vec::new();
                }
                if self.panel.edit(&record, field, &value) {
                    return Vec::new();
                }
                self.edits.on_field_change(record.clone(), field, value, now);
                self.render_row(&record)
            }
            UserCommand::Expand(record) => self.panel.expand(&record, &self.store, &self.edits),
            UserCommand::Collapse(record) => {
                self.panel.collapse(&record, &self.store, &self.edits)
            }
            UserCommand::ClickOutside => self.panel.click_outside(&self.store, &self.edits),
            UserCommand::AttachPhoto { record, blob } => {
                if !self.store.contains(&record) {
                    warn!(%record, "photo for unknown record ignored");
                    return Vec::new();
                }
                let (token, mut effects) = self.panel.start_attach(&record);
                effects.push(Effect::UploadPhoto {
                    record,
                    token,
                    blob,
                    issued_at: self.store.revision(),
                });
                effects
            }
            UserCommand::DetachPhoto(record) => {
                let Some(existing) = self.store.get(&record) else {
                    warn!(%record, "detach for unknown record ignored");
                    return Vec::new();
                };
                let previous = existing.photo_ref().cloned();
                let mut effects = self.panel.detach(&record);
                effects.push(Effect::DetachPhoto {
                    record,
                    previous,
                    issued_at: self.store.revision(),
                });
                effects
            }
            UserCommand::SetSort(spec) => {
                match spec {
                    Some(spec) => self.sort.set(spec),
                    None => self.sort.reset(),
                }
                self.rematerialize()
            }
            UserCommand::ToggleSort(field) => {
                let spec = self.sort.toggle(field);
                debug!(?spec, "sort toggled");
                self.rematerialize()
            }
            UserCommand::Filter(filter) => {
                self.filter = filter;
                self.order
                    .iter()
                    .filter_map(|id| {
                        self.store.get(id).map(|record| {
                            let cells = self.cells(record.id(), record.fields());
                            Effect::View(ViewCommand::SetRowVisible {
                                record: id.clone(),
                                visible: self.is_visible(&cells),
                            })
                        })
                    })
                    .collect()
            }
            UserCommand::Create(prefill) => vec![Effect::CreateRecord { prefill }],
            UserCommand::Delete(ids) => {
                let mut seen = HashSet::new();
                ids.into_iter()
                    .filter(|id| seen.insert(id.clone()))
                    .map(Effect::DeleteRecord)
                    .collect()
            }
        }
    }

    fn on_tick(&mut self, now: Instant) -> Vec<Effect> {
        let issued_at = self.store.revision();
        self.edits
            .take_due(now)
            .into_iter()
            .map(|write| {
                debug!(record = %write.record, field = %write.field, "debounced write due");
                Effect::WriteField {
                    patch: DocumentPatch::fields(
                        Fields::new().with(write.field, write.value),
                        UnixTimeMs::now(),
                    ),
                    record: write.record,
                    field: write.field,
                    issued_at,
                }
            })
            .collect()
    }

    /// Applies a confirmed local write issued at store revision `issued_at`.
    /// A record removed meanwhile stays removed.
    fn confirm(
        &mut self,
        record: &RecordId,
        patch: &DocumentPatch,
        issued_at: u64,
    ) -> Vec<Effect> {
        if !self.store.apply_confirmed(record, patch, issued_at) {
            debug!(%record, "write confirmed for removed record");
            return Vec::new();
        }
        let mut effects = self.render_row(record);
        effects.extend(self.panel.on_record_changed(record, &self.store, &self.edits));
        effects.extend(self.rematerialize());
        effects
    }

    fn report(&self, record: &RecordId, error: SyncError) -> Vec<Effect> {
        if !self.store.contains(record) {
            warn!(%record, %error, "failure for removed record");
            return Vec::new();
        }
        surface(error)
    }

    fn cells(&self, id: &RecordId, fields: &Fields) -> Fields {
        let mut cells = fields.clone();
        cells.merge(&self.edits.dirty_overlay(id));
        cells
    }

    fn is_visible(&self, cells: &Fields) -> bool {
        self.filter.as_ref().map_or(true, |f| f.matches(cells))
    }

    fn render_row(&self, id: &RecordId) -> Vec<Effect> {
        let Some(record) = self.store.get(id) else {
            return Vec::new();
        };
        let overlay = self.edits.dirty_overlay(id);
        let row = RowView::new(record, &overlay, true);
        let visible = self.is_visible(&row.cells);
        vec![ViewCommand::RenderRow(RowView { visible, ..row }).into()]
    }

    /// Recomputes the display order and emits a reorder when it changed.
    fn rematerialize(&mut self) -> Vec<Effect> {
        let order = SortEngine::materialize(self.store.all(), self.sort.active());
        if order == self.order {
            return Vec::new();
        }
        self.order = order;
        vec![ViewCommand::Reorder(self.order.clone()).into()]
    }
}

fn surface(error: SyncError) -> Vec<Effect> {
    if error.is_user_visible() {
        error!(code = error.kind().code(), %error, "operation failed");
        vec![ViewCommand::ReportError(error).into()]
    } else {
        warn!(code = error.kind().code(), %error, "failure absorbed");
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::event::PanelPhoto;
    use crate::model::{FieldName, PhotoRef, RecordPayload, SortField, SortSpec};
    use std::time::Duration;

    fn engine() -> Engine {
        Engine::new(&EngineConfig::default())
    }

    fn id(s: &str) -> RecordId {
        RecordId::new(s)
    }

    fn added(id_: &str, pairs: &[(FieldName, &str)]) -> Event {
        let fields = pairs.iter().map(|(f, v)| (*f, v.to_string())).collect();
        Event::Remote(RemoteChange::added(id(id_), RecordPayload::new(fields)))
    }

    fn modified(id_: &str, pairs: &[(FieldName, &str)]) -> Event {
        let fields = pairs.iter().map(|(f, v)| (*f, v.to_string())).collect();
        Event::Remote(RemoteChange::modified(id(id_), RecordPayload::new(fields)))
    }

    fn edit(id_: &str, field: FieldName, value: &str) -> Event {
        Event::User(UserCommand::Edit {
            record: id(id_),
            field,
            value: value.into(),
        })
    }

    fn last_row(effects: &[Effect], id_: &str) -> Option<RowView> {
        effects.iter().rev().find_map(|e| match e {
            Effect::View(ViewCommand::RenderRow(row)) if row.id == id(id_) => Some(row.clone()),
            _ => None,
        })
    }

    fn field_writes(effects: &[Effect]) -> Vec<(RecordId, FieldName, DocumentPatch, u64)> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::WriteField {
                    record,
                    field,
                    patch,
                    issued_at,
                } => Some((record.clone(), *field, patch.clone(), *issued_at)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn remote_change_to_other_field_keeps_local_edit() {
        let start = Instant::now();
        let mut engine = engine();
        engine.update(added("r", &[(FieldName::Cost, "100"), (FieldName::Note, "old")]), start);

        engine.update(edit("r", FieldName::Cost, "250"), start);
        let effects = engine.update(modified("r", &[(FieldName::Note, "remote")]), start);
        let row = last_row(&effects, "r").unwrap();
        assert_eq!(row.cells.value(FieldName::Cost), "250");
        assert_eq!(row.cells.value(FieldName::Note), "remote");

        let deadline = engine.next_deadline().unwrap();
        assert_eq!(deadline, start + Duration::from_millis(300));
        let writes = field_writes(&engine.update(Event::Tick, deadline));
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].1, FieldName::Cost);
        assert_eq!(writes[0].2.fields.value(FieldName::Cost), "250");
        assert!(field_writes(&engine.update(Event::Tick, deadline)).is_empty());
    }

    #[test]
    fn modified_after_removed_does_not_resurrect() {
        let now = Instant::now();
        let mut engine = engine();
        engine.update(added("r", &[]), now);
        engine.update(Event::Remote(RemoteChange::removed(id("r"))), now);
        let effects = engine.update(modified("r", &[(FieldName::Note, "stale")]), now);

        assert!(effects.is_empty());
        assert!(engine.store().is_empty());

        engine.update(added("r", &[]), now);
        assert_eq!(engine.store().get(&id("r")).unwrap().first_seen_index(), 1);
    }

    #[test]
    fn removal_drops_pending_edits_and_closes_panel() {
        let now = Instant::now();
        let mut engine = engine();
        engine.update(added("r", &[]), now);
        engine.update(edit("r", FieldName::Cost, "1"), now);
        engine.update(Event::User(UserCommand::Expand(id("r"))), now);
        engine.update(edit("r", FieldName::Symptom, "x"), now);

        let effects = engine.update(Event::Remote(RemoteChange::removed(id("r"))), now);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::View(ViewCommand::ClosePanel(_)))));
        assert!(effects
            .iter()
            .all(|e| !matches!(e, Effect::SavePanel { .. })));
        assert_eq!(engine.next_deadline(), None);
        assert_eq!(engine.panel().shown(), None);
    }

    #[test]
    fn reorder_only_when_order_changes() {
        let now = Instant::now();
        let mut engine = engine();
        engine.update(added("1", &[(FieldName::ShipDate, "2024-01-05")]), now);
        engine.update(added("2", &[(FieldName::ShipDate, "")]), now);
        engine.update(added("3", &[(FieldName::ShipDate, "2024-01-01")]), now);

        let effects = engine.update(
            Event::User(UserCommand::SetSort(Some(SortSpec::ascending(SortField::ShipDate)))),
            now,
        );
        assert!(matches!(&effects[..], [Effect::View(ViewCommand::Reorder(ids))]
            if ids == &[id("3"), id("1"), id("2")]));

        let effects = engine.update(modified("1", &[(FieldName::Note, "n")]), now);
        assert!(effects
            .iter()
            .all(|e| !matches!(e, Effect::View(ViewCommand::Reorder(_)))));

        engine.update(Event::User(UserCommand::SetSort(None)), now);
        assert_eq!(engine.order(), &[id("1"), id("2"), id("3")]);
    }

    #[test]
    fn filter_hides_rows_without_reordering() {
        let now = Instant::now();
        let mut engine = engine();
        engine.update(added("1", &[(FieldName::Company, "Acme Marine")]), now);
        engine.update(added("2", &[(FieldName::Company, "Blue Sea")]), now);

        let effects = engine.update(
            Event::User(UserCommand::Filter(Some(RowFilter::new(FieldName::Company, "ACME")))),
            now,
        );
        let visibility: Vec<_> = effects
            .iter()
            .filter_map(|e| match e {
                Effect::View(ViewCommand::SetRowVisible { record, visible }) => {
                    Some((record.clone(), *visible))
                }
                _ => None,
            })
            .collect();
        assert_eq!(visibility, vec![(id("1"), true), (id("2"), false)]);

        let effects = engine.update(modified("2", &[(FieldName::Company, "Acme Blue")]), now);
        assert!(last_row(&effects, "2").unwrap().visible);
    }

    #[test]
    fn failed_field_write_reverts_cell_and_reports() {
        let now = Instant::now();
        let mut engine = engine();
        engine.update(added("r", &[(FieldName::Cost, "100")]), now);
        engine.update(edit("r", FieldName::Cost, "7"), now);
        let writes = field_writes(&engine.update(Event::Tick, now + Duration::from_secs(1)));
        let (record, field, patch, issued_at) = writes.into_iter().next().unwrap();

        let effects = engine.update(
            Event::FieldWritten {
                record,
                field,
                patch,
                issued_at,
                result: Err(SyncError::PersistFailure {
                    record: id("r"),
                    partial: RemoteError::transient("a"),
                    merge: RemoteError::transient("b"),
                }),
            },
            now,
        );
        assert_eq!(last_row(&effects, "r").unwrap().cells.value(FieldName::Cost), "100");
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::View(ViewCommand::ReportError(_)))));
    }

    #[test]
    fn second_edit_during_flight_writes_after_completion() {
        let start = Instant::now();
        let mut engine = engine();
        engine.update(added("r", &[]), start);
        engine.update(edit("r", FieldName::Note, "a"), start);
        let first = field_writes(&engine.update(Event::Tick, start + Duration::from_millis(300)));
        assert_eq!(first.len(), 1);

        engine.update(edit("r", FieldName::Note, "ab"), start + Duration::from_millis(310));
        assert_eq!(engine.next_deadline(), None);

        let (record, field, patch, issued_at) = first.into_iter().next().unwrap();
        engine.update(
            Event::FieldWritten {
                record,
                field,
                patch,
                issued_at,
                result: Ok(crate::edit::WriteReport {
                    fallback_used: false,
                    attempts: 1,
                }),
            },
            start + Duration::from_millis(320),
        );
        assert_eq!(engine.store().get(&id("r")).unwrap().field(FieldName::Note), "a");

        let deadline = engine.next_deadline().unwrap();
        let second = field_writes(&engine.update(Event::Tick, deadline));
        assert_eq!(second[0].2.fields.value(FieldName::Note), "ab");
    }

    #[test]
    fn confirmed_write_does_not_override_newer_notification() {
        let start = Instant::now();
        let mut engine = engine();
        engine.update(added("r", &[(FieldName::Note, "x")]), start);
        engine.update(edit("r", FieldName::Note, "a"), start);
        let writes = field_writes(&engine.update(Event::Tick, start + Duration::from_millis(300)));
        let (record, field, patch, issued_at) = writes.into_iter().next().unwrap();

        // our echo, then another client, both before our write returns
        engine.update(modified("r", &[(FieldName::Note, "a")]), start);
        engine.update(modified("r", &[(FieldName::Note, "b")]), start);

        let effects = engine.update(
            Event::FieldWritten {
                record,
                field,
                patch,
                issued_at,
                result: Ok(crate::edit::WriteReport {
                    fallback_used: false,
                    attempts: 1,
                }),
            },
            start,
        );
        assert_eq!(engine.store().get(&id("r")).unwrap().field(FieldName::Note), "b");
        assert_eq!(last_row(&effects, "r").unwrap().cells.value(FieldName::Note), "b");
    }

    #[test]
    fn panel_saved_after_newer_notification_keeps_newer_value() {
        let now = Instant::now();
        let mut engine = engine();
        engine.update(added("r", &[(FieldName::Symptom, "s0")]), now);
        engine.update(Event::User(UserCommand::Expand(id("r"))), now);
        engine.update(edit("r", FieldName::Symptom, "mine"), now);
        let effects = engine.update(Event::User(UserCommand::ClickOutside), now);
        let (patch, issued_at) = effects
            .into_iter()
            .find_map(|e| match e {
                Effect::SavePanel {
                    patch, issued_at, ..
                } => Some((patch, issued_at)),
                _ => None,
            })
            .unwrap();

        engine.update(modified("r", &[(FieldName::Symptom, "theirs")]), now);
        engine.update(
            Event::PanelSaved {
                record: id("r"),
                patch,
                issued_at,
                result: Ok(crate::edit::WriteReport {
                    fallback_used: false,
                    attempts: 1,
                }),
            },
            now,
        );
        assert_eq!(engine.store().get(&id("r")).unwrap().field(FieldName::Symptom), "theirs");
        assert_eq!(engine.panel().shown(), None);
    }

    #[test]
    fn expanding_shows_row_edit_not_yet_written() {
        let now = Instant::now();
        let mut engine = engine();
        engine.update(added("r", &[(FieldName::Symptom, "old")]), now);
        engine.update(edit("r", FieldName::Symptom, "new"), now);
        engine.update(Event::User(UserCommand::Expand(id("r"))), now);

        let panel = engine.panel().view().unwrap();
        assert_eq!(panel.values.value(FieldName::Symptom), "new");
        assert_eq!(engine.edits().dirty_overlay(&id("r")).value(FieldName::Symptom), "new");
    }

    #[test]
    fn photo_attach_confirms_reference() {
        let now = Instant::now();
        let mut engine = engine();
        engine.update(added("r", &[]), now);
        engine.update(Event::User(UserCommand::Expand(id("r"))), now);
        let effects = engine.update(
            Event::User(UserCommand::AttachPhoto {
                record: id("r"),
                blob: crate::image_processing::ImageBlob::new(vec![1, 2, 3]),
            }),
            now,
        );
        let (token, issued_at) = effects
            .iter()
            .find_map(|e| match e {
                Effect::UploadPhoto {
                    token, issued_at, ..
                } => Some((*token, *issued_at)),
                _ => None,
            })
            .unwrap();
        assert_eq!(engine.panel().view().unwrap().photo, PanelPhoto::Preview { token });

        let photo = PhotoRef::new("memory://blobs/seaRows/r/photo_1.jpg").unwrap();
        let effects = engine.update(
            Event::PhotoAttached {
                record: id("r"),
                token,
                issued_at,
                result: Ok(photo.clone()),
            },
            now,
        );
        assert_eq!(last_row(&effects, "r").unwrap().photo, Some(photo.clone()));
        assert_eq!(engine.panel().view().unwrap().photo, PanelPhoto::Confirmed(photo));
    }

    #[test]
    fn delete_issues_one_call_per_distinct_id() {
        let now = Instant::now();
        let mut engine = engine();
        let effects = engine.update(
            Event::User(UserCommand::Delete(vec![id("a"), id("b"), id("a")])),
            now,
        );
        assert_eq!(effects.len(), 2);
    }
}
