//! The single expanded-detail panel.
//!
//! At most one panel is shown. Closing it with save issues one combined write
//! of the edited batch fields and keeps the panel read-only until that write
//! returns; an expand requested meanwhile is queued and opens afterwards.

use std::collections::BTreeSet;

use metrics::counter;
use tracing::{debug, info, warn};

use crate::edit::EditController;
use crate::error::SyncError;
use crate::event::{Effect, PanelPhoto, PanelView, ViewCommand};
use crate::model::{DocumentPatch, FieldName, Fields, PhotoRef, RecordId, UnixTimeMs};
use crate::record_store::RecordStore;

#[derive(Debug, Clone, PartialEq, Eq)]
struct OpenPanel {
    record: RecordId,
    values: Fields,
    dirty: BTreeSet<FieldName>,
    photo: PanelPhoto,
}

impl OpenPanel {
    fn view(&self, read_only: bool) -> PanelView {
        PanelView {
            record: self.record.clone(),
            values: self.values.clone(),
            dirty: self.dirty.iter().copied().collect(),
            photo: self.photo.clone(),
            read_only,
        }
    }

    fn dirty_values(&self) -> Fields {
        self.dirty
            .iter()
            .map(|f| (*f, self.values.value(*f).to_string()))
            .collect()
    }

    /// Copies the displayed row values (confirmed values overlaid by
    /// unconfirmed row edits) into every field the user has not touched here.
    fn refresh_from(&mut self, store: &RecordStore, edits: &EditController) {
        let Some(record) = store.get(&self.record) else {
            return;
        };
        let overlay = edits.dirty_overlay(&self.record);
        for field in FieldName::DETAIL {
            if !self.dirty.contains(&field) {
                let value = overlay.get(field).unwrap_or_else(|| record.field(field));
                self.values.set(field, value);
            }
        }
        if !matches!(self.photo, PanelPhoto::Preview { .. }) {
            self.photo = PanelPhoto::confirmed(record.photo_ref());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
enum PanelState {
    #[default]
    Closed,
    Open(OpenPanel),
    Closing {
        panel: OpenPanel,
        then: Option<RecordId>,
    },
}

#[derive(Debug, Default)]
pub struct DetailPanelController {
    state: PanelState,
    next_token: u64,
}

impl DetailPanelController {
    pub fn new() -> Self {
        Self::default()
    }

    /// The record whose panel is displayed, including while it is closing.
    pub fn shown(&self) -> Option<&RecordId> {
        match &self.state {
            PanelState::Closed => None,
            PanelState::Open(panel) | PanelState::Closing { panel, .. } => Some(&panel.record),
        }
    }

    pub fn is_open(&self, id: &RecordId) -> bool {
        matches!(&self.state, PanelState::Open(p) if &p.record == id)
    }

    pub fn is_closing(&self) -> bool {
        matches!(self.state, PanelState::Closing { .. })
    }

    pub fn view(&self) -> Option<PanelView> {
        match &self.state {
            PanelState::Closed => None,
            PanelState::Open(panel) => Some(panel.view(false)),
            PanelState::Closing { panel, .. } => Some(panel.view(true)),
        }
    }

    pub fn expand(
        &mut self,
        id: &RecordId,
        store: &RecordStore,
        edits: &EditController,
    ) -> Vec<Effect> {
        if !store.contains(id) {
            warn!(record = %id, "expand for unknown record ignored");
            return Vec::new();
        }
        match std::mem::take(&mut self.state) {
            PanelState::Closed => self.open(id, store, edits),
            PanelState::Open(panel) if &panel.record == id => {
                self.state = PanelState::Open(panel);
                Vec::new()
            }
            PanelState::Open(panel) => {
                self.close_with_save(panel, Some(id.clone()), store, edits)
            }
            PanelState::Closing { panel, .. } => {
                debug!(record = %id, closing = %panel.record, "expand queued behind save");
                self.state = PanelState::Closing {
                    panel,
                    then: Some(id.clone()),
                };
                Vec::new()
            }
        }
    }

    pub fn collapse(
        &mut self,
        id: &RecordId,
        store: &RecordStore,
        edits: &EditController,
    ) -> Vec<Effect> {
        match std::mem::take(&mut self.state) {
            PanelState::Open(panel) if &panel.record == id => {
                self.close_with_save(panel, None, store, edits)
            }
            PanelState::Closing { panel, then } => {
                let then = then.filter(|t| t != id);
                self.state = PanelState::Closing { panel, then };
                Vec::new()
            }
            other => {
                self.state = other;
                Vec::new()
            }
        }
    }

    pub fn click_outside(&mut self, store: &RecordStore, edits: &EditController) -> Vec<Effect> {
        match std::mem::take(&mut self.state) {
            PanelState::Open(panel) => self.close_with_save(panel, None, store, edits),
            PanelState::Closing { panel, .. } => {
                self.state = PanelState::Closing { panel, then: None };
                Vec::new()
            }
            PanelState::Closed => Vec::new(),
        }
    }

    /// Returns `true` when the panel owns this edit: a batch field of the
    /// record whose panel is shown. Edits to a closing panel are dropped.
    pub fn edit(&mut self, id: &RecordId, field: FieldName, value: &str) -> bool {
        if !field.is_detail() {
            return false;
        }
        match &mut self.state {
            PanelState::Open(panel) if &panel.record == id => {
                panel.values.set(field, value);
                panel.dirty.insert(field);
                true
            }
            PanelState::Closing { panel, .. } if &panel.record == id => {
                warn!(record = %id, %field, "edit on read-only panel dropped");
                true
            }
            _ => false,
        }
    }

    /// The store or the unconfirmed row edits of `id` changed.
    pub fn on_record_changed(
        &mut self,
        id: &RecordId,
        store: &RecordStore,
        edits: &EditController,
    ) -> Vec<Effect> {
        match &mut self.state {
            PanelState::Open(panel) | PanelState::Closing { panel, .. } if &panel.record == id => {
                panel.refresh_from(store, edits);
            }
            _ => return Vec::new(),
        }
        self.render()
    }

    /// Discards the panel of a removed record without saving.
    pub fn on_record_removed(
        &mut self,
        id: &RecordId,
        store: &RecordStore,
        edits: &EditController,
    ) -> Vec<Effect> {
        match std::mem::take(&mut self.state) {
            PanelState::Open(panel) if &panel.record == id => {
                info!(record = %id, dirty = panel.dirty.len(), "panel discarded, record removed");
                vec![ViewCommand::ClosePanel(id.clone()).into()]
            }
            PanelState::Closing { panel, then } if &panel.record == id => {
                info!(record = %id, "closing panel discarded, record removed");
                let mut effects: Vec<Effect> = vec![ViewCommand::ClosePanel(id.clone()).into()];
                if let Some(next) = then.filter(|t| t != id) {
                    effects.extend(self.open(&next, store, edits));
                }
                effects
            }
            PanelState::Closing { panel, then } => {
                let then = then.filter(|t| t != id);
                self.state = PanelState::Closing { panel, then };
                Vec::new()
            }
            other => {
                self.state = other;
                Vec::new()
            }
        }
    }

    /// The combined write for `id` returned. `store` already holds the
    /// confirmed values on success.
    pub fn save_completed(
        &mut self,
        id: &RecordId,
        result: Result<(), SyncError>,
        store: &RecordStore,
        edits: &EditController,
    ) -> Vec<Effect> {
        let (mut panel, then) = match std::mem::take(&mut self.state) {
            PanelState::Closing { panel, then } if &panel.record == id => (panel, then),
            other => {
                self.state = other;
                return stale_save(id, result, store);
            }
        };

        match result {
            Ok(()) => {
                counter!("panel.save.completed").increment(1);
                panel.dirty.clear();
                panel.refresh_from(store, edits);
                let mut effects: Vec<Effect> = vec![
                    ViewCommand::RenderPanel(panel.view(false)).into(),
                    ViewCommand::ClosePanel(id.clone()).into(),
                ];
                if let Some(next) = then {
                    effects.extend(self.open(&next, store, edits));
                }
                effects
            }
            Err(error) => {
                counter!("panel.save.failed").increment(1);
                warn!(record = %id, %error, "panel save failed, keeping edits");
                let view = panel.view(false);
                self.state = PanelState::Open(panel);
                let mut effects: Vec<Effect> = vec![ViewCommand::RenderPanel(view).into()];
                if error.is_user_visible() {
                    effects.push(ViewCommand::ReportError(error).into());
                }
                effects
            }
        }
    }

    /// Starts an attach for `id`. The returned token identifies the upload;
    /// when the panel of `id` is open it shows a local preview meanwhile.
    pub fn start_attach(&mut self, id: &RecordId) -> (u64, Vec<Effect>) {
        self.next_token += 1;
        let token = self.next_token;
        match &mut self.state {
            PanelState::Open(panel) if &panel.record == id => {
                panel.photo = PanelPhoto::Preview { token };
            }
            _ => return (token, Vec::new()),
        }
        (token, self.render())
    }

    /// Replaces the preview of upload `token`, with the confirmed reference
    /// on success or the record's current photo otherwise.
    pub fn attach_finished(
        &mut self,
        id: &RecordId,
        token: u64,
        uploaded: Option<&PhotoRef>,
        store: &RecordStore,
    ) -> Vec<Effect> {
        match &mut self.state {
            PanelState::Open(panel) | PanelState::Closing { panel, .. }
                if &panel.record == id
                    && matches!(panel.photo, PanelPhoto::Preview { token: t } if t == token) =>
            {
                panel.photo = match uploaded {
                    Some(photo) => PanelPhoto::Confirmed(photo.clone()),
                    None => PanelPhoto::confirmed(store.get(id).and_then(|r| r.photo_ref())),
                };
            }
            _ => return Vec::new(),
        }
        self.render()
    }

    pub fn detach(&mut self, id: &RecordId) -> Vec<Effect> {
        match &mut self.state {
            PanelState::Open(panel) if &panel.record == id => panel.photo = PanelPhoto::Empty,
            _ => return Vec::new(),
        }
        self.render()
    }

    /// Shows the record's confirmed photo again, unless a preview is pending.
    pub fn restore_photo(&mut self, id: &RecordId, store: &RecordStore) -> Vec<Effect> {
        let photo = PanelPhoto::confirmed(store.get(id).and_then(|r| r.photo_ref()));
        match &mut self.state {
            PanelState::Open(panel) | PanelState::Closing { panel, .. }
                if &panel.record == id && !matches!(panel.photo, PanelPhoto::Preview { .. }) =>
            {
                panel.photo = photo;
            }
            _ => return Vec::new(),
        }
        self.render()
    }

    fn open(&mut self, id: &RecordId, store: &RecordStore, edits: &EditController) -> Vec<Effect> {
        if !store.contains(id) {
            warn!(record = %id, "queued panel target no longer exists");
            self.state = PanelState::Closed;
            return Vec::new();
        }
        let mut panel = OpenPanel {
            record: id.clone(),
            values: Fields::new(),
            dirty: BTreeSet::new(),
            photo: PanelPhoto::Empty,
        };
        panel.refresh_from(store, edits);
        debug!(record = %id, "panel opened");
        let view = panel.view(false);
        self.state = PanelState::Open(panel);
        vec![ViewCommand::RenderPanel(view).into()]
    }

    fn close_with_save(
        &mut self,
        panel: OpenPanel,
        then: Option<RecordId>,
        store: &RecordStore,
        edits: &EditController,
    ) -> Vec<Effect> {
        if panel.dirty.is_empty() {
            debug!(record = %panel.record, "panel closed, nothing to save");
            let mut effects: Vec<Effect> = vec![ViewCommand::ClosePanel(panel.record.clone()).into()];
            self.state = PanelState::Closed;
            if let Some(next) = then {
                effects.extend(self.open(&next, store, edits));
            }
            return effects;
        }

        counter!("panel.save.requested").increment(1);
        let patch = DocumentPatch::fields(panel.dirty_values(), UnixTimeMs::now());
        debug!(record = %panel.record, fields = patch.fields.len(), "panel closing with save");
        let record = panel.record.clone();
        let view = panel.view(true);
        self.state = PanelState::Closing { panel, then };
        vec![
            ViewCommand::RenderPanel(view).into(),
            Effect::SavePanel {
                record,
                patch,
                issued_at: store.revision(),
            },
        ]
    }

    fn render(&self) -> Vec<Effect> {
        self.view()
            .map(|v| vec![ViewCommand::RenderPanel(v).into()])
            .unwrap_or_default()
    }
}

fn stale_save(id: &RecordId, result: Result<(), SyncError>, store: &RecordStore) -> Vec<Effect> {
    match result {
        Ok(()) => {
            debug!(record = %id, "save completed after panel was discarded");
            Vec::new()
        }
        Err(error) if store.contains(id) && error.is_user_visible() => {
            vec![ViewCommand::ReportError(error).into()]
        }
        Err(error) => {
            warn!(record = %id, %error, "save for discarded panel failed");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::model::{PhotoChange, RecordPayload};
    use std::time::Duration;
    use tokio::time::Instant;

    fn idle() -> EditController {
        EditController::new(Duration::from_millis(300))
    }

    fn store() -> RecordStore {
        let mut store = RecordStore::new();
        for id in ["a", "b"] {
            let fields = Fields::new()
                .with(FieldName::Symptom, format!("{id}-symptom"))
                .with(FieldName::Diagnosis, format!("{id}-diagnosis"));
            store.upsert(&RecordId::new(id), &RecordPayload::new(fields));
        }
        store
    }

    fn id(s: &str) -> RecordId {
        RecordId::new(s)
    }

    fn save_patch(effects: &[Effect]) -> Option<&DocumentPatch> {
        effects.iter().find_map(|e| match e {
            Effect::SavePanel { patch, .. } => Some(patch),
            _ => None,
        })
    }

    fn persist_failure(record: &str) -> SyncError {
        SyncError::PersistFailure {
            record: id(record),
            partial: RemoteError::transient("down"),
            merge: RemoteError::transient("down"),
        }
    }

    #[test]
    fn opening_a_second_panel_saves_the_first_in_one_write() {
        let store = store();
        let edits = idle();
        let mut panel = DetailPanelController::new();
        panel.expand(&id("a"), &store, &edits);
        assert!(panel.edit(&id("a"), FieldName::Symptom, "leaks"));
        assert!(panel.edit(&id("a"), FieldName::Special, "rush"));

        let effects = panel.expand(&id("b"), &store, &edits);
        let patch = save_patch(&effects).expect("combined write");
        assert_eq!(patch.fields.len(), 2);
        assert_eq!(patch.fields.value(FieldName::Symptom), "leaks");
        assert_eq!(patch.fields.value(FieldName::Special), "rush");
        assert_eq!(panel.shown(), Some(&id("a")));
        assert!(panel.is_closing());

        let effects = panel.save_completed(&id("a"), Ok(()), &store, &edits);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::View(ViewCommand::ClosePanel(r)) if r == &id("a"))));
        assert!(panel.is_open(&id("b")));
    }

    #[test]
    fn clean_panel_closes_without_write() {
        let store = store();
        let edits = idle();
        let mut panel = DetailPanelController::new();
        panel.expand(&id("a"), &store, &edits);
        let effects = panel.collapse(&id("a"), &store, &edits);
        assert!(save_patch(&effects).is_none());
        assert_eq!(panel.shown(), None);
    }

    #[test]
    fn remote_update_refreshes_only_untouched_fields() {
        let mut store = store();
        let edits = idle();
        let mut panel = DetailPanelController::new();
        panel.expand(&id("a"), &store, &edits);
        panel.edit(&id("a"), FieldName::Symptom, "local");

        let remote = Fields::new()
            .with(FieldName::Symptom, "remote-symptom")
            .with(FieldName::Diagnosis, "remote-diagnosis");
        store.upsert(&id("a"), &RecordPayload::new(remote));
        panel.on_record_changed(&id("a"), &store, &edits);

        let view = panel.view().unwrap();
        assert_eq!(view.values.value(FieldName::Symptom), "local");
        assert_eq!(view.values.value(FieldName::Diagnosis), "remote-diagnosis");
        assert_eq!(view.dirty, vec![FieldName::Symptom]);
    }

    #[test]
    fn opening_shows_unconfirmed_row_edits() {
        let mut store = store();
        let mut edits = idle();
        let now = Instant::now();
        edits.on_field_change(id("a"), FieldName::Symptom, "typed in row", now);

        let mut panel = DetailPanelController::new();
        panel.expand(&id("a"), &store, &edits);
        let view = panel.view().unwrap();
        assert_eq!(view.values.value(FieldName::Symptom), "typed in row");
        assert_eq!(view.values.value(FieldName::Diagnosis), "a-diagnosis");
        assert!(view.dirty.is_empty());

        // a remote change to another field keeps the overlay
        let remote = Fields::new()
            .with(FieldName::Symptom, "remote-symptom")
            .with(FieldName::Diagnosis, "remote-diagnosis");
        store.upsert(&id("a"), &RecordPayload::new(remote));
        panel.on_record_changed(&id("a"), &store, &edits);
        let view = panel.view().unwrap();
        assert_eq!(view.values.value(FieldName::Symptom), "typed in row");
        assert_eq!(view.values.value(FieldName::Diagnosis), "remote-diagnosis");

        // once the row write returns the confirmed value shows through
        edits.take_due(now + Duration::from_millis(300));
        edits.complete(&id("a"), FieldName::Symptom);
        panel.on_record_changed(&id("a"), &store, &edits);
        assert_eq!(panel.view().unwrap().values.value(FieldName::Symptom), "remote-symptom");
    }

    #[test]
    fn removal_discards_without_save() {
        let store = store();
        let edits = idle();
        let mut panel = DetailPanelController::new();
        panel.expand(&id("a"), &store, &edits);
        panel.edit(&id("a"), FieldName::Symptom, "lost");

        let effects = panel.on_record_removed(&id("a"), &store, &edits);
        assert!(save_patch(&effects).is_none());
        assert_eq!(panel.shown(), None);
    }

    #[test]
    fn failed_save_keeps_panel_open_with_edits() {
        let store = store();
        let edits = idle();
        let mut panel = DetailPanelController::new();
        panel.expand(&id("a"), &store, &edits);
        panel.edit(&id("a"), FieldName::Diagnosis, "cracked");
        panel.expand(&id("b"), &store, &edits);

        let effects = panel.save_completed(&id("a"), Err(persist_failure("a")), &store, &edits);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::View(ViewCommand::ReportError(_)))));
        assert!(panel.is_open(&id("a")));
        assert_eq!(panel.view().unwrap().values.value(FieldName::Diagnosis), "cracked");
    }

    #[test]
    fn closing_panel_is_read_only_and_last_expand_wins() {
        let store = store();
        let edits = idle();
        let mut panel = DetailPanelController::new();
        panel.expand(&id("a"), &store, &edits);
        panel.edit(&id("a"), FieldName::Symptom, "x");
        panel.click_outside(&store, &edits);

        assert!(panel.view().unwrap().read_only);
        assert!(panel.edit(&id("a"), FieldName::Symptom, "ignored"));
        assert_eq!(panel.view().unwrap().values.value(FieldName::Symptom), "x");

        panel.expand(&id("b"), &store, &edits);
        panel.save_completed(&id("a"), Ok(()), &store, &edits);
        assert!(panel.is_open(&id("b")));
    }

    #[test]
    fn row_fields_are_not_owned_by_the_panel() {
        let store = store();
        let edits = idle();
        let mut panel = DetailPanelController::new();
        panel.expand(&id("a"), &store, &edits);
        assert!(!panel.edit(&id("a"), FieldName::Cost, "10"));
        assert!(!panel.edit(&id("b"), FieldName::Symptom, "x"));
    }

    #[test]
    fn failed_upload_reverts_preview_to_confirmed_photo() {
        let mut store = store();
        let edits = idle();
        let photo = PhotoRef::new("memory://blobs/a.jpg").unwrap();
        store.upsert(&id("a"), &RecordPayload::default().with_photo(PhotoChange::Set(photo.clone())));

        let mut panel = DetailPanelController::new();
        panel.expand(&id("a"), &store, &edits);
        let (token, _) = panel.start_attach(&id("a"));
        assert_eq!(panel.view().unwrap().photo, PanelPhoto::Preview { token });

        panel.attach_finished(&id("a"), token, None, &store);
        assert_eq!(panel.view().unwrap().photo, PanelPhoto::Confirmed(photo));
    }

    #[test]
    fn stale_upload_does_not_replace_newer_preview() {
        let store = store();
        let edits = idle();
        let mut panel = DetailPanelController::new();
        panel.expand(&id("a"), &store, &edits);
        let (first, _) = panel.start_attach(&id("a"));
        let (second, _) = panel.start_attach(&id("a"));

        let uploaded = PhotoRef::new("memory://blobs/old.jpg").unwrap();
        assert!(panel.attach_finished(&id("a"), first, Some(&uploaded), &store).is_empty());
        assert_eq!(panel.view().unwrap().photo, PanelPhoto::Preview { token: second });
    }
}
