use serde::Serialize;

use crate::capabilities::TableView;
use crate::edit::WriteReport;
use crate::error::SyncError;
use crate::image_processing::ImageBlob;
use crate::model::{
    DocumentPatch, FieldName, Fields, PhotoRef, Record, RecordId, RemoteChange, RepairStatus,
    SortField, SortSpec,
};
use crate::sort::RowFilter;

/// Everything the view layer can ask of the table.
#[derive(Debug, Clone)]
pub enum UserCommand {
    Edit {
        record: RecordId,
        field: FieldName,
        value: String,
    },
    Expand(RecordId),
    Collapse(RecordId),
    ClickOutside,
    AttachPhoto {
        record: RecordId,
        blob: ImageBlob,
    },
    DetachPhoto(RecordId),
    /// `None` reverts to first-seen order.
    SetSort(Option<SortSpec>),
    ToggleSort(SortField),
    Filter(Option<RowFilter>),
    Create(Fields),
    Delete(Vec<RecordId>),
}

#[derive(Debug)]
pub enum Event {
    Remote(RemoteChange),
    User(UserCommand),
    /// A debounce deadline passed.
    Tick,

    // Completions of effects, delivered back to the engine task. `issued_at`
    // is echoed from the effect that started the operation.
    FieldWritten {
        record: RecordId,
        field: FieldName,
        patch: DocumentPatch,
        issued_at: u64,
        result: Result<WriteReport, SyncError>,
    },
    PanelSaved {
        record: RecordId,
        patch: DocumentPatch,
        issued_at: u64,
        result: Result<WriteReport, SyncError>,
    },
    PhotoAttached {
        record: RecordId,
        token: u64,
        issued_at: u64,
        result: Result<PhotoRef, SyncError>,
    },
    PhotoDetached {
        record: RecordId,
        issued_at: u64,
        result: Result<(), SyncError>,
    },
    RecordCreated(Result<RecordId, SyncError>),
    RecordDeleted {
        record: RecordId,
        result: Result<(), SyncError>,
    },
}

/// Work the engine asks the runtime to perform.
///
/// Writes carry `issued_at`, the [`RecordStore`](crate::record_store::RecordStore)
/// revision they were issued at, so their completion cannot override values
/// the feed delivered meanwhile.
#[derive(Debug)]
pub enum Effect {
    View(ViewCommand),
    WriteField {
        record: RecordId,
        field: FieldName,
        patch: DocumentPatch,
        issued_at: u64,
    },
    SavePanel {
        record: RecordId,
        patch: DocumentPatch,
        issued_at: u64,
    },
    UploadPhoto {
        record: RecordId,
        token: u64,
        blob: ImageBlob,
        issued_at: u64,
    },
    DetachPhoto {
        record: RecordId,
        previous: Option<PhotoRef>,
        issued_at: u64,
    },
    CreateRecord {
        prefill: Fields,
    },
    DeleteRecord(RecordId),
}

impl From<ViewCommand> for Effect {
    fn from(command: ViewCommand) -> Self {
        Effect::View(command)
    }
}

/// A row as it should be displayed: confirmed values overlaid by local
/// edits that are not yet confirmed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RowView {
    pub id: RecordId,
    pub cells: Fields,
    pub photo: Option<PhotoRef>,
    pub status_class: Option<&'static str>,
    pub visible: bool,
}

impl RowView {
    pub fn new(record: &Record, overlay: &Fields, visible: bool) -> Self {
        let mut cells = record.fields().clone();
        cells.merge(overlay);
        let status_class =
            RepairStatus::from_label(cells.value(FieldName::Status)).map(RepairStatus::style_class);
        Self {
            id: record.id().clone(),
            cells,
            photo: record.photo_ref().cloned(),
            status_class,
            visible,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum PanelPhoto {
    Empty,
    Confirmed(PhotoRef),
    /// Local preview of a selected file; the view keeps the bytes.
    Preview { token: u64 },
}

impl PanelPhoto {
    pub fn confirmed(photo: Option<&PhotoRef>) -> Self {
        photo.map_or(Self::Empty, |p| Self::Confirmed(p.clone()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PanelView {
    pub record: RecordId,
    pub values: Fields,
    pub dirty: Vec<FieldName>,
    pub photo: PanelPhoto,
    /// Set while the combined write of a closing panel is in flight.
    pub read_only: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ViewCommand {
    RenderRow(RowView),
    RemoveRow(RecordId),
    Reorder(Vec<RecordId>),
    SetRowVisible { record: RecordId, visible: bool },
    RenderPanel(PanelView),
    ClosePanel(RecordId),
    ReportError(SyncError),
}

impl ViewCommand {
    pub fn apply_to(&self, view: &mut dyn TableView) {
        match self {
            Self::RenderRow(row) => view.render_row(row),
            Self::RemoveRow(id) => view.remove_row(id),
            Self::Reorder(ids) => view.reorder(ids),
            Self::SetRowVisible { record, visible } => view.set_row_visible(record, *visible),
            Self::RenderPanel(panel) => view.render_panel(panel),
            Self::ClosePanel(id) => view.close_panel(id),
            Self::ReportError(error) => view.report_error(error),
        }
    }
}
