use crate::error::SyncError;
use crate::event::{PanelView, RowView};
use crate::model::RecordId;

/// The rendering surface. Calls arrive on the engine task, one at a time,
/// and must not block.
pub trait TableView: Send {
    /// Creates the row if it does not exist yet, otherwise updates it in place.
    fn render_row(&mut self, row: &RowView);

    fn remove_row(&mut self, id: &RecordId);

    /// Repositions existing rows; rows are never recreated by a reorder.
    fn reorder(&mut self, ids: &[RecordId]);

    fn set_row_visible(&mut self, id: &RecordId, visible: bool);

    fn render_panel(&mut self, panel: &PanelView);

    fn close_panel(&mut self, id: &RecordId);

    fn report_error(&mut self, error: &SyncError);
}
