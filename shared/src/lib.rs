//! Live row synchronization for an editable repair-ticket table.
//!
//! [`reconciler::Engine`] is the synchronous core: it folds remote change
//! notifications, user commands, debounce ticks and effect completions into
//! one consistent table state and answers with [`event::Effect`]s.
//! [`runtime::TableRuntime`] drives it on a single tokio task against the
//! collaborator traits in [`capabilities`].

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod capabilities;
pub mod config;
pub mod debounce;
pub mod edit;
pub mod error;
pub mod event;
pub mod image_processing;
pub mod model;
pub mod panel;
pub mod photo;
pub mod reconciler;
pub mod record_store;
pub mod runtime;
pub mod sort;

pub use config::EngineConfig;
pub use error::{ConfigError, ErrorCategory, ErrorKind, RemoteError, SyncError};
pub use event::{Effect, Event, PanelPhoto, PanelView, RowView, UserCommand, ViewCommand};
pub use image_processing::{CompressionConfig, EncodingError, ImageBlob, ImageProcessor};
pub use model::{
    FieldName, Fields, PhotoChange, PhotoRef, Record, RecordId, RecordPayload, RemoteChange,
    RepairStatus, SortDirection, SortField, SortSpec, UnixTimeMs, UserId,
};
pub use reconciler::Engine;
pub use record_store::RecordStore;
pub use runtime::{Collaborators, TableHandle, TableRuntime};
pub use sort::{RowFilter, SortEngine};
