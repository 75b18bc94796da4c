use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{AuthGate, BlobStore, RemoteFeed, RemoteWriter, TableView};
use crate::config::EngineConfig;
use crate::edit::{persist_patch, WritePolicy};
use crate::error::{ConfigError, SyncError};
use crate::event::{Effect, Event, UserCommand};
use crate::image_processing::{ImageBlob, ImageProcessor};
use crate::model::{FieldName, Fields, NewRecord, RecordId, SortField, SortSpec, UnixTimeMs};
use crate::photo::PhotoFlow;
use crate::reconciler::Engine;
use crate::sort::RowFilter;

/// The remote side of the table.
#[derive(Clone)]
pub struct Collaborators {
    pub feed: Arc<dyn RemoteFeed>,
    pub writer: Arc<dyn RemoteWriter>,
    pub blobs: Arc<dyn BlobStore>,
    pub auth: Arc<dyn AuthGate>,
}

/// View-facing entry points. Every call is queued onto the engine task and
/// applied in order; failures of the resulting operations are reported
/// through [`TableView::report_error`].
#[derive(Clone, Debug)]
pub struct TableHandle {
    commands: mpsc::UnboundedSender<UserCommand>,
}

impl TableHandle {
    fn send(&self, command: UserCommand) -> Result<(), SyncError> {
        self.commands
            .send(command)
            .map_err(|_| SyncError::EngineStopped)
    }

    pub fn on_user_edit(
        &self,
        record: RecordId,
        field: FieldName,
        value: impl Into<String>,
    ) -> Result<(), SyncError> {
        self.send(UserCommand::Edit {
            record,
            field,
            value: value.into(),
        })
    }

    pub fn on_user_expand(&self, record: RecordId) -> Result<(), SyncError> {
        self.send(UserCommand::Expand(record))
    }

    pub fn on_user_collapse(&self, record: RecordId) -> Result<(), SyncError> {
        self.send(UserCommand::Collapse(record))
    }

    pub fn on_user_click_outside(&self) -> Result<(), SyncError> {
        self.send(UserCommand::ClickOutside)
    }

    pub fn on_user_attach_photo(&self, record: RecordId, blob: ImageBlob) -> Result<(), SyncError> {
        self.send(UserCommand::AttachPhoto { record, blob })
    }

    pub fn on_user_detach_photo(&self, record: RecordId) -> Result<(), SyncError> {
        self.send(UserCommand::DetachPhoto(record))
    }

    pub fn on_user_sort(&self, spec: SortSpec) -> Result<(), SyncError> {
        self.send(UserCommand::SetSort(Some(spec)))
    }

    pub fn on_user_toggle_sort(&self, field: SortField) -> Result<(), SyncError> {
        self.send(UserCommand::ToggleSort(field))
    }

    /// Back to first-seen order.
    pub fn on_user_reset_sort(&self) -> Result<(), SyncError> {
        self.send(UserCommand::SetSort(None))
    }

    pub fn on_user_filter(&self, filter: Option<RowFilter>) -> Result<(), SyncError> {
        self.send(UserCommand::Filter(filter))
    }

    pub fn on_user_create(&self, prefill: Fields) -> Result<(), SyncError> {
        self.send(UserCommand::Create(prefill))
    }

    pub fn on_user_delete(&self, records: Vec<RecordId>) -> Result<(), SyncError> {
        self.send(UserCommand::Delete(records))
    }
}

/// Owns the [`Engine`] and the view, and runs them on a single task.
///
/// Remote notifications, user commands, debounce deadlines and effect
/// completions are merged into one queue; the engine handles one event at a
/// time. Everything that suspends runs in spawned tasks which report back
/// through that queue.
pub struct TableRuntime<V> {
    engine: Engine,
    view: V,
    collaborators: Collaborators,
    policy: WritePolicy,
    photos: PhotoFlow,
    commands: mpsc::UnboundedReceiver<UserCommand>,
    completions_tx: mpsc::UnboundedSender<Event>,
    completions_rx: mpsc::UnboundedReceiver<Event>,
}

impl<V: TableView> TableRuntime<V> {
    pub fn new(
        config: EngineConfig,
        collaborators: Collaborators,
        view: V,
    ) -> Result<(Self, TableHandle), ConfigError> {
        config.validate()?;

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let photos = PhotoFlow {
            writer: collaborators.writer.clone(),
            auth: collaborators.auth.clone(),
            blobs: collaborators.blobs.clone(),
            processor: Arc::new(ImageProcessor::new(config.compression.clone())),
            policy: config.write_policy.clone(),
            storage_prefix: config.storage_prefix.clone(),
        };

        let runtime = Self {
            engine: Engine::new(&config),
            view,
            policy: config.write_policy,
            collaborators,
            photos,
            commands,
            completions_tx,
            completions_rx,
        };
        Ok((
            runtime,
            TableHandle {
                commands: commands_tx,
            },
        ))
    }

    /// Establishes identity, subscribes to the feed and processes events
    /// until every [`TableHandle`] is dropped. Returns the view.
    #[instrument(skip(self))]
    pub async fn run(mut self) -> Result<V, SyncError> {
        let principal = self
            .collaborators
            .auth
            .ensure_identity()
            .await
            .map_err(SyncError::Auth)?;
        info!(uid = %principal.uid, "identity established");

        let (feed_tx, mut feed_rx) = mpsc::unbounded_channel();
        let _subscription = self
            .collaborators
            .feed
            .subscribe(feed_tx)
            .await
            .map_err(|source| SyncError::Remote {
                operation: "subscribe",
                source,
            })?;

        let mut feed_open = true;
        loop {
            let deadline = self.engine.next_deadline();
            let event = tokio::select! {
                biased;
                Some(event) = self.completions_rx.recv() => event,
                change = feed_rx.recv(), if feed_open => match change {
                    Some(change) => Event::Remote(change),
                    None => {
                        warn!("remote feed closed");
                        feed_open = false;
                        continue;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(command) => Event::User(command),
                    None => break,
                },
                () = wait_until(deadline) => Event::Tick,
            };
            self.dispatch(event);
        }

        debug!("all handles dropped, stopping");
        Ok(self.view)
    }

    fn dispatch(&mut self, event: Event) {
        for effect in self.engine.update(event, Instant::now()) {
            self.execute(effect);
        }
    }

    fn execute(&mut self, effect: Effect) {
        let tx = self.completions_tx.clone();
        match effect {
            Effect::View(command) => command.apply_to(&mut self.view),
            Effect::WriteField {
                record,
                field,
                patch,
                issued_at,
            } => {
                let (writer, auth, policy) = self.writer_parts();
                tokio::spawn(async move {
                    let result = persist_patch(&*writer, &*auth, &record, &patch, &policy).await;
                    let _ = tx.send(Event::FieldWritten {
                        record,
                        field,
                        patch,
                        issued_at,
                        result,
                    });
                });
            }
            Effect::SavePanel {
                record,
                patch,
                issued_at,
            } => {
                let (writer, auth, policy) = self.writer_parts();
                tokio::spawn(async move {
                    let result = persist_patch(&*writer, &*auth, &record, &patch, &policy).await;
                    let _ = tx.send(Event::PanelSaved {
                        record,
                        patch,
                        issued_at,
                        result,
                    });
                });
            }
            Effect::UploadPhoto {
                record,
                token,
                blob,
                issued_at,
            } => {
                let photos = self.photos.clone();
                tokio::spawn(async move {
                    let result = photos.attach(&record, blob).await;
                    let _ = tx.send(Event::PhotoAttached {
                        record,
                        token,
                        issued_at,
                        result,
                    });
                });
            }
            Effect::DetachPhoto {
                record,
                previous,
                issued_at,
            } => {
                let photos = self.photos.clone();
                tokio::spawn(async move {
                    let result = photos.detach(&record, previous).await;
                    let _ = tx.send(Event::PhotoDetached {
                        record,
                        issued_at,
                        result,
                    });
                });
            }
            Effect::CreateRecord { prefill } => {
                let (writer, auth, _) = self.writer_parts();
                tokio::spawn(async move {
                    let result = create_record(&*writer, &*auth, &prefill).await;
                    let _ = tx.send(Event::RecordCreated(result));
                });
            }
            Effect::DeleteRecord(record) => {
                let (writer, auth, _) = self.writer_parts();
                tokio::spawn(async move {
                    let result = delete_record(&*writer, &*auth, &record).await;
                    let _ = tx.send(Event::RecordDeleted { record, result });
                });
            }
        }
    }

    fn writer_parts(&self) -> (Arc<dyn RemoteWriter>, Arc<dyn AuthGate>, WritePolicy) {
        (
            self.collaborators.writer.clone(),
            self.collaborators.auth.clone(),
            self.policy.clone(),
        )
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[instrument(skip_all)]
async fn create_record(
    writer: &dyn RemoteWriter,
    auth: &dyn AuthGate,
    prefill: &Fields,
) -> Result<RecordId, SyncError> {
    let principal = auth.ensure_identity().await.map_err(SyncError::Auth)?;
    let record = NewRecord::from_prefill(prefill, Some(principal.uid), UnixTimeMs::now());
    writer
        .create(&record)
        .await
        .map_err(|source| SyncError::Remote {
            operation: "create",
            source,
        })
}

#[instrument(skip(writer, auth), fields(record = %record))]
async fn delete_record(
    writer: &dyn RemoteWriter,
    auth: &dyn AuthGate,
    record: &RecordId,
) -> Result<(), SyncError> {
    auth.ensure_identity().await.map_err(SyncError::Auth)?;
    writer
        .delete(record)
        .await
        .map_err(|source| SyncError::Remote {
            operation: "delete",
            source,
        })
}
