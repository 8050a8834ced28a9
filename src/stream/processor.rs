use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::backoff::Backoff;
use super::event_source::{EventSource, HttpEventSource};
use super::StreamError;
use crate::codec::{self, StoreUpdate};
use crate::config::StreamingConfig;
use crate::store::DataStore;

const MESSAGE_QUEUE_CAPACITY: usize = 100;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DataSourceState {
    /// No data has been received yet.
    #[default]
    Initializing,
    /// The store holds a complete data set and the stream is connected.
    Valid,
    /// The store was initialized, but the connection was lost and is being re-established.
    Interrupted,
    /// The processor has stopped, either because it was shut down or because of an
    /// unrecoverable error.
    Off,
}

/// Describes the most recent failure of the stream connection.
#[derive(Clone, Debug, PartialEq)]
pub struct DataSourceError {
    pub message: String,
    pub status_code: Option<u16>,
    pub recoverable: bool,
    pub time: DateTime<Utc>,
}

impl From<&StreamError> for DataSourceError {
    fn from(error: &StreamError) -> Self {
        Self {
            message: error.to_string(),
            status_code: error.status_code(),
            recoverable: error.is_recoverable(),
            time: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DataSourceStatus {
    pub state: DataSourceState,
    pub last_error: Option<DataSourceError>,
}

/// StreamProcessor keeps a [DataStore] up to date with the streaming service.
///
/// One task owns the connection and decodes events; a second task applies the decoded updates to
/// the store one at a time, in the order they arrived, and publishes the status.
pub struct StreamProcessor {
    source: Arc<dyn EventSource>,
    store: Arc<dyn DataStore>,
    config: StreamingConfig,
}

impl StreamProcessor {
    /// Create a processor reading from the HTTP stream described by `config`.
    pub fn new(config: StreamingConfig, store: Arc<dyn DataStore>) -> Result<Self, StreamError> {
        let source = HttpEventSource::new(&config)?;
        Ok(Self::with_event_source(Arc::new(source), config, store))
    }

    /// Create a processor reading from a custom event source. Only the backoff settings of
    /// `config` are used.
    pub fn with_event_source(
        source: Arc<dyn EventSource>,
        config: StreamingConfig,
        store: Arc<dyn DataStore>,
    ) -> Self {
        Self {
            source,
            store,
            config,
        }
    }

    /// Start synchronizing in the background. Must be called from within a tokio runtime.
    ///
    /// Dropping the returned handle stops the processor as if [StreamHandle::shutdown] had been
    /// called, without waiting for it.
    pub fn start(self) -> StreamHandle {
        let (status_tx, status_rx) = watch::channel(DataSourceStatus::default());
        let (message_tx, message_rx) = mpsc::channel(MESSAGE_QUEUE_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let applier = tokio::spawn(apply_messages(self.store.clone(), message_rx, status_tx));
        let task = tokio::spawn(async move {
            self.run(message_tx, shutdown_rx).await;
            if let Err(e) = applier.await {
                error!("Stream update task failed: {}", e);
            }
            debug!("Stream processor stopped");
        });

        StreamHandle {
            status: status_rx,
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn run(self, messages: mpsc::Sender<Message>, mut shutdown: oneshot::Receiver<()>) {
        let mut backoff = Backoff::new(
            self.config.initial_reconnect_delay,
            self.config.max_reconnect_delay,
            self.config.backoff_reset_interval,
        );
        let mut first_attempt = true;

        loop {
            if !first_attempt {
                let delay = backoff.next_delay();
                info!("Reconnecting to stream in {:?}", delay);
                tokio::select! {
                    _ = &mut shutdown => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            first_attempt = false;

            let result = tokio::select! {
                _ = &mut shutdown => return,
                result = self.consume(&messages, &mut backoff) => result,
            };
            let err = match result {
                Ok(()) => return,
                Err(err) => err,
            };

            let recoverable = err.is_recoverable();
            if !recoverable {
                error!("Stream failed with unrecoverable error, giving up: {}", err);
            } else if let StreamError::InvalidData(_) = err {
                error!("Received malformed data from stream, restarting: {}", err);
            } else {
                warn!("Stream connection failed: {}", err);
            }

            let failed = Message::Failed(DataSourceError::from(&err));
            if messages.send(failed).await.is_err() || !recoverable {
                return;
            }
        }
    }

    /// Read one connection until it fails. Returns `Ok` only if the applier has gone away.
    async fn consume(
        &self,
        messages: &mpsc::Sender<Message>,
        backoff: &mut Backoff,
    ) -> Result<(), StreamError> {
        let mut events = self.source.connect().await?;
        debug!("Connected to stream");
        backoff.connected();

        while let Some(event) = events.next().await {
            let event = event?;
            if let Some(update) = codec::parse_event(event.event(), event.data())? {
                if messages.send(Message::Update(update)).await.is_err() {
                    return Ok(());
                }
            }
        }
        Err(StreamError::Eof)
    }
}

/// What the connection task hands to the applier, in arrival order.
enum Message {
    Update(StoreUpdate),
    Failed(DataSourceError),
}

/// Applies messages one at a time and publishes the resulting status. Runs until the connection
/// task drops its sender, then reports the processor as off.
async fn apply_messages(
    store: Arc<dyn DataStore>,
    mut messages: mpsc::Receiver<Message>,
    status: watch::Sender<DataSourceStatus>,
) {
    while let Some(message) = messages.recv().await {
        match message {
            Message::Update(StoreUpdate::Init(data)) => {
                debug!(
                    "Received {} flags and {} segments",
                    data.flags.len(),
                    data.segments.len()
                );
                store.init(data);
                status.send_modify(|status| status.state = DataSourceState::Valid);
            }
            Message::Update(StoreUpdate::Upsert { kind, key, item }) => {
                let version = item.version;
                if !store.upsert(kind, &key, item) {
                    debug!(
                        "Ignored update of {} {} to version {}; store holds the same or a newer version",
                        kind.namespace(),
                        key,
                        version
                    );
                }
            }
            Message::Failed(error) => status.send_modify(|status| {
                if !error.recoverable {
                    status.state = DataSourceState::Off;
                } else if status.state == DataSourceState::Valid {
                    status.state = DataSourceState::Interrupted;
                }
                status.last_error = Some(error);
            }),
        }
    }
    status.send_modify(|status| status.state = DataSourceState::Off);
}

/// Controls a running [StreamProcessor].
pub struct StreamHandle {
    status: watch::Receiver<DataSourceStatus>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl StreamHandle {
    /// The current status of the processor.
    pub fn status(&self) -> DataSourceStatus {
        self.status.borrow().clone()
    }

    /// A receiver notified of every status change.
    pub fn subscribe(&self) -> watch::Receiver<DataSourceStatus> {
        self.status.clone()
    }

    /// Wait until the store has been initialized from the stream. Returns false if that did not
    /// happen within `timeout`, or if the processor stopped first.
    pub async fn wait_for_initialization(&self, timeout: Duration) -> bool {
        let mut status = self.status.clone();
        let initialized = tokio::time::timeout(
            timeout,
            status.wait_for(|status| status.state != DataSourceState::Initializing),
        )
        .await;

        match initialized {
            Ok(Ok(status)) => status.state != DataSourceState::Off,
            Ok(Err(_)) | Err(_) => false,
        }
    }

    /// Stop the processor and wait for it to finish. Updates already received are applied
    /// before this returns; a connection attempt or read in progress is abandoned.
    pub async fn shutdown(self) {
        let StreamHandle { shutdown, task, .. } = self;
        // An error means the processor has already stopped.
        let _ = shutdown.send(());
        if let Err(e) = task.await {
            error!("Stream processor task failed: {}", e);
        }
    }
}
