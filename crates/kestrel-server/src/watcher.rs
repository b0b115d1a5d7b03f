//! Debounced processing of watched-file notifications.
//!
//! Editors fire bursts of events (save-all, branch switches), and every
//! burst may trigger a Bazel re-query. Events are therefore collected
//! until the stream has been quiet for the debounce window, then applied
//! to the target store in one batch.

use kestrel_bazel::{CompileArgsExtractor, FileChange, FileChangeKind, TargetStore};
use kestrel_bsp::types::{
    self, BuildTargetEvent, BuildTargetIdentifier, DidChangeBuildTargetParams,
};
use kestrel_bsp::Outgoing;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const DEBOUNCE_WINDOW: Duration = Duration::from_secs(1);

/// Extensions whose changes can affect targets or compile arguments.
const WATCHED_EXTENSIONS: &[&str] = &["swift", "h", "m"];

pub struct WatchDebouncer {
    tx: mpsc::Sender<Vec<FileChange>>,
}

impl WatchDebouncer {
    pub fn new(
        store: Arc<TargetStore>,
        extractor: Arc<CompileArgsExtractor>,
        outgoing: Outgoing,
        window: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Vec<FileChange>>();
        thread::Builder::new()
            .name("kestrel-watch-debouncer".to_string())
            .spawn(move || debounce_loop(rx, window, store, extractor, outgoing))
            .expect("failed to spawn watch debouncer thread");
        Self { tx }
    }

    /// Queue a batch of raw watcher events; processing happens after the
    /// stream has been quiet for the debounce window.
    pub fn enqueue(&self, changes: Vec<FileChange>) {
        if changes.is_empty() {
            return;
        }
        if self.tx.send(changes).is_err() {
            tracing::error!(
                target = "kestrel.server",
                "watch debouncer thread is gone; dropping file events"
            );
        }
    }
}

fn debounce_loop(
    rx: mpsc::Receiver<Vec<FileChange>>,
    window: Duration,
    store: Arc<TargetStore>,
    extractor: Arc<CompileArgsExtractor>,
    outgoing: Outgoing,
) {
    while let Ok(first) = rx.recv() {
        let mut batch = first;
        loop {
            match rx.recv_timeout(window) {
                Ok(more) => batch.extend(more),
                Err(mpsc::RecvTimeoutError::Timeout) => break,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        process_batch(&batch, &store, &extractor, &outgoing);
    }
}

fn process_batch(
    batch: &[FileChange],
    store: &TargetStore,
    extractor: &CompileArgsExtractor,
    outgoing: &Outgoing,
) {
    let relevant: Vec<FileChange> = batch
        .iter()
        .filter(|change| has_watched_extension(&change.path))
        .cloned()
        .collect();
    if relevant.is_empty() {
        return;
    }

    tracing::debug!(
        target = "kestrel.server",
        events = relevant.len(),
        "processing debounced file changes"
    );

    let invalidated = match store.process_file_changes(&relevant) {
        Ok(invalidated) => invalidated,
        Err(err) => {
            tracing::error!(
                target = "kestrel.server",
                error = %err,
                "failed to process file changes"
            );
            return;
        }
    };

    // Creations and deletions can change which compile actions exist, so
    // the extractor's per-file cache is only safe across plain edits.
    let structural = relevant
        .iter()
        .any(|change| change.kind != FileChangeKind::Changed);
    if structural {
        extractor.clear_cache();
    }

    if invalidated.is_empty() {
        return;
    }

    let changes: Vec<BuildTargetEvent> = invalidated
        .into_iter()
        .map(|uri| BuildTargetEvent {
            target: BuildTargetIdentifier { uri },
            kind: Some(types::BUILD_TARGET_EVENT_CHANGED),
        })
        .collect();
    outgoing.notify(
        types::methods::BUILD_TARGET_DID_CHANGE,
        DidChangeBuildTargetParams { changes },
    );
}

fn has_watched_extension(path: &str) -> bool {
    path.rsplit_once('.')
        .map(|(_, ext)| WATCHED_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}
