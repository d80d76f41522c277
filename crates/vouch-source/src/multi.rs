//! Concurrent fan-out over several sources.
//!
//! Each child search runs on its own task. Results and errors flow
//! through separate channels into two collectors; the aggregate is
//! all-or-nothing, so any child error discards every partial result
//! and cancels the children still searching.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::SourceError;
use crate::{CollectionEnvelope, Sourcer};

/// [`Sourcer`] that queries every child concurrently.
#[derive(Default)]
pub struct MultiSource {
    sources: Vec<Arc<dyn Sourcer>>,
}

impl MultiSource {
    /// Fan out over `sources`.
    #[must_use]
    pub fn new(sources: Vec<Arc<dyn Sourcer>>) -> Self {
        Self { sources }
    }

    /// Add another child.
    pub fn push(&mut self, source: Arc<dyn Sourcer>) {
        self.sources.push(source);
    }

    /// Number of children.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// True when there are no children.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl std::fmt::Debug for MultiSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiSource")
            .field("sources", &self.sources.len())
            .finish()
    }
}

#[async_trait]
impl Sourcer for MultiSource {
    async fn search(
        &self,
        cancel: &CancellationToken,
        collection_name: &str,
        subject_digests: &[String],
        attestations: &[String],
    ) -> Result<Vec<CollectionEnvelope>, SourceError> {
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<Vec<CollectionEnvelope>>();
        let (error_tx, mut error_rx) = mpsc::unbounded_channel::<SourceError>();
        let child_cancel = cancel.child_token();

        let mut workers = JoinSet::new();
        for source in &self.sources {
            let source = Arc::clone(source);
            let cancel = child_cancel.clone();
            let name = collection_name.to_owned();
            let digests = subject_digests.to_vec();
            let types = attestations.to_vec();
            let result_tx = result_tx.clone();
            let error_tx = error_tx.clone();
            workers.spawn(async move {
                match source.search(&cancel, &name, &digests, &types).await {
                    Ok(found) => {
                        let _ = result_tx.send(found);
                    }
                    Err(e) => {
                        let _ = error_tx.send(e);
                    }
                }
            });
        }
        drop(result_tx);
        drop(error_tx);

        let results = tokio::spawn(async move {
            let mut all = Vec::new();
            while let Some(batch) = result_rx.recv().await {
                all.extend(batch);
            }
            all
        });
        // First error wins and stops the siblings; later errors are
        // dropped with the receiver.
        let siblings = child_cancel.clone();
        let first_error = tokio::spawn(async move {
            let first = error_rx.recv().await;
            if first.is_some() {
                siblings.cancel();
            }
            first
        });

        let mut join_failure = None;
        let finished = tokio::select! {
            biased;
            () = cancel.cancelled() => false,
            () = async {
                while let Some(joined) = workers.join_next().await {
                    if let Err(e) = joined {
                        join_failure.get_or_insert(SourceError::TaskFailed(e.to_string()));
                    }
                }
            } => true,
        };
        if !finished {
            child_cancel.cancel();
            workers.abort_all();
            results.abort();
            first_error.abort();
            tracing::debug!(collection = %collection_name, "multi-source search cancelled");
            return Err(SourceError::Cancelled);
        }

        let first_error = first_error
            .await
            .map_err(|e| SourceError::TaskFailed(e.to_string()))?;
        if let Some(e) = first_error.or(join_failure) {
            tracing::warn!(collection = %collection_name, error = %e, "multi-source search failed");
            return Err(e);
        }
        results
            .await
            .map_err(|e| SourceError::TaskFailed(e.to_string()))
    }
}
