//! Observer hooks for lookup progress and failures.

use edl_core::SourceRecord;
use edl_storage::FetchError;
use tracing::{error, info, warn};

use crate::Endpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent {
    BatchStarted { total: usize },
    RecordStarted { index: usize, total: usize },
    RecordCompleted { index: usize, total: usize },
    BatchCompleted { total: usize },
}

/// A transport failure on one attempt; `attempt` is 1-based.
#[derive(Debug)]
pub struct ConnectionErrorEvent<'a> {
    pub record: &'a SourceRecord,
    pub endpoint: Endpoint,
    pub params: &'a [(&'static str, String)],
    pub attempt: usize,
    pub max_attempts: usize,
    pub error: &'a FetchError,
}

#[derive(Debug)]
pub struct ParseErrorEvent<'a> {
    pub record: &'a SourceRecord,
    pub endpoint: Endpoint,
    pub status: u16,
    pub payload: &'a str,
    pub message: &'a str,
    pub recognized_empty: bool,
}

/// Receives lookup narration. Purely observational: nothing here can change
/// what a lookup returns.
pub trait LookupObserver: Send + Sync {
    fn on_progress(&self, _event: &ProgressEvent) {}

    fn on_connection_error(&self, _event: &ConnectionErrorEvent<'_>) {}

    /// A transport failure that will not be retried; the lookup fails right after.
    fn on_fatal_error(&self, _event: &ConnectionErrorEvent<'_>) {}

    fn on_parse_error(&self, _event: &ParseErrorEvent<'_>) {}
}

/// Default observer: structured `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl LookupObserver for TracingObserver {
    fn on_progress(&self, event: &ProgressEvent) {
        match *event {
            ProgressEvent::BatchStarted { total } => info!(total, "records to pull"),
            ProgressEvent::RecordStarted { index, total } => {
                info!(index, total, "pulling record")
            }
            ProgressEvent::RecordCompleted { index, total } => {
                info!(index, total, "record completed")
            }
            ProgressEvent::BatchCompleted { total } => info!(total, "pull completed"),
        }
    }

    fn on_connection_error(&self, event: &ConnectionErrorEvent<'_>) {
        warn!(
            record = ?event.record,
            endpoint = event.endpoint.path(),
            params = ?event.params,
            attempt = event.attempt,
            max_attempts = event.max_attempts,
            error = %event.error,
            "directory connection error"
        );
    }

    fn on_fatal_error(&self, event: &ConnectionErrorEvent<'_>) {
        error!(
            record = ?event.record,
            endpoint = event.endpoint.path(),
            params = ?event.params,
            attempt = event.attempt,
            error = %event.error,
            "directory request failed; not retrying"
        );
    }

    fn on_parse_error(&self, event: &ParseErrorEvent<'_>) {
        if event.recognized_empty {
            warn!(
                record = ?event.record,
                endpoint = event.endpoint.path(),
                status = event.status,
                payload = event.payload,
                "directory answered with an error payload; treating as no result"
            );
        } else {
            error!(
                record = ?event.record,
                endpoint = event.endpoint.path(),
                status = event.status,
                payload = event.payload,
                message = event.message,
                "could not parse directory response"
            );
        }
    }
}
