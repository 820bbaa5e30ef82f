//! Directory lookup contracts: one remote search per source record, retried on
//! transient failures and parsed into candidate extracts.

use std::sync::Arc;

use async_trait::async_trait;
use edl_core::{non_empty, CandidateExtract, CandidatePool, SourceRecord};
use edl_storage::{BackoffPolicy, FetchError, FetchedResponse, HttpFetcher};
use futures::{StreamExt, TryStreamExt};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

mod observer;

pub use observer::{
    ConnectionErrorEvent, LookupObserver, ParseErrorEvent, ProgressEvent, TracingObserver,
};

pub const CRATE_NAME: &str = "edl-adapters";

pub const DEFAULT_REPORT_INTERVAL: usize = 250;
pub const DEFAULT_COUNTRY_CODE: &str = "US";
pub const DEFAULT_PHONE_LIMIT: u32 = 2;
pub const DEFAULT_SEARCH_LIMIT: u32 = 15;
pub const DEFAULT_SEARCH_SORT: u32 = 1;

/// Query parameters of one directory request, in the order they are sent.
pub type QueryParams = Vec<(&'static str, String)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    PhoneSearch,
    TermSearch,
}

impl Endpoint {
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::PhoneSearch => "phone_search",
            Endpoint::TermSearch => "search",
        }
    }
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("unexpected directory payload for source {record_id}: {message}")]
    UnexpectedPayload {
        record_id: String,
        message: String,
        payload: String,
    },
    #[error("directory request for source {record_id} failed: {source}")]
    Fetch {
        record_id: String,
        #[source]
        source: FetchError,
    },
}

/// One GET against the directory API.
#[async_trait]
pub trait DirectoryTransport: Send + Sync {
    async fn get(&self, endpoint: Endpoint, params: &[(&'static str, String)])
        -> Result<FetchedResponse, FetchError>;
}

/// reqwest-backed transport rooted at the directory's base URL.
#[derive(Debug)]
pub struct DirectoryClient {
    fetcher: HttpFetcher,
    base_url: String,
}

impl DirectoryClient {
    pub fn new(fetcher: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            fetcher,
            base_url: base_url.into(),
        }
    }

    pub fn url_for(&self, endpoint: Endpoint) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), endpoint.path())
    }
}

#[async_trait]
impl DirectoryTransport for DirectoryClient {
    async fn get(
        &self,
        endpoint: Endpoint,
        params: &[(&'static str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        self.fetcher.get_with_query(&self.url_for(endpoint), params).await
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    businesses: Option<Vec<BusinessEntry>>,
}

#[derive(Debug, Deserialize)]
struct BusinessEntry {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    phone: Option<String>,
    #[serde(default)]
    location: Option<LocationEntry>,
    #[serde(default)]
    categories: Vec<Vec<String>>,
    #[serde(default)]
    review_count: Option<u32>,
    #[serde(default)]
    rating: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct LocationEntry {
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    address: Vec<String>,
    #[serde(default)]
    postal_code: Option<String>,
    #[serde(default)]
    neighborhoods: Vec<String>,
}

/// A payload that could not be mapped into candidates.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseFailure {
    pub message: String,
    pub payload: String,
    /// The payload carries an `error` object: the directory's own "no result" answer.
    pub recognized_empty: bool,
}

/// Map a directory search payload into a candidate pool. `total == 0` is an
/// empty pool, not a failure.
pub fn parse_search_response(body: &[u8]) -> Result<CandidatePool, ParseFailure> {
    let payload = String::from_utf8_lossy(body).into_owned();
    let value: serde_json::Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(err) => {
            return Err(ParseFailure {
                message: format!("invalid json: {err}"),
                payload,
                recognized_empty: false,
            })
        }
    };
    let recognized_empty = value.get("error").is_some();

    let response: SearchResponse = match serde_json::from_value(value) {
        Ok(response) => response,
        Err(err) => {
            return Err(ParseFailure {
                message: format!("unexpected shape: {err}"),
                payload,
                recognized_empty,
            })
        }
    };

    if response.total == Some(0) {
        return Ok(Vec::new());
    }

    let Some(businesses) = response.businesses else {
        return Err(ParseFailure {
            message: "missing businesses list".to_string(),
            payload,
            recognized_empty,
        });
    };

    Ok(businesses.into_iter().filter_map(entry_to_extract).collect())
}

fn entry_to_extract(entry: BusinessEntry) -> Option<CandidateExtract> {
    let Some(directory_id) = non_empty(entry.id.as_deref()) else {
        debug!(name = ?entry.name, "skipping directory entry without id");
        return None;
    };
    let location = entry.location.unwrap_or_default();

    Some(CandidateExtract {
        directory_id,
        name: non_empty(entry.name.as_deref()),
        address: non_empty(location.address.first().map(String::as_str)),
        city: non_empty(location.city.as_deref()),
        postal_code: non_empty(location.postal_code.as_deref()),
        phone: non_empty(entry.phone.as_deref().map(|p| p.trim_start_matches('+'))),
        review_count: entry.review_count,
        rating: entry.rating,
        categories: entry
            .categories
            .into_iter()
            .filter_map(|tags| tags.into_iter().next())
            .collect(),
        neighborhoods: location.neighborhoods,
    })
}

/// Retry-and-report skeleton shared by every lookup strategy.
#[derive(Clone)]
pub struct LookupInterfacer {
    transport: Arc<dyn DirectoryTransport>,
    backoff: BackoffPolicy,
    observer: Arc<dyn LookupObserver>,
    report_interval: usize,
}

impl LookupInterfacer {
    pub fn new(transport: Arc<dyn DirectoryTransport>, backoff: BackoffPolicy) -> Self {
        Self {
            transport,
            backoff,
            observer: Arc::new(TracingObserver),
            report_interval: DEFAULT_REPORT_INTERVAL,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn LookupObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_report_interval(mut self, report_interval: usize) -> Self {
        self.report_interval = report_interval.max(1);
        self
    }

    pub fn observer(&self) -> &dyn LookupObserver {
        self.observer.as_ref()
    }

    pub fn report_interval(&self) -> usize {
        self.report_interval
    }

    /// Run one request for `record`, retrying transient failures.
    ///
    /// Exhausted retries give an empty pool. Payloads that fail to parse are
    /// reported; the directory's "no result" error is an empty pool and
    /// anything else is [`LookupError::UnexpectedPayload`].
    pub async fn fetch(
        &self,
        record: &SourceRecord,
        endpoint: Endpoint,
        params: &[(&'static str, String)],
    ) -> Result<CandidatePool, LookupError> {
        let max_attempts = self.backoff.max_attempts.max(1);
        let mut response = None;

        for attempt in 0..max_attempts {
            match self.transport.get(endpoint, params).await {
                Ok(resp) => {
                    response = Some(resp);
                    break;
                }
                Err(err) if err.is_transient() => {
                    self.observer.on_connection_error(&ConnectionErrorEvent {
                        record,
                        endpoint,
                        params,
                        attempt: attempt + 1,
                        max_attempts,
                        error: &err,
                    });
                    if attempt + 1 < max_attempts {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                    }
                }
                Err(err) => {
                    self.observer.on_fatal_error(&ConnectionErrorEvent {
                        record,
                        endpoint,
                        params,
                        attempt: attempt + 1,
                        max_attempts,
                        error: &err,
                    });
                    return Err(LookupError::Fetch {
                        record_id: record.id.clone(),
                        source: err,
                    })
                }
            }
        }

        let Some(response) = response else {
            return Ok(Vec::new());
        };

        match parse_search_response(&response.body) {
            Ok(pool) => Ok(pool),
            Err(failure) => {
                self.observer.on_parse_error(&ParseErrorEvent {
                    record,
                    endpoint,
                    status: response.status.as_u16(),
                    payload: &failure.payload,
                    message: &failure.message,
                    recognized_empty: failure.recognized_empty,
                });
                if failure.recognized_empty {
                    Ok(Vec::new())
                } else {
                    Err(LookupError::UnexpectedPayload {
                        record_id: record.id.clone(),
                        message: failure.message,
                        payload: failure.payload,
                    })
                }
            }
        }
    }
}

/// One lookup strategy: source record in, candidate pool out.
#[async_trait]
pub trait DirectoryLookup: Send + Sync {
    async fn lookup(&self, record: &SourceRecord) -> Result<CandidatePool, LookupError>;

    fn observer(&self) -> &dyn LookupObserver;

    fn report_interval(&self) -> usize {
        DEFAULT_REPORT_INTERVAL
    }
}

/// Phone-keyed search. Records without a phone never hit the network.
pub struct PhoneLookup {
    interfacer: LookupInterfacer,
    country_code: String,
    limit: u32,
}

impl PhoneLookup {
    pub fn new(interfacer: LookupInterfacer) -> Self {
        Self {
            interfacer,
            country_code: DEFAULT_COUNTRY_CODE.to_string(),
            limit: DEFAULT_PHONE_LIMIT,
        }
    }

    pub fn with_country_code(mut self, country_code: impl Into<String>) -> Self {
        self.country_code = country_code.into();
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit.max(1);
        self
    }

    pub fn params_for(&self, phone: &str) -> QueryParams {
        vec![
            ("phone", phone.to_string()),
            ("cc", self.country_code.clone()),
            ("limit", self.limit.to_string()),
        ]
    }
}

#[async_trait]
impl DirectoryLookup for PhoneLookup {
    async fn lookup(&self, record: &SourceRecord) -> Result<CandidatePool, LookupError> {
        let Some(phone) = record.phone.as_deref() else {
            return Ok(Vec::new());
        };
        let params = self.params_for(phone);
        let mut pool = self
            .interfacer
            .fetch(record, Endpoint::PhoneSearch, &params)
            .await?;
        // A phone hit is trusted as-is, so only the directory's top answer is kept.
        pool.truncate(1);
        Ok(pool)
    }

    fn observer(&self) -> &dyn LookupObserver {
        self.interfacer.observer()
    }

    fn report_interval(&self) -> usize {
        self.interfacer.report_interval()
    }
}

/// Name + location text search with a caller-chosen result cap and sort order.
pub struct AddressLookup {
    interfacer: LookupInterfacer,
    limit: u32,
    sort: u32,
}

impl AddressLookup {
    pub fn new(interfacer: LookupInterfacer) -> Self {
        Self {
            interfacer,
            limit: DEFAULT_SEARCH_LIMIT,
            sort: DEFAULT_SEARCH_SORT,
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit.max(1);
        self
    }

    pub fn with_sort(mut self, sort: u32) -> Self {
        self.sort = sort;
        self
    }

    pub fn params_for(&self, record: &SourceRecord) -> QueryParams {
        vec![
            ("term", record.name.clone().unwrap_or_default()),
            ("location", record.location_query()),
            ("limit", self.limit.to_string()),
            ("sort", self.sort.to_string()),
        ]
    }
}

#[async_trait]
impl DirectoryLookup for AddressLookup {
    async fn lookup(&self, record: &SourceRecord) -> Result<CandidatePool, LookupError> {
        let params = self.params_for(record);
        self.interfacer
            .fetch(record, Endpoint::TermSearch, &params)
            .await
    }

    fn observer(&self) -> &dyn LookupObserver {
        self.interfacer.observer()
    }

    fn report_interval(&self) -> usize {
        self.interfacer.report_interval()
    }
}

/// Look up every record with at most `concurrency` requests in flight.
///
/// Results come back in input order regardless of completion order. A record
/// whose retries run out contributes an empty pool; a fatal lookup error
/// stops the batch.
pub async fn pull_records(
    lookup: &dyn DirectoryLookup,
    records: Vec<SourceRecord>,
    concurrency: usize,
) -> Result<Vec<(SourceRecord, CandidatePool)>, LookupError> {
    let total = records.len();
    let observer = lookup.observer();
    let interval = lookup.report_interval().max(1);

    if total > 0 {
        observer.on_progress(&ProgressEvent::BatchStarted { total });
    }

    let results = futures::stream::iter(records.into_iter().enumerate())
        .map(|(index, record)| async move {
            let reported = index % interval == 0;
            if reported {
                observer.on_progress(&ProgressEvent::RecordStarted { index, total });
            }
            let pool = lookup.lookup(&record).await?;
            if reported {
                observer.on_progress(&ProgressEvent::RecordCompleted { index, total });
            }
            Ok::<_, LookupError>((record, pool))
        })
        .buffered(concurrency.max(1))
        .try_collect::<Vec<_>>()
        .await?;

    if total > 0 {
        observer.on_progress(&ProgressEvent::BatchCompleted { total });
    }
    Ok(results)
}
