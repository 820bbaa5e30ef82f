//! Two-pass linking run: phone matches first, then name + address on the rest.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use edl_adapters::{
    AddressLookup, DirectoryClient, DirectoryLookup, DirectoryTransport, LookupInterfacer,
    PhoneLookup,
};
use edl_core::{MatchedPair, Pass};
use edl_storage::{
    FixtureMatchSink, FixtureSourceTable, HttpFetcher, MatchSink, PgMatchSink, PgSourceTable,
    SourceScope, SourceTable,
};
use serde::Serialize;
use sqlx::PgPool;
use tokio::fs;
use tracing::info;
use uuid::Uuid;

use crate::config::{LinkConfig, MatchingConfig};
use crate::coordinator::{PullCoordinator, PullError, Pulled};
use crate::matcher::{ByAddressMatcher, ByPhoneMatcher, ExtractMatcher};

/// What one run pulls. `n_pull: None` reads from `offset` to the end of the table.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkRequest {
    pub n_pull: Option<u64>,
    pub offset: u64,
    pub create_tables: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PassSummary {
    pub pulled: usize,
    pub matched: usize,
    pub stored: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub offset: u64,
    pub n_pull: Option<u64>,
    pub phone: PassSummary,
    pub address: PassSummary,
    pub reports_dir: String,
}

#[derive(Serialize)]
struct MatchRow<'a> {
    pass: Pass,
    #[serde(flatten)]
    pair: &'a MatchedPair,
}

pub struct LinkPipeline {
    source: Arc<dyn SourceTable>,
    sink: Arc<dyn MatchSink>,
    phone_lookup: Arc<dyn DirectoryLookup>,
    address_lookup: Arc<dyn DirectoryLookup>,
    address_matcher: ByAddressMatcher,
    concurrency: usize,
    workspace_root: PathBuf,
}

impl LinkPipeline {
    pub fn new(
        source: Arc<dyn SourceTable>,
        sink: Arc<dyn MatchSink>,
        phone_lookup: Arc<dyn DirectoryLookup>,
        address_lookup: Arc<dyn DirectoryLookup>,
    ) -> Self {
        Self {
            source,
            sink,
            phone_lookup,
            address_lookup,
            address_matcher: ByAddressMatcher::default(),
            concurrency: 1,
            workspace_root: PathBuf::from("."),
        }
    }

    /// Wire both lookups to the configured directory over one shared HTTP client.
    pub fn from_config(
        config: &LinkConfig,
        source: Arc<dyn SourceTable>,
        sink: Arc<dyn MatchSink>,
        matching: MatchingConfig,
    ) -> Result<Self> {
        let fetcher = HttpFetcher::new(config.http_client_config())?;
        let transport: Arc<dyn DirectoryTransport> =
            Arc::new(DirectoryClient::new(fetcher, config.directory_base_url.clone()));
        let interfacer = LookupInterfacer::new(transport, config.backoff_policy())
            .with_report_interval(config.report_interval);

        let phone = PhoneLookup::new(interfacer.clone())
            .with_country_code(config.country_code.clone())
            .with_limit(config.phone_limit);
        let address = AddressLookup::new(interfacer)
            .with_limit(config.search_limit)
            .with_sort(config.search_sort);

        Ok(Self::new(source, sink, Arc::new(phone), Arc::new(address))
            .with_matching(matching)
            .with_concurrency(config.lookup_concurrency)
            .with_workspace_root(config.workspace_root.clone()))
    }

    pub fn with_matching(mut self, matching: MatchingConfig) -> Self {
        self.address_matcher = ByAddressMatcher::new(matching);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_workspace_root(mut self, root: PathBuf) -> Self {
        self.workspace_root = root;
        self
    }

    pub async fn run(&self, request: LinkRequest) -> Result<LinkRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, offset = request.offset, n_pull = ?request.n_pull, "link run started");

        if request.create_tables {
            self.sink
                .create_schema()
                .await
                .context("creating match tables")?;
        }

        let mut phone_pass = PullCoordinator::new(
            self.source.clone(),
            self.phone_lookup.clone(),
            SourceScope::All,
            request.offset,
        )
        .with_concurrency(self.concurrency);
        let pulled = pull(&mut phone_pass, request.n_pull)
            .await
            .context("phone pass pull")?;
        let phone_pulled = pulled.len();
        let phone_matches = ByPhoneMatcher.match_all(pulled);
        let phone_stored = self
            .sink
            .store(Pass::Phone, &phone_matches)
            .await
            .context("storing phone matches")?;
        info!(
            pulled = phone_pulled,
            matched = phone_matches.len(),
            stored = phone_stored,
            "phone pass finished"
        );

        let phone_ids = phone_matches
            .iter()
            .map(|pair| pair.source.id.as_str())
            .collect::<HashSet<_>>();

        let mut address_pass = PullCoordinator::new(
            self.source.clone(),
            self.address_lookup.clone(),
            SourceScope::Unmatched,
            request.offset,
        )
        .with_concurrency(self.concurrency);
        let pulled = pull(&mut address_pass, request.n_pull)
            .await
            .context("address pass pull")?;
        let address_pulled = pulled.len();
        let address_matches = self
            .address_matcher
            .match_all(pulled)
            .into_iter()
            .filter(|pair| !phone_ids.contains(pair.source.id.as_str()))
            .collect::<Vec<_>>();
        let address_stored = self
            .sink
            .store(Pass::Address, &address_matches)
            .await
            .context("storing address matches")?;
        info!(
            pulled = address_pulled,
            matched = address_matches.len(),
            stored = address_stored,
            "address pass finished"
        );

        let reports_dir = self.workspace_root.join("reports").join(run_id.to_string());
        let summary = LinkRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            offset: request.offset,
            n_pull: request.n_pull,
            phone: PassSummary {
                pulled: phone_pulled,
                matched: phone_matches.len(),
                stored: phone_stored,
            },
            address: PassSummary {
                pulled: address_pulled,
                matched: address_matches.len(),
                stored: address_stored,
            },
            reports_dir: reports_dir.display().to_string(),
        };
        write_reports(&reports_dir, &summary, &phone_matches, &address_matches).await?;
        Ok(summary)
    }
}

async fn pull(coordinator: &mut PullCoordinator, n_pull: Option<u64>) -> Result<Pulled, PullError> {
    match n_pull {
        Some(n) => coordinator.read_next_n(n).await,
        None => coordinator.read_all().await,
    }
}

async fn write_reports(
    reports_dir: &Path,
    summary: &LinkRunSummary,
    phone_matches: &[MatchedPair],
    address_matches: &[MatchedPair],
) -> Result<()> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let markdown = format!(
        "# EDL Link Summary\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Offset: {}\n- Records requested: {}\n\n\
         ## Passes\n| pass | pulled | matched | stored |\n|------|--------|---------|--------|\n\
         | phone | {} | {} | {} |\n| address | {} | {} | {} |\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.offset,
        summary
            .n_pull
            .map(|n| n.to_string())
            .unwrap_or_else(|| "all".to_string()),
        summary.phone.pulled,
        summary.phone.matched,
        summary.phone.stored,
        summary.address.pulled,
        summary.address.matched,
        summary.address.stored,
    );
    fs::write(reports_dir.join("link_summary.md"), markdown)
        .await
        .context("writing link_summary.md")?;

    let rows = phone_matches
        .iter()
        .map(|pair| MatchRow { pass: Pass::Phone, pair })
        .chain(
            address_matches
                .iter()
                .map(|pair| MatchRow { pass: Pass::Address, pair }),
        )
        .collect::<Vec<_>>();
    let matches_json = serde_json::to_vec_pretty(&serde_json::json!({
        "run": summary,
        "matches": rows,
    }))
    .context("serializing matches")?;
    fs::write(reports_dir.join("matches.json"), matches_json)
        .await
        .context("writing matches.json")?;

    Ok(())
}

pub async fn connect_db(database_url: &str) -> Result<PgPool> {
    PgPool::connect(database_url)
        .await
        .context("connecting to DATABASE_URL")
}

/// Create the match tables in the configured database.
pub async fn init_db(config: &LinkConfig) -> Result<()> {
    let pool = connect_db(&config.database_url).await?;
    PgMatchSink::new(pool).create_schema().await?;
    info!("match tables ready");
    Ok(())
}

/// Run one link pass pair against Postgres, or against a JSON fixture of
/// source records when `fixture` is set.
pub async fn run_link(
    config: LinkConfig,
    request: LinkRequest,
    fixture: Option<PathBuf>,
) -> Result<LinkRunSummary> {
    let matching = MatchingConfig::from_workspace_root(&config.workspace_root)?;
    let (source, sink): (Arc<dyn SourceTable>, Arc<dyn MatchSink>) = match fixture {
        Some(path) => {
            let table = Arc::new(
                FixtureSourceTable::load(&path)
                    .with_context(|| format!("loading fixture {}", path.display()))?,
            );
            info!(records = table.len(), fixture = %path.display(), "using fixture source table");
            let sink: Arc<dyn MatchSink> = Arc::new(FixtureMatchSink::new(table.clone()));
            let source: Arc<dyn SourceTable> = table;
            (source, sink)
        }
        None => {
            let pool = connect_db(&config.database_url).await?;
            let source: Arc<dyn SourceTable> = Arc::new(PgSourceTable::new(pool.clone()));
            let sink: Arc<dyn MatchSink> = Arc::new(PgMatchSink::new(pool));
            (source, sink)
        }
    };
    LinkPipeline::from_config(&config, source, sink, matching)?
        .run(request)
        .await
}

pub async fn run_link_from_env(request: LinkRequest, fixture: Option<PathBuf>) -> Result<LinkRunSummary> {
    run_link(LinkConfig::from_env(), request, fixture).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use edl_adapters::{LookupError, LookupObserver, TracingObserver};
    use edl_core::{CandidateExtract, CandidatePool, SourceRecord};

    /// Canned pools keyed by source id; unknown ids get an empty pool.
    #[derive(Default)]
    struct CannedLookup {
        pools: HashMap<String, CandidatePool>,
        seen: Mutex<Vec<String>>,
        observer: TracingObserver,
    }

    impl CannedLookup {
        fn with(mut self, id: &str, candidate: CandidateExtract) -> Self {
            self.pools.entry(id.to_string()).or_default().push(candidate);
            self
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DirectoryLookup for CannedLookup {
        async fn lookup(&self, record: &SourceRecord) -> Result<CandidatePool, LookupError> {
            self.seen.lock().unwrap().push(record.id.clone());
            Ok(self.pools.get(&record.id).cloned().unwrap_or_default())
        }

        fn observer(&self) -> &dyn LookupObserver {
            &self.observer
        }
    }

    fn candidate(id: &str, name: &str, address: &str) -> CandidateExtract {
        CandidateExtract {
            directory_id: id.to_string(),
            name: Some(name.to_string()),
            address: Some(address.to_string()),
            ..Default::default()
        }
    }

    fn sources() -> Vec<SourceRecord> {
        vec![
            SourceRecord::new("01", Some("Joe's Pizza"), Some("7 Carmine St"), Some("10014"), Some("2123661182")),
            SourceRecord::new("02", Some("Katz's Delicatessen"), Some("205 E Houston St"), Some("10002"), None),
            SourceRecord::new("03", Some("Ray's Bagels"), Some("1 Broadway"), Some("10004"), None),
            SourceRecord::new("04", Some("Lombardi's"), Some("32 Spring St"), Some("10012"), None),
        ]
    }

    struct Harness {
        pipeline: LinkPipeline,
        sink: Arc<FixtureMatchSink>,
        phone: Arc<CannedLookup>,
        address: Arc<CannedLookup>,
        _dir: tempfile::TempDir,
    }

    fn harness(phone: CannedLookup, address: CannedLookup) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let table = Arc::new(FixtureSourceTable::new(sources()));
        let sink = Arc::new(FixtureMatchSink::new(table.clone()));
        let phone = Arc::new(phone);
        let address = Arc::new(address);
        let pipeline = LinkPipeline::new(table, sink.clone(), phone.clone(), address.clone())
            .with_workspace_root(dir.path().to_path_buf());
        Harness {
            pipeline,
            sink,
            phone,
            address,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn address_pass_never_sees_phone_matches() {
        let phone = CannedLookup::default().with("01", candidate("joes", "Joe's Pizza", "7 Carmine St"));
        // The address lookup would also accept 01; it must not get the chance.
        let address = CannedLookup::default()
            .with("01", candidate("joes-dup", "Joe's Pizza", "7 Carmine St"))
            .with("02", candidate("katz", "Katz's Delicatessen", "205 E Houston St"))
            .with("03", candidate("elsewhere", "Ray's Famous", "800 Sixth Ave"));
        let h = harness(phone, address);

        let summary = h.pipeline.run(LinkRequest::default()).await.unwrap();

        assert_eq!(h.phone.seen(), vec!["01", "02", "03", "04"]);
        assert_eq!(h.address.seen(), vec!["02", "03", "04"]);
        assert_eq!(summary.phone.pulled, 4);
        assert_eq!(summary.phone.matched, 1);
        assert_eq!(summary.address.pulled, 3);
        assert_eq!(summary.address.matched, 1);

        let stored = h.sink.stored().await;
        let ids = stored
            .iter()
            .map(|(pass, pair)| (*pass, pair.candidate.directory_id.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![(Pass::Phone, "joes"), (Pass::Address, "katz")]);
    }

    #[tokio::test]
    async fn windowed_run_covers_the_same_range_in_both_passes() {
        let h = harness(
            CannedLookup::default().with("02", candidate("katz", "Katz's Delicatessen", "205 E Houston St")),
            CannedLookup::default(),
        );

        let summary = h
            .pipeline
            .run(LinkRequest {
                n_pull: Some(2),
                offset: 1,
                create_tables: true,
            })
            .await
            .unwrap();

        assert_eq!(h.phone.seen(), vec!["02", "03"]);
        assert_eq!(h.address.seen(), vec!["03"]);
        assert_eq!(summary.phone.stored, 1);
        assert_eq!(summary.address.matched, 0);
    }

    #[tokio::test]
    async fn run_writes_summary_and_matches_reports() {
        let h = harness(
            CannedLookup::default().with("01", candidate("joes", "Joe's Pizza", "7 Carmine St")),
            CannedLookup::default(),
        );

        let summary = h.pipeline.run(LinkRequest::default()).await.unwrap();
        let reports_dir = PathBuf::from(&summary.reports_dir);

        let markdown = std::fs::read_to_string(reports_dir.join("link_summary.md")).unwrap();
        assert!(markdown.contains(&summary.run_id.to_string()));
        assert!(markdown.contains("| phone | 4 | 1 | 1 |"));

        let matches: serde_json::Value =
            serde_json::from_slice(&std::fs::read(reports_dir.join("matches.json")).unwrap()).unwrap();
        assert_eq!(matches["matches"][0]["pass"], "phone");
        assert_eq!(matches["matches"][0]["source"]["id"], "01");
        assert_eq!(matches["matches"][0]["candidate"]["directory_id"], "joes");
        assert_eq!(matches["run"]["phone"]["matched"], 1);
    }

    #[tokio::test]
    async fn stricter_thresholds_reject_near_matches() {
        let address = CannedLookup::default().with("02", candidate("katz", "Katz's Deli", "205 E Houston Street"));
        let h = harness(CannedLookup::default(), address);
        let pipeline = h.pipeline.with_matching(MatchingConfig {
            lower_threshold: 0.95,
            upper_threshold: 0.99,
            ..Default::default()
        });

        let summary = pipeline.run(LinkRequest::default()).await.unwrap();
        assert_eq!(summary.address.matched, 0);
    }
}
