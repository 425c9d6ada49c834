use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use indicatif::ProgressBar;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch::{DownloadDispatcher, DownloadJob};
use crate::error::{DispatchError, FetchError, RunError, ScrapeError, ValidationError};
use crate::extract::{extract_listing, extract_page, ExtractedRecord};
use crate::fetch::{DocumentFetcher, FetchFlags};
use crate::ignore::IgnoreList;
use crate::metadata::{finalize, CaseRules};
use crate::profile::{ModeSpec, ScraperSpec, SiteProfile, VIDEO_MODE};
use crate::settings::Settings;
use crate::template::{self, absolutize, Params};

const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_DETAIL_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Overrides the mode's `max_pages`.
    pub max_pages: Option<u32>,
    pub start_page: u32,
    /// Items to skip on the first fetched page.
    pub item_offset: usize,
    /// Fetch each listing item's own page and merge its fields in.
    pub detail: bool,
    pub dispatch: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            max_pages: None,
            start_page: 1,
            item_offset: 0,
            detail: false,
            dispatch: true,
        }
    }
}

/// Parse `P` or `P.I` (page P, starting at 1-based item I) into
/// `(start_page, item_offset)`.
pub fn parse_start_page(s: &str) -> Result<(u32, usize), String> {
    let (page, item) = match s.trim().split_once('.') {
        Some((page, item)) => (page, Some(item)),
        None => (s.trim(), None),
    };
    let page: u32 = page.parse().map_err(|_| format!("invalid page number `{page}`"))?;
    let item: usize = match item {
        Some(item) => item.parse().map_err(|_| format!("invalid item number `{item}`"))?,
        None => 1,
    };
    if page == 0 || item == 0 {
        return Err("pages and items are numbered from 1".to_string());
    }
    Ok((page, item - 1))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    #[serde(rename = "ok")]
    Ok,
    /// Records were produced but the crawl stopped early or lost some detail.
    #[serde(rename = "ok-partial")]
    Partial,
    #[serde(rename = "failed")]
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Ok => "ok",
            RunStatus::Partial => "ok-partial",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct RunOutcome {
    pub site: String,
    pub mode: String,
    pub records: Vec<ExtractedRecord>,
    pub status: RunStatus,
    /// The fatal error for `failed`, or the page error that ended pagination.
    pub error: Option<RunError>,
    pub detail_errors: Vec<(String, ScrapeError)>,
    pub dispatch_errors: Vec<(String, DispatchError)>,
    pub dispatched: usize,
    pub ignored: usize,
    /// Listing items whose URL was already processed.
    pub skipped: usize,
    pub pages_fetched: u32,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunOutcome {
    fn begin(site: &str, mode: &str) -> Self {
        let now = Utc::now();
        RunOutcome {
            site: site.to_string(),
            mode: mode.to_string(),
            records: Vec::new(),
            status: RunStatus::Ok,
            error: None,
            detail_errors: Vec::new(),
            dispatch_errors: Vec::new(),
            dispatched: 0,
            ignored: 0,
            skipped: 0,
            pages_fetched: 0,
            cancelled: false,
            started_at: now,
            finished_at: now,
        }
    }

    fn degrade(&mut self) {
        if self.status == RunStatus::Ok {
            self.status = RunStatus::Partial;
        }
    }

    fn stop_early(&mut self, err: impl Into<ScrapeError>) {
        self.degrade();
        self.error.get_or_insert_with(|| RunError::new(err));
    }

    fn failed(mut self, err: impl Into<ScrapeError>) -> Self {
        self.status = RunStatus::Failed;
        self.error = Some(RunError::new(err));
        self.finished_at = Utc::now();
        self
    }

    fn finish(mut self) -> Self {
        if self.cancelled {
            self.degrade();
        }
        self.finished_at = Utc::now();
        self
    }

    pub fn elapsed(&self) -> Duration {
        (self.finished_at - self.started_at).to_std().unwrap_or_default()
    }
}

enum Detail {
    Skipped,
    Found(Option<ExtractedRecord>),
    Cancelled,
    Failed(String, ScrapeError),
}

/// Drives one site profile: pagination, item extraction, optional detail
/// pages, filtering and hand-off. Owns its fetcher, so a session serves one
/// run at a time.
pub struct Orchestrator<F> {
    profile: Arc<SiteProfile>,
    fetcher: F,
    dispatcher: Option<Arc<dyn DownloadDispatcher>>,
    ignore: IgnoreList,
    case_rules: CaseRules,
    processed: HashSet<String>,
    cancel: CancellationToken,
    fetch_timeout: Duration,
    detail_concurrency: usize,
    request_delay: Duration,
    progress: ProgressBar,
}

impl<F: DocumentFetcher> Orchestrator<F> {
    pub fn new(profile: Arc<SiteProfile>, fetcher: F) -> Self {
        Orchestrator {
            profile,
            fetcher,
            dispatcher: None,
            ignore: IgnoreList::default(),
            case_rules: CaseRules::default(),
            processed: HashSet::new(),
            cancel: CancellationToken::new(),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            detail_concurrency: DEFAULT_DETAIL_CONCURRENCY,
            request_delay: Duration::ZERO,
            progress: ProgressBar::hidden(),
        }
    }

    /// Timeouts, pacing and casing rules. Ignored terms go through
    /// [`Orchestrator::with_ignore`].
    pub fn with_settings(mut self, settings: &Settings) -> Self {
        self.fetch_timeout = settings.fetch_timeout();
        self.detail_concurrency = settings.detail_concurrency.max(1);
        self.request_delay = settings.request_delay();
        self.case_rules = settings.case_rules();
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn DownloadDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_ignore(mut self, ignore: IgnoreList) -> Self {
        self.ignore = ignore;
        self
    }

    pub fn with_case_rules(mut self, rules: CaseRules) -> Self {
        self.case_rules = rules;
        self
    }

    /// URLs handled by earlier runs. Listing items pointing at one are skipped,
    /// and every dispatched URL is added.
    pub fn with_processed(mut self, processed: HashSet<String>) -> Self {
        self.processed = processed;
        self
    }

    pub fn processed(&self) -> &HashSet<String> {
        &self.processed
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    pub fn profile(&self) -> &Arc<SiteProfile> {
        &self.profile
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    fn flags(&self) -> FetchFlags {
        FetchFlags {
            use_automation: self.profile.use_selenium,
            is_m3u8: self.profile.m3u8_mode,
        }
    }

    /// Detail pages share a browser session unless the fetcher isolates them.
    fn detail_width(&self) -> usize {
        if self.fetcher.isolated_sessions() && !self.profile.use_selenium {
            self.detail_concurrency.max(1)
        } else {
            1
        }
    }

    pub async fn run(&mut self, mode_name: &str, params: &Params, opts: &RunOptions) -> RunOutcome {
        let profile = Arc::clone(&self.profile);
        let outcome = RunOutcome::begin(&profile.shortcode, mode_name);

        let Some(mode) = profile.mode(mode_name) else {
            return outcome.failed(ValidationError::new(format!("modes.{mode_name}"), "no such mode"));
        };
        if let Err(e) = profile.check_invocation(mode, params) {
            return outcome.failed(e);
        }

        info!(site = %profile.name, mode = mode_name, "run started");
        let mut outcome = outcome;
        let scraper = profile.scraper_for(mode);
        let result = match scraper {
            ScraperSpec::Record(_) => {
                self.run_record(&profile, mode, scraper, params, opts, &mut outcome)
                    .await
            }
            ScraperSpec::Listing(_) => {
                self.run_listing(&profile, mode, scraper, params, opts, &mut outcome)
                    .await
            }
        };

        let outcome = match result {
            Ok(()) => outcome.finish(),
            Err(e) => outcome.failed(e),
        };
        info!(
            site = %profile.name,
            mode = mode_name,
            status = %outcome.status,
            records = outcome.records.len(),
            pages = outcome.pages_fetched,
            "run finished"
        );
        outcome
    }

    async fn run_record(
        &mut self,
        profile: &SiteProfile,
        mode: &ModeSpec,
        scraper: &ScraperSpec,
        params: &Params,
        opts: &RunOptions,
        outcome: &mut RunOutcome,
    ) -> Result<(), ScrapeError> {
        let url = template::resolve(profile, mode, params, 1)?;
        self.progress.set_message(format!("fetching {url}"));
        let Some(markup) = self.fetch(&url).await? else {
            outcome.cancelled = true;
            return Ok(());
        };
        outcome.pages_fetched = 1;

        let mut records = extract_page(&markup, mode.selector_style, scraper)?;
        for record in &mut records {
            if record.value("url").is_none() {
                record.insert("url", url.as_str());
            }
        }
        self.deliver(profile, records, opts.dispatch, outcome).await;
        Ok(())
    }

    async fn run_listing(
        &mut self,
        profile: &SiteProfile,
        mode: &ModeSpec,
        scraper: &ScraperSpec,
        params: &Params,
        opts: &RunOptions,
        outcome: &mut RunOutcome,
    ) -> Result<(), ScrapeError> {
        let follows_links = !mode.paginates() && matches!(scraper, ScraperSpec::Listing(l) if l.next_page.is_some());
        if !mode.paginates() && opts.start_page > 1 {
            warn!(mode = %mode.name, "mode has no pagination template, starting at page 1");
        }
        let (first, last) = page_range(mode, follows_links, opts);
        let video = profile.mode(VIDEO_MODE);
        let mut next_link: Option<String> = None;

        for page in first..=last {
            if self.cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }

            let url = if page > first && !mode.paginates() {
                match next_link.take() {
                    Some(link) => link,
                    None => {
                        info!(page, "no next page link, end of listing");
                        break;
                    }
                }
            } else {
                template::resolve(profile, mode, params, page)?
            };

            if page > first && !self.request_delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        outcome.cancelled = true;
                        break;
                    }
                    _ = tokio::time::sleep(self.request_delay) => {}
                }
            }

            info!(page, %url, "fetching page");
            self.progress.set_message(format!("{} page {page}", mode.name));

            let markup = match self.fetch(&url).await {
                Ok(Some(markup)) => markup,
                Ok(None) => {
                    outcome.cancelled = true;
                    break;
                }
                Err(e) if page == first => return Err(e.into()),
                Err(e) => {
                    warn!(page, error = %e, "page failed, stopping pagination");
                    outcome.stop_early(e);
                    break;
                }
            };
            outcome.pages_fetched += 1;

            let extracted = match extract_listing(&markup, mode.selector_style, scraper) {
                Ok(extracted) => extracted,
                Err(e) if page == first => return Err(e.into()),
                Err(e) => {
                    warn!(page, error = %e, "page unreadable, stopping pagination");
                    outcome.stop_early(e);
                    break;
                }
            };
            if follows_links {
                next_link = extracted.next_page.map(|href| absolutize(&profile.base_url, &href));
            }
            let items = extracted.records;
            if items.is_empty() {
                info!(page, "no items, end of listing");
                break;
            }

            let found = items.len();
            let skip = if page == first { opts.item_offset } else { 0 };
            let mut batch: Vec<_> = items
                .into_iter()
                .skip(skip)
                .filter_map(|record| locate(profile, video, record))
                .collect();
            let located = batch.len();
            batch.retain(|record| !record.value("url").is_some_and(|url| self.processed.contains(url)));
            if batch.len() < located {
                info!(page, skipped = located - batch.len(), "already processed, skipped");
                outcome.skipped += located - batch.len();
            }
            info!(page, found, kept = batch.len(), "page extracted");

            let batch = if opts.detail {
                self.enrich(profile, batch, outcome).await
            } else {
                batch
            };
            self.deliver(profile, batch, opts.dispatch, outcome).await;
        }
        Ok(())
    }

    async fn fetch(&self, url: &str) -> Result<Option<String>, FetchError> {
        fetch_bounded(&self.fetcher, &self.cancel, self.fetch_timeout, url, self.flags()).await
    }

    /// Re-enter record mode on each item's URL and merge the result in.
    async fn enrich(
        &self,
        profile: &SiteProfile,
        batch: Vec<ExtractedRecord>,
        outcome: &mut RunOutcome,
    ) -> Vec<ExtractedRecord> {
        let Some(video) = profile.mode(VIDEO_MODE) else {
            debug!("profile has no video mode, detail pages skipped");
            return batch;
        };
        let scraper = profile.scraper_for(video);
        let style = video.selector_style;
        let fetcher = &self.fetcher;
        let cancel = &self.cancel;
        let limit = self.fetch_timeout;
        let flags = self.flags();

        let results: Vec<(ExtractedRecord, Detail)> = stream::iter(batch)
            .map(|record| async move {
                let target = record
                    .value("download_url")
                    .is_none()
                    .then(|| record.value("url").map(str::to_string))
                    .flatten();
                let Some(url) = target else {
                    return (record, Detail::Skipped);
                };
                let detail = match fetch_bounded(fetcher, cancel, limit, &url, flags).await {
                    Ok(Some(markup)) => match extract_page(&markup, style, scraper) {
                        Ok(found) => Detail::Found(found.into_iter().next()),
                        Err(e) => Detail::Failed(url, e.into()),
                    },
                    Ok(None) => Detail::Cancelled,
                    Err(e) => Detail::Failed(url, e.into()),
                };
                (record, detail)
            })
            .buffered(self.detail_width())
            .collect()
            .await;

        let mut enriched = Vec::with_capacity(results.len());
        for (mut record, detail) in results {
            match detail {
                Detail::Found(Some(found)) => record.merge(found),
                Detail::Found(None) | Detail::Skipped => {}
                Detail::Cancelled => outcome.cancelled = true,
                Detail::Failed(url, e) => {
                    warn!(%url, error = %e, "detail page failed, keeping listing fields");
                    outcome.degrade();
                    outcome.detail_errors.push((url, e));
                }
            }
            enriched.push(record);
        }
        enriched
    }

    /// Drop ignored records, hand the rest to the dispatcher, keep them all.
    /// Stops at the first record after cancellation.
    async fn deliver(
        &mut self,
        profile: &SiteProfile,
        batch: Vec<ExtractedRecord>,
        dispatch: bool,
        outcome: &mut RunOutcome,
    ) {
        for record in batch {
            if self.cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }
            if let Some((field, term)) = self.ignore.matched(&record) {
                warn!(
                    field,
                    term,
                    title = record.get("title").unwrap_or_default(),
                    "ignored term, record dropped"
                );
                outcome.ignored += 1;
                continue;
            }

            if let (true, Some(dispatcher)) = (dispatch, &self.dispatcher) {
                let tidy = finalize(&record, &self.case_rules);
                let submitted = match DownloadJob::from_record(profile, &tidy) {
                    Ok(job) => dispatcher.submit(&job).await,
                    Err(e) => Err(e),
                };
                match submitted {
                    Ok(()) => {
                        outcome.dispatched += 1;
                        if let Some(url) = record.value("url") {
                            self.processed.insert(url.to_string());
                        }
                    }
                    Err(e) => {
                        let key = record
                            .value("url")
                            .or_else(|| record.value("title"))
                            .unwrap_or("<unnamed>")
                            .to_string();
                        warn!(record = %key, error = %e, "dispatch failed");
                        outcome.dispatch_errors.push((key, e));
                    }
                }
            }

            outcome.records.push(record);
            self.progress.inc(1);
        }
    }
}

/// Pages to visit. A mode without a pagination template has exactly one,
/// unless it follows next-page links from page 1.
fn page_range(mode: &ModeSpec, follows_links: bool, opts: &RunOptions) -> (u32, u32) {
    let cap = opts.max_pages.unwrap_or(mode.max_pages).max(1);
    if !mode.paginates() {
        return (1, if follows_links { cap } else { 1 });
    }
    let first = opts.start_page.max(1);
    (first, cap.max(first))
}

/// Give a listing record an absolute `url`, building one from `video_key`
/// through the video template when needed. Records with nothing to point at
/// are dropped.
fn locate(profile: &SiteProfile, video: Option<&ModeSpec>, mut record: ExtractedRecord) -> Option<ExtractedRecord> {
    if let Some(href) = record.value("url").map(str::to_string) {
        record.insert("url", absolutize(&profile.base_url, &href));
    } else if let Some(key) = record.value("video_key").map(str::to_string) {
        let Some(video) = video else {
            warn!(%key, "video_key found but profile has no video mode");
            return None;
        };
        let name = template::required_params(&video.url_pattern)
            .ok()
            .and_then(|names| names.first().map(|n| n.to_string()))
            .unwrap_or_else(|| VIDEO_MODE.to_string());
        let params = Params::from([(name, key)]);
        match template::resolve(profile, video, &params, 1) {
            Ok(url) => record.insert("url", url),
            Err(e) => {
                warn!(error = %e, "cannot build video url");
                return None;
            }
        }
    } else if record.value("download_url").is_none() {
        warn!(title = record.get("title").unwrap_or_default(), "item has no link, skipped");
        return None;
    }
    Some(record)
}

async fn fetch_bounded<F: DocumentFetcher + ?Sized>(
    fetcher: &F,
    cancel: &CancellationToken,
    limit: Duration,
    url: &str,
    flags: FetchFlags,
) -> Result<Option<String>, FetchError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Ok(None),
        res = tokio::time::timeout(limit, fetcher.fetch(url, flags)) => match res {
            Ok(body) => body.map(Some),
            Err(_) => Err(FetchError::Timeout {
                url: url.to_string(),
                secs: limit.as_secs(),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::error::Stage;

    const PROFILE: &str = r##"
name: Example Tube
shortcode: et
domain: site.test
base_url: https://site.test
modes:
  video:
    url_pattern: /v/{video}
    scraper: video_scraper
  search:
    url_pattern: /search?q={search}
    url_pattern_pages: /search?q={search}&page={page}
    max_pages: 999
    scraper: list_scraper
  tag:
    url_pattern: /tags/{tag}
    max_pages: 5
    scraper: list_scraper
  keys:
    url_pattern: /keys/{keys}
    scraper: key_scraper
  latest:
    url_pattern: /latest
    scraper: paged_scraper
scrapers:
  video_scraper:
    title:
      selector: h1.title
      postProcess:
        - replace:
            - regex: '\s*\|.*$'
              with: ''
    group:
      selector: a.group
      attribute: href
      pattern: '/g/([^/]+)/'
    download_url:
      iframe: "#player iframe"
  list_scraper:
    video_container:
      selector: ["#results", "main"]
    video_item:
      selector: div.thumb
      fields:
        url:
          selector: a
          attribute: href
        title: a
  key_scraper:
    video_item:
      selector: li.key
      fields:
        video_key:
          attribute: data-key
        title: span
  paged_scraper:
    pagination:
      next_page:
        selector: a.next
    video_item:
      selector: div.thumb
      fields:
        url:
          selector: a
          attribute: href
        title: a
"##;

    const S1: &str = "https://site.test/search?q=cats";
    const S2: &str = "https://site.test/search?q=cats&page=2";
    const S3: &str = "https://site.test/search?q=cats&page=3";

    fn fixture(name: &str) -> String {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name);
        std::fs::read_to_string(path).unwrap()
    }

    #[derive(Default)]
    struct FakeFetcher {
        pages: HashMap<String, String>,
        calls: Mutex<Vec<String>>,
        isolated: bool,
        cancel_on: Option<(String, CancellationToken)>,
    }

    impl FakeFetcher {
        fn with(pages: &[(&str, &str)]) -> Self {
            FakeFetcher {
                pages: pages.iter().map(|(url, f)| (url.to_string(), fixture(f))).collect(),
                isolated: true,
                ..FakeFetcher::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DocumentFetcher for FakeFetcher {
        async fn fetch(&self, url: &str, _flags: FetchFlags) -> Result<String, FetchError> {
            self.calls.lock().unwrap().push(url.to_string());
            if let Some((trigger, token)) = &self.cancel_on {
                if trigger == url {
                    token.cancel();
                    std::future::pending::<()>().await;
                }
            }
            self.pages.get(url).cloned().ok_or_else(|| FetchError::Status {
                url: url.to_string(),
                status: 404,
            })
        }

        fn isolated_sessions(&self) -> bool {
            self.isolated
        }
    }

    #[derive(Default)]
    struct Recorder {
        jobs: Mutex<Vec<DownloadJob>>,
    }

    #[async_trait]
    impl DownloadDispatcher for Recorder {
        async fn submit(&self, job: &DownloadJob) -> Result<(), DispatchError> {
            if job.title.contains("Fifth") {
                return Err(DispatchError::Rejected {
                    url: job.target().to_string(),
                    reason: "queue full".into(),
                });
            }
            self.jobs.lock().unwrap().push(job.clone());
            Ok(())
        }
    }

    fn orchestrator(fetcher: FakeFetcher) -> Orchestrator<FakeFetcher> {
        let profile = SiteProfile::from_yaml(PROFILE).unwrap();
        Orchestrator::new(Arc::new(profile), fetcher)
    }

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn titles(outcome: &RunOutcome) -> Vec<&str> {
        outcome
            .records
            .iter()
            .map(|r| r.get("title").unwrap_or_default())
            .collect()
    }

    #[test]
    fn start_page_syntax() {
        assert_eq!(parse_start_page("3"), Ok((3, 0)));
        assert_eq!(parse_start_page("2.5"), Ok((2, 4)));
        assert!(parse_start_page("0").is_err());
        assert!(parse_start_page("2.0").is_err());
        assert!(parse_start_page("x.1").is_err());
    }

    #[tokio::test]
    async fn empty_container_ends_listing() {
        let fetcher = FakeFetcher::with(&[(S1, "listing_page1.html"), (S2, "listing_empty.html")]);
        let mut orch = orchestrator(fetcher);
        let outcome = orch.run("search", &params(&[("search", "cats")]), &RunOptions::default()).await;

        assert_eq!(outcome.status, RunStatus::Ok);
        assert_eq!(titles(&outcome), vec!["First clip", "Second clip", "Third clip"]);
        assert_eq!(outcome.pages_fetched, 2);
        assert_eq!(orch.fetcher().calls(), vec![S1, S2]);
        assert_eq!(outcome.records[0].get("url"), Some("https://site.test/v/abc123"));
        assert_eq!(outcome.records[2].get("url"), Some("https://cdn.site.test/v/ghi789"));
    }

    #[tokio::test]
    async fn first_page_failure_fails_run() {
        let mut orch = orchestrator(FakeFetcher::with(&[]));
        let outcome = orch.run("search", &params(&[("search", "cats")]), &RunOptions::default()).await;

        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.error.as_ref().map(|e| e.stage), Some(Stage::Fetch));
    }

    #[tokio::test]
    async fn later_page_failure_is_partial() {
        let fetcher = FakeFetcher::with(&[(S1, "listing_page1.html"), (S2, "listing_page2.html")]);
        let mut orch = orchestrator(fetcher);
        let outcome = orch.run("search", &params(&[("search", "cats")]), &RunOptions::default()).await;

        assert_eq!(outcome.status, RunStatus::Partial);
        assert_eq!(outcome.records.len(), 5);
        assert_eq!(outcome.pages_fetched, 2);
        assert_eq!(outcome.error.as_ref().map(|e| e.stage), Some(Stage::Fetch));
        assert_eq!(orch.fetcher().calls(), vec![S1, S2, S3]);
    }

    #[tokio::test]
    async fn missing_parameter_fails_before_fetch() {
        let mut orch = orchestrator(FakeFetcher::with(&[(S1, "listing_page1.html")]));
        let outcome = orch.run("search", &Params::new(), &RunOptions::default()).await;

        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.error.as_ref().map(|e| e.stage), Some(Stage::Validate));
        assert!(orch.fetcher().calls().is_empty());

        let outcome = orch.run("nope", &Params::new(), &RunOptions::default()).await;
        assert_eq!(outcome.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn max_pages_override_and_single_page_modes() {
        let fetcher = FakeFetcher::with(&[
            (S1, "listing_page1.html"),
            (S2, "listing_page2.html"),
            ("https://site.test/tags/cats", "listing_page1.html"),
        ]);
        let mut orch = orchestrator(fetcher);
        let opts = RunOptions {
            max_pages: Some(1),
            ..RunOptions::default()
        };
        let outcome = orch.run("search", &params(&[("search", "cats")]), &opts).await;
        assert_eq!(outcome.records.len(), 3);
        assert_eq!(outcome.status, RunStatus::Ok);

        // no pagination template: one fetch regardless of max_pages
        let outcome = orch.run("tag", &params(&[("tag", "cats")]), &RunOptions::default()).await;
        assert_eq!(outcome.records.len(), 3);
        assert_eq!(outcome.pages_fetched, 1);
        assert_eq!(orch.fetcher().calls().len(), 2);
    }

    #[tokio::test]
    async fn start_page_and_item_offset() {
        let fetcher = FakeFetcher::with(&[(S2, "listing_page2.html"), (S3, "listing_empty.html")]);
        let mut orch = orchestrator(fetcher);
        let opts = RunOptions {
            start_page: 2,
            item_offset: 1,
            ..RunOptions::default()
        };
        let outcome = orch.run("search", &params(&[("search", "cats")]), &opts).await;

        assert_eq!(titles(&outcome), vec!["Fifth clip"]);
        assert_eq!(outcome.pages_fetched, 2);
        assert_eq!(orch.fetcher().calls(), vec![S2, S3]);
    }

    #[tokio::test]
    async fn record_mode() {
        let fetcher = FakeFetcher::with(&[("https://site.test/v/abc123", "video.html")]);
        let mut orch = orchestrator(fetcher);
        let outcome = orch.run("video", &params(&[("video", "abc123")]), &RunOptions::default()).await;

        assert_eq!(outcome.status, RunStatus::Ok);
        assert_eq!(outcome.records.len(), 1);
        let record = &outcome.records[0];
        assert_eq!(record.get("title"), Some("Some Title"));
        assert_eq!(record.get("group"), Some("some_group"));
        assert_eq!(record.get("url"), Some("https://site.test/v/abc123"));
    }

    #[tokio::test]
    async fn detail_enrichment() {
        let fetcher = FakeFetcher::with(&[
            (S1, "listing_page1.html"),
            (S2, "listing_empty.html"),
            ("https://site.test/v/abc123", "video.html"),
            ("https://cdn.site.test/v/ghi789", "video.html"),
        ]);
        let mut orch = orchestrator(fetcher);
        assert_eq!(orch.detail_width(), DEFAULT_DETAIL_CONCURRENCY);
        let opts = RunOptions {
            detail: true,
            ..RunOptions::default()
        };
        let outcome = orch.run("search", &params(&[("search", "cats")]), &opts).await;

        assert_eq!(outcome.records.len(), 3);
        let first = &outcome.records[0];
        assert_eq!(first.get("title"), Some("Some Title"));
        assert_eq!(first.get("group"), Some("some_group"));
        assert_eq!(first.get("download_url"), Some("https://player.test/embed/abc123"));
        // the failed detail page leaves the listing fields alone
        assert_eq!(outcome.records[1].get("title"), Some("Second clip"));
        assert_eq!(outcome.detail_errors.len(), 1);
        assert_eq!(outcome.detail_errors[0].0, "https://site.test/v/def456");
        assert_eq!(outcome.status, RunStatus::Partial);
    }

    #[tokio::test]
    async fn shared_sessions_fetch_details_one_at_a_time() {
        let fetcher = FakeFetcher {
            isolated: false,
            ..FakeFetcher::default()
        };
        assert_eq!(orchestrator(fetcher).detail_width(), 1);
    }

    #[tokio::test]
    async fn ignored_terms_and_dispatch() {
        let fetcher = FakeFetcher::with(&[
            (S1, "listing_page1.html"),
            (S2, "listing_page2.html"),
            (S3, "listing_empty.html"),
        ]);
        let recorder = Arc::new(Recorder::default());
        let mut orch = orchestrator(fetcher)
            .with_ignore(IgnoreList::new(&["second"]).unwrap())
            .with_dispatcher(recorder.clone());
        let outcome = orch.run("search", &params(&[("search", "cats")]), &RunOptions::default()).await;

        assert_eq!(outcome.status, RunStatus::Ok);
        assert_eq!(outcome.ignored, 1);
        assert_eq!(
            titles(&outcome),
            vec!["First clip", "Third clip", "Fourth clip", "Fifth clip"]
        );
        assert_eq!(outcome.dispatched, 3);
        assert_eq!(outcome.dispatch_errors.len(), 1);
        assert_eq!(outcome.dispatch_errors[0].0, "https://site.test/v/mno345");

        let jobs = recorder.jobs.lock().unwrap();
        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs[0].url.as_deref(), Some("https://site.test/v/abc123"));
        assert_eq!(jobs[0].site, "et");
        // jobs carry tidied metadata, the outcome keeps what was scraped
        assert_eq!(jobs[0].title, "First Clip");
        assert_eq!(outcome.records[0].get("title"), Some("First clip"));
    }

    #[tokio::test]
    async fn dispatch_can_be_disabled() {
        let fetcher = FakeFetcher::with(&[(S1, "listing_page1.html"), (S2, "listing_empty.html")]);
        let recorder = Arc::new(Recorder::default());
        let mut orch = orchestrator(fetcher).with_dispatcher(recorder.clone());
        let opts = RunOptions {
            dispatch: false,
            ..RunOptions::default()
        };
        let outcome = orch.run("search", &params(&[("search", "cats")]), &opts).await;

        assert_eq!(outcome.records.len(), 3);
        assert_eq!(outcome.dispatched, 0);
        assert!(recorder.jobs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn record_mode_respects_no_dispatch() {
        let fetcher = FakeFetcher::with(&[("https://site.test/v/abc123", "video.html")]);
        let recorder = Arc::new(Recorder::default());
        let mut orch = orchestrator(fetcher).with_dispatcher(recorder.clone());
        let opts = RunOptions {
            dispatch: false,
            ..RunOptions::default()
        };
        let outcome = orch.run("video", &params(&[("video", "abc123")]), &opts).await;

        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.dispatched, 0);
        assert!(recorder.jobs.lock().unwrap().is_empty());

        let outcome = orch.run("video", &params(&[("video", "abc123")]), &RunOptions::default()).await;
        assert_eq!(outcome.dispatched, 1);
        assert_eq!(recorder.jobs.lock().unwrap().len(), 1);
    }

    struct CancelOnSubmit {
        token: CancellationToken,
        submits: Mutex<usize>,
    }

    #[async_trait]
    impl DownloadDispatcher for CancelOnSubmit {
        async fn submit(&self, _job: &DownloadJob) -> Result<(), DispatchError> {
            *self.submits.lock().unwrap() += 1;
            self.token.cancel();
            Ok(())
        }
    }

    #[tokio::test]
    async fn cancellation_stops_between_deliveries() {
        let token = CancellationToken::new();
        let dispatcher = Arc::new(CancelOnSubmit {
            token: token.clone(),
            submits: Mutex::new(0),
        });
        let fetcher = FakeFetcher::with(&[(S1, "listing_page1.html"), (S2, "listing_empty.html")]);
        let mut orch = orchestrator(fetcher)
            .with_dispatcher(dispatcher.clone())
            .with_cancellation(token);
        let outcome = orch.run("search", &params(&[("search", "cats")]), &RunOptions::default()).await;

        assert_eq!(*dispatcher.submits.lock().unwrap(), 1);
        assert!(outcome.cancelled);
        assert_eq!(outcome.status, RunStatus::Partial);
        assert_eq!(titles(&outcome), vec!["First clip"]);
        assert_eq!(orch.fetcher().calls(), vec![S1]);
    }

    #[tokio::test]
    async fn processed_urls_are_skipped() {
        let fetcher = FakeFetcher::with(&[(S1, "listing_page1.html"), (S2, "listing_empty.html")]);
        let recorder = Arc::new(Recorder::default());
        let seen: HashSet<String> = ["https://site.test/v/abc123".to_string()].into_iter().collect();
        let mut orch = orchestrator(fetcher)
            .with_dispatcher(recorder.clone())
            .with_processed(seen);
        let outcome = orch.run("search", &params(&[("search", "cats")]), &RunOptions::default()).await;

        assert_eq!(outcome.skipped, 1);
        assert_eq!(titles(&outcome), vec!["Second clip", "Third clip"]);
        assert_eq!(outcome.dispatched, 2);
        assert!(orch.processed().contains("https://site.test/v/def456"));
        assert!(orch.processed().contains("https://cdn.site.test/v/ghi789"));

        // everything is known now
        let outcome = orch.run("search", &params(&[("search", "cats")]), &RunOptions::default()).await;
        assert_eq!(outcome.skipped, 3);
        assert!(outcome.records.is_empty());
        assert_eq!(recorder.jobs.lock().unwrap().len(), 2);
    }

    fn paged_fetcher() -> FakeFetcher {
        let mut fetcher = FakeFetcher::default();
        for (url, body) in [
            (
                "https://site.test/latest",
                r#"<div class="thumb"><a href="/v/1">One</a></div><a class="next" href="/latest?after=1">Next</a>"#,
            ),
            (
                "https://site.test/latest?after=1",
                r#"<div class="thumb"><a href="/v/2">Two</a></div><a class="next" href="https://site.test/latest?after=2">Next</a>"#,
            ),
            ("https://site.test/latest?after=2", r#"<div class="thumb"><a href="/v/3">Three</a></div>"#),
        ] {
            fetcher.pages.insert(url.to_string(), body.to_string());
        }
        fetcher
    }

    #[tokio::test]
    async fn follows_next_page_links() {
        let mut orch = orchestrator(paged_fetcher());
        assert_eq!(orch.profile().mode("latest").unwrap().max_pages, u32::MAX);
        let outcome = orch.run("latest", &Params::new(), &RunOptions::default()).await;

        assert_eq!(outcome.status, RunStatus::Ok);
        assert_eq!(titles(&outcome), vec!["One", "Two", "Three"]);
        assert_eq!(outcome.pages_fetched, 3);
        assert_eq!(outcome.records[1].get("url"), Some("https://site.test/v/2"));
        assert_eq!(
            orch.fetcher().calls(),
            vec![
                "https://site.test/latest",
                "https://site.test/latest?after=1",
                "https://site.test/latest?after=2",
            ]
        );

        let mut orch = orchestrator(paged_fetcher());
        let opts = RunOptions {
            max_pages: Some(2),
            ..RunOptions::default()
        };
        let outcome = orch.run("latest", &Params::new(), &opts).await;
        assert_eq!(titles(&outcome), vec!["One", "Two"]);
        assert_eq!(outcome.pages_fetched, 2);
    }

    #[tokio::test]
    async fn video_key_becomes_url() {
        let mut fetcher = FakeFetcher::default();
        fetcher.pages.insert(
            "https://site.test/keys/new".into(),
            r#"<ul>
                 <li class="key" data-key="abc123"><span>One</span></li>
                 <li class="key"><span>No key</span></li>
               </ul>"#
                .into(),
        );
        let mut orch = orchestrator(fetcher);
        let outcome = orch.run("keys", &params(&[("keys", "new")]), &RunOptions::default()).await;

        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].get("url"), Some("https://site.test/v/abc123"));
    }

    #[tokio::test]
    async fn cancellation_keeps_collected_records() {
        let token = CancellationToken::new();
        let mut fetcher = FakeFetcher::with(&[(S1, "listing_page1.html")]);
        fetcher.cancel_on = Some((S2.to_string(), token.clone()));
        let mut orch = orchestrator(fetcher).with_cancellation(token);
        let outcome = orch.run("search", &params(&[("search", "cats")]), &RunOptions::default()).await;

        assert!(outcome.cancelled);
        assert_eq!(outcome.status, RunStatus::Partial);
        assert_eq!(outcome.records.len(), 3);
        assert_eq!(outcome.pages_fetched, 1);
        assert!(outcome.error.is_none());
    }
}
