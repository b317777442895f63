//! The HTTP research unit and its factory.
//!
//! A [`ResearchSession`] owns one `reqwest::Client` and walks a single
//! company site through the four phases: fetch the landing page and harvest
//! its links, rank them, fetch the chosen pages as Markdown, then fold
//! everything into a JSON profile.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use scraper::Html;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use url::Url;

use batchscout_core::{Aggregate, PhaseContext, PhaseExecutor, PhaseOutput, PhaseResult, UnitFactory};
use batchscout_shared::{CrawlConfig, JobInput, PhaseError, Result, Usage};

use crate::content::page_text;
use crate::fetch::{build_client, compute_hash, fetch_page, is_ssrf_target, same_host_links};
use crate::rank::LinkRanker;

// ---------------------------------------------------------------------------
// Phase hand-off types
// ---------------------------------------------------------------------------

/// Pages fetched and bytes received by one job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Traffic {
    pub pages: u64,
    pub bytes: u64,
}

impl Traffic {
    fn record(&mut self, body: &str) {
        self.pages += 1;
        self.bytes += body.len() as u64;
    }
}

/// Output of discovery: the landing page and the links found on it.
#[derive(Debug, Clone)]
pub struct Discovered {
    pub name: String,
    pub root: Url,
    pub links: Vec<Url>,
    root_body: String,
    traffic: Traffic,
}

/// Output of selection: the landing page plus the best-ranked links.
#[derive(Debug, Clone)]
pub struct Selected {
    pub name: String,
    pub root: Url,
    /// Pages to extract, landing page first.
    pub pages: Vec<Url>,
    root_body: Option<String>,
    traffic: Traffic,
}

/// One page after extraction.
#[derive(Debug, Clone)]
pub struct ExtractedPage {
    pub url: Url,
    pub title: Option<String>,
    pub content_hash: String,
    pub markdown: String,
    pub words: usize,
}

/// Output of extraction.
#[derive(Debug, Clone)]
pub struct Extracted {
    pub name: String,
    pub root: Url,
    pub pages: Vec<ExtractedPage>,
    pub failed: usize,
    traffic: Traffic,
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

struct Settings {
    config: CrawlConfig,
    ranker: LinkRanker,
}

/// Builds [`ResearchSession`]s for the resource pool.
pub struct HttpUnitFactory {
    settings: Arc<Settings>,
}

impl HttpUnitFactory {
    /// Fails with a config error when a select pattern does not compile.
    pub fn new(config: CrawlConfig) -> Result<Self> {
        let ranker = LinkRanker::new(&config.select_patterns)?;
        Ok(Self {
            settings: Arc::new(Settings { config, ranker }),
        })
    }

    pub fn config(&self) -> &CrawlConfig {
        &self.settings.config
    }
}

#[async_trait]
impl UnitFactory for HttpUnitFactory {
    type Unit = ResearchSession;

    async fn create(&self) -> Result<ResearchSession> {
        let config = &self.settings.config;
        let client = build_client(config.request_timeout, config.allow_private_hosts)?;
        debug!(
            timeout_secs = config.request_timeout.as_secs(),
            "research session created"
        );
        Ok(ResearchSession {
            client,
            settings: self.settings.clone(),
            last_request: None,
        })
    }
}

// ---------------------------------------------------------------------------
// ResearchSession
// ---------------------------------------------------------------------------

/// A pooled HTTP client that researches one job at a time.
pub struct ResearchSession {
    client: Client,
    settings: Arc<Settings>,
    last_request: Option<Instant>,
}

impl ResearchSession {
    fn config(&self) -> &CrawlConfig {
        &self.settings.config
    }

    /// Space requests from this session at least `rate_limit_ms` apart.
    async fn throttle(&mut self) {
        let gap = Duration::from_millis(self.config().rate_limit_ms);
        if let Some(last) = self.last_request {
            tokio::time::sleep_until(last + gap).await;
        }
        self.last_request = Some(Instant::now());
    }

    fn guard(&self, url: &Url) -> std::result::Result<(), PhaseError> {
        if !self.config().allow_private_hosts && is_ssrf_target(url) {
            warn!(%url, "SSRF protection: blocked");
            return Err(PhaseError::new(format!("{url}: blocked by SSRF protection"))
                .with_detail("url", url.as_str()));
        }
        Ok(())
    }
}

#[async_trait]
impl PhaseExecutor for ResearchSession {
    type Discovery = Discovered;
    type Selection = Selected;
    type Extraction = Extracted;

    #[instrument(skip_all, fields(job_id = %ctx.job_id(), target = %input.target))]
    async fn discover(&mut self, input: &JobInput, ctx: &PhaseContext) -> PhaseResult<Discovered> {
        let target = Url::parse(&input.target).map_err(|e| {
            PhaseError::new(format!("invalid target `{}`: {e}", input.target))
        })?;
        self.guard(&target)?;
        ctx.report("url", target.as_str());

        self.throttle().await;
        let page = fetch_page(&self.client, &target)
            .await
            .map_err(|e| PhaseError::from(e).with_detail("url", target.as_str()))?;

        // The landing URL decides the host every later page is fetched from.
        self.guard(&page.url)?;

        let mut traffic = Traffic::default();
        traffic.record(&page.body);

        let links = {
            let doc = Html::parse_document(&page.body);
            same_host_links(&doc, &page.url, self.config().max_links)
        };

        let links_found = links.len();
        info!(status = page.status, links_found, "landing page fetched");
        Ok(PhaseOutput::new(Discovered {
            name: input.name.clone(),
            root: page.url,
            links,
            root_body: page.body,
            traffic,
        })
        .with_detail("status", page.status)
        .with_detail("links_found", links_found))
    }

    #[instrument(skip_all, fields(job_id = %ctx.job_id(), root = %discovered.root))]
    async fn select(&mut self, discovered: Discovered, ctx: &PhaseContext) -> PhaseResult<Selected> {
        let candidates = discovered.links.len();
        let limit = self.config().max_pages.saturating_sub(1);

        let mut pages = vec![discovered.root.clone()];
        pages.extend(self.settings.ranker.top(discovered.links, limit));
        debug!(candidates, selected = pages.len(), "links ranked");

        let selected = pages.len();
        Ok(PhaseOutput::new(Selected {
            name: discovered.name,
            root: discovered.root,
            pages,
            root_body: Some(discovered.root_body),
            traffic: discovered.traffic,
        })
        .with_detail("candidates", candidates)
        .with_detail("selected", selected))
    }

    #[instrument(skip_all, fields(job_id = %ctx.job_id(), pages = selected.pages.len()))]
    async fn extract(&mut self, selected: Selected, ctx: &PhaseContext) -> PhaseResult<Extracted> {
        let Selected {
            name,
            root,
            pages: urls,
            mut root_body,
            mut traffic,
        } = selected;

        let mut pages = Vec::with_capacity(urls.len());
        let mut failed = 0usize;

        for url in urls {
            ctx.report("current_url", url.as_str());

            let cached = if url == root { root_body.take() } else { None };
            let body = match cached {
                Some(body) => body,
                None => {
                    if let Err(blocked) = self.guard(&url) {
                        warn!(%url, error = %blocked, "page skipped");
                        failed += 1;
                        continue;
                    }
                    self.throttle().await;
                    match fetch_page(&self.client, &url).await {
                        Ok(page) => {
                            traffic.record(&page.body);
                            page.body
                        }
                        Err(e) => {
                            warn!(%url, error = %e, "page fetch failed");
                            failed += 1;
                            continue;
                        }
                    }
                }
            };

            match page_text(&body) {
                Ok(text) => pages.push(ExtractedPage {
                    content_hash: compute_hash(&text.markdown),
                    words: text.words(),
                    title: text.title,
                    markdown: text.markdown,
                    url,
                }),
                Err(e) => {
                    warn!(%url, error = %e, "page conversion failed");
                    failed += 1;
                }
            }
        }

        if pages.is_empty() {
            return Err(PhaseError::new("no selected page could be extracted")
                .with_detail("pages_failed", failed));
        }

        let extracted = pages.len();
        Ok(PhaseOutput::new(Extracted {
            name,
            root,
            pages,
            failed,
            traffic,
        })
        .with_detail("pages_extracted", extracted)
        .with_detail("pages_failed", failed))
    }

    #[instrument(skip_all, fields(job_id = %ctx.job_id(), pages = extracted.pages.len()))]
    async fn aggregate(&mut self, extracted: Extracted, ctx: &PhaseContext) -> PhaseResult<Aggregate> {
        let total_words: usize = extracted.pages.iter().map(|p| p.words).sum();
        let pages: Vec<serde_json::Value> = extracted
            .pages
            .iter()
            .map(|p| {
                json!({
                    "url": p.url.as_str(),
                    "title": p.title,
                    "content_hash": p.content_hash,
                    "words": p.words,
                })
            })
            .collect();

        let mut usage = Usage::new();
        usage.add("pages_fetched", extracted.traffic.pages);
        usage.add("bytes_fetched", extracted.traffic.bytes);

        let payload = json!({
            "name": extracted.name,
            "target": extracted.root.as_str(),
            "pages": pages,
            "total_words": total_words,
        });

        Ok(PhaseOutput::new(Aggregate { payload, usage }).with_detail("total_words", total_words))
    }
}
