//! SEC EDGAR document source.
//!
//! Talks to three registry endpoints: the company-tickers list, the
//! per-company submissions feed, and the filing archives. All requests carry
//! the contact-identifying `User-Agent` the SEC access policy requires; a
//! missing contact address fails at construction, not per entity.

use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use url::Url;

use async_trait::async_trait;

use crate::config::IndexConfig;
use crate::retry::retry_with_backoff;
use crate::source::{DocumentCache, DocumentSource};
use crate::types::{Entity, IndexError, RawDocument};

const TICKERS_URL: &str = "https://www.sec.gov/files/company_tickers.json";
const SUBMISSIONS_BASE: &str = "https://data.sec.gov/submissions/";
const ARCHIVES_BASE: &str = "https://www.sec.gov/Archives/edgar/data/";

/// Filing form types in preference order. The first form present in an
/// entity's recent submissions wins.
const FORM_PREFERENCE: [&str; 4] = ["10-K", "20-F", "S-1", "10-Q"];

/// Live EDGAR registry source with retry, back-off, and optional disk cache.
pub struct EdgarSource {
    client: Client,
    tickers_url: Url,
    submissions_base: Url,
    archives_base: Url,
    cache: Option<DocumentCache>,
    max_retries: u32,
    backoff_base_ms: u64,
}

impl EdgarSource {
    /// Builds a source from configuration.
    ///
    /// Fails with a configuration error when the contact email is missing:
    /// the registry's access policy is a startup precondition, and violating
    /// it mid-run would poison every request of the build.
    pub fn new(config: &IndexConfig) -> Result<Self, IndexError> {
        if config.contact_email.trim().is_empty() || !config.contact_email.contains('@') {
            return Err(IndexError::Config(
                "EDGAR requires a contact-identifying User-Agent; \
                 set SEC_CONTACT_EMAIL before building the index"
                    .to_string(),
            ));
        }
        let client = Client::builder()
            .user_agent(config.user_agent())
            .timeout(config.request_timeout)
            .use_rustls_tls()
            .build()?;
        Ok(Self {
            client,
            tickers_url: parse_url(TICKERS_URL)?,
            submissions_base: parse_url(SUBMISSIONS_BASE)?,
            archives_base: parse_url(ARCHIVES_BASE)?,
            cache: config.cache_dir.clone().map(DocumentCache::new),
            max_retries: config.max_retries,
            backoff_base_ms: config.backoff_base_ms,
        })
    }

    /// Redirects all registry endpoints to another host.
    ///
    /// Used by tests to point the source at a local mock server.
    #[must_use]
    pub fn with_endpoints(
        mut self,
        tickers_url: Url,
        submissions_base: Url,
        archives_base: Url,
    ) -> Self {
        self.tickers_url = tickers_url;
        self.submissions_base = submissions_base;
        self.archives_base = archives_base;
        self
    }

    /// One GET with the retry policy applied.
    ///
    /// `Ok(None)` means the resource does not exist (404). A 403 is an
    /// access-policy violation and is never retried.
    async fn get_text(&self, url: &Url) -> Result<Option<String>, IndexError> {
        retry_with_backoff(self.max_retries, self.backoff_base_ms, || {
            let client = self.client.clone();
            let url = url.clone();
            async move {
                let response = client.get(url.clone()).send().await?;
                match response.status() {
                    StatusCode::NOT_FOUND => Ok(None),
                    StatusCode::FORBIDDEN => Err(IndexError::AccessDenied(format!(
                        "registry refused {url}; check the User-Agent contact details"
                    ))),
                    _ => {
                        let response = response.error_for_status()?;
                        Ok(Some(response.text().await?))
                    }
                }
            }
        })
        .await
    }
}

#[async_trait]
impl DocumentSource for EdgarSource {
    async fn list_candidates(&self) -> Result<Vec<Entity>, IndexError> {
        if let Some(cache) = &self.cache {
            if let Some(entities) = cache.load_candidates().await? {
                tracing::info!(count = entities.len(), "loaded cached candidate list");
                return Ok(entities);
            }
        }

        let body = self
            .get_text(&self.tickers_url)
            .await
            .map_err(exhausted_to_fetch)?
            .ok_or_else(|| IndexError::Fetch("company tickers list not found".to_string()))?;

        let rows: std::collections::HashMap<String, TickerRow> = serde_json::from_str(&body)
            .map_err(|err| IndexError::Parse(format!("company tickers list: {err}")))?;

        let mut entities: Vec<Entity> = rows
            .into_values()
            .filter(|row| !row.ticker.trim().is_empty())
            .map(|row| Entity {
                ticker: row.ticker,
                cik: row.cik_str,
                title: row.title,
                exchange: row.exchange,
            })
            .collect();
        entities.sort_by(|a, b| a.ticker.cmp(&b.ticker));

        if let Some(cache) = &self.cache {
            cache.store_candidates(&entities).await?;
        }
        tracing::info!(count = entities.len(), "fetched candidate list from registry");
        Ok(entities)
    }

    async fn fetch_document(&self, entity: &Entity) -> Result<Option<RawDocument>, IndexError> {
        if let Some(cache) = &self.cache {
            for form in FORM_PREFERENCE {
                if let Some(content) = cache.load_filing(&entity.ticker, form).await? {
                    tracing::debug!(ticker = %entity.ticker, form, "using cached filing");
                    return Ok(Some(RawDocument {
                        entity_id: entity.ticker.clone(),
                        form_type: form.to_string(),
                        content,
                        fetched_at: Utc::now(),
                    }));
                }
            }
        }

        let submissions_url = self
            .submissions_base
            .join(&format!("CIK{:010}.json", entity.cik))
            .map_err(|err| IndexError::Config(err.to_string()))?;
        let Some(body) = self
            .get_text(&submissions_url)
            .await
            .map_err(exhausted_to_fetch)?
        else {
            return Ok(None);
        };
        let submissions: Submissions = serde_json::from_str(&body)
            .map_err(|err| IndexError::Parse(format!("submissions feed for {}: {err}", entity.ticker)))?;
        let recent = submissions.filings.recent;

        for form in FORM_PREFERENCE {
            // Recent filings are ordered newest-first, so `position` gives
            // the most recent filing of this form.
            let Some(position) = recent.form.iter().position(|f| f == form) else {
                continue;
            };
            let (Some(accession), Some(primary)) = (
                recent.accession_number.get(position),
                recent.primary_document.get(position),
            ) else {
                continue;
            };
            let document_url = self
                .archives_base
                .join(&format!(
                    "{}/{}/{}",
                    entity.cik,
                    accession.replace('-', ""),
                    primary
                ))
                .map_err(|err| IndexError::Config(err.to_string()))?;

            match self.get_text(&document_url).await {
                Ok(Some(content)) => {
                    if let Some(cache) = &self.cache {
                        cache.store_filing(&entity.ticker, form, &content).await?;
                    }
                    tracing::debug!(ticker = %entity.ticker, form, bytes = content.len(), "downloaded filing");
                    return Ok(Some(RawDocument {
                        entity_id: entity.ticker.clone(),
                        form_type: form.to_string(),
                        content,
                        fetched_at: Utc::now(),
                    }));
                }
                Ok(None) => continue,
                Err(err) => return Err(exhausted_to_fetch(err)),
            }
        }
        Ok(None)
    }
}

/// Transient errors that survived every retry become `Fetch` failures, which
/// the builder records and skips. Policy and parse errors keep their variant.
fn exhausted_to_fetch(err: IndexError) -> IndexError {
    match err {
        IndexError::Http(inner) => IndexError::Fetch(inner.to_string()),
        other => other,
    }
}

fn parse_url(value: &str) -> Result<Url, IndexError> {
    Url::parse(value).map_err(|err| IndexError::Config(format!("invalid URL '{value}': {err}")))
}

#[derive(Deserialize)]
struct TickerRow {
    cik_str: u64,
    ticker: String,
    title: String,
    #[serde(default)]
    exchange: Option<String>,
}

#[derive(Deserialize)]
struct Submissions {
    filings: Filings,
}

#[derive(Deserialize)]
struct Filings {
    recent: RecentFilings,
}

#[derive(Deserialize)]
struct RecentFilings {
    form: Vec<String>,
    #[serde(rename = "accessionNumber")]
    accession_number: Vec<String>,
    #[serde(rename = "primaryDocument")]
    primary_document: Vec<String>,
}
