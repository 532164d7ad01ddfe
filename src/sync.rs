//! Source ingestion for the knowledge cache.
//!
//! Seeds the entry store from a bundled document when empty (so first run
//! works offline) and best-effort refreshes from an ordered list of file
//! or HTTP sources. One bad source never blocks the others; merging is
//! keyed by entry id, so the last source to carry a given id wins.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::SyncSkip;
use crate::models::Entry;
use crate::store::EntryStore;

/// Meta key for the bundled seed document.
const SEED_SOURCE: &str = "seed";

/// A versioned reference document as produced by the ingestion pipeline.
///
/// Producer variants name the entry collection either `entries` or
/// `guidelines`; the alias normalizes that at the parse boundary so the
/// ambiguity goes no further.
#[derive(Debug, Deserialize)]
struct SourceDocument {
    version: VersionField,
    #[serde(alias = "guidelines")]
    entries: Vec<RawEntry>,
}

/// Producers send the version as either a string or a number.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum VersionField {
    Text(String),
    Number(f64),
}

impl VersionField {
    fn normalize(&self) -> String {
        match self {
            VersionField::Text(s) => s.clone(),
            VersionField::Number(n) => n.to_string(),
        }
    }
}

/// One entry as it appears on the wire. `content` may be absent when the
/// producer ships structured fields instead.
#[derive(Debug, Deserialize)]
struct RawEntry {
    id: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    steps: Vec<String>,
    #[serde(default)]
    red_flags: Vec<String>,
}

impl RawEntry {
    /// Render a readable text block for entries that ship structured
    /// fields instead of plain content.
    fn render_content(&self) -> String {
        if let Some(content) = &self.content {
            if !content.trim().is_empty() {
                return content.clone();
            }
        }

        let title = self.id.as_deref().unwrap_or("Unknown").replace('_', " ");
        let mut parts = vec![format!("## {title}")];

        if !self.keywords.is_empty() {
            parts.push(format!("Related terms: {}", self.keywords.join(", ")));
        }

        if !self.steps.is_empty() {
            parts.push("Steps:".to_string());
            for (i, step) in self.steps.iter().enumerate() {
                parts.push(format!("{}. {step}", i + 1));
            }
        }

        if !self.red_flags.is_empty() {
            parts.push("Red flags (seek emergency help):".to_string());
            for flag in &self.red_flags {
                parts.push(format!("- {flag}"));
            }
        }

        parts.join("\n")
    }
}

pub struct SyncManager {
    store: Arc<dyn EntryStore>,
    config: SyncConfig,
    client: reqwest::Client,
}

impl SyncManager {
    pub fn new(store: Arc<dyn EntryStore>, config: SyncConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            store,
            config,
            client,
        }
    }

    /// Seed the store from the bundled document iff it is empty.
    ///
    /// Runs regardless of network status so first-time offline users have
    /// data. Returns whether seeding happened.
    pub async fn ensure_seeded(&self) -> bool {
        match self.store.get_all().await {
            Ok(entries) if !entries.is_empty() => return false,
            Ok(_) => {}
            Err(e) => {
                warn!("cannot check seed state: {e}");
                return false;
            }
        }

        let Some(seed_path) = &self.config.seed_path else {
            debug!("no seed document configured");
            return false;
        };

        let seed = seed_path.display().to_string();
        match self.ingest_source(SEED_SOURCE, &seed).await {
            Ok(changed) => {
                if changed {
                    info!("seeded knowledge cache from {seed}");
                }
                changed
            }
            Err(e) => {
                warn!("failed to seed from {seed}: {e}");
                false
            }
        }
    }

    /// Refresh from every configured source, in order.
    ///
    /// Transport and parse failures are per-source: logged, skipped, and
    /// never fatal. Returns whether any source changed store state.
    pub async fn refresh_from_sources(&self) -> bool {
        let mut updated = false;

        for source in &self.config.sources {
            match self.ingest_source(source, source).await {
                Ok(changed) => updated |= changed,
                Err(e) => warn!("skipping source {source}: {e}"),
            }
        }

        updated
    }

    /// Fetch, parse, and upsert one source document.
    ///
    /// An unchanged version marker for this source short-circuits without
    /// touching the entries.
    async fn ingest_source(&self, meta_key: &str, location: &str) -> Result<bool, SyncSkip> {
        let body = self.fetch(location).await?;

        let doc: SourceDocument = serde_json::from_str(&body)
            .map_err(|e| SyncSkip::FormatInvalid(e.to_string()))?;
        let version = doc.version.normalize();

        if let Ok(Some(stored)) = self.store.meta_version(meta_key).await {
            if stored == version {
                debug!("source {meta_key} unchanged at version {version}");
                return Ok(false);
            }
        }

        let now = Utc::now().timestamp_millis();
        let entries: Vec<Entry> = doc
            .entries
            .iter()
            .filter_map(|raw| {
                let id = raw.id.clone()?;
                Some(Entry {
                    id,
                    content: raw.render_content(),
                    version: version.clone(),
                    updated_at: now,
                })
            })
            .collect();

        self.store.upsert_many(&entries).await?;
        if let Err(e) = self.store.set_meta_version(meta_key, &version).await {
            warn!("failed to record version for {meta_key}: {e}");
        }

        info!(
            "ingested {} entries from {meta_key} (version {version})",
            entries.len()
        );
        Ok(true)
    }

    async fn fetch(&self, location: &str) -> Result<String, SyncSkip> {
        if location.starts_with("http://") || location.starts_with("https://") {
            let response = self
                .client
                .get(location)
                .send()
                .await
                .map_err(|e| SyncSkip::FetchFailed(e.to_string()))?;
            if !response.status().is_success() {
                return Err(SyncSkip::FetchFailed(format!("HTTP {}", response.status())));
            }
            response
                .text()
                .await
                .map_err(|e| SyncSkip::FetchFailed(e.to_string()))
        } else {
            tokio::fs::read_to_string(location)
                .await
                .map_err(|e| SyncSkip::FetchFailed(e.to_string()))
        }
    }
}
