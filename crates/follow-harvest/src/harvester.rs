//! DOM Harvester: read identity and presentation fields out of rendered
//! list-item fragments.
//!
//! Each physical fragment is processed at most once per crawl (keyed by its
//! surface-assigned token). Virtualization recycles elements, so the same
//! member may legitimately be read again from a different fragment later;
//! the store merge rules make that harmless.

use anyhow::Result;
use regex::Regex;
use scraper::{Html, Selector};

use crate::config::HarvestConfig;
use crate::store::HarvestStores;
use crate::surface::{Fragment, RenderSurface};
use crate::types::{MemberIdentity, PresenceRecord};

/// Counts from one scan.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    /// Fragments rendered at scan time.
    pub rendered: usize,
    /// Fragments not seen before this crawl.
    pub fresh: usize,
    /// Fresh fragments that yielded a member.
    pub harvested: usize,
    /// Fresh fragments with no profile link (not a member cell).
    pub misses: usize,
    /// Identities added to the presence store.
    pub new_identities: usize,
}

/// Compiled selectors and patterns for fragment extraction.
pub struct DomHarvester {
    link_selector: Selector,
    name_selector: Selector,
    image_selector: Selector,
    profile_link: Regex,
    follows_you: Regex,
    profile_base: String,
}

impl DomHarvester {
    pub fn new(config: &HarvestConfig) -> Self {
        Self {
            link_selector: Selector::parse(r#"a[href^="/"]"#).expect("link selector is valid"),
            name_selector: Selector::parse(r#"div[dir="auto"] span"#)
                .expect("name selector is valid"),
            image_selector: Selector::parse("img").expect("image selector is valid"),
            profile_link: Regex::new(r"^/([A-Za-z0-9_]+)$").expect("profile link regex is valid"),
            follows_you: Regex::new(r"(?i)\bfollows you\b").expect("follows-you regex is valid"),
            profile_base: config.profile_base.trim_end_matches('/').to_string(),
        }
    }

    /// Query the surface and harvest every fragment not yet visited.
    pub async fn scan_visible(
        &self,
        surface: &dyn RenderSurface,
        stores: &mut HarvestStores,
    ) -> Result<ScanReport> {
        let fragments = surface.fragments().await?;
        Ok(self.scan_fragments(&fragments, stores))
    }

    /// Harvest a fragment snapshot. Idempotent for an unchanged snapshot.
    pub fn scan_fragments(&self, fragments: &[Fragment], stores: &mut HarvestStores) -> ScanReport {
        let mut report = ScanReport {
            rendered: fragments.len(),
            ..ScanReport::default()
        };
        for fragment in fragments {
            if !stores.visited.mark(fragment.token) {
                continue;
            }
            report.fresh += 1;
            match self.extract(&fragment.html) {
                Some(record) => {
                    report.harvested += 1;
                    if self.absorb(record, stores) {
                        report.new_identities += 1;
                    }
                }
                None => {
                    report.misses += 1;
                    tracing::trace!("fragment {} has no profile link", fragment.token);
                }
            }
        }
        report
    }

    /// Merge one extraction and promote a positive reciprocal signal into
    /// the metadata store. Returns `true` if the identity is new.
    fn absorb(&self, record: PresenceRecord, stores: &mut HarvestStores) -> bool {
        if record.reciprocal {
            stores.metadata.promote_reciprocal(&record.identity);
        }
        stores.presence.absorb(record)
    }

    /// Extract a presence record from one fragment's HTML, or `None` if the
    /// fragment is not a member cell.
    pub fn extract(&self, html: &str) -> Option<PresenceRecord> {
        let doc = Html::parse_fragment(html);

        let handle = doc
            .select(&self.link_selector)
            .filter_map(|a| a.value().attr("href"))
            .find_map(|href| self.profile_link.captures(href))
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())?;

        let display_name = doc
            .select(&self.name_selector)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .unwrap_or_default();

        let sources: Vec<&str> = doc
            .select(&self.image_selector)
            .filter_map(|img| img.value().attr("src"))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        let avatar_ref = pick_avatar(&sources);

        let text = doc.root_element().text().collect::<Vec<_>>().join(" ");
        let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
        let reciprocal = self.follows_you.is_match(&text);

        Some(PresenceRecord {
            profile_ref: format!("{}/{}", self.profile_base, handle),
            identity: MemberIdentity::new(handle),
            display_name,
            avatar_ref,
            reciprocal,
        })
    }
}

/// Prefer a secure reference, then any absolute one, then whatever exists.
fn pick_avatar(sources: &[&str]) -> String {
    if let Some(s) = sources.iter().find(|s| s.starts_with("https://")) {
        return s.to_string();
    }
    if let Some(s) = sources.iter().find(|s| s.starts_with("//")) {
        return format!("https:{s}");
    }
    if let Some(s) = sources.iter().find(|s| s.starts_with("http://")) {
        return s.to_string();
    }
    sources.first().map(|s| s.to_string()).unwrap_or_default()
}
