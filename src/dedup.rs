//! Content hashing for duplicate-story detection.
//!
//! Two articles with equal [`ContentHasher::hash`] are treated as the same
//! story and always end up in the same topic, whatever their embeddings say.
//! Which fields take part in the hash is configurable through
//! [`DedupSettings`].

use crate::config::{DedupSettings, HashField};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use url::Url;

static NON_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\p{L}\p{N}\s]+").expect("invalid regex"));
static SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("invalid regex"));

#[derive(Debug, Clone)]
pub struct ContentHasher {
    settings: DedupSettings,
}

impl ContentHasher {
    pub fn new(settings: DedupSettings) -> Self {
        Self { settings }
    }

    /// SHA-256 (hex) over the configured normalized fields, joined by `\n`.
    pub fn hash(&self, title: &str, url: &str, description: Option<&str>) -> String {
        let parts = self
            .settings
            .fields
            .iter()
            .map(|field| match field {
                HashField::Title => normalize_text(title),
                HashField::Url => normalize_url(url, self.settings.strip_query),
                HashField::Description => normalize_text(description.unwrap_or("")),
            })
            .collect::<Vec<_>>();

        let mut hasher = Sha256::new();
        hasher.update(parts.join("\n").as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Lowercase, drop punctuation, collapse whitespace.
pub fn normalize_text(s: &str) -> String {
    let lowered = s.to_lowercase();
    let stripped = NON_WORD.replace_all(&lowered, " ");
    SPACES.replace_all(stripped.trim(), " ").into_owned()
}

/// Canonical form of an article url.
///
/// Host is lowercased with a leading `www.` removed, the fragment is
/// dropped, the query is dropped when `strip_query` is set, and a trailing
/// `/` is removed. Strings that do not parse as urls are normalized as text.
pub fn normalize_url(raw: &str, strip_query: bool) -> String {
    let Ok(mut parsed) = Url::parse(raw.trim()) else {
        return normalize_text(raw);
    };
    parsed.set_fragment(None);
    if strip_query {
        parsed.set_query(None);
    }
    let host = host_of(&parsed).unwrap_or_default();
    let path = parsed.path().trim_end_matches('/');
    match parsed.query() {
        Some(q) if !q.is_empty() => format!("{host}{path}?{q}"),
        _ => format!("{host}{path}"),
    }
}

/// Publishing domain of an article url, e.g. `g1.globo.com`.
///
/// # Returns
/// `None` when `raw` is not an absolute url with a host.
pub fn source_domain(raw: &str) -> Option<String> {
    Url::parse(raw.trim()).ok().as_ref().and_then(host_of)
}

fn host_of(url: &Url) -> Option<String> {
    url.host_str()
        .map(|h| h.to_lowercase().trim_start_matches("www.").to_string())
        .filter(|h| !h.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hasher() -> ContentHasher {
        ContentHasher::new(DedupSettings::default())
    }

    #[test]
    fn normalize_text_strips_punctuation_and_case() {
        assert_eq!(
            normalize_text("  Autismo:  Nova LEI aprovada! "),
            "autismo nova lei aprovada"
        );
        assert_eq!(normalize_text("Inclusão — já"), "inclusão já");
    }

    #[test]
    fn normalize_url_canonical_forms() {
        assert_eq!(
            normalize_url("https://WWW.G1.globo.com/saude/autismo/?utm_source=x#top", true),
            "g1.globo.com/saude/autismo"
        );
        assert_eq!(
            normalize_url("http://g1.globo.com/saude/autismo?id=3", false),
            "g1.globo.com/saude/autismo?id=3"
        );
        assert_eq!(normalize_url("not a url", true), "not a url");
    }

    #[test]
    fn source_domain_drops_www_and_case() {
        assert_eq!(
            source_domain("https://WWW.Folha.uol.com.br/cotidiano/x.shtml").as_deref(),
            Some("folha.uol.com.br")
        );
        assert_eq!(source_domain("not a url"), None);
    }

    #[test]
    fn same_story_different_tracking_params_hash_equal() {
        let h = hasher();
        let a = h.hash(
            "Autismo: nova lei aprovada",
            "https://www.folha.uol.com.br/cotidiano/lei-autismo.shtml?utm_medium=social",
            None,
        );
        let b = h.hash(
            "AUTISMO - Nova lei aprovada",
            "https://folha.uol.com.br/cotidiano/lei-autismo.shtml",
            Some("ignored by default"),
        );
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn different_titles_hash_differently() {
        let h = hasher();
        let url = "https://g1.globo.com/x";
        assert_ne!(h.hash("Título A", url, None), h.hash("Título B", url, None));
    }

    #[test]
    fn configured_fields_change_composition() {
        let url_only = ContentHasher::new(DedupSettings {
            fields: vec![HashField::Url],
            strip_query: true,
        });
        let url = "https://g1.globo.com/x";
        assert_eq!(
            url_only.hash("Título A", url, None),
            url_only.hash("Título B", url, None)
        );

        let with_desc = ContentHasher::new(DedupSettings {
            fields: vec![HashField::Title, HashField::Description],
            strip_query: true,
        });
        assert_ne!(
            with_desc.hash("T", url, Some("um")),
            with_desc.hash("T", url, Some("dois"))
        );
    }
}
