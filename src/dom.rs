//! Selector queries over an HTML snapshot of the page.
//!
//! `scraper::Html` is not `Send`, so a [`Snapshot`] must never live across an
//! `.await`: parse, read what you need into owned values, drop.

use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::warn;

/// A hyperlink as it appears in the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    pub text: String,
    pub href: String,
}

pub struct Snapshot {
    document: Html,
}

fn parse_selector(pattern: &str) -> Option<Selector> {
    match Selector::parse(pattern) {
        Ok(selector) => Some(selector),
        Err(e) => {
            warn!("skipping unparsable selector {:?}: {:?}", pattern, e);
            None
        }
    }
}

fn element_text(el: &ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_string()
}

impl Snapshot {
    pub fn parse(html: &str) -> Self {
        Self {
            document: Html::parse_document(html),
        }
    }

    pub fn exists(&self, pattern: &str) -> bool {
        parse_selector(pattern)
            .map(|sel| self.document.select(&sel).next().is_some())
            .unwrap_or(false)
    }

    /// First pattern in `patterns` that matches anything.
    pub fn first_match<'p>(&self, patterns: &'p [String]) -> Option<&'p str> {
        patterns
            .iter()
            .map(String::as_str)
            .find(|pattern| self.exists(pattern))
    }

    pub fn any_match(&self, patterns: &[String]) -> bool {
        self.first_match(patterns).is_some()
    }

    /// Text of every element matching `pattern`, in document order.
    ///
    /// Elements nested inside another match of the same pattern are skipped so
    /// that a wrapper and its child do not contribute the same text twice.
    pub fn texts(&self, pattern: &str) -> Vec<String> {
        let Some(selector) = parse_selector(pattern) else {
            return Vec::new();
        };

        let mut matched = HashSet::new();
        let mut out = Vec::new();
        for el in self.document.select(&selector) {
            matched.insert(el.id());
            if el.ancestors().any(|a| matched.contains(&a.id())) {
                continue;
            }
            let text = element_text(&el);
            if !text.is_empty() {
                out.push(text);
            }
        }
        out
    }

    /// All matches of `pattern` concatenated with blank lines between them.
    pub fn joined_text(&self, pattern: &str) -> String {
        self.texts(pattern).join("\n\n")
    }

    /// Anchors carrying an `href`, in document order.
    pub fn anchors(&self) -> Vec<Anchor> {
        let Some(selector) = parse_selector("a[href]") else {
            return Vec::new();
        };
        self.document
            .select(&selector)
            .filter_map(|el| {
                let href = el.value().attr("href")?.trim().to_string();
                Some(Anchor {
                    text: element_text(&el),
                    href,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><body>
          <div class="answer-wrapper">
            <div class="answer-body">First paragraph.</div>
            <div class="answer-body">Second paragraph.</div>
          </div>
          <div class="typing-dots"></div>
          <a href="https://example.org/a"> Example A </a>
          <a href="/relative">Relative</a>
          <a name="no-href">Nothing</a>
        </body></html>
    "#;

    #[test]
    fn nested_matches_are_counted_once() {
        let snap = Snapshot::parse(PAGE);
        let texts = snap.texts("[class*=\"answer\"]");
        assert_eq!(texts.len(), 1);
        assert!(texts[0].contains("First paragraph."));
        assert!(texts[0].contains("Second paragraph."));
    }

    #[test]
    fn sibling_matches_are_joined() {
        let snap = Snapshot::parse(PAGE);
        assert_eq!(
            snap.joined_text(".answer-body"),
            "First paragraph.\n\nSecond paragraph."
        );
    }

    #[test]
    fn first_match_respects_rank() {
        let snap = Snapshot::parse(PAGE);
        let patterns = vec![
            ".missing".to_string(),
            "[class*=\"typing\"]".to_string(),
            "div".to_string(),
        ];
        assert_eq!(snap.first_match(&patterns), Some("[class*=\"typing\"]"));
    }

    #[test]
    fn bad_selector_matches_nothing() {
        let snap = Snapshot::parse(PAGE);
        assert!(!snap.exists("[class*="));
        assert!(snap.texts("[class*=").is_empty());
    }

    #[test]
    fn anchors_keep_raw_href_and_trimmed_text() {
        let snap = Snapshot::parse(PAGE);
        let anchors = snap.anchors();
        assert_eq!(anchors.len(), 2);
        assert_eq!(anchors[0].text, "Example A");
        assert_eq!(anchors[0].href, "https://example.org/a");
        assert_eq!(anchors[1].href, "/relative");
    }
}
