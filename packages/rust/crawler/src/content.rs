//! Main-content extraction and HTML to Markdown conversion.

use scraper::{Html, Selector};
use tracing::debug;

use batchscout_shared::{BatchScoutError, Result};

/// Content of one page after chrome removal.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PageText {
    pub title: Option<String>,
    pub markdown: String,
}

impl PageText {
    pub fn words(&self) -> usize {
        self.markdown.split_whitespace().count()
    }
}

/// Extract the main content of `html` and convert it to Markdown.
pub(crate) fn page_text(html: &str) -> Result<PageText> {
    let doc = Html::parse_document(html);
    let title = extract_title(&doc);
    let content_html = main_content_html(&doc);

    let converter = htmd::HtmlToMarkdown::builder()
        .skip_tags(vec!["script", "style", "nav", "iframe", "noscript", "svg"])
        .build();
    let markdown = converter
        .convert(&content_html)
        .map_err(|e| BatchScoutError::parse(format!("htmd conversion failed: {e}")))?;

    debug!(markdown_len = markdown.len(), "page converted");
    Ok(PageText {
        title,
        markdown: markdown.trim().to_string(),
    })
}

/// Readability heuristics: `<main>`, `<article>`, then the body minus chrome.
fn main_content_html(doc: &Html) -> String {
    for sel_str in ["main", "article", r#"[role="main"]"#, ".content", "body"] {
        let Ok(sel) = Selector::parse(sel_str) else {
            continue;
        };
        if let Some(el) = doc.select(&sel).next() {
            return strip_chrome(&el.inner_html());
        }
    }
    String::new()
}

/// Strip common navigation/chrome elements from HTML content.
fn strip_chrome(html: &str) -> String {
    let Ok(chrome_sel) =
        Selector::parse("nav, header, footer, aside, script, style, .sidebar, .nav")
    else {
        return html.to_string();
    };
    let fragment = Html::parse_fragment(html);

    let mut result = html.to_string();
    for el in fragment.select(&chrome_sel) {
        result = result.replace(&el.html(), "");
    }
    result
}

/// First `<h1>`, falling back to `<title>`.
fn extract_title(doc: &Html) -> Option<String> {
    ["h1", "title"].into_iter().find_map(|tag| {
        let sel = Selector::parse(tag).ok()?;
        let text = doc.select(&sel).next()?.text().collect::<String>();
        let text = text.trim();
        (!text.is_empty()).then(|| text.to_string())
    })
}
