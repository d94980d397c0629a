//! Utility functions and helpers.

pub mod fs;
pub mod http;

use scraper::Html;
use url::Url;

/// Join a path onto a base URL string, tolerating a missing trailing slash.
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Resolve a potentially relative URL against a base URL.
pub fn resolve_url(base: &Url, href: &str) -> String {
    base.join(href)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| href.to_string())
}

/// Extension of the last path segment, lowercased, including the leading dot.
///
/// Query strings are ignored. Empty when there is no extension.
pub fn file_extension(path: &str) -> String {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    let file = path.rsplit('/').next().unwrap_or(path);
    match file.rfind('.') {
        Some(idx) if idx > 0 => file[idx..].to_ascii_lowercase(),
        _ => String::new(),
    }
}

/// Flatten an HTML fragment to whitespace-normalized text.
pub fn html_to_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let text: Vec<&str> = fragment.root_element().text().collect();
    text.join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}
