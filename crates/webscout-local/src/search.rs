//! Search orchestration: one engine query, concurrent per-URL extraction.

use crate::browser::BrowserContext;
use crate::extract;
use chromiumoxide::Page;
use futures_util::stream::{FuturesUnordered, StreamExt};
use scraper::{Html, Selector};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;
use webscout_core::{Error, Result, SearchResult, SearchResults};

/// Result anchors on the engine's result page. The `jsname` attribute marks
/// organic results and excludes chrome like "People also ask".
const RESULT_ANCHOR_SELECTOR: &str = "#rso a[jsname]";

/// Low-value URLs skipped during discovery.
const SKIP_URL_PATTERN: &str = "youtube.com/watch?v";

const SEARCH_PAGE_TIMEOUT: Duration = Duration::from_secs(10);

fn search_endpoint() -> String {
    // Override exists for fixture servers in tests.
    crate::env("WEBSCOUT_SEARCH_ENDPOINT")
        .unwrap_or_else(|| "https://www.google.com/search".to_string())
}

fn search_url(query: &str) -> Result<Url> {
    // udm=14 selects the plain "web" results view.
    Url::parse_with_params(&search_endpoint(), &[("q", query), ("udm", "14")])
        .map_err(|e| Error::Search(e.to_string()))
}

/// Run one query through the session's browser context and extract up to
/// `max_results` discovered pages concurrently.
///
/// A failed extraction drops that URL from the aggregate without failing the
/// batch; results land in extraction-completion order.
pub async fn search(
    ctx: &BrowserContext,
    query: &str,
    max_results: usize,
) -> Result<SearchResults> {
    if query.trim().is_empty() {
        return Err(Error::Search("no query provided".to_string()));
    }
    let url = search_url(query)?;
    info!(query, max_results, "searching");

    let page = ctx.new_page().await?;
    let discovered = load_result_urls(&page, &url, max_results).await;
    if let Err(e) = page.close().await {
        warn!(error = %e, "error closing search results page");
    }
    let urls = discovered?;
    info!(query, discovered = urls.len(), "extracting results");

    let mut extractions: FuturesUnordered<_> =
        urls.into_iter().map(|u| extract_one(ctx, u)).collect();
    let mut results = Vec::new();
    while let Some(outcome) = extractions.next().await {
        match outcome {
            Ok(result) => results.push(result),
            Err((u, e)) => warn!(url = %u, error = %e, "extraction failed, dropping result"),
        }
    }

    Ok(SearchResults {
        query: query.to_string(),
        results,
    })
}

async fn load_result_urls(page: &Page, url: &Url, max_results: usize) -> Result<Vec<String>> {
    match tokio::time::timeout(SEARCH_PAGE_TIMEOUT, page.goto(url.as_str())).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => return Err(Error::Search(format!("search page navigation: {e}"))),
        Err(_) => {
            return Err(Error::Search(format!(
                "search page navigation timed out after {}ms",
                SEARCH_PAGE_TIMEOUT.as_millis()
            )))
        }
    }
    let html = page
        .content()
        .await
        .map_err(|e| Error::Search(format!("reading search results page: {e}")))?;
    Ok(parse_result_urls(&html, url, max_results))
}

/// Parse result anchors in document order, resolving relative hrefs against
/// the result page, de-duplicating by URL, and skipping the low-value
/// pattern. Stops once `max_results` URLs are discovered.
pub(crate) fn parse_result_urls(html: &str, base: &Url, max_results: usize) -> Vec<String> {
    let Ok(selector) = Selector::parse(RESULT_ANCHOR_SELECTOR) else {
        return Vec::new();
    };
    let doc = Html::parse_document(html);

    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::new();
    for el in doc.select(&selector) {
        if out.len() >= max_results {
            break;
        }
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        let href = href.trim();
        if href.is_empty() {
            continue;
        }
        let Ok(resolved) = base.join(href) else {
            continue;
        };
        let resolved = resolved.to_string();
        if resolved.contains(SKIP_URL_PATTERN) {
            continue;
        }
        if !seen.insert(resolved.clone()) {
            continue;
        }
        out.push(resolved);
    }
    out
}

/// Extract one URL in its own page; the page is closed regardless of outcome.
async fn extract_one(
    ctx: &BrowserContext,
    url: String,
) -> std::result::Result<SearchResult, (String, Error)> {
    let page = match ctx.new_page().await {
        Ok(page) => page,
        Err(e) => return Err((url, e)),
    };
    let out = extract::extract_page(&page, &url).await;
    if let Err(e) = page.close().await {
        warn!(url = %url, error = %e, "error closing result page");
    }
    out.map_err(|e| (url, e))
}
