//! Single-page content extraction: navigate, wait for DOM stability, strip
//! boilerplate, convert the main content to Markdown.

use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::Page;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;
use webscout_core::{Error, Result, SearchResult};

use crate::markdown;

pub const NAVIGATE_TIMEOUT: Duration = Duration::from_millis(1_000);
const QUIET_PERIOD_MS: u64 = 500;
const STABILIZE_TIMEOUT_MS: u64 = 2_000;

/// Selector hits shorter than this (after Markdown conversion) are treated as
/// empty shells and skipped.
const MIN_CONTENT_CHARS: usize = 200;

/// Produce a `SearchResult` for `url` using `page`.
///
/// Navigation is best-effort: a timeout or navigation error is logged and
/// whatever content the page holds is still processed. Everything after the
/// stability wait is a hard failure for this URL only.
pub async fn extract_page(page: &Page, url: &str) -> Result<SearchResult> {
    let mut result = SearchResult::new(url);

    match tokio::time::timeout(NAVIGATE_TIMEOUT, page.goto(url)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!(url, error = %e, "navigation error, extracting current content"),
        Err(_) => warn!(
            url,
            timeout_ms = NAVIGATE_TIMEOUT.as_millis() as u64,
            "navigation timed out, extracting current content"
        ),
    }

    let settled = wait_for_dom_stability(page, QUIET_PERIOD_MS, STABILIZE_TIMEOUT_MS).await?;
    result.debug.push(format!("dom settled via {settled}"));

    let candidates = collect_candidates(page).await?;
    let (content, notes) = select_main_content(&candidates);
    result.debug.extend(notes);
    result.content = Some(content);
    Ok(result)
}

/// Wait until the DOM has gone `quiet_ms` without mutations, or until the
/// `stabilize_ms` ceiling — whichever comes first. Resolves to which of the
/// two fired, for diagnostics.
async fn wait_for_dom_stability(page: &Page, quiet_ms: u64, stabilize_ms: u64) -> Result<String> {
    let script = format!(
        r#"
new Promise((resolve) => {{
  let quietTimer;
  const observer = new MutationObserver(() => {{
    clearTimeout(quietTimer);
    quietTimer = window.setTimeout(() => {{
      observer.disconnect();
      resolve('quiet period');
    }}, {quiet_ms});
  }});
  observer.observe(document.documentElement, {{
    childList: true,
    subtree: true,
    characterData: true
  }});
  quietTimer = window.setTimeout(() => {{
    observer.disconnect();
    resolve('quiet period');
  }}, {quiet_ms});
  window.setTimeout(() => {{
    observer.disconnect();
    resolve('stability ceiling');
  }}, {stabilize_ms});
}})
"#
    );

    let params = EvaluateParams::builder()
        .expression(script)
        .await_promise(true)
        .return_by_value(true)
        .build()
        .map_err(Error::Extract)?;
    page.evaluate(params)
        .await
        .map_err(|e| Error::Extract(format!("dom stability wait: {e}")))?
        .into_value::<String>()
        .map_err(|e| Error::Extract(format!("dom stability result: {e}")))
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Candidate {
    pub selector: String,
    pub html: String,
}

/// Strip boilerplate from the live DOM and collect the HTML of every
/// main-content candidate selector, in priority order.
async fn collect_candidates(page: &Page) -> Result<Vec<Candidate>> {
    const SCRIPT: &str = r#"
(() => {
  const remove = (sel) => document.querySelectorAll(sel).forEach((el) => el.remove());
  remove('noscript, script, style, iframe');
  remove('[class*="ad-"], [id*="ad-"], [class*="advert"], [id*="advert"], .ads, .sponsored');
  remove('header, footer, nav, aside');
  remove('.sidebar, .advertisement, .promo, .related-content');

  const selectors = ['main', 'article', '.content', '.post-content', '.entry-content', '.main-content', 'body'];
  const out = [];
  for (const selector of selectors) {
    const matches = document.querySelectorAll(selector);
    if (!matches.length) continue;
    let html = '';
    for (const el of matches) html += el.outerHTML;
    out.push({ selector, html });
  }
  return out;
})()
"#;

    let params = EvaluateParams::builder()
        .expression(SCRIPT)
        .return_by_value(true)
        .build()
        .map_err(Error::Extract)?;
    page.evaluate(params)
        .await
        .map_err(|e| Error::Extract(format!("content selection: {e}")))?
        .into_value::<Vec<Candidate>>()
        .map_err(|e| Error::Extract(format!("content selection result: {e}")))
}

/// Convert candidates to Markdown in priority order and accept the first one
/// that clears the minimum-length threshold. Records why earlier candidates
/// were skipped.
pub(crate) fn select_main_content(candidates: &[Candidate]) -> (String, Vec<String>) {
    let mut notes = Vec::new();
    for candidate in candidates {
        let md = markdown::to_markdown(&candidate.html);
        let chars = md.chars().count();
        if chars < MIN_CONTENT_CHARS {
            notes.push(format!(
                "selector {} found but extracted no content, skipping",
                candidate.selector
            ));
            continue;
        }
        notes.push(format!(
            "extracted {chars} characters with selector: {}",
            candidate.selector
        ));
        return (md, notes);
    }
    (String::new(), notes)
}
