//! Token-budgeted refinement of raw search results.
//!
//! Refinement is a quality enhancement, not a correctness requirement: when
//! the aggregate already fits the budget, or no model provider was resolved,
//! the input passes through untouched.

use crate::llm::RefineClient;
use crate::tokens;
use futures_util::future::join_all;
use tracing::{info, warn};
use webscout_core::{Result, SearchResult, SearchResults};

/// Max number of model tokens across all returned results.
pub const MAX_RESULTS_TOKENS: usize = 50_000;

pub async fn refine(client: Option<&RefineClient>, unrefined: SearchResults) -> Result<SearchResults> {
    let raw: String = unrefined.results.iter().map(SearchResult::content_str).collect();
    let total_unrefined = tokens::count(&raw);
    if total_unrefined <= MAX_RESULTS_TOKENS {
        info!(
            total_tokens = total_unrefined,
            budget = MAX_RESULTS_TOKENS,
            "results within token budget, skipping refinement"
        );
        return Ok(unrefined);
    }

    let Some(client) = client else {
        warn!("no model provider credentials resolved, skipping refinement");
        return Ok(unrefined);
    };

    info!(
        total_tokens = total_unrefined,
        budget = MAX_RESULTS_TOKENS,
        "token budget exceeded, refining results"
    );

    let now = request_time();
    let SearchResults { query, results } = unrefined;
    let refined = join_all(
        results
            .into_iter()
            .map(|r| refine_result(client, &now, &query, r)),
    )
    .await
    .into_iter()
    .collect::<Result<Vec<Refined>>>()?;

    let total_refined: usize = refined.iter().map(|r| r.tokens).sum();
    if total_refined <= MAX_RESULTS_TOKENS {
        // Refinement alone brought the aggregate under budget; keep the
        // original order.
        return Ok(SearchResults {
            query,
            results: refined.into_iter().map(|r| r.result).collect(),
        });
    }

    Ok(SearchResults {
        query,
        results: pack(refined, MAX_RESULTS_TOKENS),
    })
}

struct Refined {
    result: SearchResult,
    tokens: usize,
}

async fn refine_result(
    client: &RefineClient,
    time: &str,
    query: &str,
    mut result: SearchResult,
) -> Result<Refined> {
    let output = client
        .refine(time, query, &result.url, result.content_str())
        .await?;
    let (score, content) = parse_refined_output(&output);
    let tokens = tokens::count(&content);
    result.score = Some(score);
    result.content = Some(content);
    Ok(Refined { result, tokens })
}

/// Split the model output into a grade and the excerpt document.
///
/// The grade is the leading integer of the first line, clamped to [1, 10];
/// an unparseable first line grades 0 (which the packer later discards).
fn parse_refined_output(output: &str) -> (u32, String) {
    let mut lines = output.lines();
    let first = lines.next().unwrap_or("");
    let score = leading_int(first)
        .map(|n| n.clamp(1, 10) as u32)
        .unwrap_or(0);
    let content = lines.collect::<Vec<_>>().join("\n");
    (score, content)
}

/// Parse a leading (optionally signed) integer, ignoring trailing text.
fn leading_int(s: &str) -> Option<i64> {
    let s = s.trim_start();
    let bytes = s.as_bytes();
    let start = usize::from(matches!(bytes.first(), Some(b'-') | Some(b'+')));
    let end = start
        + bytes[start..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count();
    if end == start {
        return None;
    }
    s[..end].parse().ok()
}

/// Greedy bounded-knapsack pass over refined results.
///
/// Results with zero score or zero tokens are discarded; the rest are walked
/// in descending value-density order (stable sort, so equal densities keep
/// their original relative order). The first result that does not fit whole
/// is truncated at a token boundary to exactly the remaining budget, and
/// everything after the budget is exhausted is dropped.
fn pack(refined: Vec<Refined>, budget: usize) -> Vec<SearchResult> {
    let mut keep: Vec<Refined> = refined
        .into_iter()
        .filter(|r| r.result.score.unwrap_or(0) > 0 && r.tokens > 0)
        .collect();
    keep.sort_by(|a, b| {
        density(b)
            .partial_cmp(&density(a))
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut out = Vec::new();
    let mut budget_left = budget;
    for mut r in keep {
        if budget_left < 1 {
            break;
        }
        if r.tokens >= budget_left {
            let (truncated, used) = tokens::truncate(r.result.content_str(), budget_left);
            r.result.content = Some(truncated);
            out.push(r.result);
            budget_left = budget_left.saturating_sub(used);
            continue;
        }
        budget_left -= r.tokens;
        out.push(r.result);
    }
    out
}

fn density(r: &Refined) -> f64 {
    r.result.score.unwrap_or(0) as f64 / r.tokens as f64
}

fn request_time() -> String {
    chrono::Utc::now().to_rfc2822()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refined(url: &str, content: &str, score: u32) -> Refined {
        let mut result = SearchResult::new(url);
        result.content = Some(content.to_string());
        result.score = Some(score);
        Refined {
            tokens: tokens::count(content),
            result,
        }
    }

    #[test]
    fn parses_grade_line_like_the_model_writes_it() {
        assert_eq!(parse_refined_output("7\nbody text"), (7, "body text".to_string()));
        assert_eq!(parse_refined_output("7 - relevant\nbody"), (7, "body".to_string()));
        assert_eq!(parse_refined_output("  3\na\nb"), (3, "a\nb".to_string()));
        // Out-of-range grades clamp into [1, 10].
        assert_eq!(parse_refined_output("12\nx").0, 10);
        assert_eq!(parse_refined_output("0\nx").0, 1);
        assert_eq!(parse_refined_output("-2\nx").0, 1);
        // Unparseable grades default to 0.
        assert_eq!(parse_refined_output("no grade here\nx").0, 0);
        assert_eq!(parse_refined_output("").0, 0);
    }

    #[test]
    fn pack_prefers_higher_value_density() {
        // B is smaller and denser (score/token) than A even though A has the
        // higher absolute score, so B is kept first under a tight budget.
        let a_content = "alpha beta gamma delta ".repeat(300);
        let b_content = "short but relevant note ".repeat(40);
        let a = refined("https://a", &a_content, 8);
        let b = refined("https://b", &b_content, 4);
        assert!(4.0 / b.tokens as f64 > 8.0 / a.tokens as f64);

        let budget = b.tokens + a.tokens / 2;
        let out = pack(vec![a, b], budget);
        assert_eq!(out[0].url, "https://b");
        assert_eq!(out[0].content.as_deref(), Some(b_content.as_str()));
        assert_eq!(out[1].url, "https://a");
        let total: usize = out.iter().map(|r| tokens::count(r.content_str())).sum();
        assert!(total <= budget);
    }

    #[test]
    fn pack_keeps_first_whole_and_truncates_the_next_to_the_remaining_budget() {
        // High-score small result + low-score large result, budget between
        // them: result 1 is kept whole, result 2 is cut to what is left.
        let small = "useful fact. ".repeat(120);
        let large = "filler paragraph with some words. ".repeat(400);
        let r1 = refined("https://one", &small, 9);
        let r2 = refined("https://two", &large, 3);
        let (t1, t2) = (r1.tokens, r2.tokens);
        let budget = t1 + t2 / 2;

        let out = pack(vec![r1, r2], budget);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].url, "https://one");
        assert_eq!(out[0].content.as_deref(), Some(small.as_str()));
        assert_eq!(out[1].url, "https://two");
        let remaining = budget - t1;
        let kept = tokens::count(out[1].content_str());
        assert!(kept <= remaining);
        // Token-boundary truncation may back off a token or two for UTF-8
        // validity, never more.
        assert!(kept >= remaining.saturating_sub(3));
    }

    #[test]
    fn pack_discards_zero_score_and_zero_token_results() {
        let scored = refined("https://keep", &"content words ".repeat(20), 5);
        let unscored = refined("https://drop", &"irrelevant ".repeat(20), 0);
        let empty = refined("https://empty", "", 9);
        let out = pack(vec![unscored, empty, scored], 100_000);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].url, "https://keep");
    }

    #[test]
    fn pack_is_stable_on_equal_density() {
        let content = "identical content block ".repeat(30);
        let first = refined("https://first", &content, 5);
        let second = refined("https://second", &content, 5);
        let out = pack(vec![first, second], 100_000);
        assert_eq!(out[0].url, "https://first");
        assert_eq!(out[1].url, "https://second");
    }

    #[test]
    fn pack_drops_everything_after_the_budget_is_exhausted() {
        let content = "another block of text ".repeat(50);
        let n = tokens::count(&content);
        let r1 = refined("https://a", &content, 9);
        let r2 = refined("https://b", &content, 5);
        let r3 = refined("https://c", &content, 1);
        let out = pack(vec![r1, r2, r3], n + n / 2);
        // r1 whole, r2 truncated to the remainder, r3 dropped.
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].url, "https://a");
        assert_eq!(out[1].url, "https://b");
    }

    #[tokio::test]
    async fn refine_bypasses_when_within_budget() {
        let results = SearchResults {
            query: "foo".to_string(),
            results: vec![{
                let mut r = SearchResult::new("https://a");
                r.content = Some("small content".to_string());
                r
            }],
        };
        // An unroutable client proves no LLM call is attempted: reaching for
        // the network would fail the refine call.
        let client = RefineClient::new(
            reqwest::Client::new(),
            webscout_core::ModelProviderCredentials {
                base_url: "http://127.0.0.1:9".to_string(),
                api_key: "sk-unused".to_string(),
            },
        );
        let out = refine(Some(&client), results.clone()).await.unwrap();
        assert_eq!(out, results);
    }

    #[tokio::test]
    async fn refine_bypasses_when_credentials_are_missing() {
        let big = "word ".repeat(MAX_RESULTS_TOKENS * 2);
        let results = SearchResults {
            query: "foo".to_string(),
            results: vec![{
                let mut r = SearchResult::new("https://a");
                r.content = Some(big);
                r
            }],
        };
        let out = refine(None, results.clone()).await.unwrap();
        assert_eq!(out, results);
    }
}
