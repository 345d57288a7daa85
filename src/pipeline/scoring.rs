//! Scoring contract: prompt construction, strict parsing and the retry
//! loop around the scoring engine.
//!
//! Engine numerics are never trusted: scores are clamped, the overall is
//! recomputed from the weighted criteria whenever the engine strays, and
//! any repair marks the card partial. Every degradation path collapses to
//! `None`, which the orchestrator treats as "no analysis" rather than a
//! job failure.

use std::time::Duration;

use tracing::{error, info, warn};

use crate::engines::CallScorer;
use crate::store::ScoreQuote;

pub const MAX_ATTEMPTS: usize = 3;
pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(2);

/// Engine overall may drift this far from the weighted mean before the
/// recomputed value replaces it.
const OVERALL_TOLERANCE: i64 = 5;

pub const SYSTEM_PROMPT: &str = "You are a quality assurance expert for a contact center.\n\
Rate the operator on three criteria (0-100):\n\
1. standard - protocol compliance (greeting, introduction, clarifying the problem, farewell)\n\
2. loyalty - client focus (solving the problem, retention, handling objections)\n\
3. kindness - tone of voice (politeness, empathy, calmness)\n\
\n\
Return ONLY JSON, no commentary, in the format:\n\
{\n\
  \"standard\": <0-100>,\n\
  \"loyalty\": <0-100>,\n\
  \"kindness\": <0-100>,\n\
  \"overall\": <weighted mean: standard*0.4 + loyalty*0.3 + kindness*0.3>,\n\
  \"summary\": \"<2-3 sentences about the operator's performance>\",\n\
  \"quotes\": [\n\
    {\"text\": \"<quote>\", \"criterion\": \"<standard|loyalty|kindness>\", \"sentiment\": \"<positive|negative|neutral>\"}\n\
  ]\n\
}\n\
Provide 2-5 quotes. No text outside the JSON.";

pub const STRICT_SUFFIX: &str =
    "\n\nRESPOND WITH STRICT JSON. No Markdown, no ```json fences. Braces only.";

/// Validated scorecard ready for persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreCard {
    pub standard: i32,
    pub loyalty: i32,
    pub kindness: i32,
    pub overall: i32,
    pub summary: String,
    pub quotes: Vec<ScoreQuote>,
    pub partial: bool,
}

pub fn build_user_message(operator_text: &str, client_context: &str) -> String {
    let mut message = format!("=== Operator utterances ===\n{}", operator_text.trim());
    if !client_context.trim().is_empty() {
        message.push_str(&format!(
            "\n\n=== Client context (for situational understanding) ===\n{}",
            client_context.trim()
        ));
    }
    message
}

pub fn weighted_overall(standard: i32, loyalty: i32, kindness: i32) -> i32 {
    (standard as f64 * 0.4 + loyalty as f64 * 0.3 + kindness as f64 * 0.3).round() as i32
}

/// Drop leading/trailing fenced code marks the model may wrap its JSON in.
fn strip_code_fences(raw: &str) -> String {
    let trimmed = raw.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    trimmed
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

fn numeric_field(value: &serde_json::Value) -> Option<i64> {
    if let Some(n) = value.as_i64() {
        return Some(n);
    }
    if let Some(f) = value.as_f64() {
        return Some(f as i64);
    }
    value.as_str().and_then(|s| s.trim().parse::<i64>().ok())
}

/// Parse the engine's response into a [`ScoreCard`].
///
/// Returns None when the response is unparseable or missing required
/// fields; clamping, quote filtering and an empty summary only mark the
/// card partial.
pub fn parse_scorecard(raw: &str) -> Option<ScoreCard> {
    let text = strip_code_fences(raw);
    let data: serde_json::Value = match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(e) => {
            warn!("scorecard JSON parse error: {} | raw={:.200}", e, raw);
            return None;
        }
    };
    let object = data.as_object()?;

    let mut partial = false;
    let mut scores = [0i64; 4];
    for (slot, field) in ["standard", "loyalty", "kindness", "overall"].iter().enumerate() {
        let value = object.get(*field)?;
        let mut n = match numeric_field(value) {
            Some(n) => n,
            None => {
                warn!("scorecard field {} is not numeric: {}", field, value);
                return None;
            }
        };
        if !(0..=100).contains(&n) {
            warn!("scorecard anomaly: {}={} out of range, clamping", field, n);
            n = n.clamp(0, 100);
            partial = true;
        }
        scores[slot] = n;
    }

    let summary = object
        .get("summary")?
        .as_str()
        .unwrap_or_default()
        .trim()
        .to_string();
    if summary.is_empty() {
        warn!("scorecard has an empty summary");
        partial = true;
    }

    let mut quotes: Vec<ScoreQuote> = Vec::new();
    match object.get("quotes") {
        None => {}
        Some(serde_json::Value::Array(items)) => {
            for item in items {
                let Some(quote) = item.as_object() else {
                    continue;
                };
                let (Some(text), Some(criterion)) = (quote.get("text"), quote.get("criterion"))
                else {
                    continue;
                };
                quotes.push(ScoreQuote {
                    text: text.as_str().unwrap_or_default().to_string(),
                    criterion: criterion.as_str().unwrap_or_default().to_string(),
                    sentiment: quote
                        .get("sentiment")
                        .and_then(|s| s.as_str())
                        .unwrap_or("neutral")
                        .to_string(),
                });
            }
        }
        Some(_) => {
            partial = true;
        }
    }

    let [standard, loyalty, kindness, mut overall] = scores;
    let expected = weighted_overall(standard as i32, loyalty as i32, kindness as i32) as i64;
    if (overall - expected).abs() > OVERALL_TOLERANCE {
        info!(
            "scorecard overall={} differs from computed={}, using computed",
            overall, expected
        );
        overall = expected;
    }

    Some(ScoreCard {
        standard: standard as i32,
        loyalty: loyalty as i32,
        kindness: kindness as i32,
        overall: overall as i32,
        summary,
        quotes,
        partial,
    })
}

/// Run the scoring engine with retry and graceful degradation.
///
/// Up to [`MAX_ATTEMPTS`] calls with exponential backoff on engine errors
/// (2 s, 4 s); after the first attempt the strict-JSON prompt variant is
/// used. Returns None when the engine is unavailable, the operator said
/// nothing, or every attempt fails.
pub async fn run_scoring(
    scorer: &dyn CallScorer,
    operator_text: &str,
    client_context: &str,
) -> Option<ScoreCard> {
    if !scorer.is_available() {
        warn!("scoring engine credential not configured, analysis unavailable");
        return None;
    }
    if operator_text.trim().is_empty() {
        warn!("operator text is empty, skipping analysis");
        return None;
    }

    let user_message = build_user_message(operator_text, client_context);
    let strict_prompt = format!("{}{}", SYSTEM_PROMPT, STRICT_SUFFIX);

    for attempt in 1..=MAX_ATTEMPTS {
        let system_prompt = if attempt > 1 {
            strict_prompt.as_str()
        } else {
            SYSTEM_PROMPT
        };
        match scorer.score(system_prompt, &user_message).await {
            Ok(raw) => {
                if let Some(card) = parse_scorecard(&raw) {
                    info!("scoring done on attempt {}", attempt);
                    return Some(card);
                }
                warn!("scoring attempt {}: invalid response, retrying", attempt);
            }
            Err(e) => {
                if attempt < MAX_ATTEMPTS {
                    let delay = RETRY_BASE_DELAY * 2u32.pow(attempt as u32 - 1);
                    warn!(
                        "scoring attempt {}/{} failed ({}), retrying in {:?}",
                        attempt, MAX_ATTEMPTS, e, delay
                    );
                    tokio::time::sleep(delay).await;
                } else {
                    error!(
                        "scoring failed after {} attempts ({}), continuing without analysis",
                        MAX_ATTEMPTS, e
                    );
                }
            }
        }
    }
    None
}
