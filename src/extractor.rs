use regex::Regex;
use std::sync::LazyLock;
use tracing::debug;

use crate::models::Summary;

/// Raised when the summary block could not be extracted.
#[derive(Debug, thiserror::Error)]
#[error("summary parse error: {0}")]
pub struct SummaryParseError(pub String);

static SUMMARY_HEADER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*###\s*ZUSAMMENFASSUNG\s*$").unwrap());

static LINE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-\s*([A-Za-zÄÖÜäöüß]+):\s*(.+)$").unwrap());

const LABEL_GEWUENSCHT: &str = "gewuenscht";
const LABEL_BEKOMMEN: &str = "bekommen";

/// Minimum normalized Levenshtein similarity for a label to count as one of
/// the canonical labels. Absorbs LLM typos like "Bekomnen".
const LABEL_SIMILARITY_THRESHOLD: f64 = 0.8;

fn normalise_label(label: &str) -> String {
    let lower = label.trim().to_lowercase();
    for required in [LABEL_GEWUENSCHT, LABEL_BEKOMMEN] {
        if strsim::normalized_levenshtein(&lower, required) >= LABEL_SIMILARITY_THRESHOLD {
            return required.to_string();
        }
    }
    lower
}

/// Extract the required two-line summary block from a generation.
///
/// The text must contain a `### ZUSAMMENFASSUNG` heading on its own line,
/// followed by `- Gewünscht: ...` and `- Bekommen: ...` entries with
/// non-empty values. All-or-nothing: no partial summaries are returned.
pub fn extract_summary(llm_response: &str) -> Result<Summary, SummaryParseError> {
    let header = SUMMARY_HEADER_PATTERN
        .find(llm_response)
        .ok_or_else(|| SummaryParseError("summary header missing".to_string()))?;

    let after_header = &llm_response[header.end()..];
    let mut gewuenscht: Option<String> = None;
    let mut bekommen: Option<String> = None;

    for line in after_header.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Some(captures) = LINE_PATTERN.captures(line) else {
            // A non-entry line ends the block once entries have started.
            if gewuenscht.is_some() || bekommen.is_some() {
                break;
            }
            continue;
        };

        let label = normalise_label(&captures[1]);
        let value = captures[2].trim();
        if label == LABEL_GEWUENSCHT || label == LABEL_BEKOMMEN {
            if value.is_empty() {
                return Err(SummaryParseError(format!("value for {label} missing")));
            }
            if label == LABEL_GEWUENSCHT {
                gewuenscht = Some(value.to_string());
            } else {
                bekommen = Some(value.to_string());
            }
        }
        if gewuenscht.is_some() && bekommen.is_some() {
            break;
        }
    }

    match (gewuenscht, bekommen) {
        (Some(gewuenscht), Some(bekommen)) => {
            debug!(target: "extractor", "summary extracted");
            Ok(Summary {
                gewuenscht,
                bekommen,
            })
        }
        (gewuenscht, bekommen) => {
            let mut missing = Vec::new();
            if gewuenscht.is_none() {
                missing.push(LABEL_GEWUENSCHT);
            }
            if bekommen.is_none() {
                missing.push(LABEL_BEKOMMEN);
            }
            Err(SummaryParseError(format!(
                "summary labels missing: {}",
                missing.join(", ")
            )))
        }
    }
}
