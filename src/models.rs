use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::BenchError;

/// Response from the router, one chat completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterResponse {
    /// The generated text
    pub text: String,
    /// Prompt tokens reported by the API (0 when absent upstream)
    pub prompt_tokens: u32,
    /// Completion tokens reported by the API (0 when absent upstream)
    pub completion_tokens: u32,
    /// HTTP status of the successful response
    pub status_code: u16,
    /// Best-effort cost of this call in USD
    pub cost_usd: f64,
}

/// The two-line summary block extracted from a generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    /// What the guest asked the witch for
    pub gewuenscht: String,
    /// What the guest got instead
    pub bekommen: String,
}

/// One generation attempt, persisted as soon as it is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResult {
    /// Candidate model name
    pub model: String,
    /// 1-based attempt index within the run
    pub run: u32,
    /// Extracted summary; None when extraction failed, which skips judging
    pub summary: Option<Summary>,
    /// Full raw response text, kept for audit even without a summary
    pub full_response: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cost_usd: f64,
    /// UTC creation time
    pub timestamp: DateTime<Utc>,
}

/// Judge scoring payload as returned by the judge model, before clamping.
#[derive(Debug, Clone, Deserialize)]
pub struct RawJudgeScore {
    pub phonetische_aehnlichkeit: i64,
    pub anzueglichkeit: i64,
    pub logik: i64,
    pub kreativitaet: i64,
    pub gesamt: i64,
    /// Category to justification text; required
    #[serde(default)]
    pub begruendung: Option<HashMap<String, String>>,
}

/// Validated judge score. Every sub-score lies within its declared bound;
/// `flags` records any clamping that was applied to get there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeScore {
    /// Phonetic similarity of the pun pair, 0..=35
    pub phonetische_aehnlichkeit: i64,
    /// Suggestiveness, 0..=25
    pub anzueglichkeit: i64,
    /// Internal logic, 0..=20
    pub logik: i64,
    /// Creativity, 0..=20
    pub kreativitaet: i64,
    /// Overall score as returned by the judge, 0..=100; never recomputed
    /// from the sub-scores
    pub gesamt: i64,
    /// Category to justification text
    pub begruendung: HashMap<String, String>,
    /// Clamp records, e.g. "logik_clamped_max"
    pub flags: Vec<String>,
}

fn clamp_field(name: &str, value: i64, lower: i64, upper: i64, flags: &mut Vec<String>) -> i64 {
    if value < lower {
        flags.push(format!("{name}_clamped_min"));
        lower
    } else if value > upper {
        flags.push(format!("{name}_clamped_max"));
        upper
    } else {
        value
    }
}

impl RawJudgeScore {
    /// Clamp out-of-range sub-scores to their bounds, recording a flag per
    /// clamped field. Leniency toward an unreliable judge, not validation.
    /// Fails only when the justification mapping is absent.
    pub fn clamped(self) -> Result<JudgeScore, BenchError> {
        let begruendung = self.begruendung.ok_or(BenchError::MissingJustification)?;

        let mut flags = Vec::new();
        let phonetische_aehnlichkeit = clamp_field(
            "phonetische_aehnlichkeit",
            self.phonetische_aehnlichkeit,
            0,
            35,
            &mut flags,
        );
        let anzueglichkeit = clamp_field("anzueglichkeit", self.anzueglichkeit, 0, 25, &mut flags);
        let logik = clamp_field("logik", self.logik, 0, 20, &mut flags);
        let kreativitaet = clamp_field("kreativitaet", self.kreativitaet, 0, 20, &mut flags);
        let gesamt = clamp_field("gesamt", self.gesamt, 0, 100, &mut flags);

        Ok(JudgeScore {
            phonetische_aehnlichkeit,
            anzueglichkeit,
            logik,
            kreativitaet,
            gesamt,
            begruendung,
            flags,
        })
    }
}

/// One generation paired with its judge score; the unit of durable storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkRecord {
    pub generation: GenerationResult,
    pub judge: JudgeScore,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_score(
        phonetik: i64,
        anzueglichkeit: i64,
        logik: i64,
        kreativitaet: i64,
        gesamt: i64,
    ) -> RawJudgeScore {
        let mut begruendung = HashMap::new();
        begruendung.insert("logik".to_string(), "schluessig".to_string());
        RawJudgeScore {
            phonetische_aehnlichkeit: phonetik,
            anzueglichkeit,
            logik,
            kreativitaet,
            gesamt,
            begruendung: Some(begruendung),
        }
    }

    #[test]
    fn test_in_range_scores_unchanged_without_flags() {
        let score = raw_score(30, 20, 15, 10, 75).clamped().unwrap();
        assert_eq!(score.phonetische_aehnlichkeit, 30);
        assert_eq!(score.anzueglichkeit, 20);
        assert_eq!(score.logik, 15);
        assert_eq!(score.kreativitaet, 10);
        assert_eq!(score.gesamt, 75);
        assert!(score.flags.is_empty());
    }

    #[test]
    fn test_scores_above_bound_clamp_to_max() {
        let score = raw_score(40, 30, 25, 25, 120).clamped().unwrap();
        assert_eq!(score.phonetische_aehnlichkeit, 35);
        assert_eq!(score.anzueglichkeit, 25);
        assert_eq!(score.logik, 20);
        assert_eq!(score.kreativitaet, 20);
        assert_eq!(score.gesamt, 100);
        assert_eq!(
            score.flags,
            vec![
                "phonetische_aehnlichkeit_clamped_max",
                "anzueglichkeit_clamped_max",
                "logik_clamped_max",
                "kreativitaet_clamped_max",
                "gesamt_clamped_max",
            ]
        );
    }

    #[test]
    fn test_scores_below_bound_clamp_to_min() {
        let score = raw_score(-5, 10, 10, 10, 50).clamped().unwrap();
        assert_eq!(score.phonetische_aehnlichkeit, 0);
        assert_eq!(score.flags, vec!["phonetische_aehnlichkeit_clamped_min"]);
    }

    #[test]
    fn test_boundary_values_are_not_flagged() {
        let score = raw_score(35, 0, 20, 0, 100).clamped().unwrap();
        assert_eq!(score.phonetische_aehnlichkeit, 35);
        assert_eq!(score.gesamt, 100);
        assert!(score.flags.is_empty());
    }

    #[test]
    fn test_gesamt_is_kept_not_recomputed() {
        // 30+20+15+10 = 75, but the judge said 60; 60 must survive.
        let score = raw_score(30, 20, 15, 10, 60).clamped().unwrap();
        assert_eq!(score.gesamt, 60);
    }

    #[test]
    fn test_missing_begruendung_fails() {
        let raw = RawJudgeScore {
            phonetische_aehnlichkeit: 10,
            anzueglichkeit: 10,
            logik: 10,
            kreativitaet: 10,
            gesamt: 40,
            begruendung: None,
        };
        assert!(matches!(
            raw.clamped(),
            Err(BenchError::MissingJustification)
        ));
    }

    #[test]
    fn test_generation_result_round_trips_without_summary() {
        let result = GenerationResult {
            model: "test/model".to_string(),
            run: 1,
            summary: None,
            full_response: "kein Block".to_string(),
            prompt_tokens: 10,
            completion_tokens: 5,
            cost_usd: 0.0,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&result).unwrap();
        let back: GenerationResult = serde_json::from_str(&json).unwrap();
        assert!(back.summary.is_none());
        assert_eq!(back.full_response, "kein Block");
    }
}
