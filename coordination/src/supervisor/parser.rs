//! Parses the supervisor model's fixed line-prefixed response format.

use crate::data_model::{Assessment, GoalVerdict, SupervisorAction};

/// Parses a response shaped like:
/// ```text
/// RELEVANT: yes
/// PRODUCTIVE: yes
/// PROGRESSING: no
/// SCORE: 55
/// ACTION: remind
/// REASON: drifted into unrelated refactoring
/// ```
/// Lines may appear in any order and the match on each prefix is
/// case-insensitive; `None` is returned if a required field is missing.
pub fn parse_assessment_response(text: &str) -> Option<Assessment> {
    let mut relevant = None;
    let mut productive = None;
    let mut progressing = None;
    let mut score = None;
    let mut action = None;
    let mut reason = String::new();

    for line in text.lines() {
        let Some((prefix, value)) = line.split_once(':') else { continue };
        let value = value.trim();
        match prefix.trim().to_uppercase().as_str() {
            "RELEVANT" => relevant = parse_bool(value),
            "PRODUCTIVE" => productive = parse_bool(value),
            "PROGRESSING" => progressing = parse_bool(value),
            "SCORE" => score = value.trim_end_matches('%').parse::<u8>().ok(),
            "ACTION" => action = parse_action(value),
            "REASON" => reason = value.to_string(),
            _ => {}
        }
    }

    let action = action?;
    Some(Assessment {
        relevant: relevant.unwrap_or(true),
        productive: productive.unwrap_or(true),
        progressing: progressing.unwrap_or(true),
        score: score.unwrap_or(50).min(100),
        action,
        reason,
        original_action: action,
    })
}

/// Parses a `verify_goal_achieved` reply shaped like:
/// ```text
/// ACHIEVED: yes
/// CONFIDENCE: 85
/// FUNCTIONAL: yes
/// RECOMMENDATION: ship it
/// GAPS: none
/// ```
/// `GAPS` is a comma-separated list, or `none` for an empty list.
pub fn parse_goal_verdict(text: &str) -> Option<GoalVerdict> {
    let mut achieved = None;
    let mut confidence = None;
    let mut functional = None;
    let mut recommendation = String::new();
    let mut gaps = Vec::new();

    for line in text.lines() {
        let Some((prefix, value)) = line.split_once(':') else { continue };
        let value = value.trim();
        match prefix.trim().to_uppercase().as_str() {
            "ACHIEVED" => achieved = parse_bool(value),
            "CONFIDENCE" => confidence = value.trim_end_matches('%').parse::<u8>().ok(),
            "FUNCTIONAL" => functional = parse_bool(value),
            "RECOMMENDATION" => recommendation = value.to_string(),
            "GAPS" => {
                gaps = if value.is_empty() || value.eq_ignore_ascii_case("none") {
                    Vec::new()
                } else {
                    value.split(',').map(|g| g.trim().to_string()).filter(|g| !g.is_empty()).collect()
                }
            }
            _ => {}
        }
    }

    Some(GoalVerdict {
        achieved: achieved?,
        confidence: confidence.unwrap_or(50).min(100),
        functional: functional.unwrap_or(achieved?),
        recommendation,
        gaps,
    })
}

/// Parses a `verify_step_completion` reply's `VERIFIED: yes|no` line.
pub fn parse_step_verification(text: &str) -> Option<bool> {
    text.lines().find_map(|line| {
        let (prefix, value) = line.split_once(':')?;
        if prefix.trim().eq_ignore_ascii_case("VERIFIED") {
            parse_bool(value.trim())
        } else {
            None
        }
    })
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "yes" | "true" => Some(true),
        "no" | "false" => Some(false),
        _ => None,
    }
}

fn parse_action(value: &str) -> Option<SupervisorAction> {
    match value.to_lowercase().as_str() {
        "continue" => Some(SupervisorAction::Continue),
        "remind" => Some(SupervisorAction::Remind),
        "correct" => Some(SupervisorAction::Correct),
        "refocus" => Some(SupervisorAction::Refocus),
        "critical" => Some(SupervisorAction::Critical),
        "abort" => Some(SupervisorAction::Abort),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_response() {
        let text = "RELEVANT: yes\nPRODUCTIVE: yes\nPROGRESSING: no\nSCORE: 55\nACTION: remind\nREASON: drifted";
        let assessment = parse_assessment_response(text).unwrap();
        assert!(assessment.relevant);
        assert!(!assessment.progressing);
        assert_eq!(assessment.score, 55);
        assert_eq!(assessment.action, SupervisorAction::Remind);
        assert_eq!(assessment.reason, "drifted");
    }

    #[test]
    fn missing_action_yields_none() {
        let text = "RELEVANT: yes\nSCORE: 90";
        assert!(parse_assessment_response(text).is_none());
    }

    #[test]
    fn tolerates_reordered_lines_and_whitespace() {
        let text = "  SCORE:  30  \nACTION:   critical\nREASON: stuck in a loop\nRELEVANT: no";
        let assessment = parse_assessment_response(text).unwrap();
        assert_eq!(assessment.score, 30);
        assert_eq!(assessment.action, SupervisorAction::Critical);
        assert!(!assessment.relevant);
    }

    #[test]
    fn parses_goal_verdict_with_gaps() {
        let text = "ACHIEVED: no\nCONFIDENCE: 40\nFUNCTIONAL: no\nRECOMMENDATION: finish the tests\nGAPS: no tests, missing docs";
        let verdict = parse_goal_verdict(text).unwrap();
        assert!(!verdict.achieved);
        assert_eq!(verdict.confidence, 40);
        assert_eq!(verdict.gaps, vec!["no tests", "missing docs"]);
    }

    #[test]
    fn parses_goal_verdict_with_no_gaps() {
        let text = "ACHIEVED: yes\nCONFIDENCE: 95\nFUNCTIONAL: yes\nRECOMMENDATION: ship it\nGAPS: none";
        let verdict = parse_goal_verdict(text).unwrap();
        assert!(verdict.achieved);
        assert!(verdict.gaps.is_empty());
    }

    #[test]
    fn parses_step_verification_flag() {
        assert_eq!(parse_step_verification("VERIFIED: yes\nREASON: evidence checks out"), Some(true));
        assert_eq!(parse_step_verification("VERIFIED: no\nREASON: no evidence given"), Some(false));
        assert_eq!(parse_step_verification("nothing useful here"), None);
    }
}
