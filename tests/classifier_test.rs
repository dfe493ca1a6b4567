//! Tests for first-match-wins line classification.

use chrono::TimeDelta;

use runwatch::classifier::{Classifier, PatternRule};
use runwatch::config::PatternConfig;

fn classifier(patterns: &[&str]) -> Classifier {
    let rules = patterns
        .iter()
        .map(|p| PatternRule::new(p, None).expect("compile"))
        .collect();
    Classifier::new(rules)
}

#[test]
fn earliest_matching_rule_wins() {
    let c = classifier(&["disk", "ERROR"]);
    let rule = c.classify("ERROR disk full").expect("match");
    assert_eq!(rule.key(), "disk");

    let reversed = classifier(&["ERROR", "disk"]);
    assert_eq!(reversed.classify("ERROR disk full").expect("match").key(), "ERROR");
}

#[test]
fn matching_is_substring_search() {
    let c = classifier(&["ERROR"]);
    assert!(c.classify("[2026-10-16] lvl=ERROR msg=boom").is_some());
    assert!(c.classify("all good").is_none());
}

#[test]
fn anchored_patterns_respect_anchors() {
    let c = classifier(&["^ERROR"]);
    assert!(c.classify("ERROR at start").is_some());
    assert!(c.classify("late ERROR").is_none());
}

#[test]
fn empty_classifier_never_matches() {
    let c = Classifier::default();
    assert!(c.classify("ERROR").is_none());
}

#[test]
fn from_config_keeps_order_and_cooldowns() {
    let patterns: Vec<PatternConfig> = serde_json::from_str(
        r#"[{"pattern":"a+","timeoutMinutes":2},"b",{"pattern":"c","timeoutMinutes":0}]"#,
    )
    .expect("parse patterns");
    let c = Classifier::from_config(&patterns).expect("compile");

    let keys: Vec<&str> = c.rules().iter().map(|r| r.key()).collect();
    assert_eq!(keys, vec!["a+", "b", "c"]);
    assert_eq!(c.rules()[0].cooldown(), Some(TimeDelta::minutes(2)));
    assert_eq!(c.rules()[1].cooldown(), None);
    assert!(c.rules()[2].cooldown().is_some_and(|d| d > TimeDelta::days(365)));
}

#[test]
fn invalid_pattern_fails_to_compile() {
    assert!(PatternRule::new("(", None).is_err());
}
