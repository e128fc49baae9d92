// tests/memory_pipeline.rs
// Offline checks for the fact -> card pipeline math: KV extraction, claim
// identity, consolidation scoring, and decay.

use std::collections::BTreeMap;

use serde_json::json;
use vantage::cards::consolidate::{histogram_summary, update_scores};
use vantage::cards::decay::{decay_scores, DecayParams, SignalSums};
use vantage::cards::round3;
use vantage::facts::{claim_canonical_key, parse_kv_facts};

#[test]
fn coffee_and_mood_become_two_attr_claims() {
    let facts = parse_kv_facts("Coffee: yes\nMood: calm", 50);
    assert_eq!(facts.len(), 2);
    assert_eq!(facts[0].predicate, "attr.coffee");
    assert_eq!(facts[0].value, "yes");
    assert_eq!(facts[1].predicate, "attr.mood");
    assert_eq!(facts[1].value, "calm");

    // Each claim gets its own canonical identity under the same subject.
    let doc_entity = 1;
    let k_coffee = claim_canonical_key(
        doc_entity,
        &facts[0].predicate,
        &json!({"type": "str", "v": facts[0].value}),
        &json!({}),
    );
    let k_mood = claim_canonical_key(
        doc_entity,
        &facts[1].predicate,
        &json!({"type": "str", "v": facts[1].value}),
        &json!({}),
    );
    assert_ne!(k_coffee, k_mood);
}

#[test]
fn first_consolidation_yields_baseline_card_scores() {
    // A fresh card starts at 0.5/0.5; one observation moves strength to the
    // 0.50 target and blends confidence toward 0.70.
    let mut counts = BTreeMap::new();
    counts.insert("yes".to_string(), 1i64);

    let (strength, confidence) = update_scores(&counts, 0.5, 0.5, false);
    assert!((strength - 0.50).abs() < 1e-9);
    assert!((confidence - (0.7 * 0.5 + 0.3 * 0.70)).abs() < 1e-9);

    let summary = histogram_summary("pref", "coffee", "yes", &counts);
    assert_eq!(summary, "pref/coffee: yes\nseen: yes×1");
}

#[test]
fn contradiction_inputs_have_distinct_object_values() {
    // "Favorite: red" then "Favorite: blue" produce the same predicate with
    // different canonical keys, which is exactly the condition the scan
    // groups on.
    let red = parse_kv_facts("Favorite: red", 50).remove(0);
    let blue = parse_kv_facts("Favorite: blue", 50).remove(0);
    assert_eq!(red.predicate, blue.predicate);

    let subject = 42;
    let k_red = claim_canonical_key(subject, &red.predicate, &json!({"type": "str", "v": red.value}), &json!({}));
    let k_blue = claim_canonical_key(subject, &blue.predicate, &json!({"type": "str", "v": blue.value}), &json!({}));
    assert_ne!(k_red, k_blue);
}

#[test]
fn forty_five_days_halve_card_strength() {
    let params = DecayParams::default();
    let (strength, _) = decay_scores(0.80, 0.50, 45.0, &params, &SignalSums::default());
    assert!((strength - 0.40).abs() < 1e-9, "strength={strength}");

    // A second pass with zero elapsed time changes nothing.
    let (again, _) = decay_scores(strength, 0.50, 0.0, &params, &SignalSums::default());
    assert_eq!(again, strength);
}

#[test]
fn reinforcement_counteracts_decay() {
    let params = DecayParams::default();
    let quiet = decay_scores(0.60, 0.60, 10.0, &params, &SignalSums::default()).0;
    let rewarded = decay_scores(
        0.60,
        0.60,
        10.0,
        &params,
        &SignalSums { reward: 2.0, punish: 0.0, used: 3.0 },
    )
    .0;
    assert!(rewarded > quiet);

    let punished = decay_scores(
        0.60,
        0.60,
        10.0,
        &params,
        &SignalSums { reward: 0.0, punish: 2.0, used: 0.0 },
    )
    .0;
    assert!(punished < quiet);
}

#[test]
fn repeated_observations_sharpen_the_card() {
    // Ten agreeing observations saturate the strength target and push
    // confidence well above the baseline.
    let mut strength = 0.5;
    let mut confidence = 0.5;
    let mut counts: BTreeMap<String, i64> = BTreeMap::new();
    let mut prev: Option<String> = None;

    for _ in 0..10 {
        *counts.entry("yes".to_string()).or_insert(0) += 1;
        let changed = prev.as_deref().map(|p| p != "yes").unwrap_or(false);
        let (s, c) = update_scores(&counts, strength, confidence, changed);
        strength = s;
        confidence = c;
        prev = Some("yes".to_string());
    }

    assert!(strength > 0.80, "strength={strength}");
    assert!(confidence > 0.85, "confidence={confidence}");

    // A contradicting observation knocks confidence back down.
    *counts.entry("no".to_string()).or_insert(0) += 1;
    let (_, after_flip) = update_scores(&counts, strength, confidence, true);
    assert!(after_flip < confidence);
}

#[test]
fn stored_precision_is_three_decimals() {
    let params = DecayParams::default();
    for days in [0.5, 1.0, 7.0, 30.0, 90.0] {
        let (s, c) = decay_scores(0.777, 0.555, days, &params, &SignalSums::default());
        assert_eq!(s, round3(s));
        assert_eq!(c, round3(c));
        assert!((0.0..=1.0).contains(&s));
        assert!((0.0..=1.0).contains(&c));
    }
}
