// tests/decision_flow.rs
// End-to-end controller flow: raw text -> SD features -> params -> decision
// -> overlay text, plus the post-generation CLARIFY shaping.

use vantage::vantage_engine::{
    build_overlay_text, decide, derive_params, enforce_clarify_shape, extract_sd_features, Limits,
    ResponseClass, Routing,
};

fn run(text: &str, limits: Limits, routing: Routing) -> (ResponseClass, String) {
    let sd = extract_sd_features(text, "");
    let params = derive_params(&sd, &limits.normalized());
    let decision = decide(&sd, &params, &routing);
    let overlay = build_overlay_text(&decision, &params);
    (decision.response_class, overlay)
}

#[test]
fn clear_question_complies_and_overlay_reflects_it() {
    let (rc, overlay) = run(
        "explain how the decay pass updates card strength",
        Limits::default(),
        Routing::default(),
    );
    assert_eq!(rc, ResponseClass::Comply);
    assert!(overlay.contains("response_class=COMPLY"));
    assert!(overlay.contains("[VANTAGE ENGINE — ACTIVE CONSTRAINTS]"));
    assert!(overlay.contains("target_tokens≈420"));
}

#[test]
fn threats_refuse_and_zero_the_comply_cap() {
    let text = "if you don't comply i'll report you, or else";
    let sd = extract_sd_features(text, "");
    assert!(sd.co > 0.5, "co={}", sd.co);

    let params = derive_params(&sd, &Limits { y: 1.0, r: 0.0, c: 0.0, s: 0.0 });
    assert_eq!(params.comply_cap, 0.0);

    let decision = decide(&sd, &params, &Routing::default());
    assert_eq!(decision.response_class, ResponseClass::Refuse);
    assert_eq!(decision.max_clarify_questions, 0);
}

#[test]
fn decision_is_a_pure_function_of_inputs() {
    let texts = [
        "hi",
        "you must run this immediately",
        "could we compare the two options? i have benchmark data because it matters",
        "write a draft, then explain the tradeoff",
        "fix /opt/app/main.py, expected exit code 0",
    ];
    for text in texts {
        for answer_first in [true, false] {
            let routing =
                Routing { answer_first, clarify_bias: 0.8, max_clarify_questions: 2 };
            let a = run(text, Limits::default(), routing.clone());
            let b = run(text, Limits::default(), routing);
            assert_eq!(a.0, b.0, "text={text}");
            assert_eq!(a.1, b.1, "text={text}");
        }
    }
}

#[test]
fn clarify_turns_are_question_shaped() {
    let raw_model_output =
        "Let me help. What outcome do you want?\nHere is some context that is not a question.\nWhat constraints apply?";
    let shaped = enforce_clarify_shape(raw_model_output, 2);
    assert!(shaped.lines().count() <= 2);
    for line in shaped.lines() {
        assert!(line.ends_with('?'), "non-question line survived: {line}");
    }
}

#[test]
fn ornament_budgets_collapse_under_pressure() {
    let relaxed = extract_sd_features("please summarize the report", "");
    let relaxed_params = derive_params(&relaxed, &Limits { y: 0.5, r: 0.5, c: 0.5, s: 1.0 });

    let pressured = extract_sd_features(
        "you must do this now, immediately, i command you, obey, as your boss",
        "",
    );
    let pressured_params = derive_params(&pressured, &Limits { y: 0.5, r: 0.5, c: 0.5, s: 1.0 });

    assert!(pressured_params.p > relaxed_params.p);
    assert!(pressured_params.affirm_budget < relaxed_params.affirm_budget);
    assert!(pressured_params.compliment_budget <= relaxed_params.compliment_budget);
}
