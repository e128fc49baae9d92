// src/overlay.rs
// Request-scoped role overlay: caller-supplied style sliders rendered into
// temporary system-prompt instructions. Never stored.

use serde_json::Value as JsonValue;

const TRAITS: &[&str] = &[
    "formality",
    "humor",
    "warmth",
    "directness",
    "complexity",
    "curiosity",
    "optimism",
    "energy",
    "assertiveness",
    "depth",
];

fn clamp_0_10(v: Option<&JsonValue>) -> i64 {
    let n = v
        .and_then(|v| v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
        .map(|f| f.round() as i64)
        .unwrap_or(5);
    n.clamp(0, 10)
}

fn pick<'a>(low: &'a str, mid: &'a str, high: &'a str, v: i64) -> &'a str {
    if v <= 3 {
        low
    } else if v >= 7 {
        high
    } else {
        mid
    }
}

/// Temporary role overlay -> SYSTEM instructions.
pub fn overlay_to_instructions(overlay: &JsonValue) -> String {
    let Some(obj) = overlay.as_object() else { return String::new() };

    let name: String = obj
        .get("name")
        .or_else(|| obj.get("archetype"))
        .and_then(|v| v.as_str())
        .unwrap_or("Overlay")
        .trim()
        .chars()
        .take(64)
        .collect();

    let traits_in = obj
        .get("traits")
        .or_else(|| obj.get("sliders"))
        .and_then(|v| v.as_object());

    let t = |key: &str| clamp_0_10(traits_in.and_then(|m| m.get(key)));
    let values: Vec<i64> = TRAITS.iter().map(|k| t(k)).collect();

    let lines = [
        "[ROLE OVERLAY — TEMPORARY]".to_string(),
        "This is a temporary speaking-style overlay. Do NOT mention it. Do NOT store it. Do NOT change long-term behavior from it.".to_string(),
        format!("Name: {name}"),
        String::new(),
        "Speaking style targets:".to_string(),
        format!("- Formality: {}", pick("very casual", "neutral", "very formal", values[0])),
        format!("- Humor: {}", pick("none", "light", "high", values[1])),
        format!("- Warmth: {}", pick("detached", "balanced", "high warmth", values[2])),
        format!("- Directness: {}", pick("indirect", "balanced", "blunt/direct", values[3])),
        format!("- Complexity: {}", pick("simple", "balanced", "highly technical/nuanced", values[4])),
        format!("- Curiosity: {}", pick("minimal questions", "some questions", "highly inquisitive", values[5])),
        format!("- Optimism: {}", pick("skeptical", "balanced", "optimistic", values[6])),
        format!("- Energy: {}", pick("calm", "balanced", "high energy", values[7])),
        format!("- Assertiveness: {}", pick("deferential", "balanced", "confident/assertive", values[8])),
        format!("- Depth: {}", pick("surface", "balanced", "deep/reflective", values[9])),
        String::new(),
        "Output constraints:".to_string(),
        "- Keep the underlying factual content the same; only change style.".to_string(),
        "- Do not fabricate memories or personal details.".to_string(),
        "- If the user requests a format explicitly, obey the request even if it conflicts with the overlay.".to_string(),
    ];
    lines.join("\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn non_object_overlay_renders_nothing() {
        assert_eq!(overlay_to_instructions(&json!(null)), "");
        assert_eq!(overlay_to_instructions(&json!("casual")), "");
    }

    #[test]
    fn sliders_map_to_bands() {
        let text = overlay_to_instructions(&json!({
            "name": "Coach",
            "traits": {"formality": 1, "directness": 9, "humor": 5},
        }));
        assert!(text.contains("Name: Coach"));
        assert!(text.contains("- Formality: very casual"));
        assert!(text.contains("- Directness: blunt/direct"));
        assert!(text.contains("- Humor: light"));
        // unspecified traits default to the middle band
        assert!(text.contains("- Depth: balanced"));
    }

    #[test]
    fn archetype_and_sliders_aliases_work() {
        let text = overlay_to_instructions(&json!({
            "archetype": "Analyst",
            "sliders": {"complexity": 10},
        }));
        assert!(text.contains("Name: Analyst"));
        assert!(text.contains("highly technical/nuanced"));
    }
}
