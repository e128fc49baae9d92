// src/retrieval/tags.rs
// Lexical tag inference: format/tone/topic/intent tags for queries and
// logged messages, plus verbal-behavior (vb_*) functional tags.

/// Intent tags recognized across retrieval scoring.
pub const INTENT_TAGS: &[&str] = &[
    "intent:explain",
    "intent:instruct",
    "intent:summarize",
    "intent:analyze",
    "intent:compare",
    "intent:reflect",
    "intent:generate",
    "intent:rewrite",
    "intent:evaluate",
];

fn any(t: &str, words: &[&str]) -> bool {
    words.iter().any(|w| t.contains(w))
}

/// Verbal-behavior functional tagging. Assistant-authored text never carries
/// desire or mentalistic-fiction tags.
pub fn infer_vb_tags(text: &str, source: &str) -> Vec<String> {
    let t = text.to_lowercase();
    let mut tags: Vec<String> = Vec::new();

    // Desire / mand-ish
    if any(&t, &["can you", "could you", "please", "i want", "i need", "show me", "help me"]) {
        tags.push("vb_desire:explicit_request".into());
    }

    // Ontology / tact-ish
    if any(&t, &["pattern", "field", "vantage", "identity", "system", "constraint", "fractal"]) {
        tags.push("vb_ontology:high_abstraction".into());
    } else if any(&t, &["thing", "stuff", "that one", "it is like"]) {
        tags.push("vb_ontology:low_abstraction".into());
    }

    // Stance / autoclitic-ish
    if any(&t, &["i think", "maybe", "sort of", "kinda", "possibly"]) {
        tags.push("vb_stance:hedged".into());
    }
    if any(&t, &["clearly", "obviously", "definitely", "for sure"]) {
        tags.push("vb_stance:high_certainty".into());
    }

    // Relation / intraverbal network
    if any(&t, &["because", "so", "therefore", "thus"]) {
        tags.push("vb_relation:causal".into());
    }
    if any(&t, &["but", "however", "yet"]) {
        tags.push("vb_relation:contrast".into());
    }

    // Fiction / mentalism detector
    if any(&t, &["lazy", "unmotivated", "wired this way", "i can't help", "that's just who i am"]) {
        tags.push("vb_fiction:mentalistic_term".into());
    }

    if source != "user" {
        tags.retain(|tag| !tag.starts_with("vb_desire:") && !tag.starts_with("vb_fiction:"));
    }

    tags
}

/// Tag inference for user queries; drives retrieval scoring and gravity
/// misalignment.
pub fn infer_query_tags(text: &str) -> Vec<String> {
    let t = text.to_lowercase();
    let mut tags: Vec<String> = Vec::new();

    // formatting intent
    if any(&t, &["bullet", "bulleted", "outline", "skeleton", "list"]) {
        tags.push("format:skeleton".into());
    }
    if any(&t, &["paragraph", "prose", "story", "narrative"]) {
        tags.push("format:prose".into());
    }

    // meta / design language
    if t.contains("testing memory") || (t.contains("shape") && t.contains("behavior")) || t.contains("rag") {
        tags.push("tone:meta".into());
    }

    // topics
    if any(&t, &["hammer strength", "hammer plate", "workout", "lifting", "gym routine"]) {
        tags.push("topic:workout".into());
    }
    if any(&t, &["fractal monism", "monistic field", "self-deception", "lucifer", "undivided field"]) {
        tags.push("topic:fm".into());
    }
    if any(&t, &["human vantage", "hv axioms", "human vantage axioms"]) {
        tags.push("topic:hv".into());
    }

    // intents
    if any(&t, &["explain", "what is", "why is", "how does", "could you describe"]) {
        tags.push("intent:explain".into());
    }
    if any(&t, &["how do i", "how can i", "show me how", "step by step", "steps", "instructions"]) {
        tags.push("intent:instruct".into());
    }
    if any(&t, &["summary", "summarize", "short version"]) {
        tags.push("intent:summarize".into());
    }
    if any(&t, &["analyze", "analysis", "break down"]) {
        tags.push("intent:analyze".into());
    }
    if any(&t, &["compare", "difference between", "vs."]) {
        tags.push("intent:compare".into());
    }
    if any(&t, &["i feel", "why do i", "help me understand", "reflect on", "what does it mean for me", "in my life"]) {
        tags.push("intent:reflect".into());
    }
    if any(&t, &["write", "create", "make a", "generate", "draft", "compose"]) {
        tags.push("intent:generate".into());
    }
    if any(&t, &["rewrite", "edit this", "make this better"]) {
        tags.push("intent:rewrite".into());
    }
    if any(&t, &["evaluate", "critique", "what do you think of", "rate this"]) {
        tags.push("intent:evaluate".into());
    }

    tags.extend(infer_vb_tags(text, "user"));
    tags
}

/// Tagging for logged chat messages: query tags plus a couple of
/// message-only cues, with vb tags filtered by the author role.
pub fn infer_extra_tags(text: &str, source: &str) -> Vec<String> {
    let t = text.to_lowercase();
    let mut tags: Vec<String> = Vec::new();

    if any(&t, &["bullet", "bulleted", "outline", "skeleton"]) {
        tags.push("format:skeleton".into());
    }
    if any(&t, &["paragraph", "prose", "narrative", "story"]) {
        tags.push("format:prose".into());
    }

    if t.contains("testing memory")
        || t.contains("see how memory")
        || (t.contains("shape") && t.contains("behavior"))
    {
        tags.push("tone:meta".into());
    }
    if t.contains("design") && t.contains("rag") {
        tags.push("tone:design".into());
    }

    if any(&t, &[
        "hammer strength", "hammer plate", "hammer equipment",
        "workout", "lift weights", "lifting weights", "gym routine",
    ]) {
        tags.push("topic:workout".into());
    }
    if any(&t, &[
        "fractal monism", "fm axioms", "fm_", "monistic field",
        "undivided field", "differentiation", "lucifer", "self-deception",
    ]) {
        tags.push("topic:fm".into());
    }
    if any(&t, &["human vantage", "hv axioms", "hv-", "identity is enacted", "agency lives in the next act"]) {
        tags.push("topic:hv".into());
    }

    if any(&t, &["explain", "what is", "why is", "how does", "could you describe"]) {
        tags.push("intent:explain".into());
    }
    if any(&t, &["how do i", "show me how", "step by step", "steps", "instructions"]) {
        tags.push("intent:instruct".into());
    }
    if any(&t, &["summary", "summarize", "short version"]) {
        tags.push("intent:summarize".into());
    }
    if any(&t, &["analyze", "analysis", "break down"]) {
        tags.push("intent:analyze".into());
    }
    if any(&t, &["compare", "difference between", "vs."]) {
        tags.push("intent:compare".into());
    }
    if any(&t, &["i feel", "why do i", "help me understand", "reflect on", "what does it mean for me", "in my life"]) {
        tags.push("intent:reflect".into());
    }
    if any(&t, &["write", "create", "make a", "generate", "draft", "compose"]) {
        tags.push("intent:generate".into());
    }
    if any(&t, &["rewrite", "edit this", "make this better"]) {
        tags.push("intent:rewrite".into());
    }
    if any(&t, &["evaluate", "critique", "what do you think of", "rate this"]) {
        tags.push("intent:evaluate".into());
    }

    tags.extend(infer_vb_tags(text, &normalize_vb_source(source)));
    tags
}

/// Normalize upstream source strings to the roles vb tagging expects.
pub fn normalize_vb_source(source: &str) -> String {
    let s = source.to_lowercase();
    if s == "user" || s.ends_with(":user") || s.contains("chat:user") {
        "user".into()
    } else if s == "assistant" || s.ends_with(":assistant") || s.contains("chat:assistant") {
        "assistant".into()
    } else if s.is_empty() {
        "unknown".into()
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_and_intents() {
        let tags = infer_query_tags("give me a bulleted outline, step by step");
        assert!(tags.contains(&"format:skeleton".to_string()));
        assert!(tags.contains(&"intent:instruct".to_string()));
        assert!(!tags.contains(&"format:prose".to_string()));

        let tags = infer_query_tags("write a short story in flowing prose");
        assert!(tags.contains(&"format:prose".to_string()));
        assert!(tags.contains(&"intent:generate".to_string()));
    }

    #[test]
    fn topics() {
        assert!(infer_query_tags("my gym routine for tomorrow").contains(&"topic:workout".to_string()));
        assert!(infer_query_tags("explain fractal monism").contains(&"topic:fm".to_string()));
        assert!(infer_query_tags("the human vantage axioms").contains(&"topic:hv".to_string()));
    }

    #[test]
    fn assistant_loses_desire_and_fiction_tags() {
        let user = infer_vb_tags("can you help me, i'm just lazy", "user");
        assert!(user.contains(&"vb_desire:explicit_request".to_string()));
        assert!(user.contains(&"vb_fiction:mentalistic_term".to_string()));

        let assistant = infer_vb_tags("can you help me, i'm just lazy", "assistant");
        assert!(!assistant.iter().any(|t| t.starts_with("vb_desire:")));
        assert!(!assistant.iter().any(|t| t.starts_with("vb_fiction:")));
    }

    #[test]
    fn vb_source_normalization() {
        assert_eq!(normalize_vb_source("frontend/chat:user"), "user");
        assert_eq!(normalize_vb_source("frontend/chat:assistant"), "assistant");
        assert_eq!(normalize_vb_source(""), "unknown");
        assert_eq!(normalize_vb_source("memory_card"), "memory_card");
    }

    #[test]
    fn stance_and_relation_tags() {
        let tags = infer_vb_tags("i think it works because the pattern holds, but maybe not", "user");
        assert!(tags.contains(&"vb_stance:hedged".to_string()));
        assert!(tags.contains(&"vb_relation:causal".to_string()));
        assert!(tags.contains(&"vb_relation:contrast".to_string()));
        assert!(tags.contains(&"vb_ontology:high_abstraction".to_string()));
    }
}
