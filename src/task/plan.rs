//! Markdown plan parsing.
//!
//! Turns a hand-written plan into the ordered task descriptions of a new
//! session. Checkbox items (`- [ ] ...`), plain bullets and numbered items
//! each become one task; headings and prose are ignored. Items already
//! checked off are skipped.

use regex::Regex;
use std::sync::OnceLock;

fn item_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(?:[-*+]|\d+[.)])\s+(?:\[(?P<mark>[ xX])\]\s+)?(?P<text>\S.*)$")
            .expect("plan item regex is valid")
    })
}

/// Extract task descriptions from a markdown plan, in document order.
#[must_use]
pub fn parse_plan(content: &str) -> Vec<String> {
    let mut in_fence = false;
    let mut tasks = Vec::new();

    for line in content.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        let Some(caps) = item_regex().captures(line) else {
            continue;
        };
        let checked = caps
            .name("mark")
            .is_some_and(|m| m.as_str().eq_ignore_ascii_case("x"));
        if checked {
            continue;
        }
        let text = caps["text"].trim();
        if !text.is_empty() {
            tasks.push(text.to_string());
        }
    }

    tasks
}
