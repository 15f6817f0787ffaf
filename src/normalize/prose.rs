//! Last-resort readers for responses that contain no usable JSON.

use crate::subject::normalize_name;
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

/// Most names pulled out of prose.
pub const MAX_PROSE_NAMES: usize = 6;

static NEGATIVE_RESULT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?i)\b(?:couldn[’']?t|could not|can[’']?t|cannot|unable to|did not|didn[’']?t|wasn[’']?t able to)\s+",
        r"(?:find|locate|identify|come up with|retrieve)\b",
        r"|\bno\s+(?:recent\s+|new\s+|relevant\s+|notable\s+|known\s+)?",
        r"(?:results|releases|recommendations|information|data|matches|influences)\s+(?:were\s+|was\s+)?(?:found|available)\b",
        r"|\bnothing\s+(?:was\s+)?(?:found|available)\b",
        r"|\bnot aware of any\b",
    ))
    .expect("valid regex")
});

/// Phrases that introduce artist names; the name list follows the match.
static LEAD_IN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?i)\b(?:recommends?|recommended|recommend checking out|suggests?|suggested|check out|",
        r"listen to|give .{1,20}? a try|influenced by|inspired by|drew on|draws on|",
        r"fans of .{1,60}? (?:will|might|would|should) (?:enjoy|like|love)|such as|similar to)\s+",
    ))
    .expect("valid regex")
});

/// One capitalized name of up to six words; lowercase joiners allowed inside.
static NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[\x22“*_]*([\p{Lu}0-9][\w'’&.\-]*(?:\s+(?:[\p{Lu}0-9][\w'’&.\-]*|of|the|and|&|de|la|y|von|van)){0,5})",
    )
    .expect("valid regex")
});

/// Markdown bullet or numbered line whose text starts with a name.
static LIST_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:[-*•]|\d+[.)])\s+(.+)$").expect("valid regex")
});

const STOP_WORDS: [&str; 16] = [
    "I", "You", "We", "They", "It", "This", "These", "That", "Some", "Their", "His", "Her",
    "Also", "More", "Other", "Here",
];

const TRAILING_JOINERS: [&str; 9] = ["of", "the", "and", "&", "de", "la", "y", "von", "van"];

/// True when the text says plainly that nothing was found.
pub fn is_negative_result(text: &str) -> bool {
    NEGATIVE_RESULT.is_match(text)
}

/// Pull artist-like names out of free text, deduplicated and capped.
pub fn extract_names(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut names = Vec::new();
    let mut push = |name: String, names: &mut Vec<String>| {
        if names.len() < MAX_PROSE_NAMES && seen.insert(normalize_name(&name)) {
            names.push(name);
        }
    };

    for lead in LEAD_IN.find_iter(text) {
        let tail = clause_after(text, lead.end());
        for segment in split_list(tail) {
            if let Some(name) = leading_name(segment) {
                push(name, &mut names);
            }
        }
    }

    for caps in LIST_LINE.captures_iter(text) {
        if let Some(name) = caps.get(1).and_then(|m| leading_name(m.as_str())) {
            push(name, &mut names);
        }
    }

    names
}

/// Text from `from` to the end of its sentence or line.
fn clause_after(text: &str, from: usize) -> &str {
    let rest = &text[from..];
    let end = rest
        .char_indices()
        .find(|&(i, c)| {
            c == '\n' || c == ';' || c == '!' || c == '?' || (c == '.' && is_sentence_end(rest, i))
        })
        .map(|(i, _)| i)
        .unwrap_or(rest.len());
    &rest[..end]
}

/// A period ends a sentence when followed by whitespace or the end of text;
/// `R.E.M.`-style dots are kept.
fn is_sentence_end(rest: &str, dot: usize) -> bool {
    let next = rest[dot + 1..].chars().next();
    let prev_is_initial = rest[..dot]
        .chars()
        .rev()
        .nth(1)
        .map(|c| c == '.')
        .unwrap_or(false);
    matches!(next, None | Some(' ') | Some('\n') | Some('\t')) && !prev_is_initial
}

fn split_list(clause: &str) -> impl Iterator<Item = &str> {
    clause
        .split(',')
        .flat_map(|part| part.split(" and "))
        .flat_map(|part| part.split(" or "))
        .map(|part| part.trim().trim_start_matches("and ").trim())
        .filter(|part| !part.is_empty())
}

fn leading_name(segment: &str) -> Option<String> {
    let caps = NAME.captures(segment.trim())?;
    let mut words: Vec<&str> = caps.get(1)?.as_str().split_whitespace().collect();
    while words
        .last()
        .is_some_and(|w| TRAILING_JOINERS.contains(&w.to_ascii_lowercase().as_str()))
    {
        words.pop();
    }
    let first = *words.first()?;
    if STOP_WORDS.contains(&first) {
        return None;
    }
    let name = words
        .join(" ")
        .trim_end_matches(['.', '\'', '’'])
        .to_string();
    (name.chars().count() >= 2).then_some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_negative_phrasing() {
        assert!(is_negative_result("I couldn't find anything recent."));
        assert!(is_negative_result("Sorry, no recent releases were found for this artist."));
        assert!(is_negative_result("Nothing found."));
        assert!(!is_negative_result("You might enjoy Opeth and Riverside."));
    }

    #[test]
    fn extracts_names_after_lead_ins() {
        let text = "If you like Steven Wilson, I recommend Opeth, Riverside and Anathema. \
                    His sound was influenced by Pink Floyd.";
        assert_eq!(
            extract_names(text),
            vec!["Opeth", "Riverside", "Anathema", "Pink Floyd"]
        );
    }

    #[test]
    fn keeps_initialisms_and_joiners() {
        let text = "Fans of jangle pop will enjoy R.E.M. and Echo and the Bunnymen.";
        let names = extract_names(text);
        assert!(names.contains(&"R.E.M".to_string()) || names.contains(&"R.E.M.".to_string()));
    }

    #[test]
    fn reads_bullet_lists() {
        let text = "Here are a few:\n- **Talk Talk**: late-period art rock\n2. Mark Hollis (solo)\n";
        let names = extract_names(text);
        assert_eq!(names, vec!["Talk Talk", "Mark Hollis"]);
    }

    #[test]
    fn deduplicates_and_caps() {
        let text = "Check out Low. Check out low. Listen to A1, B2, C3, D4, E5, F6, G7.";
        let names = extract_names(text);
        assert_eq!(names.len(), MAX_PROSE_NAMES);
        assert_eq!(names[0], "Low");
        assert_eq!(names.iter().filter(|n| n.eq_ignore_ascii_case("low")).count(), 1);
    }

    #[test]
    fn ignores_pronouns() {
        assert!(extract_names("I suggest you try something else.").is_empty());
    }
}
