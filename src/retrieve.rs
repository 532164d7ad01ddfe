//! Relevance retrieval over the knowledge cache.
//!
//! Scores every cached entry against a live query and greedily assembles
//! the top-scoring content into a context string capped at a character
//! budget. Pure and deterministic: identical entries plus an identical
//! query always produce an identical result.

use crate::models::Entry;

/// Entries with no relevance signal are still surfaced up to this floor,
/// so sparse corpora and empty queries do not return nothing.
const MIN_ENTRIES: usize = 3;

/// Separator between entries in the assembled context.
const SEPARATOR_LEN: usize = 2;

/// Score one entry against a lowercased query.
///
/// Signals, strongest first: the normalized id (underscores become spaces)
/// being a substring of the query or vice versa; exact keyword hits from
/// the entry's `Related terms:` line; partial word overlap with a keyword;
/// individual query tokens appearing anywhere in the content.
fn score_entry(entry: &Entry, query_lower: &str) -> u32 {
    let mut score = 0;
    let id_lower = entry.id.to_lowercase().replace('_', " ");

    if !id_lower.is_empty() && (query_lower.contains(&id_lower) || id_lower.contains(query_lower)) {
        score += 10;
    }

    let content_lower = entry.content.to_lowercase();
    for kw in related_terms(&content_lower) {
        if kw.is_empty() {
            continue;
        }
        if query_lower.contains(kw) {
            score += 5;
        } else if kw
            .split(' ')
            .any(|word| word.len() > 2 && query_lower.contains(word))
        {
            score += 2;
        }
    }

    for word in query_lower.split_whitespace().filter(|w| w.len() > 2) {
        if content_lower.contains(word) {
            score += 1;
        }
    }

    score
}

/// Keywords from a `related terms: a, b, c` line in lowercased content.
fn related_terms(content_lower: &str) -> Vec<&str> {
    content_lower
        .lines()
        .find_map(|line| line.strip_prefix("related terms:"))
        .map(|rest| rest.split(',').map(str::trim).collect())
        .unwrap_or_default()
}

/// Select and concatenate the most relevant entry content for `query`,
/// capped at `budget_chars`.
///
/// Entries are joined with a blank line. Selection stops before an entry
/// that would overflow the budget, except that the single top candidate is
/// always included when nothing fits — returning an oversized entry beats
/// returning nothing. Once [`MIN_ENTRIES`] are in, zero-score candidates
/// are not added.
///
/// Ties rank in store order (stable sort), so the output is a pure
/// function of store contents and query.
pub fn retrieve(entries: &[Entry], query: &str, budget_chars: usize) -> String {
    if entries.is_empty() {
        return String::new();
    }

    let query_lower = query.to_lowercase();

    let mut scored: Vec<(&Entry, u32)> = entries
        .iter()
        .filter(|e| !e.content.is_empty())
        .map(|e| (e, score_entry(e, &query_lower)))
        .collect();
    scored.sort_by(|a, b| b.1.cmp(&a.1));

    let mut selected: Vec<&str> = Vec::new();
    let mut total_chars = 0usize;

    for (entry, score) in scored {
        if score == 0 && selected.len() >= MIN_ENTRIES {
            break;
        }

        let content_len = entry.content.len();
        if total_chars + content_len > budget_chars && !selected.is_empty() {
            break;
        }

        selected.push(&entry.content);
        total_chars += content_len + SEPARATOR_LEN;
    }

    selected.join("\n\n")
}
