//! Fuzzy "same talk" decisions over normalized titles.
//!
//! Everything here is pure so the planner can be tested without fixtures.
//! Scores are in `0.0..=1.0`; the decision threshold lives in [`MatchConfig`].

use crate::config::MatchConfig;
use crate::title::normalize_title;
use std::collections::BTreeSet;

/// Similarity of two *already normalized* titles.
///
/// Exact equality scores `1.0`. Otherwise the score is the best of:
/// - the matching-characters ratio `2 * M / T` (`M` = longest common
///   subsequence, `T` = combined length), which absorbs plural and suffix
///   drift such as "ceremony" vs "ceremonies";
/// - the normalized Levenshtein ratio;
/// - token containment: `1.0` when every token of the shorter title appears in
///   the longer one and the shorter has at least
///   [`MatchConfig::min_containment_tokens`] tokens (appended subtitles or
///   edit notes).
///
/// Titles whose numeric tokens disagree ("part 1" vs "part 2") score `0.0`.
pub fn similarity(a: &str, b: &str, config: &MatchConfig) -> f64 {
    if a == b {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let tokens_a: BTreeSet<&str> = a.split_whitespace().collect();
    let tokens_b: BTreeSet<&str> = b.split_whitespace().collect();

    if numbers_conflict(&tokens_a, &tokens_b) {
        return 0.0;
    }

    let edit_ratio = sequence_ratio(a, b).max(strsim::normalized_levenshtein(a, b));
    let containment = containment_score(&tokens_a, &tokens_b, config.min_containment_tokens);
    edit_ratio.max(containment)
}

/// Decide whether two already normalized titles name the same talk.
pub fn is_match(a: &str, b: &str, config: &MatchConfig) -> bool {
    a == b || similarity(a, b, config) >= config.threshold
}

/// Decide whether two raw titles (or file names) name the same talk.
pub fn similar(a: &str, b: &str, config: &MatchConfig) -> bool {
    is_match(&normalize_title(a), &normalize_title(b), config)
}

/// Pick the best matching candidate for `key`.
///
/// Returns the candidate with the highest score at or above the threshold.
/// Ties keep the earliest candidate, so callers control precedence by order.
pub fn best_match<'a, T, I>(key: &str, candidates: I, config: &MatchConfig) -> Option<(T, f64)>
where
    I: IntoIterator<Item = (&'a str, T)>,
{
    let mut best: Option<(T, f64)> = None;
    for (candidate, value) in candidates {
        let score = similarity(key, candidate, config);
        if score < config.threshold {
            continue;
        }
        let better = match &best {
            Some((_, best_score)) => score > *best_score,
            None => true,
        };
        if better {
            best = Some((value, score));
        }
    }
    best
}

/// `2 * LCS / (len(a) + len(b))` over chars.
fn sequence_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }

    let mut prev = vec![0usize; b.len() + 1];
    let mut row = vec![0usize; b.len() + 1];
    for ca in &a {
        for (j, cb) in b.iter().enumerate() {
            row[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                prev[j + 1].max(row[j])
            };
        }
        std::mem::swap(&mut prev, &mut row);
    }
    let common = prev[b.len()];
    (2 * common) as f64 / total as f64
}

fn containment_score(a: &BTreeSet<&str>, b: &BTreeSet<&str>, min_tokens: usize) -> f64 {
    let (shorter, longer) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    if shorter.len() >= min_tokens.max(1) && shorter.is_subset(longer) {
        1.0
    } else {
        0.0
    }
}

fn numbers_conflict(a: &BTreeSet<&str>, b: &BTreeSet<&str>) -> bool {
    let numbers = |tokens: &BTreeSet<&str>| -> BTreeSet<String> {
        tokens
            .iter()
            .filter(|t| t.chars().all(|c| c.is_ascii_digit()))
            // "02" and "2" are the same part number
            .map(|t| t.trim_start_matches('0').to_string())
            .collect()
    };
    let numbers_a = numbers(a);
    let numbers_b = numbers(b);
    !numbers_a.is_empty() && !numbers_b.is_empty() && numbers_a != numbers_b
}
