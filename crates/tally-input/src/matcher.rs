// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Case-insensitive substring scoring for reference completion.

/// Score `query` against `candidate` (case-insensitive).
///
/// Returns `Some(score)` if `query` occurs as a contiguous substring of the
/// candidate, or `None` if it does not.  An empty query matches everything
/// with score 0.
///
/// Scoring, at the first occurrence:
/// - +1 per matched character
/// - +3 for each character that follows another matched character
/// - +5 when the match starts at position 0
/// - +2 when it starts at a word boundary (after `/`, `-`, `_`, `.` or space)
/// - +10 when the whole candidate matches
pub fn match_score(query: &str, candidate: &str) -> Option<usize> {
    if query.is_empty() {
        return Some(0);
    }

    let query_lc: Vec<char> = query.to_lowercase().chars().collect();
    let candidate_lc: Vec<char> = candidate.to_lowercase().chars().collect();
    if query_lc.len() > candidate_lc.len() {
        return None;
    }

    let start = candidate_lc
        .windows(query_lc.len())
        .position(|w| w == query_lc.as_slice())?;

    let mut score = query_lc.len() + 3 * (query_lc.len() - 1);
    if start == 0 {
        score += 5;
    } else if matches!(candidate_lc[start - 1], '/' | '-' | '_' | '.' | ' ') {
        score += 2;
    }
    if query_lc.len() == candidate_lc.len() {
        score += 10;
    }
    Some(score)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_query_always_matches() {
        assert_eq!(match_score("", "anything.csv"), Some(0));
    }

    #[test]
    fn case_insensitive() {
        assert_eq!(match_score("REV", "revenue.csv"), match_score("rev", "Revenue.csv"));
        assert!(match_score("rev", "REVENUE.CSV").is_some());
    }

    #[test]
    fn scattered_characters_do_not_match() {
        assert!(match_score("rvn", "revenue.csv").is_none());
        assert!(match_score("revenue.csv.bak", "revenue.csv").is_none());
    }

    #[test]
    fn prefix_beats_boundary_beats_inner() {
        let prefix = match_score("rev", "revenue.csv").unwrap();
        let boundary = match_score("rev", "q3-revenue.csv").unwrap();
        let inner = match_score("rev", "prerevenue.csv").unwrap();
        assert!(prefix > boundary);
        assert!(boundary > inner);
    }

    #[test]
    fn exact_match_is_highest() {
        let exact = match_score("hr.csv", "hr.csv").unwrap();
        let prefix = match_score("hr.csv", "hr.csv.old").unwrap();
        assert!(exact > prefix);
    }

    #[test]
    fn longer_match_scores_higher() {
        assert!(match_score("reven", "revenue.csv") > match_score("rev", "revenue.csv"));
    }
}
