//! Label similarity for fuzzy entity dedup.
//!
//! Paraphrased mentions of the same entity ("Grandmother" / "My Grandma")
//! should resolve to one node. Labels are normalized, then compared with a
//! longest-common-subsequence ratio in [0, 1].

/// Leading tokens that carry no identity ("My Grandma" → "grandma").
const LEADING_FILLER: &[&str] = &["a", "an", "the", "my", "our", "his", "her", "their"];

/// Lowercase, strip punctuation, collapse whitespace, and drop a single
/// leading article/possessive token.
pub fn normalize_label(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect();

    let mut tokens: Vec<&str> = cleaned.split_whitespace().collect();
    if tokens.len() > 1 && LEADING_FILLER.contains(&tokens[0]) {
        tokens.remove(0);
    }
    tokens.join(" ")
}

/// Similarity ratio between two labels: 2·LCS / (|a| + |b|) over the
/// normalized forms. Identical labels score 1.0, disjoint ones 0.0.
pub fn label_similarity(a: &str, b: &str) -> f64 {
    let a = normalize_label(a);
    let b = normalize_label(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }

    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let lcs = lcs_length(&a, &b);
    (2 * lcs) as f64 / (a.len() + b.len()) as f64
}

/// Classic O(n·m) dynamic program, rolling one row. Labels are short so
/// quadratic is fine.
fn lcs_length(a: &[char], b: &[char]) -> usize {
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];

    for &ca in a {
        for (j, &cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}
