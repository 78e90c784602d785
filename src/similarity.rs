//! Name Similarity
//!
//! Levenshtein-based similarity used to suggest a tool name when the command
//! line names an unknown one

/// Minimum similarity for a name to be suggested
pub const SIMILARITY_THRESHOLD: f64 = 0.6;

/// Calculate name similarity
///
/// Case-insensitive; 1.0 is a perfect match and 0.0 shares nothing.
///
/// # Arguments
/// - `a`: First name for comparison
/// - `b`: Second name for comparison
pub fn calculate_similarity(a: &str, b: &str) -> f64 {
    let a = a.to_lowercase();
    let b = b.to_lowercase();

    if a == b {
        return 1.0;
    }

    let distance = levenshtein_distance(&a, &b);
    let max_len = a.chars().count().max(b.chars().count()) as f64;

    1.0 - (distance as f64 / max_len)
}

/// Pick the candidate most similar to `input`
///
/// Returns `None` when no candidate reaches [`SIMILARITY_THRESHOLD`].
pub fn closest_match<'a>(input: &str, candidates: &[&'a str]) -> Option<&'a str> {
    candidates
        .iter()
        .map(|candidate| (*candidate, calculate_similarity(input, candidate)))
        .filter(|(_, score)| *score >= SIMILARITY_THRESHOLD)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(candidate, _)| candidate)
}

/// Calculate Levenshtein distance
fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let a_len = a_chars.len();
    let b_len = b_chars.len();

    if a_len == 0 {
        return b_len;
    }
    if b_len == 0 {
        return a_len;
    }

    // single rolling row
    let mut previous: Vec<usize> = (0..=b_len).collect();
    let mut current = vec![0; b_len + 1];

    for i in 1..=a_len {
        current[0] = i;
        for j in 1..=b_len {
            let cost = usize::from(a_chars[i - 1] != b_chars[j - 1]);
            current[j] = (previous[j] + 1)
                .min(current[j - 1] + 1)
                .min(previous[j - 1] + cost);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[b_len]
}
