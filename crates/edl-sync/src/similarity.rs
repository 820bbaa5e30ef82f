//! Longest-matching-blocks similarity between two optional strings.

use std::collections::HashMap;

/// Lower-case and trim.
pub fn normalize(text: &str) -> String {
    text.to_lowercase().trim().to_string()
}

/// Ratio of matching characters in `[0, 1]`; absent input never matches.
///
/// `2 * M / (|a| + |b|)`, where `M` is the total size of the matching blocks
/// found by repeatedly taking the longest common block (earliest on ties) and
/// recursing on the unmatched remainders to its left and right.
pub fn similarity(a: Option<&str>, b: Option<&str>) -> f64 {
    let (Some(a), Some(b)) = (a, b) else {
        return 0.0;
    };
    let a = normalize(a);
    let b = normalize(b);
    // Block search is order-sensitive on ties; fixing the order keeps the score symmetric.
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    let first = first.chars().collect::<Vec<_>>();
    let second = second.chars().collect::<Vec<_>>();
    matching_ratio(&first, &second)
}

fn matching_ratio(a: &[char], b: &[char]) -> f64 {
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    2.0 * matching_characters(a, b) as f64 / total as f64
}

fn matching_characters(a: &[char], b: &[char]) -> usize {
    let mut positions: HashMap<char, Vec<usize>> = HashMap::new();
    for (j, c) in b.iter().enumerate() {
        positions.entry(*c).or_default().push(j);
    }

    let mut matched = 0;
    let mut pending = vec![(0, a.len(), 0, b.len())];
    while let Some((alo, ahi, blo, bhi)) = pending.pop() {
        let (i, j, size) = longest_block(a, &positions, alo, ahi, blo, bhi);
        if size == 0 {
            continue;
        }
        matched += size;
        if alo < i && blo < j {
            pending.push((alo, i, blo, j));
        }
        if i + size < ahi && j + size < bhi {
            pending.push((i + size, ahi, j + size, bhi));
        }
    }
    matched
}

/// Longest block shared by `a[alo..ahi]` and `b[blo..bhi]` as `(i, j, size)`.
/// Ties go to the smallest `i`, then the smallest `j`.
fn longest_block(
    a: &[char],
    positions: &HashMap<char, Vec<usize>>,
    alo: usize,
    ahi: usize,
    blo: usize,
    bhi: usize,
) -> (usize, usize, usize) {
    let (mut best_i, mut best_j, mut best_size) = (alo, blo, 0);
    // run_ending_at[j] = length of the common run ending at a[i - 1] and b[j]
    let mut run_ending_at: HashMap<usize, usize> = HashMap::new();

    for (i, c) in a.iter().enumerate().take(ahi).skip(alo) {
        let mut next = HashMap::new();
        if let Some(js) = positions.get(c) {
            for &j in js {
                if j < blo {
                    continue;
                }
                if j >= bhi {
                    break;
                }
                let previous = if j > 0 {
                    run_ending_at.get(&(j - 1)).copied().unwrap_or(0)
                } else {
                    0
                };
                let size = previous + 1;
                next.insert(j, size);
                if size > best_size {
                    best_i = i + 1 - size;
                    best_j = j + 1 - size;
                    best_size = size;
                }
            }
        }
        run_ending_at = next;
    }

    (best_i, best_j, best_size)
}
