//! Sequence diffs used by the synchronizer.
//!
//! `child_edit_script` computes the minimal reordering of a child list: the
//! longest common subsequence of the previous and next sequences stays put,
//! everything else is removed, inserted or moved. `text_splice` reduces a
//! text change to one splice over the changed middle.

use std::collections::HashSet;
use std::hash::Hash;

/// Edit script turning `prev` into `next`.
#[derive(Debug, Clone)]
pub struct ChildEditScript<K> {
    /// Present in `prev`, absent from `next`.
    pub removals: Vec<K>,
    /// Absent from `prev`, with their index in `next`.
    pub insertions: Vec<(usize, K)>,
    /// Present in both but out of relative order, with their index in `next`.
    pub moves: Vec<(usize, K)>,
    /// Members of the longest common subsequence. Never moved.
    pub anchors: HashSet<K>,
}

impl<K> ChildEditScript<K> {
    pub fn is_empty(&self) -> bool {
        self.removals.is_empty() && self.insertions.is_empty() && self.moves.is_empty()
    }
}

/// Compute the edit script from `prev` to `next`. Keys must be unique within
/// each sequence.
pub fn child_edit_script<K: Clone + Eq + Hash>(prev: &[K], next: &[K]) -> ChildEditScript<K> {
    let next_set: HashSet<&K> = next.iter().collect();
    let prev_set: HashSet<&K> = prev.iter().collect();

    let removals = prev
        .iter()
        .filter(|k| !next_set.contains(k))
        .cloned()
        .collect();

    let anchors: HashSet<K> = longest_common_subsequence(prev, next).into_iter().collect();

    let mut insertions = Vec::new();
    let mut moves = Vec::new();
    for (index, key) in next.iter().enumerate() {
        if anchors.contains(key) {
            continue;
        }
        if prev_set.contains(key) {
            moves.push((index, key.clone()));
        } else {
            insertions.push((index, key.clone()));
        }
    }

    ChildEditScript {
        removals,
        insertions,
        moves,
        anchors,
    }
}

/// Classic O(n*m) dynamic-programming LCS. Child lists are short.
fn longest_common_subsequence<K: Clone + Eq>(a: &[K], b: &[K]) -> Vec<K> {
    let (n, m) = (a.len(), b.len());
    let mut table = vec![vec![0usize; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[i][j] = if a[i] == b[j] {
                table[i + 1][j + 1] + 1
            } else {
                table[i + 1][j].max(table[i][j + 1])
            };
        }
    }

    let mut out = Vec::with_capacity(table[0][0]);
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if a[i] == b[j] {
            out.push(a[i].clone());
            i += 1;
            j += 1;
        } else if table[i + 1][j] >= table[i][j + 1] {
            i += 1;
        } else {
            j += 1;
        }
    }
    out
}

/// A single text replacement. Offsets and lengths count Unicode scalar values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSplice {
    pub offset: usize,
    pub delete: usize,
    pub insert: String,
}

/// Smallest single splice turning `prev` into `next`, found by trimming the
/// common prefix and suffix. `None` when the texts are equal.
pub fn text_splice(prev: &str, next: &str) -> Option<TextSplice> {
    if prev == next {
        return None;
    }
    let prev: Vec<char> = prev.chars().collect();
    let next: Vec<char> = next.chars().collect();

    let prefix = prev
        .iter()
        .zip(next.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let max_suffix = prev.len().min(next.len()) - prefix;
    let suffix = prev[prefix..]
        .iter()
        .rev()
        .zip(next[prefix..].iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    Some(TextSplice {
        offset: prefix,
        delete: prev.len() - prefix - suffix,
        insert: next[prefix..next.len() - suffix].iter().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_middle_insertion() {
        let splice = text_splice("Hello World", "Hello Brave World").unwrap();
        assert_eq!(
            splice,
            TextSplice {
                offset: 6,
                delete: 0,
                insert: "Brave ".into(),
            }
        );
    }

    #[test]
    fn test_replacement_and_deletion() {
        assert_eq!(
            text_splice("abcdef", "abXYef"),
            Some(TextSplice {
                offset: 2,
                delete: 2,
                insert: "XY".into(),
            })
        );
        assert_eq!(
            text_splice("abcabc", "abc"),
            Some(TextSplice {
                offset: 3,
                delete: 3,
                insert: String::new(),
            })
        );
        assert_eq!(text_splice("same", "same"), None);
    }

    #[test]
    fn test_repeated_characters_do_not_overlap() {
        // Prefix and suffix must not claim the same characters.
        let splice = text_splice("aa", "aaa").unwrap();
        assert_eq!(splice.offset, 2);
        assert_eq!(splice.delete, 0);
        assert_eq!(splice.insert, "a");
    }

    #[test]
    fn test_offsets_count_scalar_values() {
        let splice = text_splice("héllo", "héllo wörld").unwrap();
        assert_eq!(splice.offset, 5);
        assert_eq!(splice.insert, " wörld");
    }

    #[test]
    fn test_script_keeps_lcs_anchored() {
        let script = child_edit_script(&["a", "b", "c", "d"], &["b", "c", "a", "e"]);
        assert_eq!(script.removals, vec!["d"]);
        assert_eq!(script.moves, vec![(2, "a")]);
        assert_eq!(script.insertions, vec![(3, "e")]);
        assert!(script.anchors.contains("b") && script.anchors.contains("c"));
    }

    #[test]
    fn test_identical_sequences_are_empty() {
        let script = child_edit_script(&[1, 2, 3], &[1, 2, 3]);
        assert!(script.is_empty());
        assert_eq!(script.anchors.len(), 3);
    }
}
