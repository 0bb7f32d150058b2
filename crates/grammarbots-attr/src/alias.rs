//! Disambiguation of repeated symbol occurrences within one production.

use std::collections::HashMap;

/// Assign occurrence aliases for one production.
///
/// `names` lists the non-terminal occurrences left to right with the
/// left-hand side first. A name occurring exactly once keeps its own
/// spelling; a name occurring `k` times has its occurrences numbered
/// `<name_1>` through `<name_k>`, suffix inserted before the closing
/// bracket. The result is aligned with the input and collision-free, so
/// downstream code can address occurrences by exact computed name.
#[must_use]
pub fn occurrence_aliases(names: &[&str]) -> Vec<String> {
    let mut totals: HashMap<&str, usize> = HashMap::new();
    for name in names {
        *totals.entry(name).or_default() += 1;
    }

    let mut seen: HashMap<&str, usize> = HashMap::new();
    names
        .iter()
        .map(|name| {
            if totals[name] == 1 {
                (*name).to_string()
            } else {
                let ordinal = seen
                    .entry(name)
                    .and_modify(|count| *count += 1)
                    .or_insert(1);
                let stem = name.strip_suffix('>').unwrap_or(name);
                format!("{stem}_{ordinal}>")
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_names_keep_their_spelling() {
        assert_eq!(
            occurrence_aliases(&["<S>", "<A>", "<B>"]),
            vec!["<S>", "<A>", "<B>"]
        );
    }

    #[test]
    fn repeated_names_are_numbered_lhs_first() {
        // <S> ::= <S><A>
        assert_eq!(
            occurrence_aliases(&["<S>", "<S>", "<A>"]),
            vec!["<S_1>", "<S_2>", "<A>"]
        );
    }

    #[test]
    fn triple_occurrence_numbers_run_left_to_right() {
        assert_eq!(
            occurrence_aliases(&["<K>", "<I>", "<K>", "<K>"]),
            vec!["<K_1>", "<I>", "<K_2>", "<K_3>"]
        );
    }

    #[test]
    fn aliases_never_collide() {
        let names = ["<S>", "<S>", "<A>", "<A>", "<S>", "<B>"];
        let aliases = occurrence_aliases(&names);
        let mut unique = aliases.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), names.len());
    }
}
