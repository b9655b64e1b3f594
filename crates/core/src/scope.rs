//! Component scope rules.
//!
//! A scope is the set of page components a subscription cares about. The
//! empty set means the whole page.

use std::collections::BTreeSet;

use crate::types::PageComponent;

/// Whether a subscription with `scope` should hear about an update touching
/// `affected`. Whole-page scopes always match; otherwise any overlap matches.
pub fn matches_update(scope: &BTreeSet<i64>, affected: &[i64]) -> bool {
    scope.is_empty() || affected.iter().any(|id| scope.contains(id))
}

/// Literal set union. A whole-page scope merged with `[c1]` narrows to
/// `{c1}`; callers relying on whole-page semantics must not merge.
pub fn merge(existing: &BTreeSet<i64>, requested: &BTreeSet<i64>) -> BTreeSet<i64> {
    existing.union(requested).copied().collect()
}

/// Requested ids that are not components of `page_id`, in ascending order.
pub fn invalid_components(
    page_id: i64,
    requested: &BTreeSet<i64>,
    known: &[PageComponent],
) -> Vec<i64> {
    requested
        .iter()
        .copied()
        .filter(|id| {
            !known
                .iter()
                .any(|component| component.id == *id && component.page_id == page_id)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[i64]) -> BTreeSet<i64> {
        ids.iter().copied().collect()
    }

    #[test]
    fn test_whole_page_scope_matches_any_update() {
        assert!(matches_update(&set(&[]), &[1, 2]));
        assert!(matches_update(&set(&[]), &[]));
    }

    #[test]
    fn test_partial_overlap_matches() {
        assert!(matches_update(&set(&[1]), &[1, 2]));
        assert!(matches_update(&set(&[2, 5]), &[1, 2]));
    }

    #[test]
    fn test_disjoint_scope_does_not_match() {
        assert!(!matches_update(&set(&[3]), &[1, 2]));
    }

    #[test]
    fn test_scoped_subscription_ignores_whole_page_update() {
        // an update with no components only reaches whole-page subscriptions
        assert!(!matches_update(&set(&[3]), &[]));
    }

    #[test]
    fn test_merge_is_set_union() {
        assert_eq!(merge(&set(&[1, 2]), &set(&[2, 3])), set(&[1, 2, 3]));
        assert_eq!(merge(&set(&[1]), &set(&[])), set(&[1]));
    }

    #[test]
    fn test_merge_whole_page_with_components_narrows() {
        assert_eq!(merge(&set(&[]), &set(&[1])), set(&[1]));
        assert!(merge(&set(&[]), &set(&[])).is_empty());
    }

    #[test]
    fn test_invalid_components_rejects_foreign_and_unknown() {
        let known = vec![
            PageComponent {
                id: 1,
                page_id: 10,
                name: "API".to_string(),
            },
            PageComponent {
                id: 2,
                page_id: 11,
                name: "Other page".to_string(),
            },
        ];
        assert_eq!(invalid_components(10, &set(&[1, 2, 3]), &known), vec![2, 3]);
        assert!(invalid_components(10, &set(&[1]), &known).is_empty());
        assert!(invalid_components(10, &set(&[]), &known).is_empty());
    }
}
