/// Canonical lookup key for slugs, dataset names, and aliases.
///
/// Lowercases and collapses the separators users actually type (space,
/// hyphen, period) to underscore, so "Sales Performance", "sales-performance"
/// and "sales.performance" all resolve to the same catalogue entry.
pub fn normalize_key(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .chars()
        .map(|c| match c {
            ' ' | '-' | '.' => '_',
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::normalize_key;

    #[test]
    fn collapses_separators() {
        assert_eq!(normalize_key("Sales Performance"), "sales_performance");
        assert_eq!(normalize_key("  fct.orders-daily "), "fct_orders_daily");
    }

    #[test]
    fn is_idempotent() {
        for raw in ["Sales Performance", "a-b.c d", "", "ALREADY_FLAT", "x"] {
            let once = normalize_key(raw);
            assert_eq!(normalize_key(&once), once);
        }
    }

    #[test]
    fn output_has_no_forbidden_characters() {
        for raw in ["Mixed CASE-key.v2", "  spaced  out  ", "UPPER"] {
            let key = normalize_key(raw);
            assert!(!key.chars().any(|c| c.is_uppercase()));
            assert!(!key.contains(' '));
            assert!(!key.contains('-'));
            assert!(!key.contains('.'));
        }
    }

    #[test]
    fn empty_input_is_fine() {
        assert_eq!(normalize_key(""), "");
        assert_eq!(normalize_key("   "), "");
    }
}
