//! Identifier generation

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Generate an identifier of the form `<prefix>_<unix millis>_<random suffix>`
pub fn next_id(prefix: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(char::from)
        .collect();
    format!(
        "{}_{}_{}",
        prefix,
        chrono::Utc::now().timestamp_millis(),
        suffix.to_lowercase()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_next_id_unique() {
        let mut ids = HashSet::new();
        for _ in 0..1000 {
            assert!(ids.insert(next_id("alert")), "Duplicate ID generated");
        }
    }

    #[test]
    fn test_next_id_prefix() {
        let id = next_id("rule");
        assert!(id.starts_with("rule_"));
        assert_eq!(id.split('_').count(), 3);
    }
}
