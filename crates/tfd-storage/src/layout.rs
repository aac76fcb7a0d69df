//! Directory layout validation for extracted model archives.

use std::sync::OnceLock;

use regex::Regex;

/// Anchored patterns every valid model archive must satisfy.
///
/// Each pattern must match at least one entry of the extracted tree;
/// extra entries (`assets` and similar) are tolerated.
pub const MODEL_LAYOUT_PATTERNS: [&str; 6] = [
    r"^model_archive\.tar$",
    r"^variables$",
    r"^variables/variables\.data-[0-9]{5}-of-[0-9]{5}$",
    r"^variables/variables\.index$",
    r"^saved_model\..*$",
    r"^README\.md$",
];

fn model_layout() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        MODEL_LAYOUT_PATTERNS
            .iter()
            .map(|p| Regex::new(p).expect("layout pattern"))
            .collect()
    })
}

/// Returns true when every pattern matches at least one entry.
#[must_use]
pub fn validate_layout(entries: &[String], patterns: &[Regex]) -> bool {
    patterns
        .iter()
        .all(|re| entries.iter().any(|entry| re.is_match(entry)))
}

/// Validates entries against the model archive layout.
#[must_use]
pub fn is_model_layout_valid(entries: &[String]) -> bool {
    validate_layout(entries, model_layout())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_layout() -> Vec<String> {
        [
            "model_archive.tar",
            "variables",
            "variables/variables.data-00000-of-00001",
            "variables/variables.index",
            "saved_model.pb",
            "README.md",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }

    #[test]
    fn complete_layout_is_valid() {
        assert!(is_model_layout_valid(&complete_layout()));
    }

    #[test]
    fn extra_entries_are_tolerated() {
        let mut entries = complete_layout();
        entries.push("assets".into());
        entries.push("assets/vocab.txt".into());
        assert!(is_model_layout_valid(&entries));
    }

    #[test]
    fn each_required_entry_is_mandatory() {
        let complete = complete_layout();
        for missing in 0..complete.len() {
            let entries: Vec<String> = complete
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != missing)
                .map(|(_, e)| e.clone())
                .collect();
            assert!(
                !is_model_layout_valid(&entries),
                "layout without {:?} should be invalid",
                complete[missing]
            );
        }
    }

    #[test]
    fn patterns_are_anchored() {
        let mut entries = complete_layout();
        // "variables" must match as a whole entry, not as a prefix
        entries[1] = "variables_backup".into();
        assert!(!is_model_layout_valid(&entries));
    }
}
