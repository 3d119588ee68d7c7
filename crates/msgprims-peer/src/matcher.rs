use msgprims_frame::{FieldValue, NAMED_MESSAGE_RECEIVER_KEY};

/// Predicate used when selecting destinations by metadata.
///
/// `actual` is the value the destination published, `wanted` the value the
/// caller filters on.
pub trait MetaDataMatcher: Send + Sync {
    fn matches(&self, key: &str, actual: Option<&FieldValue>, wanted: Option<&FieldValue>) -> bool;
}

/// Default matcher: named-receiver containment, equality for other keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReceiverNameMatcher;

impl MetaDataMatcher for ReceiverNameMatcher {
    fn matches(&self, key: &str, actual: Option<&FieldValue>, wanted: Option<&FieldValue>) -> bool {
        let actual = actual.filter(|value| !value.is_null());
        let wanted = wanted.filter(|value| !value.is_null());

        match (actual, wanted) {
            (None, None) => true,
            (Some(actual), Some(wanted)) if key == NAMED_MESSAGE_RECEIVER_KEY => {
                let Some(published) = actual.as_string_list() else {
                    return actual == wanted;
                };
                match wanted.as_string_list() {
                    Some(names) => names.iter().all(|name| published.contains(name)),
                    None => false,
                }
            }
            (Some(actual), Some(wanted)) => actual == wanted,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(names: &[&str]) -> FieldValue {
        FieldValue::from(names.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn both_absent_matches() {
        assert!(ReceiverNameMatcher.matches("any", None, None));
        assert!(ReceiverNameMatcher.matches("any", Some(&FieldValue::Null), None));
    }

    #[test]
    fn one_side_absent_does_not_match() {
        assert!(!ReceiverNameMatcher.matches("k", Some(&FieldValue::from("v")), None));
        assert!(!ReceiverNameMatcher.matches("k", None, Some(&FieldValue::from("v"))));
    }

    #[test]
    fn receiver_name_is_contained() {
        let published = list(&["orders", "billing"]);
        assert!(ReceiverNameMatcher.matches(
            NAMED_MESSAGE_RECEIVER_KEY,
            Some(&published),
            Some(&FieldValue::from("billing"))
        ));
        assert!(!ReceiverNameMatcher.matches(
            NAMED_MESSAGE_RECEIVER_KEY,
            Some(&published),
            Some(&FieldValue::from("shipping"))
        ));
    }

    #[test]
    fn receiver_list_must_be_subset() {
        let published = list(&["a", "b", "c"]);
        assert!(ReceiverNameMatcher.matches(
            NAMED_MESSAGE_RECEIVER_KEY,
            Some(&published),
            Some(&list(&["a", "c"]))
        ));
        assert!(!ReceiverNameMatcher.matches(
            NAMED_MESSAGE_RECEIVER_KEY,
            Some(&published),
            Some(&list(&["a", "d"]))
        ));
    }

    #[test]
    fn other_keys_use_equality() {
        assert!(ReceiverNameMatcher.matches(
            "region",
            Some(&FieldValue::from("eu")),
            Some(&FieldValue::from("eu"))
        ));
        assert!(!ReceiverNameMatcher.matches(
            "region",
            Some(&FieldValue::from("eu")),
            Some(&FieldValue::from("us"))
        ));
    }
}
