//! Topic names and normalization for the pipeline bus
//!
//! The three topics form the only coupling between stages. Topic names are
//! plain (no broker-enforced schema); normalization keeps subscriptions and
//! publishes from diverging over incidental whitespace or case.

/// User messages accepted by ingestion, consumed by understanding.
pub const TOPIC_INCOMING: &str = "incoming-messages";

/// Understanding output, consumed by formatting.
pub const TOPIC_PROCESSED: &str = "processed-messages";

/// Formatted replies, consumed by delivery.
pub const TOPIC_OUTGOING: &str = "outgoing-messages";

/// Normalize a topic name: trim surrounding whitespace, lowercase, and
/// collapse interior whitespace runs to single hyphens.
pub fn normalize_topic(topic: &str) -> String {
    topic
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn normalize_topic_is_idempotent(topic in ".*") {
            let first = normalize_topic(&topic);
            let second = normalize_topic(&first);
            prop_assert_eq!(first, second, "normalize_topic should be idempotent");
        }

        #[test]
        fn normalize_topic_has_no_whitespace(topic in ".*") {
            let result = normalize_topic(&topic);
            prop_assert!(!result.chars().any(char::is_whitespace));
        }
    }

    #[test]
    fn test_pipeline_topics_already_normalized() {
        assert_eq!(normalize_topic(TOPIC_INCOMING), TOPIC_INCOMING);
        assert_eq!(normalize_topic(TOPIC_PROCESSED), TOPIC_PROCESSED);
        assert_eq!(normalize_topic(TOPIC_OUTGOING), TOPIC_OUTGOING);
    }

    #[test]
    fn test_normalize_examples() {
        assert_eq!(normalize_topic("  Incoming Messages "), "incoming-messages");
        assert_eq!(normalize_topic("outgoing-messages"), "outgoing-messages");
        assert_eq!(normalize_topic(""), "");
    }
}
