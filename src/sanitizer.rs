//! Bounds names and attribute maps before they are persisted

use crate::config::SanitizerLimits;
use crate::telemetry::Attributes;

pub trait SignalSanitizer: Send + Sync {
    fn sanitize_span_name(&self, name: &str) -> String;

    fn sanitize_event_name(&self, name: &str) -> String;

    fn sanitize_span_attributes(&self, attributes: Attributes) -> Attributes;

    fn sanitize_event_attributes(&self, attributes: Attributes) -> Attributes;

    fn sanitize_link_attributes(&self, attributes: Attributes) -> Attributes;

    fn sanitize_log_attributes(&self, attributes: Attributes) -> Attributes;

    fn sanitize_attribute_key(&self, key: &str) -> String;

    fn sanitize_attribute_value(&self, value: &str) -> String;
}

#[derive(Debug, Clone, Default)]
pub struct DefaultSanitizer {
    limits: SanitizerLimits,
}

impl DefaultSanitizer {
    pub fn new(limits: SanitizerLimits) -> Self {
        Self { limits }
    }

    fn sanitize_name(name: &str, max_length: usize) -> String {
        let trimmed = name.trim_matches(|c: char| c.is_whitespace() || c.is_control());
        truncate(trimmed, max_length)
    }

    fn sanitize_attributes(&self, attributes: Attributes, max_count: usize) -> Attributes {
        attributes
            .into_iter()
            .take(max_count)
            .map(|(key, value)| {
                (
                    self.sanitize_attribute_key(&key),
                    self.sanitize_attribute_value(&value),
                )
            })
            .collect()
    }
}

/// Truncate to at most `max_chars` characters
fn truncate(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((index, _)) => value[..index].to_string(),
        None => value.to_string(),
    }
}

impl SignalSanitizer for DefaultSanitizer {
    fn sanitize_span_name(&self, name: &str) -> String {
        Self::sanitize_name(name, self.limits.span_name_length)
    }

    fn sanitize_event_name(&self, name: &str) -> String {
        Self::sanitize_name(name, self.limits.event_name_length)
    }

    fn sanitize_span_attributes(&self, attributes: Attributes) -> Attributes {
        self.sanitize_attributes(attributes, self.limits.span_attribute_count)
    }

    fn sanitize_event_attributes(&self, attributes: Attributes) -> Attributes {
        self.sanitize_attributes(attributes, self.limits.event_attribute_count)
    }

    fn sanitize_link_attributes(&self, attributes: Attributes) -> Attributes {
        self.sanitize_attributes(attributes, self.limits.link_attribute_count)
    }

    fn sanitize_log_attributes(&self, attributes: Attributes) -> Attributes {
        self.sanitize_attributes(attributes, self.limits.log_attribute_count)
    }

    fn sanitize_attribute_key(&self, key: &str) -> String {
        truncate(key, self.limits.attribute_key_length)
    }

    fn sanitize_attribute_value(&self, value: &str) -> String {
        truncate(value, self.limits.attribute_value_length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sanitizer() -> DefaultSanitizer {
        DefaultSanitizer::new(SanitizerLimits {
            span_name_length: 5,
            attribute_key_length: 3,
            attribute_value_length: 4,
            span_attribute_count: 2,
            ..SanitizerLimits::default()
        })
    }

    #[test]
    fn test_name_is_trimmed_and_truncated() {
        let sanitizer = sanitizer();
        assert_eq!(sanitizer.sanitize_span_name("  \tcheckout\n"), "check");
        assert_eq!(sanitizer.sanitize_span_name("load"), "load");
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let sanitizer = sanitizer();
        assert_eq!(sanitizer.sanitize_attribute_value("ééééé"), "éééé");
    }

    #[test]
    fn test_attribute_count_keeps_sorted_prefix() {
        let sanitizer = sanitizer();
        let attributes: Attributes = [("c", "3"), ("a", "1"), ("b", "2")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let sanitized = sanitizer.sanitize_span_attributes(attributes);
        assert_eq!(sanitized.len(), 2);
        assert!(sanitized.contains_key("a"));
        assert!(sanitized.contains_key("b"));
    }

    #[test]
    fn test_attribute_keys_and_values_truncated() {
        let sanitizer = sanitizer();
        let mut attributes = Attributes::new();
        attributes.insert("long_key".to_string(), "long_value".to_string());

        let sanitized = sanitizer.sanitize_span_attributes(attributes);
        assert_eq!(sanitized.get("lon").map(String::as_str), Some("long"));
    }
}
