//! Topic strings.
//!
//! A topic is a list of elements joined with [`TOPIC_DELIMITER`]. Publishers
//! address one topic. Consumers subscribe with an expression: a list of
//! positions, each listing the alternatives accepted at that position. The
//! expression expands to every combination.

pub const TOPIC_DELIMITER: char = ';';

pub fn combine_elements<S: AsRef<str>>(elements: &[S]) -> String {
    let mut topic = String::new();
    for (i, element) in elements.iter().enumerate() {
        if i > 0 {
            topic.push(TOPIC_DELIMITER);
        }
        topic.push_str(element.as_ref());
    }
    topic
}

/// `[["a", "b"], ["x"]]` expands to `["a;x", "b;x"]`.
///
/// A position with no alternatives matches nothing, so the result is empty.
pub fn resolve_expression_into_list_of_topics<S: AsRef<str>>(expression: &[Vec<S>]) -> Vec<String> {
    if expression.is_empty() {
        return Vec::new();
    }
    let mut topics = vec![String::new()];
    for (position, alternatives) in expression.iter().enumerate() {
        let mut next = Vec::with_capacity(topics.len() * alternatives.len());
        for prefix in &topics {
            for alternative in alternatives {
                let mut topic = prefix.clone();
                if position > 0 {
                    topic.push(TOPIC_DELIMITER);
                }
                topic.push_str(alternative.as_ref());
                next.push(topic);
            }
        }
        topics = next;
    }
    topics
}

/// Namespace of one queue: optional deployment prefix plus the queue name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicScope {
    base: String,
}

impl TopicScope {
    pub fn new(name: &str, prefix: Option<&str>) -> Self {
        let base = match prefix {
            Some(prefix) if !prefix.is_empty() => combine_elements(&[prefix, name]),
            _ => name.to_string(),
        };
        Self { base }
    }

    /// Topic used when no elements are given.
    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn topic_for<S: AsRef<str>>(&self, elements: &[S]) -> String {
        if elements.is_empty() {
            return self.base.clone();
        }
        format!("{}{}{}", self.base, TOPIC_DELIMITER, combine_elements(elements))
    }

    /// Concrete topics a consumer reads. An empty expression means the base
    /// topic only.
    pub fn subscriptions<S: AsRef<str>>(&self, expression: &[Vec<S>]) -> Vec<String> {
        if expression.is_empty() {
            return vec![self.base.clone()];
        }
        resolve_expression_into_list_of_topics(expression)
            .into_iter()
            .map(|topic| format!("{}{}{}", self.base, TOPIC_DELIMITER, topic))
            .collect()
    }
}
