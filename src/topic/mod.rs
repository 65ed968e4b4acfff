//! Topic name and topic filter rules.
//!
//! The codec and the flows only ever see the [`TopicEvaluator`] trait, so the
//! wildcard policy can be swapped without touching either. The default
//! [`MqttTopicEvaluator`] follows MQTT 3.1.1 section 4.7.

use crate::utils::error::{MqttError, Result};

const LEVEL_SEPARATOR: char = '/';
const SINGLE_LEVEL_WILDCARD: &str = "+";
const MULTI_LEVEL_WILDCARD: &str = "#";
const MAX_TOPIC_LENGTH: usize = u16::MAX as usize;

pub trait TopicEvaluator: Send + Sync {
    fn is_valid_topic_name(&self, topic_name: &str) -> bool;

    fn is_valid_topic_filter(&self, topic_filter: &str) -> bool;

    /// Whether `topic_name` is matched by `topic_filter`. Fails with a
    /// protocol violation when either argument is structurally invalid.
    fn matches(&self, topic_name: &str, topic_filter: &str) -> Result<bool>;
}

#[derive(Debug, Clone)]
pub struct MqttTopicEvaluator {
    allow_wildcards: bool,
}

impl MqttTopicEvaluator {
    pub fn new(allow_wildcards: bool) -> Self {
        Self { allow_wildcards }
    }
}

impl Default for MqttTopicEvaluator {
    fn default() -> Self {
        Self::new(true)
    }
}

impl TopicEvaluator for MqttTopicEvaluator {
    fn is_valid_topic_name(&self, topic_name: &str) -> bool {
        !topic_name.is_empty()
            && topic_name.len() <= MAX_TOPIC_LENGTH
            && !topic_name.contains(['+', '#', '\0'])
    }

    fn is_valid_topic_filter(&self, topic_filter: &str) -> bool {
        if topic_filter.is_empty()
            || topic_filter.len() > MAX_TOPIC_LENGTH
            || topic_filter.contains('\0')
        {
            return false;
        }
        if !self.allow_wildcards {
            return !topic_filter.contains(['+', '#']);
        }

        let levels: Vec<&str> = topic_filter.split(LEVEL_SEPARATOR).collect();
        let last = levels.len() - 1;
        levels.iter().enumerate().all(|(position, level)| {
            if *level == MULTI_LEVEL_WILDCARD {
                return position == last;
            }
            *level == SINGLE_LEVEL_WILDCARD || !level.contains(['+', '#'])
        })
    }

    fn matches(&self, topic_name: &str, topic_filter: &str) -> Result<bool> {
        if !self.is_valid_topic_name(topic_name) {
            return Err(MqttError::ProtocolViolation(format!(
                "{topic_name:?} is not a valid topic name"
            )));
        }
        if !self.is_valid_topic_filter(topic_filter) {
            return Err(MqttError::ProtocolViolation(format!(
                "{topic_filter:?} is not a valid topic filter"
            )));
        }

        // wildcards never match the first level of system topics
        if topic_name.starts_with('$')
            && (topic_filter.starts_with(SINGLE_LEVEL_WILDCARD)
                || topic_filter.starts_with(MULTI_LEVEL_WILDCARD))
        {
            return Ok(false);
        }

        let mut names = topic_name.split(LEVEL_SEPARATOR);
        let mut filters = topic_filter.split(LEVEL_SEPARATOR);
        loop {
            match (filters.next(), names.next()) {
                (Some(MULTI_LEVEL_WILDCARD), _) => return Ok(true),
                (Some(SINGLE_LEVEL_WILDCARD), Some(_)) => {}
                (Some(filter), Some(name)) if filter == name => {}
                (None, None) => return Ok(true),
                _ => return Ok(false),
            }
        }
    }
}
