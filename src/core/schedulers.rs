//! Schedulers and event matching

use crate::core::{
    config::SchedulerConfig,
    properties::{PropertyBag, PropertyValue},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a scheduler is reached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchedulerKind {
    /// Only reachable from trigger steps
    Triggerable,

    /// Manual invocation
    Force {
        /// Properties the caller must supply
        #[serde(default)]
        required_properties: Vec<String>,
    },

    /// Code push
    Push {
        /// Branch glob patterns (`*` within a path segment, `**` across); empty matches every branch
        #[serde(default)]
        branches: Vec<String>,

        /// Only pushes to this repository match
        #[serde(default)]
        repository: Option<String>,
    },
}

impl SchedulerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerKind::Triggerable => "triggerable",
            SchedulerKind::Force { .. } => "force",
            SchedulerKind::Push { .. } => "push",
        }
    }
}

/// An external event that may start builds
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerEvent {
    Push {
        repository: String,
        branch: String,
        revision: Option<String>,
    },
    Force {
        scheduler: String,
    },
}

/// A rule mapping events to builder invocations
#[derive(Debug, Clone)]
pub struct Scheduler {
    pub name: String,

    pub kind: SchedulerKind,

    /// Builders started for each matching event
    pub builders: Vec<String>,

    /// Properties every build started by this scheduler receives
    pub properties: BTreeMap<String, PropertyValue>,
}

impl Scheduler {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Scheduler {
            name: config.name.clone(),
            kind: config.kind.clone(),
            builders: config.builders.clone(),
            properties: config.properties.clone(),
        }
    }

    pub fn is_triggerable(&self) -> bool {
        self.kind == SchedulerKind::Triggerable
    }

    /// Required properties missing from a force request
    pub fn missing_properties(&self, supplied: &PropertyBag) -> Vec<String> {
        match &self.kind {
            SchedulerKind::Force {
                required_properties,
            } => required_properties
                .iter()
                .filter(|p| !supplied.contains(p))
                .cloned()
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Properties contributed by the scheduler and the event
    ///
    /// Event-derived values override the scheduler's static properties.
    pub fn properties_for(&self, event: Option<&TriggerEvent>) -> PropertyBag {
        let mut bag = PropertyBag::from_pairs(self.properties.clone(), "Scheduler");
        if let Some(TriggerEvent::Push {
            repository,
            branch,
            revision,
        }) = event
        {
            bag.set("repository", repository.as_str(), "Change");
            bag.set("branch", branch.as_str(), "Change");
            let revision = revision
                .clone()
                .map(PropertyValue::String)
                .unwrap_or(PropertyValue::Null);
            bag.set("revision", revision, "Change");
        }
        bag
    }
}

/// Selects the schedulers that an event fires
#[derive(Debug, Default)]
pub struct SchedulerMatcher;

impl SchedulerMatcher {
    pub fn new() -> Self {
        Self
    }

    /// Whether a scheduler fires for an event
    pub fn matches(&self, scheduler: &Scheduler, event: &TriggerEvent) -> bool {
        match (&scheduler.kind, event) {
            (SchedulerKind::Force { .. }, TriggerEvent::Force { scheduler: name }) => {
                &scheduler.name == name
            }
            (
                SchedulerKind::Push {
                    branches,
                    repository: filter,
                },
                TriggerEvent::Push {
                    repository, branch, ..
                },
            ) => {
                filter.as_ref().map_or(true, |f| f == repository)
                    && (branches.is_empty() || branches.iter().any(|p| glob_match(p, branch)))
            }
            _ => false,
        }
    }

    /// All schedulers matching an event, in declared order
    pub fn select<'a>(&self, schedulers: &'a [Scheduler], event: &TriggerEvent) -> Vec<&'a Scheduler> {
        schedulers.iter().filter(|s| self.matches(s, event)).collect()
    }
}

/// Glob match: `**` crosses `/`, `*` does not, `?` is one character
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let mut regex = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                regex.push_str(".*");
            }
            '*' => regex.push_str("[^/]*"),
            '?' => regex.push_str("[^/]"),
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');

    Regex::new(&regex).map_or(false, |re| re.is_match(text))
}
