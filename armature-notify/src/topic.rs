//! Topic parsing and wildcard expansion.
//!
//! A full topic is `namespace:kind:mode`, e.g. `user:record:create`.
//! Publishers and subscribers address a bus with the namespace-relative
//! suffix (`record:create`); the bus prepends its own namespace.

use armature_core::NotifyError;

/// The three lifecycle modes a `*` wildcard expands to.
pub const LIFECYCLE_MODES: [&str; 3] = ["create", "update", "delete"];

/// Topic kind segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    /// Node lifecycle transitions.
    Record,
    /// Application-defined events.
    Event,
}

impl TopicKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Record => "record",
            Self::Event => "event",
        }
    }
}

/// A parsed namespace-relative topic suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub kind: TopicKind,
    pub mode: String,
}

impl Topic {
    /// Parse a `kind:mode` suffix.
    pub fn parse(suffix: &str) -> Result<Self, NotifyError> {
        let bad = || NotifyError::BadTopic {
            topic: suffix.to_string(),
        };

        let (kind, mode) = suffix.split_once(':').ok_or_else(bad)?;
        let kind = match kind {
            "record" => TopicKind::Record,
            "event" => TopicKind::Event,
            _ => return Err(bad()),
        };
        if mode.is_empty() || mode.contains(':') {
            return Err(bad());
        }
        // Wildcards enumerate lifecycle modes, which only records have.
        if mode == "*" && kind != TopicKind::Record {
            return Err(bad());
        }
        Ok(Self {
            kind,
            mode: mode.to_string(),
        })
    }

    pub fn is_wildcard(&self) -> bool {
        self.mode == "*"
    }

    pub fn suffix(&self) -> String {
        format!("{}:{}", self.kind.as_str(), self.mode)
    }

    /// Full topic under a namespace.
    pub fn full(&self, namespace: &str) -> String {
        format!("{namespace}:{}", self.suffix())
    }

    /// Concrete suffixes this topic subscribes. A `record:*` mode expands
    /// to the three lifecycle modes at subscribe time; anything else is
    /// itself.
    pub fn expand(&self) -> Vec<String> {
        if self.is_wildcard() {
            LIFECYCLE_MODES
                .iter()
                .map(|mode| format!("{}:{mode}", self.kind.as_str()))
                .collect()
        } else {
            vec![self.suffix()]
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
