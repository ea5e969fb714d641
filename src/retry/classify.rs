//! Error Classifier
//!
//! Maps raw remote failures onto the retry taxonomy. Provider codes are
//! hierarchical (`Group.Detail`): the full code is tried first, then each
//! shorter dotted prefix, then the HTTP-like status.

use crate::remote::RemoteFailure;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Timeouts, 5xx, internal errors
    Transient,
    /// Explicit throttling
    RateLimited,
    /// Object state disallows the operation right now
    Conflict,
    NotFound,
    /// Malformed request, authorization failure, unsupported combination
    InvalidInput,
    Unknown,
}

impl ErrorClass {
    pub const ALL: [ErrorClass; 6] = [
        Self::Transient,
        Self::RateLimited,
        Self::Conflict,
        Self::NotFound,
        Self::InvalidInput,
        Self::Unknown,
    ];

    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Transient | Self::RateLimited | Self::Conflict | Self::Unknown
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::RateLimited => "rate_limited",
            Self::Conflict => "conflict",
            Self::NotFound => "not_found",
            Self::InvalidInput => "invalid_input",
            Self::Unknown => "unknown",
        }
    }
}

/// Built-in code rules, matched on the full code or a dotted prefix
const CODE_RULES: &[(&str, ErrorClass)] = &[
    ("InternalError", ErrorClass::Transient),
    ("ServiceUnavailable", ErrorClass::Transient),
    ("RequestTimeout", ErrorClass::Transient),
    ("ClientError.NetworkError", ErrorClass::Transient),
    ("ClientError.HttpStatusCodeError", ErrorClass::Transient),
    ("FailedOperation.Timeout", ErrorClass::Transient),
    ("RequestLimitExceeded", ErrorClass::RateLimited),
    ("Throttling", ErrorClass::RateLimited),
    ("ResourceInUse", ErrorClass::Conflict),
    ("ResourceBusy", ErrorClass::Conflict),
    ("ResourceUnavailable", ErrorClass::Conflict),
    ("OperationDenied", ErrorClass::Conflict),
    ("FailedOperation.StatusConflict", ErrorClass::Conflict),
    ("ResourceNotFound", ErrorClass::NotFound),
    ("InvalidParameter", ErrorClass::InvalidInput),
    ("InvalidParameterValue", ErrorClass::InvalidInput),
    ("MissingParameter", ErrorClass::InvalidInput),
    ("UnknownParameter", ErrorClass::InvalidInput),
    ("InvalidAction", ErrorClass::InvalidInput),
    ("AuthFailure", ErrorClass::InvalidInput),
    ("UnauthorizedOperation", ErrorClass::InvalidInput),
    ("UnsupportedOperation", ErrorClass::InvalidInput),
    // Quota, not throttling: retrying cannot help
    ("LimitExceeded", ErrorClass::InvalidInput),
];

/// Code-and-status classifier; extra rules override the built-in table
#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier {
    rules: HashMap<String, ErrorClass>,
}

impl ErrorClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, code: &str, class: ErrorClass) -> Self {
        self.rules.insert(code.to_string(), class);
        self
    }

    pub fn classify(&self, failure: &RemoteFailure) -> ErrorClass {
        if let Some(class) = self.classify_code(failure.code.trim()) {
            return class;
        }
        if let Some(class) = failure.status.and_then(classify_status) {
            return class;
        }
        ErrorClass::Unknown
    }

    fn classify_code(&self, code: &str) -> Option<ErrorClass> {
        if code.is_empty() {
            return None;
        }
        let mut candidate = code;
        loop {
            if let Some(class) = self.lookup(candidate) {
                return Some(class);
            }
            match candidate.rfind('.') {
                Some(idx) => candidate = &candidate[..idx],
                None => break,
            }
        }
        // e.g. InvalidInstanceId.NotFound
        if code.ends_with("NotFound") {
            return Some(ErrorClass::NotFound);
        }
        None
    }

    fn lookup(&self, code: &str) -> Option<ErrorClass> {
        if let Some(class) = self.rules.get(code) {
            return Some(*class);
        }
        CODE_RULES
            .iter()
            .find(|(rule, _)| *rule == code)
            .map(|(_, class)| *class)
    }
}

fn classify_status(status: u16) -> Option<ErrorClass> {
    match status {
        404 | 410 => Some(ErrorClass::NotFound),
        408 => Some(ErrorClass::Transient),
        409 => Some(ErrorClass::Conflict),
        429 => Some(ErrorClass::RateLimited),
        400..=499 => Some(ErrorClass::InvalidInput),
        500..=599 => Some(ErrorClass::Transient),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(code: &str) -> ErrorClass {
        ErrorClassifier::default().classify(&RemoteFailure::new(code, "test"))
    }

    #[test]
    fn test_code_table() {
        assert_eq!(classify("InternalError"), ErrorClass::Transient);
        assert_eq!(classify("InternalError.DbError"), ErrorClass::Transient);
        assert_eq!(classify("RequestLimitExceeded.UinLimitExceeded"), ErrorClass::RateLimited);
        assert_eq!(classify("ResourceInUse.InstanceStatus"), ErrorClass::Conflict);
        assert_eq!(classify("ResourceNotFound"), ErrorClass::NotFound);
        assert_eq!(classify("InvalidInstanceId.NotFound"), ErrorClass::NotFound);
        assert_eq!(classify("AuthFailure.SignatureExpire"), ErrorClass::InvalidInput);
        assert_eq!(classify("LimitExceeded.Quota"), ErrorClass::InvalidInput);
    }

    #[test]
    fn test_status_fallback() {
        let classifier = ErrorClassifier::default();
        let with_status = |status| RemoteFailure::new("", "").with_status(status);
        assert_eq!(classifier.classify(&with_status(503)), ErrorClass::Transient);
        assert_eq!(classifier.classify(&with_status(429)), ErrorClass::RateLimited);
        assert_eq!(classifier.classify(&with_status(409)), ErrorClass::Conflict);
        assert_eq!(classifier.classify(&with_status(404)), ErrorClass::NotFound);
        assert_eq!(classifier.classify(&with_status(403)), ErrorClass::InvalidInput);
        assert_eq!(classifier.classify(&with_status(302)), ErrorClass::Unknown);
    }

    #[test]
    fn test_code_wins_over_status() {
        let failure = RemoteFailure::new("ResourceInUse", "busy").with_status(400);
        assert_eq!(ErrorClassifier::default().classify(&failure), ErrorClass::Conflict);
    }

    #[test]
    fn test_unrecognized_code_is_unknown() {
        assert_eq!(classify("SomethingNew.Entirely"), ErrorClass::Unknown);
        assert_eq!(classify(""), ErrorClass::Unknown);
    }

    #[test]
    fn test_custom_rule_overrides_builtin() {
        let classifier = ErrorClassifier::new()
            .with_rule("FailedOperation.Timeout", ErrorClass::Conflict)
            .with_rule("FailedOperation.InstanceInitializing", ErrorClass::Conflict);
        let failure = RemoteFailure::new("FailedOperation.Timeout", "");
        assert_eq!(classifier.classify(&failure), ErrorClass::Conflict);
        let failure = RemoteFailure::new("FailedOperation.InstanceInitializing", "");
        assert_eq!(classifier.classify(&failure), ErrorClass::Conflict);
    }
}
