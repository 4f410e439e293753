//! Frame payloads sent from worker to engine.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::task::{ErrorSummary, Outcome, TaskId};

/// Terminal state of a task as reported by its worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireOutcome<T> {
    /// The task returned a value.
    Value(T),
    /// The task asked for nothing to be reported.
    NoResult,
    /// The task failed.
    Raised(ErrorSummary),
}

impl<T> WireOutcome<T> {
    /// Whether losing this outcome on a broken pipe is acceptable.
    pub fn is_skippable(&self) -> bool {
        matches!(self, WireOutcome::NoResult)
    }
}

impl<T> From<WireOutcome<T>> for Outcome<T> {
    fn from(outcome: WireOutcome<T>) -> Self {
        match outcome {
            WireOutcome::Value(value) => Outcome::Value(value),
            WireOutcome::NoResult => Outcome::NoResult,
            WireOutcome::Raised(summary) => Outcome::Raised(summary),
        }
    }
}

/// One `(submission id, outcome)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireFrame<T> {
    /// Submission the outcome belongs to.
    pub id: TaskId,
    /// What the task produced.
    pub outcome: WireOutcome<T>,
}

/// Serialize a frame payload.
pub fn encode_message<T: Serialize>(frame: &WireFrame<T>) -> Result<Vec<u8>> {
    bincode::serialize(frame)
        .map_err(|e| Error::Serialization(format!("Failed to encode result frame: {}", e)))
}

/// Deserialize a frame payload.
pub fn decode_message<T: DeserializeOwned>(bytes: &[u8]) -> Result<WireFrame<T>> {
    bincode::deserialize(bytes)
        .map_err(|e| Error::Deserialization(format!("Failed to decode result frame: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_no_result_roundtrip() {
        let frame: WireFrame<String> = WireFrame {
            id: TaskId::new(9),
            outcome: WireOutcome::NoResult,
        };
        let bytes = encode_message(&frame).unwrap();
        assert_eq!(decode_message::<String>(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_raised_roundtrip() {
        let frame: WireFrame<u64> = WireFrame {
            id: TaskId::new(3),
            outcome: WireOutcome::Raised(ErrorSummary::new(
                "ZeroDivisionError",
                "division by zero",
                "at line 1",
            )),
        };
        let bytes = encode_message(&frame).unwrap();
        let decoded = decode_message::<u64>(&bytes).unwrap();
        match decoded.outcome {
            WireOutcome::Raised(summary) => {
                assert_eq!(summary.kind_name, "ZeroDivisionError");
                assert_eq!(summary.rendered_trace, "at line 1");
            }
            other => panic!("expected raised, got {:?}", other),
        }
    }

    #[test]
    fn test_structured_value_roundtrip() {
        let mut value = BTreeMap::new();
        value.insert("alpha".to_string(), vec![1i64, -2, 3]);
        value.insert("beta".to_string(), vec![]);

        let frame = WireFrame {
            id: TaskId::new(1),
            outcome: WireOutcome::Value(value.clone()),
        };
        let bytes = encode_message(&frame).unwrap();
        let decoded: WireFrame<BTreeMap<String, Vec<i64>>> = decode_message(&bytes).unwrap();
        assert_eq!(Outcome::from(decoded.outcome), Outcome::Value(value));
    }

    #[test]
    fn test_truncated_payload_is_rejected() {
        let frame = WireFrame {
            id: TaskId::new(1),
            outcome: WireOutcome::Value("hello".to_string()),
        };
        let bytes = encode_message(&frame).unwrap();
        let result = decode_message::<String>(&bytes[..bytes.len() - 2]);
        assert!(matches!(result, Err(Error::Deserialization(_))));
    }
}
