//! Facade wire payloads
//!
//! Serde shapes for the batched request/response protocol. Every bulk call
//! carries an ordered list of identifiers (or value records) and returns an
//! ordered list of per-element results, each independently a value or a
//! structured error. Whole-call transport failures are a different type
//! entirely ([`crate::error::Error::Transport`]) and never appear here.

use crate::domain::tags::{AttachmentId, Tag};
use crate::error::{ApiError, Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Object kind every engine call is addressed to.
pub const FACADE_NAME: &str = "StorageProvisioner";

/// Facade version the engine speaks.
pub const FACADE_VERSION: u32 = 1;

// =============================================================================
// Request Envelope
// =============================================================================

/// Identifies one facade call: (object-kind, version, scope instance,
/// operation-name). The argument payload travels separately as JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request<'a> {
    pub object: &'a str,
    pub version: u32,
    /// Scope instance the call is issued for: `model` or a machine tag.
    pub scope: &'a str,
    pub operation: &'a str,
}

// =============================================================================
// Argument Containers
// =============================================================================

/// Bulk argument: an ordered list of entity tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entities {
    pub entities: Vec<Entity>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub tag: Tag,
}

impl Entities {
    pub fn from_tags(tags: &[Tag]) -> Self {
        Self {
            entities: tags.iter().cloned().map(|tag| Entity { tag }).collect(),
        }
    }
}

/// Bulk argument: an ordered list of (machine, storage entity) pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineStorageIds {
    pub ids: Vec<AttachmentId>,
}

impl MachineStorageIds {
    pub fn from_ids(ids: &[AttachmentId]) -> Self {
        Self { ids: ids.to_vec() }
    }
}

/// Bulk argument: an ordered list of value records for a write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Records<T> {
    pub records: Vec<T>,
}

impl<T: Clone> Records<T> {
    pub fn new(records: &[T]) -> Self {
        Self {
            records: records.to_vec(),
        }
    }
}

// =============================================================================
// Result Containers
// =============================================================================

/// One element of a bulk result: a value or a structured error, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementResult<T> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl<T> ElementResult<T> {
    pub fn ok(value: T) -> Self {
        Self {
            result: Some(value),
            error: None,
        }
    }

    pub fn err(error: ApiError) -> Self {
        Self {
            result: None,
            error: Some(error),
        }
    }

    /// The element's value, or its error. A reply carrying neither is a
    /// controller bug and surfaces as an internal error.
    pub fn into_value(self) -> std::result::Result<T, ApiError> {
        match (self.result, self.error) {
            (_, Some(err)) => Err(err),
            (Some(value), None) => Ok(value),
            (None, None) => Err(ApiError::new("internal", "result carried no value")),
        }
    }
}

/// A write acknowledgement: per-element success or error.
pub type AckResult = ElementResult<()>;

impl AckResult {
    pub fn succeeded() -> Self {
        Self {
            result: None,
            error: None,
        }
    }

    /// Write acknowledgements carry no value; absence of an error means
    /// the element succeeded.
    pub fn into_ack(self) -> std::result::Result<(), ApiError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// The ordered per-element results of one bulk call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResults<T> {
    pub results: Vec<ElementResult<T>>,
}

impl<T> BatchResults<T> {
    /// Input order is preserved on output; a length mismatch means the
    /// reply cannot be correlated with the request and the whole batch is
    /// unresolved.
    pub fn expect_len(self, expected: usize, operation: &str) -> Result<Vec<ElementResult<T>>> {
        if self.results.len() != expected {
            return Err(Error::BatchShape {
                operation: operation.to_string(),
                expected,
                got: self.results.len(),
            });
        }
        Ok(self.results)
    }
}

/// Decode a bulk reply and check its shape in one step.
pub fn decode_batch<T: DeserializeOwned>(
    reply: serde_json::Value,
    expected: usize,
    operation: &str,
) -> Result<Vec<ElementResult<T>>> {
    let batch: BatchResults<T> = serde_json::from_value(reply)?;
    batch.expect_len(expected, operation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::tags::Life;
    use crate::error::codes;
    use assert_matches::assert_matches;

    #[test]
    fn test_entities_shape() {
        let args = Entities::from_tags(&[Tag::volume("100")]);
        let json = serde_json::to_value(&args).unwrap();
        assert_eq!(json["entities"][0]["tag"], "volume-100");
    }

    #[test]
    fn test_element_result_value_or_error() {
        let ok: ElementResult<Life> = ElementResult::ok(Life::Alive);
        assert_eq!(ok.into_value().unwrap(), Life::Alive);

        let err: ElementResult<Life> = ElementResult::err(ApiError::new(codes::NOT_FOUND, "gone"));
        assert_eq!(err.into_value().unwrap_err().code, codes::NOT_FOUND);

        let empty: ElementResult<Life> = ElementResult {
            result: None,
            error: None,
        };
        assert_eq!(empty.into_value().unwrap_err().code, "internal");
    }

    #[test]
    fn test_ack_absence_of_error_is_success() {
        let ack = AckResult::succeeded();
        assert!(ack.into_ack().is_ok());

        let nack = AckResult::err(ApiError::new("621", "MSG"));
        assert_eq!(nack.into_ack().unwrap_err().message, "MSG");
    }

    #[test]
    fn test_batch_shape_mismatch_is_whole_call_error() {
        let batch: BatchResults<Life> = BatchResults {
            results: vec![ElementResult::ok(Life::Alive)],
        };
        assert_matches!(
            batch.expect_len(2, "Life"),
            Err(Error::BatchShape { expected: 2, got: 1, .. })
        );
    }

    #[test]
    fn test_decode_batch_from_wire() {
        // Life has no Default impl; decoding must not require one, and an
        // element with both fields absent decodes and reports internal.
        let reply = serde_json::json!({
            "results": [
                { "result": "alive" },
                { "error": { "code": "not-found", "message": "no such volume" } },
                {},
            ]
        });
        let results: Vec<ElementResult<Life>> = decode_batch(reply, 3, "Life").unwrap();
        assert_eq!(results[0].clone().into_value().unwrap(), Life::Alive);
        assert!(results[1].clone().into_value().unwrap_err().is_not_found());
        assert_eq!(results[2].clone().into_value().unwrap_err().code, "internal");
    }
}
