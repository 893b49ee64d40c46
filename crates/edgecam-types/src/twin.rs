//! Device twin documents exchanged with the cloud broker.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{EdgecamError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TwinUpdateKind {
    /// Full twin document (`{"desired": .., "reported": ..}`).
    Complete,
    /// Desired-properties patch, already wrapped as `{"desired": <patch>}`.
    Partial,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TwinUpdate {
    pub kind: TwinUpdateKind,
    pub payload: String,
}

impl TwinUpdate {
    pub fn complete(payload: impl Into<String>) -> Self {
        Self {
            kind: TwinUpdateKind::Complete,
            payload: payload.into(),
        }
    }

    /// Wrap a bare desired-properties patch into the complete-document shape.
    pub fn from_desired_patch(patch: &[u8]) -> Result<Self> {
        let desired: Value = serde_json::from_slice(patch)
            .map_err(|err| EdgecamError::TwinParse(format!("malformed desired patch: {err}")))?;
        let payload = serde_json::json!({ "desired": desired }).to_string();
        Ok(Self {
            kind: TwinUpdateKind::Partial,
            payload,
        })
    }
}

/// State echoed back to the twin service after a successful update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedState {
    pub timezone: i32,
}

impl ReportedState {
    pub fn to_json(&self) -> String {
        serde_json::json!({ "timezone": self.timezone }).to_string()
    }
}

/// Extract `desired.timezone` from a twin document as its textual form.
///
/// Strings are returned as-is. Numbers are rendered as a decimal integer,
/// fractions truncated toward zero; range validation happens when the value
/// is applied.
pub fn desired_timezone(payload: &str) -> Result<String> {
    let doc: Value = serde_json::from_str(payload)
        .map_err(|err| EdgecamError::TwinParse(format!("malformed twin payload: {err}")))?;
    let value = doc
        .get("desired")
        .and_then(|desired| desired.get("timezone"))
        .ok_or_else(|| EdgecamError::TwinParse("desired.timezone is missing".into()))?;

    match value {
        Value::String(raw) => Ok(raw.clone()),
        Value::Number(number) => number
            .as_i64()
            .or_else(|| {
                number
                    .as_f64()
                    .filter(|value| value.is_finite())
                    .map(|value| value.trunc() as i64)
            })
            .map(|hours| hours.to_string())
            .ok_or_else(|| {
                EdgecamError::TwinParse(format!("desired.timezone {number} is out of range"))
            }),
        other => Err(EdgecamError::TwinParse(format!(
            "desired.timezone has unsupported type: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_string_and_numeric_timezone() {
        assert_eq!(
            desired_timezone(r#"{"desired":{"timezone":"5"}}"#).unwrap(),
            "5"
        );
        assert_eq!(
            desired_timezone(r#"{"desired":{"timezone":-3,"$version":2}}"#).unwrap(),
            "-3"
        );
    }

    #[test]
    fn fractional_timezone_truncates_toward_zero() {
        assert_eq!(
            desired_timezone(r#"{"desired":{"timezone":5.0}}"#).unwrap(),
            "5"
        );
        assert_eq!(
            desired_timezone(r#"{"desired":{"timezone":-3.7}}"#).unwrap(),
            "-3"
        );
    }

    #[test]
    fn rejects_missing_or_malformed_timezone() {
        assert!(desired_timezone(r#"{"desired":{}}"#).is_err());
        assert!(desired_timezone(r#"{"reported":{"timezone":1}}"#).is_err());
        assert!(desired_timezone("not json").is_err());
        assert!(desired_timezone(r#"{"desired":{"timezone":null}}"#).is_err());
    }

    #[test]
    fn desired_patch_is_wrapped() {
        let update = TwinUpdate::from_desired_patch(br#"{"timezone":2,"$version":7}"#).unwrap();
        assert_eq!(update.kind, TwinUpdateKind::Partial);
        assert_eq!(desired_timezone(&update.payload).unwrap(), "2");
    }

    #[test]
    fn reported_state_serializes_as_bare_object() {
        assert_eq!(ReportedState { timezone: 5 }.to_json(), r#"{"timezone":5}"#);
    }
}
