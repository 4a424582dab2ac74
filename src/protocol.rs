//! Wire types shared by the dispatcher and the in-container executor
//! service.
//!
//! The executor response body is [`ExecutionResult`](crate::job::ExecutionResult).

use serde::{Deserialize, Serialize};

/// Body of `POST /` sent to the executor service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub code: String,
    pub language: String,
    pub timeout_ms: u64,
}

/// Error body returned with a 4xx status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_uses_camel_case_keys() {
        let req = ExecuteRequest {
            code: "print(1)".into(),
            language: "python".into(),
            timeout_ms: 2000,
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"code": "print(1)", "language": "python", "timeoutMs": 2000})
        );
    }

    #[test]
    fn test_response_keys_match_executor_output() {
        let result = crate::job::ExecutionResult {
            stdout: "out".into(),
            stderr: "err".into(),
            combined: "outerr".into(),
            is_error: true,
            timed_out: false,
            killed_by_container: false,
        };
        let value = serde_json::to_value(&result).unwrap();
        for key in [
            "stdout",
            "stderr",
            "combined",
            "isError",
            "timedOut",
            "killedByContainer",
        ] {
            assert!(value.get(key).is_some(), "missing key {key}");
        }
    }
}
