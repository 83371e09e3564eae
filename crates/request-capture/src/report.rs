use crate::{CapturedMessage, Config, EndUserState, ErrorReport, RequestSnapshot};

/// DiagnosticReport is the complete account of a failed request which is handed to a Dispatcher.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticReport {
    /// Unique identifier of the request execution.
    pub request_id: uuid::Uuid,
    /// Time at which the report was assembled.
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub request: RequestSnapshot,
    /// Body of the failed response, or the non-error value a handler panicked with.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resp_body: Option<serde_json::Value>,
    pub status_code: u16,
    /// Output captured while the request was handled, in emission order.
    pub messages: Vec<CapturedMessage>,
    pub is_uncaught_exception: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
    #[serde(skip_serializing_if = "EndUserState::is_unset")]
    pub end_user: EndUserState,
    pub config: ReportConfig,
}

/// ReportConfig is the subset of Config which identifies the source of a report.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportConfig {
    pub customer_id: String,
    pub codebase_id: String,
    pub environment: String,
    pub exclude_request_body: bool,
}

impl From<&Config> for ReportConfig {
    fn from(config: &Config) -> Self {
        Self {
            customer_id: config.customer_id.clone(),
            codebase_id: config.codebase_id.clone(),
            environment: config.report_environment().to_string(),
            exclude_request_body: config.exclude_request_body,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::EndUser;
    use serde_json::json;

    fn fixture() -> DiagnosticReport {
        DiagnosticReport {
            request_id: uuid::Uuid::nil(),
            timestamp: chrono::TimeZone::timestamp_opt(&chrono::Utc, 0, 0).unwrap(),
            request: RequestSnapshot {
                method: "GET".to_string(),
                url: "/widgets".to_string(),
                ..Default::default()
            },
            resp_body: Some(json!({"error": "not found"})),
            status_code: 404,
            messages: Vec::new(),
            is_uncaught_exception: false,
            error: None,
            end_user: EndUserState::Unset,
            config: (&Config::new("cust", "code")).into(),
        }
    }

    #[test]
    fn test_report_wire_shape() {
        insta::assert_json_snapshot!(fixture(), @r###"
        {
          "requestId": "00000000-0000-0000-0000-000000000000",
          "timestamp": "1970-01-01T00:00:00Z",
          "request": {
            "method": "GET",
            "url": "/widgets"
          },
          "respBody": {
            "error": "not found"
          },
          "statusCode": 404,
          "messages": [],
          "isUncaughtException": false,
          "config": {
            "customerId": "cust",
            "codebaseId": "code",
            "environment": "production",
            "excludeRequestBody": false
          }
        }
        "###);
    }

    #[test]
    fn test_end_user_states() {
        let mut report = fixture();

        let value = serde_json::to_value(&report).unwrap();
        assert!(value.get("endUser").is_none());

        report.end_user = EndUserState::Cleared;
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value.get("endUser"), Some(&serde_json::Value::Null));

        report.end_user = EndUserState::Set(EndUser {
            id: Some("42".to_string()),
            extra: [("plan".to_string(), json!("pro"))].into_iter().collect(),
            ..Default::default()
        });
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["endUser"], json!({"id": "42", "plan": "pro"}));
    }

    #[test]
    fn test_blank_environment_is_reported_as_default() {
        let mut config = Config::new("cust", "code");
        config.environment = " ".to_string();
        assert_eq!(ReportConfig::from(&config).environment, "production");

        config.environment = "staging".to_string();
        assert_eq!(ReportConfig::from(&config).environment, "staging");
    }
}
