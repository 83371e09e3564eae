/// Config of a capture Engine. It's shared by every request the Engine wraps,
/// and each request context holds an immutable reference to it.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Customer identifier issued by the collector. Must be non-empty.
    pub customer_id: String,
    /// Codebase identifier chosen by the customer. Must be non-empty.
    pub codebase_id: String,
    /// When true, request bodies are never buffered or reported.
    #[serde(default)]
    pub exclude_request_body: bool,
    /// Environment which is attached to every report.
    /// A blank environment is the default environment.
    #[serde(
        default = "default_environment",
        deserialize_with = "deserialize_environment"
    )]
    pub environment: String,
    /// Maximum number of body bytes which are buffered for a report.
    /// Larger bodies are still delivered in full, but only a prefix is reported.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Lower-cased request header names whose values are redacted in reports.
    #[serde(default = "default_redact_headers")]
    pub redact_headers: Vec<String>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("customerId must be a non-empty string")]
    MissingCustomerId,
    #[error("codebaseId must be a non-empty string")]
    MissingCodebaseId,
    #[error("maxBodyBytes must be greater than zero")]
    ZeroBodyLimit,
}

pub const DEFAULT_ENVIRONMENT: &str = "production";

fn default_environment() -> String {
    DEFAULT_ENVIRONMENT.to_string()
}

fn deserialize_environment<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let environment = <String as serde::Deserialize>::deserialize(deserializer)?;
    Ok(if environment.trim().is_empty() {
        default_environment()
    } else {
        environment
    })
}

fn default_max_body_bytes() -> usize {
    1 << 20 // 1MB.
}

fn default_redact_headers() -> Vec<String> {
    ["authorization", "cookie", "proxy-authorization"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Config {
    /// Build a Config with the given identifiers and defaults for all else.
    pub fn new(customer_id: impl Into<String>, codebase_id: impl Into<String>) -> Self {
        Self {
            customer_id: customer_id.into(),
            codebase_id: codebase_id.into(),
            exclude_request_body: false,
            environment: default_environment(),
            max_body_bytes: default_max_body_bytes(),
            redact_headers: default_redact_headers(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.customer_id.trim().is_empty() {
            return Err(ConfigError::MissingCustomerId);
        }
        if self.codebase_id.trim().is_empty() {
            return Err(ConfigError::MissingCodebaseId);
        }
        if self.max_body_bytes == 0 {
            return Err(ConfigError::ZeroBodyLimit);
        }
        Ok(())
    }

    /// Environment which is attached to reports, which is the
    /// default environment if `environment` is blank.
    pub fn report_environment(&self) -> &str {
        if self.environment.trim().is_empty() {
            DEFAULT_ENVIRONMENT
        } else {
            &self.environment
        }
    }

    pub fn is_redacted(&self, header: &str) -> bool {
        self.redact_headers
            .iter()
            .any(|name| name.eq_ignore_ascii_case(header))
    }
}
