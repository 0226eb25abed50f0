//! Helpers shared by unit and integration tests.

use crate::traits::ConnectorConfig;
use serde_json::{json, Value};

/// Connector settings for a mock server: no auth and no retries.
pub fn test_connector_config(name: &str, base_url: &str) -> ConnectorConfig {
    ConnectorConfig::new(name, base_url).with_max_retries(0)
}

/// Instance parameters pointing `url_key` at a mock server, with retries disabled.
pub fn mock_params(url_key: &str, base_url: &str, extra: Value) -> Value {
    let mut params = json!({ url_key: base_url, "max_retries": 0, "timeout_secs": 5 });
    if let (Some(target), Value::Object(extra)) = (params.as_object_mut(), extra) {
        target.extend(extra);
    }
    params
}
