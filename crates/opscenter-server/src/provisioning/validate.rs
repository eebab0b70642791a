//! Input validation shared by the lifecycle operations.

use reqwest::Url;

use crate::error::{FleetError, FleetResult};

const MAX_NAME_LEN: usize = 63;

/// Names are host labels: `[A-Za-z0-9-]`, 1 to 63 characters.
pub fn validate_name(kind: &str, name: &str) -> FleetResult<()> {
    if name.is_empty() {
        return Err(FleetError::InvalidArgument(format!("{kind} name is empty")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(FleetError::InvalidArgument(format!(
            "{kind} name longer than {MAX_NAME_LEN} characters"
        )));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(FleetError::InvalidArgument(format!(
            "{kind} name {name:?} may only contain letters, digits and '-'"
        )));
    }
    Ok(())
}

/// Connection URLs must parse as `https` URLs with a host.
pub fn validate_connection_url(url: &str) -> FleetResult<()> {
    let invalid =
        |reason: &str| FleetError::InvalidArgument(format!("connection_url {url:?} {reason}"));
    if url.chars().any(char::is_whitespace) {
        return Err(invalid("contains whitespace"));
    }
    let parsed = Url::parse(url).map_err(|e| invalid(&format!("is not a URL: {e}")))?;
    if parsed.scheme() != "https" {
        return Err(invalid("is not an https URL"));
    }
    if parsed.host().is_none() {
        return Err(invalid("has no host"));
    }
    Ok(())
}

/// Opaque configs and facts must be JSON; empty input becomes `{}`.
pub fn normalize_json(field: &str, raw: &str) -> FleetResult<String> {
    if raw.trim().is_empty() {
        return Ok("{}".to_string());
    }
    serde_json::from_str::<serde_json::Value>(raw)
        .map(|_| raw.to_string())
        .map_err(|e| FleetError::InvalidArgument(format!("{field} is not valid JSON: {e}")))
}
