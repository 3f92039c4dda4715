// Shared helpers for the HTTP clients

/// Get machine fingerprint for User-Agent
fn machine_fingerprint() -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    let mut hasher = DefaultHasher::new();
    hostname.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

/// User-Agent sent with every request, identifies the harness and the test host
pub fn user_agent() -> String {
    format!(
        "transport-api-harness/{} ({})",
        env!("CARGO_PKG_VERSION"),
        machine_fingerprint()
    )
}

/// Categorize a reqwest error for logs and error messages
pub fn transport_error_kind(e: &reqwest::Error) -> &'static str {
    if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "connection_failed"
    } else if e.is_request() {
        "request_error"
    } else if e.is_body() {
        "body_error"
    } else if e.is_decode() {
        "decode_error"
    } else {
        "unknown"
    }
}
