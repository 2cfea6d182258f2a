//! Header template rendering

use ring::rand::{SecureRandom, SystemRandom};
use std::time::{SystemTime, UNIX_EPOCH};

/// Values substituted into header templates
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Destination host (`{host}`)
    pub host: String,
    /// Unix seconds (`{timestamp}`)
    pub timestamp: u64,
    /// Random hex token (`{request_id}`)
    pub request_id: String,
}

impl RequestContext {
    /// Context for a request sent now
    pub fn new(host: impl Into<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        Self {
            host: host.into(),
            timestamp,
            request_id: request_id(),
        }
    }
}

/// Substitute placeholders in a header value template
pub fn render(template: &str, ctx: &RequestContext) -> String {
    if !template.contains('{') {
        return template.to_string();
    }

    template
        .replace("{host}", &ctx.host)
        .replace("{timestamp}", &ctx.timestamp.to_string())
        .replace("{request_id}", &ctx.request_id)
}

/// 16 random bytes as lowercase hex
pub fn request_id() -> String {
    let mut buf = [0u8; 16];
    if SystemRandom::new().fill(&mut buf).is_err() {
        // Entropy source unavailable; fall back to the clock
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        buf = nanos.to_be_bytes();
    }
    buf.iter().map(|b| format!("{:02x}", b)).collect()
}
