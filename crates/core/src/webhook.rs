//! Pure validation of webhook targets. No I/O.

use url::Url;

use crate::signing::{SIGNATURE_HEADER, TIMESTAMP_HEADER};
use crate::types::WebhookConfig;

pub const USER_AGENT: &str = "OpenStatus-Webhooks/1.0";

const RESERVED_HEADERS: [&str; 4] = [
    "content-type",
    "user-agent",
    SIGNATURE_HEADER,
    TIMESTAMP_HEADER,
];

pub fn validate_url(raw: &str, production: bool) -> Result<Url, String> {
    let url = Url::parse(raw.trim()).map_err(|err| format!("invalid url: {}", err))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err("url must start with http:// or https://".to_string());
    }
    let host = url.host_str().unwrap_or_default();
    if host.is_empty() {
        return Err("url must include a host".to_string());
    }
    if production && (host == "localhost" || host == "127.0.0.1" || host == "[::1]") {
        return Err("url cannot target localhost in production".to_string());
    }
    Ok(url)
}

pub fn validate_config(config: &WebhookConfig) -> Result<(), String> {
    for header in &config.headers {
        let key = header.key.trim();
        if key.is_empty() || !key.bytes().all(is_token_byte) {
            return Err(format!("invalid header name: {:?}", header.key));
        }
        if RESERVED_HEADERS
            .iter()
            .any(|reserved| reserved.eq_ignore_ascii_case(key))
        {
            return Err(format!("header {} cannot be overridden", key));
        }
        if header
            .value
            .bytes()
            .any(|b| b == b'\r' || b == b'\n' || b == 0 || b == 0x7f)
        {
            return Err(format!("invalid value for header {}", key));
        }
    }
    if let Some(secret) = config.secret.as_deref() {
        if secret.trim().is_empty() {
            return Err("secret cannot be blank".to_string());
        }
    }
    Ok(())
}

// RFC 9110 token characters
fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}
