use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::SubscriptionError;

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email pattern compiles")
});

/// Trim and lowercase, then check the shape `local@domain.tld`.
pub fn normalize_email(raw: &str) -> Result<String, SubscriptionError> {
    let email = raw.trim().to_lowercase();
    if email.len() > 254 || !EMAIL_RE.is_match(&email) {
        return Err(SubscriptionError::InvalidEmail);
    }
    Ok(email)
}

/// `jane@acme.com` becomes `j***@acme.com`. Only the first character of the
/// local part survives, so the address cannot be rebuilt from the output.
pub fn mask_email(email: &str) -> String {
    match email.rsplit_once('@') {
        Some((local, domain)) => {
            let first = local.chars().next().map(String::from).unwrap_or_default();
            format!("{}***@{}", first, domain)
        }
        None => "***".to_string(),
    }
}
