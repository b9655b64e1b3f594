use hmac::{Hmac, Mac};
use sha2::Sha256;

pub const SIGNATURE_HEADER: &str = "X-OpenStatus-Signature";
pub const TIMESTAMP_HEADER: &str = "X-OpenStatus-Timestamp";

/// Sign a webhook body with HMAC-SHA256 over `"{timestamp}.{body}"`.
pub fn sign_payload(secret: &str, timestamp: i64, body: &str) -> String {
    let data = format!("{}.{}", timestamp, body);
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC-SHA256 accepts any key length");
    mac.update(data.as_bytes());
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Receiver-side check for [`sign_payload`].
pub fn verify_signature(secret: &str, timestamp: i64, body: &str, signature: &str) -> bool {
    let expected = sign_payload(secret, timestamp, body);
    subtle::ConstantTimeEq::ct_eq(expected.as_bytes(), signature.as_bytes()).into()
}
