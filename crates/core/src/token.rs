use nanoid::nanoid;

/// Length of subscription tokens. 32 symbols from nanoid's 64-symbol
/// alphabet gives 192 bits.
pub const TOKEN_LEN: usize = 32;

/// Generate a subscription token.
///
/// The token is both the lookup key and the bearer credential for verify,
/// manage and unsubscribe links, so it must come from a CSPRNG. nanoid draws
/// from `rand`'s thread-local ChaCha generator seeded by the OS.
pub fn generate_token() -> String {
    nanoid!(TOKEN_LEN)
}

/// Constant-time comparison for bearer secrets.
pub fn secrets_match(expected: &str, provided: &str) -> bool {
    subtle::ConstantTimeEq::ct_eq(expected.as_bytes(), provided.as_bytes()).into()
}
