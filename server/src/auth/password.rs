use pbkdf2::pbkdf2_hmac;
use rand::Rng;
use sha2::Sha512_256;
use subtle::ConstantTimeEq;

/// Salt length in bytes (random per user).
pub const SALT_LEN: usize = 16;

/// Derived key length in bytes.
pub const KEY_LEN: usize = 32;

/// Default PBKDF2 iteration count for new registrations.
pub const DEFAULT_ITERATIONS: u32 = 100_000;

/// Generate a fresh random salt.
pub fn generate_salt() -> [u8; SALT_LEN] {
    rand::rng().random()
}

/// Derive the stored password key: PBKDF2-HMAC-SHA512/256.
pub fn derive_key(password: &str, salt: &[u8], iterations: u32) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha512_256>(password.as_bytes(), salt, iterations, &mut key);
    key
}

/// Re-derive the key for `password` and compare it to `expected` in constant time.
pub fn verify_password(password: &str, salt: &[u8], iterations: u32, expected: &[u8]) -> bool {
    let derived = derive_key(password, salt, iterations);
    derived.as_slice().ct_eq(expected).into()
}

/// Burn one key derivation for a login whose username does not exist, so the
/// response time does not reveal whether the account is registered.
pub fn simulate_verification(password: &str, iterations: u32) {
    let _ = derive_key(password, &[0u8; SALT_LEN], iterations);
}
