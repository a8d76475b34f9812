use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore as _;
use rsa::{
    pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding},
    Oaep, RsaPrivateKey, RsaPublicKey,
};
use sha2::{Digest as _, Sha256};

use crate::error::{AppError, AppResult};

const ACTIVITY_KEY_BITS: usize = 2048;
const CHALLENGE_NONCE_BYTES: usize = 32;

/// A freshly generated activity keypair, PEM-encoded.
///
/// The private half leaves the server exactly once, sealed to the client's
/// memo key, and is never persisted.
pub struct ActivityKeypair {
    pub public_pem: String,
    pub private_pem: String,
}

/// Generates a new RSA-2048 activity keypair.
///
/// Key generation is CPU-heavy; callers on the request path should wrap
/// this in `spawn_blocking`.
pub fn generate_activity_keypair() -> AppResult<ActivityKeypair> {
    let mut rng = OsRng;
    let private_key = RsaPrivateKey::new(&mut rng, ACTIVITY_KEY_BITS)
        .map_err(|e| AppError::Internal(format!("activity key generation failed: {e}")))?;
    let public_key = RsaPublicKey::from(&private_key);

    let private_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| AppError::Internal(format!("private key encoding failed: {e}")))?
        .to_string();
    let public_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| AppError::Internal(format!("public key encoding failed: {e}")))?;

    Ok(ActivityKeypair {
        public_pem,
        private_pem,
    })
}

/// SHA-256 of the input, hex-encoded.
pub fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}

/// `n_bytes` of OS randomness, hex-encoded.
pub fn random_hex(n_bytes: usize) -> String {
    let mut buf = vec![0u8; n_bytes];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Encrypts `plaintext` under a PEM public key with RSA-OAEP-SHA256 and
/// returns it base64-encoded.
pub fn seal(public_pem: &str, plaintext: &[u8]) -> AppResult<String> {
    let public_key = RsaPublicKey::from_public_key_pem(public_pem)
        .map_err(|e| AppError::Internal(format!("bad activity public key: {e}")))?;
    let ciphertext = public_key
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext)
        .map_err(|e| AppError::Internal(format!("activity encryption failed: {e}")))?;
    Ok(B64.encode(ciphertext))
}

/// A parsed activity private key, shared across decryption workers.
#[derive(Clone)]
pub struct ActivityPrivateKey(RsaPrivateKey);

impl ActivityPrivateKey {
    pub fn from_pem(private_pem: &str) -> Option<Self> {
        RsaPrivateKey::from_pkcs8_pem(private_pem).ok().map(Self)
    }

    /// Decrypts a base64 RSA-OAEP ciphertext. Any failure — bad base64,
    /// wrong key, corrupt ciphertext — yields `None`; a record sealed to
    /// another keypair generation is an expected case, not an error.
    pub fn open(&self, ciphertext_b64: &str) -> Option<Vec<u8>> {
        let ciphertext = B64.decode(ciphertext_b64.as_bytes()).ok()?;
        self.0.decrypt(Oaep::new::<Sha256>(), &ciphertext).ok()
    }
}

/// Challenge-response check that `private_pem` matches `public_pem`:
/// encrypt a random nonce under the stored public key, decrypt it with the
/// candidate private key, compare. Returns `false` on any failure, never
/// an error, so a malformed key cannot take down the request.
pub fn verify_activity_key(private_pem: &str, public_pem: &str) -> bool {
    let Ok(public_key) = RsaPublicKey::from_public_key_pem(public_pem) else {
        return false;
    };
    let Ok(private_key) = RsaPrivateKey::from_pkcs8_pem(private_pem) else {
        return false;
    };

    let mut nonce = [0u8; CHALLENGE_NONCE_BYTES];
    OsRng.fill_bytes(&mut nonce);

    let Ok(ciphertext) = public_key.encrypt(&mut OsRng, Oaep::new::<Sha256>(), &nonce) else {
        return false;
    };
    let Ok(decrypted) = private_key.decrypt(Oaep::new::<Sha256>(), &ciphertext) else {
        return false;
    };

    decrypted == nonce
}
