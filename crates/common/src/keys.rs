// Tunnel key provisioning
//
// The tunnel engine authenticates peers with Curve25519 keypairs carried as
// base64. Keys live only in memory for the session's lifetime; the private
// half is zeroed on drop and never written anywhere except the engine
// configs that are themselves session-scoped.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand_core::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// One asymmetric keypair, generated per tunnel endpoint per session
pub struct KeyPair {
    private_key: Zeroizing<String>,
    public_key: String,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            private_key: Zeroizing::new(BASE64.encode(secret.to_bytes())),
            public_key: BASE64.encode(public.to_bytes()),
        }
    }

    pub fn private_key(&self) -> &str {
        &self.private_key
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .field("private_key", &"<redacted>")
            .finish()
    }
}
