//! Capability tokens.

use rand::distributions::Uniform;
use rand::Rng;

/// Characters a token may contain.
pub const TOKEN_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

pub const SHARE_TOKEN_LEN: usize = 12;
pub const ADMIN_TOKEN_LEN: usize = 32;
pub const ACCESS_TOKEN_LEN: usize = 32;

/// Source of share, admin and participant access tokens.
pub trait TokenGenerator: Send + Sync {
    fn token(&self, len: usize) -> String;

    fn share_token(&self) -> String {
        self.token(SHARE_TOKEN_LEN)
    }

    fn admin_token(&self) -> String {
        self.token(ADMIN_TOKEN_LEN)
    }

    fn access_token(&self) -> String {
        self.token(ACCESS_TOKEN_LEN)
    }
}

/// Tokens drawn from the thread-local CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomTokens;

impl TokenGenerator for RandomTokens {
    fn token(&self, len: usize) -> String {
        let dist = Uniform::from(0..TOKEN_ALPHABET.len());
        rand::thread_rng()
            .sample_iter(dist)
            .take(len)
            .map(|i| char::from(TOKEN_ALPHABET[i]))
            .collect()
    }
}
