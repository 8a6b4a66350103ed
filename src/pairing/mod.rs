//! Pairing codes and bearer tokens for the HTTP control plane.
//!
//! A client pairs in two steps: the operator mints a short-lived one-time
//! code out of band (CLI or an already-paired client), the new client
//! exchanges it over `POST /pair` for a long-lived bearer token. The raw
//! token is returned exactly once; only its SHA-256 hash is kept, so a
//! leaked store cannot be replayed.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

/// Code alphabet: 32 symbols, visually ambiguous `0 O 1 I` excluded.
const CODE_ALPHABET: &[u8] = b"23456789ABCDEFGHJKLMNPQRSTUVWXYZ";
const CODE_LENGTH: usize = 6;
const CODE_TTL_MINUTES: i64 = 5;
const TOKEN_TTL_DAYS: i64 = 30;
const MAX_ACTIVE_CODES: usize = 5;
const MAX_PAIRED_CLIENTS: usize = 20;

#[derive(Error, Debug, PartialEq)]
pub enum PairingError {
    #[error("too many active pairing codes (max {0})")]
    TooManyCodes(usize),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PairingCode {
    pub code: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl PairingCode {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PairedClient {
    pub token_hash: String,
    /// First 8 hex chars of the raw token, for display only.
    pub token_preview: String,
    pub paired_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl PairedClient {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PairingStats {
    pub active_codes: usize,
    pub paired_clients: usize,
}

#[derive(Default)]
struct PairingState {
    codes: HashMap<String, PairingCode>,
    /// Keyed by token hash.
    clients: HashMap<String, PairedClient>,
}

/// Mints pairing codes, exchanges them for bearer tokens and validates
/// tokens on later requests. Operations are short and synchronous, so a
/// plain mutex serialises them.
pub struct PairingManager {
    state: Mutex<PairingState>,
}

impl PairingManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PairingState::default()),
        }
    }

    /// Mints a new one-time code. Expired codes are pruned first; when the
    /// active-code cap is still reached the call fails.
    pub fn generate_code(&self, label: Option<String>) -> Result<PairingCode, PairingError> {
        let now = Utc::now();
        let mut state = self.state.lock().expect("pairing lock poisoned");
        state.codes.retain(|_, c| !c.is_expired(now));

        if state.codes.len() >= MAX_ACTIVE_CODES {
            return Err(PairingError::TooManyCodes(MAX_ACTIVE_CODES));
        }

        let mut rng = rand::thread_rng();
        let code: String = (0..CODE_LENGTH)
            .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
            .collect();

        let pairing_code = PairingCode {
            code: code.clone(),
            created_at: now,
            expires_at: now + Duration::minutes(CODE_TTL_MINUTES),
            label,
        };
        state.codes.insert(code, pairing_code.clone());
        info!(code = %pairing_code.code, "Pairing code generated");
        Ok(pairing_code)
    }

    pub fn list_codes(&self) -> Vec<PairingCode> {
        let now = Utc::now();
        let mut state = self.state.lock().expect("pairing lock poisoned");
        state.codes.retain(|_, c| !c.is_expired(now));
        let mut codes: Vec<_> = state.codes.values().cloned().collect();
        codes.sort_by_key(|c| c.created_at);
        codes
    }

    pub fn revoke_code(&self, code: &str) -> bool {
        let mut state = self.state.lock().expect("pairing lock poisoned");
        state.codes.remove(code).is_some()
    }

    /// Exchanges a code for a raw bearer token. Consumes the code. Returns
    /// `None` for unknown, expired or already-consumed codes — this path
    /// never errors so the HTTP handler can map it straight to 401.
    pub fn exchange_code(&self, code: &str, client_label: Option<String>) -> Option<String> {
        let now = Utc::now();
        let mut state = self.state.lock().expect("pairing lock poisoned");
        state.codes.retain(|_, c| !c.is_expired(now));

        state.codes.remove(code)?;

        // Enforce the client cap by dropping the least-recently-seen client.
        while state.clients.len() >= MAX_PAIRED_CLIENTS {
            let oldest = state
                .clients
                .values()
                .min_by_key(|c| c.last_seen_at)
                .map(|c| c.token_hash.clone());
            match oldest {
                Some(hash) => {
                    warn!(token_hash = %hash, "Evicting least-recently-seen paired client");
                    state.clients.remove(&hash);
                }
                None => break,
            }
        }

        let mut token_bytes = [0u8; 32];
        rand::thread_rng().fill(&mut token_bytes);
        let token = hex::encode(token_bytes);
        let token_hash = hash_token(&token);

        let client = PairedClient {
            token_hash: token_hash.clone(),
            token_preview: token[..8].to_string(),
            paired_at: now,
            last_seen_at: now,
            expires_at: now + Duration::days(TOKEN_TTL_DAYS),
            label: client_label,
        };
        state.clients.insert(token_hash, client);
        info!(code = %code, "Pairing code exchanged for bearer token");
        Some(token)
    }

    /// Validates a raw bearer token. Unknown and expired tokens are
    /// rejected; expired ones are evicted on the way. Never panics on
    /// malformed input.
    pub fn validate_token(&self, token: &str) -> bool {
        let now = Utc::now();
        let token_hash = hash_token(token);
        let mut state = self.state.lock().expect("pairing lock poisoned");

        match state.clients.get_mut(&token_hash) {
            Some(client) if !client.is_expired(now) => {
                client.last_seen_at = now;
                true
            }
            Some(_) => {
                state.clients.remove(&token_hash);
                false
            }
            None => false,
        }
    }

    pub fn list_clients(&self) -> Vec<PairedClient> {
        let now = Utc::now();
        let mut state = self.state.lock().expect("pairing lock poisoned");
        state.clients.retain(|_, c| !c.is_expired(now));
        let mut clients: Vec<_> = state.clients.values().cloned().collect();
        clients.sort_by_key(|c| c.paired_at);
        clients
    }

    pub fn revoke_client(&self, token_hash: &str) -> bool {
        let mut state = self.state.lock().expect("pairing lock poisoned");
        state.clients.remove(token_hash).is_some()
    }

    pub fn stats(&self) -> PairingStats {
        let now = Utc::now();
        let mut state = self.state.lock().expect("pairing lock poisoned");
        state.codes.retain(|_, c| !c.is_expired(now));
        state.clients.retain(|_, c| !c.is_expired(now));
        PairingStats {
            active_codes: state.codes.len(),
            paired_clients: state.clients.len(),
        }
    }
}

impl Default for PairingManager {
    fn default() -> Self {
        Self::new()
    }
}

fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_alphabet_excludes_ambiguous() {
        assert_eq!(CODE_ALPHABET.len(), 32);
        for banned in [b'0', b'O', b'1', b'I'] {
            assert!(!CODE_ALPHABET.contains(&banned));
        }
    }

    #[test]
    fn test_generated_code_shape() {
        let manager = PairingManager::new();
        let code = manager.generate_code(Some("phone".into())).unwrap();
        assert_eq!(code.code.len(), CODE_LENGTH);
        assert!(code.code.bytes().all(|b| CODE_ALPHABET.contains(&b)));
        assert_eq!(code.label.as_deref(), Some("phone"));
        assert!(code.expires_at > code.created_at);
    }

    #[test]
    fn test_code_cap_enforced() {
        let manager = PairingManager::new();
        for _ in 0..MAX_ACTIVE_CODES {
            manager.generate_code(None).unwrap();
        }
        assert_eq!(
            manager.generate_code(None),
            Err(PairingError::TooManyCodes(MAX_ACTIVE_CODES))
        );
    }

    #[test]
    fn test_exchange_succeeds_at_most_once() {
        let manager = PairingManager::new();
        let code = manager.generate_code(None).unwrap();
        let token = manager.exchange_code(&code.code, None);
        assert!(token.is_some());
        assert!(manager.exchange_code(&code.code, None).is_none());
    }

    #[test]
    fn test_exchange_unknown_code_is_none() {
        let manager = PairingManager::new();
        assert!(manager.exchange_code("ZZZZZZ", None).is_none());
    }

    #[test]
    fn test_token_is_64_hex_chars() {
        let manager = PairingManager::new();
        let code = manager.generate_code(None).unwrap();
        let token = manager.exchange_code(&code.code, None).unwrap();
        assert_eq!(token.len(), 64);
        assert!(token.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn test_validate_token_roundtrip() {
        let manager = PairingManager::new();
        let code = manager.generate_code(None).unwrap();
        let token = manager.exchange_code(&code.code, None).unwrap();

        assert!(manager.validate_token(&token));
        assert!(!manager.validate_token("not-a-token"));
    }

    #[test]
    fn test_validate_refreshes_last_seen() {
        let manager = PairingManager::new();
        let code = manager.generate_code(None).unwrap();
        let token = manager.exchange_code(&code.code, None).unwrap();

        let before = manager.list_clients()[0].last_seen_at;
        assert!(manager.validate_token(&token));
        let after = manager.list_clients()[0].last_seen_at;
        assert!(after >= before);
    }

    #[test]
    fn test_expired_token_rejected_and_evicted() {
        let manager = PairingManager::new();
        let code = manager.generate_code(None).unwrap();
        let token = manager.exchange_code(&code.code, None).unwrap();
        {
            let mut state = manager.state.lock().unwrap();
            for client in state.clients.values_mut() {
                client.expires_at = Utc::now() - Duration::seconds(1);
            }
        }
        assert!(!manager.validate_token(&token));
        assert_eq!(manager.stats().paired_clients, 0);
    }

    #[test]
    fn test_client_cap_evicts_least_recently_seen() {
        let manager = PairingManager::new();
        let mut tokens = Vec::new();
        for i in 0..MAX_PAIRED_CLIENTS {
            let code = manager.generate_code(None).unwrap();
            tokens.push(manager.exchange_code(&code.code, Some(format!("c{i}"))).unwrap());
        }
        // Backdate client 0 so it becomes the eviction candidate.
        {
            let mut state = manager.state.lock().unwrap();
            let hash = hash_token(&tokens[0]);
            state.clients.get_mut(&hash).unwrap().last_seen_at =
                Utc::now() - Duration::days(1);
        }

        let code = manager.generate_code(None).unwrap();
        let newest = manager.exchange_code(&code.code, None).unwrap();

        assert_eq!(manager.stats().paired_clients, MAX_PAIRED_CLIENTS);
        assert!(!manager.validate_token(&tokens[0]));
        assert!(manager.validate_token(&newest));
        assert!(manager.validate_token(&tokens[1]));
    }

    #[test]
    fn test_revoke_code_and_client() {
        let manager = PairingManager::new();
        let code = manager.generate_code(None).unwrap();
        assert!(manager.revoke_code(&code.code));
        assert!(!manager.revoke_code(&code.code));

        let code = manager.generate_code(None).unwrap();
        let token = manager.exchange_code(&code.code, None).unwrap();
        let hash = hash_token(&token);
        assert!(manager.revoke_client(&hash));
        assert!(!manager.validate_token(&token));
    }

    #[test]
    fn test_stats_counts() {
        let manager = PairingManager::new();
        manager.generate_code(None).unwrap();
        let code = manager.generate_code(None).unwrap();
        manager.exchange_code(&code.code, None).unwrap();

        let stats = manager.stats();
        assert_eq!(stats.active_codes, 1);
        assert_eq!(stats.paired_clients, 1);
    }
}
