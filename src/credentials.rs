use crate::errors::{AppError, AppResult};
use crate::models::UserCredential;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use std::collections::HashMap;
use std::sync::RwLock;

/// Holds at most one warehouse credential per user. Each call is atomic for its key.
pub trait CredentialStore: Send + Sync {
    /// Inserts or replaces the credential for `credential.user_id`.
    fn save(&self, credential: UserCredential) -> AppResult<()>;
    fn get(&self, user_id: &str) -> AppResult<Option<UserCredential>>;
    /// Returns whether a credential was present. Deleting an absent user is not an error.
    fn delete(&self, user_id: &str) -> AppResult<bool>;
    fn user_ids(&self) -> AppResult<Vec<String>>;
}

#[derive(Debug, Clone)]
struct SealedCredential {
    host_account: String,
    username: String,
    nonce: String,
    ciphertext: String,
}

/// Process-local store; passwords are kept sealed with a per-process AES-256-GCM key.
pub struct InMemoryCredentialStore {
    cipher: Aes256Gcm,
    entries: RwLock<HashMap<String, SealedCredential>>,
}

impl std::fmt::Debug for InMemoryCredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.entries.read().map(|entries| entries.len()).unwrap_or_default();
        f.debug_struct("InMemoryCredentialStore").field("entries", &count).finish()
    }
}

impl Default for InMemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        let key: [u8; 32] = rand::random();
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn seal(&self, credential: &UserCredential) -> AppResult<SealedCredential> {
        let nonce_bytes: [u8; 12] = rand::random();
        let encrypted = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), credential.password.as_bytes())
            .map_err(|error| AppError::Internal(format!("failed to seal credential: {}", error)))?;

        Ok(SealedCredential {
            host_account: credential.host_account.clone(),
            username: credential.username.clone(),
            nonce: base64::engine::general_purpose::STANDARD.encode(nonce_bytes),
            ciphertext: base64::engine::general_purpose::STANDARD.encode(encrypted),
        })
    }

    fn open(&self, user_id: &str, sealed: &SealedCredential) -> AppResult<UserCredential> {
        let engine = &base64::engine::general_purpose::STANDARD;
        let nonce = engine
            .decode(&sealed.nonce)
            .map_err(|error| AppError::Internal(error.to_string()))?;
        let ciphertext = engine
            .decode(&sealed.ciphertext)
            .map_err(|error| AppError::Internal(error.to_string()))?;
        if nonce.len() != 12 {
            return Err(AppError::Internal("sealed credential has a malformed nonce".to_string()));
        }
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|error| AppError::Internal(format!("failed to open credential: {}", error)))?;
        let password =
            String::from_utf8(plaintext).map_err(|error| AppError::Internal(error.to_string()))?;

        Ok(UserCredential {
            user_id: user_id.to_string(),
            host_account: sealed.host_account.clone(),
            username: sealed.username.clone(),
            password,
        })
    }
}

fn poisoned() -> AppError {
    AppError::Internal("credential store lock poisoned".to_string())
}

impl CredentialStore for InMemoryCredentialStore {
    fn save(&self, credential: UserCredential) -> AppResult<()> {
        let sealed = self.seal(&credential)?;
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        entries.insert(credential.user_id, sealed);
        Ok(())
    }

    fn get(&self, user_id: &str) -> AppResult<Option<UserCredential>> {
        let sealed = {
            let entries = self.entries.read().map_err(|_| poisoned())?;
            entries.get(user_id).cloned()
        };
        sealed.map(|sealed| self.open(user_id, &sealed)).transpose()
    }

    fn delete(&self, user_id: &str) -> AppResult<bool> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        Ok(entries.remove(user_id).is_some())
    }

    fn user_ids(&self) -> AppResult<Vec<String>> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        let mut ids = entries.keys().cloned().collect::<Vec<_>>();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::{CredentialStore, InMemoryCredentialStore};
    use crate::models::UserCredential;

    fn credential(user_id: &str, password: &str) -> UserCredential {
        UserCredential {
            user_id: user_id.to_string(),
            host_account: "xy12345".to_string(),
            username: "analyst".to_string(),
            password: password.to_string(),
        }
    }

    #[test]
    fn save_then_get_round_trips_password() {
        let store = InMemoryCredentialStore::new();
        store.save(credential("u1", "s3cret!")).expect("save");
        let loaded = store.get("u1").expect("get").expect("present");
        assert_eq!(loaded, credential("u1", "s3cret!"));
        assert!(store.get("u2").expect("get").is_none());
    }

    #[test]
    fn save_replaces_existing_credential() {
        let store = InMemoryCredentialStore::new();
        store.save(credential("u1", "first")).expect("save");
        store.save(credential("u1", "second")).expect("save");
        let loaded = store.get("u1").expect("get").expect("present");
        assert_eq!(loaded.password, "second");
        assert_eq!(store.user_ids().expect("ids"), vec!["u1".to_string()]);
    }

    #[test]
    fn delete_is_idempotent() {
        let store = InMemoryCredentialStore::new();
        store.save(credential("u1", "pw")).expect("save");
        assert!(store.delete("u1").expect("delete"));
        assert!(!store.delete("u1").expect("delete again"));
        assert!(store.get("u1").expect("get").is_none());
    }

    #[test]
    fn sealed_entries_do_not_hold_plaintext() {
        let store = InMemoryCredentialStore::new();
        store.save(credential("u1", "plaintext-password")).expect("save");
        let entries = store.entries.read().expect("read");
        let sealed = entries.get("u1").expect("sealed entry");
        assert!(!sealed.ciphertext.contains("plaintext-password"));
        assert!(!format!("{:?}", store).contains("plaintext-password"));
    }
}
