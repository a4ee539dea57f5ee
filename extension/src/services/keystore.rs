// Wallet keystore collaborator
// Key storage and encryption at rest live outside the core. The background
// only asks the keystore for wallet metadata and for signing / encryption
// with a given address.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;

const NONCE_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletKind {
    Local,
    /// Keys live on an external device; signing happens in the popup
    Hardware,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletInfo {
    pub address: String,
    /// base64url public key (the transaction `owner`)
    pub public_key: String,
    pub nickname: String,
    pub kind: WalletKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeystoreChange {
    ActiveWallet(String),
    WalletsChanged,
}

#[async_trait]
pub trait Keystore: Send + Sync {
    async fn active_wallet(&self) -> Result<WalletInfo>;

    async fn wallets(&self) -> Result<Vec<WalletInfo>>;

    async fn sign(&self, address: &str, message: &[u8]) -> Result<Vec<u8>>;

    async fn encrypt(&self, address: &str, data: &[u8]) -> Result<Vec<u8>>;

    async fn decrypt(&self, address: &str, data: &[u8]) -> Result<Vec<u8>>;

    fn changes(&self) -> broadcast::Receiver<KeystoreChange>;
}

/// Address of the wallet owning `public_key`
pub fn owner_to_address(public_key: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(public_key))
}

/// Check a signature against a base64url public key
pub fn verify_signature(public_key: &str, message: &[u8], signature: &[u8]) -> Result<bool> {
    let bytes = URL_SAFE_NO_PAD
        .decode(public_key)
        .context("Public key is not base64url")?;
    let bytes: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .context("Public key has the wrong length")?;
    let key = VerifyingKey::from_bytes(&bytes).context("Invalid public key")?;

    let Ok(signature) = Signature::from_slice(signature) else {
        return Ok(false);
    };
    Ok(key.verify(message, &signature).is_ok())
}

struct StoredWallet {
    info: WalletInfo,
    key: Option<SigningKey>,
}

struct KeystoreState {
    wallets: Vec<StoredWallet>,
    active: Option<String>,
}

/// Development keystore with ed25519 keys held in memory
pub struct DevKeystore {
    state: RwLock<KeystoreState>,
    changes: broadcast::Sender<KeystoreChange>,
}

impl DevKeystore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            state: RwLock::new(KeystoreState {
                wallets: Vec::new(),
                active: None,
            }),
            changes,
        }
    }

    /// Generate a local wallet; the first wallet added becomes active
    pub fn add_generated(&self, nickname: &str) -> WalletInfo {
        let key = SigningKey::generate(&mut OsRng);
        self.add_wallet(nickname, key.verifying_key(), Some(key), WalletKind::Local)
    }

    /// Register a hardware wallet by its public key
    pub fn add_hardware(&self, nickname: &str, public_key: VerifyingKey) -> WalletInfo {
        self.add_wallet(nickname, public_key, None, WalletKind::Hardware)
    }

    fn add_wallet(
        &self,
        nickname: &str,
        public_key: VerifyingKey,
        key: Option<SigningKey>,
        kind: WalletKind,
    ) -> WalletInfo {
        let owner = public_key.to_bytes();
        let info = WalletInfo {
            address: owner_to_address(&owner),
            public_key: URL_SAFE_NO_PAD.encode(owner),
            nickname: nickname.to_string(),
            kind,
        };

        let mut state = self.state.write();
        state.wallets.push(StoredWallet {
            info: info.clone(),
            key,
        });
        let first = state.active.is_none();
        if first {
            state.active = Some(info.address.clone());
        }
        drop(state);

        tracing::info!("Added {:?} wallet {} ({})", kind, info.nickname, info.address);
        let _ = self.changes.send(KeystoreChange::WalletsChanged);
        if first {
            let _ = self.changes.send(KeystoreChange::ActiveWallet(info.address.clone()));
        }
        info
    }

    pub fn set_active(&self, address: &str) -> Result<()> {
        let mut state = self.state.write();
        if !state.wallets.iter().any(|w| w.info.address == address) {
            bail!("No wallet with address {}", address);
        }
        if state.active.as_deref() == Some(address) {
            return Ok(());
        }
        state.active = Some(address.to_string());
        drop(state);

        let _ = self.changes.send(KeystoreChange::ActiveWallet(address.to_string()));
        Ok(())
    }

    fn signing_key(&self, address: &str) -> Result<SigningKey> {
        let state = self.state.read();
        let wallet = state
            .wallets
            .iter()
            .find(|w| w.info.address == address)
            .with_context(|| format!("No wallet with address {}", address))?;
        wallet
            .key
            .clone()
            .with_context(|| format!("Wallet {} keeps its keys on a hardware device", address))
    }

    fn cipher(&self, address: &str) -> Result<Aes256Gcm> {
        let key = self.signing_key(address)?;
        let mut hasher = Sha256::new();
        hasher.update(b"encryption:");
        hasher.update(key.to_bytes());
        let secret: [u8; 32] = hasher.finalize().into();
        Ok(Aes256Gcm::new(&secret.into()))
    }
}

impl Default for DevKeystore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Keystore for DevKeystore {
    async fn active_wallet(&self) -> Result<WalletInfo> {
        let state = self.state.read();
        let active = state.active.as_deref().context("No wallets added")?;
        state
            .wallets
            .iter()
            .find(|w| w.info.address == active)
            .map(|w| w.info.clone())
            .context("Active wallet is missing")
    }

    async fn wallets(&self) -> Result<Vec<WalletInfo>> {
        Ok(self.state.read().wallets.iter().map(|w| w.info.clone()).collect())
    }

    async fn sign(&self, address: &str, message: &[u8]) -> Result<Vec<u8>> {
        let key = self.signing_key(address)?;
        Ok(key.sign(message).to_bytes().to_vec())
    }

    async fn encrypt(&self, address: &str, data: &[u8]) -> Result<Vec<u8>> {
        let cipher = self.cipher(address)?;
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), data)
            .map_err(|e| anyhow::anyhow!("Encryption failed: {:?}", e))?;

        let mut out = nonce.to_vec();
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    async fn decrypt(&self, address: &str, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN {
            bail!("Ciphertext is too short");
        }
        let cipher = self.cipher(address)?;
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| anyhow::anyhow!("Decryption failed: {:?}", e))
    }

    fn changes(&self) -> broadcast::Receiver<KeystoreChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signatures_verify_against_public_key() {
        let keystore = DevKeystore::new();
        let wallet = keystore.add_generated("main");

        let signature = keystore.sign(&wallet.address, b"hello").await.unwrap();
        assert!(verify_signature(&wallet.public_key, b"hello", &signature).unwrap());
        assert!(!verify_signature(&wallet.public_key, b"other", &signature).unwrap());
        assert!(!verify_signature(&wallet.public_key, b"hello", &[1, 2, 3]).unwrap());
    }

    #[tokio::test]
    async fn encryption_round_trip() {
        let keystore = DevKeystore::new();
        let wallet = keystore.add_generated("main");

        let ciphertext = keystore.encrypt(&wallet.address, b"secret").await.unwrap();
        assert_ne!(&ciphertext[NONCE_LEN..], b"secret");
        let plaintext = keystore.decrypt(&wallet.address, &ciphertext).await.unwrap();
        assert_eq!(plaintext, b"secret");

        let mut tampered = ciphertext.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 1;
        assert!(keystore.decrypt(&wallet.address, &tampered).await.is_err());
    }

    #[tokio::test]
    async fn first_wallet_is_active_and_switch_is_published() {
        let keystore = DevKeystore::new();
        let mut changes = keystore.changes();
        let first = keystore.add_generated("one");
        let second = keystore.add_generated("two");

        assert_eq!(keystore.active_wallet().await.unwrap().address, first.address);
        keystore.set_active(&second.address).unwrap();
        assert_eq!(keystore.active_wallet().await.unwrap().address, second.address);
        assert!(keystore.set_active("unknown").is_err());

        let mut seen = Vec::new();
        while let Ok(change) = changes.try_recv() {
            seen.push(change);
        }
        assert!(seen.contains(&KeystoreChange::ActiveWallet(second.address.clone())));
    }

    #[tokio::test]
    async fn hardware_wallets_cannot_sign_locally() {
        let keystore = DevKeystore::new();
        let device = SigningKey::generate(&mut OsRng);
        let wallet = keystore.add_hardware("ledger", device.verifying_key());

        assert_eq!(wallet.kind, WalletKind::Hardware);
        assert!(keystore.sign(&wallet.address, b"x").await.is_err());
    }
}
