//! Encrypted push to a remote install agent.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::Rng;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::error::PostProcessError;

/// Route the agent listens on.
pub const CLIENT_INSTALL_ROUTE: &str = "/certhaven/api/v1/install";

const NONCE_LEN: usize = 12;

/// Plaintext sealed inside [`ClientPayload`].
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallBundle {
    pub key_pem: String,
    pub cert_pem: String,
}

/// Body POSTed to the agent.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientPayload {
    /// base64url(nonce || AES-256-GCM ciphertext of the JSON bundle).
    pub payload: String,
}

impl ClientPayload {
    /// Seal `bundle` with the base64url (unpadded) AES-256 key.
    pub fn seal(key_b64: &str, bundle: &InstallBundle) -> Result<Self, PostProcessError> {
        let cipher = cipher(key_b64)?;

        let plaintext =
            serde_json::to_vec(bundle).map_err(|e| PostProcessError::Encryption(e.to_string()))?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|_| PostProcessError::Encryption("encryption failure".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);

        Ok(Self {
            payload: URL_SAFE_NO_PAD.encode(sealed),
        })
    }

    /// Inverse of [`ClientPayload::seal`], as the agent performs it.
    pub fn open(&self, key_b64: &str) -> Result<InstallBundle, PostProcessError> {
        let cipher = cipher(key_b64)?;

        let sealed = URL_SAFE_NO_PAD
            .decode(&self.payload)
            .map_err(|e| PostProcessError::Encryption(e.to_string()))?;
        if sealed.len() < NONCE_LEN {
            return Err(PostProcessError::Encryption("payload too short".to_string()));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| PostProcessError::Encryption("decryption failure".to_string()))?;

        serde_json::from_slice(&plaintext).map_err(|e| PostProcessError::Encryption(e.to_string()))
    }
}

fn cipher(key_b64: &str) -> Result<Aes256Gcm, PostProcessError> {
    let key = URL_SAFE_NO_PAD
        .decode(key_b64.trim())
        .map_err(|e| PostProcessError::InvalidClientKey(e.to_string()))?;
    Aes256Gcm::new_from_slice(&key).map_err(|_| {
        PostProcessError::InvalidClientKey(format!("expected 32 bytes, got {}", key.len()))
    })
}

pub fn install_url(address: &str, port: u16) -> String {
    format!("https://{}:{}{}", address, port, CLIENT_INSTALL_ROUTE)
}

/// POST the sealed bundle to the agent. Anything but 200 is a failure.
pub async fn notify_client(
    http: &reqwest::Client,
    url: &str,
    key_b64: &str,
    bundle: &InstallBundle,
) -> Result<(), PostProcessError> {
    let payload = ClientPayload::seal(key_b64, bundle)?;

    let response = http
        .post(url)
        .json(&payload)
        .send()
        .await
        .map_err(|e| PostProcessError::ClientRequest(e.to_string()))?;

    let status = response.status();
    // Drain the body so the connection can be reused.
    let _ = response.bytes().await;

    if status != StatusCode::OK {
        return Err(PostProcessError::ClientStatus(status.as_u16()));
    }
    Ok(())
}
