// Transparent page-level encryption: AES-256-GCM with the page id as
// associated data, so ciphertext copied into a different page slot fails to
// decrypt instead of silently decoding as garbage.
//
// The nonce is random per write rather than derived from a counter --
// simpler to get right, at the cost of widening each on-disk page by
// `NONCE_LEN + TAG_LEN` bytes when encryption is on. `ContainerFile`
// accounts for that in its page stride; everything above it still deals in
// plain `page_size`-length buffers.

use crate::common::PageId;
use crate::error::{DbError, Result};
use aes_gcm::aead::{generic_array::GenericArray, Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit};
use uuid::Uuid;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const OVERHEAD: usize = NONCE_LEN + TAG_LEN;

fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..NONCE_LEN.min(16)].copy_from_slice(&Uuid::new_v4().into_bytes()[..NONCE_LEN.min(16)]);
    nonce
}

fn aad_for(page_id: PageId) -> [u8; 8] {
    page_id.to_le_bytes()
}

/// Encrypts `plaintext` (expected to be exactly the container's page size),
/// returning `nonce || ciphertext || tag`.
pub fn encrypt_page(key: &[u8; 32], page_id: PageId, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(GenericArray::from_slice(key));
    let nonce_bytes = random_nonce();
    let nonce = GenericArray::from_slice(&nonce_bytes);
    let aad = aad_for(page_id);
    let sealed = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad: &aad })
        .map_err(|e| DbError::Encryption(format!("page {page_id} encrypt failed: {e}")))?;

    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Reverses `encrypt_page`, returning the original `page_size`-length body.
pub fn decrypt_page(key: &[u8; 32], page_id: PageId, sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < OVERHEAD {
        return Err(DbError::Encryption(format!("page {page_id} ciphertext shorter than nonce+tag")));
    }
    let cipher = Aes256Gcm::new(GenericArray::from_slice(key));
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let nonce = GenericArray::from_slice(nonce_bytes);
    let aad = aad_for(page_id);
    cipher
        .decrypt(nonce, Payload { msg: ciphertext, aad: &aad })
        .map_err(|e| DbError::Encryption(format!("page {page_id} decrypt failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let key = [7u8; 32];
        let page = vec![9u8; 4096];
        let sealed = encrypt_page(&key, 3, &page).unwrap();
        let opened = decrypt_page(&key, 3, &sealed).unwrap();
        assert_eq!(opened, page);
    }

    #[test]
    fn rejects_wrong_page_id_as_aad_mismatch() {
        let key = [7u8; 32];
        let page = vec![9u8; 4096];
        let sealed = encrypt_page(&key, 3, &page).unwrap();
        assert!(decrypt_page(&key, 4, &sealed).is_err());
    }

    #[test]
    fn rejects_tampered_ciphertext() {
        let key = [7u8; 32];
        let page = vec![9u8; 4096];
        let mut sealed = encrypt_page(&key, 3, &page).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(decrypt_page(&key, 3, &sealed).is_err());
    }

    #[test]
    fn rejects_wrong_key() {
        let key = [7u8; 32];
        let page = vec![9u8; 4096];
        let sealed = encrypt_page(&key, 3, &page).unwrap();
        assert!(decrypt_page(&[8u8; 32], 3, &sealed).is_err());
    }
}
