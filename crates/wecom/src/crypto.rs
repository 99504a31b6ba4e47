use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::Engine;
use sha1::{Digest, Sha1};
use thiserror::Error;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// WeCom pads to 32-byte blocks even though AES itself works on 16.
const PAD_BLOCK: usize = 32;
const RANDOM_PREFIX_LEN: usize = 16;
const LENGTH_PREFIX_LEN: usize = 4;
const ENCODING_AES_KEY_LEN: usize = 43;

/// Platform-issued keys are 43 random characters, so the final symbol
/// usually carries non-zero trailing bits.
const KEY_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_allow_trailing_bits(true),
);

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid encoding_aes_key: {0}")]
    InvalidKey(String),
    #[error("token must not be empty")]
    EmptyToken,
    #[error("ciphertext is not valid base64")]
    Base64,
    #[error("ciphertext length {0} is not a multiple of the cipher block")]
    BlockLength(usize),
    #[error("invalid padding")]
    InvalidPadding,
    #[error("embedded length prefix is inconsistent with the decrypted buffer")]
    InvalidLength,
    #[error("receiver id mismatch")]
    ReceiverMismatch,
    #[error("random prefix must be {RANDOM_PREFIX_LEN} bytes, got {0}")]
    RandomPrefix(usize),
}

/// Signs, verifies, encrypts and decrypts the callback envelope of one
/// WeCom application.
#[derive(Clone)]
pub struct EnvelopeCodec {
    token: String,
    aes_key: [u8; 32],
    receiver_id: String,
}

impl std::fmt::Debug for EnvelopeCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeCodec")
            .field("receiver_id", &self.receiver_id)
            .finish_non_exhaustive()
    }
}

impl EnvelopeCodec {
    pub fn new(
        token: impl Into<String>,
        encoding_aes_key: &str,
        receiver_id: impl Into<String>,
    ) -> Result<Self, CryptoError> {
        let token = token.into();
        if token.is_empty() {
            return Err(CryptoError::EmptyToken);
        }

        let encoding_aes_key = encoding_aes_key.trim();
        if encoding_aes_key.len() != ENCODING_AES_KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "expected {} characters, got {}",
                ENCODING_AES_KEY_LEN,
                encoding_aes_key.len()
            )));
        }
        let raw = KEY_ENGINE
            .decode(format!("{}=", encoding_aes_key))
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let aes_key: [u8; 32] = raw
            .try_into()
            .map_err(|v: Vec<u8>| CryptoError::InvalidKey(format!("decoded to {} bytes", v.len())))?;

        Ok(Self {
            token,
            aes_key,
            receiver_id: receiver_id.into(),
        })
    }

    pub fn receiver_id(&self) -> &str {
        &self.receiver_id
    }

    /// Lowercase hex SHA-1 over token, timestamp, nonce and ciphertext in
    /// sorted order.
    pub fn signature(&self, timestamp: &str, nonce: &str, encrypted: &str) -> String {
        let mut parts = [self.token.as_str(), timestamp, nonce, encrypted];
        parts.sort_unstable();

        let mut hasher = Sha1::new();
        for part in parts {
            hasher.update(part.as_bytes());
        }
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    pub fn verify_signature(
        &self,
        signature: &str,
        timestamp: &str,
        nonce: &str,
        encrypted: &str,
    ) -> bool {
        if signature.is_empty() || encrypted.is_empty() {
            return false;
        }
        let expected = self.signature(timestamp, nonce, encrypted);
        constant_time_eq(expected.as_bytes(), signature.as_bytes())
    }

    pub fn decrypt(&self, encrypted: &str) -> Result<Vec<u8>, CryptoError> {
        let data = STANDARD
            .decode(encrypted.trim())
            .map_err(|_| CryptoError::Base64)?;
        if data.is_empty() || data.len() % 16 != 0 {
            return Err(CryptoError::BlockLength(data.len()));
        }

        let plain = Aes256CbcDec::new_from_slices(&self.aes_key, &self.aes_key[..16])
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?
            .decrypt_padded_vec_mut::<NoPadding>(&data)
            .map_err(|_| CryptoError::InvalidPadding)?;

        let content = strip_pkcs7(&plain)?;
        if content.len() < RANDOM_PREFIX_LEN + LENGTH_PREFIX_LEN {
            return Err(CryptoError::InvalidLength);
        }

        let mut len_bytes = [0u8; LENGTH_PREFIX_LEN];
        len_bytes.copy_from_slice(&content[RANDOM_PREFIX_LEN..RANDOM_PREFIX_LEN + LENGTH_PREFIX_LEN]);
        let msg_len = u32::from_be_bytes(len_bytes) as usize;

        let body = &content[RANDOM_PREFIX_LEN + LENGTH_PREFIX_LEN..];
        if msg_len > body.len() {
            return Err(CryptoError::InvalidLength);
        }
        let (message, receiver) = body.split_at(msg_len);
        if receiver != self.receiver_id.as_bytes() {
            return Err(CryptoError::ReceiverMismatch);
        }

        Ok(message.to_vec())
    }

    pub fn encrypt(&self, plaintext: &[u8], random_prefix: &[u8]) -> Result<String, CryptoError> {
        if random_prefix.len() != RANDOM_PREFIX_LEN {
            return Err(CryptoError::RandomPrefix(random_prefix.len()));
        }
        let msg_len = u32::try_from(plaintext.len()).map_err(|_| CryptoError::InvalidLength)?;

        let mut buf = Vec::with_capacity(
            RANDOM_PREFIX_LEN + LENGTH_PREFIX_LEN + plaintext.len() + self.receiver_id.len() + PAD_BLOCK,
        );
        buf.extend_from_slice(random_prefix);
        buf.extend_from_slice(&msg_len.to_be_bytes());
        buf.extend_from_slice(plaintext);
        buf.extend_from_slice(self.receiver_id.as_bytes());

        let pad = PAD_BLOCK - (buf.len() % PAD_BLOCK);
        buf.extend(std::iter::repeat(pad as u8).take(pad));

        let encrypted = Aes256CbcEnc::new_from_slices(&self.aes_key, &self.aes_key[..16])
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?
            .encrypt_padded_vec_mut::<NoPadding>(&buf);

        Ok(STANDARD.encode(encrypted))
    }
}

fn strip_pkcs7(buf: &[u8]) -> Result<&[u8], CryptoError> {
    let Some(&last) = buf.last() else {
        return Err(CryptoError::InvalidPadding);
    };
    let pad = last as usize;
    if pad == 0 || pad > PAD_BLOCK || pad > buf.len() {
        return Err(CryptoError::InvalidPadding);
    }
    let (content, padding) = buf.split_at(buf.len() - pad);
    if padding.iter().any(|&b| b != last) {
        return Err(CryptoError::InvalidPadding);
    }
    Ok(content)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
