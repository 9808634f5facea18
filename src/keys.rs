//! The key algebra
//!
//! One secret begets every key in the system. A keymaker holds a curve25519
//! key pair; from its secret scalar and a token id it derives the card's
//! root key and the master key of every gate application. A gate holds its
//! own key pair plus a 32 byte *base key*; from the base key and a token id
//! it derives the one key slot on the card that opens its gate file.
//!
//! The derivation is the keyed BLAKE2b KDF (the libsodium
//! `crypto_kdf_blake2b` construction): 16 byte subkeys keyed by the 32 byte
//! secret, domain separated by an 8 byte context and counter driven by the
//! packed token id. File payloads are sealed with public-key authenticated
//! encryption (curve25519 + XSalsa20-Poly1305) laid out on the wire as
//! `nonce(24) ‖ mac(16) ‖ ciphertext`.

use crate::wire::{Stream, StreamError, TransferFormat};
use crate::{GateId, TokenId};

use blake2::digest::consts::U16;
use blake2::digest::Mac;
use blake2::Blake2bMac;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use crypto_box::aead::generic_array::GenericArray;
use crypto_box::aead::AeadInPlace;
use crypto_box::SalsaBox;
use rand_core::{OsRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of raw public and secret keys.
pub const RAW_KEY_SIZE: usize = 32;

/// Nonce length of the file payload seal.
pub const BOX_NONCE_SIZE: usize = 24;

/// Authenticator length of the file payload seal.
pub const BOX_MAC_SIZE: usize = 16;

const ROOT_KEY_CONTEXT: &[u8; 8] = b"rootkey\0";

const PWHASH_SALT: &[u8; 16] = b"portcullis-kp-v0";

/// Errors of the key algebra.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyError {
    /// The scalar is not a usable secret key.
    InvalidKey,
    /// Encryption or decryption failed (bad authenticator, wrong key).
    Crypto,
    /// A serialized key or ciphertext does not have the expected shape.
    Malformed,
}

impl core::fmt::Display for KeyError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            KeyError::InvalidKey => write!(f, "key_error"),
            KeyError::Crypto => write!(f, "crypto_error"),
            KeyError::Malformed => write!(f, "malformed"),
        }
    }
}

/// A 32 byte curve25519 public key; the public identity of a keymaker or a
/// gate.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; RAW_KEY_SIZE]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; RAW_KEY_SIZE] {
        &self.0
    }
}

impl From<[u8; RAW_KEY_SIZE]> for PublicKey {
    fn from(raw: [u8; RAW_KEY_SIZE]) -> Self {
        PublicKey(raw)
    }
}

impl core::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl TransferFormat for PublicKey {
    const TYPE_NAME: &'static str = "pub_key";

    fn read_from(s: &mut Stream<'_>) -> Result<Self, StreamError> {
        Ok(PublicKey(<[u8; RAW_KEY_SIZE]>::read_from(s)?))
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        self.0.write_to(out);
    }
}

/// A 32 byte curve25519 secret scalar.
///
/// Zeroed on drop. All-zero scalars are rejected at construction, so a
/// [`SecretKey`] always has a well defined public counterpart.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey([u8; RAW_KEY_SIZE]);

impl SecretKey {
    pub fn from_raw(raw: [u8; RAW_KEY_SIZE]) -> Result<Self, KeyError> {
        if raw == [0u8; RAW_KEY_SIZE] {
            return Err(KeyError::InvalidKey);
        }
        Ok(SecretKey(raw))
    }

    pub(crate) fn raw(&self) -> &[u8; RAW_KEY_SIZE] {
        &self.0
    }

    /// Scalar multiplication of the curve base point.
    pub fn public_key(&self) -> PublicKey {
        let sk = x25519_dalek::StaticSecret::from(self.0);
        PublicKey(*x25519_dalek::PublicKey::from(&sk).as_bytes())
    }

    /// The key holding root access to the card with the given id.
    pub fn derive_token_root_key(&self, id: TokenId) -> TokenRootKey {
        TokenRootKey(Aes128Key {
            key_no: 0,
            data: derive_subkey(&self.0, id.pack(), ROOT_KEY_CONTEXT),
        })
    }

    /// The master key of the gate application hosting `gid`.
    ///
    /// The context counts gate *applications*, not gates: all thirteen
    /// slots of an application share one master.
    pub fn derive_gate_app_master_key(&self, id: TokenId, gid: GateId) -> GateAppMasterKey {
        let ctx = gate_context(gid.value() / GateId::GATES_PER_APP);
        GateAppMasterKey(Aes128Key {
            key_no: 0,
            data: derive_subkey(&self.0, id.pack(), &ctx),
        })
    }
}

impl core::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        // Never print the scalar.
        write!(f, "SecretKey(..)")
    }
}

/// A curve25519 key pair; the identity of a keymaker or a gate.
#[derive(Debug, Clone)]
pub struct KeyPair {
    sk: SecretKey,
    pk: PublicKey,
}

impl KeyPair {
    /// A fresh random key pair.
    pub fn random() -> Self {
        loop {
            let mut raw = [0u8; RAW_KEY_SIZE];
            OsRng.fill_bytes(&mut raw);
            if let Ok(kp) = KeyPair::from_raw_secret(raw) {
                return kp;
            }
        }
    }

    /// A key pair deterministically derived from a password (Argon2id with
    /// a fixed domain salt). Used for demo and recovery identities.
    pub fn from_password(password: &str) -> Result<Self, KeyError> {
        let mut raw = [0u8; RAW_KEY_SIZE];
        argon2::Argon2::default()
            .hash_password_into(password.as_bytes(), PWHASH_SALT, &mut raw)
            .map_err(|_| KeyError::InvalidKey)?;
        KeyPair::from_raw_secret(raw)
    }

    pub fn from_raw_secret(raw: [u8; RAW_KEY_SIZE]) -> Result<Self, KeyError> {
        let sk = SecretKey::from_raw(raw)?;
        let pk = sk.public_key();
        Ok(KeyPair { sk, pk })
    }

    pub fn public_key(&self) -> PublicKey {
        self.pk
    }

    pub fn secret(&self) -> &SecretKey {
        &self.sk
    }

    pub fn derive_token_root_key(&self, id: TokenId) -> TokenRootKey {
        self.sk.derive_token_root_key(id)
    }

    pub fn derive_gate_app_master_key(&self, id: TokenId, gid: GateId) -> GateAppMasterKey {
        self.sk.derive_gate_app_master_key(id, gid)
    }

    /// Seal `msg` for `recipient`, authenticated as this key pair.
    ///
    /// Output layout: `nonce(24) ‖ mac(16) ‖ ciphertext`.
    pub fn encrypt_for(&self, recipient: &PublicKey, msg: &[u8]) -> Result<Vec<u8>, KeyError> {
        let mut nonce = [0u8; BOX_NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        self.seal_with_nonce(recipient, &nonce, msg)
    }

    /// Open a blob produced by [`KeyPair::encrypt_for`] on the other side.
    pub fn decrypt_from(&self, sender: &PublicKey, blob: &[u8]) -> Result<Vec<u8>, KeyError> {
        if blob.len() < BOX_NONCE_SIZE + BOX_MAC_SIZE {
            return Err(KeyError::Malformed);
        }
        let (nonce, rest) = blob.split_at(BOX_NONCE_SIZE);
        let (mac, ct) = rest.split_at(BOX_MAC_SIZE);
        let salsa = SalsaBox::new(
            &crypto_box::PublicKey::from(*sender.as_bytes()),
            &crypto_box::SecretKey::from(*self.sk.raw()),
        );
        let mut buffer = ct.to_vec();
        salsa
            .decrypt_in_place_detached(
                GenericArray::from_slice(nonce),
                &[],
                &mut buffer,
                GenericArray::from_slice(mac),
            )
            .map_err(|_| KeyError::Crypto)?;
        Ok(buffer)
    }

    /// Verify that `blob` is the seal of `expected` for `recipient`, without
    /// being able to open it.
    ///
    /// Re-encrypts `expected` under the nonce carried by `blob` and compares
    /// the authenticator and ciphertext. Only the sender can do this; it is
    /// how a keymaker audits a gate file without the gate's secret key.
    pub fn blind_check_ciphertext(
        &self,
        recipient: &PublicKey,
        expected: &[u8],
        blob: &[u8],
    ) -> Result<bool, KeyError> {
        if blob.len() < BOX_NONCE_SIZE + BOX_MAC_SIZE {
            return Err(KeyError::Malformed);
        }
        let nonce: [u8; BOX_NONCE_SIZE] = blob[..BOX_NONCE_SIZE].try_into().unwrap_or_default();
        let rebuilt = self.seal_with_nonce(recipient, &nonce, expected)?;
        Ok(rebuilt == blob)
    }

    fn seal_with_nonce(
        &self,
        recipient: &PublicKey,
        nonce: &[u8; BOX_NONCE_SIZE],
        msg: &[u8],
    ) -> Result<Vec<u8>, KeyError> {
        let salsa = SalsaBox::new(
            &crypto_box::PublicKey::from(*recipient.as_bytes()),
            &crypto_box::SecretKey::from(*self.sk.raw()),
        );
        let mut buffer = msg.to_vec();
        let mac = salsa
            .encrypt_in_place_detached(GenericArray::from_slice(nonce), &[], &mut buffer)
            .map_err(|_| KeyError::Crypto)?;
        let mut out = Vec::with_capacity(BOX_NONCE_SIZE + BOX_MAC_SIZE + buffer.len());
        out.extend_from_slice(nonce);
        out.extend_from_slice(&mac);
        out.extend_from_slice(&buffer);
        Ok(out)
    }

    /// Wrap the secret under a password for persistence.
    ///
    /// Layout: `salt(16) ‖ nonce(24) ‖ aead(secret)`, key = Argon2id of the
    /// password and salt, AEAD = XChaCha20-Poly1305.
    pub fn save_encrypted(&self, password: &str) -> Vec<u8> {
        let mut salt = [0u8; 16];
        let mut nonce = [0u8; 24];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut nonce);
        let mut wrap_key = [0u8; RAW_KEY_SIZE];
        argon2::Argon2::default()
            .hash_password_into(password.as_bytes(), &salt, &mut wrap_key)
            .expect("output length is fixed and valid");
        let aead = XChaCha20Poly1305::new(Key::from_slice(&wrap_key));
        wrap_key.zeroize();
        let sealed = aead
            .encrypt(XNonce::from_slice(&nonce), self.sk.raw().as_slice())
            .expect("in-memory encryption cannot fail");
        let mut out = Vec::with_capacity(salt.len() + nonce.len() + sealed.len());
        out.extend_from_slice(&salt);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        out
    }

    /// Reverse of [`KeyPair::save_encrypted`].
    pub fn load_encrypted(blob: &[u8], password: &str) -> Result<Self, KeyError> {
        if blob.len() != 16 + 24 + RAW_KEY_SIZE + 16 {
            return Err(KeyError::Malformed);
        }
        let (salt, rest) = blob.split_at(16);
        let (nonce, sealed) = rest.split_at(24);
        let mut wrap_key = [0u8; RAW_KEY_SIZE];
        argon2::Argon2::default()
            .hash_password_into(password.as_bytes(), salt, &mut wrap_key)
            .map_err(|_| KeyError::Crypto)?;
        let aead = XChaCha20Poly1305::new(Key::from_slice(&wrap_key));
        wrap_key.zeroize();
        let mut raw_vec = aead
            .decrypt(XNonce::from_slice(nonce), sealed)
            .map_err(|_| KeyError::Crypto)?;
        let mut raw = [0u8; RAW_KEY_SIZE];
        raw.copy_from_slice(&raw_vec);
        raw_vec.zeroize();
        let kp = KeyPair::from_raw_secret(raw);
        raw.zeroize();
        kp
    }
}

/// A 16 byte AES128 card key labeled with its key slot number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aes128Key {
    key_no: u8,
    data: [u8; 16],
}

impl Aes128Key {
    pub fn new(key_no: u8, data: [u8; 16]) -> Self {
        Aes128Key { key_no, data }
    }

    /// The factory value of a key slot: all zero.
    pub fn default_with_no(key_no: u8) -> Self {
        Aes128Key {
            key_no,
            data: [0; 16],
        }
    }

    pub fn key_no(&self) -> u8 {
        self.key_no
    }

    pub fn data(&self) -> &[u8; 16] {
        &self.data
    }

    pub fn is_default(&self) -> bool {
        self.data == [0; 16]
    }
}

/// Key 0 of the card root; derived from the keymaker secret and token id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenRootKey(pub Aes128Key);

/// Key 0 of a gate application; derived from the keymaker secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateAppMasterKey(pub Aes128Key);

/// A gate's slot key on one specific card; derived from the gate base key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateTokenKey(pub Aes128Key);

/// The 32 byte master secret of one gate installation.
///
/// Generated by the gate during registration, returned to the keymaker over
/// the secure channel, and stored by both sides. Every per-card slot key of
/// the gate is derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateBaseKey(pub [u8; RAW_KEY_SIZE]);

impl GateBaseKey {
    pub fn random() -> Self {
        let mut raw = [0u8; RAW_KEY_SIZE];
        OsRng.fill_bytes(&mut raw);
        GateBaseKey(raw)
    }

    /// The key opening this gate's file on the card with the given id.
    ///
    /// The context carries the full gate id; the key lands at slot
    /// [`GateId::key_no`].
    pub fn derive_token_key(&self, id: TokenId, gid: GateId) -> GateTokenKey {
        let ctx = gate_context(gid.value());
        GateTokenKey(Aes128Key {
            key_no: gid.key_no(),
            data: derive_subkey(&self.0, id.pack(), &ctx),
        })
    }
}

impl TransferFormat for GateBaseKey {
    const TYPE_NAME: &'static str = "base_key";

    fn read_from(s: &mut Stream<'_>) -> Result<Self, StreamError> {
        Ok(GateBaseKey(<[u8; RAW_KEY_SIZE]>::read_from(s)?))
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        self.0.write_to(out);
    }
}

fn gate_context(n: u32) -> [u8; 8] {
    let mut ctx = *b"gate\0\0\0\0";
    ctx[4..8].copy_from_slice(&n.to_le_bytes());
    ctx
}

/// The keyed BLAKE2b KDF: 16 byte subkey, salt = LE64 counter, personal =
/// 8 byte context, keyed by the 32 byte secret.
fn derive_subkey(secret: &[u8; RAW_KEY_SIZE], subkey_id: u64, ctx: &[u8; 8]) -> [u8; 16] {
    let mac = Blake2bMac::<U16>::new_with_salt_and_personal(secret, &subkey_id.to_le_bytes(), ctx)
        .expect("parameter lengths are statically valid");
    mac.finalize().into_bytes().into()
}
