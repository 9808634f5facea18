//! The secure peer-to-peer channel
//!
//! Keymaker and gate talk over a half-duplex packet transport (NFC
//! data-exchange frames in the field, an in-memory pipe in tests). This
//! module layers mutual authentication and per-direction streaming AEAD on
//! top of any such transport.
//!
//! The two roles mirror each other: the *initiator* drives every exchange
//! with [`RawInitiator::communicate`], the *target* alternates
//! [`RawTarget::receive`] / [`RawTarget::send`]. The handshake swaps raw
//! public keys, derives one session key per direction from the
//! Diffie-Hellman shared secret, and swaps a stream header per direction.
//! After that every frame is one XChaCha20-Poly1305 seal with a counter
//! driven nonce: replay, reorder or bit flips fail the tag check, which
//! poisons the session for good.
//!
//! The secure endpoints implement the raw traits themselves, so protocol
//! layers stack on either transparently.

use crate::keys::{KeyPair, PublicKey, RAW_KEY_SIZE};

use blake2::{Blake2b512, Digest};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use log::{error, info};
use rand_core::{OsRng, RngCore};
use std::time::{Duration, Instant};

/// Length of the per-direction stream header.
pub const HEADER_SIZE: usize = 24;

/// Bytes a sealed frame adds to its payload.
pub const FRAME_OVERHEAD: usize = 16;

/// Channel-layer errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The peer did not answer in time.
    Timeout,
    /// A frame had the wrong size or shape.
    CommMalformed,
    /// The transport hardware failed.
    HwError,
    /// A protocol level failure: key agreement rejected the peer key, or a
    /// frame failed the tag check and the session is poisoned.
    AppError,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            Error::Timeout => write!(f, "timeout"),
            Error::CommMalformed => write!(f, "comm_malformed"),
            Error::HwError => write!(f, "hw_error"),
            Error::AppError => write!(f, "app_error"),
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;

/// The initiator side of a half-duplex packet transport.
pub trait RawInitiator {
    /// Send one packet and block for the peer's answer.
    fn communicate(&mut self, data: &[u8], timeout: Duration) -> Result<Vec<u8>>;
}

/// The target side of a half-duplex packet transport.
pub trait RawTarget {
    fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>>;

    fn send(&mut self, data: &[u8], timeout: Duration) -> Result<()>;
}

/// A deadline shared by the steps of one compound exchange.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Countdown {
    deadline: Instant,
}

impl Countdown {
    pub(crate) fn new(timeout: Duration) -> Self {
        Countdown {
            deadline: Instant::now() + timeout,
        }
    }

    pub(crate) fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

enum Role {
    /// Drives the exchange; the "server" of the key exchange.
    Initiator,
    /// Responds; the "client" of the key exchange.
    Target,
}

/// One session key per direction, derived as in libsodium's `crypto_kx`:
/// BLAKE2b-512 over the shared point and both public keys, split in half.
fn session_keys(
    role: Role,
    kp: &KeyPair,
    peer_pk: &PublicKey,
) -> Result<([u8; RAW_KEY_SIZE], [u8; RAW_KEY_SIZE])> {
    let sk = x25519_dalek::StaticSecret::from(*kp.secret().raw());
    let shared = sk.diffie_hellman(&x25519_dalek::PublicKey::from(*peer_pk.as_bytes()));
    if !shared.was_contributory() {
        error!("suspicious peer public key");
        return Err(Error::AppError);
    }
    let own_pk = kp.public_key();
    let (client_pk, server_pk) = match role {
        Role::Initiator => (peer_pk, &own_pk),
        Role::Target => (&own_pk, peer_pk),
    };
    let mut hasher = Blake2b512::new();
    hasher.update(shared.as_bytes());
    hasher.update(client_pk.as_bytes());
    hasher.update(server_pk.as_bytes());
    let h: [u8; 64] = hasher.finalize().into();
    let mut first = [0u8; RAW_KEY_SIZE];
    let mut second = [0u8; RAW_KEY_SIZE];
    first.copy_from_slice(&h[..RAW_KEY_SIZE]);
    second.copy_from_slice(&h[RAW_KEY_SIZE..]);
    // The client receives on the first half; tx and rx swap on the server.
    Ok(match role {
        Role::Target => (first, second),
        Role::Initiator => (second, first),
    })
}

/// One direction of the established session.
///
/// The nonce is the 16 byte header prefix plus a little-endian counter
/// seeded from the header tail, bumped once per frame. Both ends advance in
/// lockstep; a skipped or repeated frame cannot verify.
struct SecretStream {
    cipher: XChaCha20Poly1305,
    prefix: [u8; 16],
    counter: u64,
}

impl SecretStream {
    fn new(key: &[u8; RAW_KEY_SIZE], header: &[u8; HEADER_SIZE]) -> Self {
        let mut prefix = [0u8; 16];
        prefix.copy_from_slice(&header[..16]);
        let mut seed = [0u8; 8];
        seed.copy_from_slice(&header[16..]);
        SecretStream {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
            prefix,
            counter: u64::from_le_bytes(seed),
        }
    }

    fn fresh_header() -> [u8; HEADER_SIZE] {
        let mut header = [0u8; HEADER_SIZE];
        OsRng.fill_bytes(&mut header);
        header
    }

    fn next_nonce(&mut self) -> XNonce {
        let mut nonce = [0u8; HEADER_SIZE];
        nonce[..16].copy_from_slice(&self.prefix);
        nonce[16..].copy_from_slice(&self.counter.to_le_bytes());
        self.counter = self.counter.wrapping_add(1);
        *XNonce::from_slice(&nonce)
    }

    fn seal(&mut self, msg: &[u8]) -> Vec<u8> {
        let nonce = self.next_nonce();
        self.cipher
            .encrypt(&nonce, msg)
            .expect("in-memory encryption cannot fail")
    }

    fn open(&mut self, frame: &[u8]) -> core::result::Result<Vec<u8>, ()> {
        let nonce = self.next_nonce();
        self.cipher.decrypt(&nonce, frame).map_err(|_| ())
    }
}

struct Session {
    tx: SecretStream,
    rx: SecretStream,
    peer_pk: PublicKey,
}

/// The keymaker end of the secure channel.
pub struct SecureInitiator<I: RawInitiator> {
    raw: I,
    kp: KeyPair,
    session: Option<Session>,
    poisoned: bool,
}

impl<I: RawInitiator> SecureInitiator<I> {
    pub fn new(raw: I, kp: KeyPair) -> Self {
        SecureInitiator {
            raw,
            kp,
            session: None,
            poisoned: false,
        }
    }

    pub fn did_handshake(&self) -> bool {
        self.session.is_some()
    }

    /// The authenticated identity of the peer, once the handshake ran.
    pub fn peer_pub_key(&self) -> Option<PublicKey> {
        self.session.as_ref().map(|s| s.peer_pk)
    }

    /// Run the handshake, unless it already happened.
    pub fn handshake(&mut self, timeout: Duration) -> Result<PublicKey> {
        if self.poisoned {
            return Err(Error::AppError);
        }
        if let Some(session) = &self.session {
            return Ok(session.peer_pk);
        }
        let countdown = Countdown::new(timeout);
        // Swap raw public keys.
        let reply = self
            .raw
            .communicate(self.kp.public_key().as_bytes(), countdown.remaining())?;
        let peer_pk = parse_pk(&reply)?;
        let (rx_key, tx_key) = session_keys(Role::Initiator, &self.kp, &peer_pk)?;
        // Swap stream headers; ours goes out, the peer's seeds our rx.
        let header = SecretStream::fresh_header();
        let tx = SecretStream::new(&tx_key, &header);
        let reply = self.raw.communicate(&header, countdown.remaining())?;
        let peer_header: [u8; HEADER_SIZE] =
            reply.as_slice().try_into().map_err(|_| Error::CommMalformed)?;
        let rx = SecretStream::new(&rx_key, &peer_header);
        info!("secure channel established with {peer_pk}");
        self.session = Some(Session { tx, rx, peer_pk });
        Ok(peer_pk)
    }
}

impl<I: RawInitiator> RawInitiator for SecureInitiator<I> {
    fn communicate(&mut self, data: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        let countdown = Countdown::new(timeout);
        self.handshake(countdown.remaining())?;
        let session = self.session.as_mut().expect("handshake just succeeded");
        let frame = session.tx.seal(data);
        let reply = self.raw.communicate(&frame, countdown.remaining())?;
        if reply.len() < FRAME_OVERHEAD {
            return Err(Error::CommMalformed);
        }
        match session.rx.open(&reply) {
            Ok(msg) => Ok(msg),
            Err(()) => {
                error!("failed decrypting incoming frame, poisoning session");
                self.session = None;
                self.poisoned = true;
                Err(Error::AppError)
            }
        }
    }
}

/// The gate end of the secure channel.
pub struct SecureTarget<T: RawTarget> {
    raw: T,
    kp: KeyPair,
    session: Option<Session>,
    poisoned: bool,
}

impl<T: RawTarget> SecureTarget<T> {
    pub fn new(raw: T, kp: KeyPair) -> Self {
        SecureTarget {
            raw,
            kp,
            session: None,
            poisoned: false,
        }
    }

    pub fn did_handshake(&self) -> bool {
        self.session.is_some()
    }

    pub fn peer_pub_key(&self) -> Option<PublicKey> {
        self.session.as_ref().map(|s| s.peer_pk)
    }

    /// Mirror image of [`SecureInitiator::handshake`].
    pub fn handshake(&mut self, timeout: Duration) -> Result<PublicKey> {
        if self.poisoned {
            return Err(Error::AppError);
        }
        if let Some(session) = &self.session {
            return Ok(session.peer_pk);
        }
        let countdown = Countdown::new(timeout);
        let first = self.raw.receive(countdown.remaining())?;
        let peer_pk = parse_pk(&first)?;
        self.raw
            .send(self.kp.public_key().as_bytes(), countdown.remaining())?;
        let (rx_key, tx_key) = session_keys(Role::Target, &self.kp, &peer_pk)?;
        let peer_header: [u8; HEADER_SIZE] = self
            .raw
            .receive(countdown.remaining())?
            .as_slice()
            .try_into()
            .map_err(|_| Error::CommMalformed)?;
        let rx = SecretStream::new(&rx_key, &peer_header);
        let header = SecretStream::fresh_header();
        let tx = SecretStream::new(&tx_key, &header);
        self.raw.send(&header, countdown.remaining())?;
        info!("secure channel established with {peer_pk}");
        self.session = Some(Session { tx, rx, peer_pk });
        Ok(peer_pk)
    }
}

impl<T: RawTarget> RawTarget for SecureTarget<T> {
    fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let countdown = Countdown::new(timeout);
        self.handshake(countdown.remaining())?;
        let frame = self.raw.receive(countdown.remaining())?;
        if frame.len() < FRAME_OVERHEAD {
            return Err(Error::CommMalformed);
        }
        let session = self.session.as_mut().expect("handshake just succeeded");
        match session.rx.open(&frame) {
            Ok(msg) => Ok(msg),
            Err(()) => {
                error!("failed decrypting incoming frame, poisoning session");
                self.session = None;
                self.poisoned = true;
                Err(Error::AppError)
            }
        }
    }

    fn send(&mut self, data: &[u8], timeout: Duration) -> Result<()> {
        let countdown = Countdown::new(timeout);
        self.handshake(countdown.remaining())?;
        let session = self.session.as_mut().expect("handshake just succeeded");
        let frame = session.tx.seal(data);
        self.raw.send(&frame, countdown.remaining())
    }
}

fn parse_pk(raw: &[u8]) -> Result<PublicKey> {
    let bytes: [u8; RAW_KEY_SIZE] = raw.try_into().map_err(|_| {
        error!("invalid public key frame of {} bytes", raw.len());
        Error::CommMalformed
    })?;
    Ok(PublicKey::from(bytes))
}
