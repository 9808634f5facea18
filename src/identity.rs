//! Cardholder identity
//!
//! An identity is the triple of a token id and two free form strings, the
//! holder and the publisher. It exists in three forms: a canonical escaped
//! string (the input of the SHA-512 identity hash), a length prefixed
//! binary encoding (what gets sealed into card files and sent on the wire),
//! and the in-memory struct.

use crate::wire::{Stream, StreamError, TransferFormat};
use crate::TokenId;

use sha2::{Digest, Sha512};

/// The SHA-512 digest of an identity's canonical form.
pub type IdentityHash = [u8; 64];

/// A cardholder identity.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: TokenId,
    pub holder: String,
    pub publisher: String,
}

impl Identity {
    /// Canonical string form: `hex(id) ‖ "\n" ‖ escape(holder) ‖ "\n" ‖
    /// escape(publisher)`.
    ///
    /// Escaping doubles backslashes and prefixes embedded newlines with a
    /// backslash, so the three lines remain unambiguous.
    pub fn string_representation(&self) -> String {
        format!(
            "{}\n{}\n{}",
            hex::encode(self.id.0),
            escape(&self.holder),
            escape(&self.publisher)
        )
    }

    /// SHA-512 over the UTF-8 bytes of the canonical form.
    pub fn hash(&self) -> IdentityHash {
        let digest = Sha512::digest(self.string_representation().as_bytes());
        digest.into()
    }
}

impl core::fmt::Display for Identity {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(
            f,
            "token {} held by {:?}, published by {:?}",
            self.id, self.holder, self.publisher
        )
    }
}

impl TransferFormat for Identity {
    const TYPE_NAME: &'static str = "identity";

    fn read_from(s: &mut Stream<'_>) -> Result<Self, StreamError> {
        // 7 id bytes plus two length prefixes at minimum.
        if s.remaining() < 7 + 2 + 2 {
            return Err(StreamError::UnexpectedEnd);
        }
        let id = TokenId(<[u8; 7]>::read_from(s)?);
        let holder = String::read_from(s)?;
        let publisher = String::read_from(s)?;
        Ok(Identity {
            id,
            holder,
            publisher,
        })
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        self.id.0.write_to(out);
        self.holder.write_to(out);
        self.publisher.write_to(out);
    }
}

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('\n', "\\\n")
}
