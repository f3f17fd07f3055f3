use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256};
use thiserror::Error;

/// RFC 4648 base32 alphabet, no padding.
const ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// 32 bytes encode to 52 base32 characters.
const ENCODED_LEN: usize = 52;

/// Characters per display chunk, before the check character.
const CHUNK_LEN: usize = 13;

/// Errors produced when deriving or parsing an [`Identity`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("expecting 1 peer certificate, got {0}")]
    ImproperCertsNumber(usize),

    #[error("invalid identifier length")]
    InvalidLength,

    #[error("invalid identifier character {0:?}")]
    InvalidCharacter(char),

    #[error("identifier check character mismatch")]
    CheckMismatch,
}

/// Stable identifier of a tunnel client, the SHA-256 digest of its TLS
/// certificate in DER form.
///
/// The textual form groups the base32 encoding into `-`-separated chunks,
/// each protected by a Luhn mod-32 check character so identifiers copied by
/// hand fail loudly instead of routing to the wrong client.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity([u8; 32]);

impl Identity {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Identity(bytes)
    }

    /// Derives the identity from a certificate's raw DER bytes.
    pub fn from_cert_der(der: &[u8]) -> Self {
        let digest = Sha256::digest(der);
        Identity(digest.into())
    }

    /// Derives the identity from the peer certificates produced by a TLS
    /// handshake. Anything other than exactly one certificate is an error.
    pub fn from_peer_certs<C: AsRef<[u8]>>(certs: &[C]) -> Result<Self, IdentityError> {
        if certs.len() != 1 {
            return Err(IdentityError::ImproperCertsNumber(certs.len()));
        }
        Ok(Self::from_cert_der(certs[0].as_ref()))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = base32_encode(&self.0);
        for (i, chunk) in encoded.chunks(CHUNK_LEN).enumerate() {
            if i > 0 {
                f.write_str("-")?;
            }
            for &d in chunk {
                write!(f, "{}", ALPHABET[d as usize] as char)?;
            }
            write!(f, "{}", ALPHABET[luhn_check(chunk) as usize] as char)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self)
    }
}

impl FromStr for Identity {
    type Err = IdentityError;

    /// Parses the textual form, forgiving the usual transcription mistakes:
    /// lowercase input and the digits `0`, `1` and `8` standing in for `O`,
    /// `I` and `B`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut digits = Vec::with_capacity(ENCODED_LEN + 4);
        for c in s.chars() {
            if c == '-' || c == ' ' {
                continue;
            }
            let c = normalize(c);
            let d = ALPHABET
                .iter()
                .position(|&a| a as char == c)
                .ok_or(IdentityError::InvalidCharacter(c))? as u8;
            digits.push(d);
        }

        if digits.len() != ENCODED_LEN + ENCODED_LEN / CHUNK_LEN {
            return Err(IdentityError::InvalidLength);
        }

        let mut payload = Vec::with_capacity(ENCODED_LEN);
        for chunk in digits.chunks(CHUNK_LEN + 1) {
            let (body, check) = chunk.split_at(CHUNK_LEN);
            if luhn_check(body) != check[0] {
                return Err(IdentityError::CheckMismatch);
            }
            payload.extend_from_slice(body);
        }

        base32_decode(&payload).map(Identity)
    }
}

fn normalize(c: char) -> char {
    match c.to_ascii_uppercase() {
        '0' => 'O',
        '1' => 'I',
        '8' => 'B',
        up => up,
    }
}

/// Encodes 32 bytes as 52 base32 digit values (not yet mapped to characters).
fn base32_encode(bytes: &[u8; 32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ENCODED_LEN);
    let mut acc: u32 = 0;
    let mut bits = 0;
    for &b in bytes {
        acc = (acc << 8) | u32::from(b);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(((acc >> bits) & 0x1f) as u8);
        }
    }
    if bits > 0 {
        out.push(((acc << (5 - bits)) & 0x1f) as u8);
    }
    out
}

fn base32_decode(digits: &[u8]) -> Result<[u8; 32], IdentityError> {
    let mut out = [0u8; 32];
    let mut acc: u32 = 0;
    let mut bits = 0;
    let mut pos = 0;
    for &d in digits {
        acc = (acc << 5) | u32::from(d);
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            if pos == out.len() {
                return Err(IdentityError::InvalidLength);
            }
            out[pos] = ((acc >> bits) & 0xff) as u8;
            pos += 1;
        }
    }
    // 52 digits carry 4 trailing padding bits, which must be zero.
    if pos != out.len() || acc & ((1 << bits) - 1) != 0 {
        return Err(IdentityError::InvalidLength);
    }
    Ok(out)
}

/// Luhn mod-32 check digit over a chunk of base32 digit values.
fn luhn_check(chunk: &[u8]) -> u8 {
    let n = ALPHABET.len() as u32;
    let mut sum = 0u32;
    let mut double = true;
    for &d in chunk.iter().rev() {
        let mut v = u32::from(d);
        if double {
            v *= 2;
            if v >= n {
                v = v - n + 1;
            }
        }
        sum += v;
        double = !double;
    }
    ((n - sum % n) % n) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Identity {
        let mut bytes = [0u8; 32];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = (i * 7 + 3) as u8;
        }
        Identity::from_bytes(bytes)
    }

    #[test]
    fn display_shape() {
        let text = sample().to_string();
        let chunks: Vec<&str> = text.split('-').collect();
        assert_eq!(chunks.len(), 4);
        for chunk in chunks {
            assert_eq!(chunk.len(), CHUNK_LEN + 1);
        }
    }

    #[test]
    fn round_trip() {
        for seed in 0..16u8 {
            let mut bytes = [0u8; 32];
            for (i, b) in bytes.iter_mut().enumerate() {
                *b = seed.wrapping_mul(31).wrapping_add(i as u8);
            }
            let id = Identity::from_bytes(bytes);
            let parsed: Identity = id.to_string().parse().unwrap();
            assert_eq!(parsed, id);
        }
    }

    #[test]
    fn accepts_common_typos() {
        let id = sample();
        let text = id
            .to_string()
            .to_lowercase()
            .replace('o', "0")
            .replace('i', "1")
            .replace('b', "8");
        let parsed: Identity = text.parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn rejects_altered_check_digit() {
        let text = sample().to_string();
        let mut chars: Vec<char> = text.chars().collect();
        // Last character of the first chunk is its check character.
        let pos = CHUNK_LEN;
        chars[pos] = if chars[pos] == 'A' { 'C' } else { 'A' };
        let altered: String = chars.into_iter().collect();
        assert_eq!(
            altered.parse::<Identity>(),
            Err(IdentityError::CheckMismatch)
        );
    }

    #[test]
    fn rejects_altered_payload() {
        let text = sample().to_string();
        let mut chars: Vec<char> = text.chars().collect();
        chars[0] = if chars[0] == 'A' { 'C' } else { 'A' };
        let altered: String = chars.into_iter().collect();
        assert!(altered.parse::<Identity>().is_err());
    }

    #[test]
    fn peer_certs_must_be_single() {
        let der = [1u8, 2, 3];
        assert!(Identity::from_peer_certs(&[der.as_slice()]).is_ok());
        assert_eq!(
            Identity::from_peer_certs::<&[u8]>(&[]),
            Err(IdentityError::ImproperCertsNumber(0))
        );
        assert_eq!(
            Identity::from_peer_certs(&[der.as_slice(), der.as_slice()]),
            Err(IdentityError::ImproperCertsNumber(2))
        );
    }

    #[test]
    fn digest_is_stable() {
        let a = Identity::from_cert_der(b"certificate");
        let b = Identity::from_cert_der(b"certificate");
        let c = Identity::from_cert_der(b"other");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
