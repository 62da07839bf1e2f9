//! Recoverable ECDSA over secp256k1
//!
//! Implements Bitcoin-compatible "signed message" signatures so that index
//! signing keys can live on ordinary wallet hardware. Verification never
//! checks against one known key: it recovers the signer's public key from
//! the signature and the message, and the caller decides whether that key
//! is trusted.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use k256::elliptic_curve::bigint::{ArrayEncoding, Limb, U256};
use k256::elliptic_curve::ops::{LinearCombination, Reduce};
use k256::elliptic_curve::point::{AffineCoordinates, DecompressPoint};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::elliptic_curve::subtle::Choice;
use k256::elliptic_curve::PrimeField;
use k256::{AffinePoint, FieldBytes, NonZeroScalar, ProjectivePoint, Scalar};
use sha2::{Digest, Sha256};
use std::hash::{Hash, Hasher};
use thiserror::Error;

/// Prefix framed in front of every signed message.
pub const SIGNED_MESSAGE_HEADER: &str = "Bitcoin Signed Message:\n";

/// Header (1) + r (32) + s (32)
pub const SIGNATURE_LEN: usize = 65;

const HEADER_MIN: u8 = 27;
const HEADER_MAX: u8 = 34;
const COMPRESSED_OFFSET: u8 = 4;

/// secp256k1 field prime
const FIELD_PRIME: U256 =
    U256::from_be_hex("FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFEFFFFFC2F");

/// secp256k1 group order
const CURVE_ORDER: U256 =
    U256::from_be_hex("FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFEBAAEDCE6AF48A03BBFD25E8CD0364141");

#[derive(Error, Debug)]
pub enum SignatureError {
    #[error("could not decode base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("expected {SIGNATURE_LEN} signature bytes, got {0}")]
    Length(usize),

    #[error("header byte out of range: {0}")]
    HeaderOutOfRange(u8),

    #[error("signature component out of range")]
    ComponentOutOfRange,

    #[error("message of {0} bytes is too long to frame")]
    MessageTooLong(usize),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("no recovery id reproduces the signing key")]
    Unrecoverable,
}

/// A secp256k1 public key.
///
/// Equality and hashing use the point coordinates only; `compressed` just
/// records the preferred SEC1 encoding.
#[derive(Clone, Copy, Debug)]
pub struct KeyPoint {
    point: AffinePoint,
    compressed: bool,
}

impl KeyPoint {
    fn new(point: AffinePoint, compressed: bool) -> Self {
        Self { point, compressed }
    }

    /// Parse a SEC1 encoded key (33 byte compressed or 65 byte uncompressed)
    pub fn from_sec1_bytes(bytes: &[u8]) -> Result<Self, SignatureError> {
        let key = k256::PublicKey::from_sec1_bytes(bytes)
            .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
        Ok(Self::new(*key.as_affine(), bytes.len() == 33))
    }

    pub fn from_hex(s: &str) -> Result<Self, SignatureError> {
        let bytes = hex::decode(s.trim()).map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
        Self::from_sec1_bytes(&bytes)
    }

    pub fn to_sec1_bytes(&self) -> Vec<u8> {
        self.point
            .to_encoded_point(self.compressed)
            .as_bytes()
            .to_vec()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_sec1_bytes())
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    fn compressed_bytes(&self) -> Vec<u8> {
        self.point.to_encoded_point(true).as_bytes().to_vec()
    }
}

impl PartialEq for KeyPoint {
    fn eq(&self, other: &Self) -> bool {
        self.point == other.point
    }
}

impl Eq for KeyPoint {}

impl Hash for KeyPoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.compressed_bytes().hash(state);
    }
}

impl std::fmt::Display for KeyPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A secp256k1 signing key
#[derive(Clone)]
pub struct PrivateKey {
    scalar: Scalar,
}

impl PrivateKey {
    /// Generate a fresh key from OS randomness
    pub fn generate() -> Self {
        let scalar = NonZeroScalar::random(&mut rand::rngs::OsRng);
        Self { scalar: *scalar }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SignatureError> {
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
            SignatureError::InvalidKey(format!("expected 32 private key bytes, got {}", bytes.len()))
        })?;
        let scalar: Option<Scalar> = Scalar::from_repr(FieldBytes::from(bytes)).into();
        match scalar {
            Some(scalar) if !bool::from(scalar.is_zero()) => Ok(Self { scalar }),
            _ => Err(SignatureError::InvalidKey(
                "private key is not a valid scalar".to_string(),
            )),
        }
    }

    pub fn from_hex(s: &str) -> Result<Self, SignatureError> {
        let bytes = hex::decode(s.trim()).map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.scalar.to_repr())
    }

    /// Big-endian scalar bytes
    pub fn to_bytes(&self) -> [u8; 32] {
        self.scalar.to_repr().into()
    }

    pub fn public_key(&self) -> KeyPoint {
        KeyPoint::new((ProjectivePoint::GENERATOR * self.scalar).to_affine(), true)
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey").finish_non_exhaustive()
    }
}

/// The (r, s) pair of an ECDSA signature. Not normalised to low-s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcdsaSignature {
    pub r: Scalar,
    pub s: Scalar,
}

impl EcdsaSignature {
    /// Parse big-endian r and s, rejecting zero or values not below the curve order
    pub fn from_bytes(r: &[u8], s: &[u8]) -> Result<Self, SignatureError> {
        let parse = |bytes: &[u8]| -> Result<Scalar, SignatureError> {
            let bytes: [u8; 32] = bytes
                .try_into()
                .map_err(|_| SignatureError::ComponentOutOfRange)?;
            let scalar: Option<Scalar> = Scalar::from_repr(FieldBytes::from(bytes)).into();
            match scalar {
                Some(v) if !bool::from(v.is_zero()) => Ok(v),
                _ => Err(SignatureError::ComponentOutOfRange),
            }
        };
        Ok(Self {
            r: parse(r)?,
            s: parse(s)?,
        })
    }
}

fn reduce(bytes: &FieldBytes) -> Scalar {
    <Scalar as Reduce<U256>>::reduce_bytes(bytes)
}

/// Deterministic ECDSA (RFC 6979 nonces, HMAC-SHA256) over a 32 byte digest
pub fn sign(message_digest: &[u8; 32], key: &PrivateKey) -> EcdsaSignature {
    let z = reduce(&FieldBytes::from(*message_digest));
    let order = CURVE_ORDER.to_be_byte_array();
    let mut retry: u32 = 0;
    loop {
        // r or s of zero is astronomically unlikely; vary the nonce and retry
        let extra = if retry == 0 {
            Vec::new()
        } else {
            retry.to_be_bytes().to_vec()
        };
        retry += 1;

        let k_bytes =
            rfc6979::generate_k::<Sha256, _>(&key.scalar.to_repr(), &order, &z.to_repr(), &extra);
        let k: Option<Scalar> = Scalar::from_repr(k_bytes).into();
        let Some(k) = k else { continue };
        let Some(k_inv) = Option::<Scalar>::from(k.invert()) else {
            continue;
        };

        let big_r = (ProjectivePoint::GENERATOR * k).to_affine();
        let r = reduce(&big_r.x());
        if bool::from(r.is_zero()) {
            continue;
        }
        let s = k_inv * (z + r * key.scalar);
        if bool::from(s.is_zero()) {
            continue;
        }
        return EcdsaSignature { r, s };
    }
}

/// SEC1 v2 section 4.1.6 public key recovery.
///
/// Returns `None` when recovery is impossible for this `recovery_id`;
/// callers iterate ids 0..=3 and keep the key they expect.
pub fn recover_public_key(
    recovery_id: u8,
    signature: &EcdsaSignature,
    message_digest: &[u8; 32],
    compressed: bool,
) -> Option<KeyPoint> {
    if recovery_id > 3 {
        return None;
    }

    // x = r + (recovery_id / 2) * n, which must stay below the field prime
    let r = U256::from_be_byte_array(signature.r.to_repr());
    let x = if recovery_id / 2 == 1 {
        let (sum, carry) = r.adc(&CURVE_ORDER, Limb::ZERO);
        if carry.0 != 0 {
            return None;
        }
        sum
    } else {
        r
    };
    if x >= FIELD_PRIME {
        return None;
    }

    let y_is_odd = Choice::from(recovery_id & 1);
    let big_r: Option<AffinePoint> =
        AffinePoint::decompress(&x.to_be_byte_array(), y_is_odd).into();
    // secp256k1 has cofactor 1, so any point that decompresses satisfies n*R = O
    let big_r = ProjectivePoint::from(big_r?);

    let e = reduce(&FieldBytes::from(*message_digest));
    let r_inv: Scalar = Option::from(signature.r.invert())?;
    let s_r_inv = r_inv * signature.s;
    let neg_e_r_inv = r_inv * (-e);

    let q = ProjectivePoint::lincomb(&big_r, &s_r_inv, &ProjectivePoint::GENERATOR, &neg_e_r_inv);
    if q == ProjectivePoint::IDENTITY {
        return None;
    }
    Some(KeyPoint::new(q.to_affine(), compressed))
}

/// Frame a text message the way Bitcoin's signmessage does:
/// `[24] "Bitcoin Signed Message:\n" [compact length] message`
pub fn format_signed_message(text: &str) -> Result<Vec<u8>, SignatureError> {
    let message = text.as_bytes();
    let header = SIGNED_MESSAGE_HEADER.as_bytes();
    let mut framed = Vec::with_capacity(1 + header.len() + 3 + message.len());
    framed.push(header.len() as u8);
    framed.extend_from_slice(header);
    match message.len() {
        n if n < 253 => framed.push(n as u8),
        n if n <= 0xFFFF => {
            framed.push(253);
            framed.extend_from_slice(&(n as u16).to_le_bytes());
        }
        n => return Err(SignatureError::MessageTooLong(n)),
    }
    framed.extend_from_slice(message);
    Ok(framed)
}

/// Double SHA-256 of the framed message
pub fn signed_message_hash(text: &str) -> Result<[u8; 32], SignatureError> {
    let framed = format_signed_message(text)?;
    Ok(Sha256::digest(Sha256::digest(&framed)).into())
}

/// Sign a text message and return the base64 compact signature.
///
/// The header byte always selects the compressed key form.
pub fn sign_message(text: &str, key: &PrivateKey) -> Result<String, SignatureError> {
    let digest = signed_message_hash(text)?;
    let signature = sign(&digest, key);
    let expected = key.public_key();

    let recovery_id = (0..4u8)
        .find(|&id| recover_public_key(id, &signature, &digest, true) == Some(expected))
        .ok_or(SignatureError::Unrecoverable)?;

    let mut encoded = [0u8; SIGNATURE_LEN];
    encoded[0] = HEADER_MIN + COMPRESSED_OFFSET + recovery_id;
    encoded[1..33].copy_from_slice(&signature.r.to_repr());
    encoded[33..65].copy_from_slice(&signature.s.to_repr());
    Ok(STANDARD.encode(encoded))
}

/// A decoded compact signature
#[derive(Debug, Clone, Copy)]
pub struct CompactSignature {
    pub signature: EcdsaSignature,
    pub recovery_id: u8,
    pub compressed: bool,
}

/// Decode a base64 compact signature. Any problem here is a format error,
/// never a recovery miss.
pub fn decode_compact(signature_b64: &str) -> Result<CompactSignature, SignatureError> {
    let bytes = STANDARD.decode(signature_b64.trim())?;
    if bytes.len() != SIGNATURE_LEN {
        return Err(SignatureError::Length(bytes.len()));
    }
    let mut header = bytes[0];
    if !(HEADER_MIN..=HEADER_MAX).contains(&header) {
        return Err(SignatureError::HeaderOutOfRange(header));
    }
    let compressed = header >= HEADER_MIN + COMPRESSED_OFFSET;
    if compressed {
        header -= COMPRESSED_OFFSET;
    }
    let signature = EcdsaSignature::from_bytes(&bytes[1..33], &bytes[33..65])?;
    Ok(CompactSignature {
        signature,
        recovery_id: header - HEADER_MIN,
        compressed,
    })
}

/// Recover the key that signed `text`, using the recovery id in the header
pub fn signed_message_to_key(
    text: &str,
    signature_b64: &str,
) -> Result<Option<KeyPoint>, SignatureError> {
    let compact = decode_compact(signature_b64)?;
    let digest = signed_message_hash(text)?;
    Ok(recover_public_key(
        compact.recovery_id,
        &compact.signature,
        &digest,
        compact.compressed,
    ))
}

/// Every key recoverable from the signature, header-designated id first
pub fn candidate_keys(text: &str, signature_b64: &str) -> Result<Vec<KeyPoint>, SignatureError> {
    let compact = decode_compact(signature_b64)?;
    let digest = signed_message_hash(text)?;
    let order = std::iter::once(compact.recovery_id)
        .chain((0..4u8).filter(|&id| id != compact.recovery_id));

    let mut keys = Vec::with_capacity(4);
    for id in order {
        if let Some(key) = recover_public_key(id, &compact.signature, &digest, compact.compressed) {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
    }
    Ok(keys)
}
