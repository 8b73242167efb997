//! Employee credential checks at the kiosk.
//!
//! PINs are stored as `iterations$salt$hash` records (hex salt and hash,
//! PBKDF2-HMAC-SHA256), never in clear text.

use hmac::Hmac;
use sha2::Sha256;
use std::collections::HashMap;
use subtle::ConstantTimeEq;
use thiserror::Error;

pub const PIN_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("malformed pin record: {0}")]
    Malformed(&'static str),
    #[error("key derivation failed: {0}")]
    Derive(String),
    #[error("random source unavailable: {0}")]
    Random(String),
}

/// Decides whether a presented credential identifies the employee.
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, employee_id: &str, credential: &str) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinRecord {
    iterations: u32,
    salt: Vec<u8>,
    hash: Vec<u8>,
}

impl PinRecord {
    pub fn parse(record: &str) -> Result<Self, CredentialError> {
        let mut parts = record.trim().split('$');
        let (Some(iterations), Some(salt), Some(hash), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(CredentialError::Malformed("expected iterations$salt$hash"));
        };
        let iterations: u32 = iterations
            .parse()
            .map_err(|_| CredentialError::Malformed("iterations is not a number"))?;
        if iterations == 0 {
            return Err(CredentialError::Malformed("iterations must be positive"));
        }
        let salt = hex::decode(salt).map_err(|_| CredentialError::Malformed("salt is not hex"))?;
        let hash = hex::decode(hash).map_err(|_| CredentialError::Malformed("hash is not hex"))?;
        if salt.is_empty() || hash.len() != HASH_LEN {
            return Err(CredentialError::Malformed("unexpected salt or hash length"));
        }
        Ok(Self {
            iterations,
            salt,
            hash,
        })
    }

    pub fn encode(&self) -> String {
        format!(
            "{}${}${}",
            self.iterations,
            hex::encode(&self.salt),
            hex::encode(&self.hash)
        )
    }

    pub fn matches(&self, pin: &str) -> bool {
        match derive(pin.as_bytes(), &self.salt, self.iterations) {
            Ok(candidate) => bool::from(candidate.as_slice().ct_eq(&self.hash)),
            Err(_) => false,
        }
    }
}

fn derive(pin: &[u8], salt: &[u8], iterations: u32) -> Result<[u8; HASH_LEN], CredentialError> {
    let mut output = [0u8; HASH_LEN];
    pbkdf2::pbkdf2::<Hmac<Sha256>>(pin, salt, iterations, &mut output)
        .map_err(|e| CredentialError::Derive(e.to_string()))?;
    Ok(output)
}

/// Hash `pin` with a fresh random salt.
pub fn hash_pin(pin: &str, iterations: u32) -> Result<PinRecord, CredentialError> {
    let mut salt = [0u8; SALT_LEN];
    getrandom::getrandom(&mut salt).map_err(|e| CredentialError::Random(e.to_string()))?;
    let hash = derive(pin.as_bytes(), &salt, iterations)?;
    Ok(PinRecord {
        iterations,
        salt: salt.to_vec(),
        hash: hash.to_vec(),
    })
}

/// PIN verification against enrolled records. Employees without a record
/// never verify.
#[derive(Debug, Default, Clone)]
pub struct Pbkdf2PinVerifier {
    records: HashMap<String, PinRecord>,
}

impl Pbkdf2PinVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `employee_id -> record` pairs as found in configuration.
    pub fn from_records<'a, I>(records: I) -> Result<Self, CredentialError>
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut verifier = Self::new();
        for (employee_id, record) in records {
            verifier.enroll(employee_id.clone(), PinRecord::parse(record)?);
        }
        Ok(verifier)
    }

    pub fn enroll(&mut self, employee_id: String, record: PinRecord) {
        self.records.insert(employee_id, record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl CredentialVerifier for Pbkdf2PinVerifier {
    fn verify(&self, employee_id: &str, credential: &str) -> bool {
        self.records
            .get(employee_id)
            .is_some_and(|record| record.matches(credential))
    }
}
