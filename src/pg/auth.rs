//! Password authentication: MD5 and SCRAM-SHA-256.
//!
//! SCRAM follows RFC 5802 / RFC 7677 without channel binding. The server
//! drives the exchange, so the client is a small state machine advanced by
//! each SASL message it receives.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Mechanism name the server advertises in AuthenticationSASL.
pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// GS2 header for "no channel binding, no authzid".
const GS2_HEADER: &str = "n,,";

/// `c=` attribute of the final message: base64 of the GS2 header.
const CHANNEL_BINDING: &str = "biws";

/// Compute the response to an MD5 password request:
/// `"md5" + hex(md5(hex(md5(password + user)) + salt))`.
pub fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = md5::compute(format!("{}{}", password, user));
    let mut outer = format!("{:x}", inner).into_bytes();
    outer.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(outer))
}

/// SCRAM exchange errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScramError {
    #[error("Server message is not valid UTF-8")]
    NotUtf8,
    #[error("Server message is missing attribute '{0}'")]
    MissingAttribute(char),
    #[error("Invalid value for attribute '{0}'")]
    InvalidAttribute(char),
    #[error("Server nonce does not extend the client nonce")]
    NonceMismatch,
    #[error("Server rejected the proof: {0}")]
    Rejected(String),
    #[error("Server signature does not match")]
    SignatureMismatch,
    #[error("Unexpected SASL message for the current exchange step")]
    OutOfOrder,
}

enum Step {
    /// client-first sent, waiting for server-first
    First,
    /// client-final sent, waiting for the server signature
    Final {
        salted_password: [u8; 32],
        auth_message: String,
    },
    Done,
}

/// Client side of a SCRAM-SHA-256 exchange.
pub struct ScramClient {
    password: String,
    client_first_bare: String,
    nonce: String,
    step: Step,
}

impl ScramClient {
    pub fn new(user: &str, password: &str) -> Self {
        let raw: [u8; 18] = rand::thread_rng().gen();
        Self::with_nonce(user, password, BASE64.encode(raw))
    }

    fn with_nonce(user: &str, password: &str, nonce: String) -> Self {
        // ',' and '=' are reserved in SCRAM attribute values
        let user = user.replace('=', "=3D").replace(',', "=2C");
        Self {
            password: password.to_string(),
            client_first_bare: format!("n={},r={}", user, nonce),
            nonce,
            step: Step::First,
        }
    }

    /// Payload of SASLInitialResponse.
    pub fn client_first(&self) -> Bytes {
        Bytes::from(format!("{}{}", GS2_HEADER, self.client_first_bare))
    }

    /// Consume server-first (`r=..,s=..,i=..`) and produce client-final.
    pub fn server_first(&mut self, data: &[u8]) -> Result<Bytes, ScramError> {
        if !matches!(self.step, Step::First) {
            return Err(ScramError::OutOfOrder);
        }
        let message = std::str::from_utf8(data).map_err(|_| ScramError::NotUtf8)?;

        let nonce = attribute(message, 'r')?;
        if !nonce.starts_with(&self.nonce) || nonce.len() == self.nonce.len() {
            return Err(ScramError::NonceMismatch);
        }
        let salt = BASE64
            .decode(attribute(message, 's')?)
            .map_err(|_| ScramError::InvalidAttribute('s'))?;
        let iterations: u32 = attribute(message, 'i')?
            .parse()
            .ok()
            .filter(|i| *i > 0)
            .ok_or(ScramError::InvalidAttribute('i'))?;

        // Not needed past this step
        let password = std::mem::take(&mut self.password);
        let salted_password = salt_password(&password, &salt, iterations)?;
        let client_key = hmac(&salted_password, b"Client Key");
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();

        let without_proof = format!("c={},r={}", CHANNEL_BINDING, nonce);
        let auth_message = format!("{},{},{}", self.client_first_bare, message, without_proof);

        let signature = hmac(&stored_key, auth_message.as_bytes());
        let proof: Vec<u8> = client_key
            .iter()
            .zip(signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        self.step = Step::Final {
            salted_password,
            auth_message,
        };
        Ok(Bytes::from(format!(
            "{},p={}",
            without_proof,
            BASE64.encode(proof)
        )))
    }

    /// Check the server signature in server-final (`v=..` or `e=..`).
    pub fn server_final(&mut self, data: &[u8]) -> Result<(), ScramError> {
        let Step::Final {
            salted_password,
            auth_message,
        } = std::mem::replace(&mut self.step, Step::Done)
        else {
            return Err(ScramError::OutOfOrder);
        };
        let message = std::str::from_utf8(data).map_err(|_| ScramError::NotUtf8)?;

        if let Ok(reason) = attribute(message, 'e') {
            return Err(ScramError::Rejected(reason.to_string()));
        }
        let verifier = BASE64
            .decode(attribute(message, 'v')?)
            .map_err(|_| ScramError::InvalidAttribute('v'))?;

        let server_key = hmac(&salted_password, b"Server Key");
        let mut mac = keyed(&server_key);
        mac.update(auth_message.as_bytes());
        mac.verify_slice(&verifier)
            .map_err(|_| ScramError::SignatureMismatch)
    }
}

/// Value of the `name=` attribute in a comma separated SCRAM message.
fn attribute(message: &str, name: char) -> Result<&str, ScramError> {
    message
        .split(',')
        .find_map(|part| {
            let mut chars = part.chars();
            (chars.next() == Some(name) && chars.next() == Some('=')).then(|| &part[2..])
        })
        .ok_or(ScramError::MissingAttribute(name))
}

/// Hi(password, salt, i) from RFC 5802: PBKDF2 with HMAC-SHA-256.
fn salt_password(password: &str, salt: &[u8], iterations: u32) -> Result<[u8; 32], ScramError> {
    let mut out = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut out)
        .map_err(|_| ScramError::InvalidAttribute('s'))?;
    Ok(out)
}

fn keyed(key: &[u8]) -> HmacSha256 {
    match <HmacSha256 as Mac>::new_from_slice(key) {
        Ok(mac) => mac,
        // HMAC accepts keys of any length
        Err(_) => unreachable!(),
    }
}

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = keyed(key);
    mac.update(data);
    mac.finalize().into_bytes().into()
}
