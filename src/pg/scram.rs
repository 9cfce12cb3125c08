//! SCRAM-SHA-256 client exchange (RFC 5802 / RFC 7677) for backend login.
//!
//! The exchange is modelled as two steps: [`ScramClient`] produces the
//! client-first message and consumes the server-first message, yielding the
//! client-final message plus a [`ServerVerifier`] that checks the
//! server-final signature.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Mechanism name announced in `SASLInitialResponse`.
pub const MECHANISM: &str = "SCRAM-SHA-256";

/// GS2 header without channel binding, base64 encoded ("n,,").
const GS2_HEADER_B64: &str = "biws";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScramError {
    #[error("server message is not valid UTF-8")]
    NotUtf8,
    #[error("server-first message is missing the {0} attribute")]
    MissingAttribute(&'static str),
    #[error("server-first message has a malformed {0} attribute")]
    MalformedAttribute(&'static str),
    #[error("server nonce does not extend the client nonce")]
    NonceMismatch,
    #[error("server-final message carries no verifier")]
    MissingVerifier,
    #[error("server signature does not match")]
    SignatureMismatch,
    #[error("key derivation failed")]
    KeyDerivation,
}

/// First half of the exchange: owns the credentials and the client nonce.
pub struct ScramClient {
    username: String,
    password: String,
    client_nonce: String,
}

/// Second half of the exchange: the expected server signature.
pub struct ServerVerifier {
    expected: [u8; 32],
}

impl ScramClient {
    /// Create a client with a fresh random nonce.
    pub fn new(username: &str, password: &str) -> Self {
        let nonce_bytes: [u8; 18] = rand::thread_rng().gen();
        Self::with_nonce(username, password, &BASE64.encode(nonce_bytes))
    }

    fn with_nonce(username: &str, password: &str, nonce: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            client_nonce: nonce.to_string(),
        }
    }

    fn client_first_bare(&self) -> String {
        format!("n={},r={}", self.username, self.client_nonce)
    }

    /// `n,,n=<user>,r=<nonce>`
    pub fn client_first(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare()).into_bytes()
    }

    /// Consume `r=<nonce>,s=<salt>,i=<iterations>` and produce the
    /// client-final message with its proof.
    pub fn handle_server_first(
        self,
        server_first: &[u8],
    ) -> Result<(Vec<u8>, ServerVerifier), ScramError> {
        let server_first = std::str::from_utf8(server_first).map_err(|_| ScramError::NotUtf8)?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for attr in server_first.split(',') {
            match attr.split_once('=') {
                Some(("r", v)) => nonce = Some(v),
                Some(("s", v)) => {
                    salt = Some(
                        BASE64
                            .decode(v)
                            .map_err(|_| ScramError::MalformedAttribute("salt"))?,
                    )
                }
                Some(("i", v)) => {
                    iterations = Some(
                        v.parse::<u32>()
                            .map_err(|_| ScramError::MalformedAttribute("iteration"))?,
                    )
                }
                _ => {}
            }
        }
        let nonce = nonce.ok_or(ScramError::MissingAttribute("nonce"))?;
        let salt = salt.ok_or(ScramError::MissingAttribute("salt"))?;
        let iterations = iterations.ok_or(ScramError::MissingAttribute("iteration"))?;

        if !nonce.starts_with(&self.client_nonce) || nonce.len() == self.client_nonce.len() {
            return Err(ScramError::NonceMismatch);
        }

        let mut salted = [0u8; 32];
        pbkdf2::pbkdf2::<HmacSha256>(self.password.as_bytes(), &salt, iterations, &mut salted)
            .map_err(|_| ScramError::KeyDerivation)?;

        let client_key = hmac(&salted, b"Client Key")?;
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();

        let final_without_proof = format!("c={},r={}", GS2_HEADER_B64, nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_first,
            final_without_proof
        );

        let client_signature = hmac(&stored_key, auth_message.as_bytes())?;
        let mut proof = client_key;
        proof
            .iter_mut()
            .zip(client_signature.iter())
            .for_each(|(p, s)| *p ^= s);

        let server_key = hmac(&salted, b"Server Key")?;
        let expected = hmac(&server_key, auth_message.as_bytes())?;

        let client_final = format!("{},p={}", final_without_proof, BASE64.encode(proof));
        Ok((client_final.into_bytes(), ServerVerifier { expected }))
    }
}

impl ServerVerifier {
    /// Check `v=<signature>` from the server-final message.
    pub fn verify(&self, server_final: &[u8]) -> Result<(), ScramError> {
        let server_final = std::str::from_utf8(server_final).map_err(|_| ScramError::NotUtf8)?;
        let signature = server_final
            .split(',')
            .find_map(|attr| attr.strip_prefix("v="))
            .ok_or(ScramError::MissingVerifier)?;
        let signature = BASE64
            .decode(signature)
            .map_err(|_| ScramError::SignatureMismatch)?;

        if signature.as_slice() != self.expected.as_slice() {
            return Err(ScramError::SignatureMismatch);
        }
        Ok(())
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Result<[u8; 32], ScramError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| ScramError::KeyDerivation)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}
