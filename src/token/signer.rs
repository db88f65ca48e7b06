use crate::token::Token;
use rand::rngs::OsRng;
use secp256k1::{ecdsa, All, Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignerError {
    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Invalid key bytes: {0}")]
    InvalidKey(String),
}

/// Issuer (intermediary) secp256k1 keypair
#[derive(Clone)]
pub struct IssuerKeypair {
    secret: SecretKey,
    public: PublicKey,
}

impl IssuerKeypair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret, public) = secp.generate_keypair(&mut OsRng);
        Self { secret, public }
    }

    /// Restore a keypair from its 32 secret bytes
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, SignerError> {
        if bytes.len() != 32 {
            return Err(SignerError::InvalidKeyLength {
                expected: 32,
                got: bytes.len(),
            });
        }

        let secret =
            SecretKey::from_slice(bytes).map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        let public = PublicKey::from_secret_key(&Secp256k1::new(), &secret);
        Ok(Self { secret, public })
    }

    /// Secret key bytes
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.secret_bytes()
    }

    /// Public half
    pub fn public_key(&self) -> IssuerPublicKey {
        IssuerPublicKey(self.public)
    }

    /// DER ECDSA signature over SHA-256 of `bytes`
    pub fn sign_bytes(&self, bytes: &[u8]) -> Vec<u8> {
        Secp256k1::signing_only()
            .sign_ecdsa(&digest_message(bytes), &self.secret)
            .serialize_der()
            .to_vec()
    }
}

/// Issuer public key used to verify token signatures
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IssuerPublicKey(PublicKey);

impl IssuerPublicKey {
    /// Parse a compressed (33) or uncompressed (65) SEC1 public key
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SignerError> {
        PublicKey::from_slice(bytes)
            .map(Self)
            .map_err(|e| SignerError::InvalidKey(e.to_string()))
    }

    /// Compressed SEC1 encoding
    pub fn to_bytes(&self) -> [u8; 33] {
        self.0.serialize()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Check a signature made by [`IssuerKeypair::sign_bytes`]
    pub fn verify_bytes(&self, bytes: &[u8], der_signature: &[u8]) -> bool {
        let Ok(mut signature) = ecdsa::Signature::from_der(der_signature) else {
            return false;
        };
        signature.normalize_s();
        Secp256k1::verification_only()
            .verify_ecdsa(&digest_message(bytes), &signature, &self.0)
            .is_ok()
    }
}

fn digest_message(bytes: &[u8]) -> Message {
    let digest: [u8; 32] = Sha256::digest(bytes).into();
    Message::from_digest(digest)
}

/// Issues token signatures (SHA-256 with ECDSA over the canonical encoding)
pub struct TokenSigner {
    secp: Secp256k1<All>,
    keypair: IssuerKeypair,
}

impl TokenSigner {
    pub fn new(keypair: IssuerKeypair) -> Self {
        Self {
            secp: Secp256k1::new(),
            keypair,
        }
    }

    /// Sign `(id, amount, date_created)`, returning a DER signature
    pub fn sign(&self, id: &str, amount: i64, date_created: i64) -> Vec<u8> {
        let message = digest_message(&Token::signing_bytes(id, amount, date_created));
        self.secp
            .sign_ecdsa(&message, &self.keypair.secret)
            .serialize_der()
            .to_vec()
    }

    /// Mint a signed token for `owner` at `date_created`
    pub fn issue(&self, owner: &str, amount: i64, date_created: i64) -> Token {
        let id = Token::create_id(owner, date_created);
        let signature = self.sign(&id, amount, date_created);
        Token::new(id, amount, signature, date_created)
    }

    /// Verifier for this signer's public key
    pub fn verifier(&self) -> TokenVerifier {
        TokenVerifier::new(self.keypair.public_key())
    }
}

/// Checks issuer signatures on received tokens
#[derive(Clone, Debug)]
pub struct TokenVerifier {
    secp: Secp256k1<All>,
    issuer: IssuerPublicKey,
}

impl TokenVerifier {
    pub fn new(issuer: IssuerPublicKey) -> Self {
        Self {
            secp: Secp256k1::new(),
            issuer,
        }
    }

    pub fn issuer(&self) -> &IssuerPublicKey {
        &self.issuer
    }

    /// True if the token's signature covers its current id, amount and date
    pub fn verify(&self, token: &Token) -> bool {
        let mut signature = match ecdsa::Signature::from_der(token.issuer_signature()) {
            Ok(sig) => sig,
            Err(_) => return false,
        };
        // Accept high-S encodings produced by other ECDSA stacks
        signature.normalize_s();

        let message = digest_message(&token.to_signing_bytes());
        self.secp
            .verify_ecdsa(&message, &signature, &self.issuer.0)
            .is_ok()
    }

    /// First token whose signature does not verify
    pub fn find_forged<'a>(&self, tokens: &'a [Token]) -> Option<&'a Token> {
        tokens.iter().find(|token| !self.verify(token))
    }
}
