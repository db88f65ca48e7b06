// Token module - THE MONEY
// Bill-style cash tokens, issuer ECDSA signatures, and list encoding

mod codec;
mod model;
mod signer;

pub use codec::{CodecError, TokenCodec};
pub use model::{checked_total_amount, total_amount, Token};
pub use signer::{IssuerKeypair, IssuerPublicKey, SignerError, TokenSigner, TokenVerifier};
