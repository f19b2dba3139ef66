//! Key expression parsing
//!
//! Accepted forms, optionally prefixed by a `[fingerprint/path]` origin:
//! - 32-byte x-only or 33-byte compressed public key in hex
//! - WIF private key
//! - `xpub`/`tpub` or `xprv`/`tprv` followed by an unranged `/`-separated
//!   derivation suffix (hardened steps only below private keys)

use crate::{Error, Result};
use bitcoin::bip32::{DerivationPath, Xpriv, Xpub};
use bitcoin::secp256k1::{All, Keypair, PublicKey, Secp256k1, XOnlyPublicKey};
use bitcoin::PrivateKey;
use std::str::FromStr;

/// A parsed key expression
#[derive(Clone)]
pub struct KeyExpr {
    /// Public key committed to by the expression
    pub public: XOnlyPublicKey,
    /// Signing key, when the expression carried private material
    pub keypair: Option<Keypair>,
}

impl KeyExpr {
    /// Whether the expression carried private material
    pub fn is_private(&self) -> bool {
        self.keypair.is_some()
    }
}

/// Parse one key expression
pub fn parse_key(text: &str, secp: &Secp256k1<All>) -> Result<KeyExpr> {
    let key = strip_origin(text)?;

    if key.is_empty() {
        return Err(Error::invalid_key(text, "empty key expression"));
    }
    if key.contains('*') {
        return Err(Error::invalid_key(text, "ranged keys are not supported"));
    }

    let (base, suffix) = match key.split_once('/') {
        Some((base, suffix)) => (base, Some(suffix)),
        None => (key, None),
    };

    if base.starts_with("xpub") || base.starts_with("tpub") {
        let xpub = Xpub::from_str(base).map_err(|e| Error::invalid_key(text, e))?;
        let xpub = match suffix {
            Some(suffix) => xpub
                .derive_pub(secp, &derivation_path(text, suffix)?)
                .map_err(|e| Error::invalid_key(text, e))?,
            None => xpub,
        };
        return Ok(KeyExpr {
            public: XOnlyPublicKey::from(xpub.public_key),
            keypair: None,
        });
    }

    if base.starts_with("xprv") || base.starts_with("tprv") {
        let xpriv = Xpriv::from_str(base).map_err(|e| Error::invalid_key(text, e))?;
        let xpriv = match suffix {
            Some(suffix) => xpriv
                .derive_priv(secp, &derivation_path(text, suffix)?)
                .map_err(|e| Error::invalid_key(text, e))?,
            None => xpriv,
        };
        let keypair = Keypair::from_secret_key(secp, &xpriv.private_key);
        return Ok(KeyExpr {
            public: keypair.x_only_public_key().0,
            keypair: Some(keypair),
        });
    }

    if suffix.is_some() {
        return Err(Error::invalid_key(
            text,
            "derivation is only allowed below extended keys",
        ));
    }

    if base.chars().all(|c| c.is_ascii_hexdigit()) {
        let bytes = hex::decode(base).map_err(|e| Error::invalid_key(text, e))?;
        let public = match bytes.len() {
            32 => XOnlyPublicKey::from_slice(&bytes).map_err(|e| Error::invalid_key(text, e))?,
            33 => PublicKey::from_slice(&bytes)
                .map_err(|e| Error::invalid_key(text, e))?
                .x_only_public_key()
                .0,
            n => {
                return Err(Error::invalid_key(
                    text,
                    format!("expected a 32 or 33 byte public key, got {} bytes", n),
                ))
            }
        };
        return Ok(KeyExpr {
            public,
            keypair: None,
        });
    }

    let private = PrivateKey::from_wif(base).map_err(|e| Error::invalid_key(text, e))?;
    let keypair = Keypair::from_secret_key(secp, &private.inner);
    Ok(KeyExpr {
        public: keypair.x_only_public_key().0,
        keypair: Some(keypair),
    })
}

fn strip_origin(text: &str) -> Result<&str> {
    let Some(rest) = text.strip_prefix('[') else {
        return Ok(text);
    };
    let (origin, key) = rest
        .split_once(']')
        .ok_or_else(|| Error::invalid_key(text, "unterminated key origin"))?;
    let fingerprint = origin.split('/').next().unwrap_or_default();
    if fingerprint.len() != 8 || !fingerprint.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::invalid_key(text, "key origin fingerprint must be 8 hex characters"));
    }
    Ok(key)
}

fn derivation_path(text: &str, suffix: &str) -> Result<DerivationPath> {
    DerivationPath::from_str(&format!("m/{}", suffix)).map_err(|e| Error::invalid_key(text, e))
}
