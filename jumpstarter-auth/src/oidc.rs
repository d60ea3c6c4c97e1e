//! Rotating RS256 signing key for OIDC flows.
//!
//! The controller signs identity assertions with the current key and
//! publishes the current and previous public keys as a JWKS, so an external
//! authenticator can keep verifying assertions across one rotation.
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rsa::{pkcs1::EncodeRsaPrivateKey, traits::PublicKeyParts, RsaPrivateKey};
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::Error;

const KEY_BITS: usize = 2048;

/// Public half of one signing key, in JWK form.
#[derive(Clone, Debug, Serialize)]
struct Jwk {
    kty: &'static str,
    alg: &'static str,
    #[serde(rename = "use")]
    use_: &'static str,
    kid: String,
    n: String,
    e: String,
}

struct SigningKey {
    kid: String,
    encoding: EncodingKey,
    public: Jwk,
}

/// The rotating OIDC keypair.
pub struct RotatingKeyPair {
    issuer: String,
    current: SigningKey,
    previous: Option<Jwk>,
}

fn generate() -> Result<SigningKey, Error> {
    let mut rng = rand_core::OsRng;
    let private = RsaPrivateKey::new(&mut rng, KEY_BITS).map_err(|e| Error::Key(e.to_string()))?;
    let der = private.to_pkcs1_der().map_err(|e| Error::Key(e.to_string()))?;
    let public = private.to_public_key();
    let n = URL_SAFE_NO_PAD.encode(public.n().to_bytes_be());
    let e = URL_SAFE_NO_PAD.encode(public.e().to_bytes_be());
    // RFC 7638 thumbprint of the required members in lexicographic order.
    let thumbprint = Sha256::digest(format!(r#"{{"e":"{e}","kty":"RSA","n":"{n}"}}"#));
    let kid = URL_SAFE_NO_PAD.encode(thumbprint);
    Ok(SigningKey {
        encoding: EncodingKey::from_rsa_der(der.as_bytes()),
        public: Jwk {
            kty: "RSA",
            alg: "RS256",
            use_: "sig",
            kid: kid.clone(),
            n,
            e,
        },
        kid,
    })
}

impl RotatingKeyPair {
    /// Generate a fresh keypair for the given issuer URL.
    pub fn new(issuer: impl Into<String>) -> Result<Self, Error> {
        Ok(Self {
            issuer: issuer.into(),
            current: generate()?,
            previous: None,
        })
    }

    /// Replace the signing key, keeping the outgoing public key in the JWKS.
    pub fn rotate(&mut self) -> Result<(), Error> {
        let next = generate()?;
        self.previous = Some(std::mem::replace(&mut self.current, next).public);
        Ok(())
    }

    /// Sign an identity assertion for `subject`, valid for `lifetime`.
    pub fn sign_assertion(
        &self,
        subject: &str,
        audience: &str,
        lifetime: Duration,
    ) -> Result<String, Error> {
        let now = Utc::now();
        let claims = json!({
            "iss": self.issuer,
            "sub": subject,
            "aud": audience,
            "iat": now.timestamp(),
            "nbf": now.timestamp(),
            "exp": (now + lifetime).timestamp(),
        });
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.current.kid.clone());
        Ok(encode(&header, &claims, &self.current.encoding)?)
    }

    /// The JWKS document served at `/.well-known/jwks`.
    pub fn jwks(&self) -> Value {
        let mut keys = vec![serde_json::to_value(&self.current.public).unwrap_or_default()];
        if let Some(previous) = &self.previous {
            keys.push(serde_json::to_value(previous).unwrap_or_default());
        }
        json!({ "keys": keys })
    }

    /// The document served at `/.well-known/openid-configuration`.
    pub fn discovery_document(&self) -> Value {
        json!({
            "issuer": self.issuer,
            "jwks_uri": format!("{}/.well-known/jwks", self.issuer),
            "response_types_supported": ["id_token"],
            "subject_types_supported": ["public"],
            "id_token_signing_alg_values_supported": ["RS256"],
        })
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }
}
