//! HMAC token minting and verification for the controller and router
//! audiences.
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use jumpstarter_core::ObjectRef;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Error;

/// Audience of long-lived tokens bound to a `Client` or `Exporter`.
pub const CONTROLLER_AUDIENCE: &str = "jumpstarter-controller";
/// Audience of stream tickets accepted by the router.
pub const ROUTER_AUDIENCE: &str = "jumpstarter-router";
/// Router tickets expire this long after issue; pending stream halves older
/// than this are garbage collected.
pub const ROUTER_TICKET_LIFETIME: Duration = Duration::minutes(30);

/// Registered and private claims carried by both HMAC audiences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub iat: i64,
    pub nbf: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    /// UID of the referenced object, for resurrection-proof binding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

impl Claims {
    /// Enforce that the referenced object still carries the UID this token
    /// was minted against.
    pub fn require_uid(&self, current_uid: &str) -> Result<(), Error> {
        match self.uid.as_deref() {
            Some(uid) if uid == current_uid => Ok(()),
            _ => Err(Error::UidMismatch),
        }
    }
}

/// Mints and verifies the two HMAC audiences.
///
/// Keys are process-wide inputs read at startup; rotating either requires a
/// restart.
pub struct TokenService {
    issuer: String,
    controller_encoding: EncodingKey,
    controller_decoding: DecodingKey,
    router_encoding: EncodingKey,
    router_decoding: DecodingKey,
}

impl TokenService {
    pub fn new(issuer: impl Into<String>, controller_secret: &[u8], router_secret: &[u8]) -> Self {
        Self {
            issuer: issuer.into(),
            controller_encoding: EncodingKey::from_secret(controller_secret),
            controller_decoding: DecodingKey::from_secret(controller_secret),
            router_encoding: EncodingKey::from_secret(router_secret),
            router_decoding: DecodingKey::from_secret(router_secret),
        }
    }

    /// Long-lived controller token for a `Client` or `Exporter`.
    ///
    /// The subject is `kind:namespace:name:uid`, the same string the built-in
    /// authorizer synthesizes when matching principals to objects.
    pub fn mint_controller_token(&self, obj: &ObjectRef, uid: &str) -> Result<String, Error> {
        let now = Utc::now();
        let claims = Claims {
            iss: self.issuer.clone(),
            sub: format!("{obj}:{uid}"),
            aud: CONTROLLER_AUDIENCE.to_string(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: None,
            uid: Some(uid.to_string()),
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.controller_encoding)?)
    }

    pub fn verify_controller_token(&self, token: &str) -> Result<Claims, Error> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[CONTROLLER_AUDIENCE]);
        validation.set_issuer(&[&self.issuer]);
        validation.set_required_spec_claims(&["iss", "aud", "sub", "nbf"]);
        validation.validate_exp = false;
        validation.validate_nbf = true;
        Ok(decode::<Claims>(token, &self.controller_decoding, &validation)?.claims)
    }

    /// 30-minute router ticket carrying the stream ID as its subject.
    pub fn mint_router_ticket(&self, stream_id: Uuid) -> Result<String, Error> {
        self.mint_router_ticket_at(stream_id, Utc::now())
    }

    fn mint_router_ticket_at(&self, stream_id: Uuid, now: DateTime<Utc>) -> Result<String, Error> {
        let claims = Claims {
            iss: self.issuer.clone(),
            sub: stream_id.to_string(),
            aud: ROUTER_AUDIENCE.to_string(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: Some((now + ROUTER_TICKET_LIFETIME).timestamp()),
            uid: None,
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.router_encoding)?)
    }

    /// Verify a router ticket and return the stream ID it grants entry to.
    pub fn verify_router_ticket(&self, token: &str) -> Result<Uuid, Error> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[ROUTER_AUDIENCE]);
        validation.set_issuer(&[&self.issuer]);
        validation.set_required_spec_claims(&["iss", "aud", "sub", "exp", "nbf"]);
        validation.validate_nbf = true;
        let claims = decode::<Claims>(token, &self.router_decoding, &validation)?.claims;
        Ok(claims.sub.parse()?)
    }
}
