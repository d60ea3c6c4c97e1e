//! Bearer-credential resolution.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{token::TokenService, Error};

/// The principal resolved from a bearer credential.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub username: String,
    pub uid: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, Vec<String>>,
}

/// Resolves controller-audience bearer tokens to principals.
///
/// The username is the configured prefix followed by the token subject
/// (`kind:namespace:name:uid`), the same string the built-in authorizer
/// synthesizes from the object side.
pub struct Authenticator {
    prefix: String,
}

impl Authenticator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn resolve(&self, tokens: &TokenService, bearer: &str) -> Result<UserInfo, Error> {
        let claims = tokens.verify_controller_token(bearer)?;
        // Subjects are kind:namespace:name:uid; anything else is foreign.
        if claims.sub.split(':').count() != 4 {
            return Err(Error::InvalidSubject(claims.sub));
        }
        Ok(UserInfo {
            username: format!("{}{}", self.prefix, claims.sub),
            uid: claims.uid.unwrap_or_default(),
            groups: vec![],
            extra: BTreeMap::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jumpstarter_core::ObjectRef;

    #[test]
    fn resolves_prefixed_username() {
        let tokens = TokenService::new("https://jumpstarter.example", b"c", b"r");
        let authn = Authenticator::new("internal:");
        let obj = ObjectRef {
            kind: "Client".into(),
            namespace: "lab".into(),
            name: "ci-bot".into(),
        };
        let bearer = tokens.mint_controller_token(&obj, "uid-1").unwrap();
        let user = authn.resolve(&tokens, &bearer).unwrap();
        assert_eq!(user.username, "internal:Client:lab:ci-bot:uid-1");
        assert_eq!(user.uid, "uid-1");
    }

    #[test]
    fn rejects_garbage_bearer() {
        let tokens = TokenService::new("https://jumpstarter.example", b"c", b"r");
        let authn = Authenticator::new("internal:");
        assert!(authn.resolve(&tokens, "not-a-jwt").is_err());
    }
}
