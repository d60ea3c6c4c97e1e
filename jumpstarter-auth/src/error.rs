use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The bearer token failed signature, audience, issuer or time checks.
    #[error("invalid token")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),

    /// A token referenced an object whose UID no longer matches.
    ///
    /// Deleting and re-creating a resource under the same name must not
    /// resurrect old credentials.
    #[error("token uid does not match the referenced object")]
    UidMismatch,

    /// A router ticket's subject was not a stream UUID.
    #[error("malformed stream id in ticket subject")]
    InvalidStreamId(#[from] uuid::Error),

    /// The token subject was not a `kind:namespace:name:uid` reference.
    #[error("malformed token subject {0:?}")]
    InvalidSubject(String),

    /// OIDC key generation or encoding failed.
    #[error("rsa key handling failed: {0}")]
    Key(String),

    /// A CEL authorization expression failed to compile or evaluate.
    #[error("authorization expression error: {0}")]
    Expression(String),

    /// A CEL expression evaluated to a non-boolean value.
    #[error("authorization expression must evaluate to a boolean")]
    NonBooleanExpression,

    #[error("error serializing value for expression evaluation")]
    Serde(#[from] serde_json::Error),
}
