//! Identity for the Jumpstarter control plane.
//!
//! Three token audiences are minted and verified here: long-lived
//! *controller* tokens bound to a `Client` or `Exporter` UID, 30-minute
//! *router* tickets bound to a stream ID, and RS256-signed *OIDC* assertions
//! whose JWKS is served to an external authenticator.
//!
//! On top of token verification sit the [`Authenticator`] (bearer →
//! [`UserInfo`]) and the [`Authorizer`] (is this principal a given `Client`
//! or `Exporter`?), the latter either as the built-in subject match or a CEL
//! expression evaluated over `{self, user, kind, prefix}`.

mod authenticator;
mod authorizer;
mod error;
pub mod oidc;
pub mod token;

pub use authenticator::{Authenticator, UserInfo};
pub use authorizer::Authorizer;
pub use error::Error;
pub use token::{Claims, TokenService, CONTROLLER_AUDIENCE, ROUTER_AUDIENCE, ROUTER_TICKET_LIFETIME};
