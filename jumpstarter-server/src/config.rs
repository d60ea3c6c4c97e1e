//! Controller configuration.
//!
//! A single YAML document plus a handful of process-wide environment inputs
//! (signing keys, advertised endpoint, namespace). Everything is read at
//! startup; key rotation requires a restart.
use std::{collections::BTreeMap, path::Path};

use jumpstarter_auth::Authorizer;
use jumpstarter_core::Duration;
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file")]
    Parse(#[from] serde_yaml::Error),

    #[error("authorization type is CEL but no expression is configured")]
    MissingCelExpression,

    #[error("missing required environment variable {0}")]
    MissingEnv(&'static str),

    #[error("invalid authorization expression")]
    Authorizer(#[from] jumpstarter_auth::Error),
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub authentication: Authentication,
    #[serde(default)]
    pub authorization: Authorization,
    #[serde(default)]
    pub grpc: Grpc,
    #[serde(default)]
    pub exporter_options: ExporterOptions,
    /// Configured routers, keyed by name. Dial picks one at random.
    #[serde(default)]
    pub router: BTreeMap<String, RouterEndpoint>,
    #[serde(default)]
    pub provisioning: Provisioning,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Authentication {
    #[serde(default)]
    pub internal: InternalAuthentication,
    /// Additional OIDC JWT authenticators honoured by the fronting edge.
    #[serde(default)]
    pub jwt: Vec<JwtAuthenticator>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalAuthentication {
    pub prefix: String,
}

impl Default for InternalAuthentication {
    fn default() -> Self {
        Self {
            prefix: "internal:".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JwtAuthenticator {
    pub issuer: String,
    #[serde(default)]
    pub audience: Option<String>,
    #[serde(default)]
    pub username_claim: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Authorization {
    #[serde(rename = "type", default)]
    pub type_: AuthorizationType,
    #[serde(default)]
    pub cel: Option<CelAuthorization>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
pub enum AuthorizationType {
    #[default]
    Basic,
    #[serde(rename = "CEL")]
    Cel,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CelAuthorization {
    pub expression: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Grpc {
    #[serde(default)]
    pub keepalive: Keepalive,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Keepalive {
    /// Minimum interval between client pings tolerated by the edge.
    pub min_time: Duration,
    pub permit_without_stream: bool,
    #[serde(default)]
    pub server_params: Option<ServerParams>,
}

impl Default for Keepalive {
    fn default() -> Self {
        Self {
            min_time: Duration::from_secs(5),
            permit_without_stream: true,
            server_params: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerParams {
    pub time: Duration,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExporterOptions {
    pub offline_timeout: Duration,
}

impl Default for ExporterOptions {
    fn default() -> Self {
        Self {
            offline_timeout: Duration::from_secs(90),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterEndpoint {
    pub endpoint: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Provisioning {
    #[serde(default)]
    pub enabled: bool,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(&std::fs::read_to_string(path)?)?)
    }

    /// Compile the configured authorizer once; CEL programs are reused for
    /// every request until the next config load.
    pub fn authorizer(&self) -> Result<Authorizer, Error> {
        let prefix = self.authentication.internal.prefix.clone();
        match self.authorization.type_ {
            AuthorizationType::Basic => Ok(Authorizer::basic(prefix)),
            AuthorizationType::Cel => {
                let cel = self.authorization.cel.as_ref().ok_or(Error::MissingCelExpression)?;
                Ok(Authorizer::cel(prefix, &cel.expression)?)
            }
        }
    }
}

/// Process-wide inputs read from the environment at startup.
#[derive(Debug, Clone)]
pub struct EnvInputs {
    pub controller_key: String,
    pub router_key: String,
    /// Endpoint advertised to clients and exporters.
    pub grpc_endpoint: String,
    pub namespace: String,
}

impl EnvInputs {
    pub fn from_env() -> Result<Self, Error> {
        fn var(name: &'static str) -> Result<String, Error> {
            std::env::var(name).map_err(|_| Error::MissingEnv(name))
        }
        Ok(Self {
            controller_key: var("CONTROLLER_KEY")?,
            router_key: var("ROUTER_KEY")?,
            grpc_endpoint: var("GRPC_ENDPOINT")?,
            namespace: var("NAMESPACE")?,
        })
    }
}
