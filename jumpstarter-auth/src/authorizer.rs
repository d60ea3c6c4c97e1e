//! Deciding whether a principal *is* a given object.
use cel::{Context, Program};
use jumpstarter_core::Resource;
use serde::Serialize;

use crate::{authenticator::UserInfo, Error};

/// Matches resolved principals against `Client`/`Exporter` objects.
///
/// `Basic` compares the username to the synthesized subject; `Cel` evaluates
/// a configured expression with `self`, `user`, `kind` and `prefix` in
/// scope. Expressions are compiled once per configuration load.
pub enum Authorizer {
    Basic {
        prefix: String,
    },
    Cel {
        prefix: String,
        program: Program,
    },
}

impl Authorizer {
    pub fn basic(prefix: impl Into<String>) -> Self {
        Authorizer::Basic { prefix: prefix.into() }
    }

    pub fn cel(prefix: impl Into<String>, expression: &str) -> Result<Self, Error> {
        let program = Program::compile(expression).map_err(|e| Error::Expression(e.to_string()))?;
        Ok(Authorizer::Cel {
            prefix: prefix.into(),
            program,
        })
    }

    /// Whether `user` is the principal for `obj`.
    ///
    /// `username_override` is the object's `spec.username`, which replaces
    /// the synthesized subject in the basic comparison when set.
    pub fn authorize<K: Resource + Serialize>(
        &self,
        user: &UserInfo,
        obj: &K,
        username_override: Option<&str>,
    ) -> Result<bool, Error> {
        match self {
            Authorizer::Basic { prefix } => {
                let expected = match username_override {
                    Some(username) => username.to_string(),
                    None => {
                        let meta = obj.meta();
                        format!(
                            "{prefix}{}:{}:{}:{}",
                            K::KIND,
                            meta.namespace,
                            meta.name,
                            meta.uid
                        )
                    }
                };
                Ok(user.username == expected)
            }
            Authorizer::Cel { prefix, program } => {
                let mut ctx = Context::default();
                ctx.add_variable("self", serde_json::to_value(obj)?)
                    .map_err(|e| Error::Expression(e.to_string()))?;
                ctx.add_variable("user", serde_json::to_value(user)?)
                    .map_err(|e| Error::Expression(e.to_string()))?;
                ctx.add_variable("kind", K::KIND)
                    .map_err(|e| Error::Expression(e.to_string()))?;
                ctx.add_variable("prefix", prefix.as_str())
                    .map_err(|e| Error::Expression(e.to_string()))?;
                match program.execute(&ctx).map_err(|e| Error::Expression(e.to_string()))? {
                    cel::Value::Bool(decision) => Ok(decision),
                    _ => Err(Error::NonBooleanExpression),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jumpstarter_core::{Client, ClientSpec, Metadata};

    fn client(username: Option<&str>) -> Client {
        Client {
            metadata: Metadata {
                uid: "uid-1".into(),
                ..Metadata::named("lab", "ci-bot")
            },
            spec: ClientSpec {
                username: username.map(String::from),
            },
        }
    }

    fn user(username: &str) -> UserInfo {
        UserInfo {
            username: username.into(),
            uid: "uid-1".into(),
            ..UserInfo::default()
        }
    }

    #[test]
    fn basic_matches_synthesized_subject() {
        let authz = Authorizer::basic("internal:");
        let obj = client(None);
        assert!(authz
            .authorize(&user("internal:Client:lab:ci-bot:uid-1"), &obj, None)
            .unwrap());
        assert!(!authz
            .authorize(&user("internal:Client:lab:other:uid-1"), &obj, None)
            .unwrap());
    }

    #[test]
    fn basic_honours_username_override() {
        let authz = Authorizer::basic("internal:");
        let obj = client(Some("alice@example.com"));
        assert!(authz
            .authorize(&user("alice@example.com"), &obj, obj.spec.username.as_deref())
            .unwrap());
        assert!(!authz
            .authorize(&user("internal:Client:lab:ci-bot:uid-1"), &obj, obj.spec.username.as_deref())
            .unwrap());
    }

    #[test]
    fn cel_expression_sees_self_and_user() {
        let authz = Authorizer::cel(
            "internal:",
            "user.username == prefix + kind + ':' + self.metadata.namespace + ':' + self.metadata.name + ':' + self.metadata.uid",
        )
        .unwrap();
        let obj = client(None);
        assert!(authz
            .authorize(&user("internal:Client:lab:ci-bot:uid-1"), &obj, None)
            .unwrap());
        assert!(!authz
            .authorize(&user("internal:Exporter:lab:ci-bot:uid-1"), &obj, None)
            .unwrap());
    }

    #[test]
    fn non_boolean_expression_is_an_error() {
        let authz = Authorizer::cel("internal:", "user.username").unwrap();
        let obj = client(None);
        assert!(matches!(
            authz.authorize(&user("x"), &obj, None),
            Err(Error::NonBooleanExpression)
        ));
    }

    #[test]
    fn bad_expression_fails_at_compile_time() {
        assert!(Authorizer::cel("internal:", "user.username ==").is_err());
    }
}
