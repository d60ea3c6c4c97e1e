//! Label selection for matching leases against exporters.
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    iter::FromIterator,
};

use serde::{Deserialize, Serialize};

type Map = BTreeMap<String, String>;

/// A single selector requirement.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum Expression {
    In(String, BTreeSet<String>),
    NotIn(String, BTreeSet<String>),
    Equal(String, String),
    NotEqual(String, String),
    Exists(String),
    DoesNotExist(String),
}

/// Conjunction of [`Expression`]s evaluated against an object's labels.
///
/// The empty selector matches everything, mirroring the apimachinery
/// convention lease spec selectors follow.
#[derive(Clone, Debug, Eq, PartialEq, Default, Deserialize, Serialize)]
#[serde(try_from = "SelectorSpec", into = "SelectorSpec")]
pub struct Selector(Vec<Expression>);

impl Selector {
    fn from_map(map: Map) -> Self {
        Self(map.into_iter().map(|(k, v)| Expression::Equal(k, v)).collect())
    }

    /// Whether this selector matches every object.
    pub fn selects_all(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches(&self, labels: &Map) -> bool {
        self.0.iter().all(|expr| expr.matches(labels))
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let requirements: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        f.write_str(&requirements.join(","))
    }
}

impl Expression {
    fn matches(&self, labels: &Map) -> bool {
        match self {
            Expression::In(key, values) => labels.get(key).is_some_and(|v| values.contains(v)),
            Expression::NotIn(key, values) => labels.get(key).is_none_or(|v| !values.contains(v)),
            Expression::Equal(key, value) => labels.get(key) == Some(value),
            Expression::NotEqual(key, value) => labels.get(key) != Some(value),
            Expression::Exists(key) => labels.contains_key(key),
            Expression::DoesNotExist(key) => !labels.contains_key(key),
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::In(key, values) => {
                write!(f, "{key} in ({})", values.iter().cloned().collect::<Vec<_>>().join(","))
            }
            Expression::NotIn(key, values) => {
                write!(f, "{key} notin ({})", values.iter().cloned().collect::<Vec<_>>().join(","))
            }
            Expression::Equal(key, value) => write!(f, "{key}={value}"),
            Expression::NotEqual(key, value) => write!(f, "{key}!={value}"),
            Expression::Exists(key) => write!(f, "{key}"),
            Expression::DoesNotExist(key) => write!(f, "!{key}"),
        }
    }
}

impl FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

impl FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        Self::from_map(
            iter.into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

impl FromIterator<Expression> for Selector {
    fn from_iter<T: IntoIterator<Item = Expression>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<Expression> for Selector {
    fn from(value: Expression) -> Self {
        Self(vec![value])
    }
}

/// Wire representation of a selector: `matchLabels` plus `matchExpressions`
/// with string operators, as found in lease and policy specs.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct SelectorSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    match_labels: Option<Map>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    match_expressions: Vec<Requirement>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct Requirement {
    key: String,
    operator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    values: Option<Vec<String>>,
}

impl TryFrom<SelectorSpec> for Selector {
    type Error = crate::Error;

    fn try_from(spec: SelectorSpec) -> Result<Self, Self::Error> {
        let mut selector = Selector::from_map(spec.match_labels.unwrap_or_default());
        for req in spec.match_expressions {
            let values = || req.values.clone().map(BTreeSet::from_iter);
            let expr = match req.operator.as_str() {
                "In" => Expression::In(
                    req.key.clone(),
                    values().ok_or_else(|| crate::Error::InvalidSelector(req.key.clone()))?,
                ),
                "NotIn" => Expression::NotIn(
                    req.key.clone(),
                    values().ok_or_else(|| crate::Error::InvalidSelector(req.key.clone()))?,
                ),
                "Exists" => Expression::Exists(req.key),
                "DoesNotExist" => Expression::DoesNotExist(req.key),
                other => return Err(crate::Error::InvalidSelector(other.to_string())),
            };
            selector.0.push(expr);
        }
        Ok(selector)
    }
}

impl From<Selector> for SelectorSpec {
    fn from(selector: Selector) -> Self {
        let mut labels = Map::new();
        let mut expressions = vec![];
        for expr in selector.0 {
            let (key, operator, values) = match expr {
                Expression::Equal(key, value) => {
                    labels.insert(key, value);
                    continue;
                }
                Expression::In(key, values) => (key, "In", Some(values.into_iter().collect())),
                Expression::NotIn(key, values) => (key, "NotIn", Some(values.into_iter().collect())),
                Expression::NotEqual(key, value) => (key, "NotIn", Some(vec![value])),
                Expression::Exists(key) => (key, "Exists", None),
                Expression::DoesNotExist(key) => (key, "DoesNotExist", None),
            };
            expressions.push(Requirement {
                key,
                operator: operator.to_string(),
                values,
            });
        }
        SelectorSpec {
            match_labels: (!labels.is_empty()).then_some(labels),
            match_expressions: expressions,
        }
    }
}
