//! Conversions between wire types and core resource types.
use chrono::{DateTime, TimeZone, Utc};
use jumpstarter_core::{Condition, Duration, Expression, Selector};
use tonic::Status;

use crate::proto;

pub fn timestamp_to_chrono(ts: &prost_types::Timestamp) -> Result<DateTime<Utc>, Status> {
    Utc.timestamp_opt(ts.seconds, ts.nanos.max(0) as u32)
        .single()
        .ok_or_else(|| Status::invalid_argument("timestamp out of range"))
}

pub fn chrono_to_timestamp(dt: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: dt.timestamp(),
        nanos: dt.timestamp_subsec_nanos().min(999_999_999) as i32,
    }
}

pub fn duration_to_core(d: &prost_types::Duration) -> Result<Duration, Status> {
    if d.seconds < 0 || d.nanos < 0 {
        return Err(Status::invalid_argument("duration must not be negative"));
    }
    Ok(std::time::Duration::new(d.seconds as u64, d.nanos as u32).into())
}

pub fn core_to_duration(d: Duration) -> prost_types::Duration {
    let std: std::time::Duration = d.into();
    prost_types::Duration {
        seconds: std.as_secs() as i64,
        nanos: std.subsec_nanos() as i32,
    }
}

pub fn selector_from_proto(selector: Option<proto::LabelSelector>) -> Result<Selector, Status> {
    let Some(selector) = selector else {
        return Ok(Selector::default());
    };
    let mut expressions: Vec<Expression> = selector
        .match_labels
        .into_iter()
        .map(|(k, v)| Expression::Equal(k, v))
        .collect();
    for req in selector.match_expressions {
        let values = || req.values.iter().cloned().collect();
        let expr = match req.operator.as_str() {
            "In" => Expression::In(req.key, values()),
            "NotIn" => Expression::NotIn(req.key, values()),
            "Exists" => Expression::Exists(req.key),
            "DoesNotExist" => Expression::DoesNotExist(req.key),
            other => {
                return Err(Status::invalid_argument(format!("unknown selector operator {other:?}")))
            }
        };
        expressions.push(expr);
    }
    Ok(expressions.into_iter().collect())
}

pub fn selector_to_proto(selector: &Selector) -> proto::LabelSelector {
    // The wire selector spec is already the serde shape of `Selector`.
    let value = serde_json::to_value(selector).unwrap_or_default();
    let match_labels = value["matchLabels"]
        .as_object()
        .map(|m| {
            m.iter()
                .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string()))
                .collect()
        })
        .unwrap_or_default();
    let match_expressions = value["matchExpressions"]
        .as_array()
        .map(|reqs| {
            reqs.iter()
                .map(|req| proto::LabelSelectorRequirement {
                    key: req["key"].as_str().unwrap_or_default().to_string(),
                    operator: req["operator"].as_str().unwrap_or_default().to_string(),
                    values: req["values"]
                        .as_array()
                        .map(|vs| {
                            vs.iter()
                                .map(|v| v.as_str().unwrap_or_default().to_string())
                                .collect()
                        })
                        .unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default();
    proto::LabelSelector {
        match_labels,
        match_expressions,
    }
}

pub fn condition_to_proto(condition: &Condition) -> proto::Condition {
    proto::Condition {
        r#type: condition.type_.clone(),
        status: condition.status.clone(),
        reason: condition.reason.clone(),
        message: condition.message.clone(),
        last_transition_time: Some(chrono_to_timestamp(condition.last_transition_time)),
    }
}

/// Parse an equality-based selector string, e.g. `"dut=a,board=rev2"`.
pub fn parse_label_selector(raw: &str) -> Result<Selector, Status> {
    if raw.is_empty() {
        return Ok(Selector::default());
    }
    raw.split(',')
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or_else(|| Status::invalid_argument(format!("malformed selector term {pair:?}")))
        })
        .collect()
}
