use thiserror::Error;

/// Errors produced while validating or manipulating core resource types.
#[derive(Error, Debug)]
pub enum Error {
    /// A lease's `(beginTime, endTime, duration)` triple is inconsistent.
    #[error("inconsistent lease time fields: endTime != beginTime + duration")]
    InvalidTimeTriple,

    /// A lease carries too few time fields to derive the rest.
    #[error("lease must specify a duration or both beginTime and endTime")]
    UnderspecifiedTimes,

    /// An update tried to extend a lease past its admitted window.
    #[error("lease duration may be shortened but not extended after binding")]
    DurationExtension,

    /// A selector expression could not be parsed.
    #[error("invalid selector: {0}")]
    InvalidSelector(String),

    /// An object reference string did not have the `kind:namespace:name` shape.
    #[error("invalid object reference {0:?}")]
    InvalidObjectRef(String),

    /// Serialization of a resource failed.
    #[error("error serializing resource")]
    Serde(#[from] serde_json::Error),
}
