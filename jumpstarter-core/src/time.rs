//! Lease time-field reconciliation.
//!
//! A lease's `(beginTime, endTime, duration)` must satisfy
//! `endTime = beginTime + duration`; any two determine the third. Before
//! binding, clients may rewrite the triple freely; after binding, the window
//! may only shrink.
use chrono::{DateTime, Utc};

use crate::{Error, LeaseSpec, LeaseStatus};

/// Tolerance when checking a fully-specified triple for consistency.
const SKEW: chrono::Duration = chrono::Duration::milliseconds(500);

/// Fill in the missing member of the time triple, validating consistency.
///
/// A spec carrying only `duration` is left open-ended: `begin_time` is fixed
/// at binding time by the scheduler.
pub fn reconcile_time_fields(spec: &mut LeaseSpec) -> Result<(), Error> {
    match (spec.begin_time, spec.end_time, spec.duration) {
        (Some(begin), Some(end), Some(duration)) => {
            if end < begin {
                return Err(Error::InvalidTimeTriple);
            }
            let implied = begin + duration.as_chrono();
            if (implied - end).abs() > SKEW {
                return Err(Error::InvalidTimeTriple);
            }
            Ok(())
        }
        (Some(begin), Some(end), None) => {
            if end < begin {
                return Err(Error::InvalidTimeTriple);
            }
            let std = (end - begin).to_std().map_err(|_| Error::InvalidTimeTriple)?;
            spec.duration = Some(std.into());
            Ok(())
        }
        (Some(begin), None, Some(duration)) => {
            spec.end_time = Some(begin + duration.as_chrono());
            Ok(())
        }
        (None, Some(end), Some(duration)) => {
            spec.begin_time = Some(end - duration.as_chrono());
            Ok(())
        }
        (None, None, Some(_)) => Ok(()),
        _ => Err(Error::UnderspecifiedTimes),
    }
}

/// Validate an update against an already-bound lease.
///
/// Shortening the window is permitted; any extension of `end_time` past the
/// admitted window is rejected. Corrections of `begin_time` to a point at or
/// before `now` are accepted as no-ops.
pub fn validate_bound_update(
    updated: &LeaseSpec,
    status: &LeaseStatus,
    now: DateTime<Utc>,
) -> Result<(), Error> {
    let bound_end = match status.end_time {
        Some(end) if !status.ended => end,
        _ => return Ok(()),
    };
    if let Some(begin) = updated.begin_time {
        if begin > now && Some(begin) != status.begin_time {
            return Err(Error::InvalidTimeTriple);
        }
    }
    if let Some(end) = updated.end_time {
        if end > bound_end {
            return Err(Error::DurationExtension);
        }
    }
    if let (Some(duration), Some(begin)) = (updated.duration, status.begin_time) {
        if begin + duration.as_chrono() > bound_end + SKEW {
            return Err(Error::DurationExtension);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Duration;

    fn spec(
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        duration: Option<Duration>,
    ) -> LeaseSpec {
        LeaseSpec {
            client_ref: "client".into(),
            begin_time: begin,
            end_time: end,
            duration,
            ..LeaseSpec::default()
        }
    }

    #[test]
    fn derives_missing_member() {
        let now = Utc::now();
        let d = Duration::from_secs(60);

        let mut s = spec(Some(now), None, Some(d));
        reconcile_time_fields(&mut s).unwrap();
        assert_eq!(s.end_time, Some(now + d.as_chrono()));

        let mut s = spec(None, Some(now + d.as_chrono()), Some(d));
        reconcile_time_fields(&mut s).unwrap();
        assert_eq!(s.begin_time, Some(now));

        let mut s = spec(Some(now), Some(now + d.as_chrono()), None);
        reconcile_time_fields(&mut s).unwrap();
        assert_eq!(s.duration, Some(d));
    }

    #[test]
    fn duration_only_is_left_open() {
        let mut s = spec(None, None, Some(Duration::from_secs(60)));
        reconcile_time_fields(&mut s).unwrap();
        assert_eq!(s.begin_time, None);
        assert_eq!(s.end_time, None);
    }

    #[test]
    fn rejects_inconsistent_triple() {
        let now = Utc::now();
        let mut s = spec(
            Some(now),
            Some(now + chrono::Duration::seconds(30)),
            Some(Duration::from_secs(60)),
        );
        assert!(matches!(reconcile_time_fields(&mut s), Err(Error::InvalidTimeTriple)));
    }

    #[test]
    fn rejects_underspecified_times() {
        let now = Utc::now();
        assert!(matches!(
            reconcile_time_fields(&mut spec(Some(now), None, None)),
            Err(Error::UnderspecifiedTimes)
        ));
        assert!(matches!(
            reconcile_time_fields(&mut spec(None, None, None)),
            Err(Error::UnderspecifiedTimes)
        ));
    }

    #[test]
    fn bound_lease_may_shrink_but_not_grow() {
        let now = Utc::now();
        let status = LeaseStatus {
            begin_time: Some(now),
            end_time: Some(now + chrono::Duration::seconds(60)),
            exporter_ref: Some("e1".into()),
            ..LeaseStatus::default()
        };

        let shrink = spec(None, Some(now + chrono::Duration::seconds(30)), None);
        assert!(validate_bound_update(&shrink, &status, now).is_ok());

        let grow = spec(None, Some(now + chrono::Duration::seconds(120)), None);
        assert!(matches!(
            validate_bound_update(&grow, &status, now),
            Err(Error::DurationExtension)
        ));

        let grow_duration = spec(None, None, Some(Duration::from_secs(120)));
        assert!(matches!(
            validate_bound_update(&grow_duration, &status, now),
            Err(Error::DurationExtension)
        ));
    }

    #[test]
    fn ended_lease_ignores_update_validation() {
        let now = Utc::now();
        let status = LeaseStatus {
            ended: true,
            end_time: Some(now),
            ..LeaseStatus::default()
        };
        let grow = spec(None, Some(now + chrono::Duration::seconds(120)), None);
        assert!(validate_bound_update(&grow, &status, now).is_ok());
    }
}
