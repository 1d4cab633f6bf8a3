use crate::error::{Error, Result};
use crate::limits::*;
use crate::model::*;

/// Reject spans outside the supported timestamp range or wider than the limit.
pub(crate) fn validate_span(span: &Span) -> Result<()> {
    if span.start >= span.end {
        return Err(Error::validation("start must be before end"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(Error::validation("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(Error::validation("reservation period too long"));
    }
    Ok(())
}

pub(crate) fn validate_reason(reason: Option<&str>) -> Result<()> {
    match reason {
        Some(r) if r.len() > MAX_REASON_LEN => Err(Error::validation("reason too long")),
        _ => Ok(()),
    }
}

/// First active reservation in `existing` that collides with `span`.
///
/// `existing` is expected to hold active reservations already; cancelled
/// entries are skipped anyway so callers may pass a room's full history.
pub fn find_collision<'a>(
    existing: &'a [Reservation],
    span: &Span,
    policy: BoundaryPolicy,
) -> Option<&'a Reservation> {
    existing
        .iter()
        .find(|r| r.is_active() && policy.collides(&r.span, span))
}

/// Pure availability predicate over a snapshot of a room's reservations.
pub fn is_free(existing: &[Reservation], span: &Span, policy: BoundaryPolicy) -> bool {
    find_collision(existing, span, policy).is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn booked(start: Ms, end: Ms, status: ReservationStatus) -> Reservation {
        Reservation {
            id: Ulid::new(),
            room_id: Ulid::nil(),
            user_id: Ulid::new(),
            span: Span::new(start, end),
            reason: None,
            status,
            created_at: 0,
        }
    }

    #[test]
    fn validate_span_rules() {
        assert!(validate_span(&Span { start: 10, end: 10 }).is_err());
        assert!(validate_span(&Span { start: 20, end: 10 }).is_err());
        assert!(validate_span(&Span { start: -5, end: 10 }).is_err());
        assert!(validate_span(&Span::new(0, MAX_SPAN_DURATION_MS + 1)).is_err());
        assert!(validate_span(&Span::new(0, MAX_SPAN_DURATION_MS)).is_ok());
        assert!(validate_span(&Span::new(1_000, 2_000)).is_ok());
    }

    #[test]
    fn reason_length_limit() {
        assert!(validate_reason(None).is_ok());
        assert!(validate_reason(Some("team meeting")).is_ok());
        let long = "x".repeat(MAX_REASON_LEN + 1);
        assert!(validate_reason(Some(&long)).is_err());
    }

    #[test]
    fn free_iff_no_active_collision() {
        let existing = vec![
            booked(100, 200, ReservationStatus::Confirmed),
            booked(300, 400, ReservationStatus::Cancelled),
        ];
        for policy in [BoundaryPolicy::Inclusive, BoundaryPolicy::HalfOpen] {
            assert!(!is_free(&existing, &Span::new(150, 250), policy));
            assert!(!is_free(&existing, &Span::new(50, 500), policy));
            assert!(is_free(&existing, &Span::new(300, 400), policy));
            assert!(is_free(&existing, &Span::new(210, 290), policy));
        }
    }

    #[test]
    fn shared_boundary_follows_policy() {
        let existing = vec![booked(100, 200, ReservationStatus::Pending)];
        let after = Span::new(200, 300);
        let before = Span::new(0, 100);
        assert!(!is_free(&existing, &after, BoundaryPolicy::Inclusive));
        assert!(!is_free(&existing, &before, BoundaryPolicy::Inclusive));
        assert!(is_free(&existing, &after, BoundaryPolicy::HalfOpen));
        assert!(is_free(&existing, &before, BoundaryPolicy::HalfOpen));
    }

    #[test]
    fn find_collision_reports_the_blocker() {
        let blocker = booked(100, 200, ReservationStatus::Confirmed);
        let existing = vec![blocker.clone(), booked(500, 600, ReservationStatus::Confirmed)];
        let hit = find_collision(&existing, &Span::new(150, 160), BoundaryPolicy::HalfOpen);
        assert_eq!(hit.map(|r| r.id), Some(blocker.id));
    }
}
