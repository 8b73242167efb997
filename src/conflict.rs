//! Missed-punch conflict detection.
//!
//! Before a punch is captured the employee's last punch is inspected. A shift
//! left open for longer than the employee's scheduled shift (or, without a
//! schedule, a conservative default) is a `missing_clockout` conflict and
//! blocks the punch until a correction has been submitted.

use crate::model::{ConflictDetection, ConflictType, Correction, Punch, PunchType};
use chrono::{DateTime, Days, Duration, FixedOffset, Offset, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShiftPolicy {
    /// Open-shift age after which a missing clock-out is assumed when no
    /// schedule is known.
    pub default_open_shift: Duration,
    /// Shift length used for the suggested clock-out.
    pub typical_shift: Duration,
    pub max_shift: Duration,
    /// Offset of the kiosk's local day, for the end-of-day suggestion.
    pub local_offset: FixedOffset,
}

impl Default for ShiftPolicy {
    fn default() -> Self {
        Self {
            default_open_shift: Duration::hours(12),
            typical_shift: Duration::hours(8),
            max_shift: Duration::hours(16),
            local_offset: Utc.fix(),
        }
    }
}

/// What is known about an employee's current shift.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShiftSnapshot<'a> {
    pub last_punch: Option<&'a Punch>,
    /// Non-rejected correction filed against `last_punch`.
    pub closing_correction: Option<&'a Correction>,
}

impl<'a> ShiftSnapshot<'a> {
    pub fn new(last_punch: Option<&'a Punch>, closing_correction: Option<&'a Correction>) -> Self {
        // A correction for some other punch does not close this shift.
        let closing_correction = closing_correction.filter(|c| {
            c.closes_shift() && last_punch.is_some_and(|p| p.id == c.original_punch_id)
        });
        Self {
            last_punch,
            closing_correction,
        }
    }

    /// Punch type the state machine should continue from. A filed correction
    /// stands in for the missing clock-out.
    pub fn effective_last_type(&self) -> Option<PunchType> {
        if self.closing_correction.is_some() {
            return Some(PunchType::ClockOut);
        }
        self.last_punch.map(|p| p.punch_type)
    }

    /// Latest instant the employee is known to have been on record.
    fn last_event_at(&self) -> Option<DateTime<Utc>> {
        let punch_at = self.last_punch.map(|p| p.timestamp);
        let corrected_at = self.closing_correction.map(|c| c.corrected_timestamp);
        punch_at.max(corrected_at)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictDetector {
    policy: ShiftPolicy,
}

impl ConflictDetector {
    pub fn new(policy: ShiftPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ShiftPolicy {
        &self.policy
    }

    /// The missing clock-out rule on its own: an open-shift punch older than
    /// the threshold.
    pub fn detect(
        &self,
        last_punch: Option<&Punch>,
        now: DateTime<Utc>,
        scheduled_shift: Option<Duration>,
    ) -> ConflictDetection {
        let Some(last) = last_punch else {
            return ConflictDetection::clear(None);
        };
        let threshold = scheduled_shift.unwrap_or(self.policy.default_open_shift);
        if last.punch_type.opens_shift() && now - last.timestamp > threshold {
            return ConflictDetection::conflict(
                ConflictType::MissingClockout,
                Some(last.to_ref()),
                Some(self.suggested_clockout(last.timestamp)),
            );
        }
        ConflictDetection::clear(Some(last.to_ref()))
    }

    /// Full pre-capture check for an attempted punch at `now`.
    ///
    /// `requested` is the punch type the caller asked for, if any; without it
    /// the state machine's next type is implied and cannot lack a clock-in.
    pub fn check_attempt(
        &self,
        snapshot: &ShiftSnapshot<'_>,
        requested: Option<PunchType>,
        now: DateTime<Utc>,
        scheduled_shift: Option<Duration>,
    ) -> ConflictDetection {
        let last_ref = snapshot.last_punch.map(Punch::to_ref);

        if let Some(last_at) = snapshot.last_event_at() {
            if now <= last_at {
                return ConflictDetection::conflict(
                    ConflictType::OverlappingShift,
                    last_ref,
                    None,
                );
            }
        }

        if snapshot.closing_correction.is_none() {
            let detection = self.detect(snapshot.last_punch, now, scheduled_shift);
            if detection.has_conflict {
                return detection;
            }
        }

        let shift_open = !matches!(
            snapshot.effective_last_type(),
            None | Some(PunchType::ClockOut)
        );
        if let Some(requested) = requested {
            if requested != PunchType::ClockIn && !shift_open {
                return ConflictDetection::conflict(ConflictType::MissingClockin, last_ref, None);
            }
        }

        ConflictDetection::clear(last_ref)
    }

    /// `last + typical shift` or the end of that local day, whichever is
    /// earlier. Advisory only.
    pub fn suggested_clockout(&self, last: DateTime<Utc>) -> DateTime<Utc> {
        let by_length = last + self.policy.typical_shift;
        let local = last.with_timezone(&self.policy.local_offset);
        let end_of_day = local
            .date_naive()
            .checked_add_days(Days::new(1))
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .and_then(|midnight| midnight.and_local_timezone(self.policy.local_offset).single())
            .map(|midnight| midnight.with_timezone(&Utc) - Duration::seconds(1));
        match end_of_day {
            Some(eod) if eod > last => by_length.min(eod),
            _ => by_length,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CorrectionState, ReasonCategory};
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 6, h, m, 0).unwrap()
    }

    fn punch(kind: PunchType, ts: DateTime<Utc>) -> Punch {
        Punch {
            id: "p-1".into(),
            employee_id: "e-1".into(),
            company_id: "acme".into(),
            punch_type: kind,
            timestamp: ts,
            device_id: "kiosk".into(),
            location: None,
            photo_reference: None,
            pin_verified: false,
            remote_id: None,
        }
    }

    fn correction_for(p: &Punch, corrected: DateTime<Utc>, state: CorrectionState) -> Correction {
        Correction {
            id: "c-1".into(),
            employee_id: p.employee_id.clone(),
            original_punch_id: p.id.clone(),
            corrected_timestamp: corrected,
            reason: "forgot".into(),
            reason_category: ReasonCategory::Forgot,
            state,
            submitted_at: corrected,
            offline_submitted: false,
            approved_at: None,
            approved_by: None,
            remote_id: None,
        }
    }

    #[test]
    fn stale_clock_in_is_missing_clockout() {
        let detector = ConflictDetector::default();
        let last = punch(PunchType::ClockIn, at(8, 0));
        let det = detector.detect(Some(&last), at(8, 0) + Duration::hours(20), None);
        assert!(det.has_conflict);
        assert_eq!(det.conflict_type, ConflictType::MissingClockout);
        assert_eq!(det.last_punch.as_ref().map(|p| p.id.as_str()), Some("p-1"));
        // 08:00 + 8h is before end of day
        assert_eq!(det.suggested_clockout, Some(at(16, 0)));
    }

    #[test]
    fn recent_clock_in_is_clear() {
        let detector = ConflictDetector::default();
        let last = punch(PunchType::ClockIn, at(8, 0));
        let det = detector.detect(Some(&last), at(15, 0), None);
        assert!(!det.has_conflict);
        assert_eq!(det.conflict_type, ConflictType::None);
    }

    #[test]
    fn scheduled_shift_overrides_default_threshold() {
        let detector = ConflictDetector::default();
        let last = punch(PunchType::BreakEnd, at(8, 0));
        let det = detector.detect(Some(&last), at(15, 0), Some(Duration::hours(6)));
        assert_eq!(det.conflict_type, ConflictType::MissingClockout);
    }

    #[test]
    fn closed_or_break_punches_never_miss_clockout() {
        let detector = ConflictDetector::default();
        for kind in [PunchType::ClockOut, PunchType::BreakStart, PunchType::MealStart] {
            let last = punch(kind, at(1, 0));
            let det = detector.detect(Some(&last), at(1, 0) + Duration::hours(40), None);
            assert!(!det.has_conflict, "{kind}");
        }
    }

    #[test]
    fn suggestion_stops_at_end_of_day() {
        let detector = ConflictDetector::default();
        assert_eq!(
            detector.suggested_clockout(at(20, 0)),
            Utc.with_ymd_and_hms(2024, 5, 6, 23, 59, 59).unwrap()
        );
    }

    #[test]
    fn suggestion_uses_local_day() {
        let policy = ShiftPolicy {
            local_offset: FixedOffset::west_opt(5 * 3600).unwrap(),
            ..ShiftPolicy::default()
        };
        let detector = ConflictDetector::new(policy);
        // 20:00 UTC is 15:00 local; local midnight is 05:00 UTC next day.
        assert_eq!(detector.suggested_clockout(at(20, 0)), at(20, 0) + Duration::hours(8));
        // 23:00 UTC is 18:00 local; local end of day is 04:59:59 UTC.
        assert_eq!(
            detector.suggested_clockout(at(23, 0)),
            Utc.with_ymd_and_hms(2024, 5, 7, 4, 59, 59).unwrap()
        );
    }

    #[test]
    fn timestamp_not_after_last_punch_overlaps() {
        let detector = ConflictDetector::default();
        let last = punch(PunchType::ClockIn, at(9, 0));
        let snapshot = ShiftSnapshot::new(Some(&last), None);
        let det = detector.check_attempt(&snapshot, None, at(9, 0), None);
        assert_eq!(det.conflict_type, ConflictType::OverlappingShift);
        let det = detector.check_attempt(&snapshot, None, at(8, 59), None);
        assert_eq!(det.conflict_type, ConflictType::OverlappingShift);
    }

    #[test]
    fn clock_out_without_open_shift_is_missing_clockin() {
        let detector = ConflictDetector::default();
        let snapshot = ShiftSnapshot::default();
        let det = detector.check_attempt(&snapshot, Some(PunchType::ClockOut), at(9, 0), None);
        assert_eq!(det.conflict_type, ConflictType::MissingClockin);

        let last = punch(PunchType::ClockOut, at(8, 0));
        let snapshot = ShiftSnapshot::new(Some(&last), None);
        let det = detector.check_attempt(&snapshot, Some(PunchType::BreakStart), at(9, 0), None);
        assert_eq!(det.conflict_type, ConflictType::MissingClockin);
        let det = detector.check_attempt(&snapshot, Some(PunchType::ClockIn), at(9, 0), None);
        assert!(!det.has_conflict);
    }

    #[test]
    fn filed_correction_unblocks_and_closes_shift() {
        let detector = ConflictDetector::default();
        let last = punch(PunchType::ClockIn, at(8, 0));
        let now = at(8, 0) + Duration::hours(20);

        let pending = correction_for(&last, at(16, 0), CorrectionState::Submitted);
        let snapshot = ShiftSnapshot::new(Some(&last), Some(&pending));
        assert_eq!(snapshot.effective_last_type(), Some(PunchType::ClockOut));
        let det = detector.check_attempt(&snapshot, None, now, None);
        assert!(!det.has_conflict);

        let rejected = correction_for(&last, at(16, 0), CorrectionState::Rejected);
        let snapshot = ShiftSnapshot::new(Some(&last), Some(&rejected));
        let det = detector.check_attempt(&snapshot, None, now, None);
        assert_eq!(det.conflict_type, ConflictType::MissingClockout);
    }
}
