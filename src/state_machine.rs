//! Which punch may follow which.
use crate::error::ValidationError;
use crate::model::PunchType;

/// The only punch type an employee may record after `last`.
pub fn next_punch_type(last: Option<PunchType>) -> PunchType {
    match last {
        None | Some(PunchType::ClockOut) => PunchType::ClockIn,
        Some(PunchType::ClockIn) | Some(PunchType::BreakEnd) | Some(PunchType::MealEnd) => {
            PunchType::ClockOut
        }
        Some(PunchType::BreakStart) => PunchType::BreakEnd,
        Some(PunchType::MealStart) => PunchType::MealEnd,
    }
}

/// Reject a requested punch type that does not match the expected one.
/// Never coerces.
pub fn validate_next(
    last: Option<PunchType>,
    requested: PunchType,
) -> Result<PunchType, ValidationError> {
    let expected = next_punch_type(last);
    if requested != expected {
        return Err(ValidationError::UnexpectedPunchType {
            expected,
            requested,
        });
    }
    Ok(expected)
}
