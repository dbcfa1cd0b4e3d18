use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as Ms)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start >= span.end {
        return Err(EngineError::InvalidRequest("window must end after it starts"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// Sorted, deduplicated copy of a table set.
pub(crate) fn normalize_tables(table_ids: &[Ulid]) -> Vec<Ulid> {
    let mut ids = table_ids.to_vec();
    ids.sort();
    ids.dedup();
    ids
}

/// Any live hold or assignment on `ts` overlapping `span`, other than `ignore`.
/// Expired holds are treated as already gone.
pub(crate) fn check_no_conflict(
    ts: &TableState,
    span: &Span,
    now: Ms,
    ignore: Option<Ulid>,
) -> Result<(), EngineError> {
    for interval in ts.overlapping(span) {
        if Some(interval.id) == ignore || !interval.is_live(now) {
            continue;
        }
        return Err(EngineError::Conflict {
            table_id: ts.table_id,
            with: interval.id,
        });
    }
    Ok(())
}
