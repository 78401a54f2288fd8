use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Calendar Models (projected from rendered on-call schedules)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub uid: String,
    pub summary: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub location: Option<String>,
    pub description: String,
}

impl CalendarEvent {
    /// Closed-interval overlap with `[start, end]`.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start <= end && self.end >= start
    }
}

/// A schedule as rendered upstream (layers and overrides already applied).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedSchedule {
    pub id: String,
    pub name: String,
    pub entries: Vec<RenderedEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEntry {
    pub id: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Calendar date of `start` in the offset the schedule was rendered in.
    pub date: NaiveDate,
    pub user_id: String,
    pub user_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(start_h: u32, end_h: u32) -> CalendarEvent {
        CalendarEvent {
            uid: "S1-2024-05-01-0".into(),
            summary: "Primary".into(),
            start: Utc.with_ymd_and_hms(2024, 5, 1, start_h, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 5, 1, end_h, 0, 0).unwrap(),
            location: None,
            description: "Schedule ID: S1".into(),
        }
    }

    #[test]
    fn overlap_is_closed_at_both_ends() {
        let e = event(8, 12);
        let at = |h| Utc.with_ymd_and_hms(2024, 5, 1, h, 0, 0).unwrap();

        assert!(e.overlaps(at(12), at(14)));
        assert!(e.overlaps(at(6), at(8)));
        assert!(e.overlaps(at(9), at(10)));
        assert!(!e.overlaps(at(13), at(14)));
        assert!(!e.overlaps(at(5), at(7)));
    }
}
