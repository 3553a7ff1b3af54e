//! Slot generation and conflict filtering.
//!
//! Both functions are pure: availability queries may race freely with
//! concurrent bookings, staleness is resolved by the re-check inside the
//! booking commit path.

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

use crate::models::{AppointmentStatus, BusinessHours};

/// A candidate start time for a given date. Ephemeral, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotCandidate {
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub available: bool,
}

/// The slice of an existing appointment the conflict filter needs.
#[derive(Debug, Clone)]
pub struct BookedInterval {
    pub start_time: NaiveTime,
    pub duration_min: i64,
    pub status: AppointmentStatus,
}

/// Parse a "HH:MM" wall-clock string.
pub fn parse_hm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").ok()
}

/// Format a wall-clock time as "HH:MM".
pub fn fmt_hm(t: NaiveTime) -> String {
    t.format("%H:%M").to_string()
}

/// Day-of-week index matching the business_hours table (Monday = 0).
pub fn weekday_index(date: NaiveDate) -> i64 {
    date.weekday().num_days_from_monday() as i64
}

fn minutes_of_day(t: NaiveTime) -> i64 {
    (t.hour() * 60 + t.minute()) as i64
}

/// Enumerate candidate start times for `date`.
///
/// Closed day, missing business-hours row (fail safe to unavailable) or a
/// date in the past all yield an empty vec. Start times step from open time
/// by `granularity_min`; a slot whose full service interval would extend past
/// closing is excluded. For today, starts earlier than `now + lead_time_min`
/// are excluded.
pub fn generate_slots(
    date: NaiveDate,
    hours: Option<&BusinessHours>,
    total_duration_min: i64,
    granularity_min: i64,
    now: NaiveDateTime,
    lead_time_min: i64,
) -> Vec<SlotCandidate> {
    let hours = match hours {
        Some(h) if !h.is_closed => h,
        _ => return Vec::new(),
    };
    if total_duration_min <= 0 || granularity_min <= 0 {
        return Vec::new();
    }
    if date < now.date() {
        return Vec::new();
    }

    let (open, close) = match (parse_hm(&hours.open_time), parse_hm(&hours.close_time)) {
        (Some(o), Some(c)) if o < c => (o, c),
        _ => {
            tracing::warn!(
                "malformed business hours for weekday {}: {}–{}",
                hours.day_of_week,
                hours.open_time,
                hours.close_time
            );
            return Vec::new();
        }
    };

    let open_min = minutes_of_day(open);
    let close_min = minutes_of_day(close);

    let cutoff_min = if date == now.date() {
        minutes_of_day(now.time()) + lead_time_min
    } else {
        i64::MIN
    };

    let mut slots = Vec::new();
    let mut start = open_min;
    while start + total_duration_min <= close_min {
        if start >= cutoff_min {
            slots.push(SlotCandidate {
                date,
                time: NaiveTime::from_num_seconds_from_midnight_opt(start as u32 * 60, 0)
                    .expect("start stays within a day"),
                available: true,
            });
        }
        start += granularity_min;
    }
    slots
}

/// Flag candidates that collide with existing appointments.
///
/// Keeps the slice length and order intact (stable UI ordering): only the
/// `available` flags change. An appointment blocks with a busy interval of
/// `[start − buffer, start + duration + buffer)`; CANCELLED and NO_SHOW never
/// block. Overlap is open-interval intersection: touching endpoints do not
/// conflict.
///
/// O(candidates × appointments); per-day datasets are ≤ ~50 slots × tens of
/// appointments, so the plain double loop beats any sweep-line setup cost.
pub fn filter_available(
    candidates: &mut [SlotCandidate],
    requested_duration_min: i64,
    booked: &[BookedInterval],
    buffer_min: i64,
) {
    for candidate in candidates.iter_mut() {
        let c_start = minutes_of_day(candidate.time);
        let c_end = c_start + requested_duration_min;
        for interval in booked {
            if !interval.status.blocks_slot() {
                continue;
            }
            let b_start = minutes_of_day(interval.start_time) - buffer_min;
            let b_end = minutes_of_day(interval.start_time) + interval.duration_min + buffer_min;
            if c_start < b_end && b_start < c_end {
                candidate.available = false;
                break;
            }
        }
    }
}

// ── Tests ──
