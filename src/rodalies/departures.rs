use chrono::{DateTime, TimeZone};
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::LazyLock;

use super::gtfs::GtfsIndex;

pub const DEFAULT_LIMIT: usize = 5;

/// Characters of the trip id used as the line when no route number is found.
const LINE_SUFFIX_CHARS: usize = 2;

// Rodalies line codes: R1..R16, R2N/R2S, RG1, RL3, RT1...
static LINE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"R[GLT]?\d+[NS]?").expect("line pattern is a valid regex"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Departure {
    pub trip_id: String,
    pub arrival: String,
    pub departure: String,
    pub stop_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopDepartures {
    pub stop_id: String,
    pub stop_name: Option<String>,
    pub departures: Vec<Departure>,
}

/// Best-effort line of a trip, used only to spot the same departure published
/// under several trip ids.
///
/// Returns the first Rodalies line code in the trip id (`"R4"` for
/// `"4077R4_01"`), otherwise its last two characters.
pub fn line_id(trip_id: &str) -> &str {
    if let Some(found) = LINE_PATTERN.find(trip_id) {
        return found.as_str();
    }

    let start = trip_id
        .char_indices()
        .rev()
        .nth(LINE_SUFFIX_CHARS - 1)
        .map(|(position, _)| position)
        .unwrap_or(0);
    &trip_id[start..]
}

/// Whether `time` is a zero-padded `HH:MM:SS` service time.
///
/// Departure filtering compares these strings lexicographically, which only
/// orders correctly when every field has exactly two digits. Hours may go past
/// 23 for trips that run after midnight.
pub fn is_service_time(time: &str) -> bool {
    let parts: Vec<&str> = time.split(':').collect();
    if parts.len() != 3 {
        return false;
    }

    if !parts
        .iter()
        .all(|part| part.len() == 2 && part.bytes().all(|b| b.is_ascii_digit()))
    {
        return false;
    }

    parts[1] < "60" && parts[2] < "60"
}

/// Wall-clock time formatted for comparison against stop times.
pub fn service_time_of<Tz: TimeZone>(now: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    now.format("%H:%M:%S").to_string()
}

/// Next departures at `stop_id` strictly after `reference_time`.
///
/// Entries are ordered by arrival (ties keep feed order), one entry is kept per
/// `(line, arrival)` pair, and at most `limit` are returned. An unknown stop is
/// not an error: it produces no departures and no stop name.
pub fn next_departures(
    index: &GtfsIndex,
    stop_id: &str,
    reference_time: &str,
    limit: usize,
) -> StopDepartures {
    let mut upcoming: Vec<_> = index
        .stop_times_at(stop_id)
        .filter(|entry| entry.arrival_time.as_str() > reference_time)
        .collect();

    // sort_by is stable, equal arrivals stay in feed order
    upcoming.sort_by(|a, b| a.arrival_time.cmp(&b.arrival_time));

    let mut seen = HashSet::new();
    let mut departures = Vec::with_capacity(limit.min(upcoming.len()));

    for entry in upcoming {
        if departures.len() >= limit {
            break;
        }
        if !seen.insert((line_id(&entry.trip_id), entry.arrival_time.as_str())) {
            continue;
        }

        departures.push(Departure {
            trip_id: entry.trip_id.clone(),
            arrival: entry.arrival_time.clone(),
            departure: entry.departure_time.clone(),
            stop_name: index
                .stop_name(&entry.stop_id)
                .unwrap_or(&entry.stop_id)
                .to_string(),
        });
    }

    StopDepartures {
        stop_id: stop_id.to_string(),
        stop_name: index.stop_name(stop_id).map(str::to_string),
        departures,
    }
}
