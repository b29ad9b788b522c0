// GTFS tables for the Rodalies (Renfe Cercanías Barcelona) feed.
//
// Only stops.txt and stop_times.txt are needed to answer departure boards, so
// the loader reads exactly those two files from the working directory.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::Path;
use tracing::{debug, info, warn};

use super::error::ParseError;

pub const STOPS_FILE: &str = "stops.txt";
pub const STOP_TIMES_FILE: &str = "stop_times.txt";

const STOP_COLUMNS: &[&str] = &["stop_id", "stop_name"];
const STOP_TIME_COLUMNS: &[&str] = &["trip_id", "stop_id", "arrival_time", "departure_time"];

// ============================================================================
// Data Structures
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stop {
    pub stop_id: String,
    pub stop_name: String,
}

/// One scheduled call of a trip at a stop.
///
/// Times are kept as the raw `HH:MM:SS` strings of the feed. Trips running past
/// midnight use hours >= 24, so the strings order correctly as long as they are
/// zero-padded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopTimeEntry {
    pub trip_id: String,
    pub stop_id: String,
    pub arrival_time: String,
    pub departure_time: String,
}

#[derive(Debug, Deserialize)]
struct StopRow {
    stop_id: Option<String>,
    stop_name: Option<String>,
}

/// Stop lookup plus every stop time of the feed, in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GtfsIndex {
    stops: HashMap<String, String>,
    stop_times: Vec<StopTimeEntry>,
    // stop_id -> positions in `stop_times`, ascending
    by_stop: HashMap<String, Vec<usize>>,
}

impl GtfsIndex {
    pub fn new(stops: Vec<Stop>, stop_times: Vec<StopTimeEntry>) -> Self {
        let stops = stops
            .into_iter()
            .map(|stop| (stop.stop_id, stop.stop_name))
            .collect();

        let mut by_stop: HashMap<String, Vec<usize>> = HashMap::new();
        for (position, entry) in stop_times.iter().enumerate() {
            by_stop
                .entry(entry.stop_id.clone())
                .or_default()
                .push(position);
        }

        GtfsIndex {
            stops,
            stop_times,
            by_stop,
        }
    }

    pub fn stop_name(&self, stop_id: &str) -> Option<&str> {
        self.stops.get(stop_id).map(String::as_str)
    }

    /// Stop times served at `stop_id`, in the order they appear in the feed.
    pub fn stop_times_at<'a>(&'a self, stop_id: &str) -> impl Iterator<Item = &'a StopTimeEntry> + 'a {
        self.by_stop
            .get(stop_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .map(|&position| &self.stop_times[position])
    }

    pub fn stop_count(&self) -> usize {
        self.stops.len()
    }

    pub fn stop_time_count(&self) -> usize {
        self.stop_times.len()
    }
}

// ============================================================================
// Loading
// ============================================================================

/// Reads `stops.txt` and `stop_times.txt` from `dir` and builds a fresh index.
///
/// Both files must exist. Rows that cannot be decoded are skipped; a missing
/// header or a missing required column rejects the whole file.
pub fn load(dir: &Path) -> Result<GtfsIndex, ParseError> {
    let stops_path = dir.join(STOPS_FILE);
    let stop_times_path = dir.join(STOP_TIMES_FILE);

    for path in [&stops_path, &stop_times_path] {
        if !path.is_file() {
            return Err(ParseError::MissingFile {
                path: path.to_path_buf(),
            });
        }
    }

    let stops = read_stops(&stops_path)?;
    info!("✓ Parsed {} Rodalies stops", stops.len());

    let stop_times = read_stop_times(&stop_times_path)?;
    info!("✓ Parsed {} stop time entries", stop_times.len());

    Ok(GtfsIndex::new(stops, stop_times))
}

fn read_stops(path: &Path) -> Result<Vec<Stop>, ParseError> {
    let mut rdr = open_table(path, STOP_COLUMNS)?;
    let mut stops = Vec::new();
    let mut skipped = 0usize;

    for result in rdr.deserialize::<StopRow>() {
        match result {
            Ok(StopRow {
                stop_id: Some(stop_id),
                stop_name: Some(stop_name),
            }) => stops.push(Stop { stop_id, stop_name }),
            // Without both an id and a name the row can't serve a lookup
            Ok(_) => skipped += 1,
            Err(e) => {
                debug!("skipping malformed row in {}: {}", STOPS_FILE, e);
                skipped += 1;
            }
        }
    }

    if skipped > 0 {
        debug!("skipped {} incomplete rows in {}", skipped, STOPS_FILE);
    }

    Ok(stops)
}

fn read_stop_times(path: &Path) -> Result<Vec<StopTimeEntry>, ParseError> {
    let mut rdr = open_table(path, STOP_TIME_COLUMNS)?;
    let mut stop_times = Vec::new();
    let mut skipped = 0usize;

    for result in rdr.deserialize::<StopTimeEntry>() {
        match result {
            Ok(entry) => stop_times.push(entry),
            Err(e) => {
                debug!("skipping malformed row in {}: {}", STOP_TIMES_FILE, e);
                skipped += 1;
            }
        }
    }

    if skipped > 0 {
        warn!("⚠️  Skipped {} malformed rows in {}", skipped, STOP_TIMES_FILE);
    }

    Ok(stop_times)
}

fn open_table(path: &Path, required: &[&str]) -> Result<csv::Reader<File>, ParseError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    let file = File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => ParseError::MissingFile {
            path: path.to_path_buf(),
        },
        _ => ParseError::Malformed {
            file: file_name.clone(),
            detail: e.to_string(),
        },
    })?;

    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(file);

    let headers = rdr.headers().map_err(|e| ParseError::Malformed {
        file: file_name.clone(),
        detail: format!("unreadable header row: {}", e),
    })?;

    for column in required {
        if !headers.iter().any(|header| header == *column) {
            return Err(ParseError::Malformed {
                file: file_name,
                detail: format!("missing required column `{}`", column),
            });
        }
    }

    Ok(rdr)
}
