//! Staging loader: replaces one year's partition of `source.ridership` with
//! the rows of that year's published archive.

use std::fmt::{self, Write as _};
use std::io::Read;

use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord};
use flate2::read::MultiGzDecoder;
use serde::Serialize;
use sqlx::PgConnection;
use tracing::{debug, warn};

use crate::context::ExecutionContext;
use crate::error::{PipelineError, Result};
use crate::events::PipelineEvent;
use crate::schema::{self, Year, STAGING_RIDERSHIP};
use crate::source::RidershipSource;

/// Flush the COPY buffer to the server once it grows past this size.
const COPY_CHUNK_BYTES: usize = 1 << 20;
const STATION_CODE_MAX_LEN: usize = 16;
const COLUMN_COUNT: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingRow {
    pub day: NaiveDate,
    pub hour: i32,
    pub origin: String,
    pub destination: String,
    pub trip_count: i32,
}

impl StagingRow {
    /// Appends the row as one line of COPY `FORMAT csv` input.
    fn encode_into(&self, buf: &mut String) {
        // Writing into a String cannot fail.
        let _ = writeln!(
            buf,
            "{},{},{},{},{}",
            self.day,
            self.hour,
            Quoted(&self.origin),
            Quoted(&self.destination),
            self.trip_count
        );
    }
}

/// A CSV field in double quotes with embedded quotes doubled.
struct Quoted<'a>(&'a str);

impl fmt::Display for Quoted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_char('"')?;
        for part in self.0.split_inclusive('"') {
            f.write_str(part)?;
            if part.ends_with('"') {
                f.write_char('"')?;
            }
        }
        f.write_char('"')
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagingReport {
    pub year: Year,
    pub rows: u64,
}

/// Streams validated rows out of a gzip-compressed, headerless CSV archive.
///
/// Yields at most one error; iteration stops after it.
pub struct StagingRows<R: Read> {
    reader: csv::Reader<MultiGzDecoder<R>>,
    record: StringRecord,
    year: Year,
    done: bool,
}

pub fn decode_rows<R: Read>(compressed: R, year: Year) -> StagingRows<R> {
    let reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(MultiGzDecoder::new(compressed));
    StagingRows {
        reader,
        record: StringRecord::new(),
        year,
        done: false,
    }
}

impl<R: Read> Iterator for StagingRows<R> {
    type Item = Result<StagingRow>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let outcome = match self.reader.read_record(&mut self.record) {
            Ok(false) => None,
            Ok(true) => {
                let line = self.record.position().map(|p| p.line()).unwrap_or(0);
                Some(parse_record(&self.record, self.year, line))
            }
            Err(err) => Some(Err(classify_csv_error(err, self.year))),
        };

        if !matches!(outcome, Some(Ok(_))) {
            self.done = true;
        }
        outcome
    }
}

/// I/O errors underneath the CSV reader come from the gzip decoder; anything
/// else is a problem with the decoded text itself.
fn classify_csv_error(err: csv::Error, year: Year) -> PipelineError {
    let line = err.position().map(|p| p.line()).unwrap_or(0);
    let message = err.to_string();
    match err.into_kind() {
        csv::ErrorKind::Io(source) => PipelineError::Decompression {
            year: year.value(),
            source,
        },
        _ => PipelineError::MalformedRow {
            year: year.value(),
            line,
            message,
        },
    }
}

fn parse_record(record: &StringRecord, year: Year, line: u64) -> Result<StagingRow> {
    let malformed = |message: String| PipelineError::MalformedRow {
        year: year.value(),
        line,
        message,
    };

    if record.len() != COLUMN_COUNT {
        return Err(malformed(format!(
            "expected {COLUMN_COUNT} columns, found {}",
            record.len()
        )));
    }

    let day = NaiveDate::parse_from_str(&record[0], "%Y-%m-%d")
        .map_err(|_| malformed(format!("invalid day '{}'", &record[0])))?;
    if !year.contains(day) {
        return Err(malformed(format!("day {day} falls outside {year}")));
    }

    let hour = match record[1].parse::<i32>() {
        Ok(hour) if (0..=23).contains(&hour) => hour,
        _ => return Err(malformed(format!("invalid hour '{}'", &record[1]))),
    };

    let origin = station_code(&record[2]).ok_or_else(|| {
        malformed(format!("invalid origin station code '{}'", &record[2]))
    })?;
    let destination = station_code(&record[3]).ok_or_else(|| {
        malformed(format!("invalid destination station code '{}'", &record[3]))
    })?;

    let trip_count = match record[4].parse::<i32>() {
        Ok(count) if count >= 0 => count,
        _ => return Err(malformed(format!("invalid trip count '{}'", &record[4]))),
    };

    Ok(StagingRow {
        day,
        hour,
        origin,
        destination,
        trip_count,
    })
}

fn station_code(raw: &str) -> Option<String> {
    if raw.is_empty() || raw.chars().count() > STATION_CODE_MAX_LEN {
        None
    } else {
        Some(raw.to_string())
    }
}

/// Fetches the archive for `year` and replaces the year's staging partition
/// with its rows.
///
/// Setup, truncate and COPY share one transaction: a fetch, decompression or
/// row error leaves the partition exactly as it was before the call.
pub async fn load_year(
    ctx: &ExecutionContext,
    source: &dyn RidershipSource,
    year: Year,
) -> Result<StagingReport> {
    let payload = source.fetch(year).await?;
    let load_err = |source: sqlx::Error| PipelineError::Load {
        year: year.value(),
        source,
    };

    let mut tx = ctx.pool().begin().await.map_err(load_err)?;
    schema::apply(&mut *tx, &schema::staging_setup(year))
        .await
        .map_err(load_err)?;
    let rows = copy_rows(&mut *tx, year, payload.as_ref()).await?;
    tx.commit().await.map_err(load_err)?;

    ctx.emit(PipelineEvent::StagingLoaded { year, rows });
    Ok(StagingReport { year, rows })
}

async fn copy_rows(conn: &mut PgConnection, year: Year, payload: &[u8]) -> Result<u64> {
    let load_err = |source: sqlx::Error| PipelineError::Load {
        year: year.value(),
        source,
    };

    let statement = format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT csv)",
        STAGING_RIDERSHIP.partition_name(year),
        STAGING_RIDERSHIP.column_list()
    );
    debug!(sql = %statement, "Starting bulk load");
    let mut copy = conn.copy_in_raw(&statement).await.map_err(load_err)?;

    let mut buffer = String::with_capacity(COPY_CHUNK_BYTES + 256);
    for row in decode_rows(payload, year) {
        let row = match row {
            Ok(row) => row,
            Err(err) => {
                if let Err(abort_err) = copy.abort(err.to_string()).await {
                    warn!(%year, error = %abort_err, "COPY abort was not acknowledged cleanly");
                }
                return Err(err);
            }
        };

        row.encode_into(&mut buffer);
        if buffer.len() >= COPY_CHUNK_BYTES {
            copy.send(buffer.as_bytes()).await.map_err(load_err)?;
            buffer.clear();
        }
    }

    if !buffer.is_empty() {
        copy.send(buffer.as_bytes()).await.map_err(load_err)?;
    }
    copy.finish().await.map_err(load_err)
}
