//! Line-oriented relay logging with timestamps, source locations, and ANSI
//! colour support.
//!
//! Every line produced through [`tlog!`] has the shape:
//!
//! ```text
//! 2026-02-11 21:33:12.000 - src/pipeline.rs:42 - connected c:alice
//! ```
//!
//! On a terminal the timestamp and location are dimmed and connection ids
//! get a stable colour derived from their content, so a busy log can be
//! followed per client. Output goes to stderr unless [`set_writer`] installs
//! another destination.

use std::io::{self, IsTerminal, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{LazyLock, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

static COLOUR_ENABLED: AtomicBool = AtomicBool::new(false);

static LOG_WRITER: LazyLock<Mutex<Box<dyn Write + Send>>> =
    LazyLock::new(|| Mutex::new(Box::new(io::stderr())));

/// Detect whether stderr is a colour terminal. Call once at startup.
pub fn init() {
    COLOUR_ENABLED.store(io::stderr().is_terminal(), Ordering::Relaxed);
}

/// Redirect all subsequent log output to `w`. Colour is switched off.
pub fn set_writer(w: Box<dyn Write + Send>) {
    COLOUR_ENABLED.store(false, Ordering::Relaxed);
    if let Ok(mut writer) = LOG_WRITER.lock() {
        *writer = w;
    }
}

pub fn colour_enabled() -> bool {
    COLOUR_ENABLED.load(Ordering::Relaxed)
}

const RESET: &str = "\x1b[0m";
const DIM: &str = "\x1b[2m";

const ID_COLOURS: &[&str] = &[
    "\x1b[91m", "\x1b[92m", "\x1b[93m", "\x1b[94m", "\x1b[95m", "\x1b[96m", "\x1b[31m",
    "\x1b[32m", "\x1b[33m", "\x1b[34m", "\x1b[35m", "\x1b[36m",
];

fn hash_colour(id: &str) -> &'static str {
    let hash = id
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)));
    ID_COLOURS[(hash as usize) % ID_COLOURS.len()]
}

/// Client ids are caller supplied and unbounded; long ones are cut here.
const MAX_LOGGED_ID_CHARS: usize = 24;

fn shorten(id: &str) -> String {
    match id.char_indices().nth(MAX_LOGGED_ID_CHARS) {
        Some((end, _)) => format!("{}…", &id[..end]),
        None => id.to_string(),
    }
}

/// Format a connection id for log output, e.g. `c:alice`.
pub fn conn_id(id: &str) -> String {
    let short = shorten(id);
    if colour_enabled() {
        format!("{}c:{short}{RESET}", hash_colour(id))
    } else {
        format!("c:{short}")
    }
}

/// Convert days since the Unix epoch to a civil `(year, month, day)`.
fn civil_from_days(days: i64) -> (i64, u64, u64) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe as i64 + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

/// Format a Unix time in milliseconds as `YYYY-MM-DD HH:MM:SS.mmm` (UTC).
pub fn format_unix_millis(millis: u64) -> String {
    let secs = millis / 1000;
    let (year, month, day) = civil_from_days((secs / 86_400) as i64);
    let of_day = secs % 86_400;
    format!(
        "{year:04}-{month:02}-{day:02} {:02}:{:02}:{:02}.{:03}",
        of_day / 3600,
        (of_day % 3600) / 60,
        of_day % 60,
        millis % 1000
    )
}

pub fn format_timestamp() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    format_unix_millis(millis)
}

/// Write one log line. Used by [`tlog!`].
pub fn emit(file: &str, line: u32, msg: &str) {
    let ts = format_timestamp();
    let formatted = if colour_enabled() {
        format!("{DIM}{ts} {file}:{line}{RESET} {msg}")
    } else {
        format!("{ts} - {file}:{line} - {msg}")
    };
    if let Ok(mut writer) = LOG_WRITER.lock() {
        let _ = writeln!(*writer, "{formatted}");
    }
}

/// Emit a log line with timestamp and source location.
///
/// ```ignore
/// tlog!("relay: listening on {}", addr);
/// ```
#[macro_export]
macro_rules! tlog {
    ($($arg:tt)*) => {{
        $crate::logging::emit(file!(), line!(), &format!($($arg)*));
    }};
}
