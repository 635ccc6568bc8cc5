//! Timestamped log lines with source locations and optional ANSI colour.
//!
//! The [`clog!`] macro writes lines in the format:
//!
//! ```text
//! 20260211T21:33:12.000 - src/sync.rs:42 - sync: pushed 3 of 5 pending change(s)
//! ```
//!
//! On a terminal, timestamps and source locations are dimmed and entity ids
//! get a stable colour derived from their content, so the same report can be
//! followed through a sync pass by eye.
//!
//! Lines go to stderr unless [`set_writer`] installs another destination.
//! Installing a writer turns colour off.

use std::io::{self, IsTerminal, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{LazyLock, Mutex, PoisonError};
use std::time::SystemTime;

use crate::model::EntityId;

static COLOUR_ENABLED: AtomicBool = AtomicBool::new(false);

static LOG_WRITER: LazyLock<Mutex<Box<dyn Write + Send>>> =
    LazyLock::new(|| Mutex::new(Box::new(io::stderr())));

/// Detect whether stderr supports colour. Call once at startup.
pub fn init() {
    COLOUR_ENABLED.store(io::stderr().is_terminal(), Ordering::Relaxed);
}

/// Replace the log writer. All subsequent [`clog!`] output goes to `w`.
pub fn set_writer(w: Box<dyn Write + Send>) {
    COLOUR_ENABLED.store(false, Ordering::Relaxed);
    *LOG_WRITER.lock().unwrap_or_else(PoisonError::into_inner) = w;
}

pub fn colour_enabled() -> bool {
    COLOUR_ENABLED.load(Ordering::Relaxed)
}

const RESET: &str = "\x1b[0m";
const DIM: &str = "\x1b[2m";

// Bright red, green, blue, magenta and cyan. Yellow is kept for entries.
const ID_COLOURS: [&str; 5] = ["\x1b[91m", "\x1b[92m", "\x1b[94m", "\x1b[95m", "\x1b[96m"];

fn hash_colour(id: &str) -> &'static str {
    let hash: u32 = id
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
    ID_COLOURS[(hash as usize) % ID_COLOURS.len()]
}

const LOG_ID_TRUNCATE_LEN: usize = 8;

fn truncate_id(id: &str) -> &str {
    let end = id
        .char_indices()
        .nth(LOG_ID_TRUNCATE_LEN)
        .map(|(i, _)| i)
        .unwrap_or(id.len());
    &id[..end]
}

/// Format an entity id, truncated and prefixed with its origin.
///
/// Returns e.g. `L-0f8fad5b` for a local id and `P-65a0f0c2` for a permanent one.
pub fn entity(id: &EntityId) -> String {
    let prefix = if id.is_local() { "L" } else { "P" };
    let short = truncate_id(id.as_str());
    if colour_enabled() {
        let colour = hash_colour(id.as_str());
        format!("{colour}{prefix}-{short}{RESET}")
    } else {
        format!("{prefix}-{short}")
    }
}

const ENTRY_COLOUR: &str = "\x1b[93m";

/// Format an outbox entry number.
pub fn entry(id: i64) -> String {
    if colour_enabled() {
        format!("{ENTRY_COLOUR}#{id}{RESET}")
    } else {
        format!("#{id}")
    }
}

/// Format the current wall-clock time as `YYYYMMDDTHH:MM:SS.mmm` (UTC).
pub fn format_timestamp() -> String {
    let duration = SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = duration.as_secs();
    let millis = duration.subsec_millis();

    let time_secs = secs % 86400;
    let hours = time_secs / 3600;
    let minutes = (time_secs % 3600) / 60;
    let seconds = time_secs % 60;

    // Civil date from days since epoch (Howard Hinnant's algorithm).
    let days = (secs / 86400) as i64;
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };

    format!(
        "{:04}{:02}{:02}T{:02}:{:02}:{:02}.{:03}",
        y, m, d, hours, minutes, seconds, millis
    )
}

/// Write one line to the current writer. Called by [`clog!`].
pub fn emit(file: &str, line: u32, msg: &str) {
    let ts = format_timestamp();
    let formatted = if colour_enabled() {
        format!("{DIM}{ts}{RESET} {DIM}{file}:{line}{RESET} {msg}")
    } else {
        format!("{ts} - {file}:{line} - {msg}")
    };
    let mut writer = LOG_WRITER.lock().unwrap_or_else(PoisonError::into_inner);
    let _ = writeln!(*writer, "{formatted}");
}

/// Emit a log line with timestamp and source location.
///
/// ```ignore
/// clog!("sync: pushed {} change(s)", count);
/// clog!("sync: {} is now {}", logging::entity(&local), logging::entity(&permanent));
/// ```
#[macro_export]
macro_rules! clog {
    ($($arg:tt)*) => {{
        $crate::logging::emit(file!(), line!(), &format!($($arg)*));
    }};
}
