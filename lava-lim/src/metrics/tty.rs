//! Terminal idle time and login sessions

use std::os::unix::fs::MetadataExt;
use std::path::Path;
use tracing::{debug, error};

/// Idle time reported when nobody is logged in; larger than any real session age
pub const NO_SESSION_IDLE_SECS: f64 = 3600.0 * 24.0 * 30.0 * 60.0;

const UTMP_RECORD_SIZE: usize = 384;
const UT_LINE: std::ops::Range<usize> = 8..40;
const UT_USER: std::ops::Range<usize> = 44..76;
const USER_PROCESS: i16 = 7;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TtyActivity {
    pub idle_secs: f64,
    pub sessions: u32,
}

impl Default for TtyActivity {
    fn default() -> Self {
        Self {
            idle_secs: NO_SESSION_IDLE_SECS,
            sessions: 0,
        }
    }
}

/// Minimum idle time over sessions, given each session's seconds since last input
///
/// A session with no positive idle time means someone is typing right now:
/// the host is not idle and the walk stops there, so later sessions are not
/// counted.
pub fn idle_from_ages<I: IntoIterator<Item = i64>>(ages: I) -> TtyActivity {
    let mut activity = TtyActivity::default();
    for age in ages {
        activity.sessions += 1;
        if age <= 0 {
            activity.idle_secs = 0.0;
            break;
        }
        activity.idle_secs = activity.idle_secs.min(age as f64);
    }
    activity
}

/// Terminal lines of user sessions recorded in a utmp file
pub fn read_utmp_lines(path: &Path) -> std::io::Result<Vec<String>> {
    let data = std::fs::read(path)?;
    Ok(data
        .chunks_exact(UTMP_RECORD_SIZE)
        .filter_map(|record| {
            let ut_type = i16::from_ne_bytes([record[0], record[1]]);
            let user = c_field(&record[UT_USER]);
            if ut_type != USER_PROCESS || user.is_empty() {
                return None;
            }
            Some(c_field(&record[UT_LINE]))
        })
        .filter(|line| !line.is_empty())
        .collect())
}

/// Seconds since each terminal was last written to, skipping ones we cannot stat
pub fn session_ages(lines: &[String], dev_dir: &Path, now: i64) -> Vec<i64> {
    lines
        .iter()
        .filter_map(|line| {
            let device = dev_dir.join(line);
            match std::fs::metadata(&device) {
                Ok(meta) => {
                    let age = now - meta.atime();
                    debug!("tty {} idle {}s", device.display(), age);
                    Some(age)
                }
                Err(e) => {
                    error!("stat {} failed: {}", device.display(), e);
                    None
                }
            }
        })
        .collect()
}

fn c_field(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_string()
}

#[cfg(test)]
pub(crate) fn utmp_record(ut_type: i16, line: &str, user: &str) -> Vec<u8> {
    let mut record = vec![0u8; UTMP_RECORD_SIZE];
    record[0..2].copy_from_slice(&ut_type.to_ne_bytes());
    record[UT_LINE.start..UT_LINE.start + line.len()].copy_from_slice(line.as_bytes());
    record[UT_USER.start..UT_USER.start + user.len()].copy_from_slice(user.as_bytes());
    record
}
