//! Process table scanning
//!
//! A scan yields one [`ProcessRecord`] per visible process, minus anything in
//! process group 1, stopping at the configured record cap.

use std::path::PathBuf;
use sysinfo::{ProcessStatus, System};
use tracing::{debug, info, warn};

use crate::error::{PimError, Result};

/// CPU ticks per second assumed when converting `/proc/<pid>/stat` times
const TICKS_PER_SEC: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Sleeping,
    Stopped,
    Zombie,
    Swapped,
}

impl RunState {
    /// Integer code written to the snapshot file
    pub fn code(self) -> i32 {
        match self {
            RunState::Running => 0,
            RunState::Sleeping => 1,
            RunState::Stopped => 2,
            RunState::Zombie => 3,
            RunState::Swapped => 4,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(RunState::Running),
            1 => Some(RunState::Sleeping),
            2 => Some(RunState::Stopped),
            3 => Some(RunState::Zombie),
            4 => Some(RunState::Swapped),
            _ => None,
        }
    }

    /// State letter from `/proc/<pid>/stat`; unknown letters count as running
    pub fn from_stat_letter(letter: char) -> Self {
        match letter {
            'S' | 'D' => RunState::Sleeping,
            'T' => RunState::Stopped,
            'Z' => RunState::Zombie,
            'W' => RunState::Swapped,
            _ => RunState::Running,
        }
    }
}

/// Resource usage of one process; CPU times in seconds, sizes in KB
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: i32,
    pub ppid: i32,
    pub pgid: i32,
    pub jobid: i32,
    pub utime: i64,
    pub stime: i64,
    pub cutime: i64,
    pub cstime: i64,
    pub proc_size: i64,
    pub resident_size: i64,
    pub stack_size: i64,
    pub status: RunState,
}

impl ProcessRecord {
    /// `pid ppid pgid jobid utime stime cutime cstime proc_size resident_size stack_size status`
    pub fn to_line(&self) -> String {
        format!(
            "{} {} {} {} {} {} {} {} {} {} {} {}",
            self.pid,
            self.ppid,
            self.pgid,
            self.jobid,
            self.utime,
            self.stime,
            self.cutime,
            self.cstime,
            self.proc_size,
            self.resident_size,
            self.stack_size,
            self.status.code()
        )
    }

    pub fn parse_line(line: &str) -> Option<Self> {
        let fields: Vec<i64> = line
            .split_whitespace()
            .map(|f| f.parse::<i64>().ok())
            .collect::<Option<Vec<_>>>()?;
        if fields.len() != 12 {
            return None;
        }
        Some(Self {
            pid: fields[0] as i32,
            ppid: fields[1] as i32,
            pgid: fields[2] as i32,
            jobid: fields[3] as i32,
            utime: fields[4],
            stime: fields[5],
            cutime: fields[6],
            cstime: fields[7],
            proc_size: fields[8],
            resident_size: fields[9],
            stack_size: fields[10],
            status: RunState::from_code(fields[11] as i32)?,
        })
    }
}

/// Parse one `/proc/<pid>/stat` line; `None` when malformed or for pid 0
pub fn parse_stat(content: &str, page_size_kb: i64) -> Option<ProcessRecord> {
    // The command may contain spaces and parentheses; it ends at the last ')'
    let open = content.find('(')?;
    let close = content.rfind(')')?;
    let pid: i32 = content[..open].trim().parse().ok()?;
    if pid == 0 {
        return None;
    }

    let rest: Vec<&str> = content.get(close + 1..)?.split_whitespace().collect();
    if rest.len() < 27 {
        return None;
    }
    let int = |i: usize| rest[i].parse::<i64>().ok();
    let letter = rest[0].chars().next()?;

    let start_stack = int(25)?;
    let stack_pointer = int(26)?;

    Some(ProcessRecord {
        pid,
        ppid: int(1)? as i32,
        pgid: int(2)? as i32,
        jobid: 0,
        utime: int(11)? / TICKS_PER_SEC,
        stime: int(12)? / TICKS_PER_SEC,
        cutime: int(13)? / TICKS_PER_SEC,
        cstime: int(14)? / TICKS_PER_SEC,
        proc_size: rest[20].parse::<u64>().ok()? as i64 / 1024,
        resident_size: int(21)? * page_size_kb,
        stack_size: start_stack.saturating_sub(stack_pointer).max(0),
        status: RunState::from_stat_letter(letter),
    })
}

/// Something that can enumerate the host's processes
pub trait ProcessSource: Send {
    fn name(&self) -> &'static str;

    /// At most `limit` records, process group 1 excluded
    fn scan(&mut self, limit: usize) -> Result<Vec<ProcessRecord>>;
}

/// Keep the records worth reporting, up to `limit`
fn collect<I: Iterator<Item = ProcessRecord>>(records: I, limit: usize) -> Vec<ProcessRecord> {
    let mut kept = Vec::new();
    for record in records.filter(|r| r.pgid != 1) {
        if kept.len() >= limit {
            info!("maximum number of processes {} reached", limit);
            break;
        }
        kept.push(record);
    }
    kept
}

/// Reads `/proc/<pid>/stat` for every numeric entry under the proc root
pub struct ProcfsSource {
    root: PathBuf,
    page_size_kb: i64,
}

impl ProcfsSource {
    pub fn new() -> Self {
        Self::with_root(PathBuf::from("/proc"))
    }

    pub fn with_root(root: PathBuf) -> Self {
        let page_size = nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
            .ok()
            .flatten()
            .map(|v| v as i64)
            .unwrap_or(4096);
        Self {
            root,
            page_size_kb: (page_size / 1024).max(1),
        }
    }

    fn read_one(&self, pid: &str) -> Option<ProcessRecord> {
        let path = self.root.join(pid).join("stat");
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                let record = parse_stat(&content, self.page_size_kb);
                if record.is_none() {
                    warn!("cannot parse {}", path.display());
                }
                record
            }
            // Processes exit between readdir and open
            Err(e) => {
                debug!("{}: {}", path.display(), e);
                None
            }
        }
    }
}

impl Default for ProcfsSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSource for ProcfsSource {
    fn name(&self) -> &'static str {
        "procfs"
    }

    fn scan(&mut self, limit: usize) -> Result<Vec<ProcessRecord>> {
        let entries = std::fs::read_dir(&self.root)
            .map_err(|e| PimError::Scan(format!("{}: {}", self.root.display(), e)))?;

        let mut pids: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| name.starts_with(|c: char| c.is_ascii_digit()))
            .collect();
        pids.sort_by_key(|p| p.parse::<u64>().unwrap_or(u64::MAX));

        Ok(collect(pids.iter().filter_map(|pid| self.read_one(pid)), limit))
    }
}

/// Portable fallback through `sysinfo`; CPU times are not available there
pub struct SysinfoSource {
    system: System,
}

impl SysinfoSource {
    pub fn new() -> Self {
        Self { system: System::new() }
    }
}

impl Default for SysinfoSource {
    fn default() -> Self {
        Self::new()
    }
}

fn state_of(status: ProcessStatus) -> RunState {
    match status {
        ProcessStatus::Sleep | ProcessStatus::Idle => RunState::Sleeping,
        ProcessStatus::Stop => RunState::Stopped,
        ProcessStatus::Zombie | ProcessStatus::Dead => RunState::Zombie,
        _ => RunState::Running,
    }
}

impl ProcessSource for SysinfoSource {
    fn name(&self) -> &'static str {
        "sysinfo"
    }

    fn scan(&mut self, limit: usize) -> Result<Vec<ProcessRecord>> {
        self.system.refresh_processes();

        let mut records: Vec<ProcessRecord> = self
            .system
            .processes()
            .values()
            .map(|p| {
                let pid = p.pid().as_u32() as i32;
                let pgid = nix::unistd::getpgid(Some(nix::unistd::Pid::from_raw(pid)))
                    .map(|g| g.as_raw())
                    .unwrap_or(0);
                ProcessRecord {
                    pid,
                    ppid: p.parent().map(|pp| pp.as_u32() as i32).unwrap_or(0),
                    pgid,
                    jobid: 0,
                    utime: 0,
                    stime: 0,
                    cutime: 0,
                    cstime: 0,
                    proc_size: (p.virtual_memory() / 1024) as i64,
                    resident_size: (p.memory() / 1024) as i64,
                    stack_size: 0,
                    status: state_of(p.status()),
                }
            })
            .collect();
        records.sort_by_key(|r| r.pid);

        Ok(collect(records.into_iter(), limit))
    }
}

/// procfs where it is mounted, sysinfo elsewhere
pub fn detect() -> Box<dyn ProcessSource> {
    if std::path::Path::new("/proc/self/stat").exists() {
        Box::new(ProcfsSource::new())
    } else {
        Box::new(SysinfoSource::new())
    }
}
