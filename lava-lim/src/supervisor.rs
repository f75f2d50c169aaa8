//! Supervision of the PIM child process
//!
//! The LIM spawns the PIM, checks it once per cycle with a non-blocking wait
//! and respawns it after it exits, at most once per backoff period. The PIM
//! watches its parent in turn and exits when the LIM goes away.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::PimConfig;

const STOP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildStatus {
    NotStarted,
    Running(u32),
    /// Exited; waiting for the backoff period before respawning
    Exited(String),
    Stopped,
}

pub struct ChildSupervisor {
    name: String,
    program: PathBuf,
    args: Vec<String>,
    backoff_secs: i64,
    child: Option<Child>,
    last_spawn: Option<i64>,
    spawn_count: u32,
    status: ChildStatus,
}

impl ChildSupervisor {
    /// Supervisor for the configured PIM, or `None` when none is configured
    pub fn from_config(config: &PimConfig) -> Option<Self> {
        let program = config.program.clone()?;
        Some(Self::new("pim", program, config.args.clone(), config.restart_backoff_secs))
    }

    pub fn new(name: &str, program: PathBuf, args: Vec<String>, backoff_secs: u64) -> Self {
        Self {
            name: name.to_string(),
            program,
            args,
            backoff_secs: backoff_secs as i64,
            child: None,
            last_spawn: None,
            spawn_count: 0,
            status: ChildStatus::NotStarted,
        }
    }

    pub fn status(&self) -> &ChildStatus {
        &self.status
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    pub fn spawn_count(&self) -> u32 {
        self.spawn_count
    }

    /// Reap an exited child and respawn when due; returns true on a spawn
    pub fn check(&mut self, now: i64) -> bool {
        if let Some(child) = self.child.as_mut() {
            match child.try_wait() {
                Ok(None) => return false,
                Ok(Some(status)) => {
                    warn!("{} pid {} exited: {}", self.name, child.id(), status);
                    self.status = ChildStatus::Exited(status.to_string());
                    self.child = None;
                }
                Err(e) => {
                    error!("waiting for {} failed: {}", self.name, e);
                    self.status = ChildStatus::Exited(e.to_string());
                    self.child = None;
                }
            }
        }

        if self.status == ChildStatus::Stopped {
            return false;
        }
        if let Some(last) = self.last_spawn {
            if now - last < self.backoff_secs {
                debug!("{} respawn in {}s", self.name, self.backoff_secs - (now - last));
                return false;
            }
        }
        self.spawn(now)
    }

    fn spawn(&mut self, now: i64) -> bool {
        self.last_spawn = Some(now);
        let spawned = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .spawn();
        match spawned {
            Ok(child) => {
                info!("Started {} {} as pid {}", self.name, self.program.display(), child.id());
                self.status = ChildStatus::Running(child.id());
                self.child = Some(child);
                self.spawn_count += 1;
                true
            }
            Err(e) => {
                error!("Cannot start {} {}: {}", self.name, self.program.display(), e);
                self.status = ChildStatus::Exited(e.to_string());
                false
            }
        }
    }

    /// SIGTERM, a short wait, then SIGKILL; no respawn afterwards
    pub fn shutdown(&mut self) {
        self.status = ChildStatus::Stopped;
        let Some(mut child) = self.child.take() else {
            return;
        };
        let pid = Pid::from_raw(child.id() as i32);
        if let Err(e) = kill(pid, Signal::SIGTERM) {
            warn!("kill({}, SIGTERM) failed: {}", pid, e);
        }

        let started = Instant::now();
        while started.elapsed() < STOP_TIMEOUT {
            match child.try_wait() {
                Ok(Some(status)) => {
                    info!("{} stopped: {}", self.name, status);
                    return;
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(50)),
                Err(e) => {
                    warn!("waiting for {} failed: {}", self.name, e);
                    break;
                }
            }
        }
        warn!("{} did not stop, killing", self.name);
        let _ = child.kill();
        let _ = child.wait();
    }
}

impl Drop for ChildSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str, backoff: u64) -> ChildSupervisor {
        ChildSupervisor::new(
            "test",
            PathBuf::from("/bin/sh"),
            vec!["-c".to_string(), script.to_string()],
            backoff,
        )
    }

    fn wait_for_exit(sup: &mut ChildSupervisor, now: i64) {
        for _ in 0..100 {
            sup.check(now);
            if matches!(sup.status(), ChildStatus::Exited(_)) {
                return;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("child never exited");
    }

    #[test]
    fn test_not_configured() {
        assert!(ChildSupervisor::from_config(&PimConfig::default()).is_none());
    }

    #[test]
    fn test_respawn_after_backoff() {
        let mut sup = shell("exit 3", 30);
        assert!(sup.check(0));
        wait_for_exit(&mut sup, 1);
        assert_eq!(sup.spawn_count(), 1);

        assert!(!sup.check(10));
        assert!(sup.check(30));
        assert_eq!(sup.spawn_count(), 2);
    }

    #[test]
    fn test_running_child_is_left_alone() {
        let mut sup = shell("sleep 30", 0);
        assert!(sup.check(0));
        let pid = sup.pid();
        assert!(!sup.check(100));
        assert_eq!(sup.pid(), pid);

        sup.shutdown();
        assert_eq!(sup.status(), &ChildStatus::Stopped);
        assert!(sup.pid().is_none());
        assert!(!sup.check(200));
    }

    #[test]
    fn test_missing_program() {
        let mut sup = ChildSupervisor::new("pim", PathBuf::from("/nonexistent/pim"), Vec::new(), 30);
        assert!(!sup.check(0));
        assert!(matches!(sup.status(), ChildStatus::Exited(_)));
        assert!(!sup.check(5));
    }
}
