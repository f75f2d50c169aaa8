//! ELIM subprocess handling

use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::{kill, sigprocmask, SigHandler, SigSet, SigmaskHow, Signal};
use nix::unistd::Pid;
use std::io::Read;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{LimError, Result};

const READ_CHUNK: usize = 4096;
const TERM_GRACE: Duration = Duration::from_millis(200);

/// What to run and the environment to hand it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Outcome of one bounded read from the probe's pipe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeRead {
    Data(Vec<u8>),
    /// Nothing arrived within the poll timeout
    NoData,
    /// The write end is gone: the probe exited or closed stdout
    Closed,
}

/// A live probe process
pub trait ProbeHandle: Send {
    fn pid(&self) -> u32;

    /// Wait at most `timeout` for output
    fn read_available(&mut self, timeout: Duration) -> Result<ProbeRead>;

    /// Stop the probe and reap it
    fn terminate(&mut self);
}

/// Starts probe processes
pub trait ProbeLauncher: Send {
    fn launch(&mut self, spec: &ProbeSpec) -> Result<Box<dyn ProbeHandle>>;
}

/// Launches the probe as a real child process with stdout on a pipe
#[derive(Debug, Default)]
pub struct ChildProbeLauncher;

impl ProbeLauncher for ChildProbeLauncher {
    fn launch(&mut self, spec: &ProbeSpec) -> Result<Box<dyn ProbeHandle>> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        // Descriptors opened by std are close-on-exec already; only the
        // inherited signal state needs resetting in the child.
        unsafe {
            command.pre_exec(|| {
                for signal in Signal::iterator() {
                    if signal == Signal::SIGKILL || signal == Signal::SIGSTOP {
                        continue;
                    }
                    let _ = nix::sys::signal::signal(signal, SigHandler::SigDfl);
                }
                let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None);
                Ok(())
            });
        }

        let mut child = command.spawn().map_err(|e| LimError::ProbeStart {
            program: spec.program.display().to_string(),
            reason: e.to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| LimError::ProbeStart {
            program: spec.program.display().to_string(),
            reason: "no stdout pipe".to_string(),
        })?;

        debug!("spawned {} pid {}", spec.program.display(), child.id());
        Ok(Box::new(ChildProbe {
            child,
            stdout,
            reaped: false,
        }))
    }
}

pub struct ChildProbe {
    child: Child,
    stdout: ChildStdout,
    reaped: bool,
}

impl ProbeHandle for ChildProbe {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn read_available(&mut self, timeout: Duration) -> Result<ProbeRead> {
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        let revents = {
            let mut fds = [PollFd::new(&self.stdout, PollFlags::POLLIN)];
            let ready = poll(&mut fds, timeout_ms)?;
            if ready == 0 {
                return Ok(ProbeRead::NoData);
            }
            fds[0].revents().unwrap_or_else(PollFlags::empty)
        };

        if revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP) {
            let mut buf = vec![0u8; READ_CHUNK];
            let n = self.stdout.read(&mut buf)?;
            if n == 0 {
                return Ok(ProbeRead::Closed);
            }
            buf.truncate(n);
            return Ok(ProbeRead::Data(buf));
        }
        if revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
            return Ok(ProbeRead::Closed);
        }
        Ok(ProbeRead::NoData)
    }

    fn terminate(&mut self) {
        if self.reaped {
            return;
        }
        let pid = Pid::from_raw(self.child.id() as i32);
        if let Ok(Some(status)) = self.child.try_wait() {
            debug!("ELIM pid {} already exited: {}", pid, status);
            self.reaped = true;
            return;
        }

        if let Err(e) = kill(pid, Signal::SIGTERM) {
            warn!("kill({}, SIGTERM) failed: {}", pid, e);
        }
        let deadline = std::time::Instant::now() + TERM_GRACE;
        while std::time::Instant::now() < deadline {
            if let Ok(Some(_)) = self.child.try_wait() {
                self.reaped = true;
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        warn!("ELIM pid {} ignored SIGTERM, killing", pid);
        let _ = self.child.kill();
        let _ = self.child.wait();
        self.reaped = true;
    }
}

impl Drop for ChildProbe {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str) -> ProbeSpec {
        ProbeSpec {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            env: vec![("LSF_RESOURCES".to_string(), "licA scratch".to_string())],
        }
    }

    fn read_until_closed(handle: &mut dyn ProbeHandle) -> Vec<u8> {
        let mut out = Vec::new();
        for _ in 0..200 {
            match handle.read_available(Duration::from_millis(50)).unwrap() {
                ProbeRead::Data(bytes) => out.extend(bytes),
                ProbeRead::NoData => {}
                ProbeRead::Closed => break,
            }
        }
        out
    }

    #[test]
    fn test_child_receives_environment() {
        let mut launcher = ChildProbeLauncher;
        let mut handle = launcher.launch(&shell("echo \"1 names $LSF_RESOURCES\"")).unwrap();
        let out = read_until_closed(handle.as_mut());
        assert_eq!(String::from_utf8(out).unwrap(), "1 names licA scratch\n");
        handle.terminate();
    }

    #[test]
    fn test_terminate_long_running_child() {
        let mut launcher = ChildProbeLauncher;
        let mut handle = launcher.launch(&shell("sleep 30")).unwrap();
        assert_eq!(
            handle.read_available(Duration::from_millis(10)).unwrap(),
            ProbeRead::NoData
        );
        handle.terminate();
    }

    #[test]
    fn test_missing_program_fails_to_start() {
        let mut launcher = ChildProbeLauncher;
        let spec = ProbeSpec {
            program: PathBuf::from("/nonexistent/elim"),
            ..Default::default()
        };
        assert!(matches!(launcher.launch(&spec), Err(LimError::ProbeStart { .. })));
    }
}
