//! In-process probe doubles for exercising the integrator without forking

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::process::{ProbeHandle, ProbeLauncher, ProbeRead, ProbeSpec};
use crate::error::{LimError, Result};

#[derive(Debug, Default)]
struct LauncherState {
    launches: Vec<ProbeSpec>,
    failures_left: usize,
    terminations: usize,
    output: VecDeque<Vec<u8>>,
    closed: bool,
    next_pid: u32,
}

/// Launcher whose probes replay output pushed by the test
///
/// Only one probe is live at a time, so output and exits always go to the
/// most recently launched one.
#[derive(Debug, Clone, Default)]
pub struct ScriptedLauncher {
    state: Arc<Mutex<LauncherState>>,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LauncherState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `n` launches fail
    pub fn fail_launches(&self, n: usize) {
        self.lock().failures_left = n;
    }

    /// Queue bytes for the live probe's next read
    pub fn push_output(&self, bytes: &[u8]) {
        self.lock().output.push_back(bytes.to_vec());
    }

    /// The live probe exits once its queued output is drained
    pub fn exit_probe(&self) {
        self.lock().closed = true;
    }

    pub fn launches(&self) -> Vec<ProbeSpec> {
        self.lock().launches.clone()
    }

    pub fn terminations(&self) -> usize {
        self.lock().terminations
    }
}

impl ProbeLauncher for ScriptedLauncher {
    fn launch(&mut self, spec: &ProbeSpec) -> Result<Box<dyn ProbeHandle>> {
        let mut state = self.lock();
        state.launches.push(spec.clone());
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(LimError::ProbeStart {
                program: spec.program.display().to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        state.output.clear();
        state.closed = false;
        state.next_pid += 1;
        Ok(Box::new(ScriptedProbe {
            pid: state.next_pid,
            state: Arc::clone(&self.state),
            terminated: false,
        }))
    }
}

pub struct ScriptedProbe {
    pid: u32,
    state: Arc<Mutex<LauncherState>>,
    terminated: bool,
}

impl ProbeHandle for ScriptedProbe {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn read_available(&mut self, _timeout: Duration) -> Result<ProbeRead> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(bytes) = state.output.pop_front() {
            return Ok(ProbeRead::Data(bytes));
        }
        if state.closed {
            return Ok(ProbeRead::Closed);
        }
        Ok(ProbeRead::NoData)
    }

    fn terminate(&mut self) {
        if !self.terminated {
            self.terminated = true;
            self.state.lock().unwrap_or_else(|e| e.into_inner()).terminations += 1;
        }
    }
}
