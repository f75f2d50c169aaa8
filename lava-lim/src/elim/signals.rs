//! Terminating-signal block around a multi-step update

use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};
use tracing::{trace, warn};

use crate::error::Result;

/// Blocks SIGTERM, SIGINT, SIGHUP and SIGQUIT until dropped
///
/// Signals arriving meanwhile stay pending and are delivered once the
/// previous mask is restored.
pub struct SignalBlock {
    previous: SigSet,
}

impl SignalBlock {
    pub fn new() -> Result<Self> {
        let mut block = SigSet::empty();
        for signal in [Signal::SIGTERM, Signal::SIGINT, Signal::SIGHUP, Signal::SIGQUIT] {
            block.add(signal);
        }
        let mut previous = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&block), Some(&mut previous))?;
        trace!("terminating signals blocked");
        Ok(Self { previous })
    }
}

impl Drop for SignalBlock {
    fn drop(&mut self) {
        if let Err(e) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None) {
            warn!("failed to restore signal mask: {}", e);
        }
        trace!("signal mask restored");
    }
}
