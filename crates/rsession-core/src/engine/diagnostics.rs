//! Forwarding of engine console chatter into `tracing`.
//!
//! Worker processes write R's console output and their own diagnostics to
//! stderr. The host forwards those lines at debug level unless the gate is
//! muted, which close paths do while force-killing instances so that the
//! resulting "connection reset" noise stays out of the logs.

use std::io::{BufRead, BufReader, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

/// Process-wide mute switch for engine output.
///
/// Muting nests: output stays suppressed until every [`MuteGuard`] is dropped.
#[derive(Clone, Default)]
pub struct DiagnosticsGate {
    muted: Arc<AtomicUsize>,
}

impl DiagnosticsGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suppress forwarded output until the guard is dropped.
    pub fn mute(&self) -> MuteGuard {
        self.muted.fetch_add(1, Ordering::SeqCst);
        MuteGuard {
            muted: Arc::clone(&self.muted),
        }
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst) > 0
    }

    /// Forward lines from `source` to `tracing` on a background thread.
    ///
    /// The thread ends when the stream reaches EOF.
    pub fn forward(
        &self,
        source: impl Read + Send + 'static,
        label: impl Into<String>,
    ) -> std::io::Result<JoinHandle<()>> {
        let gate = self.clone();
        let label = label.into();
        std::thread::Builder::new()
            .name(format!("rsession-{}", label))
            .spawn(move || {
                for line in BufReader::new(source).lines() {
                    let Ok(line) = line else { break };
                    if !gate.is_muted() {
                        tracing::debug!(target: "rsession::engine", "{}> {}", label, line);
                    }
                }
            })
    }
}

/// Restores forwarding when dropped.
pub struct MuteGuard {
    muted: Arc<AtomicUsize>,
}

impl Drop for MuteGuard {
    fn drop(&mut self) {
        self.muted.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_mute_nests() {
        let gate = DiagnosticsGate::new();
        assert!(!gate.is_muted());

        let outer = gate.mute();
        let inner = gate.clone().mute();
        assert!(gate.is_muted());

        drop(outer);
        assert!(gate.is_muted());
        drop(inner);
        assert!(!gate.is_muted());
    }

    #[test]
    fn test_forward_ends_at_eof() {
        let gate = DiagnosticsGate::new();
        let handle = gate
            .forward(Cursor::new(b"[1] 42\nWarning message\n".to_vec()), "test")
            .unwrap();
        handle.join().unwrap();
    }
}
