//! Plaintext credential files and their encryption.
//!
//! A decrypted or freshly written `.env` only exists inside a
//! [`PlaintextFile`] scope. The file is removed when the scope ends, and the
//! interrupt handler removes every live scope's file before the process exits.

use crate::display::{format_status, Status};
use crate::error::DkError;
use crate::fsutil::write_private_file;
use crate::runner::{run_check, CommandRunner, Invocation};
use dialoguer::console::Term;
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct CleanupRegistry {
    paths: Arc<Mutex<BTreeSet<PathBuf>>>,
    tolerate_interrupt: Arc<AtomicBool>,
    interrupted: Arc<AtomicBool>,
}

impl CleanupRegistry {
    pub fn register(&self, path: &Path) {
        if let Ok(mut paths) = self.paths.lock() {
            paths.insert(path.to_path_buf());
        }
    }

    pub fn unregister(&self, path: &Path) {
        if let Ok(mut paths) = self.paths.lock() {
            paths.remove(path);
        }
    }

    #[cfg(test)]
    pub fn registered(&self) -> Vec<PathBuf> {
        self.paths
            .lock()
            .map(|paths| paths.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Removes every registered file; returns how many were deleted.
    pub fn remove_all(&self) -> usize {
        let Ok(mut paths) = self.paths.lock() else {
            return 0;
        };
        let mut removed = 0;
        for path in paths.iter() {
            if fs::remove_file(path).is_ok() {
                removed += 1;
            }
        }
        paths.clear();
        removed
    }

    /// Spawns the thread that turns SIGINT/SIGTERM/SIGHUP into cleanup plus
    /// exit status 1.
    pub fn install_signal_handler(&self) -> Result<(), DkError> {
        let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
        let registry = self.clone();
        thread::Builder::new()
            .name("dkdeploy-signals".to_string())
            .spawn(move || {
                for signal in signals.forever() {
                    registry.interrupted.store(true, Ordering::SeqCst);
                    if signal == SIGINT && registry.tolerate_interrupt.load(Ordering::SeqCst) {
                        tracing::debug!("interrupt delivered to foreground command");
                        continue;
                    }
                    let removed = registry.remove_all();
                    tracing::debug!(signal, removed, "cleaned up plaintext files on signal");
                    let _ = Term::stderr().show_cursor();
                    eprintln!();
                    eprintln!("{}", format_status(Status::Warning, "Cancelled by operator"));
                    std::process::exit(1);
                }
            })?;
        Ok(())
    }

    /// Runs `f` while Ctrl+C only stops the foreground command (used for log
    /// following, which the operator ends with Ctrl+C).
    pub fn tolerating_interrupt<T>(&self, f: impl FnOnce() -> T) -> T {
        self.tolerate_interrupt.store(true, Ordering::SeqCst);
        let result = f();
        self.tolerate_interrupt.store(false, Ordering::SeqCst);
        result
    }

    /// Returns and clears the interrupt flag.
    pub fn take_interrupt(&self) -> bool {
        self.interrupted.swap(false, Ordering::SeqCst)
    }
}

/// Scoped plaintext file: registered for signal cleanup before it is written,
/// removed when dropped.
#[derive(Debug)]
pub struct PlaintextFile<'a> {
    path: PathBuf,
    registry: &'a CleanupRegistry,
}

impl<'a> PlaintextFile<'a> {
    pub fn create(registry: &'a CleanupRegistry, path: &Path, content: &str) -> Result<Self, DkError> {
        let scope = Self::adopt(registry, path);
        write_private_file(path, content)?;
        Ok(scope)
    }

    /// Takes ownership of a path an external tool is about to write.
    pub fn adopt(registry: &'a CleanupRegistry, path: &Path) -> Self {
        registry.register(path);
        Self {
            path: path.to_path_buf(),
            registry,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn read(&self) -> Result<String, DkError> {
        Ok(fs::read_to_string(&self.path)?)
    }
}

impl Drop for PlaintextFile<'_> {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "removed plaintext file"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "failed to remove plaintext file")
            }
        }
        self.registry.unregister(&self.path);
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Interactive decrypt; gpg prompts for the passphrase on the terminal.
pub fn decrypt_interactive<R: CommandRunner + ?Sized>(
    runner: &R,
    cwd: &Path,
    encrypted: &Path,
    plaintext: &PlaintextFile<'_>,
) -> bool {
    let invocation = Invocation::new("gpg")
        .args(["--yes", "-o"])
        .arg(path_arg(plaintext.path()))
        .arg("-d")
        .arg(path_arg(encrypted));
    run_check(runner, cwd, &invocation).success && plaintext.exists()
}

/// Non-interactive decrypt; only succeeds when an agent already holds the
/// passphrase.
pub fn decrypt_batch<R: CommandRunner + ?Sized>(
    runner: &R,
    cwd: &Path,
    encrypted: &Path,
    plaintext: &PlaintextFile<'_>,
    timeout: Duration,
) -> bool {
    let invocation = Invocation::new("gpg")
        .args(["--batch", "--quiet", "--yes", "-o"])
        .arg(path_arg(plaintext.path()))
        .arg("-d")
        .arg(path_arg(encrypted))
        .captured()
        .timeout(timeout);
    run_check(runner, cwd, &invocation).success && plaintext.exists()
}

/// Symmetric encryption; gpg prompts for the passphrase on the terminal.
pub fn encrypt_symmetric<R: CommandRunner + ?Sized>(
    runner: &R,
    cwd: &Path,
    plaintext: &PlaintextFile<'_>,
    encrypted: &Path,
) -> bool {
    let invocation = Invocation::new("gpg")
        .args(["--yes", "-o"])
        .arg(path_arg(encrypted))
        .arg("-c")
        .arg(path_arg(plaintext.path()));
    run_check(runner, cwd, &invocation).success
}
