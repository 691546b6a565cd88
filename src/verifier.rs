//! Candidate verification against a stored hash.
//!
//! Two strategies sit behind one seam ([`CandidateVerifier`]):
//!
//! - **Native**: the stored hash doubles as the crypt setting; a candidate
//!   matches when `crypt_wrap(candidate, stored)` byte-equals the stored
//!   hash. This covers every format the platform crypt supports (bcrypt,
//!   sha512-crypt, yescrypt, ...).
//! - **APR1**: system crypt frequently lacks Apache's `$apr1$` variant, so
//!   each verification shells out to `openssl passwd -apr1`. Slow, but the
//!   campaign stops on first match, and correctness beats speed here.
//!
//! Verification failures (timeouts, missing openssl, unsupported settings)
//! are non-matches. Only an unavailable crypt binding is fatal, and only
//! for native mode: it surfaces as [`VerifyError`] so a whole slice can be
//! refused rather than silently reported as exhausted.

use std::fmt;
use std::io::Read;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::crypt::{self, CryptError};

/// Wall-clock cap on one `openssl passwd` invocation.
pub const APR1_CHILD_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll period while waiting for the child to exit.
const CHILD_POLL: Duration = Duration::from_millis(10);

/// Fatal verification errors. Anything recoverable is just a non-match.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum VerifyError {
    /// The platform crypt library could not be bound.
    CryptUnavailable(CryptError),
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CryptUnavailable(e) => write!(f, "crypt binding unavailable: {e}"),
        }
    }
}

impl std::error::Error for VerifyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CryptUnavailable(e) => Some(e),
        }
    }
}

/// The single capability the worker pool needs from a verifier.
///
/// Implementations must be callable from many threads at once.
pub trait CandidateVerifier: Send + Sync {
    /// Returns whether `candidate` matches, or a fatal error that should
    /// abort the enclosing slice.
    fn verify(&self, candidate: &str) -> Result<bool, VerifyError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Mode {
    Native,
    Apr1 { salt: String },
}

/// Verifier for one immutable stored hash; strategy chosen at construction
/// from the hash prefix.
#[derive(Debug, Clone)]
pub struct HashVerifier {
    stored: String,
    mode: Mode,
}

impl HashVerifier {
    /// Wraps a stored hash. `$apr1$<salt>$...` selects APR1 mode; everything
    /// else goes through the platform crypt.
    pub fn new(stored_hash: impl Into<String>) -> Self {
        let stored = stored_hash.into();
        let mode = match apr1_salt(&stored) {
            Some(salt) => Mode::Apr1 { salt },
            None => Mode::Native,
        };
        Self { stored, mode }
    }

    /// The stored hash this verifier was built around.
    pub fn stored_hash(&self) -> &str {
        &self.stored
    }

    /// Whether this verifier shells out to openssl per candidate.
    pub fn is_apr1(&self) -> bool {
        matches!(self.mode, Mode::Apr1 { .. })
    }

    fn verify_native(&self, candidate: &str) -> Result<bool, VerifyError> {
        let binding = crypt::binding().map_err(VerifyError::CryptUnavailable)?;
        Ok(binding.crypt_wrap(candidate, &self.stored).as_deref() == Some(self.stored.as_str()))
    }

    fn verify_apr1(&self, salt: &str, candidate: &str) -> bool {
        match run_openssl_apr1(salt, candidate) {
            Some(output) => output == self.stored,
            None => false,
        }
    }
}

impl CandidateVerifier for HashVerifier {
    fn verify(&self, candidate: &str) -> Result<bool, VerifyError> {
        match &self.mode {
            Mode::Native => self.verify_native(candidate),
            Mode::Apr1 { salt } => Ok(self.verify_apr1(salt, candidate)),
        }
    }
}

/// Extracts the salt from `$apr1$<salt>$...`; `None` for any other shape.
fn apr1_salt(stored: &str) -> Option<String> {
    let rest = stored.strip_prefix("$apr1$")?;
    let salt = rest.split('$').next()?;
    (!salt.is_empty()).then(|| salt.to_owned())
}

/// Runs `openssl passwd -apr1 -salt <salt> <candidate>` and returns trimmed
/// stdout. Spawn failure, non-zero exit, empty output, or timeout all yield
/// `None`.
fn run_openssl_apr1(salt: &str, candidate: &str) -> Option<String> {
    let mut cmd = Command::new("openssl");
    cmd.args(["passwd", "-apr1", "-salt", salt, candidate])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    // Give the child its own process group so an expired timeout can reap
    // the whole tree, not just the immediate child.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // SAFETY: setsid is async-signal-safe and called in the child
        // between fork and exec.
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            tracing::debug!(error = %e, "openssl spawn failed; treating as non-match");
            return None;
        }
    };

    let deadline = Instant::now() + APR1_CHILD_TIMEOUT;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if Instant::now() >= deadline {
                    kill_process_tree(&mut child);
                    let _ = child.wait();
                    tracing::warn!(salt, "openssl passwd timed out; treating as non-match");
                    return None;
                }
                std::thread::sleep(CHILD_POLL);
            }
            Err(e) => {
                tracing::debug!(error = %e, "openssl wait failed; treating as non-match");
                kill_process_tree(&mut child);
                let _ = child.wait();
                return None;
            }
        }
    };

    if !status.success() {
        return None;
    }

    // The child exited; its single line of output fits comfortably in the
    // pipe buffer, so draining after exit cannot block.
    let mut out = String::new();
    child.stdout.take()?.read_to_string(&mut out).ok()?;
    let trimmed = out.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}

#[cfg(unix)]
fn kill_process_tree(child: &mut std::process::Child) {
    // The child leads its own process group (setsid above); signal the group.
    let pgid = child.id() as libc::pid_t;
    // SAFETY: killpg with SIGKILL on the child's own group.
    unsafe { libc::killpg(pgid, libc::SIGKILL) };
}

#[cfg(not(unix))]
fn kill_process_tree(child: &mut std::process::Child) {
    let _ = child.kill();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn openssl_available() -> bool {
        Command::new("openssl")
            .arg("version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    #[test]
    fn mode_selection_follows_prefix() {
        assert!(HashVerifier::new("$apr1$abcd1234$deadbeef").is_apr1());
        assert!(!HashVerifier::new("$6$saltxxxx$rest").is_apr1());
        assert!(!HashVerifier::new("$1$aa$bb").is_apr1());
        // Malformed apr1 (no salt) degrades to native rather than panicking.
        assert!(!HashVerifier::new("$apr1$").is_apr1());
    }

    #[test]
    fn apr1_salt_extraction() {
        assert_eq!(apr1_salt("$apr1$s4lt$hash"), Some("s4lt".to_owned()));
        assert_eq!(apr1_salt("$apr1$s4lt"), Some("s4lt".to_owned()));
        assert_eq!(apr1_salt("$6$x$y"), None);
        assert_eq!(apr1_salt("$apr1$$x"), None);
    }

    #[test]
    fn apr1_round_trip_through_openssl() {
        if !openssl_available() {
            return;
        }
        // Fixture produced by `openssl passwd -apr1 -salt testsalt secret12`.
        let Some(stored) = run_openssl_apr1("testsalt", "secret12") else {
            return;
        };
        let v = HashVerifier::new(stored);
        assert!(v.is_apr1());
        assert_eq!(v.verify("secret12"), Ok(true));
        assert_eq!(v.verify("secret13"), Ok(false));
    }

    #[test]
    fn missing_openssl_is_a_non_match() {
        // Force a spawn failure by hiding PATH from the child lookup: a salt
        // pointing at an impossible candidate still must not error.
        let v = HashVerifier::new("$apr1$abcd1234$notarealhashvalue00000");
        // Whether or not openssl exists, a wrong candidate is a clean false.
        assert_eq!(v.verify("wrong"), Ok(false));
    }

    #[test]
    fn native_match_round_trips_when_crypt_present() {
        let Ok(b) = crate::crypt::binding() else { return };
        let Some(stored) = b.crypt_wrap("Cc", "$1$saltxxxx$") else {
            return;
        };
        if stored.starts_with('*') {
            return;
        }
        let v = HashVerifier::new(stored);
        assert_eq!(v.verify("Cc"), Ok(true));
        assert_eq!(v.verify("Cd"), Ok(false));
    }
}
