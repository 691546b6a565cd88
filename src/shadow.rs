//! Reader for shadow-style credential files.
//!
//! Records are colon-separated; the first field is the username and the
//! second the password hash. Blank lines and `#` comments are skipped.
//! The placeholders `!`, `*`, `x`, and the empty string mark accounts with
//! no crackable hash.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

/// The hash field of one shadow record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashField {
    /// A real hash usable as a crypt setting.
    Crackable(String),
    /// Locked or passwordless account (`!`, `*`, `x`, empty).
    Locked,
}

/// Errors from shadow-file lookup.
#[derive(Debug)]
#[non_exhaustive]
pub enum ShadowError {
    /// The file could not be read.
    Io(io::Error),
    /// No record with the requested username.
    UserNotFound { user: String },
}

impl fmt::Display for ShadowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "shadow file unreadable: {e}"),
            Self::UserNotFound { user } => write!(f, "no shadow record for user {user:?}"),
        }
    }
}

impl std::error::Error for ShadowError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Whether a hash field is a lock/placeholder marker rather than a hash.
pub fn is_placeholder(field: &str) -> bool {
    matches!(field, "" | "!" | "*" | "x")
}

/// Looks up `user` in the shadow-style file at `path`.
///
/// The first matching record wins, mirroring how the C library resolves
/// duplicate entries.
pub fn lookup_user(path: &Path, user: &str) -> Result<HashField, ShadowError> {
    let content = fs::read_to_string(path).map_err(ShadowError::Io)?;
    for line in content.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split(':');
        let name = fields.next().unwrap_or("");
        if name != user {
            continue;
        }
        let hash = fields.next().unwrap_or("");
        return Ok(if is_placeholder(hash) {
            HashField::Locked
        } else {
            HashField::Crackable(hash.to_owned())
        });
    }
    Err(ShadowError::UserNotFound { user: user.to_owned() })
}
