//! Distributed brute-force cracker for Unix crypt(3) password hashes.
//!
//! A coordinator splits the lexicographic candidate space into contiguous
//! index slices and hands them to worker nodes over a line-delimited JSON
//! protocol with a reverse-connect handshake. Each worker drives a
//! persistent thread pool that enumerates its slice, verifies candidates
//! through the platform crypt library (or `openssl` for APR1 hashes), and
//! streams ordered progress checkpoints until a match, exhaustion, or a
//! broadcast `STOP`.
//!
//! Crate layout, leaves first:
//! - [`alphabet`]: index ↔ candidate bijection over the frozen 79-char set.
//! - [`crypt`]: process-wide `dlopen` binding with per-thread reentrancy.
//! - [`verifier`]: native-crypt and APR1-via-openssl strategies behind one
//!   trait.
//! - [`shadow`]: shadow-style file reader for the coordinator tooling.
//! - [`pool`]: the parallel search engine with ordered-commit progress.
//! - [`protocol`]: the wire envelope and framing.
//! - [`node`]: the worker-side session state machine.

pub mod alphabet;
pub mod crypt;
pub mod node;
pub mod pool;
pub mod protocol;
pub mod shadow;
pub mod util;
pub mod verifier;

pub use alphabet::{Alphabet, AlphabetError, ALPHABET_LEN};
pub use node::{WorkerConfig, WorkerNode};
pub use pool::{NullObserver, SliceObserver, SliceResult, WorkerPool};
pub use verifier::{CandidateVerifier, HashVerifier, VerifyError};
