//! Candidate enumeration over a fixed 79-character alphabet.
//!
//! Candidates are ordered by length first (all length-1 strings, then all
//! length-2 strings, ...) and lexicographically within a length, digit 0
//! being `alphabet[0]`. A candidate index is therefore a plain base-79
//! number offset by the count of all shorter candidates:
//!
//! ```text
//! index 0..=78   -> "A".."?"        (length 1)
//! index 79       -> "AA"            (length 2)
//! index 79+79^2  -> "AAA"           (length 3)
//! ```
//!
//! # Invariants
//! - The alphabet is exactly [`ALPHABET_LEN`] distinct ASCII characters;
//!   construction rejects anything else.
//! - `index_to_candidate` and `candidate_to_index` are mutual inverses over
//!   the full representable range; the coordinator relies on this bijection
//!   to partition work without overlap.

use std::fmt;

/// The frozen candidate-space size. Other sizes are configuration errors.
pub const ALPHABET_LEN: usize = 79;

/// The canonical ordered alphabet: uppercase, lowercase, digits, then the
/// 17 symbols `@#%^&*()_+-=.,:;?`.
pub const STANDARD_CHARS: &[u8; ALPHABET_LEN] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789@#%^&*()_+-=.,:;?";

/// Errors from alphabet construction and index mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AlphabetError {
    /// The configured alphabet does not have exactly 79 characters.
    WrongLength { got: usize },
    /// A character appears twice, breaking the bijection.
    DuplicateChar { ch: char },
    /// A non-ASCII byte cannot participate in base-79 digit mapping.
    NonAscii { byte: u8 },
    /// The cumulative candidate count exceeded the index range.
    IndexOverflow,
    /// A candidate contains a character outside the alphabet.
    UnknownChar { ch: char },
    /// The empty string has no index.
    EmptyCandidate,
}

impl fmt::Display for AlphabetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongLength { got } => {
                write!(f, "alphabet must have exactly {ALPHABET_LEN} characters, got {got}")
            }
            Self::DuplicateChar { ch } => write!(f, "duplicate alphabet character {ch:?}"),
            Self::NonAscii { byte } => write!(f, "non-ASCII alphabet byte 0x{byte:02x}"),
            Self::IndexOverflow => write!(f, "candidate index out of representable range"),
            Self::UnknownChar { ch } => write!(f, "character {ch:?} is not in the alphabet"),
            Self::EmptyCandidate => write!(f, "empty candidate has no index"),
        }
    }
}

impl std::error::Error for AlphabetError {}

/// An ordered, duplicate-free, ASCII candidate alphabet of exactly 79 chars.
#[derive(Clone, PartialEq, Eq)]
pub struct Alphabet {
    chars: [u8; ALPHABET_LEN],
    /// Reverse digit lookup: byte -> digit value, `u8::MAX` when absent.
    positions: [u8; 128],
}

impl fmt::Debug for Alphabet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Alphabet")
            .field("chars", &std::str::from_utf8(&self.chars).unwrap_or("<non-utf8>"))
            .finish()
    }
}

impl Default for Alphabet {
    fn default() -> Self {
        Self::standard()
    }
}

impl Alphabet {
    /// The canonical 79-character alphabet.
    pub fn standard() -> Self {
        Self::from_bytes(STANDARD_CHARS).expect("standard alphabet is valid")
    }

    /// Builds an alphabet from raw bytes, rejecting wrong lengths, non-ASCII
    /// bytes, and duplicates.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AlphabetError> {
        if bytes.len() != ALPHABET_LEN {
            return Err(AlphabetError::WrongLength { got: bytes.len() });
        }
        let mut chars = [0u8; ALPHABET_LEN];
        let mut positions = [u8::MAX; 128];
        for (i, &b) in bytes.iter().enumerate() {
            if !b.is_ascii() {
                return Err(AlphabetError::NonAscii { byte: b });
            }
            if positions[b as usize] != u8::MAX {
                return Err(AlphabetError::DuplicateChar { ch: b as char });
            }
            positions[b as usize] = i as u8;
            chars[i] = b;
        }
        Ok(Self { chars, positions })
    }

    /// Number of characters (always [`ALPHABET_LEN`]).
    #[inline]
    pub fn len(&self) -> usize {
        ALPHABET_LEN
    }

    /// Never true; present for API symmetry with collection types.
    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Decodes a candidate index into its string.
    ///
    /// Finds the unique length `L` with `Σ_{k=1..L-1} 79^k <= i < Σ_{k=1..L} 79^k`
    /// and renders `i - Σ_{k=1..L-1} 79^k` as exactly `L` base-79 digits,
    /// most-significant first. Fails with [`AlphabetError::IndexOverflow`]
    /// when the cumulative count no longer fits in `u64`.
    pub fn index_to_candidate(&self, index: u64) -> Result<String, AlphabetError> {
        let radix = ALPHABET_LEN as u64;

        // Walk lengths until `index` falls inside the current band.
        let mut len = 1usize;
        let mut band = radix; // number of candidates of length `len`
        let mut base = 0u64; // candidates shorter than `len`
        loop {
            let band_end = base.checked_add(band).ok_or(AlphabetError::IndexOverflow)?;
            if index < band_end {
                break;
            }
            base = band_end;
            band = band.checked_mul(radix).ok_or(AlphabetError::IndexOverflow)?;
            len += 1;
        }

        let mut offset = index - base;
        let mut out = vec![0u8; len];
        for slot in out.iter_mut().rev() {
            *slot = self.chars[(offset % radix) as usize];
            offset /= radix;
        }
        debug_assert_eq!(offset, 0);
        // Alphabet bytes are ASCII by construction.
        Ok(String::from_utf8(out).expect("alphabet bytes are ASCII"))
    }

    /// Encodes a candidate string back into its index. Exact inverse of
    /// [`index_to_candidate`]; the coordinator uses this to translate
    /// human-chosen range endpoints into index space.
    pub fn candidate_to_index(&self, candidate: &str) -> Result<u64, AlphabetError> {
        if candidate.is_empty() {
            return Err(AlphabetError::EmptyCandidate);
        }
        let radix = ALPHABET_LEN as u64;

        // base = Σ_{k=1..len-1} 79^k
        let mut base = 0u64;
        let mut band = radix;
        for _ in 1..candidate.len() {
            base = base.checked_add(band).ok_or(AlphabetError::IndexOverflow)?;
            band = band.checked_mul(radix).ok_or(AlphabetError::IndexOverflow)?;
        }

        let mut offset = 0u64;
        for ch in candidate.chars() {
            let digit = self.digit(ch)?;
            offset = offset
                .checked_mul(radix)
                .and_then(|v| v.checked_add(digit as u64))
                .ok_or(AlphabetError::IndexOverflow)?;
        }
        base.checked_add(offset).ok_or(AlphabetError::IndexOverflow)
    }

    fn digit(&self, ch: char) -> Result<u8, AlphabetError> {
        if !ch.is_ascii() {
            return Err(AlphabetError::UnknownChar { ch });
        }
        match self.positions[ch as usize] {
            u8::MAX => Err(AlphabetError::UnknownChar { ch }),
            d => Ok(d),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_alphabet_is_frozen() {
        let a = Alphabet::standard();
        assert_eq!(a.len(), 79);
        assert_eq!(a.index_to_candidate(0).unwrap(), "A");
        assert_eq!(a.index_to_candidate(25).unwrap(), "Z");
        assert_eq!(a.index_to_candidate(26).unwrap(), "a");
        assert_eq!(a.index_to_candidate(78).unwrap(), "?");
    }

    #[test]
    fn length_transition_at_79() {
        let a = Alphabet::standard();
        assert_eq!(a.index_to_candidate(79).unwrap(), "AA");
        assert_eq!(a.index_to_candidate(79 + 78).unwrap(), "A?");
        assert_eq!(a.index_to_candidate(79 + 79).unwrap(), "BA");
        // Last length-2 candidate, then the first length-3 one.
        assert_eq!(a.index_to_candidate(79 + 79 * 79 - 1).unwrap(), "??");
        assert_eq!(a.index_to_candidate(79 + 79 * 79).unwrap(), "AAA");
    }

    #[test]
    fn first_band_matches_alphabet_order() {
        let a = Alphabet::standard();
        for (i, &b) in STANDARD_CHARS.iter().enumerate() {
            let s = a.index_to_candidate(i as u64).unwrap();
            assert_eq!(s.as_bytes(), &[b]);
        }
    }

    #[test]
    fn encode_is_the_inverse_of_decode() {
        let a = Alphabet::standard();
        for i in (0u64..200_000).step_by(37) {
            let s = a.index_to_candidate(i).unwrap();
            assert_eq!(a.candidate_to_index(&s).unwrap(), i, "index {i} -> {s:?}");
        }
    }

    #[test]
    fn decode_is_strictly_ordered_within_and_across_lengths() {
        let a = Alphabet::standard();
        let mut prev = a.index_to_candidate(0).unwrap();
        for i in 1u64..7_000 {
            let cur = a.index_to_candidate(i).unwrap();
            let shorter_first =
                prev.len() < cur.len() || (prev.len() == cur.len() && digits(&a, &prev) < digits(&a, &cur));
            assert!(shorter_first, "ordering violated between {prev:?} and {cur:?}");
            prev = cur;
        }
    }

    fn digits(a: &Alphabet, s: &str) -> Vec<u8> {
        s.chars().map(|c| a.digit(c).unwrap()).collect()
    }

    #[test]
    fn huge_index_overflows_explicitly() {
        let a = Alphabet::standard();
        // u64::MAX sits beyond the length-10 band boundary computation.
        assert_eq!(a.index_to_candidate(u64::MAX), Err(AlphabetError::IndexOverflow));
    }

    #[test]
    fn wrong_length_rejected() {
        assert_eq!(
            Alphabet::from_bytes(b"ABC"),
            Err(AlphabetError::WrongLength { got: 3 })
        );
        let mut too_long = STANDARD_CHARS.to_vec();
        too_long.push(b'!');
        assert_eq!(
            Alphabet::from_bytes(&too_long),
            Err(AlphabetError::WrongLength { got: 80 })
        );
    }

    #[test]
    fn duplicates_rejected() {
        let mut dup = *STANDARD_CHARS;
        dup[1] = b'A';
        assert_eq!(
            Alphabet::from_bytes(&dup),
            Err(AlphabetError::DuplicateChar { ch: 'A' })
        );
    }

    #[test]
    fn unknown_characters_rejected_on_encode() {
        let a = Alphabet::standard();
        assert_eq!(
            a.candidate_to_index("A!B"),
            Err(AlphabetError::UnknownChar { ch: '!' })
        );
        assert_eq!(a.candidate_to_index(""), Err(AlphabetError::EmptyCandidate));
    }
}
