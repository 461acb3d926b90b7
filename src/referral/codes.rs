//! Invite-code minting.
//!
//! A collision-avoiding unique-string mint with a hard retry cap. Nothing
//! clever: the code space (32^8) is large enough that the cap exists only
//! to bound the loop, not because collisions are expected.

use crate::errors::ConsistencyError;
use rand::Rng;

/// Unambiguous uppercase alphabet: no 0/O, no 1/I.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

pub const DEFAULT_CODE_LENGTH: usize = 8;
pub const MAX_MINT_ATTEMPTS: u32 = 16;

/// Stateless code generator; uniqueness is the caller's map, passed in as
/// a predicate so the mint stays decoupled from ledger locking.
#[derive(Clone, Copy, Debug)]
pub struct CodeMint {
    length: usize,
    max_attempts: u32,
}

impl Default for CodeMint {
    fn default() -> Self {
        Self {
            length: DEFAULT_CODE_LENGTH,
            max_attempts: MAX_MINT_ATTEMPTS,
        }
    }
}

impl CodeMint {
    pub fn new(length: usize, max_attempts: u32) -> Self {
        Self {
            length,
            max_attempts,
        }
    }

    /// Mint a code not matched by `is_taken`. Bounded: fails after
    /// `max_attempts` collisions instead of spinning.
    pub fn mint(&self, is_taken: impl Fn(&str) -> bool) -> Result<String, ConsistencyError> {
        for _ in 0..self.max_attempts {
            let code = self.generate();
            if !is_taken(&code) {
                return Ok(code);
            }
        }
        Err(ConsistencyError::CodeMintExhausted(self.max_attempts))
    }

    fn generate(&self) -> String {
        let mut rng = rand::thread_rng();
        (0..self.length)
            .map(|_| {
                let idx = rng.gen_range(0..CODE_ALPHABET.len());
                CODE_ALPHABET[idx] as char
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_codes_use_alphabet_and_length() {
        let mint = CodeMint::default();
        let code = mint.mint(|_| false).unwrap();
        assert_eq!(code.len(), DEFAULT_CODE_LENGTH);
        assert!(code.bytes().all(|b| CODE_ALPHABET.contains(&b)));
    }

    #[test]
    fn test_mint_skips_taken_codes() {
        let mint = CodeMint::new(4, 16);
        let mut taken = HashSet::new();
        for _ in 0..100 {
            let code = mint.mint(|c| taken.contains(c)).unwrap();
            assert!(taken.insert(code));
        }
    }

    #[test]
    fn test_mint_gives_up_after_cap() {
        let mint = CodeMint::new(8, 5);
        let err = mint.mint(|_| true).unwrap_err();
        assert_eq!(err, ConsistencyError::CodeMintExhausted(5));
    }
}
