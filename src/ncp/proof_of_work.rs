use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(test)] use mockall::automock;
use sha2::{Digest, Sha256};

/// The puzzle a server requires connecting clients to solve: find a nonce that satisfies a
///  difficulty predicate for a server-provided salt. Verification must be cheap compared to
///  solving.
#[cfg_attr(test, automock)]
pub trait ProofOfWork: Send + Sync + 'static {
    fn verify(&self, salt: &[u8], difficulty: u8, nonce: i32) -> bool;

    /// Returns `None` if `stop` was set before a solution was found, or if no nonce satisfies
    ///  the predicate.
    fn solve(&self, salt: &[u8], difficulty: u8, stop: &AtomicBool) -> Option<i32>;
}

/// `sha256(salt ‖ nonce)` with the nonce as i32 LE must start with at least `difficulty` zero
///  bits. The expected number of attempts is `2^difficulty`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256LeadingZeros;

impl Sha256LeadingZeros {
    fn leading_zero_bits(salt: &[u8], nonce: i32) -> u32 {
        let mut sha256 = Sha256::default();
        sha256.update(salt);
        sha256.update(nonce.to_le_bytes());
        let hash = sha256.finalize();

        let mut result = 0;
        for b in hash.iter() {
            result += b.leading_zeros();
            if *b != 0 {
                break;
            }
        }
        result
    }
}

impl ProofOfWork for Sha256LeadingZeros {
    fn verify(&self, salt: &[u8], difficulty: u8, nonce: i32) -> bool {
        Self::leading_zero_bits(salt, nonce) >= difficulty as u32
    }

    fn solve(&self, salt: &[u8], difficulty: u8, stop: &AtomicBool) -> Option<i32> {
        for (i, nonce) in (0..=i32::MAX).chain(i32::MIN..0).enumerate() {
            if i % 1024 == 0 && stop.load(Ordering::Relaxed) {
                return None;
            }
            if self.verify(salt, difficulty, nonce) {
                return Some(nonce);
            }
        }
        None
    }
}
