//! Cooperative cancellation shared by downloads and remote execution.
//!
//! Long-running operations sample the token at defined points (after each
//! streamed chunk, after each decoded file, on every poll tick while waiting
//! for a remote command) instead of being interrupted preemptively.

use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Marker returned once cancellation has been observed.
#[derive(Clone, Copy, Debug, Default, Error, Eq, PartialEq)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Cheap-to-clone cancellation handle passed through every call boundary.
#[derive(Clone, Debug, Default)]
pub struct CancellationSampler {
    token: CancellationToken,
}

impl CancellationSampler {
    /// Creates a sampler that is not yet cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing token, for hosts that already manage one.
    #[must_use]
    pub const fn from_token(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Requests cancellation. Every clone observes the request.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns `true` once cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fails with [`Cancelled`] when cancellation has been requested.
    ///
    /// # Errors
    ///
    /// Returns [`Cancelled`] if [`CancellationSampler::cancel`] was called on
    /// this sampler or any of its clones.
    pub fn throw_if_cancelled(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            return Err(Cancelled);
        }
        Ok(())
    }

    /// Returns the underlying token so callers can await cancellation.
    #[must_use]
    pub const fn token(&self) -> &CancellationToken {
        &self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_sampler_is_not_cancelled() {
        let sampler = CancellationSampler::new();
        assert!(!sampler.is_cancelled());
        assert_eq!(sampler.throw_if_cancelled(), Ok(()));
    }

    #[test]
    fn cancellation_is_visible_through_clones() {
        let sampler = CancellationSampler::new();
        let observer = sampler.clone();
        sampler.cancel();

        assert!(observer.is_cancelled());
        assert_eq!(observer.throw_if_cancelled(), Err(Cancelled));
    }

    #[test]
    fn wraps_external_token() {
        let token = CancellationToken::new();
        let sampler = CancellationSampler::from_token(token.clone());
        token.cancel();
        assert!(sampler.is_cancelled());
    }
}
