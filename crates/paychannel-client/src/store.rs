//! Holder of the latest co-signed channel state.

use crate::error::ChannelError;
use crate::protocol::ChannelState;
use std::sync::{PoisonError, RwLock};
use tracing::{debug, error};

/// Keeps exactly one channel state: the most recent one both parties signed
///
/// Writes are validated and replace the previous state wholesale; reads
/// hand out copies.
#[derive(Debug, Default)]
pub struct StateStore {
    state: RwLock<Option<ChannelState>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the held state with a copy of `candidate`
    ///
    /// Rejects states with unset required fields and, within one channel,
    /// states whose session does not advance.
    pub fn set(&self, candidate: &ChannelState) -> Result<(), ChannelError> {
        let missing = candidate.missing_fields();
        if !missing.is_empty() {
            error!(channel = %candidate.channel_id, ?missing, "refusing incomplete channel state");
            return Err(ChannelError::Validation(format!(
                "channel state missing {}",
                missing.join(", ")
            )));
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = state.as_ref() {
            if current.channel_id == candidate.channel_id && candidate.session <= current.session {
                error!(
                    channel = %candidate.channel_id,
                    current = current.session,
                    candidate = candidate.session,
                    "refusing channel state that does not advance the session"
                );
                return Err(ChannelError::Validation(format!(
                    "session {} does not follow {}",
                    candidate.session, current.session
                )));
            }
        }

        debug!(channel = %candidate.channel_id, session = candidate.session, "channel state stored");
        *state = Some(candidate.clone());
        Ok(())
    }

    pub fn get(&self) -> Option<ChannelState> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
