use std::sync::OnceLock;

use tracing::{info, warn};

use crate::error::{CoreError, Result};

/// This participant's server-assigned id.
///
/// Assigned exactly once after connect. A different id from the server means the
/// server wants a fresh session, which requires reconnecting with a new identity.
#[derive(Debug, Default)]
pub struct SessionIdentity {
    id: OnceLock<String>,
}

impl SessionIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the id from the `me` event. Returns false if an id was already
    /// assigned; the existing id is kept.
    pub fn assign(&self, id: impl Into<String>) -> bool {
        let id = id.into();
        match self.id.set(id) {
            Ok(()) => {
                info!(id = ?self.id.get(), "Participant id assigned");
                true
            }
            Err(rejected) => {
                if self.id.get() != Some(&rejected) {
                    warn!(
                        current = ?self.id.get(),
                        rejected = %rejected,
                        "Ignoring id reassignment (reconnect required)"
                    );
                }
                false
            }
        }
    }

    pub fn current_id(&self) -> Result<&str> {
        self.id
            .get()
            .map(String::as_str)
            .ok_or(CoreError::IdentityNotAssigned)
    }

    pub fn is_assigned(&self) -> bool {
        self.id.get().is_some()
    }
}
