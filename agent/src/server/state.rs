//! Shared state for callback handlers.

use std::sync::Arc;

use crate::auth::Authorizer;
use crate::io::coordinator::Coordinator;

#[derive(Clone)]
pub struct CallbackState {
    pub authorizer: Authorizer,
    /// Where job reports are forwarded.
    pub coordinator: Arc<dyn Coordinator>,
}

impl CallbackState {
    pub fn new(authorizer: Authorizer, coordinator: Arc<dyn Coordinator>) -> Self {
        Self {
            authorizer,
            coordinator,
        }
    }
}
