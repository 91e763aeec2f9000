//! Test doubles shared across crates (enable the `mocks` feature outside this crate).

use crate::dispatch::{Dispatch, Gateway};
use std::sync::{Mutex, MutexGuard, PoisonError};
use typerace_types::api::ServerEvent;
use typerace_types::ConnectionId;

/// Gateway that records every dispatch instead of sending it.
#[derive(Default)]
pub struct RecordingGateway {
    dispatches: Mutex<Vec<Dispatch>>,
}

impl RecordingGateway {
    fn dispatches_mut(&self) -> MutexGuard<'_, Vec<Dispatch>> {
        self.dispatches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn dispatches(&self) -> Vec<Dispatch> {
        self.dispatches_mut().clone()
    }

    /// Events that would have reached `id`, in delivery order.
    pub fn events_for(&self, id: &ConnectionId) -> Vec<ServerEvent> {
        self.dispatches_mut()
            .iter()
            .filter(|dispatch| dispatch.audience.includes(id))
            .map(|dispatch| dispatch.event.clone())
            .collect()
    }

    /// Drains everything recorded so far.
    pub fn take(&self) -> Vec<Dispatch> {
        std::mem::take(&mut *self.dispatches_mut())
    }
}

impl Gateway for RecordingGateway {
    fn deliver(&self, dispatch: &Dispatch) {
        self.dispatches_mut().push(dispatch.clone());
    }
}
