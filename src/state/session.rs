use tracing::debug;

use super::store::{KeyValueStore, StoreError};

/// Session key holding the scan permission
pub const CAN_REGISTER_KEY: &str = "can_register";
const GRANTED: &str = "true";

/// Permission, granted by scanning the event code, to walk through
/// registration once. Lives in the session store only.
#[derive(Debug)]
pub struct RegistrationSession<S> {
    store: S,
}

impl<S: KeyValueStore> RegistrationSession<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn grant(&mut self) -> Result<(), StoreError> {
        debug!("registration session granted");
        self.store.set(CAN_REGISTER_KEY, GRANTED)
    }

    pub fn is_granted(&self) -> Result<bool, StoreError> {
        Ok(self.store.get(CAN_REGISTER_KEY)?.as_deref() == Some(GRANTED))
    }

    pub fn clear(&mut self) -> Result<(), StoreError> {
        debug!("registration session cleared");
        self.store.remove(CAN_REGISTER_KEY)
    }

    #[cfg(test)]
    pub fn store(&self) -> &S {
        &self.store
    }
}
