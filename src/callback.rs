//! Application callback slots.
//!
//! Two distinct, strongly-typed function slots, one per extension point the
//! device core exposes — no untyped pointer or payload ever enters the
//! picture.

use crate::bd::BdHandle;
use crate::Error;

/// Called from within SET_CONFIGURATION dispatch, with the requested
/// configuration index (0 = deconfigure). Returns whether the application
/// accepted it.
pub type ConfigCallback = fn(index: u8) -> Result<(), Error>;

/// Called for every non-EP0 transaction completion while the device is
/// Configured, with the handle that completed.
pub type TransactionCallback = fn(handle: BdHandle);

/// Holds the (at most one, each) registered callback per slot.
#[derive(Default)]
pub struct Callbacks {
    config: Option<ConfigCallback>,
    transaction: Option<TransactionCallback>,
}

impl Callbacks {
    pub const fn new() -> Self {
        Self {
            config: None,
            transaction: None,
        }
    }

    pub fn set_config(&mut self, callback: ConfigCallback) {
        self.config = Some(callback);
    }

    pub fn set_transaction(&mut self, callback: TransactionCallback) {
        self.transaction = Some(callback);
    }

    pub fn config(&self) -> Option<ConfigCallback> {
        self.config
    }

    pub fn transaction(&self) -> Option<TransactionCallback> {
        self.transaction
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept_config(_index: u8) -> Result<(), Error> {
        Ok(())
    }

    fn reject_config(_index: u8) -> Result<(), Error> {
        Err(Error::Error)
    }

    #[test]
    fn reregistering_a_slot_overwrites_it() {
        let mut callbacks = Callbacks::new();
        assert!(callbacks.config().is_none());
        callbacks.set_config(accept_config);
        assert_eq!((callbacks.config().unwrap())(1), Ok(()));
        callbacks.set_config(reject_config);
        assert!((callbacks.config().unwrap())(1).is_err());
    }
}
