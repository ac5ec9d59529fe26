//! Server channel registry
//!
//! Applications listen for incoming channels by registering a callback
//! against a server channel number. The registry also owns the SCN
//! allocation bitmap so an application can obtain an unused number
//! before registering it.

use std::collections::HashMap;

use log::debug;

use crate::error::{RfcommError, RfcommResult};
use crate::types::{ChannelEventCallback, EventMask, Scn, MAX_SERVER_CHANNEL};

/// One registered listener.
pub(crate) struct Server {
    pub scn: Scn,
    pub mtu: u16,
    pub event_mask: EventMask,
    pub callback: ChannelEventCallback,
}

/// Registry of listening applications, keyed by server channel number.
#[derive(Default)]
pub(crate) struct ServerRegistry {
    servers: HashMap<Scn, Server>,
    /// Bitmap over 1..=30 covering both registered and pre-assigned
    /// server channel numbers.
    scn_pool: u32,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn pool_bit(scn: Scn) -> u32 {
        1 << scn.value()
    }

    /// Reserves an unused server channel number.
    pub fn assign(&mut self) -> RfcommResult<Scn> {
        for value in 1..=MAX_SERVER_CHANNEL {
            let scn = Scn::new(value).expect("value is in range");
            if self.scn_pool & Self::pool_bit(scn) == 0 {
                self.scn_pool |= Self::pool_bit(scn);
                return Ok(scn);
            }
        }
        Err(RfcommError::NoResources)
    }

    /// Releases a server channel number that is not registered.
    pub fn free(&mut self, scn: Scn) -> RfcommResult<()> {
        if self.servers.contains_key(&scn) {
            return Err(RfcommError::InvalidState);
        }
        self.scn_pool &= !Self::pool_bit(scn);
        Ok(())
    }

    pub fn register(
        &mut self,
        scn: Scn,
        mtu: u16,
        event_mask: EventMask,
        callback: ChannelEventCallback,
    ) -> RfcommResult<()> {
        if self.servers.contains_key(&scn) {
            return Err(RfcommError::AlreadyExists);
        }
        debug!("registering server channel {}", scn);
        self.scn_pool |= Self::pool_bit(scn);
        self.servers.insert(
            scn,
            Server {
                scn,
                mtu,
                event_mask,
                callback,
            },
        );
        Ok(())
    }

    pub fn deregister(&mut self, scn: Scn) -> RfcommResult<()> {
        if self.servers.remove(&scn).is_none() {
            return Err(RfcommError::ServerNotRegistered);
        }
        debug!("deregistered server channel {}", scn);
        self.scn_pool &= !Self::pool_bit(scn);
        Ok(())
    }

    pub fn get(&self, scn: Scn) -> Option<&Server> {
        self.servers.get(&scn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn noop_callback() -> ChannelEventCallback {
        Arc::new(Mutex::new(|_event| {}))
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = ServerRegistry::new();
        let scn = Scn::new(5).unwrap();
        registry
            .register(scn, 200, EventMask::all(), noop_callback())
            .unwrap();
        assert_eq!(registry.get(scn).unwrap().mtu, 200);

        // A second registration on the same number is refused.
        assert_eq!(
            registry.register(scn, 100, EventMask::all(), noop_callback()),
            Err(RfcommError::AlreadyExists)
        );

        registry.deregister(scn).unwrap();
        assert!(registry.get(scn).is_none());
        assert_eq!(
            registry.deregister(scn),
            Err(RfcommError::ServerNotRegistered)
        );
    }

    #[test]
    fn test_assign_skips_registered_numbers() {
        let mut registry = ServerRegistry::new();
        registry
            .register(Scn::new(1).unwrap(), 127, EventMask::all(), noop_callback())
            .unwrap();
        let assigned = registry.assign().unwrap();
        assert_eq!(assigned.value(), 2);
    }

    #[test]
    fn test_scn_space_exhaustion() {
        let mut registry = ServerRegistry::new();
        for _ in 1..=MAX_SERVER_CHANNEL {
            registry.assign().unwrap();
        }
        assert_eq!(registry.assign(), Err(RfcommError::NoResources));

        registry.free(Scn::new(7).unwrap()).unwrap();
        assert_eq!(registry.assign().unwrap().value(), 7);
    }

    #[test]
    fn test_free_refuses_registered() {
        let mut registry = ServerRegistry::new();
        let scn = Scn::new(3).unwrap();
        registry
            .register(scn, 127, EventMask::all(), noop_callback())
            .unwrap();
        assert_eq!(registry.free(scn), Err(RfcommError::InvalidState));
    }
}
