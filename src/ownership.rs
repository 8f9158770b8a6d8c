use std::collections::HashMap;
use std::sync::Mutex;

use strum_macros::Display;

/// Which subsystem currently owns a device.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display)]
pub enum Owner {
    /// An adapter holds an open handle (serial port, HID device).
    #[strum(to_string = "adapter")]
    Adapter,
    /// The network manager holds a live TCP connection.
    #[strum(to_string = "network")]
    Network,
}

/// Ledger guaranteeing at most one open handle or live connection per device.
///
/// Claims are taken before the underlying open/connect is attempted and
/// released on close, disconnect, or connection death, so a losing
/// `open`/`connect` race observes the claim and fails fast.
#[derive(Debug, Default)]
pub struct DeviceOwnership {
    claims: Mutex<HashMap<String, Owner>>,
}

impl DeviceOwnership {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `device_id` for `owner`. Returns `false` when already claimed.
    pub fn claim(&self, device_id: &str, owner: Owner) -> bool {
        let mut claims = self.claims.lock().expect("ownership lock poisoned");
        match claims.get(device_id) {
            Some(_) => false,
            None => {
                claims.insert(device_id.to_owned(), owner);
                true
            }
        }
    }

    /// Releases a claim held by `owner`. A release by a non-owner is ignored
    /// so a late disconnect cannot steal a fresh claim.
    pub fn release(&self, device_id: &str, owner: Owner) {
        let mut claims = self.claims.lock().expect("ownership lock poisoned");
        if claims.get(device_id) == Some(&owner) {
            claims.remove(device_id);
        }
    }

    #[must_use]
    pub fn is_claimed(&self, device_id: &str) -> bool {
        self.claims
            .lock()
            .expect("ownership lock poisoned")
            .contains_key(device_id)
    }

    #[must_use]
    pub fn owner(&self, device_id: &str) -> Option<Owner> {
        self.claims
            .lock()
            .expect("ownership lock poisoned")
            .get(device_id)
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn second_claim_loses() {
        let ownership = DeviceOwnership::new();
        assert!(ownership.claim("serial_com1", Owner::Adapter));
        assert!(!ownership.claim("serial_com1", Owner::Network));
        assert_eq!(Some(Owner::Adapter), ownership.owner("serial_com1"));
    }

    #[test]
    fn release_by_non_owner_is_ignored() {
        let ownership = DeviceOwnership::new();
        ownership.claim("net_10_0_0_9_9100", Owner::Network);
        ownership.release("net_10_0_0_9_9100", Owner::Adapter);
        assert!(ownership.is_claimed("net_10_0_0_9_9100"));

        ownership.release("net_10_0_0_9_9100", Owner::Network);
        assert!(!ownership.is_claimed("net_10_0_0_9_9100"));
    }
}
