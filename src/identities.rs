use std::collections::{HashMap, HashSet};

use russh::keys::{HashAlg, PublicKey};
use tracing::{info, warn};

use crate::config::Config;

/// The canonical SHA-256 fingerprint of a public key, e.g. `SHA256:...`.
pub fn fingerprint(key: &PublicKey) -> String {
    key.fingerprint(HashAlg::Sha256).to_string()
}

/// The set of identities which may be used for either per-device or global
/// authentication.
///
/// Immutable after construction: two lookup tables plus a reverse index from
/// fingerprint back to friendly name for logs.
#[derive(Debug, Default)]
pub struct Identities {
    /// Devices which only allow specific identities, by fingerprint.
    per_device: HashMap<String, HashSet<String>>,

    /// Fingerprints allowed on any device without an explicit identity list.
    global: HashSet<String>,

    /// Maps fingerprint back to friendly name for logs.
    to_name: HashMap<String, String>,
}

impl Identities {
    /// Build the identity store from configuration.
    ///
    /// Every configured identity lands in the global allow-set; devices with
    /// a non-empty identity list additionally get a per-device allow-set
    /// containing exactly those identities. The configuration parser has
    /// already verified that every listed name exists.
    pub fn new(config: &Config) -> Self {
        let mut ids = Self::default();

        // Configure global identities which can access all devices unless
        // device-specific identities are configured.
        let mut known = HashMap::new();
        for identity in &config.identities {
            let f = fingerprint(&identity.public_key);
            info!("added identity {:?}: {f}", identity.name);

            known.insert(identity.name.clone(), f.clone());
            ids.global.insert(f.clone());
            ids.to_name.insert(f, identity.name.clone());
        }

        for device in &config.devices {
            if device.identities.is_empty() {
                // Let the user know that any configured identity will be able
                // to access this device.
                warn!("all identities allowed for device {:?}", device.name);
                continue;
            }

            let allowed = ids.per_device.entry(device.name.clone()).or_default();

            for name in &device.identities {
                // Parsing validated the references, so any unknown identity
                // here is a clear programming error.
                let f = known
                    .get(name)
                    .expect("validated configuration references a known identity");

                // This device will only accept authentication for a specific
                // set of identities.
                info!("identity {name:?} configured for device {:?}", device.name);
                allowed.insert(f.clone());
            }
        }

        ids
    }

    /// Determine if the user and public key combination may authenticate
    /// against the user's device. On success the friendly name of the
    /// identity is returned for logging.
    ///
    /// The user string is the SSH user name, which by contract equals a
    /// device friendly name. A user with no per-device allow-set falls back
    /// to the global set; session dispatch rejects unknown device names
    /// later.
    pub fn authenticate(&self, user: &str, key: &PublicKey) -> Option<&str> {
        let f = fingerprint(key);

        let allowed = match self.per_device.get(user) {
            // This device only allows specific identities.
            Some(per_device) => per_device.contains(&f),
            // All identities are permitted.
            None => self.global.contains(&f),
        };

        if !allowed {
            return None;
        }

        self.to_name.get(&f).map(String::as_str)
    }
}
