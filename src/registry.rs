use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use crate::device::MuxDevice;

/// The mapping from friendly device name to muxed device.
///
/// Built at startup and immutable thereafter. Lookup is by SSH user name; a
/// miss is the sole signal for an unknown connection. The registry owns the
/// devices for the lifetime of the process.
pub struct DeviceRegistry {
    devices: HashMap<String, Arc<MuxDevice>>,
}

impl DeviceRegistry {
    /// Create a registry over the given devices.
    pub fn new(devices: HashMap<String, Arc<MuxDevice>>) -> Self {
        Self { devices }
    }

    /// Look up a device by SSH user name.
    pub fn get(&self, name: &str) -> Option<Arc<MuxDevice>> {
        self.devices.get(name).cloned()
    }

    /// Iterate over all devices and their names.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<MuxDevice>)> {
        self.devices.iter().map(|(name, dev)| (name.as_str(), dev))
    }

    /// Close every device, returning the first error encountered.
    pub async fn close(&self) -> io::Result<()> {
        let mut result = Ok(());
        for device in self.devices.values() {
            let closed = device.close().await;
            if result.is_ok() {
                result = closed;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::mock::MockDevice;

    #[tokio::test]
    async fn lookup_by_user_name() {
        let (device, _handle) = MockDevice::new("test");
        let registry = DeviceRegistry::new(HashMap::from([(
            "test".to_string(),
            Arc::new(MuxDevice::new(device as Arc<dyn Device>)),
        )]));

        assert!(registry.get("test").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.iter().count(), 1);
    }
}
