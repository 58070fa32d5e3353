use prometheus::{IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry};

use crate::error::Error;

/// Prometheus metrics for a consrv server.
///
/// All families are registered on one [`Registry`], exported by the optional
/// debug HTTP listener. The vectors are cheap handles onto shared state and
/// may be cloned freely into devices and sessions.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    device_info: IntGaugeVec,
    device_authentications: IntCounterVec,
    device_sessions: IntGaugeVec,
    device_unknown_sessions: IntCounter,
    device_read_bytes: IntCounterVec,
    device_write_bytes: IntCounterVec,
}

impl Metrics {
    /// Create and register all metric families.
    pub fn new() -> Result<Self, Error> {
        let registry = Registry::new();

        let device_info = IntGaugeVec::new(
            Opts::new(
                "consrv_device_info",
                "Information metrics about each configured serial console device.",
            ),
            &["name", "device", "serial", "baud"],
        )?;

        let device_authentications = IntCounterVec::new(
            Opts::new(
                "consrv_device_authentications_total",
                "The total number of accepted and rejected SSH sessions for a serial console device.",
            ),
            &["result"],
        )?;

        let device_sessions = IntGaugeVec::new(
            Opts::new(
                "consrv_device_sessions",
                "The number of active SSH sessions connected to a serial console device.",
            ),
            &["name"],
        )?;

        let device_unknown_sessions = IntCounter::new(
            "consrv_device_unknown_sessions_total",
            "The total number of SSH sessions which attempted to open a non-existent device.",
        )?;

        let device_read_bytes = IntCounterVec::new(
            Opts::new(
                "consrv_device_read_bytes_total",
                "The total number of bytes read from a serial device.",
            ),
            &["name"],
        )?;

        let device_write_bytes = IntCounterVec::new(
            Opts::new(
                "consrv_device_write_bytes_total",
                "The total number of bytes written to a serial device.",
            ),
            &["name"],
        )?;

        registry.register(Box::new(device_info.clone()))?;
        registry.register(Box::new(device_authentications.clone()))?;
        registry.register(Box::new(device_sessions.clone()))?;
        registry.register(Box::new(device_unknown_sessions.clone()))?;
        registry.register(Box::new(device_read_bytes.clone()))?;
        registry.register(Box::new(device_write_bytes.clone()))?;

        Ok(Self {
            registry,
            device_info,
            device_authentications,
            device_sessions,
            device_unknown_sessions,
            device_read_bytes,
            device_write_bytes,
        })
    }

    /// The registry all families are registered on.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record one configured device.
    pub fn device_info(&self, name: &str, device: &str, serial: &str, baud: u32) {
        self.device_info
            .with_label_values(&[name, device, serial, &baud.to_string()])
            .set(1);
    }

    /// Record an authentication attempt by outcome (`accepted` or
    /// `rejected`).
    pub fn authentication(&self, result: &str) {
        self.device_authentications
            .with_label_values(&[result])
            .inc();
    }

    /// Record a session for a user with no matching device.
    pub fn unknown_session(&self) {
        self.device_unknown_sessions.inc();
    }

    /// Record an opened session; the gauge is decremented again when the
    /// returned guard drops.
    #[must_use]
    pub fn session_opened(&self, name: &str) -> SessionGuard {
        let gauge = self.device_sessions.clone();
        gauge.with_label_values(&[name]).inc();

        SessionGuard {
            gauge,
            name: name.to_string(),
        }
    }

    /// The per-device read byte counter, keyed by friendly name.
    pub fn read_bytes(&self) -> IntCounterVec {
        self.device_read_bytes.clone()
    }

    /// The per-device write byte counter, keyed by friendly name.
    pub fn write_bytes(&self) -> IntCounterVec {
        self.device_write_bytes.clone()
    }
}

/// Decrements the active-session gauge for a device on drop.
pub struct SessionGuard {
    gauge: IntGaugeVec,
    name: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.gauge.with_label_values(&[&self.name]).dec();
    }
}
