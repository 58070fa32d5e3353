use std::collections::HashMap;
use std::io;
use std::path::Path;

use tracing::info;

use crate::config::DeviceConfig;
use crate::error::Error;

/// Filesystem hook: expand a glob pattern such as `/dev/ttyUSB*`.
pub type GlobFn = Box<dyn Fn(&str) -> io::Result<Vec<String>> + Send + Sync>;

/// Filesystem hook: read a file to a string.
pub type ReadFileFn = Box<dyn Fn(&str) -> io::Result<String> + Send + Sync>;

/// Candidate TTY globs and the sysfs location of their USB serial number
/// attribute, relative to `/sys/class/tty/<name>/device/`.
const TTY_PATTERNS: &[(&str, &str)] = &[
    ("/dev/ttyUSB*", "../../serial"),
    ("/dev/ttyACM*", "../serial"),
];

/// Resolves configured device entries to OS device paths.
///
/// Enumeration happens once at construction and is cached as a serial-number
/// to path map; devices plugged in later require a restart.
pub struct Resolver {
    serial_to_path: HashMap<String, String>,
}

impl Resolver {
    /// Enumerate the real filesystem.
    pub fn new() -> io::Result<Self> {
        Self::with_hooks(Box::new(real_glob), Box::new(real_read_file))
    }

    /// Enumerate through the given filesystem hooks.
    pub fn with_hooks(glob: GlobFn, read_file: ReadFileFn) -> io::Result<Self> {
        let mut serial_to_path = HashMap::new();

        for (pattern, serial_attr) in TTY_PATTERNS {
            for path in glob(pattern)? {
                let base = Path::new(&path)
                    .file_name()
                    .and_then(|name| name.to_str())
                    .unwrap_or(&path)
                    .to_string();

                // The relative segments must survive into the sysfs path, so
                // plain concatenation rather than path joining.
                let attr = format!("/sys/class/tty/{base}/device/{serial_attr}");

                let serial = match read_file(&attr) {
                    Ok(contents) => contents.trim().to_string(),
                    // This TTY has no serial number attribute; skip it.
                    Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                    Err(err) => return Err(err),
                };

                info!("found device: path: {path:?}, serial: {serial:?}");
                serial_to_path.insert(serial, path);
            }
        }

        Ok(Self { serial_to_path })
    }

    /// Resolve a device entry to the OS path to open.
    ///
    /// An explicit path wins; otherwise the entry's USB serial number is
    /// looked up among the enumerated TTYs.
    pub fn resolve(&self, config: &DeviceConfig) -> Result<String, Error> {
        if config.serial.is_empty() {
            return Ok(config.device.clone());
        }

        self.serial_to_path
            .get(&config.serial)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound {
                serial: config.serial.clone(),
            })
    }
}

/// Expand a `prefix*` pattern against the real filesystem.
fn real_glob(pattern: &str) -> io::Result<Vec<String>> {
    let prefix = pattern.trim_end_matches('*');
    let path = Path::new(prefix);

    let (dir, name_prefix) = match (path.parent(), path.file_name()) {
        (Some(dir), Some(name)) => (dir, name.to_string_lossy().into_owned()),
        _ => return Ok(Vec::new()),
    };

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let mut matches = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(&name_prefix) {
            matches.push(entry.path().to_string_lossy().into_owned());
        }
    }

    matches.sort();
    Ok(matches)
}

fn real_read_file(path: &str) -> io::Result<String> {
    std::fs::read_to_string(path)
}
