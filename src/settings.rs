/*!
# Settings Module

Persistent per-adapter configuration and the one-time logging bootstrap.

Settings live in an XML file under the platform configuration directory:
`%LOCALAPPDATA%\Isomet\iMS_SDK\connection.xml` on Windows,
`$HOME/.config/ims/connection.xml` elsewhere. Each adapter gets a
`<module Name="…">` element carrying its four timeouts in milliseconds and
whether it takes part in scans. The adjacent `logging` file holds the log
filter specification and is pre-populated with a default on first run.
*/

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::Duration;

use log::{info, warn};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::error::{Error, Result};
use crate::transport::Timeouts;

/// Per-adapter persisted settings. All timeouts in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub send_timeout: u64,
    pub recv_timeout: u64,
    pub free_timeout: u64,
    pub discover_timeout: u64,
    /// Whether `scan()` includes this adapter.
    pub scan: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            send_timeout: 500,
            recv_timeout: 5000,
            free_timeout: 30_000,
            discover_timeout: 2500,
            scan: true,
        }
    }
}

impl ConnectionConfig {
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            send: Duration::from_millis(self.send_timeout),
            rx: Duration::from_millis(self.recv_timeout),
            auto_free: Duration::from_millis(self.free_timeout),
            discover: Duration::from_millis(self.discover_timeout),
        }
    }

    pub fn from_timeouts(timeouts: Timeouts, scan: bool) -> ConnectionConfig {
        ConnectionConfig {
            send_timeout: timeouts.send.as_millis() as u64,
            recv_timeout: timeouts.rx.as_millis() as u64,
            free_timeout: timeouts.auto_free.as_millis() as u64,
            discover_timeout: timeouts.discover.as_millis() as u64,
            scan,
        }
    }
}

/// Directory holding the settings and logging files, created on demand.
pub fn settings_dir() -> PathBuf {
    let mut dir = if cfg!(windows) {
        dirs_next::data_local_dir().unwrap_or_else(std::env::temp_dir)
    } else {
        dirs_next::config_dir().unwrap_or_else(std::env::temp_dir)
    };
    if cfg!(windows) {
        dir.push("Isomet");
        dir.push("iMS_SDK");
    } else {
        dir.push("ims");
    }
    if let Err(e) = fs::create_dir_all(&dir) {
        warn!("could not create settings directory {}: {e}", dir.display());
    }
    dir
}

pub fn settings_path() -> PathBuf {
    settings_dir().join("connection.xml")
}

const DEFAULT_LOG_FILTER: &str = "info";

static LOGGING_INIT: Once = Once::new();

/// One-time logging sink configuration.
///
/// Reads the filter specification from the `logging` file next to the
/// connection settings, writing a default file on first run. Safe to call
/// any number of times; only the first call in a process does anything.
pub fn init_logging() {
    LOGGING_INIT.call_once(|| {
        let path = settings_dir().join("logging");
        let filter = match fs::read_to_string(&path) {
            Ok(text) => text.trim().to_string(),
            Err(_) => {
                let _ = fs::write(&path, format!("{DEFAULT_LOG_FILTER}\n"));
                DEFAULT_LOG_FILTER.to_string()
            }
        };
        let _ = env_logger::Builder::new()
            .parse_filters(&filter)
            .try_init();
    });
}

/// Loads per-adapter settings from `path`. A missing file yields an empty
/// map; a malformed file is an error.
pub fn load_settings(path: &Path) -> Result<HashMap<String, ConnectionConfig>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(Error::Io(e)),
    };

    let mut reader = Reader::from_str(&content);
    let mut map = HashMap::new();
    let mut module_name: Option<String> = None;
    let mut config = ConnectionConfig::default();
    let mut field: Option<Vec<u8>> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"module" => {
                    let mut name = String::new();
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"Name" {
                            name = String::from_utf8_lossy(&attr.value).into_owned();
                        }
                    }
                    module_name = Some(name);
                    config = ConnectionConfig::default();
                }
                tag @ (b"send_timeout" | b"recv_timeout" | b"free_timeout"
                | b"discover_timeout" | b"scan") => {
                    field = Some(tag.to_vec());
                }
                _ => {}
            },
            Ok(Event::Text(t)) => {
                if let Some(tag) = &field {
                    let text = t
                        .unescape()
                        .map_err(|e| Error::Settings(e.to_string()))?
                        .trim()
                        .to_string();
                    match tag.as_slice() {
                        b"send_timeout" => {
                            config.send_timeout = text.parse().unwrap_or(config.send_timeout)
                        }
                        b"recv_timeout" => {
                            config.recv_timeout = text.parse().unwrap_or(config.recv_timeout)
                        }
                        b"free_timeout" => {
                            config.free_timeout = text.parse().unwrap_or(config.free_timeout)
                        }
                        b"discover_timeout" => {
                            config.discover_timeout =
                                text.parse().unwrap_or(config.discover_timeout)
                        }
                        b"scan" => {
                            config.scan = matches!(text.as_str(), "1" | "true" | "True")
                        }
                        _ => {}
                    }
                }
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"module" => {
                    if let Some(name) = module_name.take() {
                        if !name.is_empty() {
                            map.insert(name, config);
                        }
                    }
                }
                _ => field = None,
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(Error::Settings(e.to_string())),
            _ => {}
        }
    }
    Ok(map)
}

fn emit(writer: &mut Writer<Vec<u8>>, event: Event) -> Result<()> {
    writer
        .write_event(event)
        .map_err(|e| Error::Settings(e.to_string()))
}

/// Writes per-adapter settings to `path`, replacing any previous file.
pub fn save_settings(path: &Path, configs: &HashMap<String, ConnectionConfig>) -> Result<()> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    emit(&mut writer, Event::Start(BytesStart::new("connection")))?;
    emit(&mut writer, Event::Start(BytesStart::new("modules")))?;

    let mut names: Vec<_> = configs.keys().collect();
    names.sort();
    for name in names {
        let config = &configs[name];
        let mut module = BytesStart::new("module");
        module.push_attribute(("Name", name.as_str()));
        emit(&mut writer, Event::Start(module))?;

        let fields: [(&str, String); 5] = [
            ("send_timeout", config.send_timeout.to_string()),
            ("recv_timeout", config.recv_timeout.to_string()),
            ("free_timeout", config.free_timeout.to_string()),
            ("discover_timeout", config.discover_timeout.to_string()),
            ("scan", (config.scan as u8).to_string()),
        ];
        for (tag, value) in fields {
            emit(&mut writer, Event::Start(BytesStart::new(tag)))?;
            emit(&mut writer, Event::Text(BytesText::new(&value)))?;
            emit(&mut writer, Event::End(BytesEnd::new(tag)))?;
        }

        emit(&mut writer, Event::End(BytesEnd::new("module")))?;
    }

    emit(&mut writer, Event::End(BytesEnd::new("modules")))?;
    emit(&mut writer, Event::End(BytesEnd::new("connection")))?;

    fs::write(path, writer.into_inner())?;
    info!("connection settings written to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("ims-settings-test-{}-{name}", std::process::id()));
        path
    }

    #[test]
    fn settings_round_trip() {
        let path = temp_file("roundtrip.xml");
        let mut configs = HashMap::new();
        configs.insert(
            "CM_ETH".to_string(),
            ConnectionConfig {
                send_timeout: 750,
                recv_timeout: 12_000,
                free_timeout: 45_000,
                discover_timeout: 1500,
                scan: true,
            },
        );
        configs.insert(
            "CM_USBLITE".to_string(),
            ConnectionConfig {
                scan: false,
                ..ConnectionConfig::default()
            },
        );

        save_settings(&path, &configs).unwrap();
        let loaded = load_settings(&path).unwrap();
        assert_eq!(loaded, configs);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn missing_file_loads_empty() {
        let path = temp_file("missing.xml");
        let loaded = load_settings(&path).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let path = temp_file("broken.xml");
        fs::write(&path, "<connection><modules>").unwrap();
        // truncated documents surface as a settings error, not a panic
        let result = load_settings(&path);
        let _ = fs::remove_file(&path);
        assert!(result.is_err() || result.unwrap().is_empty());
    }

    #[test]
    fn unknown_fields_keep_defaults() {
        let path = temp_file("partial.xml");
        fs::write(
            &path,
            "<connection><modules><module Name=\"CM_ETH\">\
             <send_timeout>250</send_timeout>\
             </module></modules></connection>",
        )
        .unwrap();
        let loaded = load_settings(&path).unwrap();
        let config = loaded.get("CM_ETH").unwrap();
        assert_eq!(config.send_timeout, 250);
        assert_eq!(config.recv_timeout, ConnectionConfig::default().recv_timeout);
        assert!(config.scan);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn config_converts_to_engine_timeouts() {
        let config = ConnectionConfig::default();
        let timeouts = config.timeouts();
        assert_eq!(timeouts.send, Duration::from_millis(500));
        assert_eq!(timeouts.rx, Duration::from_millis(5000));
        assert_eq!(
            ConnectionConfig::from_timeouts(timeouts, true),
            config
        );
    }
}
