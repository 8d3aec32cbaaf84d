//! Device configuration, loaded from TOML.

use crate::modem::ModemModel;
use serde_derive::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_COAP_PORT: u16 = 5683;
pub const DEFAULT_COAPS_PORT: u16 = 5684;

#[derive(Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    /// Command service address, an IPv4 literal.
    pub host: String,
    /// Defaults to 5684 with DTLS, 5683 without.
    pub port: Option<u16>,
    pub use_dtls: bool,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct DeviceSettings {
    /// Informational purpose string, at most 32 bytes.
    pub purpose: String,
    /// 16-byte pre-shared key as exactly 32 hex digits.
    pub psk_key: String,
    /// Heartbeat polling interval in seconds; 0 disables polling.
    pub polling_interval_secs: u32,
    /// Local UDP port, 0 for ephemeral.
    pub local_port: u16,
    pub sim_pin: Option<String>,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct ModemConfig {
    /// Serial device path, used by the host runner.
    pub port: String,
    pub baud_rate: u32,
    pub model: ModemModel,
    /// When set, the modem is re-provisioned (and reset) to this profile.
    pub mno_profile: Option<u8>,
    pub attach_timeout_secs: u64,
    /// Testing bypass: carry on when registration never completes.
    pub continue_without_registration: bool,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct DeviceConfig {
    pub server: ServerConfig,
    pub device: DeviceSettings,
    pub modem: ModemConfig,
}

impl Default for DeviceConfig {
    fn default() -> DeviceConfig {
        DeviceConfig {
            server: ServerConfig {
                host: "54.145.1.94".to_owned(),
                port: None,
                use_dtls: true,
            },
            device: DeviceSettings {
                purpose: "Dev-Kit".to_owned(),
                psk_key: String::new(),
                polling_interval_secs: 600,
                local_port: 0,
                sim_pin: None,
            },
            modem: ModemConfig {
                port: "/dev/ttyACM0".to_owned(),
                baud_rate: 115_200,
                model: ModemModel::Default,
                mno_profile: None,
                attach_timeout_secs: 300,
                continue_without_registration: false,
            },
        }
    }
}

impl DeviceConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> DeviceConfig {
        serdeconv::from_toml_file(path).expect("Error loading device configuration file")
    }

    /// Effective server port, falling back on the scheme default.
    pub fn server_port(&self) -> u16 {
        self.server.port.unwrap_or(if self.server.use_dtls {
            DEFAULT_COAPS_PORT
        } else {
            DEFAULT_COAP_PORT
        })
    }
}
