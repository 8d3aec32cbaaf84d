//! Modem access: the AT engine plus the typed services layered on top of it
//! (sockets, network registration, SIM, device information, GNSS).
//!
//! `Modem` owns the engine and a `ModemCore` holding all service state. URC
//! handlers registered with the engine receive the core as their context, so
//! asynchronous modem events update service state without any shared mutable
//! aliasing. The typed command wrappers live in the service modules as extra
//! `impl Modem` blocks.

pub mod at;
pub mod gnss;
pub mod info;
pub mod network;
pub mod pdn;
pub mod sim;
pub mod socket;

use crate::modem::at::{AtEngine, AtError, AtResult, ResultCode};
use flint::logging::{self, Logger};
use serde_derive::{Deserialize, Serialize};
use std::io;
use std::time::{Duration, Instant};

const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");
const HOST_DEVICE_ID: &str = "Twilio-Alfa";
const HOST_DEVICE_ID_SHORT: &str = "alfa";
const BOARD_NAME: &str = "WioLTE-Cat-NB1";

/// Firmware variants that need specific workarounds. Selected explicitly by
/// configuration, never sniffed from version strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModemModel {
    Default,
    /// Rejects +USOLI on freshly-opened UDP sockets; the listen step is
    /// skipped while receive routing stays in place.
    UdpListenQuirk,
}

impl Default for ModemModel {
    fn default() -> ModemModel {
        ModemModel::Default
    }
}

#[derive(Debug, PartialEq)]
pub enum ModemError {
    At(AtError),
    /// The modem concluded the command with a non-OK final result code.
    Command(ResultCode),
    /// The response did not have the expected shape.
    Parse,
}

impl From<AtError> for ModemError {
    fn from(err: AtError) -> Self {
        ModemError::At(err)
    }
}

pub type ModemResult<T> = Result<T, ModemError>;

/// State shared between the typed services and the URC handlers. Passed as
/// the context to every engine spin.
pub struct ModemCore {
    pub sockets: socket::SocketTable,
    pub network: network::NetworkState,
    pub sim: sim::SimState,
    pub log: Logger,
}

pub struct Modem<S> {
    at: AtEngine<S, ModemCore>,
    core: ModemCore,
    model: ModemModel,
    host_device_information: String,
    short_host_device_information: String,
    log: Logger,
}

impl<S: io::Read + io::Write> Modem<S> {
    pub fn new(serial: S, model: ModemModel, log: &Logger) -> Modem<S> {
        let log = log.new(logging::o!());
        let mut at = AtEngine::new(serial, &log);

        at.register_urc_handler("socket", socket::process_urc);
        at.register_urc_handler("network", network::process_urc);
        at.register_urc_handler("sim", sim::process_urc);

        Modem {
            core: ModemCore {
                sockets: socket::SocketTable::new(),
                network: network::NetworkState::new(),
                sim: sim::SimState::new(),
                log: log.new(logging::o!()),
            },
            at,
            model,
            host_device_information: String::new(),
            short_host_device_information: String::new(),
            log,
        }
    }

    #[inline]
    pub fn model(&self) -> ModemModel {
        self.model
    }

    #[inline]
    pub fn core(&self) -> &ModemCore {
        &self.core
    }

    #[inline]
    pub fn core_mut(&mut self) -> &mut ModemCore {
        &mut self.core
    }

    #[inline]
    pub fn engine(&mut self) -> &mut AtEngine<S, ModemCore> {
        &mut self.at
    }

    #[inline]
    pub fn serial_mut(&mut self) -> &mut S {
        self.at.serial_mut()
    }

    /// Drain modem output and dispatch pending URCs. Call regularly.
    pub fn spin(&mut self) {
        self.at.spin(&mut self.core);
    }

    /// Run one AT command to completion.
    pub fn command(&mut self, command: &str, timeout: Duration) -> AtResult<(ResultCode, String)> {
        self.at.do_command(&mut self.core, command, timeout)
    }

    /// Run one AT command and return its response body, treating any final
    /// result code other than OK as an error.
    pub fn command_ok(&mut self, command: &str, timeout: Duration) -> ModemResult<String> {
        match self.command(command, timeout)? {
            (ResultCode::Ok, body) => Ok(body),
            (code, _) => Err(ModemError::Command(code)),
        }
    }

    /// Probe the AT interface.
    pub fn is_powered(&mut self) -> bool {
        matches!(self.command("AT", Duration::from_secs(1)), Ok((ResultCode::Ok, _)))
    }

    /// Wait for the AT interface to come up. Might take several seconds after
    /// a cold boot.
    pub fn power_on(&mut self) -> bool {
        for _ in 0..10 {
            if self.is_powered() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(200));
        }
        false
    }

    pub fn power_off(&mut self) -> bool {
        self.command_ok("AT+CPWROFF", Duration::from_secs(40)).is_ok()
    }

    /// Put the terminal into the state the rest of the stack relies on:
    /// verbose text result codes, echo off, verbose CME errors, standard
    /// line terminators, GSM character set and ASCII-hex socket payloads.
    pub fn init(&mut self, mno_profile: Option<u8>) -> ModemResult<()> {
        if self.command_ok("ATV1", Duration::from_secs(1)).is_err() {
            logging::warn!(self.log, "potential error enabling verbose result codes";
                           "context" => "init");
        }
        self.command_ok("ATQ0", Duration::from_secs(1))?;
        self.command_ok("ATE0", Duration::from_secs(1))?;
        self.command_ok("AT+CMEE=2", Duration::from_secs(1))?;
        if self.command_ok("ATS3=13", Duration::from_secs(1)).is_err() {
            logging::warn!(self.log, "potential error setting command terminator";
                           "context" => "init");
        }
        if self.command_ok("ATS4=10", Duration::from_secs(1)).is_err() {
            logging::warn!(self.log, "potential error setting response separator";
                           "context" => "init");
        }
        self.command_ok("AT+CSCS=\"GSM\"", Duration::from_secs(1))?;
        self.command_ok("AT+UDCONF=1,1", Duration::from_secs(1))?;

        if let Some(profile) = mno_profile {
            self.provision_mno_profile(profile)?;
        }

        self.command_ok("AT+CREG=2", Duration::from_secs(1))?;
        self.command_ok("AT+CGREG=2", Duration::from_secs(1))?;
        self.command_ok("AT+CEREG=2", Duration::from_secs(1))?;

        // Answer lands in the SIM state via the +CPIN URC.
        let _ = self.command("AT+CPIN?", Duration::from_secs(5))?;

        Ok(())
    }

    /// Switch the MNO profile when it differs from the requested one. The
    /// modem must be reset for the change to take effect.
    fn provision_mno_profile(&mut self, profile: u8) -> ModemResult<()> {
        let current = self.get_mno_profile()?;
        if current == profile {
            return Ok(());
        }

        logging::info!(self.log, "re-provisioning MNO profile, modem will reset";
                       "context" => "init",
                       "current" => current,
                       "requested" => profile);

        self.set_mno_profile(profile)?;
        self.set_modem_functionality(15, false)?;

        if !self.power_on() {
            return Err(ModemError::At(AtError::Timeout));
        }

        self.command_ok("AT+CEREG=2", Duration::from_secs(1))?;
        Ok(())
    }

    /// Block until EPS registration reaches home or roaming, or the timeout
    /// passes. Returns whether the modem is registered.
    pub fn wait_for_registration(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let _ = self.refresh_eps_registration();

        let mut since_refresh = 0u32;
        loop {
            if self.core.network.cereg.is_registered() {
                return true;
            }
            if Instant::now() >= deadline {
                logging::warn!(self.log, "network registration timed out";
                               "context" => "wait_for_registration",
                               "status" => ?self.core.network.cereg);
                return false;
            }

            self.spin();
            std::thread::sleep(Duration::from_millis(100));

            since_refresh += 1;
            if since_refresh >= 50 {
                since_refresh = 0;
                let _ = self.refresh_eps_registration();
            }
        }
    }

    /// Compute and cache both host-device-information strings, then register
    /// them with the network. Registration attempts often fail right after
    /// attach, so this retries a few times.
    pub fn set_host_device_information(&mut self, purpose: &str) -> ModemResult<()> {
        self.compute_host_device_information(purpose)?;

        let command = format!("AT+UHOSTDEV={}", self.host_device_information);
        logging::info!(self.log, "registering host device information";
                       "context" => "set_host_device_information",
                       "info" => %self.host_device_information);

        for attempt in 0..10 {
            if self.command_ok(&command, Duration::from_secs(1)).is_ok() {
                return Ok(());
            }
            logging::info!(self.log, "host device registration failed, will retry";
                           "context" => "set_host_device_information",
                           "attempt" => attempt);
            std::thread::sleep(Duration::from_secs(7));
        }

        Err(ModemError::Command(ResultCode::Error))
    }

    fn compute_host_device_information(&mut self, purpose: &str) -> ModemResult<()> {
        let manufacturer = self.get_manufacturer()?;
        let model = self.get_model()?;
        let version = self.get_version()?;

        self.host_device_information = format!(
            "\"{}_{}\",\"Twilio_{}\",\"{}_{}\",\"twilio-v{}_{}-v{}\"",
            HOST_DEVICE_ID, purpose, manufacturer, BOARD_NAME, model, SDK_VERSION, manufacturer, version
        );
        self.short_host_device_information = format!("v{}/{}", SDK_VERSION, HOST_DEVICE_ID_SHORT);

        Ok(())
    }

    pub fn host_device_information(&self) -> &str {
        &self.host_device_information
    }

    pub fn short_host_device_information(&self) -> &str {
        &self.short_host_device_information
    }
}
