//! SIM card access: ICCID, IMSI and PIN handling.

use crate::modem::at::filter_response;
use crate::modem::{Modem, ModemCore, ModemError, ModemResult};
use flint::logging;
use std::io;
use std::time::Duration;

/// Last PIN state reported by the card (`READY`, `SIM PIN`, ...), captured
/// from the `+CPIN` URC.
pub struct SimState {
    pub last_pin: Option<String>,
}

impl SimState {
    pub fn new() -> SimState {
        SimState { last_pin: None }
    }
}

pub fn process_urc(core: &mut ModemCore, code: &str, data: &str) -> bool {
    if code != "+CPIN" {
        return false;
    }

    logging::info!(core.log, "PIN state"; "context" => "urc", "state" => data);
    core.sim.last_pin = Some(data.to_owned());
    true
}

impl<S: io::Read + io::Write> Modem<S> {
    /// SIM card serial number. Doubles as the durable device identity.
    pub fn get_iccid(&mut self) -> ModemResult<String> {
        let body = self.command_ok("AT+CCID", Duration::from_secs(1))?;
        let iccid = filter_response("+CCID: ", &body).trim().to_owned();
        if iccid.is_empty() {
            return Err(ModemError::Parse);
        }
        Ok(iccid)
    }

    pub fn get_imsi(&mut self) -> ModemResult<String> {
        let body = self.command_ok("AT+CIMI", Duration::from_secs(1))?;
        Ok(body.trim().to_owned())
    }

    /// Query the PIN state; the answer lands in `SimState` via the URC
    /// handler.
    pub fn query_pin(&mut self) -> ModemResult<Option<String>> {
        self.command_ok("AT+CPIN?", Duration::from_secs(10))?;
        Ok(self.core().sim.last_pin.clone())
    }

    pub fn verify_pin(&mut self, pin: &str) -> ModemResult<()> {
        let command = format!("AT+CPIN=\"{}\"", pin);
        self.command_ok(&command, Duration::from_secs(10))?;
        Ok(())
    }
}
