//! Network registration and radio management: `+CFUN`, `+CREG`, `+CGREG`,
//! `+CEREG`, `+COPS`, `+CSQ`, `+UMNOPROF`.
//!
//! The registration caches are refreshed by the URC handler, so read commands
//! only need to trigger the modem; the answer lands in `NetworkState` whether
//! it arrives as a URC or as a command response.

use crate::modem::at::filter_response;
use crate::modem::{Modem, ModemCore, ModemError, ModemResult};
use flint::logging;
use std::io;
use std::time::Duration;

/// EPS attach status reported by `+CEREG`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStatus {
    NotRegistered,
    RegisteredHome,
    Searching,
    RegistrationDenied,
    Unknown,
    RegisteredRoaming,
    RegisteredSmsOnlyHome,
    RegisteredSmsOnlyRoaming,
}

impl RegistrationStatus {
    pub fn from_stat(stat: u8) -> RegistrationStatus {
        match stat {
            0 => RegistrationStatus::NotRegistered,
            1 => RegistrationStatus::RegisteredHome,
            2 => RegistrationStatus::Searching,
            3 => RegistrationStatus::RegistrationDenied,
            5 => RegistrationStatus::RegisteredRoaming,
            6 => RegistrationStatus::RegisteredSmsOnlyHome,
            7 => RegistrationStatus::RegisteredSmsOnlyRoaming,
            _ => RegistrationStatus::Unknown,
        }
    }

    /// True for home or roaming registration, the states that admit traffic.
    #[inline]
    pub fn is_registered(self) -> bool {
        matches!(
            self,
            RegistrationStatus::RegisteredHome | RegistrationStatus::RegisteredRoaming
        )
    }
}

/// Last-known registration states, refreshed by URC.
pub struct NetworkState {
    pub creg: RegistrationStatus,
    pub cgreg: RegistrationStatus,
    pub cereg: RegistrationStatus,
}

impl NetworkState {
    pub fn new() -> NetworkState {
        NetworkState {
            creg: RegistrationStatus::NotRegistered,
            cgreg: RegistrationStatus::NotRegistered,
            cereg: RegistrationStatus::NotRegistered,
        }
    }
}

/// Extract the `<stat>` field from either the URC form (`<stat>[,...]`) or
/// the read form (`<n>,<stat>[,...]`). In the read form the second field is
/// numeric; in the URC form it is a quoted location area.
fn parse_stat(data: &str) -> Option<u8> {
    let fields: Vec<&str> = data.split(',').map(|field| field.trim()).collect();

    match fields.as_slice() {
        [] => None,
        [stat] => stat.parse().ok(),
        [first, second, ..] => {
            if second.starts_with('"') {
                first.parse().ok()
            } else {
                second.parse().ok()
            }
        }
    }
}

pub fn process_urc(core: &mut ModemCore, code: &str, data: &str) -> bool {
    let stat = match parse_stat(data) {
        Some(stat) => RegistrationStatus::from_stat(stat),
        None => {
            if matches!(code, "+CREG" | "+CGREG" | "+CEREG") {
                logging::error!(core.log, "bad registration status";
                                "context" => "urc",
                                "code" => code,
                                "data" => data);
                return true;
            }
            return false;
        }
    };

    match code {
        "+CREG" => core.network.creg = stat,
        "+CGREG" => core.network.cgreg = stat,
        "+CEREG" => {
            logging::info!(core.log, "EPS registration change";
                           "context" => "urc",
                           "status" => ?stat);
            core.network.cereg = stat;
        }
        _ => return false,
    }

    true
}

impl<S: io::Read + io::Write> Modem<S> {
    /// Trigger a `+CEREG` read. The answer is consumed by the URC handler,
    /// so the refreshed value is read back from the cache.
    pub fn refresh_eps_registration(&mut self) -> ModemResult<RegistrationStatus> {
        self.command_ok("AT+CEREG?", Duration::from_secs(1))?;
        Ok(self.core().network.cereg)
    }

    pub fn get_modem_functionality(&mut self) -> ModemResult<u8> {
        let body = self.command_ok("AT+CFUN?", Duration::from_secs(15))?;
        filter_response("+CFUN: ", &body)
            .split(',')
            .next()
            .and_then(|field| field.trim().parse().ok())
            .ok_or(ModemError::Parse)
    }

    /// Set the modem functionality level; `15` is a silent reset.
    pub fn set_modem_functionality(&mut self, fun: u8, reset: bool) -> ModemResult<()> {
        let command = if reset {
            format!("AT+CFUN={},1", fun)
        } else {
            format!("AT+CFUN={}", fun)
        };
        self.command_ok(&command, Duration::from_secs(180))?;
        Ok(())
    }

    pub fn get_mno_profile(&mut self) -> ModemResult<u8> {
        let body = self.command_ok("AT+UMNOPROF?", Duration::from_secs(15))?;
        filter_response("+UMNOPROF: ", &body)
            .split(',')
            .next()
            .and_then(|field| field.trim().parse().ok())
            .ok_or(ModemError::Parse)
    }

    pub fn set_mno_profile(&mut self, profile: u8) -> ModemResult<()> {
        let command = format!("AT+UMNOPROF={}", profile);
        self.command_ok(&command, Duration::from_secs(180))?;
        Ok(())
    }

    /// Currently selected operator, if any.
    pub fn get_operator(&mut self) -> ModemResult<String> {
        let body = self.command_ok("AT+COPS?", Duration::from_secs(180))?;
        Ok(filter_response("+COPS: ", &body))
    }

    /// Force operator selection: `AT+COPS=<mode>[,<format>,"<oper>"]`.
    pub fn set_operator_selection(
        &mut self,
        mode: u8,
        operator: Option<(u8, &str)>,
    ) -> ModemResult<()> {
        let command = match operator {
            Some((format, oper)) => format!("AT+COPS={},{},\"{}\"", mode, format, oper),
            None => format!("AT+COPS={}", mode),
        };
        self.command_ok(&command, Duration::from_secs(180))?;
        Ok(())
    }

    /// Signal quality as reported by `+CSQ`: (rssi, quality).
    pub fn get_signal_quality(&mut self) -> ModemResult<(u8, u8)> {
        let body = self.command_ok("AT+CSQ", Duration::from_secs(1))?;
        let filtered = filter_response("+CSQ: ", &body);
        let mut fields = filtered.split(',');

        let rssi = fields
            .next()
            .and_then(|field| field.trim().parse().ok())
            .ok_or(ModemError::Parse)?;
        let quality = fields
            .next()
            .and_then(|field| field.trim().parse().ok())
            .ok_or(ModemError::Parse)?;
        Ok((rssi, quality))
    }
}
