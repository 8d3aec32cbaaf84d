//! Packet data network (APN) management.

use crate::modem::at::filter_response;
use crate::modem::{Modem, ModemError, ModemResult};
use flint::logging;
use std::io;
use std::time::Duration;

/// Address(es) assigned to a PDN context.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PdnAddress {
    pub ipv4: Option<[u8; 4]>,
    pub ipv6: Option<[u8; 16]>,
}

fn parse_address_token(token: &str, address: &mut PdnAddress) -> ModemResult<()> {
    let fields: Vec<&str> = token.split('.').collect();

    // The modem renders both families dot-separated: 4 octets for IPv4,
    // 16 for IPv6.
    match fields.len() {
        4 => {
            let mut ipv4 = [0u8; 4];
            for (slot, field) in ipv4.iter_mut().zip(&fields) {
                *slot = field.parse().map_err(|_| ModemError::Parse)?;
            }
            address.ipv4 = Some(ipv4);
            Ok(())
        }
        16 => {
            let mut ipv6 = [0u8; 16];
            for (slot, field) in ipv6.iter_mut().zip(&fields) {
                *slot = field.parse().map_err(|_| ModemError::Parse)?;
            }
            address.ipv6 = Some(ipv6);
            Ok(())
        }
        _ => Err(ModemError::Parse),
    }
}

impl<S: io::Read + io::Write> Modem<S> {
    /// Define a PDN context: `AT+CGDCONT=<cid>,"IP","<apn>"`.
    pub fn set_apn(&mut self, cid: u8, apn: &str) -> ModemResult<()> {
        let command = format!("AT+CGDCONT={},\"IP\",\"{}\"", cid, apn);
        self.command_ok(&command, Duration::from_secs(5))?;
        Ok(())
    }

    /// Addresses currently assigned to a PDN context.
    pub fn get_apn_ip_address(&mut self, cid: u8) -> ModemResult<PdnAddress> {
        let command = format!("AT+CGPADDR={}", cid);
        let body = self.command_ok(&command, Duration::from_secs(3))?;

        let filtered = filter_response("+CGPADDR: ", &body);
        let mut address = PdnAddress::default();

        for (index, token) in filtered.split(',').enumerate() {
            let token = token.trim().trim_matches('"');
            match index {
                0 => {} // cid
                1 | 2 => {
                    if !token.is_empty() {
                        parse_address_token(token, &mut address)?;
                    }
                }
                _ => {
                    logging::error!(self.core().log, "unexpected +CGPADDR token";
                                    "context" => "pdn",
                                    "token" => token);
                    return Err(ModemError::Parse);
                }
            }
        }

        Ok(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modem::ModemModel;
    use crate::testing::MockModem;
    use flint::logging;

    #[test]
    fn test_apn_address_read() {
        let mut modem = Modem::new(MockModem::new(), ModemModel::Default, &logging::null());

        let address = modem.get_apn_ip_address(1).unwrap();
        assert_eq!(address.ipv4, Some([10, 64, 0, 2]));
        assert_eq!(address.ipv6, None);
    }

    #[test]
    fn test_set_apn_command_shape() {
        let mut modem = Modem::new(MockModem::new(), ModemModel::Default, &logging::null());

        modem.set_apn(1, "iot.nb").unwrap();
        assert_eq!(
            modem.serial_mut().commands_matching("AT+CGDCONT"),
            vec!["AT+CGDCONT=1,\"IP\",\"iot.nb\""]
        );
    }

    #[test]
    fn test_parse_ipv6_form() {
        let mut address = PdnAddress::default();
        parse_address_token(
            "32.1.13.184.0.0.0.0.0.0.0.0.0.0.0.1",
            &mut address,
        )
        .unwrap();
        assert!(address.ipv6.is_some());
        assert_eq!(address.ipv6.unwrap()[0], 32);
    }

    #[test]
    fn test_parse_rejects_bad_token() {
        let mut address = PdnAddress::default();
        assert_eq!(
            parse_address_token("10.1.2", &mut address),
            Err(ModemError::Parse)
        );
    }
}
