//! Static modem identity: manufacturer, model, firmware version, IMEI.

use crate::modem::{Modem, ModemError, ModemResult};
use std::io;
use std::time::Duration;

fn first_line(body: &str) -> ModemResult<String> {
    body.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_owned)
        .ok_or(ModemError::Parse)
}

impl<S: io::Read + io::Write> Modem<S> {
    pub fn get_product_identification(&mut self) -> ModemResult<String> {
        let body = self.command_ok("ATI", Duration::from_secs(1))?;
        first_line(&body)
    }

    pub fn get_manufacturer(&mut self) -> ModemResult<String> {
        let body = self.command_ok("AT+CGMI", Duration::from_secs(1))?;
        first_line(&body)
    }

    pub fn get_model(&mut self) -> ModemResult<String> {
        let body = self.command_ok("AT+CGMM", Duration::from_secs(1))?;
        first_line(&body)
    }

    pub fn get_version(&mut self) -> ModemResult<String> {
        let body = self.command_ok("AT+CGMR", Duration::from_secs(1))?;
        first_line(&body)
    }

    pub fn get_imei(&mut self) -> ModemResult<String> {
        let body = self.command_ok("AT+CGSN", Duration::from_secs(1))?;
        first_line(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modem::ModemModel;
    use crate::testing::MockModem;
    use flint::logging;

    #[test]
    fn test_identity_readers() {
        let mut modem = Modem::new(MockModem::new(), ModemModel::Default, &logging::null());

        assert_eq!(modem.get_manufacturer().unwrap(), "Acme Communications");
        assert_eq!(modem.get_model().unwrap(), "SARA-R410M-02B");
        assert_eq!(modem.get_version().unwrap(), "L0.0.00.00.05.08");
        assert_eq!(modem.get_imei().unwrap(), "356938035643809");
    }
}
