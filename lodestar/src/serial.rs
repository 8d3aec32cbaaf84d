//! Byte-level access to the modem UART.
//!
//! The rest of the crate only ever sees `io::Read + io::Write`; reads must be
//! non-blocking in the sense that `Ok(0)` (or `WouldBlock`/`TimedOut`) means
//! "no data right now", never "end of stream".

use std::ffi::OsStr;
use std::io;
use std::time::Duration;

use serialport::prelude::*;

/// A serial link backed by a real UART device.
pub struct UartLink {
    port: Box<dyn serialport::SerialPort>,
}

impl UartLink {
    /// Opens the named serial port with appropriate settings.
    pub fn open<S: AsRef<OsStr>>(name: S, baud_rate: u32) -> Result<UartLink, serialport::Error> {
        let mut settings = SerialPortSettings::default();
        settings.baud_rate = baud_rate;
        settings.timeout = Duration::from_millis(5);

        serialport::open_with_settings(&name, &settings).map(|port| UartLink { port })
    }
}

impl io::Read for UartLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let available = self
            .port
            .bytes_to_read()
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;

        if available == 0 {
            return Ok(0);
        }

        match self.port.read(buf) {
            Ok(count) => Ok(count),
            Err(ref err) if err.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(err) => Err(err),
        }
    }
}

impl io::Write for UartLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}
