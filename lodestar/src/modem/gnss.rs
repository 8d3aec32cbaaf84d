//! Raw NMEA pass-through from a dedicated GNSS serial link. Sentences are
//! surfaced opaque; parsing them is the application's business.

use crate::buffer::Buffer;
use std::io;

const GNSS_BUFFER_SIZE: usize = 2048;

/// A batch of complete NMEA sentences, most recent last.
#[derive(Debug, Default, PartialEq)]
pub struct GnssData {
    pub sentences: Vec<String>,
}

pub struct GnssReceiver<S> {
    link: S,
    buffer: Buffer,
    line: Vec<u8>,
}

impl<S: io::Read> GnssReceiver<S> {
    pub fn new(link: S) -> GnssReceiver<S> {
        GnssReceiver {
            link,
            buffer: Buffer::new(GNSS_BUFFER_SIZE),
            line: Vec::new(),
        }
    }

    /// Drain the link and return the complete sentences received so far.
    pub fn poll(&mut self) -> io::Result<GnssData> {
        self.buffer.ingress(&mut self.link)?;

        let mut data = GnssData::default();
        while let Some(byte) = self.buffer.pop_front() {
            match byte {
                b'\r' | b'\n' => {
                    if !self.line.is_empty() {
                        let line = String::from_utf8_lossy(&self.line).into_owned();
                        self.line.clear();
                        // NMEA sentences start with '$'; anything else is
                        // line noise.
                        if line.starts_with('$') {
                            data.sentences.push(line);
                        }
                    }
                }
                _ => self.line.push(byte),
            }
        }

        Ok(data)
    }
}
