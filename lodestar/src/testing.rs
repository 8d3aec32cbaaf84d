//! Test doubles shared by the unit tests: a plain two-queue serial link and a
//! scripted modem that answers AT commands the way the real hardware would.

use flint::hex;
use std::collections::VecDeque;
use std::io;

/// Serial link with an inject queue (modem to engine) and a written
/// transcript (engine to modem).
pub struct MockSerial {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
}

impl MockSerial {
    pub fn new() -> MockSerial {
        MockSerial {
            rx: VecDeque::new(),
            tx: Vec::new(),
        }
    }

    pub fn inject(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes.iter().cloned());
    }

    pub fn written(&self) -> &[u8] {
        &self.tx
    }

    pub fn take_written(&mut self) -> Vec<u8> {
        std::mem::replace(&mut self.tx, Vec::new())
    }
}

impl io::Read for MockSerial {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut count = 0;
        while count < buf.len() {
            match self.rx.pop_front() {
                Some(byte) => {
                    buf[count] = byte;
                    count += 1;
                }
                None => break,
            }
        }
        Ok(count)
    }
}

impl io::Write for MockSerial {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

const MOCK_SOCKETS: usize = 7;

/// A scripted u-blox style modem. Commands written to it are answered
/// immediately into the read queue; sockets, datagram queues and the
/// ASCII-hex payload mode behave like the real firmware.
pub struct MockModem {
    rx: VecDeque<u8>,
    line: Vec<u8>,
    pub transcript: Vec<String>,
    /// Payloads the device sent with +USOWR / +USOST, hex-decoded.
    pub sent_datagrams: Vec<(u8, Vec<u8>)>,
    queued: Vec<VecDeque<(Option<(String, u16)>, Vec<u8>)>>,
    next_socket: u8,
    pub iccid: String,
    pub cereg_stat: u8,
    pub fail_listen: bool,
}

impl MockModem {
    pub fn new() -> MockModem {
        MockModem {
            rx: VecDeque::new(),
            line: Vec::new(),
            transcript: Vec::new(),
            sent_datagrams: Vec::new(),
            queued: (0..MOCK_SOCKETS).map(|_| VecDeque::new()).collect(),
            next_socket: 0,
            iccid: "8988307000000000000".to_owned(),
            cereg_stat: 1,
            fail_listen: false,
        }
    }

    /// Queue raw bytes for the device to read (URCs, stray lines).
    pub fn inject(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes.iter().cloned());
    }

    /// Queue a datagram on a socket and raise the matching data URC.
    pub fn deliver_datagram(&mut self, socket: u8, from: Option<(&str, u16)>, data: &[u8]) {
        let urc = match from {
            Some(_) => format!("\r\n+UUSORF: {},{}\r\n", socket, data.len()),
            None => format!("\r\n+UUSORD: {},{}\r\n", socket, data.len()),
        };
        self.queued[socket as usize]
            .push_back((from.map(|(ip, port)| (ip.to_owned(), port)), data.to_vec()));
        self.inject(urc.as_bytes());
    }

    /// Raise a socket-closed URC.
    pub fn close_socket(&mut self, socket: u8) {
        self.inject(format!("\r\n+UUSOCL: {}\r\n", socket).as_bytes());
    }

    /// Change the EPS registration status and raise the +CEREG URC.
    pub fn set_eps_registration(&mut self, stat: u8) {
        self.cereg_stat = stat;
        self.inject(format!("\r\n+CEREG: {}\r\n", stat).as_bytes());
    }

    pub fn commands_matching(&self, prefix: &str) -> Vec<&String> {
        self.transcript
            .iter()
            .filter(|line| line.starts_with(prefix))
            .collect()
    }

    fn reply(&mut self, body: &str) {
        self.rx
            .extend(format!("\r\n{}\r\n", body).bytes());
    }

    fn reply_ok(&mut self) {
        self.rx.extend(b"\r\nOK\r\n".iter().cloned());
    }

    fn reply_error(&mut self) {
        self.rx.extend(b"\r\nERROR\r\n".iter().cloned());
    }

    fn respond(&mut self, line: String) {
        self.transcript.push(line.clone());

        let cmd = match line.strip_prefix("AT") {
            Some(cmd) => cmd,
            None => return,
        };

        if cmd.starts_with("+USOCR=") {
            let socket = self.next_socket;
            self.next_socket = (self.next_socket + 1) % MOCK_SOCKETS as u8;
            self.reply(&format!("+USOCR: {}", socket));
            self.reply_ok();
        } else if cmd.starts_with("+USOLI=") {
            if self.fail_listen {
                self.reply_error();
            } else {
                self.reply_ok();
            }
        } else if cmd.starts_with("+USOCO=") {
            self.reply_ok();
        } else if let Some(args) = cmd.strip_prefix("+USOWR=") {
            let fields = split_fields(args);
            let socket: u8 = fields[0].parse().unwrap();
            let data = hex::decode(&fields[2]).expect("Bad hex payload in +USOWR");
            self.reply(&format!("+USOWR: {},{}", socket, data.len()));
            self.sent_datagrams.push((socket, data));
            self.reply_ok();
        } else if let Some(args) = cmd.strip_prefix("+USOST=") {
            let fields = split_fields(args);
            let socket: u8 = fields[0].parse().unwrap();
            let data = hex::decode(&fields[4]).expect("Bad hex payload in +USOST");
            self.reply(&format!("+USOST: {},{}", socket, data.len()));
            self.sent_datagrams.push((socket, data));
            self.reply_ok();
        } else if let Some(args) = cmd.strip_prefix("+USORD=") {
            let fields = split_fields(args);
            let socket: usize = fields[0].parse().unwrap();
            let length: usize = fields[1].parse().unwrap();
            if length == 0 {
                let queued = self.queued[socket].front().map_or(0, |(_, data)| data.len());
                self.reply(&format!("+USORD: {},{}", socket, queued));
            } else {
                match self.queued[socket].pop_front() {
                    Some((_, data)) => {
                        let body =
                            format!("+USORD: {},{},\"{}\"", socket, data.len(), hex::encode(&data));
                        self.reply(&body);
                    }
                    None => self.reply(&format!("+USORD: {},0,\"\"", socket)),
                }
            }
            self.reply_ok();
        } else if let Some(args) = cmd.strip_prefix("+USORF=") {
            let fields = split_fields(args);
            let socket: usize = fields[0].parse().unwrap();
            let length: usize = fields[1].parse().unwrap();
            if length == 0 {
                let queued = self.queued[socket].front().map_or(0, |(_, data)| data.len());
                self.reply(&format!("+USORF: {},{}", socket, queued));
            } else {
                match self.queued[socket].pop_front() {
                    Some((from, data)) => {
                        let (ip, port) = from.unwrap_or_else(|| ("127.0.0.1".to_owned(), 0));
                        let body = format!(
                            "+USORF: {},\"{}\",{},{},\"{}\"",
                            socket,
                            ip,
                            port,
                            data.len(),
                            hex::encode(&data)
                        );
                        self.reply(&body);
                    }
                    None => self.reply(&format!("+USORF: {},\"0.0.0.0\",0,0,\"\"", socket)),
                }
            }
            self.reply_ok();
        } else if cmd.starts_with("+USOCL") {
            self.reply_ok();
        } else if cmd == "+CCID" {
            let body = format!("+CCID: {}", self.iccid);
            self.reply(&body);
            self.reply_ok();
        } else if cmd == "+CEREG?" {
            let body = format!("+CEREG: 2,{}", self.cereg_stat);
            self.reply(&body);
            self.reply_ok();
        } else if cmd == "+CREG?" {
            self.reply("+CREG: 2,1");
            self.reply_ok();
        } else if cmd == "+CGREG?" {
            self.reply("+CGREG: 2,1");
            self.reply_ok();
        } else if cmd == "+CGMI" {
            self.reply("Acme Communications");
            self.reply_ok();
        } else if cmd == "+CGMM" {
            self.reply("SARA-R410M-02B");
            self.reply_ok();
        } else if cmd == "+CGMR" {
            self.reply("L0.0.00.00.05.08");
            self.reply_ok();
        } else if cmd == "+CGSN" {
            self.reply("356938035643809");
            self.reply_ok();
        } else if cmd == "+CSQ" {
            self.reply("+CSQ: 17,5");
            self.reply_ok();
        } else if cmd == "+UMNOPROF?" {
            self.reply("+UMNOPROF: 1");
            self.reply_ok();
        } else if cmd == "+CFUN?" {
            self.reply("+CFUN: 1");
            self.reply_ok();
        } else if cmd.starts_with("+CGPADDR=") {
            self.reply("+CGPADDR: 1,\"10.64.0.2\"");
            self.reply_ok();
        } else if cmd == "+CPIN?" {
            self.reply("+CPIN: READY");
            self.reply_ok();
        } else if cmd == "+COPS?" {
            self.reply("+COPS: 0,0,\"Mock Network\",7");
            self.reply_ok();
        } else {
            // ATE0, ATV1, AT, +CMEE=2, +CSCS, +UDCONF and friends.
            self.reply_ok();
        }
    }
}

fn split_fields(args: &str) -> Vec<String> {
    args.split(',')
        .map(|field| field.trim_matches('"').to_owned())
        .collect()
}

impl io::Read for MockModem {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut count = 0;
        while count < buf.len() {
            match self.rx.pop_front() {
                Some(byte) => {
                    buf[count] = byte;
                    count += 1;
                }
                None => break,
            }
        }
        Ok(count)
    }
}

impl io::Write for MockModem {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &byte in buf {
            match byte {
                b'\n' => {
                    let line = String::from_utf8_lossy(&self.line).into_owned();
                    self.line.clear();
                    let line = line.trim_end_matches('\r').to_owned();
                    if !line.is_empty() {
                        self.respond(line);
                    }
                }
                _ => self.line.push(byte),
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

use crate::dtls::{
    AlertDescription, AlertLevel, DtlsEngine, DtlsError, DtlsResult, EngineFactory, EngineOutput,
};
use std::time::{Duration, Instant};

/// A loopback DTLS engine: application records travel in the clear, the
/// handshake is a single hello flight, and two magic datagrams drive the
/// finish and fatal-alert paths.
pub struct MockDtlsEngine {
    connected: bool,
    instant: bool,
    retransmit_deadline: Option<Instant>,
}

impl MockDtlsEngine {
    pub const CLIENT_HELLO: &'static [u8] = b"\x16HELLO";
    pub const HANDSHAKE_FINISH: &'static [u8] = b"\x16FINISH";
    pub const FATAL_ALERT: &'static [u8] = b"\x15FATAL";

    /// Factory for engines whose handshake completes inside
    /// `start_handshake`.
    pub fn instant_factory() -> EngineFactory {
        Box::new(|_, _| {
            Box::new(MockDtlsEngine {
                connected: false,
                instant: true,
                retransmit_deadline: None,
            })
        })
    }

    /// Factory for engines that stay in the handshake until the peer sends
    /// `HANDSHAKE_FINISH`.
    pub fn manual_factory() -> EngineFactory {
        Box::new(|_, _| {
            Box::new(MockDtlsEngine {
                connected: false,
                instant: false,
                retransmit_deadline: None,
            })
        })
    }
}

impl DtlsEngine for MockDtlsEngine {
    fn start_handshake(&mut self, out: &mut EngineOutput) -> DtlsResult<()> {
        out.records.push(Self::CLIENT_HELLO.to_vec());
        out.events
            .push((AlertLevel::Warning, AlertDescription::EventConnect));

        if self.instant {
            self.connected = true;
            out.events
                .push((AlertLevel::Warning, AlertDescription::EventConnected));
        } else {
            self.retransmit_deadline = Some(Instant::now() + Duration::from_secs(1));
        }
        Ok(())
    }

    fn ingest_record(&mut self, ciphertext: &[u8], out: &mut EngineOutput) -> DtlsResult<()> {
        if ciphertext == Self::HANDSHAKE_FINISH {
            self.connected = true;
            self.retransmit_deadline = None;
            out.events
                .push((AlertLevel::Warning, AlertDescription::EventConnected));
        } else if ciphertext == Self::FATAL_ALERT {
            self.connected = false;
            out.events
                .push((AlertLevel::Fatal, AlertDescription::HandshakeFailure));
        } else if self.connected {
            out.plaintext.push(ciphertext.to_vec());
        }
        Ok(())
    }

    fn send_application_data(&mut self, plaintext: &[u8], out: &mut EngineOutput) -> DtlsResult<()> {
        if !self.connected {
            return Err(DtlsError::Engine("handshake not finished"));
        }
        out.records.push(plaintext.to_vec());
        Ok(())
    }

    fn next_retransmit(&self) -> Option<Instant> {
        self.retransmit_deadline
    }

    fn tick(&mut self, now: Instant, out: &mut EngineOutput) {
        if !self.connected {
            out.records.push(Self::CLIENT_HELLO.to_vec());
            self.retransmit_deadline = Some(now + Duration::from_secs(1));
        }
    }

    fn close_notify(&mut self, out: &mut EngineOutput) {
        out.records.push(b"\x15CLOSE".to_vec());
        self.connected = false;
    }

    fn renegotiate(&mut self, out: &mut EngineOutput) -> DtlsResult<()> {
        out.events
            .push((AlertLevel::Warning, AlertDescription::EventRenegotiate));
        self.connected = true;
        out.events
            .push((AlertLevel::Warning, AlertDescription::EventConnected));
        Ok(())
    }

    fn rehandshake(&mut self, out: &mut EngineOutput) -> DtlsResult<()> {
        self.renegotiate(out)
    }
}
