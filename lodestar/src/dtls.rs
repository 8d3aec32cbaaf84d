//! DTLS-PSK session driving a wrapped handshake/record engine over one of
//! the modem's UDP sockets.
//!
//! The engine itself (cipher suites, flights, record protection) lives
//! behind the `DtlsEngine` trait and is supplied by the embedder through a
//! factory; this module owns the session plumbing around it: socket setup,
//! PSK material, the periodic retransmission tick, status tracking from the
//! alert stream and teardown/rebuild on fatal alerts.

use crate::modem::socket::SocketError;
use crate::modem::Modem;
use flint::logging::{self, Logger};
use std::io;
use std::time::Instant;

pub const MAX_PSK_ID_LEN: usize = 32;
pub const MAX_PSK_KEY_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Warning,
    Fatal,
}

/// TLS alert descriptions, plus the engine's three pseudo-events signalled
/// on the same channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertDescription {
    CloseNotify,
    UnexpectedMessage,
    BadRecordMac,
    RecordOverflow,
    DecompressionFailure,
    HandshakeFailure,
    IllegalParameter,
    AccessDenied,
    DecodeError,
    DecryptError,
    ProtocolVersion,
    InsufficientSecurity,
    InternalError,
    UserCanceled,
    NoRenegotiation,
    UnsupportedExtension,
    /// Handshake started.
    EventConnect,
    /// Handshake finished; application data may flow.
    EventConnected,
    /// Renegotiation in progress.
    EventRenegotiate,
}

impl AlertDescription {
    pub fn code(self) -> u16 {
        match self {
            AlertDescription::CloseNotify => 0,
            AlertDescription::UnexpectedMessage => 1,
            AlertDescription::BadRecordMac => 20,
            AlertDescription::RecordOverflow => 22,
            AlertDescription::DecompressionFailure => 30,
            AlertDescription::HandshakeFailure => 40,
            AlertDescription::IllegalParameter => 47,
            AlertDescription::AccessDenied => 49,
            AlertDescription::DecodeError => 50,
            AlertDescription::DecryptError => 51,
            AlertDescription::ProtocolVersion => 70,
            AlertDescription::InsufficientSecurity => 71,
            AlertDescription::InternalError => 80,
            AlertDescription::UserCanceled => 90,
            AlertDescription::NoRenegotiation => 100,
            AlertDescription::UnsupportedExtension => 110,
            AlertDescription::EventConnect => 0x01dc,
            AlertDescription::EventConnected => 0x01de,
            AlertDescription::EventRenegotiate => 0x01df,
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum DtlsError {
    /// No engine instance; `connect` was never called or teardown completed.
    NoEngine,
    /// `send_data` before the handshake finished.
    NotConnected,
    BadAddress,
    Ipv6NotImplemented,
    BadPskMaterial,
    Engine(&'static str),
    Socket(SocketError),
}

impl From<SocketError> for DtlsError {
    fn from(err: SocketError) -> Self {
        DtlsError::Socket(err)
    }
}

pub type DtlsResult<T> = Result<T, DtlsError>;

/// Everything an engine produced while handling one call: ciphertext records
/// to put on the wire, decrypted application data, and alert events.
#[derive(Debug, Default)]
pub struct EngineOutput {
    pub records: Vec<Vec<u8>>,
    pub plaintext: Vec<Vec<u8>>,
    pub events: Vec<(AlertLevel, AlertDescription)>,
}

impl EngineOutput {
    pub fn new() -> EngineOutput {
        EngineOutput::default()
    }
}

/// The wrapped DTLS record/handshake automaton. Implementations are pure
/// state machines: they never touch the network themselves, everything goes
/// through `EngineOutput`.
pub trait DtlsEngine {
    /// Begin the client handshake.
    fn start_handshake(&mut self, out: &mut EngineOutput) -> DtlsResult<()>;

    /// Feed one ciphertext datagram received from the peer.
    fn ingest_record(&mut self, ciphertext: &[u8], out: &mut EngineOutput) -> DtlsResult<()>;

    /// Protect and emit one application datagram.
    fn send_application_data(&mut self, plaintext: &[u8], out: &mut EngineOutput) -> DtlsResult<()>;

    /// Flight retransmission deadline, when one is pending.
    fn next_retransmit(&self) -> Option<Instant>;

    /// Advance timers; retransmits the current flight when due.
    fn tick(&mut self, now: Instant, out: &mut EngineOutput);

    /// Send close_notify.
    fn close_notify(&mut self, out: &mut EngineOutput);

    /// Re-key the established session.
    fn renegotiate(&mut self, out: &mut EngineOutput) -> DtlsResult<()>;

    /// Run a full new handshake on the existing association.
    fn rehandshake(&mut self, out: &mut EngineOutput) -> DtlsResult<()>;
}

/// Builds a fresh engine from (psk_identity, psk_key).
pub type EngineFactory = Box<dyn Fn(&[u8], &[u8]) -> Box<dyn DtlsEngine>>;

/// Decrypted datagrams and alert events handed up from one session call.
#[derive(Debug, Default)]
pub struct SessionOutput {
    pub plaintext: Vec<Vec<u8>>,
    pub events: Vec<(AlertLevel, AlertDescription)>,
}

/// Parse the peer address literal. IPv4 only for now.
pub fn parse_peer_addr(ip: &str) -> DtlsResult<[u8; 4]> {
    if ip.contains(':') {
        // TODO: IPv6 once the wrapped engine's support for it is settled.
        return Err(DtlsError::Ipv6NotImplemented);
    }

    let mut octets = [0u8; 4];
    let mut fields = ip.split('.');
    for octet in octets.iter_mut() {
        *octet = fields
            .next()
            .and_then(|field| field.parse().ok())
            .ok_or(DtlsError::BadAddress)?;
    }
    if fields.next().is_some() {
        return Err(DtlsError::BadAddress);
    }
    Ok(octets)
}

pub struct DtlsSession {
    psk_id: Vec<u8>,
    psk_key: Vec<u8>,
    factory: EngineFactory,
    engine: Option<Box<dyn DtlsEngine>>,

    pub remote_ip: String,
    pub remote_port: u16,
    pub local_port: u16,
    socket: Option<u8>,

    status: AlertDescription,
    log: Logger,
}

impl DtlsSession {
    pub fn new(
        psk_id: &[u8],
        psk_key: &[u8],
        factory: EngineFactory,
        remote_ip: &str,
        remote_port: u16,
        local_port: u16,
        log: &Logger,
    ) -> DtlsResult<DtlsSession> {
        if psk_id.is_empty() || psk_id.len() > MAX_PSK_ID_LEN {
            return Err(DtlsError::BadPskMaterial);
        }
        if psk_key.is_empty() || psk_key.len() > MAX_PSK_KEY_LEN {
            return Err(DtlsError::BadPskMaterial);
        }
        parse_peer_addr(remote_ip)?;

        Ok(DtlsSession {
            psk_id: psk_id.to_vec(),
            psk_key: psk_key.to_vec(),
            factory,
            engine: None,
            remote_ip: remote_ip.to_owned(),
            remote_port,
            local_port,
            socket: None,
            status: AlertDescription::CloseNotify,
            log: log.new(logging::o!()),
        })
    }

    /// The last alert description seen; `EventConnected` is the only status
    /// that admits `send_data`.
    #[inline]
    pub fn status(&self) -> AlertDescription {
        self.status
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.status == AlertDescription::EventConnected
    }

    #[inline]
    pub fn socket_id(&self) -> Option<u8> {
        self.socket
    }

    /// Note that a modem socket was closed out from under us. Returns true
    /// when it was this session's socket; the session is then torn down and
    /// must be rebuilt by the owner.
    pub fn handle_socket_closed(&mut self, socket: u8) -> bool {
        if self.socket != Some(socket) {
            return false;
        }

        logging::warn!(self.log, "transport socket closed, tearing session down";
                       "context" => "socket_closed",
                       "socket" => socket);
        self.socket = None;
        self.engine = None;
        self.status = AlertDescription::CloseNotify;
        true
    }

    /// Open the socket (when needed), cycle in a fresh engine and start the
    /// handshake.
    pub fn connect<S: io::Read + io::Write>(&mut self, modem: &mut Modem<S>) -> DtlsResult<()> {
        if self.socket.is_none() {
            let socket = match modem.open_listen_connect_udp(
                self.local_port,
                &self.remote_ip,
                self.remote_port,
            ) {
                Ok(socket) => socket,
                Err(listen_err) => {
                    logging::warn!(self.log, "listen+connect failed, falling back to plain connect";
                                   "context" => "connect",
                                   "error" => ?listen_err);
                    modem.open_connect_udp(&self.remote_ip, self.remote_port)?
                }
            };
            self.socket = Some(socket);
        }

        let mut out = EngineOutput::new();
        let mut engine = (self.factory)(&self.psk_id, &self.psk_key);
        engine.start_handshake(&mut out)?;
        self.engine = Some(engine);
        self.status = AlertDescription::EventConnect;

        self.absorb_events(&out.events);
        self.flush_records(modem, &mut out);
        Ok(())
    }

    /// Re-establish the transport: renegotiate when the session is healthy,
    /// rebuild it from scratch when it is stuck mid-handshake or torn down.
    pub fn reinitialize<S: io::Read + io::Write>(&mut self, modem: &mut Modem<S>) -> DtlsResult<()> {
        match self.status {
            AlertDescription::EventConnected => self.renegotiate(modem),
            AlertDescription::EventRenegotiate => Ok(()),
            _ => self.connect(modem),
        }
    }

    pub fn renegotiate<S: io::Read + io::Write>(&mut self, modem: &mut Modem<S>) -> DtlsResult<()> {
        let mut out = EngineOutput::new();
        self.engine
            .as_mut()
            .ok_or(DtlsError::NoEngine)?
            .renegotiate(&mut out)?;
        self.absorb_events(&out.events);
        self.flush_records(modem, &mut out);
        Ok(())
    }

    pub fn rehandshake<S: io::Read + io::Write>(&mut self, modem: &mut Modem<S>) -> DtlsResult<()> {
        let mut out = EngineOutput::new();
        self.engine
            .as_mut()
            .ok_or(DtlsError::NoEngine)?
            .rehandshake(&mut out)?;
        self.absorb_events(&out.events);
        self.flush_records(modem, &mut out);
        Ok(())
    }

    /// Send close_notify and release the socket.
    pub fn close<S: io::Read + io::Write>(&mut self, modem: &mut Modem<S>) -> DtlsResult<()> {
        if let Some(engine) = self.engine.as_mut() {
            let mut out = EngineOutput::new();
            engine.close_notify(&mut out);
            self.flush_records(modem, &mut out);
        }
        self.engine = None;

        if let Some(socket) = self.socket.take() {
            modem.socket_close(socket)?;
        }

        self.status = AlertDescription::CloseNotify;
        Ok(())
    }

    /// Protect and transmit application data. Only valid once the status is
    /// `EventConnected`.
    pub fn send_data<S: io::Read + io::Write>(
        &mut self,
        modem: &mut Modem<S>,
        plaintext: &[u8],
    ) -> DtlsResult<()> {
        if !self.is_connected() {
            logging::error!(self.log, "send before handshake completed";
                            "context" => "send_data",
                            "status" => ?self.status);
            return Err(DtlsError::NotConnected);
        }

        let mut out = EngineOutput::new();
        self.engine
            .as_mut()
            .ok_or(DtlsError::NoEngine)?
            .send_application_data(plaintext, &mut out)?;
        self.absorb_events(&out.events);
        self.flush_records(modem, &mut out);
        Ok(())
    }

    /// Feed one ciphertext datagram received on the session socket.
    pub fn handle_datagram<S: io::Read + io::Write>(
        &mut self,
        modem: &mut Modem<S>,
        data: &[u8],
    ) -> SessionOutput {
        let mut out = EngineOutput::new();

        match self.engine.as_mut() {
            Some(engine) => {
                if let Err(err) = engine.ingest_record(data, &mut out) {
                    logging::warn!(self.log, "engine rejected record";
                                   "context" => "handle_datagram",
                                   "error" => ?err);
                }
            }
            None => {
                logging::warn!(self.log, "ciphertext with no engine, dropping";
                               "context" => "handle_datagram",
                               "bytes" => data.len());
            }
        }

        self.absorb_events(&out.events);
        self.flush_records(modem, &mut out);

        SessionOutput {
            plaintext: out.plaintext,
            events: out.events,
        }
    }

    /// Tick flight retransmission whenever the engine's deadline has passed.
    pub fn periodic_retransmit<S: io::Read + io::Write>(
        &mut self,
        modem: &mut Modem<S>,
        now: Instant,
    ) -> SessionOutput {
        let due = self
            .engine
            .as_ref()
            .and_then(|engine| engine.next_retransmit())
            .map_or(false, |deadline| now >= deadline);

        if !due {
            return SessionOutput::default();
        }

        let mut out = EngineOutput::new();
        if let Some(engine) = self.engine.as_mut() {
            engine.tick(now, &mut out);
        }

        self.absorb_events(&out.events);
        self.flush_records(modem, &mut out);

        SessionOutput {
            plaintext: out.plaintext,
            events: out.events,
        }
    }

    fn absorb_events(&mut self, events: &[(AlertLevel, AlertDescription)]) {
        for &(level, description) in events {
            logging::info!(self.log, "session event";
                           "context" => "event",
                           "level" => ?level,
                           "description" => ?description,
                           "code" => description.code());
            self.status = description;
        }
    }

    fn flush_records<S: io::Read + io::Write>(&mut self, modem: &mut Modem<S>, out: &mut EngineOutput) {
        let socket = match self.socket {
            Some(socket) => socket,
            None => {
                if !out.records.is_empty() {
                    logging::error!(self.log, "records to send but no socket";
                                    "context" => "flush",
                                    "records" => out.records.len());
                }
                return;
            }
        };

        for record in out.records.drain(..) {
            if let Err(err) = modem.socket_send_udp(socket, &record) {
                logging::error!(self.log, "failed sending record";
                                "context" => "flush",
                                "socket" => socket,
                                "bytes" => record.len(),
                                "error" => ?err);
            }
        }
    }
}
