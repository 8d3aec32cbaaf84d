//! CoAP peer: client retransmissions, server-side de-duplication and the
//! receive demultiplexer, over either a plaintext UDP socket or a DTLS
//! session.
//!
//! Inbound traffic and transaction outcomes are handed upward as
//! `PeerEvent`s rather than invoked callbacks; a client transaction carries a
//! caller-supplied tag that is moved out with its terminal event, which makes
//! the at-most-once delivery guarantee structural.

use crate::coap::message::{CoapCode, CoapMessage, CoapType};
use crate::coap::option::uint_wire_len;
use crate::coap::{
    CodecError, ACK_RANDOM_FACTOR, ACK_TIMEOUT, EXCHANGE_LIFETIME, MAX_RETRANSMIT, NON_LIFETIME,
    NSTART, NSYNC,
};
use crate::dtls::{AlertDescription, AlertLevel, DtlsError, DtlsSession};
use crate::modem::socket::SocketError;
use crate::modem::Modem;
use flint::logging::{self, Logger};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::io;
use std::time::{Duration, Instant};

#[derive(Debug, PartialEq)]
pub enum PeerError {
    /// The socket is not open / the DTLS handshake has not completed.
    TransportNotReady,
    /// Client transaction table is full (NSTART outstanding).
    NoSpace,
    /// A transaction with this message-id is already in flight.
    DuplicateTransaction,
    /// ACK and RST cannot be sent reliably.
    NotSendableReliably,
    Codec(CodecError),
    Socket(SocketError),
    Dtls(DtlsError),
}

impl From<CodecError> for PeerError {
    fn from(err: CodecError) -> Self {
        PeerError::Codec(err)
    }
}

impl From<SocketError> for PeerError {
    fn from(err: SocketError) -> Self {
        PeerError::Socket(err)
    }
}

impl From<DtlsError> for PeerError {
    fn from(err: DtlsError) -> Self {
        PeerError::Dtls(err)
    }
}

pub type PeerResult<T> = Result<T, PeerError>;

/// Terminal fate of a client transaction, delivered exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionEvent {
    Ack,
    Rst,
    Timeout,
    Canceled,
}

/// What the receiving handler wants done with a confirmable exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUp {
    DoNothing,
    SendAcknowledgement,
    SendReset,
}

#[derive(Debug)]
pub enum PeerEvent<T> {
    /// Every decoded inbound message, emitted before any other processing.
    /// Retransmissions, pings and messages the demux drops all pass through
    /// here, for observability.
    Stateless(CoapMessage),
    /// A client transaction reached its terminal state. `tag` is whatever
    /// the sender attached; `None` for probing (NON) transactions.
    Transaction {
        message_id: u16,
        event: TransactionEvent,
        tag: Option<T>,
        message: Option<CoapMessage>,
    },
    /// Inbound request (class 0, non-empty), de-duplicated.
    Request(CoapMessage),
    /// Inbound response (class 2/4/5), de-duplicated for CON/NON carriers.
    Response(CoapMessage),
    /// Alert or pseudo-event from the DTLS session.
    DtlsEvent {
        level: AlertLevel,
        description: AlertDescription,
    },
}

struct ClientTransaction<T> {
    message_id: u16,
    mtype: CoapType,
    deadline: Instant,
    interval: Duration,
    retransmissions_left: u32,
    bytes: Vec<u8>,
    tag: Option<T>,
}

struct ServerTransaction {
    message_id: u16,
    mtype: CoapType,
    deadline: Instant,
    reply: Option<Vec<u8>>,
}

enum Transport {
    Plaintext { socket: Option<u8> },
    Dtls(DtlsSession),
}

pub struct CoapPeer<T> {
    transport: Transport,
    pub remote_ip: String,
    pub remote_port: u16,
    pub local_port: u16,

    next_message_id: u16,
    next_token: u64,

    client_transactions: Vec<ClientTransaction<T>>,
    /// Sorted by deadline, oldest first.
    server_transactions: Vec<ServerTransaction>,

    rng: SmallRng,
    log: Logger,
}

impl<T> CoapPeer<T> {
    pub fn new_plaintext(
        remote_ip: &str,
        remote_port: u16,
        local_port: u16,
        log: &Logger,
    ) -> CoapPeer<T> {
        Self::with_transport(
            Transport::Plaintext { socket: None },
            remote_ip,
            remote_port,
            local_port,
            log,
        )
    }

    pub fn new_dtls(session: DtlsSession, log: &Logger) -> CoapPeer<T> {
        let remote_ip = session.remote_ip.clone();
        let remote_port = session.remote_port;
        let local_port = session.local_port;
        Self::with_transport(
            Transport::Dtls(session),
            &remote_ip,
            remote_port,
            local_port,
            log,
        )
    }

    fn with_transport(
        transport: Transport,
        remote_ip: &str,
        remote_port: u16,
        local_port: u16,
        log: &Logger,
    ) -> CoapPeer<T> {
        let mut rng = SmallRng::from_entropy();
        let next_message_id = rng.gen();
        let next_token = rng.gen::<u64>() & 0xff_ffff;

        CoapPeer {
            transport,
            remote_ip: remote_ip.to_owned(),
            remote_port,
            local_port,
            next_message_id,
            next_token,
            client_transactions: Vec::new(),
            server_transactions: Vec::new(),
            rng,
            log: log.new(logging::o!()),
        }
    }

    #[inline]
    pub fn is_dtls(&self) -> bool {
        matches!(self.transport, Transport::Dtls(_))
    }

    /// Socket currently carrying this peer's traffic, if any.
    pub fn socket_id(&self) -> Option<u8> {
        match &self.transport {
            Transport::Plaintext { socket } => *socket,
            Transport::Dtls(session) => session.socket_id(),
        }
    }

    /// True when messages can be sent right now.
    pub fn transport_is_ready(&self) -> bool {
        match &self.transport {
            Transport::Plaintext { socket } => socket.is_some(),
            Transport::Dtls(session) => session.is_connected(),
        }
    }

    /// (Re-)establish the transport. For DTLS this starts a fresh handshake
    /// or renegotiates, depending on where the session got stuck.
    pub fn reinitialize<S: io::Read + io::Write>(&mut self, modem: &mut Modem<S>) -> PeerResult<()> {
        match &mut self.transport {
            Transport::Plaintext { socket } => {
                if let Some(old) = socket.take() {
                    let _ = modem.socket_close(old);
                }

                let opened = match modem.open_listen_connect_udp(
                    self.local_port,
                    &self.remote_ip,
                    self.remote_port,
                ) {
                    Ok(opened) => opened,
                    Err(err) => {
                        logging::warn!(self.log, "listen+connect failed, trying plain connect";
                                       "context" => "reinitialize",
                                       "error" => ?err);
                        modem.open_connect_udp(&self.remote_ip, self.remote_port)?
                    }
                };
                *socket = Some(opened);
                Ok(())
            }
            Transport::Dtls(session) => session.reinitialize(modem).map_err(PeerError::Dtls),
        }
    }

    /// Close the transport nicely.
    pub fn close<S: io::Read + io::Write>(&mut self, modem: &mut Modem<S>) -> PeerResult<()> {
        match &mut self.transport {
            Transport::Plaintext { socket } => {
                if let Some(old) = socket.take() {
                    modem.socket_close(old)?;
                }
                Ok(())
            }
            Transport::Dtls(session) => session.close(modem).map_err(PeerError::Dtls),
        }
    }

    /// Note that a socket was closed out from under us. Returns true when it
    /// was this peer's transport socket; the transport is then no longer
    /// ready until reinitialized.
    pub fn handle_socket_closed(&mut self, socket: u8) -> bool {
        match &mut self.transport {
            Transport::Plaintext { socket: own } => {
                if *own == Some(socket) {
                    *own = None;
                    true
                } else {
                    false
                }
            }
            Transport::Dtls(session) => session.handle_socket_closed(socket),
        }
    }

    pub fn get_next_message_id(&mut self) -> u16 {
        self.next_message_id = self.next_message_id.wrapping_add(1);
        self.next_message_id
    }

    /// Fresh token plus the minimum byte width needed to carry it.
    pub fn get_next_token(&mut self) -> (u64, u8) {
        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1);
        (token, uint_wire_len(token) as u8)
    }

    fn transport_send<S: io::Read + io::Write>(
        transport: &mut Transport,
        modem: &mut Modem<S>,
        data: &[u8],
    ) -> PeerResult<()> {
        match transport {
            Transport::Plaintext { socket } => {
                let socket = socket.ok_or(PeerError::TransportNotReady)?;
                let sent = modem.socket_send_udp(socket, data)?;
                if sent != data.len() {
                    return Err(PeerError::Socket(SocketError::InvalidArgument));
                }
                Ok(())
            }
            Transport::Dtls(session) => session.send_data(modem, data).map_err(PeerError::Dtls),
        }
    }

    /// Send a message unreliably; CON is demoted to NON. With a non-zero
    /// `probing_rate` (bytes/second) a retransmitting NON transaction is
    /// registered, stopping after `max_transmit_span`. ACK/RST are never
    /// retransmitted, but their bytes are cached on the matching server
    /// transaction for duplicate replay.
    pub fn send_unreliably<S: io::Read + io::Write>(
        &mut self,
        modem: &mut Modem<S>,
        message: &mut CoapMessage,
        probing_rate: u32,
        max_transmit_span: Duration,
    ) -> PeerResult<()> {
        if !self.transport_is_ready() {
            logging::error!(self.log, "transport is not ready"; "context" => "send_unreliably");
            return Err(PeerError::TransportNotReady);
        }

        let mut probing_rate = probing_rate;
        let mut is_ack_rst = false;
        match message.mtype {
            CoapType::Confirmable => {
                logging::warn!(self.log, "demoting CON to NON"; "context" => "send_unreliably");
                message.mtype = CoapType::NonConfirmable;
            }
            CoapType::NonConfirmable => {}
            CoapType::Acknowledgement | CoapType::Reset => {
                if probing_rate != 0 {
                    logging::warn!(self.log, "will not retransmit ACK or RST";
                                   "context" => "send_unreliably");
                    probing_rate = 0;
                }
                is_ack_rst = true;
            }
        }

        let bytes = message.encode()?;

        if is_ack_rst {
            self.set_server_transaction_reply(message.message_id, bytes.clone());
        }

        if probing_rate > 0 {
            self.put_client_transaction_non(
                message.message_id,
                bytes.clone(),
                probing_rate,
                max_transmit_span,
            )?;
        }

        if let Err(err) = Self::transport_send(&mut self.transport, modem, &bytes) {
            self.drop_client_transaction(message.message_id);
            return Err(err);
        }

        logging::info!(self.log, "sent";
                       "context" => "send_unreliably",
                       "remote" => %self.remote_ip,
                       "message_id" => message.message_id,
                       "bytes" => bytes.len());
        Ok(())
    }

    /// Send a message reliably; NON is promoted to CON. The transaction's
    /// terminal event carries `tag` back to the caller exactly once.
    pub fn send_reliably<S: io::Read + io::Write>(
        &mut self,
        modem: &mut Modem<S>,
        message: &mut CoapMessage,
        tag: T,
        max_retransmit: u32,
    ) -> PeerResult<()> {
        if !self.transport_is_ready() {
            logging::error!(self.log, "transport is not ready"; "context" => "send_reliably");
            return Err(PeerError::TransportNotReady);
        }

        match message.mtype {
            CoapType::Confirmable => {}
            CoapType::NonConfirmable => {
                logging::warn!(self.log, "promoting NON to CON"; "context" => "send_reliably");
                message.mtype = CoapType::Confirmable;
            }
            CoapType::Acknowledgement | CoapType::Reset => {
                logging::warn!(self.log, "ACK and RST can not be sent reliably";
                               "context" => "send_reliably");
                return Err(PeerError::NotSendableReliably);
            }
        }

        let bytes = message.encode()?;
        self.put_client_transaction_con(message.message_id, bytes.clone(), tag, max_retransmit)?;

        if let Err(err) = Self::transport_send(&mut self.transport, modem, &bytes) {
            self.drop_client_transaction(message.message_id);
            return Err(err);
        }

        logging::info!(self.log, "sent";
                       "context" => "send_reliably",
                       "remote" => %self.remote_ip,
                       "message_id" => message.message_id,
                       "bytes" => bytes.len());
        Ok(())
    }

    /// Cancel the retransmissions for a message, synchronously producing the
    /// `Canceled` terminal event.
    pub fn stop_retransmissions(&mut self, message_id: u16) -> Option<PeerEvent<T>> {
        let position = self
            .client_transactions
            .iter()
            .position(|txn| txn.message_id == message_id)?;
        let txn = self.client_transactions.remove(position);

        Some(PeerEvent::Transaction {
            message_id: txn.message_id,
            event: TransactionEvent::Canceled,
            tag: txn.tag,
            message: None,
        })
    }

    /// Tick the peer: DTLS flight retransmission, expired client
    /// transactions (producing `Timeout` events) and due CoAP
    /// retransmissions. Idempotent per instant: a second call with the same
    /// `now` observes the deadlines the first one pushed forward.
    pub fn trigger_periodic_retransmit<S: io::Read + io::Write>(
        &mut self,
        modem: &mut Modem<S>,
        now: Instant,
    ) -> Vec<PeerEvent<T>> {
        let mut events = Vec::new();

        let mut decrypted = Vec::new();
        if let Transport::Dtls(session) = &mut self.transport {
            let output = session.periodic_retransmit(modem, now);
            for (level, description) in output.events {
                events.push(PeerEvent::DtlsEvent { level, description });
            }
            decrypted = output.plaintext;
        }
        for plaintext in decrypted {
            self.process_plaintext(modem, &plaintext, &mut events);
        }

        // Expired with no retries left: deliver Timeout and drop.
        let mut index = 0;
        while index < self.client_transactions.len() {
            let txn = &self.client_transactions[index];
            if txn.deadline <= now && txn.retransmissions_left == 0 {
                let txn = self.client_transactions.remove(index);
                logging::info!(self.log, "transaction timed out";
                               "context" => "retransmit",
                               "message_id" => txn.message_id);
                events.push(PeerEvent::Transaction {
                    message_id: txn.message_id,
                    event: TransactionEvent::Timeout,
                    tag: txn.tag,
                    message: None,
                });
            } else {
                index += 1;
            }
        }

        // Due with retries left: retransmit and push the deadline out.
        let mut to_send = Vec::new();
        for txn in &mut self.client_transactions {
            if txn.deadline <= now && txn.retransmissions_left > 0 {
                if txn.mtype == CoapType::Confirmable {
                    txn.interval *= 2;
                }
                txn.deadline = now + txn.interval;
                txn.retransmissions_left -= 1;
                to_send.push((txn.message_id, txn.bytes.clone()));
            }
        }
        for (message_id, bytes) in to_send {
            match Self::transport_send(&mut self.transport, modem, &bytes) {
                Ok(()) => logging::info!(self.log, "retransmitted";
                                         "context" => "retransmit",
                                         "message_id" => message_id,
                                         "bytes" => bytes.len()),
                Err(err) => logging::error!(self.log, "retransmission failed";
                                            "context" => "retransmit",
                                            "message_id" => message_id,
                                            "error" => ?err),
            }
        }

        events
    }

    /// Feed one datagram received on this peer's socket. For DTLS the
    /// datagram is ciphertext and is run through the session first.
    pub fn handle_datagram<S: io::Read + io::Write>(
        &mut self,
        modem: &mut Modem<S>,
        data: &[u8],
    ) -> Vec<PeerEvent<T>> {
        let mut events = Vec::new();

        if let Transport::Dtls(session) = &mut self.transport {
            let output = session.handle_datagram(modem, data);
            for (level, description) in output.events {
                events.push(PeerEvent::DtlsEvent { level, description });
            }
            for plaintext in output.plaintext {
                self.process_plaintext(modem, &plaintext, &mut events);
            }
            return events;
        }

        self.process_plaintext(modem, data, &mut events);
        events
    }

    /// Answer a CON request with an empty ACK; the encoded bytes are cached
    /// on the server transaction for duplicate replay.
    pub fn reply_ack<S: io::Read + io::Write>(
        &mut self,
        modem: &mut Modem<S>,
        request: &CoapMessage,
    ) -> PeerResult<()> {
        let mut ack = CoapMessage::ack_for(request);
        self.send_unreliably(modem, &mut ack, 0, Duration::from_secs(0))
    }

    /// Answer a request with an empty RST; cached like `reply_ack`.
    pub fn reply_rst<S: io::Read + io::Write>(
        &mut self,
        modem: &mut Modem<S>,
        request: &CoapMessage,
    ) -> PeerResult<()> {
        let mut rst = CoapMessage::rst_for(request);
        self.send_unreliably(modem, &mut rst, 0, Duration::from_secs(0))
    }

    /// Apply a handler's verdict to a confirmable exchange. Non-confirmable
    /// carriers get nothing on the wire.
    pub fn apply_follow_up<S: io::Read + io::Write>(
        &mut self,
        modem: &mut Modem<S>,
        message: &CoapMessage,
        follow_up: FollowUp,
    ) {
        if message.mtype != CoapType::Confirmable {
            return;
        }

        let result = match follow_up {
            FollowUp::DoNothing => Ok(()),
            FollowUp::SendAcknowledgement => self.reply_ack(modem, message),
            FollowUp::SendReset => self.reply_rst(modem, message),
        };

        if let Err(err) = result {
            logging::error!(self.log, "follow-up failed";
                            "context" => "follow_up",
                            "message_id" => message.message_id,
                            "error" => ?err);
        }
    }

    fn process_plaintext<S: io::Read + io::Write>(
        &mut self,
        modem: &mut Modem<S>,
        data: &[u8],
        events: &mut Vec<PeerEvent<T>>,
    ) {
        let message = match CoapMessage::decode(data) {
            Ok(message) => message,
            Err(err) => {
                logging::error!(self.log, "dropping malformed datagram";
                                "context" => "rx",
                                "bytes" => data.len(),
                                "error" => ?err);
                return;
            }
        };

        // Stateless observation point: every decoded message goes up from
        // here, including retransmissions and the ones dropped below.
        logging::debug!(self.log, "rx";
                        "context" => "rx",
                        "type" => ?message.mtype,
                        "code" => %message.code,
                        "message_id" => message.message_id);
        events.push(PeerEvent::Stateless(message.clone()));

        // Internal short-cuts.
        match message.mtype {
            CoapType::Confirmable if message.code.is_empty() => {
                // CoAP ping; answer with reset.
                let mut rst = CoapMessage::rst_for(&message);
                if let Err(err) = self.send_unreliably(modem, &mut rst, 0, Duration::from_secs(0)) {
                    logging::error!(self.log, "failed answering ping";
                                    "context" => "rx",
                                    "error" => ?err);
                }
                return;
            }
            CoapType::NonConfirmable if message.code.is_empty() => {
                logging::info!(self.log, "ignoring empty NON"; "context" => "rx");
                return;
            }
            CoapType::Acknowledgement if message.code.is_request() => {
                logging::info!(self.log, "ignoring ACK with piggybacked request";
                               "context" => "rx");
                return;
            }
            CoapType::Reset if !message.code.is_empty() => {
                logging::info!(self.log, "ignoring non-empty RST"; "context" => "rx");
                return;
            }
            _ => {}
        }

        match message.mtype {
            CoapType::Confirmable | CoapType::NonConfirmable => {
                self.drop_expired_server_transactions(Instant::now());

                if let Some(position) = self
                    .server_transactions
                    .iter()
                    .position(|txn| txn.message_id == message.message_id)
                {
                    match self.server_transactions[position].reply.clone() {
                        Some(reply) => {
                            match Self::transport_send(&mut self.transport, modem, &reply) {
                                Ok(()) => logging::debug!(self.log, "replayed cached ACK/RST";
                                                          "context" => "rx",
                                                          "type" => ?self.server_transactions[position].mtype,
                                                          "message_id" => message.message_id),
                                Err(err) => logging::error!(self.log, "failed replaying ACK/RST";
                                                            "context" => "rx",
                                                            "message_id" => message.message_id,
                                                            "error" => ?err),
                            }
                        }
                        None => logging::info!(self.log, "silently ignoring retransmission";
                                               "context" => "rx",
                                               "message_id" => message.message_id),
                    }
                    return;
                }

                self.put_server_transaction(message.message_id, message.mtype, Instant::now());

                if message.code.is_request() {
                    events.push(PeerEvent::Request(message));
                } else if message.code.is_response() {
                    events.push(PeerEvent::Response(message));
                } else {
                    logging::warn!(self.log, "unhandled code class";
                                   "context" => "rx",
                                   "class" => message.code.class);
                }
            }
            CoapType::Acknowledgement => {
                if let Some(position) = self
                    .client_transactions
                    .iter()
                    .position(|txn| txn.message_id == message.message_id)
                {
                    let txn = self.client_transactions.remove(position);
                    events.push(PeerEvent::Transaction {
                        message_id: txn.message_id,
                        event: TransactionEvent::Ack,
                        tag: txn.tag,
                        message: Some(message.clone()),
                    });
                } else {
                    logging::warn!(self.log, "unexpected ACK";
                                   "context" => "rx",
                                   "message_id" => message.message_id);
                }

                // Empty ACKs do not reach higher-level handlers.
                if message.code.is_empty() {
                    return;
                }
                if message.code.is_response() {
                    events.push(PeerEvent::Response(message));
                }
            }
            CoapType::Reset => {
                if let Some(position) = self
                    .client_transactions
                    .iter()
                    .position(|txn| txn.message_id == message.message_id)
                {
                    let txn = self.client_transactions.remove(position);
                    events.push(PeerEvent::Transaction {
                        message_id: txn.message_id,
                        event: TransactionEvent::Rst,
                        tag: txn.tag,
                        message: None,
                    });
                } else {
                    logging::warn!(self.log, "unexpected RST";
                                   "context" => "rx",
                                   "message_id" => message.message_id);
                }
            }
        }
    }

    fn put_client_transaction_con(
        &mut self,
        message_id: u16,
        bytes: Vec<u8>,
        tag: T,
        max_retransmit: u32,
    ) -> PeerResult<()> {
        if self
            .client_transactions
            .iter()
            .any(|txn| txn.message_id == message_id)
        {
            return Err(PeerError::DuplicateTransaction);
        }
        if self.client_transactions.len() >= NSTART {
            logging::error!(self.log, "no space left for client transaction";
                            "context" => "transactions",
                            "message_id" => message_id);
            return Err(PeerError::NoSpace);
        }

        let jitter_ceiling = (ACK_TIMEOUT.as_millis() as f64 * (ACK_RANDOM_FACTOR - 1.0)) as u64;
        let interval = ACK_TIMEOUT + Duration::from_millis(self.rng.gen_range(0..jitter_ceiling));

        self.client_transactions.push(ClientTransaction {
            message_id,
            mtype: CoapType::Confirmable,
            deadline: Instant::now() + interval,
            interval,
            retransmissions_left: if max_retransmit == 0 {
                MAX_RETRANSMIT
            } else {
                max_retransmit
            },
            bytes,
            tag: Some(tag),
        });
        Ok(())
    }

    fn put_client_transaction_non(
        &mut self,
        message_id: u16,
        bytes: Vec<u8>,
        probing_rate: u32,
        max_transmit_span: Duration,
    ) -> PeerResult<()> {
        if self
            .client_transactions
            .iter()
            .any(|txn| txn.message_id == message_id)
        {
            return Err(PeerError::DuplicateTransaction);
        }
        if self.client_transactions.len() >= NSTART {
            logging::error!(self.log, "no space left for client transaction";
                            "context" => "transactions",
                            "message_id" => message_id);
            return Err(PeerError::NoSpace);
        }

        let interval_ms = ((bytes.len() as u64 * 1000) / probing_rate as u64).max(1);
        let interval = Duration::from_millis(interval_ms);
        let retransmissions = (max_transmit_span.as_millis() as u64 / interval_ms) as u32;

        self.client_transactions.push(ClientTransaction {
            message_id,
            mtype: CoapType::NonConfirmable,
            deadline: Instant::now() + interval,
            interval,
            retransmissions_left: retransmissions,
            bytes,
            tag: None,
        });
        Ok(())
    }

    fn drop_client_transaction(&mut self, message_id: u16) {
        self.client_transactions
            .retain(|txn| txn.message_id != message_id);
    }

    fn drop_expired_server_transactions(&mut self, now: Instant) {
        // Sorted by deadline, so expired entries sit at the front.
        while self
            .server_transactions
            .first()
            .map_or(false, |txn| txn.deadline <= now)
        {
            self.server_transactions.remove(0);
        }
    }

    fn put_server_transaction(&mut self, message_id: u16, mtype: CoapType, now: Instant) {
        let lifetime = match mtype {
            CoapType::Confirmable => EXCHANGE_LIFETIME,
            CoapType::NonConfirmable => NON_LIFETIME,
            _ => return,
        };
        let deadline = now + lifetime;

        if self.server_transactions.len() >= NSYNC {
            logging::warn!(self.log, "server transaction table full, evicting oldest";
                           "context" => "transactions");
            self.server_transactions.remove(0);
        }

        let position = self
            .server_transactions
            .iter()
            .position(|txn| txn.deadline > deadline)
            .unwrap_or_else(|| self.server_transactions.len());

        self.server_transactions.insert(
            position,
            ServerTransaction {
                message_id,
                mtype,
                deadline,
                reply: None,
            },
        );
    }

    fn set_server_transaction_reply(&mut self, message_id: u16, bytes: Vec<u8>) {
        if let Some(txn) = self
            .server_transactions
            .iter_mut()
            .find(|txn| txn.message_id == message_id)
        {
            txn.reply = Some(bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modem::ModemModel;
    use crate::testing::MockModem;
    use flint::logging;

    fn modem() -> Modem<MockModem> {
        Modem::new(MockModem::new(), ModemModel::Default, &logging::null())
    }

    fn ready_peer(modem: &mut Modem<MockModem>) -> CoapPeer<u32> {
        let mut peer = CoapPeer::new_plaintext("203.0.113.7", 5683, 0, &logging::null());
        peer.reinitialize(modem).unwrap();
        assert!(peer.transport_is_ready());
        peer
    }

    fn con_request(peer: &mut CoapPeer<u32>) -> CoapMessage {
        let mut message = CoapMessage::new(
            CoapType::Confirmable,
            CoapCode::POST,
            peer.get_next_message_id(),
        );
        message.add_uri_path("v1");
        message.add_uri_path("Heartbeats");
        message
    }

    fn empty_ack(message_id: u16) -> Vec<u8> {
        CoapMessage::new(CoapType::Acknowledgement, CoapCode::EMPTY, message_id)
            .encode()
            .unwrap()
    }

    /// Drop the leading stateless observations, leaving the dispatch events.
    fn dispatched(events: Vec<PeerEvent<u32>>) -> Vec<PeerEvent<u32>> {
        events
            .into_iter()
            .filter(|event| !matches!(event, PeerEvent::Stateless(_)))
            .collect()
    }

    fn stateless_count(events: &[PeerEvent<u32>]) -> usize {
        events
            .iter()
            .filter(|event| matches!(event, PeerEvent::Stateless(_)))
            .count()
    }

    #[test]
    fn test_send_reliably_registers_transaction() {
        let mut modem = modem();
        let mut peer = ready_peer(&mut modem);

        let mut message = con_request(&mut peer);
        peer.send_reliably(&mut modem, &mut message, 7, 0).unwrap();

        assert_eq!(peer.client_transactions.len(), 1);
        assert_eq!(modem.serial_mut().sent_datagrams.len(), 1);
    }

    #[test]
    fn test_ack_terminates_exactly_once() {
        let mut modem = modem();
        let mut peer = ready_peer(&mut modem);

        let mut message = con_request(&mut peer);
        peer.send_reliably(&mut modem, &mut message, 7, 0).unwrap();

        let ack = empty_ack(message.message_id);
        let events = dispatched(peer.handle_datagram(&mut modem, &ack));
        assert_eq!(events.len(), 1);
        match &events[0] {
            PeerEvent::Transaction { event, tag, .. } => {
                assert_eq!(*event, TransactionEvent::Ack);
                assert_eq!(*tag, Some(7));
            }
            other => panic!("Unexpected event {:?}", other),
        }

        // A duplicate ACK must not re-fire the terminal event.
        let events = dispatched(peer.handle_datagram(&mut modem, &ack));
        assert!(events.is_empty());
    }

    #[test]
    fn test_rst_terminates_transaction() {
        let mut modem = modem();
        let mut peer = ready_peer(&mut modem);

        let mut message = con_request(&mut peer);
        peer.send_reliably(&mut modem, &mut message, 9, 0).unwrap();

        let rst = CoapMessage::new(CoapType::Reset, CoapCode::EMPTY, message.message_id)
            .encode()
            .unwrap();
        let events = dispatched(peer.handle_datagram(&mut modem, &rst));
        assert_eq!(events.len(), 1);
        match &events[0] {
            PeerEvent::Transaction { event, tag, .. } => {
                assert_eq!(*event, TransactionEvent::Rst);
                assert_eq!(*tag, Some(9));
            }
            other => panic!("Unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_stop_retransmissions_cancels_synchronously() {
        let mut modem = modem();
        let mut peer = ready_peer(&mut modem);

        let mut message = con_request(&mut peer);
        peer.send_reliably(&mut modem, &mut message, 3, 0).unwrap();

        let event = peer.stop_retransmissions(message.message_id).unwrap();
        match event {
            PeerEvent::Transaction { event, tag, .. } => {
                assert_eq!(event, TransactionEvent::Canceled);
                assert_eq!(tag, Some(3));
            }
            other => panic!("Unexpected event {:?}", other),
        }
        assert!(peer.client_transactions.is_empty());
        assert!(peer.stop_retransmissions(message.message_id).is_none());
    }

    #[test]
    fn test_backoff_bounds_and_deadline_sequence() {
        for _ in 0..1000 {
            let mut modem = modem();
            let mut peer: CoapPeer<u32> = ready_peer(&mut modem);

            let mut message = con_request(&mut peer);
            peer.send_reliably(&mut modem, &mut message, 0, 0).unwrap();

            let interval = peer.client_transactions[0].interval;
            assert!(interval >= Duration::from_millis(5000));
            assert!(interval < Duration::from_millis(7500));
        }

        // Nominal deadlines from send time zero: I0, 3*I0, 7*I0, 15*I0.
        let mut modem = modem();
        let mut peer: CoapPeer<u32> = ready_peer(&mut modem);
        let mut message = con_request(&mut peer);
        peer.send_reliably(&mut modem, &mut message, 0, 0).unwrap();

        let interval = peer.client_transactions[0].interval;
        let first_deadline = peer.client_transactions[0].deadline;

        let mut now = first_deadline;
        let mut expected_gap = interval * 2;
        for transmissions in 1..=MAX_RETRANSMIT {
            let events = peer.trigger_periodic_retransmit(&mut modem, now);
            assert!(events.is_empty());
            assert_eq!(
                modem.serial_mut().sent_datagrams.len(),
                1 + transmissions as usize
            );
            assert_eq!(peer.client_transactions[0].deadline, now + expected_gap);

            now += expected_gap;
            expected_gap *= 2;
        }

        // Fourth deadline: timeout, exactly one terminal event.
        let events = peer.trigger_periodic_retransmit(&mut modem, now);
        assert_eq!(events.len(), 1);
        match &events[0] {
            PeerEvent::Transaction { event, .. } => assert_eq!(*event, TransactionEvent::Timeout),
            other => panic!("Unexpected event {:?}", other),
        }
        assert_eq!(modem.serial_mut().sent_datagrams.len(), 4);
        assert!(peer.client_transactions.is_empty());
    }

    #[test]
    fn test_tick_is_idempotent_per_instant() {
        let mut modem = modem();
        let mut peer: CoapPeer<u32> = ready_peer(&mut modem);

        let mut message = con_request(&mut peer);
        peer.send_reliably(&mut modem, &mut message, 0, 0).unwrap();
        let deadline = peer.client_transactions[0].deadline;

        peer.trigger_periodic_retransmit(&mut modem, deadline);
        assert_eq!(modem.serial_mut().sent_datagrams.len(), 2);

        // Same instant again: the deadline moved, nothing new goes out.
        peer.trigger_periodic_retransmit(&mut modem, deadline);
        assert_eq!(modem.serial_mut().sent_datagrams.len(), 2);
    }

    #[test]
    fn test_duplicate_request_replays_cached_ack() {
        let mut modem = modem();
        let mut peer: CoapPeer<u32> = ready_peer(&mut modem);

        let mut request = CoapMessage::new(CoapType::Confirmable, CoapCode::POST, 0x4242);
        request.add_uri_path("Commands");
        request.payload = b"hello".to_vec();
        let wire = request.encode().unwrap();

        let events = dispatched(peer.handle_datagram(&mut modem, &wire));
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], PeerEvent::Request(_)));

        peer.reply_ack(&mut modem, &request).unwrap();
        let ack_count = modem.serial_mut().sent_datagrams.len();

        // Duplicate: no new Request event, the cached ACK is replayed
        // byte-for-byte.
        let events = dispatched(peer.handle_datagram(&mut modem, &wire));
        assert!(events.is_empty());
        assert_eq!(modem.serial_mut().sent_datagrams.len(), ack_count + 1);
        let replay = modem.serial_mut().sent_datagrams.last().unwrap().1.clone();
        assert_eq!(replay, modem.serial_mut().sent_datagrams[ack_count - 1].1);
    }

    #[test]
    fn test_ping_answered_with_rst() {
        let mut modem = modem();
        let mut peer: CoapPeer<u32> = ready_peer(&mut modem);

        let ping = CoapMessage::new(CoapType::Confirmable, CoapCode::EMPTY, 0x0101)
            .encode()
            .unwrap();
        let events = peer.handle_datagram(&mut modem, &ping);
        assert_eq!(stateless_count(&events), 1);
        assert!(dispatched(events).is_empty());

        let rst = CoapMessage::decode(&modem.serial_mut().sent_datagrams.last().unwrap().1).unwrap();
        assert_eq!(rst.mtype, CoapType::Reset);
        assert_eq!(rst.message_id, 0x0101);
    }

    #[test]
    fn test_malformed_shortcuts_are_dropped() {
        let mut modem = modem();
        let mut peer: CoapPeer<u32> = ready_peer(&mut modem);
        let sent_before = modem.serial_mut().sent_datagrams.len();

        // Empty NON: dropped, but still observed.
        let wire = CoapMessage::new(CoapType::NonConfirmable, CoapCode::EMPTY, 1)
            .encode()
            .unwrap();
        let events = peer.handle_datagram(&mut modem, &wire);
        assert_eq!(stateless_count(&events), 1);
        assert!(dispatched(events).is_empty());

        // ACK carrying a request code: dropped.
        let wire = CoapMessage::new(CoapType::Acknowledgement, CoapCode::POST, 2)
            .encode()
            .unwrap();
        assert!(dispatched(peer.handle_datagram(&mut modem, &wire)).is_empty());

        // Non-empty RST: dropped.
        let wire = CoapMessage::new(CoapType::Reset, CoapCode::CREATED, 3)
            .encode()
            .unwrap();
        assert!(dispatched(peer.handle_datagram(&mut modem, &wire)).is_empty());

        // Garbage: dropped before it is even observable.
        assert!(peer.handle_datagram(&mut modem, &[0xff, 0x00]).is_empty());

        assert_eq!(modem.serial_mut().sent_datagrams.len(), sent_before);
    }

    #[test]
    fn test_piggybacked_response_reaches_handlers() {
        let mut modem = modem();
        let mut peer: CoapPeer<u32> = ready_peer(&mut modem);

        let mut message = con_request(&mut peer);
        peer.send_reliably(&mut modem, &mut message, 1, 0).unwrap();

        let mut response = CoapMessage::new(
            CoapType::Acknowledgement,
            CoapCode::CREATED,
            message.message_id,
        );
        response.add_queued_command_count(4);
        let wire = response.encode().unwrap();

        let events = dispatched(peer.handle_datagram(&mut modem, &wire));
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0],
            PeerEvent::Transaction {
                event: TransactionEvent::Ack,
                ..
            }
        ));
        match &events[1] {
            PeerEvent::Response(response) => {
                assert_eq!(response.uint_option(50000), Some(4));
            }
            other => panic!("Unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_stateless_event_precedes_dispatch() {
        let mut modem = modem();
        let mut peer: CoapPeer<u32> = ready_peer(&mut modem);

        let mut request = CoapMessage::new(CoapType::Confirmable, CoapCode::POST, 0x6060);
        request.add_uri_path("Commands");
        request.payload = b"observed".to_vec();
        let wire = request.encode().unwrap();

        let events = peer.handle_datagram(&mut modem, &wire);
        assert_eq!(events.len(), 2);
        match &events[0] {
            PeerEvent::Stateless(observed) => {
                assert_eq!(observed.message_id, 0x6060);
                assert_eq!(observed.payload, b"observed");
            }
            other => panic!("Unexpected event {:?}", other),
        }
        assert!(matches!(events[1], PeerEvent::Request(_)));

        // Retransmissions are de-duplicated but still observed.
        let events = peer.handle_datagram(&mut modem, &wire);
        assert_eq!(stateless_count(&events), 1);
        assert!(dispatched(events).is_empty());
    }

    #[test]
    fn test_nstart_limits_outstanding_transactions() {
        let mut modem = modem();
        let mut peer: CoapPeer<u32> = ready_peer(&mut modem);

        for index in 0..NSTART {
            let mut message = con_request(&mut peer);
            peer.send_reliably(&mut modem, &mut message, index as u32, 0)
                .unwrap();
        }

        let mut message = con_request(&mut peer);
        assert_eq!(
            peer.send_reliably(&mut modem, &mut message, 99, 0),
            Err(PeerError::NoSpace)
        );
    }

    #[test]
    fn test_probing_non_transaction_retransmits_at_constant_interval() {
        let mut modem = modem();
        let mut peer: CoapPeer<u32> = ready_peer(&mut modem);

        let mut message = CoapMessage::new(
            CoapType::NonConfirmable,
            CoapCode::POST,
            peer.get_next_message_id(),
        );
        message.payload = vec![0u8; 10];

        // probing_rate 2 B/s, span 60 s.
        peer.send_unreliably(&mut modem, &mut message, 2, Duration::from_secs(60))
            .unwrap();

        let txn = &peer.client_transactions[0];
        let interval = txn.interval;
        assert_eq!(txn.mtype, CoapType::NonConfirmable);
        assert!(txn.retransmissions_left > 0);
        assert!(txn.tag.is_none());

        let deadline = txn.deadline;
        peer.trigger_periodic_retransmit(&mut modem, deadline);
        // Interval stays constant for NON.
        assert_eq!(peer.client_transactions[0].interval, interval);
        assert_eq!(modem.serial_mut().sent_datagrams.len(), 2);
    }

    #[test]
    fn test_server_table_eviction_keeps_bound() {
        let mut modem = modem();
        let mut peer: CoapPeer<u32> = ready_peer(&mut modem);

        for message_id in 0..(NSYNC as u16 + 10) {
            let mut request = CoapMessage::new(CoapType::NonConfirmable, CoapCode::POST, message_id);
            request.payload = b"x".to_vec();
            peer.handle_datagram(&mut modem, &request.encode().unwrap());
        }

        assert_eq!(peer.server_transactions.len(), NSYNC);
    }

    #[test]
    fn test_token_width_tracks_value() {
        let mut modem = modem();
        let mut peer: CoapPeer<u32> = ready_peer(&mut modem);

        let (token, width) = peer.get_next_token();
        assert_eq!(width as usize, uint_wire_len(token));

        let (next, _) = peer.get_next_token();
        assert_eq!(next, token.wrapping_add(1));
    }
}
