//! The application façade: owns the modem and the CoAP peer, runs the
//! polling loop, the command queue and the reconnection policy, and reports
//! connection status changes.
//!
//! Everything runs single-threaded and cooperative: the owner calls `spin`
//! regularly, each pump step returns events which are routed after the pump
//! finishes, and user handlers run synchronously on the calling thread.

use crate::coap::message::{CoapCode, CoapMessage, CoapType};
use crate::coap::option::number;
use crate::coap::peer::{CoapPeer, FollowUp, PeerEvent, TransactionEvent};
use crate::config::DeviceConfig;
use crate::dtls::{AlertLevel, DtlsSession, EngineFactory};
use crate::modem::gnss::{GnssData, GnssReceiver};
use crate::modem::socket::SocketEvent;
use crate::modem::Modem;
use flint::hex;
use flint::logging::{self, Logger};
use std::collections::VecDeque;
use std::io;
use std::time::{Duration, Instant};

pub const MAX_PENDING_COMMANDS: usize = 100;
pub const MAX_COMMAND_LEN: usize = 140;
pub const POLLING_INTERVAL_MINIMUM: Duration = Duration::from_secs(5);
pub const INIT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);
pub const INIT_CONNECTION_RETRIES: u32 = 2;
pub const REINIT_CONNECTION_INTERVAL: Duration = Duration::from_secs(600);

pub const CONTENT_FORMAT_TEXT_PLAIN: u64 = 0;
pub const CONTENT_FORMAT_OCTET_STREAM: u64 = 42;

const MAX_PURPOSE_LEN: usize = 32;

/// Status of a send/receive operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Ok,
    Error,
    BufferTooSmall,
    NoCommandWaiting,
    CommandTooLong,
}

/// Outcome of a command sent with a receipt request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandReceipt {
    /// Confirmed as received on the server side.
    ConfirmedDelivery,
    /// Rejected, or the server returned an error.
    ServerError,
    /// Receipt tracking was canceled; the command may still have arrived.
    Canceled,
    /// Not confirmed in time; the command may still have arrived.
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Offline,
    NetworkRegistrationDenied,
    RegisteredNotConnected,
    RegisteredAndConnected,
}

pub type ConnectionStatusHandler = Box<dyn FnMut(ConnectionStatus)>;
pub type CommandHandler = Box<dyn FnMut(&[u8], bool)>;
pub type ReceiptHandler = Box<dyn FnMut(CommandReceipt)>;
/// Sees every inbound CoAP message, including retransmissions, ACKs and
/// messages the demux drops.
pub type StatelessMessageHandler = Box<dyn FnMut(&CoapMessage)>;

/// A received command waiting in the FIFO.
#[derive(Debug, PartialEq)]
pub struct Command {
    pub data: Vec<u8>,
    pub is_binary: bool,
}

#[derive(Debug)]
pub enum DeviceError {
    ModemPowerOn,
    ModemInit,
    NotRegistered,
    IccidUnavailable,
    BadPskKey,
    NoDtlsEngine,
    TransportInit,
}

/// Tag attached to outgoing reliable transactions; comes back with the
/// terminal event.
enum TxnTag {
    Heartbeat { is_retry: bool },
    Receipt(ReceiptHandler),
}

pub struct Device<S> {
    modem: Modem<S>,
    gnss: Option<GnssReceiver<S>>,
    peer: Option<CoapPeer<TxnTag>>,
    engine_factory: Option<EngineFactory>,

    config: DeviceConfig,
    purpose: String,
    psk_key: Vec<u8>,
    iccid: String,
    uri_query: String,

    initialized: bool,

    coap_status: bool,
    last_coap_status_connected: Instant,
    last_notified_status: Option<ConnectionStatus>,

    polling_interval: Duration,
    last_polling: Option<Instant>,
    next_polling: Option<Instant>,
    last_polling_token: u64,
    queued_command_count: u64,

    connection_handler: Option<ConnectionStatusHandler>,
    command_handler: Option<CommandHandler>,
    stateless_handler: Option<StatelessMessageHandler>,
    commands: VecDeque<Command>,

    pending_events: Vec<PeerEvent<TxnTag>>,
    log: Logger,
}

impl<S: io::Read + io::Write> Device<S> {
    pub fn new(serial: S, config: DeviceConfig, log: Logger) -> Device<S> {
        let purpose = config.device.purpose.clone();
        let psk_key = hex::decode(&config.device.psk_key).unwrap_or_default();
        let polling_interval = Duration::from_secs(config.device.polling_interval_secs as u64);
        let now = Instant::now();

        Device {
            modem: Modem::new(serial, config.modem.model, &log),
            gnss: None,
            peer: None,
            engine_factory: None,
            config,
            purpose,
            psk_key,
            iccid: String::new(),
            uri_query: String::new(),
            initialized: false,
            coap_status: false,
            last_coap_status_connected: now,
            last_notified_status: Some(ConnectionStatus::Offline),
            polling_interval,
            last_polling: None,
            next_polling: if polling_interval.as_secs() > 0 {
                Some(now)
            } else {
                None
            },
            last_polling_token: 0,
            queued_command_count: 0,
            connection_handler: None,
            command_handler: None,
            stateless_handler: None,
            commands: VecDeque::new(),
            pending_events: Vec::new(),
            log,
        }
    }

    /// Supply the DTLS engine implementation. Required before power-on when
    /// the server configuration selects DTLS.
    pub fn with_dtls_engine(mut self, factory: EngineFactory) -> Device<S> {
        self.engine_factory = Some(factory);
        self
    }

    /// Attach a second serial link carrying GNSS NMEA output.
    pub fn set_gnss_link(&mut self, link: S) {
        self.gnss = Some(GnssReceiver::new(link));
    }

    /// Set the purpose string (max 32 bytes). Only before power-on.
    pub fn set_purpose(&mut self, purpose: &str) -> bool {
        if self.initialized {
            logging::error!(self.log, "can only set purpose before initialization";
                            "context" => "configure");
            return false;
        }
        if purpose.is_empty() || purpose.len() > MAX_PURPOSE_LEN {
            logging::error!(self.log, "bad purpose string";
                            "context" => "configure",
                            "len" => purpose.len());
            return false;
        }

        self.purpose = purpose.to_owned();
        true
    }

    /// Set the PSK key from exactly 32 hex digits. Only before power-on.
    pub fn set_psk_key(&mut self, hex_key: &str) -> bool {
        if self.initialized {
            logging::error!(self.log, "can only set PSK key before initialization";
                            "context" => "configure");
            return false;
        }

        match hex::decode(hex_key) {
            Some(key) if key.len() == 16 => {
                self.psk_key = key;
                true
            }
            _ => {
                logging::error!(self.log, "bad PSK key hex"; "context" => "configure");
                false
            }
        }
    }

    /// Change the polling interval. Values below the minimum (other than 0,
    /// which disables polling) are clamped up.
    pub fn set_polling_interval(&mut self, interval_seconds: u32) {
        let old_interval = self.polling_interval;
        let requested = Duration::from_secs(interval_seconds as u64);

        self.polling_interval = if interval_seconds == 0 {
            Duration::from_secs(0)
        } else if requested >= POLLING_INTERVAL_MINIMUM {
            requested
        } else {
            logging::warn!(self.log, "polling interval below minimum, clamping";
                           "context" => "configure",
                           "requested" => interval_seconds,
                           "minimum" => POLLING_INTERVAL_MINIMUM.as_secs());
            POLLING_INTERVAL_MINIMUM
        };

        if self.polling_interval.as_secs() == 0 {
            self.next_polling = None;
        } else if old_interval != self.polling_interval {
            self.next_polling = Some(match self.last_polling {
                None => Instant::now(),
                Some(last) => last + self.polling_interval,
            });
        }
    }

    pub fn set_connection_status_handler(&mut self, handler: ConnectionStatusHandler) {
        self.connection_handler = Some(handler);
    }

    pub fn set_command_handler(&mut self, handler: CommandHandler) {
        self.command_handler = Some(handler);
    }

    /// Observe every inbound CoAP message, before any dispatch.
    pub fn set_stateless_message_handler(&mut self, handler: StatelessMessageHandler) {
        self.stateless_handler = Some(handler);
    }

    pub fn is_powered(&mut self) -> bool {
        self.initialized && self.modem.is_powered()
    }

    /// Bring the whole stack up: modem, terminal, network attach, identity,
    /// transport.
    pub fn power_module_on(&mut self) -> Result<(), DeviceError> {
        if self.initialized {
            if self.modem.is_powered() {
                return Ok(());
            }
            if !self.modem.power_on() {
                return Err(DeviceError::ModemPowerOn);
            }
            if !self.reinitialize_transport() {
                return Err(DeviceError::TransportInit);
            }
            return Ok(());
        }

        logging::info!(self.log, "powering up"; "context" => "power_on");

        if !self.modem.power_on() {
            return Err(DeviceError::ModemPowerOn);
        }
        self.modem
            .init(self.config.modem.mno_profile)
            .map_err(|_| DeviceError::ModemInit)?;

        self.verify_pin_if_needed();

        let iccid = self
            .modem
            .get_iccid()
            .map_err(|_| DeviceError::IccidUnavailable)?;
        self.uri_query = format!("Sim={}", iccid);
        self.iccid = iccid;

        if self
            .modem
            .set_host_device_information(&self.purpose)
            .is_err()
        {
            return Err(DeviceError::ModemInit);
        }

        let registered = self
            .modem
            .wait_for_registration(Duration::from_secs(self.config.modem.attach_timeout_secs));
        if !registered && !self.config.modem.continue_without_registration {
            return Err(DeviceError::NotRegistered);
        }

        self.initialized = true;
        self.init_coap_peer()
    }

    pub fn power_module_off(&mut self) -> bool {
        if !self.initialized {
            logging::error!(self.log, "not initialized, nothing to power off";
                            "context" => "power_off");
            return false;
        }
        self.modem.power_off()
    }

    /// Try the configured PIN once when the card asks for it; a second
    /// attempt could run into the PIN lock.
    fn verify_pin_if_needed(&mut self) {
        let pin = match &self.config.device.sim_pin {
            Some(pin) => pin.clone(),
            None => return,
        };

        if self.modem.core().sim.last_pin.as_deref() == Some("SIM PIN") {
            logging::info!(self.log, "verifying SIM PIN"; "context" => "power_on");
            if self.modem.verify_pin(&pin).is_err() {
                logging::error!(self.log, "PIN verification failed"; "context" => "power_on");
            }
        }
    }

    fn init_coap_peer(&mut self) -> Result<(), DeviceError> {
        if self.peer.is_some() {
            return Ok(());
        }

        let host = self.config.server.host.clone();
        let port = self.config.server_port();
        let local_port = self.config.device.local_port;

        let peer = if self.config.server.use_dtls {
            let factory = self
                .engine_factory
                .take()
                .ok_or(DeviceError::NoDtlsEngine)?;
            if self.psk_key.is_empty() {
                return Err(DeviceError::BadPskKey);
            }

            let session = DtlsSession::new(
                self.iccid.as_bytes(),
                &self.psk_key,
                factory,
                &host,
                port,
                local_port,
                &self.log,
            )
            .map_err(|_| DeviceError::TransportInit)?;
            CoapPeer::new_dtls(session, &self.log)
        } else {
            CoapPeer::new_plaintext(&host, port, local_port, &self.log)
        };

        self.peer = Some(peer);
        self.establish_transport()
    }

    /// Drive the transport up, busy-waiting on the handshake with bounded
    /// retries.
    fn establish_transport(&mut self) -> Result<(), DeviceError> {
        let now = Instant::now();

        if let Some(peer) = self.peer.as_mut() {
            if peer.reinitialize(&mut self.modem).is_err() {
                self.set_coap_status(false, now);
                return Err(DeviceError::TransportInit);
            }
        }

        let mut retries = INIT_CONNECTION_RETRIES;
        let mut deadline = Instant::now() + INIT_CONNECTION_TIMEOUT;

        loop {
            let ready = self
                .peer
                .as_ref()
                .map_or(false, |peer| peer.transport_is_ready());
            if ready {
                break;
            }

            self.pump_transport(Instant::now());
            std::thread::sleep(Duration::from_millis(50));

            if Instant::now() >= deadline {
                if retries == 0 {
                    logging::error!(self.log, "transport failed to come up";
                                    "context" => "establish",
                                    "attempts" => INIT_CONNECTION_RETRIES + 1);
                    self.set_coap_status(false, Instant::now());
                    return Err(DeviceError::TransportInit);
                }
                retries -= 1;
                deadline = Instant::now() + INIT_CONNECTION_TIMEOUT;

                logging::info!(self.log, "retrying transport initialization";
                               "context" => "establish",
                               "retries_left" => retries);
                if let Some(peer) = self.peer.as_mut() {
                    if peer.reinitialize(&mut self.modem).is_err() {
                        self.set_coap_status(false, Instant::now());
                        return Err(DeviceError::TransportInit);
                    }
                }
            }
        }

        logging::info!(self.log, "transport is ready"; "context" => "establish");
        self.set_coap_status(true, Instant::now());
        Ok(())
    }

    /// Manually re-establish the transport session.
    pub fn reinitialize_transport(&mut self) -> bool {
        logging::warn!(self.log, "reinitializing transport connection";
                       "context" => "reinitialize");

        if self.peer.is_none() {
            return self.init_coap_peer().is_ok();
        }
        self.establish_transport().is_ok()
    }

    /// Derived connection status.
    pub fn get_connection_status(&self) -> ConnectionStatus {
        use crate::modem::network::RegistrationStatus::*;

        match self.modem.core().network.cereg {
            RegisteredHome | RegisteredRoaming => {
                if self.coap_status {
                    ConnectionStatus::RegisteredAndConnected
                } else {
                    ConnectionStatus::RegisteredNotConnected
                }
            }
            RegistrationDenied => ConnectionStatus::NetworkRegistrationDenied,
            _ => ConnectionStatus::Offline,
        }
    }

    fn set_coap_status(&mut self, up: bool, now: Instant) {
        self.coap_status = up;
        self.notify_connection_status(now);
    }

    fn notify_connection_status(&mut self, now: Instant) {
        let status = self.get_connection_status();
        if status == ConnectionStatus::RegisteredAndConnected {
            self.last_coap_status_connected = now;
        }

        if self.last_notified_status != Some(status) {
            self.last_notified_status = Some(status);
            logging::info!(self.log, "connection status changed";
                           "context" => "status",
                           "status" => ?status);
            if let Some(handler) = self.connection_handler.as_mut() {
                handler(status);
            }
        }
    }

    /// Handle pending SDK events. Must be called periodically.
    pub fn spin(&mut self) {
        self.spin_at(Instant::now());
    }

    /// `spin` against an explicit clock.
    pub fn spin_at(&mut self, now: Instant) {
        if let Some(next) = self.next_polling {
            if next <= now {
                self.check_for_commands_at(false, now);
            }
        }

        self.pump_transport(now);

        let events = std::mem::replace(&mut self.pending_events, Vec::new());
        for event in events {
            self.process_peer_event(event, now);
        }

        self.notify_connection_status(now);
    }

    /// One pump step: AT engine, socket receive queues, datagram routing,
    /// retransmission tick. Resulting peer events are queued for routing.
    fn pump_transport(&mut self, now: Instant) {
        self.modem.spin();

        let socket_events = self.modem.handle_waiting_data();
        for event in socket_events {
            match event {
                SocketEvent::Datagram {
                    socket,
                    remote,
                    data,
                } => self.route_datagram(socket, remote, data),
                SocketEvent::Closed { socket } => {
                    let ours = self
                        .peer
                        .as_mut()
                        .map_or(false, |peer| peer.handle_socket_closed(socket));
                    if ours {
                        logging::warn!(self.log, "transport socket closed by peer";
                                       "context" => "pump",
                                       "socket" => socket);
                        self.set_coap_status(false, now);
                    }
                }
                SocketEvent::Accepted { socket, .. } => {
                    logging::info!(self.log, "ignoring inbound TCP accept";
                                   "context" => "pump",
                                   "socket" => socket);
                }
            }
        }

        if let Some(peer) = self.peer.as_mut() {
            let events = peer.trigger_periodic_retransmit(&mut self.modem, now);
            self.pending_events.extend(events);
        }
    }

    fn route_datagram(&mut self, socket: u8, remote: Option<(String, u16)>, data: Vec<u8>) {
        let peer = match self.peer.as_mut() {
            Some(peer) => peer,
            None => return,
        };
        if peer.socket_id() != Some(socket) {
            logging::info!(self.log, "datagram on unexpected socket, dropping";
                           "context" => "pump",
                           "socket" => socket);
            return;
        }

        if let Some((ip, port)) = &remote {
            if !ip.eq_ignore_ascii_case(&peer.remote_ip) || *port != peer.remote_port {
                logging::warn!(self.log, "datagram from unexpected remote, dropping";
                               "context" => "pump",
                               "remote_ip" => %ip,
                               "remote_port" => *port);
                return;
            }
        }

        let events = peer.handle_datagram(&mut self.modem, &data);
        self.pending_events.extend(events);
    }

    fn process_peer_event(&mut self, event: PeerEvent<TxnTag>, now: Instant) {
        match event {
            PeerEvent::Stateless(message) => {
                if let Some(handler) = self.stateless_handler.as_mut() {
                    handler(&message);
                }
            }
            PeerEvent::Transaction { event, tag, .. } => match tag {
                Some(TxnTag::Heartbeat { is_retry }) => self.heartbeat_outcome(event, is_retry, now),
                Some(TxnTag::Receipt(mut handler)) => {
                    let receipt = match event {
                        TransactionEvent::Ack => CommandReceipt::ConfirmedDelivery,
                        TransactionEvent::Rst => CommandReceipt::ServerError,
                        TransactionEvent::Canceled => CommandReceipt::Canceled,
                        TransactionEvent::Timeout => CommandReceipt::Timeout,
                    };
                    handler(receipt);
                }
                None => {}
            },
            PeerEvent::Request(request) => {
                let follow_up = self.handle_request(&request);
                if let Some(peer) = self.peer.as_mut() {
                    peer.apply_follow_up(&mut self.modem, &request, follow_up);
                }
            }
            PeerEvent::Response(response) => {
                let follow_up = self.handle_response(&response);
                if let Some(peer) = self.peer.as_mut() {
                    peer.apply_follow_up(&mut self.modem, &response, follow_up);
                }
            }
            PeerEvent::DtlsEvent { level, description } => {
                logging::info!(self.log, "DTLS event";
                               "context" => "dtls",
                               "level" => ?level,
                               "description" => ?description);
                if level == AlertLevel::Fatal && self.coap_status && !self.reinitialize_transport()
                {
                    self.set_coap_status(false, now);
                }
            }
        }
    }

    fn heartbeat_outcome(&mut self, event: TransactionEvent, is_retry: bool, now: Instant) {
        match event {
            TransactionEvent::Ack => {
                logging::info!(self.log, "polling acknowledged, transport is working";
                               "context" => "polling");
            }
            TransactionEvent::Rst => {
                logging::info!(self.log, "polling rejected by server";
                               "context" => "polling");
            }
            TransactionEvent::Canceled => {}
            TransactionEvent::Timeout => {
                if is_retry {
                    logging::info!(self.log, "timeout after reinitialization, giving up until next interval";
                                   "context" => "polling");
                } else if !self.reinitialize_transport() {
                    logging::error!(self.log, "transport reinitialization failed";
                                    "context" => "polling");
                } else {
                    self.last_polling = Some(now - POLLING_INTERVAL_MINIMUM);
                    if self.check_for_commands_at(true, now) {
                        logging::info!(self.log, "transport reinitialized, re-polling";
                                       "context" => "polling");
                    } else {
                        logging::error!(self.log, "immediate re-polling failed";
                                        "context" => "polling");
                    }
                }
            }
        }
    }

    /// Manually initiate a check for waiting commands; also fired on the
    /// polling interval.
    pub fn check_for_commands(&mut self) -> bool {
        self.check_for_commands_at(false, Instant::now())
    }

    fn check_for_commands_at(&mut self, is_retry: bool, now: Instant) -> bool {
        if self.get_connection_status() != ConnectionStatus::RegisteredAndConnected {
            // A connection that has lingered down too long gets one
            // automatic rebuild per interval.
            let lingering = self.get_connection_status()
                == ConnectionStatus::RegisteredNotConnected
                && now >= self.last_coap_status_connected + REINIT_CONNECTION_INTERVAL;

            let mut recovered = false;
            if lingering {
                self.last_coap_status_connected = now;
                recovered = self.reinitialize_transport();
            }

            if !recovered {
                match self.next_polling {
                    Some(next) if next < now => {
                        self.next_polling = Some(now + POLLING_INTERVAL_MINIMUM);
                    }
                    _ => {
                        logging::warn!(self.log, "connection is offline, try again later";
                                       "context" => "polling");
                    }
                }
                return false;
            }
        }

        if let Some(last) = self.last_polling {
            if now.duration_since(last) < POLLING_INTERVAL_MINIMUM {
                logging::warn!(self.log, "polling too often";
                               "context" => "polling",
                               "seconds_since_last" => now.duration_since(last).as_secs());
                return false;
            }
        }

        let short_info = self.modem.short_host_device_information().to_owned();
        let sent = {
            let peer = match self.peer.as_mut() {
                Some(peer) => peer,
                None => return false,
            };

            let mut request = CoapMessage::new(
                CoapType::Confirmable,
                CoapCode::POST,
                peer.get_next_message_id(),
            );
            let (token, token_length) = peer.get_next_token();
            request.set_token(token, token_length);
            request.add_uri_path("v1");
            request.add_uri_path("Heartbeats");
            request.add_uri_query(&self.uri_query);
            request.add_host_device_information(short_info.as_bytes());

            self.last_polling_token = token;

            peer.send_reliably(
                &mut self.modem,
                &mut request,
                TxnTag::Heartbeat { is_retry },
                0,
            )
            .is_ok()
        };

        // Reset the timers whether this worked or not, to avoid hammering
        // the server on errors.
        self.last_polling = Some(now);
        if self.next_polling.is_some() && self.polling_interval.as_secs() > 0 {
            self.next_polling = Some(now + self.polling_interval);
        }

        if sent {
            logging::info!(self.log, "sent POST /v1/Heartbeats";
                           "context" => "polling",
                           "next_in_secs" => self.polling_interval.as_secs());
        }
        sent
    }

    pub fn send_text_command(&mut self, text: &str) -> CommandStatus {
        self.send_command(text.as_bytes(), false)
    }

    pub fn send_binary_command(&mut self, data: &[u8]) -> CommandStatus {
        self.send_command(data, true)
    }

    fn send_command(&mut self, data: &[u8], is_binary: bool) -> CommandStatus {
        if self.get_connection_status() != ConnectionStatus::RegisteredAndConnected {
            logging::error!(self.log, "connection is offline, try again later";
                            "context" => "send_command");
            return CommandStatus::Error;
        }
        if data.len() > MAX_COMMAND_LEN {
            logging::error!(self.log, "command exceeds maximum length";
                            "context" => "send_command",
                            "len" => data.len(),
                            "max" => MAX_COMMAND_LEN);
            return CommandStatus::CommandTooLong;
        }

        let short_info = self.modem.short_host_device_information().to_owned();
        let peer = match self.peer.as_mut() {
            Some(peer) => peer,
            None => return CommandStatus::Error,
        };

        let mut request = CoapMessage::new(
            CoapType::NonConfirmable,
            CoapCode::POST,
            peer.get_next_message_id(),
        );
        request.add_uri_path("v1");
        request.add_uri_path("Commands");
        request.add_uri_query(&self.uri_query);
        request.add_content_format(if is_binary {
            CONTENT_FORMAT_OCTET_STREAM
        } else {
            CONTENT_FORMAT_TEXT_PLAIN
        });
        request.add_host_device_information(short_info.as_bytes());
        request.payload = data.to_vec();

        match peer.send_unreliably(&mut self.modem, &mut request, 0, Duration::from_secs(0)) {
            Ok(()) => CommandStatus::Ok,
            Err(err) => {
                logging::error!(self.log, "failed sending command";
                                "context" => "send_command",
                                "error" => ?err);
                CommandStatus::Error
            }
        }
    }

    pub fn send_text_command_with_receipt_request(
        &mut self,
        text: &str,
        handler: ReceiptHandler,
    ) -> CommandStatus {
        self.send_command_with_receipt(text.as_bytes(), false, handler)
    }

    pub fn send_binary_command_with_receipt_request(
        &mut self,
        data: &[u8],
        handler: ReceiptHandler,
    ) -> CommandStatus {
        self.send_command_with_receipt(data, true, handler)
    }

    fn send_command_with_receipt(
        &mut self,
        data: &[u8],
        is_binary: bool,
        handler: ReceiptHandler,
    ) -> CommandStatus {
        if self.get_connection_status() != ConnectionStatus::RegisteredAndConnected {
            logging::error!(self.log, "connection is offline, try again later";
                            "context" => "send_command");
            return CommandStatus::Error;
        }
        if data.len() > MAX_COMMAND_LEN {
            logging::error!(self.log, "command exceeds maximum length";
                            "context" => "send_command",
                            "len" => data.len(),
                            "max" => MAX_COMMAND_LEN);
            return CommandStatus::CommandTooLong;
        }

        let short_info = self.modem.short_host_device_information().to_owned();
        let peer = match self.peer.as_mut() {
            Some(peer) => peer,
            None => return CommandStatus::Error,
        };

        let mut request = CoapMessage::new(
            CoapType::Confirmable,
            CoapCode::POST,
            peer.get_next_message_id(),
        );
        request.add_uri_path("v1");
        request.add_uri_path("Commands");
        request.add_uri_query(&self.uri_query);
        request.add_content_format(if is_binary {
            CONTENT_FORMAT_OCTET_STREAM
        } else {
            CONTENT_FORMAT_TEXT_PLAIN
        });
        request.add_host_device_information(short_info.as_bytes());
        request.payload = data.to_vec();

        match peer.send_reliably(&mut self.modem, &mut request, TxnTag::Receipt(handler), 0) {
            Ok(()) => CommandStatus::Ok,
            Err(err) => {
                logging::error!(self.log, "failed sending command";
                                "context" => "send_command",
                                "error" => ?err);
                CommandStatus::Error
            }
        }
    }

    pub fn has_waiting_command(&self) -> bool {
        !self.commands.is_empty()
    }

    /// Pop the oldest waiting command.
    pub fn receive_command(&mut self) -> Result<Command, CommandStatus> {
        self.commands
            .pop_front()
            .ok_or(CommandStatus::NoCommandWaiting)
    }

    /// Pop the oldest waiting command into a caller buffer. Returns the
    /// number of bytes written and the binary flag.
    pub fn receive_command_into(&mut self, buf: &mut [u8]) -> Result<(usize, bool), CommandStatus> {
        let front_len = match self.commands.front() {
            Some(command) => command.data.len(),
            None => return Err(CommandStatus::NoCommandWaiting),
        };
        if front_len > buf.len() {
            return Err(CommandStatus::BufferTooSmall);
        }

        let command = self.commands.pop_front().expect("Front checked above");
        buf[..front_len].copy_from_slice(&command.data);
        Ok((front_len, command.is_binary))
    }

    /// Last queued-command count reported by the server.
    pub fn queued_command_count(&self) -> u64 {
        self.queued_command_count
    }

    pub fn get_gnss_data(&mut self) -> Option<GnssData> {
        self.gnss.as_mut()?.poll().ok()
    }

    fn handle_request(&mut self, request: &CoapMessage) -> FollowUp {
        if request.code == CoapCode::GET {
            if request.first_uri_path() == Some("HostDeviceInformation") {
                logging::info!(self.log, "answering host device information request";
                               "context" => "rx");

                let mtype = if request.mtype == CoapType::Confirmable {
                    CoapType::Acknowledgement
                } else {
                    CoapType::NonConfirmable
                };
                let mut response = CoapMessage::response_to(request, mtype, CoapCode::CONTENT);
                response.add_content_format(CONTENT_FORMAT_TEXT_PLAIN);
                response.payload = self.modem.host_device_information().as_bytes().to_vec();

                if let Some(peer) = self.peer.as_mut() {
                    if let Err(err) =
                        peer.send_unreliably(&mut self.modem, &mut response, 0, Duration::from_secs(0))
                    {
                        logging::error!(self.log, "failed answering request";
                                        "context" => "rx",
                                        "error" => ?err);
                    }
                }
                return FollowUp::DoNothing;
            }

            logging::warn!(self.log, "unhandled GET"; "context" => "rx");
            return FollowUp::SendReset;
        }

        if request.code == CoapCode::POST {
            let content_format = request.content_format();
            let is_text = content_format == Some(CONTENT_FORMAT_TEXT_PLAIN);
            let is_binary = content_format == Some(CONTENT_FORMAT_OCTET_STREAM);

            if (is_text || is_binary) && request.first_uri_path() == Some("Commands") {
                logging::info!(self.log, "received command"; "context" => "rx",
                               "bytes" => request.payload.len(),
                               "binary" => is_binary);
                if self.received_command_internal(&request.payload, is_binary) {
                    return FollowUp::SendAcknowledgement;
                }
                return FollowUp::DoNothing;
            }

            logging::warn!(self.log, "unhandled POST"; "context" => "rx");
            return FollowUp::SendReset;
        }

        logging::warn!(self.log, "unhandled request";
                       "context" => "rx",
                       "class" => request.code.class,
                       "detail" => request.code.detail);
        FollowUp::SendReset
    }

    fn handle_response(&mut self, response: &CoapMessage) -> FollowUp {
        if response.code == CoapCode::CREATED {
            if response.token == self.last_polling_token {
                if let Some(count) = response.uint_option(number::QUEUED_COMMAND_COUNT) {
                    self.queued_command_count = count;
                }
                logging::info!(self.log, "heartbeat response";
                               "context" => "rx",
                               "queued_command_count" => self.queued_command_count);
                return FollowUp::SendAcknowledgement;
            }

            logging::warn!(self.log, "2.01 Created for unknown request"; "context" => "rx");
            return FollowUp::SendReset;
        }

        logging::warn!(self.log, "unhandled response";
                       "context" => "rx",
                       "class" => response.code.class,
                       "detail" => response.code.detail);
        FollowUp::SendReset
    }

    /// Deliver a command to the handler, or queue it with drop-oldest.
    fn received_command_internal(&mut self, data: &[u8], is_binary: bool) -> bool {
        if let Some(handler) = self.command_handler.as_mut() {
            handler(data, is_binary);
            return true;
        }

        if self.commands.len() >= MAX_PENDING_COMMANDS {
            logging::warn!(self.log, "command queue full, dropping the oldest";
                           "context" => "rx");
            self.commands.pop_front();
        }
        self.commands.push_back(Command {
            data: data.to_vec(),
            is_binary,
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coap::option::number;
    use crate::testing::{MockDtlsEngine, MockModem};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn plaintext_config() -> DeviceConfig {
        let mut config = DeviceConfig::default();
        config.server.host = "203.0.113.7".to_owned();
        config.server.use_dtls = false;
        config.device.polling_interval_secs = 60;
        config.modem.attach_timeout_secs = 2;
        config
    }

    fn powered_device(config: DeviceConfig) -> Device<MockModem> {
        let mut device = Device::new(MockModem::new(), config, logging::null());
        device.power_module_on().unwrap();
        device
    }

    fn transport_socket(device: &Device<MockModem>) -> u8 {
        device.peer.as_ref().unwrap().socket_id().unwrap()
    }

    fn heartbeat_posts(device: &mut Device<MockModem>) -> Vec<CoapMessage> {
        device
            .modem
            .serial_mut()
            .sent_datagrams
            .iter()
            .filter_map(|(_, data)| CoapMessage::decode(data).ok())
            .filter(|message| {
                message.code == CoapCode::POST
                    && message
                        .options
                        .iter()
                        .any(|option| match &option.value {
                            crate::coap::option::OptionValue::Str(text) => {
                                option.number == number::URI_PATH && text == "Heartbeats"
                            }
                            _ => false,
                        })
            })
            .collect()
    }

    #[test]
    fn test_power_on_derives_identity_from_iccid() {
        let device = powered_device(plaintext_config());

        assert_eq!(device.iccid, "8988307000000000000");
        assert_eq!(device.uri_query, "Sim=8988307000000000000");
        assert_eq!(
            device.get_connection_status(),
            ConnectionStatus::RegisteredAndConnected
        );
    }

    #[test]
    fn test_configuration_locked_after_power_on() {
        let mut device = Device::new(MockModem::new(), plaintext_config(), logging::null());

        assert!(device.set_purpose("Fridge"));
        assert!(!device.set_purpose(""));
        assert!(!device.set_purpose(&"x".repeat(33)));
        assert!(device.set_psk_key("000102030405060708090a0b0c0d0e0f"));
        assert!(!device.set_psk_key("zz"));
        assert!(!device.set_psk_key("0011"));

        device.power_module_on().unwrap();
        assert!(!device.set_purpose("Too-Late"));
        assert!(!device.set_psk_key("000102030405060708090a0b0c0d0e0f"));
    }

    #[test]
    fn test_idle_polling_at_interval() {
        let mut device = powered_device(plaintext_config());
        let handled = Rc::new(RefCell::new(0u32));
        let handled_in_cb = Rc::clone(&handled);
        device.set_command_handler(Box::new(move |_, _| {
            *handled_in_cb.borrow_mut() += 1;
        }));

        let start = Instant::now();
        device.spin_at(start);

        let posts = heartbeat_posts(&mut device);
        assert_eq!(posts.len(), 1);
        let heartbeat = &posts[0];
        assert_eq!(heartbeat.mtype, CoapType::Confirmable);
        assert_eq!(
            heartbeat.string_option(number::URI_QUERY),
            Some("Sim=8988307000000000000")
        );

        // 2.01 Created, piggybacked, with Queued-Command-Count = 0.
        let mut response = CoapMessage::new(
            CoapType::Acknowledgement,
            CoapCode::CREATED,
            heartbeat.message_id,
        );
        response.set_token(heartbeat.token, heartbeat.token_length);
        response.add_queued_command_count(0);
        let wire = response.encode().unwrap();

        let socket = transport_socket(&device);
        device.modem.serial_mut().deliver_datagram(socket, None, &wire);
        device.spin_at(start + Duration::from_secs(1));

        assert_eq!(device.queued_command_count(), 0);
        assert_eq!(*handled.borrow(), 0);

        // Next poll fires only after the interval.
        device.spin_at(start + Duration::from_secs(30));
        assert_eq!(heartbeat_posts(&mut device).len(), 1);
        device.spin_at(start + Duration::from_secs(61));
        assert_eq!(heartbeat_posts(&mut device).len(), 2);
    }

    #[test]
    fn test_incoming_text_command_and_duplicate() {
        let mut device = powered_device(plaintext_config());
        let socket = transport_socket(&device);

        let mut request = CoapMessage::new(CoapType::Confirmable, CoapCode::POST, 0x7777);
        request.add_uri_path("Commands");
        request.add_content_format(CONTENT_FORMAT_TEXT_PLAIN);
        request.payload = b"hello".to_vec();
        let wire = request.encode().unwrap();

        device
            .modem
            .serial_mut()
            .deliver_datagram(socket, None, &wire);
        device.spin();

        assert!(device.has_waiting_command());
        let command = device.receive_command().unwrap();
        assert_eq!(command.data, b"hello");
        assert!(!command.is_binary);

        let first_ack = device
            .modem
            .serial_mut()
            .sent_datagrams
            .last()
            .unwrap()
            .1
            .clone();
        let decoded = CoapMessage::decode(&first_ack).unwrap();
        assert_eq!(decoded.mtype, CoapType::Acknowledgement);
        assert_eq!(decoded.message_id, 0x7777);

        // Identical message-id within EXCHANGE_LIFETIME: no duplicate in the
        // queue, identical ACK on the wire.
        device
            .modem
            .serial_mut()
            .deliver_datagram(socket, None, &wire);
        device.spin();

        assert!(!device.has_waiting_command());
        let replayed = device
            .modem
            .serial_mut()
            .sent_datagrams
            .last()
            .unwrap()
            .1
            .clone();
        assert_eq!(replayed, first_ack);
        assert_eq!(
            device.receive_command().unwrap_err(),
            CommandStatus::NoCommandWaiting
        );
    }

    #[test]
    fn test_command_receipt_confirmed_exactly_once() {
        let mut config = plaintext_config();
        config.device.polling_interval_secs = 0;
        let mut device = powered_device(config);

        let receipts = Rc::new(RefCell::new(Vec::new()));
        let receipts_in_cb = Rc::clone(&receipts);
        let status = device.send_text_command_with_receipt_request(
            "ping",
            Box::new(move |receipt| receipts_in_cb.borrow_mut().push(receipt)),
        );
        assert_eq!(status, CommandStatus::Ok);

        let sent = device
            .modem
            .serial_mut()
            .sent_datagrams
            .last()
            .unwrap()
            .1
            .clone();
        let request = CoapMessage::decode(&sent).unwrap();
        assert_eq!(request.mtype, CoapType::Confirmable);
        assert_eq!(request.payload, b"ping");

        let ack = CoapMessage::new(
            CoapType::Acknowledgement,
            CoapCode::EMPTY,
            request.message_id,
        )
        .encode()
        .unwrap();

        let socket = transport_socket(&device);
        device.modem.serial_mut().deliver_datagram(socket, None, &ack);
        device.spin();
        assert_eq!(&*receipts.borrow(), &[CommandReceipt::ConfirmedDelivery]);

        // A second identical empty ACK must not re-fire the callback.
        device.modem.serial_mut().deliver_datagram(socket, None, &ack);
        device.spin();
        assert_eq!(&*receipts.borrow(), &[CommandReceipt::ConfirmedDelivery]);
    }

    #[test]
    fn test_retransmission_then_timeout_receipt() {
        let mut config = plaintext_config();
        config.device.polling_interval_secs = 0;
        let mut device = powered_device(config);

        let receipts = Rc::new(RefCell::new(Vec::new()));
        let receipts_in_cb = Rc::clone(&receipts);
        device.send_text_command_with_receipt_request(
            "ping",
            Box::new(move |receipt| receipts_in_cb.borrow_mut().push(receipt)),
        );

        let command_wire = device
            .modem
            .serial_mut()
            .sent_datagrams
            .last()
            .unwrap()
            .1
            .clone();

        let start = Instant::now();
        // Past the nominal deadlines I0, 3*I0, 7*I0 (I0 <= 7.5 s).
        device.spin_at(start + Duration::from_secs(8));
        device.spin_at(start + Duration::from_secs(24));
        device.spin_at(start + Duration::from_secs(56));
        assert!(receipts.borrow().is_empty());

        let transmissions = device
            .modem
            .serial_mut()
            .sent_datagrams
            .iter()
            .filter(|(_, data)| *data == command_wire)
            .count();
        assert_eq!(transmissions, 4);

        // Fourth deadline is at 15*I0 <= 112.5 s.
        device.spin_at(start + Duration::from_secs(120));
        assert_eq!(&*receipts.borrow(), &[CommandReceipt::Timeout]);

        let transmissions = device
            .modem
            .serial_mut()
            .sent_datagrams
            .iter()
            .filter(|(_, data)| *data == command_wire)
            .count();
        assert_eq!(transmissions, 4);
    }

    #[test]
    fn test_heartbeat_timeout_reinitializes_and_retries_once() {
        let mut config = plaintext_config();
        config.device.polling_interval_secs = 0;
        let mut device = powered_device(config);

        assert!(device.check_for_commands());
        assert_eq!(heartbeat_posts(&mut device).len(), 1);

        let start = Instant::now();
        // Drive the first heartbeat through all four transmissions and into
        // timeout; the façade reinitializes and re-polls exactly once.
        device.spin_at(start + Duration::from_secs(8));
        device.spin_at(start + Duration::from_secs(24));
        device.spin_at(start + Duration::from_secs(56));
        device.spin_at(start + Duration::from_secs(120));

        let ids: std::collections::HashSet<u16> = heartbeat_posts(&mut device)
            .iter()
            .map(|message| message.message_id)
            .collect();
        assert_eq!(ids.len(), 2);

        // The retry heartbeat also times out; no third poll is started.
        device.spin_at(start + Duration::from_secs(128));
        device.spin_at(start + Duration::from_secs(144));
        device.spin_at(start + Duration::from_secs(176));
        device.spin_at(start + Duration::from_secs(240));

        let ids: std::collections::HashSet<u16> = heartbeat_posts(&mut device)
            .iter()
            .map(|message| message.message_id)
            .collect();
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn test_oversized_command_rejected_without_traffic() {
        let mut device = powered_device(plaintext_config());
        let sent_before = device.modem.serial_mut().sent_datagrams.len();

        let oversized = "x".repeat(MAX_COMMAND_LEN + 1);
        assert_eq!(
            device.send_text_command(&oversized),
            CommandStatus::CommandTooLong
        );
        assert_eq!(
            device.modem.serial_mut().sent_datagrams.len(),
            sent_before
        );
    }

    #[test]
    fn test_send_command_builds_non_post() {
        let mut config = plaintext_config();
        config.device.polling_interval_secs = 0;
        let mut device = powered_device(config);

        assert_eq!(device.send_text_command("report"), CommandStatus::Ok);

        let sent = device
            .modem
            .serial_mut()
            .sent_datagrams
            .last()
            .unwrap()
            .1
            .clone();
        let message = CoapMessage::decode(&sent).unwrap();
        assert_eq!(message.mtype, CoapType::NonConfirmable);
        assert_eq!(message.code, CoapCode::POST);
        assert_eq!(message.content_format(), Some(CONTENT_FORMAT_TEXT_PLAIN));
        assert_eq!(
            message.string_option(number::URI_QUERY),
            Some("Sim=8988307000000000000")
        );
        assert!(message
            .opaque_option(number::HOST_DEVICE_INFORMATION)
            .is_some());
        assert_eq!(message.payload, b"report");
    }

    #[test]
    fn test_command_queue_drop_oldest() {
        let mut config = plaintext_config();
        config.device.polling_interval_secs = 0;
        let mut device = powered_device(config);
        let socket = transport_socket(&device);

        for index in 0..(MAX_PENDING_COMMANDS + 5) {
            let mut request = CoapMessage::new(
                CoapType::NonConfirmable,
                CoapCode::POST,
                index as u16,
            );
            request.add_uri_path("Commands");
            request.add_content_format(CONTENT_FORMAT_TEXT_PLAIN);
            request.payload = format!("cmd-{}", index).into_bytes();
            device
                .modem
                .serial_mut()
                .deliver_datagram(socket, None, &request.encode().unwrap());
            device.spin();
        }

        assert_eq!(device.commands.len(), MAX_PENDING_COMMANDS);
        assert_eq!(device.receive_command().unwrap().data, b"cmd-5");
    }

    #[test]
    fn test_receive_command_into_buffer_too_small() {
        let mut config = plaintext_config();
        config.device.polling_interval_secs = 0;
        let mut device = powered_device(config);

        device.received_command_internal(b"hello", false);

        let mut tiny = [0u8; 2];
        assert_eq!(
            device.receive_command_into(&mut tiny),
            Err(CommandStatus::BufferTooSmall)
        );

        let mut buf = [0u8; 16];
        let (len, is_binary) = device.receive_command_into(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert!(!is_binary);
    }

    #[test]
    fn test_host_device_information_request_gets_content() {
        let mut config = plaintext_config();
        config.device.polling_interval_secs = 0;
        let mut device = powered_device(config);
        let socket = transport_socket(&device);

        let mut request = CoapMessage::new(CoapType::Confirmable, CoapCode::GET, 0x2222);
        request.set_token(0xAB, 1);
        request.add_uri_path("HostDeviceInformation");
        device
            .modem
            .serial_mut()
            .deliver_datagram(socket, None, &request.encode().unwrap());
        device.spin();

        let sent = device
            .modem
            .serial_mut()
            .sent_datagrams
            .last()
            .unwrap()
            .1
            .clone();
        let response = CoapMessage::decode(&sent).unwrap();
        assert_eq!(response.mtype, CoapType::Acknowledgement);
        assert_eq!(response.code, CoapCode::CONTENT);
        assert_eq!(response.token, 0xAB);
        assert!(!response.payload.is_empty());
    }

    #[test]
    fn test_dtls_transport_recovery_notifies_single_transition() {
        let mut config = plaintext_config();
        config.server.use_dtls = true;
        config.device.psk_key = "000102030405060708090a0b0c0d0e0f".to_owned();
        config.device.polling_interval_secs = 60;

        let mut device = Device::new(MockModem::new(), config, logging::null())
            .with_dtls_engine(MockDtlsEngine::instant_factory());
        device.power_module_on().unwrap();
        assert_eq!(
            device.get_connection_status(),
            ConnectionStatus::RegisteredAndConnected
        );

        let statuses = Rc::new(RefCell::new(Vec::new()));
        let statuses_in_cb = Rc::clone(&statuses);
        device.set_connection_status_handler(Box::new(move |status| {
            statuses_in_cb.borrow_mut().push(status);
        }));

        // Knock the transport down.
        let t0 = Instant::now();
        device.set_coap_status(false, t0);
        assert_eq!(
            &*statuses.borrow(),
            &[ConnectionStatus::RegisteredNotConnected]
        );

        // After the lingering interval, polling rebuilds the session; the
        // instant-handshake engine succeeds within one retry.
        device.spin_at(t0 + REINIT_CONNECTION_INTERVAL + Duration::from_secs(1));

        let recorded = statuses.borrow();
        let reconnects = recorded
            .iter()
            .filter(|status| **status == ConnectionStatus::RegisteredAndConnected)
            .count();
        assert_eq!(reconnects, 1);
        assert_eq!(
            device.get_connection_status(),
            ConnectionStatus::RegisteredAndConnected
        );
    }

    #[test]
    fn test_dtls_fatal_alert_triggers_rebuild() {
        let mut config = plaintext_config();
        config.server.use_dtls = true;
        config.device.psk_key = "000102030405060708090a0b0c0d0e0f".to_owned();
        config.device.polling_interval_secs = 0;

        let mut device = Device::new(MockModem::new(), config, logging::null())
            .with_dtls_engine(MockDtlsEngine::instant_factory());
        device.power_module_on().unwrap();

        let socket = transport_socket(&device);
        device
            .modem
            .serial_mut()
            .deliver_datagram(socket, None, MockDtlsEngine::FATAL_ALERT);
        device.spin();

        // Rebuilt instantly; still connected and still sendable.
        assert_eq!(
            device.get_connection_status(),
            ConnectionStatus::RegisteredAndConnected
        );
        assert_eq!(device.send_text_command("still-up"), CommandStatus::Ok);
    }

    #[test]
    fn test_stateless_observer_sees_every_message() {
        let mut config = plaintext_config();
        config.device.polling_interval_secs = 0;
        let mut device = powered_device(config);
        let socket = transport_socket(&device);

        let observed = Rc::new(RefCell::new(Vec::new()));
        let observed_in_cb = Rc::clone(&observed);
        device.set_stateless_message_handler(Box::new(move |message| {
            observed_in_cb.borrow_mut().push(message.message_id);
        }));

        let mut request = CoapMessage::new(CoapType::Confirmable, CoapCode::POST, 0x3131);
        request.add_uri_path("Commands");
        request.add_content_format(CONTENT_FORMAT_TEXT_PLAIN);
        request.payload = b"hi".to_vec();
        device
            .modem
            .serial_mut()
            .deliver_datagram(socket, None, &request.encode().unwrap());
        device.spin();

        // A ping is dropped by the demux, but the observer still sees it.
        let ping = CoapMessage::new(CoapType::Confirmable, CoapCode::EMPTY, 0x3232)
            .encode()
            .unwrap();
        device.modem.serial_mut().deliver_datagram(socket, None, &ping);
        device.spin();

        assert_eq!(&*observed.borrow(), &[0x3131, 0x3232]);
    }

    #[test]
    fn test_polling_disabled_with_zero_interval() {
        let mut config = plaintext_config();
        config.device.polling_interval_secs = 0;
        let mut device = powered_device(config);

        let start = Instant::now();
        device.spin_at(start + Duration::from_secs(3600));
        assert!(heartbeat_posts(&mut device).is_empty());

        // Re-enabling arms the timer.
        device.set_polling_interval(60);
        device.spin_at(start + Duration::from_secs(3601));
        assert_eq!(heartbeat_posts(&mut device).len(), 1);
    }
}
