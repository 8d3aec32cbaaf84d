//! Typed wrappers over the modem's AT socket commands plus the URC-driven
//! receive queues.
//!
//! The URC handlers only touch counters and flags in the socket table; actual
//! receives are issued by the `handle_waiting_data` pump, which drains the
//! outstanding counters in FIFO order and hands the resulting datagrams up as
//! `SocketEvent`s.

use crate::modem::at::filter_response;
use crate::modem::{Modem, ModemCore, ModemError, ModemModel, ModemResult};
use flint::{hex, logging};
use std::io;
use std::time::Duration;

pub const MAX_SOCKETS: usize = 7;
/// Single-datagram payload cap on the wire (ASCII-hex mode).
pub const MAX_DATAGRAM: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketProtocol {
    None,
    Tcp,
    Udp,
}

impl SocketProtocol {
    #[inline]
    fn wire(self) -> u8 {
        match self {
            SocketProtocol::Tcp => 6,
            SocketProtocol::Udp => 17,
            SocketProtocol::None => 0,
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum SocketError {
    BadSocket,
    NotOpen,
    NotConnected,
    WrongProtocol,
    /// Payload or requested length exceeds the 512-byte wire limit.
    InvalidArgument,
    Modem(ModemError),
}

impl From<ModemError> for SocketError {
    fn from(err: ModemError) -> Self {
        SocketError::Modem(err)
    }
}

pub type SocketResult<T> = Result<T, SocketError>;

#[derive(Debug, Clone, Copy)]
pub struct SocketSlot {
    pub is_opened: bool,
    pub is_connected: bool,
    pub protocol: SocketProtocol,
    pub queued_receive: usize,
    pub queued_receive_from: usize,
    pub notify_closed: bool,
}

impl SocketSlot {
    fn closed() -> SocketSlot {
        SocketSlot {
            is_opened: false,
            is_connected: false,
            protocol: SocketProtocol::None,
            queued_receive: 0,
            queued_receive_from: 0,
            notify_closed: false,
        }
    }

    fn set_opened(&mut self, protocol: SocketProtocol) {
        self.is_opened = true;
        self.is_connected = false;
        self.protocol = protocol;
        self.queued_receive = 0;
        self.queued_receive_from = 0;
        self.notify_closed = false;
    }

    fn set_closed(&mut self) {
        self.is_opened = false;
        self.is_connected = false;
        // Queued counters stay; data may still be buffered modem-side.
        self.protocol = SocketProtocol::None;
        self.notify_closed = false;
    }
}

/// Something the socket layer observed asynchronously and handed upward.
#[derive(Debug, PartialEq)]
pub enum SocketEvent {
    Datagram {
        socket: u8,
        remote: Option<(String, u16)>,
        data: Vec<u8>,
    },
    Closed {
        socket: u8,
    },
    Accepted {
        socket: u8,
        listener: u8,
        remote: (String, u16),
    },
}

pub struct SocketTable {
    pub slots: [SocketSlot; MAX_SOCKETS],
    pending: Vec<SocketEvent>,
}

impl SocketTable {
    pub fn new() -> SocketTable {
        SocketTable {
            slots: [SocketSlot::closed(); MAX_SOCKETS],
            pending: Vec::new(),
        }
    }

    #[inline]
    pub fn slot(&self, socket: u8) -> Option<&SocketSlot> {
        self.slots.get(socket as usize)
    }

    #[inline]
    fn take_pending(&mut self) -> Vec<SocketEvent> {
        std::mem::replace(&mut self.pending, Vec::new())
    }
}

fn parse_fields(data: &str) -> Vec<&str> {
    data.split(',')
        .map(|field| field.trim().trim_matches('"'))
        .collect()
}

fn parse_socket(field: &str) -> Option<usize> {
    let socket: usize = field.parse().ok()?;
    if socket < MAX_SOCKETS {
        Some(socket)
    } else {
        None
    }
}

/// URC entry point registered with the AT engine. Ordered by the expected
/// frequency of arrival.
pub fn process_urc(core: &mut ModemCore, code: &str, data: &str) -> bool {
    match code {
        "+UUSORF" => urc_receive_from(core, data),
        "+UUSORD" => urc_receive(core, data),
        "+UUSOLI" => urc_accept(core, data),
        "+UUSOCO" => urc_connected(core, data),
        "+UUSOCL" => urc_closed(core, data),
        _ => return false,
    }
    true
}

fn urc_receive(core: &mut ModemCore, data: &str) {
    let fields = parse_fields(data);
    match (
        fields.get(0).and_then(|field| parse_socket(field)),
        fields.get(1).and_then(|field| field.parse::<usize>().ok()),
    ) {
        (Some(socket), Some(length)) => {
            if !core.sockets.slots[socket].is_connected {
                logging::warn!(core.log, "data event on unconnected socket";
                               "context" => "urc",
                               "socket" => socket);
            }
            core.sockets.slots[socket].queued_receive = length;
        }
        _ => logging::error!(core.log, "bad +UUSORD"; "context" => "urc", "data" => data),
    }
}

fn urc_receive_from(core: &mut ModemCore, data: &str) {
    let fields = parse_fields(data);
    match (
        fields.get(0).and_then(|field| parse_socket(field)),
        fields.get(1).and_then(|field| field.parse::<usize>().ok()),
    ) {
        (Some(socket), Some(length)) => core.sockets.slots[socket].queued_receive_from = length,
        _ => logging::error!(core.log, "bad +UUSORF"; "context" => "urc", "data" => data),
    }
}

fn urc_connected(core: &mut ModemCore, data: &str) {
    let fields = parse_fields(data);
    match (
        fields.get(0).and_then(|field| parse_socket(field)),
        fields.get(1).and_then(|field| field.parse::<i32>().ok()),
    ) {
        (Some(socket), Some(error)) => {
            core.sockets.slots[socket].is_connected = error == 0;
            if error != 0 {
                logging::error!(core.log, "asynchronous connect failed";
                                "context" => "urc",
                                "socket" => socket,
                                "error" => error);
            }
        }
        _ => logging::error!(core.log, "bad +UUSOCO"; "context" => "urc", "data" => data),
    }
}

fn urc_closed(core: &mut ModemCore, data: &str) {
    let fields = parse_fields(data);
    match fields.get(0).and_then(|field| parse_socket(field)) {
        Some(socket) => {
            core.sockets.slots[socket].is_connected = false;
            core.sockets.pending.push(SocketEvent::Closed { socket: socket as u8 });
        }
        None => logging::error!(core.log, "bad +UUSOCL"; "context" => "urc", "data" => data),
    }
}

fn urc_accept(core: &mut ModemCore, data: &str) {
    let fields = parse_fields(data);
    if fields.len() < 4 {
        logging::error!(core.log, "bad +UUSOLI"; "context" => "urc", "data" => data);
        return;
    }

    let new_socket = fields.get(0).and_then(|field| parse_socket(field));
    let listener = fields.get(3).and_then(|field| parse_socket(field));
    let remote_port = fields.get(2).and_then(|field| field.parse::<u16>().ok());

    match (new_socket, listener, remote_port) {
        (Some(new_socket), Some(listener), Some(remote_port)) => {
            let notify = core.sockets.slots[listener].notify_closed;
            let slot = &mut core.sockets.slots[new_socket];
            slot.set_opened(SocketProtocol::Tcp);
            slot.is_connected = true;
            slot.notify_closed = notify;

            core.sockets.pending.push(SocketEvent::Accepted {
                socket: new_socket as u8,
                listener: listener as u8,
                remote: (fields[1].to_owned(), remote_port),
            });
        }
        _ => logging::error!(core.log, "bad +UUSOLI"; "context" => "urc", "data" => data),
    }
}

impl<S: io::Read + io::Write> Modem<S> {
    fn check_socket(&self, socket: u8) -> SocketResult<SocketSlot> {
        self.core()
            .sockets
            .slot(socket)
            .copied()
            .ok_or(SocketError::BadSocket)
    }

    /// Open a socket, optionally bound to a local port.
    pub fn socket_open(&mut self, protocol: SocketProtocol, local_port: u16) -> SocketResult<u8> {
        let command = format!("AT+USOCR={},{}", protocol.wire(), local_port);
        let body = self.command_ok(&command, Duration::from_secs(3))?;

        let socket: u8 = filter_response("+USOCR: ", &body)
            .trim()
            .parse()
            .map_err(|_| SocketError::Modem(ModemError::Parse))?;
        if socket as usize >= MAX_SOCKETS {
            return Err(SocketError::BadSocket);
        }

        self.core_mut().sockets.slots[socket as usize].set_opened(protocol);
        Ok(socket)
    }

    pub fn socket_close(&mut self, socket: u8) -> SocketResult<()> {
        let slot = self.check_socket(socket)?;

        let command = match slot.protocol {
            SocketProtocol::Tcp => format!("AT+USOCL={},0", socket),
            _ => format!("AT+USOCL={}", socket),
        };
        self.command_ok(&command, Duration::from_secs(120))?;

        self.core_mut().sockets.slots[socket as usize].set_closed();
        Ok(())
    }

    /// Code of the last socket error reported by the modem.
    pub fn socket_get_error(&mut self) -> ModemResult<i32> {
        let body = self.command_ok("AT+USOER", Duration::from_secs(1))?;
        filter_response("+USOER: ", &body)
            .trim()
            .parse()
            .map_err(|_| ModemError::Parse)
    }

    /// Connect a socket to a remote peer. Works for both UDP and TCP; for
    /// UDP it enables plain `send`/`receive` without per-datagram addresses.
    pub fn socket_connect(
        &mut self,
        socket: u8,
        remote_ip: &str,
        remote_port: u16,
        notify_closed: bool,
    ) -> SocketResult<()> {
        let slot = self.check_socket(socket)?;
        if !slot.is_opened {
            return Err(SocketError::NotOpen);
        }

        self.core_mut().sockets.slots[socket as usize].is_connected = false;

        let command = match slot.protocol {
            SocketProtocol::Tcp => format!("AT+USOCO={},\"{}\",{},0", socket, remote_ip, remote_port),
            SocketProtocol::Udp => format!("AT+USOCO={},\"{}\",{}", socket, remote_ip, remote_port),
            SocketProtocol::None => return Err(SocketError::WrongProtocol),
        };
        self.command_ok(&command, Duration::from_secs(120))?;

        let slot = &mut self.core_mut().sockets.slots[socket as usize];
        slot.is_connected = true;
        slot.notify_closed = notify_closed;
        Ok(())
    }

    fn socket_write(&mut self, socket: u8, data: &[u8]) -> SocketResult<usize> {
        let command = format!(
            "AT+USOWR={},{},\"{}\"",
            socket,
            data.len(),
            hex::encode(data)
        );
        let body = self.command_ok(&command, Duration::from_secs(120))?;

        let filtered = filter_response("+USOWR: ", &body);
        let fields = parse_fields(&filtered);
        fields
            .get(1)
            .and_then(|field| field.parse().ok())
            .ok_or(SocketError::Modem(ModemError::Parse))
    }

    pub fn socket_send_udp(&mut self, socket: u8, data: &[u8]) -> SocketResult<usize> {
        let slot = self.check_socket(socket)?;
        if data.len() > MAX_DATAGRAM {
            return Err(SocketError::InvalidArgument);
        }
        if !slot.is_opened {
            return Err(SocketError::NotOpen);
        }
        if !slot.is_connected {
            // Unconnected UDP sockets need sendTo with an explicit address.
            return Err(SocketError::NotConnected);
        }
        if slot.protocol != SocketProtocol::Udp {
            return Err(SocketError::WrongProtocol);
        }

        self.socket_write(socket, data)
    }

    pub fn socket_send_tcp(&mut self, socket: u8, data: &[u8]) -> SocketResult<usize> {
        let slot = self.check_socket(socket)?;
        if data.len() > MAX_DATAGRAM {
            return Err(SocketError::InvalidArgument);
        }
        if !slot.is_opened {
            return Err(SocketError::NotOpen);
        }
        if !slot.is_connected {
            return Err(SocketError::NotConnected);
        }
        if slot.protocol != SocketProtocol::Tcp {
            return Err(SocketError::WrongProtocol);
        }

        self.socket_write(socket, data)
    }

    pub fn socket_send_to_udp(
        &mut self,
        socket: u8,
        remote_ip: &str,
        remote_port: u16,
        data: &[u8],
    ) -> SocketResult<usize> {
        let slot = self.check_socket(socket)?;
        if data.len() > MAX_DATAGRAM {
            return Err(SocketError::InvalidArgument);
        }
        if !slot.is_opened {
            return Err(SocketError::NotOpen);
        }
        if slot.protocol != SocketProtocol::Udp {
            return Err(SocketError::WrongProtocol);
        }

        let command = format!(
            "AT+USOST={},\"{}\",{},{},\"{}\"",
            socket,
            remote_ip,
            remote_port,
            data.len(),
            hex::encode(data)
        );
        let body = self.command_ok(&command, Duration::from_secs(10))?;

        let filtered = filter_response("+USOST: ", &body);
        let fields = parse_fields(&filtered);
        fields
            .get(1)
            .and_then(|field| field.parse().ok())
            .ok_or(SocketError::Modem(ModemError::Parse))
    }

    fn socket_read(&mut self, socket: u8, mut length: usize) -> SocketResult<Vec<u8>> {
        loop {
            if length > MAX_DATAGRAM {
                return Err(SocketError::InvalidArgument);
            }

            let command = format!("AT+USORD={},{}", socket, length);
            let body = self.command_ok(&command, Duration::from_secs(1))?;

            let filtered = filter_response("+USORD: ", &body);
            let fields = parse_fields(&filtered);
            if fields.len() < 2 {
                return Err(SocketError::Modem(ModemError::Parse));
            }

            if length == 0 {
                // Length discovery round: re-issue with the reported size.
                let available: usize = fields[1]
                    .parse()
                    .map_err(|_| SocketError::Modem(ModemError::Parse))?;
                if available == 0 {
                    return Ok(Vec::new());
                }
                length = available;
                continue;
            }

            let reported: usize = fields[1]
                .parse()
                .map_err(|_| SocketError::Modem(ModemError::Parse))?;
            let data = match fields.get(2) {
                Some(payload) => {
                    hex::decode(payload).ok_or(SocketError::Modem(ModemError::Parse))?
                }
                None => Vec::new(),
            };
            if data.len() != reported {
                logging::error!(self.core().log, "payload length does not match indicator";
                                "context" => "socket_read",
                                "socket" => socket,
                                "indicated" => reported,
                                "decoded" => data.len());
            }
            return Ok(data);
        }
    }

    pub fn socket_receive_udp(&mut self, socket: u8, length: usize) -> SocketResult<Vec<u8>> {
        let slot = self.check_socket(socket)?;
        if length > MAX_DATAGRAM {
            return Err(SocketError::InvalidArgument);
        }
        if !slot.is_opened {
            return Err(SocketError::NotOpen);
        }
        if !slot.is_connected {
            return Err(SocketError::NotConnected);
        }
        if slot.protocol != SocketProtocol::Udp {
            return Err(SocketError::WrongProtocol);
        }

        self.socket_read(socket, length)
    }

    pub fn socket_receive_tcp(&mut self, socket: u8, length: usize) -> SocketResult<Vec<u8>> {
        let slot = self.check_socket(socket)?;
        if length > MAX_DATAGRAM {
            return Err(SocketError::InvalidArgument);
        }
        if !slot.is_opened {
            return Err(SocketError::NotOpen);
        }
        if !slot.is_connected {
            return Err(SocketError::NotConnected);
        }
        if slot.protocol != SocketProtocol::Tcp {
            return Err(SocketError::WrongProtocol);
        }

        self.socket_read(socket, length)
    }

    pub fn socket_receive_from_udp(
        &mut self,
        socket: u8,
        mut length: usize,
    ) -> SocketResult<(String, u16, Vec<u8>)> {
        let slot = self.check_socket(socket)?;
        if !slot.is_opened {
            return Err(SocketError::NotOpen);
        }
        if slot.protocol != SocketProtocol::Udp {
            return Err(SocketError::WrongProtocol);
        }

        loop {
            if length > MAX_DATAGRAM {
                return Err(SocketError::InvalidArgument);
            }

            let command = format!("AT+USORF={},{}", socket, length);
            let body = self.command_ok(&command, Duration::from_secs(1))?;

            let filtered = filter_response("+USORF: ", &body);
            let fields = parse_fields(&filtered);
            if fields.len() < 2 {
                return Err(SocketError::Modem(ModemError::Parse));
            }

            if length == 0 {
                let available: usize = fields[1]
                    .parse()
                    .map_err(|_| SocketError::Modem(ModemError::Parse))?;
                if available == 0 {
                    return Ok((String::new(), 0, Vec::new()));
                }
                length = available;
                continue;
            }

            if fields.len() < 5 {
                return Err(SocketError::Modem(ModemError::Parse));
            }

            let remote_ip = fields[1].to_owned();
            let remote_port: u16 = fields[2]
                .parse()
                .map_err(|_| SocketError::Modem(ModemError::Parse))?;
            let reported: usize = fields[3]
                .parse()
                .map_err(|_| SocketError::Modem(ModemError::Parse))?;
            let data = hex::decode(fields[4]).ok_or(SocketError::Modem(ModemError::Parse))?;
            if data.len() != reported {
                logging::error!(self.core().log, "payload length does not match indicator";
                                "context" => "socket_receive_from",
                                "socket" => socket,
                                "indicated" => reported,
                                "decoded" => data.len());
            }
            return Ok((remote_ip, remote_port, data));
        }
    }

    /// Start listening for incoming UDP data on a local port.
    pub fn socket_listen_udp(&mut self, socket: u8, local_port: u16) -> SocketResult<()> {
        let slot = self.check_socket(socket)?;
        if !slot.is_opened {
            return Err(SocketError::NotOpen);
        }
        if slot.protocol != SocketProtocol::Udp {
            return Err(SocketError::WrongProtocol);
        }

        let command = format!("AT+USOLI={},{}", socket, local_port);
        self.command_ok(&command, Duration::from_secs(1))?;
        Ok(())
    }

    /// Start listening for incoming TCP connections on a local port.
    pub fn socket_accept_tcp(
        &mut self,
        socket: u8,
        local_port: u16,
        notify_closed: bool,
    ) -> SocketResult<()> {
        let slot = self.check_socket(socket)?;
        if !slot.is_opened {
            return Err(SocketError::NotOpen);
        }
        if slot.protocol != SocketProtocol::Tcp {
            return Err(SocketError::WrongProtocol);
        }

        let command = format!("AT+USOLI={},{}", socket, local_port);
        self.command_ok(&command, Duration::from_secs(1))?;
        self.core_mut().sockets.slots[socket as usize].notify_closed = notify_closed;
        Ok(())
    }

    /// Open a UDP socket and start listening on a local port.
    pub fn open_listen_udp(&mut self, local_port: u16) -> SocketResult<u8> {
        let socket = self.socket_open(SocketProtocol::Udp, 0)?;

        match self.model() {
            ModemModel::UdpListenQuirk => {}
            ModemModel::Default => {
                if let Err(err) = self.socket_listen_udp(socket, local_port) {
                    let _ = self.socket_close(socket);
                    return Err(err);
                }
            }
        }
        Ok(socket)
    }

    /// Open a UDP socket and connect it to the remote peer.
    pub fn open_connect_udp(&mut self, remote_ip: &str, remote_port: u16) -> SocketResult<u8> {
        let socket = self.socket_open(SocketProtocol::Udp, 0)?;
        if let Err(err) = self.socket_connect(socket, remote_ip, remote_port, true) {
            let _ = self.socket_close(socket);
            return Err(err);
        }
        Ok(socket)
    }

    /// Open a UDP socket, listen on a local port and connect it to the
    /// remote peer. On the quirky firmware the explicit listen is skipped.
    pub fn open_listen_connect_udp(
        &mut self,
        local_port: u16,
        remote_ip: &str,
        remote_port: u16,
    ) -> SocketResult<u8> {
        let socket = self.socket_open(SocketProtocol::Udp, 0)?;
        if let Err(err) = self.listen_connect_steps(socket, local_port, remote_ip, remote_port) {
            let _ = self.socket_close(socket);
            return Err(err);
        }
        Ok(socket)
    }

    fn listen_connect_steps(
        &mut self,
        socket: u8,
        local_port: u16,
        remote_ip: &str,
        remote_port: u16,
    ) -> SocketResult<()> {
        match self.model() {
            ModemModel::UdpListenQuirk => {}
            ModemModel::Default => self.socket_listen_udp(socket, local_port)?,
        }
        self.socket_connect(socket, remote_ip, remote_port, true)
    }

    /// Drain the outstanding receive counters by issuing the corresponding
    /// receive commands, in socket order, and hand the datagrams (plus any
    /// queued close/accept notifications) upward.
    pub fn handle_waiting_data(&mut self) -> Vec<SocketEvent> {
        let mut events = self.core_mut().sockets.take_pending();

        for socket in 0..MAX_SOCKETS as u8 {
            let slot = self.core().sockets.slots[socket as usize];

            if slot.queued_receive_from > 0 {
                self.core_mut().sockets.slots[socket as usize].queued_receive_from = 0;
                match slot.protocol {
                    SocketProtocol::Udp => {
                        // A stale indicator is resolved with a length-zero
                        // discovery read.
                        let length = if slot.queued_receive_from > MAX_DATAGRAM {
                            0
                        } else {
                            slot.queued_receive_from
                        };
                        match self.socket_receive_from_udp(socket, length) {
                            Ok((_, _, ref data)) if data.is_empty() => {}
                            Ok((ip, port, data)) => events.push(SocketEvent::Datagram {
                                socket,
                                remote: Some((ip, port)),
                                data,
                            }),
                            Err(err) => {
                                logging::error!(self.core().log, "receive-from failed";
                                                "context" => "handle_waiting_data",
                                                "socket" => socket,
                                                "error" => ?err);
                            }
                        }
                    }
                    _ => {
                        logging::error!(self.core().log, "receive-from event on non-UDP socket";
                                        "context" => "handle_waiting_data",
                                        "socket" => socket);
                    }
                }
            }

            if slot.queued_receive > 0 {
                match slot.protocol {
                    SocketProtocol::Udp => {
                        self.core_mut().sockets.slots[socket as usize].queued_receive = 0;
                        match self.socket_receive_udp(socket, slot.queued_receive.min(MAX_DATAGRAM)) {
                            Ok(ref data) if data.is_empty() => {}
                            Ok(data) => events.push(SocketEvent::Datagram {
                                socket,
                                remote: None,
                                data,
                            }),
                            Err(err) => {
                                logging::error!(self.core().log, "receive failed";
                                                "context" => "handle_waiting_data",
                                                "socket" => socket,
                                                "error" => ?err);
                            }
                        }
                    }
                    SocketProtocol::Tcp => {
                        let take = slot.queued_receive.min(MAX_DATAGRAM);
                        match self.socket_receive_tcp(socket, take) {
                            Ok(data) => {
                                let slot = &mut self.core_mut().sockets.slots[socket as usize];
                                slot.queued_receive = if data.is_empty() {
                                    0
                                } else {
                                    slot.queued_receive.saturating_sub(data.len())
                                };
                                if !data.is_empty() {
                                    events.push(SocketEvent::Datagram {
                                        socket,
                                        remote: None,
                                        data,
                                    });
                                }
                            }
                            Err(err) => {
                                self.core_mut().sockets.slots[socket as usize].queued_receive = 0;
                                logging::error!(self.core().log, "receive failed";
                                                "context" => "handle_waiting_data",
                                                "socket" => socket,
                                                "error" => ?err);
                            }
                        }
                    }
                    SocketProtocol::None => {
                        self.core_mut().sockets.slots[socket as usize].queued_receive = 0;
                        logging::error!(self.core().log, "data event on closed socket";
                                        "context" => "handle_waiting_data",
                                        "socket" => socket);
                    }
                }
            }
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockModem;
    use flint::logging;

    fn modem() -> Modem<MockModem> {
        Modem::new(MockModem::new(), ModemModel::Default, &logging::null())
    }

    #[test]
    fn test_open_marks_slot() {
        let mut modem = modem();
        let socket = modem.socket_open(SocketProtocol::Udp, 0).unwrap();

        let slot = modem.core().sockets.slot(socket).unwrap();
        assert!(slot.is_opened);
        assert!(!slot.is_connected);
        assert_eq!(slot.protocol, SocketProtocol::Udp);
    }

    #[test]
    fn test_close_restores_invariant() {
        let mut modem = modem();
        let socket = modem.socket_open(SocketProtocol::Udp, 0).unwrap();
        modem.socket_close(socket).unwrap();

        let slot = modem.core().sockets.slot(socket).unwrap();
        assert!(!slot.is_opened);
        assert_eq!(slot.protocol, SocketProtocol::None);
    }

    #[test]
    fn test_send_requires_connect() {
        let mut modem = modem();
        let socket = modem.socket_open(SocketProtocol::Udp, 0).unwrap();

        assert_eq!(
            modem.socket_send_udp(socket, b"hi"),
            Err(SocketError::NotConnected)
        );

        modem.socket_connect(socket, "203.0.113.7", 5683, false).unwrap();
        assert_eq!(modem.socket_send_udp(socket, b"hi"), Ok(2));
        assert_eq!(modem.serial_mut().sent_datagrams[0], (socket, b"hi".to_vec()));
    }

    #[test]
    fn test_send_rejects_oversized_payload() {
        let mut modem = modem();
        let socket = modem.socket_open(SocketProtocol::Udp, 0).unwrap();
        modem.socket_connect(socket, "203.0.113.7", 5683, false).unwrap();

        let data = vec![0u8; MAX_DATAGRAM + 1];
        assert_eq!(
            modem.socket_send_udp(socket, &data),
            Err(SocketError::InvalidArgument)
        );
    }

    #[test]
    fn test_send_to_unconnected() {
        let mut modem = modem();
        let socket = modem.socket_open(SocketProtocol::Udp, 0).unwrap();

        assert_eq!(
            modem.socket_send_to_udp(socket, "203.0.113.7", 5683, b"ping"),
            Ok(4)
        );
    }

    #[test]
    fn test_urc_pump_delivers_datagram() {
        let mut modem = modem();
        let socket = modem.socket_open(SocketProtocol::Udp, 0).unwrap();
        modem.socket_connect(socket, "203.0.113.7", 5683, false).unwrap();

        modem
            .serial_mut()
            .deliver_datagram(socket, None, b"payload");
        modem.spin();

        assert_eq!(
            modem.core().sockets.slot(socket).unwrap().queued_receive,
            7
        );

        let events = modem.handle_waiting_data();
        assert_eq!(
            events,
            vec![SocketEvent::Datagram {
                socket,
                remote: None,
                data: b"payload".to_vec(),
            }]
        );
        assert_eq!(modem.core().sockets.slot(socket).unwrap().queued_receive, 0);
    }

    #[test]
    fn test_urc_pump_delivers_receive_from() {
        let mut modem = modem();
        let socket = modem.socket_open(SocketProtocol::Udp, 0).unwrap();

        modem
            .serial_mut()
            .deliver_datagram(socket, Some(("203.0.113.7", 5684)), b"dtls");
        modem.spin();

        let events = modem.handle_waiting_data();
        assert_eq!(
            events,
            vec![SocketEvent::Datagram {
                socket,
                remote: Some(("203.0.113.7".to_owned(), 5684)),
                data: b"dtls".to_vec(),
            }]
        );
    }

    #[test]
    fn test_closed_urc_emits_event() {
        let mut modem = modem();
        let socket = modem.socket_open(SocketProtocol::Udp, 0).unwrap();
        modem.socket_connect(socket, "203.0.113.7", 5683, true).unwrap();

        modem.serial_mut().close_socket(socket);
        modem.spin();

        let events = modem.handle_waiting_data();
        assert_eq!(events, vec![SocketEvent::Closed { socket }]);
        assert!(!modem.core().sockets.slot(socket).unwrap().is_connected);
    }

    #[test]
    fn test_listen_quirk_skips_usoli() {
        let mut quirky = Modem::new(
            MockModem::new(),
            ModemModel::UdpListenQuirk,
            &logging::null(),
        );
        quirky.serial_mut().fail_listen = true;

        let socket = quirky
            .open_listen_connect_udp(0, "203.0.113.7", 5684)
            .unwrap();
        assert!(quirky.core().sockets.slot(socket).unwrap().is_connected);
        assert!(quirky.serial_mut().commands_matching("AT+USOLI").is_empty());
    }

    #[test]
    fn test_default_model_listens() {
        let mut modem = modem();
        let socket = modem
            .open_listen_connect_udp(0, "203.0.113.7", 5684)
            .unwrap();
        assert!(modem.core().sockets.slot(socket).unwrap().is_connected);
        assert_eq!(modem.serial_mut().commands_matching("AT+USOLI").len(), 1);
    }
}
