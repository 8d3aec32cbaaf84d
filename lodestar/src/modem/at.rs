//! Line-oriented AT dialog with the modem.
//!
//! The engine multiplexes a half-duplex UART between exactly one
//! command-in-flight and any number of unsolicited result codes (URCs). It is
//! an explicit state machine advanced by `spin`:
//!
//! ```text
//!                                  prompt ('>' / CONNECT)
//!                    +------------+          +----------+
//!          +-------->| WaitPrompt |--------->| SendData |
//!          |         +------------+          +----------+
//!          | command w/ data  |                   | all bytes written
//!  +------+                   | timeout           v
//!  | Idle |<------------------+-------------+------------+
//!  +------+                                 | WaitResult |
//!      |    command w/o data                +------------+
//!      +------------------------------------^    |  final result code
//!                                                v
//!                                        +---------------+
//!                                        | ResponseReady |--(fetch)--> Idle
//!                                        +---------------+
//! ```
//!
//! URC lines are dispatched to subscribed handlers in every state and are
//! never appended to a command response. Handlers are plain functions taking
//! a caller-supplied context, so the engine stays free of shared mutable
//! state.

use crate::buffer::Buffer;
use flint::logging::{self, Logger};
use indexmap::IndexMap;
use std::io;
use std::time::{Duration, Instant};

pub const MAX_URC_HANDLERS: usize = 8;
pub const MAX_PREFIX_HANDLERS: usize = 8;
// Socket receive responses carry a full 512-byte datagram as inline ASCII
// hex, so the line cap has to clear ~1100 characters.
pub const MAX_LINE_LEN: usize = 1200;

const RX_BUFFER_SIZE: usize = 2048;
const DATA_CHUNK: usize = 100;
const SPIN_DELAY: Duration = Duration::from_millis(50);

/// Handler for a subscribed URC. Returns true when the line was consumed.
pub type UrcHandler<C> = fn(ctx: &mut C, code: &str, data: &str) -> bool;

/// Handler for non-AT lines that still demand dispatch (matched by prefix).
pub type PrefixHandler<C> = fn(ctx: &mut C, line: &str);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    WaitPrompt,
    SendData,
    WaitResult,
    ResponseReady,
}

/// Final result codes per ITU-T V.250, plus the CONNECT variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Ok,
    Connect,
    Ring,
    NoCarrier,
    Error,
    Connect1200,
    NoDialtone,
    Busy,
    NoAnswer,
}

/// How the last command concluded.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Done(ResultCode, String),
    TimedOut,
}

#[derive(Debug, PartialEq, Eq)]
pub enum AtError {
    /// A command is already in flight.
    Busy,
    /// The command deadline passed without a final result code.
    Timeout,
    /// Writing to or reading from the serial link failed.
    Serial(io::ErrorKind),
}

pub type AtResult<T> = Result<T, AtError>;

impl From<io::Error> for AtError {
    fn from(err: io::Error) -> Self {
        AtError::Serial(err.kind())
    }
}

enum Parsed {
    Code(ResultCode),
    CmeError(String),
}

fn parse_final_result(line: &str) -> Option<Parsed> {
    let code = match line {
        "OK" => ResultCode::Ok,
        "CONNECT" => ResultCode::Connect,
        "RING" => ResultCode::Ring,
        "NO CARRIER" => ResultCode::NoCarrier,
        "ERROR" => ResultCode::Error,
        "CONNECT 1200" => ResultCode::Connect1200,
        "NO DIALTONE" => ResultCode::NoDialtone,
        "BUSY" => ResultCode::Busy,
        "NO ANSWER" => ResultCode::NoAnswer,
        _ => {
            return line
                .strip_prefix("+CME ERROR: ")
                .map(|text| Parsed::CmeError(text.to_owned()));
        }
    };
    Some(Parsed::Code(code))
}

/// Keep only the response lines starting with `prefix`, with the prefix
/// stripped, joined by `\n`.
pub fn filter_response(prefix: &str, response: &str) -> String {
    response
        .lines()
        .filter_map(|line| line.strip_prefix(prefix))
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct AtEngine<S, C> {
    serial: S,

    state: EngineState,
    rx: Buffer,

    // Current (possibly incomplete) line. Bytes before the first CR/LF seen
    // on the link are noise from mid-stream attach and are discarded.
    line: Vec<u8>,
    line_truncated: bool,
    seen_delimiter: bool,

    response: String,
    outcome: Option<Outcome>,

    pending_data: Vec<u8>,
    data_sent: usize,
    data_term: Option<u8>,

    deadline: Option<Instant>,

    urc_handlers: IndexMap<&'static str, UrcHandler<C>>,
    prefix_handlers: Vec<(&'static str, PrefixHandler<C>)>,

    log: Logger,
}

impl<S: io::Read + io::Write, C> AtEngine<S, C> {
    pub fn new(serial: S, log: &Logger) -> AtEngine<S, C> {
        AtEngine {
            serial,
            state: EngineState::Idle,
            rx: Buffer::new(RX_BUFFER_SIZE),
            line: Vec::with_capacity(MAX_LINE_LEN),
            line_truncated: false,
            seen_delimiter: false,
            response: String::new(),
            outcome: None,
            pending_data: Vec::new(),
            data_sent: 0,
            data_term: None,
            deadline: None,
            urc_handlers: IndexMap::new(),
            prefix_handlers: Vec::new(),
            log: log.new(logging::o!()),
        }
    }

    #[inline]
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Direct access to the underlying link. Used by the raw-data path
    /// (streaming after a prompt is handled internally) and by tests.
    #[inline]
    pub fn serial_mut(&mut self) -> &mut S {
        &mut self.serial
    }

    /// Subscribe a URC handler under a unique id. Dispatch order is
    /// registration order, first handler wins. Fails when the table is full
    /// or the id is taken.
    pub fn register_urc_handler(&mut self, id: &'static str, handler: UrcHandler<C>) -> bool {
        if self.urc_handlers.len() >= MAX_URC_HANDLERS || self.urc_handlers.contains_key(id) {
            return false;
        }

        self.urc_handlers.insert(id, handler);
        true
    }

    /// Subscribe a handler for non-AT lines starting with `prefix`.
    pub fn register_prefix_handler(&mut self, prefix: &'static str, handler: PrefixHandler<C>) -> bool {
        if self.prefix_handlers.len() >= MAX_PREFIX_HANDLERS {
            return false;
        }

        self.prefix_handlers.push((prefix, handler));
        true
    }

    pub fn deregister_prefix_handlers(&mut self) {
        self.prefix_handlers.clear();
    }

    /// Send raw bytes down the link, outside of the command state machine.
    pub fn send_raw(&mut self, data: &[u8]) -> AtResult<()> {
        self.serial.write_all(data)?;
        self.serial.flush()?;
        Ok(())
    }

    /// Start a command that expects a plain final result code.
    pub fn start_command(&mut self, command: &str, timeout: Duration) -> AtResult<()> {
        self.start_command_full(command, timeout, None, None)
    }

    /// Start a command that streams `data` after the modem's input prompt,
    /// optionally terminated by `term`.
    pub fn start_command_with_data(
        &mut self,
        command: &str,
        timeout: Duration,
        data: &[u8],
        term: Option<u8>,
    ) -> AtResult<()> {
        self.start_command_full(command, timeout, Some(data), term)
    }

    fn start_command_full(
        &mut self,
        command: &str,
        timeout: Duration,
        data: Option<&[u8]>,
        term: Option<u8>,
    ) -> AtResult<()> {
        if self.state != EngineState::Idle {
            logging::error!(self.log, "command refused, engine busy";
                            "context" => "start_command",
                            "command" => command,
                            "state" => ?self.state);
            return Err(AtError::Busy);
        }

        self.serial.write_all(command.as_bytes())?;
        self.serial.write_all(b"\r\n")?;
        self.serial.flush()?;

        self.response.clear();
        self.outcome = None;
        self.deadline = Some(Instant::now() + timeout);

        match data {
            Some(data) => {
                self.pending_data = data.to_vec();
                self.data_sent = 0;
                self.data_term = term;
                self.state = EngineState::WaitPrompt;
            }
            None => self.state = EngineState::WaitResult,
        }

        logging::debug!(self.log, "command started";
                        "context" => "start_command",
                        "command" => command,
                        "state" => ?self.state);
        Ok(())
    }

    /// Fetch the outcome of the last command, if any, returning the engine to
    /// `Idle`.
    pub fn take_outcome(&mut self) -> Option<Outcome> {
        let outcome = self.outcome.take();
        if outcome.is_some() && self.state == EngineState::ResponseReady {
            self.state = EngineState::Idle;
        }
        outcome
    }

    /// Drain the link, advance the state machine and dispatch URCs. Returns
    /// immediately; callers that cannot afford blocking poll this plus
    /// `take_outcome`.
    pub fn spin(&mut self, ctx: &mut C) {
        self.check_deadline();

        if let Err(err) = self.rx.ingress(&mut self.serial) {
            logging::error!(self.log, "serial drain failed";
                            "context" => "spin",
                            "error" => ?err);
        }

        if self.state == EngineState::SendData {
            self.pump_send_data();
        }

        while let Some(byte) = self.rx.pop_front() {
            match byte {
                b'\r' | b'\n' => {
                    let first = !self.seen_delimiter;
                    self.seen_delimiter = true;
                    self.complete_line(ctx, first);
                }
                _ => {
                    if self.line.len() < MAX_LINE_LEN {
                        self.line.push(byte);
                    } else if !self.line_truncated {
                        self.line_truncated = true;
                        logging::error!(self.log, "line exceeds maximum length, truncating";
                                        "context" => "spin",
                                        "max" => MAX_LINE_LEN);
                    }

                    // Strict prompt rule: '>' only counts at column 0 of a
                    // fresh line while waiting for the input invitation.
                    if self.state == EngineState::WaitPrompt
                        && self.line.len() == 1
                        && self.line[0] == b'>'
                    {
                        self.line.clear();
                        self.enter_send_data();
                    }
                }
            }
        }
    }

    /// Execute one command, blocking in a `spin` + delay loop until a final
    /// result code or the deadline. Only use when this trivial behaviour is
    /// good enough; everything else should poll.
    pub fn do_command(
        &mut self,
        ctx: &mut C,
        command: &str,
        timeout: Duration,
    ) -> AtResult<(ResultCode, String)> {
        self.do_command_full(ctx, command, timeout, None, None)
    }

    pub fn do_command_with_data(
        &mut self,
        ctx: &mut C,
        command: &str,
        timeout: Duration,
        data: &[u8],
        term: Option<u8>,
    ) -> AtResult<(ResultCode, String)> {
        self.do_command_full(ctx, command, timeout, Some(data), term)
    }

    fn do_command_full(
        &mut self,
        ctx: &mut C,
        command: &str,
        timeout: Duration,
        data: Option<&[u8]>,
        term: Option<u8>,
    ) -> AtResult<(ResultCode, String)> {
        // Flush URCs already in the pipe so the response comes back clean.
        self.spin(ctx);

        self.start_command_full(command, timeout, data, term)?;

        loop {
            self.spin(ctx);

            if let Some(outcome) = self.take_outcome() {
                return match outcome {
                    Outcome::Done(code, body) => Ok((code, body)),
                    Outcome::TimedOut => Err(AtError::Timeout),
                };
            }

            std::thread::sleep(SPIN_DELAY);
        }
    }

    fn check_deadline(&mut self) {
        let expired = match (self.state, self.deadline) {
            (EngineState::WaitPrompt, Some(deadline))
            | (EngineState::SendData, Some(deadline))
            | (EngineState::WaitResult, Some(deadline)) => Instant::now() >= deadline,
            _ => false,
        };

        if expired {
            logging::warn!(self.log, "command timed out";
                           "context" => "spin",
                           "state" => ?self.state);
            self.pending_data.clear();
            self.data_sent = 0;
            self.data_term = None;
            self.deadline = None;
            self.response.clear();
            self.outcome = Some(Outcome::TimedOut);
            self.state = EngineState::Idle;
        }
    }

    fn enter_send_data(&mut self) {
        logging::debug!(self.log, "input prompt received";
                        "context" => "spin",
                        "pending" => self.pending_data.len());
        self.state = EngineState::SendData;
    }

    fn pump_send_data(&mut self) {
        if self.data_sent < self.pending_data.len() {
            let end = usize::min(self.data_sent + DATA_CHUNK, self.pending_data.len());
            if let Err(err) = self.serial.write_all(&self.pending_data[self.data_sent..end]) {
                logging::error!(self.log, "failed writing command data";
                                "context" => "send_data",
                                "error" => ?err);
            }
            self.data_sent = end;
        }

        if self.data_sent >= self.pending_data.len() {
            if let Some(term) = self.data_term {
                if let Err(err) = self.serial.write_all(&[term]) {
                    logging::error!(self.log, "failed writing data terminator";
                                    "context" => "send_data",
                                    "error" => ?err);
                }
            }
            let _ = self.serial.flush();

            self.pending_data.clear();
            self.data_sent = 0;
            self.data_term = None;
            self.state = EngineState::WaitResult;
        }
    }

    fn complete_line(&mut self, ctx: &mut C, first: bool) {
        if self.line.iter().all(|byte| byte.is_ascii_whitespace()) {
            self.line.clear();
            self.line_truncated = false;
            return;
        }

        let line = String::from_utf8_lossy(&self.line).into_owned();
        self.line.clear();
        self.line_truncated = false;

        if first {
            logging::debug!(self.log, "discarding partial first line";
                            "context" => "spin",
                            "line" => %line);
            return;
        }

        self.process_line(ctx, &line);
    }

    fn process_line(&mut self, ctx: &mut C, line: &str) {
        match self.state {
            EngineState::Idle | EngineState::ResponseReady => {
                if !self.dispatch_urc(ctx, line, true) {
                    self.dispatch_prefix(ctx, line);
                }
            }
            EngineState::WaitPrompt => {
                if line.starts_with("CONNECT") {
                    self.enter_send_data();
                } else if !self.dispatch_urc(ctx, line, false) {
                    logging::debug!(self.log, "stray line while waiting for prompt";
                                    "context" => "spin",
                                    "line" => line);
                }
            }
            EngineState::SendData => {
                self.dispatch_urc(ctx, line, true);
            }
            EngineState::WaitResult => {
                if let Some(parsed) = self.parse_result_line(line) {
                    self.finish_command(parsed);
                } else if !self.dispatch_urc(ctx, line, false) {
                    if !self.response.is_empty() {
                        self.response.push('\n');
                    }
                    self.response.push_str(line);
                }
            }
        }
    }

    fn parse_result_line(&self, line: &str) -> Option<Parsed> {
        parse_final_result(line)
    }

    fn finish_command(&mut self, parsed: Parsed) {
        let (code, body) = match parsed {
            Parsed::Code(code) => (code, std::mem::replace(&mut self.response, String::new())),
            // The CME text becomes the response body, the result maps to
            // plain ERROR.
            Parsed::CmeError(text) => {
                self.response.clear();
                (ResultCode::Error, text)
            }
        };

        logging::debug!(self.log, "command complete";
                        "context" => "spin",
                        "code" => ?code,
                        "body" => %body);

        self.deadline = None;
        self.outcome = Some(Outcome::Done(code, body));
        self.state = EngineState::ResponseReady;
    }

    /// A line is a URC iff it starts with `+` and contains `": "`. Returns
    /// true when some handler consumed it.
    fn dispatch_urc(&mut self, ctx: &mut C, line: &str, report_unknown: bool) -> bool {
        if !line.starts_with('+') {
            return false;
        }

        let split = match line.find(": ") {
            Some(split) => split,
            None => return false,
        };

        let code = &line[..split];
        let data = &line[split + 2..];

        logging::trace!(self.log, "dispatching URC";
                        "context" => "urc",
                        "code" => code,
                        "data" => data);

        for handler in self.urc_handlers.values() {
            if handler(ctx, code, data) {
                return true;
            }
        }

        if report_unknown {
            logging::warn!(self.log, "unhandled URC";
                          "context" => "urc",
                          "code" => code,
                          "data" => data);
        }

        false
    }

    fn dispatch_prefix(&mut self, ctx: &mut C, line: &str) {
        for (prefix, handler) in &self.prefix_handlers {
            if line.starts_with(prefix) {
                handler(ctx, line);
                return;
            }
        }

        logging::debug!(self.log, "dropping unclaimed line";
                        "context" => "spin",
                        "line" => line);
    }
}
