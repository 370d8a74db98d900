use std::{
    collections::VecDeque,
    fmt::Display,
    time::Duration,
};

use anyhow::Result;
use bytes::{
    Buf,
    Bytes,
    BytesMut,
};
use log::{
    debug,
    warn,
};
use rand::Rng;
use tokio::time::Instant;

use crate::websocket::{
    close::{
        CloseCode,
        CloseStatus,
    },
    compression::PerMessageCompress,
    error::WebSocketError,
    frame::{
        FrameHeader,
        FrameStart,
        MAX_CONTROL_PAYLOAD,
        RSV_COMPRESSED,
        encode_frame,
        opcode,
    },
    mask::XorMasker,
    options::{
        ClientOptions,
        ProtocolOptions,
        ServerOptions,
    },
    utf8::{
        Utf8Validation,
        Utf8Validator,
        encode_truncate,
        is_valid_utf8,
    },
};

/// Close reasons may take up the rest of a control frame after the two-octet code.
const MAX_CLOSE_REASON: usize = 123;

/// Which end of the connection this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// The state of a WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Open => write!(f, "OPEN"),
            Self::Closing => write!(f, "CLOSING"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// A complete message received over a WebSocket connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebSocketMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl WebSocketMessage {
    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(data) => data,
        }
    }

    pub fn into_payload(self) -> Vec<u8> {
        match self {
            Self::Text(text) => text.into_bytes(),
            Self::Binary(data) => data,
        }
    }
}

/// An event produced by the protocol engine for the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    Message(WebSocketMessage),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
}

/// Octets ready to be written to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub data: Bytes,
    /// The writer should flush and yield briefly after this chunk.
    pub sync: bool,
}

/// The settings one end of a connection runs with, derived from server or client options.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    pub role: Role,
    pub protocol: ProtocolOptions,
    /// Fail the connection on unmasked incoming frames.
    pub require_masked_frames: bool,
    /// Allow masked incoming frames.
    pub accept_masked_frames: bool,
    /// Mask outgoing frames.
    pub mask_frames: bool,
    /// How long a client waits for the server to drop the connection after closing.
    pub server_connection_drop_timeout: Option<Duration>,
}

impl ProtocolConfig {
    pub fn server(options: &ServerOptions) -> Self {
        Self {
            role: Role::Server,
            protocol: options.protocol.clone(),
            require_masked_frames: options.require_masked_client_frames,
            accept_masked_frames: true,
            mask_frames: options.mask_server_frames,
            server_connection_drop_timeout: None,
        }
    }

    pub fn client(options: &ClientOptions) -> Self {
        Self {
            role: Role::Client,
            protocol: options.protocol.clone(),
            require_masked_frames: false,
            accept_masked_frames: options.accept_masked_server_frames,
            mask_frames: options.mask_client_frames,
            server_connection_drop_timeout: options.server_connection_drop_timeout,
        }
    }
}

struct CurrentFrame {
    header: FrameHeader,
    masker: Option<XorMasker>,
    remaining: u64,
    control_data: Vec<u8>,
}

/// The RFC 6455 protocol engine for a single connection, after the opening handshake.
///
/// The engine performs no I/O. Received octets are pushed in with [`Self::receive`], and the
/// engine queues outgoing octets ([`Self::poll_transmit`]) and application events
/// ([`Self::poll_event`]). Timers are exposed as deadlines: the driver waits until
/// [`Self::next_deadline`] and then calls [`Self::handle_timeout`]. When [`Self::should_drop`]
/// turns true, the driver closes the transport after flushing, and reports the outcome from
/// [`Self::connection_lost`].
pub struct WebSocketProtocol {
    config: ProtocolConfig,
    state: State,
    peer: String,

    buffer: BytesMut,
    current_frame: Option<CurrentFrame>,

    inside_message: bool,
    message_is_binary: bool,
    message_is_compressed: bool,
    message_data: Vec<u8>,
    message_data_total_length: u64,
    utf8_validator: Utf8Validator,
    utf8_validate_current_message: bool,
    utf8_validate_last: Utf8Validation,
    compress: Option<Box<dyn PerMessageCompress>>,

    outgoing: VecDeque<Outgoing>,
    events: VecDeque<ProtocolEvent>,

    was_clean: bool,
    was_not_clean_reason: Option<String>,
    failed_by_me: bool,
    dropped_by_me: bool,
    closed_by_me: bool,
    failure: Option<WebSocketError>,
    local_close_code: Option<CloseCode>,
    local_close_reason: Option<Vec<u8>>,
    remote_close_code: Option<CloseCode>,
    remote_close_reason: Option<String>,
    drop_requested: bool,

    close_handshake_deadline: Option<Instant>,
    server_connection_drop_deadline: Option<Instant>,
    auto_ping_deadline: Option<Instant>,
    auto_ping_timeout_deadline: Option<Instant>,
    auto_ping_pending: Option<Vec<u8>>,
}

impl WebSocketProtocol {
    /// Creates a new engine in the CONNECTING state.
    pub fn new<S>(
        config: ProtocolConfig,
        peer: S,
        compress: Option<Box<dyn PerMessageCompress>>,
    ) -> Self
    where
        S: Into<String>,
    {
        Self {
            config,
            state: State::Connecting,
            peer: peer.into(),
            buffer: BytesMut::new(),
            current_frame: None,
            inside_message: false,
            message_is_binary: false,
            message_is_compressed: false,
            message_data: Vec::new(),
            message_data_total_length: 0,
            utf8_validator: Utf8Validator::new(),
            utf8_validate_current_message: false,
            utf8_validate_last: Utf8Validation {
                valid: true,
                ends_on_codepoint: true,
                current_index: 0,
                total_index: 0,
            },
            compress,
            outgoing: VecDeque::new(),
            events: VecDeque::new(),
            was_clean: false,
            was_not_clean_reason: None,
            failed_by_me: false,
            dropped_by_me: false,
            closed_by_me: false,
            failure: None,
            local_close_code: None,
            local_close_reason: None,
            remote_close_code: None,
            remote_close_reason: None,
            drop_requested: false,
            close_handshake_deadline: None,
            server_connection_drop_deadline: None,
            auto_ping_deadline: None,
            auto_ping_timeout_deadline: None,
            auto_ping_pending: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn role(&self) -> Role {
        self.config.role
    }

    /// The error this end failed the connection with, if any.
    pub fn failure(&self) -> Option<&WebSocketError> {
        self.failure.as_ref()
    }

    pub fn was_clean(&self) -> bool {
        self.was_clean
    }

    pub fn closed_by_me(&self) -> bool {
        self.closed_by_me
    }

    pub fn local_close_code(&self) -> Option<CloseCode> {
        self.local_close_code
    }

    pub fn local_close_reason(&self) -> Option<&[u8]> {
        self.local_close_reason.as_deref()
    }

    pub fn remote_close_code(&self) -> Option<CloseCode> {
        self.remote_close_code
    }

    pub fn remote_close_reason(&self) -> Option<&str> {
        self.remote_close_reason.as_deref()
    }

    /// Checks if the driver should close the transport.
    pub fn should_drop(&self) -> bool {
        self.drop_requested
    }

    /// Moves the connection into the OPEN state, after a successful opening handshake.
    pub fn open(&mut self) {
        if self.state != State::Connecting {
            return;
        }
        self.set_state(State::Open);
        self.inside_message = false;
        self.current_frame = None;
        if let Some(interval) = self.config.protocol.auto_ping_interval {
            self.auto_ping_deadline = Some(Instant::now() + interval);
        }
    }

    fn set_state(&mut self, state: State) {
        if self.state != state {
            debug!(
                "WebSocket connection to {} transitioned from {} to {state}",
                self.peer, self.state
            );
            self.state = state;
        }
    }

    /// The next queued chunk of outgoing octets.
    pub fn poll_transmit(&mut self) -> Option<Outgoing> {
        self.outgoing.pop_front()
    }

    /// The next event for the application.
    pub fn poll_event(&mut self) -> Option<ProtocolEvent> {
        self.events.pop_front()
    }

    /// The earliest pending timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.close_handshake_deadline,
            self.server_connection_drop_deadline,
            self.auto_ping_deadline,
            self.auto_ping_timeout_deadline,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Fires every timer whose deadline has passed.
    pub fn handle_timeout(&mut self) {
        let now = Instant::now();
        let expired = |deadline: &mut Option<Instant>| match deadline {
            Some(at) if *at <= now => {
                *deadline = None;
                true
            }
            _ => false,
        };

        if expired(&mut self.close_handshake_deadline) && self.state != State::Closed {
            self.drop_uncleanly(WebSocketError::Timeout(
                "WebSocket closing handshake timeout (peer did not finish the opening handshake in time)"
                    .to_owned(),
            ));
        }
        if expired(&mut self.server_connection_drop_deadline) && self.state != State::Closed {
            self.drop_uncleanly(WebSocketError::Timeout(
                "WebSocket closing handshake timeout (server did not drop TCP connection in time)"
                    .to_owned(),
            ));
        }
        if expired(&mut self.auto_ping_timeout_deadline) && self.state != State::Closed {
            self.drop_uncleanly(WebSocketError::Timeout(
                "WebSocket ping timeout (peer did not respond with pong in time)".to_owned(),
            ));
        }
        if expired(&mut self.auto_ping_deadline) {
            self.send_auto_ping();
        }
    }

    fn drop_uncleanly(&mut self, error: WebSocketError) {
        self.was_clean = false;
        self.was_not_clean_reason = Some(error.to_string());
        self.drop_connection();
    }

    fn send_auto_ping(&mut self) {
        let payload = rand::rng()
            .sample_iter(rand::distr::Alphanumeric)
            .take(self.config.protocol.auto_ping_size)
            .collect::<Vec<u8>>();
        if let Err(err) = self.send_ping(&payload) {
            warn!("Failed to send automatic ping to {}: {err}", self.peer);
            return;
        }
        self.auto_ping_pending = Some(payload);
        if let Some(timeout) = self.config.protocol.auto_ping_timeout {
            debug!(
                "Expecting pong from {} within {timeout:?} for automatic ping",
                self.peer
            );
            self.auto_ping_timeout_deadline = Some(Instant::now() + timeout);
        }
    }

    /// Drops the connection, without a closing handshake.
    pub fn drop_connection(&mut self) {
        if self.state == State::Closed {
            debug!(
                "Dropping connection to {} skipped: connection already closed",
                self.peer
            );
            return;
        }
        if self.was_clean {
            debug!("Dropping connection to {}", self.peer);
        } else {
            warn!(
                "Dropping connection to {}: {}",
                self.peer,
                self.was_not_clean_reason.as_deref().unwrap_or_default()
            );
        }
        self.dropped_by_me = true;
        self.set_state(State::Closed);
        self.drop_requested = true;
    }

    /// Reports that the transport is gone, and produces the final outcome of the connection.
    pub fn connection_lost(&mut self) -> CloseStatus {
        self.close_handshake_deadline = None;
        self.server_connection_drop_deadline = None;
        self.auto_ping_deadline = None;
        self.auto_ping_timeout_deadline = None;
        self.set_state(State::Closed);

        if self.was_clean {
            CloseStatus {
                was_clean: true,
                code: self.remote_close_code,
                reason: self.remote_close_reason.clone(),
            }
        } else {
            let reason = match &self.was_not_clean_reason {
                Some(reason) => reason.clone(),
                None if !self.dropped_by_me => {
                    "peer dropped the TCP connection without previous WebSocket closing handshake"
                        .to_owned()
                }
                None => "connection dropped".to_owned(),
            };
            CloseStatus {
                was_clean: false,
                code: Some(CloseCode::ABNORMAL_CLOSE),
                reason: Some(format!("connection was closed uncleanly ({reason})")),
            }
        }
    }

    /// Fails the connection with the given error.
    ///
    /// Either drops the connection immediately or starts the closing handshake, depending on
    /// [`ProtocolOptions::fail_by_drop`].
    pub fn fail_connection(&mut self, error: WebSocketError) {
        if self.state == State::Closed {
            debug!(
                "Skipped failing connection to {}: connection already closed",
                self.peer
            );
            return;
        }
        debug!("Failing connection to {}: {error}", self.peer);
        self.failed_by_me = true;
        let code = error.close_code().unwrap_or(CloseCode::GOING_AWAY);
        let reason = error.to_string();
        self.failure = Some(error);

        if self.config.protocol.fail_by_drop {
            self.was_clean = false;
            self.was_not_clean_reason =
                Some(format!("I dropped the WebSocket TCP connection: {reason}"));
            self.drop_connection();
        } else if self.state != State::Closing {
            self.send_close_frame(
                Some(code),
                Some(encode_truncate(&reason, MAX_CLOSE_REASON)),
                false,
            );
        } else {
            // A second failure during the closing handshake.
            self.drop_connection();
        }
    }

    /// Fails the connection for a protocol violation.
    ///
    /// Returns true if processing should stop.
    fn protocol_violation(&mut self, reason: String) -> bool {
        self.fail_connection(WebSocketError::Protocol(reason));
        self.config.protocol.fail_by_drop
    }

    /// Fails the connection for an invalid payload.
    ///
    /// Returns true if processing should stop.
    fn invalid_payload(&mut self, reason: String) -> bool {
        self.fail_connection(WebSocketError::InvalidPayload(reason));
        self.config.protocol.fail_by_drop
    }

    fn compression_name(&self) -> &str {
        self.compress
            .as_ref()
            .map(|compress| compress.extension_name())
            .unwrap_or_default()
    }

    /// Consumes received octets.
    pub fn receive(&mut self, data: &[u8]) {
        match self.state {
            State::Open | State::Closing => {
                self.buffer.extend_from_slice(data);
                while self.process_data() && self.state != State::Closed {}
            }
            State::Connecting | State::Closed => {
                debug!(
                    "Ignoring {} octets from {} received in state {}",
                    data.len(),
                    self.peer,
                    self.state
                );
            }
        }
    }

    /// Processes the next piece of the buffer.
    ///
    /// Returns true if there may be more to process.
    fn process_data(&mut self) -> bool {
        if self.current_frame.is_none() {
            self.process_frame_header()
        } else {
            self.process_frame_payload()
        }
    }

    fn process_frame_header(&mut self) -> bool {
        if self.buffer.len() < 2 {
            return false;
        }
        let start = FrameStart::parse(self.buffer[0], self.buffer[1]);
        if self.buffer.len() < start.header_len() {
            return false;
        }

        if start.rsv != 0 && !(self.compress.is_some() && start.rsv == RSV_COMPRESSED) {
            if self.protocol_violation(format!("RSV = {} and no extension negotiated", start.rsv)) {
                return false;
            }
        }

        match self.config.role {
            Role::Server => {
                if self.config.require_masked_frames && !start.masked {
                    if self.protocol_violation("unmasked client-to-server frame".to_owned()) {
                        return false;
                    }
                }
            }
            Role::Client => {
                if !self.config.accept_masked_frames && start.masked {
                    if self.protocol_violation("masked server-to-client frame".to_owned()) {
                        return false;
                    }
                }
            }
        }

        if start.is_control() {
            if !start.fin {
                if self.protocol_violation("fragmented control frame".to_owned()) {
                    return false;
                }
            }
            if start.length_field as usize > MAX_CONTROL_PAYLOAD {
                if self.protocol_violation(format!(
                    "control frame with payload length > {MAX_CONTROL_PAYLOAD} octets"
                )) {
                    return false;
                }
            }
            if ![opcode::CLOSE, opcode::PING, opcode::PONG].contains(&start.opcode) {
                if self.protocol_violation(format!(
                    "control frame using reserved opcode {}",
                    start.opcode
                )) {
                    return false;
                }
            }
            if start.opcode == opcode::CLOSE && start.length_field == 1 {
                if self
                    .protocol_violation("received close control frame with payload len 1".to_owned())
                {
                    return false;
                }
            }
            if self.compress.is_some() && start.rsv == RSV_COMPRESSED {
                let reason = format!(
                    "received compressed control frame [{}]",
                    self.compression_name()
                );
                if self.protocol_violation(reason) {
                    return false;
                }
            }
        } else {
            if ![opcode::CONTINUATION, opcode::TEXT, opcode::BINARY].contains(&start.opcode) {
                if self.protocol_violation(format!(
                    "data frame using reserved opcode {}",
                    start.opcode
                )) {
                    return false;
                }
            }
            if !self.inside_message && start.opcode == opcode::CONTINUATION {
                if self.protocol_violation(
                    "received continuation data frame outside fragmented message".to_owned(),
                ) {
                    return false;
                }
            }
            if self.inside_message && start.opcode != opcode::CONTINUATION {
                if self.protocol_violation(
                    "received non-continuation data frame while inside fragmented message"
                        .to_owned(),
                ) {
                    return false;
                }
            }
            if self.compress.is_some() && start.rsv == RSV_COMPRESSED && self.inside_message {
                let reason = format!(
                    "received continuation data frame with compress bit set [{}]",
                    self.compression_name()
                );
                if self.protocol_violation(reason) {
                    return false;
                }
            }
        }

        let (header, header_len, error) = match FrameHeader::decode_lenient(&self.buffer) {
            Some(decoded) => decoded,
            None => return false,
        };
        if let Some(error) = error {
            if self.protocol_violation(error.to_string()) {
                return false;
            }
        }

        let masker = match header.mask {
            Some(mask) if header.length > 0 && self.config.protocol.apply_mask => {
                Some(XorMasker::new(mask, header.length))
            }
            _ => None,
        };
        self.buffer.advance(header_len);
        let length = header.length;
        self.current_frame = Some(CurrentFrame {
            header,
            masker,
            remaining: length,
            control_data: Vec::new(),
        });
        self.on_frame_begin();
        length == 0 || !self.buffer.is_empty()
    }

    fn process_frame_payload(&mut self) -> bool {
        let (data, done) = match self.current_frame.as_mut() {
            Some(frame) => {
                let take = frame.remaining.min(self.buffer.len() as u64) as usize;
                let mut data = self.buffer.split_to(take).to_vec();
                if let Some(masker) = frame.masker.as_mut() {
                    masker.process(&mut data);
                }
                frame.remaining -= take as u64;
                (data, frame.remaining == 0)
            }
            None => return false,
        };
        if !self.on_frame_data(data) {
            return false;
        }
        if done && !self.on_frame_end() {
            return false;
        }
        !self.buffer.is_empty()
    }

    fn on_frame_begin(&mut self) {
        let (opcode, rsv, length) = match &self.current_frame {
            Some(frame) => (frame.header.opcode, frame.header.rsv, frame.header.length),
            None => return,
        };
        if opcode > 7 {
            return;
        }

        if !self.inside_message {
            self.inside_message = true;
            self.message_is_compressed = false;
            if rsv == RSV_COMPRESSED {
                if let Some(compress) = self.compress.as_mut() {
                    self.message_is_compressed = true;
                    if let Err(err) = compress.start_decompress_message() {
                        self.fail_connection(WebSocketError::InvalidPayload(format!(
                            "failed to start decompressing message: {err}"
                        )));
                    }
                }
            }
            if opcode == opcode::TEXT && self.config.protocol.utf8_validate_incoming {
                self.utf8_validator.reset();
                self.utf8_validate_current_message = true;
                self.utf8_validate_last = Utf8Validation {
                    valid: true,
                    ends_on_codepoint: true,
                    current_index: 0,
                    total_index: 0,
                };
            } else {
                self.utf8_validate_current_message = false;
            }
            self.message_is_binary = opcode == opcode::BINARY;
            self.message_data.clear();
            self.message_data_total_length = 0;
        }

        self.message_data_total_length += length;
        if self.failed_by_me {
            return;
        }
        let max_message = self.config.protocol.max_message_payload_size as u64;
        let max_frame = self.config.protocol.max_frame_payload_size as u64;
        if max_message > 0 && self.message_data_total_length > max_message {
            self.fail_connection(WebSocketError::MessageTooBig(format!(
                "message exceeds payload limit of {max_message} octets"
            )));
        } else if max_frame > 0 && length > max_frame {
            self.fail_connection(WebSocketError::FrameTooBig(format!(
                "frame exceeds payload limit of {max_frame} octets"
            )));
        }
    }

    fn on_frame_data(&mut self, payload: Vec<u8>) -> bool {
        let is_control = match self.current_frame.as_mut() {
            Some(frame) if frame.header.is_control() => {
                frame.control_data.extend_from_slice(&payload);
                true
            }
            Some(_) => false,
            None => return false,
        };
        if is_control {
            return true;
        }

        let payload = if self.message_is_compressed {
            match self.compress.as_mut() {
                Some(compress) => match compress.decompress_message_data(&payload) {
                    Ok(payload) => payload,
                    Err(err) => {
                        return !self
                            .invalid_payload(format!("failed to decompress message: {err}"));
                    }
                },
                None => payload,
            }
        } else {
            payload
        };

        if self.utf8_validate_current_message {
            self.utf8_validate_last = self.utf8_validator.validate(&payload);
            if !self.utf8_validate_last.valid {
                let reason = format!(
                    "encountered invalid UTF-8 while processing text message at payload octet index {}",
                    self.utf8_validate_last.total_index
                );
                if self.invalid_payload(reason) {
                    return false;
                }
            }
        }

        if !self.failed_by_me {
            self.message_data.extend_from_slice(&payload);
        }
        true
    }

    fn on_frame_end(&mut self) -> bool {
        let frame = match self.current_frame.take() {
            Some(frame) => frame,
            None => return false,
        };
        if frame.header.is_control() {
            return self.process_control_frame(frame);
        }
        if !frame.header.fin {
            return true;
        }

        if self.message_is_compressed {
            if let Some(compress) = self.compress.as_mut() {
                if let Err(err) = compress.end_decompress_message() {
                    if self.invalid_payload(format!("failed to decompress message: {err}")) {
                        return false;
                    }
                }
            }
        }
        if self.utf8_validate_current_message && !self.utf8_validate_last.ends_on_codepoint {
            let reason = format!(
                "UTF-8 text message payload ended within Unicode code point at payload octet index {}",
                self.utf8_validate_last.total_index
            );
            if self.invalid_payload(reason) {
                return false;
            }
        }

        if !self.failed_by_me {
            let payload = std::mem::take(&mut self.message_data);
            let message = if self.message_is_binary {
                WebSocketMessage::Binary(payload)
            } else {
                match String::from_utf8(payload) {
                    Ok(text) => WebSocketMessage::Text(text),
                    Err(err) => WebSocketMessage::Text(
                        String::from_utf8_lossy(err.as_bytes()).into_owned(),
                    ),
                }
            };
            self.events.push_back(ProtocolEvent::Message(message));
        }
        self.inside_message = false;
        true
    }

    fn process_control_frame(&mut self, frame: CurrentFrame) -> bool {
        let payload = frame.control_data;
        match frame.header.opcode {
            opcode::CLOSE => {
                let mut code = None;
                let mut reason = None;
                if payload.len() > 1 {
                    code = Some(u16::from_be_bytes([payload[0], payload[1]]));
                    if payload.len() > 2 {
                        reason = Some(payload[2..].to_vec());
                    }
                }
                if self.on_close_frame(code, reason) {
                    return false;
                }
            }
            opcode::PING => {
                if self.state == State::Open {
                    if let Err(err) = self.send_pong(&payload) {
                        warn!("Failed to answer ping from {}: {err}", self.peer);
                    }
                }
                self.events.push_back(ProtocolEvent::Ping(payload));
            }
            opcode::PONG => {
                if self
                    .auto_ping_pending
                    .as_ref()
                    .is_some_and(|pending| *pending == payload)
                {
                    self.auto_ping_pending = None;
                    self.auto_ping_timeout_deadline = None;
                    if let Some(interval) = self.config.protocol.auto_ping_interval {
                        self.auto_ping_deadline = Some(Instant::now() + interval);
                    }
                } else if self.auto_ping_pending.is_some() {
                    debug!(
                        "Received pong from {} that does not match the pending automatic ping",
                        self.peer
                    );
                }
                self.events.push_back(ProtocolEvent::Pong(payload));
            }
            _ => (),
        }
        true
    }

    /// Handles a received close frame.
    ///
    /// Returns true if processing should stop.
    fn on_close_frame(&mut self, code: Option<u16>, reason: Option<Vec<u8>>) -> bool {
        self.remote_close_code = None;
        self.remote_close_reason = None;

        match code.map(CloseCode) {
            Some(code) if !code.is_allowed_on_wire() => {
                if self.protocol_violation(format!("invalid close code {code}")) {
                    return true;
                }
                self.remote_close_code = Some(CloseCode::NORMAL);
            }
            code => self.remote_close_code = code,
        }

        if let Some(reason) = reason {
            if !is_valid_utf8(&reason) {
                if self.invalid_payload("invalid close reason (non-UTF8 payload)".to_owned()) {
                    return true;
                }
            } else {
                self.remote_close_reason = String::from_utf8(reason).ok();
            }
        }

        match self.state {
            State::Closing => {
                // The peer answered our close.
                self.close_handshake_deadline = None;
                self.was_clean = true;
                match self.config.role {
                    Role::Server => self.drop_connection(),
                    Role::Client => self.start_server_connection_drop_timer(),
                }
            }
            State::Open => {
                // The peer initiated the closing handshake.
                self.was_clean = true;
                if self.config.protocol.echo_close_code_reason {
                    let reason = self
                        .remote_close_reason
                        .as_deref()
                        .map(|reason| encode_truncate(reason, MAX_CLOSE_REASON));
                    self.send_close_frame(self.remote_close_code, reason, true);
                } else {
                    self.send_close_frame(Some(CloseCode::NORMAL), None, true);
                }
                match self.config.role {
                    Role::Server => self.drop_connection(),
                    Role::Client => self.start_server_connection_drop_timer(),
                }
            }
            State::Closed => {
                self.was_clean = false;
            }
            State::Connecting => (),
        }
        false
    }

    fn start_server_connection_drop_timer(&mut self) {
        if let Some(timeout) = self.config.server_connection_drop_timeout {
            self.server_connection_drop_deadline = Some(Instant::now() + timeout);
        }
    }

    fn queue(&mut self, data: BytesMut, sync: bool) {
        self.outgoing.push_back(Outgoing {
            data: data.freeze(),
            sync,
        });
    }

    fn frame_mask(&self) -> Option<[u8; 4]> {
        if self.config.mask_frames {
            Some(rand::random::<[u8; 4]>())
        } else {
            None
        }
    }

    /// Queues a single frame.
    ///
    /// With a `chop_size`, the encoded frame is queued in chunks of at most that many octets, and
    /// the writer yields between chunks.
    pub fn send_frame(
        &mut self,
        opcode: u8,
        payload: &[u8],
        fin: bool,
        rsv: u8,
        mask: Option<[u8; 4]>,
        chop_size: Option<usize>,
    ) {
        let mask = mask.or_else(|| self.frame_mask());
        let frame = encode_frame(opcode, payload, fin, rsv, mask, true);
        match chop_size {
            Some(chop_size) if chop_size > 0 && frame.len() > chop_size => {
                for chunk in frame.chunks(chop_size) {
                    self.queue(BytesMut::from(chunk), true);
                }
            }
            _ => self.queue(frame, false),
        }
    }

    fn send_close_frame(&mut self, code: Option<CloseCode>, reason: Option<Vec<u8>>, reply: bool) {
        match self.state {
            State::Closing => debug!("Ignoring close of {}: already closing", self.peer),
            State::Closed => debug!("Ignoring close of {}: already closed", self.peer),
            State::Connecting => warn!("Cannot close connection to {}: not connected", self.peer),
            State::Open => {
                let mut payload = Vec::new();
                if let Some(code) = code {
                    payload.extend_from_slice(&code.0.to_be_bytes());
                }
                if let Some(reason) = &reason {
                    payload.extend_from_slice(reason);
                }
                self.send_frame(opcode::CLOSE, &payload, true, 0, None, None);
                self.set_state(State::Closing);
                self.closed_by_me = !reply;
                self.local_close_code = code;
                self.local_close_reason = reason;
                if self.closed_by_me {
                    if let Some(timeout) = self.config.protocol.close_handshake_timeout {
                        self.close_handshake_deadline = Some(Instant::now() + timeout);
                    }
                }
            }
        }
    }

    /// Starts the closing handshake.
    ///
    /// An application may only close with code 1000 or a code in [3000, 4999]. A reason requires a
    /// code, and is truncated to fit in the close frame.
    pub fn send_close(&mut self, code: Option<CloseCode>, reason: Option<&str>) -> Result<()> {
        if let Some(code) = code {
            if !code.is_allowed_for_application() {
                return Err(WebSocketError::Protocol(format!(
                    "invalid close code {code} (must be 1000 or from [3000, 4999])"
                ))
                .into());
            }
        }
        let reason = match reason {
            Some(reason) => {
                if code.is_none() {
                    return Err(WebSocketError::Protocol("close reason without close code".to_owned()).into());
                }
                Some(encode_truncate(reason, MAX_CLOSE_REASON))
            }
            None => None,
        };
        if self.state == State::Connecting {
            return Err(WebSocketError::Closed.into());
        }
        self.send_close_frame(code, reason, false);
        Ok(())
    }

    fn check_control_payload(&self, kind: &str, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(WebSocketError::Protocol(format!(
                "invalid payload for {kind} (payload length must be <= {MAX_CONTROL_PAYLOAD}, was {})",
                payload.len()
            ))
            .into());
        }
        Ok(())
    }

    /// Sends a ping. Does nothing unless the connection is open.
    pub fn send_ping(&mut self, payload: &[u8]) -> Result<()> {
        if self.state != State::Open {
            return Ok(());
        }
        self.check_control_payload("PING", payload)?;
        self.send_frame(opcode::PING, payload, true, 0, None, None);
        Ok(())
    }

    /// Sends a pong. Does nothing unless the connection is open.
    pub fn send_pong(&mut self, payload: &[u8]) -> Result<()> {
        if self.state != State::Open {
            return Ok(());
        }
        self.check_control_payload("PONG", payload)?;
        self.send_frame(opcode::PONG, payload, true, 0, None, None);
        Ok(())
    }

    /// Sends a complete message, fragmenting according to the configured automatic fragment size.
    pub fn send_message(&mut self, payload: &[u8], binary: bool) -> Result<()> {
        self.send_message_with(payload, binary, None, false)
    }

    /// Sends a complete message.
    ///
    /// The message is compressed if compression was negotiated, unless `do_not_compress` is set.
    /// It is then split into frames of at most `fragment_size` octets, falling back to the
    /// automatic fragment size.
    pub fn send_message_with(
        &mut self,
        payload: &[u8],
        binary: bool,
        fragment_size: Option<usize>,
        do_not_compress: bool,
    ) -> Result<()> {
        if self.state != State::Open {
            return Err(WebSocketError::Closed.into());
        }

        let (payload, rsv) = match self.compress.as_mut() {
            Some(compress) if !do_not_compress => {
                compress.start_compress_message()?;
                let mut compressed = compress.compress_message_data(payload)?;
                compressed.extend(compress.end_compress_message()?);
                (compressed, RSV_COMPRESSED)
            }
            _ => (payload.to_vec(), 0),
        };

        let message_opcode = if binary { opcode::BINARY } else { opcode::TEXT };
        let fragment_size = fragment_size.unwrap_or(self.config.protocol.auto_fragment_size);
        if fragment_size > 0 && payload.len() > fragment_size {
            let chunks = payload.chunks(fragment_size).collect::<Vec<_>>();
            let last = chunks.len() - 1;
            for (i, chunk) in chunks.into_iter().enumerate() {
                let (opcode, rsv) = if i == 0 {
                    (message_opcode, rsv)
                } else {
                    (opcode::CONTINUATION, 0)
                };
                self.send_frame(opcode, chunk, i == last, rsv, None, None);
            }
        } else {
            self.send_frame(message_opcode, &payload, true, rsv, None, None);
        }
        Ok(())
    }
}

#[cfg(test)]
mod protocol_test {
    use std::time::Duration;

    use bytes::BytesMut;

    use crate::websocket::{
        close::CloseCode,
        compression::compression_test_util::FlippingCompress,
        error::WebSocketError,
        frame::{
            FrameHeader,
            encode_frame,
            opcode,
        },
        options::{
            ClientOptions,
            ProtocolOptions,
            ServerOptions,
        },
        protocol::{
            ProtocolConfig,
            ProtocolEvent,
            State,
            WebSocketMessage,
            WebSocketProtocol,
        },
    };

    const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    fn server(protocol: ProtocolOptions) -> WebSocketProtocol {
        let options = ServerOptions {
            protocol,
            ..Default::default()
        };
        let mut engine = WebSocketProtocol::new(ProtocolConfig::server(&options), "test", None);
        engine.open();
        engine
    }

    fn client(protocol: ProtocolOptions) -> WebSocketProtocol {
        let options = ClientOptions {
            protocol,
            ..Default::default()
        };
        let mut engine = WebSocketProtocol::new(ProtocolConfig::client(&options), "test", None);
        engine.open();
        engine
    }

    fn no_drop() -> ProtocolOptions {
        ProtocolOptions {
            fail_by_drop: false,
            ..Default::default()
        }
    }

    fn transmitted(engine: &mut WebSocketProtocol) -> Vec<u8> {
        let mut out = BytesMut::new();
        while let Some(outgoing) = engine.poll_transmit() {
            out.extend_from_slice(&outgoing.data);
        }
        out.to_vec()
    }

    fn events(engine: &mut WebSocketProtocol) -> Vec<ProtocolEvent> {
        let mut events = Vec::new();
        while let Some(event) = engine.poll_event() {
            events.push(event);
        }
        events
    }

    #[test]
    fn receives_masked_hello() {
        let mut engine = server(ProtocolOptions::default());
        engine.receive(&[
            0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
        ]);
        pretty_assertions::assert_eq!(
            events(&mut engine),
            vec![ProtocolEvent::Message(WebSocketMessage::Text(
                "Hello".to_owned()
            ))]
        );
    }

    #[test]
    fn receives_frames_split_across_reads() {
        let mut engine = server(ProtocolOptions::default());
        let frame = encode_frame(opcode::BINARY, &[7u8; 300], true, 0, Some(MASK), true);
        for chunk in frame.chunks(7) {
            engine.receive(chunk);
        }
        pretty_assertions::assert_eq!(
            events(&mut engine),
            vec![ProtocolEvent::Message(WebSocketMessage::Binary(vec![
                7u8;
                300
            ]))]
        );
    }

    #[test]
    fn assembles_fragmented_messages_with_interleaved_control_frames() {
        let mut engine = server(ProtocolOptions::default());
        let mut bytes = encode_frame(opcode::TEXT, b"Hel", false, 0, Some(MASK), true);
        bytes.extend(encode_frame(opcode::PING, b"p", true, 0, Some(MASK), true));
        bytes.extend(encode_frame(opcode::CONTINUATION, b"lo", true, 0, Some(MASK), true));
        engine.receive(&bytes);
        pretty_assertions::assert_eq!(
            events(&mut engine),
            vec![
                ProtocolEvent::Ping(b"p".to_vec()),
                ProtocolEvent::Message(WebSocketMessage::Text("Hello".to_owned())),
            ]
        );
        // The ping is answered with an unmasked pong.
        pretty_assertions::assert_eq!(transmitted(&mut engine), vec![0x8a, 0x01, b'p']);
    }

    #[test]
    fn delivers_empty_messages() {
        let mut engine = server(ProtocolOptions::default());
        engine.receive(&encode_frame(opcode::BINARY, b"", true, 0, Some(MASK), true));
        pretty_assertions::assert_eq!(
            events(&mut engine),
            vec![ProtocolEvent::Message(WebSocketMessage::Binary(Vec::new()))]
        );
    }

    #[test]
    fn oversized_ping_fails_with_protocol_error() {
        let mut engine = server(no_drop());
        engine.receive(&encode_frame(opcode::PING, &[0u8; 126], true, 0, Some(MASK), true));
        assert_matches::assert_matches!(engine.failure(), Some(WebSocketError::Protocol(reason)) => {
            pretty_assertions::assert_eq!(reason, "control frame with payload length > 125 octets");
        });
        pretty_assertions::assert_eq!(engine.local_close_code(), Some(CloseCode::PROTOCOL_ERROR));
        pretty_assertions::assert_eq!(engine.state(), State::Closing);
        let out = transmitted(&mut engine);
        pretty_assertions::assert_eq!(&out[..4], &[0x88, 48, 0x03, 0xea]);
        pretty_assertions::assert_eq!(
            &out[4..],
            b"control frame with payload length > 125 octets"
        );
    }

    #[test]
    fn oversized_ping_drops_connection_with_fail_by_drop() {
        let mut engine = server(ProtocolOptions::default());
        engine.receive(&encode_frame(opcode::PING, &[0u8; 126], true, 0, Some(MASK), true));
        pretty_assertions::assert_eq!(
            engine.failure().and_then(|err| err.close_code()),
            Some(CloseCode::PROTOCOL_ERROR)
        );
        assert!(engine.should_drop());
        assert!(transmitted(&mut engine).is_empty());
        let status = engine.connection_lost();
        assert!(!status.was_clean);
        pretty_assertions::assert_eq!(status.code, Some(CloseCode::ABNORMAL_CLOSE));
        assert_matches::assert_matches!(status.reason, Some(reason) => {
            assert!(reason.starts_with("connection was closed uncleanly (I dropped the WebSocket TCP connection: control frame"), "{reason}");
        });
    }

    #[test]
    fn server_rejects_unmasked_frames() {
        let mut engine = server(ProtocolOptions::default());
        engine.receive(&encode_frame(opcode::TEXT, b"hi", true, 0, None, true));
        assert_matches::assert_matches!(engine.failure(), Some(WebSocketError::Protocol(reason)) => {
            pretty_assertions::assert_eq!(reason, "unmasked client-to-server frame");
        });
    }

    #[test]
    fn client_rejects_masked_frames() {
        let mut engine = client(ProtocolOptions::default());
        engine.receive(&encode_frame(opcode::TEXT, b"hi", true, 0, Some(MASK), true));
        assert_matches::assert_matches!(engine.failure(), Some(WebSocketError::Protocol(reason)) => {
            pretty_assertions::assert_eq!(reason, "masked server-to-client frame");
        });
    }

    #[test]
    fn rejects_reserved_bits_and_opcodes() {
        let mut engine = server(ProtocolOptions::default());
        engine.receive(&encode_frame(opcode::TEXT, b"hi", true, 4, Some(MASK), true));
        assert_matches::assert_matches!(engine.failure(), Some(WebSocketError::Protocol(reason)) => {
            pretty_assertions::assert_eq!(reason, "RSV = 4 and no extension negotiated");
        });

        let mut engine = server(ProtocolOptions::default());
        engine.receive(&encode_frame(3, b"hi", true, 0, Some(MASK), true));
        assert_matches::assert_matches!(engine.failure(), Some(WebSocketError::Protocol(reason)) => {
            pretty_assertions::assert_eq!(reason, "data frame using reserved opcode 3");
        });

        let mut engine = server(ProtocolOptions::default());
        engine.receive(&encode_frame(11, b"", true, 0, Some(MASK), true));
        assert_matches::assert_matches!(engine.failure(), Some(WebSocketError::Protocol(reason)) => {
            pretty_assertions::assert_eq!(reason, "control frame using reserved opcode 11");
        });
    }

    #[test]
    fn rejects_bad_fragmentation() {
        let mut engine = server(ProtocolOptions::default());
        engine.receive(&encode_frame(opcode::CONTINUATION, b"x", true, 0, Some(MASK), true));
        assert_matches::assert_matches!(engine.failure(), Some(WebSocketError::Protocol(reason)) => {
            pretty_assertions::assert_eq!(reason, "received continuation data frame outside fragmented message");
        });

        let mut engine = server(ProtocolOptions::default());
        let mut bytes = encode_frame(opcode::TEXT, b"x", false, 0, Some(MASK), true);
        bytes.extend(encode_frame(opcode::TEXT, b"y", true, 0, Some(MASK), true));
        engine.receive(&bytes);
        assert_matches::assert_matches!(engine.failure(), Some(WebSocketError::Protocol(reason)) => {
            pretty_assertions::assert_eq!(reason, "received non-continuation data frame while inside fragmented message");
        });

        let mut engine = server(ProtocolOptions::default());
        engine.receive(&encode_frame(opcode::PING, b"x", false, 0, Some(MASK), true));
        assert_matches::assert_matches!(engine.failure(), Some(WebSocketError::Protocol(reason)) => {
            pretty_assertions::assert_eq!(reason, "fragmented control frame");
        });
    }

    #[test]
    fn rejects_non_minimal_length_encoding() {
        let mut engine = server(ProtocolOptions::default());
        let mut bytes = vec![0x82, 0xfe, 0x00, 0x05];
        bytes.extend_from_slice(&MASK);
        bytes.extend_from_slice(&[0; 5]);
        engine.receive(&bytes);
        assert_matches::assert_matches!(engine.failure(), Some(WebSocketError::Protocol(reason)) => {
            pretty_assertions::assert_eq!(reason, "invalid data frame length (not using minimal length encoding)");
        });
    }

    #[test]
    fn fails_invalid_utf8_with_invalid_payload() {
        let mut engine = server(no_drop());
        engine.receive(&encode_frame(opcode::TEXT, &[b'a', 0xff], true, 0, Some(MASK), true));
        assert_matches::assert_matches!(engine.failure(), Some(WebSocketError::InvalidPayload(reason)) => {
            pretty_assertions::assert_eq!(reason, "encountered invalid UTF-8 while processing text message at payload octet index 1");
        });
        pretty_assertions::assert_eq!(engine.local_close_code(), Some(CloseCode::INVALID_PAYLOAD));
        assert!(events(&mut engine).is_empty());
    }

    #[test]
    fn fails_text_ending_inside_code_point() {
        let mut engine = server(ProtocolOptions::default());
        engine.receive(&encode_frame(opcode::TEXT, &[b'a', 0xce], true, 0, Some(MASK), true));
        assert_matches::assert_matches!(engine.failure(), Some(WebSocketError::InvalidPayload(reason)) => {
            pretty_assertions::assert_eq!(reason, "UTF-8 text message payload ended within Unicode code point at payload octet index 2");
        });
    }

    #[test]
    fn accepts_code_point_split_across_fragments() {
        let mut engine = server(ProtocolOptions::default());
        let text = "κ".as_bytes();
        let mut bytes = encode_frame(opcode::TEXT, &text[..1], false, 0, Some(MASK), true);
        bytes.extend(encode_frame(opcode::CONTINUATION, &text[1..], true, 0, Some(MASK), true));
        engine.receive(&bytes);
        assert!(engine.failure().is_none());
        pretty_assertions::assert_eq!(
            events(&mut engine),
            vec![ProtocolEvent::Message(WebSocketMessage::Text("κ".to_owned()))]
        );
    }

    #[test]
    fn enforces_payload_limits() {
        let mut engine = server(ProtocolOptions {
            max_frame_payload_size: 4,
            ..no_drop()
        });
        engine.receive(&encode_frame(opcode::BINARY, &[0; 5], true, 0, Some(MASK), true));
        assert_matches::assert_matches!(engine.failure(), Some(WebSocketError::FrameTooBig(reason)) => {
            pretty_assertions::assert_eq!(reason, "frame exceeds payload limit of 4 octets");
        });
        pretty_assertions::assert_eq!(engine.local_close_code(), Some(CloseCode::POLICY_VIOLATION));

        let mut engine = server(ProtocolOptions {
            max_message_payload_size: 6,
            ..no_drop()
        });
        let mut bytes = encode_frame(opcode::BINARY, &[0; 4], false, 0, Some(MASK), true);
        bytes.extend(encode_frame(opcode::CONTINUATION, &[0; 4], true, 0, Some(MASK), true));
        engine.receive(&bytes);
        assert_matches::assert_matches!(engine.failure(), Some(WebSocketError::MessageTooBig(reason)) => {
            pretty_assertions::assert_eq!(reason, "message exceeds payload limit of 6 octets");
        });
        pretty_assertions::assert_eq!(engine.local_close_code(), Some(CloseCode::MESSAGE_TOO_BIG));
        assert!(events(&mut engine).is_empty());
    }

    #[test]
    fn server_echoes_close_and_drops() {
        let mut engine = server(ProtocolOptions::default());
        let mut payload = 3001u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"bye");
        engine.receive(&encode_frame(opcode::CLOSE, &payload, true, 0, Some(MASK), true));
        pretty_assertions::assert_eq!(transmitted(&mut engine), vec![0x88, 0x02, 0x03, 0xe8]);
        assert!(engine.should_drop());
        let status = engine.connection_lost();
        assert!(status.was_clean);
        pretty_assertions::assert_eq!(status.code, Some(CloseCode(3001)));
        pretty_assertions::assert_eq!(status.reason, Some("bye".to_owned()));
    }

    #[test]
    fn echoes_close_code_and_reason_when_configured() {
        let mut engine = server(ProtocolOptions {
            echo_close_code_reason: true,
            ..Default::default()
        });
        let mut payload = 3001u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"bye");
        engine.receive(&encode_frame(opcode::CLOSE, &payload, true, 0, Some(MASK), true));
        pretty_assertions::assert_eq!(
            transmitted(&mut engine),
            vec![0x88, 0x05, 0x0b, 0xb9, b'b', b'y', b'e']
        );
    }

    #[test]
    fn rejects_invalid_close_frames() {
        let mut engine = server(ProtocolOptions::default());
        engine.receive(&encode_frame(opcode::CLOSE, &1005u16.to_be_bytes(), true, 0, Some(MASK), true));
        assert_matches::assert_matches!(engine.failure(), Some(WebSocketError::Protocol(reason)) => {
            pretty_assertions::assert_eq!(reason, "invalid close code 1005");
        });

        let mut engine = server(ProtocolOptions::default());
        engine.receive(&encode_frame(opcode::CLOSE, &[0x03], true, 0, Some(MASK), true));
        assert_matches::assert_matches!(engine.failure(), Some(WebSocketError::Protocol(reason)) => {
            pretty_assertions::assert_eq!(reason, "received close control frame with payload len 1");
        });

        let mut engine = server(ProtocolOptions::default());
        engine.receive(&encode_frame(opcode::CLOSE, &[0x03, 0xe8, 0xff], true, 0, Some(MASK), true));
        assert_matches::assert_matches!(engine.failure(), Some(WebSocketError::InvalidPayload(reason)) => {
            pretty_assertions::assert_eq!(reason, "invalid close reason (non-UTF8 payload)");
        });
    }

    #[tokio::test(start_paused = true)]
    async fn client_close_handshake_waits_for_server_drop() {
        let mut engine = client(ProtocolOptions::default());
        engine.send_close(Some(CloseCode::NORMAL), Some("done")).unwrap();
        pretty_assertions::assert_eq!(engine.state(), State::Closing);
        assert!(engine.closed_by_me());
        let out = transmitted(&mut engine);
        let (header, _) = FrameHeader::decode(&out).unwrap().unwrap();
        pretty_assertions::assert_eq!(header.opcode, opcode::CLOSE);
        assert!(header.mask.is_some());

        engine.receive(&encode_frame(opcode::CLOSE, &1000u16.to_be_bytes(), true, 0, None, true));
        assert!(engine.was_clean());
        assert!(!engine.should_drop());

        // The server never drops the connection.
        tokio::time::advance(Duration::from_secs(2)).await;
        engine.handle_timeout();
        assert!(engine.should_drop());
        let status = engine.connection_lost();
        assert!(!status.was_clean);
        pretty_assertions::assert_eq!(
            status.reason,
            Some("connection was closed uncleanly (WebSocket closing handshake timeout (server did not drop TCP connection in time))".to_owned())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn close_handshake_times_out() {
        let mut engine = server(ProtocolOptions::default());
        engine.send_close(None, None).unwrap();
        assert!(engine.next_deadline().is_some());
        tokio::time::advance(Duration::from_secs(2)).await;
        engine.handle_timeout();
        assert!(engine.should_drop());
        assert!(!engine.connection_lost().was_clean);
    }

    #[test]
    fn validates_application_close() {
        let mut engine = server(ProtocolOptions::default());
        assert_matches::assert_matches!(engine.send_close(Some(CloseCode::GOING_AWAY), None), Err(_));
        assert_matches::assert_matches!(engine.send_close(None, Some("reason")), Err(_));
        assert_matches::assert_matches!(engine.send_close(Some(CloseCode(4000)), Some(&"x".repeat(200))), Ok(()));
        let out = transmitted(&mut engine);
        pretty_assertions::assert_eq!(out[1], 125);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_ping_expects_matching_pong() {
        let mut engine = server(ProtocolOptions {
            auto_ping_interval: Some(Duration::from_secs(10)),
            auto_ping_timeout: Some(Duration::from_secs(5)),
            auto_ping_size: 8,
            ..Default::default()
        });
        tokio::time::advance(Duration::from_secs(10)).await;
        engine.handle_timeout();
        let out = transmitted(&mut engine);
        pretty_assertions::assert_eq!(&out[..2], &[0x89, 8]);
        let payload = out[2..].to_vec();

        // A matching pong cancels the timeout and schedules the next ping.
        engine.receive(&encode_frame(opcode::PONG, &payload, true, 0, Some(MASK), true));
        tokio::time::advance(Duration::from_secs(6)).await;
        engine.handle_timeout();
        assert!(!engine.should_drop());

        tokio::time::advance(Duration::from_secs(4)).await;
        engine.handle_timeout();
        assert!(!transmitted(&mut engine).is_empty());
        tokio::time::advance(Duration::from_secs(5)).await;
        engine.handle_timeout();
        assert!(engine.should_drop());
        pretty_assertions::assert_eq!(
            engine.connection_lost().reason,
            Some("connection was closed uncleanly (WebSocket ping timeout (peer did not respond with pong in time))".to_owned())
        );
    }

    #[test]
    fn fragments_and_masks_outgoing_messages() {
        let mut engine = client(ProtocolOptions {
            auto_fragment_size: 2,
            ..Default::default()
        });
        engine.send_message(b"abcde", false).unwrap();
        let out = transmitted(&mut engine);

        let mut server = server(ProtocolOptions::default());
        server.receive(&out);
        pretty_assertions::assert_eq!(
            events(&mut server),
            vec![ProtocolEvent::Message(WebSocketMessage::Text("abcde".to_owned()))]
        );

        let (first, _) = FrameHeader::decode(&out).unwrap().unwrap();
        pretty_assertions::assert_eq!(first.opcode, opcode::TEXT);
        assert!(!first.fin);
    }

    #[test]
    fn compresses_messages_with_negotiated_extension() {
        let options = ServerOptions::default();
        let mut sender = WebSocketProtocol::new(
            ProtocolConfig::server(&options),
            "sender",
            Some(Box::new(FlippingCompress)),
        );
        sender.open();
        sender.send_message(b"abc", true).unwrap();
        let out = transmitted(&mut sender);
        // RSV1 is set and the payload is transformed.
        pretty_assertions::assert_eq!(out[0], 0xc2);
        pretty_assertions::assert_ne!(&out[2..], b"abc");

        let options = ClientOptions::default();
        let mut receiver = WebSocketProtocol::new(
            ProtocolConfig::client(&options),
            "receiver",
            Some(Box::new(FlippingCompress)),
        );
        receiver.open();
        receiver.receive(&out);
        pretty_assertions::assert_eq!(
            events(&mut receiver),
            vec![ProtocolEvent::Message(WebSocketMessage::Binary(b"abc".to_vec()))]
        );
    }

    #[test]
    fn rejects_sending_when_not_open() {
        let mut engine = server(ProtocolOptions::default());
        engine.send_close(None, None).unwrap();
        assert_matches::assert_matches!(engine.send_message(b"late", false), Err(err) => {
            assert_matches::assert_matches!(err.downcast_ref::<WebSocketError>(), Some(WebSocketError::Closed));
        });
        assert_matches::assert_matches!(engine.send_ping(&[0; 200]), Ok(()));
    }

    #[test]
    fn peer_drop_is_unclean() {
        let mut engine = server(ProtocolOptions::default());
        let status = engine.connection_lost();
        assert!(!status.was_clean);
        pretty_assertions::assert_eq!(
            status.reason,
            Some("connection was closed uncleanly (peer dropped the TCP connection without previous WebSocket closing handshake)".to_owned())
        );
    }
}
