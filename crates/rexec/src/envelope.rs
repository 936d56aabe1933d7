use crate::error::BrokerError;
use crate::types::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Value the protocol uses for envelope fields that carry nothing.
pub const PLACEHOLDER: &str = "__";

/// A message on any broker channel.
///
/// Every channel carries the same six fields. `cmd` and `opt` select a
/// [`Command`]; the meaning of the remaining fields depends on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub cmd: String,
    pub opt: String,
    pub actname: String,
    pub actid: String,
    pub actarg: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Whether an invocation blocks the control plane on a result survey.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Sync,
    Async,
}

impl Mode {
    pub fn wire(&self) -> &'static str {
        match self {
            Mode::Sync => "SYN",
            Mode::Async => "ASY",
        }
    }

    fn parse(opt: &str) -> Option<Self> {
        match opt {
            "SYN" => Some(Mode::Sync),
            "ASY" => Some(Mode::Async),
            _ => None,
        }
    }
}

/// Whether a registering peer kept its claimed id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdAssignment {
    Original,
    Alternate,
}

/// Reason code carried by a `REXEC-NAK`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NakReason {
    NotFound,
    IllegalParams,
}

impl NakReason {
    pub fn wire(&self) -> &'static str {
        match self {
            NakReason::NotFound => "NOT-FOUND",
            NakReason::IllegalParams => "ILLEGAL-PARAMS",
        }
    }
}

/// The closed command catalog, keyed on the envelope's `(cmd, opt)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `REGISTER/DEVICE`: a peer asks for a private request channel.
    Register,
    /// `REGISTER-ACK/{ORI,ALT}`: assigned port and final device id.
    RegisterAck(IdAssignment),
    /// `REXEC-CALL`: an operation broadcast to the fleet.
    RexecCall(Mode),
    /// `REXEC`: a peer invokes an operation registered on the broker.
    Rexec(Mode),
    RexecAck(Mode),
    RexecNak(Mode),
    /// `REXEC-RDY`: a peer is ready to run the call named in `actarg`.
    RexecReady(Mode),
    /// `REXEC-STA`: the peer is admitted to execute.
    RexecStart(Mode),
    /// `REXEC-QUI`: the peer must stand down.
    RexecQuit(Mode),
    /// `REXEC-RES/GET`: poll an activity result.
    ResultGet,
    /// `REXEC-RES/PUT`: deliver an activity result.
    ResultPut,
    /// `REXEC-KILL`: best-effort request to abandon a run.
    RexecKill,
    /// `REPORT-REQ`: ask surveyed peers for their results.
    ReportReq,
    Ping,
    Pong,
}

impl Command {
    /// Parse a `(cmd, opt)` pair. Unknown pairs are an error for the single
    /// message carrying them.
    pub fn parse(cmd: &str, opt: &str) -> Result<Self, BrokerError> {
        let mode = Mode::parse(opt);
        let command = match (cmd, opt) {
            ("REGISTER", "DEVICE") => Some(Command::Register),
            ("REGISTER-ACK", "ORI") => Some(Command::RegisterAck(IdAssignment::Original)),
            ("REGISTER-ACK", "ALT") => Some(Command::RegisterAck(IdAssignment::Alternate)),
            ("REXEC-CALL", _) => mode.map(Command::RexecCall),
            ("REXEC", _) => mode.map(Command::Rexec),
            ("REXEC-ACK", _) => mode.map(Command::RexecAck),
            ("REXEC-NAK", _) => mode.map(Command::RexecNak),
            ("REXEC-RDY", _) => mode.map(Command::RexecReady),
            ("REXEC-STA", _) => mode.map(Command::RexecStart),
            ("REXEC-QUI", _) => mode.map(Command::RexecQuit),
            ("REXEC-RES", "GET") => Some(Command::ResultGet),
            ("REXEC-RES", "PUT") => Some(Command::ResultPut),
            ("REXEC-KILL", _) => Some(Command::RexecKill),
            ("REPORT-REQ", _) => Some(Command::ReportReq),
            // Heartbeats are recognised on `cmd` alone.
            ("PING", _) => Some(Command::Ping),
            ("PONG", _) => Some(Command::Pong),
            _ => None,
        };
        command.ok_or_else(|| BrokerError::UnknownCommand {
            cmd: cmd.to_string(),
            opt: opt.to_string(),
        })
    }

    /// Wire form of this command.
    pub fn wire(&self) -> (&'static str, &'static str) {
        match self {
            Command::Register => ("REGISTER", "DEVICE"),
            Command::RegisterAck(IdAssignment::Original) => ("REGISTER-ACK", "ORI"),
            Command::RegisterAck(IdAssignment::Alternate) => ("REGISTER-ACK", "ALT"),
            Command::RexecCall(m) => ("REXEC-CALL", m.wire()),
            Command::Rexec(m) => ("REXEC", m.wire()),
            Command::RexecAck(m) => ("REXEC-ACK", m.wire()),
            Command::RexecNak(m) => ("REXEC-NAK", m.wire()),
            Command::RexecReady(m) => ("REXEC-RDY", m.wire()),
            Command::RexecStart(m) => ("REXEC-STA", m.wire()),
            Command::RexecQuit(m) => ("REXEC-QUI", m.wire()),
            Command::ResultGet => ("REXEC-RES", "GET"),
            Command::ResultPut => ("REXEC-RES", "PUT"),
            Command::RexecKill => ("REXEC-KILL", "SYN"),
            Command::ReportReq => ("REPORT-REQ", "SYN"),
            Command::Ping => ("PING", "DEVICE"),
            Command::Pong => ("PONG", "DEVICE"),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (cmd, opt) = self.wire();
        write!(f, "{cmd}/{opt}")
    }
}

impl Envelope {
    /// Create an envelope for `command` with placeholder payload fields.
    pub fn new(command: Command) -> Self {
        let (cmd, opt) = command.wire();
        Self {
            cmd: cmd.to_string(),
            opt: opt.to_string(),
            actname: PLACEHOLDER.to_string(),
            actid: PLACEHOLDER.to_string(),
            actarg: PLACEHOLDER.to_string(),
            args: Vec::new(),
        }
    }

    /// A `REXEC-CALL` broadcast for operation `name`. `actid` is left as a
    /// placeholder until the run id is known.
    pub fn call(mode: Mode, name: &str, expr: &str, args: Vec<Value>) -> Self {
        Envelope::new(Command::RexecCall(mode))
            .with_actname(name)
            .with_actarg(expr)
            .with_args(args)
    }

    pub fn with_actname(mut self, actname: impl Into<String>) -> Self {
        self.actname = actname.into();
        self
    }

    pub fn with_actid(mut self, actid: impl Into<String>) -> Self {
        self.actid = actid.into();
        self
    }

    pub fn with_actarg(mut self, actarg: impl Into<String>) -> Self {
        self.actarg = actarg.into();
        self
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// Build a reply to this envelope that echoes its `actid` and `actarg`.
    pub fn reply(&self, command: Command, actname: &str) -> Self {
        Envelope::new(command)
            .with_actname(actname)
            .with_actid(self.actid.clone())
            .with_actarg(self.actarg.clone())
    }

    /// Classify this envelope against the command catalog.
    pub fn command(&self) -> Result<Command, BrokerError> {
        Command::parse(&self.cmd, &self.opt)
    }

    /// Encode as a MessagePack map.
    pub fn encode(&self) -> Result<Vec<u8>, BrokerError> {
        rmp_serde::to_vec_named(self).map_err(|e| BrokerError::MalformedEnvelope {
            reason: "failed to encode envelope".to_string(),
            source: Some(Box::new(e)),
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BrokerError> {
        rmp_serde::from_slice(bytes).map_err(|e| BrokerError::MalformedEnvelope {
            reason: format!("failed to decode {} byte envelope", bytes.len()),
            source: Some(Box::new(e)),
        })
    }
}
