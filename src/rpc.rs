//! The RPC bridge
//!
//! Signature-typed remote procedure calls over any half-duplex transport.
//! A *command* is a boxed handler plus a signature string assembled from
//! the method name and the wire type names of its arguments and result
//! (`"multiply(i32) -> i32"`). Commands are addressed by a string uuid
//! which defaults to the signature itself; a client can therefore look up
//! the uuid in its own table, and may probe the server's signature for the
//! same uuid before committing to a call.
//!
//! On the wire every logical call is a two-stroke exchange, command then
//! response. Only the initiator of the underlying transport can cause a
//! transmission, so both strokes are driven from its side and each frame
//! carries a trailing marker byte naming its role in the engine cycle.
//! [`InitiatorBridge`] and [`TargetBridge`] adapt the two transport roles
//! to the symmetric [`BridgeInterface`] the bridge itself consumes; which
//! peer serves and which invokes is free to differ per call.

use crate::channel::{RawInitiator, RawTarget};
use crate::wire::{self, ArgList, Stream, TransferFormat};

use log::error;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// RPC-layer errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Arguments or result failed to serialize or deserialize.
    Parsing,
    /// The command exists but has no bound handler.
    NoHandler,
    /// No command under the requested uuid.
    UnknownCommand,
    /// No (or no unique) local command matches a signature, or the remote
    /// signature differs.
    MismatchingSignature,
    /// The bridge has no usable interface.
    Transport,
    /// The underlying channel failed.
    Channel,
    /// Invalid registration (duplicate uuid, ambiguous signature).
    InvalidArgument,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            Error::Parsing => write!(f, "parsing_error"),
            Error::NoHandler => write!(f, "no_handler"),
            Error::UnknownCommand => write!(f, "unknown_command"),
            Error::MismatchingSignature => write!(f, "mismatching_signature"),
            Error::Transport => write!(f, "transport_error"),
            Error::Channel => write!(f, "channel_error"),
            Error::InvalidArgument => write!(f, "invalid_argument"),
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;

/// Per-frame timeout of the two-stroke engine.
const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Leading byte of a request payload.
mod command_type {
    pub const QUERY_SIGNATURE: u8 = 0x01;
    pub const USER_COMMAND: u8 = 0xff;
}

/// Trailing marker byte of each transport frame.
mod marker {
    pub const SEND_COMMAND: u8 = 0x00;
    pub const REQ_COMMAND: u8 = 0x01;
    pub const ACK_COMMAND: u8 = 0x02;
    pub const REQ_RESPONSE: u8 = 0x03;
    pub const SEND_RESPONSE: u8 = 0x04;
    pub const ACK_RESPONSE: u8 = 0x05;
}

/// Symmetric frame interface the bridge runs on.
pub trait BridgeInterface: Send {
    fn receive(&mut self) -> Result<Vec<u8>>;

    fn send(&mut self, data: &[u8]) -> Result<()>;
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Stroke {
    Command,
    Response,
}

/// Build a deterministic signature string out of a method name and wire
/// type names.
pub fn signature_string(name: &str, args: &[&str], ret: &str) -> String {
    format!("{}({}) -> {}", name, args.join(", "), ret)
}

/// [`BridgeInterface`] over the initiator role of a transport.
pub struct InitiatorBridge<I: RawInitiator> {
    raw: I,
    last: Stroke,
}

impl<I: RawInitiator> InitiatorBridge<I> {
    pub fn new(raw: I) -> Self {
        InitiatorBridge {
            raw,
            last: Stroke::Response,
        }
    }

    fn send_stroke(&mut self, data: &[u8], send_marker: u8, ack_marker: u8) -> Result<()> {
        let mut frame = data.to_vec();
        frame.push(send_marker);
        let reply = self
            .raw
            .communicate(&frame, IO_TIMEOUT)
            .map_err(|_| Error::Channel)?;
        if reply.len() != 1 || reply[0] != ack_marker {
            error!("expected acknowledge marker {ack_marker:#04x}");
            return Err(Error::Transport);
        }
        Ok(())
    }

    fn receive_stroke(&mut self, req_marker: u8, expect_marker: u8) -> Result<Vec<u8>> {
        let mut reply = self
            .raw
            .communicate(&[req_marker], IO_TIMEOUT)
            .map_err(|_| Error::Channel)?;
        if reply.last() != Some(&expect_marker) {
            error!("expected data marker {expect_marker:#04x}");
            return Err(Error::Transport);
        }
        reply.pop();
        Ok(reply)
    }
}

impl<I: RawInitiator + Send> BridgeInterface for InitiatorBridge<I> {
    fn receive(&mut self) -> Result<Vec<u8>> {
        match self.last {
            Stroke::Response => {
                self.last = Stroke::Command;
                self.receive_stroke(marker::REQ_COMMAND, marker::SEND_COMMAND)
            }
            Stroke::Command => {
                self.last = Stroke::Response;
                self.receive_stroke(marker::REQ_RESPONSE, marker::SEND_RESPONSE)
            }
        }
    }

    fn send(&mut self, data: &[u8]) -> Result<()> {
        match self.last {
            Stroke::Response => {
                self.last = Stroke::Command;
                self.send_stroke(data, marker::SEND_COMMAND, marker::ACK_COMMAND)
            }
            Stroke::Command => {
                self.last = Stroke::Response;
                self.send_stroke(data, marker::SEND_RESPONSE, marker::ACK_RESPONSE)
            }
        }
    }
}

/// [`BridgeInterface`] over the target role of a transport.
pub struct TargetBridge<T: RawTarget> {
    raw: T,
    last: Stroke,
}

impl<T: RawTarget> TargetBridge<T> {
    pub fn new(raw: T) -> Self {
        TargetBridge {
            raw,
            last: Stroke::Response,
        }
    }

    fn send_stroke(&mut self, data: &[u8], req_marker: u8, send_marker: u8) -> Result<()> {
        // Wait for the initiator to request the transmission.
        let req = self.raw.receive(IO_TIMEOUT).map_err(|_| Error::Channel)?;
        if req.len() != 1 || req[0] != req_marker {
            error!("expected request marker {req_marker:#04x}");
            return Err(Error::Transport);
        }
        let mut frame = data.to_vec();
        frame.push(send_marker);
        self.raw
            .send(&frame, IO_TIMEOUT)
            .map_err(|_| Error::Channel)
    }

    fn receive_stroke(&mut self, expect_marker: u8, ack_marker: u8) -> Result<Vec<u8>> {
        let mut frame = self.raw.receive(IO_TIMEOUT).map_err(|_| Error::Channel)?;
        if frame.last() != Some(&expect_marker) {
            error!("expected data marker {expect_marker:#04x}");
            return Err(Error::Transport);
        }
        frame.pop();
        self.raw
            .send(&[ack_marker], IO_TIMEOUT)
            .map_err(|_| Error::Channel)?;
        Ok(frame)
    }
}

impl<T: RawTarget + Send> BridgeInterface for TargetBridge<T> {
    fn receive(&mut self) -> Result<Vec<u8>> {
        match self.last {
            Stroke::Response => {
                self.last = Stroke::Command;
                self.receive_stroke(marker::SEND_COMMAND, marker::ACK_COMMAND)
            }
            Stroke::Command => {
                self.last = Stroke::Response;
                self.receive_stroke(marker::SEND_RESPONSE, marker::ACK_RESPONSE)
            }
        }
    }

    fn send(&mut self, data: &[u8]) -> Result<()> {
        match self.last {
            Stroke::Response => {
                self.last = Stroke::Command;
                self.send_stroke(data, marker::REQ_COMMAND, marker::SEND_COMMAND)
            }
            Stroke::Command => {
                self.last = Stroke::Response;
                self.send_stroke(data, marker::REQ_RESPONSE, marker::SEND_RESPONSE)
            }
        }
    }
}

type Handler = Box<dyn FnMut(&mut Stream<'_>) -> Result<Vec<u8>> + Send>;

struct Command {
    signature: String,
    handler: Handler,
}

/// The command table plus the frame interface it serves or invokes over.
pub struct Bridge {
    cmds: BTreeMap<String, Command>,
    iface: Box<dyn BridgeInterface>,
    stop: Arc<AtomicBool>,
}

impl Bridge {
    pub fn new(iface: Box<dyn BridgeInterface>) -> Self {
        Bridge {
            cmds: BTreeMap::new(),
            iface,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Install a command under an explicit uuid. Duplicates are rejected
    /// with [`Error::InvalidArgument`].
    pub fn register_command(
        &mut self,
        uuid: String,
        signature: String,
        handler: Handler,
    ) -> Result<()> {
        if self.cmds.contains_key(&uuid) {
            error!("duplicate command uuid {uuid}");
            return Err(Error::InvalidArgument);
        }
        self.cmds.insert(uuid, Command { signature, handler });
        Ok(())
    }

    /// Install a typed function as a command; the uuid is the signature
    /// string. Returns the uuid.
    pub fn register_fn<As, R, F>(&mut self, name: &str, mut f: F) -> Result<String>
    where
        As: ArgList,
        R: TransferFormat,
        F: FnMut(As) -> R + Send + 'static,
    {
        let signature = signature_string(name, As::TYPE_NAMES, R::TYPE_NAME);
        let handler: Handler = Box::new(move |s| {
            let args = As::read_all(s).map_err(|_| Error::Parsing)?;
            if !s.is_eof() {
                return Err(Error::Parsing);
            }
            Ok(wire::encode(&f(args)))
        });
        self.register_command(signature.clone(), signature.clone(), handler)?;
        Ok(signature)
    }

    /// Install the built-in command that stops the serve loop remotely.
    pub fn register_serve_stop(&mut self, name: &str) -> Result<String> {
        let stop = self.stop.clone();
        self.register_fn::<(), (), _>(name, move |()| stop.store(true, Ordering::SeqCst))
    }

    pub fn contains(&self, uuid: &str) -> bool {
        self.cmds.contains_key(uuid)
    }

    pub fn get_signature(&self, uuid: &str) -> Option<&str> {
        self.cmds.get(uuid).map(|c| c.signature.as_str())
    }

    /// Find the unique local uuid carrying `signature`.
    pub fn lookup_uuid(&self, signature: &str) -> Result<&str> {
        let mut found = None;
        for (uuid, cmd) in &self.cmds {
            if cmd.signature == signature {
                if found.is_some() {
                    return Err(Error::InvalidArgument);
                }
                found = Some(uuid.as_str());
            }
        }
        found.ok_or(Error::MismatchingSignature)
    }

    /// Stop [`Bridge::serve_loop`] after the in-flight request.
    pub fn serve_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Receive, dispatch and reply until stopped.
    ///
    /// A transport failure or an undispatchable request aborts the loop
    /// with its error; protocol level failures are ordinary responses and
    /// keep it running.
    pub fn serve_loop(&mut self) -> Result<()> {
        self.stop.store(false, Ordering::SeqCst);
        while !self.stop.load(Ordering::SeqCst) {
            let request = self.iface.receive()?;
            let response = self.local_invoke(&request)?;
            self.iface.send(&response)?;
        }
        Ok(())
    }

    /// Dispatch one packed request against the local table.
    pub fn local_invoke(&mut self, packed: &[u8]) -> Result<Vec<u8>> {
        let mut s = Stream::new(packed);
        let cmd_type = s.byte().map_err(|_| Error::Transport)?;
        let uuid = String::read_from(&mut s).map_err(|_| Error::Transport)?;
        match cmd_type {
            command_type::USER_COMMAND => {
                let cmd = self.cmds.get_mut(&uuid).ok_or(Error::UnknownCommand)?;
                (cmd.handler)(&mut s)
            }
            command_type::QUERY_SIGNATURE => {
                let signature = self.get_signature(&uuid).ok_or(Error::UnknownCommand)?;
                Ok(wire::encode(&signature.to_string()))
            }
            _ => Err(Error::Transport),
        }
    }

    /// Invoke the remote command `uuid` with `args`.
    pub fn remote_invoke<As, R>(&mut self, uuid: &str, args: As) -> Result<R>
    where
        As: ArgList,
        R: TransferFormat,
    {
        let mut payload = vec![command_type::USER_COMMAND];
        uuid.to_string().write_to(&mut payload);
        args.write_all(&mut payload);
        let response = self.command_response(&payload)?;
        wire::decode::<R>(&response).map_err(|_| Error::Parsing)
    }

    /// Invoke by name: resolve the unique local uuid of the signature, then
    /// call the remote twin.
    pub fn remote_invoke_unique<As, R>(&mut self, name: &str, args: As) -> Result<R>
    where
        As: ArgList,
        R: TransferFormat,
    {
        let signature = signature_string(name, As::TYPE_NAMES, R::TYPE_NAME);
        let uuid = self.lookup_uuid(&signature)?.to_string();
        self.remote_invoke(&uuid, args)
    }

    /// Ask the server for the signature it carries under `uuid`.
    pub fn remote_get_signature(&mut self, uuid: &str) -> Result<String> {
        let mut payload = vec![command_type::QUERY_SIGNATURE];
        uuid.to_string().write_to(&mut payload);
        let response = self.command_response(&payload)?;
        wire::decode::<String>(&response).map_err(|_| Error::Parsing)
    }

    /// Check that the server's command under `uuid` has exactly the local
    /// signature of `name`.
    pub fn remote_supports<As, R>(&mut self, name: &str, uuid: Option<&str>) -> Result<()>
    where
        As: ArgList,
        R: TransferFormat,
    {
        let signature = signature_string(name, As::TYPE_NAMES, R::TYPE_NAME);
        let uuid = uuid.unwrap_or(&signature).to_string();
        if self.remote_get_signature(&uuid)? != signature {
            return Err(Error::MismatchingSignature);
        }
        Ok(())
    }

    fn command_response(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        self.iface.send(payload)?;
        self.iface.receive()
    }
}
