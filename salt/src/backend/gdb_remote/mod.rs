//! GDB Remote Serial Protocol backend
//!
//! Talks to a gdbstub over TCP (QEMU `-s` listens on port 1234). The stub
//! halts the guest on connect; salt then plants software breakpoints, resumes
//! with `c` and waits for stop replies. Every stop is classified against the
//! planted breakpoints and surfaced as a [`StopEvent`].
//!
//! A stop on one of our breakpoints leaves `rip` on the trap address. Before
//! the next `c` the breakpoint is lifted, the instruction single-stepped with
//! `s` and the breakpoint planted again, so each invocation traps once.
//!
//! Return interception plants a breakpoint on the caller's return address and
//! remembers the stack pointer the invocation will return with
//! (`rsp_at_entry + 8`). Recursive or concurrent invocations that share a
//! return address are told apart by that stack pointer.

pub mod packet;

use std::collections::{HashMap, VecDeque};
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use super::{Backend, CallContext, Hit, ProbeId, Registers, ReturnToken};
use crate::domain::{Address, BackendError};
use crate::kernel::image::SymbolTable;
use packet::{Frame, PacketReader, StopReply};

/// Largest `m` request; QEMU accepts more but replies grow hex-doubled
const READ_CHUNK: usize = 0x400;

/// How long a command may wait for its reply
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Retransmissions before giving up on a nacked packet
const MAX_RETRANSMIT: usize = 3;

/// SIGINT, reported after a `0x03` interrupt
const SIGINT: u8 = 2;

/// Why the target stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopEvent {
    /// One of our interceptions fired
    Hit(Hit),
    /// Stopped at an interrupt we requested
    Interrupted,
    /// Stopped for a reason salt did not plant (e.g. a return breakpoint
    /// reached by a different invocation); resume and carry on
    Spurious,
    /// Target is gone
    Exited(String),
}

#[derive(Debug, Clone, Copy)]
struct PendingReturn {
    token: ReturnToken,
    probe: ProbeId,
    expected_sp: Address,
    call: CallContext,
}

pub struct GdbRemote {
    stream: TcpStream,
    reader: PacketReader,
    inbox: VecDeque<Frame>,
    symbols: SymbolTable,
    entry_breakpoints: HashMap<Address, ProbeId>,
    return_breakpoints: HashMap<Address, Vec<PendingReturn>>,
    next_token: u64,
    running: bool,
    registers: Option<Registers>,
    /// Breakpoint address the target is halted on, if any
    trapped_at: Option<Address>,
}

impl GdbRemote {
    /// Connect to `addr` and wait for the initial halt
    ///
    /// # Errors
    /// Connection failure or a stub that does not answer `?`
    pub fn connect(addr: &str, symbols: SymbolTable) -> Result<Self, BackendError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let mut remote = Self {
            stream,
            reader: PacketReader::new(),
            inbox: VecDeque::new(),
            symbols,
            entry_breakpoints: HashMap::new(),
            return_breakpoints: HashMap::new(),
            next_token: 0,
            running: false,
            registers: None,
            trapped_at: None,
        };
        let reply = remote.transact("?")?;
        match packet::parse_stop_reply(&reply)? {
            StopReply::Exited(code) | StopReply::Terminated(code) => {
                return Err(BackendError::Protocol(format!("target not running (status {code})")));
            }
            other => log::info!("connected to {addr}, target halted ({other:?})"),
        }
        Ok(remote)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Number of return interceptions still waiting for their invocation
    #[must_use]
    pub fn pending_returns(&self) -> usize {
        self.return_breakpoints.values().map(Vec::len).sum()
    }

    /// Let the target run until the next stop
    ///
    /// # Errors
    /// Socket failure
    pub fn resume(&mut self) -> Result<(), BackendError> {
        if self.running {
            return Ok(());
        }
        if let Some(address) = self.trapped_at.take() {
            if self.is_planted(address) {
                self.step_over(address)?;
            }
        }
        self.send_packet("c")?;
        self.running = true;
        self.registers = None;
        Ok(())
    }

    /// Wait up to `timeout` for the running target to stop
    ///
    /// Returns `None` when it is still running after `timeout`.
    ///
    /// # Errors
    /// Socket or protocol failure
    pub fn poll_stop(&mut self, timeout: Duration) -> Result<Option<StopEvent>, BackendError> {
        if !self.running {
            return Ok(None);
        }
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(reply) = self.recv_packet(remaining)? else {
                return Ok(None);
            };
            match packet::parse_stop_reply(&reply)? {
                StopReply::Output(text) => log::debug!("stub: {}", text.trim_end()),
                StopReply::Exited(code) => {
                    self.running = false;
                    return Ok(Some(StopEvent::Exited(format!("exited with status {code}"))));
                }
                StopReply::Terminated(signal) => {
                    self.running = false;
                    return Ok(Some(StopEvent::Exited(format!("terminated by signal {signal}"))));
                }
                StopReply::Signal(signal) => {
                    self.running = false;
                    return self.classify_stop(signal).map(Some);
                }
            }
        }
    }

    /// Interrupt a running target and wait for it to stop
    ///
    /// The stop may land on one of our breakpoints, in which case the hit is
    /// returned and must be dispatched like any other.
    ///
    /// # Errors
    /// Socket failure or no stop reply within the reply timeout
    pub fn halt(&mut self) -> Result<StopEvent, BackendError> {
        if !self.running {
            return Ok(StopEvent::Interrupted);
        }
        self.stream.write_all(&[packet::INTERRUPT])?;
        self.poll_stop(REPLY_TIMEOUT)?
            .ok_or_else(|| BackendError::Protocol("target did not stop after interrupt".into()))
    }

    /// Remove every breakpoint and let the target run free
    ///
    /// # Errors
    /// Socket or protocol failure
    pub fn detach(mut self) -> Result<(), BackendError> {
        if self.running {
            self.halt()?;
        }
        let addresses: Vec<Address> = self
            .entry_breakpoints
            .keys()
            .chain(self.return_breakpoints.keys())
            .copied()
            .collect();
        for address in addresses {
            if let Err(e) = self.remove_breakpoint(address) {
                log::warn!("failed to remove breakpoint at {address}: {e}");
            }
        }
        self.send_packet("D")?;
        // stubs answer OK, but some close the socket first
        let _ = self.recv_packet(Duration::from_millis(500));
        log::info!("detached");
        Ok(())
    }

    fn is_planted(&self, address: Address) -> bool {
        self.entry_breakpoints.contains_key(&address) || self.return_breakpoints.contains_key(&address)
    }

    /// Execute the instruction under the breakpoint at `address` and replant it
    fn step_over(&mut self, address: Address) -> Result<(), BackendError> {
        self.remove_breakpoint(address)?;
        self.send_packet("s")?;
        loop {
            let reply = self
                .recv_packet(REPLY_TIMEOUT)?
                .ok_or_else(|| BackendError::Protocol(format!("no stop after stepping {address}")))?;
            match packet::parse_stop_reply(&reply)? {
                StopReply::Output(text) => log::debug!("stub: {}", text.trim_end()),
                StopReply::Signal(_) => break,
                StopReply::Exited(_) | StopReply::Terminated(_) => {
                    return Err(BackendError::Protocol(format!(
                        "target exited while stepping {address}"
                    )));
                }
            }
        }
        self.registers = None;
        self.insert_breakpoint(address)
    }

    fn classify_stop(&mut self, signal: u8) -> Result<StopEvent, BackendError> {
        let registers = self.current_registers()?;
        let rip = Address(registers.require("rip")?);
        let rsp = Address(registers.require("rsp")?);
        self.trapped_at = self.is_planted(rip).then_some(rip);

        if let Some(pending) = self.return_breakpoints.get_mut(&rip) {
            if let Some(idx) = pending.iter().position(|p| p.expected_sp == rsp) {
                let hit = pending.swap_remove(idx);
                if pending.is_empty() {
                    self.return_breakpoints.remove(&rip);
                    if !self.entry_breakpoints.contains_key(&rip) {
                        self.remove_breakpoint(rip)?;
                    }
                }
                return Ok(StopEvent::Hit(Hit::Return {
                    probe: hit.probe,
                    token: hit.token,
                    call: hit.call,
                }));
            }
        }

        if let Some(&probe) = self.entry_breakpoints.get(&rip) {
            let return_address = self.read_address(rsp)?;
            return Ok(StopEvent::Hit(Hit::Entry {
                probe,
                call: CallContext { stack_pointer: rsp, return_address },
            }));
        }

        if signal == SIGINT {
            Ok(StopEvent::Interrupted)
        } else {
            log::debug!("unclaimed stop at {rip} (signal {signal})");
            Ok(StopEvent::Spurious)
        }
    }

    fn insert_breakpoint(&mut self, address: Address) -> Result<(), BackendError> {
        let reply = self.transact(&format!("Z0,{:x},1", address.0))?;
        expect_ok(&reply, "Z0")
    }

    fn remove_breakpoint(&mut self, address: Address) -> Result<(), BackendError> {
        let reply = self.transact(&format!("z0,{:x},1", address.0))?;
        expect_ok(&reply, "z0")
    }

    fn ensure_halted(&self, what: &str) -> Result<(), BackendError> {
        if self.running {
            Err(BackendError::Protocol(format!("{what} requires a halted target")))
        } else {
            Ok(())
        }
    }

    fn transact(&mut self, command: &str) -> Result<Vec<u8>, BackendError> {
        self.send_packet(command)?;
        self.recv_packet(REPLY_TIMEOUT)?
            .ok_or_else(|| BackendError::Protocol(format!("no reply to {command}")))
    }

    fn send_packet(&mut self, command: &str) -> Result<(), BackendError> {
        let framed = packet::encode(command);
        for _ in 0..=MAX_RETRANSMIT {
            self.stream.write_all(&framed)?;
            match self.next_ack(REPLY_TIMEOUT)? {
                Some(Frame::Ack) => return Ok(()),
                Some(Frame::Nack) => log::debug!("stub nacked {command}, retransmitting"),
                _ => return Err(BackendError::Protocol(format!("no ack for {command}"))),
            }
        }
        Err(BackendError::Protocol(format!("{command} rejected {MAX_RETRANSMIT} times")))
    }

    /// Next `+`/`-`, leaving packets queued for `recv_packet`
    fn next_ack(&mut self, timeout: Duration) -> Result<Option<Frame>, BackendError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(idx) = self.inbox.iter().position(|f| matches!(f, Frame::Ack | Frame::Nack))
            {
                return Ok(self.inbox.remove(idx));
            }
            if !self.fill(deadline)? {
                return Ok(None);
            }
        }
    }

    fn recv_packet(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, BackendError> {
        let deadline = Instant::now() + timeout;
        loop {
            while let Some(frame) = self.inbox.pop_front() {
                match frame {
                    Frame::Packet(payload) => {
                        self.stream.write_all(b"+")?;
                        return Ok(Some(payload));
                    }
                    Frame::Corrupt => self.stream.write_all(b"-")?,
                    Frame::Ack | Frame::Nack => {}
                }
            }
            if !self.fill(deadline)? {
                return Ok(None);
            }
        }
    }

    /// Read from the socket until `deadline`; false on timeout
    fn fill(&mut self, deadline: Instant) -> Result<bool, BackendError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(false);
        }
        self.stream.set_read_timeout(Some(remaining))?;
        let mut buf = [0u8; 4096];
        match self.stream.read(&mut buf) {
            Ok(0) => Err(BackendError::Protocol("connection closed by stub".into())),
            Ok(n) => {
                let frames = self.reader.feed(&buf[..n]);
                self.inbox.extend(frames);
                Ok(true)
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl Backend for GdbRemote {
    fn resolve_symbol(&self, name: &str) -> Result<Address, BackendError> {
        self.symbols.lookup(name).ok_or_else(|| BackendError::SymbolNotFound(name.into()))
    }

    fn read_memory(&mut self, address: Address, buf: &mut [u8]) -> Result<(), BackendError> {
        self.ensure_halted("memory read")?;
        let len = buf.len();
        for (i, chunk) in buf.chunks_mut(READ_CHUNK).enumerate() {
            let at = address.offset((i * READ_CHUNK) as u64);
            let reply = self.transact(&format!("m{:x},{:x}", at.0, chunk.len()))?;
            if packet::is_error_reply(&reply) {
                return Err(BackendError::MemoryFault { address, len });
            }
            let bytes = packet::decode_hex(&reply)?;
            if bytes.len() != chunk.len() {
                return Err(BackendError::MemoryFault { address, len });
            }
            chunk.copy_from_slice(&bytes);
        }
        Ok(())
    }

    fn current_registers(&mut self) -> Result<Registers, BackendError> {
        self.ensure_halted("register read")?;
        if let Some(registers) = &self.registers {
            return Ok(registers.clone());
        }
        let reply = self.transact("g")?;
        if packet::is_error_reply(&reply) {
            return Err(BackendError::Protocol("register read refused".into()));
        }
        let registers = parse_registers(&reply)?;
        self.registers = Some(registers.clone());
        Ok(registers)
    }

    fn intercept_entry(&mut self, symbol: &str, probe: ProbeId) -> Result<(), BackendError> {
        self.ensure_halted("breakpoint insertion")?;
        let address = self.resolve_symbol(symbol)?;
        if !self.return_breakpoints.contains_key(&address) {
            self.insert_breakpoint(address)?;
        }
        self.entry_breakpoints.insert(address, probe);
        log::debug!("entry probe {} on {symbol} at {address}", probe.0);
        Ok(())
    }

    fn intercept_return(
        &mut self,
        call: &CallContext,
        probe: ProbeId,
    ) -> Result<ReturnToken, BackendError> {
        self.ensure_halted("breakpoint insertion")?;
        let address = call.return_address;
        if !self.return_breakpoints.contains_key(&address)
            && !self.entry_breakpoints.contains_key(&address)
        {
            self.insert_breakpoint(address)?;
        }
        self.next_token += 1;
        let token = ReturnToken(self.next_token);
        self.return_breakpoints.entry(address).or_default().push(PendingReturn {
            token,
            probe,
            expected_sp: call.stack_pointer.offset(8),
            call: *call,
        });
        Ok(token)
    }
}

fn expect_ok(reply: &[u8], command: &str) -> Result<(), BackendError> {
    match reply {
        b"OK" => Ok(()),
        b"" => Err(BackendError::Protocol(format!("stub does not support {command}"))),
        other => Err(BackendError::Protocol(format!(
            "{command} failed: {}",
            String::from_utf8_lossy(other)
        ))),
    }
}

/// Decode a `g` reply: 16 GPRs and rip as little-endian u64, then eflags
///
/// # Errors
/// `BackendError::Protocol` when the reply is too short or not hex
pub fn parse_registers(reply: &[u8]) -> Result<Registers, BackendError> {
    let bytes = packet::decode_hex(reply)?;
    let needed = Registers::X86_64_ORDER.len() * 8;
    if bytes.len() < needed {
        return Err(BackendError::Protocol(format!(
            "register reply has {} bytes, expected at least {needed}",
            bytes.len()
        )));
    }
    let mut registers = Registers::new();
    for (name, raw) in Registers::X86_64_ORDER.iter().zip(bytes.chunks_exact(8)) {
        let mut word = [0u8; 8];
        word.copy_from_slice(raw);
        registers.set(name, u64::from_le_bytes(word));
    }
    if let Some(raw) = bytes.get(needed..needed + 4) {
        let mut word = [0u8; 4];
        word.copy_from_slice(raw);
        registers.set("eflags", u64::from(u32::from_le_bytes(word)));
    }
    Ok(registers)
}
