//! The mesh protocol engine.
//!
//! A [`Node`] owns one radio and runs the whole protocol from a single
//! polled [`Node::update`] call: receive dispatch, join arbitration,
//! request timeouts and the three repeat schedules. Nothing here spawns
//! threads or registers timers, so the engine drops into a bare event
//! loop or a test harness unchanged.
//!
//! Life of a node:
//!
//! 1. [`Node::initialize`] brings the radio up and starts listening.
//! 2. [`Node::join`] claims a node id. The claim is flooded and stands
//!    unless a longer-established owner objects or a simultaneous joiner
//!    with a higher unique id wants the same id; either way the node
//!    steps to the next id and tries again.
//! 3. Once joined, the node serves its registers, relays foreign
//!    traffic, and may run one operation at a time: ping the mesh, or
//!    read and write registers anywhere on it.
//!
//! Operations complete through a [`Completion`]: either a callback, or
//! the blocking wrappers which spin on `update` until the engine reports
//! a [`Status`].

use crate::config::MeshConfig;
use crate::error::MeshError;
use crate::packet::{Packet, PacketType, PACKET_SIZE};
use crate::presence::PresenceTable;
use crate::radio::{Radio, RadioConfig, RxStatus};
use crate::register::{Register, SetOutcome};
use crate::repeat::{FloodCache, HandledCache, ResponseCache, ResponseEntry, ResponseKind};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Engine state. One operation runs at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// Not on a mesh; only `join` is allowed
    NotJoined,
    /// A node id claim is on the air awaiting objections
    Joining,
    /// On the mesh, no operation in flight
    Idle,
    /// Collecting PONG responses
    Ping,
    /// Waiting for a register count
    GetNumRegisters,
    /// Waiting for a register name
    GetRegisterName,
    /// Waiting for a register value
    GetRegister,
    /// Waiting for a write acknowledgment
    SetRegister,
}

/// Protocol-level outcome of an operation, delivered via its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// The operation finished; any result is stored on the node
    Ok,
    /// No usable response arrived in time
    Timeout,
    /// Every node id up to 255 is taken
    MeshFull,
    /// The queried register index does not exist on the target
    InvalidRegisterIndex,
    /// The remote node rejected the written value
    InvalidRegisterValue,
}

/// How an operation reports back.
pub enum Completion<R: Radio> {
    /// Store the status for a blocking wrapper spinning on `update`
    Blocking,
    /// Invoke a callback from inside `update` when the operation ends
    Callback(Box<dyn FnOnce(&mut Node<R>, Status) + Send>),
}

impl<R: Radio> Completion<R> {
    /// Box a closure as a callback completion.
    pub fn callback(f: impl FnOnce(&mut Node<R>, Status) + Send + 'static) -> Self {
        Completion::Callback(Box::new(f))
    }
}

/// Answer to a register-count query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumRegistersResult {
    /// Node that answered
    pub node_id: u8,
    /// Its unique id, usable as a filter for follow-up queries
    pub unique_id: u16,
    /// How many registers it serves
    pub count: u8,
}

/// Invoked for every distinct broadcast register value heard.
pub type BroadcastHandler<R> = Box<dyn FnMut(&mut Node<R>, &Register) + Send>;

/// Snapshot of an operation displaced by a forced rejoin, restored once
/// the new id holds.
struct Interrupted<R: Radio> {
    state: State,
    completion: Option<Completion<R>>,
    target_node_id: u8,
    target_unique_id: u16,
    target_register_index: u8,
    request: Option<Packet>,
}

/// One node on the mesh.
pub struct Node<R: Radio> {
    radio: R,
    config: MeshConfig,

    state: State,
    node_id: u8,
    unique_id: u16,
    /// 4-bit counter, bumped once per originated packet
    seq: u8,

    registers: Vec<Register>,
    presence: PresenceTable,

    flood: FloodCache,
    responses: ResponseCache,
    handled: HandledCache,

    // in-flight operation
    completion: Option<Completion<R>>,
    blocking_status: Option<Status>,
    op_register: Register,
    num_registers_result: Option<NumRegistersResult>,
    target_node_id: u8,
    target_unique_id: u16,
    target_register_index: u8,
    pending_request: Option<Packet>,
    request_repeats_left: u8,
    request_sent_at: Instant,
    request_retry_at: Instant,

    // join bookkeeping
    join_started_at: Instant,
    join_retx_delay: Duration,
    interrupted: Option<Interrupted<R>>,

    // broadcast listening
    broadcast_handler: Option<BroadcastHandler<R>>,
    last_broadcast: Register,

    // repeat pacing
    flood_next_at: Instant,
    response_next_at: Instant,
}

impl<R: Radio> Node<R> {
    /// A node with a random per-boot unique id.
    pub fn new(radio: R, config: MeshConfig) -> Self {
        let unique_id = rand::thread_rng().gen_range(1..=u16::MAX);
        Self::with_unique_id(radio, config, unique_id)
    }

    /// A node with a caller-chosen unique id, for deterministic setups.
    /// Zero is reserved for uninitialized nodes and is bumped to 1.
    pub fn with_unique_id(radio: R, config: MeshConfig, unique_id: u16) -> Self {
        let join_retx_delay = Duration::from_millis(
            rand::thread_rng().gen_range(config.join_retx_min_ms..=config.join_retx_max_ms),
        );
        let now = Instant::now();
        Self {
            radio,
            state: State::NotJoined,
            node_id: 0,
            unique_id: unique_id.max(1),
            seq: 0,
            registers: Vec::new(),
            presence: PresenceTable::new(),
            flood: FloodCache::new(config.flood_cache_size),
            responses: ResponseCache::new(config.response_cache_size, config.response_repeats),
            handled: HandledCache::new(config.handled_cache_size, config.dedup_expiry_window),
            completion: None,
            blocking_status: None,
            op_register: Register::new(),
            num_registers_result: None,
            target_node_id: 0,
            target_unique_id: 0,
            target_register_index: 0,
            pending_request: None,
            request_repeats_left: 0,
            request_sent_at: now,
            request_retry_at: now,
            join_started_at: now,
            join_retx_delay,
            interrupted: None,
            broadcast_handler: None,
            last_broadcast: Register::new(),
            flood_next_at: now,
            response_next_at: now,
            config,
        }
    }

    /// Bring the radio up and start listening for frames.
    pub fn initialize(&mut self, radio_config: &RadioConfig) -> Result<(), MeshError> {
        self.radio.initialize(radio_config)?;
        self.radio.listen(PACKET_SIZE);
        Ok(())
    }

    // ------------------------------------------------------------------
    // accessors

    pub fn state(&self) -> State {
        self.state
    }

    /// Current node id; 0 until a join succeeds.
    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    pub fn unique_id(&self) -> u16 {
        self.unique_id
    }

    /// Joined and past the claim window.
    pub fn on_mesh(&self) -> bool {
        !matches!(self.state, State::NotJoined | State::Joining)
    }

    /// Nodes that answered the most recent ping.
    pub fn presence(&self) -> &PresenceTable {
        &self.presence
    }

    /// Whether `id` answered the most recent ping.
    pub fn node_present(&self, id: u8) -> bool {
        self.presence.contains(id)
    }

    /// Scratch register holding the result of the last register
    /// operation, or its error message after a rejected write.
    pub fn op_register(&self) -> &Register {
        &self.op_register
    }

    /// Result of the last register-count query.
    pub fn num_registers_result(&self) -> Option<NumRegistersResult> {
        self.num_registers_result
    }

    // ------------------------------------------------------------------
    // served registers

    /// Serve `register` from this node. Names must be unique per node.
    pub fn add_register(&mut self, register: Register) -> Result<usize, MeshError> {
        if register.name_bytes().is_empty() {
            return Err(MeshError::InvalidRegisterName);
        }
        if self
            .registers
            .iter()
            .any(|r| r.name_bytes() == register.name_bytes())
        {
            return Err(MeshError::DuplicateRegisterName(
                String::from_utf8_lossy(register.name_bytes()).into_owned(),
            ));
        }
        self.registers.push(register);
        Ok(self.registers.len() - 1)
    }

    pub fn registers(&self) -> &[Register] {
        &self.registers
    }

    pub fn register_mut(&mut self, index: usize) -> Option<&mut Register> {
        self.registers.get_mut(index)
    }

    /// Index of the served register called `name`.
    pub fn find_register(&self, name: &[u8]) -> Option<usize> {
        self.registers.iter().position(|r| r.name_bytes() == name)
    }

    // ------------------------------------------------------------------
    // joining

    /// Claim `requested_id` on the mesh. The claim stands after a quiet
    /// window; a contested claim silently steps to the next id.
    pub fn join(&mut self, requested_id: u8, completion: Completion<R>) -> Result<(), MeshError> {
        if self.state == State::Joining {
            return Err(MeshError::AlreadyJoining);
        }
        if !matches!(self.state, State::NotJoined | State::Idle) {
            return Err(MeshError::Busy);
        }
        if requested_id == 0 {
            return Err(MeshError::InvalidNodeId(0));
        }
        self.blocking_status = None;
        self.completion = Some(completion);
        self.start_join(requested_id, false)
    }

    pub fn join_blocking(&mut self, requested_id: u8) -> Result<Status, MeshError> {
        self.join(requested_id, Completion::Blocking)?;
        self.block_until_done()
    }

    /// Begin claiming `id`. With `interrupting` set, the in-flight
    /// operation is parked and resumed once the new id holds.
    fn start_join(&mut self, id: u8, interrupting: bool) -> Result<(), MeshError> {
        if interrupting && self.interrupted.is_none() {
            self.interrupted = Some(Interrupted {
                state: self.state,
                completion: self.completion.take(),
                target_node_id: self.target_node_id,
                target_unique_id: self.target_unique_id,
                target_register_index: self.target_register_index,
                request: self.pending_request.take(),
            });
        }
        info!(node_id = id, unique_id = self.unique_id, "claiming node id");
        self.state = State::Joining;
        self.node_id = id;
        self.target_unique_id = 0;
        self.join_started_at = Instant::now();
        self.send_join()
    }

    fn send_join(&mut self) -> Result<(), MeshError> {
        let pkt = self.build_header(PacketType::Join);
        self.request_sent_at = Instant::now();
        self.transmit(&pkt)
    }

    /// Move the claim to the next id, failing the join when the address
    /// space is exhausted.
    fn escalate_join(&mut self, interrupting: bool) -> Result<(), MeshError> {
        match self.node_id.checked_add(1) {
            Some(next) => self.start_join(next, interrupting),
            None => self.fail_join_mesh_full(),
        }
    }

    fn fail_join_mesh_full(&mut self) -> Result<(), MeshError> {
        warn!("node id space exhausted, giving up");
        self.state = State::NotJoined;
        self.node_id = 0;
        self.fire_completion(Status::MeshFull);
        if let Some(parked) = self.interrupted.take() {
            self.completion = parked.completion;
            self.fire_completion(Status::MeshFull);
        }
        Ok(())
    }

    fn update_join(&mut self) -> Result<(), MeshError> {
        if self.state != State::Joining {
            return Ok(());
        }
        if self.join_started_at.elapsed() >= Duration::from_millis(self.config.join_accept_ms) {
            self.state = State::Idle;
            info!(node_id = self.node_id, "joined mesh");
            match self.interrupted.take() {
                Some(parked) => self.resume_interrupted(parked)?,
                None => self.fire_completion(Status::Ok),
            }
        } else if self.request_sent_at.elapsed() >= self.join_retx_delay {
            self.send_join()?;
        }
        Ok(())
    }

    /// Restore an operation parked by a forced rejoin and put its
    /// request back on the air under the new identity.
    fn resume_interrupted(&mut self, parked: Interrupted<R>) -> Result<(), MeshError> {
        debug!(state = ?parked.state, "resuming interrupted operation");
        self.state = parked.state;
        self.completion = parked.completion;
        self.target_node_id = parked.target_node_id;
        self.target_unique_id = parked.target_unique_id;
        self.target_register_index = parked.target_register_index;
        match parked.request {
            Some(mut request) => {
                request.set_sender(self.node_id);
                request.set_seq(self.next_seq());
                request.set_hop(0);
                self.send_request(request)
            }
            None if self.state == State::Ping => {
                let pkt = self.build_header(PacketType::Ping);
                self.request_sent_at = Instant::now();
                self.transmit(&pkt)
            }
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // operations

    /// Discover who is on the mesh. Every reachable node answers; the
    /// result accumulates in [`Node::presence`] until the ping window
    /// closes, at which point the completion fires with `Ok`.
    pub fn ping(&mut self, completion: Completion<R>) -> Result<(), MeshError> {
        self.ensure_idle()?;
        self.presence.clear();
        self.begin_op(State::Ping, completion, 0, 0, 0);
        let pkt = self.build_header(PacketType::Ping);
        self.pending_request = None;
        self.request_sent_at = Instant::now();
        self.transmit(&pkt)
    }

    pub fn ping_blocking(&mut self) -> Result<Status, MeshError> {
        self.ping(Completion::Blocking)?;
        self.block_until_done()
    }

    /// Ask `target` how many registers it serves. `filter_unique`
    /// narrows acceptable responses when two nodes claim one id.
    pub fn get_num_registers(
        &mut self,
        target: u8,
        filter_unique: Option<u16>,
        completion: Completion<R>,
    ) -> Result<(), MeshError> {
        self.ensure_idle()?;
        if target == 0 {
            return Err(MeshError::InvalidNodeId(0));
        }
        self.begin_op(
            State::GetNumRegisters,
            completion,
            target,
            filter_unique.unwrap_or(0),
            0,
        );
        self.num_registers_result = None;
        let mut pkt = self.build_header(PacketType::GetNumRegisters);
        pkt.set_target(target);
        self.send_request(pkt)
    }

    pub fn get_num_registers_blocking(
        &mut self,
        target: u8,
        filter_unique: Option<u16>,
    ) -> Result<Status, MeshError> {
        self.get_num_registers(target, filter_unique, Completion::Blocking)?;
        self.block_until_done()
    }

    /// Ask `target` for the name of its register at `index`. The name
    /// lands in [`Node::op_register`].
    pub fn get_register_name(
        &mut self,
        target: u8,
        index: u8,
        filter_unique: Option<u16>,
        completion: Completion<R>,
    ) -> Result<(), MeshError> {
        self.ensure_idle()?;
        if target == 0 {
            return Err(MeshError::InvalidNodeId(0));
        }
        self.begin_op(
            State::GetRegisterName,
            completion,
            target,
            filter_unique.unwrap_or(0),
            index,
        );
        self.op_register.reset();
        let mut pkt = self.build_header(PacketType::GetRegisterName);
        pkt.set_target(target);
        pkt.set_register_index(index);
        self.send_request(pkt)
    }

    pub fn get_register_name_blocking(
        &mut self,
        target: u8,
        index: u8,
        filter_unique: Option<u16>,
    ) -> Result<Status, MeshError> {
        self.get_register_name(target, index, filter_unique, Completion::Blocking)?;
        self.block_until_done()
    }

    /// Fetch the value of `register` (by name) from whichever node
    /// serves it. The value lands in [`Node::op_register`].
    pub fn get_register(
        &mut self,
        register: Register,
        completion: Completion<R>,
    ) -> Result<(), MeshError> {
        self.ensure_idle()?;
        if register.name_bytes().is_empty() {
            return Err(MeshError::InvalidRegisterName);
        }
        self.begin_op(State::GetRegister, completion, 0, 0, 0);
        self.op_register = register;
        let mut pkt = self.build_header(PacketType::GetRegister);
        if !pkt.encode_register(&self.op_register, false) {
            self.abort_op();
            return Err(MeshError::RegisterTooLarge);
        }
        self.send_request(pkt)
    }

    pub fn get_register_blocking(&mut self, register: Register) -> Result<Status, MeshError> {
        self.get_register(register, Completion::Blocking)?;
        self.block_until_done()
    }

    /// Write `register`'s value to whichever node serves its name. A
    /// rejection completes with [`Status::InvalidRegisterValue`] and the
    /// remote's reason in [`Node::op_register`].
    pub fn set_register(
        &mut self,
        register: Register,
        completion: Completion<R>,
    ) -> Result<(), MeshError> {
        self.ensure_idle()?;
        if register.name_bytes().is_empty() {
            return Err(MeshError::InvalidRegisterName);
        }
        self.begin_op(State::SetRegister, completion, 0, 0, 0);
        self.op_register = register;
        let mut pkt = self.build_header(PacketType::SetRegister);
        if !pkt.encode_register(&self.op_register, true) {
            self.abort_op();
            return Err(MeshError::RegisterTooLarge);
        }
        self.send_request(pkt)
    }

    pub fn set_register_blocking(&mut self, register: Register) -> Result<Status, MeshError> {
        self.set_register(register, Completion::Blocking)?;
        self.block_until_done()
    }

    /// Push a register value to every listener on the mesh, outside any
    /// request/response pairing. Broadcasts are best effort; they are
    /// re-emitted like any response but never acknowledged.
    pub fn broadcast(&mut self, register: &Register) -> Result<(), MeshError> {
        if !self.on_mesh() {
            return Err(MeshError::NotOnMesh);
        }
        if register.name_bytes().is_empty() {
            return Err(MeshError::InvalidRegisterName);
        }
        let mut pkt = self.build_header(PacketType::RegisterValue);
        pkt.set_target(0);
        if !pkt.encode_register(register, true) {
            return Err(MeshError::RegisterTooLarge);
        }
        let seq = pkt.seq();
        self.responses.push(
            ResponseKind::Broadcast {
                register: register.snapshot(),
            },
            seq,
        );
        self.transmit(&pkt)
    }

    /// Install (or with `None` remove) the handler for broadcast
    /// register values. Re-emitted copies of the same value are
    /// suppressed; only changed values reach the handler.
    pub fn broadcast_listen(&mut self, handler: Option<BroadcastHandler<R>>) {
        self.broadcast_handler = handler;
        self.last_broadcast.reset();
    }

    // ------------------------------------------------------------------
    // operation plumbing

    fn ensure_idle(&self) -> Result<(), MeshError> {
        match self.state {
            State::NotJoined | State::Joining => Err(MeshError::NotOnMesh),
            State::Idle => Ok(()),
            _ => Err(MeshError::Busy),
        }
    }

    fn begin_op(
        &mut self,
        state: State,
        completion: Completion<R>,
        target_node_id: u8,
        target_unique_id: u16,
        target_register_index: u8,
    ) {
        self.state = state;
        self.blocking_status = None;
        self.completion = Some(completion);
        self.target_node_id = target_node_id;
        self.target_unique_id = target_unique_id;
        self.target_register_index = target_register_index;
    }

    /// Roll back `begin_op` when the request could not even be built.
    fn abort_op(&mut self) {
        self.state = State::Idle;
        self.completion = None;
        self.pending_request = None;
    }

    fn finish_op(&mut self, status: Status) {
        self.state = State::Idle;
        self.pending_request = None;
        self.fire_completion(status);
    }

    fn fire_completion(&mut self, status: Status) {
        match self.completion.take() {
            Some(Completion::Blocking) => self.blocking_status = Some(status),
            Some(Completion::Callback(f)) => f(self, status),
            None => {}
        }
    }

    fn block_until_done(&mut self) -> Result<Status, MeshError> {
        loop {
            self.update()?;
            if let Some(status) = self.blocking_status.take() {
                return Ok(status);
            }
        }
    }

    /// Whether a response's sender passes the operation's filters.
    /// Zero means "any".
    fn response_filter(&self, pkt: &Packet) -> bool {
        (self.target_node_id == 0 || pkt.sender() == self.target_node_id)
            && (self.target_unique_id == 0 || pkt.unique_id() == self.target_unique_id)
    }

    fn next_seq(&mut self) -> u8 {
        self.seq = (self.seq + 1) & 0x0F;
        self.seq
    }

    fn build_header(&mut self, ptype: PacketType) -> Packet {
        Packet::with_header(ptype, self.next_seq(), self.node_id, self.unique_id)
    }

    /// Put a frame on the air, wait out the transmission, re-listen.
    fn transmit(&mut self, pkt: &Packet) -> Result<(), MeshError> {
        trace!(packet = ?pkt, "tx");
        self.radio.write(pkt.as_bytes())?;
        while !self.radio.tx_finished() {
            std::hint::spin_loop();
        }
        self.radio.listen(PACKET_SIZE);
        Ok(())
    }

    /// Transmit a request and arm the retry schedule for it.
    fn send_request(&mut self, pkt: Packet) -> Result<(), MeshError> {
        self.pending_request = Some(pkt);
        self.request_repeats_left = self.config.max_request_repeats;
        self.request_sent_at = Instant::now();
        self.request_retry_at = Instant::now() + self.retry_jitter();
        self.transmit(&pkt)
    }

    /// Transmit a response and remember it for re-emission.
    fn send_response(&mut self, pkt: Packet, kind: ResponseKind) -> Result<(), MeshError> {
        self.responses.push(kind, pkt.seq());
        self.transmit(&pkt)
    }

    fn already_handled(&self, pkt: &Packet) -> bool {
        self.handled
            .contains(pkt.raw_type(), pkt.seq(), pkt.unique_id())
    }

    fn mark_handled(&mut self, pkt: &Packet) {
        self.handled
            .record(pkt.raw_type(), pkt.seq(), pkt.unique_id());
    }

    /// Index of the served register a GET/SET frame names, if any.
    fn served_register_index(&self, pkt: &Packet) -> Option<usize> {
        self.registers.iter().position(|r| pkt.names_register(r))
    }

    fn retry_jitter(&self) -> Duration {
        let ms = rand::thread_rng()
            .gen_range(self.config.request_retry_min_ms..=self.config.request_retry_max_ms);
        Duration::from_millis(ms)
    }

    /// Randomized gap between cache re-emissions, stretched on slow
    /// links so relays do not saturate the channel.
    fn repeat_jitter(&self) -> Duration {
        let ms = rand::thread_rng()
            .gen_range(self.config.repeat_min_ms..=self.config.repeat_max_ms);
        let scale = (250_000 / self.radio.data_rate().bps().max(1)).max(1) as u64;
        Duration::from_millis(ms * scale)
    }

    // ------------------------------------------------------------------
    // the poll loop

    /// Drive the protocol. Call this often; every timer and cache in the
    /// engine advances only from here.
    pub fn update(&mut self) -> Result<(), MeshError> {
        self.handle_rx()?;
        self.update_join()?;
        self.update_ping();
        self.update_op_timeout();
        self.update_request_repeat()?;
        self.update_flood()?;
        self.update_responses()?;
        Ok(())
    }

    fn handle_rx(&mut self) -> Result<(), MeshError> {
        match self.radio.check_rx_waiting() {
            RxStatus::NoData => return Ok(()),
            RxStatus::Error => {
                debug!("receive fault, re-arming radio");
                self.radio.listen(PACKET_SIZE);
                return Ok(());
            }
            RxStatus::DataWaiting => {}
        }

        let mut buf = [0u8; PACKET_SIZE];
        self.radio.read(&mut buf)?;
        self.radio.listen(PACKET_SIZE);
        let pkt = match Packet::from_bytes(&buf) {
            Some(pkt) => pkt,
            None => return Ok(()),
        };
        if pkt.packet_type().is_none() {
            debug!(type_byte = pkt.raw_type(), "unknown packet type, dropping");
            return Ok(());
        }
        trace!(packet = ?pkt, "rx");

        // our own frames come back around the flood; drop them
        if pkt.sender() == self.node_id && pkt.unique_id() == self.unique_id {
            return Ok(());
        }

        // an established node defends its id against foreign traffic,
        // except conflict notices themselves (the loser must hear those)
        if self.on_mesh()
            && pkt.sender() == self.node_id
            && pkt.packet_type() != Some(PacketType::ConflictName)
        {
            info!(
                node_id = self.node_id,
                foreign_unique = pkt.unique_id(),
                "foreign traffic under our node id, sending conflict notice"
            );
            let notice = self.build_header(PacketType::ConflictName);
            return self.transmit(&notice);
        }

        self.handled.expire(pkt.seq(), pkt.unique_id());
        self.handle_deferred_join(&pkt)?;
        self.flood_admit(&pkt);

        self.handle_conflict_name(&pkt)?;
        self.handle_ping(&pkt)?;
        self.handle_pong(&pkt);
        self.handle_get_num_registers(&pkt)?;
        self.handle_num_registers(&pkt);
        self.handle_get_register_name(&pkt)?;
        self.handle_register_name(&pkt);
        self.handle_get_register(&pkt)?;
        self.handle_register_value(&pkt);
        self.handle_set_register(&pkt)?;
        self.handle_set_ack(&pkt);
        self.handle_broadcast(&pkt);
        Ok(())
    }

    // ------------------------------------------------------------------
    // join arbitration on receive

    /// A simultaneous joiner wanting our claimed id defers to the higher
    /// unique id; the loser quietly claims the next id instead.
    fn handle_deferred_join(&mut self, pkt: &Packet) -> Result<(), MeshError> {
        if self.state != State::Joining || pkt.packet_type() != Some(PacketType::Join) {
            return Ok(());
        }
        if pkt.sender() == self.node_id && pkt.unique_id() > self.unique_id {
            info!(
                node_id = self.node_id,
                "yielding claim to joiner with higher unique id"
            );
            self.escalate_join(false)?;
        }
        Ok(())
    }

    fn handle_conflict_name(&mut self, pkt: &Packet) -> Result<(), MeshError> {
        if pkt.packet_type() != Some(PacketType::ConflictName) || pkt.sender() != self.node_id {
            return Ok(());
        }
        if self.state == State::Joining {
            info!(node_id = self.node_id, "claim rejected, trying next id");
            return self.escalate_join(false);
        }
        if self.on_mesh() && self.unique_id < pkt.unique_id() {
            // both sides established the same id; lower unique id moves
            info!(
                node_id = self.node_id,
                "lost id tiebreak, rejoining on next id"
            );
            let interrupting = self.state != State::Idle;
            return self.escalate_join(interrupting);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // flood relay

    /// Decide whether a received frame should be relayed. Frames we are
    /// ourselves the audience for stay out of the flood.
    fn flood_admit(&mut self, pkt: &Packet) {
        if !self.on_mesh() {
            return;
        }
        match pkt.packet_type() {
            Some(PacketType::GetNumRegisters)
            | Some(PacketType::GetRegisterName)
            | Some(PacketType::SetRegisterAck)
                if pkt.target() == self.node_id =>
            {
                return;
            }
            Some(PacketType::NumRegisters)
                if self.state == State::GetNumRegisters && self.response_filter(pkt) =>
            {
                return;
            }
            Some(PacketType::RegisterName)
                if self.state == State::GetRegisterName && self.response_filter(pkt) =>
            {
                return;
            }
            Some(PacketType::RegisterValue)
                if pkt.target() == self.node_id
                    && self.state == State::GetRegister
                    && pkt.names_register(&self.op_register) =>
            {
                return;
            }
            Some(PacketType::GetRegister) | Some(PacketType::SetRegister)
                if self.served_register_index(pkt).is_some() =>
            {
                return;
            }
            _ => {}
        }
        // joins are never deduplicated; every copy extends the claim's
        // reach and joiners listen for each other through the relays
        if pkt.packet_type() != Some(PacketType::Join) && self.flood.contains_ignoring_hop(pkt) {
            return;
        }
        if pkt.hop() >= self.config.max_hop_count {
            trace!(hop = pkt.hop(), "hop ceiling reached, not relaying");
            return;
        }
        if !self.flood.push(*pkt) {
            trace!("flood cache full, dropping frame");
        }
    }

    fn update_flood(&mut self) -> Result<(), MeshError> {
        if !self.on_mesh() || Instant::now() < self.flood_next_at {
            return Ok(());
        }
        let mut pkt = match self.flood.pop() {
            Some(pkt) => pkt,
            None => return Ok(()),
        };
        pkt.set_hop(pkt.hop() + 1);
        self.transmit(&pkt)?;
        self.flood_next_at = Instant::now() + self.repeat_jitter();
        Ok(())
    }

    fn update_responses(&mut self) -> Result<(), MeshError> {
        if !self.on_mesh() || Instant::now() < self.response_next_at {
            return Ok(());
        }
        let index = match self.responses.next_index() {
            Some(index) => index,
            None => return Ok(()),
        };
        let rebuilt = self
            .responses
            .get(index)
            .and_then(|entry| self.rebuild_response(entry));
        match rebuilt {
            Some(pkt) => {
                self.transmit(&pkt)?;
                self.responses.note_repeat(index);
            }
            None => {
                debug!("cached response no longer buildable, dropping");
                self.responses.remove(index);
            }
        }
        self.response_next_at = Instant::now() + self.repeat_jitter();
        Ok(())
    }

    /// Rebuild a cached response from its descriptor. Register contents
    /// are read live so repeats reflect the current table; the original
    /// sequence number is reused so receivers can deduplicate.
    fn rebuild_response(&self, entry: &ResponseEntry) -> Option<Packet> {
        let header =
            |ptype: PacketType| Packet::with_header(ptype, entry.seq, self.node_id, self.unique_id);
        match &entry.kind {
            ResponseKind::Pong => Some(header(PacketType::Pong)),
            ResponseKind::NumRegisters => {
                let mut pkt = header(PacketType::NumRegisters);
                pkt.set_register_count(self.registers.len().min(255) as u8);
                Some(pkt)
            }
            ResponseKind::RegisterName { index } => {
                let mut pkt = header(PacketType::RegisterName);
                pkt.set_register_index(*index);
                match self.registers.get(*index as usize) {
                    Some(reg) if pkt.encode_register(reg, false) => {}
                    _ => pkt.clear_register_payload(),
                }
                Some(pkt)
            }
            ResponseKind::RegisterValue { index, target } => {
                let reg = self.registers.get(*index)?;
                let mut pkt = header(PacketType::RegisterValue);
                pkt.set_target(*target);
                pkt.encode_register(reg, true).then_some(pkt)
            }
            ResponseKind::Broadcast { register } => {
                let mut pkt = header(PacketType::RegisterValue);
                pkt.set_target(0);
                pkt.encode_register(register, true).then_some(pkt)
            }
            ResponseKind::SetRegisterAck { target, error } => {
                let mut pkt = header(PacketType::SetRegisterAck);
                pkt.set_target(*target);
                if let Some(message) = error {
                    pkt.set_ack_error(message);
                }
                Some(pkt)
            }
        }
    }

    // ------------------------------------------------------------------
    // request timers

    fn update_ping(&mut self) {
        if self.state != State::Ping {
            return;
        }
        if self.request_sent_at.elapsed() >= Duration::from_millis(self.config.ping_timeout_ms) {
            debug!(heard = self.presence.count(), "ping window closed");
            self.finish_op(Status::Ok);
        }
    }

    fn update_op_timeout(&mut self) {
        if !matches!(
            self.state,
            State::GetNumRegisters
                | State::GetRegisterName
                | State::GetRegister
                | State::SetRegister
        ) {
            return;
        }
        if self.request_sent_at.elapsed() >= Duration::from_millis(self.config.op_timeout_ms) {
            debug!(state = ?self.state, "operation timed out");
            self.finish_op(Status::Timeout);
        }
    }

    /// Re-send the outstanding request a few times before the timeout
    /// decides. Repeats are verbatim so responders see one sequence
    /// number per logical request.
    fn update_request_repeat(&mut self) -> Result<(), MeshError> {
        if !matches!(
            self.state,
            State::GetNumRegisters
                | State::GetRegisterName
                | State::GetRegister
                | State::SetRegister
        ) {
            return Ok(());
        }
        if self.request_repeats_left == 0 || Instant::now() < self.request_retry_at {
            return Ok(());
        }
        let pkt = match self.pending_request {
            Some(pkt) => pkt,
            None => return Ok(()),
        };
        self.request_repeats_left -= 1;
        self.request_retry_at = Instant::now() + self.retry_jitter();
        self.transmit(&pkt)
    }

    // ------------------------------------------------------------------
    // request handlers (responder side)

    fn handle_ping(&mut self, pkt: &Packet) -> Result<(), MeshError> {
        if pkt.packet_type() != Some(PacketType::Ping) || !self.on_mesh() {
            return Ok(());
        }
        if self.already_handled(pkt) {
            return Ok(());
        }
        self.mark_handled(pkt);
        let reply = self.build_header(PacketType::Pong);
        self.send_response(reply, ResponseKind::Pong)
    }

    fn handle_get_num_registers(&mut self, pkt: &Packet) -> Result<(), MeshError> {
        if pkt.packet_type() != Some(PacketType::GetNumRegisters)
            || !self.on_mesh()
            || pkt.target() != self.node_id
        {
            return Ok(());
        }
        if self.already_handled(pkt) {
            return Ok(());
        }
        self.mark_handled(pkt);
        let mut reply = self.build_header(PacketType::NumRegisters);
        reply.set_register_count(self.registers.len().min(255) as u8);
        self.send_response(reply, ResponseKind::NumRegisters)
    }

    fn handle_get_register_name(&mut self, pkt: &Packet) -> Result<(), MeshError> {
        if pkt.packet_type() != Some(PacketType::GetRegisterName)
            || !self.on_mesh()
            || pkt.target() != self.node_id
        {
            return Ok(());
        }
        if self.already_handled(pkt) {
            return Ok(());
        }
        self.mark_handled(pkt);
        let index = pkt.register_index();
        let mut reply = self.build_header(PacketType::RegisterName);
        reply.set_register_index(index);
        match self.registers.get(index as usize) {
            // a zero-length payload tells the requester the index is bad
            Some(reg) if reply.encode_register(reg, false) => {}
            _ => reply.clear_register_payload(),
        }
        self.send_response(reply, ResponseKind::RegisterName { index })
    }

    fn handle_get_register(&mut self, pkt: &Packet) -> Result<(), MeshError> {
        if pkt.packet_type() != Some(PacketType::GetRegister) || !self.on_mesh() {
            return Ok(());
        }
        let index = match self.served_register_index(pkt) {
            Some(index) => index,
            None => return Ok(()),
        };
        if self.already_handled(pkt) {
            return Ok(());
        }
        self.mark_handled(pkt);
        self.registers[index].invoke_get_callback();
        let mut reply = self.build_header(PacketType::RegisterValue);
        reply.set_target(pkt.sender());
        if !reply.encode_register(&self.registers[index], true) {
            // name plus value outgrew the response frame; the requester
            // will time out
            debug!(index, "register value does not fit a response frame");
            return Ok(());
        }
        self.send_response(
            reply,
            ResponseKind::RegisterValue {
                index,
                target: pkt.sender(),
            },
        )
    }

    fn handle_set_register(&mut self, pkt: &Packet) -> Result<(), MeshError> {
        if pkt.packet_type() != Some(PacketType::SetRegister) || !self.on_mesh() {
            return Ok(());
        }
        let index = match self.served_register_index(pkt) {
            Some(index) => index,
            None => return Ok(()),
        };
        if self.already_handled(pkt) {
            return Ok(());
        }
        self.mark_handled(pkt);

        let mut proposed = Register::new();
        if !pkt.decode_register(&mut proposed, true) {
            debug!("malformed set request");
            return Ok(());
        }

        let kept = self.registers[index].snapshot();
        match self.registers[index].invoke_set_callback(proposed.value_bytes()) {
            SetOutcome::Accept => {
                if self.registers[index].set_value(proposed.value_bytes()).is_err() {
                    self.registers[index].set_error("value does not fit");
                }
            }
            SetOutcome::Reject => {
                if !self.registers[index].has_error() {
                    self.registers[index].set_error("set rejected");
                }
            }
        }

        // the ack and its repeat descriptor carry their own copy of the
        // message; the register itself goes back to its pre-write state
        // so a rejected write never disturbs the served value
        let error = if self.registers[index].has_error() {
            Some(self.registers[index].error_bytes().to_vec())
        } else {
            None
        };
        let mut ack = self.build_header(PacketType::SetRegisterAck);
        ack.set_target(pkt.sender());
        if let Some(message) = &error {
            ack.set_ack_error(message);
        }
        self.send_response(
            ack,
            ResponseKind::SetRegisterAck {
                target: pkt.sender(),
                error,
            },
        )?;
        if self.registers[index].has_error() {
            self.registers[index].load_from_wire(kept.name_bytes(), kept.value_bytes());
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // response handlers (requester side)

    fn handle_pong(&mut self, pkt: &Packet) {
        if pkt.packet_type() != Some(PacketType::Pong) || self.state != State::Ping {
            return;
        }
        if !self.response_filter(pkt) {
            return;
        }
        trace!(node = pkt.sender(), "pong");
        self.presence.mark(pkt.sender());
    }

    fn handle_num_registers(&mut self, pkt: &Packet) {
        if pkt.packet_type() != Some(PacketType::NumRegisters)
            || self.state != State::GetNumRegisters
        {
            return;
        }
        if !self.response_filter(pkt) {
            return;
        }
        self.num_registers_result = Some(NumRegistersResult {
            node_id: pkt.sender(),
            unique_id: pkt.unique_id(),
            count: pkt.register_count(),
        });
        self.finish_op(Status::Ok);
    }

    fn handle_register_name(&mut self, pkt: &Packet) {
        if pkt.packet_type() != Some(PacketType::RegisterName)
            || self.state != State::GetRegisterName
        {
            return;
        }
        if !self.response_filter(pkt) {
            return;
        }
        // a response echoing a different index belongs to an earlier,
        // abandoned query
        if pkt.register_index() != self.target_register_index {
            debug!(
                echoed = pkt.register_index(),
                wanted = self.target_register_index,
                "stale register name response"
            );
            return;
        }
        if pkt.register_payload_empty() {
            self.finish_op(Status::InvalidRegisterIndex);
            return;
        }
        let mut fetched = Register::new();
        if pkt.decode_register(&mut fetched, false) {
            self.op_register = fetched;
            self.finish_op(Status::Ok);
        }
    }

    fn handle_register_value(&mut self, pkt: &Packet) {
        if pkt.packet_type() != Some(PacketType::RegisterValue)
            || self.state != State::GetRegister
        {
            return;
        }
        // directed responses only; broadcasts go to the broadcast handler
        if pkt.target() == 0 || pkt.target() != self.node_id {
            return;
        }
        // matched by name, not by responder address
        if !pkt.names_register(&self.op_register) {
            return;
        }
        let mut fetched = Register::new();
        if pkt.decode_register(&mut fetched, true) {
            self.op_register = fetched;
            self.finish_op(Status::Ok);
        }
    }

    fn handle_set_ack(&mut self, pkt: &Packet) {
        if pkt.packet_type() != Some(PacketType::SetRegisterAck)
            || self.state != State::SetRegister
            || pkt.target() != self.node_id
        {
            return;
        }
        match pkt.ack_error() {
            None => self.finish_op(Status::Ok),
            Some(message) => {
                let text = String::from_utf8_lossy(message).into_owned();
                self.op_register.set_error(&text);
                self.finish_op(Status::InvalidRegisterValue);
            }
        }
    }

    fn handle_broadcast(&mut self, pkt: &Packet) {
        if pkt.packet_type() != Some(PacketType::RegisterValue)
            || pkt.target() != 0
            || !self.on_mesh()
            || self.broadcast_handler.is_none()
        {
            return;
        }
        let mut incoming = Register::new();
        if !pkt.decode_register(&mut incoming, true) {
            return;
        }
        // relays and repeats carry the same value many times over
        if incoming == self.last_broadcast {
            return;
        }
        self.last_broadcast = incoming.snapshot();
        if let Some(mut handler) = self.broadcast_handler.take() {
            handler(self, &incoming);
            if self.broadcast_handler.is_none() {
                self.broadcast_handler = Some(handler);
            }
        }
    }
}
