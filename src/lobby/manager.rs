//! Room Manager
//!
//! Single owner of every lobby entity and simulator. Network tasks hand it
//! commands; it mutates state, mirrors the public parts into the replicated
//! document and queues outgoing messages in an outbox the server drains.
//!
//! ```text
//!  Waiting ──game.start──▶ Starting ──freeze──▶ (kickoff delay) ──▶ InGame
//!     ▲                                                               │
//!     └──────────── reset delay ◀── Ending ◀── timer expired / forfeit┘
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::core::rng::DeterministicRng;
use crate::core::sizes::BoardSizes;
use crate::game::events::{PlayerEvent, SimEvent, SimEventData};
use crate::game::physics::SIDE_COUNT;
use crate::game::scheduler::{TickHandle, TickScheduler};
use crate::game::server::{ServerSimConfig, ServerSimulator};
use crate::game::state::{PlayerId, TickError};
use crate::lobby::public::PublicState;
use crate::lobby::room::{Player, PlayerState, Room, RoomId, RoomStatus, RoomType};
use crate::lobby::timers::{TimerKind, Timers};
use crate::lobby::tournament::{Advance, MatchStage, Tournament};
use crate::network::protocol::{ClientMessage, CreateRoomRequest, Notice, ServerMessage, TickSync};

// =============================================================================
// CONFIG
// =============================================================================

/// Lobby timing and capacity settings.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Minimum players to start a match.
    pub min_players: usize,
    /// Capacity cap for single rooms.
    pub max_single_players: usize,
    /// Capacity cap for tournament rooms.
    pub max_tournament_players: usize,
    /// Pause after a match is set up.
    pub pre_game_freeze: Duration,
    /// Pause between the freeze and the first round.
    pub kickoff_delay: Duration,
    /// Pause after a match ends.
    pub reset_delay: Duration,
    /// Board geometry.
    pub sizes: BoardSizes,
    /// Simulator settings.
    pub sim: ServerSimConfig,
    /// Salt mixed into every room seed.
    pub seed: u64,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            min_players: 2,
            max_single_players: SIDE_COUNT,
            max_tournament_players: 16,
            pre_game_freeze: Duration::from_secs(3),
            kickoff_delay: Duration::from_secs(1),
            reset_delay: Duration::from_secs(5),
            sizes: BoardSizes::default(),
            sim: ServerSimConfig::default(),
            seed: 0,
        }
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Lobby request failures. Each is reported to the requester as a notice.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LobbyError {
    #[error("player is not connected")]
    UnknownPlayer,

    #[error("you are already in a room")]
    AlreadyInRoom,

    #[error("room does not exist")]
    RoomNotFound,

    #[error("room is full")]
    RoomFull,

    #[error("room is not accepting players right now")]
    RoomNotWaiting,

    #[error("you are not in a room")]
    NotInRoom,

    #[error("only the room master can start the game")]
    NotMaster,

    #[error("at least {0} players are needed")]
    NotEnoughPlayers(usize),

    #[error("not every player is ready")]
    PlayersNotReady,

    #[error("simulation error: {0}")]
    Simulation(#[from] TickError),
}

impl LobbyError {
    /// Notice title.
    pub fn title(&self) -> &'static str {
        match self {
            LobbyError::UnknownPlayer | LobbyError::Simulation(_) => "Server error",
            LobbyError::AlreadyInRoom | LobbyError::NotInRoom => "Room",
            LobbyError::RoomNotFound => "Room not found",
            LobbyError::RoomFull => "Room full",
            LobbyError::RoomNotWaiting => "Game in progress",
            LobbyError::NotMaster => "Not allowed",
            LobbyError::NotEnoughPlayers(_) | LobbyError::PlayersNotReady => "Cannot start",
        }
    }
}

// =============================================================================
// OUTBOX
// =============================================================================

/// Who an outgoing message is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    Player(PlayerId),
    Everyone,
}

/// A message waiting to be routed.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub to: Recipient,
    pub message: ServerMessage,
}

// =============================================================================
// MANAGER
// =============================================================================

/// Owner of players, rooms, tournaments and simulators.
#[derive(Debug)]
pub struct RoomManager {
    config: RoomConfig,
    players: BTreeMap<PlayerId, Player>,
    rooms: BTreeMap<RoomId, Room>,
    room_order: Vec<RoomId>,
    tournaments: BTreeMap<RoomId, Tournament>,
    sims: TickScheduler<ServerSimulator>,
    timers: Timers,
    public: PublicState,
    outbox: Vec<Outgoing>,
    salt_counter: u64,
}

impl RoomManager {
    pub fn new(config: RoomConfig) -> Self {
        Self {
            config,
            players: BTreeMap::new(),
            rooms: BTreeMap::new(),
            room_order: Vec::new(),
            tournaments: BTreeMap::new(),
            sims: TickScheduler::new(),
            timers: Timers::new(),
            public: PublicState::new(),
            outbox: Vec::new(),
            salt_counter: 0,
        }
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    pub fn player(&self, id: &PlayerId) -> Option<&Player> {
        self.players.get(id)
    }

    pub fn room(&self, id: &str) -> Option<&Room> {
        self.rooms.get(id)
    }

    pub fn rooms(&self) -> impl Iterator<Item = &Room> {
        self.room_order.iter().filter_map(|id| self.rooms.get(id))
    }

    pub fn tournament(&self, room_id: &str) -> Option<&Tournament> {
        self.tournaments.get(room_id)
    }

    /// Simulator for a room's current match.
    pub fn simulator(&self, room_id: &str) -> Option<&ServerSimulator> {
        let handle = self.rooms.get(room_id)?.sim?;
        self.sims.get(handle)
    }

    pub fn simulator_count(&self) -> usize {
        self.sims.len()
    }

    pub fn public_state(&self) -> &serde_json::Value {
        self.public.value()
    }

    pub fn next_timer_due(&self) -> Option<Instant> {
        self.timers.next_due()
    }

    /// Take every queued outgoing message.
    pub fn take_outbox(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outbox)
    }

    fn next_salt(&mut self) -> u64 {
        self.salt_counter += 1;
        self.config.seed.wrapping_add(self.salt_counter)
    }

    fn name_of(&self, id: &PlayerId) -> String {
        self.players.get(id).map(|p| p.name.clone()).unwrap_or_else(|| id.to_string())
    }

    // =========================================================================
    // OUTGOING
    // =========================================================================

    fn send(&mut self, to: &PlayerId, message: ServerMessage) {
        self.outbox.push(Outgoing { to: Recipient::Player(to.clone()), message });
    }

    fn notify(&mut self, to: &PlayerId, notice: Notice) {
        self.send(to, ServerMessage::Notice(notice));
    }

    fn send_room(&mut self, room_id: &str, message: ServerMessage) {
        let Some(room) = self.rooms.get(room_id) else {
            return;
        };
        for member in &room.players {
            self.outbox.push(Outgoing { to: Recipient::Player(member.clone()), message: message.clone() });
        }
    }

    /// Queue the pending public-state log as one broadcast batch.
    pub fn flush_instructions(&mut self) {
        let batch = self.public.drain();
        if batch.is_empty() {
            return;
        }
        self.outbox.push(Outgoing {
            to: Recipient::Everyone,
            message: ServerMessage::Instruction { batch: Arc::new(batch) },
        });
    }

    /// Full snapshot for one player. Pending instructions go out first so a
    /// batch never repeats what the snapshot already contains.
    fn send_snapshot(&mut self, player_id: &PlayerId) {
        self.flush_instructions();
        let (id, data) = self.public.snapshot();
        self.send(player_id, ServerMessage::State { id, user_id: player_id.to_string(), data });
    }

    fn sync_player(&mut self, id: &PlayerId) {
        if let Some(player) = self.players.get(id) {
            self.public.sync_player(player);
        }
    }

    fn sync_room(&mut self, id: &str) {
        if let Some(room) = self.rooms.get(id) {
            self.public.sync_room(room);
        }
    }

    fn sync_tournament(&mut self, room_id: &str) {
        if let Some(t) = self.tournaments.get(room_id) {
            self.public.sync_tournament(t);
        }
    }

    // =========================================================================
    // CONNECTIONS
    // =========================================================================

    /// Register (or refresh) a connected player and send them a snapshot.
    #[instrument(skip(self, name))]
    pub fn connect(&mut self, id: PlayerId, name: String) {
        match self.players.get_mut(&id) {
            Some(player) => player.name = name,
            None => {
                self.players.insert(id.clone(), Player::new(id.clone(), name));
            }
        }
        self.sync_player(&id);
        info!("Player connected");
        self.send_snapshot(&id);
    }

    /// Remove a player entirely, leaving any room first.
    #[instrument(skip(self, now))]
    pub fn disconnect(&mut self, id: &PlayerId, now: Instant) {
        self.remove_from_room(id, now);
        if self.players.remove(id).is_some() {
            self.public.remove_player(id);
            info!("Player disconnected");
        }
    }

    /// Dispatch one client message. Failures become notices.
    pub fn handle_message(&mut self, player_id: &PlayerId, message: ClientMessage, now: Instant) {
        if !self.players.contains_key(player_id) {
            warn!(%player_id, "Message from unknown player");
            return;
        }

        let result = match message {
            ClientMessage::CreateRoom(request) => self.create_room(player_id, request).map(|_| ()),
            ClientMessage::JoinRoom { id } => self.join_room(player_id, &id),
            ClientMessage::QuickJoin => self.quick_join(player_id).map(|_| ()),
            ClientMessage::LeaveRoom => self.leave_room(player_id, now),
            ClientMessage::Ready => self.toggle_ready(player_id),
            ClientMessage::StartGame => self.start_game(player_id, now),
            ClientMessage::GameTick { client_tick } => {
                self.game_tick(player_id, client_tick);
                Ok(())
            }
            ClientMessage::PlayerEvent { data } => {
                self.player_event(player_id, data);
                Ok(())
            }
            // Connection-level messages
            ClientMessage::Auth(_) | ClientMessage::Ping { .. } => Ok(()),
        };

        if let Err(e) = result {
            debug!(%player_id, error = %e, "Lobby request rejected");
            self.notify(player_id, Notice::error(e.title(), e.to_string()));
        }
    }

    // =========================================================================
    // ROOMS
    // =========================================================================

    /// Create a room and join it.
    #[instrument(skip(self, request))]
    pub fn create_room(&mut self, player_id: &PlayerId, request: CreateRoomRequest) -> Result<RoomId, LobbyError> {
        let player = self.players.get(player_id).ok_or(LobbyError::UnknownPlayer)?;
        if player.room_id.is_some() {
            return Err(LobbyError::AlreadyInRoom);
        }

        let min = self.config.min_players;
        let players_max = match request.room_type {
            RoomType::Single => {
                let cap = self.config.max_single_players.min(SIDE_COUNT);
                request.players_max.unwrap_or(cap).clamp(min, cap)
            }
            RoomType::Tournament => {
                let cap = self.config.max_tournament_players;
                request.players_max.unwrap_or(cap).clamp(min, cap)
            }
        };

        let name = if request.name.trim().is_empty() {
            format!("{}'s room", player.name)
        } else {
            request.name
        };

        let id = uuid::Uuid::new_v4().to_string();
        let room = Room::new(id.clone(), name, request.room_type, players_max);
        self.public.sync_room(&room);
        self.rooms.insert(id.clone(), room);
        self.room_order.push(id.clone());
        info!(room_id = %id, "Room created");

        self.join_room(player_id, &id)?;
        Ok(id)
    }

    /// Join a waiting room with a free seat.
    pub fn join_room(&mut self, player_id: &PlayerId, room_id: &str) -> Result<(), LobbyError> {
        let player = self.players.get(player_id).ok_or(LobbyError::UnknownPlayer)?;
        if player.room_id.is_some() {
            return Err(LobbyError::AlreadyInRoom);
        }

        let room = self.rooms.get_mut(room_id).ok_or(LobbyError::RoomNotFound)?;
        if room.status != RoomStatus::Waiting {
            return Err(LobbyError::RoomNotWaiting);
        }
        if room.is_full() {
            return Err(LobbyError::RoomFull);
        }

        room.add_player(player_id.clone());
        self.public.push_room_member(room_id, player_id);
        self.public.sync_room(room);

        if let Some(player) = self.players.get_mut(player_id) {
            player.room_id = Some(room_id.to_string());
            player.reset_for_room();
        }
        self.sync_player(player_id);

        debug!(%player_id, room_id, "Joined room");
        Ok(())
    }

    /// Join the oldest open room, or create a single room.
    pub fn quick_join(&mut self, player_id: &PlayerId) -> Result<RoomId, LobbyError> {
        let player = self.players.get(player_id).ok_or(LobbyError::UnknownPlayer)?;
        if player.room_id.is_some() {
            return Err(LobbyError::AlreadyInRoom);
        }

        let open = self.rooms()
            .find(|r| r.status == RoomStatus::Waiting && !r.is_full())
            .map(|r| r.id.clone());

        match open {
            Some(room_id) => {
                self.join_room(player_id, &room_id)?;
                Ok(room_id)
            }
            None => self.create_room(player_id, CreateRoomRequest {
                name: String::new(),
                room_type: RoomType::Single,
                players_max: None,
            }),
        }
    }

    pub fn leave_room(&mut self, player_id: &PlayerId, now: Instant) -> Result<(), LobbyError> {
        let player = self.players.get(player_id).ok_or(LobbyError::UnknownPlayer)?;
        if player.room_id.is_none() {
            return Err(LobbyError::NotInRoom);
        }
        self.remove_from_room(player_id, now);
        Ok(())
    }

    pub fn toggle_ready(&mut self, player_id: &PlayerId) -> Result<(), LobbyError> {
        let player = self.players.get(player_id).ok_or(LobbyError::UnknownPlayer)?;
        let room_id = player.room_id.as_ref().ok_or(LobbyError::NotInRoom)?;
        let room = self.rooms.get(room_id).ok_or(LobbyError::RoomNotFound)?;
        if room.status != RoomStatus::Waiting {
            return Err(LobbyError::RoomNotWaiting);
        }

        if let Some(player) = self.players.get_mut(player_id) {
            player.ready = !player.ready;
        }
        self.sync_player(player_id);
        Ok(())
    }

    /// Take a player out of their room, handling master handover, forfeits
    /// and empty-room cleanup.
    fn remove_from_room(&mut self, player_id: &PlayerId, now: Instant) {
        let Some(room_id) = self.players.get(player_id).and_then(|p| p.room_id.clone()) else {
            return;
        };

        if let Some(player) = self.players.get_mut(player_id) {
            player.reset_to_idle();
        }
        self.sync_player(player_id);

        let Some(room) = self.rooms.get_mut(&room_id) else {
            return;
        };

        let was_master = room.is_master(player_id);
        let was_active = room.active_index(player_id).is_some();
        let Some(index) = room.remove_player(player_id) else {
            return;
        };
        let empty = room.players.is_empty();
        let in_match = room.in_match();
        let active_left = room.active_count();
        let room_type = room.room_type;
        let sim = room.sim;
        let new_master = room.master_id.clone().filter(|_| was_master);
        self.public.remove_room_member(&room_id, index);

        if empty {
            self.destroy_room(&room_id);
            return;
        }

        if let Some(master) = new_master {
            if let Some(p) = self.players.get_mut(&master) {
                p.ready = false;
            }
            self.sync_player(&master);
            info!(room_id, %master, "Room master promoted");
        }

        if was_active {
            if let Some(sim) = sim.and_then(|h| self.sims.get_mut(h)) {
                if let Err(e) = sim.remove_player(player_id) {
                    error!(error = %e, "Failed to remove player from simulator");
                }
            }

            if in_match {
                match room_type {
                    RoomType::Tournament => {
                        let winner = self.tournaments
                            .get_mut(&room_id)
                            .and_then(|t| t.forfeit_current(player_id, active_left > 0));
                        self.sync_tournament(&room_id);
                        if let Some(winner) = winner {
                            let message = format!("{} wins by forfeit", self.name_of(&winner));
                            self.send_room(&room_id, ServerMessage::Notice(Notice::info("Match over", message)));
                        }
                        self.abort_match(&room_id, now);
                    }
                    RoomType::Single if active_left < self.config.min_players => {
                        self.send_room(&room_id, ServerMessage::Notice(
                            Notice::info("Match over", "Not enough players left"),
                        ));
                        self.abort_match(&room_id, now);
                    }
                    RoomType::Single => {}
                }
            }
        }

        self.sync_room(&room_id);
        debug!(%player_id, room_id, "Left room");
    }

    /// Tear a room down, cancelling its timers and simulator.
    fn destroy_room(&mut self, room_id: &str) {
        self.timers.cancel_room(room_id);
        self.teardown_match(room_id);
        if self.tournaments.remove(room_id).is_some() {
            self.public.remove_tournament(room_id);
        }
        self.rooms.remove(room_id);
        self.room_order.retain(|id| id != room_id);
        self.public.remove_room(room_id);
        info!(room_id, "Room destroyed");
    }

    // =========================================================================
    // MATCH LIFECYCLE
    // =========================================================================

    /// Start a match (or a tournament) in the requester's room.
    #[instrument(skip(self, now))]
    pub fn start_game(&mut self, player_id: &PlayerId, now: Instant) -> Result<(), LobbyError> {
        let player = self.players.get(player_id).ok_or(LobbyError::UnknownPlayer)?;
        let room_id = player.room_id.clone().ok_or(LobbyError::NotInRoom)?;
        let room = self.rooms.get(&room_id).ok_or(LobbyError::RoomNotFound)?;

        if !room.is_master(player_id) {
            return Err(LobbyError::NotMaster);
        }
        if room.status != RoomStatus::Waiting {
            return Err(LobbyError::RoomNotWaiting);
        }

        let participants: Vec<PlayerId> = match room.room_type {
            RoomType::Single => room.players.iter().take(SIDE_COUNT).cloned().collect(),
            RoomType::Tournament => room.players.clone(),
        };
        if participants.len() < self.config.min_players {
            return Err(LobbyError::NotEnoughPlayers(self.config.min_players));
        }

        let all_ready = participants
            .iter()
            .filter(|p| !room.is_master(p))
            .all(|p| self.players.get(p).is_some_and(|pl| pl.ready));
        if !all_ready {
            return Err(LobbyError::PlayersNotReady);
        }

        let room_type = room.room_type;
        match room_type {
            RoomType::Single => self.setup_match(&room_id, participants, now),
            RoomType::Tournament => {
                let salt = self.next_salt();
                let ids: Vec<&str> = participants.iter().map(PlayerId::as_str).collect();
                let mut rng = DeterministicRng::for_room(&room_id, salt, &ids);
                let tournament = Tournament::new(room_id.clone(), &participants, &mut rng);
                info!(room_id, players = participants.len(), "Tournament started");
                self.tournaments.insert(room_id.clone(), tournament);
                self.sync_tournament(&room_id);
                self.activate_next_match(&room_id, now)
            }
        }
    }

    /// Register a simulator for `participants` and enter the pre-game freeze.
    fn setup_match(&mut self, room_id: &str, participants: Vec<PlayerId>, now: Instant) -> Result<(), LobbyError> {
        let salt = self.next_salt();
        let ids: Vec<&str> = participants.iter().map(PlayerId::as_str).collect();
        let rng = DeterministicRng::for_room(room_id, salt, &ids);
        let sim = ServerSimulator::new(&participants, self.config.sizes, self.config.sim.clone(), rng);
        let server_tick = sim.tick();
        let duration_secs = self.config.sim.match_duration_ticks.div_ceil(crate::TICK_RATE);

        let room = self.rooms.get_mut(room_id).ok_or(LobbyError::RoomNotFound)?;
        let handle = self.sims.register(sim);
        room.reset_match();
        room.sim = Some(handle);
        room.status = RoomStatus::Starting;
        room.countdown = duration_secs;
        for (index, player_id) in participants.iter().take(SIDE_COUNT).enumerate() {
            room.active_players[index] = Some(player_id.clone());
        }
        let epoch = room.epoch;
        self.public.sync_room(room);

        for (index, player_id) in participants.iter().take(SIDE_COUNT).enumerate() {
            if let Some(player) = self.players.get_mut(player_id) {
                player.state = PlayerState::InGame;
                player.paddle_index = Some(index);
            }
            self.sync_player(player_id);
            self.send(player_id, ServerMessage::PlayerIndex { index });
            self.send(player_id, ServerMessage::GameTick(TickSync::Set(server_tick)));
        }

        let names: Vec<String> = participants.iter().map(|p| self.name_of(p)).collect();
        self.send_room(room_id, ServerMessage::Notice(Notice::info("Match starting", names.join(" vs "))));
        self.timers.schedule(now, self.config.pre_game_freeze, room_id.to_string(), epoch, TimerKind::PreGameFreeze);

        info!(room_id, players = participants.len(), "Match set up");
        Ok(())
    }

    /// Set up the next playable bracket match, resolving walkovers and
    /// advancing levels as needed.
    fn activate_next_match(&mut self, room_id: &str, now: Instant) -> Result<(), LobbyError> {
        loop {
            let Some(tournament) = self.tournaments.get_mut(room_id) else {
                return Ok(());
            };
            let room = self.rooms.get(room_id).ok_or(LobbyError::RoomNotFound)?;

            if let Some(index) = tournament.next_pending() {
                let players: Vec<PlayerId> = tournament
                    .activate(index)
                    .map(|m| m.players.iter().flatten().cloned().collect())
                    .unwrap_or_default();
                let present: Vec<PlayerId> = players.iter().filter(|p| room.contains(p)).cloned().collect();

                if present.len() == 2 {
                    self.sync_tournament(room_id);
                    return self.setup_match(room_id, present, now);
                }

                // Walkover: at least one side has left the room
                if let Some(absent) = players.iter().find(|p| !present.contains(p)) {
                    tournament.forfeit_current(absent, !present.is_empty());
                }
                continue;
            }

            let outcome = tournament.advance(|p| room.contains(p));
            self.sync_tournament(room_id);
            match outcome {
                Advance::NextLevel => continue,
                Advance::Champion(champion) => {
                    self.finish_tournament(room_id, Some(champion));
                    return Ok(());
                }
                Advance::Abandoned => {
                    self.finish_tournament(room_id, None);
                    return Ok(());
                }
            }
        }
    }

    fn finish_tournament(&mut self, room_id: &str, champion: Option<PlayerId>) {
        if let Some(champion) = champion {
            let message = format!("{} wins the tournament", self.name_of(&champion));
            self.send_room(room_id, ServerMessage::Notice(Notice::success("Tournament winner", message)));
            info!(room_id, %champion, "Tournament finished");
        }
        if self.tournaments.remove(room_id).is_some() {
            self.public.remove_tournament(room_id);
        }
        self.reset_room(room_id);
    }

    /// Return a room and its members to the waiting state.
    fn reset_room(&mut self, room_id: &str) {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return;
        };
        room.reset_match();
        let members = room.players.clone();
        self.public.sync_room(room);

        for member in &members {
            if let Some(player) = self.players.get_mut(member) {
                player.reset_for_room();
            }
            self.sync_player(member);
        }
    }

    /// Detach and drop the room's simulator.
    fn teardown_match(&mut self, room_id: &str) {
        let Some(handle) = self.rooms.get_mut(room_id).and_then(|r| r.sim.take()) else {
            return;
        };
        if let Some(mut sim) = self.sims.unregister(handle) {
            if let Err(e) = sim.detach() {
                error!(room_id, error = %e, "Simulator already detached");
            }
        }
    }

    /// End the current match early: drop pending freeze or kickoff timers
    /// and go straight to the post-match pause.
    fn abort_match(&mut self, room_id: &str, now: Instant) {
        self.timers.cancel_room(room_id);
        if let Some(room) = self.rooms.get_mut(room_id) {
            room.epoch += 1;
        }
        self.end_match(room_id, now);
    }

    /// Freeze the match and schedule the reset.
    fn end_match(&mut self, room_id: &str, now: Instant) {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return;
        };
        if room.status == RoomStatus::Ending {
            return;
        }
        room.status = RoomStatus::Ending;
        room.running = false;
        let epoch = room.epoch;
        let handle = room.sim;
        self.public.sync_room(room);

        if let Some(sim) = handle.and_then(|h| self.sims.get_mut(h)) {
            sim.finish();
        }

        // A forfeit has already settled the bracket match
        let winner = self.tournaments
            .get_mut(room_id)
            .filter(|t| t.current_match().is_some_and(|m| m.stage == MatchStage::Active))
            .and_then(|t| t.finish_current());
        self.sync_tournament(room_id);
        if let Some(winner) = winner {
            let message = format!("{} wins the match", self.name_of(&winner));
            self.send_room(room_id, ServerMessage::Notice(Notice::info("Match over", message)));
        }

        self.timers.schedule(now, self.config.reset_delay, room_id.to_string(), epoch, TimerKind::MatchReset);
        info!(room_id, "Match ended");
    }

    fn kickoff(&mut self, room_id: &str, now: Instant) {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return;
        };
        let Some(handle) = room.sim else {
            return;
        };
        room.status = RoomStatus::InGame;
        room.running = true;
        self.public.sync_room(room);

        let events = match self.sims.get_mut(handle).map(ServerSimulator::start_match) {
            Some(Ok(events)) => events,
            Some(Err(e)) => {
                error!(room_id, error = %e, "Failed to start match");
                return;
            }
            None => return,
        };
        for event in events {
            self.apply_sim_event(room_id, event, now);
        }
        info!(room_id, "Kickoff");
    }

    fn after_match(&mut self, room_id: &str, now: Instant) {
        self.teardown_match(room_id);
        self.reset_room(room_id);
        if self.tournaments.contains_key(room_id) {
            if let Err(e) = self.activate_next_match(room_id, now) {
                warn!(room_id, error = %e, "Failed to set up next bracket match");
            }
        }
    }

    /// Fire every due timer whose room still exists at the same epoch.
    pub fn poll_timers(&mut self, now: Instant) {
        for timer in self.timers.poll(now) {
            let current = self.rooms.get(&timer.room_id).map(|r| r.epoch);
            if current != Some(timer.epoch) {
                debug!(room_id = %timer.room_id, "Discarding stale timer");
                continue;
            }

            match timer.kind {
                TimerKind::PreGameFreeze => {
                    let delay = self.config.kickoff_delay;
                    self.timers.schedule(now, delay, timer.room_id.clone(), timer.epoch, TimerKind::Kickoff);
                    self.send_room(&timer.room_id, ServerMessage::Notice(Notice::info("Get ready", "Kickoff imminent")));
                }
                TimerKind::Kickoff => self.kickoff(&timer.room_id, now),
                TimerKind::MatchReset => self.after_match(&timer.room_id, now),
            }
        }
    }

    // =========================================================================
    // IN-GAME
    // =========================================================================

    fn player_sim_handle(&self, player_id: &PlayerId) -> Option<TickHandle> {
        let room_id = self.players.get(player_id)?.room_id.as_ref()?;
        self.rooms.get(room_id)?.sim
    }

    /// Answer a tick sync request.
    pub fn game_tick(&mut self, player_id: &PlayerId, client_tick: Option<u64>) {
        let Some(sim) = self.player_sim_handle(player_id).and_then(|h| self.sims.get(h)) else {
            debug!(%player_id, "Tick sync without a running match");
            return;
        };
        let reply = match client_tick {
            Some(tick) => TickSync::Adjust(sim.calculate_offset_delta(tick)),
            None => TickSync::Set(sim.tick()),
        };
        self.send(player_id, ServerMessage::GameTick(reply));
    }

    /// Queue an input, or tell the sender it was dropped.
    pub fn player_event(&mut self, player_id: &PlayerId, event: PlayerEvent) {
        let accepted = self
            .player_sim_handle(player_id)
            .and_then(|h| self.sims.get_mut(h))
            .and_then(|sim| {
                let index = sim.paddle_index(player_id)?;
                if !sim.can_queue_event(&event) {
                    return None;
                }
                sim.queue_event(index, event).ok()
            });

        if accepted.is_none() {
            debug!(%player_id, event_id = event.event_id, "Dropped player event");
            self.send(player_id, ServerMessage::PacketDropped { event_id: event.event_id });
        }
    }

    /// Step every simulator `ticks` times and route what they emit.
    pub fn run_ticks(&mut self, ticks: u32, now: Instant) {
        if ticks == 0 || self.sims.is_empty() {
            return;
        }

        let mut produced: Vec<(TickHandle, SimEvent)> = Vec::new();
        self.sims.run_ticks(ticks, |handle, sim| match sim.step() {
            Ok(events) => produced.extend(events.into_iter().map(|e| (handle, e))),
            Err(e) => error!(error = %e, "Simulator step failed"),
        });

        let owners: BTreeMap<TickHandle, RoomId> = self.rooms
            .values()
            .filter_map(|r| r.sim.map(|h| (h, r.id.clone())))
            .collect();

        for (handle, event) in produced {
            if let Some(room_id) = owners.get(&handle) {
                self.apply_sim_event(room_id, event, now);
            }
        }

        self.refresh_countdowns();
    }

    fn refresh_countdowns(&mut self) {
        let updates: Vec<(RoomId, u32)> = self.rooms
            .values()
            .filter(|r| r.running)
            .filter_map(|r| {
                let sim = self.sims.get(r.sim?)?;
                let secs = sim.timer_remaining().div_ceil(crate::TICK_RATE);
                (secs != r.countdown).then(|| (r.id.clone(), secs))
            })
            .collect();

        for (room_id, secs) in updates {
            if let Some(room) = self.rooms.get_mut(&room_id) {
                room.countdown = secs;
                self.public.sync_room(room);
            }
        }
    }

    fn apply_sim_event(&mut self, room_id: &str, event: SimEvent, now: Instant) {
        match event.data {
            SimEventData::BallSync { ball } => {
                self.send_room(room_id, ServerMessage::BallCollision { server_tick: event.tick, ball_data: ball });
            }
            SimEventData::Goal { scorer, target } => {
                self.record_goal(room_id, scorer, target);
                self.send_room(room_id, ServerMessage::Goal { scorer, target });
            }
            SimEventData::RoundStart { countdown_ticks, direction } => {
                self.send_room(room_id, ServerMessage::RoundStart {
                    server_tick: event.tick,
                    countdown_ticks,
                    direction,
                });
            }
            SimEventData::FullSnapshot => {
                let members = self.rooms.get(room_id).map(|r| r.players.clone()).unwrap_or_default();
                for member in &members {
                    self.send_snapshot(member);
                }
            }
            SimEventData::Update { player_id, update } => {
                self.send(&player_id, ServerMessage::GameUpdate { data: update });
            }
            SimEventData::MatchEnded => self.end_match(room_id, now),
        }
    }

    /// Score a goal. In a bracket match the side that did not concede
    /// takes the point.
    fn record_goal(&mut self, room_id: &str, scorer: Option<usize>, target: usize) {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return;
        };
        room.record_goal(scorer, target);

        if room.room_type == RoomType::Tournament {
            let credited = room.active_players
                .iter()
                .enumerate()
                .find(|(side, p)| *side != target && p.is_some())
                .and_then(|(_, p)| p.clone());
            if let (Some(credited), Some(t)) = (credited, self.tournaments.get_mut(room_id)) {
                t.record_goal(&credited);
            }
        }

        self.public.sync_room(room);
        self.sync_tournament(room_id);
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::Replica;

    fn pid(s: &str) -> PlayerId {
        PlayerId::from(s)
    }

    fn fast_config() -> RoomConfig {
        RoomConfig {
            sim: ServerSimConfig {
                match_duration_ticks: 30,
                round_countdown_ticks: 1000,
                ..Default::default()
            },
            seed: 7,
            ..Default::default()
        }
    }

    fn manager_with(players: &[&str]) -> RoomManager {
        let mut manager = RoomManager::new(fast_config());
        for p in players {
            manager.connect(pid(p), p.to_uppercase());
        }
        manager.take_outbox();
        manager
    }

    fn messages_for(outbox: &[Outgoing], player: &str) -> Vec<ServerMessage> {
        outbox
            .iter()
            .filter(|o| o.to == Recipient::Player(pid(player)))
            .map(|o| o.message.clone())
            .collect()
    }

    fn single_room(manager: &mut RoomManager, players: &[&str]) -> RoomId {
        let room_id = manager.create_room(&pid(players[0]), CreateRoomRequest {
            name: "Arena".into(),
            room_type: RoomType::Single,
            players_max: None,
        }).unwrap();
        for p in &players[1..] {
            manager.join_room(&pid(p), &room_id).unwrap();
            manager.toggle_ready(&pid(p)).unwrap();
        }
        room_id
    }

    /// Drive a room from Starting to InGame.
    fn run_to_kickoff(manager: &mut RoomManager, now: Instant) -> Instant {
        let config = manager.config().clone();
        let t = now + config.pre_game_freeze;
        manager.poll_timers(t);
        let t = t + config.kickoff_delay;
        manager.poll_timers(t);
        t
    }

    #[test]
    fn test_connect_sends_snapshot() {
        let mut manager = RoomManager::new(RoomConfig::default());
        manager.connect(pid("a"), "Ada".into());

        let outbox = manager.take_outbox();
        let state = messages_for(&outbox, "a")
            .into_iter()
            .find_map(|m| match m {
                ServerMessage::State { id, user_id, data } => Some((id, user_id, data)),
                _ => None,
            })
            .unwrap();
        assert_eq!(state.1, "a");
        assert_eq!(state.2["players"]["a"]["name"], "Ada");

        // Second snapshot has a larger id
        manager.connect(pid("b"), "Bob".into());
        let next = manager.take_outbox().into_iter().find_map(|o| match o.message {
            ServerMessage::State { id, .. } => Some(id),
            _ => None,
        });
        assert!(next.unwrap() > state.0);
    }

    #[test]
    fn test_create_and_join() {
        let mut manager = manager_with(&["a", "b"]);
        let room_id = single_room(&mut manager, &["a", "b"]);

        let room = manager.room(&room_id).unwrap();
        assert_eq!(room.players, vec![pid("a"), pid("b")]);
        assert!(room.is_master(&pid("a")));
        assert_eq!(room.players_max, 4);
        assert_eq!(manager.player(&pid("b")).unwrap().state, PlayerState::InRoom);
        assert_eq!(manager.public_state()["rooms"][&room_id]["players"], serde_json::json!(["a", "b"]));

        assert_eq!(manager.join_room(&pid("b"), &room_id), Err(LobbyError::AlreadyInRoom));
        assert_eq!(manager.join_room(&pid("zzz"), &room_id), Err(LobbyError::UnknownPlayer));
    }

    #[test]
    fn test_join_full_room_sends_notice() {
        let mut manager = manager_with(&["a", "b", "c"]);
        let room_id = manager.create_room(&pid("a"), CreateRoomRequest {
            name: "Duel".into(),
            room_type: RoomType::Single,
            players_max: Some(2),
        }).unwrap();
        manager.join_room(&pid("b"), &room_id).unwrap();
        manager.take_outbox();

        manager.handle_message(&pid("c"), ClientMessage::JoinRoom { id: room_id.clone() }, Instant::now());
        let outbox = manager.take_outbox();
        let notices: Vec<_> = messages_for(&outbox, "c").into_iter().filter_map(|m| match m {
            ServerMessage::Notice(n) => Some(n),
            _ => None,
        }).collect();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].title, "Room full");
        assert!(manager.player(&pid("c")).unwrap().room_id.is_none());
    }

    #[test]
    fn test_quick_join_creates_then_reuses() {
        let mut manager = manager_with(&["a", "b"]);
        let first = manager.quick_join(&pid("a")).unwrap();
        let second = manager.quick_join(&pid("b")).unwrap();
        assert_eq!(first, second);
        assert_eq!(manager.rooms().count(), 1);
        assert_eq!(manager.room(&first).unwrap().name, "A's room");
    }

    #[test]
    fn test_start_requires_master_and_ready() {
        let mut manager = manager_with(&["a", "b", "c"]);
        let room_id = manager.create_room(&pid("a"), CreateRoomRequest {
            name: "Arena".into(),
            room_type: RoomType::Single,
            players_max: None,
        }).unwrap();
        let now = Instant::now();

        assert_eq!(manager.start_game(&pid("a"), now), Err(LobbyError::NotEnoughPlayers(2)));

        manager.join_room(&pid("b"), &room_id).unwrap();
        assert_eq!(manager.start_game(&pid("b"), now), Err(LobbyError::NotMaster));
        assert_eq!(manager.start_game(&pid("a"), now), Err(LobbyError::PlayersNotReady));

        manager.toggle_ready(&pid("b")).unwrap();
        manager.start_game(&pid("a"), now).unwrap();
        assert_eq!(manager.room(&room_id).unwrap().status, RoomStatus::Starting);

        // Late joiners are turned away once the match is set up
        assert_eq!(manager.join_room(&pid("c"), &room_id), Err(LobbyError::RoomNotWaiting));
    }

    #[test]
    fn test_single_match_lifecycle() {
        let mut manager = manager_with(&["a", "b"]);
        let room_id = single_room(&mut manager, &["a", "b"]);
        let now = Instant::now();
        manager.take_outbox();

        manager.start_game(&pid("a"), now).unwrap();
        let outbox = manager.take_outbox();
        assert!(messages_for(&outbox, "b").contains(&ServerMessage::PlayerIndex { index: 1 }));
        assert_eq!(manager.player(&pid("a")).unwrap().state, PlayerState::InGame);
        assert_eq!(manager.simulator_count(), 1);

        // Nothing happens before the freeze elapses
        manager.poll_timers(now + Duration::from_millis(100));
        assert_eq!(manager.room(&room_id).unwrap().status, RoomStatus::Starting);

        let t = run_to_kickoff(&mut manager, now);
        let room = manager.room(&room_id).unwrap();
        assert_eq!(room.status, RoomStatus::InGame);
        assert!(room.running);
        let outbox = manager.take_outbox();
        assert!(messages_for(&outbox, "a").iter().any(|m| matches!(m, ServerMessage::RoundStart { .. })));

        manager.run_ticks(30, t);
        assert_eq!(manager.room(&room_id).unwrap().status, RoomStatus::Ending);

        manager.poll_timers(t + manager.config().reset_delay);
        let room = manager.room(&room_id).unwrap();
        assert_eq!(room.status, RoomStatus::Waiting);
        assert!(room.sim.is_none());
        assert_eq!(manager.simulator_count(), 0);
        let b = manager.player(&pid("b")).unwrap();
        assert_eq!(b.state, PlayerState::InRoom);
        assert!(!b.ready);
    }

    #[test]
    fn test_player_events_and_resync() {
        let mut manager = manager_with(&["a", "b"]);
        let room_id = single_room(&mut manager, &["a", "b"]);
        let now = Instant::now();
        manager.start_game(&pid("a"), now).unwrap();
        manager.take_outbox();

        manager.player_event(&pid("b"), PlayerEvent::movement(1, 5, 1));
        manager.player_event(&pid("b"), PlayerEvent::movement(2, 5, 1));
        manager.run_ticks(21, now);

        let outbox = manager.take_outbox();
        let updates: Vec<_> = messages_for(&outbox, "b").into_iter().filter_map(|m| match m {
            ServerMessage::GameUpdate { data } => Some(data),
            _ => None,
        }).collect();
        let last = updates.last().unwrap();
        assert_eq!(last.server_tick, 20);
        assert_eq!(last.verified_event_id, 2);
        assert_eq!(last.positions[1], 2.0);

        // Stale event is dropped
        manager.player_event(&pid("b"), PlayerEvent::movement(3, 4, 1));
        let outbox = manager.take_outbox();
        assert_eq!(messages_for(&outbox, "b"), vec![ServerMessage::PacketDropped { event_id: 3 }]);
        assert_eq!(manager.simulator(&room_id).unwrap().queue_len(), 0);
    }

    #[test]
    fn test_events_outside_match_dropped() {
        let mut manager = manager_with(&["a"]);
        manager.player_event(&pid("a"), PlayerEvent::movement(1, 0, 1));
        let outbox = manager.take_outbox();
        assert_eq!(messages_for(&outbox, "a"), vec![ServerMessage::PacketDropped { event_id: 1 }]);
    }

    #[test]
    fn test_tick_sync() {
        let mut manager = manager_with(&["a", "b"]);
        single_room(&mut manager, &["a", "b"]);
        let now = Instant::now();
        manager.start_game(&pid("a"), now).unwrap();
        manager.run_ticks(10, now);
        manager.take_outbox();

        manager.game_tick(&pid("a"), None);
        manager.game_tick(&pid("a"), Some(20));
        manager.game_tick(&pid("a"), Some(11));
        let outbox = manager.take_outbox();
        assert_eq!(messages_for(&outbox, "a"), vec![
            ServerMessage::GameTick(TickSync::Set(10)),
            ServerMessage::GameTick(TickSync::Adjust(-8)),
            ServerMessage::GameTick(TickSync::Adjust(0)),
        ]);
    }

    #[test]
    fn test_tick_sync_far_future_client() {
        let mut manager = manager_with(&["a", "b"]);
        single_room(&mut manager, &["a", "b"]);
        let now = Instant::now();
        manager.start_game(&pid("a"), now).unwrap();
        manager.run_ticks(10, now);
        manager.take_outbox();

        manager.game_tick(&pid("a"), Some(1 << 63));
        manager.game_tick(&pid("a"), Some(u64::MAX));
        let outbox = manager.take_outbox();
        assert_eq!(messages_for(&outbox, "a"), vec![
            ServerMessage::GameTick(TickSync::Adjust(-(i64::MAX - 11))),
            ServerMessage::GameTick(TickSync::Adjust(i64::MIN)),
        ]);

        // The match keeps running
        manager.run_ticks(1, now);
        manager.game_tick(&pid("a"), None);
        let outbox = manager.take_outbox();
        assert!(messages_for(&outbox, "a").contains(&ServerMessage::GameTick(TickSync::Set(11))));
    }

    #[test]
    fn test_leaving_mid_match_ends_it() {
        let mut manager = manager_with(&["a", "b"]);
        let room_id = single_room(&mut manager, &["a", "b"]);
        let now = Instant::now();
        manager.start_game(&pid("a"), now).unwrap();
        let t = run_to_kickoff(&mut manager, now);

        manager.leave_room(&pid("a"), t).unwrap();
        let room = manager.room(&room_id).unwrap();
        assert_eq!(room.status, RoomStatus::Ending);
        assert!(room.is_master(&pid("b")));
        assert_eq!(manager.player(&pid("a")).unwrap().state, PlayerState::Idle);

        manager.poll_timers(t + manager.config().reset_delay);
        assert_eq!(manager.room(&room_id).unwrap().status, RoomStatus::Waiting);
    }

    #[test]
    fn test_last_member_leaving_destroys_room() {
        let mut manager = manager_with(&["a", "b"]);
        let room_id = single_room(&mut manager, &["a", "b"]);
        let now = Instant::now();
        manager.start_game(&pid("a"), now).unwrap();

        manager.disconnect(&pid("a"), now);
        manager.disconnect(&pid("b"), now);
        assert!(manager.room(&room_id).is_none());
        assert_eq!(manager.simulator_count(), 0);
        assert!(manager.next_timer_due().is_none());
        assert!(manager.public_state()["rooms"].get(&room_id).is_none());
        assert!(manager.public_state()["players"].get("a").is_none());

        // Timers for the vanished room are harmless
        manager.poll_timers(now + Duration::from_secs(60));
    }

    #[test]
    fn test_master_promotion_resets_ready() {
        let mut manager = manager_with(&["a", "b", "c"]);
        let room_id = single_room(&mut manager, &["a", "b", "c"]);
        manager.leave_room(&pid("a"), Instant::now()).unwrap();

        let room = manager.room(&room_id).unwrap();
        assert!(room.is_master(&pid("b")));
        assert!(!manager.player(&pid("b")).unwrap().ready);
        assert!(manager.player(&pid("c")).unwrap().ready);
        assert_eq!(manager.public_state()["rooms"][&room_id]["masterId"], "b");
    }

    #[test]
    fn test_tournament_runs_to_champion() {
        let mut manager = manager_with(&["a", "b", "c"]);
        let room_id = manager.create_room(&pid("a"), CreateRoomRequest {
            name: "Cup".into(),
            room_type: RoomType::Tournament,
            players_max: Some(8),
        }).unwrap();
        for p in ["b", "c"] {
            manager.join_room(&pid(p), &room_id).unwrap();
            manager.toggle_ready(&pid(p)).unwrap();
        }

        let mut now = Instant::now();
        manager.start_game(&pid("a"), now).unwrap();
        let first_level = manager.tournament(&room_id).unwrap().current_level().to_vec();
        assert_eq!(first_level.len(), 2);
        assert!(first_level[1].is_bye());

        // Two matches: the opening pair, then the final against the bye
        for _ in 0..2 {
            now = run_to_kickoff(&mut manager, now);
            assert_eq!(manager.room(&room_id).unwrap().active_count(), 2);
            manager.run_ticks(30, now);
            assert_eq!(manager.room(&room_id).unwrap().status, RoomStatus::Ending);
            now += manager.config().reset_delay;
            manager.take_outbox();
            manager.poll_timers(now);
        }

        // Scoreless matches go to the higher seed, so the first seed wins
        let champion = first_level[0].players[0].clone().unwrap();
        let outbox = manager.take_outbox();
        let announced = messages_for(&outbox, "a").into_iter().any(|m| matches!(
            m,
            ServerMessage::Notice(Notice { ref title, ref message, .. })
                if title == "Tournament winner" && message.contains(&manager.name_of(&champion))
        ));
        assert!(announced);
        assert!(manager.tournament(&room_id).is_none());
        assert_eq!(manager.room(&room_id).unwrap().status, RoomStatus::Waiting);
    }

    #[test]
    fn test_tournament_forfeit() {
        let mut manager = manager_with(&["a", "b"]);
        let room_id = manager.create_room(&pid("a"), CreateRoomRequest {
            name: "Cup".into(),
            room_type: RoomType::Tournament,
            players_max: None,
        }).unwrap();
        manager.join_room(&pid("b"), &room_id).unwrap();
        manager.toggle_ready(&pid("b")).unwrap();

        let now = Instant::now();
        manager.start_game(&pid("a"), now).unwrap();
        let t = run_to_kickoff(&mut manager, now);

        manager.leave_room(&pid("b"), t).unwrap();
        let m = manager.tournament(&room_id).unwrap().current_match().unwrap().clone();
        assert_eq!(m.winner, Some(pid("a")));
        assert_eq!(manager.room(&room_id).unwrap().status, RoomStatus::Ending);

        manager.poll_timers(t + manager.config().reset_delay);
        assert!(manager.tournament(&room_id).is_none());
        assert_eq!(manager.room(&room_id).unwrap().status, RoomStatus::Waiting);
    }

    #[test]
    fn test_replica_tracks_public_state() {
        let mut manager = RoomManager::new(fast_config());
        manager.connect(pid("a"), "Ada".into());

        let mut replica = Replica::new();
        let apply = |manager: &mut RoomManager, replica: &mut Replica| {
            manager.flush_instructions();
            for out in manager.take_outbox() {
                match out.message {
                    ServerMessage::State { id, user_id, data } if out.to == Recipient::Player(pid("a")) => {
                        replica.apply_state(id, Some(user_id), data);
                    }
                    ServerMessage::Instruction { batch } => {
                        replica.apply_batch(&batch);
                    }
                    _ => {}
                }
            }
        };

        apply(&mut manager, &mut replica);
        manager.connect(pid("b"), "Bob".into());
        let room_id = single_room(&mut manager, &["a", "b"]);
        manager.start_game(&pid("a"), Instant::now()).unwrap();
        apply(&mut manager, &mut replica);

        assert_eq!(replica.data(), manager.public_state());
        assert_eq!(replica.data()["rooms"][&room_id]["status"], "starting");
    }
}
