//! Knockout Brackets
//!
//! Seeds are shuffled once, paired into one-on-one matches and the winners
//! of each level are paired again until a single champion remains. An odd
//! seed out receives a bye.

use serde::{Serialize, Deserialize};

use crate::core::rng::DeterministicRng;
use crate::game::state::PlayerId;
use crate::lobby::room::RoomId;

/// Match lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchStage {
    Pending,
    Active,
    Finished,
}

/// One bracket match. A bye has a single player and is finished on creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Match {
    pub stage: MatchStage,
    pub players: [Option<PlayerId>; 2],
    pub scores: [u32; 2],
    pub winner: Option<PlayerId>,
}

impl Match {
    pub fn new(first: PlayerId, second: PlayerId) -> Self {
        Self {
            stage: MatchStage::Pending,
            players: [Some(first), Some(second)],
            scores: [0, 0],
            winner: None,
        }
    }

    pub fn bye(player: PlayerId) -> Self {
        Self {
            stage: MatchStage::Finished,
            players: [Some(player.clone()), None],
            scores: [0, 0],
            winner: Some(player),
        }
    }

    pub fn is_bye(&self) -> bool {
        self.players[1].is_none()
    }

    pub fn contains(&self, player_id: &PlayerId) -> bool {
        self.players.iter().any(|p| p.as_ref() == Some(player_id))
    }

    /// Higher score wins; a tie goes to the higher seed.
    fn leader(&self) -> Option<PlayerId> {
        let slot = if self.scores[1] > self.scores[0] { 1 } else { 0 };
        self.players[slot].clone().or_else(|| self.players[0].clone())
    }

    /// Close the match on the given scores.
    pub fn finish_with_scores(&mut self, scores: [u32; 2]) -> Option<PlayerId> {
        self.scores = scores;
        self.winner = self.leader();
        self.stage = MatchStage::Finished;
        self.winner.clone()
    }

    /// Close the match because `leaver` left. The opponent wins if still
    /// present, otherwise the current leader.
    pub fn forfeit(&mut self, leaver: &PlayerId, opponent_present: bool) -> Option<PlayerId> {
        let opponent = self.players.iter().flatten().find(|p| *p != leaver).cloned();
        self.winner = match opponent {
            Some(opponent) if opponent_present => Some(opponent),
            _ => self.leader(),
        };
        self.stage = MatchStage::Finished;
        self.winner.clone()
    }
}

/// Result of moving past a completed level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// A new level was built.
    NextLevel,
    /// One winner remains.
    Champion(PlayerId),
    /// No connected winners remain.
    Abandoned,
}

/// Bracket state for one tournament room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tournament {
    pub room_id: RoomId,
    pub brackets: Vec<Vec<Match>>,
    pub bracket_index: usize,
    pub match_index: usize,
    pub winner: Option<PlayerId>,
}

impl Tournament {
    /// Shuffle `members` with `rng` and build the first level.
    pub fn new(room_id: RoomId, members: &[PlayerId], rng: &mut DeterministicRng) -> Self {
        let mut seeds = members.to_vec();
        rng.shuffle(&mut seeds);
        Self::from_seeds(room_id, seeds)
    }

    /// Build the first level from seeds in the given order.
    pub fn from_seeds(room_id: RoomId, seeds: Vec<PlayerId>) -> Self {
        Self {
            room_id,
            brackets: vec![Self::build_level(&seeds)],
            bracket_index: 0,
            match_index: 0,
            winner: None,
        }
    }

    /// Pair seeds in order; an odd one out gets a bye.
    pub fn build_level(seeds: &[PlayerId]) -> Vec<Match> {
        seeds
            .chunks(2)
            .map(|pair| match pair {
                [a, b] => Match::new(a.clone(), b.clone()),
                _ => Match::bye(pair[0].clone()),
            })
            .collect()
    }

    pub fn current_level(&self) -> &[Match] {
        self.brackets.get(self.bracket_index).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn current_match(&self) -> Option<&Match> {
        self.current_level().get(self.match_index)
    }

    fn current_match_mut(&mut self) -> Option<&mut Match> {
        self.brackets.get_mut(self.bracket_index)?.get_mut(self.match_index)
    }

    /// Index of the next pending match in the current level.
    pub fn next_pending(&self) -> Option<usize> {
        self.current_level().iter().position(|m| m.stage == MatchStage::Pending)
    }

    /// Mark match `index` of the current level active and point at it.
    pub fn activate(&mut self, index: usize) -> Option<&Match> {
        self.match_index = index;
        let m = self.current_match_mut()?;
        m.stage = MatchStage::Active;
        Some(&*m)
    }

    /// Add a goal for `player_id` in the active match.
    pub fn record_goal(&mut self, player_id: &PlayerId) {
        if let Some(m) = self.current_match_mut() {
            if m.stage != MatchStage::Active {
                return;
            }
            if let Some(slot) = m.players.iter().position(|p| p.as_ref() == Some(player_id)) {
                m.scores[slot] += 1;
            }
        }
    }

    /// Finish the active match on its recorded scores.
    pub fn finish_current(&mut self) -> Option<PlayerId> {
        let m = self.current_match_mut()?;
        if m.stage != MatchStage::Active {
            return m.winner.clone();
        }
        let scores = m.scores;
        m.finish_with_scores(scores)
    }

    /// Forfeit the active match if `leaver` is in it.
    pub fn forfeit_current(&mut self, leaver: &PlayerId, opponent_present: bool) -> Option<PlayerId> {
        let m = self.current_match_mut()?;
        if m.stage != MatchStage::Active || !m.contains(leaver) {
            return None;
        }
        m.forfeit(leaver, opponent_present)
    }

    pub fn level_complete(&self) -> bool {
        self.current_level().iter().all(|m| m.stage == MatchStage::Finished)
    }

    /// Pair this level's connected winners into the next level.
    pub fn advance(&mut self, is_connected: impl Fn(&PlayerId) -> bool) -> Advance {
        let pool: Vec<PlayerId> = self.current_level()
            .iter()
            .filter_map(|m| m.winner.clone())
            .filter(|p| is_connected(p))
            .collect();

        match pool.len() {
            0 => Advance::Abandoned,
            1 => {
                let champion = pool[0].clone();
                self.winner = Some(champion.clone());
                Advance::Champion(champion)
            }
            _ => {
                self.brackets.push(Self::build_level(&pool));
                self.bracket_index = self.brackets.len() - 1;
                self.match_index = 0;
                Advance::NextLevel
            }
        }
    }
}
