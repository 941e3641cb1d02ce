// Live battle serving: one controller per session, a countdown task, and
// state broadcast to WebSocket subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::battle::{BattleController, BattleError, BattleState, PendingGeneration, Phase, TimeoutPolicy};
use crate::db::Database;
use crate::generate::GenerationClient;
use crate::metrics;

/// Messages sent to WebSocket clients watching a battle.
#[derive(Clone, Serialize, Debug)]
#[serde(tag = "type")]
pub enum BattleMessage {
    /// Full battle state snapshot, sent after every mutation and tick.
    #[serde(rename = "state")]
    State(BattleState),
}

/// One battle held in memory for the lifetime of a session. State is
/// transient by design: nothing about an in-progress battle is persisted.
pub struct LiveBattle {
    pub session_id: i64,
    controller: Mutex<BattleController>,
    broadcast_tx: broadcast::Sender<String>,
    /// Bumped on every start; the countdown task exits when superseded.
    ticker_epoch: AtomicU64,
    /// User ids for positions 1 (host) and 2 (joiner), once known.
    players: Mutex<[Option<i64>; 2]>,
    started_at: Mutex<Option<Instant>>,
}

impl LiveBattle {
    fn new(session_id: i64, time_limit: u32, policy: TimeoutPolicy, host_user_id: Option<i64>) -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            session_id,
            controller: Mutex::new(BattleController::new(time_limit, policy)),
            broadcast_tx: tx,
            ticker_epoch: AtomicU64::new(0),
            players: Mutex::new([host_user_id, None]),
            started_at: Mutex::new(None),
        }
    }

    /// Subscribe to state messages. Returns a receiver that yields JSON strings.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.broadcast_tx.subscribe()
    }

    pub fn snapshot(&self) -> BattleState {
        self.controller.lock().unwrap().snapshot()
    }

    /// Current snapshot as the wire message, for late-joining WS clients.
    pub fn snapshot_json(&self) -> String {
        let msg = BattleMessage::State(self.snapshot());
        serde_json::to_string(&msg).unwrap_or_else(|_| "{}".to_string())
    }

    /// Record which user occupies a player position.
    pub fn set_player(&self, position: u8, user_id: i64) {
        if let Some(slot) = self.players.lock().unwrap().get_mut((position as usize).wrapping_sub(1)) {
            *slot = Some(user_id);
        }
    }

    pub fn player_user_id(&self, position: u8) -> Option<i64> {
        self.players
            .lock()
            .unwrap()
            .get((position as usize).wrapping_sub(1))
            .copied()
            .flatten()
    }

    fn broadcast(&self) {
        let _ = self.broadcast_tx.send(self.snapshot_json());
    }
}

/// Registry of live battles plus the collaborators needed to run them:
/// the generation client and the database for prompt/image persistence.
pub struct BattleServer {
    db: Arc<Database>,
    generator: Arc<GenerationClient>,
    battles: Mutex<HashMap<i64, Arc<LiveBattle>>>,
}

impl BattleServer {
    pub fn new(db: Arc<Database>, generator: Arc<GenerationClient>) -> Self {
        Self {
            db,
            generator,
            battles: Mutex::new(HashMap::new()),
        }
    }

    /// Get the battle for a session, creating it in the waiting phase if
    /// this is the first time the session is seen.
    pub fn open(
        &self,
        session_id: i64,
        time_limit: u32,
        policy: TimeoutPolicy,
        host_user_id: Option<i64>,
    ) -> Arc<LiveBattle> {
        let mut battles = self.battles.lock().unwrap();
        battles
            .entry(session_id)
            .or_insert_with(|| {
                Arc::new(LiveBattle::new(session_id, time_limit, policy, host_user_id))
            })
            .clone()
    }

    pub fn get(&self, session_id: i64) -> Option<Arc<LiveBattle>> {
        self.battles.lock().unwrap().get(&session_id).cloned()
    }

    /// Drop a session's battle (e.g. when the session is closed).
    pub fn remove(&self, session_id: i64) -> bool {
        self.battles.lock().unwrap().remove(&session_id).is_some()
    }

    /// Start the battle and spawn its once-per-second countdown task.
    pub fn start(&self, battle: &Arc<LiveBattle>) -> Result<BattleState, BattleError> {
        battle.controller.lock().unwrap().start()?;
        metrics::BATTLES_STARTED_TOTAL.inc();
        metrics::ACTIVE_BATTLES.inc();
        *battle.started_at.lock().unwrap() = Some(Instant::now());
        tracing::info!(session_id = battle.session_id, "Battle started");
        battle.broadcast();
        self.spawn_ticker(battle.clone());
        Ok(battle.snapshot())
    }

    /// Update the active player's prompt text.
    pub fn set_prompt(
        &self,
        battle: &Arc<LiveBattle>,
        player: u8,
        text: &str,
    ) -> Result<BattleState, BattleError> {
        battle.controller.lock().unwrap().set_prompt(player, text)?;
        battle.broadcast();
        Ok(battle.snapshot())
    }

    /// Manual submission: validate, flip to generating, and fire the
    /// generation call.
    pub fn submit(
        &self,
        battle: &Arc<LiveBattle>,
        player: u8,
    ) -> Result<BattleState, BattleError> {
        let result = battle.controller.lock().unwrap().submit(player);
        match result {
            Ok(pending) => {
                battle.broadcast();
                spawn_generation(
                    self.db.clone(),
                    self.generator.clone(),
                    battle.clone(),
                    pending,
                );
                Ok(battle.snapshot())
            }
            Err(e) => {
                // The validation message is part of the state, so viewers
                // see it too.
                battle.broadcast();
                Err(e)
            }
        }
    }

    /// Back to the waiting phase. Any in-flight generation response will
    /// be discarded as stale.
    pub fn reset(&self, battle: &Arc<LiveBattle>) -> BattleState {
        battle.controller.lock().unwrap().reset();
        tracing::info!(session_id = battle.session_id, "Battle reset");
        battle.broadcast();
        battle.snapshot()
    }

    /// Once-per-second countdown. The task acts only while its epoch is
    /// current, so a reset-then-restart supersedes it cleanly.
    fn spawn_ticker(&self, battle: Arc<LiveBattle>) {
        let epoch = battle.ticker_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let db = self.db.clone();
        let generator = self.generator.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                if battle.ticker_epoch.load(Ordering::SeqCst) != epoch {
                    // A newer battle run owns the countdown now.
                    metrics::ACTIVE_BATTLES.dec();
                    return;
                }

                let (pending, phase, is_active) = {
                    let mut ctl = battle.controller.lock().unwrap();
                    let pending = ctl.tick();
                    let snap_phase = ctl.phase();
                    let active = ctl.snapshot().is_active;
                    (pending, snap_phase, active)
                };

                if let Some(p) = pending {
                    metrics::TIMEOUT_SUBMISSIONS_TOTAL.inc();
                    tracing::info!(
                        session_id = battle.session_id,
                        player = p.player,
                        "Turn clock expired, submitting current prompt"
                    );
                    battle.broadcast();
                    spawn_generation(db.clone(), generator.clone(), battle.clone(), p);
                    continue;
                }

                if phase == Phase::Complete || !is_active {
                    metrics::ACTIVE_BATTLES.dec();
                    return;
                }

                battle.broadcast();
            }
        });
    }
}

/// Run the generation call off-task and feed the outcome back through the
/// controller. A response that lost a race with reset is dropped.
fn spawn_generation(
    db: Arc<Database>,
    generator: Arc<GenerationClient>,
    battle: Arc<LiveBattle>,
    pending: PendingGeneration,
) {
    tokio::spawn(async move {
        let outcome = generator
            .generate(&pending.prompt)
            .await
            .map(|artifact| artifact.url)
            .map_err(|e| e.to_string());

        let applied = battle
            .controller
            .lock()
            .unwrap()
            .resolve_generation(pending.seq, outcome.clone());
        if !applied {
            tracing::debug!(
                session_id = battle.session_id,
                seq = pending.seq,
                "Discarding stale generation response"
            );
            return;
        }

        persist_attempt(&db, &battle, &pending, &outcome).await;

        if battle.snapshot().phase == Phase::Complete {
            metrics::BATTLES_COMPLETED_TOTAL.inc();
            if let Some(started) = *battle.started_at.lock().unwrap() {
                metrics::BATTLE_DURATION_SECONDS
                    .with_label_values(&["complete"])
                    .observe(started.elapsed().as_secs_f64());
            }
            tracing::info!(session_id = battle.session_id, "Battle complete");
        }

        battle.broadcast();
    });
}

/// Record the prompt and image rows for a finished generation attempt.
/// Persistence failures are logged, never surfaced to the battle.
async fn persist_attempt(
    db: &Database,
    battle: &LiveBattle,
    pending: &PendingGeneration,
    outcome: &Result<String, String>,
) {
    let Some(user_id) = battle.player_user_id(pending.player) else {
        tracing::debug!(
            session_id = battle.session_id,
            player = pending.player,
            "No user known for player position, skipping persistence"
        );
        return;
    };

    let prompt_row = match db
        .record_prompt(
            battle.session_id,
            user_id,
            &pending.prompt,
            pending.player as i64,
        )
        .await
    {
        Ok(row) => row,
        Err(e) => {
            tracing::error!("Failed to record prompt: {e}");
            return;
        }
    };

    let (image_url, status) = match outcome {
        Ok(url) => (Some(url.as_str()), "completed"),
        Err(_) => (None, "failed"),
    };
    if let Err(e) = db.record_image(prompt_row.id, image_url, status).await {
        tracing::error!("Failed to record generated image: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_server() -> Arc<BattleServer> {
        let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
        // No API token: generation fails fast without touching the network.
        let generator = Arc::new(GenerationClient::new(
            "http://localhost:9/unused".into(),
            None,
            std::env::temp_dir(),
        ));
        Arc::new(BattleServer::new(db, generator))
    }

    async fn wait_for_phase_change(battle: &Arc<LiveBattle>, from: Phase) -> BattleState {
        for _ in 0..200 {
            let snap = battle.snapshot();
            if snap.phase != from {
                return snap;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("battle never left phase {from:?}");
    }

    #[tokio::test]
    async fn test_open_is_idempotent_per_session() {
        let server = test_server().await;
        let a = server.open(1, 60, TimeoutPolicy::Permissive, Some(7));
        let b = server.open(1, 90, TimeoutPolicy::Permissive, Some(8));
        assert!(Arc::ptr_eq(&a, &b));
        // The first open wins; the second is a lookup.
        assert_eq!(b.snapshot().time_left, 60);
        assert_eq!(b.player_user_id(1), Some(7));

        assert!(server.get(1).is_some());
        assert!(server.get(2).is_none());
        assert!(server.remove(1));
        assert!(!server.remove(1));
    }

    #[tokio::test]
    async fn test_start_broadcasts_state() {
        let server = test_server().await;
        let battle = server.open(1, 60, TimeoutPolicy::Permissive, None);
        let mut rx = battle.subscribe();

        let state = server.start(&battle).unwrap();
        assert_eq!(state.phase, Phase::Player1Turn);

        let msg = rx.recv().await.unwrap();
        assert!(msg.contains("\"type\":\"state\""));
        assert!(msg.contains("\"phase\":\"player1-turn\""));
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let server = test_server().await;
        let battle = server.open(1, 60, TimeoutPolicy::Permissive, None);
        server.start(&battle).unwrap();
        assert!(server.start(&battle).is_err());
    }

    #[tokio::test]
    async fn test_failed_generation_returns_turn_to_player() {
        let server = test_server().await;
        let battle = server.open(1, 60, TimeoutPolicy::Permissive, None);
        server.start(&battle).unwrap();
        server.set_prompt(&battle, 1, "a red cube").unwrap();
        let state = server.submit(&battle, 1).unwrap();
        assert_eq!(state.phase, Phase::Generating);

        // The unconfigured client rejects immediately; the turn comes back.
        let state = wait_for_phase_change(&battle, Phase::Generating).await;
        assert_eq!(state.phase, Phase::Player1Turn);
        assert!(!state.player1.is_submitted);
        assert!(state.error.unwrap().contains("not configured"));
    }

    #[tokio::test]
    async fn test_submit_validation_error_keeps_phase() {
        let server = test_server().await;
        let battle = server.open(1, 60, TimeoutPolicy::Permissive, None);
        server.start(&battle).unwrap();

        let err = server.submit(&battle, 1).unwrap_err();
        assert_eq!(err, BattleError::EmptyPrompt);
        let snap = battle.snapshot();
        assert_eq!(snap.phase, Phase::Player1Turn);
        assert!(snap.error.is_some());
    }

    #[tokio::test]
    async fn test_reset_returns_to_waiting() {
        let server = test_server().await;
        let battle = server.open(1, 60, TimeoutPolicy::Permissive, None);
        server.start(&battle).unwrap();
        server.set_prompt(&battle, 1, "something").unwrap();

        let state = server.reset(&battle);
        assert_eq!(state.phase, Phase::Waiting);
        assert!(!state.is_active);
        assert!(state.player1.prompt.is_empty());

        // A fresh start works after reset.
        let state = server.start(&battle).unwrap();
        assert_eq!(state.phase, Phase::Player1Turn);
        server.reset(&battle);
    }

    #[tokio::test]
    async fn test_player_registration() {
        let server = test_server().await;
        let battle = server.open(5, 60, TimeoutPolicy::Permissive, Some(10));
        assert_eq!(battle.player_user_id(1), Some(10));
        assert_eq!(battle.player_user_id(2), None);

        battle.set_player(2, 11);
        assert_eq!(battle.player_user_id(2), Some(11));
        // Out-of-range positions are ignored.
        battle.set_player(3, 12);
        assert_eq!(battle.player_user_id(3), None);
    }
}
