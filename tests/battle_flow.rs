// Integration tests for the battle flow: session lifecycle, the turn
// controller driven through the live BattleServer, and prompt/image
// persistence.

use std::sync::Arc;
use std::time::Duration;

use promptduel_backend::auth;
use promptduel_backend::battle::{BattleController, Phase, TimeoutPolicy};
use promptduel_backend::db::Database;
use promptduel_backend::generate::GenerationClient;
use promptduel_backend::live::BattleServer;
use promptduel_backend::session;

async fn test_db() -> Arc<Database> {
    Arc::new(Database::new("sqlite::memory:").await.unwrap())
}

/// A server whose generation client has no API token: every generation
/// attempt fails immediately without touching the network.
fn offline_server(db: Arc<Database>) -> Arc<BattleServer> {
    let generator = Arc::new(GenerationClient::new(
        "http://localhost:9/unused".into(),
        None,
        std::env::temp_dir(),
    ));
    Arc::new(BattleServer::new(db, generator))
}

async fn register_user(db: &Database, username: &str) -> i64 {
    let hash = auth::hash_password("hunter2!").unwrap();
    db.create_user(username, &hash, None).await.unwrap().id
}

// ── Session lifecycle ────────────────────────────────────────────────

#[tokio::test]
async fn test_session_create_join_close_flow() {
    let db = test_db().await;
    let host = register_user(&db, "host@example.com").await;

    let session = session::create_session_with_code(&db, host, 2, 60, Some("neon"))
        .await
        .unwrap();
    assert!(session::is_valid_code(&session.session_code));

    // The code resolves while there is room.
    let found = db
        .get_joinable_session_by_code(&session.session_code)
        .await
        .unwrap();
    assert!(found.is_some());

    // Join takes the last seat; the session stops matching after that.
    assert!(db.join_session(&session.session_code).await.unwrap());
    assert!(!db.join_session(&session.session_code).await.unwrap());
    assert!(db
        .get_joinable_session_by_code(&session.session_code)
        .await
        .unwrap()
        .is_none());

    // Closing makes the code dead even if seats were free.
    assert!(db.close_session(session.id).await.unwrap());
    assert!(!db.join_session(&session.session_code).await.unwrap());
}

#[tokio::test]
async fn test_login_verifies_stored_hash() {
    let db = test_db().await;
    let hash = auth::hash_password("secret-pass").unwrap();
    db.create_user("login@example.com", &hash, None)
        .await
        .unwrap();

    let user = db
        .get_user_by_username("login@example.com")
        .await
        .unwrap()
        .unwrap();
    assert!(auth::verify_password("secret-pass", &user.password_hash).unwrap());
    assert!(!auth::verify_password("wrong-pass", &user.password_hash).unwrap());

    let missing = db.get_user_by_username("ghost@example.com").await.unwrap();
    assert!(missing.is_none());
}

// ── Battle flow through the live server ──────────────────────────────

#[tokio::test]
async fn test_failed_generation_keeps_turn_and_records_attempt() {
    let db = test_db().await;
    let host = register_user(&db, "p1@example.com").await;
    let session = session::create_session_with_code(&db, host, 2, 60, None)
        .await
        .unwrap();

    let server = offline_server(db.clone());
    let battle = server.open(session.id, 60, TimeoutPolicy::Permissive, Some(host));

    server.start(&battle).unwrap();
    server.set_prompt(&battle, 1, "a red cube").unwrap();
    let state = server.submit(&battle, 1).unwrap();
    assert_eq!(state.phase, Phase::Generating);

    // The unconfigured generator rejects at once; the turn is retried.
    let mut state = battle.snapshot();
    for _ in 0..200 {
        if state.phase != Phase::Generating {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        state = battle.snapshot();
    }
    assert_eq!(state.phase, Phase::Player1Turn);
    assert!(!state.player1.is_submitted);
    assert!(state.error.is_some());

    // The attempt was journaled: one prompt row, one failed image row.
    let prompts = db.list_prompts(session.id).await.unwrap();
    assert_eq!(prompts.len(), 1);
    assert_eq!(prompts[0].prompt_text, "a red cube");
    assert_eq!(prompts[0].player_position, 1);
    assert_eq!(prompts[0].user_id, host);

    let images = db.list_images_for_session(session.id).await.unwrap();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].generation_status, "failed");
    assert!(images[0].image_url.is_none());
}

#[tokio::test]
async fn test_ws_subscribers_see_submission_lifecycle() {
    let db = test_db().await;
    let server = offline_server(db);
    let battle = server.open(99, 60, TimeoutPolicy::Permissive, None);
    let mut rx = battle.subscribe();

    server.start(&battle).unwrap();
    server.set_prompt(&battle, 1, "a lighthouse at dusk").unwrap();
    server.submit(&battle, 1).unwrap();

    // start → prompt edit → generating all arrive, in order.
    let started = rx.recv().await.unwrap();
    assert!(started.contains("\"phase\":\"player1-turn\""));
    let edited = rx.recv().await.unwrap();
    assert!(edited.contains("a lighthouse at dusk"));
    let generating = rx.recv().await.unwrap();
    assert!(generating.contains("\"phase\":\"generating\""));
}

// ── Controller scenarios from the observed behavior ──────────────────

#[tokio::test]
async fn test_full_battle_to_complete() {
    let mut ctl = BattleController::new(60, TimeoutPolicy::Permissive);
    ctl.start().unwrap();

    ctl.set_prompt(1, "a red cube").unwrap();
    let p1 = ctl.submit(1).unwrap();
    assert!(ctl.resolve_generation(p1.seq, Ok("img123".into())));
    let state = ctl.snapshot();
    assert_eq!(state.phase, Phase::Player2Turn);
    assert_eq!(state.current_player, 2);
    assert_eq!(state.time_left, 60);
    assert_eq!(state.player1.image_url.as_deref(), Some("img123"));
    assert!(state.player1.is_submitted);

    ctl.set_prompt(2, "a blue sphere").unwrap();
    let p2 = ctl.submit(2).unwrap();
    assert!(ctl.resolve_generation(p2.seq, Ok("img456".into())));
    let state = ctl.snapshot();
    assert_eq!(state.phase, Phase::Complete);
    assert!(state.player2.is_submitted);
}

#[tokio::test]
async fn test_countdown_to_implicit_submission() {
    let mut ctl = BattleController::new(60, TimeoutPolicy::Permissive);
    ctl.start().unwrap();
    assert_eq!(ctl.snapshot().time_left, 60);

    for _ in 0..59 {
        assert!(ctl.tick().is_none());
    }
    assert_eq!(ctl.snapshot().time_left, 1);

    // One more tick with nothing typed: the permissive policy lets the
    // empty prompt through to the generator.
    let pending = ctl.tick().expect("implicit submission");
    assert_eq!(pending.player, 1);
    assert_eq!(pending.prompt, "");
}
