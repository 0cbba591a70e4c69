//! End-to-end tests for the KKTP engine over the in-memory mock ledger.
//!
//! Drives the public facade exactly as a game integration would: init the
//! stack, start a game, record moves, let heartbeats anchor them, end the
//! game, and finally reconstruct and audit the whole chain from the DAG.
//!
//! Run with:
//!   cargo test -p kktp-engine --test e2e

use std::sync::Arc;
use std::time::{Duration, Instant};

use kktp_adapter::{LedgerAdapter, MockLedger};
use kktp_anchor::codec::{classify, AnchorKind, HeartbeatAnchor};
use kktp_anchor::strategy::FinalState;
use kktp_core::events::GameEvent;
use kktp_core::types::{BlockHash, MovePayload};
use kktp_engine::{EngineConfig, GameEngine, StartParams};

// ── Helpers ──────────────────────────────────────────────────────────────────

fn temp_config(tag: &str) -> EngineConfig {
    let dir = std::env::temp_dir().join(format!(
        "kktp_e2e_{}_{}_{}",
        tag,
        std::process::id(),
        rand::random::<u64>()
    ));
    let mut config = EngineConfig::new(dir);
    // Fast cadence so heartbeats land within the test window.
    config.heartbeat_interval_ms = 100;
    config
}

/// Poll until `check` passes or the timeout elapses.
async fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<GameEvent>) -> Vec<GameEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".parse().unwrap()),
        )
        .try_init();
}

/// Moves committed by heartbeat anchors visible on the ledger so far.
fn anchored_entry_count(ledger: &MockLedger) -> usize {
    ledger
        .all_blocks()
        .iter()
        .flat_map(|b| b.transactions.iter())
        .filter(|tx| classify(&tx.payload) == Some(AnchorKind::Heartbeat))
        .filter_map(|tx| HeartbeatAnchor::decode(&tx.payload).ok())
        .map(|hb| hb.entries.len())
        .sum()
}

// ── Full anchor pipeline ─────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn game_lifecycle_anchors_and_audits() {
    init_tracing();
    let ledger = Arc::new(MockLedger::new());
    ledger.fund(12, 500_000_000);

    let engine = GameEngine::new(ledger.clone(), temp_config("lifecycle"));
    let mut events = engine.take_events().unwrap();

    // ── 1. init ──────────────────────────────────────────────────────────────
    let init = engine.init().await.expect("init");
    assert!(init.balance_sompi > 0);
    // The entropy provider follows the live stream; its first beacon block.
    ledger.produce_empty_block();

    // ── 2. start a game ──────────────────────────────────────────────────────
    let start = engine
        .start_game(StartParams {
            game_id: Some("game-42".into()),
            player_id: Some("p1".into()),
            ..Default::default()
        })
        .await
        .expect("start_game");
    assert_eq!(start.game_id, "game-42");
    assert_eq!(start.game_id_tag_hex.len(), 8);

    // ── 3. record moves ──────────────────────────────────────────────────────
    let m1 = engine.record_move("jump", MovePayload::Lane { lane: 2 }).expect("move 1");
    let m2 = engine
        .record_move("move", MovePayload::Move { x: 100, y: 200, z: 300 })
        .expect("move 2");
    assert_eq!((m1.sequence, m2.sequence), (1, 2));
    assert_ne!(m1.move_id, m2.move_id);
    engine
        .record_event("checkpoint", serde_json::json!({"score": 10}))
        .expect("record_event");

    // ── 4. heartbeat anchors the moves ───────────────────────────────────────
    assert!(
        wait_for(Duration::from_secs(5), || {
            engine
                .get_audit_data()
                .map(|audit| audit.anchor_chain.len() >= 2)
                .unwrap_or(false)
        })
        .await,
        "heartbeat never anchored the moves"
    );

    // ── 5. verifiable randomness leaves the move chain alone ─────────────────
    let r1 = engine.get_random(Some(b"coin")).unwrap();
    let r2 = engine.get_random(Some(b"coin")).unwrap();
    assert_eq!(r1.value, r2.value);
    let shuffled = engine.shuffle(&[1, 2, 3, 4, 5]).unwrap();
    assert_eq!(shuffled.len(), 5);
    let m3 = engine.record_move("collect", MovePayload::Lane { lane: 0 }).unwrap();
    assert_eq!(m3.sequence, 3, "randomness must not consume sequence numbers");

    // ── 6. end the game ──────────────────────────────────────────────────────
    // Wait until every move sits in an on-ledger heartbeat, so the final
    // anchor's declared count matches.
    assert!(
        wait_for(Duration::from_secs(5), || anchored_entry_count(&ledger) == 3).await,
        "moves never fully anchored"
    );
    let end = engine
        .end_game(FinalState { final_score: 900, coins_collected: 7 })
        .await
        .expect("end_game");
    assert!(end.success);
    let final_block = ledger.produce_empty_block();

    // ── 7. audit from the DAG alone ──────────────────────────────────────────
    let genesis_block = BlockHash::from_hex(&start.genesis_block_hash_hex).unwrap();
    let chain = engine
        .get_audit_data_from_dag(
            &genesis_block,
            &final_block.hash,
            &start.game_id_tag_hex,
            &start.genesis_anchor,
        )
        .await
        .expect("reconstruct");
    assert_eq!(chain.tx_ids, end.audit.anchor_chain);
    assert_eq!(chain.entries().len(), 3, "all three moves anchored");

    let verdict = engine.audit_cheating(&chain, &start.player_pub_sig, Some(&end.audit.snapshot));
    assert!(verdict.passed, "audit verdict: {}", verdict.verdict);

    // ── 8. events observed along the way ─────────────────────────────────────
    let seen = drain(&mut events);
    let saw = |f: fn(&GameEvent) -> bool| seen.iter().any(f);
    assert!(saw(|e| matches!(e, GameEvent::GameReady { .. })));
    assert!(saw(|e| matches!(e, GameEvent::GenesisAnchored { .. })));
    assert!(saw(|e| matches!(e, GameEvent::MoveProcessed { .. })));
    assert!(saw(|e| matches!(e, GameEvent::HeartbeatAnchored { .. })));
    assert!(saw(|e| matches!(e, GameEvent::AnchorComplete { .. })));
    assert!(saw(|e| matches!(e, GameEvent::GameEnded { .. })));

    engine.shutdown().await.unwrap();
}

// ── Lobby over the shared ledger ─────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn lobby_create_join_and_group_chat() {
    init_tracing();
    // One ledger, two engines: host and member observe the same blocks.
    let ledger = Arc::new(MockLedger::new());
    ledger.fund(20, 500_000_000);

    let host = GameEngine::new(ledger.clone(), temp_config("lobby_host"));
    let member = GameEngine::new(ledger.clone(), temp_config("lobby_member"));
    let mut host_events = host.take_events().unwrap();
    let mut member_events = member.take_events().unwrap();

    host.init().await.expect("host init");
    member.init().await.expect("member init");

    // ── Host opens the lobby and shares the join code ────────────────────────
    let (lobby_id, join_code) = host
        .create_lobby("friday-night", 4, "slap-jack", "1.0")
        .await
        .expect("create_lobby");
    assert!(join_code.contains(':'));

    // ── Member joins via the code ────────────────────────────────────────────
    let joined_id = member.join_lobby(&join_code, "alice").await.expect("join_lobby");
    assert_eq!(joined_id, lobby_id);

    let member_seen = drain(&mut member_events);
    assert!(member_seen.iter().any(|e| matches!(e, GameEvent::LobbyJoined { .. })));
    let host_seen = drain(&mut host_events);
    assert!(host_seen
        .iter()
        .any(|e| matches!(e, GameEvent::LobbyMemberJoined { .. })));

    // ── Group chat flows host → member ───────────────────────────────────────
    host.send_lobby_message(b"welcome!").await.expect("group send");
    let mut got_message = false;
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline && !got_message {
        for event in drain(&mut member_events) {
            if let GameEvent::GroupMessage { plaintext, .. } = event {
                assert_eq!(plaintext, b"welcome!");
                got_message = true;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(got_message, "group message never arrived");

    // ── Key rotation propagates over the member DM ───────────────────────────
    host.rotate_lobby_key().await.expect("rotate");
    let mut member_rotated = false;
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline && !member_rotated {
        member_rotated = drain(&mut member_events)
            .iter()
            .any(|e| matches!(e, GameEvent::GroupKeyRotated { version: 2 }));
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(member_rotated, "rotation never reached the member");

    // Messages at the new version still decrypt.
    host.send_lobby_message(b"post-rotation").await.unwrap();
    let mut got_rotated_message = false;
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline && !got_rotated_message {
        got_rotated_message = drain(&mut member_events).iter().any(|e| {
            matches!(e, GameEvent::GroupMessage { plaintext, .. } if plaintext == b"post-rotation")
        });
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(got_rotated_message);

    // ── Host closes; member resets ───────────────────────────────────────────
    host.close_lobby().await.expect("close");
    let mut member_closed = false;
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline && !member_closed {
        member_closed = drain(&mut member_events)
            .iter()
            .any(|e| matches!(e, GameEvent::LobbyClosed { .. }));
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(member_closed, "close never reached the member");

    host.shutdown().await.unwrap();
    member.shutdown().await.unwrap();
}

// ── Failure surfaces ─────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn operations_in_wrong_state_are_rejected() {
    init_tracing();
    let ledger = Arc::new(MockLedger::new());
    ledger.fund(4, 500_000_000);
    let engine = GameEngine::new(ledger.clone(), temp_config("states"));

    // Before init, nothing works.
    assert!(engine.record_move("jump", MovePayload::Lane { lane: 0 }).is_err());
    assert!(engine.start_game(StartParams::default()).await.is_err());

    engine.init().await.unwrap();
    ledger.produce_empty_block();
    // Moves before a game exists.
    assert!(engine.record_move("jump", MovePayload::Lane { lane: 0 }).is_err());

    engine.start_game(StartParams::default()).await.unwrap();
    // A second game while one is running.
    assert!(engine.start_game(StartParams::default()).await.is_err());

    engine.end_game(FinalState::default()).await.unwrap();
    // After the game is over, the engine is READY again.
    assert!(engine.record_move("jump", MovePayload::Lane { lane: 0 }).is_err());
    engine.start_game(StartParams::default()).await.unwrap();

    engine.shutdown().await.unwrap();
    assert!(engine.start_game(StartParams::default()).await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn balance_is_visible_and_join_code_validates() {
    init_tracing();
    let ledger = Arc::new(MockLedger::new());
    ledger.fund(4, 250_000_000);
    let engine = GameEngine::new(ledger.clone(), temp_config("misc"));
    let init = engine.init().await.unwrap();
    assert_eq!(init.balance_sompi, ledger.balance().await.unwrap());

    // Garbage join codes fail fast, before any network traffic.
    assert!(engine.join_lobby("not-a-code", "bob").await.is_err());

    engine.shutdown().await.unwrap();
}
