//! The payload pump: consumes scanner matches and routes each observation to
//! the layer that owns it — handshake anchors and session mailboxes to the
//! session manager, group traffic to the lobby, foreign binary anchors to the
//! opponent tracker. Reactions that must go back on the ledger (join
//! responses, kick acknowledgements) are submitted from here, with a UTXO
//! refresh between serialised join steps.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use kktp_adapter::traits::LedgerAdapter;
use kktp_anchor::codec::{classify, AnchorKind, HeartbeatAnchor};
use kktp_anchor::processor::OpponentMove;
use kktp_core::constants::{KKTP_ANCHOR_PREFIX, KKTP_GROUP_PREFIX};
use kktp_core::types::now_ms;
use kktp_index::scanner::MatchedTx;
use kktp_lobby::lobby::LobbyDm;
use kktp_utxo::manager::UtxoManager;

use crate::engine::{Comms, GameCtx};

pub(crate) struct PumpDeps {
    pub adapter: Arc<dyn LedgerAdapter>,
    pub comms: Arc<AsyncMutex<Comms>>,
    pub game: Arc<Mutex<Option<GameCtx>>>,
    pub utxo_manager: Arc<UtxoManager>,
    pub matches: broadcast::Receiver<MatchedTx>,
    pub shutdown: watch::Receiver<bool>,
}

pub(crate) fn spawn_pump(mut deps: PumpDeps) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut housekeeping = tokio::time::interval(Duration::from_secs(5));
        housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("payload pump started");
        loop {
            tokio::select! {
                _ = deps.shutdown.changed() => {
                    if *deps.shutdown.borrow() {
                        info!("payload pump stopping");
                        return;
                    }
                }
                _ = housekeeping.tick() => {
                    let now = now_ms();
                    let mut comms = deps.comms.lock().await;
                    comms.sessions.poll_gaps(now);
                    comms.lobby.purge_buffers(now);
                }
                received = deps.matches.recv() => {
                    match received {
                        Ok(matched) => route(&deps, matched).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "pump lagged behind the scanner");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            warn!("scanner match stream closed");
                            return;
                        }
                    }
                }
            }
        }
    })
}

async fn route(deps: &PumpDeps, matched: MatchedTx) {
    let now = now_ms();

    if let Some(text) = &matched.decoded {
        if text.starts_with(KKTP_ANCHOR_PREFIX) {
            let mut comms = deps.comms.lock().await;
            if let Err(e) = comms.sessions.handle_anchor_payload(text) {
                debug!(error = %e, "anchor payload dropped");
            }
            return;
        }
        if text.starts_with(KKTP_GROUP_PREFIX) {
            let mut comms = deps.comms.lock().await;
            match comms.lobby.handle_group_payload(text, now) {
                Ok(_routed) => {}
                Err(e) => debug!(error = %e, "group payload dropped"),
            }
            return;
        }
        if text.starts_with(kktp_core::constants::KKTP_MAILBOX_PREFIX) {
            handle_mailbox(deps, text, now).await;
            return;
        }
    }

    // Binary anchors from other players feed opponent-chain tracking.
    if let Some(kind) = classify(&matched.tx.payload) {
        handle_binary_anchor(deps, kind, &matched).await;
    }
}

async fn handle_mailbox(deps: &PumpDeps, text: &str, now: i64) {
    let delivered = {
        let mut comms = deps.comms.lock().await;
        match comms.sessions.handle_mailbox_payload(text, now) {
            Ok(Some((handle, delivered))) => Some((handle, delivered)),
            Ok(None) => None,
            Err(e) => {
                debug!(error = %e, "session payload rejected");
                None
            }
        }
    };
    let Some((handle, plaintexts)) = delivered else { return };

    for plaintext in plaintexts {
        // Lobby control DMs first; anything else may be an opponent move.
        if serde_json::from_slice::<LobbyDm>(&plaintext).is_ok() {
            let reactions = {
                let mut comms = deps.comms.lock().await;
                let Comms { sessions, lobby } = &mut *comms;
                match lobby.handle_dm(sessions, &handle, &plaintext, now) {
                    Ok(reactions) => reactions,
                    Err(e) => {
                        debug!(error = %e, "lobby DM rejected");
                        Vec::new()
                    }
                }
            };
            submit_all(deps, reactions).await;
            drain_join_queue(deps, now).await;
            continue;
        }

        if let Ok(incoming) = serde_json::from_slice::<OpponentMove>(&plaintext) {
            let processor = deps
                .game
                .lock()
                .unwrap()
                .as_ref()
                .map(|ctx| Arc::clone(&ctx.processor));
            if let Some(processor) = processor {
                let outcome = processor.receive_opponent_move(&incoming);
                debug!(?outcome, "opponent move received over session");
            }
            continue;
        }

        debug!(bytes = plaintext.len(), "unclassified session payload delivered");
    }
}

/// Joins are strictly serialised: one accepted join, one UTXO refresh, then
/// the next.
async fn drain_join_queue(deps: &PumpDeps, now: i64) {
    loop {
        let ready = deps.comms.lock().await.lobby.join_ready();
        if !ready {
            return;
        }
        // Refresh the pool before spending on the join's sends.
        if let Err(e) = deps.utxo_manager.run_check().await {
            debug!(error = %e, "UTXO refresh before join failed");
        }
        let payloads = {
            let mut comms = deps.comms.lock().await;
            let Comms { sessions, lobby } = &mut *comms;
            match lobby.process_next_join(sessions, None, now) {
                Ok(payloads) => payloads,
                Err(e) => {
                    warn!(error = %e, "join processing failed");
                    return;
                }
            }
        };
        submit_all(deps, payloads).await;
        deps.comms.lock().await.lobby.join_step_done();
    }
}

async fn handle_binary_anchor(deps: &PumpDeps, kind: AnchorKind, matched: &MatchedTx) {
    let Some((processor, own)) = ({
        let game = deps.game.lock().unwrap();
        game.as_ref().map(|ctx| {
            (Arc::clone(&ctx.processor), ctx.processor.strategy().anchor_chain())
        })
    }) else {
        return;
    };
    // Our own anchors are not opponent traffic.
    if own.contains(&matched.tx.txid) {
        return;
    }
    match kind {
        AnchorKind::Heartbeat => {
            let Ok(decoded) = HeartbeatAnchor::decode(&matched.tx.payload) else {
                return;
            };
            processor.observe_opponent_heartbeat(
                &decoded.prev_tx_id,
                &matched.tx.txid,
                decoded.entries.len() as u32,
            );
        }
        AnchorKind::Genesis | AnchorKind::Final => {
            debug!(txid = %matched.tx.txid, ?kind, "foreign anchor observed");
        }
    }
}

async fn submit_all(deps: &PumpDeps, payloads: Vec<String>) {
    for payload in payloads {
        if let Err(e) = deps.adapter.submit_payload_tx(None, payload.into_bytes()).await {
            warn!(error = %e, "reaction payload submission failed");
        }
    }
}
