//! Runs a scripted retrospective between several in-process clients and prints
//! the final board as JSON.
//!
//! Usage: retro-sim [config.json]

mod config;

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use retro_core::{
    create_board, BoardSession, Clock, ManualClock, MemoryClient, MemoryHub, SettingsPatch,
    TimerStatus, Transport, VoteToggle,
};

use crate::config::{default_config_path, load_config, SimConfig};

struct Client {
    name: String,
    connection: MemoryClient,
    session: BoardSession,
}

async fn settle(config: &SimConfig) {
    tokio::time::sleep(Duration::from_millis(config.settle_ms)).await;
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);
    let config = load_config(&path);
    if config.participants.is_empty() {
        return Err("at least one participant is required".into());
    }

    let hub = MemoryHub::new();
    let clock = Arc::new(ManualClock::default());
    let board = create_board(
        hub.connect().records().as_ref(),
        clock.as_ref(),
        &config.board_title,
        None,
        config.template,
    )
    .await?;

    let mut clients = Vec::new();
    for name in &config.participants {
        let connection = hub.connect();
        let session =
            BoardSession::open(&board.id, &connection, clock.clone(), config.engine.clone()).await?;
        session.join(name).await?;
        settle(&config).await;
        clients.push(Client {
            name: name.clone(),
            connection,
            session,
        });
    }
    let host = &clients[0].session;

    host.gateway()
        .update_settings(SettingsPatch {
            voting_enabled: Some(true),
            max_votes_per_participant: Some(3),
            ..Default::default()
        })
        .await?;

    // Everyone writes one card per column.
    let columns: Vec<String> = host.snapshot().columns.into_iter().map(|c| c.id).collect();
    for client in &clients {
        for (index, column) in columns.iter().enumerate() {
            let text = format!("{}'s note #{}", client.name, index + 1);
            client.session.gateway().add_card(column, &text).await?;
        }
    }
    settle(&config).await;

    let cards = host.snapshot().cards;
    if let (Some(first), Some(second)) = (cards.first(), cards.get(1)) {
        if let Some(target) = columns.last() {
            host.gateway().move_card(&second.id, target, 0).await?;
        }
        host.gateway().combine_cards(&first.id, &second.id).await?;
    }
    settle(&config).await;

    let favorite = host.snapshot().cards.first().map(|c| c.id.clone());
    if let Some(card_id) = &favorite {
        for client in &clients {
            if let VoteToggle::CapReached = client.session.gateway().toggle_vote(card_id).await? {
                log::info!("{} is out of votes", client.name);
            }
        }
    }

    // Timer: start, pause halfway, resume, run out.
    let half = i64::from(config.timer_seconds / 2);
    host.timer().start(config.timer_seconds).await?;
    clock.advance(chrono::Duration::seconds(half));
    let paused = host.timer().pause().await?;
    log::info!("Timer paused with {}s left", paused.remaining);
    host.timer().resume().await?;
    clock.advance(chrono::Duration::seconds(i64::from(config.timer_seconds) - half + 1));
    settle(&config).await;
    for client in &clients {
        client.session.timer().tick();
        log::info!(
            "{} sees the timer {}",
            client.name,
            client.session.timer().state().status.as_str()
        );
    }

    // A connectivity gap on the last client, repaired by the re-fetch.
    if let Some(last) = clients.last().filter(|_| clients.len() > 1) {
        last.connection.disconnect();
        settle(&config).await;
        if let Some(column) = columns.first() {
            host.gateway().add_card(column, "Written while someone was offline").await?;
        }
        last.connection.reconnect();
        settle(&config).await;
        if last.session.snapshot() != host.snapshot() {
            log::warn!("{} diverged after reconnect", last.name);
        }
    }

    host.gateway()
        .add_action_item("Automate the release checklist", Some(clients[0].name.clone()), None)
        .await?;
    host.gateway().complete_board().await?;
    settle(&config).await;

    let expired = host.timer().state().status == TimerStatus::Expired;
    log::info!(
        "Board {} archived at {:?}, timer expired: {}",
        board.id,
        host.snapshot().board.and_then(|b| b.archived_at),
        expired
    );
    if !expired {
        log::warn!("Timer did not expire at {}", clock.now());
    }

    println!("{}", serde_json::to_string_pretty(&host.snapshot())?);

    for client in clients {
        client.session.close().await;
    }
    Ok(())
}
