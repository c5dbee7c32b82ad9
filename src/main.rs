use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Debug;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use clap::Parser;
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use teloxide::dispatching::{Dispatcher, UpdateFilterExt};
use teloxide::types::{CallbackQuery, Message, Update};
use teloxide::{dptree, Bot};
use thiserror::Error;
use tokio::sync::{oneshot, Mutex, Notify, RwLock};
use uuid::Uuid;

mod cache;
mod callback_handlers;
mod cleanup;
mod codec;
mod command;
mod helpers;
mod message_handlers;
mod platform;
mod pool_target;
mod resolver;
mod sqlite_store;
mod store;
mod sum_dice;


use crate::cache::{Fingerprint, LiveElementCache};
use crate::callback_handlers::handle_callback;
use crate::cleanup::{CleanupCoordinator, CleanupHandle, CleanupPolicy, CleanupRequest};
use crate::codec::{EncodedMessage, FrameLimits, Identifier, ID_DELIMITER};
use crate::command::{
    Answer, ButtonSpec, ClickContext, CommandConfig, CommandState, DiceEvaluator, EvalError,
    InteractiveCommand, MessageLayout, RandomDice, Step,
};
use crate::helpers::*;
use crate::message_handlers::handle_message;
use crate::platform::{DeleteOutcome, Platform, PlatformError, RawClickEvent, TelegramPlatform};
use crate::pool_target::{PoolTargetCommand, PoolTargetConfig};
use crate::resolver::{ClickOutcome, ComponentHandler, CoreServices, Registry, ResolveError, Resolver};
use crate::sqlite_store::SqliteStore;
use crate::store::{ConfigStateStore, ConfigurationRow, InteractionStateRow, Persisted, StoreError, StoreResult};
use crate::sum_dice::{SumDiceCommand, SumDiceConfig};

pub(crate) type ChannelId = i64;
pub(crate) type MessageId = i64;

const DEFAULT_IDENTIFIER_MAX_BYTES: usize = 64;
const DEFAULT_MAX_BUTTONS: usize = 100;
const DEFAULT_MAX_CONTENT_CHARS: usize = 4096;
const DEFAULT_GRACE_DELAY_MS: u64 = 10_000;
const DEFAULT_COALESCE_WINDOW_MS: u64 = 1_500;
const DEFAULT_STALE_STATE_TTL_SECS: u64 = 24 * 60 * 60;
const DEFAULT_JANITOR_INTERVAL_SECS: u64 = 10 * 60;
const DEFAULT_STORE_RETRY_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
struct Config {
    token: String,
    database_path: PathBuf,
    limits: FrameLimits,
    cleanup: CleanupPolicy,
    janitor_interval: Duration,
    store_retry_attempts: u32,
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    token: String,
    database_path: PathBuf,
    #[serde(default)]
    limits: Option<LimitsFile>,
    #[serde(default)]
    cleanup: Option<CleanupFile>,
    store_retry_attempts: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct LimitsFile {
    identifier_max_bytes: Option<usize>,
    max_buttons: Option<usize>,
    max_content_chars: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct CleanupFile {
    grace_delay_ms: Option<u64>,
    coalesce_window_ms: Option<u64>,
    stale_state_ttl_secs: Option<u64>,
    janitor_interval_secs: Option<u64>,
}

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    config: PathBuf,
}

struct AppState {
    config: Config,
    services: Arc<CoreServices>,
    telegram: Arc<TelegramPlatform>,
    registry: Registry,
    pool_target: Arc<Resolver<PoolTargetCommand>>,
    sum_dice: Arc<Resolver<SumDiceCommand>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    let config = load_config(&args.config)?;
    if let Some(parent) = config.database_path.parent() {
        fs::create_dir_all(parent).context("create database directory")?;
    }

    let bot = Bot::new(config.token.clone());
    let telegram = Arc::new(TelegramPlatform::new(bot.clone()));
    let store: Arc<dyn ConfigStateStore> =
        Arc::new(SqliteStore::new(&config.database_path).context("open sqlite store")?);
    let services = CoreServices::new(
        store,
        telegram.clone(),
        Arc::new(RandomDice),
        config.limits,
        config.cleanup.clone(),
    );

    let pool_target = Arc::new(Resolver::new(PoolTargetCommand, services.clone()));
    let sum_dice = Arc::new(Resolver::new(SumDiceCommand, services.clone()));
    let registry = Registry::new(vec![
        pool_target.clone() as Arc<dyn ComponentHandler>,
        sum_dice.clone() as Arc<dyn ComponentHandler>,
    ])?;

    start_janitor_loop(services.cleanup.clone(), config.janitor_interval);
    info!(
        "starting with identifier ceiling {} bytes, grace delay {}ms",
        config.limits.identifier_max_bytes,
        config.cleanup.grace_delay.as_millis()
    );

    let state = Arc::new(AppState {
        config,
        services,
        telegram,
        registry,
        pool_target,
        sum_dice,
    });

    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(handle_message))
        .branch(Update::filter_callback_query().endpoint(handle_callback));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}
