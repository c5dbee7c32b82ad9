use super::*;

use crate::codec::{decode, encode_layout, printable, CodecError};
use crate::store::{decode_payload, encode_payload};

const MAX_STATE_ATTEMPTS: usize = 3;
const PROCESSING: &str = "processing ...";

/// Shared collaborators of every resolver.
pub(super) struct CoreServices {
    pub(super) store: Arc<dyn ConfigStateStore>,
    pub(super) platform: Arc<dyn Platform>,
    pub(super) cache: Arc<LiveElementCache>,
    pub(super) cleanup: Arc<CleanupCoordinator>,
    pub(super) evaluator: Arc<dyn DiceEvaluator>,
    pub(super) limits: FrameLimits,
}

impl CoreServices {
    pub(super) fn new(
        store: Arc<dyn ConfigStateStore>,
        platform: Arc<dyn Platform>,
        evaluator: Arc<dyn DiceEvaluator>,
        limits: FrameLimits,
        policy: CleanupPolicy,
    ) -> Arc<Self> {
        let cache = Arc::new(LiveElementCache::new());
        let cleanup = Arc::new(CleanupCoordinator::new(
            store.clone(),
            platform.clone(),
            cache.clone(),
            policy,
        ));
        Arc::new(Self {
            store,
            platform,
            cache,
            cleanup,
            evaluator,
            limits,
        })
    }
}

#[derive(Debug, Error)]
pub(super) enum ResolveError {
    #[error("identifier does not belong to any registered command")]
    NotMatching,
    #[error("{0}")]
    MalformedIdentifier(String),
    #[error("configuration {config_uuid} of '{command_id}' is missing")]
    ConfigurationMissing { command_id: String, config_uuid: Uuid },
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),
    #[error("platform rejected the update: {0}")]
    PlatformRejected(#[source] PlatformError),
    #[error("state of message {message_id} kept changing under concurrent clicks")]
    Contention { message_id: MessageId },
    #[error(transparent)]
    Evaluation(#[from] EvalError),
    #[error("layout cannot be encoded: {0}")]
    Render(#[source] CodecError),
}

impl ResolveError {
    /// Text shown to the clicking user, if any.
    pub(super) fn user_message(&self) -> Option<String> {
        match self {
            ResolveError::NotMatching => None,
            ResolveError::MalformedIdentifier(_) => {
                Some("This button is no longer valid, please start a new one with the command.".to_string())
            }
            ResolveError::ConfigurationMissing { command_id, .. } => Some(format!(
                "Configuration for the message is missing, please create a new message with the command `/{}`",
                command_id
            )),
            ResolveError::StoreUnavailable(_) => Some("Storage is unavailable right now, please try again.".to_string()),
            ResolveError::PlatformRejected(_) => Some("The message could not be updated, please try again.".to_string()),
            ResolveError::Contention { .. } => Some("Too many clicks at once, please try again.".to_string()),
            ResolveError::Evaluation(err) => Some(format!("Could not roll: {}", err)),
            ResolveError::Render(_) => Some("This configuration does not fit into a message.".to_string()),
        }
    }

    /// Whether repeating the whole click may succeed.
    pub(super) fn is_retryable(&self) -> bool {
        matches!(self, ResolveError::StoreUnavailable(err) if err.is_transient())
    }
}

#[derive(Debug, Error)]
pub(super) enum RegistryError {
    #[error("command id '{0}' is registered twice")]
    Duplicate(String),
    #[error("command id '{0}' is empty or contains a reserved delimiter")]
    InvalidId(String),
}

pub(super) enum RenderInstruction {
    Unchanged,
    Edit(EncodedMessage),
}

pub(super) struct TerminalRender {
    pub(super) answer: Answer,
    pub(super) next_element: EncodedMessage,
}

/// Outcome of interpreting one click, before anything is sent.
pub(super) struct Resolution {
    pub(super) configuration: ConfigurationRow,
    pub(super) fingerprint: Fingerprint,
    pub(super) state_summary: String,
    pub(super) current: RenderInstruction,
    pub(super) terminal: Option<TerminalRender>,
    pub(super) stale: bool,
}

#[derive(Debug)]
pub(super) struct ClickOutcome {
    pub(super) command_id: &'static str,
    pub(super) state_summary: String,
    pub(super) answer: Option<Answer>,
    pub(super) new_message_id: Option<MessageId>,
    pub(super) cleanup: Option<CleanupHandle>,
    pub(super) stale: bool,
}

#[derive(Debug)]
pub(super) struct StartOutcome {
    pub(super) message_id: MessageId,
    pub(super) cleanup: Option<CleanupHandle>,
}

#[async_trait]
pub(super) trait ComponentHandler: Send + Sync {
    fn command_id(&self) -> &'static str;

    fn matches(&self, command_id: &str) -> bool {
        command_id == self.command_id()
    }

    /// Decodes `raw` if it belongs to this handler. Malformed identifiers
    /// belong to nobody.
    fn decode_or_reject(&self, raw: &str) -> Option<Identifier> {
        decode(raw)
            .ok()
            .filter(|identifier| self.matches(identifier.command_id()))
    }

    async fn handle(&self, event: &RawClickEvent, identifier: Identifier) -> std::result::Result<ClickOutcome, ResolveError>;
}

/// Routes clicks to the first registered handler whose id matches.
pub(super) struct Registry {
    handlers: Vec<Arc<dyn ComponentHandler>>,
}

impl Registry {
    pub(super) fn new(handlers: Vec<Arc<dyn ComponentHandler>>) -> std::result::Result<Self, RegistryError> {
        let mut seen = BTreeSet::new();
        for handler in &handlers {
            let id = handler.command_id();
            if id.is_empty() || id.contains(ID_DELIMITER) || id.contains(['\u{0}', ',']) {
                return Err(RegistryError::InvalidId(printable(id)));
            }
            if !seen.insert(id) {
                return Err(RegistryError::Duplicate(id.to_string()));
            }
        }
        Ok(Self { handlers })
    }

    pub(super) async fn dispatch(&self, event: &RawClickEvent) -> std::result::Result<ClickOutcome, ResolveError> {
        for handler in &self.handlers {
            if let Some(identifier) = handler.decode_or_reject(&event.identifier) {
                return handler.handle(event, identifier).await;
            }
        }
        match decode(&event.identifier) {
            Err(err) => Err(ResolveError::MalformedIdentifier(err.to_string())),
            Ok(_) => Err(ResolveError::NotMatching),
        }
    }
}

struct LoadedConfig<C: InteractiveCommand> {
    row: ConfigurationRow,
    config: C::Config,
    carried_state: Option<C::State>,
}

struct StateSnapshot<S> {
    state: Option<S>,
    /// Row version when the row was read; `None` inside means no row.
    version: Option<Option<i64>>,
}

pub(super) struct Resolver<C: InteractiveCommand> {
    command: C,
    services: Arc<CoreServices>,
}

impl<C: InteractiveCommand> Resolver<C> {
    pub(super) fn new(command: C, services: Arc<CoreServices>) -> Self {
        Self { command, services }
    }

    /// Renders a fresh element and supersedes older elements with the same
    /// configuration in the channel.
    pub(super) async fn start(
        &self,
        channel_id: ChannelId,
        guild_id: Option<i64>,
        config: C::Config,
    ) -> std::result::Result<StartOutcome, ResolveError> {
        let services = &self.services;
        let config_uuid = Uuid::new_v4();
        let row = self.configuration_row(config_uuid, guild_id, channel_id, &config)?;
        let fingerprint = fingerprint_of(&row);
        let layout = self.command.layout(&config, None);
        let encoded = encode_layout(
            self.command.command_id(),
            config_uuid,
            &config.compact(),
            None,
            &layout,
            &services.limits,
        )
        .map_err(ResolveError::Render)?;
        if encoded.by_reference {
            services
                .store
                .save_configuration(row.clone())
                .await
                .map_err(ResolveError::StoreUnavailable)?;
        }

        let message_id = services
            .platform
            .render(channel_id, &encoded)
            .await
            .map_err(ResolveError::PlatformRejected)?;
        if encoded.by_reference {
            if let Err(err) = services
                .store
                .save_state(InteractionStateRow::empty(&row, message_id))
                .await
            {
                warn!("saving state of {}.{} failed: {}", channel_id, message_id, err);
            }
        }
        services.cache.mark_live(channel_id, message_id, fingerprint).await;

        let candidates = services
            .cache
            .supersede(channel_id, message_id, fingerprint)
            .await;
        let cleanup = if candidates.is_empty() {
            None
        } else {
            let request = CleanupRequest {
                channel_id,
                keep_message_id: message_id,
                owner: config_uuid,
                fingerprint,
                candidates,
            };
            let delay = services.cleanup.policy().grace_delay;
            Some(services.cleanup.schedule(request, delay).await)
        };
        info!(
            "{}: started {} ({}) in {} as {}",
            self.command.command_id(),
            config_uuid,
            fingerprint,
            channel_id,
            message_id
        );
        Ok(StartOutcome { message_id, cleanup })
    }

    /// Interprets a click and persists any state change. Nothing is sent to
    /// the platform here.
    pub(super) async fn resolve(
        &self,
        event: &RawClickEvent,
        identifier: Identifier,
    ) -> std::result::Result<Resolution, ResolveError> {
        let services = &self.services;
        let loaded = self.load_configuration(event, &identifier).await?;
        let fingerprint = fingerprint_of(&loaded.row);
        let stale = !services
            .cache
            .is_live(event.channel_id, event.message_id, fingerprint)
            .await;
        let click = ClickContext { user_id: event.user_id };
        let config_compact = loaded.config.compact();

        for _ in 0..MAX_STATE_ATTEMPTS {
            let snapshot = self.load_state(event, &loaded).await?;
            let summary = snapshot
                .state
                .as_ref()
                .map(|state| state.compact())
                .unwrap_or_default();
            let unchanged = |summary: String| Resolution {
                configuration: loaded.row.clone(),
                fingerprint,
                state_summary: summary,
                current: RenderInstruction::Unchanged,
                terminal: None,
                stale,
            };

            if let Some(owner) = snapshot.state.as_ref().and_then(|state| state.started_by()) {
                if owner != event.user_id {
                    debug!(
                        "{}.{}: ignoring click of {} on selection started by {}",
                        event.channel_id, event.message_id, event.user_id, owner
                    );
                    return Ok(unchanged(summary));
                }
            }

            match self
                .command
                .apply(&loaded.config, snapshot.state.as_ref(), identifier.action(), &click)
            {
                Step::Ignore => return Ok(unchanged(summary)),
                Step::Continue(next) => {
                    let layout = self.command.layout(&loaded.config, Some(&next));
                    let inline_state = (!self.command.state_in_content()).then(|| next.compact());
                    let encoded = encode_layout(
                        self.command.command_id(),
                        loaded.row.config_uuid,
                        &config_compact,
                        inline_state.as_deref(),
                        &layout,
                        &services.limits,
                    )
                    .map_err(ResolveError::Render)?;
                    if encoded.by_reference && !self.persist_state(event, &loaded, &next, snapshot.version).await? {
                        debug!(
                            "{}.{}: state changed concurrently, retrying",
                            event.channel_id, event.message_id
                        );
                        continue;
                    }
                    return Ok(Resolution {
                        configuration: loaded.row.clone(),
                        fingerprint,
                        state_summary: next.compact(),
                        current: RenderInstruction::Edit(encoded),
                        terminal: None,
                        stale,
                    });
                }
                Step::Finish(done) => {
                    let answer = self
                        .command
                        .answer(&loaded.config, &done, services.evaluator.as_ref())?;
                    let initial = self.encode_initial(&loaded)?;
                    if initial.by_reference {
                        services
                            .store
                            .save_configuration(loaded.row.clone())
                            .await
                            .map_err(ResolveError::StoreUnavailable)?;
                    }
                    let current = if event.pinned {
                        if initial.by_reference {
                            services
                                .store
                                .save_state(InteractionStateRow::empty(&loaded.row, event.message_id))
                                .await
                                .map_err(ResolveError::StoreUnavailable)?;
                        }
                        RenderInstruction::Edit(initial.clone())
                    } else {
                        RenderInstruction::Edit(EncodedMessage::text(PROCESSING, &services.limits))
                    };
                    return Ok(Resolution {
                        configuration: loaded.row.clone(),
                        fingerprint,
                        state_summary: done.compact(),
                        current,
                        terminal: Some(TerminalRender {
                            answer,
                            next_element: initial,
                        }),
                        stale,
                    });
                }
            }
        }
        Err(ResolveError::Contention {
            message_id: event.message_id,
        })
    }

    /// Applies a resolution: edits the clicked element, and for terminal
    /// clicks posts the answer, renders the next element and schedules
    /// cleanup of the superseded ones.
    pub(super) async fn complete(
        &self,
        event: &RawClickEvent,
        resolution: Resolution,
    ) -> std::result::Result<ClickOutcome, ResolveError> {
        let services = &self.services;
        let channel_id = event.channel_id;
        if let RenderInstruction::Edit(message) = &resolution.current {
            if let Err(err) = services.platform.edit(channel_id, event.message_id, message).await {
                if resolution.terminal.is_none() {
                    return Err(ResolveError::PlatformRejected(err));
                }
                warn!("editing {}.{} failed: {}", channel_id, event.message_id, err);
            }
        }

        let Some(terminal) = resolution.terminal else {
            return Ok(ClickOutcome {
                command_id: self.command.command_id(),
                state_summary: resolution.state_summary,
                answer: None,
                new_message_id: None,
                cleanup: None,
                stale: resolution.stale,
            });
        };

        let answer_text = terminal.answer.render(&event.user_name);
        services
            .platform
            .render(channel_id, &EncodedMessage::text(&answer_text, &services.limits))
            .await
            .map_err(ResolveError::PlatformRejected)?;
        let new_message_id = services
            .platform
            .render(channel_id, &terminal.next_element)
            .await
            .map_err(ResolveError::PlatformRejected)?;
        if terminal.next_element.by_reference {
            if let Err(err) = services
                .store
                .save_state(InteractionStateRow::empty(&resolution.configuration, new_message_id))
                .await
            {
                warn!("saving state of {}.{} failed: {}", channel_id, new_message_id, err);
            }
        }

        let fingerprint = resolution.fingerprint;
        services.cache.mark_live(channel_id, new_message_id, fingerprint).await;
        let mut candidates = services
            .cache
            .supersede(channel_id, new_message_id, fingerprint)
            .await;
        if event.pinned {
            candidates.retain(|id| *id != event.message_id);
            services
                .cache
                .mark_live(channel_id, event.message_id, fingerprint)
                .await;
        } else if !candidates.contains(&event.message_id) {
            candidates.push(event.message_id);
        }

        let request = CleanupRequest {
            channel_id,
            keep_message_id: new_message_id,
            owner: resolution.configuration.config_uuid,
            fingerprint,
            candidates,
        };
        let delay = services.cleanup.policy().grace_delay;
        let cleanup = services.cleanup.schedule(request, delay).await;

        Ok(ClickOutcome {
            command_id: self.command.command_id(),
            state_summary: resolution.state_summary,
            answer: Some(terminal.answer),
            new_message_id: Some(new_message_id),
            cleanup: Some(cleanup),
            stale: resolution.stale,
        })
    }

    async fn load_configuration(
        &self,
        event: &RawClickEvent,
        identifier: &Identifier,
    ) -> std::result::Result<LoadedConfig<C>, ResolveError> {
        let malformed = || ResolveError::MalformedIdentifier(format!("malformed identifier '{}'", printable(&event.identifier)));
        match identifier {
            Identifier::Inline { config, state, .. } => {
                let config = C::Config::from_compact(config).ok_or_else(malformed)?;
                let carried_state = match state {
                    Some(raw) => Some(C::State::from_compact(raw).ok_or_else(malformed)?),
                    None => None,
                };
                let row = self.derived_configuration_row(event, &config)?;
                Ok(LoadedConfig {
                    row,
                    config,
                    carried_state,
                })
            }
            Identifier::Ref { config_uuid, .. } => {
                let missing = || ResolveError::ConfigurationMissing {
                    command_id: self.command.command_id().to_string(),
                    config_uuid: *config_uuid,
                };
                let stored = self
                    .services
                    .store
                    .get_configuration(*config_uuid)
                    .await
                    .map_err(ResolveError::StoreUnavailable)?
                    .ok_or_else(missing)?;
                if stored.command_id != self.command.command_id() {
                    warn!(
                        "configuration {} belongs to '{}', not '{}'",
                        config_uuid,
                        stored.command_id,
                        self.command.command_id()
                    );
                    return Err(missing());
                }
                let config: C::Config = match decode_payload(&stored.type_tag, &stored.serialized_config) {
                    Ok(config) => config,
                    Err(err) => {
                        error!("configuration {} is unreadable: {}", config_uuid, err);
                        return Err(missing());
                    }
                };
                let row = self.configuration_row(*config_uuid, stored.guild_id, stored.channel_id, &config)?;
                Ok(LoadedConfig {
                    row,
                    config,
                    carried_state: None,
                })
            }
            Identifier::Legacy { fields, .. } => {
                let (config, carried_state) = self.command.from_legacy(fields).ok_or_else(malformed)?;
                let row = self.derived_configuration_row(event, &config)?;
                self.services
                    .store
                    .save_configuration(row.clone())
                    .await
                    .map_err(ResolveError::StoreUnavailable)?;
                debug!(
                    "{}.{}: legacy identifier migrated to {}",
                    event.channel_id, event.message_id, row.config_uuid
                );
                Ok(LoadedConfig {
                    row,
                    config,
                    carried_state,
                })
            }
        }
    }

    async fn load_state(
        &self,
        event: &RawClickEvent,
        loaded: &LoadedConfig<C>,
    ) -> std::result::Result<StateSnapshot<C::State>, ResolveError> {
        if let Some(state) = loaded.carried_state.clone() {
            return Ok(StateSnapshot {
                state: Some(state),
                version: None,
            });
        }

        let row = self
            .services
            .store
            .get_state(event.channel_id, event.message_id)
            .await
            .map_err(ResolveError::StoreUnavailable)?;
        let version = Some(row.as_ref().map(|row| row.version));
        if let Some(row) = row.filter(|row| row.config_uuid == loaded.row.config_uuid) {
            match row.decode_state::<C::State>() {
                Ok(Some(state)) => {
                    return Ok(StateSnapshot {
                        state: Some(state),
                        version,
                    })
                }
                Ok(None) => {}
                Err(err) => warn!(
                    "state of {}.{} is unreadable, starting over: {}",
                    event.channel_id, event.message_id, err
                ),
            }
        }

        let state = if self.command.state_in_content() {
            self.command.state_from_content(&loaded.config, &event.content)
        } else {
            None
        };
        Ok(StateSnapshot { state, version })
    }

    /// Writes the state row of a by-reference element. Returns false when
    /// another click changed the row first.
    async fn persist_state(
        &self,
        event: &RawClickEvent,
        loaded: &LoadedConfig<C>,
        next: &C::State,
        version: Option<Option<i64>>,
    ) -> std::result::Result<bool, ResolveError> {
        let store = &self.services.store;
        store
            .save_configuration(loaded.row.clone())
            .await
            .map_err(ResolveError::StoreUnavailable)?;
        let persisted = (!self.command.state_in_content()).then_some(next);
        let row = InteractionStateRow::empty(&loaded.row, event.message_id)
            .with_state(persisted)
            .map_err(ResolveError::StoreUnavailable)?;
        let expected = match version {
            Some(expected) => expected,
            None => store
                .get_state(event.channel_id, event.message_id)
                .await
                .map_err(ResolveError::StoreUnavailable)?
                .map(|row| row.version),
        };
        store
            .compare_and_save_state(row, expected)
            .await
            .map_err(ResolveError::StoreUnavailable)
    }

    fn encode_initial(&self, loaded: &LoadedConfig<C>) -> std::result::Result<EncodedMessage, ResolveError> {
        let layout = self.command.layout(&loaded.config, None);
        encode_layout(
            self.command.command_id(),
            loaded.row.config_uuid,
            &loaded.config.compact(),
            None,
            &layout,
            &self.services.limits,
        )
        .map_err(ResolveError::Render)
    }

    fn configuration_row(
        &self,
        config_uuid: Uuid,
        guild_id: Option<i64>,
        channel_id: ChannelId,
        config: &C::Config,
    ) -> std::result::Result<ConfigurationRow, ResolveError> {
        Ok(ConfigurationRow {
            config_uuid,
            guild_id,
            channel_id,
            command_id: self.command.command_id().to_string(),
            type_tag: <C::Config as Persisted>::TYPE_TAG.to_string(),
            serialized_config: encode_payload(config).map_err(ResolveError::StoreUnavailable)?,
        })
    }

    /// Elements whose identifiers carry no uuid get one derived from the
    /// channel and configuration, so repeated clicks share an owner.
    fn derived_configuration_row(
        &self,
        event: &RawClickEvent,
        config: &C::Config,
    ) -> std::result::Result<ConfigurationRow, ResolveError> {
        let mut row = self.configuration_row(Uuid::nil(), event.guild_id, event.channel_id, config)?;
        row.config_uuid = derived_config_uuid(event.channel_id, fingerprint_of(&row));
        Ok(row)
    }
}

#[async_trait]
impl<C: InteractiveCommand> ComponentHandler for Resolver<C> {
    fn command_id(&self) -> &'static str {
        self.command.command_id()
    }

    async fn handle(&self, event: &RawClickEvent, identifier: Identifier) -> std::result::Result<ClickOutcome, ResolveError> {
        let started = Instant::now();
        let resolution = self.resolve(event, identifier).await?;
        let outcome = self.complete(event, resolution).await?;
        info!(
            "{}.{}: {} '{}' [{}] -> {}{} in {}ms",
            event.channel_id,
            event.message_id,
            outcome.command_id,
            printable(&event.identifier),
            outcome.state_summary,
            outcome
                .answer
                .as_ref()
                .map(|answer| answer.result.as_str())
                .unwrap_or("-"),
            if outcome.stale { " (stale)" } else { "" },
            started.elapsed().as_millis()
        );
        Ok(outcome)
    }
}

pub(super) fn fingerprint_of(row: &ConfigurationRow) -> Fingerprint {
    Fingerprint::of(&row.command_id, &row.type_tag, &row.serialized_config)
}

pub(super) fn derived_config_uuid(channel_id: ChannelId, fingerprint: Fingerprint) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes[..8].copy_from_slice(&channel_id.to_be_bytes());
    bytes[8..].copy_from_slice(&fingerprint.0.to_be_bytes());
    uuid::Builder::from_random_bytes(bytes).into_uuid()
}
