use super::*;

/// Type tag written for rows that carry no state payload.
pub(super) const NO_STATE_TAG: &str = "None";

pub(super) type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub(super) enum StoreError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Chrono(#[from] chrono::ParseError),
    #[error(transparent)]
    Uuid(#[from] uuid::Error),
    #[error("unknown type tag '{tag}', expected {expected}")]
    UnknownTypeTag { tag: String, expected: &'static str },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether retrying the same call may succeed.
    pub(super) fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Sqlite(_) | StoreError::Io(_) | StoreError::Unavailable(_)
        )
    }
}

/// A payload persisted with a type tag. Older tags stay readable so rows
/// written by earlier schema versions keep resolving.
pub(super) trait Persisted: Serialize + DeserializeOwned {
    const TYPE_TAG: &'static str;
    const PRIOR_TYPE_TAGS: &'static [&'static str] = &[];

    fn accepts_tag(tag: &str) -> bool {
        tag == Self::TYPE_TAG || Self::PRIOR_TYPE_TAGS.contains(&tag)
    }
}

pub(super) fn encode_payload<T: Persisted>(value: &T) -> StoreResult<String> {
    Ok(serde_json::to_string(value)?)
}

pub(super) fn decode_payload<T: Persisted>(tag: &str, raw: &str) -> StoreResult<T> {
    if !T::accepts_tag(tag) {
        return Err(StoreError::UnknownTypeTag {
            tag: tag.to_string(),
            expected: T::TYPE_TAG,
        });
    }
    Ok(serde_json::from_str(raw)?)
}

/// Immutable configuration of one command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct ConfigurationRow {
    pub(super) config_uuid: Uuid,
    pub(super) guild_id: Option<i64>,
    pub(super) channel_id: ChannelId,
    pub(super) command_id: String,
    pub(super) type_tag: String,
    pub(super) serialized_config: String,
}

/// Mutable state of one rendered element, keyed by (channel, message).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct InteractionStateRow {
    pub(super) config_uuid: Uuid,
    pub(super) guild_id: Option<i64>,
    pub(super) channel_id: ChannelId,
    pub(super) message_id: MessageId,
    pub(super) command_id: String,
    pub(super) type_tag: String,
    pub(super) serialized_state: Option<String>,
    pub(super) version: i64,
    pub(super) created_at: DateTime<Utc>,
    pub(super) stale_since: Option<DateTime<Utc>>,
}

impl InteractionStateRow {
    pub(super) fn empty(config: &ConfigurationRow, message_id: MessageId) -> Self {
        Self {
            config_uuid: config.config_uuid,
            guild_id: config.guild_id,
            channel_id: config.channel_id,
            message_id,
            command_id: config.command_id.clone(),
            type_tag: NO_STATE_TAG.to_string(),
            serialized_state: None,
            version: 0,
            created_at: Utc::now(),
            stale_since: None,
        }
    }

    pub(super) fn with_state<S: Persisted>(mut self, state: Option<&S>) -> StoreResult<Self> {
        match state {
            Some(state) => {
                self.type_tag = S::TYPE_TAG.to_string();
                self.serialized_state = Some(encode_payload(state)?);
            }
            None => {
                self.type_tag = NO_STATE_TAG.to_string();
                self.serialized_state = None;
            }
        }
        Ok(self)
    }

    pub(super) fn decode_state<S: Persisted>(&self) -> StoreResult<Option<S>> {
        match self.serialized_state.as_deref() {
            Some(raw) if self.type_tag != NO_STATE_TAG => decode_payload(&self.type_tag, raw).map(Some),
            _ => Ok(None),
        }
    }
}

/// Durable home of configurations and element states.
#[async_trait]
pub(super) trait ConfigStateStore: Send + Sync {
    /// Inserts the configuration unless one with the same uuid exists.
    async fn save_configuration(&self, row: ConfigurationRow) -> StoreResult<()>;
    async fn get_configuration(&self, config_uuid: Uuid) -> StoreResult<Option<ConfigurationRow>>;
    async fn delete_configuration(&self, config_uuid: Uuid) -> StoreResult<()>;
    async fn delete_configurations_for_channel(&self, channel_id: ChannelId) -> StoreResult<usize>;

    /// Upserts the state row, bumping its version and clearing a stale mark.
    async fn save_state(&self, row: InteractionStateRow) -> StoreResult<()>;
    /// Writes only when the stored version still equals `expected_version`;
    /// `None` means the row must not exist yet. Returns whether it wrote.
    async fn compare_and_save_state(
        &self,
        row: InteractionStateRow,
        expected_version: Option<i64>,
    ) -> StoreResult<bool>;
    async fn get_state(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> StoreResult<Option<InteractionStateRow>>;
    async fn delete_state(&self, channel_id: ChannelId, message_id: MessageId) -> StoreResult<()>;
    async fn delete_all_state_for_channel(&self, channel_id: ChannelId) -> StoreResult<BTreeSet<MessageId>>;
    async fn list_message_ids_for_configuration(&self, config_uuid: Uuid) -> StoreResult<BTreeSet<MessageId>>;

    async fn mark_state_stale(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;
    /// Removes rows marked stale before `marked_before`. Returns the
    /// configuration uuid of every removed row.
    async fn delete_stale_states(&self, marked_before: DateTime<Utc>) -> StoreResult<Vec<Uuid>>;
}

#[derive(Default)]
struct StoreInner {
    configurations: HashMap<Uuid, ConfigurationRow>,
    states: HashMap<(ChannelId, MessageId), InteractionStateRow>,
}

#[derive(Default)]
pub(super) struct InMemoryStore {
    inner: RwLock<StoreInner>,
}

impl InMemoryStore {
    pub(super) fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigStateStore for InMemoryStore {
    async fn save_configuration(&self, row: ConfigurationRow) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.configurations.entry(row.config_uuid).or_insert(row);
        Ok(())
    }

    async fn get_configuration(&self, config_uuid: Uuid) -> StoreResult<Option<ConfigurationRow>> {
        let inner = self.inner.read().await;
        Ok(inner.configurations.get(&config_uuid).cloned())
    }

    async fn delete_configuration(&self, config_uuid: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.configurations.remove(&config_uuid);
        Ok(())
    }

    async fn delete_configurations_for_channel(&self, channel_id: ChannelId) -> StoreResult<usize> {
        let mut inner = self.inner.write().await;
        let before = inner.configurations.len();
        inner
            .configurations
            .retain(|_, row| row.channel_id != channel_id);
        Ok(before - inner.configurations.len())
    }

    async fn save_state(&self, mut row: InteractionStateRow) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let key = (row.channel_id, row.message_id);
        match inner.states.get(&key) {
            Some(existing) => {
                row.version = existing.version + 1;
                row.created_at = existing.created_at;
            }
            None => row.version = 1,
        }
        row.stale_since = None;
        inner.states.insert(key, row);
        Ok(())
    }

    async fn compare_and_save_state(
        &self,
        mut row: InteractionStateRow,
        expected_version: Option<i64>,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        let key = (row.channel_id, row.message_id);
        let current = inner.states.get(&key);
        match (current, expected_version) {
            (None, None) => row.version = 1,
            (Some(existing), Some(expected)) if existing.version == expected => {
                row.version = expected + 1;
                row.created_at = existing.created_at;
            }
            _ => return Ok(false),
        }
        row.stale_since = None;
        inner.states.insert(key, row);
        Ok(true)
    }

    async fn get_state(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> StoreResult<Option<InteractionStateRow>> {
        let inner = self.inner.read().await;
        Ok(inner.states.get(&(channel_id, message_id)).cloned())
    }

    async fn delete_state(&self, channel_id: ChannelId, message_id: MessageId) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.states.remove(&(channel_id, message_id));
        Ok(())
    }

    async fn delete_all_state_for_channel(&self, channel_id: ChannelId) -> StoreResult<BTreeSet<MessageId>> {
        let mut inner = self.inner.write().await;
        let removed: BTreeSet<MessageId> = inner
            .states
            .keys()
            .filter(|(channel, _)| *channel == channel_id)
            .map(|(_, message)| *message)
            .collect();
        inner.states.retain(|(channel, _), _| *channel != channel_id);
        Ok(removed)
    }

    async fn list_message_ids_for_configuration(&self, config_uuid: Uuid) -> StoreResult<BTreeSet<MessageId>> {
        let inner = self.inner.read().await;
        Ok(inner
            .states
            .values()
            .filter(|row| row.config_uuid == config_uuid)
            .map(|row| row.message_id)
            .collect())
    }

    async fn mark_state_stale(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(row) = inner.states.get_mut(&(channel_id, message_id)) {
            row.stale_since.get_or_insert(at);
        }
        Ok(())
    }

    async fn delete_stale_states(&self, marked_before: DateTime<Utc>) -> StoreResult<Vec<Uuid>> {
        let mut inner = self.inner.write().await;
        let mut removed = Vec::new();
        inner.states.retain(|_, row| {
            let expired = matches!(row.stale_since, Some(at) if at < marked_before);
            if expired {
                removed.push(row.config_uuid);
            }
            !expired
        });
        Ok(removed)
    }
}
