use super::*;

use rusqlite::{params, Connection, OptionalExtension, Row};

/// SQLite-backed store. Opens a connection per operation so the store can
/// be shared across tasks without holding a lock over awaits.
#[derive(Debug)]
pub(super) struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    pub(super) fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let store = Self { db_path };
        let connection = store.open_connection()?;
        store.initialize_schema(&connection)?;
        Ok(store)
    }

    fn open_connection(&self) -> StoreResult<Connection> {
        let connection = Connection::open(&self.db_path)?;
        connection.busy_timeout(Duration::from_secs(5))?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            "#,
        )?;
        Ok(connection)
    }

    fn initialize_schema(&self, connection: &Connection) -> StoreResult<()> {
        connection.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS message_config (
                config_id TEXT PRIMARY KEY,
                guild_id INTEGER NULL,
                channel_id INTEGER NOT NULL,
                command_id TEXT NOT NULL,
                config_class_id TEXT NOT NULL,
                config TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_message_config_channel ON message_config (channel_id);

            CREATE TABLE IF NOT EXISTS message_data (
                config_id TEXT NOT NULL,
                guild_id INTEGER NULL,
                channel_id INTEGER NOT NULL,
                message_id INTEGER NOT NULL,
                command_id TEXT NOT NULL,
                state_class_id TEXT NOT NULL,
                state TEXT NULL,
                version INTEGER NOT NULL,
                creation_date TEXT NOT NULL,
                marked_stale TEXT NULL,
                PRIMARY KEY (channel_id, message_id)
            );

            CREATE INDEX IF NOT EXISTS idx_message_data_config ON message_data (config_id);
            CREATE INDEX IF NOT EXISTS idx_message_data_stale ON message_data (marked_stale);
            "#,
        )?;
        Ok(())
    }
}

fn format_time(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_time(raw: &str) -> StoreResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

struct RawStateRow {
    config_id: String,
    guild_id: Option<i64>,
    channel_id: i64,
    message_id: i64,
    command_id: String,
    state_class_id: String,
    state: Option<String>,
    version: i64,
    creation_date: String,
    marked_stale: Option<String>,
}

const STATE_COLUMNS: &str = "config_id, guild_id, channel_id, message_id, command_id, \
     state_class_id, state, version, creation_date, marked_stale";

fn raw_state_row(row: &Row<'_>) -> rusqlite::Result<RawStateRow> {
    Ok(RawStateRow {
        config_id: row.get(0)?,
        guild_id: row.get(1)?,
        channel_id: row.get(2)?,
        message_id: row.get(3)?,
        command_id: row.get(4)?,
        state_class_id: row.get(5)?,
        state: row.get(6)?,
        version: row.get(7)?,
        creation_date: row.get(8)?,
        marked_stale: row.get(9)?,
    })
}

impl RawStateRow {
    fn into_row(self) -> StoreResult<InteractionStateRow> {
        Ok(InteractionStateRow {
            config_uuid: Uuid::parse_str(&self.config_id)?,
            guild_id: self.guild_id,
            channel_id: self.channel_id,
            message_id: self.message_id,
            command_id: self.command_id,
            type_tag: self.state_class_id,
            serialized_state: self.state,
            version: self.version,
            created_at: parse_time(&self.creation_date)?,
            stale_since: self.marked_stale.as_deref().map(parse_time).transpose()?,
        })
    }
}

#[async_trait]
impl ConfigStateStore for SqliteStore {
    async fn save_configuration(&self, row: ConfigurationRow) -> StoreResult<()> {
        let connection = self.open_connection()?;
        connection.execute(
            r#"
            INSERT INTO message_config (config_id, guild_id, channel_id, command_id, config_class_id, config)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(config_id) DO NOTHING
            "#,
            params![
                row.config_uuid.to_string(),
                row.guild_id,
                row.channel_id,
                row.command_id,
                row.type_tag,
                row.serialized_config,
            ],
        )?;
        Ok(())
    }

    async fn get_configuration(&self, config_uuid: Uuid) -> StoreResult<Option<ConfigurationRow>> {
        let connection = self.open_connection()?;
        let raw = connection
            .query_row(
                r#"
                SELECT guild_id, channel_id, command_id, config_class_id, config
                FROM message_config
                WHERE config_id = ?1
                "#,
                params![config_uuid.to_string()],
                |row| {
                    Ok(ConfigurationRow {
                        config_uuid,
                        guild_id: row.get(0)?,
                        channel_id: row.get(1)?,
                        command_id: row.get(2)?,
                        type_tag: row.get(3)?,
                        serialized_config: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(raw)
    }

    async fn delete_configuration(&self, config_uuid: Uuid) -> StoreResult<()> {
        let connection = self.open_connection()?;
        connection.execute(
            "DELETE FROM message_config WHERE config_id = ?1",
            params![config_uuid.to_string()],
        )?;
        Ok(())
    }

    async fn delete_configurations_for_channel(&self, channel_id: ChannelId) -> StoreResult<usize> {
        let connection = self.open_connection()?;
        let removed = connection.execute(
            "DELETE FROM message_config WHERE channel_id = ?1",
            params![channel_id],
        )?;
        Ok(removed)
    }

    async fn save_state(&self, row: InteractionStateRow) -> StoreResult<()> {
        let connection = self.open_connection()?;
        connection.execute(
            r#"
            INSERT INTO message_data (
                config_id, guild_id, channel_id, message_id, command_id,
                state_class_id, state, version, creation_date, marked_stale
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, NULL)
            ON CONFLICT(channel_id, message_id) DO UPDATE SET
                config_id = excluded.config_id,
                guild_id = excluded.guild_id,
                command_id = excluded.command_id,
                state_class_id = excluded.state_class_id,
                state = excluded.state,
                version = message_data.version + 1,
                marked_stale = NULL
            "#,
            params![
                row.config_uuid.to_string(),
                row.guild_id,
                row.channel_id,
                row.message_id,
                row.command_id,
                row.type_tag,
                row.serialized_state,
                format_time(row.created_at),
            ],
        )?;
        Ok(())
    }

    async fn compare_and_save_state(
        &self,
        row: InteractionStateRow,
        expected_version: Option<i64>,
    ) -> StoreResult<bool> {
        let connection = self.open_connection()?;
        let changed = match expected_version {
            None => connection.execute(
                r#"
                INSERT INTO message_data (
                    config_id, guild_id, channel_id, message_id, command_id,
                    state_class_id, state, version, creation_date, marked_stale
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, NULL)
                ON CONFLICT(channel_id, message_id) DO NOTHING
                "#,
                params![
                    row.config_uuid.to_string(),
                    row.guild_id,
                    row.channel_id,
                    row.message_id,
                    row.command_id,
                    row.type_tag,
                    row.serialized_state,
                    format_time(row.created_at),
                ],
            )?,
            Some(expected) => connection.execute(
                r#"
                UPDATE message_data
                SET config_id = ?1,
                    command_id = ?2,
                    state_class_id = ?3,
                    state = ?4,
                    version = version + 1,
                    marked_stale = NULL
                WHERE channel_id = ?5 AND message_id = ?6 AND version = ?7
                "#,
                params![
                    row.config_uuid.to_string(),
                    row.command_id,
                    row.type_tag,
                    row.serialized_state,
                    row.channel_id,
                    row.message_id,
                    expected,
                ],
            )?,
        };
        Ok(changed == 1)
    }

    async fn get_state(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> StoreResult<Option<InteractionStateRow>> {
        let connection = self.open_connection()?;
        let raw = connection
            .query_row(
                &format!(
                    "SELECT {STATE_COLUMNS} FROM message_data WHERE channel_id = ?1 AND message_id = ?2"
                ),
                params![channel_id, message_id],
                raw_state_row,
            )
            .optional()?;
        raw.map(RawStateRow::into_row).transpose()
    }

    async fn delete_state(&self, channel_id: ChannelId, message_id: MessageId) -> StoreResult<()> {
        let connection = self.open_connection()?;
        connection.execute(
            "DELETE FROM message_data WHERE channel_id = ?1 AND message_id = ?2",
            params![channel_id, message_id],
        )?;
        Ok(())
    }

    async fn delete_all_state_for_channel(&self, channel_id: ChannelId) -> StoreResult<BTreeSet<MessageId>> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction()?;
        let removed = {
            let mut statement =
                transaction.prepare("SELECT message_id FROM message_data WHERE channel_id = ?1")?;
            let ids = statement
                .query_map(params![channel_id], |row| row.get::<_, i64>(0))?
                .collect::<rusqlite::Result<BTreeSet<_>>>()?;
            ids
        };
        transaction.execute(
            "DELETE FROM message_data WHERE channel_id = ?1",
            params![channel_id],
        )?;
        transaction.commit()?;
        Ok(removed)
    }

    async fn list_message_ids_for_configuration(&self, config_uuid: Uuid) -> StoreResult<BTreeSet<MessageId>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare("SELECT message_id FROM message_data WHERE config_id = ?1")?;
        let ids = statement
            .query_map(params![config_uuid.to_string()], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<BTreeSet<_>>>()?;
        Ok(ids)
    }

    async fn mark_state_stale(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let connection = self.open_connection()?;
        connection.execute(
            r#"
            UPDATE message_data
            SET marked_stale = ?3
            WHERE channel_id = ?1 AND message_id = ?2 AND marked_stale IS NULL
            "#,
            params![channel_id, message_id, format_time(at)],
        )?;
        Ok(())
    }

    async fn delete_stale_states(&self, marked_before: DateTime<Utc>) -> StoreResult<Vec<Uuid>> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction()?;
        let cutoff = format_time(marked_before);
        let removed = {
            let mut statement = transaction.prepare(
                "SELECT config_id FROM message_data WHERE marked_stale IS NOT NULL AND marked_stale < ?1",
            )?;
            let ids = statement
                .query_map(params![cutoff], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            ids
        };
        transaction.execute(
            "DELETE FROM message_data WHERE marked_stale IS NOT NULL AND marked_stale < ?1",
            params![cutoff],
        )?;
        transaction.commit()?;
        removed
            .iter()
            .map(|raw| Uuid::parse_str(raw).map_err(StoreError::from))
            .collect()
    }
}
