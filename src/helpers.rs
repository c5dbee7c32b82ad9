use super::*;

pub(super) fn load_config(path: &Path) -> Result<Config> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    let config_file: ConfigFile = toml::from_str(&contents).context("parse config")?;
    let config_dir = path.parent().unwrap_or_else(|| Path::new("."));
    config_from_file(config_file, config_dir)
}

pub(super) fn config_from_file(config_file: ConfigFile, config_dir: &Path) -> Result<Config> {
    if config_file.token.trim().is_empty() {
        bail!("token must not be empty");
    }

    let limits_file = config_file.limits.unwrap_or_default();
    let limits = FrameLimits {
        identifier_max_bytes: limits_file
            .identifier_max_bytes
            .unwrap_or(DEFAULT_IDENTIFIER_MAX_BYTES),
        max_buttons: limits_file.max_buttons.unwrap_or(DEFAULT_MAX_BUTTONS),
        max_content_chars: limits_file
            .max_content_chars
            .unwrap_or(DEFAULT_MAX_CONTENT_CHARS),
    };
    // A by-reference identifier needs the command id, the action and a
    // 32 character uuid, so anything below this cannot encode at all.
    if limits.identifier_max_bytes < 48 {
        bail!(
            "limits.identifier_max_bytes must be at least 48, got {}",
            limits.identifier_max_bytes
        );
    }
    if limits.max_buttons == 0 || limits.max_content_chars == 0 {
        bail!("limits.max_buttons and limits.max_content_chars must be positive");
    }

    let cleanup_file = config_file.cleanup.unwrap_or_default();
    let grace_delay_ms = cleanup_file.grace_delay_ms.unwrap_or(DEFAULT_GRACE_DELAY_MS);
    if grace_delay_ms == 0 {
        bail!("cleanup.grace_delay_ms must be positive");
    }
    let stale_state_ttl_secs = cleanup_file
        .stale_state_ttl_secs
        .unwrap_or(DEFAULT_STALE_STATE_TTL_SECS);
    let janitor_interval_secs = cleanup_file
        .janitor_interval_secs
        .unwrap_or(DEFAULT_JANITOR_INTERVAL_SECS);
    if janitor_interval_secs == 0 {
        bail!("cleanup.janitor_interval_secs must be positive");
    }

    let store_retry_attempts = config_file
        .store_retry_attempts
        .unwrap_or(DEFAULT_STORE_RETRY_ATTEMPTS);
    if store_retry_attempts == 0 {
        bail!("store_retry_attempts must be at least 1");
    }

    let database_path = if config_file.database_path.is_relative() {
        config_dir.join(&config_file.database_path)
    } else {
        config_file.database_path
    };

    Ok(Config {
        token: config_file.token,
        database_path,
        limits,
        cleanup: CleanupPolicy {
            grace_delay: Duration::from_millis(grace_delay_ms),
            coalesce_window: Duration::from_millis(
                cleanup_file
                    .coalesce_window_ms
                    .unwrap_or(DEFAULT_COALESCE_WINDOW_MS),
            ),
            stale_ttl: Duration::from_secs(stale_state_ttl_secs),
        },
        janitor_interval: Duration::from_secs(janitor_interval_secs),
        store_retry_attempts,
    })
}

/// Dispatches a click, repeating it while the store reports a transient
/// failure.
pub(super) async fn dispatch_with_retries(
    registry: &Registry,
    event: &RawClickEvent,
    attempts: u32,
) -> std::result::Result<ClickOutcome, ResolveError> {
    let mut attempt = 1;
    loop {
        match registry.dispatch(event).await {
            Err(err) if err.is_retryable() && attempt < attempts => {
                warn!(
                    "{}.{}: attempt {} failed, retrying: {}",
                    event.channel_id, event.message_id, attempt, err
                );
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            result => return result,
        }
    }
}

pub(super) fn start_janitor_loop(cleanup: Arc<CleanupCoordinator>, interval: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(interval);
        loop {
            interval.tick().await;
            if let Err(err) = cleanup.prune_stale_states().await {
                error!("stale state pruning failed: {:#}", err);
            }
        }
    });
}

pub(super) fn parse_command(text: &str) -> Option<&str> {
    let first = text.split_whitespace().next()?;
    if !first.starts_with('/') {
        return None;
    }
    let cmd = first.trim_start_matches('/');
    Some(cmd.split('@').next().unwrap_or(cmd))
}

pub(super) fn command_args(text: &str) -> Vec<&str> {
    text.split_whitespace().skip(1).collect()
}
