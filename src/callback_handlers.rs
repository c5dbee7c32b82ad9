use super::*;

use teloxide::payloads::setters::*;
use teloxide::requests::Requester;

pub(super) async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    state: std::sync::Arc<AppState>,
) -> Result<()> {
    let Some(event) = click_event(&q, &state).await else {
        bot.answer_callback_query(q.id).await?;
        return Ok(());
    };

    match dispatch_with_retries(&state.registry, &event, state.config.store_retry_attempts).await {
        Ok(_) => {
            bot.answer_callback_query(q.id).await?;
        }
        Err(ResolveError::NotMatching) => {
            debug!("{}.{}: no handler for callback", event.channel_id, event.message_id);
            bot.answer_callback_query(q.id).await?;
        }
        Err(err) => {
            warn!("{}.{}: click failed: {}", event.channel_id, event.message_id, err);
            let request = bot.answer_callback_query(q.id);
            match err.user_message() {
                Some(text) => request.text(text).show_alert(true).await?,
                None => request.await?,
            };
        }
    }

    Ok(())
}

async fn click_event(q: &CallbackQuery, state: &std::sync::Arc<AppState>) -> Option<RawClickEvent> {
    let data = q.data.clone()?;
    let message = q.message.as_ref()?;
    let channel_id = message.chat.id.0;
    let message_id = i64::from(message.id.0);
    let pinned = state.telegram.pinned_message_id(channel_id).await == Some(message_id);
    let user_name = q
        .from
        .username
        .clone()
        .unwrap_or_else(|| q.from.first_name.clone());
    Some(RawClickEvent {
        identifier: data,
        channel_id,
        message_id,
        guild_id: None,
        user_id: q.from.id.0,
        user_name,
        content: message.text().unwrap_or_default().to_string(),
        pinned,
    })
}
