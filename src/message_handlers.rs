use super::*;

use teloxide::requests::Requester;

const HELP_TEXT: &str = "/pool_target <sides> [max dice] [reroll faces] [botch faces] [ask|always]\n\
    Roll a pool of dice against a target number, e.g. /pool_target 10 15 10 1 ask\n\
    /sum_dice [dice...]\n\
    Build a sum of dice by clicking, e.g. /sum_dice 4 6 8 20\n\
    /clear\n\
    Delete every dice message of this chat";

pub(super) async fn handle_message(bot: Bot, msg: Message, state: std::sync::Arc<AppState>) -> Result<()> {
    let text = match msg.text() {
        Some(text) => text.to_string(),
        None => return Ok(()),
    };
    let Some(command) = parse_command(&text) else {
        return Ok(());
    };
    let args = command_args(&text);
    let channel_id = msg.chat.id.0;

    match command {
        "pool_target" => match PoolTargetConfig::parse_args(&args) {
            Ok(config) => {
                if let Err(err) = state.pool_target.start(channel_id, None, config).await {
                    report_start_error(&bot, &msg, "pool_target", &err).await?;
                }
            }
            Err(err) => {
                bot.send_message(msg.chat.id, format!("{:#}\n\n{}", err, HELP_TEXT))
                    .await?;
            }
        },
        "sum_dice" => match SumDiceConfig::parse_args(&args) {
            Ok(config) => {
                if let Err(err) = state.sum_dice.start(channel_id, None, config).await {
                    report_start_error(&bot, &msg, "sum_dice", &err).await?;
                }
            }
            Err(err) => {
                bot.send_message(msg.chat.id, format!("{:#}\n\n{}", err, HELP_TEXT))
                    .await?;
            }
        },
        "clear" => {
            let deleted = state.services.cleanup.clear_channel(channel_id).await?;
            info!("{}: cleared {} dice messages", channel_id, deleted);
            bot.send_message(msg.chat.id, format!("Deleted {} dice messages.", deleted))
                .await?;
        }
        "help" | "start" => {
            bot.send_message(msg.chat.id, HELP_TEXT).await?;
        }
        _ => {}
    }

    Ok(())
}

async fn report_start_error(bot: &Bot, msg: &Message, command: &str, err: &ResolveError) -> Result<()> {
    error!("{}: /{} failed: {}", msg.chat.id.0, command, err);
    if let Some(text) = err.user_message() {
        bot.send_message(msg.chat.id, text).await?;
    }
    Ok(())
}
