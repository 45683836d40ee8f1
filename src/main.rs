use std::error::Error;

use dotenvy::dotenv;
use teloxide::dispatching::UpdateFilterExt;
use teloxide::error_handlers::LoggingErrorHandler;
use teloxide::prelude::*;
use teloxide::update_listeners::webhooks;
use teloxide::utils::command::BotCommands;
use tracing::{error, info, warn};

mod config;
mod db;
mod handlers;
mod limiter;
mod llm;
mod state;
mod storage;
mod utils;

use config::CONFIG;
use db::Database;
use handlers::commands;
use state::AppState;
use utils::logging::init_logging;

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase")]
enum Command {
    Start,
    Help,
    Myplan,
    Plans,
    Text(String),
    Img(String),
    Vid(String),
    Status,
    Diagnose,
}

type HandlerResult = Result<(), Box<dyn Error + Send + Sync>>;

#[tokio::main]
async fn main() -> HandlerResult {
    dotenv().ok();
    let _guards = init_logging();

    let bot = Bot::new(CONFIG.bot_token.clone());
    info!("Starting telegram_gen_quota_bot");

    let db = Database::init(&CONFIG.database_url, CONFIG.use_fallback_db).await;
    let state = AppState::new(db);

    let command_handler = dptree::entry()
        .filter_command::<Command>()
        .endpoint(handle_command);

    let handler = Update::filter_message()
        .branch(command_handler)
        .endpoint(ignore_message);

    let mut dispatcher = Dispatcher::builder(bot.clone(), handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build();

    if CONFIG.bot_mode == "webhook" && !CONFIG.webhook_url.trim().is_empty() {
        let addr = ([0, 0, 0, 0], CONFIG.webhook_port).into();
        let url: url::Url = CONFIG.webhook_url.parse()?;
        let listener = webhooks::axum(bot, webhooks::Options::new(addr, url)).await?;
        dispatcher
            .dispatch_with_listener(
                listener,
                LoggingErrorHandler::with_custom_text("An error from the update listener"),
            )
            .await;
    } else {
        if CONFIG.bot_mode == "webhook" {
            warn!("BOT_MODE=webhook but WEBHOOK_URL is not set; falling back to polling");
        }
        dispatcher.dispatch().await;
    }

    Ok(())
}

async fn handle_command(
    bot: Bot,
    state: AppState,
    message: Message,
    command: Command,
) -> HandlerResult {
    fn optional_arg(arg: String) -> Option<String> {
        if arg.trim().is_empty() {
            None
        } else {
            Some(arg)
        }
    }

    match command {
        Command::Start => commands::start_handler(bot, state, message).await?,
        Command::Help => commands::help_handler(bot, message).await?,
        Command::Myplan => commands::myplan_handler(bot, state, message).await?,
        Command::Plans => commands::plans_handler(bot, state, message).await?,
        Command::Text(arg) => {
            let arg = optional_arg(arg);
            tokio::spawn(async move {
                if let Err(err) = commands::text_handler(bot, state, message, arg).await {
                    error!("text handler failed: {err}");
                }
            });
        }
        Command::Img(arg) => {
            let arg = optional_arg(arg);
            tokio::spawn(async move {
                if let Err(err) = commands::img_handler(bot, state, message, arg).await {
                    error!("img handler failed: {err}");
                }
            });
        }
        Command::Vid(arg) => {
            let arg = optional_arg(arg);
            tokio::spawn(async move {
                if let Err(err) = commands::vid_handler(bot, state, message, arg).await {
                    error!("vid handler failed: {err}");
                }
            });
        }
        Command::Status => commands::status_handler(bot, state, message).await?,
        Command::Diagnose => commands::diagnose_handler(bot, state, message).await?,
    }
    Ok(())
}

async fn ignore_message(_message: Message) -> HandlerResult {
    Ok(())
}
