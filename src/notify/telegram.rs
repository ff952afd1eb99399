use anyhow::{Context, Result};
use async_trait::async_trait;
use teloxide::prelude::*;
use tracing::debug;

use super::{ChatKey, ChatType, NotificationSink};
use crate::config::{Telegram, TelegramRoutes};

/// Relays chat posts to Telegram, one destination chat per chat type.
#[derive(Clone)]
pub struct TelegramRelay {
    bot: Bot,
    routes: TelegramRoutes,
}

impl std::fmt::Debug for TelegramRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramRelay")
            .field("routes", &self.routes)
            .finish_non_exhaustive()
    }
}

impl TelegramRelay {
    pub fn from_config(cfg: &Telegram) -> Self {
        Self {
            bot: Bot::new(cfg.bot_token.clone()),
            routes: cfg.routes.clone(),
        }
    }

    pub fn route(&self, chat_type: ChatType) -> Option<ChatId> {
        route_for(&self.routes, chat_type).map(ChatId)
    }
}

fn route_for(routes: &TelegramRoutes, chat_type: ChatType) -> Option<i64> {
    match chat_type {
        ChatType::JobCreatorSourcePartner => routes.job_creator_source_partner,
        ChatType::CandidateRecruiting => routes.candidate_recruiting,
        ChatType::CandidateProspect => routes.candidate_prospect,
    }
}

/// Telegram text for a post: the thread key on the first line, then the body.
pub fn format_relay(chat: &ChatKey, message: &str) -> String {
    format!("[{chat}]\n{message}")
}

#[async_trait]
impl NotificationSink for TelegramRelay {
    async fn post(&self, chat: &ChatKey, message: &str) -> Result<()> {
        let Some(chat_id) = self.route(chat.chat_type()) else {
            debug!(chat = %chat, "no telegram route for chat type");
            return Ok(());
        };
        self.bot
            .send_message(chat_id, format_relay(chat, message))
            .await
            .with_context(|| format!("failed to relay post for {chat} to telegram"))?;
        Ok(())
    }
}
