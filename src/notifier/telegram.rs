//! Concrete notifier channel transport: a Telegram bot, one chat per channel.

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use tokio_util::sync::CancellationToken;

use super::{BoundedQueue, Notification, NotifierChannel, NotifierId};

pub struct TelegramChannel {
    id: NotifierId,
    bot: Bot,
    chat_id: ChatId,
    queue: BoundedQueue,
}

impl TelegramChannel {
    pub fn new(id: NotifierId, bot_token: &str, chat_id: i64, capacity: usize) -> Self {
        Self {
            id,
            bot: Bot::new(bot_token),
            chat_id: ChatId(chat_id),
            queue: BoundedQueue::new(capacity),
        }
    }

    async fn transmit(&self, notification: Notification) -> anyhow::Result<()> {
        let mut text = String::new();
        if let Some(title) = &notification.title {
            text.push_str(title);
            text.push('\n');
        }
        text.push_str(&notification.message);

        self.bot
            .send_message(self.chat_id, text)
            .parse_mode(ParseMode::Html)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl NotifierChannel for TelegramChannel {
    fn id(&self) -> &NotifierId {
        &self.id
    }

    fn enqueue(&self, notification: Notification) -> bool {
        self.queue.enqueue(notification)
    }

    async fn run(&self, stop: CancellationToken) {
        self.queue
            .run(stop, |notification| self.transmit(notification))
            .await;
    }

    fn supports_html(&self) -> bool {
        true
    }

    fn done(&self) -> CancellationToken {
        self.queue.done()
    }
}
