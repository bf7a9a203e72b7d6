//! Command dispatch — maps user text onto session and chat operations.
//!
//! Command grammar (leading `/`, optional Telegram `@botname` suffix):
//! - `/new`, `/新会话`              → start a new conversation
//! - `/switch <arg>`, `/切换 <arg>` → pick a model by alias
//! - `/chat <text>`, `/对话 <text>` → send `text`, reply with the answer
//!
//! The argument may follow the name without a space (`/对话你好`); the
//! longest matching name wins.
//!
//! Every failure below this layer has already been turned into a message, so
//! [`CommandDispatcher::run`] always produces a reply string.

use tracing::{debug, info};

use crate::neko::{NekoModel, SessionManager};

pub const SWITCH_USAGE_REPLY: &str = "请指定要切换的模型：橘猫 / 黑猫";
pub const SWITCH_NO_SESSION_REPLY: &str = "❌ 切换失败：无法创建会话";
pub const CREATE_FAILED_REPLY: &str = "❌ 创建会话失败，请稍后再试。";
pub const CHAT_USAGE_REPLY: &str = "❗ 请输入内容，例如：/chat 你好";
pub const HELP_REPLY: &str = "可用指令：/chat <内容>  /new  /switch 橘猫|黑猫";

/// A parsed user command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    New,
    Switch(String),
    Chat(String),
}

const COMMAND_NAMES: [&str; 6] = ["new", "新会话", "switch", "切换", "chat", "对话"];

/// Parse `text` into a [`Command`]. `None` when it is not one of ours.
pub fn parse_command(text: &str) -> Option<Command> {
    let rest = text.trim().strip_prefix('/')?;
    let (name, mut args) = COMMAND_NAMES
        .iter()
        .filter_map(|name| {
            let head = rest.get(..name.len())?;
            head.eq_ignore_ascii_case(name).then(|| (*name, &rest[name.len()..]))
        })
        .max_by_key(|(name, _)| name.len())?;

    // Telegram groups address commands as `/chat@some_bot`.
    if let Some(mention) = args.strip_prefix('@') {
        args = mention.find(char::is_whitespace).map_or("", |i| &mention[i..]);
    }
    let args = args.trim();

    match name {
        "new" | "新会话" => Some(Command::New),
        "switch" | "切换" => Some(Command::Switch(args.to_string())),
        _ => Some(Command::Chat(args.to_string())),
    }
}

/// Executes commands for a user against the Neko service.
#[derive(Clone)]
pub struct CommandDispatcher {
    manager: SessionManager,
    watermark: String,
}

impl CommandDispatcher {
    pub fn new(manager: SessionManager, watermark: impl Into<String>) -> Self {
        Self { manager, watermark: watermark.into() }
    }

    /// Parse and run `text` for `user_id`. `None` when `text` is not a command.
    pub async fn handle(&self, user_id: &str, text: &str) -> Option<String> {
        let command = parse_command(text)?;
        Some(self.run(user_id, command).await)
    }

    pub async fn run(&self, user_id: &str, command: Command) -> String {
        debug!(%user_id, ?command, "dispatching command");
        match command {
            Command::New => self.new_conversation(user_id).await,
            Command::Switch(arg) => self.switch(user_id, &arg).await,
            Command::Chat(text) => self.chat(user_id, &text).await,
        }
    }

    async fn new_conversation(&self, user_id: &str) -> String {
        match self.manager.create_session(user_id).await {
            Ok(_) => {
                let model = self.manager.store().get_model(user_id);
                format!("✨ 已创建新的会话（当前模型：{}）！", model.display_name())
            }
            Err(_) => CREATE_FAILED_REPLY.to_string(),
        }
    }

    async fn switch(&self, user_id: &str, arg: &str) -> String {
        let Some(model) = NekoModel::from_alias(arg) else {
            return SWITCH_USAGE_REPLY.to_string();
        };

        let Ok(conversation_id) = self.manager.ensure_session(user_id).await else {
            return SWITCH_NO_SESSION_REPLY.to_string();
        };

        if self.manager.switch_model(user_id, &conversation_id, model).await {
            info!(%user_id, %model, "model switched");
            format!("✨ 已切换为：{}", model.display_name())
        } else {
            format!("❌ 切换为 {} 失败", model.display_name())
        }
    }

    async fn chat(&self, user_id: &str, text: &str) -> String {
        let text = text.trim();
        if text.is_empty() {
            return CHAT_USAGE_REPLY.to_string();
        }

        let Ok(conversation_id) = self.manager.ensure_session(user_id).await else {
            return CREATE_FAILED_REPLY.to_string();
        };

        let mut reply = self.manager.client().stream_reply(&conversation_id, text).await;
        reply.push_str(&self.watermark);
        reply
    }
}
