use crate::cli::OutputFormat;
#[cfg(feature = "colored-output")]
use colored::*;
use danmaku::{ChatCommand, DanmakuEvent, RoomChatEvent};
use tracing::warn;

pub struct OutputManager {
    format: OutputFormat,
    all: bool,
}

impl OutputManager {
    pub fn new(format: OutputFormat, all: bool) -> Self {
        Self { format, all }
    }

    pub fn print(&self, event: &RoomChatEvent) {
        if !self.all && event.danmaku().is_none() {
            return;
        }
        match self.format {
            OutputFormat::Json => match serde_json::to_string(event) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, "Failed to serialize event"),
            },
            OutputFormat::Pretty => println!("{}", self.format_pretty(event)),
        }
    }

    fn format_pretty(&self, event: &RoomChatEvent) -> String {
        let time = event
            .received_at
            .with_timezone(&chrono::Local)
            .format("%H:%M:%S");
        match &event.command {
            ChatCommand::Danmaku(danmaku) => format!("[{time}] {}", format_danmaku(danmaku)),
            ChatCommand::Other { command, .. } => format!("[{time}] <{command}>"),
        }
    }
}

fn format_danmaku(danmaku: &DanmakuEvent) -> String {
    let medal = danmaku
        .medal
        .as_ref()
        .map(|m| format!("[{} {}] ", m.name, m.level))
        .unwrap_or_default();
    let name = if danmaku.is_admin {
        format!("{}(admin)", danmaku.sender_name)
    } else {
        danmaku.sender_name.clone()
    };

    #[cfg(feature = "colored-output")]
    let name = name.cyan().bold().to_string();

    format!("{medal}{name}: {}", danmaku.text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use danmaku::Medal;

    #[test]
    fn test_format_danmaku_plain_parts() {
        let danmaku = DanmakuEvent {
            text: "hello".to_string(),
            sender_name: "alice".to_string(),
            medal: Some(Medal {
                name: "Fan".to_string(),
                level: 5,
                ..Default::default()
            }),
            ..Default::default()
        };
        let line = format_danmaku(&danmaku);
        assert!(line.starts_with("[Fan 5] "));
        assert!(line.contains("alice"));
        assert!(line.ends_with(": hello"));
    }
}
