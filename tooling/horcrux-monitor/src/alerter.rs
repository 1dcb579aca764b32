use crate::{
    config::{SlackConfig, TelegramConfig},
    render::RenderedReport,
};
use futures::future::join_all;
use reqwest::Client;
use std::{future::Future, time::Duration};
use teloxide::{Bot, prelude::Requester, types::ChatId};
use thiserror::Error;
use tokio::time;
use tracing::{info, warn};

/// Telegram rejects messages above 4096 characters.
const TELEGRAM_MESSAGE_LIMIT: usize = 4000;

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("telegram request failed: {0}")]
    Telegram(#[from] teloxide::RequestError),
    #[error("slack request failed: {0}")]
    Slack(#[from] reqwest::Error),
    #[error("{failed} of {total} transports failed")]
    Partial { failed: usize, total: usize },
}

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send_report(&self, report: &RenderedReport) -> Result<(), AlertError>;
}

/// Writes every report to the log. Always enabled, and the only transport
/// in dry-run mode.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send_report(&self, report: &RenderedReport) -> Result<(), AlertError> {
        for line in report.lines() {
            info!("[REPORT] {line}");
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct TelegramAlerter {
    bot: Bot,
    chat_id: ChatId,
    retry_max: u8,
    retry_delay: Duration,
}

impl TelegramAlerter {
    pub fn new(config: &TelegramConfig) -> Self {
        Self {
            bot: Bot::new(config.bot_token.clone()),
            chat_id: ChatId(config.chat_id),
            retry_max: config.retry_max,
            retry_delay: config.retry_delay,
        }
    }
}

#[async_trait::async_trait]
impl Notifier for TelegramAlerter {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn send_report(&self, report: &RenderedReport) -> Result<(), AlertError> {
        let (bot, chat_id) = (&self.bot, self.chat_id);
        for chunk in split_message(&report.text, TELEGRAM_MESSAGE_LIMIT) {
            with_retry(self.retry_max, self.retry_delay, || {
                let text = chunk.clone();
                async move { bot.send_message(chat_id, text).await }
            })
            .await?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SlackNotifier {
    client: Client,
    webhook_url: String,
    mention: String,
}

impl SlackNotifier {
    pub fn new(client: Client, config: &SlackConfig) -> Self {
        Self {
            client,
            webhook_url: config.webhook_url.clone(),
            mention: config.mention.clone(),
        }
    }

    fn payload(&self, report: &RenderedReport) -> serde_json::Value {
        let text = if self.mention.is_empty() {
            report.text.clone()
        } else {
            format!("{} {}", self.mention, report.text)
        };
        serde_json::json!({ "text": text })
    }
}

#[async_trait::async_trait]
impl Notifier for SlackNotifier {
    fn name(&self) -> &'static str {
        "slack"
    }

    async fn send_report(&self, report: &RenderedReport) -> Result<(), AlertError> {
        self.client
            .post(&self.webhook_url)
            .json(&self.payload(report))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Fans one report out to every configured transport.
#[derive(Default)]
pub struct NotifierSet {
    transports: Vec<Box<dyn Notifier>>,
}

impl NotifierSet {
    pub fn push(&mut self, transport: impl Notifier + 'static) {
        self.transports.push(Box::new(transport));
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.transports.iter().map(|transport| transport.name()).collect()
    }
}

#[async_trait::async_trait]
impl Notifier for NotifierSet {
    fn name(&self) -> &'static str {
        "all"
    }

    async fn send_report(&self, report: &RenderedReport) -> Result<(), AlertError> {
        let outcomes = join_all(
            self.transports
                .iter()
                .map(|transport| async move { (transport.name(), transport.send_report(report).await) }),
        )
        .await;

        let mut failed = 0;
        for (transport, outcome) in outcomes {
            match outcome {
                Ok(()) => info!(transport, kind = ?report.kind, "report sent"),
                Err(error) => {
                    failed += 1;
                    warn!(transport, %error, "failed to send report");
                }
            }
        }

        if failed > 0 {
            return Err(AlertError::Partial {
                failed,
                total: self.transports.len(),
            });
        }
        Ok(())
    }
}

/// Runs `operation` once plus up to `retry_max` retries.
async fn with_retry<T, E, F, Fut>(retry_max: u8, delay: Duration, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u8;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if attempt < retry_max => {
                attempt += 1;
                warn!(attempt, retry_max, %error, "send failed, retrying");
                time::sleep(delay).await;
            }
            Err(error) => return Err(error),
        }
    }
}

/// Splits on line boundaries so that each chunk stays within `limit` UTF-16
/// code units, the unit Telegram counts in. Longer lines are cut as well.
fn split_message(text: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for piece in text.lines().flat_map(|line| split_line(line, limit)) {
        let piece_len = piece.encode_utf16().count();
        if !current.is_empty() && current_len + 1 + piece_len > limit {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if !current.is_empty() {
            current.push('\n');
            current_len += 1;
        }
        current.push_str(&piece);
        current_len += piece_len;
    }
    if !current.is_empty() || chunks.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn split_line(line: &str, limit: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut piece = String::new();
    let mut piece_len = 0;

    for c in line.chars() {
        let width = c.len_utf16();
        if !piece.is_empty() && piece_len + width > limit {
            pieces.push(std::mem::take(&mut piece));
            piece_len = 0;
        }
        piece.push(c);
        piece_len += width;
    }
    pieces.push(piece);
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ReportKind;
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    #[derive(Clone, Default)]
    struct Recording {
        sent: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl Notifier for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn send_report(&self, report: &RenderedReport) -> Result<(), AlertError> {
            if let Ok(mut sent) = self.sent.lock() {
                sent.push(report.text.clone());
            }
            Ok(())
        }
    }

    struct Failing;

    #[async_trait::async_trait]
    impl Notifier for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn send_report(&self, _report: &RenderedReport) -> Result<(), AlertError> {
            Err(AlertError::Partial { failed: 1, total: 1 })
        }
    }

    fn report() -> RenderedReport {
        RenderedReport {
            kind: ReportKind::NewAlert,
            text: "🚨 ALERT [horcrux]\nMissed precommits: 5".to_owned(),
        }
    }

    #[tokio::test]
    async fn one_failing_transport_does_not_block_the_others() {
        let recording = Recording::default();
        let mut set = NotifierSet::default();
        set.push(Failing);
        set.push(recording.clone());
        set.push(LogNotifier);

        let outcome = set.send_report(&report()).await;
        assert!(matches!(outcome, Err(AlertError::Partial { failed: 1, total: 3 })));

        let sent = recording.sent.lock().map(|sent| sent.clone()).unwrap_or_default();
        assert_eq!(sent, vec![report().text]);
        assert_eq!(set.names(), vec!["failing", "recording", "log"]);
    }

    #[tokio::test]
    async fn retries_until_success_within_budget() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let outcome: Result<usize, String> = with_retry(3, Duration::ZERO, || async move {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call < 3 { Err(format!("attempt {call}")) } else { Ok(call) }
        })
        .await;

        assert_eq!(outcome, Ok(3));
    }

    #[tokio::test]
    async fn gives_up_after_retry_max() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let outcome: Result<(), String> = with_retry(2, Duration::ZERO, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("unreachable".to_owned())
        })
        .await;

        assert!(outcome.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn slack_payload_prefixes_mention() {
        let notifier = SlackNotifier::new(
            Client::new(),
            &SlackConfig {
                webhook_url: "https://hooks.slack.invalid/T000".to_owned(),
                mention: "<!channel>".to_owned(),
            },
        );

        let payload = notifier.payload(&report());
        assert_eq!(
            payload.get("text").and_then(|text| text.as_str()),
            Some("<!channel> 🚨 ALERT [horcrux]\nMissed precommits: 5")
        );
    }

    #[test]
    fn splits_long_messages_on_line_boundaries() {
        let text = ["a".repeat(6), "b".repeat(6), "c".repeat(3)].join("\n");
        let chunks = split_message(&text, 10);

        assert_eq!(chunks, vec!["a".repeat(6), format!("{}\n{}", "b".repeat(6), "c".repeat(3))]);
        assert_eq!(split_message("", 10), vec![String::new()]);
    }

    #[test]
    fn cuts_overlong_lines_by_utf16_length() {
        let chunks = split_message(&"x".repeat(25), 10);
        assert_eq!(chunks, vec!["x".repeat(10), "x".repeat(10), "x".repeat(5)]);

        // Each emoji is two UTF-16 code units.
        let chunks = split_message(&"🚨".repeat(6), 5);
        assert_eq!(chunks, vec!["🚨🚨".to_owned(), "🚨🚨".to_owned(), "🚨🚨".to_owned()]);
        assert!(chunks.iter().all(|chunk| chunk.encode_utf16().count() <= 5));
    }
}
