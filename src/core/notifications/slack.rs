use super::{JobEvent, NotificationChannel};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

pub struct SlackNotifier {
    webhook_url: String,
    client: reqwest::Client,
}

fn target(device_id: &str, share_id: &Option<String>) -> String {
    match share_id {
        Some(share) => format!("{}/{}", device_id, share),
        None => device_id.to_string(),
    }
}

fn short(job_id: &str) -> &str {
    &job_id[..8.min(job_id.len())]
}

fn blocks(title: &str, fields: Vec<String>, detail: Option<String>) -> serde_json::Value {
    let mut blocks = vec![
        json!({
            "type": "header",
            "text": { "type": "plain_text", "text": title, "emoji": true }
        }),
        json!({
            "type": "section",
            "fields": fields
                .into_iter()
                .map(|text| json!({ "type": "mrkdwn", "text": text }))
                .collect::<Vec<_>>()
        }),
    ];
    if let Some(detail) = detail {
        blocks.push(json!({
            "type": "section",
            "text": { "type": "mrkdwn", "text": detail }
        }));
    }
    json!({ "blocks": blocks })
}

impl SlackNotifier {
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    /// Slack payload for an event, or None for events that are not posted.
    fn format_message(&self, event: &JobEvent) -> Option<serde_json::Value> {
        match event {
            JobEvent::Completed {
                job_id,
                device_id,
                share_id,
                status,
                files_processed,
                bytes_added,
                warning_count,
                duration_secs,
                ..
            } => {
                let added_mb = *bytes_added as f64 / (1024.0 * 1024.0);
                let title = if *warning_count > 0 {
                    "Backup Completed With Warnings"
                } else {
                    "Backup Complete"
                };
                Some(blocks(
                    title,
                    vec![
                        format!("*Share:*\n{}", target(device_id, share_id)),
                        format!("*Job ID:*\n`{}`", short(job_id)),
                        format!("*Files:*\n{} ({:.1} MB new)", files_processed, added_mb),
                        format!("*Duration:*\n{}s", duration_secs),
                        format!("*Status:*\n{}", status),
                        format!("*Warnings:*\n{}", warning_count),
                    ],
                    None,
                ))
            }
            JobEvent::Failed {
                job_id,
                device_id,
                share_id,
                error,
            } => Some(blocks(
                "Backup Failed",
                vec![
                    format!("*Share:*\n{}", target(device_id, share_id)),
                    format!("*Job ID:*\n`{}`", short(job_id)),
                ],
                Some(format!("*Error:*\n```{}```", error)),
            )),
            JobEvent::Cancelled {
                job_id,
                device_id,
                share_id,
            } => Some(blocks(
                "Backup Cancelled",
                vec![
                    format!("*Share:*\n{}", target(device_id, share_id)),
                    format!("*Job ID:*\n`{}`", short(job_id)),
                ],
                None,
            )),
            _ => None,
        }
    }
}

#[async_trait]
impl NotificationChannel for SlackNotifier {
    async fn notify(&self, event: JobEvent) -> Result<()> {
        let Some(payload) = self.format_message(&event) else {
            return Ok(());
        };
        self.client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
