//! Dispatch of resolved identities to the printer as G-code macros.
//!
//! Delivery is fire-and-forget: failures are logged and swallowed, and
//! the next scan retries.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, error, info};

use crate::config::MoonrakerConfig;
use crate::error::DispatchError;
use crate::reconcile::ResolvedSpoolIdentity;

const USER_AGENT: &str = concat!("spooltag/", env!("CARGO_PKG_VERSION"));

/// Something that runs G-code commands on a printer.
#[async_trait]
pub trait MacroSink: Send + Sync {
    async fn send_commands(&self, commands: &[String]) -> Result<(), DispatchError>;
}

/// Moonraker's `POST /api/printer/command` endpoint.
#[derive(Debug, Clone)]
pub struct MoonrakerClient {
    client: reqwest::Client,
    url: String,
}

impl MoonrakerClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, DispatchError> {
        let base_url = base_url.trim_end_matches('/');
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|source| DispatchError::Http {
                url: base_url.to_string(),
                source,
            })?;

        Ok(Self {
            client,
            url: format!("{}/api/printer/command", base_url),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl MacroSink for MoonrakerClient {
    async fn send_commands(&self, commands: &[String]) -> Result<(), DispatchError> {
        debug!(url = %self.url, ?commands, "Sending printer commands");
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "commands": commands }))
            .send()
            .await
            .map_err(|source| DispatchError::Http {
                url: self.url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::Status {
                url: self.url.clone(),
                status: status.as_u16(),
            });
        }

        // Moonraker answers 200 with an "error" object for rejected G-code.
        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                debug!(url = %self.url, error = %e, "Response body is not JSON, assuming success");
                Value::Null
            }
        };
        if let Some(err) = body.get("error") {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string());
            return Err(DispatchError::Rejected(message));
        }
        Ok(())
    }
}

/// Logs commands instead of sending them, for dry runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl MacroSink for LogSink {
    async fn send_commands(&self, commands: &[String]) -> Result<(), DispatchError> {
        for command in commands {
            info!(%command, "Dry run, not sending to printer");
        }
        Ok(())
    }
}

/// Substitute `{spool}` and `{filament}` in each template.
pub fn render_commands(templates: &[String], identity: ResolvedSpoolIdentity) -> Vec<String> {
    templates
        .iter()
        .map(|template| {
            template
                .replace("{spool}", &identity.spool_id.to_string())
                .replace("{filament}", &identity.filament_id.to_string())
        })
        .collect()
}

/// Turns scan outcomes into macro calls, suppressing repeats.
pub struct DispatchNotifier<S> {
    sink: S,
    set_commands: Vec<String>,
    clear_commands: Vec<String>,
    always_send: bool,
    clear_spool: bool,
    /// Commands of the last successful send.
    last_sent: Option<Vec<String>>,
}

impl<S: MacroSink> DispatchNotifier<S> {
    pub fn new(sink: S, config: &MoonrakerConfig) -> Self {
        Self {
            sink,
            set_commands: config.set_commands.clone(),
            clear_commands: config.clear_commands.clone(),
            always_send: config.always_send,
            clear_spool: config.clear_spool,
            last_sent: None,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Activate `identity` on the printer. Returns true if commands were
    /// delivered.
    pub async fn notify(&mut self, identity: ResolvedSpoolIdentity) -> bool {
        let commands = render_commands(&self.set_commands, identity);
        info!(
            spool_id = identity.spool_id,
            filament_id = identity.filament_id,
            "Activating spool on printer"
        );
        self.send(commands).await
    }

    /// Tag left the reader. Sends the clear commands if configured.
    pub async fn clear(&mut self) -> bool {
        if !self.clear_spool {
            return false;
        }
        info!("Clearing active spool on printer");
        let commands = self.clear_commands.clone();
        self.send(commands).await
    }

    async fn send(&mut self, commands: Vec<String>) -> bool {
        if !self.always_send && self.last_sent.as_ref() == Some(&commands) {
            info!("Same spool and filament as last time, not sending");
            return false;
        }
        if commands.is_empty() {
            return false;
        }

        // Unknown delivery state after a failure; forget what was sent.
        self.last_sent = None;
        match self.sink.send_commands(&commands).await {
            Ok(()) => {
                self.last_sent = Some(commands);
                true
            }
            Err(e) => {
                error!(error = %e, "Failed to send commands to printer");
                false
            }
        }
    }
}
