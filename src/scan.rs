//! Scan pipeline: one tag event at a time, from radio event to printer.
//!
//! ```text
//! TagSource ──► Sniffer ──► Resolver ──► Reconciler ──► DispatchNotifier
//!                   │                        │
//!                   └────── ScanState ◄──────┘  (watch channel, read by IPC)
//! ```
//!
//! [`ScanService::run`] takes `&mut self`, so two scans can never be in
//! flight on the same service.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::dispatch::{DispatchNotifier, MacroSink};
use crate::error::ScanError;
use crate::mapping::{MappedFields, Resolver};
use crate::reconcile::{Reconciler, ResolvedSpoolIdentity};
use crate::sniffer::{DecodedTag, Sniffer, TagFormat};
use crate::tag::{NfcId, RawTagPayload, RecordType, TagRecord};

// =============================================================================
// EVENTS
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum TagEvent {
    Present(RawTagPayload),
    /// The reader reports no tag in the field.
    Absent,
}

/// Where tag events come from: a radio bridge, a replay file, a test.
#[async_trait]
pub trait TagSource: Send {
    /// Next event, or `None` once the source is exhausted.
    async fn next_event(&mut self) -> Result<Option<TagEvent>>;
}

/// Replays tag events from JSON lines.
///
/// ```text
/// {"uid": "aabbcc", "records": [{"type": "T", "text": "SPOOL:3\nFILAMENT:2"}]}
/// {"uid": "04:a2:19:ee", "records": [{"type": "application/octet-stream", "hex": "5353541001..."}]}
/// {"absent": true}
/// ```
///
/// Blank lines and lines starting with `#` are skipped.
pub struct ReplaySource<R> {
    lines: Lines<R>,
    line_no: usize,
}

#[derive(Debug, Deserialize)]
struct ReplayLine {
    #[serde(default)]
    absent: bool,
    #[serde(default)]
    uid: Option<String>,
    #[serde(default)]
    records: Vec<ReplayRecord>,
}

#[derive(Debug, Deserialize)]
struct ReplayRecord {
    #[serde(rename = "type")]
    record_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    hex: Option<String>,
}

impl<R: AsyncBufRead + Unpin + Send> ReplaySource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_no: 0,
        }
    }
}

impl ReplaySource<BufReader<tokio::fs::File>> {
    pub async fn open(path: &Path) -> Result<Self> {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("Failed to open replay file {}", path.display()))?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl ReplaySource<BufReader<tokio::io::Stdin>> {
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()))
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> TagSource for ReplaySource<R> {
    async fn next_event(&mut self) -> Result<Option<TagEvent>> {
        while let Some(line) = self.lines.next_line().await? {
            self.line_no += 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let event = parse_replay_line(line)
                .with_context(|| format!("Invalid replay line {}", self.line_no))?;
            return Ok(Some(event));
        }
        Ok(None)
    }
}

pub fn parse_replay_line(line: &str) -> Result<TagEvent> {
    let parsed: ReplayLine = serde_json::from_str(line)?;
    if parsed.absent {
        return Ok(TagEvent::Absent);
    }

    let uid = parsed.uid.as_deref().map(parse_hex).transpose().context("uid")?;
    let records = parsed
        .records
        .into_iter()
        .map(replay_record)
        .collect::<Result<Vec<_>>>()?;
    Ok(TagEvent::Present(RawTagPayload::new(uid, records)))
}

fn replay_record(record: ReplayRecord) -> Result<TagRecord> {
    let record_type = RecordType::parse(&record.record_type);
    match (record.text, record.hex) {
        (Some(text), None) if record_type.is_text() => Ok(TagRecord::text(&text)),
        (Some(text), None) => Ok(TagRecord::new(record_type, text.into_bytes())),
        (None, Some(hex)) => Ok(TagRecord::new(record_type, parse_hex(&hex)?)),
        _ => anyhow::bail!("record needs exactly one of \"text\" or \"hex\""),
    }
}

/// Hex bytes, optionally separated by ':' or whitespace.
pub fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let digits: String = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    hex::decode(&digits).with_context(|| format!("'{}' is not hex", input))
}

// =============================================================================
// STATE
// =============================================================================

/// What the last event produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScanOutcome {
    /// Nothing scanned since start.
    Idle,
    Resolved { format: TagFormat },
    Failed { hint: String, message: String },
    /// Tag left the reader; identifiers are those of the last scan.
    Removed,
}

/// Single-slot mailbox published after every event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanState {
    pub nfc_id: Option<NfcId>,
    pub spool_id: Option<u32>,
    pub filament_id: Option<u32>,
    pub outcome: ScanOutcome,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for ScanState {
    fn default() -> Self {
        Self {
            nfc_id: None,
            spool_id: None,
            filament_id: None,
            outcome: ScanOutcome::Idle,
            updated_at: None,
        }
    }
}

// =============================================================================
// SERVICE
// =============================================================================

pub struct ScanService<S> {
    sniffer: Sniffer,
    resolver: Resolver,
    reconciler: Reconciler,
    notifier: DispatchNotifier<S>,
    state: watch::Sender<ScanState>,
}

impl<S: MacroSink> ScanService<S> {
    pub fn new(
        sniffer: Sniffer,
        resolver: Resolver,
        reconciler: Reconciler,
        notifier: DispatchNotifier<S>,
    ) -> Self {
        let (state, _) = watch::channel(ScanState::default());
        Self {
            sniffer,
            resolver,
            reconciler,
            notifier,
            state,
        }
    }

    /// Receiver for the state mailbox.
    pub fn subscribe(&self) -> watch::Receiver<ScanState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ScanState {
        self.state.borrow().clone()
    }

    pub fn notifier(&self) -> &DispatchNotifier<S> {
        &self.notifier
    }

    /// Process events until the source is exhausted.
    pub async fn run(&mut self, source: &mut dyn TagSource) -> Result<()> {
        info!("Scan service started");
        let mut events = 0usize;
        while let Some(event) = source.next_event().await? {
            events += 1;
            self.process(event).await;
        }
        info!(events, "Tag source exhausted");
        Ok(())
    }

    /// Handle one event. Returns the scan result for `Present`, `None`
    /// for `Absent`.
    pub async fn process(
        &mut self,
        event: TagEvent,
    ) -> Option<Result<ResolvedSpoolIdentity, ScanError>> {
        match event {
            TagEvent::Present(payload) => Some(self.scan(&payload).await),
            TagEvent::Absent => {
                debug!("No tag present");
                self.notifier.clear().await;
                self.state.send_modify(|state| {
                    if state.outcome != ScanOutcome::Idle {
                        state.outcome = ScanOutcome::Removed;
                        state.updated_at = Some(Utc::now());
                    }
                });
                None
            }
        }
    }

    /// Decode, reconcile and dispatch one tag.
    pub async fn scan(&mut self, payload: &RawTagPayload) -> Result<ResolvedSpoolIdentity, ScanError> {
        let decoded = self.sniffer.sniff(payload);
        // A descriptor may be bound to its instance id when the reader
        // reports no UID.
        let nfc_id = decoded
            .as_ref()
            .ok()
            .and_then(DecodedTag::nfc_id)
            .cloned()
            .or_else(|| payload.nfc_id());
        let result = match decoded {
            Ok(tag) => self.resolve(&tag).await,
            Err(e) => Err(e.into()),
        };

        match &result {
            Ok((format, identity)) => {
                self.notifier.notify(*identity).await;
                self.publish(ScanState {
                    nfc_id,
                    spool_id: Some(identity.spool_id),
                    filament_id: Some(identity.filament_id),
                    outcome: ScanOutcome::Resolved { format: *format },
                    updated_at: Some(Utc::now()),
                });
            }
            Err(e) => {
                warn!(error = %e, hint = e.operator_hint(), "Scan failed");
                self.publish(ScanState {
                    nfc_id,
                    spool_id: None,
                    filament_id: None,
                    outcome: ScanOutcome::Failed {
                        hint: e.operator_hint().to_string(),
                        message: e.to_string(),
                    },
                    updated_at: Some(Utc::now()),
                });
            }
        }

        result.map(|(_, identity)| identity)
    }

    async fn resolve(
        &self,
        tag: &DecodedTag,
    ) -> Result<(TagFormat, ResolvedSpoolIdentity), ScanError> {
        let mapped = match tag {
            DecodedTag::Fields(fields) => self.resolver.resolve(fields),
            DecodedTag::Identifier(_) => MappedFields::default(),
        };
        let identity = self.reconciler.reconcile(tag, &mapped).await?;
        Ok((tag.format(), identity))
    }

    fn publish(&self, state: ScanState) {
        self.state.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_text_line() {
        let event = parse_replay_line(
            r#"{"uid": "aa:bb:cc", "records": [{"type": "T", "text": "SPOOL:3\nFILAMENT:2"}]}"#,
        )
        .unwrap();
        let TagEvent::Present(payload) = event else {
            panic!("expected a present tag");
        };
        assert_eq!(payload.uid, Some(vec![0xAA, 0xBB, 0xCC]));
        assert_eq!(payload.records.len(), 1);
        assert_eq!(
            payload.records[0].text_content().unwrap().unwrap(),
            "SPOOL:3\nFILAMENT:2"
        );
    }

    #[test]
    fn test_parse_binary_and_absent_lines() {
        let event =
            parse_replay_line(r#"{"records": [{"type": "application/octet-stream", "hex": "4e 53 50 4c"}]}"#)
                .unwrap();
        let TagEvent::Present(payload) = event else {
            panic!("expected a present tag");
        };
        assert_eq!(payload.uid, None);
        assert_eq!(payload.records[0].payload, b"NSPL".to_vec());

        assert_eq!(parse_replay_line(r#"{"absent": true}"#).unwrap(), TagEvent::Absent);
    }

    #[test]
    fn test_parse_rejects_bad_lines() {
        assert!(parse_replay_line("not json").is_err());
        assert!(parse_replay_line(r#"{"uid": "zz"}"#).is_err());
        assert!(parse_replay_line(r#"{"records": [{"type": "T"}]}"#).is_err());
        assert!(
            parse_replay_line(r#"{"records": [{"type": "T", "text": "a", "hex": "00"}]}"#).is_err()
        );
    }

    #[tokio::test]
    async fn test_replay_source_skips_comments() {
        let input = b"# first scan\n\n{\"uid\": \"01\"}\n{\"absent\": true}\n" as &[u8];
        let mut source = ReplaySource::new(input);
        assert!(matches!(source.next_event().await.unwrap(), Some(TagEvent::Present(_))));
        assert_eq!(source.next_event().await.unwrap(), Some(TagEvent::Absent));
        assert_eq!(source.next_event().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_replay_source_reports_line_number() {
        let input = b"{\"absent\": true}\n{oops\n" as &[u8];
        let mut source = ReplaySource::new(input);
        source.next_event().await.unwrap();
        let err = source.next_event().await.unwrap_err();
        assert!(err.to_string().contains("line 2"), "got: {}", err);
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("04:A2:19").unwrap(), vec![0x04, 0xA2, 0x19]);
        assert_eq!(parse_hex("04a219").unwrap(), vec![0x04, 0xA2, 0x19]);
        assert!(parse_hex("4a2").is_err());
    }
}
