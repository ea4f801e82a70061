// ===============================
// src/ledger.rs (append-only event ledger)
// ===============================
//
// One JSON object per line: { ts, type, data }. Every state transition is
// appended and flushed before the relational write; a transition the
// ledger has not seen does not exist for downstream audit tools. On a
// write failure we reopen the file and retry once.
//

use std::path::Path;

use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::Mutex,
};
use tracing::{error, info};

use crate::domain::{LedgerEvent, LedgerRecord, UnknownEvent};
use crate::metrics::LEDGER_ERRORS;

async fn open_writer(path: &str) -> std::io::Result<BufWriter<File>> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

pub struct Ledger {
    path: String,
    writer: Mutex<BufWriter<File>>,
}

impl Ledger {
    pub async fn open(path: &str) -> std::io::Result<Self> {
        let writer = open_writer(path).await?;
        info!(%path, "ledger opened");
        Ok(Self { path: path.to_string(), writer: Mutex::new(writer) })
    }

    /// Append one record and flush. Errors here mean the transition was
    /// not durably observed; callers treat that as the cycle's failure.
    pub async fn append(&self, record: &LedgerRecord) -> std::io::Result<()> {
        let mut line = serde_json::to_string(record).map_err(std::io::Error::other)?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        if let Err(e) = Self::write_line(&mut writer, line.as_bytes()).await {
            error!(?e, "ledger write failed, attempting reopen");
            LEDGER_ERRORS.inc();
            *writer = open_writer(&self.path).await?;
            Self::write_line(&mut writer, line.as_bytes()).await?;
        }
        Ok(())
    }

    async fn write_line(writer: &mut BufWriter<File>, line: &[u8]) -> std::io::Result<()> {
        writer.write_all(line).await?;
        writer.flush().await
    }

    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.flush().await;
        let _ = writer.get_mut().sync_all().await;
    }
}

/// Parse one ledger line. Records with a tag this build does not know come
/// back as `LedgerEvent::Unknown` so replays never lose events.
pub fn parse_line(line: &str) -> Result<LedgerRecord, serde_json::Error> {
    match serde_json::from_str::<LedgerRecord>(line) {
        Ok(rec) => Ok(rec),
        Err(err) => {
            let v: serde_json::Value = serde_json::from_str(line)?;
            match (v.get("ts").and_then(|t| t.as_i64()), v.get("type").and_then(|t| t.as_str())) {
                (Some(ts), Some(tag)) => Ok(LedgerRecord {
                    ts,
                    event: LedgerEvent::Unknown(UnknownEvent {
                        tag: tag.to_string(),
                        data: v.get("data").cloned().unwrap_or(serde_json::Value::Null),
                    }),
                }),
                _ => Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ErrorEvent;

    fn temp_path(name: &str) -> String {
        let dir = std::env::temp_dir().join(format!("pairbot-ledger-{}-{}", name, rand::random::<u32>()));
        dir.join("events.jsonl").to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn append_then_parse_roundtrip() {
        let path = temp_path("roundtrip");
        let ledger = Ledger::open(&path).await.unwrap();
        ledger
            .append(&LedgerRecord { ts: 7, event: LedgerEvent::Error(ErrorEvent::new("x")) })
            .await
            .unwrap();
        ledger.close().await;

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 1);
        let rec = parse_line(lines[0]).unwrap();
        assert_eq!(rec.ts, 7);
        assert_eq!(rec.event.tag(), "error");
    }

    #[test]
    fn unknown_tags_survive_parsing() {
        let rec = parse_line(r#"{"ts":9,"type":"funding_update","data":{"rate":0.01}}"#).unwrap();
        assert_eq!(rec.ts, 9);
        assert_eq!(rec.event.tag(), "funding_update");
        match rec.event {
            LedgerEvent::Unknown(u) => assert_eq!(u.data["rate"], 0.01),
            other => panic!("expected unknown event, got {}", other.tag()),
        }
    }
}
