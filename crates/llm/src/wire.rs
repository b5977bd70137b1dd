//! Newline-delimited JSON framing for relaying stream events to a remote caller.
//!
//! Each record is one line: `{"type":"thought"|"message"|"complete"|"error","content":...}`
//! with an optional `audioData` on completion. There is no end sentinel; the stream
//! ends when the underlying channel closes.

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, Lines};

use super::provider::StreamEventPayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireKind {
    Thought,
    Message,
    Complete,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireRecord {
    #[serde(rename = "type")]
    pub kind: WireKind,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_data: Option<String>,
}

impl From<&StreamEventPayload> for WireRecord {
    fn from(payload: &StreamEventPayload) -> Self {
        match payload {
            StreamEventPayload::ThoughtDelta(text) => Self {
                kind: WireKind::Thought,
                content: text.clone(),
                audio_data: None,
            },
            StreamEventPayload::MessageDelta(text) => Self {
                kind: WireKind::Message,
                content: text.clone(),
                audio_data: None,
            },
            StreamEventPayload::Complete { audio } => Self {
                kind: WireKind::Complete,
                content: String::new(),
                audio_data: audio.clone(),
            },
            StreamEventPayload::Error(message) => Self {
                kind: WireKind::Error,
                content: message.clone(),
                audio_data: None,
            },
        }
    }
}

impl From<WireRecord> for StreamEventPayload {
    fn from(record: WireRecord) -> Self {
        match record.kind {
            WireKind::Thought => Self::ThoughtDelta(record.content),
            WireKind::Message => Self::MessageDelta(record.content),
            WireKind::Complete => Self::Complete {
                audio: record.audio_data,
            },
            WireKind::Error => Self::Error(record.content),
        }
    }
}

pub type WireResult<T> = Result<T, WireError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum WireError {
    #[snafu(display("failed to encode wire record on `{stage}`: {source}"))]
    EncodeRecord {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write wire record on `{stage}`: {source}"))]
    WriteRecord {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("failed to read wire stream on `{stage}`: {source}"))]
    ReadRecord {
        stage: &'static str,
        source: std::io::Error,
    },
}

pub fn encode_record(payload: &StreamEventPayload) -> WireResult<String> {
    let mut line = serde_json::to_string(&WireRecord::from(payload)).context(EncodeRecordSnafu {
        stage: "encode-record",
    })?;
    line.push('\n');
    Ok(line)
}

pub struct WireEventWriter<W> {
    writer: W,
}

impl<W> WireEventWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write(&mut self, payload: &StreamEventPayload) -> WireResult<()> {
        let line = encode_record(payload)?;
        self.writer
            .write_all(line.as_bytes())
            .await
            .context(WriteRecordSnafu {
                stage: "write-record",
            })?;
        // Flush per record so the remote side sees deltas as they arrive.
        self.writer.flush().await.context(WriteRecordSnafu {
            stage: "flush-record",
        })
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

pub struct WireEventReader<R> {
    lines: Lines<R>,
    line_number: usize,
    skipped: usize,
}

impl<R> WireEventReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_number: 0,
            skipped: 0,
        }
    }

    /// Pulls the next well-formed record. Returns `Ok(None)` once the channel closes.
    pub async fn next_event(&mut self) -> WireResult<Option<StreamEventPayload>> {
        loop {
            let Some(line) = self.lines.next_line().await.context(ReadRecordSnafu {
                stage: "read-record-line",
            })?
            else {
                return Ok(None);
            };
            self.line_number += 1;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<WireRecord>(trimmed) {
                Ok(record) => return Ok(Some(record.into())),
                Err(error) => {
                    self.skipped += 1;
                    tracing::warn!(
                        line_number = self.line_number,
                        error = %error,
                        "skipping malformed wire record"
                    );
                }
            }
        }
    }

    /// Number of malformed records dropped so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn records_use_the_documented_field_names() {
        let line = encode_record(&StreamEventPayload::Complete {
            audio: Some("UklGRg==".to_string()),
        })
        .unwrap();
        assert_eq!(
            line,
            "{\"type\":\"complete\",\"content\":\"\",\"audioData\":\"UklGRg==\"}\n"
        );

        let line = encode_record(&StreamEventPayload::ThoughtDelta("abc".to_string())).unwrap();
        assert_eq!(line, "{\"type\":\"thought\",\"content\":\"abc\"}\n");
    }

    #[tokio::test]
    async fn reader_skips_malformed_records_and_keeps_going() {
        let input = concat!(
            "{\"type\":\"thought\",\"content\":\"abc\"}\n",
            "not json at all\n",
            "{\"type\":\"shout\",\"content\":\"?\"}\n",
            "\n",
            "{\"type\":\"message\",\"content\":\"xyz\"}\n",
            "{\"type\":\"complete\",\"content\":\"\"}\n",
        );
        let mut reader = WireEventReader::new(BufReader::new(input.as_bytes()));

        let mut events = Vec::new();
        while let Some(event) = reader.next_event().await.unwrap() {
            events.push(event);
        }

        assert_eq!(
            events,
            vec![
                StreamEventPayload::ThoughtDelta("abc".to_string()),
                StreamEventPayload::MessageDelta("xyz".to_string()),
                StreamEventPayload::Complete { audio: None },
            ]
        );
        assert_eq!(reader.skipped(), 2);
    }

    #[tokio::test]
    async fn writer_output_reads_back() {
        let mut writer = WireEventWriter::new(Vec::new());
        writer
            .write(&StreamEventPayload::MessageDelta("line one\nline two".to_string()))
            .await
            .unwrap();
        writer
            .write(&StreamEventPayload::Error("boom".to_string()))
            .await
            .unwrap();
        let bytes = writer.into_inner();

        let mut reader = WireEventReader::new(BufReader::new(bytes.as_slice()));
        assert_eq!(
            reader.next_event().await.unwrap(),
            Some(StreamEventPayload::MessageDelta("line one\nline two".to_string()))
        );
        assert_eq!(
            reader.next_event().await.unwrap(),
            Some(StreamEventPayload::Error("boom".to_string()))
        );
        assert_eq!(reader.next_event().await.unwrap(), None);
    }
}
