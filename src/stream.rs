//! Incremental decoding of the backend's line-framed answer stream.
//!
//! ## Protocol
//! The body is a sequence of newline-delimited frames. A frame is a `data: `
//! prefix followed by a JSON payload, or the literal terminator
//! `data: [DONE]`. Payloads carry either a text delta (`delta`/`content`/
//! `text`), a citation set (`event: "sources"`), or a media set
//! (`event: "media"`). Lines without the prefix and payloads that fail to
//! decode are skipped; a bad frame never aborts the stream.
//!
//! Frames can be split across reads at any byte position, so the assembler
//! keeps the trailing incomplete segment in its buffer until the next chunk.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Frame prefix for protocol lines.
pub const STREAM_PREFIX: &str = "data: ";

/// Terminator payload that ends the stream.
pub const STREAM_TERMINATOR: &str = "[DONE]";

// ---------------------------------------------------------------------------
// Decoded event types
// ---------------------------------------------------------------------------

/// One citation record from a `sources` frame. The backend spells the fields
/// several ways; they are normalized here once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub title: Option<String>,
    pub url: Option<String>,
    pub snippet: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

/// One attachment from a `media` frame, normalized from the backend's
/// separate video/image lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    pub kind: MediaKind,
    pub url: String,
    /// Display title for videos, alt text for images.
    pub title: Option<String>,
    pub source: Option<String>,
}

/// A decoded protocol frame. Downstream code folds these; it never sees raw
/// payload shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    Sources(Vec<Citation>),
    Media(Vec<MediaItem>),
    Done,
}

/// Progress notifications emitted while a reply streams in. Fragments carry
/// the running total so ordering can never be reconstructed wrong.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamUpdate {
    Fragment { delta: String, total: String },
    Sources(Vec<Citation>),
    Media(Vec<MediaItem>),
    Complete { total: String },
    /// Terminal failure of the turn, carrying the user-facing apology. Never
    /// produced by the reducer; the engine emits it when a turn fails so
    /// observers can close out their rendering.
    Failed { message: String },
}

// ---------------------------------------------------------------------------
// Frame parsing
// ---------------------------------------------------------------------------

fn item_string(item: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| item.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

fn parse_citations(documents: &[Value]) -> Vec<Citation> {
    documents
        .iter()
        .map(|doc| Citation {
            title: item_string(doc, &["title", "name"]),
            url: item_string(doc, &["url", "link", "Link"]),
            snippet: item_string(doc, &["snippet", "excerpt", "text"]),
        })
        .collect()
}

fn parse_media(payload: &Value) -> Vec<MediaItem> {
    let mut media = Vec::new();
    if let Some(videos) = payload.get("videos").and_then(Value::as_array) {
        for video in videos {
            if let Some(url) = item_string(video, &["Link", "link", "url"]) {
                media.push(MediaItem {
                    kind: MediaKind::Video,
                    url,
                    title: item_string(video, &["name", "title"]),
                    source: item_string(video, &["source"]),
                });
            }
        }
    }
    if let Some(images) = payload.get("images").and_then(Value::as_array) {
        for image in images {
            if let Some(url) = item_string(image, &["Link", "link", "url"]) {
                media.push(MediaItem {
                    kind: MediaKind::Image,
                    url,
                    title: item_string(image, &["name", "title"]),
                    source: item_string(image, &["source"]),
                });
            }
        }
    }
    media
}

/// Decode one complete line into a `StreamEvent`.
///
/// Returns `None` for blank lines, lines without the frame prefix, and
/// payloads that fail to decode or carry nothing usable.
pub fn parse_frame(line: &str) -> Option<StreamEvent> {
    let line = line.trim();
    let payload = line.strip_prefix(STREAM_PREFIX)?.trim();

    if payload == STREAM_TERMINATOR {
        return Some(StreamEvent::Done);
    }

    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(_) => {
            debug!(line, "skipping malformed frame");
            return None;
        }
    };

    // First match wins: explicit event markers before text-bearing fields.
    if value.get("event").and_then(Value::as_str) == Some("sources") {
        if let Some(documents) = value.get("documents").and_then(Value::as_array) {
            return Some(StreamEvent::Sources(parse_citations(documents)));
        }
        return None;
    }
    if value.get("event").and_then(Value::as_str) == Some("media") {
        return Some(StreamEvent::Media(parse_media(&value)));
    }
    for key in ["delta", "content", "text"] {
        if let Some(fragment) = value.get(key).and_then(Value::as_str) {
            return Some(StreamEvent::TextDelta(fragment.to_string()));
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Chunk assembly
// ---------------------------------------------------------------------------

/// Reassembles frames out of arbitrary byte chunks. Only newline-terminated
/// lines are processed; the trailing segment waits for the next chunk.
///
/// The buffer holds raw bytes and lines are decoded only once complete, so a
/// multi-byte character split across reads survives intact.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
}

impl FrameAssembler {
    pub fn new() -> FrameAssembler {
        FrameAssembler::default()
    }

    /// Feed one chunk, returning every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(line_end) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=line_end).collect();
            let line = String::from_utf8_lossy(&raw[..line_end]);
            if let Some(event) = parse_frame(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Bytes still waiting for a newline.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }
}

/// Folds decoded events into the accumulated answer, emitting
/// [`StreamUpdate`]s as it goes. Used by the transport layer against a live
/// body and by tests against canned chunks.
#[derive(Debug, Default)]
pub struct StreamReducer {
    assembler: FrameAssembler,
    total: String,
    done: bool,
}

impl StreamReducer {
    pub fn new() -> StreamReducer {
        StreamReducer::default()
    }

    /// Feed one chunk of body bytes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamUpdate> {
        let mut updates = Vec::new();
        for event in self.assembler.push(chunk) {
            if self.done {
                break;
            }
            match event {
                StreamEvent::TextDelta(delta) => {
                    self.total.push_str(&delta);
                    updates.push(StreamUpdate::Fragment {
                        delta,
                        total: self.total.clone(),
                    });
                }
                StreamEvent::Sources(citations) => {
                    updates.push(StreamUpdate::Sources(citations));
                }
                StreamEvent::Media(media) => {
                    updates.push(StreamUpdate::Media(media));
                }
                StreamEvent::Done => {
                    self.done = true;
                    updates.push(StreamUpdate::Complete {
                        total: self.total.clone(),
                    });
                }
            }
        }
        updates
    }

    /// Finalize after the body ends. Emits `Complete` when the stream closed
    /// without an explicit terminator.
    pub fn finish(&mut self) -> Option<StreamUpdate> {
        if self.done {
            return None;
        }
        self.done = true;
        Some(StreamUpdate::Complete {
            total: self.total.clone(),
        })
    }

    /// The accumulated answer so far.
    pub fn total(&self) -> &str {
        &self.total
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}
