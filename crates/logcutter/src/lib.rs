//! Log cutter
//!
//! Slices a raw byte stream of workload logs into typed events. Workloads
//! talk to kiln through their stdout: `[<name>|PHASE] <description>` opens
//! a log phase, `[<name>|RESULT] <payload>` reports a structured result,
//! everything else is plain content. Lines the core emitted itself (the
//! `[kiln:` markers) pass through as content.

pub mod html;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

/// Longest line the cutter buffers. Longer lines split at the cap and the
/// pieces surface as content.
pub const DEFAULT_MAX_LINE_LEN: usize = 8 * 1024;

const READ_CHUNK: usize = 4 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceType {
    Content,
    Phase,
    Result,
}

/// A typed record extracted from a job's log stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSliceEvent {
    pub slice_type: SliceType,
    /// Phase or result name; empty for content.
    pub name: String,
    pub payload: String,
}

impl LogSliceEvent {
    fn content(payload: impl Into<String>) -> Self {
        LogSliceEvent {
            slice_type: SliceType::Content,
            name: String::new(),
            payload: payload.into(),
        }
    }
}

/// Streaming log slicer. Stateless; one instance serves all jobs.
#[derive(Debug, Clone)]
pub struct Cutter {
    max_line_len: usize,
}

impl Default for Cutter {
    fn default() -> Self {
        Cutter {
            max_line_len: DEFAULT_MAX_LINE_LEN,
        }
    }
}

impl Cutter {
    pub fn with_max_line_len(max_line_len: usize) -> Self {
        Cutter { max_line_len }
    }

    /// Consumes the reader on a background task and returns the event and
    /// error channels. The task ends on EOF, on a read error, or when the
    /// event receiver is dropped.
    pub fn slice<R>(
        &self,
        mut reader: R,
    ) -> (
        mpsc::Receiver<LogSliceEvent>,
        mpsc::Receiver<std::io::Error>,
    )
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (evt_tx, evt_rx) = mpsc::channel(64);
        let (err_tx, err_rx) = mpsc::channel(1);
        let max_line_len = self.max_line_len;

        tokio::spawn(async move {
            let mut pending: Vec<u8> = Vec::with_capacity(READ_CHUNK);
            let mut chunk = [0u8; READ_CHUNK];

            loop {
                let n = match reader.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(err) => {
                        let _ = err_tx.send(err).await;
                        return;
                    }
                };
                pending.extend_from_slice(&chunk[..n]);

                loop {
                    // only look for a newline within the cap; a longer
                    // line splits regardless of what follows
                    if let Some(pos) = pending
                        .iter()
                        .take(max_line_len)
                        .position(|&b| b == b'\n')
                    {
                        let line: Vec<u8> = pending.drain(..=pos).collect();
                        let line = String::from_utf8_lossy(&line[..pos]);
                        let evt = parse_line(line.trim_end_matches('\r'));
                        if evt_tx.send(evt).await.is_err() {
                            return;
                        }
                        continue;
                    }
                    if pending.len() >= max_line_len {
                        let head: Vec<u8> = pending.drain(..max_line_len).collect();
                        let evt = LogSliceEvent::content(String::from_utf8_lossy(&head));
                        if evt_tx.send(evt).await.is_err() {
                            return;
                        }
                        continue;
                    }
                    break;
                }
            }

            if !pending.is_empty() {
                let evt = parse_line(String::from_utf8_lossy(&pending).trim_end_matches('\r'));
                let _ = evt_tx.send(evt).await;
            }
        });

        (evt_rx, err_rx)
    }
}

/// The per-line grammar. Anything that is not a well-formed PHASE/RESULT
/// marker is content, including the core's own `[kiln:` markers.
fn parse_line(line: &str) -> LogSliceEvent {
    let Some(rest) = line.strip_prefix('[') else {
        return LogSliceEvent::content(line);
    };
    if rest.starts_with("kiln:") || rest.starts_with("kiln]") {
        return LogSliceEvent::content(line);
    }
    let Some(end) = rest.find(']') else {
        return LogSliceEvent::content(line);
    };
    let header = &rest[..end];
    let payload = rest[end + 1..].strip_prefix(' ').unwrap_or(&rest[end + 1..]);

    let Some((name, kind)) = header.split_once('|') else {
        return LogSliceEvent::content(line);
    };
    if name.is_empty() {
        return LogSliceEvent::content(line);
    }

    match kind {
        "PHASE" => LogSliceEvent {
            slice_type: SliceType::Phase,
            name: name.to_lowercase(),
            payload: payload.to_string(),
        },
        "RESULT" => LogSliceEvent {
            slice_type: SliceType::Result,
            name: name.to_string(),
            payload: payload.to_string(),
        },
        _ => LogSliceEvent::content(line),
    }
}
