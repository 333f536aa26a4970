use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::{Stream, StreamExt};

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::types::{Completion, Usage};

/// Incremental parser for a server-sent events body.
///
/// Bytes are buffered until a full UTF-8 event block (`\n\n` terminated) is
/// available, so multi-byte characters split across chunks survive intact.
#[derive(Default)]
pub struct SseParser {
    buffer: Vec<u8>,
}

/// A parsed SSE event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event_type: Option<String>,
    pub data: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes and return every event completed by them.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some((end, sep_len)) = find_boundary(&self.buffer) {
            let block: Vec<u8> = self.buffer.drain(..end + sep_len).take(end).collect();
            let block = String::from_utf8_lossy(&block);

            let mut event_type = None;
            let mut data_lines = Vec::new();
            for line in block.lines() {
                let line = line.trim_end_matches('\r');
                if let Some(val) = line.strip_prefix("event:") {
                    event_type = Some(val.trim_start().to_string());
                } else if let Some(val) = line.strip_prefix("data:") {
                    data_lines.push(val.strip_prefix(' ').unwrap_or(val).to_string());
                }
            }

            if !data_lines.is_empty() {
                events.push(SseEvent {
                    event_type,
                    data: data_lines.join("\n"),
                });
            }
        }

        events
    }
}

/// Position and length of the first blank-line separator (`\n\n` or `\r\n\r\n`).
fn find_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// A stream of SSE events over a response body.
pub struct SseStream<S> {
    inner: S,
    parser: SseParser,
    pending: VecDeque<SseEvent>,
    done: bool,
}

impl<S> SseStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            parser: SseParser::new(),
            pending: VecDeque::new(),
            done: false,
        }
    }
}

impl<S> Stream for SseStream<S>
where
    S: Stream<Item = std::result::Result<bytes::Bytes, reqwest::Error>> + Unpin,
{
    type Item = Result<SseEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
            if this.done {
                return Poll::Ready(None);
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    this.pending.extend(this.parser.feed(&bytes));
                }
                Poll::Ready(Some(Err(e))) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(StepwiseError::CompletionStream(e.to_string()))));
                }
                Poll::Ready(None) => {
                    this.done = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// A piece of a streamed completion, normalized across providers.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Fragment {
    Text(String),
    InputTokens(u64),
    OutputTokens(u64),
}

/// Drain a provider's event stream into a single completion.
pub(crate) async fn collect_completion<S, F>(mut events: S, mut parse: F) -> Result<Completion>
where
    S: Stream<Item = Result<SseEvent>> + Unpin,
    F: FnMut(&SseEvent) -> Vec<Result<Fragment>>,
{
    let mut text = String::new();
    let mut input_tokens = None;
    let mut output_tokens = None;

    while let Some(event) = events.next().await {
        let event = event?;
        if event.data.trim() == "[DONE]" {
            break;
        }
        for fragment in parse(&event) {
            match fragment? {
                Fragment::Text(t) => text.push_str(&t),
                Fragment::InputTokens(n) => input_tokens = Some(n),
                // Providers report cumulative output counts; keep the latest
                Fragment::OutputTokens(n) => output_tokens = Some(n),
            }
        }
    }

    let usage = match (input_tokens, output_tokens) {
        (None, None) => None,
        (i, o) => Some(Usage {
            input_tokens: i.unwrap_or(0),
            output_tokens: o.unwrap_or(0),
        }),
    };
    Ok(Completion { text, usage })
}
