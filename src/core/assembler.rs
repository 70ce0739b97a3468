//! Stream assembly
//!
//! Rebuilds an assistant reply from the fragments a provider streams back.
//! Each fragment is decoded on its own as a JSON event with a `type` tag.
//! Only `content_block_delta` events contribute text; every other event type
//! belongs to the provider's lifecycle signaling and is skipped. A fragment
//! that fails to decode is reported and skipped, never fatal.
//!
//! Dropping the future returned by [`assemble`] cancels assembly: the sink is
//! not called again and the fragment stream is released with it.

use futures::{Stream, StreamExt};
use serde::Deserialize;

use crate::providers::{Fragment, ProviderError};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    ContentBlockDelta { delta: TextDelta },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct TextDelta {
    text: String,
}

/// A fragment that could not be decoded into an event
#[derive(Debug, thiserror::Error)]
#[error("Malformed stream fragment #{index}: {source}")]
pub struct DecodeFault {
    /// Position of the fragment in the stream, starting at zero
    pub index: usize,
    #[source]
    pub source: serde_json::Error,
}

/// Receives progress while a reply is assembled
pub trait AssemblySink {
    /// Called after every append with the full text so far
    fn on_text(&mut self, text: &str);

    /// Called once per fragment that failed to decode
    fn on_decode_fault(&mut self, fault: &DecodeFault) {
        tracing::warn!(%fault, "skipping stream fragment");
    }
}

impl<F> AssemblySink for F
where
    F: FnMut(&str),
{
    fn on_text(&mut self, text: &str) {
        self(text)
    }
}

/// Accumulates decoded deltas in arrival order
#[derive(Debug, Default)]
pub struct StreamAssembler {
    buffer: String,
    received: usize,
    faults: usize,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one fragment and append its text, if any
    pub fn push<K>(&mut self, fragment: &Fragment, sink: &mut K)
    where
        K: AssemblySink + ?Sized,
    {
        let index = self.received;
        self.received += 1;

        match serde_json::from_slice::<StreamEvent>(fragment.as_bytes()) {
            Ok(StreamEvent::ContentBlockDelta { delta }) => {
                self.buffer.push_str(&delta.text);
                sink.on_text(&self.buffer);
            }
            Ok(StreamEvent::Other) => {}
            Err(source) => {
                self.faults += 1;
                sink.on_decode_fault(&DecodeFault { index, source });
            }
        }
    }

    pub fn text(&self) -> &str {
        &self.buffer
    }

    /// Number of fragments that failed to decode
    pub fn faults(&self) -> usize {
        self.faults
    }

    pub fn into_text(self) -> String {
        self.buffer
    }
}

/// Drain `fragments` to the end and return the assembled text.
///
/// A transport error inside the stream stops assembly and is returned; the
/// partial text is discarded with it.
pub async fn assemble<S, K>(fragments: S, sink: &mut K) -> Result<String, ProviderError>
where
    S: Stream<Item = Result<Fragment, ProviderError>>,
    K: AssemblySink + ?Sized,
{
    futures::pin_mut!(fragments);

    let mut assembler = StreamAssembler::new();
    while let Some(fragment) = fragments.next().await {
        assembler.push(&fragment?, sink);
    }

    tracing::debug!(
        fragments = assembler.received,
        faults = assembler.faults(),
        chars = assembler.text().chars().count(),
        "stream assembled"
    );
    Ok(assembler.into_text())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use futures::stream;
    use tokio_test::{assert_pending, task};

    use super::*;

    #[derive(Default)]
    struct Recorder {
        texts: Vec<String>,
        faults: Vec<usize>,
    }

    impl AssemblySink for Recorder {
        fn on_text(&mut self, text: &str) {
            self.texts.push(text.to_string());
        }

        fn on_decode_fault(&mut self, fault: &DecodeFault) {
            self.faults.push(fault.index);
        }
    }

    fn delta(text: &str) -> Result<Fragment, ProviderError> {
        let event = serde_json::json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": { "type": "text_delta", "text": text }
        });
        Ok(Fragment::from(event.to_string().as_str()))
    }

    fn raw(text: &str) -> Result<Fragment, ProviderError> {
        Ok(Fragment::from(text))
    }

    #[tokio::test]
    async fn test_assembles_around_malformed_fragment() {
        let fragments = stream::iter(vec![
            delta("He"),
            delta("llo"),
            raw("{\"type\": \"content_block_delta\", \"delta\""),
            delta(" world"),
        ]);
        let mut recorder = Recorder::default();

        let text = assemble(fragments, &mut recorder).await.unwrap();

        assert_eq!(text, "Hello world");
        assert_eq!(recorder.texts, vec!["He", "Hello", "Hello world"]);
        assert_eq!(recorder.faults, vec![2]);
    }

    #[tokio::test]
    async fn test_lifecycle_events_are_ignored() {
        let fragments = stream::iter(vec![
            raw(r#"{"type":"message_start","message":{"id":"msg_1","usage":{"input_tokens":3}}}"#),
            raw(r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#),
            raw(r#"{"type":"ping"}"#),
            delta("Hi"),
            raw(r#"{"type":"content_block_stop","index":0}"#),
            raw(r#"{"type":"message_stop"}"#),
        ]);
        let mut recorder = Recorder::default();

        let text = assemble(fragments, &mut recorder).await.unwrap();

        assert_eq!(text, "Hi");
        assert_eq!(recorder.texts, vec!["Hi"]);
        assert!(recorder.faults.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_utf8_and_missing_text_are_faults() {
        let fragments = stream::iter(vec![
            Ok(Fragment::from(vec![0xffu8, 0xfe, 0x00])),
            raw(r#"{"type":"content_block_delta","delta":{"type":"input_json_delta","partial_json":"{"}}"#),
            delta("ok"),
        ]);
        let mut recorder = Recorder::default();

        let text = assemble(fragments, &mut recorder).await.unwrap();

        assert_eq!(text, "ok");
        assert_eq!(recorder.faults, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_empty_stream_yields_empty_text() {
        let mut calls = 0;
        let mut sink = |_: &str| calls += 1;

        let text = assemble(stream::iter(Vec::new()), &mut sink).await.unwrap();

        assert_eq!(text, "");
        assert_eq!(calls, 0);
    }

    #[tokio::test]
    async fn test_closure_sink_sees_full_text() {
        let mut seen = Vec::new();
        let mut sink = |text: &str| seen.push(text.to_string());

        let fragments = stream::iter(vec![delta("a"), delta("b"), delta("c")]);
        assemble(fragments, &mut sink).await.unwrap();

        assert_eq!(seen, vec!["a", "ab", "abc"]);
    }

    #[tokio::test]
    async fn test_transport_error_stops_assembly() {
        let fragments = stream::iter(vec![
            delta("partial"),
            Err(ProviderError::Stream("connection reset".to_string())),
            delta("never seen"),
        ]);
        let mut recorder = Recorder::default();

        let err = assemble(fragments, &mut recorder).await.unwrap_err();

        assert!(matches!(err, ProviderError::Stream(_)));
        assert_eq!(recorder.texts, vec!["partial"]);
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_dropping_assembly_releases_stream() {
        let released = Arc::new(AtomicBool::new(false));
        let flag = DropFlag(released.clone());

        // One delta, then a stream that never finishes
        let fragments = stream::iter(vec![delta("Hel")])
            .chain(stream::pending())
            .map(move |item| {
                let _held = &flag;
                item
            });

        let mut texts = Vec::new();
        {
            let mut sink = |text: &str| texts.push(text.to_string());
            let mut assembly = task::spawn(assemble(fragments, &mut sink));
            assert_pending!(assembly.poll());
        }

        assert!(released.load(Ordering::SeqCst));
        assert_eq!(texts, vec!["Hel"]);
    }
}
