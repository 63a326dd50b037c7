//! Transcription Session
//!
//! Wraps one streaming speech-to-text connection with an explicit
//! open / push / close lifecycle. Results, errors and the close notification
//! are delivered as [`SessionEvent`]s on a channel supplied by the owner, each
//! tagged with the session's generation so a consumer can drop events from a
//! session it has already replaced.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};

/// One recognition result. Non-final results are provisional and superseded
/// by any later result for the same utterance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionResult {
    pub transcript: String,
    pub is_final: bool,
}

#[derive(Debug, Error)]
pub enum TranscriptionError {
    #[error("could not open transcription stream: {0}")]
    Connect(String),
    #[error("transcription stream failed: {0}")]
    Stream(String),
}

/// The two halves of an open recognizer stream.
pub struct RecognizerStream {
    /// Audio sink. Dropping it ends the stream.
    pub audio: mpsc::UnboundedSender<Bytes>,
    /// Results in the order the recognizer produced them.
    pub results: mpsc::Receiver<Result<TranscriptionResult, TranscriptionError>>,
    /// Background task driving the connection, aborted on close.
    pub worker: Option<JoinHandle<()>>,
}

/// A streaming speech-to-text collaborator.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    async fn open_stream(&self, language_code: &str) -> Result<RecognizerStream, TranscriptionError>;
}

#[derive(Debug)]
pub enum TranscriptionEvent {
    Result(TranscriptionResult),
    Error(TranscriptionError),
    /// Emitted exactly once, by [`TranscriptionSession::close`].
    Closed,
}

#[derive(Debug)]
pub struct SessionEvent {
    pub generation: u64,
    pub event: TranscriptionEvent,
}

pub struct TranscriptionSession {
    generation: u64,
    audio: Option<mpsc::UnboundedSender<Bytes>>,
    live: Arc<AtomicBool>,
    forwarder: JoinHandle<()>,
    worker: Option<JoinHandle<()>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    closed: bool,
}

impl TranscriptionSession {
    /// Opens a recognizer stream and starts forwarding its results to `events`.
    pub async fn open(
        recognizer: &dyn SpeechRecognizer,
        language_code: &str,
        generation: u64,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Self, TranscriptionError> {
        let RecognizerStream {
            audio,
            mut results,
            worker,
        } = recognizer.open_stream(language_code).await?;

        let live = Arc::new(AtomicBool::new(true));
        let forwarder = {
            let live = live.clone();
            let events = events.clone();
            tokio::spawn(async move {
                while let Some(item) = results.recv().await {
                    let event = match item {
                        Ok(result) => TranscriptionEvent::Result(result),
                        Err(e) => {
                            warn!(generation, error = %e, "Transcription stream error");
                            live.store(false, Ordering::SeqCst);
                            let _ = events.send(SessionEvent {
                                generation,
                                event: TranscriptionEvent::Error(e),
                            });
                            break;
                        }
                    };
                    if events.send(SessionEvent { generation, event }).is_err() {
                        break;
                    }
                }
                live.store(false, Ordering::SeqCst);
            })
        };

        debug!(generation, %language_code, "Transcription session opened");
        Ok(Self {
            generation,
            audio: Some(audio),
            live,
            forwarder,
            worker,
            events,
            closed: false,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_live(&self) -> bool {
        !self.closed && self.live.load(Ordering::SeqCst)
    }

    /// Feeds one audio chunk. A no-op once the session is closed or its stream has ended.
    pub fn push(&self, chunk: Bytes) {
        if !self.is_live() {
            return;
        }
        if let Some(audio) = &self.audio {
            if audio.send(chunk).is_err() {
                self.live.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Releases the stream. Idempotent; the first call emits `Closed`.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.live.store(false, Ordering::SeqCst);
        self.audio = None;
        self.forwarder.abort();
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
        let _ = self.events.send(SessionEvent {
            generation: self.generation,
            event: TranscriptionEvent::Closed,
        });
        debug!(generation = self.generation, "Transcription session closed");
    }
}

impl Drop for TranscriptionSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    type ResultSender = mpsc::Sender<Result<TranscriptionResult, TranscriptionError>>;

    /// Hands out channel-backed streams and keeps the far ends for the test.
    #[derive(Default)]
    struct ChannelRecognizer {
        opened: Mutex<Vec<(ResultSender, mpsc::UnboundedReceiver<Bytes>)>>,
    }

    #[async_trait]
    impl SpeechRecognizer for ChannelRecognizer {
        async fn open_stream(
            &self,
            _language_code: &str,
        ) -> Result<RecognizerStream, TranscriptionError> {
            let (audio_tx, audio_rx) = mpsc::unbounded_channel();
            let (results_tx, results_rx) = mpsc::channel(16);
            self.opened.lock().unwrap().push((results_tx, audio_rx));
            Ok(RecognizerStream {
                audio: audio_tx,
                results: results_rx,
                worker: None,
            })
        }
    }

    struct Unreachable;

    #[async_trait]
    impl SpeechRecognizer for Unreachable {
        async fn open_stream(&self, _: &str) -> Result<RecognizerStream, TranscriptionError> {
            Err(TranscriptionError::Connect("refused".to_string()))
        }
    }

    fn result(text: &str, is_final: bool) -> TranscriptionResult {
        TranscriptionResult {
            transcript: text.to_string(),
            is_final,
        }
    }

    #[tokio::test]
    async fn forwards_results_in_order() {
        let recognizer = ChannelRecognizer::default();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let _session = TranscriptionSession::open(&recognizer, "en-US", 7, events_tx)
            .await
            .unwrap();

        let (results_tx, _) = recognizer.opened.lock().unwrap().pop().unwrap();
        for r in [result("grav", false), result("gravity", false), result("gravity is", true)] {
            results_tx.send(Ok(r)).await.unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            let event = events_rx.recv().await.unwrap();
            assert_eq!(event.generation, 7);
            match event.event {
                TranscriptionEvent::Result(r) => seen.push((r.transcript, r.is_final)),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(
            seen,
            vec![
                ("grav".to_string(), false),
                ("gravity".to_string(), false),
                ("gravity is".to_string(), true)
            ]
        );
    }

    #[tokio::test]
    async fn push_reaches_recognizer_until_close() {
        let recognizer = ChannelRecognizer::default();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut session = TranscriptionSession::open(&recognizer, "en-US", 1, events_tx)
            .await
            .unwrap();
        let (_results_tx, mut audio_rx) = recognizer.opened.lock().unwrap().pop().unwrap();

        session.push(Bytes::from_static(b"\x01\x02"));
        assert_eq!(audio_rx.recv().await.unwrap(), Bytes::from_static(b"\x01\x02"));

        session.close();
        session.close();
        session.push(Bytes::from_static(b"\x03"));

        // The audio sender is gone, so the recognizer side sees the end of input.
        assert!(audio_rx.recv().await.is_none());
        assert!(matches!(
            events_rx.recv().await.unwrap().event,
            TranscriptionEvent::Closed
        ));
        assert!(events_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stream_error_is_reported_and_disables_push() {
        let recognizer = ChannelRecognizer::default();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let session = TranscriptionSession::open(&recognizer, "en-US", 3, events_tx)
            .await
            .unwrap();
        let (results_tx, _audio_rx) = recognizer.opened.lock().unwrap().pop().unwrap();

        results_tx
            .send(Err(TranscriptionError::Stream("socket reset".to_string())))
            .await
            .unwrap();

        let event = events_rx.recv().await.unwrap();
        assert!(matches!(event.event, TranscriptionEvent::Error(_)));
        tokio::task::yield_now().await;
        assert!(!session.is_live());
        session.push(Bytes::from_static(b"ignored"));
    }

    #[tokio::test]
    async fn open_failure_is_returned() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let err = TranscriptionSession::open(&Unreachable, "en-US", 1, events_tx)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TranscriptionError::Connect(_)));
    }

    #[tokio::test]
    async fn drop_closes_the_session() {
        let recognizer = ChannelRecognizer::default();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let session = TranscriptionSession::open(&recognizer, "en-US", 9, events_tx)
            .await
            .unwrap();
        drop(session);
        let event = events_rx.recv().await.unwrap();
        assert_eq!(event.generation, 9);
        assert!(matches!(event.event, TranscriptionEvent::Closed));
    }
}
