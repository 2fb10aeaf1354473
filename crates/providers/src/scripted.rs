//! A scripted in-memory provider for tests and offline runs.
//!
//! Each `chat_stream` call pops the next scripted turn: either a sequence
//! of stream events (replayed with an optional inter-event delay) or an
//! injected failure.  Requests are recorded for assertions.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use sb_domain::stream::{BoxStream, StreamEvent, Usage};

use crate::traits::{ChatRequest, LlmProvider, ProviderFailure};

pub enum ScriptedTurn {
    Events(Vec<StreamEvent>),
    Failure(ProviderFailure),
    /// A stall: events never arrive until the caller cancels.
    Stall,
}

pub struct ScriptedProvider {
    name: String,
    turns: Mutex<VecDeque<ScriptedTurn>>,
    /// Requests seen, newest last.
    pub requests: Mutex<Vec<ChatRequest>>,
    event_delay: Duration,
}

impl ScriptedProvider {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            name: "scripted".into(),
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
            event_delay: Duration::ZERO,
        }
    }

    pub fn with_event_delay(mut self, delay: Duration) -> Self {
        self.event_delay = delay;
        self
    }

    /// A single text reply followed by a clean `Done`.
    pub fn text_turn(text: &str) -> ScriptedTurn {
        ScriptedTurn::Events(vec![
            StreamEvent::Token { text: text.to_owned() },
            StreamEvent::Done {
                usage: Some(Usage { prompt_tokens: 10, completion_tokens: 5, total_tokens: 15 }),
                finish_reason: Some("stop".into()),
            },
        ])
    }

    pub fn remaining_turns(&self) -> usize {
        self.turns.lock().len()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat_stream(
        &self,
        request: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent, ProviderFailure>>, ProviderFailure> {
        self.requests.lock().push(request.clone());

        let turn = self.turns.lock().pop_front().unwrap_or_else(|| {
            ScriptedTurn::Events(vec![StreamEvent::Done { usage: None, finish_reason: None }])
        });

        match turn {
            ScriptedTurn::Failure(failure) => Err(failure),
            ScriptedTurn::Stall => {
                let stream = async_stream::stream! {
                    // Never yields; the run's cancel/deadline path takes over.
                    std::future::pending::<()>().await;
                    yield Ok(StreamEvent::Done { usage: None, finish_reason: None });
                };
                Ok(Box::pin(stream))
            }
            ScriptedTurn::Events(events) => {
                let delay = self.event_delay;
                let stream = async_stream::stream! {
                    for event in events {
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        yield Ok(event);
                    }
                };
                Ok(Box::pin(stream))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn replays_turns_in_order() {
        let provider = ScriptedProvider::new(vec![
            ScriptedProvider::text_turn("one"),
            ScriptedProvider::text_turn("two"),
        ]);

        for expected in ["one", "two"] {
            let mut stream = provider.chat_stream(&ChatRequest::default()).await.unwrap();
            let first = stream.next().await.unwrap().unwrap();
            match first {
                StreamEvent::Token { text } => assert_eq!(text, expected),
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(provider.requests.lock().len(), 2);
    }

    #[tokio::test]
    async fn failure_turn_errors() {
        let provider = ScriptedProvider::new(vec![ScriptedTurn::Failure(
            ProviderFailure::new(sb_domain::error::ErrorKind::RateLimit, "429"),
        )]);
        let err = match provider.chat_stream(&ChatRequest::default()).await {
            Ok(_) => panic!("expected failure turn to error"),
            Err(err) => err,
        };
        assert_eq!(err.kind, sb_domain::error::ErrorKind::RateLimit);
    }
}
