//! In-process transport that answers from a script.

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Ack, Envelope, Transport, TransportError};
use crate::storage::Instance;

/// What `send` does once the scripted answers run out.
#[derive(Debug, Clone)]
enum Fallback {
    Acknowledge,
    Fail(TransportError),
    /// Never answer, so the caller's timeout fires.
    Hang,
}

#[derive(Debug)]
struct Script {
    sends: VecDeque<Result<Ack, TransportError>>,
    fallback: Fallback,
    changes: VecDeque<Result<Envelope, TransportError>>,
    sent: Vec<Envelope>,
    fetches: Vec<Envelope>,
}

/// A [`Transport`] that records every call and replies from queued answers.
#[derive(Debug)]
pub struct ScriptedTransport {
    script: Mutex<Script>,
}

impl ScriptedTransport {
    fn with_fallback(fallback: Fallback) -> Self {
        Self {
            script: Mutex::new(Script {
                sends: VecDeque::new(),
                fallback,
                changes: VecDeque::new(),
                sent: Vec::new(),
                fetches: Vec::new(),
            }),
        }
    }

    /// Acknowledges every send.
    pub fn acknowledging() -> Self {
        Self::with_fallback(Fallback::Acknowledge)
    }

    /// Fails every send with `error`.
    pub fn failing(error: TransportError) -> Self {
        Self::with_fallback(Fallback::Fail(error))
    }

    /// Never answers a send.
    pub fn hanging() -> Self {
        Self::with_fallback(Fallback::Hang)
    }

    /// Queue the answer to the next unscripted send.
    pub async fn push_send(&self, answer: Result<Ack, TransportError>) {
        self.script.lock().await.sends.push_back(answer);
    }

    /// Queue the answer to the next `fetch_changes`.
    pub async fn push_changes(&self, answer: Result<Envelope, TransportError>) {
        self.script.lock().await.changes.push_back(answer);
    }

    /// Envelopes passed to `send`, in call order.
    pub async fn sent(&self) -> Vec<Envelope> {
        self.script.lock().await.sent.clone()
    }

    /// Requests passed to `fetch_changes`, in call order.
    pub async fn fetches(&self) -> Vec<Envelope> {
        self.script.lock().await.fetches.clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, peer: &Instance, envelope: &Envelope) -> Result<Ack, TransportError> {
        let fallback = {
            let mut script = self.script.lock().await;
            script.sent.push(envelope.clone());
            if let Some(answer) = script.sends.pop_front() {
                return answer;
            }
            script.fallback.clone()
        };

        match fallback {
            Fallback::Acknowledge => Ok(Ack {
                message_id: envelope.id.clone(),
                receiver: peer.domain.clone(),
                received_at: olg_core::db::unix_timestamp(),
                payload: None,
            }),
            Fallback::Fail(error) => Err(error),
            Fallback::Hang => std::future::pending().await,
        }
    }

    async fn fetch_changes(
        &self,
        peer: &Instance,
        request: &Envelope,
    ) -> Result<Envelope, TransportError> {
        let mut script = self.script.lock().await;
        script.fetches.push(request.clone());
        script.changes.pop_front().unwrap_or_else(|| {
            Err(TransportError::Unreachable(format!(
                "no scripted change batch for {}",
                peer.domain
            )))
        })
    }
}
