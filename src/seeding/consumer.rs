//! EventConsumer: drains the event channel into the reconciler.
//!
//! Runs as the single consumer task of a session. On a terminal event it
//! fires the session cancellation so the bridge and workers unwind; on
//! `workflow_completed` it also closes the bridge.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use super::collaborators::{HumanResponder, ProgressSink};
use super::events::{AskHuman, Event};
use super::reconciler::{Applied, ProgressReconciler, Termination};
use crate::bridge::BridgeHandle;
use crate::cancel::{cancelled, Cancellation};

pub struct EventConsumer {
    reconciler: Arc<ProgressReconciler>,
    bridge: Arc<dyn BridgeHandle>,
    responder: Arc<dyn HumanResponder>,
    sink: Arc<dyn ProgressSink>,
    cancel: Cancellation,
    fatal: Mutex<Option<String>>,
}

impl EventConsumer {
    pub fn new(
        reconciler: Arc<ProgressReconciler>,
        bridge: Arc<dyn BridgeHandle>,
        responder: Arc<dyn HumanResponder>,
        sink: Arc<dyn ProgressSink>,
        cancel: Cancellation,
    ) -> Self {
        Self {
            reconciler,
            bridge,
            responder,
            sink,
            cancel,
            fatal: Mutex::new(None),
        }
    }

    /// Session-ending error hit while answering a question, if any.
    pub fn fatal_error(&self) -> Option<String> {
        self.fatal.lock().ok().and_then(|f| f.clone())
    }

    /// Consume events until the session ends, the channel closes or the run
    /// is cancelled. Returns how the session ended, if it did.
    pub async fn run(&self, mut events: mpsc::Receiver<Event>) -> Option<Termination> {
        let mut cancel_rx = self.cancel.subscribe();
        tracing::debug!("EventConsumer started");

        loop {
            let event = tokio::select! {
                biased;
                event = events.recv() => event,
                _ = cancelled(&mut cancel_rx) => {
                    self.reconciler.cancel("cancelled");
                    break;
                }
            };

            let Some(event) = event else {
                tracing::debug!("EventConsumer: event channel closed");
                break;
            };

            if let Some(termination) = self.handle(event).await {
                self.on_termination(&termination).await;
                break;
            }
        }

        tracing::debug!("EventConsumer stopped");
        self.reconciler.termination()
    }

    async fn handle(&self, event: Event) -> Option<Termination> {
        let applied = self.reconciler.apply(&event);
        if applied != Applied::Ignored {
            self.sink.update(&self.reconciler.snapshot());
        }

        match (event, applied) {
            (_, Applied::Terminated(termination)) => Some(termination),
            (Event::AskHuman(question), Applied::Changed) => {
                self.answer(&question).await;
                None
            }
            (Event::PlanProposed { tables, .. }, Applied::Changed) => {
                tracing::info!(tables = tables.len(), "Plan proposed");
                None
            }
            (Event::TableFailed { name, reason }, Applied::Changed) => {
                tracing::warn!(table = %name, reason = %reason, "Table failed");
                None
            }
            _ => None,
        }
    }

    async fn answer(&self, question: &AskHuman) {
        if question.question_id.is_empty() {
            tracing::warn!("EventConsumer: ask_human without question_id ignored");
            return;
        }

        let answer = match self.responder.answer(question).await {
            Ok(answer) => answer,
            Err(e) => {
                tracing::error!(
                    question_id = %question.question_id,
                    error = %e,
                    "EventConsumer: could not get an answer"
                );
                return;
            }
        };

        let sent = match answer.to_response(&question.question_id) {
            Ok(response) => self.bridge.send_response(response).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            tracing::error!(
                question_id = %question.question_id,
                error = %e,
                "EventConsumer: failed to send answer"
            );
            if e.is_session_ending() {
                if let Ok(mut fatal) = self.fatal.lock() {
                    fatal.get_or_insert_with(|| e.detail());
                }
                self.reconciler.cancel(&e.detail());
                self.cancel.cancel();
            }
        }
    }

    async fn on_termination(&self, termination: &Termination) {
        match termination {
            Termination::WorkflowCompleted => {
                tracing::info!("EventConsumer: workflow completed");
                if let Err(e) = self.bridge.close().await {
                    tracing::warn!(error = %e, "EventConsumer: error closing session");
                }
            }
            Termination::StreamClosed => tracing::info!("EventConsumer: stream closed"),
            Termination::StreamError(message) => {
                tracing::warn!(error = %crate::logging::mask(message), "EventConsumer: stream error")
            }
            Termination::Cancelled(_) => {}
        }
        self.cancel.cancel();
    }
}
