//! Actor that serializes all access to the [`Coordinator`].
//!
//! Requests and hardware completions arrive on two queues and are handled one
//! at a time by a single task, so the coordinator never needs a lock. Requests
//! are polled first so a `stop` cannot be starved by completion traffic.

use super::coordinator::{Coordinator, ImagerSnapshot};
use crate::channel::{decode, Decoded, ImagerCommand, Message};
use crate::error::{ImagerError, Result};
use crate::hardware::CompletionEvent;
use crate::job::AcquisitionJob;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Requests understood by the actor.
#[derive(Debug)]
pub enum ImagerRequest {
    Start {
        job: Box<AcquisitionJob>,
        response: oneshot::Sender<Result<()>>,
    },
    Stop {
        response: oneshot::Sender<Result<()>>,
    },
    UpdateConfig {
        metadata: Map<String, Value>,
        response: oneshot::Sender<Result<()>>,
    },
    Snapshot {
        response: oneshot::Sender<ImagerSnapshot>,
    },
    /// Stop any acquisition and end the actor
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

pub struct ImagerActor {
    coordinator: Coordinator,
    completions: mpsc::UnboundedReceiver<CompletionEvent>,
}

impl ImagerActor {
    pub fn new(
        coordinator: Coordinator,
        completions: mpsc::UnboundedReceiver<CompletionEvent>,
    ) -> Self {
        Self {
            coordinator,
            completions,
        }
    }

    /// Runs the actor event loop until shutdown or until every handle is dropped.
    ///
    /// Returns the coordinator so callers can inspect the final state.
    pub async fn run(mut self, mut requests: mpsc::Receiver<ImagerRequest>) -> Coordinator {
        info!(profile = ?self.coordinator.profile(), "Imager actor started");

        loop {
            tokio::select! {
                biased;

                request = requests.recv() => {
                    let Some(request) = request else {
                        debug!("All imager handles dropped");
                        self.shut_down();
                        break;
                    };
                    if let Some(response) = self.handle_request(request) {
                        self.shut_down();
                        let _ = response.send(());
                        break;
                    }
                }

                Some(event) = self.completions.recv() => {
                    self.handle_completion(event);
                }
            }
        }

        info!("Imager actor stopped");
        self.coordinator
    }

    /// Returns the shutdown responder when the request asks the actor to end.
    fn handle_request(&mut self, request: ImagerRequest) -> Option<oneshot::Sender<()>> {
        match request {
            ImagerRequest::Start { job, response } => {
                let _ = response.send(self.coordinator.start(*job));
            }
            ImagerRequest::Stop { response } => {
                let _ = response.send(self.coordinator.stop());
            }
            ImagerRequest::UpdateConfig { metadata, response } => {
                let _ = response.send(self.coordinator.update_config(metadata));
            }
            ImagerRequest::Snapshot { response } => {
                let _ = response.send(self.coordinator.snapshot());
            }
            ImagerRequest::Shutdown { response } => return Some(response),
        }
        None
    }

    fn handle_completion(&mut self, event: CompletionEvent) {
        match self.coordinator.handle_completion(event) {
            Ok(()) => {}
            Err(ImagerError::StaleCompletion { operation }) => {
                debug!(operation, "Ignored stale completion");
            }
            Err(e) => warn!(error = %e, "Failed to apply completion"),
        }
    }

    fn shut_down(&mut self) {
        if let Err(e) = self.coordinator.stop() {
            warn!(error = %e, "Failed to stop acquisition on shutdown");
        }
    }
}

/// Cloneable handle to a running [`ImagerActor`].
#[derive(Clone, Debug)]
pub struct ImagerHandle {
    tx: mpsc::Sender<ImagerRequest>,
}

impl ImagerHandle {
    pub fn new(tx: mpsc::Sender<ImagerRequest>) -> Self {
        Self { tx }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ImagerRequest,
    ) -> Result<T> {
        let (response, rx) = oneshot::channel();
        self.tx
            .send(make(response))
            .await
            .map_err(|_| ImagerError::ControllerClosed)?;
        rx.await.map_err(|_| ImagerError::ControllerClosed)
    }

    pub async fn start(&self, job: AcquisitionJob) -> Result<()> {
        self.request(|response| ImagerRequest::Start {
            job: Box::new(job),
            response,
        })
        .await?
    }

    pub async fn stop(&self) -> Result<()> {
        self.request(|response| ImagerRequest::Stop { response })
            .await?
    }

    pub async fn update_config(&self, metadata: Map<String, Value>) -> Result<()> {
        self.request(|response| ImagerRequest::UpdateConfig { metadata, response })
            .await?
    }

    pub async fn snapshot(&self) -> Result<ImagerSnapshot> {
        self.request(|response| ImagerRequest::Snapshot { response })
            .await
    }

    /// Stop any acquisition and end the actor.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|response| ImagerRequest::Shutdown { response })
            .await
    }

    /// Decode a channel message and forward it.
    ///
    /// Messages that are not for the imager or cannot be decoded are logged
    /// and dropped; they are not errors of the caller.
    pub async fn dispatch(&self, message: &Message) -> Result<()> {
        match decode(message) {
            Decoded::Command(ImagerCommand::Start(job)) => self.start(job).await,
            Decoded::Command(ImagerCommand::Stop) => self.stop().await,
            Decoded::Command(ImagerCommand::UpdateConfig(metadata)) => {
                self.update_config(metadata).await
            }
            Decoded::Ignored(reason) => {
                debug!(topic = %message.topic, %reason, "Ignoring message");
                Ok(())
            }
            Decoded::Malformed(reason) => {
                warn!(topic = %message.topic, %reason, "Dropping malformed message");
                Ok(())
            }
        }
    }
}

/// Spawn an actor for `coordinator` on the current runtime.
pub fn spawn(
    coordinator: Coordinator,
    completions: mpsc::UnboundedReceiver<CompletionEvent>,
    queue_capacity: usize,
) -> (ImagerHandle, JoinHandle<Coordinator>) {
    let (tx, rx) = mpsc::channel(queue_capacity.max(1));
    let actor = ImagerActor::new(coordinator, completions);
    let task = tokio::spawn(actor.run(rx));
    (ImagerHandle::new(tx), task)
}
