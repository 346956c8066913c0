//! Sequential actuation worker
//!
//! Actuations leave the engine through an unbounded queue so the actor never
//! waits on the platform. The worker performs them one at a time in queue
//! order; failures come back as [`EngineEvent::ActuationFailed`].

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::EngineEvent;
use crate::call::Actuation;
use crate::device::CallActuator;
use crate::error::LinkResult;

pub(crate) struct ActuationWorker {
    tx: mpsc::UnboundedSender<Actuation>,
    rx: Option<mpsc::UnboundedReceiver<Actuation>>,
    actuator: Arc<dyn CallActuator>,
    task: Option<JoinHandle<()>>,
}

impl ActuationWorker {
    pub(crate) fn new(actuator: Arc<dyn CallActuator>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Some(rx),
            actuator,
            task: None,
        }
    }

    /// Spawn the worker task; later calls do nothing
    pub(crate) fn start(&mut self, events: mpsc::Sender<EngineEvent>) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        let actuator = self.actuator.clone();
        self.task = Some(tokio::spawn(async move {
            while let Some(actuation) = rx.recv().await {
                debug!(action = actuation.kind().as_str(), call_id = %actuation.call_id(), "Actuating");
                if let Err(error) = perform(actuator.as_ref(), &actuation).await {
                    error!(
                        action = actuation.kind().as_str(),
                        call_id = %actuation.call_id(),
                        error = %error,
                        "Actuation failed"
                    );
                    let failed = EngineEvent::ActuationFailed {
                        kind: actuation.kind(),
                        call_id: actuation.call_id().clone(),
                        error,
                    };
                    if events.send(failed).await.is_err() {
                        break;
                    }
                }
            }
        }));
    }

    pub(crate) fn submit(&self, actuation: Actuation) {
        if self.tx.send(actuation).is_err() {
            warn!("Actuation worker is gone, dropping actuation");
        }
    }

    pub(crate) fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn perform(actuator: &dyn CallActuator, actuation: &Actuation) -> LinkResult<()> {
    match actuation {
        Actuation::PlaceCall { number, .. } => actuator.place_call(number).await,
        Actuation::Answer { .. } => actuator.answer().await,
        Actuation::HangUp { .. } => actuator.hang_up().await,
        Actuation::SendTone { digit, .. } => actuator.send_tone(*digit).await,
        Actuation::PlayAudio { audio, .. } => actuator.play_audio(audio).await,
    }
}
