//! Turns completion events into pipeline activations.
//!
//! [`TransitionEngine`] is a plain state machine over [`PipelineTables`] and
//! the current pipeline statuses. [`EngineHandle`] runs one engine on its own
//! thread so every status change goes through a single owner.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::{Event, EventStatus, PipelineStatus};
use crate::error::HarvestError;
use crate::pipeline::PipelineTables;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActivationCause {
    Event { name: String },
    Trigger { source: String },
}

/// Command to move a pipeline to `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineActivation {
    pub pipeline: String,
    pub status: PipelineStatus,
    pub cause: ActivationCause,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

/// A deferred activation whose predecessor ended in error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stalled {
    pub pipeline: String,
    pub predecessor: String,
}

#[derive(Debug, Clone)]
struct Pending {
    pipeline: String,
    status: PipelineStatus,
    cause: ActivationCause,
}

/// How many `(event, dataset)` pairs are remembered for duplicate detection.
pub const DEFAULT_DEDUP_WINDOW: usize = 100_000;

// Remembers the most recent `capacity` keys; older ones are forgotten.
#[derive(Debug)]
struct SeenWindow {
    keys: HashSet<(String, String)>,
    order: VecDeque<(String, String)>,
    capacity: usize,
}

impl SeenWindow {
    fn new(capacity: usize) -> Self {
        Self {
            keys: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// Returns false when `key` is already in the window.
    fn insert(&mut self, key: (String, String)) -> bool {
        if self.capacity == 0 {
            return true;
        }
        if !self.keys.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
        true
    }
}

pub struct TransitionEngine {
    tables: Arc<PipelineTables>,
    statuses: BTreeMap<String, PipelineStatus>,
    deferred: Vec<Pending>,
    seen: SeenWindow,
}

impl TransitionEngine {
    pub fn new(tables: Arc<PipelineTables>) -> Self {
        Self {
            tables,
            statuses: BTreeMap::new(),
            deferred: Vec::new(),
            seen: SeenWindow::new(DEFAULT_DEDUP_WINDOW),
        }
    }

    /// Limits duplicate detection to the last `window` dataset events. Zero
    /// turns it off.
    pub fn with_dedup_window(mut self, window: usize) -> Self {
        self.seen = SeenWindow::new(window);
        self
    }

    pub fn status(&self, pipeline: &str) -> PipelineStatus {
        self.statuses
            .get(pipeline)
            .copied()
            .unwrap_or(PipelineStatus::New)
    }

    pub fn statuses(&self) -> &BTreeMap<String, PipelineStatus> {
        &self.statuses
    }

    /// Pipelines waiting on a predecessor, with the status they will start in.
    pub fn deferred(&self) -> Vec<(String, PipelineStatus)> {
        self.deferred
            .iter()
            .map(|pending| (pending.pipeline.clone(), pending.status))
            .collect()
    }

    /// Deferred activations that can never proceed because their
    /// predecessor failed.
    pub fn stalled(&self) -> Vec<Stalled> {
        self.deferred
            .iter()
            .filter_map(|pending| {
                let predecessor = self.tables.dependency(&pending.pipeline)?;
                (self.status(predecessor) == PipelineStatus::Error).then(|| Stalled {
                    pipeline: pending.pipeline.clone(),
                    predecessor: predecessor.to_string(),
                })
            })
            .collect()
    }

    /// Processes one completion event and sets its status accordingly.
    pub fn handle(&mut self, event: &mut Event) -> Result<Vec<PipelineActivation>, HarvestError> {
        let Some(target) = self.tables.target(&event.name).cloned() else {
            event.status = EventStatus::Rejected;
            warn!(event = %event.name, "no pipeline mapped to event");
            return Err(HarvestError::UnknownEvent(event.name.clone()));
        };

        if let Some(dataset) = &event.payload.dataset_functional_id {
            if !self.seen.insert((event.name.clone(), dataset.clone())) {
                event.status = EventStatus::Ignored;
                debug!(event = %event.name, dataset = %dataset, "duplicate event ignored");
                return Ok(Vec::new());
            }
        }

        let mut activations = Vec::new();
        let cause = ActivationCause::Event {
            name: event.name.clone(),
        };
        let deferred = self.request(&target.pipeline, target.status, cause, &mut activations);
        event.status = if deferred {
            EventStatus::Deferred
        } else {
            EventStatus::Processed
        };
        Ok(activations)
    }

    /// Records that a pipeline has started running. Returns whether its
    /// status changed.
    pub fn mark_running(&mut self, pipeline: &str) -> bool {
        let current = self.status(pipeline);
        if current.is_terminal() || current >= PipelineStatus::Running {
            return false;
        }
        self.statuses
            .insert(pipeline.to_string(), PipelineStatus::Running);
        true
    }

    /// Moves a pipeline to its terminal status. On success its trigger
    /// successors are requested and deferred activations re-evaluated.
    pub fn complete(&mut self, pipeline: &str, outcome: Outcome) -> Vec<PipelineActivation> {
        let current = self.status(pipeline);
        if current.is_terminal() {
            warn!(pipeline, status = %current, "pipeline already finished");
            return Vec::new();
        }

        let mut activations = Vec::new();
        match outcome {
            Outcome::Success => {
                self.statuses
                    .insert(pipeline.to_string(), PipelineStatus::Done);
                info!(pipeline, "pipeline done");

                let successors = self.tables.triggers(pipeline).to_vec();
                for successor in successors {
                    let cause = ActivationCause::Trigger {
                        source: pipeline.to_string(),
                    };
                    let status = self.tables.trigger_status();
                    self.request(&successor, status, cause, &mut activations);
                }
                self.release_deferred(&mut activations);
            }
            Outcome::Failure => {
                self.statuses
                    .insert(pipeline.to_string(), PipelineStatus::Error);
                warn!(pipeline, "pipeline failed");
                for stalled in self.stalled() {
                    if stalled.predecessor == pipeline {
                        warn!(
                            pipeline = %stalled.pipeline,
                            predecessor = %stalled.predecessor,
                            "deferred pipeline stalled on failed predecessor"
                        );
                    }
                }
            }
        }
        activations
    }

    /// Applies the dependency gate. Returns true when the activation was
    /// deferred.
    fn request(
        &mut self,
        pipeline: &str,
        status: PipelineStatus,
        cause: ActivationCause,
        activations: &mut Vec<PipelineActivation>,
    ) -> bool {
        if let Some(predecessor) = self.tables.dependency(pipeline) {
            let predecessor_status = self.status(predecessor);
            if !predecessor_status.is_success() {
                if predecessor_status == PipelineStatus::Error {
                    warn!(pipeline, predecessor, "predecessor failed, activation stalled");
                } else {
                    debug!(pipeline, predecessor, "activation deferred");
                }
                self.defer(pipeline, status, cause);
                return true;
            }
        }
        self.activate(pipeline, status, cause, activations);
        false
    }

    fn defer(&mut self, pipeline: &str, status: PipelineStatus, cause: ActivationCause) {
        match self
            .deferred
            .iter_mut()
            .find(|pending| pending.pipeline == pipeline)
        {
            Some(pending) => pending.status = pending.status.max(status),
            None => self.deferred.push(Pending {
                pipeline: pipeline.to_string(),
                status,
                cause,
            }),
        }
    }

    // Status only moves forward; anything else is a no-op.
    fn activate(
        &mut self,
        pipeline: &str,
        status: PipelineStatus,
        cause: ActivationCause,
        activations: &mut Vec<PipelineActivation>,
    ) {
        let current = self.status(pipeline);
        if current.is_terminal() || status <= current {
            debug!(pipeline, current = %current, requested = %status, "activation is a no-op");
            return;
        }
        self.statuses.insert(pipeline.to_string(), status);
        info!(pipeline, status = %status, "pipeline activated");
        activations.push(PipelineActivation {
            pipeline: pipeline.to_string(),
            status,
            cause,
        });
    }

    fn release_deferred(&mut self, activations: &mut Vec<PipelineActivation>) {
        let (ready, waiting): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.deferred)
                .into_iter()
                .partition(|pending| {
                    self.tables
                        .dependency(&pending.pipeline)
                        .map(|predecessor| self.status(predecessor).is_success())
                        .unwrap_or(true)
                });
        self.deferred = waiting;
        for pending in ready {
            self.activate(&pending.pipeline, pending.status, pending.cause, activations);
        }
    }
}

/// Messages accepted by the engine thread.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum Signal {
    Event(Event),
    Running { pipeline: String },
    Finished { pipeline: String, outcome: Outcome },
}

/// One report per signal, in submission order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineReport {
    Event {
        event: String,
        status: EventStatus,
        activations: Vec<PipelineActivation>,
    },
    Rejected {
        event: String,
        error: String,
    },
    Running {
        pipeline: String,
        changed: bool,
    },
    Finished {
        pipeline: String,
        outcome: Outcome,
        activations: Vec<PipelineActivation>,
        stalled: Vec<Stalled>,
    },
}

enum Message {
    Signal(Signal),
    Stop,
}

/// Producer side of an [`EngineHandle`], for other threads.
#[derive(Clone)]
pub struct SignalSender {
    messages: Sender<Message>,
}

impl SignalSender {
    pub fn send(&self, signal: Signal) -> Result<(), HarvestError> {
        self.messages
            .send(Message::Signal(signal))
            .map_err(|_| HarvestError::EngineStopped)
    }
}

/// What is left once the engine thread has stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSummary {
    pub statuses: BTreeMap<String, PipelineStatus>,
    /// Reports produced before the stop that nobody received.
    pub unread: Vec<EngineReport>,
}

/// Owner thread for a [`TransitionEngine`].
pub struct EngineHandle {
    messages: Sender<Message>,
    reports: Receiver<EngineReport>,
    worker: JoinHandle<BTreeMap<String, PipelineStatus>>,
}

impl EngineHandle {
    pub fn spawn(tables: Arc<PipelineTables>) -> Self {
        let (messages, message_rx) = mpsc::channel::<Message>();
        let (report_tx, reports) = mpsc::channel::<EngineReport>();
        let worker = thread::spawn(move || {
            let mut engine = TransitionEngine::new(tables);
            for message in message_rx {
                let Message::Signal(signal) = message else {
                    debug!("engine stop requested");
                    break;
                };
                let report = apply(&mut engine, signal);
                if report_tx.send(report).is_err() {
                    break;
                }
            }
            engine.statuses
        });
        Self {
            messages,
            reports,
            worker,
        }
    }

    /// Sender for producers on other threads. Reports still arrive on this
    /// handle.
    pub fn sender(&self) -> SignalSender {
        SignalSender {
            messages: self.messages.clone(),
        }
    }

    pub fn send(&self, signal: Signal) -> Result<(), HarvestError> {
        self.messages
            .send(Message::Signal(signal))
            .map_err(|_| HarvestError::EngineStopped)
    }

    pub fn recv(&self) -> Result<EngineReport, HarvestError> {
        self.reports.recv().map_err(|_| HarvestError::EngineStopped)
    }

    /// Sends one signal and waits for its report. Only meaningful when this
    /// handle is the sole producer.
    pub fn submit(&self, signal: Signal) -> Result<EngineReport, HarvestError> {
        self.send(signal)?;
        self.recv()
    }

    /// Stops the engine after the signals already queued. Signals sent later
    /// through a [`SignalSender`] are refused.
    pub fn shutdown(self) -> Result<EngineSummary, HarvestError> {
        let Self {
            messages,
            reports,
            worker,
        } = self;
        // A worker that already exited has nothing left to stop.
        let _ = messages.send(Message::Stop);
        let statuses = worker.join().map_err(|_| HarvestError::EngineStopped)?;
        let unread = reports.try_iter().collect();
        Ok(EngineSummary { statuses, unread })
    }
}

fn apply(engine: &mut TransitionEngine, signal: Signal) -> EngineReport {
    match signal {
        Signal::Event(mut event) => match engine.handle(&mut event) {
            Ok(activations) => EngineReport::Event {
                event: event.name,
                status: event.status,
                activations,
            },
            Err(err) => EngineReport::Rejected {
                event: event.name,
                error: err.to_string(),
            },
        },
        Signal::Running { pipeline } => {
            let changed = engine.mark_running(&pipeline);
            EngineReport::Running { pipeline, changed }
        }
        Signal::Finished { pipeline, outcome } => {
            let activations = engine.complete(&pipeline, outcome);
            let stalled = engine.stalled();
            EngineReport::Finished {
                pipeline,
                outcome,
                activations,
                stalled,
            }
        }
    }
}
