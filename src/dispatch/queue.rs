// src/dispatch/queue.rs
//! Single entry point for all outbound traffic.
//!
//! Listeners and pollers submit jobs to a [`DispatchQueue`]; one router task
//! hands each job to a lane owned by its destination. A lane delivers its jobs
//! one at a time, so a destination sees messages in submission order while
//! different destinations proceed independently. Lanes are unbounded: the
//! router never waits on a slow destination.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatch::{Dispatcher, Payload};
use crate::rules::Destination;

const QUEUE_CAPACITY: usize = 256;

#[derive(Debug)]
pub struct DispatchJob {
    pub destination: Destination,
    pub payload: Payload,
    pub label: String,
}

/// Cloneable submit handle. The router stops once every handle is dropped
/// and the lanes have drained.
#[derive(Clone)]
pub struct DispatchQueue {
    tx: mpsc::Sender<DispatchJob>,
}

impl DispatchQueue {
    /// Fan `payload` out to every destination. Returns how many jobs were queued.
    pub async fn submit(&self, destinations: &[Destination], payload: Payload, label: &str) -> usize {
        let mut queued = 0;
        for destination in destinations {
            let job = DispatchJob {
                destination: *destination,
                payload: payload.clone(),
                label: label.to_string(),
            };
            if self.tx.send(job).await.is_err() {
                warn!(%destination, label, "dispatch queue closed, dropping job");
                continue;
            }
            queued += 1;
        }
        queued
    }
}

/// Start the router. Await the returned handle after dropping all queue
/// handles to wait for in-flight deliveries.
pub fn spawn_dispatch_router(dispatcher: Arc<Dispatcher>) -> (DispatchQueue, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<DispatchJob>(QUEUE_CAPACITY);

    let handle = tokio::spawn(async move {
        let mut lanes: HashMap<Destination, mpsc::UnboundedSender<DispatchJob>> = HashMap::new();
        let mut lane_handles: Vec<JoinHandle<()>> = Vec::new();

        while let Some(job) = rx.recv().await {
            let lane = lanes.entry(job.destination).or_insert_with(|| {
                let (lane_tx, lane_rx) = mpsc::unbounded_channel();
                lane_handles.push(tokio::spawn(run_lane(
                    job.destination,
                    Arc::clone(&dispatcher),
                    lane_rx,
                )));
                lane_tx
            });
            if lane.send(job).is_err() {
                warn!("dispatch lane closed unexpectedly");
            }
        }

        info!(lanes = lanes.len(), "dispatch queue closed, draining lanes");
        drop(lanes);
        for h in lane_handles {
            if let Err(e) = h.await {
                warn!(error = %e, "dispatch lane panicked");
            }
        }
    });

    (DispatchQueue { tx }, handle)
}

async fn run_lane(
    destination: Destination,
    dispatcher: Arc<Dispatcher>,
    mut rx: mpsc::UnboundedReceiver<DispatchJob>,
) {
    debug!(%destination, "dispatch lane started");
    while let Some(job) = rx.recv().await {
        // Failures are logged inside deliver; the lane keeps going.
        let _ = dispatcher
            .deliver(job.payload, job.destination, &job.label)
            .await;
    }
    debug!(%destination, "dispatch lane stopped");
}
