//! Stage supervision
//!
//! One supervisor loop per stage: it subscribes to the stage's input
//! topic, runs each delivery in its own task, and converts the outcome
//! into the acknowledgment decision. Success and permanent errors ack
//! (redelivery would not help); transient errors and panics nack so the
//! bus redelivers. A slow delivery never blocks the next one.

use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::bus::{BusDelivery, BusError, MessageBus};
use crate::error::{sanitize_error_message, Severity};
use crate::stages::Stage;

/// Runs the configured stages against the bus until shutdown.
pub struct Pipeline {
    bus: Arc<dyn MessageBus>,
    stages: Vec<Arc<dyn Stage>>,
    shutdown_tx: watch::Sender<bool>,
    supervisors: Mutex<JoinSet<()>>,
}

impl Pipeline {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            bus,
            stages: Vec::new(),
            shutdown_tx,
            supervisors: Mutex::new(JoinSet::new()),
        }
    }

    pub fn with_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Subscribe every stage and start its supervisor loop.
    pub async fn start(&self) -> Result<(), BusError> {
        let mut supervisors = self.supervisors.lock().await;
        for stage in &self.stages {
            let receiver = self.bus.subscribe(stage.input_topic()).await?;
            info!(stage = stage.name(), topic = stage.input_topic(), "Stage started");
            supervisors.spawn(run_stage(
                stage.clone(),
                receiver,
                self.shutdown_tx.subscribe(),
            ));
        }
        Ok(())
    }

    /// Signal shutdown and wait for all supervisors (and their in-flight
    /// deliveries) to settle.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut supervisors = self.supervisors.lock().await;
        while supervisors.join_next().await.is_some() {}
        info!("Pipeline stopped");
    }
}

async fn run_stage(
    stage: Arc<dyn Stage>,
    mut receiver: tokio::sync::mpsc::Receiver<BusDelivery>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut in_flight = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            delivery = receiver.recv() => {
                let Some(delivery) = delivery else { break };
                in_flight.spawn(handle_delivery(stage.clone(), delivery));
                // Reap finished tasks without blocking intake
                while in_flight.try_join_next().is_some() {}
            }
        }
    }

    // Let in-flight deliveries settle before the stage goes away
    while in_flight.join_next().await.is_some() {}
    info!(stage = stage.name(), "Stage stopped");
}

async fn handle_delivery(stage: Arc<dyn Stage>, mut delivery: BusDelivery) {
    delivery.begin_processing();
    let payload = delivery.payload().to_vec();

    // Run the stage in its own task so a panic is contained and can be
    // turned into a nack.
    let worker = {
        let stage = stage.clone();
        tokio::spawn(async move { stage.process(&payload).await })
    };

    let settle = match worker.await {
        Ok(Ok(())) => delivery.ack().await,
        Ok(Err(e)) => match e.severity() {
            Severity::Permanent => {
                error!(
                    stage = stage.name(),
                    error = %sanitize_error_message(&e.to_string()),
                    "Unprocessable message, acknowledging without retry"
                );
                delivery.ack().await
            }
            Severity::Transient => {
                warn!(
                    stage = stage.name(),
                    attempt = delivery.attempt(),
                    error = %sanitize_error_message(&e.to_string()),
                    "Stage failed, requesting redelivery"
                );
                delivery.nack().await
            }
        },
        Err(join_error) => {
            if join_error.is_panic() {
                error!(
                    stage = stage.name(),
                    attempt = delivery.attempt(),
                    "Stage panicked, requesting redelivery"
                );
            }
            delivery.nack().await
        }
    };

    if let Err(e) = settle {
        error!(stage = stage.name(), error = %e, "Failed to settle delivery");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::error::{PipelineError, PipelineResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct RecordingStage {
        topic: &'static str,
        calls: Arc<AtomicU32>,
        fail_transient_times: u32,
        fail_permanent: bool,
        panic_once: Arc<AtomicU32>,
    }

    impl RecordingStage {
        fn succeeding(topic: &'static str) -> Self {
            Self {
                topic,
                calls: Arc::new(AtomicU32::new(0)),
                fail_transient_times: 0,
                fail_permanent: false,
                panic_once: Arc::new(AtomicU32::new(0)),
            }
        }
    }

    #[async_trait]
    impl Stage for RecordingStage {
        fn name(&self) -> &str {
            "recording"
        }

        fn input_topic(&self) -> &str {
            self.topic
        }

        async fn process(&self, _payload: &[u8]) -> PipelineResult<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.panic_once.swap(0, Ordering::SeqCst) > 0 {
                panic!("injected panic");
            }
            if self.fail_permanent {
                return Err(PipelineError::invalid_envelope("bad"));
            }
            if call < self.fail_transient_times {
                return Err(PipelineError::store_error("down"));
            }
            Ok(())
        }
    }

    async fn wait_for(calls: &Arc<AtomicU32>, expected: u32) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while calls.load(Ordering::SeqCst) < expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("expected {expected} calls"));
    }

    #[tokio::test]
    async fn test_transient_failure_is_redelivered() {
        let bus = Arc::new(MemoryBus::new(5));
        let stage = Arc::new(RecordingStage {
            fail_transient_times: 2,
            ..RecordingStage::succeeding("t")
        });
        let calls = stage.calls.clone();

        let pipeline = Pipeline::new(bus.clone()).with_stage(stage);
        pipeline.start().await.unwrap();
        bus.publish("t", b"payload".to_vec()).await.unwrap();

        wait_for(&calls, 3).await;
        pipeline.shutdown().await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_redelivered() {
        let bus = Arc::new(MemoryBus::new(5));
        let stage = Arc::new(RecordingStage {
            fail_permanent: true,
            ..RecordingStage::succeeding("t")
        });
        let calls = stage.calls.clone();

        let pipeline = Pipeline::new(bus.clone()).with_stage(stage);
        pipeline.start().await.unwrap();
        bus.publish("t", b"payload".to_vec()).await.unwrap();

        wait_for(&calls, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        pipeline.shutdown().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panic_is_contained_and_redelivered() {
        let bus = Arc::new(MemoryBus::new(5));
        let stage = Arc::new(RecordingStage {
            panic_once: Arc::new(AtomicU32::new(1)),
            ..RecordingStage::succeeding("t")
        });
        let calls = stage.calls.clone();

        let pipeline = Pipeline::new(bus.clone()).with_stage(stage);
        pipeline.start().await.unwrap();
        bus.publish("t", b"payload".to_vec()).await.unwrap();

        wait_for(&calls, 2).await;
        pipeline.shutdown().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_independent_stages_run_concurrently() {
        let bus = Arc::new(MemoryBus::new(5));
        let stage_a = Arc::new(RecordingStage::succeeding("a"));
        let stage_b = Arc::new(RecordingStage::succeeding("b"));
        let calls_a = stage_a.calls.clone();
        let calls_b = stage_b.calls.clone();

        let pipeline = Pipeline::new(bus.clone())
            .with_stage(stage_a)
            .with_stage(stage_b);
        pipeline.start().await.unwrap();

        bus.publish("a", b"1".to_vec()).await.unwrap();
        bus.publish("b", b"2".to_vec()).await.unwrap();

        wait_for(&calls_a, 1).await;
        wait_for(&calls_b, 1).await;
        pipeline.shutdown().await;
    }
}
