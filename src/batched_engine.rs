use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::sync::oneshot;
use tokio::time::{Instant, interval_at};

use crate::config::BatchConfig;
use crate::engine::BatchedEngine;
use crate::engine::Engine;
use crate::types::{ZeroShotRequest, ZeroShotResponse};

type ResponseSender = oneshot::Sender<Result<ZeroShotResponse>>;

#[derive(Debug)]
struct QueuedRequest {
    request: ZeroShotRequest,
    response_tx: ResponseSender,
}

impl QueuedRequest {
    /// Number of (text, hypothesis) pairs this request adds to a forward pass.
    fn pairs(&self) -> usize {
        self.request.labels.len()
    }
}

/// Front half of the batcher: hands single requests to the processor task
/// and waits for their individual answers.
pub struct BatchedEngineWrapper {
    request_tx: flume::Sender<QueuedRequest>,
}

impl BatchedEngineWrapper {
    pub fn new<T: BatchedEngine + 'static>(
        config: BatchConfig,
        batched_engine: T,
    ) -> (Self, BatchProcessor<T>) {
        let (request_tx, request_rx) = flume::bounded(0); // Rendezvous channel

        let processor = BatchProcessor {
            request_rx,
            config,
            request_queue: VecDeque::new(),
            queued_pairs: 0,
            batched_engine,
        };

        (Self { request_tx }, processor)
    }
}

#[async_trait]
impl Engine for BatchedEngineWrapper {
    #[tracing::instrument(skip(self, request), fields(text_len = request.text.len(), labels = request.labels.len()))]
    async fn classify(&self, request: ZeroShotRequest) -> Result<ZeroShotResponse> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send_async(QueuedRequest {
                request,
                response_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("Engine queue is closed"))?;

        response_rx
            .await
            .map_err(|_| anyhow::anyhow!("Response channel closed"))?
    }
}

/// Owns the model. Batches are sized in NLI pairs rather than requests, since
/// every request fans out into one pair per candidate label.
pub struct BatchProcessor<T: BatchedEngine> {
    request_rx: flume::Receiver<QueuedRequest>,
    config: BatchConfig,
    request_queue: VecDeque<QueuedRequest>,
    queued_pairs: usize,
    batched_engine: T,
}

impl<T: BatchedEngine> BatchProcessor<T> {
    #[tracing::instrument(skip(self))]
    pub async fn run_forever(mut self) -> Result<()> {
        let tick = self.config.tick_duration;
        let mut tick_timer = interval_at(Instant::now() + tick, tick);

        loop {
            tokio::select! {
                request = self.request_rx.recv_async() => {
                    let Ok(req) = request else {
                        tracing::info!(pending_requests = self.request_queue.len(), "All senders dropped, draining queue");
                        while !self.request_queue.is_empty() {
                            self.process_batch().await;
                        }
                        break Ok(());
                    };

                    self.queued_pairs += req.pairs();
                    self.request_queue.push_back(req);
                    tracing::debug!(
                        queue_size = self.request_queue.len(),
                        queued_pairs = self.queued_pairs,
                        "Request queued"
                    );

                    while self.queued_pairs >= self.config.max_batch_pairs {
                        self.process_batch().await;
                    }
                }

                _ = tick_timer.tick() => {
                    if !self.request_queue.is_empty() {
                        tracing::debug!(pending_requests = self.request_queue.len(), "Tick flush");
                        self.process_batch().await;
                    }
                }
            }
        }
    }

    /// Pops the next batch in FIFO order, at most `max_batch_pairs` pairs.
    ///
    /// Requests whose caller has gone away are discarded first. A single
    /// request larger than the budget still goes out, alone.
    fn take_batch(&mut self) -> Vec<QueuedRequest> {
        let before = self.request_queue.len();
        self.request_queue.retain(|queued| !queued.response_tx.is_closed());
        if self.request_queue.len() < before {
            tracing::debug!(dropped = before - self.request_queue.len(), "Skipping abandoned requests");
        }

        let mut pairs = 0;
        let mut take = 0;
        for queued in &self.request_queue {
            if take > 0 && pairs + queued.pairs() > self.config.max_batch_pairs {
                break;
            }
            pairs += queued.pairs();
            take += 1;
        }

        let batch: Vec<_> = self.request_queue.drain(..take).collect();
        self.queued_pairs = self.request_queue.iter().map(QueuedRequest::pairs).sum();
        batch
    }

    #[tracing::instrument(skip(self))]
    async fn process_batch(&mut self) {
        let batch = self.take_batch();
        if batch.is_empty() {
            return;
        }

        let batch_start = Instant::now();
        let pairs: usize = batch.iter().map(QueuedRequest::pairs).sum();
        tracing::info!(requests = batch.len(), pairs, "Processing batch");

        let (requests, response_channels): (Vec<_>, Vec<_>) = batch
            .into_iter()
            .map(|queued| (queued.request, queued.response_tx))
            .unzip();

        match self.batched_engine.classify_batch(requests).await {
            Ok(responses) => {
                if responses.len() != response_channels.len() {
                    tracing::warn!(
                        expected = response_channels.len(),
                        got = responses.len(),
                        "Engine returned the wrong number of responses"
                    );
                }
                // Unmatched senders are dropped, which their callers see as a closed channel
                for (response_tx, response) in response_channels.into_iter().zip(responses) {
                    let _ = response_tx.send(response);
                }
            }
            Err(err) => {
                tracing::error!("Batch processing failed: {}", err);
                for response_tx in response_channels {
                    let _ =
                        response_tx.send(Err(anyhow::anyhow!("Batch processing failed: {}", err)));
                }
            }
        }

        tracing::info!(
            processing_time_ms = batch_start.elapsed().as_millis(),
            "Batch processed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::Emotion;
    use crate::types::LabelScore;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Scores the label whose name is in the text as certain, and records how
    /// many pairs each batch carried.
    struct KeywordEngine {
        batch_pairs: Arc<std::sync::Mutex<Vec<usize>>>,
    }

    #[async_trait]
    impl BatchedEngine for KeywordEngine {
        async fn classify_batch(
            &self,
            requests: Vec<ZeroShotRequest>,
        ) -> Result<Vec<Result<ZeroShotResponse>>> {
            let pairs: usize = requests.iter().map(|req| req.labels.len()).sum();
            self.batch_pairs.lock().unwrap().push(pairs);
            Ok(requests
                .into_iter()
                .map(|req| -> Result<ZeroShotResponse> {
                    let hit = req
                        .labels
                        .iter()
                        .position(|l| req.text.contains(l.as_str()))
                        .ok_or_else(|| anyhow::anyhow!("no label in {:?}", req.text))?;
                    let mut labels = req.labels.clone();
                    let top = labels.remove(hit);
                    let scores = std::iter::once(LabelScore { label: top, score: 1.0 })
                        .chain(labels.into_iter().map(|label| LabelScore { label, score: 0.0 }))
                        .collect();
                    Ok(ZeroShotResponse { scores })
                })
                .collect())
        }
    }

    struct FailingEngine {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BatchedEngine for FailingEngine {
        async fn classify_batch(
            &self,
            _requests: Vec<ZeroShotRequest>,
        ) -> Result<Vec<Result<ZeroShotResponse>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("device lost")
        }
    }

    fn config(max_batch_pairs: usize, tick_ms: u64) -> BatchConfig {
        BatchConfig {
            max_batch_pairs,
            tick_duration: Duration::from_millis(tick_ms),
        }
    }

    fn request(text: &str) -> ZeroShotRequest {
        ZeroShotRequest {
            text: text.to_string(),
            labels: Emotion::ALL.to_vec(),
        }
    }

    fn queued(labels: &[Emotion]) -> (QueuedRequest, oneshot::Receiver<Result<ZeroShotResponse>>) {
        let (response_tx, response_rx) = oneshot::channel();
        let queued = QueuedRequest {
            request: ZeroShotRequest {
                text: "text".to_string(),
                labels: labels.to_vec(),
            },
            response_tx,
        };
        (queued, response_rx)
    }

    fn processor(max_batch_pairs: usize) -> BatchProcessor<KeywordEngine> {
        let (_engine, processor) = BatchedEngineWrapper::new(
            config(max_batch_pairs, 100),
            KeywordEngine {
                batch_pairs: Arc::default(),
            },
        );
        processor
    }

    fn enqueue(processor: &mut BatchProcessor<KeywordEngine>, request: QueuedRequest) {
        processor.queued_pairs += request.pairs();
        processor.request_queue.push_back(request);
    }

    fn pair_counts(batch: &[QueuedRequest]) -> Vec<usize> {
        batch.iter().map(QueuedRequest::pairs).collect()
    }

    #[test]
    fn batches_are_bounded_by_pair_count() {
        let mut processor = processor(14);
        let mut receivers = Vec::new();
        for labels in [&Emotion::ALL[..], &Emotion::ALL[..], &Emotion::ALL[..3], &Emotion::ALL[..]] {
            let (request, rx) = queued(labels);
            enqueue(&mut processor, request);
            receivers.push(rx);
        }
        assert_eq!(processor.queued_pairs, 24);

        assert_eq!(pair_counts(&processor.take_batch()), [7, 7]);
        assert_eq!(processor.queued_pairs, 10);
        assert_eq!(pair_counts(&processor.take_batch()), [3, 7]);
        assert_eq!(processor.queued_pairs, 0);
        assert!(processor.take_batch().is_empty());
    }

    #[test]
    fn oversized_request_goes_out_alone() {
        let mut processor = processor(5);
        let (first, _rx1) = queued(&Emotion::ALL);
        let (second, _rx2) = queued(&Emotion::ALL[..2]);
        enqueue(&mut processor, first);
        enqueue(&mut processor, second);

        assert_eq!(pair_counts(&processor.take_batch()), [7]);
        assert_eq!(pair_counts(&processor.take_batch()), [2]);
    }

    #[test]
    fn abandoned_requests_are_not_scored() {
        let mut processor = processor(64);
        let (gone, gone_rx) = queued(&Emotion::ALL);
        let (kept, _kept_rx) = queued(&Emotion::ALL[..4]);
        enqueue(&mut processor, gone);
        enqueue(&mut processor, kept);
        drop(gone_rx);

        let batch = processor.take_batch();
        assert_eq!(pair_counts(&batch), [4]);
        assert_eq!(processor.queued_pairs, 0);
        assert!(processor.request_queue.is_empty());
    }

    #[tokio::test]
    async fn full_pair_budget_flushes_before_the_tick() {
        let batch_pairs = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (engine, processor) = BatchedEngineWrapper::new(
            config(14, 60_000),
            KeywordEngine {
                batch_pairs: batch_pairs.clone(),
            },
        );
        tokio::spawn(processor.run_forever());

        let (calm, sad) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(engine.classify(request("Calm")), engine.classify(request("Sad")))
        })
        .await
        .expect("two full requests should fill the budget");

        assert_eq!(calm.unwrap().scores[0].label, Emotion::Calm);
        assert_eq!(sad.unwrap().scores[0].label, Emotion::Sad);
        assert_eq!(*batch_pairs.lock().unwrap(), vec![14]);
    }

    #[tokio::test]
    async fn routes_each_answer_to_its_caller() {
        let batch_pairs = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (engine, processor) = BatchedEngineWrapper::new(
            config(14, 10),
            KeywordEngine {
                batch_pairs: batch_pairs.clone(),
            },
        );
        let handle = tokio::spawn(processor.run_forever());

        let texts = ["Calm day", "Sad news", "Focused now", "Low energy", "Anxious"];
        let results =
            futures::future::join_all(texts.iter().map(|t| engine.classify(request(t)))).await;

        for (text, result) in texts.iter().zip(results) {
            let top = result.unwrap().scores[0].label;
            assert!(text.contains(top.as_str()), "{text} got {top}");
        }

        let total: usize = batch_pairs.lock().unwrap().iter().sum();
        assert_eq!(total, texts.len() * Emotion::ALL.len());
        assert!(batch_pairs.lock().unwrap().iter().all(|&n| n <= 14));

        drop(engine);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn tick_flushes_a_partial_batch() {
        let batch_pairs = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (engine, processor) = BatchedEngineWrapper::new(
            config(64, 5),
            KeywordEngine {
                batch_pairs: batch_pairs.clone(),
            },
        );
        tokio::spawn(processor.run_forever());

        let response = tokio::time::timeout(Duration::from_secs(5), engine.classify(request("Sad")))
            .await
            .expect("lone request should be flushed by the tick")
            .unwrap();
        assert_eq!(response.scores[0].label, Emotion::Sad);
        assert_eq!(*batch_pairs.lock().unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn per_request_errors_stay_with_their_request() {
        let (engine, processor) = BatchedEngineWrapper::new(
            config(2, 5),
            KeywordEngine {
                batch_pairs: Arc::default(),
            },
        );
        tokio::spawn(processor.run_forever());

        let (good, bad) = tokio::join!(
            engine.classify(request("Energized")),
            engine.classify(request("nothing"))
        );
        assert_eq!(good.unwrap().scores[0].label, Emotion::Energized);
        assert!(bad.is_err());
    }

    #[tokio::test]
    async fn batch_failure_reaches_every_caller() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (engine, processor) = BatchedEngineWrapper::new(
            config(8, 5),
            FailingEngine {
                calls: calls.clone(),
            },
        );
        tokio::spawn(processor.run_forever());

        let (a, b) = tokio::join!(
            engine.classify(request("Calm")),
            engine.classify(request("Low"))
        );
        let err = a.unwrap_err().to_string();
        assert!(err.contains("device lost"), "{err}");
        assert!(b.is_err());
        assert!(calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn closed_processor_is_an_error() {
        let (engine, processor) = BatchedEngineWrapper::new(
            config(8, 5),
            KeywordEngine {
                batch_pairs: Arc::default(),
            },
        );
        drop(processor);

        assert!(engine.classify(request("Calm")).await.is_err());
    }
}
