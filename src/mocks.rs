// Scripted in-memory collaborators - no network, no disk

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::checkpoint::InMemoryCheckpointStore;
use crate::clock::{Clock, ManualClock};
use crate::collaborators::{
    BlobRef, BlobStore, CollaboratorError, Collaborators, ContentCollaborators, ExternalJobStatus,
    ExternalScheduler, InferenceRequest, InferenceService, JobStatusReport, MessagingCollaborator,
    NotificationPayload, ReportModel, UserIdentity,
};
use crate::config::RelayConfig;
use crate::continuation::{
    build_scheduler, ContinuationRequest, ContinuationScheduler, ContinuationWorker,
    DelayedTaskQueue, SuspendReason,
};
use crate::coordinator::{InvocationRequest, InvocationResponse, WorkflowCoordinator};
use crate::orders::{InMemoryOrderStore, Order, OrderStatus, OrderStore};
use crate::stages::Stage;

pub const LOAD_INPUT_DATA: &str = "load_input_data";
pub const COMPUTE_BASELINE: &str = "compute_baseline_analysis";
pub const RENDER_DOCUMENT: &str = "render_document";
pub const GET_USER_IDENTITY: &str = "get_user_identity";
pub const DELIVER_NOTIFICATION: &str = "deliver_notification";
pub const SUBMIT_BATCH_JOB: &str = "submit_batch_job";
pub const GET_JOB_STATUS: &str = "get_job_status";
pub const FETCH_RESULT: &str = "fetch_result";
pub const BLOB_PUT: &str = "blob_put";
pub const BLOB_GET: &str = "blob_get";
pub const DISPATCH_EVENT: &str = "dispatch_event";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Every external collaborator in one scripted double.
///
/// Calls are recorded by operation name. Each operation can be given a
/// latency, which advances the shared [`ManualClock`], and a queue of
/// failures returned before it starts succeeding again.
pub struct ScriptedCollaborators {
    clock: Arc<ManualClock>,
    latencies: Mutex<HashMap<&'static str, Duration>>,
    failures: Mutex<HashMap<&'static str, VecDeque<CollaboratorError>>>,
    job_statuses: Mutex<VecDeque<ExternalJobStatus>>,
    inference_payload: Mutex<String>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    forget_blobs: AtomicBool,
    notifications: Mutex<Vec<(String, NotificationPayload)>>,
    dispatched: Mutex<Vec<(String, Value)>>,
    relay: Mutex<Option<Arc<DelayedTaskQueue>>>,
    calls: Mutex<Vec<&'static str>>,
    next_id: Mutex<u64>,
}

impl ScriptedCollaborators {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            latencies: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            job_statuses: Mutex::new(VecDeque::new()),
            inference_payload: Mutex::new(
                json!({"summary": "steady growth", "themes": ["focus", "patience"]}).to_string(),
            ),
            blobs: Mutex::new(HashMap::new()),
            forget_blobs: AtomicBool::new(false),
            notifications: Mutex::new(Vec::new()),
            dispatched: Mutex::new(Vec::new()),
            relay: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            next_id: Mutex::new(0),
        }
    }

    /// Bundle this double as the coordinator's collaborators.
    pub fn collaborators(self: &Arc<Self>) -> Collaborators {
        Collaborators {
            content: self.clone(),
            messaging: self.clone(),
            inference: self.clone(),
            blobs: self.clone(),
        }
    }

    pub fn clock(&self) -> &Arc<ManualClock> {
        &self.clock
    }

    pub fn set_latency(&self, operation: &'static str, latency: Duration) {
        lock(&self.latencies).insert(operation, latency);
    }

    /// Latencies that make stages 1 and 2 cost 5s and 15s.
    pub fn with_stage_latencies(self) -> Self {
        self.set_latency(LOAD_INPUT_DATA, Duration::from_secs(5));
        self.set_latency(COMPUTE_BASELINE, Duration::from_secs(15));
        self
    }

    pub fn fail_next(&self, operation: &'static str, error: CollaboratorError) {
        lock(&self.failures)
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    pub fn fail_times(&self, operation: &'static str, times: usize, error: CollaboratorError) {
        for _ in 0..times {
            self.fail_next(operation, error.clone());
        }
    }

    /// Statuses returned by successive polls; `completed` once exhausted.
    pub fn script_job_statuses(&self, statuses: impl IntoIterator<Item = ExternalJobStatus>) {
        lock(&self.job_statuses).extend(statuses);
    }

    pub fn pending_polls(&self, count: usize) {
        self.script_job_statuses(std::iter::repeat(ExternalJobStatus::Pending).take(count));
    }

    pub fn set_inference_payload(&self, payload: impl Into<String>) {
        *lock(&self.inference_payload) = payload.into();
    }

    /// Re-queue dispatched `report.continue` events on `queue`, the way an
    /// external scheduler would call back.
    pub fn relay_dispatches_to(&self, queue: Arc<DelayedTaskQueue>) {
        *lock(&self.relay) = Some(queue);
    }

    pub fn drop_blob(&self, blob_ref: &str) -> bool {
        lock(&self.blobs).remove(blob_ref).is_some()
    }

    /// Accept every put but answer every get with a miss.
    pub fn forget_blobs(&self) {
        self.forget_blobs.store(true, Ordering::SeqCst);
    }

    pub fn blob(&self, blob_ref: &str) -> Option<Vec<u8>> {
        lock(&self.blobs).get(blob_ref).cloned()
    }

    pub fn notifications(&self) -> Vec<(String, NotificationPayload)> {
        lock(&self.notifications).clone()
    }

    pub fn dispatched(&self) -> Vec<(String, Value)> {
        lock(&self.dispatched).clone()
    }

    pub fn calls(&self) -> Vec<&'static str> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        lock(&self.calls).iter().filter(|call| **call == operation).count()
    }

    fn enter(&self, operation: &'static str) -> Result<(), CollaboratorError> {
        lock(&self.calls).push(operation);

        let latency = lock(&self.latencies).get(operation).copied();
        if let Some(latency) = latency {
            self.clock.advance(latency);
        }

        match lock(&self.failures).get_mut(operation).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        let mut next = lock(&self.next_id);
        *next += 1;
        format!("{prefix}-{}", *next)
    }
}

impl std::fmt::Debug for ScriptedCollaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedCollaborators")
            .field("calls", &lock(&self.calls).len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ContentCollaborators for ScriptedCollaborators {
    async fn load_input_data(&self, user_id: &str) -> Result<Value, CollaboratorError> {
        self.enter(LOAD_INPUT_DATA)?;
        Ok(json!({"user_id": user_id, "birth_date": "1990-04-12", "full_name": "Ada Lovelace"}))
    }

    async fn compute_baseline_analysis(&self, input: &Value) -> Result<Value, CollaboratorError> {
        self.enter(COMPUTE_BASELINE)?;
        let name_len = input["full_name"].as_str().map(str::len).unwrap_or(0);
        Ok(json!({"life_path": name_len % 9 + 1, "source": input["user_id"]}))
    }

    async fn render_document(&self, model: &ReportModel) -> Result<Vec<u8>, CollaboratorError> {
        self.enter(RENDER_DOCUMENT)?;
        let body = json!({
            "order_id": model.order_id,
            "baseline": model.baseline,
            "insight": model.insight,
        });
        Ok(format!("%PDF-1.7\n{body}").into_bytes())
    }
}

#[async_trait]
impl MessagingCollaborator for ScriptedCollaborators {
    async fn get_user_identity(&self, user_id: &str) -> Result<UserIdentity, CollaboratorError> {
        self.enter(GET_USER_IDENTITY)?;
        Ok(UserIdentity {
            user_id: user_id.to_string(),
            display_name: Some("Ada".to_string()),
            channel_address: Some(format!("chat:{user_id}")),
        })
    }

    async fn deliver_notification(
        &self,
        user_id: &str,
        payload: &NotificationPayload,
    ) -> Result<(), CollaboratorError> {
        self.enter(DELIVER_NOTIFICATION)?;
        lock(&self.notifications).push((user_id.to_string(), payload.clone()));
        Ok(())
    }
}

#[async_trait]
impl InferenceService for ScriptedCollaborators {
    async fn submit_batch_job(&self, request: &InferenceRequest) -> Result<String, CollaboratorError> {
        self.enter(SUBMIT_BATCH_JOB)?;
        Ok(self.next_id(&format!("job-{}", request.order_id)))
    }

    async fn get_job_status(&self, job_id: &str) -> Result<JobStatusReport, CollaboratorError> {
        self.enter(GET_JOB_STATUS)?;
        let status = lock(&self.job_statuses)
            .pop_front()
            .unwrap_or(ExternalJobStatus::Completed);
        let result_ref = (status == ExternalJobStatus::Completed).then(|| format!("{job_id}/result"));
        Ok(JobStatusReport { status, result_ref })
    }

    async fn fetch_result(&self, _result_ref: &str) -> Result<String, CollaboratorError> {
        self.enter(FETCH_RESULT)?;
        Ok(lock(&self.inference_payload).clone())
    }
}

#[async_trait]
impl BlobStore for ScriptedCollaborators {
    async fn put(&self, bytes: Vec<u8>, _content_type: &str) -> Result<BlobRef, CollaboratorError> {
        self.enter(BLOB_PUT)?;
        let blob_ref = self.next_id("blob");
        lock(&self.blobs).insert(blob_ref.clone(), bytes);
        Ok(blob_ref)
    }

    async fn get(&self, blob_ref: &str) -> Result<Option<Vec<u8>>, CollaboratorError> {
        self.enter(BLOB_GET)?;
        if self.forget_blobs.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(self.blob(blob_ref))
    }
}

#[async_trait]
impl ExternalScheduler for ScriptedCollaborators {
    async fn dispatch_event(&self, event_type: &str, payload: Value) -> Result<(), CollaboratorError> {
        self.enter(DISPATCH_EVENT)?;
        lock(&self.dispatched).push((event_type.to_string(), payload.clone()));

        let relay = lock(&self.relay).clone();
        if let Some(queue) = relay {
            let request = ContinuationRequest {
                task_id: payload["task_id"].as_str().unwrap_or_default().to_string(),
                resume_hint: payload["resume_hint"]
                    .as_u64()
                    .and_then(|n| u8::try_from(n).ok())
                    .and_then(Stage::from_number),
                delay: Duration::from_secs(payload["delay_secs"].as_u64().unwrap_or(0)),
                reason: serde_json::from_value(payload["reason"].clone())
                    .unwrap_or(SuspendReason::AwaitingExternalJob),
            };
            queue
                .schedule(&request)
                .await
                .map_err(|e| CollaboratorError::Unavailable(e.to_string()))?;
        }
        Ok(())
    }
}

/// A complete in-memory deployment driven by a manual clock.
///
/// Continuations flow through a [`DelayedTaskQueue`] drained by a
/// [`ContinuationWorker`]; [`run_until_idle`](Self::run_until_idle) jumps the
/// clock to each due time instead of sleeping.
pub struct SimulationHarness {
    pub clock: Arc<ManualClock>,
    pub collaborators: Arc<ScriptedCollaborators>,
    pub orders: Arc<InMemoryOrderStore>,
    pub checkpoints: Arc<InMemoryCheckpointStore>,
    pub queue: Arc<DelayedTaskQueue>,
    pub coordinator: Arc<WorkflowCoordinator>,
    worker: ContinuationWorker,
}

impl SimulationHarness {
    pub fn new(config: RelayConfig) -> Self {
        let clock = Arc::new(ManualClock::starting_now());
        let collaborators = Arc::new(ScriptedCollaborators::new(clock.clone()));
        Self::with_collaborators(config, collaborators)
    }

    pub fn with_collaborators(config: RelayConfig, collaborators: Arc<ScriptedCollaborators>) -> Self {
        let clock = collaborators.clock().clone();
        let orders = Arc::new(InMemoryOrderStore::new());
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        let queue = Arc::new(DelayedTaskQueue::new(clock.clone()));
        collaborators.relay_dispatches_to(queue.clone());

        let scheduler = build_scheduler(
            &config.continuation,
            queue.clone(),
            Some(collaborators.clone() as Arc<dyn ExternalScheduler>),
        );
        let coordinator = Arc::new(WorkflowCoordinator::new(
            collaborators.collaborators(),
            orders.clone(),
            checkpoints.clone(),
            scheduler,
            clock.clone(),
            config.workflow,
        ));
        let worker = ContinuationWorker::new(
            queue.clone(),
            coordinator.clone(),
            config.continuation.worker_poll_interval(),
        );

        Self {
            clock,
            collaborators,
            orders,
            checkpoints,
            queue,
            coordinator,
            worker,
        }
    }

    pub async fn seed_paid_order(&self, order_id: &str, user_id: &str) -> Order {
        let order = Order::new(order_id, user_id).with_status(OrderStatus::Paid);
        // InMemoryOrderStore::insert cannot fail
        let _ = self.orders.insert(order.clone()).await;
        order
    }

    pub async fn invoke(&self, task_id: &str) -> InvocationResponse {
        self.coordinator.invoke(InvocationRequest::new(task_id)).await
    }

    /// Invoke once, then keep draining continuations until none are queued or
    /// `max_invocations` is reached.
    pub async fn run_until_idle(&self, task_id: &str, max_invocations: usize) -> Vec<InvocationResponse> {
        let mut responses = vec![self.invoke(task_id).await];

        while responses.len() < max_invocations {
            let Some(due_at) = self.queue.next_due_at().await else {
                break;
            };
            if due_at > self.clock.now() {
                self.clock.set(due_at);
            }
            responses.extend(self.worker.drain_due().await);
        }
        responses
    }
}

impl std::fmt::Debug for SimulationHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationHarness").finish_non_exhaustive()
    }
}
