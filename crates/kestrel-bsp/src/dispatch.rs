//! The dispatch core: typed handler registries, a per-method FIFO message
//! pool, and the single handler lock.
//!
//! Messages are enqueued by the transport reader and executed on a small
//! worker pool, so reading continues while a handler runs. The pool
//! delivers each message at most once and preserves arrival order within a
//! method; across methods, execution is serialized by one unfair lock so
//! at most one handler body runs at a time. A handler that spawns
//! long-running work (`buildTarget/prepare`) registers as *deferred*: it
//! returns after starting the work and replies later through its
//! [`Responder`], releasing the lock so that `$/cancelRequest` can reach
//! the server mid-build.
//!
//! Initial registration happens before the reader starts and is not
//! thread-safe by contract; `build/initialize` registers the post-init
//! handlers from inside its own invocation, which runs under the handler
//! lock.

use crate::codec::sanitize_json_error_message;
use crate::outgoing::Outgoing;
use crate::rpc::{IncomingMessage, RequestId, RpcError};
use kestrel_core::{lock, wait};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread;

const POOL_WORKERS: usize = 4;

/// Hands a deferred handler the means to reply once its work completes.
pub struct Responder {
    outgoing: Outgoing,
    id: RequestId,
}

impl Responder {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn reply_ok(self, result: impl Serialize) {
        self.outgoing.respond_ok(&self.id, result);
    }

    pub fn reply_err(self, error: &RpcError) {
        self.outgoing.respond_err(&self.id, error);
    }
}

type RequestHandler = Arc<dyn Fn(&RequestId, Value, &Outgoing) + Send + Sync>;
type NotificationHandler = Arc<dyn Fn(Value) + Send + Sync>;

fn decode_params<P: DeserializeOwned>(params: Value) -> Result<P, RpcError> {
    serde_json::from_value(params)
        .map_err(|err| RpcError::InvalidParams(sanitize_json_error_message(&err.to_string())))
}

pub struct Dispatcher {
    requests: RwLock<HashMap<&'static str, RequestHandler>>,
    notifications: RwLock<HashMap<&'static str, NotificationHandler>>,
    /// The single unfair lock serializing handler bodies.
    handler_lock: Mutex<()>,
    outgoing: Outgoing,
    pool: MessagePool,
}

impl Dispatcher {
    pub fn new(outgoing: Outgoing) -> Arc<Self> {
        Arc::new(Self {
            requests: RwLock::new(HashMap::new()),
            notifications: RwLock::new(HashMap::new()),
            handler_lock: Mutex::new(()),
            outgoing,
            pool: MessagePool::new(POOL_WORKERS),
        })
    }

    pub fn outgoing(&self) -> &Outgoing {
        &self.outgoing
    }

    /// Register a request handler that replies synchronously.
    pub fn on_request<P, R, F>(&self, method: &'static str, handler: F)
    where
        P: DeserializeOwned,
        R: Serialize,
        F: Fn(P, &RequestId) -> Result<R, RpcError> + Send + Sync + 'static,
    {
        let erased: RequestHandler = Arc::new(move |id, params, outgoing| {
            match decode_params::<P>(params) {
                Ok(params) => match handler(params, id) {
                    Ok(result) => outgoing.respond_ok(id, result),
                    Err(err) => outgoing.respond_err(id, &err),
                },
                Err(err) => outgoing.respond_err(id, &err),
            }
        });
        self.register_request(method, erased);
    }

    /// Register a request handler that replies later through its
    /// [`Responder`]. An `Err` return still replies immediately.
    pub fn on_request_deferred<P, F>(&self, method: &'static str, handler: F)
    where
        P: DeserializeOwned,
        F: Fn(P, Responder) -> Result<(), RpcError> + Send + Sync + 'static,
    {
        let erased: RequestHandler = Arc::new(move |id, params, outgoing| {
            match decode_params::<P>(params) {
                Ok(params) => {
                    let responder = Responder {
                        outgoing: outgoing.clone(),
                        id: id.clone(),
                    };
                    if let Err(err) = handler(params, responder) {
                        outgoing.respond_err(id, &err);
                    }
                }
                Err(err) => outgoing.respond_err(id, &err),
            }
        });
        self.register_request(method, erased);
    }

    pub fn on_notification<P, F>(&self, method: &'static str, handler: F)
    where
        P: DeserializeOwned,
        F: Fn(P) -> Result<(), RpcError> + Send + Sync + 'static,
    {
        let erased: NotificationHandler = Arc::new(move |params| {
            match decode_params::<P>(params) {
                Ok(params) => {
                    if let Err(err) = handler(params) {
                        tracing::error!(
                            target = "kestrel.bsp",
                            method,
                            error = %err,
                            "notification handler failed"
                        );
                    }
                }
                Err(err) => {
                    tracing::error!(
                        target = "kestrel.bsp",
                        method,
                        error = %err,
                        "malformed notification params"
                    );
                }
            }
        });
        let mut notifications = self
            .notifications
            .write()
            .unwrap_or_else(|err| err.into_inner());
        notifications.insert(method, erased);
    }

    fn register_request(&self, method: &'static str, handler: RequestHandler) {
        let mut requests = self.requests.write().unwrap_or_else(|err| err.into_inner());
        requests.insert(method, handler);
    }

    /// Enqueue a transport message for execution.
    pub fn dispatch(self: &Arc<Self>, message: IncomingMessage) {
        let Some(method) = message.method.clone() else {
            // A response to a server-initiated request; we never send any.
            tracing::debug!(
                target = "kestrel.bsp",
                "ignoring response message from the client"
            );
            return;
        };
        let this = Arc::clone(self);
        self.pool
            .push(method, Box::new(move || this.run(message)));
    }

    /// Drain the pool and stop its workers. Only used by tests and orderly
    /// teardown paths; `build/exit` bypasses this entirely.
    pub fn shutdown_pool(&self) {
        self.pool.shutdown();
    }

    fn run(&self, message: IncomingMessage) {
        let method = message.method.unwrap_or_default();
        let params = message.params.unwrap_or(Value::Null);

        match message.id {
            Some(id) => {
                let handler = {
                    let requests = self.requests.read().unwrap_or_else(|err| err.into_inner());
                    requests.get(method.as_str()).cloned()
                };
                match handler {
                    Some(handler) => {
                        let _guard = lock(&self.handler_lock, "Dispatcher.request");
                        handler(&id, params, &self.outgoing);
                    }
                    None => {
                        self.outgoing
                            .respond_err(&id, &RpcError::MethodNotFound(method));
                    }
                }
            }
            None => {
                let handler = {
                    let notifications = self
                        .notifications
                        .read()
                        .unwrap_or_else(|err| err.into_inner());
                    notifications.get(method.as_str()).cloned()
                };
                match handler {
                    Some(handler) => {
                        let _guard = lock(&self.handler_lock, "Dispatcher.notification");
                        handler(params);
                    }
                    None => {
                        tracing::debug!(
                            target = "kestrel.bsp",
                            method,
                            "no handler registered for notification"
                        );
                    }
                }
            }
        }
    }
}

type Job = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct PoolState {
    /// One entry per pending job, in arrival order.
    order: VecDeque<String>,
    queues: HashMap<String, VecDeque<Job>>,
    /// Methods currently executing; at most one job per method runs at a
    /// time, which is what preserves per-method FIFO ordering.
    active: HashSet<String>,
    shutdown: bool,
}

struct PoolInner {
    state: Mutex<PoolState>,
    ready: Condvar,
}

struct MessagePool {
    inner: Arc<PoolInner>,
}

impl MessagePool {
    fn new(workers: usize) -> Self {
        let inner = Arc::new(PoolInner {
            state: Mutex::new(PoolState::default()),
            ready: Condvar::new(),
        });
        for index in 0..workers {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name(format!("kestrel-bsp-worker-{index}"))
                .spawn(move || worker_loop(inner))
                .expect("failed to spawn message pool worker");
        }
        Self { inner }
    }

    fn push(&self, method: String, job: Job) {
        let mut state = lock(&self.inner.state, "MessagePool.push");
        if state.shutdown {
            return;
        }
        state
            .queues
            .entry(method.clone())
            .or_default()
            .push_back(job);
        state.order.push_back(method);
        self.inner.ready.notify_all();
    }

    fn shutdown(&self) {
        let mut state = lock(&self.inner.state, "MessagePool.shutdown");
        state.shutdown = true;
        self.inner.ready.notify_all();
    }
}

fn worker_loop(inner: Arc<PoolInner>) {
    let mut state = lock(&inner.state, "MessagePool.worker");
    loop {
        if state.shutdown {
            return;
        }

        let claimable = state
            .order
            .iter()
            .position(|method| !state.active.contains(method));
        let Some(position) = claimable else {
            state = wait(&inner.ready, state, "MessagePool.worker");
            continue;
        };

        let method = state
            .order
            .remove(position)
            .expect("claimed position is in bounds");
        let job = state
            .queues
            .get_mut(&method)
            .and_then(|queue| queue.pop_front());
        if state
            .queues
            .get(&method)
            .is_some_and(|queue| queue.is_empty())
        {
            state.queues.remove(&method);
        }
        let Some(job) = job else {
            continue;
        };

        state.active.insert(method.clone());
        drop(state);

        job();

        state = lock(&inner.state, "MessagePool.worker");
        state.active.remove(&method);
        inner.ready.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outgoing::test_support::SharedBuffer;
    use serde_json::json;
    use std::time::{Duration, Instant};

    fn incoming(id: Option<i64>, method: &str, params: Value) -> IncomingMessage {
        IncomingMessage {
            id: id.map(RequestId::Number),
            method: Some(method.to_string()),
            params: Some(params),
        }
    }

    fn wait_for_messages(buffer: &SharedBuffer, count: usize) -> Vec<Value> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let messages = buffer.decoded_messages();
            if messages.len() >= count {
                return messages;
            }
            if Instant::now() > deadline {
                panic!("expected {count} messages, got {messages:?}");
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn dispatcher_with_buffer() -> (Arc<Dispatcher>, SharedBuffer) {
        let buffer = SharedBuffer::default();
        let dispatcher = Dispatcher::new(Outgoing::from_writer(Box::new(buffer.clone())));
        (dispatcher, buffer)
    }

    #[test]
    fn replies_preserve_per_method_order() {
        let (dispatcher, buffer) = dispatcher_with_buffer();
        dispatcher.on_request("test/echo", |params: Value, _id| Ok::<_, RpcError>(params));

        for index in 0..10 {
            dispatcher.dispatch(incoming(Some(index), "test/echo", json!(index)));
        }

        let messages = wait_for_messages(&buffer, 10);
        for (index, message) in messages.iter().enumerate() {
            assert_eq!(message["id"], json!(index as i64));
            assert_eq!(message["result"], json!(index as i64));
        }
        dispatcher.shutdown_pool();
    }

    #[test]
    fn unknown_request_method_gets_method_not_found() {
        let (dispatcher, buffer) = dispatcher_with_buffer();
        dispatcher.dispatch(incoming(Some(1), "no/such", json!(null)));

        let messages = wait_for_messages(&buffer, 1);
        assert_eq!(messages[0]["error"]["code"], json!(-32601));
        dispatcher.shutdown_pool();
    }

    #[test]
    fn malformed_params_reply_invalid_params() {
        #[derive(serde::Deserialize)]
        #[allow(dead_code)]
        struct Needs {
            field: i64,
        }

        let (dispatcher, buffer) = dispatcher_with_buffer();
        dispatcher.on_request("test/typed", |_params: Needs, _id| {
            Ok::<_, RpcError>(json!("unreachable"))
        });
        dispatcher.dispatch(incoming(Some(1), "test/typed", json!({"field": "oops"})));

        let messages = wait_for_messages(&buffer, 1);
        assert_eq!(messages[0]["error"]["code"], json!(-32602));
        dispatcher.shutdown_pool();
    }

    #[test]
    fn unknown_notifications_are_ignored_silently() {
        let (dispatcher, buffer) = dispatcher_with_buffer();
        dispatcher.dispatch(incoming(None, "no/such", json!(null)));
        dispatcher.dispatch(incoming(Some(1), "$/after", json!(null)));

        // Only the request gets a reply; the notification produces nothing.
        let messages = wait_for_messages(&buffer, 1);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["id"], json!(1));
        dispatcher.shutdown_pool();
    }

    #[test]
    fn deferred_requests_release_the_handler_lock() {
        // Mimics prepare/cancel: the deferred handler parks its responder,
        // and a later notification on another method completes the reply.
        let (dispatcher, buffer) = dispatcher_with_buffer();
        let parked: Arc<Mutex<Option<Responder>>> = Arc::new(Mutex::new(None));

        let parked_for_request = Arc::clone(&parked);
        dispatcher.on_request_deferred("test/longRunning", move |_params: Value, responder| {
            *parked_for_request.lock().unwrap() = Some(responder);
            Ok(())
        });

        let parked_for_cancel = Arc::clone(&parked);
        dispatcher.on_notification("test/complete", move |_params: Value| {
            if let Some(responder) = parked_for_cancel.lock().unwrap().take() {
                responder.reply_ok(json!("done"));
            }
            Ok(())
        });

        dispatcher.dispatch(incoming(Some(7), "test/longRunning", json!(null)));

        // The responder parks once the handler has run and released the
        // handler lock; only then is the completion notification sent.
        let deadline = Instant::now() + Duration::from_secs(5);
        while parked.lock().unwrap().is_none() {
            assert!(Instant::now() < deadline, "deferred handler never ran");
            thread::sleep(Duration::from_millis(5));
        }
        dispatcher.dispatch(incoming(None, "test/complete", json!(null)));

        let messages = wait_for_messages(&buffer, 1);
        assert_eq!(messages[0]["id"], json!(7));
        assert_eq!(messages[0]["result"], json!("done"));
        dispatcher.shutdown_pool();
    }

    #[test]
    fn handlers_can_be_registered_mid_stream() {
        // `build/initialize` registers the post-init handlers while the
        // reader is already running.
        let (dispatcher, buffer) = dispatcher_with_buffer();

        let dispatcher_for_init = Arc::downgrade(&dispatcher);
        dispatcher.on_request("test/initialize", move |_params: Value, _id| {
            if let Some(dispatcher) = dispatcher_for_init.upgrade() {
                dispatcher.on_request("test/late", |_params: Value, _id| {
                    Ok::<_, RpcError>(json!("late"))
                });
            }
            Ok::<_, RpcError>(json!("ok"))
        });

        dispatcher.dispatch(incoming(Some(1), "test/initialize", json!(null)));
        wait_for_messages(&buffer, 1);
        dispatcher.dispatch(incoming(Some(2), "test/late", json!(null)));

        let messages = wait_for_messages(&buffer, 2);
        assert_eq!(messages[1]["result"], json!("late"));
        dispatcher.shutdown_pool();
    }
}
