// Copyright (c) Mesh Contributors
// SPDX-License-Identifier: Apache-2.0

//! Streaming client for the registry store's HTTP API.
//!
//! The store speaks three operations: `exec` (writes, batched as a
//! transaction), `query` (one-shot reads), and `subscribe` (a materialized
//! query followed by an ordered stream of change events). Streams are
//! newline-delimited JSON frames.
//!
//! Subscriptions are resilient: any decode error or EOF that is not a
//! cancellation closes the current stream and resumes the subscription from
//! the last seen change id, with exponential backoff. A successful resume
//! injects one synthetic `Resync` change so consumers know to reconcile
//! against a fresh snapshot; only when the retry budget is exhausted does
//! the change channel close.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::stream::BoxStream;
use futures::StreamExt as _;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::context::Context;
use crate::error::{MeshError, MeshResult};

/// Depth of the change channel handed to a subscription consumer.
const CHANGE_CHANNEL_SIZE: usize = 64;

/// Resume policy for a broken subscription stream.
const RESUBSCRIBE_INITIAL_DELAY: Duration = Duration::from_secs(1);
const RESUBSCRIBE_MAX_DELAY: Duration = Duration::from_secs(15);
const RESUBSCRIBE_MAX_ATTEMPTS: u32 = 20;

/// Retry policy for transport-level failures of a single request.
const TRANSPORT_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const TRANSPORT_MAX_BACKOFF: Duration = Duration::from_secs(1);
const TRANSPORT_MAX_ELAPSED: Duration = Duration::from_secs(10);

/// Response header carrying the server-assigned subscription id.
const SUBSCRIPTION_ID_HEADER: &str = "corro-query-id";

/// One statement of a write transaction.
#[derive(Clone, Debug, serde::Serialize)]
pub struct Statement {
    pub query: String,
    pub params: Vec<Value>,
}

impl Statement {
    pub fn new(query: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            query: query.into(),
            params,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TransactionsResponse {
    results: Vec<ExecResult>,
}

/// Per-statement outcome of an `exec` call.
#[derive(Debug, Deserialize)]
pub struct ExecResult {
    #[serde(default)]
    pub rows_affected: u64,
    #[serde(default)]
    pub error: Option<String>,
}

/// One frame of a query or subscription stream.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum QueryFrame {
    Columns(Vec<String>),
    Row((i64, Vec<Value>)),
    Eoq(EndOfQuery),
    Change((String, i64, Vec<Value>, u64)),
    Error(String),
}

#[derive(Debug, Deserialize)]
pub(crate) struct EndOfQuery {
    #[serde(default)]
    pub time: f64,
    #[serde(default)]
    pub change_id: Option<u64>,
}

/// Kind of a change delivered on a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreChangeKind {
    Insert,
    Update,
    Delete,
    /// Synthetic: the stream was resumed and consumers should reconcile.
    Resync,
}

impl StoreChangeKind {
    fn from_wire(kind: &str) -> Self {
        // The store reports "insert" and "delete" literally; every other
        // change type is treated as an update.
        match kind {
            "insert" => StoreChangeKind::Insert,
            "delete" => StoreChangeKind::Delete,
            _ => StoreChangeKind::Update,
        }
    }
}

/// An ordered change event from a subscription.
#[derive(Clone, Debug)]
pub struct StoreChange {
    pub kind: StoreChangeKind,
    pub rowid: i64,
    pub values: Vec<Value>,
    pub change_id: u64,
}

/// An established subscription: the materialized result at subscribe time
/// plus the ordered change stream that follows it.
#[derive(Debug)]
pub struct Subscription {
    pub id: String,
    pub columns: Vec<String>,
    pub snapshot: Vec<Vec<Value>>,
    pub changes: mpsc::Receiver<StoreChange>,
}

/// Opens streams for one subscription. Split from [`StoreClient`] so the
/// resume loop can be exercised against in-memory streams.
#[async_trait]
pub(crate) trait ChangeStreamTransport: Send + Sync + 'static {
    async fn open(&self) -> MeshResult<(String, FrameStream)>;

    async fn resume(&self, id: &str, from_change_id: u64) -> MeshResult<FrameStream>;
}

pub(crate) type FrameStream = BoxStream<'static, MeshResult<QueryFrame>>;

/// Client for one store daemon's HTTP API.
pub struct StoreClient {
    context: Arc<Context>,
    http: reqwest::Client,
    api_base: Url,
}

impl StoreClient {
    pub(crate) fn new(context: Arc<Context>) -> MeshResult<Self> {
        let api_base = Url::parse(&context.parameters.store_api_addr)
            .map_err(|e| MeshError::InvalidConfig(format!("store_api_addr: {e}")))?;
        Ok(Self {
            context,
            http: reqwest::Client::new(),
            api_base,
        })
    }

    fn endpoint(&self, path: &str) -> MeshResult<Url> {
        self.api_base
            .join(path)
            .map_err(|e| MeshError::InvalidConfig(format!("store url: {e}")))
    }

    /// Executes a batch of statements as one transaction.
    pub async fn exec(&self, statements: Vec<Statement>) -> MeshResult<Vec<ExecResult>> {
        let url = self.endpoint("v1/transactions")?;
        let response = retry_transport(|| async {
            let response = self.http.post(url.clone()).json(&statements).send().await?;
            response.error_for_status().map_err(MeshError::from)
        })
        .await?;

        let body: TransactionsResponse = response
            .json()
            .await
            .map_err(|e| MeshError::Decode(e.to_string()))?;
        for result in &body.results {
            if let Some(error) = &result.error {
                return Err(MeshError::Store(error.clone()));
            }
        }
        Ok(body.results)
    }

    /// Runs a one-shot query and collects the value rows.
    pub async fn query(&self, query: &str, params: Vec<Value>) -> MeshResult<Vec<Vec<Value>>> {
        let url = self.endpoint("v1/queries")?;
        let response = retry_transport(|| async {
            let response = self
                .http
                .post(url.clone())
                .json(&serde_json::json!({ "query": query, "params": params }))
                .send()
                .await?;
            response.error_for_status().map_err(MeshError::from)
        })
        .await?;

        let mut frames = ndjson_frames(response);
        let mut rows = Vec::new();
        while let Some(frame) = frames.next().await {
            match frame? {
                QueryFrame::Columns(_) => {}
                QueryFrame::Row((_rowid, values)) => rows.push(values),
                QueryFrame::Eoq(_) => return Ok(rows),
                QueryFrame::Change(_) => {
                    return Err(MeshError::Store(
                        "unexpected change frame in query response".to_string(),
                    ));
                }
                QueryFrame::Error(error) => return Err(MeshError::Store(error)),
            }
        }
        // The server ends every query with an eoq frame.
        Err(MeshError::Network("query stream ended early".to_string()))
    }

    /// Subscribes to a query: returns the snapshot and an ordered change
    /// stream that survives stream breaks by resuming from the last seen
    /// change id. The read loop exits when `cancel` fires or the retry
    /// budget is exhausted.
    pub async fn subscribe(
        &self,
        query: &str,
        params: Vec<Value>,
        cancel: CancellationToken,
    ) -> MeshResult<Subscription> {
        let transport = Arc::new(HttpChangeStreamTransport {
            http: self.http.clone(),
            subscribe_url: self.endpoint("v1/subscriptions")?,
            query: query.to_string(),
            params,
        });
        subscribe_via(transport, self.context.clone(), cancel).await
    }
}

/// Drives a subscription over any transport: drains the snapshot, then
/// spawns the read loop that forwards ordered changes.
pub(crate) async fn subscribe_via(
    transport: Arc<dyn ChangeStreamTransport>,
    context: Arc<Context>,
    cancel: CancellationToken,
) -> MeshResult<Subscription> {
    let (id, mut frames) = transport.open().await?;

    let mut columns = Vec::new();
    let mut snapshot = Vec::new();
    let last_change_id = loop {
        match frames.next().await {
            Some(Ok(QueryFrame::Columns(c))) => columns = c,
            Some(Ok(QueryFrame::Row((_rowid, values)))) => snapshot.push(values),
            Some(Ok(QueryFrame::Eoq(eoq))) => {
                debug!(
                    subscription = %id,
                    rows = snapshot.len(),
                    query_time = eoq.time,
                    "subscription snapshot materialized"
                );
                break eoq.change_id.unwrap_or(0);
            }
            Some(Ok(QueryFrame::Change(_))) => {
                return Err(MeshError::Store(
                    "change frame before end of query".to_string(),
                ));
            }
            Some(Ok(QueryFrame::Error(error))) => return Err(MeshError::Store(error)),
            Some(Err(e)) => return Err(e),
            None => return Err(MeshError::Network("subscription stream ended early".to_string())),
        }
    };

    let (tx, rx) = mpsc::channel(CHANGE_CHANNEL_SIZE);
    let reader = SubscriptionReader {
        transport,
        context,
        id: id.clone(),
        last_change_id,
        tx,
        cancel,
    };
    tokio::spawn(reader.run(frames));

    Ok(Subscription {
        id,
        columns,
        snapshot,
        changes: rx,
    })
}

struct SubscriptionReader {
    transport: Arc<dyn ChangeStreamTransport>,
    context: Arc<Context>,
    id: String,
    last_change_id: u64,
    tx: mpsc::Sender<StoreChange>,
    cancel: CancellationToken,
}

impl SubscriptionReader {
    async fn run(mut self, mut frames: FrameStream) {
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(subscription = %self.id, "subscription cancelled");
                    return;
                }
                frame = frames.next() => frame,
            };

            match frame {
                Some(Ok(QueryFrame::Change((kind, rowid, values, change_id)))) => {
                    self.last_change_id = change_id;
                    let change = StoreChange {
                        kind: StoreChangeKind::from_wire(&kind),
                        rowid,
                        values,
                        change_id,
                    };
                    if self.forward(change).await.is_err() {
                        // Consumer went away; nothing left to do.
                        return;
                    }
                }
                // Row and metadata frames can replay at the head of a
                // resumed stream; they carry nothing new.
                Some(Ok(QueryFrame::Columns(_)))
                | Some(Ok(QueryFrame::Row(_)))
                | Some(Ok(QueryFrame::Eoq(_))) => {}
                Some(Ok(QueryFrame::Error(error))) => {
                    warn!(subscription = %self.id, error, "subscription reported an error");
                    match self.resubscribe().await {
                        Some(stream) => frames = stream,
                        None => return,
                    }
                }
                Some(Err(e)) => {
                    warn!(subscription = %self.id, error = %e, "subscription stream failed");
                    match self.resubscribe().await {
                        Some(stream) => frames = stream,
                        None => return,
                    }
                }
                None => {
                    warn!(subscription = %self.id, "subscription stream closed by server");
                    match self.resubscribe().await {
                        Some(stream) => frames = stream,
                        None => return,
                    }
                }
            }
        }
    }

    /// Re-establishes the stream past `last_change_id`. Returns `None` once
    /// the retry budget is exhausted or the consumer is gone; the change
    /// channel closes when `self.tx` drops.
    async fn resubscribe(&mut self) -> Option<FrameStream> {
        let metrics = &self.context.metrics.node_metrics;
        let mut delay = RESUBSCRIBE_INITIAL_DELAY;
        for attempt in 1..=RESUBSCRIBE_MAX_ATTEMPTS {
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.transport.resume(&self.id, self.last_change_id).await {
                Ok(stream) => {
                    metrics.resubscribe_attempts.with_label_values(&["ok"]).inc();
                    info!(
                        subscription = %self.id,
                        from_change_id = self.last_change_id,
                        attempt,
                        "subscription resumed"
                    );
                    let resync = StoreChange {
                        kind: StoreChangeKind::Resync,
                        rowid: 0,
                        values: vec![],
                        change_id: self.last_change_id,
                    };
                    if self.forward(resync).await.is_err() {
                        return None;
                    }
                    return Some(stream);
                }
                Err(e) => {
                    metrics
                        .resubscribe_attempts
                        .with_label_values(&["error"])
                        .inc();
                    warn!(
                        subscription = %self.id,
                        attempt,
                        error = %e,
                        "failed to resume subscription"
                    );
                    delay = (delay * 2).min(RESUBSCRIBE_MAX_DELAY);
                }
            }
        }
        metrics
            .resubscribe_attempts
            .with_label_values(&["exhausted"])
            .inc();
        warn!(subscription = %self.id, "resubscription budget exhausted, closing stream");
        None
    }

    async fn forward(&self, change: StoreChange) -> Result<(), ()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(()),
            sent = self.tx.send(change) => sent.map_err(|_| ()),
        }
    }
}

struct HttpChangeStreamTransport {
    http: reqwest::Client,
    subscribe_url: Url,
    query: String,
    params: Vec<Value>,
}

#[async_trait]
impl ChangeStreamTransport for HttpChangeStreamTransport {
    async fn open(&self) -> MeshResult<(String, FrameStream)> {
        let response = retry_transport(|| async {
            let response = self
                .http
                .post(self.subscribe_url.clone())
                .json(&serde_json::json!({ "query": self.query, "params": self.params }))
                .send()
                .await?;
            response.error_for_status().map_err(MeshError::from)
        })
        .await?;

        let id = response
            .headers()
            .get(SUBSCRIPTION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                MeshError::Store(format!("missing {SUBSCRIPTION_ID_HEADER} header"))
            })?;
        Ok((id, ndjson_frames(response)))
    }

    async fn resume(&self, id: &str, from_change_id: u64) -> MeshResult<FrameStream> {
        let mut url = self
            .subscribe_url
            .join(&format!("subscriptions/{id}"))
            .map_err(|e| MeshError::InvalidConfig(format!("store url: {e}")))?;
        url.query_pairs_mut()
            .append_pair("from", &from_change_id.to_string());

        let response = self.http.get(url).send().await?;
        let response = response.error_for_status()?;
        Ok(ndjson_frames(response))
    }
}

/// Splits a response body into newline-delimited JSON frames.
fn ndjson_frames(response: reqwest::Response) -> FrameStream {
    let body = response.bytes_stream();
    let state = (body, BytesMut::new(), false);
    futures::stream::unfold(state, |(mut body, mut buffer, mut done)| async move {
        loop {
            if let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
                let mut line = buffer.split_to(newline + 1);
                line.truncate(newline);
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                let frame = serde_json::from_slice::<QueryFrame>(&line)
                    .map_err(|e| MeshError::Decode(format!("bad stream frame: {e}")));
                return Some((frame, (body, buffer, done)));
            }
            if done {
                // Trailing partial line without a newline is a broken frame.
                if buffer.iter().any(|b| !b.is_ascii_whitespace()) {
                    buffer.clear();
                    return Some((
                        Err(MeshError::Network("stream ended mid-frame".to_string())),
                        (body, buffer, done),
                    ));
                }
                return None;
            }
            match body.next().await {
                Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    done = true;
                    buffer.clear();
                    return Some((Err(MeshError::from(e)), (body, buffer, done)));
                }
                None => done = true,
            }
        }
    })
    .boxed()
}

/// Retries transport-level failures with short exponential backoff.
/// Application-level failures (HTTP status errors) are permanent.
async fn retry_transport<T, F, Fut>(operation: F) -> MeshResult<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = MeshResult<T>>,
{
    let policy = backoff::ExponentialBackoff {
        initial_interval: TRANSPORT_INITIAL_BACKOFF,
        max_interval: TRANSPORT_MAX_BACKOFF,
        max_elapsed_time: Some(TRANSPORT_MAX_ELAPSED),
        ..Default::default()
    };
    backoff::future::retry(policy, || async {
        operation().await.map_err(|e| match e {
            MeshError::Network(_) => backoff::Error::transient(e),
            other => backoff::Error::permanent(other),
        })
    })
    .await
}

#[cfg(test)]
mod test {
    use parking_lot::Mutex;

    use super::*;
    use crate::context::Context;

    fn frame(json: &str) -> MeshResult<QueryFrame> {
        serde_json::from_str(json).map_err(|e| MeshError::Decode(e.to_string()))
    }

    /// A transport whose open/resume calls pop scripted frame batches.
    struct FakeTransport {
        opens: Mutex<Vec<Vec<MeshResult<QueryFrame>>>>,
        resumes: Mutex<Vec<MeshResult<Vec<MeshResult<QueryFrame>>>>>,
        resume_calls: Mutex<Vec<u64>>,
    }

    impl FakeTransport {
        fn new(
            opens: Vec<Vec<MeshResult<QueryFrame>>>,
            resumes: Vec<MeshResult<Vec<MeshResult<QueryFrame>>>>,
        ) -> Self {
            Self {
                opens: Mutex::new(opens),
                resumes: Mutex::new(resumes),
                resume_calls: Mutex::new(vec![]),
            }
        }
    }

    #[async_trait]
    impl ChangeStreamTransport for FakeTransport {
        async fn open(&self) -> MeshResult<(String, FrameStream)> {
            let frames = self.opens.lock().remove(0);
            Ok(("sub-1".to_string(), futures::stream::iter(frames).boxed()))
        }

        async fn resume(&self, _id: &str, from_change_id: u64) -> MeshResult<FrameStream> {
            self.resume_calls.lock().push(from_change_id);
            let next = {
                let mut resumes = self.resumes.lock();
                if resumes.is_empty() {
                    None
                } else {
                    Some(resumes.remove(0))
                }
            };
            match next {
                Some(Ok(frames)) => Ok(futures::stream::iter(frames).boxed()),
                Some(Err(e)) => Err(e),
                None => Err(MeshError::Network("no more scripted streams".to_string())),
            }
        }
    }

    fn change(kind: &str, rowid: i64, change_id: u64) -> MeshResult<QueryFrame> {
        frame(&format!(
            r#"{{"change": ["{kind}", {rowid}, ["a"], {change_id}]}}"#
        ))
    }

    async fn collect_changes(mut subscription: Subscription) -> Vec<StoreChange> {
        let mut out = Vec::new();
        while let Some(change) = subscription.changes.recv().await {
            out.push(change);
        }
        out
    }

    fn failing_resumes(n: u32) -> Vec<MeshResult<Vec<MeshResult<QueryFrame>>>> {
        (0..n)
            .map(|_| Err(MeshError::Network("down".to_string())))
            .collect()
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn snapshot_then_ordered_changes() {
        let transport = Arc::new(FakeTransport::new(
            vec![vec![
                frame(r#"{"columns": ["id"]}"#),
                frame(r#"{"row": [1, ["alpha"]]}"#),
                frame(r#"{"row": [2, ["beta"]]}"#),
                frame(r#"{"eoq": {"time": 0.1, "change_id": 5}}"#),
                change("insert", 3, 6),
                change("update", 3, 7),
            ]],
            failing_resumes(RESUBSCRIBE_MAX_ATTEMPTS),
        ));
        let context = Arc::new(Context::new_for_test().0);

        let subscription =
            subscribe_via(transport.clone(), context, CancellationToken::new())
                .await
                .unwrap();
        assert_eq!(subscription.id, "sub-1");
        assert_eq!(subscription.columns, vec!["id".to_string()]);
        assert_eq!(subscription.snapshot.len(), 2);

        // Drain: two changes, then the stream ends and resume fails out.
        let changes = collect_changes(subscription).await;
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].kind, StoreChangeKind::Insert);
        assert_eq!(changes[0].change_id, 6);
        assert_eq!(changes[1].kind, StoreChangeKind::Update);
        assert_eq!(changes[1].change_id, 7);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn resumes_from_last_change_id_and_emits_resync() {
        let transport = Arc::new(FakeTransport::new(
            vec![vec![
                frame(r#"{"eoq": {"time": 0.0, "change_id": 4}}"#),
                change("insert", 1, 5),
                // Stream breaks here (EOF).
            ]],
            vec![Ok(vec![change("update", 1, 6), change("delete", 1, 7)])],
        ));
        let context = Arc::new(Context::new_for_test().0);

        let subscription =
            subscribe_via(transport.clone(), context, CancellationToken::new())
                .await
                .unwrap();
        let changes = collect_changes(subscription).await;

        let kinds: Vec<StoreChangeKind> = changes.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![
                StoreChangeKind::Insert,
                StoreChangeKind::Resync,
                StoreChangeKind::Update,
                StoreChangeKind::Delete,
            ]
        );
        // Resumed past the last change seen before the break.
        assert_eq!(transport.resume_calls.lock()[0], 5);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn retries_with_backoff_then_gives_up() {
        let transport = Arc::new(FakeTransport::new(
            vec![vec![frame(r#"{"eoq": {"time": 0.0, "change_id": 1}}"#)]],
            failing_resumes(RESUBSCRIBE_MAX_ATTEMPTS),
        ));
        let context = Arc::new(Context::new_for_test().0);

        let subscription =
            subscribe_via(transport.clone(), context, CancellationToken::new())
                .await
                .unwrap();
        // Channel closes only after every attempt failed.
        let changes = collect_changes(subscription).await;
        assert!(changes.is_empty());
        assert_eq!(
            transport.resume_calls.lock().len(),
            RESUBSCRIBE_MAX_ATTEMPTS as usize
        );
    }

    #[test]
    fn unknown_change_type_maps_to_update() {
        assert_eq!(StoreChangeKind::from_wire("insert"), StoreChangeKind::Insert);
        assert_eq!(StoreChangeKind::from_wire("delete"), StoreChangeKind::Delete);
        assert_eq!(StoreChangeKind::from_wire("update"), StoreChangeKind::Update);
        assert_eq!(
            StoreChangeKind::from_wire("column_change"),
            StoreChangeKind::Update
        );
    }

    #[tokio::test]
    async fn error_frame_before_eoq_fails_subscribe() {
        let transport = Arc::new(FakeTransport::new(
            vec![vec![frame(r#"{"error": "no such table"}"#)]],
            vec![],
        ));
        let context = Arc::new(Context::new_for_test().0);
        let err = subscribe_via(transport, context, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Store(_)));
    }

    #[test]
    fn frame_decoding() {
        assert!(matches!(
            frame(r#"{"columns": ["id", "name"]}"#).unwrap(),
            QueryFrame::Columns(c) if c.len() == 2
        ));
        assert!(matches!(
            frame(r#"{"row": [7, ["x", null, 3]]}"#).unwrap(),
            QueryFrame::Row((7, values)) if values.len() == 3
        ));
        assert!(matches!(
            frame(r#"{"eoq": {"time": 1.5, "change_id": 42}}"#).unwrap(),
            QueryFrame::Eoq(EndOfQuery { change_id: Some(42), .. })
        ));
        assert!(matches!(
            frame(r#"{"change": ["insert", 9, ["x"], 10]}"#).unwrap(),
            QueryFrame::Change((kind, 9, _, 10)) if kind == "insert"
        ));
        assert!(frame("not json").is_err());
    }
}
