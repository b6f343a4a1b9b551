//! MongoDB ingestion source.
//!
//! Fuses two producers into one bounded operation channel: an optional
//! backfill (concurrent full scans of every configured namespace) and the
//! change tail (per-namespace change streams, or a single tailable cursor on
//! the oplog). A forwarding stage applies the filter chain and view
//! resolution before operations reach the workers; once the source is
//! stopped, producers quit and the channel closes after its buffer drains.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use mongodb::bson::{doc, Bson, Document, Timestamp};
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType, ResumeToken};
use mongodb::options::{ChangeStreamOptions, CursorType, FullDocumentType};
use mongodb::{Client, Collection};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mongoflux_core::{
    ErrRx, ErrTx, MeasurementSet, Namespace, OpKind, OpOrigin, OpRx, Operation, ResumeCursor,
    INTERNAL_DB,
};

use crate::resume::{next_after, ResumePoint};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Ingestion settings, resolved from the run configuration.
#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub channel_size: usize,
    pub buffer_size: usize,
    pub buffer_duration: Duration,
    pub direct_reads: bool,
    pub change_streams: bool,
    pub oplog_database: String,
    pub oplog_collection: String,
    pub resume: ResumePoint,
}

/// The streams a started source exposes to the rest of the pipeline.
pub struct SourceChannels {
    pub ops: OpRx,
    pub errors: ErrRx,
    pub backfill_done: watch::Receiver<bool>,
}

pub struct MongoSource {
    client: Client,
    measurements: Arc<MeasurementSet>,
    settings: SourceSettings,
    cancel: CancellationToken,
}

impl MongoSource {
    pub fn new(client: Client, measurements: Arc<MeasurementSet>, settings: SourceSettings) -> Self {
        Self {
            client,
            measurements,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    /// Spawn all producer tasks and the forwarding stage.
    pub fn start(&self) -> SourceChannels {
        let capacity = self.settings.channel_size.max(1);
        let (op_tx, op_rx) = async_channel::bounded(capacity);
        let (err_tx, err_rx) = async_channel::bounded(capacity);
        let (raw_tx, raw_rx) = mpsc::channel::<Operation>(capacity);
        let (done_tx, done_rx) = watch::channel(false);

        if self.settings.direct_reads {
            let mut scans = JoinSet::new();
            for ns in self.measurements.namespaces() {
                scans.spawn(scan_namespace(
                    self.client.clone(),
                    ns.clone(),
                    raw_tx.clone(),
                    err_tx.clone(),
                    self.cancel.clone(),
                ));
            }
            tokio::spawn(async move {
                while scans.join_next().await.is_some() {}
                info!("backfill complete");
                let _ = done_tx.send(true);
            });
        }

        if self.settings.change_streams {
            for ns in self.measurements.namespaces() {
                let resume_after = match &self.settings.resume {
                    ResumePoint::Tokens(tokens) => tokens.get(&ns.to_string()).cloned(),
                    _ => None,
                };
                // Change streams cannot rewind past the oplog anyway; a
                // zero replay timestamp just means "no start position".
                let start_at = match &self.settings.resume {
                    ResumePoint::Timestamp(ts) if ts.time > 0 => Some(*ts),
                    _ => None,
                };
                tokio::spawn(tail_change_stream(
                    self.client.clone(),
                    ns.clone(),
                    resume_after,
                    start_at,
                    raw_tx.clone(),
                    err_tx.clone(),
                    self.cancel.clone(),
                ));
            }
        } else {
            tokio::spawn(tail_oplog(
                self.client.clone(),
                self.settings.clone(),
                raw_tx.clone(),
                err_tx.clone(),
                self.cancel.clone(),
            ));
        }

        tokio::spawn(forward(
            self.client.clone(),
            Arc::clone(&self.measurements),
            self.settings.change_streams,
            raw_rx,
            op_tx,
        ));

        SourceChannels {
            ops: op_rx,
            errors: err_rx,
            backfill_done: done_rx,
        }
    }

    /// Stop all producers. The op channel closes once its buffer drains.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

/// The filter chain applied to every operation before it reaches the worker
/// pool. Order matters: internal-database traffic is never replicated,
/// undeclared namespaces are dropped unless change streams already constrain
/// them server-side, and only inserts and updates pass.
fn passes_filters(op: &Operation, measurements: &MeasurementSet, change_streams: bool) -> bool {
    if op.ns.db == INTERNAL_DB {
        return false;
    }
    if !change_streams && !measurements.contains(&op.ns) {
        return false;
    }
    matches!(op.kind, OpKind::Insert | OpKind::Update)
}

/// Forwarding stage: filter chain, then view resolution, then the shared op
/// channel. Runs until the raw channel closes so cancellation drains the
/// internal buffer instead of dropping it.
async fn forward(
    client: Client,
    measurements: Arc<MeasurementSet>,
    change_streams: bool,
    mut raw_rx: mpsc::Receiver<Operation>,
    op_tx: async_channel::Sender<Operation>,
) {
    while let Some(mut op) = raw_rx.recv().await {
        if !passes_filters(&op, &measurements, change_streams) {
            continue;
        }
        if let Some(m) = measurements.get(&op.ns) {
            if let (Some(view), OpOrigin::ChangeTail) = (&m.view, op.origin) {
                // The change event is only a notification here; the view is
                // the source of truth for the payload.
                match lookup_document(&client, view, &op.id).await {
                    Ok(Some(doc)) => {
                        op.doc = doc;
                        op.origin = OpOrigin::Backfill;
                    }
                    Ok(None) => {
                        warn!(ns = %op.ns, view = %view, "document missing from view, dropping operation");
                        continue;
                    }
                    Err(e) => {
                        warn!(ns = %op.ns, view = %view, error = %format!("{e:#}"), "view lookup failed, dropping operation");
                        continue;
                    }
                }
            }
        }
        if op_tx.send(op).await.is_err() {
            break;
        }
    }
    debug!("ingestion source drained");
}

async fn lookup_document(client: &Client, ns: &Namespace, id: &Bson) -> anyhow::Result<Option<Document>> {
    let coll: Collection<Document> = client.database(&ns.db).collection(&ns.coll);
    Ok(coll.find_one(doc! {"_id": id.clone()}).await?)
}

/// Full scan of one namespace. Operations carry the current source time and
/// the backfill origin tag.
async fn scan_namespace(
    client: Client,
    ns: Namespace,
    tx: mpsc::Sender<Operation>,
    errs: ErrTx,
    cancel: CancellationToken,
) {
    debug!(ns = %ns, "backfill scan starting");
    let coll: Collection<Document> = client.database(&ns.db).collection(&ns.coll);
    let mut cursor = match coll.find(doc! {}).await {
        Ok(cursor) => cursor,
        Err(e) => {
            let _ = errs.send(anyhow::Error::new(e)).await;
            return;
        }
    };
    let mut count = 0_u64;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = cursor.next() => match next {
                Some(Ok(doc)) => {
                    let op = Operation {
                        id: doc.get("_id").cloned().unwrap_or(Bson::Null),
                        ns: ns.clone(),
                        kind: OpKind::Insert,
                        ts: now_timestamp(),
                        doc,
                        origin: OpOrigin::Backfill,
                        cursor: None,
                    };
                    if tx.send(op).await.is_err() {
                        return;
                    }
                    count += 1;
                }
                Some(Err(e)) => {
                    let _ = errs.send(anyhow::Error::new(e)).await;
                }
                None => break,
            }
        }
    }
    info!(ns = %ns, documents = count, "backfill scan finished");
}

/// Tail one namespace's change stream, reconnecting with backoff and
/// carrying the resume token forward across reconnects.
async fn tail_change_stream(
    client: Client,
    ns: Namespace,
    stored_token: Option<Bson>,
    mut start_at: Option<Timestamp>,
    tx: mpsc::Sender<Operation>,
    errs: ErrTx,
    cancel: CancellationToken,
) {
    let stream_id = ns.to_string();
    let coll: Collection<Document> = client.database(&ns.db).collection(&ns.coll);
    let mut resume_after: Option<ResumeToken> = stored_token.and_then(|token| {
        match mongodb::bson::from_bson(token) {
            Ok(token) => Some(token),
            Err(e) => {
                warn!(ns = %ns, error = %e, "stored resume token is unreadable, starting at head");
                None
            }
        }
    });
    let mut backoff = INITIAL_BACKOFF;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        let mut options = ChangeStreamOptions::builder()
            .full_document(Some(FullDocumentType::UpdateLookup))
            .build();
        options.resume_after = resume_after.clone();
        if resume_after.is_none() {
            options.start_at_operation_time = start_at;
        }
        let pipeline =
            vec![doc! {"$match": {"operationType": {"$in": ["insert", "update", "replace"]}}}];

        let open = async { coll.watch().pipeline(pipeline).with_options(options).await };
        let opened = tokio::select! {
            _ = cancel.cancelled() => break,
            opened = open => opened,
        };
        let mut stream = match opened {
            Ok(stream) => {
                debug!(ns = %ns, "change stream opened");
                backoff = INITIAL_BACKOFF;
                stream
            }
            Err(e) => {
                let _ = errs.send(anyhow::Error::new(e)).await;
                if sleep_or_cancelled(backoff, &cancel).await {
                    break;
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(event)) => {
                    resume_after = Some(event.id.clone());
                    start_at = None;
                    if let Some(op) = event_to_operation(event, &ns, &stream_id) {
                        if tx.send(op).await.is_err() {
                            return;
                        }
                    }
                }
                Some(Err(e)) => {
                    let _ = errs.send(anyhow::Error::new(e)).await;
                    break;
                }
                None => break,
            }
        }
        if sleep_or_cancelled(backoff, &cancel).await {
            break;
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

fn event_to_operation(
    event: ChangeStreamEvent<Document>,
    ns: &Namespace,
    stream_id: &str,
) -> Option<Operation> {
    let kind = match event.operation_type {
        OperationType::Insert => OpKind::Insert,
        OperationType::Update | OperationType::Replace => OpKind::Update,
        OperationType::Delete => OpKind::Delete,
        _ => OpKind::Other,
    };
    let id = event
        .document_key
        .as_ref()
        .and_then(|key| key.get("_id"))
        .cloned()
        .unwrap_or(Bson::Null);
    let doc = match event.full_document {
        Some(doc) => doc,
        None if kind == OpKind::Delete || kind == OpKind::Other => Document::new(),
        None => {
            debug!(ns = %ns, "change event has no document, skipping");
            return None;
        }
    };
    let token = match mongodb::bson::to_bson(&event.id) {
        Ok(token) => token,
        Err(e) => {
            warn!(ns = %ns, error = %e, "resume token is not serializable");
            return None;
        }
    };
    Some(Operation {
        id,
        ns: ns.clone(),
        kind,
        ts: event.cluster_time.unwrap_or_else(now_timestamp),
        doc,
        origin: OpOrigin::ChangeTail,
        cursor: Some(ResumeCursor {
            stream_id: stream_id.to_string(),
            token,
        }),
    })
}

/// A buffered oplog entry. Updates carry modifiers rather than documents, so
/// their payloads are re-read in batches when the buffer flushes.
#[derive(Debug)]
struct OplogEntry {
    ns: Namespace,
    kind: OpKind,
    ts: Timestamp,
    id: Bson,
    doc: Option<Document>,
}

/// Tail the oplog with a tailable-await cursor, buffering entries and
/// re-reading update payloads in `$in` batches bounded by the configured
/// buffer size and duration.
async fn tail_oplog(
    client: Client,
    settings: SourceSettings,
    tx: mpsc::Sender<Operation>,
    errs: ErrTx,
    cancel: CancellationToken,
) {
    let oplog: Collection<Document> = client
        .database(&settings.oplog_database)
        .collection(&settings.oplog_collection);

    let mut position = match &settings.resume {
        ResumePoint::Timestamp(ts) => *ts,
        _ => match latest_oplog_ts(&oplog).await {
            Ok(Some(ts)) => next_after(ts),
            Ok(None) => now_timestamp(),
            Err(e) => {
                let _ = errs.send(e).await;
                now_timestamp()
            }
        },
    };

    let mut pending: Vec<OplogEntry> = Vec::new();
    let mut flush_tick = tokio::time::interval(settings.buffer_duration);
    flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut backoff = INITIAL_BACKOFF;

    'reconnect: loop {
        if cancel.is_cancelled() {
            break;
        }
        let filter = doc! {
            "ts": {"$gte": position},
            "op": {"$in": ["i", "u", "d"]},
            "fromMigrate": {"$exists": false},
        };
        let open = async {
            oplog
                .find(filter)
                .cursor_type(CursorType::TailableAwait)
                .await
        };
        let opened = tokio::select! {
            _ = cancel.cancelled() => break,
            opened = open => opened,
        };
        let mut cursor = match opened {
            Ok(cursor) => {
                debug!(position = ?position, "oplog tail opened");
                backoff = INITIAL_BACKOFF;
                cursor
            }
            Err(e) => {
                let _ = errs.send(anyhow::Error::new(e)).await;
                if sleep_or_cancelled(backoff, &cancel).await {
                    break;
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    flush_oplog_buffer(&client, &mut pending, &tx, &errs).await;
                    break 'reconnect;
                }
                _ = flush_tick.tick() => {
                    flush_oplog_buffer(&client, &mut pending, &tx, &errs).await;
                }
                next = cursor.next() => match next {
                    Some(Ok(entry)) => {
                        if let Some(entry) = parse_oplog_entry(&entry) {
                            position = next_after(entry.ts);
                            pending.push(entry);
                            if pending.len() >= settings.buffer_size {
                                flush_oplog_buffer(&client, &mut pending, &tx, &errs).await;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        let _ = errs.send(anyhow::Error::new(e)).await;
                        flush_oplog_buffer(&client, &mut pending, &tx, &errs).await;
                        break;
                    }
                    None => {
                        flush_oplog_buffer(&client, &mut pending, &tx, &errs).await;
                        break;
                    }
                }
            }
        }
        if sleep_or_cancelled(backoff, &cancel).await {
            break;
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// Re-read buffered update payloads and emit every buffered entry in arrival
/// order, which preserves per-namespace timestamp order.
async fn flush_oplog_buffer(
    client: &Client,
    pending: &mut Vec<OplogEntry>,
    tx: &mpsc::Sender<Operation>,
    errs: &ErrTx,
) {
    if pending.is_empty() {
        return;
    }

    // One $in read per namespace with buffered updates.
    let mut wanted: HashMap<Namespace, Vec<Bson>> = HashMap::new();
    for entry in pending.iter() {
        if entry.kind == OpKind::Update && entry.doc.is_none() {
            wanted.entry(entry.ns.clone()).or_default().push(entry.id.clone());
        }
    }
    let mut fetched: HashMap<(Namespace, String), Document> = HashMap::new();
    for (ns, ids) in wanted {
        let coll: Collection<Document> = client.database(&ns.db).collection(&ns.coll);
        let mut cursor = match coll.find(doc! {"_id": {"$in": ids}}).await {
            Ok(cursor) => cursor,
            Err(e) => {
                let _ = errs.send(anyhow::Error::new(e)).await;
                continue;
            }
        };
        while let Some(found) = cursor.next().await {
            match found {
                Ok(doc) => {
                    if let Some(id) = doc.get("_id") {
                        fetched.insert((ns.clone(), format!("{id}")), doc.clone());
                    }
                }
                Err(e) => {
                    let _ = errs.send(anyhow::Error::new(e)).await;
                }
            }
        }
    }

    for entry in pending.drain(..) {
        let doc = match entry.doc {
            Some(doc) => doc,
            None if entry.kind == OpKind::Update => {
                match fetched.get(&(entry.ns.clone(), format!("{}", entry.id))) {
                    Some(doc) => doc.clone(),
                    None => {
                        // Deleted or rewritten since the oplog entry; nothing
                        // left to replicate.
                        debug!(ns = %entry.ns, "updated document no longer present, skipping");
                        continue;
                    }
                }
            }
            None => Document::new(),
        };
        let op = Operation {
            id: entry.id,
            ns: entry.ns,
            kind: entry.kind,
            ts: entry.ts,
            doc,
            origin: OpOrigin::ChangeTail,
            cursor: None,
        };
        if tx.send(op).await.is_err() {
            return;
        }
    }
}

fn parse_oplog_entry(entry: &Document) -> Option<OplogEntry> {
    let ts = entry.get("ts").and_then(Bson::as_timestamp)?;
    let ns = Namespace::parse(entry.get_str("ns").ok()?).ok()?;
    match entry.get_str("op").ok()? {
        "i" => {
            let doc = entry.get_document("o").ok()?.clone();
            let id = doc.get("_id")?.clone();
            Some(OplogEntry {
                ns,
                kind: OpKind::Insert,
                ts,
                id,
                doc: Some(doc),
            })
        }
        "u" => {
            let id = entry.get_document("o2").ok()?.get("_id")?.clone();
            Some(OplogEntry {
                ns,
                kind: OpKind::Update,
                ts,
                id,
                doc: None,
            })
        }
        "d" => {
            let id = entry.get_document("o").ok()?.get("_id")?.clone();
            Some(OplogEntry {
                ns,
                kind: OpKind::Delete,
                ts,
                id,
                doc: None,
            })
        }
        _ => None,
    }
}

async fn latest_oplog_ts(oplog: &Collection<Document>) -> anyhow::Result<Option<Timestamp>> {
    let last = oplog
        .find_one(doc! {})
        .sort(doc! {"$natural": -1})
        .await?;
    Ok(last.and_then(|entry| entry.get("ts").and_then(Bson::as_timestamp)))
}

fn now_timestamp() -> Timestamp {
    Timestamp {
        time: u32::try_from(chrono::Utc::now().timestamp()).unwrap_or_default(),
        increment: 0,
    }
}

/// Returns true when cancelled before the backoff elapsed.
async fn sleep_or_cancelled(backoff: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(backoff) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongoflux_core::{MeasurementSpec, TransformRegistry};

    fn measurements(namespaces: &[&str]) -> MeasurementSet {
        let specs: Vec<_> = namespaces
            .iter()
            .map(|ns| MeasurementSpec {
                namespace: ns.to_string(),
                fields: vec!["v".to_string()],
                ..MeasurementSpec::default()
            })
            .collect();
        MeasurementSet::compile(&specs, &TransformRegistry::new()).unwrap()
    }

    fn op(ns: &str, kind: OpKind) -> Operation {
        Operation {
            id: Bson::Int32(1),
            ns: Namespace::parse(ns).unwrap(),
            kind,
            ts: Timestamp {
                time: 1,
                increment: 0,
            },
            doc: Document::new(),
            origin: OpOrigin::ChangeTail,
            cursor: None,
        }
    }

    #[test]
    fn internal_database_never_passes() {
        let set = measurements(&["db.c"]);
        let internal = op(&format!("{INTERNAL_DB}.resume"), OpKind::Insert);
        assert!(!passes_filters(&internal, &set, false));
        assert!(!passes_filters(&internal, &set, true));
    }

    #[test]
    fn undeclared_namespaces_pass_only_with_change_streams() {
        let set = measurements(&["db.c"]);
        let other = op("db.other", OpKind::Insert);
        assert!(!passes_filters(&other, &set, false));
        // Change streams only exist for declared namespaces; the server-side
        // filter already constrains them.
        assert!(passes_filters(&other, &set, true));
    }

    #[test]
    fn only_inserts_and_updates_pass() {
        let set = measurements(&["db.c"]);
        assert!(passes_filters(&op("db.c", OpKind::Insert), &set, false));
        assert!(passes_filters(&op("db.c", OpKind::Update), &set, false));
        assert!(!passes_filters(&op("db.c", OpKind::Delete), &set, false));
        assert!(!passes_filters(&op("db.c", OpKind::Other), &set, false));
    }

    #[test]
    fn oplog_entries_parse_by_kind() {
        let insert = doc! {
            "ts": Timestamp { time: 10, increment: 1 },
            "op": "i",
            "ns": "db.c",
            "o": {"_id": 1, "v": 2},
        };
        let parsed = parse_oplog_entry(&insert).unwrap();
        assert_eq!(parsed.kind, OpKind::Insert);
        assert_eq!(parsed.ns.to_string(), "db.c");
        assert!(parsed.doc.is_some());

        let update = doc! {
            "ts": Timestamp { time: 10, increment: 2 },
            "op": "u",
            "ns": "db.c",
            "o": {"$set": {"v": 3}},
            "o2": {"_id": 1},
        };
        let parsed = parse_oplog_entry(&update).unwrap();
        assert_eq!(parsed.kind, OpKind::Update);
        assert!(parsed.doc.is_none());
        assert_eq!(parsed.id, Bson::Int32(1));

        let noop = doc! {
            "ts": Timestamp { time: 10, increment: 3 },
            "op": "n",
            "ns": "db.c",
            "o": {},
        };
        assert!(parse_oplog_entry(&noop).is_none());
    }
}
