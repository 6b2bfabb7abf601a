use crate::node::Node;
use api::{ErrBody, TypeCode};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use models::{ActMsg, Bck, XactKind};
use std::collections::HashMap;
use std::sync::Arc;

/// NodeError renders any failure as the structured error body every
/// control endpoint returns.
pub struct NodeError(ErrBody);

impl NodeError {
    fn new(status: u16, type_code: TypeCode, message: impl std::fmt::Display) -> Self {
        Self(ErrBody::new(status, message.to_string(), type_code))
    }

    fn precondition(message: impl std::fmt::Display) -> Self {
        Self::new(409, TypeCode::Precondition, message)
    }
    fn not_found(message: impl std::fmt::Display) -> Self {
        Self::new(404, TypeCode::NotFound, message)
    }
    fn internal(message: impl std::fmt::Display) -> Self {
        Self::new(500, TypeCode::Internal, message)
    }
}

impl IntoResponse for NodeError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.0)).into_response()
    }
}

impl From<txn::TxnError> for NodeError {
    fn from(err: txn::TxnError) -> Self {
        use txn::TxnError::*;
        match &err {
            BucketExists(_) | Precondition(_) | Duplicate(_) | Stale(_) | Model(_) => {
                Self::precondition(err)
            }
            BucketNotFound(_) | NotFound(_) => Self::not_found(err),
            _ => Self::internal(err),
        }
    }
}

pub fn router(node: Arc<Node>) -> Router {
    Router::new()
        .route(api::paths::METASYNC, post(metasync_recv))
        .route(api::paths::DAEMON, get(daemon_what))
        .route(api::paths::REVERSE_DAEMON, get(reverse_daemon))
        .route(
            api::paths::CLUSTER,
            get(daemon_what).post(cluster_act).put(set_config),
        )
        .route(&format!("{}/join", api::paths::CLUSTER), post(cluster_join))
        .route(
            &format!("{}/:bucket/:phase", api::paths::TXN),
            post(txn_phase),
        )
        .route(
            &format!("{}/:trname/:xid", api::paths::TRANSPORT),
            put(transport_recv),
        )
        .route(&format!("{}/:bucket", api::paths::BUCKETS), post(bucket_act))
        .route(
            &format!("{}/:bucket/*obj", api::paths::OBJECTS),
            put(object_put).get(object_get).head(object_head),
        )
        .route(
            api::paths::XACTIONS,
            get(xact_query).post(xact_start).delete(xact_abort),
        )
        .with_state(node)
}

async fn metasync_recv(
    State(node): State<Arc<Node>>,
    Json(payload): Json<cluster::MsyncPayload>,
) -> Result<Json<serde_json::Value>, NodeError> {
    let applied = node.owners.apply_payload(payload);
    if applied.contains(&"rmd") {
        node.on_rmd_bump();
    }
    Ok(Json(serde_json::json!({ "applied": applied })))
}

async fn daemon_what(
    State(node): State<Arc<Node>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, NodeError> {
    let what: api::What = params
        .get(api::qparams::WHAT)
        .map(|s| s.as_str())
        .unwrap_or("smap")
        .parse()
        .map_err(NodeError::precondition)?;

    let value = match what {
        api::What::Smap => serde_json::to_value(&*node.owners.smap.get()),
        api::What::Bmd => serde_json::to_value(&*node.owners.bmd.get()),
        api::What::Rmd => serde_json::to_value(&*node.owners.rmd.get()),
        api::What::ClusterConfig | api::What::NodeConfig => {
            serde_json::to_value(&*node.owners.config.get())
        }
        api::What::Snode => serde_json::to_value(node.snode()),
        api::What::AllRunningXacts => serde_json::to_value(node.registry.running_snaps()),
        api::What::NodeStats | api::What::DiskStats => serde_json::to_value(node.disk_stats()),
        api::What::MetricNames | api::What::Log => {
            return Err(NodeError::precondition(format!(
                "what={} is served by the stats subsystem",
                what.as_str()
            )))
        }
    };
    value.map(Json).map_err(NodeError::internal)
}

/// Reverse-proxied daemon query: the gateway forwards `/v1/daemon` to
/// the node named by `Hdr-Node-Id` and relays the response.
async fn reverse_daemon(
    State(node): State<Arc<Node>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, NodeError> {
    let target_id = header_str(&headers, api::headers::NODE_ID)
        .ok_or_else(|| NodeError::precondition("missing Hdr-Node-Id"))?;
    let smap = node.owners.smap.get();
    let target = smap
        .get_node(&target_id)
        .ok_or_else(|| NodeError::not_found(format!("unknown node {target_id}")))?;

    let url = target.control_url(api::paths::DAEMON);
    let resp = node
        .client
        .get(&url)
        .query(&params)
        .send()
        .await
        .map_err(NodeError::internal)?;
    let status = resp.status();
    let body: serde_json::Value = resp.json().await.map_err(NodeError::internal)?;
    if !status.is_success() {
        return Err(NodeError::new(status.as_u16(), TypeCode::Internal, body));
    }
    Ok(Json(body))
}

async fn txn_phase(
    State(node): State<Arc<Node>>,
    Path((bucket, phase)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    body: Option<Json<ActMsg>>,
) -> Result<Response, NodeError> {
    let executor = node
        .executor
        .as_ref()
        .ok_or_else(|| NodeError::precondition("transactions run on targets only"))?;
    let uuid = params
        .get("uuid")
        .ok_or_else(|| NodeError::precondition("missing txn uuid"))?;
    let bck: Bck = bucket.parse().map_err(NodeError::precondition)?;

    match phase.as_str() {
        api::paths::TXN_BEGIN => {
            let Some(Json(msg)) = body else {
                return Err(NodeError::precondition("begin requires an action message"));
            };
            let unixtime: i64 = params
                .get(api::qparams::UNIXTIME)
                .and_then(|v| v.parse().ok())
                .unwrap_or_default();
            // The coordinator's host timeout bounds how long the begun
            // txn may sit in the table; fall back to our own config.
            let host_timeout = params
                .get(api::qparams::HOST_TIMEOUT)
                .and_then(|v| v.parse().ok())
                .map(std::time::Duration::from_nanos)
                .unwrap_or_else(|| node.owners.config.get().timeout.host);
            executor.begin(uuid, &bck, unixtime, msg, host_timeout)?;
            Ok(StatusCode::OK.into_response())
        }
        api::paths::TXN_COMMIT => {
            let xid = executor.commit(uuid, &bck)?;
            let mut headers = HeaderMap::new();
            if let Some(xid) = xid {
                if let Ok(value) = xid.to_string().parse() {
                    headers.insert(api::headers::XACTION_ID, value);
                }
            }
            Ok((StatusCode::OK, headers).into_response())
        }
        api::paths::TXN_ABORT => {
            executor.abort(uuid);
            Ok(StatusCode::OK.into_response())
        }
        other => Err(NodeError::precondition(format!("unknown txn phase {other:?}"))),
    }
}

async fn transport_recv(
    State(node): State<Arc<Node>>,
    Path((trname, xid)): Path<(String, String)>,
    headers: HeaderMap,
    body: bytes::Bytes,
) -> Result<StatusCode, NodeError> {
    let from_node = header_str(&headers, api::headers::NODE_ID).unwrap_or_default();
    let hdr = transport::ObjHdr {
        bck: header_str(&headers, transport::hdrs::OBJ_BCK)
            .and_then(|s| s.parse().ok())
            .unwrap_or_default(),
        objname: header_str(&headers, transport::hdrs::OBJ_NAME).unwrap_or_default(),
        size: header_i64(&headers, transport::hdrs::OBJ_SIZE),
        atime_ns: header_i64(&headers, api::headers::OBJ_ATIME),
        cksum_type: header_str(&headers, api::headers::OBJ_CKSUM_TYPE).unwrap_or_default(),
        cksum_value: header_str(&headers, api::headers::OBJ_CKSUM_VAL).unwrap_or_default(),
        opaque: header_str(&headers, transport::hdrs::OPAQUE)
            .and_then(|raw| base64_decode(&raw))
            .unwrap_or_default(),
    };
    node.recv
        .dispatch(&trname, &xid, &from_node, hdr, body)
        .await
        .map_err(|err| match err {
            transport::TransportError::UnknownTrname(_) => NodeError::not_found(err),
            other => NodeError::internal(other),
        })?;
    Ok(StatusCode::OK)
}

/// Node join: the primary puts the new member into the Smap, bumps the
/// rebalance epoch, and metasyncs both.
async fn cluster_join(
    State(node): State<Arc<Node>>,
    Json(snode): Json<models::Snode>,
) -> Result<Json<serde_json::Value>, NodeError> {
    if node.coordinator.is_none() {
        return Err(NodeError::precondition("join goes to the primary gateway"));
    }
    let (new_smap, _) = node
        .owners
        .smap
        .modify(|smap| {
            smap.put_node(snode.clone());
            Ok(())
        })
        .map_err(NodeError::internal)?;
    node.metasync.queue_smap((*new_smap).clone(), "join");

    if snode.is_target() {
        let (new_rmd, _) = node
            .owners
            .rmd
            .modify(|_| Ok(()))
            .map_err(NodeError::internal)?;
        node.metasync.queue_rmd((*new_rmd).clone(), "join");
    }
    tracing::info!(node = %snode.id, role = %snode.role, version = new_smap.version, "node joined");
    Ok(Json(serde_json::json!({ "smap_version": new_smap.version })))
}

/// Update the cluster config. `transient=true` applies in memory only
/// (skips persist and replication); otherwise the new version persists
/// and metasyncs.
async fn set_config(
    State(node): State<Arc<Node>>,
    Query(params): Query<HashMap<String, String>>,
    Json(next): Json<models::ClusterConfig>,
) -> Result<Json<serde_json::Value>, NodeError> {
    let transient = params
        .get(api::qparams::TRANSIENT)
        .map(|v| v == "true")
        .unwrap_or(false);
    if transient {
        let version = node.owners.config.version();
        let mut next = next;
        next.version = version; // same-version: applied locally only
        node.owners.config.apply_transient(next);
        return Ok(Json(serde_json::json!({ "version": version, "transient": true })));
    }
    let (new_conf, _) = node
        .owners
        .config
        .modify(|conf| {
            let version = conf.version;
            *conf = next.clone();
            conf.version = version;
            Ok(())
        })
        .map_err(NodeError::internal)?;
    node.metasync.queue_conf((*new_conf).clone(), "set-config");
    Ok(Json(serde_json::json!({ "version": new_conf.version })))
}

/// Cluster-wide control actions, driven by the primary's coordinator.
async fn cluster_act(
    State(node): State<Arc<Node>>,
    Json(msg): Json<ActMsg>,
) -> Result<Json<serde_json::Value>, NodeError> {
    let coord = node
        .coordinator
        .as_ref()
        .ok_or_else(|| NodeError::precondition("control actions go to the primary gateway"))?;
    match msg {
        ActMsg::StartMaintenance { node_id } => coord.start_maintenance(&node_id).await?,
        ActMsg::StopMaintenance { node_id } => coord.stop_maintenance(&node_id).await?,
        ActMsg::DecommissionNode { node_id, rm_user_data } => {
            coord.decommission_node(&node_id, rm_user_data).await?
        }
        ActMsg::Shutdown => coord.shutdown_cluster().await?,
        other => {
            return Err(NodeError::precondition(format!(
                "{} is a bucket-level action",
                other.name()
            )))
        }
    }
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// Bucket-level requests: a control action (tagged body) dispatched
/// through the 2PC coordinator, or a list-objects page request.
async fn bucket_act(
    State(node): State<Arc<Node>>,
    Path(bucket): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, NodeError> {
    let bck: Bck = bucket.parse().map_err(NodeError::precondition)?;

    if body.get("action").is_some() {
        let msg: ActMsg = serde_json::from_value(body).map_err(NodeError::precondition)?;
        let coord = node
            .coordinator
            .as_ref()
            .ok_or_else(|| NodeError::precondition("control actions go to the primary gateway"))?;
        let xids = match msg {
            ActMsg::CreateBucket(props) => {
                coord.create_bucket(&bck, props).await?;
                String::new()
            }
            ActMsg::DestroyBucket(args) => {
                coord.destroy_bucket(&bck, args).await?;
                String::new()
            }
            ActMsg::RenameBucket(args) => coord.rename_bucket(&bck, args.to).await?,
            ActMsg::CopyBucket(args) => coord.copy_bucket(&bck, args).await?,
            ActMsg::SetBucketProps(args) => {
                coord.set_bucket_props(&bck, args).await?;
                String::new()
            }
            ActMsg::MakeNCopies(args) => coord.make_n_copies(&bck, args.copies).await?,
            ActMsg::EcEncode(args) => coord.ec_encode(&bck, args).await?,
            ActMsg::ArchiveObjects(args) => coord.archive_objects(&bck, args).await?,
            other => {
                return Err(NodeError::precondition(format!(
                    "{} is a cluster-level action",
                    other.name()
                )))
            }
        };
        let mut headers = HeaderMap::new();
        if !xids.is_empty() {
            if let Ok(value) = xids.parse() {
                headers.insert(api::headers::XACTION_ID, value);
            }
        }
        return Ok((StatusCode::OK, headers).into_response());
    }

    // list-objects
    let msg: lso::LsoMsg = serde_json::from_value(body).map_err(NodeError::precondition)?;
    if !node.owners.bmd.get().exists(&bck) {
        return Err(NodeError::not_found(format!("bucket {bck} does not exist")));
    }
    // The listing id derives from the bucket so the designated target
    // and its page subscribers agree on the stream name.
    let lso_id = models::Id::new(hrw::digest(&format!("lso/{}", bck.uname())).to_be_bytes());
    let outcome = node
        .registry
        .renew(xaction::RenewArgs {
            kind: XactKind::ListObjects,
            bck: Some(bck),
            id: Some(lso_id),
            custom: None,
        })
        .map_err(NodeError::internal)?;
    let started = matches!(outcome, xaction::RenewOutcome::Started(_));
    let xact = outcome.into_xact();
    let lso_xact = node
        .lso_of(&xact)
        .ok_or_else(|| NodeError::internal("list-objects xaction has the wrong type"))?;

    // Subscriber targets plug the broadcast stream into the xaction;
    // the receive entry lives exactly as long as the xaction does.
    if started {
        if let Some(sink) = lso_xact.page_sink() {
            node.recv.register(
                lso::TRNAME,
                &xact.id().to_string(),
                Arc::new(LsoPageRecv { sink }),
            );
            let recv = node.recv.clone();
            let mut done = xact.base().subscribe();
            let xid = xact.id().to_string();
            tokio::spawn(async move {
                let _ = done.recv().await;
                recv.unregister(lso::TRNAME, &xid);
            });
        }
    }

    let page = lso_xact.next_page(msg).await.map_err(|err| match err {
        lso::LsoError::Gone => NodeError::new(410, TypeCode::Retriable, err),
        other => NodeError::internal(other),
    })?;
    Ok(Json(page).into_response())
}

/// Decodes broadcast msgpack pages into a subscriber's sink.
struct LsoPageRecv {
    sink: tokio::sync::mpsc::Sender<lso::LsoPage>,
}

#[async_trait::async_trait]
impl transport::RecvHandler for LsoPageRecv {
    async fn recv(
        &self,
        _from_node: &str,
        _hdr: transport::ObjHdr,
        body: transport::BodyStream,
    ) -> Result<(), transport::TransportError> {
        let page: lso::LsoPage = transport::decode_page(&body)?;
        self.sink
            .send(page)
            .await
            .map_err(|_| transport::TransportError::UnknownTrname(lso::TRNAME.to_string()))
    }
}

async fn object_put(
    State(node): State<Arc<Node>>,
    Path((bucket, obj)): Path<(String, String)>,
    body: bytes::Bytes,
) -> Result<StatusCode, NodeError> {
    let bck: Bck = bucket.parse().map_err(NodeError::precondition)?;
    node.put_object(&bck, &obj, &body).map_err(NodeError::internal)?;
    Ok(StatusCode::OK)
}

async fn object_get(
    State(node): State<Arc<Node>>,
    Path((bucket, obj)): Path<(String, String)>,
) -> Result<bytes::Bytes, NodeError> {
    let bck: Bck = bucket.parse().map_err(NodeError::precondition)?;
    node.get_object(&bck, &obj)
        .map(bytes::Bytes::from)
        .map_err(NodeError::not_found)
}

async fn object_head(
    State(node): State<Arc<Node>>,
    Path((bucket, obj)): Path<(String, String)>,
) -> Result<Response, NodeError> {
    let bck: Bck = bucket.parse().map_err(NodeError::precondition)?;
    let md = node.head_object(&bck, &obj).map_err(NodeError::not_found)?;
    let mut headers = HeaderMap::new();
    let pairs = [
        (api::headers::OBJ_CKSUM_TYPE, md.cksum_type.as_str().to_string()),
        (api::headers::OBJ_CKSUM_VAL, md.cksum_value.clone()),
        (api::headers::OBJ_VERSION, md.version.clone()),
        (api::headers::OBJ_ATIME, md.atime_ns.to_string()),
        ("Content-Length", md.size.to_string()),
    ];
    for (name, value) in pairs {
        if let (Ok(name), Ok(value)) = (axum::http::HeaderName::try_from(name), value.parse()) {
            headers.insert(name, value);
        }
    }
    Ok((StatusCode::OK, headers).into_response())
}

async fn xact_query(
    State(node): State<Arc<Node>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Vec<models::XactSnap>>, NodeError> {
    if let Some(id) = params.get("id") {
        let id: models::Id = id.parse().map_err(NodeError::precondition)?;
        let snap = node.registry.snap(id).map_err(NodeError::not_found)?;
        return Ok(Json(vec![snap]));
    }
    Ok(Json(node.registry.running_snaps()))
}

#[derive(serde::Deserialize)]
struct XactStartMsg {
    kind: XactKind,
    #[serde(default)]
    bck: Option<Bck>,
    /// Kind-specific arguments (e.g. the dsort job request).
    #[serde(default)]
    args: Option<serde_json::Value>,
}

/// Start a job directly (dsort submissions, operator-driven resilver).
/// Bucket-scoped control actions go through `/v1/buckets` instead.
async fn xact_start(
    State(node): State<Arc<Node>>,
    Json(msg): Json<XactStartMsg>,
) -> Result<Json<serde_json::Value>, NodeError> {
    let outcome = node
        .registry
        .renew(xaction::RenewArgs {
            kind: msg.kind,
            bck: msg.bck,
            id: None,
            custom: msg.args.map(|v| v.to_string()),
        })
        .map_err(NodeError::precondition)?;
    let id = outcome.xact().id();
    Ok(Json(serde_json::json!({ "id": id.to_string() })))
}

async fn xact_abort(
    State(node): State<Arc<Node>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, NodeError> {
    if let Some(id) = params.get("id") {
        let id: models::Id = id.parse().map_err(NodeError::precondition)?;
        node.registry
            .abort_id(id, "user abort")
            .map_err(NodeError::not_found)?;
        return Ok(Json(serde_json::json!({ "aborted": 1 })));
    }
    let kind = params
        .get("kind")
        .and_then(|k| serde_json::from_value::<XactKind>(serde_json::json!(k)).ok());
    let n = node.registry.abort_all(kind, None, "user abort");
    Ok(Json(serde_json::json!({ "aborted": n })))
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn header_i64(headers: &HeaderMap, name: &str) -> i64 {
    header_str(headers, name)
        .and_then(|s| s.parse().ok())
        .unwrap_or_default()
}

fn base64_decode(raw: &str) -> Option<Vec<u8>> {
    base64::decode(raw).ok()
}
