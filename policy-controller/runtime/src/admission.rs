use crate::{
    k8s::{
        labels::Labels,
        policy::{NetworkPolicyAdmissionRule, NetworkPolicyAdmissionRuleSpec},
        Api, Client, DynamicObject, GeneratedKind, ListParams, Namespace, Resource, ResourceExt,
    },
    validation::{self, Verdict},
};
use anyhow::{anyhow, Result};
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use kube::core::admission::Operation;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Validates writes to generated policies and admission rules.
#[derive(Clone)]
pub struct Admission {
    lookup: Arc<dyn Lookup>,
    controller_identity: Arc<str>,
}

/// The cluster state that policy admission depends on.
#[async_trait::async_trait]
pub(crate) trait Lookup: Send + Sync {
    /// Returns a namespace's labels. A namespace that does not exist has none.
    async fn namespace_labels(&self, ns: &str) -> Result<Labels, kube::Error>;

    async fn admission_rules(&self) -> Result<Vec<NetworkPolicyAdmissionRule>, kube::Error>;
}

struct KubeLookup(Client);

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;
type AdmissionReview = kube::core::admission::AdmissionReview<DynamicObject>;

type Body = http_body_util::Full<bytes::Bytes>;

// === impl Admission ===

impl tower::Service<Request<hyper::body::Incoming>> for Admission {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        trace!(?req);
        if req.method() != http::Method::POST || req.uri().path() != "/" {
            return Box::pin(future::ok(
                Response::builder()
                    .status(http::StatusCode::NOT_FOUND)
                    .body(Body::default())
                    .expect("not found response must be valid"),
            ));
        }

        let admission = self.clone();
        Box::pin(async move {
            use bytes::Buf;
            let bytes = req.into_body().collect().await?.to_bytes();
            let review: AdmissionReview = match serde_json::from_reader(bytes.reader()) {
                Ok(review) => review,
                Err(error) => {
                    warn!(%error, "Failed to parse request body");
                    return json_response(AdmissionResponse::invalid(error).into_review());
                }
            };
            trace!(?review);

            let rsp = match review.try_into() {
                Ok(req) => {
                    debug!(?req);
                    admission.admit(req).await
                }
                Err(error) => {
                    warn!(%error, "Invalid admission request");
                    AdmissionResponse::invalid(error)
                }
            };
            debug!(?rsp);
            json_response(rsp.into_review())
        })
    }
}

impl Admission {
    pub fn new(client: Client, controller_identity: impl Into<Arc<str>>) -> Self {
        Self::with_lookup(Arc::new(KubeLookup(client)), controller_identity)
    }

    pub(crate) fn with_lookup(
        lookup: Arc<dyn Lookup>,
        controller_identity: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            lookup,
            controller_identity: controller_identity.into(),
        }
    }

    async fn admit(self, req: AdmissionRequest) -> AdmissionResponse {
        if let Some(kind) = GeneratedKind::from_group_kind(&req.kind.group, &req.kind.kind) {
            return self.admit_policy(kind, req).await;
        }

        if is_kind::<NetworkPolicyAdmissionRule>(&req) {
            return admit_rule(req);
        }

        AdmissionResponse::invalid(format_args!(
            "unsupported resource type: {}.{}.{}",
            req.kind.group, req.kind.version, req.kind.kind
        ))
    }

    async fn admit_policy(self, kind: GeneratedKind, req: AdmissionRequest) -> AdmissionResponse {
        match req.operation {
            Operation::Delete => admit_delete(req, &self.controller_identity),
            Operation::Create | Operation::Update => self.admit_policy_write(kind, req).await,
            Operation::Connect => AdmissionResponse::from(&req),
        }
    }

    async fn admit_policy_write(
        self,
        kind: GeneratedKind,
        req: AdmissionRequest,
    ) -> AdmissionResponse {
        let rsp = AdmissionResponse::from(&req);
        let Some(obj) = req.object.as_ref() else {
            return errored(rsp, 400, "admission request missing 'object'");
        };
        let name = obj.name_any();

        let namespace = kind
            .is_namespaced()
            .then(|| req.namespace.clone().or_else(|| obj.namespace()))
            .flatten();
        let labels = match namespace.as_deref() {
            Some(ns) => match self.lookup.namespace_labels(ns).await {
                Ok(labels) => labels,
                Err(error) => {
                    warn!(%error, namespace = %ns, "Failed to look up namespace");
                    return errored(rsp, 500, error);
                }
            },
            None => Labels::default(),
        };

        let rules = match self.lookup.admission_rules().await {
            Ok(rules) => rules,
            Err(error) => {
                warn!(%error, "Failed to list admission rules");
                return errored(rsp, 500, error);
            }
        };

        match validation::validate_policy(&obj.data, &rules, &labels) {
            Ok(Verdict::Allow) => rsp,
            Ok(Verdict::Deny(reason)) => {
                info!(%kind, ?namespace, %name, %reason, "Denied");
                rsp.deny(reason)
            }
            Err(error @ validation::Error::Policy(_)) => {
                info!(%kind, ?namespace, %name, %error, "Rejected malformed policy");
                errored(rsp, 400, error)
            }
            Err(error @ validation::Error::Rule { .. }) => {
                warn!(%error, "Admission rule is misconfigured");
                errored(rsp, 500, error)
            }
        }
    }
}

// === impl KubeLookup ===

#[async_trait::async_trait]
impl Lookup for KubeLookup {
    async fn namespace_labels(&self, ns: &str) -> Result<Labels, kube::Error> {
        let api = Api::<Namespace>::all(self.0.clone());
        let labels = api
            .get_opt(ns)
            .await?
            .and_then(|ns| ns.metadata.labels)
            .into();
        Ok(labels)
    }

    async fn admission_rules(&self) -> Result<Vec<NetworkPolicyAdmissionRule>, kube::Error> {
        let api = Api::<NetworkPolicyAdmissionRule>::all(self.0.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }
}

fn admit_delete(req: AdmissionRequest, controller_identity: &str) -> AdmissionResponse {
    let rsp = AdmissionResponse::from(&req);
    let Some(obj) = req.old_object.as_ref() else {
        return errored(rsp, 400, "admission request missing 'oldObject'");
    };

    let username = req.user_info.username.as_deref().unwrap_or_default();
    match validation::validate_delete(&obj.metadata, username, controller_identity) {
        Verdict::Allow => rsp,
        Verdict::Deny(reason) => {
            info!(name = %obj.name_any(), %username, "Denied deletion of a managed policy");
            rsp.deny(reason)
        }
    }
}

fn admit_rule(req: AdmissionRequest) -> AdmissionResponse {
    let rsp = AdmissionResponse::from(&req);
    if !matches!(req.operation, Operation::Create | Operation::Update) {
        return rsp;
    }

    let (obj, spec) = match parse_spec::<NetworkPolicyAdmissionRuleSpec>(req) {
        Ok(spec) => spec,
        Err(error) => {
            info!(%error, "Failed to parse NetworkPolicyAdmissionRule spec");
            return errored(rsp, 400, error);
        }
    };

    match validation::validate_admission_rule(&spec) {
        Verdict::Allow => rsp,
        Verdict::Deny(reason) => {
            info!(name = %obj.name_any(), %reason, "Denied");
            rsp.deny(reason)
        }
    }
}

/// Rejects a request that could not be evaluated, reporting `code` as the
/// HTTP status of the result.
fn errored(rsp: AdmissionResponse, code: u16, reason: impl ToString) -> AdmissionResponse {
    let mut rsp = rsp.deny(reason);
    rsp.result.code = code;
    rsp
}

fn is_kind<T>(req: &AdmissionRequest) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    req.kind.group.eq_ignore_ascii_case(&T::group(&dt))
        && req.kind.kind.eq_ignore_ascii_case(&T::kind(&dt))
}

fn json_response(rsp: AdmissionReview) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&rsp)?;
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("admission review response must be valid"))
}

fn parse_spec<T: DeserializeOwned>(req: AdmissionRequest) -> Result<(DynamicObject, T)> {
    let obj = req
        .object
        .ok_or_else(|| anyhow!("admission request missing 'object'"))?;

    let spec = {
        let data = obj
            .data
            .get("spec")
            .cloned()
            .ok_or_else(|| anyhow!("admission request missing 'spec'"))?;
        serde_json::from_value(data)?
    };

    Ok((obj, spec))
}
