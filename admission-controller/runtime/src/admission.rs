use crate::metrics::{AdmissionMetrics, Outcome};
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use kube::core::{admission, DynamicObject};
use openshift_admission_core::{AdmissionError, Attributes, Operation, Plugins};
use thiserror::Error;
use tokio::time;
use tracing::{debug, info, trace, warn};

/// Serves the mutating webhook on `/mutate` and the validating webhook on
/// `/validate`.
#[derive(Clone, Debug)]
pub struct Admission {
    plugins: Plugins,
    metrics: AdmissionMetrics,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Mutate,
    Validate,
}

type AdmissionRequest = admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = admission::AdmissionResponse;
type AdmissionReview = admission::AdmissionReview<DynamicObject>;

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
        let Some(phase) = Phase::route(req.method(), req.uri().path()) else {
            return Box::pin(future::ok(
                Response::builder()
                    .status(http::StatusCode::NOT_FOUND)
                    .body(Body::default())
                    .expect("not found response must be valid"),
            ));
        };

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
                    debug!(?req, ?phase);
                    match phase {
                        Phase::Mutate => admission.mutate(req).await,
                        Phase::Validate => admission.validate(req).await,
                    }
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
    pub fn new(plugins: Plugins, metrics: AdmissionMetrics) -> Self {
        Self { plugins, metrics }
    }

    /// Runs the mutating plugins and returns their changes as a JSON patch.
    async fn mutate(self, req: AdmissionRequest) -> AdmissionResponse {
        let start = time::Instant::now();
        let rsp = AdmissionResponse::from(&req);
        let phase = Phase::Mutate.as_str();

        let mut attributes = to_attributes(req);
        let resource = attributes.group_resource().to_string();
        let operation = attributes.operation.to_string();
        let before = attributes.object.as_ref().map(serde_json::to_value);

        if let Err(error) = self.plugins.mutate(&mut attributes).await {
            log_denied(phase, &attributes, &error);
            self.metrics
                .observe(phase, resource, operation, Outcome::Denied, start);
            return deny(rsp, &error);
        }

        let patch = match (before, attributes.object.as_ref().map(serde_json::to_value)) {
            (Some(Ok(before)), Some(Ok(after))) => json_patch::diff(&before, &after),
            (Some(Err(error)), _) | (_, Some(Err(error))) => {
                warn!(%error, "Failed to encode admitted object");
                self.metrics
                    .observe(phase, resource, operation, Outcome::Invalid, start);
                return deny(rsp, &AdmissionError::Internal(error.into()));
            }
            _ => json_patch::Patch(Vec::new()),
        };

        if patch.0.is_empty() {
            self.metrics
                .observe(phase, resource, operation, Outcome::Allowed, start);
            return rsp;
        }

        debug!(?patch, %resource, name = %attributes.name, "Mutated");
        match rsp.clone().with_patch(patch) {
            Ok(rsp) => {
                self.metrics
                    .observe(phase, resource, operation, Outcome::Mutated, start);
                rsp
            }
            Err(error) => {
                warn!(%error, "Failed to encode patch");
                self.metrics
                    .observe(phase, resource, operation, Outcome::Invalid, start);
                deny(rsp, &AdmissionError::Internal(error.into()))
            }
        }
    }

    /// Runs the validating plugins against the object as every mutating
    /// webhook left it.
    async fn validate(self, req: AdmissionRequest) -> AdmissionResponse {
        let start = time::Instant::now();
        let rsp = AdmissionResponse::from(&req);
        let phase = Phase::Validate.as_str();

        let attributes = to_attributes(req);
        let resource = attributes.group_resource().to_string();
        let operation = attributes.operation.to_string();

        if let Err(error) = self.plugins.validate(&attributes).await {
            log_denied(phase, &attributes, &error);
            self.metrics
                .observe(phase, resource, operation, Outcome::Denied, start);
            return deny(rsp, &error);
        }

        self.metrics
            .observe(phase, resource, operation, Outcome::Allowed, start);
        rsp
    }
}

// === impl Phase ===

impl Phase {
    fn route(method: &http::Method, path: &str) -> Option<Self> {
        if method != http::Method::POST {
            return None;
        }
        match path {
            "/mutate" => Some(Self::Mutate),
            "/validate" => Some(Self::Validate),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Mutate => "mutate",
            Self::Validate => "validate",
        }
    }
}

fn to_attributes(req: AdmissionRequest) -> Attributes {
    let operation = match req.operation {
        admission::Operation::Create => Operation::Create,
        admission::Operation::Update => Operation::Update,
        admission::Operation::Delete => Operation::Delete,
        admission::Operation::Connect => Operation::Connect,
    };

    let mut attributes = Attributes::new(req.resource, req.kind, operation).with_name(req.name);
    attributes.namespace = req.namespace.filter(|ns| !ns.is_empty());
    attributes.subresource = req.sub_resource.filter(|sr| !sr.is_empty());
    attributes.object = req.object;
    attributes.old_object = req.old_object;
    attributes.user_info = Some(req.user_info);
    attributes.dry_run = req.dry_run;
    attributes
}

fn log_denied(phase: &str, attributes: &Attributes, error: &AdmissionError) {
    info!(
        %error,
        phase,
        ns = attributes.namespace().unwrap_or_default(),
        name = %attributes.name,
        resource = %attributes.group_resource(),
        operation = %attributes.operation,
        "Denied"
    );
}

fn deny(rsp: AdmissionResponse, error: &AdmissionError) -> AdmissionResponse {
    let mut rsp = rsp.deny(error);
    rsp.result.code = error.code();
    rsp.result.reason = error.reason().to_string();
    rsp
}

fn json_response(rsp: AdmissionReview) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&rsp)?;
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("admission review response must be valid"))
}
