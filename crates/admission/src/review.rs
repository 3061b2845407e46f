//! `admission.k8s.io/v1` AdmissionReview envelope.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::decision::{AdmissionSettings, Decision, decide_create, validate_pod_update};
use crate::error::AdmissionError;

const API_VERSION: &str = "admission.k8s.io/v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReview {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<AdmissionRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<AdmissionResponse>,
}

fn default_api_version() -> String {
    API_VERSION.to_string()
}

fn default_kind() -> String {
    "AdmissionReview".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
    Connect,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupVersionKind {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub kind: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserInfo {
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    pub uid: String,
    #[serde(default)]
    pub kind: GroupVersionKind,
    pub operation: Operation,
    #[serde(default)]
    pub user_info: UserInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_object: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseStatus {
    pub code: u16,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ResponseStatus>,
    /// Base64 encoded JSON patch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_type: Option<String>,
}

impl AdmissionResponse {
    fn from_decision(uid: &str, decision: Decision) -> Result<Self, AdmissionError> {
        let (allowed, code, message, patch) = match decision {
            Decision::Allow { message } => (true, 200, message, None),
            Decision::Patch { message, operations } => {
                let encoded = STANDARD.encode(serde_json::to_vec(&operations)?);
                (true, 200, message, Some(encoded))
            }
            Decision::Deny { code, message } => (false, code, message, None),
        };
        Ok(Self {
            uid: uid.to_string(),
            allowed,
            status: Some(ResponseStatus { code, message }),
            patch_type: patch.as_ref().map(|_| "JSONPatch".to_string()),
            patch,
        })
    }

    fn invalid(uid: &str, error: &AdmissionError) -> Self {
        Self {
            uid: uid.to_string(),
            allowed: false,
            status: Some(ResponseStatus {
                code: 400,
                message: error.to_string(),
            }),
            patch: None,
            patch_type: None,
        }
    }
}

fn decode_pod(object: Option<&Value>, what: &'static str) -> Result<Pod, AdmissionError> {
    let object = object.ok_or(AdmissionError::MissingObject(what))?;
    Ok(Pod::deserialize(object)?)
}

fn decide(request: &AdmissionRequest, settings: &AdmissionSettings) -> Result<Decision, AdmissionError> {
    if request.kind.kind != "Pod" {
        return Err(AdmissionError::UnsupportedKind(request.kind.kind.clone()));
    }
    match request.operation {
        Operation::Create => {
            let pod = decode_pod(request.object.as_ref(), "object")?;
            decide_create(&pod, settings)
        }
        Operation::Update => {
            let new = decode_pod(request.object.as_ref(), "object")?;
            let old = decode_pod(request.old_object.as_ref(), "oldObject")?;
            Ok(validate_pod_update(&old, &new, &request.user_info.username, settings))
        }
        Operation::Delete | Operation::Connect => Ok(Decision::Allow {
            message: "Operation is not reviewed".to_string(),
        }),
    }
}

/// Answer an AdmissionReview. Malformed requests are denied with 400.
#[must_use]
pub fn review(review: AdmissionReview, settings: &AdmissionSettings) -> AdmissionReview {
    let Some(request) = review.request else {
        warn!("AdmissionReview without request");
        return AdmissionReview {
            api_version: review.api_version,
            kind: review.kind,
            request: None,
            response: Some(AdmissionResponse::invalid("", &AdmissionError::MissingObject("request"))),
        };
    };

    let response = decide(&request, settings)
        .and_then(|decision| {
            match &decision {
                Decision::Deny { message, .. } => {
                    info!(uid = %request.uid, user = %request.user_info.username, "Denied pod update: {}", message);
                }
                other => debug!(uid = %request.uid, "Admission decision: {:?}", other),
            }
            AdmissionResponse::from_decision(&request.uid, decision)
        })
        .unwrap_or_else(|e| {
            warn!(uid = %request.uid, "Rejecting malformed admission request: {}", e);
            AdmissionResponse::invalid(&request.uid, &e)
        });

    AdmissionReview {
        api_version: review.api_version,
        kind: review.kind,
        request: None,
        response: Some(response),
    }
}
