//! Admission validation handlers
//!
//! Each kind implements [`Admit`]; one generic handler decodes the review,
//! runs the check and answers allow or deny. Deletes are always allowed.

use axum::Json;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info};

use crate::crd::{Nve, NveConfig, Vtep, VtepConfig};
use crate::{Error, Result};

/// Admission-time check for a kind
pub trait Admit: DeserializeOwned + Send + 'static {
    /// Validate `self`; `old` is the stored object on update
    fn admit(&self, old: Option<&Self>) -> Result<()>;
}

impl Admit for Nve {
    fn admit(&self, old: Option<&Self>) -> Result<()> {
        match old {
            Some(old) => self.spec.validate_update(&old.spec),
            None => self.spec.validate(),
        }
    }
}

impl Admit for Vtep {
    fn admit(&self, old: Option<&Self>) -> Result<()> {
        match old {
            Some(old) => self.spec.validate_update(&old.spec),
            None => Ok(()),
        }
    }
}

impl Admit for NveConfig {
    fn admit(&self, _old: Option<&Self>) -> Result<()> {
        self.spec.validate()
    }
}

impl Admit for VtepConfig {
    fn admit(&self, _old: Option<&Self>) -> Result<()> {
        self.spec.validate()
    }
}

/// Handle a validating admission review for kind `K`
pub async fn validate_handler<K: Admit>(
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };
    Json(review::<K>(&req).into_review())
}

/// Decide a single request
fn review<K: Admit>(request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    let response = AdmissionResponse::from(request);
    if matches!(request.operation, Operation::Delete) {
        return response;
    }
    let Some(object) = &request.object else {
        debug!(uid = %request.uid, "no object in request, allowing");
        return response;
    };

    let verdict = decode::<K>(object).and_then(|new| {
        let old = request.old_object.as_ref().map(decode::<K>).transpose()?;
        new.admit(old.as_ref())
    });

    match verdict {
        Ok(()) => response,
        Err(e) => {
            info!(
                uid = %request.uid,
                kind = %request.kind.kind,
                name = %request.name,
                error = %e,
                "denying admission"
            );
            response.deny(e.to_string())
        }
    }
}

fn decode<K: DeserializeOwned>(object: &DynamicObject) -> Result<K> {
    let value = serde_json::to_value(object)?;
    serde_json::from_value(value).map_err(|e| Error::validation(format!("malformed object: {e}")))
}
