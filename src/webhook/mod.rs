//! Validating Admission Webhook for fabric CRDs
//!
//! Rejects objects the controllers could never reconcile before they are
//! stored: malformed VLAN lists and hold-down times on provider configs,
//! non-multicast groups on NVEs, and device moves on NVEs and VTEPs.
//!
//! The webhook is stateless; every decision is made from the object (and the
//! old object, on update) carried in the review.

pub mod validation;

use axum::{routing::post, Router};

use crate::crd::{Nve, NveConfig, Vtep, VtepConfig};

/// Create the webhook router with all validation endpoints
///
/// - POST /validate/nves
/// - POST /validate/vteps
/// - POST /validate/nveconfigs
/// - POST /validate/vtepconfigs
pub fn webhook_router() -> Router {
    Router::new()
        .route("/validate/nves", post(validation::validate_handler::<Nve>))
        .route("/validate/vteps", post(validation::validate_handler::<Vtep>))
        .route(
            "/validate/nveconfigs",
            post(validation::validate_handler::<NveConfig>),
        )
        .route(
            "/validate/vtepconfigs",
            post(validation::validate_handler::<VtepConfig>),
        )
}
