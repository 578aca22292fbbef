// Copyright (c) 2025 Domo, Inc.
// SPDX-License-Identifier: MIT

//! HTTPS mutating admission webhook.
//!
//! The webhook accepts `AdmissionReview` envelopes carrying pods on
//! `POST /mutate`, computes the scheduling mutation from the current rule
//! caches, and responds with a JSON patch. It always allows admission: a pod
//! with no matching rules, or a protected pod, gets an empty patch.
//!
//! The webhook runs regardless of leadership so pod mutation keeps working
//! across elections; it reads only from the shared caches and never enqueues
//! work.
//!
//! TLS is mandatory. rustls negotiates TLS 1.2/1.3 with AEAD cipher suites
//! only.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use k8s_openapi::api::core::v1::Pod;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use tracing::{debug, error, info, warn};

use crate::config::WebhookConfig;
use crate::constants::WEBHOOK_RESTART_DELAY_SECS;
use crate::context::Context;
use crate::patch::pod_json_patch;
use crate::reconcilers::podassignment::mutate_pod;

/// The mutating admission webhook server.
pub struct WebhookServer {
    config: WebhookConfig,
    ctx: Arc<Context>,
}

impl WebhookServer {
    #[must_use]
    pub fn new(config: WebhookConfig, ctx: Arc<Context>) -> Self {
        Self { config, ctx }
    }

    /// Serve forever, restarting the listener after serve errors.
    ///
    /// # Errors
    ///
    /// Returns an error when the TLS material cannot be loaded or the listen
    /// address does not parse; both are fatal startup problems.
    pub async fn run(&self) -> Result<()> {
        let addr: std::net::SocketAddr = self
            .config
            .listen
            .parse()
            .with_context(|| format!("invalid webhook listen address {:?}", self.config.listen))?;

        // Process-wide TLS provider; ignore the error when another component
        // installed it first
        let _ = rustls::crypto::ring::default_provider().install_default();

        let tls = RustlsConfig::from_pem_file(&self.config.tls_cert_path, &self.config.tls_key_path)
            .await
            .with_context(|| {
                format!(
                    "failed to load webhook TLS material from {} / {}",
                    self.config.tls_cert_path, self.config.tls_key_path
                )
            })?;

        let app = Router::new()
            .route("/mutate", post(mutate_handler))
            .with_state(self.ctx.clone());

        loop {
            info!("Starting webhook server on {}", addr);
            if let Err(e) = axum_server::bind_rustls(addr, tls.clone())
                .serve(app.clone().into_make_service())
                .await
            {
                error!("Failed to listen and serve webhook server: {e}");
            }
            tokio::time::sleep(Duration::from_secs(WEBHOOK_RESTART_DELAY_SECS)).await;
        }
    }
}

/// Handle one pod admission request.
async fn mutate_handler(
    State(ctx): State<Arc<Context>>,
    Json(review): Json<AdmissionReview<Pod>>,
) -> Json<AdmissionReview<DynamicObject>> {
    debug!("Processing mutation request");

    let request: AdmissionRequest<Pod> = match review.try_into() {
        Ok(request) => request,
        Err(e) => {
            warn!("Can't decode admission review: {e}");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    Json(mutate_review(ctx.as_ref(), &request).into_review())
}

/// Compute the admission response for a pod request.
///
/// Admission is always allowed; the response carries the minimal JSON patch
/// between the submitted pod and its mutated shape. The request UID is
/// echoed by construction.
fn mutate_review(ctx: &Context, request: &AdmissionRequest<Pod>) -> AdmissionResponse {
    let response = AdmissionResponse::from(request);

    let Some(pod) = &request.object else {
        return response;
    };

    // Pods created by higher-level controllers arrive without a namespace of
    // their own; the request carries it
    let mut pod = pod.clone();
    if pod.metadata.namespace.is_none() {
        pod.metadata.namespace = Some(request.namespace.clone().unwrap_or_default());
    }

    let mutated = mutate_pod(&ctx.stores, &pod);

    let patch = match pod_json_patch(&pod, &mutated) {
        Ok(patch) => patch,
        Err(e) => {
            warn!("Could not compute pod patch: {e}");
            return AdmissionResponse::invalid(e.to_string());
        }
    };

    debug!("Generated patch with {} operation(s)", patch.0.len());
    match response.with_patch(patch) {
        Ok(response) => response,
        Err(e) => {
            warn!("Could not serialize pod patch: {e}");
            AdmissionResponse::invalid(e.to_string())
        }
    }
}

#[cfg(test)]
#[path = "webhook_tests.rs"]
mod webhook_tests;
