// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Direct HTTP transport to the backend.

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::{BackendRequest, BackendResponse, Transport};
use crate::backend::BackendDescriptor;
use crate::error::{PairingError, Result};

/// Calls the backend over plain HTTP(S) with bearer authentication.
#[derive(Debug, Clone, Default)]
pub struct DirectTransport {
    client: reqwest::Client,
}

impl DirectTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for DirectTransport {
    fn name(&self) -> &'static str {
        "direct"
    }

    #[instrument(skip(self, descriptor, request), fields(method = %request.method, path = %request.path))]
    async fn send(
        &self,
        descriptor: &BackendDescriptor,
        request: &BackendRequest,
    ) -> Result<BackendResponse> {
        let url = descriptor.endpoint_url(&request.path);

        let mut builder = self
            .client
            .request(request.method.to_reqwest(), &url)
            .bearer_auth(descriptor.credential())
            .timeout(request.timeout);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, request))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| map_reqwest_error(e, request))?;

        debug!(status, "Backend answered");
        Ok(BackendResponse::from_text(status, &text))
    }
}

pub(crate) fn map_reqwest_error(err: reqwest::Error, request: &BackendRequest) -> PairingError {
    if err.is_timeout() {
        PairingError::RequestTimeout(request.timeout)
    } else {
        PairingError::Transport(err.to_string())
    }
}
