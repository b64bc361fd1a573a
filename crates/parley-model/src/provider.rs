// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;

use crate::{CompletionRequest, ResponseEvent};

/// Failures a model endpoint can surface.
///
/// `EndpointUnreachable` and `ModelNotFound` are fatal to the conversation;
/// the orchestration layer terminates the run when it sees them.
/// `InvocationTimeout` and `MalformedResponse` are handled per turn.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ModelError {
    #[error("endpoint unreachable: {0}")]
    EndpointUnreachable(String),
    #[error("model not found: {0}")]
    ModelNotFound(String),
    #[error("model invocation timed out after {0:?}")]
    InvocationTimeout(Duration),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl ModelError {
    /// Stable discriminator used in observer error events.
    pub fn kind(&self) -> &'static str {
        match self {
            ModelError::EndpointUnreachable(_) => "endpoint_unreachable",
            ModelError::ModelNotFound(_) => "model_not_found",
            ModelError::InvocationTimeout(_) => "timeout",
            ModelError::MalformedResponse(_) => "protocol",
        }
    }
}

pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<ResponseEvent, ModelError>> + Send>>;

#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Driver name for status display.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Send a completion request and return a streaming response.
    async fn complete(&self, req: CompletionRequest) -> Result<ResponseStream, ModelError>;

    /// Minimal endpoint probe: list the model ids the endpoint advertises.
    ///
    /// Used by the `check-endpoint` command.  The default implementation
    /// reports the configured model only, for drivers without a listing API.
    async fn list_models(&self) -> Result<Vec<String>, ModelError> {
        Ok(vec![self.model_name().to_string()])
    }
}
