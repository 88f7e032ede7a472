// =============================================================================
// Trellis Matrix NextServer - Federation Sending
// =============================================================================
//
// Project: Trellis - Matrix NextServer Federation Ingest Engine
// Contributors: Trellis Development Team
// Date: 2025-06-14
// Version: 0.4.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Outbound server-to-server requests: ruma request construction, X-Matrix
//   request signing with the local Ed25519 key, and dispatch through the
//   transport collaborator. The fetch unit uses the split prepare/dispatch
//   pair so construction errors surface synchronously while the wire round
//   trip runs as its own task.
//
// =============================================================================

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use http::{header::AUTHORIZATION, HeaderValue};
use ruma::{
    api::{IncomingResponse, MatrixVersion, OutgoingRequest, SendAccessToken},
    CanonicalJsonObject, CanonicalJsonValue, ServerName,
};
use tracing::{debug, warn};

use crate::{
    service::{globals, peers},
    Error, Result,
};

/// The wire collaborator. Implementations own connection management, DNS
/// and TLS; the core hands them a complete signed request.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        destination: &ServerName,
        request: http::Request<Vec<u8>>,
    ) -> Result<http::Response<Vec<u8>>>;
}

/// Default transport over reqwest with rustls.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("trellis/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::bad_config(format!("failed to build federation client: {e}")))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(
        &self,
        destination: &ServerName,
        request: http::Request<Vec<u8>>,
    ) -> Result<http::Response<Vec<u8>>> {
        let request = reqwest::Request::try_from(request)
            .map_err(|e| Error::Transport(format!("{destination}: {e}")))?;

        let response = self
            .client
            .execute(request)
            .await
            .map_err(|e| match e.is_timeout() {
                true => Error::Timeout(format!("{destination}: {e}")),
                false => Error::Transport(format!("{destination}: {e}")),
            })?;

        let mut builder = http::Response::builder().status(response.status());
        for (name, value) in response.headers() {
            builder = builder.header(name, value);
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Transport(format!("{destination}: {e}")))?
            .to_vec();

        builder
            .body(body)
            .map_err(|e| Error::Transport(format!("{destination}: {e}")))
    }
}

pub struct Service {
    globals: Arc<globals::Service>,
    peers: Arc<peers::Service>,
    transport: Arc<dyn Transport>,
}

impl Service {
    pub fn new(
        globals: Arc<globals::Service>,
        peers: Arc<peers::Service>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            globals,
            peers,
            transport,
        }
    }

    /// Base URL for a destination. Resolution beyond the default federation
    /// port is the transport's concern.
    fn destination_url(&self, destination: &ServerName) -> String {
        match destination.port() {
            Some(_) => format!("https://{destination}"),
            None => format!("https://{destination}:8448"),
        }
    }

    /// Build and sign the wire form of a federation request. Synchronous;
    /// fails without any I/O having been issued.
    pub fn prepare<T>(&self, destination: &ServerName, request: T) -> Result<http::Request<Vec<u8>>>
    where
        T: OutgoingRequest + Debug,
    {
        let mut http_request = request
            .try_into_http_request::<Vec<u8>>(
                &self.destination_url(destination),
                SendAccessToken::IfRequired(""),
                &[MatrixVersion::V1_11],
            )
            .map_err(|e| Error::BadRequest(format!("invalid federation request: {e}")))?;

        let mut request_map = CanonicalJsonObject::new();

        if !http_request.body().is_empty() {
            request_map.insert(
                "content".to_owned(),
                serde_json::from_slice(http_request.body())
                    .map_err(|_| Error::BadRequest("request body is not JSON".to_owned()))?,
            );
        }

        request_map.insert(
            "method".to_owned(),
            CanonicalJsonValue::String(http_request.method().to_string()),
        );
        request_map.insert(
            "uri".to_owned(),
            CanonicalJsonValue::String(
                http_request
                    .uri()
                    .path_and_query()
                    .expect("all requests have a path")
                    .to_string(),
            ),
        );
        request_map.insert(
            "origin".to_owned(),
            CanonicalJsonValue::String(self.globals.server_name().as_str().to_owned()),
        );
        request_map.insert(
            "destination".to_owned(),
            CanonicalJsonValue::String(destination.as_str().to_owned()),
        );

        ruma::signatures::sign_json(
            self.globals.server_name().as_str(),
            self.globals.keypair(),
            &mut request_map,
        )
        .expect("our request json is canonical");

        let signatures = request_map
            .get("signatures")
            .and_then(|v| v.as_object())
            .and_then(|m| m.get(self.globals.server_name().as_str()))
            .and_then(|v| v.as_object())
            .expect("sign_json added a signature for us");

        for (key_id, signature) in signatures {
            let signature = signature
                .as_str()
                .expect("ruma signatures are strings");

            http_request.headers_mut().insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!(
                    "X-Matrix origin=\"{}\",destination=\"{}\",key=\"{}\",sig=\"{}\"",
                    self.globals.server_name(),
                    destination,
                    key_id,
                    signature,
                ))
                .expect("header value is valid"),
            );
        }

        Ok(http_request)
    }

    /// One wire round trip through the transport, with peer accounting. The
    /// response is returned whatever its status; callers decide what a
    /// non-2xx means for them.
    pub async fn dispatch(
        &self,
        destination: &ServerName,
        request: http::Request<Vec<u8>>,
    ) -> Result<http::Response<Vec<u8>>> {
        let wrote = request.body().len() as u64;

        match self.transport.send(destination, request).await {
            Ok(response) => {
                self.peers
                    .note_io(destination, wrote, response.body().len() as u64);
                Ok(response)
            }
            Err(e) => {
                if !self.globals.shutting_down() {
                    self.peers.errset(destination, e.to_string());
                }
                Err(e)
            }
        }
    }

    /// Send one federation request and parse its typed response.
    #[tracing::instrument(skip(self, request))]
    pub async fn send_federation_request<T>(
        &self,
        destination: &ServerName,
        request: T,
    ) -> Result<T::IncomingResponse>
    where
        T: OutgoingRequest + Debug,
    {
        let prepared = self.prepare(destination, request)?;
        let response = self.dispatch(destination, prepared).await?;

        let status = response.status();
        if !status.is_success() {
            warn!(%destination, %status, "federation request rejected");
            return Err(Error::BadServerResponse(format!(
                "{destination} answered {status}"
            )));
        }

        debug!(%destination, %status, "federation response");

        T::IncomingResponse::try_from_http_response(response)
            .map_err(|e| Error::BadServerResponse(format!("{destination}: {e}")))
    }
}
