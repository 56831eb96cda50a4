// Proxy module - Pingora ProxyHttp implementation
//
// Thin HTTP glue around the Gateway pipeline: every request is answered
// directly from request_filter (health check, redirects, artifact
// streaming). There is no upstream passthrough; remote origins are
// reached by the fetch subsystem, not by proxying the client connection.

use async_trait::async_trait;
use bytes::Bytes;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_core::Result;
use pingora_http::ResponseHeader;
use pingora_proxy::{ProxyHttp, Session};
use std::sync::Arc;
use tokio::io::AsyncReadExt;

use crate::constants::COPY_BUFFER_SIZE;
use crate::handler::{Gateway, Reply, ReplyBody, RequestParts};

pub struct GatewayProxy {
    gateway: Arc<Gateway>,
}

impl GatewayProxy {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    async fn send_text(
        &self,
        session: &mut Session,
        status: u16,
        content_type: &str,
        body: &str,
    ) -> Result<()> {
        let mut header = ResponseHeader::build(status, None)?;
        header.insert_header("Content-Type", content_type)?;
        header.insert_header("Content-Length", body.len().to_string())?;
        session
            .write_response_header(Box::new(header), false)
            .await?;
        session
            .write_response_body(Some(Bytes::copy_from_slice(body.as_bytes())), true)
            .await?;
        Ok(())
    }

    async fn send_reply(&self, session: &mut Session, reply: Reply) -> Result<()> {
        match reply.body {
            ReplyBody::Text(text) => {
                let content_type = reply
                    .content_type
                    .unwrap_or_else(|| "text/plain; charset=utf-8".to_string());
                self.send_text(session, reply.status, &content_type, &text)
                    .await
            }
            ReplyBody::Empty => {
                let mut header = ResponseHeader::build(reply.status, None)?;
                if let Some(location) = &reply.location {
                    header.insert_header("Location", location.as_str())?;
                }
                header.insert_header("Content-Length", "0")?;
                session
                    .write_response_header(Box::new(header), false)
                    .await?;
                session.write_response_body(None, true).await?;
                Ok(())
            }
            ReplyBody::File(path) => {
                let (mut file, len) = match tokio::fs::File::open(&path).await {
                    Ok(file) => {
                        let len = file
                            .metadata()
                            .await
                            .map(|m| m.len())
                            .unwrap_or_default();
                        (file, len)
                    }
                    Err(e) => {
                        tracing::error!(path = %path.display(), error = %e, "cannot open artifact");
                        return self
                            .send_text(session, 500, "text/plain; charset=utf-8", "处理图像时出错")
                            .await;
                    }
                };

                let mut header = ResponseHeader::build(reply.status, None)?;
                if let Some(content_type) = &reply.content_type {
                    header.insert_header("Content-Type", content_type.as_str())?;
                }
                if let Some(rate) = &reply.compression_rate {
                    header.insert_header("X-Compression-Rate", rate.as_str())?;
                }
                header.insert_header("Content-Length", len.to_string())?;
                session
                    .write_response_header(Box::new(header), false)
                    .await?;

                let mut buf = vec![0u8; COPY_BUFFER_SIZE];
                loop {
                    let n = match file.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(e) => {
                            tracing::error!(path = %path.display(), error = %e, "read failed mid-stream");
                            break;
                        }
                    };
                    session
                        .write_response_body(Some(Bytes::copy_from_slice(&buf[..n])), false)
                        .await?;
                }
                session.write_response_body(None, true).await?;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl ProxyHttp for GatewayProxy {
    type CTX = ();

    fn new_ctx(&self) -> Self::CTX {}

    /// Never reached: request_filter answers every request.
    async fn upstream_peer(
        &self,
        _session: &mut Session,
        _ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        Err(pingora_core::Error::explain(
            pingora_core::ErrorType::InternalError,
            "gateway serves all requests locally",
        ))
    }

    async fn request_filter(&self, session: &mut Session, _ctx: &mut Self::CTX) -> Result<bool> {
        let req = session.req_header();
        let path = req.uri.path().to_string();
        let query = req.uri.query().unwrap_or("").to_string();

        if path == "/healthz" {
            self.send_text(
                session,
                200,
                "text/plain; charset=utf-8",
                "WebP Server Go up and running!🥳",
            )
            .await?;
            return Ok(true);
        }

        let header = |name: &str| {
            req.headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string())
        };

        let parts = RequestParts {
            path,
            query,
            accept: header("accept"),
            user_agent: header("user-agent"),
        };

        tracing::debug!(path = %parts.path, "incoming request");
        let reply = self.gateway.handle(parts).await;
        self.send_reply(session, reply).await?;
        Ok(true)
    }
}
