use async_trait::async_trait;

use colloquy_core::ids::SessionId;
use colloquy_core::session::ShareRef;

use crate::error::EngineError;

/// Publishes sessions under a shareable reference.
#[async_trait]
pub trait ShareService: Send + Sync {
    async fn share(&self, session_id: &SessionId) -> Result<ShareRef, EngineError>;
    async fn unshare(&self, session_id: &SessionId) -> Result<(), EngineError>;
}

/// Sharing disabled.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoShare;

#[async_trait]
impl ShareService for NoShare {
    async fn share(&self, _session_id: &SessionId) -> Result<ShareRef, EngineError> {
        Err(EngineError::Rejected("sharing is not configured".into()))
    }

    async fn unshare(&self, _session_id: &SessionId) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Deterministic links under a fixed base URL.
#[derive(Clone, Debug)]
pub struct LocalShare {
    base_url: String,
}

impl LocalShare {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ShareService for LocalShare {
    async fn share(&self, session_id: &SessionId) -> Result<ShareRef, EngineError> {
        Ok(ShareRef {
            url: format!("{}/s/{}", self.base_url, session_id),
        })
    }

    async fn unshare(&self, _session_id: &SessionId) -> Result<(), EngineError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_share_builds_url() {
        let sid = SessionId::from_raw("ses_abc");
        let share = LocalShare::new("https://example.test/");
        assert_eq!(share.share(&sid).await.unwrap().url, "https://example.test/s/ses_abc");
        assert!(NoShare.share(&sid).await.is_err());
    }
}
