//! Authorization seam consulted before a host request is forwarded into a
//! snap. The execution service carries payloads; it never interprets them.
use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait PermissionGate: Send + Sync {
    /// Returns `Err(reason)` to reject the request.
    async fn authorize(&self, snap_id: &str, origin: &str, request: &Value) -> Result<(), String>;
}

/// Lets everything through.
pub struct AllowAll;

#[async_trait]
impl PermissionGate for AllowAll {
    async fn authorize(&self, _snap_id: &str, _origin: &str, _request: &Value) -> Result<(), String> {
        Ok(())
    }
}

/// Admits requests from a fixed set of origins. `"*"` admits any origin.
pub struct OriginAllowList {
    origins: Vec<String>,
}

impl OriginAllowList {
    pub fn new(origins: Vec<String>) -> Self {
        Self { origins }
    }

    pub fn is_allowed(&self, origin: &str) -> bool {
        // Compare without a trailing slash so "https://a.io/" == "https://a.io"
        let origin = origin.trim_end_matches('/');
        self.origins
            .iter()
            .any(|allowed| allowed == "*" || allowed.trim_end_matches('/') == origin)
    }
}

#[async_trait]
impl PermissionGate for OriginAllowList {
    async fn authorize(&self, snap_id: &str, origin: &str, _request: &Value) -> Result<(), String> {
        if self.is_allowed(origin) {
            Ok(())
        } else {
            Err(format!("origin {origin} may not call snap {snap_id}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn allow_list(origins: Vec<&str>) -> OriginAllowList {
        OriginAllowList::new(origins.into_iter().map(String::from).collect())
    }

    #[test]
    fn test_is_allowed_exact_origin() {
        let gate = allow_list(vec!["https://metamask.io"]);
        assert!(gate.is_allowed("https://metamask.io"));
    }

    #[test]
    fn test_is_allowed_ignores_trailing_slash() {
        let gate = allow_list(vec!["https://metamask.io/"]);
        assert!(gate.is_allowed("https://metamask.io"));
        assert!(gate.is_allowed("https://metamask.io/"));
    }

    #[test]
    fn test_is_allowed_rejects_other_origins() {
        let gate = allow_list(vec!["https://metamask.io"]);
        assert!(!gate.is_allowed("https://evil.example"));
        // Same host, different scheme
        assert!(!gate.is_allowed("http://metamask.io"));
    }

    #[test]
    fn test_is_allowed_wildcard() {
        let gate = allow_list(vec!["*"]);
        assert!(gate.is_allowed("https://anything.example"));
        assert!(gate.is_allowed("chrome-extension://abc"));
    }

    #[test]
    fn test_empty_list_rejects_all() {
        let gate = allow_list(vec![]);
        assert!(!gate.is_allowed("https://metamask.io"));
    }

    #[tokio::test]
    async fn test_authorize_reports_reason() {
        let gate = allow_list(vec!["https://metamask.io"]);
        let request = json!({"method": "hello"});
        assert!(gate.authorize("npm:a", "https://metamask.io", &request).await.is_ok());

        let err = gate
            .authorize("npm:a", "https://evil.example", &request)
            .await
            .unwrap_err();
        assert!(err.contains("https://evil.example"));
        assert!(err.contains("npm:a"));
    }

    #[tokio::test]
    async fn test_allow_all() {
        assert!(AllowAll.authorize("npm:a", "", &json!(null)).await.is_ok());
    }
}
