//! Target discovery over the endpoint's HTTP `/json` listing.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::RemoteError;

/// One entry of the `/json` listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageTarget {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    /// Absent when another client already holds the target
    #[serde(default)]
    pub web_socket_debugger_url: Option<String>,
}

impl PageTarget {
    pub fn is_page(&self) -> bool {
        self.kind == "page"
    }
}

pub async fn list_targets(host: &str, port: u16) -> Result<Vec<PageTarget>, RemoteError> {
    let url = format!("http://{}:{}/json", host, port);
    debug!(url = %url, "Listing debugging targets");

    let connection_failed = |e: reqwest::Error| RemoteError::ConnectionFailed {
        url: url.clone(),
        reason: e.to_string(),
    };
    let response = reqwest::get(&url).await.map_err(connection_failed)?;
    let response = response.error_for_status().map_err(connection_failed)?;
    response
        .json::<Vec<PageTarget>>()
        .await
        .map_err(|e| RemoteError::protocol(format!("malformed target listing from {}: {}", url, e)))
}

/// First attachable page target
pub fn pick_page(targets: &[PageTarget]) -> Option<&PageTarget> {
    targets
        .iter()
        .find(|t| t.is_page() && t.web_socket_debugger_url.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"[
        {"id": "W1", "type": "service_worker", "title": "sw", "url": "https://chat.local/sw.js",
         "webSocketDebuggerUrl": "ws://127.0.0.1:9222/devtools/page/W1"},
        {"id": "P0", "type": "page", "title": "busy", "url": "https://chat.local/"},
        {"id": "P1", "type": "page", "title": "Chat", "url": "https://chat.local/app",
         "webSocketDebuggerUrl": "ws://127.0.0.1:9222/devtools/page/P1", "faviconUrl": "x"}
    ]"#;

    #[test]
    fn test_parse_listing() {
        let targets: Vec<PageTarget> = serde_json::from_str(LISTING).unwrap();
        assert_eq!(targets.len(), 3);
        assert_eq!(targets[0].kind, "service_worker");
        assert!(targets[1].web_socket_debugger_url.is_none());
    }

    #[test]
    fn test_pick_first_attachable_page() {
        let targets: Vec<PageTarget> = serde_json::from_str(LISTING).unwrap();
        let page = pick_page(&targets).unwrap();
        assert_eq!(page.id, "P1");
        assert_eq!(
            page.web_socket_debugger_url.as_deref(),
            Some("ws://127.0.0.1:9222/devtools/page/P1")
        );
    }

    #[test]
    fn test_no_page_target() {
        let targets: Vec<PageTarget> = serde_json::from_str(&LISTING.replace("\"page\"", "\"iframe\"")).unwrap();
        assert!(pick_page(&targets).is_none());
    }
}
