//! Debugging-protocol transport for the takeover engine.
//!
//! [`RemoteSession`] owns one WebSocket connection to a page target;
//! [`CdpDocument`] adapts it to the engine's document seam.

pub mod cdp;
pub mod discovery;
pub mod document;
pub mod error;
pub mod session;

pub use cdp::{CdpClient, CdpEvent};
pub use discovery::PageTarget;
pub use document::CdpDocument;
pub use error::RemoteError;
pub use session::RemoteSession;

use std::sync::Arc;

use takeover_config::RemoteConfig;

/// Connect to the configured endpoint and wrap the session as a host document
pub async fn attach(config: &RemoteConfig) -> Result<Arc<CdpDocument>, RemoteError> {
    let session = RemoteSession::connect(config).await?;
    Ok(Arc::new(CdpDocument::new(Arc::new(session))))
}
