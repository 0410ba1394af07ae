pub mod authz;
pub mod config;
pub mod diagram;
pub mod identity;
pub mod presence;
pub mod protocol;
pub mod session;
pub mod storage;
pub mod ws;

use std::sync::Arc;

use config::CollabConfig;
use identity::IdentityResolver;
use presence::PresenceSink;
use session::registry::SessionRegistry;
use storage::DiagramStore;

/// Shared application state passed to the accept loop and every connection.
pub struct AppContext {
    pub config: Arc<CollabConfig>,
    pub store: Arc<dyn DiagramStore>,
    pub identity: Arc<dyn IdentityResolver>,
    pub presence: Arc<dyn PresenceSink>,
    pub registry: Arc<SessionRegistry>,
    pub started_at: std::time::Instant,
}
