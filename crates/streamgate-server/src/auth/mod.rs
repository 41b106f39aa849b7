pub mod api_keys;
pub mod middleware;

pub use api_keys::ApiKeyManager;
pub use middleware::{AuthContext, Authenticator, auth_middleware};
