// Authentication module
// OAuth2 refresh-token lifecycle: exchange, endpoint discovery, single-flight refresh

mod manager;
mod refresh;
mod types;

pub use manager::{TokenManager, DEFAULT_EXPIRY_MARGIN};
pub use refresh::{endpoint_candidates, GLOBAL_TOKEN_URL};
pub use types::{AccessToken, Credentials};
