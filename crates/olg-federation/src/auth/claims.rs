//! JWT claims structure for administrative bearer credentials.

use serde::{Deserialize, Serialize};

use super::principal::{Capability, Principal};

/// JWT claims embedded in access tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// JWT ID (unique per token).
    pub jti: String,
    /// Subject (principal ID).
    pub sub: String,
    pub username: String,
    /// Issued at (unix timestamp).
    pub iat: i64,
    /// Expiration (unix timestamp).
    pub exp: i64,
    /// Capability names such as `federation:admin`.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl Claims {
    /// Principal described by these claims. Unknown capability names are ignored.
    pub fn principal(&self) -> Principal {
        Principal {
            id: self.sub.clone(),
            username: self.username.clone(),
            capabilities: self
                .capabilities
                .iter()
                .filter_map(|c| c.parse::<Capability>().ok())
                .collect(),
        }
    }
}
