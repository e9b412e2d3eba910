use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Access tokens issued by Intuit live for one hour.
pub const DEFAULT_EXPIRES_IN: i64 = 3600;

/// One OAuth credential pair, scoped to exactly one QuickBooks company (realm) and one owning
/// user, as held by the token store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub realm_id: String,
    pub user_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default = "default_active")]
    pub is_active: bool,

    #[serde(default)]
    pub company_name: Option<String>,

    /// Set by the token manager when the token is inside the refresh threshold. Never stored.
    #[serde(skip)]
    pub needs_refresh: bool,
}

fn default_active() -> bool {
    true
}

impl TokenRecord {
    /// Time left before the access token expires (negative once expired).
    pub fn time_to_expiry(&self, now: DateTime<Utc>) -> Duration {
        self.expires_at - now
    }
}

/// Result of a token lookup: nothing, the token of one realm, or every token of a user.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum TokenLookup {
    #[default]
    None,
    One(TokenRecord),
    Many(Vec<TokenRecord>),
}

impl TokenLookup {
    pub fn is_empty(&self) -> bool {
        match self {
            TokenLookup::None => true,
            TokenLookup::One(_) => false,
            TokenLookup::Many(tokens) => tokens.is_empty(),
        }
    }

    pub fn tokens(&self) -> &[TokenRecord] {
        match self {
            TokenLookup::None => &[],
            TokenLookup::One(token) => std::slice::from_ref(token),
            TokenLookup::Many(tokens) => tokens,
        }
    }

    pub fn tokens_mut(&mut self) -> &mut [TokenRecord] {
        match self {
            TokenLookup::None => &mut [],
            TokenLookup::One(token) => std::slice::from_mut(token),
            TokenLookup::Many(tokens) => tokens,
        }
    }

    /// Find the token for one realm.
    pub fn for_realm(&self, realm_id: &str) -> Option<&TokenRecord> {
        self.tokens().iter().find(|token| token.realm_id == realm_id)
    }

    pub fn into_vec(self) -> Vec<TokenRecord> {
        match self {
            TokenLookup::None => Vec::new(),
            TokenLookup::One(token) => vec![token],
            TokenLookup::Many(tokens) => tokens,
        }
    }
}

/// Parameters for storing a freshly issued token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreTokenParams {
    pub realm_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub company_name: Option<String>,
}

impl StoreTokenParams {
    pub fn new(realm_id: &str, access_token: &str, refresh_token: &str) -> Self {
        StoreTokenParams {
            realm_id: realm_id.to_string(),
            access_token: access_token.to_string(),
            refresh_token: refresh_token.to_string(),
            expires_in: DEFAULT_EXPIRES_IN,
            company_name: None,
        }
    }

    pub fn with_expires_in(mut self, expires_in: i64) -> Self {
        self.expires_in = expires_in;
        self
    }

    pub fn with_company_name(mut self, company_name: &str) -> Self {
        self.company_name = Some(company_name.to_string());
        self
    }
}

/// Outcome of storing a token. `admin_changed` is set when the realm was previously owned by
/// another user, who is then named in `previous_admin`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreTokenResult {
    pub success: bool,

    #[serde(default)]
    pub admin_changed: bool,

    #[serde(default)]
    pub previous_admin: Option<String>,
}

/// Audit entry written once per ownership transfer of a realm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminChangeRecord {
    pub realm_id: String,
    pub previous_admin: String,
    pub new_admin: String,
    pub changed_at: DateTime<Utc>,
}

/// Wrapper around a token sent back from the Intuit OAuth token endpoint.
///
/// Unless you are obtaining tokens yourself, you usually will not need this struct: its values
/// are handed to `store_token()` or `refresh_token()`.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub error: Option<String>,
    pub expires_in: Option<i64>,
    pub x_refresh_token_expires_in: Option<i64>,
    pub token_type: Option<String>,
}

/// Shorten a token for logging: the first nine and last four characters.
pub fn abbreviate_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 13 {
        return String::from("***");
    }

    let prefix: String = chars[..9].iter().collect();
    let suffix: String = chars[chars.len() - 4..].iter().collect();

    format!("{}..{}", prefix, suffix)
}
