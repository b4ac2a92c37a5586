//! Audit configuration.
//!
//! Every field is an `Option` override; `None` falls back to the matching
//! `DEFAULT_*` constant. Environment reading is isolated in
//! [`AuditConfig::from_env`] so library code never touches the process
//! environment on its own.

use std::time::Duration;

/// Replay timeout when none is configured.
pub const DEFAULT_REPLAY_TIMEOUT: Duration = Duration::from_secs(30);

/// Object keys stripped from bundles before hashing.
pub const DEFAULT_VOLATILE_KEYS: &[&str] = &["generated_at", "generated_at_utc", "created_at"];

/// Key id recorded in `signature.json` when none is configured.
pub const DEFAULT_KEY_ID: &str = "default";

pub const ENV_REPLAY_TIMEOUT_MS: &str = "MRV_REPLAY_TIMEOUT_MS";
pub const ENV_HMAC_KEY: &str = "EVIDENCE_PACK_HMAC_KEY";
pub const ENV_KEY_ID: &str = "EVIDENCE_PACK_KEY_ID";

/// Pre-shared HMAC key for evidence pack signatures.
#[derive(Clone, PartialEq, Eq)]
pub struct SigningKey {
    key_id: String,
    secret: Vec<u8>,
}

impl SigningKey {
    #[must_use]
    pub fn new(key_id: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            key_id: key_id.into(),
            secret: secret.into(),
        }
    }

    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    #[must_use]
    pub fn secret(&self) -> &[u8] {
        &self.secret
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("key_id", &self.key_id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} is not a valid value: {detail}")]
    InvalidValue { var: &'static str, detail: String },
}

#[derive(Debug, Clone, Default)]
pub struct AuditConfig {
    /// Upper bound on one calculation engine call during replay.
    pub replay_timeout: Option<Duration>,
    /// `None` produces unsigned packs.
    pub signing_key: Option<SigningKey>,
    pub volatile_keys: Option<Vec<String>>,
}

impl AuditConfig {
    /// Read overrides from the process environment.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidValue`] when a variable is set but unusable.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Read overrides through `lookup`. Unset and empty values mean "use
    /// the default".
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidValue`] when a variable is set but unusable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let replay_timeout = match get(ENV_REPLAY_TIMEOUT_MS) {
            None => None,
            Some(raw) => {
                let ms: u64 = raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
                    var: ENV_REPLAY_TIMEOUT_MS,
                    detail: format!("{raw:?}: {e}"),
                })?;
                if ms == 0 {
                    return Err(ConfigError::InvalidValue {
                        var: ENV_REPLAY_TIMEOUT_MS,
                        detail: "must be positive".into(),
                    });
                }
                Some(Duration::from_millis(ms))
            }
        };

        let signing_key = get(ENV_HMAC_KEY).map(|secret| {
            let key_id = get(ENV_KEY_ID).unwrap_or_else(|| DEFAULT_KEY_ID.to_string());
            SigningKey::new(key_id, secret.into_bytes())
        });

        Ok(Self {
            replay_timeout,
            signing_key,
            volatile_keys: None,
        })
    }

    #[must_use]
    pub fn replay_timeout(&self) -> Duration {
        self.replay_timeout.unwrap_or(DEFAULT_REPLAY_TIMEOUT)
    }

    #[must_use]
    pub fn signing_key(&self) -> Option<&SigningKey> {
        self.signing_key.as_ref()
    }

    #[must_use]
    pub fn volatile_keys(&self) -> Vec<String> {
        self.volatile_keys.clone().unwrap_or_else(|| {
            DEFAULT_VOLATILE_KEYS
                .iter()
                .map(|k| (*k).to_string())
                .collect()
        })
    }
}
