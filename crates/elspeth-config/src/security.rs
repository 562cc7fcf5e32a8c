// elspeth-config/src/security.rs
// ============================================================================
// Module: ELSPETH Security Layer
// Description: Endpoint allowlisting and secret-fingerprint key resolution.
// Purpose: Guard outbound calls and key lookups without silent fallbacks.
// Dependencies: regex, url, tracing, thiserror
// ============================================================================

//! ## Overview
//! In `standard` and `strict` modes every outbound endpoint must match the
//! configured regex allowlist (or the environment-variable override);
//! localhost is always permitted for development loops, and `development`
//! mode bypasses the check with a warning. Strict mode additionally demands
//! explicit security levels on data-touching plugins, formula sanitization
//! on spreadsheet-adjacent sinks, and live (non-static) clients. The
//! secret-fingerprint key resolves through a fixed chain: environment
//! variable first, then the configured key vault; a vault failure is an
//! error, never a fallback to a default key.

// ============================================================================
// SECTION: Imports
// ============================================================================

use regex::Regex;
use thiserror::Error;
use tracing::warn;
use url::Url;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised by the security layer.
#[derive(Debug, Error)]
pub enum SecurityError {
    /// An outbound endpoint is not on the allowlist.
    #[error("endpoint '{endpoint}' is not on the approved allowlist")]
    EndpointDenied {
        /// The denied endpoint.
        endpoint: String,
    },
    /// The endpoint could not be parsed as a URL.
    #[error("endpoint '{endpoint}' is not a valid url: {message}")]
    MalformedEndpoint {
        /// The unparsable endpoint.
        endpoint: String,
        /// Parser error text.
        message: String,
    },
    /// An allowlist pattern failed to compile.
    #[error("allowlist pattern '{pattern}' is not a valid regex: {message}")]
    MalformedPattern {
        /// The bad pattern.
        pattern: String,
        /// Compiler error text.
        message: String,
    },
    /// The secret-fingerprint key is not configured anywhere in the chain.
    #[error("secret fingerprint key is not configured: {0}")]
    KeyMissing(String),
    /// The key vault was configured but retrieval failed. This is never
    /// silently downgraded to a default key.
    #[error("key vault retrieval failed for '{secret_name}': {message}")]
    VaultFailure {
        /// Secret that was requested.
        secret_name: String,
        /// Vault error text.
        message: String,
    },
    /// A strict-mode requirement is unmet.
    #[error("strict security mode violation: {0}")]
    StrictViolation(String),
}

// ============================================================================
// SECTION: Security Mode
// ============================================================================

/// Outbound-call security posture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
    /// Allowlist bypassed with a warning; for local development only.
    Development,
    /// Allowlist enforced.
    Standard,
    /// Allowlist enforced plus explicit security levels, formula
    /// sanitization, and live clients demanded.
    Strict,
}

impl SecurityMode {
    /// Parses a settings literal.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::StrictViolation`] for unknown literals.
    pub fn parse(literal: &str) -> Result<Self, SecurityError> {
        match literal {
            "development" => Ok(Self::Development),
            "standard" => Ok(Self::Standard),
            "strict" => Ok(Self::Strict),
            other => Err(SecurityError::StrictViolation(format!(
                "unknown security mode '{other}'"
            ))),
        }
    }
}

// ============================================================================
// SECTION: Endpoint Guard
// ============================================================================

/// Validates outbound endpoints against the approved allowlist.
#[derive(Debug)]
pub struct EndpointGuard {
    /// Active mode.
    mode: SecurityMode,
    /// Compiled allowlist patterns.
    patterns: Vec<Regex>,
}

impl EndpointGuard {
    /// Compiles the guard from configured patterns plus an optional
    /// environment-variable override (comma-separated patterns).
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::MalformedPattern`] for invalid regexes.
    pub fn new(
        mode: SecurityMode,
        configured: &[String],
        env_override: Option<&str>,
    ) -> Result<Self, SecurityError> {
        let mut raw_patterns: Vec<String> = configured.to_vec();
        if let Some(variable) = env_override
            && let Ok(value) = std::env::var(variable)
        {
            raw_patterns
                .extend(value.split(',').map(str::trim).filter(|p| !p.is_empty()).map(String::from));
        }
        let mut patterns = Vec::with_capacity(raw_patterns.len());
        for pattern in raw_patterns {
            patterns.push(Regex::new(&pattern).map_err(|err| SecurityError::MalformedPattern {
                pattern: pattern.clone(),
                message: err.to_string(),
            })?);
        }
        Ok(Self {
            mode,
            patterns,
        })
    }

    /// Checks an outbound endpoint.
    ///
    /// Localhost is always permitted. Development mode permits everything
    /// with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::EndpointDenied`] when no pattern matches and
    /// [`SecurityError::MalformedEndpoint`] for unparsable endpoints.
    pub fn check(&self, endpoint: &str) -> Result<(), SecurityError> {
        let parsed = Url::parse(endpoint).map_err(|err| SecurityError::MalformedEndpoint {
            endpoint: endpoint.to_string(),
            message: err.to_string(),
        })?;
        if let Some(host) = parsed.host_str()
            && (host == "localhost" || host == "127.0.0.1" || host == "::1")
        {
            return Ok(());
        }
        if self.mode == SecurityMode::Development {
            warn!(endpoint, "development mode: endpoint allowlist bypassed");
            return Ok(());
        }
        if self.patterns.iter().any(|pattern| pattern.is_match(endpoint)) {
            return Ok(());
        }
        Err(SecurityError::EndpointDenied {
            endpoint: endpoint.to_string(),
        })
    }
}

// ============================================================================
// SECTION: Key Vault
// ============================================================================

/// A key-vault backend the fingerprint chain can query.
pub trait KeyVaultClient {
    /// Fetches a named secret from the vault at `vault_url`.
    ///
    /// # Errors
    ///
    /// Returns the vault's error text when retrieval fails.
    fn fetch_secret(&self, vault_url: &str, secret_name: &str) -> Result<String, String>;
}

/// Resolves the secret-fingerprint key through the lookup chain.
///
/// Order: the environment variable first, then the configured key vault.
/// Missing configuration is a typed error, and a vault failure never falls
/// back to a default key.
///
/// # Errors
///
/// Returns [`SecurityError::KeyMissing`] when nothing is configured and
/// [`SecurityError::VaultFailure`] when the vault errors.
pub fn secret_fingerprint_key(
    env_var: &str,
    vault: Option<(&dyn KeyVaultClient, &str, &str)>,
) -> Result<String, SecurityError> {
    if let Ok(value) = std::env::var(env_var)
        && !value.is_empty()
    {
        return Ok(value);
    }
    match vault {
        Some((client, vault_url, secret_name)) => {
            client.fetch_secret(vault_url, secret_name).map_err(|message| {
                SecurityError::VaultFailure {
                    secret_name: secret_name.to_string(),
                    message,
                }
            })
        }
        None => Err(SecurityError::KeyMissing(format!(
            "set {env_var} or configure a key vault source"
        ))),
    }
}

// ============================================================================
// SECTION: Strict Mode Checks
// ============================================================================

/// Demands the strict-mode plugin requirements.
///
/// Each entry is `(role, plugin_name, config)` where role is `source`,
/// `llm`, or `sink`. Every entry must declare `security_level`; CSV and
/// spreadsheet sinks must sanitize formulas; static or mock clients are
/// disallowed. A missing telemetry sink is a warning, not an error.
///
/// # Errors
///
/// Returns [`SecurityError::StrictViolation`] naming the first violation.
pub fn enforce_strict_mode(
    plugins: &[(&str, &str, &serde_json::Value)],
    has_telemetry: bool,
) -> Result<(), SecurityError> {
    for (role, name, config) in plugins {
        if config.get("security_level").and_then(serde_json::Value::as_str).is_none() {
            return Err(SecurityError::StrictViolation(format!(
                "{role} plugin '{name}' must declare an explicit security_level"
            )));
        }
        if *role == "sink"
            && (*name == "csv" || *name == "excel")
            && !config
                .get("sanitize_formulas")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false)
        {
            return Err(SecurityError::StrictViolation(format!(
                "sink '{name}' must enable sanitize_formulas in strict mode"
            )));
        }
        if *role == "llm" && (*name == "static" || *name == "mock") {
            return Err(SecurityError::StrictViolation(format!(
                "client '{name}' is not permitted in strict mode"
            )));
        }
    }
    if !has_telemetry {
        warn!("strict mode without a telemetry sink: external calls will not be exported");
    }
    Ok(())
}
