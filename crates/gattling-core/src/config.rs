//! Server configuration
//!
//! Everything the embedding application decides at start time: naming,
//! adapter behavior flags, the initialization timeout and retry tuning.
//! Validation happens once, before the worker thread is spawned.

use std::time::Duration;

use crate::error::{BusError, BusResult};
use crate::retry::RetryPolicy;

/// Base token every service name must carry: the name is either exactly this
/// or `"<base>.<suffix>"`, which also scopes the D-Bus bus name and object
/// paths.
pub const SERVICE_NAME_BASE: &str = "gattling";

/// Longest service name we accept.
pub const MAX_SERVICE_NAME_LEN: usize = 255;

/// Advertised names longer than this are truncated (Advertising Data limit).
pub const MAX_ADVERTISING_NAME_LEN: usize = 248;

/// Cap for the shortened form used when the full name does not fit.
pub const MAX_ADVERTISING_SHORT_NAME_LEN: usize = 10;

const MIN_INIT_TIMEOUT: Duration = Duration::from_millis(100);
const MAX_INIT_TIMEOUT: Duration = Duration::from_secs(60);

// ----------------------------------------------------------------------------
// Server Configuration
// ----------------------------------------------------------------------------

/// Configuration for a peripheral server instance.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Service name; must be [`SERVICE_NAME_BASE`] or start with
    /// `"<base>."`. Stored lowercase.
    pub service_name: String,
    /// Controller name advertised over LE. Empty leaves the adapter alias
    /// untouched.
    pub advertising_name: String,
    /// Short form of the advertised name.
    pub advertising_short_name: String,
    /// Whether the adapter should accept pairing/bonding requests.
    pub enable_bondable: bool,
    /// Whether the adapter is made discoverable during configuration.
    pub enable_discoverable: bool,
    /// Whether advertising is enabled during configuration.
    pub enable_advertising: bool,
    /// How long `start()` blocks waiting for initialization.
    pub init_timeout: Duration,
    /// Adapter hint: object path, address, or path substring. When unset the
    /// `GATTLING_ADAPTER` environment variable is consulted.
    pub preferred_adapter: Option<String>,
    /// Log the discovered adapter list during configuration. When unset the
    /// `GATTLING_LIST_ADAPTERS` environment variable is consulted.
    pub list_adapters: bool,
    /// Backoff for generic adapter operations.
    pub retry_policy: RetryPolicy,
    /// Backoff for advertising registration.
    pub advertising_retry_policy: RetryPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            service_name: SERVICE_NAME_BASE.to_string(),
            advertising_name: String::new(),
            advertising_short_name: String::new(),
            enable_bondable: true,
            enable_discoverable: true,
            enable_advertising: true,
            init_timeout: Duration::from_secs(10),
            preferred_adapter: None,
            list_adapters: false,
            retry_policy: RetryPolicy::default(),
            advertising_retry_policy: RetryPolicy::advertising(),
        }
    }
}

impl ServerConfig {
    /// Configuration for the given service name with defaults for the rest.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }

    /// Validate and normalize. Folds the service name to lowercase and
    /// resolves environment overrides; returns the effective configuration.
    pub fn validated(mut self) -> BusResult<Self> {
        if self.service_name.is_empty() {
            return Err(BusError::invalid_args("service name must not be empty"));
        }
        if self.service_name.len() > MAX_SERVICE_NAME_LEN {
            return Err(BusError::invalid_args(format!(
                "service name too long ({} > {MAX_SERVICE_NAME_LEN})",
                self.service_name.len()
            )));
        }

        self.service_name = self.service_name.to_lowercase();
        if self.service_name != SERVICE_NAME_BASE
            && !self
                .service_name
                .starts_with(&format!("{SERVICE_NAME_BASE}."))
        {
            return Err(BusError::invalid_args(format!(
                "service name must be '{SERVICE_NAME_BASE}' or start with '{SERVICE_NAME_BASE}.' \
                 (e.g. '{SERVICE_NAME_BASE}.myapp')"
            )));
        }

        if self.init_timeout < MIN_INIT_TIMEOUT || self.init_timeout > MAX_INIT_TIMEOUT {
            return Err(BusError::invalid_args(format!(
                "init timeout {:?} outside [{MIN_INIT_TIMEOUT:?}, {MAX_INIT_TIMEOUT:?}]",
                self.init_timeout
            )));
        }

        if self.preferred_adapter.is_none() {
            self.preferred_adapter = std::env::var("GATTLING_ADAPTER").ok().filter(|s| !s.is_empty());
        }
        if !self.list_adapters {
            self.list_adapters = std::env::var("GATTLING_LIST_ADAPTERS").is_ok();
        }

        Ok(self)
    }

    /// The bus name this server owns: `com.<service name>`.
    pub fn owned_name(&self) -> String {
        format!("com.{}", self.service_name)
    }

    /// Root object path, with name dots mapped to path separators:
    /// `gattling.myapp` becomes `/com/gattling/myapp`.
    pub fn root_path(&self) -> String {
        format!("/com/{}", self.service_name.replace('.', "/"))
    }

    /// Object path of the single advertisement object.
    pub fn advertisement_path(&self) -> String {
        format!("{}/advertisement0", self.root_path())
    }

    /// Advertised name truncated to the Advertising Data budget.
    pub fn truncated_advertising_name(&self) -> &str {
        truncate_on_char_boundary(&self.advertising_name, MAX_ADVERTISING_NAME_LEN)
    }

    /// Short advertised name truncated to its budget.
    pub fn truncated_advertising_short_name(&self) -> &str {
        truncate_on_char_boundary(&self.advertising_short_name, MAX_ADVERTISING_SHORT_NAME_LEN)
    }
}

fn truncate_on_char_boundary(name: &str, max_len: usize) -> &str {
    if name.len() <= max_len {
        return name;
    }
    let mut end = max_len;
    while end > 0 && !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
