// Builder identity resolution. Every host-name quirk of the build fleet is
// handled here and nowhere else.

use crate::constants::{variables, OsPlatform, CURRENT_PLATFORM};

use once_cell::sync::Lazy;
use regex::Regex;

static VALID_BUILDER_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("builder id regex"));

/// Suffix of the old campus domain, dropped from host names.
const CAMPUS_DOMAIN_SUFFIX: &str = ".fhcrc.org";

/// Suffix added by mDNS on macOS hosts.
const MDNS_SUFFIX: &str = ".local";

/// Windows hosts that do not report a DNS domain but live in this one.
const WINDOWS_HOSTS_WITHOUT_DOMAIN: &[&str] = &["windows1", "windows2"];
const WINDOWS_FALLBACK_DOMAIN: &str = "bioconductor.org";

/// Prefix of DHCP-assigned host names that say nothing about the builder.
const DHCP_PREFIX: &str = "dhcp";

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Failed to read the host name: {0}")]
    Hostname(#[source] std::io::Error),

    #[error("Cannot determine builder identity from host name '{node_name}'; set {}", variables::PACKAGEBUILDER_HOST)]
    Ambiguous { node_name: String },

    #[error("Builder identity '{identity}' is not valid")]
    Invalid { identity: String },
}

/// Everything identity resolution depends on, gathered up front so the
/// resolution itself stays a pure function.
#[derive(Debug, Clone)]
pub struct IdentityInputs {
    pub node_name: String,
    pub platform: OsPlatform,
    pub user_dns_domain: Option<String>,
    /// Explicit identity, used only when the host name is ambiguous.
    pub host_override: Option<String>,
}

impl IdentityInputs {
    /// Inputs for the current machine.
    pub fn detect(host_override: Option<String>) -> Result<Self, IdentityError> {
        let node_name = hostname::get()
            .map_err(IdentityError::Hostname)?
            .to_string_lossy()
            .into_owned();
        Ok(Self {
            node_name,
            platform: CURRENT_PLATFORM,
            user_dns_domain: std::env::var(variables::USER_DNS_DOMAIN).ok(),
            host_override,
        })
    }
}

/// Derive the builder identity used as `builder_id` in outbound events.
pub fn resolve_builder_id(inputs: &IdentityInputs) -> Result<String, IdentityError> {
    let mut id = inputs
        .node_name
        .trim()
        .to_lowercase()
        .replace(CAMPUS_DOMAIN_SUFFIX, "");

    if inputs.platform == OsPlatform::Windows {
        let domain = if WINDOWS_HOSTS_WITHOUT_DOMAIN.contains(&id.as_str()) {
            Some(WINDOWS_FALLBACK_DOMAIN.to_string())
        } else {
            inputs
                .user_dns_domain
                .as_deref()
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(str::to_lowercase)
        };
        if let Some(domain) = domain {
            id = format!("{id}.{domain}");
        }
    }

    id = id.replace(MDNS_SUFFIX, "");

    if id.is_empty() || id.starts_with(DHCP_PREFIX) {
        id = inputs
            .host_override
            .as_deref()
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .ok_or_else(|| IdentityError::Ambiguous {
                node_name: inputs.node_name.clone(),
            })?
            .to_string();
    }

    if !VALID_BUILDER_ID.is_match(&id) {
        return Err(IdentityError::Invalid { identity: id });
    }
    Ok(id)
}
