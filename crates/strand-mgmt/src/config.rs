//! Per-field validation of administrative settings.
//!
//! A [`SettingsPatch`] arrives from the REST layer as raw field values.
//! Every field is validated independently and all failures are collected
//! into one [`ConfigError`] instead of failing on the first bad field, so
//! an administrator sees the whole damage in a single round trip.

use std::path::PathBuf;

use base64::Engine as _;
use serde::Deserialize;
use thiserror::Error;

use strand_sync::security::SECRET_LEN;
use strand_sync::version::{DomainId, NodeId};
use strand_transport::AuthScheme;

/// One field that failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// The administrative field name.
    pub field: &'static str,
    /// Why the supplied value was rejected.
    pub reason: String,
}

fn errors_summary(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Aggregate of every field that failed validation.
#[derive(Debug, Error)]
#[error("invalid configuration: {}", errors_summary(.errors))]
pub struct ConfigError {
    /// All rejected fields.
    pub errors: Vec<FieldError>,
}

/// Raw administrative mutation request, field names as they appear on the
/// administrative surface.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SettingsPatch {
    /// Cluster listen port for the local node.
    pub local_node_port: Option<String>,
    /// Interface the local address is derived from.
    pub local_node_iface: Option<String>,
    /// Hostname peers use to reach the local node.
    pub local_node_host: Option<String>,
    /// Election domain of the local node.
    pub local_domain_id: Option<String>,
    /// Comma-separated `host:port` discovery seed list.
    pub seeds: Option<String>,
    /// Replace the seed set and re-run the bootstrap path.
    pub reseed: Option<bool>,
    /// Remove a node from the cluster registry.
    pub delete_node: Option<String>,
    /// Trigger a new election for the local node's domain.
    pub new_election: Option<ElectionTrigger>,
    /// Reconfigure peer authentication.
    pub local_node_auth: Option<AuthPatch>,
}

/// Election trigger payload.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ElectionTrigger {
    /// Pin the local node as leader regardless of id ordering.
    #[serde(default)]
    pub rigged: bool,
}

/// Raw authentication settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AuthPatch {
    /// `no-auth` or `shared-secret`.
    pub auth_scheme: String,
    /// Keystore file for the cluster secret.
    #[serde(default)]
    pub keystore_path: Option<String>,
    /// Password protecting the keystore.
    #[serde(default)]
    pub keystore_password: Option<String>,
    /// Base64 cluster secret; empty means generate a random one.
    #[serde(default)]
    pub cluster_secret: Option<String>,
}

/// Typed, validated authentication settings.
#[derive(Debug, Clone)]
pub struct AuthSettings {
    /// Scheme peers must satisfy.
    pub scheme: AuthScheme,
    /// Keystore file for the cluster secret.
    pub keystore_path: Option<PathBuf>,
    /// Password protecting the keystore.
    pub keystore_password: Option<String>,
    /// Decoded secret bytes; None means generate one.
    pub cluster_secret: Option<Vec<u8>>,
}

/// Typed result of validating a [`SettingsPatch`].
#[derive(Debug, Clone, Default)]
pub struct ValidatedSettings {
    /// Validated cluster listen port.
    pub local_node_port: Option<u16>,
    /// Validated interface name.
    pub local_node_iface: Option<String>,
    /// Validated hostname.
    pub local_node_host: Option<String>,
    /// Validated election domain.
    pub local_domain_id: Option<DomainId>,
    /// Validated seed addresses.
    pub seeds: Option<Vec<String>>,
    /// Whether to re-run the bootstrap path.
    pub reseed: bool,
    /// Node to remove from the registry.
    pub delete_node: Option<NodeId>,
    /// Rigged flag of a requested election.
    pub new_election: Option<bool>,
    /// Validated authentication settings.
    pub auth: Option<AuthSettings>,
}

fn valid_port(value: &str) -> Result<u16, String> {
    match value.parse::<u16>() {
        Ok(0) => Err("port must be between 1 and 65535".to_string()),
        Ok(port) => Ok(port),
        Err(_) => Err(format!("not a valid port number: {value}")),
    }
}

fn valid_host(value: &str) -> Result<String, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err("hostname must not be empty".to_string());
    }
    if trimmed.contains(char::is_whitespace) {
        return Err(format!("hostname must not contain whitespace: {value:?}"));
    }
    Ok(trimmed.to_string())
}

fn valid_seed(value: &str) -> Result<String, String> {
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| format!("seed must be host:port, got {value:?}"))?;
    valid_host(host)?;
    valid_port(port)?;
    Ok(value.to_string())
}

impl SettingsPatch {
    /// Validate every supplied field, aggregating all failures.
    pub fn validate(self) -> Result<ValidatedSettings, ConfigError> {
        let mut errors = Vec::new();
        let mut settings = ValidatedSettings::default();

        let mut check = |field: &'static str, result: Result<(), String>| {
            if let Err(reason) = result {
                errors.push(FieldError { field, reason });
            }
        };

        if let Some(port) = &self.local_node_port {
            check(
                "local-node-port",
                valid_port(port).map(|p| settings.local_node_port = Some(p)),
            );
        }
        if let Some(iface) = &self.local_node_iface {
            let trimmed = iface.trim();
            if trimmed.is_empty() {
                check(
                    "local-node-iface",
                    Err("interface name must not be empty".to_string()),
                );
            } else {
                settings.local_node_iface = Some(trimmed.to_string());
            }
        }
        if let Some(host) = &self.local_node_host {
            check(
                "local-node-host",
                valid_host(host).map(|h| settings.local_node_host = Some(h)),
            );
        }
        if let Some(domain) = &self.local_domain_id {
            check(
                "local-domain-id",
                domain
                    .parse::<DomainId>()
                    .map_err(|_| format!("not a valid domain id: {domain}"))
                    .map(|d| settings.local_domain_id = Some(d)),
            );
        }
        if let Some(seeds) = &self.seeds {
            let mut parsed = Vec::new();
            let mut ok = true;
            for seed in seeds.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                match valid_seed(seed) {
                    Ok(seed) => parsed.push(seed),
                    Err(reason) => {
                        check("seeds", Err(reason));
                        ok = false;
                    }
                }
            }
            if ok {
                settings.seeds = Some(parsed);
            }
        }
        settings.reseed = self.reseed.unwrap_or(false);
        if let Some(node) = &self.delete_node {
            check(
                "delete-node",
                node.parse::<NodeId>()
                    .map_err(|_| format!("not a valid node id: {node}"))
                    .map(|n| settings.delete_node = Some(n)),
            );
        }
        if let Some(trigger) = &self.new_election {
            settings.new_election = Some(trigger.rigged);
        }
        if let Some(auth) = self.local_node_auth {
            match validate_auth(auth) {
                Ok(auth) => settings.auth = Some(auth),
                Err(mut auth_errors) => errors.append(&mut auth_errors),
            }
        }

        if errors.is_empty() {
            Ok(settings)
        } else {
            Err(ConfigError { errors })
        }
    }
}

fn validate_auth(patch: AuthPatch) -> Result<AuthSettings, Vec<FieldError>> {
    let mut errors = Vec::new();

    let scheme = match patch.auth_scheme.parse::<AuthScheme>() {
        Ok(scheme) => Some(scheme),
        Err(reason) => {
            errors.push(FieldError {
                field: "auth-scheme",
                reason,
            });
            None
        }
    };

    let keystore_path = patch
        .keystore_path
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(PathBuf::from);
    let keystore_password = patch.keystore_password.filter(|p| !p.is_empty());

    if scheme == Some(AuthScheme::SharedSecret) {
        if keystore_path.is_none() {
            errors.push(FieldError {
                field: "keystore-path",
                reason: "required for the shared-secret scheme".to_string(),
            });
        }
        if keystore_password.is_none() {
            errors.push(FieldError {
                field: "keystore-password",
                reason: "required for the shared-secret scheme".to_string(),
            });
        }
    }

    // An empty secret asks the service to generate one.
    let cluster_secret = match patch.cluster_secret.as_deref().filter(|s| !s.is_empty()) {
        None => None,
        Some(encoded) => match base64::engine::general_purpose::STANDARD.decode(encoded) {
            Ok(bytes) if bytes.len() == SECRET_LEN => Some(bytes),
            Ok(bytes) => {
                errors.push(FieldError {
                    field: "cluster-secret",
                    reason: format!(
                        "secret must be {SECRET_LEN} bytes, got {}",
                        bytes.len()
                    ),
                });
                None
            }
            Err(_) => {
                errors.push(FieldError {
                    field: "cluster-secret",
                    reason: "not valid base64".to_string(),
                });
                None
            }
        },
    };

    match (scheme, errors.is_empty()) {
        (Some(scheme), true) => Ok(AuthSettings {
            scheme,
            keystore_path,
            keystore_password,
            cluster_secret,
        }),
        _ => Err(errors),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;

    #[test]
    fn test_empty_patch_validates_to_defaults() {
        let settings = SettingsPatch::default().validate().unwrap();
        assert!(settings.local_node_port.is_none());
        assert!(settings.seeds.is_none());
        assert!(!settings.reseed);
        assert!(settings.auth.is_none());
    }

    #[test]
    fn test_valid_fields_pass_through() {
        let patch = SettingsPatch {
            local_node_port: Some("6642".to_string()),
            local_node_host: Some("ctl-1.example".to_string()),
            local_node_iface: Some("eth0".to_string()),
            local_domain_id: Some("3".to_string()),
            seeds: Some("10.0.0.1:6642, 10.0.0.2:6642".to_string()),
            delete_node: Some("7".to_string()),
            new_election: Some(ElectionTrigger { rigged: true }),
            ..SettingsPatch::default()
        };
        let settings = patch.validate().unwrap();
        assert_eq!(settings.local_node_port, Some(6642));
        assert_eq!(settings.local_node_host.as_deref(), Some("ctl-1.example"));
        assert_eq!(settings.local_node_iface.as_deref(), Some("eth0"));
        assert_eq!(settings.local_domain_id, Some(3));
        assert_eq!(
            settings.seeds.as_deref(),
            Some(&["10.0.0.1:6642".to_string(), "10.0.0.2:6642".to_string()][..])
        );
        assert_eq!(settings.delete_node, Some(7));
        assert_eq!(settings.new_election, Some(true));
    }

    #[test]
    fn test_all_bad_fields_reported_together() {
        let patch = SettingsPatch {
            local_node_port: Some("0".to_string()),
            local_node_host: Some("  ".to_string()),
            local_domain_id: Some("ninety".to_string()),
            delete_node: Some("-1".to_string()),
            ..SettingsPatch::default()
        };
        let err = patch.validate().unwrap_err();
        let fields: Vec<_> = err.errors.iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec![
                "local-node-port",
                "local-node-host",
                "local-domain-id",
                "delete-node"
            ]
        );
        let display = err.to_string();
        assert!(display.contains("local-node-port"));
        assert!(display.contains("delete-node"));
    }

    #[test]
    fn test_seed_list_rejects_bad_entries() {
        let patch = SettingsPatch {
            seeds: Some("10.0.0.1:6642,not-a-seed".to_string()),
            ..SettingsPatch::default()
        };
        let err = patch.validate().unwrap_err();
        assert_eq!(err.errors[0].field, "seeds");
    }

    #[test]
    fn test_empty_seed_list_clears_seeds() {
        let patch = SettingsPatch {
            seeds: Some("".to_string()),
            ..SettingsPatch::default()
        };
        let settings = patch.validate().unwrap();
        assert_eq!(settings.seeds.as_deref(), Some(&[][..]));
    }

    #[test]
    fn test_auth_shared_secret_requires_keystore() {
        let patch = SettingsPatch {
            local_node_auth: Some(AuthPatch {
                auth_scheme: "shared-secret".to_string(),
                keystore_path: None,
                keystore_password: None,
                cluster_secret: None,
            }),
            ..SettingsPatch::default()
        };
        let err = patch.validate().unwrap_err();
        let fields: Vec<_> = err.errors.iter().map(|e| e.field).collect();
        assert_eq!(fields, vec!["keystore-path", "keystore-password"]);
    }

    #[test]
    fn test_auth_secret_decoding() {
        let secret = vec![9u8; SECRET_LEN];
        let encoded = base64::engine::general_purpose::STANDARD.encode(&secret);
        let patch = SettingsPatch {
            local_node_auth: Some(AuthPatch {
                auth_scheme: "shared-secret".to_string(),
                keystore_path: Some("/etc/strand/cluster.ks".to_string()),
                keystore_password: Some("pw".to_string()),
                cluster_secret: Some(encoded),
            }),
            ..SettingsPatch::default()
        };
        let auth = patch.validate().unwrap().auth.unwrap();
        assert_eq!(auth.scheme, AuthScheme::SharedSecret);
        assert_eq!(auth.cluster_secret.as_deref(), Some(&secret[..]));
    }

    #[test]
    fn test_auth_empty_secret_means_generate() {
        let patch = SettingsPatch {
            local_node_auth: Some(AuthPatch {
                auth_scheme: "shared-secret".to_string(),
                keystore_path: Some("/etc/strand/cluster.ks".to_string()),
                keystore_password: Some("pw".to_string()),
                cluster_secret: Some(String::new()),
            }),
            ..SettingsPatch::default()
        };
        let auth = patch.validate().unwrap().auth.unwrap();
        assert!(auth.cluster_secret.is_none());
    }

    #[test]
    fn test_auth_rejects_wrong_length_and_bad_encoding() {
        for bad in ["AAAA", "!!!not-base64!!!"] {
            let patch = SettingsPatch {
                local_node_auth: Some(AuthPatch {
                    auth_scheme: "shared-secret".to_string(),
                    keystore_path: Some("/etc/strand/cluster.ks".to_string()),
                    keystore_password: Some("pw".to_string()),
                    cluster_secret: Some(bad.to_string()),
                }),
                ..SettingsPatch::default()
            };
            let err = patch.validate().unwrap_err();
            assert_eq!(err.errors[0].field, "cluster-secret");
        }
    }

    #[test]
    fn test_kebab_case_wire_names() {
        let patch: SettingsPatch = serde_json::from_str(
            r#"{
                "local-node-port": "6642",
                "local-domain-id": "2",
                "new-election": {"rigged": true},
                "local-node-auth": {"auth-scheme": "no-auth"}
            }"#,
        )
        .unwrap();
        let settings = patch.validate().unwrap();
        assert_eq!(settings.local_node_port, Some(6642));
        assert_eq!(settings.local_domain_id, Some(2));
        assert_eq!(settings.new_election, Some(true));
        assert_eq!(settings.auth.unwrap().scheme, AuthScheme::NoAuth);
    }
}
