use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use wallet_keystore::kdf::{KdfParams, DEFAULT_PRF_HKDF_INFO, MIN_PBKDF2_ITERATIONS};
use wallet_keystore::KeystoreSettings;
use wallet_mdoc::framing::MAX_MESSAGE_SIZE;
use wallet_mdoc::proximity::DEFAULT_ASSUMED_CHUNK_SIZE;
use wallet_mdoc::MdocSettings;
use wallet_openid4vp::TrustPolicy;

use crate::error::{RootError, RootResult};

/// Key container location and key-derivation parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeystoreConfig {
    /// JSON file holding the encrypted key container.
    #[serde(default = "default_container_path")]
    pub container_path: PathBuf,

    /// PBKDF2-SHA256 iterations for new password unlock methods.
    #[serde(default = "default_pbkdf2_iterations")]
    pub pbkdf2_iterations: u32,

    /// WebAuthn relying party id for PRF and hardware-sign ceremonies.
    #[serde(default = "default_rp_id")]
    pub webauthn_rp_id: String,

    /// HKDF info string applied to PRF outputs.
    #[serde(default = "default_prf_hkdf_info")]
    pub prf_hkdf_info: String,
}

fn default_container_path() -> PathBuf {
    dirs_or_default(".wallet/container.json")
}

fn default_pbkdf2_iterations() -> u32 {
    MIN_PBKDF2_ITERATIONS
}

fn default_rp_id() -> String {
    "localhost".to_string()
}

fn default_prf_hkdf_info() -> String {
    DEFAULT_PRF_HKDF_INFO.to_string()
}

impl Default for KeystoreConfig {
    fn default() -> Self {
        Self {
            container_path: default_container_path(),
            pbkdf2_iterations: default_pbkdf2_iterations(),
            webauthn_rp_id: default_rp_id(),
            prf_hkdf_info: default_prf_hkdf_info(),
        }
    }
}

/// Verifier trust and HTTP settings for OpenID4VP presentation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpenId4VpConfig {
    /// Require the response host among the request signer's SAN dNSNames.
    #[serde(default = "default_true")]
    pub san_dns_check: bool,

    /// Compare the verifier's live TLS certificate against the request signer.
    #[serde(default)]
    pub san_dns_check_tls_certs: bool,

    /// Helper service returning the TLS chain of a URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_cert_helper_url: Option<String>,

    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_http_timeout() -> u64 {
    30
}

impl Default for OpenId4VpConfig {
    fn default() -> Self {
        Self {
            san_dns_check: true,
            san_dns_check_tls_certs: false,
            tls_cert_helper_url: None,
            http_timeout_secs: default_http_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MdocConfig {
    #[serde(default = "default_chunk_size")]
    pub assumed_chunk_size: usize,

    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

fn default_chunk_size() -> usize {
    DEFAULT_ASSUMED_CHUNK_SIZE
}

fn default_max_message_size() -> usize {
    MAX_MESSAGE_SIZE
}

impl Default for MdocConfig {
    fn default() -> Self {
        Self {
            assumed_chunk_size: default_chunk_size(),
            max_message_size: default_max_message_size(),
            doc_type: None,
            namespace: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence when set.
    #[serde(default = "default_filter")]
    pub filter: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_filter() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            json: false,
        }
    }
}

/// Top-level configuration for the wallet binary.
///
/// Loaded from a TOML file (typically `~/.wallet/config.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WalletConfig {
    #[serde(default)]
    pub keystore: KeystoreConfig,

    #[serde(default)]
    pub openid4vp: OpenId4VpConfig,

    #[serde(default)]
    pub mdoc: MdocConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Returns `$HOME/<suffix>` if HOME is available, otherwise `./<suffix>`.
fn dirs_or_default(suffix: &str) -> PathBuf {
    std::env::var("HOME")
        .map(|h| PathBuf::from(h).join(suffix))
        .unwrap_or_else(|_| PathBuf::from(suffix))
}

impl WalletConfig {
    /// Load configuration from a TOML file. If the file does not exist,
    /// returns a default configuration.
    pub fn load(path: &Path) -> RootResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(RootError::Io)?;
        let config: WalletConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> RootResult<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| RootError::Config(format!("TOML serialize error: {}", e)))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(RootError::Io)?;
        }
        std::fs::write(path, contents).map_err(RootError::Io)?;
        Ok(())
    }

    pub fn validate(&self) -> RootResult<()> {
        if self.keystore.pbkdf2_iterations < MIN_PBKDF2_ITERATIONS {
            return Err(RootError::Config(format!(
                "pbkdf2_iterations must be at least {}, got {}",
                MIN_PBKDF2_ITERATIONS, self.keystore.pbkdf2_iterations
            )));
        }
        if self.keystore.webauthn_rp_id.is_empty() {
            return Err(RootError::Config("webauthn_rp_id must not be empty".into()));
        }
        if self.openid4vp.http_timeout_secs == 0 {
            return Err(RootError::Config("http_timeout_secs must be > 0".into()));
        }
        if self.openid4vp.san_dns_check_tls_certs && self.openid4vp.tls_cert_helper_url.is_none() {
            return Err(RootError::Config(
                "san_dns_check_tls_certs requires tls_cert_helper_url".into(),
            ));
        }
        if self.mdoc.assumed_chunk_size == 0 {
            return Err(RootError::Config("assumed_chunk_size must be > 0".into()));
        }
        if self.mdoc.max_message_size == 0 {
            return Err(RootError::Config("max_message_size must be > 0".into()));
        }
        Ok(())
    }

    /// Return the path to the default config file location.
    pub fn default_config_path() -> PathBuf {
        dirs_or_default(".wallet/config.toml")
    }

    pub fn keystore_settings(&self) -> RootResult<KeystoreSettings> {
        Ok(KeystoreSettings {
            rp_id: self.keystore.webauthn_rp_id.clone(),
            kdf: KdfParams::new(self.keystore.pbkdf2_iterations, &self.keystore.prf_hkdf_info)?,
            ..KeystoreSettings::default()
        })
    }

    pub fn trust_policy(&self) -> TrustPolicy {
        TrustPolicy {
            san_dns_check: self.openid4vp.san_dns_check,
            tls_cert_check: self.openid4vp.san_dns_check_tls_certs,
        }
    }

    pub fn mdoc_settings(&self) -> MdocSettings {
        MdocSettings {
            assumed_chunk_size: self.mdoc.assumed_chunk_size,
            max_message_size: self.mdoc.max_message_size,
            doc_type: self.mdoc.doc_type.clone(),
            namespace: self.mdoc.namespace.clone(),
        }
    }
}
