//! src/context_store.rs
//!
//! On-disk certificate store under `<private_app_directory>/sonar/`.
//! Grounded on `xplat/Flipper/ConnectionContextStore.cpp`: same file names,
//! same "cache in memory, fall back to disk, regenerate on loss" CSR
//! semantics, same `resetState`/`getCertificate` behaviour.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{info, warn};

use crate::crypto;
use crate::error::{Error, Result};
use crate::wire::Medium;

const CSR_FILE: &str = "app.csr";
const PRIVATE_KEY_FILE: &str = "privateKey.pem";
const CA_CERT_FILE: &str = "sonarCA.crt";
const CLIENT_CERT_FILE: &str = "device.crt";
const PKCS12_FILE: &str = "device.p12";
const CONFIG_FILE: &str = "connection_config.json";

const PKCS12_PASSWORD: &str = "fl1pp3r";
const PKCS12_FRIENDLY_NAME: &str = "sonar";

/// Persists CSR, keypair, CA cert, client cert and connection config under
/// `<private_app_directory>/sonar/`.
pub struct ContextStore {
    private_app_directory: PathBuf,
    app_id: String,
    fallback_device_id: String,
    csr_cache: Mutex<Option<String>>,
}

impl ContextStore {
    pub fn new(
        private_app_directory: impl Into<PathBuf>,
        app_id: impl Into<String>,
        fallback_device_id: impl Into<String>,
    ) -> Self {
        Self {
            private_app_directory: private_app_directory.into(),
            app_id: app_id.into(),
            fallback_device_id: fallback_device_id.into(),
            csr_cache: Mutex::new(None),
        }
    }

    /// Directory all certificate artefacts live under.
    pub fn cert_dir(&self) -> PathBuf {
        self.private_app_directory.join("sonar")
    }

    fn path(&self, name: &str) -> PathBuf {
        self.cert_dir().join(name)
    }

    /// True iff the CA cert, client cert, private key and config are all
    /// present. The CSR is intentionally not part of this check: a trusted
    /// store that has already been signed no longer needs it.
    pub fn has_required_files(&self) -> bool {
        self.path(CA_CERT_FILE).is_file()
            && self.path(CLIENT_CERT_FILE).is_file()
            && self.path(PRIVATE_KEY_FILE).is_file()
            && self.path(CONFIG_FILE).is_file()
    }

    /// Returns the PEM CSR, generating a fresh RSA-2048 keypair and CSR if
    /// none is cached or on disk. Idempotent: repeated calls return the same
    /// CSR until `reset_state` is invoked.
    pub fn certificate_signing_request(&self) -> Result<String> {
        if let Some(cached) = self.csr_cache.lock().clone() {
            return Ok(cached);
        }

        let csr_path = self.path(CSR_FILE);
        let key_path = self.path(PRIVATE_KEY_FILE);
        if csr_path.is_file() && key_path.is_file() {
            let csr = fs::read_to_string(&csr_path)?;
            *self.csr_cache.lock() = Some(csr.clone());
            return Ok(csr);
        }

        info!(app_id = %self.app_id, "no cached CSR on disk, resetting store and generating a fresh one");
        self.reset_state();

        let generated = crypto::generate_csr(&self.app_id)?;
        fs::create_dir_all(self.cert_dir())?;
        fs::write(&csr_path, &generated.csr_pem)?;
        fs::write(&key_path, &generated.private_key_pem)?;

        let csr = String::from_utf8(generated.csr_pem)
            .map_err(|e| Error::Internal(format!("CSR PEM was not valid UTF-8: {e}")))?;
        *self.csr_cache.lock() = Some(csr.clone());
        Ok(csr)
    }

    /// Device id as recorded by the desktop in the last stored config, or
    /// the platform-supplied fallback if no config is stored yet.
    pub fn device_id(&self) -> String {
        self.stored_config()
            .and_then(|config| config.get("deviceId").and_then(Value::as_str).map(String::from))
            .unwrap_or_else(|| self.fallback_device_id.clone())
    }

    /// Certificate-exchange medium recorded in the last stored config.
    pub fn last_known_medium(&self) -> Option<Medium> {
        self.stored_config()
            .and_then(|config| config.get("medium").and_then(Value::as_i64))
            .map(|raw| if raw == Medium::Www as i64 { Medium::Www } else { Medium::FsAccess })
    }

    fn stored_config(&self) -> Option<Value> {
        let text = fs::read_to_string(self.path(CONFIG_FILE)).ok()?;
        serde_json::from_str(&text).ok()
    }

    /// Atomically overwrites the connection config file. Caller must include
    /// `medium` and `deviceId`.
    pub fn store_connection_config(&self, config: &Value) -> Result<()> {
        fs::create_dir_all(self.cert_dir())?;
        let tmp = self.path(CONFIG_FILE).with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(config)?)?;
        fs::rename(&tmp, self.path(CONFIG_FILE))?;
        Ok(())
    }

    /// Deletes every artefact and clears the CSR cache; recreates the
    /// directory. Returns false if the directory could not be recreated.
    pub fn reset_state(&self) -> bool {
        *self.csr_cache.lock() = None;
        for name in [CSR_FILE, PRIVATE_KEY_FILE, CA_CERT_FILE, CLIENT_CERT_FILE, PKCS12_FILE, CONFIG_FILE] {
            let _ = fs::remove_file(self.path(name));
        }
        match fs::create_dir_all(self.cert_dir()) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "failed to recreate sonar store directory");
                false
            }
        }
    }

    /// Bundles CA cert, client cert and private key into a fresh PKCS#12,
    /// regenerating it every call. Returns the archive path and password.
    pub fn export_pkcs12(&self) -> Result<(PathBuf, String)> {
        let out_path = self.path(PKCS12_FILE);
        let ok = crypto::generate_pkcs12(
            &self.path(CA_CERT_FILE),
            &self.path(CLIENT_CERT_FILE),
            &self.path(PRIVATE_KEY_FILE),
            &out_path,
            PKCS12_FRIENDLY_NAME,
            PKCS12_PASSWORD,
        )?;
        if !ok {
            return Err(Error::Internal("PKCS#12 export failed".into()));
        }
        Ok((out_path, PKCS12_PASSWORD.to_string()))
    }
}
