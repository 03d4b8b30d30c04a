//! Trust/key store contexts.
//!
//! Store material lives on disk under
//! `{directory}/tls/[stores/{name}/]{keys,trust}` as PEM: `keys` holds the
//! certificate chain and private key for the server role, `trust` holds CA
//! certificates.  Filenames, store type and passwords come from the six
//! `tls.keystore*` / `tls.truststore*` properties, all read through the
//! same accessor; passwords apply only to container formats and are
//! unused for PEM.
//!
//! Contexts are reference-counted by the routes that name them and
//! dropped when the last route is removed.  Stores carrying a trust store
//! occupy one of 256 index slots; overflow rejects the route.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::NoServerSessionStorage;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tracing::debug;

use crate::config::{
    store_property, TlsConfig, DEFAULT_KEYSTORE, DEFAULT_STORE_PASSWORD, DEFAULT_STORE_TYPE,
    DEFAULT_TRUSTSTORE, PROP_KEYSTORE, PROP_KEYSTORE_PASSWORD, PROP_KEYSTORE_TYPE,
    PROP_TRUSTSTORE, PROP_TRUSTSTORE_PASSWORD, PROP_TRUSTSTORE_TYPE,
};
use crate::engine::{EngineProvider, RustlsEngine};
use crate::error::Error;

/// One loaded store context.
pub struct StoreContext {
    pub name: Option<String>,
    pub index: u8,
    /// Present when the store has key material (server role usable).
    server_config: Option<Arc<ServerConfig>>,
    /// Base client config trusting this store's CAs; per-connection ALPN
    /// is applied on a clone.
    client_config: Arc<ClientConfig>,
    pub has_trust_store: bool,
    /// Subject distinguished names (DER) of the trust anchors.
    pub ca_distinguished_names: Vec<Vec<u8>>,
    route_count: usize,
}

/// Store registry and engine supplier backed by PEM files.
pub struct PemProvider {
    directory: PathBuf,
    contexts: HashMap<Option<String>, StoreContext>,
    next_index: u32,
}

impl PemProvider {
    pub fn new(config: &TlsConfig) -> Self {
        Self {
            directory: config.directory.clone(),
            contexts: HashMap::new(),
            next_index: 0,
        }
    }

    pub fn context(&self, store: Option<&str>) -> Option<&StoreContext> {
        self.contexts.get(&store.map(str::to_string))
    }

    fn load(&mut self, store: Option<&str>) -> Result<StoreContext, Error> {
        let store_err = |reason: String| Error::StoreLoad {
            name: store.map(str::to_string),
            reason,
        };

        let keystore_type = store_property(PROP_KEYSTORE_TYPE, DEFAULT_STORE_TYPE);
        let truststore_type = store_property(PROP_TRUSTSTORE_TYPE, DEFAULT_STORE_TYPE);
        let _keystore_password = store_property(PROP_KEYSTORE_PASSWORD, DEFAULT_STORE_PASSWORD);
        let _truststore_password = store_property(PROP_TRUSTSTORE_PASSWORD, DEFAULT_STORE_PASSWORD);
        if keystore_type != "PEM" || truststore_type != "PEM" {
            return Err(store_err(format!(
                "unsupported store type {keystore_type}/{truststore_type}"
            )));
        }

        let keystore_file = resolve(
            &self.directory,
            store,
            &store_property(PROP_KEYSTORE, DEFAULT_KEYSTORE),
        );
        let server_config = if keystore_file.exists() {
            let pem = fs::read(&keystore_file)?;
            let certs = parse_certs(&pem)
                .map_err(|e| store_err(format!("keystore certs: {e}")))?;
            let key = parse_key(&pem).map_err(|e| store_err(format!("keystore key: {e}")))?;
            if certs.is_empty() {
                return Err(store_err("keystore holds no certificates".into()));
            }
            let mut config = ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(certs, key)
                .map_err(Error::Tls)?;
            // No session storage: a peer that closed without close_notify
            // must not resume, and neither does anyone else.
            config.session_storage = Arc::new(NoServerSessionStorage {});
            Some(Arc::new(config))
        } else {
            None
        };

        let truststore_file = resolve(
            &self.directory,
            store,
            &store_property(PROP_TRUSTSTORE, DEFAULT_TRUSTSTORE),
        );
        let mut roots = RootCertStore::empty();
        let has_trust_store = truststore_file.exists();
        if has_trust_store {
            let pem = fs::read(&truststore_file)?;
            for cert in parse_certs(&pem).map_err(|e| store_err(format!("truststore: {e}")))? {
                roots
                    .add(cert)
                    .map_err(|e| store_err(format!("truststore anchor: {e}")))?;
            }
            self.next_index += 1;
            if self.next_index > 255 {
                return Err(Error::StoreIndexExhausted);
            }
        }
        let ca_distinguished_names = roots
            .roots
            .iter()
            .map(|anchor| anchor.subject.as_ref().to_vec())
            .collect();

        let client_config = Arc::new(
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        );

        debug!(store = ?store, index = self.next_index, has_trust_store, "store context loaded");
        Ok(StoreContext {
            name: store.map(str::to_string),
            index: self.next_index as u8,
            server_config,
            client_config,
            has_trust_store,
            ca_distinguished_names,
            route_count: 0,
        })
    }

    #[cfg(test)]
    pub(crate) fn set_next_index(&mut self, index: u32) {
        self.next_index = index;
    }
}

impl EngineProvider for PemProvider {
    type Engine = RustlsEngine;

    fn attach_store(&mut self, store: Option<&str>) -> Result<(), Error> {
        let key = store.map(str::to_string);
        if !self.contexts.contains_key(&key) {
            let context = self.load(store)?;
            self.contexts.insert(key.clone(), context);
        }
        if let Some(context) = self.contexts.get_mut(&key) {
            context.route_count += 1;
        }
        Ok(())
    }

    fn detach_store(&mut self, store: Option<&str>) {
        let key = store.map(str::to_string);
        if let Some(context) = self.contexts.get_mut(&key) {
            context.route_count -= 1;
            if context.route_count == 0 {
                debug!(store = ?store, "store context dropped");
                self.contexts.remove(&key);
            }
        }
    }

    fn has_context(&self, store: Option<&str>) -> bool {
        self.contexts.contains_key(&store.map(str::to_string))
    }

    fn server_engine(&self, store: Option<&str>) -> Result<RustlsEngine, Error> {
        let context = self.context(store).ok_or_else(|| Error::StoreLoad {
            name: store.map(str::to_string),
            reason: "store not attached".into(),
        })?;
        let config = context
            .server_config
            .as_ref()
            .ok_or_else(|| Error::StoreLoad {
                name: store.map(str::to_string),
                reason: "store has no key material".into(),
            })?;
        Ok(RustlsEngine::server(Arc::clone(config)))
    }

    fn client_engine(
        &self,
        store: Option<&str>,
        server_name: Option<&str>,
        alpn: Option<&str>,
    ) -> Result<RustlsEngine, Error> {
        let context = self.context(store).ok_or_else(|| Error::StoreLoad {
            name: store.map(str::to_string),
            reason: "store not attached".into(),
        })?;
        let server_name = server_name.ok_or_else(|| {
            Error::Tls(rustls::Error::General("client route without hostname".into()))
        })?;
        let mut config = (*context.client_config).clone();
        config.alpn_protocols = alpn.map(|p| vec![p.as_bytes().to_vec()]).unwrap_or_default();
        RustlsEngine::client(Arc::new(config), server_name)
    }
}

fn resolve(directory: &Path, store: Option<&str>, filename: &str) -> PathBuf {
    match store {
        None => directory.join("tls").join(filename),
        Some(name) => directory.join("tls").join("stores").join(name).join(filename),
    }
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, std::io::Error> {
    rustls_pemfile::certs(&mut &pem[..]).collect()
}

fn parse_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, String> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| e.to_string())?
        .ok_or_else(|| "no private key found".to_string())
}
