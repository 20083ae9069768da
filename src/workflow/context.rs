//! Setup shared by every command.
use crate::cli::{StoreArgs, StoreKind};
use crate::config::{dropbox_auth, env_lookup, store_timeout, Overrides, RunConfig};
use crate::store::{BlobStore, DropboxStore, LocalStore};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;

/// Configuration plus the store client, built once per invocation.
pub struct RunContext {
    pub config: RunConfig,
    pub store: Box<dyn BlobStore>,
}

impl RunContext {
    /// Resolve configuration and connect the store.
    ///
    /// Every failure here is a setup failure: no stage work has started.
    pub fn open(args: &StoreArgs, overrides: &Overrides) -> Result<Self> {
        let config = RunConfig::resolve(env_lookup, overrides, Utc::now())
            .context("resolve configuration")?;
        let store: Box<dyn BlobStore> = match args.store {
            StoreKind::Local => {
                let root = args
                    .root
                    .clone()
                    .ok_or_else(|| anyhow!("--store local requires --root DIR"))?;
                Box::new(LocalStore::new(root))
            }
            StoreKind::Dropbox => {
                let auth = dropbox_auth(env_lookup)?;
                let timeout = store_timeout(env_lookup)?;
                Box::new(DropboxStore::connect(auth, timeout).context("connect to Dropbox")?)
            }
        };
        tracing::info!(store = %store.describe(), run_id = %config.run_id, "run context ready");
        Ok(Self { config, store })
    }
}
