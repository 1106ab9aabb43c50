//! `DB` configuration (spec §6's enumerated configuration options).

use std::sync::Arc;

use tabletheory_core::marshal::{Clock, SystemClock};

use crate::client::KmsClient;
use crate::encryption::{OsRandSource, RandSource};

/// Construction-time configuration for a [`crate::facade::DB`]. Mirrors the
/// teacher's `SqliteStore::open` option set, generalized to a remote store.
pub struct Config {
    pub region: String,
    pub endpoint: Option<String>,
    pub kms_key_arn: Option<String>,
    pub kms_client: Option<Arc<dyn KmsClient>>,
    pub encryption_rand: Arc<dyn RandSource>,
    pub clock: Arc<dyn Clock>,
    pub max_retries: u32,
    pub default_rcu: u32,
    pub default_wcu: u32,
    pub auto_migrate: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint: None,
            kms_key_arn: None,
            kms_client: None,
            encryption_rand: Arc::new(OsRandSource),
            clock: Arc::new(SystemClock),
            max_retries: 3,
            default_rcu: 5,
            default_wcu: 5,
            auto_migrate: false,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_encryption(mut self, kms_key_arn: impl Into<String>, kms_client: Arc<dyn KmsClient>) -> Self {
        self.kms_key_arn = Some(kms_key_arn.into());
        self.kms_client = Some(kms_client);
        self
    }

    pub fn with_rand_source(mut self, rand: Arc<dyn RandSource>) -> Self {
        self.encryption_rand = rand;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_auto_migrate(mut self, auto_migrate: bool) -> Self {
        self.auto_migrate = auto_migrate;
        self
    }
}
