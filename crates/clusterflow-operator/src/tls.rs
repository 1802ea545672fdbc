//! TLS assets
//!
//! Raw PEM files are read from the certs directory, encrypted one by one
//! under the cluster key, and base64 encoded for the cloud-config templates.

use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use clusterflow_cloud_aws::KmsKey;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsComponent {
    ApiServer,
    ServiceAccount,
    CalicoClient,
    EtcdServer,
    Worker,
}

impl TlsComponent {
    pub const ALL: [TlsComponent; 5] = [
        TlsComponent::ApiServer,
        TlsComponent::ServiceAccount,
        TlsComponent::CalicoClient,
        TlsComponent::EtcdServer,
        TlsComponent::Worker,
    ];

    /// File name prefix relative to the certs directory
    pub fn file_prefix(&self) -> &'static str {
        match self {
            TlsComponent::ApiServer => "apiserver",
            TlsComponent::ServiceAccount => "service-account",
            TlsComponent::CalicoClient => "calico/client",
            TlsComponent::EtcdServer => "etcd/server",
            TlsComponent::Worker => "worker",
        }
    }

    /// Key prefix in the template context
    pub fn key_prefix(&self) -> &'static str {
        match self {
            TlsComponent::ApiServer => "apiserver",
            TlsComponent::ServiceAccount => "service_account",
            TlsComponent::CalicoClient => "calico_client",
            TlsComponent::EtcdServer => "etcd_server",
            TlsComponent::Worker => "worker",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsAssetType {
    Crt,
    Ca,
    Key,
}

impl TlsAssetType {
    pub const ALL: [TlsAssetType; 3] = [TlsAssetType::Crt, TlsAssetType::Ca, TlsAssetType::Key];

    pub fn as_str(&self) -> &'static str {
        match self {
            TlsAssetType::Crt => "crt",
            TlsAssetType::Ca => "ca",
            TlsAssetType::Key => "key",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsAsset {
    pub component: TlsComponent,
    pub asset_type: TlsAssetType,
    pub data: Vec<u8>,
}

impl TlsAsset {
    pub fn file_name(component: TlsComponent, asset_type: TlsAssetType) -> String {
        format!("{}-{}.pem", component.file_prefix(), asset_type.as_str())
    }

    pub fn key(&self) -> String {
        format!("{}_{}", self.component.key_prefix(), self.asset_type.as_str())
    }
}

/// Encryption under a cluster key
#[async_trait]
pub trait KeyEncryptor: Send + Sync {
    async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
}

#[async_trait]
impl KeyEncryptor for KmsKey {
    async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(KmsKey::encrypt(self, plaintext).await?)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RawTlsAssets {
    pub assets: Vec<TlsAsset>,
}

impl RawTlsAssets {
    /// Read every component's crt, ca and key from `certs_dir`
    pub async fn read(certs_dir: &Path) -> Result<Self> {
        let mut assets = Vec::with_capacity(TlsComponent::ALL.len() * TlsAssetType::ALL.len());
        for component in TlsComponent::ALL {
            for asset_type in TlsAssetType::ALL {
                let path = certs_dir.join(TlsAsset::file_name(component, asset_type));
                let data = match tokio::fs::read(&path).await {
                    Ok(data) => data,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Err(OperatorError::MissingAsset(path));
                    }
                    Err(e) => return Err(e.into()),
                };
                assets.push(TlsAsset {
                    component,
                    asset_type,
                    data,
                });
            }
        }
        tracing::debug!(dir = %certs_dir.display(), count = assets.len(), "TLS assets read");
        Ok(Self { assets })
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub async fn encrypt(&self, encryptor: &dyn KeyEncryptor) -> Result<EncryptedTlsAssets> {
        let mut assets = Vec::with_capacity(self.assets.len());
        for asset in &self.assets {
            assets.push(TlsAsset {
                data: encryptor.encrypt(&asset.data).await?,
                ..asset.clone()
            });
        }
        Ok(EncryptedTlsAssets { assets })
    }
}

#[derive(Debug, Clone, Default)]
pub struct EncryptedTlsAssets {
    pub assets: Vec<TlsAsset>,
}

impl EncryptedTlsAssets {
    pub fn compact(&self) -> CompactTlsAssets {
        CompactTlsAssets(
            self.assets
                .iter()
                .map(|a| (a.key(), STANDARD.encode(&a.data)))
                .collect(),
        )
    }
}

/// Base64 ciphertexts keyed `<component>_<crt|ca|key>`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CompactTlsAssets(pub BTreeMap<String, String>);

impl CompactTlsAssets {
    pub fn get(&self, component: TlsComponent, asset_type: TlsAssetType) -> Option<&str> {
        let key = format!("{}_{}", component.key_prefix(), asset_type.as_str());
        self.0.get(&key).map(String::as_str)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// Write a complete set of fake PEM files into `dir`
    pub fn write_certs(dir: &Path) {
        for component in TlsComponent::ALL {
            for asset_type in TlsAssetType::ALL {
                let path = dir.join(TlsAsset::file_name(component, asset_type));
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                let pem = format!(
                    "-----BEGIN {0}-----\n{1}\n-----END {0}-----\n",
                    asset_type.as_str().to_uppercase(),
                    component.key_prefix()
                );
                std::fs::write(path, pem).unwrap();
            }
        }
    }
}
