use std::path::{Path, PathBuf};

use crate::core::{MeshError, MeshResult};

/// PEM-encoded TLS identity and trust roots.
#[derive(Debug, Clone)]
pub struct TlsIdentity {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
    pub ca_certs_pem: Vec<Vec<u8>>,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl TlsIdentity {
    pub fn load(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
        ca_paths: &[PathBuf],
    ) -> MeshResult<Self> {
        let cert_path = cert_path.as_ref().to_path_buf();
        let key_path = key_path.as_ref().to_path_buf();

        let cert_pem = read_pem(&cert_path)?;
        let key_pem = read_pem(&key_path)?;
        let ca_certs_pem = ca_paths
            .iter()
            .map(|path| read_pem(path))
            .collect::<MeshResult<Vec<_>>>()?;

        Ok(Self {
            cert_pem,
            key_pem,
            ca_certs_pem,
            cert_path,
            key_path,
        })
    }

    /// Certificate chain followed by the private key, the layout reqwest expects.
    pub fn client_identity_pem(&self) -> Vec<u8> {
        let mut pem = self.cert_pem.clone();
        if !pem.ends_with(b"\n") {
            pem.push(b'\n');
        }
        pem.extend_from_slice(&self.key_pem);
        pem
    }
}

fn read_pem(path: &Path) -> MeshResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| MeshError::Credential {
        reason: format!("failed to read {}: {}", path.display(), e),
    })
}
