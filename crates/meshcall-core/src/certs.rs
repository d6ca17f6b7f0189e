use serde::{Deserialize, Serialize};

/// Leaf certificate and key issued to one service by the mesh CA.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeafCertificate {
    pub service: String,
    pub cert_pem: String,
    pub private_key_pem: String,
}

impl LeafCertificate {
    pub fn new(
        service: impl Into<String>,
        cert_pem: impl Into<String>,
        private_key_pem: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            cert_pem: cert_pem.into(),
            private_key_pem: private_key_pem.into(),
        }
    }
}

/// Trust anchors of the mesh.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaRoots {
    pub trust_domain: String,
    pub roots: Vec<String>,
}

impl CaRoots {
    pub fn new(trust_domain: impl Into<String>, roots: Vec<String>) -> Self {
        Self {
            trust_domain: trust_domain.into(),
            roots,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}
