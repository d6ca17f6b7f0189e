use std::net::SocketAddr;
use std::time::Duration;

use crate::errors::RegistrationError;
use crate::health::HealthStatus;

/// Health check descriptor attached to a registration.
///
/// The check is executed by the discovery backend, never by this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    pub http: String,
    pub interval: Duration,
    pub tls_skip_verify: bool,
    /// Initial status; the backend treats `None` as critical until the first probe.
    pub status: Option<HealthStatus>,
}

impl HealthCheck {
    pub fn http(url: impl Into<String>, interval: Duration) -> Self {
        Self {
            http: url.into(),
            interval,
            tls_skip_verify: false,
            status: None,
        }
    }

    pub fn skip_tls_verify(mut self) -> Self {
        self.tls_skip_verify = true;
        self
    }

    pub fn with_status(mut self, status: HealthStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// A logical service instance this process registers under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIdentity {
    pub name: String,
    pub id: String,
    pub address: Option<SocketAddr>,
    pub check: Option<HealthCheck>,
}

impl ServiceIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: name.clone(),
            name,
            address: None,
            check: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_address(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_check(mut self, check: HealthCheck) -> Self {
        self.check = Some(check);
        self
    }

    /// Rejects names that cannot be used as `<name>.service.<domain>`.
    pub fn validate(&self) -> Result<(), RegistrationError> {
        if !is_dns_label(&self.name) {
            return Err(RegistrationError::InvalidIdentity(format!(
                "service name {:?} is not a DNS label",
                self.name
            )));
        }
        if self.id.is_empty() || self.id.contains('/') {
            return Err(RegistrationError::InvalidIdentity(format!(
                "service id {:?} is empty or contains '/'",
                self.id
            )));
        }
        Ok(())
    }
}

/// 1-63 ASCII alphanumerics or hyphens, no leading or trailing hyphen.
pub fn is_dns_label(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && !name.starts_with('-')
        && !name.ends_with('-')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_defaults_to_name() {
        let identity = ServiceIdentity::new("service2");
        assert_eq!(identity.id, "service2");
        assert!(identity.address.is_none());
        assert!(identity.validate().is_ok());
    }

    #[test]
    fn rejects_names_that_are_not_dns_labels() {
        let long = "a".repeat(64);
        for name in ["", "-svc", "svc-", "svc.one", "svc_one", long.as_str()] {
            let err = ServiceIdentity::new(name).validate().unwrap_err();
            assert!(matches!(err, RegistrationError::InvalidIdentity(_)), "{name}");
        }
    }

    #[test]
    fn rejects_ids_with_path_separators() {
        let identity = ServiceIdentity::new("svc").with_id("svc/1");
        assert!(identity.validate().is_err());
    }
}
