//! XMPP addresses (`local@domain/resource`).

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid JID '{0}'")]
pub struct InvalidJid(pub String);

/// A parsed XMPP address. Comparison is exact; only the domain is lower-cased on parse.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    local: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    pub fn new(local: Option<&str>, domain: &str, resource: Option<&str>) -> Result<Self, InvalidJid> {
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();
        if domain.is_empty() || domain.contains(|c| c == '@' || c == '/') {
            return Err(InvalidJid(domain));
        }
        let local = local.filter(|l| !l.is_empty()).map(str::to_string);
        let resource = resource.filter(|r| !r.is_empty()).map(str::to_string);
        Ok(Self {
            local,
            domain,
            resource,
        })
    }

    /// A domain-only address, e.g. the server itself.
    pub fn domain_jid(domain: &str) -> Result<Self, InvalidJid> {
        Self::new(None, domain, None)
    }

    pub fn local(&self) -> Option<&str> {
        self.local.as_deref()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }

    pub fn to_bare(&self) -> Jid {
        Jid {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    pub fn with_resource(&self, resource: &str) -> Jid {
        Jid {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: Some(resource.to_string()).filter(|r| !r.is_empty()),
        }
    }
}

impl FromStr for Jid {
    type Err = InvalidJid;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (rest, resource) = match s.split_once('/') {
            Some((rest, resource)) => (rest, Some(resource)),
            None => (s, None),
        };
        let (local, domain) = match rest.split_once('@') {
            Some((local, domain)) => {
                if local.is_empty() {
                    return Err(InvalidJid(s.to_string()));
                }
                (Some(local), domain)
            }
            None => (None, rest),
        };
        if resource == Some("") {
            return Err(InvalidJid(s.to_string()));
        }
        Jid::new(local, domain, resource).map_err(|_| InvalidJid(s.to_string()))
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(local) = &self.local {
            write!(f, "{local}@")?;
        }
        f.write_str(&self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{resource}")?;
        }
        Ok(())
    }
}
