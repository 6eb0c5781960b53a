//! Host-based authentication rules
//!
//! An ordered list of `(user, address, ssl) -> method` entries, the first
//! match wins.

use super::providers::{Authenticator, PassthroughProvider, StaticPasswordProvider};
use super::{AuthenticationMethod, AuthenticationProvider, ConnectionProperties};
use pgbridge_common::config::{AuthMethodKind, AuthSettings, HbaRule, SslRequirement};
use pgbridge_common::PgWireError;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Exact address or CIDR block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressMatcher {
    network: IpAddr,
    prefix: u8,
}

impl AddressMatcher {
    pub fn parse(text: &str) -> Result<Self, PgWireError> {
        let invalid = || PgWireError::Configuration(format!("invalid address in auth rule: {}", text));
        let (addr, prefix) = match text.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix.parse::<u8>().map_err(|_| invalid())?)),
            None => (text, None),
        };
        let network: IpAddr = addr.trim().parse().map_err(|_| invalid())?;
        let max = if network.is_ipv4() { 32 } else { 128 };
        let prefix = prefix.unwrap_or(max);
        if prefix > max {
            return Err(invalid());
        }
        Ok(Self { network, prefix })
    }

    pub fn matches(&self, addr: IpAddr) -> bool {
        let addr = match (self.network, addr) {
            // IPv4 rules also cover IPv4-mapped IPv6 peers
            (IpAddr::V4(_), IpAddr::V6(v6)) => match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::V4(v4),
                None => return false,
            },
            _ => addr,
        };
        match (self.network, addr) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                prefix_eq(u32::from(net) as u128, u32::from(ip) as u128, self.prefix, 32)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => prefix_eq(u128::from(net), u128::from(ip), self.prefix, 128),
            _ => false,
        }
    }
}

fn prefix_eq(net: u128, ip: u128, prefix: u8, bits: u32) -> bool {
    if prefix == 0 {
        return true;
    }
    let shift = bits - u32::from(prefix);
    (net >> shift) == (ip >> shift)
}

struct Rule {
    user: Option<String>,
    address: Option<AddressMatcher>,
    ssl: SslRequirement,
    method: AuthMethodKind,
}

impl Rule {
    fn matches(&self, user: &str, properties: &ConnectionProperties) -> bool {
        if self.user.as_deref().is_some_and(|u| u != user) {
            return false;
        }
        match self.ssl {
            SslRequirement::Required if !properties.ssl => return false,
            SslRequirement::Disabled if properties.ssl => return false,
            _ => {}
        }
        match (&self.address, properties.address) {
            (None, _) => true,
            (Some(matcher), Some(addr)) => matcher.matches(addr),
            (Some(_), None) => false,
        }
    }
}

/// Default `AuthenticationProvider`
pub struct HostBasedAuthentication {
    rules: Vec<Rule>,
    password: Arc<dyn Authenticator>,
}

impl HostBasedAuthentication {
    pub fn new(rules: &[HbaRule], password: Arc<dyn Authenticator>) -> Result<Self, PgWireError> {
        let rules = rules
            .iter()
            .map(|rule| {
                Ok(Rule {
                    user: rule.user.clone(),
                    address: rule.address.as_deref().map(AddressMatcher::parse).transpose()?,
                    ssl: rule.ssl,
                    method: rule.method,
                })
            })
            .collect::<Result<Vec<_>, PgWireError>>()?;
        Ok(Self { rules, password })
    }

    /// Rules and password users from configuration
    pub fn from_settings(settings: &AuthSettings) -> Result<Self, PgWireError> {
        let password: Arc<dyn Authenticator> = if settings.users.is_empty() {
            warn!("No password users configured, password rules accept any password");
            Arc::new(PassthroughProvider::new())
        } else {
            Arc::new(StaticPasswordProvider::from_settings(&settings.users))
        };
        Self::new(&settings.rules, password)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

impl AuthenticationProvider for HostBasedAuthentication {
    fn resolve_authentication_type(
        &self,
        user: &str,
        properties: &ConnectionProperties,
    ) -> Option<AuthenticationMethod> {
        let rule = self.rules.iter().find(|rule| rule.matches(user, properties))?;
        debug!(user = %user, method = ?rule.method, "Matched host-based auth rule");
        Some(match rule.method {
            AuthMethodKind::Password => AuthenticationMethod::Password(self.password.clone()),
            AuthMethodKind::Trust => AuthenticationMethod::NoPassword,
            AuthMethodKind::Gss | AuthMethodKind::Kerberos => AuthenticationMethod::NegotiatedToken,
        })
    }
}
