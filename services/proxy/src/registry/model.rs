use std::fmt;
use std::net::Ipv6Addr;

use chrono::{DateTime, Utc};

/// Lifecycle status of a protected server, as recorded by the management side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Active,
    Inactive,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }

    /// Anything other than `active` is treated as inactive.
    pub fn from_str_lossy(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("active") {
            Self::Active
        } else {
            Self::Inactive
        }
    }
}

/// A backend protected behind one proxy port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectedServer {
    /// Identifier assigned by the management store.
    pub id: i64,
    /// Port the proxy listens on for this server.
    pub proxy_port: u16,
    /// Hostname or IP literal of the real server.
    pub backend_host: String,
    pub backend_port: u16,
    pub status: ServerStatus,
}

impl ProtectedServer {
    pub fn is_active(&self) -> bool {
        self.status == ServerStatus::Active
    }
}

impl fmt::Display for ProtectedServer {
    /// Formats the backend address, bracketing IPv6 literals.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.backend_host.parse::<Ipv6Addr>().is_ok() {
            write!(f, "[{}]:{}", self.backend_host, self.backend_port)
        } else {
            write!(f, "{}:{}", self.backend_host, self.backend_port)
        }
    }
}

/// A ban on a source address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanEntry {
    pub address: String,
    /// `None` bans forever.
    pub expires_at: Option<DateTime<Utc>>,
}

impl BanEntry {
    /// Returns true if the ban is in force at `now`.
    pub fn is_effective(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at > now,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_ban_expiry() {
        let now = Utc::now();
        let permanent = BanEntry {
            address: "203.0.113.7".to_string(),
            expires_at: None,
        };
        let expired = BanEntry {
            expires_at: Some(now - Duration::minutes(1)),
            ..permanent.clone()
        };
        let pending = BanEntry {
            expires_at: Some(now + Duration::minutes(1)),
            ..permanent.clone()
        };

        assert!(permanent.is_effective(now));
        assert!(!expired.is_effective(now));
        assert!(pending.is_effective(now));
        // Expiring exactly now is no longer in force.
        assert!(!BanEntry {
            expires_at: Some(now),
            ..permanent
        }
        .is_effective(now));
    }

    #[test]
    fn test_backend_display() {
        let mut server = ProtectedServer {
            id: 1,
            proxy_port: 25577,
            backend_host: "10.0.0.5".to_string(),
            backend_port: 25565,
            status: ServerStatus::Active,
        };
        assert_eq!(server.to_string(), "10.0.0.5:25565");

        server.backend_host = "fd00::5".to_string();
        assert_eq!(server.to_string(), "[fd00::5]:25565");
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!(ServerStatus::from_str_lossy("active"), ServerStatus::Active);
        assert_eq!(ServerStatus::from_str_lossy("ACTIVE "), ServerStatus::Active);
        assert_eq!(ServerStatus::from_str_lossy("paused"), ServerStatus::Inactive);
        assert_eq!(ServerStatus::Active.as_str(), "active");
    }
}
