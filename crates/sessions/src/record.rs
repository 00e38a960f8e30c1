//! The colon-separated session record stored under `session:{token}`.
//!
//! Format: `user_id:device_id:created:last_activity:expires:client_id:ip`
//! with epoch-second timestamps. Parsing is tolerant: anything that does not
//! fit the shape is treated as an absent session rather than an error.

/// A live session's fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub user_id: String,
    pub device_id: String,
    pub client_id: String,
    pub ip: String,
    pub created_at: i64,
    pub last_activity: i64,
    pub expires_at: i64,
}

impl SessionInfo {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }

    /// Serialize to the wire record.
    pub fn to_record(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}:{}",
            self.user_id,
            self.device_id,
            self.created_at,
            self.last_activity,
            self.expires_at,
            self.client_id,
            self.ip
        )
    }

    /// Parse a record; `None` for anything malformed. The ip field is last
    /// and may itself contain colons (IPv6), so the split is bounded.
    pub fn parse_record(raw: &str) -> Option<Self> {
        let parts: Vec<&str> = raw.splitn(7, ':').collect();
        if parts.len() < 6 {
            return None;
        }
        Some(Self {
            user_id: parts[0].to_string(),
            device_id: parts[1].to_string(),
            created_at: parts[2].parse().ok()?,
            last_activity: parts[3].parse().ok()?,
            expires_at: parts[4].parse().ok()?,
            client_id: parts[5].to_string(),
            ip: parts.get(6).copied().unwrap_or_default().to_string(),
        })
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SessionInfo {
        SessionInfo {
            user_id: "000000001".into(),
            device_id: "device-a".into(),
            client_id: "client_1700000000000_1".into(),
            ip: "203.0.113.9".into(),
            created_at: 1_700_000_000,
            last_activity: 1_700_000_100,
            expires_at: 1_700_604_800,
        }
    }

    #[test]
    fn record_roundtrips() {
        let info = sample();
        let parsed = SessionInfo::parse_record(&info.to_record()).unwrap();
        assert_eq!(parsed, info);
    }

    #[test]
    fn ipv6_address_survives_roundtrip() {
        let mut info = sample();
        info.ip = "::1".into();
        let parsed = SessionInfo::parse_record(&info.to_record()).unwrap();
        assert_eq!(parsed.ip, "::1");
    }

    #[test]
    fn malformed_records_parse_as_none() {
        assert!(SessionInfo::parse_record("").is_none());
        assert!(SessionInfo::parse_record("just-a-token").is_none());
        assert!(SessionInfo::parse_record("u:d:not-a-number:1:2:c:ip").is_none());
        assert!(SessionInfo::parse_record("u:d:1:2").is_none());
    }

    #[test]
    fn missing_ip_is_tolerated() {
        let parsed = SessionInfo::parse_record("u1:dev:1:2:3:cli").unwrap();
        assert_eq!(parsed.ip, "");
        assert_eq!(parsed.client_id, "cli");
    }

    #[test]
    fn expiry_boundary() {
        let info = sample();
        assert!(!info.is_expired(info.expires_at - 1));
        assert!(info.is_expired(info.expires_at));
        assert!(info.is_expired(info.expires_at + 1));
    }
}
