//! Input validation for engine operations

use std::net::IpAddr;
use tollgate_api::{AdmitRequest, UsageReport};

use crate::{SessionError, SessionResult};

/// Longest identifier accepted for accounts, plans and session ids
pub const MAX_ID_LEN: usize = 128;

/// Non-empty, bounded, no whitespace or control characters
pub fn validate_identifier(field: &str, value: &str) -> SessionResult<()> {
    if value.is_empty() {
        return Err(SessionError::invalid(format!("{} must not be empty", field)));
    }
    if value.chars().count() > MAX_ID_LEN {
        return Err(SessionError::invalid(format!(
            "{} longer than {} characters",
            field, MAX_ID_LEN
        )));
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(SessionError::invalid(format!(
            "{} contains whitespace or control characters",
            field
        )));
    }
    Ok(())
}

/// Six hex octets separated consistently by `:` or `-`
pub fn validate_mac(field: &str, value: &str) -> SessionResult<()> {
    let separator = if value.contains(':') { ':' } else { '-' };
    let octets: Vec<&str> = value.split(separator).collect();
    let valid = octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));

    if valid {
        Ok(())
    } else {
        Err(SessionError::invalid(format!(
            "{} '{}' is not a MAC address",
            field, value
        )))
    }
}

pub fn validate_ip(field: &str, value: &str) -> SessionResult<()> {
    value
        .parse::<IpAddr>()
        .map(|_| ())
        .map_err(|_| SessionError::invalid(format!("{} '{}' is not an IP address", field, value)))
}

pub fn validate_admit_request(request: &AdmitRequest) -> SessionResult<()> {
    validate_identifier("session_id", request.session_id.as_str())?;
    validate_identifier("account_id", request.account_id.as_str())?;
    validate_identifier("plan_id", request.plan_id.as_str())?;
    validate_mac("device.mac_address", &request.device.mac_address)?;
    validate_ip("device.ip", &request.device.ip)?;

    if let Some(mac) = &request.network.ap_mac_address {
        validate_mac("network.ap_mac_address", mac)?;
    }
    if let Some(ip) = &request.network.gateway_ip {
        validate_ip("network.gateway_ip", ip)?;
    }
    Ok(())
}

/// Usage values must be finite and non-negative
pub fn validate_usage_report(report: &UsageReport) -> SessionResult<()> {
    for (field, value) in [
        ("data_used_mb", report.data_used_mb),
        ("time_used_minutes", report.time_used_minutes),
    ] {
        if let Some(v) = value
            && (!v.is_finite() || v < 0.0)
        {
            return Err(SessionError::invalid(format!(
                "{} must be a non-negative number, got {}",
                field, v
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_api::{DeviceInfo, NetworkInfo};

    fn request() -> AdmitRequest {
        AdmitRequest {
            account_id: "acct-1".into(),
            plan_id: "day-pass".into(),
            session_id: "*8000001A".into(),
            device: DeviceInfo {
                mac_address: "AA:BB:CC:00:11:22".into(),
                ip: "10.5.50.23".into(),
                ..Default::default()
            },
            network: NetworkInfo {
                ap_mac_address: Some("aa-bb-cc-00-11-33".into()),
                gateway_ip: Some("fe80::1".into()),
            },
            free_allowance: None,
        }
    }

    #[test]
    fn accepts_valid_request() {
        assert!(validate_admit_request(&request()).is_ok());
    }

    #[test]
    fn identifiers() {
        assert!(validate_identifier("id", "mt-1").is_ok());
        assert!(validate_identifier("id", "").is_err());
        assert!(validate_identifier("id", "has space").is_err());
        assert!(validate_identifier("id", "tab\there").is_err());
        assert!(validate_identifier("id", &"x".repeat(MAX_ID_LEN)).is_ok());
        assert!(validate_identifier("id", &"x".repeat(MAX_ID_LEN + 1)).is_err());
    }

    #[test]
    fn mac_addresses() {
        assert!(validate_mac("mac", "aa:bb:cc:dd:ee:ff").is_ok());
        assert!(validate_mac("mac", "AA-BB-CC-DD-EE-FF").is_ok());
        assert!(validate_mac("mac", "aa:bb-cc:dd:ee:ff").is_err());
        assert!(validate_mac("mac", "aa:bb:cc:dd:ee").is_err());
        assert!(validate_mac("mac", "aa:bb:cc:dd:ee:gg").is_err());
        assert!(validate_mac("mac", "aabbccddeeff").is_err());
    }

    #[test]
    fn bad_device_fields() {
        let mut req = request();
        req.device.ip = "10.0.0.300".into();
        assert!(matches!(
            validate_admit_request(&req),
            Err(SessionError::InvalidInput(_))
        ));

        let mut req = request();
        req.network.gateway_ip = Some("gateway".into());
        assert!(validate_admit_request(&req).is_err());

        let mut req = request();
        req.session_id = "".into();
        assert!(validate_admit_request(&req).is_err());
    }

    #[test]
    fn usage_values() {
        let ok = UsageReport {
            data_used_mb: Some(0.0),
            time_used_minutes: Some(12.5),
            ..Default::default()
        };
        assert!(validate_usage_report(&ok).is_ok());

        for bad in [-1.0, f64::NAN, f64::INFINITY] {
            let report = UsageReport {
                data_used_mb: Some(bad),
                ..Default::default()
            };
            assert!(validate_usage_report(&report).is_err());
        }
    }
}
