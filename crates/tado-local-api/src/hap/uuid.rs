//! HomeKit type identifiers.
//!
//! Apple-defined services and characteristics share the base UUID
//! `XXXXXXXX-0000-1000-8000-0026BB765291`; gateways commonly abbreviate
//! them to the leading hex digits with zeros stripped (`"11"`, `"3E"`).
//! Everything in this crate compares the normalized long form.

/// Suffix shared by every Apple-defined HomeKit type.
pub const APPLE_BASE_SUFFIX: &str = "-0000-1000-8000-0026BB765291";

// ── Services ─────────────────────────────────────────────────────────

pub const SERVICE_ACCESSORY_INFORMATION: &str = "0000003E-0000-1000-8000-0026BB765291";
pub const SERVICE_THERMOSTAT: &str = "0000004A-0000-1000-8000-0026BB765291";
pub const SERVICE_TEMPERATURE_SENSOR: &str = "0000008A-0000-1000-8000-0026BB765291";
pub const SERVICE_HUMIDITY_SENSOR: &str = "00000082-0000-1000-8000-0026BB765291";

// ── Accessory information characteristics ────────────────────────────

pub const CHAR_MANUFACTURER: &str = "00000020-0000-1000-8000-0026BB765291";
pub const CHAR_MODEL: &str = "00000021-0000-1000-8000-0026BB765291";
pub const CHAR_NAME: &str = "00000023-0000-1000-8000-0026BB765291";
pub const CHAR_SERIAL_NUMBER: &str = "00000030-0000-1000-8000-0026BB765291";

/// Normalize a HomeKit type to its uppercase long form.
///
/// Short forms (1 to 8 hex digits) are left-padded and joined with the
/// Apple base suffix. Long custom UUIDs are only uppercased.
pub fn normalize(raw: &str) -> String {
    let trimmed = raw.trim();
    let is_short =
        !trimmed.is_empty() && trimmed.len() <= 8 && trimmed.chars().all(|c| c.is_ascii_hexdigit());
    if is_short {
        format!("{:0>8}{APPLE_BASE_SUFFIX}", trimmed.to_ascii_uppercase())
    } else {
        trimmed.to_ascii_uppercase()
    }
}

/// Short form of an Apple-defined type (`"0000003E-..."` → `"3E"`).
///
/// Returns `None` for types outside the Apple namespace.
pub fn short_form(raw: &str) -> Option<String> {
    let long = normalize(raw);
    let head = long.strip_suffix(APPLE_BASE_SUFFIX)?;
    let stripped = head.trim_start_matches('0');
    Some(if stripped.is_empty() { "0".into() } else { stripped.into() })
}

/// Compare two type identifiers regardless of their abbreviation.
pub fn same_type(a: &str, b: &str) -> bool {
    normalize(a) == normalize(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_forms_expand() {
        assert_eq!(normalize("11"), "00000011-0000-1000-8000-0026BB765291");
        assert_eq!(normalize("3e"), SERVICE_ACCESSORY_INFORMATION);
        assert_eq!(normalize("0000004A"), SERVICE_THERMOSTAT);
    }

    #[test]
    fn long_forms_are_uppercased() {
        assert_eq!(
            normalize("0000008a-0000-1000-8000-0026bb765291"),
            SERVICE_TEMPERATURE_SENSOR
        );
        let custom = "E44673A0-247B-4360-8A76-DB9DA69C0100";
        assert_eq!(normalize(&custom.to_lowercase()), custom);
    }

    #[test]
    fn short_form_round_trip() {
        assert_eq!(short_form(CHAR_SERIAL_NUMBER).as_deref(), Some("30"));
        assert_eq!(short_form("0F").as_deref(), Some("F"));
        assert_eq!(short_form("E44673A0-247B-4360-8A76-DB9DA69C0100"), None);
    }

    #[test]
    fn same_type_ignores_abbreviation() {
        assert!(same_type("23", CHAR_NAME));
        assert!(!same_type("23", CHAR_MODEL));
    }
}
