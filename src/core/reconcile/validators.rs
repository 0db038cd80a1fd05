// src/core/reconcile/validators.rs

//! Version-gated parameter validators: a tagged-variant enum with an
//! applicable-version range, loaded once into a static registry. Generalizes
//! the closed-set-of-variants pattern the teacher uses for things like
//! `NodeFlags`/`EvictionPolicy` (a fixed enum with a validity check) to a
//! registry entry that additionally carries a `version_from`/`version_till`
//! range and a per-kind normalization rule.

use once_cell::sync::Lazy;

#[derive(Debug, Clone, PartialEq)]
pub enum Validator {
    Bool,
    Integer {
        min: Option<i64>,
        max: Option<i64>,
        unit: Option<&'static str>,
    },
    Real {
        min: Option<f64>,
        max: Option<f64>,
        unit: Option<&'static str>,
    },
    Enum(&'static [&'static str]),
    EnumBool(&'static [&'static str]),
    String,
    /// `.`-namespaced passthrough for extension GUCs this registry has no opinion on.
    Namespaced,
}

#[derive(Debug, Clone)]
pub struct ValidatorEntry {
    pub name: &'static str,
    pub kind: Validator,
    pub version_from: Option<u32>,
    pub version_till: Option<u32>,
    /// Whether changing this parameter demands a full restart rather than a reload.
    pub requires_restart: bool,
}

impl ValidatorEntry {
    pub fn applies_to(&self, server_version: u32) -> bool {
        self.version_from.is_none_or(|v| server_version >= v)
            && self.version_till.is_none_or(|v| server_version < v)
    }
}

pub static REGISTRY: Lazy<Vec<ValidatorEntry>> = Lazy::new(|| {
    vec![
        ValidatorEntry {
            name: "shared_buffers",
            kind: Validator::Integer {
                min: Some(128),
                max: None,
                unit: Some("kB"),
            },
            version_from: None,
            version_till: None,
            requires_restart: true,
        },
        ValidatorEntry {
            name: "max_connections",
            kind: Validator::Integer {
                min: Some(1),
                max: Some(262_143),
                unit: None,
            },
            version_from: None,
            version_till: None,
            requires_restart: true,
        },
        ValidatorEntry {
            name: "max_worker_processes",
            kind: Validator::Integer {
                min: Some(0),
                max: Some(262_143),
                unit: None,
            },
            version_from: None,
            version_till: None,
            requires_restart: true,
        },
        ValidatorEntry {
            name: "max_locks_per_transaction",
            kind: Validator::Integer {
                min: Some(10),
                max: None,
                unit: None,
            },
            version_from: None,
            version_till: None,
            requires_restart: true,
        },
        ValidatorEntry {
            name: "max_wal_senders",
            kind: Validator::Integer {
                min: Some(0),
                max: Some(262_143),
                unit: None,
            },
            version_from: None,
            version_till: None,
            requires_restart: true,
        },
        ValidatorEntry {
            name: "max_prepared_transactions",
            kind: Validator::Integer {
                min: Some(0),
                max: None,
                unit: None,
            },
            version_from: None,
            version_till: None,
            requires_restart: true,
        },
        ValidatorEntry {
            name: "wal_buffers",
            kind: Validator::Integer {
                min: Some(-1),
                max: None,
                unit: Some("8kB"),
            },
            version_from: None,
            version_till: None,
            requires_restart: true,
        },
        ValidatorEntry {
            name: "wal_level",
            kind: Validator::Enum(&["minimal", "replica", "logical"]),
            version_from: None,
            version_till: None,
            requires_restart: true,
        },
        ValidatorEntry {
            name: "hot_standby",
            kind: Validator::EnumBool(&["on", "off"]),
            version_from: None,
            version_till: None,
            requires_restart: true,
        },
        ValidatorEntry {
            name: "synchronous_commit",
            kind: Validator::Enum(&[
                "on", "off", "local", "remote_write", "remote_apply",
            ]),
            version_from: None,
            version_till: None,
            requires_restart: false,
        },
        ValidatorEntry {
            name: "track_commit_timestamp",
            kind: Validator::Bool,
            version_from: Some(906),
            version_till: None,
            requires_restart: true,
        },
        ValidatorEntry {
            name: "primary_slot_name",
            kind: Validator::String,
            version_from: None,
            version_till: None,
            requires_restart: true,
        },
        ValidatorEntry {
            name: "primary_conninfo",
            kind: Validator::String,
            version_from: None,
            version_till: None,
            requires_restart: false,
        },
    ]
});

pub fn lookup(name: &str, server_version: u32) -> Option<&'static ValidatorEntry> {
    if name.contains('.') {
        return Some(&NAMESPACED_ENTRY);
    }
    REGISTRY
        .iter()
        .find(|e| e.name == name && e.applies_to(server_version))
}

static NAMESPACED_ENTRY: ValidatorEntry = ValidatorEntry {
    name: "*",
    kind: Validator::Namespaced,
    version_from: None,
    version_till: None,
    requires_restart: false,
};

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationIssue(pub String);

/// Normalizes and range-checks a raw textual value. `wal_buffers = -1` is
/// special-cased as "auto" and always accepted.
pub fn validate(entry: &ValidatorEntry, raw: &str) -> Result<String, ValidationIssue> {
    match &entry.kind {
        Validator::Bool => match raw.to_ascii_lowercase().as_str() {
            "on" | "true" | "1" | "yes" => Ok("on".into()),
            "off" | "false" | "0" | "no" => Ok("off".into()),
            _ => Err(ValidationIssue(format!("'{raw}' is not a valid bool"))),
        },
        Validator::Integer { min, max, .. } => {
            let value: i64 = raw
                .trim_end_matches(|c: char| c.is_alphabetic())
                .trim()
                .parse()
                .map_err(|_| ValidationIssue(format!("'{raw}' is not an integer")))?;
            if entry.name == "wal_buffers" && value == -1 {
                return Ok("-1".into());
            }
            if let Some(min) = min
                && value < *min
            {
                return Err(ValidationIssue(format!("{value} below minimum {min}")));
            }
            if let Some(max) = max
                && value > *max
            {
                return Err(ValidationIssue(format!("{value} above maximum {max}")));
            }
            Ok(value.to_string())
        }
        Validator::Real { min, max, .. } => {
            let value: f64 = raw
                .parse()
                .map_err(|_| ValidationIssue(format!("'{raw}' is not a real number")))?;
            if let Some(min) = min
                && value < *min
            {
                return Err(ValidationIssue(format!("{value} below minimum {min}")));
            }
            if let Some(max) = max
                && value > *max
            {
                return Err(ValidationIssue(format!("{value} above maximum {max}")));
            }
            Ok(value.to_string())
        }
        Validator::Enum(allowed) | Validator::EnumBool(allowed) => {
            if allowed.contains(&raw) {
                Ok(raw.to_string())
            } else if matches!(entry.kind, Validator::EnumBool(_))
                && matches!(raw, "on" | "off" | "true" | "false")
            {
                Ok(raw.to_string())
            } else {
                Err(ValidationIssue(format!(
                    "'{raw}' is not one of {allowed:?}"
                )))
            }
        }
        Validator::String | Validator::Namespaced => Ok(raw.to_string()),
    }
}
