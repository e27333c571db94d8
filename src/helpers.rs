use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};

/// RFC 3339 timestamp used in status fields.
pub fn utc_now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

// ── Naming helpers ────────────────────────────────────────────────────────────

/// Derive the PostgreSQL username from namespace + instance name.
pub fn odoo_username(namespace: &str, name: &str) -> String {
    format!("odoo.{namespace}.{name}")
}

/// Convert a UUID string into a safe database name component by replacing
/// any non-lowercase-alphanumeric characters with underscores.
pub fn sanitise_uid(uid: &str) -> String {
    uid.chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Derive the database name from the instance UID.
pub fn db_name(uid: &str) -> String {
    format!("odoo_{}", sanitise_uid(uid))
}

/// Name of a child resource: `<instance>-<suffix>`.
pub fn child_name(instance: &str, suffix: &str) -> String {
    format!("{instance}-{suffix}")
}

/// Generate a cryptographically random 48-hex-char password.
pub fn generate_password() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// SHA-256 hash of a string, returned as hex.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ── odoo.conf generation ──────────────────────────────────────────────────────

/// Inputs for odoo.conf.  Database credentials are not part of the file;
/// the pod receives them through the `USER`/`PASSWORD` environment.
pub struct OdooConfInput<'a> {
    pub admin_password: &'a str,
    pub db_host: &'a str,
    pub db_port: u16,
    pub db_name: &'a str,
    pub extra: &'a BTreeMap<String, String>,
}

const STANDARD_KEYS: [&str; 12] = [
    "data_dir",
    "logfile",
    "log_level",
    "proxy_mode",
    "addons_path",
    "db_host",
    "db_port",
    "db_name",
    "list_db",
    "http_interface",
    "http_port",
    "admin_passwd",
];

/// Build the content of odoo.conf.
pub fn build_odoo_conf(input: &OdooConfInput<'_>) -> String {
    let mut options: BTreeMap<&str, String> = BTreeMap::new();
    options.insert("data_dir", "/var/lib/odoo".to_string());
    options.insert("logfile", String::new());
    options.insert("log_level", "info".to_string());
    options.insert("proxy_mode", "True".to_string());
    options.insert("addons_path", "/mnt/extra-addons".to_string());
    options.insert("db_host", input.db_host.to_string());
    options.insert("db_port", input.db_port.to_string());
    options.insert("db_name", input.db_name.to_string());
    options.insert("list_db", "False".to_string());
    options.insert("http_interface", "0.0.0.0".to_string());
    options.insert("http_port", "8069".to_string());

    if !input.admin_password.is_empty() {
        options.insert("admin_passwd", input.admin_password.to_string());
    }

    for (k, v) in input.extra {
        // Credentials only ever come from the user secret.
        if k == "db_user" || k == "db_password" {
            continue;
        }
        options.insert(k.as_str(), v.clone());
    }

    // Prepend standard Odoo Docker image addon paths.
    let std_addons = "/opt/odoo/addons,/opt/odoo/odoo/addons";
    let ap = options.get("addons_path").cloned().unwrap_or_default();
    if ap.is_empty() {
        options.insert("addons_path", std_addons.to_string());
    } else {
        options.insert("addons_path", format!("{std_addons},{ap}"));
    }

    let mut out = String::from("[options]\n");
    for key in STANDARD_KEYS {
        if let Some(val) = options.get(key) {
            out.push_str(&format!("{key} = {val}\n"));
        }
    }
    for (key, val) in &options {
        if !STANDARD_KEYS.contains(key) {
            out.push_str(&format!("{key} = {val}\n"));
        }
    }
    out
}
