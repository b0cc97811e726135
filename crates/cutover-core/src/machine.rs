//! Machine identity resolution
//!
//! The endpoint name and the activity-log file header both carry a stable
//! machine identifier. Resolution order: config override (handled by the
//! caller), `/etc/machine-id` (shortened), hostname file, `HOSTNAME`
//! environment variable, `"localhost"`.

/// Resolve a stable identifier for this machine
pub fn machine_ident() -> String {
    if let Ok(id) = std::fs::read_to_string("/etc/machine-id") {
        let id = id.trim();
        if !id.is_empty() {
            return id.chars().take(12).collect();
        }
    }
    if let Ok(name) = std::fs::read_to_string("/etc/hostname") {
        let name = name.trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.is_empty() {
            return name;
        }
    }
    "localhost".to_string()
}
