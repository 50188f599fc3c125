use std::sync::OnceLock;

static OWNER_ID: OnceLock<String> = OnceLock::new();

/// Host name of this machine, or `"unknown"` when it cannot be read.
pub fn hostname_or_unknown() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.to_str().map(str::to_string))
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Process-unique owner identifier: `"{hostname}:{pid}:{random}"`.
///
/// Stable for the lifetime of the process. Components that need several independent owners inside one process
/// (tests simulating multiple processes) construct their own ids instead.
pub fn process_owner_id() -> &'static str {
    OWNER_ID.get_or_init(new_owner_id)
}

pub(crate) fn new_owner_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}:{}:{}",
        hostname_or_unknown(),
        std::process::id(),
        &suffix[..12]
    )
}
