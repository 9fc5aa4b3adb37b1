// Host identity and on-disk path helpers shared by the lockdown and pairing-file layers.

use uuid::Uuid;

/// Derives a stable per-host identifier the way `uuid.uuid3(NAMESPACE_DNS, platform.node())`
/// does in the original client: a namespace-UUIDv3 of the machine's hostname.
pub fn host_id() -> String {
    namespace_uuid(hostname().as_bytes()).to_string().to_uppercase()
}

/// `SystemBUID` derived the same way as [`host_id`] rather than hardcoded, per the
/// Open Question in the design notes: no compatibility testing here justifies a
/// magic literal, so it is derived identically (a distinct namespace input keeps
/// it from colliding with the host id).
pub fn system_buid() -> String {
    namespace_uuid(format!("system-buid:{}", hostname()).as_bytes())
        .to_string()
        .to_uppercase()
}

fn namespace_uuid(name: &[u8]) -> Uuid {
    Uuid::new_v3(&Uuid::NAMESPACE_DNS, name)
}

fn hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// The per-OS lockdown pair-record directory iTunes/usbmuxd itself writes to,
/// mirroring `_get_lockdown_dir` in the original client.
pub fn system_lockdown_dir() -> std::path::PathBuf {
    #[cfg(target_os = "windows")]
    {
        let base = std::env::var("ALLUSERSPROFILE").unwrap_or_else(|_| "C:\\ProgramData".into());
        std::path::PathBuf::from(base).join("Apple\\Lockdown")
    }
    #[cfg(target_os = "macos")]
    {
        std::path::PathBuf::from("/var/db/lockdown")
    }
    #[cfg(all(unix, not(target_os = "macos")))]
    {
        std::path::PathBuf::from("/var/lib/lockdown")
    }
}

/// The user cache directory fallback for pair records when the system directory
/// and usbmuxd's `ReadPairRecord` both come up empty.
pub fn user_cache_dir(program_name: &str) -> std::path::PathBuf {
    let base = std::env::var("XDG_CACHE_HOME")
        .map(std::path::PathBuf::from)
        .or_else(|_| std::env::var("HOME").map(|h| std::path::PathBuf::from(h).join(".cache")))
        .unwrap_or_else(|_| std::path::PathBuf::from("."));
    base.join(program_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_id_is_stable_across_calls() {
        assert_eq!(host_id(), host_id());
    }

    #[test]
    fn host_id_and_system_buid_differ() {
        assert_ne!(host_id(), system_buid());
    }

    #[test]
    fn user_cache_dir_honors_xdg_cache_home() {
        // SAFETY: test-only env mutation; no other test in this process reads
        // XDG_CACHE_HOME concurrently with asserting on its value here.
        unsafe { std::env::set_var("XDG_CACHE_HOME", "/tmp/devscope-xdg-test") };
        let dir = user_cache_dir("devscope-util-test");
        unsafe { std::env::remove_var("XDG_CACHE_HOME") };
        assert_eq!(dir, std::path::PathBuf::from("/tmp/devscope-xdg-test/devscope-util-test"));
    }
}
