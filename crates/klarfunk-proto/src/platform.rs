use std::path::{Path, PathBuf};

const DEVICE_TREE_MODEL: &str = "/sys/firmware/devicetree/base/model";

pub fn mpv_socket_name() -> String {
    format!("{}/klarfunk-mpv.sock", std::env::temp_dir().display())
}

pub fn mpv_socket_arg() -> String {
    format!("--input-ipc-server={}", mpv_socket_name())
}

pub fn config_dir() -> PathBuf {
    // ~/.config/klarfunk/ (XDG standard)
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("klarfunk")
}

pub fn mpv_binary_name() -> &'static str {
    "mpv"
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var("PATH").ok()?;
    path.split(':')
        .map(|dir| PathBuf::from(dir).join(name))
        .find(|p| p.exists())
}

/// Find the mpv binary: `MPV_PATH` override, beside the current exe, then PATH.
pub fn find_mpv_binary() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("MPV_PATH") {
        let path = PathBuf::from(p);
        if path.exists() {
            return Some(path);
        }
    }

    if let Ok(current_exe) = std::env::current_exe() {
        if let Some(dir) = current_exe.parent() {
            let local_mpv = dir.join(mpv_binary_name());
            if local_mpv.exists() {
                return Some(local_mpv);
            }
        }
    }

    find_on_path(mpv_binary_name())
}

/// True when running on a Raspberry Pi, judged by the device-tree model string.
pub fn is_raspberry_pi() -> bool {
    if !cfg!(target_os = "linux") {
        return false;
    }
    model_is_raspberry_pi(Path::new(DEVICE_TREE_MODEL))
}

fn model_is_raspberry_pi(model_path: &Path) -> bool {
    match std::fs::read(model_path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).contains("Raspberry Pi"),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_detection() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model");

        assert!(!model_is_raspberry_pi(&model));

        std::fs::write(&model, b"Raspberry Pi 4 Model B Rev 1.4\0").unwrap();
        assert!(model_is_raspberry_pi(&model));

        std::fs::write(&model, b"Generic x86 board\0").unwrap();
        assert!(!model_is_raspberry_pi(&model));
    }

    #[test]
    fn test_dirs_are_namespaced() {
        assert!(config_dir().ends_with(".config/klarfunk"));
        assert!(mpv_socket_arg().starts_with("--input-ipc-server="));
    }
}
