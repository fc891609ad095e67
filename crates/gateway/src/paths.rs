//! Central path resolution for all gateway data files.
//!
//! Resolved once at startup from: CLI `--data-dir` > `HARNESS_GATEWAY_DATA_DIR`
//! env > `~/.harness-gateway`. All callsites use these helpers instead of
//! constructing paths from `HOME` directly.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

static DATA_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Initialize the global data directory. Returns the resolved path.
///
/// Priority: `explicit` arg > `HARNESS_GATEWAY_DATA_DIR` env > `~/.harness-gateway` default.
pub fn init_data_dir(explicit: Option<&Path>) -> PathBuf {
    let dir = if let Some(p) = explicit {
        p.to_path_buf()
    } else if let Ok(env_val) = std::env::var("HARNESS_GATEWAY_DATA_DIR") {
        PathBuf::from(env_val)
    } else {
        dirs::home_dir()
            .expect("HOME directory not found")
            .join(".harness-gateway")
    };

    let mut guard = DATA_DIR.write().expect("DATA_DIR lock poisoned");
    *guard = Some(dir.clone());
    dir
}

/// Return the current data directory. Panics if `init_data_dir` hasn't been called.
pub fn data_dir() -> PathBuf {
    DATA_DIR
        .read()
        .expect("DATA_DIR lock poisoned")
        .clone()
        .expect("data_dir() called before init_data_dir()")
}

pub fn db_path() -> PathBuf {
    data_dir().join("control-plane.sqlite")
}

pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

pub fn pid_file_path() -> PathBuf {
    data_dir().join("gateway.pid")
}

pub fn token_file_path() -> PathBuf {
    data_dir().join("auth-token")
}

/// Create all required subdirectories under the data dir.
pub fn ensure_dirs() -> io::Result<()> {
    let base = data_dir();
    std::fs::create_dir_all(&base)?;
    std::fs::create_dir_all(base.join("logs"))?;
    Ok(())
}

/// Reset data dir — for test isolation only.
#[cfg(test)]
pub fn reset_data_dir() {
    let mut guard = DATA_DIR.write().expect("DATA_DIR lock poisoned");
    *guard = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn explicit_dir_wins_over_env() {
        let _guard = TEST_LOCK.lock().unwrap();
        reset_data_dir();
        std::env::set_var("HARNESS_GATEWAY_DATA_DIR", "/tmp/should-not-be-used");
        let resolved = init_data_dir(Some(Path::new("/tmp/explicit-dir")));
        assert_eq!(resolved, PathBuf::from("/tmp/explicit-dir"));
        std::env::remove_var("HARNESS_GATEWAY_DATA_DIR");
        reset_data_dir();
    }

    #[test]
    fn db_path_is_under_data_dir() {
        let _guard = TEST_LOCK.lock().unwrap();
        reset_data_dir();
        init_data_dir(Some(Path::new("/tmp/explicit-dir2")));
        assert_eq!(db_path(), PathBuf::from("/tmp/explicit-dir2/control-plane.sqlite"));
        reset_data_dir();
    }
}
