use std::path::{Path, PathBuf};

use tracing::debug;

const INSTALL_DIR: &str = "/usr/local/bin";

pub trait Locate: Send + Sync {
    fn binary_name(&self) -> &str;
    fn find(&self) -> Option<PathBuf>;
}

/// Finds the daemon executable across the places it is shipped or built.
#[derive(Debug, Clone)]
pub struct DaemonLocator {
    binary_name: String,
    override_path: Option<PathBuf>,
    search_path: Vec<PathBuf>,
    exe_dir: Option<PathBuf>,
    cwd: Option<PathBuf>,
    install_dir: PathBuf,
}

impl DaemonLocator {
    /// Locator seeded from `PATH`, the running executable and the working
    /// directory of this process.
    pub fn from_env(binary_name: impl Into<String>, override_path: Option<PathBuf>) -> Self {
        let search_path = std::env::var_os("PATH")
            .map(|value| std::env::split_paths(&value).collect())
            .unwrap_or_default();
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf));
        Self {
            binary_name: binary_name.into(),
            override_path,
            search_path,
            exe_dir,
            cwd: std::env::current_dir().ok(),
            install_dir: PathBuf::from(INSTALL_DIR),
        }
    }

    pub fn with_search_path(mut self, dirs: Vec<PathBuf>) -> Self {
        self.search_path = dirs;
        self
    }

    pub fn with_exe_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.exe_dir = dir;
        self
    }

    pub fn with_cwd(mut self, dir: Option<PathBuf>) -> Self {
        self.cwd = dir;
        self
    }

    pub fn with_install_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.install_dir = dir.into();
        self
    }

    /// Every path `find` considers, in priority order.
    pub fn candidates(&self) -> Vec<PathBuf> {
        let name = self.binary_name.as_str();
        let mut out = Vec::new();

        if let Some(path) = &self.override_path {
            out.push(path.clone());
        }
        out.extend(self.search_path.iter().map(|dir| dir.join(name)));
        if let Some(exe_dir) = &self.exe_dir {
            // Bundled next to the shell, inside an app bundle, or a dev tree.
            out.push(exe_dir.join(name));
            out.push(exe_dir.join("..").join("Resources").join(name));
            out.push(exe_dir.join("..").join("..").join("build").join(name));
        }
        if let Some(cwd) = &self.cwd {
            out.push(cwd.join("build").join(name));
            out.push(cwd.join("..").join("build").join(name));
        }
        out.push(self.install_dir.join(name));
        out
    }
}

impl Locate for DaemonLocator {
    fn binary_name(&self) -> &str {
        &self.binary_name
    }

    fn find(&self) -> Option<PathBuf> {
        let found = self.candidates().into_iter().find(|path| path.is_file());
        match &found {
            Some(path) => debug!("daemon binary at {}", path.display()),
            None => debug!(name = %self.binary_name, "daemon binary not found"),
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn bare(root: &Path) -> DaemonLocator {
        DaemonLocator::from_env("watchfired", None)
            .with_search_path(Vec::new())
            .with_exe_dir(None)
            .with_cwd(None)
            .with_install_dir(root.join("install"))
    }

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"#!/bin/sh\n").unwrap();
    }

    #[test]
    fn nothing_found_in_empty_tree() {
        let dir = tempfile::tempdir().unwrap();
        assert!(bare(dir.path()).find().is_none());
    }

    #[test]
    fn search_path_beats_build_output() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        let work = dir.path().join("work");
        touch(&bin.join("watchfired"));
        touch(&work.join("build").join("watchfired"));

        let locator = bare(dir.path())
            .with_search_path(vec![bin.clone()])
            .with_cwd(Some(work));
        assert_eq!(locator.find(), Some(bin.join("watchfired")));
    }

    #[test]
    fn parent_build_dir_is_used_from_subdirectory() {
        let dir = tempfile::tempdir().unwrap();
        let gui = dir.path().join("gui");
        fs::create_dir_all(&gui).unwrap();
        touch(&dir.path().join("build").join("watchfired"));

        let found = bare(dir.path()).with_cwd(Some(gui)).find().unwrap();
        assert!(found.ends_with("build/watchfired"));
        assert!(found.is_file());
    }

    #[test]
    fn directories_named_like_the_binary_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("install").join("watchfired")).unwrap();
        assert!(bare(dir.path()).find().is_none());
    }

    #[test]
    fn override_is_tried_first() {
        let dir = tempfile::tempdir().unwrap();
        let custom = dir.path().join("custom").join("my-daemon");
        touch(&custom);
        touch(&dir.path().join("install").join("watchfired"));

        let locator = DaemonLocator {
            override_path: Some(custom.clone()),
            ..bare(dir.path())
        };
        assert_eq!(locator.candidates()[0], custom);
        assert_eq!(locator.find(), Some(custom));
    }

    #[test]
    fn install_dir_is_last_resort() {
        let dir = tempfile::tempdir().unwrap();
        let installed = dir.path().join("install").join("watchfired");
        touch(&installed);
        let locator = bare(dir.path()).with_exe_dir(Some(dir.path().join("app")));
        assert_eq!(locator.candidates().last(), Some(&installed));
        assert_eq!(locator.find(), Some(installed));
    }
}
