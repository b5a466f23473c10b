//! Installs the sandbox's custom agent tools into a workspace.
//!
//! Tools land in `<workdir>/.opencode/tool/`, where OpenCode discovers them.
//! They import packages from the image's global `node_modules`, which is
//! linked into `.opencode/` alongside a `package.json` marking them as ES
//! modules.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

/// File name the legacy single-file plugin is installed as.
pub const LEGACY_TOOL_NAME: &str = "create-pull-request.js";

const PACKAGE_JSON: &str = "{\n  \"type\": \"module\"\n}\n";

/// Where tool sources live in the image.
#[derive(Debug, Clone)]
pub struct ToolSources {
    pub legacy_plugin: PathBuf,
    pub tools_dir: PathBuf,
    pub global_node_modules: PathBuf,
}

impl Default for ToolSources {
    fn default() -> Self {
        Self {
            legacy_plugin: PathBuf::from("/app/sandbox/inspect-plugin.js"),
            tools_dir: PathBuf::from("/app/sandbox/tools"),
            global_node_modules: PathBuf::from("/usr/lib/node_modules"),
        }
    }
}

/// Copy tools into `workdir` and return the installed file names.
///
/// Nothing is created when there is nothing to install.
pub fn install_tools(workdir: &Path, sources: &ToolSources) -> io::Result<Vec<String>> {
    let opencode_dir = workdir.join(".opencode");
    let tool_dir = opencode_dir.join("tool");
    let mut installed = Vec::new();

    if sources.legacy_plugin.is_file() {
        std::fs::create_dir_all(&tool_dir)?;
        std::fs::copy(&sources.legacy_plugin, tool_dir.join(LEGACY_TOOL_NAME))?;
        installed.push(LEGACY_TOOL_NAME.to_string());
    }

    if sources.tools_dir.is_dir() {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(&sources.tools_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "js"))
            .collect();
        entries.sort();

        for source in entries {
            let Some(name) = source.file_name() else {
                continue;
            };
            std::fs::create_dir_all(&tool_dir)?;
            std::fs::copy(&source, tool_dir.join(name))?;
            installed.push(name.to_string_lossy().into_owned());
        }
    } else {
        debug!(tools_dir = %sources.tools_dir.display(), "No tools directory");
    }

    if installed.is_empty() {
        debug!("No tools to install");
        return Ok(installed);
    }

    if sources.global_node_modules.is_dir() {
        link_node_modules(&opencode_dir, &sources.global_node_modules)?;
        std::fs::write(opencode_dir.join("package.json"), PACKAGE_JSON)?;
    } else {
        warn!(
            node_modules = %sources.global_node_modules.display(),
            "Global node_modules not found, tools may fail to import dependencies"
        );
    }

    info!(count = installed.len(), tools = ?installed, "Installed agent tools");
    Ok(installed)
}

fn link_node_modules(opencode_dir: &Path, target: &Path) -> io::Result<()> {
    let link = opencode_dir.join("node_modules");
    match link.symlink_metadata() {
        Ok(meta) if meta.is_dir() => {
            warn!(path = %link.display(), "node_modules is a real directory, not linking");
            return Ok(());
        }
        Ok(_) => std::fs::remove_file(&link)?,
        Err(_) => {}
    }
    std::os::unix::fs::symlink(target, &link)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        root: TempDir,
        workdir: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let root = tempfile::tempdir().unwrap();
            let workdir = root.path().join("workspace");
            std::fs::create_dir_all(&workdir).unwrap();
            Self { root, workdir }
        }

        fn path(&self, relative: &str) -> PathBuf {
            self.root.path().join(relative)
        }

        fn write(&self, relative: &str, contents: &str) -> PathBuf {
            let path = self.path(relative);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, contents).unwrap();
            path
        }

        fn sources(&self, legacy: &str, tools: &str) -> ToolSources {
            ToolSources {
                legacy_plugin: self.path(legacy),
                tools_dir: self.path(tools),
                global_node_modules: self.path("nonexistent-modules"),
            }
        }

        fn tool_dir(&self) -> PathBuf {
            self.workdir.join(".opencode/tool")
        }

        fn js_count(&self) -> usize {
            std::fs::read_dir(self.tool_dir())
                .unwrap()
                .filter(|entry| {
                    entry
                        .as_ref()
                        .unwrap()
                        .path()
                        .extension()
                        .is_some_and(|ext| ext == "js")
                })
                .count()
        }
    }

    #[test]
    fn test_legacy_tool_copied() {
        let fx = Fixture::new();
        fx.write("app/sandbox/inspect-plugin.js", "// legacy tool");

        let sources = fx.sources("app/sandbox/inspect-plugin.js", "no-tools");
        install_tools(&fx.workdir, &sources).unwrap();

        let dest = fx.tool_dir().join("create-pull-request.js");
        assert_eq!(std::fs::read_to_string(dest).unwrap(), "// legacy tool");
    }

    #[test]
    fn test_tools_dir_files_copied() {
        let fx = Fixture::new();
        for (name, body) in [
            ("_bridge-client.js", "// bridge client"),
            ("spawn-task.js", "// spawn task"),
            ("get-task-status.js", "// get status"),
            ("cancel-task.js", "// cancel task"),
        ] {
            fx.write(&format!("app/sandbox/tools/{name}"), body);
        }

        let installed =
            install_tools(&fx.workdir, &fx.sources("no-legacy", "app/sandbox/tools")).unwrap();

        assert_eq!(installed.len(), 4);
        for name in ["_bridge-client.js", "spawn-task.js", "get-task-status.js", "cancel-task.js"] {
            assert!(fx.tool_dir().join(name).exists(), "{name} missing");
        }
        assert_eq!(
            std::fs::read_to_string(fx.tool_dir().join("_bridge-client.js")).unwrap(),
            "// bridge client"
        );
    }

    #[test]
    fn test_non_js_files_skipped() {
        let fx = Fixture::new();
        fx.write("app/sandbox/tools/spawn-task.js", "// tool");
        fx.write("app/sandbox/tools/README.md", "# docs");
        fx.write("app/sandbox/tools/helper.py", "# python");

        install_tools(&fx.workdir, &fx.sources("no-legacy", "app/sandbox/tools")).unwrap();

        assert!(fx.tool_dir().join("spawn-task.js").exists());
        assert!(!fx.tool_dir().join("README.md").exists());
        assert!(!fx.tool_dir().join("helper.py").exists());
    }

    #[test]
    fn test_graceful_without_tools_dir() {
        let fx = Fixture::new();
        fx.write("app/sandbox/inspect-plugin.js", "// legacy");

        let sources = fx.sources("app/sandbox/inspect-plugin.js", "no-tools");
        install_tools(&fx.workdir, &sources).unwrap();

        assert!(fx.tool_dir().join(LEGACY_TOOL_NAME).exists());
        assert_eq!(fx.js_count(), 1);
    }

    #[test]
    fn test_no_tools_at_all() {
        let fx = Fixture::new();

        let installed = install_tools(&fx.workdir, &fx.sources("no-legacy", "no-tools")).unwrap();

        assert!(installed.is_empty());
        assert!(!fx.workdir.join(".opencode").exists());
    }

    #[test]
    fn test_node_modules_symlink_created() {
        let fx = Fixture::new();
        fx.write("app/sandbox/inspect-plugin.js", "// tool");
        let global_modules = fx.path("global-modules");
        std::fs::create_dir_all(&global_modules).unwrap();
        let sources = ToolSources {
            global_node_modules: global_modules.clone(),
            ..fx.sources("app/sandbox/inspect-plugin.js", "no-tools")
        };

        install_tools(&fx.workdir, &sources).unwrap();
        // Reinstalling replaces the existing link.
        install_tools(&fx.workdir, &sources).unwrap();

        let opencode_dir = fx.workdir.join(".opencode");
        let node_modules = opencode_dir.join("node_modules");
        assert!(node_modules.symlink_metadata().unwrap().file_type().is_symlink());
        assert_eq!(
            node_modules.canonicalize().unwrap(),
            global_modules.canonicalize().unwrap()
        );
        let package_json = std::fs::read_to_string(opencode_dir.join("package.json")).unwrap();
        assert!(package_json.contains("\"type\": \"module\""));
    }

    #[test]
    fn test_existing_node_modules_directory_is_kept() {
        let fx = Fixture::new();
        fx.write("app/sandbox/inspect-plugin.js", "// tool");
        let global_modules = fx.path("global-modules");
        std::fs::create_dir_all(&global_modules).unwrap();
        let local_modules = fx.workdir.join(".opencode/node_modules");
        std::fs::create_dir_all(local_modules.join("left-pad")).unwrap();
        let sources = ToolSources {
            global_node_modules: global_modules,
            ..fx.sources("app/sandbox/inspect-plugin.js", "no-tools")
        };

        let installed = install_tools(&fx.workdir, &sources).unwrap();

        assert_eq!(installed.len(), 1);
        assert!(local_modules.symlink_metadata().unwrap().is_dir());
        assert!(local_modules.join("left-pad").is_dir());
        assert!(fx.workdir.join(".opencode/package.json").is_file());
    }

    #[test]
    fn test_legacy_and_tools_dir_combined() {
        let fx = Fixture::new();
        fx.write("app/sandbox/inspect-plugin.js", "// legacy");
        fx.write("app/sandbox/tools/spawn-task.js", "// spawn");
        fx.write("app/sandbox/tools/_bridge-client.js", "// bridge");

        install_tools(
            &fx.workdir,
            &fx.sources("app/sandbox/inspect-plugin.js", "app/sandbox/tools"),
        )
        .unwrap();

        assert!(fx.tool_dir().join("create-pull-request.js").exists());
        assert!(fx.tool_dir().join("spawn-task.js").exists());
        assert!(fx.tool_dir().join("_bridge-client.js").exists());
        assert_eq!(fx.js_count(), 3);
    }
}
