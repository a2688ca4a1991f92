//! Wrapper binary generation.
//!
//! Every executable in `<prefix>/out/bin` and `<prefix>/out/sbin` gets a
//! native stub in `<prefix>/bin` that sets the runtime environment
//! computed from the package's runtime dependencies and `execv`s the
//! original. The original's absolute path is additionally embedded in a
//! dedicated ELF section so other tooling can recover it without running
//! the stub. Shells (`bash`, `zsh`) are symlinked instead so they behave
//! as real login shells.

use std::fmt::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Command;

use tracing::{debug, info};

use crate::error::Error;
use crate::pkg::PackageId;

/// Binaries that must not be wrapped.
const SYMLINK_ONLY: &[&str] = &["bash", "zsh"];

/// The environment a wrapper exports, derived from the dependency
/// closure. Order matters: the package itself first, then its deps in
/// closure order.
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct WrapperEnv {
    pub path: Vec<String>,
    pub ld_library_path: Vec<String>,
    pub perl5lib: Vec<String>,
    pub pythonpath: Vec<String>,
}

impl WrapperEnv {
    pub fn for_package(full_name: &str, deps: &[PackageId]) -> Self {
        let mut env = WrapperEnv::default();
        let mut add = |pkg: &str| {
            env.path.push(format!("/ro/{pkg}/bin"));
            env.ld_library_path.push(format!("/ro/{pkg}/out/lib"));
            env.perl5lib.push(format!("/ro/{pkg}/out/lib/perl5"));
            env.pythonpath.push(format!("/ro/{pkg}/out/lib/python"));
        };
        add(full_name);
        for dep in deps {
            let dep = dep.to_string();
            if dep != full_name {
                add(&dep);
            }
        }
        env
    }

    fn pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("PATH", self.path.join(":")),
            ("LD_LIBRARY_PATH", self.ld_library_path.join(":")),
            ("PERL5LIB", self.perl5lib.join(":")),
            ("PYTHONPATH", self.pythonpath.join(":")),
        ]
    }
}

/// Generate wrappers for every executable under `root/out/bin` and
/// `root/out/sbin` into `root/bin`. `cc` is the compiler to use inside
/// the sandbox; when it is unavailable the stub degrades to a symlink so
/// non-hermetic test builds still produce a usable tree.
pub fn generate(
    root: &Path,
    full_name: &str,
    env: &WrapperEnv,
    cc: Option<&str>,
) -> Result<(), Error> {
    let bin_dir = root.join("bin");
    for sub in ["out/bin", "out/sbin"] {
        let src_dir = root.join(sub);
        let entries = match std::fs::read_dir(&src_dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        std::fs::create_dir_all(&bin_dir)?;
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let target = format!("/ro/{full_name}/{sub}/{name}");
            let stub = bin_dir.join(name);
            if stub.exists() {
                continue;
            }

            if SYMLINK_ONLY.contains(&name) {
                debug!(name, "shell, symlinking instead of wrapping");
                std::os::unix::fs::symlink(format!("../{sub}/{name}"), &stub)?;
                continue;
            }

            match cc {
                Some(cc) => compile_stub(cc, &stub, &target, env)?,
                None => std::os::unix::fs::symlink(format!("../{sub}/{name}"), &stub)?,
            }
        }
    }
    info!(pkg = full_name, "wrappers generated");
    Ok(())
}

/// The C source of one wrapper stub.
pub fn stub_source(target: &str, env: &WrapperEnv) -> String {
    let mut src = String::new();
    src.push_str("#include <unistd.h>\n\n");
    // discoverable without execution
    let _ = writeln!(
        src,
        "const char distrifilename[] __attribute__((section(\"distrifilename\"))) = \"{target}\";"
    );
    src.push_str("\nint main(int argc, char *argv[]) {\n");
    for (key, value) in env.pairs() {
        let _ = writeln!(src, "  setenv(\"{key}\", \"{value}\", 1);");
    }
    let _ = writeln!(src, "  argv[0] = (char *)distrifilename;");
    let _ = writeln!(src, "  return execv(\"{target}\", argv);");
    src.push_str("}\n");
    src
}

fn compile_stub(cc: &str, stub: &Path, target: &str, env: &WrapperEnv) -> Result<(), Error> {
    let src_file = stub.with_extension("wrapper.c");
    std::fs::write(&src_file, stub_source(target, env))?;
    let status = Command::new(cc)
        .arg("-O2")
        .arg("-static")
        .arg("-o")
        .arg(stub)
        .arg(&src_file)
        .status()?;
    std::fs::remove_file(&src_file)?;
    if !status.success() {
        return Err(Error::ToolFailed { tool: cc.to_string(), status });
    }
    let mut perms = std::fs::metadata(stub)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(stub, perms)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stub_source_embeds_target_and_env() {
        let deps = vec![PackageId::parse("ncurses-amd64-6.2-8").unwrap()];
        let env = WrapperEnv::for_package("less-amd64-530-2", &deps);
        let src = stub_source("/ro/less-amd64-530-2/out/bin/less", &env);
        assert!(src.contains("section(\"distrifilename\")"));
        assert!(src.contains("/ro/less-amd64-530-2/out/bin/less"));
        assert!(src.contains("setenv(\"PATH\", \"/ro/less-amd64-530-2/bin:/ro/ncurses-amd64-6.2-8/bin\", 1);"));
        assert!(src.contains("LD_LIBRARY_PATH"));
    }

    #[test]
    fn test_generate_symlinks_without_cc() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("out/bin")).unwrap();
        std::fs::write(root.join("out/bin/less"), b"elf").unwrap();
        std::fs::write(root.join("out/bin/bash"), b"elf").unwrap();

        let env = WrapperEnv::for_package("less-amd64-530-2", &[]);
        generate(root, "less-amd64-530-2", &env, None).unwrap();

        assert_eq!(
            std::fs::read_link(root.join("bin/less")).unwrap(),
            std::path::PathBuf::from("../out/bin/less")
        );
        assert_eq!(
            std::fs::read_link(root.join("bin/bash")).unwrap(),
            std::path::PathBuf::from("../out/bin/bash")
        );
    }
}
