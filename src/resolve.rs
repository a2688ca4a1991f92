//! Dependency resolution.
//!
//! Build and runtime dependencies are written as partial identifiers;
//! resolution globs each one to its newest match and then walks
//! `runtime_deps` metadata to a transitive closure. The closure keeps
//! depth-first insertion order because that order becomes link/include/
//! PATH ordering inside the build sandbox.

use std::collections::HashSet;
use std::path::PathBuf;

use regex::Regex;
use tracing::debug;

use crate::error::Error;
use crate::meta::BuilderKind;
use crate::pkg::PackageId;
use crate::store::Store;

/// Glob every partial in `deps`, then close over `runtime_deps`.
/// `prune` removes one package name wherever it appears, which is how a
/// package avoids depending on itself through its own split packages.
pub fn glob_and_resolve(
    store: &Store,
    deps: &[String],
    prune: Option<&str>,
) -> Result<Vec<PackageId>, Error> {
    let mut result: Vec<PackageId> = vec![];
    let mut seen: HashSet<String> = HashSet::new();

    fn visit(
        store: &Store,
        id: PackageId,
        prune: Option<&str>,
        result: &mut Vec<PackageId>,
        seen: &mut HashSet<String>,
    ) -> Result<(), Error> {
        if prune == Some(id.name.as_str()) {
            return Ok(());
        }
        if !seen.insert(id.to_string()) {
            return Ok(());
        }
        let meta = store.read_meta(&id)?;
        result.push(id);
        for dep in &meta.runtime_deps {
            let partial = PackageId::parse(dep)?;
            if prune == Some(partial.name.as_str()) {
                continue;
            }
            match store.glob_opt(&partial)? {
                Some(resolved) => visit(store, resolved, prune, result, seen)?,
                None => debug!(dep, "runtime dependency not present in store"),
            }
        }
        Ok(())
    }

    for dep in deps {
        let partial = PackageId::parse(dep)?;
        if prune == Some(partial.name.as_str()) {
            continue;
        }
        let resolved = store.glob(&partial)?;
        visit(store, resolved, prune, &mut result, &mut seen)?;
    }

    Ok(promote_newest(result))
}

/// When the closure contains one name at several revisions, move the
/// newest revision to the name's first position so it wins ordering.
fn promote_newest(mut ids: Vec<PackageId>) -> Vec<PackageId> {
    for i in 0..ids.len() {
        let mut newest = i;
        for j in i + 1..ids.len() {
            if ids[j].name == ids[i].name
                && ids[j].arch == ids[i].arch
                && ids[newest].revision_less(&ids[j])
            {
                newest = j;
            }
        }
        if newest != i {
            ids.swap(i, newest);
        }
    }
    ids
}

/// One shared library dependency discovered from the runtime linker's
/// trace output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibDep {
    pub lib: String,
    pub path: PathBuf,
    /// The package owning the resolved library, from its `/ro/<pkg>/`
    /// path prefix.
    pub pkg: String,
}

/// Parse `ldd`-style trace output. Only lines resolving into `/ro` count;
/// anything else is the host leaking through and is ignored.
pub fn parse_ldd_output(out: &str) -> Vec<LibDep> {
    let re = Regex::new(r"(?m)^\t(\S+) => (/ro/([^/]+)/\S+)").unwrap();
    re.captures_iter(out)
        .map(|cap| LibDep {
            lib: cap[1].to_string(),
            path: PathBuf::from(&cap[2]),
            pkg: cap[3].to_string(),
        })
        .collect()
}

/// Module names from a pkg-config file's `Requires:` line, version
/// constraints dropped.
pub fn pkg_config_requires(content: &str) -> Vec<String> {
    let mut out = vec![];
    for line in content.lines() {
        let Some(rest) = line.strip_prefix("Requires:") else { continue };
        let mut skip_version = false;
        for token in rest.split(&[',', ' ', '\t'][..]).filter(|t| !t.is_empty()) {
            if matches!(token, ">" | ">=" | "=" | "<=" | "<" | "!=") {
                skip_version = true;
                continue;
            }
            if skip_version {
                skip_version = false;
                continue;
            }
            out.push(token.to_string());
        }
    }
    out
}

/// The canonical build-time dependencies each builder variant injects on
/// top of the recipe's own `dep` list.
pub fn builder_deps(builder: Option<&BuilderKind>) -> Vec<&'static str> {
    const BASE: &[&str] =
        &["bash", "coreutils", "findutils", "sed", "grep", "gawk", "pkg-config"];
    const CC: &[&str] = &["gcc", "binutils", "make", "glibc", "linux"];

    let mut deps: Vec<&'static str> = BASE.to_vec();
    match builder {
        Some(BuilderKind::C { .. }) => deps.extend(CC),
        Some(BuilderKind::CMake { .. }) => {
            deps.extend(CC);
            deps.extend(["cmake", "ninja"]);
        }
        Some(BuilderKind::Meson { .. }) => {
            deps.extend(CC);
            deps.extend(["meson", "ninja"]);
        }
        Some(BuilderKind::Perl) => {
            deps.extend(CC);
            deps.push("perl");
        }
        Some(BuilderKind::Python) => {
            deps.extend(CC);
            deps.push("python3");
        }
        Some(BuilderKind::Go { .. }) | Some(BuilderKind::GoMod) => deps.push("go"),
        None => {}
    }
    deps
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ldd_output() {
        let out = "\tlinux-vdso.so.1 (0x00007ffd)\n\
                   \tlibncursesw.so.6 => /ro/ncurses-amd64-6.2-8/out/lib/libncursesw.so.6 (0x00007f)\n\
                   \tlibc.so.6 => /lib64/libc.so.6 (0x00007f)\n\
                   \tlibm.so.6 => /ro/glibc-amd64-2.31-4/out/lib/libm.so.6 (0x00007f)\n";
        let deps = parse_ldd_output(out);
        assert_eq!(deps.len(), 2);
        assert_eq!(deps[0].lib, "libncursesw.so.6");
        assert_eq!(deps[0].pkg, "ncurses-amd64-6.2-8");
        assert_eq!(deps[1].pkg, "glibc-amd64-2.31-4");
    }

    #[test]
    fn test_pkg_config_requires() {
        let pc = "prefix=/ro/glib-amd64-2.58.0-11/out\n\
                  Requires: gobject-2.0 >= 2.12.0, gio-2.0\n\
                  Libs: -lglib-2.0\n";
        assert_eq!(pkg_config_requires(pc), vec!["gobject-2.0", "gio-2.0"]);
    }

    #[test]
    fn test_promote_newest() {
        let ids: Vec<PackageId> = ["a-amd64-1-1", "b-amd64-1-1", "a-amd64-1-3", "c-amd64-1-1"]
            .iter()
            .map(|s| PackageId::parse(s).unwrap())
            .collect();
        let promoted = promote_newest(ids);
        let rendered: Vec<String> = promoted.iter().map(|id| id.to_string()).collect();
        assert_eq!(rendered, vec!["a-amd64-1-3", "b-amd64-1-1", "a-amd64-1-1", "c-amd64-1-1"]);
    }

    #[test]
    fn test_builder_deps() {
        let deps = builder_deps(Some(&BuilderKind::Meson { extra_meson_flags: vec![] }));
        assert!(deps.contains(&"meson"));
        assert!(deps.contains(&"ninja"));
        assert!(deps.contains(&"gcc"));
        assert!(builder_deps(None).contains(&"bash"));
    }
}
