//! Typed views over the text-format files: the per-image metadata record
//! and the build recipe.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::textproto::{self, Message, Value};

/// Declares that reads under this package's directory should also yield
/// entries of `pkg`'s `dir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeUnion {
    pub pkg: String,
    pub dir: String,
}

/// The sibling record of an image, stored as `<identifier>.meta.textproto`
/// and written before the image file so readers always see a consistent
/// pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Meta {
    pub version: String,
    pub source_pkg: String,
    pub input_digest: String,
    pub runtime_deps: Vec<String>,
    pub runtime_unions: Vec<RuntimeUnion>,
}

impl Meta {
    pub fn parse(text: &str, file: &str) -> Result<Self, Error> {
        let msg = textproto::parse(text, file)?;
        Ok(Self {
            version: msg.get_str("version").unwrap_or_default().to_string(),
            source_pkg: msg.get_str("source_pkg").unwrap_or_default().to_string(),
            input_digest: msg.get_str("input_digest").unwrap_or_default().to_string(),
            runtime_deps: msg.strings("runtime_dep").map(str::to_string).collect(),
            runtime_unions: msg
                .messages("runtime_union")
                .map(|m| RuntimeUnion {
                    pkg: m.get_str("pkg").unwrap_or_default().to_string(),
                    dir: m.get_str("dir").unwrap_or_default().to_string(),
                })
                .collect(),
        })
    }

    pub fn read_from(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text, &path.display().to_string())
    }

    pub fn serialize(&self) -> String {
        let mut msg = Message::new();
        if !self.version.is_empty() {
            msg.add_str("version", &self.version);
        }
        if !self.source_pkg.is_empty() {
            msg.add_str("source_pkg", &self.source_pkg);
        }
        if !self.input_digest.is_empty() {
            msg.add_str("input_digest", &self.input_digest);
        }
        for dep in &self.runtime_deps {
            msg.add_str("runtime_dep", dep);
        }
        for u in &self.runtime_unions {
            let mut inner = Message::new();
            inner.add_str("pkg", &u.pkg);
            inner.add_str("dir", &u.dir);
            msg.add("runtime_union", Value::Message(inner));
        }
        msg.serialize()
    }

    pub fn write_to(&self, path: &Path) -> Result<(), Error> {
        std::fs::write(path, self.serialize())?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuilderKind {
    C { extra_configure_flags: Vec<String> },
    CMake { extra_cmake_flags: Vec<String> },
    Meson { extra_meson_flags: Vec<String> },
    Perl,
    Python,
    Go { install: Vec<String>, import_path: Option<String> },
    GoMod,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallFile {
    pub srcpath: String,
    pub destpath: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSymlink {
    pub oldname: String,
    pub newname: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallChmod {
    pub setuid: bool,
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallRename {
    pub oldname: String,
    pub newname: String,
}

/// Declarative transforms applied to the destdir after the build steps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallActions {
    pub systemd_units: Vec<String>,
    pub files: Vec<InstallFile>,
    pub symlinks: Vec<InstallSymlink>,
    pub chmods: Vec<InstallChmod>,
    pub empty_dirs: Vec<String>,
    pub renames: Vec<InstallRename>,
    pub deletes: Vec<String>,
}

impl InstallActions {
    fn parse(msg: &Message) -> Self {
        Self {
            systemd_units: msg.strings("systemd_unit").map(str::to_string).collect(),
            files: msg
                .messages("file")
                .map(|m| InstallFile {
                    srcpath: m.get_str("srcpath").unwrap_or_default().to_string(),
                    destpath: m.get_str("destpath").unwrap_or_default().to_string(),
                })
                .collect(),
            symlinks: msg
                .messages("symlink")
                .map(|m| InstallSymlink {
                    oldname: m.get_str("oldname").unwrap_or_default().to_string(),
                    newname: m.get_str("newname").unwrap_or_default().to_string(),
                })
                .collect(),
            chmods: msg
                .messages("chmod")
                .map(|m| InstallChmod {
                    setuid: m.get_bool("setuid").unwrap_or(false),
                    path: m.get_str("path").unwrap_or_default().to_string(),
                })
                .collect(),
            empty_dirs: msg.strings("empty_dir").map(str::to_string).collect(),
            renames: msg
                .messages("rename")
                .map(|m| InstallRename {
                    oldname: m.get_str("oldname").unwrap_or_default().to_string(),
                    newname: m.get_str("newname").unwrap_or_default().to_string(),
                })
                .collect(),
            deletes: msg.strings("delete").map(str::to_string).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Claim {
    pub glob: String,
    pub dir: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitPackage {
    pub name: String,
    pub claims: Vec<Claim>,
    pub runtime_deps: Vec<String>,
}

/// A declarative build recipe, stored as `build.textproto` in a package's
/// source directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recipe {
    pub source: String,
    pub hash: String,
    /// `upstream-revision`, e.g. `530-2`.
    pub version: String,
    pub writable_sourcedir: bool,
    pub in_tree_build: bool,
    pub builder: Option<BuilderKind>,
    pub build_steps: Vec<Vec<String>>,
    pub deps: Vec<String>,
    pub runtime_deps: Vec<String>,
    pub cherry_picks: Vec<String>,
    pub extra_files: Vec<String>,
    pub install: InstallActions,
    pub split_packages: Vec<SplitPackage>,
    pub runtime_unions: Vec<RuntimeUnion>,
    /// Upstream tracking configuration; parsed but unused here.
    pub pull: Option<Message>,
}

impl Recipe {
    pub fn parse(text: &str, file: &str) -> Result<Self, Error> {
        let msg = textproto::parse(text, file)?;

        let mut builder = None;
        let mut seen = 0;
        let mut take = |b: BuilderKind| {
            seen += 1;
            builder = Some(b);
        };
        if let Some(m) = msg.get_message("cbuilder") {
            take(BuilderKind::C {
                extra_configure_flags: m
                    .strings("extra_configure_flag")
                    .map(str::to_string)
                    .collect(),
            });
        }
        if let Some(m) = msg.get_message("cmakebuilder") {
            take(BuilderKind::CMake {
                extra_cmake_flags: m.strings("extra_cmake_flag").map(str::to_string).collect(),
            });
        }
        if let Some(m) = msg.get_message("mesonbuilder") {
            take(BuilderKind::Meson {
                extra_meson_flags: m.strings("extra_meson_flag").map(str::to_string).collect(),
            });
        }
        if msg.get_message("perlbuilder").is_some() {
            take(BuilderKind::Perl);
        }
        if msg.get_message("pythonbuilder").is_some() {
            take(BuilderKind::Python);
        }
        if let Some(m) = msg.get_message("gobuilder") {
            take(BuilderKind::Go {
                install: m.strings("install").map(str::to_string).collect(),
                import_path: m.get_str("import_path").map(str::to_string),
            });
        }
        if msg.get_message("gomodbuilder").is_some() {
            take(BuilderKind::GoMod);
        }
        if seen > 1 {
            return Err(Error::Recipe(format!("{file}: more than one builder declared")));
        }

        Ok(Self {
            source: msg.get_str("source").unwrap_or_default().to_string(),
            hash: msg.get_str("hash").unwrap_or_default().to_string(),
            version: msg.get_str("version").unwrap_or_default().to_string(),
            writable_sourcedir: msg.get_bool("writable_sourcedir").unwrap_or(false),
            in_tree_build: msg.get_bool("in_tree_build").unwrap_or(false),
            builder,
            build_steps: msg
                .messages("build_step")
                .map(|m| m.strings("argv").map(str::to_string).collect())
                .collect(),
            deps: msg.strings("dep").map(str::to_string).collect(),
            runtime_deps: msg.strings("runtime_dep").map(str::to_string).collect(),
            cherry_picks: msg.strings("cherry_pick").map(str::to_string).collect(),
            extra_files: msg.strings("extra_file").map(str::to_string).collect(),
            install: msg.get_message("install").map(InstallActions::parse).unwrap_or_default(),
            split_packages: msg
                .messages("split_package")
                .map(|m| SplitPackage {
                    name: m.get_str("name").unwrap_or_default().to_string(),
                    claims: m
                        .messages("claim")
                        .map(|c| Claim {
                            glob: c.get_str("glob").unwrap_or_default().to_string(),
                            dir: c.get_str("dir").map(str::to_string),
                        })
                        .collect(),
                    runtime_deps: m.strings("runtime_dep").map(str::to_string).collect(),
                })
                .collect(),
            runtime_unions: msg
                .messages("runtime_union")
                .map(|m| RuntimeUnion {
                    pkg: m.get_str("pkg").unwrap_or_default().to_string(),
                    dir: m.get_str("dir").unwrap_or_default().to_string(),
                })
                .collect(),
            pull: msg.get_message("pull").cloned(),
        })
    }

    pub fn read_from(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text, &path.display().to_string())
    }

    /// A recipe must say how to build: a builder variant or explicit
    /// steps, but not neither.
    pub fn validate(&self) -> Result<(), Error> {
        if self.builder.is_none() && self.build_steps.is_empty() {
            return Err(Error::Recipe("recipe has neither a builder nor build steps".into()));
        }
        Ok(())
    }

    /// Split `version` into `(upstream, revision)`; the revision defaults
    /// to 1 when absent.
    pub fn upstream_and_revision(&self) -> (String, i64) {
        match self.version.rsplit_once('-') {
            Some((upstream, rev)) => match rev.parse() {
                Ok(rev) => (upstream.to_string(), rev),
                Err(_) => (self.version.clone(), 1),
            },
            None => (self.version.clone(), 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_roundtrip() {
        let meta = Meta {
            version: "530-2".into(),
            source_pkg: "less".into(),
            input_digest: "f6e3190b2a10c24966e9a062db24028c".into(),
            runtime_deps: vec!["glibc-amd64-2.31-4".into(), "ncurses-amd64-6.2-8".into()],
            runtime_unions: vec![RuntimeUnion { pkg: "emacs".into(), dir: "share/emacs".into() }],
        };
        let text = meta.serialize();
        assert_eq!(Meta::parse(&text, "t").unwrap(), meta);
    }

    #[test]
    fn test_recipe_parse() {
        let recipe = Recipe::parse(
            r#"
source: "https://ftp.gnu.org/gnu/hello/hello-2.10.tar.gz"
hash: "31e066137a962676e89f69d1b65382de95a7ef7d914b8cb956f41ea72e0f516b"
version: "2.10-3"
cbuilder {
  extra_configure_flag: "--disable-nls"
}
dep: "ncurses"
runtime_dep: "bash"
cherry_pick: "fix-build.patch"
install {
  symlink { oldname: "hello" newname: "bin/hi" }
  empty_dir: "var/lib/hello"
}
split_package {
  name: "hello-doc"
  claim { glob: "out/share/man/*" }
}
"#,
            "build.textproto",
        )
        .unwrap();
        assert_eq!(recipe.version, "2.10-3");
        assert_eq!(recipe.upstream_and_revision(), ("2.10".to_string(), 3));
        match &recipe.builder {
            Some(BuilderKind::C { extra_configure_flags }) => {
                assert_eq!(extra_configure_flags, &["--disable-nls"]);
            }
            other => panic!("unexpected builder {other:?}"),
        }
        assert_eq!(recipe.deps, vec!["ncurses"]);
        assert_eq!(recipe.install.symlinks[0].newname, "bin/hi");
        assert_eq!(recipe.split_packages[0].name, "hello-doc");
        recipe.validate().unwrap();
    }

    #[test]
    fn test_recipe_requires_builder_or_steps() {
        let recipe = Recipe::parse("version: \"1-1\"\n", "t").unwrap();
        assert!(recipe.validate().is_err());

        let recipe = Recipe::parse(
            "version: \"1-1\"\nbuild_step { argv: \"make\" argv: \"all\" }\n",
            "t",
        )
        .unwrap();
        recipe.validate().unwrap();
        assert_eq!(recipe.build_steps, vec![vec!["make".to_string(), "all".to_string()]]);
    }

    #[test]
    fn test_recipe_rejects_two_builders() {
        let err = Recipe::parse("cbuilder {}\nmesonbuilder {}\n", "t").unwrap_err();
        assert!(matches!(err, Error::Recipe(_)));
    }
}
