//! Builder dispatch and build-step substitution.
//!
//! Each builder variant expands to a list of steps whose argv contains
//! `${DISTRI_*}` placeholders; recipes with explicit `build_step` lists
//! go through the same substitution. `${DISTRI_RESOLVE:<name>}` expands
//! to the newest resolved identifier of `<name>`, which is how a step
//! refers to another package's files under `/ro` without pinning a
//! revision in the recipe.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::meta::{BuilderKind, Recipe};

/// One build step: an argv plus environment overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl Step {
    fn new(argv: &[&str]) -> Self {
        Self { argv: argv.iter().map(|s| s.to_string()).collect(), env: vec![] }
    }

    fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }
}

/// Values substituted into step argvs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepEnv {
    pub destdir: String,
    pub prefix: String,
    pub sourcedir: String,
    pub builddir: String,
    pub fullname: String,
    pub jobs: usize,
}

/// The steps for `recipe`: the builder's canonical sequence, or the
/// recipe's explicit `build_step` list.
pub fn steps(recipe: &Recipe) -> Result<Vec<Step>, Error> {
    recipe.validate()?;
    if let Some(builder) = &recipe.builder {
        return Ok(builder_steps(builder, recipe));
    }
    Ok(recipe
        .build_steps
        .iter()
        .map(|argv| Step { argv: argv.clone(), env: vec![] })
        .collect())
}

fn builder_steps(builder: &BuilderKind, recipe: &Recipe) -> Vec<Step> {
    match builder {
        BuilderKind::C { extra_configure_flags } => {
            let mut configure = vec![
                "${DISTRI_SOURCEDIR}/configure".to_string(),
                "--host=x86_64-pc-linux-gnu".to_string(),
                "--prefix=${DISTRI_PREFIX}".to_string(),
                "--sysconfdir=/etc".to_string(),
            ];
            configure.extend(extra_configure_flags.iter().cloned());
            vec![
                Step { argv: configure, env: vec![] },
                Step::new(&["make", "-j${DISTRI_JOBS}"]),
                Step::new(&["make", "install", "DESTDIR=${DISTRI_DESTDIR}"]),
            ]
        }
        BuilderKind::CMake { extra_cmake_flags } => {
            let mut cmake = vec![
                "cmake".to_string(),
                "-G".to_string(),
                "Ninja".to_string(),
                "-DCMAKE_INSTALL_PREFIX=${DISTRI_PREFIX}".to_string(),
                "-DCMAKE_BUILD_TYPE=Release".to_string(),
            ];
            cmake.extend(extra_cmake_flags.iter().cloned());
            cmake.push("${DISTRI_SOURCEDIR}".to_string());
            vec![
                Step { argv: cmake, env: vec![] },
                Step::new(&["ninja", "-j${DISTRI_JOBS}"]),
                Step::new(&["ninja", "install"])
                    .with_env("DESTDIR", "${DISTRI_DESTDIR}"),
            ]
        }
        BuilderKind::Meson { extra_meson_flags } => {
            let mut meson = vec![
                "meson".to_string(),
                "--prefix=${DISTRI_PREFIX}".to_string(),
            ];
            meson.extend(extra_meson_flags.iter().cloned());
            meson.push("${DISTRI_SOURCEDIR}".to_string());
            meson.push("${DISTRI_BUILDDIR}/meson".to_string());
            vec![
                Step { argv: meson, env: vec![] },
                Step::new(&["ninja", "-C", "${DISTRI_BUILDDIR}/meson"]),
                Step::new(&["ninja", "-C", "${DISTRI_BUILDDIR}/meson", "install"])
                    .with_env("DESTDIR", "${DISTRI_DESTDIR}"),
            ]
        }
        BuilderKind::Perl => vec![
            Step::new(&["perl", "${DISTRI_SOURCEDIR}/Makefile.PL", "PREFIX=${DISTRI_PREFIX}"]),
            Step::new(&["make", "-j${DISTRI_JOBS}"]),
            Step::new(&["make", "install", "DESTDIR=${DISTRI_DESTDIR}"]),
        ],
        BuilderKind::Python => vec![Step::new(&[
            "python3",
            "${DISTRI_SOURCEDIR}/setup.py",
            "install",
            "--root=${DISTRI_DESTDIR}",
            "--prefix=${DISTRI_PREFIX}",
        ])],
        BuilderKind::Go { install, import_path } => {
            let mut args = vec!["go".to_string(), "install".to_string()];
            if install.is_empty() {
                args.push(import_path.clone().unwrap_or_else(|| "./...".to_string()));
            } else {
                args.extend(install.iter().cloned());
            }
            vec![Step { argv: args, env: vec![] }
                .with_env("GOPATH", "${DISTRI_BUILDDIR}/gopath")
                .with_env("GOBIN", "${DISTRI_DESTDIR}${DISTRI_PREFIX}/out/bin")
                .with_env("GO111MODULE", "off")]
        }
        BuilderKind::GoMod => vec![Step::new(&["go", "install", "./..."])
            .with_env("GOBIN", "${DISTRI_DESTDIR}${DISTRI_PREFIX}/out/bin")
            .with_env("GOFLAGS", "-mod=vendor")],
    }
    .into_iter()
    .map(|s| inject_in_tree(s, recipe))
    .collect()
}

/// `in_tree_build` recipes configure from `.` instead of the source dir.
fn inject_in_tree(mut step: Step, recipe: &Recipe) -> Step {
    if recipe.in_tree_build {
        for arg in &mut step.argv {
            if arg == "${DISTRI_SOURCEDIR}/configure" {
                *arg = "./configure".to_string();
            }
        }
    }
    step
}

/// Expand every `${DISTRI_*}` placeholder in one string. `resolve`
/// supplies `${DISTRI_RESOLVE:<name>}` expansions.
pub fn substitute(
    input: &str,
    env: &StepEnv,
    resolve: &dyn Fn(&str) -> Option<String>,
) -> Result<String, Error> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${DISTRI_") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(Error::Recipe(format!("unterminated substitution in {input:?}")));
        };
        let var = &after[..end];
        match var {
            "DISTRI_DESTDIR" => out.push_str(&env.destdir),
            "DISTRI_PREFIX" => out.push_str(&env.prefix),
            "DISTRI_SOURCEDIR" => out.push_str(&env.sourcedir),
            "DISTRI_BUILDDIR" => out.push_str(&env.builddir),
            "DISTRI_FULLNAME" => out.push_str(&env.fullname),
            "DISTRI_JOBS" => out.push_str(&env.jobs.to_string()),
            _ => {
                if let Some(name) = var.strip_prefix("DISTRI_RESOLVE:") {
                    let resolved = resolve(name).ok_or_else(|| {
                        Error::Recipe(format!("cannot resolve {name:?} for substitution"))
                    })?;
                    out.push_str(&resolved);
                } else {
                    return Err(Error::Recipe(format!("unknown substitution ${{{var}}}")));
                }
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

pub fn substitute_step(
    step: &Step,
    env: &StepEnv,
    resolve: &dyn Fn(&str) -> Option<String>,
) -> Result<Step, Error> {
    Ok(Step {
        argv: step
            .argv
            .iter()
            .map(|a| substitute(a, env, resolve))
            .collect::<Result<_, _>>()?,
        env: step
            .env
            .iter()
            .map(|(k, v)| Ok((k.clone(), substitute(v, env, resolve)?)))
            .collect::<Result<_, Error>>()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> StepEnv {
        StepEnv {
            destdir: "/tmp/dest".into(),
            prefix: "/ro/hello-amd64-2.10-3".into(),
            sourcedir: "/usr/src/hello-amd64-2.10-3".into(),
            builddir: "/tmp/build".into(),
            fullname: "hello-amd64-2.10-3".into(),
            jobs: 8,
        }
    }

    #[test]
    fn test_substitute() {
        let out = substitute(
            "${DISTRI_SOURCEDIR}/configure --prefix=${DISTRI_PREFIX} -j${DISTRI_JOBS}",
            &env(),
            &|_| None,
        )
        .unwrap();
        assert_eq!(
            out,
            "/usr/src/hello-amd64-2.10-3/configure --prefix=/ro/hello-amd64-2.10-3 -j8"
        );
    }

    #[test]
    fn test_substitute_resolve() {
        let out = substitute(
            "--with-glibc=/ro/${DISTRI_RESOLVE:glibc}",
            &env(),
            &|name| (name == "glibc").then(|| "glibc-amd64-2.31-4".to_string()),
        )
        .unwrap();
        assert_eq!(out, "--with-glibc=/ro/glibc-amd64-2.31-4");

        assert!(substitute("${DISTRI_RESOLVE:nope}", &env(), &|_| None).is_err());
        assert!(substitute("${DISTRI_BOGUS}", &env(), &|_| None).is_err());
    }

    #[test]
    fn test_c_builder_steps() {
        let recipe = Recipe {
            builder: Some(BuilderKind::C {
                extra_configure_flags: vec!["--disable-nls".into()],
            }),
            ..Recipe::default()
        };
        let steps = steps(&recipe).unwrap();
        assert_eq!(steps.len(), 3);
        assert!(steps[0].argv.contains(&"--disable-nls".to_string()));
        assert_eq!(steps[1].argv, vec!["make", "-j${DISTRI_JOBS}"]);
        assert_eq!(steps[2].argv[2], "DESTDIR=${DISTRI_DESTDIR}");
    }

    #[test]
    fn test_explicit_steps_pass_through() {
        let recipe = Recipe {
            build_steps: vec![vec!["make".into(), "PREFIX=${DISTRI_PREFIX}".into()]],
            ..Recipe::default()
        };
        let steps = steps(&recipe).unwrap();
        assert_eq!(steps[0].argv[1], "PREFIX=${DISTRI_PREFIX}");
    }
}
