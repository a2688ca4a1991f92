//! A single hermetic package build.
//!
//! ```text
//! INIT → FETCH → EXTRACT → DIGEST → (cache hit? SKIP)
//!      → SETUP → STEPS → INSTALL → WRAP → DEPSCAN → ENCODE → DONE
//! ```
//!
//! The parent process prepares directories, resolves dependencies and
//! computes the input digest; the sandboxed stages run in a re-executed
//! child (`DISTRI_BUILD_PROCESS=1`) that receives its job as a JSON file
//! and answers with the discovered runtime dependencies on stdout.
//! Encoding happens back in the parent: the destdir is bind-mounted into
//! the namespace, so its contents survive the child.

pub mod builders;
pub mod elf;
pub mod extract;
pub mod fetch;
pub mod install;
pub mod sandbox;
pub mod wrapper;

use std::fs::File;
use std::io::{Seek, Write};
use std::os::unix::io::FromRawFd;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::digest::Fnv128a;
use crate::error::Error;
use crate::meta::{InstallActions, Meta, Recipe, RuntimeUnion};
use crate::pkg::PackageId;
use crate::resolve;
use crate::squashfs::{Directory, Writer};
use crate::store::Store;
use self::builders::{Step, StepEnv};
use self::wrapper::WrapperEnv;

/// Set by the signal handler; checked between stages so a cancelled
/// build stops at the next boundary and leaves no temp output behind.
pub static CANCELLED: AtomicBool = AtomicBool::new(false);

fn check_cancelled() -> Result<(), Error> {
    if CANCELLED.load(Ordering::SeqCst) {
        return Err(Error::StdIo(std::io::Error::new(
            std::io::ErrorKind::Interrupted,
            "build cancelled",
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Package name, i.e. the recipe directory's basename.
    pub pkg: String,
    pub arch: String,
    /// Directory holding `build.textproto`, patches and extra files.
    pub pkg_dir: PathBuf,
    /// Scratch space for distfiles, sources, build and dest trees.
    pub work_dir: PathBuf,
    /// The store new images are written into (and deps resolved from).
    pub repo: PathBuf,
    pub jobs: usize,
    pub hermetic: bool,
    /// Spawn an interactive shell after the named stage.
    pub debug: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum BuildOutcome {
    /// Paths of the images written, primary first.
    Built(Vec<PathBuf>),
    CacheHit,
}

/// The serialized job handed to the re-executed child.
#[derive(Debug, Serialize, Deserialize)]
pub struct Job {
    pub sandbox: sandbox::SandboxConfig,
    pub steps: Vec<Step>,
    pub step_env: StepEnv,
    pub install: InstallActions,
    pub wrapper_env: WrapperEnv,
    pub keep_symbols: bool,
    pub resolved_deps: Vec<String>,
    pub debug: Option<String>,
}

/// What the child reports back over its stdout pipe.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct JobReply {
    pub runtime_dep_pkgs: Vec<String>,
}

pub struct Build {
    cfg: BuildConfig,
    recipe: Recipe,
    recipe_text: String,
    upstream: String,
    revision: i64,
    store: Store,
}

impl Build {
    pub fn new(cfg: BuildConfig) -> Result<Self, Error> {
        let recipe_path = cfg.pkg_dir.join("build.textproto");
        let recipe_text = std::fs::read_to_string(&recipe_path)?;
        let recipe = Recipe::parse(&recipe_text, &recipe_path.display().to_string())?;
        let (upstream, revision) = recipe.upstream_and_revision();
        let store = Store::new(cfg.repo.display().to_string());
        Ok(Self { cfg, recipe, recipe_text, upstream, revision, store })
    }

    pub fn full_name(&self) -> String {
        format!("{}-{}-{}-{}", self.cfg.pkg, self.cfg.arch, self.upstream, self.revision)
    }

    fn split_full_name(&self, split: &str) -> String {
        format!("{}-{}-{}-{}", split, self.cfg.arch, self.upstream, self.revision)
    }

    /// Resolve partial deps against the store. In hermetic mode a missing
    /// dependency is fatal; otherwise it is skipped and the host
    /// environment is expected to fill the gap.
    fn resolve_deps(&self, partials: &[String]) -> Result<Vec<PackageId>, Error> {
        let mut present = vec![];
        for dep in partials {
            let partial = PackageId::parse(dep)?;
            if partial.name == self.cfg.pkg {
                continue;
            }
            match self.store.glob_opt(&partial)? {
                Some(_) => present.push(dep.clone()),
                None if self.cfg.hermetic => return Err(Error::NotFound),
                None => warn!(dep, "not in store, falling back to the host"),
            }
        }
        resolve::glob_and_resolve(&self.store, &present, Some(&self.cfg.pkg))
    }

    fn build_dep_partials(&self) -> Vec<String> {
        let mut deps: Vec<String> = self.recipe.deps.clone();
        for builder_dep in resolve::builder_deps(self.recipe.builder.as_ref()) {
            if !deps.iter().any(|d| d == builder_dep) {
                deps.push(builder_dep.to_string());
            }
        }
        deps
    }

    fn input_digest(&self, deps: &[PackageId], runtime: &[PackageId]) -> Result<String, Error> {
        let mut h = Fnv128a::new();
        h.write(self.recipe_text.as_bytes());
        let deps_csv: Vec<String> = deps.iter().map(|d| d.to_string()).collect();
        h.write(deps_csv.join(",").as_bytes());
        for patch in &self.recipe.cherry_picks {
            h.write(&std::fs::read(self.cfg.pkg_dir.join(patch))?);
        }
        let runtime_csv: Vec<String> = runtime.iter().map(|d| d.to_string()).collect();
        h.write(runtime_csv.join(",").as_bytes());
        Ok(h.hex())
    }

    pub fn run(&mut self) -> Result<BuildOutcome, Error> {
        self.recipe.validate()?;
        let full = self.full_name();
        info!(pkg = full, "build starting");

        // FETCH + EXTRACT
        check_cancelled()?;
        let src_dir = self.cfg.work_dir.join("src").join(format!(
            "{}-{}",
            self.cfg.pkg, self.upstream
        ));
        if !self.recipe.source.is_empty() {
            let distfiles = self.cfg.work_dir.join("distfiles");
            let archive = fetch::fetch(&self.recipe.source, &self.recipe.hash, &distfiles)?;
            check_cancelled()?;
            extract::extract(
                &archive,
                &src_dir,
                &self.cfg.pkg_dir,
                &self.recipe.cherry_picks,
                &self.recipe.extra_files,
            )?;
        } else {
            std::fs::create_dir_all(&src_dir)?;
        }

        // DIGEST
        check_cancelled()?;
        let deps = self.resolve_deps(&self.build_dep_partials())?;
        let runtime_decl = self.resolve_deps(&self.recipe.runtime_deps)?;
        let input_digest = self.input_digest(&deps, &runtime_decl)?;
        if let Some(existing) = self.cache_hit(&input_digest)? {
            info!(pkg = full, image = %existing.display(), "cache hit, skipping build");
            return Ok(BuildOutcome::CacheHit);
        }

        // SETUP + STEPS + INSTALL + WRAP + DEPSCAN
        check_cancelled()?;
        let dest_dir = self.cfg.work_dir.join("dest").join(&full);
        if dest_dir.exists() {
            std::fs::remove_dir_all(&dest_dir)?;
        }
        let prefix_root = dest_dir.join("ro").join(&full);
        std::fs::create_dir_all(prefix_root.join("out"))?;
        let build_dir = self.cfg.work_dir.join("build").join(&full);
        std::fs::create_dir_all(&build_dir)?;

        let mut runtime: Vec<PackageId> = runtime_decl;
        let reply = if self.cfg.hermetic {
            self.run_sandboxed(&full, &src_dir, &dest_dir, &build_dir, &deps, &runtime)?
        } else {
            self.run_unsandboxed(&full, &src_dir, &dest_dir, &build_dir, &deps, &runtime)?
        };
        for pkg in reply.runtime_dep_pkgs {
            let id = PackageId::parse(&pkg)?;
            if id.name != self.cfg.pkg && !runtime.iter().any(|r| *r == id) {
                runtime.push(id);
            }
        }

        // SPLITS
        check_cancelled()?;
        let mut outputs: Vec<(String, PathBuf, Vec<String>)> = vec![];
        let mut parent_runtime_extra: Vec<String> = vec![];
        for split in &self.recipe.split_packages {
            let split_full = self.split_full_name(&split.name);
            let split_root = self.cfg.work_dir.join("dest").join(&split_full);
            if split_root.exists() {
                std::fs::remove_dir_all(&split_root)?;
            }
            std::fs::create_dir_all(&split_root)?;
            install::claim(split, &split_full, &prefix_root, &split_root)?;
            parent_runtime_extra.push(split_full.clone());
            outputs.push((split_full, split_root, split.runtime_deps.clone()));
        }
        // the default debug split
        let debug_tree = dest_dir.join("debug");
        if debug_tree.is_dir() && std::fs::read_dir(&debug_tree)?.next().is_some() {
            let debug_full = self.split_full_name(&format!("{}-debug", self.cfg.pkg));
            let debug_root = self.cfg.work_dir.join("dest").join(&debug_full);
            if debug_root.exists() {
                std::fs::remove_dir_all(&debug_root)?;
            }
            std::fs::create_dir_all(&debug_root)?;
            std::fs::rename(&debug_tree, debug_root.join("debug"))?;
            outputs.push((debug_full, debug_root, vec![]));
        }
        for extra in parent_runtime_extra {
            runtime.push(PackageId::parse(&extra)?);
        }

        // ENCODE: primary, splits, source
        check_cancelled()?;
        let mut written = vec![];
        let runtime_strs: Vec<String> = runtime.iter().map(|r| r.to_string()).collect();
        written.push(self.emit(
            &full,
            &prefix_root,
            &runtime_strs,
            &input_digest,
            self.recipe.runtime_unions.clone(),
        )?);
        for (split_full, split_root, split_runtime) in outputs {
            written.push(self.emit(&split_full, &split_root, &split_runtime, &input_digest, vec![])?);
        }
        if !self.recipe.source.is_empty() {
            let src_full = format!(
                "{}-src-{}-{}-{}",
                self.cfg.pkg, self.cfg.arch, self.upstream, self.revision
            );
            written.push(self.emit(&src_full, &src_dir, &[], &input_digest, vec![])?);
        }

        info!(pkg = full, images = written.len(), "build finished");
        Ok(BuildOutcome::Built(written))
    }

    fn cache_hit(&self, input_digest: &str) -> Result<Option<PathBuf>, Error> {
        let full = self.full_name();
        let meta_path = self.cfg.repo.join(format!("{full}.meta.textproto"));
        if !meta_path.exists() {
            return Ok(None);
        }
        let meta = Meta::read_from(&meta_path)?;
        let image = self.cfg.repo.join(format!("{full}.squashfs"));
        if meta.input_digest == input_digest && image.exists() {
            return Ok(Some(image));
        }
        Ok(None)
    }

    fn step_env(&self, full: &str, chrooted: bool, src: &Path, dest: &Path, build: &Path) -> StepEnv {
        if chrooted {
            StepEnv {
                destdir: "/dest".into(),
                prefix: format!("/ro/{full}"),
                sourcedir: format!("/usr/src/{full}"),
                builddir: "/build".into(),
                fullname: full.to_string(),
                jobs: self.cfg.jobs,
            }
        } else {
            StepEnv {
                destdir: dest.display().to_string(),
                prefix: format!("/ro/{full}"),
                sourcedir: src.display().to_string(),
                builddir: build.display().to_string(),
                fullname: full.to_string(),
                jobs: self.cfg.jobs,
            }
        }
    }

    fn substituted_steps(&self, env: &StepEnv) -> Result<Vec<Step>, Error> {
        let store = &self.store;
        let resolve_name = |name: &str| -> Option<String> {
            let partial = PackageId::parse(name).ok()?;
            store.glob_opt(&partial).ok().flatten().map(|id| id.to_string())
        };
        builders::steps(&self.recipe)?
            .iter()
            .map(|s| builders::substitute_step(s, env, &resolve_name))
            .collect()
    }

    fn run_sandboxed(
        &self,
        full: &str,
        src_dir: &Path,
        dest_dir: &Path,
        build_dir: &Path,
        deps: &[PackageId],
        runtime: &[PackageId],
    ) -> Result<JobReply, Error> {
        let env = self.step_env(full, true, src_dir, dest_dir, build_dir);
        let steps = self.substituted_steps(&env)?;
        let glibc = self
            .store
            .glob_opt(&PackageId::parse("glibc")?)?
            .map(|id| id.to_string());

        let chroot_dir = self.cfg.work_dir.join("chroot").join(full);
        if chroot_dir.exists() {
            std::fs::remove_dir_all(&chroot_dir)?;
        }
        let job = Job {
            sandbox: sandbox::SandboxConfig {
                chroot_dir,
                src_dir: src_dir.to_path_buf(),
                dest_dir: dest_dir.to_path_buf(),
                build_dir: build_dir.to_path_buf(),
                full_name: full.to_string(),
                writable_sourcedir: self.recipe.writable_sourcedir,
                repo: self.cfg.repo.display().to_string(),
                glibc,
            },
            steps,
            step_env: env,
            install: self.recipe.install.clone(),
            wrapper_env: WrapperEnv::for_package(full, runtime),
            keep_symbols: self.cfg.pkg == "binutils",
            resolved_deps: deps.iter().map(|d| d.to_string()).collect(),
            debug: self.cfg.debug.clone(),
        };

        let job_file = tempfile::NamedTempFile::new_in(&self.cfg.work_dir)?;
        serde_json::to_writer(job_file.as_file(), &job).map_err(|e| {
            Error::StdIo(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        job_file.as_file().sync_all()?;

        let exe = std::env::current_exe()?;
        debug!(exe = %exe.display(), "re-executing into build namespace");
        let output = Command::new(exe)
            .arg("build")
            .arg("--job")
            .arg(job_file.path())
            .env("DISTRI_BUILD_PROCESS", "1")
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .output()?;
        if !output.status.success() {
            return Err(Error::ToolFailed {
                tool: format!("build of {full}"),
                status: output.status,
            });
        }
        let reply: JobReply = serde_json::from_slice(&output.stdout).map_err(|e| {
            Error::StdIo(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        Ok(reply)
    }

    fn run_unsandboxed(
        &self,
        full: &str,
        src_dir: &Path,
        dest_dir: &Path,
        build_dir: &Path,
        _deps: &[PackageId],
        runtime: &[PackageId],
    ) -> Result<JobReply, Error> {
        let env = self.step_env(full, false, src_dir, dest_dir, build_dir);
        let steps = self.substituted_steps(&env)?;
        for step in &steps {
            run_step(step, Path::new(&env.builddir), &[])?;
        }
        maybe_shell("after-steps", &self.cfg.debug);

        let prefix_root = dest_dir.join("ro").join(full);
        install::apply(&self.recipe.install, &prefix_root, &self.cfg.pkg_dir)?;
        maybe_shell("after-install", &self.cfg.debug);

        let wrapper_env = WrapperEnv::for_package(full, runtime);
        wrapper::generate(&prefix_root, full, &wrapper_env, None)?;
        maybe_shell("after-wrapper", &self.cfg.debug);

        // host ldd output never resolves into /ro, so this only collects
        // deps when running against a real overlay; debug info is kept
        let pkgs = elf::scan(&prefix_root, &dest_dir.join("debug"), true)?;
        maybe_shell("after-elf", &self.cfg.debug);
        Ok(JobReply { runtime_dep_pkgs: pkgs })
    }

    /// Write one output image: meta first, then the image under a
    /// temporary name, then an atomic rename into the store.
    fn emit(
        &self,
        full: &str,
        tree: &Path,
        runtime_deps: &[String],
        input_digest: &str,
        runtime_unions: Vec<RuntimeUnion>,
    ) -> Result<PathBuf, Error> {
        std::fs::create_dir_all(&self.cfg.repo)?;
        let meta = Meta {
            version: format!("{}-{}", self.upstream, self.revision),
            source_pkg: self.cfg.pkg.clone(),
            input_digest: input_digest.to_string(),
            runtime_deps: runtime_deps.to_vec(),
            runtime_unions,
        };
        meta.write_to(&self.cfg.repo.join(format!("{full}.meta.textproto")))?;

        let image = self.cfg.repo.join(format!("{full}.squashfs"));
        encode_image(tree, &image)?;

        // refresh the partial-identifier shortcut
        let id = PackageId::parse(full)?;
        if let (Some(arch), true) = (&id.arch, id.is_fully_qualified()) {
            let link = self.cfg.repo.join(format!("{}-{arch}.meta.textproto", id.name));
            let _ = std::fs::remove_file(&link);
            std::os::unix::fs::symlink(format!("{full}.meta.textproto"), &link)?;
        }

        let mut log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.cfg.work_dir.join("artifacts.log"))?;
        writeln!(log, "{}", image.display())?;
        info!(image = %image.display(), "wrote image");
        Ok(image)
    }
}

/// Run one build step, failing on a non-zero exit.
pub fn run_step(step: &Step, cwd: &Path, extra_env: &[(String, String)]) -> Result<(), Error> {
    let Some((program, args)) = step.argv.split_first() else {
        return Err(Error::Recipe("empty build step".into()));
    };
    info!(argv = ?step.argv, "running step");
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(cwd);
    for (k, v) in extra_env.iter().chain(step.env.iter()) {
        cmd.env(k, v);
    }
    let status = cmd.status()?;
    if !status.success() {
        return Err(Error::ToolFailed { tool: program.clone(), status });
    }
    Ok(())
}

/// Spawn an interactive shell when the debug hook matches this stage.
pub fn maybe_shell(stage: &str, want: &Option<String>) {
    if want.as_deref() != Some(stage) {
        return;
    }
    eprintln!("debug shell ({stage}); exit to continue");
    let _ = Command::new("bash").arg("-i").status();
}

/// Entry point of the re-executed child: set up the namespace, run the
/// sandboxed stages, report runtime deps as JSON on stdout.
pub fn run_job(job_path: &Path) -> Result<(), Error> {
    let job: Job = serde_json::from_reader(File::open(job_path)?).map_err(|e| {
        Error::StdIo(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })?;

    sandbox::enter_namespace()?;
    let _guard = sandbox::setup(&job.sandbox)?;
    maybe_shell("after-loopmount", &job.debug);

    let base = sandbox::base_env(&job.sandbox.full_name, job.step_env.jobs);
    for step in &job.steps {
        let Some((program, args)) = step.argv.split_first() else {
            return Err(Error::Recipe("empty build step".into()));
        };
        info!(argv = ?step.argv, "running step");
        let mut cmd = Command::new(program);
        // build tool output must not corrupt the JSON reply pipe
        let stderr_copy = unsafe { Stdio::from_raw_fd(libc::dup(2)) };
        cmd.args(args).current_dir("/build").stdout(stderr_copy);
        for (k, v) in base.iter().chain(step.env.iter()) {
            cmd.env(k, v);
        }
        let status = cmd.status()?;
        if !status.success() {
            return Err(Error::ToolFailed { tool: program.clone(), status });
        }
    }
    maybe_shell("after-steps", &job.debug);

    let prefix_root = PathBuf::from(format!("/dest/ro/{}", job.sandbox.full_name));
    let src_root = Path::new("/usr/src").join(&job.sandbox.full_name);
    install::apply(&job.install, &prefix_root, &src_root)?;
    maybe_shell("after-install", &job.debug);

    wrapper::generate(&prefix_root, &job.sandbox.full_name, &job.wrapper_env, Some("gcc"))?;
    maybe_shell("after-wrapper", &job.debug);

    let mut reply = JobReply {
        runtime_dep_pkgs: elf::scan(&prefix_root, Path::new("/dest/debug"), job.keep_symbols)?,
    };
    maybe_shell("after-elf", &job.debug);

    // pkg-config Requires: promote matching build deps to runtime deps
    for pc in find_pc_files(&prefix_root)? {
        let content = std::fs::read_to_string(&pc)?;
        for module in resolve::pkg_config_requires(&content) {
            for dep in &job.resolved_deps {
                let candidate = format!("/ro/{dep}/out/lib/pkgconfig/{module}.pc");
                if Path::new(&candidate).exists()
                    && !reply.runtime_dep_pkgs.contains(dep)
                {
                    reply.runtime_dep_pkgs.push(dep.clone());
                }
            }
        }
    }
    maybe_shell("after-libfarm", &job.debug);

    println!("{}", serde_json::to_string(&reply).map_err(|e| {
        Error::StdIo(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })?);
    Ok(())
}

fn find_pc_files(root: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut out = vec![];
    for entry in walkdir::WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file()
            && entry.path().extension().map(|e| e == "pc").unwrap_or(false)
        {
            out.push(entry.path().to_path_buf());
        }
    }
    out.sort();
    Ok(out)
}

/// Encode `tree` as an image at `dest`: write to a temp file in the same
/// directory, then atomically rename, so readers never observe a
/// partially written image.
pub fn encode_image(tree: &Path, dest: &Path) -> Result<u64, Error> {
    let dir = dest.parent().unwrap_or(Path::new("."));
    let tmp = tempfile::NamedTempFile::new_in(dir)?;
    let mtime = mtime_of(tree)?;
    let size = {
        let mut writer = Writer::new(tmp.as_file(), mtime)?;
        let mut root = writer.root(mtime);
        write_tree(&mut root, tree)?;
        root.flush()?;
        writer.finish()?
    };
    tmp.persist(dest).map_err(|e| Error::StdIo(e.error))?;
    Ok(size)
}

fn mtime_of(path: &Path) -> Result<u32, Error> {
    let meta = std::fs::symlink_metadata(path)?;
    let mtime = meta
        .modified()?
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Ok(u32::try_from(mtime).unwrap_or(u32::MAX))
}

fn write_tree<W: Write + Seek>(dir: &mut Directory<'_, W>, path: &Path) -> Result<(), Error> {
    let mut entries: Vec<_> = std::fs::read_dir(path)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            warn!(path = %entry.path().display(), "skipping non-UTF-8 name");
            continue;
        };
        let meta = std::fs::symlink_metadata(entry.path())?;
        let mtime = mtime_of(&entry.path())?;
        if meta.file_type().is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            let target = target.to_str().ok_or(Error::NotFound)?.to_string();
            dir.symlink(&target, name, mtime, 0o777)?;
        } else if meta.is_dir() {
            let mut sub = dir.directory(name, mtime);
            write_tree(&mut sub, &entry.path())?;
            sub.flush()?;
        } else {
            let mode = {
                use std::os::unix::fs::PermissionsExt;
                (meta.permissions().mode() & 0o7777) as u16
            };
            let mut fw = dir.file(name, mtime, mode, &[])?;
            let mut src = File::open(entry.path())?;
            std::io::copy(&mut src, &mut fw)?;
            fw.finish()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::squashfs::Reader;

    #[test]
    fn test_encode_image_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("tree");
        std::fs::create_dir_all(tree.join("out/bin")).unwrap();
        std::fs::write(tree.join("out/bin/hello"), b"#!/bin/sh\necho hi\n").unwrap();
        std::os::unix::fs::symlink("out/bin/hello", tree.join("hello")).unwrap();

        let image = dir.path().join("x.squashfs");
        let size = encode_image(&tree, &image).unwrap();
        assert_eq!(size % 4096, 0);

        let rdr = Reader::new(File::open(&image).unwrap()).unwrap();
        let ino = rdr.lookup_path("out/bin/hello").unwrap();
        assert_eq!(rdr.stat(ino).unwrap().size, 18);
        let link = rdr.lookup_path("hello").unwrap();
        assert_eq!(rdr.readlink(link).unwrap().to_str().unwrap(), "out/bin/hello");
    }
}
