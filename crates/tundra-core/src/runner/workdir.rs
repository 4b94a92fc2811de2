//! Working directory materialization and generated-file emission.
//!
//! Units without a `terraform.source` run in place. Units with a local source
//! are copied into the per-run cache directory, honoring the
//! `include_in_copy` / `exclude_from_copy` glob filters. Generated files carry
//! a signature comment so `overwrite_terragrunt` only ever replaces files the
//! orchestrator wrote itself.

use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::model::{GenerateBlock, IfExists, RemoteStateBlock, UnitConfig};
use crate::error::{display_relative, Error, Result};
use crate::options::{RunOptions, CACHE_DIR};

/// Never copied into a materialized working directory.
const DEFAULT_COPY_EXCLUDES: &[&str] = &[".git", ".terraform", CACHE_DIR];

const SIGNATURE_MARKER: &str = "Generated by tundra. Sig:";

/// Where a unit's engine invocation runs. In-place unless the unit declares a
/// source to materialize; `download_dir` overrides the cache location.
pub fn work_dir_for(options: &RunOptions, unit_dir: &Path, cfg: &UnitConfig) -> PathBuf {
    if cfg.terraform.source.is_none() {
        return unit_dir.to_path_buf();
    }
    if let Some(download) = &cfg.download_dir {
        if download.is_absolute() {
            return download.clone();
        }
        return unit_dir.join(download);
    }
    let rel = display_relative(unit_dir, &options.working_dir);
    let mut h = Sha256::new();
    h.update(unit_dir.as_os_str().as_encoded_bytes());
    let digest = format!("{:x}", h.finalize());
    options
        .working_dir
        .join(CACHE_DIR)
        .join(&digest[..12])
        .join(rel)
}

fn copy_filters(cfg: &UnitConfig) -> Result<(Option<GlobSet>, GlobSet)> {
    let include = match &cfg.terraform.include_in_copy {
        Some(patterns) => {
            let mut builder = GlobSetBuilder::new();
            for p in patterns {
                builder.add(
                    Glob::new(p).map_err(|e| Error::Other(format!("include_in_copy {p:?}: {e}")))?,
                );
            }
            Some(
                builder
                    .build()
                    .map_err(|e| Error::Other(format!("include_in_copy: {e}")))?,
            )
        }
        None => None,
    };

    let mut builder = GlobSetBuilder::new();
    for p in DEFAULT_COPY_EXCLUDES {
        builder.add(Glob::new(p).map_err(|e| Error::Other(format!("copy filter {p:?}: {e}")))?);
    }
    if let Some(patterns) = &cfg.terraform.exclude_from_copy {
        for p in patterns {
            builder.add(
                Glob::new(p).map_err(|e| Error::Other(format!("exclude_from_copy {p:?}: {e}")))?,
            );
        }
    }
    let exclude = builder
        .build()
        .map_err(|e| Error::Other(format!("exclude_from_copy: {e}")))?;
    Ok((include, exclude))
}

/// Copy the unit's source tree into its working directory. Lock files follow
/// `copy_terraform_lock_file`.
pub fn materialize(options: &RunOptions, unit_dir: &Path, cfg: &UnitConfig) -> Result<PathBuf> {
    let work_dir = work_dir_for(options, unit_dir, cfg);
    if work_dir == unit_dir {
        return Ok(work_dir);
    }
    let Some(source) = &cfg.terraform.source else {
        return Ok(work_dir);
    };

    let source_dir = if Path::new(source).is_absolute() {
        PathBuf::from(source)
    } else {
        unit_dir.join(source)
    };
    let source_dir = source_dir
        .canonicalize()
        .map_err(|e| Error::Other(format!("source {source:?}: {e}")))?;

    std::fs::create_dir_all(&work_dir)?;
    let (include, exclude) = copy_filters(cfg)?;
    copy_tree(&source_dir, &work_dir, &source_dir, &include, &exclude, cfg)?;

    // The unit's own files overlay the module source.
    copy_tree(unit_dir, &work_dir, unit_dir, &include, &exclude, cfg)?;
    debug!(unit = %unit_dir.display(), work_dir = %work_dir.display(), "materialized working directory");
    Ok(work_dir)
}

fn copy_tree(
    dir: &Path,
    dest_root: &Path,
    rel_root: &Path,
    include: &Option<GlobSet>,
    exclude: &GlobSet,
    cfg: &UnitConfig,
) -> Result<()> {
    for entry in std::fs::read_dir(dir).map_err(|e| Error::DirWalk {
        path: dir.to_path_buf(),
        source: e,
    })? {
        let entry = entry.map_err(|e| Error::DirWalk {
            path: dir.to_path_buf(),
            source: e,
        })?;
        let path = entry.path();
        let rel = path
            .strip_prefix(rel_root)
            .expect("walk stays under the root")
            .to_path_buf();
        let rel_str = rel.to_string_lossy();

        if exclude.is_match(rel_str.as_ref()) {
            continue;
        }
        let is_lock = rel_str == ".terraform.lock.hcl";
        if is_lock && !cfg.terraform.copy_terraform_lock_file {
            continue;
        }

        if entry.file_type()?.is_dir() {
            copy_tree(&path, dest_root, rel_root, include, exclude, cfg)?;
        } else {
            // include_in_copy narrows files only; directories are always
            // traversed so nested matches can land.
            if let Some(include) = include {
                if !include.is_match(rel_str.as_ref()) && !is_always_copied(&rel_str) && !is_lock {
                    continue;
                }
            }
            let dest = dest_root.join(&rel);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&path, &dest)?;
        }
    }
    Ok(())
}

fn is_always_copied(rel: &str) -> bool {
    rel.ends_with(".tf") || rel.ends_with(".tf.json") || rel == crate::config::model::CONFIG_FILENAME
}

fn signature_for(path: &str) -> String {
    let mut h = Sha256::new();
    h.update(path.as_bytes());
    format!("{:x}", h.finalize())
}

fn render_contents(block: &GenerateBlock) -> String {
    if block.disable_signature {
        return block.contents.clone();
    }
    format!(
        "{}{} {}\n{}",
        block.comment_prefix,
        SIGNATURE_MARKER,
        signature_for(&block.path),
        block.contents
    )
}

fn carries_signature(contents: &str) -> bool {
    contents
        .lines()
        .next()
        .map(|line| line.contains(SIGNATURE_MARKER))
        .unwrap_or(false)
}

/// Emit one `generate` block into the working directory per its collision
/// policy.
pub fn write_generated(work_dir: &Path, block: &GenerateBlock) -> Result<()> {
    if block.disable {
        return Ok(());
    }
    let dest = work_dir.join(&block.path);
    if dest.exists() {
        match block.if_exists {
            IfExists::Error => {
                return Err(Error::Other(format!(
                    "generate {:?}: {} already exists",
                    block.name,
                    dest.display()
                )))
            }
            IfExists::Skip => return Ok(()),
            IfExists::Overwrite => {}
            IfExists::OverwriteTerragrunt => {
                let existing = std::fs::read_to_string(&dest)?;
                if !carries_signature(&existing) {
                    return Err(Error::Other(format!(
                        "generate {:?}: {} exists and was not generated by this orchestrator",
                        block.name,
                        dest.display()
                    )));
                }
            }
        }
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&dest, render_contents(block))?;
    Ok(())
}

/// Emit the backend stub for a `remote_state` block that asked for one.
pub fn write_remote_state(work_dir: &Path, rs: &RemoteStateBlock) -> Result<()> {
    let Some(generate) = &rs.generate else {
        return Ok(());
    };
    let mut body = String::new();
    body.push_str("terraform {\n");
    body.push_str(&format!("  backend \"{}\" {{\n", rs.backend));
    for (key, value) in &rs.config {
        let rendered = match value {
            serde_json::Value::String(s) => format!("{s:?}"),
            other => other.to_string(),
        };
        body.push_str(&format!("    {key} = {rendered}\n"));
    }
    body.push_str("  }\n}\n");

    let block = GenerateBlock {
        name: "remote_state".to_string(),
        path: generate.path.clone(),
        contents: body,
        if_exists: generate.if_exists,
        comment_prefix: "# ".to_string(),
        disable_signature: false,
        disable: false,
    };
    write_generated(work_dir, &block)
}
