//! Secure deletion of a key record.
//!
//! Three independent steps run in order and every one of them runs even if
//! an earlier one failed:
//!
//! 1. delete the wrapping key from the keymaster,
//! 2. overwrite the sensitive files in place,
//! 3. remove the directory recursively.

use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use tracing::{debug, error, warn};

use crate::config::{SecureDeleteConfig, ToolCommand};
use crate::error::{Error, Result};
use crate::keymaster::Keymaster;
use crate::layout::{FILE_KEYMASTER_KEY_BLOB, KeyDir, SENSITIVE_FILES};

/// Outcome of each destroy step.
///
/// Anything short of [`DestroyReport::is_complete`] means cleanup was partial
/// and deserves a look. It does not mean the key is recoverable: once the
/// directory is gone the record cannot be reassembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestroyReport {
    pub keymaster_key_deleted: bool,
    pub secure_overwrite: bool,
    pub directory_removed: bool,
}

impl DestroyReport {
    pub fn is_complete(&self) -> bool {
        self.keymaster_key_deleted && self.secure_overwrite && self.directory_removed
    }
}

/// Destroys the record in `dir`, continuing through failures.
pub fn destroy_key(
    keymaster: Option<&dyn Keymaster>,
    dir: &KeyDir,
    tools: &SecureDeleteConfig,
) -> DestroyReport {
    let report = DestroyReport {
        keymaster_key_deleted: step("keymaster key deletion", || {
            delete_keymaster_key(keymaster, dir)
        }),
        secure_overwrite: step("secdiscard", || run_secdiscard(dir, &tools.secdiscard)),
        directory_removed: step("recursive delete", || recursive_delete(dir, &tools.rm)),
    };
    if !report.is_complete() {
        warn!("Key destroy incomplete for {}: {:?}", dir.path().display(), report);
    }
    report
}

fn step(name: &str, f: impl FnOnce() -> Result<()>) -> bool {
    match f() {
        Ok(()) => true,
        Err(e) => {
            error!("{} failed: {}", name, e);
            false
        }
    }
}

/// Records stored without a keymaster have no blob; there is nothing to
/// delete and the step succeeds. A missing directory fails the step so a
/// wrong path shows up as incomplete cleanup.
fn delete_keymaster_key(keymaster: Option<&dyn Keymaster>, dir: &KeyDir) -> Result<()> {
    if !dir.path().is_dir() {
        return Err(Error::io(dir.path(), io::ErrorKind::NotFound.into()));
    }
    if !dir.has(FILE_KEYMASTER_KEY_BLOB) {
        debug!("No keymaster key blob in {}", dir.path().display());
        return Ok(());
    }
    let key_blob = dir.read(FILE_KEYMASTER_KEY_BLOB)?;
    let keymaster = keymaster.ok_or(Error::KeymasterUnavailable)?;
    keymaster.delete_key(&key_blob)?;
    Ok(())
}

/// Overwrites whichever sensitive files exist.
fn run_secdiscard(dir: &KeyDir, tool: &ToolCommand) -> Result<()> {
    let targets: Vec<PathBuf> = SENSITIVE_FILES
        .iter()
        .filter(|name| dir.has(name))
        .map(|name| dir.file(name))
        .collect();
    if targets.is_empty() {
        debug!("No sensitive files left in {}", dir.path().display());
        return Ok(());
    }
    run_tool(tool, &targets)
}

fn recursive_delete(dir: &KeyDir, tool: &ToolCommand) -> Result<()> {
    run_tool(tool, &[dir.path().to_path_buf()])?;
    if dir.path().exists() {
        return Err(Error::Command {
            program: tool.program.display().to_string(),
            reason: format!("{} still exists", dir.path().display()),
        });
    }
    Ok(())
}

/// Runs `tool` with `paths` appended to its arguments and waits for it.
fn run_tool(tool: &ToolCommand, paths: &[PathBuf]) -> Result<()> {
    let program = tool.program.display().to_string();
    debug!("Running {} {:?} {:?}", program, tool.args, paths);
    let status = Command::new(&tool.program)
        .args(&tool.args)
        .args(paths)
        .stdin(Stdio::null())
        .status()
        .map_err(|e| Error::Command {
            program: program.clone(),
            reason: e.to_string(),
        })?;
    if !status.success() {
        return Err(Error::Command {
            program,
            reason: status.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypt::MasterKey;
    use crate::keymaster::soft::SoftKeymaster;
    use crate::keymaster::{AuthorizationSet, BlockMode, KeyParameter, PaddingMode};
    use crate::layout::{FILE_ENCRYPTED_KEY, FILE_SECDISCARDABLE, FILE_VERSION};
    use tempfile::tempdir;
    use tracing_test::traced_test;

    fn tools(secdiscard: &str) -> SecureDeleteConfig {
        SecureDeleteConfig {
            secdiscard: ToolCommand::new(secdiscard, &[]),
            rm: ToolCommand::new("rm", &["-rf", "--"]),
        }
    }

    fn record(root: &std::path::Path) -> KeyDir {
        let dir = KeyDir::new(root.join("key"));
        dir.create().unwrap();
        dir.write(FILE_VERSION, b"1").unwrap();
        dir.write(FILE_SECDISCARDABLE, &[0xAA; 64]).unwrap();
        dir.write(FILE_ENCRYPTED_KEY, &[0xBB; 60]).unwrap();
        dir
    }

    #[test]
    fn software_record_destroys_completely() {
        let root = tempdir().unwrap();
        let dir = record(root.path());
        let report = destroy_key(None, &dir, &tools("true"));
        assert!(report.is_complete(), "{report:?}");
        assert!(!dir.path().exists());
    }

    #[test]
    fn keymaster_key_is_deleted() {
        let km = SoftKeymaster::new(MasterKey::from_slice(&[2u8; 32]).unwrap());
        let blob = km
            .generate_key(
                &AuthorizationSet::new()
                    .aes_encryption_key(256)
                    .with(KeyParameter::BlockMode(BlockMode::Gcm))
                    .with(KeyParameter::MinMacLength(128))
                    .with(KeyParameter::Padding(PaddingMode::None))
                    .with(KeyParameter::NoAuthRequired),
            )
            .unwrap();
        let root = tempdir().unwrap();
        let dir = record(root.path());
        dir.write(FILE_KEYMASTER_KEY_BLOB, &blob).unwrap();

        let report = destroy_key(Some(&km), &dir, &tools("true"));
        assert!(report.is_complete(), "{report:?}");
        assert!(km.delete_key(&blob).is_err());
    }

    #[test]
    #[traced_test]
    fn failures_do_not_stop_later_steps() {
        let km = SoftKeymaster::new(MasterKey::from_slice(&[2u8; 32]).unwrap());
        let root = tempdir().unwrap();
        let dir = record(root.path());
        dir.write(FILE_KEYMASTER_KEY_BLOB, b"corrupt").unwrap();

        let report = destroy_key(Some(&km), &dir, &tools("false"));
        assert_eq!(
            report,
            DestroyReport {
                keymaster_key_deleted: false,
                secure_overwrite: false,
                directory_removed: true,
            }
        );
        assert!(!report.is_complete());
        assert!(!dir.path().exists());
        assert!(logs_contain("secdiscard failed"));
    }

    #[test]
    fn blob_without_keymaster_is_a_failed_step() {
        let root = tempdir().unwrap();
        let dir = record(root.path());
        dir.write(FILE_KEYMASTER_KEY_BLOB, b"blob").unwrap();
        let report = destroy_key(None, &dir, &tools("true"));
        assert!(!report.keymaster_key_deleted);
        assert!(report.directory_removed);
    }

    #[test]
    #[traced_test]
    fn missing_directory_is_incomplete() {
        let root = tempdir().unwrap();
        let dir = KeyDir::new(root.path().join("never-created"));
        let report = destroy_key(None, &dir, &tools("true"));
        assert!(!report.keymaster_key_deleted);
        assert!(!report.is_complete());
        assert!(logs_contain("keymaster key deletion failed"));
    }

    #[test]
    fn missing_tool_is_reported() {
        let root = tempdir().unwrap();
        let dir = record(root.path());
        let report = destroy_key(None, &dir, &tools("/nonexistent/secdiscard"));
        assert!(!report.secure_overwrite);
        assert!(report.directory_removed);
    }
}
