//! Installs the user program a task ships with and runs it as a child process.

use std::ffi::OsStr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::{Error, Program, Result};
use tokio::process::Command;
use tracing::{debug, warn};

const PROGRAM_MODE: u32 = 0o744;
// ETXTBSY: otro hilo todavía tiene abierto para escritura el archivo recién creado.
const TEXT_FILE_BUSY: i32 = 26;
const SPAWN_ATTEMPTS: u32 = 5;

pub fn validate(program: Option<&Program>) -> Result<&Program> {
    let program = program.ok_or_else(|| Error::invalid_argument("the task carries no program"))?;
    if program.name.trim().is_empty() {
        return Err(Error::invalid_argument("the program name is empty"));
    }
    if program.content.is_empty() {
        return Err(Error::invalid_argument(format!("program {} is empty", program.name)));
    }
    Ok(program)
}

/// Writes `program` under `dir` (keeping only the last path component of its
/// name) and marks it executable.
pub async fn install(dir: &Path, program: &Program) -> Result<PathBuf> {
    let file_name = Path::new(&program.name)
        .file_name()
        .ok_or_else(|| Error::invalid_argument(format!("invalid program name {}", program.name)))?;
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(file_name);
    tokio::fs::write(&path, &program.content).await?;
    tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(PROGRAM_MODE)).await?;
    debug!("installed program {} at {}", program.name, path.display());
    Ok(path)
}

/// Runs `path` to completion. A non-zero exit is an internal error carrying
/// the program's stderr.
pub async fn run<I, K, V>(path: &Path, args: &[String], envs: I) -> Result<()>
where
    I: IntoIterator<Item = (K, V)> + Clone,
    K: AsRef<OsStr>,
    V: AsRef<OsStr>,
{
    let mut attempt = 1;
    let child = loop {
        let spawned = Command::new(path)
            .args(args)
            .envs(envs.clone())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        match spawned {
            Ok(child) => break child,
            Err(e) if e.raw_os_error() == Some(TEXT_FILE_BUSY) && attempt < SPAWN_ATTEMPTS => {
                warn!("{} is busy, retrying spawn", path.display());
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(e) => {
                return Err(Error::internal(format!("can't start {}: {}", path.display(), e)));
            }
        }
    };

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::internal(format!(
            "{} {:?} exited with {}: {}",
            path.display(),
            args,
            output.status,
            stderr.trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Code;

    fn temp_dir(sub: &str) -> PathBuf {
        std::env::temp_dir().join(format!("program_test_{}_{}", sub, uuid::Uuid::new_v4()))
    }

    fn script(body: &str) -> Program {
        Program {
            name: "/apps/prog.sh".to_string(),
            content: format!("#!/bin/sh\n{body}\n").into_bytes(),
        }
    }

    #[test]
    fn missing_or_empty_programs_are_rejected() {
        assert_eq!(validate(None).unwrap_err().code(), Code::InvalidArgument);
        let empty = Program { name: "p".into(), content: vec![] };
        assert_eq!(validate(Some(&empty)).unwrap_err().code(), Code::InvalidArgument);
        let unnamed = Program { name: " ".into(), content: vec![1] };
        assert_eq!(validate(Some(&unnamed)).unwrap_err().code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn installs_under_the_program_dir() {
        let dir = temp_dir("install");
        let path = install(&dir, &script("exit 0")).await.unwrap();
        assert_eq!(path, dir.join("prog.sh"));
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o744);
    }

    #[tokio::test]
    async fn passes_args_and_env() {
        let dir = temp_dir("args");
        let out = dir.join("out.txt");
        let prog = script(r#"printf '%s|%s|%s' "$1" "$2" "$TARGET" > "$OUT""#);
        let path = install(&dir, &prog).await.unwrap();
        let envs = vec![
            ("TARGET".to_string(), "sock".to_string()),
            ("OUT".to_string(), out.display().to_string()),
        ];
        run(&path, &["3".to_string(), "a b".to_string()], envs).await.unwrap();
        assert_eq!(std::fs::read_to_string(out).unwrap(), "3|a b|sock");
    }

    #[tokio::test]
    async fn non_zero_exit_is_internal() {
        let dir = temp_dir("fail");
        let path = install(&dir, &script("echo boom >&2; exit 3")).await.unwrap();
        let err = run(&path, &[], Vec::<(String, String)>::new()).await.unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert!(err.to_string().contains("boom"));
    }
}
