use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::error::{Error, Result};

/// Run an external table tool to completion, bounded by `timeout`.
///
/// A non-zero exit status is an error carrying the tool's stderr.
pub(crate) async fn run(program: &'static str, args: &[String], timeout: Duration) -> Result<()> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();
    let output = tokio::time::timeout(timeout, output)
        .await
        .map_err(|_| Error::CommandTimeout { program, timeout })??;
    if !output.status.success() {
        return Err(Error::CommandFailed {
            program,
            args: args.join(" "),
            status: output.status.to_string(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    log::debug!("{program} {}", args.join(" "));
    Ok(())
}

/// Like [`run`], but maps exit code 1 to `Ok(false)`.
///
/// Used for checks such as `iptables -C`, where 1 means "absent". Any other
/// failure (2 for bad parameters, 4 for a held xtables lock) is an error.
pub(crate) async fn check(
    program: &'static str,
    args: &[String],
    timeout: Duration,
) -> Result<bool> {
    match run(program, args, timeout).await {
        Ok(()) => Ok(true),
        Err(Error::CommandFailed { code: Some(1), .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_program_is_io_error() {
        let rs = run(
            "udp-funnel-no-such-binary",
            &["-L".to_string()],
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(rs, Err(Error::Io(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_status_is_reported() {
        assert!(run("true", &[], Duration::from_secs(5)).await.is_ok());
        let rs = run("false", &[], Duration::from_secs(5)).await;
        assert!(matches!(rs, Err(Error::CommandFailed { program: "false", .. })));
        assert!(!check("false", &[], Duration::from_secs(5)).await.unwrap());
        assert!(check("true", &[], Duration::from_secs(5)).await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn check_fails_on_codes_other_than_absent() {
        for code in [2, 4] {
            let args = ["-c".to_string(), format!("exit {code}")];
            let rs = check("sh", &args, Duration::from_secs(5)).await;
            assert!(
                matches!(rs, Err(Error::CommandFailed { code: Some(c), .. }) if c == code),
                "exit {code}: {rs:?}"
            );
        }
        let absent = ["-c".to_string(), "exit 1".to_string()];
        assert!(!check("sh", &absent, Duration::from_secs(5)).await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_command_times_out() {
        let rs = run("sleep", &["5".to_string()], Duration::from_millis(50)).await;
        assert!(matches!(rs, Err(Error::CommandTimeout { program: "sleep", .. })));
    }
}
