//! Telling whether a child process is blocked reading its stdin.
//!
//! On Linux every thread of the child (and of its descendants) exposes the
//! system call it is sleeping in through `/proc/<pid>/task/<tid>/syscall`.
//! A thread parked in `read(0, ..)` is waiting for console input.

use once_cell::sync::Lazy;

/// `read`-family system calls whose first argument is a file descriptor.
#[cfg(target_arch = "x86_64")]
const READ_SYSCALLS: &[u64] = &[0, 17, 19];
#[cfg(target_arch = "aarch64")]
const READ_SYSCALLS: &[u64] = &[63, 65, 67];
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
const READ_SYSCALLS: &[u64] = &[];

static OBSERVABLE: Lazy<bool> = Lazy::new(|| {
    cfg!(target_os = "linux")
        && !READ_SYSCALLS.is_empty()
        && std::fs::read_to_string("/proc/self/syscall").is_ok()
});

/// Whether this host exposes the system call a process is blocked in.
pub fn stdin_observable() -> bool {
    *OBSERVABLE
}

/// Whether `pid` or one of its descendants is blocked reading fd 0.
/// Always false on hosts where [`stdin_observable`] is false.
pub fn blocked_on_stdin(pid: u32) -> bool {
    if !stdin_observable() {
        return false;
    }
    let mut pending = vec![pid];
    while let Some(pid) = pending.pop() {
        let Ok(tasks) = std::fs::read_dir(format!("/proc/{}/task", pid)) else {
            continue;
        };
        for task in tasks.flatten() {
            let path = task.path();
            if let Ok(line) = std::fs::read_to_string(path.join("syscall")) {
                if reads_stdin(&line, READ_SYSCALLS) {
                    return true;
                }
            }
            if let Ok(children) = std::fs::read_to_string(path.join("children")) {
                pending.extend(children.split_whitespace().filter_map(|c| c.parse::<u32>().ok()));
            }
        }
    }
    false
}

/// Parse one `syscall` line: `<nr> <arg0> ...`, `running`, or `-1 <sp> <pc>`.
fn reads_stdin(line: &str, read_calls: &[u64]) -> bool {
    let mut fields = line.split_whitespace();
    let Some(nr) = fields.next().and_then(|f| f.parse::<u64>().ok()) else {
        return false;
    };
    let fd = fields
        .next()
        .and_then(|f| u64::from_str_radix(f.trim_start_matches("0x"), 16).ok());
    read_calls.contains(&nr) && fd == Some(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_syscall_lines() {
        let reads = &[0, 19];
        assert!(reads_stdin("0 0x0 0x7ffd3c1e 0x1 0x0 0x0 0x0 0x7ffd 0x7f12", reads));
        assert!(!reads_stdin("0 0x3 0x7ffd3c1e 0x1000 0x0 0x0 0x0 0x7ffd 0x7f12", reads));
        assert!(!reads_stdin("61 0xffffffffffffffff 0x7ffd 0x0 0x0 0x0 0x0 0x7ffd 0x7f12", reads));
        assert!(!reads_stdin("running", reads));
        assert!(!reads_stdin("-1 0x7ffd 0x7f12", reads));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_detects_shell_waiting_on_read() {
        use std::process::Stdio;
        use std::time::Duration;

        if !stdin_observable() {
            return;
        }
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("read x")
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        let mut waiting = false;
        for _ in 0..200 {
            waiting = blocked_on_stdin(pid);
            if waiting {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        child.kill().await.unwrap();
        assert!(waiting);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_busy_process_is_not_waiting() {
        use std::process::Stdio;
        use std::time::Duration;

        let mut child = tokio::process::Command::new("sleep")
            .arg("5")
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked_on_stdin(child.id().unwrap()));
        child.kill().await.unwrap();
    }
}
